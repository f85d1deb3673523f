//! Error types for pipeline orchestration.

use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Machine-readable kind of a [`ConfigError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigErrorKind {
    UnrecognizedField,
    WrongType,
    MissingRequiredField,
    MalformedField,
    ConflictingFields,
    MissingRequiredExclusiveFields,
}

/// A configuration problem, always detected before any process is launched.
///
/// `class` names the configuration object (`Input`, `PipelineConfig`, ...)
/// and `field` the offending field within it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{class} contains unrecognized field: {field}")]
    UnrecognizedField { class: &'static str, field: String },

    #[error("In {class}, {field} field requires {expected}")]
    WrongType {
        class: &'static str,
        field: String,
        expected: String,
    },

    #[error("{class} is missing a required field: {field}")]
    MissingRequiredField { class: &'static str, field: String },

    #[error("In {class}, {field} field is malformed: {reason}")]
    MalformedField {
        class: &'static str,
        field: String,
        reason: String,
    },

    #[error("In {class}, these fields are conflicting: {field} and {other}; use only one of them")]
    ConflictingFields {
        class: &'static str,
        field: String,
        other: String,
    },

    #[error("{class} is missing a required field; use exactly one of {field} or {other}")]
    MissingRequiredExclusiveFields {
        class: &'static str,
        field: String,
        other: String,
    },
}

impl ConfigError {
    pub fn unrecognized(class: &'static str, field: impl Into<String>) -> Self {
        Self::UnrecognizedField {
            class,
            field: field.into(),
        }
    }

    pub fn wrong_type(
        class: &'static str,
        field: impl Into<String>,
        expected: impl Into<String>,
    ) -> Self {
        Self::WrongType {
            class,
            field: field.into(),
            expected: expected.into(),
        }
    }

    pub fn missing(class: &'static str, field: impl Into<String>) -> Self {
        Self::MissingRequiredField {
            class,
            field: field.into(),
        }
    }

    pub fn malformed(
        class: &'static str,
        field: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::MalformedField {
            class,
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn conflicting(
        class: &'static str,
        field: impl Into<String>,
        other: impl Into<String>,
    ) -> Self {
        Self::ConflictingFields {
            class,
            field: field.into(),
            other: other.into(),
        }
    }

    pub fn missing_exclusive(
        class: &'static str,
        field: impl Into<String>,
        other: impl Into<String>,
    ) -> Self {
        Self::MissingRequiredExclusiveFields {
            class,
            field: field.into(),
            other: other.into(),
        }
    }

    pub fn kind(&self) -> ConfigErrorKind {
        match self {
            Self::UnrecognizedField { .. } => ConfigErrorKind::UnrecognizedField,
            Self::WrongType { .. } => ConfigErrorKind::WrongType,
            Self::MissingRequiredField { .. } => ConfigErrorKind::MissingRequiredField,
            Self::MalformedField { .. } => ConfigErrorKind::MalformedField,
            Self::ConflictingFields { .. } => ConfigErrorKind::ConflictingFields,
            Self::MissingRequiredExclusiveFields { .. } => {
                ConfigErrorKind::MissingRequiredExclusiveFields
            }
        }
    }

    pub fn class(&self) -> &'static str {
        match self {
            Self::UnrecognizedField { class, .. }
            | Self::WrongType { class, .. }
            | Self::MissingRequiredField { class, .. }
            | Self::MalformedField { class, .. }
            | Self::ConflictingFields { class, .. }
            | Self::MissingRequiredExclusiveFields { class, .. } => *class,
        }
    }

    /// The (first) offending field.
    pub fn field(&self) -> &str {
        match self {
            Self::UnrecognizedField { field, .. }
            | Self::WrongType { field, .. }
            | Self::MissingRequiredField { field, .. }
            | Self::MalformedField { field, .. }
            | Self::ConflictingFields { field, .. }
            | Self::MissingRequiredExclusiveFields { field, .. } => field,
        }
    }
}

/// Machine-readable kind of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    Launch,
    Version,
    Resource,
    AlreadyStarted,
    Interrupted,
    Probe,
    Relay,
    Manifest,
    Io,
    Serialization,
    Other,
}

/// Crate-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to launch {component} ({program}): {source}")]
    Launch {
        component: String,
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{name} {problem}! Please install version {required} or higher of {name}.")]
    Version {
        name: String,
        problem: String,
        required: String,
    },

    #[error("Resource error while {op} {}: {source}", .path.display())]
    Resource {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Pipeline already started")]
    AlreadyStarted,

    #[error("Pipeline start was interrupted")]
    Interrupted,

    #[error("Failed to probe {input}: {reason}")]
    Probe { input: String, reason: String },

    #[error("Relay error: {0}")]
    Relay(String),

    #[error("Cannot join manifest {}: {reason}", .path.display())]
    Manifest { path: PathBuf, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn launch(
        component: impl Into<String>,
        program: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        Self::Launch {
            component: component.into(),
            program: program.into(),
            source,
        }
    }

    pub fn resource(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Resource {
            op,
            path: path.into(),
            source,
        }
    }

    pub fn version(
        name: impl Into<String>,
        problem: impl Into<String>,
        required: impl Into<String>,
    ) -> Self {
        Self::Version {
            name: name.into(),
            problem: problem.into(),
            required: required.into(),
        }
    }

    pub fn relay(msg: impl Into<String>) -> Self {
        Self::Relay(msg.into())
    }

    pub fn manifest(path: impl Into<PathBuf>, reason: impl std::fmt::Display) -> Self {
        Self::Manifest {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Configuration,
            Self::Launch { .. } => ErrorKind::Launch,
            Self::Version { .. } => ErrorKind::Version,
            Self::Resource { .. } => ErrorKind::Resource,
            Self::AlreadyStarted => ErrorKind::AlreadyStarted,
            Self::Interrupted => ErrorKind::Interrupted,
            Self::Probe { .. } => ErrorKind::Probe,
            Self::Relay(_) => ErrorKind::Relay,
            Self::Manifest { .. } => ErrorKind::Manifest,
            Self::Io(_) => ErrorKind::Io,
            Self::Serialization(_) => ErrorKind::Serialization,
            Self::Other(_) => ErrorKind::Other,
        }
    }

    /// Configuration error kind, when this is a configuration error.
    pub fn config_kind(&self) -> Option<ConfigErrorKind> {
        match self {
            Self::Config(e) => Some(e.kind()),
            _ => None,
        }
    }

    /// The field or component the error is about, if any.
    pub fn component(&self) -> Option<&str> {
        match self {
            Self::Config(e) => Some(e.field()),
            Self::Launch { component, .. } => Some(component),
            Self::Version { name, .. } => Some(name),
            Self::Probe { input, .. } => Some(input),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_exposes_kind_and_field() {
        let err: Error = ConfigError::conflicting("InputConfig", "inputs", "multiperiod_inputs_list").into();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(err.config_kind(), Some(ConfigErrorKind::ConflictingFields));
        assert_eq!(err.component(), Some("inputs"));
        assert!(err.to_string().contains("multiperiod_inputs_list"));
    }

    #[test]
    fn kinds_serialize_in_snake_case() {
        let json = serde_json::to_string(&ConfigErrorKind::MissingRequiredExclusiveFields).unwrap();
        assert_eq!(json, "\"missing_required_exclusive_fields\"");
        let json = serde_json::to_string(&ErrorKind::AlreadyStarted).unwrap();
        assert_eq!(json, "\"already_started\"");
    }

    #[test]
    fn launch_error_names_component() {
        let err = Error::launch(
            "transcoder-1",
            "ffmpeg",
            std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        );
        assert_eq!(err.kind(), ErrorKind::Launch);
        assert_eq!(err.component(), Some("transcoder-1"));
    }
}
