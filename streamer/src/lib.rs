//! Lifecycle controller for media pipelines built from external tools.
//!
//! A run wires an FFmpeg transcoder and a packager together through named
//! pipes, optionally feeds it from looping or external-command producers,
//! and optionally mirrors the packager's output to remote storage. The
//! periods of a multi-period run are joined into one presentation at the
//! end.
//! [`Controller`] exposes the whole surface: `start`, `check_status` and
//! `stop`.

pub mod concat;
pub mod config;
pub mod controller;
pub mod error;
pub mod graph;
pub mod location;
pub mod logging;
pub mod node;
pub mod pipe;
pub mod probe;
pub mod relay;
pub mod stream;
pub mod toolchain;

pub use controller::{Controller, ControllerOptions, RunState};
pub use error::{ConfigError, ConfigErrorKind, Error, ErrorKind, Result};
pub use location::OutputLocation;
pub use node::NodeStatus;
pub use toolchain::Toolchain;
