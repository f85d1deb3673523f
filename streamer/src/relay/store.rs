//! Remote stores the relay mirrors into.

use async_trait::async_trait;
use reqwest::{Body, Client};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::error::{Error, Result};
use crate::location::{CloudScheme, OutputLocation};

/// A destination addressed by paths relative to the output root, always
/// using `/` as separator.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn upload_file(&self, local: &Path, relative: &str) -> Result<()>;

    async fn upload_bytes(&self, relative: &str, body: Vec<u8>) -> Result<()>;

    async fn delete(&self, relative: &str) -> Result<()>;

    /// Where the store points, for logs.
    fn describe(&self) -> String;
}

/// The store for a remote location, or `None` for local output.
pub fn store_for(
    location: &OutputLocation,
    rclone: &Path,
) -> Result<Option<Arc<dyn RemoteStore>>> {
    let store: Arc<dyn RemoteStore> = match location {
        OutputLocation::Local(_) => return Ok(None),
        OutputLocation::Http(_) => Arc::new(HttpStore::new(location.clone())?),
        OutputLocation::Cloud { .. } => Arc::new(RcloneStore::new(rclone, location.clone())),
    };
    Ok(Some(store))
}

/// Pushes files with HTTP `PUT` and removes them with `DELETE`.
pub struct HttpStore {
    client: Client,
    location: OutputLocation,
}

impl HttpStore {
    const TIMEOUT: Duration = Duration::from_secs(30);

    pub fn new(location: OutputLocation) -> Result<Self> {
        let client = Client::builder()
            .timeout(Self::TIMEOUT)
            .build()
            .map_err(|e| Error::relay(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self { client, location })
    }

    fn url(&self, relative: &str) -> Result<String> {
        self.location
            .remote_target(relative)
            .ok_or_else(|| Error::relay(format!("{} is not an HTTP location", self.location)))
    }

    async fn put(&self, relative: &str, body: Body, len: u64) -> Result<()> {
        let url = self.url(relative)?;
        let response = self
            .client
            .put(&url)
            .header(reqwest::header::CACHE_CONTROL, "no-cache")
            .header(reqwest::header::CONTENT_LENGTH, len)
            .body(body)
            .send()
            .await
            .map_err(|e| Error::relay(format!("PUT {url} failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::relay(format!("PUT {url} failed: {status}")));
        }
        debug!(url = %url, bytes = len, "Uploaded");
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for HttpStore {
    async fn upload_file(&self, local: &Path, relative: &str) -> Result<()> {
        let file = tokio::fs::File::open(local)
            .await
            .map_err(|e| Error::resource("reading", local, e))?;
        let len = file
            .metadata()
            .await
            .map_err(|e| Error::resource("reading", local, e))?
            .len();
        self.put(relative, Body::wrap_stream(ReaderStream::new(file)), len)
            .await
    }

    async fn upload_bytes(&self, relative: &str, body: Vec<u8>) -> Result<()> {
        let len = body.len() as u64;
        self.put(relative, Body::from(body), len).await
    }

    async fn delete(&self, relative: &str) -> Result<()> {
        let url = self.url(relative)?;
        let response = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(|e| Error::relay(format!("DELETE {url} failed: {e}")))?;

        let status = response.status();
        // Gone already is as good as deleted.
        if !status.is_success() && status != reqwest::StatusCode::NOT_FOUND {
            return Err(Error::relay(format!("DELETE {url} failed: {status}")));
        }
        debug!(url = %url, "Deleted");
        Ok(())
    }

    fn describe(&self) -> String {
        self.location.to_string()
    }
}

/// Object storage through rclone's on-the-fly remotes (`:gcs:` and `:s3:`),
/// so no rclone config file is needed beyond the usual credentials.
pub struct RcloneStore {
    rclone: PathBuf,
    location: OutputLocation,
}

impl RcloneStore {
    pub fn new(rclone: &Path, location: OutputLocation) -> Self {
        Self {
            rclone: rclone.to_path_buf(),
            location,
        }
    }

    /// `:gcs:bucket/prefix/relative`
    pub fn remote_path(&self, relative: &str) -> Result<String> {
        let OutputLocation::Cloud { scheme, bucket, .. } = &self.location else {
            return Err(Error::relay(format!("{} is not a cloud location", self.location)));
        };
        let key = self.location.remote_target(relative).unwrap_or_default();
        Ok(format!("{}{}/{}", backend_prefix(*scheme), bucket, key))
    }

    fn command(&self) -> tokio::process::Command {
        let mut cmd = process_utils::tokio_command(&self.rclone);
        cmd.args(["--log-level", "ERROR"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    fn finish(&self, op: &str, target: &str, output: std::process::Output) -> Result<()> {
        if output.status.success() {
            debug!(op, target, "rclone succeeded");
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(Error::relay(format!(
            "rclone {op} {target} failed ({}): {}",
            process_utils::describe_exit(&output.status),
            stderr.trim()
        )))
    }

    fn spawn_error(&self, e: std::io::Error) -> Error {
        Error::launch("cloud-relay", self.rclone.to_string_lossy(), e)
    }
}

fn backend_prefix(scheme: CloudScheme) -> String {
    format!(":{}:", scheme.rclone_backend())
}

#[async_trait]
impl RemoteStore for RcloneStore {
    async fn upload_file(&self, local: &Path, relative: &str) -> Result<()> {
        let target = self.remote_path(relative)?;
        let output = self
            .command()
            .arg("copyto")
            .arg(local)
            .arg(&target)
            .output()
            .await
            .map_err(|e| self.spawn_error(e))?;
        self.finish("copyto", &target, output)
    }

    async fn upload_bytes(&self, relative: &str, body: Vec<u8>) -> Result<()> {
        let target = self.remote_path(relative)?;
        let mut child = self
            .command()
            .arg("rcat")
            .arg(&target)
            .stdin(Stdio::piped())
            .spawn()
            .map_err(|e| self.spawn_error(e))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&body)
                .await
                .map_err(|e| Error::relay(format!("rclone rcat {target}: {e}")))?;
            // Closing stdin ends the upload.
            drop(stdin);
        }
        let output = child
            .wait_with_output()
            .await
            .map_err(|e| Error::relay(format!("rclone rcat {target}: {e}")))?;
        self.finish("rcat", &target, output)
    }

    async fn delete(&self, relative: &str) -> Result<()> {
        let target = self.remote_path(relative)?;
        let output = self
            .command()
            .arg("deletefile")
            .arg(&target)
            .output()
            .await
            .map_err(|e| self.spawn_error(e))?;
        self.finish("deletefile", &target, output)
    }

    fn describe(&self) -> String {
        self.location.to_string()
    }
}
