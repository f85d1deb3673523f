//! Named pipes connecting pipeline processes.
//!
//! All pipes of a run live in one private temporary directory. Names combine
//! a per-run id with a counter, so concurrent runs on the same host never
//! collide.

use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Index of a pipe within its [`PipeFabric`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PipeId(usize);

#[derive(Debug)]
pub struct PipeFabric {
    run_id: String,
    root: PathBuf,
    dir: Option<TempDir>,
    pipes: Vec<PathBuf>,
}

impl PipeFabric {
    /// Creates the run's pipe directory under `temp_root`, or the system
    /// temp dir when not given.
    pub fn new(temp_root: Option<&Path>) -> Result<Self> {
        let run_id = uuid::Uuid::new_v4().simple().to_string();
        let parent = temp_root
            .map(Path::to_path_buf)
            .unwrap_or_else(std::env::temp_dir);

        let dir = tempfile::Builder::new()
            .prefix("streamer-")
            .tempdir_in(&parent)
            .map_err(|e| Error::resource("creating pipe directory in", &parent, e))?;

        debug!(run_id = %run_id, path = %dir.path().display(), "Created pipe directory");
        Ok(Self {
            run_id,
            root: dir.path().to_path_buf(),
            dir: Some(dir),
            pipes: Vec::new(),
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn dir(&self) -> &Path {
        &self.root
    }

    pub fn len(&self) -> usize {
        self.pipes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipes.is_empty()
    }

    /// Creates a new FIFO, readable and writable by the owner only. The
    /// suffix is appended to the generated name (e.g. `.vtt` for tools that
    /// sniff the format from the extension).
    pub fn create_pipe(&mut self, suffix: &str) -> Result<PipeId> {
        if self.dir.is_none() {
            return Err(Error::resource(
                "creating pipe in",
                &self.root,
                io::Error::new(io::ErrorKind::NotFound, "pipe directory already removed"),
            ));
        }

        let name = format!("{}-{:04}{}", self.run_id, self.pipes.len(), suffix);
        let path = self.root.join(name);
        make_fifo(&path).map_err(|e| Error::resource("creating pipe", &path, e))?;

        debug!(path = %path.display(), "Created pipe");
        self.pipes.push(path);
        Ok(PipeId(self.pipes.len() - 1))
    }

    pub fn path(&self, id: PipeId) -> &Path {
        &self.pipes[id.0]
    }

    /// Removes every pipe and the directory holding them. Pipes that are
    /// already gone count as removed. Safe to call more than once.
    pub fn cleanup_all(&mut self) -> Result<()> {
        let Some(dir) = self.dir.take() else {
            return Ok(());
        };

        let mut first_error = None;
        for path in &self.pipes {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to remove pipe");
                    first_error.get_or_insert(Error::resource("removing pipe", path, e));
                }
            }
        }

        match dir.close() {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = %self.root.display(), error = %e, "Failed to remove pipe directory");
                first_error.get_or_insert(Error::resource("removing pipe directory", &self.root, e));
            }
        }

        debug!(run_id = %self.run_id, count = self.pipes.len(), "Removed pipes");
        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for PipeFabric {
    fn drop(&mut self) {
        let _ = self.cleanup_all();
    }
}

#[cfg(unix)]
fn make_fifo(path: &Path) -> io::Result<()> {
    use nix::sys::stat::Mode;

    nix::unistd::mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR).map_err(io::Error::from)
}

// Windows named pipes are not supported.
#[cfg(not(unix))]
fn make_fifo(_path: &Path) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "named pipes are not supported on this platform",
    ))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::FileTypeExt;

    #[test]
    fn pipes_are_unique_fifos() {
        let root = tempfile::tempdir().unwrap();
        let mut fabric = PipeFabric::new(Some(root.path())).unwrap();
        let a = fabric.create_pipe("").unwrap();
        let b = fabric.create_pipe(".vtt").unwrap();

        assert_ne!(fabric.path(a), fabric.path(b));
        assert!(fabric.path(b).to_string_lossy().ends_with(".vtt"));
        let meta = std::fs::metadata(fabric.path(a)).unwrap();
        assert!(meta.file_type().is_fifo());
        assert!(fabric.path(a).starts_with(root.path()));
    }

    #[test]
    fn concurrent_fabrics_do_not_collide() {
        let root = tempfile::tempdir().unwrap();
        let mut first = PipeFabric::new(Some(root.path())).unwrap();
        let mut second = PipeFabric::new(Some(root.path())).unwrap();
        let a = first.create_pipe("").unwrap();
        let b = second.create_pipe("").unwrap();
        assert_ne!(first.run_id(), second.run_id());
        assert_ne!(first.path(a), second.path(b));
    }

    #[test]
    fn cleanup_tolerates_removed_pipes_and_repeats() {
        let root = tempfile::tempdir().unwrap();
        let mut fabric = PipeFabric::new(Some(root.path())).unwrap();
        let a = fabric.create_pipe("").unwrap();
        fabric.create_pipe("").unwrap();
        std::fs::remove_file(fabric.path(a)).unwrap();

        let dir = fabric.dir().to_path_buf();
        fabric.cleanup_all().unwrap();
        assert!(!dir.exists());
        fabric.cleanup_all().unwrap();
        assert!(fabric.create_pipe("").is_err());
    }

    #[test]
    fn drop_removes_directory() {
        let root = tempfile::tempdir().unwrap();
        let dir = {
            let mut fabric = PipeFabric::new(Some(root.path())).unwrap();
            fabric.create_pipe("").unwrap();
            fabric.dir().to_path_buf()
        };
        assert!(!dir.exists());
    }

    #[test]
    fn unwritable_root_is_a_resource_error() {
        let err = PipeFabric::new(Some(Path::new("/nonexistent/streamer-root"))).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Resource);
    }
}

#[cfg(all(test, not(unix)))]
mod non_unix_tests {
    use super::*;

    #[test]
    fn pipes_are_a_resource_error() {
        let root = tempfile::tempdir().unwrap();
        let mut fabric = PipeFabric::new(Some(root.path())).unwrap();
        let err = fabric.create_pipe("").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Resource);
        assert!(fabric.is_empty());
    }
}
