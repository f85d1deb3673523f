//! Mirrors a local output tree into a [`RemoteStore`].
//!
//! The watcher polls the tree. A media file is uploaded once it has stopped
//! changing between two scans, so half-written segments are never pushed.
//! Manifests are read before the segments of the same pass are uploaded and
//! pushed after them, so a published manifest never refers to a segment the
//! remote side does not have yet. While any segment is still waiting to
//! settle, changed manifests are held back until a later pass.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::store::RemoteStore;
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct RelaySettings {
    pub poll_interval: Duration,
    /// Retries after the first failed attempt of each remote operation.
    pub max_retries: u32,
    /// Backoff before retry `n` is `retry_base * 2^n`.
    pub retry_base: Duration,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            max_retries: 5,
            retry_base: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayPhase {
    Watching,
    Flushing,
    Finished,
    Stopped,
    Errored,
}

impl RelayPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Stopped | Self::Errored)
    }
}

/// Progress published after every pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelayReport {
    pub phase: RelayPhase,
    pub uploaded: u64,
    pub deleted: u64,
    pub failed_attempts: u64,
    pub last_error: Option<String>,
}

impl Default for RelayReport {
    fn default() -> Self {
        Self {
            phase: RelayPhase::Watching,
            uploaded: 0,
            deleted: 0,
            failed_attempts: 0,
            last_error: None,
        }
    }
}

/// Size and modification time, compared between scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    len: u64,
    modified: Option<SystemTime>,
}

pub fn is_manifest(relative: &str) -> bool {
    relative.ends_with(".mpd") || relative.ends_with(".m3u8")
}

enum RemoteOp {
    UploadFile { local: PathBuf, relative: String },
    UploadBytes { relative: String, body: Vec<u8> },
    Delete { relative: String },
}

impl RemoteOp {
    fn relative(&self) -> &str {
        match self {
            Self::UploadFile { relative, .. }
            | Self::UploadBytes { relative, .. }
            | Self::Delete { relative } => relative,
        }
    }

    fn verb(&self) -> &'static str {
        match self {
            Self::UploadFile { .. } | Self::UploadBytes { .. } => "upload",
            Self::Delete { .. } => "delete",
        }
    }
}

pub struct Watcher {
    root: PathBuf,
    store: Arc<dyn RemoteStore>,
    settings: RelaySettings,
    /// Stamps seen by the previous scan.
    seen: HashMap<String, FileStamp>,
    /// Stamps of what the remote side currently holds.
    uploaded: HashMap<String, FileStamp>,
    report: watch::Sender<RelayReport>,
}

impl Watcher {
    pub fn new(
        root: impl Into<PathBuf>,
        store: Arc<dyn RemoteStore>,
        settings: RelaySettings,
    ) -> (Self, watch::Receiver<RelayReport>) {
        let (report, rx) = watch::channel(RelayReport::default());
        let watcher = Self {
            root: root.into(),
            store,
            settings,
            seen: HashMap::new(),
            uploaded: HashMap::new(),
            report,
        };
        (watcher, rx)
    }

    /// Polls until `cancel` fires (phase `Stopped`), `flush` fires (final
    /// pass, then `Finished`), or a remote operation runs out of retries
    /// (`Errored`).
    pub async fn run(mut self, cancel: CancellationToken, flush: CancellationToken) {
        info!(
            root = %self.root.display(),
            destination = %self.store.describe(),
            "Relay watching"
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.set_phase(RelayPhase::Stopped);
                    return;
                }
                _ = flush.cancelled() => break,
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
            }

            let outcome = tokio::select! {
                outcome = self.pass(true) => Some(outcome),
                _ = cancel.cancelled() => None,
            };
            match outcome {
                Some(Ok(())) => {}
                Some(Err(e)) => {
                    self.fail(e);
                    return;
                }
                None => {
                    self.set_phase(RelayPhase::Stopped);
                    return;
                }
            }
        }

        self.set_phase(RelayPhase::Flushing);
        let outcome = tokio::select! {
            outcome = self.pass(false) => Some(outcome),
            _ = cancel.cancelled() => None,
        };
        match outcome {
            None => self.set_phase(RelayPhase::Stopped),
            Some(Ok(())) => {
                let report = self.report.borrow().clone();
                info!(
                    uploaded = report.uploaded,
                    deleted = report.deleted,
                    "Relay flushed"
                );
                self.set_phase(RelayPhase::Finished);
            }
            Some(Err(e)) => self.fail(e),
        }
    }

    fn set_phase(&self, phase: RelayPhase) {
        self.report.send_modify(|r| r.phase = phase);
    }

    fn fail(&self, e: Error) {
        error!(error = %e, "Relay gave up");
        self.report.send_modify(|r| {
            r.phase = RelayPhase::Errored;
            r.last_error = Some(e.to_string());
        });
    }

    /// One scan and sync. With `require_stable` unset every changed file is
    /// pushed, which is what the final flush wants.
    pub async fn pass(&mut self, require_stable: bool) -> Result<()> {
        let current = scan(&self.root).await?;

        let mut manifests = Vec::new();
        for (relative, (path, stamp)) in &current {
            if !is_manifest(relative) || self.uploaded.get(relative) == Some(stamp) {
                continue;
            }
            match tokio::fs::read(path).await {
                // The packager truncates before rewriting.
                Ok(body) if body.is_empty() => {}
                Ok(body) => manifests.push((relative.clone(), *stamp, body)),
                Err(e) => debug!(path = %path.display(), error = %e, "Manifest vanished"),
            }
        }

        // A changed segment still settling may already be named by a manifest.
        let mut pending = false;
        for (relative, (path, stamp)) in &current {
            if is_manifest(relative) || self.uploaded.get(relative) == Some(stamp) {
                continue;
            }
            if require_stable && self.seen.get(relative) != Some(stamp) {
                pending = true;
                continue;
            }
            let op = RemoteOp::UploadFile {
                local: path.clone(),
                relative: relative.clone(),
            };
            if !self.execute(op).await? {
                continue;
            }
            self.uploaded.insert(relative.clone(), *stamp);
            self.report.send_modify(|r| r.uploaded += 1);
        }

        if pending && !manifests.is_empty() {
            debug!(count = manifests.len(), "Holding manifests until their segments settle");
            manifests.clear();
        }
        for (relative, stamp, body) in manifests {
            let op = RemoteOp::UploadBytes {
                relative: relative.clone(),
                body,
            };
            self.execute(op).await?;
            self.uploaded.insert(relative, stamp);
            self.report.send_modify(|r| r.uploaded += 1);
        }

        let mut gone: Vec<String> = self
            .uploaded
            .keys()
            .filter(|relative| !current.contains_key(*relative))
            .cloned()
            .collect();
        gone.sort();
        for relative in gone {
            self.execute(RemoteOp::Delete {
                relative: relative.clone(),
            })
            .await?;
            self.uploaded.remove(&relative);
            self.report.send_modify(|r| r.deleted += 1);
        }

        self.seen = current
            .into_iter()
            .map(|(relative, (_, stamp))| (relative, stamp))
            .collect();
        Ok(())
    }

    /// Runs `op` with retries. `Ok(false)` means the local file went away
    /// before it could be uploaded, which live windows do routinely.
    async fn execute(&self, op: RemoteOp) -> Result<bool> {
        let mut attempt: u32 = 0;
        loop {
            let outcome = match &op {
                RemoteOp::UploadFile { local, relative } => {
                    if !tokio::fs::try_exists(local).await.unwrap_or(true) {
                        debug!(file = %relative, "Segment removed before upload");
                        return Ok(false);
                    }
                    self.store.upload_file(local, relative).await
                }
                RemoteOp::UploadBytes { relative, body } => {
                    self.store.upload_bytes(relative, body.clone()).await
                }
                RemoteOp::Delete { relative } => self.store.delete(relative).await,
            };

            let e = match outcome {
                Ok(()) => return Ok(true),
                Err(e) => e,
            };
            self.report.send_modify(|r| {
                r.failed_attempts += 1;
                r.last_error = Some(e.to_string());
            });
            if attempt >= self.settings.max_retries {
                return Err(Error::relay(format!(
                    "{} of {} failed after {} attempts: {}",
                    op.verb(),
                    op.relative(),
                    attempt + 1,
                    e
                )));
            }

            let delay = self
                .settings
                .retry_base
                .saturating_mul(2u32.saturating_pow(attempt));
            warn!(
                file = op.relative(),
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                error = %e,
                "Remote {} failed, retrying",
                op.verb()
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

/// Every regular file below `root`, keyed by its `/`-separated relative
/// path.
async fn scan(root: &Path) -> Result<BTreeMap<String, (PathBuf, FileStamp)>> {
    let mut files = BTreeMap::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && dir != root => continue,
            Err(e) => return Err(Error::resource("scanning", &dir, e)),
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::resource("scanning", &dir, e))?
        {
            let path = entry.path();
            // Entries may disappear between listing and stat.
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if meta.is_dir() {
                pending.push(path);
                continue;
            }
            if !meta.is_file() {
                continue;
            }
            let Ok(relative) = path.strip_prefix(root) else {
                continue;
            };
            let relative = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            let stamp = FileStamp {
                len: meta.len(),
                modified: meta.modified().ok(),
            };
            files.insert(relative, (path, stamp));
        }
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Records every successful operation; fails the first `failures` calls.
    #[derive(Default)]
    struct MemoryStore {
        log: Mutex<Vec<String>>,
        objects: Mutex<BTreeMap<String, Vec<u8>>>,
        failures: AtomicU32,
    }

    impl MemoryStore {
        fn failing(failures: u32) -> Self {
            Self {
                failures: AtomicU32::new(failures),
                ..Default::default()
            }
        }

        fn check(&self) -> Result<()> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(Error::relay("503 Service Unavailable"));
            }
            Ok(())
        }

        fn log(&self) -> Vec<String> {
            self.log.lock().clone()
        }
    }

    #[async_trait]
    impl RemoteStore for MemoryStore {
        async fn upload_file(&self, local: &Path, relative: &str) -> Result<()> {
            self.check()?;
            let body = std::fs::read(local)?;
            self.objects.lock().insert(relative.to_string(), body);
            self.log.lock().push(format!("put {relative}"));
            Ok(())
        }

        async fn upload_bytes(&self, relative: &str, body: Vec<u8>) -> Result<()> {
            self.check()?;
            self.objects.lock().insert(relative.to_string(), body);
            self.log.lock().push(format!("put {relative}"));
            Ok(())
        }

        async fn delete(&self, relative: &str) -> Result<()> {
            self.check()?;
            self.objects.lock().remove(relative);
            self.log.lock().push(format!("delete {relative}"));
            Ok(())
        }

        fn describe(&self) -> String {
            "memory".to_string()
        }
    }

    fn settings(max_retries: u32) -> RelaySettings {
        RelaySettings {
            poll_interval: Duration::from_millis(20),
            max_retries,
            retry_base: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn segments_wait_until_stable() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::default());
        let (mut watcher, rx) = Watcher::new(dir.path(), store.clone(), settings(0));

        std::fs::create_dir(dir.path().join("segments")).unwrap();
        std::fs::write(dir.path().join("segments/video_1.mp4"), b"moof").unwrap();

        watcher.pass(true).await.unwrap();
        assert!(store.log().is_empty());

        watcher.pass(true).await.unwrap();
        assert_eq!(store.log(), vec!["put segments/video_1.mp4"]);

        // Unchanged files are not pushed again.
        watcher.pass(true).await.unwrap();
        assert_eq!(rx.borrow().uploaded, 1);
    }

    #[tokio::test]
    async fn manifests_follow_their_segments() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::default());
        let (mut watcher, _rx) = Watcher::new(dir.path(), store.clone(), settings(0));

        std::fs::write(dir.path().join("dash.mpd"), b"<MPD/>").unwrap();
        std::fs::write(dir.path().join("audio_1.mp4"), b"moof").unwrap();
        std::fs::write(dir.path().join("hls.m3u8"), b"").unwrap();

        watcher.pass(false).await.unwrap();
        assert_eq!(store.log(), vec!["put audio_1.mp4", "put dash.mpd"]);
    }

    #[tokio::test]
    async fn manifests_wait_for_unsettled_segments() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::default());
        let (mut watcher, _rx) = Watcher::new(dir.path(), store.clone(), settings(0));

        std::fs::write(dir.path().join("video_1.mp4"), b"moof").unwrap();
        std::fs::write(dir.path().join("dash.mpd"), b"<MPD>video_1.mp4</MPD>").unwrap();

        watcher.pass(true).await.unwrap();
        assert!(store.log().is_empty());

        watcher.pass(true).await.unwrap();
        assert_eq!(store.log(), vec!["put video_1.mp4", "put dash.mpd"]);

        // A new segment holds back the manifest update that names it.
        std::fs::write(dir.path().join("video_2.mp4"), b"moof").unwrap();
        std::fs::write(
            dir.path().join("dash.mpd"),
            b"<MPD>video_1.mp4 video_2.mp4</MPD>",
        )
        .unwrap();
        watcher.pass(true).await.unwrap();
        assert_eq!(store.log().len(), 2);

        watcher.pass(true).await.unwrap();
        assert_eq!(
            store.log()[2..],
            ["put video_2.mp4".to_string(), "put dash.mpd".to_string()]
        );
        assert_eq!(
            store.objects.lock().get("dash.mpd").map(Vec::as_slice),
            Some(&b"<MPD>video_1.mp4 video_2.mp4</MPD>"[..])
        );
    }

    #[tokio::test]
    async fn removed_files_are_deleted_remotely() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::default());
        let (mut watcher, rx) = Watcher::new(dir.path(), store.clone(), settings(0));

        let segment = dir.path().join("video_1.mp4");
        std::fs::write(&segment, b"moof").unwrap();
        watcher.pass(false).await.unwrap();
        std::fs::remove_file(&segment).unwrap();
        watcher.pass(true).await.unwrap();

        assert_eq!(store.log(), vec!["put video_1.mp4", "delete video_1.mp4"]);
        assert!(store.objects.lock().is_empty());
        assert_eq!(rx.borrow().deleted, 1);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::failing(2));
        let (mut watcher, rx) = Watcher::new(dir.path(), store.clone(), settings(3));

        std::fs::write(dir.path().join("video_1.mp4"), b"moof").unwrap();
        watcher.pass(false).await.unwrap();

        assert_eq!(store.log(), vec!["put video_1.mp4"]);
        assert_eq!(rx.borrow().failed_attempts, 2);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_the_pass() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::failing(u32::MAX));
        let (mut watcher, rx) = Watcher::new(dir.path(), store.clone(), settings(2));

        std::fs::write(dir.path().join("video_1.mp4"), b"moof").unwrap();
        let err = watcher.pass(false).await.unwrap_err();

        assert_eq!(err.kind(), crate::error::ErrorKind::Relay);
        assert!(err.to_string().contains("after 3 attempts"));
        assert_eq!(rx.borrow().failed_attempts, 3);
    }

    #[tokio::test]
    async fn flush_pushes_everything_then_finishes() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::default());
        let (watcher, mut rx) = Watcher::new(dir.path(), store.clone(), settings(0));
        let cancel = CancellationToken::new();
        let flush = CancellationToken::new();
        let task = tokio::spawn(watcher.run(cancel.clone(), flush.clone()));

        std::fs::write(dir.path().join("video_1.mp4"), b"moof").unwrap();
        std::fs::write(dir.path().join("dash.mpd"), b"<MPD/>").unwrap();
        flush.cancel();

        rx.wait_for(|r| r.phase.is_terminal()).await.unwrap();
        task.await.unwrap();
        assert_eq!(rx.borrow().phase, RelayPhase::Finished);
        assert!(store.objects.lock().contains_key("video_1.mp4"));
        assert!(store.objects.lock().contains_key("dash.mpd"));
    }

    #[tokio::test]
    async fn cancel_stops_without_flushing() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::default());
        let (watcher, rx) = Watcher::new(dir.path(), store.clone(), settings(0));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(watcher.run(cancel.clone(), CancellationToken::new()));

        cancel.cancel();
        task.await.unwrap();
        assert_eq!(rx.borrow().phase, RelayPhase::Stopped);
    }
}
