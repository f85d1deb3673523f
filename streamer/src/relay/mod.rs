//! Mirroring packager output to remote destinations.

pub mod store;
pub mod watcher;

pub use store::{HttpStore, RcloneStore, RemoteStore, store_for};
pub use watcher::{RelayPhase, RelayReport, RelaySettings, Watcher};
