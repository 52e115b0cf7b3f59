//! Scratch storage for received file transfers.
//!
//! Inbound compound transfers are streamed into numbered sink files under the
//! configured temp directory. The directory is created on first use and swept
//! on clean shutdown.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Clone)]
pub struct TempStore {
    inner: Arc<TempStoreInner>,
}

struct TempStoreInner {
    root: PathBuf,
    transfer_count: AtomicUsize,
}

impl TempStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(TempStoreInner {
                root: root.into(),
                transfer_count: AtomicUsize::new(0),
            }),
        }
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Allocates a fresh, empty sink file for one inbound transfer.
    pub fn create_transfer_file(&self) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(&self.inner.root)?;
        let id = self.inner.transfer_count.fetch_add(1, Ordering::Relaxed) + 1;
        let path = self.inner.root.join(format!("transfer_{id}.data"));
        std::fs::File::create(&path)?;
        Ok(path)
    }

    /// Deletes the scratch directory and everything in it.
    pub fn sweep(&self) -> std::io::Result<()> {
        if self.inner.root.exists() {
            std::fs::remove_dir_all(&self.inner.root)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_distinct_sink_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = TempStore::new(dir.path().join("scratch"));
        let first = store.create_transfer_file().unwrap();
        let second = store.create_transfer_file().unwrap();
        assert_ne!(first, second);
        assert!(first.exists());
        assert!(second.exists());
    }

    #[test]
    fn sweep_removes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let store = TempStore::new(dir.path().join("scratch"));
        store.create_transfer_file().unwrap();
        store.sweep().unwrap();
        assert!(!store.root().exists());
        // Sweeping an absent directory is fine.
        store.sweep().unwrap();
    }
}
