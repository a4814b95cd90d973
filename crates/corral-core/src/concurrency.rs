use crate::CoreError;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{info, warn};

/// Exclusive advisory lock on a storage root's `.lock` file; held for the
/// lifetime of a running instance so two instances never share a root.
pub struct StorageLock {
    file: File,
}

impl StorageLock {
    /// Take the lock without waiting; a held lock is `StorageLocked`.
    pub fn acquire(lock_path: &Path) -> Result<Self, CoreError> {
        let file = open_lock_file(lock_path)?;
        if file.try_lock_exclusive().is_err() {
            return Err(CoreError::StorageLocked(
                lock_path.parent().unwrap_or(lock_path).to_path_buf(),
            ));
        }
        Ok(Self { file })
    }
}

fn open_lock_file(lock_path: &Path) -> Result<File, CoreError> {
    if let Some(parent) = lock_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(lock_path)?)
}

impl Drop for StorageLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

/// First interrupt requests a graceful shutdown; a second one exits at once.
pub fn install_signal_handler() -> Result<(), CoreError> {
    ctrlc::set_handler(|| {
        if SHUTDOWN.swap(true, Ordering::SeqCst) {
            warn!("second interrupt, exiting without cleanup");
            std::process::exit(130);
        }
        info!("interrupt received, shutting down");
    })
    .map_err(|e| CoreError::Io(std::io::Error::other(e)))
}

fn shutdown_requested() -> bool {
    SHUTDOWN.load(Ordering::SeqCst)
}

/// Park the calling thread until a shutdown is requested.
pub fn wait_for_shutdown(poll: Duration) {
    while !shutdown_requested() {
        std::thread::sleep(poll);
    }
}
