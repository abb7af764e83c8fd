use crate::config::LockConfig;
use crate::error::{HarnessError, Result};
use crate::paths;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::time::Duration;

/// Exclusive advisory lock on `.harness/state.lock`, released on drop.
///
/// Every read-modify-write of the state document happens while one of these
/// is held. Readers that only load the document do not take it; writes go
/// through an atomic rename so a reader never sees a torn file.
#[derive(Debug)]
pub struct StoreLock {
    file: File,
}

impl StoreLock {
    pub fn acquire(root: &Path, cfg: &LockConfig) -> Result<Self> {
        let path = paths::lock_path(root);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let attempts = cfg.retries + 1;
        let mut delay = Duration::from_millis(cfg.backoff_ms);
        for attempt in 1..=attempts {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(Self { file }),
                Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                    tracing::debug!(attempt, "state lock busy, backing off {:?}", delay);
                    if attempt < attempts {
                        std::thread::sleep(delay);
                        delay = delay.saturating_mul(2);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(HarnessError::LockContention { attempts })
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}
