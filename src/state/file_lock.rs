use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, SystemTime};

pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(5);
pub const MAX_ATTEMPTS: u32 = 20;
const BACKOFF_MIN_MS: u64 = 50;
const BACKOFF_MAX_MS: u64 = 150;

/// Marker-file mutual exclusion. Existence of the marker means "held";
/// a marker older than the staleness threshold is treated as abandoned
/// and removed by the next waiter. This is a liveness aid, not a hard
/// correctness guarantee: whole-document replace-on-write keeps the data
/// consistent even if two holders ever overlap.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    held: bool,
}

impl FileLock {
    /// Attempts to take the marker, retrying with randomized backoff.
    /// On retry exhaustion the returned guard reports `held() == false`
    /// and the caller proceeds in degraded mode.
    pub fn acquire(path: &Path, stale_after: Duration) -> FileLock {
        for _ in 0..MAX_ATTEMPTS {
            if try_create_marker(path) {
                return FileLock {
                    path: path.to_path_buf(),
                    held: true,
                };
            }

            if marker_age(path).map(|age| age > stale_after).unwrap_or(false) {
                let _ = fs::remove_file(path);
                continue;
            }

            thread::sleep(Duration::from_millis(backoff_jitter_ms()));
        }

        FileLock {
            path: path.to_path_buf(),
            held: false,
        }
    }

    pub fn held(&self) -> bool {
        self.held
    }

    pub fn release(&mut self) {
        if self.held {
            let _ = fs::remove_file(&self.path);
            self.held = false;
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        self.release();
    }
}

fn try_create_marker(path: &Path) -> bool {
    if let Some(parent) = path.parent() {
        if fs::create_dir_all(parent).is_err() {
            return false;
        }
    }
    fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(path)
        .is_ok()
}

fn marker_age(path: &Path) -> Option<Duration> {
    let modified = fs::metadata(path).ok()?.modified().ok()?;
    SystemTime::now().duration_since(modified).ok()
}

fn backoff_jitter_ms() -> u64 {
    let mut bytes = [0u8; 2];
    if getrandom::getrandom(&mut bytes).is_err() {
        return BACKOFF_MIN_MS;
    }
    let span = BACKOFF_MAX_MS - BACKOFF_MIN_MS + 1;
    BACKOFF_MIN_MS + u64::from(u16::from_le_bytes(bytes)) % span
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn acquire_creates_marker_and_release_removes_it() {
        let dir = tempdir().expect("tempdir");
        let marker = dir.path().join("shared.json.lock");

        let mut lock = FileLock::acquire(&marker, DEFAULT_STALE_AFTER);
        assert!(lock.held());
        assert!(marker.exists());

        lock.release();
        assert!(!marker.exists());
        // idempotent
        lock.release();
    }

    #[test]
    fn drop_releases_the_marker() {
        let dir = tempdir().expect("tempdir");
        let marker = dir.path().join("shared.json.lock");
        {
            let lock = FileLock::acquire(&marker, DEFAULT_STALE_AFTER);
            assert!(lock.held());
        }
        assert!(!marker.exists());
    }

    #[test]
    fn stale_marker_is_removed_and_reacquired() {
        let dir = tempdir().expect("tempdir");
        let marker = dir.path().join("shared.json.lock");
        fs::write(&marker, b"").expect("plant marker");

        let lock = FileLock::acquire(&marker, Duration::from_millis(0));
        assert!(lock.held(), "zero staleness must reclaim immediately");
    }

    #[test]
    fn contended_fresh_marker_degrades_after_retries() {
        let dir = tempdir().expect("tempdir");
        let marker = dir.path().join("shared.json.lock");
        fs::write(&marker, b"").expect("plant marker");

        // A fresh marker with a long staleness window cannot be reclaimed;
        // acquire must give up instead of blocking forever. ~2s of backoff.
        let lock = FileLock::acquire(&marker, Duration::from_secs(3600));
        assert!(!lock.held());
        assert!(marker.exists(), "foreign marker must not be removed");
    }
}
