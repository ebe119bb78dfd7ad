use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::format::LOCK_FILE_NAME;

const ACQUIRE_ATTEMPTS: u32 = 3;
const ACQUIRE_RETRY_DELAY_MS: u64 = 100;

/// Exclusive ownership of a datastore directory.
///
/// The `lockfile` at the directory root records the owner's process id.
/// Acquisition rejects the directory with `StoreAlreadyInUse` while the
/// recorded owner is still alive, and reclaims the file when it is not, so
/// a process that died without closing never leaves a store permanently
/// locked. Claiming uses the create-new file mode: when two openers race
/// for a reclaimed lock, exactly one creates the file and the other finds
/// a live owner on retry.
pub struct StoreLock {
    path: PathBuf,
    released: bool,
}

impl StoreLock {
    pub fn acquire(db_directory: &Path) -> Result<Self> {
        let path = db_directory.join(LOCK_FILE_NAME);

        for attempt in 0..ACQUIRE_ATTEMPTS {
            if attempt > 0 {
                std::thread::sleep(Duration::from_millis(ACQUIRE_RETRY_DELAY_MS));
            }

            match fs::read_to_string(&path) {
                Ok(content) => {
                    let Ok(owner_pid) = content.trim().parse::<u32>() else {
                        continue; // owner may not have written its pid yet
                    };
                    if process_is_alive(owner_pid) {
                        return Err(Error::StoreAlreadyInUse);
                    }
                    // The recorded owner is gone: the lock is stale.
                    if fs::remove_file(&path).is_err() && path.exists() {
                        return Err(Error::BadDiskAccess);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(_) => continue,
            }

            let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => file,
                Err(_) => continue, // another opener claimed it first
            };
            if write!(file, "{}", std::process::id())
                .and_then(|()| file.flush())
                .is_err()
            {
                return Err(Error::BadDiskAccess);
            }
            return Ok(Self {
                path,
                released: false,
            });
        }

        Err(Error::BadDiskAccess)
    }

    /// Removes the lock file, after checking that it still carries this
    /// process id. A missing or foreign file means the lock is no longer
    /// ours to clean up, which is not an error.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        match fs::read_to_string(&self.path) {
            Ok(content) if content.trim().parse::<u32>() == Ok(std::process::id()) => {
                fs::remove_file(&self.path).map_err(|_| Error::BadDiskAccess)
            }
            _ => Ok(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Ok(content) = fs::read_to_string(&self.path) {
            if content.trim().parse::<u32>() == Ok(std::process::id()) {
                let _ = fs::remove_file(&self.path);
            }
        }
    }
}

/// Probes whether a process with this id exists.
#[cfg(unix)]
fn process_is_alive(pid: u32) -> bool {
    // Signal 0 checks existence without delivering anything; EPERM means
    // the process exists but belongs to another user.
    let result = unsafe { libc::kill(pid as libc::pid_t, 0) };
    result == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(windows)]
fn process_is_alive(pid: u32) -> bool {
    use winapi::um::handleapi::CloseHandle;
    use winapi::um::minwinbase::STILL_ACTIVE;
    use winapi::um::processthreadsapi::{GetExitCodeProcess, OpenProcess};
    use winapi::um::winnt::PROCESS_QUERY_LIMITED_INFORMATION;

    unsafe {
        let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
        if handle.is_null() {
            return false;
        }
        let mut exit_code = 0u32;
        let alive = GetExitCodeProcess(handle, &mut exit_code) != 0 && exit_code == STILL_ACTIVE;
        CloseHandle(handle);
        alive
    }
}

#[cfg(not(any(unix, windows)))]
fn process_is_alive(_pid: u32) -> bool {
    // No liveness probe on this platform: err on the locked side.
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    // Far beyond any real pid space, so the liveness probe reports dead.
    const DEAD_PID: &str = "999999999";

    #[test]
    fn test_acquire_records_owner_pid() {
        let dir = TempDir::new().unwrap();
        let lock = StoreLock::acquire(dir.path()).expect("acquire");

        let content = fs::read_to_string(lock.path()).unwrap();
        assert_eq!(content.trim().parse::<u32>(), Ok(std::process::id()));

        lock.release().expect("release");
        assert!(!dir.path().join(LOCK_FILE_NAME).exists());
    }

    #[test]
    fn test_live_owner_blocks_second_acquire() {
        let dir = TempDir::new().unwrap();
        let lock1 = StoreLock::acquire(dir.path()).expect("first acquire");

        // Our own pid is alive, so a second claim is refused.
        assert_eq!(
            StoreLock::acquire(dir.path()).err(),
            Some(Error::StoreAlreadyInUse)
        );

        lock1.release().unwrap();
        StoreLock::acquire(dir.path()).expect("acquire after release");
    }

    #[test]
    fn test_stale_lock_from_dead_process_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(LOCK_FILE_NAME), DEAD_PID).unwrap();

        let lock = StoreLock::acquire(dir.path()).expect("reclaim stale lock");
        let content = fs::read_to_string(lock.path()).unwrap();
        assert_eq!(content.trim().parse::<u32>(), Ok(std::process::id()));
    }

    #[test]
    fn test_unreadable_content_is_not_reclaimed() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(LOCK_FILE_NAME), "not a pid").unwrap();

        // Garbage could be a half-written claim; after the retries run out
        // the acquisition fails rather than stealing the file.
        assert_eq!(
            StoreLock::acquire(dir.path()).err(),
            Some(Error::BadDiskAccess)
        );
        let content = fs::read_to_string(dir.path().join(LOCK_FILE_NAME)).unwrap();
        assert_eq!(content, "not a pid");
    }

    #[test]
    fn test_drop_cleans_up() {
        let dir = TempDir::new().unwrap();
        {
            let _lock = StoreLock::acquire(dir.path()).expect("acquire");
            assert!(dir.path().join(LOCK_FILE_NAME).exists());
        }
        assert!(!dir.path().join(LOCK_FILE_NAME).exists());
        StoreLock::acquire(dir.path()).expect("reacquire after drop");
    }
}
