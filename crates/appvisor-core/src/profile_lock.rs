use chrono::Utc;
use fs2::FileExt;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use uuid::Uuid;

pub const LOCK_FILE_NAME: &str = "lock";
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(10);

// A profile is owned by whichever process keeps touching `<profile>/lock`.
// A lock file that has not been touched for `stale_after` belongs to a
// process that exited without cleaning up and can be taken over.

#[derive(Debug, Error)]
pub enum ProfileLockError {
    #[error("could not find out if this file can be locked: {path}: {source}")]
    Inspect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("could not take lock guard {path}: {source}")]
    Guard {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockTimings {
    pub stale_after: Duration,
    pub touch_interval: Duration,
}

impl Default for LockTimings {
    fn default() -> Self {
        Self::with_stale_after(DEFAULT_STALE_AFTER)
    }
}

impl LockTimings {
    pub fn with_stale_after(stale_after: Duration) -> Self {
        Self {
            stale_after,
            touch_interval: (stale_after / 2).max(Duration::from_millis(10)),
        }
    }
}

#[derive(Debug)]
pub struct ProfileLock {
    path: PathBuf,
    guard_path: PathBuf,
    timings: LockTimings,
    // Contents written on acquire. The file is ours only while it still
    // reads back exactly this.
    owner_stamp: Option<String>,
}

impl ProfileLock {
    pub fn for_profile(profile_dir: &Path) -> Self {
        Self::new(profile_dir.join(LOCK_FILE_NAME), LockTimings::default())
    }

    pub fn new(path: impl Into<PathBuf>, timings: LockTimings) -> Self {
        let path = path.into();
        let mut guard_name = path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_else(|| OsString::from(LOCK_FILE_NAME));
        guard_name.push(".guard");
        let guard_path = path.with_file_name(guard_name);
        Self {
            path,
            guard_path,
            timings,
            owner_stamp: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn timings(&self) -> LockTimings {
        self.timings
    }

    pub fn is_held(&self) -> bool {
        self.owner_stamp.is_some()
    }

    /// Returns `Ok(false)` when another live process owns the profile.
    pub fn acquire(&mut self) -> Result<bool, ProfileLockError> {
        if self.owner_stamp.is_some() {
            return Ok(true);
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let guard = self.lock_guard()?;
        let claimed = self.claim_if_stale();
        let _ = guard.unlock();

        self.owner_stamp = claimed?;
        Ok(self.owner_stamp.is_some())
    }

    fn lock_guard(&self) -> Result<File, ProfileLockError> {
        let guard = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.guard_path)?;
        guard
            .lock_exclusive()
            .map_err(|source| ProfileLockError::Guard {
                path: self.guard_path.clone(),
                source,
            })?;
        Ok(guard)
    }

    fn claim_if_stale(&self) -> Result<Option<String>, ProfileLockError> {
        match lock_age(&self.path) {
            Ok(age) if age <= self.timings.stale_after => return Ok(None),
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(ProfileLockError::Inspect {
                    path: self.path.clone(),
                    source,
                })
            }
        }

        let stamp = format!(
            "owner_pid={}\nacquired_at={}\ntoken={}\n",
            std::process::id(),
            Utc::now().to_rfc3339(),
            Uuid::new_v4().simple()
        );
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)?;
        file.write_all(stamp.as_bytes())?;
        file.flush()?;
        file.set_modified(SystemTime::now())?;
        Ok(Some(stamp))
    }

    fn still_owned(&self, stamp: &str) -> io::Result<bool> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => Ok(contents == stamp),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Refreshes the mtime. Returns `Ok(false)` once the file no longer
    /// carries this process's stamp; the lock then counts as lost.
    pub fn touch(&mut self) -> Result<bool, ProfileLockError> {
        let Some(stamp) = self.owner_stamp.clone() else {
            return Ok(false);
        };
        let guard = self.lock_guard()?;
        let touched = self.still_owned(&stamp).and_then(|owned| {
            if owned {
                OpenOptions::new()
                    .write(true)
                    .open(&self.path)?
                    .set_modified(SystemTime::now())?;
            }
            Ok(owned)
        });
        let _ = guard.unlock();

        let touched = touched?;
        if !touched {
            self.owner_stamp = None;
        }
        Ok(touched)
    }

    /// Removes the lock file if it is still ours. Returns whether a file was
    /// removed. Synchronous so it can run while the process is being torn
    /// down.
    pub fn release(&mut self) -> Result<bool, ProfileLockError> {
        let Some(stamp) = self.owner_stamp.take() else {
            return Ok(false);
        };
        let guard = self.lock_guard()?;
        let removed = self.still_owned(&stamp).and_then(|owned| {
            if !owned {
                return Ok(false);
            }
            match fs::remove_file(&self.path) {
                Ok(()) => Ok(true),
                Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
                Err(err) => Err(err),
            }
        });
        let _ = guard.unlock();
        removed.map_err(ProfileLockError::from)
    }
}

impl Drop for ProfileLock {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

pub fn lock_age(path: &Path) -> io::Result<Duration> {
    let modified = fs::metadata(path)?.modified()?;
    Ok(SystemTime::now()
        .duration_since(modified)
        .unwrap_or(Duration::ZERO))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile_dir(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        std::env::temp_dir().join(format!("appvisor-lock-test-{name}-{nanos}"))
    }

    #[test]
    fn first_acquire_wins_and_second_is_refused() {
        let dir = profile_dir("contended");
        let mut first = ProfileLock::for_profile(&dir);
        let mut second = ProfileLock::for_profile(&dir);

        assert!(first.acquire().expect("first acquire"));
        assert!(!second.acquire().expect("second acquire"));
        assert!(first.is_held());
        assert!(!second.is_held());

        first.release().expect("release");
        assert!(!first.path().exists());
        assert!(second.acquire().expect("acquire after release"));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn stale_lock_file_is_taken_over() {
        let dir = profile_dir("stale");
        fs::create_dir_all(&dir).expect("create dir");
        let path = dir.join(LOCK_FILE_NAME);
        let file = File::create(&path).expect("create lock file");
        file.set_modified(SystemTime::now() - Duration::from_secs(60))
            .expect("backdate lock file");
        drop(file);

        let mut lock = ProfileLock::for_profile(&dir);
        assert!(lock.acquire().expect("acquire stale"));
        assert!(lock_age(&path).expect("lock age") < Duration::from_secs(5));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn touch_refreshes_mtime_only_when_held() {
        let dir = profile_dir("touch");
        let mut lock = ProfileLock::new(
            dir.join(LOCK_FILE_NAME),
            LockTimings::with_stale_after(Duration::from_secs(30)),
        );
        assert!(!lock.touch().expect("touch without holding"));
        assert!(!lock.path().exists());

        assert!(lock.acquire().expect("acquire"));
        File::options()
            .write(true)
            .open(lock.path())
            .expect("open")
            .set_modified(SystemTime::now() - Duration::from_secs(20))
            .expect("backdate");
        assert!(lock.touch().expect("touch"));
        assert!(lock_age(lock.path()).expect("age") < Duration::from_secs(5));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn release_is_idempotent_and_drop_cleans_up() {
        let dir = profile_dir("drop");
        let path = dir.join(LOCK_FILE_NAME);
        {
            let mut lock = ProfileLock::for_profile(&dir);
            assert!(lock.acquire().expect("acquire"));
            assert!(path.exists());
        }
        assert!(!path.exists());

        let mut lock = ProfileLock::for_profile(&dir);
        assert!(!lock.release().expect("release without holding"));
        assert!(lock.acquire().expect("acquire"));
        assert!(lock.release().expect("first release"));
        assert!(!lock.release().expect("second release"));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn superseded_holder_leaves_new_owner_file_alone() {
        let dir = profile_dir("takeover");
        let mut first = ProfileLock::for_profile(&dir);
        assert!(first.acquire().expect("first acquire"));
        File::options()
            .write(true)
            .open(first.path())
            .expect("open")
            .set_modified(SystemTime::now() - Duration::from_secs(60))
            .expect("backdate");

        let mut second = ProfileLock::for_profile(&dir);
        assert!(second.acquire().expect("takeover"));
        assert!(first.is_held());

        assert!(!first.touch().expect("stale touch"));
        assert!(!first.is_held());
        assert!(!first.release().expect("stale release"));
        assert!(second.path().exists());
        assert!(second.touch().expect("owner touch"));

        assert!(second.release().expect("owner release"));
        assert!(!second.path().exists());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn release_after_takeover_without_touch_keeps_file() {
        let dir = profile_dir("takeover-release");
        let mut first = ProfileLock::for_profile(&dir);
        assert!(first.acquire().expect("first acquire"));
        File::options()
            .write(true)
            .open(first.path())
            .expect("open")
            .set_modified(SystemTime::now() - Duration::from_secs(60))
            .expect("backdate");
        let mut second = ProfileLock::for_profile(&dir);
        assert!(second.acquire().expect("takeover"));

        drop(first);
        assert!(second.path().exists());
        assert!(second.is_held());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn touch_interval_is_half_of_staleness() {
        let timings = LockTimings::default();
        assert_eq!(timings.stale_after, DEFAULT_STALE_AFTER);
        assert_eq!(timings.touch_interval, Duration::from_secs(5));
    }
}
