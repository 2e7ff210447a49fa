use appvisor_core::profile_lock::{ProfileLock, ProfileLockError};
use std::{
    path::PathBuf,
    sync::{Arc, Mutex},
};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Owns an acquired profile lock and keeps its mtime fresh until released.
#[derive(Debug)]
pub struct LockKeeper {
    lock: Arc<Mutex<ProfileLock>>,
    path: PathBuf,
    heartbeat: Option<JoinHandle<()>>,
}

impl LockKeeper {
    /// `Ok(None)` when another live process holds the lock.
    pub fn acquire(mut lock: ProfileLock) -> Result<Option<Self>, ProfileLockError> {
        if !lock.acquire()? {
            return Ok(None);
        }
        let path = lock.path().to_path_buf();
        let interval = lock.timings().touch_interval;
        let lock = Arc::new(Mutex::new(lock));

        let heartbeat_lock = lock.clone();
        let heartbeat_path = path.clone();
        let heartbeat = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let result = match heartbeat_lock.lock() {
                    Ok(mut guard) => guard.touch(),
                    Err(_) => break,
                };
                match result {
                    Ok(true) => {
                        debug!(event = "profile_lock_touch", path = %heartbeat_path.display())
                    }
                    Ok(false) => {
                        warn!(event = "profile_lock_lost", path = %heartbeat_path.display());
                        break;
                    }
                    Err(err) => warn!(
                        event = "profile_lock_touch_error",
                        path = %heartbeat_path.display(),
                        error = %err
                    ),
                }
            }
        });

        info!(event = "profile_lock_acquired", path = %path.display());
        Ok(Some(Self {
            lock,
            path,
            heartbeat: Some(heartbeat),
        }))
    }

    pub fn is_held(&self) -> bool {
        self.lock.lock().map(|guard| guard.is_held()).unwrap_or(false)
    }

    /// Stops touching and removes the lock file if it is still ours. Safe to
    /// call more than once.
    pub fn release(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
        let mut guard = match self.lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let was_held = guard.is_held();
        match guard.release() {
            Ok(true) => info!(event = "profile_lock_released", path = %self.path.display()),
            Ok(false) if was_held => {
                warn!(event = "profile_lock_lost", path = %self.path.display(), action = "release")
            }
            Ok(false) => {}
            Err(err) => warn!(
                event = "profile_lock_release_error",
                path = %self.path.display(),
                error = %err
            ),
        }
    }
}

impl Drop for LockKeeper {
    fn drop(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
    }
}
