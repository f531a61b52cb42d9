//! Filesystem backend
//!
//! Every key maps to two files inside a two-level hashed directory under the
//! synchronization directory:
//!
//! - `lock-<name>.lock`: a mutex; it exists while some process is reading or
//!   rewriting the status file.
//! - `lock-<name>.file`: the decimal status; absent means `0`.
//!
//! Status encoding: `0` free, `n > 0` readers, `-1` write, `-(1 + n)` for
//! `n` non-exclusive writers.
//!
//! Once the status file has been logically changed, a failure to write it or
//! to remove the mutex file would leave the key stuck for every process.
//! Such failures trigger the configured [`FailStopPolicy`].

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use super::{GlobalLock, LockBackend, safe_name};
use crate::common::{CoordError, FailStopPolicy, LockMode, Result, now_millis};
use crate::interrupt::Interrupt;

const STATUS_WRITE_LOCKED: i32 = -1;

/// Hash a key the way every process sharing the directory must, independent of
/// the process-local hasher seeds.
fn stable_hash(key: &str) -> i32 {
    key.encode_utf16()
        .fold(0i32, |hash, unit| hash.wrapping_mul(31).wrapping_add(i32::from(unit)))
}

/// Directory holding the files for `key`
fn hashed_dir(root: &Path, key: &str) -> PathBuf {
    let hash = stable_hash(key);
    let outer = hash & 1023;
    let inner = (hash >> 10) & 1023;
    root.join(outer.to_string()).join(inner.to_string())
}

#[derive(Debug)]
struct FileShared {
    fail_stop: FailStopPolicy,
    poisoned: AtomicBool,
    retry_sleep: Duration,
    mutex_backoff: Duration,
}

impl FileShared {
    fn check_healthy(&self) -> Result<()> {
        if self.poisoned.load(Ordering::Acquire) {
            return Err(CoordError::setup(
                "file lock backend is unhealthy after an unrecoverable lock file failure",
            ));
        }
        Ok(())
    }

    /// Handle a failure that would leave lock files inconsistent
    fn fail_stop(&self, message: String, err: std::io::Error) -> CoordError {
        log::error!("{message}: {err}");
        match self.fail_stop {
            FailStopPolicy::Exit => std::process::exit(-100),
            FailStopPolicy::Poison => {
                self.poisoned.store(true, Ordering::Release);
                CoordError::Setup {
                    message,
                    source: Some(Box::new(err)),
                }
            }
        }
    }
}

/// Cross-process state of a single key
#[derive(Debug)]
pub struct FileGlobalLock {
    mutex_path: PathBuf,
    status_path: PathBuf,
    shared: Arc<FileShared>,
}

/// Holds the mutex file; it must be handed back through [`FileGlobalLock::unlock`]
struct MutexHeld;

impl FileGlobalLock {
    /// Create the mutex file. `Ok(None)` means another process holds it.
    fn try_lock(&self) -> Result<Option<MutexHeld>> {
        loop {
            self.shared.check_healthy()?;
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.mutex_path)
            {
                Ok(_) => return Ok(Some(MutexHeld)),
                Err(e) if e.kind() == IoErrorKind::AlreadyExists => return Ok(None),
                Err(e) if e.kind() == IoErrorKind::Interrupted => {
                    return Err(CoordError::Interrupted {
                        message: format!("creating '{}'", self.mutex_path.display()),
                        source: Some(Box::new(e)),
                    });
                }
                Err(e) => {
                    log::warn!(
                        "Attempt to set file lock '{}' failed: {e}",
                        self.mutex_path.display()
                    );
                    std::thread::sleep(self.shared.mutex_backoff);
                }
            }
        }
    }

    /// Wait for the mutex file, for operations that must eventually run
    fn lock(&self, interrupt: &Interrupt) -> Result<MutexHeld> {
        loop {
            if let Some(held) = self.try_lock()? {
                return Ok(held);
            }
            interrupt.sleep(self.shared.retry_sleep)?;
        }
    }

    fn unlock(&self, _held: MutexHeld) -> Result<()> {
        fs::remove_file(&self.mutex_path).map_err(|e| {
            self.shared.fail_stop(
                format!("Failure deleting file lock '{}'", self.mutex_path.display()),
                e,
            )
        })
    }

    fn read_status(&self) -> Result<i32> {
        match fs::read_to_string(&self.status_path) {
            Ok(text) => text.trim().parse::<i32>().map_err(|e| {
                CoordError::general(format!(
                    "Lock number read from '{}' was not valid: {e}",
                    self.status_path.display()
                ))
            }),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(0),
            Err(e) => {
                log::error!(
                    "Could not read from lock file '{}': {e}",
                    self.status_path.display()
                );
                Err(e.into())
            }
        }
    }

    fn write_status(&self, status: i32) -> Result<()> {
        let result = if status == 0 {
            match fs::remove_file(&self.status_path) {
                Err(e) if e.kind() == IoErrorKind::NotFound => Ok(()),
                other => other,
            }
        } else {
            fs::write(&self.status_path, status.to_string())
        };
        result.map_err(|e| {
            self.shared.fail_stop(
                format!("Couldn't write to lock file '{}'", self.status_path.display()),
                e,
            )
        })
    }

    /// Run `f` on the status with the mutex held; the mutex is always released.
    /// When `read_first` is false `f` sees `0` and the status file is not read.
    fn with_status<T>(
        &self,
        held: MutexHeld,
        read_first: bool,
        f: impl FnOnce(i32) -> Result<(Option<i32>, T)>,
    ) -> Result<T> {
        let current = if read_first { self.read_status() } else { Ok(0) };
        let outcome = current.and_then(f).and_then(|(next, value)| {
            if let Some(status) = next {
                self.write_status(status)?;
            }
            Ok(value)
        });
        let unlocked = self.unlock(held);
        let value = outcome?;
        unlocked?;
        Ok(value)
    }
}

impl GlobalLock for FileGlobalLock {
    fn try_obtain(&self, mode: LockMode, _interrupt: &Interrupt) -> Result<bool> {
        let Some(held) = self.try_lock()? else {
            return Ok(false);
        };
        self.with_status(held, true, |status| {
            let next = match mode {
                LockMode::Write if status == 0 => Some(STATUS_WRITE_LOCKED),
                LockMode::NonExWrite if status == 0 => Some(STATUS_WRITE_LOCKED - 1),
                LockMode::NonExWrite if status < STATUS_WRITE_LOCKED => Some(status - 1),
                LockMode::Read if status >= 0 => Some(status + 1),
                _ => None,
            };
            Ok((next, next.is_some()))
        })
    }

    fn release(&self, mode: LockMode, interrupt: &Interrupt) -> Result<()> {
        let held = self.lock(interrupt)?;
        let path = self.status_path.display().to_string();
        self.with_status(held, mode != LockMode::Write, |status| {
            let next = match mode {
                LockMode::Write => 0,
                LockMode::NonExWrite => {
                    if status >= STATUS_WRITE_LOCKED {
                        return Err(CoordError::general(format!(
                            "File lock '{path}' is not in expected state {status} for non-exclusive write release"
                        )));
                    }
                    let next = status + 1;
                    if next == STATUS_WRITE_LOCKED { 0 } else { next }
                }
                LockMode::Read => {
                    if status <= 0 {
                        return Err(CoordError::general(format!(
                            "File lock '{path}' is not in expected state {status} for read release"
                        )));
                    }
                    status - 1
                }
            };
            Ok((Some(next), ()))
        })
    }
}

/// Backend sharing locks, flags and data through a synchronization directory
#[derive(Debug)]
pub struct FileLockBackend {
    sync_dir: PathBuf,
    shared: Arc<FileShared>,
    active_ttl: Duration,
    /// Active markers written by this process, with their file paths
    owned_active: Mutex<HashMap<String, PathBuf>>,
}

impl FileLockBackend {
    pub fn new(
        sync_dir: impl AsRef<Path>,
        fail_stop: FailStopPolicy,
        retry_sleep: Duration,
        mutex_backoff: Duration,
        active_ttl: Duration,
    ) -> Result<Self> {
        let sync_dir = sync_dir.as_ref().to_path_buf();
        fs::create_dir_all(&sync_dir).map_err(|e| CoordError::Setup {
            message: format!(
                "cannot create synchronization directory '{}'",
                sync_dir.display()
            ),
            source: Some(Box::new(e)),
        })?;
        log::info!("File lock backend using '{}'", sync_dir.display());
        Ok(Self {
            sync_dir,
            shared: Arc::new(FileShared {
                fail_stop,
                poisoned: AtomicBool::new(false),
                retry_sleep,
                mutex_backoff,
            }),
            active_ttl,
            owned_active: Mutex::new(HashMap::new()),
        })
    }

    pub fn sync_dir(&self) -> &Path {
        &self.sync_dir
    }

    /// Whether an unrecoverable failure has disabled this backend
    pub fn is_poisoned(&self) -> bool {
        self.shared.poisoned.load(Ordering::Acquire)
    }

    /// Path of a resource file, creating its directory
    fn resource_path(&self, prefix: &str, name: &str, suffix: &str) -> Result<PathBuf> {
        self.shared.check_healthy()?;
        let dir = hashed_dir(&self.sync_dir, name);
        fs::create_dir_all(&dir)?;
        Ok(dir.join(format!("{prefix}-{}{suffix}", safe_name(name))))
    }

    fn write_marker(path: &Path) -> Result<()> {
        fs::write(path, now_millis().to_string())?;
        Ok(())
    }
}

impl LockBackend for FileLockBackend {
    fn name(&self) -> &'static str {
        "file"
    }

    fn global_lock(&self, key: &str) -> Result<Box<dyn GlobalLock>> {
        Ok(Box::new(FileGlobalLock {
            mutex_path: self.resource_path("lock", key, ".lock")?,
            status_path: self.resource_path("lock", key, ".file")?,
            shared: self.shared.clone(),
        }))
    }

    fn set_flag(&self, name: &str) -> Result<()> {
        fs::write(self.resource_path("flag", name, ".file")?, b"")?;
        Ok(())
    }

    fn clear_flag(&self, name: &str) -> Result<()> {
        match fs::remove_file(self.resource_path("flag", name, ".file")?) {
            Err(e) if e.kind() != IoErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn check_flag(&self, name: &str) -> Result<bool> {
        Ok(self.resource_path("flag", name, ".file")?.exists())
    }

    fn read_data(&self, name: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.resource_path("data", name, ".file")?) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_data(&self, name: &str, data: Option<&[u8]>) -> Result<()> {
        let path = self.resource_path("data", name, ".file")?;
        match data {
            Some(bytes) => fs::write(path, bytes)?,
            None => match fs::remove_file(path) {
                Err(e) if e.kind() != IoErrorKind::NotFound => return Err(e.into()),
                _ => {}
            },
        }
        Ok(())
    }

    fn set_active(&self, name: &str) -> Result<()> {
        let path = self.resource_path("active", name, ".file")?;
        Self::write_marker(&path)?;
        self.owned_active.lock().insert(name.to_string(), path);
        Ok(())
    }

    fn clear_active(&self, name: &str) -> Result<()> {
        self.owned_active.lock().remove(name);
        match fs::remove_file(self.resource_path("active", name, ".file")?) {
            Err(e) if e.kind() != IoErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    /// A marker is live if this process owns it or its heartbeat is recent
    fn check_active(&self, name: &str) -> Result<bool> {
        if self.owned_active.lock().contains_key(name) {
            return Ok(true);
        }
        let path = self.resource_path("active", name, ".file")?;
        let stamp = match fs::read_to_string(&path) {
            Ok(text) => text.trim().parse::<u64>().unwrap_or(0),
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let age = now_millis().saturating_sub(stamp);
        Ok(age < self.active_ttl.as_millis() as u64)
    }

    fn heartbeat(&self) -> Result<()> {
        let owned: Vec<PathBuf> = self.owned_active.lock().values().cloned().collect();
        for path in owned {
            Self::write_marker(&path)?;
        }
        Ok(())
    }
}
