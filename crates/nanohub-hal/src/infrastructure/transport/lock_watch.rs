//! Pauses device reads while another process holds the hub lock.
//!
//! Tools that reflash the hub create a lock file in a well-known directory and
//! expect the HAL to stop reading until it is removed.  [`LockWatch`] watches
//! that directory with the `notify` crate (inotify on Linux).  Events are only
//! used as a hint to re-check the file: the check itself is a plain existence
//! test, so a missed event costs at most one bounded park.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tracing::{info, trace, warn};

/// Error type for lock watch setup.
#[derive(Debug, Error)]
pub enum LockWatchError {
    /// The lock directory did not exist and could not be created.
    #[error("could not create lock directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The OS watcher could not be initialised or attached.
    #[error("could not watch {path}: {source}")]
    Watch {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
}

#[derive(Debug)]
enum Signal {
    Fs(notify::Result<Event>),
    Wake,
}

/// Watches the lock directory for the lock file.
pub struct LockWatch {
    _watcher: RecommendedWatcher,
    signals: mpsc::Receiver<Signal>,
    waker: mpsc::Sender<Signal>,
    lock_path: PathBuf,
}

impl std::fmt::Debug for LockWatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockWatch")
            .field("lock_path", &self.lock_path)
            .finish_non_exhaustive()
    }
}

/// Interrupts a [`LockWatch::wait_while_locked`] park from another thread.
#[derive(Debug, Clone)]
pub struct LockWaker(mpsc::Sender<Signal>);

impl LockWaker {
    pub fn wake(&self) {
        // A closed channel means the watch is gone and nobody is parked.
        let _ = self.0.send(Signal::Wake);
    }
}

impl LockWatch {
    /// Creates `dir` if needed and starts watching it for `file`.
    ///
    /// # Errors
    ///
    /// [`LockWatchError`] if the directory cannot be created or watched.
    pub fn new(dir: &Path, file: &str) -> Result<Self, LockWatchError> {
        std::fs::create_dir_all(dir).map_err(|source| LockWatchError::CreateDir {
            path: dir.to_path_buf(),
            source,
        })?;

        let (tx, rx) = mpsc::channel();
        let fs_tx = tx.clone();
        let mut watcher = notify::recommended_watcher(move |res| {
            let _ = fs_tx.send(Signal::Fs(res));
        })
        .map_err(|source| LockWatchError::Watch {
            path: dir.to_path_buf(),
            source,
        })?;
        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(|source| LockWatchError::Watch {
                path: dir.to_path_buf(),
                source,
            })?;

        Ok(Self {
            _watcher: watcher,
            signals: rx,
            waker: tx,
            lock_path: dir.join(file),
        })
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    pub fn is_locked(&self) -> bool {
        self.lock_path.exists()
    }

    pub fn waker(&self) -> LockWaker {
        LockWaker(self.waker.clone())
    }

    /// Blocks while the lock file exists, re-checking on every directory
    /// event and at least every `max_park`.
    ///
    /// Returns `false` if `running` was cleared while parked, `true` once the
    /// lock is gone.
    pub fn wait_while_locked(&self, running: &AtomicBool, max_park: Duration) -> bool {
        // Events from before this check carry no information.
        while self.signals.try_recv().is_ok() {}

        let mut parked = false;
        while self.is_locked() {
            if !running.load(Ordering::Acquire) {
                return false;
            }
            if !parked {
                warn!(path = %self.lock_path.display(), "hub is locked, pausing reads");
                parked = true;
            }
            match self.signals.recv_timeout(max_park) {
                Ok(Signal::Fs(Ok(event))) => trace!(?event.kind, "lock directory changed"),
                Ok(Signal::Fs(Err(e))) => warn!("lock watch error: {e}"),
                Ok(Signal::Wake) => {}
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    warn!("lock watch channel closed, polling the lock file");
                    std::thread::sleep(max_park);
                }
            }
        }
        if parked {
            info!("hub unlocked, resuming reads");
        }
        running.load(Ordering::Acquire)
    }
}
