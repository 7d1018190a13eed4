//! Session life-cycle shared by every system-app operation.
//!
//! # What is a session? (for beginners)
//!
//! Most firmware-management operations take several request/response round
//! trips: the app list is fetched one page at a time, an app image is uploaded
//! in chunks.  A *session* is the object that remembers where such an exchange
//! is.  A foreground caller starts it with `setup`, the poll thread feeds it
//! response frames through `handle_rx`, and the caller may block in
//! [`SessionCore::wait`] until it finishes.
//!
//! ```text
//!  Init ──setup──► Running(state) ──handle_rx──► Running(next) ─ ... ─► Done
//!                        │                                              ▲
//!                        └────────────────── abort(status) ─────────────┘
//! ```
//!
//! # Locking
//!
//! Each session owns two locks.  The protocol lock (inside the concrete
//! session) serialises `setup` and `handle_rx` bodies.  The life-cycle lock in
//! [`SessionCore`] guards only the phase and the final status, so a waiter
//! never contends with protocol handling.  Lock order is always
//! manager → protocol → life-cycle.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use nanohub_core::protocol::commands::{status, HubRequestType};
use thiserror::Error;

/// Identifies a class of mutually-exclusive operations.
///
/// Load, unload, enable, disable, and reboot share [`SessionKey::LoadApp`]
/// because they all mutate the hub's app table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SessionKey {
    LoadApp,
    QueryApps,
    QueryMemory,
}

impl SessionKey {
    /// The key a request type is serialised under.
    pub fn for_request(request: HubRequestType) -> Self {
        match request {
            HubRequestType::QueryApps => SessionKey::QueryApps,
            HubRequestType::QueryMemory => SessionKey::QueryMemory,
            HubRequestType::AppsEnable
            | HubRequestType::AppsDisable
            | HubRequestType::LoadApp
            | HubRequestType::UnloadApp
            | HubRequestType::OsReboot => SessionKey::LoadApp,
        }
    }
}

/// Result of offering a response frame to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxOutcome {
    /// The session consumed the frame.
    Handled,
    /// The frame belongs to someone else; try the next session.
    NotMine,
}

/// Failures raised by sessions and the session manager.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// A session is already running under the requested key.
    #[error("operation busy: a session is already running")]
    Busy,

    /// The request was malformed or of an unknown type.
    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),

    /// A known response carried a payload of the wrong size.
    #[error("malformed {what} response: expected {expected} bytes, got {actual}")]
    BadLength {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    /// A response arrived while the session was not expecting one.
    #[error("response received by an idle session")]
    NotRunning,

    /// Writing to the device failed with the given status.
    #[error("device write failed (status {0})")]
    Link(i32),

    /// The session was aborted with the given status.
    #[error("session aborted (status {0})")]
    Aborted(i32),
}

impl SessionError {
    /// Negative errno-style status reported upstream.
    pub fn status(&self) -> i32 {
        match self {
            SessionError::Busy => status::EBUSY,
            SessionError::InvalidRequest(_)
            | SessionError::BadLength { .. }
            | SessionError::NotRunning => status::EINVAL,
            SessionError::Link(code) | SessionError::Aborted(code) => *code,
        }
    }
}

/// Coarse session phase; `S` is the session's own state enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase<S> {
    Init,
    Running(S),
    Done,
}

#[derive(Debug)]
struct Lifecycle<S> {
    phase: Phase<S>,
    status: i32,
}

/// Phase, final status, and the completion condvar of one session.
#[derive(Debug)]
pub struct SessionCore<S> {
    lifecycle: Mutex<Lifecycle<S>>,
    done: Condvar,
}

impl<S: Copy> Default for SessionCore<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Copy> SessionCore<S> {
    pub fn new() -> Self {
        Self {
            lifecycle: Mutex::new(Lifecycle {
                phase: Phase::Init,
                status: 0,
            }),
            done: Condvar::new(),
        }
    }

    // Phase and status are plain values, so a poisoned guard is still usable.
    fn lock(&self) -> MutexGuard<'_, Lifecycle<S>> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn phase(&self) -> Phase<S> {
        self.lock().phase
    }

    /// The operation-specific state, or `None` when not running.
    pub fn state(&self) -> Option<S> {
        match self.lock().phase {
            Phase::Running(state) => Some(state),
            Phase::Init | Phase::Done => None,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self.lock().phase, Phase::Running(_))
    }

    /// Final status of the last run; `0` unless it was aborted.
    pub fn status(&self) -> i32 {
        self.lock().status
    }

    /// Re-arms the session in `state` and clears the previous status.
    pub fn start(&self, state: S) {
        let mut lifecycle = self.lock();
        lifecycle.phase = Phase::Running(state);
        lifecycle.status = 0;
    }

    /// Moves a running session to `state`; ignored once done.
    pub fn set_state(&self, state: S) {
        let mut lifecycle = self.lock();
        if let Phase::Running(_) = lifecycle.phase {
            lifecycle.phase = Phase::Running(state);
        }
    }

    /// Marks the session done and wakes every waiter.  Idempotent.
    pub fn complete(&self) {
        let mut lifecycle = self.lock();
        if !matches!(lifecycle.phase, Phase::Done) {
            lifecycle.phase = Phase::Done;
            self.done.notify_all();
        }
    }

    /// Records `status` and completes, if the session is still running.
    pub fn abort(&self, status: i32) {
        let mut lifecycle = self.lock();
        if let Phase::Running(_) = lifecycle.phase {
            lifecycle.status = status;
            lifecycle.phase = Phase::Done;
            self.done.notify_all();
        }
    }

    /// Blocks until the session is no longer running and returns its status.
    pub fn wait(&self) -> i32 {
        let mut lifecycle = self.lock();
        while let Phase::Running(_) = lifecycle.phase {
            lifecycle = self
                .done
                .wait(lifecycle)
                .unwrap_or_else(PoisonError::into_inner);
        }
        lifecycle.status
    }

    /// Like [`SessionCore::wait`] but gives up after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<i32> {
        let lifecycle = self.lock();
        let (lifecycle, result) = self
            .done
            .wait_timeout_while(lifecycle, timeout, |l| matches!(l.phase, Phase::Running(_)))
            .unwrap_or_else(PoisonError::into_inner);
        if result.timed_out() && matches!(lifecycle.phase, Phase::Running(_)) {
            return None;
        }
        Some(lifecycle.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum TestState {
        First,
        Second,
    }

    #[test]
    fn test_new_core_is_idle() {
        let core: SessionCore<TestState> = SessionCore::new();
        assert_eq!(core.phase(), Phase::Init);
        assert!(!core.is_running());
        assert_eq!(core.state(), None);
    }

    #[test]
    fn test_start_and_set_state_track_running_state() {
        // Arrange
        let core = SessionCore::new();

        // Act
        core.start(TestState::First);
        core.set_state(TestState::Second);

        // Assert
        assert!(core.is_running());
        assert_eq!(core.state(), Some(TestState::Second));
    }

    #[test]
    fn test_set_state_after_complete_is_ignored() {
        let core = SessionCore::new();
        core.start(TestState::First);
        core.complete();

        core.set_state(TestState::Second);

        assert_eq!(core.phase(), Phase::Done);
    }

    #[test]
    fn test_complete_is_idempotent_and_keeps_status() {
        let core = SessionCore::new();
        core.start(TestState::First);
        core.abort(status::EIO);

        core.complete();
        core.complete();

        assert_eq!(core.phase(), Phase::Done);
        assert_eq!(core.status(), status::EIO);
    }

    #[test]
    fn test_abort_on_finished_session_does_not_overwrite_status() {
        let core = SessionCore::new();
        core.start(TestState::First);
        core.complete();

        core.abort(status::EINTR);

        assert_eq!(core.status(), 0);
    }

    #[test]
    fn test_start_clears_previous_abort_status() {
        let core = SessionCore::new();
        core.start(TestState::First);
        core.abort(status::EINTR);

        core.start(TestState::First);

        assert_eq!(core.status(), 0);
        assert!(core.is_running());
    }

    #[test]
    fn test_wait_blocks_until_abort_from_other_thread() {
        // Arrange
        let core = Arc::new(SessionCore::new());
        core.start(TestState::First);
        let waiter = {
            let core = Arc::clone(&core);
            thread::spawn(move || core.wait())
        };

        // Act
        thread::sleep(Duration::from_millis(20));
        core.abort(status::EINTR);

        // Assert
        assert_eq!(waiter.join().unwrap(), status::EINTR);
    }

    #[test]
    fn test_wait_on_idle_session_returns_immediately() {
        let core: SessionCore<TestState> = SessionCore::new();
        assert_eq!(core.wait(), 0);
    }

    #[test]
    fn test_wait_timeout_expires_while_running() {
        let core = SessionCore::new();
        core.start(TestState::First);

        assert_eq!(core.wait_timeout(Duration::from_millis(10)), None);

        core.complete();
        assert_eq!(core.wait_timeout(Duration::from_millis(10)), Some(0));
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(SessionError::Busy.status(), status::EBUSY);
        assert_eq!(SessionError::InvalidRequest("x").status(), status::EINVAL);
        assert_eq!(SessionError::NotRunning.status(), status::EINVAL);
        assert_eq!(SessionError::Link(status::ENODEV).status(), status::ENODEV);
        assert_eq!(SessionError::Aborted(status::EINTR).status(), status::EINTR);
    }

    #[test]
    fn test_all_mutating_requests_share_one_key() {
        let keys: Vec<_> = [
            HubRequestType::AppsEnable,
            HubRequestType::AppsDisable,
            HubRequestType::LoadApp,
            HubRequestType::UnloadApp,
            HubRequestType::OsReboot,
        ]
        .into_iter()
        .map(SessionKey::for_request)
        .collect();

        assert!(keys.iter().all(|k| *k == SessionKey::LoadApp));
        assert_ne!(
            SessionKey::for_request(HubRequestType::QueryApps),
            SessionKey::for_request(HubRequestType::QueryMemory)
        );
    }
}
