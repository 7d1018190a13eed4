//! Keyed registry of live sessions.
//!
//! At most one session runs per [`SessionKey`]; a second request under a busy
//! key is refused rather than queued.  Response frames from the system app are
//! offered to each live session in key order until one claims it.  A reboot
//! frame additionally aborts every live session and is announced upstream once.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use nanohub_core::protocol::commands::{status, HubRequestType, SystemCommand};
use nanohub_core::protocol::records::NanohubRsp;
use nanohub_core::{HubMessage, MessageView, SYSTEM_APP_ID};
use tracing::{debug, info, warn};

use crate::application::app_info::AppInfoSession;
use crate::application::app_mgmt::AppMgmtSession;
use crate::application::key_info::KeyInfoSession;
use crate::application::link::{HubLink, HubRequest};
use crate::application::mem_info::MemInfoSession;
use crate::application::session::{RxOutcome, SessionError, SessionKey};

/// One of the concrete session types.
#[derive(Clone)]
pub enum SessionKind {
    AppInfo(Arc<AppInfoSession>),
    MemInfo(Arc<MemInfoSession>),
    KeyInfo(Arc<KeyInfoSession>),
    AppMgmt(Arc<AppMgmtSession>),
}

impl SessionKind {
    pub fn name(&self) -> &'static str {
        match self {
            SessionKind::AppInfo(_) => "app-info",
            SessionKind::MemInfo(_) => "mem-info",
            SessionKind::KeyInfo(_) => "key-info",
            SessionKind::AppMgmt(_) => "app-mgmt",
        }
    }

    pub fn is_running(&self) -> bool {
        match self {
            SessionKind::AppInfo(s) => s.core().is_running(),
            SessionKind::MemInfo(s) => s.core().is_running(),
            SessionKind::KeyInfo(s) => s.core().is_running(),
            SessionKind::AppMgmt(s) => s.core().is_running(),
        }
    }

    pub fn abort(&self, status: i32) {
        match self {
            SessionKind::AppInfo(s) => s.core().abort(status),
            SessionKind::MemInfo(s) => s.core().abort(status),
            SessionKind::KeyInfo(s) => s.core().abort(status),
            SessionKind::AppMgmt(s) => s.core().abort(status),
        }
    }

    fn setup(&self, request: &HubRequest) -> Result<(), SessionError> {
        match self {
            SessionKind::AppInfo(s) => s.setup(),
            SessionKind::MemInfo(s) => s.setup(),
            SessionKind::KeyInfo(s) => s.setup(),
            SessionKind::AppMgmt(s) => s.setup(request),
        }
    }

    fn handle_rx(&self, payload: &[u8]) -> Result<RxOutcome, SessionError> {
        match self {
            SessionKind::AppInfo(s) => s.handle_rx(payload),
            SessionKind::MemInfo(s) => s.handle_rx(payload),
            SessionKind::KeyInfo(s) => s.handle_rx(payload),
            SessionKind::AppMgmt(s) => s.handle_rx(payload),
        }
    }
}

pub struct SessionManager {
    sessions: Mutex<BTreeMap<SessionKey, SessionKind>>,
    link: Arc<dyn HubLink>,
}

impl SessionManager {
    pub fn new(link: Arc<dyn HubLink>) -> Self {
        Self {
            sessions: Mutex::new(BTreeMap::new()),
            link,
        }
    }

    // Entries are only inserted or removed whole, so the map stays consistent
    // even if a holder panicked.
    fn lock(&self) -> MutexGuard<'_, BTreeMap<SessionKey, SessionKind>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts `session` under `key` unless another session is live there.
    ///
    /// Finished entries are pruned first.  A session whose setup fails is
    /// aborted with the failure status and not registered.
    ///
    /// # Errors
    ///
    /// [`SessionError::Busy`] if `key` is taken, or the setup error.
    pub fn setup_and_add(
        &self,
        key: SessionKey,
        session: SessionKind,
        request: &HubRequest,
    ) -> Result<(), SessionError> {
        let mut sessions = self.lock();
        sessions.retain(|k, s| {
            let live = s.is_running();
            if !live {
                debug!(key = ?k, session = s.name(), "pruning finished session");
            }
            live
        });

        if let Some(current) = sessions.get(&key) {
            debug!(?key, running = current.name(), "session key busy");
            return Err(SessionError::Busy);
        }

        if let Err(e) = session.setup(request) {
            warn!(?key, session = session.name(), "session setup failed: {e}");
            session.abort(e.status());
            return Err(e);
        }
        debug!(?key, session = session.name(), "session started");
        sessions.insert(key, session);
        Ok(())
    }

    /// Offers a system-app payload to the live sessions.
    ///
    /// The first session that does not answer [`RxOutcome::NotMine`] owns the
    /// frame; if it fails, it is aborted with the failure status and the error
    /// is returned.  A reboot frame is then broadcast whether or not a session
    /// claimed it.
    pub fn handle_rx(&self, payload: &[u8]) -> Result<RxOutcome, SessionError> {
        let sessions = self.lock();

        let mut result = Ok(RxOutcome::NotMine);
        for (key, session) in sessions.iter() {
            if !session.is_running() {
                continue;
            }
            match session.handle_rx(payload) {
                Ok(RxOutcome::NotMine) => continue,
                Ok(RxOutcome::Handled) => {
                    result = Ok(RxOutcome::Handled);
                    break;
                }
                Err(e) => {
                    warn!(?key, session = session.name(), "aborting session: {e}");
                    session.abort(e.status());
                    result = Err(e);
                    break;
                }
            }
        }

        let rsp = NanohubRsp::parse(&mut MessageView::new(payload), false);
        if rsp.cmd == SystemCommand::Reboot.as_u8() {
            info!(status = rsp.status, "hub rebooted, aborting live sessions");
            for (key, session) in sessions.iter().filter(|(_, s)| s.is_running()) {
                debug!(?key, session = session.name(), "aborted by reboot");
                session.abort(status::EINTR);
            }
            self.link.send_to_app(HubMessage::with_result(
                SYSTEM_APP_ID,
                HubRequestType::OsReboot.as_u32(),
                rsp.status,
            ));
            if result == Ok(RxOutcome::NotMine) {
                result = Ok(RxOutcome::Handled);
            }
        }

        result
    }

    /// Keys with a session still running.
    pub fn live_keys(&self) -> Vec<SessionKey> {
        self.lock()
            .iter()
            .filter(|(_, s)| s.is_running())
            .map(|(k, _)| *k)
            .collect()
    }
}
