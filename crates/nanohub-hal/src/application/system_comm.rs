//! Front door of the session engine.
//!
//! [`SystemComm`] owns one instance of each session and the
//! [`SessionManager`].  Outbound requests from the client come in through
//! [`SystemComm::handle_tx`]; response frames from the system app come in
//! through [`SystemComm::handle_rx`] on the poll thread.
//!
//! # Request routing
//!
//! | Message type                           | Key          | Session      |
//! |----------------------------------------|--------------|--------------|
//! | `QueryApps`                            | `QueryApps`  | app info     |
//! | `QueryMemory`                          | `QueryMemory`| memory info  |
//! | `LoadApp`                              | `LoadApp`    | key info, then app management |
//! | `AppsEnable`/`AppsDisable`/`UnloadApp`/`OsReboot` | `LoadApp` | app management |
//!
//! Requests for any app other than the system app bypass the sessions and go
//! straight to the device.

use std::sync::Arc;
use std::time::Duration;

use nanohub_core::protocol::commands::{HubRequestType, EVT_APP_FROM_HOST};
use nanohub_core::Frame;
use tracing::{debug, info, warn};

use crate::application::app_info::AppInfoSession;
use crate::application::app_mgmt::AppMgmtSession;
use crate::application::key_info::KeyInfoSession;
use crate::application::link::{HubLink, HubRequest};
use crate::application::mem_info::MemInfoSession;
use crate::application::session::{RxOutcome, SessionError, SessionKey};
use crate::application::session_manager::{SessionKind, SessionManager};

pub struct SystemComm {
    link: Arc<dyn HubLink>,
    manager: SessionManager,
    app_info: Arc<AppInfoSession>,
    mem_info: Arc<MemInfoSession>,
    key_info: Arc<KeyInfoSession>,
    app_mgmt: Arc<AppMgmtSession>,
}

impl SystemComm {
    pub fn new(link: Arc<dyn HubLink>) -> Self {
        Self {
            manager: SessionManager::new(Arc::clone(&link)),
            app_info: Arc::new(AppInfoSession::new(Arc::clone(&link))),
            mem_info: Arc::new(MemInfoSession::new(Arc::clone(&link))),
            key_info: Arc::new(KeyInfoSession::new(Arc::clone(&link))),
            app_mgmt: Arc::new(AppMgmtSession::new(Arc::clone(&link))),
            link,
        }
    }

    /// Routes an outbound request.
    ///
    /// Returns once the first request of the operation has been written;
    /// results arrive later as upstream messages.  A load blocks first while
    /// the signing keys are fetched, if they have not been already.
    ///
    /// # Errors
    ///
    /// [`SessionError::InvalidRequest`] for an unknown message type,
    /// [`SessionError::Busy`] when the operation's key is taken, the key fetch
    /// status if it was aborted, or any write failure.
    pub fn handle_tx(&self, request: &HubRequest) -> Result<(), SessionError> {
        if !request.app_id.is_system() {
            debug!(app_id = %request.app_id, len = request.payload.len(), "relaying to app");
            return self
                .link
                .send_to_device(request.app_id, &request.payload, EVT_APP_FROM_HOST);
        }

        let kind = HubRequestType::try_from(request.message_type).map_err(|()| {
            warn!(message_type = request.message_type, "unknown system request");
            SessionError::InvalidRequest("unknown message type")
        })?;
        let key = SessionKey::for_request(kind);

        match kind {
            HubRequestType::QueryApps => self.manager.setup_and_add(
                key,
                SessionKind::AppInfo(Arc::clone(&self.app_info)),
                request,
            ),
            HubRequestType::QueryMemory => self.manager.setup_and_add(
                key,
                SessionKind::MemInfo(Arc::clone(&self.mem_info)),
                request,
            ),
            HubRequestType::LoadApp => {
                self.ensure_keys(key, request)?;
                self.start_app_mgmt(key, request)
            }
            HubRequestType::AppsEnable
            | HubRequestType::AppsDisable
            | HubRequestType::UnloadApp
            | HubRequestType::OsReboot => self.start_app_mgmt(key, request),
        }
    }

    fn ensure_keys(&self, key: SessionKey, request: &HubRequest) -> Result<(), SessionError> {
        if self.key_info.have_keys() {
            return Ok(());
        }
        info!("fetching signing keys before load");
        self.manager.setup_and_add(
            key,
            SessionKind::KeyInfo(Arc::clone(&self.key_info)),
            request,
        )?;
        let status = self.key_info.core().wait();
        if status < 0 {
            warn!(status, "key fetch failed");
            return Err(SessionError::Aborted(status));
        }
        Ok(())
    }

    fn start_app_mgmt(&self, key: SessionKey, request: &HubRequest) -> Result<(), SessionError> {
        self.manager.setup_and_add(
            key,
            SessionKind::AppMgmt(Arc::clone(&self.app_mgmt)),
            request,
        )
    }

    /// Feeds a frame from the device to the sessions.
    ///
    /// Frames from user apps are [`RxOutcome::NotMine`]; an empty system-app
    /// payload is rejected before any session sees it.
    pub fn handle_rx(&self, frame: &Frame) -> Result<RxOutcome, SessionError> {
        if !frame.app_id.is_system() {
            return Ok(RxOutcome::NotMine);
        }
        if frame.payload.is_empty() {
            return Err(SessionError::InvalidRequest("empty system app payload"));
        }
        self.manager.handle_rx(&frame.payload)
    }

    /// `true` once the signing keys have been fetched.
    pub fn have_keys(&self) -> bool {
        self.key_info.have_keys()
    }

    /// Keys with a session still running.
    pub fn busy_keys(&self) -> Vec<SessionKey> {
        self.manager.live_keys()
    }

    /// Waits for the session serving `key` to finish, up to `timeout`.
    ///
    /// Returns the session's final status, or `None` on timeout.
    pub fn wait_for(&self, key: SessionKey, timeout: Duration) -> Option<i32> {
        match key {
            SessionKey::QueryApps => self.app_info.core().wait_timeout(timeout),
            SessionKey::QueryMemory => self.mem_info.core().wait_timeout(timeout),
            SessionKey::LoadApp => self.app_mgmt.core().wait_timeout(timeout),
        }
    }
}
