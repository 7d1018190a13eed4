//! Fetches the hub's signing-key blob ahead of an app load.
//!
//! `QUERY_RSA_KEYS(offset)` returns the bytes starting at `offset`, or an
//! empty body at the end of the blob.  The session is internal: nothing is
//! delivered upstream, the app-management path only checks
//! [`KeyInfoSession::have_keys`]; the blob itself stays inside the session.

use std::sync::{Arc, Mutex, PoisonError};

use nanohub_core::protocol::commands::SystemCommand;
use nanohub_core::protocol::records::NanohubRsp;
use nanohub_core::{MessageBuf, MessageView};
use tracing::{debug, info};

use crate::application::link::HubLink;
use crate::application::session::{RxOutcome, SessionCore, SessionError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyInfoState {
    Fetching,
}

pub struct KeyInfoSession {
    core: SessionCore<KeyInfoState>,
    keys: Mutex<Vec<u8>>,
    link: Arc<dyn HubLink>,
}

impl KeyInfoSession {
    pub fn new(link: Arc<dyn HubLink>) -> Self {
        Self {
            core: SessionCore::new(),
            keys: Mutex::new(Vec::new()),
            link,
        }
    }

    pub fn core(&self) -> &SessionCore<KeyInfoState> {
        &self.core
    }

    pub fn setup(&self) -> Result<(), SessionError> {
        let mut keys = self.keys.lock().unwrap_or_else(PoisonError::into_inner);
        keys.clear();
        self.core.start(KeyInfoState::Fetching);
        self.request_from(0)
    }

    pub fn handle_rx(&self, payload: &[u8]) -> Result<RxOutcome, SessionError> {
        let mut keys = self.keys.lock().unwrap_or_else(PoisonError::into_inner);
        let mut view = MessageView::new(payload);
        let rsp = NanohubRsp::parse(&mut view, true);
        if rsp.cmd != SystemCommand::QueryRsaKeys.as_u8() {
            return Ok(RxOutcome::NotMine);
        }
        if self.core.state() != Some(KeyInfoState::Fetching) {
            return Err(SessionError::NotRunning);
        }

        let chunk = view.read_raw(view.room());
        if chunk.is_empty() {
            info!(bytes = keys.len(), "key blob received");
            self.core.complete();
        } else {
            debug!(offset = keys.len(), len = chunk.len(), "key chunk");
            keys.extend_from_slice(chunk);
            self.request_from(keys.len() as u32)?;
        }
        Ok(RxOutcome::Handled)
    }

    /// `true` once a fetch has finished with a non-empty blob.
    pub fn have_keys(&self) -> bool {
        let keys = self.keys.lock().unwrap_or_else(PoisonError::into_inner);
        !keys.is_empty() && !self.core.is_running()
    }

    fn request_from(&self, offset: u32) -> Result<(), SessionError> {
        let mut data = [0u8; 5];
        let mut buf = MessageBuf::new(&mut data);
        buf.write_u8(SystemCommand::QueryRsaKeys.as_u8());
        buf.write_u32(offset);
        self.link.send_to_system(buf.data())
    }
}
