//! Single round-trip memory usage query.

use std::sync::{Arc, Mutex, PoisonError};

use nanohub_core::protocol::commands::{HubRequestType, SystemCommand};
use nanohub_core::protocol::records::{MemInfo, MemRange, NanohubRsp};
use nanohub_core::{HubMessage, MessageView, SYSTEM_APP_ID};
use tracing::debug;

use crate::application::link::HubLink;
use crate::application::session::{RxOutcome, SessionCore, SessionError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemInfoState {
    Querying,
}

pub struct MemInfoSession {
    core: SessionCore<MemInfoState>,
    protocol: Mutex<()>,
    link: Arc<dyn HubLink>,
}

impl MemInfoSession {
    pub fn new(link: Arc<dyn HubLink>) -> Self {
        Self {
            core: SessionCore::new(),
            protocol: Mutex::new(()),
            link,
        }
    }

    pub fn core(&self) -> &SessionCore<MemInfoState> {
        &self.core
    }

    pub fn setup(&self) -> Result<(), SessionError> {
        let _guard = self.protocol.lock().unwrap_or_else(PoisonError::into_inner);
        self.core.start(MemInfoState::Querying);
        self.link
            .send_to_system(&[SystemCommand::QueryMemInfo.as_u8()])
    }

    /// Decodes the memory record and delivers the known ranges upstream.
    ///
    /// Ranges whose size or use is unreported are left out.
    pub fn handle_rx(&self, payload: &[u8]) -> Result<RxOutcome, SessionError> {
        let _guard = self.protocol.lock().unwrap_or_else(PoisonError::into_inner);
        let mut view = MessageView::new(payload);
        let rsp = NanohubRsp::parse(&mut view, true);
        if rsp.cmd != SystemCommand::QueryMemInfo.as_u8() {
            return Ok(RxOutcome::NotMine);
        }
        if self.core.state() != Some(MemInfoState::Querying) {
            return Err(SessionError::NotRunning);
        }
        if view.room() != MemInfo::WIRE_SIZE {
            return Err(SessionError::BadLength {
                what: "memory info",
                expected: MemInfo::WIRE_SIZE,
                actual: view.room(),
            });
        }

        let ranges = MemInfo::decode(&mut view).ranges();
        debug!(ranges = ranges.len(), "memory info received");
        self.core.complete();
        self.link.send_to_app(HubMessage::new(
            SYSTEM_APP_ID,
            HubRequestType::QueryMemory.as_u32(),
            &MemRange::encode_list(&ranges),
        ));
        Ok(RxOutcome::Handled)
    }
}
