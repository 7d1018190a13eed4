//! Paginated enumeration of the apps installed on the hub.
//!
//! Each `QUERY_APPS(index)` request returns one [`AppInfo`] record, or an
//! empty body once `index` is past the end.  The session asks for
//! `index = apps collected so far` until the empty page arrives, then delivers
//! the whole list upstream as one `QueryApps` message.

use std::sync::{Arc, Mutex, PoisonError};

use nanohub_core::protocol::commands::{HubRequestType, SystemCommand};
use nanohub_core::protocol::records::{AppInfo, NanohubRsp};
use nanohub_core::{HubMessage, MessageBuf, MessageView, SYSTEM_APP_ID};
use tracing::debug;

use crate::application::link::HubLink;
use crate::application::session::{RxOutcome, SessionCore, SessionError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppInfoState {
    Querying,
}

#[derive(Debug, Default)]
struct AppList {
    apps: Vec<AppInfo>,
}

pub struct AppInfoSession {
    core: SessionCore<AppInfoState>,
    list: Mutex<AppList>,
    link: Arc<dyn HubLink>,
}

impl AppInfoSession {
    pub fn new(link: Arc<dyn HubLink>) -> Self {
        Self {
            core: SessionCore::new(),
            list: Mutex::new(AppList::default()),
            link,
        }
    }

    pub fn core(&self) -> &SessionCore<AppInfoState> {
        &self.core
    }

    pub fn setup(&self) -> Result<(), SessionError> {
        let mut list = self.list.lock().unwrap_or_else(PoisonError::into_inner);
        // The last run's size is a good guess for this one.
        let expected = list.apps.len();
        list.apps = Vec::with_capacity(expected);
        self.core.start(AppInfoState::Querying);
        self.request_page(0)
    }

    pub fn handle_rx(&self, payload: &[u8]) -> Result<RxOutcome, SessionError> {
        let mut list = self.list.lock().unwrap_or_else(PoisonError::into_inner);
        let mut view = MessageView::new(payload);
        let rsp = NanohubRsp::parse(&mut view, true);
        if rsp.cmd != SystemCommand::QueryApps.as_u8() {
            return Ok(RxOutcome::NotMine);
        }
        if self.core.state() != Some(AppInfoState::Querying) {
            return Err(SessionError::NotRunning);
        }

        match view.room() {
            0 => {
                debug!(count = list.apps.len(), "app list complete");
                let body = AppInfo::encode_list(&list.apps);
                // The key must be free by the time the client sees the result.
                self.core.complete();
                self.link.send_to_app(HubMessage::new(
                    SYSTEM_APP_ID,
                    HubRequestType::QueryApps.as_u32(),
                    &body,
                ));
                Ok(RxOutcome::Handled)
            }
            AppInfo::WIRE_SIZE => {
                let app = AppInfo::decode(&mut view);
                debug!(index = list.apps.len(), app_id = %app.app_id, version = app.version, "app info page");
                list.apps.push(app);
                self.request_page(list.apps.len() as u32)?;
                Ok(RxOutcome::Handled)
            }
            other => Err(SessionError::BadLength {
                what: "app info",
                expected: AppInfo::WIRE_SIZE,
                actual: other,
            }),
        }
    }

    fn request_page(&self, index: u32) -> Result<(), SessionError> {
        let mut data = [0u8; 5];
        let mut buf = MessageBuf::new(&mut data);
        buf.write_u8(SystemCommand::QueryApps.as_u8());
        buf.write_u32(index);
        self.link.send_to_system(buf.data())
    }
}
