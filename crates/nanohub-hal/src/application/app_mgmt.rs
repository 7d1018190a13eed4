//! App-table mutations: load, enable, disable, unload, and OS reboot.
//!
//! # Load flow (for beginners)
//!
//! Loading an app is a chunked upload followed by a start attempt.  Every arrow
//! is one request/response round trip with the system app:
//!
//! ```text
//! START_UPLOAD ─► Transfer ──CONT_UPLOAD × n──► FINISH_UPLOAD ─► Finish
//!                    │ start/cont failed             │ failed
//!                    ▼                               ▼
//!              APP_NOT_LOADED                  APP_NOT_LOADED
//!
//! Finish ─ok─► EXT_APPS_ON ─► Run ─ok─► APP_LOADED
//!                              │ failed
//!                              ▼
//!                  EXT_APP_DELETE ─► RunFailed ─► APP_NOT_LOADED
//! ```
//!
//! The delete after a failed start is cleanup only; its own status is ignored
//! and it is never retried.
//!
//! Enable, disable, and unload are a single management command whose packed
//! status is reported as `0` (success) or `-1`.  Reboot sends the command and
//! completes on the answer; the reboot notification itself comes from the
//! session manager.

use std::sync::{Arc, Mutex, PoisonError};

use nanohub_core::protocol::commands::{
    HubRequestType, SystemCommand, APP_LOADED, APP_NOT_LOADED, UPLOAD_CHUNK_SZ_MAX,
};
use nanohub_core::protocol::records::{AppBinaryHeader, MgmtStatus, NanohubRsp};
use nanohub_core::{AppId, HubMessage, MessageBuf, MessageView, SYSTEM_APP_ID};
use tracing::{debug, info, warn};

use crate::application::link::{HubLink, HubRequest};
use crate::application::session::{RxOutcome, SessionCore, SessionError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppMgmtState {
    Transfer,
    Finish,
    Run,
    RunFailed,
    Reboot,
    Mgmt,
}

#[derive(Debug)]
struct Operation {
    /// Upstream type the reply is delivered under.
    request: HubRequestType,
    /// Command expected back in `Mgmt`.
    cmd: SystemCommand,
    app_id: AppId,
    image: Vec<u8>,
    sent: usize,
}

impl Default for Operation {
    fn default() -> Self {
        Self {
            request: HubRequestType::LoadApp,
            cmd: SystemCommand::ExtAppsOn,
            app_id: SYSTEM_APP_ID,
            image: Vec::new(),
            sent: 0,
        }
    }
}

pub struct AppMgmtSession {
    core: SessionCore<AppMgmtState>,
    op: Mutex<Operation>,
    link: Arc<dyn HubLink>,
}

impl AppMgmtSession {
    pub fn new(link: Arc<dyn HubLink>) -> Self {
        Self {
            core: SessionCore::new(),
            op: Mutex::new(Operation::default()),
            link,
        }
    }

    pub fn core(&self) -> &SessionCore<AppMgmtState> {
        &self.core
    }

    /// Starts the operation named by `request.message_type`.
    ///
    /// # Errors
    ///
    /// [`SessionError::InvalidRequest`] for an unknown or non-mutating type
    /// or a malformed payload; [`SessionError::Link`] if the first write
    /// fails.
    pub fn setup(&self, request: &HubRequest) -> Result<(), SessionError> {
        let mut op = self.op.lock().unwrap_or_else(PoisonError::into_inner);
        let kind = HubRequestType::try_from(request.message_type)
            .map_err(|()| SessionError::InvalidRequest("unknown message type"))?;

        match kind {
            HubRequestType::AppsEnable => {
                self.setup_mgmt(&mut op, kind, SystemCommand::ExtAppsOn, &request.payload)
            }
            HubRequestType::AppsDisable => {
                self.setup_mgmt(&mut op, kind, SystemCommand::ExtAppsOff, &request.payload)
            }
            HubRequestType::UnloadApp => {
                self.setup_mgmt(&mut op, kind, SystemCommand::ExtAppDelete, &request.payload)
            }
            HubRequestType::LoadApp => self.setup_load(&mut op, &request.payload),
            HubRequestType::OsReboot => self.setup_reboot(&mut op),
            HubRequestType::QueryApps | HubRequestType::QueryMemory => Err(
                SessionError::InvalidRequest("not an app management request"),
            ),
        }
    }

    fn setup_mgmt(
        &self,
        op: &mut Operation,
        request: HubRequestType,
        cmd: SystemCommand,
        payload: &[u8],
    ) -> Result<(), SessionError> {
        if payload.len() != 8 {
            return Err(SessionError::InvalidRequest("expected an 8-byte app id"));
        }
        let app_id = AppId(MessageView::new(payload).read_u64());
        *op = Operation {
            request,
            cmd,
            app_id,
            ..Operation::default()
        };
        info!(%app_id, ?cmd, "app management request");
        self.core.start(AppMgmtState::Mgmt);
        self.send_app_cmd(cmd, app_id)
    }

    fn setup_load(&self, op: &mut Operation, image: &[u8]) -> Result<(), SessionError> {
        let header = AppBinaryHeader::parse(image)
            .ok_or(SessionError::InvalidRequest("app image has no body after its header"))?;
        let total = u32::try_from(image.len())
            .map_err(|_| SessionError::InvalidRequest("app image too large"))?;
        *op = Operation {
            request: HubRequestType::LoadApp,
            cmd: SystemCommand::StartUpload,
            app_id: header.app_id,
            image: image.to_vec(),
            sent: 0,
        };
        info!(app_id = %header.app_id, version = header.app_version, bytes = total, "starting upload");
        self.core.start(AppMgmtState::Transfer);

        let mut data = [0u8; 6];
        let mut buf = MessageBuf::new(&mut data);
        buf.write_u8(SystemCommand::StartUpload.as_u8());
        buf.write_u8(0);
        buf.write_u32(total);
        self.link.send_to_system(buf.data())
    }

    fn setup_reboot(&self, op: &mut Operation) -> Result<(), SessionError> {
        *op = Operation {
            request: HubRequestType::OsReboot,
            cmd: SystemCommand::Reboot,
            ..Operation::default()
        };
        info!("requesting hub reboot");
        self.core.start(AppMgmtState::Reboot);
        self.link.send_to_system(&[SystemCommand::Reboot.as_u8()])
    }

    pub fn handle_rx(&self, payload: &[u8]) -> Result<RxOutcome, SessionError> {
        let mut op = self.op.lock().unwrap_or_else(PoisonError::into_inner);
        let mut view = MessageView::new(payload);
        let rsp = NanohubRsp::parse(&mut view, false);
        let Ok(cmd) = SystemCommand::try_from(rsp.cmd) else {
            return Ok(RxOutcome::NotMine);
        };
        let Some(state) = self.core.state() else {
            return Err(SessionError::NotRunning);
        };

        match (state, cmd) {
            (AppMgmtState::Transfer, SystemCommand::StartUpload | SystemCommand::ContUpload) => {
                self.on_transfer(&mut op, rsp.status)
            }
            (AppMgmtState::Finish, SystemCommand::FinishUpload) => {
                self.on_finish(&op, rsp.status)
            }
            (AppMgmtState::Run, SystemCommand::ExtAppsOn) => self.on_run(&op, rsp.status),
            (AppMgmtState::RunFailed, SystemCommand::ExtAppDelete) => {
                warn!(app_id = %op.app_id, status = rsp.status, "cleanup delete answered");
                self.finish_with(op.request, op.app_id, APP_NOT_LOADED);
                Ok(RxOutcome::Handled)
            }
            (AppMgmtState::Reboot, SystemCommand::Reboot) => {
                info!(status = rsp.status, "reboot acknowledged");
                self.core.complete();
                Ok(RxOutcome::Handled)
            }
            (AppMgmtState::Mgmt, cmd) if cmd == op.cmd => {
                // Any positive status word counts as success.
                let result = if rsp.status > 0 { 0 } else { -1 };
                debug!(app_id = %op.app_id, ?cmd, status = rsp.status, result, "management response");
                self.finish_with(op.request, op.app_id, result);
                Ok(RxOutcome::Handled)
            }
            _ => Ok(RxOutcome::NotMine),
        }
    }

    fn on_transfer(&self, op: &mut Operation, status: i32) -> Result<RxOutcome, SessionError> {
        if status <= 0 {
            warn!(app_id = %op.app_id, sent = op.sent, status, "upload rejected");
            self.finish_with(op.request, op.app_id, APP_NOT_LOADED);
            return Ok(RxOutcome::Handled);
        }

        if op.sent < op.image.len() {
            let end = (op.sent + UPLOAD_CHUNK_SZ_MAX).min(op.image.len());
            let mut data = [0u8; 5 + UPLOAD_CHUNK_SZ_MAX];
            let mut buf = MessageBuf::new(&mut data);
            buf.write_u8(SystemCommand::ContUpload.as_u8());
            buf.write_u32(op.sent as u32);
            buf.write_raw(&op.image[op.sent..end]);
            op.sent = end;
            self.link.send_to_system(buf.data())?;
        } else {
            debug!(app_id = %op.app_id, bytes = op.sent, "upload complete");
            self.core.set_state(AppMgmtState::Finish);
            self.link
                .send_to_system(&[SystemCommand::FinishUpload.as_u8()])?;
        }
        Ok(RxOutcome::Handled)
    }

    fn on_finish(&self, op: &Operation, status: i32) -> Result<RxOutcome, SessionError> {
        if status > 0 {
            self.core.set_state(AppMgmtState::Run);
            self.send_app_cmd(SystemCommand::ExtAppsOn, op.app_id)?;
        } else {
            warn!(app_id = %op.app_id, status, "finish upload failed");
            self.finish_with(op.request, op.app_id, APP_NOT_LOADED);
        }
        Ok(RxOutcome::Handled)
    }

    fn on_run(&self, op: &Operation, status: i32) -> Result<RxOutcome, SessionError> {
        let sts = MgmtStatus::from_raw(status as u32);
        if sts.op_succeeded() {
            info!(app_id = %op.app_id, "app loaded and started");
            self.finish_with(op.request, op.app_id, APP_LOADED);
        } else {
            warn!(app_id = %op.app_id, ?sts, "app failed to start, deleting");
            self.core.set_state(AppMgmtState::RunFailed);
            self.send_app_cmd(SystemCommand::ExtAppDelete, op.app_id)?;
        }
        Ok(RxOutcome::Handled)
    }

    fn send_app_cmd(&self, cmd: SystemCommand, app_id: AppId) -> Result<(), SessionError> {
        let mut data = [0u8; 9];
        let mut buf = MessageBuf::new(&mut data);
        buf.write_u8(cmd.as_u8());
        buf.write_u64(app_id.0);
        self.link.send_to_system(buf.data())
    }

    fn finish_with(&self, request: HubRequestType, app_id: AppId, result: i32) {
        debug!(%app_id, ?request, result, "app management finished");
        self.core.complete();
        self.link
            .send_to_app(HubMessage::with_result(SYSTEM_APP_ID, request.as_u32(), result));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::link::{MockHubLink, RecordingLink};

    const APP: AppId = AppId(0x476F_6F67_6C00_0042);

    fn image(body_len: usize) -> Vec<u8> {
        let header = AppBinaryHeader {
            header_version: 1,
            magic: 0x4E41_4E4F,
            app_id: APP,
            app_version: 3,
            flags: 0,
            hw_hub_type: 0,
            chre_api_major: 1,
            chre_api_minor: 1,
        };
        let mut image = header.encode().to_vec();
        image.extend((0..body_len).map(|i| i as u8));
        image
    }

    fn rsp(cmd: SystemCommand, status: u32) -> Vec<u8> {
        let mut payload = vec![cmd.as_u8()];
        payload.extend_from_slice(&status.to_le_bytes());
        payload
    }

    fn ok_mgmt() -> u32 {
        MgmtStatus {
            app: 1,
            task: 1,
            op: 1,
            erase: 0,
        }
        .to_raw()
    }

    fn started(link: &Arc<RecordingLink>, image: &[u8]) -> AppMgmtSession {
        let session = AppMgmtSession::new(link.clone());
        session
            .setup(&HubRequest::system(HubRequestType::LoadApp.as_u32(), image))
            .unwrap();
        session
    }

    fn drive_transfer(session: &AppMgmtSession) {
        session.handle_rx(&rsp(SystemCommand::StartUpload, 1)).unwrap();
        while session.core().state() == Some(AppMgmtState::Transfer) {
            session.handle_rx(&rsp(SystemCommand::ContUpload, 1)).unwrap();
        }
    }

    #[test]
    fn test_upload_sends_three_full_chunks_and_one_partial() {
        // Arrange – body sized so the whole image is 3 chunks plus one byte
        let img = image(3 * UPLOAD_CHUNK_SZ_MAX + 1 - AppBinaryHeader::SIZE);
        assert_eq!(img.len(), 3 * UPLOAD_CHUNK_SZ_MAX + 1);
        let link = Arc::new(RecordingLink::new());
        let session = started(&link, &img);

        // Act
        drive_transfer(&session);

        // Assert
        let sent = link.sent();
        let cmds = link.sent_commands();
        let cont = SystemCommand::ContUpload.as_u8();
        assert_eq!(cmds.first(), Some(&SystemCommand::StartUpload.as_u8()));
        assert_eq!(cmds.iter().filter(|c| **c == cont).count(), 4);
        assert_eq!(cmds.last(), Some(&SystemCommand::FinishUpload.as_u8()));

        let chunk_lens: Vec<usize> = sent
            .iter()
            .filter(|f| f.command() == Some(cont))
            .map(|f| f.payload.len() - 5)
            .collect();
        assert_eq!(chunk_lens, vec![64, 64, 64, 1]);

        let mut reassembled = Vec::new();
        for frame in sent.iter().filter(|f| f.command() == Some(cont)) {
            let mut view = MessageView::new(&frame.payload);
            view.read_u8();
            assert_eq!(view.read_u32() as usize, reassembled.len());
            reassembled.extend_from_slice(view.remaining());
        }
        assert_eq!(reassembled, img);
        assert_eq!(session.core().state(), Some(AppMgmtState::Finish));
    }

    #[test]
    fn test_start_upload_declares_total_length() {
        let img = image(10);
        let link = Arc::new(RecordingLink::new());
        started(&link, &img);

        let first = &link.sent()[0];
        let mut view = MessageView::new(&first.payload);
        assert_eq!(view.read_u8(), SystemCommand::StartUpload.as_u8());
        assert_eq!(view.read_u8(), 0, "not an OS image");
        assert_eq!(view.read_u32() as usize, img.len());
    }

    #[test]
    fn test_negative_finish_status_is_failure() {
        // Arrange
        let link = Arc::new(RecordingLink::new());
        let session = started(&link, &image(8));
        drive_transfer(&session);

        // Act
        session
            .handle_rx(&rsp(SystemCommand::FinishUpload, (-5i32) as u32))
            .unwrap();

        // Assert
        assert!(!link
            .sent_commands()
            .contains(&SystemCommand::ExtAppsOn.as_u8()));
        assert_eq!(link.take_delivered()[0].result_code(), Some(APP_NOT_LOADED));
        assert!(!session.core().is_running());
    }

    #[test]
    fn test_negative_start_status_is_failure() {
        let link = Arc::new(RecordingLink::new());
        let session = started(&link, &image(8));

        session
            .handle_rx(&rsp(SystemCommand::StartUpload, u32::MAX))
            .unwrap();

        assert_eq!(link.sent_commands(), vec![SystemCommand::StartUpload.as_u8()]);
        assert_eq!(link.take_delivered()[0].result_code(), Some(APP_NOT_LOADED));
    }

    #[test]
    fn test_finish_failure_reports_not_loaded_without_enable() {
        // Arrange
        let link = Arc::new(RecordingLink::new());
        let session = started(&link, &image(8));
        drive_transfer(&session);

        // Act
        session.handle_rx(&rsp(SystemCommand::FinishUpload, 0)).unwrap();

        // Assert
        assert!(!link
            .sent_commands()
            .contains(&SystemCommand::ExtAppsOn.as_u8()));
        let delivered = link.take_delivered();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].message_type, HubRequestType::LoadApp.as_u32());
        assert_eq!(delivered[0].result_code(), Some(APP_NOT_LOADED));
        assert!(!session.core().is_running());
    }

    #[test]
    fn test_enable_failure_sends_exactly_one_delete() {
        // Arrange
        let link = Arc::new(RecordingLink::new());
        let session = started(&link, &image(8));
        drive_transfer(&session);
        session.handle_rx(&rsp(SystemCommand::FinishUpload, 1)).unwrap();
        let failed = MgmtStatus {
            app: 1,
            task: 0,
            op: 0,
            erase: 0,
        };

        // Act
        session
            .handle_rx(&rsp(SystemCommand::ExtAppsOn, failed.to_raw()))
            .unwrap();
        assert!(link.take_delivered().is_empty(), "no result before cleanup");
        session.handle_rx(&rsp(SystemCommand::ExtAppDelete, 1)).unwrap();

        // Assert
        let deletes: Vec<_> = link
            .sent()
            .into_iter()
            .filter(|f| f.command() == Some(SystemCommand::ExtAppDelete.as_u8()))
            .collect();
        assert_eq!(deletes.len(), 1);
        assert_eq!(MessageView::new(&deletes[0].payload[1..]).read_u64(), APP.0);
        let delivered = link.take_delivered();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].result_code(), Some(APP_NOT_LOADED));
    }

    #[test]
    fn test_successful_load_reports_loaded() {
        let link = Arc::new(RecordingLink::new());
        let session = started(&link, &image(8));
        drive_transfer(&session);
        session.handle_rx(&rsp(SystemCommand::FinishUpload, 1)).unwrap();

        session.handle_rx(&rsp(SystemCommand::ExtAppsOn, ok_mgmt())).unwrap();

        let delivered = link.take_delivered();
        assert_eq!(delivered[0].result_code(), Some(APP_LOADED));
        assert!(!session.core().is_running());
    }

    #[test]
    fn test_invalid_op_counter_counts_as_failure() {
        let link = Arc::new(RecordingLink::new());
        let session = started(&link, &image(8));
        drive_transfer(&session);
        session.handle_rx(&rsp(SystemCommand::FinishUpload, 1)).unwrap();
        let invalid = MgmtStatus {
            app: 1,
            task: 1,
            op: MgmtStatus::OP_INVALID,
            erase: 0,
        };

        session.handle_rx(&rsp(SystemCommand::ExtAppsOn, invalid.to_raw())).unwrap();

        assert_eq!(session.core().state(), Some(AppMgmtState::RunFailed));
    }

    #[test]
    fn test_start_rejection_reports_not_loaded_and_sends_nothing_more() {
        let link = Arc::new(RecordingLink::new());
        let session = started(&link, &image(200));

        session.handle_rx(&rsp(SystemCommand::StartUpload, 0)).unwrap();

        assert_eq!(link.sent_commands(), vec![SystemCommand::StartUpload.as_u8()]);
        assert_eq!(link.take_delivered()[0].result_code(), Some(APP_NOT_LOADED));
        assert!(!session.core().is_running());
    }

    #[test]
    fn test_load_requires_body_after_header() {
        let link = Arc::new(RecordingLink::new());
        let session = AppMgmtSession::new(link.clone());

        let result = session.setup(&HubRequest::system(
            HubRequestType::LoadApp.as_u32(),
            &image(0),
        ));

        assert!(matches!(result, Err(SessionError::InvalidRequest(_))));
        assert!(link.sent().is_empty());
        assert!(!session.core().is_running());
    }

    #[test]
    fn test_enable_sends_apps_on_with_app_id() {
        // Arrange
        let mut link = MockHubLink::new();
        link.expect_send_to_system()
            .withf(|payload| {
                payload.len() == 9
                    && payload[0] == SystemCommand::ExtAppsOn.as_u8()
                    && payload[1..] == APP.0.to_le_bytes()
            })
            .times(1)
            .returning(|_| Ok(()));
        let session = AppMgmtSession::new(Arc::new(link));

        // Act
        let result = session.setup(&HubRequest::system(
            HubRequestType::AppsEnable.as_u32(),
            &APP.0.to_le_bytes(),
        ));

        // Assert
        assert!(result.is_ok());
        assert_eq!(session.core().state(), Some(AppMgmtState::Mgmt));
    }

    #[test]
    fn test_mgmt_result_follows_status_polarity() {
        for (status, expected) in [(1u32, 0), (0u32, -1)] {
            let link = Arc::new(RecordingLink::new());
            let session = AppMgmtSession::new(link.clone());
            session
                .setup(&HubRequest::system(
                    HubRequestType::AppsDisable.as_u32(),
                    &APP.0.to_le_bytes(),
                ))
                .unwrap();

            session.handle_rx(&rsp(SystemCommand::ExtAppsOff, status)).unwrap();

            let delivered = link.take_delivered();
            assert_eq!(delivered[0].message_type, HubRequestType::AppsDisable.as_u32());
            assert_eq!(delivered[0].result_code(), Some(expected));
        }
    }

    #[test]
    fn test_mgmt_ignores_response_for_other_command() {
        let link = Arc::new(RecordingLink::new());
        let session = AppMgmtSession::new(link.clone());
        session
            .setup(&HubRequest::system(
                HubRequestType::UnloadApp.as_u32(),
                &APP.0.to_le_bytes(),
            ))
            .unwrap();

        let outcome = session.handle_rx(&rsp(SystemCommand::ExtAppsOn, 1));

        assert_eq!(outcome, Ok(RxOutcome::NotMine));
        assert!(session.core().is_running());
    }

    #[test]
    fn test_mgmt_rejects_malformed_app_id() {
        let link = Arc::new(RecordingLink::new());
        let session = AppMgmtSession::new(link);

        let result = session.setup(&HubRequest::system(
            HubRequestType::AppsEnable.as_u32(),
            &[1, 2, 3],
        ));

        assert!(matches!(result, Err(SessionError::InvalidRequest(_))));
    }

    #[test]
    fn test_reboot_completes_without_upstream_message() {
        let link = Arc::new(RecordingLink::new());
        let session = AppMgmtSession::new(link.clone());
        session
            .setup(&HubRequest::system(HubRequestType::OsReboot.as_u32(), &[]))
            .unwrap();

        session.handle_rx(&rsp(SystemCommand::Reboot, 0)).unwrap();

        assert_eq!(link.sent_commands(), vec![SystemCommand::Reboot.as_u8()]);
        assert!(link.take_delivered().is_empty());
        assert!(!session.core().is_running());
    }
}
