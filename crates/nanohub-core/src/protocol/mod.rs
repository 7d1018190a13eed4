//! Protocol module: message cursors, device frames, commands, and records.

pub mod commands;
pub mod frame;
pub mod hub_message;
pub mod message_buf;
pub mod records;

pub use commands::{HubRequestType, SystemCommand};
pub use frame::{AppId, Frame, FrameError, SYSTEM_APP_ID};
pub use hub_message::HubMessage;
pub use message_buf::{MessageBuf, MessageView};
pub use records::{AppBinaryHeader, AppInfo, MemInfo, MemRange, MemType, MgmtStatus, NanohubRsp};
