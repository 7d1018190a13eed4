//! # nanohub-core
//!
//! Shared protocol library for talking to a nanohub sensor coprocessor.
//!
//! This crate has no threads and performs no OS I/O.  It defines:
//!
//! - **`protocol::message_buf`** – bounds-checked little-endian cursors used
//!   to encode requests and decode responses.
//! - **`protocol::frame`** – the 13-byte-header packet exchanged with the
//!   character device, and the [`AppId`] identity type.
//! - **`protocol::commands`** – system-app command bytes, upstream message
//!   types, packet limits, and result codes.
//! - **`protocol::records`** – fixed-layout payload records (app info, memory
//!   info, management status, app binary header).
//! - **`protocol::hub_message`** – the owned envelope delivered to clients.
//!
//! # How the system app works (for beginners)
//!
//! Apps on the hub are addressed by a 64-bit id.  Id 0 is the *system app*:
//! the firmware itself.  The host manages firmware by sending the system app
//! a one-byte command followed by arguments, and the hub answers with the same
//! command byte followed by a status or a record.  Long results (the app list,
//! signing keys) are fetched one page at a time until the hub returns an empty
//! page.

pub mod protocol;

pub use protocol::commands::{HubRequestType, SystemCommand};
pub use protocol::frame::{AppId, Frame, FrameError, SYSTEM_APP_ID};
pub use protocol::hub_message::HubMessage;
pub use protocol::message_buf::{MessageBuf, MessageView};
