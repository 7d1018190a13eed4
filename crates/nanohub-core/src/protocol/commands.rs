//! Protocol constants: packet limits, event ids, system-app commands, and the
//! upstream message types and result codes.

// ── Packet limits ─────────────────────────────────────────────────────────────

/// Largest payload the hub accepts in one frame.
pub const MAX_TX_PACKET: usize = 128;

/// Largest payload the hub sends in one frame.
pub const MAX_RX_PACKET: usize = 128;

/// Bytes of firmware image carried by one `CONT_UPLOAD` request.
///
/// A continuation frame is `cmd(1) + offset(4) + chunk`, so the chunk must
/// leave room for 5 bytes of framing inside [`MAX_TX_PACKET`].
pub const UPLOAD_CHUNK_SZ_MAX: usize = 64;

const _: () = assert!(UPLOAD_CHUNK_SZ_MAX <= MAX_TX_PACKET - 5);

/// Sentinel for "size not reported" in memory and app-info records.
pub const MEM_SZ_UNKNOWN: u32 = 0xFFFF_FFFF;

// ── Event ids ─────────────────────────────────────────────────────────────────

/// Event id stamped on every frame travelling host → hub.
pub const EVT_APP_FROM_HOST: u32 = 0x0000_00F8;

// ── System-app commands ───────────────────────────────────────────────────────

/// First byte of every system-app payload, in both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SystemCommand {
    /// `(u64 appId) -> (u32 MgmtStatus)`
    ExtAppsOn = 0,
    /// `(u64 appId) -> (u32 MgmtStatus)`
    ExtAppsOff = 1,
    /// `(u64 appId) -> (u32 MgmtStatus)`
    ExtAppDelete = 2,
    /// `() -> (MemInfo)`
    QueryMemInfo = 3,
    /// `(u32 index) -> (AppInfo | empty when past the end)`
    QueryApps = 4,
    /// `(u32 byteOffset) -> (u8 data[] | empty when past the end)`
    QueryRsaKeys = 5,
    /// `(u8 isOs, u32 totalLen) -> (u32 status)`
    StartUpload = 6,
    /// `(u32 offset, u8 data[]) -> (u32 status)`
    ContUpload = 7,
    /// `() -> (u32 status)`
    FinishUpload = 8,
    /// `() -> (u32 status)`; also sent unsolicited after the hub restarts.
    Reboot = 9,
}

impl SystemCommand {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for SystemCommand {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            0 => Ok(SystemCommand::ExtAppsOn),
            1 => Ok(SystemCommand::ExtAppsOff),
            2 => Ok(SystemCommand::ExtAppDelete),
            3 => Ok(SystemCommand::QueryMemInfo),
            4 => Ok(SystemCommand::QueryApps),
            5 => Ok(SystemCommand::QueryRsaKeys),
            6 => Ok(SystemCommand::StartUpload),
            7 => Ok(SystemCommand::ContUpload),
            8 => Ok(SystemCommand::FinishUpload),
            9 => Ok(SystemCommand::Reboot),
            _ => Err(()),
        }
    }
}

// ── Upstream message types ────────────────────────────────────────────────────

/// Message types the application layer uses when talking to the system app.
///
/// The numeric values are shared with the upstream callback: a reply to a
/// request carries the same message type as the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum HubRequestType {
    AppsEnable = 1,
    AppsDisable = 2,
    LoadApp = 3,
    UnloadApp = 4,
    QueryApps = 5,
    QueryMemory = 6,
    OsReboot = 7,
}

impl HubRequestType {
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

impl TryFrom<u32> for HubRequestType {
    type Error = ();

    fn try_from(value: u32) -> Result<Self, ()> {
        match value {
            1 => Ok(HubRequestType::AppsEnable),
            2 => Ok(HubRequestType::AppsDisable),
            3 => Ok(HubRequestType::LoadApp),
            4 => Ok(HubRequestType::UnloadApp),
            5 => Ok(HubRequestType::QueryApps),
            6 => Ok(HubRequestType::QueryMemory),
            7 => Ok(HubRequestType::OsReboot),
            _ => Err(()),
        }
    }
}

// ── Result codes ──────────────────────────────────────────────────────────────

/// Result reported for a successful load/enable/disable/unload.
pub const APP_LOADED: i32 = 0;

/// Result reported when an app operation failed.
pub const APP_NOT_LOADED: i32 = -1;

/// Negative errno-style status codes used at the upstream boundary.
pub mod status {
    pub const EINTR: i32 = -4;
    pub const EIO: i32 = -5;
    pub const EBUSY: i32 = -16;
    pub const ENODEV: i32 = -19;
    pub const EINVAL: i32 = -22;
}
