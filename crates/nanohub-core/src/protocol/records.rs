//! Fixed-layout records carried inside system-app payloads.
//!
//! Each record documents its wire size; decoders read from a
//! [`MessageView`] whose room the caller has already checked.

use serde::{Deserialize, Serialize};

use crate::protocol::commands::{status, MEM_SZ_UNKNOWN};
use crate::protocol::frame::AppId;
use crate::protocol::message_buf::{MessageBuf, MessageView};

fn known(value: u32) -> Option<u32> {
    (value != MEM_SZ_UNKNOWN).then_some(value)
}

// ── Response header ───────────────────────────────────────────────────────────

/// Common prefix of every system-app response: a command byte and, for most
/// commands, a 32-bit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NanohubRsp {
    pub cmd: u8,
    pub status: i32,
}

impl NanohubRsp {
    /// Rewinds `view` and parses the response header.
    ///
    /// With `no_status` the cursor is left just past the command byte so the
    /// caller can decode the body.  An empty payload yields `-EINVAL`.
    pub fn parse(view: &mut MessageView<'_>, no_status: bool) -> Self {
        view.reset();
        let cmd = view.read_u8();
        let status = if view.size() == 0 {
            status::EINVAL
        } else if no_status {
            0
        } else {
            view.read_u32() as i32
        };
        Self { cmd, status }
    }
}

// ── App info ──────────────────────────────────────────────────────────────────

/// One installed app as reported by `QUERY_APPS`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppInfo {
    pub app_id: AppId,
    pub version: u32,
    /// Flash bytes used, or `None` when the hub did not report it.
    pub flash_used: Option<u32>,
    /// RAM bytes used, or `None` when the hub did not report it.
    pub ram_used: Option<u32>,
}

impl AppInfo {
    /// `app_id(8) + version(4) + flash_use(4) + ram_use(4)`
    pub const WIRE_SIZE: usize = 20;

    pub fn decode(view: &mut MessageView<'_>) -> Self {
        let app_id = AppId(view.read_u64());
        let version = view.read_u32();
        let flash_used = known(view.read_u32());
        let ram_used = known(view.read_u32());
        Self {
            app_id,
            version,
            flash_used,
            ram_used,
        }
    }

    pub fn encode(&self, buf: &mut MessageBuf<'_>) -> bool {
        buf.write_u64(self.app_id.0)
            && buf.write_u32(self.version)
            && buf.write_u32(self.flash_used.unwrap_or(MEM_SZ_UNKNOWN))
            && buf.write_u32(self.ram_used.unwrap_or(MEM_SZ_UNKNOWN))
    }

    /// Packs a list in the layout delivered to the application layer.
    pub fn encode_list(apps: &[AppInfo]) -> Vec<u8> {
        let mut out = vec![0u8; apps.len() * Self::WIRE_SIZE];
        let mut buf = MessageBuf::new(&mut out);
        for app in apps {
            app.encode(&mut buf);
        }
        out
    }

    /// Unpacks a list produced by [`AppInfo::encode_list`]; a trailing
    /// partial record is ignored.
    pub fn decode_list(bytes: &[u8]) -> Vec<AppInfo> {
        let mut view = MessageView::new(bytes);
        let mut apps = Vec::with_capacity(bytes.len() / Self::WIRE_SIZE);
        while view.room() >= Self::WIRE_SIZE {
            apps.push(Self::decode(&mut view));
        }
        apps
    }
}

// ── Memory info ───────────────────────────────────────────────────────────────

/// Memory region classes reported upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum MemType {
    /// Shared area that holds app images.
    Main = 0,
    Os = 0x8000_0000,
    EeData = 0x8000_0001,
    Ram = 0x8000_0002,
    Bootloader = 0x8000_0003,
    Flash = 0x8000_0004,
}

impl TryFrom<u32> for MemType {
    type Error = ();

    fn try_from(value: u32) -> Result<Self, ()> {
        match value {
            0 => Ok(MemType::Main),
            0x8000_0000 => Ok(MemType::Os),
            0x8000_0001 => Ok(MemType::EeData),
            0x8000_0002 => Ok(MemType::Ram),
            0x8000_0003 => Ok(MemType::Bootloader),
            0x8000_0004 => Ok(MemType::Flash),
            _ => Err(()),
        }
    }
}

/// One memory region with its capacity and free space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemRange {
    pub mem_type: MemType,
    pub total_bytes: u32,
    pub free_bytes: u32,
}

impl MemRange {
    /// `type(4) + total(4) + free(4)`
    pub const WIRE_SIZE: usize = 12;

    pub fn encode_list(ranges: &[MemRange]) -> Vec<u8> {
        let mut out = vec![0u8; ranges.len() * Self::WIRE_SIZE];
        let mut buf = MessageBuf::new(&mut out);
        for range in ranges {
            buf.write_u32(range.mem_type as u32);
            buf.write_u32(range.total_bytes);
            buf.write_u32(range.free_bytes);
        }
        out
    }

    /// Unpacks ranges; entries with an unrecognised type are skipped.
    pub fn decode_list(bytes: &[u8]) -> Vec<MemRange> {
        let mut view = MessageView::new(bytes);
        let mut ranges = Vec::new();
        while view.room() >= Self::WIRE_SIZE {
            let raw_type = view.read_u32();
            let total_bytes = view.read_u32();
            let free_bytes = view.read_u32();
            if let Ok(mem_type) = MemType::try_from(raw_type) {
                ranges.push(MemRange {
                    mem_type,
                    total_bytes,
                    free_bytes,
                });
            }
        }
        ranges
    }
}

/// Size/use pair for one region; either half may be [`MEM_SZ_UNKNOWN`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemPair {
    pub size: u32,
    pub used: u32,
}

impl MemPair {
    fn range(self, mem_type: MemType) -> Option<MemRange> {
        let size = known(self.size)?;
        let used = known(self.used)?;
        Some(MemRange {
            mem_type,
            total_bytes: size,
            free_bytes: size.saturating_sub(used),
        })
    }
}

/// Body of a `QUERY_MEMINFO` response.
///
/// On the wire all six sizes come first, then the six uses, in the order
/// flash, bootloader, OS, shared, EE-data, RAM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemInfo {
    pub flash: MemPair,
    pub bootloader: MemPair,
    pub os: MemPair,
    pub shared: MemPair,
    pub ee_data: MemPair,
    pub ram: MemPair,
}

impl MemInfo {
    pub const WIRE_SIZE: usize = 48;

    pub fn decode(view: &mut MessageView<'_>) -> Self {
        let mut sizes = [0u32; 6];
        let mut uses = [0u32; 6];
        for size in &mut sizes {
            *size = view.read_u32();
        }
        for used in &mut uses {
            *used = view.read_u32();
        }
        let pair = |i: usize| MemPair {
            size: sizes[i],
            used: uses[i],
        };
        Self {
            flash: pair(0),
            bootloader: pair(1),
            os: pair(2),
            shared: pair(3),
            ee_data: pair(4),
            ram: pair(5),
        }
    }

    pub fn encode(&self, buf: &mut MessageBuf<'_>) -> bool {
        let pairs = [
            self.flash,
            self.bootloader,
            self.os,
            self.shared,
            self.ee_data,
            self.ram,
        ];
        pairs.iter().all(|p| buf.write_u32(p.size)) && pairs.iter().all(|p| buf.write_u32(p.used))
    }

    /// Regions with both halves known, in upstream reporting order.
    pub fn ranges(&self) -> Vec<MemRange> {
        [
            self.shared.range(MemType::Main),
            self.os.range(MemType::Os),
            self.ee_data.range(MemType::EeData),
            self.ram.range(MemType::Ram),
            self.bootloader.range(MemType::Bootloader),
            self.flash.range(MemType::Flash),
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}

// ── App management status ─────────────────────────────────────────────────────

/// Packed status word returned by `EXT_APPS_ON`, `EXT_APPS_OFF` and
/// `EXT_APP_DELETE`.  Each byte is a counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MgmtStatus {
    /// Apps matched by the request.
    pub app: u8,
    /// Tasks affected.
    pub task: u8,
    /// Operations performed.
    pub op: u8,
    /// Flash erase operations.
    pub erase: u8,
}

impl MgmtStatus {
    /// Counter value the firmware uses for "could not count".
    ///
    /// The op counter is a plain byte, so the valid range for a successful
    /// operation is `1..=0xFE`; only this sentinel sits above it.
    pub const OP_INVALID: u8 = 0xFF;

    pub fn from_raw(value: u32) -> Self {
        let [app, task, op, erase] = value.to_le_bytes();
        Self {
            app,
            task,
            op,
            erase,
        }
    }

    pub fn to_raw(self) -> u32 {
        u32::from_le_bytes([self.app, self.task, self.op, self.erase])
    }

    /// The op counter is in `1..=0xFE`.
    pub fn op_succeeded(self) -> bool {
        (1..Self::OP_INVALID).contains(&self.op)
    }
}

// ── App binary header ─────────────────────────────────────────────────────────

/// Header at the front of every load-app request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppBinaryHeader {
    pub header_version: u32,
    pub magic: u32,
    pub app_id: AppId,
    pub app_version: u32,
    pub flags: u32,
    pub hw_hub_type: u64,
    pub chre_api_major: u8,
    pub chre_api_minor: u8,
}

impl AppBinaryHeader {
    /// Header size including six reserved trailing bytes.
    pub const SIZE: usize = 40;

    /// Parses the header from the front of `image`.
    ///
    /// Returns `None` unless the image is strictly longer than the header:
    /// a load request must carry at least one byte of app body.
    pub fn parse(image: &[u8]) -> Option<Self> {
        if image.len() <= Self::SIZE {
            return None;
        }
        let mut view = MessageView::new(image);
        Some(Self {
            header_version: view.read_u32(),
            magic: view.read_u32(),
            app_id: AppId(view.read_u64()),
            app_version: view.read_u32(),
            flags: view.read_u32(),
            hw_hub_type: view.read_u64(),
            chre_api_major: view.read_u8(),
            chre_api_minor: view.read_u8(),
        })
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        let mut buf = MessageBuf::new(&mut out);
        buf.write_u32(self.header_version);
        buf.write_u32(self.magic);
        buf.write_u64(self.app_id.0);
        buf.write_u32(self.app_version);
        buf.write_u32(self.flags);
        buf.write_u64(self.hw_hub_type);
        buf.write_u8(self.chre_api_major);
        buf.write_u8(self.chre_api_minor);
        out
    }
}
