//! Bounds-checked cursors over fixed-size byte regions.
//!
//! Every nanohub payload is a small packed structure of little-endian
//! integers and raw byte spans.  Instead of a full serialisation framework the
//! protocol code walks the payload with a cursor:
//!
//! ```text
//!  ┌────┬────────────┬────────────────────────┐
//!  │cmd │ u32 offset │ raw chunk ...          │
//!  └────┴────────────┴────────────────────────┘
//!        ▲
//!       pos      room = size - pos
//! ```
//!
//! Two flavours exist:
//!
//! - [`MessageBuf`] wraps a `&mut [u8]` and can both read and write.
//! - [`MessageView`] wraps a `&[u8]` and is read-only.  There is no write API
//!   at all, so "write to a read-only buffer" cannot be expressed.
//!
//! # Truncation contract
//!
//! An access that does not fit in the remaining room does **not** move the
//! cursor.  Reads return `0` (or an empty slice) and writes are dropped.
//! Callers must track the lengths they expect independently, typically by
//! checking [`MessageView::room`] before decoding a fixed-size record.
//! Writes additionally return `false` when they were dropped so encoders can
//! assert on them.

/// Returns the `n` bytes starting at `*pos` and advances `pos`, or `None`
/// when fewer than `n` bytes remain.
fn take<'b>(data: &'b [u8], pos: &mut usize, n: usize) -> Option<&'b [u8]> {
    let end = pos.checked_add(n)?;
    if end > data.len() {
        return None;
    }
    let span = &data[*pos..end];
    *pos = end;
    Some(span)
}

macro_rules! impl_reads {
    ($ty:ident) => {
        impl<'a> $ty<'a> {
            /// Current cursor position.
            pub fn pos(&self) -> usize {
                self.pos
            }

            /// Total capacity of the underlying region.
            pub fn size(&self) -> usize {
                self.data.len()
            }

            /// Bytes remaining between the cursor and the end of the region.
            pub fn room(&self) -> usize {
                self.data.len() - self.pos
            }

            /// Rewinds the cursor to the start of the region.
            pub fn reset(&mut self) {
                self.pos = 0;
            }

            pub fn read_u8(&mut self) -> u8 {
                take(&self.data[..], &mut self.pos, 1).map_or(0, |b| b[0])
            }

            pub fn read_u16(&mut self) -> u16 {
                take(&self.data[..], &mut self.pos, 2)
                    .map_or(0, |b| u16::from_le_bytes([b[0], b[1]]))
            }

            pub fn read_u32(&mut self) -> u32 {
                take(&self.data[..], &mut self.pos, 4)
                    .map_or(0, |b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            }

            pub fn read_u64(&mut self) -> u64 {
                take(&self.data[..], &mut self.pos, 8).map_or(0, |b| {
                    let mut raw = [0u8; 8];
                    raw.copy_from_slice(b);
                    u64::from_le_bytes(raw)
                })
            }
        }
    };
}

/// Writable cursor over a caller-provided byte region.
#[derive(Debug)]
pub struct MessageBuf<'a> {
    data: &'a mut [u8],
    pos: usize,
}

/// Read-only cursor over a borrowed byte region.
#[derive(Debug, Clone)]
pub struct MessageView<'a> {
    data: &'a [u8],
    pos: usize,
}

impl_reads!(MessageBuf);
impl_reads!(MessageView);

impl<'a> MessageBuf<'a> {
    pub fn new(data: &'a mut [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes between the start of the region and the cursor.
    ///
    /// After a sequence of writes this is the encoded message.
    pub fn data(&self) -> &[u8] {
        &self.data[..self.pos]
    }

    /// Borrows `n` bytes at the cursor without copying.
    pub fn read_raw(&mut self, n: usize) -> &[u8] {
        take(&self.data[..], &mut self.pos, n).unwrap_or(&[])
    }

    fn put(&mut self, bytes: &[u8]) -> bool {
        if bytes.len() > self.room() {
            return false;
        }
        let end = self.pos + bytes.len();
        self.data[self.pos..end].copy_from_slice(bytes);
        self.pos = end;
        true
    }

    pub fn write_u8(&mut self, value: u8) -> bool {
        self.put(&[value])
    }

    pub fn write_u16(&mut self, value: u16) -> bool {
        self.put(&value.to_le_bytes())
    }

    pub fn write_u32(&mut self, value: u32) -> bool {
        self.put(&value.to_le_bytes())
    }

    pub fn write_u64(&mut self, value: u64) -> bool {
        self.put(&value.to_le_bytes())
    }

    /// Copies `bytes` at the cursor; all-or-nothing.
    pub fn write_raw(&mut self, bytes: &[u8]) -> bool {
        self.put(bytes)
    }
}

impl<'a> MessageView<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes from the cursor to the end of the region, without advancing.
    pub fn remaining(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    /// Borrows `n` bytes at the cursor without copying.
    ///
    /// The returned slice lives as long as the underlying region, not the
    /// view, so decoded spans can outlive the cursor.
    pub fn read_raw(&mut self, n: usize) -> &'a [u8] {
        take(self.data, &mut self.pos, n).unwrap_or(&[])
    }
}
