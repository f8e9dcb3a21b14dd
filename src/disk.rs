//! Disk-related types and helper functions.

use std::convert::TryFrom;
use std::io::{Read, Seek, SeekFrom, Write};

use crate::Error;

/// Default size of a logical sector (bytes).
pub const DEFAULT_SECTOR_SIZE: LogicalBlockSize = LogicalBlockSize::Lb512;

/// Largest buffer used when moving partition contents (bytes).
const MAX_MOVE_BUFFER: usize = 4 * 1024 * 1024;

/// Logical block/sector size of a device.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LogicalBlockSize {
    /// 512 bytes.
    Lb512,
    /// 1024 bytes.
    Lb1024,
    /// 2048 bytes (optical media).
    Lb2048,
    /// 4096 bytes.
    Lb4096,
}

impl LogicalBlockSize {
    /// Returns the logical block size as a `u64`
    pub const fn as_u64(&self) -> u64 {
        match self {
            LogicalBlockSize::Lb512 => 512,
            LogicalBlockSize::Lb1024 => 1024,
            LogicalBlockSize::Lb2048 => 2048,
            LogicalBlockSize::Lb4096 => 4096,
        }
    }

    /// Returns the logical block size as a `usize`
    pub const fn as_usize(&self) -> usize {
        self.as_u64() as usize
    }
}

impl From<LogicalBlockSize> for u64 {
    fn from(lb: LogicalBlockSize) -> u64 {
        lb.as_u64()
    }
}

impl From<LogicalBlockSize> for usize {
    fn from(lb: LogicalBlockSize) -> usize {
        lb.as_usize()
    }
}

impl TryFrom<u64> for LogicalBlockSize {
    type Error = Error;

    fn try_from(v: u64) -> Result<Self, Self::Error> {
        match v {
            512 => Ok(LogicalBlockSize::Lb512),
            1024 => Ok(LogicalBlockSize::Lb1024),
            2048 => Ok(LogicalBlockSize::Lb2048),
            4096 => Ok(LogicalBlockSize::Lb4096),
            _ => Err(Error::BadValue("unsupported logical block size")),
        }
    }
}

/// The block-addressable region (session) a partition table lives in.
///
/// Offsets handed to the I/O helpers are relative to `offset`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Span {
    /// Absolute byte offset of the span on the device.
    pub offset: u64,
    /// Size of the span in bytes.
    pub size: u64,
    /// Logical block size of the device.
    pub block_size: LogicalBlockSize,
}

impl Span {
    /// Creates a span from absolute byte offset and size.
    pub fn new(offset: u64, size: u64, block_size: LogicalBlockSize) -> Self {
        Self {
            offset,
            size,
            block_size,
        }
    }

    /// Span from a block offset and block count, as hosts usually describe
    /// a session.
    pub fn from_blocks(
        block_offset: u64,
        block_count: u64,
        block_size: LogicalBlockSize,
    ) -> Result<Self, Error> {
        let lb = block_size.as_u64();
        let offset = block_offset
            .checked_mul(lb)
            .ok_or(Error::BadValue("span offset overflows"))?;
        let size = block_count
            .checked_mul(lb)
            .ok_or(Error::BadValue("span size overflows"))?;
        Ok(Self::new(offset, size, block_size))
    }

    /// Span covering a whole device, measured by seeking to its end.
    pub fn whole_device<D: Seek>(
        device: &mut D,
        block_size: LogicalBlockSize,
    ) -> Result<Self, Error> {
        let old_pos = device.stream_position()?;
        let len = device.seek(SeekFrom::End(0))?;
        device.seek(SeekFrom::Start(old_pos))?;
        let lb = block_size.as_u64();
        Ok(Self::new(0, len / lb * lb, block_size))
    }

    /// Block size in bytes.
    pub fn lb(&self) -> u64 {
        self.block_size.as_u64()
    }

    /// Number of whole blocks in the span.
    pub fn block_count(&self) -> u64 {
        self.size / self.lb()
    }

    /// Whether `[offset, offset + len)` lies inside the span.
    pub fn contains(&self, offset: u64, len: u64) -> bool {
        offset
            .checked_add(len)
            .map_or(false, |end| end <= self.size)
    }

    /// Same span, different block size: used to re-read tables that were
    /// authored with 512 byte sectors on larger-sector media.
    pub(crate) fn with_block_size(&self, block_size: LogicalBlockSize) -> Self {
        Self {
            block_size,
            ..*self
        }
    }
}

/// Reads `buf.len()` bytes at `offset` (relative to the span).
pub(crate) fn read_at<D: Read + Seek>(
    device: &mut D,
    span: &Span,
    offset: u64,
    buf: &mut [u8],
) -> Result<(), Error> {
    if !span.contains(offset, buf.len() as u64) {
        return Err(Error::BadData("read outside of the span"));
    }
    trace!("reading {} bytes at span offset {}", buf.len(), offset);
    device.seek(SeekFrom::Start(span.offset + offset))?;
    device.read_exact(buf)?;
    Ok(())
}

/// Writes `buf` at `offset` (relative to the span).
pub(crate) fn write_at<D: Write + Seek>(
    device: &mut D,
    span: &Span,
    offset: u64,
    buf: &[u8],
) -> Result<(), Error> {
    if !span.contains(offset, buf.len() as u64) {
        return Err(Error::BadValue("write outside of the span"));
    }
    trace!("writing {} bytes at span offset {}", buf.len(), offset);
    device.seek(SeekFrom::Start(span.offset + offset))?;
    device.write_all(buf)?;
    Ok(())
}

/// Reads one logical block.
pub(crate) fn read_block<D: Read + Seek>(
    device: &mut D,
    span: &Span,
    lba: u64,
) -> Result<Vec<u8>, Error> {
    let offset = lba
        .checked_mul(span.lb())
        .ok_or(Error::BadData("block number overflows"))?;
    let mut buf = alloc_zeroed(span.block_size.as_usize())?;
    read_at(device, span, offset, &mut buf)?;
    Ok(buf)
}

/// Zero-filled buffer; allocation failure is reported instead of aborting.
pub(crate) fn alloc_zeroed(len: usize) -> Result<Vec<u8>, Error> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len).map_err(|_| Error::NoMemory)?;
    buf.resize(len, 0);
    Ok(buf)
}

/// Copies `len` bytes from `from` to `to` (both relative to the span).
///
/// Overlapping regions are handled: when moving towards the end the copy
/// runs back to front.
pub(crate) fn move_data<D: Read + Write + Seek>(
    device: &mut D,
    span: &Span,
    from: u64,
    to: u64,
    len: u64,
) -> Result<(), Error> {
    if from == to || len == 0 {
        return Ok(());
    }
    if !span.contains(from, len) || !span.contains(to, len) {
        return Err(Error::BadValue("move outside of the span"));
    }

    let mut buf = move_buffer(span, len)?;
    let chunk = buf.len() as u64;
    debug!("moving {} bytes from {} to {}", len, from, to);

    let mut done = 0;
    while done < len {
        let n = chunk.min(len - done);
        // copying towards higher offsets must start with the tail
        let pos = if to > from { len - done - n } else { done };
        let part = &mut buf[..n as usize];
        read_at(device, span, from + pos, part)?;
        write_at(device, span, to + pos, part)?;
        done += n;
    }
    device.flush()?;
    Ok(())
}

/// Tries a large buffer first and halves it on allocation failure, down to
/// a single block.
fn move_buffer(span: &Span, len: u64) -> Result<Vec<u8>, Error> {
    let lb = span.block_size.as_usize();
    let mut size = MAX_MOVE_BUFFER.min(usize::try_from(len).unwrap_or(MAX_MOVE_BUFFER));
    loop {
        let mut buf = Vec::new();
        if buf.try_reserve_exact(size).is_ok() {
            buf.resize(size, 0);
            return Ok(buf);
        }
        if size <= lb {
            return Err(Error::NoMemory);
        }
        size = (size / 2).max(lb);
    }
}
