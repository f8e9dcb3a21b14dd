//! A pure-Rust engine to read, validate and rewrite partition tables.
//!
//! It supports GUID Partition Tables (GPT) as well as legacy MBR tables
//! including the logical partitions of an extended partition. A table
//! lives inside a [`disk::Span`] of a device; raw disk devices as well as
//! disk images are supported.
//!
//! ```
//! use ptable::disk::{LogicalBlockSize, Span};
//! use ptable::TableConfig;
//!
//! const TOTAL_BYTES: u64 = 1024 * 1024;
//! let device = std::io::Cursor::new(vec![0u8; TOTAL_BYTES as usize]);
//! let span = Span::new(0, TOTAL_BYTES, LogicalBlockSize::Lb512);
//!
//! let mut table = TableConfig::new()
//!     .writable(true)
//!     .initialize_gpt(device, span)
//!     .expect("failed to write an empty GPT");
//! let id = table
//!     .create_child(None, 0, 64 * 1024, "Linux data", "root")
//!     .expect("failed to create a partition");
//! table.set_type(id, "Haiku").expect("failed to change the type");
//!
//! // scan the device again, the way a host would after a change
//! let device = table.take_device();
//! let table = ptable::scan(device, span).expect("no partition table found");
//! for p in table.partitions() {
//!     println!("{p}");
//! }
//! assert_eq!(table.partitions()[0].type_name, "Haiku");
//! ```

#![deny(missing_docs)]

use std::io::{Read, Seek, Write};
use std::{fmt, fs, io, path};

#[macro_use]
mod macros;
#[macro_use]
mod logging;
pub mod disk;
pub mod entry;
pub mod geometry;
pub mod gpt;
pub mod header;
pub mod mbr;
pub mod partition;
pub mod partition_types;

use disk::Span;
use gpt::GptTable;
use header::HeaderError;
use mbr::MbrTable;
use partition::{Partition, PartitionId};
use partition_types::TypeId;

/// A generic device that we can read/write partitions from/to.
pub trait DiskDevice: Read + Write + Seek + std::fmt::Debug {}
/// Implement the DiskDevice trait for anything that meets the
/// requirements, e.g., `std::fs::File`
impl<T> DiskDevice for T where T: Read + Write + Seek + std::fmt::Debug {}

#[non_exhaustive]
#[derive(Debug)]
/// Errors returned when interacting with a partition table.
pub enum Error {
    /// Generic IO Error
    Io(io::Error),
    /// A GPT header or entry array failed validation
    Header(HeaderError),
    /// On-disk structures are inconsistent
    BadData(&'static str),
    /// A request that cannot be satisfied
    BadValue(&'static str),
    /// A buffer could not be allocated
    NoMemory,
    /// The format has no such feature
    NotSupported(&'static str),
    /// table not opened in writable mode
    ReadOnly,
}

/// Coarse classification of an [`Error`], what a host reports upwards.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    /// The device failed.
    IoError,
    /// What is on disk is unusable.
    BadData,
    /// The caller asked for something impossible.
    BadValue,
    /// Out of memory.
    NoMemory,
    /// Not available for this table.
    NotSupported,
}

impl Error {
    /// Classifies the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(_) | Error::Header(HeaderError::Io(_)) => ErrorKind::IoError,
            Error::Header(e) if e.is_builder_error() => ErrorKind::BadValue,
            Error::Header(_) | Error::BadData(_) => ErrorKind::BadData,
            Error::BadValue(_) => ErrorKind::BadValue,
            Error::NoMemory => ErrorKind::NoMemory,
            Error::NotSupported(_) | Error::ReadOnly => ErrorKind::NotSupported,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<HeaderError> for Error {
    fn from(e: HeaderError) -> Self {
        Self::Header(e)
    }
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Error::*;
        let desc = match self {
            Io(e) => return write!(fmt, "partition table IO Error: {e}"),
            Header(e) => return write!(fmt, "GPT Header Error: {e}"),
            BadData(m) => return write!(fmt, "bad partition table: {m}"),
            BadValue(m) => return write!(fmt, "invalid request: {m}"),
            NoMemory => "not enough memory for the operation",
            NotSupported(m) => return write!(fmt, "not supported: {m}"),
            ReadOnly => "table not opened in writable mode",
        };
        write!(fmt, "{desc}")
    }
}

/// Configuration options to open or initialize a partition table.
///
/// ## Default
/// By Default the table is readonly and only one GPT header needs to be
/// valid. EBR chains are followed for at most 128 links, and MBRs on
/// devices with large sectors are also tried with 512 byte sectors.
///
/// ```
/// # use ptable::TableConfig;
/// let _default_config = TableConfig::new()
///     .writable(false)
///     .only_valid_headers(false)
///     .max_logical_partitions(128)
///     .probe_legacy_block_size(true);
/// ```
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TableConfig {
    /// Whether the table may be modified.
    writable: bool,
    /// Force both the primary and backup GPT header to be valid
    only_valid_headers: bool,
    /// Bound on the EBRs followed in one chain
    max_logical_partitions: usize,
    /// Retry MBRs with 512 byte sectors on larger-sector devices
    probe_legacy_block_size: bool,
}

impl TableConfig {
    /// Create a new default configuration.
    pub fn new() -> Self {
        TableConfig::default()
    }

    /// Whether to open the partition table in writable mode.
    pub fn writable(mut self, writable: bool) -> Self {
        self.writable = writable;
        self
    }

    /// Sets wether both GPT headers need to be valid to open a device.
    pub fn only_valid_headers(mut self, only_valid_headers: bool) -> Self {
        self.only_valid_headers = only_valid_headers;
        self
    }

    /// Sets how many EBRs are followed before a chain counts as corrupt.
    pub fn max_logical_partitions(mut self, max: usize) -> Self {
        self.max_logical_partitions = max;
        self
    }

    /// Sets wether MBRs are also parsed with 512 byte sectors when the
    /// device reports a larger block size.
    pub fn probe_legacy_block_size(mut self, probe: bool) -> Self {
        self.probe_legacy_block_size = probe;
        self
    }

    /// Open the device at the given path and scan `span` according to the
    /// configuration options.
    pub fn open(
        self,
        diskpath: impl AsRef<path::Path>,
        span: Span,
    ) -> Result<PartitionTable<fs::File>, Error> {
        let file = fs::OpenOptions::new()
            .write(self.writable)
            .read(true)
            .open(diskpath)?;
        self.open_from_device(file, span)
    }

    /// Scans `span` of the device for a GPT and an MBR and keeps the one
    /// with the higher confidence.
    ///
    /// A clean GPT (0.81) beats an MBR (0.5), which beats a GPT with only
    /// one valid header (0.45).
    pub fn open_from_device<D>(self, mut device: D, span: Span) -> Result<PartitionTable<D>, Error>
    where
        D: DiskDevice,
    {
        let gpt = gpt::probe(&mut device, &span, &self);
        let mbr = mbr::parse(&mut device, &span, &self);

        let table = match (gpt, mbr) {
            (Ok(layout), Ok(_)) if layout.confidence() > mbr::CONFIDENCE => {
                PartitionTable::Gpt(GptTable::from_layout(device, span, self.writable, layout))
            }
            (Ok(layout), Err(e)) => {
                debug!("no MBR: {}", e);
                PartitionTable::Gpt(GptTable::from_layout(device, span, self.writable, layout))
            }
            (gpt, Ok((mbr_span, map))) => {
                if let Err(e) = gpt {
                    debug!("no GPT: {}", e);
                }
                PartitionTable::Mbr(MbrTable::from_map(device, mbr_span, self.writable, map))
            }
            (Err(e @ Error::Io(_)), Err(_))
            | (Err(_), Err(e @ Error::Io(_)))
            | (Err(e @ Error::NoMemory), Err(_))
            | (Err(_), Err(e @ Error::NoMemory)) => return Err(e),
            (Err(g), Err(m)) => {
                debug!("no GPT: {}, no MBR: {}", g, m);
                return Err(Error::BadData("no partition table found"));
            }
        };
        debug!(
            "found {} (confidence {})",
            table.pretty_name(),
            table.confidence()
        );
        Ok(table)
    }

    /// Writes an empty GPT (protective MBR, both headers, empty entry
    /// arrays) with a random disk GUID.
    pub fn initialize_gpt<D>(self, device: D, span: Span) -> Result<PartitionTable<D>, Error>
    where
        D: DiskDevice,
    {
        if !self.writable {
            return Err(Error::ReadOnly);
        }
        GptTable::initialize(device, span, None).map(PartitionTable::Gpt)
    }

    /// Writes an empty MBR with the boot code cleared.
    pub fn initialize_mbr<D>(self, device: D, span: Span) -> Result<PartitionTable<D>, Error>
    where
        D: DiskDevice,
    {
        if !self.writable {
            return Err(Error::ReadOnly);
        }
        MbrTable::initialize(device, span).map(PartitionTable::Mbr)
    }
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            writable: false,
            only_valid_headers: false,
            max_logical_partitions: mbr::MAX_LOGICAL_PARTITIONS,
            probe_legacy_block_size: true,
        }
    }
}

/// Scans `span` of `device` read-only with the default configuration.
pub fn scan<D: DiskDevice>(device: D, span: Span) -> Result<PartitionTable<D>, Error> {
    TableConfig::new().open_from_device(device, span)
}

/// A partition table of either format.
#[derive(Debug)]
pub enum PartitionTable<D> {
    /// GUID Partition Table.
    Gpt(GptTable<D>),
    /// MBR with optional extended partition.
    Mbr(MbrTable<D>),
}

impl<D> PartitionTable<D> {
    /// Human readable name of the format.
    pub fn pretty_name(&self) -> &'static str {
        match self {
            PartitionTable::Gpt(_) => "EFI GUID Partition Map",
            PartitionTable::Mbr(_) => "Intel Partition Map",
        }
    }

    /// Probe confidence of the table.
    pub fn confidence(&self) -> f32 {
        match self {
            PartitionTable::Gpt(t) => t.confidence(),
            PartitionTable::Mbr(t) => t.confidence(),
        }
    }

    /// All partitions, as host descriptors.
    pub fn partitions(&self) -> Vec<Partition> {
        match self {
            PartitionTable::Gpt(t) => t.partitions(),
            PartitionTable::Mbr(t) => t.partitions(),
        }
    }

    /// `(id, display name)` of the types the format knows.
    pub fn supported_types(&self) -> Vec<(TypeId, &'static str)> {
        match self {
            PartitionTable::Gpt(t) => t.supported_types(),
            PartitionTable::Mbr(t) => t.supported_types(),
        }
    }

    /// The span the table lives in.
    pub fn span(&self) -> &Span {
        match self {
            PartitionTable::Gpt(t) => t.span(),
            PartitionTable::Mbr(t) => t.span(),
        }
    }

    /// Get a reference to to the underlying device.
    pub fn device_ref(&self) -> &D {
        match self {
            PartitionTable::Gpt(t) => t.device_ref(),
            PartitionTable::Mbr(t) => t.device_ref(),
        }
    }

    /// Take the underlying device object.
    pub fn take_device(self) -> D {
        match self {
            PartitionTable::Gpt(t) => t.take_device(),
            PartitionTable::Mbr(t) => t.take_device(),
        }
    }

    /// Unused `(absolute offset, size)` stretches a partition could be
    /// created in. `parent` selects the inside of an MBR extended
    /// partition.
    pub fn partitionable_spaces(
        &self,
        parent: Option<PartitionId>,
    ) -> Result<Vec<(u64, u64)>, Error> {
        match self {
            PartitionTable::Gpt(t) => {
                no_gpt_parent(parent)?;
                t.partitionable_spaces()
            }
            PartitionTable::Mbr(t) => t.partitionable_spaces(parent),
        }
    }

    /// Adjusted `(absolute offset, size)` a create request would get.
    pub fn validate_create_child(
        &self,
        parent: Option<PartitionId>,
        offset: u64,
        size: u64,
    ) -> Result<(u64, u64), Error> {
        match self {
            PartitionTable::Gpt(t) => {
                no_gpt_parent(parent)?;
                t.validate_create_child(offset, size)
            }
            PartitionTable::Mbr(t) => t.validate_create_child(parent, offset, size),
        }
    }

    /// Size a resize request would get.
    pub fn validate_resize_child(&self, id: PartitionId, size: u64) -> Result<u64, Error> {
        match self {
            PartitionTable::Gpt(t) => t.validate_resize_child(id, size),
            PartitionTable::Mbr(t) => t.validate_resize_child(id, size),
        }
    }

    /// Absolute offset a move request would get.
    pub fn validate_move_child(&self, id: PartitionId, offset: u64) -> Result<u64, Error> {
        match self {
            PartitionTable::Gpt(t) => t.validate_move_child(id, offset),
            PartitionTable::Mbr(t) => t.validate_move_child(id, offset),
        }
    }
}

impl<D> PartitionTable<D>
where
    D: DiskDevice,
{
    /// Creates a partition. `parent` is only used for logical partitions
    /// inside an MBR extended partition; MBR partitions take no name.
    pub fn create_child(
        &mut self,
        parent: Option<PartitionId>,
        offset: u64,
        size: u64,
        part_type: &str,
        name: &str,
    ) -> Result<PartitionId, Error> {
        match self {
            PartitionTable::Gpt(t) => {
                no_gpt_parent(parent)?;
                t.create_child(offset, size, part_type, name)
            }
            PartitionTable::Mbr(t) => {
                if !name.is_empty() {
                    return Err(Error::NotSupported("MBR partitions have no name"));
                }
                t.create_child(parent, offset, size, part_type)
            }
        }
    }

    /// Resizes a partition, returns the applied size.
    pub fn resize_child(&mut self, id: PartitionId, size: u64) -> Result<u64, Error> {
        match self {
            PartitionTable::Gpt(t) => t.resize_child(id, size),
            PartitionTable::Mbr(t) => t.resize_child(id, size),
        }
    }

    /// Moves a partition with its contents, returns the applied absolute
    /// offset.
    pub fn move_child(&mut self, id: PartitionId, offset: u64) -> Result<u64, Error> {
        match self {
            PartitionTable::Gpt(t) => t.move_child(id, offset),
            PartitionTable::Mbr(t) => t.move_child(id, offset),
        }
    }

    /// Changes the type of a partition, given by display name (or GUID /
    /// hex code).
    pub fn set_type(&mut self, id: PartitionId, part_type: &str) -> Result<(), Error> {
        match self {
            PartitionTable::Gpt(t) => t.set_type(id, part_type),
            PartitionTable::Mbr(t) => t.set_type(id, part_type),
        }
    }

    /// Renames a partition; `NotSupported` for MBR.
    pub fn set_name(&mut self, id: PartitionId, name: &str) -> Result<(), Error> {
        match self {
            PartitionTable::Gpt(t) => t.set_name(id, name),
            PartitionTable::Mbr(t) => t.set_name(id, name),
        }
    }

    /// Deletes a partition; the ids of the others stay valid.
    pub fn delete_child(&mut self, id: PartitionId) -> Result<(), Error> {
        match self {
            PartitionTable::Gpt(t) => t.delete_child(id),
            PartitionTable::Mbr(t) => t.delete_child(id),
        }
    }
}

fn no_gpt_parent(parent: Option<PartitionId>) -> Result<(), Error> {
    match parent {
        None => Ok(()),
        Some(_) => Err(Error::BadValue("GPT partitions have no children")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kinds() {
        assert_eq!(Error::BadData("x").kind(), ErrorKind::BadData);
        assert_eq!(
            Error::Header(HeaderError::InvalidCRC32Checksum).kind(),
            ErrorKind::BadData
        );
        assert_eq!(
            Error::Header(HeaderError::BackupLbaToEarly).kind(),
            ErrorKind::BadValue
        );
        let io = io::Error::new(io::ErrorKind::UnexpectedEof, "short");
        assert_eq!(Error::Header(HeaderError::Io(io)).kind(), ErrorKind::IoError);
        assert_eq!(Error::ReadOnly.kind(), ErrorKind::NotSupported);
        assert_eq!(
            Error::BadValue("no room").to_string(),
            "invalid request: no room"
        );
    }

    #[test]
    fn default_config() {
        let c = TableConfig::new();
        assert!(!c.writable);
        assert_eq!(c.max_logical_partitions, 128);
        assert!(c.probe_legacy_block_size);
    }
}
