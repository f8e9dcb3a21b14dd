//! MBR-related types and helper functions.
//!
//! This module provides the on-disk primitives of Master Boot Record
//! tables (table sectors and partition records), the in-memory partition
//! map with its extended-partition chains, and the engine built on top.
//!
//! In memory every offset and size is a byte value relative to the start
//! of the span the map lives in.

use std::fmt;

use simple_bytes::{Bytes, BytesArray, BytesRead, BytesWrite};

use crate::geometry::Extent;
use crate::partition_types::{self, MbrType};

mod parser;
mod table;
mod writer;

pub(crate) use parser::parse;
pub use table::MbrTable;

/// Probe confidence of a parsed MBR map.
pub const CONFIDENCE: f32 = 0.5;
/// Default bound on the number of EBRs followed in one chain.
pub const MAX_LOGICAL_PARTITIONS: usize = 128;

const MBR_SIGNATURE: [u8; 2] = [0x55, 0xAA];
/// Size of the code area in front of the partition records.
const CODE_AREA_SIZE: usize = 446;
/// Size of the part of a table sector that carries data.
pub const TABLE_SECTOR_SIZE: usize = 512;

/// Protective MBR, as defined by GPT.
pub struct ProtectiveMBR {
    bootcode: [u8; 440],
    disk_signature: [u8; 4],
    unknown: u16,
    partitions: [PartRecord; 4],
    signature: [u8; 2],
}

impl fmt::Debug for ProtectiveMBR {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Protective MBR, partitions: {:#?}", self.partitions)
    }
}

impl ProtectiveMBR {
    /// Create a protective-MBR object with a specific protective partition size (in LB).
    /// The protective partition size should be the size of the disk - 1 (because the protective
    /// partition always begins at LBA 1 (the second sector)).
    pub fn with_lb_size(lb_size: u32) -> Self {
        Self {
            bootcode: [0x00; 440],
            disk_signature: [0x00; 4],
            unknown: 0,
            partitions: [
                PartRecord::new_protective(Some(lb_size)),
                PartRecord::zero(),
                PartRecord::zero(),
                PartRecord::zero(),
            ],
            signature: MBR_SIGNATURE,
        }
    }

    /// Return the memory representation of this MBR as a byte vector.
    ///
    /// This will always be 512
    pub fn to_bytes(&self) -> [u8; 512] {
        let mut bytes = BytesArray::from([0u8; 512]);

        bytes.write(self.bootcode);
        bytes.write(self.disk_signature);
        bytes.write_le_u16(self.unknown);

        for p in &self.partitions {
            bytes.write(p.to_bytes());
        }

        bytes.write(self.signature);

        bytes.into_array()
    }
}

/// A partition record, MBR-style.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PartRecord {
    /// Bit 7 set if partition is active (bootable)
    pub boot_indicator: u8,
    /// CHS address of partition start: 8-bit value of head in CHS address
    pub start_head: u8,
    /// CHS address of partition start: Upper 2 bits are 8th-9th bits of cylinder, lower 6 bits are sector
    pub start_sector: u8,
    /// CHS address of partition start: Lower 8 bits of cylinder
    pub start_track: u8,
    /// Partition type. See <https://www.win.tue.nl/~aeb/partitions/partition_types-1.html>
    pub os_type: u8,
    /// CHS address of partition end: 8-bit value of head in CHS address
    pub end_head: u8,
    /// CHS address of partition end: Upper 2 bits are 8th-9th bits of cylinder, lower 6 bits are sector
    pub end_sector: u8,
    /// CHS address of partition end: Lower 8 bits of cylinder
    pub end_track: u8,
    /// LBA of start of partition
    pub lb_start: u32,
    /// Number of sectors in partition
    pub lb_size: u32,
}

impl PartRecord {
    /// Create a protective Partition Record object with a specific disk size (in LB).
    pub fn new_protective(lb_size: Option<u32>) -> Self {
        let size = lb_size.unwrap_or(0xFF_FF_FF_FF);
        Self {
            boot_indicator: 0x00,
            start_head: 0x00,
            start_sector: 0x02,
            start_track: 0x00,
            os_type: partition_types::MBR_GPT_PROTECTIVE,
            end_head: 0xFF,
            end_sector: 0xFF,
            end_track: 0xFF,
            lb_start: 1,
            lb_size: size,
        }
    }

    /// A record addressing blocks by LBA only.
    ///
    /// The CHS fields are set to the "use LBA" marker values.
    pub fn new_lba(os_type: u8, active: bool, lb_start: u32, lb_size: u32) -> Self {
        Self {
            boot_indicator: if active { 0x80 } else { 0x00 },
            start_head: 0xFE,
            start_sector: 0xFF,
            start_track: 0xFF,
            os_type,
            end_head: 0xFE,
            end_sector: 0xFF,
            end_track: 0xFF,
            lb_start,
            lb_size,
        }
    }

    /// Create an all-zero Partition Record.
    pub fn zero() -> Self {
        Self {
            boot_indicator: 0x00,
            start_head: 0x00,
            start_sector: 0x00,
            start_track: 0x00,
            os_type: 0x00,
            end_head: 0x00,
            end_sector: 0x00,
            end_track: 0x00,
            lb_start: 0,
            lb_size: 0,
        }
    }

    /// An unused record has type 0 or no sectors.
    pub fn is_empty(&self) -> bool {
        self.os_type == partition_types::MBR_EMPTY || self.lb_size == 0
    }

    /// Whether the record points to the next EBR of a chain.
    pub fn is_extended(&self) -> bool {
        partition_types::is_extended(self.os_type)
    }

    /// Boot indicator bit.
    pub fn is_active(&self) -> bool {
        self.boot_indicator & 0x80 != 0
    }

    /// Parse 16 bytes into a Partition Record.
    pub fn from_bytes(buf: &[u8; 16]) -> Self {
        let mut bytes = Bytes::from(&buf[..]);

        Self {
            boot_indicator: bytes.read_u8(),
            start_head: bytes.read_u8(),
            start_sector: bytes.read_u8(),
            start_track: bytes.read_u8(),
            os_type: bytes.read_u8(),
            end_head: bytes.read_u8(),
            end_sector: bytes.read_u8(),
            end_track: bytes.read_u8(),
            lb_start: bytes.read_le_u32(),
            lb_size: bytes.read_le_u32(),
        }
    }

    /// Return the memory representation of this Partition Record as a byte vector.
    pub fn to_bytes(&self) -> [u8; 16] {
        let mut bytes = BytesArray::from([0u8; 16]);

        bytes.write_u8(self.boot_indicator);

        bytes.write_u8(self.start_head);
        bytes.write_u8(self.start_sector);
        bytes.write_u8(self.start_track);

        bytes.write_u8(self.os_type);

        bytes.write_u8(self.end_head);
        bytes.write_u8(self.end_sector);
        bytes.write_u8(self.end_track);

        bytes.write_le_u32(self.lb_start);
        bytes.write_le_u32(self.lb_size);

        bytes.into_array()
    }
}

/// The first 512 bytes of an MBR or EBR block.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TableSector {
    /// Boot code and, for the MBR, the disk signature.
    pub code_area: [u8; CODE_AREA_SIZE],
    /// The four partition records.
    pub records: [PartRecord; 4],
    /// The two signature bytes, `55 AA` when valid.
    pub signature: [u8; 2],
}

impl TableSector {
    /// An empty sector with a valid signature.
    pub fn new() -> Self {
        Self {
            code_area: [0; CODE_AREA_SIZE],
            records: [PartRecord::zero(); 4],
            signature: MBR_SIGNATURE,
        }
    }

    /// Parses the first 512 bytes of `buf`; the buffer must be that long.
    pub fn from_bytes(buf: &[u8]) -> Self {
        let mut sector = Self::new();
        let mut bytes = Bytes::from(&buf[..TABLE_SECTOR_SIZE]);

        sector.code_area.copy_from_slice(bytes.read(CODE_AREA_SIZE));
        for r in sector.records.iter_mut() {
            let mut raw = [0u8; 16];
            raw.copy_from_slice(bytes.read(16));
            *r = PartRecord::from_bytes(&raw);
        }
        sector.signature.copy_from_slice(bytes.read(2));
        sector
    }

    /// Serializes the sector.
    pub fn to_bytes(&self) -> [u8; TABLE_SECTOR_SIZE] {
        let mut bytes = BytesArray::from([0u8; TABLE_SECTOR_SIZE]);

        bytes.write(self.code_area);
        for r in &self.records {
            bytes.write(r.to_bytes());
        }
        bytes.write(self.signature);

        bytes.into_array()
    }

    /// Whether the sector ends with `55 AA`.
    pub fn has_signature(&self) -> bool {
        self.signature == MBR_SIGNATURE
    }

    /// Zeroes the boot code area.
    pub fn clear_code_area(&mut self) {
        self.code_area = [0; CODE_AREA_SIZE];
    }
}

impl Default for TableSector {
    fn default() -> Self {
        Self::new()
    }
}

/// A logical partition: one node of an extended partition's EBR chain.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LogicalPartition {
    /// Offset of the data region.
    pub offset: u64,
    /// Size of the data region.
    pub size: u64,
    /// Type byte, never an extended type.
    pub type_code: u8,
    /// Boot indicator.
    pub active: bool,
    /// Offset of the EBR describing this partition.
    pub pts_offset: u64,
    pub(crate) prev: Option<usize>,
    pub(crate) next: Option<usize>,
}

impl LogicalPartition {
    /// A node not linked into any chain yet.
    pub fn new(pts_offset: u64, offset: u64, size: u64, type_code: u8, active: bool) -> Self {
        Self {
            offset,
            size,
            type_code,
            active,
            pts_offset,
            prev: None,
            next: None,
        }
    }

    /// The data region.
    pub fn extent(&self) -> Extent {
        Extent::new(self.offset, self.size)
    }

    /// EBR plus data region, the space the node occupies in the chain.
    pub fn region(&self) -> Extent {
        Extent::new(self.pts_offset, self.offset + self.size - self.pts_offset)
    }

    /// Previous node in chain order.
    pub fn previous(&self) -> Option<usize> {
        self.prev
    }

    /// Next node in chain order.
    pub fn next(&self) -> Option<usize> {
        self.next
    }
}

/// One of the four primary slots.
///
/// When its type is extended the slot owns the chain of logical
/// partitions. Nodes live in an arena addressed by index; removed nodes
/// leave a hole so the indices of the others stay stable.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PrimarySlot {
    /// Offset of the partition.
    pub offset: u64,
    /// Size of the partition.
    pub size: u64,
    /// Type byte, 0 for an unused slot.
    pub type_code: u8,
    /// Boot indicator.
    pub active: bool,
    logicals: Vec<Option<LogicalPartition>>,
    head: Option<usize>,
}

impl PrimarySlot {
    /// A used slot without logical partitions.
    pub fn new(offset: u64, size: u64, type_code: u8, active: bool) -> Self {
        Self {
            offset,
            size,
            type_code,
            active,
            logicals: Vec::new(),
            head: None,
        }
    }

    /// Whether the slot is unused.
    pub fn is_empty(&self) -> bool {
        self.type_code == partition_types::MBR_EMPTY || self.size == 0
    }

    /// Whether the slot holds an extended partition.
    pub fn is_extended(&self) -> bool {
        !self.is_empty() && partition_types::is_extended(self.type_code)
    }

    /// Registry entry for the type byte.
    pub fn mbr_type(&self) -> MbrType {
        MbrType::from_code(self.type_code)
    }

    /// The partition's extent.
    pub fn extent(&self) -> Extent {
        Extent::new(self.offset, self.size)
    }

    /// Turns the slot into an unused one, dropping any chain.
    pub fn unset(&mut self) {
        *self = Self::default();
    }

    /// First node of the chain.
    pub fn head(&self) -> Option<usize> {
        self.head
    }

    /// Node at arena index `index`, if it is still linked.
    pub fn logical(&self, index: usize) -> Option<&LogicalPartition> {
        self.logicals.get(index).and_then(Option::as_ref)
    }

    pub(crate) fn logical_mut(&mut self, index: usize) -> Option<&mut LogicalPartition> {
        self.logicals.get_mut(index).and_then(Option::as_mut)
    }

    /// Nodes in chain order with their arena index.
    pub fn logicals(&self) -> LogicalIter<'_> {
        LogicalIter {
            slot: self,
            cursor: self.head,
            steps: 0,
        }
    }

    /// Number of linked nodes.
    pub fn logical_count(&self) -> usize {
        self.logicals.iter().filter(|l| l.is_some()).count()
    }

    /// Appends a node behind the current tail, used while parsing where
    /// nodes arrive in chain order.
    pub(crate) fn push_logical(&mut self, mut logical: LogicalPartition) -> usize {
        let index = self.logicals.len();
        let tail = self.logicals().last().map(|(i, _)| i);
        logical.prev = tail;
        logical.next = None;
        self.logicals.push(Some(logical));
        match tail.and_then(|t| self.logical_mut(t)) {
            Some(t) => t.next = Some(index),
            None => self.head = Some(index),
        }
        index
    }

    /// Links a node in, keeping the chain sorted by EBR offset.
    pub(crate) fn insert_logical(&mut self, mut logical: LogicalPartition) -> usize {
        let index = self.logicals.len();
        let prev = self
            .logicals()
            .filter(|(_, l)| l.pts_offset < logical.pts_offset)
            .last()
            .map(|(i, _)| i);
        let next = match prev {
            Some(p) => self.logical(p).and_then(|l| l.next),
            None => self.head,
        };
        logical.prev = prev;
        logical.next = next;
        self.logicals.push(Some(logical));

        match prev.and_then(|p| self.logical_mut(p)) {
            Some(p) => p.next = Some(index),
            None => self.head = Some(index),
        }
        if let Some(n) = next.and_then(|n| self.logical_mut(n)) {
            n.prev = Some(index);
        }
        index
    }

    /// Unlinks node `index`, its arena slot stays reserved so it can be
    /// linked back with [`PrimarySlot::relink_logical`].
    pub(crate) fn unlink_logical(&mut self, index: usize) -> Option<LogicalPartition> {
        let node = self.logicals.get_mut(index)?.take()?;
        match node.prev.and_then(|p| self.logical_mut(p)) {
            Some(p) => p.next = node.next,
            None => self.head = node.next,
        }
        if let Some(n) = node.next.and_then(|n| self.logical_mut(n)) {
            n.prev = node.prev;
        }
        Some(node)
    }

    /// Undoes [`PrimarySlot::unlink_logical`].
    pub(crate) fn relink_logical(&mut self, index: usize, node: LogicalPartition) {
        let (prev, next) = (node.prev, node.next);
        if let Some(slot) = self.logicals.get_mut(index) {
            *slot = Some(node);
        }
        match prev.and_then(|p| self.logical_mut(p)) {
            Some(p) => p.next = Some(index),
            None => self.head = Some(index),
        }
        if let Some(n) = next.and_then(|n| self.logical_mut(n)) {
            n.prev = Some(index);
        }
    }

    /// Drops the hole left by the last inserted node.
    pub(crate) fn discard_last(&mut self, index: usize) {
        if index + 1 == self.logicals.len() {
            self.logicals.pop();
        }
    }
}

/// Iterator over a chain in link order.
pub struct LogicalIter<'a> {
    slot: &'a PrimarySlot,
    cursor: Option<usize>,
    steps: usize,
}

impl<'a> Iterator for LogicalIter<'a> {
    type Item = (usize, &'a LogicalPartition);

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.cursor?;
        // a corrupted link can never make the walk longer than the arena
        if self.steps >= self.slot.logicals.len() {
            return None;
        }
        self.steps += 1;
        let node = self.slot.logical(index)?;
        self.cursor = node.next;
        Some((index, node))
    }
}

/// The four primary slots of an MBR.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PartitionMap {
    /// Slots in on-disk order.
    pub primaries: [PrimarySlot; 4],
}

impl PartitionMap {
    /// A map with four unused slots.
    pub fn new() -> Self {
        Self::default()
    }

    /// Slot index of the extended partition.
    pub fn extended_index(&self) -> Option<usize> {
        self.primaries.iter().position(PrimarySlot::is_extended)
    }

    /// Primary and logical partitions that hold data.
    pub fn count_partitions(&self) -> usize {
        self.primaries
            .iter()
            .filter(|p| !p.is_empty())
            .map(|p| 1 + p.logical_count())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_sector_layout() {
        let mut s = TableSector::new();
        s.code_area[0] = 0xeb;
        s.records[1] = PartRecord::new_lba(0x83, true, 2048, 4096);
        let raw = s.to_bytes();
        assert_eq!(raw[0], 0xeb);
        assert_eq!(raw[446 + 16], 0x80);
        assert_eq!(raw[446 + 16 + 4], 0x83);
        assert_eq!(&raw[446 + 16 + 8..446 + 16 + 12], &2048u32.to_le_bytes());
        assert_eq!(&raw[510..], &[0x55, 0xaa]);

        let parsed = TableSector::from_bytes(&raw);
        assert_eq!(parsed, s);
        assert!(parsed.records[1].is_active());
        assert!(parsed.records[0].is_empty());
    }

    #[test]
    fn protective_record() {
        let raw = ProtectiveMBR::with_lb_size(1000).to_bytes();
        let sector = TableSector::from_bytes(&raw);
        assert!(sector.has_signature());
        assert_eq!(sector.records[0].os_type, 0xee);
        assert_eq!(sector.records[0].lb_start, 1);
        assert_eq!(sector.records[0].lb_size, 1000);
    }

    fn node(pts: u64) -> LogicalPartition {
        LogicalPartition::new(pts, pts + 512, 1024, 0x83, false)
    }

    #[test]
    fn chain_insert_keeps_ebr_order() {
        let mut slot = PrimarySlot::new(512, 1 << 20, 0x05, false);
        let a = slot.insert_logical(node(8192));
        let b = slot.insert_logical(node(1024));
        let c = slot.insert_logical(node(4096));

        let order: Vec<usize> = slot.logicals().map(|(i, _)| i).collect();
        assert_eq!(order, vec![b, c, a]);
        assert_eq!(slot.head(), Some(b));
        assert_eq!(slot.logical(c).unwrap().previous(), Some(b));
        assert_eq!(slot.logical(c).unwrap().next(), Some(a));
    }

    #[test]
    fn unlink_and_relink() {
        let mut slot = PrimarySlot::new(512, 1 << 20, 0x05, false);
        let a = slot.push_logical(node(1024));
        let b = slot.push_logical(node(4096));
        let c = slot.push_logical(node(8192));

        let head = slot.unlink_logical(a).unwrap();
        assert_eq!(slot.head(), Some(b));
        assert_eq!(slot.logical(b).unwrap().previous(), None);
        assert!(slot.logical(a).is_none());

        let mid = slot.unlink_logical(c).unwrap();
        assert_eq!(slot.logical(b).unwrap().next(), None);

        slot.relink_logical(c, mid);
        slot.relink_logical(a, head);
        let order: Vec<usize> = slot.logicals().map(|(i, _)| i).collect();
        assert_eq!(order, vec![a, b, c]);
        assert_eq!(slot.logical_count(), 3);
    }
}
