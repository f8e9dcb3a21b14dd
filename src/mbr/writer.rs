//! Serializes the primary table and EBR sectors.
//!
//! Every function validates all descriptors it is about to write before
//! the first byte reaches the device.

use super::{
    LogicalPartition, PartRecord, PartitionMap, PrimarySlot, TableSector, TABLE_SECTOR_SIZE,
};
use crate::disk::{self, Span};
use crate::geometry::{self, Extent};
use crate::{DiskDevice, Error};

/// Type byte of the link descriptors pointing to the next EBR.
const LINK_TYPE: u8 = 0x05;

/// Converts a byte extent into an LBA record, `start` relative to `base`.
fn lba_record(
    span: &Span,
    base: u64,
    extent: Extent,
    type_code: u8,
    active: bool,
) -> Result<PartRecord, Error> {
    let lb = span.lb();
    if extent.start % lb != 0 || extent.size % lb != 0 || extent.start < base {
        return Err(Error::BadValue("partition not aligned to the block size"));
    }
    let start = u32::try_from((extent.start - base) / lb)
        .map_err(|_| Error::BadValue("partition start does not fit into 32 bits"))?;
    let size = u32::try_from(extent.size / lb)
        .map_err(|_| Error::BadValue("partition size does not fit into 32 bits"))?;
    Ok(PartRecord::new_lba(type_code, active, start, size))
}

/// Reads the table sector at `offset`, for rewriting it in place.
fn read_sector<D: DiskDevice>(
    device: &mut D,
    span: &Span,
    offset: u64,
) -> Result<TableSector, Error> {
    let mut buf = [0u8; TABLE_SECTOR_SIZE];
    disk::read_at(device, span, offset, &mut buf)?;
    Ok(TableSector::from_bytes(&buf))
}

fn write_sector<D: DiskDevice>(
    device: &mut D,
    span: &Span,
    offset: u64,
    sector: &TableSector,
) -> Result<(), Error> {
    disk::write_at(device, span, offset, &sector.to_bytes())?;
    device.flush()?;
    Ok(())
}

/// Writes the four primary slots to block 0.
///
/// Boot code and disk signature of the existing sector are kept unless
/// `clear_code` is set.
pub(crate) fn write_primary<D: DiskDevice>(
    device: &mut D,
    span: &Span,
    map: &PartitionMap,
    clear_code: bool,
) -> Result<(), Error> {
    let mut records = [PartRecord::zero(); 4];
    for (record, slot) in records.iter_mut().zip(&map.primaries) {
        if slot.is_empty() {
            continue;
        }
        if !geometry::check_location(&slot.extent(), span.lb(), span.size) {
            return Err(Error::BadValue("primary partition outside of the span"));
        }
        *record = lba_record(span, 0, slot.extent(), slot.type_code, slot.active)?;
    }

    let mut sector = read_sector(device, span, 0)?;
    if clear_code {
        sector.clear_code_area();
    }
    sector.records = records;
    sector.signature = TableSector::new().signature;
    trace!("writing primary table {:?}", sector.records);
    write_sector(device, span, 0, &sector)
}

/// Descriptor pair for one EBR: the node's data region relative to its own
/// sector and, when `next` exists, a link whose start is relative to the
/// extended base and whose size covers `next`'s EBR and data.
fn ebr_records(
    span: &Span,
    extended: &PrimarySlot,
    node: &LogicalPartition,
    next: Option<&LogicalPartition>,
) -> Result<[PartRecord; 4], Error> {
    let mut records = [PartRecord::zero(); 4];

    let extended_end = extended.offset + extended.size;
    if node.pts_offset < extended.offset
        || node.offset <= node.pts_offset
        || node.size == 0
        || node.region().end() > extended_end
    {
        return Err(Error::BadValue("logical partition outside of the extended partition"));
    }
    records[0] = lba_record(span, node.pts_offset, node.extent(), node.type_code, node.active)?;

    if let Some(next) = next {
        records[1] = lba_record(span, extended.offset, next.region(), LINK_TYPE, false)?;
    }
    Ok(records)
}

/// Writes the EBR of node `index`, linking it to its successor.
pub(crate) fn write_logical<D: DiskDevice>(
    device: &mut D,
    span: &Span,
    extended: &PrimarySlot,
    index: usize,
    clear_code: bool,
) -> Result<(), Error> {
    let node = extended
        .logical(index)
        .ok_or(Error::BadValue("no such logical partition"))?;
    let next = node.next().and_then(|n| extended.logical(n));
    write_extended(device, span, extended, node, next, clear_code)
}

/// Writes `node`'s EBR with a link to `next`.
pub(crate) fn write_extended<D: DiskDevice>(
    device: &mut D,
    span: &Span,
    extended: &PrimarySlot,
    node: &LogicalPartition,
    next: Option<&LogicalPartition>,
    clear_code: bool,
) -> Result<(), Error> {
    let records = ebr_records(span, extended, node, next)?;

    let mut sector = read_sector(device, span, node.pts_offset)?;
    if clear_code {
        sector.clear_code_area();
    }
    sector.records = records;
    sector.signature = TableSector::new().signature;
    trace!("writing EBR at {}", node.pts_offset);
    write_sector(device, span, node.pts_offset, &sector)
}

/// Makes the sector at the extended base point to the chain head.
///
/// When the head's own EBR sits at the base it is written as is, otherwise
/// the base gets a sector holding only a link (or nothing for an empty
/// chain).
pub(crate) fn write_extended_head<D: DiskDevice>(
    device: &mut D,
    span: &Span,
    extended: &PrimarySlot,
    clear_code: bool,
) -> Result<(), Error> {
    let head = extended.head().and_then(|h| extended.logical(h));
    if let Some(head) = head {
        if head.pts_offset == extended.offset {
            let next = head.next().and_then(|n| extended.logical(n));
            return write_extended(device, span, extended, head, next, clear_code);
        }
    }

    let mut records = [PartRecord::zero(); 4];
    if let Some(head) = head {
        records[1] = lba_record(span, extended.offset, head.region(), LINK_TYPE, false)?;
    }
    if !span.contains(extended.offset, TABLE_SECTOR_SIZE as u64) {
        return Err(Error::BadValue("extended partition outside of the span"));
    }

    let mut sector = read_sector(device, span, extended.offset)?;
    if clear_code {
        sector.clear_code_area();
    }
    sector.records = records;
    sector.signature = TableSector::new().signature;
    trace!("writing extended head at {}", extended.offset);
    write_sector(device, span, extended.offset, &sector)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Cursor;

    use crate::disk::LogicalBlockSize;
    use crate::TableConfig;

    const LB: u64 = 512;

    fn setup() -> (Cursor<Vec<u8>>, Span) {
        let dev = Cursor::new(vec![0u8; 1 << 20]);
        (dev, Span::new(0, 1 << 20, LogicalBlockSize::Lb512))
    }

    #[test]
    fn primary_keeps_boot_code() {
        let (mut dev, span) = setup();
        dev.get_mut()[..4].copy_from_slice(&[0xfa, 0x33, 0xc0, 0x8e]);
        dev.get_mut()[440..444].copy_from_slice(&[1, 2, 3, 4]);

        let mut map = PartitionMap::new();
        map.primaries[2] = PrimarySlot::new(2048 * LB, 100 * LB, 0x83, true);
        write_primary(&mut dev, &span, &map, false).unwrap();

        let raw = dev.get_ref();
        assert_eq!(&raw[..4], &[0xfa, 0x33, 0xc0, 0x8e]);
        assert_eq!(&raw[440..444], &[1, 2, 3, 4]);
        let sector = TableSector::from_bytes(raw);
        assert_eq!(sector.records[2].lb_start, 2048);
        assert!(sector.records[2].is_active());

        write_primary(&mut dev, &span, &map, true).unwrap();
        assert!(dev.get_ref()[..446].iter().all(|b| *b == 0));
    }

    #[test]
    fn invalid_slots_never_reach_disk() {
        let (mut dev, span) = setup();
        let mut map = PartitionMap::new();
        map.primaries[0] = PrimarySlot::new(LB, 100 * LB, 0x83, false);
        map.primaries[1] = PrimarySlot::new(1000, 100 * LB, 0x83, false);
        assert!(write_primary(&mut dev, &span, &map, false).is_err());

        map.primaries[1] = PrimarySlot::new(4096 * LB, 100 * LB, 0x83, false);
        assert!(write_primary(&mut dev, &span, &map, false).is_err());
        assert!(dev.get_ref().iter().all(|b| *b == 0));
    }

    #[test]
    fn chain_round_trips_through_the_parser() {
        let (mut dev, span) = setup();
        let mut map = PartitionMap::new();
        map.primaries[0] = PrimarySlot::new(100 * LB, 1000 * LB, 0x0f, false);
        let ext = &mut map.primaries[0];
        ext.insert_logical(LogicalPartition::new(300 * LB, 301 * LB, 50 * LB, 0x83, false));
        ext.insert_logical(LogicalPartition::new(200 * LB, 201 * LB, 20 * LB, 0x07, true));

        write_primary(&mut dev, &span, &map, true).unwrap();
        let ext = &map.primaries[0];
        for (i, _) in ext.logicals() {
            write_logical(&mut dev, &span, ext, i, true).unwrap();
        }
        write_extended_head(&mut dev, &span, ext, true).unwrap();

        // link from the base sector, relative to the extended base
        let base = TableSector::from_bytes(&dev.get_ref()[100 * 512..]);
        assert!(base.records[0].is_empty());
        assert_eq!(base.records[1].lb_start, 100);
        assert_eq!(base.records[1].lb_size, 21);

        let (_, parsed) = super::super::parse(&mut dev, &span, &TableConfig::new()).unwrap();
        let chain: Vec<&LogicalPartition> =
            parsed.primaries[0].logicals().map(|(_, l)| l).collect();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].offset, 201 * LB);
        assert!(chain[0].active);
        assert_eq!(chain[1].offset, 301 * LB);
        assert_eq!(chain[1].type_code, 0x83);
    }
}
