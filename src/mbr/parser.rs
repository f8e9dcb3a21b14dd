//! Reads the primary table and the EBR chain of the extended partition.

use std::io::{Read, Seek};

use super::{LogicalPartition, PartRecord, PartitionMap, PrimarySlot, TableSector};
use crate::disk::{self, LogicalBlockSize, Span};
use crate::geometry::{self, Extent, Resolution};
use crate::{Error, TableConfig};

/// Parses the MBR at block 0 of `span`.
///
/// When the span's block size is not 512 and probing is enabled, the table
/// is parsed a second time with 512 byte sectors and the parse with more
/// partitions wins. The span the map was parsed with is returned alongside.
pub(crate) fn parse<D: Read + Seek>(
    device: &mut D,
    span: &Span,
    config: &TableConfig,
) -> Result<(Span, PartitionMap), Error> {
    let declared = parse_with(device, span, config);
    if span.block_size == LogicalBlockSize::Lb512 || !config.probe_legacy_block_size {
        return declared.map(|map| (*span, map));
    }

    let legacy_span = span.with_block_size(LogicalBlockSize::Lb512);
    let legacy = parse_with(device, &legacy_span, config);
    match (declared, legacy) {
        (Ok(d), Ok(l)) if l.count_partitions() > d.count_partitions() => {
            debug!(
                "MBR parses better with 512 byte sectors ({} vs {} partitions)",
                l.count_partitions(),
                d.count_partitions()
            );
            Ok((legacy_span, l))
        }
        (Ok(d), _) => Ok((*span, d)),
        (Err(_), Ok(l)) => Ok((legacy_span, l)),
        (Err(e), Err(_)) => Err(e),
    }
}

fn parse_with<D: Read + Seek>(
    device: &mut D,
    span: &Span,
    config: &TableConfig,
) -> Result<PartitionMap, Error> {
    let lb = span.lb();
    if span.block_count() == 0 {
        return Err(Error::BadData("span too small for an MBR"));
    }

    let block = disk::read_block(device, span, 0)?;
    let sector = TableSector::from_bytes(&block);
    if !sector.has_signature() {
        return Err(Error::BadData("no MBR signature"));
    }

    let mut map = PartitionMap::new();
    for (i, record) in sector.records.iter().enumerate() {
        if record.is_empty() {
            continue;
        }
        let extent = Extent::new(
            u64::from(record.lb_start) * lb,
            u64::from(record.lb_size) * lb,
        );
        if !geometry::check_location(&extent, lb, span.size) {
            warn!(
                "dropping primary partition {}: {}+{} outside of the span",
                i, extent.start, extent.size
            );
            continue;
        }
        if record.is_extended() && map.extended_index().is_some() {
            warn!("dropping primary partition {}: second extended partition", i);
            continue;
        }
        map.primaries[i] = PrimarySlot::new(
            extent.start,
            extent.size,
            record.os_type,
            record.is_active(),
        );
    }

    let mut ebrs = Vec::new();
    if let Some(i) = map.extended_index() {
        let (logicals, visited) = parse_chain(device, span, &map.primaries[i], config)?;
        for l in logicals {
            map.primaries[i].push_logical(l);
        }
        ebrs = visited;
    }

    check(&mut map, span, &ebrs)?;
    debug!(
        "MBR with {} partitions ({} byte sectors)",
        map.count_partitions(),
        lb
    );
    Ok(map)
}

/// States of the EBR chain walk.
#[derive(Debug)]
enum ChainState {
    /// Read the table sector at the given offset.
    ReadTable(u64),
    /// Check the signature of a sector read from the given offset.
    Validate(u64, TableSector),
    /// Collect the data and pointer descriptors.
    ExamineEntries(u64, TableSector),
    /// Follow a pointer to the next EBR.
    Recurse(u64),
    /// The chain ends here.
    Terminated,
}

/// Walks the EBR chain of `extended` and returns its logical partitions in
/// chain order, plus the offset of every EBR visited, pointer-only ones
/// included.
///
/// A sector without signature ends the chain there. Malformed descriptors,
/// links back to a visited EBR and chains longer than
/// `max_logical_partitions` reject the whole map.
fn parse_chain<D: Read + Seek>(
    device: &mut D,
    span: &Span,
    extended: &PrimarySlot,
    config: &TableConfig,
) -> Result<(Vec<LogicalPartition>, Vec<u64>), Error> {
    let lb = span.lb();
    let mut logicals = Vec::new();
    let mut visited = Vec::new();
    let mut hops = 0;
    let mut state = ChainState::ReadTable(extended.offset);

    loop {
        state = match state {
            ChainState::ReadTable(offset) => {
                trace!("reading EBR at {}", offset);
                let mut buf = [0u8; super::TABLE_SECTOR_SIZE];
                disk::read_at(device, span, offset, &mut buf)?;
                ChainState::Validate(offset, TableSector::from_bytes(&buf))
            }
            ChainState::Validate(offset, sector) => {
                if sector.has_signature() {
                    ChainState::ExamineEntries(offset, sector)
                } else {
                    warn!("EBR at {} has no signature, truncating the chain", offset);
                    ChainState::Terminated
                }
            }
            ChainState::ExamineEntries(offset, sector) => {
                let (data, pointer) = split_descriptors(&sector)?;
                visited.push(offset);

                if let Some(r) = data {
                    let extent = Extent::new(
                        offset + u64::from(r.lb_start) * lb,
                        u64::from(r.lb_size) * lb,
                    );
                    if !geometry::check_location(&extent, offset + lb, span.size) {
                        return Err(Error::BadData("logical partition outside of the span"));
                    }
                    logicals.push(LogicalPartition::new(
                        offset,
                        extent.start,
                        extent.size,
                        r.os_type,
                        r.is_active(),
                    ));
                }

                match pointer {
                    Some(r) => {
                        let next = Extent::new(
                            extended.offset + u64::from(r.lb_start) * lb,
                            u64::from(r.lb_size) * lb,
                        );
                        if !geometry::check_location(&next, lb, span.size) {
                            return Err(Error::BadData("EBR link outside of the span"));
                        }
                        ChainState::Recurse(next.start)
                    }
                    None => ChainState::Terminated,
                }
            }
            ChainState::Recurse(next) => {
                if visited.contains(&next) {
                    return Err(Error::BadData("two partition tables share a sector"));
                }
                hops += 1;
                if hops >= config.max_logical_partitions {
                    return Err(Error::BadData("too many EBRs in the extended partition"));
                }
                ChainState::ReadTable(next)
            }
            ChainState::Terminated => break,
        };
    }

    Ok((logicals, visited))
}

/// Finds the data and the pointer descriptor of an EBR, at most one each.
fn split_descriptors(
    sector: &TableSector,
) -> Result<(Option<PartRecord>, Option<PartRecord>), Error> {
    let mut data = None;
    let mut pointer = None;
    for r in sector.records.iter().filter(|r| !r.is_empty()) {
        let slot = if r.is_extended() {
            &mut pointer
        } else {
            &mut data
        };
        if slot.replace(*r).is_some() {
            return Err(Error::BadData("EBR with more than one descriptor of a kind"));
        }
    }
    Ok((data, pointer))
}

/// What an overlap-pass entry refers to.
#[derive(Clone, Copy, Debug)]
enum Member {
    Primary(usize),
    Logical(usize, usize),
}

/// Consistency pass over a freshly parsed map.
///
/// Overlapping partitions are shrunk to their non-overlapping prefix, or
/// dropped when nothing is left. Afterwards every table sector, block 0 plus
/// the `ebrs` the chain walk visited, has to be unique and outside of all
/// partitions.
pub(crate) fn check(map: &mut PartitionMap, span: &Span, ebrs: &[u64]) -> Result<(), Error> {
    let mut members: Vec<(Extent, Member)> = Vec::new();
    for (i, slot) in map.primaries.iter().enumerate() {
        if slot.is_empty() {
            continue;
        }
        if slot.is_extended() {
            members.extend(
                slot.logicals()
                    .map(|(j, l)| (l.extent(), Member::Logical(i, j))),
            );
        } else {
            members.push((slot.extent(), Member::Primary(i)));
        }
    }
    members.sort_by_key(|(e, _)| *e);

    let extents: Vec<Extent> = members.iter().map(|(e, _)| *e).collect();
    let resolutions = geometry::resolve_overlaps(&extents);
    for ((extent, member), res) in members.iter().zip(resolutions) {
        match (res, *member) {
            (Resolution::Keep, _) => {}
            (Resolution::Shrink(size), Member::Primary(i)) => {
                warn!("shrinking overlapping primary partition {} to {}", i, size);
                map.primaries[i].size = size;
            }
            (Resolution::Shrink(size), Member::Logical(i, j)) => {
                warn!("shrinking overlapping logical partition {}.{} to {}", i, j, size);
                if let Some(l) = map.primaries[i].logical_mut(j) {
                    l.size = size;
                }
            }
            (Resolution::Drop, Member::Primary(i)) => {
                warn!("dropping overlapping primary partition {} at {}", i, extent.start);
                map.primaries[i].unset();
            }
            (Resolution::Drop, Member::Logical(i, j)) => {
                warn!("dropping overlapping logical partition {}.{}", i, j);
                map.primaries[i].unlink_logical(j);
            }
        }
    }

    let partitions: Vec<Extent> = map
        .primaries
        .iter()
        .filter(|s| !s.is_empty())
        .flat_map(|s| {
            if s.is_extended() {
                s.logicals().map(|(_, l)| l.extent()).collect()
            } else {
                vec![s.extent()]
            }
        })
        .collect();

    let mut tables = vec![0];
    tables.extend_from_slice(ebrs);
    tables.sort_unstable();
    if tables.windows(2).any(|w| w[0] == w[1]) {
        return Err(Error::BadData("two partition tables share a sector"));
    }
    if tables
        .iter()
        .any(|t| *t >= span.size || geometry::is_inside_any(*t, &partitions))
    {
        return Err(Error::BadData("partition table sector inside a partition"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Cursor;

    const LB: u64 = 512;

    fn disk(blocks: u64) -> Cursor<Vec<u8>> {
        Cursor::new(vec![0u8; (blocks * LB) as usize])
    }

    fn put_sector(dev: &mut Cursor<Vec<u8>>, offset: u64, sector: &TableSector) {
        let at = offset as usize;
        dev.get_mut()[at..at + 512].copy_from_slice(&sector.to_bytes());
    }

    fn span(blocks: u64) -> Span {
        Span::new(0, blocks * LB, LogicalBlockSize::Lb512)
    }

    fn ebr(data: Option<(u32, u32)>, next: Option<(u32, u32)>) -> TableSector {
        let mut s = TableSector::new();
        if let Some((start, size)) = data {
            s.records[0] = PartRecord::new_lba(0x83, false, start, size);
        }
        if let Some((start, size)) = next {
            s.records[1] = PartRecord::new_lba(0x05, false, start, size);
        }
        s
    }

    #[test]
    fn primaries_and_chain() {
        let mut dev = disk(4096);
        let mut mbr = TableSector::new();
        mbr.records[0] = PartRecord::new_lba(0x0c, true, 1, 999);
        mbr.records[1] = PartRecord::new_lba(0x0f, false, 1000, 2000);
        put_sector(&mut dev, 0, &mbr);
        put_sector(&mut dev, 1000 * LB, &ebr(Some((1, 99)), Some((100, 200))));
        put_sector(&mut dev, 1100 * LB, &ebr(Some((1, 199)), None));

        let (span, map) = parse(&mut dev, &span(4096), &TableConfig::new()).unwrap();
        assert_eq!(span.block_size, LogicalBlockSize::Lb512);
        assert_eq!(map.count_partitions(), 4);
        assert!(map.primaries[0].active);
        assert_eq!(map.extended_index(), Some(1));

        let chain: Vec<&LogicalPartition> = map.primaries[1].logicals().map(|(_, l)| l).collect();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].pts_offset, 1000 * LB);
        assert_eq!(chain[0].offset, 1001 * LB);
        assert_eq!(chain[0].size, 99 * LB);
        assert_eq!(chain[1].pts_offset, 1100 * LB);
        assert_eq!(chain[1].offset, 1101 * LB);
    }

    #[test]
    fn missing_signature_is_fatal_for_the_mbr_only() {
        let mut dev = disk(64);
        assert!(matches!(
            parse(&mut dev, &span(64), &TableConfig::new()),
            Err(Error::BadData(_))
        ));

        // a bad EBR signature truncates the chain
        let mut mbr = TableSector::new();
        mbr.records[0] = PartRecord::new_lba(0x05, false, 8, 50);
        put_sector(&mut dev, 0, &mbr);
        put_sector(&mut dev, 8 * LB, &ebr(Some((1, 9)), Some((10, 10))));
        let (_, map) = parse(&mut dev, &span(64), &TableConfig::new()).unwrap();
        assert_eq!(map.primaries[0].logical_count(), 1);
    }

    #[test]
    fn bad_slots_are_dropped() {
        let mut dev = disk(64);
        let mut mbr = TableSector::new();
        mbr.records[0] = PartRecord::new_lba(0x83, false, 0, 10);
        mbr.records[1] = PartRecord::new_lba(0x83, false, 10, 100);
        mbr.records[2] = PartRecord::new_lba(0x83, false, 10, 10);
        put_sector(&mut dev, 0, &mbr);

        let (_, map) = parse(&mut dev, &span(64), &TableConfig::new()).unwrap();
        assert!(map.primaries[0].is_empty());
        assert!(map.primaries[1].is_empty());
        assert_eq!(map.primaries[2].offset, 10 * LB);
    }

    #[test]
    fn self_referencing_chain_terminates() {
        let mut dev = disk(64);
        let mut mbr = TableSector::new();
        mbr.records[0] = PartRecord::new_lba(0x05, false, 8, 50);
        put_sector(&mut dev, 0, &mbr);
        // points back at the extended base
        put_sector(&mut dev, 8 * LB, &ebr(None, Some((0, 50))));

        let err = parse(&mut dev, &span(64), &TableConfig::new()).unwrap_err();
        assert!(matches!(err, Error::BadData(_)));
    }

    #[test]
    fn two_data_descriptors_are_fatal() {
        let mut dev = disk(64);
        let mut mbr = TableSector::new();
        mbr.records[0] = PartRecord::new_lba(0x05, false, 8, 50);
        put_sector(&mut dev, 0, &mbr);
        let mut e = ebr(Some((1, 4)), None);
        e.records[2] = PartRecord::new_lba(0x83, false, 6, 4);
        put_sector(&mut dev, 8 * LB, &e);

        assert!(parse(&mut dev, &span(64), &TableConfig::new()).is_err());
    }

    #[test]
    fn overlaps_are_resolved() {
        let mut dev = disk(256);
        let mut mbr = TableSector::new();
        mbr.records[0] = PartRecord::new_lba(0x83, false, 1, 100);
        mbr.records[1] = PartRecord::new_lba(0x83, false, 50, 100);
        mbr.records[2] = PartRecord::new_lba(0x83, false, 50, 10);
        put_sector(&mut dev, 0, &mbr);

        let (_, map) = parse(&mut dev, &span(256), &TableConfig::new()).unwrap();
        assert_eq!(map.primaries[0].size, 49 * LB);
        // same start: the earlier one in offset order is dropped
        assert_eq!(map.count_partitions(), 2);
        let sizes: Vec<u64> = map.primaries.iter().map(|p| p.size).collect();
        assert!(sizes.contains(&(49 * LB)));
        assert!(sizes.contains(&(100 * LB)) || sizes.contains(&(10 * LB)));
    }

    #[test]
    fn ebr_inside_a_partition_is_fatal() {
        let mut dev = disk(256);
        let mut mbr = TableSector::new();
        mbr.records[0] = PartRecord::new_lba(0x83, false, 1, 100);
        mbr.records[1] = PartRecord::new_lba(0x05, false, 50, 150);
        put_sector(&mut dev, 0, &mbr);
        put_sector(&mut dev, 50 * LB, &ebr(Some((60, 10)), None));

        assert!(matches!(
            parse(&mut dev, &span(256), &TableConfig::new()),
            Err(Error::BadData(_))
        ));
    }

    #[test]
    fn pointer_only_ebr_inside_a_partition_is_fatal() {
        let mut dev = disk(256);
        let mut mbr = TableSector::new();
        mbr.records[0] = PartRecord::new_lba(0x83, false, 1, 60);
        mbr.records[1] = PartRecord::new_lba(0x05, false, 50, 150);
        put_sector(&mut dev, 0, &mbr);
        // the base EBR only links on, and lies inside slot 0
        put_sector(&mut dev, 50 * LB, &ebr(None, Some((50, 10))));
        put_sector(&mut dev, 100 * LB, &ebr(Some((1, 9)), None));

        assert!(matches!(
            parse(&mut dev, &span(256), &TableConfig::new()),
            Err(Error::BadData("partition table sector inside a partition"))
        ));

        // moved out of the way the same chain is fine
        mbr.records[0] = PartRecord::new_lba(0x83, false, 1, 40);
        put_sector(&mut dev, 0, &mbr);
        let (_, map) = parse(&mut dev, &span(256), &TableConfig::new()).unwrap();
        let chain: Vec<&LogicalPartition> = map.primaries[1].logicals().map(|(_, l)| l).collect();
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].pts_offset, 100 * LB);
        assert_eq!(chain[0].offset, 101 * LB);
    }

    #[test]
    fn chain_revisiting_an_ebr_is_fatal() {
        let mut dev = disk(256);
        let mut mbr = TableSector::new();
        mbr.records[0] = PartRecord::new_lba(0x05, false, 8, 200);
        put_sector(&mut dev, 0, &mbr);
        put_sector(&mut dev, 8 * LB, &ebr(Some((1, 9)), Some((20, 10))));
        // links back to the first EBR
        put_sector(&mut dev, 28 * LB, &ebr(Some((1, 9)), Some((0, 10))));

        let config = TableConfig::new().max_logical_partitions(1000);
        assert!(matches!(
            parse(&mut dev, &span(256), &config),
            Err(Error::BadData("two partition tables share a sector"))
        ));
    }

    #[test]
    fn table_sectors_are_unique() {
        let mut map = PartitionMap::new();
        map.primaries[0] = PrimarySlot::new(8 * LB, 100 * LB, 0x05, false);
        assert!(check(&mut map, &span(256), &[8 * LB, 20 * LB]).is_ok());
        assert!(matches!(
            check(&mut map, &span(256), &[8 * LB, 20 * LB, 8 * LB]),
            Err(Error::BadData("two partition tables share a sector"))
        ));
        assert!(check(&mut map, &span(256), &[256 * LB]).is_err());
    }

    #[test]
    fn legacy_block_size_probe() {
        // a table written with 512 byte sectors on a 2048 byte device
        let mut dev = disk(4096);
        let mut mbr = TableSector::new();
        mbr.records[0] = PartRecord::new_lba(0x83, false, 4, 100);
        mbr.records[1] = PartRecord::new_lba(0x83, false, 3000, 1000);
        put_sector(&mut dev, 0, &mbr);

        let span = Span::new(0, 4096 * LB, LogicalBlockSize::Lb2048);
        let (used, map) = parse(&mut dev, &span, &TableConfig::new()).unwrap();
        assert_eq!(used.block_size, LogicalBlockSize::Lb512);
        assert_eq!(map.count_partitions(), 2);

        let config = TableConfig::new().probe_legacy_block_size(false);
        let (used, map) = parse(&mut dev, &span, &config).unwrap();
        assert_eq!(used.block_size, LogicalBlockSize::Lb2048);
        assert_eq!(map.count_partitions(), 1);
    }
}
