//! MBR table engine: primary slots plus the logical partitions of the
//! extended partition.
//!
//! A new EBR is always written before anything points to it, and a node
//! is unlinked on disk before its storage is reused, so an interrupted
//! operation leaves either the old or the new chain behind.

use std::str::FromStr;

use super::{writer, LogicalPartition, PartitionMap, PrimarySlot};
use crate::disk::{self, Span};
use crate::geometry::{self, Extent};
use crate::partition::{Partition, PartitionId, Role};
use crate::partition_types::{self, MbrType, TypeId};
use crate::{DiskDevice, Error};

/// An MBR backed by a device.
#[derive(Debug)]
pub struct MbrTable<D> {
    device: D,
    span: Span,
    writable: bool,
    map: PartitionMap,
}

impl<D> MbrTable<D> {
    pub(crate) fn from_map(device: D, span: Span, writable: bool, map: PartitionMap) -> Self {
        Self {
            device,
            span,
            writable,
            map,
        }
    }

    /// The in-memory partition map.
    pub fn map(&self) -> &PartitionMap {
        &self.map
    }

    /// The span this table lives in, with the block size it was parsed
    /// with.
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Probe confidence, always 0.5.
    pub fn confidence(&self) -> f32 {
        super::CONFIDENCE
    }

    /// Get a reference to to the underlying device.
    pub fn device_ref(&self) -> &D {
        &self.device
    }

    /// Take the underlying device object.
    pub fn take_device(self) -> D {
        self.device
    }

    /// Primary partitions in slot order, each extended partition followed
    /// by its logical partitions in chain order.
    pub fn partitions(&self) -> Vec<Partition> {
        let mut out = Vec::new();
        for (i, slot) in self.map.primaries.iter().enumerate() {
            if slot.is_empty() {
                continue;
            }
            let role = if slot.is_extended() {
                Role::Extended
            } else {
                Role::Primary
            };
            out.push(self.descriptor(
                PartitionId::Primary(i),
                slot.extent(),
                slot.type_code,
                slot.active,
                role,
            ));
            for (j, l) in slot.logicals() {
                out.push(self.descriptor(
                    PartitionId::Logical {
                        primary: i,
                        index: j,
                    },
                    l.extent(),
                    l.type_code,
                    l.active,
                    Role::Logical,
                ));
            }
        }
        out
    }

    /// `(id, display name)` of every type `set_type` accepts by name.
    pub fn supported_types(&self) -> Vec<(TypeId, &'static str)> {
        partition_types::supported_mbr_types().collect()
    }

    fn descriptor(
        &self,
        id: PartitionId,
        extent: Extent,
        type_code: u8,
        active: bool,
        role: Role,
    ) -> Partition {
        Partition {
            id,
            offset: self.span.offset + extent.start,
            size: extent.size,
            block_size: self.span.lb(),
            type_id: TypeId::Mbr(type_code),
            type_name: MbrType::from_code(type_code).display_name(),
            name: String::new(),
            unique_guid: None,
            active,
            attributes: Default::default(),
            role,
        }
    }

    fn primary_index(&self, id: PartitionId) -> Result<usize, Error> {
        match id {
            PartitionId::Primary(i) if i < 4 && !self.map.primaries[i].is_empty() => Ok(i),
            PartitionId::Primary(_) => Err(Error::BadValue("no such partition")),
            _ => Err(Error::BadValue("not a primary partition id")),
        }
    }

    fn extended_index(&self, id: PartitionId) -> Result<usize, Error> {
        let i = self.primary_index(id)?;
        if self.map.primaries[i].is_extended() {
            Ok(i)
        } else {
            Err(Error::BadValue("only extended partitions have children"))
        }
    }

    fn logical_index(&self, id: PartitionId) -> Result<(usize, usize), Error> {
        match id {
            PartitionId::Logical { primary, index }
                if primary < 4 && self.map.primaries[primary].logical(index).is_some() =>
            {
                Ok((primary, index))
            }
            _ => Err(Error::BadValue("no such logical partition")),
        }
    }

    /// Span-relative offset of a host offset.
    fn relative(&self, offset: u64) -> u64 {
        offset.saturating_sub(self.span.offset)
    }

    /// Where primary partitions may live: everything behind block 0.
    fn primary_bounds(&self) -> Extent {
        let lb = self.span.lb();
        let end = geometry::align_down(self.span.size, lb);
        Extent::new(lb, end.saturating_sub(lb))
    }

    fn primary_siblings(&self, skip: Option<usize>) -> Vec<Extent> {
        self.map
            .primaries
            .iter()
            .enumerate()
            .filter(|(i, s)| Some(*i) != skip && !s.is_empty())
            .map(|(_, s)| s.extent())
            .collect()
    }

    /// Where EBRs may live: the base sector stays reserved for the head
    /// link.
    fn logical_bounds(&self, slot: usize) -> Extent {
        let ext = &self.map.primaries[slot];
        let lb = self.span.lb();
        Extent::new(ext.offset + lb, ext.size.saturating_sub(lb))
    }

    fn logical_siblings(&self, slot: usize, skip: Option<usize>) -> Vec<Extent> {
        self.map.primaries[slot]
            .logicals()
            .filter(|(j, _)| Some(*j) != skip)
            .map(|(_, l)| l.region())
            .collect()
    }

    /// Where a partition could still be created, as `(absolute offset,
    /// size)` in bytes: primary gaps without a parent, room for logical
    /// partitions (their EBR block already left out) inside an extended
    /// parent.
    pub fn partitionable_spaces(
        &self,
        parent: Option<PartitionId>,
    ) -> Result<Vec<(u64, u64)>, Error> {
        let lb = self.span.lb();
        let spaces = match parent {
            None => geometry::free_spaces(
                self.primary_bounds(),
                &self.primary_siblings(None),
                lb,
            ),
            Some(id) => {
                let slot = self.extended_index(id)?;
                geometry::free_spaces(
                    self.logical_bounds(slot),
                    &self.logical_siblings(slot, None),
                    lb,
                )
                .into_iter()
                .filter(|e| e.size > lb)
                .map(|e| Extent::new(e.start + lb, e.size - lb))
                .collect()
            }
        };
        Ok(spaces
            .into_iter()
            .map(|e| (self.span.offset + e.start, e.size))
            .collect())
    }

    /// Adjusts a create request to what would actually be created:
    /// `(absolute offset, size)` in bytes. Without a parent a primary
    /// partition is created, with an extended parent a logical one.
    pub fn validate_create_child(
        &self,
        parent: Option<PartitionId>,
        offset: u64,
        size: u64,
    ) -> Result<(u64, u64), Error> {
        let extent = match parent {
            None => self.fit_primary(offset, size)?,
            Some(id) => {
                let slot = self.extended_index(id)?;
                let (_, data) = self.fit_logical(slot, offset, size)?;
                data
            }
        };
        Ok((self.span.offset + extent.start, extent.size))
    }

    fn fit_primary(&self, offset: u64, size: u64) -> Result<Extent, Error> {
        let request = Extent::new(self.relative(offset), size);
        geometry::fit_new(
            request,
            self.primary_bounds(),
            &self.primary_siblings(None),
            self.span.lb(),
        )
        .ok_or(Error::BadValue("no room for the partition"))
    }

    /// Fits a logical partition and its EBR; returns `(pts, data)`.
    fn fit_logical(&self, slot: usize, offset: u64, size: u64) -> Result<(u64, Extent), Error> {
        let lb = self.span.lb();
        let data = geometry::align_up(self.relative(offset), lb)
            .ok_or(Error::BadValue("offset overflows"))?;
        let request = Extent::new(data.saturating_sub(lb), size.saturating_add(lb));
        let region = geometry::fit_new(
            request,
            self.logical_bounds(slot),
            &self.logical_siblings(slot, None),
            lb,
        )
        .ok_or(Error::BadValue("no room for the partition"))?;
        if region.size <= lb {
            return Err(Error::BadValue("partition size would be zero"));
        }
        Ok((
            region.start,
            Extent::new(region.start + lb, region.size - lb),
        ))
    }

    /// Adjusts a resize request, returns the size in bytes that would be
    /// applied.
    pub fn validate_resize_child(&self, id: PartitionId, size: u64) -> Result<u64, Error> {
        match id {
            PartitionId::Logical { .. } => {
                let (slot, index) = self.logical_index(id)?;
                self.fit_resize_logical(slot, index, size)
            }
            _ => self.fit_resize_primary(self.primary_index(id)?, size),
        }
    }

    fn fit_resize_primary(&self, index: usize, size: u64) -> Result<u64, Error> {
        let lb = self.span.lb();
        let slot = &self.map.primaries[index];
        let mut new_size = geometry::fit_resize(
            slot.extent(),
            size,
            self.primary_bounds(),
            &self.primary_siblings(Some(index)),
            lb,
        );
        if slot.is_extended() {
            // never cut into the logical partitions
            let used = slot
                .logicals()
                .map(|(_, l)| l.region().end() - slot.offset)
                .max()
                .unwrap_or(lb);
            let used = geometry::align_up(used, lb).unwrap_or(slot.size);
            new_size = new_size.max(used);
        }
        if new_size == 0 {
            return Err(Error::BadValue("partition size would be zero"));
        }
        Ok(new_size)
    }

    fn fit_resize_logical(&self, slot: usize, index: usize, size: u64) -> Result<u64, Error> {
        let ext = &self.map.primaries[slot];
        let node = ext
            .logical(index)
            .ok_or(Error::BadValue("no such logical partition"))?;
        let new_size = geometry::fit_resize(
            node.extent(),
            size,
            ext.extent(),
            &self.logical_siblings(slot, Some(index)),
            self.span.lb(),
        );
        if new_size == 0 {
            return Err(Error::BadValue("partition size would be zero"));
        }
        Ok(new_size)
    }

    /// Adjusts a move request, returns the absolute byte offset that would
    /// be applied.
    pub fn validate_move_child(&self, id: PartitionId, offset: u64) -> Result<u64, Error> {
        let start = match id {
            PartitionId::Logical { .. } => {
                let (slot, index) = self.logical_index(id)?;
                let (_, data) = self.fit_move_logical(slot, index, offset)?;
                data
            }
            _ => self.fit_move_primary(self.primary_index(id)?, offset)?,
        };
        Ok(self.span.offset + start)
    }

    fn fit_move_primary(&self, index: usize, offset: u64) -> Result<u64, Error> {
        geometry::fit_move(
            self.map.primaries[index].extent(),
            self.relative(offset),
            self.primary_bounds(),
            &self.primary_siblings(Some(index)),
            self.span.lb(),
        )
        .ok_or(Error::BadValue("partition cannot be moved there"))
    }

    /// Moves the EBR together with the data region; returns the new
    /// `(pts, data offset)`.
    fn fit_move_logical(
        &self,
        slot: usize,
        index: usize,
        offset: u64,
    ) -> Result<(u64, u64), Error> {
        let node = self.map.primaries[slot]
            .logical(index)
            .ok_or(Error::BadValue("no such logical partition"))?;
        let gap = node.offset - node.pts_offset;
        let pts = geometry::fit_move(
            node.region(),
            self.relative(offset).saturating_sub(gap),
            self.logical_bounds(slot),
            &self.logical_siblings(slot, Some(index)),
            self.span.lb(),
        )
        .ok_or(Error::BadValue("partition cannot be moved there"))?;
        Ok((pts, pts + gap))
    }
}

impl<D> MbrTable<D>
where
    D: DiskDevice,
{
    /// Writes an empty primary table with the boot code cleared.
    pub(crate) fn initialize(mut device: D, span: Span) -> Result<Self, Error> {
        if span.block_count() == 0 {
            return Err(Error::BadValue("span too small for an MBR"));
        }
        let map = PartitionMap::new();
        debug!("initializing MBR");
        writer::write_primary(&mut device, &span, &map, true)?;
        Ok(Self::from_map(device, span, true, map))
    }

    fn check_writable(&self) -> Result<(), Error> {
        if self.writable {
            Ok(())
        } else {
            Err(Error::ReadOnly)
        }
    }

    /// Creates a primary partition (no parent) or a logical partition
    /// inside the extended partition `parent`.
    ///
    /// The start is rounded up and the size down to whole blocks, then
    /// clamped into the parent and shrunk to avoid every sibling.
    pub fn create_child(
        &mut self,
        parent: Option<PartitionId>,
        offset: u64,
        size: u64,
        part_type: &str,
    ) -> Result<PartitionId, Error> {
        self.check_writable()?;
        let code = parse_type(part_type)?;
        match parent {
            None => self.create_primary(offset, size, code),
            Some(id) => {
                let slot = self.extended_index(id)?;
                self.create_logical(slot, offset, size, code)
            }
        }
    }

    fn create_primary(&mut self, offset: u64, size: u64, code: u8) -> Result<PartitionId, Error> {
        let index = self
            .map
            .primaries
            .iter()
            .position(PrimarySlot::is_empty)
            .ok_or(Error::BadValue("no unused primary slot"))?;
        if partition_types::is_extended(code) && self.map.extended_index().is_some() {
            return Err(Error::BadValue("there already is an extended partition"));
        }
        let extent = self.fit_primary(offset, size)?;
        let slot = PrimarySlot::new(extent.start, extent.size, code, false);
        debug!(
            "creating primary partition {}: {}+{} type {:#04x}",
            index, extent.start, extent.size, code
        );

        if slot.is_extended() {
            writer::write_extended_head(&mut self.device, &self.span, &slot, true)?;
        }
        let old = std::mem::replace(&mut self.map.primaries[index], slot);
        self.commit_primary(index, old)?;
        Ok(PartitionId::Primary(index))
    }

    fn create_logical(
        &mut self,
        slot: usize,
        offset: u64,
        size: u64,
        code: u8,
    ) -> Result<PartitionId, Error> {
        if partition_types::is_extended(code) {
            return Err(Error::BadValue("logical partitions cannot be extended"));
        }
        let (pts, data) = self.fit_logical(slot, offset, size)?;
        debug!(
            "creating logical partition: EBR at {}, {}+{} type {:#04x}",
            pts, data.start, data.size, code
        );

        let node = LogicalPartition::new(pts, data.start, data.size, code, false);
        let index = self.map.primaries[slot].insert_logical(node);

        // the new EBR already links to the successor before anything
        // points at it
        let ext = &self.map.primaries[slot];
        let res = writer::write_logical(&mut self.device, &self.span, ext, index, true)
            .and_then(|_| {
                let prev = ext.logical(index).and_then(LogicalPartition::previous);
                write_predecessor(&mut self.device, &self.span, ext, prev)
            });
        if let Err(e) = res {
            warn!("creating logical partition failed: {}", e);
            let ext = &mut self.map.primaries[slot];
            ext.unlink_logical(index);
            ext.discard_last(index);
            return Err(e);
        }
        Ok(PartitionId::Logical {
            primary: slot,
            index,
        })
    }

    /// Resizes a partition in place, returns the applied size in bytes.
    ///
    /// An extended partition cannot shrink below its logical partitions.
    pub fn resize_child(&mut self, id: PartitionId, size: u64) -> Result<u64, Error> {
        self.check_writable()?;
        if let PartitionId::Logical { .. } = id {
            let (slot, index) = self.logical_index(id)?;
            let new_size = self.fit_resize_logical(slot, index, size)?;
            self.update_logical(slot, index, |l| l.size = new_size)?;
            return Ok(new_size);
        }

        let index = self.primary_index(id)?;
        let new_size = self.fit_resize_primary(index, size)?;
        let old = self.map.primaries[index].clone();
        self.map.primaries[index].size = new_size;
        self.commit_primary(index, old)?;
        Ok(new_size)
    }

    /// Moves a partition together with its contents, returns the applied
    /// absolute byte offset.
    ///
    /// Moving the extended partition moves the whole chain; its links are
    /// relative to the extended base and stay valid.
    pub fn move_child(&mut self, id: PartitionId, offset: u64) -> Result<u64, Error> {
        self.check_writable()?;
        if let PartitionId::Logical { .. } = id {
            let (slot, index) = self.logical_index(id)?;
            return self.move_logical(slot, index, offset);
        }

        let index = self.primary_index(id)?;
        let start = self.fit_move_primary(index, offset)?;
        let old = self.map.primaries[index].clone();
        if start == old.offset {
            return Ok(self.span.offset + start);
        }
        disk::move_data(&mut self.device, &self.span, old.offset, start, old.size)?;

        let moved = &mut self.map.primaries[index];
        moved.offset = start;
        let ids: Vec<usize> = moved.logicals().map(|(j, _)| j).collect();
        for j in ids {
            if let Some(l) = moved.logical_mut(j) {
                l.pts_offset = l.pts_offset - old.offset + start;
                l.offset = l.offset - old.offset + start;
            }
        }
        self.commit_primary(index, old)?;
        Ok(self.span.offset + start)
    }

    fn move_logical(&mut self, slot: usize, index: usize, offset: u64) -> Result<u64, Error> {
        let (pts, data) = self.fit_move_logical(slot, index, offset)?;
        let ext = &self.map.primaries[slot];
        let old = ext
            .logical(index)
            .cloned()
            .ok_or(Error::BadValue("no such logical partition"))?;
        if pts == old.pts_offset {
            return Ok(self.span.offset + data);
        }

        disk::move_data(
            &mut self.device,
            &self.span,
            old.pts_offset,
            pts,
            old.region().size,
        )?;
        self.update_logical(slot, index, |l| {
            l.pts_offset = pts;
            l.offset = data;
        })?;
        Ok(self.span.offset + data)
    }

    /// Changes the type, given by display name or as hex code (`0x83`).
    ///
    /// There is at most one extended partition, and an extended partition
    /// holding logical partitions keeps an extended type.
    pub fn set_type(&mut self, id: PartitionId, part_type: &str) -> Result<(), Error> {
        self.check_writable()?;
        let code = parse_type(part_type)?;
        if let PartitionId::Logical { .. } = id {
            let (slot, index) = self.logical_index(id)?;
            if partition_types::is_extended(code) {
                return Err(Error::BadValue("logical partitions cannot be extended"));
            }
            return self.update_logical(slot, index, |l| l.type_code = code);
        }

        let index = self.primary_index(id)?;
        let slot = &self.map.primaries[index];
        let extended = partition_types::is_extended(code);
        if extended && !slot.is_extended() && self.map.extended_index().is_some() {
            return Err(Error::BadValue("there already is an extended partition"));
        }
        if !extended && slot.logical_count() > 0 {
            return Err(Error::BadValue("extended partition still holds logical partitions"));
        }

        let old = slot.clone();
        let mut new = old.clone();
        new.type_code = code;
        if extended && !old.is_extended() {
            writer::write_extended_head(&mut self.device, &self.span, &new, true)?;
        }
        self.map.primaries[index] = new;
        self.commit_primary(index, old)
    }

    /// Sets or clears the boot indicator.
    pub fn set_active(&mut self, id: PartitionId, active: bool) -> Result<(), Error> {
        self.check_writable()?;
        if let PartitionId::Logical { .. } = id {
            let (slot, index) = self.logical_index(id)?;
            return self.update_logical(slot, index, |l| l.active = active);
        }
        let index = self.primary_index(id)?;
        let old = self.map.primaries[index].clone();
        self.map.primaries[index].active = active;
        self.commit_primary(index, old)
    }

    /// MBR partitions have no names.
    pub fn set_name(&mut self, _id: PartitionId, _name: &str) -> Result<(), Error> {
        Err(Error::NotSupported("MBR partitions have no name"))
    }

    /// Deletes a partition. Other partitions keep their ids; an extended
    /// partition has to be emptied first.
    pub fn delete_child(&mut self, id: PartitionId) -> Result<(), Error> {
        self.check_writable()?;
        if let PartitionId::Logical { .. } = id {
            let (slot, index) = self.logical_index(id)?;
            return self.delete_logical(slot, index);
        }

        let index = self.primary_index(id)?;
        if self.map.primaries[index].logical_count() > 0 {
            return Err(Error::BadValue("extended partition still holds logical partitions"));
        }
        debug!("deleting primary partition {}", index);
        let old = std::mem::take(&mut self.map.primaries[index]);
        self.commit_primary(index, old)
    }

    /// Unlinks node `index` on disk: the predecessor (or the head link) is
    /// rewritten to skip it.
    fn delete_logical(&mut self, slot: usize, index: usize) -> Result<(), Error> {
        debug!("deleting logical partition {}.{}", slot, index);
        let ext = &mut self.map.primaries[slot];
        let node = ext
            .unlink_logical(index)
            .ok_or(Error::BadValue("no such logical partition"))?;

        let ext = &self.map.primaries[slot];
        if let Err(e) = write_predecessor(&mut self.device, &self.span, ext, node.previous()) {
            warn!("deleting logical partition failed: {}", e);
            self.map.primaries[slot].relink_logical(index, node);
            return Err(e);
        }
        Ok(())
    }

    /// Writes the primary table, restoring slot `index` to `old` if that
    /// fails.
    fn commit_primary(&mut self, index: usize, old: PrimarySlot) -> Result<(), Error> {
        if let Err(e) = writer::write_primary(&mut self.device, &self.span, &self.map, false) {
            warn!("writing primary table failed: {}", e);
            self.map.primaries[index] = old;
            return Err(e);
        }
        Ok(())
    }

    /// Applies `change` to node `index` and rewrites its EBR plus the link
    /// pointing at it, whose size covers the node. Restores the node if a
    /// write fails.
    fn update_logical<F>(&mut self, slot: usize, index: usize, change: F) -> Result<(), Error>
    where
        F: FnOnce(&mut LogicalPartition),
    {
        let ext = &mut self.map.primaries[slot];
        let node = ext
            .logical_mut(index)
            .ok_or(Error::BadValue("no such logical partition"))?;
        let old = node.clone();
        change(node);

        let ext = &self.map.primaries[slot];
        let res = writer::write_logical(&mut self.device, &self.span, ext, index, false)
            .and_then(|_| write_predecessor(&mut self.device, &self.span, ext, old.previous()));
        if let Err(e) = res {
            warn!("writing EBR failed: {}", e);
            if let Some(node) = self.map.primaries[slot].logical_mut(index) {
                *node = old;
            }
            return Err(e);
        }
        Ok(())
    }
}

/// Rewrites whatever links to the node behind `prev`: the EBR of `prev`,
/// or the head link for the first node.
fn write_predecessor<D: DiskDevice>(
    device: &mut D,
    span: &Span,
    extended: &PrimarySlot,
    prev: Option<usize>,
) -> Result<(), Error> {
    match prev {
        Some(p) => writer::write_logical(device, span, extended, p, false),
        None => writer::write_extended_head(device, span, extended, false),
    }
}

fn parse_type(s: &str) -> Result<u8, Error> {
    let t = MbrType::from_str(s).map_err(|_| Error::BadValue("unknown partition type"))?;
    if t.is_empty() {
        return Err(Error::BadValue("the empty type cannot be assigned"));
    }
    Ok(t.code)
}
