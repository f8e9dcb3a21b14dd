//! GPT table engine.
//!
//! Reads both header copies, keeps whichever validates, and applies
//! create/resize/move/delete and attribute changes entry by entry. Every
//! mutation is validated completely before the first write; a failed write
//! restores the in-memory state.

use std::io::{Read, Seek};
use std::str::FromStr;

use crate::disk::{self, Span};
use crate::entry::{self, Attributes, GptEntry};
use crate::geometry::{self, Extent};
use crate::header::{self, Header, HeaderBuilder, HeaderError};
use crate::macros::ResultInsert;
use crate::mbr::ProtectiveMBR;
use crate::partition::{Partition, PartitionId, Role};
use crate::partition_types::{self, Type, TypeId};
use crate::{DiskDevice, Error, TableConfig};

/// Probe confidence of a table with two valid headers.
pub const CONFIDENCE: f32 = 0.81;
/// Probe confidence when only one header validated.
pub const DIRTY_CONFIDENCE: f32 = 0.45;

/// Both header copies and the entry array, as read from the device.
#[derive(Debug)]
pub(crate) struct GptLayout {
    primary_header: Result<Header, HeaderError>,
    backup_header: Result<Header, HeaderError>,
    entries: Vec<GptEntry>,
}

impl GptLayout {
    pub(crate) fn is_dirty(&self) -> bool {
        self.primary_header.is_err() || self.backup_header.is_err()
    }

    pub(crate) fn confidence(&self) -> f32 {
        if self.is_dirty() {
            DIRTY_CONFIDENCE
        } else {
            CONFIDENCE
        }
    }
}

/// Reads and validates a GPT inside `span`.
///
/// The backup is looked up at the location the primary names, or at the
/// last block of the span when the primary is unusable. Fails only when no
/// copy validates (or, with `only_valid_headers`, when one does not).
pub(crate) fn probe<D: Read + Seek>(
    device: &mut D,
    span: &Span,
    config: &TableConfig,
) -> Result<GptLayout, Error> {
    let block_count = span.block_count();
    if block_count < 3 {
        return Err(Error::BadData("span too small for a GPT"));
    }

    let primary = read_copy(device, span, 1)?;
    let backup_lba = match &primary {
        Ok((h, _)) => h.backup_lba,
        Err(_) => block_count - 1,
    };
    let backup = read_copy(device, span, backup_lba)?;
    debug!(
        "GPT probe: primary {}, backup {}",
        if primary.is_ok() { "valid" } else { "invalid" },
        if backup.is_ok() { "valid" } else { "invalid" }
    );

    let (primary_header, backup_header, raw) = match (primary, backup) {
        (Err(e), Err(_)) => return Err(e.into()),
        (Err(e), Ok(_)) | (Ok(_), Err(e)) if config.only_valid_headers => {
            return Err(e.into())
        }
        (Ok((p, raw)), Ok((b, _))) => (Ok(p), Ok(b), raw),
        (Ok((p, raw)), Err(e)) => {
            warn!("GPT backup header unusable: {}", e);
            (Ok(p), Err(e), raw)
        }
        (Err(e), Ok((b, raw))) => {
            warn!("GPT primary header unusable: {}", e);
            (Err(e), Ok(b), raw)
        }
    };

    let part_size = match (&primary_header, &backup_header) {
        (Ok(h), _) | (_, Ok(h)) => h.part_size as usize,
        (Err(_), Err(_)) => return Err(Error::BadData("no valid GPT header")),
    };
    let entries = raw
        .chunks_exact(part_size)
        .map(GptEntry::from_bytes)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(GptLayout {
        primary_header,
        backup_header,
        entries,
    })
}

/// Reads one header copy plus its entry array.
///
/// Problems with this copy are returned in the inner result so the caller
/// can fall back to the other copy; only allocation failures are fatal.
fn read_copy<D: Read + Seek>(
    device: &mut D,
    span: &Span,
    lba: u64,
) -> Result<Result<(Header, Vec<u8>), HeaderError>, Error> {
    let header = match header::read_header(device, span, lba) {
        Ok(h) => h,
        Err(e) => return Ok(Err(e)),
    };
    if let Err(e) = header.check_layout(span.block_count(), span.block_size) {
        return Ok(Err(e));
    }
    match header::read_entries(device, span, &header) {
        Ok(raw) => Ok(Ok((header, raw))),
        Err(Error::Header(e)) => Ok(Err(e)),
        Err(Error::Io(e)) => Ok(Err(HeaderError::Io(e))),
        Err(Error::BadData(_)) => Ok(Err(HeaderError::OutOfBounds)),
        Err(e) => Err(e),
    }
}

/// A GPT backed by a device.
#[derive(Debug)]
pub struct GptTable<D> {
    device: D,
    span: Span,
    writable: bool,
    primary_header: Result<Header, HeaderError>,
    backup_header: Result<Header, HeaderError>,
    entries: Vec<GptEntry>,
}

impl<D> GptTable<D> {
    pub(crate) fn from_layout(device: D, span: Span, writable: bool, layout: GptLayout) -> Self {
        Self {
            device,
            span,
            writable,
            primary_header: layout.primary_header,
            backup_header: layout.backup_header,
            entries: layout.entries,
        }
    }

    /// Retrieve primary header, if it validated.
    pub fn primary_header(&self) -> Result<&Header, HeaderError> {
        self.primary_header.as_ref().map_err(|e| e.lossy_clone())
    }

    /// Retrieve backup header, if it validated.
    pub fn backup_header(&self) -> Result<&Header, HeaderError> {
        self.backup_header.as_ref().map_err(|e| e.lossy_clone())
    }

    /// The header layout decisions are based on, the primary when valid.
    pub fn header(&self) -> Result<&Header, Error> {
        self.primary_header
            .as_ref()
            .or(self.backup_header.as_ref())
            .map_err(|_| Error::BadData("no valid GPT header"))
    }

    /// Whether exactly one header copy validated.
    pub fn is_dirty(&self) -> bool {
        self.primary_header.is_err() || self.backup_header.is_err()
    }

    /// Probe confidence: 0.81, or 0.45 while dirty.
    pub fn confidence(&self) -> f32 {
        if self.is_dirty() {
            DIRTY_CONFIDENCE
        } else {
            CONFIDENCE
        }
    }

    /// Retrieve disk UUID.
    pub fn guid(&self) -> Option<uuid::Uuid> {
        self.header().ok().map(|h| h.disk_guid)
    }

    /// The raw entry array, used and unused entries alike.
    pub fn entries(&self) -> &[GptEntry] {
        &self.entries
    }

    /// The span this table lives in.
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Get a reference to to the underlying device.
    pub fn device_ref(&self) -> &D {
        &self.device
    }

    /// Take the underlying device object.
    pub fn take_device(self) -> D {
        self.device
    }

    /// Used entries that lie inside the span, as host descriptors.
    ///
    /// Entries ending past the span or starting at block 0 are skipped.
    pub fn partitions(&self) -> Vec<Partition> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_used())
            .filter(|(i, e)| {
                let visible = self.is_visible(e);
                if !visible {
                    warn!(
                        "skipping GPT entry {}: blocks {}..={} outside of the span",
                        i, e.first_lba, e.last_lba
                    );
                }
                visible
            })
            .map(|(i, e)| self.descriptor(i, e))
            .collect()
    }

    /// `(id, display name)` of every type `set_type` accepts by name.
    pub fn supported_types(&self) -> Vec<(TypeId, &'static str)> {
        partition_types::supported_gpt_types().collect()
    }

    fn is_visible(&self, e: &GptEntry) -> bool {
        e.first_lba != 0 && e.last_lba >= e.first_lba && e.last_lba < self.span.block_count()
    }

    fn descriptor(&self, index: usize, e: &GptEntry) -> Partition {
        let lb = self.span.lb();
        Partition {
            id: PartitionId::Gpt(index as u32),
            offset: self.span.offset + e.first_lba * lb,
            size: e.size_lba() * lb,
            block_size: lb,
            type_id: TypeId::Gpt(e.part_type_guid.guid),
            type_name: e.part_type_guid.display_name(),
            name: e.name.clone(),
            unique_guid: Some(e.part_guid),
            active: false,
            attributes: e.attributes,
            role: Role::Gpt,
        }
    }

    /// Index of a visible, used entry.
    fn index_of(&self, id: PartitionId) -> Result<usize, Error> {
        match id {
            PartitionId::Gpt(i) => self
                .entries
                .get(i as usize)
                .filter(|e| e.is_used() && self.is_visible(e))
                .map(|_| i as usize)
                .ok_or(Error::BadValue("no such partition")),
            _ => Err(Error::BadValue("not a GPT partition id")),
        }
    }

    /// Blocks partitions may occupy.
    fn usable(&self) -> Result<Extent, Error> {
        let h = self.header()?;
        let end = (h.last_usable + 1).min(self.span.block_count());
        Ok(Extent::new(
            h.first_usable,
            end.saturating_sub(h.first_usable),
        ))
    }

    /// Visible used entries except `skip`, in blocks.
    fn siblings(&self, skip: Option<usize>) -> Vec<Extent> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(i, e)| Some(*i) != skip && e.is_used() && self.is_visible(e))
            .map(|(_, e)| Extent::new(e.first_lba, e.size_lba()))
            .collect()
    }

    /// First block at or after an absolute byte offset.
    fn lba_up(&self, offset: u64) -> Result<u64, Error> {
        let rel = offset.saturating_sub(self.span.offset);
        geometry::align_up(rel, self.span.lb())
            .map(|b| b / self.span.lb())
            .ok_or(Error::BadValue("offset overflows"))
    }

    fn extent(&self, index: usize) -> Extent {
        let e = &self.entries[index];
        Extent::new(e.first_lba, e.size_lba())
    }

    /// Unused stretches of the usable range as `(absolute offset, size)` in
    /// bytes, in disk order.
    pub fn partitionable_spaces(&self) -> Result<Vec<(u64, u64)>, Error> {
        let lb = self.span.lb();
        let spaces = geometry::free_spaces(self.usable()?, &self.siblings(None), 1);
        trace!("GPT free spaces: {:?}", spaces);
        Ok(spaces
            .into_iter()
            .map(|e| (self.span.offset + e.start * lb, e.size * lb))
            .collect())
    }

    /// Adjusts a create request to what would actually be created:
    /// `(absolute offset, size)` in bytes.
    pub fn validate_create_child(&self, offset: u64, size: u64) -> Result<(u64, u64), Error> {
        let extent = self.fit_create(offset, size)?;
        let lb = self.span.lb();
        Ok((self.span.offset + extent.start * lb, extent.size * lb))
    }

    fn fit_create(&self, offset: u64, size: u64) -> Result<Extent, Error> {
        let request = Extent::new(self.lba_up(offset)?, size / self.span.lb());
        geometry::fit_new(request, self.usable()?, &self.siblings(None), 1)
            .ok_or(Error::BadValue("no room for the partition"))
    }

    /// Adjusts a resize request, returns the size in bytes that would be
    /// applied.
    pub fn validate_resize_child(&self, id: PartitionId, size: u64) -> Result<u64, Error> {
        let index = self.index_of(id)?;
        Ok(self.fit_resize(index, size)? * self.span.lb())
    }

    fn fit_resize(&self, index: usize, size: u64) -> Result<u64, Error> {
        let blocks = geometry::fit_resize(
            self.extent(index),
            size / self.span.lb(),
            self.usable()?,
            &self.siblings(Some(index)),
            1,
        );
        if blocks == 0 {
            return Err(Error::BadValue("partition size would be zero"));
        }
        Ok(blocks)
    }

    /// Adjusts a move request, returns the absolute byte offset that would
    /// be applied.
    pub fn validate_move_child(&self, id: PartitionId, offset: u64) -> Result<u64, Error> {
        let index = self.index_of(id)?;
        let start = self.fit_move(index, offset)?;
        Ok(self.span.offset + start * self.span.lb())
    }

    fn fit_move(&self, index: usize, offset: u64) -> Result<u64, Error> {
        let rel = offset.saturating_sub(self.span.offset) / self.span.lb();
        geometry::fit_move(
            self.extent(index),
            rel,
            self.usable()?,
            &self.siblings(Some(index)),
            1,
        )
        .ok_or(Error::BadValue("partition cannot be moved there"))
    }
}

impl<D> GptTable<D>
where
    D: DiskDevice,
{
    /// Writes a protective MBR, an empty entry array and both headers.
    pub(crate) fn initialize(
        mut device: D,
        span: Span,
        disk_guid: Option<uuid::Uuid>,
    ) -> Result<Self, Error> {
        let block_count = span.block_count();
        if block_count < 3 {
            return Err(Error::BadValue("span too small for a GPT"));
        }
        let lb = span.block_size;

        let mut builder = HeaderBuilder::new();
        if let Some(guid) = disk_guid {
            builder.disk_guid(guid);
        }
        let primary = builder.backup_lba(block_count - 1).build(lb)?;
        let backup = HeaderBuilder::from_header(&primary).primary(false).build(lb)?;
        debug!("initializing GPT {}", primary.disk_guid);

        let mut pmbr_block = disk::alloc_zeroed(lb.as_usize())?;
        let protective_size = u32::try_from(block_count - 1).unwrap_or(u32::MAX);
        let pmbr = ProtectiveMBR::with_lb_size(protective_size);
        pmbr_block[..512].copy_from_slice(&pmbr.to_bytes());
        disk::write_at(&mut device, &span, 0, &pmbr_block)?;

        let entries = vec![GptEntry::empty(); primary.num_parts as usize];
        let mut table = Self {
            device,
            span,
            writable: true,
            primary_header: Ok(primary),
            backup_header: Ok(backup),
            entries,
        };
        table.write()?;
        Ok(table)
    }

    fn check_writable(&self) -> Result<(), Error> {
        if self.writable {
            Ok(())
        } else {
            Err(Error::ReadOnly)
        }
    }

    /// Creates a partition in the lowest unused entry.
    ///
    /// The start is rounded up and the size down to whole blocks, then
    /// clamped into the usable range and shrunk to avoid every sibling.
    pub fn create_child(
        &mut self,
        offset: u64,
        size: u64,
        part_type: &str,
        name: &str,
    ) -> Result<PartitionId, Error> {
        self.check_writable()?;
        let part_type = parse_type(part_type)?;
        let index = self
            .entries
            .iter()
            .position(|e| !e.is_used())
            .ok_or(Error::BadValue("no unused partition entry"))?;
        let extent = self.fit_create(offset, size)?;

        let entry = GptEntry {
            part_type_guid: part_type,
            part_guid: uuid::Uuid::new_v4(),
            first_lba: extent.start,
            last_lba: extent.end() - 1,
            attributes: Attributes::empty(),
            name: entry::truncate_name(name),
            ..GptEntry::empty()
        };
        debug!(
            "creating GPT entry {}: blocks {}..={}",
            index, entry.first_lba, entry.last_lba
        );
        self.apply(index, entry)?;
        Ok(PartitionId::Gpt(index as u32))
    }

    /// Resizes a partition in place, returns the applied size in bytes.
    pub fn resize_child(&mut self, id: PartitionId, size: u64) -> Result<u64, Error> {
        self.check_writable()?;
        let index = self.index_of(id)?;
        let blocks = self.fit_resize(index, size)?;

        let mut entry = self.entries[index].clone();
        entry.last_lba = entry.first_lba + blocks - 1;
        self.apply(index, entry)?;
        Ok(blocks * self.span.lb())
    }

    /// Moves a partition together with its contents, returns the applied
    /// absolute byte offset.
    pub fn move_child(&mut self, id: PartitionId, offset: u64) -> Result<u64, Error> {
        self.check_writable()?;
        let index = self.index_of(id)?;
        let start = self.fit_move(index, offset)?;
        let old = self.extent(index);
        if start == old.start {
            return Ok(self.span.offset + start * self.span.lb());
        }

        let lb = self.span.lb();
        disk::move_data(
            &mut self.device,
            &self.span,
            old.start * lb,
            start * lb,
            old.size * lb,
        )?;

        let mut entry = self.entries[index].clone();
        entry.first_lba = start;
        entry.last_lba = start + old.size - 1;
        self.apply(index, entry)?;
        Ok(self.span.offset + start * lb)
    }

    /// Changes the type, given by display name, constant name or GUID.
    pub fn set_type(&mut self, id: PartitionId, part_type: &str) -> Result<(), Error> {
        self.check_writable()?;
        let index = self.index_of(id)?;
        let mut entry = self.entries[index].clone();
        entry.part_type_guid = parse_type(part_type)?;
        self.apply(index, entry)
    }

    /// Renames a partition; names are cut to 36 UTF-16 code units.
    pub fn set_name(&mut self, id: PartitionId, name: &str) -> Result<(), Error> {
        self.check_writable()?;
        let index = self.index_of(id)?;
        let mut entry = self.entries[index].clone();
        entry.name = entry::truncate_name(name);
        self.apply(index, entry)
    }

    /// Replaces the attribute bits.
    pub fn set_attributes(&mut self, id: PartitionId, attributes: Attributes) -> Result<(), Error> {
        self.check_writable()?;
        let index = self.index_of(id)?;
        let mut entry = self.entries[index].clone();
        entry.attributes = attributes;
        self.apply(index, entry)
    }

    /// Clears the entry; other entries keep their indices.
    pub fn delete_child(&mut self, id: PartitionId) -> Result<(), Error> {
        self.check_writable()?;
        let index = self.index_of(id)?;
        debug!("deleting GPT entry {}", index);
        self.apply(index, GptEntry::empty())
    }

    /// Stores `entry` at `index` and writes it, restoring the old entry if
    /// the write fails.
    fn apply(&mut self, index: usize, entry: GptEntry) -> Result<(), Error> {
        let old = std::mem::replace(&mut self.entries[index], entry);
        if let Err(e) = self.write_entry(index) {
            warn!("writing GPT entry {} failed: {}", index, e);
            self.entries[index] = old;
            return Err(e);
        }
        Ok(())
    }

    /// Writes the blocks holding entry `index` and the header, primary copy
    /// first. A dirty table is rewritten completely instead.
    fn write_entry(&mut self, index: usize) -> Result<(), Error> {
        if self.is_dirty() {
            return self.write();
        }
        let old_primary = self.primary_header.as_ref().ok().cloned();
        let old_backup = self.backup_header.as_ref().ok().cloned();

        let res = self.write_entry_copies(index);
        if res.is_err() {
            if let Some(h) = old_primary {
                self.primary_header = Ok(h);
            }
            if let Some(h) = old_backup {
                self.backup_header = Ok(h);
            }
        }
        res
    }

    fn write_entry_copies(&mut self, index: usize) -> Result<(), Error> {
        for primary in [true, false] {
            let current = if primary {
                &self.primary_header
            } else {
                &self.backup_header
            };
            let mut h = match current {
                Ok(h) => h.clone(),
                Err(_) => continue,
            };

            let array = self.entry_array(&h)?;
            let lb = self.span.lb();
            let part_size = u64::from(h.part_size);
            let start = index as u64 * part_size;
            let first_block = start / lb;
            let end_block = div_ceil(start + part_size, lb);
            let from = (first_block * lb) as usize;
            let to = ((end_block * lb) as usize).min(array.len());

            trace!(
                "writing entry {} blocks {}..{} of the array at lba {}",
                index,
                first_block,
                end_block,
                h.part_start
            );
            disk::write_at(
                &mut self.device,
                &self.span,
                (h.part_start + first_block) * lb,
                &array[from..to],
            )?;

            h.seal(header::calculate_crc32(&array));
            header::write_header(&mut self.device, &self.span, &h)?;
            if primary {
                self.primary_header = Ok(h);
            } else {
                self.backup_header = Ok(h);
            }
        }
        self.device.flush()?;
        Ok(())
    }

    /// Rewrites both entry arrays and then both headers.
    ///
    /// A header copy that failed validation is regenerated from the other.
    pub fn write(&mut self) -> Result<(), Error> {
        self.check_writable()?;
        let lb = self.span.block_size;
        let base = self.header()?.clone();

        let mut primary = match &self.primary_header {
            Ok(h) => h.clone(),
            Err(_) => HeaderBuilder::from_header(&base).primary(true).build(lb)?,
        };
        let mut backup = match &self.backup_header {
            Ok(h) => h.clone(),
            Err(_) => HeaderBuilder::from_header(&base).primary(false).build(lb)?,
        };

        let primary_array = self.entry_array(&primary)?;
        let backup_array = self.entry_array(&backup)?;
        debug!("writing GPT entry arrays and headers");
        disk::write_at(
            &mut self.device,
            &self.span,
            primary.part_start * self.span.lb(),
            &primary_array,
        )?;
        disk::write_at(
            &mut self.device,
            &self.span,
            backup.part_start * self.span.lb(),
            &backup_array,
        )?;

        primary.seal(header::calculate_crc32(&primary_array));
        header::write_header(&mut self.device, &self.span, &primary)?;
        self.primary_header.insert_ok(primary);

        backup.seal(header::calculate_crc32(&backup_array));
        header::write_header(&mut self.device, &self.span, &backup)?;
        self.backup_header.insert_ok(backup);

        self.device.flush()?;
        Ok(())
    }

    /// Serializes the entries the way header `h` lays them out.
    fn entry_array(&self, h: &Header) -> Result<Vec<u8>, Error> {
        let len = h.entry_array_len()?;
        let part_size = h.part_size as usize;
        let mut array = disk::alloc_zeroed(len as usize)?;
        for (chunk, e) in array.chunks_exact_mut(part_size).zip(&self.entries) {
            chunk.copy_from_slice(&e.to_bytes(h.part_size));
        }
        Ok(array)
    }
}

fn div_ceil(lhs: u64, rhs: u64) -> u64 {
    (lhs + rhs - 1) / rhs
}

fn parse_type(s: &str) -> Result<Type, Error> {
    let t = Type::from_str(s).map_err(|_| Error::BadValue("unknown partition type"))?;
    if t.is_unused() {
        return Err(Error::BadValue("the unused type cannot be assigned"));
    }
    Ok(t)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::disk::LogicalBlockSize;
    use std::io::Cursor;

    const BLOCKS: u64 = 2048;

    fn fresh() -> GptTable<Cursor<Vec<u8>>> {
        let dev = Cursor::new(vec![0u8; (BLOCKS * 512) as usize]);
        let span = Span::new(0, BLOCKS * 512, LogicalBlockSize::Lb512);
        GptTable::initialize(dev, span, None).unwrap()
    }

    fn reread(t: GptTable<Cursor<Vec<u8>>>) -> GptTable<Cursor<Vec<u8>>> {
        let span = *t.span();
        let mut dev = t.take_device();
        let layout = probe(&mut dev, &span, &TableConfig::new()).unwrap();
        GptTable::from_layout(dev, span, true, layout)
    }

    #[test]
    fn initialized_table_is_clean_and_empty() {
        let t = fresh();
        let h = t.header().unwrap();
        assert_eq!(h.first_usable, 34);
        assert_eq!(h.last_usable, BLOCKS - 34);
        assert!(t.partitions().is_empty());

        let t = reread(t);
        assert!(!t.is_dirty());
        assert_eq!(t.confidence(), CONFIDENCE);
        // protective MBR
        let raw = t.device_ref().get_ref();
        assert_eq!(raw[450], 0xee);
        assert_eq!(&raw[510..512], &[0x55, 0xaa]);
    }

    #[test]
    fn first_fit_and_clamping() {
        let mut t = fresh();
        let a = t.create_child(0, 100 * 512, "Linux data", "a").unwrap();
        assert_eq!(a, PartitionId::Gpt(0));
        // overlaps a, gets pushed behind it
        let b = t.create_child(40 * 512, 100 * 512 + 7, "BASIC", "b").unwrap();
        assert_eq!(b, PartitionId::Gpt(1));

        let parts = t.partitions();
        assert_eq!(parts[0].offset, 34 * 512);
        assert_eq!(parts[0].size, 100 * 512);
        assert_eq!(parts[1].offset, 134 * 512);
        assert_eq!(parts[1].size, 6 * 512);

        t.delete_child(a).unwrap();
        let c = t.create_child(0, 512, "EFI system data", "c").unwrap();
        assert_eq!(c, PartitionId::Gpt(0));
    }

    #[test]
    fn free_space_between_entries() {
        let mut t = fresh();
        assert_eq!(
            t.partitionable_spaces().unwrap(),
            vec![(34 * 512, (BLOCKS - 34 + 1 - 34) * 512)]
        );
        t.create_child(0, 100 * 512, "Linux data", "a").unwrap();
        t.create_child(500 * 512, 100 * 512, "Linux data", "b").unwrap();
        assert_eq!(
            t.partitionable_spaces().unwrap(),
            vec![
                (134 * 512, 366 * 512),
                (600 * 512, (BLOCKS - 33 - 600) * 512)
            ]
        );
    }

    #[test]
    fn rejects_bad_requests() {
        let mut t = fresh();
        assert_eq!(
            t.create_child(0, 511, "Linux data", "").unwrap_err().kind(),
            crate::ErrorKind::BadValue
        );
        assert!(t.create_child(0, 512, "Unused", "").is_err());
        assert!(t.create_child(0, 512, "no such type", "").is_err());
        assert!(t.create_child(BLOCKS * 512, 512, "Linux data", "").is_err());
        assert!(t.delete_child(PartitionId::Gpt(5)).is_err());
        assert!(t.delete_child(PartitionId::Primary(0)).is_err());
    }

    #[test]
    fn untouched_entries_keep_their_bytes() {
        let mut t = fresh();
        for i in 0..5 {
            t.create_child(0, 8 * 512, "Linux data", &format!("p{i}"))
                .unwrap();
        }
        let span = *t.span();
        let mut dev = t.take_device();

        // entry 4 sits in the second block of each array
        let name = 4 * 128 + 56;
        let primary = header::read_header(&mut dev, &span, 1).unwrap();
        let backup = header::read_header(&mut dev, &span, primary.backup_lba).unwrap();
        for mut h in [primary, backup] {
            let mut array = header::read_entries(&mut dev, &span, &h).unwrap();
            array[name + 2..name + 4].copy_from_slice(&0xd800u16.to_le_bytes());
            array[name + 20] = 0x5a;
            disk::write_at(&mut dev, &span, h.part_start * 512, &array).unwrap();
            h.seal(header::calculate_crc32(&array));
            header::write_header(&mut dev, &span, &h).unwrap();
        }

        let layout = probe(&mut dev, &span, &TableConfig::new()).unwrap();
        let mut t = GptTable::from_layout(dev, span, true, layout);
        assert!(!t.is_dirty());
        assert_eq!(t.entries()[4].name, "p\u{fffd}");

        t.set_name(PartitionId::Gpt(0), "renamed").unwrap();
        let t = reread(t);
        assert!(!t.is_dirty());
        assert_eq!(t.partitions()[0].name, "renamed");
        let at = 2 * 512 + name;
        let raw = t.device_ref().get_ref();
        assert_eq!(&raw[at + 2..at + 4], &[0x00, 0xd8]);
        assert_eq!(raw[at + 20], 0x5a);
    }

    #[test]
    fn mutations_survive_a_rescan() {
        let mut t = fresh();
        let id = t.create_child(0, 64 * 512, "Linux data", "data").unwrap();
        assert_eq!(t.resize_child(id, 32 * 512).unwrap(), 32 * 512);
        t.set_type(id, "Haiku").unwrap();
        t.set_name(id, "renamed").unwrap();
        t.set_attributes(id, Attributes::LEGACY_BIOS_BOOTABLE).unwrap();

        let t = reread(t);
        assert!(!t.is_dirty());
        let p = &t.partitions()[0];
        assert_eq!(p.size, 32 * 512);
        assert_eq!(p.type_name, "Haiku");
        assert_eq!(p.name, "renamed");
        assert_eq!(p.attributes, Attributes::LEGACY_BIOS_BOOTABLE);
    }

    #[test]
    fn move_carries_data() {
        let mut t = fresh();
        let id = t.create_child(0, 8 * 512, "Linux data", "").unwrap();
        t.device.get_mut()[34 * 512..42 * 512].fill(0x5a);

        assert_eq!(t.validate_move_child(id, 100 * 512).unwrap(), 100 * 512);
        assert_eq!(t.move_child(id, 100 * 512).unwrap(), 100 * 512);
        assert!(t.device_ref().get_ref()[100 * 512..108 * 512]
            .iter()
            .all(|b| *b == 0x5a));

        let t = reread(t);
        assert_eq!(t.partitions()[0].offset, 100 * 512);
    }

    #[test]
    fn read_only_tables_refuse_writes() {
        let t = fresh();
        let span = *t.span();
        let mut dev = t.take_device();
        let layout = probe(&mut dev, &span, &TableConfig::new()).unwrap();
        let mut t = GptTable::from_layout(dev, span, false, layout);
        assert!(matches!(
            t.create_child(0, 512, "Linux data", ""),
            Err(Error::ReadOnly)
        ));
    }
}
