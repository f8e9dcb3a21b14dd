use super::{Header, HeaderError, HEADER_SIZE, MIN_NUM_PARTS, MIN_PART_SIZE};
use crate::disk::LogicalBlockSize;

use uuid::Uuid;

/// A builder struct to build a Header
///
/// The built header carries zeroed checksums, call [`Header::seal`] once the
/// entry array is known.
#[derive(Debug, Clone)]
pub struct HeaderBuilder {
    primary: bool,
    disk_guid: Uuid,
    primary_lba: u64,
    backup_lba: u64,
    /// First usable LBA for partitions (primary table last LBA + 1)
    first_usable: Option<u64>,
    /// Last usable LBA (secondary partition table first LBA - 1)
    last_usable: Option<u64>,
    /// Number of partition entries
    num_parts: u32,
    /// Size of a partition entry, usually 128
    part_size: u32,
}

impl HeaderBuilder {
    /// Creates a new `HeaderBuilder`
    pub fn new() -> Self {
        Self {
            primary: true,
            disk_guid: Uuid::new_v4(),
            primary_lba: 1,
            backup_lba: 0,
            first_usable: None,
            last_usable: None,
            num_parts: MIN_NUM_PARTS,
            part_size: MIN_PART_SIZE,
        }
    }

    /// Creates a new `HeaderBuilder` using the values from an existing Header
    ///
    /// Used to regenerate a lost copy from the surviving one.
    pub fn from_header(header: &Header) -> Self {
        let primary = header.is_primary();

        let (primary_lba, backup_lba) = if primary {
            (header.current_lba, header.backup_lba)
        } else {
            (header.backup_lba, header.current_lba)
        };

        Self {
            primary,
            disk_guid: header.disk_guid,
            primary_lba,
            backup_lba,
            first_usable: Some(header.first_usable),
            last_usable: Some(header.last_usable),
            num_parts: header.num_parts,
            part_size: header.part_size,
        }
    }

    /// Set wether this header is the primary or the backup.
    pub fn primary(&mut self, primary: bool) -> &mut Self {
        self.primary = primary;
        self
    }

    /// Change the disk guid, by default is generates a new one.
    pub fn disk_guid(&mut self, disk_guid: Uuid) -> &mut Self {
        self.disk_guid = disk_guid;
        self
    }

    /// Set the backup_lba position, usually the last block of the span.
    pub fn backup_lba(&mut self, backup_lba: u64) -> &mut Self {
        self.backup_lba = backup_lba;
        self
    }

    /// If you don't set this it will get calculated automatically
    ///
    /// Values inside the primary entry array are raised past it.
    pub fn first_usable(&mut self, first_usable: u64) -> &mut Self {
        self.first_usable = Some(first_usable);
        self
    }

    /// If you don't set this it will get calculated automatically
    ///
    /// Values inside the backup entry array are lowered below it.
    pub fn last_usable(&mut self, last_usable: u64) -> &mut Self {
        self.last_usable = Some(last_usable);
        self
    }

    /// this will always set 128 >=
    ///
    /// ## Warning
    /// This might change the first usable and last usable part
    pub fn num_parts(&mut self, num_parts: u32) -> &mut Self {
        self.num_parts = num_parts.max(MIN_NUM_PARTS);
        self
    }

    /// Entry size, a multiple of 8 and at least 128.
    ///
    /// ## Warning
    /// This might change the first usable and last usable part
    pub fn part_size(&mut self, part_size: u32) -> &mut Self {
        self.part_size = part_size;
        self
    }

    /// At least the following functions need to be called if the header
    /// doesn't get copied
    /// - backup_lba
    pub fn build(&mut self, lb_size: LogicalBlockSize) -> Result<Header, HeaderError> {
        // validate data
        if self.backup_lba <= self.primary_lba {
            return Err(HeaderError::MissingBackupLba);
        }

        let (current_lba, backup_lba) = if self.primary {
            (self.primary_lba, self.backup_lba)
        } else {
            (self.backup_lba, self.primary_lba)
        };

        let mut header = Header {
            signature: String::from_utf8_lossy(super::HEADER_SIGNATURE).into_owned(),
            revision: (1, 0),
            header_size: HEADER_SIZE,
            crc32: 0,
            reserved: 0,
            current_lba,
            backup_lba,
            first_usable: 0,
            last_usable: 0,
            disk_guid: self.disk_guid,
            part_start: 0,
            num_parts: self.num_parts,
            part_size: self.part_size,
            crc32_parts: 0,
        };
        let part_array_lbs = header.entry_array_blocks(lb_size)?;

        // mbr, header, part_array
        let min_first = self.primary_lba + 1 + part_array_lbs;
        // last is inclusive: end of disk is (partition array) (backup header)
        let max_last = self
            .backup_lba
            .checked_sub(part_array_lbs + 1)
            .ok_or(HeaderError::BackupLbaToEarly)?;

        let first_usable = self.first_usable.map_or(min_first, |f| f.max(min_first));
        let last_usable = self.last_usable.map_or(max_last, |l| l.min(max_last));

        if first_usable > last_usable {
            return Err(HeaderError::BackupLbaToEarly);
        }

        header.first_usable = first_usable;
        header.last_usable = last_usable;
        header.part_start = if self.primary {
            self.primary_lba + 1
        } else {
            max_last + 1
        };

        Ok(header)
    }
}

impl Default for HeaderBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn u64_div_ceil(lhs: u64, rhs: u64) -> u64 {
    (lhs + (rhs - 1)) / rhs
}
