//! GPT partition entries.

use std::fmt;

use bitflags::bitflags;
use simple_bytes::{Bytes, BytesArray, BytesRead, BytesWrite};

use crate::header::{parse_uuid, write_uuid, HeaderError, MIN_PART_SIZE};
use crate::partition_types::Type;

/// Maximum name length in UTF-16 code units.
pub const NAME_UNITS: usize = 36;

bitflags! {
    /// Entry attribute bits.
    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
    pub struct Attributes: u64 {
        /// Required for the platform to function.
        const REQUIRED = 1 << 0;
        /// Firmware must not map block I/O for this partition.
        const NO_BLOCK_IO = 1 << 1;
        /// Bootable by legacy BIOS.
        const LEGACY_BIOS_BOOTABLE = 1 << 2;
        /// Bits 48 to 63, owned by the partition type.
        const TYPE_SPECIFIC = 0xffff << 48;

        const _ = !0;
    }
}

/// Offset of the name inside an entry.
const NAME_OFFSET: usize = 56;

/// One entry of the GPT entry array.
///
/// The bytes an entry was parsed from are kept, so an entry that is not
/// changed serializes exactly as it was read, names that do not decode
/// cleanly and data past byte 128 included.
#[derive(Clone, Debug)]
pub struct GptEntry {
    /// GUID of the partition type.
    pub part_type_guid: Type,
    /// UUID of the partition.
    pub part_guid: uuid::Uuid,
    /// First LBA of the partition.
    pub first_lba: u64,
    /// Last LBA of the partition (inclusive).
    pub last_lba: u64,
    /// Partition attributes.
    pub attributes: Attributes,
    /// Partition name, at most 36 UTF-16 code units.
    pub name: String,
    /// On-disk bytes, empty for entries built in memory.
    pub(crate) raw: Vec<u8>,
}

impl PartialEq for GptEntry {
    fn eq(&self, other: &Self) -> bool {
        self.part_type_guid == other.part_type_guid
            && self.part_guid == other.part_guid
            && self.first_lba == other.first_lba
            && self.last_lba == other.last_lba
            && self.attributes == other.attributes
            && self.name == other.name
    }
}

impl Eq for GptEntry {}

impl GptEntry {
    /// An unused entry.
    pub fn empty() -> Self {
        Self {
            part_type_guid: Type::from(uuid::Uuid::nil()),
            part_guid: uuid::Uuid::nil(),
            first_lba: 0,
            last_lba: 0,
            attributes: Attributes::empty(),
            name: String::new(),
            raw: Vec::new(),
        }
    }

    /// An entry is used as long as its type GUID is not nil.
    pub fn is_used(&self) -> bool {
        !self.part_type_guid.guid.is_nil()
    }

    /// Number of blocks covered.
    pub fn size_lba(&self) -> u64 {
        if self.last_lba < self.first_lba {
            0
        } else {
            self.last_lba - self.first_lba + 1
        }
    }

    /// Parses one entry; `buf` must hold at least 128 bytes.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, HeaderError> {
        if buf.len() < MIN_PART_SIZE as usize {
            return Err(HeaderError::InvalidEntryArray("entry shorter than 128 bytes"));
        }
        let mut bytes = Bytes::from(buf);

        let part_type_guid = Type::from(parse_uuid(&mut bytes)?);
        let part_guid = parse_uuid(&mut bytes)?;
        let first_lba = bytes.read_le_u64();
        let last_lba = bytes.read_le_u64();
        let attributes = Attributes::from_bits_retain(bytes.read_le_u64());
        let name = read_name(bytes.read(NAME_UNITS * 2));

        Ok(Self {
            part_type_guid,
            part_guid,
            first_lba,
            last_lba,
            attributes,
            name,
            raw: buf.to_vec(),
        })
    }

    /// Serializes into `part_size` bytes.
    ///
    /// Starts from the bytes the entry was read from, zero padded past the
    /// 128 defined ones for new entries. The name is only re-encoded when
    /// it no longer matches what those bytes decode to.
    pub fn to_bytes(&self, part_size: u32) -> Vec<u8> {
        let mut out = self.raw.clone();
        out.resize((part_size as usize).max(MIN_PART_SIZE as usize), 0);

        let mut fields = BytesArray::from([0u8; NAME_OFFSET]);
        write_uuid(&mut fields, &self.part_type_guid.guid);
        write_uuid(&mut fields, &self.part_guid);
        fields.write_le_u64(self.first_lba);
        fields.write_le_u64(self.last_lba);
        fields.write_le_u64(self.attributes.bits());
        out[..NAME_OFFSET].copy_from_slice(&fields.into_array());

        let name_area = NAME_OFFSET..NAME_OFFSET + NAME_UNITS * 2;
        let stale = match self.raw.get(name_area.clone()) {
            Some(raw_name) => read_name(raw_name) != self.name,
            None => true,
        };
        if stale {
            out[name_area].copy_from_slice(&encode_name(&self.name));
        }
        out
    }
}

impl fmt::Display for GptEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Partition:\t\t{}\nPartition GUID:\t\t{}\nPartition Type:\t\t{}\n\
             Span:\t\t\t{} - {}\nFlags:\t\t\t{:#x}",
            self.name,
            self.part_guid,
            self.part_type_guid.display_name(),
            self.first_lba,
            self.last_lba,
            self.attributes.bits()
        )
    }
}

/// Decodes a NUL terminated UTF-16LE name.
fn read_name(raw: &[u8]) -> String {
    let units: Vec<u16> = raw
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .take_while(|u| *u != 0)
        .collect();
    String::from_utf16_lossy(&units)
}

/// Encodes `name` as zero padded UTF-16LE, cut at 36 units.
fn encode_name(name: &str) -> [u8; NAME_UNITS * 2] {
    let mut bytes = BytesArray::from([0u8; NAME_UNITS * 2]);
    for unit in name.encode_utf16().take(NAME_UNITS) {
        bytes.write_le_u16(unit);
    }
    bytes.into_array()
}

/// Cuts `name` down to what fits into an entry, never splitting a
/// surrogate pair.
pub fn truncate_name(name: &str) -> String {
    let mut units = 0;
    let mut out = String::new();
    for c in name.chars() {
        units += c.len_utf16();
        if units > NAME_UNITS {
            break;
        }
        out.push(c);
    }
    out
}
