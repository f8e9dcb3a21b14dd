//! GPT-header object and helper functions.

mod builder;

pub use builder::HeaderBuilder;

use crc::Crc;
use std::{fmt, io};

use crate::disk::{self, Span};

use simple_bytes::{Bytes, BytesArray, BytesRead, BytesWrite};

/// "EFI PART"
pub const HEADER_SIGNATURE: &[u8; 8] = b"EFI PART";
/// Size of the header fields defined by revision 1.0.
pub const HEADER_SIZE: u32 = 92;
/// Minimum number of entries a newly built array holds.
pub const MIN_NUM_PARTS: u32 = 128;
/// Minimum size of one entry.
pub const MIN_PART_SIZE: u32 = 128;
/// Entry arrays larger than this are refused.
pub const MAX_ENTRY_ARRAY_SIZE: u64 = 4 * 1024 * 1024;

#[non_exhaustive]
#[derive(Debug)]
/// Errors returned when interacting with a header.
pub enum HeaderError {
    /// Generic IO Error
    Io(io::Error),
    /// The header block lies outside of the span
    OutOfBounds,
    /// The signature was not "EFI PART"
    InvalidGptSignature,
    /// header_size is smaller than 92 or larger than a block
    InvalidHeaderSize,
    /// The header checksum did not match
    InvalidCRC32Checksum,
    /// The header does not describe the block it was read from
    WrongCurrentLba,
    /// The entry array size, entry size or position is unusable
    InvalidEntryArray(&'static str),
    /// The entry array checksum did not match
    InvalidEntriesCRC32Checksum,
    /// The usable range is empty, leaves the span or overlaps the entry array
    InvalidLayout(&'static str),
    // Builder errors
    /// Get's returned when you call build on a HeaderBuilder and the backup lba field
    /// was never set
    MissingBackupLba,
    /// Get's returned when you call build on a HeaderBuilder and there isn't enough space
    /// between first_lba and backup_lba
    BackupLbaToEarly,
}

impl HeaderError {
    /// Clones the error, turning an io error into one with the same kind.
    pub fn lossy_clone(&self) -> Self {
        use HeaderError::*;
        match self {
            Io(e) => Io(io::Error::new(e.kind(), e.to_string())),
            OutOfBounds => OutOfBounds,
            InvalidGptSignature => InvalidGptSignature,
            InvalidHeaderSize => InvalidHeaderSize,
            InvalidCRC32Checksum => InvalidCRC32Checksum,
            WrongCurrentLba => WrongCurrentLba,
            InvalidEntryArray(m) => InvalidEntryArray(m),
            InvalidEntriesCRC32Checksum => InvalidEntriesCRC32Checksum,
            InvalidLayout(m) => InvalidLayout(m),
            MissingBackupLba => MissingBackupLba,
            BackupLbaToEarly => BackupLbaToEarly,
        }
    }

    /// Builder errors are caused by the caller, everything else by the disk.
    pub(crate) fn is_builder_error(&self) -> bool {
        matches!(
            self,
            HeaderError::MissingBackupLba | HeaderError::BackupLbaToEarly
        )
    }
}

impl From<io::Error> for HeaderError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl std::error::Error for HeaderError {}

impl fmt::Display for HeaderError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        use HeaderError::*;
        let desc = match self {
            Io(e) => return write!(fmt, "GPT header IO Error: {e}"),
            OutOfBounds => "GPT header lies outside of the partitioned area",
            InvalidGptSignature => "invalid GPT signature",
            InvalidHeaderSize => "invalid GPT header size",
            InvalidCRC32Checksum => "invalid CRC32 checksum",
            WrongCurrentLba => "GPT header does not describe its own location",
            InvalidEntryArray(m) => return write!(fmt, "invalid partition entry array: {m}"),
            InvalidEntriesCRC32Checksum => "invalid partition entry array CRC32 checksum",
            InvalidLayout(m) => return write!(fmt, "invalid GPT layout: {m}"),
            MissingBackupLba => "HeaderBuilder expects the field backup_lba to be set",
            BackupLbaToEarly => {
                "HeaderBuilder: there isn't enough space between first_lba and backup_lba"
            }
        };
        write!(fmt, "{}", desc)
    }
}

/// Header describing a GPT disk.
///
/// All LBAs are relative to the start of the span the table lives in.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Header {
    /// GPT header magic signature, hardcoded to "EFI PART".
    pub signature: String, // Offset  0. "EFI PART", 45h 46h 49h 20h 50h 41h 52h 54h
    /// major, minor
    pub revision: (u16, u16), // Offset  8
    /// little endian
    pub header_size: u32, // Offset 12
    /// CRC32 of the header with crc32 section zeroed
    pub crc32: u32, // Offset 16
    /// must be 0
    pub reserved: u32, // Offset 20
    /// For main header, 1
    pub current_lba: u64, // Offset 24
    /// LBA for backup header
    pub backup_lba: u64, // Offset 32
    /// First usable LBA for partitions (primary table last LBA + 1)
    pub first_usable: u64, // Offset 40
    /// Last usable LBA (secondary partition table first LBA - 1)
    pub last_usable: u64, // Offset 48
    /// UUID of the disk
    pub disk_guid: uuid::Uuid, // Offset 56
    /// Starting LBA of partition entries
    pub part_start: u64, // Offset 72
    /// Number of partition entries
    pub num_parts: u32, // Offset 80
    /// Size of a partition entry, usually 128
    pub part_size: u32, // Offset 84
    /// CRC32 of the partition table
    pub crc32_parts: u32, // Offset 88
}

impl Header {
    /// Whether this header sits before its alternate.
    pub fn is_primary(&self) -> bool {
        self.current_lba < self.backup_lba
    }

    /// Byte length of the entry array, after checking its shape.
    ///
    /// Entries smaller than 128 bytes, not a multiple of 8 bytes, or an
    /// array above 4 MiB are refused.
    pub fn entry_array_len(&self) -> Result<u64, HeaderError> {
        if self.part_size < MIN_PART_SIZE {
            return Err(HeaderError::InvalidEntryArray("entry size below 128 bytes"));
        }
        if self.part_size % 8 != 0 {
            return Err(HeaderError::InvalidEntryArray(
                "entry size not a multiple of 8",
            ));
        }
        let len = u64::from(self.num_parts) * u64::from(self.part_size);
        if len > MAX_ENTRY_ARRAY_SIZE {
            return Err(HeaderError::InvalidEntryArray("entry array too large"));
        }
        Ok(len)
    }

    /// Number of blocks the entry array occupies.
    pub fn entry_array_blocks(&self, lb_size: disk::LogicalBlockSize) -> Result<u64, HeaderError> {
        let len = self.entry_array_len()?;
        Ok(builder::u64_div_ceil(len, lb_size.as_u64()))
    }

    /// Checks the usable range against the span and the entry array.
    pub fn check_layout(
        &self,
        block_count: u64,
        lb_size: disk::LogicalBlockSize,
    ) -> Result<(), HeaderError> {
        if self.first_usable > self.last_usable {
            return Err(HeaderError::InvalidLayout("usable range is empty"));
        }
        if self.first_usable <= self.current_lba.min(self.backup_lba)
            || self.last_usable >= self.current_lba.max(self.backup_lba)
            || self.last_usable >= block_count
        {
            return Err(HeaderError::InvalidLayout("usable range outside of the span"));
        }
        let array_end = self
            .part_start
            .saturating_add(self.entry_array_blocks(lb_size)?);
        if self.part_start <= self.last_usable && array_end > self.first_usable {
            return Err(HeaderError::InvalidLayout(
                "entry array overlaps the usable range",
            ));
        }
        Ok(())
    }

    /// Stores the entry array checksum and recomputes the header checksum.
    pub fn seal(&mut self, crc32_parts: u32) {
        self.crc32_parts = crc32_parts;
        self.crc32 = 0;
        let bytes = self.as_bytes();
        let len = (self.header_size as usize).clamp(HEADER_SIZE as usize, bytes.len());
        self.crc32 = calculate_crc32(&bytes[..len]);
        trace!("computed header CRC32: {:#x}", self.crc32);
    }

    /// Serializes the header into one zero-padded logical block.
    ///
    /// `seal` must have been called for the checksums to be current.
    pub fn to_block(&self, lb_size: disk::LogicalBlockSize) -> Vec<u8> {
        let mut block = self.as_bytes();
        block.resize(lb_size.as_usize(), 0);
        block
    }

    /// The header fields followed by zeros up to `header_size`.
    fn as_bytes(&self) -> Vec<u8> {
        let mut bytes = BytesArray::from([0u8; 92]);

        BytesWrite::write(&mut bytes, HEADER_SIGNATURE);
        bytes.write_le_u16(self.revision.1);
        bytes.write_le_u16(self.revision.0);
        bytes.write_le_u32(self.header_size);
        bytes.write_le_u32(self.crc32);
        bytes.write_le_u32(0);
        bytes.write_le_u64(self.current_lba);
        bytes.write_le_u64(self.backup_lba);
        bytes.write_le_u64(self.first_usable);
        bytes.write_le_u64(self.last_usable);
        write_uuid(&mut bytes, &self.disk_guid);
        bytes.write_le_u64(self.part_start);
        bytes.write_le_u32(self.num_parts);
        bytes.write_le_u32(self.part_size);
        bytes.write_le_u32(self.crc32_parts);

        let mut out = bytes.into_array().to_vec();
        if self.header_size > HEADER_SIZE {
            out.resize(self.header_size as usize, 0);
        }
        out
    }

    /// Parses and validates a header read from block `lba`.
    pub fn from_block(block: &[u8], lba: u64) -> Result<Self, HeaderError> {
        if block.len() < HEADER_SIZE as usize {
            return Err(HeaderError::InvalidHeaderSize);
        }
        let mut bytes = Bytes::from(block);

        if BytesRead::read(&mut bytes, 8) != HEADER_SIGNATURE {
            return Err(HeaderError::InvalidGptSignature);
        }

        let h = Header {
            signature: String::from_utf8_lossy(HEADER_SIGNATURE).into_owned(),
            revision: {
                let minor = bytes.read_le_u16();
                let major = bytes.read_le_u16();
                (major, minor)
            },
            header_size: bytes.read_le_u32(),
            crc32: bytes.read_le_u32(),
            reserved: bytes.read_le_u32(),
            current_lba: bytes.read_le_u64(),
            backup_lba: bytes.read_le_u64(),
            first_usable: bytes.read_le_u64(),
            last_usable: bytes.read_le_u64(),
            disk_guid: parse_uuid(&mut bytes)?,
            part_start: bytes.read_le_u64(),
            // Note: this will always return the total number of partition entries
            // in the array, not how many are actually used
            num_parts: bytes.read_le_u32(),
            part_size: bytes.read_le_u32(),
            crc32_parts: bytes.read_le_u32(),
        };
        trace!("header gpt: {}", h.disk_guid.as_hyphenated());

        if h.header_size < HEADER_SIZE || h.header_size as usize > block.len() {
            return Err(HeaderError::InvalidHeaderSize);
        }

        // checksum over header_size bytes with the crc field zeroed
        let mut raw = block[..h.header_size as usize].to_vec();
        raw[16..20].copy_from_slice(&[0; 4]);
        let c = calculate_crc32(&raw);
        trace!("header CRC32: {:#x} - computed CRC32: {:#x}", h.crc32, c);
        if c != h.crc32 {
            return Err(HeaderError::InvalidCRC32Checksum);
        }

        if h.current_lba != lba {
            debug!("header at lba {} claims lba {}", lba, h.current_lba);
            return Err(HeaderError::WrongCurrentLba);
        }

        Ok(h)
    }
}

/// Parses a uuid with first 3 portions in little endian.
pub fn parse_uuid<R: BytesRead>(rdr: &mut R) -> Result<uuid::Uuid, HeaderError> {
    if rdr.remaining().len() < 16 {
        return Err(HeaderError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "uuid needs 16bytes",
        )));
    }

    let d1 = rdr.read_le_u32();
    let d2 = rdr.read_le_u16();
    let d3 = rdr.read_le_u16();
    let mut d4 = [0u8; 8];
    d4.copy_from_slice(rdr.read(8));

    Ok(uuid::Uuid::from_fields(d1, d2, d3, &d4))
}

/// Writes a uuid with first 3 portions in little endian.
pub fn write_uuid<W: BytesWrite>(wtr: &mut W, uuid: &uuid::Uuid) {
    let fields = uuid.as_fields();
    wtr.write_le_u32(fields.0);
    wtr.write_le_u16(fields.1);
    wtr.write_le_u16(fields.2);
    wtr.write(fields.3);
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Disk:\t\t{}\nCRC32:\t\t{:#x}\nTable CRC:\t{:#x}\nUsable:\t\t{}..={}",
            self.disk_guid, self.crc32, self.crc32_parts, self.first_usable, self.last_usable
        )
    }
}

/// Reads and validates the header stored at block `lba` of the span.
///
/// ## Example
///
/// ```rust,no_run
/// use ptable::disk::{LogicalBlockSize, Span};
/// use ptable::header::read_header;
///
/// let mut file = std::fs::File::open("/dev/sdz").unwrap();
/// let span = Span::whole_device(&mut file, LogicalBlockSize::Lb512).unwrap();
/// let h = read_header(&mut file, &span, 1).unwrap();
/// ```
pub fn read_header<D: io::Read + io::Seek>(
    device: &mut D,
    span: &Span,
    lba: u64,
) -> Result<Header, HeaderError> {
    let block = disk::read_block(device, span, lba).map_err(read_error)?;
    Header::from_block(&block, lba)
}

/// Reads the entry array `header` points to and checks it against the
/// header's `crc32_parts`.
pub fn read_entries<D: io::Read + io::Seek>(
    device: &mut D,
    span: &Span,
    header: &Header,
) -> Result<Vec<u8>, crate::Error> {
    let len = header.entry_array_len()?;
    let offset = header
        .part_start
        .checked_mul(span.lb())
        .ok_or(HeaderError::InvalidEntryArray("entry array offset overflows"))?;
    if header.part_start == 0 || !span.contains(offset, len) {
        return Err(HeaderError::InvalidEntryArray("entry array outside of the span").into());
    }

    trace!("reading {} bytes of entries at lba {}", len, header.part_start);
    let mut buf = disk::alloc_zeroed(len as usize)?;
    disk::read_at(device, span, offset, &mut buf)?;

    let c = calculate_crc32(&buf);
    trace!(
        "entries CRC32: {:#x} - computed CRC32: {:#x}",
        header.crc32_parts,
        c
    );
    if c != header.crc32_parts {
        return Err(HeaderError::InvalidEntriesCRC32Checksum.into());
    }
    Ok(buf)
}

/// Writes the header block at `header.current_lba`.
pub fn write_header<D: io::Write + io::Seek>(
    device: &mut D,
    span: &Span,
    header: &Header,
) -> Result<(), crate::Error> {
    let offset = header
        .current_lba
        .checked_mul(span.lb())
        .ok_or(crate::Error::BadValue("header offset overflows"))?;
    debug!("writing GPT header at lba {}", header.current_lba);
    disk::write_at(device, span, offset, &header.to_block(span.block_size))
}

fn read_error(e: crate::Error) -> HeaderError {
    match e {
        crate::Error::Io(e) => HeaderError::Io(e),
        _ => HeaderError::OutOfBounds,
    }
}

const CRC_32: Crc<u32> = Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

pub(crate) fn calculate_crc32(b: &[u8]) -> u32 {
    let mut digest = CRC_32.digest();
    digest.update(b);
    digest.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::disk::LogicalBlockSize;

    use std::io::Cursor;

    fn test_header() -> Header {
        let mut h = HeaderBuilder::new()
            .disk_guid("1B6A2BFA-E92B-184C-A8A7-ED0610D54821".parse().unwrap())
            .backup_lba(71)
            .build(LogicalBlockSize::Lb512)
            .unwrap();
        h.seal(calculate_crc32(&[0u8; 128 * 128]));
        h
    }

    #[test]
    fn sealed_header_parses_back() {
        let h = test_header();
        let block = h.to_block(LogicalBlockSize::Lb512);
        assert_eq!(block.len(), 512);
        assert_eq!(&block[..8], HEADER_SIGNATURE);
        assert!(block[92..].iter().all(|b| *b == 0));

        let parsed = Header::from_block(&block, 1).unwrap();
        assert_eq!(parsed, h);
    }

    #[test]
    fn any_flipped_byte_breaks_the_checksum() {
        let block = test_header().to_block(LogicalBlockSize::Lb512);
        for i in (8..92).filter(|i| !(16..20).contains(i)) {
            let mut bad = block.clone();
            bad[i] ^= 0x01;
            assert!(Header::from_block(&bad, 1).is_err(), "byte {i}");
        }

        // outside header_size nothing is covered
        let mut padded = block.clone();
        padded[200] = 0xff;
        assert!(Header::from_block(&padded, 1).is_ok());
    }

    #[test]
    fn rejects_wrong_location_signature_and_size() {
        let h = test_header();
        let block = h.to_block(LogicalBlockSize::Lb512);
        assert!(matches!(
            Header::from_block(&block, 2),
            Err(HeaderError::WrongCurrentLba)
        ));

        let mut bad = block.clone();
        bad[0] = b'X';
        assert!(matches!(
            Header::from_block(&bad, 1),
            Err(HeaderError::InvalidGptSignature)
        ));

        for size in [91u32, 513] {
            let mut h = h.clone();
            h.header_size = size;
            let mut block = h.to_block(LogicalBlockSize::Lb512);
            block.truncate(512);
            block[12..16].copy_from_slice(&size.to_le_bytes());
            assert!(matches!(
                Header::from_block(&block, 1),
                Err(HeaderError::InvalidHeaderSize)
            ));
        }
    }

    #[test]
    fn larger_header_size_is_covered_by_crc() {
        let mut h = test_header();
        h.header_size = 100;
        h.seal(h.crc32_parts);
        let block = h.to_block(LogicalBlockSize::Lb512);
        assert_eq!(Header::from_block(&block, 1).unwrap().header_size, 100);

        let mut bad = block;
        bad[95] = 1;
        assert!(matches!(
            Header::from_block(&bad, 1),
            Err(HeaderError::InvalidCRC32Checksum)
        ));
    }

    #[test]
    fn entry_array_shape() {
        let mut h = test_header();
        assert_eq!(h.entry_array_len().unwrap(), 128 * 128);
        assert_eq!(h.entry_array_blocks(LogicalBlockSize::Lb512).unwrap(), 32);
        assert_eq!(h.entry_array_blocks(LogicalBlockSize::Lb4096).unwrap(), 4);

        h.part_size = 64;
        assert!(h.entry_array_len().is_err());
        h.part_size = 132;
        assert!(h.entry_array_len().is_err());
        h.part_size = 256;
        h.num_parts = 16385;
        assert!(h.entry_array_len().is_err());
        h.num_parts = 16384;
        assert!(h.entry_array_len().is_ok());
    }

    #[test]
    fn read_write_on_device() {
        let lb = LogicalBlockSize::Lb512;
        let span = Span::new(0, 72 * 512, lb);
        let mut dev = Cursor::new(vec![0u8; 72 * 512]);

        let h = test_header();
        write_header(&mut dev, &span, &h).unwrap();
        assert_eq!(read_header(&mut dev, &span, 1).unwrap(), h);
        assert_eq!(read_entries(&mut dev, &span, &h).unwrap().len(), 128 * 128);

        dev.get_mut()[2 * 512 + 5] = 1;
        assert!(matches!(
            read_entries(&mut dev, &span, &h),
            Err(crate::Error::Header(HeaderError::InvalidEntriesCRC32Checksum))
        ));
        assert!(matches!(
            read_header(&mut dev, &span, 72),
            Err(HeaderError::OutOfBounds)
        ));
    }
}
