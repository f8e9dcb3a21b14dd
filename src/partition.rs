//! Host-facing partition descriptors.

use std::fmt;

use crate::entry::Attributes;
use crate::partition_types::TypeId;

/// Identifies a partition inside the table that reported it.
///
/// Ids stay valid until the table is scanned again; deleting a partition
/// never renumbers its siblings.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum PartitionId {
    /// Index into the GPT entry array.
    Gpt(u32),
    /// One of the four MBR primary slots.
    Primary(usize),
    /// A logical partition inside the extended partition at slot `primary`.
    Logical {
        /// Slot of the owning extended partition.
        primary: usize,
        /// Stable index of the logical partition within its chain.
        index: usize,
    },
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionId::Gpt(i) => write!(f, "gpt#{i}"),
            PartitionId::Primary(i) => write!(f, "primary#{i}"),
            PartitionId::Logical { primary, index } => write!(f, "logical#{primary}.{index}"),
        }
    }
}

/// What kind of partition a descriptor stands for.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Role {
    /// A GPT entry.
    Gpt,
    /// An MBR primary partition.
    Primary,
    /// An MBR primary partition holding logical partitions.
    Extended,
    /// A partition inside the extended partition.
    Logical,
}

/// A partition as reported to the host.
///
/// `offset` is an absolute byte offset on the device, the span offset
/// included.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Partition {
    /// Id used to address the partition in mutating calls.
    pub id: PartitionId,
    /// Absolute byte offset.
    pub offset: u64,
    /// Size in bytes.
    pub size: u64,
    /// Logical block size in bytes.
    pub block_size: u64,
    /// On-disk type identifier.
    pub type_id: TypeId,
    /// Display name of the type.
    pub type_name: String,
    /// Partition name, empty for MBR.
    pub name: String,
    /// Unique partition GUID (GPT only).
    pub unique_guid: Option<uuid::Uuid>,
    /// Boot indicator (MBR only).
    pub active: bool,
    /// Attribute bits (GPT only).
    pub attributes: Attributes,
    /// Kind of partition.
    pub role: Role,
}

impl Partition {
    /// One past the last byte.
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.size)
    }

    /// Parameter string in the format MBR hosts expect:
    /// `type = <code> ; active = <0|1>`.
    pub fn parameters(&self) -> Option<String> {
        match self.type_id {
            TypeId::Mbr(code) => Some(format!(
                "type = {} ; active = {}",
                code,
                u8::from(self.active)
            )),
            TypeId::Gpt(_) => None,
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:\t{} - {}\t{} bytes\t{}",
            self.id,
            self.offset,
            self.end(),
            self.size,
            self.type_name
        )?;
        if !self.name.is_empty() {
            write!(f, "\t\"{}\"", self.name)?;
        }
        if self.active {
            write!(f, "\t(active)")?;
        }
        Ok(())
    }
}
