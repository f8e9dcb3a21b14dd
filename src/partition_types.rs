//! Partition type registry.
//!
//! Two static tables: GPT type GUIDs and MBR type bytes, each mapped to a
//! display name. Both directions are pure lookups over compile-time data.

use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

/// The operating system a GPT partition type belongs to.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum OperatingSystem {
    /// No specific operating system.
    None,
    /// Haiku and BeOS.
    Haiku,
    /// Linux.
    Linux,
    /// Microsoft Windows.
    Windows,
    /// FreeBSD.
    FreeBsd,
    /// NetBSD.
    NetBsd,
    /// OpenBSD.
    OpenBsd,
    /// Apple macOS.
    MacOs,
    /// Solaris and illumos.
    Solaris,
    /// ChromeOS.
    ChromeOs,
}

/// A GPT partition type.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct Type {
    /// Type GUID as stored in the partition entry.
    pub guid: Uuid,
    /// Operating system the type belongs to.
    pub os: OperatingSystem,
    /// Display name, empty for GUIDs the registry does not know.
    pub name: &'static str,
}

impl Type {
    /// Whether this is the nil GUID marking an unused entry.
    pub fn is_unused(&self) -> bool {
        self.guid.is_nil()
    }

    /// Whether the registry knows this GUID.
    pub fn is_known(&self) -> bool {
        !self.name.is_empty()
    }

    /// The display name, or the upper-case GUID for unknown types.
    pub fn display_name(&self) -> String {
        if self.is_known() {
            self.name.to_string()
        } else {
            guid_string(&self.guid)
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

pub(crate) fn guid_string(guid: &Uuid) -> String {
    guid.as_hyphenated().to_string().to_uppercase()
}

partition_types! {
    /// Unused entry
    (UNUSED, "00000000-0000-0000-0000-000000000000", OperatingSystem::None, "Unused"),
    /// MBR partition scheme
    (MBR, "024DEE41-33E7-11D3-9D69-0008C781F39F", OperatingSystem::None, "MBR partition scheme"),
    /// EFI system partition
    (EFI, "C12A7328-F81F-11D2-BA4B-00A0C93EC93B", OperatingSystem::None, "EFI system data"),
    /// BIOS boot partition
    (BIOS, "21686148-6449-6E6F-744E-656564454649", OperatingSystem::None, "BIOS boot"),
    /// Haiku BFS
    (HAIKU_BFS, "42465331-3BA3-10F1-802A-4861696B7521", OperatingSystem::Haiku, "Haiku"),
    /// Microsoft reserved partition
    (MICROSOFT_RESERVED, "E3C9E316-0B5C-4DB8-817D-F92DF00215AE", OperatingSystem::Windows, "Microsoft reserved"),
    /// Basic data partition
    (BASIC, "EBD0A0A2-B9E5-4433-87C0-68B6B72699C7", OperatingSystem::Windows, "Microsoft basic data"),
    /// Logical disk manager metadata
    (WINDOWS_LDM_METADATA, "5808C8AA-7E8F-42E0-85D2-E1E90434CFB3", OperatingSystem::Windows, "Windows LDM metadata"),
    /// Logical disk manager data
    (WINDOWS_LDM_DATA, "AF9B60A0-1431-4F62-BC68-3311714A69AD", OperatingSystem::Windows, "Windows LDM data"),
    /// Windows recovery environment
    (WINDOWS_RECOVERY, "DE94BBA4-06D1-4D40-A16A-BFD50179D6AC", OperatingSystem::Windows, "Windows recovery"),
    /// Linux filesystem data
    (LINUX_FS, "0FC63DAF-8483-4772-8E79-3D69D8477DE4", OperatingSystem::Linux, "Linux data"),
    /// Linux RAID
    (LINUX_RAID, "A19D880F-05FC-4D3B-A006-743F0F84911E", OperatingSystem::Linux, "Linux RAID"),
    /// Linux root (x86)
    (LINUX_ROOT_X86, "44479540-F297-41B2-9AF7-D131D5F0458A", OperatingSystem::Linux, "Linux root (x86)"),
    /// Linux root (x86-64)
    (LINUX_ROOT_X64, "4F68BCE3-E8CD-4DB1-96E7-FBCAF984B709", OperatingSystem::Linux, "Linux root (x86-64)"),
    /// Linux root (32-bit ARM)
    (LINUX_ROOT_ARM_32, "69DAD710-2CE4-4E3C-B16C-21A1D49ABED3", OperatingSystem::Linux, "Linux root (ARM)"),
    /// Linux root (64-bit ARM)
    (LINUX_ROOT_ARM_64, "B921B045-1DF0-41C3-AF44-4C6F280D3FAE", OperatingSystem::Linux, "Linux root (AArch64)"),
    /// Linux swap
    (LINUX_SWAP, "0657FD6D-A4AB-43C4-84E5-0933C84B4F4F", OperatingSystem::Linux, "Linux swap"),
    /// Linux logical volume manager
    (LINUX_LVM, "E6D6D379-F507-44C2-A23C-238F2A3DF928", OperatingSystem::Linux, "Linux LVM"),
    /// Linux /home
    (LINUX_HOME, "933AC7E1-2EB4-4F13-B844-0E14E2AEF915", OperatingSystem::Linux, "Linux home"),
    /// Linux LUKS
    (LINUX_LUKS, "CA7D7CCB-63ED-4C53-861C-1742536059CC", OperatingSystem::Linux, "Linux LUKS"),
    /// FreeBSD boot
    (FREEBSD_BOOT, "83BD6B9D-7F41-11DC-BE0B-001560B84F0F", OperatingSystem::FreeBsd, "FreeBSD boot"),
    /// FreeBSD data
    (FREEBSD_DATA, "516E7CB4-6ECF-11D6-8FF8-00022D09712B", OperatingSystem::FreeBsd, "FreeBSD data"),
    /// FreeBSD swap
    (FREEBSD_SWAP, "516E7CB5-6ECF-11D6-8FF8-00022D09712B", OperatingSystem::FreeBsd, "FreeBSD swap"),
    /// FreeBSD UFS
    (FREEBSD_UFS, "516E7CB6-6ECF-11D6-8FF8-00022D09712B", OperatingSystem::FreeBsd, "FreeBSD UFS"),
    /// FreeBSD ZFS
    (FREEBSD_ZFS, "516E7CBA-6ECF-11D6-8FF8-00022D09712B", OperatingSystem::FreeBsd, "FreeBSD ZFS"),
    /// NetBSD FFS
    (NETBSD_FFS, "49F48D5A-B10E-11DC-B99B-0019D1879648", OperatingSystem::NetBsd, "NetBSD FFS"),
    /// OpenBSD data
    (OPENBSD_DATA, "824CC7A0-36A8-11E3-890A-952519AD3F61", OperatingSystem::OpenBsd, "OpenBSD data"),
    /// Apple HFS+
    (MACOS_HFSPLUS, "48465300-0000-11AA-AA11-00306543ECAC", OperatingSystem::MacOs, "Apple HFS+"),
    /// Apple APFS
    (MACOS_APFS, "7C3457EF-0000-11AA-AA11-00306543ECAC", OperatingSystem::MacOs, "Apple APFS"),
    /// Apple boot (Recovery HD)
    (MACOS_BOOT, "426F6F74-0000-11AA-AA11-00306543ECAC", OperatingSystem::MacOs, "Apple boot"),
    /// Solaris boot
    (SOLARIS_BOOT, "6A82CB45-1DD2-11B2-99A6-080020736631", OperatingSystem::Solaris, "Solaris boot"),
    /// Solaris root
    (SOLARIS_ROOT, "6A85CF4D-1DD2-11B2-99A6-080020736631", OperatingSystem::Solaris, "Solaris root"),
    /// ChromeOS kernel
    (CHROMEOS_KERNEL, "FE3A2A5D-4F32-41A7-B725-ACCC3285A309", OperatingSystem::ChromeOs, "ChromeOS kernel"),
    /// ChromeOS root filesystem
    (CHROMEOS_ROOTFS, "3CB8E202-3B7E-47DD-8A3C-7FF2A13CFCEC", OperatingSystem::ChromeOs, "ChromeOS rootfs"),
}

/// An MBR partition type byte.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct MbrType {
    /// Type byte as stored in the descriptor.
    pub code: u8,
    /// Display name, empty for codes the registry does not know.
    pub name: &'static str,
}

/// Every MBR partition type known to the registry, sorted by code.
pub const MBR_TYPES: &[MbrType] = &[
    MbrType { code: 0x01, name: "FAT 12" },
    MbrType { code: 0x04, name: "FAT 16 (< 32 MB)" },
    MbrType { code: 0x05, name: "Extended partition" },
    MbrType { code: 0x06, name: "FAT 16" },
    MbrType { code: 0x07, name: "NTFS / exFAT" },
    MbrType { code: 0x0b, name: "FAT 32" },
    MbrType { code: 0x0c, name: "FAT 32 (LBA)" },
    MbrType { code: 0x0e, name: "FAT 16 (LBA)" },
    MbrType { code: 0x0f, name: "Extended partition (LBA)" },
    MbrType { code: 0x11, name: "Hidden FAT 12" },
    MbrType { code: 0x12, name: "Compaq diagnostics" },
    MbrType { code: 0x14, name: "Hidden FAT 16 (< 32 MB)" },
    MbrType { code: 0x16, name: "Hidden FAT 16" },
    MbrType { code: 0x17, name: "Hidden NTFS" },
    MbrType { code: 0x1b, name: "Hidden FAT 32" },
    MbrType { code: 0x1c, name: "Hidden FAT 32 (LBA)" },
    MbrType { code: 0x27, name: "Windows recovery" },
    MbrType { code: 0x42, name: "Windows dynamic disk" },
    MbrType { code: 0x63, name: "GNU HURD / SysV" },
    MbrType { code: 0x82, name: "Linux swap" },
    MbrType { code: 0x83, name: "Linux native" },
    MbrType { code: 0x85, name: "Linux extended" },
    MbrType { code: 0x8e, name: "Linux LVM" },
    MbrType { code: 0xa5, name: "FreeBSD" },
    MbrType { code: 0xa6, name: "OpenBSD" },
    MbrType { code: 0xa8, name: "Apple UFS" },
    MbrType { code: 0xa9, name: "NetBSD" },
    MbrType { code: 0xab, name: "Apple boot" },
    MbrType { code: 0xaf, name: "Apple HFS" },
    MbrType { code: 0xbe, name: "Solaris boot" },
    MbrType { code: 0xbf, name: "Solaris" },
    MbrType { code: 0xeb, name: "BeOS / Haiku BFS" },
    MbrType { code: 0xee, name: "GPT protective" },
    MbrType { code: 0xef, name: "EFI system" },
    MbrType { code: 0xfb, name: "VMware VMFS" },
    MbrType { code: 0xfd, name: "Linux RAID" },
];

/// Type byte of an unused descriptor.
pub const MBR_EMPTY: u8 = 0x00;
/// Type byte of the protective partition written in front of a GPT.
pub const MBR_GPT_PROTECTIVE: u8 = 0xee;

impl MbrType {
    /// Looks up a type byte; unknown codes get an empty name.
    pub fn from_code(code: u8) -> Self {
        MBR_TYPES
            .binary_search_by_key(&code, |t| t.code)
            .map(|i| MBR_TYPES[i])
            .unwrap_or(MbrType { code, name: "" })
    }

    /// Whether the code marks an unused descriptor.
    pub fn is_empty(&self) -> bool {
        self.code == MBR_EMPTY
    }

    /// Whether the code denotes an extended partition (`0x05`, `0x0f`, `0x85`).
    pub fn is_extended(&self) -> bool {
        is_extended(self.code)
    }

    /// Whether the registry knows this code.
    pub fn is_known(&self) -> bool {
        !self.name.is_empty()
    }

    /// The display name, or `Unrecognized type 0xNN` for unknown codes.
    pub fn display_name(&self) -> String {
        if self.is_known() {
            self.name.to_string()
        } else {
            format!("Unrecognized type 0x{:02x}", self.code)
        }
    }
}

/// Whether an MBR type byte denotes an extended partition.
pub fn is_extended(code: u8) -> bool {
    matches!(code, 0x05 | 0x0f | 0x85)
}

impl fmt::Display for MbrType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

impl FromStr for MbrType {
    type Err = String;

    /// Accepts a display name (case-insensitive) or a hex code such as
    /// `0x83`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(t) = MBR_TYPES.iter().find(|t| t.name.eq_ignore_ascii_case(s)) {
            return Ok(*t);
        }
        let hex = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .ok_or_else(|| format!("unknown partition type {s:?}"))?;
        u8::from_str_radix(hex, 16)
            .map(MbrType::from_code)
            .map_err(|_| format!("unknown partition type {s:?}"))
    }
}

/// An on-disk type identifier of either format.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum TypeId {
    /// MBR type byte.
    Mbr(u8),
    /// GPT type GUID.
    Gpt(Uuid),
}

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeId::Mbr(code) => write!(f, "0x{code:02x}"),
            TypeId::Gpt(guid) => write!(f, "{}", guid_string(guid)),
        }
    }
}

/// Known GPT types as `(id, display name)`, skipping the unused marker.
pub fn supported_gpt_types() -> impl Iterator<Item = (TypeId, &'static str)> {
    GPT_TYPES
        .iter()
        .filter(|t| !t.is_unused())
        .map(|t| (TypeId::Gpt(t.guid), t.name))
}

/// Known MBR types as `(id, display name)`.
pub fn supported_mbr_types() -> impl Iterator<Item = (TypeId, &'static str)> {
    MBR_TYPES.iter().map(|t| (TypeId::Mbr(t.code), t.name))
}
