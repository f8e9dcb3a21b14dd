use ptable::disk::{self, LogicalBlockSize, Span};
use ptable::partition::PartitionId;
use ptable::partition_types::{self, TypeId};
use ptable::{Error, PartitionTable, TableConfig};

use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use tempfile::NamedTempFile;

fn span_of(len: usize, lb: LogicalBlockSize) -> Span {
    Span::new(0, len as u64, lb)
}

fn gpt_of<D>(table: PartitionTable<D>) -> ptable::gpt::GptTable<D> {
    match table {
        PartitionTable::Gpt(t) => t,
        PartitionTable::Mbr(_) => panic!("expected a GPT"),
    }
}

#[test]
fn test_tableconfig_empty() {
    let mut tempdisk = NamedTempFile::new().expect("failed to create tempfile disk");
    tempdisk.write_all(&[0; 1024 * 64]).unwrap();
    let cfg = {
        let c1 = TableConfig::new();
        let c2 = TableConfig::default();
        assert_eq!(c1, c2);
        c1
    };

    let lb_size = LogicalBlockSize::Lb4096;
    let span = span_of(1024 * 64, lb_size);
    let file = tempdisk.reopen().unwrap();
    cfg.clone()
        .writable(true)
        .initialize_gpt(file, span)
        .unwrap();

    let disk = gpt_of(cfg.open(tempdisk.path(), span).unwrap());
    assert_eq!(disk.span().block_size, lb_size);
    assert!(disk.primary_header().is_ok());
    assert!(disk.backup_header().is_ok());
    assert_eq!(disk.primary_header().unwrap().first_usable, 6);
    assert!(disk.partitions().is_empty());
}

#[test]
fn test_create_simple_on_device() {
    const TOTAL_BYTES: usize = 1024 * 66;
    let mem_device = Cursor::new(vec![0_u8; TOTAL_BYTES]);
    let span = span_of(TOTAL_BYTES, LogicalBlockSize::Lb512);

    let mut table = TableConfig::default()
        .writable(true)
        .initialize_gpt(mem_device, span)
        .unwrap();

    let t1 = table
        .create_child(None, 0, 1024 * 12, "Microsoft basic data", "test1")
        .unwrap();
    let t2 = table
        .create_child(None, 0, 1024 * 18, "LINUX_FS", "test2")
        .unwrap();
    assert_eq!(t1, PartitionId::Gpt(0));
    assert_eq!(t2, PartitionId::Gpt(1));

    let parts = table.partitions();
    assert_eq!(parts[0].offset, 34 * 512);
    assert_eq!(parts[1].offset, (34 + 24) * 512);
    assert_eq!(parts[1].name, "test2");

    let mut mem_device = table.take_device();
    mem_device.seek(SeekFrom::Start(0)).unwrap();
    let mut final_bytes = vec![0_u8; TOTAL_BYTES];
    mem_device.read_exact(&mut final_bytes).unwrap();
    assert_eq!(&final_bytes[512..520], b"EFI PART");
}

fn t_read_bytes<D: ptable::DiskDevice>(device: &mut D, offset: u64, bytes: usize) -> Vec<u8> {
    let mut buf = vec![0_u8; bytes];
    device.seek(SeekFrom::Start(offset)).unwrap();
    device.read_exact(&mut buf).unwrap();
    buf
}

/// A written disk with three partitions.
fn valid_disk() -> Cursor<Vec<u8>> {
    const TOTAL_BYTES: usize = 1024 * 70;
    let span = span_of(TOTAL_BYTES, LogicalBlockSize::Lb512);
    let mut disk = TableConfig::new()
        .writable(true)
        .initialize_gpt(Cursor::new(vec![0; TOTAL_BYTES]), span)
        .unwrap();

    disk.create_child(None, 0, 1024 * 12, "BASIC", "test1")
        .unwrap();
    disk.create_child(None, 0, 1024 * 18, "LINUX_FS", "test2")
        .unwrap();
    disk.create_child(None, 94 * 512, 2 * 512, "BASIC", "test3")
        .unwrap();
    disk.take_device()
}

#[test]
fn test_only_valid_headers() {
    let valid_disk = valid_disk();
    let span = span_of(valid_disk.get_ref().len(), LogicalBlockSize::Lb512);

    // wipe the protective MBR, the primary header and the primary entries
    // so only the backup is left
    let mut corrupt_disk = valid_disk.clone();
    corrupt_disk.get_mut()[..512 * 34]
        .iter_mut()
        .for_each(|v| *v = 0);

    let first_try = TableConfig::new()
        .only_valid_headers(true)
        .open_from_device(corrupt_disk.clone(), span);
    assert!(first_try.is_err());

    let mut second_try = gpt_of(
        TableConfig::new()
            .writable(true)
            .open_from_device(corrupt_disk, span)
            .unwrap(),
    );
    assert!(second_try.is_dirty());
    assert!(second_try.primary_header().is_err());
    assert_eq!(second_try.confidence(), ptable::gpt::DIRTY_CONFIDENCE);
    assert_eq!(second_try.partitions()[0].name, "test1");

    // regenerates the primary copy from the backup
    second_try.write().unwrap();
    assert!(!second_try.is_dirty());
    assert_eq!(
        &valid_disk.get_ref()[512..],
        &second_try.device_ref().get_ref()[512..]
    );
}

#[test]
fn test_backup_survives_entry_updates() {
    let valid_disk = valid_disk();
    let span = span_of(valid_disk.get_ref().len(), LogicalBlockSize::Lb512);
    let mut disk = gpt_of(
        TableConfig::new()
            .writable(true)
            .open_from_device(valid_disk, span)
            .unwrap(),
    );
    disk.set_name(PartitionId::Gpt(1), "renamed").unwrap();

    // damage the primary header, the backup must carry the change too
    let mut bytes = disk.take_device();
    bytes.get_mut()[512 + 24] ^= 0xff;
    bytes.get_mut()[..512].fill(0);
    let disk = gpt_of(ptable::scan(bytes, span).unwrap());
    assert!(disk.is_dirty());
    assert_eq!(disk.partitions()[1].name, "renamed");
}

#[test]
fn test_scenario_scan_single_entry() {
    // one Haiku partition spanning blocks 2048..=206847
    let file = tempfile::tempfile().unwrap();
    let blocks: u64 = 206_848 + 2048;
    file.set_len(blocks * 512).unwrap();
    let span = Span::new(0, blocks * 512, LogicalBlockSize::Lb512);

    let mut table = TableConfig::new()
        .writable(true)
        .initialize_gpt(file, span)
        .unwrap();
    let size = (206_847 - 2048 + 1) * 512;
    table
        .create_child(None, 2048 * 512, size, "Haiku", "")
        .unwrap();

    let table = gpt_of(ptable::scan(table.take_device(), span).unwrap());
    let header = table.primary_header().unwrap();
    assert_eq!(header.current_lba, 1);
    assert_eq!(header.num_parts, 128);
    assert_eq!(header.part_size, 128);
    assert_eq!(table.entries()[0].first_lba, 2048);
    assert_eq!(table.entries()[0].last_lba, 206_847);

    let parts = table.partitions();
    assert_eq!(parts.len(), 1);
    assert_eq!(parts[0].offset, 2048 * 512);
    assert_eq!(parts[0].size, size);
    assert_eq!(parts[0].type_name, "Haiku");
}

#[test]
fn test_scenario_set_type_by_name() {
    let disk = valid_disk();
    let span = span_of(disk.get_ref().len(), LogicalBlockSize::Lb512);
    let mut table = TableConfig::new()
        .writable(true)
        .open_from_device(disk, span)
        .unwrap();
    table
        .set_type(PartitionId::Gpt(2), "EFI system data")
        .unwrap();

    let mut disk = table.take_device();
    // mixed endian C12A7328-F81F-11D2-BA4B-00A0C93EC93B in entry 2
    let raw = t_read_bytes(&mut disk, 2 * 512 + 2 * 128, 16);
    assert_eq!(
        raw,
        vec![
            0x28, 0x73, 0x2a, 0xc1, 0x1f, 0xf8, 0xd2, 0x11, 0xba, 0x4b, 0x00, 0xa0, 0xc9, 0x3e,
            0xc9, 0x3b
        ]
    );

    let table = ptable::scan(disk, span).unwrap();
    let part = &table.partitions()[2];
    assert_eq!(part.type_name, "EFI system data");
    assert_eq!(part.type_id, TypeId::Gpt(partition_types::EFI.guid));
}

#[test]
fn test_read_only_by_default() {
    let disk = valid_disk();
    let span = span_of(disk.get_ref().len(), LogicalBlockSize::Lb512);
    let mut table = ptable::scan(disk, span).unwrap();
    assert!(matches!(
        table.delete_child(PartitionId::Gpt(0)),
        Err(Error::ReadOnly)
    ));
    assert!(matches!(
        TableConfig::new().initialize_gpt(Cursor::new(vec![0u8; 1 << 16]), span),
        Err(Error::ReadOnly)
    ));
    assert!(table
        .create_child(Some(PartitionId::Gpt(0)), 0, 512, "BASIC", "")
        .is_err());
}

fn test_helper_write_efi_unused_partition_entries(lb_size: disk::LogicalBlockSize) {
    // Unused entries of a freshly initialized table are written as zeros
    // so the array is UEFI compliant (128 entries).

    let lb_bytes: u64 = lb_size.into();
    let lb_bytes_usize = lb_bytes as usize;
    // protective MBR + GPT header + GPT partition array
    let header_lbs = 1 + 1 + ((128 * 128) / lb_bytes);
    assert_eq!((128 * 128) % lb_bytes, 0);
    let data_lbs = 10;
    // GPT partition array + GPT header
    let footer_lbs = ((128 * 128) / lb_bytes) + 1;
    let total_lbs = header_lbs + data_lbs + footer_lbs;
    let total_bytes = (total_lbs * lb_bytes) as usize;

    // Initialize the buffer with all '255' values so we can tell what's been overwritten vs preserved.
    let mem_device = Cursor::new(vec![255u8; total_bytes]);
    let span = span_of(total_bytes, lb_size);

    let mut table = TableConfig::default()
        .writable(true)
        .initialize_gpt(mem_device, span)
        .unwrap();

    let part1_bytes = 3 * lb_bytes;
    table
        .create_child(None, 0, part1_bytes, "BASIC", "test1")
        .unwrap();
    table
        .create_child(
            None,
            0,
            (data_lbs * lb_bytes) - part1_bytes,
            "LINUX_FS",
            "test2",
        )
        .unwrap();

    let mut mem_device = table.take_device();
    // protective MBR, rest of the block zeroed
    let mbr = t_read_bytes(&mut mem_device, 0, lb_bytes_usize);
    assert_eq!(mbr[450], 0xee);
    assert_eq!(&mbr[510..512], &[0x55, 0xaa]);
    assert!(mbr[512..].iter().all(|b| *b == 0));
    // Should have overwritten the header
    assert_ne!(t_read_bytes(&mut mem_device, lb_bytes, 92), vec![255u8; 92]);
    // The rest of the sector containing the header should be zeros.
    assert_eq!(
        t_read_bytes(&mut mem_device, lb_bytes + 92, lb_bytes_usize - 92),
        vec![0_u8; lb_bytes_usize - 92]
    );
    // The first two partition entries should have been overwritten with non-zero data.
    let first_two = t_read_bytes(&mut mem_device, 2 * lb_bytes, 128 * 2);
    assert_ne!(first_two, vec![255u8; 128 * 2]);
    assert_ne!(first_two, vec![0_u8; 128 * 2]);
    // The remaining entries should have been overwritten with all zeros.
    assert_eq!(
        t_read_bytes(&mut mem_device, (2 * lb_bytes) + (128 * 2), 126 * 128),
        vec![0_u8; 126 * 128]
    );

    // The data area should be completely undisturbed...
    let data_bytes = (data_lbs as usize) * lb_bytes_usize;
    assert_eq!(
        t_read_bytes(&mut mem_device, header_lbs * lb_bytes, data_bytes),
        vec![255u8; data_bytes]
    );

    // Same for the entry array in front of the backup header.
    let footer = (header_lbs + data_lbs) * lb_bytes;
    let first_two = t_read_bytes(&mut mem_device, footer, 128 * 2);
    assert_ne!(first_two, vec![255u8; 128 * 2]);
    assert_ne!(first_two, vec![0_u8; 128 * 2]);
    assert_eq!(
        t_read_bytes(&mut mem_device, footer + (128 * 2), 126 * 128),
        vec![0_u8; 126 * 128]
    );

    // Should have overwritten the backup header
    assert_ne!(
        t_read_bytes(&mut mem_device, total_bytes as u64 - lb_bytes, 92),
        vec![255u8; 92]
    );
    // Remainder of the sector with the backup header should be all zeros
    assert_eq!(
        t_read_bytes(
            &mut mem_device,
            total_bytes as u64 - lb_bytes + 92,
            lb_bytes_usize - 92
        ),
        vec![0_u8; lb_bytes_usize - 92]
    );
}

#[test]
fn test_write_efi_unused_partition_entries_512() {
    test_helper_write_efi_unused_partition_entries(disk::LogicalBlockSize::Lb512);
}

#[test]
fn test_write_efi_unused_partition_entries_4096() {
    test_helper_write_efi_unused_partition_entries(disk::LogicalBlockSize::Lb4096);
}
