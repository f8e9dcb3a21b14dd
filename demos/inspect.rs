use ptable::disk::{LogicalBlockSize, Span};
use ptable::{PartitionTable, TableConfig};

use std::error::Error;
use std::fs;

fn main() {
    // Inspect disk image, handling errors.
    if let Err(e) = run() {
        eprintln!("Failed to inspect image: {}", e);
        std::process::exit(1)
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    // First parameter is the target disk image, second the block size
    let input = std::env::args().nth(1).ok_or("usage: inspect <image> [4096]")?;
    let block_size = match std::env::args().nth(2).as_deref() {
        Some("4096") => LogicalBlockSize::Lb4096,
        _ => LogicalBlockSize::Lb512,
    };

    let mut file = fs::File::open(input)?;
    let span = Span::whole_device(&mut file, block_size)?;
    let table = TableConfig::new().open_from_device(file, span)?;

    println!(
        "{} (confidence {:.2})",
        table.pretty_name(),
        table.confidence()
    );
    if let PartitionTable::Gpt(gpt) = &table {
        println!("Disk (primary) header: {:#?}", gpt.primary_header());
    }
    for part in table.partitions() {
        println!("{}", part);
    }

    Ok(())
}
