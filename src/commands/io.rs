//! Read, write and erase commands

use fwflash_mtd::MtdHandle;
use indicatif::{ProgressBar, ProgressStyle};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::time::Duration;

/// Chunk size for reads and verification (64 KiB)
const IO_CHUNK_SIZE: u64 = 0x10000;

/// Create a standard progress bar style
fn create_progress_bar_style() -> Result<ProgressStyle, Box<dyn std::error::Error>> {
    Ok(ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta}) {msg}")?
        .progress_chars("#>-"))
}

/// Create a spinner style
fn create_spinner_style() -> Result<ProgressStyle, Box<dyn std::error::Error>> {
    Ok(ProgressStyle::default_spinner().template("{spinner:.green} {msg}")?)
}

fn progress_bar(
    total: u64,
    phase: &'static str,
) -> Result<ProgressBar, Box<dyn std::error::Error>> {
    let pb = ProgressBar::new(total);
    pb.set_style(create_progress_bar_style()?);
    pb.set_message(phase);
    Ok(pb)
}

/// Resolve an optional length to "until the end of the device"
///
/// Ranges that do not fit in a device of `size` bytes are rejected.
fn resolve_range(
    name: &str,
    size: u64,
    offset: u64,
    length: Option<u64>,
) -> Result<u64, Box<dyn std::error::Error>> {
    if offset > size {
        return Err(format!(
            "Offset 0x{:x} is past the end of {} (0x{:x})",
            offset, name, size
        )
        .into());
    }
    let len = length.unwrap_or(size - offset);
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(len),
        _ => Err(format!(
            "0x{:x} bytes at 0x{:x} run past the end of {} (0x{:x})",
            len, offset, name, size
        )
        .into()),
    }
}

/// Read `len` bytes at `offset` in chunks, advancing `pb`
fn read_range(
    mtd: &MtdHandle,
    offset: u64,
    len: u64,
    pb: &ProgressBar,
) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    let mut data = vec![0u8; len as usize];
    for (i, chunk) in data.chunks_mut(IO_CHUNK_SIZE as usize).enumerate() {
        let chunk_offset = offset + i as u64 * IO_CHUNK_SIZE;
        mtd.read(chunk_offset, chunk)?;
        pb.inc(chunk.len() as u64);
    }
    Ok(data)
}

/// Run the read command
pub fn run_read(
    mtd: &MtdHandle,
    output: &Path,
    offset: u64,
    length: Option<u64>,
) -> Result<(), Box<dyn std::error::Error>> {
    let len = resolve_range(mtd.name(), mtd.size(), offset, length)?;
    println!(
        "Reading {} bytes from {} at 0x{:08X}",
        len,
        mtd.name(),
        offset
    );

    let pb = progress_bar(len, "reading")?;
    let data = read_range(mtd, offset, len, &pb)?;
    pb.finish_with_message("Read complete");

    let mut file = File::create(output)?;
    file.write_all(&data)?;
    println!("Wrote {} bytes to {:?}", data.len(), output);
    Ok(())
}

/// Run the write command
///
/// Touched erase blocks are read, merged with the new data, erased and
/// programmed again, so bytes outside the written range are preserved.
/// Blocks whose content does not change are skipped.
pub fn run_write(
    mtd: &MtdHandle,
    input: &Path,
    offset: u64,
    verify: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut new_data = Vec::new();
    File::open(input)?.read_to_end(&mut new_data)?;
    println!("Read {} bytes from {:?}", new_data.len(), input);
    if new_data.is_empty() {
        println!("Nothing to write");
        return Ok(());
    }

    let info = mtd.info();
    let end = offset
        .checked_add(new_data.len() as u64)
        .filter(|&end| end <= info.size)
        .ok_or_else(|| {
            format!(
                "{} bytes at 0x{:x} do not fit in {} (0x{:x} bytes)",
                new_data.len(),
                offset,
                info.name,
                info.size
            )
        })?;

    let block = u64::from(info.erase_size);
    let span_start = offset / block * block;
    let span_end = end.div_ceil(block) * block;
    if span_end > info.size {
        return Err(format!("Last erase block of {} is incomplete", info.name).into());
    }

    let pb = progress_bar(span_end - span_start, "reading")?;
    let old = read_range(mtd, span_start, span_end - span_start, &pb)?;
    pb.finish_and_clear();

    let mut merged = old.clone();
    let rel = (offset - span_start) as usize;
    merged[rel..rel + new_data.len()].copy_from_slice(&new_data);

    let pb = progress_bar(span_end - span_start, "writing")?;
    let mut blocks_changed = 0usize;
    for (i, (want, have)) in merged
        .chunks(block as usize)
        .zip(old.chunks(block as usize))
        .enumerate()
    {
        let addr = span_start + i as u64 * block;
        if want != have {
            mtd.erase_wait(addr, block)?;
            if want.iter().any(|&b| b != 0xFF) {
                mtd.write(addr, want)?;
            }
            blocks_changed += 1;
        }
        pb.inc(block);
    }
    pb.finish_with_message("Write complete");
    println!(
        "{} of {} erase blocks changed",
        blocks_changed,
        (span_end - span_start) / block
    );

    if verify {
        let pb = progress_bar(new_data.len() as u64, "verifying")?;
        let readback = read_range(mtd, offset, new_data.len() as u64, &pb)?;
        if let Some(i) = readback.iter().zip(&new_data).position(|(a, b)| a != b) {
            pb.abandon_with_message("Verify FAILED");
            return Err(format!(
                "Verification failed at offset 0x{:08X}: expected 0x{:02X}, got 0x{:02X}",
                offset + i as u64,
                new_data[i],
                readback[i]
            )
            .into());
        }
        pb.finish_with_message("Verify OK");
    }
    Ok(())
}

/// Run the erase command
pub fn run_erase(
    mtd: &MtdHandle,
    offset: u64,
    length: Option<u64>,
) -> Result<(), Box<dyn std::error::Error>> {
    let len = resolve_range(mtd.name(), mtd.size(), offset, length)?;
    println!(
        "Erasing {} (0x{:08X} - 0x{:08X}, {} bytes)",
        mtd.name(),
        offset,
        offset + len,
        len
    );

    let pb = ProgressBar::new_spinner();
    pb.set_style(create_spinner_style()?);
    pb.enable_steady_tick(Duration::from_millis(100));
    pb.set_message(format!("Erasing {}...", mtd.name()));

    match mtd.erase_wait(offset, len) {
        Ok(()) => {
            pb.finish_with_message("Erase complete");
            Ok(())
        }
        Err(e) => {
            pb.abandon_with_message("Erase FAILED");
            Err(e.into())
        }
    }
}
