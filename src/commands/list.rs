//! List and info commands

use fwflash_mtd::{MtdHandle, StorageRegistry};

/// Format a byte count with a binary unit
fn format_size(bytes: u64) -> String {
    if bytes >= 1024 * 1024 && bytes % (1024 * 1024) == 0 {
        format!("{} MiB", bytes / (1024 * 1024))
    } else if bytes >= 1024 && bytes % 1024 == 0 {
        format!("{} KiB", bytes / 1024)
    } else {
        format!("{} B", bytes)
    }
}

/// List all registered devices
pub fn run_list(registry: &StorageRegistry) {
    println!(
        "{:<6} {:<16} {:>10} {:>10} {:<4}",
        "Dev", "Name", "Size", "Erase", "Mode"
    );
    println!("{}", "-".repeat(50));

    for mtd in registry.devices() {
        let info = mtd.info();
        println!(
            "mtd{:<3} {:<16} {:>10} {:>10} {:<4}",
            mtd.index(),
            info.name,
            format_size(info.size),
            format_size(u64::from(info.erase_size)),
            if info.is_writeable() { "rw" } else { "ro" }
        );
    }
}

/// Show details of one device
pub fn run_info(mtd: &MtdHandle) {
    let info = mtd.info();
    println!("mtd{}: {}", mtd.index(), info.name);
    println!("  Type:        {}", info.device_type);
    println!("  Flags:       {:?}", info.flags);
    println!("  Size:        0x{:x} ({})", info.size, format_size(info.size));
    println!("  Erase size:  0x{:x}", info.erase_size);
    println!("  Erase blocks: {}", info.geometry().erase_blocks());
    println!("  Write size:  {}", info.write_size);
    println!("  Write buf:   {}", info.write_buf_size);
}
