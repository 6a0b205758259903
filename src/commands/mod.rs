//! CLI command implementations
//!
//! All commands go through registry handles, so they work the same on a
//! whole flash device and on a partition.

mod io;
mod list;

pub use io::{run_erase, run_read, run_write};
pub use list::{run_info, run_list};
