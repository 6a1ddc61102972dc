//! Output cache: skip recordings whose converted output is already complete.

mod layout;
mod probe;

pub use layout::{output_dir_for, output_dir_name, OutputLayout};
pub use probe::{CacheCheckError, CacheProbe, CacheResult};
