//! Tar archive handling for layer rewrites.

mod compression;
mod digest;
mod header;
mod nested;
mod time;
mod tmp_reader;

pub use compression::{Compression, Encoder};
pub use digest::{DigestWriter, sha256_digest};
pub use header::{EntryHeader, copy_pax_global};
pub use nested::{NestedRewrite, rewrite_nested_times};
pub use time::{TimeRule, format_pax_time, parse_pax_time};
pub use tmp_reader::TmpReader;
