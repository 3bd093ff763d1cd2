//! Multifile archives.
//!
//! A Multifile starts with a fixed header (magic, version 1.1, scale factor,
//! archive timestamp) followed by a singly linked index: every index record
//! begins with the absolute offset of the next record, and a zero offset ends
//! the chain. Integers are little-endian and stored file names are XORed with
//! 0xFF.
pub mod builder;
pub mod reader;

pub use builder::MultifileBuilder;
pub use reader::{
    extract_all, extract_one, ExtractOptions, MultifileHeader, MultifileReader, OverwritePolicy,
    Subfile, SubfileFilter,
};

const MULTIFILE_HEADER_MAGIC: &[u8; 6] = b"pmf\0\n\r";
const CURRENT_MAJOR_VERSION: u16 = 1;
const CURRENT_MINOR_VERSION: u16 = 1;
const SUPPORTED_SCALE_FACTOR: u32 = 1;
// Magic, major, minor, scale factor and archive timestamp
const MULTIFILE_HEADER_SIZE: usize = MULTIFILE_HEADER_MAGIC.len() + 0xC;
// Next offset, start, length, flags, timestamp and name length
const INDEX_RECORD_FIXED_SIZE: usize = 0x14;
// Records flagged with any of these bits carry an extra uncompressed length
const SF_UNCOMPRESSED_LENGTH_FLAGS: u16 = 0x18;

/// Toggles the XOR 0xFF scrambling applied to stored file names.
fn xor_file_name(name: &[u8]) -> Vec<u8> {
    name.iter().map(|b| b ^ 0xFF).collect()
}

fn has_uncompressed_length(flags: u16) -> bool {
    (flags & SF_UNCOMPRESSED_LENGTH_FLAGS) != 0
}
