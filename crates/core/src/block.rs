//! Fixed-size block arithmetic and zero-padded block reads

use std::fs::File;
use std::os::unix::fs::FileExt;

use color_eyre::Result;

use crate::hash::TreeHash;

/// Size of one cache block in bytes
pub const BLOCK_SIZE: u64 = 4096;

/// Number of blocks covering `len` bytes (last block may be short on disk)
#[must_use]
pub fn block_count(len: u64) -> u32 {
    len.div_ceil(BLOCK_SIZE) as u32
}

/// Inclusive block range touched by a write of `length` bytes at `offset`,
/// clipped to the first `original_len` bytes of the file.
///
/// The end block comes from the last written byte, so a write ending
/// exactly on a block boundary does not spill into the next block.
/// Returns `None` when the clipped range is empty: a zero-length write or
/// extent, or a write that starts at or beyond the extent.
#[must_use]
pub fn clipped_span(offset: u64, length: u64, original_len: u64) -> Option<(u32, u32)> {
    let blocks = u64::from(block_count(original_len));
    if blocks == 0 || length == 0 {
        return None;
    }
    let start = offset / BLOCK_SIZE;
    if start >= blocks {
        return None;
    }
    let end = ((offset + length - 1) / BLOCK_SIZE).min(blocks - 1);
    Some((start as u32, end as u32))
}

/// Read block `blockno` from `file`, zero-padding a short tail block.
pub fn read_block_padded(file: &File, blockno: u32) -> Result<[u8; BLOCK_SIZE as usize]> {
    let mut buf = [0u8; BLOCK_SIZE as usize];
    let mut filled = 0;
    let offset = u64::from(blockno) * BLOCK_SIZE;
    while filled < buf.len() {
        let n = file.read_at(&mut buf[filled..], offset + filled as u64)?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(buf)
}

/// Hash block `blockno` of `file`, bound to its byte offset.
pub fn hash_block(file: &File, blockno: u32) -> Result<TreeHash> {
    let offset = u64::from(blockno) * BLOCK_SIZE;
    let buf = read_block_padded(file, blockno)?;
    Ok(TreeHash::block(offset, &buf))
}
