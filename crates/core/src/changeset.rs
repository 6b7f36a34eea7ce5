//! Changeset codecs: block index, block cache, change index files
//!
//! A session's changeset lives under `delta/` and mirrors the data tree:
//!
//! - `<file>.bindex`: `u64` little-endian original file length, then
//!   44-byte entries `u32 blockno ‖ u64 cache_offset ‖ hash[32]`, in the
//!   order blocks were first touched (never sorted, never duplicated).
//! - `<file>.bcache`: the pre-image blocks themselves, BLOCK_SIZE bytes
//!   each, concatenated in append order; `cache_offset` indexes into it.
//! - `idxnew.idx` / `idxtouched.idx`: newline-terminated relative paths
//!   (leading `/`) of files created / mutated this session.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use color_eyre::Result;
use tracing::warn;

use crate::hash::TreeHash;
use crate::layout::FILE_MODE;

/// Encoded size of one block-index entry
pub const BLOCKINDEX_ENTRY_SIZE: usize = 44;

/// One block-index entry: where a pre-image block came from and where it
/// was cached, plus the hash of the preserved bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockIndexEntry {
    /// Block number in the original file
    pub blockno: u32,
    /// Byte offset of the preserved block inside `.bcache`
    pub cache_offset: u64,
    /// Offset-bound hash of the pre-image block
    pub hash: TreeHash,
}

impl BlockIndexEntry {
    /// Encode as the 44-byte wire form
    #[must_use]
    pub fn encode(&self) -> [u8; BLOCKINDEX_ENTRY_SIZE] {
        let mut buf = [0u8; BLOCKINDEX_ENTRY_SIZE];
        buf[..4].copy_from_slice(&self.blockno.to_le_bytes());
        buf[4..12].copy_from_slice(&self.cache_offset.to_le_bytes());
        buf[12..].copy_from_slice(self.hash.as_bytes());
        buf
    }

    fn decode(buf: &[u8]) -> Self {
        let blockno = u32::from_le_bytes(buf[..4].try_into().expect("4-byte slice"));
        let cache_offset = u64::from_le_bytes(buf[4..12].try_into().expect("8-byte slice"));
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&buf[12..BLOCKINDEX_ENTRY_SIZE]);
        Self {
            blockno,
            cache_offset,
            hash: TreeHash::from_raw(hash),
        }
    }
}

/// A parsed `.bindex` file
#[derive(Debug, Clone)]
pub struct BlockIndex {
    /// Length of the file before any mutation this session
    pub original_length: u64,
    /// Entries in first-touched order
    pub entries: Vec<BlockIndexEntry>,
}

impl BlockIndex {
    /// Load a `.bindex` file.
    ///
    /// Returns `Ok(None)` when the file is absent, and also when it is
    /// malformed (truncated header or a partial trailing entry): an
    /// inconsistent index is treated as a missing changeset for that file,
    /// with a warning, so callers can continue.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if bytes.len() < 8 || (bytes.len() - 8) % BLOCKINDEX_ENTRY_SIZE != 0 {
            warn!(
                path = %path.display(),
                len = bytes.len(),
                "inconsistent block index, treating as missing"
            );
            return Ok(None);
        }

        let original_length = u64::from_le_bytes(bytes[..8].try_into().expect("8-byte slice"));
        let entries = bytes[8..]
            .chunks_exact(BLOCKINDEX_ENTRY_SIZE)
            .map(BlockIndexEntry::decode)
            .collect();

        Ok(Some(Self {
            original_length,
            entries,
        }))
    }

    /// Block numbers present in the index
    #[must_use]
    pub fn changed_blocks(&self) -> HashSet<u32> {
        self.entries.iter().map(|e| e.blockno).collect()
    }
}

/// Open a file for appending, creating it (and nothing else) with the
/// recorder's 0644 mode
pub fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .write(true)
        .append(true)
        .create(true)
        .mode(FILE_MODE)
        .open(path)
}

/// Write the 8-byte original-length header that starts every `.bindex`
pub fn write_index_header(index: &mut File, original_length: u64) -> io::Result<()> {
    index.write_all(&original_length.to_le_bytes())
}

/// Append one encoded entry to a `.bindex`
pub fn append_index_entry(index: &mut File, entry: &BlockIndexEntry) -> io::Result<()> {
    index.write_all(&entry.encode())
}

/// Read a change index file into its lines; a missing file is empty
pub fn read_index_lines(path: &Path) -> Result<Vec<String>> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(content.lines().map(str::to_owned).collect()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

/// Append one relative path line to an open change index
pub fn append_index_line(index: &mut File, rel: &str) -> io::Result<()> {
    index.write_all(rel.as_bytes())?;
    index.write_all(b"\n")
}

/// Scan-and-rewrite a change index, dropping every line equal to `rel`.
///
/// The surviving lines are written to a sibling temp file which then
/// replaces the index; an index left with no lines is removed outright.
pub fn remove_index_line(path: &Path, rel: &str) -> Result<()> {
    let lines = read_index_lines(path)?;
    let kept: Vec<&String> = lines.iter().filter(|line| line.as_str() != rel).collect();

    if kept.len() == lines.len() {
        return Ok(());
    }

    if kept.is_empty() {
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        return Ok(());
    }

    let tmp = path.with_extension("idx.tmp");
    let mut out = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(FILE_MODE)
        .open(&tmp)?;
    for line in kept {
        append_index_line(&mut out, line)?;
    }
    drop(out);
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(blockno: u32, cache_offset: u64, seed: &[u8]) -> BlockIndexEntry {
        BlockIndexEntry {
            blockno,
            cache_offset,
            hash: TreeHash::from_bytes(seed),
        }
    }

    #[test]
    fn test_entry_wire_form() {
        let e = entry(7, 8192, b"pre-image");
        let buf = e.encode();
        assert_eq!(buf.len(), BLOCKINDEX_ENTRY_SIZE);
        assert_eq!(&buf[..4], &7u32.to_le_bytes());
        assert_eq!(&buf[4..12], &8192u64.to_le_bytes());
        assert_eq!(BlockIndexEntry::decode(&buf), e);
    }

    #[test]
    fn test_index_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f.bindex");

        let mut file = open_append(&path).unwrap();
        write_index_header(&mut file, 10_000).unwrap();
        append_index_entry(&mut file, &entry(1, 0, b"b1")).unwrap();
        append_index_entry(&mut file, &entry(0, 4096, b"b0")).unwrap();
        drop(file);

        let index = BlockIndex::load(&path).unwrap().unwrap();
        assert_eq!(index.original_length, 10_000);
        assert_eq!(index.entries.len(), 2);
        // Append order preserved, not block order
        assert_eq!(index.entries[0].blockno, 1);
        assert_eq!(index.entries[1].blockno, 0);
        assert_eq!(index.changed_blocks(), HashSet::from([0, 1]));
    }

    #[test]
    fn test_missing_index_is_none() {
        let dir = TempDir::new().unwrap();
        assert!(BlockIndex::load(&dir.path().join("nope.bindex")).unwrap().is_none());
    }

    #[test]
    fn test_malformed_index_is_none() {
        let dir = TempDir::new().unwrap();
        let truncated_header = dir.path().join("a.bindex");
        fs::write(&truncated_header, [0u8; 5]).unwrap();
        assert!(BlockIndex::load(&truncated_header).unwrap().is_none());

        let partial_entry = dir.path().join("b.bindex");
        fs::write(&partial_entry, [0u8; 8 + 20]).unwrap();
        assert!(BlockIndex::load(&partial_entry).unwrap().is_none());
    }

    #[test]
    fn test_index_lines_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("idxnew.idx");

        let mut file = open_append(&path).unwrap();
        append_index_line(&mut file, "/a.bin").unwrap();
        append_index_line(&mut file, "/sub/b.bin").unwrap();
        drop(file);

        assert_eq!(read_index_lines(&path).unwrap(), vec!["/a.bin", "/sub/b.bin"]);
    }

    #[test]
    fn test_missing_line_file_is_empty() {
        let dir = TempDir::new().unwrap();
        assert!(read_index_lines(&dir.path().join("gone.idx")).unwrap().is_empty());
    }

    #[test]
    fn test_remove_index_line() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("idxnew.idx");

        let mut file = open_append(&path).unwrap();
        append_index_line(&mut file, "/a").unwrap();
        append_index_line(&mut file, "/b").unwrap();
        append_index_line(&mut file, "/a").unwrap();
        drop(file);

        remove_index_line(&path, "/a").unwrap();
        assert_eq!(read_index_lines(&path).unwrap(), vec!["/b"]);

        // Removing the last line removes the file itself
        remove_index_line(&path, "/b").unwrap();
        assert!(!path.exists());

        // Removing from a missing file is fine
        remove_index_line(&path, "/b").unwrap();
    }
}
