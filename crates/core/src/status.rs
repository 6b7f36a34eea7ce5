//! Changeset summaries: a serializable view of the live session

use serde::Serialize;

use crate::block::BLOCK_SIZE;
use crate::changeset::{BlockIndex, read_index_lines};
use crate::layout::StateRoot;

/// One touched file in the live changeset
#[derive(Debug, Clone, Serialize)]
pub struct TouchedFile {
    /// Relative path (leading `/`)
    pub path: String,
    /// Pre-session file length
    pub original_length: u64,
    /// Number of preserved pre-image blocks
    pub cached_blocks: usize,
}

/// Summary of the live changeset and the checkpoint ring
#[derive(Debug, Clone, Serialize)]
pub struct ChangesetSummary {
    /// Files created this session
    pub new_files: Vec<String>,
    /// Files with preserved pre-images
    pub touched_files: Vec<TouchedFile>,
    /// Total bytes held in block caches
    pub cached_bytes: u64,
    /// History slots currently present, youngest first
    pub history_slots: Vec<i32>,
}

impl ChangesetSummary {
    /// Whether the live session has recorded anything
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.new_files.is_empty() && self.touched_files.is_empty()
    }
}

/// Summarize the live changeset of a state root
pub fn summarize(root: &StateRoot) -> color_eyre::Result<ChangesetSummary> {
    let dirs = root.live();

    let new_files = read_index_lines(&dirs.new_index())?;

    let mut touched_files = Vec::new();
    let mut seen = std::collections::HashSet::new();
    let mut cached_bytes = 0u64;
    for path in read_index_lines(&dirs.touched_index())? {
        if !seen.insert(path.clone()) {
            continue;
        }
        let (original_length, cached_blocks) = match BlockIndex::load(&dirs.bindex_path(&path))? {
            Some(index) => (index.original_length, index.entries.len()),
            None => (0, 0),
        };
        cached_bytes += cached_blocks as u64 * BLOCK_SIZE;
        touched_files.push(TouchedFile {
            path,
            original_length,
            cached_blocks,
        });
    }

    Ok(ChangesetSummary {
        new_files,
        touched_files,
        cached_bytes,
        history_slots: root.history_slots()?,
    })
}
