//! Restore engine: replay the live changeset in reverse
//!
//! Rollback is whole-changeset atomic from the user's view: delete the
//! files created this session, copy every preserved pre-image block back
//! over the data tree, truncate each touched file to its original length,
//! rebuild the hash tree from scratch, then consume the changeset and
//! shift the checkpoint ring up one slot. Any failure before the ring
//! shift leaves the ring untouched.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::PathBuf;

use color_eyre::Result;
use color_eyre::eyre::eyre;
use tracing::{debug, info, warn};

use crate::block::BLOCK_SIZE;
use crate::changeset::{BlockIndex, read_index_lines};
use crate::config::StateConfig;
use crate::hash::TreeHash;
use crate::htree::HashTreeBuilder;
use crate::layout::{FILE_MODE, SlotDirs, StateRoot};

/// Roll the live slot back to its pre-session state.
///
/// Consumes the slot-0 changeset: afterwards the most recent checkpoint's
/// changeset (if any) is live, so a further rollback undoes one more
/// checkpoint.
pub fn rollback(root: &StateRoot, config: &StateConfig) -> Result<()> {
    let dirs = root.live();

    delete_new_files(&dirs)?;
    restore_touched_files(&dirs, config)?;
    // The consumed changeset still drives the hash-tree update: restored
    // files are re-hashed in the forward pass, and index entries for files
    // deleted above fall through to the removal pass, which drops their
    // maps and folds the directory hashes back
    HashTreeBuilder::new(dirs.clone(), config).generate()?;
    cycle_slots(root)?;

    info!("rollback complete");
    Ok(())
}

/// Unlink every file created this session; already-gone files are fine
fn delete_new_files(dirs: &SlotDirs) -> Result<()> {
    for rel in read_index_lines(&dirs.new_index())? {
        match fs::remove_file(dirs.data_path(&rel)) {
            Ok(()) => debug!(rel, "deleted new file"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Restore each touched file once, in index order
fn restore_touched_files(dirs: &SlotDirs, config: &StateConfig) -> Result<()> {
    let mut processed = HashSet::new();
    for rel in read_index_lines(&dirs.touched_index())? {
        if !processed.insert(rel.clone()) {
            continue;
        }
        restore_file(dirs, &rel, config.verify_restore)?;
    }
    Ok(())
}

/// Copy a file's preserved blocks back and truncate to the original length
fn restore_file(dirs: &SlotDirs, rel: &str, verify: bool) -> Result<()> {
    let Some(index) = BlockIndex::load(&dirs.bindex_path(rel))? else {
        warn!(rel, "touched file has no usable block index, skipping");
        return Ok(());
    };

    let data_path = dirs.data_path(rel);
    if let Some(parent) = data_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let data = OpenOptions::new()
        .write(true)
        .create(true)
        .mode(FILE_MODE)
        .open(&data_path)?;

    if !index.entries.is_empty() {
        let cache = File::open(dirs.bcache_path(rel))?;
        let mut block = [0u8; BLOCK_SIZE as usize];
        for entry in &index.entries {
            cache.read_exact_at(&mut block, entry.cache_offset)?;

            if verify {
                let offset = u64::from(entry.blockno) * BLOCK_SIZE;
                let actual = TreeHash::block(offset, &block);
                if actual != entry.hash {
                    return Err(eyre!(
                        "pre-image hash mismatch restoring {rel} block {}: state is suspect",
                        entry.blockno
                    ));
                }
            }

            data.write_all_at(&block, u64::from(entry.blockno) * BLOCK_SIZE)?;
        }
    }

    // Cached blocks are written whole; trim the zero-padded tail (and any
    // in-session growth) back to the pre-session length
    if data.metadata()?.len() > index.original_length {
        data.set_len(index.original_length)?;
    }

    debug!(rel, blocks = index.entries.len(), "restored");
    Ok(())
}

/// Consume the live changeset and shift the checkpoint ring up: the most
/// recent history changeset becomes live, and so on down the ring.
fn cycle_slots(root: &StateRoot) -> Result<()> {
    let live_delta = root.delta_dir(0);
    match fs::remove_dir_all(&live_delta) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let slots = root.history_slots()?;
    for &slot in &slots {
        fs::rename(root.delta_dir(slot), root.delta_dir(slot + 1))?;
        debug!(slot, "changeset shifted up");
    }

    // The deepest slot directory is now hollow
    if let Some(&oldest) = slots.last() {
        remove_empty_dir(root.slot_dir(oldest))?;
    }

    // The live slot always carries a (possibly empty) changeset directory
    fs::create_dir_all(root.delta_dir(0))?;
    Ok(())
}

fn remove_empty_dir(dir: PathBuf) -> Result<()> {
    match fs::remove_dir(&dir) {
        Ok(()) => Ok(()),
        Err(e)
            if e.kind() == io::ErrorKind::NotFound
                || e.kind() == io::ErrorKind::DirectoryNotEmpty =>
        {
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
