//! Full verification: recompute every hash and compare with stored state
//!
//! Walks the data tree re-hashing file contents from scratch and checks
//! the three stored layers against each other: `.bhmap` root hashes,
//! `<hex>.rh` hard links, and `dir.hash` folds. Directory folds are
//! checked against the *stored* child hashes, so a single corrupt file
//! surfaces as one file mismatch rather than a cascade of directory
//! mismatches.

use std::fs::{self, File};
use std::io;
use std::path::Path;

use color_eyre::Result;
use serde::Serialize;
use tracing::debug;

use crate::bhmap::BlockHashMap;
use crate::block::{block_count, hash_block};
use crate::hash::TreeHash;
use crate::htree::read_dir_hash;
use crate::layout::{HASHMAP_EXT, SlotDirs, join_rel, rel_file_name};

/// Outcome of a full verification pass
#[derive(Debug, Default, Clone, Serialize)]
pub struct VerifyReport {
    /// Files whose contents were re-hashed
    pub files_checked: usize,
    /// Directories whose folds were checked
    pub dirs_checked: usize,
    /// Files whose stored root hash disagrees with their contents
    pub mismatched_files: Vec<String>,
    /// Data files with no `.bhmap`
    pub missing_maps: Vec<String>,
    /// `.bhmap` files whose data file is gone
    pub orphaned_maps: Vec<String>,
    /// Files whose `<hex>.rh` hard link is missing or detached
    pub broken_links: Vec<String>,
    /// Directories whose `dir.hash` is not the XOR of its children
    pub mismatched_dirs: Vec<String>,
}

impl VerifyReport {
    /// Whether every stored hash matched
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.mismatched_files.is_empty()
            && self.missing_maps.is_empty()
            && self.orphaned_maps.is_empty()
            && self.broken_links.is_empty()
            && self.mismatched_dirs.is_empty()
    }
}

/// Verify one slot's stored hashes against its data tree
pub fn verify_tree(dirs: &SlotDirs) -> Result<VerifyReport> {
    let mut report = VerifyReport::default();
    verify_dir(dirs, "", &mut report)?;
    scan_orphans(dirs, "", &mut report)?;
    debug!(
        files = report.files_checked,
        dirs = report.dirs_checked,
        clean = report.is_clean(),
        "verification finished"
    );
    Ok(report)
}

/// Check one directory; returns its stored hash for the parent's fold
fn verify_dir(dirs: &SlotDirs, rel_dir: &str, report: &mut VerifyReport) -> Result<TreeHash> {
    let mut folded = TreeHash::ZERO;

    for entry in sorted_dir(&join_rel(&dirs.data, rel_dir))? {
        let (name, is_dir) = entry;
        let child_rel = format!("{rel_dir}/{name}");
        if is_dir {
            folded ^= verify_dir(dirs, &child_rel, report)?;
        } else {
            folded ^= verify_file(dirs, rel_dir, &child_rel, report)?;
        }
    }

    let stored = read_dir_hash(&dirs.dir_hash_path(rel_dir))?;
    if stored != folded {
        report.mismatched_dirs.push(display_rel(rel_dir));
    }
    report.dirs_checked += 1;
    Ok(stored)
}

/// Check one file; returns its stored root hash for the directory fold
fn verify_file(
    dirs: &SlotDirs,
    rel_dir: &str,
    rel: &str,
    report: &mut VerifyReport,
) -> Result<TreeHash> {
    let file = File::open(dirs.data_path(rel))?;
    let blocks = block_count(file.metadata()?.len());

    let mut folded = TreeHash::ZERO;
    for blockno in 0..blocks {
        folded ^= hash_block(&file, blockno)?;
    }
    let fresh = TreeHash::file_root(rel_file_name(rel).as_bytes(), folded);
    report.files_checked += 1;

    let Some(stored) = BlockHashMap::load_root(&dirs.bhmap_path(rel))? else {
        report.missing_maps.push(rel.to_owned());
        return Ok(fresh);
    };

    if stored != fresh {
        report.mismatched_files.push(rel.to_owned());
    }

    let link = dirs.rh_link_path(rel_dir, &stored.to_hex());
    if !shares_inode(&link, &dirs.bhmap_path(rel))? {
        report.broken_links.push(rel.to_owned());
    }

    Ok(stored)
}

/// Find `.bhmap` files whose data file no longer exists
fn scan_orphans(dirs: &SlotDirs, rel_dir: &str, report: &mut VerifyReport) -> Result<()> {
    for (name, is_dir) in sorted_dir(&join_rel(&dirs.bhmaps, rel_dir))? {
        let child_rel = format!("{rel_dir}/{name}");
        if is_dir {
            scan_orphans(dirs, &child_rel, report)?;
        } else if let Some(data_rel) = child_rel.strip_suffix(HASHMAP_EXT)
            && !dirs.data_path(data_rel).exists()
        {
            report.orphaned_maps.push(data_rel.to_owned());
        }
    }
    Ok(())
}

fn shares_inode(a: &Path, b: &Path) -> Result<bool> {
    use std::os::unix::fs::MetadataExt;
    let meta_a = match fs::metadata(a) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    Ok(meta_a.ino() == fs::metadata(b)?.ino())
}

fn sorted_dir(dir: &Path) -> Result<Vec<(String, bool)>> {
    let mut entries = Vec::new();
    let iter = match fs::read_dir(dir) {
        Ok(iter) => iter,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(entries),
        Err(e) => return Err(e.into()),
    };
    for entry in iter {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };
        if file_type.is_dir() {
            entries.push((name, true));
        } else if file_type.is_file() {
            entries.push((name, false));
        }
    }
    entries.sort_unstable();
    Ok(entries)
}

fn display_rel(rel_dir: &str) -> String {
    if rel_dir.is_empty() {
        "/".to_owned()
    } else {
        rel_dir.to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StateConfig;
    use crate::htree::HashTreeBuilder;
    use crate::layout::StateRoot;
    use tempfile::TempDir;

    fn setup_tree() -> (TempDir, SlotDirs) {
        let tmp = TempDir::new().unwrap();
        let root = StateRoot::new(tmp.path().join("state"));
        root.init().unwrap();
        let dirs = root.live();

        fs::write(dirs.data_path("/a"), vec![1u8; 5000]).unwrap();
        fs::create_dir_all(dirs.data_path("/sub")).unwrap();
        fs::write(dirs.data_path("/sub/b"), vec![2u8; 100]).unwrap();
        HashTreeBuilder::new(dirs.clone(), &StateConfig::default())
            .generate()
            .unwrap();
        (tmp, dirs)
    }

    #[test]
    fn test_clean_tree_verifies() {
        let (_tmp, dirs) = setup_tree();
        let report = verify_tree(&dirs).unwrap();
        assert!(report.is_clean(), "{report:?}");
        assert_eq!(report.files_checked, 2);
        assert_eq!(report.dirs_checked, 2);
    }

    #[test]
    fn test_silent_data_change_is_flagged() {
        let (_tmp, dirs) = setup_tree();
        // Mutate data without telling the monitor or rebuilding
        fs::write(dirs.data_path("/a"), vec![9u8; 5000]).unwrap();

        let report = verify_tree(&dirs).unwrap();
        assert_eq!(report.mismatched_files, vec!["/a"]);
        // The stored fold still matches the stored children
        assert!(report.mismatched_dirs.is_empty());
    }

    #[test]
    fn test_missing_map_and_orphan_are_flagged() {
        let (_tmp, dirs) = setup_tree();
        fs::write(dirs.data_path("/unmapped"), b"new").unwrap();
        fs::remove_file(dirs.data_path("/sub/b")).unwrap();

        let report = verify_tree(&dirs).unwrap();
        assert_eq!(report.missing_maps, vec!["/unmapped"]);
        assert_eq!(report.orphaned_maps, vec!["/sub/b"]);
        assert!(!report.is_clean());
    }

    #[test]
    fn test_corrupt_dir_hash_is_flagged() {
        let (_tmp, dirs) = setup_tree();
        fs::write(dirs.dir_hash_path("/sub"), [0xEEu8; 32]).unwrap();

        let report = verify_tree(&dirs).unwrap();
        // The root folds over the stored (corrupt) child hash, so both levels flag
        assert_eq!(report.mismatched_dirs, vec!["/sub", "/"]);
        assert!(report.mismatched_files.is_empty());
    }

    #[test]
    fn test_broken_link_is_flagged() {
        let (_tmp, dirs) = setup_tree();
        let root_hash = BlockHashMap::load_root(&dirs.bhmap_path("/a")).unwrap().unwrap();
        fs::remove_file(dirs.rh_link_path("", &root_hash.to_hex())).unwrap();

        let report = verify_tree(&dirs).unwrap();
        assert_eq!(report.broken_links, vec!["/a"]);
    }
}
