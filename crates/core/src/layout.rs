//! State-root directory layout: slot ring, per-slot subtrees, relative paths
//!
//! A state root holds a ring of numbered slots. Slot `0` is the live state
//! (mutable data tree, hash trees, in-progress changeset); negative slots
//! hold frozen changesets only, youngest first:
//!
//! ```text
//! <root>/0/data      user-visible mutable tree
//! <root>/0/bhmaps    mirror of data/ with .bhmap files
//! <root>/0/htree     mirror of data/ with dir.hash + <hex>.rh hard links
//! <root>/0/delta     in-progress changeset
//! <root>/-1/delta    most recent checkpoint's changeset
//! <root>/-2/delta    ...
//! ```
//!
//! Paths below a subtree are exchanged as *relative path strings* with a
//! leading `/` (the form stored in the changeset index files), so the same
//! `"/a/b.txt"` addresses the data file, its `.bhmap`, its changeset entries
//! and its hash-tree link.

use std::fs;
use std::path::{Path, PathBuf};

use color_eyre::Result;

/// Depth of the checkpoint history ring (slots `-1..=-MAX_CHECKPOINTS`)
pub const MAX_CHECKPOINTS: i32 = 3;

/// Mode for files created by the recorder and restore engine
pub const FILE_MODE: u32 = 0o644;

/// Extension of block-hash-map files under `bhmaps/`
pub const HASHMAP_EXT: &str = ".bhmap";
/// Extension of block-index files under `delta/`
pub const BLOCKINDEX_EXT: &str = ".bindex";
/// Extension of block-cache files under `delta/`
pub const BLOCKCACHE_EXT: &str = ".bcache";
/// Extension of file-root hard links under `htree/`
pub const ROOTHASH_EXT: &str = ".rh";

/// Changeset index of files created this session
pub const NEW_INDEX: &str = "idxnew.idx";
/// Changeset index of files whose pre-image is preserved
pub const TOUCHED_INDEX: &str = "idxtouched.idx";
/// Per-directory hash file under `htree/`
pub const DIRHASH_NAME: &str = "dir.hash";

/// Optional config file at the state root
pub const CONFIG_FILE: &str = "rollfs.toml";

const DATA_DIR: &str = "data";
const BHMAP_DIR: &str = "bhmaps";
const HTREE_DIR: &str = "htree";
const DELTA_DIR: &str = "delta";

/// A state root: the directory owning the slot ring
#[derive(Debug, Clone)]
pub struct StateRoot {
    root: PathBuf,
}

impl StateRoot {
    /// Wrap a state-root path
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The root path itself
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Path of the optional `rollfs.toml`
    #[must_use]
    pub fn config_path(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    /// Directory of slot `slot` (`0`, `-1`, `-2`, ...)
    #[must_use]
    pub fn slot_dir(&self, slot: i32) -> PathBuf {
        self.root.join(slot.to_string())
    }

    /// Changeset directory of slot `slot`
    #[must_use]
    pub fn delta_dir(&self, slot: i32) -> PathBuf {
        self.slot_dir(slot).join(DELTA_DIR)
    }

    /// Subtree paths of the live slot
    #[must_use]
    pub fn live(&self) -> SlotDirs {
        let slot = self.slot_dir(0);
        SlotDirs {
            data: slot.join(DATA_DIR),
            bhmaps: slot.join(BHMAP_DIR),
            htree: slot.join(HTREE_DIR),
            delta: slot.join(DELTA_DIR),
        }
    }

    /// Create the live slot's four subtrees
    pub fn init(&self) -> Result<()> {
        let live = self.live();
        for dir in [&live.data, &live.bhmaps, &live.htree, &live.delta] {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// History slots currently present, youngest first (`-1`, `-2`, ...)
    pub fn history_slots(&self) -> Result<Vec<i32>> {
        let mut slots = Vec::new();
        if !self.root.exists() {
            return Ok(slots);
        }
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(n) = entry
                .file_name()
                .to_str()
                .and_then(|s| s.parse::<i32>().ok())
                && n < 0
            {
                slots.push(n);
            }
        }
        slots.sort_unstable_by_key(|s| -s);
        Ok(slots)
    }
}

/// Absolute paths of one slot's four subtrees
#[derive(Debug, Clone)]
pub struct SlotDirs {
    /// User-visible mutable tree
    pub data: PathBuf,
    /// Block-hash-map mirror of `data`
    pub bhmaps: PathBuf,
    /// Hash-tree mirror of `data`
    pub htree: PathBuf,
    /// Changeset directory
    pub delta: PathBuf,
}

impl SlotDirs {
    /// Data file for a relative path
    #[must_use]
    pub fn data_path(&self, rel: &str) -> PathBuf {
        join_rel(&self.data, rel)
    }

    /// `.bhmap` file for a relative path
    #[must_use]
    pub fn bhmap_path(&self, rel: &str) -> PathBuf {
        join_rel(&self.bhmaps, &format!("{rel}{HASHMAP_EXT}"))
    }

    /// `.bindex` file for a relative path
    #[must_use]
    pub fn bindex_path(&self, rel: &str) -> PathBuf {
        join_rel(&self.delta, &format!("{rel}{BLOCKINDEX_EXT}"))
    }

    /// `.bcache` file for a relative path
    #[must_use]
    pub fn bcache_path(&self, rel: &str) -> PathBuf {
        join_rel(&self.delta, &format!("{rel}{BLOCKCACHE_EXT}"))
    }

    /// Hash-tree directory mirroring a relative directory path
    #[must_use]
    pub fn htree_dir(&self, rel_dir: &str) -> PathBuf {
        join_rel(&self.htree, rel_dir)
    }

    /// `dir.hash` file of a relative directory path
    #[must_use]
    pub fn dir_hash_path(&self, rel_dir: &str) -> PathBuf {
        self.htree_dir(rel_dir).join(DIRHASH_NAME)
    }

    /// `<hex>.rh` hard-link path for a file root hash inside a directory
    #[must_use]
    pub fn rh_link_path(&self, rel_dir: &str, hash_hex: &str) -> PathBuf {
        self.htree_dir(rel_dir).join(format!("{hash_hex}{ROOTHASH_EXT}"))
    }

    /// The new-files changeset index
    #[must_use]
    pub fn new_index(&self) -> PathBuf {
        self.delta.join(NEW_INDEX)
    }

    /// The touched-files changeset index
    #[must_use]
    pub fn touched_index(&self) -> PathBuf {
        self.delta.join(TOUCHED_INDEX)
    }
}

/// Relative path (leading `/`) of `path` under `base`, or `None` if `path`
/// is not below `base`. The base itself maps to `""`.
#[must_use]
pub fn rel_from(path: &Path, base: &Path) -> Option<String> {
    let rest = path.strip_prefix(base).ok()?;
    let rest = rest.to_string_lossy();
    if rest.is_empty() {
        Some(String::new())
    } else {
        Some(format!("/{rest}"))
    }
}

/// Join a relative path (leading `/`, or `""` for the base itself) onto a base
#[must_use]
pub fn join_rel(base: &Path, rel: &str) -> PathBuf {
    let trimmed = rel.trim_start_matches('/');
    if trimmed.is_empty() {
        base.to_path_buf()
    } else {
        base.join(trimmed)
    }
}

/// Parent of a relative path (`"/a/b" → "/a"`, `"/a" → ""`)
#[must_use]
pub fn parent_rel(rel: &str) -> &str {
    match rel.rfind('/') {
        Some(0) | None => "",
        Some(idx) => &rel[..idx],
    }
}

/// Final component of a relative path
#[must_use]
pub fn rel_file_name(rel: &str) -> &str {
    match rel.rfind('/') {
        Some(idx) => &rel[idx + 1..],
        None => rel,
    }
}
