//! Hash-tree builder: folds the data tree into per-directory hashes
//!
//! The builder mirrors the data tree under `htree/`: every directory gets a
//! `dir.hash` (the XOR of all child hashes) and every file a `<hex>.rh`
//! hard link to its `.bhmap`. Child order never matters since XOR folding
//! is commutative, so a directory hash is maintained by XORing the old
//! child contribution out and the new one in.
//!
//! With a non-empty changeset the builder runs in *hint mode*: it descends
//! only into directories that can contain changed paths and processes only
//! hinted files, erasing hints as they are consumed. Hints left over after
//! the forward pass name files that no longer exist; a second pass rooted
//! at the `.bhmap` mirror removes their maps and folds the removals up.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use color_eyre::Result;
use tracing::{debug, info, warn};

use crate::bhmap::FileHashBuilder;
use crate::changeset::read_index_lines;
use crate::config::StateConfig;
use crate::hash::TreeHash;
use crate::layout::{FILE_MODE, SlotDirs, parent_rel};

/// Changed-path hints drawn from the changeset indices, grouped by parent
/// directory
#[derive(Debug, Default)]
pub struct HintPaths {
    by_dir: HashMap<String, HashSet<String>>,
}

impl HintPaths {
    /// Load hints from both change indices of a slot's changeset
    pub fn load(dirs: &SlotDirs) -> Result<Self> {
        let mut hints = Self::default();
        for index in [dirs.touched_index(), dirs.new_index()] {
            for rel in read_index_lines(&index)? {
                hints.insert(&rel);
            }
        }
        Ok(hints)
    }

    fn insert(&mut self, rel: &str) {
        self.by_dir
            .entry(parent_rel(rel).to_owned())
            .or_default()
            .insert(rel.to_owned());
    }

    /// No hints at all (forces a full walk)
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_dir.is_empty()
    }

    /// Whether a directory holds hinted files or lies on the path to some.
    ///
    /// Prefix matching is on path-component boundaries: `"/a/b"` covers
    /// `"/a/b/c"` but not `"/a/bc"`.
    #[must_use]
    pub fn covers_dir(&self, rel_dir: &str) -> bool {
        if self.by_dir.contains_key(rel_dir) {
            return true;
        }
        let boundary = format!("{rel_dir}/");
        self.by_dir.keys().any(|dir| dir.starts_with(&boundary))
    }

    /// Consume the hint for one file; returns whether it was hinted
    fn take_file(&mut self, rel_dir: &str, rel_file: &str) -> bool {
        let Some(files) = self.by_dir.get_mut(rel_dir) else {
            return false;
        };
        let hit = files.remove(rel_file);
        if files.is_empty() {
            self.by_dir.remove(rel_dir);
        }
        hit
    }

    /// Consume every remaining hint directly under one directory, sorted
    fn take_dir(&mut self, rel_dir: &str) -> Vec<String> {
        let mut files: Vec<String> = self.by_dir.remove(rel_dir).into_iter().flatten().collect();
        files.sort_unstable();
        files
    }

    fn drain_remaining(&mut self) -> Vec<String> {
        let mut rest: Vec<String> = self.by_dir.drain().flat_map(|(_, files)| files).collect();
        rest.sort_unstable();
        rest
    }
}

/// Read a `dir.hash` file; absent means the empty-directory hash (zero)
pub fn read_dir_hash(path: &Path) -> Result<TreeHash> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(TreeHash::ZERO),
        Err(e) => return Err(e.into()),
    };
    let mut raw = [0u8; 32];
    file.read_exact(&mut raw)?;
    Ok(TreeHash::from_raw(raw))
}

fn write_dir_hash(path: &Path, hash: TreeHash) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new()
        .write(true)
        .truncate(true)
        .create(true)
        .mode(FILE_MODE)
        .open(path)?;
    file.write_all(hash.as_bytes())?;
    Ok(())
}

/// Incrementally rebuilds the hash tree of one slot
pub struct HashTreeBuilder {
    dirs: SlotDirs,
    remove_empty_dirs: bool,
    files: FileHashBuilder,
}

impl HashTreeBuilder {
    /// Create a builder over one slot's subtrees
    #[must_use]
    pub fn new(dirs: SlotDirs, config: &StateConfig) -> Self {
        Self {
            files: FileHashBuilder::new(dirs.clone()),
            remove_empty_dirs: config.remove_empty_dirs,
            dirs,
        }
    }

    /// Bring `htree/` (and the `.bhmap` mirror) up to date with `data/`,
    /// hint-driven by the current changeset when one exists.
    pub fn generate(&mut self) -> Result<()> {
        let mut hints = HintPaths::load(&self.dirs)?;
        let hint_mode = !hints.is_empty();
        if hint_mode {
            debug!("hash tree update in hint mode");
        } else {
            info!("full hash tree rebuild");
        }

        let mut tree_parent = TreeHash::ZERO;
        self.build_dir(&mut tree_parent, "", &mut hints, hint_mode)?;

        // Whatever hints survive the forward pass name files that are no
        // longer on disk; drop their maps and fold the removals upward
        if hint_mode && !hints.is_empty() {
            let mut tree_parent = TreeHash::ZERO;
            self.remove_dir(&mut tree_parent, "", &mut hints)?;
            for rel in hints.drain_remaining() {
                warn!(rel, "hinted path has no hash map to remove");
            }
        }

        Ok(())
    }

    /// Full rebuild, ignoring any changeset hints
    pub fn generate_full(&mut self) -> Result<()> {
        info!("full hash tree rebuild");
        let mut hints = HintPaths::default();
        let mut tree_parent = TreeHash::ZERO;
        self.build_dir(&mut tree_parent, "", &mut hints, false)
    }

    fn build_dir(
        &mut self,
        parent_hash: &mut TreeHash,
        rel_dir: &str,
        hints: &mut HintPaths,
        hint_mode: bool,
    ) -> Result<()> {
        let dir_hash_path = self.dirs.dir_hash_path(rel_dir);
        let old = read_dir_hash(&dir_hash_path)?;
        let mut cur = old;

        for (name, is_dir) in sorted_entries(&crate::layout::join_rel(&self.dirs.data, rel_dir))? {
            let child_rel = format!("{rel_dir}/{name}");
            if is_dir {
                if !hint_mode || hints.covers_dir(&child_rel) {
                    self.build_dir(&mut cur, &child_rel, hints, hint_mode)?;
                }
            } else if !hint_mode || hints.take_file(rel_dir, &child_rel) {
                self.files.build_for_file(&mut cur, &child_rel)?;
            }
        }

        if cur != old {
            write_dir_hash(&dir_hash_path, cur)?;
            *parent_hash ^= old;
            *parent_hash ^= cur;
            debug!(rel_dir, hash = %cur, "directory hash updated");
        }
        Ok(())
    }

    /// Removal pass: walks the `.bhmap` mirror, consuming hints for
    /// vanished files and pruning directories that end up empty
    fn remove_dir(
        &mut self,
        parent_hash: &mut TreeHash,
        rel_dir: &str,
        hints: &mut HintPaths,
    ) -> Result<()> {
        let dir_hash_path = self.dirs.dir_hash_path(rel_dir);
        let old = read_dir_hash(&dir_hash_path)?;
        let mut cur = old;

        let mirror = crate::layout::join_rel(&self.dirs.bhmaps, rel_dir);
        for (name, is_dir) in sorted_entries(&mirror)? {
            if is_dir {
                let child_rel = format!("{rel_dir}/{name}");
                if hints.covers_dir(&child_rel) {
                    self.remove_dir(&mut cur, &child_rel, hints)?;
                }
            }
        }

        for rel_file in hints.take_dir(rel_dir) {
            self.files.remove_file(&mut cur, &rel_file)?;
        }

        let now_empty = dir_is_empty(&mirror)?;
        if self.remove_empty_dirs && !rel_dir.is_empty() && now_empty {
            remove_dir_quietly(&mirror)?;
            remove_mirror_dir(&self.dirs.htree_dir(rel_dir))?;
            remove_dir_quietly(&crate::layout::join_rel(&self.dirs.data, rel_dir))?;
            *parent_hash ^= old;
            *parent_hash ^= cur;
            debug!(rel_dir, "empty directory pruned");
        } else if cur != old {
            write_dir_hash(&dir_hash_path, cur)?;
            *parent_hash ^= old;
            *parent_hash ^= cur;
        }
        Ok(())
    }
}

/// Directory entries as `(name, is_dir)`, name-sorted for deterministic
/// folding order; non-UTF-8 names and special files are skipped
fn sorted_entries(dir: &Path) -> Result<Vec<(String, bool)>> {
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
            warn!(path = %entry.path().display(), "skipping non-UTF-8 name");
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

fn dir_is_empty(dir: &Path) -> Result<bool> {
    match fs::read_dir(dir) {
        Ok(mut iter) => Ok(iter.next().is_none()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(true),
        Err(e) => Err(e.into()),
    }
}

/// Remove a directory expected to be empty; a vanished or non-empty one is
/// left alone
fn remove_dir_quietly(dir: &Path) -> Result<()> {
    match fs::remove_dir(dir) {
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

/// Remove a hash-tree mirror directory along with its `dir.hash`
fn remove_mirror_dir(dir: &Path) -> Result<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
