//! Block hash maps: the `.bhmap` codec and the per-file builder
//!
//! A `.bhmap` mirrors one data file: slot 0 is the file root hash, slots
//! `1..=N` are the offset-bound block hashes. The hash tree references the
//! same bytes through a `<root_hex>.rh` hard link, so the map is always
//! rewritten in place (`O_TRUNC`); replacing it via a temp file would
//! split the inode out from under the link.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use color_eyre::Result;
use tracing::{debug, warn};

use crate::block::{block_count, hash_block};
use crate::changeset::BlockIndex;
use crate::hash::TreeHash;
use crate::layout::{FILE_MODE, SlotDirs, parent_rel, rel_file_name};

/// In-memory form of a `.bhmap` file
#[derive(Debug, Clone)]
pub struct BlockHashMap {
    /// File root hash: `H(name ‖ XOR of block hashes)`
    pub root: TreeHash,
    /// Block hashes in block order
    pub blocks: Vec<TreeHash>,
}

impl BlockHashMap {
    /// Load a `.bhmap` file.
    ///
    /// Returns `Ok(None)` when absent; a malformed map (size not a
    /// multiple of the hash size) is also treated as absent, with a
    /// warning, which forces a full re-hash of the file.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if bytes.len() < TreeHash::SIZE || bytes.len() % TreeHash::SIZE != 0 {
            warn!(path = %path.display(), len = bytes.len(), "malformed block hash map, rebuilding");
            return Ok(None);
        }

        let mut hashes = bytes.chunks_exact(TreeHash::SIZE).map(|chunk| {
            let raw: [u8; 32] = chunk.try_into().expect("32-byte chunk");
            TreeHash::from_raw(raw)
        });
        let root = hashes.next().expect("at least the root slot");

        Ok(Some(Self {
            root,
            blocks: hashes.collect(),
        }))
    }

    /// Read just the root hash (the first 32 bytes)
    pub fn load_root(path: &Path) -> Result<Option<TreeHash>> {
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut raw = [0u8; 32];
        file.read_exact(&mut raw)?;
        Ok(Some(TreeHash::from_raw(raw)))
    }

    /// Rewrite the map in place, preserving the file's inode
    pub fn write_in_place(&self, path: &Path) -> Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .create(true)
            .mode(FILE_MODE)
            .open(path)?;
        file.write_all(self.root.as_bytes())?;
        for block in &self.blocks {
            file.write_all(block.as_bytes())?;
        }
        Ok(())
    }
}

/// Builds and maintains per-file hash maps plus their hash-tree links
pub struct FileHashBuilder {
    dirs: SlotDirs,
    created_bhmap_dirs: HashSet<PathBuf>,
    created_htree_dirs: HashSet<PathBuf>,
}

impl FileHashBuilder {
    /// Create a builder over one slot's subtrees
    #[must_use]
    pub fn new(dirs: SlotDirs) -> Self {
        Self {
            dirs,
            created_bhmap_dirs: HashSet::new(),
            created_htree_dirs: HashSet::new(),
        }
    }

    /// Recompute the hash map for one data file and fold the root-hash
    /// change into `parent_dir_hash`. Returns the new file root hash.
    ///
    /// When both the old map and a block index exist, only indexed blocks
    /// are re-read from the data file; the rest keep their old hashes. The
    /// index contributes *which* blocks changed, never hash values: its
    /// hashes describe pre-images, and copying them forward would persist
    /// stale hashes.
    pub fn build_for_file(&mut self, parent_dir_hash: &mut TreeHash, rel: &str) -> Result<TreeHash> {
        let data_path = self.dirs.data_path(rel);
        let bhmap_path = self.dirs.bhmap_path(rel);

        let file = File::open(&data_path)?;
        let blocks = block_count(file.metadata()?.len());

        let old = BlockHashMap::load(&bhmap_path)?;
        let index = BlockIndex::load(&self.dirs.bindex_path(rel))?;
        let changed = index.as_ref().map(BlockIndex::changed_blocks);

        let mut folded = TreeHash::ZERO;
        let mut block_hashes = Vec::with_capacity(blocks as usize);
        for blockno in 0..blocks {
            let reusable = match (&old, &changed) {
                (Some(old), Some(changed)) => {
                    (!changed.contains(&blockno)).then(|| old.blocks.get(blockno as usize).copied())
                }
                _ => None,
            };
            let hash = match reusable.flatten() {
                Some(hash) => hash,
                None => hash_block(&file, blockno)?,
            };
            folded ^= hash;
            block_hashes.push(hash);
        }

        let name = rel_file_name(rel);
        let root = TreeHash::file_root(name.as_bytes(), folded);
        let map = BlockHashMap {
            root,
            blocks: block_hashes,
        };

        self.ensure_map_dir(&bhmap_path)?;
        map.write_in_place(&bhmap_path)?;
        debug!(rel, root = %root, blocks, "block hash map updated");

        self.update_tree_entry(parent_dir_hash, old.as_ref().map(|m| m.root), root, &bhmap_path, rel)?;
        Ok(root)
    }

    /// Delete a file's hash map and its hash-tree link, folding the old
    /// root hash out of `parent_dir_hash`.
    pub fn remove_file(&mut self, parent_dir_hash: &mut TreeHash, rel: &str) -> Result<()> {
        let bhmap_path = self.dirs.bhmap_path(rel);
        let Some(root) = BlockHashMap::load_root(&bhmap_path)? else {
            warn!(rel, "no block hash map for removed file, skipping");
            return Ok(());
        };

        fs::remove_file(&bhmap_path)?;

        let link = self.dirs.rh_link_path(parent_rel(rel), &root.to_hex());
        match fs::remove_file(&link) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(rel, link = %link.display(), "root hash link already gone");
            }
            Err(e) => return Err(e.into()),
        }

        *parent_dir_hash ^= root;
        debug!(rel, root = %root, "block hash map removed");
        Ok(())
    }

    /// Maintain the `<root_hex>.rh` hard link after a map rewrite and fold
    /// the root-hash change into the parent directory hash.
    fn update_tree_entry(
        &mut self,
        parent_dir_hash: &mut TreeHash,
        old_root: Option<TreeHash>,
        new_root: TreeHash,
        bhmap_path: &Path,
        rel: &str,
    ) -> Result<()> {
        let rel_dir = parent_rel(rel);

        if let Some(old_root) = old_root {
            if old_root != new_root {
                let old_link = self.dirs.rh_link_path(rel_dir, &old_root.to_hex());
                let new_link = self.dirs.rh_link_path(rel_dir, &new_root.to_hex());
                match fs::rename(&old_link, &new_link) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {
                        // Map existed without its link; re-create it
                        warn!(rel, "root hash link missing, re-linking");
                        self.link_map(bhmap_path, &new_link, rel_dir)?;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            *parent_dir_hash ^= old_root;
            *parent_dir_hash ^= new_root;
        } else {
            let new_link = self.dirs.rh_link_path(rel_dir, &new_root.to_hex());
            self.link_map(bhmap_path, &new_link, rel_dir)?;
            *parent_dir_hash ^= new_root;
        }
        Ok(())
    }

    fn link_map(&mut self, bhmap_path: &Path, link: &Path, rel_dir: &str) -> Result<()> {
        let htree_dir = self.dirs.htree_dir(rel_dir);
        if self.created_htree_dirs.insert(htree_dir.clone()) {
            fs::create_dir_all(&htree_dir)?;
        }
        match fs::hard_link(bhmap_path, link) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                // Stale link from an earlier session; replace it
                fs::remove_file(link)?;
                fs::hard_link(bhmap_path, link)?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn ensure_map_dir(&mut self, bhmap_path: &Path) -> Result<()> {
        if let Some(parent) = bhmap_path.parent()
            && self.created_bhmap_dirs.insert(parent.to_path_buf())
        {
            fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}
