//! End-to-end session tests: monitored mutations, checkpoints, rollback
//!
//! Each test plays a session the way the interception layer would: every
//! mutation is reported to the monitor first, then applied to the data
//! tree, and the session ends in a rollback (or checkpoint) whose outcome
//! is checked against the pre-session state.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::os::fd::AsRawFd;
use std::os::unix::fs::FileExt;
use std::path::Path;

use rollfs_core::{
    BLOCK_SIZE, BlockIndex, HashTreeBuilder, SlotDirs, StateConfig, StateMonitor, StateRoot,
    TreeHash, changeset::read_index_lines, create_checkpoint, htree::read_dir_hash, rollback,
    verify_tree,
};
use tempfile::TempDir;

struct Session {
    root: StateRoot,
    dirs: SlotDirs,
    monitor: StateMonitor,
    config: StateConfig,
}

impl Session {
    fn start(tmp: &TempDir) -> Self {
        let root = StateRoot::new(tmp.path().join("state"));
        root.init().unwrap();
        let dirs = root.live();
        let monitor = StateMonitor::new(dirs.clone()).unwrap();
        Self {
            root,
            dirs,
            monitor,
            config: StateConfig::default(),
        }
    }

    /// Pre-session content, written behind the monitor's back
    fn seed(&self, rel: &str, content: &[u8]) {
        let path = self.dirs.data_path(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn build_tree(&self) {
        HashTreeBuilder::new(self.dirs.clone(), &self.config)
            .generate()
            .unwrap();
    }

    /// Begin a fresh session (after a checkpoint): new monitor, new maps
    fn next_session(&mut self) {
        self.monitor = StateMonitor::new(self.dirs.clone()).unwrap();
    }

    fn create(&self, rel: &str, content: &[u8]) {
        let path = self.dirs.data_path(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let file = File::create(&path).unwrap();
        self.monitor.on_create(file.as_raw_fd()).unwrap();
        self.monitor
            .on_write(file.as_raw_fd(), 0, content.len() as u64)
            .unwrap();
        file.write_all_at(content, 0).unwrap();
        self.monitor.on_close(file.as_raw_fd()).unwrap();
    }

    fn overwrite(&self, rel: &str, offset: u64, content: &[u8]) {
        let path = self.dirs.data_path(rel);
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        let fd = file.as_raw_fd();
        self.monitor.on_open(fd, false).unwrap();
        self.monitor
            .on_write(fd, offset, content.len() as u64)
            .unwrap();
        file.write_all_at(content, offset).unwrap();
        self.monitor.on_close(fd).unwrap();
    }

    fn truncate(&self, rel: &str, size: u64) {
        let path = self.dirs.data_path(rel);
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        let fd = file.as_raw_fd();
        self.monitor.on_open(fd, false).unwrap();
        self.monitor.on_truncate(fd, size).unwrap();
        file.set_len(size).unwrap();
        self.monitor.on_close(fd).unwrap();
    }

    fn delete(&self, rel: &str) {
        let path = self.dirs.data_path(rel);
        self.monitor.on_delete(&path).unwrap();
        fs::remove_file(&path).unwrap();
    }

    fn rename(&self, old: &str, new: &str) {
        let old_path = self.dirs.data_path(old);
        let new_path = self.dirs.data_path(new);
        self.monitor.on_rename(&old_path, &new_path).unwrap();
        fs::rename(&old_path, &new_path).unwrap();
    }

    fn rollback(&self) {
        rollback(&self.root, &self.config).unwrap();
    }

    fn data(&self, rel: &str) -> Vec<u8> {
        fs::read(self.dirs.data_path(rel)).unwrap()
    }

    fn exists(&self, rel: &str) -> bool {
        self.dirs.data_path(rel).exists()
    }
}

/// All regular files under a tree, keyed by relative path
fn fingerprint(dir: &Path) -> BTreeMap<String, Vec<u8>> {
    fn walk(dir: &Path, base: &Path, out: &mut BTreeMap<String, Vec<u8>>) {
        let Ok(entries) = fs::read_dir(dir) else {
            return;
        };
        for entry in entries {
            let entry = entry.unwrap();
            let path = entry.path();
            if path.is_dir() {
                walk(&path, base, out);
            } else {
                let rel = path.strip_prefix(base).unwrap().to_string_lossy().into_owned();
                out.insert(rel, fs::read(&path).unwrap());
            }
        }
    }
    let mut out = BTreeMap::new();
    walk(dir, dir, &mut out);
    out
}

#[test]
fn create_write_rollback_leaves_empty_tree() {
    let tmp = TempDir::new().unwrap();
    let session = Session::start(&tmp);

    session.create("/a.bin", b"hello");
    session.build_tree();
    assert!(session.dirs.bhmap_path("/a.bin").exists());

    session.rollback();

    assert!(!session.exists("/a.bin"));
    assert!(fingerprint(&session.dirs.data).is_empty());
    assert!(fingerprint(&session.dirs.bhmaps).is_empty());
    // Empty tree folds to the zero hash
    assert!(read_dir_hash(&session.dirs.dir_hash_path("")).unwrap().is_zero());
    // The changeset was consumed
    assert!(read_index_lines(&session.dirs.new_index()).unwrap().is_empty());
}

#[test]
fn in_place_modify_restores_block() {
    let tmp = TempDir::new().unwrap();
    let session = Session::start(&tmp);

    let original = vec![b'A'; 10_000];
    session.seed("/doc.txt", &original);
    session.build_tree();
    let tree_before = read_dir_hash(&session.dirs.dir_hash_path("")).unwrap();

    session.overwrite("/doc.txt", 4096, &[b'B'; 4096]);

    let index = BlockIndex::load(&session.dirs.bindex_path("/doc.txt"))
        .unwrap()
        .unwrap();
    assert_eq!(index.entries.len(), 1);
    assert_eq!(index.entries[0].blockno, 1);
    assert_eq!(index.entries[0].cache_offset, 0);
    assert_eq!(index.entries[0].hash, TreeHash::block(4096, &[b'A'; 4096]));
    assert_eq!(
        fs::read(session.dirs.bcache_path("/doc.txt")).unwrap(),
        vec![b'A'; 4096]
    );

    session.rollback();

    assert_eq!(session.data("/doc.txt"), original);
    assert_eq!(read_dir_hash(&session.dirs.dir_hash_path("")).unwrap(), tree_before);
    assert!(verify_tree(&session.dirs).unwrap().is_clean());
}

#[test]
fn delete_restores_file_and_parent_hash() {
    let tmp = TempDir::new().unwrap();
    let session = Session::start(&tmp);

    let original = vec![b'K'; 8192];
    session.seed("/k", &original);
    session.build_tree();
    let tree_before = read_dir_hash(&session.dirs.dir_hash_path("")).unwrap();

    session.delete("/k");
    let index = BlockIndex::load(&session.dirs.bindex_path("/k")).unwrap().unwrap();
    assert_eq!(index.entries.len(), 2);
    assert_eq!(fs::read(session.dirs.bcache_path("/k")).unwrap().len(), 8192);

    // The tree reflects the deletion mid-session...
    session.build_tree();
    assert!(read_dir_hash(&session.dirs.dir_hash_path("")).unwrap().is_zero());

    session.rollback();

    // ...and the pre-session state after rollback
    assert_eq!(session.data("/k"), original);
    assert_eq!(read_dir_hash(&session.dirs.dir_hash_path("")).unwrap(), tree_before);
    assert!(verify_tree(&session.dirs).unwrap().is_clean());
}

#[test]
fn rename_then_write_rolls_back_to_original_name() {
    let tmp = TempDir::new().unwrap();
    let session = Session::start(&tmp);

    let original: Vec<u8> = (0..100u8).collect();
    session.seed("/x", &original);
    session.build_tree();

    session.rename("/x", "/y");
    session.overwrite("/y", 0, &[0xFFu8; 100]);

    session.rollback();

    assert!(session.exists("/x"));
    assert!(!session.exists("/y"));
    assert_eq!(session.data("/x"), original);
    assert!(verify_tree(&session.dirs).unwrap().is_clean());
}

#[test]
fn create_delete_create_rolls_back_to_absent() {
    let tmp = TempDir::new().unwrap();
    let session = Session::start(&tmp);

    session.create("/t", &[1u8; 10]);
    session.delete("/t");
    session.create("/t", &[2u8; 5]);

    assert_eq!(read_index_lines(&session.dirs.new_index()).unwrap(), vec!["/t"]);

    session.rollback();
    assert!(!session.exists("/t"));
    assert!(fingerprint(&session.dirs.data).is_empty());
}

#[test]
fn delete_then_recreate_existing_file_restores_original() {
    let tmp = TempDir::new().unwrap();
    let session = Session::start(&tmp);

    let original = vec![b'O'; 5000];
    session.seed("/f", &original);
    session.build_tree();

    session.delete("/f");
    session.create("/f", b"replacement");

    // Rollback deletes the recreated file first, then restores the cache
    session.rollback();
    assert_eq!(session.data("/f"), original);
    assert!(verify_tree(&session.dirs).unwrap().is_clean());
}

#[test]
fn extension_is_truncated_back() {
    let tmp = TempDir::new().unwrap();
    let session = Session::start(&tmp);

    let original = vec![b'E'; 4096];
    session.seed("/f", &original);
    session.build_tree();

    // Block-aligned append: no pre-image block changes, only the length
    session.overwrite("/f", 4096, &[b'X'; 100]);
    let index = BlockIndex::load(&session.dirs.bindex_path("/f")).unwrap().unwrap();
    assert!(index.entries.is_empty());

    session.rollback();
    assert_eq!(session.data("/f"), original);
}

#[test]
fn shrink_truncate_restores_contents() {
    let tmp = TempDir::new().unwrap();
    let session = Session::start(&tmp);

    let original = vec![b'S'; 10_000];
    session.seed("/f", &original);
    session.build_tree();

    session.truncate("/f", 128);
    assert_eq!(session.data("/f").len(), 128);

    session.rollback();
    assert_eq!(session.data("/f"), original);
    assert!(verify_tree(&session.dirs).unwrap().is_clean());
}

#[test]
fn mixed_session_roundtrips_all_three_trees() {
    let tmp = TempDir::new().unwrap();
    let session = Session::start(&tmp);

    session.seed("/top", &[1u8; 3000]);
    session.seed("/a/inner", &[2u8; 9000]);
    session.seed("/a/b/deep", &[3u8; 4096]);
    session.build_tree();

    let data_before = fingerprint(&session.dirs.data);
    let bhmaps_before = fingerprint(&session.dirs.bhmaps);
    let htree_before = fingerprint(&session.dirs.htree);

    session.overwrite("/top", 0, &[9u8; 100]);
    session.overwrite("/a/inner", 8000, &[8u8; 2000]);
    session.create("/a/b/new.bin", &[7u8; 5000]);
    session.rename("/a/b/deep", "/a/b/moved");
    session.truncate("/top", 10);
    session.delete("/a/inner");
    session.build_tree();

    session.rollback();

    assert_eq!(fingerprint(&session.dirs.data), data_before);
    assert_eq!(fingerprint(&session.dirs.bhmaps), bhmaps_before);
    assert_eq!(fingerprint(&session.dirs.htree), htree_before);
    assert!(verify_tree(&session.dirs).unwrap().is_clean());
}

#[test]
fn checkpoints_roll_back_one_at_a_time() {
    let tmp = TempDir::new().unwrap();
    let mut session = Session::start(&tmp);

    let v0 = vec![b'0'; 6000];
    session.seed("/f", &v0);
    session.build_tree();

    // Session A: v0 -> v1, checkpoint
    session.overwrite("/f", 0, &[b'1'; 6000]);
    session.build_tree();
    create_checkpoint(&session.root).unwrap();
    session.next_session();

    // Session B: v1 -> v2
    session.overwrite("/f", 2000, &[b'2'; 4000]);

    session.rollback();
    assert_eq!(session.data("/f"), vec![b'1'; 6000]);

    // The checkpointed changeset is live now; roll back once more
    rollback(&session.root, &session.config).unwrap();
    assert_eq!(session.data("/f"), v0);
    assert!(session.root.history_slots().unwrap().is_empty());
    assert!(verify_tree(&session.dirs).unwrap().is_clean());
}

#[test]
fn concurrent_writers_cache_each_block_once() {
    let tmp = TempDir::new().unwrap();
    let session = Session::start(&tmp);

    const BLOCKS: u64 = 64;
    let original = vec![b'C'; (BLOCKS * BLOCK_SIZE) as usize];
    session.seed("/big", &original);
    session.build_tree();

    let path = session.dirs.data_path("/big");
    let file = OpenOptions::new().write(true).open(&path).unwrap();
    let fd = file.as_raw_fd();
    session.monitor.on_open(fd, false).unwrap();

    // Four threads hammer every block; the monitor mutex serializes them
    std::thread::scope(|scope| {
        for _ in 0..4 {
            let monitor = &session.monitor;
            scope.spawn(move || {
                for blockno in 0..BLOCKS {
                    monitor.on_write(fd, blockno * BLOCK_SIZE, BLOCK_SIZE).unwrap();
                }
            });
        }
    });

    let index = BlockIndex::load(&session.dirs.bindex_path("/big")).unwrap().unwrap();
    assert_eq!(index.entries.len(), BLOCKS as usize);
    let unique: std::collections::HashSet<u32> =
        index.entries.iter().map(|e| e.blockno).collect();
    assert_eq!(unique.len(), BLOCKS as usize);
    // Cache offsets count up contiguously regardless of arrival order
    let mut offsets: Vec<u64> = index.entries.iter().map(|e| e.cache_offset).collect();
    offsets.sort_unstable();
    assert_eq!(
        offsets,
        (0..BLOCKS).map(|i| i * BLOCK_SIZE).collect::<Vec<u64>>()
    );

    file.write_all_at(&vec![b'X'; original.len()], 0).unwrap();
    session.monitor.on_close(fd).unwrap();

    session.rollback();
    assert_eq!(session.data("/big"), original);
    assert!(verify_tree(&session.dirs).unwrap().is_clean());
}

#[test]
fn empty_file_session_roundtrips() {
    let tmp = TempDir::new().unwrap();
    let session = Session::start(&tmp);

    session.seed("/empty", b"");
    session.build_tree();
    // An empty file's map holds just the root slot
    assert_eq!(
        fs::metadata(session.dirs.bhmap_path("/empty")).unwrap().len(),
        32
    );

    session.overwrite("/empty", 0, b"no longer empty");
    session.rollback();

    assert_eq!(session.data("/empty"), b"");
    assert!(verify_tree(&session.dirs).unwrap().is_clean());
}
