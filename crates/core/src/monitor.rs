//! Copy-on-write state monitor: the event-driven pre-image recorder
//!
//! An external interception layer reports every mutating filesystem event
//! against the data tree here *before* the mutation lands. The monitor
//! preserves the pre-image of every block about to change, at most once
//! per block per session, into the changeset (`.bcache` + `.bindex`), and
//! keeps the two change indices (`idxnew.idx`, `idxtouched.idx`) that later
//! drive the hash-tree builder and the restore engine.
//!
//! One mutex serializes all event handling; the critical section is a
//! single event call. A failed event is logged and reported to the caller,
//! but the triggering mutation is not vetoed; the interception layer may
//! have no way to stop it (liveness over rollback completeness).

use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::Write;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use color_eyre::Result;
use color_eyre::eyre::eyre;
use tracing::{debug, warn};

use crate::block::{BLOCK_SIZE, block_count, clipped_span, read_block_padded};
use crate::changeset::{
    BlockIndexEntry, append_index_entry, append_index_line, open_append, remove_index_line,
    write_index_header,
};
use crate::hash::TreeHash;
use crate::layout::SlotDirs;

/// Tracking record for one mutated file
struct TrackedFile {
    /// Created during this session: there is no pre-image to preserve, and
    /// rollback deletes the file outright
    is_new: bool,
    /// File length before any mutation this session
    original_length: u64,
    /// Blocks whose pre-image is already preserved
    cached_blocks: HashSet<u32>,
    /// Whether the path has been appended to `idxtouched.idx`
    touched_recorded: bool,
    /// Pre-image reader, opened before the first mutation lands
    read_fd: Option<File>,
    /// Appender for `.bcache`
    cache_fd: Option<File>,
    /// Appender for `.bindex`
    index_fd: Option<File>,
}

impl TrackedFile {
    fn new_file() -> Self {
        Self {
            is_new: true,
            original_length: 0,
            cached_blocks: HashSet::new(),
            touched_recorded: false,
            read_fd: None,
            cache_fd: None,
            index_fd: None,
        }
    }

    fn existing(original_length: u64) -> Self {
        Self {
            is_new: false,
            original_length,
            ..Self::new_file()
        }
    }

    fn fully_cached(&self) -> bool {
        let blocks = block_count(self.original_length);
        blocks > 0 && self.cached_blocks.len() == blocks as usize
    }

    fn close_caching_fds(&mut self) {
        self.read_fd = None;
        self.cache_fd = None;
        self.index_fd = None;
    }
}

#[derive(Default)]
struct MonitorState {
    /// Open descriptor → resolved absolute path
    fd_paths: HashMap<RawFd, PathBuf>,
    /// Absolute path → tracking record; entries live until session close
    tracked: HashMap<PathBuf, TrackedFile>,
    /// Changeset subdirectories already created
    created_cache_dirs: HashSet<PathBuf>,
    /// `idxtouched.idx`, kept open for the monitor's lifetime
    touched_index: Option<File>,
}

/// The copy-on-write recorder for one live slot
pub struct StateMonitor {
    dirs: SlotDirs,
    /// Canonical data root, for prefix checks against resolved fd paths
    data_root: PathBuf,
    state: Mutex<MonitorState>,
}

impl StateMonitor {
    /// Create a monitor over one slot's subtrees.
    ///
    /// The data directory must exist; its canonical path is used to match
    /// the physical paths resolved from file descriptors.
    pub fn new(dirs: SlotDirs) -> Result<Self> {
        let data_root = fs::canonicalize(&dirs.data)?;
        Ok(Self {
            dirs,
            data_root,
            state: Mutex::new(MonitorState::default()),
        })
    }

    /// A new file has been created on descriptor `fd`
    pub fn on_create(&self, fd: RawFd) -> Result<()> {
        let mut state = self.lock();
        let result = self
            .fd_path(&mut state, fd)
            .and_then(|path| self.track_create(&mut state, &path));
        self.report(fd, "create", result)
    }

    /// A file has been opened; `truncate` carries the `O_TRUNC` flag
    pub fn on_open(&self, fd: RawFd, truncate: bool) -> Result<()> {
        let mut state = self.lock();
        let result = self.fd_path(&mut state, fd).and_then(|path| {
            if !self.track_existing(&mut state, &path)? {
                return Ok(());
            }
            if truncate {
                // Truncate-on-open overwrites everything: preserve the
                // whole pre-image before the flag takes effect
                let len = tracked_length(&state, &path);
                self.cache_range(&mut state, &path, 0, len)?;
            }
            Ok(())
        });
        self.report(fd, "open", result)
    }

    /// A write of `length` bytes at `offset` is about to land on `fd`
    pub fn on_write(&self, fd: RawFd, offset: u64, length: u64) -> Result<()> {
        let mut state = self.lock();
        let result = self.fd_path(&mut state, fd).and_then(|path| {
            if self.track_existing(&mut state, &path)? {
                self.cache_range(&mut state, &path, offset, length)?;
            }
            Ok(())
        });
        self.report(fd, "write", result)
    }

    /// `fd` is about to be truncated to `new_size`
    pub fn on_truncate(&self, fd: RawFd, new_size: u64) -> Result<()> {
        let mut state = self.lock();
        let result = self.fd_path(&mut state, fd).and_then(|path| {
            if !self.track_existing(&mut state, &path)? {
                return Ok(());
            }
            let original = tracked_length(&state, &path);
            if new_size < original {
                self.cache_range(&mut state, &path, 0, original)?;
            } else if new_size > original {
                // Growth leaves the pre-image bytes intact, but rollback
                // must still truncate back to the original length
                self.cache_range(&mut state, &path, new_size, 0)?;
            }
            Ok(())
        });
        self.report(fd, "truncate", result)
    }

    /// `old` is about to be renamed to `new`
    pub fn on_rename(&self, old: &Path, new: &Path) -> Result<()> {
        let mut state = self.lock();
        let result = self
            .track_delete(&mut state, old)
            .and_then(|()| self.track_create(&mut state, new));
        if let Err(e) = &result {
            warn!(old = %old.display(), new = %new.display(), error = %e, "rename event failed");
        }
        result
    }

    /// `path` is about to be deleted
    pub fn on_delete(&self, path: &Path) -> Result<()> {
        let mut state = self.lock();
        let result = self.track_delete(&mut state, path);
        if let Err(e) = &result {
            warn!(path = %path.display(), error = %e, "delete event failed");
        }
        result
    }

    /// Descriptor `fd` has been closed
    pub fn on_close(&self, fd: RawFd) -> Result<()> {
        let mut state = self.lock();
        if let Some(path) = state.fd_paths.remove(&fd) {
            let still_open = state.fd_paths.values().any(|p| p == &path);
            if !still_open
                && let Some(fi) = state.tracked.get_mut(&path)
            {
                // Tracking (and the cached-block set) survives; only the
                // descriptors are released
                fi.close_caching_fds();
            }
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MonitorState> {
        self.state.lock().expect("monitor mutex poisoned")
    }

    fn report(&self, fd: RawFd, event: &str, result: Result<()>) -> Result<()> {
        if let Err(e) = &result {
            warn!(fd, event, error = %e, "monitor event failed");
        }
        result
    }

    /// Relative path of an absolute path under the data root, or `None`
    /// (with a debug log) when it lies outside the monitored tree
    fn rel_of(&self, path: &Path) -> Option<String> {
        let rel = crate::layout::rel_from(path, &self.data_root);
        if rel.is_none() {
            debug!(path = %path.display(), "event outside data tree, ignoring");
        }
        rel
    }

    /// Resolve `fd` to its physical path, caching the answer
    fn fd_path(&self, state: &mut MonitorState, fd: RawFd) -> Result<PathBuf> {
        if let Some(path) = state.fd_paths.get(&fd) {
            return Ok(path.clone());
        }
        let path = fs::read_link(format!("/proc/self/fd/{fd}"))?;
        state.fd_paths.insert(fd, path.clone());
        Ok(path)
    }

    /// Record a file created this session.
    ///
    /// A path already tracked (it was deleted earlier this session) re-uses
    /// its slot: the frozen cache stays authoritative for rollback, while
    /// the new-file entry makes rollback delete the recreated file first.
    fn track_create(&self, state: &mut MonitorState, path: &Path) -> Result<()> {
        let Some(rel) = self.rel_of(path) else {
            return Ok(());
        };

        state
            .tracked
            .entry(path.to_path_buf())
            .and_modify(|fi| fi.is_new = true)
            .or_insert_with(TrackedFile::new_file);

        fs::create_dir_all(&self.dirs.delta)?;
        let mut index = open_append(&self.dirs.new_index())?;
        append_index_line(&mut index, &rel)?;
        debug!(rel, "tracking new file");
        Ok(())
    }

    /// Ensure a tracking record exists for a pre-existing file; returns
    /// `false` for paths outside the data tree
    fn track_existing(&self, state: &mut MonitorState, path: &Path) -> Result<bool> {
        if state.tracked.contains_key(path) {
            return Ok(true);
        }
        if self.rel_of(path).is_none() {
            return Ok(false);
        }
        let original_length = fs::metadata(path)?.len();
        state
            .tracked
            .insert(path.to_path_buf(), TrackedFile::existing(original_length));
        debug!(path = %path.display(), original_length, "tracking existing file");
        Ok(true)
    }

    /// Handle a deletion: a new file only needs its index entry removed,
    /// a pre-existing file is fully preserved before the unlink proceeds
    fn track_delete(&self, state: &mut MonitorState, path: &Path) -> Result<()> {
        let Some(rel) = self.rel_of(path) else {
            return Ok(());
        };
        if !self.track_existing(state, path)? {
            return Ok(());
        }

        let is_new = state.tracked.get(path).is_some_and(|fi| fi.is_new);
        if is_new {
            remove_index_line(&self.dirs.new_index(), &rel)?;
            state.tracked.remove(path);
            debug!(rel, "untracked new file on delete");
        } else {
            let original = tracked_length(state, path);
            self.cache_range(state, path, 0, original)?;
            if let Some(fi) = state.tracked.get_mut(path) {
                // Nothing further can be cached for this path
                fi.close_caching_fds();
            }
        }
        Ok(())
    }

    /// Preserve the pre-image blocks overlapped by `[offset, offset+length)`,
    /// clipped to the original extent; each block is cached at most once.
    ///
    /// The file is registered in `idxtouched.idx` (and its `.bindex` header
    /// written) even when the clipped range is empty: a zero-length
    /// pre-image or a pure extension caches no blocks, but rollback still
    /// has to truncate the file back.
    fn cache_range(
        &self,
        state: &mut MonitorState,
        path: &Path,
        offset: u64,
        length: u64,
    ) -> Result<()> {
        let Some(rel) = self.rel_of(path) else {
            return Ok(());
        };

        let MonitorState {
            tracked,
            created_cache_dirs,
            touched_index,
            ..
        } = state;
        let Some(fi) = tracked.get_mut(path) else {
            return Ok(());
        };

        if fi.is_new || fi.fully_cached() {
            return Ok(());
        }

        self.prepare_caching(fi, &rel, created_cache_dirs)?;

        if !fi.touched_recorded {
            let index = match touched_index {
                Some(index) => index,
                None => touched_index.insert(open_append(&self.dirs.touched_index())?),
            };
            append_index_line(index, &rel)?;
            fi.touched_recorded = true;
        }

        let Some((start, end)) = clipped_span(offset, length, fi.original_length) else {
            return Ok(());
        };

        for blockno in start..=end {
            if fi.cached_blocks.contains(&blockno) {
                continue;
            }

            let read = fi
                .read_fd
                .as_ref()
                .ok_or_else(|| eyre!("pre-image reader not prepared for {rel}"))?;
            let block = read_block_padded(read, blockno)?;

            let cache_offset = fi.cached_blocks.len() as u64 * BLOCK_SIZE;
            fi.cache_fd
                .as_mut()
                .ok_or_else(|| eyre!("block cache not prepared for {rel}"))?
                .write_all(&block)?;

            let entry = BlockIndexEntry {
                blockno,
                cache_offset,
                hash: TreeHash::block(u64::from(blockno) * BLOCK_SIZE, &block),
            };
            append_index_entry(
                fi.index_fd
                    .as_mut()
                    .ok_or_else(|| eyre!("block index not prepared for {rel}"))?,
                &entry,
            )?;

            fi.cached_blocks.insert(blockno);
            debug!(rel, blockno, cache_offset, "pre-image block cached");
        }

        Ok(())
    }

    /// Open the caching descriptors for a tracked file: the pre-image
    /// reader, the `.bcache` and `.bindex` appenders, and the index header.
    /// Idempotent; lazily creates changeset subdirectories.
    fn prepare_caching(
        &self,
        fi: &mut TrackedFile,
        rel: &str,
        created_dirs: &mut HashSet<PathBuf>,
    ) -> Result<()> {
        if fi.read_fd.is_some() {
            return Ok(());
        }

        // The reader must be opened before the mutation lands; it serves
        // every pre-image read for this file
        fi.read_fd = Some(File::open(self.dirs.data_path(rel))?);

        let bcache = self.dirs.bcache_path(rel);
        if let Some(parent) = bcache.parent()
            && created_dirs.insert(parent.to_path_buf())
        {
            fs::create_dir_all(parent)?;
        }
        fi.cache_fd = Some(open_append(&bcache)?);

        let mut index = open_append(&self.dirs.bindex_path(rel))?;
        // The header goes in exactly once, even if the descriptors were
        // closed and reopened mid-session
        if index.metadata()?.len() == 0 {
            write_index_header(&mut index, fi.original_length)?;
        }
        fi.index_fd = Some(index);

        Ok(())
    }
}

fn tracked_length(state: &MonitorState, path: &Path) -> u64 {
    state
        .tracked
        .get(path)
        .map_or(0, |fi| fi.original_length)
}
