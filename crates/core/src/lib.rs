//! rollfs-core: Checkpointed, rollback-capable state tracking
//!
//! Provides the three subsystems behind a rollback-capable data directory:
//! - the copy-on-write [`StateMonitor`], fed mutation events by an external
//!   filesystem interception layer, preserving pre-image blocks into an
//!   append-only changeset
//! - the XOR-folded hash tree ([`HashTreeBuilder`]) summarizing the data
//!   tree with content-addressed file hashes
//! - the restore engine ([`rollback`]) and checkpoint ring
//!   ([`create_checkpoint`]) that freeze and replay changesets

pub mod bhmap;
pub mod block;
pub mod changeset;
pub mod checkpoint;
pub mod config;
pub mod hash;
pub mod htree;
pub mod layout;
pub mod monitor;
pub mod restore;
pub mod status;
pub mod verify;

pub use bhmap::{BlockHashMap, FileHashBuilder};
pub use block::BLOCK_SIZE;
pub use changeset::{BlockIndex, BlockIndexEntry};
pub use checkpoint::create_checkpoint;
pub use config::StateConfig;
pub use hash::TreeHash;
pub use htree::HashTreeBuilder;
pub use layout::{MAX_CHECKPOINTS, SlotDirs, StateRoot};
pub use monitor::StateMonitor;
pub use restore::rollback;
pub use status::{ChangesetSummary, summarize};
pub use verify::{VerifyReport, verify_tree};
