//! Checkpoint controller: freeze the live changeset into history
//!
//! A checkpoint converts the in-progress changeset into history slot `-1`
//! after aging every existing history slot down by one. Only changeset
//! directories move; the live slot's `data`/`bhmaps`/`htree` stay where
//! they are and keep describing the current state. History deeper than
//! the ring allows is deleted.

use std::fs;
use std::io;

use color_eyre::Result;
use tracing::{debug, info};

use crate::layout::{MAX_CHECKPOINTS, StateRoot};

/// Freeze the current changeset as the most recent checkpoint.
///
/// After this the live changeset is empty: the session's recorded history
/// starts over, and a rollback would undo only changes made from now on.
pub fn create_checkpoint(root: &StateRoot) -> Result<()> {
    // Age existing history, oldest first so no rename collides
    let slots = root.history_slots()?;
    for &slot in slots.iter().rev() {
        let target = root.delta_dir(slot - 1);
        fs::create_dir_all(root.slot_dir(slot - 1))?;
        fs::rename(root.delta_dir(slot), target)?;
        debug!(slot, "changeset aged");
    }

    // The live changeset becomes slot -1; an empty placeholder keeps the
    // live slot structure intact
    fs::create_dir_all(root.slot_dir(-1))?;
    let live_delta = root.delta_dir(0);
    if live_delta.exists() {
        fs::rename(&live_delta, root.delta_dir(-1))?;
    } else {
        fs::create_dir_all(root.delta_dir(-1))?;
    }
    fs::create_dir_all(&live_delta)?;

    // Prune history that aged out of the ring
    let expired = root.slot_dir(-(MAX_CHECKPOINTS + 1));
    match fs::remove_dir_all(&expired) {
        Ok(()) => debug!(slot = -(MAX_CHECKPOINTS + 1), "expired checkpoint deleted"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    info!("checkpoint created");
    Ok(())
}
