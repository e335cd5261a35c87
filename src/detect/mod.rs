//! Change-detection strategies.
//!
//! This module provides the three interchangeable ways of deciding which
//! frame files are new and in what order they publish:
//! - `timestamp`: poll the frames directory, keep files modified strictly
//!   after the watermark, sort by filename.
//! - `sequence`: poll for the single next file in a dense `frame_%08d.jpg`
//!   numbering; gaps mean wait.
//! - `relocate`: filesystem notifications on a `pending/` subdirectory; the
//!   post-publish move into `done/` is the durable state.
//!
//! All strategies satisfy the same contract: `detect` returns a fresh,
//! finite, ordered snapshot, and never a frame whose ordering key is not
//! strictly greater than the watermark. The relay loop never branches on
//! which strategy is active beyond configuration-time selection.

pub mod relocate;
pub mod sequence;
pub mod timestamp;

pub use relocate::RelocateWatch;
pub use sequence::SequencePoll;
pub use timestamp::TimestampPoll;

use anyhow::Result;

use crate::{FrameRef, Watermark};

/// One detection strategy, as seen by the relay loop.
pub trait ChangeDetector {
    /// Snapshot of unpublished frames, ordered, strictly after `watermark`.
    ///
    /// An unreadable source directory is a retryable error: the caller logs
    /// it, skips this cycle, and leaves the watermark untouched. Zero new
    /// frames is an empty vec, not an error.
    fn detect(&mut self, watermark: &Watermark) -> Result<Vec<FrameRef>>;

    /// Re-validate a frame immediately before publishing. May refresh the
    /// ordering key (the timestamp strategy re-stats here to close the race
    /// between listing and publishing). Returning false skips this frame
    /// only; the rest of the batch still runs.
    fn recheck(&mut self, _frame: &mut FrameRef, _watermark: &Watermark) -> Result<bool> {
        Ok(true)
    }

    /// Durable "done" side effect after the publish was accepted. The
    /// relocation strategy moves the file out of `pending/` here; the
    /// polling strategies rely on the cursor file instead and do nothing.
    fn mark_published(&mut self, _frame: &FrameRef) -> Result<()> {
        Ok(())
    }

    /// Hand back a frame that was detected but not published, so a later
    /// cycle re-offers it. The polling strategies re-detect anything still
    /// ahead of the watermark and can drop the frame here; the relocation
    /// strategy has no watermark to fall back on and no second notification
    /// coming, so it must keep the frame queued.
    fn requeue(&mut self, _frame: FrameRef) {}

    /// True when `detect` blocks internally on an event source, so the relay
    /// loop must not add its own inter-cycle sleep.
    fn waits_for_events(&self) -> bool {
        false
    }
}
