//! frame-relay
//!
//! This crate implements a stateful frame-file relay. A producer drops frame
//! files (one file per video frame) into a per-stream directory on a shared
//! filesystem; the relay detects new files, publishes one broker message per
//! file in production order, and persists a resume point so a restart picks
//! up exactly where the previous process left off.
//!
//! # Guarantees
//!
//! - **At-least-once**: every frame newer than the persisted watermark is
//!   eventually offered to the broker; a crash between publish and watermark
//!   save replays at most the in-flight frame.
//! - **In-order, no-skip**: within a stream, a later frame is never marked
//!   done while an earlier one remains unpublished.
//! - **Monotonic watermark**: the resume point only ever advances, and only
//!   after the broker confirmed delivery.
//!
//! # Module Structure
//!
//! - `cursor`: durable watermark persistence (timestamp or sequence cursor)
//! - `detect`: change-detection strategies behind one `ChangeDetector` trait
//! - `publish`: the MQTT publish gateway (confirmed and detached ack modes)
//! - `relay`: the detect-then-publish relay loop

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

pub mod cursor;
pub mod detect;
pub mod publish;
pub mod relay;

pub use cursor::CursorStore;
pub use detect::{ChangeDetector, RelocateWatch, SequencePoll, TimestampPoll};
pub use publish::{MqttGateway, PublishGateway, PublishOutcome};
pub use relay::{FailurePolicy, Relay};

/// Durable resume point. One variant per detection strategy.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Watermark {
    /// A file is new iff its mtime is strictly after this instant.
    Timestamp(SystemTime),
    /// Index of the last published frame; the next frame is `n + 1`.
    Sequence(u64),
    /// Relocation strategy: membership in pending/ vs done/ IS the state.
    Membership,
}

impl Watermark {
    /// Advance to `key` if it is strictly ahead of the current position.
    /// Returns true when the watermark moved.
    pub fn advance(&mut self, key: &OrderingKey) -> bool {
        match (&mut *self, key) {
            (Watermark::Timestamp(at), OrderingKey::Modified(mtime)) if mtime > at => {
                *at = *mtime;
                true
            }
            (Watermark::Sequence(n), OrderingKey::Sequence(next)) if next > n => {
                *n = *next;
                true
            }
            // Membership has no explicit value to advance; the file move
            // performed by the detector is the durable state change.
            (Watermark::Membership, OrderingKey::Name(_)) => true,
            _ => false,
        }
    }
}

/// Per-frame ordering key. Producers name files in production order, so
/// mtime order, sequence order, and lexical name order are consistent.
#[derive(Clone, Debug, PartialEq)]
pub enum OrderingKey {
    Modified(SystemTime),
    Sequence(u64),
    Name(String),
}

impl OrderingKey {
    /// Strictly after the watermark? Frames at or before it are never
    /// (re-)published.
    pub fn is_after(&self, watermark: &Watermark) -> bool {
        match (self, watermark) {
            (OrderingKey::Modified(mtime), Watermark::Timestamp(at)) => mtime > at,
            (OrderingKey::Sequence(seq), Watermark::Sequence(n)) => seq > n,
            (OrderingKey::Name(_), Watermark::Membership) => true,
            _ => false,
        }
    }
}

/// One file considered for publishing.
#[derive(Clone, Debug)]
pub struct FrameRef {
    pub path: PathBuf,
    pub stream: String,
    pub key: OrderingKey,
}

/// The broker message payload: enough for a consumer to fetch the frame
/// from the shared filesystem without scanning directories itself.
#[derive(Debug, Serialize, Deserialize)]
pub struct FrameMessage {
    pub stream_name: String,
    pub frame_path: String,
}

impl FrameMessage {
    pub fn for_frame(frame: &FrameRef) -> Self {
        Self {
            stream_name: frame.stream.clone(),
            frame_path: frame.path.display().to_string(),
        }
    }
}

/// Canonical name of the frame with the given sequence index.
pub fn sequence_file_name(index: u64) -> String {
    format!("frame_{:08}.jpg", index)
}

/// Filesystem layout for one stream under the shared root.
///
/// `root/<stream>/frames` holds the frame files; the watch strategy splits
/// that into `frames/pending` and `frames/done`. Cursor files live next to
/// the frames directory so they travel with the stream.
#[derive(Clone, Debug)]
pub struct StreamPaths {
    pub stream_dir: PathBuf,
    pub frames_dir: PathBuf,
}

impl StreamPaths {
    pub fn new(root: &Path, stream: &str) -> Self {
        let stream_dir = root.join(stream);
        let frames_dir = stream_dir.join("frames");
        Self {
            stream_dir,
            frames_dir,
        }
    }

    pub fn pending_dir(&self) -> PathBuf {
        self.frames_dir.join("pending")
    }

    pub fn done_dir(&self) -> PathBuf {
        self.frames_dir.join("done")
    }

    pub fn timestamp_cursor(&self) -> PathBuf {
        self.stream_dir.join("publisher.state.timestamp")
    }

    pub fn sequence_cursor(&self) -> PathBuf {
        self.stream_dir.join("publisher.state.sequence")
    }
}
