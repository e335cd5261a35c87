//! Sequence-poll detection.
//!
//! For producers that guarantee dense sequential naming
//! (`frame_00000001.jpg`, `frame_00000002.jpg`, ...). The detector returns
//! the run of consecutive files starting at `watermark + 1` and stops at the
//! first gap; a missing next file means "wait for the producer", never
//! "skip ahead". Strict no-gap ordering holds by construction.
//!
//! This strategy is intended for tight debugging loops: the relay treats a
//! publish failure as fatal under it, since silently skipping a frame is
//! worse than stopping.

use anyhow::{anyhow, Context, Result};
use std::path::PathBuf;

use super::ChangeDetector;
use crate::{sequence_file_name, FrameRef, OrderingKey, Watermark};

pub struct SequencePoll {
    frames_dir: PathBuf,
    stream: String,
}

impl SequencePoll {
    pub fn new(frames_dir: PathBuf, stream: String) -> Self {
        Self { frames_dir, stream }
    }
}

impl ChangeDetector for SequencePoll {
    fn detect(&mut self, watermark: &Watermark) -> Result<Vec<FrameRef>> {
        let last = match watermark {
            Watermark::Sequence(n) => *n,
            other => return Err(anyhow!("sequence detector handed a {other:?} watermark")),
        };

        // Surface an unreadable directory as a retryable error instead of
        // quietly reporting "no next frame" forever.
        std::fs::read_dir(&self.frames_dir).with_context(|| {
            format!("could not read frames directory {}", self.frames_dir.display())
        })?;

        let mut frames = Vec::new();
        let mut next = last + 1;
        loop {
            let path = self.frames_dir.join(sequence_file_name(next));
            if !path.is_file() {
                break;
            }
            frames.push(FrameRef {
                path,
                stream: self.stream.clone(),
                key: OrderingKey::Sequence(next),
            });
            next += 1;
        }
        Ok(frames)
    }
}
