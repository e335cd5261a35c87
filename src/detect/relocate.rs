//! Event-notify detection with file relocation.
//!
//! Watches a `pending/` subdirectory for create/write notifications. Each
//! notification for a regular file becomes a one-frame detection result;
//! after the publish is handed to the broker the file is moved into `done/`.
//! The move is the durable equivalent of advancing a watermark: a file can
//! only be detected while it sits in `pending/`, and the rename physically
//! takes it out of that set. Renames within one filesystem are atomic, so
//! two handlers can never both own the same file.
//!
//! Files already sitting in `pending/` at startup are swept into a backlog
//! and drained before any notification is handled; membership in `pending/`
//! means unpublished, whether or not this process saw the file appear.

use anyhow::{Context, Result};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError};
use std::time::Duration;

use super::ChangeDetector;
use crate::{FrameRef, OrderingKey, Watermark};

pub struct RelocateWatch {
    pending_dir: PathBuf,
    done_dir: PathBuf,
    stream: String,
    backlog: VecDeque<PathBuf>,
    rx: Receiver<notify::Result<notify::Event>>,
    // Dropping the watcher stops the notification stream.
    _watcher: RecommendedWatcher,
    /// How long one `detect` call blocks waiting for a notification before
    /// reporting an empty snapshot back to the relay loop.
    wait: Duration,
}

impl RelocateWatch {
    pub fn new(
        pending_dir: PathBuf,
        done_dir: PathBuf,
        stream: String,
        wait: Duration,
    ) -> Result<Self> {
        std::fs::create_dir_all(&pending_dir).with_context(|| {
            format!("could not create pending directory {}", pending_dir.display())
        })?;
        std::fs::create_dir_all(&done_dir)
            .with_context(|| format!("could not create done directory {}", done_dir.display()))?;

        let (tx, rx) = channel();
        let mut watcher =
            notify::recommended_watcher(tx).context("could not create filesystem watcher")?;
        watcher
            .watch(&pending_dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("could not watch {}", pending_dir.display()))?;

        let backlog = sweep_pending(&pending_dir)?;
        if !backlog.is_empty() {
            log::info!(
                "found {} file(s) already pending in {}",
                backlog.len(),
                pending_dir.display()
            );
        }

        Ok(Self {
            pending_dir,
            done_dir,
            stream,
            backlog,
            rx,
            _watcher: watcher,
            wait,
        })
    }

    fn frame_for(&self, path: PathBuf) -> Option<FrameRef> {
        // Notifications about the pending directory itself, about files that
        // already moved on, or about anything that is not a regular file are
        // all no-ops.
        if path == self.pending_dir || !path.is_file() {
            return None;
        }
        let name = path.file_name()?.to_string_lossy().into_owned();
        Some(FrameRef {
            path,
            stream: self.stream.clone(),
            key: OrderingKey::Name(name),
        })
    }
}

impl ChangeDetector for RelocateWatch {
    fn detect(&mut self, _watermark: &Watermark) -> Result<Vec<FrameRef>> {
        while let Some(path) = self.backlog.pop_front() {
            if let Some(frame) = self.frame_for(path) {
                return Ok(vec![frame]);
            }
        }

        match self.rx.recv_timeout(self.wait) {
            Ok(Ok(event)) => {
                if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                    return Ok(Vec::new());
                }
                let mut frames: Vec<FrameRef> = event
                    .paths
                    .into_iter()
                    .filter_map(|path| self.frame_for(path))
                    .collect();
                frames.sort_by(|a, b| a.path.file_name().cmp(&b.path.file_name()));
                Ok(frames)
            }
            Ok(Err(e)) => {
                log::warn!("filesystem watch error on {}: {}", self.pending_dir.display(), e);
                Ok(Vec::new())
            }
            Err(RecvTimeoutError::Timeout) => Ok(Vec::new()),
            Err(RecvTimeoutError::Disconnected) => Err(anyhow::anyhow!(
                "filesystem watcher for {} stopped delivering events",
                self.pending_dir.display()
            )),
        }
    }

    fn recheck(&mut self, frame: &mut FrameRef, _watermark: &Watermark) -> Result<bool> {
        // A duplicate notification for a file that already moved to done/
        // fails this check and is dropped silently.
        Ok(frame.path.is_file())
    }

    /// Move the file from pending/ to done/. This is the durable state
    /// change; it may land before the broker acknowledges the message
    /// (detached mode), trading a small duplicate-publish window under
    /// crash for lower latency.
    fn mark_published(&mut self, frame: &FrameRef) -> Result<()> {
        let name = frame
            .path
            .file_name()
            .ok_or_else(|| anyhow::anyhow!("frame path {} has no file name", frame.path.display()))?;
        let target = self.done_dir.join(name);
        match std::fs::rename(&frame.path, &target) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Another handler won the rename; the file is already done.
                log::debug!("{} already relocated", frame.path.display());
                Ok(())
            }
            Err(e) => Err(e).with_context(|| {
                format!(
                    "could not move {} to {}",
                    frame.path.display(),
                    target.display()
                )
            }),
        }
    }

    /// A frame that failed to publish stays in pending/, but its
    /// notification is already consumed and the filesystem will not fire
    /// another one. Queue the path again so a later cycle re-offers it.
    fn requeue(&mut self, frame: FrameRef) {
        self.backlog.push_back(frame.path);
    }

    fn waits_for_events(&self) -> bool {
        true
    }
}

fn sweep_pending(pending_dir: &std::path::Path) -> Result<VecDeque<PathBuf>> {
    let entries = std::fs::read_dir(pending_dir).with_context(|| {
        format!("could not read pending directory {}", pending_dir.display())
    })?;
    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .collect();
    paths.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(paths.into())
}
