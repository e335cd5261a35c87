//! The detect-then-publish relay loop.
//!
//! One cycle walks Idle -> Scanning -> Publishing -> Idle: ask the detector
//! for a snapshot, publish each frame strictly in the returned order, and
//! advance the watermark only after the broker accepted the message. A
//! publish failure ends the batch immediately; the failed frame and every
//! frame after it stay ahead of the watermark and are re-detected next
//! cycle. That single rule gives in-order delivery with no gaps: a later
//! frame is never marked done while an earlier one is unpublished.
//!
//! The loop owns the watermark and the cursor store exclusively; no other
//! component mutates either. There is no terminal state: the loop runs until
//! the shutdown flag is set (or, under the fail-fast policy, until a publish
//! fails).

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::cursor::CursorStore;
use crate::detect::ChangeDetector;
use crate::publish::{PublishGateway, PublishOutcome};
use crate::Watermark;

/// What a publish failure does to the process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Log, drop the rest of the batch, retry next cycle (timestamp and
    /// relocation strategies).
    Retry,
    /// Halt the process (sequence strategy): in a strict-sequence debugging
    /// loop, stopping beats silently skipping.
    Fatal,
}

/// Outcome of one relay cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CycleStatus {
    /// Scan completed; this many frames were published.
    Published(usize),
    /// A publish failed mid-batch after this many successes; the failed
    /// frame and everything behind it retry next cycle.
    BatchFailed(usize),
    /// The scan itself failed; nothing was attempted, watermark untouched.
    ScanFailed,
}

pub struct Relay<D, G> {
    detector: D,
    gateway: G,
    cursor: Option<CursorStore>,
    watermark: Watermark,
    failure_policy: FailurePolicy,
}

impl<D: ChangeDetector, G: PublishGateway> Relay<D, G> {
    pub fn new(
        detector: D,
        gateway: G,
        cursor: Option<CursorStore>,
        watermark: Watermark,
        failure_policy: FailurePolicy,
    ) -> Self {
        Self {
            detector,
            gateway,
            cursor,
            watermark,
            failure_policy,
        }
    }

    pub fn watermark(&self) -> &Watermark {
        &self.watermark
    }

    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    /// Run cycles until `shutdown` is set. `interval` paces the polling
    /// strategies between cycles and paces retries after a failed scan; the
    /// event-driven detector blocks inside `detect` instead.
    pub fn run(&mut self, interval: Duration, shutdown: &AtomicBool) -> Result<()> {
        loop {
            if shutdown.load(Ordering::SeqCst) {
                log::info!("shutdown requested; relay stopping");
                return Ok(());
            }
            let pause = match self.cycle()? {
                // pace retries instead of hammering a failing broker or disk
                CycleStatus::ScanFailed | CycleStatus::BatchFailed(_) => true,
                CycleStatus::Published(_) => !self.detector.waits_for_events(),
            };
            if pause {
                std::thread::sleep(interval);
            }
        }
    }

    /// One detect-then-publish pass. An `Err` here is fatal to the process.
    pub fn cycle(&mut self) -> Result<CycleStatus> {
        let frames = match self.detector.detect(&self.watermark) {
            Ok(frames) => frames,
            Err(e) => {
                log::warn!("could not scan for new frames: {:#}; will retry", e);
                return Ok(CycleStatus::ScanFailed);
            }
        };
        if frames.is_empty() {
            return Ok(CycleStatus::Published(0));
        }
        log::info!("found {} new frame(s)", frames.len());

        let mut published = 0;
        let mut frames = frames.into_iter();
        while let Some(mut frame) = frames.next() {
            match self.detector.recheck(&mut frame, &self.watermark) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    log::warn!("recheck failed for {}: {:#}", frame.path.display(), e);
                    continue;
                }
            }

            match self.gateway.publish(&frame) {
                Ok(PublishOutcome::Confirmed { pkid }) => {
                    log::info!(
                        "published {} (stream {}, broker pkid {})",
                        frame.path.display(),
                        frame.stream,
                        pkid
                    );
                }
                Ok(PublishOutcome::Queued) => {
                    log::info!("queued {} (stream {})", frame.path.display(), frame.stream);
                }
                Err(e) => match self.failure_policy {
                    FailurePolicy::Fatal => {
                        return Err(e).with_context(|| {
                            format!(
                                "publish failed for {} (stream {}) under fail-fast policy",
                                frame.path.display(),
                                frame.stream
                            )
                        });
                    }
                    FailurePolicy::Retry => {
                        log::error!(
                            "failed to publish {} (stream {}): {:#}; will retry next cycle",
                            frame.path.display(),
                            frame.stream,
                            e
                        );
                        // the failed frame and everything behind it go back
                        // to the detector; later frames must not jump the
                        // queue
                        self.detector.requeue(frame);
                        for rest in frames {
                            self.detector.requeue(rest);
                        }
                        return Ok(CycleStatus::BatchFailed(published));
                    }
                },
            }

            if let Err(e) = self.detector.mark_published(&frame) {
                log::error!(
                    "could not mark {} as published: {:#}",
                    frame.path.display(),
                    e
                );
            }
            if self.watermark.advance(&frame.key) {
                if let Some(cursor) = &self.cursor {
                    if let Err(e) = cursor.save(&self.watermark) {
                        log::error!(
                            "could not persist watermark to {}: {:#}; a restart may republish this frame",
                            cursor.path().display(),
                            e
                        );
                    }
                }
            }
            published += 1;
        }
        Ok(CycleStatus::Published(published))
    }
}
