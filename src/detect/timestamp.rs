//! Timestamp-poll detection.
//!
//! Lists the frames directory and keeps entries whose modification time is
//! strictly after the timestamp watermark, sorted by filename (producers
//! name files in production order, so name order is chronological order).
//!
//! Known startup behavior, kept on purpose: with no cursor file the
//! watermark initializes to "now", so frames already on disk are treated as
//! history and never replayed. A fresh deployment does not flood the broker
//! with backlog.

use anyhow::{anyhow, Context, Result};
use std::path::PathBuf;
use std::time::SystemTime;

use super::ChangeDetector;
use crate::{FrameRef, OrderingKey, Watermark};

pub struct TimestampPoll {
    frames_dir: PathBuf,
    stream: String,
}

impl TimestampPoll {
    pub fn new(frames_dir: PathBuf, stream: String) -> Self {
        Self { frames_dir, stream }
    }

    fn watermark_instant(watermark: &Watermark) -> Result<SystemTime> {
        match watermark {
            Watermark::Timestamp(at) => Ok(*at),
            other => Err(anyhow!(
                "timestamp detector handed a {other:?} watermark"
            )),
        }
    }
}

impl ChangeDetector for TimestampPoll {
    fn detect(&mut self, watermark: &Watermark) -> Result<Vec<FrameRef>> {
        let since = Self::watermark_instant(watermark)?;

        let entries = std::fs::read_dir(&self.frames_dir).with_context(|| {
            format!("could not read frames directory {}", self.frames_dir.display())
        })?;

        let mut frames = Vec::new();
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    log::warn!(
                        "could not read entry in {}: {}",
                        self.frames_dir.display(),
                        e
                    );
                    continue;
                }
            };
            let path = entry.path();
            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(e) => {
                    log::warn!("could not stat {}: {}", path.display(), e);
                    continue;
                }
            };
            if metadata.is_dir() {
                continue;
            }
            let mtime = match metadata.modified() {
                Ok(mtime) => mtime,
                Err(e) => {
                    log::warn!("no modification time for {}: {}", path.display(), e);
                    continue;
                }
            };
            if mtime > since {
                frames.push(FrameRef {
                    path,
                    stream: self.stream.clone(),
                    key: OrderingKey::Modified(mtime),
                });
            }
        }

        frames.sort_by(|a, b| a.path.file_name().cmp(&b.path.file_name()));
        Ok(frames)
    }

    /// Re-stat right before publishing. The mtime observed here is the one
    /// the watermark advances to, and a file whose mtime is no longer after
    /// the watermark (or that vanished) is skipped rather than republished.
    fn recheck(&mut self, frame: &mut FrameRef, watermark: &Watermark) -> Result<bool> {
        let since = Self::watermark_instant(watermark)?;
        let metadata = match std::fs::metadata(&frame.path) {
            Ok(metadata) => metadata,
            Err(e) => {
                log::warn!(
                    "could not stat {} right before publishing: {}",
                    frame.path.display(),
                    e
                );
                return Ok(false);
            }
        };
        let mtime = metadata
            .modified()
            .with_context(|| format!("no modification time for {}", frame.path.display()))?;
        if mtime <= since {
            return Ok(false);
        }
        frame.key = OrderingKey::Modified(mtime);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    fn detect_names(detector: &mut TimestampPoll, watermark: &Watermark) -> Vec<String> {
        detector
            .detect(watermark)
            .expect("detect")
            .into_iter()
            .map(|f| f.path.file_name().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn stale_files_are_ignored_on_fresh_start() {
        let dir = tempdir().expect("tempdir");
        for i in 1..=5 {
            std::fs::write(dir.path().join(format!("frame_{i:08}.jpg")), b"jpeg").unwrap();
        }

        // Cursor absent => watermark is "now", which postdates every file
        // already on disk. Intentional: fresh deployments skip backlog.
        let watermark = Watermark::Timestamp(SystemTime::now() + Duration::from_secs(1));
        let mut detector = TimestampPoll::new(dir.path().to_path_buf(), "cam0".into());
        assert!(detect_names(&mut detector, &watermark).is_empty());
    }

    #[test]
    fn new_files_come_back_sorted_by_name() {
        let dir = tempdir().expect("tempdir");
        // create out of name order; mtimes are all after the watermark
        for name in ["frame_00000003.jpg", "frame_00000001.jpg", "frame_00000002.jpg"] {
            std::fs::write(dir.path().join(name), b"jpeg").unwrap();
        }

        let watermark = Watermark::Timestamp(SystemTime::now() - Duration::from_secs(60));
        let mut detector = TimestampPoll::new(dir.path().to_path_buf(), "cam0".into());
        assert_eq!(
            detect_names(&mut detector, &watermark),
            vec![
                "frame_00000001.jpg",
                "frame_00000002.jpg",
                "frame_00000003.jpg"
            ]
        );
    }

    #[test]
    fn subdirectories_are_skipped() {
        let dir = tempdir().expect("tempdir");
        std::fs::create_dir(dir.path().join("done")).unwrap();
        std::fs::write(dir.path().join("frame_00000001.jpg"), b"jpeg").unwrap();

        let watermark = Watermark::Timestamp(SystemTime::now() - Duration::from_secs(60));
        let mut detector = TimestampPoll::new(dir.path().to_path_buf(), "cam0".into());
        assert_eq!(
            detect_names(&mut detector, &watermark),
            vec!["frame_00000001.jpg"]
        );
    }

    #[test]
    fn unreadable_directory_is_a_retryable_error() {
        let dir = tempdir().expect("tempdir");
        let missing = dir.path().join("nope");
        let mut detector = TimestampPoll::new(missing, "cam0".into());
        let watermark = Watermark::Timestamp(SystemTime::now());
        assert!(detector.detect(&watermark).is_err());
    }

    #[test]
    fn recheck_refreshes_key_and_rejects_raced_frames() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("frame_00000001.jpg");
        std::fs::write(&path, b"jpeg").unwrap();
        let mtime = std::fs::metadata(&path).unwrap().modified().unwrap();

        let mut detector = TimestampPoll::new(dir.path().to_path_buf(), "cam0".into());
        let mut frame = FrameRef {
            path: path.clone(),
            stream: "cam0".into(),
            key: OrderingKey::Modified(mtime),
        };

        // watermark behind the file: accepted, key refreshed from disk
        let behind = Watermark::Timestamp(mtime - Duration::from_secs(1));
        assert!(detector.recheck(&mut frame, &behind).expect("recheck"));
        assert_eq!(frame.key, OrderingKey::Modified(mtime));

        // watermark already at the file's mtime: the frame was published by
        // this very process between listing and publishing
        let caught_up = Watermark::Timestamp(mtime);
        assert!(!detector.recheck(&mut frame, &caught_up).expect("recheck"));

        // vanished file: skip, not an error
        std::fs::remove_file(&path).unwrap();
        assert!(!detector.recheck(&mut frame, &behind).expect("recheck"));
    }
}
