//! Durable watermark persistence.
//!
//! The cursor file holds the relay's resume point: an RFC 3339 timestamp for
//! the timestamp strategy, a decimal frame index for the sequence strategy.
//! The relocation strategy has no cursor file at all; directory membership is
//! its state.
//!
//! Loading never hard-fails: a missing or unreadable cursor means "start
//! fresh from now" so a new deployment does not replay the whole backlog.
//! Saving replaces the previous value atomically (write temp, then rename) so
//! a crashed writer can never leave a half-written cursor behind.

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::Watermark;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CursorKind {
    Timestamp,
    Sequence,
}

/// Loads and saves the watermark for one stream.
#[derive(Debug)]
pub struct CursorStore {
    path: PathBuf,
    kind: CursorKind,
}

impl CursorStore {
    /// Cursor for the timestamp-poll strategy.
    pub fn timestamp(path: PathBuf) -> Self {
        Self {
            path,
            kind: CursorKind::Timestamp,
        }
    }

    /// Cursor for the sequence-poll strategy.
    pub fn sequence(path: PathBuf) -> Self {
        Self {
            path,
            kind: CursorKind::Sequence,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted watermark, falling back to a fresh start when the
    /// cursor file is absent, unreadable, or unparseable.
    ///
    /// A fresh timestamp cursor is "now": files already on disk are treated
    /// as history, not backlog. A fresh sequence cursor is 0, so the first
    /// frame published is `frame_00000001.jpg`.
    pub fn load(&self) -> Watermark {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!(
                    "no cursor file at {}; starting fresh from this point",
                    self.path.display()
                );
                return self.fresh();
            }
            Err(e) => {
                log::warn!(
                    "could not read cursor file {}: {}; starting fresh",
                    self.path.display(),
                    e
                );
                return self.fresh();
            }
        };

        match self.parse(raw.trim()) {
            Ok(watermark) => watermark,
            Err(e) => {
                log::warn!(
                    "could not parse cursor file {}: {}; starting fresh",
                    self.path.display(),
                    e
                );
                self.fresh()
            }
        }
    }

    /// Persist the watermark, fully replacing the previous value.
    ///
    /// Writes to a sibling temp file and renames over the cursor so a
    /// concurrent or crashed reader sees either the old or the new value,
    /// never a torn write.
    pub fn save(&self, watermark: &Watermark) -> Result<()> {
        let rendered = self.render(watermark)?;
        let mut tmp = self.path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        std::fs::write(&tmp, rendered.as_bytes())
            .with_context(|| format!("failed to write cursor temp file {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path).with_context(|| {
            format!("failed to replace cursor file {}", self.path.display())
        })?;
        Ok(())
    }

    fn fresh(&self) -> Watermark {
        match self.kind {
            CursorKind::Timestamp => Watermark::Timestamp(SystemTime::now()),
            CursorKind::Sequence => Watermark::Sequence(0),
        }
    }

    fn parse(&self, raw: &str) -> Result<Watermark> {
        match self.kind {
            CursorKind::Timestamp => {
                let parsed = DateTime::parse_from_rfc3339(raw)
                    .with_context(|| format!("invalid RFC 3339 timestamp {raw:?}"))?;
                Ok(Watermark::Timestamp(SystemTime::from(
                    parsed.with_timezone(&Utc),
                )))
            }
            CursorKind::Sequence => {
                let index: u64 = raw
                    .parse()
                    .with_context(|| format!("invalid frame index {raw:?}"))?;
                Ok(Watermark::Sequence(index))
            }
        }
    }

    fn render(&self, watermark: &Watermark) -> Result<String> {
        match (self.kind, watermark) {
            (CursorKind::Timestamp, Watermark::Timestamp(at)) => {
                let dt: DateTime<Utc> = (*at).into();
                Ok(dt.to_rfc3339_opts(SecondsFormat::Nanos, true))
            }
            (CursorKind::Sequence, Watermark::Sequence(index)) => Ok(index.to_string()),
            (_, other) => Err(anyhow::anyhow!(
                "watermark {other:?} does not match cursor kind {:?}",
                self.kind
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn absent_timestamp_cursor_starts_from_now() {
        let dir = tempdir().expect("tempdir");
        let store = CursorStore::timestamp(dir.path().join("publisher.state.timestamp"));

        let before = SystemTime::now();
        let loaded = store.load();
        let after = SystemTime::now();

        match loaded {
            Watermark::Timestamp(at) => {
                assert!(at >= before && at <= after);
            }
            other => panic!("unexpected watermark {other:?}"),
        }
    }

    #[test]
    fn absent_sequence_cursor_starts_at_zero() {
        let dir = tempdir().expect("tempdir");
        let store = CursorStore::sequence(dir.path().join("publisher.state.sequence"));
        assert_eq!(store.load(), Watermark::Sequence(0));
    }

    #[test]
    fn timestamp_round_trips_with_nanosecond_precision() {
        let dir = tempdir().expect("tempdir");
        let store = CursorStore::timestamp(dir.path().join("publisher.state.timestamp"));

        let at = SystemTime::UNIX_EPOCH + Duration::new(1_700_000_000, 123_456_789);
        store.save(&Watermark::Timestamp(at)).expect("save");
        assert_eq!(store.load(), Watermark::Timestamp(at));
    }

    #[test]
    fn sequence_round_trips() {
        let dir = tempdir().expect("tempdir");
        let store = CursorStore::sequence(dir.path().join("publisher.state.sequence"));

        store.save(&Watermark::Sequence(42)).expect("save");
        assert_eq!(store.load(), Watermark::Sequence(42));
    }

    #[test]
    fn corrupt_cursor_falls_back_to_fresh() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("publisher.state.timestamp");
        std::fs::write(&path, "not a timestamp").expect("write");

        let store = CursorStore::timestamp(path);
        assert!(matches!(store.load(), Watermark::Timestamp(_)));

        let path = dir.path().join("publisher.state.sequence");
        std::fs::write(&path, "-5").expect("write");
        let store = CursorStore::sequence(path);
        assert_eq!(store.load(), Watermark::Sequence(0));
    }

    #[test]
    fn save_replaces_prior_value_and_leaves_no_temp() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("publisher.state.sequence");
        let store = CursorStore::sequence(path.clone());

        store.save(&Watermark::Sequence(1)).expect("save");
        store.save(&Watermark::Sequence(2)).expect("save");

        assert_eq!(std::fs::read_to_string(&path).expect("read"), "2");
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        assert!(!PathBuf::from(tmp).exists());
    }

    #[test]
    fn save_rejects_mismatched_watermark_kind() {
        let dir = tempdir().expect("tempdir");
        let store = CursorStore::timestamp(dir.path().join("publisher.state.timestamp"));
        assert!(store.save(&Watermark::Sequence(1)).is_err());
    }
}
