//! Newline-delimited pose history journal (§4.9 `HistoryJournal`).
//!
//! One JSON object per line, stamped with the write time. Used both as
//! the sink for `PoseEstimator`'s mutation events and, at startup, to
//! recover the last known pose when no plan start pose is configured.
//! Write failures never propagate to the caller — a missing or
//! unwritable journal degrades to "no history", not a crash.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;
use types::PoseSeed;

#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("history io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("history serialize error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Append-only, newline-delimited JSON record store at `path`.
pub struct HistoryJournal {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl HistoryJournal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serializes `event`, stamps it with the current UTC time, and
    /// appends one line. Swallows and logs failures rather than
    /// returning them, per the journal's "never disturbs live control"
    /// contract.
    pub fn append<T: Serialize>(&self, event: &T) {
        if let Err(err) = self.try_append(event) {
            warn!(%err, path = %self.path.display(), "history append failed");
        }
    }

    fn try_append<T: Serialize>(&self, event: &T) -> Result<(), HistoryError> {
        let mut value = serde_json::to_value(event)?;
        if let Value::Object(ref mut map) = value {
            map.insert("ts".to_string(), Value::String(Utc::now().to_rfc3339()));
        }
        let mut line = serde_json::to_string(&value)?;
        line.push('\n');

        let mut slot = self.file.lock().unwrap();
        if slot.is_none() {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            *slot = Some(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.path)?,
            );
        }
        let file = slot.as_mut().expect("opened above");
        file.write_all(line.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    /// Truncates the journal to empty. Unlike `append`, failures are
    /// surfaced: clearing is an explicit user action, not a passive sink
    /// write.
    pub fn clear(&self) -> Result<(), HistoryError> {
        let mut slot = self.file.lock().unwrap();
        *slot = None;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        Ok(())
    }

    /// Scans from the end of the journal for the first record carrying
    /// `x_mm`, `y_mm`, and `theta_deg`. Returns `None` on a missing file,
    /// an empty journal, or any read/parse failure — callers fall back
    /// to the plan's start pose in all of those cases.
    pub fn last_pose(&self) -> Option<PoseSeed> {
        let file = File::open(&self.path).ok()?;
        let lines: Vec<String> = BufReader::new(file).lines().collect::<Result<_, _>>().ok()?;
        for line in lines.iter().rev() {
            if let Some(pose) = parse_pose_line(line) {
                return Some(pose);
            }
        }
        None
    }
}

fn parse_pose_line(line: &str) -> Option<PoseSeed> {
    let value: Value = serde_json::from_str(line).ok()?;
    let object = value.as_object()?;
    let x_mm = object.get("x_mm")?.as_f64()?;
    let y_mm = object.get("y_mm")?.as_f64()?;
    let theta_deg = object.get("theta_deg")?.as_f64()?;
    Some(PoseSeed { x_mm, y_mm, theta_deg })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Serialize)]
    struct TestEvent {
        event: &'static str,
        x_mm: f64,
        y_mm: f64,
        theta_deg: f64,
    }

    fn temp_path() -> PathBuf {
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        let unique = COUNTER.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!("history_journal_test_{}_{unique}.jsonl", std::process::id()))
    }

    #[test]
    fn append_then_last_pose_round_trips() {
        let journal = HistoryJournal::new(temp_path());
        journal.append(&TestEvent { event: "reset", x_mm: 10.0, y_mm: 20.0, theta_deg: 90.0 });
        journal.append(&TestEvent { event: "step", x_mm: 15.0, y_mm: 25.0, theta_deg: 95.0 });

        let pose = journal.last_pose().expect("a pose");
        assert_eq!(pose.x_mm, 15.0);
        assert_eq!(pose.y_mm, 25.0);
        assert_eq!(pose.theta_deg, 95.0);
    }

    #[test]
    fn missing_file_reports_no_pose() {
        let journal = HistoryJournal::new("/nonexistent/path/history.jsonl");
        assert!(journal.last_pose().is_none());
    }

    #[test]
    fn clear_truncates_and_removes_prior_records() {
        let path = temp_path();
        let journal = HistoryJournal::new(&path);
        journal.append(&TestEvent { event: "reset", x_mm: 1.0, y_mm: 2.0, theta_deg: 3.0 });
        assert!(journal.last_pose().is_some());

        journal.clear().expect("clear succeeds");
        assert!(journal.last_pose().is_none());

        journal.append(&TestEvent { event: "reset", x_mm: 4.0, y_mm: 5.0, theta_deg: 6.0 });
        assert_eq!(journal.last_pose().unwrap().x_mm, 4.0);
    }

    #[test]
    fn malformed_trailing_line_falls_back_to_an_earlier_record() {
        let path = temp_path();
        std::fs::write(&path, "{\"event\":\"reset\",\"x_mm\":1.0,\"y_mm\":2.0,\"theta_deg\":3.0}\nnot json\n").unwrap();
        let journal = HistoryJournal::new(&path);
        let pose = journal.last_pose().expect("earlier valid record");
        assert_eq!(pose.x_mm, 1.0);
    }
}
