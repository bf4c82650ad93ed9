//! Structured JSONL diagnostics. The journal is a single bounded file:
//! records append under the store lock guard, and once the file crosses its
//! size cap the oldest records age out in place. No rotation, no sidecar
//! files to clean up.

use anyhow::{Context, Result};
use serde::Serialize;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use crate::config;
use crate::lock::{self, FileLock};
use crate::store::atomic_write;

/// Soft cap on the journal; crossing it trims back to the newest half.
const MAX_JOURNAL_BYTES: u64 = 5 * 1024 * 1024;
const TRIM_TARGET_BYTES: usize = (MAX_JOURNAL_BYTES / 2) as usize;
/// Diagnostics are best-effort; a contended journal is skipped, not waited on.
const LOCK_WAIT: Duration = Duration::from_millis(500);

/// Severity of a journal record, gated by `CLAUDE_RECALL_DEBUG`:
/// errors always land, warnings at ≥1, info at ≥2, trace at ≥3.
#[derive(Serialize, Clone, Copy, PartialEq, Debug)]
#[serde(rename_all = "snake_case")]
pub enum JLevel {
    Error,
    Warn,
    Info,
    Trace,
}

impl JLevel {
    fn min_debug(self) -> u8 {
        match self {
            JLevel::Error => 0,
            JLevel::Warn => 1,
            JLevel::Info => 2,
            JLevel::Trace => 3,
        }
    }
}

#[derive(Serialize)]
struct JournalRecord<'a> {
    timestamp: String,
    level: JLevel,
    event: &'a str,
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    fields: serde_json::Value,
}

/// Append one structured record to the journal. Failures are swallowed —
/// diagnostics must never take a hook down with them.
pub fn log(journal_path: &Path, level: JLevel, event: &str, fields: serde_json::Value) {
    if config::debug_level() < level.min_debug() {
        return;
    }
    let record = JournalRecord {
        timestamp: chrono::Utc::now().to_rfc3339(),
        level,
        event,
        fields,
    };
    if let Err(e) = append_record(&record, journal_path) {
        if !lock::is_contended(&e) {
            eprintln!("[claude-recall] journal error: {e}");
        }
    }
}

pub fn error(journal_path: &Path, event: &str, fields: serde_json::Value) {
    log(journal_path, JLevel::Error, event, fields);
}

pub fn warn(journal_path: &Path, event: &str, fields: serde_json::Value) {
    log(journal_path, JLevel::Warn, event, fields);
}

pub fn info(journal_path: &Path, event: &str, fields: serde_json::Value) {
    log(journal_path, JLevel::Info, event, fields);
}

pub fn trace(journal_path: &Path, event: &str, fields: serde_json::Value) {
    log(journal_path, JLevel::Trace, event, fields);
}

fn append_record(record: &impl Serialize, journal_path: &Path) -> Result<()> {
    if let Some(parent) = journal_path.parent() {
        if !parent.exists() {
            std::fs::create_dir_all(parent).context("creating journal directory")?;
        }
    }

    let mut line = serde_json::to_string(record).context("serializing journal record")?;
    line.push('\n');

    let _guard = FileLock::acquire(journal_path, LOCK_WAIT)?;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(journal_path)
        .context("opening journal file")?;
    file.write_all(line.as_bytes())?;
    file.flush()?;
    drop(file);

    let size = std::fs::metadata(journal_path).map(|m| m.len()).unwrap_or(0);
    if size > MAX_JOURNAL_BYTES {
        trim(journal_path)?;
    }
    Ok(())
}

/// Shrink the journal in place, keeping only the newest records. The guard is
/// already held; the rewrite goes through the same atomic path as every other
/// state file.
fn trim(journal_path: &Path) -> Result<()> {
    let content = std::fs::read_to_string(journal_path).context("reading journal for trim")?;
    atomic_write(journal_path, recent_tail(&content, TRIM_TARGET_BYTES))
}

/// The suffix of `content` that fits in `target` bytes, aligned to the next
/// line start so every surviving record is complete.
fn recent_tail(content: &str, target: usize) -> &str {
    if content.len() <= target {
        return content;
    }
    let bytes = content.as_bytes();
    let mut cut = content.len() - target;
    while cut < bytes.len() && bytes[cut - 1] != b'\n' {
        cut += 1;
    }
    &content[cut..]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    struct TestRecord {
        event: String,
    }

    #[test]
    fn append_writes_valid_json_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recall.log.jsonl");
        let record = TestRecord {
            event: "cite".into(),
        };

        append_record(&record, &path).unwrap();
        append_record(&record, &path).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let parsed: serde_json::Value = serde_json::from_str(line).unwrap();
            assert_eq!(parsed["event"], "cite");
        }
    }

    #[test]
    fn append_fails_for_directory_path() {
        let dir = tempfile::tempdir().unwrap();
        let record = TestRecord { event: "x".into() };
        assert!(append_record(&record, dir.path()).is_err());
    }

    #[test]
    fn recent_tail_keeps_whole_newest_lines() {
        let content = "first record\nsecond record\nthird record\n";
        // Target lands inside "second record" — only "third record" fits whole.
        let tail = recent_tail(content, 20);
        assert_eq!(tail, "third record\n");
        assert!(tail.len() <= 20);
    }

    #[test]
    fn recent_tail_short_content_is_untouched() {
        let content = "only line\n";
        assert_eq!(recent_tail(content, 1024), content);
    }

    #[test]
    fn recent_tail_without_newline_in_window_drops_everything() {
        let content = "one very long unterminated record";
        assert_eq!(recent_tail(content, 10), "");
    }

    #[test]
    fn trim_drops_a_record_the_target_splits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recall.log.jsonl");

        // One oversized old record followed by a handful of fresh ones; the
        // cut lands inside the old record, so only the fresh ones survive.
        let mut content = format!("{{\"event\":\"old\",\"pad\":\"{}\"}}\n", "x".repeat(3 * 1024 * 1024));
        for i in 0..5 {
            content.push_str(&format!("{{\"event\":\"fresh-{i}\"}}\n"));
        }
        std::fs::write(&path, &content).unwrap();

        trim(&path).unwrap();

        let trimmed = std::fs::read_to_string(&path).unwrap();
        assert!(trimmed.len() <= TRIM_TARGET_BYTES);
        let lines: Vec<&str> = trimmed.lines().collect();
        assert_eq!(lines.len(), 5);
        for (i, line) in lines.iter().enumerate() {
            let parsed: serde_json::Value = serde_json::from_str(line).unwrap();
            assert_eq!(parsed["event"], format!("fresh-{i}"));
        }
    }

    #[test]
    fn error_level_always_passes_gate() {
        assert_eq!(JLevel::Error.min_debug(), 0);
        assert_eq!(JLevel::Trace.min_debug(), 3);
    }
}
