use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::{Config, Paths};
use crate::lock::FileLock;
use crate::store::{atomic_write, read_or_empty};

const CLEANUP_MAX_AGE_DAYS: i64 = 7;
const CLEANUP_SAMPLE: usize = 10;

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct OffsetEntry {
    pub offset: u64,
    #[serde(default)]
    pub transcript_path: String,
    #[serde(default)]
    pub updated: Option<DateTime<Utc>>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct SessionLink {
    pub handoff_id: String,
    #[serde(default)]
    pub transcript_path: String,
}

/// Byte offsets per session plus the session→handoff link, both as small
/// JSON maps in the state dir. A corrupt file resets to empty — the data is
/// rebuildable and a hook must keep going.
pub struct CheckpointStore {
    offsets_path: PathBuf,
    map_path: PathBuf,
    lock_timeout: Duration,
}

impl CheckpointStore {
    pub fn new(paths: &Paths, config: &Config) -> Self {
        CheckpointStore {
            offsets_path: paths.offsets(),
            map_path: paths.session_map(),
            lock_timeout: Duration::from_secs(config.lock_timeout_secs),
        }
    }

    fn read_map<T: for<'de> Deserialize<'de>>(path: &Path) -> BTreeMap<String, T> {
        let Ok(content) = read_or_empty(path) else {
            return BTreeMap::new();
        };
        if content.is_empty() {
            return BTreeMap::new();
        }
        match serde_json::from_str(&content) {
            Ok(map) => map,
            Err(e) => {
                eprintln!(
                    "[claude-recall] resetting corrupt state file {} ({e})",
                    path.display()
                );
                BTreeMap::new()
            }
        }
    }

    pub fn offset(&self, session_id: &str) -> u64 {
        Self::read_map::<OffsetEntry>(&self.offsets_path)
            .get(session_id)
            .map(|e| e.offset)
            .unwrap_or(0)
    }

    pub fn set_offset(&self, session_id: &str, offset: u64, transcript_path: &str) -> Result<()> {
        let _guard = FileLock::acquire(&self.offsets_path, self.lock_timeout)?;
        let mut map = Self::read_map::<OffsetEntry>(&self.offsets_path);
        map.insert(
            session_id.to_string(),
            OffsetEntry {
                offset,
                transcript_path: transcript_path.to_string(),
                updated: Some(Utc::now()),
            },
        );
        atomic_write(&self.offsets_path, &serde_json::to_string_pretty(&map)?)
    }

    /// True the first time a session shows up (no stored offset yet).
    pub fn is_new_session(&self, session_id: &str) -> bool {
        !Self::read_map::<OffsetEntry>(&self.offsets_path).contains_key(session_id)
    }

    pub fn session_handoff(&self, session_id: &str) -> Option<String> {
        Self::read_map::<SessionLink>(&self.map_path)
            .get(session_id)
            .map(|l| l.handoff_id.clone())
    }

    pub fn link_session_handoff(
        &self,
        session_id: &str,
        handoff_id: &str,
        transcript_path: &str,
    ) -> Result<()> {
        let _guard = FileLock::acquire(&self.map_path, self.lock_timeout)?;
        let mut map = Self::read_map::<SessionLink>(&self.map_path);
        map.insert(
            session_id.to_string(),
            SessionLink {
                handoff_id: handoff_id.to_string(),
                transcript_path: transcript_path.to_string(),
            },
        );
        atomic_write(&self.map_path, &serde_json::to_string_pretty(&map)?)
    }

    /// Drop offset entries whose transcript vanished and whose last update is
    /// old. Bounded to a small sample per invocation — this runs
    /// opportunistically inside hooks.
    pub fn cleanup(&self) -> Result<usize> {
        let _guard = FileLock::acquire(&self.offsets_path, self.lock_timeout)?;
        let mut map = Self::read_map::<OffsetEntry>(&self.offsets_path);
        let cutoff = Utc::now() - chrono::Duration::days(CLEANUP_MAX_AGE_DAYS);

        let candidates: Vec<String> = map
            .iter()
            .take(CLEANUP_SAMPLE)
            .filter(|(_, entry)| {
                let old = entry.updated.map(|u| u < cutoff).unwrap_or(true);
                let gone = entry.transcript_path.is_empty()
                    || !Path::new(&entry.transcript_path).exists();
                old && gone
            })
            .map(|(sid, _)| sid.clone())
            .collect();

        for sid in &candidates {
            map.remove(sid);
        }
        if !candidates.is_empty() {
            atomic_write(&self.offsets_path, &serde_json::to_string_pretty(&map)?)?;
        }
        Ok(candidates.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &Path) -> CheckpointStore {
        let paths = Paths::at(&dir.join("project"), &dir.join("state"));
        CheckpointStore::new(&paths, &Config::default())
    }

    #[test]
    fn missing_session_reads_zero() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        assert_eq!(store.offset("nope"), 0);
        assert!(store.is_new_session("nope"));
    }

    #[test]
    fn set_and_get_offset() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store.set_offset("s1", 4096, "/tmp/t.jsonl").unwrap();
        assert_eq!(store.offset("s1"), 4096);
        assert!(!store.is_new_session("s1"));
        store.set_offset("s1", 8192, "/tmp/t.jsonl").unwrap();
        assert_eq!(store.offset("s1"), 8192);
    }

    #[test]
    fn corrupt_offsets_file_resets_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        std::fs::create_dir_all(dir.path().join("state")).unwrap();
        std::fs::write(dir.path().join("state/transcript_offsets.json"), "{oops").unwrap();
        assert_eq!(store.offset("s1"), 0);
        // Writing after corruption succeeds and starts fresh.
        store.set_offset("s1", 10, "/tmp/t.jsonl").unwrap();
        assert_eq!(store.offset("s1"), 10);
    }

    #[test]
    fn session_handoff_link_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        assert!(store.session_handoff("s1").is_none());
        store
            .link_session_handoff("s1", "hf-0a1b2c3", "/tmp/t.jsonl")
            .unwrap();
        assert_eq!(store.session_handoff("s1").as_deref(), Some("hf-0a1b2c3"));
    }

    #[test]
    fn cleanup_removes_only_old_orphans() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let live = dir.path().join("live.jsonl");
        std::fs::write(&live, "x").unwrap();

        // Old entry with a vanished transcript — removable.
        let mut map: BTreeMap<String, OffsetEntry> = BTreeMap::new();
        map.insert(
            "old-gone".into(),
            OffsetEntry {
                offset: 1,
                transcript_path: dir.path().join("gone.jsonl").display().to_string(),
                updated: Some(Utc::now() - chrono::Duration::days(30)),
            },
        );
        // Old entry whose transcript still exists — kept.
        map.insert(
            "old-live".into(),
            OffsetEntry {
                offset: 2,
                transcript_path: live.display().to_string(),
                updated: Some(Utc::now() - chrono::Duration::days(30)),
            },
        );
        // Fresh orphan — kept.
        map.insert(
            "new-gone".into(),
            OffsetEntry {
                offset: 3,
                transcript_path: dir.path().join("gone2.jsonl").display().to_string(),
                updated: Some(Utc::now()),
            },
        );
        std::fs::create_dir_all(dir.path().join("state")).unwrap();
        std::fs::write(
            dir.path().join("state/transcript_offsets.json"),
            serde_json::to_string(&map).unwrap(),
        )
        .unwrap();

        assert_eq!(store.cleanup().unwrap(), 1);
        assert_eq!(store.offset("old-live"), 2);
        assert_eq!(store.offset("new-gone"), 3);
        assert_eq!(store.offset("old-gone"), 0);
    }
}
