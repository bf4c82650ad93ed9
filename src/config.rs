use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::models::Level;

/// Returns the user's home directory as a `PathBuf`.
pub fn home_dir() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()))
}

/// State directory for system-tier and per-machine files.
/// `CLAUDE_RECALL_STATE` overrides; otherwise the XDG state dir.
pub fn state_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("CLAUDE_RECALL_STATE") {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    dirs::state_dir()
        .unwrap_or_else(|| home_dir().join(".local/state"))
        .join("claude-recall")
}

/// Project root: `PROJECT_DIR` if set, otherwise the nearest ancestor of the
/// working directory containing `.git`, otherwise the working directory.
pub fn project_dir(cwd: Option<&str>) -> PathBuf {
    if let Ok(dir) = std::env::var("PROJECT_DIR") {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    let start = cwd
        .map(PathBuf::from)
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."));
    let mut dir = start.as_path();
    loop {
        if dir.join(".git").exists() {
            return dir.to_path_buf();
        }
        match dir.parent() {
            Some(parent) => dir = parent,
            None => return start,
        }
    }
}

/// Debug verbosity from `CLAUDE_RECALL_DEBUG` (0–3, default 0).
pub fn debug_level() -> u8 {
    std::env::var("CLAUDE_RECALL_DEBUG")
        .ok()
        .and_then(|s| s.parse().ok())
        .map(|n: u8| n.min(3))
        .unwrap_or(0)
}

/// Session id: hook payload value wins, then `CLAUDE_RECALL_SESSION`.
pub fn session_id(from_payload: Option<&str>) -> Option<String> {
    from_payload
        .map(|s| s.to_string())
        .or_else(|| std::env::var("CLAUDE_RECALL_SESSION").ok())
        .filter(|s| !s.is_empty())
}

/// Every file the engine reads or writes, resolved once per invocation.
#[derive(Clone, Debug)]
pub struct Paths {
    pub project: PathBuf,
    pub state: PathBuf,
}

impl Paths {
    pub fn resolve(cwd: Option<&str>) -> Self {
        Paths {
            project: project_dir(cwd).join(".claude-recall"),
            state: state_dir(),
        }
    }

    /// Rooted at explicit directories — used by tests.
    pub fn at(project: &Path, state: &Path) -> Self {
        Paths {
            project: project.to_path_buf(),
            state: state.to_path_buf(),
        }
    }

    pub fn lessons(&self, level: Level) -> PathBuf {
        match level {
            Level::Project => self.project.join("LESSONS.md"),
            Level::System => self.state.join("LESSONS.md"),
        }
    }

    pub fn handoffs(&self, stealth: bool) -> PathBuf {
        if stealth {
            self.project.join("HANDOFFS_LOCAL.md")
        } else {
            self.project.join("HANDOFFS.md")
        }
    }

    pub fn handoffs_archive(&self) -> PathBuf {
        self.project.join("HANDOFFS_ARCHIVE.md")
    }

    pub fn session_snapshot(&self) -> PathBuf {
        self.project.join(".session-snapshot")
    }

    pub fn config_file(&self) -> PathBuf {
        self.project.join("config.json")
    }

    pub fn offsets(&self) -> PathBuf {
        self.state.join("transcript_offsets.json")
    }

    pub fn session_map(&self) -> PathBuf {
        self.state.join("session-handoffs.json")
    }

    pub fn relevance_cache(&self) -> PathBuf {
        self.state.join("relevance-cache.json")
    }

    pub fn decay_state(&self) -> PathBuf {
        self.state.join("decay-state.json")
    }

    pub fn journal(&self) -> PathBuf {
        self.state.join("recall.log.jsonl")
    }
}

fn default_enabled() -> bool {
    true
}
fn default_stale_days() -> i64 {
    60
}
fn default_decay_interval_days() -> i64 {
    7
}
fn default_jaccard_threshold() -> f64 {
    0.8
}
fn default_top_n() -> usize {
    5
}
fn default_lock_timeout_secs() -> u64 {
    5
}
fn default_hook_timeout_secs() -> u64 {
    30
}
fn default_summarizer_timeout_secs() -> u64 {
    30
}

fn default_theme_keywords() -> Vec<String> {
    ["guard", "plugin", "ui", "fix", "refactor", "test"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Project-level `config.json`. Missing file or missing keys fall back to
/// defaults; a malformed file is treated as missing (the engine must never
/// refuse to run because of a bad config).
#[derive(Deserialize, Clone, Debug)]
pub struct Config {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_stale_days")]
    pub stale_days: i64,
    #[serde(default = "default_decay_interval_days")]
    pub decay_interval_days: i64,
    #[serde(default = "default_jaccard_threshold")]
    pub jaccard_threshold: f64,
    #[serde(default = "default_theme_keywords")]
    pub theme_keywords: Vec<String>,
    #[serde(default = "default_top_n")]
    pub top_n: usize,
    #[serde(default = "default_lock_timeout_secs")]
    pub lock_timeout_secs: u64,
    #[serde(default = "default_hook_timeout_secs")]
    pub hook_timeout_secs: u64,
    #[serde(default)]
    pub summarizer: Option<SummarizerConfig>,
}

#[derive(Deserialize, Clone, Debug)]
pub struct SummarizerConfig {
    pub url: String,
    pub model: String,
    /// Name of the environment variable holding the API key, not the key
    /// itself — config.json may be committed.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_summarizer_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            enabled: default_enabled(),
            stale_days: default_stale_days(),
            decay_interval_days: default_decay_interval_days(),
            jaccard_threshold: default_jaccard_threshold(),
            theme_keywords: default_theme_keywords(),
            top_n: default_top_n(),
            lock_timeout_secs: default_lock_timeout_secs(),
            hook_timeout_secs: default_hook_timeout_secs(),
            summarizer: None,
        }
    }
}

impl Config {
    pub fn load(paths: &Paths) -> Self {
        let Ok(content) = std::fs::read_to_string(paths.config_file()) else {
            return Config::default();
        };
        match serde_json::from_str(&content) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("[claude-recall] warning: config.json is invalid ({e}); using defaults");
                Config::default()
            }
        }
    }
}
