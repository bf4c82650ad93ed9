use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

use crate::config::{Config, Paths};
use crate::lock::FileLock;
use crate::models::Lesson;
use crate::store::{atomic_write, read_or_empty};
use crate::summarize::Summarizer;

const K1: f64 = 1.5;
const B: f64 = 0.75;
const MIN_TOKEN_LEN: usize = 2;
const CACHE_TTL_DAYS: i64 = 7;

const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "from", "has", "have", "if",
    "in", "into", "is", "it", "its", "no", "not", "of", "on", "or", "so", "than", "that", "the",
    "their", "then", "there", "these", "this", "to", "was", "we", "were", "when", "which", "will",
    "with", "you", "your",
];

/// Fixed namespace for deriving stable cache keys via UUID v5 (SHA-1).
/// Changing this value would invalidate every existing cache entry.
const RECALL_NAMESPACE: Uuid = Uuid::from_bytes([
    0x5e, 0x11, 0xa7, 0x2f, 0x9c, 0x44, 0x4d, 0x1b, 0x8e, 0x3d, 0x60, 0x2a, 0x4f, 0x91, 0xbc,
    0x0d,
]);

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredLesson {
    pub lesson: Lesson,
    pub score: u8,
}

/// Lowercase, split on non-alphanumerics, drop stop-words and short tokens.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= MIN_TOKEN_LEN && !STOP_WORDS.contains(t))
        .map(|t| t.to_string())
        .collect()
}

/// BM25 over the current corpus, normalized to integers 0–10 by max-score
/// scaling. Deterministic for a given (corpus, query); an empty query scores
/// everything 0. Ties break by lesson uses, and only the top result may hold
/// a 10.
pub fn bm25_rank(lessons: &[Lesson], query: &str) -> Vec<ScoredLesson> {
    let query_terms = tokenize(query);

    let docs: Vec<Vec<String>> = lessons
        .iter()
        .map(|l| tokenize(&format!("{} {}", l.title, l.content)))
        .collect();
    let n = docs.len() as f64;
    let avgdl = if docs.is_empty() {
        0.0
    } else {
        docs.iter().map(|d| d.len() as f64).sum::<f64>() / n
    };

    // Document frequency per query term, then per-invocation IDF.
    let mut idf: HashMap<&str, f64> = HashMap::new();
    for term in &query_terms {
        let df = docs
            .iter()
            .filter(|d| d.iter().any(|t| t == term))
            .count() as f64;
        idf.insert(term.as_str(), ((n - df + 0.5) / (df + 0.5) + 1.0).ln());
    }

    let mut raw: Vec<(usize, f64)> = docs
        .iter()
        .enumerate()
        .map(|(i, doc)| {
            let dl = doc.len() as f64;
            let mut score = 0.0;
            for term in &query_terms {
                let tf = doc.iter().filter(|t| *t == term).count() as f64;
                if tf == 0.0 {
                    continue;
                }
                let denom = tf + K1 * (1.0 - B + B * dl / avgdl.max(1e-9));
                score += idf[term.as_str()] * tf * (K1 + 1.0) / denom;
            }
            (i, score)
        })
        .collect();

    raw.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| lessons[b.0].uses.cmp(&lessons[a.0].uses))
    });

    let max = raw.first().map(|(_, s)| *s).unwrap_or(0.0);
    let mut out: Vec<ScoredLesson> = raw
        .into_iter()
        .map(|(i, score)| {
            let scaled = if max > 0.0 {
                (score / max * 10.0).round() as u8
            } else {
                0
            };
            ScoredLesson {
                lesson: lessons[i].clone(),
                score: scaled,
            }
        })
        .collect();

    // Max scaling can tie several lessons at 10; keep the top slot unique.
    for scored in out.iter_mut().skip(1) {
        if scored.score == 10 {
            scored.score = 9;
        }
    }
    out
}

pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    intersection / union
}

/// Identity of the current lesson corpus: stable hash of the sorted ID set.
pub fn corpus_fingerprint(lessons: &[Lesson]) -> String {
    let mut ids: Vec<&str> = lessons.iter().map(|l| l.id.as_str()).collect();
    ids.sort_unstable();
    Uuid::new_v5(&RECALL_NAMESPACE, ids.join(",").as_bytes()).to_string()
}

fn cache_key(query_tokens: &[String], fingerprint: &str) -> String {
    let material = format!("{}#{fingerprint}", query_tokens.join(" "));
    Uuid::new_v5(&RECALL_NAMESPACE, material.as_bytes()).to_string()
}

#[derive(Serialize, Deserialize, Clone, Debug)]
struct CacheEntry {
    query_tokens: Vec<String>,
    fingerprint: String,
    scores: Vec<(String, u8)>,
    created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Default)]
struct CacheFile {
    entries: BTreeMap<String, CacheEntry>,
}

/// Persistent external-scorer cache. Exact hits match the key; near hits
/// reuse an entry whose query tokens overlap enough on the same corpus.
pub struct RelevanceCache {
    path: PathBuf,
    jaccard_threshold: f64,
    lock_timeout: Duration,
}

impl RelevanceCache {
    pub fn new(paths: &Paths, config: &Config) -> Self {
        RelevanceCache {
            path: paths.relevance_cache(),
            jaccard_threshold: config.jaccard_threshold,
            lock_timeout: Duration::from_secs(config.lock_timeout_secs),
        }
    }

    fn load(&self) -> CacheFile {
        let Ok(content) = read_or_empty(&self.path) else {
            return CacheFile::default();
        };
        if content.is_empty() {
            return CacheFile::default();
        }
        serde_json::from_str(&content).unwrap_or_else(|e| {
            eprintln!("[claude-recall] resetting corrupt relevance cache ({e})");
            CacheFile::default()
        })
    }

    fn fresh(entry: &CacheEntry) -> bool {
        Utc::now() - entry.created_at < chrono::Duration::days(CACHE_TTL_DAYS)
    }

    pub fn lookup(&self, query_tokens: &[String], fingerprint: &str) -> Option<Vec<(String, u8)>> {
        let file = self.load();
        let key = cache_key(query_tokens, fingerprint);
        if let Some(entry) = file.entries.get(&key) {
            if Self::fresh(entry) {
                return Some(entry.scores.clone());
            }
        }

        // Fuzzy pass: near-duplicate queries against the same corpus.
        let wanted: BTreeSet<String> = query_tokens.iter().cloned().collect();
        file.entries
            .values()
            .filter(|e| e.fingerprint == fingerprint && Self::fresh(e))
            .find(|e| {
                let theirs: BTreeSet<String> = e.query_tokens.iter().cloned().collect();
                jaccard(&wanted, &theirs) >= self.jaccard_threshold
            })
            .map(|e| e.scores.clone())
    }

    /// Insert and evict everything past the TTL.
    pub fn store(
        &self,
        query_tokens: &[String],
        fingerprint: &str,
        scores: Vec<(String, u8)>,
    ) -> Result<()> {
        let _guard = FileLock::acquire(&self.path, self.lock_timeout)?;
        let mut file = self.load();
        file.entries.retain(|_, e| Self::fresh(e));
        file.entries.insert(
            cache_key(query_tokens, fingerprint),
            CacheEntry {
                query_tokens: query_tokens.to_vec(),
                fingerprint: fingerprint.to_string(),
                scores,
                created_at: Utc::now(),
            },
        );
        atomic_write(&self.path, &serde_json::to_string_pretty(&file)?)
    }
}

/// Rank lessons for a query: external scorer through the cache when
/// available, BM25 otherwise or on any failure.
pub async fn rank_lessons(
    lessons: &[Lesson],
    query: &str,
    summarizer: Option<&Summarizer>,
    cache: &RelevanceCache,
) -> Vec<ScoredLesson> {
    let Some(summarizer) = summarizer else {
        return bm25_rank(lessons, query);
    };
    let query_tokens = tokenize(query);
    if query_tokens.is_empty() {
        return bm25_rank(lessons, query);
    }
    let fingerprint = corpus_fingerprint(lessons);

    if let Some(scores) = cache.lookup(&query_tokens, &fingerprint) {
        return apply_scores(lessons, &scores);
    }

    match summarizer.score_lessons(query, lessons).await {
        Ok(scores) => {
            if let Err(e) = cache.store(&query_tokens, &fingerprint, scores.clone()) {
                eprintln!("[claude-recall] relevance cache write failed: {e}");
            }
            apply_scores(lessons, &scores)
        }
        Err(e) => {
            eprintln!("[claude-recall] external scorer unavailable ({e}); using local scores");
            bm25_rank(lessons, query)
        }
    }
}

fn apply_scores(lessons: &[Lesson], scores: &[(String, u8)]) -> Vec<ScoredLesson> {
    let by_id: HashMap<&str, u8> = scores
        .iter()
        .map(|(id, s)| (id.as_str(), (*s).min(10)))
        .collect();
    let mut out: Vec<ScoredLesson> = lessons
        .iter()
        .map(|l| ScoredLesson {
            lesson: l.clone(),
            score: by_id.get(l.id.as_str()).copied().unwrap_or(0),
        })
        .collect();
    out.sort_by(|a, b| {
        b.score
            .cmp(&a.score)
            .then_with(|| b.lesson.uses.cmp(&a.lesson.uses))
    });
    out
}
