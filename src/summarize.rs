//! External summarization/scoring port. One HTTP implementation against an
//! OpenAI-style chat-completions endpoint; when no endpoint is configured the
//! port is simply absent and callers stay fully local.

use anyhow::{Context, Result};
use std::time::Duration;

use crate::config::SummarizerConfig;
use crate::models::{is_lesson_id, ContextRecord, Lesson};

const MAX_PROMPT_LESSONS: usize = 50;

pub struct Summarizer {
    config: SummarizerConfig,
    client: reqwest::Client,
}

impl Summarizer {
    /// `None` when the config has no summarizer block — offline mode.
    pub fn from_config(config: Option<&SummarizerConfig>) -> Option<Summarizer> {
        let config = config?.clone();
        Some(Summarizer {
            client: reqwest::Client::new(),
            config,
        })
    }

    async fn complete(&self, prompt: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.config.model,
            "messages": [ { "role": "user", "content": prompt } ],
            "temperature": 0,
        });

        let mut req = self
            .client
            .post(&self.config.url)
            .header(
                "User-Agent",
                concat!("claude-recall/", env!("CARGO_PKG_VERSION")),
            )
            .json(&body);
        if let Some(env_name) = &self.config.api_key_env {
            if let Ok(key) = std::env::var(env_name) {
                req = req.header("Authorization", format!("Bearer {key}"));
            }
        }

        let deadline = Duration::from_secs(self.config.timeout_secs);
        let resp = tokio::time::timeout(deadline, req.send())
            .await
            .map_err(|_| anyhow::anyhow!("summarizer call exceeded {}s", deadline.as_secs()))?
            .with_context(|| format!("failed to reach {}", self.config.url))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("summarizer returned {status}: {body}"));
        }
        let v: serde_json::Value = resp.json().await.context("invalid JSON from summarizer")?;
        v["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow::anyhow!("summarizer reply has no content"))
    }

    /// Score each lesson 0–10 for relevance to the query.
    pub async fn score_lessons(
        &self,
        query: &str,
        lessons: &[Lesson],
    ) -> Result<Vec<(String, u8)>> {
        let prompt = build_score_prompt(query, lessons);
        let reply = self.complete(&prompt).await?;
        let scores = parse_score_reply(&reply);
        if scores.is_empty() {
            return Err(anyhow::anyhow!("summarizer reply had no usable scores"));
        }
        Ok(scores)
    }

    /// Distill a transcript tail into a handoff context record.
    pub async fn extract_context(&self, transcript_tail: &str) -> Result<ContextRecord> {
        let prompt = build_context_prompt(transcript_tail);
        let reply = self.complete(&prompt).await?;
        parse_context_reply(&reply).ok_or_else(|| anyhow::anyhow!("unusable context reply"))
    }
}

fn build_score_prompt(query: &str, lessons: &[Lesson]) -> String {
    let mut prompt = String::from(
        "Score each lesson 0-10 for relevance to the query. \
         Reply with only a JSON object mapping lesson id to integer score.\n\n",
    );
    prompt.push_str(&format!("Query: {query}\n\nLessons:\n"));
    for lesson in lessons.iter().take(MAX_PROMPT_LESSONS) {
        prompt.push_str(&format!(
            "{}: {} — {}\n",
            lesson.id, lesson.title, lesson.content
        ));
    }
    prompt
}

fn build_context_prompt(transcript_tail: &str) -> String {
    format!(
        "Summarize this coding-session transcript tail for a handoff to a \
         future session. Reply with only a JSON object with keys: \
         summary (string), critical_files (array of paths), \
         recent_changes (array of strings), learnings (array of strings), \
         blockers (array of strings).\n\nTranscript:\n{transcript_tail}"
    )
}

/// Tolerates replies wrapped in markdown code fences.
fn strip_fences(reply: &str) -> &str {
    let trimmed = reply.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.trim_start().strip_suffix("```").unwrap_or(inner).trim()
}

fn parse_score_reply(reply: &str) -> Vec<(String, u8)> {
    let Ok(v) = serde_json::from_str::<serde_json::Value>(strip_fences(reply)) else {
        return Vec::new();
    };
    let Some(map) = v.as_object() else {
        return Vec::new();
    };
    map.iter()
        .filter(|(id, _)| is_lesson_id(id))
        .filter_map(|(id, score)| {
            let score = score.as_u64().or_else(|| {
                // Some models reply with floats.
                score.as_f64().map(|f| f.round().max(0.0) as u64)
            })?;
            Some((id.clone(), score.min(10) as u8))
        })
        .collect()
}

fn parse_context_reply(reply: &str) -> Option<ContextRecord> {
    let record: ContextRecord = serde_json::from_str(strip_fences(reply)).ok()?;
    if record.is_empty() {
        return None;
    }
    Some(record)
}
