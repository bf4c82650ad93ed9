//! Assembles the text a hook hands back to the host: ranked lessons, compact
//! handoffs, duty reminders, and an optional continuation block, all within a
//! token budget.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::models::{Handoff, Lesson, Status, StepOutcome};

const BUDGET_WARN_TOKENS: usize = 2000;
const COMPACT_LAST_STEPS: usize = 3;

pub const LESSON_DUTY: &str = "Lesson duty: when you apply a stored lesson, cite it inline as \
[ID]. When you learn a durable correction or pattern, record it with \
`LESSON: <title> - <content>`.";

pub const HANDOFF_DUTY: &str = "Handoff duty: for multi-step work, keep the active handoff \
current — `HANDOFF: <title>` to start one, `HANDOFF UPDATE <id>: tried \
<outcome> - <step>` after each attempt, `HANDOFF COMPLETE <id>` when done.";

/// Estimated tokens, chars/4 — coarse but stable across content kinds.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count() / 4
}

#[derive(Serialize, Debug, PartialEq)]
pub struct BudgetReport {
    pub total: usize,
    pub lessons: usize,
    pub handoffs: usize,
    pub duties: usize,
    pub over_budget: bool,
}

#[derive(Debug)]
pub struct Injection {
    pub text: String,
    pub budget: BudgetReport,
}

pub struct InjectOptions {
    pub top_n: usize,
    pub theme_keywords: Vec<String>,
    pub include_duties: bool,
}

/// Build the full injection. Over budget, the lowest-weight lessons go first,
/// then the duty reminders; records are dropped whole, never truncated
/// mid-record.
pub fn build_injection(
    lessons: &[Lesson],
    handoffs: &[Handoff],
    continuation: Option<&Handoff>,
    opts: &InjectOptions,
) -> Injection {
    let mut picked: Vec<&Lesson> = lessons.iter().collect();
    picked.sort_by(|a, b| {
        b.weight()
            .partial_cmp(&a.weight())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    picked.truncate(opts.top_n);

    let handoff_section = render_handoffs(handoffs, continuation, &opts.theme_keywords);
    let mut include_duties = opts.include_duties;

    loop {
        let lesson_section = render_lessons(&picked);
        let duty_section = if include_duties {
            format!("{LESSON_DUTY}\n{HANDOFF_DUTY}\n")
        } else {
            String::new()
        };

        let lessons_tokens = estimate_tokens(&lesson_section);
        let handoffs_tokens = estimate_tokens(&handoff_section);
        let duties_tokens = estimate_tokens(&duty_section);
        let total = lessons_tokens + handoffs_tokens + duties_tokens;

        if total > BUDGET_WARN_TOKENS {
            if !picked.is_empty() {
                picked.pop();
                continue;
            }
            if include_duties {
                include_duties = false;
                continue;
            }
        }

        let mut text = String::new();
        text.push_str(&lesson_section);
        text.push_str(&handoff_section);
        text.push_str(&duty_section);

        return Injection {
            text,
            budget: BudgetReport {
                total,
                lessons: lessons_tokens,
                handoffs: handoffs_tokens,
                duties: duties_tokens,
                over_budget: total > BUDGET_WARN_TOKENS,
            },
        };
    }
}

fn render_lessons(lessons: &[&Lesson]) -> String {
    if lessons.is_empty() {
        return String::new();
    }
    let mut out = String::from("## Lessons\n");
    for lesson in lessons {
        let content = lesson.content.replace('\n', " ");
        out.push_str(&format!(
            "[{}] {} {} — {}\n",
            lesson.id,
            lesson.stars(),
            lesson.title,
            content
        ));
    }
    out.push('\n');
    out
}

fn render_handoffs(
    handoffs: &[Handoff],
    continuation: Option<&Handoff>,
    theme_keywords: &[String],
) -> String {
    let mut out = String::new();
    let active: Vec<&Handoff> = handoffs
        .iter()
        .filter(|h| h.status != Status::Completed)
        .collect();
    if !active.is_empty() {
        out.push_str("## Active Handoffs\n");
        for h in &active {
            out.push_str(&compact_handoff(h, theme_keywords));
        }
        out.push('\n');
    }
    if let Some(cont) = continuation {
        out.push_str(&format!(
            "## Continue\nResume [{}] {} — phase {}.",
            cont.id,
            cont.title,
            cont.phase.as_str()
        ));
        if !cont.next_steps.is_empty() {
            out.push_str(&format!(" Next: {}", cont.next_steps));
        }
        if !cont.checkpoint.is_empty() {
            out.push_str(&format!(" Checkpoint: {}", cont.checkpoint));
        }
        out.push_str("\n\n");
    }
    out
}

/// One handoff in a few lines: progress counts, the last few steps verbatim,
/// and earlier steps folded into a theme tally.
pub fn compact_handoff(h: &Handoff, theme_keywords: &[String]) -> String {
    let mut out = format!(
        "[{}] {} ({}/{})\n",
        h.id,
        h.title,
        h.status.as_str(),
        h.phase.as_str()
    );

    if !h.tried.is_empty() {
        let failures = h
            .tried
            .iter()
            .filter(|s| s.outcome == StepOutcome::Fail)
            .count();
        let progress = if failures == 0 {
            format!("{} steps (all success)", h.tried.len())
        } else {
            format!("{} steps ({failures} failures)", h.tried.len())
        };

        let recent_start = h.tried.len().saturating_sub(COMPACT_LAST_STEPS);
        let recent: Vec<String> = h.tried[recent_start..]
            .iter()
            .map(|s| format!("[{}] {}", s.outcome.as_str(), s.description))
            .collect();

        out.push_str(&format!("  {progress}; last: {}\n", recent.join("; ")));

        if recent_start > 0 {
            let tally = theme_tally(&h.tried[..recent_start], theme_keywords);
            if !tally.is_empty() {
                out.push_str(&format!("  earlier: {tally}\n"));
            }
        }
    }

    if !h.next_steps.is_empty() {
        out.push_str(&format!("  next: {}\n", h.next_steps));
    }
    out
}

/// Bucket earlier steps by the first matching keyword; everything else lands
/// in "other". Rendered as `fix×4, test×2`.
fn theme_tally(steps: &[crate::models::TriedStep], theme_keywords: &[String]) -> String {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for step in steps {
        let lowered = step.description.to_lowercase();
        let bucket = theme_keywords
            .iter()
            .find(|k| lowered.contains(k.as_str()))
            .map(|k| k.as_str())
            .unwrap_or("other");
        *counts.entry(bucket).or_insert(0) += 1;
    }
    let mut parts: Vec<(usize, &str)> = counts.into_iter().map(|(k, v)| (v, k)).collect();
    parts.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(b.1)));
    parts
        .into_iter()
        .map(|(count, bucket)| format!("{bucket}×{count}"))
        .collect::<Vec<_>>()
        .join(", ")
}
