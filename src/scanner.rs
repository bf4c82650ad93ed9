//! Incremental JSONL transcript extraction.
//!
//! One pass over the transcript gives both whole-file signals (edit breadth,
//! todo activity) and new-since-checkpoint content (assistant text, citations,
//! commands). A line is "new" when it starts at or after the stored offset —
//! a line the offset splits belongs to the previous scan and is discarded.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::io::{BufRead, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::OnceLock;

use crate::models::{
    sanitize_block, sanitize_line, Category, LessonKind, StepOutcome, MAX_CONTENT_CHARS,
    MAX_TITLE_CHARS,
};

/// Regex work is skipped for text lines longer than this.
const MAX_SCAN_LINE_CHARS: usize = 1000;
/// Keep only the most recent user texts; pre-compact titling needs no more.
const MAX_USER_TEXTS: usize = 20;
/// Tail window handed to the summarizer.
pub const CONTEXT_TAIL_BYTES: u64 = 64 * 1024;

const EDIT_TOOLS: &[&str] = &["Edit", "MultiEdit", "Write", "NotebookEdit"];

#[derive(Debug, Clone, PartialEq)]
pub struct LessonCommand {
    pub ai: bool,
    pub kind: Option<LessonKind>,
    pub category: Option<Category>,
    pub title: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum HandoffCommand {
    Start {
        title: String,
    },
    Tried {
        id: String,
        outcome: StepOutcome,
        description: String,
    },
    Update {
        id: String,
        field: String,
        value: String,
    },
    Complete {
        id: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct TodoItem {
    pub content: String,
    pub status: String,
}

#[derive(Debug, Default)]
pub struct ScanOutcome {
    /// Text blocks from assistant records after the checkpoint.
    pub assistant_texts: Vec<String>,
    /// Recent user text blocks from the whole transcript (bounded).
    pub user_texts: Vec<String>,
    /// Lesson IDs the assistant applied, in order, deduplicated.
    pub citations: Vec<String>,
    pub lesson_commands: Vec<LessonCommand>,
    pub handoff_commands: Vec<HandoffCommand>,
    /// Distinct file paths edited across the whole transcript.
    pub edit_count: usize,
    /// Todo-list writes across the whole transcript.
    pub todo_write_count: usize,
    /// The last todo list seen anywhere in the transcript.
    pub last_todos: Option<Vec<TodoItem>>,
    /// Whether a todo write appeared after the checkpoint.
    pub todo_after_offset: bool,
    pub latest_timestamp: Option<DateTime<Utc>>,
    /// File size at scan time; the caller persists this as the new offset.
    pub new_offset: u64,
}

impl ScanOutcome {
    pub fn is_empty_range(&self) -> bool {
        self.assistant_texts.is_empty()
            && self.citations.is_empty()
            && self.lesson_commands.is_empty()
            && self.handoff_commands.is_empty()
    }
}

fn citation_re() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"\[([LS]\d{3})\]").expect("static pattern"))
}

fn lesson_command_re() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| {
        regex::Regex::new(
            r"^(AI )?LESSON(?: \[(constraint|informational|preference)\])?:\s*(?:([a-z]+):\s*)?([^-]+?)\s*-\s*(.+)$",
        )
        .expect("static pattern")
    })
}

fn handoff_start_re() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"^HANDOFF:\s*(.+)$").expect("static pattern"))
}

fn handoff_update_re() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| {
        regex::Regex::new(r"^HANDOFF UPDATE (hf-[0-9a-f]{7}|A\d{3}):\s*(.+)$")
            .expect("static pattern")
    })
}

fn handoff_tried_re() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| {
        regex::Regex::new(r"^tried (success|fail|partial)\s*-\s*(.+)$").expect("static pattern")
    })
}

fn handoff_field_re() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"^([A-Za-z_-]+):\s*(.+)$").expect("static pattern"))
}

fn handoff_complete_re() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| {
        regex::Regex::new(r"^HANDOFF COMPLETE (hf-[0-9a-f]{7}|A\d{3})\s*$").expect("static pattern")
    })
}

/// Scan the transcript. Whole-file signals are always collected; text
/// extraction covers only the range after `offset`.
pub fn scan(transcript_path: &Path, offset: u64) -> Result<ScanOutcome> {
    let file = std::fs::File::open(transcript_path)
        .with_context(|| format!("opening transcript {}", transcript_path.display()))?;
    let size = file.metadata().map(|m| m.len()).unwrap_or(0);

    let mut outcome = ScanOutcome {
        new_offset: size.max(offset),
        ..Default::default()
    };
    if size <= offset {
        outcome.new_offset = offset;
        return Ok(outcome);
    }

    let mut reader = std::io::BufReader::new(file);
    let mut edited_paths: BTreeSet<String> = BTreeSet::new();
    let mut new_texts: Vec<String> = Vec::new();

    let mut pos: u64 = 0;
    let mut buf = String::new();
    loop {
        buf.clear();
        let read = reader.read_line(&mut buf)?;
        if read == 0 {
            break;
        }
        let line_start = pos;
        pos += read as u64;
        let is_new = line_start >= offset;

        let line = buf.trim_end();
        let Ok(v) = serde_json::from_str::<serde_json::Value>(line) else {
            continue;
        };

        if is_new {
            if let Some(ts) = v["timestamp"]
                .as_str()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            {
                outcome.latest_timestamp = Some(ts.with_timezone(&Utc));
            }
        }

        match v["type"].as_str() {
            Some("assistant") => {
                let Some(content) = v["message"]["content"].as_array() else {
                    continue;
                };
                for item in content {
                    match item["type"].as_str() {
                        Some("text") => {
                            if is_new {
                                if let Some(text) = item["text"].as_str() {
                                    new_texts.push(text.to_string());
                                }
                            }
                        }
                        Some("tool_use") => {
                            let name = item["name"].as_str().unwrap_or("");
                            if EDIT_TOOLS.contains(&name) {
                                if let Some(p) = item["input"]["file_path"].as_str() {
                                    edited_paths.insert(p.to_string());
                                }
                            } else if name == "TodoWrite" {
                                outcome.todo_write_count += 1;
                                if is_new {
                                    outcome.todo_after_offset = true;
                                }
                                if let Some(todos) = item["input"]["todos"].as_array() {
                                    outcome.last_todos = Some(parse_todos(todos));
                                }
                            }
                        }
                        _ => {}
                    }
                }
            }
            Some("user") => {
                let Some(content) = v["message"]["content"].as_array() else {
                    continue;
                };
                for item in content {
                    if item["type"].as_str() == Some("text") {
                        if let Some(text) = item["text"].as_str() {
                            outcome.user_texts.push(text.to_string());
                            if outcome.user_texts.len() > MAX_USER_TEXTS {
                                outcome.user_texts.remove(0);
                            }
                        }
                    }
                }
            }
            _ => {}
        }
    }

    outcome.edit_count = edited_paths.len();
    extract_from_texts(&new_texts, &mut outcome);
    outcome.assistant_texts = new_texts;
    Ok(outcome)
}

fn parse_todos(todos: &[serde_json::Value]) -> Vec<TodoItem> {
    todos
        .iter()
        .filter_map(|t| {
            let content = t["content"].as_str()?;
            Some(TodoItem {
                content: sanitize_line(content, MAX_TITLE_CHARS),
                status: t["status"].as_str().unwrap_or("pending").to_string(),
            })
        })
        .collect()
}

fn extract_from_texts(texts: &[String], outcome: &mut ScanOutcome) {
    let mut seen_citations: BTreeSet<String> = BTreeSet::new();
    for text in texts {
        for line in text.lines() {
            if line.chars().count() > MAX_SCAN_LINE_CHARS {
                continue;
            }
            scan_citations(line, &mut seen_citations, &mut outcome.citations);
            if let Some(cmd) = parse_lesson_command(line) {
                outcome.lesson_commands.push(cmd);
                continue;
            }
            if let Some(cmd) = parse_handoff_command(line) {
                outcome.handoff_commands.push(cmd);
            }
        }
    }
}

/// `[L007]` is a citation; `[L007] [*` is the listing format the injector
/// itself emits and must not count.
fn scan_citations(line: &str, seen: &mut BTreeSet<String>, citations: &mut Vec<String>) {
    for caps in citation_re().captures_iter(line) {
        let whole = caps.get(0).expect("match");
        let rest = &line[whole.end()..];
        if rest.starts_with(" [*") || rest.starts_with(" [-") {
            continue;
        }
        let id = caps[1].to_string();
        if seen.insert(id.clone()) {
            citations.push(id);
        }
    }
}

fn parse_lesson_command(line: &str) -> Option<LessonCommand> {
    let caps = lesson_command_re().captures(line)?;
    let ai = caps.get(1).is_some();
    let kind = caps.get(2).and_then(|m| LessonKind::parse(m.as_str()));
    let raw_category = caps.get(3).map(|m| m.as_str());
    let raw_title = caps[4].trim();
    let content = caps[5].trim();

    let (category, title) = match raw_category {
        Some(word) => match Category::parse(word) {
            Some(c) => (Some(c), raw_title.to_string()),
            // Not a category — the colon belonged to the title.
            None => (None, format!("{word}: {raw_title}")),
        },
        None => (None, raw_title.to_string()),
    };

    Some(LessonCommand {
        ai,
        kind,
        category,
        title: sanitize_line(&title, MAX_TITLE_CHARS),
        content: sanitize_block(content, MAX_CONTENT_CHARS),
    })
}

fn parse_handoff_command(line: &str) -> Option<HandoffCommand> {
    if let Some(caps) = handoff_complete_re().captures(line) {
        return Some(HandoffCommand::Complete {
            id: caps[1].to_string(),
        });
    }
    if let Some(caps) = handoff_update_re().captures(line) {
        let id = caps[1].to_string();
        let rest = caps[2].trim();
        if let Some(tried) = handoff_tried_re().captures(rest) {
            return Some(HandoffCommand::Tried {
                id,
                outcome: StepOutcome::parse(&tried[1]).unwrap_or(StepOutcome::Partial),
                description: sanitize_line(&tried[2], MAX_TITLE_CHARS),
            });
        }
        if let Some(field) = handoff_field_re().captures(rest) {
            return Some(HandoffCommand::Update {
                id,
                field: field[1].to_string(),
                value: sanitize_line(&field[2], MAX_CONTENT_CHARS),
            });
        }
        return None;
    }
    if let Some(caps) = handoff_start_re().captures(line) {
        return Some(HandoffCommand::Start {
            title: sanitize_line(&caps[1], MAX_TITLE_CHARS),
        });
    }
    None
}

/// Last `max_bytes` of the transcript with the leading partial line dropped —
/// the window handed to the summarizer.
pub fn read_tail(transcript_path: &Path, max_bytes: u64) -> Result<String> {
    let mut file = std::fs::File::open(transcript_path)
        .with_context(|| format!("opening transcript {}", transcript_path.display()))?;
    let size = file.metadata().map(|m| m.len()).unwrap_or(0);
    let start = size.saturating_sub(max_bytes);
    file.seek(SeekFrom::Start(start))?;
    let mut raw = String::new();
    file.read_to_string(&mut raw)?;
    if start > 0 {
        if let Some(nl) = raw.find('\n') {
            raw.drain(..=nl);
        }
    }
    Ok(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn assistant_line(text: &str) -> String {
        serde_json::json!({
            "type": "assistant",
            "timestamp": "2026-07-30T12:00:00Z",
            "message": { "content": [ { "type": "text", "text": text } ] }
        })
        .to_string()
    }

    fn tool_line(name: &str, input: serde_json::Value) -> String {
        serde_json::json!({
            "type": "assistant",
            "timestamp": "2026-07-30T12:00:01Z",
            "message": { "content": [ { "type": "tool_use", "name": name, "input": input } ] }
        })
        .to_string()
    }

    fn write_transcript(lines: &[String]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(f, "{line}").unwrap();
        }
        f.flush().unwrap();
        f
    }

    #[test]
    fn empty_range_yields_empty_extraction() {
        let f = write_transcript(&[assistant_line("Applying [L001]: fix")]);
        let size = f.as_file().metadata().unwrap().len();
        let outcome = scan(f.path(), size).unwrap();
        assert!(outcome.is_empty_range());
        assert_eq!(outcome.new_offset, size);
    }

    #[test]
    fn citation_extracted_after_offset() {
        let f = write_transcript(&[assistant_line("Applying [L001]: fix hooks")]);
        let outcome = scan(f.path(), 0).unwrap();
        assert_eq!(outcome.citations, vec!["L001".to_string()]);
        assert!(outcome.latest_timestamp.is_some());
        assert_eq!(
            outcome.new_offset,
            f.as_file().metadata().unwrap().len()
        );
    }

    #[test]
    fn listing_is_not_a_citation() {
        let f = write_transcript(&[assistant_line("[L007] [***--|*----] Pattern Title")]);
        let outcome = scan(f.path(), 0).unwrap();
        assert!(outcome.citations.is_empty());
    }

    #[test]
    fn citations_deduplicate_within_scan() {
        let f = write_transcript(&[assistant_line("[L001] then [L001] and [S002]")]);
        let outcome = scan(f.path(), 0).unwrap();
        assert_eq!(outcome.citations, vec!["L001".to_string(), "S002".to_string()]);
    }

    #[test]
    fn offset_at_line_boundary_keeps_next_line() {
        let first = assistant_line("first turn");
        let f = write_transcript(&[first.clone()]);
        let boundary = f.as_file().metadata().unwrap().len();

        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(f.path())
            .unwrap();
        writeln!(file, "{}", assistant_line("Applying [L003]: next")).unwrap();
        file.flush().unwrap();

        let outcome = scan(f.path(), boundary).unwrap();
        assert_eq!(outcome.citations, vec!["L003".to_string()]);
        assert_eq!(outcome.assistant_texts.len(), 1);
    }

    #[test]
    fn partial_boundary_line_is_discarded() {
        let full = assistant_line("old [L001] text");
        let f = write_transcript(&[full.clone(), assistant_line("new [L002] text")]);
        // Offset mid-way through the first line: that line belongs to the
        // previous scan and must not re-extract.
        let outcome = scan(f.path(), 10).unwrap();
        assert_eq!(outcome.citations, vec!["L002".to_string()]);
    }

    #[test]
    fn lesson_commands_parse_all_shapes() {
        let f = write_transcript(&[
            assistant_line("LESSON: gotcha: Lock order - acquire lessons before handoffs"),
            assistant_line("AI LESSON [constraint]: Title here - content there"),
            assistant_line("LESSON: odd: prefix - still captured"),
        ]);
        let outcome = scan(f.path(), 0).unwrap();
        assert_eq!(outcome.lesson_commands.len(), 3);

        let first = &outcome.lesson_commands[0];
        assert!(!first.ai);
        assert_eq!(first.category, Some(Category::Gotcha));
        assert_eq!(first.title, "Lock order");
        assert_eq!(first.content, "acquire lessons before handoffs");

        let second = &outcome.lesson_commands[1];
        assert!(second.ai);
        assert_eq!(second.kind, Some(LessonKind::Constraint));
        assert_eq!(second.category, None);
        assert_eq!(second.title, "Title here");

        // "odd" is not a category — it folds back into the title.
        let third = &outcome.lesson_commands[2];
        assert_eq!(third.category, None);
        assert_eq!(third.title, "odd: prefix");
    }

    #[test]
    fn handoff_commands_parse_all_families() {
        let f = write_transcript(&[
            assistant_line("HANDOFF: Implement auth refresh"),
            assistant_line("HANDOFF UPDATE hf-0a1b2c3: tried success - reproduced the race"),
            assistant_line("HANDOFF UPDATE hf-0a1b2c3: status: blocked"),
            assistant_line("HANDOFF COMPLETE hf-0a1b2c3"),
            assistant_line("HANDOFF UPDATE A012: tried fail - legacy path"),
        ]);
        let outcome = scan(f.path(), 0).unwrap();
        assert_eq!(outcome.handoff_commands.len(), 5);
        assert_eq!(
            outcome.handoff_commands[0],
            HandoffCommand::Start {
                title: "Implement auth refresh".into()
            }
        );
        assert_eq!(
            outcome.handoff_commands[1],
            HandoffCommand::Tried {
                id: "hf-0a1b2c3".into(),
                outcome: StepOutcome::Success,
                description: "reproduced the race".into()
            }
        );
        assert_eq!(
            outcome.handoff_commands[2],
            HandoffCommand::Update {
                id: "hf-0a1b2c3".into(),
                field: "status".into(),
                value: "blocked".into()
            }
        );
        assert_eq!(
            outcome.handoff_commands[3],
            HandoffCommand::Complete {
                id: "hf-0a1b2c3".into()
            }
        );
        assert_eq!(
            outcome.handoff_commands[4],
            HandoffCommand::Tried {
                id: "A012".into(),
                outcome: StepOutcome::Fail,
                description: "legacy path".into()
            }
        );
    }

    #[test]
    fn oversized_text_line_is_skipped_for_extraction() {
        let long = format!("[L001] {}", "x".repeat(2000));
        let f = write_transcript(&[assistant_line(&long)]);
        let outcome = scan(f.path(), 0).unwrap();
        assert!(outcome.citations.is_empty());
    }

    #[test]
    fn edit_count_is_distinct_paths_over_full_transcript() {
        let f = write_transcript(&[
            tool_line("Edit", serde_json::json!({"file_path": "/a.rs"})),
            tool_line("Edit", serde_json::json!({"file_path": "/a.rs"})),
            tool_line("Write", serde_json::json!({"file_path": "/b.rs"})),
            tool_line("MultiEdit", serde_json::json!({"file_path": "/c.rs"})),
        ]);
        let size = f.as_file().metadata().unwrap().len();
        // Even with the offset at EOF, whole-file signals are reported.
        let outcome = scan(f.path(), 0).unwrap();
        assert_eq!(outcome.edit_count, 3);
        assert_eq!(scan(f.path(), size - 1).unwrap().edit_count, 3);
    }

    #[test]
    fn todo_writes_track_last_list_and_recency() {
        let older = tool_line(
            "TodoWrite",
            serde_json::json!({"todos": [{"content": "step one", "status": "completed"}]}),
        );
        let f = write_transcript(&[older.clone()]);
        let boundary = f.as_file().metadata().unwrap().len();
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(f.path())
            .unwrap();
        writeln!(
            file,
            "{}",
            tool_line(
                "TodoWrite",
                serde_json::json!({"todos": [
                    {"content": "step one", "status": "completed"},
                    {"content": "step two", "status": "in_progress"}
                ]}),
            )
        )
        .unwrap();
        file.flush().unwrap();

        let outcome = scan(f.path(), boundary).unwrap();
        assert_eq!(outcome.todo_write_count, 2);
        assert!(outcome.todo_after_offset);
        let todos = outcome.last_todos.unwrap();
        assert_eq!(todos.len(), 2);
        assert_eq!(todos[1].status, "in_progress");
    }

    #[test]
    fn malformed_lines_are_ignored() {
        let f = write_transcript(&[
            "not json at all".to_string(),
            assistant_line("Applying [L001]: ok"),
        ]);
        let outcome = scan(f.path(), 0).unwrap();
        assert_eq!(outcome.citations, vec!["L001".to_string()]);
    }

    #[test]
    fn user_texts_collected_for_titles() {
        let user = serde_json::json!({
            "type": "user",
            "message": { "content": [ { "type": "text", "text": "please fix the auth refresh" } ] }
        })
        .to_string();
        let f = write_transcript(&[user, assistant_line("on it")]);
        let outcome = scan(f.path(), 0).unwrap();
        assert_eq!(outcome.user_texts.len(), 1);
    }

    #[test]
    fn read_tail_skips_leading_partial_line() {
        let lines: Vec<String> = (0..50).map(|i| assistant_line(&format!("turn {i}"))).collect();
        let f = write_transcript(&lines);
        let tail = read_tail(f.path(), 200).unwrap();
        assert!(tail.len() <= 200);
        // Every surviving line is complete JSON.
        for line in tail.lines() {
            serde_json::from_str::<serde_json::Value>(line).unwrap();
        }
    }
}
