//! End-to-end smoke tests driving the real binary: CLI surface, hook
//! lifecycle against a synthetic transcript, and cross-process lock safety.

use std::io::Write;
use std::path::Path;
use std::process::{Command, Output, Stdio};

fn bin() -> &'static str {
    env!("CARGO_BIN_EXE_claude-recall")
}

struct Sandbox {
    _dir: tempfile::TempDir,
    project: std::path::PathBuf,
    state: std::path::PathBuf,
}

impl Sandbox {
    fn new() -> Sandbox {
        let dir = tempfile::tempdir().unwrap();
        let project = dir.path().join("project");
        let state = dir.path().join("state");
        std::fs::create_dir_all(&project).unwrap();
        std::fs::create_dir_all(&state).unwrap();
        Sandbox {
            project,
            state,
            _dir: dir,
        }
    }

    fn recall_dir(&self) -> std::path::PathBuf {
        self.project.join(".claude-recall")
    }

    fn run(&self, args: &[&str]) -> Output {
        Command::new(bin())
            .args(args)
            .env("PROJECT_DIR", &self.project)
            .env("CLAUDE_RECALL_STATE", &self.state)
            .env("CLAUDE_RECALL_DEBUG", "0")
            .output()
            .unwrap()
    }

    fn run_json(&self, args: &[&str]) -> serde_json::Value {
        let out = self.run(args);
        assert!(
            out.status.success(),
            "command {args:?} failed: {}",
            String::from_utf8_lossy(&out.stderr)
        );
        serde_json::from_slice(&out.stdout).unwrap_or_else(|e| {
            panic!(
                "command {args:?} wrote invalid JSON ({e}): {}",
                String::from_utf8_lossy(&out.stdout)
            )
        })
    }

    fn run_hook(&self, kind: &str, payload: serde_json::Value) -> Output {
        let mut child = Command::new(bin())
            .args(["hook", kind])
            .env("PROJECT_DIR", &self.project)
            .env("CLAUDE_RECALL_STATE", &self.state)
            .env("CLAUDE_RECALL_DEBUG", "0")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .unwrap();
        child
            .stdin
            .take()
            .unwrap()
            .write_all(payload.to_string().as_bytes())
            .unwrap();
        child.wait_with_output().unwrap()
    }
}

fn assistant_line(text: &str) -> String {
    serde_json::json!({
        "type": "assistant",
        "timestamp": "2026-07-30T12:00:00Z",
        "message": { "content": [ { "type": "text", "text": text } ] }
    })
    .to_string()
}

fn edit_line(path: &str) -> String {
    serde_json::json!({
        "type": "assistant",
        "timestamp": "2026-07-30T12:00:01Z",
        "message": { "content": [
            { "type": "tool_use", "name": "Edit", "input": { "file_path": path } }
        ] }
    })
    .to_string()
}

fn append_lines(path: &Path, lines: &[String]) {
    use std::fs::OpenOptions;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .unwrap();
    for line in lines {
        writeln!(file, "{line}").unwrap();
    }
}

fn hook_payload(sandbox: &Sandbox, session: &str, transcript: &Path) -> serde_json::Value {
    serde_json::json!({
        "cwd": sandbox.project.to_str().unwrap(),
        "session_id": session,
        "transcript_path": transcript.to_str().unwrap(),
    })
}

#[test]
fn add_list_show_round_trip() {
    let sb = Sandbox::new();

    let added = sb.run_json(&["add", "gotcha", "Lock order", "lessons before handoffs"]);
    assert_eq!(added["id"], "L001");
    assert_eq!(added["category"], "gotcha");
    assert_eq!(added["uses"], 0);

    let listed = sb.run_json(&["list"]);
    assert_eq!(listed["lessons"].as_array().unwrap().len(), 1);

    let shown = sb.run_json(&["show", "L001"]);
    assert_eq!(shown["title"], "Lock order");

    // The markdown on disk is the authoritative artifact.
    let text = std::fs::read_to_string(sb.recall_dir().join("LESSONS.md")).unwrap();
    assert!(text.contains("### [L001] [-----|-----] Lock order"));
    assert!(text.contains("> lessons before handoffs"));
}

#[test]
fn show_unknown_id_exits_two_with_json_error() {
    let sb = Sandbox::new();
    let out = sb.run(&["show", "L042"]);
    assert_eq!(out.status.code(), Some(2));
    let v: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(v["code"], "not_found");
}

#[test]
fn usage_error_exits_one() {
    let sb = Sandbox::new();
    let out = sb.run(&["add", "gotcha"]);
    assert_eq!(out.status.code(), Some(1));
}

#[test]
fn disabled_config_makes_mutations_no_ops() {
    let sb = Sandbox::new();
    std::fs::create_dir_all(sb.recall_dir()).unwrap();
    std::fs::write(sb.recall_dir().join("config.json"), r#"{"enabled": false}"#).unwrap();

    let out = sb.run(&["add", "gotcha", "t", "c"]);
    assert!(out.status.success());
    assert!(out.stdout.is_empty());
    assert!(!sb.recall_dir().join("LESSONS.md").exists());
}

#[test]
fn stop_hook_cites_and_advances_offset() {
    let sb = Sandbox::new();
    sb.run_json(&["add", "pattern", "Hook wiring", "stop fires after each turn"]);

    let transcript = sb.project.join("transcript.jsonl");
    append_lines(&transcript, &[assistant_line("Applying [L001]: fix hooks")]);

    let payload = hook_payload(&sb, "sess-1", &transcript);
    let out = sb.run_hook("stop", payload.clone());
    assert!(out.status.success());

    let shown = sb.run_json(&["show", "L001"]);
    assert_eq!(shown["uses"], 1);
    assert_eq!(shown["velocity"], 1.0);

    // Replaying the hook with no new bytes must not double-count.
    let out = sb.run_hook("stop", payload);
    assert!(out.status.success());
    let shown = sb.run_json(&["show", "L001"]);
    assert_eq!(shown["uses"], 1);
}

#[test]
fn stop_hook_ignores_listings() {
    let sb = Sandbox::new();
    sb.run_json(&["add", "pattern", "Pattern Title", "content"]);

    let transcript = sb.project.join("transcript.jsonl");
    append_lines(
        &transcript,
        &[assistant_line("[L001] [***--|*----] Pattern Title")],
    );

    let out = sb.run_hook("stop", hook_payload(&sb, "sess-2", &transcript));
    assert!(out.status.success());
    let shown = sb.run_json(&["show", "L001"]);
    assert_eq!(shown["uses"], 0);
}

#[test]
fn stop_hook_lesson_command_records_lesson() {
    let sb = Sandbox::new();
    let transcript = sb.project.join("transcript.jsonl");
    append_lines(
        &transcript,
        &[assistant_line(
            "AI LESSON [constraint]: gotcha: Offset discipline - never rescan cited bytes",
        )],
    );

    sb.run_hook("stop", hook_payload(&sb, "sess-3", &transcript));

    let listed = sb.run_json(&["list"]);
    let lessons = listed["lessons"].as_array().unwrap();
    assert_eq!(lessons.len(), 1);
    assert_eq!(lessons[0]["title"], "Offset discipline");
    assert_eq!(lessons[0]["source"], "ai");
    assert_eq!(lessons[0]["category"], "gotcha");
    assert_eq!(lessons[0]["type"], "constraint");
}

#[test]
fn handoff_lifecycle_through_stop_hooks() {
    let sb = Sandbox::new();
    let transcript = sb.project.join("transcript.jsonl");

    append_lines(&transcript, &[assistant_line("HANDOFF: Implement auth refresh")]);
    sb.run_hook("stop", hook_payload(&sb, "sess-4", &transcript));

    let listed = sb.run_json(&["handoff", "list"]);
    let handoffs = listed["handoffs"].as_array().unwrap();
    assert_eq!(handoffs.len(), 1);
    let id = handoffs[0]["id"].as_str().unwrap().to_string();
    assert_eq!(handoffs[0]["status"], "in_progress");

    append_lines(
        &transcript,
        &[assistant_line(&format!(
            "HANDOFF UPDATE {id}: tried success - Final commit done"
        ))],
    );
    sb.run_hook("stop", hook_payload(&sb, "sess-4", &transcript));

    let shown = sb.run_json(&["handoff", "show", &id]);
    assert_eq!(shown["status"], "completed");
    assert_eq!(shown["phase"], "review");
    assert_eq!(shown["tried"].as_array().unwrap().len(), 1);

    // Completing again through a replayed command is a no-op.
    append_lines(
        &transcript,
        &[assistant_line(&format!("HANDOFF COMPLETE {id}"))],
    );
    sb.run_hook("stop", hook_payload(&sb, "sess-4", &transcript));
    let shown = sb.run_json(&["handoff", "show", &id]);
    assert_eq!(shown["status"], "completed");
}

#[test]
fn pre_compact_auto_creates_handoff_and_snapshot() {
    let sb = Sandbox::new();
    let transcript = sb.project.join("transcript.jsonl");
    let user = serde_json::json!({
        "type": "user",
        "message": { "content": [ { "type": "text", "text": "port the auth layer to the new client" } ] }
    })
    .to_string();
    let mut lines = vec![user];
    for i in 0..5 {
        lines.push(edit_line(&format!("/src/file{i}.rs")));
    }
    append_lines(&transcript, &lines);

    let out = sb.run_hook("pre-compact", hook_payload(&sb, "sess-5", &transcript));
    assert!(out.status.success());

    let listed = sb.run_json(&["handoff", "list"]);
    let handoffs = listed["handoffs"].as_array().unwrap();
    assert_eq!(handoffs.len(), 1);
    assert_eq!(handoffs[0]["phase"], "implementing");
    assert_eq!(
        handoffs[0]["title"],
        "port the auth layer to the new client"
    );

    // No summarizer configured — the fallback snapshot must exist.
    let snapshot = sb.recall_dir().join(".session-snapshot");
    assert!(snapshot.exists());
    let v: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&snapshot).unwrap()).unwrap();
    assert_eq!(v["session_id"], "sess-5");
    assert_eq!(v["edit_count"], 5);
}

#[test]
fn session_start_injects_lessons_and_duties() {
    let sb = Sandbox::new();
    sb.run_json(&["add", "pattern", "Atomic writes", "tmp then rename"]);

    let out = sb.run_hook("session-start", serde_json::json!({}));
    assert!(out.status.success());
    let v: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    let context = v["additionalContext"].as_str().unwrap();
    assert!(context.contains("[L001]"));
    assert!(context.contains("Lesson duty"));
    assert!(context.contains("Handoff duty"));
}

#[test]
fn concurrent_citers_lose_no_updates() {
    let sb = Sandbox::new();
    sb.run_json(&["add", "pattern", "Contended lesson", "both sessions cite this"]);

    let per_worker = 25;
    let workers: Vec<std::thread::JoinHandle<()>> = (0..2)
        .map(|_| {
            let bin = bin().to_string();
            let project = sb.project.clone();
            let state = sb.state.clone();
            std::thread::spawn(move || {
                for _ in 0..per_worker {
                    let out = Command::new(&bin)
                        .args(["cite", "L001"])
                        .env("PROJECT_DIR", &project)
                        .env("CLAUDE_RECALL_STATE", &state)
                        .output()
                        .unwrap();
                    assert!(out.status.success());
                }
            })
        })
        .collect();
    for w in workers {
        w.join().unwrap();
    }

    let shown = sb.run_json(&["show", "L001"]);
    assert_eq!(shown["uses"], 2 * per_worker);
    assert_eq!(shown["velocity"], (2 * per_worker) as f64);

    // The markdown survived 50 interleaved rewrites intact.
    let listed = sb.run_json(&["list"]);
    assert_eq!(listed["lessons"].as_array().unwrap().len(), 1);
}

#[test]
fn score_local_ranks_by_relevance() {
    let sb = Sandbox::new();
    sb.run_json(&["add", "pattern", "Lock ordering", "acquire lessons before handoffs"]);
    sb.run_json(&["add", "pattern", "Hook timing", "stop fires after each turn"]);

    let scored = sb.run_json(&["score-local", "lock ordering", "--top", "2"]);
    let scores = scored["scores"].as_array().unwrap();
    assert_eq!(scores[0]["id"], "L001");
    assert_eq!(scores[0]["score"], 10);
}

#[test]
fn handoff_archive_via_cli() {
    let sb = Sandbox::new();
    let added = sb.run_json(&["handoff", "add", "old work"]);
    let id = added["id"].as_str().unwrap().to_string();
    sb.run_json(&["handoff", "complete", &id]);

    // Completed today — inside the retention window, nothing to archive.
    let archived = sb.run_json(&["handoff", "archive"]);
    assert_eq!(archived["archived"], 0);

    let listed = sb.run_json(&["handoff", "list", "--all"]);
    assert_eq!(listed["handoffs"].as_array().unwrap().len(), 1);
}

#[test]
fn decay_cli_reports() {
    let sb = Sandbox::new();
    sb.run_json(&["add", "pattern", "t", "c"]);
    let report = sb.run_json(&["decay", "--force"]);
    assert_eq!(report["ran"], true);
    assert_eq!(report["lessons_touched"], 1);
}
