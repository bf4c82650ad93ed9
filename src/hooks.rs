//! The five hook entry points. Every hook follows the same contract with the
//! host: read JSON from stdin, do bounded work, write JSON to stdout, and
//! never fail loudly — a hook that breaks must not take the user's session
//! down with it. Errors land in the journal; lock contention exits silently.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::config::{self, Config, Paths};
use crate::decay::DecayEngine;
use crate::detach;
use crate::inject::{self, InjectOptions};
use crate::journal;
use crate::lock;
use crate::models::{today, Category, Lesson, Phase, Source, Status};
use crate::rank::{self, RelevanceCache};
use crate::scanner::{self, HandoffCommand, ScanOutcome, TodoItem};
use crate::store::checkpoints::CheckpointStore;
use crate::store::handoffs::{
    AddHandoff, HandoffFilter, HandoffRepository, HandoffUpdate, MarkdownHandoffs,
};
use crate::store::lessons::{AddLesson, LessonFilter, LessonRepository, MarkdownLessons};
use crate::store::{is_duplicate, is_not_found};
use crate::summarize::Summarizer;

const HEAVY_EDIT_THRESHOLD: usize = 4;
const HEAVY_TODO_THRESHOLD: usize = 3;
const TITLE_MAX_CHARS: usize = 60;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum HookKind {
    SessionStart,
    PromptSubmit,
    Stop,
    PreCompact,
    SessionEnd,
}

impl HookKind {
    pub fn parse(s: &str) -> Option<HookKind> {
        match s {
            "session-start" => Some(HookKind::SessionStart),
            "prompt-submit" => Some(HookKind::PromptSubmit),
            "stop" => Some(HookKind::Stop),
            "pre-compact" => Some(HookKind::PreCompact),
            "session-end" => Some(HookKind::SessionEnd),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            HookKind::SessionStart => "session-start",
            HookKind::PromptSubmit => "prompt-submit",
            HookKind::Stop => "stop",
            HookKind::PreCompact => "pre-compact",
            HookKind::SessionEnd => "session-end",
        }
    }
}

#[derive(Deserialize, Default, Debug)]
pub struct HookInput {
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub transcript_path: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub trigger: Option<String>,
    #[serde(default)]
    pub stop_reason: Option<String>,
}

#[derive(Serialize, Deserialize, Debug)]
struct SessionSnapshot {
    session_id: String,
    transcript_path: String,
    saved_at: String,
    edit_count: usize,
    #[serde(default)]
    last_user_text: Option<String>,
}

struct HookEnv {
    paths: Paths,
    config: Config,
    payload: HookInput,
}

impl HookEnv {
    fn session_id(&self) -> Option<String> {
        config::session_id(self.payload.session_id.as_deref())
    }

    fn transcript(&self) -> Option<PathBuf> {
        self.payload
            .transcript_path
            .as_ref()
            .map(PathBuf::from)
            .filter(|p| p.exists())
    }

    fn lessons(&self) -> MarkdownLessons {
        MarkdownLessons::new(&self.paths, &self.config)
    }

    fn handoffs(&self) -> MarkdownHandoffs {
        MarkdownHandoffs::new(&self.paths, &self.config)
    }

    fn checkpoints(&self) -> CheckpointStore {
        CheckpointStore::new(&self.paths, &self.config)
    }

    fn detach_log(&self) -> PathBuf {
        self.paths.state.join("detach.log")
    }
}

/// Run one hook end to end, returning the process exit code. Always 0 —
/// do-no-harm is the contract — except when stdin is a terminal, which means
/// a human invoked it by mistake.
pub async fn run(kind: HookKind) -> i32 {
    let payload = if atty::is(atty::Stream::Stdin) {
        eprintln!("[claude-recall] hook {} expects JSON on stdin", kind.name());
        return 1;
    } else {
        read_stdin_payload()
    };

    let paths = Paths::resolve(payload.cwd.as_deref());
    let config = Config::load(&paths);
    if !config.enabled {
        return 0;
    }
    let env = HookEnv {
        paths,
        config,
        payload,
    };

    journal::trace(
        &env.paths.journal(),
        "hook_invoked",
        serde_json::json!({
            "hook": kind.name(),
            "session": env.payload.session_id,
            "has_transcript": env.payload.transcript_path.is_some(),
        }),
    );

    let deadline = Duration::from_secs(env.config.hook_timeout_secs);
    match tokio::time::timeout(deadline, dispatch(kind, &env)).await {
        Err(_) => {
            journal::warn(
                &env.paths.journal(),
                "hook_timeout",
                serde_json::json!({ "hook": kind.name(), "seconds": deadline.as_secs() }),
            );
            0
        }
        Ok(Err(e)) => {
            if !lock::is_contended(&e) {
                journal::error(
                    &env.paths.journal(),
                    "hook_failed",
                    serde_json::json!({ "hook": kind.name(), "error": format!("{e:#}") }),
                );
            }
            0
        }
        Ok(Ok(Some(output))) => {
            println!("{output}");
            0
        }
        Ok(Ok(None)) => 0,
    }
}

fn read_stdin_payload() -> HookInput {
    use std::io::Read;
    let mut input = String::new();
    let _ = std::io::stdin().read_to_string(&mut input);
    serde_json::from_str(&input).unwrap_or_default()
}

async fn dispatch(kind: HookKind, env: &HookEnv) -> Result<Option<serde_json::Value>> {
    match kind {
        HookKind::SessionStart => session_start(env).await,
        HookKind::PromptSubmit => prompt_submit(env).await,
        HookKind::Stop => stop(env).await,
        HookKind::PreCompact => pre_compact(env).await,
        HookKind::SessionEnd => session_end(env),
    }
}

// ── session-start / prompt-submit ─────────────────────────────────────────────

async fn session_start(env: &HookEnv) -> Result<Option<serde_json::Value>> {
    let lessons = env.lessons();
    if DecayEngine::new(&env.paths, &env.config, &lessons).is_due() {
        if let Err(e) = detach::spawn_detached(&["decay"], &env.detach_log()) {
            journal::warn(
                &env.paths.journal(),
                "decay_detach_failed",
                serde_json::json!({ "error": e.to_string() }),
            );
        }
    }
    if let Err(e) = env.checkpoints().cleanup() {
        journal::warn(
            &env.paths.journal(),
            "checkpoint_cleanup_failed",
            serde_json::json!({ "error": e.to_string() }),
        );
    }

    let mut injection = build_context(env, None).await?;
    if let Some(snapshot) = take_snapshot(env) {
        let note = format!(
            "## Unsaved Session\nA previous session ended before its context \
             was captured ({} edits, session {}). Re-establish state with a \
             handoff if the work is still live.\n",
            snapshot.edit_count, snapshot.session_id
        );
        injection = Some(match injection {
            Some(text) => format!("{text}{note}"),
            None => note,
        });
    }
    Ok(injection.map(|text| serde_json::json!({ "additionalContext": text })))
}

async fn prompt_submit(env: &HookEnv) -> Result<Option<serde_json::Value>> {
    let query = env.payload.prompt.clone().unwrap_or_default();
    let injection = build_context(env, Some(&query)).await?;
    Ok(injection.map(|text| serde_json::json!({ "additionalContext": text })))
}

/// Shared body of the two injection hooks: pick lessons (ranked when a query
/// is present, top-by-weight otherwise), render handoffs and duties, report
/// the budget.
async fn build_context(env: &HookEnv, query: Option<&str>) -> Result<Option<String>> {
    let lessons_store = env.lessons();
    let all = lessons_store.list(&LessonFilter::default())?;
    let handoffs_store = env.handoffs();
    let active = handoffs_store.list(&HandoffFilter::default())?;
    let continuation = active
        .iter()
        .find(|h| h.status == Status::InProgress)
        .cloned();

    let selected: Vec<Lesson> = match query.filter(|q| !q.trim().is_empty()) {
        None => all,
        Some(q) => {
            let cache = RelevanceCache::new(&env.paths, &env.config);
            let summarizer = Summarizer::from_config(env.config.summarizer.as_ref());
            let scored = rank::rank_lessons(&all, q, summarizer.as_ref(), &cache).await;
            let relevant: Vec<Lesson> = scored
                .into_iter()
                .filter(|s| s.score > 0)
                .take(env.config.top_n)
                .map(|s| s.lesson)
                .collect();
            if relevant.is_empty() {
                all
            } else {
                relevant
            }
        }
    };

    let injection = inject::build_injection(
        &selected,
        &active,
        continuation.as_ref(),
        &InjectOptions {
            top_n: env.config.top_n,
            theme_keywords: env.config.theme_keywords.clone(),
            include_duties: true,
        },
    );

    journal::info(
        &env.paths.journal(),
        "inject_budget",
        serde_json::to_value(&injection.budget)?,
    );
    if injection.budget.over_budget {
        eprintln!(
            "[claude-recall] injection over budget ({} tokens)",
            injection.budget.total
        );
    }

    Ok(Some(injection.text).filter(|t| !t.is_empty()))
}

fn take_snapshot(env: &HookEnv) -> Option<SessionSnapshot> {
    let path = env.paths.session_snapshot();
    let content = std::fs::read_to_string(&path).ok()?;
    let snapshot = serde_json::from_str(&content).ok();
    let _ = std::fs::remove_file(&path);
    snapshot
}

// ── stop ──────────────────────────────────────────────────────────────────────

async fn stop(env: &HookEnv) -> Result<Option<serde_json::Value>> {
    let Some(sid) = env.session_id() else {
        return Ok(None);
    };
    let Some(transcript) = env.transcript() else {
        return Ok(None);
    };
    process_transcript(&env.paths, &env.config, &sid, &transcript).await?;
    Ok(None)
}

/// The stop-hook body, also reachable as `handoff process-transcript`:
/// scan from the checkpoint, apply citations and commands, sync todos,
/// advance the offset. Returns a summary of what was applied.
pub async fn process_transcript(
    paths: &Paths,
    config: &Config,
    sid: &str,
    transcript: &std::path::Path,
) -> Result<serde_json::Value> {
    let env = HookEnv {
        paths: paths.clone(),
        config: config.clone(),
        payload: HookInput::default(),
    };

    let checkpoints = env.checkpoints();
    let first_seen = checkpoints.is_new_session(sid);
    let offset = checkpoints.offset(sid);
    let scan = scanner::scan(transcript, offset)?;

    let lessons = env.lessons();
    let handoffs = env.handoffs();

    if !scan.citations.is_empty() {
        let outcome = lessons.cite(&scan.citations)?;
        if !outcome.missing.is_empty() {
            journal::warn(
                &env.paths.journal(),
                "citation_unknown_ids",
                serde_json::json!({ "ids": outcome.missing }),
            );
        }
        journal::info(
            &env.paths.journal(),
            "citations_applied",
            serde_json::json!({ "ids": outcome.cited }),
        );
    }

    for cmd in &scan.lesson_commands {
        apply_lesson_command(&env, &lessons, cmd);
    }

    let mut session_handoff = checkpoints.session_handoff(sid);
    for cmd in &scan.handoff_commands {
        apply_handoff_command(&env, &handoffs, &checkpoints, sid, transcript, cmd)
            .map(|started| {
                if let Some(id) = started {
                    session_handoff = Some(id);
                }
            })
            .unwrap_or_else(|e| {
                journal::error(
                    &env.paths.journal(),
                    "handoff_command_failed",
                    serde_json::json!({ "error": format!("{e:#}") }),
                );
            });
    }

    if scan.todo_after_offset {
        if let (Some(todos), Some(hid)) = (&scan.last_todos, &session_handoff) {
            if let Err(e) = sync_todos(&handoffs, hid, todos) {
                journal::warn(
                    &env.paths.journal(),
                    "todo_sync_failed",
                    serde_json::json!({ "handoff": hid, "error": format!("{e:#}") }),
                );
            }
        }
    }

    warn_if_heavy_without_handoff(&scan, session_handoff.is_some(), &handoffs)?;

    checkpoints.set_offset(sid, scan.new_offset, &transcript.display().to_string())?;
    if first_seen {
        DecayEngine::new(&env.paths, &env.config, &lessons).note_session()?;
    }

    Ok(serde_json::json!({
        "citations": scan.citations,
        "lessons_recorded": scan.lesson_commands.len(),
        "handoff_commands": scan.handoff_commands.len(),
        "edit_count": scan.edit_count,
        "new_offset": scan.new_offset,
    }))
}

fn apply_lesson_command(
    env: &HookEnv,
    lessons: &dyn LessonRepository,
    cmd: &scanner::LessonCommand,
) {
    let result = lessons.add(AddLesson {
        level: crate::models::Level::Project,
        category: cmd.category.unwrap_or(Category::Pattern),
        title: &cmd.title,
        content: &cmd.content,
        source: if cmd.ai { Source::Ai } else { Source::Human },
        promotable: true,
        kind: cmd.kind,
        force: false,
    });
    match result {
        Ok(lesson) => journal::info(
            &env.paths.journal(),
            "lesson_recorded",
            serde_json::json!({ "id": lesson.id, "title": lesson.title }),
        ),
        Err(e) if is_duplicate(&e) => journal::info(
            &env.paths.journal(),
            "lesson_duplicate_skipped",
            serde_json::json!({ "title": cmd.title }),
        ),
        Err(e) => journal::error(
            &env.paths.journal(),
            "lesson_add_failed",
            serde_json::json!({ "title": cmd.title, "error": format!("{e:#}") }),
        ),
    }
}

/// Returns the new handoff id when the command started one.
fn apply_handoff_command(
    env: &HookEnv,
    handoffs: &dyn HandoffRepository,
    checkpoints: &CheckpointStore,
    sid: &str,
    transcript: &std::path::Path,
    cmd: &HandoffCommand,
) -> Result<Option<String>> {
    match cmd {
        HandoffCommand::Start { title } => {
            let h = handoffs.add(AddHandoff::titled(title))?;
            handoffs.link_session(&h.id, sid)?;
            checkpoints.link_session_handoff(sid, &h.id, &transcript.display().to_string())?;
            journal::info(
                &env.paths.journal(),
                "handoff_started",
                serde_json::json!({ "id": h.id, "title": h.title }),
            );
            Ok(Some(h.id))
        }
        HandoffCommand::Tried {
            id,
            outcome,
            description,
        } => {
            let h = handoffs.add_tried_step(id, *outcome, description)?;
            if h.status == Status::Completed {
                journal::info(
                    &env.paths.journal(),
                    "handoff_auto_completed",
                    serde_json::json!({ "id": id }),
                );
            }
            Ok(None)
        }
        HandoffCommand::Update { id, field, value } => {
            match HandoffUpdate::from_field(field, value) {
                Some(update) => {
                    handoffs.update(id, update)?;
                }
                None => journal::warn(
                    &env.paths.journal(),
                    "handoff_update_unknown_field",
                    serde_json::json!({ "id": id, "field": field }),
                ),
            }
            Ok(None)
        }
        HandoffCommand::Complete { id } => {
            // Re-extracted COMPLETE lines land on an already-completed record.
            match handoffs.complete(id) {
                Ok(_) => Ok(None),
                Err(e) if is_not_found(&e) => {
                    journal::warn(
                        &env.paths.journal(),
                        "handoff_complete_unknown_id",
                        serde_json::json!({ "id": id }),
                    );
                    Ok(None)
                }
                Err(e) => Err(e),
            }
        }
    }
}

/// Mirror the assistant's todo list onto the linked handoff: open items
/// become next-steps, the in-progress item becomes the checkpoint.
pub fn sync_todos(
    handoffs: &dyn HandoffRepository,
    handoff_id: &str,
    todos: &[TodoItem],
) -> Result<()> {
    let open: Vec<&str> = todos
        .iter()
        .filter(|t| t.status != "completed")
        .map(|t| t.content.as_str())
        .collect();
    let in_progress = todos
        .iter()
        .find(|t| t.status == "in_progress")
        .map(|t| t.content.clone());

    let mut update = HandoffUpdate {
        next_steps: Some(open.join("; ")),
        ..Default::default()
    };
    if let Some(current) = in_progress {
        update.checkpoint = Some(current);
    }
    handoffs.update(handoff_id, update)?;
    Ok(())
}

fn warn_if_heavy_without_handoff(
    scan: &ScanOutcome,
    session_linked: bool,
    handoffs: &MarkdownHandoffs,
) -> Result<()> {
    if session_linked {
        return Ok(());
    }
    let heavy =
        scan.edit_count >= HEAVY_EDIT_THRESHOLD || scan.todo_write_count >= HEAVY_TODO_THRESHOLD;
    if !heavy {
        return Ok(());
    }
    let any_open = !handoffs
        .list(&HandoffFilter {
            status: Some(Status::InProgress),
            ..Default::default()
        })?
        .is_empty();
    if !any_open {
        eprintln!(
            "[claude-recall] {} files edited, {} todo writes, and no handoff — \
             start one with `HANDOFF: <title>`",
            scan.edit_count, scan.todo_write_count
        );
    }
    Ok(())
}

// ── pre-compact ───────────────────────────────────────────────────────────────

async fn pre_compact(env: &HookEnv) -> Result<Option<serde_json::Value>> {
    let Some(sid) = env.session_id() else {
        return Ok(None);
    };
    let Some(transcript) = env.transcript() else {
        return Ok(None);
    };

    journal::info(
        &env.paths.journal(),
        "pre_compact",
        serde_json::json!({ "session": sid, "trigger": env.payload.trigger }),
    );

    let checkpoints = env.checkpoints();
    let handoffs = env.handoffs();
    let scan = scanner::scan(&transcript, checkpoints.offset(&sid))?;
    let heavy =
        scan.edit_count >= HEAVY_EDIT_THRESHOLD || scan.todo_write_count >= HEAVY_TODO_THRESHOLD;

    let mut handoff = match checkpoints.session_handoff(&sid) {
        Some(id) => handoffs.get(&id)?,
        None => None,
    };
    if handoff.is_none() {
        handoff = handoffs
            .list(&HandoffFilter {
                status: Some(Status::InProgress),
                ..Default::default()
            })?
            .into_iter()
            .next();
    }
    if handoff.is_none() && heavy {
        let title = derive_title(&scan.user_texts);
        let h = handoffs.add(AddHandoff::titled(&title))?;
        let h = handoffs.update(
            &h.id,
            HandoffUpdate {
                phase: Some(Phase::Implementing),
                ..Default::default()
            },
        )?;
        handoffs.link_session(&h.id, &sid)?;
        checkpoints.link_session_handoff(&sid, &h.id, &transcript.display().to_string())?;
        journal::info(
            &env.paths.journal(),
            "handoff_auto_created",
            serde_json::json!({ "id": h.id, "title": h.title, "edits": scan.edit_count }),
        );
        handoff = Some(h);
    }

    let Some(handoff) = handoff else {
        return Ok(None);
    };

    let summarizer = Summarizer::from_config(env.config.summarizer.as_ref());
    let extracted = match &summarizer {
        Some(s) => {
            let tail = scanner::read_tail(&transcript, scanner::CONTEXT_TAIL_BYTES)?;
            s.extract_context(&tail).await
        }
        None => Err(anyhow::anyhow!("no summarizer configured")),
    };

    match extracted {
        Ok(context) => {
            handoffs.set_context(&handoff.id, context)?;
            journal::info(
                &env.paths.journal(),
                "handoff_context_saved",
                serde_json::json!({ "id": handoff.id }),
            );
        }
        Err(e) => {
            write_snapshot(env, &sid, &transcript, &scan)?;
            journal::warn(
                &env.paths.journal(),
                "context_extraction_fallback",
                serde_json::json!({ "id": handoff.id, "error": format!("{e:#}") }),
            );
        }
    }
    Ok(None)
}

fn write_snapshot(
    env: &HookEnv,
    sid: &str,
    transcript: &std::path::Path,
    scan: &ScanOutcome,
) -> Result<()> {
    let snapshot = SessionSnapshot {
        session_id: sid.to_string(),
        transcript_path: transcript.display().to_string(),
        saved_at: chrono::Utc::now().to_rfc3339(),
        edit_count: scan.edit_count,
        last_user_text: scan.user_texts.last().cloned(),
    };
    crate::store::atomic_write(
        &env.paths.session_snapshot(),
        &serde_json::to_string_pretty(&snapshot)?,
    )
}

/// A handoff title out of the most recent user ask, or a dated fallback.
fn derive_title(user_texts: &[String]) -> String {
    for text in user_texts.iter().rev() {
        let line = text.lines().find(|l| !l.trim().is_empty());
        if let Some(line) = line {
            let title = crate::models::sanitize_line(line, TITLE_MAX_CHARS);
            if !title.is_empty() {
                return title;
            }
        }
    }
    format!("Session work {}", today().format("%Y-%m-%d"))
}

// ── session-end ───────────────────────────────────────────────────────────────

const CLEAN_STOP_REASONS: &[&str] = &["user", "end_turn", "max_turns", "stop_sequence", ""];

fn is_clean_exit(stop_reason: Option<&str>) -> bool {
    match stop_reason {
        None => true,
        Some(reason) => CLEAN_STOP_REASONS.contains(&reason),
    }
}

fn session_end(env: &HookEnv) -> Result<Option<serde_json::Value>> {
    if !is_clean_exit(env.payload.stop_reason.as_deref()) {
        return Ok(None);
    }
    let Some(sid) = env.session_id() else {
        return Ok(None);
    };
    let Some(transcript) = env.transcript() else {
        return Ok(None);
    };

    // Context extraction can take the summarizer's full deadline; hand it to
    // a detached child and return to the host immediately.
    let transcript = transcript.display().to_string();
    detach::spawn_detached(
        &["extract-context", &transcript, "--session", &sid, "--apply"],
        &env.detach_log(),
    )?;
    Ok(None)
}
