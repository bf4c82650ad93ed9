//! CLI command handlers. Every command prints a JSON document on stdout;
//! mutating commands honor the `enabled` config switch and become no-ops
//! when it is off.

use anyhow::Result;
use std::path::PathBuf;

use crate::cli::{get_flag, has_flag};
use crate::config::{Config, Paths};
use crate::decay::DecayEngine;
use crate::hooks;
use crate::inject::{self, InjectOptions};
use crate::models::{Agent, Category, ContextRecord, Handoff, Lesson, LessonKind, Level, Source, Status, StepOutcome};
use crate::rank::{self, RelevanceCache};
use crate::scanner;
use crate::store::checkpoints::CheckpointStore;
use crate::store::handoffs::{
    AddHandoff, HandoffFilter, HandoffRepository, HandoffUpdate, MarkdownHandoffs,
};
use crate::store::lessons::{
    AddLesson, LessonEdit, LessonFilter, LessonRepository, MarkdownLessons,
};
use crate::summarize::Summarizer;

/// Bad or missing arguments; exits 1 with the message on stderr.
#[derive(Debug)]
pub struct UsageError(pub String);

impl std::fmt::Display for UsageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for UsageError {}

fn usage(msg: impl Into<String>) -> anyhow::Error {
    anyhow::Error::new(UsageError(msg.into()))
}

pub struct Ctx {
    pub paths: Paths,
    pub config: Config,
}

impl Ctx {
    pub fn resolve() -> Ctx {
        let paths = Paths::resolve(None);
        let config = Config::load(&paths);
        Ctx { paths, config }
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

    /// True when mutations are switched off; the caller should return quietly.
    fn disabled(&self) -> bool {
        !self.config.enabled
    }
}

fn emit(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn lesson_json(l: &Lesson) -> serde_json::Value {
    serde_json::json!({
        "id": l.id,
        "title": l.title,
        "content": l.content,
        "category": l.category.as_str(),
        "uses": l.uses,
        "velocity": l.velocity,
        "stars": l.stars(),
        "learned": l.learned.format("%Y-%m-%d").to_string(),
        "last_used": l.last_used.format("%Y-%m-%d").to_string(),
        "source": l.source.as_str(),
        "level": l.level,
        "promotable": l.promotable,
        "type": l.kind.map(|k| k.as_str()),
        "triggers": l.triggers,
    })
}

fn handoff_json(h: &Handoff) -> serde_json::Value {
    serde_json::json!({
        "id": h.id,
        "title": h.title,
        "status": h.status.as_str(),
        "phase": h.phase.as_str(),
        "agent": h.agent.as_str(),
        "created": h.created.format("%Y-%m-%d").to_string(),
        "updated": h.updated.format("%Y-%m-%d").to_string(),
        "description": h.description,
        "next_steps": h.next_steps,
        "refs": h.refs,
        "tried": h.tried.iter().map(|s| serde_json::json!({
            "outcome": s.outcome.as_str(),
            "description": s.description,
        })).collect::<Vec<_>>(),
        "checkpoint": h.checkpoint,
        "blocked_by": h.blocked_by,
        "sessions": h.sessions,
        "stealth": h.stealth,
        "context": h.context,
    })
}

// ── lesson commands ───────────────────────────────────────────────────────────

pub fn cmd_inject(ctx: &Ctx, args: &[String]) -> Result<()> {
    let top_n = args
        .first()
        .filter(|a| !a.starts_with("--"))
        .map(|a| {
            a.parse::<usize>()
                .map_err(|_| usage(format!("inject: '{a}' is not a count")))
        })
        .transpose()?
        .unwrap_or(ctx.config.top_n);

    let lessons = ctx.lessons().list(&LessonFilter::default())?;
    let active = ctx.handoffs().list(&HandoffFilter::default())?;
    let continuation = active.iter().find(|h| h.status == Status::InProgress);

    let injection = inject::build_injection(
        &lessons,
        &active,
        continuation,
        &InjectOptions {
            top_n,
            theme_keywords: ctx.config.theme_keywords.clone(),
            include_duties: true,
        },
    );
    emit(&serde_json::json!({
        "context": injection.text,
        "budget": injection.budget,
    }))
}

pub fn cmd_add(ctx: &Ctx, args: &[String]) -> Result<()> {
    if ctx.disabled() {
        return Ok(());
    }
    let positional: Vec<&str> = args
        .iter()
        .filter(|a| !a.starts_with("--"))
        .map(|a| a.as_str())
        .collect();
    let &[category, title, content] = positional.as_slice() else {
        return Err(usage("add <category> <title> <content> [--system] [--no-promote] [--type T] [--force]"));
    };
    let category = Category::parse(category)
        .ok_or_else(|| usage(format!("add: unknown category '{category}'")))?;
    let kind = get_flag(args, "--type")
        .map(|t| LessonKind::parse(&t).ok_or_else(|| usage(format!("add: unknown type '{t}'"))))
        .transpose()?;

    let lesson = ctx.lessons().add(AddLesson {
        level: if has_flag(args, "--system") {
            Level::System
        } else {
            Level::Project
        },
        category,
        title,
        content,
        source: Source::Human,
        promotable: !has_flag(args, "--no-promote"),
        kind,
        force: has_flag(args, "--force"),
    })?;
    emit(&lesson_json(&lesson))
}

pub fn cmd_cite(ctx: &Ctx, args: &[String]) -> Result<()> {
    if ctx.disabled() {
        return Ok(());
    }
    if args.is_empty() {
        return Err(usage("cite <id>..."));
    }
    let outcome = ctx.lessons().cite(args)?;
    emit(&serde_json::json!({
        "cited": outcome.cited,
        "missing": outcome.missing,
    }))
}

pub fn cmd_list(ctx: &Ctx, args: &[String]) -> Result<()> {
    let category = get_flag(args, "--category")
        .map(|c| Category::parse(&c).ok_or_else(|| usage(format!("list: unknown category '{c}'"))))
        .transpose()?;
    let filter = LessonFilter {
        category,
        stale: has_flag(args, "--stale"),
        query: get_flag(args, "--search"),
    };
    let lessons = ctx.lessons().list(&filter)?;
    emit(&serde_json::json!({
        "lessons": lessons.iter().map(lesson_json).collect::<Vec<_>>(),
    }))
}

pub fn cmd_show(ctx: &Ctx, args: &[String]) -> Result<()> {
    let Some(id) = args.first() else {
        return Err(usage("show <id>"));
    };
    match ctx.lessons().get(id)? {
        Some(lesson) => emit(&lesson_json(&lesson)),
        None => Err(anyhow::Error::new(crate::store::NotFound(id.clone()))),
    }
}

pub fn cmd_edit(ctx: &Ctx, args: &[String]) -> Result<()> {
    if ctx.disabled() {
        return Ok(());
    }
    let Some(id) = args.first().filter(|a| !a.starts_with("--")) else {
        return Err(usage("edit <id> [--title T] [--content C] [--category C] [--promotable yes|no] [--type T] [--triggers a,b]"));
    };
    let category = get_flag(args, "--category")
        .map(|c| Category::parse(&c).ok_or_else(|| usage(format!("edit: unknown category '{c}'"))))
        .transpose()?;
    let kind = get_flag(args, "--type")
        .map(|t| LessonKind::parse(&t).ok_or_else(|| usage(format!("edit: unknown type '{t}'"))))
        .transpose()?;
    let edit = LessonEdit {
        title: get_flag(args, "--title"),
        content: get_flag(args, "--content"),
        category,
        promotable: get_flag(args, "--promotable").map(|v| v != "no"),
        kind,
        triggers: get_flag(args, "--triggers")
            .map(|t| t.split(',').map(|s| s.trim().to_string()).collect()),
    };
    let lesson = ctx.lessons().edit(id, edit)?;
    emit(&lesson_json(&lesson))
}

pub fn cmd_delete(ctx: &Ctx, args: &[String]) -> Result<()> {
    if ctx.disabled() {
        return Ok(());
    }
    let Some(id) = args.first() else {
        return Err(usage("delete <id>"));
    };
    ctx.lessons().delete(id)?;
    emit(&serde_json::json!({ "deleted": id }))
}

pub fn cmd_promote(ctx: &Ctx, args: &[String]) -> Result<()> {
    if ctx.disabled() {
        return Ok(());
    }
    let Some(id) = args.first() else {
        return Err(usage("promote <id>"));
    };
    let promoted = ctx.lessons().promote(id)?;
    emit(&serde_json::json!({ "promoted": id, "system_id": promoted.id }))
}

pub fn cmd_decay(ctx: &Ctx, args: &[String]) -> Result<()> {
    if ctx.disabled() {
        return Ok(());
    }
    let lessons = ctx.lessons();
    let engine = DecayEngine::new(&ctx.paths, &ctx.config, &lessons);
    let report = engine.run(has_flag(args, "--force"))?;
    emit(&serde_json::json!({
        "ran": report.ran,
        "lessons_touched": report.lessons_touched,
        "uses_decremented": report.uses_decremented,
    }))
}

// ── handoff commands ──────────────────────────────────────────────────────────

pub async fn cmd_handoff(ctx: &Ctx, args: &[String]) -> Result<()> {
    let Some(sub) = args.first().map(|s| s.as_str()) else {
        return Err(usage("handoff <list|show|add|update|tried|complete|archive|inject|inject-todos|sync-todos|set-context|set-session|get-session-handoff|process-transcript>"));
    };
    let rest = &args[1..];
    match sub {
        "list" => handoff_list(ctx, rest),
        "show" => handoff_show(ctx, rest),
        "add" => handoff_add(ctx, rest),
        "update" => handoff_update(ctx, rest),
        "tried" => handoff_tried(ctx, rest),
        "complete" => handoff_complete(ctx, rest),
        "archive" => handoff_archive(ctx),
        "inject" => handoff_inject(ctx),
        "inject-todos" => handoff_inject_todos(ctx),
        "sync-todos" => handoff_sync_todos(ctx, rest),
        "set-context" => handoff_set_context(ctx, rest),
        "set-session" => handoff_set_session(ctx, rest),
        "get-session-handoff" => handoff_get_session(ctx, rest),
        "process-transcript" => handoff_process_transcript(ctx, rest).await,
        other => Err(usage(format!("handoff: unknown subcommand '{other}'"))),
    }
}

fn handoff_list(ctx: &Ctx, args: &[String]) -> Result<()> {
    let status = get_flag(args, "--status")
        .map(|s| Status::parse(&s).ok_or_else(|| usage(format!("handoff list: unknown status '{s}'"))))
        .transpose()?;
    let filter = HandoffFilter {
        status,
        include_completed: has_flag(args, "--all"),
    };
    let handoffs = ctx.handoffs().list(&filter)?;
    emit(&serde_json::json!({
        "handoffs": handoffs.iter().map(handoff_json).collect::<Vec<_>>(),
    }))
}

fn handoff_show(ctx: &Ctx, args: &[String]) -> Result<()> {
    let Some(id) = args.first() else {
        return Err(usage("handoff show <id>"));
    };
    match ctx.handoffs().get(id)? {
        Some(h) => emit(&handoff_json(&h)),
        None => Err(anyhow::Error::new(crate::store::NotFound(id.clone()))),
    }
}

fn handoff_add(ctx: &Ctx, args: &[String]) -> Result<()> {
    if ctx.disabled() {
        return Ok(());
    }
    let Some(title) = args.first().filter(|a| !a.starts_with("--")) else {
        return Err(usage("handoff add <title> [--stealth] [--agent A] [--description D]"));
    };
    let agent = get_flag(args, "--agent")
        .map(|a| Agent::parse(&a).ok_or_else(|| usage(format!("handoff add: unknown agent '{a}'"))))
        .transpose()?
        .unwrap_or(Agent::GeneralPurpose);
    let description = get_flag(args, "--description").unwrap_or_default();
    let h = ctx.handoffs().add(AddHandoff {
        title,
        description: &description,
        agent,
        stealth: has_flag(args, "--stealth"),
    })?;
    emit(&handoff_json(&h))
}

fn handoff_update(ctx: &Ctx, args: &[String]) -> Result<()> {
    if ctx.disabled() {
        return Ok(());
    }
    let Some(id) = args.first().filter(|a| !a.starts_with("--")) else {
        return Err(usage("handoff update <id> [--status S] [--phase P] [--agent A] [--title T] [--description D] [--next N] [--checkpoint C] [--refs a,b] [--blocked-by x,y]"));
    };
    let mut update = HandoffUpdate {
        title: get_flag(args, "--title"),
        description: get_flag(args, "--description"),
        next_steps: get_flag(args, "--next"),
        checkpoint: get_flag(args, "--checkpoint"),
        refs: get_flag(args, "--refs")
            .map(|v| v.split(',').map(|s| s.trim().to_string()).collect()),
        blocked_by: get_flag(args, "--blocked-by")
            .map(|v| v.split(',').map(|s| s.trim().to_string()).collect()),
        ..Default::default()
    };
    update.status = get_flag(args, "--status")
        .map(|s| Status::parse(&s).ok_or_else(|| usage(format!("handoff update: unknown status '{s}'"))))
        .transpose()?;
    update.phase = get_flag(args, "--phase")
        .map(|p| {
            crate::models::Phase::parse(&p)
                .ok_or_else(|| usage(format!("handoff update: unknown phase '{p}'")))
        })
        .transpose()?;
    update.agent = get_flag(args, "--agent")
        .map(|a| Agent::parse(&a).ok_or_else(|| usage(format!("handoff update: unknown agent '{a}'"))))
        .transpose()?;
    let h = ctx.handoffs().update(id, update)?;
    emit(&handoff_json(&h))
}

fn handoff_tried(ctx: &Ctx, args: &[String]) -> Result<()> {
    if ctx.disabled() {
        return Ok(());
    }
    let [id, outcome, description @ ..] = args else {
        return Err(usage("handoff tried <id> <success|fail|partial> <description>"));
    };
    if description.is_empty() {
        return Err(usage("handoff tried <id> <success|fail|partial> <description>"));
    }
    let outcome = StepOutcome::parse(outcome)
        .ok_or_else(|| usage(format!("handoff tried: unknown outcome '{outcome}'")))?;
    let h = ctx
        .handoffs()
        .add_tried_step(id, outcome, &description.join(" "))?;
    emit(&handoff_json(&h))
}

fn handoff_complete(ctx: &Ctx, args: &[String]) -> Result<()> {
    if ctx.disabled() {
        return Ok(());
    }
    let Some(id) = args.first() else {
        return Err(usage("handoff complete <id>"));
    };
    let h = ctx.handoffs().complete(id)?;
    emit(&handoff_json(&h))
}

fn handoff_archive(ctx: &Ctx) -> Result<()> {
    if ctx.disabled() {
        return Ok(());
    }
    let archived = ctx.handoffs().archive()?;
    emit(&serde_json::json!({ "archived": archived }))
}

fn handoff_inject(ctx: &Ctx) -> Result<()> {
    let active = ctx.handoffs().list(&HandoffFilter::default())?;
    let continuation = active.iter().find(|h| h.status == Status::InProgress);
    let injection = inject::build_injection(
        &[],
        &active,
        continuation,
        &InjectOptions {
            top_n: 0,
            theme_keywords: ctx.config.theme_keywords.clone(),
            include_duties: false,
        },
    );
    emit(&serde_json::json!({
        "context": injection.text,
        "budget": injection.budget,
    }))
}

fn handoff_inject_todos(ctx: &Ctx) -> Result<()> {
    let active = ctx.handoffs().list(&HandoffFilter {
        status: Some(Status::InProgress),
        ..Default::default()
    })?;
    let todos: Vec<serde_json::Value> = active
        .first()
        .map(|h| {
            h.next_steps
                .split(';')
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .map(|s| serde_json::json!({ "content": s, "status": "pending" }))
                .collect()
        })
        .unwrap_or_default();
    emit(&serde_json::json!({
        "handoff": active.first().map(|h| h.id.clone()),
        "todos": todos,
    }))
}

fn handoff_sync_todos(ctx: &Ctx, args: &[String]) -> Result<()> {
    if ctx.disabled() {
        return Ok(());
    }
    let Some(raw) = args.first().filter(|a| !a.starts_with("--")) else {
        return Err(usage("handoff sync-todos <json> [--session <sid>]"));
    };
    let parsed: Vec<serde_json::Value> =
        serde_json::from_str(raw).map_err(|e| usage(format!("sync-todos: bad JSON ({e})")))?;
    let todos: Vec<scanner::TodoItem> = parsed
        .iter()
        .filter_map(|t| {
            Some(scanner::TodoItem {
                content: t["content"].as_str()?.to_string(),
                status: t["status"].as_str().unwrap_or("pending").to_string(),
            })
        })
        .collect();

    let handoff_id = match get_flag(args, "--session")
        .or_else(|| crate::config::session_id(None))
        .and_then(|sid| ctx.checkpoints().session_handoff(&sid))
    {
        Some(id) => id,
        None => {
            // Fall back to the most recent in-progress handoff.
            ctx.handoffs()
                .list(&HandoffFilter {
                    status: Some(Status::InProgress),
                    ..Default::default()
                })?
                .first()
                .map(|h| h.id.clone())
                .ok_or_else(|| usage("sync-todos: no session link and no in-progress handoff"))?
        }
    };
    hooks::sync_todos(&ctx.handoffs(), &handoff_id, &todos)?;
    emit(&serde_json::json!({ "synced": handoff_id, "todos": todos.len() }))
}

fn handoff_set_context(ctx: &Ctx, args: &[String]) -> Result<()> {
    if ctx.disabled() {
        return Ok(());
    }
    let Some(id) = args.first().filter(|a| !a.starts_with("--")) else {
        return Err(usage("handoff set-context <id> --json <object>"));
    };
    let raw = get_flag(args, "--json")
        .ok_or_else(|| usage("handoff set-context <id> --json <object>"))?;
    let context: ContextRecord =
        serde_json::from_str(&raw).map_err(|e| usage(format!("set-context: bad JSON ({e})")))?;
    let h = ctx.handoffs().set_context(id, context)?;
    emit(&handoff_json(&h))
}

fn handoff_set_session(ctx: &Ctx, args: &[String]) -> Result<()> {
    if ctx.disabled() {
        return Ok(());
    }
    let [hid, sid] = args else {
        return Err(usage("handoff set-session <handoff-id> <session-id>"));
    };
    ctx.handoffs().link_session(hid, sid)?;
    ctx.checkpoints().link_session_handoff(sid, hid, "")?;
    emit(&serde_json::json!({ "handoff": hid, "session": sid }))
}

fn handoff_get_session(ctx: &Ctx, args: &[String]) -> Result<()> {
    let Some(sid) = args.first() else {
        return Err(usage("handoff get-session-handoff <session-id>"));
    };
    emit(&serde_json::json!({
        "session": sid,
        "handoff": ctx.checkpoints().session_handoff(sid),
    }))
}

async fn handoff_process_transcript(ctx: &Ctx, args: &[String]) -> Result<()> {
    if ctx.disabled() {
        return Ok(());
    }
    let sid = get_flag(args, "--session")
        .or_else(|| crate::config::session_id(None))
        .ok_or_else(|| usage("handoff process-transcript --session <sid> --transcript <path>"))?;
    let transcript = get_flag(args, "--transcript")
        .map(PathBuf::from)
        .ok_or_else(|| usage("handoff process-transcript --session <sid> --transcript <path>"))?;
    let summary = hooks::process_transcript(&ctx.paths, &ctx.config, &sid, &transcript).await?;
    emit(&summary)
}

// ── scoring & context commands ────────────────────────────────────────────────

pub async fn cmd_score_relevance(ctx: &Ctx, args: &[String]) -> Result<()> {
    let Some(query) = args.first().filter(|a| !a.starts_with("--")) else {
        return Err(usage("score-relevance <query> [--top N] [--min-score M] [--timeout S]"));
    };
    let top = parse_flag_num(args, "--top")?.unwrap_or(ctx.config.top_n);
    let min_score = parse_flag_num(args, "--min-score")?.unwrap_or(1) as u8;

    let mut config = ctx.config.clone();
    if let Some(timeout) = parse_flag_num(args, "--timeout")? {
        if let Some(s) = config.summarizer.as_mut() {
            s.timeout_secs = timeout as u64;
        }
    }

    let lessons = ctx.lessons().list(&LessonFilter::default())?;
    let cache = RelevanceCache::new(&ctx.paths, &config);
    let summarizer = Summarizer::from_config(config.summarizer.as_ref());
    let scored = rank::rank_lessons(&lessons, query, summarizer.as_ref(), &cache).await;
    emit_scores(&scored, top, min_score)
}

pub fn cmd_score_local(ctx: &Ctx, args: &[String]) -> Result<()> {
    let Some(query) = args.first().filter(|a| !a.starts_with("--")) else {
        return Err(usage("score-local <query> [--top N]"));
    };
    let top = parse_flag_num(args, "--top")?.unwrap_or(ctx.config.top_n);
    let lessons = ctx.lessons().list(&LessonFilter::default())?;
    let scored = rank::bm25_rank(&lessons, query);
    emit_scores(&scored, top, 0)
}

fn emit_scores(scored: &[rank::ScoredLesson], top: usize, min_score: u8) -> Result<()> {
    let picked: Vec<serde_json::Value> = scored
        .iter()
        .filter(|s| s.score >= min_score)
        .take(top)
        .map(|s| {
            serde_json::json!({
                "id": s.lesson.id,
                "score": s.score,
                "title": s.lesson.title,
            })
        })
        .collect();
    emit(&serde_json::json!({ "scores": picked }))
}

pub async fn cmd_extract_context(ctx: &Ctx, args: &[String]) -> Result<()> {
    let Some(path) = args.first().filter(|a| !a.starts_with("--")) else {
        return Err(usage("extract-context <transcript-path> [--git-ref R] [--session S] [--apply]"));
    };
    let transcript = PathBuf::from(path);
    let Some(summarizer) = Summarizer::from_config(ctx.config.summarizer.as_ref()) else {
        return Err(anyhow::anyhow!("no summarizer configured in config.json"));
    };

    let tail = scanner::read_tail(&transcript, scanner::CONTEXT_TAIL_BYTES)?;
    let mut context = summarizer.extract_context(&tail).await?;
    if let Some(git_ref) = get_flag(args, "--git-ref") {
        context.git_ref = Some(git_ref);
    }

    if has_flag(args, "--apply") {
        if ctx.disabled() {
            return Ok(());
        }
        let handoff_id = get_flag(args, "--session")
            .and_then(|sid| ctx.checkpoints().session_handoff(&sid))
            .or_else(|| {
                ctx.handoffs()
                    .list(&HandoffFilter {
                        status: Some(Status::InProgress),
                        ..Default::default()
                    })
                    .ok()
                    .and_then(|hs| hs.first().map(|h| h.id.clone()))
            });
        match handoff_id {
            Some(id) => {
                ctx.handoffs().set_context(&id, context)?;
                return emit(&serde_json::json!({ "applied": id }));
            }
            None => return emit(&serde_json::json!({ "applied": null, "context": context })),
        }
    }
    emit(&serde_json::to_value(&context)?)
}

pub async fn cmd_prescore_cache(ctx: &Ctx, args: &[String]) -> Result<()> {
    if ctx.disabled() {
        return Ok(());
    }
    let transcript = get_flag(args, "--transcript")
        .map(PathBuf::from)
        .ok_or_else(|| usage("prescore-cache --transcript <path>"))?;

    let scan = scanner::scan(&transcript, 0)?;
    let Some(query) = scan.user_texts.last().cloned() else {
        return emit(&serde_json::json!({ "cached": false, "reason": "no user prompt found" }));
    };

    let lessons = ctx.lessons().list(&LessonFilter::default())?;
    let cache = RelevanceCache::new(&ctx.paths, &ctx.config);
    let summarizer = Summarizer::from_config(ctx.config.summarizer.as_ref());
    if summarizer.is_none() {
        return emit(&serde_json::json!({ "cached": false, "reason": "no summarizer configured" }));
    }
    // Warms the cache as a side effect of ranking.
    let _ = rank::rank_lessons(&lessons, &query, summarizer.as_ref(), &cache).await;
    emit(&serde_json::json!({ "cached": true, "query": query }))
}

fn parse_flag_num(args: &[String], flag: &str) -> Result<Option<usize>> {
    get_flag(args, flag)
        .map(|v| {
            v.parse::<usize>()
                .map_err(|_| usage(format!("{flag} requires a number, got '{v}'")))
        })
        .transpose()
}
