use anyhow::Result;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::{Config, Paths};
use crate::lock::FileLock;
use crate::markdown;
use crate::models::{
    sanitize_block, sanitize_line, today, Agent, ContextRecord, Handoff, Phase, Status,
    StepOutcome, MAX_CONTENT_CHARS, MAX_TITLE_CHARS,
};
use crate::store::{atomic_write, read_or_empty, NotFound};

const ARCHIVE_KEEP_RECENT: usize = 3;
const ARCHIVE_KEEP_DAYS: i64 = 7;
const ID_COLLISION_RETRIES: usize = 4;

/// Narrow capability surface for handoff persistence.
pub trait HandoffRepository {
    fn add(&self, req: AddHandoff<'_>) -> Result<Handoff>;
    fn get(&self, id: &str) -> Result<Option<Handoff>>;
    fn list(&self, filter: &HandoffFilter) -> Result<Vec<Handoff>>;
    fn update(&self, id: &str, update: HandoffUpdate) -> Result<Handoff>;
    fn add_tried_step(&self, id: &str, outcome: StepOutcome, description: &str) -> Result<Handoff>;
    fn complete(&self, id: &str) -> Result<Handoff>;
    fn archive(&self) -> Result<usize>;
    fn set_context(&self, id: &str, context: ContextRecord) -> Result<Handoff>;
    fn link_session(&self, id: &str, session_id: &str) -> Result<Handoff>;
}

pub struct AddHandoff<'a> {
    pub title: &'a str,
    pub description: &'a str,
    pub agent: Agent,
    pub stealth: bool,
}

impl<'a> AddHandoff<'a> {
    pub fn titled(title: &'a str) -> Self {
        AddHandoff {
            title,
            description: "",
            agent: Agent::GeneralPurpose,
            stealth: false,
        }
    }
}

#[derive(Default, Debug)]
pub struct HandoffFilter {
    pub status: Option<Status>,
    pub include_completed: bool,
}

/// Field-wise update; `None` leaves the field alone.
#[derive(Default, Debug)]
pub struct HandoffUpdate {
    pub title: Option<String>,
    pub status: Option<Status>,
    pub phase: Option<Phase>,
    pub agent: Option<Agent>,
    pub description: Option<String>,
    pub next_steps: Option<String>,
    pub checkpoint: Option<String>,
    pub refs: Option<Vec<String>>,
    pub blocked_by: Option<Vec<String>>,
}

impl HandoffUpdate {
    /// Parse one `field: value` pair from a `HANDOFF UPDATE` command.
    /// Unknown fields yield None so callers can warn without failing.
    pub fn from_field(field: &str, value: &str) -> Option<HandoffUpdate> {
        let mut update = HandoffUpdate::default();
        match field.trim().to_lowercase().as_str() {
            "title" => update.title = Some(value.to_string()),
            "status" => update.status = Some(Status::parse(value)?),
            "phase" => update.phase = Some(Phase::parse(value)?),
            "agent" => update.agent = Some(Agent::parse(value)?),
            "description" => update.description = Some(value.to_string()),
            "next" | "next_steps" => update.next_steps = Some(value.to_string()),
            "checkpoint" => update.checkpoint = Some(value.to_string()),
            "refs" => {
                update.refs = Some(
                    value
                        .split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect(),
                )
            }
            "blocked-by" | "blocked_by" => {
                update.blocked_by = Some(
                    value
                        .split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect(),
                )
            }
            _ => return None,
        }
        Some(update)
    }
}

/// Shared (`HANDOFFS.md`) and stealth (`HANDOFFS_LOCAL.md`) files, plus an
/// append-only archive. Mutations follow the lesson store discipline.
pub struct MarkdownHandoffs {
    shared: PathBuf,
    local: PathBuf,
    archive: PathBuf,
    lock_timeout: Duration,
}

impl MarkdownHandoffs {
    pub fn new(paths: &Paths, config: &Config) -> Self {
        MarkdownHandoffs {
            shared: paths.handoffs(false),
            local: paths.handoffs(true),
            archive: paths.handoffs_archive(),
            lock_timeout: Duration::from_secs(config.lock_timeout_secs),
        }
    }

    fn file(&self, stealth: bool) -> &PathBuf {
        if stealth {
            &self.local
        } else {
            &self.shared
        }
    }

    fn load(&self, stealth: bool) -> Result<Vec<Handoff>> {
        let (handoffs, warnings) =
            markdown::parse_handoffs(&read_or_empty(self.file(stealth))?, stealth);
        for w in warnings {
            eprintln!("[claude-recall] {w}");
        }
        Ok(handoffs)
    }

    fn mutate<T>(
        &self,
        stealth: bool,
        f: impl FnOnce(&mut Vec<Handoff>) -> Result<T>,
    ) -> Result<T> {
        let path = self.file(stealth);
        let _guard = FileLock::acquire(path, self.lock_timeout)?;
        let mut handoffs = self.load(stealth)?;
        let out = f(&mut handoffs)?;
        atomic_write(path, &markdown::serialize_handoffs(&handoffs))?;
        Ok(out)
    }

    /// Find which file holds `id`, then run the mutation there.
    fn mutate_by_id(
        &self,
        id: &str,
        f: impl Fn(&mut Handoff) -> Result<()>,
    ) -> Result<Handoff> {
        for stealth in [false, true] {
            if !self.load(stealth)?.iter().any(|h| h.id == id) {
                continue;
            }
            return self.mutate(stealth, |handoffs| {
                let h = handoffs
                    .iter_mut()
                    .find(|h| h.id == id)
                    .ok_or_else(|| anyhow::Error::new(NotFound(id.to_string())))?;
                f(h)?;
                h.normalize_state();
                Ok(h.clone())
            });
        }
        Err(anyhow::Error::new(NotFound(id.to_string())))
    }

    fn archive_file(&self, moved: &[Handoff]) -> Result<()> {
        if moved.is_empty() {
            return Ok(());
        }
        let _guard = FileLock::acquire(&self.archive, self.lock_timeout)?;
        let mut content = read_or_empty(&self.archive)?;
        if content.is_empty() {
            content = "# Archived Handoffs\n\n".to_string();
        }
        let serialized = markdown::serialize_handoffs(moved);
        let records = serialized
            .strip_prefix("# Handoffs\n\n")
            .unwrap_or(&serialized);
        content.push_str(records);
        atomic_write(&self.archive, &content)
    }

    /// Which completed records stay active: updated within the window, or
    /// among the most recent few regardless of age.
    fn partition_completed(completed: Vec<Handoff>) -> (Vec<Handoff>, Vec<Handoff>) {
        let mut completed = completed;
        completed.sort_by(|a, b| b.updated.cmp(&a.updated));
        let cutoff = today() - chrono::Duration::days(ARCHIVE_KEEP_DAYS);
        let mut keep = Vec::new();
        let mut archive = Vec::new();
        for (i, h) in completed.into_iter().enumerate() {
            if h.updated >= cutoff || i < ARCHIVE_KEEP_RECENT {
                keep.push(h);
            } else {
                archive.push(h);
            }
        }
        (keep, archive)
    }
}

impl HandoffRepository for MarkdownHandoffs {
    fn add(&self, req: AddHandoff<'_>) -> Result<Handoff> {
        self.mutate(req.stealth, |handoffs| {
            let mut h = Handoff::new(req.title, req.stealth);
            // Random 28-bit ids collide rarely; retry on the off chance.
            let mut attempts = 0;
            while handoffs.iter().any(|existing| existing.id == h.id) {
                attempts += 1;
                if attempts > ID_COLLISION_RETRIES {
                    anyhow::bail!("could not generate a unique handoff id");
                }
                h.id = crate::models::new_handoff_id();
            }
            h.description = sanitize_block(req.description, MAX_CONTENT_CHARS);
            h.agent = req.agent;
            handoffs.push(h.clone());
            Ok(h)
        })
    }

    fn get(&self, id: &str) -> Result<Option<Handoff>> {
        for stealth in [false, true] {
            if let Some(h) = self.load(stealth)?.into_iter().find(|h| h.id == id) {
                return Ok(Some(h));
            }
        }
        Ok(None)
    }

    fn list(&self, filter: &HandoffFilter) -> Result<Vec<Handoff>> {
        let mut out = Vec::new();
        for stealth in [false, true] {
            for h in self.load(stealth)? {
                if let Some(status) = filter.status {
                    if h.status != status {
                        continue;
                    }
                } else if h.status == Status::Completed && !filter.include_completed {
                    continue;
                }
                out.push(h);
            }
        }
        out.sort_by(|a, b| b.updated.cmp(&a.updated));
        Ok(out)
    }

    fn update(&self, id: &str, update: HandoffUpdate) -> Result<Handoff> {
        self.mutate_by_id(id, move |h| {
            if let Some(title) = &update.title {
                h.title = sanitize_line(title, MAX_TITLE_CHARS);
            }
            if let Some(status) = update.status {
                h.status = status;
            }
            if let Some(phase) = update.phase {
                h.phase = phase;
            }
            if let Some(agent) = update.agent {
                h.agent = agent;
            }
            if let Some(description) = &update.description {
                h.description = sanitize_block(description, MAX_CONTENT_CHARS);
            }
            if let Some(next_steps) = &update.next_steps {
                h.next_steps = sanitize_line(next_steps, MAX_CONTENT_CHARS);
            }
            if let Some(checkpoint) = &update.checkpoint {
                h.checkpoint = sanitize_meta(checkpoint);
            }
            if let Some(refs) = &update.refs {
                h.refs = refs.iter().map(|r| sanitize_meta(r)).collect();
            }
            if let Some(blocked_by) = &update.blocked_by {
                h.blocked_by = blocked_by.clone();
            }
            h.updated = today();
            Ok(())
        })
    }

    fn add_tried_step(&self, id: &str, outcome: StepOutcome, description: &str) -> Result<Handoff> {
        self.mutate_by_id(id, |h| {
            h.add_tried_step(outcome, description);
            Ok(())
        })
    }

    fn complete(&self, id: &str) -> Result<Handoff> {
        self.mutate_by_id(id, |h| {
            h.complete();
            Ok(())
        })
    }

    fn archive(&self) -> Result<usize> {
        let mut total = 0;
        for stealth in [false, true] {
            let moved = self.mutate(stealth, |handoffs| {
                let (completed, active): (Vec<_>, Vec<_>) = std::mem::take(handoffs)
                    .into_iter()
                    .partition(|h| h.status == Status::Completed);
                let (keep, moved) = Self::partition_completed(completed);
                *handoffs = active;
                handoffs.extend(keep);
                Ok(moved)
            })?;
            total += moved.len();
            self.archive_file(&moved)?;
        }
        Ok(total)
    }

    fn set_context(&self, id: &str, context: ContextRecord) -> Result<Handoff> {
        let context = sanitize_context(context);
        self.mutate_by_id(id, move |h| {
            h.context = if context.is_empty() {
                None
            } else {
                Some(context.clone())
            };
            h.updated = today();
            Ok(())
        })
    }

    fn link_session(&self, id: &str, session_id: &str) -> Result<Handoff> {
        let session_id = sanitize_meta(session_id);
        self.mutate_by_id(id, move |h| {
            h.link_session(&session_id);
            Ok(())
        })
    }
}

/// Metadata values share a ` | `-delimited bullet line; keep them single-line
/// and free of the delimiters.
fn sanitize_meta(s: &str) -> String {
    sanitize_line(s, MAX_TITLE_CHARS)
        .replace('|', "/")
        .replace(';', ",")
}

fn sanitize_context(mut ctx: ContextRecord) -> ContextRecord {
    let clean_list = |items: Vec<String>| -> Vec<String> {
        items
            .into_iter()
            .map(|s| sanitize_meta(&s))
            .filter(|s| !s.is_empty())
            .collect()
    };
    ctx.summary = sanitize_meta(&ctx.summary);
    ctx.critical_files = clean_list(ctx.critical_files);
    ctx.recent_changes = clean_list(ctx.recent_changes);
    ctx.learnings = clean_list(ctx.learnings);
    ctx.blockers = clean_list(ctx.blockers);
    ctx.git_ref = ctx
        .git_ref
        .map(|r| sanitize_meta(&r))
        .filter(|r| !r.is_empty());
    ctx
}
