use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

pub const MAX_TITLE_CHARS: usize = 200;
pub const MAX_CONTENT_CHARS: usize = 1000;
pub const MAX_USES: u32 = 100;
pub const VELOCITY_FLOOR: f64 = 0.01;

pub fn today() -> NaiveDate {
    chrono::Local::now().date_naive()
}

// ── Lesson vocabulary ─────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Pattern,
    Correction,
    Decision,
    Gotcha,
    Preference,
}

impl Category {
    pub fn as_str(self) -> &'static str {
        match self {
            Category::Pattern => "pattern",
            Category::Correction => "correction",
            Category::Decision => "decision",
            Category::Gotcha => "gotcha",
            Category::Preference => "preference",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "pattern" => Some(Category::Pattern),
            "correction" => Some(Category::Correction),
            "decision" => Some(Category::Decision),
            "gotcha" => Some(Category::Gotcha),
            "preference" => Some(Category::Preference),
            _ => None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Human,
    Ai,
}

impl Source {
    pub fn as_str(self) -> &'static str {
        match self {
            Source::Human => "human",
            Source::Ai => "ai",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "human" => Some(Source::Human),
            "ai" => Some(Source::Ai),
            _ => None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Project,
    System,
}

impl Level {
    pub fn id_prefix(self) -> char {
        match self {
            Level::Project => 'L',
            Level::System => 'S',
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LessonKind {
    Constraint,
    Informational,
    Preference,
}

impl LessonKind {
    pub fn as_str(self) -> &'static str {
        match self {
            LessonKind::Constraint => "constraint",
            LessonKind::Informational => "informational",
            LessonKind::Preference => "preference",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "constraint" => Some(LessonKind::Constraint),
            "informational" => Some(LessonKind::Informational),
            "preference" => Some(LessonKind::Preference),
            _ => None,
        }
    }
}

// ── Handoff vocabulary ────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    NotStarted,
    InProgress,
    Blocked,
    ReadyForReview,
    Completed,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::NotStarted => "not_started",
            Status::InProgress => "in_progress",
            Status::Blocked => "blocked",
            Status::ReadyForReview => "ready_for_review",
            Status::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "not_started" => Some(Status::NotStarted),
            "in_progress" => Some(Status::InProgress),
            "blocked" => Some(Status::Blocked),
            "ready_for_review" => Some(Status::ReadyForReview),
            "completed" => Some(Status::Completed),
            _ => None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Research,
    Planning,
    Implementing,
    Review,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Research => "research",
            Phase::Planning => "planning",
            Phase::Implementing => "implementing",
            Phase::Review => "review",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "research" => Some(Phase::Research),
            "planning" => Some(Phase::Planning),
            "implementing" => Some(Phase::Implementing),
            "review" => Some(Phase::Review),
            _ => None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Agent {
    Explore,
    GeneralPurpose,
    Plan,
    Review,
    User,
}

impl Agent {
    pub fn as_str(self) -> &'static str {
        match self {
            Agent::Explore => "explore",
            Agent::GeneralPurpose => "general-purpose",
            Agent::Plan => "plan",
            Agent::Review => "review",
            Agent::User => "user",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "explore" => Some(Agent::Explore),
            "general-purpose" => Some(Agent::GeneralPurpose),
            "plan" => Some(Agent::Plan),
            "review" => Some(Agent::Review),
            "user" => Some(Agent::User),
            _ => None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Success,
    Fail,
    Partial,
}

impl StepOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            StepOutcome::Success => "success",
            StepOutcome::Fail => "fail",
            StepOutcome::Partial => "partial",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "success" => Some(StepOutcome::Success),
            "fail" => Some(StepOutcome::Fail),
            "partial" => Some(StepOutcome::Partial),
            _ => None,
        }
    }
}

// ── Lesson ────────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
pub struct Lesson {
    pub id: String,
    pub title: String,
    pub content: String,
    pub category: Category,
    pub uses: u32,
    pub velocity: f64,
    pub learned: NaiveDate,
    pub last_used: NaiveDate,
    pub source: Source,
    pub level: Level,
    pub promotable: bool,
    pub kind: Option<LessonKind>,
    pub triggers: Vec<String>,
    /// Unknown metadata keys, preserved verbatim for round-trip.
    pub extra: Vec<(String, String)>,
}

impl Lesson {
    pub fn new(
        id: String,
        level: Level,
        category: Category,
        title: &str,
        content: &str,
        source: Source,
    ) -> Self {
        let now = today();
        Lesson {
            id,
            title: sanitize_line(title, MAX_TITLE_CHARS),
            content: sanitize_block(content, MAX_CONTENT_CHARS),
            category,
            uses: 0,
            velocity: 0.0,
            learned: now,
            last_used: now,
            source,
            level,
            promotable: true,
            kind: None,
            triggers: Vec::new(),
            extra: Vec::new(),
        }
    }

    /// One citation: uses +1 (saturating at the cap), recency bump.
    pub fn cite(&mut self, on: NaiveDate) {
        self.uses = (self.uses + 1).min(MAX_USES);
        self.velocity += 1.0;
        self.last_used = on;
    }

    pub fn is_stale(&self, stale_days: i64, on: NaiveDate) -> bool {
        self.last_used + chrono::Duration::days(stale_days) < on
    }

    /// Combined star display, e.g. `[***--|*----]`.
    pub fn stars(&self) -> String {
        format!(
            "[{}|{}]",
            uses_stars(self.uses),
            velocity_stars(self.velocity)
        )
    }

    /// Ranking weight for injection ordering.
    pub fn weight(&self) -> f64 {
        self.uses as f64 * 0.7 + self.velocity * 0.3
    }
}

pub fn uses_stars(uses: u32) -> &'static str {
    match uses {
        100.. => "*****",
        50..=99 => "****-",
        10..=49 => "***--",
        5..=9 => "**---",
        1..=4 => "*----",
        0 => "-----",
    }
}

pub fn velocity_stars(velocity: f64) -> &'static str {
    if velocity >= 4.0 {
        "*****"
    } else if velocity >= 2.0 {
        "****-"
    } else if velocity >= 1.0 {
        "***--"
    } else if velocity >= 0.5 {
        "**---"
    } else if velocity >= 0.1 {
        "*----"
    } else {
        "-----"
    }
}

static LESSON_ID_RE: OnceLock<regex::Regex> = OnceLock::new();
static HANDOFF_ID_RE: OnceLock<regex::Regex> = OnceLock::new();

pub fn is_lesson_id(s: &str) -> bool {
    LESSON_ID_RE
        .get_or_init(|| regex::Regex::new(r"^[LS]\d{3}$").expect("static pattern"))
        .is_match(s)
}

pub fn is_handoff_id(s: &str) -> bool {
    HANDOFF_ID_RE
        .get_or_init(|| regex::Regex::new(r"^(hf-[0-9a-f]{7}|A\d{3})$").expect("static pattern"))
        .is_match(s)
}

/// Next monotonic ID within a tier: `max(existing) + 1`, three digits.
pub fn next_lesson_id(existing: &[Lesson], level: Level) -> String {
    let max = existing
        .iter()
        .filter_map(|l| l.id[1..].parse::<u32>().ok())
        .max()
        .unwrap_or(0);
    format!("{}{:03}", level.id_prefix(), max + 1)
}

/// Case-folded, punctuation-stripped title used for duplicate detection.
pub fn normalized_title(title: &str) -> String {
    let lowered = title.to_lowercase();
    let cleaned: String = lowered
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Single-line sanitize: control bytes stripped, newlines flattened,
/// truncated to `max` characters.
pub fn sanitize_line(s: &str, max: usize) -> String {
    let flat: String = s
        .chars()
        .map(|c| if c == '\n' || c == '\t' { ' ' } else { c })
        .filter(|c| !c.is_control())
        .collect();
    flat.trim().chars().take(max).collect()
}

/// Multi-line sanitize: keeps newlines, strips other control bytes,
/// truncates to `max` characters.
pub fn sanitize_block(s: &str, max: usize) -> String {
    let cleaned: String = s.chars().filter(|c| *c == '\n' || !c.is_control()).collect();
    cleaned.trim().chars().take(max).collect()
}

// ── Handoff ───────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
pub struct TriedStep {
    pub outcome: StepOutcome,
    pub description: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct ContextRecord {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub critical_files: Vec<String>,
    #[serde(default)]
    pub recent_changes: Vec<String>,
    #[serde(default)]
    pub learnings: Vec<String>,
    #[serde(default)]
    pub blockers: Vec<String>,
    #[serde(default)]
    pub git_ref: Option<String>,
}

impl ContextRecord {
    pub fn is_empty(&self) -> bool {
        self.summary.is_empty()
            && self.critical_files.is_empty()
            && self.recent_changes.is_empty()
            && self.learnings.is_empty()
            && self.blockers.is_empty()
            && self.git_ref.is_none()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Handoff {
    pub id: String,
    pub title: String,
    pub status: Status,
    pub phase: Phase,
    pub agent: Agent,
    pub created: NaiveDate,
    pub updated: NaiveDate,
    pub description: String,
    pub next_steps: String,
    pub refs: Vec<String>,
    pub tried: Vec<TriedStep>,
    pub checkpoint: String,
    pub last_session: Option<NaiveDate>,
    pub context: Option<ContextRecord>,
    pub blocked_by: Vec<String>,
    pub sessions: Vec<String>,
    pub stealth: bool,
    /// Unknown metadata keys, preserved verbatim for round-trip.
    pub extra: Vec<(String, String)>,
}

const COMPLETION_PREFIXES: &[&str] = &["final", "done", "complete", "finished"];
const IMPLEMENTING_KEYWORDS: &[&str] = &[
    "implement", "build", "create", "add", "fix", "refactor", "test",
];
const IMPLEMENTING_SUCCESS_THRESHOLD: usize = 10;

impl Handoff {
    pub fn new(title: &str, stealth: bool) -> Self {
        let now = today();
        Handoff {
            id: new_handoff_id(),
            title: sanitize_line(title, MAX_TITLE_CHARS),
            status: Status::InProgress,
            phase: Phase::Research,
            agent: Agent::GeneralPurpose,
            created: now,
            updated: now,
            description: String::new(),
            next_steps: String::new(),
            refs: Vec::new(),
            tried: Vec::new(),
            checkpoint: String::new(),
            last_session: None,
            context: None,
            blocked_by: Vec::new(),
            sessions: Vec::new(),
            stealth,
            extra: Vec::new(),
        }
    }

    /// Enforce status/phase compatibility by adjusting, never rejecting.
    pub fn normalize_state(&mut self) {
        match self.status {
            Status::NotStarted => {
                if !matches!(self.phase, Phase::Research | Phase::Planning) {
                    self.phase = Phase::Research;
                }
            }
            Status::ReadyForReview | Status::Completed => {
                self.phase = Phase::Review;
            }
            _ => {}
        }
    }

    /// Append a tried-step and apply the automatic transitions:
    /// a successful "Final …"/"Done …" step completes the handoff; an
    /// implementing-flavored description moves research → implementing.
    pub fn add_tried_step(&mut self, outcome: StepOutcome, description: &str) {
        let description = sanitize_line(description, MAX_TITLE_CHARS);
        let lowered = description.to_lowercase();

        self.tried.push(TriedStep {
            outcome,
            description,
        });
        self.updated = today();

        if outcome == StepOutcome::Success
            && COMPLETION_PREFIXES.iter().any(|p| lowered.starts_with(p))
        {
            self.status = Status::Completed;
            self.phase = Phase::Review;
            return;
        }

        if self.phase == Phase::Research {
            let successes = self
                .tried
                .iter()
                .filter(|s| s.outcome == StepOutcome::Success)
                .count();
            let implementing = IMPLEMENTING_KEYWORDS.iter().any(|k| lowered.contains(k));
            if implementing || successes >= IMPLEMENTING_SUCCESS_THRESHOLD {
                self.phase = Phase::Implementing;
            }
        }
    }

    /// Completing an already-completed handoff is a no-op; returns whether
    /// anything changed.
    pub fn complete(&mut self) -> bool {
        if self.status == Status::Completed {
            return false;
        }
        self.status = Status::Completed;
        self.phase = Phase::Review;
        self.updated = today();
        true
    }

    pub fn link_session(&mut self, session_id: &str) {
        if !self.sessions.iter().any(|s| s == session_id) {
            self.sessions.push(session_id.to_string());
        }
        self.last_session = Some(today());
    }
}

/// New handoff identity: 4 bytes of OS-seeded randomness, 7 hex chars.
pub fn new_handoff_id() -> String {
    let bytes: [u8; 4] = rand::random();
    let n = u32::from_be_bytes(bytes) & 0x0FFF_FFFF;
    format!("hf-{n:07x}")
}
