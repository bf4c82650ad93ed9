use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::config::{Config, Paths};
use crate::lock::FileLock;
use crate::models::{today, Level, VELOCITY_FLOOR};
use crate::store::lessons::LessonRepository;
use crate::store::{atomic_write, read_or_empty};

const STALE_USE_DAYS: i64 = 30;
const HALF_LIFE_FACTOR: f64 = 0.5;

#[derive(Serialize, Deserialize, Default, Debug)]
struct DecayState {
    last_run: Option<DateTime<Utc>>,
    /// Stop hooks bump this when a session first appears; decay only runs
    /// when there has been activity since the previous cycle.
    #[serde(default)]
    sessions_since_last_run: u32,
}

#[derive(Debug, Default, PartialEq)]
pub struct DecayReport {
    pub ran: bool,
    pub lessons_touched: usize,
    pub uses_decremented: usize,
}

pub struct DecayEngine<'a> {
    state_path: PathBuf,
    interval_days: i64,
    lock_timeout: Duration,
    lessons: &'a dyn LessonRepository,
}

impl<'a> DecayEngine<'a> {
    pub fn new(paths: &Paths, config: &Config, lessons: &'a dyn LessonRepository) -> Self {
        DecayEngine {
            state_path: paths.decay_state(),
            interval_days: config.decay_interval_days,
            lock_timeout: Duration::from_secs(config.lock_timeout_secs),
            lessons,
        }
    }

    fn load_state(&self) -> DecayState {
        let Ok(content) = read_or_empty(&self.state_path) else {
            return DecayState::default();
        };
        if content.is_empty() {
            return DecayState::default();
        }
        serde_json::from_str(&content).unwrap_or_else(|e| {
            eprintln!("[claude-recall] resetting corrupt decay state ({e})");
            DecayState::default()
        })
    }

    fn save_state(&self, state: &DecayState) -> Result<()> {
        atomic_write(&self.state_path, &serde_json::to_string_pretty(state)?)
    }

    /// Whether enough time has passed and sessions have run since the last
    /// cycle. `force` callers skip this.
    pub fn is_due(&self) -> bool {
        let state = self.load_state();
        if state.sessions_since_last_run == 0 && state.last_run.is_some() {
            return false;
        }
        match state.last_run {
            None => true,
            Some(last) => Utc::now() - last >= chrono::Duration::days(self.interval_days),
        }
    }

    /// Count a session toward the next decay cycle.
    pub fn note_session(&self) -> Result<()> {
        let _guard = FileLock::acquire(&self.state_path, self.lock_timeout)?;
        let mut state = self.load_state();
        state.sessions_since_last_run = state.sessions_since_last_run.saturating_add(1);
        self.save_state(&state)
    }

    /// One decay cycle: velocity half-life across the corpus, plus a single
    /// stale-use decrement for lessons unused for a month. Never drops uses
    /// below 1.
    pub fn run(&self, force: bool) -> Result<DecayReport> {
        let _guard = FileLock::acquire(&self.state_path, self.lock_timeout)?;
        if !force && !self.is_due() {
            return Ok(DecayReport::default());
        }

        let now = today();
        let mut report = DecayReport {
            ran: true,
            ..Default::default()
        };
        for level in [Level::Project, Level::System] {
            let mut touched = 0usize;
            let mut decremented = 0usize;
            self.lessons.for_each_mut(level, &mut |lesson| {
                touched += 1;
                lesson.velocity *= HALF_LIFE_FACTOR;
                if lesson.velocity < VELOCITY_FLOOR {
                    lesson.velocity = 0.0;
                }
                let stale = lesson.last_used + chrono::Duration::days(STALE_USE_DAYS) < now;
                if stale && lesson.uses > 1 {
                    lesson.uses -= 1;
                    decremented += 1;
                }
            })?;
            report.lessons_touched += touched;
            report.uses_decremented += decremented;
        }

        self.save_state(&DecayState {
            last_run: Some(Utc::now()),
            sessions_since_last_run: 0,
        })?;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Category, Source};
    use crate::store::lessons::{AddLesson, MarkdownLessons};

    fn setup(dir: &std::path::Path) -> (Paths, Config, MarkdownLessons) {
        let paths = Paths::at(&dir.join("project"), &dir.join("state"));
        let config = Config::default();
        let lessons = MarkdownLessons::new(&paths, &config);
        (paths, config, lessons)
    }

    fn seed(lessons: &MarkdownLessons, title: &str, velocity: f64, uses: u32, age_days: i64) {
        lessons
            .add(AddLesson {
                level: Level::Project,
                category: Category::Pattern,
                title,
                content: "c",
                source: Source::Human,
                promotable: true,
                kind: None,
                force: false,
            })
            .unwrap();
        lessons
            .for_each_mut(Level::Project, &mut |l| {
                if l.title == title {
                    l.velocity = velocity;
                    l.uses = uses;
                    l.last_used = today() - chrono::Duration::days(age_days);
                }
            })
            .unwrap();
    }

    #[test]
    fn velocity_halves_and_floors() {
        let dir = tempfile::tempdir().unwrap();
        let (paths, config, lessons) = setup(dir.path());
        seed(&lessons, "fast", 2.0, 5, 0);
        seed(&lessons, "slow", 0.015, 5, 0);

        let engine = DecayEngine::new(&paths, &config, &lessons);
        let report = engine.run(true).unwrap();
        assert!(report.ran);
        assert_eq!(report.lessons_touched, 2);

        let all = lessons
            .list(&crate::store::lessons::LessonFilter::default())
            .unwrap();
        let fast = all.iter().find(|l| l.title == "fast").unwrap();
        let slow = all.iter().find(|l| l.title == "slow").unwrap();
        assert!((fast.velocity - 1.0).abs() < 1e-9);
        assert_eq!(slow.velocity, 0.0);
    }

    #[test]
    fn stale_uses_decrement_but_never_below_one() {
        let dir = tempfile::tempdir().unwrap();
        let (paths, config, lessons) = setup(dir.path());
        seed(&lessons, "stale-many", 0.0, 5, 45);
        seed(&lessons, "stale-one", 0.0, 1, 45);
        seed(&lessons, "fresh", 0.0, 5, 2);

        let engine = DecayEngine::new(&paths, &config, &lessons);
        let report = engine.run(true).unwrap();
        assert_eq!(report.uses_decremented, 1);

        let all = lessons
            .list(&crate::store::lessons::LessonFilter::default())
            .unwrap();
        assert_eq!(all.iter().find(|l| l.title == "stale-many").unwrap().uses, 4);
        assert_eq!(all.iter().find(|l| l.title == "stale-one").unwrap().uses, 1);
        assert_eq!(all.iter().find(|l| l.title == "fresh").unwrap().uses, 5);
    }

    #[test]
    fn decay_is_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let (paths, config, lessons) = setup(dir.path());
        seed(&lessons, "a", 3.7, 20, 60);
        let before = lessons
            .list(&crate::store::lessons::LessonFilter::default())
            .unwrap();

        let engine = DecayEngine::new(&paths, &config, &lessons);
        engine.run(true).unwrap();

        let after = lessons
            .list(&crate::store::lessons::LessonFilter::default())
            .unwrap();
        for (b, a) in before.iter().zip(after.iter()) {
            assert!(a.velocity <= b.velocity);
            assert!(b.uses - a.uses <= 1);
            assert!(a.uses >= 1);
        }
    }

    #[test]
    fn skips_without_session_activity() {
        let dir = tempfile::tempdir().unwrap();
        let (paths, config, lessons) = setup(dir.path());
        seed(&lessons, "a", 2.0, 5, 0);

        let engine = DecayEngine::new(&paths, &config, &lessons);
        engine.run(true).unwrap();

        // No sessions since the forced run — a non-forced run is a no-op.
        let report = engine.run(false).unwrap();
        assert!(!report.ran);

        // Activity alone is not enough until the interval elapses.
        engine.note_session().unwrap();
        let report = engine.run(false).unwrap();
        assert!(!report.ran);
    }

    #[test]
    fn first_ever_run_is_due() {
        let dir = tempfile::tempdir().unwrap();
        let (paths, config, lessons) = setup(dir.path());
        let engine = DecayEngine::new(&paths, &config, &lessons);
        assert!(engine.is_due());
    }
}
