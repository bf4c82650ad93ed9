use anyhow::Result;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::{Config, Paths};
use crate::lock::FileLock;
use crate::markdown;
use crate::models::{
    next_lesson_id, normalized_title, sanitize_block, sanitize_line, today, Category, Lesson,
    LessonKind, Level, Source, MAX_CONTENT_CHARS, MAX_TITLE_CHARS,
};
use crate::store::{atomic_write, read_or_empty, Duplicate, NotFound};

const PROMOTE_MIN_USES: u32 = 50;

/// Narrow capability surface the orchestrator depends on; the file-backed
/// store below is the only production implementation.
pub trait LessonRepository {
    fn add(&self, req: AddLesson<'_>) -> Result<Lesson>;
    fn cite(&self, ids: &[String]) -> Result<CiteOutcome>;
    fn edit(&self, id: &str, edit: LessonEdit) -> Result<Lesson>;
    fn delete(&self, id: &str) -> Result<()>;
    fn get(&self, id: &str) -> Result<Option<Lesson>>;
    fn list(&self, filter: &LessonFilter) -> Result<Vec<Lesson>>;
    fn promote(&self, id: &str) -> Result<Lesson>;
    /// One decay pass over a tier; `mutate` sees every lesson.
    fn for_each_mut(&self, level: Level, mutate: &mut dyn FnMut(&mut Lesson)) -> Result<()>;
}

pub struct AddLesson<'a> {
    pub level: Level,
    pub category: Category,
    pub title: &'a str,
    pub content: &'a str,
    pub source: Source,
    pub promotable: bool,
    pub kind: Option<LessonKind>,
    pub force: bool,
}

#[derive(Default)]
pub struct LessonEdit {
    pub title: Option<String>,
    pub content: Option<String>,
    pub category: Option<Category>,
    pub promotable: Option<bool>,
    pub kind: Option<LessonKind>,
    pub triggers: Option<Vec<String>>,
}

#[derive(Default, Debug)]
pub struct LessonFilter {
    pub category: Option<Category>,
    pub stale: bool,
    pub query: Option<String>,
}

#[derive(Debug, Default)]
pub struct CiteOutcome {
    pub cited: Vec<String>,
    pub missing: Vec<String>,
}

/// Two markdown files, one per tier. Every mutation is
/// lock → read → mutate → atomic write; reads and writes never interleave.
pub struct MarkdownLessons {
    project: PathBuf,
    system: PathBuf,
    stale_days: i64,
    lock_timeout: Duration,
}

impl MarkdownLessons {
    pub fn new(paths: &Paths, config: &Config) -> Self {
        MarkdownLessons {
            project: paths.lessons(Level::Project),
            system: paths.lessons(Level::System),
            stale_days: config.stale_days,
            lock_timeout: Duration::from_secs(config.lock_timeout_secs),
        }
    }

    fn tier_path(&self, level: Level) -> &PathBuf {
        match level {
            Level::Project => &self.project,
            Level::System => &self.system,
        }
    }

    fn tier_of(id: &str) -> Level {
        if id.starts_with('S') {
            Level::System
        } else {
            Level::Project
        }
    }

    fn load(&self, level: Level) -> Result<Vec<Lesson>> {
        let (lessons, warnings) =
            markdown::parse_lessons(&read_or_empty(self.tier_path(level))?, level);
        for w in warnings {
            eprintln!("[claude-recall] {w}");
        }
        Ok(lessons)
    }

    /// Lock the tier file, hand the parsed records to `f`, and persist
    /// whatever it leaves behind. `f` returning Err abandons the write.
    fn mutate<T>(&self, level: Level, f: impl FnOnce(&mut Vec<Lesson>) -> Result<T>) -> Result<T> {
        let path = self.tier_path(level);
        let _guard = FileLock::acquire(path, self.lock_timeout)?;
        let mut lessons = self.load(level)?;
        let out = f(&mut lessons)?;
        atomic_write(path, &markdown::serialize_lessons(&lessons))?;
        Ok(out)
    }
}

impl LessonRepository for MarkdownLessons {
    fn add(&self, req: AddLesson<'_>) -> Result<Lesson> {
        let title = sanitize_line(req.title, MAX_TITLE_CHARS);
        let content = sanitize_block(req.content, MAX_CONTENT_CHARS);
        self.mutate(req.level, |lessons| {
            if !req.force {
                let normalized = normalized_title(&title);
                if let Some(existing) = lessons
                    .iter()
                    .find(|l| normalized_title(&l.title) == normalized)
                {
                    return Err(anyhow::Error::new(Duplicate(existing.id.clone())));
                }
            }
            let id = next_lesson_id(lessons, req.level);
            let mut lesson = Lesson::new(id, req.level, req.category, &title, &content, req.source);
            lesson.promotable = req.promotable;
            lesson.kind = req.kind;
            lessons.push(lesson.clone());
            Ok(lesson)
        })
    }

    fn cite(&self, ids: &[String]) -> Result<CiteOutcome> {
        let mut outcome = CiteOutcome::default();
        let now = today();
        for level in [Level::Project, Level::System] {
            let wanted: Vec<&String> = ids
                .iter()
                .filter(|id| Self::tier_of(id) == level)
                .collect();
            if wanted.is_empty() {
                continue;
            }
            let cited = self.mutate(level, |lessons| {
                let mut cited = Vec::new();
                for id in &wanted {
                    if let Some(lesson) = lessons.iter_mut().find(|l| &l.id == *id) {
                        lesson.cite(now);
                        cited.push((*id).clone());
                    }
                }
                Ok(cited)
            })?;
            for id in wanted {
                if !cited.contains(id) {
                    outcome.missing.push(id.clone());
                }
            }
            outcome.cited.extend(cited);
        }
        Ok(outcome)
    }

    fn edit(&self, id: &str, edit: LessonEdit) -> Result<Lesson> {
        self.mutate(Self::tier_of(id), |lessons| {
            let lesson = lessons
                .iter_mut()
                .find(|l| l.id == id)
                .ok_or_else(|| anyhow::Error::new(NotFound(id.to_string())))?;
            if let Some(title) = edit.title {
                lesson.title = sanitize_line(&title, MAX_TITLE_CHARS);
            }
            if let Some(content) = edit.content {
                lesson.content = sanitize_block(&content, MAX_CONTENT_CHARS);
            }
            if let Some(category) = edit.category {
                lesson.category = category;
            }
            if let Some(promotable) = edit.promotable {
                lesson.promotable = promotable;
            }
            if let Some(kind) = edit.kind {
                lesson.kind = Some(kind);
            }
            if let Some(triggers) = edit.triggers {
                lesson.triggers = triggers
                    .into_iter()
                    .map(|t| sanitize_line(&t, 64))
                    .collect();
            }
            Ok(lesson.clone())
        })
    }

    fn delete(&self, id: &str) -> Result<()> {
        self.mutate(Self::tier_of(id), |lessons| {
            let before = lessons.len();
            lessons.retain(|l| l.id != id);
            if lessons.len() == before {
                return Err(anyhow::Error::new(NotFound(id.to_string())));
            }
            Ok(())
        })
    }

    fn get(&self, id: &str) -> Result<Option<Lesson>> {
        Ok(self
            .load(Self::tier_of(id))?
            .into_iter()
            .find(|l| l.id == id))
    }

    fn list(&self, filter: &LessonFilter) -> Result<Vec<Lesson>> {
        let now = today();
        let query = filter.query.as_ref().map(|q| q.to_lowercase());
        let mut out = Vec::new();
        for level in [Level::Project, Level::System] {
            for lesson in self.load(level)? {
                if let Some(category) = filter.category {
                    if lesson.category != category {
                        continue;
                    }
                }
                if filter.stale && !lesson.is_stale(self.stale_days, now) {
                    continue;
                }
                if let Some(q) = &query {
                    let haystack = format!(
                        "{} {} {}",
                        lesson.title.to_lowercase(),
                        lesson.content.to_lowercase(),
                        lesson.triggers.join(" ").to_lowercase()
                    );
                    if !haystack.contains(q.as_str()) {
                        continue;
                    }
                }
                out.push(lesson);
            }
        }
        Ok(out)
    }

    fn promote(&self, id: &str) -> Result<Lesson> {
        let lesson = self
            .get(id)?
            .ok_or_else(|| anyhow::Error::new(NotFound(id.to_string())))?;
        if lesson.level != Level::Project {
            anyhow::bail!("only project lessons can be promoted ({id})");
        }
        if !lesson.promotable {
            anyhow::bail!("{id} is marked non-promotable");
        }
        if lesson.uses < PROMOTE_MIN_USES {
            anyhow::bail!(
                "{id} has {} uses; promotion needs {PROMOTE_MIN_USES}",
                lesson.uses
            );
        }
        // Copy into the system tier; the project original stays put.
        self.mutate(Level::System, |lessons| {
            let mut promoted = lesson.clone();
            promoted.id = next_lesson_id(lessons, Level::System);
            promoted.level = Level::System;
            lessons.push(promoted.clone());
            Ok(promoted)
        })
    }

    fn for_each_mut(&self, level: Level, mutate: &mut dyn FnMut(&mut Lesson)) -> Result<()> {
        self.mutate(level, |lessons| {
            for lesson in lessons.iter_mut() {
                mutate(lesson);
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{is_duplicate, is_not_found};

    fn store(dir: &std::path::Path) -> MarkdownLessons {
        let paths = Paths::at(&dir.join("project"), &dir.join("state"));
        MarkdownLessons::new(&paths, &Config::default())
    }

    fn add_req<'a>(title: &'a str, content: &'a str) -> AddLesson<'a> {
        AddLesson {
            level: Level::Project,
            category: Category::Pattern,
            title,
            content,
            source: Source::Human,
            promotable: true,
            kind: None,
            force: false,
        }
    }

    #[test]
    fn add_assigns_monotonic_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        assert_eq!(store.add(add_req("first", "c")).unwrap().id, "L001");
        assert_eq!(store.add(add_req("second", "c")).unwrap().id, "L002");
        store.delete("L001").unwrap();
        // Monotonic even after deletion of a lower id.
        assert_eq!(store.add(add_req("third", "c")).unwrap().id, "L003");
    }

    #[test]
    fn add_rejects_duplicate_normalized_title() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store.add(add_req("Use anyhow Context", "c")).unwrap();
        let err = store
            .add(add_req("use ANYHOW context!", "other"))
            .unwrap_err();
        assert!(is_duplicate(&err));

        let mut forced = add_req("use ANYHOW context!", "other");
        forced.force = true;
        assert_eq!(store.add(forced).unwrap().id, "L002");
    }

    #[test]
    fn cite_updates_uses_velocity_and_date() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let added = store.add(add_req("t", "c")).unwrap();

        let outcome = store
            .cite(&[added.id.clone(), "L999".to_string()])
            .unwrap();
        assert_eq!(outcome.cited, vec![added.id.clone()]);
        assert_eq!(outcome.missing, vec!["L999".to_string()]);

        let lesson = store.get(&added.id).unwrap().unwrap();
        assert_eq!(lesson.uses, 1);
        assert!((lesson.velocity - 1.0).abs() < 1e-9);
        assert_eq!(lesson.last_used, today());
    }

    #[test]
    fn edit_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let added = store.add(add_req("t", "c")).unwrap();

        let edited = store
            .edit(
                &added.id,
                LessonEdit {
                    title: Some("new title".into()),
                    category: Some(Category::Gotcha),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(edited.title, "new title");
        assert_eq!(edited.category, Category::Gotcha);

        store.delete(&added.id).unwrap();
        assert!(store.get(&added.id).unwrap().is_none());
        let err = store.delete(&added.id).unwrap_err();
        assert!(is_not_found(&err));
    }

    #[test]
    fn list_filters_category_query_and_stale() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store.add(add_req("lock ordering", "acquire a then b")).unwrap();
        let mut other = add_req("hook timing", "stop fires last");
        other.category = Category::Gotcha;
        store.add(other).unwrap();

        let by_cat = store
            .list(&LessonFilter {
                category: Some(Category::Gotcha),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_cat.len(), 1);
        assert_eq!(by_cat[0].title, "hook timing");

        let by_query = store
            .list(&LessonFilter {
                query: Some("ACQUIRE".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_query.len(), 1);

        // Fresh lessons are not stale.
        let stale = store
            .list(&LessonFilter {
                stale: true,
                ..Default::default()
            })
            .unwrap();
        assert!(stale.is_empty());
    }

    #[test]
    fn promote_requires_uses_and_flag() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let added = store.add(add_req("t", "c")).unwrap();
        assert!(store.promote(&added.id).is_err());

        // Raise uses over the bar, then promote.
        store
            .for_each_mut(Level::Project, &mut |l| l.uses = 60)
            .unwrap();
        let promoted = store.promote(&added.id).unwrap();
        assert_eq!(promoted.id, "S001");
        assert_eq!(promoted.level, Level::System);
        // Original stays in the project tier.
        assert!(store.get(&added.id).unwrap().is_some());
    }

    #[test]
    fn empty_store_lists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        assert!(store.list(&LessonFilter::default()).unwrap().is_empty());
        assert!(store.get("L001").unwrap().is_none());
    }
}
