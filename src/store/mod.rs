pub mod checkpoints;
pub mod handoffs;
pub mod lessons;

use anyhow::{Context, Result};
use std::path::Path;

/// Referenced ID does not exist in any tier.
#[derive(Debug)]
pub struct NotFound(pub String);

impl std::fmt::Display for NotFound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "not found: {}", self.0)
    }
}

impl std::error::Error for NotFound {}

/// A lesson with the same normalized title already exists in the tier.
#[derive(Debug)]
pub struct Duplicate(pub String);

impl std::fmt::Display for Duplicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "duplicate title of {}", self.0)
    }
}

impl std::error::Error for Duplicate {}

/// Missing file reads as empty — stores start lazily.
pub(crate) fn read_or_empty(path: &Path) -> Result<String> {
    match std::fs::read_to_string(path) {
        Ok(s) => Ok(s),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
    }
}

/// All-or-nothing write: temp file in the same directory, then rename.
/// Readers either see the previous snapshot or the new one, never a torn file.
pub(crate) fn atomic_write(path: &Path, content: &str) -> Result<()> {
    let parent = path.parent().context("state path has no parent")?;
    if !parent.exists() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let tmp = path.with_extension(format!("tmp.{}", std::process::id()));
    std::fs::write(&tmp, content).with_context(|| format!("writing {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("renaming into {}", path.display()))?;
    Ok(())
}

pub fn is_not_found(err: &anyhow::Error) -> bool {
    err.is::<NotFound>()
}

pub fn is_duplicate(err: &anyhow::Error) -> bool {
    err.is::<Duplicate>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_or_empty_for_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let s = read_or_empty(&dir.path().join("nope.md")).unwrap();
        assert_eq!(s, "");
    }

    #[test]
    fn atomic_write_creates_parents_and_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deep/nested/FILE.md");
        atomic_write(&path, "one").unwrap();
        atomic_write(&path, "two").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "two");
        // No temp litter left behind.
        let entries: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .collect();
        assert_eq!(entries.len(), 1);
    }
}
