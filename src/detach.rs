//! Fire-and-forget children. A hook must return to the host immediately, so
//! slow work (context extraction, decay) re-invokes this binary as a detached
//! child with its output redirected to a log file. The parent never waits;
//! the child finishes on its own and writes results for a later hook to read.

use anyhow::{Context, Result};
use std::path::Path;
use std::process::{Command, Stdio};

pub fn spawn_detached(args: &[&str], log_path: &Path) -> Result<u32> {
    let exe = std::env::current_exe().context("resolving own binary path")?;

    if let Some(parent) = log_path.parent() {
        if !parent.exists() {
            std::fs::create_dir_all(parent).context("creating detach log directory")?;
        }
    }
    let log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .with_context(|| format!("opening detach log {}", log_path.display()))?;
    let log_err = log.try_clone().context("cloning detach log handle")?;

    let child = Command::new(exe)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err))
        .spawn()
        .context("spawning detached child")?;

    Ok(child.id())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detached_child_runs_without_waiting() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("detach.log");
        // `--version` is instant and side-effect free.
        let pid = spawn_detached(&["--version"], &log).unwrap();
        assert!(pid > 0);
        assert!(log.exists());
    }
}
