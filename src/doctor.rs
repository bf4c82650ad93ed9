//! Environment health checks: file layout, config validity, store
//! parseability, journal growth. Read-only — doctor never repairs.

use std::path::Path;

use crate::config::{Config, Paths};
use crate::markdown;
use crate::models::Level;
use crate::store::read_or_empty;

/// Outcome tally for one doctor run. Checks report into it; the summary
/// prints at the end.
#[derive(Default)]
struct Report {
    passed: u32,
    failed: u32,
}

impl Report {
    fn ok(&mut self, msg: &str) {
        self.passed += 1;
        println!("  ✓  {msg}");
    }

    fn fail(&mut self, msg: &str) {
        self.failed += 1;
        println!("  ✗  {msg}");
    }

    fn note(&self, msg: &str) {
        println!("  i  {msg}");
    }

    fn summarize(&self) {
        println!();
        println!("  {} passed  {} failed", self.passed, self.failed);
        println!();
    }
}

pub fn run(paths: &Paths, config: &Config) {
    println!();
    println!("── claude-recall doctor ────────────────────────");
    println!();

    let mut report = Report::default();

    check_dir(&mut report, "project dir", &paths.project);
    check_dir(&mut report, "state dir", &paths.state);
    check_config(&mut report, paths, config);
    check_lessons(&mut report, paths);
    check_handoffs(&mut report, paths);
    check_state_json(&mut report, &paths.offsets(), "transcript offsets");
    check_state_json(&mut report, &paths.session_map(), "session-handoff map");
    check_state_json(&mut report, &paths.relevance_cache(), "relevance cache");
    check_journal(&report, paths);
    check_summarizer(&report, config);

    report.summarize();
}

fn check_dir(report: &mut Report, label: &str, dir: &Path) {
    if dir.exists() {
        report.ok(&format!("{label} exists ({})", dir.display()));
    } else if dir
        .parent()
        .map(|p| p.exists() || std::fs::create_dir_all(p).is_ok())
        .unwrap_or(false)
    {
        report.ok(&format!("{label} creatable ({})", dir.display()));
    } else {
        report.fail(&format!("{label} not writable ({})", dir.display()));
    }
}

fn check_config(report: &mut Report, paths: &Paths, config: &Config) {
    let file = paths.config_file();
    if !file.exists() {
        report.note("no config.json — defaults in effect");
        return;
    }
    match std::fs::read_to_string(&file)
        .ok()
        .and_then(|c| serde_json::from_str::<serde_json::Value>(&c).ok())
    {
        Some(_) => {
            if config.enabled {
                report.ok("config.json parses (enabled)");
            } else {
                report.ok("config.json parses (engine disabled)");
            }
        }
        None => report.fail("config.json is not valid JSON"),
    }
}

fn check_lessons(report: &mut Report, paths: &Paths) {
    for level in [Level::Project, Level::System] {
        let path = paths.lessons(level);
        let tier = match level {
            Level::Project => "project",
            Level::System => "system",
        };
        let Ok(content) = read_or_empty(&path) else {
            report.fail(&format!("{tier} lessons unreadable"));
            continue;
        };
        let (lessons, warnings) = markdown::parse_lessons(&content, level);
        if warnings.is_empty() {
            report.ok(&format!("{tier} lessons parse ({} records)", lessons.len()));
        } else {
            report.fail(&format!(
                "{tier} lessons: {} records skipped ({} kept)",
                warnings.len(),
                lessons.len()
            ));
        }
    }
}

fn check_handoffs(report: &mut Report, paths: &Paths) {
    for stealth in [false, true] {
        let path = paths.handoffs(stealth);
        let label = if stealth { "local handoffs" } else { "shared handoffs" };
        let Ok(content) = read_or_empty(&path) else {
            report.fail(&format!("{label} unreadable"));
            continue;
        };
        let (handoffs, warnings) = markdown::parse_handoffs(&content, stealth);
        if warnings.is_empty() {
            report.ok(&format!("{label} parse ({} records)", handoffs.len()));
        } else {
            report.fail(&format!(
                "{label}: {} records skipped ({} kept)",
                warnings.len(),
                handoffs.len()
            ));
        }
    }
}

fn check_state_json(report: &mut Report, path: &Path, label: &str) {
    if !path.exists() {
        report.note(&format!("{label}: no file yet"));
        return;
    }
    match std::fs::read_to_string(path)
        .ok()
        .and_then(|c| serde_json::from_str::<serde_json::Value>(&c).ok())
    {
        Some(_) => report.ok(&format!("{label} parses")),
        None => report.fail(&format!("{label} corrupt — will reset on next use")),
    }
}

fn check_journal(report: &Report, paths: &Paths) {
    let path = paths.journal();
    let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
    if size == 0 {
        report.note("journal empty");
    } else {
        report.note(&format!("journal {}", human_bytes(size)));
    }
}

fn check_summarizer(report: &Report, config: &Config) {
    match &config.summarizer {
        Some(s) => report.note(&format!("summarizer configured ({} via {})", s.model, s.url)),
        None => report.note("no summarizer — local scoring only"),
    }
}

/// Binary units, one decimal once past whole bytes.
fn human_bytes(n: u64) -> String {
    const UNITS: &[&str] = &["KiB", "MiB", "GiB"];
    if n < 1024 {
        return format!("{n} B");
    }
    let mut value = n as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn human_bytes_units() {
        assert_eq!(human_bytes(10), "10 B");
        assert_eq!(human_bytes(2048), "2.0 KiB");
        assert_eq!(human_bytes(5 * 1024 * 1024 + 512 * 1024), "5.5 MiB");
        assert_eq!(human_bytes(3 * 1024 * 1024 * 1024), "3.0 GiB");
    }

    #[test]
    fn report_tallies_checks() {
        let mut report = Report::default();
        report.ok("fine");
        report.ok("also fine");
        report.fail("broken");
        assert_eq!(report.passed, 2);
        assert_eq!(report.failed, 1);
    }

    #[test]
    fn doctor_runs_on_empty_layout() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::at(&dir.path().join("p"), &dir.path().join("s"));
        run(&paths, &Config::default());
    }
}
