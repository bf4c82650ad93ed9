mod cli;
mod commands;
mod config;
mod decay;
mod detach;
mod doctor;
mod hooks;
mod inject;
mod journal;
mod lock;
mod markdown;
mod models;
mod rank;
mod scanner;
mod store;
mod summarize;

use commands::{Ctx, UsageError};

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    let args: Vec<String> = std::env::args().skip(1).collect();

    if args.iter().any(|a| a == "--help" || a == "-h")
        || args.first().map(|s| s.as_str()) == Some("help")
    {
        cli::print_help();
        return 0;
    }

    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("claude-recall {}", env!("CARGO_PKG_VERSION"));
        return 0;
    }

    let Some(command) = args.first().map(|s| s.as_str()) else {
        cli::print_help();
        return 1;
    };
    let rest = &args[1..];

    // Hooks manage their own exit semantics — never fail the host.
    if command == "hook" {
        let Some(kind) = rest.first().and_then(|k| hooks::HookKind::parse(k)) else {
            eprintln!(
                "claude-recall: hook requires one of session-start | prompt-submit | stop | pre-compact | session-end"
            );
            return 1;
        };
        return hooks::run(kind).await;
    }

    if command == "completions" {
        return match cli::completions(rest.first().map(|s| s.as_str())) {
            Ok(()) => 0,
            Err(_) => 1,
        };
    }

    let ctx = Ctx::resolve();
    if command == "doctor" {
        doctor::run(&ctx.paths, &ctx.config);
        return 0;
    }

    let result = match command {
        "inject" => commands::cmd_inject(&ctx, rest),
        "add" => commands::cmd_add(&ctx, rest),
        "cite" => commands::cmd_cite(&ctx, rest),
        "list" => commands::cmd_list(&ctx, rest),
        "show" => commands::cmd_show(&ctx, rest),
        "edit" => commands::cmd_edit(&ctx, rest),
        "delete" => commands::cmd_delete(&ctx, rest),
        "promote" => commands::cmd_promote(&ctx, rest),
        "decay" => commands::cmd_decay(&ctx, rest),
        "handoff" => commands::cmd_handoff(&ctx, rest).await,
        "score-relevance" => commands::cmd_score_relevance(&ctx, rest).await,
        "score-local" => commands::cmd_score_local(&ctx, rest),
        "extract-context" => commands::cmd_extract_context(&ctx, rest).await,
        "prescore-cache" => commands::cmd_prescore_cache(&ctx, rest).await,
        other => {
            eprintln!("claude-recall: unknown command '{other}'\n");
            eprintln!("Run 'claude-recall help' for usage.");
            return 1;
        }
    };

    finish(result)
}

/// Exit-code policy: 0 success, 1 usage, 2 recoverable (no state change).
fn finish(result: anyhow::Result<()>) -> i32 {
    let Err(err) = result else {
        return 0;
    };

    if let Some(usage) = err.downcast_ref::<UsageError>() {
        eprintln!("claude-recall: {usage}");
        eprintln!("Run 'claude-recall help' for usage.");
        return 1;
    }
    if let Some(not_found) = err.downcast_ref::<store::NotFound>() {
        println!(
            "{}",
            serde_json::json!({ "error": not_found.to_string(), "code": "not_found" })
        );
        return 2;
    }
    if let Some(duplicate) = err.downcast_ref::<store::Duplicate>() {
        println!(
            "{}",
            serde_json::json!({ "error": duplicate.to_string(), "code": "duplicate" })
        );
        return 2;
    }
    if lock::is_contended(&err) {
        eprintln!("claude-recall: another invocation holds the lock; retry shortly");
        return 2;
    }
    eprintln!("claude-recall: {err:#}");
    2
}
