pub fn print_help() {
    println!("claude-recall {}", env!("CARGO_PKG_VERSION"));
    println!("Persistent memory for coding assistants — lessons and handoffs across sessions.\n");
    print_usage();
    print_options();
}

fn print_usage() {
    println!("USAGE:");
    println!("  claude-recall inject [n]                 Print injection context (top n lessons)");
    println!("  claude-recall add <cat> <title> <text>   Record a lesson");
    println!("  claude-recall cite <id>...               Mark lessons as applied");
    println!("  claude-recall list [OPTIONS]             List lessons");
    println!("  claude-recall show <id>                  Show one lesson");
    println!("  claude-recall edit <id> [OPTIONS]        Edit lesson fields");
    println!("  claude-recall delete <id>                Delete a lesson");
    println!("  claude-recall promote <id>               Copy a project lesson to the system tier");
    println!("  claude-recall decay [--force]            Run the decay cycle");
    println!("  claude-recall handoff <SUBCOMMAND>       Manage handoffs (see below)");
    println!("  claude-recall score-relevance <query>    Rank lessons (external scorer + cache)");
    println!("  claude-recall score-local <query>        Rank lessons (local BM25 only)");
    println!("  claude-recall extract-context <path>     Distill a transcript tail into context");
    println!("  claude-recall prescore-cache [OPTIONS]   Warm the relevance cache");
    println!("  claude-recall doctor                     Check configuration and files");
    println!("  claude-recall completions <shell>        Print shell completions (bash|zsh|fish)");
    println!("  claude-recall help | --help | -h         Show this message");
    println!("  claude-recall --version | -V             Show version\n");
    println!("HANDOFF SUBCOMMANDS:");
    println!("  list [--all|--status S]   show <id>   add <title> [--stealth]");
    println!("  update <id> [OPTIONS]     tried <id> <outcome> <desc>   complete <id>");
    println!("  archive   inject   inject-todos   sync-todos <json>");
    println!("  set-context <id> --json <obj>   set-session <hid> <sid>");
    println!("  get-session-handoff <sid>   process-transcript --session <sid> --transcript <path>\n");
    println!("INTERNAL:");
    println!("  claude-recall hook <session-start|prompt-submit|stop|pre-compact|session-end>");
    println!("                                           Process a host hook event from stdin\n");
}

fn print_options() {
    println!("LIST OPTIONS:");
    println!("  --stale           Only lessons unused past the staleness window");
    println!("  --category <c>    pattern | correction | decision | gotcha | preference");
    println!("  --search <s>      Substring match over title, content, triggers\n");
    println!("ADD / EDIT OPTIONS:");
    println!("  --system          Write to the system tier (add)");
    println!("  --no-promote      Mark the lesson non-promotable (add)");
    println!("  --type <t>        constraint | informational | preference");
    println!("  --force           Skip the duplicate-title check (add)\n");
    println!("SCORING OPTIONS:");
    println!("  --top <n>         Number of results (default from config)");
    println!("  --min-score <m>   Drop results scoring below m");
    println!("  --timeout <s>     External scorer deadline in seconds\n");
    println!("ENVIRONMENT:");
    println!("  CLAUDE_RECALL_STATE     State dir (default: XDG state dir)");
    println!("  PROJECT_DIR             Project root (default: nearest .git ancestor)");
    println!("  CLAUDE_RECALL_SESSION   Session id when the host omits it");
    println!("  CLAUDE_RECALL_DEBUG     Journal verbosity 0-3");
}

pub fn get_flag(args: &[String], flag: &str) -> Option<String> {
    args.windows(2).find(|w| w[0] == flag).map(|w| w[1].clone())
}

pub fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}

pub fn completions(shell: Option<&str>) -> anyhow::Result<()> {
    match shell {
        Some("bash") => print!("{}", bash_completions()),
        Some("zsh") => print!("{}", zsh_completions()),
        Some("fish") => print!("{}", fish_completions()),
        _ => {
            eprintln!("Usage: claude-recall completions <bash|zsh|fish>");
            eprintln!();
            eprintln!("Add to your shell config:");
            eprintln!("  bash: eval \"$(claude-recall completions bash)\"");
            eprintln!("  zsh:  eval \"$(claude-recall completions zsh)\"");
            eprintln!("  fish: claude-recall completions fish | source");
            std::process::exit(1);
        }
    }
    Ok(())
}

const SUBCOMMANDS: &[&str] = &[
    "inject",
    "add",
    "cite",
    "list",
    "show",
    "edit",
    "delete",
    "promote",
    "decay",
    "handoff",
    "score-relevance",
    "score-local",
    "extract-context",
    "prescore-cache",
    "doctor",
    "completions",
    "help",
];

const HANDOFF_SUBCOMMANDS: &[&str] = &[
    "list",
    "show",
    "add",
    "update",
    "tried",
    "complete",
    "archive",
    "inject",
    "inject-todos",
    "sync-todos",
    "set-context",
    "set-session",
    "get-session-handoff",
    "process-transcript",
];

fn bash_completions() -> String {
    format!(
        r#"_claude_recall() {{
    local cur prev subcmds
    COMPREPLY=()
    cur="${{COMP_WORDS[COMP_CWORD]}}"
    prev="${{COMP_WORDS[COMP_CWORD-1]}}"
    subcmds="{subcmds}"

    if [[ $COMP_CWORD -eq 1 ]]; then
        COMPREPLY=( $(compgen -W "$subcmds" -- "$cur") )
        return 0
    fi

    case "$prev" in
        handoff) COMPREPLY=( $(compgen -W "{handoff}" -- "$cur") ) ;;
        --category) COMPREPLY=( $(compgen -W "pattern correction decision gotcha preference" -- "$cur") ) ;;
        --type) COMPREPLY=( $(compgen -W "constraint informational preference" -- "$cur") ) ;;
        --status) COMPREPLY=( $(compgen -W "not_started in_progress blocked ready_for_review completed" -- "$cur") ) ;;
        completions) COMPREPLY=( $(compgen -W "bash zsh fish" -- "$cur") ) ;;
        --top|--min-score|--timeout|--search|--session|--transcript|--json|--git-ref) ;;
        *) COMPREPLY=( $(compgen -W "--stale --category --search --system --no-promote --type --force --top --min-score --timeout" -- "$cur") ) ;;
    esac
    return 0
}}
complete -F _claude_recall claude-recall
"#,
        subcmds = SUBCOMMANDS.join(" "),
        handoff = HANDOFF_SUBCOMMANDS.join(" ")
    )
}

fn zsh_completions() -> String {
    format!(
        r#"#compdef claude-recall

_claude_recall() {{
    local -a subcmds
    subcmds=({subcmds})

    _arguments -C \
        '1:command:((${{subcmds}}))' \
        '*:: :->args'

    case $state in
        args)
            case $words[1] in
                handoff)
                    _arguments '1:subcommand:({handoff})'
                    ;;
                list)
                    _arguments \
                        '--stale[Only stale lessons]' \
                        '--category[Category filter]:category:(pattern correction decision gotcha preference)' \
                        '--search[Substring search]:text:'
                    ;;
                add)
                    _arguments \
                        '--system[System tier]' \
                        '--no-promote[Non-promotable]' \
                        '--type[Lesson type]:type:(constraint informational preference)' \
                        '--force[Skip duplicate check]'
                    ;;
                score-relevance|score-local)
                    _arguments \
                        '--top[Result count]:n:' \
                        '--min-score[Minimum score]:m:' \
                        '--timeout[Deadline seconds]:s:'
                    ;;
                completions)
                    _arguments '1:shell:(bash zsh fish)'
                    ;;
            esac
            ;;
    esac
}}

_claude_recall "$@"
"#,
        subcmds = SUBCOMMANDS.join(" "),
        handoff = HANDOFF_SUBCOMMANDS.join(" ")
    )
}

fn fish_completions() -> String {
    let mut out =
        String::from("# claude-recall completions for fish\ncomplete -c claude-recall -e\n");
    for cmd in SUBCOMMANDS {
        out.push_str(&format!(
            "complete -c claude-recall -n '__fish_use_subcommand' -a '{cmd}'\n"
        ));
    }
    for sub in HANDOFF_SUBCOMMANDS {
        out.push_str(&format!(
            "complete -c claude-recall -n '__fish_seen_subcommand_from handoff' -a '{sub}'\n"
        ));
    }
    out.push_str(
        r#"complete -c claude-recall -n '__fish_seen_subcommand_from list' -l stale
complete -c claude-recall -n '__fish_seen_subcommand_from list' -l category -xa 'pattern correction decision gotcha preference'
complete -c claude-recall -n '__fish_seen_subcommand_from list' -l search -x
complete -c claude-recall -n '__fish_seen_subcommand_from add' -l system
complete -c claude-recall -n '__fish_seen_subcommand_from add' -l no-promote
complete -c claude-recall -n '__fish_seen_subcommand_from add edit' -l type -xa 'constraint informational preference'
complete -c claude-recall -n '__fish_seen_subcommand_from add' -l force
complete -c claude-recall -n '__fish_seen_subcommand_from score-relevance score-local' -l top -x
complete -c claude-recall -n '__fish_seen_subcommand_from score-relevance' -l min-score -x
complete -c claude-recall -n '__fish_seen_subcommand_from score-relevance' -l timeout -x
complete -c claude-recall -n '__fish_seen_subcommand_from completions' -xa 'bash zsh fish'
"#,
    );
    out
}
