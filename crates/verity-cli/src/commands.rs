//! Slash commands for interactive mode

/// Result of executing a slash command
#[derive(Debug, PartialEq)]
pub enum CommandResult {
    /// Clear the conversation
    Clear,
    /// Change the per-question retry budget
    SetRetries(u32),
    /// Toggle listing of supporting passages after each answer
    ToggleSources,
    /// Show a message to the user (not sent to the workflow)
    Message(String),
    /// Exit the application
    Exit,
    /// Unknown command
    Unknown(String),
}

/// Parse and execute a slash command
pub fn execute_command(
    input: &str,
    current_retries: u32,
    history_len: usize,
) -> Option<CommandResult> {
    let input = input.trim();
    let rest = input.strip_prefix('/')?;

    let parts: Vec<&str> = rest.splitn(2, ' ').collect();
    let command = parts[0].to_lowercase();
    let args = parts.get(1).map(|s| s.trim()).unwrap_or("");

    Some(match command.as_str() {
        "help" | "h" | "?" => CommandResult::Message(help_message()),

        "clear" | "c" => CommandResult::Clear,

        "quit" | "exit" | "q" => CommandResult::Exit,

        "retries" | "r" => retries(args, current_retries),

        "sources" | "s" => CommandResult::ToggleSources,

        "history" => CommandResult::Message(format!(
            "{} message{} in this conversation",
            history_len,
            if history_len == 1 { "" } else { "s" }
        )),

        _ => CommandResult::Unknown(command),
    })
}

fn retries(args: &str, current: u32) -> CommandResult {
    if args.is_empty() {
        return CommandResult::Message(format!(
            "Retry budget: {} (up to {} answers per question)",
            current,
            current.saturating_add(1)
        ));
    }
    match args.parse::<u32>() {
        Ok(n) => CommandResult::SetRetries(n),
        Err(_) => CommandResult::Message(format!("Invalid retry budget: {}", args)),
    }
}

fn help_message() -> String {
    r#"Available commands:
  /help, /h, /?        Show this help message
  /retries, /r [n]     Show or set the retry budget per question
  /sources, /s         Toggle listing the supporting passages
  /history             Show conversation length
  /clear, /c           Clear conversation history
  /quit, /exit, /q     Exit verity

Examples:
  /retries 1           Allow one regeneration or rewrite per question
  /clear               Start fresh conversation"#
        .to_string()
}
