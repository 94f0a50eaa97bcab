//! verity - health question answering over forum expert replies

mod commands;
mod config;
mod utils;

use clap::Parser;
use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use verity_agent::{
    AnswerTool, ConversationState, NextState, RetryConfig, Workflow, WorkflowConfig,
    WorkflowEvent, adapters, retry::user_message,
};
use verity_ai::{
    Message, Model,
    providers::{openai::OpenAIProvider, qdrant::QdrantClient},
};

/// verity - answers health questions from forum expert replies, checking
/// each answer against its sources
#[derive(Parser, Debug)]
#[command(name = "verity")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Chat model to use (default: gpt-4o)
    #[arg(short, long)]
    model: Option<String>,

    /// OpenAI-compatible API endpoint
    #[arg(long)]
    base_url: Option<String>,

    /// Qdrant REST endpoint
    #[arg(long)]
    qdrant_url: Option<String>,

    /// Qdrant collection with the forum passages
    #[arg(long)]
    collection: Option<String>,

    /// Passages retrieved per query
    #[arg(short = 'k', long)]
    top_k: Option<usize>,

    /// Regenerations or rewrites allowed per question
    #[arg(short = 'r', long)]
    max_retries: Option<u32>,

    /// Answer a single question and exit
    #[arg(short = 'c', long)]
    command: Option<String>,

    /// List the supporting passages after each answer
    #[arg(short, long)]
    sources: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Initialize config file
    #[arg(long)]
    init_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Setup tracing
    let filter = if args.verbose {
        EnvFilter::new("verity=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    // Initialize config and exit
    if args.init_config {
        match config::Config::init() {
            Ok(path) => {
                println!("Config file at: {}", path.display());
                println!("\nExample config:\n{}", config::example_config());
            }
            Err(e) => {
                eprintln!("Error creating config: {}", e);
                std::process::exit(1);
            }
        }
        return Ok(());
    }

    // Merge config with CLI args (CLI takes precedence)
    let mut cfg = config::Config::load();
    if let Some(model) = args.model {
        cfg.model = model;
    }
    if let Some(base_url) = args.base_url {
        cfg.base_url = base_url;
    }
    if let Some(qdrant_url) = args.qdrant_url {
        cfg.qdrant_url = qdrant_url;
    }
    if let Some(collection) = args.collection {
        cfg.collection = collection;
    }
    if let Some(top_k) = args.top_k {
        cfg.top_k = top_k;
    }
    if let Some(max_retries) = args.max_retries {
        cfg.max_retries = max_retries;
    }

    let Some(api_key) = cfg.get_api_key("openai") else {
        eprintln!("Error: No API key found for the chat model");
        eprintln!();
        eprintln!("Set your API key with: export OPENAI_API_KEY=your-key");
        eprintln!("Or add it to config file: verity --init-config");
        std::process::exit(1);
    };

    let session = build_session(&cfg, api_key);
    let mut printer = EventPrinter::spawn(session.subscribe());

    // Non-interactive mode
    if let Some(command) = args.command {
        return run_command(&session, &mut printer, &command, args.sources).await;
    }

    run_interactive(session, &mut printer, args.sources).await
}

/// Wire the service clients into the answering loop
fn build_session(cfg: &config::Config, api_key: String) -> Session {
    let http = reqwest::Client::new();

    let openai = Arc::new(
        OpenAIProvider::new(api_key)
            .with_client(http.clone())
            .with_embedding_model(&cfg.embedding_model, &cfg.base_url),
    );
    let model = Model::openai(&cfg.model).with_base_url(&cfg.base_url);

    let mut qdrant = QdrantClient::new(&cfg.qdrant_url).with_client(http);
    if let Some(key) = cfg.get_api_key("qdrant") {
        qdrant = qdrant.with_api_key(key);
    }
    let retriever = Arc::new(
        adapters::QdrantRetriever::new(openai.clone(), qdrant, &cfg.collection)
            .with_top_k(cfg.top_k),
    );

    let workflow = Arc::new(Workflow::new(
        WorkflowConfig {
            max_retries: cfg.max_retries,
        },
        adapters::chat_collaborators(openai, model, retriever),
    ));

    let retry = RetryConfig {
        max_attempts: cfg.turn_attempts,
        ..Default::default()
    }
    .with_attempt_timeout(cfg.turn_timeout_secs.map(Duration::from_secs));

    Session {
        tool: AnswerTool::new(workflow.clone()).with_retry_config(retry),
        workflow,
    }
}

struct Session {
    tool: AnswerTool,
    workflow: Arc<Workflow>,
}

impl Session {
    fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.workflow.subscribe()
    }

    /// Run a turn, cancelling it on Ctrl-C
    async fn ask(&self, history: &[Message], question: &str) -> verity_agent::Result<ConversationState> {
        let cancel = CancellationToken::new();
        tokio::select! {
            result = self.tool.run_turn(history, question, cancel.clone()) => result,
            _ = tokio::signal::ctrl_c() => {
                cancel.cancel();
                Err(verity_agent::Error::Cancelled)
            }
        }
    }
}

/// Prints workflow events as they arrive and reports finished attempts
struct EventPrinter {
    /// `true` for a completed turn, `false` for a failed attempt
    done_rx: mpsc::UnboundedReceiver<bool>,
}

impl EventPrinter {
    fn spawn(mut receiver: broadcast::Receiver<WorkflowEvent>) -> Self {
        let (done_tx, done_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            loop {
                let event = match receiver.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::debug!(skipped = n, "event printer lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                print_event(&event);
                if event.is_terminal() {
                    let completed = matches!(event, WorkflowEvent::TurnEnd { .. });
                    let _ = done_tx.send(completed);
                }
            }
        });

        Self { done_rx }
    }

    /// Forget terminal events left over from earlier turns
    fn reset(&mut self) {
        while self.done_rx.try_recv().is_ok() {}
    }

    /// Wait briefly for the printer to catch up with the last attempt.
    ///
    /// Failed attempts that were retried leave their signals queued ahead
    /// of the final one, so a completed turn waits for its `TurnEnd` and a
    /// failed one drains until the printer goes quiet.
    async fn settle(&mut self, completed: bool) {
        let wait = Duration::from_millis(200);
        while let Ok(Some(turn_ended)) = tokio::time::timeout(wait, self.done_rx.recv()).await {
            if completed && turn_ended {
                break;
            }
        }
    }
}

fn print_event(event: &WorkflowEvent) {
    match event {
        WorkflowEvent::AnswerDelta { delta, .. } => {
            print!("{}", delta);
            let _ = io::stdout().flush();
        }
        WorkflowEvent::Generated { .. } => println!(),
        WorkflowEvent::Routed { next, .. } => match next {
            NextState::Generate => println!("[Answer not supported by the sources, answering again...]"),
            NextState::TransformQuery => println!("[Answer misses the question, rephrasing the search...]"),
            NextState::Finalize => {}
        },
        WorkflowEvent::QueryRewritten { question } => {
            println!("[Searching for: {}]", question);
        }
        WorkflowEvent::BudgetExhausted { .. } => {
            println!("[Retry budget used up, keeping the last answer]");
        }
        WorkflowEvent::Error { message, .. } => {
            tracing::debug!(error = %message, "turn attempt failed");
        }
        _ => {}
    }
}

fn print_sources(state: &ConversationState) {
    if state.documents.is_empty() {
        println!("[No supporting passages]");
        return;
    }
    println!("Sources:");
    for (i, passage) in state.documents.iter().enumerate() {
        println!(
            "  {}. ({}) {}",
            i + 1,
            passage.source,
            utils::truncate_chars(&utils::one_line(&passage.content), 160)
        );
    }
}

async fn run_command(
    session: &Session,
    printer: &mut EventPrinter,
    question: &str,
    show_sources: bool,
) -> anyhow::Result<()> {
    println!("verity> {}", question);
    println!();

    let result = session.ask(&[], question).await;
    printer.settle(result.is_ok()).await;

    match result {
        Ok(state) => {
            if show_sources {
                print_sources(&state);
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("Error: {}", user_message(&e));
            std::process::exit(1);
        }
    }
}

async fn run_interactive(
    mut session: Session,
    printer: &mut EventPrinter,
    mut show_sources: bool,
) -> anyhow::Result<()> {
    let mut history: Vec<Message> = Vec::new();

    if std::io::IsTerminal::is_terminal(&std::io::stderr()) {
        eprintln!(
            "verity (retry budget {}) - type /help for commands",
            session.tool.max_retries()
        );
        eprintln!();
    }

    loop {
        print!("> ");
        io::stdout().flush()?;

        let mut input = String::new();
        if io::stdin().read_line(&mut input)? == 0 {
            // EOF
            break;
        }

        let input = input.trim();
        if input.is_empty() {
            continue;
        }

        if let Some(result) =
            commands::execute_command(input, session.tool.max_retries(), history.len())
        {
            match result {
                commands::CommandResult::Clear => {
                    history.clear();
                    println!("Cleared conversation.");
                }
                commands::CommandResult::Exit => break,
                commands::CommandResult::Message(msg) => println!("{}", msg),
                commands::CommandResult::SetRetries(n) => {
                    session.tool.set_max_retries(n);
                    println!(
                        "Retry budget set to {} (up to {} answers)",
                        n,
                        n.saturating_add(1)
                    );
                }
                commands::CommandResult::ToggleSources => {
                    show_sources = !show_sources;
                    println!(
                        "Sources {}.",
                        if show_sources { "shown" } else { "hidden" }
                    );
                }
                commands::CommandResult::Unknown(cmd) => {
                    println!("Unknown command: /{}", cmd);
                    println!("Type /help for available commands.");
                }
            }
            continue;
        }

        printer.reset();
        let result = session.ask(&history, input).await;
        printer.settle(result.is_ok()).await;

        match result {
            Ok(state) => {
                if show_sources {
                    print_sources(&state);
                }
                history = state.messages;
            }
            Err(verity_agent::Error::Cancelled) => println!("\n[Cancelled]"),
            Err(e) => eprintln!("Error: {}", user_message(&e)),
        }
        println!();
    }

    Ok(())
}
