//! Terminal front end: one-shot prompts, a line REPL and history maintenance.

use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::Engine;
use clap::Parser;

use crate::plugins::history::{ConversationStore, HistoryStore, MediaAttachments};
use crate::plugins::ui_tree::{self, SnapshotSource, DEFAULT_MAX_CHARS};
use crate::services::ai::{split_display, ChatError, ChatSession, RepaintSink, StreamProxy, TurnOutcome};
use crate::services::command::{extract_commands, CommandApproval, CommandResult, CommandRunner};
use crate::services::config::{self, ChatSettings, ProviderPublicConfig, ProviderSettings};
use crate::services::intent;
use crate::services::sync::SyncHub;

/// Chat with an LLM provider from the terminal.
#[derive(Parser, Debug, Clone)]
#[command(version)]
pub struct Cli {
    /// Image to attach to the first prompt.
    #[arg(long, short = 'i', value_name = "FILE")]
    pub image: Option<PathBuf>,

    /// Accessibility snapshot (JSON list of windows) appended to the first prompt.
    #[arg(long = "ui-tree", value_name = "FILE")]
    pub ui_tree: Option<PathBuf>,

    /// Maximum UI tree depth to keep (1..=10). Picked per question when omitted.
    #[arg(long, value_name = "N")]
    pub depth: Option<usize>,

    /// Never offer to run commands proposed in answers.
    #[arg(long = "no-commands", default_value_t = false)]
    pub no_commands: bool,

    /// Print the provider configuration (without the key) and exit.
    #[arg(long = "show-config", default_value_t = false)]
    pub show_config: bool,

    /// Override the configured model.
    #[arg(long, short = 'm')]
    pub model: Option<String>,

    /// Do not save this session.
    #[arg(long, default_value_t = false)]
    pub private: bool,

    /// List saved conversations and exit.
    #[arg(long, default_value_t = false)]
    pub list: bool,

    /// Search saved conversations by title or content and exit.
    #[arg(long, value_name = "KEYWORD")]
    pub search: Option<String>,

    /// Continue a saved conversation.
    #[arg(long, value_name = "ID")]
    pub resume: Option<String>,

    /// Delete a saved conversation and exit.
    #[arg(long, value_name = "ID")]
    pub delete: Option<String>,

    /// Keep only the N most recent conversations and exit.
    #[arg(long, value_name = "N")]
    pub cleanup: Option<usize>,

    /// Prompt to send. Starts an interactive session when omitted.
    pub prompt: Vec<String>,
}

/// Prints the delta between repaints; reasoning goes to stderr.
#[derive(Default)]
struct TerminalRepaint {
    // (message id, reasoning chars printed, answer bytes printed)
    printed: Mutex<(String, usize, usize)>,
}

impl RepaintSink for TerminalRepaint {
    fn repaint(&self, message_id: &str, content: &str) {
        let Ok(mut printed) = self.printed.lock() else {
            return;
        };
        if printed.0 != message_id {
            *printed = (message_id.to_string(), 0, 0);
        }
        let (reasoning, answer) = split_display(content);

        if let Some(delta) = reasoning.get(printed.1..).filter(|d| !d.is_empty()) {
            eprint!("{delta}");
            printed.1 = reasoning.len();
        }
        if let Some(delta) = answer.get(printed.2..).filter(|d| !d.is_empty()) {
            if printed.2 == 0 && !reasoning.is_empty() {
                eprintln!();
            }
            print!("{delta}");
            let _ = std::io::stdout().flush();
            printed.2 = answer.len();
        }
    }
}

fn mime_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .as_deref()
    {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "image/png",
    }
}

/// Reads an image file into a `data:` URI.
pub fn image_data_uri(path: &Path) -> Result<String, String> {
    let bytes = std::fs::read(path).map_err(|e| format!("Failed to read {}: {e}", path.display()))?;
    let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
    Ok(format!("data:{};base64,{}", mime_for(path), encoded))
}

fn load_snapshot(path: &Path) -> Result<SnapshotSource, String> {
    let json =
        std::fs::read_to_string(path).map_err(|e| format!("Failed to read {}: {e}", path.display()))?;
    SnapshotSource::from_json(&json)
}

/// Compacted snapshot for `message`. A fixed `depth` skips intent detection.
async fn snapshot_context(
    proxy: &StreamProxy,
    settings: &ProviderSettings,
    source: &SnapshotSource,
    depth: Option<usize>,
    message: &str,
) -> Option<String> {
    match depth {
        Some(_) => ui_tree::windows_for_ai(source, depth, DEFAULT_MAX_CHARS),
        None => {
            intent::ui_context_for_message(proxy, settings, source, message, DEFAULT_MAX_CHARS).await
        }
    }
}

fn with_context(message: &str, context: Option<String>) -> String {
    match context {
        Some(xml) => format!("{message}\n\n{xml}"),
        None => message.to_string(),
    }
}

fn public_config_json(settings: &ProviderSettings) -> Result<String, String> {
    serde_json::to_string_pretty(&ProviderPublicConfig::from(settings)).map_err(|e| e.to_string())
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

fn confirm(prompt: &str) -> bool {
    eprint!("{prompt}");
    let _ = std::io::stderr().flush();
    let mut line = String::new();
    std::io::stdin().read_line(&mut line).is_ok() && is_yes(&line)
}

/// Asks on the terminal before each command.
struct TerminalApproval;

#[async_trait]
impl CommandApproval for TerminalApproval {
    async fn approve(&self, command: &str) -> bool {
        let prompt = format!("Run `{command}`? [y/N] ");
        tokio::task::spawn_blocking(move || confirm(&prompt))
            .await
            .unwrap_or(false)
    }
}

fn print_command_result(result: &CommandResult) {
    if !result.output.is_empty() {
        println!("{}", result.output);
    }
    if !result.success {
        let code = result
            .exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "none".to_string());
        eprintln!(
            "[command failed, exit code {code}] {}",
            result.error.as_deref().unwrap_or_default()
        );
    }
}

/// Offers each `<command>` of a finished answer; reasoning is never scanned.
async fn run_proposed_commands(
    runner: &CommandRunner,
    content: &str,
    approval: &dyn CommandApproval,
) -> Vec<CommandResult> {
    let (_, answer) = split_display(content);
    let mut results = Vec::new();
    for command in extract_commands(answer) {
        match runner.run(&command, approval).await {
            Ok(result) => {
                print_command_result(&result);
                results.push(result);
            }
            Err(err) if err.is_cancelled() => eprintln!("[skipped] {command}"),
            Err(err) => eprintln!("Error: {}", err.user_message()),
        }
    }
    results
}

/// Sends one message; `interrupt` resolving cancels the running turn.
async fn send_interruptible(
    session: &ChatSession,
    text: &str,
    media: MediaAttachments,
    repaint: &dyn RepaintSink,
    interrupt: impl Future<Output = ()>,
) -> Result<TurnOutcome, ChatError> {
    let send = session.send(text, media, repaint);
    tokio::pin!(send);
    tokio::pin!(interrupt);
    tokio::select! {
        biased;
        outcome = &mut send => return outcome,
        () = &mut interrupt => {
            log::info!("Interrupted; cancelling the running answer");
            session.cancel_current();
        }
    }
    send.await
}

/// Resolves on Ctrl-C. Never resolves when the handler cannot be installed.
async fn ctrl_c() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        log::warn!("Cannot listen for Ctrl-C: {}", err);
        std::future::pending::<()>().await;
    }
}

async fn run_maintenance(cli: &Cli, store: &HistoryStore) -> Result<bool, String> {
    if let Some(keep) = cli.cleanup {
        let removed = store.cleanup(keep).await.map_err(|e| e.to_string())?;
        println!("Removed {removed} conversations");
        return Ok(true);
    }
    if let Some(id) = &cli.delete {
        store.delete_conversation(id).await.map_err(|e| e.to_string())?;
        println!("Deleted {id}");
        return Ok(true);
    }

    let summaries = match &cli.search {
        Some(keyword) => store.search_conversations(keyword).await,
        None if cli.list => store.list_conversations().await,
        None => return Ok(false),
    };
    let summaries = summaries.map_err(|e| e.to_string())?;

    if summaries.is_empty() {
        println!("No conversations");
    }
    for summary in summaries {
        println!(
            "{}  {:>4} msgs  {}  {}",
            summary.id, summary.message_count, summary.timestamp, summary.title
        );
    }
    Ok(true)
}

fn report(outcome: &Result<TurnOutcome, ChatError>) {
    println!();
    match outcome {
        Ok(TurnOutcome::Completed { .. }) => {}
        Ok(TurnOutcome::Cancelled { .. }) => eprintln!("[cancelled]"),
        Ok(TurnOutcome::Failed { error, .. }) => eprintln!("Error: {}", error.user_message()),
        Err(err) => eprintln!("Error: {}", err.user_message()),
    }
}

fn read_line() -> Option<String> {
    print!("> ");
    let _ = std::io::stdout().flush();
    let mut line = String::new();
    match std::io::stdin().read_line(&mut line) {
        Ok(0) | Err(_) => None,
        Ok(_) => Some(line.trim_end_matches(['\r', '\n']).to_string()),
    }
}

fn settings_for(cli: &Cli) -> ChatSettings {
    let mut settings = config::load_chat_settings();
    if let Some(model) = &cli.model {
        settings.provider.model = model.clone();
    }
    if cli.private {
        settings.private_mode = true;
    }
    settings
}

struct Terminal<'a> {
    cli: &'a Cli,
    proxy: Arc<StreamProxy>,
    session: ChatSession,
    repaint: TerminalRepaint,
    runner: CommandRunner,
    // Snapshot and media ride along with the first message only.
    first: Option<(Option<SnapshotSource>, MediaAttachments)>,
}

impl Terminal<'_> {
    async fn turn(&mut self, line: &str) -> Result<TurnOutcome, ChatError> {
        let (text, media) = match self.first.take() {
            Some((snapshot, media)) => {
                let context = match &snapshot {
                    Some(source) => {
                        let settings = self.session.settings();
                        let context =
                            snapshot_context(&self.proxy, &settings.provider, source, self.cli.depth, line)
                                .await;
                        if context.is_none() {
                            log::warn!("UI tree snapshot had no visible content");
                        }
                        context
                    }
                    None => None,
                };
                (with_context(line, context), media)
            }
            None => (line.to_string(), MediaAttachments::default()),
        };

        let outcome =
            send_interruptible(&self.session, &text, media, &self.repaint, ctrl_c()).await;
        report(&outcome);
        if let Ok(TurnOutcome::Completed { content }) = &outcome {
            if !self.cli.no_commands {
                run_proposed_commands(&self.runner, content, &TerminalApproval).await;
            }
        }
        outcome
    }
}

pub async fn run(cli: Cli) -> Result<(), String> {
    let settings = settings_for(&cli);
    if cli.show_config {
        println!("{}", public_config_json(&settings.provider)?);
        return Ok(());
    }

    let store = HistoryStore::open_default().await.map_err(|e| e.to_string())?;
    if run_maintenance(&cli, &store).await? {
        return Ok(());
    }

    log::info!(
        "Provider config: {}",
        serde_json::to_string(&ProviderPublicConfig::from(&settings.provider)).unwrap_or_default()
    );

    let hub = Arc::new(SyncHub::default());
    let store: Arc<dyn ConversationStore> = Arc::new(store);
    let proxy = Arc::new(StreamProxy::default());
    let session = ChatSession::new(proxy.clone(), hub.endpoint("terminal"), store, settings);
    if let Some(id) = &cli.resume {
        session.open_conversation(id).await.map_err(|e| e.user_message())?;
        let count = session.messages().map(|m| m.len()).unwrap_or(0);
        eprintln!("Resumed {id} ({count} messages)");
    }

    let mut media = MediaAttachments::default();
    if let Some(path) = &cli.image {
        media.image = Some(image_data_uri(path)?);
    }
    let snapshot = cli.ui_tree.as_deref().map(load_snapshot).transpose()?;
    let mut terminal = Terminal {
        cli: &cli,
        proxy,
        session,
        repaint: TerminalRepaint::default(),
        runner: CommandRunner::default(),
        first: Some((snapshot, media)),
    };

    if !cli.prompt.is_empty() {
        let outcome = terminal.turn(&cli.prompt.join(" ")).await;
        return match outcome {
            Ok(TurnOutcome::Failed { error, .. }) | Err(error) => Err(error.user_message()),
            Ok(_) => Ok(()),
        };
    }

    eprintln!(
        "Type a message. /new starts a new conversation, /quit exits. Ctrl-C cancels a running answer, or exits at the prompt."
    );
    loop {
        // Ctrl-C at the prompt exits; the pending stdin read is abandoned.
        let line = tokio::select! {
            line = tokio::task::spawn_blocking(read_line) => match line {
                Ok(Some(line)) => line,
                Ok(None) | Err(_) => break,
            },
            () = ctrl_c() => {
                eprintln!();
                break;
            }
        };
        match line.trim() {
            "" => continue,
            "/quit" | "/exit" => break,
            "/new" => {
                let id = terminal.session.new_conversation().map_err(|e| e.user_message())?;
                eprintln!("New conversation {id}");
                continue;
            }
            _ => {}
        }
        let _ = terminal.turn(&line).await;
    }
    Ok(())
}
