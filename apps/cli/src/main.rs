use anyhow::Context;
use chatline_config::load as load_config;
use chatline_runtime::{shutdown_signal, telemetry, ClientServices};
use chatline_sync::{
    AddPeerOutcome, Message, Notification, PeerId, SyncInput, SyncOrchestrator, SyncState,
    SyncUpdate,
};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info};

#[derive(Parser)]
#[command(name = "chatline")]
#[command(about = "Chatline terminal client")]
struct Cli {
    /// Id of the local user
    #[arg(long)]
    user: String,
    /// Peer to open once connected
    #[arg(long)]
    peer: Option<String>,
}

enum Event {
    Line(Option<String>),
    Input(SyncInput),
    Notice(Notification),
    Shutdown,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    telemetry::init_tracing().context("failed to initialise tracing")?;

    let config = load_config().context("failed to load configuration")?;
    let services =
        ClientServices::initialise(&config).context("failed to initialise client services")?;

    let mut engine = services.orchestrator();
    let mut notifications = engine
        .take_notifications()
        .context("notification stream already taken")?;

    info!(user = %cli.user, "starting chat session");
    engine
        .start_session(cli.user.as_str())
        .context("failed to start chat session")?;
    if let Some(peer) = cli.peer {
        engine
            .select_peer(Some(peer.into()))
            .context("failed to open peer")?;
    }

    println!("Chatline");
    println!("Type '/help' for commands; any other line is sent to the selected peer");
    println!("Use Ctrl+C or '/quit' to exit");
    println!("---");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        let event = tokio::select! {
            line = lines.next_line() => Event::Line(line.context("failed to read stdin")?),
            Some(input) = engine.next_input() => Event::Input(input),
            Some(notice) = notifications.recv() => Event::Notice(notice),
            _ = &mut shutdown => Event::Shutdown,
        };

        match event {
            Event::Line(None) | Event::Shutdown => break,
            Event::Line(Some(line)) => {
                if !handle_line(&mut engine, line.trim()).await {
                    break;
                }
            }
            Event::Input(input) => {
                if let Some(update) = engine.apply(input) {
                    render_update(&engine, &update);
                }
            }
            Event::Notice(notice) => println!("{notice}"),
        }
    }

    engine.end_session();
    println!("Goodbye!");
    Ok(())
}

/// Handle one line of input. Returns `false` when the user asked to quit.
///
/// Failed operations are already reported on the notification stream.
async fn handle_line(engine: &mut SyncOrchestrator, line: &str) -> bool {
    if line.is_empty() {
        return true;
    }

    let (command, argument) = split_command(line);
    if argument.is_empty() {
        if let Some(usage) = usage(command) {
            println!("{usage}");
            return true;
        }
    }

    match command {
        "/quit" | "/exit" | "/q" => return false,
        "/help" | "/h" => print_help(),
        "/roster" | "/r" => print_roster(engine),
        "/select" | "/s" => {
            let peer = (!argument.is_empty()).then(|| PeerId::from(argument));
            if engine.select_peer(peer).is_ok() && argument.is_empty() {
                println!("No peer selected");
            }
        }
        "/find" | "/f" => {
            if let Ok(candidates) = engine.search_candidates(argument).await {
                if candidates.is_empty() {
                    println!("No users found");
                }
                for candidate in candidates {
                    println!("  {}: {} <{}>", candidate.id, candidate.display_name, candidate.email);
                }
            }
        }
        "/add" | "/a" => match engine.add_peer(argument).await {
            Ok(AddPeerOutcome::AlreadyPresent) => println!("{argument} is already in your chats"),
            Ok(_) => println!("Added {argument}"),
            Err(error) => debug!(%error, "add failed"),
        },
        "/remove" | "/rm" => {
            if engine.remove_peer(&PeerId::from(argument)).await.is_ok() {
                println!("Removed {argument}");
            }
        }
        "/clear" | "/cl" => match selected_peer(engine) {
            Some(peer) => {
                if engine.clear_history(&peer).await.is_ok() {
                    println!("Chat history with {peer} cleared");
                }
            }
            None => println!("Select a peer first"),
        },
        "/search" | "/find-text" => match selected_peer(engine) {
            Some(peer) => {
                let found = engine.search(&peer, argument);
                println!("{} matching message(s)", found.len());
                for message in &found {
                    println!("{}", format_message(message, &peer));
                }
            }
            None => println!("Select a peer first"),
        },
        "/history" | "/hi" => match selected_peer(engine) {
            Some(peer) => print_history(engine, &peer),
            None => println!("Select a peer first"),
        },
        _ if command.starts_with('/') => {
            println!("Unknown command '{command}', type '/help' for a list");
        }
        _ => {
            // Line mode only sees whole lines, so the typing signal goes out
            // just ahead of the message rather than per keystroke.
            engine.compose_input();
            let _ = engine.send_message(line).await;
        }
    }
    true
}

fn split_command(line: &str) -> (&str, &str) {
    match line.split_once(char::is_whitespace) {
        Some((command, argument)) => (command, argument.trim()),
        None => (line, ""),
    }
}

/// Hint for commands that cannot run without an argument.
fn usage(command: &str) -> Option<&'static str> {
    match command {
        "/add" | "/a" => Some("Usage: /add <id>"),
        "/remove" | "/rm" => Some("Usage: /remove <id>"),
        _ => None,
    }
}

fn selected_peer(engine: &SyncOrchestrator) -> Option<PeerId> {
    engine
        .context()
        .and_then(|context| context.selected_peer.clone())
}

fn print_help() {
    println!("Available commands:");
    println!("  /help, /h            - Show this help");
    println!("  /roster, /r          - List your chats");
    println!("  /select, /s <id>     - Open the chat with a peer (no id to close it)");
    println!("  /find, /f <query>    - Search for users to add");
    println!("  /add, /a <id>        - Add a user to your chats");
    println!("  /remove, /rm <id>    - Remove a user from your chats");
    println!("  /clear, /cl          - Delete the history of the open chat");
    println!("  /search <text>       - Search the open chat");
    println!("  /history, /hi        - Show the open chat");
    println!("  /quit, /exit, /q     - Exit");
}

fn print_roster(engine: &SyncOrchestrator) {
    let roster = engine.roster();
    if roster.is_empty() {
        println!("No chats yet");
        return;
    }
    let selected = selected_peer(engine);
    println!("Chats:");
    for peer in roster {
        let marker = if selected.as_ref() == Some(&peer.id) { '*' } else { ' ' };
        let presence = match peer.online {
            Some(true) => "online",
            Some(false) => "offline",
            None => "unknown",
        };
        let pinned = if peer.is_pinned() { " [pinned]" } else { "" };
        println!(
            " {marker}{}: {} <{}> ({presence}){pinned}",
            peer.id, peer.display_name, peer.email
        );
    }
}

fn print_history(engine: &SyncOrchestrator, peer: &PeerId) {
    let messages = engine.messages(peer);
    if messages.is_empty() {
        println!("No messages with {peer}");
    }
    for message in messages {
        println!("{}", format_message(message, peer));
    }
}

fn format_message(message: &Message, peer: &PeerId) -> String {
    let author = if message.is_local() {
        "you".to_string()
    } else {
        peer.to_string()
    };
    format!(
        "[{}] {author}: {}",
        message.sent_at.format("%Y-%m-%d %H:%M:%S"),
        message.text
    )
}

fn render_update(engine: &SyncOrchestrator, update: &SyncUpdate) {
    match update {
        SyncUpdate::StateChanged(SyncState::Connected { .. }) => println!("* connected"),
        SyncUpdate::StateChanged(SyncState::Connecting) => println!("* connection lost, retrying"),
        SyncUpdate::StateChanged(SyncState::Disconnected) => println!("* disconnected"),
        SyncUpdate::RosterUpdated => println!("* {} chat(s) loaded", engine.roster().len()),
        SyncUpdate::PresenceChanged { peer, online } => {
            println!("* {peer} is {}", if *online { "online" } else { "offline" });
        }
        SyncUpdate::HistoryLoaded { peer } => {
            println!("--- chat with {peer} ---");
            print_history(engine, peer);
        }
        SyncUpdate::MessageAppended { peer, message } => {
            println!("{}", format_message(message, peer));
        }
        SyncUpdate::TypingStarted { peer } => println!("* {peer} is typing..."),
        SyncUpdate::TypingStopped { peer } => debug!(peer = %peer, "typing stopped"),
        SyncUpdate::ProfileLoaded(profile) => {
            println!("* signed in as {} <{}>", profile.display_name, profile.email);
        }
    }
}
