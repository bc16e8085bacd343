//! Terminal client for a realtime chat room.
//!
//! Run with: cargo run -p chat-tui -- --room <ROOM_ID>
//!
//! Replies stream in through the session's coalescer. Ctrl+R forces a
//! reconnect; with `--close-when-unfocused` the connection is torn down while
//! the terminal loses focus and restored when it regains it.

use std::{
    fs::File,
    io,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::Context;
use chat_realtime_core::{RoomContext, SessionConfig, SessionEvent, traits::StaticCredential};
use chat_realtime_session::{RoomClient, SendOutcome, StreamingTextHandler, Visibility};
use chat_realtime_transport::{ChatView, UiCommand, WebSocketConnector};
use clap::Parser;
use crossterm::{
    event::{self, DisableFocusChange, EnableFocusChange, Event},
    execute,
    terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use futures::StreamExt;
use ratatui::{Terminal, backend::CrosstermBackend};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "chat-tui", about = "Terminal client for a realtime chat room")]
struct Args {
    /// Server base URL; http(s) maps to ws(s).
    #[arg(long, env = "CHAT_BASE_URL", default_value = "http://localhost:8000")]
    base_url: String,

    /// Room to join.
    #[arg(long, env = "CHAT_ROOM")]
    room: String,

    /// Bearer token for the connection.
    #[arg(long, env = "CHAT_TOKEN")]
    token: Option<String>,

    /// Session settings (TOML).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write logs here; the terminal is owned by the UI.
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Close the connection while the terminal is unfocused.
    #[arg(long)]
    close_when_unfocused: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if let Some(path) = &args.log_file {
        let file = File::create(path)
            .with_context(|| format!("failed to create log file {}", path.display()))?;
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .with_writer(Mutex::new(file))
            .with_ansi(false)
            .init();
    }

    let config = match &args.config {
        Some(path) => SessionConfig::load(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => SessionConfig::default(),
    };
    config.validate()?;

    let mut connector = WebSocketConnector::new().with_connect_timeout(config.connect_timeout());
    if let Some(token) = &args.token {
        connector = connector.with_credentials(Arc::new(StaticCredential(token.clone())));
    }

    let room = RoomContext::new(&args.base_url, &args.room);
    tracing::info!(url = %room.url(), "joining room");
    let (client, driver) = RoomClient::spawn(room, config, Arc::new(connector));
    client.set_handler(Box::new(StreamingTextHandler::new()))?;

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableFocusChange)?;
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout))?;

    let result = run_app(&mut terminal, &client, &args).await;

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), DisableFocusChange, LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    client.shutdown().await?;
    driver.await?;
    result
}

async fn run_app(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    client: &RoomClient,
    args: &Args,
) -> anyhow::Result<()> {
    let mut view = ChatView::new(format!("room {}", args.room));

    // Session events arrive on a stream; hand them to the UI loop.
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<SessionEvent>();
    let mut events = client.events();
    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            if event_tx.send(event).is_err() {
                break;
            }
        }
    });

    loop {
        while let Ok(event) = event_rx.try_recv() {
            view.apply(&event);
        }
        view.set_status(client.snapshot());

        terminal.draw(|frame| view.render(frame))?;

        if !event::poll(Duration::from_millis(50))? {
            continue;
        }
        let input = event::read()?;

        match input {
            Event::FocusLost if args.close_when_unfocused => {
                client.set_visibility(Visibility::Hidden)?;
            }
            Event::FocusGained if args.close_when_unfocused => {
                client.set_visibility(Visibility::Visible)?;
            }
            _ => {}
        }

        match view.handle_event(&input) {
            Some(UiCommand::Quit) => return Ok(()),
            Some(UiCommand::Reconnect) => client.reconnect(true)?,
            Some(UiCommand::Submit(text)) => {
                let payload = [("message".to_string(), text.clone())].into_iter().collect();
                match client.send("SendUserMessage", payload).await? {
                    SendOutcome::Sent => view.push_user(text),
                    outcome => tracing::info!(?outcome, "message not sent"),
                }
            }
            None => {}
        }
    }
}
