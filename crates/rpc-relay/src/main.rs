//! Command-line front end for the relay.
//!
//! Usage:
//!   rpc-relay serve
//!   rpc-relay inspect [tabId]
//!   rpc-relay observe <tabId>
//!   rpc-relay close-tab <tabId>
//!   rpc-relay status

use std::env;
use std::io::Write;
use std::process;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use rpc_relay::client::{process_alive, RelayConnection};
use rpc_relay::inspector::{CaptureSwitch, InspectorSession, PanelInput};
use rpc_relay::observer::{ObserverEndpoint, PageLifecycle, PageMessage, PageSignal};
use rpc_relay::protocol::{Message, Role, TabId};
use rpc_relay::server::{read_meta, RelayServer, STATUS_RUNNING};
use rpc_relay::{RelayConfig, RelayError};

const USAGE: &str = "Usage: rpc-relay <serve | inspect [tabId] | observe <tabId> | close-tab <tabId> | status>";

fn init_logging() {
    let filter = env::var("RPC_RELAY_LOG")
        .ok()
        .and_then(|v| EnvFilter::try_new(v).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn usage() -> ! {
    eprintln!("{USAGE}");
    process::exit(1);
}

fn tab_arg(args: &[String]) -> Option<TabId> {
    args.get(2).and_then(|raw| raw.parse().ok())
}

#[tokio::main]
async fn main() {
    init_logging();
    let args: Vec<String> = env::args().collect();
    let config = RelayConfig::from_env();

    let result = match args.get(1).map(String::as_str) {
        Some("serve") => serve(config).await,
        Some("inspect") => inspect(config, tab_arg(&args)).await,
        Some("observe") => match tab_arg(&args) {
            Some(tab) => observe(config, tab).await,
            None => usage(),
        },
        Some("close-tab") => match tab_arg(&args) {
            Some(tab) => close_tab(config, tab).await,
            None => usage(),
        },
        Some("status") => status(config),
        _ => usage(),
    };

    if let Err(err) = result {
        eprintln!("rpc-relay: {err}");
        process::exit(1);
    }
}

// ── serve ───────────────────────────────────────────────────────────

async fn serve(config: RelayConfig) -> Result<(), RelayError> {
    // Ignore SIGHUP -- we're detached
    unsafe {
        libc::signal(libc::SIGHUP, libc::SIG_IGN);
    }

    let mut sigterm = signal(SignalKind::terminate())?;
    let server = RelayServer::bind(config).await?;
    let shutdown = async move {
        tokio::select! {
            _ = sigterm.recv() => info!("SIGTERM received"),
            _ = tokio::signal::ctrl_c() => info!("interrupt received"),
        }
    };
    server.run(shutdown).await
}

// ── inspect ─────────────────────────────────────────────────────────

/// Panel commands, one per stdin line.
fn parse_panel_input(line: &str) -> Option<PanelInput> {
    let line = line.trim();
    let (command, rest) = match line.split_once(' ') {
        Some((command, rest)) => (command, rest.trim()),
        None => (line, ""),
    };
    let input = match command {
        "q" | "query" => PanelInput::Query(rest.to_string()),
        "n" | "next" => PanelInput::Next,
        "p" | "prev" => PanelInput::Prev,
        "s" | "select" => PanelInput::Select(rest.parse().ok()?),
        "capture" => match rest {
            "on" => PanelInput::SetCapture(true),
            "off" => PanelInput::SetCapture(false),
            _ => return None,
        },
        "clear" => PanelInput::Clear,
        "show" => PanelInput::Visibility(true),
        "hide" => PanelInput::Visibility(false),
        "close" => PanelInput::Close,
        _ => return None,
    };
    Some(input)
}

async fn inspect(config: RelayConfig, tab: Option<TabId>) -> Result<(), RelayError> {
    let session = InspectorSession::new(tab, &config, CaptureSwitch::default());
    let (tx, rx) = mpsc::channel(64);

    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            match parse_panel_input(&line) {
                Some(input) => {
                    if tx.send(input).await.is_err() {
                        break;
                    }
                }
                None if line.trim().is_empty() => {}
                None => warn!(line = %line, "unknown panel command"),
            }
        }
    });

    let session = session
        .run(rx, |view| {
            let mut stdout = std::io::stdout().lock();
            let _ = writeln!(stdout, "{}", view.render_text());
            let _ = stdout.flush();
        })
        .await;
    info!(state = session.state().as_str(), "inspector finished");
    Ok(())
}

// ── observe ─────────────────────────────────────────────────────────

fn parse_page_signal(line: &str) -> Result<PageSignal, RelayError> {
    let signal = match line.trim() {
        "!visible" => PageSignal::Lifecycle(PageLifecycle::Visible),
        "!hidden" => PageSignal::Lifecycle(PageLifecycle::Hidden),
        "!restored" => PageSignal::Lifecycle(PageLifecycle::RestoredFromCache),
        json => PageSignal::Message(PageMessage::same_page(serde_json::from_str::<
            serde_json::Value,
        >(json)?)),
    };
    Ok(signal)
}

async fn observe(config: RelayConfig, tab: TabId) -> Result<(), RelayError> {
    let endpoint = ObserverEndpoint::new(tab, &config);
    let (tx, rx) = mpsc::channel(256);
    let runner = tokio::spawn(endpoint.run(rx));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match parse_page_signal(&line) {
            Ok(signal) => {
                if tx.send(signal).await.is_err() {
                    break;
                }
            }
            Err(err) => warn!(error = %err, "ignoring unreadable page message"),
        }
    }
    drop(tx);

    let endpoint = runner
        .await
        .map_err(|err| RelayError::Handshake(err.to_string()))?;
    info!(
        tab_id = %tab,
        forwarded = endpoint.forwarded(),
        skipped = endpoint.skipped(),
        "observer finished"
    );
    Ok(())
}

// ── close-tab / status ──────────────────────────────────────────────

async fn close_tab(config: RelayConfig, tab: TabId) -> Result<(), RelayError> {
    let mut conn = RelayConnection::connect(&config.socket_path, Message::hello(Role::Host, None)).await?;
    conn.send(&Message::tab_removed(tab)).await?;
    conn.close().await;
    info!(tab_id = %tab, "tab removal sent");
    Ok(())
}

fn status(config: RelayConfig) -> Result<(), RelayError> {
    let meta = read_meta(&config.meta_path)?;
    println!("{}", serde_json::to_string_pretty(&meta)?);
    if meta.status != STATUS_RUNNING || !process_alive(meta.pid) {
        process::exit(3);
    }
    Ok(())
}
