//! Unix socket front end for the relay.
//!
//! Each accepted connection opens with a hello frame naming its role. The
//! connection task translates frames into [`RelayCommand`]s; a writer task
//! drains the connection's [`Port`] queue back onto the socket.

use std::fs;
use std::future::Future;
use std::path::Path;
use std::process;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::net::unix::OwnedReadHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time;
use tracing::{debug, info, warn};

use crate::client::process_alive;
use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::protocol::{
    encode_message, read_frame, ActionMessage, FrameDecoder, Inbound, Message, Role, TabId,
    Target, TypedMessage,
};
use crate::relay::{now_millis, ChannelId, Port, Relay, RelayCommand, RelayHandle, RelayStatus};

pub const STATUS_RUNNING: &str = "running";
pub const STATUS_EXITED: &str = "exited";

// ── Status file ─────────────────────────────────────────────────────

/// Contents of `relay.json`, rewritten whenever the session table changes.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RelayMeta {
    pub pid: u32,
    pub socket_path: String,
    pub started_at: u64,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exited_at: Option<u64>,
    #[serde(flatten)]
    pub relay: RelayStatus,
}

impl RelayMeta {
    fn running(config: &RelayConfig) -> Self {
        Self {
            pid: process::id(),
            socket_path: config.socket_path.display().to_string(),
            started_at: now_millis(),
            status: STATUS_RUNNING.to_string(),
            exited_at: None,
            relay: RelayStatus::default(),
        }
    }
}

/// Atomic JSON write: write to temp file then rename.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), RelayError> {
    let tmp_path = path.with_extension("json.tmp");
    let json = serde_json::to_string_pretty(value)?;
    fs::write(&tmp_path, &json)?;
    if fs::rename(&tmp_path, path).is_err() {
        // Fallback: direct write
        fs::write(path, &json)?;
    }
    Ok(())
}

pub fn read_meta(path: &Path) -> Result<RelayMeta, RelayError> {
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

// ── Server ──────────────────────────────────────────────────────────

pub struct RelayServer {
    config: RelayConfig,
    listener: UnixListener,
    relay: RelayHandle,
    relay_task: JoinHandle<Relay>,
    meta: RelayMeta,
}

impl RelayServer {
    /// Claim the socket and publish the status file. Refuses to start when
    /// another live relay owns the same home directory.
    pub async fn bind(config: RelayConfig) -> Result<Self, RelayError> {
        config.ensure_dirs()?;

        if let Ok(existing) = read_meta(&config.meta_path) {
            if existing.status == STATUS_RUNNING
                && existing.pid != process::id()
                && process_alive(existing.pid)
            {
                return Err(RelayError::AlreadyRunning(existing.pid));
            }
        }

        // Clean up stale socket from previous crash
        let _ = fs::remove_file(&config.socket_path);
        let listener = UnixListener::bind(&config.socket_path)?;

        let (relay, relay_task) = RelayHandle::spawn();
        let meta = RelayMeta::running(&config);
        atomic_write_json(&config.meta_path, &meta)?;
        info!(socket = %config.socket_path.display(), pid = meta.pid, "relay listening");

        Ok(Self {
            config,
            listener,
            relay,
            relay_task,
            meta,
        })
    }

    pub fn handle(&self) -> RelayHandle {
        self.relay.clone()
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Accept connections until `shutdown` resolves, then drop every
    /// connection, mark the status file exited and remove the socket.
    pub async fn run<F: Future<Output = ()>>(mut self, shutdown: F) -> Result<(), RelayError> {
        tokio::pin!(shutdown);
        let mut meta_timer = time::interval(self.config.meta_interval);
        let hello_timeout = self.config.hello_timeout;
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        connections.spawn(handle_connection(stream, self.relay.clone(), hello_timeout));
                    }
                    Err(err) => warn!(error = %err, "accept failed"),
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = meta_timer.tick() => self.refresh_meta().await,
            }
        }

        self.refresh_meta().await;
        connections.shutdown().await;
        self.meta.status = STATUS_EXITED.to_string();
        self.meta.exited_at = Some(now_millis());
        atomic_write_json(&self.config.meta_path, &self.meta)?;
        let _ = fs::remove_file(&self.config.socket_path);
        self.relay_task.abort();
        info!("relay stopped");
        Ok(())
    }

    async fn refresh_meta(&mut self) {
        let status = match self.relay.status().await {
            Ok(status) => status,
            Err(err) => {
                warn!(error = %err, "relay task unavailable");
                return;
            }
        };
        if status == self.meta.relay {
            return;
        }
        self.meta.relay = status;
        if let Err(err) = atomic_write_json(&self.config.meta_path, &self.meta) {
            warn!(error = %err, "failed to write status file");
        }
    }
}

// ── Connection handling ─────────────────────────────────────────────

async fn handle_connection(stream: UnixStream, relay: RelayHandle, hello_timeout: Duration) {
    let (mut reader, mut writer) = stream.into_split();
    let mut decoder = FrameDecoder::new();

    let hello = time::timeout(hello_timeout, read_frame(&mut reader, &mut decoder)).await;
    let (role, tab) = match hello {
        Ok(Ok(Inbound::Message(Message::Typed(TypedMessage::Hello { role, tab_id })))) => {
            (role, tab_id)
        }
        Ok(Ok(Inbound::Message(other))) => {
            debug!(message = ?other, "connection did not open with hello");
            return;
        }
        Ok(Ok(Inbound::Malformed(err))) | Ok(Err(err)) => {
            debug!(error = %err, "unreadable hello");
            return;
        }
        Ok(Ok(Inbound::Closed)) => return,
        Err(_) => {
            debug!("hello timed out");
            return;
        }
    };

    let (port, mut outbound) = relay.open_port();
    let channel = port.id();
    let writer_task = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let frame = match encode_message(&message) {
                Ok(frame) => frame,
                Err(err) => {
                    warn!(error = %err, "dropping unencodable message");
                    continue;
                }
            };
            if writer.write_all(&frame).await.is_err() {
                break;
            }
        }
    });

    debug!(channel = %channel, role = ?role, "connection opened");
    match (role, tab) {
        (Role::Inspector, _) => inspector_loop(&mut reader, &mut decoder, &relay, port).await,
        (Role::Observer, Some(tab)) => {
            observer_loop(&mut reader, &mut decoder, &relay, tab, port).await
        }
        (Role::Observer, None) => debug!(channel = %channel, "observer hello without tab id"),
        (Role::Host, _) => host_loop(&mut reader, &mut decoder, &relay).await,
    }
    debug!(channel = %channel, "connection closed");
    writer_task.abort();
}

async fn inspector_loop(
    reader: &mut OwnedReadHalf,
    decoder: &mut FrameDecoder,
    relay: &RelayHandle,
    port: Port,
) {
    let channel = port.id();
    loop {
        let command = match read_frame(reader, decoder).await {
            Ok(Inbound::Message(Message::Typed(TypedMessage::Init { tab_id }))) => {
                RelayCommand::Attach {
                    tab: tab_id,
                    port: port.clone(),
                }
            }
            Ok(Inbound::Message(Message::Action(ActionMessage::PanelClosed { tab_id }))) => {
                RelayCommand::DetachExplicit {
                    tab: tab_id,
                    channel,
                }
            }
            Ok(Inbound::Message(other)) => {
                debug!(channel = %channel, message = ?other, "ignoring inspector message");
                continue;
            }
            Ok(Inbound::Malformed(err)) => {
                debug!(channel = %channel, error = %err, "ignoring malformed inspector message");
                continue;
            }
            Ok(Inbound::Closed) | Err(_) => break,
        };
        if relay.send(command).is_err() {
            return;
        }
    }
    let _ = relay.send(RelayCommand::ChannelClosed { channel });
}

async fn observer_loop(
    reader: &mut OwnedReadHalf,
    decoder: &mut FrameDecoder,
    relay: &RelayHandle,
    tab: TabId,
    port: Port,
) {
    let channel: ChannelId = port.id();
    if relay.send(RelayCommand::RegisterObserver { tab, port }).is_err() {
        return;
    }
    loop {
        match read_frame(reader, decoder).await {
            Ok(Inbound::Message(Message::Action(ActionMessage::CaptureEvent {
                target: Target::Panel,
                data,
            }))) => {
                if relay.send(RelayCommand::Route { tab, event: data }).is_err() {
                    return;
                }
            }
            Ok(Inbound::Message(other)) => {
                debug!(tab_id = %tab, channel = %channel, message = ?other, "ignoring observer message");
            }
            Ok(Inbound::Malformed(err)) => {
                debug!(tab_id = %tab, channel = %channel, error = %err, "ignoring malformed observer message");
            }
            Ok(Inbound::Closed) | Err(_) => break,
        }
    }
    let _ = relay.send(RelayCommand::ObserverClosed { tab, channel });
}

async fn host_loop(reader: &mut OwnedReadHalf, decoder: &mut FrameDecoder, relay: &RelayHandle) {
    loop {
        match read_frame(reader, decoder).await {
            Ok(Inbound::Message(Message::Typed(TypedMessage::TabRemoved { tab_id }))) => {
                if relay.send(RelayCommand::TabClosed { tab: tab_id }).is_err() {
                    return;
                }
            }
            Ok(Inbound::Message(other)) => {
                debug!(message = ?other, "ignoring host message");
            }
            Ok(Inbound::Malformed(err)) => {
                debug!(error = %err, "ignoring malformed host message");
            }
            Ok(Inbound::Closed) | Err(_) => break,
        }
    }
}
