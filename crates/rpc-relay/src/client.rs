//! Client side of the relay socket, shared by observers, inspectors and the
//! CLI.

use std::fs;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use tokio::io::AsyncWriteExt;
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::RelayError;
use crate::protocol::{encode_message, read_frame, FrameDecoder, Inbound, Message};

// ── Connection ──────────────────────────────────────────────────────

/// A long-lived channel to the relay. Inbound messages are decoded on a
/// background task; [`RelayConnection::recv`] returning `None` means the
/// channel is gone.
pub struct RelayConnection {
    writer: OwnedWriteHalf,
    inbound: mpsc::UnboundedReceiver<Message>,
    reader_task: JoinHandle<()>,
}

impl RelayConnection {
    /// Connect and introduce ourselves with `hello`.
    pub async fn connect(socket_path: &Path, hello: Message) -> Result<Self, RelayError> {
        let stream = UnixStream::connect(socket_path).await?;
        let (mut reader, mut writer) = stream.into_split();
        writer.write_all(&encode_message(&hello)?).await?;

        let (tx, inbound) = mpsc::unbounded_channel();
        let reader_task = tokio::spawn(async move {
            let mut decoder = FrameDecoder::new();
            loop {
                match read_frame(&mut reader, &mut decoder).await {
                    Ok(Inbound::Message(message)) => {
                        if tx.send(message).is_err() {
                            break;
                        }
                    }
                    Ok(Inbound::Malformed(err)) => {
                        debug!(error = %err, "ignoring malformed relay message");
                    }
                    Ok(Inbound::Closed) => break,
                    Err(err) => {
                        debug!(error = %err, "relay stream unreadable");
                        break;
                    }
                }
            }
        });

        Ok(Self {
            writer,
            inbound,
            reader_task,
        })
    }

    pub async fn send(&mut self, message: &Message) -> Result<(), RelayError> {
        let frame = encode_message(message)?;
        self.writer
            .write_all(&frame)
            .await
            .map_err(|_| RelayError::ChannelClosed)
    }

    pub async fn recv(&mut self) -> Option<Message> {
        self.inbound.recv().await
    }

    pub async fn close(mut self) {
        let _ = self.writer.shutdown().await;
        self.reader_task.abort();
    }
}

impl Drop for RelayConnection {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

// ── Host liveness ───────────────────────────────────────────────────

/// Asks whether the host runtime behind the relay still exists. A dead
/// host is not a transient failure: nothing will ever answer again.
pub trait HostProbe: Send {
    fn is_alive(&self) -> bool;
}

/// Reads the relay status file and checks that the recorded process is
/// still running.
pub struct PidFileProbe {
    meta_path: PathBuf,
}

impl PidFileProbe {
    pub fn new(meta_path: impl Into<PathBuf>) -> Self {
        Self {
            meta_path: meta_path.into(),
        }
    }
}

impl HostProbe for PidFileProbe {
    fn is_alive(&self) -> bool {
        let content = match fs::read_to_string(&self.meta_path) {
            Ok(content) => content,
            Err(_) => return false,
        };
        let meta: serde_json::Value = match serde_json::from_str(&content) {
            Ok(meta) => meta,
            Err(_) => return false,
        };
        if meta["status"] != "running" {
            return false;
        }
        match meta["pid"].as_u64() {
            Some(pid) => process_alive(pid as u32),
            None => false,
        }
    }
}

/// Signal 0 probe. EPERM still means the process exists.
pub fn process_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    matches!(kill(Pid::from_raw(pid as i32), None), Ok(()) | Err(Errno::EPERM))
}
