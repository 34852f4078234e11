//! Reusable test harness for rpc-relay integration tests.
//!
//! Provides helpers for spawning the binary against a throwaway home
//! directory, connecting over the Unix socket, and sending/receiving
//! length-prefixed JSON frames.

use std::fs;
use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::{json, Value};

// ── Frame kinds (must match the binary) ─────────────────────────────

pub const FRAME_JSON: u8 = 0x00;
pub const FRAME_JSON_GZ: u8 = 0x01;

pub const SHIM_MESSAGE_TYPE: &str = "__GRPCWEB_DEVTOOLS__";

// ── Frame encoding/decoding ─────────────────────────────────────────

pub fn encode_frame(kind: u8, payload: &[u8]) -> Vec<u8> {
    let len = (payload.len() + 1) as u32;
    let mut frame = Vec::with_capacity(5 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.push(kind);
    frame.extend_from_slice(payload);
    frame
}

pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).expect("gzip write");
    encoder.finish().expect("gzip finish")
}

/// Decoded frame: kind byte plus the parsed JSON message.
pub struct Frame {
    pub kind: u8,
    pub message: Value,
}

// ── RelayProcess ────────────────────────────────────────────────────

/// Handle to a running `rpc-relay serve`. Kills it and removes its home
/// directory on drop.
pub struct RelayProcess {
    pub child: Child,
    pub home_dir: PathBuf,
    pub socket_path: PathBuf,
    pub meta_path: PathBuf,
}

impl Drop for RelayProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        let _ = fs::remove_dir_all(&self.home_dir);
    }
}

impl RelayProcess {
    /// Run another subcommand against the same home directory.
    pub fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(binary_path());
        cmd.args(args)
            .env("RPC_RELAY_HOME", &self.home_dir)
            .env("RPC_RELAY_LOG", "warn");
        cmd
    }

    /// Start `rpc-relay observe <tab>` with a piped stdin.
    pub fn spawn_observer(&self, tab: i64) -> io::Result<Child> {
        self.command(&["observe", &tab.to_string()])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .spawn()
    }

    pub fn read_meta(&self) -> io::Result<Value> {
        let content = fs::read_to_string(&self.meta_path)?;
        serde_json::from_str(&content).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Poll the status file until `pred` holds. Returns the last snapshot.
    pub fn wait_for_meta<F: Fn(&Value) -> bool>(&self, pred: F, timeout: Duration) -> Option<Value> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Ok(meta) = self.read_meta() {
                if pred(&meta) {
                    return Some(meta);
                }
            }
            if Instant::now() > deadline {
                return None;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    /// Wait until tab `tab` has the given inspector/observer presence.
    pub fn wait_for_session(&self, tab: i64, attached: bool, observers: u64) -> bool {
        self.wait_for_meta(
            |meta| {
                session(meta, tab)
                    .map(|s| s["attached"] == attached && s["observers"] == observers)
                    .unwrap_or(false)
            },
            Duration::from_secs(5),
        )
        .is_some()
    }

    pub fn wait_for_no_session(&self, tab: i64) -> bool {
        self.wait_for_meta(|meta| session(meta, tab).is_none(), Duration::from_secs(5))
            .is_some()
    }
}

/// The status-file entry for `tab`, if any.
pub fn session(meta: &Value, tab: i64) -> Option<&Value> {
    meta["sessions"]
        .as_array()?
        .iter()
        .find(|s| s["tabId"] == tab)
}

// ── SocketClient ────────────────────────────────────────────────────

/// Client wrapper for a connected Unix socket with frame-level read/write.
pub struct SocketClient {
    stream: UnixStream,
    read_buf: Vec<u8>,
}

impl SocketClient {
    pub fn new(stream: UnixStream) -> Self {
        stream.set_read_timeout(Some(Duration::from_secs(5))).ok();
        Self {
            stream,
            read_buf: Vec::new(),
        }
    }

    pub fn send_raw(&mut self, kind: u8, payload: &[u8]) -> io::Result<()> {
        self.stream.write_all(&encode_frame(kind, payload))
    }

    pub fn send(&mut self, message: &Value) -> io::Result<()> {
        self.send_raw(FRAME_JSON, message.to_string().as_bytes())
    }

    pub fn send_gz(&mut self, message: &Value) -> io::Result<()> {
        self.send_raw(FRAME_JSON_GZ, &gzip(message.to_string().as_bytes()))
    }

    pub fn hello(&mut self, role: &str, tab: Option<i64>) -> io::Result<()> {
        let mut hello = json!({"type": "hello", "role": role});
        if let Some(tab) = tab {
            hello["tabId"] = json!(tab);
        }
        self.send(&hello)
    }

    /// Read the next frame. Returns None on timeout or disconnect.
    pub fn recv_frame(&mut self, timeout: Duration) -> Option<Frame> {
        let deadline = Instant::now() + timeout;

        loop {
            if self.read_buf.len() >= 4 {
                let len = u32::from_be_bytes([
                    self.read_buf[0],
                    self.read_buf[1],
                    self.read_buf[2],
                    self.read_buf[3],
                ]) as usize;
                if self.read_buf.len() >= 4 + len {
                    let body: Vec<u8> = self.read_buf[4..4 + len].to_vec();
                    self.read_buf.drain(..4 + len);
                    if body.is_empty() {
                        continue;
                    }
                    let json = if body[0] == FRAME_JSON_GZ {
                        let mut decoder = GzDecoder::new(&body[1..]);
                        let mut out = Vec::new();
                        decoder.read_to_end(&mut out).ok()?;
                        out
                    } else {
                        body[1..].to_vec()
                    };
                    return Some(Frame {
                        kind: body[0],
                        message: serde_json::from_slice(&json).ok()?,
                    });
                }
            }

            if Instant::now() > deadline {
                return None;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            self.stream
                .set_read_timeout(Some(remaining.max(Duration::from_millis(50))))
                .ok();

            let mut buf = [0u8; 65536];
            match self.stream.read(&mut buf) {
                Ok(0) => return None, // disconnected
                Ok(n) => self.read_buf.extend_from_slice(&buf[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(ref e) if e.kind() == io::ErrorKind::TimedOut => continue,
                Err(_) => return None,
            }
        }
    }

    pub fn recv(&mut self) -> Option<Value> {
        self.recv_frame(Duration::from_secs(5)).map(|f| f.message)
    }

    /// Collect every message that arrives within `timeout`.
    pub fn collect(&mut self, timeout: Duration) -> Vec<Value> {
        let deadline = Instant::now() + timeout;
        let mut messages = Vec::new();
        while Instant::now() < deadline {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.recv_frame(remaining) {
                Some(frame) => messages.push(frame.message),
                None => break,
            }
        }
        messages
    }

    /// True once the server has closed the connection.
    pub fn is_closed_by_peer(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        self.stream
            .set_read_timeout(Some(Duration::from_millis(50)))
            .ok();
        let mut buf = [0u8; 1024];
        while Instant::now() < deadline {
            match self.stream.read(&mut buf) {
                Ok(0) => return true,
                Ok(_) => continue,
                Err(ref e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    continue
                }
                Err(_) => return true,
            }
        }
        false
    }
}

// ── Message builders ────────────────────────────────────────────────

pub fn init(tab: i64) -> Value {
    json!({"type": "init", "tabId": tab})
}

pub fn capture(method: &str, request: Value) -> Value {
    json!({
        "action": "captureEvent",
        "target": "panel",
        "data": {"method": method, "methodType": "unary", "request": request, "response": {}}
    })
}

pub fn shim_line(method: &str, request: Value) -> String {
    json!({
        "type": SHIM_MESSAGE_TYPE,
        "method": method,
        "methodType": "unary",
        "request": request,
        "response": {"ok": true}
    })
    .to_string()
}

// ── Spawn helpers ───────────────────────────────────────────────────

fn binary_path() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_rpc-relay"))
}

/// Spawn `rpc-relay serve` in a fresh temp home. Returns once the socket
/// is accepting.
pub fn spawn_relay() -> io::Result<RelayProcess> {
    spawn_relay_with_env(&[])
}

pub fn spawn_relay_with_env(env_vars: &[(&str, &str)]) -> io::Result<RelayProcess> {
    #[allow(deprecated)]
    let home_dir = tempfile::tempdir()?.into_path();
    let socket_path = home_dir.join("relay.sock");
    let meta_path = home_dir.join("relay.json");

    let mut cmd = Command::new(binary_path());
    cmd.arg("serve")
        .env("RPC_RELAY_HOME", &home_dir)
        .env("RPC_RELAY_META_INTERVAL_MS", "25")
        .env("RPC_RELAY_LOG", "warn");
    for (k, v) in env_vars {
        cmd.env(k, v);
    }
    let child = cmd.spawn()?;

    // Wait for socket to appear
    let deadline = Instant::now() + Duration::from_secs(5);
    while !socket_path.exists() {
        if Instant::now() > deadline {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "Socket did not appear within 5 seconds",
            ));
        }
        std::thread::sleep(Duration::from_millis(20));
    }

    // Brief delay to let the listener start accepting
    std::thread::sleep(Duration::from_millis(50));

    Ok(RelayProcess {
        child,
        home_dir,
        socket_path,
        meta_path,
    })
}

pub fn connect(socket_path: &Path) -> io::Result<SocketClient> {
    let stream = UnixStream::connect(socket_path)?;
    Ok(SocketClient::new(stream))
}

/// Connect and say hello in one step.
pub fn connect_as(socket_path: &Path, role: &str, tab: Option<i64>) -> io::Result<SocketClient> {
    let mut client = connect(socket_path)?;
    client.hello(role, tab)?;
    Ok(client)
}
