//! Environment-driven configuration shared by the relay and its clients.

use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_BUFFER_CAPACITY: usize = 100;
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 500;
pub const DEFAULT_META_INTERVAL_MS: u64 = 5_000;
pub const DEFAULT_HELLO_TIMEOUT_MS: u64 = 2_000;

const SOCKET_FILE: &str = "relay.sock";
const META_FILE: &str = "relay.json";

#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub data_dir: PathBuf,
    pub socket_path: PathBuf,
    pub meta_path: PathBuf,
    pub buffer_capacity: usize,
    pub retry_attempts: u32,
    pub retry_delay: Duration,
    pub meta_interval: Duration,
    pub hello_timeout: Duration,
}

impl RelayConfig {
    /// Everything lives under one directory: the socket and the status file.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            socket_path: data_dir.join(SOCKET_FILE),
            meta_path: data_dir.join(META_FILE),
            data_dir,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            meta_interval: Duration::from_millis(DEFAULT_META_INTERVAL_MS),
            hello_timeout: Duration::from_millis(DEFAULT_HELLO_TIMEOUT_MS),
        }
    }

    pub fn from_env() -> Self {
        let data_dir = match env::var("RPC_RELAY_HOME") {
            Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => {
                let home = env::var("HOME").unwrap_or_else(|_| "/".to_string());
                PathBuf::from(home).join(".rpc-relay")
            }
        };

        let mut config = Self::with_data_dir(data_dir);
        config.buffer_capacity = env_parse("RPC_RELAY_BUFFER_CAPACITY")
            .filter(|n: &usize| *n > 0)
            .unwrap_or(DEFAULT_BUFFER_CAPACITY);
        config.retry_attempts =
            env_parse("RPC_RELAY_RETRY_ATTEMPTS").unwrap_or(DEFAULT_RETRY_ATTEMPTS);
        config.retry_delay = Duration::from_millis(
            env_parse("RPC_RELAY_RETRY_DELAY_MS").unwrap_or(DEFAULT_RETRY_DELAY_MS),
        );
        config.meta_interval = Duration::from_millis(
            env_parse("RPC_RELAY_META_INTERVAL_MS")
                .filter(|ms: &u64| *ms > 0)
                .unwrap_or(DEFAULT_META_INTERVAL_MS),
        );
        config.hello_timeout = Duration::from_millis(
            env_parse("RPC_RELAY_HELLO_TIMEOUT_MS").unwrap_or(DEFAULT_HELLO_TIMEOUT_MS),
        );
        config
    }

    pub fn ensure_dirs(&self) -> io::Result<()> {
        fs::create_dir_all(&self.data_dir)
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
