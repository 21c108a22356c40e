//! Server configuration.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tether_proto::{DEFAULT_PORT, HEADER_SIZE, MAX_PAYLOAD};

use crate::registry::MAX_CLIENTS;
use crate::{Error, Result};

/// Tunables of a [`Server`](crate::Server).
///
/// Every field has a default, so a configuration file only needs to name
/// the values it changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listen address in `host:port` form.
    pub listen: String,
    /// Number of simultaneously connected clients.
    pub max_clients: usize,
    /// Largest accepted message, header included.
    pub max_message_size: usize,
    /// A client that does not ping within this many milliseconds is dropped.
    pub keep_alive_timeout_ms: u64,
    /// Ping interval advertised in the handshake, in seconds.
    pub ping_interval_secs: u32,
    /// Default number of unacknowledged download chunks.
    pub get_file_window: u32,
    /// Largest download window a client may request.
    pub get_file_window_max: u32,
    /// Download chunk size in bytes.
    pub get_file_chunk_size: usize,
    /// Upload window advertised to clients.
    pub put_file_window: u32,
    /// Command output fragment size in bytes.
    pub output_chunk_size: usize,
    /// Commands executed concurrently.
    pub workers: usize,
    /// Commands that may wait for a worker before submissions are refused.
    pub job_queue_capacity: usize,
    /// Kernel log device forwarded to every client, `None` to disable.
    pub kernel_log: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: format!("0.0.0.0:{DEFAULT_PORT}"),
            max_clients: 2,
            max_message_size: 512,
            keep_alive_timeout_ms: 3000,
            ping_interval_secs: 2,
            get_file_window: 100,
            get_file_window_max: 256,
            get_file_chunk_size: 512 - 64,
            put_file_window: 100,
            output_chunk_size: 96,
            workers: 2,
            job_queue_capacity: 32,
            kernel_log: Some(PathBuf::from("/dev/kmsg")),
        }
    }
}

impl Config {
    /// Loads a configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Checks that every value is usable.
    pub fn validate(&self) -> Result<()> {
        if self.max_clients == 0 || self.max_clients > MAX_CLIENTS {
            return Err(Error::Config(format!(
                "max_clients must be between 1 and {MAX_CLIENTS}"
            )));
        }
        if self.max_message_size <= HEADER_SIZE || self.max_message_size > HEADER_SIZE + MAX_PAYLOAD
        {
            return Err(Error::Config(format!(
                "max_message_size must be between {} and {}",
                HEADER_SIZE + 1,
                HEADER_SIZE + MAX_PAYLOAD
            )));
        }
        if self.keep_alive_timeout_ms == 0 {
            return Err(Error::Config("keep_alive_timeout_ms must be positive".into()));
        }
        if self.get_file_chunk_size == 0 || self.output_chunk_size == 0 {
            return Err(Error::Config("chunk sizes must be positive".into()));
        }
        if self.get_file_window == 0 || self.get_file_window > self.get_file_window_max {
            return Err(Error::Config(
                "get_file_window must be between 1 and get_file_window_max".into(),
            ));
        }
        if self.workers == 0 || self.job_queue_capacity == 0 {
            return Err(Error::Config(
                "workers and job_queue_capacity must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Keep-alive timeout as a [`Duration`].
    pub const fn keep_alive_timeout(&self) -> Duration {
        Duration::from_millis(self.keep_alive_timeout_ms)
    }
}
