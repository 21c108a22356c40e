//! Host-side client for the tether device agent.
//!
//! [`Client`] speaks the [`tether_proto`] wire protocol over a blocking TCP
//! connection: handshake, keep-alive pings, command execution, windowed
//! file transfer in both directions, and forwarded device log lines.
//!
//! # Quick start
//!
//! ```no_run
//! use tether::Client;
//!
//! let mut client = Client::connect("192.168.0.7:28000").expect("connect");
//! let output = client.execute("uptime").expect("execute");
//! print!("{}", String::from_utf8_lossy(&output));
//!
//! let mut config = Vec::new();
//! client.get_file("/etc/hostname", &mut config).expect("download");
//! ```

mod client;
mod error;

pub use client::Client;
pub use error::{Error, Result};
pub use tether_proto::{ConnectRsp, DEFAULT_PORT};
