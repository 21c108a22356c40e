//! Device-side control-plane server.
//!
//! A single TCP endpoint through which a management client runs shell
//! commands, transfers files and receives kernel log lines, over the
//! [`tether_proto`] wire protocol.
//!
//! The server is a single-threaded readiness reactor built on [`mio`]. All
//! client state lives on the reactor thread; command execution is handed to
//! a small worker pool and its results are delivered back through a
//! [`mio::Waker`].
//!
//! # Quick start
//!
//! ```no_run
//! use tether_agent::{Config, Server};
//!
//! let mut server = Server::builder(Config::default())
//!     .bind()
//!     .expect("failed to bind");
//! server.run().expect("reactor failed");
//! ```

pub mod bridge;
mod client;
mod config;
mod error;
pub mod framer;
mod handler;
pub mod logsource;
pub mod registry;
pub mod runner;
mod server;

pub use bridge::{Completion, SubmitError, WorkBridge};
pub use config::Config;
pub use error::{Error, Result};
pub use logsource::{KernelLog, LogSource, LogStream, NoLog};
pub use registry::{ClientId, Registry};
pub use runner::{CommandOutput, CommandRunner, ShellRunner, Status};
pub use server::{Server, ServerBuilder, ShutdownHandle};
