//! Hands commands to a worker pool and delivers results to the reactor.
//!
//! Jobs enter a bounded queue with a non-blocking `try_send`. A dispatcher
//! task takes a worker permit before pulling the next job, so waiting jobs
//! keep counting against the queue bound while every worker is busy. Each
//! job runs on the runtime's blocking pool; its result is posted to a
//! completion channel and the reactor is woken through a [`mio::Waker`].

use std::io;
use std::sync::Arc;
use std::sync::mpsc as std_mpsc;

use mio::Waker;
use tokio::runtime::Runtime;
use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, warn};

use crate::handler::JobQueue;
use crate::registry::ClientId;
use crate::runner::{CommandOutput, CommandRunner, Status};

/// Why a command was not queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum SubmitError {
    /// Every queue slot is taken.
    #[error("Command queue full.")]
    Full,
    /// The worker runtime has shut down.
    #[error("Command executor unavailable.")]
    Stopped,
}

/// A queued command.
#[derive(Debug)]
struct Job {
    /// Requesting client.
    client: ClientId,
    /// Command line.
    command: String,
}

/// A finished command, ready to be sent to its client.
#[derive(Debug)]
pub struct Completion {
    /// Requesting client; may have disconnected since.
    pub client: ClientId,
    /// Command line.
    pub command: String,
    /// Captured output and status.
    pub output: CommandOutput,
}

/// Bounded job queue in front of a blocking worker pool.
#[derive(Debug)]
pub struct WorkBridge {
    /// Job queue sender.
    jobs: mpsc::Sender<Job>,
    /// Completion queue, drained by the reactor.
    done: std_mpsc::Receiver<Completion>,
    /// Worker runtime, `None` once shut down.
    runtime: Option<Runtime>,
}

impl WorkBridge {
    /// Starts `workers` workers behind a queue of `capacity` jobs. `waker`
    /// is signalled after every completion.
    pub fn start(
        runner: Arc<dyn CommandRunner>,
        waker: Arc<Waker>,
        workers: usize,
        capacity: usize,
    ) -> io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(workers.max(1))
            .thread_name("tether-exec")
            .build()?;
        let (jobs, queue) = mpsc::channel(capacity.max(1));
        let (finished, done) = std_mpsc::channel();
        runtime.spawn(dispatch(queue, runner, finished, waker, workers.max(1)));
        Ok(Self {
            jobs,
            done,
            runtime: Some(runtime),
        })
    }

    /// Queues `command` without blocking.
    pub fn submit(&self, client: ClientId, command: String) -> Result<(), SubmitError> {
        self.jobs
            .try_send(Job { client, command })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => SubmitError::Full,
                mpsc::error::TrySendError::Closed(_) => SubmitError::Stopped,
            })
    }

    /// Completions posted since the last call.
    pub fn completions(&self) -> impl Iterator<Item = Completion> + '_ {
        self.done.try_iter()
    }
}

impl JobQueue for WorkBridge {
    fn submit(&self, client: ClientId, command: String) -> Result<(), SubmitError> {
        Self::submit(self, client, command)
    }
}

impl Drop for WorkBridge {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

/// Pulls jobs one worker permit at a time.
async fn dispatch(
    mut queue: mpsc::Receiver<Job>,
    runner: Arc<dyn CommandRunner>,
    finished: std_mpsc::Sender<Completion>,
    waker: Arc<Waker>,
    workers: usize,
) {
    let permits = Arc::new(Semaphore::new(workers));
    loop {
        let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
            break;
        };
        let Some(Job { client, command }) = queue.recv().await else {
            break;
        };

        let runner = Arc::clone(&runner);
        let finished = finished.clone();
        let waker = Arc::clone(&waker);
        tokio::spawn(async move {
            let line = command.clone();
            let output = tokio::task::spawn_blocking(move || runner.run(&line))
                .await
                .unwrap_or_else(|e| {
                    warn!(client = %client, error = %e, "command runner crashed");
                    CommandOutput::status(Status::Crashed)
                });
            drop(permit);
            debug!(client = %client, command = %command, status = ?output.status, "command finished");

            if finished
                .send(Completion {
                    client,
                    command,
                    output,
                })
                .is_ok()
                && let Err(e) = waker.wake()
            {
                warn!(error = %e, "failed to wake reactor");
            }
        });
    }
}
