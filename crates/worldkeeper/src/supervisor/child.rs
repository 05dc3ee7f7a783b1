// Copyright (C) 2025 Wurstmineberg
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background tasks attached to a supervised child.
//!
//! Two tasks run for every child started by this process:
//!
//! - the relay task owns the child handle and its input stream, accepts
//!   connections on the relay socket and copies their lines to the child
//!   until a literal `stop` line arrives or the child exits;
//! - the drain task consumes the child's output to EOF so the child never
//!   blocks on a full pipe.

use std::path::Path;
use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::process::{Child, ChildStdin};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::LifecycleState;
use super::liveness::LivenessRecord;

/// Line that ends relaying and shuts the child down.
pub const STOP_LINE: &str = "stop";

/// Writer for the child's input stream that sends `stop` at most once.
pub struct ChildInput {
    stdin: Option<ChildStdin>,
    stop_sent: bool,
}

impl ChildInput {
    /// Input stream of a freshly spawned child.
    pub fn new(stdin: Option<ChildStdin>) -> Self {
        Self {
            stdin,
            stop_sent: false,
        }
    }

    /// Whether the stop line was already written.
    pub fn stop_sent(&self) -> bool {
        self.stop_sent
    }

    /// Write one line to the child.
    pub async fn forward(&mut self, line: &str) -> std::io::Result<()> {
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(std::io::Error::from(std::io::ErrorKind::BrokenPipe));
        };
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        if line.trim() == STOP_LINE {
            self.stop_sent = true;
        }
        Ok(())
    }

    /// Send `stop` unless it was already sent, then close the stream.
    pub async fn send_stop_once(&mut self) -> std::io::Result<()> {
        if !self.stop_sent {
            self.forward(STOP_LINE).await?;
        }
        self.stdin = None;
        Ok(())
    }
}

enum Relayed {
    Continue,
    StopRequested,
}

/// Handles of the tasks attached to one child.
pub struct ChildTasks {
    relay: JoinHandle<()>,
    drain: JoinHandle<()>,
}

impl ChildTasks {
    /// Wait until the child has exited and its output is drained.
    pub async fn join(self) {
        if let Err(e) = self.relay.await {
            warn!(error = %e, "Relay task failed");
        }
        if let Err(e) = self.drain.await {
            warn!(error = %e, "Output drain task failed");
        }
    }

    /// Whether both tasks have completed.
    pub fn is_finished(&self) -> bool {
        self.relay.is_finished() && self.drain.is_finished()
    }
}

/// Everything the relay task needs to own.
pub struct Attached<R> {
    /// Instance name.
    pub instance: String,
    /// Child process id.
    pub pid: u32,
    /// Child handle, reaped by the relay task.
    pub child: Child,
    /// Child input stream.
    pub input: ChildInput,
    /// Child output after the readiness line.
    pub output: R,
    /// Bound relay socket.
    pub listener: UnixListener,
    /// Inode of the bound socket file.
    pub socket_id: Option<u64>,
    /// Record released when the child exits.
    pub record: LivenessRecord,
    /// Lifecycle state of the owning supervisor.
    pub state: Arc<watch::Sender<LifecycleState>>,
}

/// Bind the relay socket, replacing a stale socket file.
pub async fn bind_relay(path: &Path) -> std::io::Result<UnixListener> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Removed stale relay socket"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    UnixListener::bind(path)
}

/// Spawn the relay and drain tasks for a freshly started child.
pub fn spawn<R>(attached: Attached<R>) -> ChildTasks
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    let Attached {
        instance,
        pid,
        child,
        input,
        mut output,
        listener,
        socket_id,
        record,
        state,
    } = attached;

    let drain_instance = instance.clone();
    let drain = tokio::spawn(async move {
        let mut sink = tokio::io::sink();
        match tokio::io::copy_buf(&mut output, &mut sink).await {
            Ok(bytes) => debug!(instance = %drain_instance, bytes = bytes, "Child output closed"),
            Err(e) => debug!(instance = %drain_instance, error = %e, "Child output failed"),
        }
    });

    let relay = tokio::spawn(relay_commands(RelayTask {
        instance,
        pid,
        child,
        input,
        listener,
        socket_id,
        record,
        state,
    }));

    ChildTasks { relay, drain }
}

struct RelayTask {
    instance: String,
    pid: u32,
    child: Child,
    input: ChildInput,
    listener: UnixListener,
    socket_id: Option<u64>,
    record: LivenessRecord,
    state: Arc<watch::Sender<LifecycleState>>,
}

async fn relay_commands(task: RelayTask) {
    let RelayTask {
        instance,
        pid,
        mut child,
        mut input,
        listener,
        socket_id,
        record,
        state,
    } = task;
    let mut exited = false;

    loop {
        tokio::select! {
            status = child.wait() => {
                match status {
                    Ok(status) => info!(instance = %instance, pid = pid, %status, "Server process exited"),
                    Err(e) => warn!(instance = %instance, pid = pid, error = %e, "Failed to wait for server process"),
                }
                exited = true;
                break;
            }
            accepted = listener.accept() => {
                let stream = match accepted {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        warn!(instance = %instance, error = %e, "Relay accept failed");
                        continue;
                    }
                };
                match relay_connection(stream, &mut input).await {
                    Ok(Relayed::Continue) => {}
                    Ok(Relayed::StopRequested) => {
                        debug!(instance = %instance, "Stop requested over relay");
                        break;
                    }
                    Err(e) => warn!(instance = %instance, error = %e, "Relay connection failed"),
                }
            }
        }
    }
    drop(listener);

    if !exited {
        if let Err(e) = input.send_stop_once().await {
            debug!(instance = %instance, error = %e, "Could not send stop to server process");
        }
        match child.wait().await {
            Ok(status) => info!(instance = %instance, pid = pid, %status, "Server process exited"),
            Err(e) => warn!(instance = %instance, pid = pid, error = %e, "Failed to wait for server process"),
        }
    }

    record.release(pid, socket_id).await;
    state.send_replace(LifecycleState::Stopped);
}

async fn relay_connection(
    stream: UnixStream,
    input: &mut ChildInput,
) -> std::io::Result<Relayed> {
    let mut lines = BufReader::new(stream).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim() == STOP_LINE {
            return Ok(Relayed::StopRequested);
        }
        input.forward(&line).await?;
    }
    Ok(Relayed::Continue)
}
