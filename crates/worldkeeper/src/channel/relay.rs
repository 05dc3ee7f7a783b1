// Copyright (C) 2025 Wurstmineberg
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Relay socket transport.
//!
//! The supervisor listens on a per-instance Unix socket and copies every
//! received line to the child's input stream. Replies are not sent back over
//! the socket; they are recovered by reading the server log lines appended
//! after the command was written, so the reply is best-effort.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tracing::debug;

use super::traits::{ChannelError, CommandChannel, format_command};

/// Command channel writing to the supervisor's relay socket.
#[derive(Debug, Clone)]
pub struct RelayChannel {
    socket_path: PathBuf,
    log_path: PathBuf,
    reply_delay: Duration,
}

impl RelayChannel {
    /// Channel writing to `socket_path` and reading replies from `log_path`
    /// after `reply_delay`.
    pub fn new(socket_path: PathBuf, log_path: PathBuf, reply_delay: Duration) -> Self {
        Self {
            socket_path,
            log_path,
            reply_delay,
        }
    }

    async fn log_lines(&self) -> Option<Vec<String>> {
        match tokio::fs::read(&self.log_path).await {
            Ok(bytes) => Some(
                String::from_utf8_lossy(&bytes)
                    .lines()
                    .map(str::to_string)
                    .collect(),
            ),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Some(Vec::new()),
            Err(e) => {
                debug!(path = %self.log_path.display(), error = %e, "Cannot read server log");
                None
            }
        }
    }
}

#[async_trait]
impl CommandChannel for RelayChannel {
    fn transport(&self) -> &'static str {
        "relay"
    }

    async fn send(&self, command: &str, args: &[String]) -> Result<String, ChannelError> {
        let offset = self.log_lines().await.map(|lines| lines.len());

        let mut stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(ChannelError::from_connect)?;
        let line = format_command(command, args);
        stream.write_all(format!("{line}\n").as_bytes()).await?;
        stream.shutdown().await?;
        drop(stream);

        let Some(offset) = offset else {
            return Ok(String::new());
        };
        tokio::time::sleep(self.reply_delay).await;

        let reply = match self.log_lines().await {
            Some(lines) => lines.into_iter().skip(offset).collect::<Vec<_>>().join("\n"),
            None => String::new(),
        };
        Ok(reply)
    }

    async fn is_reachable(&self) -> bool {
        tokio::fs::try_exists(&self.socket_path)
            .await
            .unwrap_or(false)
    }
}
