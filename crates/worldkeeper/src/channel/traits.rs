// Copyright (C) 2025 Wurstmineberg
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Command channel trait definitions.
//!
//! Defines the abstract interface for delivering console commands to a
//! running server instance.

use async_trait::async_trait;
use thiserror::Error;

/// Errors from command channel operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ChannelError {
    /// The instance is not running and the caller did not ask to wait.
    #[error("Instance is not running")]
    NotRunning,

    /// The transport endpoint refused or does not exist.
    #[error("Command channel unreachable: {0}")]
    Unreachable(String),

    /// RCON is selected but no password is configured.
    #[error("No RCON password configured")]
    MissingCredential,

    /// The server rejected the RCON password.
    #[error("RCON authentication rejected")]
    AuthRejected,

    /// The peer sent something that is not a valid reply.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// I/O operation failed mid-conversation.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ChannelError {
    /// Classify a connect-time I/O error.
    pub fn from_connect(error: std::io::Error) -> Self {
        match error.kind() {
            std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::NotFound
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::TimedOut => ChannelError::Unreachable(error.to_string()),
            _ => ChannelError::Io(error),
        }
    }
}

/// Transport carrying console commands to the server.
#[async_trait]
pub trait CommandChannel: Send + Sync {
    /// Short transport name for logs.
    fn transport(&self) -> &'static str;

    /// Verify that the transport has everything it needs to talk to the
    /// server. Shutdown escalates to a kill when this fails.
    fn check_credentials(&self) -> Result<(), ChannelError> {
        Ok(())
    }

    /// Send a command line and return the reply text, which may be empty.
    async fn send(&self, command: &str, args: &[String]) -> Result<String, ChannelError>;

    /// Whether the transport endpoint currently accepts connections.
    async fn is_reachable(&self) -> bool;
}

/// Join a command and its arguments into one console line.
pub fn format_command(command: &str, args: &[String]) -> String {
    if args.is_empty() {
        command.to_string()
    } else {
        format!("{} {}", command, args.join(" "))
    }
}
