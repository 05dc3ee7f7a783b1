// Copyright (C) 2025 Wurstmineberg
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for worldkeeper.

use std::path::PathBuf;
use std::process::ExitStatus;

use thiserror::Error;

/// Worldkeeper errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading or lookup failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The command channel failed.
    #[error("Command channel error: {0}")]
    Channel(#[from] crate::channel::ChannelError),

    /// HTTP request (manifest or download) failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Sending a signal to the child process failed.
    #[error("Signal error: {0}")]
    Signal(#[from] nix::errno::Errno),

    /// A log pattern failed to compile.
    #[error("Pattern error: {0}")]
    Pattern(#[from] regex::Error),

    /// A child or helper process could not be spawned.
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A helper command (tar, gzip, ...) exited unsuccessfully.
    #[error("{program} exited with {status}")]
    CommandFailed {
        /// Program that failed.
        program: String,
        /// Exit status it reported.
        status: ExitStatus,
    },

    /// The instance could not be brought down before a destructive step.
    #[error("Instance {0} could not be stopped")]
    StopFailed(String),

    /// The operation is not available for externally managed (custom) servers.
    #[error("{0} is not implemented for instances with custom servers")]
    UnimplementedOperation(&'static str),

    /// No pre-update archive qualifies for a revert.
    #[error("No pre-update backup found in {}", .0.display())]
    NoBackupFound(PathBuf),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type using worldkeeper Error.
pub type Result<T> = std::result::Result<T, Error>;
