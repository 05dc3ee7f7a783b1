// Copyright (C) 2025 Wurstmineberg
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worldkeeper - Game Server Supervision
//!
//! This crate supervises long-running game server processes ("instances").
//! It launches them, tracks their liveness across invocations, delivers
//! console commands, takes consistent world backups, and moves instances
//! between server versions.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                    Callers (worldkeeper CLI, services)               │
//! └─────────────────────────────────────────────────────────────────────┘
//!                                   │
//!                                   ▼
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                              Instance                                │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐               │
//! │  │  Supervisor  │  │    Backup    │  │   Updater    │               │
//! │  │              │◄─│    Engine    │◄─│              │               │
//! │  └──────────────┘  └──────────────┘  └──────────────┘               │
//! │         │                                    │                       │
//! │         ▼                                    ▼                       │
//! │  ┌──────────────┐                   ┌──────────────────┐             │
//! │  │   Command    │                   │ Version manifest │             │
//! │  │   Channel    │                   │   + downloads    │             │
//! │  └──────────────┘                   └──────────────────┘             │
//! └─────────────────────────────────────────────────────────────────────┘
//!          │ relay socket / RCON                   ▲
//!          ▼                                       │ HTTP
//! ┌─────────────────────┐                ┌────────────────────┐
//! │   Server process    │                │  Manifest service  │
//! └─────────────────────┘                └────────────────────┘
//! ```
//!
//! # Operations
//!
//! | Operation | Description |
//! |-----------|-------------|
//! | `start` | Launch, wait for the readiness line, attach relay and drain tasks |
//! | `stop` | Announce, `save-all`, `stop`, poll; escalate to `kill` on failure |
//! | `kill` | SIGTERM, poll, SIGKILL; always clean up pidfile and socket |
//! | `restart` | `stop` then `start` |
//! | `status` | Live pid AND relay socket present |
//! | `backup` | Suspend saves, archive, mirror `latest`, resume, compress |
//! | `update` | Download + pre-update backup concurrently, swap binary, restart |
//! | `revert` | Restore the newest matching pre-update archive |
//!
//! # Configuration
//!
//! | Source | Description | Default |
//! |--------|-------------|---------|
//! | `--config` | Configuration document | - |
//! | `WORLDKEEPER_CONFIG` | Configuration document | `/opt/wurstmineberg/config/systemd-minecraft.json` |
//! | `RUST_LOG` | Log filter | `worldkeeper=info` |

#![deny(missing_docs)]

/// World backups and save suspension.
pub mod backup;
/// Console command transports.
pub mod channel;
/// Typed configuration.
pub mod config;
/// Error types.
pub mod error;
/// Instance handle.
pub mod instance;
/// Progress reporting.
pub mod progress;
/// Process supervision.
pub mod supervisor;
/// Version updates and reverts.
pub mod update;
/// Whitelist regeneration.
pub mod whitelist;

pub use backup::{BackupEngine, BackupOptions};
pub use channel::{ChannelError, CommandChannel, RconChannel, RelayChannel};
pub use config::{ChannelKind, Config, ConfigError, InstanceSettings};
pub use error::{Error, Result};
pub use instance::{Instance, InstanceBuilder};
pub use progress::{Progress, ProgressSink};
pub use supervisor::{LifecycleState, Supervisor, Timings};
pub use update::{RevertRequest, RevertTarget, UpdateRequest, VersionInfo};
pub use whitelist::{JsonRoster, RosterSource};
