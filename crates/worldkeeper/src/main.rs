// Copyright (C) 2025 Wurstmineberg
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worldkeeper CLI
//!
//! Usage:
//!   worldkeeper [options] (start | stop | kill | restart | status | backup) [<world>...]
//!   worldkeeper [options] (update | revert) [<world>] [<version>] [--snapshot]
//!   worldkeeper [options] (saves-on | saves-off) [<world>...]
//!   worldkeeper [options] command <world> <command>...
//!   worldkeeper [options] whitelist [<world>...]
//!
//! `start` and `restart` stay attached to the servers they launch until
//! those exit, as do `update` and `revert` when they restart a running
//! world. SIGINT and SIGTERM stop them gracefully.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, anyhow, bail};
use clap::{Args, Parser, Subcommand};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};

use worldkeeper::backup::BackupOptions;
use worldkeeper::config::{CONFIG_PATH_ENV, Config};
use worldkeeper::update::{RevertRequest, RevertTarget, UpdateRequest};
use worldkeeper::{Instance, JsonRoster};

#[derive(Parser)]
#[command(
    name = "worldkeeper",
    about = "Supervise game server worlds: lifecycle, backups and version updates",
    version,
    propagate_version = true
)]
struct Cli {
    /// Path to the configuration document
    #[arg(long, global = true, env = CONFIG_PATH_ENV)]
    config: Option<PathBuf>,

    #[command(flatten)]
    selection: Selection,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Selection {
    /// Apply the action to all configured worlds
    #[arg(long, global = true, conflicts_with = "enabled")]
    all: bool,

    /// Apply the action to all enabled worlds (used by the service unit on boot)
    #[arg(long, global = true)]
    enabled: bool,

    /// Apply the action to the main world (the default)
    #[arg(long, global = true)]
    main: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start worlds and supervise them until they exit
    Start { worlds: Vec<String> },
    /// Stop worlds gracefully, killing them if needed
    Stop { worlds: Vec<String> },
    /// Terminate worlds by signal
    Kill { worlds: Vec<String> },
    /// Stop, then start and supervise
    Restart { worlds: Vec<String> },
    /// Print whether worlds are running; exits 1 if any is not
    Status { worlds: Vec<String> },
    /// Back up worlds
    Backup {
        worlds: Vec<String>,
        /// Announce the backup in game
        #[arg(long)]
        announce: bool,
    },
    /// Update a world to a new server version
    Update {
        world: Option<String>,
        /// Target version; the newest release (or snapshot) when omitted
        version: Option<String>,
        /// Target a snapshot; a single letter expands to this week's snapshot
        #[arg(long)]
        snapshot: bool,
        /// Don't back up the world before updating
        #[arg(long)]
        no_backup: bool,
        /// Download the server binary again even if cached
        #[arg(long)]
        refresh: bool,
    },
    /// Revert a world to the state before its last update
    Revert {
        world: Option<String>,
        /// Version to return to, or a pre-update archive path
        target: Option<String>,
        /// The version is a snapshot label
        #[arg(long)]
        snapshot: bool,
        /// Don't back up the world before reverting
        #[arg(long)]
        no_backup: bool,
    },
    /// Send a console command
    Command {
        world: String,
        /// Wait until the world is running
        #[arg(long)]
        block: bool,
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Re-enable world saving
    SavesOn {
        worlds: Vec<String>,
        #[arg(long)]
        announce: bool,
    },
    /// Suspend world saving
    SavesOff {
        worlds: Vec<String>,
        #[arg(long)]
        announce: bool,
    },
    /// Regenerate whitelists from the player roster
    Whitelist {
        worlds: Vec<String>,
        /// Roster document (defaults to paths.people)
        #[arg(long)]
        people: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "worldkeeper=info".into()),
        )
        .init();

    if let Err(e) = dotenvy::dotenv() {
        tracing::debug!("No .env file loaded: {}", e);
    }

    let cli = Cli::parse();
    let config_path = Config::resolve_path(cli.config.as_deref());
    let config = Config::load(&config_path)?;
    info!(config = %config_path.display(), "Configuration loaded");

    if let Some(user) = &config.run_user {
        check_run_user(user)?;
    }

    run(cli.command, &cli.selection, &config).await
}

fn check_run_user(expected: &str) -> anyhow::Result<()> {
    let user = nix::unistd::User::from_name(expected)
        .with_context(|| format!("Cannot look up user '{expected}'"))?
        .ok_or_else(|| anyhow!("User '{expected}' does not exist!"))?;
    if nix::unistd::geteuid() != user.uid {
        bail!("Only the user '{expected}' may use this program!");
    }
    Ok(())
}

/// Worlds named by the selection flags or explicit names; the main world
/// when nothing is given.
fn select(config: &Config, selection: &Selection, worlds: &[String]) -> Vec<String> {
    if selection.all {
        config.instance_names()
    } else if selection.enabled {
        config.enabled_instance_names()
    } else if !worlds.is_empty() && !selection.main {
        worlds.to_vec()
    } else {
        vec![config.main_world.clone()]
    }
}

fn open(config: &Config, names: &[String]) -> anyhow::Result<Vec<Instance>> {
    let sink: worldkeeper::ProgressSink = Arc::new(|line: &str| println!("{line}"));
    let http = reqwest::Client::builder()
        .user_agent(concat!("worldkeeper/", env!("CARGO_PKG_VERSION")))
        .build()?;
    names
        .iter()
        .map(|name| -> anyhow::Result<Instance> {
            let settings = config.instance(name)?;
            Ok(Instance::builder(settings)
                .progress_sink(sink.clone())
                .http_client(http.clone())
                .build()?)
        })
        .collect()
}

async fn run(
    command: Commands,
    selection: &Selection,
    config: &Config,
) -> anyhow::Result<ExitCode> {
    match command {
        Commands::Start { worlds } => {
            let instances = open(config, &select(config, selection, &worlds))?;
            let mut failed = false;
            let mut started = Vec::new();
            for instance in instances {
                if instance.start().await? {
                    started.push(instance);
                } else {
                    eprintln!("[FAIL] Error! Could not start the {} world.", instance.name());
                    failed = true;
                }
            }
            if started.is_empty() {
                return Ok(ExitCode::FAILURE);
            }
            println!("[ ok ] Minecraft is now running.");
            let clean = supervise(&started).await?;
            Ok(exit_code(clean && !failed))
        }
        Commands::Restart { worlds } => {
            let instances = open(config, &select(config, selection, &worlds))?;
            let mut failed = false;
            let mut started = Vec::new();
            for instance in instances {
                match instance.restart().await {
                    Ok(true) => started.push(instance),
                    Ok(false) => {
                        eprintln!("[FAIL] Error! Could not restart the {} world.", instance.name());
                        failed = true;
                    }
                    Err(e) => {
                        eprintln!("[FAIL] Error! Could not restart the {} world: {e}", instance.name());
                        failed = true;
                    }
                }
            }
            if started.is_empty() {
                return Ok(ExitCode::FAILURE);
            }
            println!("[ ok ] Minecraft is now running.");
            let clean = supervise(&started).await?;
            Ok(exit_code(clean && !failed))
        }
        Commands::Stop { worlds } => {
            for instance in open(config, &select(config, selection, &worlds))? {
                if !instance.stop().await? {
                    eprintln!("[FAIL] Error! Could not stop the {} world.", instance.name());
                    return Ok(ExitCode::FAILURE);
                }
            }
            println!("[ ok ] Minecraft is stopped.");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Kill { worlds } => {
            for instance in open(config, &select(config, selection, &worlds))? {
                if !instance.pid_status().await {
                    eprintln!(
                        "[WARN] Could not kill the \"{}\" world, PID file does not exist.",
                        instance.name()
                    );
                    return Ok(ExitCode::FAILURE);
                }
                if !instance.kill().await? {
                    return Ok(ExitCode::FAILURE);
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Status { worlds } => {
            let mut all_up = true;
            for instance in open(config, &select(config, selection, &worlds))? {
                let version = instance
                    .version()
                    .await
                    .map(|v| format!("(Minecraft {v}) "))
                    .unwrap_or_default();
                if instance.status().await {
                    let pid = instance.pid().await.map(|p| p.to_string()).unwrap_or_default();
                    println!(
                        "[info] The \"{}\" world {version}is running with PID {pid}.",
                        instance.name()
                    );
                    continue;
                }
                all_up = false;
                if instance.pid_status().await {
                    println!(
                        "[info] The \"{}\" world is running but the socket file does not exist. Please kill the world and restart.",
                        instance.name()
                    );
                } else {
                    println!("[info] The \"{}\" world {version}is not running.", instance.name());
                }
            }
            Ok(exit_code(all_up))
        }
        Commands::Backup { worlds, announce } => {
            for instance in open(config, &select(config, selection, &worlds))? {
                let archive = instance
                    .backup(BackupOptions {
                        announce,
                        ..BackupOptions::default()
                    })
                    .await?;
                info!(world = instance.name(), archive = %archive.display(), "Backup complete");
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Update {
            world,
            version,
            snapshot,
            no_backup,
            refresh,
        } => {
            let mut restarted = Vec::new();
            for instance in open(config, &select(config, selection, world.as_slice()))? {
                let info = instance
                    .update(UpdateRequest {
                        version: version.clone(),
                        preview: snapshot,
                        backup: !no_backup,
                        refresh_downloads: refresh,
                    })
                    .await?;
                println!("[ ok ] The {} world now runs {}.", instance.name(), info.label);
                if instance.is_attached().await {
                    restarted.push(instance);
                }
            }
            supervise_restarted(&restarted).await
        }
        Commands::Revert {
            world,
            target,
            snapshot,
            no_backup,
        } => {
            let target = match target {
                None => RevertTarget::Latest,
                Some(t) if t.ends_with(".tar.gz") => RevertTarget::Archive(PathBuf::from(t)),
                Some(t) => RevertTarget::Version(t),
            };
            let mut restarted = Vec::new();
            for instance in open(config, &select(config, selection, world.as_slice()))? {
                let info = instance
                    .revert(RevertRequest {
                        target: target.clone(),
                        preview: snapshot,
                        backup: !no_backup,
                    })
                    .await?;
                println!("[ ok ] The {} world now runs {}.", instance.name(), info.label);
                if instance.is_attached().await {
                    restarted.push(instance);
                }
            }
            supervise_restarted(&restarted).await
        }
        Commands::Command {
            world,
            block,
            command,
        } => {
            let names = select(config, selection, std::slice::from_ref(&world));
            let instances = open(config, &names)?;
            let Some((name, args)) = command.split_first() else {
                bail!("No command given");
            };
            for instance in &instances {
                if instances.len() > 1 {
                    println!("[info] running command on {} world", instance.name());
                }
                let reply = instance.command(name, args, block).await?;
                for line in reply.lines() {
                    println!("{line}");
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::SavesOn { worlds, announce } => {
            for instance in open(config, &select(config, selection, &worlds))? {
                instance.save_on(announce).await?;
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::SavesOff { worlds, announce } => {
            for instance in open(config, &select(config, selection, &worlds))? {
                instance.save_off(announce).await?;
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Whitelist { worlds, people } => {
            let path = people
                .or_else(|| config.paths.people.clone())
                .ok_or_else(|| anyhow!("No roster configured; pass --people or set paths.people"))?;
            let roster = JsonRoster::new(path);
            for instance in open(config, &select(config, selection, &worlds))? {
                instance.update_whitelist(&roster).await?;
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Stay attached to started worlds until they exit. A shutdown signal stops
/// them gracefully. Returns whether every stop succeeded.
async fn supervise(instances: &[Instance]) -> anyhow::Result<bool> {
    let mut terminate = signal(SignalKind::terminate())?;
    let waiting = futures::future::join_all(instances.iter().map(Instance::wait));
    tokio::pin!(waiting);

    tokio::select! {
        _ = &mut waiting => {
            info!("All supervised worlds exited");
            return Ok(true);
        }
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
        _ = terminate.recv() => info!("Termination requested"),
    }

    let mut clean = true;
    for instance in instances {
        match instance.stop().await {
            Ok(true) => {}
            Ok(false) => {
                warn!(world = instance.name(), "World did not stop");
                clean = false;
            }
            Err(e) => {
                error!(world = instance.name(), error = %e, "Failed to stop world");
                clean = false;
            }
        }
    }
    waiting.await;
    Ok(clean)
}

/// Stay attached to worlds an update or revert restarted. Their relay tasks
/// live in this process, so exiting would leave them without a socket
/// listener.
async fn supervise_restarted(restarted: &[Instance]) -> anyhow::Result<ExitCode> {
    if restarted.is_empty() {
        return Ok(ExitCode::SUCCESS);
    }
    println!("[ ok ] Minecraft is now running.");
    Ok(exit_code(supervise(restarted).await?))
}

fn exit_code(success: bool) -> ExitCode {
    if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
