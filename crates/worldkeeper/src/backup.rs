// Copyright (C) 2025 Wurstmineberg
// SPDX-License-Identifier: AGPL-3.0-or-later
//! World backups.
//!
//! A backup suspends world saving, archives the world directory, optionally
//! mirrors it into `<backup dir>/latest`, resumes saving, and compresses the
//! archive. Saving is resumed on every path once it was suspended.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::process::Command;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::InstanceSettings;
use crate::error::{Error, Result};
use crate::progress::Progress;
use crate::supervisor::Supervisor;

/// Timestamp format used in archive names.
pub const ARCHIVE_TIME_FORMAT: &str = "%Y-%m-%d_%Hh%M";

/// Directory (below the backup dir) of archives taken before an update.
pub const PRE_UPDATE_DIR: &str = "pre-update";

/// Directory (below the backup dir) of archives taken before a revert.
pub const REVERTED_DIR: &str = "reverted";

/// Directory (below the backup dir) mirroring the newest world state.
pub const LATEST_DIR: &str = "latest";

/// World directory of an instance: `world` if present, else the instance name.
pub fn world_path(settings: &InstanceSettings) -> PathBuf {
    let default = settings.paths.dir.join("world");
    if default.exists() {
        default
    } else {
        settings.paths.dir.join(&settings.name)
    }
}

/// `<instance>_<timestamp>`
pub fn archive_stem(instance: &str, at: DateTime<Utc>) -> String {
    format!("{instance}_{}", at.format(ARCHIVE_TIME_FORMAT))
}

/// Components of a pre-update archive name,
/// `<instance>_<date>_<time>_<old version>_<new version>.tar.gz`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreUpdateArchive {
    /// `<date>_<time>` in [`ARCHIVE_TIME_FORMAT`].
    pub timestamp: String,
    /// Version installed when the archive was taken.
    pub old_version: String,
    /// Version the update moved to.
    pub new_version: String,
}

impl PreUpdateArchive {
    /// Archive file name for an update from `old` to `new`.
    pub fn file_name(instance: &str, at: DateTime<Utc>, old: &str, new: &str) -> String {
        format!("{}_{old}_{new}.tar.gz", archive_stem(instance, at))
    }

    /// Parse an archive file name. Version strings containing `_` are not
    /// representable.
    pub fn parse(instance: &str, file_name: &str) -> Option<Self> {
        let rest = file_name
            .strip_prefix(instance)?
            .strip_prefix('_')?
            .strip_suffix(".tar.gz")?;
        let parts: Vec<&str> = rest.split('_').collect();
        let [date, time, old, new] = parts.as_slice() else {
            return None;
        };
        if old.is_empty() || new.is_empty() {
            return None;
        }
        Some(Self {
            timestamp: format!("{date}_{time}"),
            old_version: old.to_string(),
            new_version: new.to_string(),
        })
    }
}

/// Options for one backup.
#[derive(Debug, Clone, Default)]
pub struct BackupOptions {
    /// Broadcast the save suspension to players.
    pub announce: bool,
    /// Archive path without extension. Defaults to
    /// `<backup dir>/<instance>_<timestamp>`.
    pub destination: Option<PathBuf>,
    /// Mirror into `latest`. Defaults to true for the main instance.
    pub mirror_latest: Option<bool>,
}

/// Backup engine of one instance.
#[derive(Clone)]
pub struct BackupEngine {
    settings: Arc<InstanceSettings>,
    supervisor: Arc<Supervisor>,
    progress: Progress,
}

impl BackupEngine {
    /// Engine backing up the world of `settings`.
    pub fn new(
        settings: Arc<InstanceSettings>,
        supervisor: Arc<Supervisor>,
        progress: Progress,
    ) -> Self {
        Self {
            settings,
            supervisor,
            progress,
        }
    }

    /// Take a backup and return the path of the compressed archive.
    pub async fn backup(&self, options: BackupOptions) -> Result<PathBuf> {
        let base = options.destination.unwrap_or_else(|| {
            self.settings
                .paths
                .backup_dir
                .join(archive_stem(&self.settings.name, Utc::now()))
        });
        let tar_path = with_suffix(&base, ".tar");
        let archive_path = with_suffix(&base, ".tar.gz");
        let mirror = options.mirror_latest.unwrap_or(self.settings.is_main);

        let guard = self.suspend_saves(options.announce).await?;
        let archived = self.archive_world(&tar_path, mirror).await;
        let resumed = guard.release().await;
        archived?;
        resumed?;

        self.progress.report("Compressing backup...");
        compress(&tar_path, &archive_path).await?;

        if self.settings.is_main {
            if let Some(link) = &self.settings.paths.backup_web {
                self.progress.report("Symlinking to httpdocs...");
                replace_symlink(&archive_path, link).await?;
            }
        }
        self.progress.report("Done.");
        Ok(archive_path)
    }

    /// Suspend world saving until the returned guard is released or dropped.
    ///
    /// The guard exists before `save-off` is sent, so saving is resumed even
    /// when a later step of the suspension fails.
    pub async fn suspend_saves(&self, announce: bool) -> Result<SaveGuard> {
        let guard = SaveGuard {
            supervisor: Some(self.supervisor.clone()),
            progress: self.progress.clone(),
            announce,
        };
        if let Err(e) = save_off(&self.supervisor, &self.progress, announce).await {
            if let Err(resume) = guard.release().await {
                warn!(error = %resume, "Failed to resume world saving");
            }
            return Err(e);
        }
        Ok(guard)
    }

    /// Suspend world saving without a guard.
    pub async fn save_off(&self, announce: bool) -> Result<()> {
        save_off(&self.supervisor, &self.progress, announce).await
    }

    /// Resume world saving.
    pub async fn save_on(&self, announce: bool) -> Result<()> {
        save_on(&self.supervisor, &self.progress, announce).await
    }

    async fn archive_world(&self, tar_path: &Path, mirror: bool) -> Result<()> {
        let world = world_path(&self.settings);
        let world_name = world
            .file_name()
            .map(OsString::from)
            .ok_or_else(|| Error::Other(format!("invalid world path {}", world.display())))?;
        if let Some(parent) = tar_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        self.progress.report("Backing up minecraft world...");
        let mut tar = Command::new("tar");
        tar.arg("-C")
            .arg(&self.settings.paths.dir)
            .arg("-cf")
            .arg(tar_path)
            .arg(&world_name);
        run_tool("tar", tar).await?;

        if mirror {
            self.progress.report("Backing up to latest...");
            let latest = self.settings.paths.backup_dir.join(LATEST_DIR);
            tokio::task::spawn_blocking(move || mirror_directory(&world, &latest))
                .await
                .map_err(|e| Error::Other(format!("mirror task failed: {e}")))??;
        }
        Ok(())
    }
}

/// Resumes world saving when released. Dropping an unreleased guard
/// resumes saving in the background.
pub struct SaveGuard {
    supervisor: Option<Arc<Supervisor>>,
    progress: Progress,
    announce: bool,
}

impl SaveGuard {
    /// Resume world saving now.
    pub async fn release(mut self) -> Result<()> {
        match self.supervisor.take() {
            Some(supervisor) => save_on(&supervisor, &self.progress, self.announce).await,
            None => Ok(()),
        }
    }
}

impl Drop for SaveGuard {
    fn drop(&mut self) {
        let Some(supervisor) = self.supervisor.take() else {
            return;
        };
        let progress = self.progress.clone();
        let announce = self.announce;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = save_on(&supervisor, &progress, announce).await {
                        warn!(error = %e, "Failed to resume world saving");
                    }
                });
            }
            Err(_) => warn!("World saving left suspended: no runtime to resume it"),
        }
    }
}

async fn save_off(supervisor: &Supervisor, progress: &Progress, announce: bool) -> Result<()> {
    if !supervisor.status().await {
        progress.report("Server is not running, no need to suspend saving.");
        return Ok(());
    }
    progress.report("Suspending saves...");
    if announce {
        supervisor
            .command(
                "say",
                &["Server backup starting. Server going readonly...".to_string()],
                false,
            )
            .await?;
    }
    supervisor.command("save-off", &[], false).await?;
    supervisor.command("save-all", &[], false).await?;
    tokio::time::sleep(supervisor.timings().save_flush).await;
    tokio::task::spawn_blocking(nix::unistd::sync)
        .await
        .map_err(|e| Error::Other(format!("sync task failed: {e}")))?;
    Ok(())
}

async fn save_on(supervisor: &Supervisor, progress: &Progress, announce: bool) -> Result<()> {
    if !supervisor.status().await {
        progress.report("Server is not running, no need to resume saving.");
        return Ok(());
    }
    progress.report("Re-enabling saves...");
    supervisor.command("save-on", &[], false).await?;
    if announce {
        supervisor
            .command(
                "say",
                &["Server backup ended. Server going readwrite...".to_string()],
                false,
            )
            .await?;
    }
    Ok(())
}

fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut name = base.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Run a helper program to completion.
pub(crate) async fn run_tool(program: &str, mut command: Command) -> Result<()> {
    debug!(program = program, "Running helper");
    let status = command
        .stdin(Stdio::null())
        .status()
        .await
        .map_err(|source| Error::Spawn {
            program: program.to_string(),
            source,
        })?;
    if !status.success() {
        return Err(Error::CommandFailed {
            program: program.to_string(),
            status,
        });
    }
    Ok(())
}

/// gzip `tar_path` into `archive_path` and remove the uncompressed file.
async fn compress(tar_path: &Path, archive_path: &Path) -> Result<()> {
    let partial = with_suffix(archive_path, ".part");
    let output = tokio::fs::File::create(&partial).await?.into_std().await;
    let mut gzip = Command::new("gzip");
    gzip.arg("-c").arg(tar_path).stdout(Stdio::from(output));
    if let Err(e) = run_tool("gzip", gzip).await {
        let _ = tokio::fs::remove_file(&partial).await;
        return Err(e);
    }
    tokio::fs::rename(&partial, archive_path).await?;
    tokio::fs::remove_file(tar_path).await?;
    Ok(())
}

/// Point `link` at `target`, replacing any existing link atomically.
pub async fn replace_symlink(target: &Path, link: &Path) -> Result<()> {
    let file_name = link
        .file_name()
        .ok_or_else(|| Error::Other(format!("invalid link path {}", link.display())))?;
    let mut temp_name = OsString::from(".");
    temp_name.push(file_name);
    temp_name.push(".new");
    let temp = link.with_file_name(temp_name);

    if let Some(parent) = link.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    match tokio::fs::remove_file(&temp).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    tokio::fs::symlink(target, &temp).await?;
    tokio::fs::rename(&temp, link).await?;
    Ok(())
}

/// Replace `dest` with a copy of `src`. Symlinks are recreated, not followed.
pub fn mirror_directory(src: &Path, dest: &Path) -> std::io::Result<()> {
    match std::fs::remove_dir_all(dest) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    for entry in WalkDir::new(src) {
        let entry = entry.map_err(std::io::Error::other)?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(std::io::Error::other)?;
        let target = dest.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            let pointee = std::fs::read_link(entry.path())?;
            std::os::unix::fs::symlink(pointee, &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
