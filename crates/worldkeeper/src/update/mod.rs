// Copyright (C) 2025 Wurstmineberg
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Version updates and reverts.
//!
//! # Update
//!
//! 1. Resolve the target version against the manifest.
//! 2. Download the server binary (and the client asset for the main
//!    instance) while a pre-update backup runs concurrently.
//! 3. Announce, stop, repoint the active binary link, restart if the
//!    instance was running before.
//!
//! # Revert
//!
//! Locate the newest matching pre-update archive before touching anything,
//! then download the older binary, stop, keep the current world under
//! `reverted/`, swap the link, replace the world directory with the archive
//! contents and restart.

pub mod download;
pub mod manifest;

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use chrono::Utc;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::backup::{
    self, BackupEngine, BackupOptions, PRE_UPDATE_DIR, PreUpdateArchive, REVERTED_DIR, world_path,
};
use crate::config::InstanceSettings;
use crate::error::{Error, Result};
use crate::progress::Progress;
use crate::supervisor::{SHUTDOWN_NOTICE, Supervisor, installed_version};

pub use manifest::{
    ManifestClient, ManifestEntry, VersionDetails, VersionInfo, VersionManifest,
    expand_preview_label, resolve_version,
};

/// Fallback location of server binaries missing from the manifest.
const SERVER_FALLBACK_URL: &str =
    "https://s3.amazonaws.com/Minecraft.Download/versions/{version}/minecraft_server.{version}.jar";

/// Fallback location of client assets missing from the manifest.
const CLIENT_FALLBACK_URL: &str =
    "https://s3.amazonaws.com/Minecraft.Download/versions/{version}/{version}.jar";

/// Parameters of an update.
#[derive(Debug, Clone)]
pub struct UpdateRequest {
    /// Explicit target; the newest release (or preview) when absent.
    pub version: Option<String>,
    /// Target a preview build.
    pub preview: bool,
    /// Take a pre-update backup concurrently with the download.
    pub backup: bool,
    /// Discard cached downloads of the target version.
    pub refresh_downloads: bool,
}

impl Default for UpdateRequest {
    fn default() -> Self {
        Self {
            version: None,
            preview: false,
            backup: true,
            refresh_downloads: false,
        }
    }
}

/// Archive selection for a revert.
#[derive(Debug, Clone)]
pub enum RevertTarget {
    /// The newest pre-update archive.
    Latest,
    /// The newest pre-update archive taken while this version was installed.
    Version(String),
    /// A specific archive file.
    Archive(PathBuf),
}

/// Parameters of a revert.
#[derive(Debug, Clone)]
pub struct RevertRequest {
    /// Archive to restore.
    pub target: RevertTarget,
    /// The version target is a preview label.
    pub preview: bool,
    /// Keep the replaced world under `reverted/`.
    pub backup: bool,
}

impl Default for RevertRequest {
    fn default() -> Self {
        Self {
            target: RevertTarget::Latest,
            preview: false,
            backup: true,
        }
    }
}

/// Resolved download locations of a target version.
#[derive(Debug, Clone)]
struct Prepared {
    info: VersionInfo,
    server_url: String,
    client_url: Option<String>,
}

/// Update and revert workflows of one instance.
#[derive(Clone)]
pub struct Updater {
    settings: Arc<InstanceSettings>,
    supervisor: Arc<Supervisor>,
    backups: BackupEngine,
    manifest: ManifestClient,
    http: reqwest::Client,
    progress: Progress,
}

impl Updater {
    /// Updater for one instance.
    pub fn new(
        settings: Arc<InstanceSettings>,
        supervisor: Arc<Supervisor>,
        backups: BackupEngine,
        http: reqwest::Client,
        progress: Progress,
    ) -> Self {
        let manifest = ManifestClient::new(http.clone(), settings.manifest_url.clone());
        Self {
            settings,
            supervisor,
            backups,
            manifest,
            http,
            progress,
        }
    }

    /// Cached server binary of `version`.
    pub fn cached_binary(&self, version: &str) -> PathBuf {
        self.settings
            .paths
            .jar_cache
            .join(format!("{}.{version}.jar", self.settings.binary_stem()))
    }

    /// Cached client asset of `version`, if a client cache is configured.
    pub fn cached_client(&self, version: &str) -> Option<PathBuf> {
        self.settings
            .paths
            .client_versions
            .as_ref()
            .map(|dir| dir.join(version).join(format!("{version}.jar")))
    }

    async fn prepare(&self, version: Option<&str>, preview: bool) -> Result<Prepared> {
        let manifest = self.manifest.manifest().await?;
        let info = resolve_version(&manifest, version, preview, Utc::now());

        let details = match manifest.entry(&info.version) {
            Some(entry) => self.manifest.details(entry).await?,
            None => {
                self.progress.warn(format!(
                    "{} is not listed in the version manifest",
                    info.label
                ));
                VersionDetails::default()
            }
        };

        let server_url = details
            .downloads
            .server
            .map(|location| location.url)
            .unwrap_or_else(|| SERVER_FALLBACK_URL.replace("{version}", &info.version));
        let client_url = self.settings.is_main.then(|| {
            details
                .downloads
                .client
                .map(|location| location.url)
                .unwrap_or_else(|| CLIENT_FALLBACK_URL.replace("{version}", &info.version))
        });

        Ok(Prepared {
            info,
            server_url,
            client_url,
        })
    }

    async fn download(&self, prepared: &Prepared, refresh: bool) -> Result<()> {
        let version = &prepared.info.version;
        download::ensure_cached(
            &self.http,
            &prepared.server_url,
            &self.cached_binary(version),
            refresh,
        )
        .await?;

        if let (Some(url), Some(dest)) = (&prepared.client_url, self.cached_client(version)) {
            if let Err(e) = download::ensure_cached(&self.http, url, &dest, refresh).await {
                self.progress.warn(format!(
                    "Could not download the client of {}: {e}",
                    prepared.info.label
                ));
            }
        }
        Ok(())
    }

    /// Move the instance to another version.
    pub async fn update(&self, request: UpdateRequest) -> Result<VersionInfo> {
        if self.settings.custom_server {
            return Err(Error::UnimplementedOperation("update"));
        }
        let prepared = self
            .prepare(request.version.as_deref(), request.preview)
            .await?;
        let info = prepared.info.clone();
        let old_version = installed_version(&self.settings)
            .await
            .unwrap_or_else(|| "unknown".to_string());

        self.progress.report(format!("Downloading {}", info.label));
        let downloading = async {
            let outcome = self.download(&prepared, request.refresh_downloads).await;
            if outcome.is_ok() && request.backup {
                self.progress
                    .report("Download finished. Waiting for backup to finish...");
            }
            outcome
        };
        let backing_up = async {
            if !request.backup {
                return Ok(None);
            }
            let name = PreUpdateArchive::file_name(
                &self.settings.name,
                Utc::now(),
                &old_version,
                &info.version,
            );
            let destination = self
                .settings
                .paths
                .backup_dir
                .join(PRE_UPDATE_DIR)
                .join(name.trim_end_matches(".tar.gz"));
            self.backups
                .backup(BackupOptions {
                    announce: true,
                    destination: Some(destination),
                    mirror_latest: None,
                })
                .await
                .map(Some)
        };
        let (downloaded, backed_up) = tokio::join!(downloading, backing_up);
        downloaded?;
        if let Some(archive) = backed_up? {
            debug!(archive = %archive.display(), "Pre-update backup written");
        }

        let was_running = self.stop_for_swap(&info, "upgraded").await?;
        self.progress.report("Server stopped. Installing new server...");
        self.activate(&info).await?;

        if was_running {
            self.supervisor.start("Server updated. Restarting...").await?;
        }
        self.progress.report(format!("Updated to {}", info.label));
        Ok(info)
    }

    /// Restore the world and binary captured by a pre-update archive.
    pub async fn revert(&self, request: RevertRequest) -> Result<VersionInfo> {
        if self.settings.custom_server {
            return Err(Error::UnimplementedOperation("revert"));
        }
        let (archive, version) = self
            .locate_pre_update(&request.target, request.preview)
            .await?;
        self.progress.report(format!(
            "Reverting to {} using {}",
            version,
            archive.display()
        ));

        let prepared = self.prepare(Some(&version), false).await?;
        let info = prepared.info.clone();
        self.progress.report(format!("Downloading {}", info.label));
        self.download(&prepared, false).await?;
        let current_version = installed_version(&self.settings)
            .await
            .unwrap_or_else(|| "unknown".to_string());

        let was_running = self.stop_for_swap(&info, "reverted").await?;
        if request.backup {
            let name = PreUpdateArchive::file_name(
                &self.settings.name,
                Utc::now(),
                &current_version,
                &info.version,
            );
            let destination = self
                .settings
                .paths
                .backup_dir
                .join(REVERTED_DIR)
                .join(name.trim_end_matches(".tar.gz"));
            self.backups
                .backup(BackupOptions {
                    announce: false,
                    destination: Some(destination),
                    mirror_latest: Some(false),
                })
                .await?;
        }
        self.progress.report("Server stopped. Restoring backup...");
        self.activate(&info).await?;
        self.restore(&archive).await?;

        if was_running {
            self.supervisor.start("Server reverted. Restarting...").await?;
        }
        self.progress.report(format!("Reverted to {}", info.label));
        Ok(info)
    }

    /// Find the archive and the version to return to. Fails with
    /// [`Error::NoBackupFound`] when nothing qualifies.
    pub async fn locate_pre_update(
        &self,
        target: &RevertTarget,
        preview: bool,
    ) -> Result<(PathBuf, String)> {
        let dir = self.settings.paths.backup_dir.join(PRE_UPDATE_DIR);
        let name = &self.settings.name;

        if let RevertTarget::Archive(path) = target {
            let parsed = path
                .file_name()
                .and_then(|f| f.to_str())
                .and_then(|f| PreUpdateArchive::parse(name, f));
            return match parsed {
                Some(parsed) if path.exists() => Ok((path.clone(), parsed.old_version)),
                _ => Err(Error::NoBackupFound(dir)),
            };
        }

        let wanted = match target {
            RevertTarget::Version(version) if preview => {
                Some(expand_preview_label(version, Utc::now()))
            }
            RevertTarget::Version(version) => Some(version.clone()),
            _ => None,
        };

        let mut candidates = Vec::new();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NoBackupFound(dir));
            }
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let Some(parsed) = file_name.to_str().and_then(|f| PreUpdateArchive::parse(name, f))
            else {
                continue;
            };
            if wanted.as_ref().is_some_and(|v| *v != parsed.old_version) {
                continue;
            }
            let modified = entry
                .metadata()
                .await?
                .modified()
                .unwrap_or(SystemTime::UNIX_EPOCH);
            candidates.push((modified, entry.path(), parsed.old_version));
        }

        candidates
            .into_iter()
            .max_by_key(|(modified, _, _)| *modified)
            .map(|(_, path, version)| (path, version))
            .ok_or(Error::NoBackupFound(dir))
    }

    async fn stop_for_swap(&self, info: &VersionInfo, verb: &str) -> Result<bool> {
        if !self.supervisor.status().await {
            return Ok(false);
        }
        let announcement = format!(
            "Server will be {verb} to {} and therefore restart",
            info.label
        );
        if let Err(e) = self.supervisor.command("say", &[announcement], false).await {
            warn!(instance = %self.settings.name, error = %e, "Update announcement failed");
        }
        tokio::time::sleep(self.supervisor.timings().announce_delay).await;

        if !self.supervisor.stop(Some(SHUTDOWN_NOTICE)).await? {
            return Err(Error::StopFailed(self.settings.name.clone()));
        }
        Ok(true)
    }

    /// Point the active binary link at `info`'s cached binary. The client
    /// link and texture refresh are best-effort.
    async fn activate(&self, info: &VersionInfo) -> Result<()> {
        let binary = self.cached_binary(&info.version);
        backup::replace_symlink(&binary, &self.settings.paths.service_link).await?;

        if !self.settings.is_main {
            return Ok(());
        }
        if let (Some(client), Some(link)) = (
            self.cached_client(&info.version),
            self.settings.paths.client_link.as_ref(),
        ) {
            if let Err(e) = backup::replace_symlink(&client, link).await {
                self.progress.warn(format!("Could not update the client link: {e}"));
            }
        }
        if let Some(refresh) = &self.settings.texture_refresh {
            let Some(client) = self.cached_client(&info.version) else {
                self.progress
                    .warn("Texture refresh skipped: no client cache configured");
                return Ok(());
            };
            self.progress.report("Refreshing textures...");
            let mut command = Command::new(&refresh.program);
            command.arg(client).arg(&refresh.output_dir);
            if let Err(e) = backup::run_tool("texture refresh", command).await {
                self.progress.warn(format!("Texture refresh failed: {e}"));
            }
        }
        Ok(())
    }

    /// Replace the world directory with the archive's copy.
    async fn restore(&self, archive: &Path) -> Result<()> {
        let world = world_path(&self.settings);
        let world_name = world
            .file_name()
            .map(OsString::from)
            .ok_or_else(|| Error::Other(format!("invalid world path {}", world.display())))?;

        match tokio::fs::remove_dir_all(&world).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let mut tar = Command::new("tar");
        tar.arg("-C")
            .arg(&self.settings.paths.dir)
            .arg("-xzf")
            .arg(archive)
            .arg(&world_name);
        backup::run_tool("tar", tar).await
    }
}
