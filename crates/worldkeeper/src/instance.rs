// Copyright (C) 2025 Wurstmineberg
// SPDX-License-Identifier: AGPL-3.0-or-later
//! A managed server instance.
//!
//! [`Instance`] ties the supervisor, command channel, backup engine and
//! updater of one configured world together. Lifecycle operations on the
//! same instance are serialized; backups are not, since they coexist with a
//! running server.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::backup::{self, BackupEngine, BackupOptions};
use crate::channel::{self, ChannelError, CommandChannel};
use crate::config::{Config, InstanceSettings};
use crate::error::{Error, Result};
use crate::progress::{Progress, ProgressSink};
use crate::supervisor::{LifecycleState, SHUTDOWN_NOTICE, Supervisor, Timings};
use crate::update::{RevertRequest, UpdateRequest, Updater, VersionInfo};
use crate::whitelist::{self, RosterSource};

/// Builder for [`Instance`].
pub struct InstanceBuilder {
    settings: InstanceSettings,
    timings: Timings,
    sink: Option<ProgressSink>,
    channel: Option<Arc<dyn CommandChannel>>,
    http: Option<reqwest::Client>,
}

impl InstanceBuilder {
    /// Override lifecycle delays and poll counts.
    pub fn timings(mut self, timings: Timings) -> Self {
        self.timings = timings;
        self
    }

    /// Deliver progress lines to `sink` in addition to the log.
    pub fn progress_sink(mut self, sink: ProgressSink) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Use a custom command channel instead of the configured one.
    pub fn channel(mut self, channel: Arc<dyn CommandChannel>) -> Self {
        self.channel = Some(channel);
        self
    }

    /// Share an HTTP client across instances.
    pub fn http_client(mut self, http: reqwest::Client) -> Self {
        self.http = Some(http);
        self
    }

    /// Assemble the instance.
    pub fn build(self) -> Result<Instance> {
        let settings = Arc::new(self.settings);
        let mut progress = Progress::new(&settings.name);
        if let Some(sink) = self.sink {
            progress = progress.with_sink(sink);
        }
        let channel = self
            .channel
            .unwrap_or_else(|| channel::for_instance(&settings, self.timings.relay_reply_delay));
        let http = match self.http {
            Some(http) => http,
            None => reqwest::Client::builder()
                .user_agent(concat!("worldkeeper/", env!("CARGO_PKG_VERSION")))
                .build()?,
        };

        let supervisor = Arc::new(Supervisor::new(
            settings.clone(),
            channel,
            self.timings,
            progress.clone(),
        ));
        let backups = BackupEngine::new(settings.clone(), supervisor.clone(), progress.clone());
        let updater = Updater::new(
            settings.clone(),
            supervisor.clone(),
            backups.clone(),
            http,
            progress.clone(),
        );

        Ok(Instance {
            settings,
            supervisor,
            backups,
            updater,
            progress,
            lifecycle: Mutex::new(()),
        })
    }
}

/// One managed server instance.
pub struct Instance {
    settings: Arc<InstanceSettings>,
    supervisor: Arc<Supervisor>,
    backups: BackupEngine,
    updater: Updater,
    progress: Progress,
    lifecycle: Mutex<()>,
}

impl Instance {
    /// Builder over resolved `settings`.
    pub fn builder(settings: InstanceSettings) -> InstanceBuilder {
        InstanceBuilder {
            settings,
            timings: Timings::default(),
            sink: None,
            channel: None,
            http: None,
        }
    }

    /// Instance `name` of `config` with default timings.
    pub fn from_config(config: &Config, name: &str) -> Result<Self> {
        Self::builder(config.instance(name)?).build()
    }

    /// Instance name.
    pub fn name(&self) -> &str {
        &self.settings.name
    }

    /// Resolved settings.
    pub fn settings(&self) -> &InstanceSettings {
        &self.settings
    }

    /// Whether this is the main world.
    pub fn is_main(&self) -> bool {
        self.settings.is_main
    }

    /// Process supervisor of this instance.
    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    /// Last lifecycle state observed by this process.
    pub fn state(&self) -> LifecycleState {
        self.supervisor.state()
    }

    /// Whether the instance is running (live process AND relay socket).
    pub async fn status(&self) -> bool {
        self.supervisor.status().await
    }

    /// Whether the recorded process is alive.
    pub async fn pid_status(&self) -> bool {
        self.supervisor.pid_status().await
    }

    /// Recorded process id, if any.
    pub async fn pid(&self) -> Option<u32> {
        self.supervisor.pid().await
    }

    /// Installed server version, if known.
    pub async fn version(&self) -> Option<String> {
        self.supervisor.version().await
    }

    /// World directory backed up and restored.
    pub fn world_path(&self) -> PathBuf {
        backup::world_path(&self.settings)
    }

    /// Send a console command; see [`Supervisor::command`].
    pub async fn command(
        &self,
        command: &str,
        args: &[String],
        block: bool,
    ) -> std::result::Result<String, ChannelError> {
        self.supervisor.command(command, args, block).await
    }

    /// Broadcast a chat message.
    pub async fn say(&self, message: &str) -> std::result::Result<String, ChannelError> {
        self.command("say", &[message.to_string()], false).await
    }

    /// Send a raw JSON chat message to `target` (everyone by default). A
    /// plain string is wrapped as `{"text": ...}`.
    pub async fn tellraw(
        &self,
        message: &serde_json::Value,
        target: Option<&str>,
    ) -> std::result::Result<String, ChannelError> {
        let payload = match message {
            serde_json::Value::String(text) => serde_json::json!({ "text": text }),
            other => other.clone(),
        };
        let args = [target.unwrap_or("@a").to_string(), payload.to_string()];
        self.command("tellraw", &args, false).await
    }

    /// Launch the server unless it is already running.
    pub async fn start(&self) -> Result<bool> {
        let _lifecycle = self.lifecycle.lock().await;
        self.supervisor.start("Starting Minecraft server...").await
    }

    /// Stop gracefully with the shutdown notice, killing if needed.
    pub async fn stop(&self) -> Result<bool> {
        let _lifecycle = self.lifecycle.lock().await;
        self.supervisor.stop(Some(SHUTDOWN_NOTICE)).await
    }

    /// Terminate by signal.
    pub async fn kill(&self) -> Result<bool> {
        let _lifecycle = self.lifecycle.lock().await;
        self.supervisor.kill().await
    }

    /// Stop, then start. A failed stop leaves the instance down.
    pub async fn restart(&self) -> Result<bool> {
        let _lifecycle = self.lifecycle.lock().await;
        self.progress.report("Restarting Minecraft server...");
        if !self.supervisor.stop(Some(SHUTDOWN_NOTICE)).await? {
            return Err(Error::StopFailed(self.settings.name.clone()));
        }
        self.supervisor
            .start("Server stopped. Restarting...")
            .await
    }

    /// Whether this process launched a child of this instance that is still
    /// running.
    pub async fn is_attached(&self) -> bool {
        self.supervisor.is_attached().await
    }

    /// Wait until every child started through this instance has exited.
    pub async fn wait(&self) {
        self.supervisor.wait().await;
    }

    /// Take a backup and return the archive path.
    pub async fn backup(&self, options: BackupOptions) -> Result<PathBuf> {
        self.backups.backup(options).await
    }

    /// Suspend world saving.
    pub async fn save_off(&self, announce: bool) -> Result<()> {
        self.backups.save_off(announce).await
    }

    /// Resume world saving.
    pub async fn save_on(&self, announce: bool) -> Result<()> {
        self.backups.save_on(announce).await
    }

    /// Move to another server version.
    pub async fn update(&self, request: UpdateRequest) -> Result<VersionInfo> {
        let _lifecycle = self.lifecycle.lock().await;
        self.updater.update(request).await
    }

    /// Return to the state before an update.
    pub async fn revert(&self, request: RevertRequest) -> Result<VersionInfo> {
        let _lifecycle = self.lifecycle.lock().await;
        self.updater.revert(request).await
    }

    /// Regenerate `whitelist.json` from `roster` and apply it.
    pub async fn update_whitelist(&self, roster: &dyn RosterSource) -> Result<()> {
        let options = &self.settings.whitelist;
        if !options.enabled {
            self.progress.report("Whitelist management is disabled.");
            return Ok(());
        }
        let entries = if options.ignore_people {
            Vec::new()
        } else {
            whitelist::whitelist_entries(&roster.people().await?, &self.progress)
        };

        let path = self.settings.paths.dir.join("whitelist.json");
        whitelist::write_whitelist(&path, &entries).await?;
        self.progress
            .report(format!("Wrote {} whitelist entries", entries.len()));

        self.command("whitelist", &["reload".to_string()], false)
            .await?;
        for name in &options.additional {
            self.command("whitelist", &["add".to_string(), name.clone()], false)
                .await?;
        }
        Ok(())
    }
}
