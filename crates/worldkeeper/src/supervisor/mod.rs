// Copyright (C) 2025 Wurstmineberg
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process supervision for one instance.
//!
//! The supervisor launches the server process, detects readiness, relays
//! commands to it, and brings it down either gracefully over the command
//! channel or by signal escalation.
//!
//! # Lifecycle
//!
//! ```text
//!            start                ready / polls ok
//! Stopped ──────────► Starting ─────────────────► Running
//!    ▲                    │                          │
//!    │   not up in time   │                 stop     │
//!    ├────────────────────┘                          ▼
//!    │         exited / cleaned up               Stopping
//!    ├──────────────────────────────────────────────┤
//!    │                                               │ unreachable / timeout
//!    │               signals delivered               ▼
//!    └────────────────────────────────────────── Killing
//! ```
//!
//! Liveness is read from the pidfile and relay socket on every query, so
//! independent invocations agree on the state of an instance.

mod child;
pub mod liveness;
pub mod readiness;

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use crate::channel::{ChannelError, CommandChannel};
use crate::config::InstanceSettings;
use crate::error::{Error, Result};
use crate::progress::Progress;

pub use child::{ChildInput, STOP_LINE};
pub use liveness::{LivenessRecord, PidRecord, pid_alive};
pub use readiness::{READY_PATTERN, Readiness, ReadinessDetector, line_stream};

/// Notice broadcast to players before a graceful shutdown.
pub const SHUTDOWN_NOTICE: &str = "SERVER SHUTTING DOWN IN 10 SECONDS. Saving map...";

/// Delays and poll counts used by lifecycle operations.
#[derive(Debug, Clone)]
pub struct Timings {
    /// Interval between status checks after launch.
    pub start_poll_interval: Duration,
    /// Number of status checks after launch.
    pub start_polls: u32,
    /// Wait after `save-all` before sending `stop`.
    pub save_settle: Duration,
    /// Wait after sending `stop` before polling.
    pub stop_settle: Duration,
    /// Interval between status checks during shutdown.
    pub stop_poll_interval: Duration,
    /// Number of status checks during shutdown.
    pub stop_polls: u32,
    /// Interval between liveness checks after SIGTERM.
    pub kill_poll_interval: Duration,
    /// Number of liveness checks before SIGKILL.
    pub kill_polls: u32,
    /// Wait before reading the log tail for a relayed reply.
    pub relay_reply_delay: Duration,
    /// Wait between the update announcement and the shutdown.
    pub announce_delay: Duration,
    /// Wait after `save-all` while saves are being suspended.
    pub save_flush: Duration,
    /// Interval between status checks of a blocking command.
    pub command_poll_interval: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            start_poll_interval: Duration::from_millis(500),
            start_polls: 20,
            save_settle: Duration::from_secs(10),
            stop_settle: Duration::from_secs(7),
            stop_poll_interval: Duration::from_secs(5),
            stop_polls: 12,
            kill_poll_interval: Duration::from_secs(1),
            kill_polls: 60,
            relay_reply_delay: Duration::from_millis(200),
            announce_delay: Duration::from_secs(5),
            save_flush: Duration::from_secs(10),
            command_poll_interval: Duration::from_secs(1),
        }
    }
}

/// Lifecycle state as observed by this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// No child known to be running.
    Stopped,
    /// Launched, not yet confirmed running.
    Starting,
    /// Live process and relay socket.
    Running,
    /// Graceful shutdown in progress.
    Stopping,
    /// Signal escalation in progress.
    Killing,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Stopped => "stopped",
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Killing => "killing",
        };
        f.write_str(name)
    }
}

/// Supervisor of one server instance.
pub struct Supervisor {
    settings: Arc<InstanceSettings>,
    record: LivenessRecord,
    channel: Arc<dyn CommandChannel>,
    timings: Timings,
    progress: Progress,
    state: Arc<watch::Sender<LifecycleState>>,
    tasks: Mutex<Vec<child::ChildTasks>>,
}

impl Supervisor {
    /// Supervisor of the instance described by `settings`.
    pub fn new(
        settings: Arc<InstanceSettings>,
        channel: Arc<dyn CommandChannel>,
        timings: Timings,
        progress: Progress,
    ) -> Self {
        let record = LivenessRecord::new(
            settings.paths.pidfile.clone(),
            settings.paths.socket.clone(),
        );
        let (state, _) = watch::channel(LifecycleState::Stopped);
        Self {
            settings,
            record,
            channel,
            timings,
            progress,
            state: Arc::new(state),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Resolved settings.
    pub fn settings(&self) -> &InstanceSettings {
        &self.settings
    }

    /// Delays and poll counts in use.
    pub fn timings(&self) -> &Timings {
        &self.timings
    }

    /// Command transport.
    pub fn channel(&self) -> &Arc<dyn CommandChannel> {
        &self.channel
    }

    /// Pidfile and socket record.
    pub fn record(&self) -> &LivenessRecord {
        &self.record
    }

    /// Last lifecycle state observed by this process.
    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Subscribe to lifecycle transitions.
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    fn transition(&self, next: LifecycleState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(instance = %self.settings.name, from = %previous, to = %next, "Lifecycle transition");
        }
    }

    /// Recorded process id, if any.
    pub async fn pid(&self) -> Option<u32> {
        self.record.pid().await
    }

    /// Whether the recorded process is alive. A pidfile naming a dead process
    /// (or no process at all) is removed along with the socket.
    pub async fn pid_status(&self) -> bool {
        match self.record.read().await {
            Ok(PidRecord::Recorded(pid)) if pid_alive(pid) => true,
            Ok(PidRecord::Recorded(_)) | Ok(PidRecord::Corrupt) => {
                self.progress
                    .warn("PID file exists but process is terminated. Cleaning up...");
                self.cleanup().await;
                false
            }
            Ok(PidRecord::Missing) => false,
            Err(e) => {
                warn!(instance = %self.settings.name, error = %e, "Cannot read pidfile");
                false
            }
        }
    }

    /// Running means a live process AND an existing relay socket.
    pub async fn status(&self) -> bool {
        self.pid_status().await && self.record.socket_exists().await
    }

    /// Remove pidfile and socket.
    pub async fn cleanup(&self) {
        self.record.cleanup(&self.progress).await;
    }

    /// Installed server version, read from the active binary link.
    pub async fn version(&self) -> Option<String> {
        installed_version(&self.settings).await
    }

    /// Send a console command. With `block`, wait until the instance is
    /// running; otherwise fail with [`ChannelError::NotRunning`].
    pub async fn command(
        &self,
        command: &str,
        args: &[String],
        block: bool,
    ) -> std::result::Result<String, ChannelError> {
        while !self.status().await {
            if !block {
                return Err(ChannelError::NotRunning);
            }
            tokio::time::sleep(self.timings.command_poll_interval).await;
        }
        self.channel.send(command, args).await
    }

    /// Command line used to launch the server process.
    pub fn launch_command(&self) -> Command {
        let settings = &self.settings;
        let java = &settings.java_options;
        let mut command = Command::new(&settings.java_executable);
        command
            .arg(format!("-Xmx{}M", java.max_heap))
            .arg(format!("-Xms{}M", java.min_heap))
            .arg("-XX:+UseG1GC")
            .arg(format!("-XX:ParallelGCThreads={}", java.cpu_count))
            .arg(format!(
                "-Dlog4j.configurationFile={}",
                settings.paths.log_config.display()
            ))
            .arg("-jar")
            .arg(&settings.service_name)
            .args(&java.jar_options)
            .current_dir(&settings.paths.dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        command
    }

    /// Launch the server unless it is already running.
    ///
    /// Returns whether the instance is running once the post-launch polls
    /// are done. Reports and returns `false` when it was already running.
    pub async fn start(&self, message: &str) -> Result<bool> {
        if self.status().await {
            self.progress.report("Server is already running!");
            return Ok(false);
        }
        self.transition(LifecycleState::Starting);
        self.progress.report(message);

        match self.launch().await {
            Ok(()) => {}
            Err(e) => {
                self.cleanup().await;
                self.transition(LifecycleState::Stopped);
                return Err(e);
            }
        }

        if self.settings.is_main {
            let line = match self.version().await {
                Some(version) => format!("@start {version}"),
                None => "@restart".to_string(),
            };
            self.log_event(&line).await;
        }

        for _ in 0..self.timings.start_polls {
            if self.status().await {
                break;
            }
            tokio::time::sleep(self.timings.start_poll_interval).await;
        }

        let running = self.status().await;
        if running {
            self.transition(LifecycleState::Running);
        } else {
            self.progress.warn("Server did not come up");
            self.transition(LifecycleState::Stopped);
        }
        Ok(running)
    }

    async fn launch(&self) -> Result<()> {
        self.record.prepare().await?;
        let listener = child::bind_relay(self.record.socket()).await?;
        let socket_id = self.record.socket_id().await;

        let program = self.settings.java_executable.display().to_string();
        let mut process = self
            .launch_command()
            .spawn()
            .map_err(|source| Error::Spawn {
                program: program.clone(),
                source,
            })?;
        let Some(pid) = process.id() else {
            self.cleanup().await;
            return Err(Error::Other(format!("{program} exited immediately")));
        };
        self.record.write_pid(pid).await?;
        info!(instance = %self.settings.name, pid = pid, "Server process spawned");

        let input = ChildInput::new(process.stdin.take());
        let Some(stdout) = process.stdout.take() else {
            return Err(Error::Other("child output stream unavailable".to_string()));
        };
        let mut output = BufReader::new(stdout);

        let detector = ReadinessDetector::new(self.settings.start_timeout)?;
        match detector.wait(line_stream(&mut output)).await {
            Readiness::Ready => debug!(instance = %self.settings.name, "Readiness line seen"),
            Readiness::TimedOut => self.progress.warn(format!(
                "Server did not report readiness within {} seconds",
                self.settings.start_timeout.as_secs()
            )),
            Readiness::Closed => self
                .progress
                .warn("Server output closed before readiness was reported"),
        }

        let tasks = child::spawn(child::Attached {
            instance: self.settings.name.clone(),
            pid,
            child: process,
            input,
            output,
            listener,
            socket_id,
            record: self.record.clone(),
            state: self.state.clone(),
        });
        let mut attached = self.tasks.lock().await;
        attached.retain(|tasks| !tasks.is_finished());
        attached.push(tasks);
        Ok(())
    }

    /// Whether a child launched by this process is still attached. Only
    /// such a child has a relay task serving its socket.
    pub async fn is_attached(&self) -> bool {
        self.tasks
            .lock()
            .await
            .iter()
            .any(|tasks| !tasks.is_finished())
    }

    /// Wait until every child started by this supervisor has exited.
    pub async fn wait(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for attached in tasks {
            attached.join().await;
        }
    }

    /// Stop the server gracefully, escalating to [`Supervisor::kill`] when
    /// the command channel is unusable or the server does not go down.
    ///
    /// Stopping an instance that is not running only cleans up and reports
    /// success.
    pub async fn stop(&self, notice: Option<&str>) -> Result<bool> {
        if !self.status().await {
            self.progress.report("Server was not running.");
            self.cleanup().await;
            self.transition(LifecycleState::Stopped);
            return Ok(true);
        }
        self.transition(LifecycleState::Stopping);

        if self.channel.check_credentials().is_err() {
            self.progress
                .warn("Cannot communicate with the server: no RCON password configured. Killing...");
            return self.kill().await;
        }

        match self.shutdown_gracefully(notice).await {
            Ok(true) => {}
            Ok(false) => {
                self.progress.warn("The server could not be stopped! Killing...");
                return self.kill().await;
            }
            Err(ChannelError::NotRunning) => {}
            Err(e) => {
                self.progress
                    .warn(format!("Cannot communicate with the server: {e}. Killing..."));
                return self.kill().await;
            }
        }

        if self.settings.is_main {
            self.log_event("@stop").await;
        }
        self.cleanup().await;
        let stopped = !self.status().await;
        self.transition(LifecycleState::Stopped);
        Ok(stopped)
    }

    async fn shutdown_gracefully(
        &self,
        notice: Option<&str>,
    ) -> std::result::Result<bool, ChannelError> {
        self.progress.report("Stopping server...");
        if let Some(notice) = notice {
            self.command("say", &[notice.to_string()], false).await?;
        }
        self.command("save-all", &[], false).await?;
        tokio::time::sleep(self.timings.save_settle).await;

        // The server may drop the connection while it shuts down.
        match self.command(STOP_LINE, &[], false).await {
            Ok(_) => {}
            Err(e @ (ChannelError::Unreachable(_) | ChannelError::MissingCredential)) => {
                return Err(e);
            }
            Err(e) => debug!(instance = %self.settings.name, error = %e, "Stop command reply lost"),
        }
        tokio::time::sleep(self.timings.stop_settle).await;

        for _ in 0..self.timings.stop_polls {
            if !self.status().await {
                return Ok(true);
            }
            tokio::time::sleep(self.timings.stop_poll_interval).await;
        }
        Ok(!self.status().await)
    }

    /// Terminate the recorded process: SIGTERM, wait, then SIGKILL.
    ///
    /// Without a recorded pid no signal is sent. Pidfile and socket are
    /// removed on every path.
    pub async fn kill(&self) -> Result<bool> {
        self.transition(LifecycleState::Killing);
        let outcome = self.escalate_signals().await;
        self.cleanup().await;
        let stopped = !self.status().await;
        self.transition(LifecycleState::Stopped);
        outcome?;
        Ok(stopped)
    }

    async fn escalate_signals(&self) -> Result<()> {
        let Some(pid) = self.record.pid().await else {
            self.progress.report("No recorded process. Cleaning up...");
            return Ok(());
        };
        let target = Pid::from_raw(
            i32::try_from(pid).map_err(|_| Error::Other(format!("invalid pid {pid}")))?,
        );

        self.progress.report(format!(
            "Sending SIGTERM to PID {pid} and waiting {} seconds for shutdown...",
            (self.timings.kill_poll_interval * self.timings.kill_polls).as_secs()
        ));
        match signal::kill(target, Signal::SIGTERM) {
            Ok(()) => {}
            Err(nix::errno::Errno::ESRCH) => {
                self.progress.report("Process does not exist. Cleaning up...");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        for _ in 0..self.timings.kill_polls {
            if !pid_alive(pid) {
                self.progress.report("Terminated");
                return Ok(());
            }
            tokio::time::sleep(self.timings.kill_poll_interval).await;
        }

        self.progress.warn(format!(
            "Could not terminate with SIGTERM. Sending SIGKILL to PID {pid}..."
        ));
        match signal::kill(target, Signal::SIGKILL) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn log_event(&self, line: &str) {
        let Some(path) = &self.settings.paths.events_log else {
            return;
        };
        let entry = format!(
            "{} {}\n",
            chrono::Utc::now().format("%Y-%m-%d %H:%M:%S"),
            line
        );
        if let Err(e) = append(path, &entry).await {
            warn!(path = %path.display(), error = %e, "Failed to write events log");
        }
    }
}

async fn append(path: &Path, entry: &str) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(entry.as_bytes()).await
}

/// Version named by the active binary link, e.g. `minecraft_server.1.20.4.jar`
/// yields `1.20.4`. Custom servers have no known version.
pub async fn installed_version(settings: &InstanceSettings) -> Option<String> {
    if settings.custom_server {
        return None;
    }
    let target: PathBuf = tokio::fs::read_link(&settings.paths.service_link).await.ok()?;
    let file_name = target.file_name()?.to_str()?;
    file_name
        .strip_prefix(settings.binary_stem())?
        .strip_prefix('.')?
        .strip_suffix(".jar")
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::RconChannel;
    use crate::config::Config;
    use tempfile::TempDir;

    fn supervisor(dir: &TempDir) -> Supervisor {
        let config = Config::from_json(&format!(
            r#"{{
                "mainWorld": "w",
                "javaOptions": {{"maxHeap": 1024, "minHeap": 512, "cpuCount": 2}},
                "paths": {{
                    "worlds": "{0}/worlds",
                    "pidfiles": "{0}/pids",
                    "sockets": "{0}/socks",
                    "logConfig": "{0}/log4j2.xml"
                }},
                "worlds": {{"w": {{"enabled": true}}}}
            }}"#,
            dir.path().display()
        ))
        .unwrap();
        let settings = Arc::new(config.instance("w").unwrap());
        let channel = Arc::new(RconChannel::new(settings.rcon_port, None));
        Supervisor::new(settings, channel, Timings::default(), Progress::new("w"))
    }

    #[test]
    fn test_launch_command() {
        let dir = TempDir::new().unwrap();
        let supervisor = supervisor(&dir);
        let command = supervisor.launch_command();
        let cmd = command.as_std();
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        assert_eq!(cmd.get_program(), "java");
        assert_eq!(
            args,
            vec![
                "-Xmx1024M".to_string(),
                "-Xms512M".to_string(),
                "-XX:+UseG1GC".to_string(),
                "-XX:ParallelGCThreads=2".to_string(),
                format!("-Dlog4j.configurationFile={}/log4j2.xml", dir.path().display()),
                "-jar".to_string(),
                "minecraft_server.jar".to_string(),
                "nogui".to_string(),
            ]
        );
        assert_eq!(
            cmd.get_current_dir(),
            Some(dir.path().join("worlds/w").as_path())
        );
    }

    #[tokio::test]
    async fn test_stale_pidfile_is_cleaned() {
        let dir = TempDir::new().unwrap();
        let supervisor = supervisor(&dir);
        supervisor.record().prepare().await.unwrap();
        supervisor.record().write_pid(u32::MAX).await.unwrap();
        tokio::fs::write(supervisor.record().socket(), "").await.unwrap();

        assert!(!supervisor.status().await);
        assert!(!supervisor.record().pidfile().exists());
        assert!(!supervisor.record().socket().exists());
    }

    #[tokio::test]
    async fn test_pidfile_naming_init_is_not_running() {
        let dir = TempDir::new().unwrap();
        let supervisor = supervisor(&dir);
        supervisor.record().prepare().await.unwrap();
        tokio::fs::write(supervisor.record().pidfile(), "1").await.unwrap();
        tokio::fs::write(supervisor.record().socket(), "").await.unwrap();

        assert!(!supervisor.status().await);
        assert!(!supervisor.record().pidfile().exists());
        assert!(!supervisor.record().socket().exists());

        // Nothing left to signal.
        assert!(supervisor.kill().await.unwrap());
    }

    #[tokio::test]
    async fn test_command_when_stopped() {
        let dir = TempDir::new().unwrap();
        let supervisor = supervisor(&dir);
        let err = supervisor.command("list", &[], false).await.unwrap_err();
        assert!(matches!(err, ChannelError::NotRunning));
    }

    #[tokio::test]
    async fn test_kill_without_pid_reports_success() {
        let dir = TempDir::new().unwrap();
        let supervisor = supervisor(&dir);
        assert!(supervisor.kill().await.unwrap());
        assert!(supervisor.kill().await.unwrap());
        assert_eq!(supervisor.state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn test_installed_version() {
        let dir = TempDir::new().unwrap();
        let supervisor = supervisor(&dir);
        assert_eq!(supervisor.version().await, None);

        tokio::fs::create_dir_all(dir.path().join("worlds/w"))
            .await
            .unwrap();
        tokio::fs::symlink(
            "/opt/jar/minecraft_server.1.20.4.jar",
            dir.path().join("worlds/w/minecraft_server.jar"),
        )
        .await
        .unwrap();
        assert_eq!(supervisor.version().await.as_deref(), Some("1.20.4"));
    }
}
