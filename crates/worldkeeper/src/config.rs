// Copyright (C) 2025 Wurstmineberg
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for worldkeeper.
//!
//! Configuration is a single JSON document. Every field has a default, so a
//! missing file or a partial document still yields a usable [`Config`].
//! Per-instance overrides live under `worlds` and are merged over the global
//! options by [`Config::instance`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

/// Default location of the configuration document.
pub const DEFAULT_CONFIG_PATH: &str = "/opt/wurstmineberg/config/systemd-minecraft.json";

/// Environment variable overriding the configuration path.
pub const CONFIG_PATH_ENV: &str = "WORLDKEEPER_CONFIG";

/// Default version manifest location.
pub const DEFAULT_MANIFEST_URL: &str =
    "https://launchermeta.mojang.com/mc/game/version_manifest.json";

/// Default RCON port.
pub const DEFAULT_RCON_PORT: u16 = 25575;

/// Global configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Name of the designated main instance.
    pub main_world: String,
    /// If set, lifecycle operations refuse to run under any other user.
    pub run_user: Option<String>,
    /// Java executable used to launch server processes.
    pub java_executable: PathBuf,
    /// JVM options shared by every instance.
    pub java_options: JavaOptions,
    /// Filesystem layout.
    pub paths: Paths,
    /// File name of the active server binary link inside an instance directory.
    pub service_name: String,
    /// Seconds to wait for the readiness line on start.
    pub start_timeout: u64,
    /// Whitelist options shared by every instance.
    pub whitelist: WhitelistOptions,
    /// Optional renderer invoked after the main instance changes version.
    pub texture_refresh: Option<TextureRefresh>,
    /// Version manifest URL.
    pub manifest_url: String,
    /// Per-instance overrides keyed by instance name.
    pub worlds: BTreeMap<String, InstanceOverrides>,
}

impl Default for Config {
    fn default() -> Self {
        let main_world = "wurstmineberg".to_string();
        let mut worlds = BTreeMap::new();
        worlds.insert(
            main_world.clone(),
            InstanceOverrides {
                enabled: true,
                ..InstanceOverrides::default()
            },
        );
        Self {
            main_world,
            run_user: None,
            java_executable: PathBuf::from("java"),
            java_options: JavaOptions::default(),
            paths: Paths::default(),
            service_name: "minecraft_server.jar".to_string(),
            start_timeout: 60,
            whitelist: WhitelistOptions::default(),
            texture_refresh: None,
            manifest_url: DEFAULT_MANIFEST_URL.to_string(),
            worlds,
        }
    }
}

/// JVM invocation options.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JavaOptions {
    /// Parallel GC thread count.
    pub cpu_count: u32,
    /// Maximum heap in MiB.
    pub max_heap: u32,
    /// Initial heap in MiB.
    pub min_heap: u32,
    /// Arguments appended after the server binary.
    pub jar_options: Vec<String>,
}

impl Default for JavaOptions {
    fn default() -> Self {
        Self {
            cpu_count: 1,
            max_heap: 4096,
            min_heap: 2048,
            jar_options: vec!["nogui".to_string()],
        }
    }
}

/// Partial JVM options from an instance override.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JavaOptionsOverride {
    /// Parallel GC thread count.
    pub cpu_count: Option<u32>,
    /// Maximum heap in MiB.
    pub max_heap: Option<u32>,
    /// Initial heap in MiB.
    pub min_heap: Option<u32>,
    /// Arguments appended after the server binary.
    pub jar_options: Option<Vec<String>>,
}

impl JavaOptions {
    fn merged(&self, over: &JavaOptionsOverride) -> Self {
        Self {
            cpu_count: over.cpu_count.unwrap_or(self.cpu_count),
            max_heap: over.max_heap.unwrap_or(self.max_heap),
            min_heap: over.min_heap.unwrap_or(self.min_heap),
            jar_options: over
                .jar_options
                .clone()
                .unwrap_or_else(|| self.jar_options.clone()),
        }
    }
}

/// Whitelist regeneration options.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WhitelistOptions {
    /// Whether whitelist regeneration runs at all.
    pub enabled: bool,
    /// Extra player names added after the roster is written.
    pub additional: Vec<String>,
    /// Skip the roster and only apply `additional`.
    pub ignore_people: bool,
}

impl Default for WhitelistOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            additional: Vec::new(),
            ignore_people: false,
        }
    }
}

/// Partial whitelist options from an instance override.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WhitelistOverride {
    /// Regenerate the whitelist of this instance.
    pub enabled: Option<bool>,
    /// Names whitelisted in addition to the roster.
    pub additional: Option<Vec<String>>,
    /// Whitelist only the additional names.
    pub ignore_people: Option<bool>,
}

impl WhitelistOptions {
    fn merged(&self, over: &WhitelistOverride) -> Self {
        Self {
            enabled: over.enabled.unwrap_or(self.enabled),
            additional: over
                .additional
                .clone()
                .unwrap_or_else(|| self.additional.clone()),
            ignore_people: over.ignore_people.unwrap_or(self.ignore_people),
        }
    }
}

/// External program that renders textures for a client version.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextureRefresh {
    /// Program to run as `<program> <client asset> <output dir>`.
    pub program: PathBuf,
    /// Output directory handed to the program.
    pub output_dir: PathBuf,
}

/// Filesystem layout.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Paths {
    /// Backup root; each instance gets a subdirectory.
    pub backup: PathBuf,
    /// Public link to the newest backup of the main instance.
    pub backup_web: Option<PathBuf>,
    /// Client asset cache, one `<version>/<version>.jar` per version.
    pub client_versions: Option<PathBuf>,
    /// Public link to the active client asset.
    pub client_link: Option<PathBuf>,
    /// Server binary cache.
    pub jar: PathBuf,
    /// Logging configuration handed to the JVM.
    pub log_config: PathBuf,
    /// Directory holding `<instance>.pid` files.
    pub pidfiles: PathBuf,
    /// Directory holding `<instance>.sock` relay sockets.
    pub sockets: PathBuf,
    /// Directory holding instance directories.
    pub worlds: PathBuf,
    /// Optional append-only events log of the main instance.
    pub events_log: Option<PathBuf>,
    /// Optional player roster used for whitelist regeneration.
    pub people: Option<PathBuf>,
}

impl Default for Paths {
    fn default() -> Self {
        let root = PathBuf::from("/opt/wurstmineberg");
        Self {
            backup: root.join("backup"),
            backup_web: None,
            client_versions: None,
            client_link: None,
            jar: root.join("jar"),
            log_config: root.join("log4j2.xml"),
            pidfiles: PathBuf::from("/var/local/wurstmineberg/minecraft_pids"),
            sockets: PathBuf::from("/var/local/wurstmineberg/minecraft_sockets"),
            worlds: root.join("world"),
            events_log: None,
            people: None,
        }
    }
}

/// Transport used to deliver console commands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    /// Remote console over TCP.
    #[default]
    Rcon,
    /// Local relay socket feeding the child's input stream.
    Relay,
}

/// Per-instance overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InstanceOverrides {
    /// Started by `--enabled` selections.
    pub enabled: bool,
    /// The server binary is managed outside worldkeeper.
    pub custom_server: bool,
    /// Command transport.
    pub channel: ChannelKind,
    /// RCON port on localhost.
    pub rcon_port: u16,
    /// RCON password; graceful RCON shutdown needs one.
    pub rcon_password: Option<String>,
    /// JVM options merged over the global ones.
    pub java_options: JavaOptionsOverride,
    /// Whitelist options merged over the global ones.
    pub whitelist: WhitelistOverride,
}

impl Default for InstanceOverrides {
    fn default() -> Self {
        Self {
            enabled: false,
            custom_server: false,
            channel: ChannelKind::default(),
            rcon_port: DEFAULT_RCON_PORT,
            rcon_password: None,
            java_options: JavaOptionsOverride::default(),
            whitelist: WhitelistOverride::default(),
        }
    }
}

/// Fully resolved settings for one instance.
#[derive(Debug, Clone)]
pub struct InstanceSettings {
    /// Instance name, also the name of its directory.
    pub name: String,
    /// This is the main world.
    pub is_main: bool,
    /// Started by `--enabled` selections.
    pub enabled: bool,
    /// The server binary is managed outside worldkeeper.
    pub custom_server: bool,
    /// Command transport.
    pub channel: ChannelKind,
    /// RCON port on localhost.
    pub rcon_port: u16,
    /// RCON password.
    pub rcon_password: Option<String>,
    /// Program launching the server.
    pub java_executable: PathBuf,
    /// Merged JVM options.
    pub java_options: JavaOptions,
    /// Merged whitelist options.
    pub whitelist: WhitelistOptions,
    /// How long to wait for the readiness line.
    pub start_timeout: Duration,
    /// File name of the active binary link.
    pub service_name: String,
    /// Version manifest location.
    pub manifest_url: String,
    /// Texture refresh run after the main instance changes version.
    pub texture_refresh: Option<TextureRefresh>,
    /// Derived paths.
    pub paths: InstancePaths,
}

/// Paths derived for one instance.
#[derive(Debug, Clone)]
pub struct InstancePaths {
    /// Instance directory (working directory of the child).
    pub dir: PathBuf,
    /// Pidfile of the running child.
    pub pidfile: PathBuf,
    /// Relay socket.
    pub socket: PathBuf,
    /// Backup directory of this instance.
    pub backup_dir: PathBuf,
    /// Active server binary link inside the instance directory.
    pub service_link: PathBuf,
    /// Server binary cache.
    pub jar_cache: PathBuf,
    /// Logging configuration handed to the JVM.
    pub log_config: PathBuf,
    /// Client asset cache.
    pub client_versions: Option<PathBuf>,
    /// Public link to the current client asset.
    pub client_link: Option<PathBuf>,
    /// Public link to the newest backup.
    pub backup_web: Option<PathBuf>,
    /// Start and stop events of the main instance.
    pub events_log: Option<PathBuf>,
    /// Player roster.
    pub people: Option<PathBuf>,
}

impl InstanceSettings {
    /// Server log the relay transport tails for replies.
    pub fn latest_log(&self) -> PathBuf {
        self.paths.dir.join("logs").join("latest.log")
    }

    /// Cache stem of server binaries, e.g. `minecraft_server`.
    pub fn binary_stem(&self) -> &str {
        self.service_name
            .strip_suffix(".jar")
            .unwrap_or(&self.service_name)
    }
}

impl Config {
    /// Resolve the configuration path from an explicit value, the
    /// `WORLDKEEPER_CONFIG` variable, or the default location.
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// Load configuration from a file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_json(&contents).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(source) => Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Parse configuration from a JSON document.
    pub fn from_json(contents: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(contents)
    }

    /// All configured instance names, sorted.
    pub fn instance_names(&self) -> Vec<String> {
        self.worlds.keys().cloned().collect()
    }

    /// Names of instances flagged as enabled, sorted.
    pub fn enabled_instance_names(&self) -> Vec<String> {
        self.worlds
            .iter()
            .filter(|(_, overrides)| overrides.enabled)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Merge the overrides of `name` over the global options.
    pub fn instance(&self, name: &str) -> Result<InstanceSettings, ConfigError> {
        let overrides = self
            .worlds
            .get(name)
            .ok_or_else(|| ConfigError::UnknownInstance(name.to_string()))?;
        let paths = &self.paths;
        let dir = paths.worlds.join(name);

        Ok(InstanceSettings {
            name: name.to_string(),
            is_main: name == self.main_world,
            enabled: overrides.enabled,
            custom_server: overrides.custom_server,
            channel: overrides.channel,
            rcon_port: overrides.rcon_port,
            rcon_password: overrides.rcon_password.clone(),
            java_executable: self.java_executable.clone(),
            java_options: self.java_options.merged(&overrides.java_options),
            whitelist: self.whitelist.merged(&overrides.whitelist),
            start_timeout: Duration::from_secs(self.start_timeout),
            service_name: self.service_name.clone(),
            manifest_url: self.manifest_url.clone(),
            texture_refresh: self.texture_refresh.clone(),
            paths: InstancePaths {
                service_link: dir.join(&self.service_name),
                pidfile: paths.pidfiles.join(format!("{name}.pid")),
                socket: paths.sockets.join(format!("{name}.sock")),
                backup_dir: paths.backup.join(name),
                jar_cache: paths.jar.clone(),
                log_config: paths.log_config.clone(),
                client_versions: paths.client_versions.clone(),
                client_link: paths.client_link.clone(),
                backup_web: paths.backup_web.clone(),
                events_log: paths.events_log.clone(),
                people: paths.people.clone(),
                dir,
            },
        })
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The configuration file exists but could not be read.
    #[error("Failed to read {}: {source}", .path.display())]
    Read {
        /// Configuration file.
        path: PathBuf,
        /// Underlying failure.
        #[source]
        source: std::io::Error,
    },
    /// The configuration file is not valid.
    #[error("Failed to parse {}: {source}", .path.display())]
    Parse {
        /// Configuration file.
        path: PathBuf,
        /// Underlying failure.
        #[source]
        source: serde_json::Error,
    },
    /// No instance with this name is configured.
    #[error("Unknown world: {0}")]
    UnknownInstance(String),
}
