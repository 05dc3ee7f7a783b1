// Copyright (C) 2025 Wurstmineberg
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for worldkeeper integration tests.
//!
//! Provides a temporary installation with a fake server script standing in
//! for the game server, plus a fake RCON endpoint.

#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use worldkeeper::channel::rcon::Packet;
use worldkeeper::{Config, Instance, Timings};

/// Fake server: announces readiness, records every input line in
/// `commands.log`, echoes it to `logs/latest.log`, exits on `stop` or EOF.
const FAKE_SERVER: &str = r#"#!/bin/sh
mkdir -p logs
: > logs/latest.log
echo "Starting minecraft server"
echo "$(date '+%Y-%m-%d %H:%M:%S') [Server thread/INFO]: Done (0.042s)! For help, type \"help\""
while IFS= read -r line; do
    echo "$line" >> commands.log
    echo "[Server thread/INFO]: ran $line" >> logs/latest.log
    if [ "$line" = "stop" ]; then
        exit 0
    fi
done
"#;

/// Timings small enough for tests.
pub fn fast_timings() -> Timings {
    Timings {
        start_poll_interval: Duration::from_millis(50),
        start_polls: 40,
        save_settle: Duration::from_millis(10),
        stop_settle: Duration::from_millis(50),
        stop_poll_interval: Duration::from_millis(50),
        stop_polls: 60,
        kill_poll_interval: Duration::from_millis(50),
        kill_polls: 60,
        relay_reply_delay: Duration::from_millis(150),
        announce_delay: Duration::from_millis(10),
        save_flush: Duration::from_millis(10),
        command_poll_interval: Duration::from_millis(50),
    }
}

/// Temporary installation with three worlds:
/// `main` (relay, main world), `side` (relay) and `remote` (RCON, no password).
pub struct Fixture {
    pub dir: TempDir,
    pub config: Config,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_manifest("http://127.0.0.1:9/manifest.json")
    }

    pub fn with_manifest(manifest_url: &str) -> Self {
        let dir = TempDir::new().unwrap();
        let root = dir.path();

        let script = root.join("fake-server.sh");
        std::fs::write(&script, FAKE_SERVER).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let document = serde_json::json!({
            "mainWorld": "main",
            "javaExecutable": script,
            "startTimeout": 5,
            "manifestUrl": manifest_url,
            "whitelist": {"additional": ["guest"]},
            "paths": {
                "backup": root.join("backup"),
                "backupWeb": root.join("web/latest.tar.gz"),
                "clientVersions": root.join("client"),
                "clientLink": root.join("web/client.jar"),
                "jar": root.join("jar"),
                "logConfig": root.join("log4j2.xml"),
                "pidfiles": root.join("pids"),
                "sockets": root.join("socks"),
                "worlds": root.join("worlds"),
                "eventsLog": root.join("events.log"),
            },
            "worlds": {
                "main": {"enabled": true, "channel": "relay"},
                "side": {"channel": "relay"},
                "remote": {"channel": "rcon"},
            },
        });
        let config = Config::from_json(&document.to_string()).unwrap();

        for name in config.instance_names() {
            std::fs::create_dir_all(root.join("worlds").join(&name)).unwrap();
        }
        Self { dir, config }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn instance(&self, name: &str) -> Instance {
        Instance::builder(self.config.instance(name).unwrap())
            .timings(fast_timings())
            .build()
            .unwrap()
    }

    pub fn world_dir(&self, name: &str) -> PathBuf {
        self.root().join("worlds").join(name)
    }

    /// Create `<world dir>/world` with a couple of files.
    pub fn seed_world(&self, name: &str, level: &str) -> PathBuf {
        let world = self.world_dir(name).join("world");
        std::fs::create_dir_all(world.join("region")).unwrap();
        std::fs::write(world.join("level.dat"), level).unwrap();
        std::fs::write(world.join("region/r.0.0.mca"), b"\x00\x01\x02region").unwrap();
        world
    }

    /// Lines the fake server received on its input.
    pub fn commands(&self, name: &str) -> Vec<String> {
        std::fs::read_to_string(self.world_dir(name).join("commands.log"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    pub fn pidfile(&self, name: &str) -> PathBuf {
        self.root().join("pids").join(format!("{name}.pid"))
    }

    pub fn socket(&self, name: &str) -> PathBuf {
        self.root().join("socks").join(format!("{name}.sock"))
    }
}

/// Unpack `archive` into `dest` with the system tar.
pub fn extract(archive: &Path, dest: &Path) {
    std::fs::create_dir_all(dest).unwrap();
    let status = std::process::Command::new("tar")
        .arg("-xzf")
        .arg(archive)
        .arg("-C")
        .arg(dest)
        .status()
        .unwrap();
    assert!(status.success());
}

/// Files (not directories) of `dir`, sorted.
pub fn files_in(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .map(|entries| entries.map(|e| e.unwrap().path()).collect())
        .unwrap_or_default();
    files.retain(|p| p.is_file());
    files.sort();
    files
}

/// In-process RCON endpoint recording received commands.
pub struct FakeRcon {
    pub port: u16,
    pub received: Arc<Mutex<Vec<String>>>,
    handle: JoinHandle<()>,
}

impl FakeRcon {
    /// Accept `password`. When `stop_pidfile` is given, a `stop` command
    /// terminates the process named by that pidfile.
    pub async fn start(password: &str, stop_pidfile: Option<PathBuf>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let received = Arc::new(Mutex::new(Vec::new()));
        let password = password.to_string();

        let log = received.clone();
        let handle = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let log = log.clone();
                let password = password.clone();
                let stop_pidfile = stop_pidfile.clone();
                tokio::spawn(async move {
                    let _ = serve(stream, &password, &log, stop_pidfile.as_deref()).await;
                });
            }
        });

        Self {
            port,
            received,
            handle,
        }
    }

    pub fn received(&self) -> Vec<String> {
        self.received.lock().unwrap().clone()
    }
}

impl Drop for FakeRcon {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve(
    mut stream: TcpStream,
    password: &str,
    log: &Mutex<Vec<String>>,
    stop_pidfile: Option<&Path>,
) -> Result<(), worldkeeper::ChannelError> {
    let login = Packet::read_from(&mut stream).await?;
    // Empty response ahead of the auth reply, like some real servers.
    stream
        .write_all(&Packet::new(login.id, 0, "").encode())
        .await?;
    let id = if login.payload == password { login.id } else { -1 };
    stream.write_all(&Packet::new(id, 2, "").encode()).await?;
    if id == -1 {
        return Ok(());
    }

    loop {
        let request = Packet::read_from(&mut stream).await?;
        log.lock().unwrap().push(request.payload.clone());
        stream
            .write_all(&Packet::new(request.id, 0, format!("ran {}", request.payload)).encode())
            .await?;
        if request.payload == "stop" {
            if let Some(pidfile) = stop_pidfile {
                if let Ok(pid) = std::fs::read_to_string(pidfile) {
                    let pid: i32 = pid.trim().parse().unwrap();
                    let _ = signal::kill(Pid::from_raw(pid), Signal::SIGTERM);
                }
            }
        }
    }
}
