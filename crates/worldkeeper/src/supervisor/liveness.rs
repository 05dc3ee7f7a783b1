// Copyright (C) 2025 Wurstmineberg
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pidfile and relay socket bookkeeping.
//!
//! An instance counts as running only when its pidfile names a live process
//! AND its relay socket exists. These files are the only state shared
//! between independent supervisor invocations.

use std::io::ErrorKind;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use nix::sys::signal;
use nix::unistd::Pid;
use tracing::{debug, warn};

use crate::progress::Progress;

/// Contents of a pidfile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PidRecord {
    /// No pidfile.
    Missing,
    /// The pidfile names this process.
    Recorded(u32),
    /// The pidfile exists but does not name a server process. Ids 0 and 1
    /// (the signalling process group and init) count as corrupt.
    Corrupt,
}

/// Lowest id a supervised server process can have.
const MIN_SERVER_PID: u32 = 2;

/// Whether a process with this id exists. A process owned by another user
/// (EPERM) still counts as alive. Ids 0 and 1 never name a server.
pub fn pid_alive(pid: u32) -> bool {
    if pid < MIN_SERVER_PID {
        return false;
    }
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match signal::kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(nix::errno::Errno::EPERM) => true,
        Err(nix::errno::Errno::ESRCH) => false,
        Err(e) => {
            debug!(pid = pid, error = %e, "Liveness check failed");
            false
        }
    }
}

/// Pidfile and socket of one instance.
#[derive(Debug, Clone)]
pub struct LivenessRecord {
    pidfile: PathBuf,
    socket: PathBuf,
}

impl LivenessRecord {
    /// Record kept in `pidfile` and `socket`.
    pub fn new(pidfile: PathBuf, socket: PathBuf) -> Self {
        Self { pidfile, socket }
    }

    /// Pidfile path.
    pub fn pidfile(&self) -> &Path {
        &self.pidfile
    }

    /// Relay socket path.
    pub fn socket(&self) -> &Path {
        &self.socket
    }

    /// Read and classify the pidfile.
    pub async fn read(&self) -> std::io::Result<PidRecord> {
        match tokio::fs::read_to_string(&self.pidfile).await {
            Ok(contents) => Ok(match contents.trim().parse::<u32>() {
                Ok(pid) if pid >= MIN_SERVER_PID => PidRecord::Recorded(pid),
                _ => PidRecord::Corrupt,
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(PidRecord::Missing),
            Err(e) => Err(e),
        }
    }

    /// Recorded pid, if any. Unreadable pidfiles are logged and ignored.
    pub async fn pid(&self) -> Option<u32> {
        match self.read().await {
            Ok(PidRecord::Recorded(pid)) => Some(pid),
            Ok(_) => None,
            Err(e) => {
                warn!(path = %self.pidfile.display(), error = %e, "Cannot read pidfile");
                None
            }
        }
    }

    /// Create the pidfile and socket directories.
    pub async fn prepare(&self) -> std::io::Result<()> {
        for path in [&self.pidfile, &self.socket] {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        Ok(())
    }

    /// Record `pid` in the pidfile.
    pub async fn write_pid(&self, pid: u32) -> std::io::Result<()> {
        tokio::fs::write(&self.pidfile, pid.to_string()).await
    }

    /// Whether the relay socket file exists.
    pub async fn socket_exists(&self) -> bool {
        tokio::fs::try_exists(&self.socket).await.unwrap_or(false)
    }

    /// Inode of the socket file currently at the socket path.
    pub async fn socket_id(&self) -> Option<u64> {
        tokio::fs::symlink_metadata(&self.socket)
            .await
            .ok()
            .map(|meta| meta.ino())
    }

    /// Remove the pidfile and socket, reporting each removal.
    pub async fn cleanup(&self, progress: &Progress) {
        if remove_if_present(&self.pidfile).await {
            progress.report("Removing PID file...");
        }
        if remove_if_present(&self.socket).await {
            progress.report("Removing socket file...");
        }
    }

    /// Remove the pidfile while it still names `pid` and the socket while it
    /// is still the file identified by `socket_id`. Used when a supervised
    /// child exits, so the record of a newer child is left alone.
    pub async fn release(&self, pid: u32, socket_id: Option<u64>) {
        if matches!(self.read().await, Ok(PidRecord::Recorded(recorded)) if recorded == pid) {
            remove_if_present(&self.pidfile).await;
        }
        if socket_id.is_some() && self.socket_id().await == socket_id {
            remove_if_present(&self.socket).await;
        }
    }
}

async fn remove_if_present(path: &Path) -> bool {
    match tokio::fs::remove_file(path).await {
        Ok(()) => true,
        Err(e) if e.kind() == ErrorKind::NotFound => false,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to remove file");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(dir: &TempDir) -> LivenessRecord {
        LivenessRecord::new(dir.path().join("w.pid"), dir.path().join("w.sock"))
    }

    #[test]
    fn test_own_process_is_alive() {
        assert!(pid_alive(std::process::id()));
    }

    #[test]
    fn test_out_of_range_pid_is_dead() {
        assert!(!pid_alive(u32::MAX));
    }

    #[tokio::test]
    async fn test_pidfile_states() {
        let dir = TempDir::new().unwrap();
        let record = record(&dir);
        assert_eq!(record.read().await.unwrap(), PidRecord::Missing);

        record.write_pid(4242).await.unwrap();
        assert_eq!(record.read().await.unwrap(), PidRecord::Recorded(4242));
        assert_eq!(record.pid().await, Some(4242));

        tokio::fs::write(record.pidfile(), "garbage").await.unwrap();
        assert_eq!(record.read().await.unwrap(), PidRecord::Corrupt);
        assert_eq!(record.pid().await, None);
    }

    #[tokio::test]
    async fn test_reserved_pids_are_corrupt() {
        let dir = TempDir::new().unwrap();
        let record = record(&dir);
        for reserved in ["0", "1\n"] {
            tokio::fs::write(record.pidfile(), reserved).await.unwrap();
            assert_eq!(record.read().await.unwrap(), PidRecord::Corrupt);
            assert_eq!(record.pid().await, None);
        }
        assert!(!pid_alive(0));
        assert!(!pid_alive(1));
    }

    #[tokio::test]
    async fn test_release_keeps_newer_record() {
        let dir = TempDir::new().unwrap();
        let record = record(&dir);
        record.write_pid(200).await.unwrap();
        tokio::fs::write(record.socket(), "").await.unwrap();
        let current = record.socket_id().await;
        assert!(current.is_some());

        record.release(100, current.map(|id| id + 1)).await;
        assert_eq!(record.pid().await, Some(200));
        assert!(record.socket_exists().await);

        record.release(200, current).await;
        assert_eq!(record.read().await.unwrap(), PidRecord::Missing);
        assert!(!record.socket_exists().await);
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let record = record(&dir);
        record.write_pid(1).await.unwrap();
        let progress = Progress::new("w");

        record.cleanup(&progress).await;
        record.cleanup(&progress).await;
        assert_eq!(record.read().await.unwrap(), PidRecord::Missing);
    }
}
