// Copyright (C) 2025 Wurstmineberg
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading tests.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::TempDir;
use worldkeeper::config::ConfigError;
use worldkeeper::{ChannelKind, Config};

#[test]
fn test_load_document_with_overrides() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("worldkeeper.json");
    std::fs::write(
        &path,
        r#"{
            "mainWorld": "alpha",
            "serviceName": "server.jar",
            "startTimeout": 30,
            "paths": {"worlds": "/srv/worlds", "backup": "/srv/backup"},
            "worlds": {
                "alpha": {"enabled": true, "rconPassword": "pw"},
                "beta": {"channel": "relay", "javaOptions": {"jarOptions": []}}
            }
        }"#,
    )
    .unwrap();

    let config = Config::load(&path).unwrap();
    assert_eq!(config.instance_names(), vec!["alpha", "beta"]);
    assert_eq!(config.enabled_instance_names(), vec!["alpha"]);

    let alpha = config.instance("alpha").unwrap();
    assert!(alpha.is_main);
    assert_eq!(alpha.channel, ChannelKind::Rcon);
    assert_eq!(alpha.rcon_password.as_deref(), Some("pw"));
    assert_eq!(alpha.start_timeout, Duration::from_secs(30));
    assert_eq!(alpha.paths.dir, PathBuf::from("/srv/worlds/alpha"));
    assert_eq!(alpha.paths.backup_dir, PathBuf::from("/srv/backup/alpha"));
    assert_eq!(
        alpha.paths.service_link,
        PathBuf::from("/srv/worlds/alpha/server.jar")
    );
    assert_eq!(alpha.binary_stem(), "server");

    let beta = config.instance("beta").unwrap();
    assert!(!beta.is_main);
    assert_eq!(beta.channel, ChannelKind::Relay);
    assert!(beta.java_options.jar_options.is_empty());
}

#[test]
fn test_invalid_document() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("broken.json");
    std::fs::write(&path, "{ not json").unwrap();

    let err = Config::load(&path).unwrap_err();
    assert!(matches!(err, ConfigError::Parse { path: p, .. } if p == path));
}

#[test]
fn test_unknown_channel_rejected() {
    let err = Config::from_json(r#"{"worlds": {"a": {"channel": "carrier-pigeon"}}}"#);
    assert!(err.is_err());
}

#[test]
fn test_explicit_path_wins() {
    let explicit = Path::new("/etc/worldkeeper/custom.json");
    assert_eq!(Config::resolve_path(Some(explicit)), explicit);
}
