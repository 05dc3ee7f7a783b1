// Copyright (C) 2025 Wurstmineberg
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Update and revert tests against a mocked version manifest.

mod common;

use std::path::PathBuf;

use common::{Fixture, extract};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};
use worldkeeper::{Error, RevertRequest, RevertTarget, UpdateRequest};

async fn manifest_server() -> MockServer {
    let server = MockServer::start().await;
    let base = server.uri();
    let manifest = serde_json::json!({
        "latest": {"release": "1.20.4", "snapshot": "24w10a"},
        "versions": [
            {"id": "24w10a", "type": "snapshot", "url": format!("{base}/v/24w10a.json")},
            {"id": "1.20.4", "type": "release", "url": format!("{base}/v/1.20.4.json")},
            {"id": "1.20.3", "type": "release", "url": format!("{base}/v/1.20.3.json")},
        ],
    });
    Mock::given(method("GET"))
        .and(path("/manifest.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(manifest))
        .mount(&server)
        .await;

    for version in ["1.20.3", "1.20.4"] {
        let details = serde_json::json!({
            "downloads": {
                "server": {"url": format!("{base}/jars/server-{version}.jar")},
                "client": {"url": format!("{base}/jars/client-{version}.jar")},
            },
        });
        Mock::given(method("GET"))
            .and(path(format!("/v/{version}.json")))
            .respond_with(ResponseTemplate::new(200).set_body_json(details))
            .mount(&server)
            .await;
    }
    server
}

async fn serve_jar(server: &MockServer, name: &str, body: &str, times: u64) {
    Mock::given(method("GET"))
        .and(path(format!("/jars/{name}")))
        .respond_with(ResponseTemplate::new(200).set_body_string(body.to_string()))
        .expect(times)
        .mount(server)
        .await;
}

fn fixture_for(server: &MockServer) -> Fixture {
    Fixture::with_manifest(&format!("{}/manifest.json", server.uri()))
}

fn pre_update_archives(fixture: &Fixture, name: &str) -> Vec<String> {
    let dir = fixture.root().join("backup").join(name).join("pre-update");
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_update_stopped_main_instance() {
    let server = manifest_server().await;
    serve_jar(&server, "server-1.20.4.jar", "server 1.20.4", 1).await;
    serve_jar(&server, "client-1.20.4.jar", "client 1.20.4", 1).await;
    let fixture = fixture_for(&server);
    fixture.seed_world("main", "before update");
    let instance = fixture.instance("main");

    let info = instance.update(UpdateRequest::default()).await.unwrap();
    assert_eq!(info.version, "1.20.4");
    assert_eq!(info.label, "Minecraft version 1.20.4");

    let cached = fixture.root().join("jar/minecraft_server.1.20.4.jar");
    assert_eq!(std::fs::read_to_string(&cached).unwrap(), "server 1.20.4");
    assert_eq!(
        std::fs::read_link(fixture.world_dir("main").join("minecraft_server.jar")).unwrap(),
        cached
    );
    assert_eq!(instance.version().await.as_deref(), Some("1.20.4"));
    assert!(!instance.is_attached().await);

    let client = fixture.root().join("client/1.20.4/1.20.4.jar");
    assert_eq!(std::fs::read_to_string(&client).unwrap(), "client 1.20.4");
    assert_eq!(
        std::fs::read_link(fixture.root().join("web/client.jar")).unwrap(),
        client
    );

    let archives = pre_update_archives(&fixture, "main");
    assert_eq!(archives.len(), 1, "unexpected archives: {archives:?}");
    assert!(archives[0].starts_with("main_"));
    assert!(archives[0].ends_with("_unknown_1.20.4.tar.gz"));

    // A second update to the same version reuses the cache.
    let info = instance
        .update(UpdateRequest {
            version: Some("1.20.4".to_string()),
            backup: false,
            ..UpdateRequest::default()
        })
        .await
        .unwrap();
    assert_eq!(info.version, "1.20.4");
    assert_eq!(pre_update_archives(&fixture, "main").len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_update_running_instance_restarts() {
    let server = manifest_server().await;
    serve_jar(&server, "server-1.20.4.jar", "server 1.20.4", 1).await;
    serve_jar(&server, "client-1.20.4.jar", "client 1.20.4", 0).await;
    let fixture = fixture_for(&server);
    fixture.seed_world("side", "running world");
    let instance = fixture.instance("side");
    instance.start().await.unwrap();
    let before = instance.pid().await.unwrap();

    instance
        .update(UpdateRequest {
            version: Some("1.20.4".to_string()),
            ..UpdateRequest::default()
        })
        .await
        .unwrap();

    assert!(instance.status().await);
    assert_ne!(instance.pid().await.unwrap(), before);
    assert_eq!(instance.version().await.as_deref(), Some("1.20.4"));

    let commands = fixture.commands("side");
    assert!(commands.contains(
        &"say Server will be upgraded to Minecraft version 1.20.4 and therefore restart"
            .to_string()
    ));
    assert!(commands.contains(&"save-off".to_string()));
    assert_eq!(commands.iter().filter(|c| *c == "stop").count(), 1);

    instance.stop().await.unwrap();
    instance.wait().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_update_keeps_restarted_instance_attached() {
    let server = manifest_server().await;
    serve_jar(&server, "server-1.20.4.jar", "server 1.20.4", 1).await;
    let fixture = fixture_for(&server);
    fixture.seed_world("side", "running world");
    let instance = fixture.instance("side");
    instance.start().await.unwrap();

    instance
        .update(UpdateRequest {
            version: Some("1.20.4".to_string()),
            backup: false,
            ..UpdateRequest::default()
        })
        .await
        .unwrap();

    // The restarted child is owned by this process and still relays.
    assert!(instance.is_attached().await);
    let reply = instance.command("list", &[], false).await.unwrap();
    assert!(reply.contains("ran list"), "unexpected reply: {reply:?}");

    // The relay keeps serving the restarted child over time.
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    assert!(instance.is_attached().await);
    assert!(instance.status().await);

    instance.stop().await.unwrap();
    instance.wait().await;
    assert!(!instance.is_attached().await);
    assert!(!fixture.socket("side").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_update_refreshes_textures_from_client_asset() {
    use std::os::unix::fs::PermissionsExt;

    let server = manifest_server().await;
    serve_jar(&server, "server-1.20.4.jar", "server 1.20.4", 1).await;
    serve_jar(&server, "client-1.20.4.jar", "client 1.20.4", 1).await;
    let fixture = fixture_for(&server);
    fixture.seed_world("main", "textured");

    let recorded = fixture.root().join("refresh-args.txt");
    let script = fixture.root().join("refresh.sh");
    std::fs::write(
        &script,
        format!("#!/bin/sh\necho \"$@\" > {}\n", recorded.display()),
    )
    .unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
    let output_dir = fixture.root().join("web/textures");

    let mut settings = fixture.config.instance("main").unwrap();
    settings.texture_refresh = Some(worldkeeper::config::TextureRefresh {
        program: script,
        output_dir: output_dir.clone(),
    });
    let instance = worldkeeper::Instance::builder(settings)
        .timings(common::fast_timings())
        .build()
        .unwrap();

    instance
        .update(UpdateRequest {
            version: Some("1.20.4".to_string()),
            backup: false,
            ..UpdateRequest::default()
        })
        .await
        .unwrap();

    let client = fixture.root().join("client/1.20.4/1.20.4.jar");
    assert_eq!(
        std::fs::read_to_string(&recorded).unwrap().trim_end(),
        format!("{} {}", client.display(), output_dir.display())
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_update_custom_server_is_unimplemented() {
    let fixture = Fixture::new();
    let mut settings = fixture.config.instance("side").unwrap();
    settings.custom_server = true;
    let instance = worldkeeper::Instance::builder(settings)
        .timings(common::fast_timings())
        .build()
        .unwrap();

    let err = instance.update(UpdateRequest::default()).await.unwrap_err();
    assert!(matches!(err, Error::UnimplementedOperation(_)));
    let err = instance.revert(RevertRequest::default()).await.unwrap_err();
    assert!(matches!(err, Error::UnimplementedOperation(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_revert_without_archive_changes_nothing() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;
    let fixture = fixture_for(&server);
    fixture.seed_world("main", "untouched");
    let instance = fixture.instance("main");

    let err = instance.revert(RevertRequest::default()).await.unwrap_err();
    assert!(matches!(err, Error::NoBackupFound(_)));
    assert_eq!(
        std::fs::read_to_string(fixture.world_dir("main").join("world/level.dat")).unwrap(),
        "untouched"
    );

    let err = instance
        .revert(RevertRequest {
            target: RevertTarget::Version("1.19".to_string()),
            ..RevertRequest::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NoBackupFound(_)));
}

/// Create a pre-update archive of `main` holding a world with `level`.
fn stage_pre_update_archive(fixture: &Fixture, file_name: &str, level: &str) -> PathBuf {
    let staging = fixture.root().join("staging");
    std::fs::create_dir_all(staging.join("world")).unwrap();
    std::fs::write(staging.join("world/level.dat"), level).unwrap();

    let dir = fixture.root().join("backup/main/pre-update");
    std::fs::create_dir_all(&dir).unwrap();
    let archive = dir.join(file_name);
    let status = std::process::Command::new("tar")
        .arg("-C")
        .arg(&staging)
        .arg("-czf")
        .arg(&archive)
        .arg("world")
        .status()
        .unwrap();
    assert!(status.success());
    std::fs::remove_dir_all(&staging).unwrap();
    archive
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_revert_restores_world_and_binary() {
    let server = manifest_server().await;
    serve_jar(&server, "server-1.20.3.jar", "server 1.20.3", 1).await;
    serve_jar(&server, "client-1.20.3.jar", "client 1.20.3", 1).await;
    let fixture = fixture_for(&server);
    fixture.seed_world("main", "after update");
    std::os::unix::fs::symlink(
        fixture.root().join("jar/minecraft_server.1.20.4.jar"),
        fixture.world_dir("main").join("minecraft_server.jar"),
    )
    .unwrap();
    stage_pre_update_archive(
        &fixture,
        "main_2024-01-01_00h00_1.20.3_1.20.4.tar.gz",
        "before update",
    );
    let instance = fixture.instance("main");

    let info = instance.revert(RevertRequest::default()).await.unwrap();

    assert_eq!(info.version, "1.20.3");
    assert_eq!(instance.version().await.as_deref(), Some("1.20.3"));
    assert_eq!(
        std::fs::read_to_string(fixture.world_dir("main").join("world/level.dat")).unwrap(),
        "before update"
    );
    assert!(!fixture.world_dir("main").join("world/region").exists());

    // The replaced world was kept under `reverted/`.
    let reverted: Vec<PathBuf> = std::fs::read_dir(fixture.root().join("backup/main/reverted"))
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    assert_eq!(reverted.len(), 1);
    assert!(
        reverted[0]
            .to_string_lossy()
            .ends_with("_1.20.4_1.20.3.tar.gz")
    );
    let unpacked = fixture.root().join("unpacked");
    extract(&reverted[0], &unpacked);
    assert_eq!(
        std::fs::read_to_string(unpacked.join("world/level.dat")).unwrap(),
        "after update"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_revert_explicit_archive() {
    let server = manifest_server().await;
    serve_jar(&server, "server-1.20.3.jar", "server 1.20.3", 1).await;
    serve_jar(&server, "client-1.20.3.jar", "client 1.20.3", 1).await;
    let fixture = fixture_for(&server);
    fixture.seed_world("main", "current");
    let archive = stage_pre_update_archive(
        &fixture,
        "main_2024-01-01_00h00_1.20.3_1.20.4.tar.gz",
        "archived",
    );
    let instance = fixture.instance("main");

    let info = instance
        .revert(RevertRequest {
            target: RevertTarget::Archive(archive),
            backup: false,
            ..RevertRequest::default()
        })
        .await
        .unwrap();

    assert_eq!(info.version, "1.20.3");
    assert_eq!(
        std::fs::read_to_string(fixture.world_dir("main").join("world/level.dat")).unwrap(),
        "archived"
    );
    assert!(!fixture.root().join("backup/main/reverted").exists());
}
