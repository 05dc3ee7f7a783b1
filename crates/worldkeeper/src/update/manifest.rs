// Copyright (C) 2025 Wurstmineberg
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Version manifest and version resolution.

use chrono::{DateTime, Datelike, Utc};
use serde::Deserialize;
use tracing::debug;

use crate::error::Result;

/// Published version manifest.
#[derive(Debug, Clone, Deserialize)]
pub struct VersionManifest {
    /// Newest published versions.
    pub latest: LatestVersions,
    /// Every listed version, newest first.
    pub versions: Vec<ManifestEntry>,
}

/// Newest release and preview ids.
#[derive(Debug, Clone, Deserialize)]
pub struct LatestVersions {
    /// Newest release.
    pub release: String,
    /// Newest preview build.
    pub snapshot: String,
}

/// Manifest `type` of preview builds.
pub const PREVIEW_KIND: &str = "snapshot";

/// One listed version.
#[derive(Debug, Clone, Deserialize)]
pub struct ManifestEntry {
    /// Version id, e.g. `1.20.4` or `24w10a`.
    pub id: String,
    /// `release`, `snapshot`, or an older kind.
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Location of the per-version document.
    pub url: String,
}

/// Per-version document; only download locations are read.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VersionDetails {
    /// Downloadable artifacts.
    #[serde(default)]
    pub downloads: Downloads,
}

/// Download locations of one version.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Downloads {
    /// Server binary.
    pub server: Option<DownloadLocation>,
    /// Client asset.
    pub client: Option<DownloadLocation>,
}

/// One downloadable artifact.
#[derive(Debug, Clone, Deserialize)]
pub struct DownloadLocation {
    /// Absolute download URL.
    pub url: String,
}

impl ManifestEntry {
    /// Whether the manifest lists this version as a preview build.
    pub fn is_preview(&self) -> bool {
        self.kind == PREVIEW_KIND
    }
}

impl VersionManifest {
    /// Listed entry of `version`.
    pub fn entry(&self, version: &str) -> Option<&ManifestEntry> {
        self.versions.iter().find(|entry| entry.id == version)
    }
}

/// A resolved target version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionInfo {
    /// Version id.
    pub version: String,
    /// Preview build rather than a release.
    pub is_preview: bool,
    /// Human-readable label, e.g. `Minecraft version 1.20.4`.
    pub label: String,
}

impl VersionInfo {
    /// Resolved version with its label.
    pub fn new(version: impl Into<String>, is_preview: bool) -> Self {
        let version = version.into();
        let label = if is_preview {
            format!("Minecraft snapshot {version}")
        } else {
            format!("Minecraft version {version}")
        };
        Self {
            version,
            is_preview,
            label,
        }
    }
}

/// Expand a bare single-letter preview label into `<yy>w<ww><letter>` using
/// the ISO week of `now`. Anything else is returned unchanged.
pub fn expand_preview_label(label: &str, now: DateTime<Utc>) -> String {
    let mut chars = label.chars();
    match (chars.next(), chars.next()) {
        (Some(letter), None) if letter.is_ascii_alphabetic() => {
            let week = now.iso_week();
            format!("{:02}w{:02}{}", week.year() % 100, week.week(), letter)
        }
        _ => label.to_string(),
    }
}

/// Pick the target version: an explicit one, or the newest release/preview.
///
/// A listed version is classified by its manifest type, so an explicit
/// preview id resolves as a preview even without the preview flag.
pub fn resolve_version(
    manifest: &VersionManifest,
    target: Option<&str>,
    preview: bool,
    now: DateTime<Utc>,
) -> VersionInfo {
    match target {
        Some(target) => {
            let version = if preview {
                expand_preview_label(target, now)
            } else {
                target.to_string()
            };
            let is_preview = manifest
                .entry(&version)
                .map_or(preview, ManifestEntry::is_preview);
            VersionInfo::new(version, is_preview)
        }
        None if preview => VersionInfo::new(manifest.latest.snapshot.clone(), true),
        None => VersionInfo::new(manifest.latest.release.clone(), false),
    }
}

/// Client for the version manifest service.
#[derive(Debug, Clone)]
pub struct ManifestClient {
    http: reqwest::Client,
    manifest_url: String,
}

impl ManifestClient {
    /// Client fetching the manifest from `manifest_url`.
    pub fn new(http: reqwest::Client, manifest_url: impl Into<String>) -> Self {
        Self {
            http,
            manifest_url: manifest_url.into(),
        }
    }

    /// Fetch the manifest.
    pub async fn manifest(&self) -> Result<VersionManifest> {
        debug!(url = %self.manifest_url, "Fetching version manifest");
        let manifest = self
            .http
            .get(&self.manifest_url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(manifest)
    }

    /// Fetch the per-version document of `entry`.
    pub async fn details(&self, entry: &ManifestEntry) -> Result<VersionDetails> {
        debug!(version = %entry.id, url = %entry.url, "Fetching version details");
        let details = self
            .http
            .get(&entry.url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(details)
    }
}
