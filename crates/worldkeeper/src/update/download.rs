// Copyright (C) 2025 Wurstmineberg
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Artifact downloads into a local cache.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::Result;

/// Download `url` to `dest`. The body is written to a `.part` sibling and
/// renamed into place once complete, so `dest` is never partially written.
pub async fn download_to(http: &reqwest::Client, url: &str, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut partial = dest.as_os_str().to_os_string();
    partial.push(".part");
    let partial = PathBuf::from(partial);

    debug!(url = url, dest = %dest.display(), "Downloading");
    let mut response = http.get(url).send().await?.error_for_status()?;
    let mut file = tokio::fs::File::create(&partial).await?;
    let mut written: u64 = 0;
    while let Some(chunk) = response.chunk().await? {
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    drop(file);

    tokio::fs::rename(&partial, dest).await?;
    info!(url = url, dest = %dest.display(), bytes = written, "Download complete");
    Ok(())
}

/// Fetch into `dest` unless a cached copy exists. With `refresh` the cached
/// copy is deleted and fetched again. Returns whether a download happened.
pub async fn ensure_cached(
    http: &reqwest::Client,
    url: &str,
    dest: &Path,
    refresh: bool,
) -> Result<bool> {
    let cached = tokio::fs::try_exists(dest).await.unwrap_or(false);
    if cached && !refresh {
        debug!(dest = %dest.display(), "Using cached download");
        return Ok(false);
    }
    if cached {
        tokio::fs::remove_file(dest).await?;
    }
    download_to(http, url, dest).await?;
    Ok(true)
}
