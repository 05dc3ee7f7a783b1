// Copyright (C) 2025 Wurstmineberg
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Whitelist regeneration from a player roster.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::progress::Progress;

/// Roster statuses whose members are whitelisted.
pub const WHITELISTED_STATUSES: [&str; 3] = ["founding", "later", "postfreeze"];

/// One roster member.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Person {
    /// Player name.
    #[serde(default)]
    pub minecraft: Option<String>,
    /// Player UUID, as text (with or without hyphens) or a number.
    #[serde(default, rename = "minecraftUUID")]
    pub minecraft_uuid: Option<Value>,
    /// Membership status; members without one count as `later`.
    #[serde(default)]
    pub status: Option<String>,
}

/// Source of roster members.
#[async_trait]
pub trait RosterSource: Send + Sync {
    /// Current roster members.
    async fn people(&self) -> Result<Vec<Person>>;
}

/// Roster stored as `{"people": [...]}`.
#[derive(Debug, Clone)]
pub struct JsonRoster {
    path: PathBuf,
}

impl JsonRoster {
    /// Roster read from `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[derive(Deserialize)]
struct RosterDocument {
    people: Vec<Person>,
}

#[async_trait]
impl RosterSource for JsonRoster {
    async fn people(&self) -> Result<Vec<Person>> {
        let contents = tokio::fs::read_to_string(&self.path).await?;
        let document: RosterDocument = serde_json::from_str(&contents)?;
        Ok(document.people)
    }
}

/// Entry of `whitelist.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WhitelistEntry {
    /// Player name.
    pub name: String,
    /// Hyphenated player UUID.
    pub uuid: String,
}

/// Insert hyphens into a 32-digit UUID; hyphenated input is kept as is.
pub fn hyphenate_uuid(uuid: &str) -> String {
    if uuid.contains('-') || uuid.len() != 32 || !uuid.is_ascii() {
        return uuid.to_string();
    }
    format!(
        "{}-{}-{}-{}-{}",
        &uuid[..8],
        &uuid[8..12],
        &uuid[12..16],
        &uuid[16..20],
        &uuid[20..]
    )
}

fn uuid_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) if !text.is_empty() => Some(text.clone()),
        Value::Number(number) => number.as_u64().map(|n| format!("{n:032x}")),
        _ => None,
    }
}

/// Select whitelisted roster members. Members lacking a name or UUID are
/// skipped and reported.
pub fn whitelist_entries(people: &[Person], progress: &Progress) -> Vec<WhitelistEntry> {
    people
        .iter()
        .filter(|person| person.minecraft.is_some() || person.minecraft_uuid.is_some())
        .filter(|person| {
            let status = person.status.as_deref().unwrap_or("later");
            WHITELISTED_STATUSES.contains(&status)
        })
        .filter_map(|person| {
            let uuid = person.minecraft_uuid.as_ref().and_then(uuid_text);
            match (&person.minecraft, uuid) {
                (Some(name), Some(uuid)) => Some(WhitelistEntry {
                    name: name.clone(),
                    uuid: hyphenate_uuid(&uuid),
                }),
                (name, _) => {
                    progress.warn(format!(
                        "Skipping roster entry {} without both name and UUID",
                        name.as_deref().unwrap_or("<unnamed>")
                    ));
                    None
                }
            }
        })
        .collect()
}

/// Write `entries` as 4-space indented JSON with sorted keys.
pub async fn write_whitelist(path: &Path, entries: &[WhitelistEntry]) -> Result<()> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
    entries.serialize(&mut serializer)?;
    tokio::fs::write(path, buf).await?;
    Ok(())
}
