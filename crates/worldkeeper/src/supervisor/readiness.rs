// Copyright (C) 2025 Wurstmineberg
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Readiness detection on the child's output stream.

use std::io;
use std::time::Duration;

use futures::stream::{self, Stream, StreamExt};
use regex::Regex;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// Log line the server prints once it accepts players.
pub const READY_PATTERN: &str = r"[0-9]{4}-[0-9]{2}-[0-9]{2} [0-9]{2}:[0-9]{2}:[0-9]{2} \[Server thread/INFO\]: Done \([0-9]+\.[0-9]+s\)!";

/// Outcome of waiting for readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// A line matched the readiness pattern.
    Ready,
    /// The deadline passed first.
    TimedOut,
    /// The stream ended (or failed) before any line matched.
    Closed,
}

/// Watches output lines for the readiness pattern.
#[derive(Debug, Clone)]
pub struct ReadinessDetector {
    pattern: Regex,
    timeout: Duration,
}

impl ReadinessDetector {
    /// Detector for the default readiness line.
    pub fn new(timeout: Duration) -> Result<Self, regex::Error> {
        Self::with_pattern(READY_PATTERN, timeout)
    }

    /// Detector for a custom readiness pattern.
    pub fn with_pattern(pattern: &str, timeout: Duration) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
            timeout,
        })
    }

    /// Whether `line` announces readiness.
    pub fn is_ready_line(&self, line: &str) -> bool {
        self.pattern.is_match(line)
    }

    /// Consume lines until one matches, the stream ends, or the timeout
    /// expires. Lines after the matching one are left unread.
    pub async fn wait<S>(&self, mut lines: S) -> Readiness
    where
        S: Stream<Item = io::Result<String>> + Unpin,
    {
        let scan = async {
            while let Some(line) = lines.next().await {
                match line {
                    Ok(line) if self.is_ready_line(&line) => return Readiness::Ready,
                    Ok(_) => {}
                    Err(_) => return Readiness::Closed,
                }
            }
            Readiness::Closed
        };

        tokio::time::timeout(self.timeout, scan)
            .await
            .unwrap_or(Readiness::TimedOut)
    }
}

/// Lazily read lines from `reader`, one read per poll.
pub fn line_stream<R>(reader: &mut R) -> impl Stream<Item = io::Result<String>> + Unpin + '_
where
    R: AsyncBufRead + Unpin,
{
    Box::pin(stream::unfold(reader, |reader| async move {
        let mut line = String::new();
        match reader.read_line(&mut line).await {
            Ok(0) => None,
            Ok(_) => {
                let trimmed = line.trim_end_matches(['\n', '\r']).to_string();
                Some((Ok(trimmed), reader))
            }
            Err(e) => Some((Err(e), reader)),
        }
    }))
}
