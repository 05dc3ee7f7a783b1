// Copyright (C) 2025 Wurstmineberg
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Human-readable progress reporting.
//!
//! Every message goes to `tracing` tagged with the instance name. An optional
//! sink receives the same text, which is how the CLI prints progress lines.

use std::fmt;
use std::sync::Arc;

use tracing::{info, warn};

/// Callback receiving progress lines.
pub type ProgressSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Progress reporter scoped to one instance.
#[derive(Clone)]
pub struct Progress {
    instance: Arc<str>,
    sink: Option<ProgressSink>,
}

impl Progress {
    /// Reporter that only logs.
    pub fn new(instance: &str) -> Self {
        Self {
            instance: Arc::from(instance),
            sink: None,
        }
    }

    /// Also deliver messages to `sink`.
    pub fn with_sink(mut self, sink: ProgressSink) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Report a step.
    pub fn report(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        info!(instance = %self.instance, "{}", message);
        self.deliver(message);
    }

    /// Report a problem that does not abort the operation.
    pub fn warn(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        warn!(instance = %self.instance, "{}", message);
        self.deliver(message);
    }

    fn deliver(&self, message: &str) {
        if let Some(sink) = &self.sink {
            sink(message);
        }
    }
}

impl fmt::Debug for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Progress")
            .field("instance", &self.instance)
            .field("sink", &self.sink.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_sink_receives_messages() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let captured = seen.clone();
        let progress = Progress::new("main").with_sink(Arc::new(move |line: &str| {
            captured.lock().unwrap().push(line.to_string());
        }));

        progress.report("Starting");
        progress.warn("Careful");

        assert_eq!(*seen.lock().unwrap(), vec!["Starting", "Careful"]);
    }
}
