// Copyright (C) 2025 Wurstmineberg
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Command channel - console command transports.

pub mod rcon;
pub mod relay;
mod traits;

use std::sync::Arc;
use std::time::Duration;

pub use rcon::RconChannel;
pub use relay::RelayChannel;
pub use traits::*;

use crate::config::{ChannelKind, InstanceSettings};

/// Build the channel selected by an instance's settings.
pub fn for_instance(
    settings: &InstanceSettings,
    relay_reply_delay: Duration,
) -> Arc<dyn CommandChannel> {
    match settings.channel {
        ChannelKind::Rcon => Arc::new(RconChannel::new(
            settings.rcon_port,
            settings.rcon_password.clone(),
        )),
        ChannelKind::Relay => Arc::new(RelayChannel::new(
            settings.paths.socket.clone(),
            settings.latest_log(),
            relay_reply_delay,
        )),
    }
}
