// Copyright (C) 2025 Wurstmineberg
// SPDX-License-Identifier: AGPL-3.0-or-later
//! RCON transport.
//!
//! Wire format per packet, all integers little-endian:
//!
//! ```text
//! ┌──────────┬──────────┬──────────┬───────────────┬──────┐
//! │ len: i32 │ id: i32  │ type: i32│ payload bytes │ 0 0  │
//! └──────────┴──────────┴──────────┴───────────────┴──────┘
//! ```
//!
//! `len` counts everything after itself. Login is type 3, commands are
//! type 2, replies are type 0. A login reply carrying id -1 means the
//! password was rejected. Each command opens a fresh authenticated
//! connection.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use super::traits::{ChannelError, CommandChannel, format_command};

const PACKET_LOGIN: i32 = 3;
const PACKET_COMMAND: i32 = 2;
const PACKET_AUTH_RESPONSE: i32 = 2;
const PACKET_RESPONSE: i32 = 0;

const LOGIN_ID: i32 = 1;
const COMMAND_ID: i32 = 2;

const MIN_PACKET_LEN: i32 = 10;
const MAX_PACKET_LEN: i32 = 4096 + MIN_PACKET_LEN;

/// One RCON packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Request id echoed by the response; -1 marks a rejected login.
    pub id: i32,
    /// Packet type.
    pub kind: i32,
    /// Command or reply text.
    pub payload: String,
}

impl Packet {
    /// Packet with the given fields.
    pub fn new(id: i32, kind: i32, payload: impl Into<String>) -> Self {
        Self {
            id,
            kind,
            payload: payload.into(),
        }
    }

    /// Encode the packet including its length prefix.
    pub fn encode(&self) -> Vec<u8> {
        let body = self.payload.as_bytes();
        let len = (body.len() + MIN_PACKET_LEN as usize) as i32;
        let mut buf = Vec::with_capacity(body.len() + 14);
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(&self.id.to_le_bytes());
        buf.extend_from_slice(&self.kind.to_le_bytes());
        buf.extend_from_slice(body);
        buf.extend_from_slice(&[0, 0]);
        buf
    }

    /// Read one packet from `reader`.
    pub async fn read_from<R>(reader: &mut R) -> Result<Self, ChannelError>
    where
        R: AsyncRead + Unpin,
    {
        let len = reader.read_i32_le().await?;
        if !(MIN_PACKET_LEN..=MAX_PACKET_LEN).contains(&len) {
            return Err(ChannelError::Protocol(format!("invalid packet length {len}")));
        }
        let mut buf = vec![0u8; len as usize];
        reader.read_exact(&mut buf).await?;

        let id = i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let kind = i32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let payload = String::from_utf8_lossy(&buf[8..buf.len() - 2]).into_owned();
        Ok(Self { id, kind, payload })
    }
}

/// Command channel speaking RCON to a local port.
#[derive(Debug, Clone)]
pub struct RconChannel {
    host: String,
    port: u16,
    password: Option<String>,
    timeout: Duration,
}

impl RconChannel {
    /// Channel to the RCON port on localhost.
    pub fn new(port: u16, password: Option<String>) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port,
            password,
            timeout: Duration::from_secs(10),
        }
    }

    /// Override the per-command I/O timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn connect(&self) -> Result<TcpStream, ChannelError> {
        TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(ChannelError::from_connect)
    }

    async fn login(&self, stream: &mut TcpStream, password: &str) -> Result<(), ChannelError> {
        stream
            .write_all(&Packet::new(LOGIN_ID, PACKET_LOGIN, password).encode())
            .await?;
        loop {
            let reply = Packet::read_from(stream).await?;
            // Some servers send an empty response packet ahead of the auth reply.
            if reply.kind != PACKET_AUTH_RESPONSE {
                continue;
            }
            if reply.id == -1 {
                return Err(ChannelError::AuthRejected);
            }
            return Ok(());
        }
    }

    async fn exchange(&self, password: &str, line: &str) -> Result<String, ChannelError> {
        let mut stream = self.connect().await?;
        self.login(&mut stream, password).await?;
        stream
            .write_all(&Packet::new(COMMAND_ID, PACKET_COMMAND, line).encode())
            .await?;
        let reply = Packet::read_from(&mut stream).await?;
        if reply.kind != PACKET_RESPONSE {
            return Err(ChannelError::Protocol(format!(
                "unexpected packet type {}",
                reply.kind
            )));
        }
        Ok(reply.payload)
    }
}

#[async_trait]
impl CommandChannel for RconChannel {
    fn transport(&self) -> &'static str {
        "rcon"
    }

    fn check_credentials(&self) -> Result<(), ChannelError> {
        match self.password {
            Some(_) => Ok(()),
            None => Err(ChannelError::MissingCredential),
        }
    }

    async fn send(&self, command: &str, args: &[String]) -> Result<String, ChannelError> {
        let password = self
            .password
            .as_deref()
            .ok_or(ChannelError::MissingCredential)?;
        let line = format_command(command, args);
        debug!(port = self.port, command = %line, "Sending RCON command");

        tokio::time::timeout(self.timeout, self.exchange(password, &line))
            .await
            .map_err(|_| ChannelError::Unreachable("RCON request timed out".to_string()))?
    }

    async fn is_reachable(&self) -> bool {
        self.connect().await.is_ok()
    }
}
