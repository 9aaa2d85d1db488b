//! Client for the VM's human monitor socket.
//!
//! The monitor listens on `127.0.0.1:<monitor_port>` (see the `-monitor`
//! argument segment). Every exchange ends with the `(qemu) ` prompt, which
//! has no trailing newline, so replies are read until the buffer ends with
//! it.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::MonitorError;
use crate::vm::slots::{BootSlot, BootSlots};

const PROMPT: &[u8] = b"(qemu) ";
const MAX_REPLY_BYTES: usize = 1_048_576;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// One open monitor session.
#[derive(Debug)]
pub struct MonitorClient {
    stream: TcpStream,
    timeout: Duration,
}

impl MonitorClient {
    /// Connects to the monitor on the loopback interface.
    pub async fn connect_local(port: u16) -> Result<Self, MonitorError> {
        Self::connect(SocketAddr::from((Ipv4Addr::LOCALHOST, port))).await
    }

    /// Connects and waits for the first prompt.
    pub async fn connect(addr: SocketAddr) -> Result<Self, MonitorError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| MonitorError::Connect {
                addr: addr.to_string(),
                source,
            })?;
        let mut client = Self {
            stream,
            timeout: DEFAULT_TIMEOUT,
        };
        let banner = client.read_reply("<banner>").await?;
        debug!(addr = %addr, banner = %banner.trim(), "connected to VM monitor");
        Ok(client)
    }

    /// Bounds how long each command may take to return to the prompt.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Runs one monitor command and returns its output without the echo or
    /// the trailing prompt.
    pub async fn command(&mut self, text: &str) -> Result<String, MonitorError> {
        debug!(command = text, "monitor command");
        self.stream.write_all(text.as_bytes()).await?;
        self.stream.write_all(b"\r\n").await?;

        let reply = self.read_reply(text).await?;
        let output = strip_echo(&reply, text);
        if let Some(line) = output.lines().find(|l| l.trim_start().starts_with("Error")) {
            return Err(MonitorError::Rejected {
                command: text.to_string(),
                output: line.trim().to_string(),
            });
        }
        Ok(output)
    }

    /// Snapshots the running VM under `tag`.
    pub async fn save_state(&mut self, tag: &str) -> Result<(), MonitorError> {
        self.command(&format!("savevm {tag}")).await?;
        info!(tag, "VM state saved");
        Ok(())
    }

    /// Restores the snapshot `tag` and resumes execution.
    pub async fn load_state(&mut self, tag: &str) -> Result<(), MonitorError> {
        self.command(&format!("loadvm {tag}")).await?;
        self.command("c").await?;
        info!(tag, "VM state restored");
        Ok(())
    }

    /// Saves into the inactive instant-boot slot, then makes it current.
    ///
    /// The marker is left untouched when the save fails.
    pub async fn background_save(&mut self, slots: &BootSlots) -> Result<BootSlot, MonitorError> {
        let next = slots.next()?;
        if let Err(e) = self.save_state(&next.tag()).await {
            warn!(slot = %next, "instant-boot save failed; keeping previous slot");
            return Err(e);
        }
        slots.commit(next)?;
        Ok(next)
    }

    async fn read_reply(&mut self, command: &str) -> Result<String, MonitorError> {
        match timeout(self.timeout, read_until_prompt(&mut self.stream)).await {
            Ok(reply) => reply,
            Err(_) => Err(MonitorError::Timeout {
                command: command.to_string(),
                seconds: self.timeout.as_secs(),
            }),
        }
    }
}

async fn read_until_prompt(stream: &mut TcpStream) -> Result<String, MonitorError> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    while !buf.ends_with(PROMPT) {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(MonitorError::Closed);
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.len() > MAX_REPLY_BYTES {
            return Err(MonitorError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "monitor reply exceeds 1 MiB",
            )));
        }
    }
    buf.truncate(buf.len() - PROMPT.len());
    Ok(strip_escapes(&String::from_utf8_lossy(&buf)))
}

/// Removes ANSI CSI sequences the monitor's line editor emits.
fn strip_escapes(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\x1b' {
            out.push(c);
            continue;
        }
        if chars.next() == Some('[') {
            for c in chars.by_ref() {
                if ('\x40'..='\x7e').contains(&c) {
                    break;
                }
            }
        }
    }
    out
}

/// Drops the echoed command line, if the monitor echoed it.
fn strip_echo(reply: &str, command: &str) -> String {
    let reply = reply.replace('\r', "");
    match reply.split_once('\n') {
        Some((first, rest)) if first.trim() == command => rest.to_string(),
        _ => reply,
    }
}
