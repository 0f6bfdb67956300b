use std::pin::pin;
use std::time::Duration;

use anyhow::Result;
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::io_util::shutdown_with_timeout;
use crate::util::timeout_with_context;

use super::body::BODY_BUFFER_SIZE;

const OPCODE_CLOSE: u8 = 0x8;

/// Follows WebSocket frame boundaries in one direction of a relayed stream, without buffering
/// payload, to notice when a close frame has passed through.
#[derive(Debug, Default)]
pub(crate) struct FrameScanner {
    header: [u8; 14],
    header_len: usize,
    payload_remaining: u64,
    opcode: u8,
    close_seen: bool,
}

impl FrameScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn close_seen(&self) -> bool {
        self.close_seen
    }

    fn header_needed(&self) -> usize {
        if self.header_len < 2 {
            return 2;
        }
        let extended = match self.header[1] & 0x7f {
            126 => 2,
            127 => 8,
            _ => 0,
        };
        let mask = if self.header[1] & 0x80 != 0 { 4 } else { 0 };
        2 + extended + mask
    }

    fn payload_len(&self) -> u64 {
        match self.header[1] & 0x7f {
            126 => u64::from(u16::from_be_bytes([self.header[2], self.header[3]])),
            127 => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&self.header[2..10]);
                u64::from_be_bytes(raw)
            }
            len => u64::from(len),
        }
    }

    /// Consumes relayed bytes. Returns true once a complete close frame has been seen.
    pub fn feed(&mut self, mut data: &[u8]) -> bool {
        while !data.is_empty() && !self.close_seen {
            if self.payload_remaining > 0 {
                let skip = self.payload_remaining.min(data.len() as u64);
                data = &data[skip as usize..];
                self.payload_remaining -= skip;
                if self.payload_remaining == 0 && self.opcode == OPCODE_CLOSE {
                    self.close_seen = true;
                }
                continue;
            }

            self.header[self.header_len] = data[0];
            self.header_len += 1;
            data = &data[1..];
            if self.header_len < self.header_needed() {
                continue;
            }

            self.opcode = self.header[0] & 0x0f;
            self.payload_remaining = self.payload_len();
            self.header_len = 0;
            if self.payload_remaining == 0 && self.opcode == OPCODE_CLOSE {
                self.close_seen = true;
            }
        }
        self.close_seen
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct UpgradeStats {
    pub client_to_origin: u64,
    pub origin_to_client: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HalfEnd {
    Eof,
    CloseFrame,
}

/// Relays bytes in both directions after a `101 Switching Protocols`. For WebSocket the relay
/// ends once close frames passed both ways or either side hits EOF; other protocols run until
/// both sides have closed. Both streams are shut down before returning.
pub(crate) async fn relay_upgraded<C, O>(
    client: &mut C,
    origin: &mut O,
    websocket: bool,
    idle_timeout: Duration,
) -> Result<UpgradeStats>
where
    C: AsyncRead + AsyncWrite + Unpin,
    O: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_reader, mut client_writer) = io::split(client);
    let (mut origin_reader, mut origin_writer) = io::split(origin);
    let mut stats = UpgradeStats::default();

    let outcome = {
        let mut upstream = pin!(transfer_half(
            &mut client_reader,
            &mut origin_writer,
            websocket.then(FrameScanner::new),
            idle_timeout,
            "client",
            "origin",
            &mut stats.client_to_origin,
        ));
        let mut downstream = pin!(transfer_half(
            &mut origin_reader,
            &mut client_writer,
            websocket.then(FrameScanner::new),
            idle_timeout,
            "origin",
            "client",
            &mut stats.origin_to_client,
        ));
        let mut up_end = None;
        let mut down_end = None;
        loop {
            if up_end.is_some() && down_end.is_some() {
                break Ok(());
            }
            let end = tokio::select! {
                result = &mut upstream, if up_end.is_none() => result.map(|end| {
                    up_end = Some(end);
                    end
                }),
                result = &mut downstream, if down_end.is_none() => result.map(|end| {
                    down_end = Some(end);
                    end
                }),
            };
            match end {
                Ok(HalfEnd::Eof) if websocket => break Ok(()),
                Ok(_) => {}
                Err(err) => break Err(err),
            }
        }
    };

    if let Err(err) =
        shutdown_with_timeout(&mut client_writer, idle_timeout, "closing upgraded client stream").await
    {
        debug!(error = %err, "client shutdown after upgrade relay failed");
    }
    if let Err(err) =
        shutdown_with_timeout(&mut origin_writer, idle_timeout, "closing upgraded origin stream").await
    {
        debug!(error = %err, "origin shutdown after upgrade relay failed");
    }

    outcome.map(|()| stats)
}

async fn transfer_half<R, W>(
    reader: &mut R,
    writer: &mut W,
    mut scanner: Option<FrameScanner>,
    idle_timeout: Duration,
    read_label: &str,
    write_label: &str,
    transferred: &mut u64,
) -> Result<HalfEnd>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = [0u8; BODY_BUFFER_SIZE];
    loop {
        let read = timeout_with_context(
            idle_timeout,
            reader.read(&mut buffer),
            format!("reading from {read_label} during upgrade relay"),
        )
        .await?;
        if read == 0 {
            if scanner.is_none() {
                shutdown_with_timeout(
                    writer,
                    idle_timeout,
                    &format!("shutting down {write_label} during upgrade relay"),
                )
                .await?;
            }
            return Ok(HalfEnd::Eof);
        }

        timeout_with_context(
            idle_timeout,
            writer.write_all(&buffer[..read]),
            format!("forwarding to {write_label} during upgrade relay"),
        )
        .await?;
        timeout_with_context(
            idle_timeout,
            writer.flush(),
            format!("flushing {write_label} during upgrade relay"),
        )
        .await?;
        *transferred = transferred.saturating_add(read as u64);

        if let Some(scanner) = scanner.as_mut()
            && scanner.feed(&buffer[..read])
        {
            debug!(from = read_label, "websocket close frame relayed");
            return Ok(HalfEnd::CloseFrame);
        }
    }
}
