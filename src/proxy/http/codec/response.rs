use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail, ensure};
use http::{StatusCode, Version};
use tokio::io::{AsyncRead, BufReader};
use tokio::time::Instant;
use tracing::warn;

use crate::proxy::forward_error::{
    IoTimeout, OriginDisconnected, OriginNoResponse, OriginProtocolError,
};

use super::headers::{FramingHeaders, HeaderParser, HeaderSet};
use super::line::{read_line_with_deadline, trim_line_ending};

#[derive(Clone, Debug)]
pub(crate) struct ResponseHead {
    pub version: Version,
    pub status: StatusCode,
    pub reason: String,
    pub headers: HeaderSet,
    pub framing: FramingHeaders,
    pub connection_close: bool,
}

impl ResponseHead {
    /// Informational responses that precede the final one. `101` is final: it ends HTTP on the
    /// connection.
    pub fn is_interim(&self) -> bool {
        self.status.is_informational() && self.status != StatusCode::SWITCHING_PROTOCOLS
    }

    pub fn reason_phrase(&self) -> &str {
        if self.reason.is_empty() {
            self.status.canonical_reason().unwrap_or("")
        } else {
            &self.reason
        }
    }
}

/// Serializes a status line plus an already-rewritten header set.
pub(crate) fn encode_response_head(status: StatusCode, reason: &str, headers: &HeaderSet) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(256);
    buffer.extend_from_slice(b"HTTP/1.1 ");
    buffer.extend_from_slice(status.as_str().as_bytes());
    buffer.push(b' ');
    buffer.extend_from_slice(reason.as_bytes());
    buffer.extend_from_slice(b"\r\n");
    headers.encode_into(&mut buffer);
    buffer.extend_from_slice(b"\r\n");
    buffer
}

/// Reads one response head from an origin.
///
/// Failures are tagged for the error mapper: nothing received at all is [`OriginNoResponse`], a
/// head cut short is [`OriginDisconnected`], and anything unparsable is [`OriginProtocolError`].
pub(crate) async fn read_response_head<S>(
    reader: &mut BufReader<S>,
    timeout_dur: Duration,
    peer: SocketAddr,
    max_header_bytes: usize,
) -> Result<ResponseHead>
where
    S: AsyncRead + Unpin,
{
    ensure!(
        max_header_bytes > 0,
        "max response header size must be greater than zero"
    );
    let deadline = Instant::now() + timeout_dur;
    let mut status_line = String::new();

    let bytes = read_line_with_deadline(reader, &mut status_line, deadline, peer, max_header_bytes)
        .await
        .map_err(|err| tag_read_error(err, OriginNoResponse))?;
    if bytes == 0 {
        return Err(anyhow!(
            "origin {peer} closed connection before sending status line"
        )
        .context(OriginNoResponse));
    }
    let (version, status, reason) =
        parse_status_line(trim_line_ending(&status_line)).context(OriginProtocolError)?;

    let remaining = max_header_bytes
        .checked_sub(bytes)
        .filter(|remaining| *remaining > 0)
        .ok_or_else(|| {
            anyhow!("origin response headers exceed configured limit").context(OriginProtocolError)
        })?;
    let mut parser = HeaderParser::new(remaining);
    let mut header_line = String::new();
    loop {
        let read = read_line_with_deadline(reader, &mut header_line, deadline, peer, remaining)
            .await
            .map_err(|err| tag_read_error(err, OriginDisconnected))?;
        if read == 0 {
            return Err(
                anyhow!("origin {peer} closed connection during headers").context(OriginDisconnected)
            );
        }
        let more = parser
            .push_line(&header_line)
            .with_context(|| format!("invalid header from origin {peer}"))
            .context(OriginProtocolError)?;
        if !more {
            break;
        }
    }
    let headers = parser.finish();

    let framing = match headers.validate_framing() {
        Ok(framing) => framing,
        Err(err) => {
            warn!(peer = %peer, error = %err, "rejecting origin response with invalid framing");
            return Err(err.context(OriginProtocolError));
        }
    };

    let connection_close = if headers.has_token("connection", "close") {
        true
    } else if version == Version::HTTP_10 {
        !headers.has_token("connection", "keep-alive")
    } else {
        false
    };

    Ok(ResponseHead {
        version,
        status,
        reason,
        headers,
        framing,
        connection_close,
    })
}

fn tag_read_error<C>(err: anyhow::Error, tag: C) -> anyhow::Error
where
    C: std::fmt::Display + std::fmt::Debug + Send + Sync + 'static,
{
    if err.is::<IoTimeout>() {
        err
    } else if err.to_string().contains("exceeds configured limit") {
        err.context(OriginProtocolError)
    } else {
        err.context(tag)
    }
}

pub(crate) fn parse_status_line(value: &str) -> Result<(Version, StatusCode, String)> {
    let mut parts = value.splitn(3, ' ');
    let version = parts
        .next()
        .filter(|part| !part.is_empty())
        .ok_or_else(|| anyhow!("origin status line missing HTTP version"))?;
    let status = parts
        .next()
        .filter(|part| !part.is_empty())
        .ok_or_else(|| anyhow!("origin status line missing status code"))?;
    let reason = parts.next().unwrap_or("").trim().to_string();

    let version = match version {
        "HTTP/1.1" => Version::HTTP_11,
        "HTTP/1.0" => Version::HTTP_10,
        other => bail!("unsupported origin HTTP version '{other}'"),
    };

    ensure!(
        status.len() == 3 && status.bytes().all(|b| b.is_ascii_digit()),
        "invalid origin status code '{status}'"
    );
    let status_code: u16 = status
        .parse()
        .with_context(|| format!("invalid origin status code '{status}'"))?;
    let status = StatusCode::from_u16(status_code)
        .map_err(|_| anyhow!("unsupported origin status code '{status_code}'"))?;

    Ok((version, status, reason))
}
