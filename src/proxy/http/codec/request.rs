use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail, ensure};
use http::{Method, Version};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::time::Instant;
use tracing::debug;

use crate::proxy::forward_error::{IoTimeout, MalformedRequest};

use super::headers::{HeaderParser, HeaderSet};
use super::line::{read_line_with_deadline, trim_line_ending};

const RECOGNISED_METHODS: &[Method] = &[
    Method::GET,
    Method::HEAD,
    Method::POST,
    Method::PUT,
    Method::DELETE,
    Method::OPTIONS,
    Method::TRACE,
    Method::PATCH,
];

/// Whether `bytes` can be the beginning of a request line: a recognised method followed by a
/// space, or a prefix of one when the bytes end before the space.
pub(crate) fn starts_request_line(bytes: &[u8]) -> bool {
    match bytes.iter().position(|byte| *byte == b' ') {
        Some(end) => RECOGNISED_METHODS
            .iter()
            .any(|method| method.as_str().as_bytes() == &bytes[..end]),
        None => {
            !bytes.is_empty()
                && RECOGNISED_METHODS
                    .iter()
                    .any(|method| method.as_str().as_bytes().starts_with(bytes))
        }
    }
}

#[derive(Debug)]
pub(crate) struct RequestHead {
    pub method: Method,
    pub target: String,
    pub version: Version,
    pub headers: HeaderSet,
    pub head_bytes: usize,
}

impl RequestHead {
    pub fn version_label(&self) -> &'static str {
        if self.version == Version::HTTP_10 {
            "HTTP/1.0"
        } else {
            "HTTP/1.1"
        }
    }
}

/// Reads the next request head from a client connection.
///
/// Returns `Ok(None)` when the client stays idle past `idle_timeout` or closes the connection
/// between requests. Syntax errors carry [`MalformedRequest`] context; header-read timeouts stay
/// [`IoTimeout`] so the caller can tell a slow client from a broken one.
pub(crate) async fn read_request_head<S>(
    reader: &mut BufReader<S>,
    peer: SocketAddr,
    idle_timeout: Duration,
    header_timeout: Duration,
    max_header_bytes: usize,
) -> Result<Option<RequestHead>>
where
    S: AsyncRead + Unpin,
{
    let available = match tokio::time::timeout(idle_timeout, reader.fill_buf()).await {
        Ok(Ok(buf)) => buf,
        Ok(Err(err)) => {
            return Err(err).with_context(|| format!("waiting for request data from {peer}"));
        }
        Err(_) => return Ok(None),
    };
    if available.is_empty() {
        return Ok(None);
    }

    let deadline = Instant::now() + header_timeout;
    parse_request_head(reader, peer, deadline, max_header_bytes)
        .await
        .map_err(|err| {
            if err.is::<IoTimeout>() {
                err
            } else {
                err.context(MalformedRequest)
            }
        })
}

async fn parse_request_head<S>(
    reader: &mut BufReader<S>,
    peer: SocketAddr,
    deadline: Instant,
    max_header_bytes: usize,
) -> Result<Option<RequestHead>>
where
    S: AsyncRead + Unpin,
{
    let mut line = String::new();
    let request_line_bytes =
        read_line_with_deadline(reader, &mut line, deadline, peer, max_header_bytes).await?;
    if request_line_bytes == 0 {
        debug!(peer = %peer, "connection closed before request line");
        return Ok(None);
    }
    let (method, target, version) = parse_request_line(trim_line_ending(&line))?;

    let remaining = max_header_bytes
        .checked_sub(request_line_bytes)
        .ok_or_else(|| anyhow!("request headers exceed configured limit"))?;
    ensure!(remaining > 0, "request headers exceed configured limit");
    let mut parser = HeaderParser::new(remaining);
    loop {
        let read = read_line_with_deadline(reader, &mut line, deadline, peer, remaining).await?;
        if read == 0 {
            bail!("connection closed while reading request headers from {peer}");
        }
        if !parser
            .push_line(&line)
            .with_context(|| format!("invalid header from {peer}"))?
        {
            break;
        }
    }
    let head_bytes = request_line_bytes + parser.total_bytes();

    Ok(Some(RequestHead {
        method,
        target,
        version,
        headers: parser.finish(),
        head_bytes,
    }))
}

pub(crate) fn parse_request_line(line: &str) -> Result<(Method, String, Version)> {
    ensure!(!line.is_empty(), "empty request line");
    let mut parts = line.split(' ');
    let method_str = parts
        .next()
        .filter(|part| !part.is_empty())
        .ok_or_else(|| anyhow!("malformed request line: missing method"))?;
    let target = parts
        .next()
        .filter(|part| !part.is_empty())
        .ok_or_else(|| anyhow!("malformed request line: missing target"))?;
    let version = parts
        .next()
        .filter(|part| !part.is_empty())
        .ok_or_else(|| anyhow!("malformed request line: missing version"))?;
    if parts.next().is_some() {
        bail!("malformed request line: unexpected data");
    }

    let version = match version {
        "HTTP/1.1" => Version::HTTP_11,
        "HTTP/1.0" => Version::HTTP_10,
        other => bail!("invalid HTTP version '{other}'"),
    };

    let method = Method::from_bytes(method_str.as_bytes())
        .with_context(|| format!("invalid method '{method_str}'"))?;
    if method == Method::CONNECT {
        bail!("CONNECT tunnels are not supported");
    }
    ensure!(
        RECOGNISED_METHODS.contains(&method),
        "unrecognised method '{method_str}'"
    );

    Ok((method, target.to_string(), version))
}
