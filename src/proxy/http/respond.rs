use std::time::Duration;

use anyhow::Result;
use http::{Method, StatusCode};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::io_util::write_all_with_timeout;
use crate::util::timeout_with_context;

/// Writes a complete synthesized response: `Content-Length`, `Connection: close` and a plain
/// text body. Answers to `HEAD` keep the length but carry no body. Returns the number of bytes
/// written.
pub(crate) async fn send_response<S>(
    stream: &mut S,
    method: Option<&Method>,
    status: StatusCode,
    body: &str,
    timeout_dur: Duration,
) -> Result<usize>
where
    S: AsyncWrite + Unpin,
{
    let reason = status.canonical_reason().unwrap_or("Unknown");
    let mut message = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nConnection: close\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n",
        status.as_u16(),
        reason,
        body.len()
    )
    .into_bytes();
    if method != Some(&Method::HEAD) {
        message.extend_from_slice(body.as_bytes());
    }
    write_all_with_timeout(stream, &message, timeout_dur, "writing error response").await?;
    timeout_with_context(timeout_dur, stream.flush(), "flushing error response").await?;
    Ok(message.len())
}

/// Body text for a synthesized status.
pub(crate) fn status_body(status: StatusCode) -> String {
    format!(
        "{} {}\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("Error")
    )
}

pub(crate) async fn shutdown_stream<S>(stream: &mut S, timeout_dur: Duration) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    timeout_with_context(
        timeout_dur,
        stream.shutdown(),
        "shutting down client stream",
    )
    .await
}
