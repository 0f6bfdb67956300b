use std::time::Duration as StdDuration;

use anyhow::{Context, Result, anyhow, bail};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::time::timeout;

const READ_TIMEOUT: StdDuration = StdDuration::from_secs(5);

/// A response as seen on the wire, body already de-chunked.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub head: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn header_all(&self, name: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
            .collect()
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }
}

async fn read_line<S>(reader: &mut BufReader<S>) -> Result<String>
where
    S: AsyncRead + Unpin,
{
    let mut line = String::new();
    let read = timeout(READ_TIMEOUT, reader.read_line(&mut line))
        .await
        .context("timed out reading line")??;
    if read == 0 {
        bail!("connection closed while reading line");
    }
    Ok(line)
}

/// Reads one complete response. `head_request` suppresses body reading as for a HEAD request.
pub async fn read_response<S>(reader: &mut BufReader<S>, head_request: bool) -> Result<RawResponse>
where
    S: AsyncRead + Unpin,
{
    let status_line = read_line(reader).await?;
    let status = status_line
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| anyhow!("missing status code in '{status_line}'"))?
        .parse::<u16>()
        .map_err(|err| anyhow!("invalid status code: {err}"))?;

    let mut head = status_line.clone();
    let mut headers = Vec::new();
    loop {
        let line = read_line(reader).await?;
        head.push_str(&line);
        if line == "\r\n" {
            break;
        }
        let (name, value) = line
            .trim_end()
            .split_once(':')
            .ok_or_else(|| anyhow!("malformed header line '{line}'"))?;
        headers.push((name.to_string(), value.trim().to_string()));
    }

    let mut response = RawResponse {
        status,
        head,
        headers,
        body: Vec::new(),
    };
    if head_request || status == 204 || status == 304 || (100..200).contains(&status) {
        return Ok(response);
    }

    if response
        .header("transfer-encoding")
        .is_some_and(|value| value.eq_ignore_ascii_case("chunked"))
    {
        loop {
            let size_line = read_line(reader).await?;
            let size = usize::from_str_radix(size_line.trim().split(';').next().unwrap_or(""), 16)
                .with_context(|| format!("bad chunk size '{size_line}'"))?;
            if size == 0 {
                while read_line(reader).await? != "\r\n" {}
                break;
            }
            let mut chunk = vec![0u8; size + 2];
            timeout(READ_TIMEOUT, reader.read_exact(&mut chunk)).await??;
            response.body.extend_from_slice(&chunk[..size]);
        }
    } else if let Some(length) = response.header("content-length") {
        let length: usize = length.parse()?;
        let mut body = vec![0u8; length];
        timeout(READ_TIMEOUT, reader.read_exact(&mut body)).await??;
        response.body = body;
    } else {
        timeout(READ_TIMEOUT, reader.read_to_end(&mut response.body)).await??;
    }
    Ok(response)
}

pub async fn read_until_double_crlf<S>(stream: &mut S) -> Result<String>
where
    S: AsyncRead + Unpin,
{
    let mut buffer = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        let bytes = stream.read(&mut byte).await?;
        if bytes == 0 {
            break;
        }
        buffer.extend_from_slice(&byte);
        if buffer.ends_with(b"\r\n\r\n") {
            break;
        }
    }
    String::from_utf8(buffer).context("invalid UTF-8 response")
}
