use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use bytes::{Bytes, BytesMut};
use http::{Method, StatusCode};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, BufReader};

use crate::io_util::{flush_with_timeout, write_all_with_timeout};
use crate::proxy::forward_error::{
    ClientDisconnected, MalformedRequest, OriginDisconnected, OriginProtocolError,
    OriginWriteFailed,
};
use crate::proxy::http::codec::{FramingHeaders, ResponseHead, read_line_with_timeout};
use crate::util::timeout_with_context;

pub(crate) const BODY_BUFFER_SIZE: usize = 8192;
const MAX_CHUNK_LINE_LENGTH: usize = 8192;
const MAX_TRAILER_BYTES: usize = 16 * 1024;

/// How the body of one message on one leg is delimited.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Framing {
    Empty,
    Length(u64),
    Chunked,
    UntilClose,
}

impl Framing {
    pub(crate) fn for_request(headers: &FramingHeaders) -> Self {
        if headers.chunked {
            Framing::Chunked
        } else {
            match headers.content_length {
                Some(0) | None => Framing::Empty,
                Some(length) => Framing::Length(length),
            }
        }
    }

    pub(crate) fn for_response(method: &Method, head: &ResponseHead) -> Self {
        if method == Method::HEAD
            || head.status.is_informational()
            || head.status == StatusCode::NO_CONTENT
            || head.status == StatusCode::NOT_MODIFIED
        {
            return Framing::Empty;
        }
        if head.framing.chunked {
            return Framing::Chunked;
        }
        match head.framing.content_length {
            Some(0) => Framing::Empty,
            Some(length) => Framing::Length(length),
            None => Framing::UntilClose,
        }
    }

    /// Whether the end of the body can be found without closing the connection.
    pub fn is_self_delimiting(self) -> bool {
        !matches!(self, Framing::UntilClose)
    }
}

/// Which way a body flows; decides how read and write failures are reported.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BodyDirection {
    Request,
    Response,
}

impl BodyDirection {
    fn source(self) -> &'static str {
        match self {
            BodyDirection::Request => "client",
            BodyDirection::Response => "origin",
        }
    }

    fn read_failure(self, err: anyhow::Error) -> anyhow::Error {
        match self {
            BodyDirection::Request => err.context(ClientDisconnected),
            BodyDirection::Response => err.context(OriginDisconnected),
        }
    }

    fn write_failure(self, err: anyhow::Error) -> anyhow::Error {
        match self {
            BodyDirection::Request => err.context(OriginWriteFailed),
            BodyDirection::Response => err.context(ClientDisconnected),
        }
    }

    fn truncated(self, detail: String) -> anyhow::Error {
        match self {
            BodyDirection::Request => anyhow!(detail).context(MalformedRequest),
            BodyDirection::Response => anyhow!(detail).context(OriginDisconnected),
        }
    }

    fn malformed(self, err: anyhow::Error) -> anyhow::Error {
        match self {
            BodyDirection::Request => err.context(MalformedRequest),
            BodyDirection::Response => err.context(OriginProtocolError),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DecoderState {
    Length { remaining: u64 },
    Chunked { remaining_in_chunk: u64 },
    UntilClose,
    Done,
}

/// Pull-based body decoder: each call yields the next run of payload bytes with framing removed.
pub(crate) struct BodyDecoder {
    state: DecoderState,
    direction: BodyDirection,
    peer: SocketAddr,
    read_timeout: Duration,
    trailers: Vec<String>,
    decoded: u64,
}

impl BodyDecoder {
    pub fn new(
        framing: Framing,
        direction: BodyDirection,
        peer: SocketAddr,
        read_timeout: Duration,
    ) -> Self {
        let state = match framing {
            Framing::Empty | Framing::Length(0) => DecoderState::Done,
            Framing::Length(remaining) => DecoderState::Length { remaining },
            Framing::Chunked => DecoderState::Chunked {
                remaining_in_chunk: 0,
            },
            Framing::UntilClose => DecoderState::UntilClose,
        };
        Self {
            state,
            direction,
            peer,
            read_timeout,
            trailers: Vec::new(),
            decoded: 0,
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == DecoderState::Done
    }

    pub fn direction(&self) -> BodyDirection {
        self.direction
    }

    /// Raw trailer lines (each with its CRLF) seen after the last chunk.
    pub fn trailers(&self) -> &[String] {
        &self.trailers
    }

    pub fn decoded_bytes(&self) -> u64 {
        self.decoded
    }

    /// Reads the next payload bytes into `buf`. `Ok(0)` means the body is complete.
    pub async fn read_data<R>(&mut self, reader: &mut BufReader<R>, buf: &mut [u8]) -> Result<usize>
    where
        R: AsyncRead + Unpin,
    {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            match self.state {
                DecoderState::Done => return Ok(0),
                DecoderState::UntilClose => {
                    let read = self.read_some(reader, buf).await?;
                    if read == 0 {
                        self.state = DecoderState::Done;
                    }
                    self.decoded += read as u64;
                    return Ok(read);
                }
                DecoderState::Length { remaining } => {
                    let to_read = remaining.min(buf.len() as u64) as usize;
                    let read = self.read_some(reader, &mut buf[..to_read]).await?;
                    if read == 0 {
                        return Err(self.direction.truncated(format!(
                            "{} closed the connection with {} of the declared body bytes outstanding",
                            self.direction.source(),
                            remaining
                        )));
                    }
                    let left = remaining - read as u64;
                    self.state = if left == 0 {
                        DecoderState::Done
                    } else {
                        DecoderState::Length { remaining: left }
                    };
                    self.decoded += read as u64;
                    return Ok(read);
                }
                DecoderState::Chunked {
                    remaining_in_chunk: 0,
                } => {
                    let size = self.read_chunk_size(reader).await?;
                    if size == 0 {
                        self.read_trailers(reader).await?;
                        self.state = DecoderState::Done;
                        return Ok(0);
                    }
                    self.state = DecoderState::Chunked {
                        remaining_in_chunk: size,
                    };
                }
                DecoderState::Chunked { remaining_in_chunk } => {
                    let to_read = remaining_in_chunk.min(buf.len() as u64) as usize;
                    let read = self.read_some(reader, &mut buf[..to_read]).await?;
                    if read == 0 {
                        return Err(self.direction.truncated(format!(
                            "{} closed the connection inside a chunk",
                            self.direction.source()
                        )));
                    }
                    let left = remaining_in_chunk - read as u64;
                    if left == 0 {
                        self.read_chunk_terminator(reader).await?;
                    }
                    self.state = DecoderState::Chunked {
                        remaining_in_chunk: left,
                    };
                    self.decoded += read as u64;
                    return Ok(read);
                }
            }
        }
    }

    async fn read_some<R>(&self, reader: &mut BufReader<R>, buf: &mut [u8]) -> Result<usize>
    where
        R: AsyncRead + Unpin,
    {
        timeout_with_context(
            self.read_timeout,
            reader.read(buf),
            format!("reading body from {} {}", self.direction.source(), self.peer),
        )
        .await
        .map_err(|err| self.direction.read_failure(err))
    }

    async fn read_chunk_size<R>(&self, reader: &mut BufReader<R>) -> Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        let mut line = String::new();
        let read = read_line_with_timeout(
            reader,
            &mut line,
            self.read_timeout,
            self.peer,
            MAX_CHUNK_LINE_LENGTH,
        )
        .await
        .map_err(|err| self.direction.read_failure(err))?;
        if read == 0 {
            return Err(self.direction.truncated(format!(
                "{} closed the connection before the next chunk size",
                self.direction.source()
            )));
        }
        parse_chunk_size(&line).map_err(|err| self.direction.malformed(err))
    }

    async fn read_chunk_terminator<R>(&self, reader: &mut BufReader<R>) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut crlf = [0u8; 2];
        let result = timeout_with_context(
            self.read_timeout,
            reader.read_exact(&mut crlf),
            format!("reading chunk terminator from {}", self.peer),
        )
        .await;
        match result {
            Ok(_) if &crlf == b"\r\n" => Ok(()),
            Ok(_) => Err(self
                .direction
                .malformed(anyhow!("invalid chunk terminator from {}", self.peer))),
            Err(err)
                if err
                    .downcast_ref::<std::io::Error>()
                    .is_some_and(|io| io.kind() == std::io::ErrorKind::UnexpectedEof) =>
            {
                Err(self.direction.truncated(format!(
                    "{} closed the connection before the chunk terminator",
                    self.direction.source()
                )))
            }
            Err(err) => Err(self.direction.read_failure(err)),
        }
    }

    async fn read_trailers<R>(&mut self, reader: &mut BufReader<R>) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut total = 0usize;
        let mut line = String::new();
        loop {
            let read = read_line_with_timeout(
                reader,
                &mut line,
                self.read_timeout,
                self.peer,
                MAX_CHUNK_LINE_LENGTH,
            )
            .await
            .map_err(|err| self.direction.read_failure(err))?;
            if read == 0 {
                return Err(self.direction.truncated(format!(
                    "{} closed the connection inside the chunk trailer",
                    self.direction.source()
                )));
            }
            total += read;
            if total > MAX_TRAILER_BYTES {
                return Err(self
                    .direction
                    .malformed(anyhow!("chunk trailer exceeds {MAX_TRAILER_BYTES} bytes")));
            }
            if line.trim_end_matches(['\r', '\n']).is_empty() {
                return Ok(());
            }
            if !line.contains(':') {
                return Err(self
                    .direction
                    .malformed(anyhow!("trailer field missing ':' separator")));
            }
            self.trailers.push(line.clone());
        }
    }
}

fn parse_chunk_size(line: &str) -> Result<u64> {
    let trimmed = line.trim_end_matches(['\r', '\n']);
    let size_str = trimmed
        .split_once(';')
        .map(|(size, _)| size)
        .unwrap_or(trimmed)
        .trim_end_matches([' ', '\t']);
    if size_str.is_empty() || size_str.len() > 16 {
        bail!("invalid chunk size '{size_str}'");
    }
    u64::from_str_radix(size_str, 16).with_context(|| format!("invalid chunk size '{size_str}'"))
}

/// How payload bytes are framed when written to the next hop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BodyEncoder {
    Identity,
    Chunked,
}

impl BodyEncoder {
    pub async fn write_data<W>(
        self,
        writer: &mut W,
        data: &[u8],
        timeout_dur: Duration,
        context: &str,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        if data.is_empty() {
            return Ok(());
        }
        match self {
            BodyEncoder::Identity => write_all_with_timeout(writer, data, timeout_dur, context).await,
            BodyEncoder::Chunked => {
                let mut frame = Vec::with_capacity(data.len() + 20);
                frame.extend_from_slice(format!("{:X}\r\n", data.len()).as_bytes());
                frame.extend_from_slice(data);
                frame.extend_from_slice(b"\r\n");
                write_all_with_timeout(writer, &frame, timeout_dur, context).await
            }
        }
    }

    pub async fn finish<W>(
        self,
        writer: &mut W,
        trailers: &[String],
        timeout_dur: Duration,
        context: &str,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        if self == BodyEncoder::Chunked {
            let mut frame = Vec::from(&b"0\r\n"[..]);
            for trailer in trailers {
                frame.extend_from_slice(trailer.as_bytes());
            }
            frame.extend_from_slice(b"\r\n");
            write_all_with_timeout(writer, &frame, timeout_dur, context).await?;
        }
        flush_with_timeout(writer, timeout_dur, context).await
    }
}

/// Pumps the rest of a body from `reader` to `writer`, re-framing it with `encoder`. Each read is
/// issued only after the previous write completed, so a slow receiver throttles the sender.
pub(crate) async fn relay_body<R, W>(
    reader: &mut BufReader<R>,
    decoder: &mut BodyDecoder,
    writer: &mut W,
    encoder: BodyEncoder,
    write_timeout: Duration,
) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let direction = decoder.direction();
    let context = match direction {
        BodyDirection::Request => "writing request body to origin",
        BodyDirection::Response => "writing response body to client",
    };
    let mut total = 0u64;
    let mut buffer = [0u8; BODY_BUFFER_SIZE];
    loop {
        let read = decoder.read_data(reader, &mut buffer).await?;
        if read == 0 {
            break;
        }
        encoder
            .write_data(writer, &buffer[..read], write_timeout, context)
            .await
            .map_err(|err| direction.write_failure(err))?;
        total = total.saturating_add(read as u64);
    }
    encoder
        .finish(writer, decoder.trailers(), write_timeout, context)
        .await
        .map_err(|err| direction.write_failure(err))?;
    Ok(total)
}

/// Writes bytes that were already decoded (a buffered prefix) through `encoder`.
pub(crate) async fn write_prefix<W>(
    writer: &mut W,
    encoder: BodyEncoder,
    data: &[u8],
    direction: BodyDirection,
    write_timeout: Duration,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let context = match direction {
        BodyDirection::Request => "writing request body to origin",
        BodyDirection::Response => "writing response body to client",
    };
    encoder
        .write_data(writer, data, write_timeout, context)
        .await
        .map_err(|err| direction.write_failure(err))
}

pub(crate) enum BufferedBody {
    /// The whole body fit within the limit.
    Complete(Bytes),
    /// The limit was exceeded; these bytes were consumed and the decoder holds the rest.
    Overflow(Bytes),
}

/// Reads a body into memory until it completes or grows past `limit` bytes.
pub(crate) async fn buffer_body<R>(
    reader: &mut BufReader<R>,
    decoder: &mut BodyDecoder,
    limit: usize,
) -> Result<BufferedBody>
where
    R: AsyncRead + Unpin,
{
    let mut body = BytesMut::new();
    let mut buffer = [0u8; BODY_BUFFER_SIZE];
    loop {
        let read = decoder.read_data(reader, &mut buffer).await?;
        if read == 0 {
            return Ok(BufferedBody::Complete(body.freeze()));
        }
        body.extend_from_slice(&buffer[..read]);
        if body.len() > limit {
            return Ok(BufferedBody::Overflow(body.freeze()));
        }
    }
}
