use std::net::SocketAddr;
use std::pin::pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use bytes::Bytes;
use http::{Method, StatusCode, Version};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tracing::{debug, warn};

use crate::config::ServiceConfig;
use crate::io_util::{flush_with_timeout, write_all_with_timeout};
use crate::logging::ExchangeEventBuilder;
use crate::proxy::AppContext;
use crate::proxy::forward_error::{
    ClientDisconnected, FailureClass, MalformedRequest, OriginProtocolError, OriginWriteFailed,
    classify, is_stale_connection_failure, log_forward_error,
};
use crate::proxy::headers::{
    HopConnection, HopFraming, RequestRewrite, rewrite_request, rewrite_response, set_hop_headers,
};
use crate::proxy::pool::PooledConnection;
use crate::proxy::redirect;
use crate::proxy::request::{ConnectTarget, parse_http1_request};
use crate::proxy::service::ServiceTable;

use super::body::{
    BODY_BUFFER_SIZE, BodyDecoder, BodyDirection, BodyEncoder, BufferedBody, Framing,
    buffer_body, relay_body, write_prefix,
};
use super::codec::{
    HeaderSet, RequestHead, ResponseHead, encode_response_head, read_response_head,
    starts_request_line,
};
use super::respond::{send_response, status_body};
use super::upgrade::relay_upgraded;

const CONTINUE_RESPONSE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// What the connection loop does once an exchange is over.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ClientDisposition {
    KeepAlive,
    Close,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ExchangePhase {
    ReadingRequestHeaders,
    ForwardingRequestBody,
    AwaitingResponseHeaders,
    ForwardingResponseBody,
    Complete,
    Errored,
}

/// Exchange bookkeeping that outlives any single leg.
struct ExchangeState {
    phase: ExchangePhase,
    /// Set as soon as any part of the final response reached the client; after that a failure
    /// can only close the connection.
    response_started: bool,
    interim_relayed: bool,
    status: Option<StatusCode>,
    bytes_in: u64,
    bytes_out: u64,
    upstream_addr: Option<SocketAddr>,
    upstream_reused: Option<bool>,
    redirects: u32,
    service: Option<Arc<ServiceConfig>>,
    host: Option<String>,
    outcome: &'static str,
}

impl ExchangeState {
    fn new(head_bytes: usize) -> Self {
        Self {
            phase: ExchangePhase::ReadingRequestHeaders,
            response_started: false,
            interim_relayed: false,
            status: None,
            bytes_in: head_bytes as u64,
            bytes_out: 0,
            upstream_addr: None,
            upstream_reused: None,
            redirects: 0,
            service: None,
            host: None,
            outcome: "COMPLETE",
        }
    }

    fn service_label(&self) -> &str {
        self.service
            .as_deref()
            .map(ServiceConfig::label)
            .unwrap_or("-")
    }
}

/// Request body as held between reading it from the client and writing it to an origin.
enum RequestBody {
    /// No payload; `declared` keeps an explicit `Content-Length: 0` on the way out.
    Empty { declared: bool },
    Buffered(Bytes),
    /// Too large to hold. Relayed once, straight from the client, so it can be neither retried
    /// nor replayed to a redirect target.
    Streaming {
        decoder: BodyDecoder,
        prefix: Bytes,
        encoder: BodyEncoder,
        framing: HopFraming,
    },
}

impl RequestBody {
    fn is_replayable(&self) -> bool {
        !matches!(self, RequestBody::Streaming { .. })
    }

    fn hop_framing(&self) -> HopFraming {
        match self {
            RequestBody::Empty { declared: true } => HopFraming::Length(0),
            RequestBody::Empty { declared: false } => HopFraming::None,
            RequestBody::Buffered(body) => HopFraming::Length(body.len() as u64),
            RequestBody::Streaming { framing, .. } => *framing,
        }
    }
}

/// Per-exchange request facts every leg needs.
struct ForwardRequest {
    method: Method,
    client_version: Version,
    client_close: bool,
    upgrade: Option<String>,
    websocket: bool,
    max_redirects: u32,
}

enum LegOutcome {
    Complete { reusable: bool },
    Upgraded,
    Redirect { next: ConnectTarget, reusable: bool },
}

/// Runs one client exchange: routing, forwarding, redirects and error mapping. Every exchange,
/// including failed ones, produces exactly one completion event.
pub(crate) async fn handle_exchange<S>(
    reader: &mut BufReader<S>,
    peer: SocketAddr,
    table: &ServiceTable,
    app: &AppContext,
    head: RequestHead,
    start: Instant,
) -> ClientDisposition
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let method = head.method.clone();
    let version = head.version_label();
    let path = head
        .target
        .split('?')
        .next()
        .unwrap_or_default()
        .to_string();
    let mut state = ExchangeState::new(head.head_bytes);
    let mut failure = None;

    let disposition = match forward(reader, peer, table, app, head, &mut state).await {
        Ok(disposition) => {
            state.phase = ExchangePhase::Complete;
            disposition
        }
        Err(err) => {
            let class = classify(&err);
            log_forward_error(class, peer, state.service_label(), &err);
            debug!(
                peer = %peer,
                phase = ?state.phase,
                response_started = state.response_started,
                "exchange aborted"
            );
            state.phase = ExchangePhase::Errored;
            state.outcome = class.as_str();
            if !state.response_started {
                write_failure_response(reader, app, Some(&method), class.status(), &mut state).await;
            }
            failure = Some((class, format!("{err:#}")));
            ClientDisposition::Close
        }
    };

    let mut event = ExchangeEventBuilder::new(peer)
        .method(method.as_str())
        .version(version)
        .host(state.host.clone().unwrap_or_default())
        .path(path)
        .outcome(state.outcome)
        .redirects(state.redirects)
        .bytes(state.bytes_in, state.bytes_out)
        .elapsed(start.elapsed());
    if let Some(service) = &state.service {
        event = event.service(service.label());
    }
    if let Some(status) = state.status {
        event = event.status(status);
    }
    if let Some(addr) = state.upstream_addr {
        event = event.upstream_addr(addr.to_string());
    }
    if let Some(reused) = state.upstream_reused {
        event = event.upstream_reused(reused);
    }
    if let Some((class, detail)) = failure {
        event = event.error_reason(class.as_str()).error_detail(detail);
    }
    app.record_exchange(event.build());

    disposition
}

/// Answers a request whose head could not even be parsed with a 400 and records the event.
pub(crate) async fn reject_request_head<S>(
    reader: &mut BufReader<S>,
    peer: SocketAddr,
    app: &AppContext,
    err: anyhow::Error,
    start: Instant,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let class = FailureClass::ClientError;
    log_forward_error(class, peer, "-", &err);
    let mut state = ExchangeState::new(0);
    state.outcome = class.as_str();
    write_failure_response(reader, app, None, class.status(), &mut state).await;

    let mut event = ExchangeEventBuilder::new(peer)
        .outcome(state.outcome)
        .bytes(state.bytes_in, state.bytes_out)
        .elapsed(start.elapsed())
        .error_reason(class.as_str())
        .error_detail(format!("{err:#}"));
    if let Some(status) = state.status {
        event = event.status(status);
    }
    app.record_exchange(event.build());
}

async fn write_failure_response<S>(
    reader: &mut BufReader<S>,
    app: &AppContext,
    method: Option<&Method>,
    status: StatusCode,
    state: &mut ExchangeState,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    state.response_started = true;
    match send_response(
        reader.get_mut(),
        method,
        status,
        &status_body(status),
        app.settings.client_timeout(),
    )
    .await
    {
        Ok(written) => {
            state.status = Some(status);
            state.bytes_out += written as u64;
        }
        Err(err) => debug!(status = status.as_u16(), error = %err, "failed to send error response"),
    }
}

async fn forward<S>(
    reader: &mut BufReader<S>,
    peer: SocketAddr,
    table: &ServiceTable,
    app: &AppContext,
    head: RequestHead,
    state: &mut ExchangeState,
) -> Result<ClientDisposition>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let settings = &app.settings;
    let client_timeout = settings.client_timeout();
    let framing_headers = head.headers.validate_framing().context(MalformedRequest)?;
    let parsed = parse_http1_request(head.method.clone(), &head.target, head.version, &head.headers)
        .context(MalformedRequest)?;
    state.host = parsed.host.clone();

    let Some(route) = table.route(parsed.host.as_deref(), &parsed.path) else {
        debug!(
            peer = %peer,
            host = parsed.host.as_deref().unwrap_or("-"),
            path = %parsed.path,
            "no service matches request"
        );
        let status = StatusCode::NOT_FOUND;
        state.outcome = "NO_ROUTE";
        state.response_started = true;
        let written = send_response(reader.get_mut(), Some(&head.method), status, &status_body(status), client_timeout)
            .await
            .context(ClientDisconnected)?;
        state.status = Some(status);
        state.bytes_out += written as u64;
        return Ok(ClientDisposition::Close);
    };
    let service = route.service.clone();
    state.service = Some(service.clone());

    if head.version == Version::HTTP_10 {
        warn!(
            peer = %peer,
            service = service.display_name(),
            "accepted HTTP/1.0 request; the client connection closes after the response"
        );
    }

    let client_close = head.version == Version::HTTP_10 || head.headers.has_token("connection", "close");
    let upgrade = if head.version == Version::HTTP_11 && head.headers.has_token("connection", "upgrade") {
        head.headers.get("upgrade").map(str::to_string)
    } else {
        None
    };
    let websocket = upgrade.as_deref().is_some_and(|protocols| {
        protocols
            .split(',')
            .any(|protocol| protocol.trim().eq_ignore_ascii_case("websocket"))
    });
    let request = ForwardRequest {
        method: parsed.method.clone(),
        client_version: head.version,
        client_close,
        upgrade,
        websocket,
        max_redirects: service.max_redirects,
    };

    let framing = Framing::for_request(&framing_headers);
    if framing != Framing::Empty
        && head.version == Version::HTTP_11
        && head.headers.has_token("expect", "100-continue")
    {
        let client = reader.get_mut();
        write_all_with_timeout(client, CONTINUE_RESPONSE, client_timeout, "sending 100 Continue")
            .await
            .context(ClientDisconnected)?;
        flush_with_timeout(client, client_timeout, "sending 100 Continue")
            .await
            .context(ClientDisconnected)?;
        state.bytes_out += CONTINUE_RESPONSE.len() as u64;
    }

    let declared = framing_headers.content_length.is_some()
        || matches!(request.method, Method::POST | Method::PUT | Method::PATCH);
    state.phase = ExchangePhase::ForwardingRequestBody;
    let mut body = read_request_body(reader, framing, declared, peer, app).await?;
    if let RequestBody::Buffered(bytes) = &body {
        state.bytes_in += bytes.len() as u64;
    }
    if body.is_replayable() {
        check_trailing_bytes(reader.buffer(), client_close)?;
    }

    let connection = match &request.upgrade {
        Some(protocol) => HopConnection::Upgrade(protocol.clone()),
        None if !service.keepalive.allows_pooling() => HopConnection::Close,
        None => HopConnection::KeepAlive,
    };
    let client_proto = service.accept.scheme.as_str();
    let mut target = ConnectTarget::for_service(&service, route.path_and_query);
    let mut hop = 0u32;

    loop {
        let authority = target.authority();
        let rewrite = RequestRewrite {
            client_addr: peer,
            client_proto,
            client_host: parsed.host_header.as_deref(),
            upstream_authority: &authority,
            forwarded: service.forwarded,
        };
        let request_head = encode_request_head(
            &request.method,
            &head.headers,
            &target,
            &rewrite,
            body.hop_framing(),
            &connection,
        );

        let mut origin = checkout(app, &target, &service).await?;
        let mut outcome = ProxyLeg {
            client: &mut *reader,
            origin: &mut origin,
            state: &mut *state,
            app,
            target: &target,
            request: &request,
            body: &mut body,
            hop,
        }
        .run(&request_head)
        .await;

        if let Err(err) = &outcome
            && origin.is_reused()
            && body.is_replayable()
            && !state.response_started
            && !state.interim_relayed
            && is_stale_connection_failure(err)
        {
            debug!(
                origin = %origin.key(),
                error = %format!("{err:#}"),
                "pooled origin connection failed before responding; retrying on a new connection"
            );
            app.pool.discard(origin, "stale after reuse");
            origin = open_connection(app, &target).await?;
            outcome = ProxyLeg {
                client: &mut *reader,
                origin: &mut origin,
                state: &mut *state,
                app,
                target: &target,
                request: &request,
                body: &mut body,
                hop,
            }
            .run(&request_head)
            .await;
        }

        match outcome {
            Err(err) => {
                app.pool.discard(origin, "exchange failed");
                return Err(err);
            }
            Ok(LegOutcome::Complete { reusable }) => {
                app.pool.release(origin, reusable, &service.keepalive);
                return Ok(if request.client_close {
                    ClientDisposition::Close
                } else {
                    ClientDisposition::KeepAlive
                });
            }
            Ok(LegOutcome::Upgraded) => {
                app.pool.discard(origin, "upgraded");
                state.outcome = "UPGRADED";
                return Ok(ClientDisposition::Close);
            }
            Ok(LegOutcome::Redirect { next, reusable }) => {
                app.pool.release(origin, reusable, &service.keepalive);
                debug!(
                    from = %target.uri(),
                    to = %next.uri(),
                    hop = hop + 1,
                    "following redirect"
                );
                state.redirects += 1;
                hop += 1;
                target = next;
            }
        }
    }
}

async fn read_request_body<S>(
    reader: &mut BufReader<S>,
    framing: Framing,
    declared: bool,
    peer: SocketAddr,
    app: &AppContext,
) -> Result<RequestBody>
where
    S: AsyncRead + Unpin,
{
    let limit = app.settings.request_buffer_limit;
    let mut decoder = BodyDecoder::new(
        framing,
        BodyDirection::Request,
        peer,
        app.settings.client_timeout(),
    );
    match framing {
        Framing::Empty => Ok(RequestBody::Empty { declared }),
        Framing::Length(length) if length > limit as u64 => Ok(RequestBody::Streaming {
            decoder,
            prefix: Bytes::new(),
            encoder: BodyEncoder::Identity,
            framing: HopFraming::Length(length),
        }),
        _ => match buffer_body(reader, &mut decoder, limit).await? {
            BufferedBody::Complete(body) => Ok(RequestBody::Buffered(body)),
            BufferedBody::Overflow(prefix) => Ok(RequestBody::Streaming {
                decoder,
                prefix,
                encoder: BodyEncoder::Chunked,
                framing: HopFraming::Chunked,
            }),
        },
    }
}

/// Bytes already buffered behind a fully read body must be the start of the next request on a
/// persistent connection. Anything else means the declared length was wrong.
fn check_trailing_bytes(buffered: &[u8], client_close: bool) -> Result<()> {
    if buffered.is_empty() {
        return Ok(());
    }
    if client_close {
        return Err(anyhow!(
            "{} unexpected bytes after the request body",
            buffered.len()
        )
        .context(MalformedRequest));
    }
    if !starts_request_line(buffered) {
        return Err(anyhow!("request body is longer than its declared length").context(MalformedRequest));
    }
    Ok(())
}

/// Reads the origin's next response head while watching the client. The request has been sent
/// in full by now, so client EOF means it hung up and the origin leg is abandoned. Bytes from a
/// pipelined request stop the watch without being consumed.
async fn read_head_watching_client<C, O>(
    client: &mut BufReader<C>,
    origin: &mut BufReader<O>,
    peer: SocketAddr,
    timeout: Duration,
    max_header_bytes: usize,
) -> Result<ResponseHead>
where
    C: AsyncRead + Unpin,
    O: AsyncRead + Unpin,
{
    let mut head = pin!(read_response_head(origin, timeout, peer, max_header_bytes));
    let mut watching = true;
    loop {
        tokio::select! {
            result = &mut head => return result,
            filled = client.fill_buf(), if watching => match filled {
                Ok(buffered) if !buffered.is_empty() => watching = false,
                Ok(_) => {
                    return Err(anyhow!("client closed the connection while awaiting the origin response")
                        .context(ClientDisconnected));
                }
                Err(err) => {
                    return Err(anyhow::Error::new(err)
                        .context("client connection failed while awaiting the origin response")
                        .context(ClientDisconnected));
                }
            },
        }
    }
}

fn encode_request_head(
    method: &Method,
    inbound: &HeaderSet,
    target: &ConnectTarget,
    rewrite: &RequestRewrite<'_>,
    framing: HopFraming,
    connection: &HopConnection,
) -> Vec<u8> {
    let mut headers = rewrite_request(inbound, rewrite);
    set_hop_headers(&mut headers, framing, connection);
    let mut buffer = Vec::with_capacity(512);
    buffer.extend_from_slice(method.as_str().as_bytes());
    buffer.push(b' ');
    buffer.extend_from_slice(target.path_and_query.as_bytes());
    buffer.extend_from_slice(b" HTTP/1.1\r\n");
    headers.encode_into(&mut buffer);
    buffer.extend_from_slice(b"\r\n");
    buffer
}

async fn checkout(
    app: &AppContext,
    target: &ConnectTarget,
    service: &ServiceConfig,
) -> Result<PooledConnection> {
    if service.keepalive.allows_pooling()
        && let Some(conn) = app.pool.acquire(&target.origin_key()).await
    {
        return Ok(conn);
    }
    open_connection(app, target).await
}

async fn open_connection(app: &AppContext, target: &ConnectTarget) -> Result<PooledConnection> {
    let (io, peer) = app.connector.connect(target).await?;
    app.pool.record_opened();
    Ok(PooledConnection::new(io, target.origin_key(), peer))
}

/// One request/response exchange with one origin connection.
struct ProxyLeg<'a, S> {
    client: &'a mut BufReader<S>,
    origin: &'a mut PooledConnection,
    state: &'a mut ExchangeState,
    app: &'a AppContext,
    target: &'a ConnectTarget,
    request: &'a ForwardRequest,
    body: &'a mut RequestBody,
    hop: u32,
}

impl<S> ProxyLeg<'_, S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    async fn run(mut self, request_head: &[u8]) -> Result<LegOutcome> {
        self.state.upstream_addr = Some(self.origin.peer());
        self.state.upstream_reused = Some(self.origin.is_reused());

        self.send_request(request_head).await?;
        let response = self.read_final_head().await?;
        self.origin.touch();

        if response.status == StatusCode::SWITCHING_PROTOCOLS {
            return self.relay_upgrade(response).await;
        }

        if redirect::should_follow(response.status, self.hop, self.request.max_redirects)
            && self.body.is_replayable()
        {
            match redirect::next_target(self.target, &response) {
                Ok(next) => {
                    let reusable = self.drain_redirect(&response).await;
                    return Ok(LegOutcome::Redirect { next, reusable });
                }
                Err(err) => debug!(
                    origin = %self.target.authority(),
                    error = %format!("{err:#}"),
                    "relaying redirect that cannot be followed"
                ),
            }
        }

        self.relay_response(response).await
    }

    async fn send_request(&mut self, request_head: &[u8]) -> Result<()> {
        let upstream_timeout = self.app.settings.upstream_timeout();
        self.state.phase = ExchangePhase::ForwardingRequestBody;
        let origin = &mut self.origin.io;

        write_all_with_timeout(origin, request_head, upstream_timeout, "writing request head to origin")
            .await
            .context(OriginWriteFailed)?;
        match &mut *self.body {
            RequestBody::Empty { .. } => {}
            RequestBody::Buffered(body) => {
                write_all_with_timeout(origin, &body[..], upstream_timeout, "writing request body to origin")
                    .await
                    .context(OriginWriteFailed)?;
            }
            RequestBody::Streaming {
                decoder,
                prefix,
                encoder,
                ..
            } => {
                write_prefix(origin, *encoder, &prefix[..], BodyDirection::Request, upstream_timeout).await?;
                let relayed = relay_body(&mut *self.client, decoder, origin, *encoder, upstream_timeout).await?;
                self.state.bytes_in += prefix.len() as u64 + relayed;
            }
        }
        flush_with_timeout(origin, upstream_timeout, "flushing request to origin")
            .await
            .context(OriginWriteFailed)?;

        self.state.phase = ExchangePhase::AwaitingResponseHeaders;
        Ok(())
    }

    /// Reads past interim responses, relaying them to HTTP/1.1 clients, and returns the final
    /// head.
    async fn read_final_head(&mut self) -> Result<ResponseHead> {
        let settings = &self.app.settings;
        let peer = self.origin.peer();
        loop {
            let response = read_head_watching_client(
                &mut *self.client,
                &mut self.origin.io,
                peer,
                settings.response_header_timeout(),
                settings.max_response_header_size,
            )
            .await?;
            if !response.is_interim() {
                return Ok(response);
            }
            debug!(
                origin = %self.target.authority(),
                status = response.status.as_u16(),
                "interim response from origin"
            );
            if self.request.client_version != Version::HTTP_11 {
                continue;
            }

            let headers = rewrite_response(&response.headers);
            let encoded = encode_response_head(response.status, response.reason_phrase(), &headers);
            let client = self.client.get_mut();
            write_all_with_timeout(client, &encoded, settings.client_timeout(), "relaying interim response")
                .await
                .context(ClientDisconnected)?;
            flush_with_timeout(client, settings.client_timeout(), "relaying interim response")
                .await
                .context(ClientDisconnected)?;
            self.state.bytes_out += encoded.len() as u64;
            self.state.interim_relayed = true;
        }
    }

    async fn relay_upgrade(&mut self, response: ResponseHead) -> Result<LegOutcome> {
        let settings = &self.app.settings;
        let Some(requested) = self.request.upgrade.as_deref() else {
            return Err(anyhow!("origin switched protocols without an upgrade request")
                .context(OriginProtocolError));
        };
        let protocol = response.headers.get("upgrade").unwrap_or(requested).to_string();
        let mut headers = rewrite_response(&response.headers);
        set_hop_headers(&mut headers, HopFraming::None, &HopConnection::Upgrade(protocol));
        let encoded = encode_response_head(response.status, response.reason_phrase(), &headers);

        self.state.response_started = true;
        self.state.status = Some(response.status);
        self.state.phase = ExchangePhase::ForwardingResponseBody;
        let client = self.client.get_mut();
        write_all_with_timeout(client, &encoded, settings.client_timeout(), "writing upgrade response")
            .await
            .context(ClientDisconnected)?;
        flush_with_timeout(client, settings.client_timeout(), "writing upgrade response")
            .await
            .context(ClientDisconnected)?;
        self.state.bytes_out += encoded.len() as u64;

        match relay_upgraded(
            &mut *self.client,
            &mut self.origin.io,
            self.request.websocket,
            settings.upgrade_idle_timeout(),
        )
        .await
        {
            Ok(stats) => {
                self.state.bytes_in += stats.client_to_origin;
                self.state.bytes_out += stats.origin_to_client;
                debug!(
                    origin = %self.target.authority(),
                    client_to_origin = stats.client_to_origin,
                    origin_to_client = stats.origin_to_client,
                    "upgraded connection closed"
                );
            }
            Err(err) => debug!(
                origin = %self.target.authority(),
                error = %format!("{err:#}"),
                "upgraded connection ended with error"
            ),
        }
        Ok(LegOutcome::Upgraded)
    }

    /// Consumes a followed redirect's body so the connection can go back to the pool. Returns
    /// whether it may be reused.
    async fn drain_redirect(&mut self, response: &ResponseHead) -> bool {
        let settings = &self.app.settings;
        let framing = Framing::for_response(&self.request.method, response);
        let drainable = match framing {
            Framing::Empty => true,
            Framing::Length(length) => length <= settings.redirect_drain_limit,
            Framing::Chunked | Framing::UntilClose => false,
        };
        if response.connection_close || !drainable {
            return false;
        }

        self.origin.mark_draining();
        let upstream_timeout = settings.upstream_timeout();
        let mut decoder = BodyDecoder::new(
            framing,
            BodyDirection::Response,
            self.origin.peer(),
            upstream_timeout,
        );
        let mut sink = tokio::io::sink();
        match relay_body(
            &mut self.origin.io,
            &mut decoder,
            &mut sink,
            BodyEncoder::Identity,
            upstream_timeout,
        )
        .await
        {
            Ok(_) => self.request.method != Method::HEAD,
            Err(err) => {
                debug!(
                    origin = %self.target.authority(),
                    error = %format!("{err:#}"),
                    "failed to drain redirect body"
                );
                false
            }
        }
    }

    async fn relay_response(&mut self, response: ResponseHead) -> Result<LegOutcome> {
        let settings = &self.app.settings;
        let client_timeout = settings.client_timeout();
        let method = &self.request.method;
        let framing = Framing::for_response(method, &response);
        self.state.phase = ExchangePhase::ForwardingResponseBody;

        let mut decoder = BodyDecoder::new(
            framing,
            BodyDirection::Response,
            self.origin.peer(),
            settings.upstream_timeout(),
        );
        // The head waits for the first body bytes so an origin that dies now still gets a 504.
        let mut first = vec![0u8; BODY_BUFFER_SIZE];
        let first_len = decoder.read_data(&mut self.origin.io, &mut first).await?;

        let client_version = self.request.client_version;
        let hop_framing = client_framing(framing, &response, method, client_version);
        let encoder = if matches!(framing, Framing::Chunked | Framing::UntilClose)
            && client_version == Version::HTTP_11
        {
            BodyEncoder::Chunked
        } else {
            BodyEncoder::Identity
        };
        let connection = if self.request.client_close {
            HopConnection::Close
        } else {
            HopConnection::KeepAlive
        };
        let mut headers = rewrite_response(&response.headers);
        set_hop_headers(&mut headers, hop_framing, &connection);
        let encoded = encode_response_head(response.status, response.reason_phrase(), &headers);

        self.state.response_started = true;
        self.state.status = Some(response.status);
        let client = self.client.get_mut();
        write_all_with_timeout(client, &encoded, client_timeout, "writing response head to client")
            .await
            .context(ClientDisconnected)?;
        self.state.bytes_out += encoded.len() as u64;
        write_prefix(
            client,
            encoder,
            &first[..first_len],
            BodyDirection::Response,
            client_timeout,
        )
        .await?;
        let relayed = relay_body(&mut self.origin.io, &mut decoder, client, encoder, client_timeout).await?;
        self.state.bytes_out += first_len as u64 + relayed;

        let reusable = !response.connection_close
            && framing.is_self_delimiting()
            && decoder.is_done()
            && *method != Method::HEAD;
        Ok(LegOutcome::Complete { reusable })
    }
}

fn response_has_body(method: &Method, status: StatusCode) -> bool {
    *method != Method::HEAD
        && !status.is_informational()
        && status != StatusCode::NO_CONTENT
        && status != StatusCode::NOT_MODIFIED
}

/// Framing advertised to the client. Bodies whose end is only known from the origin are
/// re-chunked for HTTP/1.1 clients and close-delimited for HTTP/1.0 ones. Bodiless responses
/// to `HEAD` and `304` keep the length metadata the origin sent.
fn client_framing(
    framing: Framing,
    response: &ResponseHead,
    method: &Method,
    client_version: Version,
) -> HopFraming {
    match framing {
        Framing::Length(length) => HopFraming::Length(length),
        Framing::Chunked | Framing::UntilClose if client_version == Version::HTTP_11 => {
            HopFraming::Chunked
        }
        Framing::Chunked | Framing::UntilClose => HopFraming::None,
        Framing::Empty if response_has_body(method, response.status) => HopFraming::Length(0),
        Framing::Empty => {
            if response.status == StatusCode::NO_CONTENT || response.status.is_informational() {
                HopFraming::None
            } else if let Some(length) = response.framing.content_length {
                HopFraming::Length(length)
            } else if response.framing.chunked && client_version == Version::HTTP_11 {
                HopFraming::Chunked
            } else {
                HopFraming::None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::http::codec::FramingHeaders;

    fn response(status: u16, content_length: Option<u64>, chunked: bool) -> ResponseHead {
        ResponseHead {
            version: Version::HTTP_11,
            status: StatusCode::from_u16(status).unwrap(),
            reason: String::new(),
            headers: HeaderSet::new(),
            framing: FramingHeaders {
                content_length,
                chunked,
            },
            connection_close: false,
        }
    }

    #[test]
    fn close_delimited_body_is_rechunked_for_http11_clients() {
        let head = response(200, None, false);
        let framing = Framing::for_response(&Method::GET, &head);
        assert_eq!(
            client_framing(framing, &head, &Method::GET, Version::HTTP_11),
            HopFraming::Chunked
        );
        assert_eq!(
            client_framing(framing, &head, &Method::GET, Version::HTTP_10),
            HopFraming::None
        );
    }

    #[test]
    fn head_response_keeps_advertised_length() {
        let head = response(200, Some(1234), false);
        let framing = Framing::for_response(&Method::HEAD, &head);
        assert_eq!(framing, Framing::Empty);
        assert_eq!(
            client_framing(framing, &head, &Method::HEAD, Version::HTTP_11),
            HopFraming::Length(1234)
        );
    }

    #[test]
    fn empty_body_gets_explicit_zero_length() {
        let head = response(200, Some(0), false);
        let framing = Framing::for_response(&Method::GET, &head);
        assert_eq!(
            client_framing(framing, &head, &Method::GET, Version::HTTP_11),
            HopFraming::Length(0)
        );
        let no_content = response(204, None, false);
        assert_eq!(
            client_framing(Framing::Empty, &no_content, &Method::GET, Version::HTTP_11),
            HopFraming::None
        );
    }

    #[test]
    fn trailing_bytes_must_start_a_request() {
        assert!(check_trailing_bytes(b"", true).is_ok());
        assert!(check_trailing_bytes(b"GET / HTTP/1.1\r\n", false).is_ok());
        assert!(check_trailing_bytes(b"POS", false).is_ok());

        let err = check_trailing_bytes(b"extra", false).unwrap_err();
        assert!(err.is::<MalformedRequest>());
        let err = check_trailing_bytes(b"WORLD", false).unwrap_err();
        assert!(err.is::<MalformedRequest>());
        let err = check_trailing_bytes(b"GET / HTTP/1.1\r\n", true).unwrap_err();
        assert!(err.is::<MalformedRequest>());
    }

    #[test]
    fn outbound_head_uses_connect_path_and_hop_headers() {
        let mut inbound = HeaderSet::new();
        inbound.append("Host", "gateway.test");
        inbound.append("Connection", "keep-alive, X-Trace");
        inbound.append("X-Trace", "1");
        inbound.append("Authorization", "Basic dXNlcjpwYXNz");
        let target = ConnectTarget {
            scheme: crate::config::Scheme::Http,
            host: Arc::from("origin.test"),
            port: 8080,
            path_and_query: "/v1/items?q=1".into(),
            transport: None,
            tls: false,
        };
        let authority = target.authority();
        let rewrite = RequestRewrite {
            client_addr: "192.0.2.1:5000".parse().unwrap(),
            client_proto: "http",
            client_host: Some("gateway.test"),
            upstream_authority: &authority,
            forwarded: crate::config::ForwardedMode::Passthrough,
        };
        let encoded = encode_request_head(
            &Method::POST,
            &inbound,
            &target,
            &rewrite,
            HopFraming::Length(3),
            &HopConnection::Close,
        );
        let text = String::from_utf8(encoded).unwrap();
        assert!(text.starts_with("POST /v1/items?q=1 HTTP/1.1\r\nHost: origin.test:8080\r\n"));
        assert!(text.contains("Authorization: Basic dXNlcjpwYXNz\r\n"));
        assert!(text.contains("Content-Length: 3\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(!text.contains("X-Trace"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn streamed_bodies_are_not_replayable() {
        let streaming = RequestBody::Streaming {
            decoder: BodyDecoder::new(
                Framing::Chunked,
                BodyDirection::Request,
                "127.0.0.1:1".parse().unwrap(),
                std::time::Duration::from_secs(1),
            ),
            prefix: Bytes::new(),
            encoder: BodyEncoder::Chunked,
            framing: HopFraming::Chunked,
        };
        assert!(!streaming.is_replayable());
        assert_eq!(streaming.hop_framing(), HopFraming::Chunked);
        assert!(RequestBody::Buffered(Bytes::from_static(b"abc")).is_replayable());
        assert_eq!(
            RequestBody::Empty { declared: true }.hop_framing(),
            HopFraming::Length(0)
        );
    }
}
