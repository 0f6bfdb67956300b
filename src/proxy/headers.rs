use std::net::SocketAddr;

use crate::config::ForwardedMode;
use crate::proxy::forwarded::ForwardedChainEntry;
use crate::proxy::http::codec::HeaderSet;

/// Headers that describe a single transport hop and are never copied to the next one.
pub fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name,
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-connection"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Returns true when the header conveys forwarding metadata that `exclude` strips.
pub fn is_forwarding_header(name: &str) -> bool {
    if name.starts_with("x-forwarded-") {
        return true;
    }
    matches!(
        name,
        "forwarded"
            | "x-real-ip"
            | "x-client-ip"
            | "x-cluster-client-ip"
            | "true-client-ip"
    )
}

/// Inputs for computing the outbound request headers of one hop.
#[derive(Debug, Clone)]
pub struct RequestRewrite<'a> {
    pub client_addr: SocketAddr,
    pub client_proto: &'a str,
    pub client_host: Option<&'a str>,
    pub upstream_authority: &'a str,
    pub forwarded: ForwardedMode,
}

/// Computes the headers sent to the origin: `Host` becomes the connect authority, hop-by-hop and
/// `Connection`-nominated headers are dropped, and the forwarding chain is handled per `mode`.
/// Framing and `Connection` are added later by [`set_hop_headers`].
pub(crate) fn rewrite_request(inbound: &HeaderSet, ctx: &RequestRewrite<'_>) -> HeaderSet {
    let nominated = inbound.connection_tokens();
    let mut outbound = HeaderSet::new();
    outbound.append("Host", ctx.upstream_authority);

    for line in inbound.iter() {
        let name = line.lower_name();
        if matches!(name, "host" | "content-length" | "expect") {
            continue;
        }
        if is_hop_by_hop(name) || nominated.iter().any(|token| token == name) {
            continue;
        }
        if ctx.forwarded == ForwardedMode::Exclude && is_forwarding_header(name) {
            continue;
        }
        outbound.append(line.name.as_str(), line.value.as_str());
    }

    if ctx.forwarded == ForwardedMode::Inject {
        ForwardedChainEntry::new(ctx.client_addr, ctx.client_proto, ctx.client_host)
            .append_to(&mut outbound);
    }
    outbound
}

/// Computes the headers relayed to the client. Everything end-to-end is copied verbatim,
/// including `WWW-Authenticate` and `Set-Cookie`.
pub(crate) fn rewrite_response(inbound: &HeaderSet) -> HeaderSet {
    let nominated = inbound.connection_tokens();
    let mut outbound = HeaderSet::new();
    for line in inbound.iter() {
        let name = line.lower_name();
        if name == "content-length" {
            continue;
        }
        if is_hop_by_hop(name) || nominated.iter().any(|token| token == name) {
            continue;
        }
        outbound.append(line.name.as_str(), line.value.as_str());
    }
    outbound
}

/// Body delimiting advertised on the outgoing leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HopFraming {
    None,
    Length(u64),
    Chunked,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HopConnection {
    KeepAlive,
    Close,
    Upgrade(String),
}

/// Regenerates the per-hop `Content-Length`/`Transfer-Encoding` and `Connection`/`Upgrade`
/// headers for the leg being written.
pub(crate) fn set_hop_headers(
    headers: &mut HeaderSet,
    framing: HopFraming,
    connection: &HopConnection,
) {
    match framing {
        HopFraming::None => {}
        HopFraming::Length(length) => headers.append("Content-Length", length.to_string()),
        HopFraming::Chunked => headers.append("Transfer-Encoding", "chunked"),
    }
    match connection {
        HopConnection::KeepAlive => {}
        HopConnection::Close => headers.append("Connection", "close"),
        HopConnection::Upgrade(protocol) => {
            headers.append("Connection", "Upgrade");
            headers.append("Upgrade", protocol.as_str());
        }
    }
}
