use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail, ensure};
use http::{Method, Uri, Version};

use crate::config::{Scheme, ServiceConfig, TransportOverride};
use crate::proxy::http::codec::HeaderSet;
use crate::proxy::pool::OriginKey;
use crate::util::format_authority;

/// Client request after the start line and `Host` have been validated.
#[derive(Debug, Clone)]
pub struct ParsedRequest {
    pub method: Method,
    /// Lower-cased host from `Host` (or the absolute-form authority), without brackets.
    pub host: Option<String>,
    pub port: Option<u16>,
    /// The `Host` value as the client sent it, carried into the forwarding chain.
    pub host_header: Option<String>,
    /// Origin-form path and query.
    pub path: String,
}

/// Validate the request target and `Host` header of an HTTP/1.x request.
pub fn parse_http1_request(
    method: Method,
    target: &str,
    version: Version,
    headers: &HeaderSet,
) -> Result<ParsedRequest> {
    let mut host_values = headers.get_all("host");
    let host_header = host_values.next();
    ensure!(host_values.next().is_none(), "multiple Host headers");
    if version == Version::HTTP_11 {
        ensure!(host_header.is_some(), "HTTP/1.1 request missing Host header");
    }
    let parsed_host = host_header.map(parse_host_header).transpose()?;

    if target.contains("://") {
        let uri: Uri = target
            .parse()
            .with_context(|| format!("invalid request target '{target}'"))?;
        let scheme = uri
            .scheme_str()
            .ok_or_else(|| anyhow!("absolute request target missing scheme"))
            .and_then(parse_scheme)?;
        let authority = uri
            .authority()
            .ok_or_else(|| anyhow!("absolute request target missing authority"))?;
        let (host, port) = parse_host_header(authority.as_str())?;
        if let Some((header_host, header_port)) = &parsed_host {
            let default_port = scheme.default_port();
            ensure!(
                *header_host == host
                    && header_port.unwrap_or(default_port) == port.unwrap_or(default_port),
                "request target authority '{}' disagrees with Host header",
                authority
            );
        }
        let path = uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .filter(|pq| pq.starts_with('/'))
            .unwrap_or("/")
            .to_string();
        return Ok(ParsedRequest {
            method,
            host: Some(host),
            port,
            host_header: host_header.map(str::to_string),
            path,
        });
    }

    if target == "*" {
        ensure!(
            method == Method::OPTIONS,
            "asterisk-form request target is only valid for OPTIONS"
        );
    } else if !target.starts_with('/') {
        bail!("request target must be origin-form (start with '/')");
    }
    if target.contains(['#', ' ']) {
        bail!("invalid request target '{target}'");
    }

    let (host, port) = match parsed_host {
        Some((host, port)) => (Some(host), port),
        None => (None, None),
    };
    Ok(ParsedRequest {
        method,
        host,
        port,
        host_header: host_header.map(str::to_string),
        path: target.to_string(),
    })
}

pub fn parse_scheme(value: &str) -> Result<Scheme> {
    match value.to_ascii_lowercase().as_str() {
        "http" | "ws" => Ok(Scheme::Http),
        "https" | "wss" => Ok(Scheme::Https),
        other => bail!("unsupported scheme '{other}'"),
    }
}

/// Parse a Host header or URI authority into a normalized host + port.
pub fn parse_host_header(value: &str) -> Result<(String, Option<u16>)> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        bail!("empty Host header");
    }
    if trimmed.chars().any(|c| c.is_whitespace()) {
        bail!("authority must not contain whitespace");
    }
    if trimmed.contains('@') {
        bail!("authority must not contain userinfo");
    }
    if trimmed.contains(['/', '?', '#', '\\']) {
        bail!("authority must not contain path or query");
    }
    let uri: Uri = format!("http://{trimmed}")
        .parse()
        .with_context(|| format!("invalid Host header '{trimmed}'"))?;
    let host = uri
        .host()
        .ok_or_else(|| anyhow!("Host header missing hostname"))?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_ascii_lowercase();
    Ok((host, uri.port_u16()))
}

/// Where one leg of an exchange is sent: the origin's URI plus the address actually dialled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub scheme: Scheme,
    pub host: Arc<str>,
    pub port: u16,
    pub path_and_query: String,
    pub transport: Option<TransportOverride>,
    pub tls: bool,
}

impl ConnectTarget {
    pub fn for_service(service: &ServiceConfig, path_and_query: String) -> Self {
        Self {
            scheme: service.connect.scheme,
            host: service.connect.host.clone(),
            port: service.connect.port,
            path_and_query,
            transport: service.transport.clone(),
            tls: service.connect.scheme == Scheme::Https && service.tls,
        }
    }

    pub fn authority(&self) -> String {
        format_authority(&self.host, self.port, self.scheme.default_port())
    }

    pub fn origin_key(&self) -> OriginKey {
        let (dial_host, dial_port) = self.dial_addr();
        OriginKey {
            scheme: self.scheme,
            host: self.host.clone(),
            port: self.port,
            dial_host: Arc::from(dial_host),
            dial_port,
        }
    }

    /// Host and port that are resolved and connected to.
    pub fn dial_addr(&self) -> (&str, u16) {
        match &self.transport {
            Some(transport) => (&transport.host, transport.port),
            None => (&self.host, self.port),
        }
    }

    pub fn uri(&self) -> String {
        format!("{}://{}{}", self.scheme, self.authority(), self.path_and_query)
    }

    fn same_origin(&self, scheme: Scheme, host: &str, port: u16) -> bool {
        self.scheme == scheme && *self.host == *host && self.port == port
    }

    /// Resolves a `Location` value against this target. The transport override only survives
    /// when the redirect stays on the same origin.
    pub fn resolve_location(&self, location: &str) -> Result<ConnectTarget> {
        let location = location.trim();
        ensure!(!location.is_empty(), "empty Location header");
        let location = location.split('#').next().unwrap_or(location);

        if let Some((scheme, rest)) = location.split_once("://")
            && !scheme.contains(['/', '?'])
        {
            let scheme = parse_scheme(scheme)?;
            return self.absolute_target(scheme, rest);
        }
        if let Some(rest) = location.strip_prefix("//") {
            return self.absolute_target(self.scheme, rest);
        }

        let (path, query) = match location.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (location, None),
        };
        let merged = if path.starts_with('/') {
            path.to_string()
        } else if path.is_empty() {
            self.path_and_query
                .split('?')
                .next()
                .unwrap_or("/")
                .to_string()
        } else {
            let base = self.path_and_query.split('?').next().unwrap_or("/");
            let dir = match base.rfind('/') {
                Some(idx) => &base[..=idx],
                None => "/",
            };
            format!("{dir}{path}")
        };
        let mut path_and_query = remove_dot_segments(&merged);
        if let Some(query) = query {
            path_and_query.push('?');
            path_and_query.push_str(query);
        }
        Ok(ConnectTarget {
            path_and_query,
            ..self.clone()
        })
    }

    fn absolute_target(&self, scheme: Scheme, rest: &str) -> Result<ConnectTarget> {
        let split_at = rest.find(['/', '?']).unwrap_or(rest.len());
        let (authority, tail) = rest.split_at(split_at);
        let (host, port) = parse_host_header(authority)?;
        let port = port.unwrap_or(scheme.default_port());
        let path_and_query = match tail {
            "" => "/".to_string(),
            tail if tail.starts_with('?') => format!("/{tail}"),
            tail => {
                let (path, query) = match tail.split_once('?') {
                    Some((path, query)) => (path, Some(query)),
                    None => (tail, None),
                };
                let mut out = remove_dot_segments(path);
                if let Some(query) = query {
                    out.push('?');
                    out.push_str(query);
                }
                out
            }
        };
        if self.same_origin(scheme, &host, port) {
            return Ok(ConnectTarget {
                path_and_query,
                ..self.clone()
            });
        }
        Ok(ConnectTarget {
            scheme,
            host: Arc::from(host),
            port,
            path_and_query,
            transport: None,
            tls: scheme == Scheme::Https,
        })
    }
}

/// RFC 3986 section 5.2.4 for an absolute path.
fn remove_dot_segments(path: &str) -> String {
    let mut output: Vec<&str> = Vec::new();
    for segment in path.split('/').skip(1) {
        match segment {
            "." => {}
            ".." => {
                output.pop();
            }
            other => output.push(other),
        }
    }
    let mut result = format!("/{}", output.join("/"));
    if (path.ends_with("/.") || path.ends_with("/..")) && !result.ends_with('/') {
        result.push('/');
    }
    result
}
