use std::net::{IpAddr, SocketAddr};

use crate::proxy::http::codec::HeaderSet;

/// This hop's contribution to the `Forwarded` chain (RFC 7239).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardedChainEntry {
    pub for_addr: IpAddr,
    pub proto: String,
    pub host: Option<String>,
}

impl ForwardedChainEntry {
    pub fn new(client: SocketAddr, proto: impl Into<String>, host: Option<&str>) -> Self {
        Self {
            for_addr: client.ip(),
            proto: proto.into(),
            host: host.map(str::to_string),
        }
    }

    /// Renders the `for=...;proto=...;host=...` element, quoting values that are not plain tokens.
    pub fn to_header_value(&self) -> String {
        let for_value = match self.for_addr {
            IpAddr::V4(addr) => addr.to_string(),
            IpAddr::V6(addr) => format!("\"[{addr}]\""),
        };
        let mut value = format!("for={for_value};proto={}", quote_if_needed(&self.proto));
        if let Some(host) = &self.host {
            value.push_str(";host=");
            value.push_str(&quote_if_needed(host));
        }
        value
    }

    /// Appends this hop to the `Forwarded` and `X-Forwarded-*` headers already in `headers`, one
    /// new line per header.
    pub fn append_to(&self, headers: &mut HeaderSet) {
        append_list(headers, "Forwarded", &self.to_header_value());
        append_list(headers, "X-Forwarded-For", &self.for_addr.to_string());
        append_list(headers, "X-Forwarded-Proto", &self.proto);
        if let Some(host) = &self.host {
            append_list(headers, "X-Forwarded-Host", host);
        }
    }
}

/// Extends a list header with one more line; earlier lines stay as they arrived.
fn append_list(headers: &mut HeaderSet, name: &str, value: &str) {
    headers.append(name, value);
}

fn is_token_char(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&byte)
}

fn quote_if_needed(value: &str) -> String {
    if !value.is_empty() && value.bytes().all(is_token_char) {
        value.to_string()
    } else {
        let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
        format!("\"{escaped}\"")
    }
}
