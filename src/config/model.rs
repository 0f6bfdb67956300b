use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::util::format_authority;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub const fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An accept or connect URI from the service table, already split into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceUri {
    pub original: Arc<str>,
    pub scheme: Scheme,
    pub host: Arc<str>,
    pub port: u16,
    pub path: Arc<str>,
}

impl ServiceUri {
    pub fn authority(&self) -> String {
        format_authority(&self.host, self.port, self.scheme.default_port())
    }
}

impl fmt::Display for ServiceUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.original)
    }
}

/// How a service treats `Forwarded` and `X-Forwarded-*` headers on the way to its origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ForwardedMode {
    Inject,
    Exclude,
    #[default]
    Passthrough,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAlivePolicy {
    pub enabled: bool,
    pub timeout: Duration,
    pub max_idle: usize,
}

impl Default for KeepAlivePolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout: Duration::from_secs(30),
            max_idle: 16,
        }
    }
}

impl KeepAlivePolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Whether connections released under this policy may be kept for reuse at all.
    pub fn allows_pooling(&self) -> bool {
        self.enabled && self.max_idle > 0 && !self.timeout.is_zero()
    }
}

/// Address actually dialled for the connect side when it differs from the connect URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportOverride {
    pub host: Arc<str>,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub name: Option<Arc<str>>,
    pub accept: ServiceUri,
    pub connect: ServiceUri,
    pub keepalive: KeepAlivePolicy,
    pub max_redirects: u32,
    pub forwarded: ForwardedMode,
    pub transport: Option<TransportOverride>,
    pub tls: bool,
}

impl ServiceConfig {
    /// Name used in logs; services without a configured name are reported by their accept URI.
    pub fn label(&self) -> &str {
        match &self.name {
            Some(name) => name,
            None => &self.accept.original,
        }
    }

    pub fn display_name(&self) -> &str {
        match &self.name {
            Some(name) => name,
            None => "unnamed service",
        }
    }
}
