use std::{future::Future, time::Duration};

use anyhow::{Context, Result};
use tokio::time::timeout;

use crate::proxy::forward_error::IoTimeout;

/// Wraps `tokio::time::timeout`, converting elapsed deadlines into [`IoTimeout`] and inner errors
/// into contextual `anyhow::Error` values for consistent diagnostics.
pub async fn timeout_with_context<F, T, E>(
    duration: Duration,
    future: F,
    context: impl Into<String>,
) -> Result<T>
where
    F: Future<Output = Result<T, E>>,
    E: std::error::Error + Send + Sync + 'static,
{
    let context = context.into();
    match timeout(duration, future).await {
        Ok(result) => result.with_context(|| format!("failed while {context}")),
        Err(_) => Err(IoTimeout { context }.into()),
    }
}

/// Formats `host[:port]` for use in a `Host` header or URI authority, bracketing IPv6 literals and
/// omitting the port when it matches the scheme default.
pub fn format_authority(host: &str, port: u16, default_port: u16) -> String {
    let mut authority = if host.contains(':') {
        format!("[{host}]")
    } else {
        host.to_string()
    };
    if port != default_port {
        authority.push(':');
        authority.push_str(&port.to_string());
    }
    authority
}
