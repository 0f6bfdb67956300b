use std::net::SocketAddr;

use anyhow::Error;
use http::StatusCode;
use thiserror::Error;
use tracing::{debug, warn};

/// The client sent something that cannot be forwarded as a well-formed HTTP/1.1 message.
#[derive(Debug, Error)]
#[error("malformed request")]
pub struct MalformedRequest;

/// The client went away or stalled while the proxy was still reading from or writing to it.
#[derive(Debug, Error)]
#[error("client connection failed")]
pub struct ClientDisconnected;

#[derive(Debug, Error)]
#[error("failed to connect to origin {origin}")]
pub struct OriginConnectFailed {
    pub origin: String,
}

#[derive(Debug, Error)]
#[error("failed to send request to origin")]
pub struct OriginWriteFailed;

#[derive(Debug, Error)]
#[error("origin sent no response")]
pub struct OriginNoResponse;

#[derive(Debug, Error)]
#[error("origin disconnected before the response was complete")]
pub struct OriginDisconnected;

#[derive(Debug, Error)]
#[error("malformed response from origin")]
pub struct OriginProtocolError;

#[derive(Debug, Error)]
#[error("timed out {context}")]
pub struct IoTimeout {
    pub context: String,
}

/// What kind of status a failed exchange maps to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureClass {
    ClientError,
    GatewayTimeout,
    GatewayError,
}

impl FailureClass {
    pub fn status(self) -> StatusCode {
        match self {
            FailureClass::ClientError => StatusCode::BAD_REQUEST,
            FailureClass::GatewayTimeout => StatusCode::GATEWAY_TIMEOUT,
            FailureClass::GatewayError => StatusCode::BAD_GATEWAY,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureClass::ClientError => "CLIENT_ERROR",
            FailureClass::GatewayTimeout => "GATEWAY_TIMEOUT",
            FailureClass::GatewayError => "GATEWAY_ERROR",
        }
    }
}

pub fn classify(err: &Error) -> FailureClass {
    if err.is::<MalformedRequest>() || err.is::<ClientDisconnected>() {
        FailureClass::ClientError
    } else if err.is::<OriginProtocolError>() {
        FailureClass::GatewayError
    } else if err.is::<OriginConnectFailed>()
        || err.is::<OriginWriteFailed>()
        || err.is::<OriginNoResponse>()
        || err.is::<OriginDisconnected>()
        || err.is::<IoTimeout>()
    {
        FailureClass::GatewayTimeout
    } else {
        FailureClass::GatewayError
    }
}

/// A reused pooled connection that failed this way most likely went stale while idle, so the
/// request may be replayed once on a fresh connection.
pub fn is_stale_connection_failure(err: &Error) -> bool {
    !err.is::<IoTimeout>() && (err.is::<OriginWriteFailed>() || err.is::<OriginNoResponse>())
}

pub fn log_forward_error(class: FailureClass, peer: SocketAddr, service: &str, err: &Error) {
    match class {
        FailureClass::ClientError if err.is::<ClientDisconnected>() => debug!(
            peer = %peer,
            service,
            error = %format!("{err:#}"),
            "client connection failed mid-exchange"
        ),
        FailureClass::ClientError => warn!(
            peer = %peer,
            service,
            error = %format!("{err:#}"),
            "rejecting malformed request"
        ),
        FailureClass::GatewayTimeout | FailureClass::GatewayError => warn!(
            peer = %peer,
            service,
            class = class.as_str(),
            error = %format!("{err:#}"),
            "origin exchange failed"
        ),
    }
}
