use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use anyhow::{Result, anyhow};
use http::StatusCode;
use time::OffsetDateTime;
use tracing_subscriber::{EnvFilter, fmt};

use crate::cli::LogFormat;

const DEFAULT_FILTER: &str = "info";

pub fn init_logger(format: LogFormat) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    match format {
        LogFormat::Json => fmt::fmt()
            .with_env_filter(filter)
            .json()
            .with_current_span(false)
            .with_span_list(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .try_init()
            .map_err(|err| anyhow!(err))?,
        LogFormat::Text => fmt::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .try_init()
            .map_err(|err| anyhow!(err))?,
    }

    Ok(())
}

/// One completed client exchange, as written to the `exchange_log` target and published on the
/// application's event channel.
#[derive(Debug, Clone)]
pub struct ExchangeEvent {
    pub client_ip: IpAddr,
    pub client_port: u16,
    pub service: String,
    pub method: String,
    pub version: String,
    pub host: String,
    pub path: String,
    pub status: u16,
    pub outcome: String,
    pub redirects: u32,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub elapsed_ms: u128,
    pub upstream_addr: Option<String>,
    pub upstream_reused: Option<bool>,
    pub error_reason: Option<String>,
    pub error_detail: Option<String>,
}

#[derive(Debug)]
pub struct ExchangeEventBuilder {
    event: ExchangeEvent,
}

impl ExchangeEventBuilder {
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            event: ExchangeEvent {
                client_ip: peer.ip(),
                client_port: peer.port(),
                service: String::new(),
                method: String::new(),
                version: String::new(),
                host: String::new(),
                path: String::new(),
                status: 0,
                outcome: String::from("UNKNOWN"),
                redirects: 0,
                bytes_in: 0,
                bytes_out: 0,
                elapsed_ms: 0,
                upstream_addr: None,
                upstream_reused: None,
                error_reason: None,
                error_detail: None,
            },
        }
    }

    pub fn service(mut self, service: impl Into<String>) -> Self {
        self.event.service = service.into();
        self
    }

    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.event.method = method.into();
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.event.version = version.into();
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.event.host = host.into();
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.event.path = path.into();
        self
    }

    pub fn status(mut self, status: StatusCode) -> Self {
        self.event.status = status.as_u16();
        self
    }

    pub fn outcome(mut self, outcome: impl Into<String>) -> Self {
        self.event.outcome = outcome.into();
        self
    }

    pub fn redirects(mut self, redirects: u32) -> Self {
        self.event.redirects = redirects;
        self
    }

    pub fn bytes(mut self, in_bytes: u64, out_bytes: u64) -> Self {
        self.event.bytes_in = in_bytes;
        self.event.bytes_out = out_bytes;
        self
    }

    pub fn elapsed(mut self, elapsed: Duration) -> Self {
        self.event.elapsed_ms = elapsed.as_millis();
        self
    }

    pub fn upstream_addr(mut self, addr: impl Into<String>) -> Self {
        self.event.upstream_addr = Some(addr.into());
        self
    }

    pub fn upstream_reused(mut self, reused: bool) -> Self {
        self.event.upstream_reused = Some(reused);
        self
    }

    pub fn error_reason(mut self, reason: impl Into<String>) -> Self {
        self.event.error_reason = Some(reason.into());
        self
    }

    pub fn error_detail(mut self, detail: impl Into<String>) -> Self {
        self.event.error_detail = Some(detail.into());
        self
    }

    pub fn build(self) -> ExchangeEvent {
        self.event
    }
}

pub fn log_exchange(event: &ExchangeEvent) {
    let now = OffsetDateTime::now_utc();
    let (year, month, day) = now.to_calendar_date();
    let (hour, minute, second) = now.to_hms();
    let millisecond = now.millisecond();
    let month_number: u8 = month.into();
    let ts = format!(
        "{year:04}-{month:02}-{day:02}T{hour:02}:{minute:02}:{second:02}.{millisecond:03}Z",
        month = month_number
    );

    tracing::info!(
        target: "exchange_log",
        ts,
        client_ip = %event.client_ip,
        client_port = event.client_port,
        service = %event.service,
        method = %event.method,
        version = %event.version,
        host = %event.host,
        path = %event.path,
        status = event.status,
        outcome = %event.outcome,
        redirects = event.redirects,
        bytes_in = event.bytes_in,
        bytes_out = event.bytes_out,
        elapsed_ms = event.elapsed_ms as u64,
        upstream_addr = event.upstream_addr.as_deref(),
        upstream_reused = event.upstream_reused,
        error_reason = event.error_reason.as_deref(),
        error_detail = event.error_detail.as_deref()
    );
}
