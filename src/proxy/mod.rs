pub mod forward_error;
pub mod forwarded;
pub mod headers;
pub mod http;
pub mod listener;
pub mod pool;
pub mod redirect;
pub mod request;
pub mod service;
pub mod upstream;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rustls::client::ClientConfig;
use tokio::sync::broadcast;
use tracing::info;

use crate::config::ServiceConfig;
use crate::logging::{ExchangeEvent, log_exchange};
use crate::settings::Settings;

use self::pool::{ConnectionPool, PoolStats, spawn_reaper};
use self::upstream::OriginConnector;

const MIN_REAPER_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Clone)]
pub struct AppContext {
    pub settings: Arc<Settings>,
    pub pool: Arc<ConnectionPool>,
    pub connector: Arc<OriginConnector>,
    events: broadcast::Sender<ExchangeEvent>,
}

impl AppContext {
    pub fn new(settings: Arc<Settings>, tls: Option<Arc<ClientConfig>>) -> Self {
        let pool = Arc::new(ConnectionPool::new(settings.upstream_timeout()));
        let connector = Arc::new(OriginConnector::new(
            tls,
            settings.upstream_connect_timeout(),
        ));
        let (events, _) = broadcast::channel(settings.event_channel_capacity.max(1));
        Self {
            settings,
            pool,
            connector,
            events,
        }
    }

    /// Completion events for every exchange handled from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ExchangeEvent> {
        self.events.subscribe()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub(crate) fn record_exchange(&self, event: ExchangeEvent) {
        log_exchange(&event);
        // No subscribers is the normal case outside tests.
        let _ = self.events.send(event);
    }
}

/// How often idle origin connections are reaped: the configured interval, tightened to the
/// shortest keep-alive timeout so no connection outlives its deadline by much.
pub fn reaper_interval(settings: &Settings, services: &[Arc<ServiceConfig>]) -> Duration {
    services
        .iter()
        .filter(|service| service.keepalive.allows_pooling())
        .map(|service| service.keepalive.timeout)
        .fold(settings.pool_reaper_interval(), Duration::min)
        .max(MIN_REAPER_INTERVAL)
}

pub async fn run(app: AppContext, services: Vec<Arc<ServiceConfig>>) -> Result<()> {
    let interval = reaper_interval(&app.settings, &services);
    info!(
        services = services.len(),
        reaper_interval_ms = interval.as_millis() as u64,
        "starting proxy"
    );
    let _reaper = spawn_reaper(&app.pool, interval);
    let listeners = listener::bind_listeners(&services).await?;
    listener::serve_listeners(listeners, app).await
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::PathBuf;
    use std::sync::Arc;

    use super::AppContext;
    use crate::cli::LogFormat;
    use crate::settings::Settings;

    pub(crate) fn test_settings() -> Settings {
        Settings {
            services: PathBuf::from("services.toml"),
            services_dir: None,
            log: LogFormat::Text,
            client_timeout: 5,
            client_idle_timeout: 5,
            upstream_connect_timeout: 2,
            response_header_timeout: 2,
            upstream_timeout: 5,
            upgrade_idle_timeout: 5,
            max_request_header_size: 8192,
            max_response_header_size: 8192,
            request_buffer_limit: 64 * 1024,
            redirect_drain_limit: 64 * 1024,
            pool_reaper_interval_ms: 1000,
            event_channel_capacity: 16,
        }
    }

    pub(crate) fn test_app() -> AppContext {
        AppContext::new(Arc::new(test_settings()), None)
    }
}
