use std::fmt::Write as _;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use proxygate::{
    cli::LogFormat,
    config,
    logging::ExchangeEvent,
    proxy::{self, AppContext, pool::PoolStats},
    settings::Settings,
};

use super::net::{find_free_port, wait_for_listener};
use super::proxy_client::ProxyClient;

fn default_test_settings(services: PathBuf) -> Settings {
    Settings {
        services,
        services_dir: None,
        log: LogFormat::Text,
        client_timeout: 5,
        client_idle_timeout: 5,
        upstream_connect_timeout: 2,
        response_header_timeout: 5,
        upstream_timeout: 5,
        upgrade_idle_timeout: 5,
        max_request_header_size: 32 * 1024,
        max_response_header_size: 32 * 1024,
        request_buffer_limit: 64 * 1024,
        redirect_drain_limit: 64 * 1024,
        pool_reaper_interval_ms: 200,
        event_channel_capacity: 256,
    }
}

/// One `[[service]]` entry; the accept side is always the harness port on loopback. A
/// `{proxy}` authority in the connect URI points back at the proxy itself.
#[derive(Debug, Clone)]
pub struct ServiceDef {
    name: Option<String>,
    accept_path: String,
    connect: String,
    properties: Vec<(String, String)>,
}

impl ServiceDef {
    pub fn new(name: &str, accept_path: &str, connect: impl Into<String>) -> Self {
        Self {
            name: Some(name.to_string()),
            accept_path: accept_path.to_string(),
            connect: connect.into(),
            properties: Vec::new(),
        }
    }

    pub fn unnamed(accept_path: &str, connect: impl Into<String>) -> Self {
        Self {
            name: None,
            ..Self::new("", accept_path, connect)
        }
    }

    pub fn property(mut self, key: &str, value: impl Into<String>) -> Self {
        self.properties.push((key.to_string(), value.into()));
        self
    }

    fn render(&self, port: u16, out: &mut String) {
        out.push_str("[[service]]\n");
        if let Some(name) = &self.name {
            let _ = writeln!(out, "name = \"{name}\"");
        }
        let _ = writeln!(out, "accept = \"http://127.0.0.1:{port}{}\"", self.accept_path);
        let connect = self.connect.replace("{proxy}", &format!("127.0.0.1:{port}"));
        let _ = writeln!(out, "connect = \"{connect}\"");
        if !self.properties.is_empty() {
            out.push_str("[service.properties]\n");
            for (key, value) in &self.properties {
                let _ = writeln!(out, "\"{key}\" = \"{value}\"");
            }
        }
        out.push('\n');
    }
}

pub struct ProxyHarnessBuilder {
    services: Vec<ServiceDef>,
    settings: Option<Box<dyn FnOnce(&mut Settings)>>,
}

impl Default for ProxyHarnessBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyHarnessBuilder {
    pub fn new() -> Self {
        Self {
            services: Vec::new(),
            settings: None,
        }
    }

    pub fn service(mut self, service: ServiceDef) -> Self {
        self.services.push(service);
        self
    }

    pub fn with_settings(mut self, adjust: impl FnOnce(&mut Settings) + 'static) -> Self {
        self.settings = Some(Box::new(adjust));
        self
    }

    pub async fn spawn(self) -> Result<ProxyHarness> {
        let port = find_free_port()?;
        let dir = TempDir::new()?;
        let services_path = dir.path().join("services.toml");

        let mut document = String::new();
        for service in &self.services {
            service.render(port, &mut document);
        }
        std::fs::write(&services_path, document).context("failed to write services file")?;

        let services = config::load_services(&services_path)?;
        let mut settings = default_test_settings(services_path);
        if let Some(adjust) = self.settings {
            adjust(&mut settings);
        }
        settings.validate()?;

        let app = AppContext::new(Arc::new(settings), None);
        let handle = tokio::spawn(proxy::run(app.clone(), services.into_inner()));

        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        wait_for_listener(addr).await?;

        Ok(ProxyHarness {
            _dir: dir,
            addr,
            app,
            handle,
        })
    }
}

pub struct ProxyHarness {
    _dir: TempDir,
    pub addr: SocketAddr,
    pub app: AppContext,
    handle: JoinHandle<Result<()>>,
}

impl ProxyHarness {
    pub async fn connect(&self) -> Result<ProxyClient> {
        ProxyClient::connect(self.addr).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExchangeEvent> {
        self.app.subscribe()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.app.pool_stats()
    }

    /// Waits for released origin connections to settle in the pool.
    pub async fn wait_for_idle(&self, expected: usize) -> bool {
        for _ in 0..50 {
            if self.pool_stats().idle == expected {
                return true;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        false
    }

    pub async fn shutdown(self) {
        self.handle.abort();
        let _ = self.handle.await;
    }
}
