use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, bail, ensure};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::cli::{Cli, LogFormat};
use crate::config as runtime_config;

fn default_client_timeout() -> u64 {
    30
}

fn default_client_idle_timeout() -> u64 {
    60
}

fn default_upstream_connect_timeout() -> u64 {
    5
}

fn default_response_header_timeout() -> u64 {
    30
}

fn default_upstream_timeout() -> u64 {
    60
}

fn default_upgrade_idle_timeout() -> u64 {
    300
}

fn default_max_request_header_size() -> usize {
    32 * 1024
}

fn default_max_response_header_size() -> usize {
    32 * 1024
}

fn default_request_buffer_limit() -> usize {
    64 * 1024
}

fn default_redirect_drain_limit() -> u64 {
    64 * 1024
}

fn default_pool_reaper_interval_ms() -> u64 {
    1000
}

fn default_event_channel_capacity() -> usize {
    1024
}

fn default_log_format() -> LogFormat {
    LogFormat::Json
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub services: PathBuf,
    #[serde(default)]
    pub services_dir: Option<PathBuf>,
    #[serde(default = "default_log_format")]
    pub log: LogFormat,
    /// Per-operation I/O timeout on the accepted (client) side, in seconds.
    #[serde(default = "default_client_timeout")]
    pub client_timeout: u64,
    /// How long a persistent client connection may sit idle between requests, in seconds.
    #[serde(default = "default_client_idle_timeout")]
    pub client_idle_timeout: u64,
    #[serde(default = "default_upstream_connect_timeout")]
    pub upstream_connect_timeout: u64,
    #[serde(default = "default_response_header_timeout")]
    pub response_header_timeout: u64,
    /// Per-operation I/O timeout on the origin side once headers are exchanged, in seconds.
    #[serde(default = "default_upstream_timeout")]
    pub upstream_timeout: u64,
    #[serde(default = "default_upgrade_idle_timeout")]
    pub upgrade_idle_timeout: u64,
    #[serde(default = "default_max_request_header_size")]
    pub max_request_header_size: usize,
    #[serde(default = "default_max_response_header_size")]
    pub max_response_header_size: usize,
    /// Request bodies up to this many bytes are buffered so the request can be replayed on a
    /// stale pooled connection or re-sent to a redirect target.
    #[serde(default = "default_request_buffer_limit")]
    pub request_buffer_limit: usize,
    /// Largest length-delimited redirect body that is drained to keep the origin connection
    /// reusable; larger bodies close the connection instead.
    #[serde(default = "default_redirect_drain_limit")]
    pub redirect_drain_limit: u64,
    #[serde(default = "default_pool_reaper_interval_ms")]
    pub pool_reaper_interval_ms: u64,
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

impl Settings {
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut builder = Config::builder();
        let config_path = resolve_config_path(cli)?;

        builder = builder.add_source(File::from(config_path.clone()).required(true));

        builder = builder.add_source(
            Environment::with_prefix("PROXYGATE")
                .separator("__")
                .try_parsing(true),
        );

        let cfg = builder.build().map_err(to_anyhow)?;
        let mut settings: Settings = cfg.try_deserialize().map_err(to_anyhow)?;
        settings.apply_base_dir(&config_path);
        settings.validate()?;
        Ok(settings)
    }

    /// Load and validate the service table using the resolved paths from these settings.
    pub fn load_services(&self) -> Result<runtime_config::ValidatedServices> {
        runtime_config::load_services_with_dir(&self.services, self.services_dir.as_deref())
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout)
    }

    pub fn client_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.client_idle_timeout)
    }

    pub fn upstream_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_connect_timeout)
    }

    pub fn response_header_timeout(&self) -> Duration {
        Duration::from_secs(self.response_header_timeout)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout)
    }

    pub fn upgrade_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.upgrade_idle_timeout)
    }

    pub fn pool_reaper_interval(&self) -> Duration {
        Duration::from_millis(self.pool_reaper_interval_ms)
    }
}

fn to_anyhow(err: ConfigError) -> anyhow::Error {
    anyhow::anyhow!(err)
}

impl Cli {
    pub fn config_path(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

fn resolve_config_path(cli: &Cli) -> Result<PathBuf> {
    if let Some(path) = cli.config_path() {
        return Ok(path.to_path_buf());
    }

    for candidate in default_config_candidates() {
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    bail!(
        "no configuration file provided via --config and none found in default locations: {}",
        default_config_candidates()
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );
}

fn default_config_candidates() -> [PathBuf; 2] {
    [
        PathBuf::from("/etc/proxygate/proxygate.toml"),
        PathBuf::from("proxygate.toml"),
    ]
}

impl Settings {
    fn apply_base_dir(&mut self, config_path: &Path) {
        let base_dir = config_path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        self.services = absolutize(&self.services, base_dir);
        self.services_dir = self
            .services_dir
            .as_ref()
            .map(|path| absolutize(path, base_dir));
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.max_request_header_size > 0,
            "max_request_header_size must be greater than 0 (got {})",
            self.max_request_header_size
        );
        ensure!(
            self.max_response_header_size > 0,
            "max_response_header_size must be greater than 0 (got {})",
            self.max_response_header_size
        );
        ensure!(
            self.client_timeout > 0,
            "client_timeout must be greater than 0 seconds (got {})",
            self.client_timeout
        );
        ensure!(
            self.client_idle_timeout > 0,
            "client_idle_timeout must be greater than 0 seconds (got {})",
            self.client_idle_timeout
        );
        ensure!(
            self.upstream_connect_timeout > 0,
            "upstream_connect_timeout must be greater than 0 seconds (got {})",
            self.upstream_connect_timeout
        );
        ensure!(
            self.response_header_timeout > 0,
            "response_header_timeout must be greater than 0 seconds (got {})",
            self.response_header_timeout
        );
        ensure!(
            self.upstream_timeout > 0,
            "upstream_timeout must be greater than 0 seconds (got {})",
            self.upstream_timeout
        );
        ensure!(
            self.upgrade_idle_timeout > 0,
            "upgrade_idle_timeout must be greater than 0 seconds (got {})",
            self.upgrade_idle_timeout
        );
        ensure!(
            self.pool_reaper_interval_ms > 0,
            "pool_reaper_interval_ms must be greater than 0 (got {})",
            self.pool_reaper_interval_ms
        );
        ensure!(
            self.event_channel_capacity > 0,
            "event_channel_capacity must be greater than 0 (got {})",
            self.event_channel_capacity
        );
        Ok(())
    }
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
