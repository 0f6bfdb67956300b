use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail, ensure};
use http::Uri;
use serde::Deserialize;

use super::{
    ValidatedServices,
    model::{
        ForwardedMode, KeepAlivePolicy, Scheme, ServiceConfig, ServiceUri, TransportOverride,
    },
};

const KEEPALIVE: &str = "http.keepalive";
const KEEPALIVE_TIMEOUT: &str = "http.keepalive.timeout";
const KEEPALIVE_CONNECTIONS: &str = "http.keepalive.connections";
const MAXIMUM_REDIRECTS: &str = "http.maximum.redirects";
const USE_FORWARDED: &str = "use-forwarded";
const TRANSPORT: &str = "http.transport";
const SSL_ENCRYPTION: &str = "ssl.encryption";

const KNOWN_PROPERTIES: &[&str] = &[
    KEEPALIVE,
    KEEPALIVE_TIMEOUT,
    KEEPALIVE_CONNECTIONS,
    MAXIMUM_REDIRECTS,
    USE_FORWARDED,
    TRANSPORT,
    SSL_ENCRYPTION,
];

pub fn load_services<P: AsRef<Path>>(path: P) -> Result<ValidatedServices> {
    load_services_with_dir(path, None)
}

pub fn load_services_with_dir<P: AsRef<Path>>(
    path: P,
    dir: Option<&Path>,
) -> Result<ValidatedServices> {
    let mut raw_services = parse_services_file(path.as_ref())?;
    if let Some(dir) = dir {
        let files = collect_toml_files(dir, "services")?;
        for file in files {
            raw_services.extend(parse_services_file(&file)?);
        }
    }

    if raw_services.is_empty() {
        bail!("services config must define at least one service");
    }

    let mut services = Vec::with_capacity(raw_services.len());
    for raw in raw_services {
        let label = raw.name.clone().unwrap_or_else(|| raw.accept.clone());
        let service =
            build_service(raw).with_context(|| format!("invalid service '{}'", label))?;
        services.push(service);
    }

    ValidatedServices::new(services)
}

fn build_service(raw: RawService) -> Result<ServiceConfig> {
    let RawService {
        name,
        accept,
        connect,
        properties,
    } = raw;

    if let Some(name) = &name {
        ensure!(!name.trim().is_empty(), "service name must not be empty");
    }
    ensure!(
        accept.ends_with('/') == connect.ends_with('/'),
        "accept URI '{}' and connect URI '{}' must both end with '/' or neither may",
        accept,
        connect
    );

    let accept_uri =
        parse_service_uri(&accept).with_context(|| format!("invalid accept URI '{}'", accept))?;
    ensure!(
        accept_uri.scheme == Scheme::Http,
        "accept URI '{}' must use http or ws; TLS termination is not supported",
        accept
    );
    let connect_uri = parse_service_uri(&connect)
        .with_context(|| format!("invalid connect URI '{}'", connect))?;

    let properties = normalize_properties(properties)?;
    for key in properties.keys() {
        if !KNOWN_PROPERTIES.contains(&key.as_str()) {
            bail!("unknown property '{}'", key);
        }
    }

    let mut keepalive = KeepAlivePolicy::default();
    if let Some(value) = properties.get(KEEPALIVE) {
        keepalive.enabled = parse_toggle(KEEPALIVE, value)?;
    }
    if let Some(value) = properties.get(KEEPALIVE_TIMEOUT) {
        let secs: u64 = parse_number(KEEPALIVE_TIMEOUT, value)?;
        keepalive.timeout = Duration::from_secs(secs);
    }
    if let Some(value) = properties.get(KEEPALIVE_CONNECTIONS) {
        keepalive.max_idle = parse_number(KEEPALIVE_CONNECTIONS, value)?;
    }

    let max_redirects = match properties.get(MAXIMUM_REDIRECTS) {
        Some(value) => parse_number(MAXIMUM_REDIRECTS, value)?,
        None => 0,
    };

    let forwarded = match properties.get(USE_FORWARDED) {
        Some(value) => parse_forwarded_mode(value)?,
        None => ForwardedMode::Passthrough,
    };

    let transport = properties
        .get(TRANSPORT)
        .map(|value| parse_transport(value))
        .transpose()?;

    let encryption = match properties.get(SSL_ENCRYPTION) {
        Some(value) => parse_toggle(SSL_ENCRYPTION, value)?,
        None => true,
    };

    Ok(ServiceConfig {
        name: name.map(|name| Arc::<str>::from(name.as_str())),
        tls: connect_uri.scheme == Scheme::Https && encryption,
        accept: accept_uri,
        connect: connect_uri,
        keepalive,
        max_redirects,
        forwarded,
        transport,
    })
}

/// Parses an absolute `http`, `https`, `ws` or `wss` URI from the service table. WebSocket schemes
/// map onto their HTTP counterparts since the upgrade handshake is plain HTTP/1.1.
pub fn parse_service_uri(raw: &str) -> Result<ServiceUri> {
    let uri: Uri = raw
        .parse()
        .map_err(|err| anyhow!("failed to parse URI: {err}"))?;
    let scheme = match uri.scheme_str().map(str::to_ascii_lowercase).as_deref() {
        Some("http") | Some("ws") => Scheme::Http,
        Some("https") | Some("wss") => Scheme::Https,
        Some(other) => bail!("unsupported scheme '{}'", other),
        None => bail!("URI must be absolute"),
    };
    let authority = uri
        .authority()
        .ok_or_else(|| anyhow!("URI must include a host"))?;
    ensure!(
        !authority.as_str().contains('@'),
        "URI must not include user info"
    );
    ensure!(uri.query().is_none(), "URI must not include a query");
    let host = authority
        .host()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_ascii_lowercase();
    ensure!(!host.is_empty(), "URI must include a host");
    let port = authority.port_u16().unwrap_or(scheme.default_port());
    ensure!(port != 0, "URI port must not be 0");
    let path = if uri.path().is_empty() { "/" } else { uri.path() };

    Ok(ServiceUri {
        original: Arc::from(raw),
        scheme,
        host: Arc::from(host.as_str()),
        port,
        path: Arc::from(path),
    })
}

fn normalize_properties(raw: BTreeMap<String, toml::Value>) -> Result<BTreeMap<String, String>> {
    let mut properties = BTreeMap::new();
    for (key, value) in raw {
        let text = match value {
            toml::Value::String(text) => text,
            toml::Value::Integer(number) => number.to_string(),
            toml::Value::Boolean(flag) => flag.to_string(),
            other => bail!(
                "property '{}' must be a string, integer or boolean (got {})",
                key,
                other.type_str()
            ),
        };
        properties.insert(key, text.trim().to_string());
    }
    Ok(properties)
}

fn parse_toggle(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "enabled" | "true" => Ok(true),
        "disabled" | "false" => Ok(false),
        _ => bail!(
            "property '{}' must be 'enabled' or 'disabled' (got '{}')",
            key,
            value
        ),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| anyhow!("property '{}' must be a non-negative integer (got '{}')", key, value))
}

fn parse_forwarded_mode(value: &str) -> Result<ForwardedMode> {
    match value {
        "inject" => Ok(ForwardedMode::Inject),
        "exclude" => Ok(ForwardedMode::Exclude),
        _ => bail!(
            "property '{}' must be 'inject' or 'exclude' (got '{}')",
            USE_FORWARDED,
            value
        ),
    }
}

fn parse_transport(value: &str) -> Result<TransportOverride> {
    let address = match value.split_once("://") {
        Some((scheme, rest)) if scheme.eq_ignore_ascii_case("tcp") => rest,
        Some((scheme, _)) => bail!(
            "property '{}' uses unsupported transport '{}'",
            TRANSPORT,
            scheme
        ),
        None => value,
    };
    let address = address.trim_end_matches('/');
    let (host, port) = match address.rsplit_once(':') {
        Some((host, port)) if !port.contains(']') => (host, port),
        _ => bail!(
            "property '{}' must name host:port (got '{}')",
            TRANSPORT,
            value
        ),
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');
    ensure!(
        !host.is_empty(),
        "property '{}' must name a host (got '{}')",
        TRANSPORT,
        value
    );
    let port: u16 = port
        .parse()
        .map_err(|_| anyhow!("property '{}' has invalid port in '{}'", TRANSPORT, value))?;
    ensure!(port != 0, "property '{}' port must not be 0", TRANSPORT);
    Ok(TransportOverride {
        host: Arc::from(host),
        port,
    })
}

fn parse_services_file(path: &Path) -> Result<Vec<RawService>> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("failed to read services config at {}", path.display()))?;
    let doc: ServicesDoc = toml::from_str(&data)
        .with_context(|| format!("failed to parse services config at {}", path.display()))?;
    Ok(doc.services)
}

fn collect_toml_files(dir: &Path, kind: &str) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    if !dir.is_dir() {
        bail!(
            "{} config directory {} is not a directory",
            kind,
            dir.display()
        );
    }

    let mut files = Vec::new();
    let entries = fs::read_dir(dir)
        .with_context(|| format!("failed to read {} config directory {}", kind, dir.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| {
            format!(
                "failed to read entry in {} directory {}",
                kind,
                dir.display()
            )
        })?;
        let path = entry.path();
        let file_type = entry
            .file_type()
            .with_context(|| format!("failed to stat {} entry {}", kind, path.display()))?;
        if file_type.is_file() && is_toml_file(&path) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn is_toml_file(path: &Path) -> bool {
    path.extension()
        .and_then(OsStr::to_str)
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false)
}

#[derive(Debug, Deserialize)]
struct ServicesDoc {
    #[serde(default, rename = "service")]
    services: Vec<RawService>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawService {
    #[serde(default)]
    name: Option<String>,
    accept: String,
    connect: String,
    #[serde(default)]
    properties: BTreeMap<String, toml::Value>,
}
