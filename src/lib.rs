pub mod cli;
pub mod config;
pub mod io_util;
pub mod logging;
pub mod proxy;
pub mod settings;
pub mod util;

use std::sync::Arc;

use anyhow::{Result, ensure};
use rustls::crypto::ring;
use rustls::{RootCertStore, client::ClientConfig};
use rustls_native_certs as native_certs;
use tracing::warn;

use crate::config::ServiceConfig;
use crate::settings::Settings;

pub async fn run(settings: Settings) -> Result<()> {
    let settings = Arc::new(settings);
    let services = settings.load_services()?.into_inner();
    let tls = if services.iter().any(|service| needs_tls(service)) {
        Some(build_tls_client_config()?)
    } else {
        None
    };

    let app = proxy::AppContext::new(settings, tls);
    proxy::run(app, services).await
}

fn needs_tls(service: &ServiceConfig) -> bool {
    service.tls && service.connect.scheme == config::Scheme::Https
}

/// Client configuration for connect-side TLS, trusting the system root store.
pub fn build_tls_client_config() -> Result<Arc<ClientConfig>> {
    let provider = ring::default_provider();
    let builder = ClientConfig::builder_with_provider(provider.into());
    let builder = builder.with_safe_default_protocol_versions()?;

    let mut root_store = RootCertStore::empty();
    let mut anchors_loaded = 0usize;

    match native_certs::load_native_certs() {
        Ok(certs) => {
            let (added, ignored) = root_store.add_parsable_certificates(certs);
            if ignored > 0 {
                warn!(ignored, "ignored {ignored} invalid system trust anchors");
            }
            anchors_loaded += added;
        }
        Err(err) => {
            warn!(error = %err, "failed to load system trust anchors");
        }
    }

    ensure!(
        anchors_loaded > 0,
        "no trust anchors available for TLS origins; install system certificates"
    );

    let mut client = builder
        .with_root_certificates(Arc::new(root_store))
        .with_no_client_auth();
    client.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(client))
}
