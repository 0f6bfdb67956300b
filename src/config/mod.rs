mod loader;
pub mod model;

use std::collections::HashSet;
use std::ops::Deref;
use std::sync::Arc;

use anyhow::{Result, bail};

pub use loader::{load_services, load_services_with_dir, parse_service_uri};
pub use model::{
    ForwardedMode, KeepAlivePolicy, Scheme, ServiceConfig, ServiceUri, TransportOverride,
};

/// Checks the cross-service invariants of a service table: no accept URI may be claimed twice
/// and no service may forward to itself. Programmatic tables (tests, embedders) get the same
/// guarantees as the file loader.
pub fn validate_services(services: &[ServiceConfig]) -> Result<()> {
    let mut seen_accept = HashSet::new();
    let mut seen_names = HashSet::new();
    for service in services {
        if let Some(name) = &service.name
            && !seen_names.insert(name.clone())
        {
            bail!("duplicate service name '{}'", name);
        }
        if service.accept.original == service.connect.original {
            bail!(
                "service '{}' has identical accept and connect URIs '{}'",
                service.label(),
                service.accept
            );
        }
        let accept_key = (
            service.accept.host.to_ascii_lowercase(),
            service.accept.port,
            service.accept.path.clone(),
        );
        if !seen_accept.insert(accept_key) {
            bail!(
                "accept URI '{}' is claimed by more than one service",
                service.accept
            );
        }
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct ValidatedServices {
    inner: Vec<Arc<ServiceConfig>>,
}

impl ValidatedServices {
    pub fn new(services: Vec<ServiceConfig>) -> Result<Self> {
        validate_services(&services)?;
        Ok(Self {
            inner: services.into_iter().map(Arc::new).collect(),
        })
    }

    pub fn into_inner(self) -> Vec<Arc<ServiceConfig>> {
        self.inner
    }
}

impl AsRef<[Arc<ServiceConfig>]> for ValidatedServices {
    fn as_ref(&self) -> &[Arc<ServiceConfig>] {
        &self.inner
    }
}

impl Deref for ValidatedServices {
    type Target = [Arc<ServiceConfig>];

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}
