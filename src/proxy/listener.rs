use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use tokio::net::{TcpListener, lookup_host};
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::config::ServiceConfig;

use super::service::ServiceTable;
use super::{AppContext, http};

/// An accept socket together with the services routed through it.
pub struct BoundListener {
    listener: TcpListener,
    table: Arc<ServiceTable>,
}

impl BoundListener {
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("failed to read listener address")
    }

    pub fn table(&self) -> &ServiceTable {
        &self.table
    }
}

/// Resolves every service's accept address and binds one listener per distinct socket address.
/// Services sharing an address share a [`ServiceTable`].
pub async fn bind_listeners(services: &[Arc<ServiceConfig>]) -> Result<Vec<BoundListener>> {
    let mut groups: Vec<(SocketAddr, Vec<Arc<ServiceConfig>>)> = Vec::new();
    for service in services {
        let host = service.accept.host.as_ref();
        let port = service.accept.port;
        let addr = lookup_host((host, port))
            .await
            .with_context(|| format!("failed to resolve accept address of {}", service.accept))?
            .next()
            .ok_or_else(|| anyhow!("accept host '{host}' resolved to no addresses"))?;
        match groups.iter_mut().find(|(existing, _)| *existing == addr) {
            Some((_, members)) => members.push(service.clone()),
            None => groups.push((addr, vec![service.clone()])),
        }
    }

    let mut bound = Vec::with_capacity(groups.len());
    for (addr, members) in groups {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind listener on {addr}"))?;
        let local_addr = listener.local_addr().unwrap_or(addr);
        info!(
            address = %local_addr,
            services = members.len(),
            "proxy listener started"
        );
        bound.push(BoundListener {
            listener,
            table: Arc::new(ServiceTable::new(members)),
        });
    }
    Ok(bound)
}

/// Runs the accept loops of all listeners. Returns only if one of them stops.
pub async fn serve_listeners(listeners: Vec<BoundListener>, app: AppContext) -> Result<()> {
    if listeners.is_empty() {
        bail!("no listeners to serve");
    }
    let mut tasks = JoinSet::new();
    for bound in listeners {
        tasks.spawn(accept_loop(bound, app.clone()));
    }
    match tasks.join_next().await {
        Some(Ok(result)) => result,
        Some(Err(err)) => Err(anyhow!(err).context("listener task failed")),
        None => Ok(()),
    }
}

async fn accept_loop(bound: BoundListener, app: AppContext) -> Result<()> {
    let BoundListener { listener, table } = bound;
    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                error!(error = %err, "failed to accept incoming connection");
                continue;
            }
        };
        debug!(peer = %peer_addr, "accepted connection");
        if let Err(err) = stream.set_nodelay(true) {
            debug!(peer = %peer_addr, error = %err, "failed to set TCP_NODELAY on client stream");
        }
        let connection_app = app.clone();
        let connection_table = table.clone();
        tokio::spawn(async move {
            if let Err(err) =
                http::serve_connection(stream, peer_addr, connection_table, connection_app).await
            {
                debug!(peer = %peer_addr, error = %err, "connection closed with error");
            }
        });
    }
}
