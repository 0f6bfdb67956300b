use std::cmp::Reverse;
use std::sync::Arc;

use crate::config::ServiceConfig;

/// Services sharing one accept socket.
#[derive(Clone, Debug, Default)]
pub struct ServiceTable {
    services: Vec<Arc<ServiceConfig>>,
}

/// A request matched to a service, with its path already rewritten for the connect side.
#[derive(Clone, Debug)]
pub struct Route {
    pub service: Arc<ServiceConfig>,
    pub path_and_query: String,
}

impl ServiceTable {
    pub fn new(services: Vec<Arc<ServiceConfig>>) -> Self {
        Self { services }
    }

    pub fn services(&self) -> &[Arc<ServiceConfig>] {
        &self.services
    }

    /// Picks the service whose accept path is the longest prefix of `path`, the first configured
    /// one on a tie. Services whose accept host equals the request host win over the rest of the
    /// socket's services.
    pub fn route(&self, host: Option<&str>, path: &str) -> Option<Route> {
        let host_matches: Vec<&Arc<ServiceConfig>> = match host {
            Some(host) => self
                .services
                .iter()
                .filter(|service| service.accept.host.eq_ignore_ascii_case(host))
                .collect(),
            None => Vec::new(),
        };
        let candidates: Vec<&Arc<ServiceConfig>> = if host_matches.is_empty() {
            self.services.iter().collect()
        } else {
            host_matches
        };

        candidates
            .into_iter()
            .filter(|service| path_has_prefix(path, &service.accept.path))
            .min_by_key(|service| Reverse(service.accept.path.len()))
            .map(|service| Route {
                service: service.clone(),
                path_and_query: rewrite_path(path, &service.accept.path, &service.connect.path),
            })
    }
}

/// Prefix match on a segment boundary, so `/api` matches `/api`, `/api/x` and `/api?q` but not
/// `/apix`.
fn path_has_prefix(path: &str, prefix: &str) -> bool {
    if path == "*" {
        return prefix == "/";
    }
    let Some(rest) = path.strip_prefix(prefix) else {
        return false;
    };
    prefix.ends_with('/') || rest.is_empty() || rest.starts_with(['/', '?'])
}

fn rewrite_path(path: &str, accept_prefix: &str, connect_prefix: &str) -> String {
    if path == "*" {
        return path.to_string();
    }
    let rest = path.strip_prefix(accept_prefix).unwrap_or(path);
    let mut out = String::with_capacity(connect_prefix.len() + rest.len());
    out.push_str(connect_prefix);
    out.push_str(rest);
    if !out.starts_with('/') {
        out.insert(0, '/');
    }
    out
}
