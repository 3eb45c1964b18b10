//! Destination selection.
//!
//! Routing is connection-level and uses exact server-name matches only
//! (no wildcards). Names are compared after normalization, so the service map
//! keys are normalized once when the router is built.

use std::collections::HashMap;

use tracing::debug;

use super::sni::normalize_server_name;
use crate::error::ProxyError;

/// Where a connection should go, and why.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteSource {
    /// The server name matched a service map entry.
    ServiceMap,
    /// Fell back to the default address.
    Default,
}

/// Resolves destination addresses from server names.
#[derive(Debug, Clone)]
pub struct Router {
    route_on_sni: bool,
    default_addr: Option<String>,
    services: HashMap<String, String>,
}

impl Router {
    /// Build a router. Keys of `services` are normalized.
    pub fn new(
        route_on_sni: bool,
        default_addr: Option<String>,
        services: &HashMap<String, String>,
    ) -> Self {
        let services = services
            .iter()
            .map(|(name, addr)| (normalize_server_name(name), addr.clone()))
            .collect();

        Self {
            route_on_sni,
            default_addr,
            services,
        }
    }

    /// Pick the destination for a connection that asked for `server_name`.
    ///
    /// An empty server name never matches the service map.
    pub fn resolve(&self, server_name: &str) -> Result<(&str, RouteSource), ProxyError> {
        if self.route_on_sni && !server_name.is_empty() {
            if let Some(addr) = self.services.get(&normalize_server_name(server_name)) {
                debug!(server_name, addr = %addr, "Route matched by SNI");
                return Ok((addr.as_str(), RouteSource::ServiceMap));
            }
        }

        match &self.default_addr {
            Some(addr) => {
                debug!(server_name, addr = %addr, "Using default route");
                Ok((addr.as_str(), RouteSource::Default))
            }
            None => Err(ProxyError::NoDestination {
                server_name: server_name.to_string(),
            }),
        }
    }
}
