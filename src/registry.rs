//! Service discovery, port assignment and routing table construction

use crate::routing::{DuplicateRoute, EndpointDescriptor, RoutingTable};
use crate::serverless::{DefinitionError, EndpointSource};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Errors that prevent the registry from being built
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("cannot read services root {}: {source}", path.display())]
    ReadRoot {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("service '{service}': {source}")]
    Definition {
        service: String,
        #[source]
        source: DefinitionError,
    },
    #[error("no port left for service '{service}' (base port {base_port})")]
    PortExhausted { service: String, base_port: u16 },
    #[error(transparent)]
    DuplicateRoute(#[from] DuplicateRoute),
}

impl DiscoveryError {
    /// The services folder given on the command line cannot be used at all
    pub fn is_usage_error(&self) -> bool {
        matches!(self, DiscoveryError::ReadRoot { .. })
    }
}

/// A discovered service with its assigned port and endpoints
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    /// Directory name, used as the service identifier
    pub name: String,
    pub dir: PathBuf,
    pub port: u16,
    pub endpoints: Vec<EndpointDescriptor>,
}

impl ServiceDescriptor {
    pub fn target_host(&self) -> String {
        target_host(self.port)
    }
}

/// All discovered services plus the routing table built from them
#[derive(Debug, Clone)]
pub struct Registry {
    services: Vec<ServiceDescriptor>,
    table: Arc<RoutingTable>,
}

impl Registry {
    pub fn services(&self) -> &[ServiceDescriptor] {
        &self.services
    }

    /// Shared handle to the frozen routing table
    pub fn table(&self) -> Arc<RoutingTable> {
        Arc::clone(&self.table)
    }
}

/// Base URL of the runtime listening on `port`
pub fn target_host(port: u16) -> String {
    format!("http://localhost:{}", port)
}

/// Discover services under `root_dir` and build the routing table
///
/// Subdirectories are taken in file name order; the service at index `i`
/// gets port `base_port + 1 + i`.
pub fn build_registry(
    root_dir: &Path,
    base_port: u16,
    source: &dyn EndpointSource,
) -> Result<Registry, DiscoveryError> {
    let service_dirs = discover_service_dirs(root_dir)?;
    let mut services = Vec::with_capacity(service_dirs.len());
    let mut all_endpoints = Vec::new();

    for (index, dir) in service_dirs.into_iter().enumerate() {
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let port = u16::try_from(index)
            .ok()
            .and_then(|i| base_port.checked_add(1)?.checked_add(i))
            .ok_or_else(|| DiscoveryError::PortExhausted {
                service: name.clone(),
                base_port,
            })?;

        let host = target_host(port);
        let endpoints: Vec<EndpointDescriptor> = source
            .endpoints(&dir)
            .map_err(|source| DiscoveryError::Definition {
                service: name.clone(),
                source,
            })?
            .into_iter()
            .map(|declared| EndpointDescriptor::new(&name, &declared.method, &declared.path, &host))
            .collect();

        debug!(service = %name, port, endpoints = endpoints.len(), "Service discovered");

        all_endpoints.extend(endpoints.iter().cloned());
        services.push(ServiceDescriptor {
            name,
            dir,
            port,
            endpoints,
        });
    }

    let table = RoutingTable::build(all_endpoints)?;
    info!(
        services = services.len(),
        routes = table.len(),
        "Routing table built"
    );

    Ok(Registry {
        services,
        table: Arc::new(table),
    })
}

/// Immediate subdirectories of `root_dir`, sorted by name
fn discover_service_dirs(root_dir: &Path) -> Result<Vec<PathBuf>, DiscoveryError> {
    let read_root = |source| DiscoveryError::ReadRoot {
        path: root_dir.to_path_buf(),
        source,
    };

    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(root_dir).map_err(read_root)? {
        let path = entry.map_err(read_root)?.path();
        // Follows symlinks, so a linked service directory counts
        if path.is_dir() {
            dirs.push(path);
        }
    }

    dirs.sort();
    Ok(dirs)
}
