//! Path templates and the routing table
//!
//! Templates are matched segment by segment:
//! - literal segments compare exactly
//! - `:name` segments match one non-empty segment and bind its decoded value
//! - a trailing `*name` segment matches everything that remains
//!
//! The table is built once at startup and shared read-only afterwards.

use std::collections::HashMap;
use std::fmt;

/// Method value that matches every request method
pub const ANY_METHOD: &str = "any";

/// A single segment of a path template
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Segment {
    /// Must match the request segment exactly
    Literal(String),
    /// Matches any single non-empty segment
    Param(String),
    /// Matches one or more remaining segments (only meaningful in last position)
    Greedy(String),
}

/// An ordered sequence of template segments, e.g. `/items/:id`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PathTemplate {
    segments: Vec<Segment>,
}

impl PathTemplate {
    /// Parse a normalized template such as `/items/:id/sub/:subId`
    pub fn parse(template: &str) -> Self {
        let segments = split_path(template)
            .into_iter()
            .map(|segment| {
                if let Some(name) = segment.strip_prefix(':').filter(|n| !n.is_empty()) {
                    Segment::Param(name.to_string())
                } else if let Some(name) = segment.strip_prefix('*').filter(|n| !n.is_empty()) {
                    Segment::Greedy(name.to_string())
                } else {
                    Segment::Literal(segment.to_string())
                }
            })
            .collect();

        Self { segments }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// The template with parameter names erased, e.g. `/items/:`
    ///
    /// Two templates with the same shape match exactly the same paths.
    pub fn shape(&self) -> String {
        if self.segments.is_empty() {
            return "/".to_string();
        }
        self.segments
            .iter()
            .map(|segment| match segment {
                Segment::Literal(s) => format!("/{}", s),
                Segment::Param(_) => "/:".to_string(),
                Segment::Greedy(_) => "/*".to_string(),
            })
            .collect()
    }

    /// Match a request path (without query) against this template
    pub fn match_path(&self, path: &str) -> Option<PathParams> {
        let request = split_path(path);
        let last = self.segments.len().saturating_sub(1);
        let mut params = PathParams::default();

        for (index, segment) in self.segments.iter().enumerate() {
            match segment {
                Segment::Greedy(name) if index == last => {
                    let rest = request.get(index..)?;
                    if rest.is_empty() || rest.iter().all(|s| s.is_empty()) {
                        return None;
                    }
                    params.push(name, &rest.join("/"));
                    return Some(params);
                }
                Segment::Param(name) | Segment::Greedy(name) => {
                    let value = request.get(index).filter(|s| !s.is_empty())?;
                    params.push(name, value);
                }
                Segment::Literal(literal) => {
                    if request.get(index) != Some(&literal.as_str()) {
                        return None;
                    }
                }
            }
        }

        (request.len() == self.segments.len()).then_some(params)
    }
}

impl fmt::Display for PathTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return f.write_str("/");
        }
        for segment in &self.segments {
            match segment {
                Segment::Literal(s) => write!(f, "/{}", s)?,
                Segment::Param(name) => write!(f, "/:{}", name)?,
                Segment::Greedy(name) => write!(f, "/*{}", name)?,
            }
        }
        Ok(())
    }
}

/// Split a path into segments, ignoring the leading slash and one trailing slash
fn split_path(path: &str) -> Vec<&str> {
    let path = path.strip_prefix('/').unwrap_or(path);
    let path = path.strip_suffix('/').unwrap_or(path);
    if path.is_empty() {
        Vec::new()
    } else {
        path.split('/').collect()
    }
}

/// Values bound by named parameters, in template order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathParams(Vec<(String, String)>);

impl PathParams {
    fn push(&mut self, name: &str, raw: &str) {
        let value = urlencoding::decode(raw)
            .map(|v| v.into_owned())
            .unwrap_or_else(|_| raw.to_string());
        self.0.push((name.to_string(), value));
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// One routable endpoint with its resolved upstream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointDescriptor {
    /// Name of the owning service
    pub service: String,
    /// Lowercase HTTP method, or [`ANY_METHOD`]
    pub method: String,
    pub template: PathTemplate,
    /// Base URL of the service runtime, e.g. `http://localhost:3003`
    pub target_host: String,
}

impl EndpointDescriptor {
    pub fn new(service: &str, method: &str, template: &str, target_host: &str) -> Self {
        Self {
            service: service.to_string(),
            method: method.to_lowercase(),
            template: PathTemplate::parse(template),
            target_host: target_host.to_string(),
        }
    }

    /// Whether this endpoint accepts the given lowercase method
    pub fn accepts(&self, method: &str) -> bool {
        self.method == ANY_METHOD || self.method == method
    }

    /// Upstream URL for a request path (the raw path is forwarded, not rewritten)
    pub fn upstream_url(&self, path_and_query: &str) -> String {
        format!("{}{}", self.target_host, path_and_query)
    }
}

impl fmt::Display for EndpointDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} -> {} ({})",
            self.method.to_uppercase(),
            self.template,
            self.target_host,
            self.service
        )
    }
}

/// Two endpoints with the same method match exactly the same paths
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("route {method} {template} declared by '{first}' conflicts with {method} {conflicting} declared by '{second}'")]
pub struct DuplicateRoute {
    pub method: String,
    pub template: String,
    pub conflicting: String,
    pub first: String,
    pub second: String,
}

/// Result of matching a request against the table
#[derive(Debug, PartialEq, Eq)]
pub enum RouteMatch<'a> {
    Found {
        endpoint: &'a EndpointDescriptor,
        params: PathParams,
    },
    NotFound,
}

/// The immutable set of endpoints, in insertion order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingTable {
    endpoints: Vec<EndpointDescriptor>,
}

impl RoutingTable {
    /// Build a table, rejecting a method and template shape declared twice
    ///
    /// Parameter names are ignored: `/items/:id` and `/items/:itemId` conflict.
    pub fn build(endpoints: Vec<EndpointDescriptor>) -> Result<Self, DuplicateRoute> {
        let mut seen: HashMap<(String, String), &EndpointDescriptor> = HashMap::new();

        for endpoint in &endpoints {
            let key = (endpoint.method.clone(), endpoint.template.shape());
            if let Some(first) = seen.get(&key) {
                return Err(DuplicateRoute {
                    method: endpoint.method.to_uppercase(),
                    template: first.template.to_string(),
                    conflicting: endpoint.template.to_string(),
                    first: first.service.clone(),
                    second: endpoint.service.clone(),
                });
            }
            seen.insert(key, endpoint);
        }

        Ok(Self { endpoints })
    }

    /// Find the first endpoint accepting `method` whose template matches `path`
    pub fn resolve(&self, method: &str, path: &str) -> RouteMatch<'_> {
        let method = method.to_lowercase();
        self.endpoints
            .iter()
            .filter(|endpoint| endpoint.accepts(&method))
            .find_map(|endpoint| {
                endpoint
                    .template
                    .match_path(path)
                    .map(|params| RouteMatch::Found { endpoint, params })
            })
            .unwrap_or(RouteMatch::NotFound)
    }

    pub fn endpoints(&self) -> &[EndpointDescriptor] {
        &self.endpoints
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

impl fmt::Display for RoutingTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for endpoint in &self.endpoints {
            writeln!(f, "{}", endpoint)?;
        }
        Ok(())
    }
}
