//! Endpoint extraction from serverless service definitions
//!
//! Each service directory holds a `serverless.yml` describing its functions
//! and their triggers. Only HTTP triggers matter here: every function with at
//! least one `http` event contributes one endpoint (the first such event).

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Definition file looked up in each service directory
pub const DEFAULT_DEFINITION_FILE: &str = "serverless.yml";

/// An HTTP endpoint as declared by a service, already normalized
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredEndpoint {
    /// Normalized path template, e.g. `/items/:id`
    pub path: String,
    /// Lowercase HTTP method
    pub method: String,
}

impl DeclaredEndpoint {
    pub fn new(path: &str, method: &str) -> Self {
        Self {
            path: normalize_declared_path(path),
            method: normalize_method(method),
        }
    }
}

/// Errors reading or interpreting a service definition
#[derive(Debug, thiserror::Error)]
pub enum DefinitionError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("function '{function}' has an invalid http event: {reason}")]
    InvalidHttpEvent { function: String, reason: String },
}

/// Source of the endpoints a service declares
///
/// The registry only depends on this trait, so the definition format can be
/// swapped without touching discovery or routing.
pub trait EndpointSource: Send + Sync {
    fn endpoints(&self, service_dir: &Path) -> Result<Vec<DeclaredEndpoint>, DefinitionError>;
}

/// Reads endpoints from a YAML definition file inside each service directory
#[derive(Debug, Clone)]
pub struct ServerlessDefinitions {
    file_name: String,
}

impl ServerlessDefinitions {
    pub fn new(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
        }
    }

    pub fn definition_path(&self, service_dir: &Path) -> PathBuf {
        service_dir.join(&self.file_name)
    }
}

impl Default for ServerlessDefinitions {
    fn default() -> Self {
        Self::new(DEFAULT_DEFINITION_FILE)
    }
}

impl EndpointSource for ServerlessDefinitions {
    fn endpoints(&self, service_dir: &Path) -> Result<Vec<DeclaredEndpoint>, DefinitionError> {
        let path = self.definition_path(service_dir);
        let content = std::fs::read_to_string(&path).map_err(|source| DefinitionError::Read {
            path: path.clone(),
            source,
        })?;
        let definition = ServiceDefinition::from_yaml(&content)
            .map_err(|source| DefinitionError::Parse { path, source })?;
        extract_endpoints(&definition)
    }
}

/// The parts of a service definition this crate cares about
#[derive(Debug, Default, Deserialize)]
pub struct ServiceDefinition {
    /// Function name -> function definition, in declaration order
    #[serde(default)]
    functions: Option<serde_yaml::Mapping>,
}

impl ServiceDefinition {
    pub fn from_yaml(content: &str) -> Result<Self, serde_yaml::Error> {
        // An empty document deserializes to unit, not to an empty struct
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content)
    }
}

#[derive(Debug, Default, Deserialize)]
struct FunctionDefinition {
    #[serde(default)]
    events: Option<Vec<serde_yaml::Value>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum HttpEvent {
    /// `http: GET items/{id}`
    Shorthand(String),
    /// `http: { path: items/{id}, method: get }`
    Detailed {
        path: Option<String>,
        method: Option<String>,
    },
}

/// Collect one endpoint per function that has an HTTP event
pub fn extract_endpoints(
    definition: &ServiceDefinition,
) -> Result<Vec<DeclaredEndpoint>, DefinitionError> {
    let Some(functions) = &definition.functions else {
        return Ok(Vec::new());
    };

    let mut endpoints = Vec::new();
    for (name, value) in functions {
        let function_name = name
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| format!("{:?}", name));

        if value.is_null() {
            continue;
        }

        let function: FunctionDefinition =
            serde_yaml::from_value(value.clone()).map_err(|e| DefinitionError::InvalidHttpEvent {
                function: function_name.clone(),
                reason: e.to_string(),
            })?;

        let first_http = function
            .events
            .unwrap_or_default()
            .into_iter()
            .find_map(|event| event.get("http").cloned());

        if let Some(http) = first_http {
            endpoints.push(http_endpoint(&function_name, http)?);
        }
    }

    Ok(endpoints)
}

fn http_endpoint(function: &str, http: serde_yaml::Value) -> Result<DeclaredEndpoint, DefinitionError> {
    let invalid = |reason: &str| DefinitionError::InvalidHttpEvent {
        function: function.to_string(),
        reason: reason.to_string(),
    };

    let event: HttpEvent =
        serde_yaml::from_value(http).map_err(|e| invalid(&e.to_string()))?;

    match event {
        HttpEvent::Shorthand(line) => {
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next()) {
                (Some(method), Some(path)) => Ok(DeclaredEndpoint::new(path, method)),
                _ => Err(invalid("shorthand must be '<METHOD> <path>'")),
            }
        }
        HttpEvent::Detailed { path, method } => {
            let path = path.ok_or_else(|| invalid("missing 'path'"))?;
            let method = method.ok_or_else(|| invalid("missing 'method'"))?;
            Ok(DeclaredEndpoint::new(&path, &method))
        }
    }
}

/// Rewrite `{name}` segments to `:name` (and `{name+}` to `*name`)
///
/// The result always carries exactly one leading slash.
pub fn normalize_declared_path(path: &str) -> String {
    let segments: Vec<String> = path
        .trim_start_matches('/')
        .split('/')
        .map(|segment| {
            match segment
                .strip_prefix('{')
                .and_then(|s| s.strip_suffix('}'))
                .filter(|name| !name.is_empty())
            {
                Some(name) => match name.strip_suffix('+') {
                    Some(greedy) => format!("*{}", greedy),
                    None => format!(":{}", name),
                },
                None => segment.to_string(),
            }
        })
        .collect();

    format!("/{}", segments.join("/"))
}

fn normalize_method(method: &str) -> String {
    match method.trim() {
        "*" => crate::routing::ANY_METHOD.to_string(),
        m => m.to_lowercase(),
    }
}
