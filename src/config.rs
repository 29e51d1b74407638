use crate::serverless::DEFAULT_DEFINITION_FILE;
use crate::supervisor::RuntimeCommand;
use crate::upstream::PoolConfig;
use clap::Parser;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Command-line flags; any flag given overrides the config file
#[derive(Debug, Parser)]
#[command(
    name = "devgate",
    version,
    about = "Serve a folder of serverless services behind one local HTTP endpoint"
)]
pub struct CliArgs {
    /// Optional TOML configuration file
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Directory whose subdirectories are the services to run
    #[arg(long = "services-folder-path", alias = "servicesFolderPath", value_name = "DIR")]
    pub services_folder_path: Option<PathBuf>,

    /// Port the gateway listens on [default: 3001]
    #[arg(long = "app-port", alias = "appPort", value_name = "PORT")]
    pub app_port: Option<u16>,

    /// Base service port; the first service gets PORT + 1 [default: app port + 1]
    #[arg(long = "port", value_name = "PORT")]
    pub base_port: Option<u16>,

    /// Deployment stage forwarded to every service runtime
    #[arg(long)]
    pub stage: Option<String>,

    /// Address the gateway binds to [default: 127.0.0.1]
    #[arg(long)]
    pub bind: Option<String>,
}

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub services: ServicesConfig,

    #[serde(default)]
    pub runtime: RuntimeConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port the gateway listens on (default: 3001)
    #[serde(default = "default_app_port")]
    pub app_port: u16,

    /// Base service port; ignored unless it exceeds `app_port`
    pub base_port: Option<u16>,

    /// Upstream request timeout in seconds (default: none, wait forever)
    pub upstream_timeout_secs: Option<u64>,

    /// Maximum idle connections per service runtime (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl ServerConfig {
    /// Base service port actually used
    pub fn base_port(&self) -> u16 {
        match self.base_port {
            Some(port) if port > self.app_port => port,
            _ => self.app_port.saturating_add(1),
        }
    }

    /// A configured base port that was discarded for not exceeding the app port
    pub fn ignored_base_port(&self) -> Option<u16> {
        self.base_port.filter(|port| *port <= self.app_port)
    }

    pub fn listen_addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.bind, self.app_port)
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid bind address '{}': {}", self.bind, e))
    }

    pub fn upstream_timeout(&self) -> Option<Duration> {
        self.upstream_timeout_secs.map(Duration::from_secs)
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_idle_per_host: self.pool_max_idle_per_host,
            idle_timeout: Duration::from_secs(self.pool_idle_timeout_secs),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            app_port: default_app_port(),
            base_port: None,
            upstream_timeout_secs: None,
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServicesConfig {
    /// Directory whose immediate subdirectories are services
    pub root: Option<PathBuf>,

    /// Deployment stage passed to every runtime
    pub stage: Option<String>,

    /// Definition file inside each service directory (default: serverless.yml)
    #[serde(default = "default_definition_file")]
    pub definition_file: String,
}

impl ServicesConfig {
    /// Services root made absolute against the current directory
    pub fn resolved_root(&self) -> anyhow::Result<Option<PathBuf>> {
        match &self.root {
            Some(root) if root.is_absolute() => Ok(Some(root.clone())),
            Some(root) => Ok(Some(std::env::current_dir()?.join(root))),
            None => Ok(None),
        }
    }
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            root: None,
            stage: None,
            definition_file: default_definition_file(),
        }
    }
}

/// How each service runtime is invoked
#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    /// Command line, split with shell rules (default: `sls offline start`)
    #[serde(default = "default_runtime_command")]
    pub command: String,

    /// Flag preceding the assigned port (default: --port)
    #[serde(default = "default_port_flag")]
    pub port_flag: String,

    /// Flag preceding the stage (default: --stage)
    #[serde(default = "default_stage_flag")]
    pub stage_flag: String,
}

impl RuntimeConfig {
    pub fn runtime_command(&self) -> anyhow::Result<RuntimeCommand> {
        Ok(RuntimeCommand::parse(&self.command)?.with_port_flag(&self.port_flag))
    }

    /// Extra arguments appended after the port, carrying the stage if any
    pub fn extra_args(&self, stage: Option<&str>) -> Vec<String> {
        match stage {
            Some(stage) => vec![self.stage_flag.clone(), stage.to_string()],
            None => Vec::new(),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            command: default_runtime_command(),
            port_flag: default_port_flag(),
            stage_flag: default_stage_flag(),
        }
    }
}

// Default value functions
fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_app_port() -> u16 {
    3001
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_definition_file() -> String {
    DEFAULT_DEFINITION_FILE.to_string()
}

fn default_runtime_command() -> String {
    "sls offline start".to_string()
}

fn default_port_flag() -> String {
    "--port".to_string()
}

fn default_stage_flag() -> String {
    "--stage".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Build the effective configuration: config file (if any), then flags
    pub fn from_cli(args: &CliArgs) -> anyhow::Result<Self> {
        let mut config = match &args.config {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply_cli(args);
        config.validate()?;
        Ok(config)
    }

    pub fn apply_cli(&mut self, args: &CliArgs) {
        if let Some(root) = &args.services_folder_path {
            self.services.root = Some(root.clone());
        }
        if let Some(port) = args.app_port {
            self.server.app_port = port;
        }
        if let Some(port) = args.base_port {
            self.server.base_port = Some(port);
        }
        if let Some(stage) = &args.stage {
            self.services.stage = Some(stage.clone());
        }
        if let Some(bind) = &args.bind {
            self.server.bind = bind.clone();
        }
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if let Err(e) = self.runtime.runtime_command() {
            errors.push(e.to_string());
        }
        if self.runtime.port_flag.trim().is_empty() {
            errors.push("runtime.port_flag must not be empty".to_string());
        }
        if self.services.definition_file.trim().is_empty() {
            errors.push("services.definition_file must not be empty".to_string());
        }
        if self.server.app_port == 0 {
            errors.push("server.app_port must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    /// Arguments appended to every runtime invocation
    pub fn runtime_extra_args(&self) -> Vec<String> {
        self.runtime.extra_args(self.services.stage.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
bind = "0.0.0.0"
app_port = 4000
base_port = 5000
upstream_timeout_secs = 15

[services]
root = "/srv/services"
stage = "local"
definition_file = "serverless.yaml"

[runtime]
command = "npx serverless offline start --noTimeout"
port_flag = "--httpPort"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.server.base_port(), 5000);
        assert_eq!(config.server.upstream_timeout(), Some(Duration::from_secs(15)));
        assert_eq!(config.services.root, Some(PathBuf::from("/srv/services")));
        assert_eq!(config.services.definition_file, "serverless.yaml");
        assert_eq!(config.runtime.stage_flag, "--stage");
        assert_eq!(config.runtime_extra_args(), vec!["--stage", "local"]);

        let runtime = config.runtime.runtime_command().unwrap();
        assert_eq!(runtime.program, "npx");
        assert_eq!(runtime.port_flag, "--httpPort");
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.server.app_port, 3001);
        assert_eq!(config.server.base_port(), 3002);
        assert_eq!(config.server.upstream_timeout(), None);
        assert_eq!(config.server.pool_config().max_idle_per_host, 10);
        assert_eq!(config.services.definition_file, "serverless.yml");
        assert!(config.runtime_extra_args().is_empty());
        assert_eq!(config.runtime.runtime_command().unwrap(), RuntimeCommand::default());
    }

    #[test]
    fn test_base_port_must_exceed_app_port() {
        let mut server = ServerConfig {
            app_port: 3001,
            base_port: Some(3000),
            ..ServerConfig::default()
        };
        assert_eq!(server.base_port(), 3002);
        assert_eq!(server.ignored_base_port(), Some(3000));

        server.base_port = Some(3001);
        assert_eq!(server.base_port(), 3002);

        server.base_port = Some(4000);
        assert_eq!(server.base_port(), 4000);
        assert_eq!(server.ignored_base_port(), None);
    }

    #[test]
    fn test_cli_accepts_camel_case_aliases() {
        let args = CliArgs::try_parse_from([
            "devgate",
            "--servicesFolderPath",
            "services",
            "--appPort",
            "8080",
            "--port",
            "9000",
            "--stage",
            "dev",
        ])
        .unwrap();

        let config = Config::from_cli(&args).unwrap();
        assert_eq!(config.services.root, Some(PathBuf::from("services")));
        assert_eq!(config.server.app_port, 8080);
        assert_eq!(config.server.base_port(), 9000);
        assert_eq!(config.runtime_extra_args(), vec!["--stage", "dev"]);
    }

    #[test]
    fn test_cli_overrides_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devgate.toml");
        std::fs::write(
            &path,
            "[server]\napp_port = 4000\n\n[services]\nroot = \"/from/file\"\nstage = \"file\"\n",
        )
        .unwrap();

        let args = CliArgs::try_parse_from([
            "devgate",
            "--config",
            path.to_str().unwrap(),
            "--stage",
            "cli",
        ])
        .unwrap();

        let config = Config::from_cli(&args).unwrap();
        assert_eq!(config.server.app_port, 4000);
        assert_eq!(config.services.root, Some(PathBuf::from("/from/file")));
        assert_eq!(config.services.stage.as_deref(), Some("cli"));
    }

    #[test]
    fn test_relative_root_is_resolved() {
        let services = ServicesConfig {
            root: Some(PathBuf::from("services")),
            ..ServicesConfig::default()
        };
        let resolved = services.resolved_root().unwrap().unwrap();
        assert!(resolved.is_absolute());
        assert!(resolved.ends_with("services"));

        assert!(ServicesConfig::default().resolved_root().unwrap().is_none());
    }

    #[test]
    fn test_invalid_runtime_command_rejected() {
        let mut config = Config::default();
        config.runtime.command = "".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Runtime command is empty"));
    }

    #[test]
    fn test_listen_addr() {
        let server = ServerConfig::default();
        assert_eq!(server.listen_addr().unwrap(), "127.0.0.1:3001".parse::<SocketAddr>().unwrap());

        let bad = ServerConfig {
            bind: "not an address".to_string(),
            ..ServerConfig::default()
        };
        assert!(bad.listen_addr().is_err());
    }
}
