use clap::error::ErrorKind;
use clap::{CommandFactory, Parser};
use devgate::config::{CliArgs, Config};
use devgate::gateway::GatewayServer;
use devgate::registry::{build_registry, Registry};
use devgate::serverless::ServerlessDefinitions;
use devgate::supervisor::{spawn_event_logger, StopListener, Supervisor};
use devgate::{PKG_NAME, VERSION};
use std::path::Path;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging; service runtime output is logged under the `service` target
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("devgate=debug".parse().expect("valid log directive"))
                .add_directive("service=info".parse().expect("valid log directive")),
        )
        .init();

    let args = CliArgs::parse();
    let config = Config::from_cli(&args).map_err(|e| {
        error!(error = %e, "Failed to load configuration");
        e
    })?;

    let Some(services_root) = config.services.resolved_root()? else {
        CliArgs::command()
            .error(
                ErrorKind::MissingRequiredArgument,
                "a services folder is required: pass --services-folder-path <DIR> or set services.root",
            )
            .exit();
    };

    print_startup_banner(&config, &services_root);

    if let Some(ignored) = config.server.ignored_base_port() {
        warn!(
            ignored,
            app_port = config.server.app_port,
            base_port = config.server.base_port(),
            "Base service port must exceed the app port, using app port + 1"
        );
    }

    // Discover services and freeze the routing table
    let source = ServerlessDefinitions::new(config.services.definition_file.clone());
    let registry = match build_registry(&services_root, config.server.base_port(), &source) {
        Ok(registry) => registry,
        Err(e) => {
            error!(root = %services_root.display(), error = %e, "Service discovery failed");
            if e.is_usage_error() {
                CliArgs::command()
                    .error(ErrorKind::ValueValidation, e.to_string())
                    .exit();
            }
            return Err(e.into());
        }
    };
    log_registry(&registry);

    // Bind before spawning anything so a taken port leaves no orphans behind
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let listen_addr = config.server.listen_addr()?;
    let gateway = GatewayServer::with_pool_config(
        listen_addr,
        registry.table(),
        shutdown_rx,
        config.server.pool_config(),
        config.server.upstream_timeout(),
    )
    .await
    .map_err(|e| {
        error!(addr = %listen_addr, error = %e, "Failed to bind gateway");
        anyhow::anyhow!("Failed to bind {}: {}", listen_addr, e)
    })?;
    let upstream_stats = gateway.upstream_stats();

    // Installed before any runtime exists so a stop during startup still reaches them
    let mut stop_listener = StopListener::install()?;

    let supervisor = Supervisor::new(config.runtime.runtime_command()?);
    let _event_logger = spawn_event_logger(supervisor.subscribe());

    let started = supervisor
        .start_all(&registry, &config.runtime_extra_args())
        .await;
    info!(
        started,
        total = registry.services().len(),
        "Service runtimes spawned"
    );

    let gateway_handle = tokio::spawn(async move {
        if let Err(e) = gateway.run().await {
            error!(error = %e, "Gateway server error");
        }
    });

    let signal = stop_listener.recv().await;

    // Children first, then stop accepting connections
    supervisor.stop_all(signal);
    let _ = shutdown_tx.send(true);

    let _ = tokio::time::timeout(Duration::from_secs(5), gateway_handle).await;

    info!(
        upstream_requests = upstream_stats.get_total_requests(),
        upstream_failures = upstream_stats.get_failed_requests(),
        exit_code = signal.exit_code(),
        "Shutdown complete"
    );
    std::process::exit(signal.exit_code());
}

fn print_startup_banner(config: &Config, services_root: &Path) {
    info!(name = PKG_NAME, version = VERSION, "Starting gateway");
    info!(
        bind = %config.server.bind,
        app_port = config.server.app_port,
        base_port = config.server.base_port(),
        upstream_timeout_secs = config.server.upstream_timeout_secs,
        "Server configuration"
    );
    info!(
        root = %services_root.display(),
        definition_file = %config.services.definition_file,
        stage = ?config.services.stage,
        runtime = %config.runtime.command,
        "Services configuration"
    );
}

fn log_registry(registry: &Registry) {
    for service in registry.services() {
        info!(
            service = %service.name,
            port = service.port,
            target = %service.target_host(),
            endpoints = service.endpoints.len(),
            "Service registered"
        );
    }
    for endpoint in registry.table().endpoints() {
        info!(route = %endpoint, "Route registered");
    }
}
