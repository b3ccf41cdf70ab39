use clap::Parser;
use coderunner_core::api::{self, AppState};
use coderunner_core::config::Config;
use coderunner_core::net::{NetworkManager, SubnetAllocator};
use coderunner_core::orchestrator::Orchestrator;
use coderunner_core::pool::{ContainerPool, ContainerPoolConfig};
use coderunner_core::runtime::backend::BollardBackend;
use coderunner_core::session::SessionRegistry;
use coderunner_core::{CoreError, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "coderunner-core")]
#[command(about = "Concurrent code-execution orchestrator for the browser programming lab", long_about = None)]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Bind host (overrides config)
    #[arg(long)]
    bind: Option<String>,

    /// Bind port (overrides config)
    #[arg(long)]
    port: Option<u16>,

    /// Generate example configuration file
    #[arg(long, value_name = "FILE")]
    generate_config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Some(config_path) = args.generate_config {
        println!("Generating example configuration file: {:?}", config_path);
        Config::create_example(&config_path)?;
        println!("Example configuration file created successfully!");
        println!(
            "Edit the file and run: coderunner-core --config {:?}",
            config_path
        );
        return Ok(());
    }

    init_logging(&args.log_level)?;

    info!("coderunner-core v{} starting", env!("CARGO_PKG_VERSION"));
    if let Ok(cwd) = std::env::current_dir() {
        info!("Current working directory: {}", cwd.display());
    }

    let mut config = if let Some(config_path) = args.config {
        info!("Loading configuration from: {:?}", config_path);
        Config::from_file(config_path)?
    } else {
        info!("No configuration file specified, loading from environment/defaults");
        Config::from_env()?
    };

    if let Some(bind) = args.bind {
        config.listen_host = bind;
    }
    if let Some(port) = args.port {
        config.listen_port = port;
    }
    config.validate()?;

    let config = Arc::new(config);

    let backend: Arc<dyn coderunner_core::runtime::ContainerBackend> =
        Arc::new(BollardBackend::connect()?);

    let allocator = Arc::new(SubnetAllocator::new(&config.subnet_pools)?);
    let network_manager = Arc::new(NetworkManager::new(
        backend.clone(),
        allocator.clone(),
        config.session_network_prefix.clone(),
    ));
    network_manager.reconcile().await?;

    let sessions = Arc::new(SessionRegistry::new());

    let pool_config = ContainerPoolConfig {
        session_ttl: Duration::from_millis(config.session_ttl_ms),
        cleanup_interval: Duration::from_millis(config.cleanup_interval_ms),
        max_per_session: config.max_per_session,
        acquire_wait: Duration::from_millis(config.docker_command_timeout_ms),
        docker_memory: config.docker_memory as i64,
        docker_memory_swap: config.docker_memory_swap,
        docker_nano_cpus: (config.docker_cpus * 1_000_000_000.0) as i64,
    };
    let pool = ContainerPool::new(
        backend.clone(),
        network_manager.clone(),
        sessions.clone(),
        pool_config,
    );

    let orchestrator = Orchestrator::new(config.clone(), pool.clone(), backend.clone(), sessions.clone());

    let state = AppState {
        orchestrator: orchestrator.clone(),
        pool,
        network_manager,
        sessions,
        config: config.clone(),
    };

    let router = api::build_router(state);

    let addr = format!("{}:{}", config.listen_host, config.listen_port);
    info!("Binding listener on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| CoreError::Io(e))?;

    let shutdown = tokio::spawn(async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down gracefully...");
    });

    tokio::select! {
        result = axum::serve(listener, router) => {
            if let Err(e) = result {
                error!("Server error: {}", e);
                return Err(CoreError::Io(e));
            }
        }
        _ = shutdown => {
            info!("Draining admission queue and tearing down all sessions...");
            orchestrator.shutdown().await;
            info!("Server shutdown complete");
        }
    }

    Ok(())
}

fn init_logging(level: &str) -> Result<()> {
    let env_filter = EnvFilter::try_new(level)
        .map_err(|e| CoreError::ConfigInvalid(format!("invalid log level: {}", e)))?;

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer())
        .init();

    Ok(())
}
