//! Process entry point: parses configuration, starts the resource groups and
//! the HTTP server, and shuts both down on Ctrl+C or SIGTERM.

use std::time::Duration;

use clap::Parser;
use handoff_server::network::{NetworkConfig, NetworkModule};
use handoff_server::service::{
    Lifecycle, ResourceGroupConfig, ResourceKind, ServerConfig, CHAT_LOG_DB, EXTERNAL_SERVICE,
    QUERY_RECORD_DB,
};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Runtime configuration for the `handoff-server` binary.
///
/// Every option can also be set through the environment variable named in
/// its help text.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "handoff-server",
    version,
    about = "Staged request pipelines over bounded per-resource worker pools"
)]
struct CliArgs {
    /// Bind address.
    #[arg(long, env = "HANDOFF_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Listen port. 0 picks a free port.
    #[arg(long, env = "HANDOFF_PORT", default_value_t = 8080)]
    port: u16,

    /// Worker threads (and connections) per database group.
    #[arg(long, env = "HANDOFF_DB_POOL_SIZE", default_value_t = 10)]
    db_pool_size: usize,

    /// Worker threads of the external-service group.
    #[arg(long, env = "HANDOFF_EXTERNAL_POOL_SIZE", default_value_t = 30)]
    external_pool_size: usize,

    /// Drain timeout of each group's pool at shutdown.
    #[arg(long, env = "HANDOFF_SHUTDOWN_TIMEOUT_SECS", default_value_t = 5)]
    shutdown_timeout_secs: u64,

    /// Simulated latency of one external call.
    #[arg(long, env = "HANDOFF_EXTERNAL_LATENCY_MS", default_value_t = 1000)]
    external_latency_ms: u64,

    /// Keep the chat log in the query database instead of its own.
    #[arg(long, env = "HANDOFF_SINGLE_DATABASE", default_value_t = false)]
    single_database: bool,

    /// Emit logs as JSON lines.
    #[arg(long, env = "HANDOFF_LOG_JSON", default_value_t = false)]
    log_json: bool,
}

impl CliArgs {
    fn server_config(&self) -> ServerConfig {
        let shutdown_timeout = Duration::from_secs(self.shutdown_timeout_secs);
        let mut external = ResourceGroupConfig::external(EXTERNAL_SERVICE, self.external_pool_size)
            .with_shutdown_timeout(shutdown_timeout);
        external.kind = ResourceKind::External {
            processing_time: Duration::from_millis(self.external_latency_ms),
        };

        let mut groups = vec![ResourceGroupConfig::database(QUERY_RECORD_DB, self.db_pool_size)
            .with_shutdown_timeout(shutdown_timeout)];
        if !self.single_database {
            groups.push(
                ResourceGroupConfig::database(CHAT_LOG_DB, self.db_pool_size)
                    .with_shutdown_timeout(shutdown_timeout),
            );
        }
        groups.push(external);

        let chat_group = if self.single_database {
            QUERY_RECORD_DB
        } else {
            CHAT_LOG_DB
        };
        ServerConfig {
            groups,
            chat_group: chat_group.to_string(),
            ..ServerConfig::default()
        }
    }

    fn network_config(&self) -> NetworkConfig {
        NetworkConfig {
            host: self.host.clone(),
            port: self.port,
            ..NetworkConfig::default()
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C signal"),
        () = terminate => info!("Received SIGTERM signal"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_tracing(args.log_json);

    let mut lifecycle = Lifecycle::start(args.server_config())?;
    let mut network = NetworkModule::new(args.network_config(), &lifecycle)?;
    let port = network.start().await?;
    lifecycle.start_keepalive();
    info!(port, groups = lifecycle.resources().len(), "handoff server started");

    let served = network.serve(shutdown_signal()).await;
    if let Err(err) = &served {
        error!(error = %err, "server stopped with an error");
    }

    let report = lifecycle.shutdown().await;
    if !report.all_drained() {
        warn!(
            elapsed_ms = report.elapsed_ms(),
            "some resource groups did not drain in time"
        );
    }
    served
}
