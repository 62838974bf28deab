use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use machine_api_operator::controller::{self, KubeClusterApi, Operator, OperatorSettings};
use machine_api_operator::telemetry::{self, LogFormat};
use machine_api_operator::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the operator
    Run(RunArgs),
    /// Show version and build information
    Version,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Namespace the operator runs in and manages components for
    #[arg(long, env = "OPERATOR_NAMESPACE", default_value = "openshift-machine-api")]
    namespace: String,

    /// Name part of the reconciliation key
    #[arg(long, env = "OPERATOR_NAME", default_value = "machine-api-operator")]
    name: String,

    /// Path to the JSON image manifest
    #[arg(
        long,
        env = "IMAGES_JSON",
        default_value = "/etc/machine-api-operator/images.json"
    )]
    images_json: PathBuf,

    /// Number of sync workers
    #[arg(long, env = "WORKERS", default_value_t = 1)]
    workers: usize,

    /// Seconds between bootstrap attempts
    #[arg(long, env = "BOOTSTRAP_POLL_INTERVAL_SECS", default_value_t = 5)]
    bootstrap_poll_interval_secs: u64,

    /// Seconds before bootstrap gives up
    #[arg(long, env = "BOOTSTRAP_TIMEOUT_SECS", default_value_t = 600)]
    bootstrap_timeout_secs: u64,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Port for the health and status API
    #[arg(long, env = "HTTP_PORT", default_value_t = 8080)]
    http_port: u16,
}

impl RunArgs {
    fn settings(&self) -> Result<OperatorSettings, Error> {
        if self.workers == 0 {
            return Err(Error::ConfigError("at least one worker is required".to_string()));
        }
        if self.bootstrap_poll_interval_secs == 0 {
            return Err(Error::ConfigError(
                "bootstrap poll interval must be positive".to_string(),
            ));
        }
        Ok(OperatorSettings {
            namespace: self.namespace.clone(),
            name: self.name.clone(),
            images_file: self.images_json.clone(),
            bootstrap_interval: Duration::from_secs(self.bootstrap_poll_interval_secs),
            bootstrap_timeout: Duration::from_secs(self.bootstrap_timeout_secs),
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("machine-api-operator v{}", env!("CARGO_PKG_VERSION"));
            println!("Build Date: {}", env!("BUILD_DATE"));
            println!("Git SHA: {}", env!("GIT_SHA"));
            println!("Rust Version: {}", env!("RUST_VERSION"));
            Ok(())
        }
        Commands::Run(run_args) => run_operator(run_args).await,
    }
}

/// Cancel `token` on SIGINT or SIGTERM
fn spawn_signal_handler(token: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = term.recv() => {}
                    }
                }
                Err(e) => {
                    error!("Failed to install SIGTERM handler: {}", e);
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        let _ = tokio::signal::ctrl_c().await;

        info!("Received shutdown signal");
        token.cancel();
    });
}

async fn run_operator(args: RunArgs) -> Result<(), Error> {
    telemetry::init(args.log_format)?;
    let settings = args.settings()?;

    info!(
        "Starting machine-api-operator v{}",
        env!("CARGO_PKG_VERSION")
    );

    let client = kube::Client::try_default()
        .await
        .map_err(Error::KubeError)?;
    info!("Connected to Kubernetes cluster");

    let token = CancellationToken::new();
    spawn_signal_handler(token.clone());

    let api = Arc::new(KubeClusterApi::new(client.clone()));
    let operator = Operator::new(api, settings);

    let (watchers, caches) = controller::spawn_watchers(
        client,
        &args.namespace,
        operator.event_handler(),
        token.clone(),
    );

    #[cfg(feature = "rest-api")]
    let server = {
        let state = machine_api_operator::rest_api::ApiState {
            status: operator.status(),
            reporter: operator.reporter(),
        };
        let port = args.http_port;
        let token = token.clone();
        tokio::spawn(async move {
            if let Err(e) = machine_api_operator::rest_api::run_server(state, port, token).await {
                error!("REST API server error: {}", e);
            }
        })
    };

    let result = operator.run(args.workers, caches, token.clone()).await;

    // a failed run returns before the stop signal; release the other tasks
    token.cancel();
    for watcher in watchers {
        let _ = watcher.await;
    }
    #[cfg(feature = "rest-api")]
    let _ = server.await;

    telemetry::shutdown_telemetry();
    result
}
