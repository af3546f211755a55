use shutterbus::api::{self, AppState};
use shutterbus::shutdown::ShutdownSignal;
use shutterbus::{Pipeline, ShutterbusConfig};
use std::env;
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    // 1. Initialize Logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    dotenvy::dotenv().ok();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Shutterbus exited with error");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    // 2. Load Configuration
    let config = ShutterbusConfig::load()?;
    let api_key = config
        .server
        .api_key
        .clone()
        .or_else(|| env::var("SHUTTERBUS_API_KEY").ok())
        .unwrap_or_else(|| {
            warn!("SHUTTERBUS_API_KEY not set, defaulting to 'dev-key'. DO NOT USE IN PRODUCTION.");
            "dev-key".to_string()
        });
    let port = config.server.port;

    // 3. Assemble the pipeline and start its workers
    let pipeline = Arc::new(Pipeline::in_memory(config)?);
    let shutdown = ShutdownSignal::new();
    let workers = pipeline.start(shutdown.clone()).await?;

    // 4. Serve the API until a signal arrives
    let app = api::app(Arc::new(AppState::new(pipeline.clone(), api_key)));
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Shutterbus listening on {}", addr);

    let server_shutdown = shutdown.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_shutdown.wait().await })
        .await;

    if !shutdown.is_shutdown() {
        warn!("Server stopped without a shutdown signal, stopping workers");
        shutdown.trigger();
    }

    // 5. Let the workers drain
    let drain = async {
        for worker in workers {
            if let Err(e) = worker.await {
                error!(error = %e, "Worker task panicked");
            }
        }
    };
    if tokio::time::timeout(shutdown.timeout(), drain).await.is_err() {
        warn!(
            timeout_secs = shutdown.timeout().as_secs(),
            "Workers did not stop in time, exiting anyway"
        );
    }

    info!(stats = ?pipeline.stats(), "Shutterbus shutdown complete");
    served?;
    Ok(())
}
