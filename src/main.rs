mod api;
mod bootstrap;
mod bridge;
mod broker;
mod config;
mod error;
mod indexer;
mod ledger;
mod recon;
mod server;
mod store;
#[cfg(test)]
mod testutil;

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// Initialize logging and tracing
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "info,tower_http=debug,server=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    info!("🚀 Starting PnL Settlement Backend");

    // Load configuration
    dotenv::dotenv().ok();
    let config = config::Config::from_env()?;

    let (state, shutdown_tx, handles) = bootstrap::initialize_app_state(&config).await?;

    // Create HTTP server
    let app = server::create_app(state).await;

    // Flip the shared shutdown signal on Ctrl-C; the server and the three
    // loops drain together
    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            let _ = signal_tx.send(true);
        }
    });

    // Run the server until shutdown
    let shutdown_rx = shutdown_tx.subscribe();
    server::run_server(app, &config.bind_address, shutdown_rx).await?;

    let _ = shutdown_tx.send(true);
    for handle in handles {
        let _ = handle.await;
    }

    info!("✓ Shutdown complete");
    Ok(())
}
