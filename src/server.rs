use axum::{
    routing::{get, post},
    Router,
};
use tokio::sync::watch;
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::api::handlers::{
    get_account, get_pool, get_settlement, health_check, list_breaks, list_settlements,
    pause_bridge, pool_history, recon_summary, unpause_bridge,
};
use crate::api::AppState;

pub async fn create_app(state: AppState) -> Router {
    info!("⚙️ Setting up HTTP routes...");

    let app = Router::new()
        // Public health check endpoint
        .route("/health", get(health_check))
        // API v1 routes
        .nest(
            "/api/v1",
            Router::new()
                // Account projections
                .route("/accounts/:account", get(get_account))
                // Settlement listing + detail
                .route("/settlements", get(list_settlements))
                .route("/settlements/:ref_id", get(get_settlement))
                // Reconciliation
                .route("/recon/summary", get(recon_summary))
                .route("/recon/breaks", get(list_breaks))
                // Pool balance
                .route("/pool", get(get_pool))
                .route("/pool/history", get(pool_history))
                // Operator actions
                .route("/admin/pause", post(pause_bridge))
                .route("/admin/unpause", post(unpause_bridge)),
        )
        .layer(CompressionLayer::new())
        .layer(CorsLayer::very_permissive())
        // Add request tracing
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!("✓ HTTP routes configured");
    app
}

pub async fn run_server(
    app: Router,
    bind_address: &str,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error>> {
    let listener = tokio::net::TcpListener::bind(bind_address).await?;
    info!("🌐 Server listening on: {}", bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;

    Ok(())
}
