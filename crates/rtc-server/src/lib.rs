pub mod error;
pub mod routes;
pub mod state;

pub use state::AppState;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Build the axum Router with all API routes and middleware.
/// Used by `serve_on()` and available for integration testing.
pub fn build_router(app_state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let mut router = Router::new()
        // Orchestrations
        .route(
            "/api/orchestrations",
            post(routes::orchestrations::start_orchestration)
                .get(routes::orchestrations::list_orchestrations),
        )
        .route(
            "/api/orchestrations/{id}",
            get(routes::orchestrations::get_orchestration)
                .delete(routes::orchestrations::delete_orchestration),
        )
        .route(
            "/api/orchestrations/{id}/events/{event}",
            post(routes::orchestrations::raise_event),
        )
        .route(
            "/api/orchestrations/{id}/reset",
            post(routes::orchestrations::reset_orchestration),
        )
        // Config
        .route("/api/config", get(routes::config::get_config));

    if app_state.simulator {
        router = router.route("/api/job", post(routes::job::simulate_job));
    }

    router
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(app_state)
}

/// Serve the API on a pre-bound listener.
///
/// Runs left unfinished by a previous process are resumed before the first
/// request is accepted. Binding is left to the caller so it can read the
/// actual port when `port = 0`.
pub async fn serve_on(app_state: AppState, listener: tokio::net::TcpListener) -> anyhow::Result<()> {
    let actual_port = listener.local_addr()?.port();

    let resumed = app_state.engine.resume_pending().await?;
    if !resumed.is_empty() {
        tracing::info!(count = resumed.len(), "resumed unfinished orchestrations");
    }

    let app = build_router(app_state);
    tracing::info!("rtc server listening on http://localhost:{actual_port}");

    axum::serve(listener, app).await?;
    Ok(())
}

/// Bind `0.0.0.0:{port}` and serve.
pub async fn serve(app_state: AppState, port: u16) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    serve_on(app_state, listener).await
}
