use axum::{
    middleware,
    routing::{delete, get, post},
    Router,
};
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use super::{
    auth::auth_middleware,
    routes::{
        annotate_history_entry, create_ship, delete_session, delete_ship_permanent,
        download_from_ship, exec_ship, extend_ttl, get_session, get_ship, health, list_sessions,
        session_history, session_history_entry, session_history_last, ship_container_logs,
        stat_overview, start_ship, stop_ship, upload_to_ship,
    },
    ws::terminal_handler,
    GatewayState,
};

/// Builds the façade (C9) and serves it on `state.config.bind_addr`. No
/// port-fallback or PID file here — Bay runs as a single long-lived server
/// process bound to one configured address.
pub async fn start_gateway(state: GatewayState) -> Result<(), String> {
    let bind_addr = state.config.bind_addr.clone();

    let protected = Router::new()
        .route("/stat", get(stat_overview))
        .route("/stat/overview", get(stat_overview))
        .route("/ship", post(create_ship))
        .route("/ship/{id}", get(get_ship).delete(stop_ship))
        .route("/ship/{id}/permanent", delete(delete_ship_permanent))
        .route("/ship/{id}/exec", post(exec_ship))
        .route("/ship/{id}/extend-ttl", post(extend_ttl))
        .route("/ship/{id}/start", post(start_ship))
        .route("/ship/logs/{id}", get(ship_container_logs))
        .route("/ship/{id}/upload", post(upload_to_ship))
        .route("/ship/{id}/download", get(download_from_ship))
        .route("/sessions", get(list_sessions))
        .route("/sessions/{id}", get(get_session).delete(delete_session))
        .route("/sessions/{id}/history", get(session_history))
        .route("/sessions/{id}/history/last", get(session_history_last))
        .route(
            "/sessions/{id}/history/{exec_id}",
            get(session_history_entry).patch(annotate_history_entry),
        )
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .with_state(state.clone());

    let public = Router::new()
        .route("/health", get(health))
        // The terminal proxy authenticates from its own query string (no
        // custom headers on a browser WebSocket), so it bypasses
        // `auth_middleware` and lives on the public router instead.
        .route("/ship/{id}/term", get(terminal_handler))
        .with_state(state);

    let app = Router::new()
        .merge(public)
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let listener = TcpListener::bind(&bind_addr)
        .await
        .map_err(|e| format!("failed to bind {bind_addr}: {e}"))?;
    tracing::info!(addr = %bind_addr, "bay daemon listening");

    axum::serve(listener, app).await.map_err(|e| format!("daemon error: {e}"))
}
