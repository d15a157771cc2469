//! Router assembly: auth gate in front of everything except the manifest,
//! trace layer, and a config-narrowed CORS policy (design notes §4.A, §4.H).

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::{handlers, middleware};
use crate::AppState;

pub fn build_router(state: AppState) -> Router {
    let cfg = state.config.current();
    let cors = match cfg.listen.http_addr.as_deref() {
        Some(_) => CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any),
        None => CorsLayer::new(),
    };

    // `/api/login` is the one route a never-yet-authenticated browser must
    // reach, so it is built on its own router and merged in *after* the
    // protected router's `auth_gate` layer is applied, rather than added to
    // the protected router itself (`.layer()` wraps every route already
    // present in the builder chain, so adding it before the layer would
    // make first-time HTML login unreachable).
    let public = Router::new().route("/api/login", post(handlers::login));

    let protected = Router::new()
        .route("/rest/*path", get(handlers::rest_passthrough).post(handlers::rest_command))
        .route("/sitemap-full", get(handlers::sitemap_full))
        .route("/search-index", get(handlers::search_index))
        .route("/config.js", get(handlers::config_js))
        .route("/api/heartbeat", get(handlers::heartbeat))
        .route("/api/ping", get(handlers::ping))
        .route("/api/settings", post(handlers::settings))
        .route("/ws", get(handlers::ws_upgrade))
        .layer(axum::middleware::from_fn_with_state(state.clone(), middleware::auth_gate));

    public
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
