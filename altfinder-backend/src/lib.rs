pub mod api;
pub mod cache;
pub mod config;
mod error;
pub mod helpers;
pub mod node;
pub mod reconcile;
pub mod reseed;
mod routes;
pub mod sync;
pub mod validation;

use axum::{
    Router,
    http::StatusCode,
    routing::{get, post},
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::api::AltApi;
use crate::validation::Lookup;

pub struct AppState {
    pub api: AltApi,
    /// Label used for logins that do not carry one
    pub server_name: String,
    /// Keys whose logins are acknowledged without being recorded
    pub ignored: HashSet<Lookup>,
}

/// Create the application router around a running engine
pub fn create_app(state: AppState, request_body_limit: usize, request_timeout: Duration) -> Router {
    let state = Arc::new(state);

    Router::new()
        .route("/health", get(|| async { StatusCode::OK }))
        .route("/login", post(routes::login))
        .route(
            "/sightings/{key}",
            get(routes::sightings).delete(routes::remove),
        )
        .route("/alts/{uuid}", get(routes::alts))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            request_timeout,
        ))
        .layer(RequestBodyLimitLayer::new(request_body_limit))
        .with_state(state)
}
