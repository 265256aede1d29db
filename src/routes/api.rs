//! Connection lifecycle and dynamic dispatch routes.

use crate::handlers::{connection, dynamic, query};
use crate::state::AppState;
use axum::{
    routing::{any, get, post},
    Router,
};

pub fn connection_routes(state: AppState) -> Router {
    Router::new()
        .route("/connections", get(connection::list).post(connection::create))
        .route("/connections/:name", axum::routing::delete(connection::delete))
        .route("/connections/:name/entities", get(connection::entities))
        .route(
            "/connections/:name/queries",
            get(query::list).post(query::create),
        )
        .route("/connections/:name/queries/:query/run", post(query::run))
        .route("/endpoints", get(connection::endpoints))
        .with_state(state)
}

/// Dynamic endpoints live under /dyn and accept any method; the activation
/// plan decides what is actually allowed.
pub fn dynamic_routes(state: AppState) -> Router {
    Router::new()
        .route("/dyn/:module/:endpoint", any(dynamic::dispatch))
        .with_state(state)
}
