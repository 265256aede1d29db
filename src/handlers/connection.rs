//! Connection (module) lifecycle handlers: create, list, inspect, delete.

use crate::compiler::CompileRequest;
use crate::error::AppError;
use crate::module::ModuleSpec;
use crate::response::{success_many, success_one, success_one_ok};
use crate::state::AppState;
use crate::store;
use axum::{
    extract::{Path, State},
    Json,
};
use serde::Deserialize;

#[derive(Deserialize)]
pub struct CreateConnection {
    pub name: String,
    pub connection_kind: String,
    pub connection_string: String,
}

/// POST /connections: generate sources for the connection, compile them, load
/// the module, and persist the compiled artifact for restarts.
pub async fn create(
    State(state): State<AppState>,
    Json(body): Json<CreateConnection>,
) -> Result<impl axum::response::IntoResponse, AppError> {
    let runtime = &state.runtime;
    let sources = runtime
        .generator
        .generate(&body.name, &body.connection_kind, &body.connection_string)
        .await?;
    let request = CompileRequest {
        name: body.name.clone(),
        sources,
        references: Vec::new(),
    };
    let artifact = runtime.compiler.compile(&request).await?;

    let spec = ModuleSpec {
        name: body.name.clone(),
        connection_kind: body.connection_kind.clone(),
        connection_string: body.connection_string.clone(),
        binary: artifact.binary,
        symbols: artifact.symbols,
    };
    let handle = runtime.registry.load_module(spec.clone()).await?;
    store::save_module(&state.pool, &spec, &artifact.content_hash).await?;
    Ok(success_one(handle))
}

/// GET /connections: every loaded module, name order.
pub async fn list(
    State(state): State<AppState>,
) -> Result<impl axum::response::IntoResponse, AppError> {
    Ok(success_many(state.runtime.registry.list()))
}

/// GET /connections/:name/entities: shapes of the module's entity types.
pub async fn entities(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl axum::response::IntoResponse, AppError> {
    let shapes = state
        .runtime
        .registry
        .entities(&name)
        .ok_or(AppError::NotFound(name))?;
    Ok(success_many(shapes))
}

/// GET /endpoints: the discovered route table across host and modules.
pub async fn endpoints(
    State(state): State<AppState>,
) -> Result<impl axum::response::IntoResponse, AppError> {
    Ok(success_many(state.runtime.registry.routes().list()))
}

/// DELETE /connections/:name: unload and forget. Deleting a connection that
/// was never loaded still succeeds.
pub async fn delete(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl axum::response::IntoResponse, AppError> {
    state.runtime.registry.unload_module(&name).await?;
    store::delete_module(&state.pool, &name).await?;
    Ok(success_one_ok(serde_json::json!({ "name": name, "state": "unloaded" })))
}
