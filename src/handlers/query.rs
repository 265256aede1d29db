//! Ad hoc query handlers: compile-and-register, run with pagination, list.

use crate::error::AppError;
use crate::response::{success_many, success_one, success_page};
use crate::state::AppState;
use crate::store;
use axum::{
    extract::{Path, State},
    Json,
};
use serde::Deserialize;
use serde_json::Value;

#[derive(Deserialize)]
pub struct CreateQuery {
    pub name: String,
    pub source: String,
}

#[derive(Deserialize, Default)]
pub struct RunQuery {
    #[serde(default)]
    pub parameters: serde_json::Map<String, Value>,
    pub page_number: Option<u32>,
    pub page_size: Option<u32>,
}

/// POST /connections/:name/queries: compile the source against the loaded
/// module, register it, and return the query with its inferred output shape.
pub async fn create(
    State(state): State<AppState>,
    Path(module): Path<String>,
    Json(body): Json<CreateQuery>,
) -> Result<impl axum::response::IntoResponse, AppError> {
    let compiled = state
        .runtime
        .queries
        .create_and_run(&module, &body.name, &body.source)
        .await?;
    store::save_query(&state.pool, &compiled).await?;
    Ok(success_one(compiled))
}

/// POST /connections/:name/queries/:query/run: execute a registered query
/// with caller parameters and page the rows.
pub async fn run(
    State(state): State<AppState>,
    Path((module, query)): Path<(String, String)>,
    body: Option<Json<RunQuery>>,
) -> Result<impl axum::response::IntoResponse, AppError> {
    let Json(body) = body.unwrap_or_default();
    let page = state
        .runtime
        .queries
        .execute(&module, &query, body.parameters, body.page_number, body.page_size)
        .await?;
    Ok(success_page(
        page.rows,
        page.total_count,
        page.page_number,
        page.page_size,
    ))
}

/// GET /connections/:name/queries: registered queries for one module.
pub async fn list(
    State(state): State<AppState>,
    Path(module): Path<String>,
) -> Result<impl axum::response::IntoResponse, AppError> {
    Ok(success_many(state.runtime.queries.list(&module)?))
}
