//! Dynamic endpoint dispatch: any method on /dyn/:module/:endpoint activates
//! the discovered endpoint through the module's service scope.

use crate::activation;
use crate::error::AppError;
use crate::state::AppState;
use axum::{
    extract::{Path, State},
    http::Method,
    Json,
};
use serde_json::Value;

pub async fn dispatch(
    State(state): State<AppState>,
    method: Method,
    Path((module, endpoint)): Path<(String, String)>,
    body: Option<Json<Value>>,
) -> Result<Json<Value>, AppError> {
    let payload = body.map(|Json(v)| v).unwrap_or(Value::Null);
    let value = activation::activate(
        &state.runtime.registry,
        method.as_str(),
        &module,
        &endpoint,
        payload,
    )
    .await?;
    Ok(Json(value))
}
