//! Host-side data access for guest modules. Guests never open connections;
//! their `fetch` import lands here, on whichever gateway the module's
//! service container resolved for the call.

use crate::error::RuntimeError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{Column, PgPool, Row, TypeInfo};

/// Request a guest sends through the `host.fetch` import. The query text is
/// baked into the module at generation/compilation time; parameters are
/// merged in by the host from the current call.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FetchRequest {
    pub query: String,
    /// Entity the query reads, when known. Lets non-SQL gateways route.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<String>,
    #[serde(default)]
    pub parameters: serde_json::Map<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ColumnMeta {
    pub name: String,
    pub declared_type: String,
    #[serde(default)]
    pub nullable: bool,
    #[serde(default)]
    pub is_identity: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub computed_expression: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TabularResult {
    #[serde(default)]
    pub columns: Vec<ColumnMeta>,
    #[serde(default)]
    pub rows: Vec<serde_json::Map<String, Value>>,
}

/// Blocking by design: the `fetch` import runs on a wasm call already moved
/// to a blocking thread, so implementations may bridge to async internally.
pub trait DataGateway: Send + Sync {
    fn fetch(&self, request: &FetchRequest) -> Result<TabularResult, RuntimeError>;
}

/// PostgreSQL gateway. Parameters bind positionally in key order ($1..$n).
pub struct PgDataGateway {
    pool: PgPool,
    handle: tokio::runtime::Handle,
}

impl PgDataGateway {
    pub fn new(pool: PgPool, handle: tokio::runtime::Handle) -> Self {
        PgDataGateway { pool, handle }
    }
}

impl DataGateway for PgDataGateway {
    fn fetch(&self, request: &FetchRequest) -> Result<TabularResult, RuntimeError> {
        let pool = self.pool.clone();
        let query = request.query.clone();
        let params: Vec<Value> = {
            let mut keys: Vec<&String> = request.parameters.keys().collect();
            keys.sort();
            keys.iter()
                .map(|k| request.parameters.get(*k).cloned().unwrap_or(Value::Null))
                .collect()
        };
        self.handle.block_on(async move {
            let mut q = sqlx::query(&query);
            for param in &params {
                q = match param {
                    Value::Null => q.bind(Option::<String>::None),
                    Value::Bool(b) => q.bind(*b),
                    Value::Number(n) if n.is_i64() => q.bind(n.as_i64()),
                    Value::Number(n) => q.bind(n.as_f64()),
                    Value::String(s) => q.bind(s.clone()),
                    other => q.bind(other.clone()),
                };
            }
            let pg_rows = q
                .fetch_all(&pool)
                .await
                .map_err(|e| RuntimeError::QueryExecutionFailed(e.to_string()))?;
            let mut columns = Vec::new();
            let mut rows = Vec::with_capacity(pg_rows.len());
            if let Some(first) = pg_rows.first() {
                for col in first.columns() {
                    columns.push(ColumnMeta {
                        name: col.name().to_string(),
                        declared_type: col.type_info().name().to_ascii_lowercase(),
                        nullable: true,
                        is_identity: false,
                        computed_expression: None,
                    });
                }
            }
            for pg_row in &pg_rows {
                let mut row = serde_json::Map::new();
                for col in pg_row.columns() {
                    row.insert(col.name().to_string(), decode_pg_value(pg_row, col));
                }
                rows.push(row);
            }
            Ok(TabularResult { columns, rows })
        })
    }
}

fn decode_pg_value(row: &sqlx::postgres::PgRow, col: &sqlx::postgres::PgColumn) -> Value {
    let idx = col.ordinal();
    match col.type_info().name() {
        "BOOL" => row
            .try_get::<Option<bool>, _>(idx)
            .ok()
            .flatten()
            .map(Value::Bool)
            .unwrap_or(Value::Null),
        "INT2" | "INT4" | "INT8" => row
            .try_get::<Option<i64>, _>(idx)
            .ok()
            .flatten()
            .map(|n| Value::Number(n.into()))
            .unwrap_or(Value::Null),
        "FLOAT4" | "FLOAT8" => row
            .try_get::<Option<f64>, _>(idx)
            .ok()
            .flatten()
            .and_then(|n| serde_json::Number::from_f64(n).map(Value::Number))
            .unwrap_or(Value::Null),
        "JSON" | "JSONB" => row
            .try_get::<Option<Value>, _>(idx)
            .ok()
            .flatten()
            .unwrap_or(Value::Null),
        "TIMESTAMPTZ" => row
            .try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(idx)
            .ok()
            .flatten()
            .map(|t| Value::String(t.to_rfc3339()))
            .unwrap_or(Value::Null),
        "UUID" => row
            .try_get::<Option<uuid::Uuid>, _>(idx)
            .ok()
            .flatten()
            .map(|u| Value::String(u.to_string()))
            .unwrap_or(Value::Null),
        _ => row
            .try_get::<Option<String>, _>(idx)
            .ok()
            .flatten()
            .map(Value::String)
            .unwrap_or(Value::Null),
    }
}

/// Gateway over fixed, in-memory tables keyed by entity name. Parameters
/// filter rows by equality. Backs demo connections and tests.
#[derive(Default)]
pub struct StaticGateway {
    tables: std::collections::HashMap<String, TabularResult>,
}

impl StaticGateway {
    pub fn new() -> Self {
        StaticGateway::default()
    }

    pub fn with_table(mut self, entity: &str, result: TabularResult) -> Self {
        self.tables.insert(entity.to_string(), result);
        self
    }
}

impl DataGateway for StaticGateway {
    fn fetch(&self, request: &FetchRequest) -> Result<TabularResult, RuntimeError> {
        let entity = request
            .entity
            .as_deref()
            .ok_or_else(|| {
                RuntimeError::QueryExecutionFailed(format!(
                    "static gateway needs an entity, query was: {}",
                    request.query
                ))
            })?;
        let table = self.tables.get(entity).ok_or_else(|| {
            RuntimeError::QueryExecutionFailed(format!("unknown entity `{entity}`"))
        })?;
        let rows = table
            .rows
            .iter()
            .filter(|row| {
                request
                    .parameters
                    .iter()
                    .all(|(k, v)| row.get(k).map(|rv| rv == v).unwrap_or(false))
            })
            .cloned()
            .collect();
        Ok(TabularResult {
            columns: table.columns.clone(),
            rows,
        })
    }
}
