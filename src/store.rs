//! _sys_* table DDL and module/query persistence. All _sys_* tables live in a schema named from `RUNTIME_SCHEMA` env (default `runtime`).

use crate::error::AppError;
use crate::module::registry::ModuleRegistry;
use crate::module::ModuleSpec;
use crate::query::CompiledQuery;
use crate::shape::ShapeDescriptor;
use sqlx::ConnectOptions;
use sqlx::PgPool;
use std::str::FromStr;
use uuid::Uuid;

/// Schema name for _sys_* tables. From env `RUNTIME_SCHEMA`, default `runtime`. Must be a valid PostgreSQL identifier.
pub fn runtime_schema() -> String {
    std::env::var("RUNTIME_SCHEMA").unwrap_or_else(|_| "runtime".into())
}

/// Returns schema-qualified table name for _sys_* tables (e.g. "runtime._sys_modules").
pub fn qualified_sys_table(table: &str) -> String {
    format!("{}.{}", runtime_schema(), table)
}

const MODULES_TABLE: &str = "_sys_modules";
const QUERIES_TABLE: &str = "_sys_queries";

/// Create schema from `RUNTIME_SCHEMA` env if not exists, then _sys_* tables.
pub async fn ensure_sys_tables(pool: &PgPool) -> Result<(), AppError> {
    let schema = runtime_schema();
    sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", schema))
        .execute(pool)
        .await?;

    let q_modules = qualified_sys_table(MODULES_TABLE);
    let modules_ddl = format!(
        r#"
        CREATE TABLE IF NOT EXISTS {} (
            name TEXT PRIMARY KEY,
            connection_kind TEXT NOT NULL,
            connection_string TEXT NOT NULL,
            binary BYTEA NOT NULL,
            symbols BYTEA,
            content_hash TEXT NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
        q_modules
    );
    sqlx::query(&modules_ddl).execute(pool).await?;

    let q_queries = qualified_sys_table(QUERIES_TABLE);
    let queries_ddl = format!(
        r#"
        CREATE TABLE IF NOT EXISTS {} (
            id UUID PRIMARY KEY,
            module_name TEXT NOT NULL,
            name TEXT NOT NULL,
            source TEXT NOT NULL,
            binary BYTEA NOT NULL,
            output_shape JSONB NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            UNIQUE (module_name, name)
        )
        "#,
        q_queries
    );
    sqlx::query(&queries_ddl).execute(pool).await?;

    Ok(())
}

/// Upsert one module row by name.
pub async fn save_module(pool: &PgPool, spec: &ModuleSpec, content_hash: &str) -> Result<(), AppError> {
    let q_modules = qualified_sys_table(MODULES_TABLE);
    sqlx::query(&format!(
        r#"
        INSERT INTO {} (name, connection_kind, connection_string, binary, symbols, content_hash, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, NOW())
        ON CONFLICT (name) DO UPDATE SET
            connection_kind = EXCLUDED.connection_kind,
            connection_string = EXCLUDED.connection_string,
            binary = EXCLUDED.binary,
            symbols = EXCLUDED.symbols,
            content_hash = EXCLUDED.content_hash,
            updated_at = NOW()
        "#,
        q_modules
    ))
    .bind(&spec.name)
    .bind(&spec.connection_kind)
    .bind(&spec.connection_string)
    .bind(&spec.binary)
    .bind(&spec.symbols)
    .bind(content_hash)
    .execute(pool)
    .await?;
    Ok(())
}

/// Delete one module row and every query registered under it.
pub async fn delete_module(pool: &PgPool, name: &str) -> Result<(), AppError> {
    let mut tx = pool.begin().await?;
    sqlx::query(&format!(
        "DELETE FROM {} WHERE module_name = $1",
        qualified_sys_table(QUERIES_TABLE)
    ))
    .bind(name)
    .execute(&mut *tx)
    .await?;
    sqlx::query(&format!(
        "DELETE FROM {} WHERE name = $1",
        qualified_sys_table(MODULES_TABLE)
    ))
    .bind(name)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(())
}

/// All persisted module specs, name order.
pub async fn load_modules(pool: &PgPool) -> Result<Vec<ModuleSpec>, AppError> {
    let q_modules = qualified_sys_table(MODULES_TABLE);
    let rows: Vec<(String, String, String, Vec<u8>, Option<Vec<u8>>)> = sqlx::query_as(&format!(
        "SELECT name, connection_kind, connection_string, binary, symbols FROM {} ORDER BY name",
        q_modules
    ))
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|(name, connection_kind, connection_string, binary, symbols)| ModuleSpec {
            name,
            connection_kind,
            connection_string,
            binary,
            symbols,
        })
        .collect())
}

/// Upsert one compiled query by (module, name).
pub async fn save_query(pool: &PgPool, query: &CompiledQuery) -> Result<(), AppError> {
    let q_queries = qualified_sys_table(QUERIES_TABLE);
    let shape = serde_json::to_value(&query.output_shape)
        .map_err(|e| AppError::Validation(format!("output shape: {}", e)))?;
    sqlx::query(&format!(
        r#"
        INSERT INTO {} (id, module_name, name, source, binary, output_shape, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, NOW())
        ON CONFLICT (module_name, name) DO UPDATE SET
            source = EXCLUDED.source,
            binary = EXCLUDED.binary,
            output_shape = EXCLUDED.output_shape,
            updated_at = NOW()
        "#,
        q_queries
    ))
    .bind(query.id)
    .bind(&query.module_name)
    .bind(&query.name)
    .bind(&query.source)
    .bind(&query.binary)
    .bind(&shape)
    .execute(pool)
    .await?;
    Ok(())
}

/// All persisted queries for one module.
pub async fn load_queries(pool: &PgPool, module_name: &str) -> Result<Vec<CompiledQuery>, AppError> {
    let q_queries = qualified_sys_table(QUERIES_TABLE);
    let rows: Vec<(Uuid, String, String, Vec<u8>, serde_json::Value)> = sqlx::query_as(&format!(
        "SELECT id, name, source, binary, output_shape FROM {} WHERE module_name = $1 ORDER BY name",
        q_queries
    ))
    .bind(module_name)
    .fetch_all(pool)
    .await?;
    let mut out = Vec::with_capacity(rows.len());
    for (id, name, source, binary, shape) in rows {
        let output_shape: ShapeDescriptor = serde_json::from_value(shape)
            .map_err(|e| AppError::Validation(format!("stored output shape: {}", e)))?;
        out.push(CompiledQuery {
            id,
            module_name: module_name.to_string(),
            name,
            source,
            binary,
            output_shape,
        });
    }
    Ok(out)
}

/// Reload every persisted module into the registry and stage its persisted
/// queries for lazy re-registration. A module that no longer loads is logged
/// and skipped rather than failing the whole restore.
pub async fn restore_modules(pool: &PgPool, registry: &ModuleRegistry) -> Result<usize, AppError> {
    let specs = load_modules(pool).await?;
    let mut restored = 0usize;
    for spec in specs {
        let name = spec.name.clone();
        match registry.load_module(spec).await {
            Ok(_) => {
                let queries = load_queries(pool, &name).await?;
                if let Some(module) = registry.get(&name) {
                    if let Ok(mut stored) = module.stored_queries.write() {
                        for query in queries {
                            stored.insert(query.name.clone(), query);
                        }
                    }
                }
                restored += 1;
            }
            Err(e) => {
                tracing::warn!(module = %name, error = %e, "persisted module failed to load");
            }
        }
    }
    Ok(restored)
}

/// Ensure the database in `database_url` exists; create it if not. Connects to the
/// default `postgres` database to run CREATE DATABASE. Call before creating the main pool.
pub async fn ensure_database_exists(database_url: &str) -> Result<(), AppError> {
    let (admin_url, db_name) = parse_db_name_from_url(database_url)?;
    if db_name.is_empty() || db_name == "postgres" {
        return Ok(());
    }
    let opts = sqlx::postgres::PgConnectOptions::from_str(&admin_url)
        .map_err(|e| AppError::BadRequest(format!("invalid DATABASE_URL: {}", e)))?;
    let mut conn: sqlx::PgConnection = opts.connect().await.map_err(AppError::Db)?;
    let exists: (bool,) = sqlx::query_as("SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)")
        .bind(&db_name)
        .fetch_one(&mut conn)
        .await
        .map_err(AppError::Db)?;
    if !exists.0 {
        let quoted = quote_ident(&db_name);
        sqlx::query(&format!("CREATE DATABASE {}", quoted))
            .execute(&mut conn)
            .await
            .map_err(AppError::Db)?;
    }
    Ok(())
}

fn parse_db_name_from_url(url: &str) -> Result<(String, String), AppError> {
    let path_start = url.rfind('/').ok_or_else(|| AppError::BadRequest("DATABASE_URL: no path".into()))? + 1;
    let path_and_query = url.get(path_start..).unwrap_or("");
    let db_name = path_and_query.split('?').next().unwrap_or("").trim();
    let base = url.get(..path_start).unwrap_or(url);
    let admin_url = format!("{}postgres", base);
    Ok((admin_url, db_name.to_string()))
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('\\', "\\\\").replace('"', "\\\""))
}
