//! Example server: wires the compiler, generator, and module registry, restores persisted modules, and mounts the connection, query, and dynamic routes.

use conduit_sdk::gateway::{ColumnMeta, TabularResult};
use conduit_sdk::generator::{ColumnSchema, ConnectionSchema, TableSchema};
use conduit_sdk::services::{HostServices, ServiceInstance};
use conduit_sdk::shape::FieldKind;
use conduit_sdk::{
    common_routes_with_ready, connection_routes, dynamic_routes, ensure_database_exists,
    ensure_sys_tables, restore_modules, AppState, CachingCompiler, DynamicRuntime, ModuleRegistry,
    PgDataGateway, SchemaSourceGenerator, StaticGateway, WatCompiler,
};
use axum::Router;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::limit::RequestBodyLimitLayer;
use tracing_subscriber::EnvFilter;

const BODY_LIMIT_BYTES: usize = 2 * 1024 * 1024;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("conduit_sdk=info".parse()?))
        .init();

    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| "postgres://localhost/conduit".into());
    ensure_database_exists(&database_url).await?;
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await?;
    ensure_sys_tables(&pool).await?;

    let handle = tokio::runtime::Handle::current();
    let mut host = HostServices::new();
    host.factories.register("data-gateway", move |ctx| {
        match ctx.connection_kind {
            "postgres" => {
                let pool = sqlx::postgres::PgPoolOptions::new()
                    .max_connections(2)
                    .connect_lazy(ctx.connection_string)
                    .map_err(|e| {
                        conduit_sdk::RuntimeError::ServiceConfigurationError(format!(
                            "connection string: {e}"
                        ))
                    })?;
                Ok(ServiceInstance::Gateway(Arc::new(PgDataGateway::new(
                    pool,
                    handle.clone(),
                ))))
            }
            "static" => Ok(ServiceInstance::Gateway(Arc::new(demo_gateway()))),
            other => Err(conduit_sdk::RuntimeError::ServiceConfigurationError(
                format!("unsupported connection kind `{other}`"),
            )),
        }
    });

    let registry = ModuleRegistry::new(Arc::new(host))?;
    let compiler = Arc::new(CachingCompiler::new(WatCompiler));
    let generator = Arc::new(SchemaSourceGenerator::new().with_schema("Northwind", demo_schema()));
    let runtime = DynamicRuntime::new(registry.clone(), compiler, generator);

    let restored = restore_modules(&pool, &registry).await?;
    tracing::info!(restored, "persisted modules restored");

    let state = AppState {
        pool: pool.clone(),
        runtime,
    };

    let app = Router::new()
        .merge(common_routes_with_ready(state.clone()))
        .nest("/api/v1", connection_routes(state.clone()))
        .nest("/api/v1", dynamic_routes(state))
        .layer(ServiceBuilder::new().layer(RequestBodyLimitLayer::new(BODY_LIMIT_BYTES)));

    let listener = TcpListener::bind("0.0.0.0:3000").await?;
    tracing::info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}

fn demo_schema() -> ConnectionSchema {
    ConnectionSchema {
        tables: vec![TableSchema {
            name: "Customers".into(),
            columns: vec![
                ColumnSchema {
                    name: "CustomerId".into(),
                    kind: FieldKind::String,
                    nullable: false,
                    is_primary_key: true,
                    is_foreign_key: false,
                    references: None,
                    is_identity: false,
                },
                ColumnSchema {
                    name: "CompanyName".into(),
                    kind: FieldKind::String,
                    nullable: false,
                    is_primary_key: false,
                    is_foreign_key: false,
                    references: None,
                    is_identity: false,
                },
                ColumnSchema {
                    name: "IsActive".into(),
                    kind: FieldKind::Boolean,
                    nullable: false,
                    is_primary_key: false,
                    is_foreign_key: false,
                    references: None,
                    is_identity: false,
                },
            ],
        }],
    }
}

fn demo_gateway() -> StaticGateway {
    let columns = vec![
        ColumnMeta {
            name: "CustomerId".into(),
            declared_type: "text".into(),
            nullable: false,
            is_identity: false,
            computed_expression: None,
        },
        ColumnMeta {
            name: "CompanyName".into(),
            declared_type: "text".into(),
            nullable: false,
            is_identity: false,
            computed_expression: None,
        },
        ColumnMeta {
            name: "IsActive".into(),
            declared_type: "boolean".into(),
            nullable: false,
            is_identity: false,
            computed_expression: None,
        },
    ];
    let rows = [
        ("ALFKI", "Alfreds Futterkiste", true),
        ("ANATR", "Ana Trujillo Emparedados", false),
        ("ANTON", "Antonio Moreno Taqueria", true),
    ]
    .into_iter()
    .map(|(id, company, active)| {
        let mut row = serde_json::Map::new();
        row.insert("CustomerId".into(), id.into());
        row.insert("CompanyName".into(), company.into());
        row.insert("IsActive".into(), active.into());
        row
    })
    .collect();
    StaticGateway::new().with_table("Customers", TabularResult { columns, rows })
}
