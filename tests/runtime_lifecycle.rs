//! End-to-end module lifecycle: generate, compile, load, activate, unload.

use conduit_sdk::activation::{self, HostEndpoint};
use conduit_sdk::compiler::{CompileRequest, CompilerService, WatCompiler};
use conduit_sdk::gateway::{ColumnMeta, StaticGateway, TabularResult};
use conduit_sdk::generator::{module_source, ColumnSchema, ConnectionSchema, TableSchema};
use conduit_sdk::module::{ModuleRegistry, ModuleSpec};
use conduit_sdk::services::{HostServices, ServiceInstance};
use conduit_sdk::shape::FieldKind;
use conduit_sdk::{AppError, RuntimeError};
use serde_json::json;
use std::sync::Arc;

fn northwind_schema() -> ConnectionSchema {
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

fn customers_table() -> TabularResult {
    let rows = [("ALFKI", true), ("ANATR", false), ("ANTON", true)]
        .into_iter()
        .map(|(id, active)| {
            let mut row = serde_json::Map::new();
            row.insert("CustomerId".into(), id.into());
            row.insert("IsActive".into(), active.into());
            row
        })
        .collect();
    TabularResult {
        columns: vec![
            ColumnMeta {
                name: "CustomerId".into(),
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
        ],
        rows,
    }
}

fn static_host() -> Arc<HostServices> {
    let mut host = HostServices::new();
    host.factories.register("data-gateway", |_ctx| {
        Ok(ServiceInstance::Gateway(Arc::new(
            StaticGateway::new().with_table("Customers", customers_table()),
        )))
    });
    Arc::new(host)
}

async fn northwind_spec() -> ModuleSpec {
    let mut sources = std::collections::BTreeMap::new();
    sources.insert("Northwind.wat".into(), module_source(&northwind_schema()));
    let artifact = WatCompiler
        .compile(&CompileRequest {
            name: "Northwind".into(),
            sources,
            references: Vec::new(),
        })
        .await
        .expect("module compiles");
    ModuleSpec {
        name: "Northwind".into(),
        connection_kind: "static".into(),
        connection_string: String::new(),
        binary: artifact.binary,
        symbols: artifact.symbols,
    }
}

#[tokio::test]
async fn load_discovers_endpoints_and_entities() {
    let registry = ModuleRegistry::new(static_host()).expect("registry");
    let handle = registry.load_module(northwind_spec().await).await.expect("load");
    assert_eq!(handle.endpoints, vec!["customers"]);
    assert_eq!(handle.entities, vec!["Customers"]);
    assert!(registry.is_loaded("Northwind"));

    let shapes = registry.entities("Northwind").expect("entities");
    let id = shapes[0]
        .fields
        .iter()
        .find(|f| f.name == "CustomerId")
        .expect("CustomerId field");
    assert!(id.is_primary_key);

    let routes = registry.routes().list();
    assert!(routes
        .iter()
        .any(|r| r.module.as_deref() == Some("Northwind") && r.name == "customers"));
}

#[tokio::test]
async fn activation_runs_the_endpoint_against_the_gateway() {
    let registry = ModuleRegistry::new(static_host()).expect("registry");
    registry.load_module(northwind_spec().await).await.expect("load");

    let value = activation::activate(
        &registry,
        "GET",
        "Northwind",
        "customers",
        json!({"IsActive": true}),
    )
    .await
    .expect("activate");
    let rows = value["rows"].as_array().expect("rows");
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r["IsActive"] == json!(true)));
}

#[tokio::test]
async fn activation_enforces_methods_and_known_routes() {
    let registry = ModuleRegistry::new(static_host()).expect("registry");
    registry.load_module(northwind_spec().await).await.expect("load");

    let err = activation::activate(&registry, "POST", "Northwind", "customers", json!({}))
        .await
        .expect_err("wrong method");
    assert!(matches!(err, AppError::BadRequest(_)));

    let err = activation::activate(&registry, "GET", "Northwind", "orders", json!({}))
        .await
        .expect_err("unknown endpoint");
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn host_endpoints_share_the_route_table() {
    let registry = ModuleRegistry::new(static_host()).expect("registry");
    registry.routes().register_host_endpoint(HostEndpoint {
        name: "ping".into(),
        methods: vec!["GET".into()],
        handler: Arc::new(|_payload| Ok(json!({"pong": true}))),
    });

    let value = activation::activate(&registry, "GET", "host", "ping", json!({}))
        .await
        .expect("host endpoint");
    assert_eq!(value["pong"], json!(true));
}

#[tokio::test]
async fn reload_replaces_the_previous_context() {
    let registry = ModuleRegistry::new(static_host()).expect("registry");
    let spec = northwind_spec().await;
    registry.load_module(spec.clone()).await.expect("first load");
    registry.load_module(spec).await.expect("second load");

    let handles = registry.list();
    assert_eq!(handles.len(), 1);
    assert_eq!(handles[0].name, "Northwind");
}

#[tokio::test]
async fn unload_is_idempotent_and_stops_routing() {
    let registry = ModuleRegistry::new(static_host()).expect("registry");
    registry.unload_module("Ghost").await.expect("unknown name is a no-op");

    registry.load_module(northwind_spec().await).await.expect("load");
    registry.unload_module("Northwind").await.expect("unload");
    assert!(!registry.is_loaded("Northwind"));
    assert!(registry.routes().list().is_empty());

    let err = activation::activate(&registry, "GET", "Northwind", "customers", json!({}))
        .await
        .expect_err("unloaded module must not route");
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn concurrent_same_name_operations_serialize() {
    let registry = ModuleRegistry::new(static_host()).expect("registry");
    let spec = northwind_spec().await;

    let load_a = registry.load_module(spec.clone());
    let load_b = registry.load_module(spec);
    let (a, b) = tokio::join!(load_a, load_b);
    a.expect("load a");
    b.expect("load b");
    assert_eq!(registry.list().len(), 1);

    let unload = registry.unload_module("Northwind");
    let listing = async { registry.list() };
    let (unloaded, _) = tokio::join!(unload, listing);
    unloaded.expect("unload");
    assert!(!registry.is_loaded("Northwind"));
}

#[tokio::test]
async fn invalid_names_and_binaries_are_rejected() {
    let registry = ModuleRegistry::new(static_host()).expect("registry");

    let err = registry
        .load_module(ModuleSpec {
            name: "not a name".into(),
            connection_kind: "static".into(),
            connection_string: String::new(),
            binary: Vec::new(),
            symbols: None,
        })
        .await
        .expect_err("invalid name");
    assert!(matches!(err, RuntimeError::InvalidModuleDefinition(_)));

    let err = registry
        .load_module(ModuleSpec {
            name: "Broken".into(),
            connection_kind: "static".into(),
            connection_string: String::new(),
            binary: b"not wasm".to_vec(),
            symbols: None,
        })
        .await
        .expect_err("invalid binary");
    assert!(matches!(err, RuntimeError::InvalidModuleDefinition(_)));
    assert!(!registry.is_loaded("Broken"));
}
