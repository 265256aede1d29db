//! Ad hoc query flow: compile against a loaded module, infer the output
//! shape, then execute with parameters and pagination.

use conduit_sdk::compiler::{CompileRequest, CompilerService, WatCompiler};
use conduit_sdk::gateway::{ColumnMeta, StaticGateway, TabularResult};
use conduit_sdk::generator::{module_source, ColumnSchema, ConnectionSchema, TableSchema};
use conduit_sdk::module::{ModuleRegistry, ModuleSpec};
use conduit_sdk::query::AdHocQueryService;
use conduit_sdk::services::{HostServices, ServiceInstance};
use conduit_sdk::shape::FieldKind;
use conduit_sdk::RuntimeError;
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

fn customers_table(count: usize) -> TabularResult {
    let rows = (1..=count)
        .map(|i| {
            let mut row = serde_json::Map::new();
            row.insert("CustomerId".into(), format!("C{i:03}").into());
            // Every third customer is inactive.
            row.insert("IsActive".into(), (i % 3 != 0).into());
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

async fn loaded_registry(row_count: usize) -> Arc<ModuleRegistry> {
    let mut host = HostServices::new();
    host.factories.register("data-gateway", move |_ctx| {
        Ok(ServiceInstance::Gateway(Arc::new(
            StaticGateway::new().with_table("Customers", customers_table(row_count)),
        )))
    });
    let registry = ModuleRegistry::new(Arc::new(host)).expect("registry");

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
    registry
        .load_module(ModuleSpec {
            name: "Northwind".into(),
            connection_kind: "static".into(),
            connection_string: String::new(),
            binary: artifact.binary,
            symbols: artifact.symbols,
        })
        .await
        .expect("load");
    registry
}

fn query_service(registry: Arc<ModuleRegistry>) -> AdHocQueryService {
    AdHocQueryService::new(registry, Arc::new(WatCompiler))
}

const ACTIVE_CUSTOMERS: &str =
    r#"{"query": "select active customers", "entity": "Customers", "parameters": {"IsActive": true}}"#;

#[tokio::test]
async fn create_and_run_registers_and_infers_the_shape() {
    let registry = loaded_registry(3).await;
    let queries = query_service(registry.clone());

    let compiled = queries
        .create_and_run("Northwind", "ActiveCustomers", ACTIVE_CUSTOMERS)
        .await
        .expect("create");
    assert_eq!(compiled.module_name, "Northwind");
    assert_eq!(compiled.output_shape.name, "ActiveCustomers");

    // Declared columns win, and entity metadata marks the key.
    let id = compiled
        .output_shape
        .fields
        .iter()
        .find(|f| f.name == "CustomerId")
        .expect("CustomerId field");
    assert_eq!(id.kind, FieldKind::String);
    assert!(id.is_primary_key);

    let module = registry.get("Northwind").expect("module");
    assert!(module.context.has_query("ActiveCustomers"));
    assert_eq!(queries.list("Northwind").expect("list").len(), 1);
}

#[tokio::test]
async fn execute_filters_and_paginates() {
    let registry = loaded_registry(25).await;
    let queries = query_service(registry);
    queries
        .create_and_run("Northwind", "AllCustomers", r#"{"query": "all", "entity": "Customers"}"#)
        .await
        .expect("create");

    let page = queries
        .execute(
            "Northwind",
            "AllCustomers",
            serde_json::Map::new(),
            Some(2),
            Some(10),
        )
        .await
        .expect("execute");
    assert_eq!(page.total_count, 25);
    assert_eq!(page.rows.len(), 10);
    assert_eq!(page.rows[0]["CustomerId"], json!("C011"));
    assert_eq!(page.rows[9]["CustomerId"], json!("C020"));

    // Call-time parameters narrow the baked request.
    let mut params = serde_json::Map::new();
    params.insert("IsActive".into(), json!(false));
    let inactive = queries
        .execute("Northwind", "AllCustomers", params, None, None)
        .await
        .expect("execute with params");
    assert_eq!(inactive.total_count, 8);
    assert!(inactive
        .rows
        .iter()
        .all(|r| r["IsActive"] == json!(false)));
}

#[tokio::test]
async fn sample_run_happens_at_creation() {
    let registry = loaded_registry(6).await;
    let queries = query_service(registry);
    let compiled = queries
        .create_and_run("Northwind", "ActiveCustomers", ACTIVE_CUSTOMERS)
        .await
        .expect("create");
    // The shape came from a real sample execution, so the filtered column
    // set matches the gateway's declared columns.
    assert_eq!(compiled.output_shape.fields.len(), 2);
}

#[tokio::test]
async fn unknown_modules_and_queries_fail_cleanly() {
    let registry = loaded_registry(3).await;
    let queries = query_service(registry);

    let err = queries
        .create_and_run("Ghost", "Q", "select 1")
        .await
        .expect_err("missing module");
    assert!(matches!(err, RuntimeError::ModuleNotFound(_)));

    let err = queries
        .execute("Northwind", "Missing", serde_json::Map::new(), None, None)
        .await
        .expect_err("unregistered query");
    assert!(matches!(err, RuntimeError::QueryExecutionFailed(_)));
}

#[tokio::test]
async fn stored_binaries_reregister_lazily() {
    let registry = loaded_registry(3).await;
    let queries = query_service(registry.clone());
    let compiled = queries
        .create_and_run("Northwind", "ActiveCustomers", ACTIVE_CUSTOMERS)
        .await
        .expect("create");

    // Simulate a restart: reload the module, then seed only the stored
    // binary the way the persistence layer does.
    let module = registry.get("Northwind").expect("module");
    let spec = ModuleSpec {
        name: "Northwind".into(),
        connection_kind: "static".into(),
        connection_string: String::new(),
        binary: module.descriptor.binary.clone(),
        symbols: None,
    };
    registry.load_module(spec).await.expect("reload");
    let reloaded = registry.get("Northwind").expect("module");
    assert!(!reloaded.context.has_query("ActiveCustomers"));
    reloaded
        .stored_queries
        .write()
        .expect("stored queries")
        .insert("ActiveCustomers".into(), compiled);

    let page = queries
        .execute("Northwind", "ActiveCustomers", serde_json::Map::new(), None, None)
        .await
        .expect("lazy re-registration");
    assert_eq!(page.total_count, 2);
    assert!(reloaded.context.has_query("ActiveCustomers"));
}
