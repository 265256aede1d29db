//! Source generator boundary. The runtime treats generation as a pure
//! function from a connection description to named source texts; the
//! reference implementation emits a WebAssembly text module from a supplied
//! connection schema. Database introspection itself stays external.

use crate::error::RuntimeError;
use crate::module::manifest::{
    EndpointSpec, EntityField, EntityModel, ModuleManifest, ServiceLifetime, ServiceSpec,
};
use crate::shape::FieldKind;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

#[async_trait]
pub trait SourceGenerator: Send + Sync {
    /// Produce the named source texts for one connection.
    async fn generate(
        &self,
        name: &str,
        connection_kind: &str,
        connection_string: &str,
    ) -> Result<BTreeMap<String, String>, RuntimeError>;
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub kind: FieldKind,
    #[serde(default)]
    pub nullable: bool,
    #[serde(default)]
    pub is_primary_key: bool,
    #[serde(default)]
    pub is_foreign_key: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub references: Option<String>,
    #[serde(default)]
    pub is_identity: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnSchema>,
}

/// Structural description of one external connection, as an introspection
/// step would report it.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ConnectionSchema {
    pub tables: Vec<TableSchema>,
}

/// Generator backed by a catalog of known connection schemas.
#[derive(Default)]
pub struct SchemaSourceGenerator {
    schemas: HashMap<String, ConnectionSchema>,
}

impl SchemaSourceGenerator {
    pub fn new() -> Self {
        SchemaSourceGenerator::default()
    }

    pub fn register(&mut self, name: &str, schema: ConnectionSchema) {
        self.schemas.insert(name.to_string(), schema);
    }

    pub fn with_schema(mut self, name: &str, schema: ConnectionSchema) -> Self {
        self.register(name, schema);
        self
    }
}

#[async_trait]
impl SourceGenerator for SchemaSourceGenerator {
    async fn generate(
        &self,
        name: &str,
        _connection_kind: &str,
        _connection_string: &str,
    ) -> Result<BTreeMap<String, String>, RuntimeError> {
        let schema = self.schemas.get(name).ok_or_else(|| {
            RuntimeError::InvalidModuleDefinition(format!(
                "no schema registered for connection `{name}`"
            ))
        })?;
        let mut sources = BTreeMap::new();
        sources.insert(format!("{name}.wat"), module_source(schema));
        Ok(sources)
    }
}

/// Manifest the generated module reports from its `configure` entry point.
pub fn manifest_for_schema(schema: &ConnectionSchema) -> ModuleManifest {
    let entities = schema
        .tables
        .iter()
        .map(|table| EntityModel {
            name: table.name.clone(),
            fields: table
                .columns
                .iter()
                .map(|col| EntityField {
                    name: col.name.clone(),
                    kind: col.kind,
                    nullable: col.nullable,
                    is_primary_key: col.is_primary_key,
                    is_foreign_key: col.is_foreign_key,
                    references: col.references.clone(),
                    is_identity: col.is_identity,
                    computed_expression: None,
                })
                .collect(),
        })
        .collect();
    let endpoints = schema
        .tables
        .iter()
        .map(|table| EndpointSpec {
            name: table.name.to_ascii_lowercase(),
            export: format!("endpoint_{}", table.name.to_ascii_lowercase()),
            methods: vec!["GET".to_string()],
            services: vec!["data-gateway".to_string()],
        })
        .collect();
    ModuleManifest {
        services: vec![
            ServiceSpec {
                name: "logger".into(),
                kind: "logger".into(),
                lifetime: ServiceLifetime::Singleton,
                depends_on: Vec::new(),
                config: serde_json::Value::Null,
            },
            ServiceSpec {
                name: "data-gateway".into(),
                kind: "data-gateway".into(),
                lifetime: ServiceLifetime::Scoped,
                depends_on: vec!["logger".into()],
                config: serde_json::Value::Null,
            },
        ],
        endpoints,
        entities,
    }
}

const DATA_BASE: usize = 16;

/// Emit the WAT module for one connection schema: the manifest baked into a
/// data segment behind `configure`, and one `endpoint_<table>` export per
/// table that forwards its baked fetch request to the host.
pub fn module_source(schema: &ConnectionSchema) -> String {
    let manifest_json = serde_json::to_string(&manifest_for_schema(schema))
        .expect("manifest serialization is infallible");

    let mut segments: Vec<(usize, String)> = Vec::new();
    let mut offset = DATA_BASE;
    let mut place = |text: String| -> (usize, usize) {
        let at = offset;
        let len = text.len();
        segments.push((at, text));
        offset = align16(at + len);
        (at, len)
    };

    let (manifest_off, manifest_len) = place(manifest_json);
    let mut endpoint_funcs = String::new();
    for table in &schema.tables {
        let request = serde_json::json!({
            "query": format!("select * from \"{}\"", table.name),
            "entity": table.name,
        })
        .to_string();
        let (req_off, req_len) = place(request);
        endpoint_funcs.push_str(&format!(
            "  (func (export \"endpoint_{}\") (param i32 i32) (result i64)\n    i32.const {req_off}\n    i32.const {req_len}\n    call $fetch)\n",
            table.name.to_ascii_lowercase(),
        ));
    }

    let heap_base = align16(offset.max(1024));
    let pages = heap_base / 65536 + 2;
    let data_segments: String = segments
        .iter()
        .map(|(at, text)| format!("  (data (i32.const {at}) \"{}\")\n", wat_string_literal(text.as_bytes())))
        .collect();

    format!(
        "(module\n\
         \x20 (import \"host\" \"fetch\" (func $fetch (param i32 i32) (result i64)))\n\
         \x20 (memory (export \"memory\") {pages})\n\
         \x20 (global $heap (mut i32) (i32.const {heap_base}))\n\
         \x20 (func (export \"alloc\") (param $len i32) (result i32)\n\
         \x20   (local $ptr i32)\n\
         \x20   global.get $heap\n\
         \x20   local.set $ptr\n\
         \x20   global.get $heap\n\
         \x20   local.get $len\n\
         \x20   i32.add\n\
         \x20   i32.const 15\n\
         \x20   i32.add\n\
         \x20   i32.const -16\n\
         \x20   i32.and\n\
         \x20   global.set $heap\n\
         \x20   local.get $ptr)\n\
         {data_segments}\
         \x20 (func (export \"configure\") (param i32 i32) (result i64)\n\
         \x20   i64.const {packed})\n\
         {endpoint_funcs})\n",
        packed = pack(manifest_off, manifest_len),
    )
}

fn align16(n: usize) -> usize {
    (n + 15) & !15
}

/// Pack a data-segment location the way guest exports return results:
/// `(ptr << 32) | len`.
pub fn pack(ptr: usize, len: usize) -> i64 {
    (((ptr as u64) << 32) | (len as u64)) as i64
}

/// Escape bytes for a WAT data-segment string literal.
pub fn wat_string_literal(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    for &b in bytes {
        match b {
            b'"' => out.push_str("\\\""),
            b'\\' => out.push_str("\\\\"),
            0x20..=0x7e => out.push(b as char),
            _ => out.push_str(&format!("\\{:02x}", b)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn northwind() -> ConnectionSchema {
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

    #[test]
    fn manifest_covers_tables_services_and_endpoints() {
        let manifest = manifest_for_schema(&northwind());
        assert_eq!(manifest.entities.len(), 1);
        assert_eq!(manifest.endpoints[0].export, "endpoint_customers");
        assert!(manifest.services.iter().any(|s| s.name == "data-gateway"));
        manifest.validate().expect("generated manifest is valid");
    }

    #[test]
    fn emitted_source_assembles() {
        let source = module_source(&northwind());
        let binary = wat::parse_str(&source).expect("generated WAT assembles");
        assert!(binary.starts_with(b"\0asm"));
    }

    #[test]
    fn string_literals_escape_quotes_and_non_ascii() {
        assert_eq!(wat_string_literal(b"a\"b"), "a\\\"b");
        assert_eq!(wat_string_literal(b"\\"), "\\\\");
        assert_eq!(wat_string_literal(&[0x01]), "\\01");
    }

    #[tokio::test]
    async fn generator_rejects_unknown_connections() {
        let generator = SchemaSourceGenerator::new();
        let err = generator
            .generate("Ghost", "sqlserver", "Server=.;")
            .await
            .expect_err("must fail");
        assert!(matches!(err, RuntimeError::InvalidModuleDefinition(_)));
    }
}
