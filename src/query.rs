//! Ad hoc compiled queries: a query source is wrapped into a satellite
//! module, compiled, instantiated into the owning module's load context, and
//! sample-executed once so its output shape can be inferred. Registered
//! queries then run with caller parameters and host-side pagination.

use crate::compiler::{CompileRequest, CompilerService, Diagnostic};
use crate::error::RuntimeError;
use crate::gateway::{FetchRequest, TabularResult};
use crate::generator::wat_string_literal;
use crate::module::descriptor::validate_name;
use crate::module::registry::{LoadedModule, ModuleRegistry};
use crate::services::ServiceScope;
use crate::shape::{self, ShapeDescriptor};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

pub const GATEWAY_BINDING: &str = "data-gateway";

const PAGE_SIZE_MAX: u32 = 500;
const PAGE_SIZE_DEFAULT: u32 = 50;

/// A compiled, registered query and its inferred output shape.
#[derive(Clone, Debug, Serialize)]
pub struct CompiledQuery {
    pub id: Uuid,
    pub module_name: String,
    pub name: String,
    pub source: String,
    #[serde(skip_serializing)]
    pub binary: Vec<u8>,
    pub output_shape: ShapeDescriptor,
}

/// One page of query results.
#[derive(Clone, Debug, Serialize)]
pub struct QueryPage {
    pub rows: Vec<serde_json::Map<String, Value>>,
    pub total_count: u64,
    pub page_number: u32,
    pub page_size: u32,
}

pub struct AdHocQueryService {
    registry: Arc<ModuleRegistry>,
    compiler: Arc<dyn CompilerService>,
}

impl AdHocQueryService {
    pub fn new(registry: Arc<ModuleRegistry>, compiler: Arc<dyn CompilerService>) -> Self {
        AdHocQueryService { registry, compiler }
    }

    /// Compile `source` against a loaded module, register the satellite in
    /// the module's context, run it once with empty parameters to infer the
    /// output shape, and record the result for later execution.
    pub async fn create_and_run(
        &self,
        module_name: &str,
        query_name: &str,
        source: &str,
    ) -> Result<CompiledQuery, RuntimeError> {
        validate_name(query_name)?;
        let module = self
            .registry
            .get(module_name)
            .ok_or_else(|| RuntimeError::ModuleNotFound(module_name.to_string()))?;

        let source_name = format!("{query_name}.wat");
        let mut sources = BTreeMap::new();
        sources.insert(source_name.clone(), satellite_source(source));
        let request = CompileRequest {
            name: format!("{module_name}.{query_name}"),
            sources,
            references: vec![module.descriptor.binary.clone()],
        };
        let artifact = self.compiler.compile(&request).await.map_err(|e| match e {
            RuntimeError::CompilationFailed(diagnostics) => {
                RuntimeError::QueryCompilationFailed(diagnostics)
            }
            other => other,
        })?;

        register_into_context(&module, query_name, artifact.binary.clone()).await?;

        // Sample run: empty parameters, whatever the query returns defines
        // its shape.
        let sample = run_registered(&module, query_name, serde_json::Map::new()).await?;
        let output_shape = shape::from_tabular(query_name, &sample, &module.manifest.entities);

        let compiled = CompiledQuery {
            id: Uuid::new_v4(),
            module_name: module_name.to_string(),
            name: query_name.to_string(),
            source: source.to_string(),
            binary: artifact.binary,
            output_shape,
        };
        if let Ok(mut stored) = module.stored_queries.write() {
            stored.insert(query_name.to_string(), compiled.clone());
        }
        tracing::info!(
            module = %module_name,
            query = %query_name,
            columns = compiled.output_shape.fields.len(),
            "query compiled and registered"
        );
        Ok(compiled)
    }

    /// Run a registered query with caller parameters and paginate the rows.
    /// Queries persisted before a restart are re-registered lazily from
    /// their stored binaries on first execution.
    pub async fn execute(
        &self,
        module_name: &str,
        query_name: &str,
        parameters: serde_json::Map<String, Value>,
        page_number: Option<u32>,
        page_size: Option<u32>,
    ) -> Result<QueryPage, RuntimeError> {
        let module = self
            .registry
            .get(module_name)
            .ok_or_else(|| RuntimeError::ModuleNotFound(module_name.to_string()))?;

        if !module.context.has_query(query_name) {
            let stored = module
                .stored_queries
                .read()
                .ok()
                .and_then(|s| s.get(query_name).cloned());
            match stored {
                Some(compiled) => {
                    register_into_context(&module, query_name, compiled.binary).await?
                }
                None => {
                    return Err(RuntimeError::QueryExecutionFailed(format!(
                        "query `{query_name}` is not registered for module `{module_name}`"
                    )))
                }
            }
        }

        let result = run_registered(&module, query_name, parameters).await?;
        Ok(paginate(result.rows, page_number, page_size))
    }

    /// Registered queries for a module, sorted by name.
    pub fn list(&self, module_name: &str) -> Result<Vec<CompiledQuery>, RuntimeError> {
        let module = self
            .registry
            .get(module_name)
            .ok_or_else(|| RuntimeError::ModuleNotFound(module_name.to_string()))?;
        let mut out: Vec<CompiledQuery> = module
            .stored_queries
            .read()
            .map(|s| s.values().cloned().collect())
            .unwrap_or_default();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }
}

async fn register_into_context(
    module: &Arc<LoadedModule>,
    query_name: &str,
    binary: Vec<u8>,
) -> Result<(), RuntimeError> {
    let context = module.context.clone();
    let name = query_name.to_string();
    let source_name = format!("{query_name}.wat");
    tokio::task::spawn_blocking(move || context.register_query(&name, &binary))
        .await
        .map_err(|e| RuntimeError::QueryExecutionFailed(format!("register worker: {e}")))?
        .map_err(|e| {
            RuntimeError::QueryCompilationFailed(vec![Diagnostic {
                code: "LINK001".into(),
                message: e.to_string(),
                source_name,
                line: None,
                column: None,
            }])
        })
}

/// Run an already-registered query on a blocking thread with the module's
/// own data gateway bound for the call.
async fn run_registered(
    module: &Arc<LoadedModule>,
    query_name: &str,
    parameters: serde_json::Map<String, Value>,
) -> Result<TabularResult, RuntimeError> {
    let gateway = if module.provider.has_binding(GATEWAY_BINDING) {
        let scope = ServiceScope::open(module.provider.clone())?;
        Some(scope.gateway(GATEWAY_BINDING)?)
    } else {
        None
    };

    let context = module.context.clone();
    let name = query_name.to_string();
    let raw = tokio::task::spawn_blocking(move || context.call_query(&name, gateway, parameters))
        .await
        .map_err(|e| RuntimeError::QueryExecutionFailed(format!("query worker: {e}")))?
        .map_err(RuntimeError::from)?;
    serde_json::from_str(&raw)
        .map_err(|e| RuntimeError::QueryExecutionFailed(format!("query result: {e}")))
}

/// Page through rows after execution. Pages are 1-based; sizes clamp to
/// `1..=500`.
pub fn paginate(
    rows: Vec<serde_json::Map<String, Value>>,
    page_number: Option<u32>,
    page_size: Option<u32>,
) -> QueryPage {
    let page_number = page_number.unwrap_or(1).max(1);
    let page_size = page_size.unwrap_or(PAGE_SIZE_DEFAULT).clamp(1, PAGE_SIZE_MAX);
    let total_count = rows.len() as u64;
    let skip = (page_number as usize - 1).saturating_mul(page_size as usize);
    let rows = rows
        .into_iter()
        .skip(skip)
        .take(page_size as usize)
        .collect();
    QueryPage {
        rows,
        total_count,
        page_number,
        page_size,
    }
}

const SNIPPET_BASE: usize = 16;

/// Wrap a query snippet into the satellite module source. The snippet is
/// either a full fetch-request JSON object (query/entity/parameters) or bare
/// query text; either way it is baked into a data segment and forwarded to
/// the host on each `run_query` call, with per-call parameters merged in by
/// the host.
pub fn satellite_source(snippet: &str) -> String {
    let request = fetch_request_for_snippet(snippet);
    let json = serde_json::to_string(&request).unwrap_or_else(|_| "{}".into());
    let len = json.len();
    let heap_base = ((SNIPPET_BASE + len + 15) & !15).max(1024);
    let pages = heap_base / 65536 + 2;
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
         \x20 (data (i32.const {SNIPPET_BASE}) \"{literal}\")\n\
         \x20 (func (export \"run_query\") (param i32 i32) (result i64)\n\
         \x20   i32.const {SNIPPET_BASE}\n\
         \x20   i32.const {len}\n\
         \x20   call $fetch)\n\
         )\n",
        literal = wat_string_literal(json.as_bytes()),
    )
}

/// A snippet that parses as a JSON object is taken as a full fetch request;
/// anything else is bare query text.
fn fetch_request_for_snippet(snippet: &str) -> FetchRequest {
    if let Ok(request) = serde_json::from_str::<FetchRequest>(snippet) {
        return request;
    }
    FetchRequest {
        query: snippet.to_string(),
        entity: None,
        parameters: serde_json::Map::new(),
    }
}
