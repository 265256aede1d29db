//! Isolated load context: one wasmtime store per module. Dropping the
//! context reclaims every instance, satellite query, and byte of guest
//! memory the module ever held.
//!
//! Guest ABI, JSON over linear memory:
//! - exports: `memory`, `alloc(len: i32) -> i32`, `configure(ptr, len) -> i64`,
//!   `endpoint_<name>(ptr, len) -> i64`; satellites export `run_query`.
//! - an `i64` result packs `(ptr << 32) | len` into the calling instance's
//!   memory.
//! - imports (`host` namespace): `log(level, ptr, len)` and
//!   `fetch(ptr, len) -> i64`, which runs the request on the data gateway
//!   bound for the current call.

use crate::gateway::{DataGateway, FetchRequest};
use crate::services::ModuleLogger;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use wasmtime::{Caller, Engine, Extern, Instance, Linker, Memory, Module, Store, TypedFunc, Val};

pub const CONFIGURE_EXPORT: &str = "configure";
pub const QUERY_ENTRY_EXPORT: &str = "run_query";
pub const ALLOC_EXPORT: &str = "alloc";
pub const MEMORY_EXPORT: &str = "memory";
const HOST_NAMESPACE: &str = "host";

#[derive(Error, Debug)]
pub enum ContextError {
    #[error("instantiate: {0}")]
    Instantiate(String),
    #[error("missing export `{0}`")]
    MissingExport(String),
    #[error("guest memory: {0}")]
    MemoryAccess(String),
    #[error("guest trap: {0}")]
    Trap(String),
    #[error("guest payload: {0}")]
    InvalidPayload(String),
}

impl From<ContextError> for crate::error::RuntimeError {
    fn from(err: ContextError) -> Self {
        use crate::error::RuntimeError;
        let message = err.to_string();
        match err {
            ContextError::Instantiate(_) | ContextError::MissingExport(_) => {
                RuntimeError::InvalidModuleDefinition(message)
            }
            ContextError::MemoryAccess(_)
            | ContextError::Trap(_)
            | ContextError::InvalidPayload(_) => RuntimeError::QueryExecutionFailed(message),
        }
    }
}

pub(crate) struct HostState {
    logger: Arc<ModuleLogger>,
    /// Gateway bound for the current call, resolved from the module's
    /// service scope before entering the guest.
    gateway: Option<Arc<dyn DataGateway>>,
    /// Caller-supplied parameters merged into guest fetch requests.
    parameters: serde_json::Map<String, Value>,
}

/// Handles into one instantiated guest; primary module and satellites alike.
#[derive(Clone)]
struct GuestEntry {
    instance: Instance,
    memory: Memory,
    alloc: TypedFunc<i32, i32>,
}

struct ContextInner {
    store: Store<HostState>,
    linker: Linker<HostState>,
    primary: GuestEntry,
    /// The module's compiled-query registry: name -> loaded satellite.
    queries: HashMap<String, GuestEntry>,
}

pub struct LoadContext {
    name: String,
    inner: Mutex<ContextInner>,
}

impl LoadContext {
    /// Load a compiled binary into a fresh store. Fails without leaving any
    /// state behind; the caller owns nothing until this returns `Ok`.
    pub fn instantiate(engine: &Engine, name: &str, binary: &[u8]) -> Result<Self, ContextError> {
        let module = Module::new(engine, binary)
            .map_err(|e| ContextError::Instantiate(e.to_string()))?;
        let mut store = Store::new(
            engine,
            HostState {
                logger: Arc::new(ModuleLogger::new(name)),
                gateway: None,
                parameters: serde_json::Map::new(),
            },
        );
        let mut linker: Linker<HostState> = Linker::new(engine);
        define_host_imports(&mut linker)?;
        let instance = linker
            .instantiate(&mut store, &module)
            .map_err(|e| ContextError::Instantiate(e.to_string()))?;
        let primary = guest_entry(&mut store, instance)?;
        Ok(LoadContext {
            name: name.to_string(),
            inner: Mutex::new(ContextInner {
                store,
                linker,
                primary,
                queries: HashMap::new(),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Invoke the module's single service-configuration entry point. Returns
    /// the raw manifest JSON.
    pub fn call_configure(
        &self,
        connection_kind: &str,
        connection_string: &str,
    ) -> Result<String, ContextError> {
        let payload = serde_json::json!({
            "connection_kind": connection_kind,
            "connection_string": connection_string,
        })
        .to_string();
        self.call_primary(CONFIGURE_EXPORT, &payload, None, serde_json::Map::new())
    }

    /// Invoke one of the module's endpoint exports.
    pub fn call_export(
        &self,
        export: &str,
        payload: &str,
        gateway: Option<Arc<dyn DataGateway>>,
        parameters: serde_json::Map<String, Value>,
    ) -> Result<String, ContextError> {
        self.call_primary(export, payload, gateway, parameters)
    }

    fn call_primary(
        &self,
        export: &str,
        payload: &str,
        gateway: Option<Arc<dyn DataGateway>>,
        parameters: serde_json::Map<String, Value>,
    ) -> Result<String, ContextError> {
        let mut inner = self.lock();
        let entry = inner.primary.clone();
        call_entry(&mut inner, entry, export, payload, gateway, parameters)
    }

    /// Instantiate a satellite query binary into this module's existing
    /// store and register its callable under `name`. Types and host state
    /// are interchangeable with the running module instance.
    pub fn register_query(&self, name: &str, binary: &[u8]) -> Result<(), ContextError> {
        let mut inner = self.lock();
        // Split field borrows through the plain reference, not the guard.
        let inner = &mut *inner;
        let module = Module::new(inner.store.engine(), binary)
            .map_err(|e| ContextError::Instantiate(e.to_string()))?;
        let instance = inner
            .linker
            .instantiate(&mut inner.store, &module)
            .map_err(|e| ContextError::Instantiate(e.to_string()))?;
        let entry = guest_entry(&mut inner.store, instance)?;
        // The factory convention is fixed; reject satellites without it.
        entry
            .instance
            .get_typed_func::<(i32, i32), i64>(&mut inner.store, QUERY_ENTRY_EXPORT)
            .map_err(|_| ContextError::MissingExport(QUERY_ENTRY_EXPORT.to_string()))?;
        inner.queries.insert(name.to_string(), entry);
        Ok(())
    }

    pub fn has_query(&self, name: &str) -> bool {
        self.lock().queries.contains_key(name)
    }

    pub fn query_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().queries.keys().cloned().collect();
        names.sort();
        names
    }

    /// Run a registered compiled query with the given parameters.
    pub fn call_query(
        &self,
        name: &str,
        gateway: Option<Arc<dyn DataGateway>>,
        parameters: serde_json::Map<String, Value>,
    ) -> Result<String, ContextError> {
        let mut inner = self.lock();
        let entry = inner
            .queries
            .get(name)
            .cloned()
            .ok_or_else(|| ContextError::MissingExport(format!("query `{name}`")))?;
        let payload = Value::Object(parameters.clone()).to_string();
        call_entry(
            &mut inner,
            entry,
            QUERY_ENTRY_EXPORT,
            &payload,
            gateway,
            parameters,
        )
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ContextInner> {
        // A poisoned lock means a guest call panicked on another thread;
        // the context is still structurally sound, so keep serving.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn call_entry(
    inner: &mut ContextInner,
    entry: GuestEntry,
    export: &str,
    payload: &str,
    gateway: Option<Arc<dyn DataGateway>>,
    parameters: serde_json::Map<String, Value>,
) -> Result<String, ContextError> {
    let func = entry
        .instance
        .get_typed_func::<(i32, i32), i64>(&mut inner.store, export)
        .map_err(|_| ContextError::MissingExport(export.to_string()))?;
    inner.store.data_mut().gateway = gateway;
    inner.store.data_mut().parameters = parameters;
    let result = (|| {
        let (ptr, len) = write_guest(&mut inner.store, &entry, payload.as_bytes())?;
        let packed = func
            .call(&mut inner.store, (ptr, len))
            .map_err(|e| ContextError::Trap(root_message(&e)))?;
        read_guest(&mut inner.store, &entry.memory, packed)
    })();
    // Never let a per-call binding outlive the call.
    inner.store.data_mut().gateway = None;
    inner.store.data_mut().parameters = serde_json::Map::new();
    result
}

fn guest_entry(store: &mut Store<HostState>, instance: Instance) -> Result<GuestEntry, ContextError> {
    let memory = instance
        .get_memory(&mut *store, MEMORY_EXPORT)
        .ok_or_else(|| ContextError::MissingExport(MEMORY_EXPORT.to_string()))?;
    let alloc = instance
        .get_typed_func::<i32, i32>(&mut *store, ALLOC_EXPORT)
        .map_err(|_| ContextError::MissingExport(ALLOC_EXPORT.to_string()))?;
    Ok(GuestEntry {
        instance,
        memory,
        alloc,
    })
}

fn write_guest(
    store: &mut Store<HostState>,
    entry: &GuestEntry,
    bytes: &[u8],
) -> Result<(i32, i32), ContextError> {
    let len = i32::try_from(bytes.len())
        .map_err(|_| ContextError::InvalidPayload("payload too large".into()))?;
    let ptr = entry
        .alloc
        .call(&mut *store, len)
        .map_err(|e| ContextError::Trap(root_message(&e)))?;
    entry
        .memory
        .write(&mut *store, ptr as usize, bytes)
        .map_err(|e| ContextError::MemoryAccess(e.to_string()))?;
    Ok((ptr, len))
}

fn read_guest(
    store: &mut Store<HostState>,
    memory: &Memory,
    packed: i64,
) -> Result<String, ContextError> {
    let ptr = ((packed as u64) >> 32) as usize;
    let len = ((packed as u64) & 0xffff_ffff) as usize;
    let mut buf = vec![0u8; len];
    memory
        .read(&mut *store, ptr, &mut buf)
        .map_err(|e| ContextError::MemoryAccess(e.to_string()))?;
    String::from_utf8(buf).map_err(|e| ContextError::InvalidPayload(e.to_string()))
}

fn root_message(err: &wasmtime::Error) -> String {
    format!("{}", err.root_cause())
}

fn define_host_imports(linker: &mut Linker<HostState>) -> Result<(), ContextError> {
    linker
        .func_wrap(
            HOST_NAMESPACE,
            "log",
            |mut caller: Caller<'_, HostState>, level: i32, ptr: i32, len: i32| {
                let Ok(bytes) = read_caller_bytes(&mut caller, ptr, len) else {
                    return;
                };
                let message = String::from_utf8_lossy(&bytes).to_string();
                caller.data().logger.log(level.clamp(0, 255) as u8, &message);
            },
        )
        .map_err(|e| ContextError::Instantiate(e.to_string()))?;
    linker
        .func_wrap(
            HOST_NAMESPACE,
            "fetch",
            |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> wasmtime::Result<i64> {
                let bytes = read_caller_bytes(&mut caller, ptr, len)
                    .map_err(wasmtime::Error::msg)?;
                let mut request: FetchRequest = serde_json::from_slice(&bytes)
                    .map_err(|e| wasmtime::Error::msg(format!("fetch request: {e}")))?;
                // Merge the current call's parameters over the baked-in ones.
                for (key, value) in caller.data().parameters.clone() {
                    request.parameters.insert(key, value);
                }
                let gateway = caller.data().gateway.clone().ok_or_else(|| {
                    wasmtime::Error::msg("no data gateway bound for this call")
                })?;
                let result = gateway
                    .fetch(&request)
                    .map_err(|e| wasmtime::Error::msg(e.to_string()))?;
                let json = serde_json::to_string(&result)
                    .map_err(|e| wasmtime::Error::msg(e.to_string()))?;
                write_caller_bytes(&mut caller, json.as_bytes())
            },
        )
        .map_err(|e| ContextError::Instantiate(e.to_string()))?;
    Ok(())
}

fn caller_memory(caller: &mut Caller<'_, HostState>) -> Result<Memory, String> {
    caller
        .get_export(MEMORY_EXPORT)
        .and_then(Extern::into_memory)
        .ok_or_else(|| "wasm memory not available".to_string())
}

fn read_caller_bytes(
    caller: &mut Caller<'_, HostState>,
    ptr: i32,
    len: i32,
) -> Result<Vec<u8>, String> {
    if ptr < 0 || len < 0 {
        return Err("negative guest pointer".into());
    }
    let memory = caller_memory(caller)?;
    let mut buf = vec![0u8; len as usize];
    memory
        .read(&mut *caller, ptr as usize, &mut buf)
        .map_err(|e| e.to_string())?;
    Ok(buf)
}

/// Allocate in the calling instance and write `bytes`, returning the packed
/// pointer/length the guest hands back to its own caller.
fn write_caller_bytes(
    caller: &mut Caller<'_, HostState>,
    bytes: &[u8],
) -> wasmtime::Result<i64> {
    let memory = caller_memory(caller).map_err(wasmtime::Error::msg)?;
    let alloc = caller
        .get_export(ALLOC_EXPORT)
        .and_then(Extern::into_func)
        .ok_or_else(|| wasmtime::Error::msg("guest alloc not available"))?;
    let mut results = [Val::I32(0)];
    alloc.call(
        &mut *caller,
        &[Val::I32(bytes.len() as i32)],
        &mut results,
    )?;
    let ptr = match results[0] {
        Val::I32(p) => p,
        _ => return Err(wasmtime::Error::msg("unexpected alloc result type")),
    };
    memory.write(&mut *caller, ptr as usize, bytes)?;
    Ok((((ptr as u32 as u64) << 32) | (bytes.len() as u64)) as i64)
}
