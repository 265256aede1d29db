//! Module registry: name -> {load context, descriptor, service container}.
//! Owned by the composition root and injected wherever module access is
//! needed; there is no ambient global state.

use crate::activation::RouteState;
use crate::error::RuntimeError;
use crate::module::context::LoadContext;
use crate::module::descriptor::{validate_name, LoadState, ModuleDescriptor, ModuleSpec};
use crate::module::manifest::ModuleManifest;
use crate::query::CompiledQuery;
use crate::services::{HostServices, ServiceProvider};
use crate::shape::{self, ShapeDescriptor};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use wasmtime::{Config, Engine};

/// One fully published module. The store behind `context` is reclaimed when
/// the last clone of this `Arc` drops, so in-flight calls finish against
/// their own reference after an unload.
pub struct LoadedModule {
    pub descriptor: ModuleDescriptor,
    pub manifest: ModuleManifest,
    pub context: Arc<LoadContext>,
    pub provider: Arc<ServiceProvider>,
    /// Persisted queries staged for lazy re-registration after a restart.
    pub stored_queries: RwLock<HashMap<String, CompiledQuery>>,
}

/// What callers get back from a successful load.
#[derive(Clone, Debug, Serialize)]
pub struct ModuleHandle {
    pub name: String,
    pub connection_kind: String,
    pub content_hash: String,
    pub state: LoadState,
    pub endpoints: Vec<String>,
    pub entities: Vec<String>,
}

fn handle_for(module: &LoadedModule) -> ModuleHandle {
    ModuleHandle {
        name: module.descriptor.name.clone(),
        connection_kind: module.descriptor.connection_kind.clone(),
        content_hash: module.descriptor.content_hash.clone(),
        state: module.descriptor.state,
        endpoints: module.manifest.endpoints.iter().map(|e| e.name.clone()).collect(),
        entities: module.manifest.entities.iter().map(|e| e.name.clone()).collect(),
    }
}

pub struct ModuleRegistry {
    engine: Engine,
    host: Arc<HostServices>,
    routes: Arc<RouteState>,
    modules: RwLock<HashMap<String, Arc<LoadedModule>>>,
    /// Lifecycle state per name; absent means unloaded.
    statuses: RwLock<HashMap<String, LoadState>>,
    /// Per-name exclusion: same-name operations serialize, different names
    /// run unconstrained in parallel.
    name_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    lock_timeout: Duration,
}

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

impl ModuleRegistry {
    pub fn new(host: Arc<HostServices>) -> Result<Arc<Self>, RuntimeError> {
        let engine = Engine::new(&Config::new())
            .map_err(|e| RuntimeError::InvalidModuleDefinition(format!("wasm engine: {e}")))?;
        Ok(Arc::new(ModuleRegistry {
            engine,
            host,
            routes: RouteState::new(),
            modules: RwLock::new(HashMap::new()),
            statuses: RwLock::new(HashMap::new()),
            name_locks: Mutex::new(HashMap::new()),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }))
    }

    pub fn routes(&self) -> Arc<RouteState> {
        self.routes.clone()
    }

    pub fn host_services(&self) -> &Arc<HostServices> {
        &self.host
    }

    /// Load a compiled module, replacing any module already registered under
    /// the same name. Runs entirely under the per-name lock; on any failure
    /// the partially created context and container are torn down and no
    /// state survives.
    pub async fn load_module(&self, spec: ModuleSpec) -> Result<ModuleHandle, RuntimeError> {
        validate_name(&spec.name)?;
        let name = spec.name.clone();
        let lock = self.lock_for(&name);
        let _guard = tokio::time::timeout(self.lock_timeout, lock.lock())
            .await
            .map_err(|_| {
                RuntimeError::ConcurrentModificationConflict(format!("module `{name}` is busy"))
            })?;

        self.set_status(&name, LoadState::Loading);
        match self.build_module(spec).await {
            Ok(handle) => {
                self.set_status(&name, LoadState::Loaded);
                Ok(handle)
            }
            Err(err) => {
                self.set_status(&name, LoadState::Failed);
                Err(err)
            }
        }
    }

    /// The load itself, run under the caller's per-name guard. On any failure
    /// the partially created context and container are torn down and no state
    /// survives.
    async fn build_module(&self, spec: ModuleSpec) -> Result<ModuleHandle, RuntimeError> {
        // Replace semantics: at most one active context per name, ever.
        if self.is_loaded(&spec.name) {
            tracing::info!(module = %spec.name, "replacing loaded module");
            self.unload_inner(&spec.name);
        }

        let engine = self.engine.clone();
        let worker_spec = spec.clone();
        let built = tokio::task::spawn_blocking(move || {
            let context = LoadContext::instantiate(&engine, &worker_spec.name, &worker_spec.binary)
                .map_err(RuntimeError::from)?;
            let manifest_json = context
                .call_configure(&worker_spec.connection_kind, &worker_spec.connection_string)
                .map_err(|e| {
                    RuntimeError::InvalidModuleDefinition(format!("configure: {e}"))
                })?;
            let manifest = ModuleManifest::parse(&manifest_json)?;
            Ok::<_, RuntimeError>((context, manifest))
        })
        .await
        .map_err(|e| RuntimeError::InvalidModuleDefinition(format!("load worker: {e}")))?;
        let (context, manifest) = built?;

        let provider = ServiceProvider::build(
            &spec.name,
            &spec.connection_kind,
            &spec.connection_string,
            &manifest.services,
            &self.host,
        )?;

        let module = Arc::new(LoadedModule {
            descriptor: ModuleDescriptor::from_spec(&spec, LoadState::Loaded),
            manifest,
            context: Arc::new(context),
            provider,
            stored_queries: RwLock::new(HashMap::new()),
        });
        let handle = handle_for(&module);
        self.modules_write().insert(spec.name.clone(), module);
        self.refresh_routes();
        tracing::info!(
            module = %spec.name,
            hash = %handle.content_hash,
            endpoints = handle.endpoints.len(),
            "module loaded"
        );
        Ok(handle)
    }

    /// Unload a module. Unloading a name that was never loaded is a no-op
    /// success, which makes the operation idempotent.
    pub async fn unload_module(&self, name: &str) -> Result<(), RuntimeError> {
        let lock = self.lock_for(name);
        let _guard = tokio::time::timeout(self.lock_timeout, lock.lock())
            .await
            .map_err(|_| {
                RuntimeError::ConcurrentModificationConflict(format!("module `{name}` is busy"))
            })?;
        self.unload_inner(name);
        drop(_guard);
        self.prune_lock(name, &lock);
        Ok(())
    }

    /// Teardown order matters: stop routing first, then dispose the
    /// container, then drop the table's reference to the context.
    fn unload_inner(&self, name: &str) {
        self.routes.remove_module(name);
        let removed = self.modules_write().remove(name);
        let mut statuses = match self.statuses.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        statuses.remove(name);
        drop(statuses);
        if let Some(module) = removed {
            module.provider.dispose();
            tracing::info!(module = %name, "module unloaded");
        }
        self.refresh_routes();
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.modules_read().contains_key(name)
    }

    /// Lifecycle state for a name. Names the registry has never seen report
    /// as unloaded.
    pub fn state(&self, name: &str) -> LoadState {
        let statuses = match self.statuses.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        statuses.get(name).copied().unwrap_or(LoadState::Unloaded)
    }

    pub fn get(&self, name: &str) -> Option<Arc<LoadedModule>> {
        self.modules_read().get(name).cloned()
    }

    /// The module's service container, when loaded. Absent names are a
    /// negative result, never an error.
    pub fn container(&self, name: &str) -> Option<Arc<ServiceProvider>> {
        self.get(name).map(|m| m.provider.clone())
    }

    pub fn list(&self) -> Vec<ModuleHandle> {
        let mut handles: Vec<ModuleHandle> = self
            .modules_read()
            .values()
            .map(|module| handle_for(module))
            .collect();
        handles.sort_by(|a, b| a.name.cmp(&b.name));
        handles
    }

    /// Shapes of a loaded module's generated entity types.
    pub fn entities(&self, name: &str) -> Option<Vec<ShapeDescriptor>> {
        let module = self.get(name)?;
        Some(
            module
                .manifest
                .entities
                .iter()
                .map(shape::from_entity)
                .collect(),
        )
    }

    fn refresh_routes(&self) {
        let snapshot: Vec<(String, ModuleManifest)> = self
            .modules_read()
            .values()
            .map(|module| (module.descriptor.name.clone(), module.manifest.clone()))
            .collect();
        self.routes.refresh(&snapshot);
    }

    fn set_status(&self, name: &str, state: LoadState) {
        let mut statuses = match self.statuses.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        statuses.insert(name.to_string(), state);
    }

    // A poisoned table lock means a panic elsewhere mid-mutation; the map
    // itself is still usable, so keep serving.
    fn modules_read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<LoadedModule>>> {
        match self.modules.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn modules_write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<LoadedModule>>> {
        match self.modules.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Drop the per-name lock entry once nothing else holds it, so the map
    /// does not grow with every distinct name the process ever saw.
    fn prune_lock(&self, name: &str, lock: &Arc<tokio::sync::Mutex<()>>) {
        let mut locks = match self.name_locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(existing) = locks.get(name) {
            // Two strong refs: the map's and the caller's.
            if Arc::ptr_eq(existing, lock) && Arc::strong_count(existing) == 2 {
                locks.remove(name);
            }
        }
    }

    fn lock_for(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = match self.name_locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_binary() -> Vec<u8> {
        // configure returns (16 << 32) | 2, the baked "{}" manifest.
        wat::parse_str(
            r#"(module
                (memory (export "memory") 1)
                (global $heap (mut i32) (i32.const 64))
                (func (export "alloc") (param $len i32) (result i32)
                    global.get $heap
                    global.get $heap
                    local.get $len
                    i32.add
                    global.set $heap)
                (data (i32.const 16) "{}")
                (func (export "configure") (param i32 i32) (result i64)
                    i64.const 68719476738))"#,
        )
        .expect("minimal module assembles")
    }

    fn spec(name: &str) -> ModuleSpec {
        ModuleSpec {
            name: name.to_string(),
            connection_kind: "static".into(),
            connection_string: String::new(),
            binary: minimal_binary(),
            symbols: None,
        }
    }

    fn registry() -> Arc<ModuleRegistry> {
        ModuleRegistry::new(Arc::new(HostServices::new())).expect("registry")
    }

    #[tokio::test]
    async fn states_track_the_module_lifecycle() {
        let registry = registry();
        assert_eq!(registry.state("orders"), LoadState::Unloaded);

        registry.load_module(spec("orders")).await.expect("load");
        assert_eq!(registry.state("orders"), LoadState::Loaded);

        let err = registry
            .load_module(ModuleSpec {
                binary: b"junk".to_vec(),
                ..spec("bad")
            })
            .await
            .expect_err("junk binary must fail");
        assert!(matches!(err, RuntimeError::InvalidModuleDefinition(_)));
        assert_eq!(registry.state("bad"), LoadState::Failed);

        registry.unload_module("orders").await.expect("unload");
        assert_eq!(registry.state("orders"), LoadState::Unloaded);
    }

    #[tokio::test]
    async fn poisoned_module_table_recovers() {
        let registry = registry();
        let poisoner = registry.clone();
        let handle = std::thread::spawn(move || {
            let _guard = poisoner.modules.write().unwrap();
            panic!("poison the table");
        });
        assert!(handle.join().is_err());
        assert!(registry.modules.read().is_err());

        registry.load_module(spec("orders")).await.expect("load");
        assert!(registry.is_loaded("orders"));
        assert_eq!(registry.list().len(), 1);
    }

    #[tokio::test]
    async fn name_locks_are_pruned_after_unload() {
        let registry = registry();
        registry.load_module(spec("orders")).await.expect("load");
        registry.unload_module("orders").await.expect("unload");

        let locks = registry.name_locks.lock().expect("lock map");
        assert!(!locks.contains_key("orders"));
    }
}
