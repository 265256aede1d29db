//! Per-module service containers: bindings from the module's own
//! configuration step plus shared host services, a validated provider, and
//! request scopes. One provider per loaded module, disposed exactly once.

use crate::error::RuntimeError;
use crate::gateway::DataGateway;
use crate::module::manifest::{ServiceLifetime, ServiceSpec};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// Logger handed to guest modules; scoped to the owning module name so guest
/// log lines are attributable.
pub struct ModuleLogger {
    module: String,
}

impl ModuleLogger {
    pub fn new(module: &str) -> Self {
        ModuleLogger {
            module: module.to_string(),
        }
    }

    pub fn log(&self, level: u8, message: &str) {
        match level {
            0 => tracing::error!(module = %self.module, "{message}"),
            1 => tracing::warn!(module = %self.module, "{message}"),
            2 => tracing::info!(module = %self.module, "{message}"),
            3 => tracing::debug!(module = %self.module, "{message}"),
            _ => tracing::trace!(module = %self.module, "{message}"),
        }
    }
}

/// Host-wide cache shared across all modules.
#[derive(Default)]
pub struct MemoryCache {
    inner: RwLock<HashMap<String, Value>>,
}

impl MemoryCache {
    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.read().ok().and_then(|m| m.get(key).cloned())
    }

    pub fn put(&self, key: &str, value: Value) {
        if let Ok(mut m) = self.inner.write() {
            m.insert(key.to_string(), value);
        }
    }

    /// Drop every key under `prefix`; used when a module is unloaded so no
    /// cached data outlives the context that produced it.
    pub fn invalidate_prefix(&self, prefix: &str) {
        if let Ok(mut m) = self.inner.write() {
            m.retain(|k, _| !k.starts_with(prefix));
        }
    }
}

/// A resolved service instance. Host capabilities are a closed set: only what
/// the host can actually hand to a wasm guest.
#[derive(Clone)]
pub enum ServiceInstance {
    Gateway(Arc<dyn DataGateway>),
    Cache(Arc<MemoryCache>),
    Logger(Arc<ModuleLogger>),
}

impl ServiceInstance {
    pub fn as_gateway(&self) -> Option<Arc<dyn DataGateway>> {
        match self {
            ServiceInstance::Gateway(g) => Some(g.clone()),
            _ => None,
        }
    }
}

/// Everything a factory may need to build one binding.
pub struct ServiceBuildCtx<'a> {
    pub module: &'a str,
    pub connection_kind: &'a str,
    pub connection_string: &'a str,
    pub spec: &'a ServiceSpec,
    pub cache: &'a Arc<MemoryCache>,
}

pub type ServiceFactory =
    Arc<dyn Fn(&ServiceBuildCtx<'_>) -> Result<ServiceInstance, RuntimeError> + Send + Sync>;

/// Host registry mapping a manifest `kind` to the factory that builds it.
#[derive(Clone, Default)]
pub struct ServiceFactoryRegistry {
    factories: HashMap<String, ServiceFactory>,
}

impl ServiceFactoryRegistry {
    pub fn register<F>(&mut self, kind: &str, factory: F)
    where
        F: Fn(&ServiceBuildCtx<'_>) -> Result<ServiceInstance, RuntimeError>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(kind.to_string(), Arc::new(factory));
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    fn get(&self, kind: &str) -> Option<&ServiceFactory> {
        self.factories.get(kind)
    }
}

/// Shared host services injected into every module container.
pub struct HostServices {
    pub cache: Arc<MemoryCache>,
    pub factories: ServiceFactoryRegistry,
}

impl HostServices {
    /// Registry with the builtin kinds every host carries: `logger` and
    /// `memory-cache`. Data gateways are registered by the composition root.
    pub fn new() -> Self {
        let cache = Arc::new(MemoryCache::default());
        let mut factories = ServiceFactoryRegistry::default();
        factories.register("logger", |ctx| {
            Ok(ServiceInstance::Logger(Arc::new(ModuleLogger::new(
                ctx.module,
            ))))
        });
        factories.register("memory-cache", |ctx| {
            Ok(ServiceInstance::Cache(ctx.cache.clone()))
        });
        HostServices { cache, factories }
    }
}

impl Default for HostServices {
    fn default() -> Self {
        HostServices::new()
    }
}

struct ProviderInner {
    module: String,
    connection_kind: String,
    connection_string: String,
    specs: HashMap<String, ServiceSpec>,
    factories: ServiceFactoryRegistry,
    cache: Arc<MemoryCache>,
    singletons: Mutex<HashMap<String, ServiceInstance>>,
}

/// Built once per successful load. Validates every registration at build
/// time; singletons are instantiated eagerly so configuration errors surface
/// before the module is published.
pub struct ServiceProvider {
    inner: ProviderInner,
    disposed: AtomicBool,
}

impl ServiceProvider {
    pub fn build(
        module: &str,
        connection_kind: &str,
        connection_string: &str,
        specs: &[ServiceSpec],
        host: &HostServices,
    ) -> Result<Arc<Self>, RuntimeError> {
        let mut by_name: HashMap<String, ServiceSpec> = HashMap::new();
        for spec in specs {
            if by_name.insert(spec.name.clone(), spec.clone()).is_some() {
                return Err(RuntimeError::ServiceConfigurationError(format!(
                    "duplicate binding `{}`",
                    spec.name
                )));
            }
        }
        for spec in specs {
            if !host.factories.contains(&spec.kind) {
                return Err(RuntimeError::ServiceConfigurationError(format!(
                    "binding `{}` uses unknown kind `{}`",
                    spec.name, spec.kind
                )));
            }
            for dep in &spec.depends_on {
                if !by_name.contains_key(dep) {
                    return Err(RuntimeError::ServiceConfigurationError(format!(
                        "binding `{}` depends on undeclared `{dep}`",
                        spec.name
                    )));
                }
            }
        }
        detect_cycles(&by_name)?;

        let provider = Arc::new(ServiceProvider {
            inner: ProviderInner {
                module: module.to_string(),
                connection_kind: connection_kind.to_string(),
                connection_string: connection_string.to_string(),
                specs: by_name,
                factories: host.factories.clone(),
                cache: host.cache.clone(),
                singletons: Mutex::new(HashMap::new()),
            },
            disposed: AtomicBool::new(false),
        });

        // Eager singleton construction; any factory failure rolls the whole
        // container back.
        for spec in specs {
            if spec.lifetime == ServiceLifetime::Singleton {
                let instance = provider.instantiate(spec)?;
                if let Ok(mut singletons) = provider.inner.singletons.lock() {
                    singletons.insert(spec.name.clone(), instance);
                }
            }
        }
        Ok(provider)
    }

    pub fn module(&self) -> &str {
        &self.inner.module
    }

    pub fn has_binding(&self, name: &str) -> bool {
        self.inner.specs.contains_key(name)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// First call wins; later calls are no-ops. Singleton instances are
    /// released here, scoped instances die with their scopes.
    pub fn dispose(&self) -> bool {
        let first = !self.disposed.swap(true, Ordering::SeqCst);
        if first {
            if let Ok(mut singletons) = self.inner.singletons.lock() {
                singletons.clear();
            }
            self.inner
                .cache
                .invalidate_prefix(&format!("{}:", self.inner.module));
        }
        first
    }

    fn instantiate(&self, spec: &ServiceSpec) -> Result<ServiceInstance, RuntimeError> {
        let factory = self.inner.factories.get(&spec.kind).ok_or_else(|| {
            RuntimeError::ServiceConfigurationError(format!("unknown kind `{}`", spec.kind))
        })?;
        factory(&ServiceBuildCtx {
            module: &self.inner.module,
            connection_kind: &self.inner.connection_kind,
            connection_string: &self.inner.connection_string,
            spec,
            cache: &self.inner.cache,
        })
    }
}

fn detect_cycles(specs: &HashMap<String, ServiceSpec>) -> Result<(), RuntimeError> {
    fn visit(
        name: &str,
        specs: &HashMap<String, ServiceSpec>,
        visiting: &mut Vec<String>,
        done: &mut std::collections::HashSet<String>,
    ) -> Result<(), RuntimeError> {
        if done.contains(name) {
            return Ok(());
        }
        if visiting.iter().any(|n| n == name) {
            return Err(RuntimeError::ServiceConfigurationError(format!(
                "dependency cycle through `{name}`"
            )));
        }
        visiting.push(name.to_string());
        if let Some(spec) = specs.get(name) {
            for dep in &spec.depends_on {
                visit(dep, specs, visiting, done)?;
            }
        }
        visiting.pop();
        done.insert(name.to_string());
        Ok(())
    }
    let mut done = std::collections::HashSet::new();
    for name in specs.keys() {
        visit(name, specs, &mut Vec::new(), &mut done)?;
    }
    Ok(())
}

/// One request-scoped resolution context. Holds `Arc`s to everything it
/// resolves, so instances stay alive for the request even if the provider is
/// disposed mid-flight.
pub struct ServiceScope {
    provider: Arc<ServiceProvider>,
    resolved: Mutex<HashMap<String, ServiceInstance>>,
}

impl ServiceScope {
    pub fn open(provider: Arc<ServiceProvider>) -> Result<Self, RuntimeError> {
        if provider.is_disposed() {
            return Err(RuntimeError::ServiceResolutionError(format!(
                "container for module `{}` is disposed",
                provider.module()
            )));
        }
        Ok(ServiceScope {
            provider,
            resolved: Mutex::new(HashMap::new()),
        })
    }

    pub fn resolve(&self, name: &str) -> Result<ServiceInstance, RuntimeError> {
        if let Ok(resolved) = self.resolved.lock() {
            if let Some(instance) = resolved.get(name) {
                return Ok(instance.clone());
            }
        }
        if self.provider.is_disposed() {
            return Err(RuntimeError::ServiceResolutionError(format!(
                "container for module `{}` is disposed",
                self.provider.module()
            )));
        }
        if let Ok(singletons) = self.provider.inner.singletons.lock() {
            if let Some(instance) = singletons.get(name) {
                return Ok(instance.clone());
            }
        }
        let spec = self.provider.inner.specs.get(name).ok_or_else(|| {
            RuntimeError::ServiceResolutionError(format!(
                "no binding `{name}` in module `{}`",
                self.provider.module()
            ))
        })?;
        // Dependencies resolve first so factories observe a complete scope.
        for dep in spec.depends_on.clone() {
            self.resolve(&dep)?;
        }
        let instance = self.provider.instantiate(spec)?;
        if let Ok(mut resolved) = self.resolved.lock() {
            resolved.insert(name.to_string(), instance.clone());
        }
        Ok(instance)
    }

    /// Resolve the module's data gateway binding, if the endpoint declared
    /// one. A binding of the wrong capability is a resolution failure, not a
    /// silent default.
    pub fn gateway(&self, name: &str) -> Result<Arc<dyn DataGateway>, RuntimeError> {
        self.resolve(name)?.as_gateway().ok_or_else(|| {
            RuntimeError::ServiceResolutionError(format!(
                "binding `{name}` is not a data gateway"
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::StaticGateway;

    fn spec(name: &str, kind: &str, lifetime: ServiceLifetime, deps: &[&str]) -> ServiceSpec {
        ServiceSpec {
            name: name.into(),
            kind: kind.into(),
            lifetime,
            depends_on: deps.iter().map(|s| s.to_string()).collect(),
            config: serde_json::Value::Null,
        }
    }

    fn unwrap_err<T>(result: Result<T, RuntimeError>) -> RuntimeError {
        match result {
            Ok(_) => panic!("expected an error"),
            Err(err) => err,
        }
    }

    fn host_with_gateway() -> HostServices {
        let mut host = HostServices::new();
        host.factories.register("data-gateway", |_ctx| {
            Ok(ServiceInstance::Gateway(Arc::new(StaticGateway::new())))
        });
        host
    }

    #[test]
    fn build_rejects_unknown_kinds() {
        let host = HostServices::new();
        let err = unwrap_err(ServiceProvider::build(
            "m",
            "static",
            "",
            &[spec("svc", "no-such-kind", ServiceLifetime::Scoped, &[])],
            &host,
        ));
        assert!(matches!(err, RuntimeError::ServiceConfigurationError(_)));
    }

    #[test]
    fn build_rejects_undeclared_dependencies_and_cycles() {
        let host = host_with_gateway();
        let err = unwrap_err(ServiceProvider::build(
            "m",
            "static",
            "",
            &[spec("a", "data-gateway", ServiceLifetime::Scoped, &["ghost"])],
            &host,
        ));
        assert!(matches!(err, RuntimeError::ServiceConfigurationError(_)));

        let err = unwrap_err(ServiceProvider::build(
            "m",
            "static",
            "",
            &[
                spec("a", "data-gateway", ServiceLifetime::Scoped, &["b"]),
                spec("b", "data-gateway", ServiceLifetime::Scoped, &["a"]),
            ],
            &host,
        ));
        assert!(matches!(err, RuntimeError::ServiceConfigurationError(_)));
    }

    #[test]
    fn dispose_is_exactly_once_and_blocks_new_scopes() {
        let host = host_with_gateway();
        let provider = ServiceProvider::build(
            "m",
            "static",
            "",
            &[spec("logger", "logger", ServiceLifetime::Singleton, &[])],
            &host,
        )
        .expect("build");
        assert!(provider.dispose());
        assert!(!provider.dispose());
        let err = unwrap_err(ServiceScope::open(provider));
        assert!(matches!(err, RuntimeError::ServiceResolutionError(_)));
    }

    #[test]
    fn open_scope_survives_disposal_for_already_resolved_services() {
        let host = host_with_gateway();
        let provider = ServiceProvider::build(
            "m",
            "static",
            "",
            &[spec("gw", "data-gateway", ServiceLifetime::Scoped, &[])],
            &host,
        )
        .expect("build");
        let scope = ServiceScope::open(provider.clone()).expect("scope");
        let gateway = scope.gateway("gw").expect("resolve before dispose");
        provider.dispose();
        // The in-flight request keeps its instance...
        assert!(scope.resolve("gw").is_ok());
        drop(gateway);
        // ...but anything not yet resolved now fails.
        let err = unwrap_err(scope.resolve("other"));
        assert!(matches!(err, RuntimeError::ServiceResolutionError(_)));
    }

    #[test]
    fn unregistered_binding_fails_resolution() {
        let host = host_with_gateway();
        let provider = ServiceProvider::build("m", "static", "", &[], &host).expect("build");
        let scope = ServiceScope::open(provider).expect("scope");
        let err = unwrap_err(scope.resolve("missing"));
        assert!(matches!(err, RuntimeError::ServiceResolutionError(_)));
    }
}
