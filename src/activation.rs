//! Route discovery and endpoint activation.
//!
//! The route table is rebuilt from the host's endpoints plus every loaded
//! module's manifest on each load/unload. Activation plans (the per-endpoint
//! reflection the original cached per controller type) are built lazily on
//! first use and invalidated with their owning module, so a stale plan can
//! never reach a disposed container.

use crate::error::{AppError, RuntimeError};
use crate::module::manifest::ModuleManifest;
use crate::module::registry::ModuleRegistry;
use crate::services::ServiceScope;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

pub type HostEndpointHandler =
    Arc<dyn Fn(&Value) -> Result<Value, RuntimeError> + Send + Sync>;

/// Endpoint implemented by the host itself rather than a loaded module.
/// Addressed under the reserved `host` module segment.
#[derive(Clone)]
pub struct HostEndpoint {
    pub name: String,
    pub methods: Vec<String>,
    pub handler: HostEndpointHandler,
}

pub const HOST_SEGMENT: &str = "host";

#[derive(Clone, Debug, serde::Serialize)]
pub struct EndpointRoute {
    /// Owning module; `None` for host endpoints.
    pub module: Option<String>,
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub export: String,
    pub methods: Vec<String>,
    pub services: Vec<String>,
}

/// Cached activation metadata for one route.
#[derive(Clone, Debug)]
pub struct ActivationPlan {
    pub module_owned: bool,
    pub module: Option<String>,
    pub export: String,
    pub methods: Vec<String>,
    pub services: Vec<String>,
}

#[derive(Default)]
pub struct RouteState {
    routes: RwLock<HashMap<String, EndpointRoute>>,
    plans: RwLock<HashMap<String, ActivationPlan>>,
    host_endpoints: RwLock<HashMap<String, HostEndpoint>>,
}

impl RouteState {
    pub fn new() -> Arc<Self> {
        Arc::new(RouteState::default())
    }

    pub fn register_host_endpoint(&self, endpoint: HostEndpoint) {
        if let Ok(mut eps) = self.host_endpoints.write() {
            eps.insert(endpoint.name.clone(), endpoint);
        }
        self.rebuild_host_routes();
    }

    fn rebuild_host_routes(&self) {
        let endpoints = match self.host_endpoints.read() {
            Ok(eps) => eps.clone(),
            Err(_) => return,
        };
        if let Ok(mut routes) = self.routes.write() {
            for (name, ep) in endpoints {
                routes.insert(
                    route_key(HOST_SEGMENT, &name),
                    EndpointRoute {
                        module: None,
                        name: ep.name.clone(),
                        export: String::new(),
                        methods: ep.methods.clone(),
                        services: Vec::new(),
                    },
                );
            }
        }
    }

    /// Recompute the full table from the current set of loaded modules.
    pub fn refresh(&self, modules: &[(String, ModuleManifest)]) {
        let mut next: HashMap<String, EndpointRoute> = HashMap::new();
        for (module_name, manifest) in modules {
            for endpoint in &manifest.endpoints {
                next.insert(
                    route_key(module_name, &endpoint.name),
                    EndpointRoute {
                        module: Some(module_name.clone()),
                        name: endpoint.name.clone(),
                        export: endpoint.export.clone(),
                        methods: endpoint.methods.clone(),
                        services: endpoint.services.clone(),
                    },
                );
            }
        }
        if let Ok(mut routes) = self.routes.write() {
            *routes = next;
        }
        self.rebuild_host_routes();
    }

    /// Drop every route and cached plan owned by `module`. Runs before the
    /// module's provider is disposed.
    pub fn remove_module(&self, module: &str) {
        if let Ok(mut routes) = self.routes.write() {
            routes.retain(|_, r| r.module.as_deref() != Some(module));
        }
        if let Ok(mut plans) = self.plans.write() {
            plans.retain(|_, p| p.module.as_deref() != Some(module));
        }
    }

    pub fn list(&self) -> Vec<EndpointRoute> {
        let mut out: Vec<EndpointRoute> = self
            .routes
            .read()
            .map(|r| r.values().cloned().collect())
            .unwrap_or_default();
        out.sort_by(|a, b| (a.module.clone(), a.name.clone()).cmp(&(b.module.clone(), b.name.clone())));
        out
    }

    pub fn host_endpoint(&self, name: &str) -> Option<HostEndpoint> {
        self.host_endpoints.read().ok()?.get(name).cloned()
    }

    pub fn cached_plan(&self, key: &str) -> Option<ActivationPlan> {
        self.plans.read().ok()?.get(key).cloned()
    }

    /// Plan for a route, building and caching it on first use.
    pub fn plan(&self, key: &str) -> Option<ActivationPlan> {
        if let Some(plan) = self.cached_plan(key) {
            return Some(plan);
        }
        let route = self.routes.read().ok()?.get(key).cloned()?;
        let plan = ActivationPlan {
            module_owned: route.module.is_some(),
            module: route.module,
            export: route.export,
            methods: route.methods,
            services: route.services,
        };
        if let Ok(mut plans) = self.plans.write() {
            plans.insert(key.to_string(), plan.clone());
        }
        Some(plan)
    }
}

pub fn route_key(module: &str, endpoint: &str) -> String {
    format!("{module}/{endpoint}")
}

/// Activate an endpoint for one request: resolve its plan, open a scope on
/// the right container, resolve every declared service, run, and tear the
/// scope down with the request.
pub async fn activate(
    registry: &ModuleRegistry,
    method: &str,
    module_segment: &str,
    endpoint: &str,
    payload: Value,
) -> Result<Value, AppError> {
    let key = route_key(module_segment, endpoint);
    let routes = registry.routes();
    let plan = routes
        .plan(&key)
        .ok_or_else(|| AppError::NotFound(key.clone()))?;
    if !plan.methods.iter().any(|m| m.eq_ignore_ascii_case(method)) {
        return Err(AppError::BadRequest(format!(
            "method {method} not allowed for {key}"
        )));
    }

    if !plan.module_owned {
        // Host fast path: no module scope involved.
        let host_endpoint = routes
            .host_endpoint(endpoint)
            .ok_or_else(|| AppError::NotFound(key.clone()))?;
        return (host_endpoint.handler)(&payload).map_err(AppError::from);
    }

    let module_name = plan.module.clone().unwrap_or_default();
    let module = registry.get(&module_name).ok_or_else(|| {
        // The module vanished under a cached plan; drop the stale entry.
        routes.remove_module(&module_name);
        RuntimeError::ModuleNotFound(module_name.clone())
    })?;

    let scope = ServiceScope::open(module.provider.clone())?;
    let mut gateway = None;
    for service in &plan.services {
        let instance = scope.resolve(service)?;
        if gateway.is_none() {
            gateway = instance.as_gateway();
        }
    }

    let parameters = match &payload {
        Value::Object(map) => map.clone(),
        _ => serde_json::Map::new(),
    };
    let context = module.context.clone();
    let export = plan.export.clone();
    let body = payload.to_string();
    let raw = tokio::task::spawn_blocking(move || {
        context.call_export(&export, &body, gateway, parameters)
    })
    .await
    .map_err(|e| RuntimeError::QueryExecutionFailed(format!("activation worker: {e}")))?
    .map_err(RuntimeError::from)?;
    drop(scope);

    let value = serde_json::from_str(&raw).map_err(|e| {
        RuntimeError::QueryExecutionFailed(format!("endpoint returned invalid JSON: {e}"))
    })?;
    Ok(value)
}
