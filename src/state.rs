//! Shared application state for all routes.

use crate::compiler::CompilerService;
use crate::generator::SourceGenerator;
use crate::module::registry::ModuleRegistry;
use crate::query::AdHocQueryService;
use sqlx::PgPool;
use std::sync::Arc;

/// The runtime's moving parts, wired once by the composition root.
pub struct DynamicRuntime {
    pub registry: Arc<ModuleRegistry>,
    pub compiler: Arc<dyn CompilerService>,
    pub generator: Arc<dyn SourceGenerator>,
    pub queries: AdHocQueryService,
}

impl DynamicRuntime {
    pub fn new(
        registry: Arc<ModuleRegistry>,
        compiler: Arc<dyn CompilerService>,
        generator: Arc<dyn SourceGenerator>,
    ) -> Arc<Self> {
        let queries = AdHocQueryService::new(registry.clone(), compiler.clone());
        Arc::new(DynamicRuntime {
            registry,
            compiler,
            generator,
            queries,
        })
    }
}

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub runtime: Arc<DynamicRuntime>,
}
