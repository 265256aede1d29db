//! Conduit SDK: dynamic module runtime for connection-driven backends.

pub mod activation;
pub mod compiler;
pub mod error;
pub mod gateway;
pub mod generator;
pub mod handlers;
pub mod module;
pub mod query;
pub mod response;
pub mod routes;
pub mod services;
pub mod shape;
pub mod state;
pub mod store;

pub use activation::{activate, HostEndpoint, RouteState};
pub use compiler::{CachingCompiler, CompileRequest, CompilerService, Diagnostic, WatCompiler};
pub use error::{AppError, RuntimeError};
pub use gateway::{DataGateway, FetchRequest, PgDataGateway, StaticGateway, TabularResult};
pub use generator::{ConnectionSchema, SchemaSourceGenerator, SourceGenerator};
pub use module::{LoadContext, ModuleManifest, ModuleRegistry, ModuleSpec};
pub use query::{AdHocQueryService, CompiledQuery, QueryPage};
pub use routes::{common_routes, common_routes_with_ready, connection_routes, dynamic_routes};
pub use services::{HostServices, ServiceProvider, ServiceScope};
pub use shape::ShapeDescriptor;
pub use state::{AppState, DynamicRuntime};
pub use store::{ensure_database_exists, ensure_sys_tables, restore_modules};
