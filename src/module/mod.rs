//! The dynamic module runtime: descriptors, isolated load contexts, and the
//! registry that owns them.

pub mod context;
pub mod descriptor;
pub mod manifest;
pub mod registry;

pub use context::{ContextError, LoadContext, CONFIGURE_EXPORT, QUERY_ENTRY_EXPORT};
pub use descriptor::{binary_hash, validate_name, LoadState, ModuleDescriptor, ModuleSpec};
pub use manifest::{EndpointSpec, EntityField, EntityModel, ModuleManifest, ServiceSpec};
pub use registry::{LoadedModule, ModuleHandle, ModuleRegistry};
