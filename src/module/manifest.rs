//! Module manifest: what a generated module declares about itself from its
//! `configure` entry point: service bindings, endpoints, entity metadata.

use crate::error::RuntimeError;
use crate::shape::FieldKind;
use serde::{Deserialize, Serialize};

pub const ENDPOINT_EXPORT_PREFIX: &str = "endpoint_";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceLifetime {
    Singleton,
    Scoped,
}

impl Default for ServiceLifetime {
    fn default() -> Self {
        ServiceLifetime::Scoped
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceSpec {
    /// Binding name other services and endpoints refer to.
    pub name: String,
    /// Host factory kind that builds the implementation.
    pub kind: String,
    #[serde(default)]
    pub lifetime: ServiceLifetime,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Free-form factory configuration.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub config: serde_json::Value,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EndpointSpec {
    pub name: String,
    /// Guest export backing the endpoint; must follow the naming convention.
    pub export: String,
    #[serde(default = "default_methods")]
    pub methods: Vec<String>,
    /// Service bindings resolved per request before the endpoint runs.
    #[serde(default)]
    pub services: Vec<String>,
}

fn default_methods() -> Vec<String> {
    vec!["GET".to_string()]
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EntityField {
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
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub computed_expression: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EntityModel {
    pub name: String,
    pub fields: Vec<EntityField>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ModuleManifest {
    #[serde(default)]
    pub services: Vec<ServiceSpec>,
    #[serde(default)]
    pub endpoints: Vec<EndpointSpec>,
    #[serde(default)]
    pub entities: Vec<EntityModel>,
}

impl ModuleManifest {
    pub fn parse(json: &str) -> Result<Self, RuntimeError> {
        let manifest: ModuleManifest = serde_json::from_str(json)
            .map_err(|e| RuntimeError::InvalidModuleDefinition(format!("manifest: {e}")))?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn validate(&self) -> Result<(), RuntimeError> {
        let mut endpoint_names = std::collections::HashSet::new();
        for endpoint in &self.endpoints {
            if !endpoint.export.starts_with(ENDPOINT_EXPORT_PREFIX) {
                return Err(RuntimeError::InvalidModuleDefinition(format!(
                    "endpoint `{}` export `{}` must start with `{}`",
                    endpoint.name, endpoint.export, ENDPOINT_EXPORT_PREFIX
                )));
            }
            if !endpoint_names.insert(endpoint.name.as_str()) {
                return Err(RuntimeError::InvalidModuleDefinition(format!(
                    "duplicate endpoint name `{}`",
                    endpoint.name
                )));
            }
            for service in &endpoint.services {
                if !self.services.iter().any(|s| &s.name == service) {
                    return Err(RuntimeError::InvalidModuleDefinition(format!(
                        "endpoint `{}` requires undeclared service `{}`",
                        endpoint.name, service
                    )));
                }
            }
        }
        let mut service_names = std::collections::HashSet::new();
        for service in &self.services {
            if !service_names.insert(service.name.as_str()) {
                return Err(RuntimeError::InvalidModuleDefinition(format!(
                    "duplicate service binding `{}`",
                    service.name
                )));
            }
        }
        Ok(())
    }

    pub fn entity(&self, name: &str) -> Option<&EntityModel> {
        self.entities.iter().find(|e| e.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_a_full_manifest() {
        let manifest = ModuleManifest::parse(
            &json!({
                "services": [
                    {"name": "logger", "kind": "logger", "lifetime": "singleton"},
                    {"name": "data-gateway", "kind": "data-gateway", "depends_on": ["logger"]}
                ],
                "endpoints": [
                    {"name": "customers", "export": "endpoint_customers", "services": ["data-gateway"]}
                ],
                "entities": [
                    {"name": "Customers", "fields": [
                        {"name": "CustomerId", "kind": "string", "is_primary_key": true}
                    ]}
                ]
            })
            .to_string(),
        )
        .expect("manifest parses");
        assert_eq!(manifest.endpoints[0].methods, vec!["GET"]);
        assert_eq!(manifest.services[1].lifetime, ServiceLifetime::Scoped);
        assert!(manifest.entity("Customers").is_some());
    }

    #[test]
    fn rejects_endpoints_outside_the_export_convention() {
        let err = ModuleManifest::parse(
            &json!({
                "endpoints": [{"name": "x", "export": "handler_x"}]
            })
            .to_string(),
        )
        .expect_err("must fail");
        assert!(matches!(err, RuntimeError::InvalidModuleDefinition(_)));
    }

    #[test]
    fn rejects_endpoints_with_undeclared_services() {
        let err = ModuleManifest::parse(
            &json!({
                "endpoints": [{"name": "x", "export": "endpoint_x", "services": ["missing"]}]
            })
            .to_string(),
        )
        .expect_err("must fail");
        assert!(matches!(err, RuntimeError::InvalidModuleDefinition(_)));
    }
}
