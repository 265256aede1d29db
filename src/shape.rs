//! Structural shape inference for generated types and tabular results.
//!
//! Pure functions: a shape descriptor is always derived from its input, never
//! stored as mutable state. Identical input yields an identical descriptor.

use crate::gateway::TabularResult;
use crate::module::manifest::{EntityField, EntityModel};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Primitive kind vocabulary shared by entity fields and result columns.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FieldKind {
    String,
    Integer,
    Number,
    Boolean,
    DateTime,
    Array,
    Object,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    pub kind: FieldKind,
    #[serde(default)]
    pub nullable: bool,
    #[serde(default)]
    pub is_primary_key: bool,
    #[serde(default)]
    pub is_foreign_key: bool,
    /// Entity referenced by a foreign-key/navigation field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub references: Option<String>,
    #[serde(default)]
    pub is_identity: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub computed_expression: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ShapeDescriptor {
    pub name: String,
    pub fields: Vec<FieldDescriptor>,
}

/// Shape of a generated entity type, enriched with the key/relationship
/// metadata the module manifest carries.
pub fn from_entity(entity: &EntityModel) -> ShapeDescriptor {
    ShapeDescriptor {
        name: entity.name.clone(),
        fields: entity.fields.iter().map(field_from_entity).collect(),
    }
}

fn field_from_entity(field: &EntityField) -> FieldDescriptor {
    FieldDescriptor {
        name: field.name.clone(),
        kind: field.kind,
        nullable: field.nullable,
        is_primary_key: field.is_primary_key,
        is_foreign_key: field.is_foreign_key,
        references: field.references.clone(),
        is_identity: field.is_identity,
        computed_expression: field.computed_expression.clone(),
    }
}

/// Shape of a tabular result. Declared column types win; when the result
/// carries no column metadata the shape is inferred from the row values.
/// Key metadata is enriched from the supplied entity models where a column
/// name matches a known entity field.
pub fn from_tabular(name: &str, result: &TabularResult, entities: &[EntityModel]) -> ShapeDescriptor {
    if result.columns.is_empty() {
        return from_rows(name, &result.rows, entities);
    }
    let fields = result
        .columns
        .iter()
        .map(|c| {
            let mut field = FieldDescriptor {
                name: c.name.clone(),
                kind: kind_from_declared_type(&c.declared_type),
                nullable: c.nullable,
                is_primary_key: false,
                is_foreign_key: false,
                references: None,
                is_identity: c.is_identity,
                computed_expression: c.computed_expression.clone(),
            };
            enrich_from_entities(&mut field, entities);
            field
        })
        .collect();
    ShapeDescriptor {
        name: name.to_string(),
        fields,
    }
}

/// Infer a shape from plain JSON rows (no column metadata available).
pub fn from_rows(
    name: &str,
    rows: &[serde_json::Map<String, Value>],
    entities: &[EntityModel],
) -> ShapeDescriptor {
    // BTreeMap keeps field order stable across identical inputs.
    let mut columns: BTreeMap<String, (Option<FieldKind>, bool)> = BTreeMap::new();
    for row in rows {
        for (key, value) in row {
            let entry = columns.entry(key.clone()).or_insert((None, false));
            match value_kind(value) {
                Some(kind) => {
                    if entry.0.is_none() {
                        entry.0 = Some(kind);
                    }
                }
                None => entry.1 = true,
            }
        }
    }
    // A column absent from some row is nullable too.
    for row in rows {
        for key in columns.keys().cloned().collect::<Vec<_>>() {
            if !row.contains_key(&key) {
                if let Some(entry) = columns.get_mut(&key) {
                    entry.1 = true;
                }
            }
        }
    }
    let fields = columns
        .into_iter()
        .map(|(col, (kind, nullable))| {
            let mut field = FieldDescriptor {
                name: col,
                kind: kind.unwrap_or(FieldKind::String),
                nullable,
                is_primary_key: false,
                is_foreign_key: false,
                references: None,
                is_identity: false,
                computed_expression: None,
            };
            enrich_from_entities(&mut field, entities);
            field
        })
        .collect();
    ShapeDescriptor {
        name: name.to_string(),
        fields,
    }
}

fn enrich_from_entities(field: &mut FieldDescriptor, entities: &[EntityModel]) {
    for entity in entities {
        if let Some(meta) = entity.fields.iter().find(|f| f.name == field.name) {
            field.is_primary_key |= meta.is_primary_key;
            field.is_foreign_key |= meta.is_foreign_key;
            if field.references.is_none() {
                field.references = meta.references.clone();
            }
            return;
        }
    }
}

/// Map a declared column type (database vocabulary) to a primitive kind.
pub fn kind_from_declared_type(declared: &str) -> FieldKind {
    let t = declared.trim().to_ascii_lowercase();
    if t.ends_with("[]") || t.starts_with('_') || t == "array" {
        return FieldKind::Array;
    }
    if t.contains("json") {
        return FieldKind::Object;
    }
    if t.starts_with("bool") || t == "bit" {
        return FieldKind::Boolean;
    }
    if t.contains("int") || t.contains("serial") {
        return FieldKind::Integer;
    }
    if t.contains("numeric")
        || t.contains("decimal")
        || t.contains("float")
        || t.contains("double")
        || t.contains("real")
        || t.contains("money")
    {
        return FieldKind::Number;
    }
    if t.contains("timestamp") || t.contains("date") || t.contains("time") {
        return FieldKind::DateTime;
    }
    FieldKind::String
}

fn value_kind(value: &Value) -> Option<FieldKind> {
    match value {
        Value::Null => None,
        Value::Bool(_) => Some(FieldKind::Boolean),
        Value::Number(n) => {
            if n.is_i64() || n.is_u64() {
                Some(FieldKind::Integer)
            } else {
                Some(FieldKind::Number)
            }
        }
        Value::String(_) => Some(FieldKind::String),
        Value::Array(_) => Some(FieldKind::Array),
        Value::Object(_) => Some(FieldKind::Object),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::ColumnMeta;
    use serde_json::json;

    fn row(value: Value) -> serde_json::Map<String, Value> {
        value.as_object().expect("test row must be an object").clone()
    }

    #[test]
    fn declared_types_map_to_primitive_kinds() {
        assert_eq!(kind_from_declared_type("varchar(40)"), FieldKind::String);
        assert_eq!(kind_from_declared_type("BIGINT"), FieldKind::Integer);
        assert_eq!(kind_from_declared_type("numeric(10,2)"), FieldKind::Number);
        assert_eq!(kind_from_declared_type("boolean"), FieldKind::Boolean);
        assert_eq!(kind_from_declared_type("timestamptz"), FieldKind::DateTime);
        assert_eq!(kind_from_declared_type("jsonb"), FieldKind::Object);
        assert_eq!(kind_from_declared_type("text[]"), FieldKind::Array);
    }

    #[test]
    fn rows_infer_kinds_and_nullability() {
        let rows = vec![
            row(json!({"id": 1, "name": "a", "active": true, "note": null})),
            row(json!({"id": 2, "name": "b", "active": false})),
        ];
        let shape = from_rows("sample", &rows, &[]);
        let by_name: std::collections::HashMap<_, _> =
            shape.fields.iter().map(|f| (f.name.as_str(), f)).collect();
        assert_eq!(by_name["id"].kind, FieldKind::Integer);
        assert_eq!(by_name["name"].kind, FieldKind::String);
        assert_eq!(by_name["active"].kind, FieldKind::Boolean);
        assert!(by_name["note"].nullable);
        assert!(!by_name["id"].nullable);
    }

    #[test]
    fn shape_inference_is_idempotent() {
        let rows = vec![row(json!({"id": 7, "label": "x"}))];
        let first = from_rows("q", &rows, &[]);
        let second = from_rows("q", &rows, &[]);
        assert_eq!(first, second);
    }

    #[test]
    fn entity_metadata_marks_keys_on_tabular_shapes() {
        let entity = EntityModel {
            name: "Customers".into(),
            fields: vec![EntityField {
                name: "CustomerId".into(),
                kind: FieldKind::String,
                nullable: false,
                is_primary_key: true,
                is_foreign_key: false,
                references: None,
                is_identity: false,
                computed_expression: None,
            }],
        };
        let result = TabularResult {
            columns: vec![ColumnMeta {
                name: "CustomerId".into(),
                declared_type: "varchar(5)".into(),
                nullable: false,
                is_identity: false,
                computed_expression: None,
            }],
            rows: Vec::new(),
        };
        let shape = from_tabular("ActiveCustomers", &result, std::slice::from_ref(&entity));
        assert!(shape.fields[0].is_primary_key);
        assert_eq!(shape.fields[0].kind, FieldKind::String);
    }
}
