use crate::error::{Result, SingleTableError};
use crate::expression::Op;
use crate::hooks::{FieldCheck, ModelValidator};
use crate::schema::Field;
use crate::value::{Properties, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Accumulated field to message map for one block
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub errors: BTreeMap<String, String>,
}

impl ValidationResult {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add(&mut self, field: &str, message: String) {
        self.errors.insert(field.to_string(), message);
    }

    /// Raise a single error carrying every message, or succeed when empty.
    pub fn into_result(self, model: &str) -> Result<()> {
        if self.is_ok() {
            return Ok(());
        }
        let names: Vec<&str> = self.errors.keys().map(String::as_str).collect();
        Err(SingleTableError::Validation {
            message: format!("Validation Error in \"{model}\" for \"{}\"", names.join(", ")),
            fields: self.errors,
        })
    }
}

/// Validation stage for put and update. The model validator, per-call field
/// checks, field patterns and enumerations run first, then the required check:
/// missing or null on create, explicitly null on update.
pub(crate) fn validate_properties(
    model: &str,
    op: Op,
    fields: &BTreeMap<String, Field>,
    properties: &mut Properties,
    validator: Option<&Arc<dyn ModelValidator>>,
    check: Option<&Arc<dyn FieldCheck>>,
) -> Result<()> {
    if !matches!(op, Op::Put | Op::Update) {
        return Ok(());
    }
    let mut result = ValidationResult::default();
    if let Some(validator) = validator {
        result.errors = validator.validate(model, properties);
    }

    let names: Vec<String> = properties.keys().cloned().collect();
    for name in names {
        let Some(field) = fields.get(&name) else {
            continue;
        };
        if check.is_none() && field.validate.is_none() && field.enum_values.is_none() {
            continue;
        }
        if let Some(value) = properties.remove(&name) {
            let value = validate_property(model, field, value, &mut result, check);
            properties.insert(name, value);
        }
    }

    for field in fields.values() {
        let value = properties.get(&field.name);
        let missing = match op {
            Op::Put => value.map_or(true, Value::is_null),
            _ => matches!(value, Some(Value::Null)),
        };
        if field.required && missing {
            result.add(
                &field.name,
                format!("Value not defined for required field \"{}\"", field.name),
            );
        }
    }

    result.into_result(model)
}

fn validate_property(
    model: &str,
    field: &Field,
    value: Value,
    result: &mut ValidationResult,
    check: Option<&Arc<dyn FieldCheck>>,
) -> Value {
    let name = &field.name;
    let value = match check {
        Some(check) => {
            let (value, error) = check.check(model, field, value);
            if let Some(error) = error {
                result.add(name, error);
            }
            value
        }
        None => value,
    };

    let text = value.to_text().unwrap_or_else(|| value.to_json().to_string());
    if let Some(pattern) = &field.validate {
        if value.is_null() {
            if field.required && field.value.is_none() {
                result.add(name, format!("Value not defined for \"{name}\""));
            }
        } else if !pattern.is_match(&text) {
            result.add(name, format!("Bad value \"{text}\" for \"{name}\""));
        }
    }
    if let Some(allowed) = &field.enum_values {
        if !allowed.iter().any(|a| *a == text) {
            result.add(name, format!("Bad value \"{text}\" for \"{name}\""));
        }
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{parse_schema_str, Indexes, ModelOptions, ModelSchema};
    use crate::value::to_properties;
    use serde_json::json;

    const SCHEMA: &str = r#"
indexes:
  primary: { hash: pk }
models:
  User:
    pk: { type: string }
    email: { type: string, validate: "/^[a-z]+@[a-z.]+$/i" }
    role: { type: string, enum: [admin, user] }
    name: { type: string, required: true }
"#;

    fn model() -> ModelSchema {
        let schema = parse_schema_str(SCHEMA).unwrap();
        let indexes = Indexes::compile(&schema.indexes).unwrap();
        ModelSchema::compile(
            "User",
            &schema.models["User"],
            &indexes,
            &schema.params,
            &ModelOptions::default(),
        )
        .unwrap()
    }

    struct NoShouting;

    impl FieldCheck for NoShouting {
        fn check(&self, _model: &str, field: &Field, value: Value) -> (Value, Option<String>) {
            match (field.name.as_str(), &value) {
                ("name", Value::String(s)) if s.chars().all(|c| c.is_uppercase()) => {
                    (Value::String(s.to_lowercase()), None)
                }
                _ => (value, None),
            }
        }
    }

    #[test]
    fn test_valid_properties() {
        let model = model();
        let mut props = to_properties(json!({
            "pk": "u#1", "_type": "User", "email": "A@b.com", "role": "admin", "name": "A"
        }));
        validate_properties("User", Op::Put, &model.block.fields, &mut props, None, None).unwrap();
    }

    #[test]
    fn test_collects_all_messages() {
        let model = model();
        let mut props = to_properties(json!({
            "pk": "u#1", "_type": "User", "email": "nope", "role": "root"
        }));
        let err = validate_properties("User", Op::Put, &model.block.fields, &mut props, None, None)
            .unwrap_err();
        match err {
            SingleTableError::Validation { fields, message } => {
                assert_eq!(fields.len(), 3);
                assert!(fields["email"].starts_with("Bad value"));
                assert!(fields["role"].starts_with("Bad value"));
                assert!(fields["name"].contains("required"));
                assert!(message.contains("\"User\""));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_required_on_update_only_rejects_explicit_null() {
        let model = model();
        let mut props = to_properties(json!({"pk": "u#1"}));
        validate_properties("User", Op::Update, &model.block.fields, &mut props, None, None)
            .unwrap();
        let mut props = to_properties(json!({"pk": "u#1", "name": null}));
        let err = validate_properties("User", Op::Update, &model.block.fields, &mut props, None, None)
            .unwrap_err();
        assert_eq!(err.code(), "ValidationError");
    }

    #[test]
    fn test_skipped_for_reads() {
        let model = model();
        let mut props = to_properties(json!({"email": "nope"}));
        validate_properties("User", Op::Get, &model.block.fields, &mut props, None, None).unwrap();
    }

    #[test]
    fn test_field_check_rewrites_value() {
        let model = model();
        let check: Arc<dyn FieldCheck> = Arc::new(NoShouting);
        let mut props = to_properties(json!({"pk": "u#1", "_type": "User", "name": "ALICE"}));
        validate_properties("User", Op::Put, &model.block.fields, &mut props, None, Some(&check))
            .unwrap();
        assert_eq!(props["name"], Value::from("alice"));
    }
}
