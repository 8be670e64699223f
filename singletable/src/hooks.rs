//! Strategy interfaces injected into a table or a single call.

use crate::error::Result;
use crate::schema::Field;
use crate::value::{Properties, Value};
use std::collections::BTreeMap;

/// Direction of a transform relative to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

/// Whole-record transform applied to prepared records before writing and to
/// parsed items after reading.
pub trait ItemTransform: Send + Sync {
    fn transform(
        &self,
        model: &str,
        direction: Direction,
        item: Properties,
        properties: &Properties,
    ) -> Result<Properties>;
}

/// Per-attribute transform replacing the built-in type coercion.
pub trait AttributeTransform: Send + Sync {
    fn transform(
        &self,
        model: &str,
        direction: Direction,
        name: &str,
        value: Value,
        properties: &Properties,
    ) -> Result<Value>;
}

/// Model-wide validation. Returns a field to message map; empty means valid.
pub trait ModelValidator: Send + Sync {
    fn validate(&self, model: &str, properties: &Properties) -> BTreeMap<String, String>;
}

/// Per-call field check. May rewrite the value and may report a message.
pub trait FieldCheck: Send + Sync {
    fn check(&self, model: &str, field: &Field, value: Value) -> (Value, Option<String>);
}

/// Supplies values for fields declared with `value: true`.
pub trait ComputedValue: Send + Sync {
    fn value(&self, model: &str, pathname: &str, properties: &Properties) -> Result<Value>;
}

/// Supplies defaults for fields with neither a static default nor a generator.
pub trait DefaultValue: Send + Sync {
    fn default_value(&self, model: &str, field: &Field, properties: &Properties) -> Option<Value>;
}

/// Field-level encryption. Ciphertext is stored as text.
pub trait Cipher: Send + Sync {
    fn encrypt(&self, text: &str, key_name: &str) -> Result<String>;
    fn decrypt(&self, text: &str) -> Result<String>;
}

/// ID generation for `generate` fields.
pub trait IdGenerator: Send + Sync {
    /// Identifier for `generate: true`
    fn generate(&self) -> String {
        self.ulid()
    }

    fn uuid(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }

    fn ulid(&self) -> String {
        ulid::Ulid::new().to_string()
    }
}

/// ULID for `generate: true`, plus uuid v4 and ulid strategies.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultIdGenerator;

impl IdGenerator for DefaultIdGenerator {}
