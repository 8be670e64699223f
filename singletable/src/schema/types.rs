use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Top-level table schema: the indexes shared by every model and the field
/// maps of each model stored in the table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaDefinition {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub indexes: BTreeMap<String, IndexDefinition>,
    #[serde(default)]
    pub models: BTreeMap<String, BTreeMap<String, FieldDefinition>>,
    #[serde(default)]
    pub params: TableParams,
}

/// Definition of the primary index or a secondary index
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexDefinition {
    pub hash: String,
    #[serde(default)]
    pub sort: Option<String>,
    #[serde(default)]
    pub project: Option<Projection>,
    /// Items from this index are key-only and must be re-read from the primary index
    #[serde(default)]
    pub follow: bool,
}

/// Attributes projected into a secondary index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Projection {
    Named(ProjectionKind),
    Attributes(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectionKind {
    All,
    Keys,
}

/// Table-wide parameters applied to every model
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TableParams {
    pub type_field: String,
    pub created_field: String,
    pub updated_field: String,
    pub timestamps: Timestamps,
    pub iso_dates: bool,
    pub nulls: bool,
    pub generic: bool,
    pub hidden: Option<bool>,
    pub warn: bool,
}

impl Default for TableParams {
    fn default() -> Self {
        TableParams {
            type_field: "_type".to_string(),
            created_field: "created".to_string(),
            updated_field: "updated".to_string(),
            timestamps: Timestamps::Enabled(false),
            iso_dates: false,
            nulls: false,
            generic: false,
            hidden: None,
            warn: true,
        }
    }
}

/// Automatic created/updated timestamp fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Timestamps {
    Enabled(bool),
    Only(TimestampKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampKind {
    Create,
    Update,
}

impl Default for Timestamps {
    fn default() -> Self {
        Timestamps::Enabled(false)
    }
}

impl Timestamps {
    pub fn on_create(&self) -> bool {
        matches!(self, Timestamps::Enabled(true) | Timestamps::Only(TimestampKind::Create))
    }

    pub fn on_update(&self) -> bool {
        matches!(self, Timestamps::Enabled(true) | Timestamps::Only(TimestampKind::Update))
    }
}

/// Definition of a single field in a model
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FieldDefinition {
    #[serde(rename = "type", default)]
    pub field_type: Option<FieldType>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub hidden: Option<bool>,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub nulls: Option<bool>,
    #[serde(default)]
    pub default: Option<serde_json::Value>,
    #[serde(default)]
    pub generate: Option<Generate>,
    #[serde(default)]
    pub value: Option<ValueSource>,
    /// A regular expression, optionally in `/pattern/flags` form
    #[serde(default)]
    pub validate: Option<String>,
    #[serde(rename = "enum", default)]
    pub enum_values: Option<Vec<String>>,
    #[serde(default)]
    pub crypt: bool,
    #[serde(default)]
    pub iso_dates: Option<bool>,
    #[serde(default)]
    pub ttl: bool,
    /// Template scoping the uniqueness of a unique field
    #[serde(default)]
    pub scope: Option<String>,
    /// Target attribute, or `attribute.sub` to pack into a map attribute
    #[serde(default)]
    pub map: Option<String>,
    #[serde(default)]
    pub schema: Option<BTreeMap<String, FieldDefinition>>,
}

impl FieldDefinition {
    pub fn of(field_type: FieldType) -> Self {
        FieldDefinition {
            field_type: Some(field_type),
            ..Default::default()
        }
    }
}

/// Field type enumeration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Date,
    #[serde(alias = "buffer", alias = "arraybuffer")]
    Binary,
    Array,
    Object,
    Set,
    #[serde(untagged)]
    Custom(std::string::String),
}

impl FieldType {
    /// Resolve a declared type name case-insensitively. Unknown names stay `Custom`.
    pub fn resolve(&self) -> FieldType {
        match self {
            FieldType::Custom(name) => match name.to_lowercase().as_str() {
                "string" => FieldType::String,
                "number" => FieldType::Number,
                "boolean" => FieldType::Boolean,
                "date" => FieldType::Date,
                "binary" | "buffer" | "arraybuffer" => FieldType::Binary,
                "array" => FieldType::Array,
                "object" => FieldType::Object,
                "set" => FieldType::Set,
                _ => self.clone(),
            },
            other => other.clone(),
        }
    }
}

/// ID generation for a field: `true` for the table's default generator, or a named strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Generate {
    Enabled(bool),
    Strategy(AutoIdStrategy),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoIdStrategy {
    Ulid,
    Uuid,
}

/// Source of a derived field value: a template string, or `true` for the
/// table's computed-value hook
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ValueSource {
    Computed(bool),
    Template(String),
}
