//! Schema compilation: turns declarative field maps into the field tables,
//! attribute mappings and dependency orders the pipeline executes against.

use super::types::{
    FieldDefinition, FieldType, Generate, IndexDefinition, Projection, ProjectionKind,
    TableParams, Timestamps, ValueSource,
};
use crate::error::{Result, SingleTableError};
use crate::template::Template;
use crate::value::Value;
use regex::Regex;
use std::collections::{BTreeMap, HashSet};

pub const PRIMARY: &str = "primary";

/// A resolved index: key attribute names, projection and follow behaviour.
#[derive(Debug, Clone, PartialEq)]
pub struct Index {
    pub name: String,
    pub hash: String,
    pub sort: Option<String>,
    pub project: Option<Projection>,
    pub follow: bool,
}

impl Index {
    fn from_definition(name: &str, def: &IndexDefinition) -> Self {
        Index {
            name: name.to_string(),
            hash: def.hash.clone(),
            sort: def.sort.clone(),
            project: def.project.clone(),
            follow: def.follow,
        }
    }

    pub fn is_primary(&self) -> bool {
        self.name == PRIMARY
    }

    /// Whether `attribute` occupies one of this index's key slots.
    pub fn is_key(&self, attribute: &str) -> bool {
        self.hash == attribute || self.sort.as_deref() == Some(attribute)
    }

    pub fn is_sort(&self, attribute: &str) -> bool {
        self.sort.as_deref() == Some(attribute)
    }
}

/// The table's primary index and its secondary indexes.
#[derive(Debug, Clone)]
pub struct Indexes {
    primary: Index,
    secondary: BTreeMap<String, Index>,
}

impl Indexes {
    pub fn compile(definitions: &BTreeMap<String, IndexDefinition>) -> Result<Self> {
        let primary = definitions.get(PRIMARY).ok_or_else(|| {
            SingleTableError::Schema(
                "Indexes must be defined on the table before creating models".to_string(),
            )
        })?;
        let secondary = definitions
            .iter()
            .filter(|(name, _)| name.as_str() != PRIMARY)
            .map(|(name, def)| (name.clone(), Index::from_definition(name, def)))
            .collect();
        Ok(Indexes {
            primary: Index::from_definition(PRIMARY, primary),
            secondary,
        })
    }

    pub fn primary(&self) -> &Index {
        &self.primary
    }

    pub fn get(&self, name: &str) -> Option<&Index> {
        if name == PRIMARY {
            Some(&self.primary)
        } else {
            self.secondary.get(name)
        }
    }

    /// Attributes projected by `index`, or `None` when every attribute is.
    /// `keys` expands to the primary and the index key attributes.
    pub fn projection(&self, index: &Index) -> Option<Vec<String>> {
        match &index.project {
            None | Some(Projection::Named(ProjectionKind::All)) => None,
            Some(Projection::Named(ProjectionKind::Keys)) => {
                let mut keys = vec![self.primary.hash.clone()];
                keys.extend(self.primary.sort.clone());
                keys.push(index.hash.clone());
                keys.extend(index.sort.clone());
                Some(keys)
            }
            Some(Projection::Attributes(list)) => Some(list.clone()),
        }
    }

    /// Map each hash/sort attribute to the index using it. The primary index
    /// wins when an attribute serves several indexes.
    pub fn key_attributes(&self) -> BTreeMap<String, String> {
        let mut properties = BTreeMap::new();
        for index in std::iter::once(&self.primary).chain(self.secondary.values()) {
            for attribute in std::iter::once(&index.hash).chain(index.sort.iter()) {
                if properties.get(attribute).map(String::as_str) != Some(PRIMARY) {
                    properties.insert(attribute.clone(), index.name.clone());
                }
            }
        }
        properties
    }
}

/// Physical target of a field: an attribute, optionally packed under a sub-key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name: String,
    pub sub: Option<String>,
}

/// How a field derives its value.
#[derive(Debug, Clone)]
pub enum FieldValue {
    Template(Template),
    /// Supplied by the table's computed-value hook
    Computed,
}

/// A compiled schema field.
#[derive(Debug, Clone)]
pub struct Field {
    pub name: String,
    pub pathname: String,
    pub field_type: FieldType,
    pub attribute: Attribute,
    pub required: bool,
    pub hidden: bool,
    pub unique: bool,
    pub nulls: bool,
    pub default: Option<Value>,
    pub generate: Option<Generate>,
    pub value: Option<FieldValue>,
    pub validate: Option<Regex>,
    pub enum_values: Option<Vec<String>>,
    pub crypt: bool,
    pub iso_dates: bool,
    pub ttl: bool,
    pub scope: Option<Template>,
    pub is_indexed: bool,
    pub block: Option<Block>,
}

impl Field {
    pub fn template(&self) -> Option<&Template> {
        match &self.value {
            Some(FieldValue::Template(t)) => Some(t),
            _ => None,
        }
    }
}

/// A field table plus the order in which its fields must be evaluated.
#[derive(Debug, Clone, Default)]
pub struct Block {
    pub fields: BTreeMap<String, Field>,
    /// Every field name exactly once, templates after the fields they reference
    pub deps: Vec<String>,
}

impl Block {
    pub fn ordered(&self) -> impl Iterator<Item = &Field> {
        self.deps.iter().filter_map(|name| self.fields.get(name))
    }
}

/// Per-model overrides of the table parameters.
#[derive(Debug, Clone, Default)]
pub struct ModelOptions {
    pub generic: Option<bool>,
    pub timestamps: Option<Timestamps>,
    pub type_field: Option<String>,
}

/// A compiled model: immutable once built.
#[derive(Debug, Clone)]
pub struct ModelSchema {
    pub name: String,
    pub block: Block,
    /// Attribute names occupying the primary hash/sort slots
    pub hash: Option<String>,
    pub sort: Option<String>,
    pub has_unique_fields: bool,
    /// Attribute name to the sub-keys packed into it (`None` for a plain mapping)
    pub mappings: BTreeMap<String, Vec<Option<String>>>,
    pub generic: bool,
    pub nested: bool,
    pub nulls: bool,
    pub iso_dates: bool,
    pub timestamps: Timestamps,
    pub type_field: String,
    pub created_field: String,
    pub updated_field: String,
}

impl ModelSchema {
    pub fn compile(
        name: &str,
        fields: &BTreeMap<String, FieldDefinition>,
        indexes: &Indexes,
        params: &TableParams,
        options: &ModelOptions,
    ) -> Result<Self> {
        if name.is_empty() {
            return Err(SingleTableError::Schema("Missing name of model".to_string()));
        }
        let mut model = ModelSchema {
            name: name.to_string(),
            block: Block::default(),
            hash: None,
            sort: None,
            has_unique_fields: false,
            mappings: BTreeMap::new(),
            generic: options.generic.unwrap_or(params.generic),
            nested: false,
            nulls: params.nulls,
            iso_dates: params.iso_dates,
            timestamps: options.timestamps.unwrap_or(params.timestamps),
            type_field: options
                .type_field
                .clone()
                .unwrap_or_else(|| params.type_field.clone()),
            created_field: params.created_field.clone(),
            updated_field: params.updated_field.clone(),
        };

        let mut fields = fields.clone();
        if !fields.contains_key(&model.type_field) {
            fields.insert(
                model.type_field.clone(),
                FieldDefinition {
                    field_type: Some(FieldType::String),
                    hidden: Some(true),
                    required: !model.generic,
                    ..Default::default()
                },
            );
        }
        if model.timestamps.on_create() {
            fields
                .entry(model.created_field.clone())
                .or_insert_with(|| FieldDefinition::of(FieldType::Date));
        }
        if model.timestamps.on_update() {
            fields
                .entry(model.updated_field.clone())
                .or_insert_with(|| FieldDefinition::of(FieldType::Date));
        }

        let key_attributes = indexes.key_attributes();
        let mut compiler = Compiler {
            model: &mut model,
            indexes,
            key_attributes: &key_attributes,
            params,
        };
        let (block, mappings) = compiler.compile_block(&fields, "")?;

        let primary = indexes.primary();
        model.has_unique_fields = block.fields.values().any(|f| {
            f.unique && f.attribute.name != primary.hash && !primary.is_sort(&f.attribute.name)
        });
        model.mappings = mappings;
        model.block = block;
        Ok(model)
    }

    /// The top-level field stored in `attribute`.
    pub fn field_for_attribute(&self, attribute: &str) -> Option<&Field> {
        self.block
            .fields
            .values()
            .find(|f| f.attribute.name == attribute)
    }

    /// Unique fields, excluding those occupying primary key slots.
    pub fn unique_fields<'a>(&'a self, primary: &'a Index) -> impl Iterator<Item = &'a Field> {
        self.block.fields.values().filter(move |f| {
            f.unique && f.attribute.name != primary.hash && !primary.is_sort(&f.attribute.name)
        })
    }
}

struct Compiler<'a> {
    model: &'a mut ModelSchema,
    indexes: &'a Indexes,
    key_attributes: &'a BTreeMap<String, String>,
    params: &'a TableParams,
}

impl Compiler<'_> {
    fn compile_block(
        &mut self,
        definitions: &BTreeMap<String, FieldDefinition>,
        prefix: &str,
    ) -> Result<(Block, BTreeMap<String, Vec<Option<String>>>)> {
        let mut block = Block::default();
        let mut map_targets: BTreeMap<String, Vec<Option<String>>> = BTreeMap::new();

        for (name, def) in definitions {
            let pathname = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{prefix}.{name}")
            };
            let field = self.compile_field(name, &pathname, def, prefix, &mut map_targets)?;
            block.fields.insert(name.clone(), field);
        }

        block.deps = order_fields(&block, &self.model.name)?;
        Ok((block, map_targets))
    }

    fn compile_field(
        &mut self,
        name: &str,
        pathname: &str,
        def: &FieldDefinition,
        prefix: &str,
        map_targets: &mut BTreeMap<String, Vec<Option<String>>>,
    ) -> Result<Field> {
        let model_name = self.model.name.clone();
        let field_type = match &def.field_type {
            Some(t) => t.resolve(),
            None => {
                log::error!("Missing type field for {pathname} in model {model_name}");
                FieldType::String
            }
        };
        if let FieldType::Custom(type_name) = &field_type {
            return Err(SingleTableError::Schema(format!(
                "Unknown type \"{type_name}\" for field \"{name}\" in model \"{model_name}\""
            )));
        }

        let attribute = match &def.map {
            Some(to) => match to.split_once('.') {
                Some((att, sub)) => {
                    let targets = map_targets.entry(att.to_string()).or_default();
                    if targets.iter().any(Option::is_none) {
                        return Err(SingleTableError::Schema(format!(
                            "Map already defined as literal for {model_name}.{name}"
                        )));
                    }
                    if targets.iter().any(|t| t.as_deref() == Some(sub)) {
                        return Err(SingleTableError::Schema(format!(
                            "Multiple attributes in {model_name} mapped to the target {to}"
                        )));
                    }
                    targets.push(Some(sub.to_string()));
                    Attribute {
                        name: att.to_string(),
                        sub: Some(sub.to_string()),
                    }
                }
                None => self.plain_target(map_targets, to, &model_name)?,
            },
            None => self.plain_target(map_targets, name, &model_name)?,
        };

        let mut required = def.required;
        let mut is_indexed = false;
        if prefix.is_empty() {
            if let Some(index_name) = self.key_attributes.get(&attribute.name) {
                is_indexed = true;
                if attribute.sub.is_some() {
                    return Err(SingleTableError::Schema(format!(
                        "Cannot map property \"{pathname}\" to a compound attribute \"{model_name}.{pathname}\""
                    )));
                }
                if index_name == PRIMARY {
                    required = true;
                    let primary = self.indexes.primary();
                    if attribute.name == primary.hash {
                        self.model.hash = Some(attribute.name.clone());
                    } else if primary.is_sort(&attribute.name) {
                        self.model.sort = Some(attribute.name.clone());
                    }
                }
            }
        }

        let value = match &def.value {
            Some(ValueSource::Template(t)) => Some(FieldValue::Template(Template::parse(t)?)),
            Some(ValueSource::Computed(true)) => Some(FieldValue::Computed),
            Some(ValueSource::Computed(false)) | None => None,
        };
        // Value template properties are hidden by default
        let hidden = match (def.hidden, &value) {
            (Some(hidden), _) => hidden,
            (None, Some(_)) => self.params.hidden.unwrap_or(true),
            (None, None) => false,
        };

        let block = match &def.schema {
            Some(schema) => match field_type {
                FieldType::Object => {
                    self.model.nested = true;
                    let (child, _) = self.compile_block(schema, pathname)?;
                    Some(child)
                }
                FieldType::Array => {
                    return Err(SingleTableError::Schema(format!(
                        "Array types do not support nested schemas for field \"{name}\" in model \"{model_name}\""
                    )));
                }
                _ => {
                    return Err(SingleTableError::Schema(format!(
                        "Nested schema not supported for \"{field_type:?}\" field \"{name}\" in model \"{model_name}\""
                    )));
                }
            },
            None => None,
        };

        let validate = def
            .validate
            .as_deref()
            .map(|pattern| compile_pattern(pattern, pathname))
            .transpose()?;

        Ok(Field {
            name: name.to_string(),
            pathname: pathname.to_string(),
            field_type,
            attribute,
            required,
            hidden,
            unique: def.unique,
            nulls: def.nulls.unwrap_or(self.model.nulls),
            default: def.default.clone().map(Value::from),
            generate: def.generate,
            value,
            validate,
            enum_values: def.enum_values.clone(),
            crypt: def.crypt,
            iso_dates: def.iso_dates.unwrap_or(self.model.iso_dates),
            ttl: def.ttl,
            scope: def.scope.as_deref().map(Template::parse).transpose()?,
            is_indexed,
            block,
        })
    }

    fn plain_target(
        &self,
        map_targets: &mut BTreeMap<String, Vec<Option<String>>>,
        attribute: &str,
        model_name: &str,
    ) -> Result<Attribute> {
        let targets = map_targets.entry(attribute.to_string()).or_default();
        if !targets.is_empty() {
            return Err(SingleTableError::Schema(format!(
                "Multiple attributes in {model_name} mapped to the target {attribute}"
            )));
        }
        targets.push(None);
        Ok(Attribute {
            name: attribute.to_string(),
            sub: None,
        })
    }
}

/// Compile a validation pattern. `/pattern/flags` carries inline flags.
fn compile_pattern(pattern: &str, pathname: &str) -> Result<Regex> {
    let source = match pattern.rfind('/') {
        Some(end) if pattern.starts_with('/') && end > 0 => {
            let flags: String = pattern[end + 1..]
                .chars()
                .filter(|c| matches!(c, 'i' | 'm' | 's' | 'x'))
                .collect();
            let body = &pattern[1..end];
            if flags.is_empty() {
                body.to_string()
            } else {
                format!("(?{flags}){body}")
            }
        }
        _ => pattern.to_string(),
    };
    Regex::new(&source).map_err(|e| {
        SingleTableError::Schema(format!("Invalid validation pattern for \"{pathname}\": {e}"))
    })
}

/// Post-order walk over template references so that every templated field
/// follows the fields its template reads.
fn order_fields(block: &Block, model_name: &str) -> Result<Vec<String>> {
    let mut deps = Vec::with_capacity(block.fields.len());
    let mut placed = HashSet::new();
    let mut visiting = Vec::new();
    for name in block.fields.keys() {
        visit(block, name, model_name, &mut deps, &mut placed, &mut visiting)?;
    }
    Ok(deps)
}

fn visit(
    block: &Block,
    name: &str,
    model_name: &str,
    deps: &mut Vec<String>,
    placed: &mut HashSet<String>,
    visiting: &mut Vec<String>,
) -> Result<()> {
    if placed.contains(name) {
        return Ok(());
    }
    if visiting.iter().any(|v| v == name) {
        return Err(SingleTableError::Schema(format!(
            "Circular value template reference through \"{name}\" in model \"{model_name}\""
        )));
    }
    let Some(field) = block.fields.get(name) else {
        return Ok(());
    };
    visiting.push(name.to_string());
    if let Some(template) = field.template() {
        for path in template.variables() {
            let head = path.split('.').next().unwrap_or(path);
            if head == name {
                continue;
            }
            if let Some(reference) = block.fields.get(head) {
                if reference.value.is_some() || reference.block.is_some() {
                    visit(block, head, model_name, deps, placed, visiting)?;
                }
            }
        }
    }
    visiting.pop();
    placed.insert(name.to_string());
    deps.push(name.to_string());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::parse_schema_str;
    use pretty_assertions::assert_eq;

    fn compile(yaml: &str, model: &str) -> Result<ModelSchema> {
        let schema = parse_schema_str(yaml).unwrap();
        let indexes = Indexes::compile(&schema.indexes)?;
        ModelSchema::compile(
            model,
            &schema.models[model],
            &indexes,
            &schema.params,
            &ModelOptions::default(),
        )
    }

    const SCHEMA: &str = r#"
indexes:
  primary: { hash: pk, sort: sk }
  gs1: { hash: gs1pk, sort: gs1sk, project: keys }
models:
  Account:
    pk: { type: string, value: "account#${id}" }
    sk: { type: string, value: "account#${name}#${code}" }
    code: { type: string, value: "${zone}:${n:3}" }
    zone: { type: string }
    n: { type: number }
    id: { type: string, generate: ulid }
    name: { type: string, required: true }
    gs1pk: { type: string, value: "account#${email}" }
    gs1sk: { type: string, value: "account#" }
    email: { type: string, unique: true, validate: "/^[^@]+@[^@]+$/i" }
    address:
      type: object
      schema:
        street: { type: string }
        city: { type: string, map: "loc.city" }
        zip: { type: string, map: "loc.zip" }
"#;

    #[test]
    fn test_compile_model() {
        let model = compile(SCHEMA, "Account").unwrap();
        assert_eq!(model.hash.as_deref(), Some("pk"));
        assert_eq!(model.sort.as_deref(), Some("sk"));
        assert!(model.has_unique_fields);
        assert!(model.nested);

        let fields = &model.block.fields;
        assert!(fields["_type"].hidden);
        assert!(fields["_type"].required);
        assert!(fields["pk"].required);
        assert!(fields["pk"].hidden);
        assert!(fields["gs1pk"].is_indexed);
        assert!(!fields["gs1pk"].required);
        assert!(!fields["name"].is_indexed);

        let address = fields["address"].block.as_ref().unwrap();
        assert_eq!(address.fields["city"].pathname, "address.city");
        assert_eq!(
            address.fields["city"].attribute,
            Attribute {
                name: "loc".into(),
                sub: Some("city".into())
            }
        );
    }

    #[test]
    fn test_dependency_order() {
        let model = compile(SCHEMA, "Account").unwrap();
        let deps = &model.block.deps;
        assert_eq!(deps.len(), model.block.fields.len());
        let pos = |name: &str| deps.iter().position(|d| d == name).unwrap();
        assert!(pos("code") < pos("sk"));
    }

    #[test]
    fn test_validation_pattern_flags() {
        let model = compile(SCHEMA, "Account").unwrap();
        let re = model.block.fields["email"].validate.as_ref().unwrap();
        assert!(re.is_match("A@B"));
        assert!(!re.is_match("nope"));
    }

    #[test]
    fn test_duplicate_packed_target_rejected() {
        let yaml = r#"
indexes:
  primary: { hash: pk }
models:
  M:
    pk: { type: string }
    a: { type: string, map: "data.x" }
    b: { type: string, map: "data.x" }
"#;
        let err = compile(yaml, "M").unwrap_err();
        assert!(err.to_string().contains("Multiple attributes"));
    }

    #[test]
    fn test_plain_mapping_collision_rejected() {
        let yaml = r#"
indexes:
  primary: { hash: pk }
models:
  M:
    pk: { type: string }
    a: { type: string, map: "b" }
    b: { type: string }
"#;
        assert!(compile(yaml, "M").is_err());
    }

    #[test]
    fn test_unknown_type_rejected() {
        let yaml = "indexes:\n  primary: { hash: pk }\nmodels:\n  M:\n    pk: { type: widget }\n";
        let err = compile(yaml, "M").unwrap_err();
        assert!(err.to_string().contains("Unknown type"));
    }

    #[test]
    fn test_nested_schema_on_array_rejected() {
        let yaml = r#"
indexes:
  primary: { hash: pk }
models:
  M:
    pk: { type: string }
    list: { type: array, schema: { a: { type: string } } }
"#;
        let err = compile(yaml, "M").unwrap_err();
        assert!(err.to_string().contains("Array types"));
    }

    #[test]
    fn test_compound_indexed_attribute_rejected() {
        let yaml = r#"
indexes:
  primary: { hash: pk }
models:
  M:
    pk: { type: string, map: "pk.x" }
"#;
        let err = compile(yaml, "M").unwrap_err();
        assert!(err.to_string().contains("compound attribute"));
    }

    #[test]
    fn test_template_cycle_rejected() {
        let yaml = r#"
indexes:
  primary: { hash: pk }
models:
  M:
    pk: { type: string, value: "${a}" }
    a: { type: string, value: "${pk}" }
"#;
        let err = compile(yaml, "M").unwrap_err();
        assert!(err.to_string().contains("Circular"));
    }

    #[test]
    fn test_timestamps_and_generic() {
        let yaml = r#"
indexes:
  primary: { hash: pk }
models:
  M:
    pk: { type: string }
params:
  timestamps: create
  generic: true
"#;
        let model = compile(yaml, "M").unwrap();
        assert!(model.block.fields.contains_key("created"));
        assert!(!model.block.fields.contains_key("updated"));
        assert!(!model.block.fields["_type"].required);
    }

    #[test]
    fn test_keys_projection() {
        let schema = parse_schema_str(SCHEMA).unwrap();
        let indexes = Indexes::compile(&schema.indexes).unwrap();
        let gs1 = indexes.get("gs1").unwrap();
        assert_eq!(
            indexes.projection(gs1).unwrap(),
            vec!["pk", "sk", "gs1pk", "gs1sk"]
        );
        assert_eq!(indexes.projection(indexes.primary()), None);
    }
}
