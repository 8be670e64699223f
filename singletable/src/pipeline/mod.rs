//! Property pipeline: per-operation preparation of caller properties into a
//! record ready for the command builder, and the mirror read transforms.

pub mod coerce;

use crate::error::{Result, SingleTableError};
use crate::expression::Op;
use crate::hooks::Direction;
use crate::params::Params;
use crate::schema::{Block, Field, FieldType, FieldValue, Generate, Index, ModelSchema};
use crate::schema::AutoIdStrategy;
use crate::table::Table;
use crate::template::Template;
use crate::validation::validate_properties;
use crate::value::{iso_string, properties_to_json, Condition, Item, Properties, Value};
use coerce::Coercion;
use std::collections::BTreeSet;

/// Operation and index for one block pass.
#[derive(Clone, Copy)]
struct Pass<'p> {
    op: Op,
    index: &'p Index,
    top: bool,
}

/// The pipeline bound to one model of one table.
#[derive(Clone, Copy)]
pub(crate) struct Pipeline<'a> {
    pub table: &'a Table,
    pub model: &'a ModelSchema,
}

impl<'a> Pipeline<'a> {
    pub fn new(table: &'a Table, model: &'a ModelSchema) -> Self {
        Pipeline { table, model }
    }

    fn coercion<'p>(&'p self, params: &'p Params<'_>) -> Coercion<'p> {
        Coercion {
            model: &self.model.name,
            transform: params.transform.as_ref(),
            cipher: self.table.hooks().cipher.as_ref(),
        }
    }

    pub fn select_index(&self, params: &Params<'_>) -> Result<&'a Index> {
        let indexes = self.table.indexes();
        match params.index.as_deref() {
            Some(name) => indexes.get(name).ok_or_else(|| SingleTableError::Missing {
                message: format!("Cannot find index {name}"),
                context: serde_json::json!({ "index": name }),
            }),
            None => Ok(indexes.primary()),
        }
    }

    /// Secondary indexes only support range operations. Point operations on
    /// them degrade to a find.
    pub fn needs_fallback(op: Op, index: &Index) -> bool {
        !index.is_primary() && !op.is_range()
    }

    /// Prepare caller properties for `op`. Returns the caller properties
    /// unchanged apart from context, defaults and templates when the request
    /// must fall back to a find (`params.fallback` is then set).
    pub fn prepare(&self, op: Op, mut properties: Properties, params: &mut Params<'_>) -> Result<Properties> {
        params.fallback = false;
        let index = self.select_index(params)?;
        if Self::needs_fallback(op, index) {
            params.fallback = true;
            return Ok(properties);
        }
        let context = params.context.clone().unwrap_or_else(|| self.table.context());
        let mut rec = Properties::new();
        let pass = Pass {
            op,
            index,
            top: true,
        };
        self.collect(pass, &self.model.block, &mut properties, params, &context, &mut rec)?;
        if params.fallback {
            return Ok(properties);
        }

        if op != Op::Scan && self.hash_value(&rec, index, params).is_none() {
            log::error!(
                "Empty hash key for {op} on \"{}\": {}",
                self.model.name,
                properties_to_json(&properties)
            );
            return Err(SingleTableError::Missing {
                message: "Empty hash key. Check hash key and any value template variable references."
                    .to_string(),
                context: properties_to_json(&properties),
            });
        }

        if op.is_write() {
            if let Some(transform) = &self.table.hooks().transform {
                rec = transform.transform(&self.model.name, Direction::Write, rec, &properties)?;
            }
        }
        Ok(rec)
    }

    fn collect(
        &self,
        pass: Pass<'_>,
        block: &Block,
        properties: &mut Properties,
        params: &mut Params<'_>,
        context: &Properties,
        rec: &mut Properties,
    ) -> Result<()> {
        let mut nested = Vec::new();
        if self.model.nested && !pass.op.keys_only() {
            let creating = pass.op == Op::Put || (pass.op == Op::Update && params.may_create());
            for field in block.fields.values() {
                let Some(child) = &field.block else {
                    continue;
                };
                let mut value = properties.get(&field.name).cloned();
                let mut seeded = false;
                if creating && value.as_ref().map_or(true, Value::is_null) {
                    value = field.default.clone();
                    if value.is_none() {
                        // Seeded so the child defaults apply
                        value = Some(Value::Object(Properties::new()));
                        seeded = !field.required;
                    }
                }
                if let Some(Value::Object(mut obj)) = value {
                    let child_context = context
                        .get(&field.name)
                        .and_then(Value::as_object)
                        .cloned()
                        .unwrap_or_default();
                    let mut child_rec = Properties::new();
                    let child_pass = Pass { top: false, ..pass };
                    self.collect(child_pass, child, &mut obj, params, &child_context, &mut child_rec)?;
                    if seeded && child_rec.is_empty() {
                        continue;
                    }
                    properties.insert(field.name.clone(), Value::Object(obj));
                    nested.push((field.name.clone(), child_rec));
                }
            }
        }

        if pass.top {
            tunnel(properties, params);
        }
        self.add_context(pass, block, properties, context);
        self.set_defaults(pass.op, block, properties, params);
        self.run_templates(pass.op, pass.index, block, properties)?;
        self.convert_nulls(pass.op, block, properties, params);
        validate_properties(
            &self.model.name,
            pass.op,
            &block.fields,
            properties,
            self.table.hooks().validate.as_ref(),
            params.validate.as_ref(),
        )?;
        if !self.select(pass, block, properties, params, rec)? {
            return Ok(());
        }
        for (name, child_rec) in nested {
            rec.insert(name, Value::Object(child_rec));
        }
        self.transform(pass.op, block, properties, params, rec)
    }

    /// Context overrides caller properties. Key-only operations take context
    /// only for the key slots and the fields their templates read.
    fn add_context(&self, pass: Pass<'_>, block: &Block, properties: &mut Properties, context: &Properties) {
        let relevant = pass
            .op
            .keys_only()
            .then(|| key_relevant(pass.index, block));
        for field in block.fields.values() {
            let eligible = relevant
                .as_ref()
                .map_or(true, |names| names.contains(field.name.as_str()));
            if !eligible {
                continue;
            }
            if let Some(value) = context.get(&field.name) {
                properties.insert(field.name.clone(), value.clone());
            }
        }
        if pass.top && !self.model.generic {
            properties.insert(
                self.model.type_field.clone(),
                Value::String(self.model.name.clone()),
            );
        }
    }

    /// Static defaults and generated ids, on create-like operations only.
    fn set_defaults(&self, op: Op, block: &Block, properties: &mut Properties, params: &Params<'_>) {
        let creating = matches!(op, Op::Put | Op::Init) || (op == Op::Update && params.may_create());
        if !creating {
            return;
        }
        let hooks = self.table.hooks();
        for field in block.fields.values() {
            if let Some(child) = &field.block {
                // Write operations default nested blocks while collecting them
                if op == Op::Init {
                    let entry = properties
                        .entry(field.name.clone())
                        .or_insert_with(|| Value::Object(Properties::new()));
                    if let Some(obj) = entry.as_object_mut() {
                        self.set_defaults(op, child, obj, params);
                    }
                }
                continue;
            }
            if properties.contains_key(&field.name) || field.value.is_some() {
                continue;
            }
            let value = if let Some(default) = &field.default {
                Some(default.clone())
            } else if op == Op::Init {
                field.generate.is_none().then_some(Value::Null)
            } else {
                match field.generate {
                    Some(Generate::Enabled(true)) => Some(Value::String(hooks.ids.generate())),
                    Some(Generate::Strategy(AutoIdStrategy::Uuid)) => Some(Value::String(hooks.ids.uuid())),
                    Some(Generate::Strategy(AutoIdStrategy::Ulid)) => Some(Value::String(hooks.ids.ulid())),
                    _ => hooks
                        .default
                        .as_ref()
                        .and_then(|h| h.default_value(&self.model.name, field, properties)),
                }
            };
            if let Some(value) = value {
                properties.insert(field.name.clone(), value);
            }
        }
    }

    /// Evaluate value templates in dependency order.
    pub fn run_templates(&self, op: Op, index: &Index, block: &Block, properties: &mut Properties) -> Result<()> {
        for field in block.ordered() {
            if field.is_indexed && !matches!(op, Op::Put | Op::Update) && !index.is_key(&field.attribute.name) {
                // Index not used by this call
                continue;
            }
            match &field.value {
                Some(FieldValue::Computed) => {
                    if let Some(hook) = &self.table.hooks().value {
                        let value = hook.value(&self.model.name, &field.pathname, properties)?;
                        properties.insert(field.name.clone(), value);
                    }
                }
                Some(FieldValue::Template(template)) => {
                    if !properties.contains_key(&field.name) {
                        if let Some(value) = self.run_template(op, Some(index), field, properties, template)? {
                            properties.insert(field.name.clone(), value);
                        }
                    }
                }
                None => {}
            }
        }
        Ok(())
    }

    /// Expand one template. Without an index the text is returned even when
    /// variables remain unresolved.
    pub fn run_template(
        &self,
        op: Op,
        index: Option<&Index>,
        field: &Field,
        properties: &Properties,
        template: &Template,
    ) -> Result<Option<Value>> {
        let rendered = template.render(&field.pathname, properties, &|date| coerce::encode_date(field, date))?;
        Ok(match index {
            None => Some(Value::String(rendered.text)),
            Some(index) => rendered.finish(op == Op::Find && index.is_sort(&field.attribute.name)),
        })
    }

    fn convert_nulls(&self, op: Op, block: &Block, properties: &mut Properties, params: &mut Params<'_>) {
        let names: Vec<String> = properties.keys().cloned().collect();
        for name in names {
            let Some(field) = block.fields.get(&name) else {
                continue;
            };
            match properties.get(&name) {
                Some(Value::Null) if !field.nulls => {
                    if field.required && matches!(op, Op::Put | Op::Update) {
                        // Left for validation to report
                        continue;
                    }
                    params.remove.push(field.pathname.clone());
                    properties.remove(&name);
                }
                Some(Value::Object(_) | Value::Array(_))
                    if matches!(field.field_type, FieldType::Object | FieldType::Array) =>
                {
                    if let Some(value) = properties.remove(&name) {
                        properties.insert(name, remove_nulls(field, value));
                    }
                }
                _ => {}
            }
        }
    }

    /// Copy the properties that belong in the physical record. Returns false
    /// when a missing sort key turns the call into a fallback find.
    fn select(
        &self,
        pass: Pass<'_>,
        block: &Block,
        properties: &Properties,
        params: &mut Params<'_>,
        rec: &mut Properties,
    ) -> Result<bool> {
        let project = self.table.indexes().projection(pass.index);
        for (name, field) in &block.fields {
            if field.block.is_some() {
                continue;
            }
            if pass.top {
                let attribute = &field.attribute.name;
                let missing = properties.get(name).map_or(true, Value::is_null);
                if missing && pass.index.is_sort(attribute) && params.high == Some(true) && pass.op.keys_only() {
                    if pass.op == Op::Delete && !params.many {
                        return Err(SingleTableError::Missing {
                            message: "Missing sort key".to_string(),
                            context: properties_to_json(properties),
                        });
                    }
                    params.fallback = true;
                    return Ok(false);
                }
                let omit = if pass.op.keys_only() && !pass.index.is_key(attribute) && !self.model.has_unique_fields {
                    // Unique removal needs the other properties for sentinel keys
                    true
                } else if project.as_ref().map_or(false, |p| !p.contains(attribute)) {
                    true
                } else {
                    *name == self.model.type_field && !pass.index.is_key(name) && pass.op == Op::Find
                };
                if omit {
                    continue;
                }
            }
            if let Some(value) = properties.get(name) {
                rec.insert(name.clone(), value.clone());
            }
        }
        if pass.top {
            self.add_projected(pass.op, properties, params, project.as_deref(), rec);
        }
        Ok(true)
    }

    /// Generic models pass unmodeled properties through when projected.
    fn add_projected(
        &self,
        op: Op,
        properties: &Properties,
        params: &Params<'_>,
        project: Option<&[String]>,
        rec: &mut Properties,
    ) {
        let generic = params.generic.unwrap_or(self.model.generic);
        if !generic || op.keys_only() {
            return;
        }
        for (name, value) in properties {
            if project.map_or(false, |p| !p.contains(name)) || rec.contains_key(name) {
                continue;
            }
            let value = match value {
                Value::Date(date) if self.model.iso_dates => Value::String(iso_string(date)),
                Value::Date(date) => Value::Number(date.timestamp_millis() as f64),
                other => other.clone(),
            };
            rec.insert(name.clone(), value);
        }
    }

    fn transform(
        &self,
        op: Op,
        block: &Block,
        properties: &Properties,
        params: &Params<'_>,
        rec: &mut Properties,
    ) -> Result<()> {
        let coercion = self.coercion(params);
        for (name, field) in &block.fields {
            if field.block.is_some() {
                continue;
            }
            if let Some(value) = rec.remove(name) {
                rec.insert(name.clone(), coercion.write(op, field, value, properties)?);
            }
        }
        Ok(())
    }

    fn hash_value<'r>(&self, rec: &'r Properties, index: &Index, params: &Params<'_>) -> Option<&'r Value> {
        let generic = params.generic.unwrap_or(self.model.generic);
        let value = if generic {
            rec.get(&index.hash)
        } else {
            let field = self
                .model
                .block
                .fields
                .values()
                .find(|f| f.attribute.name == index.hash)?;
            rec.get(&field.name)
        };
        value.filter(|v| !v.is_null())
    }

    /// The properties that locate an item on `index`: its key fields and the
    /// fields their templates read.
    pub fn key_properties(&self, index: &Index, properties: &Properties) -> Properties {
        let relevant = key_relevant(index, &self.model.block);
        properties
            .iter()
            .filter(|(name, _)| relevant.contains(name.as_str()))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }

    /// A fully shaped property set: defaults, templates, and nulls elsewhere.
    pub fn init(&self, mut properties: Properties, params: &Params<'_>) -> Result<Properties> {
        let block = &self.model.block;
        self.set_defaults(Op::Init, block, &mut properties, params);
        self.run_templates(Op::Put, self.table.indexes().primary(), block, &mut properties)?;
        for name in block.fields.keys() {
            properties.entry(name.clone()).or_insert(Value::Null);
        }
        Ok(properties)
    }

    /// Map a stored item (or, for put, the prepared record) back to
    /// application properties.
    pub fn read_item(&self, op: Op, raw: &Item, properties: &Properties, params: &Params<'_>) -> Result<Properties> {
        let mut rec = self.read_block(op, raw, properties, params, &self.model.block)?;
        if self.model.generic {
            for (name, value) in raw {
                rec.entry(name.clone()).or_insert_with(|| value.clone());
            }
        }
        if params.hidden == Some(true) && !self.model.generic && !rec.contains_key(&self.model.type_field) {
            rec.insert(
                self.model.type_field.clone(),
                Value::String(self.model.name.clone()),
            );
        }
        if let Some(transform) = &self.table.hooks().transform {
            rec = transform.transform(&self.model.name, Direction::Read, rec, properties)?;
        }
        Ok(rec)
    }

    fn read_block(
        &self,
        op: Op,
        raw: &Properties,
        properties: &Properties,
        params: &Params<'_>,
        block: &Block,
    ) -> Result<Properties> {
        let coercion = self.coercion(params);
        let mut rec = Properties::new();
        for (name, field) in &block.fields {
            // Follow needs hidden keys to resolve the primary item
            if field.hidden && params.hidden != Some(true) && params.follow != Some(true) {
                continue;
            }
            let (attribute, sub) = if op == Op::Put {
                (name.as_str(), None)
            } else {
                (field.attribute.name.as_str(), field.attribute.sub.as_deref())
            };
            let value = raw.get(attribute).and_then(|v| match sub {
                Some(sub) => v.as_object().and_then(|m| m.get(sub)),
                None => Some(v),
            });
            let Some(value) = value.cloned() else {
                if let Some(default) = &field.default {
                    rec.insert(name.clone(), default.clone());
                } else if field.required && params.follow != Some(true) {
                    log::warn!(
                        "Required field \"{name}\" in model \"{}\" not defined in table item",
                        self.model.name
                    );
                }
                continue;
            };
            let value = if field.crypt {
                coercion.decrypt(field, value)?
            } else {
                value
            };
            match (&field.block, value) {
                (Some(child), Value::Object(obj)) => {
                    let child_properties = properties
                        .get(name)
                        .and_then(Value::as_object)
                        .cloned()
                        .unwrap_or_default();
                    let nested = self.read_block(op, &obj, &child_properties, params, child)?;
                    rec.insert(name.clone(), Value::Object(nested));
                }
                (_, value) => {
                    rec.insert(name.clone(), coercion.read(field, value, properties)?);
                }
            }
        }
        Ok(rec)
    }
}

/// Merge operator hints into the properties as conditions.
fn tunnel(properties: &mut Properties, params: &Params<'_>) {
    for (op, settings) in &params.tunnel {
        for (name, operand) in settings {
            properties.insert(name.clone(), Value::Condition(Condition::new(*op, operand.clone())));
        }
    }
}

/// Names of the fields occupying `index` key slots, plus every field their
/// templates read, transitively.
fn key_relevant<'b>(index: &Index, block: &'b Block) -> BTreeSet<&'b str> {
    let mut relevant: BTreeSet<&str> = block
        .fields
        .values()
        .filter(|f| index.is_key(&f.attribute.name))
        .map(|f| f.name.as_str())
        .collect();
    let mut pending: Vec<&str> = relevant.iter().copied().collect();
    while let Some(name) = pending.pop() {
        let Some(template) = block.fields.get(name).and_then(Field::template) else {
            continue;
        };
        for path in template.variables() {
            let head = path.split('.').next().unwrap_or(path);
            if let Some((key, _)) = block.fields.get_key_value(head) {
                if relevant.insert(key.as_str()) {
                    pending.push(key.as_str());
                }
            }
        }
    }
    relevant
}

/// Strip nulls and empty strings from nested values under the field's policy.
fn remove_nulls(field: &Field, value: Value) -> Value {
    let clean = |member: Value| -> Option<Value> {
        let member = match member {
            Value::String(s) if s.is_empty() => Value::Null,
            other => other,
        };
        match member {
            Value::Null if !field.nulls => None,
            nested @ (Value::Object(_) | Value::Array(_)) => Some(remove_nulls(field, nested)),
            other => Some(other),
        }
    };
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter_map(|(k, v)| clean(v).map(|v| (k, v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().filter_map(clean).collect()),
        other => other,
    }
}
