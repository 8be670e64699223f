//! The table: compiled model registry, injected capabilities, ambient context
//! and submission of deferred transaction/batch containers.

pub mod client;

pub use client::{Response, StoreClient, TransactMode};

use crate::error::{Result, SingleTableError};
use crate::expression::{Command, Op};
use crate::hooks::{
    Cipher, ComputedValue, DefaultIdGenerator, DefaultValue, IdGenerator, ItemTransform,
    ModelValidator,
};
use crate::model::Model;
use crate::params::Params;
use crate::pipeline::Pipeline;
use crate::schema::{
    parse_schema, FieldDefinition, FieldType, Indexes, ModelOptions, ModelSchema, SchemaDefinition,
    TableParams, Timestamps,
};
use crate::value::{properties_to_json, Item, Properties, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

/// Model name of the uniqueness sentinel items.
pub const UNIQUE_MODEL: &str = "_Unique";

/// Capabilities injected at table construction.
pub(crate) struct Hooks {
    pub transform: Option<Arc<dyn ItemTransform>>,
    pub value: Option<Arc<dyn ComputedValue>>,
    pub validate: Option<Arc<dyn ModelValidator>>,
    pub default: Option<Arc<dyn DefaultValue>>,
    pub cipher: Option<Arc<dyn Cipher>>,
    pub ids: Arc<dyn IdGenerator>,
}

/// Construction options: the physical table name, its client and hooks.
pub struct TableOptions {
    pub name: String,
    pub client: Arc<dyn StoreClient>,
    pub transform: Option<Arc<dyn ItemTransform>>,
    pub value: Option<Arc<dyn ComputedValue>>,
    pub validate: Option<Arc<dyn ModelValidator>>,
    pub default: Option<Arc<dyn DefaultValue>>,
    pub cipher: Option<Arc<dyn Cipher>>,
    pub ids: Option<Arc<dyn IdGenerator>>,
}

impl TableOptions {
    pub fn new(name: impl Into<String>, client: Arc<dyn StoreClient>) -> Self {
        TableOptions {
            name: name.into(),
            client,
            transform: None,
            value: None,
            validate: None,
            default: None,
            cipher: None,
            ids: None,
        }
    }

    pub fn item_transform(mut self, transform: Arc<dyn ItemTransform>) -> Self {
        self.transform = Some(transform);
        self
    }

    pub fn computed(mut self, value: Arc<dyn ComputedValue>) -> Self {
        self.value = Some(value);
        self
    }

    pub fn validator(mut self, validate: Arc<dyn ModelValidator>) -> Self {
        self.validate = Some(validate);
        self
    }

    pub fn defaults(mut self, default: Arc<dyn DefaultValue>) -> Self {
        self.default = Some(default);
        self
    }

    pub fn cipher(mut self, cipher: Arc<dyn Cipher>) -> Self {
        self.cipher = Some(cipher);
        self
    }

    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }
}

/// One deferred request.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactItem {
    pub model: String,
    pub op: Op,
    pub command: Command,
}

/// Requests accumulated across calls and committed atomically by
/// [`Table::transact`].
#[derive(Debug, Clone, Default)]
pub struct Transaction {
    items: Vec<TransactItem>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, item: TransactItem) {
        self.items.push(item);
    }

    pub fn items(&self) -> &[TransactItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Gets and writes accumulated across calls and submitted by
/// [`Table::batch_get`] and [`Table::batch_write`]. Not atomic.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub gets: Vec<TransactItem>,
    pub writes: Vec<TransactItem>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, item: TransactItem) -> Result<()> {
        match item.op {
            Op::Get => self.gets.push(item),
            Op::Put | Op::Delete => self.writes.push(item),
            op => {
                return Err(SingleTableError::Argument(format!(
                    "Invalid operation \"{op}\" for batch"
                )))
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.gets.len() + self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gets.is_empty() && self.writes.is_empty()
    }
}

/// A single physical table holding every model.
pub struct Table {
    name: String,
    client: Arc<dyn StoreClient>,
    indexes: Indexes,
    params: TableParams,
    models: BTreeMap<String, ModelSchema>,
    hooks: Hooks,
    context: RwLock<Properties>,
}

impl Table {
    /// Compile every model of the schema and register the sentinel model.
    pub fn new(schema: SchemaDefinition, options: TableOptions) -> Result<Self> {
        if options.name.is_empty() {
            return Err(SingleTableError::Argument("Missing table name".to_string()));
        }
        let indexes = Indexes::compile(&schema.indexes)?;
        let mut models = BTreeMap::new();
        for (name, fields) in &schema.models {
            let model = ModelSchema::compile(name, fields, &indexes, &schema.params, &ModelOptions::default())?;
            models.insert(name.clone(), model);
        }

        let primary = indexes.primary();
        let mut sentinel = BTreeMap::new();
        for attribute in std::iter::once(&primary.hash).chain(primary.sort.iter()) {
            sentinel.insert(attribute.clone(), FieldDefinition::of(FieldType::String));
        }
        let options_unique = ModelOptions {
            generic: Some(false),
            timestamps: Some(Timestamps::Enabled(false)),
            type_field: None,
        };
        let unique = ModelSchema::compile(UNIQUE_MODEL, &sentinel, &indexes, &schema.params, &options_unique)?;
        models.insert(UNIQUE_MODEL.to_string(), unique);

        Ok(Table {
            name: options.name,
            client: options.client,
            indexes,
            params: schema.params,
            models,
            hooks: Hooks {
                transform: options.transform,
                value: options.value,
                validate: options.validate,
                default: options.default,
                cipher: options.cipher,
                ids: options.ids.unwrap_or_else(|| Arc::new(DefaultIdGenerator)),
            },
            context: RwLock::new(Properties::new()),
        })
    }

    /// Open a table from a YAML schema file.
    pub fn open(path: &Path, options: TableOptions) -> Result<Self> {
        let schema = parse_schema(path)?;
        Self::new(schema, options)
    }

    /// Register another model after construction.
    pub fn add_model(
        &mut self,
        name: &str,
        fields: &BTreeMap<String, FieldDefinition>,
        options: &ModelOptions,
    ) -> Result<()> {
        if self.models.contains_key(name) {
            return Err(SingleTableError::Argument(format!("Model \"{name}\" already defined")));
        }
        let model = ModelSchema::compile(name, fields, &self.indexes, &self.params, options)?;
        self.models.insert(name.to_string(), model);
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn indexes(&self) -> &Indexes {
        &self.indexes
    }

    pub fn params(&self) -> &TableParams {
        &self.params
    }

    pub(crate) fn hooks(&self) -> &Hooks {
        &self.hooks
    }

    pub(crate) fn client(&self) -> &dyn StoreClient {
        self.client.as_ref()
    }

    /// Names of the application models, without the sentinel model.
    pub fn model_names(&self) -> impl Iterator<Item = &str> {
        self.models
            .keys()
            .map(String::as_str)
            .filter(|name| *name != UNIQUE_MODEL)
    }

    /// Get a model handle
    pub fn model(&self, name: &str) -> Result<Model<'_>> {
        Ok(Model::new(self, self.schema(name)?))
    }

    pub fn schema(&self, name: &str) -> Result<&ModelSchema> {
        self.models
            .get(name)
            .ok_or_else(|| SingleTableError::Argument(format!("Cannot find model \"{name}\"")))
    }

    /// Replace the ambient context, or merge into it.
    pub fn set_context(&self, context: Properties, merge: bool) -> &Self {
        let mut current = self.context.write().unwrap_or_else(PoisonError::into_inner);
        if !merge {
            current.clear();
        }
        current.extend(context);
        self
    }

    pub fn clear_context(&self) -> &Self {
        self.context
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self
    }

    pub fn context(&self) -> Properties {
        self.context
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The model name stored in an item's type attribute.
    pub(crate) fn type_of<'i>(&self, item: &'i Item) -> Option<&'i str> {
        item.get(&self.params.type_field).and_then(Value::as_str)
    }

    /// Read a stored item as `model`. Sentinel items yield `None`.
    pub(crate) fn parse_item(
        &self,
        model: &str,
        op: Op,
        raw: &Item,
        properties: &Properties,
        params: &Params<'_>,
    ) -> Result<Option<Properties>> {
        if model == UNIQUE_MODEL {
            return Ok(None);
        }
        let schema = self.schema(model)?;
        Pipeline::new(self, schema)
            .read_item(op, raw, properties, params)
            .map(Some)
    }

    /// Commit a transaction. Read transactions return the parsed items in
    /// request order.
    pub async fn transact(
        &self,
        mode: TransactMode,
        transaction: Transaction,
        params: &Params<'_>,
    ) -> Result<Vec<Option<Properties>>> {
        if transaction.is_empty() {
            return Ok(Vec::new());
        }
        let commands: Vec<Command> = transaction.items.iter().map(|t| t.command.clone()).collect();
        if params.log == Some(true) {
            log::info!("transact {mode:?} {}", serde_json::to_string(&commands)?);
        } else if params.log.is_none() {
            log::trace!("transact {mode:?} {}", serde_json::to_string(&commands)?);
        }
        let response = self.client.transact(mode, &commands).await?;
        if mode == TransactMode::Write {
            return Ok(Vec::new());
        }
        transaction
            .items
            .iter()
            .zip(response.responses)
            .map(|(entry, raw)| match raw {
                Some(raw) => self.parse_item(&entry.model, Op::Get, &raw, &Properties::new(), params),
                None => Ok(None),
            })
            .collect()
    }

    /// Submit the batched gets. Results are parsed and in request order.
    pub async fn batch_get(&self, batch: Batch, params: &Params<'_>) -> Result<Vec<Option<Properties>>> {
        if batch.gets.is_empty() {
            return Ok(Vec::new());
        }
        let commands: Vec<Command> = batch.gets.iter().map(|t| t.command.clone()).collect();
        let response = self.client.batch_get(&commands).await?;
        batch
            .gets
            .iter()
            .zip(response.responses)
            .map(|(entry, raw)| match raw {
                Some(raw) => self.parse_item(&entry.model, Op::Get, &raw, &Properties::new(), params),
                None => Ok(None),
            })
            .collect()
    }

    /// Submit the batched writes.
    pub async fn batch_write(&self, batch: Batch) -> Result<()> {
        if batch.writes.is_empty() {
            return Ok(());
        }
        let commands: Vec<Command> = batch.writes.iter().map(|t| t.command.clone()).collect();
        self.client.batch_write(&commands).await?;
        Ok(())
    }

    /// Load many items in one round trip, matching returned items back to the
    /// requested keys. Missing items are `None`.
    pub(crate) async fn batch_load(&self, commands: &[Command]) -> Result<Vec<Option<Item>>> {
        if commands.is_empty() {
            return Ok(Vec::new());
        }
        let response = self.client.batch_get(commands).await?;
        log::trace!(
            "batch load {} keys, {} found",
            commands.len(),
            response.items.len()
        );
        Ok(commands
            .iter()
            .map(|command| {
                response
                    .items
                    .iter()
                    .find(|item| command.key.iter().all(|(k, v)| item.get(k) == Some(v)))
                    .cloned()
            })
            .collect())
    }

    /// Parse raw items, grouping them by the model named in their type
    /// attribute. Only `models` are kept; an empty list keeps every model.
    pub fn group_by_type(
        &self,
        items: Vec<Item>,
        models: &[&str],
        params: &Params<'_>,
    ) -> Result<BTreeMap<String, Vec<Properties>>> {
        let mut groups: BTreeMap<String, Vec<Properties>> = BTreeMap::new();
        for item in items {
            let Some(name) = self.type_of(&item) else {
                log::warn!("Item without a type in table \"{}\": {}", self.name, properties_to_json(&item));
                continue;
            };
            if !models.is_empty() && !models.contains(&name) {
                continue;
            }
            if !self.models.contains_key(name) {
                continue;
            }
            let name = name.to_string();
            if let Some(parsed) = self.parse_item(&name, Op::Find, &item, &Properties::new(), params)? {
                groups.entry(name).or_default().push(parsed);
            }
        }
        Ok(groups)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::schema::parse_schema_str;
    use crate::value::to_properties;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::io::Write;

    const SCHEMA: &str = r#"
indexes:
  primary: { hash: pk, sort: sk }
models:
  User:
    pk: { type: string, value: "user#${id}" }
    sk: { type: string, value: "user#" }
    id: { type: string }
    name: { type: string }
"#;

    fn table() -> Table {
        let schema = parse_schema_str(SCHEMA).unwrap();
        let store = Arc::new(MemoryStore::new(&schema.indexes));
        Table::new(schema, TableOptions::new("Test", store)).unwrap()
    }

    #[test]
    fn test_registers_models_and_sentinel() {
        let table = table();
        assert_eq!(table.model_names().collect::<Vec<_>>(), vec!["User"]);
        let unique = table.schema(UNIQUE_MODEL).unwrap();
        assert!(unique.block.fields.contains_key("pk"));
        assert!(unique.block.fields.contains_key("sk"));
        assert!(!unique.timestamps.on_create());
        assert!(table.model("Nope").is_err());
    }

    #[test]
    fn test_missing_table_name() {
        let schema = parse_schema_str(SCHEMA).unwrap();
        let store = Arc::new(MemoryStore::new(&schema.indexes));
        let err = Table::new(schema, TableOptions::new("", store)).err().unwrap();
        assert_eq!(err.code(), "ArgumentError");
    }

    #[test]
    fn test_context_replace_merge_clear() {
        let table = table();
        table.set_context(to_properties(json!({"a": 1})), false);
        table.set_context(to_properties(json!({"b": 2})), true);
        assert_eq!(table.context(), to_properties(json!({"a": 1, "b": 2})));
        table.set_context(to_properties(json!({"c": 3})), false);
        assert_eq!(table.context(), to_properties(json!({"c": 3})));
        table.clear_context();
        assert!(table.context().is_empty());
    }

    #[test]
    fn test_add_model() {
        let mut table = table();
        let fields: BTreeMap<String, FieldDefinition> = serde_yaml::from_str(
            "pk: { type: string }\nsk: { type: string }\ntotal: { type: number }",
        )
        .unwrap();
        table.add_model("Order", &fields, &ModelOptions::default()).unwrap();
        assert!(table.model("Order").is_ok());
        assert!(table.add_model("Order", &fields, &ModelOptions::default()).is_err());
    }

    #[test]
    fn test_open_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SCHEMA.as_bytes()).unwrap();
        let schema = parse_schema_str(SCHEMA).unwrap();
        let store = Arc::new(MemoryStore::new(&schema.indexes));
        let table = Table::open(file.path(), TableOptions::new("Test", store)).unwrap();
        assert!(table.model("User").is_ok());
    }

    #[test]
    fn test_batch_rejects_ranges() {
        let mut batch = Batch::new();
        let item = TransactItem {
            model: "User".into(),
            op: Op::Find,
            command: Command::new(Op::Find, "Test"),
        };
        assert!(batch.push(item).is_err());
        assert!(batch.is_empty());
    }

    #[test]
    fn test_group_by_type_skips_sentinels() {
        let table = table();
        let items = vec![
            to_properties(json!({"pk": "user#1", "sk": "user#", "_type": "User", "id": "1", "name": "A"})),
            to_properties(json!({"pk": "_unique#x", "sk": "_unique#", "_type": "_Unique"})),
        ];
        let groups = table.group_by_type(items, &[], &Params::new()).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups["User"][0]["name"], Value::from("A"));
    }
}
