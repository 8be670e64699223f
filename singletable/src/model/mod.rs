//! Model handles: the public request verbs of one entity type.

mod run;
mod unique;

use crate::error::{Result, SingleTableError};
use crate::expression::{Command, Expression, Op};
use crate::params::{Exists, Params, ReturnValue};
use crate::pipeline::coerce::encode_date;
use crate::pipeline::Pipeline;
use crate::schema::{FieldValue, ModelSchema};
use crate::table::Table;
use crate::value::{Item, Properties, Value};
use chrono::Utc;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::collections::BTreeMap;
use std::ops::Deref;

/// Upper bound on pages fetched by one request unless `max_pages` is set.
pub const SANITY_PAGES: usize = 1000;

/// In-flight primary gets when following a key-only index.
pub const FOLLOW_THREADS: usize = 10;

/// Items returned by a find or scan, with pagination cursors.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub items: Vec<Properties>,
    /// Pass as `Params::next` to continue after this page
    pub next: Option<Item>,
    /// Pass as `Params::prev` to read the page before this one
    pub prev: Option<Item>,
    pub count: Option<u64>,
}

impl Deref for Page {
    type Target = Vec<Properties>;

    fn deref(&self) -> &Vec<Properties> {
        &self.items
    }
}

impl IntoIterator for Page {
    type Item = Properties;
    type IntoIter = std::vec::IntoIter<Properties>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

/// Result of a request verb.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// A point operation; `None` when nothing was found or returned
    Item(Option<Properties>),
    Items(Page),
    /// The command that would have run, for `execute: false`
    Command(Box<Command>),
}

impl Outcome {
    pub fn into_item(self) -> Option<Properties> {
        match self {
            Outcome::Item(item) => item,
            Outcome::Items(page) => page.items.into_iter().next(),
            Outcome::Command(_) => None,
        }
    }

    pub fn into_page(self) -> Page {
        match self {
            Outcome::Items(page) => page,
            Outcome::Item(item) => Page {
                items: item.into_iter().collect(),
                ..Page::default()
            },
            Outcome::Command(_) => Page::default(),
        }
    }

    pub fn into_command(self) -> Option<Command> {
        match self {
            Outcome::Command(command) => Some(*command),
            _ => None,
        }
    }
}

/// A handle to one model of a table.
#[derive(Clone, Copy)]
pub struct Model<'a> {
    table: &'a Table,
    schema: &'a ModelSchema,
}

impl<'a> Model<'a> {
    pub(crate) fn new(table: &'a Table, schema: &'a ModelSchema) -> Self {
        Model { table, schema }
    }

    pub fn name(&self) -> &str {
        &self.schema.name
    }

    pub fn schema(&self) -> &'a ModelSchema {
        self.schema
    }

    pub fn table(&self) -> &'a Table {
        self.table
    }

    fn pipeline(&self) -> Pipeline<'a> {
        Pipeline::new(self.table, self.schema)
    }

    // ── High-level API ──────────────────────────────────────────────

    /// Create an item. Fails if an item with the same key exists.
    pub async fn create(&self, properties: Properties, params: Params<'_>) -> Result<Outcome> {
        let params = params.high_level(Some(Exists::Absent));
        if self.schema.has_unique_fields {
            return unique::create(self, properties, params).await;
        }
        self.put_item(properties, params).await
    }

    /// Get one item. Without a complete primary key, or through a secondary
    /// index, this runs a find and fails if more than one item matches.
    pub async fn get(&self, properties: Properties, params: Params<'_>) -> Result<Outcome> {
        let mut params = params.high_level(None);
        let prepared = self.pipeline().prepare(Op::Get, properties.clone(), &mut params)?;
        if params.fallback {
            params.limit = Some(2);
            let page = match self.find(prepared, params).await? {
                Outcome::Items(page) => page,
                other => return Ok(other),
            };
            if page.len() > 1 {
                return Err(SingleTableError::NonUnique {
                    message: format!(
                        "Get without a sort key returns more than one result for \"{}\"",
                        self.schema.name
                    ),
                    context: crate::value::properties_to_json(&properties),
                });
            }
            return Ok(Outcome::Item(page.items.into_iter().next()));
        }
        self.execute(Op::Get, prepared, properties, params).await
    }

    pub async fn find(&self, properties: Properties, params: Params<'_>) -> Result<Outcome> {
        let params = params.high_level(None);
        self.query_items(properties, params).await
    }

    pub async fn scan(&self, properties: Properties, params: Params<'_>) -> Result<Outcome> {
        let params = params.high_level(None);
        self.scan_items(properties, params).await
    }

    /// Update an existing item.
    pub async fn update(&self, properties: Properties, params: Params<'_>) -> Result<Outcome> {
        let params = params.high_level(Some(Exists::Required));
        self.update_dispatch(properties, params).await
    }

    /// Update an item, creating it if absent.
    pub async fn upsert(&self, properties: Properties, params: Params<'_>) -> Result<Outcome> {
        let params = params.high_level(Some(Exists::Any));
        self.update_dispatch(properties, params).await
    }

    async fn update_dispatch(&self, properties: Properties, params: Params<'_>) -> Result<Outcome> {
        let touches_unique = self
            .schema
            .unique_fields(self.table.indexes().primary())
            .any(|f| properties.contains_key(&f.name) || params.remove.contains(&f.name));
        if touches_unique {
            return unique::update(self, properties, params).await;
        }
        self.update_item(properties, params).await
    }

    /// Remove an item. Without a complete primary key this finds the items
    /// first; more than one match requires `many`.
    pub async fn remove(&self, properties: Properties, params: Params<'_>) -> Result<Outcome> {
        let mut params = params.high_level(None);
        let prepared = self.pipeline().prepare(Op::Delete, properties.clone(), &mut params)?;
        if params.fallback {
            return self.remove_by_find(prepared, params).await;
        }
        if self.schema.has_unique_fields {
            return unique::remove(self, properties, params).await;
        }
        self.execute(Op::Delete, prepared, properties, params).await
    }

    fn remove_by_find<'f>(&'f self, properties: Properties, params: Params<'f>) -> BoxFuture<'f, Result<Outcome>> {
        async move {
            let mut params = params;
            if params.retry {
                return Err(SingleTableError::Argument("Remove cannot retry".to_string()));
            }
            let mut find_params = params.detached();
            find_params.hidden = Some(true);
            find_params.return_value = None;
            let page = match self.find(properties, find_params).await? {
                Outcome::Items(page) => page,
                other => return Ok(other),
            };
            if page.len() > 1 && !params.many {
                return Err(SingleTableError::NonUnique {
                    message: format!(
                        "Removing multiple items from \"{}\". Use many to enable.",
                        self.schema.name
                    ),
                    context: serde_json::json!({ "count": page.len() }),
                });
            }
            let mut removed = Vec::with_capacity(page.len());
            for item in page.items {
                let mut remove_params = params.detached();
                remove_params.retry = true;
                remove_params.index = None;
                remove_params.transaction = params.transaction.as_deref_mut();
                remove_params.batch = params.batch.as_deref_mut();
                if let Some(item) = self.remove(item, remove_params).await?.into_item() {
                    removed.push(item);
                }
            }
            if params.many {
                Ok(Outcome::Items(Page {
                    items: removed,
                    ..Page::default()
                }))
            } else {
                Ok(Outcome::Item(removed.into_iter().next()))
            }
        }
        .boxed()
    }

    /// Get many items by key in one batched round trip. Results follow the
    /// order of `keys`; missing items are `None`.
    pub async fn load(&self, keys: Vec<Properties>, params: Params<'_>) -> Result<Vec<Option<Properties>>> {
        let mut params = params.high_level(None);
        let pipeline = self.pipeline();
        let mut commands = Vec::with_capacity(keys.len());
        let mut requested = Vec::with_capacity(keys.len());
        for properties in keys {
            let prepared = pipeline.prepare(Op::Get, properties.clone(), &mut params)?;
            if params.fallback {
                return Err(SingleTableError::Argument(
                    "Load requires the complete primary key".to_string(),
                ));
            }
            let expression = Expression::new(
                self.schema,
                self.table.indexes(),
                self.table.name(),
                Op::Get,
                prepared,
                &params,
            )?;
            commands.push(expression.into_command());
            requested.push(properties);
        }
        let loaded = self.table.batch_load(&commands).await?;
        loaded
            .into_iter()
            .zip(requested)
            .map(|(raw, properties)| match raw {
                Some(raw) => self.parse_raw(Op::Get, raw, &properties, &params),
                None => Ok(None),
            })
            .collect()
    }

    /// Properties with defaults, templates and nulls for every other field.
    pub fn init(&self, properties: Properties, params: Params<'_>) -> Result<Properties> {
        self.pipeline().init(properties, &params)
    }

    /// Evaluate the value template of field `name` against `properties`.
    /// Unresolved variables are left in the text.
    pub fn template(&self, name: &str, properties: &Properties) -> Result<Option<Value>> {
        let field = self.schema.block.fields.get(name).ok_or_else(|| {
            SingleTableError::Argument(format!("Unknown field \"{name}\" in \"{}\"", self.schema.name))
        })?;
        match &field.value {
            Some(FieldValue::Template(template)) => {
                self.pipeline()
                    .run_template(Op::Put, None, field, properties, template)
            }
            _ => Ok(None),
        }
    }

    /// Find items of several models sharing a partition and group them by
    /// model name. An empty `models` list keeps every model.
    pub async fn fetch(
        &self,
        models: &[&str],
        properties: Properties,
        params: Params<'_>,
    ) -> Result<BTreeMap<String, Vec<Properties>>> {
        let mut params = params.high_level(None);
        params.parse = Some(false);
        let group_params = params.detached();
        let pipeline = self.pipeline();
        let index = pipeline.select_index(&params)?;
        let mut prepared = pipeline.prepare(Op::Find, properties.clone(), &mut params)?;
        // Only the partition key, so every model in it matches
        prepared.retain(|name, _| {
            self.schema
                .block
                .fields
                .get(name)
                .map_or(false, |f| f.attribute.name == index.hash)
        });
        let page = self
            .execute(Op::Find, prepared, properties, params)
            .await?
            .into_page();
        self.table.group_by_type(page.items, models, &group_params)
    }

    // ── Low-level API ───────────────────────────────────────────────

    pub async fn put_item(&self, properties: Properties, params: Params<'_>) -> Result<Outcome> {
        let mut params = params;
        let mut properties = properties;
        self.stamp_put(&mut properties);
        let prepared = self.pipeline().prepare(Op::Put, properties.clone(), &mut params)?;
        self.execute(Op::Put, prepared, properties, params).await
    }

    fn stamp_put(&self, properties: &mut Properties) {
        let now = Utc::now();
        if self.schema.timestamps.on_create() {
            properties
                .entry(self.schema.created_field.clone())
                .or_insert(Value::Date(now));
        }
        if self.schema.timestamps.on_update() {
            properties
                .entry(self.schema.updated_field.clone())
                .or_insert(Value::Date(now));
        }
    }

    pub async fn get_item(&self, properties: Properties, params: Params<'_>) -> Result<Outcome> {
        let mut params = params;
        let prepared = self.pipeline().prepare(Op::Get, properties.clone(), &mut params)?;
        self.execute(Op::Get, prepared, properties, params).await
    }

    pub async fn delete_item(&self, properties: Properties, params: Params<'_>) -> Result<Outcome> {
        let mut params = params;
        let prepared = self.pipeline().prepare(Op::Delete, properties.clone(), &mut params)?;
        self.execute(Op::Delete, prepared, properties, params).await
    }

    pub async fn query_items(&self, properties: Properties, params: Params<'_>) -> Result<Outcome> {
        let mut params = params;
        let prepared = self.pipeline().prepare(Op::Find, properties.clone(), &mut params)?;
        self.execute(Op::Find, prepared, properties, params).await
    }

    pub async fn scan_items(&self, properties: Properties, params: Params<'_>) -> Result<Outcome> {
        let mut params = params;
        let prepared = self.pipeline().prepare(Op::Scan, properties.clone(), &mut params)?;
        self.execute(Op::Scan, prepared, properties, params).await
    }

    /// Update an item. Stamps `updated`, and `created` when the update may
    /// create the item. Through a secondary index the item is found first and
    /// updated by its primary key.
    pub fn update_item<'f>(&'f self, properties: Properties, params: Params<'f>) -> BoxFuture<'f, Result<Outcome>> {
        async move {
            let mut properties = properties;
            let mut params = params;
            let now = Utc::now();
            if self.schema.timestamps.on_update() {
                properties.insert(self.schema.updated_field.clone(), Value::Date(now));
            }
            if self.schema.timestamps.on_create() && params.may_create() {
                if let Some(field) = self.schema.block.fields.get(&self.schema.created_field) {
                    params
                        .set_if_not_exists
                        .insert(field.name.clone(), encode_date(field, &now));
                }
            }

            let prepared = self.pipeline().prepare(Op::Update, properties.clone(), &mut params)?;
            if params.fallback {
                return self.update_found(prepared, params).await;
            }

            let deferred = params.transaction.is_some() || params.batch.is_some() || params.execute == Some(false);
            let reread = params.return_value == Some(ReturnValue::Get) && !deferred;
            let mut get_params = params.detached();
            get_params.exists = None;
            get_params.return_value = None;
            get_params.index = None;
            let outcome = self.execute(Op::Update, prepared, properties.clone(), params).await?;
            if reread {
                return self.get(properties, get_params).await;
            }
            Ok(outcome)
        }
        .boxed()
    }

    /// Find the single item matching `properties` on the secondary index and
    /// update it through the primary index.
    async fn update_found(&self, properties: Properties, params: Params<'_>) -> Result<Outcome> {
        let mut params = params;
        let mut find_params = params.detached();
        find_params.hidden = Some(true);
        find_params.parse = Some(true);
        find_params.exists = None;
        find_params.return_value = None;
        find_params.limit = Some(2);
        let index = self.pipeline().select_index(&params)?;
        let lookup = self.pipeline().key_properties(index, &properties);
        let page = match self.find(lookup, find_params).await? {
            Outcome::Items(page) => page,
            other => return Ok(other),
        };
        let found = match page.len() {
            0 => {
                return Err(SingleTableError::NotFound {
                    message: format!("Cannot find item to update in \"{}\"", self.schema.name),
                    context: crate::value::properties_to_json(&properties),
                })
            }
            1 => &page.items[0],
            _ => {
                return Err(SingleTableError::NonUnique {
                    message: format!("Update matches more than one item in \"{}\"", self.schema.name),
                    context: crate::value::properties_to_json(&properties),
                })
            }
        };
        let primary = self.table.indexes().primary();
        let mut properties = properties;
        for field in self.schema.block.fields.values() {
            if primary.is_key(&field.attribute.name) {
                if let Some(value) = found.get(&field.name) {
                    properties.insert(field.name.clone(), value.clone());
                }
            }
        }
        params.index = None;
        self.update_item(properties, params).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{test_table, MemoryStore};
    use crate::params::{Progress, Stats};
    use crate::table::{Batch, Response, StoreClient, TableOptions, TransactMode, Transaction};
    use crate::value::to_properties;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const SCHEMA: &str = r#"
version: "1"
indexes:
  primary: { hash: pk, sort: sk }
  gs1: { hash: gs1pk, sort: gs1sk, project: keys, follow: true }
  gs2: { hash: gs2pk, sort: gs2sk }
models:
  User:
    pk: { type: string, value: "user#${id}" }
    sk: { type: string, value: "user#" }
    id: { type: number, required: true }
    name: { type: string }
    email: { type: string, unique: true }
    note: { type: string }
    status: { type: string, default: active }
    gs2pk: { type: string, value: "email#${email}" }
    gs2sk: { type: string, value: "user#" }
  Order:
    pk: { type: string, value: "user#${userId}" }
    sk: { type: string, value: "order#${day}#${n:4}" }
    userId: { type: number }
    day: { type: string }
    n: { type: number }
    total: { type: number }
    gs1pk: { type: string, value: "orders" }
    gs1sk: { type: string, value: "order#${day}#${n:4}" }
params:
  timestamps: true
"#;

    fn props(value: serde_json::Value) -> Properties {
        to_properties(value)
    }

    fn order(user: i64, day: &str, n: i64, total: i64) -> Properties {
        props(json!({"userId": user, "day": day, "n": n, "total": total}))
    }

    async fn seeded() -> (Table, Arc<MemoryStore>) {
        let (table, store) = test_table(SCHEMA);
        {
            let users = table.model("User").unwrap();
            let orders = table.model("Order").unwrap();
            users
                .create(props(json!({"id": 1, "name": "Ann", "email": "ann@example.com"})), Params::new())
                .await
                .unwrap();
            for (day, n, total) in [("2024-01-01", 1, 10), ("2024-01-01", 2, 20), ("2024-01-02", 1, 30), ("2024-01-02", 2, 40)] {
                orders.create(order(1, day, n, total), Params::new()).await.unwrap();
            }
        }
        (table, store)
    }

    fn totals(items: &[Properties]) -> Vec<f64> {
        items.iter().filter_map(|item| item.get("total").and_then(Value::as_f64)).collect()
    }

    fn sentinels(store: &MemoryStore) -> Vec<String> {
        store
            .items()
            .iter()
            .filter_map(|item| item.get("pk").and_then(Value::as_str))
            .filter(|pk| pk.starts_with("_unique#"))
            .map(str::to_string)
            .collect()
    }

    #[tokio::test]
    async fn test_create_get_update_remove() {
        let (table, _) = test_table(SCHEMA);
        let users = table.model("User").unwrap();

        let created = users
            .create(props(json!({"id": 7, "name": "Bob"})), Params::new())
            .await
            .unwrap()
            .into_item()
            .unwrap();
        assert_eq!(created["name"], Value::from("Bob"));
        assert_eq!(created["status"], Value::from("active"));
        assert!(!created.contains_key("pk"));
        assert!(created.contains_key("created"));

        let found = users.get(props(json!({"id": 7})), Params::new()).await.unwrap().into_item().unwrap();
        assert_eq!(found["id"], Value::from(7));

        let updated = users
            .update(props(json!({"id": 7, "name": "Robert"})), Params::new())
            .await
            .unwrap()
            .into_item()
            .unwrap();
        assert_eq!(updated["name"], Value::from("Robert"));

        let removed = users.remove(props(json!({"id": 7})), Params::new()).await.unwrap().into_item();
        assert!(removed.is_some());
        let gone = users.get(props(json!({"id": 7})), Params::new()).await.unwrap().into_item();
        assert_eq!(gone, None);
    }

    #[tokio::test]
    async fn test_create_existing_item_fails() {
        let (table, _) = seeded().await;
        let orders = table.model("Order").unwrap();
        let err = orders
            .create(order(1, "2024-01-01", 1, 99), Params::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ConditionalCheckFailedException");
    }

    #[tokio::test]
    async fn test_update_missing_item_fails() {
        let (table, _) = test_table(SCHEMA);
        let orders = table.model("Order").unwrap();
        let err = orders
            .update(order(3, "2024-01-01", 1, 5), Params::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ConditionalCheckFailedException");
    }

    #[tokio::test]
    async fn test_get_by_unique_email_through_index() {
        let (table, store) = seeded().await;
        let users = table.model("User").unwrap();

        let user = users
            .get(props(json!({"email": "ann@example.com"})), Params::new().index("gs2"))
            .await
            .unwrap()
            .into_item()
            .unwrap();
        assert_eq!(user["name"], Value::from("Ann"));
        assert_eq!(sentinels(&store), vec!["_unique#User#email#ann@example.com".to_string()]);
    }

    #[tokio::test]
    async fn test_unique_conflict() {
        let (table, _) = seeded().await;
        let users = table.model("User").unwrap();
        let err = users
            .create(props(json!({"id": 2, "email": "ann@example.com"})), Params::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "UniqueError");
        assert!(err.to_string().contains("\"email\""));

        let missing = users.get(props(json!({"id": 2})), Params::new()).await.unwrap().into_item();
        assert_eq!(missing, None);
    }

    #[tokio::test]
    async fn test_concurrent_unique_creates() {
        let (table, _) = test_table(SCHEMA);
        let users = table.model("User").unwrap();
        let (a, b) = tokio::join!(
            users.create(props(json!({"id": 1, "email": "x@example.com"})), Params::new()),
            users.create(props(json!({"id": 2, "email": "x@example.com"})), Params::new()),
        );
        let failures: Vec<_> = [a, b].into_iter().filter_map(|r| r.err()).collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].code(), "UniqueError");
    }

    #[tokio::test]
    async fn test_unique_value_moves_on_update() {
        let (table, store) = seeded().await;
        let users = table.model("User").unwrap();

        let updated = users
            .update(
                props(json!({"id": 1, "email": "ann@new.example.com"})),
                Params::new().returning(ReturnValue::Get),
            )
            .await
            .unwrap()
            .into_item()
            .unwrap();
        assert_eq!(updated["email"], Value::from("ann@new.example.com"));
        assert_eq!(sentinels(&store), vec!["_unique#User#email#ann@new.example.com".to_string()]);

        // The vacated value is free again
        users
            .create(props(json!({"id": 2, "email": "ann@example.com"})), Params::new())
            .await
            .unwrap();
        let err = users
            .update(props(json!({"id": 2, "email": "ann@new.example.com"})), Params::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "UniqueError");
    }

    #[tokio::test]
    async fn test_unique_update_return_none() {
        let (table, _) = seeded().await;
        let users = table.model("User").unwrap();
        let outcome = users
            .update(
                props(json!({"id": 1, "email": "other@example.com"})),
                Params::new().returning(ReturnValue::None),
            )
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Item(None));

        let err = users
            .update(
                props(json!({"id": 1, "email": "third@example.com"})),
                Params::new().returning(ReturnValue::AllNew),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ArgumentError");
    }

    #[tokio::test]
    async fn test_unique_remove_deletes_sentinels() {
        let (table, store) = seeded().await;
        let users = table.model("User").unwrap();
        let removed = users
            .remove(props(json!({"id": 1})), Params::new())
            .await
            .unwrap()
            .into_item()
            .unwrap();
        assert_eq!(removed["email"], Value::from("ann@example.com"));
        assert!(!removed.contains_key("pk"));
        assert!(sentinels(&store).is_empty());
    }

    #[tokio::test]
    async fn test_update_null_removes_attribute() {
        let (table, store) = seeded().await;
        let users = table.model("User").unwrap();
        users
            .update(props(json!({"id": 1, "note": "hello"})), Params::new())
            .await
            .unwrap();
        let updated = users
            .update(props(json!({"id": 1, "note": null})), Params::new())
            .await
            .unwrap()
            .into_item()
            .unwrap();
        assert!(!updated.contains_key("note"));
        let raw = store.items().into_iter().find(|i| i.get("pk") == Some(&Value::from("user#1"))).unwrap();
        assert!(!raw.contains_key("note"));
    }

    #[tokio::test]
    async fn test_find_uses_partial_sort_template() {
        let (table, _) = seeded().await;
        let orders = table.model("Order").unwrap();

        let all = orders.find(props(json!({"userId": 1})), Params::new()).await.unwrap().into_page();
        assert_eq!(totals(&all), vec![10.0, 20.0, 30.0, 40.0]);

        let day = orders
            .find(props(json!({"userId": 1, "day": "2024-01-02"})), Params::new())
            .await
            .unwrap()
            .into_page();
        assert_eq!(totals(&day), vec![30.0, 40.0]);
    }

    #[tokio::test]
    async fn test_find_pages_forward_and_back() {
        let (table, _) = seeded().await;
        let orders = table.model("Order").unwrap();

        let first = orders
            .find(props(json!({"userId": 1})), Params::new().limit(2))
            .await
            .unwrap()
            .into_page();
        assert_eq!(totals(&first), vec![10.0, 20.0]);
        assert!(first.next.is_some());

        let second = orders
            .find(
                props(json!({"userId": 1})),
                Params {
                    next: first.next.clone(),
                    ..Params::new().limit(2)
                },
            )
            .await
            .unwrap()
            .into_page();
        assert_eq!(totals(&second), vec![30.0, 40.0]);

        let back = orders
            .find(
                props(json!({"userId": 1})),
                Params {
                    prev: second.prev.clone(),
                    ..Params::new().limit(2)
                },
            )
            .await
            .unwrap()
            .into_page();
        assert_eq!(totals(&back), vec![10.0, 20.0]);
    }

    #[tokio::test]
    async fn test_find_counts_and_reports_progress() {
        let (table, _) = seeded().await;
        let orders = table.model("Order").unwrap();
        let pages = Arc::new(AtomicUsize::new(0));
        let seen = pages.clone();
        let mut stats = Stats::default();

        let page = orders
            .find(
                props(json!({"userId": 1})),
                Params {
                    count: true,
                    progress: Some(Arc::new(move |p: &Progress<'_>| {
                        seen.store(p.pages, Ordering::SeqCst);
                    })),
                    ..Params::new().stats(&mut stats)
                },
            )
            .await
            .unwrap()
            .into_page();
        assert_eq!(page.count, Some(4));
        assert_eq!(pages.load(Ordering::SeqCst), 1);
        assert_eq!(stats.count, 4);
    }

    #[tokio::test]
    async fn test_follow_keys_only_index() {
        let (table, _) = seeded().await;
        let orders = table.model("Order").unwrap();
        orders.create(order(2, "2024-01-01", 3, 50), Params::new()).await.unwrap();

        let first = orders
            .find(Properties::new(), Params::new().index("gs1").limit(3))
            .await
            .unwrap()
            .into_page();
        assert_eq!(totals(&first), vec![10.0, 20.0, 50.0]);
        assert!(first.iter().all(|item| item.contains_key("day")));
        let next = first.next.clone().unwrap();
        assert!(next.contains_key("gs1sk"));

        let rest = orders
            .find(
                Properties::new(),
                Params {
                    next: Some(next),
                    ..Params::new().index("gs1")
                },
            )
            .await
            .unwrap()
            .into_page();
        assert_eq!(totals(&rest), vec![30.0, 40.0]);
    }

    #[tokio::test]
    async fn test_follow_spans_chunks_and_pages() {
        let schema = crate::schema::parse_schema_str(SCHEMA).unwrap();
        let store = Arc::new(MemoryStore::new(&schema.indexes).with_page_size(4));
        let table = Table::new(schema, TableOptions::new("Test", store.clone())).unwrap();
        let orders = table.model("Order").unwrap();
        for n in 1..=13 {
            orders.create(order(5, "2024-05-01", n, n), Params::new()).await.unwrap();
        }
        let expected: Vec<f64> = (1..=12).map(f64::from).collect();

        let first = orders
            .find(Properties::new(), Params::new().index("gs1").limit(12))
            .await
            .unwrap()
            .into_page();
        assert_eq!(totals(&first), expected);
        let next = first.next.clone().unwrap();
        assert_eq!(next["gs1sk"], Value::from("order#2024-05-01#0012"));
        assert_eq!(next["sk"], Value::from("order#2024-05-01#0012"));

        let rest = orders
            .find(
                Properties::new(),
                Params {
                    next: Some(next),
                    ..Params::new().index("gs1").limit(12)
                },
            )
            .await
            .unwrap()
            .into_page();
        assert_eq!(totals(&rest), vec![13.0]);
        assert_eq!(rest.next, None);

        let back = orders
            .find(
                Properties::new(),
                Params {
                    prev: rest.prev.clone(),
                    ..Params::new().index("gs1").limit(12)
                },
            )
            .await
            .unwrap()
            .into_page();
        assert_eq!(totals(&back), expected);
    }

    #[tokio::test]
    async fn test_get_through_index_rejects_many() {
        let (table, _) = seeded().await;
        let orders = table.model("Order").unwrap();
        let err = orders
            .get(Properties::new(), Params::new().index("gs1"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NonUniqueError");
    }

    #[tokio::test]
    async fn test_remove_requires_many() {
        let (table, _) = seeded().await;
        let orders = table.model("Order").unwrap();

        let err = orders.remove(props(json!({"userId": 1})), Params::new()).await.unwrap_err();
        assert_eq!(err.code(), "MissingError");

        let removed = orders
            .remove(
                props(json!({"userId": 1})),
                Params {
                    many: true,
                    ..Params::new()
                },
            )
            .await
            .unwrap()
            .into_page();
        assert_eq!(removed.len(), 4);
        let left = orders.find(props(json!({"userId": 1})), Params::new()).await.unwrap().into_page();
        assert!(left.is_empty());
    }

    #[tokio::test]
    async fn test_upsert_keeps_created() {
        let (table, _) = test_table(SCHEMA);
        let orders = table.model("Order").unwrap();

        let first = orders
            .upsert(order(2, "2024-03-01", 1, 5), Params::new())
            .await
            .unwrap()
            .into_item()
            .unwrap();
        let created = first["created"].clone();
        assert!(!created.is_null());

        let second = orders
            .upsert(order(2, "2024-03-01", 1, 6), Params::new().returning(ReturnValue::Get))
            .await
            .unwrap()
            .into_item()
            .unwrap();
        assert_eq!(second["total"], Value::from(6));
        assert_eq!(second["created"], created);
    }

    #[tokio::test]
    async fn test_caller_transaction() {
        let (table, store) = test_table(SCHEMA);
        let users = table.model("User").unwrap();
        let orders = table.model("Order").unwrap();

        let mut transaction = Transaction::new();
        users
            .create(
                props(json!({"id": 3, "email": "c@example.com"})),
                Params::new().transaction(&mut transaction),
            )
            .await
            .unwrap();
        orders
            .create(order(3, "2024-01-01", 1, 1), Params::new().transaction(&mut transaction))
            .await
            .unwrap();
        // Item, sentinel and order
        assert_eq!(transaction.len(), 3);
        assert!(store.is_empty());

        table
            .transact(TransactMode::Write, transaction, &Params::new())
            .await
            .unwrap();
        assert_eq!(store.len(), 3);

        let mut reads = Transaction::new();
        users
            .get(props(json!({"id": 3})), Params::new().transaction(&mut reads))
            .await
            .unwrap();
        let items = table.transact(TransactMode::Read, reads, &Params::new()).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].as_ref().unwrap()["email"], Value::from("c@example.com"));

        let mut other = Transaction::new();
        let err = orders
            .find(props(json!({"userId": 3})), Params::new().transaction(&mut other))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ArgumentError");
    }

    #[tokio::test]
    async fn test_batch_requests() {
        let (table, _) = test_table(SCHEMA);
        let users = table.model("User").unwrap();
        let orders = table.model("Order").unwrap();

        let mut batch = Batch::new();
        orders.create(order(4, "2024-01-01", 1, 1), Params::new().batch(&mut batch)).await.unwrap();
        orders.create(order(4, "2024-01-01", 2, 2), Params::new().batch(&mut batch)).await.unwrap();
        assert_eq!(batch.len(), 2);
        table.batch_write(batch).await.unwrap();

        let mut batch = Batch::new();
        orders
            .get(props(json!({"userId": 4, "day": "2024-01-01", "n": 2})), Params::new().batch(&mut batch))
            .await
            .unwrap();
        let items = table.batch_get(batch, &Params::new()).await.unwrap();
        assert_eq!(items[0].as_ref().unwrap()["total"], Value::from(2));

        let mut batch = Batch::new();
        let err = users
            .create(props(json!({"id": 4, "email": "d@example.com"})), Params::new().batch(&mut batch))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ArgumentError");

        let mut batch = Batch::new();
        let mut transaction = Transaction::new();
        let err = orders
            .create(
                order(4, "2024-01-02", 1, 1),
                Params::new().transaction(&mut transaction).batch(&mut batch),
            )
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Cannot have batched transactions");
    }

    #[tokio::test]
    async fn test_dry_run_returns_command() {
        let (table, store) = test_table(SCHEMA);
        let users = table.model("User").unwrap();

        let command = users
            .get(props(json!({"id": 1})), Params::new().dry_run())
            .await
            .unwrap()
            .into_command()
            .unwrap();
        assert_eq!(command.op, Op::Get);
        assert_eq!(command.key["pk"], Value::from("user#1"));

        let outcome = users
            .create(props(json!({"id": 1, "email": "e@example.com"})), Params::new().dry_run())
            .await
            .unwrap();
        assert!(matches!(outcome, Outcome::Command(_)));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_load_keeps_request_order() {
        let (table, _) = seeded().await;
        let orders = table.model("Order").unwrap();
        let keys = vec![
            props(json!({"userId": 1, "day": "2024-01-02", "n": 2})),
            props(json!({"userId": 1, "day": "2024-09-09", "n": 1})),
            props(json!({"userId": 1, "day": "2024-01-01", "n": 1})),
        ];
        let loaded = orders.load(keys, Params::new()).await.unwrap();
        let totals: Vec<Option<f64>> = loaded
            .iter()
            .map(|item| item.as_ref().and_then(|i| i.get("total")).and_then(Value::as_f64))
            .collect();
        assert_eq!(totals, vec![Some(40.0), None, Some(10.0)]);
    }

    #[tokio::test]
    async fn test_fetch_groups_partition_by_model() {
        let (table, _) = seeded().await;
        let users = table.model("User").unwrap();
        let groups = users
            .fetch(&["User", "Order"], props(json!({"id": 1})), Params::new())
            .await
            .unwrap();
        assert_eq!(groups["User"].len(), 1);
        assert_eq!(groups["Order"].len(), 4);

        let only_orders = users
            .fetch(&["Order"], props(json!({"id": 1})), Params::new())
            .await
            .unwrap();
        assert!(!only_orders.contains_key("User"));
    }

    #[tokio::test]
    async fn test_init_and_template() {
        let (table, _) = test_table(SCHEMA);
        let users = table.model("User").unwrap();
        let item = users.init(props(json!({"id": 5})), Params::new()).unwrap();
        assert_eq!(item["status"], Value::from("active"));
        assert_eq!(item["pk"], Value::from("user#5"));
        assert_eq!(item["note"], Value::Null);

        let orders = table.model("Order").unwrap();
        let sk = orders.template("sk", &props(json!({"day": "2024-01-01", "n": 3}))).unwrap();
        assert_eq!(sk, Some(Value::from("order#2024-01-01#0003")));
        assert!(orders.template("nope", &Properties::new()).is_err());
    }

    const BADGES: &str = r#"
indexes:
  primary: { hash: pk, sort: sk }
models:
  Badge:
    pk: { type: string, value: "badge#${id}" }
    sk: { type: string, value: "badge#" }
    id: { type: string, required: true }
    issued: { type: date, unique: true }
"#;

    #[tokio::test]
    async fn test_unique_date_sentinels_follow_stored_value() {
        use chrono::TimeZone;
        let (table, store) = test_table(BADGES);
        let badges = table.model("Badge").unwrap();
        let first = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
        let second = Utc.timestamp_millis_opt(1_800_000_000_000).unwrap();

        let mut badge = props(json!({"id": "b1"}));
        badge.insert("issued".into(), Value::Date(first));
        badges.create(badge, Params::new()).await.unwrap();
        assert_eq!(sentinels(&store), vec!["_unique#Badge#issued#1700000000000".to_string()]);

        let mut change = props(json!({"id": "b1"}));
        change.insert("issued".into(), Value::Date(second));
        badges
            .update(change, Params::new().returning(ReturnValue::None))
            .await
            .unwrap();
        assert_eq!(sentinels(&store), vec!["_unique#Badge#issued#1800000000000".to_string()]);

        // The vacated date is free again
        let mut other = props(json!({"id": "b2"}));
        other.insert("issued".into(), Value::Date(first));
        badges.create(other, Params::new()).await.unwrap();

        badges.remove(props(json!({"id": "b1"})), Params::new()).await.unwrap();
        badges.remove(props(json!({"id": "b2"})), Params::new()).await.unwrap();
        assert!(sentinels(&store).is_empty());
    }

    /// Answers every query with one item and a cursor to another page.
    struct Endless {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl StoreClient for Endless {
        async fn execute(&self, _command: &Command) -> Result<Response> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let key = props(json!({"pk": "user#1", "sk": format!("user#{n}")}));
            let mut item = key.clone();
            item.insert("_type".into(), Value::from("User"));
            item.insert("id".into(), Value::from(1));
            Ok(Response {
                items: vec![item],
                count: Some(1),
                scanned_count: Some(1),
                consumed_capacity: Some(0.5),
                last_evaluated_key: Some(key),
                ..Response::default()
            })
        }

        async fn transact(&self, _mode: TransactMode, _commands: &[Command]) -> Result<Response> {
            Err(SingleTableError::Store("unsupported".to_string()))
        }

        async fn batch_get(&self, _commands: &[Command]) -> Result<Response> {
            Err(SingleTableError::Store("unsupported".to_string()))
        }

        async fn batch_write(&self, _commands: &[Command]) -> Result<Response> {
            Err(SingleTableError::Store("unsupported".to_string()))
        }
    }

    #[tokio::test]
    async fn test_scan_does_not_follow() {
        let client = Arc::new(Endless {
            calls: AtomicUsize::new(0),
        });
        let schema = crate::schema::parse_schema_str(SCHEMA).unwrap();
        let table = Table::new(schema, TableOptions::new("Test", client.clone())).unwrap();
        let users = table.model("User").unwrap();

        let page = users
            .scan(
                Properties::new(),
                Params {
                    max_pages: Some(1),
                    ..Params::new().index("gs1")
                },
            )
            .await
            .unwrap()
            .into_page();
        assert_eq!(page.len(), 1);
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_max_pages_bounds_pagination() {
        let client = Arc::new(Endless {
            calls: AtomicUsize::new(0),
        });
        let schema = crate::schema::parse_schema_str(SCHEMA).unwrap();
        let table = Table::new(schema, TableOptions::new("Test", client.clone())).unwrap();
        let users = table.model("User").unwrap();
        let mut stats = Stats::default();

        let page = users
            .find(
                props(json!({"id": 1})),
                Params {
                    max_pages: Some(3),
                    ..Params::new().stats(&mut stats)
                },
            )
            .await
            .unwrap()
            .into_page();
        assert_eq!(client.calls.load(Ordering::SeqCst), 3);
        assert_eq!(page.len(), 3);
        assert_eq!(page.next, Some(props(json!({"pk": "user#1", "sk": "user#2"}))));
        assert_eq!(stats.count, 3);
        assert_eq!(stats.scanned, 3);
    }
}
