//! In-process store client: primary and secondary indexes with projections,
//! conditional writes, atomic transactions and paged range reads.

use crate::error::{Result, SingleTableError};
use crate::expression::{Command, KeyCondition, Op, ReturnValues};
use crate::schema::{IndexDefinition, Projection, ProjectionKind, PRIMARY};
use crate::table::{Response, StoreClient, TransactMode};
use crate::value::{compare, Item, Properties, Value};
use async_trait::async_trait;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Capacity units charged per evaluated item.
const READ_UNIT: f64 = 0.5;

/// A store kept in memory. Range reads return at most `page_size` items per
/// round trip and report a continuation key when more remain.
pub struct MemoryStore {
    indexes: BTreeMap<String, IndexDefinition>,
    page_size: Option<usize>,
    items: Mutex<Vec<Item>>,
}

impl MemoryStore {
    pub fn new(indexes: &BTreeMap<String, IndexDefinition>) -> Self {
        MemoryStore {
            indexes: indexes.clone(),
            page_size: None,
            items: Mutex::new(Vec::new()),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = Some(page_size.max(1));
        self
    }

    /// Snapshot of every stored item
    pub fn items(&self) -> Vec<Item> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Item>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn index(&self, name: Option<&str>) -> Result<&IndexDefinition> {
        let name = name.unwrap_or(PRIMARY);
        self.indexes
            .get(name)
            .ok_or_else(|| SingleTableError::Store(format!("Unknown index \"{name}\"")))
    }

    fn primary(&self) -> Result<&IndexDefinition> {
        self.index(None)
    }

    fn key_attributes(&self, index: &IndexDefinition) -> Result<Vec<String>> {
        let primary = self.primary()?;
        let mut attributes = vec![index.hash.clone()];
        attributes.extend(index.sort.iter().cloned());
        for attribute in std::iter::once(&primary.hash).chain(primary.sort.iter()) {
            if !attributes.contains(attribute) {
                attributes.push(attribute.clone());
            }
        }
        Ok(attributes)
    }

    fn position(&self, items: &[Item], key: &Item) -> Result<Option<usize>> {
        let primary = self.primary()?;
        let attributes: Vec<&String> = std::iter::once(&primary.hash).chain(primary.sort.iter()).collect();
        for attribute in &attributes {
            if !key.contains_key(*attribute) {
                return Err(SingleTableError::Store(format!(
                    "Missing key attribute \"{attribute}\""
                )));
            }
        }
        Ok(items
            .iter()
            .position(|item| attributes.iter().all(|a| item.get(*a) == key.get(*a))))
    }

    /// Key of a put, update or delete target.
    fn target_key(command: &Command) -> &Item {
        if command.op == Op::Put {
            &command.item
        } else {
            &command.key
        }
    }

    fn check(&self, items: &[Item], command: &Command) -> Result<bool> {
        let Some(condition) = &command.condition else {
            return Ok(true);
        };
        let existing = self
            .position(items, Self::target_key(command))?
            .map(|i| &items[i]);
        Ok(match condition {
            KeyCondition::Exists(attribute) => existing.map_or(false, |item| item.contains_key(attribute)),
            KeyCondition::NotExists(attribute) => existing.map_or(true, |item| !item.contains_key(attribute)),
        })
    }

    fn apply(&self, items: &mut Vec<Item>, command: &Command) -> Result<Response> {
        match command.op {
            Op::Get => {
                let item = self.position(items, &command.key)?.map(|i| items[i].clone());
                Ok(Response {
                    item,
                    consumed_capacity: Some(READ_UNIT),
                    ..Response::default()
                })
            }
            Op::Put | Op::Update | Op::Delete => {
                if !self.check(items, command)? {
                    return Err(SingleTableError::ConditionalCheckFailed(format!(
                        "{} on {}",
                        command.op,
                        serde_json::to_string(Self::target_key(command))?
                    )));
                }
                self.write(items, command)
            }
            Op::Find | Op::Scan => self.range(items, command),
            Op::Init => Err(SingleTableError::Store("Cannot execute init".to_string())),
        }
    }

    fn write(&self, items: &mut Vec<Item>, command: &Command) -> Result<Response> {
        let position = self.position(items, Self::target_key(command))?;
        let old = position.map(|i| items[i].clone());
        let new = match command.op {
            Op::Put => Some(command.item.clone()),
            Op::Update => {
                let mut item = old.clone().unwrap_or_else(|| command.key.clone());
                for (path, value) in &command.set {
                    set_path(&mut item, path, value.clone());
                }
                for (path, value) in &command.set_if_not_exists {
                    if lookup(&item, path).is_none() {
                        set_path(&mut item, path, value.clone());
                    }
                }
                for path in &command.remove {
                    remove_path(&mut item, path);
                }
                Some(item)
            }
            _ => None,
        };
        match (position, &new) {
            (Some(i), Some(item)) => items[i] = item.clone(),
            (None, Some(item)) => items.push(item.clone()),
            (Some(i), None) => {
                items.remove(i);
            }
            (None, None) => {}
        }
        let attributes = match command.return_values {
            ReturnValues::AllNew => new,
            ReturnValues::AllOld => old,
            ReturnValues::None => None,
        };
        Ok(Response {
            attributes,
            consumed_capacity: Some(1.0),
            ..Response::default()
        })
    }

    fn range(&self, items: &[Item], command: &Command) -> Result<Response> {
        let index = match command.op {
            Op::Scan => self.primary()?,
            _ => self.index(command.index.as_deref())?,
        };
        let primary = self.primary()?;
        let mut order: Vec<&String> = Vec::new();
        if command.op == Op::Find {
            order.extend(index.sort.iter());
        }
        order.push(&primary.hash);
        order.extend(primary.sort.iter());

        let mut candidates: Vec<&Item> = items
            .iter()
            .filter(|item| {
                item.contains_key(&index.hash)
                    && index.sort.as_ref().map_or(true, |s| item.contains_key(s))
                    && command
                        .key_conditions
                        .iter()
                        .all(|(attribute, condition)| item.get(attribute).map_or(false, |v| condition.matches(v)))
            })
            .collect();
        candidates.sort_by(|a, b| order_items(a, b, &order));
        if !command.scan_forward {
            candidates.reverse();
        }
        if let Some(start) = &command.exclusive_start_key {
            let after: Vec<&Item> = candidates
                .iter()
                .copied()
                .filter(|item| {
                    let ordering = order_items(item, start, &order);
                    if command.scan_forward {
                        ordering == Ordering::Greater
                    } else {
                        ordering == Ordering::Less
                    }
                })
                .collect();
            candidates = after;
        }

        let budget = match (command.limit, self.page_size) {
            (Some(limit), Some(size)) => limit.min(size),
            (Some(limit), None) => limit,
            (None, Some(size)) => size,
            (None, None) => usize::MAX,
        };
        let evaluated = candidates.len().min(budget);
        let keys = self.key_attributes(index)?;
        let mut page = Vec::new();
        for item in &candidates[..evaluated] {
            let passes = command
                .filters
                .iter()
                .all(|(path, condition)| lookup(item, path).map_or(false, |v| condition.matches(v)));
            if passes {
                page.push(project(item, index, &keys));
            }
        }
        let last_evaluated_key = (evaluated < candidates.len() && evaluated > 0).then(|| {
            let last = candidates[evaluated - 1];
            keys.iter()
                .filter_map(|k| last.get(k).map(|v| (k.clone(), v.clone())))
                .collect::<Item>()
        });

        Ok(Response {
            count: Some(page.len() as u64),
            scanned_count: Some(evaluated as u64),
            consumed_capacity: Some(evaluated.max(1) as f64 * READ_UNIT),
            items: page,
            last_evaluated_key,
            ..Response::default()
        })
    }
}

fn order_items(a: &Item, b: &Item, order: &[&String]) -> Ordering {
    for attribute in order {
        let ordering = match (a.get(*attribute), b.get(*attribute)) {
            (Some(x), Some(y)) => compare(x, y).unwrap_or(Ordering::Equal),
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

fn project(item: &Item, index: &IndexDefinition, keys: &[String]) -> Item {
    match &index.project {
        None | Some(Projection::Named(ProjectionKind::All)) => item.clone(),
        Some(Projection::Named(ProjectionKind::Keys)) => item
            .iter()
            .filter(|(k, _)| keys.contains(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        Some(Projection::Attributes(attributes)) => item
            .iter()
            .filter(|(k, _)| keys.contains(k) || attributes.contains(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    }
}

fn lookup<'i>(item: &'i Item, path: &str) -> Option<&'i Value> {
    match path.split_once('.') {
        Some((head, rest)) => item.get(head)?.get_path(rest),
        None => item.get(path),
    }
}

fn set_path(item: &mut Item, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            item.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let entry = item
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Properties::new()));
            if !matches!(entry, Value::Object(_)) {
                *entry = Value::Object(Properties::new());
            }
            if let Some(map) = entry.as_object_mut() {
                set_path(map, rest, value);
            }
        }
    }
}

fn remove_path(item: &mut Item, path: &str) {
    match path.split_once('.') {
        None => {
            item.remove(path);
        }
        Some((head, rest)) => {
            if let Some(map) = item.get_mut(head).and_then(Value::as_object_mut) {
                remove_path(map, rest);
            }
        }
    }
}

#[async_trait]
impl StoreClient for MemoryStore {
    async fn execute(&self, command: &Command) -> Result<Response> {
        let mut items = self.lock();
        self.apply(&mut items, command)
    }

    async fn transact(&self, mode: TransactMode, commands: &[Command]) -> Result<Response> {
        let mut items = self.lock();
        match mode {
            TransactMode::Read => {
                let mut responses = Vec::with_capacity(commands.len());
                for command in commands {
                    if command.op != Op::Get {
                        return Err(SingleTableError::Store(format!(
                            "Invalid operation \"{}\" in a read transaction",
                            command.op
                        )));
                    }
                    responses.push(self.apply(&mut items, command)?.item);
                }
                Ok(Response {
                    responses,
                    ..Response::default()
                })
            }
            TransactMode::Write => {
                let mut reasons = Vec::with_capacity(commands.len());
                let mut failed = false;
                for command in commands {
                    if !matches!(command.op, Op::Put | Op::Update | Op::Delete) {
                        return Err(SingleTableError::Store(format!(
                            "Invalid operation \"{}\" in a write transaction",
                            command.op
                        )));
                    }
                    if self.check(&items, command)? {
                        reasons.push("None".to_string());
                    } else {
                        failed = true;
                        reasons.push("ConditionalCheckFailed".to_string());
                    }
                }
                if failed {
                    return Err(SingleTableError::TransactionCanceled { reasons });
                }
                for command in commands {
                    self.write(&mut items, command)?;
                }
                Ok(Response::default())
            }
        }
    }

    async fn batch_get(&self, commands: &[Command]) -> Result<Response> {
        let items = self.lock();
        let mut responses = Vec::with_capacity(commands.len());
        for command in commands {
            let found = self.position(&items, &command.key)?.map(|i| items[i].clone());
            responses.push(found);
        }
        Ok(Response {
            items: responses.iter().flatten().cloned().collect(),
            responses,
            ..Response::default()
        })
    }

    async fn batch_write(&self, commands: &[Command]) -> Result<Response> {
        let mut items = self.lock();
        for command in commands {
            if !matches!(command.op, Op::Put | Op::Delete) {
                return Err(SingleTableError::Store(format!(
                    "Invalid operation \"{}\" in a batch write",
                    command.op
                )));
            }
            self.write(&mut items, command)?;
        }
        Ok(Response::default())
    }
}

/// Table over a fresh store for the given YAML schema.
#[cfg(test)]
pub(crate) fn test_table(yaml: &str) -> (crate::table::Table, std::sync::Arc<MemoryStore>) {
    use crate::table::{Table, TableOptions};
    let schema = crate::schema::parse_schema_str(yaml).unwrap();
    let store = std::sync::Arc::new(MemoryStore::new(&schema.indexes));
    let table = Table::new(schema, TableOptions::new("Test", store.clone())).unwrap();
    (table, store)
}
