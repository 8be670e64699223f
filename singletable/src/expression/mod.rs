//! Command builder: maps prepared properties onto attribute names and emits a
//! structured, store-neutral request document.

use crate::error::{Result, SingleTableError};
use crate::params::{Exists, Params, ReturnValue};
use crate::schema::{Block, Index, Indexes, ModelSchema};
use crate::value::{Condition, Item, Operator, Properties, Value};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Operation kinds understood by the pipeline and the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    Put,
    Get,
    Update,
    Delete,
    Find,
    Scan,
    Init,
}

impl Op {
    /// Point operations addressed purely by key
    pub fn keys_only(self) -> bool {
        matches!(self, Op::Get | Op::Delete)
    }

    pub fn is_write(self) -> bool {
        matches!(self, Op::Put | Op::Update | Op::Delete)
    }

    pub fn is_range(self) -> bool {
        matches!(self, Op::Find | Op::Scan)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Op::Put => "put",
            Op::Get => "get",
            Op::Update => "update",
            Op::Delete => "delete",
            Op::Find => "find",
            Op::Scan => "scan",
            Op::Init => "init",
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Precondition on the primary hash attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyCondition {
    Exists(String),
    NotExists(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReturnValues {
    None,
    AllNew,
    AllOld,
}

/// A store-neutral request document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Command {
    pub op: Op,
    pub table: String,
    /// Secondary index name. `None` addresses the primary index.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<String>,
    /// Primary key attributes for point operations
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub key: Item,
    /// Full item for put
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub item: Item,
    /// Attribute paths (`att` or `att.sub`) to set on update
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub set: Item,
    /// Attribute paths set on update only when absent
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub set_if_not_exists: Item,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub remove: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub key_conditions: BTreeMap<String, ConditionDoc>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub filters: BTreeMap<String, ConditionDoc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<KeyCondition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exclusive_start_key: Option<Item>,
    pub scan_forward: bool,
    pub return_values: ReturnValues,
}

/// Serializable wrapper so conditions log as `{"op": operand}`.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionDoc(pub Condition);

impl Serialize for ConditionDoc {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        Value::Condition(self.0.clone()).serialize(serializer)
    }
}

impl std::ops::Deref for ConditionDoc {
    type Target = Condition;

    fn deref(&self) -> &Condition {
        &self.0
    }
}

impl Command {
    pub fn new(op: Op, table: impl Into<String>) -> Self {
        Command {
            op,
            table: table.into(),
            index: None,
            key: Item::new(),
            item: Item::new(),
            set: Item::new(),
            set_if_not_exists: Item::new(),
            remove: Vec::new(),
            key_conditions: BTreeMap::new(),
            filters: BTreeMap::new(),
            condition: None,
            limit: None,
            exclusive_start_key: None,
            scan_forward: true,
            return_values: ReturnValues::None,
        }
    }
}

/// A prepared request: the command plus the context the orchestrator needs.
#[derive(Debug, Clone)]
pub struct Expression {
    pub op: Op,
    pub index: Index,
    /// Prepared properties the command was built from
    pub properties: Properties,
    pub execute: bool,
    command: Command,
}

impl Expression {
    pub fn new(
        model: &ModelSchema,
        indexes: &Indexes,
        table: &str,
        op: Op,
        properties: Properties,
        params: &Params<'_>,
    ) -> Result<Self> {
        let index = match params.index.as_deref() {
            Some(name) if op.is_range() => indexes.get(name).cloned().ok_or_else(|| {
                SingleTableError::Missing {
                    message: format!("Cannot find index {name}"),
                    context: serde_json::json!({ "index": name }),
                }
            })?,
            _ => indexes.primary().clone(),
        };
        let primary = indexes.primary();
        let generic = params.generic.unwrap_or(model.generic);

        let mut command = Command::new(op, table);
        if !index.is_primary() {
            command.index = Some(index.name.clone());
        }

        for (name, value) in &properties {
            let (attribute, sub, value) = match model.block.fields.get(name) {
                Some(field) => {
                    let value = match &field.block {
                        Some(block) => nested_attributes(block, value.clone()),
                        None => value.clone(),
                    };
                    (field.attribute.name.clone(), field.attribute.sub.clone(), value)
                }
                None if generic => (name.clone(), None, value.clone()),
                None => continue,
            };
            let value = &value;
            match op {
                Op::Put => insert_packed(&mut command.item, &attribute, sub.as_deref(), value.clone()),
                Op::Get | Op::Delete => {
                    if primary.is_key(&attribute) {
                        command.key.insert(attribute, value.clone());
                    }
                }
                Op::Update => {
                    if primary.is_key(&attribute) {
                        command.key.insert(attribute, value.clone());
                    } else {
                        command.set.insert(path(&attribute, sub.as_deref()), value.clone());
                    }
                }
                Op::Find => {
                    let condition = ConditionDoc(to_condition(value.clone()));
                    if index.is_key(&attribute) {
                        command.key_conditions.insert(attribute, condition);
                    } else {
                        command.filters.insert(path(&attribute, sub.as_deref()), condition);
                    }
                }
                Op::Scan => {
                    let condition = ConditionDoc(to_condition(value.clone()));
                    command.filters.insert(path(&attribute, sub.as_deref()), condition);
                }
                Op::Init => {}
            }
        }

        if op == Op::Put {
            for attribute in std::iter::once(&primary.hash).chain(primary.sort.iter()) {
                if let Some(value) = command.item.get(attribute) {
                    command.key.insert(attribute.clone(), value.clone());
                }
            }
        }
        if op == Op::Update {
            for pathname in &params.remove {
                let attribute = attribute_path(model, pathname);
                if !command.remove.contains(&attribute) {
                    command.remove.push(attribute);
                }
            }
            for (name, value) in &params.set_if_not_exists {
                command
                    .set_if_not_exists
                    .insert(attribute_path(model, name), value.clone());
            }
        }
        if op.is_range() {
            command.limit = params.limit;
            command.exclusive_start_key = params.next.clone().or_else(|| params.prev.clone());
            command.scan_forward = params.prev.is_none();
        }

        command.condition = match (op, params.exists) {
            (Op::Put, Some(Exists::Absent)) | (Op::Update, Some(Exists::Absent)) => {
                Some(KeyCondition::NotExists(primary.hash.clone()))
            }
            (Op::Put | Op::Update | Op::Delete, Some(Exists::Required)) => {
                Some(KeyCondition::Exists(primary.hash.clone()))
            }
            _ => None,
        };
        command.return_values = match (op, params.return_value) {
            (Op::Update, None | Some(ReturnValue::AllNew)) => ReturnValues::AllNew,
            (Op::Delete, None | Some(ReturnValue::AllOld)) => ReturnValues::AllOld,
            (_, Some(ReturnValue::AllNew)) => ReturnValues::AllNew,
            (_, Some(ReturnValue::AllOld)) => ReturnValues::AllOld,
            _ => ReturnValues::None,
        };

        if matches!(op, Op::Get | Op::Delete | Op::Update) && !command.key.contains_key(&primary.hash) {
            return Err(SingleTableError::Missing {
                message: format!("Missing hash key \"{}\" for {op} on \"{}\"", primary.hash, model.name),
                context: crate::value::properties_to_json(&properties),
            });
        }

        Ok(Expression {
            op,
            index,
            properties,
            execute: params.execute.unwrap_or(true),
            command,
        })
    }

    pub fn command(&self) -> &Command {
        &self.command
    }

    pub fn into_command(self) -> Command {
        self.command
    }
}

/// Rename nested block members to their stored attribute names.
fn nested_attributes(block: &Block, value: Value) -> Value {
    let Value::Object(members) = value else {
        return value;
    };
    let mut mapped = Item::new();
    for (name, member) in members {
        match block.fields.get(&name) {
            Some(field) => {
                let member = match &field.block {
                    Some(child) => nested_attributes(child, member),
                    None => member,
                };
                insert_packed(&mut mapped, &field.attribute.name, field.attribute.sub.as_deref(), member);
            }
            None => {
                mapped.insert(name, member);
            }
        }
    }
    Value::Object(mapped)
}

fn path(attribute: &str, sub: Option<&str>) -> String {
    match sub {
        Some(sub) => format!("{attribute}.{sub}"),
        None => attribute.to_string(),
    }
}

/// Map a property pathname such as `address.city` to its attribute path.
fn attribute_path(model: &ModelSchema, pathname: &str) -> String {
    let (head, rest) = match pathname.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (pathname, None),
    };
    let base = match model.block.fields.get(head) {
        Some(field) => path(&field.attribute.name, field.attribute.sub.as_deref()),
        None => head.to_string(),
    };
    match rest {
        Some(rest) => format!("{base}.{rest}"),
        None => base,
    }
}

fn insert_packed(item: &mut Item, attribute: &str, sub: Option<&str>, value: Value) {
    match sub {
        None => {
            item.insert(attribute.to_string(), value);
        }
        Some(sub) => {
            let entry = item
                .entry(attribute.to_string())
                .or_insert_with(|| Value::Object(Properties::new()));
            if let Some(map) = entry.as_object_mut() {
                map.insert(sub.to_string(), value);
            }
        }
    }
}

fn to_condition(value: Value) -> Condition {
    match value {
        Value::Condition(condition) => condition,
        other => Condition::new(Operator::Eq, other),
    }
}
