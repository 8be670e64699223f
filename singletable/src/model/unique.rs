//! Unique fields. Each unique value occupies a sentinel item written in the
//! same transaction as the item itself, so a second writer of the value fails
//! its condition check.

use super::{Model, Outcome};
use crate::error::{Result, SingleTableError};
use crate::expression::Op;
use crate::params::{Exists, Params, ReturnValue};
use crate::schema::Field;
use crate::table::{TransactMode, Transaction, UNIQUE_MODEL};
use crate::value::{properties_to_json, Properties, Value};

const SENTINEL_SORT: &str = "_unique#";

fn reject_batch(params: &Params<'_>) -> Result<()> {
    if params.batch.is_some() {
        return Err(SingleTableError::Argument(
            "Cannot use batch with unique properties which require transactions".to_string(),
        ));
    }
    Ok(())
}

/// `_unique#{scope#}{Model}#{attribute}#{value}`
fn sentinel_key(model: &Model<'_>, field: &Field, value: &Value, properties: &Properties) -> Result<String> {
    let scope = match &field.scope {
        Some(template) => {
            let text = model
                .pipeline()
                .run_template(Op::Put, None, field, properties, template)?
                .and_then(|v| v.to_text())
                .unwrap_or_default();
            format!("{text}#")
        }
        None => String::new(),
    };
    let text = value.to_text().unwrap_or_else(|| value.to_json().to_string());
    Ok(format!(
        "_unique#{scope}{}#{}#{text}",
        model.name(),
        field.attribute.name
    ))
}

fn sentinel(model: &Model<'_>, key: String) -> Properties {
    let primary = model.table().indexes().primary();
    let mut properties = Properties::new();
    properties.insert(primary.hash.clone(), Value::String(key));
    if let Some(sort) = &primary.sort {
        properties.insert(sort.clone(), Value::String(SENTINEL_SORT.to_string()));
    }
    properties
}

fn sentinel_params(exists: Option<Exists>, transaction: &mut Transaction, log: Option<bool>) -> Params<'_> {
    let mut params = Params::new().transaction(transaction);
    params.exists = exists;
    params.log = log;
    params
}

/// Translate a sentinel condition failure into a uniqueness error.
fn translate<T>(
    result: Result<T>,
    verb: &str,
    model: &Model<'_>,
    names: &[String],
    properties: &Properties,
) -> Result<T> {
    match result {
        Err(SingleTableError::TransactionCanceled { reasons })
            if reasons.iter().any(|r| r.contains("ConditionalCheckFailed")) =>
        {
            Err(SingleTableError::Unique {
                message: format!(
                    "Cannot {verb} unique attributes \"{}\" for \"{}\". An item of the same name already exists.",
                    names.join(", "),
                    model.name()
                ),
                fields: names.to_vec(),
                context: properties_to_json(properties),
            })
        }
        other => other,
    }
}

/// Read the stored item, with hidden fields, ahead of the transaction.
async fn prior(model: &Model<'_>, properties: &Properties, params: &Params<'_>) -> Result<Option<Properties>> {
    let mut get_params = params.detached();
    get_params.hidden = Some(true);
    get_params.exists = None;
    get_params.return_value = None;
    get_params.execute = None;
    get_params.limit = None;
    let pipeline = model.pipeline();
    let lookup = pipeline.key_properties(pipeline.select_index(params)?, properties);
    Ok(model.get(lookup, get_params).await?.into_item())
}

/// The prior item as the write pipeline stores it. Sentinel keys are built
/// from stored values, so keys rebuilt from a read item must be coerced first.
fn stored(model: &Model<'_>, prior: &Properties, params: &Params<'_>) -> Result<Properties> {
    if prior.is_empty() {
        return Ok(Properties::new());
    }
    let mut write_params = params.detached();
    write_params.index = None;
    write_params.exists = Some(Exists::Required);
    write_params.execute = None;
    model
        .pipeline()
        .prepare(Op::Update, prior.clone(), &mut write_params)
}

pub(super) async fn create(model: &Model<'_>, properties: Properties, params: Params<'_>) -> Result<Outcome> {
    reject_batch(&params)?;
    let mut params = params;
    let mut properties = properties;
    model.stamp_put(&mut properties);
    let prepared = model
        .pipeline()
        .prepare(Op::Put, properties.clone(), &mut params)?;

    let unique = model.table().model(UNIQUE_MODEL)?;
    let primary = model.table().indexes().primary();
    let log = params.log;
    let mut local = Transaction::new();
    let commit = params.transaction.is_none();
    let transaction: &mut Transaction = match params.transaction.take() {
        Some(transaction) => transaction,
        None => &mut local,
    };

    let mut names = Vec::new();
    for field in model.schema().unique_fields(primary) {
        let Some(value) = prepared.get(&field.name).filter(|v| !v.is_null()) else {
            continue;
        };
        let key = sentinel_key(model, field, value, &prepared)?;
        unique
            .put_item(sentinel(model, key), sentinel_params(Some(Exists::Absent), &mut *transaction, log))
            .await?;
        names.push(field.name.clone());
    }

    let outcome = model
        .execute(Op::Put, prepared, properties.clone(), params.with_transaction(&mut *transaction))
        .await?;
    if commit && !matches!(outcome, Outcome::Command(_)) {
        let mut commit_params = Params::new();
        commit_params.log = log;
        let result = model
            .table()
            .transact(TransactMode::Write, local, &commit_params)
            .await;
        translate(result, "create", model, &names, &properties)?;
    }
    Ok(outcome)
}

pub(super) async fn update(model: &Model<'_>, properties: Properties, params: Params<'_>) -> Result<Outcome> {
    reject_batch(&params)?;
    let return_value = params.return_value;
    if matches!(return_value, Some(ReturnValue::AllNew | ReturnValue::AllOld)) {
        return Err(SingleTableError::Argument(
            "Updates with unique fields run in a transaction and cannot return store values. Use ReturnValue::Get."
                .to_string(),
        ));
    }
    let mut params = params;
    let primary = model.table().indexes().primary();

    let prior = match prior(model, &properties, &params).await? {
        Some(prior) => prior,
        None if params.exists == Some(Exists::Any) => Properties::new(),
        None => {
            return Err(SingleTableError::NotFound {
                message: format!("Cannot find existing item to update in \"{}\"", model.name()),
                context: properties_to_json(&properties),
            })
        }
    };
    let mut merged = prior.clone();
    merged.extend(properties.clone());

    // Values this update writes or removes
    let mut probe = params.detached();
    probe.remove = params.remove.clone();
    let changes = model
        .pipeline()
        .prepare(Op::Update, properties.clone(), &mut probe)?;
    let before = stored(model, &prior, &params)?;
    let mut after = before.clone();
    after.extend(changes.clone());

    let mut reread = params.detached();
    reread.exists = None;
    reread.return_value = None;
    reread.index = None;

    let unique = model.table().model(UNIQUE_MODEL)?;
    let log = params.log;
    let mut local = Transaction::new();
    let commit = params.transaction.is_none();
    let transaction: &mut Transaction = match params.transaction.take() {
        Some(transaction) => transaction,
        None => &mut local,
    };

    let mut names = Vec::new();
    for field in model.schema().unique_fields(primary) {
        let new_value = changes.get(&field.name).filter(|v| !v.is_null());
        let removing = probe.remove.contains(&field.pathname);
        if new_value.is_none() && !removing {
            continue;
        }
        let old_key = match before.get(&field.name).filter(|v| !v.is_null()) {
            Some(value) => Some(sentinel_key(model, field, value, &before)?),
            None => None,
        };
        let new_key = match new_value {
            Some(value) => Some(sentinel_key(model, field, value, &after)?),
            None => None,
        };
        if old_key == new_key {
            continue;
        }
        if let Some(key) = old_key {
            unique
                .delete_item(sentinel(model, key), sentinel_params(None, &mut *transaction, log))
                .await?;
        }
        if let Some(key) = new_key {
            unique
                .put_item(sentinel(model, key), sentinel_params(Some(Exists::Absent), &mut *transaction, log))
                .await?;
            names.push(field.name.clone());
        }
    }

    let outcome = model
        .update_item(properties.clone(), params.with_transaction(&mut *transaction))
        .await?;
    if !commit || matches!(outcome, Outcome::Command(_)) {
        return Ok(outcome);
    }
    let mut commit_params = Params::new();
    commit_params.log = log;
    let result = model
        .table()
        .transact(TransactMode::Write, local, &commit_params)
        .await;
    translate(result, "update", model, &names, &properties)?;

    match return_value {
        Some(ReturnValue::None) => Ok(Outcome::Item(None)),
        Some(ReturnValue::Get) => model.get(merged, reread).await,
        _ => {
            if model.table().params().warn {
                log::warn!(
                    "Update with unique items uses transactions and cannot return the updated item. \
                     Use ReturnValue::None to squelch this warning or ReturnValue::Get to re-read the item."
                );
            }
            Ok(outcome)
        }
    }
}

pub(super) async fn remove(model: &Model<'_>, properties: Properties, params: Params<'_>) -> Result<Outcome> {
    reject_batch(&params)?;
    let mut params = params;
    let primary = model.table().indexes().primary();
    let prior = prior(model, &properties, &params).await?;
    if prior.is_none() && params.exists == Some(Exists::Required) {
        return Err(SingleTableError::NotFound {
            message: format!("Cannot find item to remove in \"{}\"", model.name()),
            context: properties_to_json(&properties),
        });
    }
    let prepared = model
        .pipeline()
        .prepare(Op::Delete, properties.clone(), &mut params)?;
    let source = match &prior {
        Some(prior) => stored(model, prior, &params)?,
        None => prepared.clone(),
    };
    let unique = model.table().model(UNIQUE_MODEL)?;
    let log = params.log;
    let hidden = params.hidden == Some(true);
    let mut local = Transaction::new();
    let commit = params.transaction.is_none();
    let transaction: &mut Transaction = match params.transaction.take() {
        Some(transaction) => transaction,
        None => &mut local,
    };

    for field in model.schema().unique_fields(primary) {
        let Some(value) = source.get(&field.name).filter(|v| !v.is_null()) else {
            continue;
        };
        let key = sentinel_key(model, field, value, &source)?;
        unique
            .delete_item(sentinel(model, key), sentinel_params(None, &mut *transaction, log))
            .await?;
    }

    let outcome = model
        .execute(Op::Delete, prepared, properties.clone(), params.with_transaction(&mut *transaction))
        .await?;
    if !commit || matches!(outcome, Outcome::Command(_)) {
        return Ok(outcome);
    }
    let mut commit_params = Params::new();
    commit_params.log = log;
    model
        .table()
        .transact(TransactMode::Write, local, &commit_params)
        .await?;

    let removed = prior.map(|mut item| {
        if !hidden {
            item.retain(|name, _| model.schema().block.fields.get(name).map_or(true, |f| !f.hidden));
        }
        item
    });
    Ok(Outcome::Item(removed))
}
