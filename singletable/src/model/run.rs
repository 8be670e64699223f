//! Request orchestration: deferral into containers, execution, pagination,
//! parsing and follow resolution.

use super::{Model, Outcome, Page, FOLLOW_THREADS, SANITY_PAGES};
use crate::error::{Result, SingleTableError};
use crate::expression::{Command, Expression, Op};
use crate::params::{Params, Progress};
use crate::schema::Index;
use crate::table::{Response, TransactItem};
use crate::value::{properties_to_json, Item, Properties};
use futures_util::future::{join_all, BoxFuture};
use futures_util::FutureExt;

fn log_command(enabled: Option<bool>, op: Op, model: &str, command: &Command, note: &str) {
    let text = || serde_json::to_string(command).unwrap_or_default();
    match enabled {
        Some(true) => log::info!("\"{op}\" \"{model}\"{note} {}", text()),
        None => log::trace!("\"{op}\" \"{model}\"{note} {}", text()),
        Some(false) => {}
    }
}

impl<'a> Model<'a> {
    /// Build the command for prepared properties and run it, or defer it into
    /// the caller's transaction or batch.
    pub(crate) fn execute<'f>(
        &'f self,
        op: Op,
        prepared: Properties,
        properties: Properties,
        params: Params<'f>,
    ) -> BoxFuture<'f, Result<Outcome>> {
        async move {
            let mut params = params;
            let table = self.table;
            let expression = Expression::new(
                self.schema,
                table.indexes(),
                table.name(),
                op,
                prepared,
                &params,
            )?;
            if !expression.execute {
                log_command(params.log, op, &self.schema.name, expression.command(), " (not executed)");
                return Ok(Outcome::Command(Box::new(expression.into_command())));
            }

            if let Some(transaction) = params.transaction.as_deref_mut() {
                if params.batch.is_some() {
                    return Err(SingleTableError::Argument(
                        "Cannot have batched transactions".to_string(),
                    ));
                }
                if !matches!(op, Op::Put | Op::Get | Op::Update | Op::Delete) {
                    return Err(SingleTableError::Argument(format!(
                        "Unknown transaction operation \"{op}\""
                    )));
                }
                transaction.push(TransactItem {
                    model: self.schema.name.clone(),
                    op,
                    command: expression.command().clone(),
                });
                return self.echo(&expression, &properties, &params);
            }
            if let Some(batch) = params.batch.as_deref_mut() {
                batch.push(TransactItem {
                    model: self.schema.name.clone(),
                    op,
                    command: expression.command().clone(),
                })?;
                return self.echo(&expression, &properties, &params);
            }

            self.paginate(expression, properties, params).await
        }
        .boxed()
    }

    /// Read-shaped view of a deferred request's properties.
    fn echo(&self, expression: &Expression, properties: &Properties, params: &Params<'_>) -> Result<Outcome> {
        let item = self
            .pipeline()
            .read_item(Op::Put, &expression.properties, properties, params)?;
        Ok(Outcome::Item(Some(item)))
    }

    async fn paginate(&self, expression: Expression, properties: Properties, params: Params<'_>) -> Result<Outcome> {
        let mut params = params;
        let op = expression.op;
        let mut command = expression.command().clone();
        let client = self.table.client();
        let max_pages = params.max_pages.unwrap_or(SANITY_PAGES);
        let mut budget = params.limit.filter(|_| op.is_range());
        let mut items: Vec<Item> = Vec::new();
        let mut pages = 0;

        let response: Response = loop {
            if let Some(remaining) = budget {
                command.limit = Some(remaining);
            }
            let mut response = client.execute(&command).await?;
            pages += 1;
            log_command(params.log, op, &self.schema.name, &command, "");

            let page_items = std::mem::take(&mut response.items);
            let returned = page_items.len();
            items.extend(page_items);
            if let Some(stats) = params.stats.as_deref_mut() {
                stats.count += response.count.unwrap_or(returned as u64);
                stats.scanned += response.scanned_count.unwrap_or(0);
                stats.capacity += response.consumed_capacity.unwrap_or(0.0);
            }
            if let Some(progress) = &params.progress {
                progress(&Progress {
                    items: &items,
                    pages,
                    stats: params.stats.as_deref(),
                    command: &command,
                });
            }
            if let Some(remaining) = budget.as_mut() {
                *remaining = remaining.saturating_sub(returned);
                if *remaining == 0 {
                    break response;
                }
            }
            match &response.last_evaluated_key {
                Some(key) if op.is_range() && pages < max_pages => {
                    command.exclusive_start_key = Some(key.clone());
                }
                _ => break response,
            }
        };

        match op {
            Op::Find | Op::Scan => {
                self.parse_page(&expression, items, response, &properties, params)
                    .await
            }
            Op::Get => match response.item {
                Some(raw) if params.parse == Some(true) => {
                    Ok(Outcome::Item(self.parse_raw(op, raw, &properties, &params)?))
                }
                raw => Ok(Outcome::Item(raw)),
            },
            Op::Put => {
                if params.parse == Some(true) {
                    self.echo(&expression, &properties, &params)
                } else {
                    Ok(Outcome::Item(Some(command.item)))
                }
            }
            _ => match response.attributes {
                Some(raw) if params.parse == Some(true) => {
                    Ok(Outcome::Item(self.parse_raw(op, raw, &properties, &params)?))
                }
                raw => Ok(Outcome::Item(raw)),
            },
        }
    }

    async fn parse_page(
        &self,
        expression: &Expression,
        items: Vec<Item>,
        response: Response,
        properties: &Properties,
        params: Params<'_>,
    ) -> Result<Outcome> {
        let op = expression.op;
        let index = &expression.index;
        let mut next = response.last_evaluated_key;
        let mut prev = items.first().and_then(|first| self.cursor(first, index));
        let follow = op == Op::Find && params.follow.unwrap_or(index.follow) && !index.is_primary();

        let items = if params.parse == Some(true) {
            let mut read_params = params.detached();
            if follow {
                // Keys only; the primary items are read below
                read_params.hidden = Some(true);
                read_params.follow = Some(true);
            }
            let mut parsed = Vec::with_capacity(items.len());
            for raw in &items {
                if let Some(entry) = self.parse_typed(op, raw, properties, &read_params)? {
                    parsed.push(entry);
                }
            }
            if follow {
                self.follow(parsed, &params).await?
            } else {
                parsed.into_iter().map(|(_, item)| item).collect()
            }
        } else {
            items
        };

        let mut page = Page {
            items,
            next: None,
            prev: None,
            count: params.count.then_some(response.count).flatten(),
        };
        if params.prev.is_some() && op != Op::Scan {
            page.items.reverse();
            std::mem::swap(&mut next, &mut prev);
        }
        page.next = next;
        page.prev = prev;
        Ok(Outcome::Items(page))
    }

    /// Key of `item` on `index` plus the primary key, usable as a start key.
    /// `None` when any of those attributes is absent from the item. An index
    /// without a sort key still yields a cursor from its hash and the primary
    /// key.
    fn cursor(&self, item: &Item, index: &Index) -> Option<Item> {
        let primary = self.table.indexes().primary();
        let mut key = Item::new();
        for attribute in [Some(&index.hash), index.sort.as_ref(), Some(&primary.hash), primary.sort.as_ref()]
            .into_iter()
            .flatten()
        {
            let value = item.get(attribute)?;
            key.insert(attribute.clone(), value.clone());
        }
        Some(key)
    }

    /// Read a stored item as the model its type attribute names. Sentinel
    /// items yield `None`.
    pub(crate) fn parse_typed(
        &self,
        op: Op,
        raw: &Item,
        properties: &Properties,
        params: &Params<'_>,
    ) -> Result<Option<(Model<'a>, Properties)>> {
        let model = match self.type_of(raw) {
            Some(name) if name != self.schema.name => match self.table.model(name) {
                Ok(model) => model,
                Err(_) => *self,
            },
            _ => *self,
        };
        let parsed = self
            .table
            .parse_item(&model.schema.name, op, raw, properties, params)?;
        Ok(parsed.map(|item| (model, item)))
    }

    pub(crate) fn parse_raw(
        &self,
        op: Op,
        raw: Item,
        properties: &Properties,
        params: &Params<'_>,
    ) -> Result<Option<Properties>> {
        Ok(self
            .parse_typed(op, &raw, properties, params)?
            .map(|(_, item)| item))
    }

    fn type_of<'i>(&self, raw: &'i Item) -> Option<&'i str> {
        let attribute = self
            .schema
            .block
            .fields
            .get(&self.schema.type_field)
            .map_or(self.schema.type_field.as_str(), |f| f.attribute.name.as_str());
        raw.get(attribute).and_then(|v| v.as_str())
    }

    /// Replace key-only index items with their primary items, at most
    /// `FOLLOW_THREADS` gets in flight, keeping the index order. Index items
    /// whose primary item is gone are dropped with a warning.
    async fn follow(&self, found: Vec<(Model<'a>, Properties)>, params: &Params<'_>) -> Result<Vec<Properties>> {
        let mut items = Vec::with_capacity(found.len());
        for chunk in found.chunks(FOLLOW_THREADS) {
            let gets = chunk.iter().map(|(model, item)| {
                let mut get_params = params.detached();
                get_params.follow = None;
                get_params.index = None;
                get_params.limit = None;
                get_params.count = false;
                get_params.tunnel.clear();
                async move { model.get(item.clone(), get_params).await }
            });
            for ((model, key), result) in chunk.iter().zip(join_all(gets).await) {
                match result?.into_item() {
                    Some(item) => items.push(item),
                    None => log::warn!(
                        "Follow found no primary item for \"{}\" {}",
                        model.name(),
                        properties_to_json(key)
                    ),
                }
            }
        }
        Ok(items)
    }
}
