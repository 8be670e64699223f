//! Per-call request options.

use crate::expression::Command;
use crate::hooks::{AttributeTransform, FieldCheck};
use crate::table::{Batch, Transaction};
use crate::value::{Item, Operator, Properties};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Existence precondition on the target item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exists {
    /// The item must already exist
    Required,
    /// The item must not exist
    Absent,
    /// No precondition. On unique updates and removes this also tolerates a
    /// missing prior item.
    Any,
}

/// What a write returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnValue {
    None,
    /// Re-read the item after writing
    Get,
    AllNew,
    AllOld,
}

/// Aggregate counters filled across all pages of a request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Stats {
    pub count: u64,
    pub scanned: u64,
    pub capacity: f64,
}

/// Snapshot handed to the per-page progress callback.
pub struct Progress<'a> {
    pub items: &'a [Item],
    pub pages: usize,
    pub stats: Option<&'a Stats>,
    pub command: &'a Command,
}

pub type ProgressFn = Arc<dyn Fn(&Progress<'_>) + Send + Sync>;

/// Operator hints merged into find properties: operator to property to operand.
pub type Tunnel = BTreeMap<Operator, Properties>;

/// Options for a single call. Containers (`transaction`, `batch`, `stats`)
/// are borrowed from the caller and mutated in place; every other option is
/// owned by the call.
#[derive(Default)]
pub struct Params<'a> {
    /// Apply read transforms to returned items
    pub parse: Option<bool>,
    /// High-level API: missing sort keys fall back to a find
    pub high: Option<bool>,
    pub exists: Option<Exists>,
    pub index: Option<String>,
    pub limit: Option<usize>,
    pub max_pages: Option<usize>,
    pub follow: Option<bool>,
    /// Permit removing several items found by a fallback find
    pub many: bool,
    pub transaction: Option<&'a mut Transaction>,
    pub batch: Option<&'a mut Batch>,
    /// Ambient properties overriding caller properties. Falls back to the
    /// table context when unset.
    pub context: Option<Properties>,
    pub tunnel: Tunnel,
    /// Attribute paths to remove on update. Null properties are appended here.
    pub remove: Vec<String>,
    pub generic: Option<bool>,
    /// Include hidden fields in results
    pub hidden: Option<bool>,
    /// `Some(false)` returns the command without running it
    pub execute: Option<bool>,
    /// `Some(true)` logs at info, unset at trace, `Some(false)` not at all
    pub log: Option<bool>,
    pub stats: Option<&'a mut Stats>,
    pub progress: Option<ProgressFn>,
    pub transform: Option<Arc<dyn AttributeTransform>>,
    pub validate: Option<Arc<dyn FieldCheck>>,
    pub return_value: Option<ReturnValue>,
    /// Start after this key
    pub next: Option<Item>,
    /// Start before this key, iterating backwards
    pub prev: Option<Item>,
    /// Attach the last page's count to the result
    pub count: bool,

    // Pipeline annotations
    pub(crate) fallback: bool,
    /// Set on removes issued by remove-by-find
    pub(crate) retry: bool,
    pub(crate) set_if_not_exists: Properties,
}

impl<'a> Params<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn index(mut self, index: impl Into<String>) -> Self {
        self.index = Some(index.into());
        self
    }

    pub fn exists(mut self, exists: Exists) -> Self {
        self.exists = Some(exists);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn hidden(mut self, hidden: bool) -> Self {
        self.hidden = Some(hidden);
        self
    }

    pub fn follow(mut self, follow: bool) -> Self {
        self.follow = Some(follow);
        self
    }

    pub fn dry_run(mut self) -> Self {
        self.execute = Some(false);
        self
    }

    pub fn returning(mut self, value: ReturnValue) -> Self {
        self.return_value = Some(value);
        self
    }

    pub fn context(mut self, context: Properties) -> Self {
        self.context = Some(context);
        self
    }

    pub fn stats(mut self, stats: &'a mut Stats) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn transaction(mut self, transaction: &'a mut Transaction) -> Self {
        self.transaction = Some(transaction);
        self
    }

    pub fn batch(mut self, batch: &'a mut Batch) -> Self {
        self.batch = Some(batch);
        self
    }

    /// Apply the high-level API defaults for options the caller left unset.
    pub(crate) fn high_level(mut self, exists: Option<Exists>) -> Self {
        self.parse.get_or_insert(true);
        self.high.get_or_insert(true);
        if self.exists.is_none() {
            self.exists = exists;
        }
        self
    }

    /// Whether an update may create the item, so create defaults apply.
    pub(crate) fn may_create(&self) -> bool {
        matches!(self.exists, None | Some(Exists::Any))
    }

    /// Rebind the call to a different transaction container.
    pub(crate) fn with_transaction<'b>(self, transaction: &'b mut Transaction) -> Params<'b>
    where
        'a: 'b,
    {
        let mut params: Params<'b> = self;
        params.transaction = Some(transaction);
        params
    }

    /// Copy of the owned options, without caller containers, cursors or
    /// pipeline annotations.
    pub(crate) fn detached(&self) -> Params<'static> {
        Params {
            parse: self.parse,
            high: self.high,
            exists: self.exists,
            index: self.index.clone(),
            limit: self.limit,
            max_pages: self.max_pages,
            follow: self.follow,
            many: self.many,
            context: self.context.clone(),
            tunnel: self.tunnel.clone(),
            generic: self.generic,
            hidden: self.hidden,
            execute: self.execute,
            log: self.log,
            progress: self.progress.clone(),
            transform: self.transform.clone(),
            validate: self.validate.clone(),
            return_value: self.return_value,
            count: self.count,
            ..Params::default()
        }
    }
}
