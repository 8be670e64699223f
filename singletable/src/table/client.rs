use crate::error::Result;
use crate::expression::Command;
use crate::value::Item;
use async_trait::async_trait;

/// Whether a transaction reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactMode {
    Read,
    Write,
}

/// A store reply. Range operations fill `items` and the counters, point
/// operations fill `item` (get) or `attributes` (returned values of a write),
/// transactional and batched reads fill `responses` in request order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Response {
    pub items: Vec<Item>,
    pub item: Option<Item>,
    pub attributes: Option<Item>,
    pub count: Option<u64>,
    pub scanned_count: Option<u64>,
    pub consumed_capacity: Option<f64>,
    pub last_evaluated_key: Option<Item>,
    pub responses: Vec<Option<Item>>,
}

/// The key-value store behind a table.
///
/// Implementations translate [`Command`] documents into native requests.
/// A cancelled transaction must be reported as
/// [`SingleTableError::TransactionCanceled`](crate::SingleTableError::TransactionCanceled)
/// with one reason per command, so uniqueness violations can be recognized.
#[async_trait]
pub trait StoreClient: Send + Sync {
    async fn execute(&self, command: &Command) -> Result<Response>;

    async fn transact(&self, mode: TransactMode, commands: &[Command]) -> Result<Response>;

    async fn batch_get(&self, commands: &[Command]) -> Result<Response>;

    async fn batch_write(&self, commands: &[Command]) -> Result<Response>;
}
