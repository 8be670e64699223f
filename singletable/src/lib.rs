pub mod error;
pub mod value;
pub mod schema;
pub mod template;
pub mod pipeline;
pub mod validation;
pub mod expression;
pub mod params;
pub mod hooks;
pub mod table;
pub mod model;
pub mod memory;

pub use error::{Result, SingleTableError};
pub use expression::{Command, Op};
pub use memory::MemoryStore;
pub use model::{Model, Outcome, Page};
pub use params::{Exists, Params, ReturnValue, Stats};
pub use schema::{parse_schema, parse_schema_str, SchemaDefinition};
pub use table::{Batch, StoreClient, Table, TableOptions, TransactMode, Transaction};
pub use value::{to_properties, Condition, Item, Operator, Properties, Value};
