pub mod compile;
pub mod parser;
pub mod types;

pub use compile::{
    Attribute, Block, Field, FieldValue, Index, Indexes, ModelOptions, ModelSchema, PRIMARY,
};
pub use parser::{parse_schema, parse_schema_str};
pub use types::*;
