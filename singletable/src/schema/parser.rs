use super::types::SchemaDefinition;
use crate::error::{Result, SingleTableError};
use std::path::Path;

/// Parse a schema YAML file into a SchemaDefinition
pub fn parse_schema(path: &Path) -> Result<SchemaDefinition> {
    let content = std::fs::read_to_string(path)?;
    parse_schema_str(&content)
}

/// Parse a schema YAML string into a SchemaDefinition
pub fn parse_schema_str(content: &str) -> Result<SchemaDefinition> {
    let schema: SchemaDefinition = serde_yaml::from_str(content)?;
    if !schema.indexes.contains_key("primary") {
        return Err(SingleTableError::Schema(
            "Indexes must define a primary index".to_string(),
        ));
    }
    Ok(schema)
}
