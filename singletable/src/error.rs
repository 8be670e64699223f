use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SingleTableError {
    #[error("Schema error: {0}")]
    Schema(String),

    #[error("{0}")]
    Argument(String),

    #[error("{message}")]
    Validation {
        message: String,
        fields: BTreeMap<String, String>,
    },

    #[error("{message}")]
    Missing {
        message: String,
        context: serde_json::Value,
    },

    #[error("{message}")]
    NotFound {
        message: String,
        context: serde_json::Value,
    },

    #[error("{message}")]
    NonUnique {
        message: String,
        context: serde_json::Value,
    },

    #[error("{message}")]
    Unique {
        message: String,
        fields: Vec<String>,
        context: serde_json::Value,
    },

    #[error("Type error: {0}")]
    Type(String),

    #[error("Transaction cancelled: {}", reasons.join(", "))]
    TransactionCanceled { reasons: Vec<String> },

    #[error("Conditional check failed: {0}")]
    ConditionalCheckFailed(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Crypt error: {0}")]
    Crypt(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SingleTableError {
    /// Stable discriminator for programmatic handling.
    pub fn code(&self) -> &'static str {
        match self {
            SingleTableError::Schema(_) | SingleTableError::Argument(_) => "ArgumentError",
            SingleTableError::Validation { .. } => "ValidationError",
            SingleTableError::Missing { .. } => "MissingError",
            SingleTableError::NotFound { .. } => "NotFoundError",
            SingleTableError::NonUnique { .. } => "NonUniqueError",
            SingleTableError::Unique { .. } => "UniqueError",
            SingleTableError::Type(_) => "TypeError",
            SingleTableError::TransactionCanceled { .. } => "TransactionCanceledException",
            SingleTableError::ConditionalCheckFailed(_) => "ConditionalCheckFailedException",
            SingleTableError::Store(_) => "StoreError",
            SingleTableError::Crypt(_) => "CryptError",
            SingleTableError::Io(_) => "IoError",
            SingleTableError::Yaml(_) => "YamlError",
            SingleTableError::Json(_) => "JsonError",
        }
    }

    /// The offending properties/params, when the error carries them.
    pub fn context(&self) -> Option<&serde_json::Value> {
        match self {
            SingleTableError::Missing { context, .. }
            | SingleTableError::NotFound { context, .. }
            | SingleTableError::NonUnique { context, .. }
            | SingleTableError::Unique { context, .. } => Some(context),
            _ => None,
        }
    }

    pub(crate) fn validation(field: &str, message: String) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert(field.to_string(), message.clone());
        SingleTableError::Validation { message, fields }
    }
}

pub type Result<T> = std::result::Result<T, SingleTableError>;
