//! Error types for the proxy.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Alias error: {0}")]
    Alias(#[from] AliasError),

    #[error("Archive error: {0}")]
    Archive(#[from] ArchiveError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Control plane error: {0}")]
    Control(#[from] ControlError),

    #[error("Forward error: {0}")]
    Forward(#[from] ForwardError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-related errors. Any of these prevents processing.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Alias store errors. A missing record is not an error.
#[derive(Debug, thiserror::Error)]
pub enum AliasError {
    #[error("Invalid recipient address: {0:?}")]
    InvalidAddress(String),

    #[error("Alias store {store} failed: {reason}")]
    Backend { store: String, reason: String },

    #[error("Alias lookup timed out after {0:?}")]
    Timeout(Duration),
}

/// Raw message archive errors.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("Archive object not found: {key}")]
    NotFound { key: String },

    #[error("Archive unavailable for {key}: {reason}")]
    Unavailable { key: String, reason: String },

    #[error("Invalid archive key: {0:?}")]
    InvalidKey(String),

    #[error("Archive read timed out after {0:?}")]
    Timeout(Duration),
}

/// Errors from the mail-sending side.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Message rejected by sender: {reason}")]
    Rejected { reason: String },

    #[error("Invalid envelope address {address:?}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("Transient send failure: {reason}")]
    Transient { reason: String },

    #[error("Send timed out after {0:?}")]
    Timeout(Duration),
}

/// Control-plane errors raised while activating a rule set.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("Rule set {name} does not exist")]
    RuleSetNotFound { name: String },

    #[error("Invalid rule set: {0}")]
    InvalidRuleSet(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Message-level forwarding failures.
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("No deliverable recipients for message {message_id}")]
    NoDeliverableRecipients { message_id: String },

    #[error("Body of message {message_id} could not be loaded: {source}")]
    BodyMissing {
        message_id: String,
        #[source]
        source: ArchiveError,
    },

    #[error("Message too large: {size} bytes exceeds {max}")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Dispatch failed: {0}")]
    Dispatch(#[from] DispatchError),
}

/// Result type alias for the proxy.
pub type Result<T> = std::result::Result<T, Error>;
