//! Error types for the meshspace workspace store

use thiserror::Error;

use crate::types::{ChannelId, MessageId};

/// Main error type for workspace store operations
#[derive(Error, Debug)]
pub enum StoreError {
    /// Session has not been initialized (or was torn down)
    #[error("Session not initialized")]
    NotInitialized,

    /// Channel was not found in the workspace document
    #[error("Channel not found: {0}")]
    ChannelNotFound(ChannelId),

    /// Message was not found in the channel (or its thread)
    #[error("Message not found: {0}")]
    MessageNotFound(MessageId),

    /// Thread parent is missing, or is itself a thread reply
    #[error("Thread parent not found or not a root message: {0}")]
    ParentNotFound(MessageId),

    /// Channel is archived and rejects message mutations
    #[error("Channel is archived: {0}")]
    ChannelArchived(ChannelId),

    /// Transport/persistence/identity collaborator failed
    #[error("Collaborator failure: {0}")]
    Collaborator(String),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Automerge document error
    #[error("Document error: {0}")]
    Document(String),

    /// Database creation/opening error
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Transaction error
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Table error
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    /// Storage operation error
    #[error("Storage operation error: {0}")]
    StorageOp(#[from] redb::StorageError),

    /// Commit error
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using StoreError
pub type StoreResult<T> = Result<T, StoreError>;
