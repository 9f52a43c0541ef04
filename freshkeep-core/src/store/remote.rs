//! Contract for the network-backed document store.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::Record;

/// Errors reported by a remote store adapter.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RemoteError {
    #[error("Remote store unreachable: {0}")]
    Unreachable(String),

    #[error("Remote store rejected the request: {0}")]
    Rejected(String),

    #[error("Remote document not found: {0}")]
    NotFound(String),

    #[error("Remote call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Malformed remote response: {0}")]
    Decode(String),
}

impl RemoteError {
    /// True for failures meaning the remote cannot be used right now
    /// (unreachable, auth rejected, timed out).
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            RemoteError::Unreachable(_)
                | RemoteError::Rejected(_)
                | RemoteError::Timeout(_)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

/// A query for one owner's documents.
#[derive(Debug, Clone, PartialEq)]
pub struct OwnerQuery {
    pub owner_field: String,
    pub owner: String,
    pub order_by: Option<(String, SortDirection)>,
    pub limit: Option<usize>,
}

impl OwnerQuery {
    pub fn new(owner_field: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            owner_field: owner_field.into(),
            owner: owner.into(),
            order_by: None,
            limit: None,
        }
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.order_by = Some((field.into(), direction));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// A document database holding records in named collections.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Creates a document and returns the id the store assigned to it.
    async fn insert(&self, collection: &str, record: Record) -> Result<String, RemoteError>;

    /// Returns `(id, record)` pairs matching the query.
    async fn query(
        &self,
        collection: &str,
        query: &OwnerQuery,
    ) -> Result<Vec<(String, Record)>, RemoteError>;

    /// Merges `partial` into an existing document.
    async fn update(&self, collection: &str, id: &str, partial: Record) -> Result<(), RemoteError>;

    async fn delete(&self, collection: &str, id: &str) -> Result<(), RemoteError>;

    /// The uid of the signed-in user, if any.
    fn current_user_id(&self) -> Option<String>;
}
