//! Errors a caller of the sync facade can see.
//!
//! Remote failures never show up here; they end in a local fallback.

use thiserror::Error;

use crate::store::LocalStoreError;

#[derive(Error, Debug)]
pub enum SyncError {
    /// The caller passed something that is not a JSON object.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The item could be stored neither remotely nor locally.
    #[error("Item could not be stored: {0}")]
    Storage(#[from] LocalStoreError),
}
