//! FreshKeep Core Library
//!
//! Grocery item storage that prefers a remote document store and falls back
//! to local storage, with deferred sync of items saved while offline.

pub mod auth;
pub mod identity;
pub mod models;
pub mod store;
pub mod sync;

#[cfg(test)]
mod testing;

pub use auth::{AuthClient, AuthError, AuthSession};
pub use identity::{generate_guest_id, IdentityResolver};
pub use models::{Item, Record, SyncStatus};
pub use store::{
    FileStore, FirestoreStore, LocalStore, LocalStoreError, MemoryStore, OwnerQuery, RemoteError,
    RemoteStore, SortDirection,
};
pub use sync::{ConnectionStatus, SyncError, SyncFacade, SyncOptions, SyncReport};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
