//! Storage backends behind the sync facade.
//!
//! - [`local`]: device key-value storage (file or memory backed)
//! - [`remote`]: the document-store contract
//! - [`firestore`]: Cloud Firestore implementation of that contract

pub mod firestore;
pub mod local;
pub mod remote;

pub use firestore::FirestoreStore;
pub use local::{
    FileStore, LocalStore, LocalStoreError, MemoryStore, DEVICE_ID_KEY, ITEMS_KEY, SESSION_KEY,
};
pub use remote::{OwnerQuery, RemoteError, RemoteStore, SortDirection};
