//! The sync facade: one entry point for item reads and writes that prefers
//! the remote document store and degrades to local device storage.
//!
//! ## Behaviour
//!
//! - Connectivity is checked once at [`SyncFacade::connect`] and again only on
//!   an explicit [`SyncFacade::reconnect`]. A single failed remote call does
//!   not flip it.
//! - Local storage mirrors every write, whichever backend took it.
//! - Remote failures are logged and never returned to the caller.
//! - [`SyncFacade::sync_pending_items`] promotes local-only items. It is
//!   at-least-once: a crash between the remote insert and the local update
//!   repeats the insert on the next pass.

mod error;
mod facade;

pub use error::SyncError;
pub use facade::{
    ConnectionStatus, SyncFacade, SyncOptions, SyncReport, DEFAULT_COLLECTION,
    DEFAULT_REMOTE_TIMEOUT,
};
