mod item;
mod sync_status;

pub use item::{strip_reserved, timestamp, Item, Record, RESERVED_FIELDS};
pub use sync_status::SyncStatus;
