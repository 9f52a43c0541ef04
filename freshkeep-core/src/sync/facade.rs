use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::error::SyncError;
use crate::identity::IdentityResolver;
use crate::models::{strip_reserved, timestamp, Item, Record, SyncStatus};
use crate::store::{
    LocalStore, LocalStoreError, OwnerQuery, RemoteError, RemoteStore, SortDirection, ITEMS_KEY,
};

/// Remote collection holding items.
pub const DEFAULT_COLLECTION: &str = "items";

/// Upper bound for any single remote call.
pub const DEFAULT_REMOTE_TIMEOUT: Duration = Duration::from_secs(10);

const OWNER_FIELD: &str = "ownerId";
const DATE_ADDED_FIELD: &str = "dateAdded";
const LAST_MODIFIED_FIELD: &str = "lastModified";
const SYNC_STATUS_FIELD: &str = "syncStatus";
const REMOTE_ID_FIELD: &str = "remoteId";

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub collection: String,
    pub remote_timeout: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            collection: DEFAULT_COLLECTION.to_string(),
            remote_timeout: DEFAULT_REMOTE_TIMEOUT,
        }
    }
}

/// Which backend currently serves reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Remote,
    LocalOnly,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Remote => write!(f, "Connected to remote store"),
            ConnectionStatus::LocalOnly => write!(f, "Offline mode (local storage)"),
        }
    }
}

/// Outcome of a [`SyncFacade::sync_pending_items`] pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    /// Pending items a remote insert was attempted for.
    pub attempted: usize,
    /// `(local id, remote id)` of items now synced.
    pub synced: Vec<(String, String)>,
    /// Local ids of items still pending.
    pub failed: Vec<String>,
}

impl SyncReport {
    pub fn is_empty(&self) -> bool {
        self.attempted == 0
    }
}

/// Dual-backend item storage.
///
/// Every operation succeeds from the caller's point of view; when the remote
/// store is unreachable durability degrades to local-only.
pub struct SyncFacade {
    remote: Option<Arc<dyn RemoteStore>>,
    local: Arc<dyn LocalStore>,
    identity: IdentityResolver,
    options: SyncOptions,
    connected: AtomicBool,
    // Serializes read-modify-write of the local item list. Never held
    // across an await.
    local_lock: Mutex<()>,
}

impl SyncFacade {
    /// Creates a disconnected facade. Call [`reconnect`](Self::reconnect) to
    /// check the remote store.
    pub fn new(
        remote: Option<Arc<dyn RemoteStore>>,
        local: Arc<dyn LocalStore>,
        options: SyncOptions,
    ) -> Self {
        let identity = IdentityResolver::new(local.clone(), remote.clone());
        Self {
            remote,
            local,
            identity,
            options,
            connected: AtomicBool::new(false),
            local_lock: Mutex::new(()),
        }
    }

    /// Creates a facade and checks the remote store once.
    ///
    /// A failed check is not an error: the facade then runs on local
    /// storage until the next [`reconnect`](Self::reconnect).
    pub async fn connect(
        remote: Option<Arc<dyn RemoteStore>>,
        local: Arc<dyn LocalStore>,
        options: SyncOptions,
    ) -> Self {
        let facade = Self::new(remote, local, options);
        facade.reconnect().await;
        facade
    }

    /// Sets the connectivity flag without contacting the remote store.
    pub fn with_connected(self, connected: bool) -> Self {
        self.connected.store(connected, Ordering::SeqCst);
        self
    }

    /// Issues a read-only query and records whether it succeeded.
    pub async fn reconnect(&self) -> bool {
        let connected = match &self.remote {
            None => {
                tracing::debug!("No remote store configured, using local storage");
                false
            }
            Some(remote) => {
                let query = self.owner_query().limit(1);
                match self
                    .call_remote("connectivity check", remote.query(&self.options.collection, &query))
                    .await
                {
                    Ok(_) => {
                        tracing::info!("Connected to remote store");
                        true
                    }
                    Err(e) if e.is_connectivity() => {
                        tracing::warn!("Remote store unavailable, using local storage: {}", e);
                        false
                    }
                    Err(e) => {
                        tracing::warn!("Remote check failed, using local storage: {}", e);
                        false
                    }
                }
            }
        };

        self.connected.store(connected, Ordering::SeqCst);
        connected
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> ConnectionStatus {
        if self.is_connected() {
            ConnectionStatus::Remote
        } else {
            ConnectionStatus::LocalOnly
        }
    }

    pub fn identity(&self) -> &IdentityResolver {
        &self.identity
    }

    pub fn current_user_id(&self) -> String {
        self.identity.current_user_id()
    }

    /// Stores a new item and returns its id.
    ///
    /// The id is remote-assigned when the remote insert succeeds, otherwise
    /// a local timestamp token and the item is `pending`.
    pub async fn add_item(&self, item: Value) -> Result<String, SyncError> {
        let fields = caller_fields(item)?;
        let owner = self.identity.current_user_id();
        let now = Utc::now();

        if let Some(remote) = self.active_remote() {
            let mut item = Item::new(String::new(), fields.clone(), now)
                .with_owner(owner.clone())
                .with_status(SyncStatus::Synced);

            match self
                .call_remote(
                    "insert",
                    remote.insert(&self.options.collection, item.to_record()),
                )
                .await
            {
                Ok(id) => {
                    tracing::debug!("Item added to remote store: {}", id);
                    item.id = id.clone();
                    if let Err(e) = self.mutate_local(|items| {
                        items.push(item);
                        ((), true)
                    }) {
                        tracing::warn!("Failed to mirror item {} locally: {}", id, e);
                    }
                    return Ok(id);
                }
                Err(e) => tracing::warn!("Remote insert failed, storing item locally: {}", e),
            }
        }

        let id = self.mutate_local(|items| {
            let id = next_local_id(items, now);
            items.push(Item::new(id.clone(), fields, now).with_owner(owner));
            (id, true)
        })?;
        tracing::debug!("Item added to local storage: {}", id);
        Ok(id)
    }

    /// Returns the current user's items, newest first when served remotely.
    ///
    /// A successful remote read replaces the local cache. Items still
    /// pending locally are kept and listed after the remote ones.
    pub async fn get_items(&self) -> Vec<Item> {
        if let Some(remote) = self.active_remote() {
            let query = self
                .owner_query()
                .order_by(DATE_ADDED_FIELD, SortDirection::Descending);

            match self
                .call_remote("query", remote.query(&self.options.collection, &query))
                .await
            {
                Ok(documents) => return self.refresh_cache(documents),
                Err(e) => tracing::warn!("Remote query failed, reading local storage: {}", e),
            }
        }

        self.local_items()
    }

    /// Items as currently held in local storage, in stored order.
    pub fn local_items(&self) -> Vec<Item> {
        self.load_items().unwrap_or_else(|e| {
            tracing::warn!("Failed to read local storage: {}", e);
            Vec::new()
        })
    }

    pub fn pending_count(&self) -> usize {
        self.local_items().iter().filter(|i| i.is_pending()).count()
    }

    /// Deletes an item. Unknown ids are a no-op.
    pub async fn delete_item(&self, id: &str) {
        if let Some(remote) = self.active_remote() {
            match self.remote_target(id) {
                Some(target) => match self
                    .call_remote("delete", remote.delete(&self.options.collection, &target))
                    .await
                {
                    Ok(()) => tracing::debug!("Item deleted from remote store: {}", target),
                    Err(e) => tracing::warn!("Remote delete of {} failed: {}", target, e),
                },
                None => tracing::debug!("Item {} was never synced, skipping remote delete", id),
            }
        }

        let result = self.mutate_local(|items| {
            let before = items.len();
            items.retain(|item| item.id != id);
            let removed = items.len() != before;
            (removed, removed)
        });
        match result {
            Ok(true) => tracing::debug!("Item deleted from local storage: {}", id),
            Ok(false) => tracing::debug!("Item {} not in local storage", id),
            Err(e) => tracing::warn!("Failed to delete item {} locally: {}", id, e),
        }
    }

    /// Merges `partial` into an item and stamps `lastModified`.
    /// Unknown ids are a no-op.
    pub async fn update_item(&self, id: &str, partial: Value) -> Result<(), SyncError> {
        let fields = caller_fields(partial)?;
        let now = Utc::now();

        if let Some(remote) = self.active_remote() {
            match self.remote_target(id) {
                Some(target) => {
                    let mut record = fields.clone();
                    record.insert(
                        LAST_MODIFIED_FIELD.to_string(),
                        Value::String(timestamp::format(&now)),
                    );
                    record.insert(
                        SYNC_STATUS_FIELD.to_string(),
                        Value::String(SyncStatus::Synced.to_string()),
                    );

                    match self
                        .call_remote(
                            "update",
                            remote.update(&self.options.collection, &target, record),
                        )
                        .await
                    {
                        Ok(()) => tracing::debug!("Item updated in remote store: {}", target),
                        Err(e) => tracing::warn!("Remote update of {} failed: {}", target, e),
                    }
                }
                None => tracing::debug!("Item {} was never synced, skipping remote update", id),
            }
        }

        let result = self.mutate_local(|items| match items.iter_mut().find(|i| i.id == id) {
            Some(item) => {
                item.merge(&fields, now);
                (true, true)
            }
            None => (false, false),
        });
        match result {
            Ok(true) => tracing::debug!("Item updated in local storage: {}", id),
            Ok(false) => tracing::debug!("Item {} not in local storage", id),
            Err(e) => tracing::warn!("Failed to update item {} locally: {}", id, e),
        }

        Ok(())
    }

    /// Pushes every pending local item to the remote store, one at a time.
    ///
    /// Each item is two-phase: remote insert, then local promotion to
    /// `synced` with its `remoteId`. A failed item stays pending and does not
    /// stop the others.
    pub async fn sync_pending_items(&self) -> SyncReport {
        let mut report = SyncReport::default();

        let Some(remote) = self.active_remote() else {
            tracing::debug!("Not connected, skipping pending sync");
            return report;
        };

        let pending: Vec<Item> = match self.load_items() {
            Ok(items) => items.into_iter().filter(Item::is_pending).collect(),
            Err(e) => {
                tracing::warn!("Failed to read local storage: {}", e);
                return report;
            }
        };
        if pending.is_empty() {
            return report;
        }

        tracing::info!("Syncing {} pending items", pending.len());
        let owner = self.identity.current_user_id();

        for item in pending {
            report.attempted += 1;

            let mut record = item.to_record();
            record.insert(OWNER_FIELD.to_string(), Value::String(owner.clone()));
            record.insert(
                SYNC_STATUS_FIELD.to_string(),
                Value::String(SyncStatus::Synced.to_string()),
            );
            record.remove(REMOTE_ID_FIELD);

            let remote_id = match self
                .call_remote("insert", remote.insert(&self.options.collection, record))
                .await
            {
                Ok(id) => id,
                Err(e) => {
                    tracing::warn!("Failed to sync item {}: {}", item.id, e);
                    report.failed.push(item.id);
                    continue;
                }
            };

            // If this fails the item stays pending and the next pass inserts
            // it again.
            let promoted = self.mutate_local(|items| {
                match items.iter_mut().find(|i| i.id == item.id) {
                    Some(local) => {
                        local.remote_id = Some(remote_id.clone());
                        local.sync_status = SyncStatus::Synced;
                        (true, true)
                    }
                    None => (false, false),
                }
            });

            match promoted {
                Ok(found) => {
                    if found {
                        tracing::debug!("Synced item {} as {}", item.id, remote_id);
                    } else {
                        tracing::debug!("Item {} was removed locally during sync", item.id);
                    }
                    report.synced.push((item.id, remote_id));
                }
                Err(e) => {
                    tracing::warn!(
                        "Item {} reached the remote store as {} but could not be marked synced: {}",
                        item.id,
                        remote_id,
                        e
                    );
                    report.failed.push(item.id);
                }
            }
        }

        tracing::info!(
            "Pending sync finished: {} synced, {} failed",
            report.synced.len(),
            report.failed.len()
        );
        report
    }

    fn active_remote(&self) -> Option<&Arc<dyn RemoteStore>> {
        if self.is_connected() {
            self.remote.as_ref()
        } else {
            None
        }
    }

    fn owner_query(&self) -> OwnerQuery {
        OwnerQuery::new(OWNER_FIELD, self.identity.current_user_id())
    }

    /// Runs a remote call under the configured timeout.
    async fn call_remote<T, F>(&self, operation: &str, call: F) -> Result<T, RemoteError>
    where
        F: Future<Output = Result<T, RemoteError>>,
    {
        let limit = self.options.remote_timeout;
        match tokio::time::timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => {
                tracing::debug!("Remote {} timed out after {:?}", operation, limit);
                Err(RemoteError::Timeout(limit))
            }
        }
    }

    /// Id to use remotely for an item: its `remoteId` if a late sync
    /// recorded one, the id itself if synced or unknown locally, `None` if
    /// the item only exists locally.
    fn remote_target(&self, id: &str) -> Option<String> {
        let items = match self.load_items() {
            Ok(items) => items,
            Err(_) => return Some(id.to_string()),
        };

        match items.into_iter().find(|item| item.id == id) {
            Some(item) if item.is_pending() => None,
            Some(item) => Some(item.remote_id.unwrap_or(item.id)),
            None => Some(id.to_string()),
        }
    }

    fn refresh_cache(&self, documents: Vec<(String, Record)>) -> Vec<Item> {
        let mut items: Vec<Item> = documents
            .into_iter()
            .filter_map(|(id, record)| match Item::from_record(id.clone(), record) {
                Ok(mut item) => {
                    item.sync_status = SyncStatus::Synced;
                    item.remote_id = None;
                    Some(item)
                }
                Err(e) => {
                    tracing::warn!("Skipping malformed remote item {}: {}", id, e);
                    None
                }
            })
            .collect();
        let fetched = items.len();

        let result = self.mutate_local(|local| {
            items.extend(local.drain(..).filter(Item::is_pending));
            *local = items.clone();
            ((), true)
        });
        match result {
            Ok(()) => tracing::debug!("Cached {} remote items locally", fetched),
            Err(e) => tracing::warn!("Failed to cache remote items locally: {}", e),
        }

        items
    }

    fn load_items(&self) -> Result<Vec<Item>, LocalStoreError> {
        match self.local.read(ITEMS_KEY)? {
            Some(raw) => Ok(decode_items(&raw)),
            None => Ok(Vec::new()),
        }
    }

    /// Read-modify-write of the local item list. `f` returns its result and
    /// whether the list changed; unchanged lists are not written back.
    fn mutate_local<T>(
        &self,
        f: impl FnOnce(&mut Vec<Item>) -> (T, bool),
    ) -> Result<T, LocalStoreError> {
        let _guard = self.local_lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut items = self.load_items()?;
        let (result, changed) = f(&mut items);
        if changed {
            let raw = serde_json::to_string(&items)?;
            self.local.write(ITEMS_KEY, &raw)?;
        }
        Ok(result)
    }
}

/// Validates caller input and drops sync-owned fields from it.
fn caller_fields(value: Value) -> Result<Record, SyncError> {
    match value {
        Value::Object(mut fields) => {
            let dropped = strip_reserved(&mut fields);
            if !dropped.is_empty() {
                tracing::debug!("Ignoring reserved fields in input: {:?}", dropped);
            }
            Ok(fields)
        }
        other => Err(SyncError::InvalidInput(format!(
            "expected a JSON object, got {}",
            json_kind(&other)
        ))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Decodes the stored item list. Unparsable content counts as empty and
/// unparsable entries are skipped.
fn decode_items(raw: &str) -> Vec<Item> {
    let values: Vec<Value> = match serde_json::from_str(raw) {
        Ok(values) => values,
        Err(e) => {
            tracing::warn!("Local item list is unreadable, treating as empty: {}", e);
            return Vec::new();
        }
    };

    values
        .into_iter()
        .filter_map(|value| match serde_json::from_value::<Item>(value) {
            Ok(item) => Some(item),
            Err(e) => {
                tracing::warn!("Skipping malformed local item: {}", e);
                None
            }
        })
        .collect()
}

/// Millisecond timestamp token, bumped past any id already in use.
fn next_local_id(items: &[Item], now: DateTime<Utc>) -> String {
    let mut millis = now.timestamp_millis();
    loop {
        let id = millis.to_string();
        if !items.iter().any(|item| item.id == id) {
            return id;
        }
        millis += 1;
    }
}
