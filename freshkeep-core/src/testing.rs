//! Test doubles: an in-memory remote store and a local store, both with
//! scriptable failures, plus a stub HTTP server helper.

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use crate::models::Record;
use crate::store::{
    LocalStore, LocalStoreError, MemoryStore, OwnerQuery, RemoteError, RemoteStore, SortDirection,
};

/// Serves `router` on an ephemeral local port and returns its base URL.
pub async fn serve(router: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}

/// Local store whose reads or writes can be switched to fail.
#[derive(Default)]
pub struct FailingStore {
    inner: MemoryStore,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl FailingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Covers both `write` and `remove`.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn error(key: &str) -> LocalStoreError {
        LocalStoreError::Io(PathBuf::from(key), io::Error::other("disk unavailable"))
    }
}

impl LocalStore for FailingStore {
    fn read(&self, key: &str) -> Result<Option<String>, LocalStoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(Self::error(key));
        }
        self.inner.read(key)
    }

    fn write(&self, key: &str, value: &str) -> Result<(), LocalStoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Self::error(key));
        }
        self.inner.write(key, value)
    }

    fn remove(&self, key: &str) -> Result<(), LocalStoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Self::error(key));
        }
        self.inner.remove(key)
    }
}

#[derive(Default)]
struct FakeState {
    documents: Vec<(String, String, Record)>,
    next_id: u64,
    user: Option<String>,
    offline: bool,
    hang: bool,
    failing_names: Vec<String>,
    calls: Vec<String>,
}

#[derive(Default)]
pub struct FakeRemote {
    state: Mutex<FakeState>,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call fails with `Unreachable`.
    pub fn offline() -> Self {
        let remote = Self::new();
        remote.set_offline(true);
        remote
    }

    pub fn set_offline(&self, offline: bool) {
        self.state.lock().unwrap().offline = offline;
    }

    /// Calls never complete.
    pub fn set_hang(&self, hang: bool) {
        self.state.lock().unwrap().hang = hang;
    }

    pub fn set_user(&self, user: Option<&str>) {
        self.state.lock().unwrap().user = user.map(str::to_string);
    }

    /// Inserts of records whose `name` equals `name` fail.
    pub fn fail_inserts_named(&self, name: &str) {
        self.state.lock().unwrap().failing_names.push(name.to_string());
    }

    pub fn seed(&self, collection: &str, id: &str, record: Record) {
        self.state
            .lock()
            .unwrap()
            .documents
            .push((collection.to_string(), id.to_string(), record));
    }

    pub fn documents(&self, collection: &str) -> Vec<(String, Record)> {
        self.state
            .lock()
            .unwrap()
            .documents
            .iter()
            .filter(|(c, _, _)| c == collection)
            .map(|(_, id, record)| (id.clone(), record.clone()))
            .collect()
    }

    pub fn document(&self, collection: &str, id: &str) -> Option<Record> {
        self.documents(collection)
            .into_iter()
            .find(|(doc_id, _)| doc_id == id)
            .map(|(_, record)| record)
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    /// Records the call and returns the configured failure, if any.
    async fn enter(&self, call: String) -> Result<(), RemoteError> {
        let (offline, hang) = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(call);
            (state.offline, state.hang)
        };
        if hang {
            std::future::pending::<()>().await;
        }
        if offline {
            return Err(RemoteError::Unreachable("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for FakeRemote {
    async fn insert(&self, collection: &str, record: Record) -> Result<String, RemoteError> {
        self.enter(format!("insert {}", collection)).await?;

        let mut state = self.state.lock().unwrap();
        let name = record.get("name").and_then(Value::as_str).unwrap_or_default();
        if state.failing_names.iter().any(|n| n == name) {
            return Err(RemoteError::Rejected(format!("insert of '{}' refused", name)));
        }

        state.next_id += 1;
        let id = format!("remote-{}", state.next_id);
        state
            .documents
            .push((collection.to_string(), id.clone(), record));
        Ok(id)
    }

    async fn query(
        &self,
        collection: &str,
        query: &OwnerQuery,
    ) -> Result<Vec<(String, Record)>, RemoteError> {
        self.enter(format!("query {}", collection)).await?;

        let mut matches: Vec<(String, Record)> = self
            .documents(collection)
            .into_iter()
            .filter(|(_, record)| {
                record.get(&query.owner_field).and_then(Value::as_str) == Some(query.owner.as_str())
            })
            .collect();

        if let Some((field, direction)) = &query.order_by {
            matches.sort_by(|(_, a), (_, b)| {
                let a = a.get(field).and_then(Value::as_str).unwrap_or_default();
                let b = b.get(field).and_then(Value::as_str).unwrap_or_default();
                match direction {
                    SortDirection::Ascending => a.cmp(b),
                    SortDirection::Descending => b.cmp(a),
                }
            });
        }
        if let Some(limit) = query.limit {
            matches.truncate(limit);
        }

        Ok(matches)
    }

    async fn update(&self, collection: &str, id: &str, partial: Record) -> Result<(), RemoteError> {
        self.enter(format!("update {}/{}", collection, id)).await?;

        let mut state = self.state.lock().unwrap();
        let (_, _, record) = state
            .documents
            .iter_mut()
            .find(|(c, doc_id, _)| c == collection && doc_id == id)
            .ok_or_else(|| RemoteError::NotFound(format!("{}/{}", collection, id)))?;
        record.extend(partial);
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), RemoteError> {
        self.enter(format!("delete {}/{}", collection, id)).await?;

        let mut state = self.state.lock().unwrap();
        state
            .documents
            .retain(|(c, doc_id, _)| !(c == collection && doc_id == id));
        Ok(())
    }

    fn current_user_id(&self) -> Option<String> {
        self.state.lock().unwrap().user.clone()
    }
}
