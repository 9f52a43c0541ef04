//! Cloud Firestore adapter over the REST API.
//!
//! Records are plain JSON objects on our side. Firestore stores typed values
//! (`stringValue`, `integerValue`, `mapValue`, ...), so every request and
//! response passes through [`encode_fields`] / [`decode_fields`].
//!
//! Endpoints used, relative to
//! `{endpoint}/v1/projects/{project}/databases/(default)/documents`:
//! - `POST /{collection}`: create with a server-assigned id
//! - `POST :runQuery`: structured query
//! - `PATCH /{collection}/{id}?updateMask.fieldPaths=...`: partial update
//! - `DELETE /{collection}/{id}`

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::{json, Map, Value};
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

use super::local::LocalStore;
use super::remote::{OwnerQuery, RemoteError, RemoteStore, SortDirection};
use crate::auth::{AuthClient, AuthSession};
use crate::models::Record;

/// Public Firestore endpoint.
pub const DEFAULT_ENDPOINT: &str = "https://firestore.googleapis.com";

/// Fields stored as Firestore timestamps rather than strings.
const TIMESTAMP_FIELDS: [&str; 2] = ["dateAdded", "lastModified"];

pub struct FirestoreStore {
    http: Client,
    endpoint: String,
    project_id: String,
    api_key: String,
    session: RwLock<Option<AuthSession>>,
    refresher: Option<SessionRefresher>,
}

/// Renews an expired session and keeps the stored copy current.
struct SessionRefresher {
    client: AuthClient,
    store: Arc<dyn LocalStore>,
}

impl FirestoreStore {
    pub fn new(project_id: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            project_id: project_id.into(),
            api_key: api_key.into(),
            session: RwLock::new(None),
            refresher: None,
        }
    }

    /// Points the adapter at another host, e.g. the local emulator.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into().trim_end_matches('/').to_string();
        self
    }

    /// Sends requests on behalf of a signed-in user.
    pub fn with_session(mut self, session: Option<AuthSession>) -> Self {
        self.session = RwLock::new(session);
        self
    }

    /// Renews the session through `client` when a request comes back 401,
    /// saving the renewed session to `store`.
    pub fn with_session_refresh(mut self, client: AuthClient, store: Arc<dyn LocalStore>) -> Self {
        self.refresher = Some(SessionRefresher { client, store });
        self
    }

    /// The session requests are currently sent with.
    pub fn session(&self) -> Option<AuthSession> {
        self.session
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn documents_url(&self) -> String {
        format!(
            "{}/v1/projects/{}/databases/(default)/documents",
            self.endpoint,
            urlencoding::encode(&self.project_id)
        )
    }

    fn collection_url(&self, collection: &str) -> String {
        format!(
            "{}/{}?key={}",
            self.documents_url(),
            urlencoding::encode(collection),
            urlencoding::encode(&self.api_key)
        )
    }

    fn document_url(&self, collection: &str, id: &str) -> String {
        format!(
            "{}/{}/{}?key={}",
            self.documents_url(),
            urlencoding::encode(collection),
            urlencoding::encode(id),
            urlencoding::encode(&self.api_key)
        )
    }

    fn query_url(&self) -> String {
        format!(
            "{}:runQuery?key={}",
            self.documents_url(),
            urlencoding::encode(&self.api_key)
        )
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match self.session() {
            Some(session) => request.bearer_auth(session.id_token),
            None => request,
        }
    }

    async fn execute(&self, request: RequestBuilder) -> Result<Response, RemoteError> {
        self.authorize(request)
            .send()
            .await
            .map_err(|e| RemoteError::Unreachable(e.to_string()))
    }

    /// Sends `request`, retrying once with a renewed token if the current
    /// one was rejected as expired.
    async fn send(&self, request: RequestBuilder, target: &str) -> Result<Response, RemoteError> {
        let retry = request.try_clone();
        let mut response = self.execute(request).await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            if let Some(retry) = retry {
                if self.refresh_session().await {
                    response = self.execute(retry).await?;
                }
            }
        }

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(status_error(status, &body, target))
    }

    /// Returns true once a renewed session is in place.
    async fn refresh_session(&self) -> bool {
        let Some(refresher) = &self.refresher else {
            return false;
        };
        let Some(session) = self.session().filter(|s| s.refresh_token.is_some()) else {
            return false;
        };

        match refresher.client.refresh(&session).await {
            Ok(renewed) => {
                if let Err(e) = renewed.save(refresher.store.as_ref()) {
                    warn!("Failed to save refreshed session: {}", e);
                }
                info!("Refreshed session for {}", renewed.uid);
                *self.session.write().unwrap_or_else(|e| e.into_inner()) = Some(renewed);
                true
            }
            Err(e) => {
                warn!("Session refresh failed, sign in again: {}", e);
                false
            }
        }
    }

    async fn read_json(response: Response) -> Result<Value, RemoteError> {
        response
            .json::<Value>()
            .await
            .map_err(|e| RemoteError::Decode(e.to_string()))
    }
}

#[async_trait]
impl RemoteStore for FirestoreStore {
    async fn insert(&self, collection: &str, record: Record) -> Result<String, RemoteError> {
        let body = json!({ "fields": encode_fields(&record) });
        let request = self.http.post(self.collection_url(collection)).json(&body);

        let response = self.send(request, collection).await?;
        let document = Self::read_json(response).await?;

        document
            .get("name")
            .and_then(Value::as_str)
            .and_then(document_id)
            .map(str::to_string)
            .ok_or_else(|| RemoteError::Decode("created document has no name".to_string()))
    }

    async fn query(
        &self,
        collection: &str,
        query: &OwnerQuery,
    ) -> Result<Vec<(String, Record)>, RemoteError> {
        let body = structured_query(collection, query);
        let request = self.http.post(self.query_url()).json(&body);

        let response = self.send(request, collection).await?;
        let results = Self::read_json(response).await?;

        decode_query_results(&results)
    }

    async fn update(&self, collection: &str, id: &str, partial: Record) -> Result<(), RemoteError> {
        let mut url = self.document_url(collection, id);
        for key in partial.keys() {
            url.push_str("&updateMask.fieldPaths=");
            url.push_str(&urlencoding::encode(&field_path(key)));
        }
        // Without this PATCH would create a fresh document for an unknown id.
        url.push_str("&currentDocument.exists=true");

        let body = json!({ "fields": encode_fields(&partial) });
        let request = self.http.patch(url).json(&body);

        self.send(request, &format!("{}/{}", collection, id)).await?;
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), RemoteError> {
        let request = self.http.delete(self.document_url(collection, id));
        self.send(request, &format!("{}/{}", collection, id)).await?;
        Ok(())
    }

    fn current_user_id(&self) -> Option<String> {
        self.session().map(|s| s.uid)
    }
}

/// Maps a non-success HTTP status to a [`RemoteError`].
fn status_error(status: StatusCode, body: &str, target: &str) -> RemoteError {
    let message = error_message(body).unwrap_or_else(|| status.to_string());

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RemoteError::Rejected(message),
        StatusCode::NOT_FOUND => RemoteError::NotFound(target.to_string()),
        // Precondition failure from `currentDocument.exists=true`.
        StatusCode::BAD_REQUEST if message.contains("NOT_FOUND") => {
            RemoteError::NotFound(target.to_string())
        }
        s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => {
            RemoteError::Unreachable(message)
        }
        _ => RemoteError::Rejected(message),
    }
}

/// Extracts `error.message` from a Google API error body.
fn error_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    let error = value.get("error")?;
    let message = error.get("message").and_then(Value::as_str)?;
    match error.get("status").and_then(Value::as_str) {
        Some(status) => Some(format!("{}: {}", status, message)),
        None => Some(message.to_string()),
    }
}

/// The last segment of a document resource name.
fn document_id(name: &str) -> Option<&str> {
    name.rsplit('/').next().filter(|id| !id.is_empty())
}

/// Quotes a field name for use in a field path when it is not a plain
/// identifier.
fn field_path(name: &str) -> String {
    let simple = name
        .chars()
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false)
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');

    if simple {
        name.to_string()
    } else {
        format!("`{}`", name.replace('\\', "\\\\").replace('`', "\\`"))
    }
}

fn structured_query(collection: &str, query: &OwnerQuery) -> Value {
    let mut structured = json!({
        "from": [{ "collectionId": collection }],
        "where": {
            "fieldFilter": {
                "field": { "fieldPath": field_path(&query.owner_field) },
                "op": "EQUAL",
                "value": { "stringValue": query.owner }
            }
        }
    });

    if let Some((field, direction)) = &query.order_by {
        let direction = match direction {
            SortDirection::Ascending => "ASCENDING",
            SortDirection::Descending => "DESCENDING",
        };
        structured["orderBy"] = json!([{
            "field": { "fieldPath": field_path(field) },
            "direction": direction
        }]);
    }

    if let Some(limit) = query.limit {
        structured["limit"] = json!(limit);
    }

    json!({ "structuredQuery": structured })
}

/// Decodes a `runQuery` response: an array whose entries may or may not
/// carry a `document` (a bare `readTime` entry means no match).
fn decode_query_results(results: &Value) -> Result<Vec<(String, Record)>, RemoteError> {
    let entries = results
        .as_array()
        .ok_or_else(|| RemoteError::Decode("runQuery response is not an array".to_string()))?;

    let mut documents = Vec::new();
    for entry in entries {
        let Some(document) = entry.get("document") else {
            continue;
        };

        let id = document
            .get("name")
            .and_then(Value::as_str)
            .and_then(document_id)
            .ok_or_else(|| RemoteError::Decode("document has no name".to_string()))?;

        let fields = match document.get("fields") {
            Some(Value::Object(fields)) => decode_fields(fields)?,
            _ => Record::new(),
        };

        documents.push((id.to_string(), fields));
    }

    Ok(documents)
}

/// Encodes a JSON object as a Firestore `fields` map.
pub fn encode_fields(record: &Record) -> Map<String, Value> {
    record
        .iter()
        .map(|(key, value)| {
            let encoded = match value {
                Value::String(s) if TIMESTAMP_FIELDS.contains(&key.as_str()) => {
                    json!({ "timestampValue": s })
                }
                other => encode_value(other),
            };
            (key.clone(), encoded)
        })
        .collect()
}

/// Encodes one JSON value as a Firestore typed value.
pub fn encode_value(value: &Value) -> Value {
    match value {
        Value::Null => json!({ "nullValue": null }),
        Value::Bool(b) => json!({ "booleanValue": b }),
        Value::Number(n) => match n.as_i64() {
            Some(i) => json!({ "integerValue": i.to_string() }),
            None => json!({ "doubleValue": n.as_f64().unwrap_or_default() }),
        },
        Value::String(s) => json!({ "stringValue": s }),
        Value::Array(values) => {
            let values: Vec<Value> = values.iter().map(encode_value).collect();
            json!({ "arrayValue": { "values": values } })
        }
        Value::Object(map) => {
            let fields: Map<String, Value> = map
                .iter()
                .map(|(k, v)| (k.clone(), encode_value(v)))
                .collect();
            json!({ "mapValue": { "fields": fields } })
        }
    }
}

/// Decodes a Firestore `fields` map into a JSON object.
pub fn decode_fields(fields: &Map<String, Value>) -> Result<Record, RemoteError> {
    fields
        .iter()
        .map(|(key, value)| Ok((key.clone(), decode_value(value)?)))
        .collect()
}

/// Decodes one Firestore typed value.
pub fn decode_value(value: &Value) -> Result<Value, RemoteError> {
    let (kind, inner) = value
        .as_object()
        .and_then(|map| map.iter().next())
        .ok_or_else(|| RemoteError::Decode(format!("not a typed value: {}", value)))?;

    match (kind.as_str(), inner) {
        ("nullValue", _) => Ok(Value::Null),
        ("booleanValue", Value::Bool(_)) => Ok(inner.clone()),
        ("integerValue", Value::String(s)) => s
            .parse::<i64>()
            .map(Value::from)
            .map_err(|e| RemoteError::Decode(format!("integerValue '{}': {}", s, e))),
        ("integerValue", Value::Number(_)) | ("doubleValue", Value::Number(_)) => {
            Ok(inner.clone())
        }
        // NaN and Infinity arrive as strings and have no JSON form.
        ("doubleValue", Value::String(_)) => Ok(Value::Null),
        (
            "timestampValue" | "stringValue" | "bytesValue" | "referenceValue",
            Value::String(_),
        ) => Ok(inner.clone()),
        ("geoPointValue", _) => Ok(inner.clone()),
        ("arrayValue", _) => {
            let values = match inner.get("values") {
                Some(Value::Array(values)) => values
                    .iter()
                    .map(decode_value)
                    .collect::<Result<Vec<_>, _>>()?,
                _ => Vec::new(),
            };
            Ok(Value::Array(values))
        }
        ("mapValue", _) => {
            let fields = match inner.get("fields") {
                Some(Value::Object(fields)) => decode_fields(fields)?,
                _ => Record::new(),
            };
            Ok(Value::Object(fields))
        }
        (kind, _) => Err(RemoteError::Decode(format!(
            "unsupported value type '{}'",
            kind
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::sync::{SyncFacade, SyncOptions};
    use crate::testing::serve;
    use axum::extract::State;
    use axum::http::header::AUTHORIZATION;
    use axum::http::{HeaderMap, Uri};
    use axum::{Json, Router};
    use std::sync::Mutex;

    fn record(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    fn store() -> FirestoreStore {
        FirestoreStore::new("freshkeep-test", "key 1").with_endpoint("http://localhost:8080/")
    }

    #[test]
    fn test_collection_url() {
        assert_eq!(
            store().collection_url("items"),
            "http://localhost:8080/v1/projects/freshkeep-test/databases/(default)/documents/items?key=key%201"
        );
    }

    #[test]
    fn test_document_url_encodes_id() {
        assert_eq!(
            store().document_url("items", "a/b"),
            "http://localhost:8080/v1/projects/freshkeep-test/databases/(default)/documents/items/a%2Fb?key=key%201"
        );
    }

    #[test]
    fn test_query_url() {
        assert_eq!(
            store().query_url(),
            "http://localhost:8080/v1/projects/freshkeep-test/databases/(default)/documents:runQuery?key=key%201"
        );
    }

    #[test]
    fn test_default_endpoint() {
        let store = FirestoreStore::new("p", "k");
        assert!(store.documents_url().starts_with("https://firestore.googleapis.com/v1/"));
    }

    #[test]
    fn test_current_user_id_from_session() {
        assert_eq!(store().current_user_id(), None);

        let session = AuthSession {
            uid: "uid-42".to_string(),
            id_token: "token".to_string(),
            refresh_token: None,
            email: None,
            display_name: None,
        };
        let store = store().with_session(Some(session));
        assert_eq!(store.current_user_id().as_deref(), Some("uid-42"));
    }

    #[test]
    fn test_encode_fields() {
        let encoded = encode_fields(&record(json!({
            "name": "milk",
            "quantity": 2,
            "price": 1.5,
            "opened": false,
            "tags": ["dairy"],
            "note": null,
            "dateAdded": "2024-03-01T09:30:00.000Z",
            "expiryDate": "2024-03-08"
        })));

        assert_eq!(encoded["name"], json!({"stringValue": "milk"}));
        assert_eq!(encoded["quantity"], json!({"integerValue": "2"}));
        assert_eq!(encoded["price"], json!({"doubleValue": 1.5}));
        assert_eq!(encoded["opened"], json!({"booleanValue": false}));
        assert_eq!(
            encoded["tags"],
            json!({"arrayValue": {"values": [{"stringValue": "dairy"}]}})
        );
        assert_eq!(encoded["note"], json!({"nullValue": null}));
        assert_eq!(
            encoded["dateAdded"],
            json!({"timestampValue": "2024-03-01T09:30:00.000Z"})
        );
        assert_eq!(encoded["expiryDate"], json!({"stringValue": "2024-03-08"}));
    }

    #[test]
    fn test_encode_nested_map() {
        let encoded = encode_value(&json!({"unit": "g", "amount": 500}));
        assert_eq!(
            encoded,
            json!({"mapValue": {"fields": {
                "unit": {"stringValue": "g"},
                "amount": {"integerValue": "500"}
            }}})
        );
    }

    #[test]
    fn test_decode_fields() {
        let decoded = decode_fields(&record(json!({
            "name": {"stringValue": "eggs"},
            "quantity": {"integerValue": "12"},
            "dateAdded": {"timestampValue": "2024-03-01T09:30:00.123456Z"},
            "empty": {"arrayValue": {}},
            "nested": {"mapValue": {"fields": {"ok": {"booleanValue": true}}}}
        })))
        .unwrap();

        assert_eq!(decoded["name"], "eggs");
        assert_eq!(decoded["quantity"], 12);
        assert_eq!(decoded["dateAdded"], "2024-03-01T09:30:00.123456Z");
        assert_eq!(decoded["empty"], json!([]));
        assert_eq!(decoded["nested"], json!({"ok": true}));
    }

    #[test]
    fn test_decode_rejects_bad_integer() {
        let result = decode_value(&json!({"integerValue": "twelve"}));
        assert!(matches!(result, Err(RemoteError::Decode(_))));
    }

    #[test]
    fn test_decode_rejects_untyped_value() {
        assert!(decode_value(&json!("plain")).is_err());
        assert!(decode_value(&json!({"mysteryValue": 1})).is_err());
    }

    #[test]
    fn test_structured_query() {
        let query = OwnerQuery::new("ownerId", "guest_1")
            .order_by("dateAdded", SortDirection::Descending)
            .limit(1);
        let body = structured_query("items", &query);
        let structured = &body["structuredQuery"];

        assert_eq!(structured["from"][0]["collectionId"], "items");
        assert_eq!(
            structured["where"]["fieldFilter"]["field"]["fieldPath"],
            "ownerId"
        );
        assert_eq!(structured["where"]["fieldFilter"]["op"], "EQUAL");
        assert_eq!(
            structured["where"]["fieldFilter"]["value"]["stringValue"],
            "guest_1"
        );
        assert_eq!(structured["orderBy"][0]["direction"], "DESCENDING");
        assert_eq!(structured["limit"], 1);
    }

    #[test]
    fn test_structured_query_without_order_or_limit() {
        let body = structured_query("items", &OwnerQuery::new("ownerId", "u"));
        assert!(body["structuredQuery"].get("orderBy").is_none());
        assert!(body["structuredQuery"].get("limit").is_none());
    }

    #[test]
    fn test_decode_query_results_skips_read_time_entries() {
        let results = json!([
            {
                "document": {
                    "name": "projects/p/databases/(default)/documents/items/abc",
                    "fields": {"name": {"stringValue": "kale"}}
                },
                "readTime": "2024-03-01T09:30:00Z"
            },
            { "readTime": "2024-03-01T09:30:00Z" }
        ]);

        let docs = decode_query_results(&results).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].0, "abc");
        assert_eq!(docs[0].1["name"], "kale");
    }

    #[test]
    fn test_decode_query_results_requires_array() {
        assert!(decode_query_results(&json!({"error": "nope"})).is_err());
    }

    #[test]
    fn test_field_path_quoting() {
        assert_eq!(field_path("expiryDate"), "expiryDate");
        assert_eq!(field_path("best-before"), "`best-before`");
        assert_eq!(field_path("9lives"), "`9lives`");
        assert_eq!(field_path("a`b"), "`a\\`b`");
    }

    #[test]
    fn test_document_id() {
        assert_eq!(document_id("projects/p/databases/(default)/documents/items/xyz"), Some("xyz"));
        assert_eq!(document_id("trailing/"), None);
    }

    #[test]
    fn test_status_error_mapping() {
        let body = r#"{"error": {"code": 403, "message": "Missing or insufficient permissions.", "status": "PERMISSION_DENIED"}}"#;
        assert_eq!(
            status_error(StatusCode::FORBIDDEN, body, "items"),
            RemoteError::Rejected("PERMISSION_DENIED: Missing or insufficient permissions.".to_string())
        );
        assert_eq!(
            status_error(StatusCode::NOT_FOUND, "", "items/x"),
            RemoteError::NotFound("items/x".to_string())
        );
        assert!(matches!(
            status_error(StatusCode::SERVICE_UNAVAILABLE, "", "items"),
            RemoteError::Unreachable(_)
        ));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint() {
        let store = FirestoreStore::new("p", "k").with_endpoint("http://127.0.0.1:1");
        let result = store.delete("items", "abc").await;
        assert!(matches!(result, Err(RemoteError::Unreachable(_))));
    }

    /// Accepts only the token "fresh", which `/v1/token` hands out when
    /// `renew` is set.
    #[derive(Clone, Default)]
    struct TokenServer {
        renew: bool,
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl TokenServer {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    async fn token_server_handler(
        State(server): State<TokenServer>,
        uri: Uri,
        headers: HeaderMap,
    ) -> (StatusCode, Json<Value>) {
        let bearer = headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let path = uri.path().to_string();
        server.calls.lock().unwrap().push(format!("{} {}", path, bearer));

        if path == "/v1/token" {
            return if server.renew {
                (
                    StatusCode::OK,
                    Json(json!({
                        "id_token": "fresh",
                        "refresh_token": "refresh-2",
                        "user_id": "uid-1",
                        "expires_in": "3600",
                        "token_type": "Bearer"
                    })),
                )
            } else {
                (
                    StatusCode::BAD_REQUEST,
                    Json(json!({"error": {"code": 400, "message": "TOKEN_EXPIRED"}})),
                )
            };
        }

        if bearer == "Bearer fresh" {
            (StatusCode::OK, Json(json!([{"readTime": "2024-03-01T09:30:00Z"}])))
        } else {
            (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": {
                    "code": 401,
                    "message": "Request had invalid authentication credentials.",
                    "status": "UNAUTHENTICATED"
                }})),
            )
        }
    }

    fn expired_session() -> AuthSession {
        AuthSession {
            uid: "uid-1".to_string(),
            id_token: "expired".to_string(),
            refresh_token: Some("refresh-1".to_string()),
            email: Some("sam@example.com".to_string()),
            display_name: None,
        }
    }

    async fn token_server(renew: bool) -> (String, TokenServer) {
        let server = TokenServer {
            renew,
            ..Default::default()
        };
        let base = serve(
            Router::new()
                .fallback(token_server_handler)
                .with_state(server.clone()),
        )
        .await;
        (base, server)
    }

    /// A store signed in with an expired token, wired to a token server.
    async fn expired_store(renew: bool) -> (FirestoreStore, Arc<MemoryStore>, TokenServer) {
        let (base, server) = token_server(renew).await;
        let local = Arc::new(MemoryStore::new());
        let store = FirestoreStore::new("p", "k")
            .with_endpoint(base.clone())
            .with_session(Some(expired_session()))
            .with_session_refresh(AuthClient::new("k").with_token_endpoint(base), local.clone());
        (store, local, server)
    }

    #[tokio::test]
    async fn test_expired_session_is_refreshed_and_retried() {
        let (store, local, server) = expired_store(true).await;

        let docs = store
            .query("items", &OwnerQuery::new("ownerId", "uid-1"))
            .await
            .unwrap();
        assert!(docs.is_empty());

        let calls = server.calls();
        assert_eq!(calls.len(), 3);
        assert!(calls[0].ends_with(":runQuery Bearer expired"));
        assert!(calls[1].starts_with("/v1/token"));
        assert!(calls[2].ends_with(":runQuery Bearer fresh"));

        assert_eq!(store.session().unwrap().id_token, "fresh");
        let saved = AuthSession::load(local.as_ref()).unwrap();
        assert_eq!(saved.id_token, "fresh");
        assert_eq!(saved.refresh_token.as_deref(), Some("refresh-2"));
        assert_eq!(saved.email.as_deref(), Some("sam@example.com"));
    }

    #[tokio::test]
    async fn test_expired_session_reconnects_facade() {
        let (store, local, server) = expired_store(true).await;

        let facade = SyncFacade::connect(Some(Arc::new(store)), local, SyncOptions::default()).await;

        assert!(facade.is_connected());
        assert_eq!(facade.current_user_id(), "uid-1");
        assert!(server.calls().iter().any(|c| c.starts_with("/v1/token")));
    }

    #[tokio::test]
    async fn test_failed_refresh_is_rejected() {
        let (store, local, server) = expired_store(false).await;

        let result = store.delete("items", "abc").await;

        assert!(matches!(result, Err(RemoteError::Rejected(_))));
        assert_eq!(server.calls().len(), 2);
        assert_eq!(store.session().unwrap().id_token, "expired");
        assert!(AuthSession::load(local.as_ref()).is_none());
    }

    #[tokio::test]
    async fn test_rejection_without_refresher_is_not_retried() {
        let (base, server) = token_server(true).await;
        let store = FirestoreStore::new("p", "k")
            .with_endpoint(base)
            .with_session(Some(expired_session()));

        let result = store.delete("items", "abc").await;

        assert!(matches!(result, Err(RemoteError::Rejected(_))));
        assert_eq!(server.calls().len(), 1);
    }
}
