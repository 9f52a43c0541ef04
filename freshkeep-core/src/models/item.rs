use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::sync_status::SyncStatus;

/// A free-form JSON object, as exchanged with the storage backends.
pub type Record = serde_json::Map<String, Value>;

/// Fields owned by the sync layer. Caller input never sets them.
pub const RESERVED_FIELDS: [&str; 6] = [
    "id",
    "ownerId",
    "dateAdded",
    "lastModified",
    "syncStatus",
    "remoteId",
];

/// A tracked grocery entry.
///
/// Only the bookkeeping fields are typed; everything the caller supplies
/// (name, quantity, expiry date, category, ...) lives in `fields` untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    #[serde(with = "timestamp")]
    pub date_added: DateTime<Utc>,
    #[serde(
        default,
        with = "timestamp::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_modified: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sync_status: SyncStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
    #[serde(flatten)]
    pub fields: Record,
}

impl Item {
    pub fn new(id: impl Into<String>, fields: Record, date_added: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            owner_id: None,
            date_added,
            last_modified: None,
            sync_status: SyncStatus::Pending,
            remote_id: None,
            fields,
        }
    }

    pub fn with_owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    pub fn with_status(mut self, status: SyncStatus) -> Self {
        self.sync_status = status;
        self
    }

    /// Builds an item from a stored document and the id it was stored under.
    pub fn from_record(id: impl Into<String>, mut record: Record) -> Result<Self, serde_json::Error> {
        record.insert("id".to_string(), Value::String(id.into()));
        serde_json::from_value(Value::Object(record))
    }

    /// The item as a document body, without its `id`.
    pub fn to_record(&self) -> Record {
        let mut record = match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Record::new(),
        };
        record.remove("id");
        record
    }

    pub fn is_pending(&self) -> bool {
        self.sync_status == SyncStatus::Pending
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn name(&self) -> Option<&str> {
        self.field("name").and_then(Value::as_str)
    }

    /// Shallow-merges caller fields into the item and stamps `lastModified`.
    pub fn merge(&mut self, partial: &Record, now: DateTime<Utc>) {
        for (key, value) in partial {
            if RESERVED_FIELDS.contains(&key.as_str()) {
                continue;
            }
            self.fields.insert(key.clone(), value.clone());
        }
        self.last_modified = Some(now);
    }
}

/// Removes sync-owned fields from caller input, returning the keys dropped.
pub fn strip_reserved(record: &mut Record) -> Vec<String> {
    let mut removed = Vec::new();
    for key in RESERVED_FIELDS {
        if record.remove(key).is_some() {
            removed.push(key.to_string());
        }
    }
    removed
}

/// ISO-8601 timestamps with millisecond precision and a `Z` suffix.
///
/// The fixed width keeps string ordering equal to time ordering.
pub mod timestamp {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn format(dt: &DateTime<Utc>) -> String {
        dt.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    pub fn parse(s: &str) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }

    pub fn serialize<S: Serializer>(dt: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(dt))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let s = String::deserialize(deserializer)?;
        parse(&s).ok_or_else(|| D::Error::custom(format!("invalid timestamp '{}'", s)))
    }

    pub mod option {
        use chrono::{DateTime, Utc};
        use serde::{de::Error, Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            dt: &Option<DateTime<Utc>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match dt {
                Some(dt) => serializer.serialize_str(&super::format(dt)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            match Option::<String>::deserialize(deserializer)? {
                Some(s) => super::parse(&s)
                    .map(Some)
                    .ok_or_else(|| D::Error::custom(format!("invalid timestamp '{}'", s))),
                None => Ok(None),
            }
        }
    }
}
