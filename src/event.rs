use serde::{Deserialize as _, Deserializer};
use serde_derive::{Deserialize, Serialize};
use serde_json::Value;

/// What to do when an included document cannot be decoded into the
/// requested type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EntityExceptionBehaviour {
    /// Abort the whole stream with the decode error.
    #[default]
    Fail,
    /// Emit the row as [`ViewRow::WithMalformedDoc`] and keep going.
    Recover,
}

/// An event of the stream returned by view and mango queries.
///
/// `TotalCount`, `Offset` and `UpdateSequence` are emitted at most once per
/// query, in the order the server sends them, interleaved with rows.
#[derive(Debug)]
pub enum ViewQueryResultEvent<K = Value, V = Value, T = Value> {
    TotalCount(u64),
    Offset(u64),
    UpdateSequence(u64),
    Row(ViewRow<K, V, T>),
    MangoQueryResult(MangoQueryResult<T>),
}

impl<K, V, T> ViewQueryResultEvent<K, V, T> {
    pub fn into_row(self) -> Option<ViewRow<K, V, T>> {
        match self {
            ViewQueryResultEvent::Row(row) => Some(row),
            _ => None,
        }
    }

    pub fn into_mango_result(self) -> Option<MangoQueryResult<T>> {
        match self {
            ViewQueryResultEvent::MangoQueryResult(result) => Some(result),
            _ => None,
        }
    }
}

/// A row of a view result.
///
/// `id` is empty when the server sent a row without id (e.g. a `not_found`
/// row of a multi-key `_all_docs` query).
#[derive(Debug)]
pub enum ViewRow<K, V, T> {
    WithDoc {
        id: String,
        key: Option<K>,
        value: Option<V>,
        doc: T,
    },
    WithMalformedDoc {
        id: String,
        key: Option<K>,
        value: Option<V>,
        error: serde_json::Error,
    },
    WithMissingDoc {
        id: String,
        key: Option<K>,
        value: Option<V>,
    },
    NoDoc {
        id: String,
        key: Option<K>,
        value: Option<V>,
    },
}

impl<K, V, T> ViewRow<K, V, T> {
    pub fn id(&self) -> &str {
        match self {
            ViewRow::WithDoc { id, .. }
            | ViewRow::WithMalformedDoc { id, .. }
            | ViewRow::WithMissingDoc { id, .. }
            | ViewRow::NoDoc { id, .. } => id,
        }
    }

    pub fn key(&self) -> Option<&K> {
        match self {
            ViewRow::WithDoc { key, .. }
            | ViewRow::WithMalformedDoc { key, .. }
            | ViewRow::WithMissingDoc { key, .. }
            | ViewRow::NoDoc { key, .. } => key.as_ref(),
        }
    }

    pub fn value(&self) -> Option<&V> {
        match self {
            ViewRow::WithDoc { value, .. }
            | ViewRow::WithMalformedDoc { value, .. }
            | ViewRow::WithMissingDoc { value, .. }
            | ViewRow::NoDoc { value, .. } => value.as_ref(),
        }
    }

    pub fn doc(&self) -> Option<&T> {
        match self {
            ViewRow::WithDoc { doc, .. } => Some(doc),
            _ => None,
        }
    }

    pub fn into_doc(self) -> Option<T> {
        match self {
            ViewRow::WithDoc { doc, .. } => Some(doc),
            _ => None,
        }
    }

    /// The decode error of a `WithMalformedDoc` row.
    pub fn error(&self) -> Option<&serde_json::Error> {
        match self {
            ViewRow::WithMalformedDoc { error, .. } => Some(error),
            _ => None,
        }
    }
}

/// Either a document or the pagination bookmark of a mango query.
#[derive(Debug, Clone, PartialEq)]
pub struct MangoQueryResult<T> {
    pub doc: Option<T>,
    pub bookmark: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Change<T> {
    #[serde(deserialize_with = "deserialize_seq")]
    pub seq: String,
    pub id: String,
    #[serde(default)]
    pub changes: Vec<ChangeRevision>,
    pub doc: T,
    #[serde(default)]
    pub deleted: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ChangeRevision {
    pub rev: String,
}

/// A bounded slice of the changes feed.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ChangesChunk<T> {
    /// Last change included in `results`, or the last change of the database
    /// when `results` is empty.
    pub last_seq: String,
    /// Changes left after `last_seq`, regardless of any client side filtering.
    pub pending: u64,
    pub results: Vec<Change<T>>,
}

/// Outcome of one document of a `_bulk_docs` request. Results must be matched
/// to the submitted documents by `id`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BulkUpdateResult {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl BulkUpdateResult {
    pub fn is_ok(&self) -> bool {
        self.error.is_none() && self.rev.is_some()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DocIdentifier {
    pub id: Option<String>,
    pub rev: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct IdAndRev {
    pub id: String,
    pub rev: Option<String>,
}

impl IdAndRev {
    pub fn new(id: impl Into<String>, rev: Option<String>) -> Self {
        Self { id: id.into(), rev }
    }
}

/// CouchDB 1.x sends numeric sequences, later versions opaque strings.
pub(crate) fn deserialize_seq<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(seq_to_string(Value::deserialize(deserializer)?))
}

pub(crate) fn seq_to_string(seq: Value) -> String {
    match seq {
        Value::String(s) => s,
        other => other.to_string(),
    }
}
