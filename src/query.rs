use serde_derive::Serialize;
use serde_json::Value;
use std::time::Duration;

pub const ALL_DOCS: &str = "_all_docs";

/// Description of a view (or `_all_docs`) query.
///
/// ```
/// # use couchstream::ViewQuery;
/// let query = ViewQuery::new()
///     .design_doc_id("_design/Code")
///     .view_name("by_type")
///     .start_key(&["test"])
///     .limit(10)
///     .include_docs(true);
/// assert_eq!(query.path_segments(), vec!["_design", "Code", "_view", "by_type"]);
/// ```
#[derive(Debug, Clone, Default)]
pub struct ViewQuery {
    design_doc_id: Option<String>,
    view_name: Option<String>,
    all_docs: bool,
    key: Option<Value>,
    keys: Option<Vec<Value>>,
    start_key: Option<Value>,
    end_key: Option<Value>,
    start_doc_id: Option<String>,
    end_doc_id: Option<String>,
    limit: Option<u64>,
    skip: Option<u64>,
    descending: bool,
    include_docs: bool,
    reduce: Option<bool>,
    group: Option<bool>,
    group_level: Option<u32>,
    inclusive_end: Option<bool>,
    stale: Option<String>,
    update_seq: bool,
    ignore_not_found: bool,
    skip_if_view_does_not_exist: bool,
    timeout: Option<Duration>,
}

fn to_value(value: impl serde::Serialize) -> Value {
    // serializing plain data into a Value only fails for maps with non string keys
    serde_json::to_value(value).unwrap_or(Value::Null)
}

impl ViewQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queries `_all_docs` instead of a design document view.
    pub fn all_docs(mut self) -> Self {
        self.all_docs = true;
        self
    }

    pub fn design_doc_id(mut self, id: impl Into<String>) -> Self {
        self.design_doc_id = Some(id.into());
        self
    }

    pub fn view_name(mut self, name: impl Into<String>) -> Self {
        self.view_name = Some(name.into());
        self
    }

    /// Replaces any earlier [`keys`](Self::keys).
    pub fn key(mut self, key: impl serde::Serialize) -> Self {
        self.key = Some(to_value(key));
        self.keys = None;
        self
    }

    /// Replaces any earlier [`key`](Self::key).
    pub fn keys<K: serde::Serialize>(mut self, keys: impl IntoIterator<Item = K>) -> Self {
        self.keys = Some(keys.into_iter().map(to_value).collect());
        self.key = None;
        self
    }

    pub fn start_key(mut self, key: impl serde::Serialize) -> Self {
        self.start_key = Some(to_value(key));
        self
    }

    pub fn end_key(mut self, key: impl serde::Serialize) -> Self {
        self.end_key = Some(to_value(key));
        self
    }

    pub fn start_doc_id(mut self, id: impl Into<String>) -> Self {
        self.start_doc_id = Some(id.into());
        self
    }

    pub fn end_doc_id(mut self, id: impl Into<String>) -> Self {
        self.end_doc_id = Some(id.into());
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn skip(mut self, skip: u64) -> Self {
        self.skip = Some(skip);
        self
    }

    pub fn descending(mut self, descending: bool) -> Self {
        self.descending = descending;
        self
    }

    pub fn include_docs(mut self, include_docs: bool) -> Self {
        self.include_docs = include_docs;
        self
    }

    pub fn reduce(mut self, reduce: bool) -> Self {
        self.reduce = Some(reduce);
        self
    }

    pub fn group(mut self, group: bool) -> Self {
        self.group = Some(group);
        self
    }

    pub fn group_level(mut self, level: u32) -> Self {
        self.group_level = Some(level);
        self
    }

    pub fn inclusive_end(mut self, inclusive_end: bool) -> Self {
        self.inclusive_end = Some(inclusive_end);
        self
    }

    /// `ok` or `update_after`.
    pub fn stale(mut self, stale: impl Into<String>) -> Self {
        self.stale = Some(stale.into());
        self
    }

    pub fn update_seq(mut self, update_seq: bool) -> Self {
        self.update_seq = update_seq;
        self
    }

    /// Silently accept `not_found` rows (multi-key `_all_docs` queries).
    pub fn ignore_not_found(mut self, ignore: bool) -> Self {
        self.ignore_not_found = ignore;
        self
    }

    /// Complete with an empty stream instead of failing when the design
    /// document or the view is missing.
    pub fn skip_if_view_does_not_exist(mut self, skip: bool) -> Self {
        self.skip_if_view_does_not_exist = skip;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn is_include_docs(&self) -> bool {
        self.include_docs
    }

    pub fn is_ignore_not_found(&self) -> bool {
        self.ignore_not_found
    }

    pub fn is_skip_if_view_does_not_exist(&self) -> bool {
        self.skip_if_view_does_not_exist
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Zero or several keys: sent as a POST body.
    pub fn has_multiple_keys(&self) -> bool {
        self.keys.as_ref().is_some_and(|keys| keys.len() != 1)
    }

    /// Path below the database url.
    pub fn path_segments(&self) -> Vec<String> {
        if self.all_docs {
            return vec![ALL_DOCS.to_string()];
        }
        let mut segments: Vec<String> = match &self.design_doc_id {
            Some(id) => match id.strip_prefix("_design/") {
                Some(name) => vec!["_design".into(), name.into()],
                None => vec!["_design".into(), id.clone()],
            },
            None => Vec::new(),
        };
        segments.push("_view".into());
        segments.extend(self.view_name.clone());
        segments
    }

    /// JSON valued parameters are JSON encoded, as the server expects.
    pub fn query_params(&self) -> Vec<(&'static str, String)> {
        let mut params = Vec::new();
        let json = |v: &Value| v.to_string();
        if let Some(key) = &self.key {
            params.push(("key", json(key)));
        }
        if let Some(keys) = &self.keys {
            // a single key does not need a POST body
            if let [key] = keys.as_slice() {
                params.push(("key", json(key)));
            }
        }
        if let Some(key) = &self.start_key {
            params.push(("startkey", json(key)));
        }
        if let Some(key) = &self.end_key {
            params.push(("endkey", json(key)));
        }
        if let Some(id) = &self.start_doc_id {
            params.push(("startkey_docid", id.clone()));
        }
        if let Some(id) = &self.end_doc_id {
            params.push(("endkey_docid", id.clone()));
        }
        if let Some(limit) = self.limit {
            params.push(("limit", limit.to_string()));
        }
        if let Some(skip) = self.skip {
            params.push(("skip", skip.to_string()));
        }
        if self.descending {
            params.push(("descending", "true".into()));
        }
        if self.include_docs {
            params.push(("include_docs", "true".into()));
        }
        if let Some(reduce) = self.reduce {
            params.push(("reduce", reduce.to_string()));
        }
        if let Some(group) = self.group {
            params.push(("group", group.to_string()));
        }
        if let Some(level) = self.group_level {
            params.push(("group_level", level.to_string()));
        }
        if let Some(inclusive_end) = self.inclusive_end {
            params.push(("inclusive_end", inclusive_end.to_string()));
        }
        if let Some(stale) = &self.stale {
            params.push(("stale", stale.clone()));
        }
        if self.update_seq {
            params.push(("update_seq", "true".into()));
        }
        params
    }

    /// `{"keys": [...]}` body of multi-key queries.
    pub fn keys_body(&self) -> Option<Value> {
        self.has_multiple_keys()
            .then(|| serde_json::json!({ "keys": self.keys.clone().unwrap_or_default() }))
    }
}

/// A `_find` request.
#[derive(Serialize, Debug, Clone, Default)]
pub struct MangoQuery {
    pub selector: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bookmark: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_index: Option<Value>,
}

impl MangoQuery {
    pub fn new(selector: Value) -> Self {
        Self {
            selector,
            ..Self::default()
        }
    }

    pub fn fields<S: Into<String>>(mut self, fields: impl IntoIterator<Item = S>) -> Self {
        self.fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn sort(mut self, sort: Vec<Value>) -> Self {
        self.sort = Some(sort);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn skip(mut self, skip: u64) -> Self {
        self.skip = Some(skip);
        self
    }

    pub fn bookmark(mut self, bookmark: impl Into<String>) -> Self {
        self.bookmark = Some(bookmark.into());
        self
    }

    pub fn use_index(mut self, index: Value) -> Self {
        self.use_index = Some(index);
        self
    }
}
