//! Streaming decoders of view and mango query responses.

use crate::client::Client;
use crate::error::{Error, Result};
use crate::event::{EntityExceptionBehaviour, MangoQueryResult, ViewQueryResultEvent, ViewRow};
use crate::json::{JsonEvent, JsonTokens};
use crate::query::{MangoQuery, ViewQuery};
use bytes::Bytes;
use futures_util::stream::{self, Stream, TryStreamExt};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::{Number, Value};
use std::marker::PhantomData;

const NOT_FOUND_ERROR: &str = "not_found";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Start,
    Fields,
    Rows,
    Done,
}

#[derive(Debug, Default)]
struct RawRow {
    id: Option<String>,
    key: Option<Value>,
    value: Option<Value>,
    doc: Option<Value>,
    error: Option<String>,
}

/// Walks `{total_rows, offset, update_seq, rows: [...]}` one event at a time.
struct ViewResultDecoder<K, V, T> {
    tokens: JsonTokens,
    state: State,
    url: String,
    include_docs: bool,
    ignore_not_found: bool,
    behaviour: EntityExceptionBehaviour,
    _types: PhantomData<fn() -> (K, V, T)>,
}

impl<K, V, T> ViewResultDecoder<K, V, T>
where
    K: DeserializeOwned,
    V: DeserializeOwned,
    T: DeserializeOwned,
{
    async fn next_event(&mut self) -> Result<Option<ViewQueryResultEvent<K, V, T>>> {
        loop {
            match self.state {
                State::Start => match self.tokens.expect().await? {
                    JsonEvent::StartObject => self.state = State::Fields,
                    other => {
                        return Err(Error::protocol(format!(
                            "expected data to start with an object, found {:?}",
                            other
                        )))
                    }
                },
                State::Fields => match self.tokens.expect().await? {
                    JsonEvent::EndObject => self.state = State::Done,
                    JsonEvent::FieldName(name) => {
                        if let Some(event) = self.field(&name).await? {
                            return Ok(Some(event));
                        }
                    }
                    other => {
                        return Err(Error::protocol(format!(
                            "expected a field name or the end of the result, found {:?}",
                            other
                        )))
                    }
                },
                State::Rows => match self.next_row().await? {
                    Some(row) => return Ok(Some(ViewQueryResultEvent::Row(self.classify(row)?))),
                    None => self.state = State::Fields,
                },
                State::Done => return Ok(None),
            }
        }
    }

    async fn field(&mut self, name: &str) -> Result<Option<ViewQueryResultEvent<K, V, T>>> {
        match name {
            "rows" => match self.tokens.expect().await? {
                JsonEvent::StartArray => self.state = State::Rows,
                other => {
                    return Err(Error::protocol(format!(
                        "expected rows field to be an array, found {:?}",
                        other
                    )))
                }
            },
            "total_rows" => {
                if let Some(total) = self.tokens.next_number_or_null().await? {
                    return Ok(Some(ViewQueryResultEvent::TotalCount(as_count(total)?)));
                }
            }
            // a null or negative offset means there is none
            "offset" => {
                if let Some(offset) = self.tokens.next_number_or_null().await?.and_then(|n| n.as_u64()) {
                    return Ok(Some(ViewQueryResultEvent::Offset(offset)));
                }
            }
            "update_seq" => {
                let seq = self.tokens.next_value().await?;
                if let Some(seq) = seq.as_ref().and_then(update_sequence) {
                    return Ok(Some(ViewQueryResultEvent::UpdateSequence(seq)));
                }
            }
            "error" => {
                let error = self.tokens.next_value().await?.map(value_text).unwrap_or_default();
                return Err(Error::QueryFailed {
                    url: self.url.clone(),
                    error,
                });
            }
            _ => self.tokens.skip_value().await?,
        }
        Ok(None)
    }

    /// Collects the fields of the next row, `None` at the end of `rows`.
    async fn next_row(&mut self) -> Result<Option<RawRow>> {
        match self.tokens.expect().await? {
            JsonEvent::StartObject => {}
            JsonEvent::EndArray => return Ok(None),
            other => {
                return Err(Error::protocol(format!(
                    "expected a row or the end of rows, found {:?}",
                    other
                )))
            }
        }
        let mut row = RawRow::default();
        loop {
            match self.tokens.expect().await? {
                JsonEvent::EndObject => return Ok(Some(row)),
                JsonEvent::FieldName(name) => match name.as_str() {
                    "id" => row.id = Some(self.tokens.next_string().await?),
                    "key" => row.key = self.tokens.next_value().await?,
                    "value" => row.value = self.tokens.next_value().await?,
                    "doc" if self.include_docs => row.doc = self.tokens.next_value().await?,
                    "error" => row.error = Some(self.tokens.next_string().await?),
                    _ => self.tokens.skip_value().await?,
                },
                other => {
                    return Err(Error::protocol(format!(
                        "expected a field name or the end of the row, found {:?}",
                        other
                    )))
                }
            }
        }
    }

    fn classify(&self, row: RawRow) -> Result<ViewRow<K, V, T>> {
        if let Some(error) = row.error {
            if !(self.ignore_not_found && error == NOT_FOUND_ERROR) {
                return Err(Error::ViewResult {
                    key: row.key,
                    error,
                });
            }
        }
        let context = row.id.as_deref().unwrap_or("N/A").to_string();
        let key = decode_field(row.key, &context, "key")?;
        let value = decode_field(row.value, &context, "value")?;

        let Some(id) = row.id else {
            return Ok(ViewRow::NoDoc {
                id: String::new(),
                key,
                value,
            });
        };
        if !self.include_docs {
            return Ok(ViewRow::NoDoc { id, key, value });
        }
        match row.doc.filter(|doc| !doc.is_null()) {
            None => Ok(ViewRow::WithMissingDoc { id, key, value }),
            Some(doc) => match serde_json::from_value::<T>(doc) {
                Ok(doc) => Ok(ViewRow::WithDoc { id, key, value, doc }),
                Err(error) => match self.behaviour {
                    EntityExceptionBehaviour::Fail => Err(Error::Decode {
                        id,
                        field: "doc",
                        source: error,
                    }),
                    EntityExceptionBehaviour::Recover => Ok(ViewRow::WithMalformedDoc {
                        id,
                        key,
                        value,
                        error,
                    }),
                },
            },
        }
    }
}

/// Walks `{docs: [...], bookmark, error, reason}`.
struct MangoResultDecoder<T> {
    tokens: JsonTokens,
    state: State,
    reason: Option<String>,
    _type: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> MangoResultDecoder<T> {
    async fn next_event(&mut self) -> Result<Option<ViewQueryResultEvent<Value, Value, T>>> {
        loop {
            match self.state {
                State::Start => match self.tokens.expect().await? {
                    JsonEvent::StartObject => self.state = State::Fields,
                    other => {
                        return Err(Error::protocol(format!(
                            "expected data to start with an object, found {:?}",
                            other
                        )))
                    }
                },
                State::Fields => match self.tokens.expect().await? {
                    JsonEvent::EndObject => self.state = State::Done,
                    JsonEvent::FieldName(name) => match name.as_str() {
                        "docs" => match self.tokens.expect().await? {
                            JsonEvent::StartArray => self.state = State::Rows,
                            other => {
                                return Err(Error::protocol(format!(
                                    "expected docs field to be an array, found {:?}",
                                    other
                                )))
                            }
                        },
                        "bookmark" => {
                            let bookmark = self.tokens.next_string().await?;
                            return Ok(Some(ViewQueryResultEvent::MangoQueryResult(
                                MangoQueryResult {
                                    doc: None,
                                    bookmark: Some(bookmark),
                                },
                            )));
                        }
                        "reason" => {
                            self.reason = self.tokens.next_value().await?.map(value_text)
                        }
                        "error" => return Err(self.mango_error().await?),
                        _ => self.tokens.skip_value().await?,
                    },
                    other => {
                        return Err(Error::protocol(format!(
                            "expected a field name or the end of the result, found {:?}",
                            other
                        )))
                    }
                },
                State::Rows => match self.tokens.next_value().await? {
                    Some(doc) => {
                        let id = doc
                            .get("_id")
                            .and_then(Value::as_str)
                            .unwrap_or("N/A")
                            .to_string();
                        let doc = serde_json::from_value::<T>(doc).map_err(|source| {
                            Error::Decode {
                                id,
                                field: "docs",
                                source,
                            }
                        })?;
                        return Ok(Some(ViewQueryResultEvent::MangoQueryResult(
                            MangoQueryResult {
                                doc: Some(doc),
                                bookmark: None,
                            },
                        )));
                    }
                    None => self.state = State::Fields,
                },
                State::Done => return Ok(None),
            }
        }
    }

    /// Reads the rest of the response to pick up `reason`, wherever it is.
    async fn mango_error(&mut self) -> Result<Error> {
        let error = self.tokens.next_value().await?.map(value_text).unwrap_or_default();
        loop {
            match self.tokens.expect().await? {
                JsonEvent::EndObject => break,
                JsonEvent::FieldName(name) if name == "reason" => {
                    self.reason = self.tokens.next_value().await?.map(value_text)
                }
                JsonEvent::FieldName(_) => self.tokens.skip_value().await?,
                other => {
                    return Err(Error::protocol(format!(
                        "expected a field name or the end of the result, found {:?}",
                        other
                    )))
                }
            }
        }
        self.state = State::Done;
        Ok(Error::Mango {
            error,
            reason: self.reason.take().unwrap_or_default(),
        })
    }
}

fn as_count(number: Number) -> Result<u64> {
    number
        .as_u64()
        .ok_or_else(|| Error::protocol(format!("expected a positive integer, found {}", number)))
}

/// Numeric sequences of CouchDB 1.x, or the numeric prefix of clustered ones.
fn update_sequence(seq: &Value) -> Option<u64> {
    match seq {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.split('-').next().and_then(|n| n.parse().ok()),
        _ => None,
    }
}

fn value_text(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

fn decode_field<X: DeserializeOwned>(
    raw: Option<Value>,
    id: &str,
    field: &'static str,
) -> Result<Option<X>> {
    match raw.filter(|v| !v.is_null()) {
        None => Ok(None),
        Some(raw) => serde_json::from_value(raw)
            .map(Some)
            .map_err(|source| Error::Decode {
                id: id.to_string(),
                field,
                source,
            }),
    }
}

impl Client {
    /// Streams the result of a view (or `_all_docs`) query.
    ///
    /// The request is only sent once the stream is polled. Rows are decoded as
    /// they arrive; `behaviour` decides what happens to rows whose document
    /// does not decode into `T`.
    pub fn query_view<K, V, T>(
        &self,
        query: &ViewQuery,
        behaviour: EntityExceptionBehaviour,
    ) -> impl Stream<Item = Result<ViewQueryResultEvent<K, V, T>>> + Send + 'static
    where
        K: DeserializeOwned + Send + 'static,
        V: DeserializeOwned + Send + 'static,
        T: DeserializeOwned + Send + 'static,
    {
        let client = self.clone();
        let query = query.clone();
        stream::once(async move {
            let (url, tokens) = client.open_view(&query).await?;
            let decoder = ViewResultDecoder::<K, V, T> {
                state: if tokens.is_some() { State::Start } else { State::Done },
                tokens: tokens.unwrap_or_else(|| JsonTokens::new(Box::pin(stream::empty::<Result<Bytes>>()))),
                url,
                include_docs: query.is_include_docs(),
                ignore_not_found: query.is_ignore_not_found(),
                behaviour,
                _types: PhantomData,
            };
            Ok::<_, Error>(stream::try_unfold(decoder, |mut decoder| async move {
                Ok::<_, Error>(decoder.next_event().await?.map(|event| (event, decoder)))
            }))
        })
        .try_flatten()
    }

    /// Rows of a view query, without the metadata events.
    pub fn query_view_rows<K, V, T>(
        &self,
        query: &ViewQuery,
        behaviour: EntityExceptionBehaviour,
    ) -> impl Stream<Item = Result<ViewRow<K, V, T>>> + Send + 'static
    where
        K: DeserializeOwned + Send + 'static,
        V: DeserializeOwned + Send + 'static,
        T: DeserializeOwned + Send + 'static,
    {
        self.query_view::<K, V, T>(query, behaviour)
            .try_filter_map(|event| async move { Ok(event.into_row()) })
    }

    /// Streams the documents and bookmark of a `_find` request.
    pub fn mango_query<T>(
        &self,
        query: &MangoQuery,
    ) -> impl Stream<Item = Result<ViewQueryResultEvent<Value, Value, T>>> + Send + 'static
    where
        T: DeserializeOwned + Send + 'static,
    {
        let client = self.clone();
        let query = query.clone();
        stream::once(async move {
            let url = client.db_path(&["_find"])?;
            let request = client.json_request(Method::POST, url, &query)?;
            let response = client.send(request).await?;
            let decoder = MangoResultDecoder::<T> {
                tokens: JsonTokens::new(response.body),
                state: State::Start,
                reason: None,
                _type: PhantomData,
            };
            Ok::<_, Error>(stream::try_unfold(decoder, |mut decoder| async move {
                Ok::<_, Error>(decoder.next_event().await?.map(|event| (event, decoder)))
            }))
        })
        .try_flatten()
    }

    /// `None` when the view is missing and the query allows it.
    async fn open_view(&self, query: &ViewQuery) -> Result<(String, Option<JsonTokens>)> {
        let segments = query.path_segments();
        let mut url = self.db_path(&segments.iter().map(String::as_str).collect::<Vec<_>>())?;
        let params = query.query_params();
        if !params.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (name, value) in &params {
                pairs.append_pair(name, value);
            }
        }
        let mut request = match query.keys_body() {
            Some(body) => self.json_request(Method::POST, url.clone(), &body)?,
            None => self.request(Method::GET, url.clone())?,
        };
        request.timeout = query.request_timeout();

        let response = self.execute(request).await?;
        if response.status == StatusCode::NOT_FOUND {
            if query.is_skip_if_view_does_not_exist() {
                return Ok((url.to_string(), None));
            }
            let mut error = response.into_server_error("").await;
            error.message = error.body.clone();
            return Err(Error::NotFound(error));
        }
        let response = response.error_for_status().await?;
        Ok((url.to_string(), Some(JsonTokens::new(response.body))))
    }
}
