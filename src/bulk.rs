//! Bulk writes and batched reads by id.

use crate::client::Client;
use crate::document::{require_valid_rev, CouchDocument};
use crate::error::{Error, Result};
use crate::event::{BulkUpdateResult, EntityExceptionBehaviour, IdAndRev, ViewQueryResultEvent, ViewRow};
use crate::json::{typed_array, JsonTokens};
use crate::query::ViewQuery;
use futures_util::stream::{self, BoxStream, Stream, StreamExt, TryStreamExt};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_derive::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Number of ids per `_all_docs` request.
pub const PAGINATION_BATCH_SIZE: usize = 100;

#[derive(Serialize)]
struct BulkDocs<'a, D> {
    docs: &'a [D],
    all_or_nothing: bool,
}

#[derive(Serialize)]
struct DeleteRequest<'a> {
    #[serde(rename = "_id")]
    id: &'a str,
    #[serde(rename = "_rev", skip_serializing_if = "Option::is_none")]
    rev: Option<&'a str>,
    #[serde(rename = "_deleted")]
    deleted: bool,
}

/// Value of `_all_docs` rows.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AllDocsValue {
    pub rev: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<bool>,
}

pub type BulkUpdateStream = BoxStream<'static, Result<BulkUpdateResult>>;

pub type PaginationEvent<T> = ViewQueryResultEvent<String, AllDocsValue, T>;

struct Pagination<T> {
    batches: BoxStream<'static, Vec<String>>,
    rows: Option<BoxStream<'static, Result<PaginationEvent<T>>>>,
    total: u64,
    offset: Option<u64>,
    seq: u64,
    trailing: Option<VecDeque<PaginationEvent<T>>>,
    failed: bool,
}

impl<T> Pagination<T> {
    fn summary(&self) -> VecDeque<PaginationEvent<T>> {
        let mut trailing = VecDeque::with_capacity(3);
        trailing.push_back(ViewQueryResultEvent::TotalCount(self.total));
        if let Some(offset) = self.offset {
            trailing.push_back(ViewQueryResultEvent::Offset(offset));
        }
        if self.seq > 0 {
            trailing.push_back(ViewQueryResultEvent::UpdateSequence(self.seq));
        }
        trailing
    }
}

impl Client {
    /// Saves `entities` with one `_bulk_docs` request.
    ///
    /// Every revision that is set must be well formed; otherwise nothing is
    /// sent. Results are streamed as the server writes them and must be
    /// matched to the documents by id.
    pub async fn bulk_update<T: CouchDocument>(
        &self,
        entities: &[T],
    ) -> Result<BulkUpdateStream> {
        for entity in entities {
            if entity.rev().is_some() {
                require_valid_rev(entity.rev())
                    .map_err(|_| Error::invalid_argument("Rev should be null or have a valid format"))?;
            }
        }
        self.bulk_docs(&BulkDocs {
            docs: entities,
            all_or_nothing: false,
        })
        .await
    }

    pub async fn bulk_delete<T: CouchDocument>(
        &self,
        entities: &[T],
    ) -> Result<BulkUpdateStream> {
        let docs: Vec<DeleteRequest<'_>> = entities
            .iter()
            .map(|entity| DeleteRequest {
                id: entity.id(),
                rev: entity.rev(),
                deleted: true,
            })
            .collect();
        self.bulk_docs(&BulkDocs {
            docs: &docs,
            all_or_nothing: false,
        })
        .await
    }

    pub async fn bulk_delete_by_id_and_rev(
        &self,
        entities: &[IdAndRev],
    ) -> Result<BulkUpdateStream> {
        let docs: Vec<DeleteRequest<'_>> = entities
            .iter()
            .map(|entity| DeleteRequest {
                id: &entity.id,
                rev: entity.rev.as_deref(),
                deleted: true,
            })
            .collect();
        self.bulk_docs(&BulkDocs {
            docs: &docs,
            all_or_nothing: false,
        })
        .await
    }

    async fn bulk_docs<D: serde::Serialize>(
        &self,
        body: &BulkDocs<'_, D>,
    ) -> Result<BulkUpdateStream> {
        let request = self.json_request(Method::POST, self.db_path(&["_bulk_docs"])?, body)?;
        let response = self.send(request).await?;
        Ok(typed_array::<BulkUpdateResult>(JsonTokens::new(response.body)).boxed())
    }

    /// Reads documents by id through `_all_docs`, [`PAGINATION_BATCH_SIZE`]
    /// ids per request.
    ///
    /// Rows with a document are forwarded as they arrive (rows whose document
    /// failed to decode too, under [`EntityExceptionBehaviour::Recover`]).
    /// The metadata of all batches is merged and emitted once at the end: the
    /// summed total count, the smallest offset and the highest update
    /// sequence.
    pub fn get_for_pagination<T, S>(
        &self,
        ids: S,
        behaviour: EntityExceptionBehaviour,
    ) -> impl Stream<Item = Result<PaginationEvent<T>>> + Send + 'static
    where
        T: DeserializeOwned + Send + 'static,
        S: Stream<Item = String> + Send + 'static,
    {
        let client = self.clone();
        let state = Pagination::<T> {
            batches: ids.chunks(PAGINATION_BATCH_SIZE).boxed(),
            rows: None,
            total: 0,
            offset: None,
            seq: 0,
            trailing: None,
            failed: false,
        };
        stream::unfold(state, move |mut state| {
            let client = client.clone();
            async move {
                if state.failed {
                    return None;
                }
                loop {
                    if let Some(trailing) = &mut state.trailing {
                        let event = trailing.pop_front()?;
                        return Some((Ok(event), state));
                    }
                    if state.rows.is_none() {
                        match state.batches.next().await {
                            Some(ids) => {
                                let query = ViewQuery::new()
                                    .all_docs()
                                    .keys(ids)
                                    .include_docs(true)
                                    .ignore_not_found(true);
                                state.rows = Some(client.query_view(&query, behaviour).boxed());
                            }
                            None => state.trailing = Some(state.summary()),
                        }
                        continue;
                    }
                    let Some(rows) = state.rows.as_mut() else {
                        continue;
                    };
                    match rows.next().await {
                        Some(Ok(event)) => match event {
                            ViewQueryResultEvent::TotalCount(total) => state.total += total,
                            ViewQueryResultEvent::Offset(offset) => {
                                state.offset = Some(state.offset.map_or(offset, |o| o.min(offset)))
                            }
                            ViewQueryResultEvent::UpdateSequence(seq) => state.seq = state.seq.max(seq),
                            ViewQueryResultEvent::Row(
                                row @ (ViewRow::WithDoc { .. } | ViewRow::WithMalformedDoc { .. }),
                            ) => return Some((Ok(ViewQueryResultEvent::Row(row)), state)),
                            _ => {}
                        },
                        Some(Err(e)) => {
                            state.failed = true;
                            return Some((Err(e), state));
                        }
                        None => state.rows = None,
                    }
                }
            }
        })
    }

    /// Documents for `ids`, in server order. Missing ids are skipped.
    pub fn get_many<T, S>(
        &self,
        ids: S,
        behaviour: EntityExceptionBehaviour,
    ) -> impl Stream<Item = Result<T>> + Send + 'static
    where
        T: DeserializeOwned + Send + 'static,
        S: Stream<Item = String> + Send + 'static,
    {
        self.get_for_pagination::<T, S>(ids, behaviour)
            .try_filter_map(|event| async move { Ok(event.into_row().and_then(ViewRow::into_doc)) })
    }
}
