//! The `couchstream` crate is a CouchDB client that decodes responses as
//! they arrive.
//!
//! View and mango queries, bulk operations and the changes feed are exposed
//! as `futures::Stream`s of typed events; a result set is never buffered as a
//! whole.
//!
//! ```no_run
//! # use couchstream::{Client, EntityExceptionBehaviour, ViewQuery, ViewQueryResultEvent};
//! # use futures_util::stream::StreamExt;
//! # use serde_json::Value;
//! #
//! # #[tokio::main]
//! # async fn main() -> couchstream::Result<()> {
//! let client = Client::builder("http://localhost:5984", "patients")
//!     .basic_auth("admin", "secret")
//!     .build()?;
//! let query = ViewQuery::new()
//!     .design_doc_id("_design/Patient")
//!     .view_name("all")
//!     .include_docs(true);
//! let mut events = Box::pin(client.query_view::<String, Value, Value>(&query, EntityExceptionBehaviour::Recover));
//! while let Some(event) = events.next().await {
//!     match event? {
//!         ViewQueryResultEvent::TotalCount(total) => println!("{} rows", total),
//!         ViewQueryResultEvent::Row(row) => println!("{}", row.id()),
//!         _ => {}
//!     }
//! }
//! # Ok(())
//! # }
//! ```

mod bulk;
mod changes;
mod client;
mod document;
mod error;
mod event;
pub mod json;
mod query;
pub mod transport;
mod view;

pub use bulk::{AllDocsValue, BulkUpdateStream, PaginationEvent, PAGINATION_BATCH_SIZE};
pub use changes::{ChangesSubscription, SubscriptionOptions, TypeProvider, TypeRegistry};
pub use client::{Client, ClientBuilder, Credentials, CredentialsProvider, Membership};
pub use document::{
    is_valid_revision, CouchDocument, DesignDocument, DocumentOption, SimpleViewGenerator, View,
    ViewDefinition, ViewGenerator, ViewSource,
};
pub use error::{Error, Result, ServerError};
pub use event::{
    BulkUpdateResult, Change, ChangeRevision, ChangesChunk, DocIdentifier, EntityExceptionBehaviour,
    IdAndRev, MangoQueryResult, ViewQueryResultEvent, ViewRow,
};
pub use query::{MangoQuery, ViewQuery, ALL_DOCS};
pub use transport::{BodyStream, Request, Response, Transport};
