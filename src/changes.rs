//! Changes feed: a bounded read and a self-healing continuous subscription.

use crate::client::{read_json, Client};
use crate::error::{Error, Result};
use crate::event::{deserialize_seq, seq_to_string, Change, ChangeRevision, ChangesChunk};
use crate::json::{events, JsonEvent, JsonTokens, ValueBuilder};
use crate::transport::BodyStream;
use bytes::{buf::IntoIter, Bytes};
use futures_util::stream::{Stream, StreamExt};
use log::{debug, error, info, warn};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_derive::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::mem::replace;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

/// Decodes the document of a change once its discriminator is known.
pub trait TypeProvider<T>: Send + Sync + 'static {
    /// `None` when no type is known for `discriminator`; such changes are
    /// dropped.
    fn decode_doc(&self, discriminator: &str, doc: Value) -> Option<serde_json::Result<T>>;
}

impl<T, F> TypeProvider<T> for F
where
    F: Fn(&str, Value) -> Option<serde_json::Result<T>> + Send + Sync + 'static,
{
    fn decode_doc(&self, discriminator: &str, doc: Value) -> Option<serde_json::Result<T>> {
        self(discriminator, doc)
    }
}

type DocDecoder<T> = Box<dyn Fn(Value) -> serde_json::Result<T> + Send + Sync>;

fn decode_as<T, U: DeserializeOwned + Into<T>>(doc: Value) -> serde_json::Result<T> {
    serde_json::from_value::<U>(doc).map(Into::into)
}

/// Maps discriminator values to concrete document types.
///
/// ```
/// # use couchstream::TypeRegistry;
/// # use serde_derive::Deserialize;
/// #[derive(Deserialize)]
/// struct Patient { name: String }
///
/// enum Entity { Patient(Patient) }
///
/// impl From<Patient> for Entity {
///     fn from(patient: Patient) -> Self { Entity::Patient(patient) }
/// }
///
/// let registry = TypeRegistry::<Entity>::new().register::<Patient>("Patient");
/// assert!(registry.contains("Patient"));
/// ```
pub struct TypeRegistry<T> {
    decoders: HashMap<String, DocDecoder<T>>,
}

impl<T: 'static> TypeRegistry<T> {
    pub fn new() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    pub fn register<U>(mut self, discriminator: impl Into<String>) -> Self
    where
        U: DeserializeOwned + Into<T> + 'static,
    {
        self.decoders.insert(
            discriminator.into(),
            Box::new(decode_as::<T, U>),
        );
        self
    }

    pub fn contains(&self, discriminator: &str) -> bool {
        self.decoders.contains_key(discriminator)
    }
}

impl<T: 'static> Default for TypeRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for TypeRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("types", &self.decoders.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<T: 'static> TypeProvider<T> for TypeRegistry<T> {
    fn decode_doc(&self, discriminator: &str, doc: Value) -> Option<serde_json::Result<T>> {
        self.decoders.get(discriminator).map(|decode| decode(doc))
    }
}

/// Tuning of [`Client::subscribe_for_changes`].
#[derive(Debug, Clone)]
pub struct SubscriptionOptions {
    /// Sequence to start from, `"now"` for future changes only.
    pub since: String,
    pub initial_backoff: Duration,
    pub backoff_factor: u32,
    pub max_backoff: Duration,
    /// Heartbeat period requested from the server.
    pub heartbeat: Duration,
    /// How often the connection liveness is checked.
    pub watchdog_period: Duration,
    /// A connection without any byte for that long is considered stalled.
    pub heartbeat_timeout: Duration,
    /// Consecutive stalls without progress before giving up.
    pub max_stalls: u32,
    pub channel_capacity: usize,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            since: "now".to_string(),
            initial_backoff: Duration::from_millis(100),
            backoff_factor: 2,
            max_backoff: Duration::from_secs(10),
            heartbeat: Duration::from_secs(10),
            watchdog_period: Duration::from_secs(32),
            heartbeat_timeout: Duration::from_secs(28),
            max_stalls: 3,
            channel_capacity: 64,
        }
    }
}

impl SubscriptionOptions {
    pub fn since(mut self, since: impl Into<String>) -> Self {
        self.since = since.into();
        self
    }

    pub fn backoff(mut self, initial: Duration, factor: u32, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.backoff_factor = factor;
        self.max_backoff = max;
        self
    }
}

/// Last time a byte was read from the feed, as milliseconds since `origin`.
///
/// The connection is never idle while a change waits for room in the
/// subscriber channel: the feed is not read during that time.
#[derive(Debug)]
struct Activity {
    origin: Instant,
    last: AtomicU64,
    waiting: AtomicBool,
}

impl Activity {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
            last: AtomicU64::new(0),
            waiting: AtomicBool::new(false),
        }
    }

    fn wait_for_consumer(&self) {
        self.waiting.store(true, Ordering::Relaxed);
    }

    fn consumer_ready(&self) {
        self.touch();
        self.waiting.store(false, Ordering::Relaxed);
    }

    fn touch(&self) {
        let elapsed = self.origin.elapsed().as_millis() as u64;
        self.last.store(elapsed, Ordering::Relaxed);
    }

    fn idle(&self) -> Duration {
        if self.waiting.load(Ordering::Relaxed) {
            return Duration::ZERO;
        }
        let last = Duration::from_millis(self.last.load(Ordering::Relaxed));
        self.origin.elapsed().saturating_sub(last)
    }
}

#[cfg(feature = "metrics")]
static DATABASE_LABEL: once_cell::sync::Lazy<regex::Regex> =
    once_cell::sync::Lazy::new(|| regex::Regex::new(r"(?m)[_/]+").unwrap());

#[derive(Clone)]
struct FeedMetrics {
    #[cfg(feature = "metrics")]
    bytes: metrics::Counter,
    #[cfg(feature = "metrics")]
    entries: metrics::Counter,
    #[cfg(feature = "metrics")]
    dropped: metrics::Counter,
}

impl FeedMetrics {
    fn new(db_url: &url::Url) -> Self {
        #[cfg(feature = "metrics")]
        let feed = {
            let database = DATABASE_LABEL
                .replace_all(
                    &format!("{}_{}", db_url.host_str().unwrap_or_default(), db_url.path()),
                    "_",
                )
                .to_string();
            let bytes_name = "couchdb_changes_bytes_total";
            let entries_name = "couchdb_changes_entries_total";
            let dropped_name = "couchdb_changes_dropped_total";
            metrics::describe_counter!(bytes_name, metrics::Unit::Bytes, "Changes stream bytes");
            metrics::describe_counter!(
                entries_name,
                metrics::Unit::Count,
                "Changes stream entries"
            );
            metrics::describe_counter!(
                dropped_name,
                metrics::Unit::Count,
                "Changes stream entries without a known document type"
            );
            Self {
                bytes: metrics::counter!(bytes_name, "database" => database.clone()),
                entries: metrics::counter!(entries_name, "database" => database.clone()),
                dropped: metrics::counter!(dropped_name, "database" => database),
            }
        };
        #[cfg(not(feature = "metrics"))]
        let feed = {
            let _ = db_url;
            Self {}
        };
        feed
    }

    #[allow(unused_variables)]
    fn record_bytes(&self, len: usize) {
        #[cfg(feature = "metrics")]
        self.bytes.increment(len as u64);
    }

    fn record_entry(&self) {
        #[cfg(feature = "metrics")]
        self.entries.increment(1);
    }

    fn record_dropped(&self) {
        #[cfg(feature = "metrics")]
        self.dropped.increment(1);
    }
}

/// Splits a continuous feed body into lines.
///
/// Blank heartbeat lines are skipped but still count as activity.
struct ChangeLines {
    metrics: FeedMetrics,
    activity: Arc<Activity>,
    /// Source of http chunks
    source: BodyStream,
    /// Buffer of current line and current chunk iterator
    buf: (Vec<u8>, Option<IntoIter<Bytes>>),
    done: bool,
}

impl ChangeLines {
    fn new(source: BodyStream, activity: Arc<Activity>, metrics: FeedMetrics) -> Self {
        Self {
            metrics,
            activity,
            source,
            buf: (Vec::new(), None),
            done: false,
        }
    }
}

/// Strips `\r` (CouchDB >= 2.0 sends "\r\n") and the `,` separating the
/// entries of a normal feed. `None` for blank lines.
fn trim_line(line: &[u8]) -> Option<&[u8]> {
    let mut len = line.len();
    while len > 0 && line[len - 1].is_ascii_whitespace() {
        len -= 1;
    }
    if len > 0 && line[len - 1] == b',' {
        len -= 1;
    }
    let line = &line[..len];
    (!line.iter().all(u8::is_ascii_whitespace)).then_some(line)
}

impl Stream for ChangeLines {
    type Item = Result<Vec<u8>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        'main: loop {
            if self.done {
                return Poll::Ready(None);
            }
            if self.buf.1.is_none() {
                match Stream::poll_next(self.source.as_mut(), cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(None) => {
                        self.done = true;
                        // last line without a trailing '\n'
                        let line = replace(&mut self.buf.0, Vec::new());
                        if let Some(line) = trim_line(&line) {
                            self.metrics.record_entry();
                            return Poll::Ready(Some(Ok(line.to_vec())));
                        }
                        return Poll::Ready(None);
                    }
                    Poll::Ready(Some(Ok(chunk))) => {
                        self.activity.touch();
                        self.metrics.record_bytes(chunk.len());
                        self.buf.1 = Some(chunk.into_iter())
                    }
                    Poll::Ready(Some(Err(err))) => {
                        self.done = true;
                        return Poll::Ready(Some(Err(err)));
                    }
                }
            } else {
                let (line, chunk_iter) = &mut self.buf;
                let Some(iter) = chunk_iter.as_mut() else {
                    continue;
                };

                loop {
                    if let Some(byte) = iter.next() {
                        if byte == b'\n' {
                            break;
                        }
                        line.push(byte);
                    } else {
                        // We need another chunk to fill the line
                        *chunk_iter = None;
                        continue 'main;
                    }
                }

                let line = replace(line, Vec::with_capacity(line.len() * 2));
                let Some(line) = trim_line(&line) else {
                    continue;
                };
                self.metrics.record_entry();
                return Poll::Ready(Some(Ok(line.to_vec())));
            }
        }
    }
}

/// Rebuilds one change while looking for the discriminator field of its
/// document (depth 2, below `doc`).
struct ChangeBuffer<'a> {
    builder: ValueBuilder,
    discriminator: &'a str,
    top_field: Option<String>,
    matched: bool,
    kind: Option<String>,
}

impl<'a> ChangeBuffer<'a> {
    fn new(discriminator: &'a str) -> Self {
        Self {
            builder: ValueBuilder::new(),
            discriminator,
            top_field: None,
            matched: false,
            kind: None,
        }
    }

    /// Returns the change and its document type once `event` completes it.
    fn push(&mut self, event: JsonEvent) -> Result<Option<(Value, Option<String>)>> {
        match &event {
            JsonEvent::FieldName(name) => {
                let depth = self.builder.depth();
                if depth == 1 {
                    self.top_field = Some(name.clone());
                }
                self.matched = depth == 2
                    && self.top_field.as_deref() == Some("doc")
                    && name == self.discriminator;
            }
            JsonEvent::String(value) if self.matched => {
                self.kind = Some(value.clone());
                self.matched = false;
            }
            _ => self.matched = false,
        }
        Ok(self
            .builder
            .push(event)?
            .map(|value| (value, self.kind.take())))
    }
}

#[derive(Deserialize)]
struct ChangeHeader {
    #[serde(deserialize_with = "deserialize_seq")]
    seq: String,
    id: String,
    #[serde(default)]
    changes: Vec<ChangeRevision>,
    #[serde(default)]
    deleted: bool,
}

/// Decodes a buffered change with the type selected by its discriminator.
/// Changes of unknown type or whose document cannot be mapped are dropped.
fn materialize<T, P: TypeProvider<T> + ?Sized>(
    value: Value,
    kind: Option<String>,
    provider: &P,
    metrics: &FeedMetrics,
) -> Option<Change<T>> {
    let Value::Object(mut fields) = value else {
        return None;
    };
    let Some(kind) = kind else {
        debug!("Dropping change line without document type");
        metrics.record_dropped();
        return None;
    };
    let doc = fields.remove("doc").unwrap_or(Value::Null);
    let header = match serde_json::from_value::<ChangeHeader>(Value::Object(fields)) {
        Ok(header) => header,
        Err(e) => {
            debug!("Dropping malformed change of type {}: {}", kind, e);
            metrics.record_dropped();
            return None;
        }
    };
    match provider.decode_doc(&kind, doc) {
        Some(Ok(doc)) => Some(Change {
            seq: header.seq,
            id: header.id,
            changes: header.changes,
            doc,
            deleted: header.deleted,
        }),
        Some(Err(e)) => {
            debug!(
                "Unmarshalling error while deserialising change {} of type {}: {}",
                header.id, kind, e
            );
            metrics.record_dropped();
            None
        }
        None => {
            debug!("Dropping change {} of unknown type {}", header.id, kind);
            metrics.record_dropped();
            None
        }
    }
}

fn decode_line<T, P: TypeProvider<T> + ?Sized>(
    line: &[u8],
    discriminator: &str,
    provider: &P,
    metrics: &FeedMetrics,
) -> Result<Option<Change<T>>> {
    let mut buffer = ChangeBuffer::new(discriminator);
    for event in events(line)? {
        if let Some((value, kind)) = buffer.push(event)? {
            return Ok(materialize(value, kind, provider, metrics));
        }
    }
    Ok(None)
}

/// Handle of a running subscription.
///
/// Changes are delivered in feed order. The stream only ends with an error:
/// [`Error::SubscriptionAborted`] once the feed stalled repeatedly at the
/// same sequence. Dropping the handle stops the subscription.
pub struct ChangesSubscription<T> {
    receiver: mpsc::Receiver<Result<Change<T>>>,
    task: JoinHandle<()>,
}

impl<T> ChangesSubscription<T> {
    /// Stops the subscription; buffered changes can still be read.
    pub fn cancel(&self) {
        self.task.abort();
    }
}

impl<T> Stream for ChangesSubscription<T> {
    type Item = Result<Change<T>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

impl<T> Unpin for ChangesSubscription<T> {}

impl<T> Drop for ChangesSubscription<T> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Why a connection to the feed ended.
enum FeedEnd {
    Closed,
    Failed(Error),
    Stalled,
    Unsubscribed,
}

struct Progress {
    last_seq: String,
    stalls: u32,
    delay: Duration,
}

struct Subscriber<T> {
    client: Client,
    discriminator: String,
    provider: Arc<dyn TypeProvider<T>>,
    options: SubscriptionOptions,
    metrics: FeedMetrics,
    sender: mpsc::Sender<Result<Change<T>>>,
}

impl<T: Send + 'static> Subscriber<T> {
    async fn run(self) {
        let mut progress = Progress {
            last_seq: self.options.since.clone(),
            stalls: 0,
            delay: self.options.initial_backoff,
        };
        let db_url = self.client.db_url().to_string();
        loop {
            let activity = Arc::new(Activity::new());
            let end = tokio::select! {
                end = self.follow(&activity, &mut progress) => end,
                _ = self.watchdog(&activity) => FeedEnd::Stalled,
            };
            match end {
                FeedEnd::Unsubscribed => return,
                FeedEnd::Stalled => {
                    progress.stalls += 1;
                    if progress.stalls >= self.options.max_stalls {
                        let error = Error::SubscriptionAborted {
                            seq: progress.last_seq.clone(),
                            stalls: progress.stalls,
                        };
                        error!("{}", error);
                        let _ = self.sender.send(Err(error)).await;
                        return;
                    }
                    warn!(
                        "No heartbeat for {} ms while listening for changes on {}. Resubscribing",
                        self.options.heartbeat_timeout.as_millis(),
                        db_url
                    );
                }
                FeedEnd::Failed(e) => {
                    warn!("Error detected while listening for changes: {}", e);
                    self.back_off(&mut progress, &db_url).await;
                }
                FeedEnd::Closed => self.back_off(&mut progress, &db_url).await,
            }
        }
    }

    async fn back_off(&self, progress: &mut Progress, db_url: &str) {
        error!(
            "End of connection reached while listening for changes on {}. Will try to re-subscribe in {}ms",
            db_url,
            progress.delay.as_millis()
        );
        sleep(progress.delay).await;
        progress.delay = progress
            .delay
            .saturating_mul(self.options.backoff_factor)
            .min(self.options.max_backoff);
    }

    /// One connection: reads the feed until it ends, forwarding changes.
    async fn follow(&self, activity: &Arc<Activity>, progress: &mut Progress) -> FeedEnd {
        info!(
            "Subscribing for changes on {} since {}",
            self.client.db_url(),
            progress.last_seq
        );
        activity.touch();
        let body = match self.open(&progress.last_seq).await {
            Ok(body) => body,
            Err(e) => return FeedEnd::Failed(e),
        };
        let mut lines = ChangeLines::new(body, activity.clone(), self.metrics.clone());
        while let Some(line) = lines.next().await {
            let line = match line {
                Ok(line) => line,
                Err(e) => return FeedEnd::Failed(e),
            };
            let change = match decode_line(
                &line,
                &self.discriminator,
                self.provider.as_ref(),
                &self.metrics,
            ) {
                Ok(Some(change)) => change,
                Ok(None) => continue,
                Err(e) => return FeedEnd::Failed(e),
            };
            // the sequence only moves once the change is in the channel
            activity.wait_for_consumer();
            let permit = self.sender.reserve().await;
            activity.consumer_ready();
            let Ok(permit) = permit else {
                return FeedEnd::Unsubscribed;
            };
            progress.last_seq = change.seq.clone();
            progress.stalls = 0;
            progress.delay = self.options.initial_backoff;
            permit.send(Ok(change));
        }
        FeedEnd::Closed
    }

    async fn open(&self, since: &str) -> Result<BodyStream> {
        let mut url = self.client.db_path(&["_changes"])?;
        url.query_pairs_mut()
            .append_pair("feed", "continuous")
            .append_pair("heartbeat", &self.options.heartbeat.as_millis().to_string())
            .append_pair("include_docs", "true")
            .append_pair("since", since);
        let request = self.client.request(Method::GET, url)?;
        Ok(self.client.send(request).await?.body)
    }

    /// Completes once no byte has been read for `heartbeat_timeout`.
    async fn watchdog(&self, activity: &Activity) {
        loop {
            sleep(self.options.watchdog_period).await;
            if activity.idle() > self.options.heartbeat_timeout {
                return;
            }
        }
    }
}

impl Client {
    /// Follows the continuous changes feed of the database.
    ///
    /// Each change document is decoded with the type `provider` associates
    /// with the value of its `discriminator` field. The subscription
    /// reconnects from the last delivered sequence whenever the connection
    /// ends, with an exponential backoff, and when the server stops sending
    /// heartbeats. Must be called within a tokio runtime.
    pub fn subscribe_for_changes<T, P>(
        &self,
        discriminator: impl Into<String>,
        provider: P,
        options: SubscriptionOptions,
    ) -> ChangesSubscription<T>
    where
        T: Send + 'static,
        P: TypeProvider<T>,
    {
        let (sender, receiver) = mpsc::channel(options.channel_capacity.max(1));
        let subscriber = Subscriber {
            metrics: FeedMetrics::new(self.db_url()),
            client: self.clone(),
            discriminator: discriminator.into(),
            provider: Arc::new(provider),
            options,
            sender,
        };
        ChangesSubscription {
            receiver,
            task: tokio::spawn(subscriber.run()),
        }
    }

    /// Reads at most `limit` changes after `since` from the normal feed.
    ///
    /// Changes whose document type is unknown to `provider` are left out of
    /// `results` but still count in `last_seq` and `pending`.
    pub async fn get_changes<T, P>(
        &self,
        since: &str,
        limit: Option<u64>,
        discriminator: &str,
        provider: &P,
    ) -> Result<ChangesChunk<T>>
    where
        P: TypeProvider<T> + ?Sized,
    {
        let mut url = self.db_path(&["_changes"])?;
        url.query_pairs_mut()
            .append_pair("include_docs", "true")
            .append_pair("since", since);
        if let Some(limit) = limit {
            url.query_pairs_mut().append_pair("limit", &limit.to_string());
        }
        let response = self.send(self.request(Method::GET, url)?).await?;
        let metrics = FeedMetrics::new(self.db_url());
        let mut tokens = JsonTokens::new(response.body);
        let mut chunk = ChangesChunk {
            last_seq: String::new(),
            pending: 0,
            results: Vec::new(),
        };
        match tokens.expect().await? {
            JsonEvent::StartObject => {}
            other => {
                return Err(Error::protocol(format!(
                    "expected changes to start with an object, found {:?}",
                    other
                )))
            }
        }
        loop {
            match tokens.expect().await? {
                JsonEvent::EndObject => break,
                JsonEvent::FieldName(name) => match name.as_str() {
                    "results" => {
                        if tokens.expect().await? != JsonEvent::StartArray {
                            return Err(Error::protocol("expected results to be an array"));
                        }
                        loop {
                            let mut buffer = ChangeBuffer::new(discriminator);
                            let first = tokens.expect().await?;
                            if first == JsonEvent::EndArray {
                                break;
                            }
                            let mut completed = buffer.push(first)?;
                            while completed.is_none() {
                                completed = buffer.push(tokens.expect().await?)?;
                            }
                            if let Some((value, kind)) = completed {
                                metrics.record_entry();
                                chunk.results.extend(materialize(value, kind, provider, &metrics));
                            }
                        }
                    }
                    "last_seq" => {
                        chunk.last_seq = tokens.next_value().await?.map(seq_to_string).unwrap_or_default()
                    }
                    "pending" => {
                        chunk.pending = tokens
                            .next_number_or_null()
                            .await?
                            .and_then(|n| n.as_u64())
                            .unwrap_or_default()
                    }
                    _ => tokens.skip_value().await?,
                },
                other => {
                    return Err(Error::protocol(format!(
                        "expected a field name or the end of changes, found {:?}",
                        other
                    )))
                }
            }
        }
        Ok(chunk)
    }

    /// Sequence of the last change of the database.
    pub async fn last_seq(&self) -> Result<String> {
        let request = self.request(Method::GET, self.db_url().clone())?;
        let info = read_json::<Map<String, Value>>(self.send(request).await?).await?;
        info.get("update_seq")
            .cloned()
            .map(seq_to_string)
            .ok_or_else(|| Error::protocol("database info without update_seq"))
    }
}
