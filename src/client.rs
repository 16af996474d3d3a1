use crate::document::{
    group_by_design_document, require_id, require_rev, require_valid_rev, CouchDocument,
    DesignDocument, DocumentOption, ViewGenerator,
};
use crate::error::{Error, Result};
use crate::event::DocIdentifier;
use crate::json::{typed_array, JsonTokens};
use crate::transport::{BodyStream, Request, Response, Transport, REQUEST_ID_HEADER};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use futures_util::stream::{self, Stream, TryStreamExt};
use log::{debug, warn};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_derive::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use url::Url;

#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Called before every request so that rotated credentials are picked up.
pub type CredentialsProvider = Arc<dyn Fn() -> Credentials + Send + Sync>;

pub struct ClientBuilder {
    server_url: String,
    db_name: String,
    credentials: Option<CredentialsProvider>,
    strict_mode: bool,
    default_headers: HeaderMap,
    transport: Option<Arc<dyn Transport>>,
}

impl ClientBuilder {
    pub fn credentials_provider<F>(mut self, provider: F) -> Self
    where
        F: Fn() -> Credentials + Send + Sync + 'static,
    {
        self.credentials = Some(Arc::new(provider));
        self
    }

    pub fn basic_auth(self, username: impl Into<String>, password: impl Into<String>) -> Self {
        let credentials = Credentials::new(username, password);
        self.credentials_provider(move || credentials.clone())
    }

    /// Reject updates whose revision is missing or malformed before sending
    /// them.
    pub fn strict_mode(mut self, strict: bool) -> Self {
        self.strict_mode = strict;
        self
    }

    pub fn default_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.default_headers.insert(name, value);
        self
    }

    pub fn transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    pub fn build(self) -> Result<Client> {
        let server_url = Url::parse(&self.server_url)?;
        let db_url = with_segments(&server_url, [self.db_name.as_str()])?;
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(reqwest::Client::new()));
        Ok(Client {
            inner: Arc::new(Inner {
                transport,
                server_url,
                db_url,
                credentials: self.credentials,
                strict_mode: self.strict_mode,
                default_headers: self.default_headers,
            }),
            request_id: None,
        })
    }
}

struct Inner {
    transport: Arc<dyn Transport>,
    server_url: Url,
    db_url: Url,
    credentials: Option<CredentialsProvider>,
    strict_mode: bool,
    default_headers: HeaderMap,
}

/// Client bound to one database. Cheap to clone.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
    request_id: Option<String>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("db_url", &self.inner.db_url.as_str())
            .field("strict_mode", &self.inner.strict_mode)
            .field("request_id", &self.request_id)
            .finish()
    }
}

// Create/update/delete response body.
#[derive(Deserialize, Debug)]
struct CudResponse {
    id: Option<String>,
    rev: Option<String>,
    ok: Option<bool>,
    error: Option<String>,
    reason: Option<String>,
}

impl CudResponse {
    fn validate(self) -> Result<(String, String)> {
        if let Some(error) = self.error {
            return Err(Error::Rejected {
                error,
                reason: self.reason.unwrap_or_else(|| "-".to_string()),
            });
        }
        let rejected = |reason: &str| Error::Rejected {
            error: "invalid_response".to_string(),
            reason: reason.to_string(),
        };
        if self.ok != Some(true) {
            return Err(rejected("ok is not true"));
        }
        let id = self.id.ok_or_else(|| rejected("missing id"))?;
        let rev = self.rev.ok_or_else(|| rejected("missing rev"))?;
        Ok((id, rev))
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Membership {
    pub all_nodes: Vec<String>,
    pub cluster_nodes: Vec<String>,
}

#[derive(Deserialize, Debug)]
struct AttachmentResult {
    rev: String,
}

pub(crate) fn with_segments<'a>(
    base: &Url,
    segments: impl IntoIterator<Item = &'a str>,
) -> Result<Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| Error::invalid_argument(format!("{} cannot be a base url", base)))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

pub(crate) async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T> {
    let bytes = response.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|error| Error::ParsingFailed {
        error,
        json: String::from_utf8_lossy(&bytes).into_owned(),
    })
}

impl Client {
    pub fn builder(server_url: impl Into<String>, db_name: impl Into<String>) -> ClientBuilder {
        ClientBuilder {
            server_url: server_url.into(),
            db_name: db_name.into(),
            credentials: None,
            strict_mode: false,
            default_headers: HeaderMap::new(),
            transport: None,
        }
    }

    /// Clone whose requests carry `X-Couch-Request-ID: <id>`.
    pub fn with_request_id(&self, id: impl Into<String>) -> Self {
        Self {
            inner: self.inner.clone(),
            request_id: Some(id.into()),
        }
    }

    pub fn db_url(&self) -> &Url {
        &self.inner.db_url
    }

    pub fn is_strict_mode(&self) -> bool {
        self.inner.strict_mode
    }

    pub(crate) fn server_path(&self, segments: &[&str]) -> Result<Url> {
        with_segments(&self.inner.server_url, segments.iter().copied())
    }

    pub(crate) fn db_path(&self, segments: &[&str]) -> Result<Url> {
        with_segments(&self.inner.db_url, segments.iter().copied())
    }

    /// Design document ids address two path segments.
    pub(crate) fn doc_url(&self, id: &str) -> Result<Url> {
        match id.strip_prefix("_design/") {
            Some(name) => self.db_path(&["_design", name]),
            None => self.db_path(&[id]),
        }
    }

    pub(crate) fn request(&self, method: Method, url: Url) -> Result<Request> {
        let mut request = Request::new(method, url);
        request.headers = self.inner.default_headers.clone();
        if let Some(provider) = &self.inner.credentials {
            let Credentials { username, password } = provider();
            let token = STANDARD.encode(format!("{}:{}", username, password));
            let value = HeaderValue::from_str(&format!("Basic {}", token))
                .map_err(|e| Error::invalid_argument(format!("invalid credentials: {}", e)))?;
            request.headers.insert(AUTHORIZATION, value);
        }
        if let Some(request_id) = &self.request_id {
            let value = HeaderValue::from_str(request_id)
                .map_err(|e| Error::invalid_argument(format!("invalid request id: {}", e)))?;
            request.headers.insert(REQUEST_ID_HEADER, value);
        }
        Ok(request)
    }

    pub(crate) fn json_request(
        &self,
        method: Method,
        url: Url,
        body: &(impl serde::Serialize + ?Sized),
    ) -> Result<Request> {
        let body = serde_json::to_vec(body).map_err(|error| Error::ParsingFailed {
            error,
            json: String::new(),
        })?;
        let mut request = self.request(method, url)?;
        request
            .headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        request.body = Some(Bytes::from(body));
        Ok(request)
    }

    /// Sends the request without looking at the status.
    pub(crate) async fn execute(&self, request: Request) -> Result<Response> {
        let start = Instant::now();
        let description = format!("{} {}", request.method, request.url);
        let response = self.inner.transport.execute(request).await?;
        debug!(
            "{} : timing {} ms (status {})",
            description,
            start.elapsed().as_millis(),
            response.status.as_u16()
        );
        Ok(response)
    }

    pub(crate) async fn send(&self, request: Request) -> Result<Response> {
        self.execute(request).await?.error_for_status().await
    }

    pub(crate) async fn fetch<T: DeserializeOwned>(
        &self,
        request: Request,
        null_if_404: bool,
    ) -> Result<Option<T>> {
        match self.send(request).await {
            Ok(response) => read_json(response).await.map(Some),
            Err(Error::NotFound(_)) if null_if_404 => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn fetch_required<T: DeserializeOwned>(&self, request: Request) -> Result<T> {
        let url = request.url.to_string();
        self.fetch(request, false)
            .await?
            .ok_or_else(|| Error::protocol(format!("empty response from {}", url)))
    }

    pub async fn get<T: DeserializeOwned>(
        &self,
        id: &str,
        options: &[DocumentOption],
    ) -> Result<Option<T>> {
        require_id(id)?;
        let mut url = self.doc_url(id)?;
        for option in options {
            url.query_pairs_mut().append_pair(option.param_name(), "true");
        }
        self.fetch(self.request(Method::GET, url)?, true).await
    }

    pub async fn get_revision<T: DeserializeOwned>(
        &self,
        id: &str,
        rev: &str,
        options: &[DocumentOption],
    ) -> Result<Option<T>> {
        require_id(id)?;
        require_rev(Some(rev))?;
        let mut url = self.doc_url(id)?;
        url.query_pairs_mut().append_pair("rev", rev);
        for option in options {
            url.query_pairs_mut().append_pair(option.param_name(), "true");
        }
        self.fetch(self.request(Method::GET, url)?, true).await
    }

    /// Creates the document and returns it stamped with the server assigned
    /// id and revision.
    pub async fn create<T: CouchDocument>(&self, entity: T) -> Result<T> {
        let url = self.inner.db_url.clone();
        let request = self.json_request(Method::POST, url, &entity)?;
        let (id, rev) = self.fetch_required::<CudResponse>(request).await?.validate()?;
        Ok(entity.with_id_rev(Some(id), rev))
    }

    pub async fn update<T: CouchDocument>(&self, entity: T) -> Result<T> {
        let id = entity.id().to_string();
        require_id(&id)?;
        if self.inner.strict_mode {
            require_valid_rev(entity.rev())?;
        } else if entity.rev().map_or(true, |rev| rev.trim().is_empty()) {
            warn!(
                "Try to update {} of type {} with null or blank revision",
                id,
                std::any::type_name::<T>()
            );
        }
        let request = self.json_request(Method::PUT, self.doc_url(&id)?, &entity)?;
        let (id, rev) = self.fetch_required::<CudResponse>(request).await?.validate()?;
        Ok(entity.with_id_rev(Some(id), rev))
    }

    pub async fn delete<T: CouchDocument>(&self, entity: &T) -> Result<DocIdentifier> {
        require_id(entity.id())?;
        let rev = require_rev(entity.rev())
            .map_err(|_| Error::invalid_argument("Revision cannot be blank"))?;
        let mut url = self.doc_url(entity.id())?;
        url.query_pairs_mut().append_pair("rev", rev);
        let request = self.request(Method::DELETE, url)?;
        let (id, rev) = self.fetch_required::<CudResponse>(request).await?.validate()?;
        Ok(DocIdentifier {
            id: Some(id),
            rev: Some(rev),
        })
    }

    pub async fn exists(&self) -> Result<bool> {
        let request = self.request(Method::GET, self.inner.db_url.clone())?;
        let info = self.fetch::<Map<String, Value>>(request, true).await?;
        Ok(info.is_some_and(|info| info.contains_key("db_name")))
    }

    /// Creates the database with `q` shards and `n` replicas when given.
    pub async fn create_database(&self, q: Option<u32>, n: Option<u32>) -> Result<bool> {
        let mut url = self.inner.db_url.clone();
        if let Some(q) = q {
            url.query_pairs_mut().append_pair("q", &q.to_string());
        }
        if let Some(n) = n {
            url.query_pairs_mut().append_pair("n", &n.to_string());
        }
        let result = self
            .fetch::<Map<String, Value>>(self.request(Method::PUT, url)?, true)
            .await?;
        Ok(is_ok(result))
    }

    pub async fn destroy_database(&self) -> Result<bool> {
        let request = self.request(Method::DELETE, self.inner.db_url.clone())?;
        let result = self.fetch::<Map<String, Value>>(request, true).await?;
        Ok(is_ok(result))
    }

    pub async fn design_document_ids(&self) -> Result<BTreeSet<String>> {
        let request = self.request(Method::GET, self.db_path(&["_design_docs"])?)?;
        let result = self.fetch::<Value>(request, true).await?;
        Ok(result
            .as_ref()
            .and_then(|r| r.get("rows"))
            .and_then(Value::as_array)
            .map(|rows| {
                rows.iter()
                    .filter_map(|row| row.get("key").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Names of all the databases of the server.
    pub fn all_databases(&self) -> impl Stream<Item = Result<String>> + Send + 'static {
        let client = self.clone();
        stream::once(async move {
            let request = client.request(Method::GET, client.server_path(&["_all_dbs"])?)?;
            let response = client.send(request).await?;
            Ok::<_, Error>(typed_array::<String>(JsonTokens::new(response.body)))
        })
        .try_flatten()
    }

    pub async fn membership(&self) -> Result<Membership> {
        let request = self.request(Method::GET, self.server_path(&["_membership"])?)?;
        self.fetch_required(request).await
    }

    pub async fn server_version(&self) -> Result<String> {
        let request = self.request(Method::GET, self.inner.server_url.clone())?;
        let info = self.fetch_required::<Map<String, Value>>(request).await?;
        info.get("version")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::protocol("server info without version"))
    }

    pub async fn get_attachment(
        &self,
        id: &str,
        attachment_id: &str,
        rev: Option<&str>,
    ) -> Result<BodyStream> {
        require_id(id)?;
        if attachment_id.trim().is_empty() {
            return Err(Error::invalid_argument("attachmentId cannot be blank"));
        }
        let mut url = with_segments(&self.doc_url(id)?, [attachment_id])?;
        if let Some(rev) = rev {
            url.query_pairs_mut().append_pair("rev", rev);
        }
        let response = self.send(self.request(Method::GET, url)?).await?;
        Ok(response.body)
    }

    /// Returns the new revision of the document.
    pub async fn create_attachment(
        &self,
        id: &str,
        attachment_id: &str,
        rev: &str,
        content_type: &str,
        data: Bytes,
    ) -> Result<String> {
        let url = self.attachment_url(id, attachment_id, rev)?;
        let mut request = self.request(Method::PUT, url)?;
        let content_type = HeaderValue::from_str(content_type)
            .map_err(|e| Error::invalid_argument(format!("invalid content type: {}", e)))?;
        request.headers.insert(CONTENT_TYPE, content_type);
        request.body = Some(data);
        Ok(self.fetch_required::<AttachmentResult>(request).await?.rev)
    }

    pub async fn delete_attachment(
        &self,
        id: &str,
        attachment_id: &str,
        rev: &str,
    ) -> Result<String> {
        let url = self.attachment_url(id, attachment_id, rev)?;
        let request = self.request(Method::DELETE, url)?;
        Ok(self.fetch_required::<AttachmentResult>(request).await?.rev)
    }

    fn attachment_url(&self, id: &str, attachment_id: &str, rev: &str) -> Result<Url> {
        require_id(id)?;
        if attachment_id.trim().is_empty() {
            return Err(Error::invalid_argument("attachmentId cannot be blank"));
        }
        require_rev(Some(rev))?;
        let mut url = with_segments(&self.doc_url(id)?, [attachment_id])?;
        url.query_pairs_mut().append_pair("rev", rev);
        Ok(url)
    }

    /// Publishes the views produced by `generator` for `source`.
    ///
    /// Views are merged into the design documents already stored under the
    /// same ids; existing definitions are replaced only when `overwrite` is
    /// set. Returns the identifiers of the design documents written.
    pub async fn create_or_update_design_documents<S, G>(
        &self,
        source: &S,
        generator: &G,
        base_id: &str,
        overwrite: bool,
    ) -> Result<Vec<DocIdentifier>>
    where
        S: ?Sized,
        G: ViewGenerator<S> + ?Sized,
    {
        let grouped = group_by_design_document(generator.generate_views(source, base_id));
        let mut written = Vec::new();
        for (doc_id, views) in grouped {
            let mut design_doc = self
                .get::<DesignDocument>(&doc_id, &[])
                .await?
                .unwrap_or_else(|| DesignDocument::new(doc_id.clone()));
            if !design_doc.merge_views(views, overwrite) {
                debug!("Design document {} is up to date", doc_id);
                continue;
            }
            let request = self.json_request(Method::PUT, self.doc_url(&doc_id)?, &design_doc)?;
            let (id, rev) = self.fetch_required::<CudResponse>(request).await?.validate()?;
            written.push(DocIdentifier {
                id: Some(id),
                rev: Some(rev),
            });
        }
        Ok(written)
    }
}

fn is_ok(result: Option<Map<String, Value>>) -> bool {
    result.is_some_and(|r| r.get("ok") == Some(&Value::Bool(true)))
}
