//! HTTP boundary of the client.
//!
//! The client only needs "send a request, get a status, headers and a lazy
//! body". [`Transport`] is implemented for [`reqwest::Client`]; tests plug in
//! scripted implementations.

use crate::error::{Error, Result, ServerError};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::stream::{Stream, StreamExt};
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use std::fmt;
use std::pin::Pin;
use std::time::Duration;
use url::Url;

pub const REQUEST_ID_HEADER: &str = "X-Couch-Request-ID";
pub const BODY_TIME_HEADER: &str = "X-Couchdb-Body-Time";

pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub timeout: Option<Duration>,
}

impl Request {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
            timeout: None,
        }
    }
}

pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: BodyStream,
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

impl Response {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Collects the whole body.
    pub async fn bytes(mut self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.body.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }

    pub async fn text(self) -> Result<String> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Turns 403, 404, 409 and any other non-success status into the
    /// matching error, keeping the body and the server diagnostics.
    pub async fn error_for_status(self) -> Result<Self> {
        let status = self.status;
        if status.is_success() {
            return Ok(self);
        }
        let message = match status {
            StatusCode::FORBIDDEN => "Unauthorized Access",
            StatusCode::NOT_FOUND => "Document not found",
            StatusCode::CONFLICT => "Document update Conflict",
            _ => "Unexpected response status",
        };
        let error = self.into_server_error(message).await;
        Err(match status {
            StatusCode::FORBIDDEN => Error::Unauthorized(error),
            StatusCode::NOT_FOUND => Error::NotFound(error),
            StatusCode::CONFLICT => Error::Conflict(error),
            _ => Error::InvalidResponse(error),
        })
    }

    pub async fn into_server_error(self, message: impl Into<String>) -> ServerError {
        let status = self.status;
        let request_id = self.header(REQUEST_ID_HEADER).map(str::to_string);
        let body_time_ms = self
            .header(BODY_TIME_HEADER)
            .and_then(|v| v.trim().parse().ok());
        let body = self.text().await.unwrap_or_default();
        ServerError {
            message: message.into(),
            status,
            body,
            request_id,
            body_time_ms,
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, request: Request) -> Result<Response>;
}

#[async_trait]
impl Transport for reqwest::Client {
    async fn execute(&self, request: Request) -> Result<Response> {
        let mut builder = self
            .request(request.method, request.url)
            .headers(request.headers);
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }
        let res = builder.send().await?;
        let status = res.status();
        let headers = res.headers().clone();
        let body = res.bytes_stream().map(|chunk| chunk.map_err(Error::from));
        Ok(Response {
            status,
            headers,
            body: Box::pin(body),
        })
    }
}
