#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use couchstream::{Client, CouchDocument, Request, Response, Result, Transport};
use futures_util::stream::{self, StreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::StatusCode;
use serde_derive::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct Scripted {
    status: StatusCode,
    headers: HeaderMap,
    chunks: Vec<Bytes>,
    /// Keep the body open after the last chunk.
    hang: bool,
    /// Send a blank line with that period after the last chunk, forever.
    heartbeat: Option<Duration>,
}

/// In-memory transport answering requests with scripted responses, in order.
///
/// Once the script is exhausted every request gets a 200 whose body never
/// ends.
#[derive(Clone, Default)]
pub struct FakeTransport {
    script: Arc<Mutex<VecDeque<Scripted>>>,
    requests: Arc<Mutex<Vec<Request>>>,
}

/// Splits `body` in small chunks so tokens straddle chunk boundaries.
fn chunked(body: &str, size: usize) -> Vec<Bytes> {
    body.as_bytes()
        .chunks(size)
        .map(Bytes::copy_from_slice)
        .collect()
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, scripted: Scripted) {
        self.script.lock().unwrap().push_back(scripted);
    }

    pub fn push_json(&self, status: u16, body: Value) {
        self.push_with_headers(status, &[], &body.to_string());
    }

    pub fn push_with_headers(&self, status: u16, headers: &[(&'static str, &'static str)], body: &str) {
        let mut map = HeaderMap::new();
        for &(name, value) in headers {
            map.insert(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_static(value),
            );
        }
        self.push(Scripted {
            status: StatusCode::from_u16(status).unwrap(),
            headers: map,
            chunks: chunked(body, 7),
            hang: false,
            heartbeat: None,
        });
    }

    /// A 200 whose body is `lines`, closed by the server afterwards.
    pub fn push_feed(&self, lines: &[String]) {
        self.push(Scripted {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            chunks: lines.iter().map(|l| Bytes::from(format!("{}\n", l))).collect(),
            hang: false,
            heartbeat: None,
        });
    }

    /// A 200 whose body is `lines`, then silence.
    pub fn push_stalled_feed(&self, lines: &[String]) {
        self.push(Scripted {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            chunks: lines.iter().map(|l| Bytes::from(format!("{}\n", l))).collect(),
            hang: true,
            heartbeat: None,
        });
    }

    /// A 200 whose body is `lines`, then a blank line every `period`.
    pub fn push_heartbeat_feed(&self, lines: &[String], period: Duration) {
        self.push(Scripted {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            chunks: lines.iter().map(|l| Bytes::from(format!("{}\n", l))).collect(),
            hang: true,
            heartbeat: Some(period),
        });
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn execute(&self, request: Request) -> Result<Response> {
        self.requests.lock().unwrap().push(request);
        let scripted = self.script.lock().unwrap().pop_front().unwrap_or(Scripted {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            chunks: Vec::new(),
            hang: true,
            heartbeat: None,
        });
        let chunks = stream::iter(scripted.chunks.into_iter().map(Ok));
        let body = if let Some(period) = scripted.heartbeat {
            let heartbeats = stream::unfold((), move |()| async move {
                tokio::time::sleep(period).await;
                Some((Ok::<_, couchstream::Error>(Bytes::from_static(b"\n")), ()))
            });
            chunks.chain(heartbeats).boxed()
        } else if scripted.hang {
            chunks.chain(stream::pending()).boxed()
        } else {
            chunks.boxed()
        };
        Ok(Response {
            status: scripted.status,
            headers: scripted.headers,
            body,
        })
    }
}

pub fn client(transport: &FakeTransport) -> Client {
    Client::builder("http://localhost:5984", "test")
        .basic_auth("admin", "secret")
        .transport(transport.clone())
        .build()
        .unwrap()
}

pub fn query_param(request: &Request, name: &str) -> Option<String> {
    request
        .url
        .query_pairs()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
}

pub fn json_body(request: &Request) -> Value {
    serde_json::from_slice(request.body.as_ref().unwrap()).unwrap()
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Patient {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    pub name: String,
    #[serde(default)]
    pub age: u32,
}

impl Patient {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            rev: None,
            name: name.to_string(),
            age: 42,
        }
    }
}

impl CouchDocument for Patient {
    fn id(&self) -> &str {
        &self.id
    }

    fn rev(&self) -> Option<&str> {
        self.rev.as_deref()
    }

    fn with_id_rev(self, id: Option<String>, rev: String) -> Self {
        Self {
            id: id.unwrap_or(self.id),
            rev: Some(rev),
            ..self
        }
    }
}
