use reqwest::StatusCode;
use serde_json::Value;
use std::fmt;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),
    #[error("{0}")]
    InvalidArgument(String),

    /// 403 from the server.
    #[error("{0}")]
    Unauthorized(ServerError),
    /// 404 from the server.
    #[error("{0}")]
    NotFound(ServerError),
    /// 409 from the server, usually a stale revision.
    #[error("{0}")]
    Conflict(ServerError),
    /// Any other non-success status.
    #[error("{0}")]
    InvalidResponse(ServerError),

    /// The response does not have the expected JSON shape.
    #[error("malformed response: {0}")]
    Protocol(String),
    #[error("parsing failed: {error} in {json}")]
    ParsingFailed {
        error: serde_json::Error,
        json: String,
    },
    #[error("cannot deserialize item with id: {id}, error in {field}")]
    Decode {
        id: String,
        field: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("view row error: {error}")]
    ViewResult { key: Option<Value>, error: String },
    #[error("error executing request {url}: {error}")]
    QueryFailed { url: String, error: String },
    #[error("mango query failed: {error}: {reason}")]
    Mango { error: String, reason: String },
    /// The server answered `ok: false` or omitted mandatory fields.
    #[error("{error}: {reason}")]
    Rejected { error: String, reason: String },

    #[error("no changes nor heartbeat detected {stalls} times in a row with seq {seq}, aborting subscription. Corrupted change?")]
    SubscriptionAborted { seq: String, stalls: u32 },
}

impl Error {
    /// HTTP status carried by the error, if it came from a server response.
    pub fn status_code(&self) -> Option<StatusCode> {
        self.server_error().map(|e| e.status)
    }

    pub fn server_error(&self) -> Option<&ServerError> {
        match self {
            Error::Unauthorized(e)
            | Error::NotFound(e)
            | Error::Conflict(e)
            | Error::InvalidResponse(e) => Some(e),
            _ => None,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol(message.into())
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        Error::InvalidArgument(message.into())
    }
}

/// Diagnostic payload of an error status returned by the server.
///
/// `request_id` and `body_time_ms` come from the `X-Couch-Request-ID` and
/// `X-Couchdb-Body-Time` response headers so failures can be matched with the
/// server logs.
#[derive(Debug, Clone)]
pub struct ServerError {
    pub message: String,
    pub status: StatusCode,
    pub body: String,
    pub request_id: Option<String>,
    pub body_time_ms: Option<u64>,
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.message, self.status.as_u16(), self.body)?;
        if let Some(request_id) = &self.request_id {
            write!(f, " [request {}]", request_id)?;
        }
        Ok(())
    }
}
