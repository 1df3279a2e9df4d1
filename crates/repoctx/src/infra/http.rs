//! Blocking HTTP transport used by the remote providers.
//!
//! Providers talk to a [`HttpTransport`] instead of a concrete client so the GitHub and GitLab
//! logic can be exercised against [`MemoryTransport`] in tests. Non-2xx responses are returned
//! as values; only transport-level failures become errors.

use std::collections::HashMap;
use std::fmt;
use std::io::Read;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::de::DeserializeOwned;

use crate::domain::errors::{SourceError, SourceErrorKind};

const USER_AGENT: &str = concat!("repoctx/", env!("CARGO_PKG_VERSION"));
const MAX_BODY_BYTES: u64 = 64 * 1024 * 1024;

/// Response captured in memory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Response with no headers.
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    /// Builder used by tests and [`MemoryTransport`] routes.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// True for any 2xx status.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Body decoded lossily as UTF-8.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Deserialize the body; malformed JSON is a `ParseError`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, SourceError> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// Minimal GET-only client contract.
pub trait HttpTransport: Send + Sync + fmt::Debug {
    /// Perform a GET. Non-2xx statuses come back as `Ok`; only transport failures are errors.
    fn get(&self, url: &str, headers: &[(String, String)]) -> Result<HttpResponse, SourceError>;
}

/// Run a blocking request on tokio's blocking pool.
pub async fn get_async(
    transport: Arc<dyn HttpTransport>,
    url: String,
    headers: Vec<(String, String)>,
) -> Result<HttpResponse, SourceError> {
    tokio::task::spawn_blocking(move || transport.get(&url, &headers))
        .await
        .map_err(|err| SourceError::new(SourceErrorKind::Unknown, format!("request task failed: {err}")))?
}

/// `ureq` backed transport.
pub struct UreqTransport {
    agent: ureq::Agent,
}

impl fmt::Debug for UreqTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UreqTransport").finish_non_exhaustive()
    }
}

impl Default for UreqTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl UreqTransport {
    /// Agent with a per-request `timeout` and the crate's user agent.
    pub fn new(timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build();
        Self { agent }
    }
}

impl HttpTransport for UreqTransport {
    fn get(&self, url: &str, headers: &[(String, String)]) -> Result<HttpResponse, SourceError> {
        let mut request = self.agent.get(url);
        for (name, value) in headers {
            request = request.set(name, value);
        }

        let response = match request.call() {
            Ok(response) => response,
            Err(ureq::Error::Status(_, response)) => response,
            Err(ureq::Error::Transport(err)) => {
                return Err(SourceError::network(format!("request to {url} failed: {err}")));
            }
        };

        let status = response.status();
        let headers = response
            .headers_names()
            .into_iter()
            .filter_map(|name| {
                let value = response.header(&name)?.to_owned();
                Some((name, value))
            })
            .collect();

        let body = read_body(response.into_reader(), MAX_BODY_BYTES, url)?;

        tracing::trace!(url, status, bytes = body.len(), "http response");
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

/// Read at most `limit` bytes; a longer body is an error rather than a silent truncation.
fn read_body(reader: impl Read, limit: u64, url: &str) -> Result<Vec<u8>, SourceError> {
    let mut body = Vec::new();
    reader
        .take(limit.saturating_add(1))
        .read_to_end(&mut body)
        .map_err(|err| SourceError::network(format!("reading {url} failed: {err}")))?;
    if body.len() as u64 > limit {
        return Err(SourceError::parse(format!(
            "response from {url} exceeds {limit} bytes"
        )));
    }
    Ok(body)
}

/// Request recorded by [`MemoryTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
}

/// In-memory transport answering from a fixed route table. Unknown URLs get a 404.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    routes: Mutex<HashMap<String, Vec<Result<HttpResponse, SourceError>>>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl MemoryTransport {
    /// Empty route table; every URL answers 404.
    pub fn new() -> Self {
        Self::default()
    }

    /// Always answer `url` with `response`.
    pub fn route(self, url: impl Into<String>, response: HttpResponse) -> Self {
        self.push(url.into(), Ok(response));
        self
    }

    /// Queue responses for `url`; they are served in order and the last one repeats.
    pub fn sequence(
        self,
        url: impl Into<String>,
        responses: impl IntoIterator<Item = Result<HttpResponse, SourceError>>,
    ) -> Self {
        let url = url.into();
        for response in responses {
            self.push(url.clone(), response);
        }
        self
    }

    /// Always answer `url` with a 200 JSON body.
    pub fn json(self, url: impl Into<String>, body: serde_json::Value) -> Self {
        self.route(url, HttpResponse::new(200, body.to_string()))
    }

    /// Every request received so far, in order.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    fn push(&self, url: String, response: Result<HttpResponse, SourceError>) {
        if let Ok(mut routes) = self.routes.lock() {
            routes.entry(url).or_default().push(response);
        }
    }
}

impl HttpTransport for MemoryTransport {
    fn get(&self, url: &str, headers: &[(String, String)]) -> Result<HttpResponse, SourceError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(RecordedRequest {
                url: url.to_owned(),
                headers: headers.to_vec(),
            });
        }

        let mut routes = self
            .routes
            .lock()
            .map_err(|_| SourceError::new(SourceErrorKind::Unknown, "route table poisoned"))?;
        match routes.get_mut(url) {
            Some(queue) if queue.len() > 1 => queue.remove(0),
            Some(queue) if !queue.is_empty() => queue[0].clone(),
            _ => Ok(HttpResponse::new(404, r#"{"message":"Not Found"}"#)),
        }
    }
}
