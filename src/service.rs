//! Mock dispatch service.
//!
//! Ties the pieces together for one request: work out which port the
//! request arrived on, load that port's rules, read the body when needed,
//! run the matcher and turn the outcome into an HTTP response. Failures
//! become plain-text responses; nothing here brings the listener down.

use crate::config::{GlobalSettings, ResponderConfig, RuleSet};
use crate::error::{DispatchError, LookupError};
use crate::matcher::{carries_body, MatchRequest, Matcher};
use crate::store::{self, load_rule_set, RuleStore};
use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Body;
use hyper::header::{HeaderMap, HeaderValue, CONTENT_TYPE, HOST};
use hyper::{Request, Response, StatusCode};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, info_span, warn, Instrument};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Response header carrying the request's correlation tag.
pub const TAG_HEADER: &str = "x-mock-tag";

/// Correlation tag for one request.
///
/// Generated per request from the wall clock and carried in the request's
/// tracing span and response headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestTag(i64);

impl RequestTag {
    pub fn now() -> Self {
        Self(chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default())
    }
}

impl fmt::Display for RequestTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Mock dispatch service.
///
/// Holds no rule data between requests; every request loads its rule set
/// from the store.
pub struct MockService {
    store: Arc<dyn RuleStore>,
    lookup_timeout: Duration,
    settings: GlobalSettings,
    /// Total requests processed.
    requests_total: AtomicU64,
    /// Requests answered by a rule.
    requests_matched: AtomicU64,
    /// Requests no rule accepted.
    requests_unmatched: AtomicU64,
    /// Requests whose rule set could not be loaded.
    lookup_failures: AtomicU64,
}

impl MockService {
    /// Create a new service backed by `store`.
    pub fn new(store: Arc<dyn RuleStore>, lookup_timeout: Duration, settings: GlobalSettings) -> Self {
        info!(
            store = %store.describe(),
            timeout_ms = lookup_timeout.as_millis() as u64,
            "Mock responder initialized"
        );

        Self {
            store,
            lookup_timeout,
            settings,
            requests_total: AtomicU64::new(0),
            requests_matched: AtomicU64::new(0),
            requests_unmatched: AtomicU64::new(0),
            lookup_failures: AtomicU64::new(0),
        }
    }

    /// Create a service from process configuration.
    pub fn from_config(config: &ResponderConfig) -> Result<Self, LookupError> {
        let store = store::from_config(&config.store)?;
        Ok(Self::new(
            store,
            config.store.timeout(),
            config.settings.clone(),
        ))
    }

    /// Get total requests processed.
    pub fn total_requests(&self) -> u64 {
        self.requests_total.load(Ordering::Relaxed)
    }

    /// Get total requests matched.
    pub fn total_matched(&self) -> u64 {
        self.requests_matched.load(Ordering::Relaxed)
    }

    /// Get total requests unmatched.
    pub fn total_unmatched(&self) -> u64 {
        self.requests_unmatched.load(Ordering::Relaxed)
    }

    /// Get total failed rule set lookups.
    pub fn total_lookup_failures(&self) -> u64 {
        self.lookup_failures.load(Ordering::Relaxed)
    }

    /// Answer a request without going through HTTP.
    ///
    /// Returns the serialized response of the matching rule.
    pub async fn dispatch(
        &self,
        port: u16,
        request: &MatchRequest<'_>,
    ) -> Result<Vec<u8>, DispatchError> {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        let rules = self.load(port).await?;
        self.match_rules(port, &rules, request)
    }

    /// Answer an HTTP request received on `local_port`.
    pub async fn handle<B>(&self, req: Request<B>, local_port: u16) -> Response<Full<Bytes>>
    where
        B: Body,
        B::Error: Into<BoxError>,
    {
        let tag = RequestTag::now();
        let port = request_port(req.headers(), local_port);
        let span = info_span!("request", tag = %tag, port);

        async move {
            let method = req.method().as_str().to_owned();
            let path = req.uri().path().to_owned();
            debug!(method = %method, path = %path, "Request received");

            match self.respond(port, &method, &path, req).await {
                Ok(body) => build_response(StatusCode::OK, "application/json", tag, body),
                Err(e) => {
                    debug!(error = %e, "Request failed");
                    build_response(e.status(), "text/plain; charset=utf-8", tag, e.to_string())
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn respond<B>(
        &self,
        port: u16,
        method: &str,
        path: &str,
        req: Request<B>,
    ) -> Result<Vec<u8>, DispatchError>
    where
        B: Body,
        B::Error: Into<BoxError>,
    {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        let rules = self.load(port).await?;

        let body = if carries_body(method) {
            Some(read_body(req.into_body(), self.settings.max_body_bytes).await?)
        } else {
            None
        };

        let request = MatchRequest::new(method, path, body.as_deref());
        self.match_rules(port, &rules, &request)
    }

    async fn load(&self, port: u16) -> Result<RuleSet, DispatchError> {
        match load_rule_set(self.store.as_ref(), port, self.lookup_timeout).await {
            Ok(rules) => {
                if rules.port != 0 && rules.port != port {
                    warn!(
                        port,
                        document_port = rules.port,
                        "Rule set declares a different port"
                    );
                }
                Ok(rules)
            }
            Err(e) => {
                self.lookup_failures.fetch_add(1, Ordering::Relaxed);
                warn!(port, error = %e, "Failed to load rule set");
                Err(e.into())
            }
        }
    }

    fn match_rules(
        &self,
        port: u16,
        rules: &RuleSet,
        request: &MatchRequest<'_>,
    ) -> Result<Vec<u8>, DispatchError> {
        let matcher = Matcher::new(&rules.mocks);

        match matcher.find_match(request) {
            Ok(result) => {
                self.requests_matched.fetch_add(1, Ordering::Relaxed);
                if self.settings.log_matches {
                    info!(
                        port,
                        rule = result.index,
                        method = %request.method,
                        path = %request.path,
                        "Request matched rule"
                    );
                }
                Ok(serde_json::to_vec(&result.rule.response)?)
            }
            Err(_) => {
                self.requests_unmatched.fetch_add(1, Ordering::Relaxed);
                if self.settings.log_unmatched {
                    warn!(
                        port,
                        rules = rules.mocks.len(),
                        method = %request.method,
                        path = %request.path,
                        "No matching rule found"
                    );
                }
                Err(DispatchError::NoMatch {
                    method: request.method.to_string(),
                    path: request.normalized_path().to_string(),
                })
            }
        }
    }
}

/// Port the client addressed, taken from the `Host` header.
///
/// Falls back to `local_port` when the header is missing or has no port.
pub fn request_port(headers: &HeaderMap, local_port: u16) -> u16 {
    headers
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .and_then(host_port)
        .unwrap_or(local_port)
}

fn host_port(host: &str) -> Option<u16> {
    let (_, port) = host.rsplit_once(':')?;
    port.parse().ok()
}

/// Buffer the request body, failing once it grows past `limit` bytes.
async fn read_body<B>(body: B, limit: usize) -> Result<Vec<u8>, DispatchError>
where
    B: Body,
    B::Error: Into<BoxError>,
{
    Limited::new(body, limit)
        .collect()
        .await
        .map(|collected| collected.to_bytes().to_vec())
        .map_err(|e| DispatchError::BodyRead(e.to_string()))
}

fn build_response(
    status: StatusCode,
    content_type: &'static str,
    tag: RequestTag,
    body: impl Into<Bytes>,
) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    if let Ok(value) = HeaderValue::from_str(&tag.to_string()) {
        headers.insert(TAG_HEADER, value);
    }
    response
}
