//! Local proxy for forwarding requests
//!
//! The forwarder makes exactly one call to the local backend per transfer.
//! It never retries; callers decide what to tell the reverse proxy.

use backhaul_shared::protocol::{FailureReport, HeaderList, TransferRequest};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use crate::body::{self, BodyStream};

/// Headers that describe the hop to the proxy, not to the backend
const HOP_HEADERS: [&str; 2] = ["host", "connection"];

/// Failure reported for errors that are neither timeouts nor network errors
const INTERNAL_ERROR_MESSAGE: &str = "internal error occurred at local forward proxy";

/// What the backend answered. Any status code counts, 4xx and 5xx included.
pub struct ForwardedResponse {
    pub status_code: u16,
    pub status_message: String,
    pub headers: HeaderList,
    pub body: BodyStream,
}

impl std::fmt::Debug for ForwardedResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardedResponse")
            .field("status_code", &self.status_code)
            .field("status_message", &self.status_message)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Failure classes of a forward call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Timeout,
    Network,
    Internal,
}

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("request to {url} timed out after {}ms", timeout.as_millis())]
    Timeout { url: String, timeout: Duration },

    #[error("could not make request to {url}: {message}")]
    Network { url: String, message: String },

    #[error("request to {url} encountered error: {message}")]
    Internal { url: String, message: String },
}

impl ForwardError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ForwardError::Timeout { .. } => FailureKind::Timeout,
            ForwardError::Network { .. } => FailureKind::Network,
            ForwardError::Internal { .. } => FailureKind::Internal,
        }
    }

    /// Fail-fast notice for the reverse proxy
    pub fn to_report(&self) -> FailureReport {
        match self {
            ForwardError::Timeout { .. } => FailureReport {
                remote_timeout: Some(true),
                ..Default::default()
            },
            ForwardError::Network { message, .. } => FailureReport {
                error: Some(message.clone()),
                ..Default::default()
            },
            ForwardError::Internal { .. } => FailureReport {
                error: Some(INTERNAL_ERROR_MESSAGE.to_string()),
                ..Default::default()
            },
        }
    }
}

/// Result of one forward call
pub type TransferOutcome = Result<ForwardedResponse, ForwardError>;

/// Forwards transfers to one backend
pub struct Forwarder {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl Forwarder {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            timeout,
        }
    }

    /// Client suited for backend calls: redirects are passed through to the
    /// caller untouched.
    pub fn backend_client() -> reqwest::Result<reqwest::Client> {
        reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
    }

    pub fn target_url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Send `request` to the backend.
    ///
    /// The timeout covers the call up to the response headers; the body is
    /// left for the caller to stream.
    pub async fn forward(&self, request: &TransferRequest, body: Option<BodyStream>) -> TransferOutcome {
        let url = self.target_url(&request.path);
        let internal = |message: String| ForwardError::Internal {
            url: url.clone(),
            message,
        };

        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|e| internal(format!("invalid method '{}': {}", request.method, e)))?;
        let headers = filter_headers(&request.headers);
        let send_body = should_send_body(&request.method, &request.headers);

        let mut header_map = HeaderMap::with_capacity(headers.len());
        for (name, value) in &headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| internal(format!("invalid header name '{}': {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| internal(format!("invalid value for header '{}': {}", name, e)))?;
            header_map.append(name, value);
        }

        let mut builder = self.client.request(method, &url).headers(header_map);
        if send_body {
            if let Some(body) = body {
                builder = builder.body(body::into_request_body(body));
            }
        }

        // Dropping the in-flight future on expiry cancels the call.
        let response = match tokio::time::timeout(self.timeout, builder.send()).await {
            Err(_) => {
                return Err(ForwardError::Timeout {
                    url,
                    timeout: self.timeout,
                })
            }
            Ok(Err(e)) => return Err(classify(url, e)),
            Ok(Ok(response)) => response,
        };

        let status = response.status();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect::<Vec<_>>();

        let status_message = reason_phrase(&response);

        Ok(ForwardedResponse {
            status_code: status.as_u16(),
            status_message,
            headers: headers.into(),
            body: body::from_response(response),
        })
    }
}

/// The reason phrase the backend sent. hyper only keeps it when it differs
/// from the canonical one, so that is the fallback.
fn reason_phrase(response: &reqwest::Response) -> String {
    match response.extensions().get::<hyper::ext::ReasonPhrase>() {
        Some(reason) => String::from_utf8_lossy(reason.as_bytes()).into_owned(),
        None => response
            .status()
            .canonical_reason()
            .unwrap_or_default()
            .to_string(),
    }
}

fn classify(url: String, error: reqwest::Error) -> ForwardError {
    if error.is_timeout() {
        return ForwardError::Timeout {
            url,
            timeout: Duration::ZERO,
        };
    }
    if error.is_builder() {
        return ForwardError::Internal {
            url,
            message: error.to_string(),
        };
    }
    ForwardError::Network {
        url,
        message: error_chain(&error),
    }
}

/// Error message with its sources, e.g. "error sending request: connection refused"
fn error_chain(error: &dyn std::error::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(e) = source {
        message.push_str(": ");
        message.push_str(&e.to_string());
        source = e.source();
    }
    message
}

/// Drop hop headers, keeping every other pair in its original order
pub fn filter_headers(headers: &HeaderList) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|(name, _)| !HOP_HEADERS.iter().any(|hop| name.eq_ignore_ascii_case(hop)))
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect()
}

/// GET and HEAD go without a body unless a non-empty Content-Length says
/// otherwise. In that case the body is sent and the backend will most
/// likely reject the request.
pub fn should_send_body(method: &str, headers: &HeaderList) -> bool {
    if !(method.eq_ignore_ascii_case("GET") || method.eq_ignore_ascii_case("HEAD")) {
        return true;
    }
    match headers.get("content-length") {
        Some(length) if !length.is_empty() => {
            warn!(
                "encountered {} request with Content-Length: {} indicating a non-empty body; \
                 request will fail in all likelihood",
                method, length
            );
            true
        }
        _ => false,
    }
}
