//! HTTP calls to the reverse proxy in polling mode

use backhaul_shared::protocol::{FailureReport, ResponseHeaders, TransferDescriptor, TransferRequest};
use reqwest::header::CONTENT_TYPE;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::body::{self, BodyStream};
use crate::config::ConnectionConfig;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("proxy answered {status} {reason}")]
    Status { status: u16, reason: String },

    #[error("proxy did not answer within {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("{0}")]
    Http(#[from] reqwest::Error),
}

/// The polling endpoints of one backend on the reverse proxy
#[derive(Clone)]
pub struct RemoteProxy {
    client: reqwest::Client,
    conn: Arc<ConnectionConfig>,
}

impl RemoteProxy {
    pub fn new(client: reqwest::Client, conn: Arc<ConnectionConfig>) -> Self {
        Self { client, conn }
    }

    pub fn backend_id(&self) -> &str {
        &self.conn.backend_id
    }

    /// Ask for the next pending request. `Ok(None)` means no work.
    pub async fn discover(&self) -> Result<Option<TransferRequest>, RemoteError> {
        let limit = self.conn.discovery_timeout;
        let call = async {
            let response = check_status(self.client.get(self.conn.discover_url()).send().await?)?;
            let descriptor: TransferDescriptor = response.json().await?;
            Ok::<_, RemoteError>(descriptor.into_request())
        };
        tokio::time::timeout(limit, call)
            .await
            .map_err(|_| RemoteError::Timeout(limit))?
    }

    /// Stream the body of a pending request
    pub async fn fetch_request_body(&self, id: &str) -> Result<BodyStream, RemoteError> {
        let response = check_status(self.client.get(self.conn.request_body_url(id)).send().await?)?;
        Ok(body::from_response(response))
    }

    pub async fn send_response_headers(&self, headers: &ResponseHeaders) -> Result<(), RemoteError> {
        let response = self
            .client
            .post(self.conn.response_headers_url())
            .json(headers)
            .send()
            .await?;
        check_status(response)?;
        Ok(())
    }

    /// Stream the backend's response body. Sent as octet-stream so the
    /// proxy's body parsers leave it alone.
    pub async fn send_response_body(&self, id: &str, body: BodyStream) -> Result<(), RemoteError> {
        let response = self
            .client
            .post(self.conn.response_body_url(id))
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(body::into_request_body(body))
            .send()
            .await?;
        check_status(response)?;
        Ok(())
    }

    /// Best effort: the proxy times the transfer out on its own if this
    /// never arrives, so errors are dropped.
    pub async fn report_failure(&self, id: &str, report: &FailureReport) {
        let result = self
            .client
            .post(self.conn.transfer_error_url(id))
            .json(report)
            .send()
            .await;
        if let Err(e) = result {
            debug!("failure report for {} not delivered: {}", id, e);
        }
    }
}

fn check_status(response: reqwest::Response) -> Result<reqwest::Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(RemoteError::Status {
            status: status.as_u16(),
            reason: status.canonical_reason().unwrap_or_default().to_string(),
        })
    }
}
