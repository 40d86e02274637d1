//! One-shot handler for a transfer discovered by polling

use backhaul_shared::protocol::{ResponseHeaders, TransferRequest};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn, Instrument};

use crate::proxy::{ForwardedResponse, Forwarder};
use crate::registry::{PendingTransfer, TransferRegistry};
use crate::remote::RemoteProxy;

/// Fetches the request body, forwards to the backend and relays the
/// response (or a failure report) back to the proxy.
pub struct TransferDelegate {
    remote: RemoteProxy,
    forwarder: Arc<Forwarder>,
    registry: Arc<Mutex<TransferRegistry>>,
    request: TransferRequest,
}

impl TransferDelegate {
    pub fn new(
        remote: RemoteProxy,
        forwarder: Arc<Forwarder>,
        registry: Arc<Mutex<TransferRegistry>>,
        request: TransferRequest,
    ) -> Self {
        Self {
            remote,
            forwarder,
            registry,
            request,
        }
    }

    pub async fn run(self) {
        let transfer = PendingTransfer::new(self.remote.backend_id(), self.request.clone());
        let span = transfer.span.clone();

        async move {
            if let Err(e) = self.registry.lock().await.put(transfer) {
                warn!("{}; ignoring repeated delivery", e);
                return;
            }
            info!("received for processing");

            self.process().await;

            self.registry.lock().await.remove(&self.request.id);
        }
        .instrument(span)
        .await
    }

    async fn process(&self) {
        let id = &self.request.id;
        let body = match self.remote.fetch_request_body(id).await {
            Ok(body) => {
                debug!("fetch of request body from remote proxy successful");
                body
            }
            Err(e) => {
                error!("fetch of request body from remote proxy unsuccessful: {}", e);
                return;
            }
        };

        match self.forwarder.forward(&self.request, Some(body)).await {
            Ok(response) => {
                info!(
                    "request to {} has returned {} {}",
                    self.forwarder.target_url(&self.request.path),
                    response.status_code,
                    response.status_message
                );
                self.relay(response).await;
            }
            Err(e) => {
                error!(kind = ?e.kind(), "{}", e);
                self.remote.report_failure(id, &e.to_report()).await;
            }
        }
    }

    /// Headers first; a failure there skips the body.
    async fn relay(&self, response: ForwardedResponse) {
        let headers = ResponseHeaders {
            backend_id: None,
            id: self.request.id.clone(),
            status_code: response.status_code,
            status_message: response.status_message,
            headers: response.headers,
        };
        if let Err(e) = self.remote.send_response_headers(&headers).await {
            error!("transfer of response headers to remote proxy unsuccessful: {}", e);
            return;
        }
        debug!("response headers successfully sent to remote proxy");

        match self.remote.send_response_body(&self.request.id, response.body).await {
            Ok(()) => info!("response completely sent to remote proxy"),
            Err(e) => error!("transfer of response body to remote proxy encountered error: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_connection;
    use axum::extract::Path;
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use axum::Router;
    use backhaul_shared::protocol::HeaderList;

    /// Proxy whose body endpoint always fails; records every other call
    async fn spawn_failing_proxy(calls: Arc<std::sync::Mutex<Vec<String>>>) -> String {
        let res_h = calls.clone();
        let err = calls.clone();
        let app = Router::new()
            .route(
                "/req-b/:backend/:id",
                get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
            )
            .route(
                "/res-h/:backend",
                post(move |Path(backend): Path<String>| async move {
                    res_h.lock().unwrap().push(format!("res-h {}", backend));
                }),
            )
            .route(
                "/err/:backend/:id",
                post(move |Path((backend, id)): Path<(String, String)>| async move {
                    err.lock().unwrap().push(format!("err {} {}", backend, id));
                }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn delegate(proxy: &str, registry: Arc<Mutex<TransferRegistry>>, id: &str) -> TransferDelegate {
        let conn = Arc::new(test_connection(proxy, "http://127.0.0.1:9"));
        let forwarder = Arc::new(Forwarder::new(
            Forwarder::backend_client().unwrap(),
            conn.backend_base_url.clone(),
            conn.request_timeout,
        ));
        let request = TransferRequest {
            id: id.to_string(),
            path: "/x".to_string(),
            method: "POST".to_string(),
            headers: HeaderList::default(),
        };
        TransferDelegate::new(RemoteProxy::new(reqwest::Client::new(), conn), forwarder, registry, request)
    }

    #[tokio::test]
    async fn test_failed_body_fetch_removes_transfer() {
        let calls = Arc::new(std::sync::Mutex::new(Vec::new()));
        let proxy = spawn_failing_proxy(calls.clone()).await;
        let registry = Arc::new(Mutex::new(TransferRegistry::new()));

        delegate(&proxy, registry.clone(), "t1").run().await;

        assert!(registry.lock().await.is_empty());
        assert!(calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_repeated_delivery_left_to_first_delegate() {
        let calls = Arc::new(std::sync::Mutex::new(Vec::new()));
        let proxy = spawn_failing_proxy(calls.clone()).await;
        let registry = Arc::new(Mutex::new(TransferRegistry::new()));
        registry
            .lock()
            .await
            .put(PendingTransfer::new("b1", delegate(&proxy, registry.clone(), "t1").request))
            .unwrap();

        delegate(&proxy, registry.clone(), "t1").run().await;

        assert!(registry.lock().await.contains("t1"));
        assert!(calls.lock().unwrap().is_empty());
    }
}
