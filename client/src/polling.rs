//! Adaptive long-polling transport
//!
//! As long as every discovery call of a round comes back with work, the
//! next round opens one more call (up to `max_concurrency`). Anything else
//! drops back to a single call; failures additionally back off.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::backoff::backoff;
use crate::config::{ConnectionConfig, TransportKind};
use crate::delegate::TransferDelegate;
use crate::proxy::Forwarder;
use crate::registry::TransferRegistry;
use crate::remote::RemoteProxy;
use crate::transport::TunnelTransport;

/// Result of a single discovery call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryOutcome {
    /// A transfer was handed to a delegate
    FoundWork,
    /// The proxy had nothing pending
    Empty,
    /// The call itself failed
    Failed,
}

/// Tally of one round of discovery calls
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoundSummary {
    pub found: usize,
    pub empty: usize,
    pub failed: usize,
}

impl RoundSummary {
    pub fn record(&mut self, outcome: DiscoveryOutcome) {
        match outcome {
            DiscoveryOutcome::FoundWork => self.found += 1,
            DiscoveryOutcome::Empty => self.empty += 1,
            DiscoveryOutcome::Failed => self.failed += 1,
        }
    }
}

/// Scheduler state carried from one round to the next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerState {
    /// Discovery calls to open next round, at least 1
    pub active_connections: usize,
    pub consecutive_failures: u32,
}

/// What to do after a round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextRound {
    pub state: SchedulerState,
    /// `None` starts the next round right away
    pub delay: Option<Duration>,
}

impl Default for SchedulerState {
    fn default() -> Self {
        Self {
            active_connections: 1,
            consecutive_failures: 0,
        }
    }
}

impl SchedulerState {
    /// Next state given the outcome of a round of `self.active_connections` calls
    pub fn next(self, summary: RoundSummary, max_concurrency: usize) -> NextRound {
        let max = max_concurrency.max(1);

        if summary.found == self.active_connections && summary.empty == 0 && summary.failed == 0 {
            return NextRound {
                state: SchedulerState {
                    active_connections: (self.active_connections + 1).min(max),
                    consecutive_failures: 0,
                },
                delay: None,
            };
        }

        if summary.failed > 0 {
            let failures = self.consecutive_failures.saturating_add(1);
            return NextRound {
                state: SchedulerState {
                    active_connections: 1,
                    consecutive_failures: failures,
                },
                delay: Some(backoff(failures)),
            };
        }

        NextRound {
            state: SchedulerState::default(),
            delay: None,
        }
    }
}

/// Polling transport of one backend connection
#[derive(Clone)]
pub struct PollingTransport {
    conn: Arc<ConnectionConfig>,
    remote: RemoteProxy,
    forwarder: Arc<Forwarder>,
    registry: Arc<Mutex<TransferRegistry>>,
}

impl PollingTransport {
    pub fn new(conn: Arc<ConnectionConfig>, proxy_client: reqwest::Client, forwarder: Arc<Forwarder>) -> Self {
        Self {
            remote: RemoteProxy::new(proxy_client, conn.clone()),
            conn,
            forwarder,
            registry: Arc::new(Mutex::new(TransferRegistry::new())),
        }
    }

    /// Open `count` discovery calls and wait for all of them.
    ///
    /// Calls run as a task group, so a call that panics still counts as failed.
    pub async fn run_round(&self, count: usize) -> RoundSummary {
        let mut calls = JoinSet::new();
        for _ in 0..count {
            let this = self.clone();
            calls.spawn(async move { this.discover_once().await });
        }

        let mut summary = RoundSummary::default();
        while let Some(joined) = calls.join_next().await {
            match joined {
                Ok(outcome) => summary.record(outcome),
                Err(e) => {
                    error!("[{}] discovery task ended abnormally: {}", self.conn.backend_id, e);
                    summary.record(DiscoveryOutcome::Failed);
                }
            }
        }
        summary
    }

    async fn discover_once(&self) -> DiscoveryOutcome {
        match self.remote.discover().await {
            Ok(Some(request)) => {
                debug!(
                    "pending request found for target {} with id {}",
                    self.conn.backend_id, request.id
                );
                let delegate = TransferDelegate::new(
                    self.remote.clone(),
                    self.forwarder.clone(),
                    self.registry.clone(),
                    request,
                );
                tokio::spawn(delegate.run());
                DiscoveryOutcome::FoundWork
            }
            Ok(None) => {
                debug!("no pending request found for target {}", self.conn.backend_id);
                DiscoveryOutcome::Empty
            }
            Err(e) => {
                warn!("unsuccessful discovery for target {}: {}", self.conn.backend_id, e);
                DiscoveryOutcome::Failed
            }
        }
    }

    /// Transfers currently being handled
    pub async fn in_flight(&self) -> usize {
        self.registry.lock().await.len()
    }
}

#[async_trait]
impl TunnelTransport for PollingTransport {
    fn backend_id(&self) -> &str {
        &self.conn.backend_id
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Polling
    }

    async fn run(&self) {
        info!(
            "[{}] polling {} (max {} concurrent discovery calls)",
            self.conn.backend_id,
            self.conn.discover_url(),
            self.conn.max_concurrency
        );

        let mut state = SchedulerState::default();
        loop {
            let summary = self.run_round(state.active_connections).await;
            let next = state.next(summary, self.conn.max_concurrency);
            if let Some(delay) = next.delay {
                warn!(
                    "[{}] {} discovery call(s) failed, retrying in {}ms",
                    self.conn.backend_id,
                    summary.failed,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
            }
            state = next.state;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_connection;
    use axum::extract::{Path, State};
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn summary(found: usize, empty: usize, failed: usize) -> RoundSummary {
        RoundSummary { found, empty, failed }
    }

    fn state(active_connections: usize, consecutive_failures: u32) -> SchedulerState {
        SchedulerState {
            active_connections,
            consecutive_failures,
        }
    }

    #[test]
    fn test_all_found_ramps_up() {
        let next = state(1, 0).next(summary(1, 0, 0), 5);
        assert_eq!(next.state, state(2, 0));
        assert_eq!(next.delay, None);

        let next = state(3, 2).next(summary(3, 0, 0), 5);
        assert_eq!(next.state, state(4, 0));
        assert_eq!(next.delay, None);
    }

    #[test]
    fn test_ramp_capped_at_max() {
        let next = state(5, 0).next(summary(5, 0, 0), 5);
        assert_eq!(next.state, state(5, 0));

        let next = state(1, 0).next(summary(1, 0, 0), 1);
        assert_eq!(next.state, state(1, 0));
    }

    #[test]
    fn test_failure_resets_and_backs_off() {
        let next = state(1, 0).next(summary(0, 0, 1), 5);
        assert_eq!(next.state, state(1, 1));
        assert_eq!(next.delay, Some(Duration::from_millis(2_000)));

        let next = state(4, 1).next(summary(3, 0, 1), 5);
        assert_eq!(next.state, state(1, 2));
        assert_eq!(next.delay, Some(Duration::from_millis(4_000)));
    }

    #[test]
    fn test_empty_round_resets_without_delay() {
        let next = state(3, 4).next(summary(2, 1, 0), 5);
        assert_eq!(next.state, state(1, 0));
        assert_eq!(next.delay, None);

        let next = state(1, 0).next(summary(0, 1, 0), 5);
        assert_eq!(next.state, state(1, 0));
        assert_eq!(next.delay, None);
    }

    /// Fake reverse proxy recording what the agent sends back
    #[derive(Clone, Default)]
    struct FakeProxy {
        pending: Arc<Mutex<Vec<Value>>>,
        response_headers: Arc<Mutex<Vec<Value>>>,
        response_bodies: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
        failures: Arc<Mutex<Vec<(String, Value)>>>,
        discoveries: Arc<AtomicUsize>,
    }

    async fn discover(State(p): State<FakeProxy>) -> Json<Value> {
        p.discoveries.fetch_add(1, Ordering::SeqCst);
        let mut pending = p.pending.lock().await;
        if pending.is_empty() {
            Json(json!({}))
        } else {
            Json(pending.remove(0))
        }
    }

    async fn request_body(Path((_backend, id)): Path<(String, String)>) -> String {
        format!("body-of-{}", id)
    }

    async fn response_headers(State(p): State<FakeProxy>, Json(v): Json<Value>) -> StatusCode {
        p.response_headers.lock().await.push(v);
        StatusCode::OK
    }

    async fn response_body(
        State(p): State<FakeProxy>,
        Path((_backend, id)): Path<(String, String)>,
        body: axum::body::Bytes,
    ) -> StatusCode {
        p.response_bodies.lock().await.push((id, body.to_vec()));
        StatusCode::OK
    }

    async fn failure(
        State(p): State<FakeProxy>,
        Path((_backend, id)): Path<(String, String)>,
        Json(v): Json<Value>,
    ) -> StatusCode {
        p.failures.lock().await.push((id, v));
        StatusCode::OK
    }

    async fn spawn(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    async fn spawn_proxy(proxy: FakeProxy) -> String {
        let app = Router::new()
            .route("/req-h/:backend", get(discover))
            .route("/req-b/:backend/:id", get(request_body))
            .route("/res-h/:backend", post(response_headers))
            .route("/res-b/:backend/:id", post(response_body))
            .route("/err/:backend/:id", post(failure))
            .with_state(proxy);
        spawn(app).await
    }

    async fn spawn_backend() -> String {
        let app = Router::new().route(
            "/upper",
            post(|body: String| async move { ([("x-served-by", "backend")], body.to_uppercase()) }),
        );
        spawn(app).await
    }

    fn transport(proxy: &str, backend: &str) -> PollingTransport {
        let conn = Arc::new(test_connection(proxy, backend));
        let forwarder = Arc::new(Forwarder::new(
            Forwarder::backend_client().unwrap(),
            conn.backend_base_url.clone(),
            conn.request_timeout,
        ));
        PollingTransport::new(conn, reqwest::Client::new(), forwarder)
    }

    async fn wait_for<F>(mut done: F)
    where
        F: FnMut() -> futures_util::future::BoxFuture<'static, bool>,
    {
        for _ in 0..200 {
            if done().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_round_relays_found_transfers() {
        let proxy = FakeProxy::default();
        proxy.pending.lock().await.extend([
            json!({"id": "t1", "path": "/upper", "method": "POST", "headers": ["Content-Type", "text/plain"]}),
            json!({"id": "t2", "path": "/upper", "method": "POST", "headers": []}),
        ]);
        let proxy_url = spawn_proxy(proxy.clone()).await;
        let backend_url = spawn_backend().await;
        let t = transport(&proxy_url, &backend_url);

        let round = t.run_round(2).await;
        assert_eq!(round, summary(2, 0, 0));
        let next = state(2, 0).next(round, 5);
        assert_eq!(next.state, state(3, 0));
        assert_eq!(next.delay, None);

        let bodies = proxy.response_bodies.clone();
        wait_for(move || {
            let bodies = bodies.clone();
            Box::pin(async move { bodies.lock().await.len() == 2 })
        })
        .await;

        let mut bodies = proxy.response_bodies.lock().await.clone();
        bodies.sort();
        assert_eq!(bodies[0], ("t1".to_string(), b"BODY-OF-T1".to_vec()));
        assert_eq!(bodies[1], ("t2".to_string(), b"BODY-OF-T2".to_vec()));

        let headers = proxy.response_headers.lock().await.clone();
        assert_eq!(headers.len(), 2);
        for h in &headers {
            assert_eq!(h["statusCode"], 200);
            assert_eq!(h["statusMessage"], "OK");
            assert!(h["headers"]
                .as_array()
                .unwrap()
                .iter()
                .any(|pair| pair[0] == "x-served-by" && pair[1] == "backend"));
        }

        let t2 = t.clone();
        wait_for(move || {
            let t = t2.clone();
            Box::pin(async move { t.in_flight().await == 0 })
        })
        .await;
    }

    #[tokio::test]
    async fn test_empty_round() {
        let proxy = FakeProxy::default();
        let proxy_url = spawn_proxy(proxy.clone()).await;
        let t = transport(&proxy_url, "http://127.0.0.1:9");

        let round = t.run_round(1).await;
        assert_eq!(round, summary(0, 1, 0));
        assert_eq!(proxy.discoveries.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_discovery_timeout_counts_as_failure() {
        let app = Router::new().route(
            "/req-h/:backend",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Json(json!({}))
            }),
        );
        let proxy_url = spawn(app).await;
        let mut conn = test_connection(&proxy_url, "http://127.0.0.1:9");
        conn.discovery_timeout = Duration::from_millis(100);
        let conn = Arc::new(conn);
        let forwarder = Arc::new(Forwarder::new(
            Forwarder::backend_client().unwrap(),
            conn.backend_base_url.clone(),
            conn.request_timeout,
        ));
        let t = PollingTransport::new(conn, reqwest::Client::new(), forwarder);

        let round = t.run_round(1).await;
        assert_eq!(round, summary(0, 0, 1));

        let next = SchedulerState::default().next(round, 5);
        assert_eq!(next.state, state(1, 1));
        assert_eq!(next.delay, Some(Duration::from_millis(2_000)));
    }

    #[tokio::test]
    async fn test_proxy_error_status_counts_as_failure() {
        let app = Router::new().route(
            "/req-h/:backend",
            get(|| async { StatusCode::SERVICE_UNAVAILABLE }),
        );
        let proxy_url = spawn(app).await;
        let t = transport(&proxy_url, "http://127.0.0.1:9");
        assert_eq!(t.run_round(1).await, summary(0, 0, 1));
    }

    #[tokio::test]
    async fn test_unreachable_backend_reports_failure() {
        let proxy = FakeProxy::default();
        proxy
            .pending
            .lock()
            .await
            .push(json!({"id": "t9", "path": "/", "method": "GET", "headers": []}));
        let proxy_url = spawn_proxy(proxy.clone()).await;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let t = transport(&proxy_url, &dead);
        assert_eq!(t.run_round(1).await, summary(1, 0, 0));

        let failures = proxy.failures.clone();
        wait_for(move || {
            let failures = failures.clone();
            Box::pin(async move { !failures.lock().await.is_empty() })
        })
        .await;

        let failures = proxy.failures.lock().await.clone();
        assert_eq!(failures[0].0, "t9");
        assert!(failures[0].1["error"].is_string());
        assert!(failures[0].1.get("remoteTimeout").is_none());
        assert!(proxy.response_headers.lock().await.is_empty());
    }
}
