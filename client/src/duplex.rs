//! Duplex transport: one WebSocket per backend carrying every transfer
//!
//! Control events travel as JSON text messages, bodies as binary frames
//! tagged with their transfer id (see [`StreamFrame`]). All session state
//! lives in the connection's task; handlers never wait on the network
//! themselves and hand slow work to spawned tasks instead.

use async_trait::async_trait;
use backhaul_shared::protocol::{
    AgentEvent, FailureReport, FrameKind, PollRequest, ProxyEvent, ResponseHeaders, StreamFrame,
    TransferAck, TransferDescriptor, TransferId, TransferKey, FRAME_CHUNK_SIZE,
};
use futures_util::{SinkExt, StreamExt};
use std::io;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn, Instrument};

use crate::backoff::backoff;
use crate::body::{self, BodyStream, FeedError};
use crate::config::{ConnectionConfig, TransportKind};
use crate::proxy::{Forwarder, TransferOutcome};
use crate::registry::{PendingTransfer, TransferRegistry, TransferStage};
use crate::transport::TunnelTransport;

/// Outbound body frames buffered per connection
const FRAME_QUEUE: usize = 64;

/// Request body bytes held per transfer before the backend reads them
const REQUEST_BUFFER_LIMIT: usize = 8 * 1024 * 1024;

/// A finished backend call, handed back to the session
pub(crate) struct Forwarded {
    pub id: TransferId,
    pub outcome: TransferOutcome,
}

/// Duplex transport of one backend connection
pub struct DuplexTransport {
    conn: Arc<ConnectionConfig>,
    forwarder: Arc<Forwarder>,
}

impl DuplexTransport {
    pub fn new(conn: Arc<ConnectionConfig>, forwarder: Arc<Forwarder>) -> Self {
        Self { conn, forwarder }
    }

    /// Serve one connection until it closes
    async fn serve(&self, ws: WebSocketStream<MaybeTlsStream<TcpStream>>) -> anyhow::Result<()> {
        let (mut sink, mut stream) = ws.split();
        let (control_tx, mut control_rx) = mpsc::unbounded_channel();
        let (frames_tx, mut frames_rx) = mpsc::channel(FRAME_QUEUE);
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();

        let mut session = DuplexSession::new(
            self.conn.clone(),
            self.forwarder.clone(),
            control_tx,
            frames_tx,
            done_tx,
        );
        session.on_connect();

        loop {
            tokio::select! {
                msg = stream.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => session.handle_text(&text),
                        Some(Ok(Message::Binary(data))) => session.handle_binary(&data),
                        Some(Ok(Message::Ping(data))) => sink.send(Message::Pong(data)).await?,
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                    }
                }
                Some(msg) = control_rx.recv() => sink.send(msg).await?,
                Some(msg) = frames_rx.recv() => sink.send(msg).await?,
                Some(done) = done_rx.recv() => session.handle_forwarded(done),
            }
        }

        Ok(())
    }
}

#[async_trait]
impl TunnelTransport for DuplexTransport {
    fn backend_id(&self) -> &str {
        &self.conn.backend_id
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Duplex
    }

    async fn run(&self) {
        let id = &self.conn.backend_id;
        let url = self.conn.web_socket_url();
        let mut failures = 0u32;

        loop {
            debug!("[{}] connecting to {}", id, url);
            match connect_async(url.as_str()).await {
                Ok((ws, _)) => {
                    failures = 0;
                    info!("[{}] connected to {}", id, url);
                    if let Err(e) = self.serve(ws).await {
                        warn!("[{}] connection error: {}", id, e);
                    }
                    info!("[{}] disconnected", id);
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    warn!("[{}] could not connect to {}: {}", id, url, e);
                }
            }

            let delay = backoff(failures);
            debug!("[{}] reconnecting in {}ms", id, delay.as_millis());
            tokio::time::sleep(delay).await;
        }
    }
}

/// State of one duplex connection.
///
/// Dropping the session drops its registry, which aborts the work of every
/// transfer still pending.
pub(crate) struct DuplexSession {
    conn: Arc<ConnectionConfig>,
    forwarder: Arc<Forwarder>,
    registry: TransferRegistry,
    control: mpsc::UnboundedSender<Message>,
    frames: mpsc::Sender<Message>,
    completions: mpsc::UnboundedSender<Forwarded>,
    /// Set while `req-h` is withheld because the in-flight cap is reached
    discovery_paused: bool,
    request_buffer_limit: usize,
}
impl DuplexSession {
    pub(crate) fn new(
        conn: Arc<ConnectionConfig>,
        forwarder: Arc<Forwarder>,
        control: mpsc::UnboundedSender<Message>,
        frames: mpsc::Sender<Message>,
        completions: mpsc::UnboundedSender<Forwarded>,
    ) -> Self {
        Self {
            conn,
            forwarder,
            registry: TransferRegistry::new(),
            control,
            frames,
            completions,
            discovery_paused: false,
            request_buffer_limit: REQUEST_BUFFER_LIMIT,
        }
    }

    fn backend_id(&self) -> &str {
        &self.conn.backend_id
    }

    pub(crate) fn on_connect(&mut self) {
        let dropped = self.registry.clear();
        if dropped > 0 {
            warn!("[{}] discarded {} transfer(s) of the previous connection", self.backend_id(), dropped);
        }
        self.discovery_paused = false;
        self.request_next();
    }

    pub(crate) fn handle_text(&mut self, text: &str) {
        let event = match ProxyEvent::from_text(text) {
            Ok(event) => event,
            Err(e) => {
                warn!("[{}] ignoring malformed message: {}", self.backend_id(), e);
                return;
            }
        };

        match event {
            ProxyEvent::RequestHeaders(descriptor) => self.on_request_headers(descriptor),
            ProxyEvent::RequestBody(key) => self.on_request_body(key),
            ProxyEvent::ResponseHeaders(ack) => self.on_response_headers_ack(ack),
            ProxyEvent::ResponseBody(ack) => self.on_response_body_ack(ack),
            ProxyEvent::TransferError(report) => self.on_transfer_error(report),
        }
    }

    /// Route a request body frame to its transfer
    pub(crate) fn handle_binary(&mut self, data: &[u8]) {
        let frame = match StreamFrame::decode(data) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("[{}] ignoring invalid frame: {}", self.backend_id(), e);
                return;
            }
        };

        let Ok(transfer) = self.registry.get_mut(&frame.id) else {
            debug!("[{}] frame for unknown transfer {} dropped", self.conn.backend_id, frame.id);
            return;
        };

        match frame.kind {
            FrameKind::Data => {
                let Some(tx) = transfer.request_body.as_ref() else {
                    return;
                };
                match tx.feed(frame.payload) {
                    Ok(()) => {}
                    // The backend call no longer reads the body.
                    Err(FeedError::Closed) => transfer.request_body = None,
                    Err(e @ FeedError::Overflow { .. }) => {
                        error!(parent: &transfer.span, "request body stalled: {}", e);
                        let report = FailureReport {
                            error: Some(e.to_string()),
                            ..Default::default()
                        };
                        self.remove(&frame.id);
                        let backend_id = self.conn.backend_id.clone();
                        self.emit(AgentEvent::TransferError(report.addressed(&backend_id, &frame.id)));
                    }
                }
            }
            FrameKind::End => transfer.request_body = None,
            FrameKind::Abort => {
                if let Some(tx) = transfer.request_body.take() {
                    let reason = String::from_utf8_lossy(&frame.payload);
                    tx.fail(io::Error::new(
                        io::ErrorKind::Other,
                        format!("request body aborted by proxy: {}", reason),
                    ));
                }
            }
        }
    }

    fn on_request_headers(&mut self, descriptor: TransferDescriptor) {
        if let Some(request) = descriptor.into_request() {
            let transfer = PendingTransfer::new(&self.conn.backend_id, request);
            let id = transfer.id().to_string();
            let span = transfer.span.clone();

            match self.registry.put(transfer) {
                Ok(()) => {
                    info!(parent: &span, "received for processing");
                    self.emit(AgentEvent::RequestBody(TransferKey {
                        backend_id: self.conn.backend_id.clone(),
                        id,
                    }));
                }
                Err(e) => warn!(parent: &span, "{}; ignoring repeated delivery", e),
            }
        } else {
            debug!("[{}] no pending request", self.backend_id());
        }

        self.request_next();
    }

    /// The proxy announced the request body; start the backend call while
    /// the body frames are still arriving.
    fn on_request_body(&mut self, key: TransferKey) {
        let forwarder = self.forwarder.clone();
        let completions = self.completions.clone();
        let limit = self.request_buffer_limit;

        let transfer = match self.registry.get_mut(&key.id) {
            Ok(transfer) => transfer,
            Err(e) => {
                error!("[{}] {}; dropping request body", self.conn.backend_id, e);
                return;
            }
        };
        if transfer.stage != TransferStage::AwaitingRequestBody {
            warn!(parent: &transfer.span, "request body announced twice; ignoring");
            return;
        }

        let (tx, body) = body::channel_body(limit);
        transfer.request_body = Some(tx);
        transfer.stage = TransferStage::Forwarding;

        let request = transfer.request.clone();
        let span = transfer.span.clone();
        let task = tokio::spawn(
            async move {
                let outcome = forwarder.forward(&request, Some(body)).await;
                let _ = completions.send(Forwarded {
                    id: request.id.clone(),
                    outcome,
                });
            }
            .instrument(span),
        );
        transfer.task = Some(task.abort_handle());
    }

    pub(crate) fn handle_forwarded(&mut self, done: Forwarded) {
        let Forwarded { id, outcome } = done;
        let backend_id = self.conn.backend_id.clone();

        let Ok(transfer) = self.registry.get_mut(&id) else {
            debug!("[{}] transfer {} ended before its backend call; result dropped", backend_id, id);
            return;
        };
        transfer.task = None;

        match outcome {
            Ok(response) => {
                info!(
                    parent: &transfer.span,
                    "request to {} has returned {} {}",
                    self.forwarder.target_url(&transfer.request.path),
                    response.status_code,
                    response.status_message
                );
                transfer.stage = TransferStage::AwaitingHeadersAck;
                transfer.response_body = Some(response.body);
                self.emit(AgentEvent::ResponseHeaders(ResponseHeaders {
                    backend_id: Some(backend_id),
                    id,
                    status_code: response.status_code,
                    status_message: response.status_message,
                    headers: response.headers,
                }));
            }
            Err(e) => {
                error!(parent: &transfer.span, kind = ?e.kind(), "{}", e);
                self.remove(&id);
                self.emit(AgentEvent::TransferError(e.to_report().addressed(&backend_id, &id)));
            }
        }
    }

    fn on_response_headers_ack(&mut self, ack: TransferAck) {
        if let Some(reason) = ack.error {
            if let Some(transfer) = self.remove(&ack.id) {
                error!(
                    parent: &transfer.span,
                    "transfer of response headers to remote proxy unsuccessful: {}", reason
                );
            }
            return;
        }

        let frames = self.frames.clone();
        let backend_id = self.conn.backend_id.clone();

        let transfer = match self.registry.get_mut(&ack.id) {
            Ok(transfer) => transfer,
            Err(e) => {
                error!("[{}] {}; ignoring response headers ack", backend_id, e);
                return;
            }
        };
        debug!(parent: &transfer.span, "response headers successfully sent to remote proxy");

        let Some(body) = transfer.response_body.take() else {
            error!(parent: &transfer.span, "no response body left to send");
            self.remove(&ack.id);
            return;
        };

        transfer.stage = TransferStage::StreamingResponse;
        let id = ack.id.clone();
        let task = tokio::spawn(
            async move {
                if let Err(e) = relay_response(backend_id, id, body, frames).await {
                    error!("transfer of response body to remote proxy encountered error: {}", e);
                }
            }
            .instrument(transfer.span.clone()),
        );
        transfer.task = Some(task.abort_handle());
    }

    fn on_response_body_ack(&mut self, ack: TransferAck) {
        let Some(transfer) = self.remove(&ack.id) else {
            return;
        };
        match ack.error {
            None => info!(parent: &transfer.span, "response completely sent to remote proxy"),
            Some(reason) => error!(
                parent: &transfer.span,
                "transfer of response body to remote proxy unsuccessful: {}", reason
            ),
        }
    }

    /// The proxy gave up on a transfer (e.g. the client went away)
    fn on_transfer_error(&mut self, report: FailureReport) {
        if report.backend_id.as_deref() != Some(self.conn.backend_id.as_str()) {
            debug!("[{}] failure report for another backend ignored", self.backend_id());
            return;
        }
        let Some(id) = report.id.as_deref() else {
            return;
        };
        if !self.registry.contains(id) {
            debug!("[{}] failure report for unknown transfer {}", self.backend_id(), id);
            return;
        }
        if let Some(transfer) = self.remove(id) {
            warn!(
                parent: &transfer.span,
                "transfer aborted by remote proxy (timeout: {}, error: {})",
                report.remote_timeout.unwrap_or(false),
                report.error.as_deref().unwrap_or("none")
            );
        }
    }

    /// Ask for the next pending request unless the in-flight cap is reached
    fn request_next(&mut self) {
        if let Some(max) = self.conn.max_in_flight {
            if self.registry.len() >= max {
                if !self.discovery_paused {
                    debug!("[{}] {} transfers in flight; pausing discovery", self.backend_id(), max);
                }
                self.discovery_paused = true;
                return;
            }
        }
        self.discovery_paused = false;
        self.emit(AgentEvent::RequestHeaders(PollRequest {
            backend_id: self.conn.backend_id.clone(),
        }));
    }

    /// Every removal goes through here so paused discovery resumes.
    fn remove(&mut self, id: &str) -> Option<PendingTransfer> {
        let removed = self.registry.remove(id);
        if self.discovery_paused {
            self.request_next();
        }
        removed
    }

    fn emit(&self, event: AgentEvent) {
        match event.to_text() {
            Ok(text) => {
                debug!("[{}] -> {}", self.backend_id(), event.name());
                // A closed channel means the connection is going away.
                let _ = self.control.send(Message::Text(text));
            }
            Err(e) => error!("[{}] could not encode {} event: {}", self.backend_id(), event.name(), e),
        }
    }

    #[cfg(test)]
    pub(crate) fn in_flight(&self) -> usize {
        self.registry.len()
    }
}

/// Announce the `res-b` stream, then send the body as frames ending in
/// `End` (or `Abort` when the backend body fails).
async fn relay_response(
    backend_id: String,
    id: TransferId,
    mut body: BodyStream,
    frames: mpsc::Sender<Message>,
) -> anyhow::Result<()> {
    let announce = AgentEvent::ResponseBody(TransferKey {
        backend_id,
        id: id.clone(),
    });
    frames.send(Message::Text(announce.to_text()?)).await?;

    while let Some(chunk) = body.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                let abort = StreamFrame::abort(id.as_str(), &e.to_string());
                frames.send(Message::Binary(abort.encode()?)).await?;
                return Err(e.into());
            }
        };
        let mut offset = 0;
        while offset < chunk.len() {
            let end = (offset + FRAME_CHUNK_SIZE).min(chunk.len());
            let frame = StreamFrame::data(id.as_str(), chunk.slice(offset..end));
            frames.send(Message::Binary(frame.encode()?)).await?;
            offset = end;
        }
    }

    frames.send(Message::Binary(StreamFrame::end(id.as_str()).encode()?)).await?;
    debug!("response body streamed to remote proxy");
    Ok(())
}
