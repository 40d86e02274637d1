//! Pending transfers of one backend connection

use backhaul_shared::protocol::{TransferId, TransferRequest};
use std::collections::HashMap;
use thiserror::Error;
use tokio::task::AbortHandle;
use tracing::{info_span, warn, Span};

use crate::body::{BodySender, BodyStream};

/// Where a transfer is in its exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStage {
    /// Metadata known, request body not yet announced
    AwaitingRequestBody,
    /// Backend call in flight
    Forwarding,
    /// Response headers sent, waiting for the proxy's ack
    AwaitingHeadersAck,
    /// Response body being streamed to the proxy
    StreamingResponse,
}

/// One request the proxy is holding for the backend
pub struct PendingTransfer {
    pub request: TransferRequest,
    pub stage: TransferStage,
    /// Feeds the request body while it arrives in frames
    pub request_body: Option<BodySender>,
    /// Backend response body, stashed until the proxy acks the headers
    pub response_body: Option<BodyStream>,
    /// Background work (forward or relay) tied to this transfer
    pub task: Option<AbortHandle>,
    /// Span all log lines of this transfer are recorded in
    pub span: Span,
}

impl PendingTransfer {
    pub fn new(backend_id: &str, request: TransferRequest) -> Self {
        let span = transfer_span(backend_id, &request);
        Self {
            request,
            stage: TransferStage::AwaitingRequestBody,
            request_body: None,
            response_body: None,
            task: None,
            span,
        }
    }

    pub fn id(&self) -> &str {
        &self.request.id
    }
}

/// A discarded transfer takes its background work with it.
impl Drop for PendingTransfer {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for PendingTransfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingTransfer")
            .field("request", &self.request)
            .field("stage", &self.stage)
            .field("request_body", &self.request_body.is_some())
            .field("response_body", &self.response_body.is_some())
            .field("task", &self.task.is_some())
            .finish()
    }
}

/// Span carrying the transfer id, method and target path of a transfer
pub fn transfer_span(backend_id: &str, request: &TransferRequest) -> Span {
    info_span!(
        "transfer",
        id = %request.id,
        method = %request.method,
        backend = %backend_id,
        path = %request.path,
    )
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("transfer {0} is already pending")]
    Duplicate(TransferId),

    #[error("transfer {0} not found")]
    NotFound(TransferId),
}

/// Transfers keyed by id.
///
/// Owned by a single transport task, so no locking happens here.
#[derive(Debug, Default)]
pub struct TransferRegistry {
    transfers: HashMap<TransferId, PendingTransfer>,
}

impl TransferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transfer. An id that is already pending is rejected so
    /// that no transfer is ever forwarded twice.
    pub fn put(&mut self, transfer: PendingTransfer) -> Result<(), RegistryError> {
        if self.transfers.contains_key(transfer.id()) {
            return Err(RegistryError::Duplicate(transfer.request.id.clone()));
        }
        self.transfers.insert(transfer.request.id.clone(), transfer);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<&PendingTransfer, RegistryError> {
        self.transfers
            .get(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    pub fn get_mut(&mut self, id: &str) -> Result<&mut PendingTransfer, RegistryError> {
        self.transfers
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.transfers.contains_key(id)
    }

    /// Remove a transfer. Removing an id that is not pending is a no-op.
    pub fn remove(&mut self, id: &str) -> Option<PendingTransfer> {
        let removed = self.transfers.remove(id);
        if removed.is_none() {
            warn!("transfer {} already removed", id);
        }
        removed
    }

    /// Drop every transfer, returning how many were pending
    pub fn clear(&mut self) -> usize {
        let count = self.transfers.len();
        self.transfers.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transfer(id: &str) -> PendingTransfer {
        PendingTransfer::new(
            "b1",
            TransferRequest {
                id: id.into(),
                path: "/x".into(),
                method: "GET".into(),
                headers: Default::default(),
            },
        )
    }

    #[test]
    fn test_put_get_remove() {
        let mut reg = TransferRegistry::new();
        reg.put(transfer("t1")).unwrap();
        reg.put(transfer("t2")).unwrap();
        assert_eq!(reg.len(), 2);
        assert_eq!(reg.get("t1").unwrap().stage, TransferStage::AwaitingRequestBody);

        reg.get_mut("t2").unwrap().stage = TransferStage::Forwarding;
        assert_eq!(reg.get("t2").unwrap().stage, TransferStage::Forwarding);

        assert!(reg.remove("t1").is_some());
        assert!(!reg.contains("t1"));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut reg = TransferRegistry::new();
        reg.put(transfer("t1")).unwrap();
        assert_eq!(reg.put(transfer("t1")), Err(RegistryError::Duplicate("t1".into())));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_unknown_id() {
        let reg = TransferRegistry::new();
        assert_eq!(reg.get("nope").unwrap_err(), RegistryError::NotFound("nope".into()));
    }

    #[test]
    fn test_second_remove_is_noop() {
        let mut reg = TransferRegistry::new();
        reg.put(transfer("t1")).unwrap();
        assert!(reg.remove("t1").is_some());
        assert!(reg.remove("t1").is_none());
        assert!(reg.is_empty());
    }

    #[tokio::test]
    async fn test_removal_aborts_task() {
        let mut reg = TransferRegistry::new();
        let mut t = transfer("t1");
        let handle = tokio::spawn(std::future::pending::<()>());
        t.task = Some(handle.abort_handle());
        reg.put(t).unwrap();

        reg.remove("t1");
        assert!(handle.await.unwrap_err().is_cancelled());
    }

    #[test]
    fn test_clear() {
        let mut reg = TransferRegistry::new();
        reg.put(transfer("t1")).unwrap();
        reg.put(transfer("t2")).unwrap();
        assert_eq!(reg.clear(), 2);
        assert!(reg.is_empty());
    }
}
