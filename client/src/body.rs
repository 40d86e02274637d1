//! Lazily streamed bodies
//!
//! Request and response bodies are never buffered whole. Everything that
//! carries one uses [`BodyStream`].

use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// A body as a stream of chunks
pub type BodyStream = BoxStream<'static, io::Result<Bytes>>;

/// Chunks buffered between a body source and the outgoing request
const PUMP_BUFFER: usize = 16;

/// Why a chunk could not be fed into a [`BodySender`]
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FeedError {
    #[error("body is no longer read")]
    Closed,

    #[error("more than {limit} bytes of body waiting to be read")]
    Overflow { limit: usize },
}

/// Producer half of a body fed from elsewhere (e.g. duplex frames).
///
/// Feeding never waits. Instead the bytes not yet taken by the reader are
/// counted and feeding fails once they exceed the limit.
pub struct BodySender {
    tx: mpsc::UnboundedSender<io::Result<Bytes>>,
    buffered: Arc<AtomicUsize>,
    limit: usize,
}

impl BodySender {
    pub fn feed(&self, chunk: Bytes) -> Result<(), FeedError> {
        let len = chunk.len();
        let buffered = self.buffered.fetch_add(len, Ordering::AcqRel) + len;
        if buffered > self.limit {
            return Err(FeedError::Overflow { limit: self.limit });
        }
        self.tx.send(Ok(chunk)).map_err(|_| FeedError::Closed)
    }

    /// End the body with an error
    pub fn fail(self, error: io::Error) {
        let _ = self.tx.send(Err(error));
    }
}

/// A body whose chunks are pushed through the returned sender, holding at
/// most `limit` unread bytes. The stream ends when the sender is dropped.
pub fn channel_body(limit: usize) -> (BodySender, BodyStream) {
    let (tx, mut rx) = mpsc::unbounded_channel::<io::Result<Bytes>>();
    let buffered = Arc::new(AtomicUsize::new(0));
    let counter = buffered.clone();
    let stream = async_stream::stream! {
        while let Some(chunk) = rx.recv().await {
            if let Ok(bytes) = &chunk {
                counter.fetch_sub(bytes.len(), Ordering::AcqRel);
            }
            yield chunk;
        }
    };
    let sender = BodySender {
        tx,
        buffered,
        limit,
    };
    (sender, stream.boxed())
}

/// Body of a reqwest response, chunk by chunk
pub fn from_response(response: reqwest::Response) -> BodyStream {
    response
        .bytes_stream()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
        .boxed()
}

/// Turn a body into an outgoing reqwest body.
///
/// reqwest wants a `Sync` stream, so the source is pumped through a
/// bounded channel by its own task. Dropping the request drops the
/// receiver, which stops the pump.
pub fn into_request_body(mut source: BodyStream) -> reqwest::Body {
    let (tx, mut rx) = mpsc::channel::<io::Result<Bytes>>(PUMP_BUFFER);
    tokio::spawn(async move {
        while let Some(chunk) = source.next().await {
            let failed = chunk.is_err();
            if tx.send(chunk).await.is_err() || failed {
                break;
            }
        }
    });
    let stream = async_stream::stream! {
        while let Some(chunk) = rx.recv().await {
            yield chunk;
        }
    };
    reqwest::Body::wrap_stream(stream)
}

/// Read a whole body into memory. Tests only.
#[cfg(test)]
pub async fn collect(mut body: BodyStream) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    while let Some(chunk) = body.next().await {
        out.extend_from_slice(&chunk?);
    }
    Ok(out)
}
