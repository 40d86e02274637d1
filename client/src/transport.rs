//! Transports connecting one backend to the reverse proxy

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;

use crate::config::{ConnectionConfig, TransportKind};
use crate::duplex::DuplexTransport;
use crate::polling::PollingTransport;
use crate::proxy::Forwarder;

/// A way of pulling transfers from the proxy and relaying the backend's
/// answers. `run` only returns when the task is aborted.
#[async_trait]
pub trait TunnelTransport: Send + Sync {
    fn backend_id(&self) -> &str;

    fn kind(&self) -> TransportKind;

    async fn run(&self);
}

/// Build the transport an entry asks for
pub fn build_transport(conn: ConnectionConfig) -> Result<Box<dyn TunnelTransport>> {
    let conn = Arc::new(conn);
    let backend_client = Forwarder::backend_client().context("failed to build backend HTTP client")?;
    let forwarder = Arc::new(Forwarder::new(
        backend_client,
        conn.backend_base_url.clone(),
        conn.request_timeout,
    ));

    let transport: Box<dyn TunnelTransport> = match conn.transport {
        TransportKind::Polling => {
            let proxy_client = reqwest::Client::builder()
                .build()
                .context("failed to build proxy HTTP client")?;
            Box::new(PollingTransport::new(conn, proxy_client, forwarder))
        }
        TransportKind::Duplex => Box::new(DuplexTransport::new(conn, forwarder)),
    };
    Ok(transport)
}
