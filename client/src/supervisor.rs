//! Connection supervisor
//!
//! Starts one transport per configured backend connection and keeps them
//! running until shutdown. Connections never share state; a rejected or
//! failing entry does not affect the others.

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, ConnectionConfig, TransportKind};
use crate::transport::{build_transport, TunnelTransport};

/// Why an entry was not started
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Skipped {
    Excluded(String),
    CommentedOut(String),
    Rejected(String),
}

/// Owns the running backend connections
pub struct ConnectionSupervisor {
    entries: Vec<Result<ConnectionConfig, ConfigError>>,
    handles: Vec<(String, JoinHandle<()>)>,
    skipped: Vec<Skipped>,
}

impl ConnectionSupervisor {
    pub fn new(entries: Vec<Result<ConnectionConfig, ConfigError>>) -> Self {
        Self {
            entries,
            handles: Vec::new(),
            skipped: Vec::new(),
        }
    }

    /// Start a transport for every usable entry, in configuration order
    pub fn start_all(&mut self) {
        for entry in std::mem::take(&mut self.entries) {
            let conn = match entry {
                Ok(conn) => conn,
                Err(e) => {
                    error!("{}; entry skipped", e);
                    self.skipped.push(Skipped::Rejected(e.to_string()));
                    continue;
                }
            };

            if conn.is_commented_out() {
                warn!("[{}] commented out; skipped", conn.backend_id);
                self.skipped.push(Skipped::CommentedOut(conn.backend_id));
                continue;
            }
            if conn.excluded {
                info!("[{}] excluded; skipped", conn.backend_id);
                self.skipped.push(Skipped::Excluded(conn.backend_id));
                continue;
            }
            if conn.transport == TransportKind::Duplex && conn.max_in_flight.is_none() {
                debug!(
                    "[{}] no maxInFlight set; pipelined transfers are unbounded",
                    conn.backend_id
                );
            }

            let backend_id = conn.backend_id.clone();
            match build_transport(conn) {
                Ok(transport) => self.spawn(backend_id, transport),
                Err(e) => {
                    error!("[{}] could not start: {:#}", backend_id, e);
                    self.skipped.push(Skipped::Rejected(format!("{}: {:#}", backend_id, e)));
                }
            }
        }

        let started = self.started();
        info!("{} backend connection(s) started: {:?}", started.len(), started);
    }

    fn spawn(&mut self, backend_id: String, transport: Box<dyn TunnelTransport>) {
        info!(
            "[{}] starting {} transport",
            transport.backend_id(),
            transport.kind()
        );
        let handle = tokio::spawn(async move { transport.run().await });
        self.handles.push((backend_id, handle));
    }

    /// Backend ids with a running transport
    pub fn started(&self) -> Vec<&str> {
        self.handles.iter().map(|(id, _)| id.as_str()).collect()
    }

    pub fn skipped(&self) -> &[Skipped] {
        &self.skipped
    }

    /// Wait for Ctrl+C, then stop every connection
    pub async fn wait_for_shutdown(self) {
        if self.handles.is_empty() {
            warn!("no backend connection running; nothing to do");
            return;
        }
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("could not listen for shutdown signal: {}", e);
        }
        info!("Shutting down all backend connections...");
        self.shutdown();
    }

    /// Abort every transport. In-flight transfers are dropped.
    pub fn shutdown(self) {
        for (backend_id, handle) in self.handles {
            debug!("[{}] stopping", backend_id);
            handle.abort();
        }
    }
}
