// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// IPP-over-HTTP listener.
//
// Accepts TCP connections (default port 631), frames HTTP/1.1 requests, and
// hands each POST to the operation handler.  Connections are kept alive
// across requests, protocol errors included, as long as the request body was
// consumed to its end; otherwise the connection is closed after the reply.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use printgate_core::config::IppListenerConfig;
use printgate_core::error::{PrintgateError, Result};
use printgate_core::types::ServerStatus;

use super::http::{HttpConnection, HttpError, HttpResponse};
use super::operations::{IppHandler, RequestContext};
use crate::intake::Intake;

/// Unread body bytes we are willing to skip to keep a connection alive.
const DRAIN_LIMIT: u64 = 1024 * 1024;

/// State shared across all connection-handling tasks.
struct SharedState {
    handler: Arc<IppHandler>,
    idle_timeout: Duration,
    active_connections: Arc<AtomicU32>,
    slots: Arc<Semaphore>,
}

/// Embedded IPP print server.
pub struct IppServer {
    config: IppListenerConfig,
    handler: Arc<IppHandler>,
    status: ServerStatus,
    local_addr: Option<SocketAddr>,
    shutdown_signal: Arc<Notify>,
    task_handle: Option<JoinHandle<()>>,
    active_connections: Arc<AtomicU32>,
}

impl IppServer {
    /// Create a server in `Stopped` state.
    pub fn new(config: IppListenerConfig, intake: Arc<Intake>) -> Self {
        let handler = Arc::new(IppHandler::new(intake, config.clone()));
        Self {
            config,
            handler,
            status: ServerStatus::Stopped,
            local_addr: None,
            shutdown_signal: Arc::new(Notify::new()),
            task_handle: None,
            active_connections: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn status(&self) -> ServerStatus {
        self.status
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn active_connections(&self) -> u32 {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Bind and start accepting connections.
    pub async fn start(&mut self) -> Result<()> {
        if self.status == ServerStatus::Running {
            debug!(port = self.config.port, "IPP server already running");
            return Ok(());
        }
        self.status = ServerStatus::Starting;

        let bind_addr = SocketAddr::new(self.config.bind, self.config.port);
        let listener = match TcpListener::bind(bind_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                self.status = ServerStatus::Error;
                return Err(PrintgateError::PrintServer(format!("bind {bind_addr}: {e}")));
            }
        };
        let local_addr = listener
            .local_addr()
            .map_err(|e| PrintgateError::PrintServer(format!("local addr: {e}")))?;
        info!(addr = %local_addr, printer = %self.config.printer_name, "IPP server started");

        let shared = Arc::new(SharedState {
            handler: Arc::clone(&self.handler),
            idle_timeout: self.config.idle_timeout(),
            active_connections: Arc::clone(&self.active_connections),
            slots: Arc::new(Semaphore::new(self.config.max_connections.max(1))),
        });
        let shutdown = Arc::clone(&self.shutdown_signal);

        self.task_handle = Some(tokio::spawn(async move {
            Self::accept_loop(listener, local_addr, shutdown, shared).await;
        }));
        self.local_addr = Some(local_addr);
        self.status = ServerStatus::Running;
        Ok(())
    }

    /// Stop accepting.  Exchanges already in progress finish.
    pub async fn stop(&mut self) -> Result<()> {
        if self.status != ServerStatus::Running {
            return Ok(());
        }
        info!(addr = ?self.local_addr, "stopping IPP server");
        self.shutdown_signal.notify_one();

        if let Some(handle) = self.task_handle.take() {
            handle
                .await
                .map_err(|e| PrintgateError::PrintServer(format!("task join: {e}")))?;
        }
        self.status = ServerStatus::Stopped;
        self.local_addr = None;
        Ok(())
    }

    async fn accept_loop(
        listener: TcpListener,
        listen_addr: SocketAddr,
        shutdown: Arc<Notify>,
        shared: Arc<SharedState>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.notified() => {
                    debug!("IPP accept loop received shutdown signal");
                    break;
                }

                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            let Ok(permit) = Arc::clone(&shared.slots).try_acquire_owned() else {
                                warn!(peer = %peer_addr, "connection limit reached, closing");
                                drop(stream);
                                continue;
                            };
                            debug!(peer = %peer_addr, "incoming IPP connection");
                            let local_addr = stream.local_addr().unwrap_or(listen_addr);
                            let state = Arc::clone(&shared);
                            tokio::spawn(async move {
                                state.active_connections.fetch_add(1, Ordering::Relaxed);
                                handle_connection(stream, peer_addr, local_addr, &state).await;
                                state.active_connections.fetch_sub(1, Ordering::Relaxed);
                                drop(permit);
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "failed to accept connection");
                        }
                    }
                }
            }
        }
    }
}

/// Serve requests on one connection until the client leaves or the framing
/// breaks.
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    local: SocketAddr,
    state: &SharedState,
) {
    let mut conn = HttpConnection::new(stream, state.idle_timeout);

    loop {
        let head = match conn.read_head().await {
            Ok(Some(head)) => head,
            Ok(None) => {
                debug!(peer = %peer, "IPP client closed connection");
                return;
            }
            Err(HttpError::Malformed(message)) => {
                warn!(peer = %peer, error = %message, "malformed HTTP request");
                let _ = conn
                    .write_response(&HttpResponse::bad_request(&message), false)
                    .await;
                return;
            }
            Err(e) => {
                debug!(peer = %peer, error = %e, "IPP connection ended");
                return;
            }
        };

        let ctx = RequestContext {
            head: &head,
            peer,
            local,
        };
        let mut body = conn.body(&head);
        let response = if head.method.eq_ignore_ascii_case("POST") {
            state.handler.handle(&ctx, &mut body).await
        } else {
            debug!(peer = %peer, method = %head.method, "non-POST request");
            HttpResponse::method_not_allowed()
        };

        let reusable = head.keep_alive
            && (body.is_finished() || body.drain(DRAIN_LIMIT).await.unwrap_or(false));

        if let Err(e) = conn.write_response(&response, reusable).await {
            debug!(peer = %peer, error = %e, "could not write IPP response");
            return;
        }
        debug!(
            peer = %peer,
            status = response.status,
            bytes = response.body.len(),
            keep_alive = reusable,
            "IPP response sent"
        );
        if !reusable {
            return;
        }
    }
}
