// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Raw print listener (JetDirect / "port 9100").
//
// The raw protocol has no framing: a client connects, streams a document,
// and disconnects.  Connection close (or the idle timeout) is the job
// boundary.  Each connection runs in its own task, capped by a semaphore;
// connections beyond the cap are closed on accept.
//
// Outcomes per connection:
//   - closed with no data           -> nothing recorded
//   - queue full at the first byte  -> connection dropped, rejection audited
//   - closed / idle after >= 1 byte -> attributed or orphaned pending job
//                                      (or discarded under the reject policy)
//   - reset mid-transfer            -> failed job, partial bytes kept
//   - spool write failure           -> no job, spool file removed

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use printgate_core::config::RawListenerConfig;
use printgate_core::error::{PrintgateError, Result};
use printgate_core::types::{DocumentFormat, JobOrigin, PrintJob, ServerStatus};
use printgate_security::audit::AuditAction;

use crate::intake::Intake;
use crate::spool::SpoolWriter;

/// Read buffer per connection.
const READ_CHUNK: usize = 64 * 1024;

/// State shared across all connection-handling tasks.
struct SharedState {
    intake: Arc<Intake>,
    idle_timeout: Duration,
    active_connections: Arc<AtomicU32>,
    slots: Arc<Semaphore>,
}

/// Raw socket print server.
pub struct RawServer {
    config: RawListenerConfig,
    intake: Arc<Intake>,
    status: ServerStatus,
    local_addr: Option<SocketAddr>,
    shutdown_signal: Arc<Notify>,
    task_handle: Option<JoinHandle<()>>,
    active_connections: Arc<AtomicU32>,
}

impl RawServer {
    /// Create a server in `Stopped` state.
    pub fn new(config: RawListenerConfig, intake: Arc<Intake>) -> Self {
        Self {
            config,
            intake,
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

    /// The bound address once running (useful when configured with port 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn active_connections(&self) -> u32 {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Bind and start accepting connections.
    pub async fn start(&mut self) -> Result<()> {
        if self.status == ServerStatus::Running {
            debug!(port = self.config.port, "raw server already running");
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
        info!(addr = %local_addr, "raw print listener started");

        let shared = Arc::new(SharedState {
            intake: Arc::clone(&self.intake),
            idle_timeout: self.config.idle_timeout(),
            active_connections: Arc::clone(&self.active_connections),
            slots: Arc::new(Semaphore::new(self.config.max_connections.max(1))),
        });
        let shutdown = Arc::clone(&self.shutdown_signal);

        self.task_handle = Some(tokio::spawn(async move {
            Self::accept_loop(listener, shutdown, shared).await;
        }));
        self.local_addr = Some(local_addr);
        self.status = ServerStatus::Running;
        Ok(())
    }

    /// Stop accepting.  Connections already open run to completion.
    pub async fn stop(&mut self) -> Result<()> {
        if self.status != ServerStatus::Running {
            return Ok(());
        }
        info!(addr = ?self.local_addr, "stopping raw print listener");
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

    async fn accept_loop(listener: TcpListener, shutdown: Arc<Notify>, shared: Arc<SharedState>) {
        loop {
            tokio::select! {
                _ = shutdown.notified() => {
                    debug!("raw accept loop received shutdown signal");
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
                            debug!(peer = %peer_addr, "incoming raw connection");
                            let state = Arc::clone(&shared);
                            tokio::spawn(async move {
                                state.active_connections.fetch_add(1, Ordering::Relaxed);
                                if let Err(e) = handle_connection(stream, peer_addr, &state).await {
                                    warn!(peer = %peer_addr, error = %e, "raw submission not recorded");
                                }
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

/// Spool one connection's bytes and record the outcome.
async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    state: &SharedState,
) -> Result<()> {
    let intake = &state.intake;
    let mut buf = vec![0u8; READ_CHUNK];
    let mut open: Option<(PrintJob, SpoolWriter)> = None;

    loop {
        let read = tokio::time::timeout(state.idle_timeout, stream.read(&mut buf)).await;
        let n = match read {
            Err(_) => {
                debug!(peer = %peer_addr, "idle timeout, ending job");
                break;
            }
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                let Some((draft, writer)) = open.take() else {
                    debug!(peer = %peer_addr, error = %e, "connection failed before any data");
                    return Ok(());
                };
                return record_truncated(intake, peer_addr, draft, writer, &e.to_string()).await;
            }
        };

        if open.is_none() {
            if let Err(e) = intake.check_capacity() {
                intake.audit(
                    AuditAction::SubmissionRejected,
                    &peer_addr.ip().to_string(),
                    false,
                    Some(&e.to_string()),
                );
                return Err(e);
            }
            let draft = PrintJob::new(
                JobOrigin::Raw,
                peer_addr.ip(),
                None,
                DocumentFormat::OctetStream,
                format!("Raw job from {}", peer_addr.ip()),
            );
            let writer = intake.spool().create(&draft.id).await?;
            open = Some((draft, writer));
        }

        if let Some((_, writer)) = open.as_mut() {
            if let Err(e) = writer.write(&buf[..n]).await {
                if let Some((_, writer)) = open.take() {
                    writer.abort().await;
                }
                return Err(e);
            }
        }
    }

    let Some((mut draft, writer)) = open else {
        debug!(peer = %peer_addr, "connection closed without data, no job");
        return Ok(());
    };

    match intake.attribute_raw(peer_addr.ip()) {
        Ok(owner) => draft.owner = owner,
        Err(e) => {
            writer.abort().await;
            return Err(e);
        }
    }
    let doc = writer.finish().await?;
    intake.accept(draft, doc).await?;
    Ok(())
}

async fn record_truncated(
    intake: &Intake,
    peer_addr: SocketAddr,
    mut draft: PrintJob,
    writer: SpoolWriter,
    reason: &str,
) -> Result<()> {
    match intake.attribute_raw(peer_addr.ip()) {
        Ok(owner) => draft.owner = owner,
        Err(e) => {
            writer.abort().await;
            return Err(e);
        }
    }
    let doc = writer.finish().await?;
    intake.record_truncated(draft, doc, reason).await?;
    Ok(())
}
