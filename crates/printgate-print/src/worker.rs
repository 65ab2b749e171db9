// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Conversion worker pool.
//
// A fixed number of workers claim pending jobs oldest-first and drive each
// through the renderer:
//
//   spool (digest checked) -> normalised PDF (>= 1 page) -> page-1 raster
//     -> thumbnail -> artifacts/<id>.pdf + artifacts/<id>.png -> completed
//
// Artifacts are staged under hidden temp names and renamed into place only
// once both exist, so a reader never sees half an artifact pair.  Failures
// go through the retry policy: transient ones are requeued with backoff,
// permanent or exhausted ones fail the job.  Cancellation of an in-flight
// job is noticed by polling the store and forwarded to the renderer.
//
// Stopping the pool abandons in-flight jobs; they stay `processing` and are
// requeued by `recover_processing` on the next start.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use printgate_core::config::{RendererConfig, WorkerConfig};
use printgate_core::error::{PrintgateError, Result};
use printgate_core::types::{JobId, PrintJob, ServerStatus};
use printgate_document::{PdfReader, make_thumbnail};
use printgate_security::integrity::verify_hash;

use crate::renderer::{RenderTarget, Renderer};
use crate::retry::{RetryDecision, RetryPolicy, should_retry};
use crate::spool::remove_quietly;
use crate::store::JobStore;

/// Floor on an idle worker's sleep.
const MIN_IDLE_WAIT: Duration = Duration::from_millis(10);

/// Pool sizing and timing.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub count: usize,
    /// Idle re-check interval, also the cancel-flag poll interval.
    pub poll_interval: Duration,
    pub retry: RetryPolicy,
    pub thumbnail_max_px: u32,
}

impl WorkerSettings {
    pub fn from_config(workers: &WorkerConfig, renderer: &RendererConfig) -> Self {
        Self {
            count: workers.count.max(1),
            poll_interval: workers.poll_interval(),
            retry: RetryPolicy::from_config(workers),
            thumbnail_max_px: renderer.thumbnail_max_px,
        }
    }
}

/// Files written for a job but not yet published.
struct StagedArtifacts {
    document: PathBuf,
    thumbnail: PathBuf,
    pages: usize,
}

/// State shared by every worker task.
struct WorkerShared<R> {
    store: Arc<JobStore>,
    renderer: R,
    artifact_dir: PathBuf,
    settings: WorkerSettings,
    wake: Arc<Notify>,
    busy: AtomicU32,
}

/// Fixed-size pool of conversion workers.
pub struct WorkerPool<R: Renderer + 'static> {
    shared: Arc<WorkerShared<R>>,
    status: ServerStatus,
    shutdown: Option<watch::Sender<bool>>,
    handles: Vec<JoinHandle<()>>,
}

impl<R: Renderer + 'static> WorkerPool<R> {
    /// `wake` is notified whenever a pending job is created (see
    /// `Intake::wake_handle`).
    pub fn new(
        store: Arc<JobStore>,
        renderer: R,
        artifact_dir: impl Into<PathBuf>,
        wake: Arc<Notify>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            shared: Arc::new(WorkerShared {
                store,
                renderer,
                artifact_dir: artifact_dir.into(),
                settings,
                wake,
                busy: AtomicU32::new(0),
            }),
            status: ServerStatus::Stopped,
            shutdown: None,
            handles: Vec::new(),
        }
    }

    pub fn status(&self) -> ServerStatus {
        self.status
    }

    /// Workers currently converting a job.
    pub fn busy_workers(&self) -> u32 {
        self.shared.busy.load(Ordering::Relaxed)
    }

    /// Recover interrupted jobs, then spawn the workers.
    pub async fn start(&mut self) -> Result<()> {
        if self.status == ServerStatus::Running {
            return Ok(());
        }
        self.status = ServerStatus::Starting;

        if let Err(e) = tokio::fs::create_dir_all(&self.shared.artifact_dir).await {
            self.status = ServerStatus::Error;
            return Err(e.into());
        }
        let recovered = match self.shared.store.recover_processing() {
            Ok(n) => n,
            Err(e) => {
                self.status = ServerStatus::Error;
                return Err(e);
            }
        };

        let (tx, rx) = watch::channel(false);
        for index in 0..self.shared.settings.count {
            let shared = Arc::clone(&self.shared);
            let shutdown = rx.clone();
            self.handles.push(tokio::spawn(async move {
                run_worker(index, shared, shutdown).await;
            }));
        }
        self.shutdown = Some(tx);
        self.status = ServerStatus::Running;
        info!(
            workers = self.shared.settings.count,
            recovered,
            "conversion workers started"
        );
        Ok(())
    }

    /// Signal every worker and wait for them to exit.
    pub async fn stop(&mut self) -> Result<()> {
        if self.status != ServerStatus::Running {
            return Ok(());
        }
        info!("stopping conversion workers");
        if let Some(tx) = self.shutdown.take() {
            // Receivers are held by the workers, so this only fails once they
            // have all exited.
            let _ = tx.send(true);
        }
        for handle in self.handles.drain(..) {
            handle
                .await
                .map_err(|e| PrintgateError::PrintServer(format!("worker join: {e}")))?;
        }
        self.status = ServerStatus::Stopped;
        Ok(())
    }
}

async fn run_worker<R: Renderer>(
    index: usize,
    shared: Arc<WorkerShared<R>>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(worker = index, "worker started");
    loop {
        if *shutdown.borrow() {
            break;
        }

        match shared.store.claim_next() {
            Ok(Some(job)) => {
                let id = job.id;
                shared.busy.fetch_add(1, Ordering::Relaxed);
                let stopped = tokio::select! {
                    _ = shutdown_signalled(&mut shutdown) => true,
                    () = shared.process(job) => false,
                };
                shared.busy.fetch_sub(1, Ordering::Relaxed);
                if stopped {
                    info!(worker = index, job_id = %id, "shutdown during conversion, job left for recovery");
                    break;
                }
                continue;
            }
            Ok(None) => {}
            Err(e) => error!(worker = index, error = %e, "claim failed"),
        }

        let wait = shared.idle_wait();
        tokio::select! {
            _ = shutdown_signalled(&mut shutdown) => break,
            _ = shared.wake.notified() => {}
            _ = tokio::time::sleep(wait) => {}
        }
    }
    debug!(worker = index, "worker stopped");
}

async fn shutdown_signalled(shutdown: &mut watch::Receiver<bool>) {
    // A dropped sender also means stop.
    let _ = shutdown.wait_for(|stop| *stop).await;
}

impl<R: Renderer> WorkerShared<R> {
    /// Sleep no longer than the poll interval, and no longer than it takes
    /// for the next backed-off job to become due.
    fn idle_wait(&self) -> Duration {
        let poll = self.settings.poll_interval;
        match self.store.next_due() {
            Ok(Some(due)) => (due - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO)
                .clamp(MIN_IDLE_WAIT, poll.max(MIN_IDLE_WAIT)),
            _ => poll,
        }
    }

    async fn process(&self, job: PrintJob) {
        let id = job.id;
        info!(job_id = %id, attempt = job.attempts, format = job.format.mime_type(), "converting job");

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let convert = self.convert(&job, cancel_rx.clone());
        tokio::pin!(convert);
        let result = tokio::select! {
            result = &mut convert => result,
            () = self.watch_for_cancel(&id, &cancel_tx) => convert.await,
        };

        let cancelled = *cancel_rx.borrow() || self.store.cancel_requested(&id).unwrap_or(false);
        if cancelled {
            if let Ok(staged) = &result {
                discard(staged).await;
            }
            if let Err(e) = self.store.finish_cancelled(&id) {
                warn!(job_id = %id, error = %e, "could not record cancellation");
            }
            return;
        }

        match result {
            Ok(staged) => self.publish(&id, staged).await,
            Err(err) => self.record_failure(&job, &err),
        }
    }

    /// Resolves once the owner's cancel request has been forwarded.
    async fn watch_for_cancel(&self, id: &JobId, cancel: &watch::Sender<bool>) {
        loop {
            tokio::time::sleep(self.settings.poll_interval).await;
            match self.store.cancel_requested(id) {
                Ok(true) => {
                    debug!(job_id = %id, "cancel requested, stopping render");
                    let _ = cancel.send(true);
                    return;
                }
                Ok(false) => {}
                Err(e) => warn!(job_id = %id, error = %e, "cancel flag check failed"),
            }
        }
    }

    async fn convert(&self, job: &PrintJob, cancel: watch::Receiver<bool>) -> Result<StagedArtifacts> {
        let id = job.id;
        let document = self.artifact_dir.join(format!(".{id}.pdf.tmp"));
        let raster = self.artifact_dir.join(format!(".{id}.page1.tmp"));
        let thumbnail = self.artifact_dir.join(format!(".{id}.png.tmp"));

        let result = self
            .convert_into(job, &document, &raster, &thumbnail, cancel)
            .await;
        remove_quietly(&raster).await;
        match result {
            Ok(pages) => Ok(StagedArtifacts {
                document,
                thumbnail,
                pages,
            }),
            Err(e) => {
                remove_quietly(&document).await;
                remove_quietly(&thumbnail).await;
                Err(e)
            }
        }
    }

    async fn convert_into(
        &self,
        job: &PrintJob,
        document: &Path,
        raster: &Path,
        thumbnail: &Path,
        cancel: watch::Receiver<bool>,
    ) -> Result<usize> {
        let spool = PathBuf::from(&job.spool_path);

        blocking({
            let spool = spool.clone();
            let expected = job.document_hash.clone();
            move || verify_hash(spool, &expected)
        })
        .await?;

        self.renderer
            .render(RenderTarget::Document, &spool, document, cancel.clone())
            .await?;
        let pdf = tokio::fs::read(document).await?;
        let pages = blocking(move || PdfReader::from_bytes(&pdf)?.ensure_printable()).await?;

        self.renderer
            .render(RenderTarget::Thumbnail, document, raster, cancel)
            .await?;
        let page = tokio::fs::read(raster).await?;
        let max_px = self.settings.thumbnail_max_px;
        let png = blocking(move || make_thumbnail(&page, max_px)).await?;
        tokio::fs::write(thumbnail, png).await?;

        Ok(pages)
    }

    async fn publish(&self, id: &JobId, staged: StagedArtifacts) {
        let document_ref = format!("{id}.pdf");
        let thumbnail_ref = format!("{id}.png");
        let document = self.artifact_dir.join(&document_ref);
        let thumbnail = self.artifact_dir.join(&thumbnail_ref);

        let renamed = async {
            tokio::fs::rename(&staged.thumbnail, &thumbnail).await?;
            tokio::fs::rename(&staged.document, &document).await
        }
        .await;
        if let Err(e) = renamed {
            error!(job_id = %id, error = %e, "could not publish artifacts");
            discard(&staged).await;
            remove_quietly(&thumbnail).await;
            if let Err(e) = self.store.fail(id, &format!("artifact publish failed: {e}")) {
                warn!(job_id = %id, error = %e, "could not record failure");
            }
            return;
        }

        match self.store.complete(id, &document_ref, &thumbnail_ref) {
            Ok(()) => info!(job_id = %id, pages = staged.pages, "artifacts published"),
            Err(e) => {
                // Job left `processing` underneath us (cancelled or recovered).
                warn!(job_id = %id, error = %e, "could not complete job, withdrawing artifacts");
                remove_quietly(&document).await;
                remove_quietly(&thumbnail).await;
            }
        }
    }

    fn record_failure(&self, job: &PrintJob, err: &PrintgateError) {
        let id = &job.id;
        let message = err.to_string();
        let policy = RetryPolicy {
            max_attempts: job.max_attempts.max(1),
            ..self.settings.retry.clone()
        };

        let recorded = match should_retry(err, job.number as u64, job.attempts, &policy) {
            RetryDecision::RetryAfter(delay) => {
                let not_before = Utc::now()
                    + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
                self.store.requeue(id, &message, not_before)
            }
            RetryDecision::GiveUp | RetryDecision::Exhausted => self.store.fail(id, &message),
        };
        if let Err(e) = recorded {
            warn!(job_id = %id, error = %e, "could not record conversion failure");
        }
    }
}

async fn discard(staged: &StagedArtifacts) {
    remove_quietly(&staged.document).await;
    remove_quietly(&staged.thumbnail).await;
}

/// Run CPU- or disk-bound work off the async runtime.
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| PrintgateError::Conversion(format!("blocking task failed: {e}")))?
}
