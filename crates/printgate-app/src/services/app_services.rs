// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Central service layer: opens the stores, loads the identity directory, and
// owns the listeners and the worker pool for the lifetime of the daemon.
//
// The SQLite-backed audit log is `Send` but not `Sync`, so it is shared as
// `Arc<Mutex<AuditLog>>`; the job store serialises internally.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use printgate_core::config::ServerConfig;
use printgate_core::error::Result;
use printgate_core::types::ServerStatus;
use printgate_print::intake::IntakeSettings;
use printgate_print::spool::Spool;
use printgate_print::worker::WorkerSettings;
use printgate_print::{
    IdentityResolver, Intake, IppServer, JobService, JobStore, RawServer, SubprocessRenderer,
    WorkerPool,
};
use printgate_security::audit::AuditLog;

use super::data_dir;

/// Everything the daemon runs.
pub struct AppServices {
    config: ServerConfig,
    intake: Arc<Intake>,
    jobs: Arc<JobService>,
    raw: RawServer,
    ipp: IppServer,
    workers: WorkerPool<SubprocessRenderer>,
}

impl AppServices {
    /// Open persistent state and build every component.  Nothing listens
    /// until `start`.
    pub fn init(config: ServerConfig) -> Result<Self> {
        data_dir::prepare(&config)?;
        info!(path = %config.data_dir.display(), "initialising services");

        let store = Arc::new(JobStore::open(config.jobs_db_path())?);
        let audit = Arc::new(Mutex::new(AuditLog::open(config.audit_db_path())?));

        let identity = match &config.attribution.directory_path {
            Some(path) => {
                let directory = IdentityResolver::load_directory(path)?;
                info!(
                    path = %path.display(),
                    registrations = directory.registrations.len(),
                    tokens = directory.tokens.len(),
                    "identity directory loaded"
                );
                IdentityResolver::from_directory(directory)?
            }
            None => {
                warn!("no identity directory configured; raw jobs will be orphaned");
                IdentityResolver::new()
            }
        };

        let intake = Arc::new(Intake::new(
            Arc::clone(&store),
            Arc::new(identity),
            audit,
            Spool::new(config.spool_dir()),
            IntakeSettings {
                max_depth: config.queue.max_depth,
                max_attempts: config.workers.max_attempts,
                orphan_policy: config.attribution.orphan_policy,
            },
        ));

        let renderer =
            SubprocessRenderer::new(config.renderer.clone(), config.workers.render_timeout());
        let workers = WorkerPool::new(
            store,
            renderer,
            config.artifact_dir(),
            intake.wake_handle(),
            WorkerSettings::from_config(&config.workers, &config.renderer),
        );

        Ok(Self {
            jobs: Arc::new(JobService::new(Arc::clone(&intake), config.artifact_dir())),
            raw: RawServer::new(config.raw.clone(), Arc::clone(&intake)),
            ipp: IppServer::new(config.ipp.clone(), Arc::clone(&intake)),
            workers,
            intake,
            config,
        })
    }

    /// Start the workers, then the enabled listeners.
    pub async fn start(&mut self) -> Result<()> {
        self.workers.start().await?;
        if self.config.raw.enabled {
            self.raw.start().await?;
        }
        if self.config.ipp.enabled {
            self.ipp.start().await?;
        }

        let orphaned = self.jobs().list_orphaned()?.len();
        if orphaned > 0 {
            warn!(orphaned, "orphaned jobs awaiting review");
        }
        info!(
            raw = ?self.raw_addr(),
            ipp = ?self.ipp_addr(),
            queued = self.intake.store().queue_depth()?,
            "Printgate running"
        );
        Ok(())
    }

    /// Stop accepting, then stop converting.
    pub async fn stop(&mut self) -> Result<()> {
        self.raw.stop().await?;
        self.ipp.stop().await?;
        self.workers.stop().await?;
        info!(statuses = ?self.statuses(), "Printgate stopped");
        Ok(())
    }

    /// Read-and-cancel surface for the web/API layer.
    pub fn jobs(&self) -> &Arc<JobService> {
        &self.jobs
    }

    pub fn raw_addr(&self) -> Option<SocketAddr> {
        self.raw.local_addr()
    }

    pub fn ipp_addr(&self) -> Option<SocketAddr> {
        self.ipp.local_addr()
    }

    pub fn statuses(&self) -> [ServerStatus; 3] {
        [self.raw.status(), self.ipp.status(), self.workers.status()]
    }
}
