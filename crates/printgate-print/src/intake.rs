// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Intake: the path from spooled bytes to a job record, shared by the raw
// and IPP listeners.
//
// Applies backpressure (queue depth), the orphan policy for unattributed raw
// submissions, and records attribution decisions in the audit log.  Workers
// are woken whenever a pending job is created.

use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tracing::{debug, info, warn};

use printgate_core::config::OrphanPolicy;
use printgate_core::error::{PrintgateError, Result};
use printgate_core::types::{AccountId, DocumentFormat, JobStatus, PrintJob};
use printgate_security::audit::{AuditAction, AuditLog};

use crate::identity::IdentityResolver;
use crate::spool::{Spool, SpooledDocument, remove_quietly};
use crate::store::JobStore;

/// Intake limits and policy.
#[derive(Debug, Clone)]
pub struct IntakeSettings {
    pub max_depth: usize,
    pub max_attempts: u32,
    pub orphan_policy: OrphanPolicy,
}

/// Shared submission pipeline.
pub struct Intake {
    store: Arc<JobStore>,
    identity: Arc<IdentityResolver>,
    audit: Arc<Mutex<AuditLog>>,
    spool: Spool,
    settings: IntakeSettings,
    wake: Arc<Notify>,
}

impl Intake {
    pub fn new(
        store: Arc<JobStore>,
        identity: Arc<IdentityResolver>,
        audit: Arc<Mutex<AuditLog>>,
        spool: Spool,
        settings: IntakeSettings,
    ) -> Self {
        Self {
            store,
            identity,
            audit,
            spool,
            settings,
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    pub fn identity(&self) -> &Arc<IdentityResolver> {
        &self.identity
    }

    pub fn spool(&self) -> &Spool {
        &self.spool
    }

    pub fn audit_log(&self) -> &Arc<Mutex<AuditLog>> {
        &self.audit
    }

    /// Notified each time a pending job is created.
    pub fn wake_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    /// Refuse new work while the queue is at its bound.
    pub fn check_capacity(&self) -> Result<()> {
        let depth = self.store.queue_depth()?;
        if depth >= self.settings.max_depth {
            return Err(PrintgateError::Capacity {
                depth,
                limit: self.settings.max_depth,
            });
        }
        Ok(())
    }

    /// Attribute a raw submission by source address.
    ///
    /// `Ok(None)` is an orphan under the accept policy; the reject policy
    /// turns a miss into `PrintgateError::Attribution`.
    pub fn attribute_raw(&self, addr: IpAddr) -> Result<Option<AccountId>> {
        match self.identity.resolve_address(addr) {
            Some(found) => {
                debug!(%addr, account = %found.account, range = %found.range, "raw submission attributed");
                Ok(Some(found.account))
            }
            None => match self.settings.orphan_policy {
                OrphanPolicy::Accept => Ok(None),
                OrphanPolicy::Reject => {
                    self.audit(
                        AuditAction::SubmissionRejected,
                        &addr.to_string(),
                        false,
                        Some("no address registration"),
                    );
                    Err(PrintgateError::Attribution(format!("no registration covers {addr}")))
                }
            },
        }
    }

    /// Record a fully received submission as a pending job.
    ///
    /// On any failure the spool file is removed; no job exists.
    pub async fn accept(&self, mut draft: PrintJob, doc: SpooledDocument) -> Result<PrintJob> {
        fill_from_spool(&mut draft, &doc);
        draft.status = JobStatus::Pending;
        draft.max_attempts = self.settings.max_attempts;

        match self.store.create_job(&draft, self.settings.max_depth) {
            Ok(job) => {
                self.audit_created(&job);
                self.wake.notify_waiters();
                info!(
                    job_id = %job.id,
                    number = job.number,
                    origin = job.origin.as_str(),
                    bytes = job.spool_size,
                    format = job.format.mime_type(),
                    "submission accepted"
                );
                Ok(job)
            }
            Err(e) => {
                if let PrintgateError::Capacity { depth, limit } = &e {
                    self.audit(
                        AuditAction::SubmissionRejected,
                        &draft.source_addr.to_string(),
                        false,
                        Some(&format!("queue full ({depth}/{limit})")),
                    );
                }
                remove_quietly(&doc.path).await;
                Err(e)
            }
        }
    }

    /// Record an upload that was cut off mid-transfer as a failed job.
    ///
    /// The received bytes stay in the spool for inspection.
    pub async fn record_truncated(
        &self,
        mut draft: PrintJob,
        doc: SpooledDocument,
        reason: &str,
    ) -> Result<PrintJob> {
        fill_from_spool(&mut draft, &doc);
        let message = format!("partial data: {reason} after {} bytes", doc.size);
        let now = chrono::Utc::now();
        draft.status = JobStatus::Failed;
        draft.error_history = vec![message.clone()];
        draft.error_message = Some(message);
        draft.max_attempts = self.settings.max_attempts;
        draft.updated_at = now;
        draft.completed_at = Some(now);

        let job = self.store.create_job(&draft, self.settings.max_depth)?;
        self.audit_created(&job);
        warn!(job_id = %job.id, bytes = job.spool_size, reason, "truncated submission recorded");
        Ok(job)
    }

    /// Append to the audit log.  Failures are logged, never propagated.
    pub fn audit(&self, action: AuditAction, subject: &str, success: bool, details: Option<&str>) {
        let log = match self.audit.lock() {
            Ok(log) => log,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = log.record(action, subject, success, details) {
            warn!(error = %e, action = action.as_str(), "audit write failed");
        }
    }

    fn audit_created(&self, job: &PrintJob) {
        let details = format!("job {} ({})", job.id, job.origin.as_str());
        match &job.owner {
            Some(owner) => self.audit(
                AuditAction::JobAttributed,
                &job.source_addr.to_string(),
                true,
                Some(&format!("{details} -> {owner}")),
            ),
            None => self.audit(
                AuditAction::JobOrphaned,
                &job.source_addr.to_string(),
                true,
                Some(&details),
            ),
        }
    }
}

fn fill_from_spool(draft: &mut PrintJob, doc: &SpooledDocument) {
    draft.spool_path = doc.path.to_string_lossy().into_owned();
    draft.spool_size = doc.size;
    draft.document_hash = doc.hash.clone();
    if draft.format == DocumentFormat::OctetStream {
        draft.format = DocumentFormat::sniff(&doc.head);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use printgate_core::types::{IpRange, JobOrigin};

    pub(crate) fn make_intake(
        dir: &std::path::Path,
        max_depth: usize,
        orphan_policy: OrphanPolicy,
    ) -> Intake {
        Intake::new(
            Arc::new(JobStore::open_in_memory().unwrap()),
            Arc::new(IdentityResolver::new()),
            Arc::new(Mutex::new(AuditLog::open_in_memory().unwrap())),
            Spool::new(dir.join("spool")),
            IntakeSettings {
                max_depth,
                max_attempts: 3,
                orphan_policy,
            },
        )
    }

    fn draft(addr: &str, owner: Option<AccountId>) -> PrintJob {
        PrintJob::new(
            JobOrigin::Raw,
            addr.parse().unwrap(),
            owner,
            DocumentFormat::OctetStream,
            "raw job".into(),
        )
    }

    async fn spooled(intake: &Intake, job: &PrintJob, data: &[u8]) -> SpooledDocument {
        let mut writer = intake.spool().create(&job.id).await.unwrap();
        writer.write(data).await.unwrap();
        writer.finish().await.unwrap()
    }

    #[tokio::test]
    async fn accepted_job_is_sniffed_and_pending() {
        let dir = tempfile::tempdir().unwrap();
        let intake = make_intake(dir.path(), 10, OrphanPolicy::Accept);
        let draft = draft("10.0.0.5", Some(AccountId::new("alice")));
        let doc = spooled(&intake, &draft, b"%PDF-1.4 body").await;

        let job = intake.accept(draft, doc).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.format, DocumentFormat::Pdf);
        assert_eq!(job.spool_size, 13);
        assert_eq!(intake.store().queue_depth().unwrap(), 1);
    }

    #[tokio::test]
    async fn capacity_rejection_removes_spool() {
        let dir = tempfile::tempdir().unwrap();
        let intake = make_intake(dir.path(), 1, OrphanPolicy::Accept);

        let first = draft("10.0.0.5", None);
        let doc = spooled(&intake, &first, b"one").await;
        intake.accept(first, doc).await.unwrap();
        assert!(matches!(intake.check_capacity(), Err(PrintgateError::Capacity { .. })));

        let second = draft("10.0.0.5", None);
        let doc = spooled(&intake, &second, b"two").await;
        let path = doc.path.clone();
        let err = intake.accept(second, doc).await.unwrap_err();
        assert!(matches!(err, PrintgateError::Capacity { depth: 1, limit: 1 }));
        assert!(!path.exists());
    }

    #[test]
    fn orphan_policy_controls_unmatched_addresses() {
        let dir = tempfile::tempdir().unwrap();
        let accept = make_intake(dir.path(), 10, OrphanPolicy::Accept);
        assert_eq!(accept.attribute_raw("10.9.9.9".parse().unwrap()).unwrap(), None);

        let reject = make_intake(dir.path(), 10, OrphanPolicy::Reject);
        assert!(matches!(
            reject.attribute_raw("10.9.9.9".parse().unwrap()),
            Err(PrintgateError::Attribution(_))
        ));

        reject
            .identity()
            .register_address(AccountId::new("alice"), IpRange::host("10.9.9.9".parse().unwrap()))
            .unwrap();
        assert_eq!(
            reject.attribute_raw("10.9.9.9".parse().unwrap()).unwrap(),
            Some(AccountId::new("alice"))
        );
    }

    #[tokio::test]
    async fn truncated_upload_is_failed_job_with_spool_kept() {
        let dir = tempfile::tempdir().unwrap();
        let intake = make_intake(dir.path(), 10, OrphanPolicy::Accept);
        let draft = draft("10.0.0.7", None);
        let doc = spooled(&intake, &draft, b"%!PS-Adobe half a doc").await;
        let path = doc.path.clone();

        let job = intake.record_truncated(draft, doc, "connection reset").await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error_message.as_deref().unwrap().starts_with("partial data"));
        assert!(path.exists());
        assert_eq!(intake.store().queue_depth().unwrap(), 0);
    }
}
