// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Job service: the read-and-cancel surface offered to the web/API layer.
//
// Every per-job call is scoped to the requesting account: a job owned by
// someone else is reported exactly like a job that does not exist.

use std::path::{Path, PathBuf};
use std::sync::{Arc, MutexGuard};

use tracing::{debug, instrument};

use printgate_core::error::{PrintgateError, Result};
use printgate_core::types::{AccountId, JobId, PrintJob};
use printgate_security::audit::{AuditAction, AuditEntry, AuditLog};

use crate::intake::Intake;
use crate::store::{CancelOutcome, JobFilter, JobStore};

pub struct JobService {
    intake: Arc<Intake>,
    artifact_dir: PathBuf,
}

impl JobService {
    pub fn new(intake: Arc<Intake>, artifact_dir: impl Into<PathBuf>) -> Self {
        Self {
            intake,
            artifact_dir: artifact_dir.into(),
        }
    }

    fn store(&self) -> &JobStore {
        self.intake.store()
    }

    /// All of an account's jobs, newest first.
    pub fn list_jobs(&self, owner: &AccountId) -> Result<Vec<PrintJob>> {
        self.store().list_for_owner(owner, JobFilter::All, None)
    }

    /// One job, if `owner` owns it.
    pub fn job(&self, owner: &AccountId, id: &JobId) -> Result<PrintJob> {
        match self.store().get_job(id)? {
            Some(job) if job.owner.as_ref() == Some(owner) => Ok(job),
            _ => Err(PrintgateError::JobNotFound(*id)),
        }
    }

    /// The first-page thumbnail, once the job has completed.
    pub async fn thumbnail(&self, owner: &AccountId, id: &JobId) -> Result<Option<Vec<u8>>> {
        let job = self.job(owner, id)?;
        self.read_artifact(job.thumbnail_ref.as_deref()).await
    }

    /// The normalised PDF, once the job has completed.
    pub async fn document(&self, owner: &AccountId, id: &JobId) -> Result<Option<Vec<u8>>> {
        let job = self.job(owner, id)?;
        self.read_artifact(job.document_ref.as_deref()).await
    }

    /// Cancel a job: immediate when pending, cooperative when processing.
    #[instrument(skip_all, fields(owner = %owner, job_id = %id))]
    pub fn cancel(&self, owner: &AccountId, id: &JobId) -> Result<CancelOutcome> {
        self.job(owner, id)?;
        let outcome = self.store().request_cancel(id)?;
        let success = !matches!(outcome, CancelOutcome::AlreadyTerminal(_));
        self.intake.audit(
            AuditAction::JobCancelled,
            owner.as_str(),
            success,
            Some(&format!("job {id}: {outcome:?}")),
        );
        Ok(outcome)
    }

    /// Unattributed jobs awaiting administrator review.
    pub fn list_orphaned(&self) -> Result<Vec<PrintJob>> {
        self.store().list_orphaned()
    }

    /// Audit trail recorded against an account (its cancellations), oldest first.
    pub fn account_activity(&self, owner: &AccountId) -> Result<Vec<AuditEntry>> {
        self.audit_log().entries_for_subject(owner.as_str())
    }

    /// The latest `limit` audit entries across all subjects, newest first.
    pub fn recent_activity(&self, limit: u32) -> Result<Vec<AuditEntry>> {
        self.audit_log().recent_entries(limit)
    }

    fn audit_log(&self) -> MutexGuard<'_, AuditLog> {
        match self.intake.audit_log().lock() {
            Ok(log) => log,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    async fn read_artifact(&self, reference: Option<&str>) -> Result<Option<Vec<u8>>> {
        let Some(reference) = reference else {
            return Ok(None);
        };
        let path = self.artifact_path(reference)?;
        debug!(path = %path.display(), "reading artifact");
        Ok(Some(tokio::fs::read(path).await?))
    }

    /// References are bare file names inside the artifact directory.
    fn artifact_path(&self, reference: &str) -> Result<PathBuf> {
        let name = Path::new(reference);
        if name.components().count() != 1 || name.file_name().is_none() {
            return Err(PrintgateError::Config(format!(
                "artifact reference {reference:?} escapes the artifact directory"
            )));
        }
        Ok(self.artifact_dir.join(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intake::tests::make_intake;
    use printgate_core::config::OrphanPolicy;
    use printgate_core::types::{DocumentFormat, JobOrigin, JobStatus};

    struct Fixture {
        dir: tempfile::TempDir,
        service: JobService,
        intake: Arc<Intake>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let intake = Arc::new(make_intake(dir.path(), 10, OrphanPolicy::Accept));
        let artifacts = dir.path().join("artifacts");
        std::fs::create_dir_all(&artifacts).unwrap();
        Fixture {
            service: JobService::new(Arc::clone(&intake), artifacts),
            intake,
            dir,
        }
    }

    fn add_job(f: &Fixture, owner: Option<&str>) -> PrintJob {
        let job = PrintJob::new(
            JobOrigin::Ipp,
            "192.0.2.10".parse().unwrap(),
            owner.map(AccountId::new),
            DocumentFormat::Pdf,
            "letter.pdf".into(),
        );
        f.intake.store().create_job(&job, 10).unwrap()
    }

    fn audit_count(f: &Fixture) -> u64 {
        f.service.audit_log().count().unwrap()
    }

    #[test]
    fn jobs_are_scoped_to_their_owner() {
        let f = fixture();
        let alice = AccountId::new("alice");
        let bob = AccountId::new("bob");
        let job = add_job(&f, Some("alice"));
        add_job(&f, Some("bob"));

        assert_eq!(f.service.list_jobs(&alice).unwrap().len(), 1);
        assert_eq!(f.service.job(&alice, &job.id).unwrap().id, job.id);
        assert!(matches!(
            f.service.job(&bob, &job.id),
            Err(PrintgateError::JobNotFound(_))
        ));
        assert!(matches!(
            f.service.job(&alice, &JobId::new()),
            Err(PrintgateError::JobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn artifacts_appear_after_completion() {
        let f = fixture();
        let alice = AccountId::new("alice");
        let job = add_job(&f, Some("alice"));
        assert_eq!(f.service.thumbnail(&alice, &job.id).await.unwrap(), None);
        assert_eq!(f.service.document(&alice, &job.id).await.unwrap(), None);

        let artifacts = f.dir.path().join("artifacts");
        std::fs::write(artifacts.join(format!("{}.pdf", job.id)), b"%PDF-1.7").unwrap();
        std::fs::write(artifacts.join(format!("{}.png", job.id)), b"\x89PNG").unwrap();
        let store = f.intake.store();
        store.claim(&job.id).unwrap();
        store
            .complete(&job.id, &format!("{}.pdf", job.id), &format!("{}.png", job.id))
            .unwrap();

        assert_eq!(
            f.service.document(&alice, &job.id).await.unwrap().as_deref(),
            Some(&b"%PDF-1.7"[..])
        );
        assert_eq!(
            f.service.thumbnail(&alice, &job.id).await.unwrap().as_deref(),
            Some(&b"\x89PNG"[..])
        );
        assert!(f.service.document(&AccountId::new("bob"), &job.id).await.is_err());
    }

    #[test]
    fn cancel_is_owner_only_and_audited() {
        let f = fixture();
        let alice = AccountId::new("alice");
        let job = add_job(&f, Some("alice"));
        let before = audit_count(&f);

        assert!(f.service.cancel(&AccountId::new("mallory"), &job.id).is_err());
        assert_eq!(f.service.job(&alice, &job.id).unwrap().status, JobStatus::Pending);

        assert_eq!(f.service.cancel(&alice, &job.id).unwrap(), CancelOutcome::Cancelled);
        assert_eq!(
            f.service.cancel(&alice, &job.id).unwrap(),
            CancelOutcome::AlreadyTerminal(JobStatus::Cancelled)
        );
        assert_eq!(audit_count(&f), before + 2);
    }

    #[test]
    fn cancellations_show_in_account_activity() {
        let f = fixture();
        let alice = AccountId::new("alice");
        let job = add_job(&f, Some("alice"));
        add_job(&f, Some("bob"));
        f.service.cancel(&alice, &job.id).unwrap();
        f.service.cancel(&alice, &job.id).unwrap();

        let activity = f.service.account_activity(&alice).unwrap();
        assert_eq!(activity.len(), 2);
        assert!(activity.iter().all(|e| e.action == "job_cancelled"));
        assert!(activity[0].success);
        assert!(!activity[1].success);
        assert!(activity[0].details.as_deref().unwrap().contains(&job.id.to_string()));
        assert!(f.service.account_activity(&AccountId::new("bob")).unwrap().is_empty());

        let recent = f.service.recent_activity(1).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id, activity[1].id);
        assert!(f.service.recent_activity(100).unwrap().len() >= 2);
    }

    #[test]
    fn processing_job_cancel_is_cooperative() {
        let f = fixture();
        let alice = AccountId::new("alice");
        let job = add_job(&f, Some("alice"));
        f.intake.store().claim(&job.id).unwrap();

        assert_eq!(
            f.service.cancel(&alice, &job.id).unwrap(),
            CancelOutcome::CancelRequested
        );
        let job = f.service.job(&alice, &job.id).unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert!(job.cancel_requested);
    }

    #[test]
    fn orphans_are_listed_for_review() {
        let f = fixture();
        add_job(&f, Some("alice"));
        let orphan = add_job(&f, None);

        let orphans = f.service.list_orphaned().unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].id, orphan.id);
    }

    #[test]
    fn artifact_references_cannot_escape() {
        let f = fixture();
        assert!(f.service.artifact_path("../jobs.db").is_err());
        assert!(f.service.artifact_path("/etc/passwd").is_err());
        assert!(f.service.artifact_path("abc.pdf").is_ok());
    }
}
