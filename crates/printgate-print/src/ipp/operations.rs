// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// IPP operation handler.
//
// Turns one HTTP exchange into one IPP response.  The attribute section is
// read incrementally (bounded by `max_attribute_bytes`); for Print-Job the
// remainder of the body is streamed into the spool.  Every failure, bad
// framing included, is answered with a well-formed IPP message so the client
// session stays usable.
//
// Supported operations:
//   - Print-Job (0x0002)
//   - Validate-Job (0x0004)
//   - Cancel-Job (0x0008)
//   - Get-Job-Attributes (0x0009)
//   - Get-Jobs (0x000A)
//   - Get-Printer-Attributes (0x000B)
//
// Authentication is HTTP Basic with an IPP token secret as the password.
// Get-Printer-Attributes may be answered anonymously; everything else needs
// a valid token.  Jobs are visible only to the account that owns them.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use printgate_core::config::IppListenerConfig;
use printgate_core::error::PrintgateError;
use printgate_core::types::{AccountId, DocumentFormat, JobOrigin, JobStatus, PrintJob};
use printgate_security::audit::AuditAction;

use super::codec::*;
use super::http::{DocumentBody, HttpResponse, RequestHead};
use crate::identity::TokenRejection;
use crate::intake::Intake;
use crate::store::{CancelOutcome, JobFilter};

/// Body read size while looking for the end of the attribute section.
const ATTRIBUTE_CHUNK: usize = 8 * 1024;

/// Body read size while spooling document data.
const DOCUMENT_CHUNK: usize = 64 * 1024;

/// Operations answered by this printer, in `operations-supported` order.
const SUPPORTED_OPERATIONS: [u16; 6] = [
    OP_PRINT_JOB,
    OP_VALIDATE_JOB,
    OP_CANCEL_JOB,
    OP_GET_JOB_ATTRIBUTES,
    OP_GET_JOBS,
    OP_GET_PRINTER_ATTRIBUTES,
];

/// What the handler needs to know about the exchange besides the body.
pub struct RequestContext<'a> {
    pub head: &'a RequestHead,
    pub peer: SocketAddr,
    pub local: SocketAddr,
}

impl RequestContext<'_> {
    /// `host:port` as the client addressed us.
    fn authority(&self) -> String {
        match self.head.host.as_deref().map(str::trim).filter(|h| !h.is_empty()) {
            Some(host) if has_port(host) => host.to_string(),
            Some(host) => format!("{host}:{}", self.local.port()),
            None => self.local.to_string(),
        }
    }

    fn printer_uri(&self) -> String {
        format!("ipp://{}/ipp/print", self.authority())
    }

    fn job_uri(&self, number: i64) -> String {
        format!("{}/jobs/{number}", self.printer_uri())
    }
}

fn has_port(host: &str) -> bool {
    match host.rsplit_once(':') {
        Some((name, port)) => {
            !port.is_empty()
                && port.bytes().all(|b| b.is_ascii_digit())
                && (!name.contains(':') || name.ends_with(']'))
        }
        None => false,
    }
}

/// Who is asking.
enum Requester {
    Anonymous,
    Account(AccountId),
    Rejected(TokenRejection),
}

/// An attribute section that could not be read.
struct AttributeFailure {
    status: u16,
    request_id: u32,
    message: String,
}

/// Handles IPP operations against the shared intake.
pub struct IppHandler {
    intake: Arc<Intake>,
    config: IppListenerConfig,
    started: Instant,
}

impl IppHandler {
    pub fn new(intake: Arc<Intake>, config: IppListenerConfig) -> Self {
        Self {
            intake,
            config,
            started: Instant::now(),
        }
    }

    /// Answer one request.  Never fails: errors become IPP status codes.
    pub async fn handle<B>(&self, ctx: &RequestContext<'_>, body: &mut B) -> HttpResponse
    where
        B: DocumentBody + Send,
    {
        let request = match read_attribute_section(body, self.config.max_attribute_bytes).await {
            Ok(request) => request,
            Err(failure) => {
                warn!(peer = %ctx.peer, error = %failure.message, "unreadable IPP request");
                return HttpResponse::ipp(build_error_response(
                    failure.status,
                    failure.request_id,
                    &failure.message,
                ));
            }
        };
        let rid = request.request_id;

        debug!(
            peer = %ctx.peer,
            version = %format!("{}.{}", request.version_major, request.version_minor),
            operation = %format!("0x{:04X}", request.operation_id),
            request_id = rid,
            groups = request.attribute_groups.len(),
            "parsed IPP request"
        );

        if !matches!(request.version_major, 1 | 2) {
            return HttpResponse::ipp(build_error_response(
                STATUS_SERVER_ERROR_VERSION_NOT_SUPPORTED,
                rid,
                &format!(
                    "IPP version {}.{} is not supported",
                    request.version_major, request.version_minor
                ),
            ));
        }
        if let Err(message) = check_operation_attributes(&request) {
            return HttpResponse::ipp(build_error_response(
                STATUS_CLIENT_ERROR_BAD_REQUEST,
                rid,
                message,
            ));
        }
        if !SUPPORTED_OPERATIONS.contains(&request.operation_id) {
            warn!(
                operation = %format!("0x{:04X}", request.operation_id),
                "unsupported IPP operation"
            );
            return HttpResponse::ipp(build_error_response(
                STATUS_SERVER_ERROR_OPERATION_NOT_SUPPORTED,
                rid,
                &format!("Operation 0x{:04X} is not supported", request.operation_id),
            ));
        }

        let account = match self.authenticate(ctx) {
            Requester::Account(account) => Some(account),
            Requester::Anonymous => None,
            Requester::Rejected(reason) => {
                self.intake.audit(
                    AuditAction::AuthFailed,
                    &ctx.peer.ip().to_string(),
                    false,
                    Some(reason.as_str()),
                );
                warn!(peer = %ctx.peer, reason = reason.as_str(), "IPP authentication failed");
                return HttpResponse::unauthorized(build_error_response(
                    STATUS_CLIENT_ERROR_NOT_AUTHENTICATED,
                    rid,
                    reason.as_str(),
                ));
            }
        };

        let Some(account) = account else {
            if request.operation_id == OP_GET_PRINTER_ATTRIBUTES
                && self.config.allow_anonymous_printer_attributes
            {
                return HttpResponse::ipp(self.get_printer_attributes(ctx, &request));
            }
            debug!(peer = %ctx.peer, "credentials required, sending challenge");
            return HttpResponse::unauthorized(build_error_response(
                STATUS_CLIENT_ERROR_NOT_AUTHENTICATED,
                rid,
                "authentication required",
            ));
        };

        let reply = match request.operation_id {
            OP_PRINT_JOB => self.print_job(ctx, &request, &account, body).await,
            OP_VALIDATE_JOB => validate_job(&request),
            OP_CANCEL_JOB => self.cancel_job(&request, &account),
            OP_GET_JOB_ATTRIBUTES => self.get_job_attributes(ctx, &request, &account),
            OP_GET_JOBS => self.get_jobs(ctx, &request, &account),
            _ => self.get_printer_attributes(ctx, &request),
        };
        HttpResponse::ipp(reply)
    }

    fn authenticate(&self, ctx: &RequestContext<'_>) -> Requester {
        match &ctx.head.authorization {
            None => Requester::Anonymous,
            // Present but not Basic, or not decodable.
            Some(None) => Requester::Rejected(TokenRejection::Unknown),
            Some(Some(creds)) => match self
                .intake
                .identity()
                .authenticate(Some(&creds.username), &creds.password)
            {
                Ok(account) => Requester::Account(account),
                Err(reason) => Requester::Rejected(reason),
            },
        }
    }

    // -----------------------------------------------------------------------
    // Operation handlers
    // -----------------------------------------------------------------------

    /// Print-Job: spool the document and create a pending job.
    async fn print_job<B>(
        &self,
        ctx: &RequestContext<'_>,
        request: &IppRequest,
        account: &AccountId,
        body: &mut B,
    ) -> Vec<u8>
    where
        B: DocumentBody + Send,
    {
        let rid = request.request_id;
        let format = match requested_format(request) {
            Ok(format) => format,
            Err(reply) => return reply,
        };
        if let Err(e) = self.intake.check_capacity() {
            if matches!(e, PrintgateError::Capacity { .. }) {
                self.intake.audit(
                    AuditAction::SubmissionRejected,
                    &ctx.peer.ip().to_string(),
                    false,
                    Some(&e.to_string()),
                );
            }
            return submission_error(rid, &e);
        }

        let op_attrs = request.operation_attributes();
        let document_name = op_attrs
            .and_then(|g| g.get_string("job-name"))
            .or_else(|| op_attrs.and_then(|g| g.get_string("document-name")))
            .unwrap_or_else(|| "Untitled Document".into());

        let draft = PrintJob::new(
            JobOrigin::Ipp,
            ctx.peer.ip(),
            Some(account.clone()),
            format,
            document_name,
        );

        let mut writer = match self.intake.spool().create(&draft.id).await {
            Ok(writer) => writer,
            Err(e) => {
                error!(error = %e, "Print-Job: could not open spool file");
                return build_error_response(STATUS_SERVER_ERROR_INTERNAL, rid, "spool unavailable");
            }
        };

        let mut chunk = vec![0u8; DOCUMENT_CHUNK];
        loop {
            let n = match body.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    writer.abort().await;
                    warn!(peer = %ctx.peer, error = %e, "Print-Job: document data cut off");
                    return build_error_response(
                        STATUS_CLIENT_ERROR_BAD_REQUEST,
                        rid,
                        &format!("document data incomplete: {e}"),
                    );
                }
            };
            if let Err(e) = writer.write(&chunk[..n]).await {
                writer.abort().await;
                error!(error = %e, "Print-Job: spool write failed");
                return build_error_response(STATUS_SERVER_ERROR_INTERNAL, rid, "spool write failed");
            }
        }

        if writer.size() == 0 {
            writer.abort().await;
            return build_error_response(
                STATUS_CLIENT_ERROR_BAD_REQUEST,
                rid,
                "Print-Job carries no document data",
            );
        }

        let doc = match writer.finish().await {
            Ok(doc) => doc,
            Err(e) => {
                error!(error = %e, "Print-Job: spool flush failed");
                return build_error_response(STATUS_SERVER_ERROR_INTERNAL, rid, "spool write failed");
            }
        };

        match self.intake.accept(draft, doc).await {
            Ok(job) => {
                info!(
                    job_id = %job.id,
                    number = job.number,
                    account = %account,
                    bytes = job.spool_size,
                    "Print-Job accepted"
                );
                let mut resp = IppResponseBuilder::with_operation_attributes(STATUS_OK, rid, "successful-ok");
                resp.begin_group(TAG_JOB_ATTRIBUTES);
                write_job_summary(&mut resp, ctx, &job);
                resp.build()
            }
            Err(e) => submission_error(rid, &e),
        }
    }

    /// Cancel-Job: immediate for pending jobs, cooperative for processing.
    fn cancel_job(&self, request: &IppRequest, account: &AccountId) -> Vec<u8> {
        let rid = request.request_id;
        let job = match self.locate_job(request, account) {
            Ok(job) => job,
            Err(reply) => return reply,
        };

        match self.intake.store().request_cancel(&job.id) {
            Ok(outcome @ (CancelOutcome::Cancelled | CancelOutcome::CancelRequested)) => {
                self.intake.audit(
                    AuditAction::JobCancelled,
                    account.as_str(),
                    true,
                    Some(&format!("job {} via IPP ({outcome:?})", job.id)),
                );
                info!(job_id = %job.id, number = job.number, ?outcome, "Cancel-Job");
                build_error_response(STATUS_OK, rid, "successful-ok")
            }
            Ok(CancelOutcome::AlreadyTerminal(status)) => build_error_response(
                STATUS_CLIENT_ERROR_NOT_POSSIBLE,
                rid,
                &format!("job {} is already {status}", job.number),
            ),
            Err(PrintgateError::JobNotFound(_)) => build_error_response(
                STATUS_CLIENT_ERROR_NOT_FOUND,
                rid,
                &format!("job {} not found", job.number),
            ),
            Err(e) => internal_error(rid, "Cancel-Job", &e),
        }
    }

    fn get_job_attributes(
        &self,
        ctx: &RequestContext<'_>,
        request: &IppRequest,
        account: &AccountId,
    ) -> Vec<u8> {
        let job = match self.locate_job(request, account) {
            Ok(job) => job,
            Err(reply) => return reply,
        };

        let mut resp =
            IppResponseBuilder::with_operation_attributes(STATUS_OK, request.request_id, "successful-ok");
        resp.begin_group(TAG_JOB_ATTRIBUTES);
        write_job_summary(&mut resp, ctx, &job);
        resp.uri("job-printer-uri", &ctx.printer_uri())
            .text(
                "job-state-message",
                job.error_message.as_deref().unwrap_or(job.status.as_str()),
            )
            .mime_type("document-format", job.format.mime_type())
            .integer("job-k-octets", clamp_i32(job.spool_size.div_ceil(1024)))
            .integer("job-printer-up-time", self.up_time())
            .integer("time-at-creation", clamp_i32(job.created_at.timestamp()));
        match job.completed_at {
            Some(at) => resp.integer("time-at-completed", clamp_i32(at.timestamp())),
            None => resp.no_value("time-at-completed"),
        };
        resp.build()
    }

    fn get_jobs(&self, ctx: &RequestContext<'_>, request: &IppRequest, account: &AccountId) -> Vec<u8> {
        let rid = request.request_id;
        let op_attrs = request.operation_attributes();

        let filter = match op_attrs.and_then(|g| g.get_string("which-jobs")).as_deref() {
            None | Some("not-completed") => JobFilter::NotCompleted,
            Some("completed") => JobFilter::Completed,
            Some("all") => JobFilter::All,
            Some(other) => {
                return build_error_response(
                    STATUS_CLIENT_ERROR_ATTRIBUTES_OR_VALUES_NOT_SUPPORTED,
                    rid,
                    &format!("which-jobs {other:?} is not supported"),
                );
            }
        };
        let limit = match op_attrs.and_then(|g| g.get_integer("limit")) {
            None => None,
            Some(n) if n > 0 => Some(n as usize),
            Some(_) => {
                return build_error_response(
                    STATUS_CLIENT_ERROR_BAD_REQUEST,
                    rid,
                    "limit must be positive",
                );
            }
        };

        let jobs = match self.intake.store().list_for_owner(account, filter, limit) {
            Ok(jobs) => jobs,
            Err(e) => return internal_error(rid, "Get-Jobs", &e),
        };

        let mut resp = IppResponseBuilder::with_operation_attributes(STATUS_OK, rid, "successful-ok");
        for job in &jobs {
            resp.begin_group(TAG_JOB_ATTRIBUTES);
            write_job_summary(&mut resp, ctx, job);
        }
        debug!(account = %account, count = jobs.len(), ?filter, "Get-Jobs");
        resp.build()
    }

    fn get_printer_attributes(&self, ctx: &RequestContext<'_>, request: &IppRequest) -> Vec<u8> {
        let rid = request.request_id;
        let depth = match self.intake.store().queue_depth() {
            Ok(depth) => depth,
            Err(e) => return internal_error(rid, "Get-Printer-Attributes", &e),
        };
        let accepting = self.intake.check_capacity().is_ok();

        let mut resp = IppResponseBuilder::with_operation_attributes(STATUS_OK, rid, "successful-ok");
        resp.begin_group(TAG_PRINTER_ATTRIBUTES)
            // Identification
            .uri("printer-uri-supported", &ctx.printer_uri())
            .keyword("uri-security-supported", "none")
            .keyword("uri-authentication-supported", "basic")
            .name_attr("printer-name", &self.config.printer_name)
            .text("printer-info", "Printgate network printer")
            .text("printer-make-and-model", "Printgate Virtual Printer")
            // State
            .enum_attr(
                "printer-state",
                if depth == 0 {
                    PRINTER_STATE_IDLE
                } else {
                    PRINTER_STATE_PROCESSING
                },
            )
            .keyword("printer-state-reasons", "none")
            .boolean("printer-is-accepting-jobs", accepting)
            .integer("queued-job-count", clamp_i32(depth))
            .integer("printer-up-time", self.up_time())
            // Protocol
            .keyword("ipp-versions-supported", "1.1")
            .keyword_additional("2.0");

        resp.enum_attr("operations-supported", i32::from(SUPPORTED_OPERATIONS[0]));
        for op in &SUPPORTED_OPERATIONS[1..] {
            resp.enum_additional(i32::from(*op));
        }

        resp.mime_type("document-format-default", DocumentFormat::OctetStream.mime_type())
            .mime_type(
                "document-format-supported",
                DocumentFormat::SUPPORTED[0].mime_type(),
            );
        for format in &DocumentFormat::SUPPORTED[1..] {
            resp.mime_type_additional(format.mime_type());
        }

        resp
            // Charset/language
            .charset("charset-configured", "utf-8")
            .charset("charset-supported", "utf-8")
            .natural_language("natural-language-configured", "en")
            .natural_language("generated-natural-language-supported", "en")
            // Jobs
            .keyword("which-jobs-supported", "completed")
            .keyword_additional("not-completed")
            .keyword_additional("all")
            .boolean("multiple-document-jobs-supported", false)
            .keyword("compression-supported", "none")
            .keyword("pdl-override-supported", "not-attempted");

        debug!(depth, accepting, "Get-Printer-Attributes");
        resp.build()
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    /// Resolve `job-id` / `job-uri` to one of `account`'s jobs.  Other
    /// accounts' jobs are reported as not found.
    fn locate_job(&self, request: &IppRequest, account: &AccountId) -> Result<PrintJob, Vec<u8>> {
        let rid = request.request_id;
        let op_attrs = request.operation_attributes();
        let number = op_attrs
            .and_then(|g| g.get_integer("job-id"))
            .map(i64::from)
            .or_else(|| {
                op_attrs
                    .and_then(|g| g.get_string("job-uri"))
                    .and_then(|uri| job_number_from_uri(&uri))
            });
        let Some(number) = number else {
            return Err(build_error_response(
                STATUS_CLIENT_ERROR_BAD_REQUEST,
                rid,
                "job-id or job-uri is required",
            ));
        };

        match self.intake.store().get_by_number(number) {
            Ok(Some(job)) if job.owner.as_ref() == Some(account) => Ok(job),
            Ok(_) => Err(build_error_response(
                STATUS_CLIENT_ERROR_NOT_FOUND,
                rid,
                &format!("job {number} not found"),
            )),
            Err(e) => Err(internal_error(rid, "job lookup", &e)),
        }
    }

    fn up_time(&self) -> i32 {
        clamp_i32(self.started.elapsed().as_secs().max(1))
    }
}

/// Read until the end-of-attributes tag, pushing any document bytes that
/// came along back into the body.
async fn read_attribute_section<B>(body: &mut B, max_bytes: usize) -> Result<IppRequest, AttributeFailure>
where
    B: DocumentBody + Send,
{
    let mut buf = Vec::with_capacity(ATTRIBUTE_CHUNK);
    let mut chunk = vec![0u8; ATTRIBUTE_CHUNK];

    loop {
        let n = body.read(&mut chunk).await.map_err(|e| AttributeFailure {
            status: STATUS_CLIENT_ERROR_BAD_REQUEST,
            request_id: request_id_of(&buf),
            message: format!("request body unreadable: {e}"),
        })?;
        buf.extend_from_slice(&chunk[..n]);

        let too_large = || AttributeFailure {
            status: STATUS_CLIENT_ERROR_REQUEST_ENTITY_TOO_LARGE,
            request_id: request_id_of(&buf),
            message: format!("attribute section exceeds {max_bytes} bytes"),
        };

        match parse_ipp_request(&buf) {
            Ok(request) => {
                if request.body_offset > max_bytes {
                    return Err(too_large());
                }
                let document = buf.split_off(request.body_offset);
                if !document.is_empty() {
                    body.unread(document);
                }
                return Ok(request);
            }
            Err(CodecError::Incomplete) if n == 0 => {
                let message = if buf.is_empty() {
                    "empty request".to_string()
                } else {
                    "request ends inside the attribute section".to_string()
                };
                return Err(AttributeFailure {
                    status: STATUS_CLIENT_ERROR_BAD_REQUEST,
                    request_id: request_id_of(&buf),
                    message,
                });
            }
            Err(CodecError::Incomplete) if buf.len() > max_bytes => return Err(too_large()),
            Err(CodecError::Incomplete) => continue,
            Err(CodecError::Malformed(message)) => {
                return Err(AttributeFailure {
                    status: STATUS_CLIENT_ERROR_BAD_REQUEST,
                    request_id: request_id_of(&buf),
                    message: format!("Malformed IPP request: {message}"),
                });
            }
        }
    }
}

fn request_id_of(buf: &[u8]) -> u32 {
    buf.get(4..8)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .unwrap_or(0)
}

/// Every request starts with charset then natural language (RFC 8011 SS4.1.4).
fn check_operation_attributes(request: &IppRequest) -> std::result::Result<(), &'static str> {
    let Some(group) = request.operation_attributes() else {
        return Err("missing operation attributes");
    };
    let mut names = group.attributes.iter().map(|a| a.name.as_str());
    if names.next() != Some("attributes-charset")
        || names.next() != Some("attributes-natural-language")
    {
        return Err("attributes-charset and attributes-natural-language must come first");
    }
    Ok(())
}

/// `document-format`, defaulting to octet-stream (sniffed at intake).
fn requested_format(request: &IppRequest) -> std::result::Result<DocumentFormat, Vec<u8>> {
    let mime = request
        .operation_attributes()
        .and_then(|g| g.get_string("document-format"))
        .unwrap_or_else(|| DocumentFormat::OctetStream.mime_type().to_string());
    DocumentFormat::from_mime(&mime).ok_or_else(|| {
        let mut resp = IppResponseBuilder::with_operation_attributes(
            STATUS_CLIENT_ERROR_DOCUMENT_FORMAT_NOT_SUPPORTED,
            request.request_id,
            &format!("document-format {mime:?} is not supported"),
        );
        resp.begin_group(TAG_UNSUPPORTED_ATTRIBUTES)
            .mime_type("document-format", &mime);
        resp.build()
    })
}

/// Validate-Job: check the format without accepting data.
fn validate_job(request: &IppRequest) -> Vec<u8> {
    match requested_format(request) {
        Ok(format) => {
            debug!(format = format.mime_type(), "Validate-Job: successful-ok");
            build_error_response(STATUS_OK, request.request_id, "successful-ok")
        }
        Err(reply) => reply,
    }
}

fn write_job_summary(resp: &mut IppResponseBuilder, ctx: &RequestContext<'_>, job: &PrintJob) {
    resp.integer("job-id", clamp_i32(job.number))
        .uri("job-uri", &ctx.job_uri(job.number))
        .name_attr("job-name", &job.document_name)
        .enum_attr("job-state", job_status_to_ipp_state(job.status))
        .keyword("job-state-reasons", job_state_reason(job));
    if let Some(owner) = &job.owner {
        resp.name_attr("job-originating-user-name", owner.as_str());
    }
}

fn submission_error(rid: u32, err: &PrintgateError) -> Vec<u8> {
    match err {
        PrintgateError::Capacity { .. } => {
            warn!(error = %err, "Print-Job refused");
            build_error_response(STATUS_SERVER_ERROR_BUSY, rid, &err.to_string())
        }
        _ => internal_error(rid, "Print-Job", err),
    }
}

fn internal_error(rid: u32, operation: &str, err: &PrintgateError) -> Vec<u8> {
    error!(operation, error = %err, "IPP operation failed");
    build_error_response(STATUS_SERVER_ERROR_INTERNAL, rid, "internal server error")
}

fn job_number_from_uri(uri: &str) -> Option<i64> {
    uri.trim_end_matches('/').rsplit('/').next()?.parse().ok()
}

fn clamp_i32<T: TryInto<i32>>(value: T) -> i32 {
    value.try_into().unwrap_or(i32::MAX)
}

/// Map internal `JobStatus` to an IPP job-state integer.
fn job_status_to_ipp_state(status: JobStatus) -> i32 {
    match status {
        JobStatus::Pending => JOB_STATE_PENDING,
        JobStatus::Processing => JOB_STATE_PROCESSING,
        JobStatus::Completed => JOB_STATE_COMPLETED,
        JobStatus::Cancelled => JOB_STATE_CANCELED,
        JobStatus::Failed => JOB_STATE_ABORTED,
    }
}

/// Map a job to an IPP job-state-reasons keyword.
fn job_state_reason(job: &PrintJob) -> &'static str {
    match job.status {
        JobStatus::Pending => "none",
        JobStatus::Processing if job.cancel_requested => "processing-to-stop-point",
        JobStatus::Processing => "job-printing",
        JobStatus::Completed => "job-completed-successfully",
        JobStatus::Cancelled => "job-canceled-by-user",
        JobStatus::Failed => "aborted-by-system",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intake::tests::make_intake;
    use crate::ipp::codec::tests::{build_test_ipp_request, write_test_attr};
    use crate::ipp::http::BasicCredentials;
    use crate::ipp::http::tests::SliceBody;
    use printgate_core::config::OrphanPolicy;

    struct Fixture {
        _dir: tempfile::TempDir,
        intake: Arc<Intake>,
        handler: IppHandler,
        alice: String,
        bob: String,
    }

    fn fixture(max_depth: usize) -> Fixture {
        fixture_with(max_depth, IppListenerConfig::default())
    }

    fn fixture_with(max_depth: usize, config: IppListenerConfig) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let intake = Arc::new(make_intake(dir.path(), max_depth, OrphanPolicy::Accept));
        let (_, alice) = intake.identity().issue_token(AccountId::new("alice")).unwrap();
        let (_, bob) = intake.identity().issue_token(AccountId::new("bob")).unwrap();
        let handler = IppHandler::new(Arc::clone(&intake), config);
        Fixture {
            _dir: dir,
            intake,
            handler,
            alice,
            bob,
        }
    }

    fn head(creds: Option<(&str, &str)>) -> RequestHead {
        RequestHead {
            method: "POST".into(),
            path: "/ipp/print".into(),
            keep_alive: true,
            authorization: creds.map(|(user, pass)| {
                Some(BasicCredentials {
                    username: user.into(),
                    password: pass.into(),
                })
            }),
            host: Some("printer.local:631".into()),
            ..Default::default()
        }
    }

    /// Run one exchange and parse the IPP reply.
    async fn call(f: &Fixture, creds: Option<(&str, &str)>, data: &[u8]) -> (u16, IppRequest) {
        let head = head(creds);
        let ctx = RequestContext {
            head: &head,
            peer: "10.0.0.9:50000".parse().unwrap(),
            local: "127.0.0.1:631".parse().unwrap(),
        };
        let mut body = SliceBody::new(data, 1000);
        let resp = f.handler.handle(&ctx, &mut body).await;
        let parsed = parse_ipp_request(&resp.body).expect("reply is well-formed IPP");
        (resp.status, parsed)
    }

    fn print_request(rid: u32, format: &[u8], doc: &[u8]) -> Vec<u8> {
        build_test_ipp_request(
            OP_PRINT_JOB,
            rid,
            &[
                (VALUE_TAG_NAME, "job-name", &b"report.pdf"[..]),
                (VALUE_TAG_MIME_MEDIA_TYPE, "document-format", format),
            ],
            doc,
        )
    }

    fn job_request(op: u16, rid: u32, number: i32) -> Vec<u8> {
        build_test_ipp_request(op, rid, &[(VALUE_TAG_INTEGER, "job-id", &number.to_be_bytes()[..])], &[])
    }

    async fn submit(f: &Fixture, secret: &str, doc: &[u8]) -> i32 {
        let (_, resp) = call(f, Some(("", secret)), &print_request(1, b"application/pdf", doc)).await;
        assert_eq!(resp.operation_id, STATUS_OK);
        resp.job_attributes().unwrap().get_integer("job-id").unwrap()
    }

    fn job_groups(resp: &IppRequest) -> usize {
        resp.attribute_groups
            .iter()
            .filter(|g| g.delimiter == TAG_JOB_ATTRIBUTES)
            .count()
    }

    #[tokio::test]
    async fn print_job_then_get_job_attributes_reports_pending() {
        let f = fixture(10);
        let doc = b"%PDF-1.7 tiny document";
        let (status, resp) = call(&f, Some(("alice", f.alice.as_str())), &print_request(77, b"application/pdf", doc)).await;

        assert_eq!(status, 200);
        assert_eq!(resp.operation_id, STATUS_OK);
        assert_eq!(resp.request_id, 77);
        let job = resp.job_attributes().unwrap();
        let number = job.get_integer("job-id").unwrap();
        assert_eq!(job.get_integer("job-state"), Some(JOB_STATE_PENDING));
        assert_eq!(
            job.get_string("job-uri"),
            Some(format!("ipp://printer.local:631/ipp/print/jobs/{number}"))
        );

        let stored = f.intake.store().get_by_number(i64::from(number)).unwrap().unwrap();
        assert_eq!(stored.owner, Some(AccountId::new("alice")));
        assert_eq!(stored.origin, JobOrigin::Ipp);
        assert_eq!(stored.document_name, "report.pdf");
        assert_eq!(std::fs::read(&stored.spool_path).unwrap(), doc);

        let (_, resp) = call(&f, Some(("alice", f.alice.as_str())), &job_request(OP_GET_JOB_ATTRIBUTES, 78, number)).await;
        assert_eq!(resp.operation_id, STATUS_OK);
        let job = resp.job_attributes().unwrap();
        assert_eq!(job.get_integer("job-state"), Some(JOB_STATE_PENDING));
        assert_eq!(job.get_string("document-format").as_deref(), Some("application/pdf"));
        assert_eq!(job.get_string("job-originating-user-name").as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn document_split_across_small_reads_is_intact() {
        let f = fixture(10);
        let doc: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let head = head(Some(("alice", f.alice.as_str())));
        let ctx = RequestContext {
            head: &head,
            peer: "10.0.0.9:50000".parse().unwrap(),
            local: "127.0.0.1:631".parse().unwrap(),
        };
        let mut body = SliceBody::new(&print_request(5, b"application/octet-stream", &doc), 3);
        let resp = f.handler.handle(&ctx, &mut body).await;
        let parsed = parse_ipp_request(&resp.body).unwrap();
        assert_eq!(parsed.operation_id, STATUS_OK);

        let number = parsed.job_attributes().unwrap().get_integer("job-id").unwrap();
        let stored = f.intake.store().get_by_number(i64::from(number)).unwrap().unwrap();
        assert_eq!(std::fs::read(&stored.spool_path).unwrap(), doc);
        assert_eq!(stored.spool_size, 5000);
    }

    #[tokio::test]
    async fn missing_credentials_get_a_challenge() {
        let f = fixture(10);
        let (status, resp) = call(&f, None, &print_request(3, b"application/pdf", b"%PDF")).await;
        assert_eq!(status, 401);
        assert_eq!(resp.operation_id, STATUS_CLIENT_ERROR_NOT_AUTHENTICATED);
        assert_eq!(resp.request_id, 3);
        assert_eq!(f.intake.store().queue_depth().unwrap(), 0);
    }

    #[tokio::test]
    async fn revoked_token_is_not_authenticated() {
        let f = fixture(10);
        let (token, secret) = f.intake.identity().issue_token(AccountId::new("carol")).unwrap();
        submit(&f, &secret, b"%PDF before revocation").await;

        f.intake.identity().revoke_token(token.id).unwrap();
        let (status, resp) = call(&f, Some(("carol", secret.as_str())), &print_request(4, b"application/pdf", b"%PDF")).await;
        assert_eq!(status, 401);
        assert_eq!(resp.operation_id, STATUS_CLIENT_ERROR_NOT_AUTHENTICATED);

        // The job accepted before revocation is untouched.
        assert_eq!(f.intake.store().queue_depth().unwrap(), 1);
    }

    #[tokio::test]
    async fn wrong_username_for_token_is_rejected() {
        let f = fixture(10);
        let (status, resp) = call(&f, Some(("bob", f.alice.as_str())), &print_request(4, b"application/pdf", b"%PDF")).await;
        assert_eq!(status, 401);
        assert_eq!(resp.operation_id, STATUS_CLIENT_ERROR_NOT_AUTHENTICATED);
    }

    #[tokio::test]
    async fn anonymous_printer_attributes() {
        let f = fixture(10);
        let data = build_test_ipp_request(OP_GET_PRINTER_ATTRIBUTES, 9, &[], &[]);
        let (status, resp) = call(&f, None, &data).await;
        assert_eq!(status, 200);
        assert_eq!(resp.operation_id, STATUS_OK);

        let printer = resp.group(TAG_PRINTER_ATTRIBUTES).unwrap();
        assert_eq!(
            printer.get_string("printer-uri-supported").as_deref(),
            Some("ipp://printer.local:631/ipp/print")
        );
        assert_eq!(printer.get_string("uri-authentication-supported").as_deref(), Some("basic"));
        assert_eq!(printer.get_integer("operations-supported"), Some(i32::from(OP_PRINT_JOB)));
        assert_eq!(printer.get_integer("queued-job-count"), Some(0));
        assert_eq!(printer.get("printer-is-accepting-jobs").unwrap().value, vec![1u8]);
        let formats: Vec<String> = printer
            .attributes
            .iter()
            .skip_while(|a| a.name != "document-format-supported")
            .take_while(|a| a.name == "document-format-supported" || a.name.is_empty())
            .map(|a| String::from_utf8_lossy(&a.value).into_owned())
            .collect();
        assert_eq!(formats.len(), DocumentFormat::SUPPORTED.len());
        assert!(formats.contains(&"application/pdf".to_string()));
    }

    #[tokio::test]
    async fn anonymous_printer_attributes_can_be_disabled() {
        let config = IppListenerConfig {
            allow_anonymous_printer_attributes: false,
            ..Default::default()
        };
        let f = fixture_with(10, config);
        let data = build_test_ipp_request(OP_GET_PRINTER_ATTRIBUTES, 9, &[], &[]);
        let (status, _) = call(&f, None, &data).await;
        assert_eq!(status, 401);
        let (status, _) = call(&f, Some(("alice", f.alice.as_str())), &data).await;
        assert_eq!(status, 200);
    }

    #[tokio::test]
    async fn unsupported_format_is_rejected() {
        let f = fixture(10);
        let (_, resp) = call(&f, Some(("alice", f.alice.as_str())), &print_request(6, b"application/x-excel", b"xx")).await;
        assert_eq!(resp.operation_id, STATUS_CLIENT_ERROR_DOCUMENT_FORMAT_NOT_SUPPORTED);
        assert_eq!(f.intake.store().queue_depth().unwrap(), 0);

        let validate = build_test_ipp_request(
            OP_VALIDATE_JOB,
            7,
            &[(VALUE_TAG_MIME_MEDIA_TYPE, "document-format", &b"application/x-excel"[..])],
            &[],
        );
        let (_, resp) = call(&f, Some(("alice", f.alice.as_str())), &validate).await;
        assert_eq!(resp.operation_id, STATUS_CLIENT_ERROR_DOCUMENT_FORMAT_NOT_SUPPORTED);

        let validate = build_test_ipp_request(
            OP_VALIDATE_JOB,
            8,
            &[(VALUE_TAG_MIME_MEDIA_TYPE, "document-format", &b"application/postscript"[..])],
            &[],
        );
        let (_, resp) = call(&f, Some(("alice", f.alice.as_str())), &validate).await;
        assert_eq!(resp.operation_id, STATUS_OK);
    }

    #[tokio::test]
    async fn jobs_are_private_to_their_owner() {
        let f = fixture(10);
        let number = submit(&f, &f.alice, b"%PDF alice only").await;

        for op in [OP_GET_JOB_ATTRIBUTES, OP_CANCEL_JOB] {
            let (_, resp) = call(&f, Some(("bob", f.bob.as_str())), &job_request(op, 11, number)).await;
            assert_eq!(resp.operation_id, STATUS_CLIENT_ERROR_NOT_FOUND);
        }
        let (_, resp) = call(
            &f,
            Some(("bob", f.bob.as_str())),
            &build_test_ipp_request(OP_GET_JOBS, 12, &[(VALUE_TAG_KEYWORD, "which-jobs", &b"all"[..])], &[]),
        )
        .await;
        assert_eq!(job_groups(&resp), 0);

        let job = f.intake.store().get_by_number(i64::from(number)).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn cancel_by_job_uri_then_again() {
        let f = fixture(10);
        let number = submit(&f, &f.alice, b"%PDF cancel me").await;
        let uri = format!("ipp://printer.local:631/ipp/print/jobs/{number}");
        let data = build_test_ipp_request(OP_CANCEL_JOB, 13, &[(VALUE_TAG_URI, "job-uri", uri.as_bytes())], &[]);

        let (_, resp) = call(&f, Some(("alice", f.alice.as_str())), &data).await;
        assert_eq!(resp.operation_id, STATUS_OK);
        let job = f.intake.store().get_by_number(i64::from(number)).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);

        let (_, resp) = call(&f, Some(("alice", f.alice.as_str())), &data).await;
        assert_eq!(resp.operation_id, STATUS_CLIENT_ERROR_NOT_POSSIBLE);
    }

    #[tokio::test]
    async fn get_jobs_honours_which_jobs_and_limit() {
        let f = fixture(10);
        let first = submit(&f, &f.alice, b"%PDF one").await;
        submit(&f, &f.alice, b"%PDF two").await;
        submit(&f, &f.alice, b"%PDF three").await;
        call(&f, Some(("alice", f.alice.as_str())), &job_request(OP_CANCEL_JOB, 1, first)).await;

        let get_jobs = |which: Option<&'static [u8]>, limit: Option<i32>| {
            let limit_bytes = limit.map(i32::to_be_bytes);
            let mut attrs: Vec<(u8, &str, &[u8])> = Vec::new();
            if let Some(which) = which {
                attrs.push((VALUE_TAG_KEYWORD, "which-jobs", which));
            }
            if let Some(bytes) = limit_bytes.as_ref() {
                attrs.push((VALUE_TAG_INTEGER, "limit", &bytes[..]));
            }
            build_test_ipp_request(OP_GET_JOBS, 20, &attrs, &[])
        };

        let (_, resp) = call(&f, Some(("alice", f.alice.as_str())), &get_jobs(None, None)).await;
        assert_eq!(job_groups(&resp), 2);
        let (_, resp) = call(&f, Some(("alice", f.alice.as_str())), &get_jobs(Some(&b"completed"[..]), None)).await;
        assert_eq!(job_groups(&resp), 1);
        assert_eq!(resp.job_attributes().unwrap().get_integer("job-state"), Some(JOB_STATE_CANCELED));
        let (_, resp) = call(&f, Some(("alice", f.alice.as_str())), &get_jobs(Some(&b"all"[..]), Some(2))).await;
        assert_eq!(job_groups(&resp), 2);
        let (_, resp) = call(&f, Some(("alice", f.alice.as_str())), &get_jobs(Some(&b"everything"[..]), None)).await;
        assert_eq!(resp.operation_id, STATUS_CLIENT_ERROR_ATTRIBUTES_OR_VALUES_NOT_SUPPORTED);
    }

    #[tokio::test]
    async fn full_queue_answers_busy() {
        let f = fixture(1);
        submit(&f, &f.alice, b"%PDF fills the queue").await;
        let (status, resp) = call(&f, Some(("alice", f.alice.as_str())), &print_request(30, b"application/pdf", b"%PDF")).await;
        assert_eq!(status, 200);
        assert_eq!(resp.operation_id, STATUS_SERVER_ERROR_BUSY);
        assert_eq!(f.intake.store().queue_depth().unwrap(), 1);
    }

    #[tokio::test]
    async fn empty_document_is_bad_request() {
        let f = fixture(10);
        let (_, resp) = call(&f, Some(("alice", f.alice.as_str())), &print_request(31, b"application/pdf", b"")).await;
        assert_eq!(resp.operation_id, STATUS_CLIENT_ERROR_BAD_REQUEST);
        assert_eq!(f.intake.store().queue_depth().unwrap(), 0);
    }

    #[tokio::test]
    async fn protocol_errors_are_framed_ipp() {
        let f = fixture(10);

        // Truncated header.
        let (status, resp) = call(&f, None, &[0x01, 0x01, 0x00]).await;
        assert_eq!(status, 200);
        assert_eq!(resp.operation_id, STATUS_CLIENT_ERROR_BAD_REQUEST);

        // Unsupported version.
        let mut data = build_test_ipp_request(OP_GET_PRINTER_ATTRIBUTES, 40, &[], &[]);
        data[0] = 9;
        let (_, resp) = call(&f, None, &data).await;
        assert_eq!(resp.operation_id, STATUS_SERVER_ERROR_VERSION_NOT_SUPPORTED);
        assert_eq!(resp.request_id, 40);

        // Unknown operation.
        let data = build_test_ipp_request(0x0010, 41, &[], &[]);
        let (_, resp) = call(&f, Some(("alice", f.alice.as_str())), &data).await;
        assert_eq!(resp.operation_id, STATUS_SERVER_ERROR_OPERATION_NOT_SUPPORTED);

        // Charset missing from the front of the operation group.
        let mut data = vec![1, 1, 0, 0x0B, 0, 0, 0, 42, TAG_OPERATION_ATTRIBUTES];
        write_test_attr(&mut data, VALUE_TAG_NAME, "requesting-user-name", b"x");
        data.push(TAG_END_OF_ATTRIBUTES);
        let (_, resp) = call(&f, None, &data).await;
        assert_eq!(resp.operation_id, STATUS_CLIENT_ERROR_BAD_REQUEST);
        assert_eq!(resp.request_id, 42);
    }

    #[tokio::test]
    async fn oversized_attribute_section_is_refused() {
        let config = IppListenerConfig {
            max_attribute_bytes: 128,
            ..Default::default()
        };
        let f = fixture_with(10, config);
        let long_name = vec![b'a'; 400];
        let data = build_test_ipp_request(OP_PRINT_JOB, 50, &[(VALUE_TAG_NAME, "job-name", &long_name[..])], b"%PDF");
        let (_, resp) = call(&f, Some(("alice", f.alice.as_str())), &data).await;
        assert_eq!(resp.operation_id, STATUS_CLIENT_ERROR_REQUEST_ENTITY_TOO_LARGE);
        assert_eq!(resp.request_id, 50);
    }

    #[test]
    fn authority_falls_back_to_local_port() {
        let mut h = head(None);
        let local: SocketAddr = "192.0.2.1:8631".parse().unwrap();
        let peer: SocketAddr = "10.0.0.1:1".parse().unwrap();

        h.host = Some("printer".into());
        let ctx = RequestContext { head: &h, peer, local };
        assert_eq!(ctx.authority(), "printer:8631");

        let mut h = head(None);
        h.host = None;
        let ctx = RequestContext { head: &h, peer, local };
        assert_eq!(ctx.authority(), "192.0.2.1:8631");

        assert!(has_port("[fe80::1]:631"));
        assert!(!has_port("[fe80::1]"));
        assert_eq!(job_number_from_uri("ipp://h:631/ipp/print/jobs/17"), Some(17));
        assert_eq!(job_number_from_uri("ipp://h:631/ipp/print"), None);
    }
}
