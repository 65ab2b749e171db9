// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Core domain types for the Printgate ingestion and conversion pipeline.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a print job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque reference to an account owned by the external account directory.
///
/// The core never creates or mutates accounts; it only carries their ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(pub String);

impl AccountId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Protocol a job was submitted over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobOrigin {
    /// Raw byte stream on the JetDirect-style socket (port 9100).
    Raw,
    /// Internet Printing Protocol over HTTP.
    Ipp,
}

impl JobOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Ipp => "ipp",
        }
    }
}

impl FromStr for JobOrigin {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "raw" => Ok(Self::Raw),
            "ipp" => Ok(Self::Ipp),
            other => Err(format!("unknown job origin {other:?}")),
        }
    }
}

/// Lifecycle states of a print job.
///
/// `Pending -> Processing -> {Completed | Failed | Cancelled}`; a pending job
/// may also be cancelled directly.  Terminal states are immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Queued, waiting for a worker.
    Pending,
    /// Claimed by a worker; the renderer is running.
    Processing,
    /// Artifacts published.
    Completed,
    /// Conversion failed for good -- see the job error fields.
    Failed,
    /// Cancelled by the owner.
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Stable lowercase name, used as the stored column value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown job status {other:?}")),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input document formats the renderer is asked to normalise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocumentFormat {
    Pdf,
    PostScript,
    /// PCL (Printer Command Language).
    Pcl,
    PlainText,
    Jpeg,
    Png,
    Tiff,
    /// PWG Raster (rendered page images).
    PwgRaster,
    /// Unknown bytes; the renderer decides whether it can cope.
    OctetStream,
}

impl DocumentFormat {
    /// All formats advertised in `document-format-supported`.
    pub const SUPPORTED: [DocumentFormat; 9] = [
        Self::Pdf,
        Self::PostScript,
        Self::Pcl,
        Self::PlainText,
        Self::Jpeg,
        Self::Png,
        Self::Tiff,
        Self::PwgRaster,
        Self::OctetStream,
    ];

    /// MIME type string used for IPP `document-format`.
    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Pdf => "application/pdf",
            Self::PostScript => "application/postscript",
            Self::Pcl => "application/vnd.hp-pcl",
            Self::PlainText => "text/plain",
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::Tiff => "image/tiff",
            Self::PwgRaster => "image/pwg-raster",
            Self::OctetStream => "application/octet-stream",
        }
    }

    /// Map an IPP `document-format` MIME string; parameters such as
    /// `; charset=utf-8` are ignored.  Returns `None` for unsupported types.
    pub fn from_mime(mime: &str) -> Option<Self> {
        let base = mime.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
        Self::SUPPORTED.into_iter().find(|f| f.mime_type() == base)
    }

    /// Guess the format from the leading bytes of a document.
    ///
    /// Raw-socket submissions carry no format metadata, so this is the only
    /// signal available for them.
    pub fn sniff(head: &[u8]) -> Self {
        // PJL wrappers precede the real payload on many drivers.
        let head = strip_pjl_header(head);

        if head.starts_with(b"%PDF") {
            Self::Pdf
        } else if head.starts_with(b"%!") || head.starts_with(b"\x04%!") {
            Self::PostScript
        } else if head.starts_with(b"\x1bE") || head.starts_with(b"\x1b%-12345X") {
            Self::Pcl
        } else if head.starts_with(&[0xFF, 0xD8, 0xFF]) {
            Self::Jpeg
        } else if head.starts_with(b"\x89PNG\r\n\x1a\n") {
            Self::Png
        } else if head.starts_with(b"II*\0") || head.starts_with(b"MM\0*") {
            Self::Tiff
        } else if head.starts_with(b"RaS2") {
            Self::PwgRaster
        } else if !head.is_empty()
            && head
                .iter()
                .all(|&b| b == b'\n' || b == b'\r' || b == b'\t' || b == 0x0C || (0x20..0x7F).contains(&b) || b >= 0x80)
        {
            Self::PlainText
        } else {
            Self::OctetStream
        }
    }
}

/// Skip a leading `ESC%-12345X@PJL ...` block up to the `ENTER LANGUAGE`
/// line, if present.
fn strip_pjl_header(head: &[u8]) -> &[u8] {
    const UEL: &[u8] = b"\x1b%-12345X";
    if !head.starts_with(UEL) {
        return head;
    }
    let mut rest = &head[UEL.len()..];
    while rest.starts_with(b"@PJL") {
        match rest.iter().position(|&b| b == b'\n') {
            Some(nl) => rest = &rest[nl + 1..],
            None => return head,
        }
    }
    rest
}

/// A CIDR address range.  A bare address is a host route (`/32` or `/128`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IpRange {
    network: IpAddr,
    prefix_len: u8,
}

impl IpRange {
    /// Build a range, masking off host bits of `addr`.
    pub fn new(addr: IpAddr, prefix_len: u8) -> Result<Self, String> {
        let addr = addr.to_canonical();
        let max = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix_len > max {
            return Err(format!("prefix /{prefix_len} too long for {addr}"));
        }
        let network = match addr {
            IpAddr::V4(v4) => {
                let mask = if prefix_len == 0 { 0 } else { u32::MAX << (32 - prefix_len) };
                IpAddr::V4(Ipv4Addr::from(u32::from(v4) & mask))
            }
            IpAddr::V6(v6) => {
                let mask = if prefix_len == 0 { 0 } else { u128::MAX << (128 - prefix_len) };
                IpAddr::V6(Ipv6Addr::from(u128::from(v6) & mask))
            }
        };
        Ok(Self { network, prefix_len })
    }

    /// Single-host range.
    pub fn host(addr: IpAddr) -> Self {
        let addr = addr.to_canonical();
        let prefix_len = if addr.is_ipv4() { 32 } else { 128 };
        Self {
            network: addr,
            prefix_len,
        }
    }

    pub fn network(&self) -> IpAddr {
        self.network
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Whether `addr` falls inside this range.  IPv4-mapped IPv6 peers are
    /// matched against IPv4 ranges.
    pub fn contains(&self, addr: IpAddr) -> bool {
        match (self.network, addr.to_canonical()) {
            (IpAddr::V4(net), IpAddr::V4(a)) => {
                let mask = if self.prefix_len == 0 { 0 } else { u32::MAX << (32 - self.prefix_len) };
                u32::from(a) & mask == u32::from(net)
            }
            (IpAddr::V6(net), IpAddr::V6(a)) => {
                let mask = if self.prefix_len == 0 { 0 } else { u128::MAX << (128 - self.prefix_len) };
                u128::from(a) & mask == u128::from(net)
            }
            _ => false,
        }
    }
}

impl fmt::Display for IpRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix_len)
    }
}

impl FromStr for IpRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s.split_once('/') {
            Some((addr, len)) => {
                let addr: IpAddr = addr.parse().map_err(|e| format!("bad address {addr:?}: {e}"))?;
                let len: u8 = len.parse().map_err(|e| format!("bad prefix {len:?}: {e}"))?;
                Self::new(addr, len)
            }
            None => {
                let addr: IpAddr = s.parse().map_err(|e| format!("bad address {s:?}: {e}"))?;
                Ok(Self::host(addr))
            }
        }
    }
}

impl TryFrom<String> for IpRange {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<IpRange> for String {
    fn from(range: IpRange) -> Self {
        range.to_string()
    }
}

/// An address or address range mapped to an owning account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpRegistration {
    pub id: Uuid,
    pub account: AccountId,
    pub range: IpRange,
    pub created_at: DateTime<Utc>,
}

impl IpRegistration {
    pub fn new(account: AccountId, range: IpRange) -> Self {
        Self {
            id: Uuid::new_v4(),
            account,
            range,
            created_at: Utc::now(),
        }
    }
}

/// An IPP access token.  Only the SHA-256 hex digest of the secret is kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IppToken {
    pub id: Uuid,
    pub account: AccountId,
    pub secret_hash: String,
    #[serde(default)]
    pub revoked: bool,
    pub created_at: DateTime<Utc>,
}

/// Serialized form of the registration and token tables, as exported by the
/// account-management side.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityDirectory {
    #[serde(default)]
    pub registrations: Vec<IpRegistration>,
    #[serde(default)]
    pub tokens: Vec<IppToken>,
}

/// Classification of errors for retry logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Renderer crash, timeout, busy resource -- worth another attempt.
    Transient,
    /// Bad input or configuration -- retrying cannot help.
    Permanent,
}

/// A complete print job record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrintJob {
    pub id: JobId,
    /// Sequential number assigned by the store; doubles as the IPP `job-id`.
    pub number: i64,
    /// `None` for orphaned submissions.
    pub owner: Option<AccountId>,
    pub origin: JobOrigin,
    pub source_addr: IpAddr,
    pub document_name: String,
    pub format: DocumentFormat,
    pub status: JobStatus,
    /// Path of the spooled input bytes.
    pub spool_path: String,
    /// Number of bytes spooled.
    pub spool_size: u64,
    /// SHA-256 hash of the spooled bytes.
    pub document_hash: String,
    /// Published normalised document.
    pub document_ref: Option<String>,
    /// Published first-page thumbnail.
    pub thumbnail_ref: Option<String>,
    pub error_message: Option<String>,
    /// Error messages from each failed attempt.
    pub error_history: Vec<String>,
    /// Number of times a worker has claimed this job.
    pub attempts: u32,
    pub max_attempts: u32,
    /// Earliest time a requeued job may be claimed again.
    pub not_before: Option<DateTime<Utc>>,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl PrintJob {
    pub fn new(
        origin: JobOrigin,
        source_addr: IpAddr,
        owner: Option<AccountId>,
        format: DocumentFormat,
        document_name: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            number: 0,
            owner,
            origin,
            source_addr,
            document_name,
            format,
            status: JobStatus::Pending,
            spool_path: String::new(),
            spool_size: 0,
            document_hash: String::new(),
            document_ref: None,
            thumbnail_ref: None,
            error_message: None,
            error_history: Vec::new(),
            attempts: 0,
            max_attempts: 3,
            not_before: None,
            cancel_requested: false,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn is_orphaned(&self) -> bool {
        self.owner.is_none()
    }
}

/// Status of an embedded listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerStatus {
    Stopped,
    Starting,
    Running,
    Error,
}
