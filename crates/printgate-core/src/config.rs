// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Server configuration.
//
// Loaded from a JSON file; every section falls back to its defaults so a
// partial file (or no file at all) yields a working server.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PrintgateError, Result};

/// Top-level daemon settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Root for `spool/`, `artifacts/`, `jobs.db` and `audit.db`.
    pub data_dir: PathBuf,
    pub raw: RawListenerConfig,
    pub ipp: IppListenerConfig,
    pub attribution: AttributionConfig,
    pub queue: QueueConfig,
    pub workers: WorkerConfig,
    pub renderer: RendererConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/printgate"),
            raw: RawListenerConfig::default(),
            ipp: IppListenerConfig::default(),
            attribution: AttributionConfig::default(),
            queue: QueueConfig::default(),
            workers: WorkerConfig::default(),
            renderer: RendererConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Read and validate a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .map_err(|e| PrintgateError::Config(format!("read {}: {e}", path.display())))?;
        let config: Self = serde_json::from_str(&data)
            .map_err(|e| PrintgateError::Config(format!("parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make the server unable to make progress.
    pub fn validate(&self) -> Result<()> {
        if self.workers.count == 0 {
            return Err(PrintgateError::Config("workers.count must be at least 1".into()));
        }
        if self.workers.max_attempts == 0 {
            return Err(PrintgateError::Config(
                "workers.max_attempts must be at least 1".into(),
            ));
        }
        if self.queue.max_depth == 0 {
            return Err(PrintgateError::Config("queue.max_depth must be at least 1".into()));
        }
        if self.raw.max_connections == 0 || self.ipp.max_connections == 0 {
            return Err(PrintgateError::Config("max_connections must be at least 1".into()));
        }
        if self.raw.idle_timeout_secs == 0 || self.ipp.idle_timeout_secs == 0 {
            return Err(PrintgateError::Config(
                "idle_timeout_secs must be at least 1".into(),
            ));
        }
        if self.renderer.program.trim().is_empty() {
            return Err(PrintgateError::Config("renderer.program is empty".into()));
        }
        Ok(())
    }

    pub fn spool_dir(&self) -> PathBuf {
        self.data_dir.join("spool")
    }

    pub fn artifact_dir(&self) -> PathBuf {
        self.data_dir.join("artifacts")
    }

    pub fn jobs_db_path(&self) -> PathBuf {
        self.data_dir.join("jobs.db")
    }

    pub fn audit_db_path(&self) -> PathBuf {
        self.data_dir.join("audit.db")
    }
}

/// Raw (JetDirect-style) socket listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RawListenerConfig {
    pub enabled: bool,
    pub bind: IpAddr,
    /// Default 9100.
    pub port: u16,
    /// A connection idle this long ends the job.
    pub idle_timeout_secs: u64,
    pub max_connections: usize,
}

impl Default for RawListenerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 9100,
            idle_timeout_secs: 30,
            max_connections: 64,
        }
    }
}

impl RawListenerConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// IPP-over-HTTP listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IppListenerConfig {
    pub enabled: bool,
    pub bind: IpAddr,
    /// Default 631.
    pub port: u16,
    pub idle_timeout_secs: u64,
    pub max_connections: usize,
    /// Upper bound on the attribute section of one request.
    pub max_attribute_bytes: usize,
    /// Returned as `printer-name`.
    pub printer_name: String,
    /// Answer Get-Printer-Attributes without credentials so clients can
    /// negotiate before prompting for a password.
    pub allow_anonymous_printer_attributes: bool,
}

impl Default for IppListenerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 631,
            idle_timeout_secs: 30,
            max_connections: 64,
            max_attribute_bytes: 256 * 1024,
            printer_name: "Printgate Virtual Printer".into(),
            allow_anonymous_printer_attributes: true,
        }
    }
}

impl IppListenerConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// What to do with a raw submission whose source address matches no
/// registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrphanPolicy {
    /// Keep it as an orphaned job for administrator review.
    Accept,
    /// Discard it.
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AttributionConfig {
    pub orphan_policy: OrphanPolicy,
    /// JSON `IdentityDirectory` loaded at start-up.
    pub directory_path: Option<PathBuf>,
}

impl Default for AttributionConfig {
    fn default() -> Self {
        Self {
            orphan_policy: OrphanPolicy::Accept,
            directory_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Pending jobs allowed before new submissions are refused.
    pub max_depth: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { max_depth: 100 }
    }
}

/// Conversion worker pool and retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub count: usize,
    pub render_timeout_secs: u64,
    /// Total attempts (first run included) before a job fails for good.
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_secs: u64,
    /// Fallback poll interval when no wake-up arrives.
    pub poll_interval_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: 2,
            render_timeout_secs: 120,
            max_attempts: 3,
            base_backoff_ms: 2_000,
            max_backoff_secs: 120,
            poll_interval_ms: 500,
        }
    }
}

impl WorkerConfig {
    pub fn render_timeout(&self) -> Duration {
        Duration::from_secs(self.render_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// External rendering engine invocation.
///
/// Argument templates may contain `{input}` and `{output}`, which are
/// substituted per invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    pub program: String,
    /// Produces the normalised PDF.
    pub document_args: Vec<String>,
    /// Renders page 1 of the normalised PDF to PNG.
    pub thumbnail_args: Vec<String>,
    /// Any single output file larger than this is a conversion failure.
    pub max_output_bytes: u64,
    /// stdout/stderr kept for diagnostics, per stream.
    pub max_captured_output_bytes: usize,
    /// Longest edge of the published thumbnail.
    pub thumbnail_max_px: u32,
}

impl Default for RendererConfig {
    fn default() -> Self {
        let args = |list: &[&str]| list.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        Self {
            program: "gs".into(),
            document_args: args(&[
                "-q",
                "-dBATCH",
                "-dNOPAUSE",
                "-dSAFER",
                "-sDEVICE=pdfwrite",
                "-sOutputFile={output}",
                "{input}",
            ]),
            thumbnail_args: args(&[
                "-q",
                "-dBATCH",
                "-dNOPAUSE",
                "-dSAFER",
                "-sDEVICE=png16m",
                "-r72",
                "-dFirstPage=1",
                "-dLastPage=1",
                "-sOutputFile={output}",
                "{input}",
            ]),
            max_output_bytes: 256 * 1024 * 1024,
            max_captured_output_bytes: 64 * 1024,
            thumbnail_max_px: 256,
        }
    }
}
