// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Unified error types for Printgate.

use thiserror::Error;

use crate::types::{ErrorClass, JobId, JobStatus};

/// Top-level error type for all Printgate operations.
#[derive(Debug, Error)]
pub enum PrintgateError {
    // -- Protocol layer --
    #[error("malformed request: {0}")]
    Protocol(String),

    #[error("submission could not be attributed: {0}")]
    Attribution(String),

    #[error("not authenticated: {0}")]
    NotAuthenticated(String),

    #[error("queue is at capacity ({depth} jobs waiting, limit {limit})")]
    Capacity { depth: usize, limit: usize },

    #[error("print server error: {0}")]
    PrintServer(String),

    // -- Spool / conversion --
    #[error("spool write failed: {0}")]
    Spool(String),

    #[error("conversion failed: {0}")]
    Conversion(String),

    #[error("renderer timed out after {0}s")]
    RenderTimeout(u64),

    #[error("unsupported document format: {0}")]
    UnsupportedDocument(String),

    #[error("PDF operation failed: {0}")]
    Pdf(String),

    #[error("image processing failed: {0}")]
    Image(String),

    // -- Job store --
    #[error("job {0} not found")]
    JobNotFound(JobId),

    #[error("job {id} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("database error: {0}")]
    Database(String),

    // -- Configuration / persistence --
    #[error("configuration error: {0}")]
    Config(String),

    #[error("file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PrintgateError {
    /// Retry classification for this error.
    ///
    /// Only renderer-side failures that may succeed on another attempt are
    /// transient; bad input never is.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Conversion(_)
            | Self::RenderTimeout(_)
            | Self::Database(_)
            | Self::PrintServer(_)
            | Self::Capacity { .. } => ErrorClass::Transient,
            Self::Io(io_err) => match io_err.kind() {
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                    ErrorClass::Permanent
                }
                _ => ErrorClass::Transient,
            },
            Self::Protocol(_)
            | Self::Attribution(_)
            | Self::NotAuthenticated(_)
            | Self::Spool(_)
            | Self::UnsupportedDocument(_)
            | Self::Pdf(_)
            | Self::Image(_)
            | Self::JobNotFound(_)
            | Self::InvalidTransition { .. }
            | Self::Config(_)
            | Self::Serialization(_) => ErrorClass::Permanent,
        }
    }
}

/// Alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, PrintgateError>;
