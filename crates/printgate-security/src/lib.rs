// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// printgate-security: secret handling and the audit trail.
//
// IPP token secrets never touch disk in plaintext: they are generated from
// the system CSPRNG, handed to the caller once, and stored as SHA-256
// digests.  Attribution decisions that an administrator may need to review
// (orphaned jobs, rejected submissions, failed authentication) are appended
// to a SQLite audit log.

pub mod audit;
pub mod integrity;

pub use audit::{AuditAction, AuditEntry, AuditLog};
pub use integrity::{generate_token_secret, hash_bytes, hash_file, hash_secret, verify_hash};
