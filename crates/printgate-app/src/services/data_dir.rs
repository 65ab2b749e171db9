// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Data directory resolution and layout.

use std::path::PathBuf;

use printgate_core::config::ServerConfig;
use printgate_core::error::{PrintgateError, Result};

/// Data directory used when no configuration file is given.
pub fn default_data_dir() -> PathBuf {
    dirs_fallback().join("printgate")
}

/// Create the data directory and the spool and artifact directories below it.
pub fn prepare(config: &ServerConfig) -> Result<()> {
    for dir in [config.data_dir.clone(), config.spool_dir(), config.artifact_dir()] {
        std::fs::create_dir_all(&dir)
            .map_err(|e| PrintgateError::Config(format!("create {}: {e}", dir.display())))?;
    }
    Ok(())
}

fn dirs_fallback() -> PathBuf {
    // Try XDG data dir, then fallback to home
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        return PathBuf::from(xdg);
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".local").join("share");
    }
    PathBuf::from("/var/lib")
}
