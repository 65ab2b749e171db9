// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Service layer: configuration resolution and the wiring of the backend
// crates into one running daemon.

pub mod app_services;
pub mod data_dir;

use std::path::{Path, PathBuf};

use printgate_core::config::ServerConfig;
use printgate_core::error::Result;
use tracing::info;

/// Effective configuration: the file if given (defaults otherwise), with the
/// data directory optionally overridden from the command line.
pub fn resolve_config(path: Option<&Path>, data_dir: Option<PathBuf>) -> Result<ServerConfig> {
    let mut config = match path {
        Some(path) => {
            info!(path = %path.display(), "loading configuration");
            ServerConfig::load(path)?
        }
        None => ServerConfig {
            data_dir: data_dir::default_data_dir(),
            ..ServerConfig::default()
        },
    };
    if let Some(dir) = data_dir {
        config.data_dir = dir;
    }
    config.validate()?;
    Ok(config)
}
