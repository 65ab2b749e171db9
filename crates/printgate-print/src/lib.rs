// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Printgate Print: the ingestion and conversion core.  Raw and IPP listeners
// spool incoming documents, attribute them to accounts, and record jobs in
// the store; a worker pool drives each job through the external renderer.

pub mod identity;
pub mod intake;
pub mod ipp;
pub mod raw_server;
pub mod renderer;
pub mod retry;
pub mod service;
pub mod spool;
pub mod store;
pub mod worker;

pub use identity::IdentityResolver;
pub use intake::Intake;
pub use ipp::IppServer;
pub use raw_server::RawServer;
pub use renderer::{Renderer, SubprocessRenderer};
pub use service::JobService;
pub use store::JobStore;
pub use worker::WorkerPool;
