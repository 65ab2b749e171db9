// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// IPP printer endpoint: binary codec, HTTP/1.1 framing, operation handler,
// and the listener that ties them together.

pub mod codec;
pub mod http;
pub mod operations;
pub mod server;

pub use operations::IppHandler;
pub use server::IppServer;
