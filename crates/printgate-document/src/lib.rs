// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// printgate-document: in-process checks and touch-ups on renderer output.
//
// Rendering itself happens in an external subprocess; this crate only
// validates the normalised PDF it produces and derives the published
// thumbnail from the first-page raster.

pub mod pdf;
pub mod thumbnail;

pub use pdf::PdfReader;
pub use thumbnail::make_thumbnail;
