// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Thumbnail derivation from the renderer's first-page raster.

use image::{DynamicImage, ImageFormat};
use printgate_core::error::PrintgateError;
use tracing::{debug, instrument};

/// Downscale an encoded first-page image so its longest edge is at most
/// `max_px`, and re-encode it as PNG.  Smaller images are kept as-is.
#[instrument(skip(data), fields(data_len = data.len()))]
pub fn make_thumbnail(data: &[u8], max_px: u32) -> Result<Vec<u8>, PrintgateError> {
    let img = image::load_from_memory(data)
        .map_err(|err| PrintgateError::Image(format!("failed to decode page image: {err}")))?;

    let max_px = max_px.max(1);
    let thumb = if img.width() > max_px || img.height() > max_px {
        img.thumbnail(max_px, max_px)
    } else {
        img
    };

    debug!(width = thumb.width(), height = thumb.height(), "thumbnail derived");
    encode_png(&thumb)
}

fn encode_png(image: &DynamicImage) -> Result<Vec<u8>, PrintgateError> {
    let mut buffer = Vec::new();
    let mut cursor = std::io::Cursor::new(&mut buffer);
    image
        .write_to(&mut cursor, ImageFormat::Png)
        .map_err(|err| PrintgateError::Image(format!("image encoding failed: {err}")))?;
    Ok(buffer)
}
