// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// PDF reader: sanity checks on the normalised document before it is
// published.

use lopdf::{dictionary, Document, Object, Stream};
use printgate_core::error::PrintgateError;
use tracing::{debug, instrument};

/// A loaded PDF, used to confirm the renderer produced something usable.
pub struct PdfReader {
    document: Document,
}

impl PdfReader {
    /// Create a reader from raw PDF bytes already in memory.
    #[instrument(skip_all, fields(bytes = data.len()))]
    pub fn from_bytes(data: &[u8]) -> Result<Self, PrintgateError> {
        let document = Document::load_mem(data).map_err(|err| {
            PrintgateError::Pdf(format!("failed to load PDF from memory: {}", err))
        })?;

        debug!(pages = document.get_pages().len(), "PDF loaded");
        Ok(Self { document })
    }

    /// Number of pages in the document.
    pub fn page_count(&self) -> usize {
        self.document.get_pages().len()
    }

    /// Fail unless the document has at least one page.
    pub fn ensure_printable(&self) -> Result<usize, PrintgateError> {
        match self.page_count() {
            0 => Err(PrintgateError::Pdf("document has no pages".into())),
            n => Ok(n),
        }
    }
}

/// Build an empty A4 PDF with `pages` blank pages.
///
/// Stand-in output for renderer doubles and a fixture for tests.
pub fn blank_document(pages: u32) -> Result<Vec<u8>, PrintgateError> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();

    let mut kids: Vec<Object> = Vec::new();
    for _ in 0..pages {
        let content_id = doc.add_object(Stream::new(dictionary! {}, Vec::new()));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
            "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
        });
        kids.push(page_id.into());
    }

    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => pages as i64,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut buf = Vec::new();
    doc.save_to(&mut buf)
        .map_err(|e| PrintgateError::Pdf(format!("serialise blank document: {e}")))?;
    Ok(buf)
}
