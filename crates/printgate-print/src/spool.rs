// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Spool: durable staging of incoming document bytes.
//
// Each submission streams into its own `spool/<job-id>` file.  The size and
// SHA-256 digest are computed on the way through, so nothing is ever held in
// memory beyond one read buffer plus a short head used for format sniffing.
// The submitting connection is the only writer; the claiming worker is the
// only reader.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, warn};

use printgate_core::error::{PrintgateError, Result};
use printgate_core::types::JobId;

/// Leading bytes kept for `DocumentFormat::sniff`.
const HEAD_LEN: usize = 512;

/// The spool directory.
#[derive(Debug, Clone)]
pub struct Spool {
    dir: PathBuf,
}

impl Spool {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, id: &JobId) -> PathBuf {
        self.dir.join(id.to_string())
    }

    /// Open a fresh spool file for `id`.
    pub async fn create(&self, id: &JobId) -> Result<SpoolWriter> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| PrintgateError::Spool(format!("create {}: {e}", self.dir.display())))?;
        let path = self.path_for(id);
        let file = File::create(&path)
            .await
            .map_err(|e| PrintgateError::Spool(format!("create {}: {e}", path.display())))?;
        debug!(path = %path.display(), "spool file opened");
        Ok(SpoolWriter {
            path,
            out: BufWriter::new(file),
            hasher: Sha256::new(),
            size: 0,
            head: Vec::with_capacity(HEAD_LEN),
        })
    }
}

/// A finished spool file.
#[derive(Debug, Clone)]
pub struct SpooledDocument {
    pub path: PathBuf,
    pub size: u64,
    /// Lowercase hex SHA-256.
    pub hash: String,
    pub head: Vec<u8>,
}

/// Streaming writer for one submission.
pub struct SpoolWriter {
    path: PathBuf,
    out: BufWriter<File>,
    hasher: Sha256,
    size: u64,
    head: Vec<u8>,
}

impl SpoolWriter {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes written so far.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Append a chunk.
    pub async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        self.out
            .write_all(chunk)
            .await
            .map_err(|e| PrintgateError::Spool(format!("write {}: {e}", self.path.display())))?;
        self.hasher.update(chunk);
        if self.head.len() < HEAD_LEN {
            let take = (HEAD_LEN - self.head.len()).min(chunk.len());
            self.head.extend_from_slice(&chunk[..take]);
        }
        self.size += chunk.len() as u64;
        Ok(())
    }

    /// Flush to stable storage and return the digest.
    ///
    /// Also used for truncated uploads: whatever arrived is kept.
    pub async fn finish(mut self) -> Result<SpooledDocument> {
        let flushed = async {
            self.out.flush().await?;
            self.out.get_ref().sync_all().await
        }
        .await;
        if let Err(e) = flushed {
            let err = PrintgateError::Spool(format!("flush {}: {e}", self.path.display()));
            remove_quietly(&self.path).await;
            return Err(err);
        }
        Ok(SpooledDocument {
            path: self.path,
            size: self.size,
            hash: hex::encode(self.hasher.finalize()),
            head: self.head,
        })
    }

    /// Discard the file; nothing of the submission is retained.
    pub async fn abort(self) {
        let SpoolWriter { path, out, .. } = self;
        drop(out);
        remove_quietly(&path).await;
    }
}

/// Delete a spool file, logging rather than failing.
pub async fn remove_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "spool file removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "could not remove spool file"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use printgate_security::integrity::{hash_bytes, hash_file};

    #[tokio::test]
    async fn streamed_digest_matches_file() {
        let dir = tempfile::tempdir().unwrap();
        let spool = Spool::new(dir.path().join("spool"));
        let id = JobId::new();

        let mut writer = spool.create(&id).await.unwrap();
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 253) as u8).collect();
        for chunk in data.chunks(4096) {
            writer.write(chunk).await.unwrap();
        }
        let doc = writer.finish().await.unwrap();

        assert_eq!(doc.path, spool.path_for(&id));
        assert_eq!(doc.size, data.len() as u64);
        assert_eq!(doc.hash, hash_bytes(&data));
        assert_eq!(doc.hash, hash_file(&doc.path).unwrap());
        assert_eq!(doc.head, data[..HEAD_LEN]);
    }

    #[tokio::test]
    async fn short_document_keeps_whole_head() {
        let dir = tempfile::tempdir().unwrap();
        let spool = Spool::new(dir.path());
        let mut writer = spool.create(&JobId::new()).await.unwrap();
        writer.write(b"%PDF").await.unwrap();
        writer.write(b"-1.7").await.unwrap();
        let doc = writer.finish().await.unwrap();
        assert_eq!(doc.head, b"%PDF-1.7");
    }

    #[tokio::test]
    async fn abort_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let spool = Spool::new(dir.path());
        let id = JobId::new();
        let mut writer = spool.create(&id).await.unwrap();
        writer.write(b"partial").await.unwrap();
        writer.abort().await;
        assert!(!spool.path_for(&id).exists());
    }
}
