// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Renderer: the boundary to the external rendering engine.
//
// The engine runs as a child process per invocation, never in-process.  Each
// run is bounded three ways: a wall-clock timeout, a cap on the size of the
// file it produces, and a cap on how much of its stdout/stderr is kept for
// diagnostics.  The output cap is enforced while the engine runs as well as
// after it exits.  On timeout, cancellation or runaway output the child is
// killed and reaped before `render` returns, so no engine process outlives
// its job.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use printgate_core::config::RendererConfig;
use printgate_core::error::{PrintgateError, Result};

/// How long to wait for the output pipes to drain after the engine exits.
const PIPE_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Diagnostic text included in an error message.
const ERROR_TAIL_BYTES: usize = 512;

/// How often the output file is measured while the engine runs.
const OUTPUT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// What to produce from an input file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderTarget {
    /// The normalised PDF.
    Document,
    /// Page 1 of the normalised PDF as PNG.
    Thumbnail,
}

impl RenderTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Document => "document",
            Self::Thumbnail => "thumbnail",
        }
    }
}

/// Converts an input file into an output file.
///
/// `cancel` flips to `true` when the job's owner cancels; implementations
/// stop as soon as they notice.  Returns the size of the file written to
/// `output`.
pub trait Renderer: Send + Sync {
    fn render(
        &self,
        target: RenderTarget,
        input: &Path,
        output: &Path,
        cancel: watch::Receiver<bool>,
    ) -> impl Future<Output = Result<u64>> + Send;
}

/// Runs the configured program as a subprocess.
#[derive(Debug, Clone)]
pub struct SubprocessRenderer {
    config: RendererConfig,
    timeout: Duration,
}

enum Outcome {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
    Oversized(u64),
}

impl SubprocessRenderer {
    pub fn new(config: RendererConfig, timeout: Duration) -> Self {
        Self { config, timeout }
    }

    fn args_for(&self, target: RenderTarget, input: &Path, output: &Path) -> Vec<String> {
        let template = match target {
            RenderTarget::Document => &self.config.document_args,
            RenderTarget::Thumbnail => &self.config.thumbnail_args,
        };
        expand_args(template, input, output)
    }

    fn oversized(&self, target: RenderTarget, size: u64) -> PrintgateError {
        PrintgateError::Conversion(format!(
            "{} of {size} bytes exceeds the {} byte limit",
            target.as_str(),
            self.config.max_output_bytes
        ))
    }
}

impl Renderer for SubprocessRenderer {
    async fn render(
        &self,
        target: RenderTarget,
        input: &Path,
        output: &Path,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<u64> {
        if *cancel.borrow() {
            return Err(PrintgateError::Conversion("render cancelled".into()));
        }

        let program = &self.config.program;
        let args = self.args_for(target, input, output);
        debug!(program, ?args, target = target.as_str(), "starting renderer");

        let mut child = Command::new(program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PrintgateError::Conversion(format!("cannot start {program}: {e}")))?;

        let limit = self.config.max_captured_output_bytes;
        let stdout_task = tokio::spawn(capture(child.stdout.take(), limit));
        let stderr_task = tokio::spawn(capture(child.stderr.take(), limit));

        let outcome = tokio::select! {
            status = child.wait() => Outcome::Exited(status),
            _ = tokio::time::sleep(self.timeout) => Outcome::TimedOut,
            _ = cancelled(&mut cancel) => Outcome::Cancelled,
            size = outgrown(output, self.config.max_output_bytes) => Outcome::Oversized(size),
        };

        let status = match outcome {
            Outcome::Exited(Ok(status)) => status,
            Outcome::Exited(Err(e)) => {
                terminate(&mut child, stdout_task, stderr_task).await;
                return Err(PrintgateError::Conversion(format!("waiting for {program}: {e}")));
            }
            Outcome::TimedOut => {
                warn!(
                    program,
                    timeout_secs = self.timeout.as_secs(),
                    target = target.as_str(),
                    "renderer timed out, killing"
                );
                terminate(&mut child, stdout_task, stderr_task).await;
                return Err(PrintgateError::RenderTimeout(self.timeout.as_secs()));
            }
            Outcome::Cancelled => {
                debug!(program, "render cancelled, killing");
                terminate(&mut child, stdout_task, stderr_task).await;
                return Err(PrintgateError::Conversion("render cancelled".into()));
            }
            Outcome::Oversized(size) => {
                warn!(
                    program,
                    bytes = size,
                    limit = self.config.max_output_bytes,
                    target = target.as_str(),
                    "renderer output too large, killing"
                );
                terminate(&mut child, stdout_task, stderr_task).await;
                return Err(self.oversized(target, size));
            }
        };

        let stdout = collect(stdout_task).await;
        let stderr = collect(stderr_task).await;

        if !status.success() {
            // Ghostscript reports PostScript errors on stdout.
            let diagnostics = if stderr.is_empty() { &stdout } else { &stderr };
            return Err(PrintgateError::Conversion(format!(
                "{program} {status}: {}",
                tail(diagnostics)
            )));
        }

        let size = tokio::fs::metadata(output)
            .await
            .map_err(|e| {
                PrintgateError::Conversion(format!("{program} produced no {}: {e}", target.as_str()))
            })?
            .len();
        if size == 0 {
            return Err(PrintgateError::Conversion(format!(
                "{program} produced an empty {}",
                target.as_str()
            )));
        }
        if size > self.config.max_output_bytes {
            return Err(self.oversized(target, size));
        }

        debug!(program, target = target.as_str(), bytes = size, "renderer finished");
        Ok(size)
    }
}

/// Substitute `{input}` and `{output}` in each argument.
fn expand_args(template: &[String], input: &Path, output: &Path) -> Vec<String> {
    let input = input.to_string_lossy();
    let output = output.to_string_lossy();
    template
        .iter()
        .map(|arg| arg.replace("{input}", &input).replace("{output}", &output))
        .collect()
}

/// Resolves once `cancel` reads `true`.  Never resolves if the sender is gone.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Resolves with the output's size once it grows past `limit`.
async fn outgrown(output: &Path, limit: u64) -> u64 {
    let mut ticker = tokio::time::interval(OUTPUT_POLL_INTERVAL);
    loop {
        ticker.tick().await;
        let size = match tokio::fs::metadata(output).await {
            Ok(meta) => meta.len(),
            Err(_) => continue,
        };
        if size > limit {
            return size;
        }
    }
}

/// Kill and reap the child, then drop the pipe readers.
async fn terminate(child: &mut Child, stdout: JoinHandle<Vec<u8>>, stderr: JoinHandle<Vec<u8>>) {
    if let Err(e) = child.kill().await {
        warn!(error = %e, "could not kill renderer");
    }
    stdout.abort();
    stderr.abort();
}

/// Read a pipe to EOF, keeping at most `limit` bytes.  Reading continues
/// past the limit so the child never blocks on a full pipe.
async fn capture<R>(stream: Option<R>, limit: usize) -> Vec<u8>
where
    R: AsyncRead + Unpin,
{
    let Some(mut stream) = stream else {
        return Vec::new();
    };
    let mut kept = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return kept,
            Ok(n) => {
                let room = limit.saturating_sub(kept.len());
                kept.extend_from_slice(&buf[..n.min(room)]);
            }
        }
    }
}

async fn collect(task: JoinHandle<Vec<u8>>) -> Vec<u8> {
    match tokio::time::timeout(PIPE_DRAIN_TIMEOUT, task).await {
        Ok(Ok(bytes)) => bytes,
        _ => Vec::new(),
    }
}

fn tail(bytes: &[u8]) -> String {
    let start = bytes.len().saturating_sub(ERROR_TAIL_BYTES);
    String::from_utf8_lossy(&bytes[start..]).trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::classify_error;
    use printgate_core::types::ErrorClass;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;

    fn script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("render.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn renderer(program: &Path, timeout: Duration) -> SubprocessRenderer {
        let args = vec!["{input}".to_string(), "{output}".to_string()];
        SubprocessRenderer::new(
            RendererConfig {
                program: program.to_string_lossy().into_owned(),
                document_args: args.clone(),
                thumbnail_args: args,
                max_output_bytes: 1024,
                max_captured_output_bytes: 256,
                thumbnail_max_px: 64,
            },
            timeout,
        )
    }

    fn no_cancel() -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        drop(tx);
        rx
    }

    fn process_exists(pid: &str) -> bool {
        Path::new("/proc").join(pid.trim()).exists()
    }

    #[test]
    fn placeholders_are_substituted() {
        let template = vec!["-sOutputFile={output}".to_string(), "{input}".to_string(), "-q".to_string()];
        let args = expand_args(&template, Path::new("/spool/a"), Path::new("/out/b.pdf"));
        assert_eq!(args, vec!["-sOutputFile=/out/b.pdf", "/spool/a", "-q"]);
    }

    #[tokio::test]
    async fn successful_render_reports_size() {
        let dir = tempfile::tempdir().unwrap();
        let program = script(dir.path(), r#"cp "$1" "$2""#);
        let input = dir.path().join("in");
        let output = dir.path().join("out");
        std::fs::write(&input, b"%PDF-1.4 body").unwrap();

        let size = renderer(&program, Duration::from_secs(10))
            .render(RenderTarget::Document, &input, &output, no_cancel())
            .await
            .unwrap();
        assert_eq!(size, 13);
        assert_eq!(std::fs::read(&output).unwrap(), b"%PDF-1.4 body");
    }

    #[tokio::test]
    async fn failing_render_carries_diagnostics() {
        let dir = tempfile::tempdir().unwrap();
        let program = script(dir.path(), "echo 'Error: /syntaxerror in --token--' >&2\nexit 1");
        let input = dir.path().join("in");
        std::fs::write(&input, b"garbage").unwrap();

        let err = renderer(&program, Duration::from_secs(10))
            .render(RenderTarget::Document, &input, &dir.path().join("out"), no_cancel())
            .await
            .unwrap_err();
        match &err {
            PrintgateError::Conversion(msg) => assert!(msg.contains("/syntaxerror"), "{msg}"),
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(classify_error(&err), ErrorClass::Permanent);
    }

    #[tokio::test]
    async fn timeout_kills_the_engine() {
        let dir = tempfile::tempdir().unwrap();
        let program = script(dir.path(), r#"echo $$ > "$2.pid"; exec sleep 30"#);
        let input = dir.path().join("in");
        let output = dir.path().join("out");
        std::fs::write(&input, b"%!PS").unwrap();

        let started = std::time::Instant::now();
        let err = renderer(&program, Duration::from_secs(1))
            .render(RenderTarget::Document, &input, &output, no_cancel())
            .await
            .unwrap_err();
        assert!(matches!(err, PrintgateError::RenderTimeout(1)));
        assert!(started.elapsed() < Duration::from_secs(10));

        let pid = std::fs::read_to_string(dir.path().join("out.pid")).unwrap();
        assert!(!process_exists(&pid), "renderer {pid} still running");
    }

    #[tokio::test]
    async fn cancel_kills_the_engine() {
        let dir = tempfile::tempdir().unwrap();
        let program = script(dir.path(), r#"echo $$ > "$2.pid"; exec sleep 30"#);
        let input = dir.path().join("in");
        let output = dir.path().join("out");
        std::fs::write(&input, b"%!PS").unwrap();

        let (tx, rx) = watch::channel(false);
        let r = renderer(&program, Duration::from_secs(60));
        let render = r.render(RenderTarget::Thumbnail, &input, &output, rx);
        let cancel = async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            tx.send(true).unwrap();
        };
        let (result, ()) = tokio::join!(render, cancel);
        assert!(matches!(result, Err(PrintgateError::Conversion(ref m)) if m.contains("cancelled")));

        let pid = std::fs::read_to_string(dir.path().join("out.pid")).unwrap();
        assert!(!process_exists(&pid), "renderer {pid} still running");
    }

    #[tokio::test]
    async fn oversized_or_missing_output_fails() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in");
        std::fs::write(&input, b"x").unwrap();

        let big = script(dir.path(), r#"head -c 4096 /dev/zero > "$2""#);
        let err = renderer(&big, Duration::from_secs(10))
            .render(RenderTarget::Document, &input, &dir.path().join("big"), no_cancel())
            .await
            .unwrap_err();
        assert!(matches!(err, PrintgateError::Conversion(ref m) if m.contains("exceeds")));

        let silent = script(dir.path(), "exit 0");
        let err = renderer(&silent, Duration::from_secs(10))
            .render(RenderTarget::Document, &input, &dir.path().join("none"), no_cancel())
            .await
            .unwrap_err();
        assert!(matches!(err, PrintgateError::Conversion(ref m) if m.contains("produced no")));
    }

    #[tokio::test]
    async fn runaway_output_is_stopped_early() {
        let dir = tempfile::tempdir().unwrap();
        let program = script(
            dir.path(),
            r#"echo $$ > "$2.pid"; while :; do head -c 512 /dev/zero >> "$2"; sleep 0.05; done"#,
        );
        let input = dir.path().join("in");
        let output = dir.path().join("out");
        std::fs::write(&input, b"%!PS").unwrap();

        let started = std::time::Instant::now();
        let err = renderer(&program, Duration::from_secs(60))
            .render(RenderTarget::Document, &input, &output, no_cancel())
            .await
            .unwrap_err();
        assert!(matches!(err, PrintgateError::Conversion(ref m) if m.contains("exceeds")));
        assert!(started.elapsed() < Duration::from_secs(10));

        let pid = std::fs::read_to_string(dir.path().join("out.pid")).unwrap();
        assert!(!process_exists(&pid), "renderer {pid} still running");
    }

    #[tokio::test]
    async fn missing_program_is_conversion_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = renderer(Path::new("/nonexistent/renderer"), Duration::from_secs(1))
            .render(RenderTarget::Document, dir.path(), &dir.path().join("out"), no_cancel())
            .await
            .unwrap_err();
        assert!(matches!(err, PrintgateError::Conversion(ref m) if m.contains("cannot start")));
    }

    #[tokio::test]
    async fn captured_output_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        // 64 KiB of noise on stderr, then failure.
        let program = script(dir.path(), "head -c 65536 /dev/zero | tr '\\0' 'e' >&2\nexit 3");
        let err = renderer(&program, Duration::from_secs(10))
            .render(RenderTarget::Document, dir.path(), &dir.path().join("out"), no_cancel())
            .await
            .unwrap_err();
        match err {
            PrintgateError::Conversion(msg) => assert!(msg.len() < 1024, "{} bytes", msg.len()),
            other => panic!("unexpected error {other:?}"),
        }
    }
}
