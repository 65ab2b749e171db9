// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Minimal HTTP/1.1 framing for the IPP endpoint.
//
// Only what IPP clients actually send is understood: a POST with a
// `Content-Length` or chunked body, optional `Expect: 100-continue`, Basic
// credentials, and keep-alive.  The body is exposed as a stream so Print-Job
// documents go to the spool without being buffered.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest request line plus headers accepted.
const MAX_HEAD_BYTES: usize = 16 * 1024;

/// Largest chunk-size or trailer line accepted.
const MAX_LINE_BYTES: usize = 4 * 1024;

const READ_CHUNK: usize = 16 * 1024;

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("malformed HTTP request: {0}")]
    Malformed(String),
    #[error("connection idle for too long")]
    Timeout,
    #[error("connection closed mid-request")]
    UnexpectedEof,
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

/// Decoded `Authorization: Basic` credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicCredentials {
    pub username: String,
    pub password: String,
}

impl BasicCredentials {
    /// Decode the value of an `Authorization` header.  Other schemes yield
    /// `None`.
    pub fn parse(header: &str) -> Option<Self> {
        let (scheme, encoded) = header.trim().split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("basic") {
            return None;
        }
        let decoded = BASE64.decode(encoded.trim()).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (username, password) = decoded.split_once(':')?;
        Some(Self {
            username: username.to_string(),
            password: password.to_string(),
        })
    }
}

/// Request line and the headers the endpoint cares about.
#[derive(Debug, Clone, Default)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    pub content_length: Option<u64>,
    pub chunked: bool,
    pub expect_continue: bool,
    pub keep_alive: bool,
    /// `Some` when an `Authorization` header was present, even if it could
    /// not be decoded.
    pub authorization: Option<Option<BasicCredentials>>,
    pub host: Option<String>,
}

impl RequestHead {
    fn parse(raw: &[u8]) -> Result<Self, HttpError> {
        let text = std::str::from_utf8(raw)
            .map_err(|_| HttpError::Malformed("header section is not UTF-8".into()))?;
        let mut lines = text.split("\r\n");

        let request_line = lines.next().unwrap_or_default();
        let mut parts = request_line.split_whitespace();
        let (Some(method), Some(path), Some(version)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(HttpError::Malformed(format!("bad request line {request_line:?}")));
        };
        if !version.starts_with("HTTP/1.") {
            return Err(HttpError::Malformed(format!("unsupported version {version}")));
        }

        let mut head = RequestHead {
            method: method.to_string(),
            path: path.to_string(),
            // HTTP/1.1 defaults to persistent connections, 1.0 does not.
            keep_alive: version != "HTTP/1.0",
            ..Default::default()
        };

        for line in lines.filter(|l| !l.is_empty()) {
            let Some((name, value)) = line.split_once(':') else {
                return Err(HttpError::Malformed(format!("bad header line {line:?}")));
            };
            let value = value.trim();
            match name.trim().to_ascii_lowercase().as_str() {
                "content-length" => {
                    let len = value
                        .parse()
                        .map_err(|_| HttpError::Malformed(format!("bad Content-Length {value:?}")))?;
                    head.content_length = Some(len);
                }
                "transfer-encoding" => {
                    head.chunked = value.to_ascii_lowercase().contains("chunked");
                }
                "expect" => head.expect_continue = value.eq_ignore_ascii_case("100-continue"),
                "connection" => {
                    let value = value.to_ascii_lowercase();
                    if value.contains("close") {
                        head.keep_alive = false;
                    } else if value.contains("keep-alive") {
                        head.keep_alive = true;
                    }
                }
                "authorization" => head.authorization = Some(BasicCredentials::parse(value)),
                "host" => head.host = Some(value.to_string()),
                _ => {}
            }
        }
        Ok(head)
    }
}

/// A response ready to be written.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub reason: &'static str,
    pub headers: Vec<(&'static str, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// `200 OK` carrying an IPP message.
    pub fn ipp(body: Vec<u8>) -> Self {
        Self {
            status: 200,
            reason: "OK",
            headers: vec![("Content-Type", "application/ipp".into())],
            body,
        }
    }

    /// `401` with a Basic challenge; the body is still a framed IPP message.
    pub fn unauthorized(body: Vec<u8>) -> Self {
        Self {
            status: 401,
            reason: "Unauthorized",
            headers: vec![
                ("Content-Type", "application/ipp".into()),
                ("WWW-Authenticate", "Basic realm=\"printgate\"".into()),
            ],
            body,
        }
    }

    pub fn method_not_allowed() -> Self {
        Self {
            status: 405,
            reason: "Method Not Allowed",
            headers: vec![("Allow", "POST".into())],
            body: Vec::new(),
        }
    }

    pub fn bad_request(message: &str) -> Self {
        Self {
            status: 400,
            reason: "Bad Request",
            headers: vec![("Content-Type", "text/plain".into())],
            body: message.as_bytes().to_vec(),
        }
    }
}

/// One client connection: a read buffer over the socket.
pub struct HttpConnection<S> {
    stream: S,
    buf: Vec<u8>,
    idle_timeout: Duration,
}

impl<S> HttpConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, idle_timeout: Duration) -> Self {
        Self {
            stream,
            buf: Vec::with_capacity(READ_CHUNK),
            idle_timeout,
        }
    }

    /// Read the next request head.  `Ok(None)` means the client closed (or
    /// went idle) between requests.
    pub async fn read_head(&mut self) -> Result<Option<RequestHead>, HttpError> {
        loop {
            // Tolerate stray CRLFs between pipelined requests.
            let skip = self.buf.iter().take_while(|&&b| b == b'\r' || b == b'\n').count();
            self.buf.drain(..skip);

            if let Some(end) = find_subsequence(&self.buf, b"\r\n\r\n") {
                let head = RequestHead::parse(&self.buf[..end])?;
                self.buf.drain(..end + 4);
                return Ok(Some(head));
            }
            if self.buf.len() > MAX_HEAD_BYTES {
                return Err(HttpError::Malformed("header section too large".into()));
            }

            match self.fill().await {
                Ok(0) if self.buf.is_empty() => return Ok(None),
                Ok(0) => return Err(HttpError::UnexpectedEof),
                Ok(_) => {}
                Err(HttpError::Timeout) if self.buf.is_empty() => return Ok(None),
                Err(e) => return Err(e),
            }
        }
    }

    /// Stream the body of `head`.
    pub fn body(&mut self, head: &RequestHead) -> BodyReader<'_, S> {
        let state = if head.chunked {
            BodyState::ChunkHeader
        } else {
            match head.content_length {
                Some(0) | None => BodyState::Done,
                Some(len) => BodyState::Length(len),
            }
        };
        BodyReader {
            conn: self,
            state,
            pending: Vec::new(),
            send_continue: head.expect_continue,
        }
    }

    pub async fn write_response(
        &mut self,
        response: &HttpResponse,
        keep_alive: bool,
    ) -> Result<(), HttpError> {
        let mut head = format!("HTTP/1.1 {} {}\r\n", response.status, response.reason);
        for (name, value) in &response.headers {
            head.push_str(&format!("{name}: {value}\r\n"));
        }
        head.push_str(&format!("Content-Length: {}\r\n", response.body.len()));
        head.push_str(if keep_alive {
            "Connection: keep-alive\r\n\r\n"
        } else {
            "Connection: close\r\n\r\n"
        });

        self.stream.write_all(head.as_bytes()).await?;
        self.stream.write_all(&response.body).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Append whatever the socket has to the buffer.
    async fn fill(&mut self) -> Result<usize, HttpError> {
        let mut chunk = [0u8; READ_CHUNK];
        let n = tokio::time::timeout(self.idle_timeout, self.stream.read(&mut chunk))
            .await
            .map_err(|_| HttpError::Timeout)??;
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    /// Read up to `limit` body bytes, buffered bytes first.
    async fn read_into(&mut self, out: &mut [u8], limit: u64) -> Result<usize, HttpError> {
        let want = out.len().min(usize::try_from(limit).unwrap_or(usize::MAX));
        if !self.buf.is_empty() {
            let n = want.min(self.buf.len());
            out[..n].copy_from_slice(&self.buf[..n]);
            self.buf.drain(..n);
            return Ok(n);
        }
        let n = tokio::time::timeout(self.idle_timeout, self.stream.read(&mut out[..want]))
            .await
            .map_err(|_| HttpError::Timeout)??;
        Ok(n)
    }

    /// Read one CRLF-terminated line (without the terminator).
    async fn read_line(&mut self) -> Result<String, HttpError> {
        loop {
            if let Some(end) = find_subsequence(&self.buf, b"\r\n") {
                let line = String::from_utf8_lossy(&self.buf[..end]).into_owned();
                self.buf.drain(..end + 2);
                return Ok(line);
            }
            if self.buf.len() > MAX_LINE_BYTES {
                return Err(HttpError::Malformed("chunk line too long".into()));
            }
            if self.fill().await? == 0 {
                return Err(HttpError::UnexpectedEof);
            }
        }
    }

    async fn send_continue(&mut self) -> Result<(), HttpError> {
        self.stream.write_all(b"HTTP/1.1 100 Continue\r\n\r\n").await?;
        self.stream.flush().await?;
        Ok(())
    }
}

/// A request body the IPP handler can stream from.
pub trait DocumentBody {
    /// Read into `out`; `Ok(0)` marks the end of the body.
    fn read(&mut self, out: &mut [u8]) -> impl Future<Output = Result<usize, HttpError>> + Send;

    /// Push bytes back so the next `read` returns them first.
    fn unread(&mut self, bytes: Vec<u8>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyState {
    Length(u64),
    ChunkHeader,
    Chunk(u64),
    Done,
}

/// Body of the current request, bounded by its framing.
pub struct BodyReader<'a, S> {
    conn: &'a mut HttpConnection<S>,
    state: BodyState,
    pending: Vec<u8>,
    send_continue: bool,
}

impl<S> BodyReader<'_, S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Whether the body was consumed to its end, leaving the connection
    /// positioned at the next request.
    pub fn is_finished(&self) -> bool {
        self.state == BodyState::Done && self.pending.is_empty()
    }

    /// Read the rest of the body, discarding it, so the connection can be
    /// reused.  Gives up after `limit` bytes.
    pub async fn drain(&mut self, limit: u64) -> Result<bool, HttpError> {
        let mut scratch = [0u8; 4096];
        let mut seen = 0u64;
        while seen <= limit {
            let n = self.read_body(&mut scratch).await?;
            if n == 0 {
                return Ok(true);
            }
            seen += n as u64;
        }
        Ok(false)
    }

    async fn read_body(&mut self, out: &mut [u8]) -> Result<usize, HttpError> {
        if !self.pending.is_empty() {
            let n = out.len().min(self.pending.len());
            out[..n].copy_from_slice(&self.pending[..n]);
            self.pending.drain(..n);
            return Ok(n);
        }
        if out.is_empty() {
            return Ok(0);
        }
        if self.send_continue && self.state != BodyState::Done {
            self.send_continue = false;
            self.conn.send_continue().await?;
        }

        loop {
            match self.state {
                BodyState::Done => return Ok(0),
                BodyState::Length(remaining) => {
                    let n = self.conn.read_into(out, remaining).await?;
                    if n == 0 {
                        return Err(HttpError::UnexpectedEof);
                    }
                    let left = remaining - n as u64;
                    self.state = if left == 0 {
                        BodyState::Done
                    } else {
                        BodyState::Length(left)
                    };
                    return Ok(n);
                }
                BodyState::ChunkHeader => {
                    let line = self.conn.read_line().await?;
                    let size_field = line.split(';').next().unwrap_or_default().trim();
                    let size = u64::from_str_radix(size_field, 16).map_err(|_| {
                        HttpError::Malformed(format!("bad chunk size {size_field:?}"))
                    })?;
                    if size == 0 {
                        // Trailers end with an empty line.
                        while !self.conn.read_line().await?.is_empty() {}
                        self.state = BodyState::Done;
                        return Ok(0);
                    }
                    self.state = BodyState::Chunk(size);
                }
                BodyState::Chunk(remaining) => {
                    let n = self.conn.read_into(out, remaining).await?;
                    if n == 0 {
                        return Err(HttpError::UnexpectedEof);
                    }
                    let left = remaining - n as u64;
                    if left == 0 {
                        if !self.conn.read_line().await?.is_empty() {
                            return Err(HttpError::Malformed("chunk not followed by CRLF".into()));
                        }
                        self.state = BodyState::ChunkHeader;
                    } else {
                        self.state = BodyState::Chunk(left);
                    }
                    return Ok(n);
                }
            }
        }
    }
}

impl<S> DocumentBody for BodyReader<'_, S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn read(&mut self, out: &mut [u8]) -> impl Future<Output = Result<usize, HttpError>> + Send {
        self.read_body(out)
    }

    fn unread(&mut self, mut bytes: Vec<u8>) {
        bytes.extend_from_slice(&self.pending);
        self.pending = bytes;
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tokio::io::{AsyncWriteExt, duplex};

    /// In-memory body for handler tests.
    pub(crate) struct SliceBody {
        data: Vec<u8>,
        pos: usize,
        /// Largest chunk handed out per read.
        step: usize,
    }

    impl SliceBody {
        pub(crate) fn new(data: &[u8], step: usize) -> Self {
            Self {
                data: data.to_vec(),
                pos: 0,
                step: step.max(1),
            }
        }
    }

    impl DocumentBody for SliceBody {
        async fn read(&mut self, out: &mut [u8]) -> Result<usize, HttpError> {
            let n = out.len().min(self.step).min(self.data.len() - self.pos);
            out[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }

        fn unread(&mut self, bytes: Vec<u8>) {
            let mut rest = bytes;
            rest.extend_from_slice(&self.data[self.pos..]);
            self.data = rest;
            self.pos = 0;
        }
    }

    async fn read_all<S>(body: &mut BodyReader<'_, S>) -> Vec<u8>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut out = Vec::new();
        let mut buf = [0u8; 7];
        loop {
            let n = body.read(&mut buf).await.unwrap();
            if n == 0 {
                return out;
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    fn timeout() -> Duration {
        Duration::from_secs(5)
    }

    #[test]
    fn basic_credentials_decode() {
        // "alice:s3cret"
        let creds = BasicCredentials::parse("Basic YWxpY2U6czNjcmV0").unwrap();
        assert_eq!(creds.username, "alice");
        assert_eq!(creds.password, "s3cret");
        assert!(BasicCredentials::parse("Bearer abc").is_none());
        assert!(BasicCredentials::parse("Basic !!!").is_none());
    }

    #[tokio::test]
    async fn content_length_body_and_keep_alive() {
        let (mut client, server) = duplex(4096);
        client
            .write_all(
                b"POST /ipp/print HTTP/1.1\r\nHost: printer:631\r\nContent-Type: application/ipp\r\n\
                  Content-Length: 11\r\n\r\nhello worldPOST / HTTP/1.1\r\nContent-Length: 0\r\n\r\n",
            )
            .await
            .unwrap();

        let mut conn = HttpConnection::new(server, timeout());
        let head = conn.read_head().await.unwrap().unwrap();
        assert_eq!(head.method, "POST");
        assert_eq!(head.path, "/ipp/print");
        assert_eq!(head.host.as_deref(), Some("printer:631"));
        assert!(head.keep_alive);
        assert!(head.authorization.is_none());

        let mut body = conn.body(&head);
        assert_eq!(read_all(&mut body).await, b"hello world");
        assert!(body.is_finished());

        let next = conn.read_head().await.unwrap().unwrap();
        assert_eq!(next.content_length, Some(0));
        assert!(conn.body(&next).is_finished());
    }

    #[tokio::test]
    async fn chunked_body_is_decoded() {
        let (mut client, server) = duplex(4096);
        client
            .write_all(
                b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n\
                  5\r\nhello\r\n6;ext=1\r\n world\r\n0\r\nX-Trailer: 1\r\n\r\n",
            )
            .await
            .unwrap();

        let mut conn = HttpConnection::new(server, timeout());
        let head = conn.read_head().await.unwrap().unwrap();
        assert!(head.chunked);
        let mut body = conn.body(&head);
        assert_eq!(read_all(&mut body).await, b"hello world");
        assert!(body.is_finished());
    }

    #[tokio::test]
    async fn expect_continue_is_sent_before_body_read() {
        let (mut client, server) = duplex(4096);
        client
            .write_all(b"POST / HTTP/1.1\r\nExpect: 100-continue\r\nContent-Length: 3\r\n\r\n")
            .await
            .unwrap();

        let mut conn = HttpConnection::new(server, timeout());
        let head = conn.read_head().await.unwrap().unwrap();
        assert!(head.expect_continue);

        let reader = tokio::spawn(async move {
            let mut body = conn.body(&head);
            read_all(&mut body).await
        });

        let mut interim = [0u8; 25];
        client.read_exact(&mut interim).await.unwrap();
        assert_eq!(&interim, b"HTTP/1.1 100 Continue\r\n\r\n");
        client.write_all(b"abc").await.unwrap();
        assert_eq!(reader.await.unwrap(), b"abc");
    }

    #[tokio::test]
    async fn unread_bytes_come_back_first() {
        let (mut client, server) = duplex(4096);
        client
            .write_all(b"POST / HTTP/1.1\r\nContent-Length: 6\r\n\r\nabcdef")
            .await
            .unwrap();
        let mut conn = HttpConnection::new(server, timeout());
        let head = conn.read_head().await.unwrap().unwrap();
        let mut body = conn.body(&head);

        let mut buf = [0u8; 4];
        let n = body.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"abcd");
        body.unread(b"cd".to_vec());
        assert!(!body.is_finished());
        assert_eq!(read_all(&mut body).await, b"cdef");
    }

    #[tokio::test]
    async fn close_between_requests_is_not_an_error() {
        let (client, server) = duplex(64);
        drop(client);
        let mut conn = HttpConnection::new(server, timeout());
        assert!(conn.read_head().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn garbage_request_line_is_malformed() {
        let (mut client, server) = duplex(256);
        client.write_all(b"\x02\x00\x00\x0b\r\n\r\n").await.unwrap();
        let mut conn = HttpConnection::new(server, timeout());
        assert!(matches!(conn.read_head().await, Err(HttpError::Malformed(_))));
    }

    #[tokio::test]
    async fn short_body_is_unexpected_eof() {
        let (mut client, server) = duplex(256);
        client
            .write_all(b"POST / HTTP/1.1\r\nContent-Length: 10\r\nAuthorization: Basic YTpi\r\n\r\nabc")
            .await
            .unwrap();
        drop(client);
        let mut conn = HttpConnection::new(server, timeout());
        let head = conn.read_head().await.unwrap().unwrap();
        assert_eq!(
            head.authorization,
            Some(Some(BasicCredentials {
                username: "a".into(),
                password: "b".into()
            }))
        );
        let mut body = conn.body(&head);
        let mut buf = [0u8; 16];
        assert_eq!(body.read(&mut buf).await.unwrap(), 3);
        assert!(matches!(body.read(&mut buf).await, Err(HttpError::UnexpectedEof)));
    }

    #[tokio::test]
    async fn response_framing() {
        let (mut client, server) = duplex(4096);
        let mut conn = HttpConnection::new(server, timeout());
        conn.write_response(&HttpResponse::unauthorized(vec![1, 2, 3]), true)
            .await
            .unwrap();
        drop(conn);

        let mut raw = Vec::new();
        client.read_to_end(&mut raw).await.unwrap();
        let text = String::from_utf8_lossy(&raw);
        assert!(text.starts_with("HTTP/1.1 401 Unauthorized\r\n"));
        assert!(text.contains("WWW-Authenticate: Basic realm=\"printgate\"\r\n"));
        assert!(text.contains("Content-Length: 3\r\n"));
        assert!(text.contains("Connection: keep-alive\r\n"));
        assert!(raw.ends_with(&[1, 2, 3]));
    }
}
