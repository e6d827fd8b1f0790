//! Bounded line reader and request envelope parsing.
//!
//! Grounded on the connection library's `Parser`/`HttpConnection<H, S>::parse*` family,
//! generalized from zero-copy `&'static` slicing over one fixed connection buffer to owned
//! `String`/`Vec<u8>` storage — percent-decoding and dynamic path resolution both require
//! ownership, which a buffer that never allocates past startup can't provide.

use std::path::Path;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use memchr::memchr;
use tokio::io::AsyncReadExt;

use crate::auth::users::UserStore;
use crate::errors::ErrorKind;
use crate::http::query::Query;
use crate::http::types::{HeaderMap, Method, Resolved, Ticket, Url, Version};
use crate::http::uri;
use crate::limits::ReqLimits;

/// Result of one bounded line read.
pub(crate) struct LineResult {
    pub(crate) line: Vec<u8>,
    pub(crate) overflow: bool,
}

/// Reads CRLF-terminated lines off a transport, bounded by a per-call `max_length`. Left-over
/// bytes from one read (e.g. the start of the body after headers) are retained in `buffer` for
/// the next consumer.
///
/// Unlike the connection library's `Parser`, this does not hold the transport by reference: every method
/// takes it as an argument instead. A dispatch handler needs to read the body (PUT/POST) *and*
/// write the response head through the same stream, and a reader that owned a `&mut` borrow of
/// the transport for its whole lifetime would make that second borrow impossible to take.
///
/// No `Clone` impl: `connection::run` owns one instance for the whole keep-alive lifetime of a
/// connection and threads it through `&mut`, so the overflow/buffer state never needs to survive
/// a move into a separate callback or task the way it would under a continuation-passing reader.
#[derive(Default)]
pub(crate) struct LineReader {
    buffer: Vec<u8>,
    pos: usize,
}

impl LineReader {
    pub(crate) fn new() -> Self {
        LineReader {
            buffer: Vec::with_capacity(1024),
            pos: 0,
        }
    }

    /// Reads until LF (consumed, and the trailing CR if present is left in `line` for the caller
    /// to strip) or until `max_length` bytes have been examined without finding one.
    pub(crate) async fn read_line<T: tokio::io::AsyncRead + Unpin>(
        &mut self,
        transport: &mut T,
        max_length: usize,
    ) -> std::io::Result<LineResult> {
        loop {
            if let Some(rel) = memchr(b'\n', &self.buffer[self.pos..]) {
                let end = self.pos + rel;
                let line = self.buffer[self.pos..end].to_vec();
                self.pos = end + 1;
                return Ok(LineResult {
                    line,
                    overflow: false,
                });
            }

            if self.buffer.len() - self.pos >= max_length {
                let end = self.pos + max_length;
                let line = self.buffer[self.pos..end].to_vec();
                self.pos = end;
                return Ok(LineResult {
                    line,
                    overflow: true,
                });
            }

            let mut chunk = [0u8; 4096];
            let read = transport.read(&mut chunk).await?;
            if read == 0 {
                let line = self.buffer[self.pos..].to_vec();
                self.pos = self.buffer.len();
                return Ok(LineResult {
                    line,
                    overflow: false,
                });
            }
            self.buffer.extend_from_slice(&chunk[..read]);
            self.compact();
        }
    }

    /// Reads exactly `n` bytes (used by content intake), honoring whatever is already buffered
    /// from the line-reading phase.
    pub(crate) async fn read_exact_bytes<T: tokio::io::AsyncRead + Unpin>(
        &mut self,
        transport: &mut T,
        n: usize,
    ) -> std::io::Result<Vec<u8>> {
        while self.buffer.len() - self.pos < n {
            let mut chunk = [0u8; 8192];
            let read = transport.read(&mut chunk).await?;
            if read == 0 {
                break;
            }
            self.buffer.extend_from_slice(&chunk[..read]);
        }
        let end = (self.pos + n).min(self.buffer.len());
        let out = self.buffer[self.pos..end].to_vec();
        self.pos = end;
        self.compact();
        Ok(out)
    }

    fn compact(&mut self) {
        if self.pos > 0 && self.pos == self.buffer.len() {
            self.buffer.clear();
            self.pos = 0;
        }
    }
}

fn strip_cr(line: &[u8]) -> &[u8] {
    match line.last() {
        Some(b'\r') => &line[..line.len() - 1],
        _ => line,
    }
}

/// Parsed request envelope: the observable state of one request after a parse attempt.
///
/// When envelope parsing itself fails (oversized URI, malformed header, bad credentials, ...),
/// [`Request::parse`] still returns one of these rather than an `Err` — with whatever prefix of
/// the envelope it managed to read (notably `headers`, since `User-Agent` may already be known)
/// and `forced_error` set to the failure. This lets the dispatcher run its User-Agent filter
/// ahead of the forced error the same way it would for a fully-parsed request (spec §4.I steps
/// 1-2); only a transport-level I/O failure, where the envelope state is truly indeterminate,
/// is still surfaced as a genuine `Err`.
#[derive(Debug)]
pub(crate) struct Request {
    pub(crate) method: Method,
    pub(crate) version: Version,
    pub(crate) url: Url,
    pub(crate) resolved: Resolved,
    pub(crate) headers: HeaderMap,
    pub(crate) ticket: Ticket,
    pub(crate) body: Vec<u8>,
    pub(crate) forced_error: Option<ErrorKind>,
}

/// Every byte of a header line (name, value, and continuation lines alike) must be printable
/// ASCII or TAB (invariant I1, SPEC_FULL.md §3) — the same restriction the request-line URI
/// already enforces.
fn header_bytes_printable(line: &[u8]) -> bool {
    line.iter().all(|&b| b == b'\t' || (32..=126).contains(&b))
}

impl Request {
    /// Runs the nine-step parse protocol (request line, headers, auth ticket, body intake, path
    /// resolution) against `transport` through `reader`. Only an I/O failure comes back as `Err`;
    /// every other parse failure comes back as `Ok` with `forced_error` set (see the struct docs).
    pub(crate) async fn parse<T: tokio::io::AsyncRead + Unpin>(
        transport: &mut T,
        reader: &mut LineReader,
        limits: &ReqLimits,
        www_root: &Path,
        default_document: &str,
        user_store: &Arc<UserStore>,
    ) -> Result<Request, ErrorKind> {
        let mut method = Method::Get;
        let mut version = Version::Http11;
        let mut url = Url::default();
        let mut resolved = Resolved::default();
        let mut headers = HeaderMap::default();
        let mut ticket = Ticket::anonymous();

        let outcome: Result<(), ErrorKind> = 'parse: {
            // Step 1: request line.
            let first = reader.read_line(transport, limits.max_uri_length).await?;
            if first.overflow {
                break 'parse Err(ErrorKind::UriTooLong);
            }
            let line = strip_cr(&first.line);
            if line.is_empty() {
                break 'parse Err(ErrorKind::InvalidMethod);
            }

            // Step 2: split on whitespace runs; 2 or 3 tokens.
            let tokens: Vec<&[u8]> = line
                .split(|b| *b == b' ' || *b == b'\t')
                .filter(|t| !t.is_empty())
                .collect();
            if tokens.len() < 2 || tokens.len() > 3 {
                break 'parse Err(ErrorKind::InvalidMethod);
            }

            let method_token = tokens[0].to_ascii_uppercase();
            method = match Method::from_bytes(&method_token) {
                Ok(m) => m,
                Err(e) => break 'parse Err(e),
            };

            version = if tokens.len() == 3 {
                match Version::from_bytes(&tokens[2].to_ascii_uppercase()) {
                    Ok(v) => v,
                    Err(e) => break 'parse Err(e),
                }
            } else {
                Version::Http11
            };

            // Step 3: URI, percent-decoding, query split. Invariant I1 is enforced here, on the
            // raw wire bytes, and again below on the decoded path — `uri::decode` itself has no
            // range restriction (it is a general-purpose `0..=255` codec used by query strings and
            // form bodies too, where I1 does not apply).
            let raw_uri = tokens[1];
            if !raw_uri.iter().all(|&b| (32..=126).contains(&b)) {
                break 'parse Err(ErrorKind::InvalidUrl);
            }
            let raw_uri = match std::str::from_utf8(raw_uri) {
                Ok(s) => s,
                Err(_) => break 'parse Err(ErrorKind::InvalidUrl),
            };
            let raw_uri = if raw_uri.starts_with('/') {
                raw_uri.to_string()
            } else {
                format!("/{raw_uri}")
            };

            let (path_part, query_part) = match raw_uri.split_once('?') {
                Some((p, q)) => (p, Some(q)),
                None => (raw_uri.as_str(), None),
            };
            let decoded_path = match uri::decode(path_part.as_bytes())
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok())
            {
                Some(p) if p.bytes().all(|b| (32..=126).contains(&b)) => p,
                _ => break 'parse Err(ErrorKind::InvalidUrl),
            };

            let parameters: Vec<(String, String)> = match query_part {
                Some(q) => Query::parse::<Vec<(&[u8], &[u8])>>(q.as_bytes(), 64)
                    .unwrap_or_default()
                    .into_iter()
                    .map(|(k, v)| {
                        (
                            uri::decode(k)
                                .ok()
                                .and_then(|b| String::from_utf8(b).ok())
                                .unwrap_or_default(),
                            uri::decode(v)
                                .ok()
                                .and_then(|b| String::from_utf8(b).ok())
                                .unwrap_or_default(),
                        )
                    })
                    .collect(),
                None => Vec::new(),
            };

            // Step 4: is_folder_request.
            let ends_with_slash = decoded_path.ends_with('/');
            let has_list_param = parameters.iter().any(|(k, _)| k == "list");
            let is_folder_request = ends_with_slash && (method != Method::Get || has_list_param);

            let mut effective_path = decoded_path.clone();
            if ends_with_slash && method == Method::Get && !has_list_param {
                effective_path.push_str(default_document);
            }

            url = Url {
                path: decoded_path,
                parameters,
            };

            // Step 5: resolved_path.
            let trimmed = if is_folder_request {
                effective_path.trim_end_matches('/').to_string()
            } else {
                effective_path
            };
            let relative = trimmed.trim_start_matches('/');
            if !uri::path_safe(relative.as_bytes()) {
                break 'parse Err(ErrorKind::InvalidUrl);
            }
            let resolved_path = if relative.is_empty() {
                www_root.to_path_buf()
            } else {
                www_root.join(relative)
            };

            resolved = Resolved {
                path: resolved_path,
                is_folder_request,
            };

            // Steps 6-8: headers.
            let mut authorization_header: Option<String> = None;
            loop {
                if headers.headers.len() >= limits.max_header_count {
                    break 'parse Err(ErrorKind::HeadersTooLarge);
                }

                let result = reader.read_line(transport, limits.max_header_length).await?;
                if result.overflow {
                    break 'parse Err(ErrorKind::HeadersTooLarge);
                }
                let line = strip_cr(&result.line);
                if line.is_empty() {
                    break;
                }
                if !header_bytes_printable(line) {
                    break 'parse Err(ErrorKind::InvalidHeader);
                }

                // Step 7: continuation line.
                if (line[0] == b' ' || line[0] == b'\t') && !headers.headers.is_empty() {
                    let continuation = match std::str::from_utf8(line) {
                        Ok(s) => s.trim(),
                        Err(_) => break 'parse Err(ErrorKind::InvalidHeader),
                    };
                    let last = headers.headers.last_mut().unwrap();
                    last.value.push(' ');
                    last.value.push_str(continuation);
                    continue;
                }

                // Step 8: name/value split, capitalize name.
                let colon = match memchr(b':', line) {
                    Some(c) => c,
                    None => break 'parse Err(ErrorKind::InvalidHeader),
                };
                let name = match std::str::from_utf8(&line[..colon]) {
                    Ok(s) => s,
                    Err(_) => break 'parse Err(ErrorKind::InvalidHeader),
                };
                let value = match std::str::from_utf8(&line[colon + 1..]) {
                    Ok(s) => s.trim().to_string(),
                    Err(_) => break 'parse Err(ErrorKind::InvalidHeader),
                };
                let name = crate::http::types::capitalize_header_name(name.trim());

                if name.eq_ignore_ascii_case("authorization") {
                    authorization_header = Some(value.clone());
                }

                headers.push(name, value);
            }

            // Step 9: Basic auth ticket derivation.
            ticket = match authorization_header {
                Some(header_value) => match parse_basic_ticket(&header_value, user_store).await {
                    Ok(t) => t,
                    Err(e) => break 'parse Err(e),
                },
                None => Ticket::anonymous(),
            };

            Ok(())
        };

        Ok(Request {
            method,
            version,
            url,
            resolved,
            headers,
            ticket,
            body: Vec::new(),
            forced_error: outcome.err(),
        })
    }

    pub(crate) fn content_length(&self) -> Option<usize> {
        self.headers
            .get("Content-Length")
            .and_then(|v| v.trim().parse().ok())
    }

    pub(crate) fn extension(&self) -> Option<&str> {
        self.resolved
            .path
            .extension()
            .and_then(|e| e.to_str())
    }
}

async fn parse_basic_ticket(
    header_value: &str,
    user_store: &Arc<UserStore>,
) -> Result<Ticket, ErrorKind> {
    let encoded = header_value
        .strip_prefix("Basic ")
        .ok_or(ErrorKind::InvalidAuthorization)?;
    let decoded = BASE64
        .decode(encoded.trim())
        .map_err(|_| ErrorKind::InvalidAuthorization)?;
    let decoded = String::from_utf8(decoded).map_err(|_| ErrorKind::InvalidAuthorization)?;
    let (username, password) = decoded
        .split_once(':')
        .ok_or(ErrorKind::InvalidAuthorization)?;

    user_store
        .authenticate(username, password)
        .await
        .ok_or(ErrorKind::unauthorized(true))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn reads_single_line_under_limit() {
        let mut cursor = Cursor::new(b"GET / HTTP/1.1\r\n".to_vec());
        let mut reader = LineReader::new();
        let result = reader.read_line(&mut cursor, 4096).await.unwrap();
        assert!(!result.overflow);
        assert_eq!(strip_cr(&result.line), b"GET / HTTP/1.1");
    }

    #[tokio::test]
    async fn overflows_when_line_exceeds_cap() {
        let mut cursor = Cursor::new(vec![b'a'; 100]);
        let mut reader = LineReader::new();
        let result = reader.read_line(&mut cursor, 10).await.unwrap();
        assert!(result.overflow);
        assert_eq!(result.line.len(), 10);
    }

    #[tokio::test]
    async fn reads_multiple_lines_in_sequence() {
        let mut cursor = Cursor::new(b"line one\r\nline two\r\n".to_vec());
        let mut reader = LineReader::new();
        let first = reader.read_line(&mut cursor, 4096).await.unwrap();
        let second = reader.read_line(&mut cursor, 4096).await.unwrap();
        assert_eq!(strip_cr(&first.line), b"line one");
        assert_eq!(strip_cr(&second.line), b"line two");
    }

    #[tokio::test]
    async fn header_count_boundary_matches_spec() {
        let mut body = String::new();
        for i in 0..25 {
            body.push_str(&format!("X-H{i}: v\r\n"));
        }
        body.push_str("\r\n");
        let mut cursor = Cursor::new(body.into_bytes());
        let mut reader = LineReader::new();
        let mut count = 0;
        loop {
            let result = reader.read_line(&mut cursor, 8192).await.unwrap();
            let line = strip_cr(&result.line);
            if line.is_empty() {
                break;
            }
            count += 1;
        }
        assert_eq!(count, 25);
    }

    fn test_limits() -> ReqLimits {
        ReqLimits {
            max_uri_length: 4096,
            max_header_length: 8192,
            max_header_count: 25,
            max_request_content_length: 4_194_304,
            request_content_read_timeout: std::time::Duration::from_secs(300),
            request_post_content_read_timeout: std::time::Duration::from_secs(30),
        }
    }

    #[tokio::test]
    async fn parse_succeeds_with_no_forced_error() {
        let mut cursor = Cursor::new(b"GET /index.html HTTP/1.1\r\nHost: x\r\n\r\n".to_vec());
        let mut reader = LineReader::new();
        let users = UserStore::for_tests("pepper", vec![]);
        let request = Request::parse(
            &mut cursor,
            &mut reader,
            &test_limits(),
            Path::new("/tmp"),
            "index.html",
            &users,
        )
        .await
        .unwrap();
        assert!(request.forced_error.is_none());
        assert_eq!(request.method, Method::Get);
        assert_eq!(request.url.path, "/index.html");
    }

    #[tokio::test]
    async fn parse_carries_forced_error_through_headers_already_read() {
        // The request line alone already overflows `max_uri_length`; nothing past it is parsed,
        // so `User-Agent` is unavailable, matching `forced_error` carrying no headers here.
        let mut cursor = Cursor::new(vec![b'a'; 100]);
        let mut reader = LineReader::new();
        let users = UserStore::for_tests("pepper", vec![]);
        let mut limits = test_limits();
        limits.max_uri_length = 10;
        let request = Request::parse(
            &mut cursor,
            &mut reader,
            &limits,
            Path::new("/tmp"),
            "index.html",
            &users,
        )
        .await
        .unwrap();
        assert_eq!(request.forced_error, Some(ErrorKind::UriTooLong));
        assert!(request.headers.headers.is_empty());
    }

    #[tokio::test]
    async fn parse_rejects_non_printable_header_byte() {
        let body = b"GET / HTTP/1.1\r\nX-Bad: \x01value\r\n\r\n".to_vec();
        let mut cursor = Cursor::new(body);
        let mut reader = LineReader::new();
        let users = UserStore::for_tests("pepper", vec![]);
        let request = Request::parse(
            &mut cursor,
            &mut reader,
            &test_limits(),
            Path::new("/tmp"),
            "index.html",
            &users,
        )
        .await
        .unwrap();
        assert_eq!(request.forced_error, Some(ErrorKind::InvalidHeader));
    }

    #[tokio::test]
    async fn parse_preserves_headers_read_before_a_later_failure() {
        // `User-Agent` lands before the header that breaks parsing, so the dispatcher's
        // User-Agent filter can still see it even though the request overall fails.
        let mut cursor = Cursor::new(
            b"GET / HTTP/1.1\r\nUser-Agent: probe\r\nX-Bad: \x7fvalue\r\n\r\n".to_vec(),
        );
        let mut reader = LineReader::new();
        let users = UserStore::for_tests("pepper", vec![]);
        let request = Request::parse(
            &mut cursor,
            &mut reader,
            &test_limits(),
            Path::new("/tmp"),
            "index.html",
            &users,
        )
        .await
        .unwrap();
        assert_eq!(request.forced_error, Some(ErrorKind::InvalidHeader));
        assert_eq!(request.headers.get("User-Agent"), Some("probe"));
    }
}
