//! Core wire types: method, version, status code, URL and header storage.

use crate::errors::ErrorKind;
use std::path::PathBuf;

/// Capitalizes a header name to canonical form: the first character and any character following
/// a `-` are uppercased, everything else is lowercased (`content-type` -> `Content-Type`).
pub(crate) fn capitalize_header_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut start_of_word = true;

    for ch in name.chars() {
        if start_of_word {
            out.extend(ch.to_uppercase());
        } else {
            out.extend(ch.to_lowercase());
        }
        start_of_word = ch == '-';
    }

    out
}

// METHOD

/// HTTP request methods.
///
/// The verb set is closed to exactly the seven methods the origin server dispatcher
/// understands; everything else fails parsing with [`ErrorKind::InvalidMethod`] rather
/// than being represented and then rejected downstream.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub(crate) enum Method {
    Get,
    Put,
    Post,
    Head,
    Delete,
    Options,
    Trace,
}

impl Method {
    #[inline]
    pub(crate) fn from_bytes(src: &[u8]) -> Result<Self, ErrorKind> {
        match src {
            b"GET" => Ok(Method::Get),
            b"PUT" => Ok(Method::Put),
            b"POST" => Ok(Method::Post),
            b"HEAD" => Ok(Method::Head),
            b"DELETE" => Ok(Method::Delete),
            b"OPTIONS" => Ok(Method::Options),
            b"TRACE" => Ok(Method::Trace),
            _ => Err(ErrorKind::InvalidMethod),
        }
    }

    /// The token as it appears on the wire, e.g. for TRACE echo and `Allow` headers.
    pub(crate) const fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Put => "PUT",
            Method::Post => "POST",
            Method::Head => "HEAD",
            Method::Delete => "DELETE",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
        }
    }

    pub(crate) const ALL: [Method; 7] = [
        Method::Get,
        Method::Put,
        Method::Post,
        Method::Head,
        Method::Delete,
        Method::Options,
        Method::Trace,
    ];
}

// VERSION

/// HTTP protocol version. Only HTTP/1.0 and HTTP/1.1 are on the wire — no HTTP/2, no chunked
/// transfer-encoding, no HTTP/0.9.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub(crate) enum Version {
    Http10,
    Http11,
}

impl Version {
    #[inline]
    pub(crate) fn from_bytes(src: &[u8]) -> Result<Self, ErrorKind> {
        match src {
            b"HTTP/1.1" => Ok(Self::Http11),
            b"HTTP/1.0" => Ok(Self::Http10),
            _ => Err(ErrorKind::InvalidVersion),
        }
    }

    pub(crate) const fn as_str(&self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }
}

// STATUS CODE

/// An HTTP status code paired with its reason phrase.
///
/// Unlike a closed RFC-status enum, this stays an open `u16` so unknown codes can still fall
/// back to a generic reason based on the hundreds digit. Known codes get a fixed reason string;
/// everything else falls back to `<digit>xx <Category>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct StatusCode(pub(crate) u16);

#[allow(non_upper_case_globals)]
impl StatusCode {
    pub(crate) const Ok: StatusCode = StatusCode(200);
    pub(crate) const NotModified: StatusCode = StatusCode(304);
    pub(crate) const MovedTemporarily: StatusCode = StatusCode(307);
    pub(crate) const BadRequest: StatusCode = StatusCode(400);
    pub(crate) const Unauthorized: StatusCode = StatusCode(401);
    pub(crate) const Forbidden: StatusCode = StatusCode(403);
    pub(crate) const NotFound: StatusCode = StatusCode(404);
    pub(crate) const MethodNotAllowed: StatusCode = StatusCode(405);
    pub(crate) const RequestHeaderFieldsTooLarge: StatusCode = StatusCode(413);
    pub(crate) const UriTooLong: StatusCode = StatusCode(414);
    pub(crate) const InternalServerError: StatusCode = StatusCode(500);
    pub(crate) const NotImplemented: StatusCode = StatusCode(501);

    pub(crate) fn reason(&self) -> &'static str {
        match self.0 {
            200 => "OK",
            304 => "Not Modified",
            307 => "Moved Temporarily",
            401 => "Unauthorized",
            403 => "Forbidden",
            404 => "Not Found",
            405 => "Method Not Allowed",
            413 => "Request Header Too Long",
            414 => "Request-URI Too Long",
            500 => "Internal Server Error",
            501 => "Not Implemented",
            100..=199 => "Informational",
            200..=299 => "Success",
            300..=399 => "Redirection",
            400..=499 => "Client Error",
            _ => "Server Error",
        }
    }

    pub(crate) fn first_line(&self, version: Version) -> String {
        format!("{} {} {}\r\n", version.as_str(), self.0, self.reason())
    }
}

// URL

/// The parsed request target: the decoded absolute path, the query parameters, and the
/// folder/file resolution derived from them.
#[derive(Debug, Clone, Default)]
pub(crate) struct Url {
    /// Decoded, absolute path (begins with `/`), parameters stripped.
    pub(crate) path: String,
    /// Ordered `(name, value)` pairs from the query string; value may be empty.
    pub(crate) parameters: Vec<(String, String)>,
}

impl Url {
    pub(crate) fn has_parameter(&self, key: &str) -> bool {
        self.parameters.iter().any(|(k, _)| k == key)
    }
}

// TICKET

/// `(username, role)` derived from successful Basic authentication; an empty username means
/// the request is unauthenticated (spec glossary, "Ticket").
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Ticket {
    pub(crate) username: String,
    pub(crate) role: String,
}

impl Ticket {
    pub(crate) fn anonymous() -> Self {
        Self::default()
    }

    pub(crate) fn is_authenticated(&self) -> bool {
        !self.username.is_empty()
    }
}

// HEADER

/// One request header, name already capitalized per [`capitalize_header_name`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Header {
    pub(crate) name: String,
    pub(crate) value: String,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct HeaderMap {
    pub(crate) headers: Vec<Header>,
}

impl HeaderMap {
    #[inline]
    pub(crate) fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    #[inline]
    pub(crate) fn push(&mut self, name: String, value: String) {
        self.headers.push(Header { name, value });
    }
}

/// Filesystem resolution derived from the decoded URL (spec invariants I2/I3).
#[derive(Debug, Clone, Default)]
pub(crate) struct Resolved {
    pub(crate) path: PathBuf,
    pub(crate) is_folder_request: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_name_capitalization() {
        assert_eq!(capitalize_header_name("content-type"), "Content-Type");
        assert_eq!(capitalize_header_name("HOST"), "Host");
        assert_eq!(capitalize_header_name("x-forwarded-for"), "X-Forwarded-For");
        assert_eq!(capitalize_header_name("authorization"), "Authorization");
    }

    #[test]
    fn status_reason_known_and_fallback() {
        assert_eq!(StatusCode(200).reason(), "OK");
        assert_eq!(StatusCode(418).reason(), "Client Error");
        assert_eq!(StatusCode(599).reason(), "Server Error");
    }

    #[test]
    fn method_round_trips_known_tokens() {
        for m in Method::ALL {
            assert_eq!(Method::from_bytes(m.as_str().as_bytes()).unwrap(), m);
        }
        assert!(Method::from_bytes(b"PATCH").is_err());
    }
}
