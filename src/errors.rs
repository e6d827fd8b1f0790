//! Error taxonomy shared by the envelope parser and the handler dispatch pipeline.
//!
//! Every variant maps to exactly one [`StatusCode`] via [`ErrorKind::status`]; the connection
//! layer and the dispatcher both funnel failures through [`crate::content::respond_error`], which
//! renders `error-pages/<code>.html` and closes the connection — error responses never keep-alive.

use crate::http::types::StatusCode;
use std::{error, fmt, io};

#[derive(Debug, PartialEq)]
pub(crate) enum ErrorKind {
    // Envelope parsing
    InvalidMethod,
    InvalidUrl,
    InvalidVersion,
    InvalidHeader,
    UriTooLong,
    HeadersTooLarge,
    InvalidContentLength,

    // Authentication/authorization
    InvalidAuthorization,
    Unauthorized { allow_authenticate: bool },
    Forbidden,

    // Dispatch
    NotFound,
    MethodNotAllowed,
    NotImplemented,

    // Content intake
    ContentTooLarge,
    InternalError,

    /// Any I/O failure. The envelope state is indeterminate: no status line is written,
    /// the connection just closes.
    Io(IoError),
}

impl ErrorKind {
    pub(crate) const fn unauthorized(allow_authenticate: bool) -> Self {
        ErrorKind::Unauthorized { allow_authenticate }
    }

    /// The status code an `error_handler` would serve for this failure. `Io` has no real status
    /// (callers must check for it before trying to render a page); 500 just keeps this total.
    pub(crate) const fn status(&self) -> StatusCode {
        match self {
            ErrorKind::InvalidMethod
            | ErrorKind::InvalidUrl
            | ErrorKind::InvalidVersion
            | ErrorKind::InvalidHeader
            | ErrorKind::InvalidContentLength => StatusCode::BadRequest,
            // Malformed `Authorization` is treated as a security error: it gets the same 401
            // treatment as a failed credential check, not a generic 400.
            ErrorKind::InvalidAuthorization => StatusCode::Unauthorized,
            ErrorKind::UriTooLong => StatusCode::UriTooLong,
            ErrorKind::HeadersTooLarge => StatusCode::RequestHeaderFieldsTooLarge,
            ErrorKind::Unauthorized { .. } => StatusCode::Unauthorized,
            ErrorKind::Forbidden => StatusCode::Forbidden,
            ErrorKind::NotFound => StatusCode::NotFound,
            ErrorKind::MethodNotAllowed => StatusCode::MethodNotAllowed,
            ErrorKind::NotImplemented => StatusCode::NotImplemented,
            ErrorKind::ContentTooLarge | ErrorKind::InternalError | ErrorKind::Io(_) => {
                StatusCode::InternalServerError
            }
        }
    }

    /// Whether `WWW-Authenticate` should accompany a 401 for this failure: only when
    /// authentication could plausibly succeed.
    pub(crate) const fn allow_authenticate(&self) -> bool {
        match self {
            ErrorKind::Unauthorized { allow_authenticate } => *allow_authenticate,
            ErrorKind::InvalidAuthorization => true,
            _ => false,
        }
    }
}

impl error::Error for ErrorKind {}
impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<io::Error> for ErrorKind {
    fn from(err: io::Error) -> Self {
        ErrorKind::Io(IoError(err))
    }
}

#[derive(Debug)]
pub(crate) struct IoError(pub(crate) io::Error);

impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        self.0.kind() == other.0.kind()
    }
}
