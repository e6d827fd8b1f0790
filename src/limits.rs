//! Connection and request limits, derived from [`Config`](crate::config::Config) at startup.
//!
//! Every field here maps to one of the `max-*`/`*-timeout` configuration keys in spec section 6;
//! the structs themselves stay internal (the teacher's public, independently-tunable `ServerLimits`
//! / `ConnLimits` / `ReqLimits` split is kept) but callers reach them only through
//! `Config::derive_*` constructors.

use std::time::Duration;

/// Server-wide admission and reporting behavior.
#[derive(Debug, Clone)]
pub(crate) struct ServerLimits {
    /// `max-connections-per-client` - per-IP concurrent connection cap.
    pub(crate) max_connections_per_client: usize,
    /// `threads` - thread-pool size (thread-pool mode only).
    pub(crate) threads: usize,
    /// `provide-server-info` - whether to emit the `Server` standard header.
    pub(crate) provide_server_info: bool,
    /// `static-response-headers`, already split on `|`.
    pub(crate) static_response_headers: Vec<String>,
}

/// Per-connection timers (component G).
#[derive(Debug, Clone, Copy)]
pub(crate) struct ConnLimits {
    /// `connection-ssl-handshake-timeout`.
    pub(crate) ssl_handshake_timeout: Duration,
    /// `connection-keep-alive-timeout`.
    pub(crate) keep_alive_timeout: Duration,
}

/// Envelope parsing limits (component D).
#[derive(Debug, Clone, Copy)]
pub(crate) struct ReqLimits {
    /// `max-uri-length`.
    pub(crate) max_uri_length: usize,
    /// `max-header-length`.
    pub(crate) max_header_length: usize,
    /// `max-header-count`.
    pub(crate) max_header_count: usize,
    /// `max-request-content-length`.
    pub(crate) max_request_content_length: usize,
    /// `request-content-read-timeout`.
    pub(crate) request_content_read_timeout: Duration,
    /// `request-post-content-read-timeout`.
    pub(crate) request_post_content_read_timeout: Duration,
}
