//! originserve - a filesystem-rooted HTTP/1.1 origin server.
//!
//! Serves a document tree over plain TCP and TLS with a verb-complete REST surface
//! (GET/PUT/DELETE/HEAD/OPTIONS/TRACE/POST) and a path-scoped, `.auth`-file-driven
//! authorization layer. Only `Content-Length` framing is supported; there is no HTTP/2,
//! no chunked transfer encoding, and no virtual hosting.
//!
//! The crate is built as a thin binary (`src/main.rs`) over this library: [`run`] does the
//! whole startup sequence (configuration, user store, authorization tree) and hands off to
//! the acceptor loops in [`server::server_impl`].

pub(crate) mod app;
pub(crate) mod auth {
    pub(crate) mod authorization;
    pub(crate) mod users;
}
pub(crate) mod config;
pub(crate) mod content;
pub(crate) mod dispatch;
pub(crate) mod errors;
pub(crate) mod http {
    pub(crate) mod query;
    pub(crate) mod request;
    pub(crate) mod response;
    pub(crate) mod types;
    pub(crate) mod uri;
}
pub(crate) mod limits;
pub(crate) mod server {
    pub(crate) mod connection;
    pub(crate) mod registry;
    pub(crate) mod server_impl;
    pub(crate) mod transport;
}

pub use crate::app::run;

/// Sync pre-read of the `threads` config key, for sizing the Tokio runtime in `main` before any
/// async machinery exists to load the configuration the normal way.
pub fn peek_thread_count(explicit_config_path: Option<&str>) -> usize {
    crate::config::Config::peek_threads(explicit_config_path)
}

#[doc(hidden)]
#[cfg(test)]
pub(crate) mod tools {
    use std::str::from_utf8;

    #[inline]
    pub(crate) fn str_op(value: &[u8]) -> &str {
        from_utf8(value).unwrap()
    }

    #[inline]
    pub(crate) fn str_2<'a>(value: (&'a [u8], &'a [u8])) -> (&'a str, &'a str) {
        (from_utf8(value.0).unwrap(), from_utf8(value.1).unwrap())
    }
}
