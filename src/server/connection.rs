//! Per-connection state machine. The TLS handshake (if any) has already completed by the time
//! `run` is called; this module only drives the Ready/Reading/Dispatching/Closing cycle for one
//! transport until it closes, errors, or a shutdown signal arrives.
//!
//! Grounded on the connection library's `HttpConnection::run`/`impl_run` main loop: the same
//! "reset, read, handle, write, check keep-alive" shape, with the HTTP/0.9 branch and
//! `ConnectionData`/`ConnectionFilter` extension points dropped (no counterpart needed here) and
//! a `tokio::select!` race against a shutdown watch added at the top of every iteration, so
//! SIGINT/SIGTERM/SIGQUIT close idle connections promptly instead of only refusing new ones.

use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::debug;

use crate::content;
use crate::dispatch::{self, AppState};
use crate::errors::ErrorKind;
use crate::http::request::{LineReader, Request};
use crate::http::types::Version;
use crate::limits::ConnLimits;
use crate::server::transport::Transport;

/// Drives one accepted connection through its full keep-alive lifetime. The caller
/// (`server::server_impl`) is responsible for per-IP registry bookkeeping; this function only
/// owns the socket and the request loop.
pub(crate) async fn run(
    mut transport: Transport,
    conn_limits: ConnLimits,
    state: Arc<AppState>,
    mut shutdown: watch::Receiver<bool>,
) {
    let _ = transport.set_nodelay(true);
    let is_secure = transport.is_secure();
    let mut reader = LineReader::new();
    let default_document: String =
        state.config.get_or("default-document", "index.html".to_string());

    loop {
        let parsed = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            result = timeout(
                conn_limits.keep_alive_timeout,
                Request::parse(
                    &mut transport,
                    &mut reader,
                    &state.req_limits,
                    &state.www_root,
                    &default_document,
                    &state.users,
                ),
            ) => result,
        };

        // Keep-alive timer expired while waiting for the next request: close without a response,
        // this is an idle connection, not an error.
        let Ok(parse_result) = parsed else { break };

        let mut request = match parse_result {
            Ok(request) => request,
            // Indeterminate envelope state: no status line is ever written for a raw I/O failure.
            // Every other envelope parse failure comes back as `Ok` with `request.forced_error`
            // set instead of `Err` here, so it still reaches `dispatch`'s User-Agent filter before
            // being rendered (spec §4.I steps 1-2) rather than bypassing it.
            Err(ErrorKind::Io(e)) => {
                debug!("connection error: {}", e.0);
                break;
            }
            Err(err) => {
                write_error(&mut transport, Version::Http11, err, is_secure, &state).await;
                break;
            }
        };

        let outcome = dispatch::dispatch(&mut request, &mut reader, &mut transport, is_secure, &state).await;

        let keep_alive = match outcome {
            Ok(outcome) => {
                // The dispatcher's own keep-alive decision (error/redirect/success) still yields
                // to an explicit client request to close (original source's
                // `request::handle`'s post-dispatch `Connection: close` check).
                let client_requested_close = request
                    .headers
                    .get("Connection")
                    .is_some_and(|value| value.eq_ignore_ascii_case("close"));
                outcome.keep_alive && !client_requested_close
            }
            Err(ErrorKind::Io(e)) => {
                debug!("connection error: {}", e.0);
                false
            }
            Err(err) => {
                write_error(&mut transport, request.version, err, is_secure, &state).await;
                false
            }
        };

        if !keep_alive {
            break;
        }
    }

    let _ = transport.shutdown().await;
}

/// Renders the error page for an envelope-parse failure. A failure that could plausibly have
/// succeeded with different credentials (a malformed or rejected `Authorization` header) still
/// gets the same conditional `WWW-Authenticate` challenge as a dispatch-level 401 (spec §4.I,
/// "Unauthorized handler"), so a client retrying with Basic auth has somewhere to send it.
async fn write_error(
    transport: &mut Transport,
    version: Version,
    err: ErrorKind,
    is_secure: bool,
    state: &AppState,
) {
    let authenticate_over_non_ssl: bool = state.config.get_or("authenticate-over-non-ssl", false);
    let status = err.status();
    let challenge = err.allow_authenticate() && (is_secure || authenticate_over_non_ssl);

    let bytes = if challenge {
        content::respond_error_with_challenge(version, status, &state.error_pages_dir, &state.server_limits)
            .await
    } else {
        content::respond_error(version, status, &state.error_pages_dir, &state.server_limits).await
    };
    let _ = transport.write_all(&bytes).await;
}
