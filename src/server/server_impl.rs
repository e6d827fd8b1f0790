//! The two-listener acceptor: one plain-TCP listener, one TLS listener, both feeding the same
//! [`connection::run`](crate::server::connection::run) loop over a shared [`AppState`].
//!
//! Grounded on the connection library's `Server`/`ServerBuilder`, generalized from its fixed
//! `crossbeam::SegQueue` worker-pool pattern — spawning one task per accepted connection and
//! letting the Tokio scheduler place it instead — to a pair of `tokio::select!` accept loops
//! racing a shared shutdown signal. The TLS setup itself is grounded on
//! `other_examples/.../prison-network-src-main.rs.rs`'s `tokio-rustls` usage.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::dispatch::AppState;
use crate::limits::ConnLimits;
use crate::server::connection;
use crate::server::registry::Registry;
use crate::server::transport::Transport;

#[derive(Debug)]
pub(crate) struct ServerError(pub(crate) String);

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "server error: {}", self.0)
    }
}

impl std::error::Error for ServerError {}

/// Loads the certificate chain and private key named by `ssl-certificate`/`ssl-private-key` and
/// builds a single-cert, no-client-auth `rustls` server config.
fn load_tls_config(cert_path: &str, key_path: &str) -> Result<Arc<ServerConfig>, ServerError> {
    let cert_bytes = std::fs::read(cert_path)
        .map_err(|e| ServerError(format!("reading {cert_path}: {e}")))?;
    let key_bytes =
        std::fs::read(key_path).map_err(|e| ServerError(format!("reading {key_path}: {e}")))?;

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_bytes.as_slice())
        .collect::<Result<_, _>>()
        .map_err(|e| ServerError(format!("parsing {cert_path}: {e}")))?;
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_bytes.as_slice())
        .map_err(|e| ServerError(format!("parsing {key_path}: {e}")))?
        .ok_or_else(|| ServerError(format!("{key_path}: no private key found")))?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ServerError(format!("building TLS config: {e}")))?;
    Ok(Arc::new(config))
}

/// Accepts plain connections until `shutdown` fires, spawning one `connection::run` task per
/// accepted socket.
async fn accept_plain(
    listener: TcpListener,
    registry: Arc<Registry>,
    conn_limits: ConnLimits,
    state: Arc<AppState>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            result = listener.accept() => result,
        };
        let (stream, addr) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                error!("TCP accept error: {e}");
                continue;
            }
        };
        spawn_connection(
            Transport::Plain(stream),
            addr.ip(),
            Arc::clone(&registry),
            conn_limits,
            Arc::clone(&state),
            shutdown.clone(),
        );
    }
}

/// Accepts TLS connections until `shutdown` fires. The handshake itself runs inside the spawned
/// task (bounded by `connection-ssl-handshake-timeout`) so one slow or hostile handshake never
/// blocks the accept loop for everyone else.
async fn accept_tls(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    registry: Arc<Registry>,
    conn_limits: ConnLimits,
    state: Arc<AppState>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            result = listener.accept() => result,
        };
        let (stream, addr) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                error!("TCP accept error: {e}");
                continue;
            }
        };
        let acceptor = acceptor.clone();
        let registry = Arc::clone(&registry);
        let state = Arc::clone(&state);
        let shutdown = shutdown.clone();
        let handshake_timeout = conn_limits.ssl_handshake_timeout;

        tokio::spawn(async move {
            let tls_stream = match timeout(handshake_timeout, acceptor.accept(stream)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    debug!(%addr, "TLS handshake failed: {e}");
                    return;
                }
                Err(_) => {
                    debug!(%addr, "TLS handshake timed out");
                    return;
                }
            };
            spawn_connection(
                Transport::Tls(Box::new(tls_stream)),
                addr.ip(),
                registry,
                conn_limits,
                state,
                shutdown,
            );
        });
    }
}

/// Admits `transport` through the per-IP registry and, if accepted, runs the connection to
/// completion in its own task, freeing the registry slot on exit either way. Rejected
/// connections are simply dropped without a response — there is no connection yet to write one
/// to.
fn spawn_connection(
    transport: Transport,
    ip: IpAddr,
    registry: Arc<Registry>,
    conn_limits: ConnLimits,
    state: Arc<AppState>,
    shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let Some(id) = registry
            .try_insert(ip, state.server_limits.max_connections_per_client)
            .await
        else {
            debug!(%ip, "refusing connection: per-client quota exceeded");
            return;
        };
        connection::run(transport, conn_limits, state, shutdown).await;
        registry.remove(ip, id).await;
    });
}

/// Binds whichever of the plain/TLS listeners are enabled (`port`/`ssl-port`, `-1` disables one),
/// spawns their accept loops, and blocks until a termination signal arrives, then waits for the
/// accept loops to notice the shutdown signal and finish gracefully.
pub(crate) async fn launch(state: Arc<AppState>) -> Result<(), ServerError> {
    let address: String = state.config.get_or("address", "localhost".to_string());
    let port: i64 = state.config.get_or("port", 8080);
    let ssl_port: i64 = state.config.get_or("ssl-port", -1);

    let registry = Arc::new(Registry::new());
    let conn_limits = state.config.derive_conn_limits();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut tasks = Vec::new();

    if port >= 0 {
        let bind_addr = format!("{address}:{port}");
        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|e| ServerError(format!("binding {bind_addr}: {e}")))?;
        info!(%bind_addr, "plain listener ready");
        tasks.push(tokio::spawn(accept_plain(
            listener,
            Arc::clone(&registry),
            conn_limits,
            Arc::clone(&state),
            shutdown_rx.clone(),
        )));
    }

    if ssl_port >= 0 {
        let cert_path: String = state.config.get_or("ssl-certificate", "server.crt".to_string());
        let key_path: String = state.config.get_or("ssl-private-key", "server.key".to_string());
        let tls_config = load_tls_config(&cert_path, &key_path)?;
        let acceptor = TlsAcceptor::from(tls_config);

        let bind_addr = format!("{address}:{ssl_port}");
        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|e| ServerError(format!("binding {bind_addr}: {e}")))?;
        info!(%bind_addr, "tls listener ready");
        tasks.push(tokio::spawn(accept_tls(
            listener,
            acceptor,
            Arc::clone(&registry),
            conn_limits,
            Arc::clone(&state),
            shutdown_rx.clone(),
        )));
    }

    if tasks.is_empty() {
        return Err(ServerError(
            "both `port` and `ssl-port` are disabled, nothing to listen on".to_string(),
        ));
    }

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, closing listeners");
    let _ = shutdown_tx.send(true);

    for task in tasks {
        let _ = task.await;
    }
    Ok(())
}

/// Resolves on the first SIGINT, SIGTERM, or SIGQUIT.
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            warn!("failed to install SIGINT handler: {e}");
            return;
        }
    };
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!("failed to install SIGTERM handler: {e}");
            return;
        }
    };
    let mut sigquit = match signal(SignalKind::quit()) {
        Ok(s) => s,
        Err(e) => {
            warn!("failed to install SIGQUIT handler: {e}");
            return;
        }
    };

    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
        _ = sigquit.recv() => {}
    }
}
