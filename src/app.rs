//! Startup sequencing: argument parsing, configuration loading/generation, user-store bootstrap,
//! authorization-tree construction, and the hand-off into
//! [`server::server_impl::launch`](crate::server::server_impl::launch).
//!
//! Grounded on `original_source/main.cpp`: the same shape (resolve a config path, create a
//! default configuration and a default `root` user on first run, then build and launch the
//! server) with every C++ exception-to-stderr catch collapsed into one `Result<_, String>`
//! chain that exits non-zero on the first failure.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use tracing::{error, info};

use crate::auth::authorization::AuthorizationTree;
use crate::auth::users::UserStore;
use crate::config::Config;
use crate::dispatch::AppState;
use crate::server::server_impl;

const DEFAULT_CONFIG_FILE: &str = "originserve.config";
const USERS_FILE: &str = ".users";
const ERROR_PAGES_DIR: &str = "error-pages";

/// Parses the CLI arguments, builds the shared [`AppState`], and runs the server to completion
/// (gracefully shutting down on SIGINT/SIGTERM/SIGQUIT). Returns a non-zero exit code for
/// any startup failure.
pub async fn run() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() > 1 {
        error!("supply only one argument: the path to a configuration file");
        return ExitCode::FAILURE;
    }

    let config = match resolve_config(args.into_iter().next()).await {
        Ok(config) => config,
        Err(err) => {
            error!("{err}");
            return ExitCode::FAILURE;
        }
    };

    let state = match build_state(config).await {
        Ok(state) => state,
        Err(err) => {
            error!("{err}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(err) = server_impl::launch(state).await {
        error!("{err}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

/// Resolves the configuration file to use: the single CLI argument if supplied (must already
/// exist), otherwise `originserve.config` relative to the working directory, generated with
/// defaults on first run.
async fn resolve_config(explicit_path: Option<String>) -> Result<Config, String> {
    match explicit_path {
        Some(path) => {
            let path = PathBuf::from(path);
            if !path.exists() {
                return Err(format!(
                    "configuration file '{}' does not exist",
                    path.display()
                ));
            }
            Config::load(&path).await.map_err(|e| e.to_string())
        }
        None => {
            let path = PathBuf::from(DEFAULT_CONFIG_FILE);
            if path.exists() {
                Config::load(&path).await.map_err(|e| e.to_string())
            } else {
                info!(path = DEFAULT_CONFIG_FILE, "generating default configuration");
                Config::generate_default(&path)
                    .await
                    .map_err(|e| e.to_string())
            }
        }
    }
}

/// Builds the shared, read-only [`AppState`]: loads (or bootstraps) the user store, walks
/// `www-root` for `.auth` files, and derives the per-component limit structs from `config`.
/// The result is immutable for the lifetime of the process.
async fn build_state(config: Config) -> Result<Arc<AppState>, String> {
    let www_root: String = config.get_or("www-root", "www-root".to_string());
    // Canonicalized once here so that every later path comparison — the authorization tree's
    // keys (built below) and each request's `resolved_path` (joined against this same field in
    // `http::request::Request::parse`) — walks the same absolute, symlink-resolved prefix
    // (spec invariant I2).
    let www_root = std::fs::canonicalize(&www_root)
        .map_err(|e| format!("www-root '{www_root}': {e}"))?;

    let salt: String = config
        .require("server-salt")
        .map_err(|e| e.to_string())?;

    let users = UserStore::load_or_bootstrap(PathBuf::from(USERS_FILE), salt)
        .await
        .map_err(|e| format!("loading {USERS_FILE}: {e:?}"))?;

    let authz = AuthorizationTree::build(&www_root)
        .await
        .map_err(|e| format!("building authorization tree: {}", e.0))?;

    let server_limits = config.derive_server_limits();
    let req_limits = config.derive_req_limits();
    let mime_table = config.mime_table();

    Ok(Arc::new(AppState {
        config: Arc::new(config),
        users,
        authz: Arc::new(authz),
        mime_table: Arc::new(mime_table),
        www_root,
        error_pages_dir: PathBuf::from(ERROR_PAGES_DIR),
        server_limits,
        req_limits,
    }))
}
