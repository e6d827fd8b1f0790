//! Handler dispatch: the ordered-checks pipeline and the closed set of per-verb handlers.
//! Modeled as an `enum Route` rather than the connection library's open `Handler` trait, because
//! this server's verb/action set is closed, not user-extensible — the `Handler` trait still
//! exists as the one outer integration seam (`server::connection` calls into this module
//! exactly the way it would call a type implementing `Handler`).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::fs;
use tokio::io::AsyncWrite;

use crate::auth::authorization::AuthorizationTree;
use crate::auth::users::UserStore;
use crate::config::Config;
use crate::content;
use crate::errors::ErrorKind;
use crate::http::request::{LineReader, Request};
use crate::http::response::Response;
use crate::http::types::{Method, StatusCode, Version};
use crate::limits::{ReqLimits, ServerLimits};

/// Everything a request needs to be dispatched, built once at startup and shared via `Arc`.
/// Configuration, authorization tree, and MIME table are all read-only after startup.
pub(crate) struct AppState {
    pub(crate) config: Arc<Config>,
    pub(crate) users: Arc<UserStore>,
    pub(crate) authz: Arc<AuthorizationTree>,
    pub(crate) mime_table: Arc<std::collections::HashMap<String, String>>,
    pub(crate) www_root: PathBuf,
    pub(crate) error_pages_dir: PathBuf,
    pub(crate) server_limits: ServerLimits,
    pub(crate) req_limits: ReqLimits,
}

/// Outcome of dispatching one request: whether the connection may stay open for another.
pub(crate) struct DispatchOutcome {
    pub(crate) keep_alive: bool,
}

/// Runs the ordered checks (UA filter, forced error, insecure-upgrade, forced-authorize, verb
/// routing) and writes the full response (head + body) to `transport`. File bodies are streamed
/// directly; everything else is buffered in a `Response`.
pub(crate) async fn dispatch<T>(
    request: &mut Request,
    reader: &mut LineReader,
    transport: &mut T,
    is_secure: bool,
    state: &AppState,
) -> Result<DispatchOutcome, ErrorKind>
where
    T: tokio::io::AsyncRead + AsyncWrite + Unpin,
{
    // 1. User-Agent filters.
    if !user_agent_allowed(request, state) {
        return serve_error(transport, request.version, StatusCode::Forbidden, state).await;
    }

    // 2. Caller-forced error: an envelope-parse failure that `Request::parse` carried through
    // rather than short-circuiting directly, so it still clears the User-Agent filter above first.
    if let Some(forced) = &request.forced_error {
        return serve_forced_error(transport, request.version, forced, is_secure, state).await;
    }

    // 3. Insecure-upgrade redirect.
    if !is_secure
        && state.config.get_or("upgrade-insecure-requests", true)
        && request.headers.get("Upgrade-Insecure-Requests") == Some("1")
        && state.config.raw("ssl-certificate").is_some()
        && fs::metadata(state.config.raw("ssl-certificate").unwrap_or_default())
            .await
            .is_ok()
    {
        let address: String = state.config.get_or("address", "localhost".to_string());
        let ssl_port: i64 = state.config.get_or("ssl-port", 8081);
        let mut location = format!("https://{address}");
        if ssl_port != 443 {
            location.push_str(&format!(":{ssl_port}"));
        }
        location.push_str(&request.url.path);
        if !request.url.parameters.is_empty() {
            location.push('?');
            let pairs: Vec<String> = request
                .url
                .parameters
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect();
            location.push_str(&pairs.join("&"));
        }
        return serve_redirect(
            transport,
            request.version,
            StatusCode::MovedTemporarily,
            &location,
            true,
            state,
        )
        .await;
    }

    // 4. Forced authorize.
    if request.url.has_parameter("authorize") && !request.ticket.is_authenticated() {
        return serve_unauthorized(transport, request.version, true, is_secure, state).await;
    }

    let allowed = |method: Method| -> bool {
        match method {
            Method::Trace => state.config.get_or("trace-allowed", false),
            Method::Head => state.config.get_or("head-allowed", false),
            Method::Options => state.config.get_or("options-allowed", true),
            _ => true,
        }
    };

    if !allowed(request.method) {
        return serve_error(transport, request.version, StatusCode::MethodNotAllowed, state).await;
    }

    match request.method {
        Method::Trace => serve_trace(request, transport, state).await,
        Method::Options => serve_options(request, transport, state).await,
        Method::Head => serve_head(request, transport, state).await,
        Method::Get => serve_get(request, transport, state).await,
        Method::Put => serve_put(request, reader, transport, state).await,
        Method::Delete => serve_delete(request, transport, state).await,
        Method::Post => serve_post(request, reader, transport, state).await,
    }
}

fn user_agent_allowed(request: &Request, state: &AppState) -> bool {
    let ua = request.headers.get("User-Agent").unwrap_or("");
    let whitelist = state.config.raw("user-agent-whitelist").unwrap_or("*");
    let blacklist = state.config.raw("user-agent-blacklist").unwrap_or("");

    let in_list = |spec: &str| -> bool {
        if spec.is_empty() {
            return false;
        }
        spec.split('|').any(|pattern| pattern == "*" || ua.contains(pattern))
    };

    if !in_list(whitelist) {
        return false;
    }
    if in_list(blacklist) {
        return false;
    }
    true
}

fn authorize(request: &Request, state: &AppState, verb: Method) -> bool {
    state
        .authz
        .authorize(&request.ticket.role, &request.resolved.path, verb)
}

async fn serve_error<T: AsyncWrite + Unpin>(
    transport: &mut T,
    version: Version,
    status: StatusCode,
    state: &AppState,
) -> Result<DispatchOutcome, ErrorKind> {
    let bytes = content::respond_error(
        version,
        status,
        &state.error_pages_dir,
        &state.server_limits,
    )
    .await;
    write_all(transport, &bytes).await?;
    Ok(DispatchOutcome { keep_alive: false })
}

/// Renders the status a failed envelope parse forced, with a `WWW-Authenticate` challenge when
/// the failure was itself auth-shaped (bad `Authorization` header, bad credentials) and the
/// connection is secure enough to accept one. Mirrors `serve_error`, but takes the status from an
/// `ErrorKind` the caller already has rather than a bare `StatusCode`.
async fn serve_forced_error<T: AsyncWrite + Unpin>(
    transport: &mut T,
    version: Version,
    err: &ErrorKind,
    is_secure: bool,
    state: &AppState,
) -> Result<DispatchOutcome, ErrorKind> {
    let authenticate_over_non_ssl: bool = state.config.get_or("authenticate-over-non-ssl", false);
    let status = err.status();
    let challenge = err.allow_authenticate() && (is_secure || authenticate_over_non_ssl);

    let bytes = if challenge {
        content::respond_error_with_challenge(
            version,
            status,
            &state.error_pages_dir,
            &state.server_limits,
        )
        .await
    } else {
        content::respond_error(version, status, &state.error_pages_dir, &state.server_limits).await
    };
    write_all(transport, &bytes).await?;
    Ok(DispatchOutcome { keep_alive: false })
}

async fn serve_unauthorized<T: AsyncWrite + Unpin>(
    transport: &mut T,
    version: Version,
    allow_authenticate: bool,
    is_secure: bool,
    state: &AppState,
) -> Result<DispatchOutcome, ErrorKind> {
    let authenticate_over_non_ssl: bool = state.config.get_or("authenticate-over-non-ssl", false);
    let page_path = state.error_pages_dir.join("401.html");
    let body = fs::read(&page_path).await.unwrap_or_default();

    let mut response = Response::new(version)
        .status(StatusCode::Unauthorized)
        .header("Content-Type", "text/html")
        .close();

    if allow_authenticate && (is_secure || authenticate_over_non_ssl) {
        response = response.header("WWW-Authenticate", "Basic realm=\"User Visible Realm\"");
    }

    let response = response.header("Content-Length", body.len().to_string());
    let mut bytes = response.into_head_bytes(&state.server_limits);
    bytes.extend_from_slice(&body);
    write_all(transport, &bytes).await?;
    Ok(DispatchOutcome { keep_alive: false })
}

async fn serve_redirect<T: AsyncWrite + Unpin>(
    transport: &mut T,
    version: Version,
    status: StatusCode,
    location: &str,
    no_store: bool,
    state: &AppState,
) -> Result<DispatchOutcome, ErrorKind> {
    let mut response = Response::new(version).status(status).header("Location", location);
    if no_store {
        response = response.header("Cache-Control", "no-store");
    }
    let bytes = response.into_head_bytes(&state.server_limits);
    write_all(transport, &bytes).await?;
    Ok(DispatchOutcome { keep_alive: true })
}

async fn serve_trace<T: AsyncWrite + Unpin>(
    request: &Request,
    transport: &mut T,
    state: &AppState,
) -> Result<DispatchOutcome, ErrorKind> {
    if !authorize(request, state, Method::Trace) {
        return serve_unauthorized(transport, request.version, false, false, state).await;
    }

    let mut echoed = String::new();
    echoed.push_str(request.method.as_str());
    echoed.push(' ');
    echoed.push_str(&request.url.path);
    if !request.url.parameters.is_empty() {
        echoed.push('?');
        let pairs: Vec<String> = request
            .url
            .parameters
            .iter()
            .map(|(k, v)| format!("{}={}", crate::http::uri::encode(k.as_bytes()), crate::http::uri::encode(v.as_bytes())))
            .collect();
        echoed.push_str(&pairs.join("&"));
    }
    echoed.push_str(&format!(" {}\r\n", request.version.as_str()));
    for header in &request.headers.headers {
        echoed.push_str(&format!("{}: {}\r\n", header.name, header.value));
    }

    let response = Response::new(request.version)
        .status(StatusCode::Ok)
        .header("Content-Type", "message/http");
    let body = echoed.into_bytes();
    let head = response.header("Content-Length", body.len().to_string());
    let mut bytes = head.into_head_bytes(&state.server_limits);
    bytes.extend_from_slice(&body);
    write_all(transport, &bytes).await?;
    Ok(DispatchOutcome { keep_alive: true })
}

async fn serve_options<T: AsyncWrite + Unpin>(
    request: &Request,
    transport: &mut T,
    state: &AppState,
) -> Result<DispatchOutcome, ErrorKind> {
    let all = Method::ALL;
    let allowed: Vec<&str> = all
        .iter()
        .filter(|m| authorize(request, state, **m))
        .map(|m| m.as_str())
        .collect();

    let allow_header = if allowed.len() == all.len() {
        "*".to_string()
    } else {
        allowed.join(", ")
    };

    let response = Response::new(request.version)
        .status(StatusCode::Ok)
        .header("Allow", allow_header);
    let bytes = response.into_head_bytes(&state.server_limits);
    write_all(transport, &bytes).await?;
    Ok(DispatchOutcome { keep_alive: true })
}

async fn serve_head<T: AsyncWrite + Unpin>(
    request: &Request,
    transport: &mut T,
    state: &AppState,
) -> Result<DispatchOutcome, ErrorKind> {
    if !authorize(request, state, Method::Get) {
        return serve_unauthorized(transport, request.version, false, false, state).await;
    }
    if !request.resolved.path.exists() {
        return serve_error(transport, request.version, StatusCode::NotFound, state).await;
    }

    let metadata = fs::metadata(&request.resolved.path)
        .await
        .map_err(ErrorKind::from)?;
    let response = Response::new(request.version)
        .status(StatusCode::Ok)
        .header("Content-Length", metadata.len().to_string());
    let bytes = response.into_head_bytes(&state.server_limits);
    write_all(transport, &bytes).await?;
    Ok(DispatchOutcome { keep_alive: true })
}

async fn serve_get<T: AsyncWrite + Unpin>(
    request: &Request,
    transport: &mut T,
    state: &AppState,
) -> Result<DispatchOutcome, ErrorKind> {
    if !authorize(request, state, Method::Get) {
        return serve_unauthorized(transport, request.version, false, false, state).await;
    }

    let path = request.resolved.path.clone();
    let metadata = match fs::metadata(&path).await {
        Ok(m) => m,
        Err(_) => return serve_error(transport, request.version, StatusCode::NotFound, state).await,
    };

    if metadata.is_dir() && request.resolved.is_folder_request {
        return serve_folder_listing(request, &path, transport, state).await;
    }

    if metadata.is_dir() {
        return serve_error(transport, request.version, StatusCode::NotFound, state).await;
    }

    let extension = request.extension().unwrap_or("").to_lowercase();
    let Some(content_type) = state.mime_table.get(&extension) else {
        return serve_error(transport, request.version, StatusCode::Forbidden, state).await;
    };

    if let Some(if_modified_since) = request.headers.get("If-Modified-Since") {
        if let Ok(modified) = metadata.modified() {
            if !is_newer_than(modified, if_modified_since) {
                let response = Response::new(request.version)
                    .status(StatusCode::NotModified)
                    .header("Vary", "Authorization");
                let bytes = response.into_head_bytes(&state.server_limits);
                write_all(transport, &bytes).await?;
                return Ok(DispatchOutcome { keep_alive: true });
            }
        }
    }

    let mut file = fs::File::open(&path).await.map_err(ErrorKind::from)?;
    let last_modified = metadata
        .modified()
        .ok()
        .map(crate::http::response::rfc1123)
        .unwrap_or_else(crate::http::response::rfc1123_now);

    let response = Response::new(request.version)
        .status(StatusCode::Ok)
        .header("Content-Type", content_type.clone())
        .header("Last-Modified", last_modified)
        .header("Content-Length", metadata.len().to_string());
    let head = response.into_head_bytes(&state.server_limits);
    write_all(transport, &head).await?;
    content::stream_file(&mut file, transport)
        .await
        .map_err(ErrorKind::from)?;
    Ok(DispatchOutcome { keep_alive: true })
}

/// `If-Modified-Since` gate (spec §4.I / spec.md:190): the file is newer than the date the client
/// is holding whenever its mtime (truncated to whole seconds, the header's own resolution) is
/// strictly after the parsed header date. A header that doesn't parse can't prove the client's
/// copy is current, so it's treated as if the file were newer and a fresh body is served.
fn is_newer_than(modified: std::time::SystemTime, header_value: &str) -> bool {
    let mtime_secs = modified
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    match crate::http::response::unix_from_rfc1123(header_value) {
        Some(header_secs) => mtime_secs > header_secs,
        None => true,
    }
}

async fn serve_folder_listing<T: AsyncWrite + Unpin>(
    request: &Request,
    path: &Path,
    transport: &mut T,
    state: &AppState,
) -> Result<DispatchOutcome, ErrorKind> {
    let mut entries = fs::read_dir(path).await.map_err(ErrorKind::from)?;
    let mut items = Vec::new();

    while let Some(entry) = entries.next_entry().await.map_err(ErrorKind::from)? {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') {
            continue;
        }
        let metadata = entry.metadata().await.map_err(ErrorKind::from)?;
        let is_dir = metadata.is_dir();
        if !is_dir {
            let ext = Path::new(&name)
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("")
                .to_lowercase();
            if !state.mime_table.contains_key(&ext) {
                continue;
            }
        }
        let changed = metadata
            .modified()
            .ok()
            .map(crate::http::response::rfc1123)
            .unwrap_or_default();

        items.push(if is_dir {
            json!({"name": name, "type": "directory", "changed": changed})
        } else {
            json!({"name": name, "type": "file", "size": metadata.len(), "changed": changed})
        });
    }

    let body = json!({"content": items}).to_string().into_bytes();
    let response = Response::new(request.version)
        .status(StatusCode::Ok)
        .header("Content-Type", "application/json")
        .header("Content-Length", body.len().to_string());
    let mut bytes = response.into_head_bytes(&state.server_limits);
    bytes.extend_from_slice(&body);
    write_all(transport, &bytes).await?;
    Ok(DispatchOutcome { keep_alive: true })
}

async fn serve_put<T>(
    request: &Request,
    reader: &mut LineReader,
    transport: &mut T,
    state: &AppState,
) -> Result<DispatchOutcome, ErrorKind>
where
    T: tokio::io::AsyncRead + AsyncWrite + Unpin,
{
    let path = &request.resolved.path;
    let exists = path.exists();

    if !authorize(request, state, Method::Put) {
        return serve_unauthorized(transport, request.version, false, false, state).await;
    }
    if exists && !authorize(request, state, Method::Delete) {
        return serve_unauthorized(transport, request.version, false, false, state).await;
    }

    let Some(parent) = path.parent() else {
        return serve_error(transport, request.version, StatusCode::InternalServerError, state).await;
    };
    if !parent.exists() {
        return serve_error(transport, request.version, StatusCode::NotFound, state).await;
    }

    if request.resolved.is_folder_request {
        if path.exists() {
            return serve_error(transport, request.version, StatusCode::InternalServerError, state)
                .await;
        }
        fs::create_dir(path).await.map_err(ErrorKind::from)?;
        let response = Response::new(request.version).status(StatusCode::Ok);
        let bytes = response.into_head_bytes(&state.server_limits);
        write_all(transport, &bytes).await?;
        return Ok(DispatchOutcome { keep_alive: true });
    }

    let content_length = request.content_length().ok_or(ErrorKind::InvalidContentLength)?;
    if content_length > state.req_limits.max_request_content_length {
        return serve_error(transport, request.version, StatusCode::InternalServerError, state).await;
    }

    content::put_file(
        transport,
        reader,
        path,
        content_length,
        state.req_limits.request_content_read_timeout,
    )
    .await?;

    let response = Response::new(request.version).status(StatusCode::Ok);
    let bytes = response.into_head_bytes(&state.server_limits);
    write_all(transport, &bytes).await?;
    Ok(DispatchOutcome { keep_alive: true })
}

async fn serve_delete<T: AsyncWrite + Unpin>(
    request: &Request,
    transport: &mut T,
    state: &AppState,
) -> Result<DispatchOutcome, ErrorKind> {
    if !authorize(request, state, Method::Delete) {
        return serve_unauthorized(transport, request.version, false, false, state).await;
    }
    if !request.resolved.path.exists() {
        return serve_error(transport, request.version, StatusCode::NotFound, state).await;
    }
    fs::remove_file(&request.resolved.path)
        .await
        .map_err(ErrorKind::from)?;

    let response = Response::new(request.version).status(StatusCode::Ok);
    let bytes = response.into_head_bytes(&state.server_limits);
    write_all(transport, &bytes).await?;
    Ok(DispatchOutcome { keep_alive: true })
}

async fn serve_post<T>(
    request: &Request,
    reader: &mut LineReader,
    transport: &mut T,
    state: &AppState,
) -> Result<DispatchOutcome, ErrorKind>
where
    T: tokio::io::AsyncRead + AsyncWrite + Unpin,
{
    let content_type = request.headers.get("Content-Type").unwrap_or("");
    if !content_type.starts_with("application/x-www-form-urlencoded") {
        return serve_error(transport, request.version, StatusCode::BadRequest, state).await;
    }
    let content_length = request.content_length().ok_or(ErrorKind::InvalidContentLength)?;
    let deadline = state.req_limits.request_post_content_read_timeout;
    let body = tokio::time::timeout(deadline, reader.read_exact_bytes(transport, content_length))
        .await
        .map_err(|_| ErrorKind::ContentTooLarge)?
        .map_err(ErrorKind::from)?;

    let form: Vec<(&[u8], &[u8])> =
        crate::http::query::Query::parse(&body, 32).map_err(|_| ErrorKind::InvalidContentLength)?;
    let form: Vec<(String, String)> = form
        .into_iter()
        .map(|(k, v)| {
            (
                crate::http::uri::decode(k)
                    .ok()
                    .and_then(|b| String::from_utf8(b).ok())
                    .unwrap_or_default(),
                crate::http::uri::decode(v)
                    .ok()
                    .and_then(|b| String::from_utf8(b).ok())
                    .unwrap_or_default(),
            )
        })
        .collect();

    let file_name = request
        .resolved
        .path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("");

    if request.url.path == "/.users" {
        return serve_post_users(request, &form, transport, state).await;
    }
    if file_name == ".auth" {
        return serve_post_auth(request, &form, transport, state).await;
    }

    serve_error(transport, request.version, StatusCode::NotFound, state).await
}

async fn serve_post_users<T: AsyncWrite + Unpin>(
    request: &Request,
    form: &[(String, String)],
    transport: &mut T,
    state: &AppState,
) -> Result<DispatchOutcome, ErrorKind> {
    if !request.ticket.is_authenticated() {
        return serve_unauthorized(transport, request.version, true, false, state).await;
    }

    let get = |key: &str| form.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str());
    let Some(action) = get("action") else {
        return serve_error(transport, request.version, StatusCode::BadRequest, state).await;
    };

    let is_root = request.ticket.role == "root";
    let result: Result<(), ErrorKind> = if is_root {
        match action {
            "change-password" => {
                let (Some(user), Some(pw)) = (get("username"), get("password")) else {
                    return serve_error(transport, request.version, StatusCode::BadRequest, state)
                        .await;
                };
                state
                    .users
                    .change_password(user, pw)
                    .await
                    .map_err(|_| ErrorKind::NotFound)
            }
            "change-role" => {
                let (Some(user), Some(role)) = (get("username"), get("role")) else {
                    return serve_error(transport, request.version, StatusCode::BadRequest, state)
                        .await;
                };
                if user == request.ticket.username {
                    return serve_error(transport, request.version, StatusCode::Forbidden, state)
                        .await;
                }
                state
                    .users
                    .change_role(user, role)
                    .await
                    .map_err(|_| ErrorKind::NotFound)
            }
            "create-user" => {
                let (Some(user), Some(pw), Some(role)) =
                    (get("username"), get("password"), get("role"))
                else {
                    return serve_error(transport, request.version, StatusCode::BadRequest, state)
                        .await;
                };
                state
                    .users
                    .create_user(user, pw, role)
                    .await
                    .map_err(|_| ErrorKind::Forbidden)
            }
            "delete-user" => {
                let Some(user) = get("username") else {
                    return serve_error(transport, request.version, StatusCode::BadRequest, state)
                        .await;
                };
                state
                    .users
                    .delete_user(user)
                    .await
                    .map_err(|_| ErrorKind::NotFound)
            }
            _ => return serve_error(transport, request.version, StatusCode::BadRequest, state).await,
        }
    } else if action == "change-password" && form.len() == 2 {
        let Some(pw) = get("password") else {
            return serve_error(transport, request.version, StatusCode::BadRequest, state).await;
        };
        state
            .users
            .change_password(&request.ticket.username, pw)
            .await
            .map_err(|_| ErrorKind::NotFound)
    } else {
        return serve_error(transport, request.version, StatusCode::Forbidden, state).await;
    };

    match result {
        Ok(()) => {
            let response = Response::new(request.version).status(StatusCode::Ok);
            let bytes = response.into_head_bytes(&state.server_limits);
            write_all(transport, &bytes).await?;
            Ok(DispatchOutcome { keep_alive: true })
        }
        Err(err) => serve_error(transport, request.version, err.status(), state).await,
    }
}

async fn serve_post_auth<T: AsyncWrite + Unpin>(
    request: &Request,
    form: &[(String, String)],
    transport: &mut T,
    state: &AppState,
) -> Result<DispatchOutcome, ErrorKind> {
    if request.ticket.role != "root" {
        return serve_unauthorized(transport, request.version, true, false, state).await;
    }
    let action = form.iter().find(|(k, _)| k == "action").map(|(_, v)| v.as_str());
    if action.unwrap_or("").is_empty() {
        return serve_error(transport, request.version, StatusCode::BadRequest, state).await;
    }
    // The `.auth` update path is under-specified upstream; this acknowledges the action
    // without mutating anything on disk.
    let response = Response::new(request.version).status(StatusCode::Ok);
    let bytes = response.into_head_bytes(&state.server_limits);
    write_all(transport, &bytes).await?;
    Ok(DispatchOutcome { keep_alive: true })
}

async fn write_all<T: AsyncWrite + Unpin>(transport: &mut T, bytes: &[u8]) -> Result<(), ErrorKind> {
    use tokio::io::AsyncWriteExt;
    transport.write_all(bytes).await.map_err(ErrorKind::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::users::UserStore;
    use crate::http::types::{HeaderMap, Resolved, Ticket, Url};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn test_state(www_root: PathBuf) -> AppState {
        let mut mime_table = std::collections::HashMap::new();
        mime_table.insert("html".to_string(), "text/html; charset=utf-8".to_string());
        AppState {
            config: Arc::new(Config::default()),
            users: UserStore::for_tests("pepper", vec![("alice", "secret", "editor")]),
            authz: Arc::new(AuthorizationTree::default()),
            mime_table: Arc::new(mime_table),
            www_root,
            error_pages_dir: PathBuf::from("error-pages"),
            server_limits: crate::limits::ServerLimits {
                max_connections_per_client: 8,
                threads: 1,
                provide_server_info: false,
                static_response_headers: Vec::new(),
            },
            req_limits: ReqLimits {
                max_uri_length: 4096,
                max_header_length: 8192,
                max_header_count: 25,
                max_request_content_length: 4_194_304,
                request_content_read_timeout: Duration::from_secs(300),
                request_post_content_read_timeout: Duration::from_secs(30),
            },
        }
    }

    fn blank_request(method: Method, path: &str, resolved: PathBuf, is_folder: bool) -> Request {
        Request {
            method,
            version: Version::Http11,
            url: Url {
                path: path.to_string(),
                parameters: Vec::new(),
            },
            resolved: Resolved {
                path: resolved,
                is_folder_request: is_folder,
            },
            headers: HeaderMap::default(),
            ticket: Ticket::anonymous(),
            body: Vec::new(),
            forced_error: None,
        }
    }

    #[test]
    fn user_agent_whitelist_defaults_to_accept_all() {
        let state = test_state(PathBuf::from("/tmp"));
        let mut request = blank_request(Method::Get, "/", PathBuf::from("/tmp"), false);
        request.headers.push("User-Agent".to_string(), "anything at all".to_string());
        assert!(user_agent_allowed(&request, &state));
    }

    #[test]
    fn user_agent_blacklist_rejects_substring_match() {
        let mut state = test_state(PathBuf::from("/tmp"));
        state.config = Arc::new(Config::for_tests(&[("user-agent-blacklist", "BadBot")]));
        let mut request = blank_request(Method::Get, "/", PathBuf::from("/tmp"), false);
        request.headers.push("User-Agent".to_string(), "BadBot/2.0".to_string());
        assert!(!user_agent_allowed(&request, &state));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn forced_error_renders_its_own_status() {
        let state = test_state(PathBuf::from("/tmp"));
        let mut request = blank_request(Method::Get, "/anything", PathBuf::from("/tmp"), false);
        request.forced_error = Some(ErrorKind::UriTooLong);
        let mut reader = LineReader::new();
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);

        let outcome = dispatch(&mut request, &mut reader, &mut server, false, &state)
            .await
            .unwrap();
        assert!(!outcome.keep_alive);
        drop(server);

        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        assert!(String::from_utf8(out)
            .unwrap()
            .starts_with("HTTP/1.1 414 Request-URI Too Long\r\n"));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn user_agent_filter_still_wins_over_forced_error() {
        let mut state = test_state(PathBuf::from("/tmp"));
        state.config = Arc::new(Config::for_tests(&[("user-agent-blacklist", "BadBot")]));
        let mut request = blank_request(Method::Get, "/anything", PathBuf::from("/tmp"), false);
        request.headers.push("User-Agent".to_string(), "BadBot/2.0".to_string());
        request.forced_error = Some(ErrorKind::UriTooLong);
        let mut reader = LineReader::new();
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);

        dispatch(&mut request, &mut reader, &mut server, false, &state)
            .await
            .unwrap();
        drop(server);

        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        assert!(String::from_utf8(out)
            .unwrap()
            .starts_with("HTTP/1.1 403 Forbidden\r\n"));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn get_file_streams_contents_with_headers() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), b"<h1>hi</h1>").unwrap();
        let state = test_state(dir.path().to_path_buf());

        let mut request = blank_request(
            Method::Get,
            "/index.html",
            dir.path().join("index.html"),
            false,
        );
        let mut reader = LineReader::new();
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);

        let outcome = dispatch(&mut request, &mut reader, &mut server, false, &state)
            .await
            .unwrap();
        assert!(outcome.keep_alive);
        drop(server);

        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Type: text/html; charset=utf-8\r\n"));
        assert!(text.contains("Content-Length: 11\r\n"));
        assert!(text.ends_with("<h1>hi</h1>"));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn get_missing_file_responds_404() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path().to_path_buf());
        let mut request = blank_request(
            Method::Get,
            "/missing.html",
            dir.path().join("missing.html"),
            false,
        );
        let mut reader = LineReader::new();
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);

        dispatch(&mut request, &mut reader, &mut server, false, &state)
            .await
            .unwrap();
        drop(server);

        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        assert!(String::from_utf8(out).unwrap().starts_with("HTTP/1.1 404 Not Found\r\n"));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn put_streams_body_into_partial_then_renames() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path().to_path_buf());
        let target = dir.path().join("new.txt");
        let body = b"hello world";

        let mut headers = HeaderMap::default();
        headers.push("Content-Length".to_string(), body.len().to_string());
        let mut request = Request {
            method: Method::Put,
            version: Version::Http11,
            url: Url {
                path: "/new.txt".to_string(),
                parameters: Vec::new(),
            },
            resolved: Resolved {
                path: target.clone(),
                is_folder_request: false,
            },
            headers,
            // The default authorization policy (no `.auth` rules) only allows GET; PUT needs an
            // explicit grant, and `root` is the one role that always short-circuits to allowed.
            ticket: Ticket {
                username: "admin".to_string(),
                role: "root".to_string(),
            },
            body: Vec::new(),
            forced_error: None,
        };

        let mut reader = LineReader::new();
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        client.write_all(body).await.unwrap();

        let outcome = dispatch(&mut request, &mut reader, &mut server, false, &state)
            .await
            .unwrap();
        assert!(outcome.keep_alive);
        drop(client);

        let mut out = Vec::new();
        server.read_to_end(&mut out).await.unwrap();
        assert!(String::from_utf8(out).unwrap().starts_with("HTTP/1.1 200 OK\r\n"));
        assert_eq!(std::fs::read(&target).unwrap(), body);
        assert!(!target.with_extension("txt.partial").exists());
    }
}
