//! File streaming, body intake with atomic-rename PUT staging, and the shared error-page
//! rendering both the envelope parser and the dispatcher fall back to.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;

use crate::errors::ErrorKind;
use crate::http::response::Response;
use crate::http::types::{StatusCode, Version};
use crate::limits::ServerLimits;

const CHUNK_SIZE: usize = 8192;

/// Streams `file`'s remaining bytes to `transport` in `CHUNK_SIZE` chunks. Memory footprint is
/// constant regardless of file size.
pub(crate) async fn stream_file<T: tokio::io::AsyncWrite + Unpin>(
    file: &mut File,
    transport: &mut T,
) -> std::io::Result<()> {
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let read = file.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        transport.write_all(&buf[..read]).await?;
    }
    Ok(())
}

/// RAII guard that deletes `<path>.partial` on drop unless [`release`](PartialFileGuard::release)
/// was called — the Rust answer to the original source's destructor-based scope guard (spec
/// §4.L, "undo scope").
pub(crate) struct PartialFileGuard {
    path: PathBuf,
    released: bool,
}

impl PartialFileGuard {
    pub(crate) fn new(target: &Path) -> Self {
        let mut partial = target.as_os_str().to_os_string();
        partial.push(".partial");
        PartialFileGuard {
            path: PathBuf::from(partial),
            released: false,
        }
    }

    pub(crate) fn partial_path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn release(mut self) {
        self.released = true;
    }
}

impl Drop for PartialFileGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let path = self.path.clone();
        tokio::spawn(async move {
            let _ = fs::remove_file(&path).await;
        });
    }
}

/// Streams the request body from `transport` (through `reader`'s carry-over buffer) into
/// `<path>.partial`, bounded by `content_length` and `deadline`; on full success, atomically
/// renames the staging file onto `path`. Any failure leaves the guard unreleased, so its `Drop`
/// cleans up the partial file.
pub(crate) async fn put_file<T: tokio::io::AsyncRead + Unpin>(
    transport: &mut T,
    reader: &mut crate::http::request::LineReader,
    path: &Path,
    content_length: usize,
    deadline: Duration,
) -> Result<(), ErrorKind> {
    let guard = PartialFileGuard::new(path);
    let mut staging = File::create(guard.partial_path())
        .await
        .map_err(ErrorKind::from)?;

    let mut remaining = content_length;
    while remaining > 0 {
        let want = remaining.min(CHUNK_SIZE);
        let chunk = timeout(deadline, reader.read_exact_bytes(transport, want))
            .await
            .map_err(|_| ErrorKind::ContentTooLarge)?
            .map_err(ErrorKind::from)?;
        if chunk.is_empty() {
            return Err(ErrorKind::ContentTooLarge);
        }
        staging.write_all(&chunk).await.map_err(ErrorKind::from)?;
        remaining -= chunk.len();
    }
    staging.flush().await.map_err(ErrorKind::from)?;
    drop(staging);

    fs::rename(guard.partial_path(), path)
        .await
        .map_err(ErrorKind::from)?;
    guard.release();
    Ok(())
}

/// Renders `error-pages/<code>.html` for `status`, falling back to an empty body if the page is
/// missing (a missing page is itself just a smaller response, not a reason to fail harder).
/// Error responses never keep-alive.
pub(crate) async fn respond_error(
    version: Version,
    status: StatusCode,
    error_pages_dir: &Path,
    limits: &ServerLimits,
) -> Vec<u8> {
    respond_error_inner(version, status, error_pages_dir, limits, false).await
}

/// Same as [`respond_error`], but with `WWW-Authenticate: Basic realm="User Visible Realm"` added
/// ahead of the standard headers — used when an envelope-level failure (e.g. a malformed
/// `Authorization` header) could plausibly have succeeded with different credentials.
pub(crate) async fn respond_error_with_challenge(
    version: Version,
    status: StatusCode,
    error_pages_dir: &Path,
    limits: &ServerLimits,
) -> Vec<u8> {
    respond_error_inner(version, status, error_pages_dir, limits, true).await
}

async fn respond_error_inner(
    version: Version,
    status: StatusCode,
    error_pages_dir: &Path,
    limits: &ServerLimits,
    challenge: bool,
) -> Vec<u8> {
    let page_path = error_pages_dir.join(format!("{}.html", status.0));
    let page_body = fs::read(&page_path).await.unwrap_or_default();

    let mut head = Response::new(version)
        .status(status)
        .header("Content-Type", "text/html")
        .close();
    if challenge {
        head = head.header("WWW-Authenticate", "Basic realm=\"User Visible Realm\"");
    }
    let head = head.header("Content-Length", page_body.len().to_string());
    let mut bytes = head.into_head_bytes(limits);
    bytes.extend_from_slice(&page_body);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn stream_file_copies_all_bytes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.bin");
        fs::write(&path, b"hello world").await.unwrap();

        let mut file = File::open(&path).await.unwrap();
        let mut out = Vec::new();
        stream_file(&mut file, &mut out).await.unwrap();
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn partial_guard_removes_file_when_not_released() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("upload.bin");
        let guard = PartialFileGuard::new(&target);
        fs::write(guard.partial_path(), b"partial").await.unwrap();
        let partial_path = guard.partial_path().to_path_buf();
        drop(guard);
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!partial_path.exists());
    }

    #[tokio::test]
    async fn partial_guard_keeps_file_when_released() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("upload.bin");
        let guard = PartialFileGuard::new(&target);
        fs::write(guard.partial_path(), b"partial").await.unwrap();
        let partial_path = guard.partial_path().to_path_buf();
        guard.release();
        assert!(partial_path.exists());
    }
}
