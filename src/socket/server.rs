//! Unix domain socket server for one secret.
//!
//! Binds a listener at the secret's socket path and serves connections one
//! at a time: fetch the secret, write it, close. A fetch or write failure
//! stops the server and is returned as a [`StopReason`]; the supervisor
//! decides what happens next.

use std::fs;
use std::io;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::net::{UnixListener, UnixStream};

use super::payload;
use crate::config::SecretDescriptor;
use crate::store::{FieldError, SecretStore, StoreError};

/// Permission bits applied to every socket file (owner only).
pub const SOCKET_MODE: u32 = 0o700;

/// sun_path is 104 bytes on macOS, 108 on Linux; use the conservative limit.
const MAX_SOCKET_PATH: usize = 104;

/// Pause after a failed accept so a persistent error (e.g. EMFILE) does not spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Why a socket server stopped serving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// The listener could not be set up.
    Bind(String),
    /// The secret store failed a fetch.
    Fetch(String),
    /// Writing the payload to a client failed.
    Write(String),
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bind(e) => write!(f, "bind failed: {e}"),
            Self::Fetch(e) => write!(f, "fetch failed: {e}"),
            Self::Write(e) => write!(f, "write failed: {e}"),
        }
    }
}

/// Outcome of a single connection that did not complete.
#[derive(Debug)]
enum ConnectionError {
    Fetch(StoreError),
    Field(FieldError),
    Write(io::Error),
}

/// Serves one secret over one Unix domain socket.
pub struct SocketServer {
    /// Path to the socket file.
    socket_path: PathBuf,
    descriptor: Arc<SecretDescriptor>,
    store: Arc<dyn SecretStore>,
    listener: UnixListener,
}

impl std::fmt::Debug for SocketServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketServer")
            .field("socket_path", &self.socket_path)
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

impl SocketServer {
    /// Bind the socket for `descriptor` at `socket_path`.
    ///
    /// Removes whatever a previous run left at the path, creates missing
    /// parent directories as 0700, binds, and restricts the socket file to
    /// its owner. Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is too long, the stale entry cannot be
    /// removed, or the socket cannot be bound.
    pub fn bind(
        socket_path: PathBuf,
        descriptor: Arc<SecretDescriptor>,
        store: Arc<dyn SecretStore>,
    ) -> Result<Self> {
        let path_len = socket_path.as_os_str().len();
        if path_len >= MAX_SOCKET_PATH {
            anyhow::bail!(
                "Socket path too long ({path_len} bytes, max {}): {}",
                MAX_SOCKET_PATH - 1,
                socket_path.display()
            );
        }

        if remove_stale_entry(&socket_path)
            .with_context(|| format!("Failed to remove stale socket: {}", socket_path.display()))?
        {
            log::debug!("Removed stale socket file: {}", socket_path.display());
        }

        if let Some(parent) = socket_path.parent() {
            create_private_dir(parent).with_context(|| {
                format!("Failed to create socket directory: {}", parent.display())
            })?;
        }

        let listener = std::os::unix::net::UnixListener::bind(&socket_path)
            .with_context(|| format!("Failed to bind socket: {}", socket_path.display()))?;

        // Scoped to this file; the process umask is left alone.
        if let Err(e) = fs::set_permissions(&socket_path, fs::Permissions::from_mode(SOCKET_MODE)) {
            drop(listener);
            let _ = fs::remove_file(&socket_path);
            return Err(e).with_context(|| {
                format!("Failed to set socket permissions: {}", socket_path.display())
            });
        }

        listener.set_nonblocking(true)?;
        let listener = UnixListener::from_std(listener)?;

        log::info!(
            "Listening on {} for secret path {}",
            socket_path.display(),
            descriptor.vault_path
        );

        Ok(Self {
            socket_path,
            descriptor,
            store,
            listener,
        })
    }

    /// Accept loop. Runs until a fetch or write fails.
    ///
    /// Connections are handled strictly one at a time in accept order.
    /// Accept errors and field lookup errors are logged and the loop goes on.
    pub async fn serve(self) -> StopReason {
        loop {
            let mut stream = match self.listener.accept().await {
                Ok((stream, _addr)) => stream,
                Err(e) => {
                    log::warn!("[{}] Accept error: {e}", self.socket_path.display());
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    continue;
                }
            };

            log::info!(
                "Serving secret value for {} on socket {}",
                self.descriptor.vault_path,
                self.socket_path.display()
            );

            match self.respond(&mut stream).await {
                Ok(written) => {
                    log::debug!("[{}] Wrote {written} bytes", self.socket_path.display());
                }
                Err(ConnectionError::Field(e)) => {
                    log::error!(
                        "[{}] Cannot serve {}: {e}",
                        self.socket_path.display(),
                        self.descriptor.vault_path
                    );
                }
                Err(ConnectionError::Fetch(e)) => {
                    log::error!(
                        "[{}] Stopping: fetch of {} failed: {e}",
                        self.socket_path.display(),
                        self.descriptor.vault_path
                    );
                    return StopReason::Fetch(e.to_string());
                }
                Err(ConnectionError::Write(e)) => {
                    log::error!("[{}] Stopping: write failed: {e}", self.socket_path.display());
                    return StopReason::Write(e.to_string());
                }
            }

            if let Err(e) = stream.shutdown().await {
                log::warn!("[{}] Close error: {e}", self.socket_path.display());
            }
        }
    }

    /// One fetch-and-write cycle on an accepted connection.
    async fn respond(&self, stream: &mut UnixStream) -> Result<usize, ConnectionError> {
        let secret = self
            .store
            .get(&self.descriptor.vault_path)
            .await
            .map_err(ConnectionError::Fetch)?;

        let payload =
            payload::render(&secret, self.descriptor.field()).map_err(ConnectionError::Field)?;

        stream
            .write_all(&payload)
            .await
            .map_err(ConnectionError::Write)?;
        stream.flush().await.map_err(ConnectionError::Write)?;

        Ok(payload.len())
    }
}

/// Remove whatever exists at `path` before binding.
///
/// Directories are removed recursively. Returns `Ok(false)` if nothing was there.
pub fn remove_stale_entry(path: &Path) -> io::Result<bool> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path).map(|()| true),
        Ok(_) => fs::remove_file(path).map(|()| true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Unlink a socket file on shutdown. Returns `Ok(false)` if it was already gone.
pub fn remove_socket_file(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Create `dir` and any missing ancestors with mode 0700.
///
/// Existing directories keep their permissions.
fn create_private_dir(dir: &Path) -> io::Result<()> {
    if dir.as_os_str().is_empty() || dir.is_dir() {
        return Ok(());
    }
    fs::DirBuilder::new().recursive(true).mode(0o700).create(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use serde_json::json;
    use tokio::io::AsyncReadExt;

    fn descriptor(field: Option<&str>) -> Arc<SecretDescriptor> {
        Arc::new(SecretDescriptor::new("test.sock", "app/db", field))
    }

    fn store() -> MemoryStore {
        let store = MemoryStore::new();
        store.insert("app/db", json!({"password": "hunter2", "username": "bob"}));
        store
    }

    async fn read_response(path: &Path) -> Vec<u8> {
        let mut stream = UnixStream::connect(path).await.unwrap();
        let mut buf = Vec::new();
        tokio::time::timeout(Duration::from_secs(2), stream.read_to_end(&mut buf))
            .await
            .expect("Timed out waiting for EOF")
            .expect("Read failed");
        buf
    }

    #[tokio::test]
    async fn test_serves_field_value() {
        let tmp = tempfile::TempDir::new().unwrap();
        let sock_path = tmp.path().join("test.sock");

        let server =
            SocketServer::bind(sock_path.clone(), descriptor(Some("password")), Arc::new(store()))
                .unwrap();
        let handle = tokio::spawn(server.serve());

        assert_eq!(read_response(&sock_path).await, b"hunter2");
        // Still serving after the first client
        assert_eq!(read_response(&sock_path).await, b"hunter2");

        handle.abort();
    }

    #[tokio::test]
    async fn test_serves_whole_secret_without_field() {
        let tmp = tempfile::TempDir::new().unwrap();
        let sock_path = tmp.path().join("test.sock");

        let server =
            SocketServer::bind(sock_path.clone(), descriptor(None), Arc::new(store())).unwrap();
        let handle = tokio::spawn(server.serve());

        let text = String::from_utf8(read_response(&sock_path).await).unwrap();
        for needle in ["password", "hunter2", "username", "bob"] {
            assert!(text.contains(needle), "missing {needle} in {text}");
        }

        handle.abort();
    }

    #[tokio::test]
    async fn test_socket_is_owner_only() {
        let tmp = tempfile::TempDir::new().unwrap();
        let sock_path = tmp.path().join("test.sock");

        let _server =
            SocketServer::bind(sock_path.clone(), descriptor(None), Arc::new(store())).unwrap();

        let mode = fs::metadata(&sock_path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, SOCKET_MODE);
    }

    #[tokio::test]
    async fn test_missing_parent_dirs_created_private() {
        let tmp = tempfile::TempDir::new().unwrap();
        let sock_path = tmp.path().join("a/b/test.sock");

        let _server =
            SocketServer::bind(sock_path.clone(), descriptor(None), Arc::new(store())).unwrap();

        assert!(sock_path.exists());
        let mode = fs::metadata(tmp.path().join("a/b")).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o700);
    }

    #[tokio::test]
    async fn test_stale_socket_file_replaced() {
        let tmp = tempfile::TempDir::new().unwrap();
        let sock_path = tmp.path().join("test.sock");

        // Leftover from an unclean shutdown: bound, then listener dropped
        drop(std::os::unix::net::UnixListener::bind(&sock_path).unwrap());
        assert!(sock_path.exists());

        let server =
            SocketServer::bind(sock_path.clone(), descriptor(Some("username")), Arc::new(store()))
                .unwrap();
        let handle = tokio::spawn(server.serve());

        assert_eq!(read_response(&sock_path).await, b"bob");
        handle.abort();
    }

    #[tokio::test]
    async fn test_stale_regular_file_and_directory_replaced() {
        let tmp = tempfile::TempDir::new().unwrap();
        let file_path = tmp.path().join("file.sock");
        let dir_path = tmp.path().join("dir.sock");
        fs::write(&file_path, b"junk").unwrap();
        fs::create_dir_all(dir_path.join("inner")).unwrap();

        let _a = SocketServer::bind(file_path, descriptor(None), Arc::new(store())).unwrap();
        let _b = SocketServer::bind(dir_path.clone(), descriptor(None), Arc::new(store())).unwrap();
        assert!(!dir_path.is_dir());
    }

    #[test]
    fn test_remove_missing_entry_is_not_an_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("never-existed.sock");
        assert!(!remove_stale_entry(&path).unwrap());
        assert!(!remove_socket_file(&path).unwrap());
    }

    #[tokio::test]
    async fn test_socket_path_length_validation() {
        let tmp = tempfile::TempDir::new().unwrap();
        let long_name = "a".repeat(200);
        let sock_path = tmp.path().join(long_name).join("test.sock");

        let result = SocketServer::bind(sock_path, descriptor(None), Arc::new(store()));
        let err_msg = result.unwrap_err().to_string();
        assert!(err_msg.contains("too long"), "Error should mention path too long: {err_msg}");
    }

    #[tokio::test]
    async fn test_missing_field_closes_connection_and_keeps_serving() {
        let tmp = tempfile::TempDir::new().unwrap();
        let sock_path = tmp.path().join("test.sock");
        let store = store();

        let server = SocketServer::bind(
            sock_path.clone(),
            descriptor(Some("api_key")),
            Arc::new(store.clone()),
        )
        .unwrap();
        let handle = tokio::spawn(server.serve());

        assert!(read_response(&sock_path).await.is_empty());
        assert!(read_response(&sock_path).await.is_empty());
        assert_eq!(store.fetch_count("app/db"), 2);
        assert!(!handle.is_finished());

        // Field appears later: served without restarting
        store.insert("app/db", json!({"api_key": "k-123"}));
        assert_eq!(read_response(&sock_path).await, b"k-123");

        handle.abort();
    }

    #[tokio::test]
    async fn test_fetch_failure_stops_server() {
        let tmp = tempfile::TempDir::new().unwrap();
        let sock_path = tmp.path().join("test.sock");
        let store = store();
        store.fail("app/db");

        let server =
            SocketServer::bind(sock_path.clone(), descriptor(Some("password")), Arc::new(store))
                .unwrap();
        let handle = tokio::spawn(server.serve());

        assert!(read_response(&sock_path).await.is_empty());

        let reason = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("Server did not stop")
            .unwrap();
        assert!(matches!(reason, StopReason::Fetch(ref msg) if msg.contains("503")));

        // Listener is gone; the file remains until drain
        assert!(sock_path.exists());
        assert!(UnixStream::connect(&sock_path).await.is_err());
    }

    #[tokio::test]
    async fn test_write_to_departed_client_stops_server() {
        let tmp = tempfile::TempDir::new().unwrap();
        let sock_path = tmp.path().join("test.sock");
        let store = MemoryStore::new();
        // Larger than any socket buffer, so the write cannot complete
        store.insert("app/db", json!({"password": "x".repeat(4 * 1024 * 1024)}));
        store.stall("app/db");

        let server = SocketServer::bind(
            sock_path.clone(),
            descriptor(Some("password")),
            Arc::new(store.clone()),
        )
        .unwrap();
        let handle = tokio::spawn(server.serve());

        let client = UnixStream::connect(&sock_path).await.unwrap();
        while store.fetch_count("app/db") == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        // Client gives up while the fetch is still in flight
        drop(client);
        store.release("app/db");

        let reason = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("Server did not stop")
            .unwrap();
        assert!(matches!(reason, StopReason::Write(_)), "got: {reason:?}");
        assert!(UnixStream::connect(&sock_path).await.is_err());
    }

    #[tokio::test]
    async fn test_connections_served_one_at_a_time() {
        let tmp = tempfile::TempDir::new().unwrap();
        let sock_path = tmp.path().join("test.sock");
        let store = store();
        store.stall("app/db");

        let server = SocketServer::bind(
            sock_path.clone(),
            descriptor(Some("password")),
            Arc::new(store.clone()),
        )
        .unwrap();
        let handle = tokio::spawn(server.serve());

        let mut first = UnixStream::connect(&sock_path).await.unwrap();
        while store.fetch_count("app/db") == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // Second client is queued in the backlog, not serviced
        let mut second = UnixStream::connect(&sock_path).await.unwrap();
        let mut buf = Vec::new();
        let waited =
            tokio::time::timeout(Duration::from_millis(200), second.read_to_end(&mut buf)).await;
        assert!(waited.is_err(), "second client served while first in flight");
        assert_eq!(store.fetch_count("app/db"), 1);

        store.release("app/db");

        let mut first_buf = Vec::new();
        first.read_to_end(&mut first_buf).await.unwrap();
        assert_eq!(first_buf, b"hunter2");

        let mut second_buf = Vec::new();
        tokio::time::timeout(Duration::from_secs(2), second.read_to_end(&mut second_buf))
            .await
            .expect("Timed out")
            .unwrap();
        assert_eq!(second_buf, b"hunter2");
        assert_eq!(store.fetch_count("app/db"), 2);

        handle.abort();
    }

    #[test]
    fn test_stop_reason_display() {
        assert_eq!(
            StopReason::Fetch("boom".to_string()).to_string(),
            "fetch failed: boom"
        );
    }
}
