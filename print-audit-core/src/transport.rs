//! [`Transport`] implementations: SFTP (via `ssh2`) and a local directory.

use std::fs;
use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::contract::{RemoteItem, Transport, TransportError};

/// libssh2 SFTP status code for a missing file or directory.
const SFTP_NO_SUCH_FILE: i32 = 2;

/// How to log in to the drop server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum SftpAuth {
    Password { password: String },
    KeyFile { path: PathBuf, passphrase: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SftpSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: SftpAuth,
    pub connect_timeout: Duration,
}

/// One authenticated SFTP session, opened at startup and reused for the run.
pub struct SftpTransport {
    // Keeps the session alive for the lifetime of the SFTP channel.
    _session: ssh2::Session,
    sftp: Arc<Mutex<ssh2::Sftp>>,
}

impl std::fmt::Debug for SftpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SftpTransport { .. }")
    }
}

impl SftpTransport {
    /// Connect and authenticate. Failure here is fatal for the run.
    pub fn connect(settings: &SftpSettings) -> Result<Self, TransportError> {
        info!(host = %settings.host, port = settings.port, "Connecting to data server");
        let addr = (settings.host.as_str(), settings.port)
            .to_socket_addrs()
            .map_err(|e| TransportError::Connect(format!("{}: {e}", settings.host)))?
            .next()
            .ok_or_else(|| TransportError::Connect(format!("{}: no address", settings.host)))?;
        let tcp = TcpStream::connect_timeout(&addr, settings.connect_timeout)
            .map_err(|e| TransportError::Connect(format!("{addr}: {e}")))?;

        let mut session = ssh2::Session::new().map_err(|e| TransportError::Connect(e.to_string()))?;
        session.set_tcp_stream(tcp);
        let timeout_ms = u32::try_from(settings.connect_timeout.as_millis()).unwrap_or(u32::MAX);
        session.set_timeout(timeout_ms);
        session
            .handshake()
            .map_err(|e| TransportError::Connect(format!("SSH handshake failed: {e}")))?;

        match &settings.auth {
            SftpAuth::Password { password } => session
                .userauth_password(&settings.username, password)
                .map_err(|e| TransportError::Auth(e.to_string()))?,
            SftpAuth::KeyFile { path, passphrase } => session
                .userauth_pubkey_file(&settings.username, None, path, passphrase.as_deref())
                .map_err(|e| TransportError::Auth(e.to_string()))?,
        }
        if !session.authenticated() {
            return Err(TransportError::Auth(format!(
                "server rejected credentials for {}",
                settings.username
            )));
        }
        // Transfers may legitimately take longer than the connect budget.
        session.set_timeout(0);

        let sftp = session
            .sftp()
            .map_err(|e| TransportError::Connect(format!("SFTP subsystem: {e}")))?;
        info!(host = %settings.host, "SSH connection established");
        Ok(Self {
            _session: session,
            sftp: Arc::new(Mutex::new(sftp)),
        })
    }
}

fn sftp_error(path: &str, e: ssh2::Error) -> TransportError {
    match e.code() {
        ssh2::ErrorCode::SFTP(SFTP_NO_SUCH_FILE) => TransportError::NotFound(path.to_string()),
        _ => TransportError::Other(format!("{path}: {e}")),
    }
}

fn poisoned() -> TransportError {
    TransportError::Other("SFTP session lock poisoned".to_string())
}

fn join_error(e: tokio::task::JoinError) -> TransportError {
    TransportError::Other(format!("transfer task failed: {e}"))
}

#[async_trait]
impl Transport for SftpTransport {
    async fn list(&self, remote_dir: &str) -> Result<Vec<RemoteItem>, TransportError> {
        let sftp = Arc::clone(&self.sftp);
        let dir = remote_dir.to_string();
        tokio::task::spawn_blocking(move || {
            let sftp = sftp.lock().map_err(|_| poisoned())?;
            let entries = sftp.readdir(Path::new(&dir)).map_err(|e| sftp_error(&dir, e))?;
            let items = entries
                .into_iter()
                .filter(|(_, stat)| !stat.is_dir())
                .filter_map(|(path, stat)| {
                    let name = path.file_name()?.to_str()?.to_string();
                    Some(RemoteItem {
                        name,
                        size: stat.size.unwrap_or(0),
                        modified_at: stat.mtime.map(|m| m as i64).unwrap_or(0),
                    })
                })
                .collect::<Vec<_>>();
            debug!(dir = %dir, files = items.len(), "Listed remote directory");
            Ok(items)
        })
        .await
        .map_err(join_error)?
    }

    async fn fetch(&self, remote_file: &str, local_path: &Path) -> Result<u64, TransportError> {
        let sftp = Arc::clone(&self.sftp);
        let remote = remote_file.to_string();
        let local = local_path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let sftp = sftp.lock().map_err(|_| poisoned())?;
            let mut source = sftp.open(Path::new(&remote)).map_err(|e| sftp_error(&remote, e))?;
            let mut target = fs::File::create(&local)?;
            let bytes = io::copy(&mut source, &mut target)?;
            target.sync_all()?;
            Ok(bytes)
        })
        .await
        .map_err(join_error)?
    }
}

/// Treats a locally reachable directory (e.g. a mounted share) as the drop server.
#[derive(Debug, Clone, Default)]
pub struct LocalDirTransport;

#[async_trait]
impl Transport for LocalDirTransport {
    async fn list(&self, remote_dir: &str) -> Result<Vec<RemoteItem>, TransportError> {
        let entries = fs::read_dir(remote_dir).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => TransportError::NotFound(remote_dir.to_string()),
            _ => TransportError::Io(e),
        })?;
        let mut items = Vec::new();
        for entry in entries {
            let entry = entry?;
            let meta = entry.metadata()?;
            if !meta.is_file() {
                continue;
            }
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            let modified_at = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);
            items.push(RemoteItem {
                name,
                size: meta.len(),
                modified_at,
            });
        }
        items.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(items)
    }

    async fn fetch(&self, remote_file: &str, local_path: &Path) -> Result<u64, TransportError> {
        let bytes = fs::copy(remote_file, local_path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => TransportError::NotFound(remote_file.to_string()),
            _ => TransportError::Io(e),
        })?;
        Ok(bytes)
    }
}
