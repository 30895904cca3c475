//! Per-(config, extension) socket listener: bind, accept loop, drain.

use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tokio::net::UnixListener;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::browser::Browser;

use super::connection::{self, ConnectionSpec};

/// Consecutive accept failures tolerated before the server gives up.
pub const ACCEPT_RETRY_LIMIT: u32 = 5;

/// Unique identity of one running bridge socket. Structural: two keys are
/// equal when they name the same manifest path, browser and extension, no
/// matter which reconciliation pass produced them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerKey {
    pub browser: Browser,
    pub manifest_path: PathBuf,
    pub extension: String,
}

impl fmt::Display for ServerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.browser,
            self.manifest_path.display(),
            self.extension
        )
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("server for {extension} is already running")]
    AlreadyRunning { extension: String },
    #[error("can't listen on socket {socket}: {source}")]
    Bind {
        socket: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to establish connection for {extension}: {source}")]
    Accept {
        extension: String,
        #[source]
        source: std::io::Error,
    },
}

/// One listening Unix socket and its accept loop.
///
/// Created by the supervisor when reconciliation wants the (config,
/// extension) pair served; runs until it fails or is asked to stop, at which
/// point it drains in-flight connections before returning.
pub struct Server {
    key: ServerKey,
    executable: PathBuf,
    socket_dir: PathBuf,
    listen_in: bool,
    running: AtomicBool,
    stop_tx: watch::Sender<bool>,
}

/// Removes the socket file when the accept loop exits, on success and error
/// paths alike.
struct SocketCleanup(PathBuf);

impl Drop for SocketCleanup {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.0) {
            if err.kind() != ErrorKind::NotFound {
                warn!(path = %self.0.display(), error = %err, "failed to clean up socket");
            }
        }
    }
}

impl Server {
    pub fn new(key: ServerKey, executable: PathBuf, socket_dir: PathBuf, listen_in: bool) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            key,
            executable,
            socket_dir,
            listen_in,
            running: AtomicBool::new(false),
            stop_tx,
        }
    }

    pub fn key(&self) -> &ServerKey {
        &self.key
    }

    pub fn socket_path(&self) -> PathBuf {
        portico_paths::socket_path_in(&self.socket_dir, &self.key.extension)
    }

    /// Asks the accept loop to stop and drain. Non-blocking; callers observe
    /// completion through the supervisor's registry.
    pub fn request_stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Binds the socket and serves until stopped or failed. Calling this on
    /// a server that has already run is a registry invariant violation and
    /// fails with [`ServerError::AlreadyRunning`].
    pub async fn run(&self, fixer: mpsc::Sender<Browser>) -> Result<(), ServerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ServerError::AlreadyRunning {
                extension: self.key.extension.clone(),
            });
        }
        let mut stop_rx = self.stop_tx.subscribe();

        // Best-effort nudge; a dropped entry only delays the permission
        // check until the next server start.
        if let Err(err) = fixer.try_send(self.key.browser) {
            debug!(error = %err, "permission check not queued");
        }

        let socket = self.socket_path();
        if let Err(err) = fs::create_dir_all(&self.socket_dir) {
            warn!(dir = %self.socket_dir.display(), error = %err, "could not create socket directory");
        }
        // A stale socket from an unclean shutdown would make bind fail.
        match fs::remove_file(&socket) {
            Err(err) if err.kind() != ErrorKind::NotFound => {
                warn!(socket = %socket.display(), error = %err, "could not remove stale socket");
            }
            _ => {}
        }
        let listener = UnixListener::bind(&socket).map_err(|source| ServerError::Bind {
            socket: socket.clone(),
            source,
        })?;
        let _cleanup = SocketCleanup(socket.clone());
        info!(extension = %self.key.extension, socket = %socket.display(), "server listening");

        // The stop request may have arrived before the loop even started.
        if *stop_rx.borrow_and_update() {
            debug!(extension = %self.key.extension, "stopped before accepting");
            return Ok(());
        }

        let (drain_tx, drain_rx) = watch::channel(false);
        let (conn_tx, mut conn_rx) = mpsc::channel::<()>(1);
        let mut retries = 0u32;

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        retries = 0;
                        let spec = ConnectionSpec {
                            executable: self.executable.clone(),
                            manifest_path: self.key.manifest_path.clone(),
                            extension: self.key.extension.clone(),
                            listen_in: self.listen_in,
                        };
                        let drain = drain_rx.clone();
                        let guard = conn_tx.clone();
                        tokio::spawn(async move {
                            if let Err(err) = connection::relay(spec, stream, drain, guard).await {
                                warn!(error = %err, "connection failed");
                            }
                        });
                    }
                    Err(err) => {
                        if retries < ACCEPT_RETRY_LIMIT {
                            retries += 1;
                            warn!(
                                extension = %self.key.extension,
                                error = %err,
                                retry = retries,
                                "retrying accept"
                            );
                        } else {
                            return Err(ServerError::Accept {
                                extension: self.key.extension.clone(),
                                source: err,
                            });
                        }
                    }
                },
                _ = stop_rx.changed() => {
                    info!(extension = %self.key.extension, "closing server");
                    let _ = drain_tx.send(true);
                    drop(conn_tx);
                    debug!(extension = %self.key.extension, "waiting for connections to finish");
                    // Every connection holds a clone of conn_tx; recv yields
                    // None once the last one is gone. With zero connections
                    // this completes immediately.
                    while conn_rx.recv().await.is_some() {}
                    debug!(extension = %self.key.extension, "all connections exited");
                    return Ok(());
                }
            }
        }
    }
}
