//! One accepted socket connection proxied to one spawned native app.

use std::io;
use std::path::PathBuf;
use std::process::Stdio;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::framing::{Direction, StreamSniffer};

const COPY_BUF_LEN: usize = 8192;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("could not start {executable} for {extension}: {source}")]
    Spawn {
        executable: PathBuf,
        extension: String,
        #[source]
        source: io::Error,
    },
    #[error("could not open a stdio pipe to the native app for {extension}")]
    Pipe { extension: String },
}

/// Everything a connection needs to know about the native app it fronts.
#[derive(Debug, Clone)]
pub struct ConnectionSpec {
    pub executable: PathBuf,
    pub manifest_path: PathBuf,
    pub extension: String,
    pub listen_in: bool,
}

/// Proxies one accepted connection to a freshly spawned native app until
/// either stream ends, an I/O error occurs, or the owning server asks the
/// connection to drain.
///
/// The `guard` sender is the server's connection wait-group: it is dropped
/// exactly once on every exit path, which is what lets the server's drain
/// phase observe completion.
pub async fn relay(
    spec: ConnectionSpec,
    stream: UnixStream,
    mut drain: watch::Receiver<bool>,
    guard: mpsc::Sender<()>,
) -> Result<(), ConnectionError> {
    let _guard = guard;
    info!(extension = %spec.extension, "new connection");

    let mut command = Command::new(&spec.executable);
    command
        .arg(&spec.manifest_path)
        .arg(&spec.extension)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped());
    if let Some(dir) = spec.executable.parent() {
        command.current_dir(dir);
    }
    let mut child = command.spawn().map_err(|source| ConnectionError::Spawn {
        executable: spec.executable.clone(),
        extension: spec.extension.clone(),
        source,
    })?;
    let child_stdin = child.stdin.take().ok_or_else(|| ConnectionError::Pipe {
        extension: spec.extension.clone(),
    })?;
    let child_stdout = child.stdout.take().ok_or_else(|| ConnectionError::Pipe {
        extension: spec.extension.clone(),
    })?;

    let (sock_read, sock_write) = stream.into_split();
    let (done_tx, mut done_rx) = mpsc::channel::<io::Result<()>>(2);

    let outbound = tokio::spawn(copy_observed(
        sock_read,
        child_stdin,
        spec.listen_in
            .then(|| StreamSniffer::new(Direction::ToApp, spec.extension.clone())),
        done_tx.clone(),
    ));
    let inbound = tokio::spawn(copy_observed(
        child_stdout,
        sock_write,
        spec.listen_in
            .then(|| StreamSniffer::new(Direction::ToExtension, spec.extension.clone())),
        done_tx,
    ));

    tokio::select! {
        finished = done_rx.recv() => match finished {
            Some(Ok(())) => debug!(extension = %spec.extension, "end of stream"),
            Some(Err(err)) => {
                warn!(extension = %spec.extension, error = %err, "stream copy failed");
            }
            None => {}
        },
        _ = drain.changed() => debug!(extension = %spec.extension, "drain requested"),
    }

    info!(extension = %spec.extension, "stopping connection");

    // Dropping the copy tasks closes the socket halves and the app's stdin;
    // stdin EOF is the only stop signal the native app gets, there is no
    // forced kill.
    outbound.abort();
    inbound.abort();
    let _ = child.wait().await;
    debug!(extension = %spec.extension, "connection exited");
    Ok(())
}

async fn copy_observed<R, W>(
    mut reader: R,
    mut writer: W,
    mut sniffer: Option<StreamSniffer>,
    done: mpsc::Sender<io::Result<()>>,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; COPY_BUF_LEN];
    let result = loop {
        match reader.read(&mut buf).await {
            Ok(0) => break Ok(()),
            Ok(n) => {
                if let Some(sniffer) = sniffer.as_mut() {
                    sniffer.observe(&buf[..n]);
                }
                if let Err(err) = writer.write_all(&buf[..n]).await {
                    break Err(err);
                }
                if let Err(err) = writer.flush().await {
                    break Err(err);
                }
            }
            Err(err) => break Err(err),
        }
    };
    let _ = done.send(result).await;
}
