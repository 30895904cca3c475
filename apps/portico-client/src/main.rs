//! Client stub launched by the browser in place of the real native app.
//!
//! The browser hands this process the native-messaging stdio streams; the
//! stub dials the bridge socket that lives next to its own executable and
//! copies bytes in both directions until either side closes. Everything
//! interesting happens on the other end of the socket.

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

use tokio::io::{self, AsyncWriteExt};
use tokio::net::UnixStream;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();

    // Chromium launches the host with the extension origin as the only
    // argument; Firefox passes the manifest path first and the extension id
    // last. Either way the extension identifier is the final argument.
    let extension_id = match args.len() {
        2 => args[1].clone(),
        3 => args[2].clone(),
        _ => {
            eprintln!("unsupported invocation: expected the extension id as the last argument");
            return ExitCode::from(1);
        }
    };

    let exe_dir = match env::current_exe() {
        Ok(path) => path.parent().map(PathBuf::from).unwrap_or_else(|| PathBuf::from(".")),
        Err(err) => {
            eprintln!("can't determine the executable path: {err}");
            return ExitCode::from(1);
        }
    };

    let socket_path = portico_paths::socket_path_in(&exe_dir, &extension_id);
    let stream = match UnixStream::connect(&socket_path).await {
        Ok(stream) => stream,
        Err(err) => {
            eprintln!("failed to dial bridge socket {}: {err}", socket_path.display());
            return ExitCode::from(1);
        }
    };
    let (mut sock_read, mut sock_write) = stream.into_split();

    let mut stdin = io::stdin();
    let mut stdout = io::stdout();

    let outbound = tokio::spawn(async move {
        let result = io::copy(&mut stdin, &mut sock_write).await;
        let _ = sock_write.shutdown().await;
        result
    });
    let inbound = tokio::spawn(async move {
        let result = io::copy(&mut sock_read, &mut stdout).await;
        let _ = stdout.flush().await;
        result
    });

    // The browser closing stdin and the bridge closing the socket are both
    // normal endings; whichever happens first ends the session.
    let finished = tokio::select! {
        result = outbound => result,
        result = inbound => result,
    };

    match finished {
        Ok(Ok(_)) => ExitCode::SUCCESS,
        Ok(Err(err)) => {
            eprintln!("relaying to the bridge socket failed: {err}");
            ExitCode::from(1)
        }
        Err(err) => {
            eprintln!("relay task failed: {err}");
            ExitCode::from(1)
        }
    }
}
