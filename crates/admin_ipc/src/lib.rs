//! Control channel for a running pipeline: one newline-delimited JSON
//! request and one response per Unix-socket connection.

use std::io::ErrorKind;
use std::sync::Arc;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use state::StatusSnapshot;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

pub const DEFAULT_SOCKET_PATH: &str = "/tmp/usaged.sock";

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "type", content = "payload")]
pub enum AdminRequest {
    /// Current phase and per-series progress.
    Status,
    /// Halt the pipeline at its next poll tick.
    Stop,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AdminStatus {
    pub run_id: String,
    pub pipeline: StatusSnapshot,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "type", content = "payload")]
pub enum AdminResponse {
    Status(AdminStatus),
    Ack,
    Error(String),
}

/// Accepts connections on `socket_path` until binding or accepting fails.
/// A stale socket file from an earlier run is replaced.
pub async fn run_server<F>(socket_path: &str, handler: F) -> Result<()>
where
    F: Fn(AdminRequest) -> Result<AdminResponse> + Send + Sync + 'static,
{
    remove_stale_socket(socket_path)?;
    let listener = UnixListener::bind(socket_path)?;
    let handler = Arc::new(handler);
    info!(socket = socket_path, "admin ipc listening");
    loop {
        let (stream, _) = listener.accept().await?;
        let handler = Arc::clone(&handler);
        tokio::spawn(async move {
            if let Err(err) = answer(stream, handler.as_ref()).await {
                warn!(error = ?err, "admin ipc connection failed");
            }
        });
    }
}

fn remove_stale_socket(socket_path: &str) -> Result<()> {
    match std::fs::remove_file(socket_path) {
        Ok(()) => {
            debug!(socket = socket_path, "removed stale admin socket");
            Ok(())
        }
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

async fn answer<F>(stream: UnixStream, handler: &F) -> Result<()>
where
    F: Fn(AdminRequest) -> Result<AdminResponse>,
{
    let (read_half, mut write_half) = stream.into_split();
    let mut line = String::new();
    if BufReader::new(read_half).read_line(&mut line).await? == 0 {
        return Ok(());
    }
    let response = match serde_json::from_str::<AdminRequest>(line.trim()) {
        Ok(request) => {
            debug!(?request, "admin request");
            handler(request).unwrap_or_else(|err| AdminResponse::Error(err.to_string()))
        }
        Err(err) => AdminResponse::Error(format!("malformed request: {err}")),
    };
    let reply = serde_json::to_string(&response)? + "\n";
    write_half.write_all(reply.as_bytes()).await?;
    Ok(())
}

pub async fn send_request(socket_path: &str, request: &AdminRequest) -> Result<AdminResponse> {
    let mut stream = UnixStream::connect(socket_path).await?;
    let line = serde_json::to_string(request)? + "\n";
    stream.write_all(line.as_bytes()).await?;
    let mut reply = String::new();
    if BufReader::new(stream).read_line(&mut reply).await? == 0 {
        bail!("admin socket {socket_path} closed without a response");
    }
    Ok(serde_json::from_str(reply.trim())?)
}
