//! Unix Socket Server
//!
//! JSON-lines API over a Unix domain socket. One request envelope per line,
//! one response envelope per line, correlated by id.
//!
//! # Limits
//! - **Connection limits**: Maximum concurrent connections enforced
//! - **Timeouts**: Read/write timeouts prevent resource exhaustion
//! - **Message limits**: Lines are bounded before they are buffered
//!
//! Reads are served from the latest published snapshot; writes are queued
//! for the next control cycle and answered once that cycle applied them.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

use ht_protocol::{Request, RequestEnvelope, Response, ResponseData, ResponseEnvelope};

use crate::control_loop::ControlHandle;

// ============================================================================
// Limits
// ============================================================================

/// Maximum concurrent client connections
const MAX_CONNECTIONS: usize = 16;

/// Maximum message size in bytes
const MAX_MESSAGE_SIZE: usize = ht_protocol::MAX_MESSAGE_SIZE;

/// Read timeout per message
const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Write timeout per message
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Owner and group read/write
const SOCKET_MODE: u32 = 0o660;

async fn read_line_bounded<R: tokio::io::AsyncBufRead + Unpin>(
    reader: &mut R,
    out: &mut Vec<u8>,
    max_len: usize,
) -> std::io::Result<usize> {
    out.clear();

    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(0);
        }

        let mut take_len = available.len();
        let mut found_newline = false;
        if let Some(pos) = available.iter().position(|b| *b == b'\n') {
            take_len = pos + 1;
            found_newline = true;
        }

        let remaining = max_len.saturating_sub(out.len());
        if take_len > remaining {
            let consume_len = remaining.min(available.len());
            reader.consume(consume_len);
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "Message too large",
            ));
        }

        out.extend_from_slice(&available[..take_len]);
        reader.consume(take_len);

        if found_newline {
            return Ok(out.len());
        }
    }
}

pub async fn run_server(
    socket_path: &Path,
    handle: ControlHandle,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    // Remove a stale socket, never a symlink
    if let Ok(metadata) = socket_path.symlink_metadata() {
        if metadata.file_type().is_symlink() {
            bail!("socket path {} is a symlink, refusing to replace it", socket_path.display());
        }
        std::fs::remove_file(socket_path)
            .with_context(|| format!("removing stale socket {}", socket_path.display()))?;
        debug!("Removed existing socket file");
    }

    let listener = UnixListener::bind(socket_path)
        .with_context(|| format!("binding {}", socket_path.display()))?;
    std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(SOCKET_MODE))?;

    info!(
        "STARTUP: listening on {} (mode {:o}, max_conn={}, max_msg={})",
        socket_path.display(),
        SOCKET_MODE,
        MAX_CONNECTIONS,
        MAX_MESSAGE_SIZE
    );

    let active = Arc::new(AtomicUsize::new(0));

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let current = active.load(Ordering::SeqCst);
                        if current >= MAX_CONNECTIONS {
                            warn!("Connection limit reached ({}), rejecting new connection", current);
                            drop(stream);
                            continue;
                        }

                        active.fetch_add(1, Ordering::SeqCst);
                        let active = active.clone();
                        let handle = handle.clone();
                        tokio::spawn(async move {
                            handle_client(stream, handle).await;
                            active.fetch_sub(1, Ordering::SeqCst);
                        });
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    let _ = std::fs::remove_file(socket_path);
    info!("SHUTDOWN: server stopped");
    Ok(())
}

async fn handle_client(stream: UnixStream, handle: ControlHandle) {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line: Vec<u8> = Vec::with_capacity(1024);
    let mut request_count: u64 = 0;

    loop {
        let read_result = timeout(READ_TIMEOUT, read_line_bounded(&mut reader, &mut line, MAX_MESSAGE_SIZE)).await;

        match read_result {
            Ok(Ok(0)) => {
                debug!(requests = request_count, "Client disconnected");
                break;
            }
            Ok(Ok(n)) => {
                request_count += 1;
                trace!("Request #{}: {} bytes", request_count, n);

                let response = match std::str::from_utf8(&line) {
                    Ok(text) => process_request(text, &handle).await,
                    Err(e) => {
                        debug!("Non-UTF8 request: {}", e);
                        ResponseEnvelope::new(0, Response::error("Invalid request encoding"))
                    }
                };

                if send_response(&mut writer, &response).await.is_err() {
                    break;
                }
            }
            Ok(Err(e)) => {
                if e.kind() == std::io::ErrorKind::InvalidData {
                    warn!("Message too large (>{} bytes)", MAX_MESSAGE_SIZE);
                    let response = ResponseEnvelope::new(0, Response::error("Message too large"));
                    let _ = send_response(&mut writer, &response).await;
                } else {
                    error!("Read error: {}", e);
                }
                break;
            }
            Err(_) => {
                debug!("Read timeout");
                let response = ResponseEnvelope::new(0, Response::error("Read timeout"));
                let _ = send_response(&mut writer, &response).await;
                break;
            }
        }
    }
}

async fn send_response(
    writer: &mut tokio::net::unix::OwnedWriteHalf,
    response: &ResponseEnvelope,
) -> Result<(), ()> {
    let json = serde_json::to_string(response).unwrap_or_else(|_| {
        r#"{"id":0,"status":"error","message":"Serialization error"}"#.to_string()
    });

    let write_result = timeout(WRITE_TIMEOUT, async {
        writer.write_all(json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        Ok::<_, std::io::Error>(())
    })
    .await;

    match write_result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            error!("Write error: {}", e);
            Err(())
        }
        Err(_) => {
            error!("Write timeout");
            Err(())
        }
    }
}

pub async fn process_request(line: &str, handle: &ControlHandle) -> ResponseEnvelope {
    let envelope: RequestEnvelope = match serde_json::from_str(line.trim()) {
        Ok(e) => e,
        Err(e) => {
            debug!("Invalid JSON: {}", e);
            return ResponseEnvelope::new(0, Response::error("Invalid request format"));
        }
    };

    let request_id = envelope.id;
    let request = envelope.request;
    debug!("Processing {} (id={})", request.type_name(), request_id);

    let response = match &request {
        Request::Ping => Response::Ok(ResponseData::string("pong".to_string())),
        Request::Version => Response::Ok(ResponseData::string(env!("CARGO_PKG_VERSION").to_string())),
        Request::GetSnapshot => Response::Ok(ResponseData::snapshot((*handle.snapshot()).clone())),
        Request::GetHealthSummary => Response::Ok(ResponseData::health(handle.snapshot().health.clone())),
        Request::RequestMode { .. } | Request::RequestManualActuator { .. } => match request.as_command() {
            Some(command) => match handle.submit(command).await {
                Ok(Ok(())) => {
                    info!(?command, "ACTION: command applied");
                    Response::ok()
                }
                Ok(Err(rejection)) => Response::rejected(rejection),
                Err(e) => {
                    warn!(?command, "Command not applied: {}", e);
                    Response::error(e.to_string())
                }
            },
            None => Response::error("Request carries no command"),
        },
    };

    ResponseEnvelope::new(request_id, response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_loop::{channels, run_control_loop};
    use ht_core::engine::RecordingSleeper;
    use ht_core::{ControlLoop, ScriptedChannel, Settings};

    fn spawn_rig() -> (ControlHandle, watch::Sender<bool>) {
        let channel = Arc::new(ScriptedChannel::new());
        channel.set_value("collector", 60.0);
        for id in ["tank_top", "tank_middle", "tank_bottom"] {
            channel.set_value(id, 50.0);
        }
        let control =
            ControlLoop::new(&Settings::default(), channel).with_sleeper(Arc::new(RecordingSleeper::new()));
        let (handle, loop_channels) = channels(control.snapshot().clone());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(run_control_loop(
            control,
            loop_channels,
            shutdown_rx,
            Duration::from_millis(20),
        ));
        (handle, shutdown_tx)
    }

    async fn request(line: &str, handle: &ControlHandle) -> serde_json::Value {
        let response = process_request(line, handle).await;
        serde_json::to_value(response).unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_read_requests() {
        let (handle, _shutdown) = spawn_rig();

        let pong = request(r#"{"id":1,"cmd":"Ping"}"#, &handle).await;
        assert_eq!(pong["id"], 1);
        assert_eq!(pong["status"], "ok");
        assert_eq!(pong["value"], "pong");

        let bad = request("not json", &handle).await;
        assert_eq!(bad["status"], "error");

        let health = request(r#"{"id":2,"cmd":"GetHealthSummary"}"#, &handle).await;
        assert!(health["health"]["healthy_count"].is_number());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_write_requests_are_answered_after_cycle() {
        let (handle, _shutdown) = spawn_rig();

        let rejected = request(
            r#"{"id":3,"cmd":"RequestManualActuator","data":{"actuator":"heater","on":true}}"#,
            &handle,
        )
        .await;
        assert_eq!(rejected["status"], "rejected");
        assert_eq!(rejected["rejection"]["reason"], "not_in_manual_mode");

        let ok = request(r#"{"id":4,"cmd":"RequestMode","data":{"mode":"eco"}}"#, &handle).await;
        assert_eq!(ok["status"], "ok");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_socket_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("heliotherm.sock");
        let (handle, shutdown) = spawn_rig();

        let server_socket = socket.clone();
        let server_shutdown = shutdown.subscribe();
        let server = tokio::spawn(async move { run_server(&server_socket, handle, server_shutdown).await });

        let mut stream = None;
        for _ in 0..50 {
            if let Ok(s) = UnixStream::connect(&socket).await {
                stream = Some(s);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let stream = stream.expect("server never came up");
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        writer.write_all(b"{\"id\":9,\"cmd\":\"Version\"}\n").await.unwrap();
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        let response: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(response["id"], 9);
        assert_eq!(response["value"], env!("CARGO_PKG_VERSION"));

        shutdown.send_replace(true);
        server.await.unwrap().unwrap();
        assert!(!socket.exists());
    }
}
