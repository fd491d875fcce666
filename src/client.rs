//! Thin JSON-lines RPC client over the daemon's Unix domain socket (spec
//! §6). Speaks exactly the wire framing `fancon-daemon::server` serves:
//! one `RequestEnvelope` per line in, one or more `ResponseEnvelope`s
//! sharing the same id out.

use std::path::Path;
use std::time::Duration;

use fancon_error::{FanconError, Result};
use fancon_protocol::{Request, RequestEnvelope, Response, ResponseEnvelope};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

const CONNECT_TIMEOUT: Duration = Duration::from_millis(1000);

pub fn default_socket_path() -> &'static str {
    if Path::new("/run").exists() {
        "/run/fancond.sock"
    } else {
        "/var/run/fancond.sock"
    }
}

/// Connect to the daemon, mapping any failure to `UNAVAILABLE` (spec §7
/// "service down -> UNAVAILABLE").
pub async fn connect(socket_path: &str) -> Result<UnixStream> {
    tokio::time::timeout(CONNECT_TIMEOUT, UnixStream::connect(socket_path))
        .await
        .map_err(|_| FanconError::generic("timed out connecting to fancond"))?
        .map_err(|e| FanconError::generic(format!("could not connect to fancond at {socket_path}: {e}")))
}

async fn write_request(stream: &mut UnixStream, request: Request) -> Result<()> {
    let envelope = RequestEnvelope::new(request);
    let line = serde_json::to_string(&envelope)
        .map_err(|e| FanconError::generic(format!("failed to encode request: {e}")))?;
    stream.write_all(line.as_bytes()).await.map_err(|e| FanconError::generic(format!("write failed: {e}")))?;
    stream.write_all(b"\n").await.map_err(|e| FanconError::generic(format!("write failed: {e}")))
}

async fn read_response(reader: &mut (impl AsyncBufReadExt + Unpin)) -> Result<ResponseEnvelope> {
    let mut line = String::new();
    let n = reader
        .read_line(&mut line)
        .await
        .map_err(|e| FanconError::generic(format!("read failed: {e}")))?;
    if n == 0 {
        return Err(FanconError::generic("fancond closed the connection"));
    }
    serde_json::from_str(line.trim()).map_err(|e| FanconError::generic(format!("invalid response: {e}")))
}

/// One request, one response (every non-streaming RPC verb).
pub async fn call(socket_path: &str, request: Request) -> Result<Response> {
    let mut stream = connect(socket_path).await?;
    write_request(&mut stream, request).await?;
    let (read_half, _write_half) = stream.split();
    let mut reader = BufReader::new(read_half);
    Ok(read_response(&mut reader).await?.response)
}

/// `Test` streams progress percentages under the same request id before a
/// terminal `Ok`/`Error` response (spec §4.3, §6). `on_progress` is
/// invoked for each intermediate tick; the terminal response is returned.
pub async fn call_test(
    socket_path: &str,
    label: String,
    forced: bool,
    mut on_progress: impl FnMut(u8),
) -> Result<Response> {
    let mut stream = connect(socket_path).await?;
    write_request(&mut stream, Request::Test { label, forced }).await?;
    let (read_half, _write_half) = stream.split();
    let mut reader = BufReader::new(read_half);

    loop {
        let envelope = read_response(&mut reader).await?;
        match envelope.response {
            Response::Ok(data) if data.test_progress.is_some() && data.devices.is_none() && data.fan_status.is_none() => {
                on_progress(data.test_progress.unwrap());
            }
            other => return Ok(other),
        }
    }
}
