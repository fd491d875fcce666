//! Unix Socket Server (Hardened)
//!
//! A **security-hardened** async server dispatching the `fancon_protocol`
//! RPC surface against a shared `fancon_core::Controller`.
//!
//! # Security Features
//! - **Socket permissions**: Restrictive mode with symlink attack prevention
//! - **Peer credentials**: Full audit logging of UID/GID/PID for every request
//! - **Connection limits**: Maximum concurrent connections enforced
//! - **Rate limiting**: Per-client request rate limiting
//! - **Timeouts**: Read/write timeouts prevent resource exhaustion
//! - **Message limits**: Maximum message size prevents memory exhaustion

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use fancon_core::Controller;
use fancon_protocol::{Request, Response, ResponseEnvelope};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

// ============================================================================
// Security constants
// ============================================================================

const MAX_CONNECTIONS: usize = 64;
const MAX_MESSAGE_SIZE: usize = fancon_protocol::MAX_MESSAGE_SIZE;
const READ_TIMEOUT: Duration = Duration::from_secs(30);
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

const DEFAULT_RATE_LIMIT_REQUESTS: u32 = 1500;
pub const MIN_RATE_LIMIT: u32 = 100;
pub const MAX_RATE_LIMIT: u32 = 9999;
const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(10);

/// Socket permissions (0666). Client validation via executable path check
/// and peer-credential audit logging carry the rest of the trust decision.
const SOCKET_MODE: u32 = 0o666;

static ACTIVE_CONNECTIONS: AtomicUsize = AtomicUsize::new(0);

// ============================================================================
// Bounded, newline-delimited reader
// ============================================================================

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
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "message too large"));
        }

        out.extend_from_slice(&available[..take_len]);
        reader.consume(take_len);

        if found_newline {
            return Ok(out.len());
        }
    }
}

// ============================================================================
// Rate limiting (keyed by peer UID)
// ============================================================================

struct ClientState {
    request_count: u32,
    window_start: Instant,
}

struct RateLimiter {
    clients: HashMap<u32, ClientState>,
    max_requests: u32,
}

impl RateLimiter {
    fn new() -> Self {
        Self { clients: HashMap::new(), max_requests: DEFAULT_RATE_LIMIT_REQUESTS }
    }

    fn check_and_increment(&mut self, uid: u32) -> bool {
        let now = Instant::now();
        let state = self.clients.entry(uid).or_insert(ClientState { request_count: 0, window_start: now });

        if now.duration_since(state.window_start) > RATE_LIMIT_WINDOW {
            state.request_count = 0;
            state.window_start = now;
        }

        if state.request_count >= self.max_requests {
            return false;
        }
        state.request_count += 1;
        true
    }

    fn cleanup(&mut self) {
        let now = Instant::now();
        self.clients.retain(|_, state| now.duration_since(state.window_start) < RATE_LIMIT_WINDOW * 2);
    }
}

// ============================================================================
// Server
// ============================================================================

/// Run the Unix socket server with full security hardening (spec §5, §6).
/// Returns once `shutdown` fires, which `main`'s signal loop does on
/// SIGTERM/SIGINT/SIGABRT (or a `StopService` RPC raising SIGTERM).
pub async fn run_server(
    socket_path: &str,
    controller: Arc<Controller>,
    mut shutdown: tokio::sync::oneshot::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error>> {
    let path = Path::new(socket_path);

    if path.exists() {
        let metadata = path.symlink_metadata()?;
        if metadata.file_type().is_symlink() {
            return Err("socket path is a symlink, refusing for security".into());
        }
        std::fs::remove_file(path)?;
        debug!("removed stale socket file");
    }

    let listener = UnixListener::bind(socket_path)?;
    std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(SOCKET_MODE))?;

    info!(socket = %socket_path, mode = format!("{SOCKET_MODE:o}"), "listening");
    info!(
        max_connections = MAX_CONNECTIONS,
        max_message_size = MAX_MESSAGE_SIZE,
        rate_limit = DEFAULT_RATE_LIMIT_REQUESTS,
        "security limits"
    );

    let rate_limiter = Arc::new(Mutex::new(RateLimiter::new()));

    let cleanup_limiter = rate_limiter.clone();
    let cleanup_task = tokio::spawn(async move {
        loop {
            tokio::time::sleep(RATE_LIMIT_WINDOW).await;
            cleanup_limiter.lock().await.cleanup();
        }
    });

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let current = ACTIVE_CONNECTIONS.load(Ordering::SeqCst);
                        if current >= MAX_CONNECTIONS {
                            warn!(current, "connection limit reached, rejecting");
                            drop(stream);
                            continue;
                        }

                        ACTIVE_CONNECTIONS.fetch_add(1, Ordering::SeqCst);
                        let rate_limiter = rate_limiter.clone();
                        let controller = controller.clone();

                        tokio::spawn(async move {
                            handle_client(stream, rate_limiter, controller).await;
                            ACTIVE_CONNECTIONS.fetch_sub(1, Ordering::SeqCst);
                        });
                    }
                    Err(e) => error!(error = %e, "accept failed"),
                }
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, closing listener");
                break;
            }
        }
    }

    cleanup_task.abort();
    let _ = std::fs::remove_file(socket_path);
    Ok(())
}

#[derive(Debug, Clone, Copy)]
struct PeerCredentials {
    uid: u32,
    gid: u32,
    pid: i32,
}

fn get_peer_credentials(stream: &UnixStream) -> Option<PeerCredentials> {
    use std::os::unix::io::AsRawFd;
    let fd = stream.as_raw_fd();

    #[cfg(target_os = "linux")]
    {
        // SAFETY: ucred has no pointers; zeroing gives a valid initial value.
        let mut cred: libc::ucred = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;
        // SAFETY: fd is a valid socket fd, cred/len are correctly sized.
        let result = unsafe {
            libc::getsockopt(fd, libc::SOL_SOCKET, libc::SO_PEERCRED, &mut cred as *mut _ as *mut libc::c_void, &mut len)
        };
        if result == 0 {
            return Some(PeerCredentials { uid: cred.uid, gid: cred.gid, pid: cred.pid });
        }
    }

    #[cfg(any(target_os = "freebsd", target_os = "openbsd", target_os = "netbsd", target_os = "dragonfly", target_os = "macos"))]
    {
        let mut uid: libc::uid_t = 0;
        let mut gid: libc::gid_t = 0;
        // SAFETY: fd is a valid socket fd, uid/gid are valid out-params.
        let result = unsafe { libc::getpeereid(fd, &mut uid, &mut gid) };
        if result == 0 {
            return Some(PeerCredentials { uid, gid, pid: 0 });
        }
    }

    None
}

/// Reject clients whose executable isn't a recognised fancon binary. Dev
/// builds running straight out of `target/` are allowed through.
fn validate_client(cred: &PeerCredentials) -> Result<(), String> {
    #[cfg(target_os = "linux")]
    {
        let exe_path = format!("/proc/{}/exe", cred.pid);
        match std::fs::read_link(&exe_path) {
            Ok(exe) => {
                let exe_str = exe.to_string_lossy();
                if exe_str.contains("/fanconctl") || exe_str.contains("/fancond") || exe_str.contains("/target/") {
                    debug!(exe = %exe_str, pid = cred.pid, "validated client");
                    return Ok(());
                }
                warn!(exe = %exe_str, pid = cred.pid, uid = cred.uid, "rejected unauthorized client");
                Err(format!("unauthorized client: {exe_str}"))
            }
            Err(_) => {
                debug!(pid = cred.pid, "could not read executable path, allowing connection");
                Ok(())
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    {
        debug!("client validation skipped on non-Linux platform");
        Ok(())
    }
}

async fn handle_client(stream: UnixStream, rate_limiter: Arc<Mutex<RateLimiter>>, controller: Arc<Controller>) {
    let cred = match get_peer_credentials(&stream) {
        Some(c) => c,
        None => {
            error!("failed to get peer credentials, rejecting connection");
            return;
        }
    };

    if let Err(e) = validate_client(&cred) {
        error!(error = %e, "client validation failed");
        let mut stream = stream;
        let _ = send_response_sync(&mut stream, &ResponseEnvelope::new(0, Response::unavailable("unauthorized"))).await;
        return;
    }

    info!(uid = cred.uid, gid = cred.gid, pid = cred.pid, "client connected");

    let (reader, writer) = stream.into_split();
    let writer = Arc::new(Mutex::new(writer));
    let mut reader = BufReader::new(reader);
    let mut line: Vec<u8> = Vec::with_capacity(4096);
    let mut request_count: u64 = 0;
    let connection_start = Instant::now();
    let mut stream_tasks: Vec<tokio::task::JoinHandle<()>> = Vec::new();

    loop {
        let read_result = timeout(READ_TIMEOUT, read_line_bounded(&mut reader, &mut line, MAX_MESSAGE_SIZE)).await;

        match read_result {
            Ok(Ok(0)) => {
                debug!(uid = cred.uid, pid = cred.pid, requests = request_count, elapsed = ?connection_start.elapsed(), "client disconnected");
                break;
            }
            Ok(Ok(_)) => {
                if !rate_limiter.lock().await.check_and_increment(cred.uid) {
                    warn!(uid = cred.uid, pid = cred.pid, "rate limit exceeded");
                    send_response(&writer, &ResponseEnvelope::new(0, Response::unavailable("rate limit exceeded"))).await;
                    continue;
                }

                request_count += 1;
                let line_str = match std::str::from_utf8(&line) {
                    Ok(s) => s,
                    Err(e) => {
                        debug!(uid = cred.uid, error = %e, "non-UTF8 request");
                        send_response(&writer, &ResponseEnvelope::new(0, Response::internal("invalid request encoding"))).await;
                        break;
                    }
                };
                trace!(request = request_count, uid = cred.uid, bytes = line_str.len(), "request");

                let envelope: fancon_protocol::RequestEnvelope = match serde_json::from_str(line_str.trim()) {
                    Ok(e) => e,
                    Err(e) => {
                        debug!(uid = cred.uid, error = %e, "invalid JSON");
                        send_response(&writer, &ResponseEnvelope::new(0, Response::internal("invalid request format"))).await;
                        continue;
                    }
                };

                if envelope.request.is_streaming() {
                    let controller = controller.clone();
                    let writer = writer.clone();
                    let id = envelope.id;
                    stream_tasks.push(tokio::spawn(async move {
                        serve_streaming(controller, writer, id, envelope.request).await;
                    }));
                } else {
                    let response = dispatch(&controller, envelope.request).await;
                    send_response(&writer, &ResponseEnvelope::new(envelope.id, response)).await;
                }
            }
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::InvalidData => {
                warn!(uid = cred.uid, pid = cred.pid, limit = MAX_MESSAGE_SIZE, "message too large");
                send_response(&writer, &ResponseEnvelope::new(0, Response::internal("message too large"))).await;
                break;
            }
            Ok(Err(e)) => {
                error!(uid = cred.uid, pid = cred.pid, error = %e, "read error");
                break;
            }
            Err(_) => {
                debug!(uid = cred.uid, pid = cred.pid, "read timeout");
                send_response(&writer, &ResponseEnvelope::new(0, Response::internal("read timeout"))).await;
                break;
            }
        }
    }

    for task in stream_tasks {
        task.abort();
    }
}

async fn send_response(writer: &Arc<Mutex<OwnedWriteHalf>>, envelope: &ResponseEnvelope) {
    let mut writer = writer.lock().await;
    let json = serde_json::to_string(envelope)
        .unwrap_or_else(|_| r#"{"id":0,"status":"error","code":"internal","message":"serialization error"}"#.to_string());

    let result = timeout(WRITE_TIMEOUT, async {
        writer.write_all(json.as_bytes()).await?;
        writer.write_all(b"\n").await
    })
    .await;

    if let Ok(Err(e)) = result {
        error!(error = %e, "write error");
    } else if result.is_err() {
        error!("write timeout");
    }
}

async fn send_response_sync(stream: &mut UnixStream, envelope: &ResponseEnvelope) -> Result<(), ()> {
    let json = serde_json::to_string(envelope).map_err(|_| ())?;
    stream.write_all(json.as_bytes()).await.map_err(|_| ())?;
    stream.write_all(b"\n").await.map_err(|_| ())?;
    stream.flush().await.map_err(|_| ())
}

/// Dispatch every non-streaming RPC verb (spec §6) against the shared
/// `Controller`.
async fn dispatch(controller: &Arc<Controller>, request: Request) -> Response {
    match request {
        Request::StopService => {
            // Actual shutdown is driven by the signal handler in `main`;
            // this just acknowledges that the daemon is about to stop.
            std::thread::spawn(|| {
                std::thread::sleep(Duration::from_millis(50));
                // SAFETY: raise is safe with a valid signal number.
                unsafe { libc::raise(libc::SIGTERM) };
            });
            Response::ok()
        }
        Request::GetDevices => Response::ok_devices(controller.get_devices()),
        Request::SetDevices { devices } => match controller.set_devices(devices).await {
            Ok(()) => Response::ok(),
            Err(e) => error_response(&e),
        },
        Request::GetEnumeratedDevices => Response::ok_devices(controller.enumerate_devices()),
        Request::GetControllerConfig => Response::ok_config(controller.get_config()),
        Request::SetControllerConfig { config } => {
            controller.set_config(config);
            Response::ok()
        }
        Request::GetFanStatus { label } => match controller.status(&label) {
            Ok(status) => Response::ok_fan_status(status),
            Err(e) => error_response(&e),
        },
        Request::Enable { label } => match controller.enable(&label) {
            Ok(()) => Response::ok(),
            Err(e) => error_response(&e),
        },
        Request::EnableAll => {
            controller.enable_all();
            Response::ok()
        }
        Request::Disable { label } => match controller.disable(&label).await {
            Ok(()) => Response::ok(),
            Err(e) => error_response(&e),
        },
        Request::DisableAll => {
            controller.disable_all().await;
            Response::ok()
        }
        Request::Reload => match controller.reload().await {
            Ok(()) => Response::ok(),
            Err(e) => error_response(&e),
        },
        Request::NvInit => {
            let added = controller.nv_init();
            info!(added, "NVIDIA device enumeration");
            Response::ok()
        }
        Request::SubscribeDevices | Request::SubscribeFanStatus | Request::Test { .. } => {
            unreachable!("streaming requests are routed through serve_streaming")
        }
    }
}

fn error_response(e: &fancon_error::FanconError) -> Response {
    if e.is_not_found() {
        Response::not_found(e.to_string())
    } else if e.is_unavailable() {
        Response::unavailable(e.to_string())
    } else {
        Response::internal(e.to_string())
    }
}

/// Handle the three streaming RPC verbs (spec §6): each keeps emitting
/// `ResponseEnvelope`s under the same request id until the subscription
/// ends or the write side breaks.
async fn serve_streaming(controller: Arc<Controller>, writer: Arc<Mutex<OwnedWriteHalf>>, id: u64, request: Request) {
    match request {
        Request::SubscribeDevices => {
            let mut rx = controller.subscribe_devices();
            send_response(&writer, &ResponseEnvelope::new(id, Response::ok_devices(controller.get_devices()))).await;
            loop {
                match rx.recv().await {
                    Ok(devices) => send_response(&writer, &ResponseEnvelope::new(id, Response::ok_devices(devices))).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }
        Request::SubscribeFanStatus => {
            let mut rx = controller.subscribe_status();
            loop {
                match rx.recv().await {
                    Ok(status) => send_response(&writer, &ResponseEnvelope::new(id, Response::ok_fan_status(status))).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }
        Request::Test { label, forced } => {
            let writer_progress = writer.clone();
            let id_progress = id;
            let progress = move |pct: u8| {
                let writer = writer_progress.clone();
                let envelope = ResponseEnvelope::new(id_progress, Response::ok_test_progress(pct));
                tokio::spawn(async move {
                    send_response(&writer, &envelope).await;
                });
            };
            let result = controller.test(&label, forced, progress).await;
            match result {
                Ok(()) => send_response(&writer, &ResponseEnvelope::new(id, Response::ok())).await,
                Err(e) => send_response(&writer, &ResponseEnvelope::new(id, error_response(&e))).await,
            }
        }
        _ => unreachable!("non-streaming request routed to serve_streaming"),
    }
}
