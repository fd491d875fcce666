//! fancond — the privileged fan-control daemon (spec §1, §5, §6).
//!
//! Monitors temperature sensors and drives PWM fans per the loaded
//! `Controller`'s device set, and serves the RPC surface defined in
//! `fancon_protocol` over a Unix domain socket. Grounded on the teacher's
//! `hf-daemon::main` hardening texture (environment sanitisation, resource
//! limits, PID file, signal wiring) with the control logic itself
//! delegated entirely to `fancon_core::Controller`.

mod server;

use std::path::Path;
use std::sync::Arc;

use fancon_core::Controller;
use tracing::{debug, error, info, warn};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get default socket path.
fn default_socket_path() -> &'static str {
    if Path::new("/run").exists() {
        "/run/fancond.sock"
    } else {
        "/var/run/fancond.sock"
    }
}

fn default_pid_file() -> &'static str {
    if Path::new("/run").exists() {
        "/run/fancond.pid"
    } else {
        "/var/run/fancond.pid"
    }
}

// ============================================================================
// Security hardening (spec §6 "privileged background service")
// ============================================================================

/// Remove environment variables that could be abused to hijack a
/// privileged process's dynamic linking or locale-dependent parsing.
fn sanitize_environment() {
    const DANGEROUS_VARS: &[&str] = &[
        "LD_PRELOAD",
        "LD_LIBRARY_PATH",
        "LD_AUDIT",
        "LD_DEBUG",
        "LD_PROFILE",
        "MALLOC_CHECK_",
        "HOSTALIASES",
        "LOCALDOMAIN",
        "RES_OPTIONS",
        "TMPDIR",
        "IFS",
        "PATH",
    ];
    for var in DANGEROUS_VARS {
        std::env::remove_var(var);
    }
    std::env::set_var("PATH", "/usr/sbin:/usr/bin:/sbin:/bin");
    std::env::set_var("LC_ALL", "C");
    std::env::set_var("LANG", "C");
}

fn set_rlimit(resource: libc::c_int, soft: u64, hard: u64) {
    let limit = libc::rlimit { rlim_cur: soft as libc::rlim_t, rlim_max: hard as libc::rlim_t };
    // SAFETY: setrlimit is safe with a valid resource constant and an
    // initialized rlimit struct, both of which are guaranteed here.
    unsafe {
        #[allow(clippy::useless_conversion)]
        if libc::setrlimit(resource as libc::__rlimit_resource_t, &limit) != 0 {
            warn!(resource, "failed to set rlimit");
        }
    }
}

fn set_resource_limits() {
    set_rlimit(libc::RLIMIT_CORE, 0, 0);
    set_rlimit(libc::RLIMIT_NOFILE, 1024, 1024);
    set_rlimit(libc::RLIMIT_AS, 256 * 1024 * 1024, 256 * 1024 * 1024);
}

fn set_secure_umask() {
    // SAFETY: umask always succeeds; it only sets the process's file
    // creation mask.
    unsafe {
        libc::umask(0o077);
    }
}

fn secure_working_directory() {
    if std::env::set_current_dir("/").is_err() {
        warn!("could not chdir to /");
    }
}

fn verify_privileges() -> Result<(), &'static str> {
    // SAFETY: geteuid/getuid always succeed.
    let euid = unsafe { libc::geteuid() };
    if euid != 0 {
        return Err("fancond must run as root (euid=0) for hardware access");
    }
    Ok(())
}

fn validate_socket_path(path: &str) -> Result<(), String> {
    let p = Path::new(path);
    if !p.is_absolute() {
        return Err("socket path must be absolute".into());
    }
    if path.contains("..") || path.contains('\0') {
        return Err("socket path contains path traversal or a null byte".into());
    }
    let safe_dirs = ["/run/", "/var/run/", "/tmp/"];
    if !safe_dirs.iter().any(|d| path.starts_with(d)) {
        return Err(format!("socket path must be under {safe_dirs:?}"));
    }
    if p.symlink_metadata().map(|m| m.file_type().is_symlink()).unwrap_or(false) {
        return Err("socket path is a symlink, refusing for security".into());
    }
    Ok(())
}

fn write_pid_file(path: &str) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    if Path::new(path).exists() {
        if let Ok(content) = std::fs::read_to_string(path) {
            if let Ok(old_pid) = content.trim().parse::<i32>() {
                // SAFETY: kill(pid, 0) only probes liveness, sends nothing.
                if unsafe { libc::kill(old_pid, 0) } == 0 {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::AddrInUse,
                        format!("another fancond instance is running (pid {old_pid})"),
                    ));
                }
            }
        }
        let _ = std::fs::remove_file(path);
    }

    let mut file =
        std::fs::OpenOptions::new().write(true).create_new(true).mode(0o644).open(path)?;
    writeln!(file, "{}", std::process::id())?;
    file.sync_all()
}

fn cleanup(socket_path: &str, pid_file: &str) {
    if Path::new(socket_path).exists() {
        let _ = std::fs::remove_file(socket_path);
    }
    if Path::new(pid_file).exists() {
        let _ = std::fs::remove_file(pid_file);
    }
}

fn init_logging() {
    let log_level = std::env::var_os("FANCON_LOG")
        .and_then(|v| v.into_string().ok())
        .unwrap_or_else(|| "info".to_string());

    // spec §6: $JOURNAL_STREAM (or a running journald socket) selects
    // journald-friendly formatting over plain stdout.
    let use_journald =
        std::env::var_os("JOURNAL_STREAM").is_some() || Path::new("/run/systemd/journal/socket").exists();

    if use_journald {
        match tracing_journald::layer() {
            Ok(layer) => {
                use tracing_subscriber::prelude::*;
                tracing_subscriber::registry()
                    .with(layer)
                    .with(tracing_subscriber::EnvFilter::new(&log_level))
                    .init();
                return;
            }
            Err(e) => {
                eprintln!("failed to open journald layer ({e}), falling back to stdout");
            }
        }
    }

    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(log_level)
        .init();
}

fn print_help() {
    eprintln!("fancond {VERSION} - fancon privileged fan-control daemon");
    eprintln!();
    eprintln!("USAGE:");
    eprintln!("    fancond [OPTIONS]");
    eprintln!();
    eprintln!("OPTIONS:");
    eprintln!("    -s, --socket PATH   Socket path (default: {})", default_socket_path());
    eprintln!("    -c, --config PATH   Device configuration path (default: /etc/fancon/devices.json)");
    eprintln!("    -v, --version       Print version");
    eprintln!("    -h, --help          Print this help");
    eprintln!();
    eprintln!("ENVIRONMENT:");
    eprintln!("    FANCON_LOG          Log level (trace, debug, info, warn, error)");
    eprintln!("    JOURNAL_STREAM      Consulted to select journald-formatted logging");
}

struct Args {
    socket_path: String,
    config_path: std::path::PathBuf,
}

fn parse_args() -> Option<Args> {
    let mut socket_path = default_socket_path().to_string();
    let mut config_path = std::path::PathBuf::from(fancon_core::constants::paths::DEFAULT_CONFIG_PATH);

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_help();
                return None;
            }
            "-v" | "--version" => {
                println!("fancond {VERSION}");
                return None;
            }
            "-s" | "--socket" => {
                i += 1;
                socket_path = args.get(i).cloned().unwrap_or_else(|| {
                    eprintln!("error: --socket requires a path argument");
                    std::process::exit(1);
                });
            }
            "-c" | "--config" => {
                i += 1;
                config_path = args.get(i).map(std::path::PathBuf::from).unwrap_or_else(|| {
                    eprintln!("error: --config requires a path argument");
                    std::process::exit(1);
                });
            }
            other => {
                eprintln!("unknown argument: {other}");
                print_help();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    Some(Args { socket_path, config_path })
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    sanitize_environment();
    set_secure_umask();
    set_resource_limits();
    secure_working_directory();

    let Some(args) = parse_args() else {
        return Ok(());
    };

    init_logging();
    info!(version = VERSION, "fancond starting");

    if let Err(e) = verify_privileges() {
        error!("{e}");
        std::process::exit(1);
    }
    if let Err(e) = validate_socket_path(&args.socket_path) {
        error!("invalid socket path: {e}");
        std::process::exit(1);
    }

    let pid_file = default_pid_file().to_string();
    if let Err(e) = write_pid_file(&pid_file) {
        error!("could not write PID file: {e}");
        std::process::exit(1);
    }

    let controller = match Controller::load(&args.config_path) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!("fatal: failed to load device configuration: {e}");
            cleanup(&args.socket_path, &pid_file);
            std::process::exit(1);
        }
    };
    controller.enable_all();

    // spec §5: signal handling lives only in the top-level supervisor.
    // SIGHUP reloads; SIGTERM/SIGINT/SIGABRT stop the daemon.
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
    let mut sigabrt = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::from_raw(libc::SIGABRT))?;
    let mut sighup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let controller_for_signals = controller.clone();
    let signal_task = tokio::spawn(async move {
        let mut shutdown_tx = Some(shutdown_tx);
        loop {
            tokio::select! {
                _ = sigterm.recv() => { info!("SIGTERM received, stopping"); break; }
                _ = sigint.recv() => { info!("SIGINT received, stopping"); break; }
                _ = sigabrt.recv() => { info!("SIGABRT received, stopping"); break; }
                _ = sighup.recv() => {
                    info!("SIGHUP received, reloading configuration");
                    if let Err(e) = controller_for_signals.reload().await {
                        warn!("reload failed: {e}");
                    }
                    continue;
                }
            }
        }
        if let Some(tx) = shutdown_tx.take() {
            let _ = tx.send(());
        }
    });

    info!(socket = %args.socket_path, config = %args.config_path.display(), "fancond ready");

    let server_result = server::run_server(&args.socket_path, controller.clone(), shutdown_rx).await;

    signal_task.abort();
    controller.disable_all().await;
    cleanup(&args.socket_path, &pid_file);

    if let Err(e) = server_result {
        error!("server error: {e}");
        std::process::exit(1);
    }

    debug!("fancond stopped cleanly");
    Ok(())
}
