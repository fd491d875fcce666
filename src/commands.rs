//! CLI command implementations, one per RPC verb exposed to the operator
//! (spec §6). Grounded on `original_source/src/Client.cpp`'s `status`,
//! `enable`, `disable`, `test`, `reload`, `stop_service`, `nv_init` and
//! `sysinfo` methods, translated from the gRPC stub calls they made into
//! calls through `crate::client` against the JSON-lines RPC surface.

use fancon_error::Result;
use fancon_protocol::{FanState, Response, StatusCode};
use tracing::{error, info, warn};

use crate::client;

fn status_text(state: FanState) -> &'static str {
    match state {
        FanState::Disabled => "disabled",
        FanState::Enabled => "enabled",
        FanState::Testing => "testing",
    }
}

fn print_error(action: &str, response: &Response) {
    if let Response::Error { code, message } = response {
        let code_text = match code {
            StatusCode::NotFound => "not found",
            StatusCode::Unavailable => "unavailable",
            StatusCode::Internal => "internal error",
            StatusCode::Ok => "ok",
        };
        error!("{action}: {code_text}: {message}");
    }
}

/// `status`: list every fan's current state, RPM and PWM (spec §3 FanStatus).
pub async fn status(socket_path: &str) -> Result<bool> {
    let response = client::call(socket_path, fancon_protocol::Request::GetDevices).await?;
    let devices = match response {
        Response::Ok(data) => match data.devices {
            Some(d) => d,
            None => {
                info!("no devices found");
                return Ok(true);
            }
        },
        ref other => {
            print_error("status", other);
            return Ok(false);
        }
    };

    if devices.fans.is_empty() {
        info!("no devices found");
        return Ok(true);
    }

    let longest_label = devices.fans.keys().map(|l| l.len()).max().unwrap_or(0);
    let mut ok = true;
    for label in devices.fans.keys() {
        match client::call(socket_path, fancon_protocol::Request::GetFanStatus { label: label.clone() }).await? {
            Response::Ok(data) => {
                if let Some(s) = data.fan_status {
                    let extras = if s.state == FanState::Disabled {
                        String::new()
                    } else {
                        format!(" {:>5}rpm {:>3}pwm", s.rpm, s.pwm)
                    };
                    println!("{:width$}: {:>8}{extras}", s.label, status_text(s.state), width = longest_label);
                }
            }
            ref other => {
                print_error(&format!("status({label})"), other);
                ok = false;
            }
        }
    }
    Ok(ok)
}

/// `enable`/`enable [fan]`: enable one fan, or every fan if no label given.
pub async fn enable(socket_path: &str, label: Option<String>) -> Result<bool> {
    let (request, verb) = match label {
        Some(label) => (fancon_protocol::Request::Enable { label: label.clone() }, label),
        None => (fancon_protocol::Request::EnableAll, "all fans".to_string()),
    };
    match client::call(socket_path, request).await? {
        Response::Ok(_) => {
            info!("{verb}: enabled");
            if verb == "all fans" {
                return status(socket_path).await;
            }
            Ok(true)
        }
        ref other => {
            print_error("enable", other);
            Ok(false)
        }
    }
}

/// `disable`/`disable [fan]`: disable one fan, or every fan if no label given.
pub async fn disable(socket_path: &str, label: Option<String>) -> Result<bool> {
    let (request, verb) = match label {
        Some(label) => (fancon_protocol::Request::Disable { label: label.clone() }, label),
        None => (fancon_protocol::Request::DisableAll, "all fans".to_string()),
    };
    match client::call(socket_path, request).await? {
        Response::Ok(_) => {
            info!("{verb}: disabled");
            if verb == "all fans" {
                return status(socket_path).await;
            }
            Ok(true)
        }
        ref other => {
            print_error("disable", other);
            Ok(false)
        }
    }
}

/// `test`/`test [fan]`: characterise one named fan, or every known fan
/// when no label is given (spec §4.3). Runs named-fan tests concurrently,
/// mirroring the original client's thread-per-fan fan-out.
pub async fn test(socket_path: &str, label: Option<String>, force_flag: bool) -> Result<bool> {
    // A named fan is always tested forced, matching how the flag's own
    // help text reads ("test [fan]  Test the fan (forced)"); `--force`
    // only changes behaviour for the all-fans sweep.
    let forced = label.is_some() || force_flag;

    let labels = match label {
        Some(label) => vec![label],
        None => {
            let devices = match client::call(socket_path, fancon_protocol::Request::GetDevices).await? {
                Response::Ok(data) => data.devices.unwrap_or_default(),
                ref other => {
                    print_error("test", other);
                    return Ok(false);
                }
            };
            if devices.fans.is_empty() {
                info!("no devices found");
                return Ok(true);
            }
            devices.fans.into_keys().collect()
        }
    };

    let mut handles = Vec::with_capacity(labels.len());
    for label in labels {
        let socket_path = socket_path.to_string();
        handles.push(tokio::spawn(async move { run_single_test(&socket_path, label, forced).await }));
    }

    let mut ok = true;
    for handle in handles {
        match handle.await {
            Ok(Ok(passed)) => ok &= passed,
            Ok(Err(e)) => {
                error!("test: {e}");
                ok = false;
            }
            Err(e) => {
                error!("test task panicked: {e}");
                ok = false;
            }
        }
    }
    Ok(ok)
}

async fn run_single_test(socket_path: &str, label: String, forced: bool) -> Result<bool> {
    let label_for_progress = label.clone();
    let response = client::call_test(socket_path, label.clone(), forced, move |pct| {
        info!("{label_for_progress}: {pct}%");
    })
    .await?;

    match response {
        Response::Ok(_) => Ok(true),
        other => {
            print_error(&format!("test({label})"), &other);
            Ok(false)
        }
    }
}

/// `reload`: reread the persisted device configuration (spec §4.4).
pub async fn reload(socket_path: &str) -> Result<bool> {
    match client::call(socket_path, fancon_protocol::Request::Reload).await? {
        Response::Ok(_) => {
            info!("reloaded");
            Ok(true)
        }
        ref other => {
            print_error("reload", other);
            Ok(false)
        }
    }
}

/// `stop-service`: ask the daemon to shut down.
pub async fn stop_service(socket_path: &str) -> Result<bool> {
    match client::call(socket_path, fancon_protocol::Request::StopService).await? {
        Response::Ok(_) => {
            info!("service stopped");
            Ok(true)
        }
        ref other => {
            print_error("stop-service", other);
            Ok(false)
        }
    }
}

/// `nv-init`: ask the daemon to (re-)enumerate NVIDIA devices (spec §4.5).
pub async fn nv_init(socket_path: &str) -> Result<bool> {
    match client::call(socket_path, fancon_protocol::Request::NvInit).await? {
        Response::Ok(_) => Ok(true),
        ref other => {
            print_error("nv-init", other);
            Ok(false)
        }
    }
}

/// `sysinfo[=path]`: dump enumerated devices, the persisted device set and
/// the local hwmon tree to a file (spec §6 CLI surface).
pub async fn sysinfo(socket_path: &str, path: &str) -> Result<bool> {
    use std::fmt::Write as _;
    let mut out = String::new();

    let _ = writeln!(out, "Enumerated:");
    match client::call(socket_path, fancon_protocol::Request::GetEnumeratedDevices).await {
        Ok(Response::Ok(data)) => {
            let _ = writeln!(out, "{:#?}", data.devices.unwrap_or_default());
        }
        _ => out.push_str("Failed\n"),
    }

    let _ = writeln!(out, "\nUser:");
    match client::call(socket_path, fancon_protocol::Request::GetDevices).await {
        Ok(Response::Ok(data)) => {
            let _ = writeln!(out, "{:#?}", data.devices.unwrap_or_default());
        }
        _ => out.push_str("Failed\n"),
    }

    let hwmon_dir = "/sys/class/hwmon";
    let _ = writeln!(out, "\n{hwmon_dir}:");
    match std::fs::read_dir(hwmon_dir) {
        Ok(entries) => {
            for entry in entries.flatten() {
                let _ = writeln!(out, "  {}", entry.path().display());
            }
        }
        Err(e) => {
            let _ = writeln!(out, "  (unreadable: {e})");
        }
    }

    match std::fs::write(path, out) {
        Ok(()) => {
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Ok(metadata) = std::fs::metadata(path) {
                    let mut perms = metadata.permissions();
                    perms.set_mode(perms.mode() | 0o066);
                    let _ = std::fs::set_permissions(path, perms);
                }
            }
            info!("sysinfo written to: {path}");
            Ok(true)
        }
        Err(e) => {
            error!("failed to write sysinfo to {path}: {e}");
            Ok(false)
        }
    }
}

/// Warn (but do not refuse) when running as root against an interactive
/// terminal, mirroring the original client's startup check.
pub fn warn_if_root_without_systemd() {
    #[cfg(unix)]
    {
        // SAFETY: geteuid always succeeds.
        let euid = unsafe { libc::geteuid() };
        let under_systemd = std::env::var_os("JOURNAL_STREAM").is_some();
        if euid == 0 && !under_systemd {
            warn!("running fanconctl as root is not recommended");
        }
    }
}
