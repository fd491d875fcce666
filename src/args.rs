//! Command-line argument parsing for `fanconctl` (spec §6 "CLI surface
//! (for reference only, not core)"). Grounded on `original_source/src/Args.hpp`'s
//! `Arg`/`Args` model: each flag has a long and optional short form, and
//! some flags may carry a following value (a fan label, a path) that is
//! only consumed when the next token doesn't itself look like a flag.

pub const DEFAULT_CONFIG_PATH: &str = "/etc/fancon/devices.json";
pub const DEFAULT_SYSINFO_PATH: &str = "fancon_sysinfo.txt";

/// A flag that was seen on the command line, and the trailing value token
/// it captured, if any (e.g. `enable cpu_fan` captures `"cpu_fan"`).
#[derive(Debug, Clone, Default)]
pub struct Flag {
    pub present: bool,
    pub value: Option<String>,
}

impl Flag {
    fn set(&mut self, value: Option<String>) {
        self.present = true;
        self.value = value;
    }
}

#[derive(Debug, Clone, Default)]
pub struct Args {
    pub help: Flag,
    pub status: Flag,
    pub enable: Flag,
    pub disable: Flag,
    pub test: Flag,
    pub force: Flag,
    pub reload: Flag,
    pub config: Flag,
    pub service: Flag,
    pub daemon: Flag,
    pub stop_service: Flag,
    pub sysinfo: Flag,
    pub nv_init: Flag,
    pub verbose: Flag,
    pub trace: Flag,
    /// Unrecognised tokens, reported back to the caller as a usage error.
    pub unknown: Vec<String>,
}

/// Flags that may consume a following bare value (not itself a flag).
fn takes_value(key: &str) -> bool {
    matches!(key, "enable" | "disable" | "test" | "config" | "sysinfo")
}

fn flag_key(token: &str) -> Option<&str> {
    let stripped = token.strip_prefix("--").or_else(|| token.strip_prefix('-'))?;
    Some(match stripped {
        "h" => "help",
        "s" => "status",
        "e" => "enable",
        "d" => "disable",
        "t" => "test",
        "f" => "force",
        "r" => "reload",
        "c" => "config",
        "i" => "sysinfo",
        "v" => "verbose",
        "a" => "trace",
        other => other,
    })
}

fn looks_like_flag(token: &str) -> bool {
    token.starts_with('-')
}

impl Args {
    pub fn parse(raw: &[String]) -> Self {
        let mut args = Args::default();
        let mut i = 0;
        while i < raw.len() {
            let token = &raw[i];
            let Some(key) = flag_key(token) else {
                args.unknown.push(token.clone());
                i += 1;
                continue;
            };

            let value = if takes_value(key) && i + 1 < raw.len() && !looks_like_flag(&raw[i + 1]) {
                i += 1;
                Some(raw[i].clone())
            } else {
                None
            };

            match key {
                "help" => args.help.set(value),
                "status" => args.status.set(value),
                "enable" => args.enable.set(value),
                "disable" => args.disable.set(value),
                "test" => args.test.set(value),
                "force" => args.force.set(value),
                "reload" => args.reload.set(value),
                "config" => args.config.set(value.or_else(|| Some(DEFAULT_CONFIG_PATH.to_string()))),
                "service" => args.service.set(value),
                "daemon" => args.daemon.set(value),
                "stop-service" => args.stop_service.set(value),
                "sysinfo" => args.sysinfo.set(value.or_else(|| Some(DEFAULT_SYSINFO_PATH.to_string()))),
                "nv-init" => args.nv_init.set(value),
                "verbose" => args.verbose.set(value),
                "trace" => args.trace.set(value),
                other => args.unknown.push(format!("-{other}")),
            }
            i += 1;
        }
        args
    }

    pub fn config_path(&self) -> String {
        self.config.value.clone().unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(tokens: &[&str]) -> Args {
        Args::parse(&tokens.iter().map(|s| s.to_string()).collect::<Vec<_>>())
    }

    #[test]
    fn enable_without_value_targets_all_fans() {
        let args = parse(&["enable"]);
        assert!(args.enable.present);
        assert_eq!(args.enable.value, None);
    }

    #[test]
    fn enable_with_value_targets_one_fan() {
        let args = parse(&["enable", "cpu_fan"]);
        assert!(args.enable.present);
        assert_eq!(args.enable.value.as_deref(), Some("cpu_fan"));
    }

    #[test]
    fn short_flags_resolve_to_long_keys() {
        let args = parse(&["-t", "cpu_fan", "-f"]);
        assert_eq!(args.test.value.as_deref(), Some("cpu_fan"));
        assert!(args.force.present);
    }

    #[test]
    fn a_following_flag_is_not_consumed_as_a_value() {
        let args = parse(&["enable", "--force"]);
        assert_eq!(args.enable.value, None);
        assert!(args.force.present);
    }

    #[test]
    fn unrecognised_token_is_recorded() {
        let args = parse(&["--bogus"]);
        assert_eq!(args.unknown, vec!["--bogus".to_string()]);
    }
}
