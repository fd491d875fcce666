//! Constants for the fan control engine: sysfs paths, PWM conventions,
//! Dell SMM command codes, and characterisation-test tuning parameters.
//!
//! Centralises magic numbers so the engine, hw backends, and tests agree
//! on a single source of truth.

use std::time::Duration;

/// Filesystem paths.
pub mod paths {
    /// Base path for hwmon devices.
    pub const HWMON_BASE: &str = "/sys/class/hwmon";

    /// Default location of the persisted device configuration.
    pub const DEFAULT_CONFIG_PATH: &str = "/etc/fancon/devices.json";

    /// Directories RPC/persistence paths are allowed to resolve under.
    pub const ALLOWED_PREFIXES: &[&str] = &["/sys/class/hwmon/", "/sys/devices/"];
}

/// PWM control constants (spec §3 invariant 4: writes clamped to 0..=255).
pub mod pwm {
    pub const MIN_VALUE: u8 = 0;
    pub const MAX_VALUE: u8 = 255;

    /// PWM enable file values.
    pub mod enable {
        pub const DISABLED: u8 = 0;
        pub const MANUAL: u8 = 1;
        pub const AUTOMATIC: u8 = 2;
    }

    #[inline]
    pub fn from_percent(percent: f32) -> u8 {
        ((percent.clamp(0.0, 100.0) / 100.0) * 255.0).round() as u8
    }

    #[inline]
    pub fn to_percent(value: u8) -> f32 {
        (f32::from(value) / 255.0) * 100.0
    }
}

/// Temperature constants.
pub mod temperature {
    /// hwmon reports millidegrees Celsius; divide by this to get °C.
    pub const MILLIDEGREE_DIVISOR: f32 = 1000.0;

    /// Sensor read freshness window (spec §4.1, §5): repeated calls within
    /// this window return the cached average without a hardware read.
    pub const FRESHNESS_WINDOW: Duration = Duration::from_millis(200);
}

/// Update-loop / smoothing constants (spec §4.2 step 5).
pub mod engine {
    /// Default per-fan update interval when none is configured.
    pub const DEFAULT_INTERVAL_MS: u32 = 1000;

    /// Target-change threshold that forces a smoothing re-init: a new
    /// target differing from the current glide target by more than this
    /// fraction restarts the glide.
    pub const STABILISED_THRESHOLD: f32 = 0.10;

    /// Default number of intervals a new target is glided toward over.
    pub const DEFAULT_SMOOTHING_INTERVALS: u32 = 5;

    /// Default number of intervals the fan is held at its top speed
    /// before it is allowed to drop again (spec §4.2 step 6).
    pub const DEFAULT_TOP_STICKINESS_INTERVALS: u32 = 3;

    /// Default length of a Sensor's averaging ring buffer.
    pub const DEFAULT_TEMP_AVERAGING_INTERVALS: u32 = 5;
}

/// Characterisation test protocol constants (spec §4.3).
pub mod test {
    use super::Duration;

    /// RPM tolerance (as a fraction of `rpm_max`) used when searching for
    /// `pwm_max`: the highest PWM can drop to while staying within this
    /// band of `rpm_max`.
    pub const PWM_MAX_RPM_TOLERANCE: f32 = 0.005;

    /// PWM decrement used while searching for `pwm_max` / `pwm_min`.
    pub const PWM_SEARCH_STEP: u8 = 2;

    /// PWM increment used while raising from stopped to find `start_pwm`.
    pub const START_PWM_STEP: u8 = 5;

    /// Safety margin added to the PWM at which the fan first spins up.
    pub const START_PWM_SAFETY_MARGIN: u8 = 10;

    /// Upper bound on how long the protocol waits for RPM to stabilise
    /// before giving up on a single measurement step.
    pub const STABILISATION_TIMEOUT: Duration = Duration::from_secs(15);

    /// Two successive RPM reads within this fraction of each other are
    /// considered "stabilised".
    pub const STABILISATION_EPSILON: f32 = 0.01;

    /// Poll interval while waiting for RPM to stabilise during a test step.
    pub const POLL_INTERVAL: Duration = Duration::from_millis(250);

    /// Divisor applied to a characterisation run's measured
    /// `max_speed_change_time_ms` to derive the fan's new control-loop
    /// `interval_ms`: the loop only needs to re-sample a fraction as often
    /// as the fan takes to react to a PWM change.
    pub const DERIVED_INTERVAL_DIVISOR: u32 = 8;

    /// Bounds clamping the interval derived from a characterisation run,
    /// so a very fast or very slow fan never produces an unreasonable
    /// control-loop period.
    pub const MIN_DERIVED_INTERVAL_MS: u32 = 200;
    pub const MAX_DERIVED_INTERVAL_MS: u32 = 2000;
}

/// Error-recovery retry constants (spec §7).
pub mod retry {
    use super::Duration;

    /// Transient I/O: retries for a single sysfs read/write before the
    /// update loop logs and continues.
    pub const TRANSIENT_IO_RETRIES: u32 = 4;

    /// Control loss: retries of `enable_control` after `set_pwm` fails.
    pub const RECOVER_CONTROL_RETRIES: u32 = 3;

    /// Delay between `recover_control` attempts.
    pub const RECOVER_CONTROL_DELAY: Duration = Duration::from_millis(100);
}

/// Dell SMM port I/O (spec §6).
pub mod smm {
    /// I/O ports the SMM command sequence is written to, in order.
    pub const PORT_CMD: u16 = 0xb2;
    pub const PORT_DATA: u16 = 0x84;

    pub const GET_DELL_SIG_1: u16 = 0xfea3;
    pub const GET_DELL_SIG_2: u16 = 0xffa3;
    pub const GET_FAN: u16 = 0x00a3;

    pub const MANUAL_CONTROL_1: u16 = 0x30a3;
    pub const MANUAL_CONTROL_2: u16 = 0x34a3;
    pub const MANUAL_CONTROL_3: u16 = 0x32a3;

    pub const AUTO_CONTROL_1: u16 = 0x31a3;
    pub const AUTO_CONTROL_2: u16 = 0x35a3;
    pub const AUTO_CONTROL_3: u16 = 0x33a3;

    /// Expected signature words from `GET_DELL_SIG_1`/`GET_DELL_SIG_2`.
    pub const DELL_SIG: u32 = 0x44454c4c; // "DELL", little-endian packed ASCII
    pub const DIAG_SIG: u32 = 0x44494147; // "DIAG"

    /// Default manual-control method elected when probing cannot
    /// determine which of methods 1-3 actually moves the fan (spec §9
    /// open question: default to 2, matching the reference behaviour).
    pub const DEFAULT_DRIVER_FLAG: u8 = 2;
}
