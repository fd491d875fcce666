//! The polymorphic `Sensor`/`Fan` contracts (spec §4.1, §4.2) implemented
//! by the `hw::sysfs`, `hw::dell`, and `hw::nvidia` backends. Modelled as
//! traits rather than a class hierarchy (spec §9: "avoid deep
//! inheritance; FanDell shares code with FanSysfs via composition rather
//! than subclass").

use std::time::{Duration, Instant};

use fancon_error::Result;
use tracing::warn;

use crate::constants::retry;

/// One-shot and averaged temperature reads (spec §4.1).
pub trait Sensor: Send + Sync {
    /// One-shot hardware read; no averaging. Absent on read failure.
    fn read(&self) -> Option<i32>;

    /// Mutex-guarded averaged read: within the freshness window returns
    /// the cached average without touching hardware.
    fn get_average_temp(&self) -> i32;

    fn min_temp(&self) -> Option<i32> {
        None
    }

    fn max_temp(&self) -> Option<i32> {
        None
    }

    /// Backend has a usable identity (path exists, NVML device resolves).
    fn valid(&self) -> bool;

    fn label(&self) -> &str;
}

/// Fan control contract common to all backends (spec §4.2).
pub trait Fan: Send + Sync {
    fn enable_control(&self) -> Result<()>;
    fn disable_control(&self) -> Result<()>;

    /// Write raw PWM (0..255). Implementations clamp internally (spec §3
    /// invariant 4) and must not panic on hardware failure.
    fn set_pwm(&self, value: u8) -> bool;

    fn get_pwm(&self) -> u8;
    fn get_rpm(&self) -> u32;

    fn valid(&self) -> bool;
    fn label(&self) -> &str;

    /// The elected Dell SMM manual-control method (spec §6 `driver_flag`),
    /// `None` for every backend but `FanDell`.
    fn driver_flag(&self) -> Option<u8> {
        None
    }
}

/// Re-issue `enable_control` up to `retry::RECOVER_CONTROL_RETRIES` times
/// with `retry::RECOVER_CONTROL_DELAY` between attempts, shared by every
/// backend rather than duplicated (spec §7 "control loss", `SPEC_FULL.md`
/// §4.2 addition documenting this as a free function).
pub fn recover_control(fan: &dyn Fan) -> bool {
    for attempt in 1..=retry::RECOVER_CONTROL_RETRIES {
        if fan.enable_control().is_ok() {
            return true;
        }
        if attempt < retry::RECOVER_CONTROL_RETRIES {
            std::thread::sleep(retry::RECOVER_CONTROL_DELAY);
        }
    }
    warn!(fan = %fan.label(), attempts = retry::RECOVER_CONTROL_RETRIES, "lost control, ceding to driver");
    false
}

/// Has at least `FRESHNESS_WINDOW` elapsed since `last_read`?
pub fn is_stale(last_read: Option<Instant>, freshness_window: Duration) -> bool {
    match last_read {
        None => true,
        Some(t) => t.elapsed() >= freshness_window,
    }
}
