//! Per-fan characterisation test (spec §4.3): drives a fan through its
//! full PWM range to derive `pwm_min`/`pwm_max`, `rpm_min`/`rpm_max`,
//! `start_pwm`, and the `rpm_to_pwm` table, restoring the fan's prior
//! state when done. Synchronous — callers run it via
//! `tokio::task::spawn_blocking` since it sleeps between PWM writes.

use std::collections::BTreeMap;
use std::time::Instant;

use fancon_error::{FanconError, Result};
use tracing::{debug, info};

use crate::constants::{pwm as pwm_const, test as test_const};
use crate::device::Fan;

/// Result of a successful characterisation run (spec §4.3 step 9).
#[derive(Debug, Clone)]
pub struct CharacterisationResult {
    pub start_pwm: u8,
    pub pwm_min: u8,
    pub rpm_min: u32,
    pub pwm_max: u8,
    pub rpm_max: u32,
    pub max_speed_change_time_ms: u64,
    pub rpm_to_pwm: BTreeMap<u32, u8>,
}

/// Run the full characterisation protocol against `fan`, reporting
/// percent-complete through `progress` (spec §4.3, §6 `Test` RPC).
pub fn characterise(fan: &dyn Fan, mut progress: impl FnMut(u8)) -> Result<CharacterisationResult> {
    let label = fan.label().to_string();
    let prior_pwm = fan.get_pwm();

    fan.enable_control()?;
    progress(5);

    // Step 3-5: drive to full speed, wait for stabilisation, measure
    // rpm_max and the time it took to get there.
    let ramp_start = Instant::now();
    if !fan.set_pwm(pwm_const::MAX_VALUE) {
        let _ = fan.disable_control();
        return Err(FanconError::TestFailed { label, reason: "failed to write max PWM".into() });
    }
    let rpm_max = wait_for_stable(fan).ok_or_else(|| FanconError::TestFailed {
        label: label.clone(),
        reason: "fan RPM never stabilised at max PWM".into(),
    })?;
    let max_speed_change_time_ms = ramp_start.elapsed().as_millis() as u64;

    if rpm_max == 0 {
        let _ = fan.disable_control();
        return Err(FanconError::TestFailed { label, reason: "fan did not spin at max PWM".into() });
    }
    progress(30);

    // Step 6: pwm_max is the lowest PWM still within tolerance of rpm_max.
    let mut pwm_max = pwm_const::MAX_VALUE;
    let mut rpm_to_pwm = BTreeMap::new();
    rpm_to_pwm.insert(rpm_max, pwm_max);
    let mut probe = pwm_const::MAX_VALUE;
    while probe > test_const::PWM_SEARCH_STEP {
        probe -= test_const::PWM_SEARCH_STEP;
        fan.set_pwm(probe);
        let rpm = settle_and_read(fan);
        let within_tolerance =
            (rpm_max.abs_diff(rpm) as f32) / (rpm_max as f32) <= test_const::PWM_MAX_RPM_TOLERANCE;
        if !within_tolerance {
            break;
        }
        pwm_max = probe;
        rpm_to_pwm.insert(rpm, probe);
    }
    progress(50);

    // Step 7: start_pwm is the first PWM (from zero) that moves the fan,
    // plus a safety margin.
    fan.set_pwm(0);
    let mut start_pwm = 0u8;
    loop {
        let rpm = settle_and_read(fan);
        if rpm > 0 {
            break;
        }
        if start_pwm >= pwm_const::MAX_VALUE {
            let _ = fan.disable_control();
            return Err(FanconError::TestFailed {
                label,
                reason: "fan never started spinning across the full PWM range".into(),
            });
        }
        start_pwm = start_pwm.saturating_add(test_const::START_PWM_STEP);
        fan.set_pwm(start_pwm);
    }
    start_pwm = start_pwm.saturating_add(test_const::START_PWM_SAFETY_MARGIN).min(pwm_const::MAX_VALUE);
    progress(70);

    // Step 8: pwm_min/rpm_min -- decrement from start_pwm while RPM keeps
    // strictly decreasing.
    fan.set_pwm(start_pwm);
    let mut pwm_min = start_pwm;
    let mut rpm_min = settle_and_read(fan);
    rpm_to_pwm.insert(rpm_min, pwm_min);
    let mut probe = start_pwm;
    while probe > test_const::PWM_SEARCH_STEP {
        let next_probe = probe - test_const::PWM_SEARCH_STEP;
        fan.set_pwm(next_probe);
        let rpm = settle_and_read(fan);
        if rpm == 0 || rpm >= rpm_min {
            break;
        }
        probe = next_probe;
        pwm_min = next_probe;
        rpm_min = rpm;
        rpm_to_pwm.insert(rpm_min, pwm_min);
    }
    progress(90);

    debug!(fan = %fan.label(), pwm_min, rpm_min, pwm_max, rpm_max, start_pwm, "characterisation complete");

    fan.set_pwm(prior_pwm);
    fan.disable_control()?;
    progress(100);

    info!(fan = %fan.label(), pwm_min, pwm_max, rpm_min, rpm_max, "fan characterised");

    Ok(CharacterisationResult { start_pwm, pwm_min, rpm_min, pwm_max, rpm_max, max_speed_change_time_ms, rpm_to_pwm })
}

/// Poll `fan.get_rpm()` until two consecutive reads are within
/// `STABILISATION_EPSILON` of each other, or `STABILISATION_TIMEOUT`
/// elapses (in which case the last reading is returned rather than
/// failing the whole test -- some fans never perfectly settle).
fn wait_for_stable(fan: &dyn Fan) -> Option<u32> {
    let deadline = Instant::now() + test_const::STABILISATION_TIMEOUT;
    let mut last = fan.get_rpm();
    std::thread::sleep(test_const::POLL_INTERVAL);

    while Instant::now() < deadline {
        let current = fan.get_rpm();
        let epsilon_met = if last == 0 {
            current == 0
        } else {
            (last.abs_diff(current) as f32) / (last as f32) <= test_const::STABILISATION_EPSILON
        };
        if epsilon_met {
            return Some(current);
        }
        last = current;
        std::thread::sleep(test_const::POLL_INTERVAL);
    }
    Some(last)
}

/// A lighter-weight settle used while sweeping the PWM range: one poll
/// interval, then read once (the full stabilisation wait is too slow to
/// repeat at every step of the sweep).
fn settle_and_read(fan: &dyn Fan) -> u32 {
    std::thread::sleep(test_const::POLL_INTERVAL);
    fan.get_rpm()
}

/// Derive a fan's control-loop `interval_ms` from how long it took to
/// reach `rpm_max` during characterisation (spec §3 lifecycle: a test
/// replaces `rpm_to_pwm`, `start_pwm`, and `interval`).
pub fn derive_interval_ms(max_speed_change_time_ms: u64) -> u32 {
    let derived = (max_speed_change_time_ms / u64::from(test_const::DERIVED_INTERVAL_DIVISOR)) as u32;
    derived.clamp(test_const::MIN_DERIVED_INTERVAL_MS, test_const::MAX_DERIVED_INTERVAL_MS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU8, Ordering};
    use std::sync::Mutex;

    /// A fake fan whose RPM is a deterministic function of commanded PWM,
    /// so the characterisation protocol can be exercised without
    /// hardware or real sleeps slowing the test down excessively.
    struct FakeFan {
        pwm: AtomicU8,
        label: String,
        stall_below: u8,
        always_stalled: bool,
        log: Mutex<Vec<u8>>,
    }

    impl FakeFan {
        fn new(stall_below: u8) -> Self {
            Self {
                pwm: AtomicU8::new(0),
                label: "fake".into(),
                stall_below,
                always_stalled: false,
                log: Mutex::new(Vec::new()),
            }
        }

        fn seized() -> Self {
            Self {
                pwm: AtomicU8::new(0),
                label: "seized".into(),
                stall_below: 0,
                always_stalled: true,
                log: Mutex::new(Vec::new()),
            }
        }
    }

    impl Fan for FakeFan {
        fn enable_control(&self) -> Result<()> {
            Ok(())
        }
        fn disable_control(&self) -> Result<()> {
            Ok(())
        }
        fn set_pwm(&self, value: u8) -> bool {
            self.pwm.store(value, Ordering::SeqCst);
            self.log.lock().unwrap().push(value);
            true
        }
        fn get_pwm(&self) -> u8 {
            self.pwm.load(Ordering::SeqCst)
        }
        fn get_rpm(&self) -> u32 {
            if self.always_stalled {
                return 0;
            }
            let pwm = self.pwm.load(Ordering::SeqCst);
            if pwm < self.stall_below {
                0
            } else {
                u32::from(pwm) * 10
            }
        }
        fn valid(&self) -> bool {
            true
        }
        fn label(&self) -> &str {
            &self.label
        }
    }

    #[test]
    fn characterises_a_well_behaved_fan() {
        let fan = FakeFan::new(40);
        let result = characterise(&fan, |_| {}).expect("characterisation should succeed");
        assert_eq!(result.rpm_max, 2550);
        assert!(result.start_pwm >= 40);
        assert!(result.pwm_min <= result.start_pwm);
        assert!(!result.rpm_to_pwm.is_empty());
    }

    #[test]
    fn fails_when_fan_never_spins() {
        let fan = FakeFan::seized();
        let err = characterise(&fan, |_| {}).unwrap_err();
        assert!(matches!(err, FanconError::TestFailed { .. }));
    }

    #[test]
    fn derived_interval_is_clamped_to_bounds() {
        assert_eq!(derive_interval_ms(0), test_const::MIN_DERIVED_INTERVAL_MS);
        assert_eq!(derive_interval_ms(100_000), test_const::MAX_DERIVED_INTERVAL_MS);
        assert_eq!(derive_interval_ms(4_000), 500);
    }
}
