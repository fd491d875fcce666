//! Temperature to RPM to PWM resolution, smoothing, and top-stickiness
//! (spec §4.2 steps 1-7). Pure function over `FanCurveTables` and
//! `SmoothingState` so it can be exercised without any hardware.

use crate::constants::{engine as engine_const, pwm as pwm_const};
use crate::data::{FanCurveTables, SmoothingState};

/// Resolve the PWM value to write this interval.
///
/// `current_rpm` is the fan's last-read RPM (used only to detect the
/// "commanded off but curve wants motion" start-up case); `smoothing`
/// carries the glide/top-stickiness state across calls and is updated
/// in place.
pub fn resolve_pwm(
    tables: &FanCurveTables,
    smoothing: &mut SmoothingState,
    avg_temp: i32,
    current_rpm: u32,
    start_pwm: u8,
    smoothing_intervals: u32,
    top_stickiness_intervals: u32,
) -> u8 {
    let Some(mut target_rpm) = tables.resolve_target_rpm(avg_temp) else {
        return start_pwm;
    };

    // Step 3: fan is stopped but the curve wants it spinning. Kick it
    // with `start_pwm` and reinitialise the glide from zero rather than
    // interpolating from a standstill.
    if target_rpm > 0 && current_rpm == 0 {
        smoothing.just_started = true;
        smoothing.current_rpm_estimate = 0;
        smoothing.targeted_rpm = target_rpm;
        smoothing.rem_intervals = smoothing_intervals.max(1);
        return start_pwm;
    }

    // Step 6: top-stickiness. While the resolved target sits at the
    // curve's highest bucket, keep the hold counter topped up. Once the
    // target drops below the top, hold there until the counter runs
    // out, then resume gliding toward the real target.
    let top_rpm = tables.highest_rpm().unwrap_or(target_rpm);
    if top_rpm > 0 && target_rpm >= top_rpm {
        smoothing.top_stickiness_rem_intervals = top_stickiness_intervals;
    } else if smoothing.top_stickiness_rem_intervals > 0 {
        smoothing.top_stickiness_rem_intervals -= 1;
        target_rpm = top_rpm;
    }

    // Step 5: smoothing. A new target differing from the in-flight glide
    // by more than `STABILISED_THRESHOLD` restarts the glide from the
    // current estimate; otherwise keep counting down the existing one.
    let target_changed = smoothing.just_started
        || target_delta_exceeds_threshold(smoothing.targeted_rpm, target_rpm);

    if target_changed {
        smoothing.just_started = false;
        smoothing.targeted_rpm = target_rpm;
        smoothing.rem_intervals = smoothing_intervals.max(1);
    } else if smoothing.rem_intervals > 0 {
        smoothing.rem_intervals -= 1;
    }

    smoothing.current_rpm_estimate = glide(
        smoothing.current_rpm_estimate,
        smoothing.targeted_rpm,
        smoothing.rem_intervals,
    );

    tables
        .find_closest_pwm(smoothing.current_rpm_estimate)
        .unwrap_or(start_pwm)
        .clamp(pwm_const::MIN_VALUE, pwm_const::MAX_VALUE)
}

/// Has the target moved by more than `STABILISED_THRESHOLD` of the prior
/// target? Guards against restarting the glide on every tiny temperature
/// wobble (spec §4.2 step 5).
fn target_delta_exceeds_threshold(previous_target: u32, new_target: u32) -> bool {
    if previous_target == 0 {
        return new_target != 0;
    }
    let delta = previous_target.abs_diff(new_target) as f32;
    delta / previous_target as f32 > engine_const::STABILISED_THRESHOLD
}

/// Linear step from `current` toward `target` with `rem_intervals` steps
/// left; the final step lands exactly on `target`.
fn glide(current: u32, target: u32, rem_intervals: u32) -> u32 {
    if rem_intervals == 0 {
        return target;
    }
    let diff = target as i64 - current as i64;
    let step = diff / rem_intervals as i64;
    (current as i64 + step).clamp(0, u32::MAX as i64) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tables_linear() -> FanCurveTables {
        let mut t = FanCurveTables::new();
        t.temp_to_rpm.insert(30, 500);
        t.temp_to_rpm.insert(50, 1000);
        t.temp_to_rpm.insert(70, 2000);
        t.rpm_to_pwm.insert(500, 60);
        t.rpm_to_pwm.insert(1000, 120);
        t.rpm_to_pwm.insert(2000, 255);
        t
    }

    #[test]
    fn start_up_kick_uses_start_pwm() {
        let tables = tables_linear();
        let mut smoothing = SmoothingState::new();
        let pwm = resolve_pwm(&tables, &mut smoothing, 55, 0, 90, 5, 3);
        assert_eq!(pwm, 90);
        assert_eq!(smoothing.targeted_rpm, 1000);
    }

    #[test]
    fn glides_toward_target_over_several_intervals() {
        let tables = tables_linear();
        let mut smoothing = SmoothingState::new();
        smoothing.just_started = false;
        smoothing.current_rpm_estimate = 500;
        smoothing.targeted_rpm = 500;

        let first = resolve_pwm(&tables, &mut smoothing, 70, 500, 90, 5, 3);
        assert!(first > 60);
        assert!(smoothing.current_rpm_estimate > 500);
        assert!(smoothing.current_rpm_estimate < 2000);
    }

    #[test]
    fn top_stickiness_holds_after_leaving_top_bucket() {
        let tables = tables_linear();
        let mut smoothing = SmoothingState::new();
        smoothing.just_started = false;
        smoothing.current_rpm_estimate = 2000;
        smoothing.targeted_rpm = 2000;

        // Reach the top bucket: stickiness counter tops up.
        let _ = resolve_pwm(&tables, &mut smoothing, 70, 2000, 90, 5, 3);
        assert_eq!(smoothing.top_stickiness_rem_intervals, 3);

        // Temperature drops below the top bucket: held at top rpm while
        // the counter drains instead of gliding down immediately.
        let pwm = resolve_pwm(&tables, &mut smoothing, 40, 2000, 90, 5, 3);
        assert_eq!(pwm, 255);
        assert_eq!(smoothing.top_stickiness_rem_intervals, 2);
    }
}
