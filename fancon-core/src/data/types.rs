//! Runtime domain types: ordered curve tables and per-fan smoothing state
//! (spec §3, §4.2). The wire/persistence representation lives in
//! `fancon_protocol`; these are the structures the engine computes
//! against at runtime.

use std::collections::BTreeMap;

/// `temp_to_rpm` / `rpm_to_pwm`, loaded from the persisted `Point` vectors
/// into ordered maps so resolution can use `range(..=key).next_back()`
/// (the Rust equivalent of `upper_bound`/`lower_bound`, per spec §9).
#[derive(Debug, Clone, Default)]
pub struct FanCurveTables {
    pub temp_to_rpm: BTreeMap<i32, u32>,
    pub rpm_to_pwm: BTreeMap<u32, u8>,
}

impl FanCurveTables {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fan is "tested" once it has a populated `rpm_to_pwm` map (spec §3
    /// invariant 3, §8 boundary behaviour).
    pub fn is_tested(&self) -> bool {
        !self.rpm_to_pwm.is_empty()
    }

    /// Resolve the target RPM for a temperature: the value at the
    /// greatest key ≤ temp, or the lowest entry if temp is below every
    /// key (spec §4.2 step 2, §8 invariant 5).
    pub fn resolve_target_rpm(&self, temp: i32) -> Option<u32> {
        if let Some((_, &rpm)) = self.temp_to_rpm.range(..=temp).next_back() {
            Some(rpm)
        } else {
            self.temp_to_rpm.values().next().copied()
        }
    }

    /// Resolve the PWM for a target RPM: the value at the greatest key ≤
    /// target_rpm, saturating below to the smallest entry (spec §4.2
    /// step 3).
    pub fn find_closest_pwm(&self, target_rpm: u32) -> Option<u8> {
        if let Some((_, &pwm)) = self.rpm_to_pwm.range(..=target_rpm).next_back() {
            Some(pwm)
        } else {
            self.rpm_to_pwm.values().next().copied()
        }
    }

    /// Highest RPM key in the map, used to detect the "top bucket" for
    /// top-stickiness (spec §4.2 step 6).
    pub fn highest_rpm(&self) -> Option<u32> {
        self.rpm_to_pwm.keys().next_back().copied()
    }
}

/// Per-fan smoothing/glide state (spec §3, §4.2 steps 5-6).
#[derive(Debug, Clone)]
pub struct SmoothingState {
    pub just_started: bool,
    pub rem_intervals: u32,
    pub targeted_rpm: u32,
    /// Linear estimate of the fan's current (glided) RPM, used as the
    /// starting point for the next interpolation step.
    pub current_rpm_estimate: u32,
    pub top_stickiness_rem_intervals: u32,
}

impl Default for SmoothingState {
    fn default() -> Self {
        Self {
            just_started: true,
            rem_intervals: 0,
            targeted_rpm: 0,
            current_rpm_estimate: 0,
            top_stickiness_rem_intervals: 0,
        }
    }
}

impl SmoothingState {
    pub fn new() -> Self {
        Self::default()
    }
}
