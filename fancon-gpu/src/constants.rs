//! NVML tuning constants and the PWM<->percent translation used by the
//! NVIDIA fan backend (spec §4.2: "PWM is a 0..100 percentage on the
//! cooler target; translate 0..255 <-> 0..100").

/// Library name passed to `Nvml::builder().lib_path(...)`, matching the
/// well-known soname rather than an unversioned `libnvidia-ml.so`.
pub const NVML_LIB: &str = "libnvidia-ml.so.1";

/// Maximum number of fans/thermal sensors enumerated per GPU (safety cap
/// against a pathological NVML report).
pub const MAX_FANS_PER_GPU: u32 = 8;

/// Convert a 0..255 PWM value to the 0..100 percentage NVML expects.
#[inline]
pub fn pwm_to_percent(pwm: u8) -> u32 {
    ((u32::from(pwm) * 100) + 127) / 255
}

/// Convert a 0..100 NVML fan percentage back to a 0..255 PWM value.
#[inline]
pub fn percent_to_pwm(percent: u32) -> u8 {
    ((percent.min(100) * 255 + 50) / 100) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_round_trip() {
        assert_eq!(pwm_to_percent(0), 0);
        assert_eq!(pwm_to_percent(255), 100);
        assert_eq!(percent_to_pwm(0), 0);
        assert_eq!(percent_to_pwm(100), 255);
    }

    #[test]
    fn percent_to_pwm_clamps_above_100() {
        assert_eq!(percent_to_pwm(150), 255);
    }
}
