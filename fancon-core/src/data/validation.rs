//! Curve-point validation (spec §3 invariant 2, §7 "configuration" error
//! kind, §8 scenario 3): build the ordered runtime tables from the
//! persisted `Point` list, dropping out-of-bounds or ambiguous points
//! with a warning rather than failing the whole fan.

use std::collections::BTreeMap;

use fancon_protocol::{Devices, Point};
use tracing::warn;

use crate::constants::pwm;
use crate::data::types::FanCurveTables;
use crate::error::{FanconError, Result};

/// Build `temp_to_rpm` from the raw points of a fan, dropping any point
/// that has no `rpm` value (an untested fan's curve may carry PWM-only
/// points, spec §8 scenario 3) and logging what was dropped.
pub fn build_temp_to_rpm(label: &str, points: &[Point]) -> BTreeMap<i32, u32> {
    let mut map = BTreeMap::new();
    let mut dropped = Vec::new();

    for point in points {
        match point.rpm {
            Some(rpm) => {
                map.insert(point.temp, rpm);
            }
            None => dropped.push(point.temp),
        }
    }

    if !dropped.is_empty() {
        warn!(fan = %label, temps = ?dropped, "dropped temp_to_rpm points with no rpm value");
    }

    map
}

/// Build `rpm_to_pwm` from the raw points of a fan, dropping any point
/// with no `pwm` value.
pub fn build_rpm_to_pwm(label: &str, points: &[Point]) -> BTreeMap<u32, u8> {
    let mut map = BTreeMap::new();
    let mut dropped = Vec::new();

    for point in points {
        match (point.rpm, point.pwm) {
            (Some(rpm), Some(pwm_value)) => {
                map.insert(rpm, pwm_value);
            }
            _ => dropped.push(point.temp),
        }
    }

    if !dropped.is_empty() {
        warn!(fan = %label, temps = ?dropped, "dropped rpm_to_pwm points missing rpm or pwm");
    }

    map
}

/// Build an untested fan's PWM-only curve directly: temps map straight
/// to PWM values and `rpm_to_pwm` is seeded as the identity map so
/// `find_closest_pwm` still works before a real characterisation test
/// has run (spec §8 scenario 3).
pub fn build_pwm_only_tables(label: &str, points: &[Point]) -> FanCurveTables {
    let mut temp_to_rpm = BTreeMap::new();
    let mut rpm_to_pwm = BTreeMap::new();
    let mut dropped = Vec::new();

    for point in points {
        match point.pwm {
            Some(pwm_value) => {
                // Use the PWM value itself as a synthetic RPM key so the
                // two-stage temp->rpm->pwm resolution still produces the
                // configured PWM directly.
                let synthetic_rpm = u32::from(pwm_value);
                temp_to_rpm.insert(point.temp, synthetic_rpm);
                rpm_to_pwm.insert(synthetic_rpm, pwm_value);
            }
            None => dropped.push(point.temp),
        }
    }

    if !dropped.is_empty() {
        warn!(fan = %label, temps = ?dropped, "dropped rpm-only points on untested fan");
    }

    FanCurveTables { temp_to_rpm, rpm_to_pwm }
}

pub fn clamp_pwm(value: i32) -> u8 {
    value.clamp(i32::from(pwm::MIN_VALUE), i32::from(pwm::MAX_VALUE)) as u8
}

/// Reject a persisted sysfs identity that does not resolve under one of
/// `constants::paths::ALLOWED_PREFIXES`. A privileged daemon writing
/// arbitrary text files named by a deserialised `SetDevices` payload is a
/// path-traversal hazard; this confines every sysfs read/write the engine
/// performs to the hwmon tree it is meant to control.
pub fn validate_sysfs_path(identity: &str) -> Result<()> {
    use crate::constants::paths::ALLOWED_PREFIXES;
    let under_allowed_prefix = ALLOWED_PREFIXES.iter().any(|prefix| identity.starts_with(prefix));
    if under_allowed_prefix && !identity.contains("..") {
        Ok(())
    } else {
        Err(FanconError::PathNotAllowed(std::path::PathBuf::from(identity)))
    }
}

/// Validate invariant 1: every Fan's sensor label resolves to a Sensor
/// in the same `Devices` set.
pub fn validate_devices(devices: &Devices) -> Result<()> {
    for fan in devices.fans.values() {
        if !devices.sensors.contains_key(&fan.sensor_label) {
            return Err(FanconError::UnknownSensor {
                fan: fan.label.clone(),
                sensor: fan.sensor_label.clone(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drops_rpm_only_points_from_untested_curve() {
        let points = vec![Point::rpm(30, 0), Point::pwm(40, 60), Point::rpm(50, 0)];
        let tables = build_pwm_only_tables("fan1", &points);
        assert_eq!(tables.rpm_to_pwm.len(), 1);
        assert_eq!(tables.temp_to_rpm.len(), 1);
    }

    #[test]
    fn build_temp_to_rpm_drops_points_without_rpm() {
        let points = vec![Point::rpm(20, 500), Point::pwm(30, 90), Point::rpm(60, 1500)];
        let map = build_temp_to_rpm("fan1", &points);
        assert_eq!(map.len(), 2);
        assert_eq!(map.get(&20), Some(&500));
        assert_eq!(map.get(&60), Some(&1500));
    }

    #[test]
    fn validate_sysfs_path_accepts_hwmon_and_devices_tree() {
        assert!(validate_sysfs_path("/sys/class/hwmon/hwmon2/pwm1").is_ok());
        assert!(validate_sysfs_path("/sys/devices/platform/thinkpad_hwmon/pwm1").is_ok());
    }

    #[test]
    fn validate_sysfs_path_rejects_paths_outside_allowed_prefixes() {
        assert!(validate_sysfs_path("/etc/passwd").is_err());
        assert!(validate_sysfs_path("/sys/class/hwmon/../../../etc/passwd").is_err());
    }
}
