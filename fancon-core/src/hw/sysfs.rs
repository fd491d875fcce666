//! Generic sysfs hwmon backend (spec §4.1 SysfsSensor, §4.2 FanSysfs,
//! §6 sysfs layout). Paths are line-oriented plain-integer text files
//! under `/sys/class/hwmon/hwmon*`.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Instant;

use fancon_error::{FanconError, Result};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::constants::{pwm, retry, temperature};
use crate::device::{Fan, Sensor};

fn read_int(path: &Path) -> std::io::Result<i64> {
    fs::read_to_string(path)?
        .trim()
        .parse::<i64>()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

fn write_int(path: &Path, value: i64) -> std::io::Result<()> {
    fs::write(path, value.to_string())
}

/// Retry a transient hwmon read up to `retry::TRANSIENT_IO_RETRIES`
/// times with no back-off (spec §7 "transient I/O").
fn read_with_retry(path: &Path) -> Option<i64> {
    for attempt in 1..=retry::TRANSIENT_IO_RETRIES {
        match read_int(path) {
            Ok(v) => return Some(v),
            Err(e) => {
                if attempt == retry::TRANSIENT_IO_RETRIES {
                    warn!(path = %path.display(), error = %e, "sysfs read failed after retries");
                }
            }
        }
    }
    None
}

/// `<base>_input`, `<base>_enable`, `<base>_fault`, `<base>_min`,
/// `<base>_max`, `<base>_crit` (spec §4.1).
pub struct SysfsSensor {
    label: String,
    base: PathBuf,
    temp_averaging_intervals: usize,
    ignore: AtomicBool,
    state: Mutex<SensorCache>,
}

struct SensorCache {
    last_read: Option<Instant>,
    last_avg_temp: i32,
    ring: VecDeque<i32>,
}

impl SysfsSensor {
    pub fn new(label: impl Into<String>, base: PathBuf, temp_averaging_intervals: usize) -> Self {
        let sensor = Self {
            label: label.into(),
            base,
            temp_averaging_intervals: temp_averaging_intervals.max(1),
            ignore: AtomicBool::new(false),
            state: Mutex::new(SensorCache { last_read: None, last_avg_temp: 0, ring: VecDeque::new() }),
        };
        sensor.init_enable_and_fault();
        sensor
    }

    fn path(&self, suffix: &str) -> PathBuf {
        let mut p = self.base.clone().into_os_string();
        p.push(suffix);
        PathBuf::from(p)
    }

    /// If `_enable` exists and reads <= 0, write 1. If `_fault` reads >
    /// 0, mark ignore (spec §4.1).
    fn init_enable_and_fault(&self) {
        let enable_path = self.path("_enable");
        if enable_path.exists() {
            if let Some(v) = read_with_retry(&enable_path) {
                if v <= 0 {
                    let _ = write_int(&enable_path, 1);
                }
            }
        }

        let fault_path = self.path("_fault");
        if fault_path.exists() {
            if let Some(v) = read_with_retry(&fault_path) {
                if v > 0 {
                    warn!(sensor = %self.label, "sensor reports fault, ignoring");
                    self.ignore.store(true, Ordering::Release);
                }
            }
        }
    }
}

impl Sensor for SysfsSensor {
    fn read(&self) -> Option<i32> {
        if self.ignore.load(Ordering::Acquire) {
            return None;
        }
        read_with_retry(&self.path("_input"))
            .map(|milli| (milli as f64 / f64::from(temperature::MILLIDEGREE_DIVISOR)) as i32)
    }

    fn get_average_temp(&self) -> i32 {
        let mut state = self.state.lock();
        if !crate::device::is_stale(state.last_read, temperature::FRESHNESS_WINDOW) {
            return state.last_avg_temp;
        }

        let Some(temp) = self.read() else {
            return state.last_avg_temp;
        };

        if state.ring.len() >= self.temp_averaging_intervals {
            state.ring.pop_front();
        }
        state.ring.push_back(temp);

        let avg = (state.ring.iter().sum::<i32>() as f64 / state.ring.len() as f64).round() as i32;
        state.last_avg_temp = avg;
        state.last_read = Some(Instant::now());
        avg
    }

    fn min_temp(&self) -> Option<i32> {
        read_with_retry(&self.path("_min")).map(|v| (v / 1000) as i32)
    }

    fn max_temp(&self) -> Option<i32> {
        read_with_retry(&self.path("_max")).map(|v| (v / 1000) as i32)
    }

    fn valid(&self) -> bool {
        !self.ignore.load(Ordering::Acquire) && self.path("_input").exists()
    }

    fn label(&self) -> &str {
        &self.label
    }
}

/// `pwm<N>`, `pwm<N>_enable`, `fan<N>_input`, `fan<N>_fault` (spec §4.2).
pub struct FanSysfs {
    label: String,
    pwm_path: PathBuf,
    pwm_enable_path: PathBuf,
    fan_input_path: PathBuf,
    fan_fault_path: PathBuf,
    ignore: AtomicBool,
    /// Driver's original `pwm<N>_enable` value, captured before the
    /// first `enable_control` so `disable_control` can restore it (spec
    /// §3 invariant 6, §8 invariant 3).
    original_enable: Mutex<Option<u8>>,
    manual_flag: AtomicU8,
}

impl FanSysfs {
    pub fn new(label: impl Into<String>, pwm_path: PathBuf, fan_input_path: PathBuf) -> Self {
        let pwm_enable_path = PathBuf::from(format!("{}_enable", pwm_path.display()));
        let fan_fault_path = PathBuf::from(format!("{}_fault", fan_input_path.display()));

        let fan = Self {
            label: label.into(),
            pwm_path,
            pwm_enable_path,
            fan_input_path,
            fan_fault_path,
            ignore: AtomicBool::new(false),
            original_enable: Mutex::new(None),
            manual_flag: AtomicU8::new(pwm::enable::MANUAL),
        };
        fan.init_fault_check();
        fan
    }

    fn init_fault_check(&self) {
        if self.fan_fault_path.exists() {
            if let Some(v) = read_with_retry(&self.fan_fault_path) {
                if v > 0 {
                    warn!(fan = %self.label, "fan reports fault, ignoring");
                    self.ignore.store(true, Ordering::Release);
                }
            }
        }
    }
}

impl Fan for FanSysfs {
    fn enable_control(&self) -> Result<()> {
        if self.pwm_enable_path.exists() {
            let mut original = self.original_enable.lock();
            if original.is_none() {
                *original = read_with_retry(&self.pwm_enable_path).map(|v| v as u8);
            }
            write_int(&self.pwm_enable_path, i64::from(self.manual_flag.load(Ordering::Acquire)))
                .map_err(|e| FanconError::PwmWrite {
                    path: self.pwm_enable_path.clone(),
                    value: self.manual_flag.load(Ordering::Acquire),
                    reason: e.to_string(),
                })?;
        }
        Ok(())
    }

    fn disable_control(&self) -> Result<()> {
        if self.pwm_enable_path.exists() {
            let restore = self.original_enable.lock().unwrap_or(pwm::enable::AUTOMATIC);
            write_int(&self.pwm_enable_path, i64::from(restore)).map_err(|e| FanconError::PwmWrite {
                path: self.pwm_enable_path.clone(),
                value: restore,
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }

    fn set_pwm(&self, value: u8) -> bool {
        let clamped = value.clamp(pwm::MIN_VALUE, pwm::MAX_VALUE);
        match write_int(&self.pwm_path, i64::from(clamped)) {
            Ok(()) => true,
            Err(e) => {
                debug!(fan = %self.label, error = %e, "set_pwm failed, attempting recovery");
                crate::device::recover_control(self)
                    && write_int(&self.pwm_path, i64::from(clamped)).is_ok()
            }
        }
    }

    fn get_pwm(&self) -> u8 {
        read_with_retry(&self.pwm_path).map(|v| v as u8).unwrap_or(0)
    }

    fn get_rpm(&self) -> u32 {
        read_with_retry(&self.fan_input_path).map(|v| v.max(0) as u32).unwrap_or(0)
    }

    fn valid(&self) -> bool {
        !self.ignore.load(Ordering::Acquire) && self.pwm_path.exists() && self.fan_input_path.exists()
    }

    fn label(&self) -> &str {
        &self.label
    }
}

/// A discovered hwmon fan/pwm/sensor triple, before curves are attached
/// (spec §3 "Enumerated devices carry empty curves").
#[derive(Debug, Clone)]
pub struct DiscoveredSensor {
    pub label: String,
    pub base_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct DiscoveredFan {
    pub label: String,
    pub pwm_path: PathBuf,
    pub fan_input_path: PathBuf,
}

/// Scan `/sys/class/hwmon/hwmon*` for `tempN_input` and `pwmN`/`fanN_input`
/// files (spec §6 sysfs layout).
pub fn enumerate(hwmon_base: &Path) -> Result<(Vec<DiscoveredSensor>, Vec<DiscoveredFan>)> {
    let mut sensors = Vec::new();
    let mut fans = Vec::new();

    let Ok(entries) = fs::read_dir(hwmon_base) else {
        warn!(path = %hwmon_base.display(), "hwmon base path not found, enumerating no sysfs devices");
        return Ok((sensors, fans));
    };

    for entry in entries.flatten() {
        let chip_path = entry.path();
        let chip_name = chip_path.file_name().and_then(|n| n.to_str()).unwrap_or("chip").to_string();

        let Ok(files) = fs::read_dir(&chip_path) else { continue };
        let mut temp_indices = std::collections::BTreeSet::new();
        let mut fan_indices = std::collections::BTreeSet::new();

        for file in files.flatten() {
            let name = file.file_name().to_string_lossy().to_string();
            if let Some(rest) = name.strip_prefix("temp") {
                if let Some(idx) = rest.strip_suffix("_input").and_then(|s| s.parse::<u32>().ok()) {
                    temp_indices.insert(idx);
                }
            } else if let Some(rest) = name.strip_prefix("fan") {
                if let Some(idx) = rest.strip_suffix("_input").and_then(|s| s.parse::<u32>().ok()) {
                    fan_indices.insert(idx);
                }
            }
        }

        for idx in temp_indices {
            sensors.push(DiscoveredSensor {
                label: format!("{chip_name}/temp{idx}"),
                base_path: chip_path.join(format!("temp{idx}")),
            });
        }

        for idx in fan_indices {
            let pwm_path = chip_path.join(format!("pwm{idx}"));
            if !pwm_path.exists() {
                continue;
            }
            fans.push(DiscoveredFan {
                label: format!("{chip_name}/fan{idx}"),
                pwm_path,
                fan_input_path: chip_path.join(format!("fan{idx}_input")),
            });
        }
    }

    debug!(sensors = sensors.len(), fans = fans.len(), "enumerated sysfs devices");
    Ok((sensors, fans))
}
