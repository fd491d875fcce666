//! NVIDIA GPU fan/sensor backend (spec §4.1 NvidiaSensor, §4.2 FanNvidia),
//! built on top of `fancon_gpu::GpuHandle`. Holds one NVML device handle
//! per GPU, shared between its sensor and fan wrappers, since NVML itself
//! keys everything off the GPU index.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use fancon_error::{FanconError, Result};
use fancon_gpu::{constants, GpuHandle};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::constants::temperature;
use crate::device::{Fan, Sensor};

struct TempCache {
    last_read: Option<Instant>,
    last_avg_temp: i32,
}

/// A GPU's core thermal sensor, addressed as `nvidia:<index>:core` (spec
/// §4.1, §6).
pub struct NvidiaSensor {
    label: String,
    handle: GpuHandle,
    cache: Mutex<TempCache>,
}

impl NvidiaSensor {
    pub fn new(label: impl Into<String>, handle: GpuHandle) -> Self {
        Self {
            label: label.into(),
            handle,
            cache: Mutex::new(TempCache { last_read: None, last_avg_temp: 0 }),
        }
    }
}

impl Sensor for NvidiaSensor {
    fn read(&self) -> Option<i32> {
        self.handle.temperature().ok()
    }

    fn get_average_temp(&self) -> i32 {
        let mut cache = self.cache.lock();
        if !crate::device::is_stale(cache.last_read, temperature::FRESHNESS_WINDOW) {
            return cache.last_avg_temp;
        }

        // NVML already reports an instantaneous, driver-smoothed value;
        // no ring-buffer averaging layered on top (spec §4.5: NVML is
        // additive, not a literal port of the sysfs averaging path).
        if let Some(temp) = self.read() {
            cache.last_avg_temp = temp;
            cache.last_read = Some(Instant::now());
        }
        cache.last_avg_temp
    }

    fn valid(&self) -> bool {
        self.handle.temperature().is_ok()
    }

    fn label(&self) -> &str {
        &self.label
    }
}

/// A single GPU cooler target, addressed as `nvidia:<index>:<fan index>`
/// (spec §4.2).
pub struct FanNvidia {
    label: String,
    handle: GpuHandle,
    fan_index: u32,
    manual: AtomicBool,
}

impl FanNvidia {
    pub fn new(label: impl Into<String>, handle: GpuHandle, fan_index: u32) -> Self {
        Self { label: label.into(), handle, fan_index, manual: AtomicBool::new(false) }
    }
}

impl Fan for FanNvidia {
    fn enable_control(&self) -> Result<()> {
        // NVML takes manual control implicitly on the first
        // `set_fan_speed` call; there is no separate "request manual
        // control" step the way NV-CONTROL's
        // `NV_CTRL_GPU_COOLER_MANUAL_CONTROL` attribute has.
        self.manual.store(true, Ordering::Release);
        Ok(())
    }

    fn disable_control(&self) -> Result<()> {
        self.manual.store(false, Ordering::Release);
        self.handle.set_fan_auto(self.fan_index).map_err(|e| {
            warn!(fan = %self.label, error = %e, "failed to hand NVIDIA fan back to automatic control");
            e
        })
    }

    fn set_pwm(&self, value: u8) -> bool {
        if !self.manual.load(Ordering::Acquire) {
            return false;
        }
        let percent = constants::pwm_to_percent(value);
        match self.handle.set_fan_percent(self.fan_index, percent) {
            Ok(()) => true,
            Err(e) => {
                debug!(fan = %self.label, error = %e, "set_pwm failed, attempting recovery");
                crate::device::recover_control(self)
                    && self.handle.set_fan_percent(self.fan_index, percent).is_ok()
            }
        }
    }

    fn get_pwm(&self) -> u8 {
        self.handle
            .fan_percent(self.fan_index)
            .map(constants::percent_to_pwm)
            .unwrap_or(0)
    }

    fn get_rpm(&self) -> u32 {
        // NVML exposes no tachometer reading on consumer GPUs; the
        // commanded duty cycle stands in for "is the fan spinning" in
        // the engine's start-up/zero-detection logic (spec §4.2 step 3).
        self.handle.fan_percent(self.fan_index).unwrap_or(0)
    }

    fn valid(&self) -> bool {
        self.handle.fan_percent(self.fan_index).is_ok()
    }

    fn label(&self) -> &str {
        &self.label
    }
}

/// Open GPU index `index`, returning `BackendUnavailable` if NVML can't
/// resolve it (spec §4.5: NVIDIA devices are additive, never required).
pub fn open_gpu(index: u32) -> Result<GpuHandle> {
    GpuHandle::open(index).map_err(|e| FanconError::BackendUnavailable(e.to_string()))
}
