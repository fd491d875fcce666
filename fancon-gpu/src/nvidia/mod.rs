//! NVIDIA backend via NVML (spec §4.5, as resolved in `SPEC_FULL.md`:
//! the corpus's NVIDIA fan-control examples all wrap NVML rather than
//! the NV-CONTROL/X11 extension spec.md describes, and spec.md §6
//! explicitly allows it ("NVML is optional and additive")).
//!
//! `nvml-wrapper`'s safe API does not expose fan control (NVML added
//! `nvmlDeviceSetFanSpeed_v2`/`nvmlDeviceSetDefaultFanSpeed_v2` after the
//! crate's last stable fan-control surface), so the raw symbols are
//! called directly through the `Nvml` handle's loaded library, the same
//! way the GPU-fan-daemon example in this corpus does it.

mod raw;

use std::ffi::OsStr;

use fancon_error::{FanconError, Result};
use nvml_wrapper::{Device, Nvml};
use ouroboros::self_referencing;
use tracing::{debug, info, warn};

use crate::constants::{self, MAX_FANS_PER_GPU};
use crate::types::GpuInfo;
use raw::NvmlFanControl;

/// Process-wide NVML handle plus a borrowed `Device` for one GPU index,
/// self-referencing because `Device<'nvml>` borrows from `Nvml` (mirrors
/// the `NvmlHandle` pattern used by NVIDIA fan-control daemons in this
/// corpus built on top of `nvml-wrapper`).
#[self_referencing]
pub struct GpuHandle {
    nvml: Nvml,
    #[borrows(nvml)]
    #[covariant]
    device: Device<'this>,
    index: u32,
}

impl GpuHandle {
    /// Open NVML and bind a handle to `index`. Each `Fan`/`Sensor`
    /// backend instance owns its own handle; NVML itself tolerates
    /// concurrent initialisation from multiple processes/threads.
    pub fn open(index: u32) -> Result<Self> {
        let nvml = Nvml::builder()
            .lib_path(OsStr::new(constants::NVML_LIB))
            .init()
            .map_err(|e| FanconError::Nvml(e.to_string()))?;

        GpuHandleTryBuilder {
            nvml,
            device_builder: |nvml: &Nvml| nvml.device_by_index(index),
            index,
        }
        .try_build()
        .map_err(|e| FanconError::Nvml(e.to_string()))
    }

    pub fn index(&self) -> u32 {
        *self.borrow_index()
    }

    /// Device temperature in whole degrees Celsius (spec §4.1 NvidiaSensor).
    pub fn temperature(&self) -> Result<i32> {
        use nvml_wrapper::enum_wrappers::device::TemperatureSensor;
        self.borrow_device()
            .temperature(TemperatureSensor::Gpu)
            .map(|t| t as i32)
            .map_err(|e| FanconError::Nvml(e.to_string()))
    }

    /// Enable manual fan control on `fan_index` and set its duty cycle
    /// (spec §4.2 FanNvidia: `NV_CTRL_GPU_COOLER_MANUAL_CONTROL` true,
    /// then a 0..100 percentage on the cooler target).
    pub fn set_fan_percent(&self, fan_index: u32, percent: u32) -> Result<()> {
        self.borrow_device()
            .set_fan_speed(fan_index, percent.min(100))
            .map_err(|e| FanconError::Nvml(e.to_string()))
    }

    /// Hand fan control back to the driver (`disable_control`).
    pub fn set_fan_auto(&self, fan_index: u32) -> Result<()> {
        self.borrow_device()
            .set_default_fan_speed(fan_index)
            .map_err(|e| FanconError::Nvml(e.to_string()))
    }

    /// Current commanded duty cycle, 0..100. NVML does not expose a
    /// tachometer reading on consumer GPUs; this is the control-surface
    /// value itself, which is what the engine's smoothing/start-up logic
    /// needs (nonzero iff the fan is commanded to spin).
    pub fn fan_percent(&self, fan_index: u32) -> Result<u32> {
        self.borrow_device()
            .fan_duty(fan_index)
            .map_err(|e| FanconError::Nvml(e.to_string()))
    }

    pub fn num_fans(&self) -> Result<u32> {
        self.borrow_device()
            .num_fans()
            .map(|n| n.min(MAX_FANS_PER_GPU))
            .map_err(|e| FanconError::Nvml(e.to_string()))
    }
}

/// Enumerate GPUs visible to NVML (spec §4.5 item 4). Returns an empty
/// list, never an error, when NVML itself is unavailable -- the rest of
/// the system operates without NVIDIA devices (spec §4.5 closing line).
pub fn enumerate_gpus() -> Vec<GpuInfo> {
    let nvml = match Nvml::builder().lib_path(OsStr::new(constants::NVML_LIB)).init() {
        Ok(n) => n,
        Err(e) => {
            info!(error = %e, "NVML unavailable, no NVIDIA devices will be enumerated");
            return Vec::new();
        }
    };

    let count = match nvml.device_count() {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "failed to query NVML device count");
            return Vec::new();
        }
    };

    let mut gpus = Vec::new();
    for index in 0..count {
        let device = match nvml.device_by_index(index) {
            Ok(d) => d,
            Err(e) => {
                warn!(index, error = %e, "failed to open NVML device");
                continue;
            }
        };
        let name = device.name().unwrap_or_else(|_| format!("gpu{index}"));
        let num_fans = device.num_fans().unwrap_or(0).min(MAX_FANS_PER_GPU);
        debug!(index, %name, num_fans, "enumerated NVIDIA GPU");
        gpus.push(GpuInfo { index, name, num_fans });
    }

    gpus
}
