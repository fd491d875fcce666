//! Raw NVML symbols not exposed by `nvml-wrapper`'s safe API
//! (`nvmlDeviceGetNumFans`, `nvmlDeviceGetTargetFanSpeed`,
//! `nvmlDeviceSetFanSpeed_v2`, `nvmlDeviceSetDefaultFanSpeed_v2`),
//! resolved through the device's already-loaded library handle. Grounded
//! on the `AdditionalNvmlFunctionality` extension trait used by the NVML
//! fan-control daemon example in this corpus, which resolves fan-control
//! symbols the same way for functionality `nvml-wrapper` doesn't expose.

use std::ffi::c_uint;

use nvml_wrapper::error::{nvml_sym, nvml_try, NvmlError};
use nvml_wrapper::Device;

pub trait NvmlFanControl {
    fn num_fans(&self) -> Result<u32, NvmlError>;
    fn fan_duty(&self, fan_idx: u32) -> Result<u32, NvmlError>;
    fn set_fan_speed(&self, fan_idx: u32, percent: u32) -> Result<(), NvmlError>;
    fn set_default_fan_speed(&self, fan_idx: u32) -> Result<(), NvmlError>;
}

impl<'nvml> NvmlFanControl for Device<'nvml> {
    fn num_fans(&self) -> Result<u32, NvmlError> {
        let sym = nvml_sym(self.nvml().nvml_lib().nvmlDeviceGetNumFans.as_ref())?;

        let mut count: c_uint = 0;
        unsafe { nvml_try(sym(self.handle(), &mut count))? }
        Ok(count.into())
    }

    fn fan_duty(&self, fan_idx: u32) -> Result<u32, NvmlError> {
        let sym = nvml_sym(self.nvml().nvml_lib().nvmlDeviceGetTargetFanSpeed.as_ref())?;

        let mut duty: c_uint = 0;
        unsafe { nvml_try(sym(self.handle(), fan_idx, &mut duty))? }
        Ok(duty.into())
    }

    fn set_fan_speed(&self, fan_idx: u32, percent: u32) -> Result<(), NvmlError> {
        let sym = nvml_sym(self.nvml().nvml_lib().nvmlDeviceSetFanSpeed_v2.as_ref())?;

        unsafe { nvml_try(sym(self.handle(), fan_idx, percent)) }
    }

    fn set_default_fan_speed(&self, fan_idx: u32) -> Result<(), NvmlError> {
        let sym = nvml_sym(self.nvml().nvml_lib().nvmlDeviceSetDefaultFanSpeed_v2.as_ref())?;

        unsafe { nvml_try(sym(self.handle(), fan_idx)) }
    }
}
