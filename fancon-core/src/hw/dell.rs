//! Dell SMM fan backend (spec §4.2 FanDell, §6 Dell SMM register/command
//! set). Grounded on `original_source/src/DellSMM.cpp`'s `i8k_smm`
//! inline-assembly calling convention: load the six-register record into
//! `eax..edi`, execute `out al, 0xb2` then `out al, 0x84` to trigger the
//! SMI, and read the registers back. A call succeeds when `eax & 0xffff
//! != 0xffff` and `eax` changed (the original additionally inspects the
//! CPU flags register post-call; this translation keeps the two
//! value-based checks and drops the flags probe, which Rust's inline asm
//! makes awkward to extract without its own carry-only asm block).

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;

use fancon_error::{FanconError, Result};
use tracing::{debug, info, warn};

use crate::constants::smm;
use crate::device::Fan;
use crate::hw::sysfs::FanSysfs;

#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
struct SmmRegisters {
    eax: u32,
    ebx: u32,
    ecx: u32,
    edx: u32,
    esi: u32,
    edi: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InitState {
    NotInitialized,
    Successful,
    Failed,
}

static INIT_STATE: Mutex<InitState> = Mutex::new(InitState::NotInitialized);

/// One-time `ioperm` acquisition for ports 0xb2 and 0x84 (spec §5 "SMM
/// port permissions: process-wide one-time initialisation, guarded by a
/// boolean state variable").
fn init_ioperms() -> bool {
    let mut state = INIT_STATE.lock().unwrap();
    if *state == InitState::NotInitialized {
        *state = if acquire_ports() { InitState::Successful } else { InitState::Failed };
    }
    *state == InitState::Successful
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
fn acquire_ports() -> bool {
    unsafe { libc::ioperm(0xb2, 4, 1) == 0 && libc::ioperm(0x84, 4, 1) == 0 }
}

#[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
fn acquire_ports() -> bool {
    false
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
unsafe fn i8k_smm(regs: &mut SmmRegisters) -> bool {
    use std::arch::asm;

    let eax_in = regs.eax;
    let mut eax = regs.eax;
    let mut ebx = regs.ebx;
    let mut ecx = regs.ecx;
    let mut edx = regs.edx;
    let mut esi = regs.esi;
    let mut edi = regs.edi;

    asm!(
        "out 0xb2, al",
        "out 0x84, al",
        inout("eax") eax,
        inout("ebx") ebx,
        inout("ecx") ecx,
        inout("edx") edx,
        inout("esi") esi,
        inout("edi") edi,
        options(nostack, preserves_flags)
    );

    regs.eax = eax;
    regs.ebx = ebx;
    regs.ecx = ecx;
    regs.edx = edx;
    regs.esi = esi;
    regs.edi = edi;

    (eax & 0xffff) != 0xffff && eax != eax_in
}

#[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
unsafe fn i8k_smm(_regs: &mut SmmRegisters) -> bool {
    false
}

fn smm_call(eax: u16, ebx: u32) -> Result<SmmRegisters> {
    if !init_ioperms() {
        return Err(FanconError::SmmPortPermission(std::io::Error::last_os_error()));
    }

    let mut regs = SmmRegisters { eax: u32::from(eax), ebx, ..Default::default() };
    let ok = unsafe { i8k_smm(&mut regs) };
    if !ok {
        return Err(FanconError::SmmCallFailed { command: eax, rc: -1 });
    }
    Ok(regs)
}

/// Confirm Dell SMM presence: `SMM_GET_DELL_SIG_{1,2}` must return the
/// `DIAG_SIG`/`DELL_SIG` signature pair (spec §4.2, §6).
pub fn smm_present() -> bool {
    for cmd in [smm::GET_DELL_SIG_1, smm::GET_DELL_SIG_2] {
        if let Ok(regs) = smm_call(cmd, 0) {
            if regs.eax == smm::DIAG_SIG && regs.edx == smm::DELL_SIG {
                return true;
            }
        }
    }
    false
}

fn fan_rpm_status(fan_index: u32) -> Option<u32> {
    smm_call(smm::GET_FAN, fan_index & 0xff).ok().map(|r| r.eax & 0xffff)
}

const MANUAL_CONTROL_CMDS: [(u8, u16); 3] =
    [(1, smm::MANUAL_CONTROL_1), (2, smm::MANUAL_CONTROL_2), (3, smm::MANUAL_CONTROL_3)];
const AUTO_CONTROL_CMDS: [(u8, u16); 3] =
    [(1, smm::AUTO_CONTROL_1), (2, smm::AUTO_CONTROL_2), (3, smm::AUTO_CONTROL_3)];

fn manual_cmd_for(method: u8) -> u16 {
    MANUAL_CONTROL_CMDS.iter().find(|(m, _)| *m == method).map(|(_, c)| *c).unwrap_or(smm::MANUAL_CONTROL_2)
}

fn auto_cmd_for(method: u8) -> u16 {
    AUTO_CONTROL_CMDS.iter().find(|(m, _)| *m == method).map(|(_, c)| *c).unwrap_or(smm::AUTO_CONTROL_2)
}

/// Pick the manual-control method that produced the largest RPM delta
/// (spec §4.2, §8 scenario 4). Pulled out of `probe_driver_flag` as a
/// pure function so the election policy is testable without real SMM
/// ports, the way `cc-detect::port_io::MockPortIo` isolates port access
/// from the probing logic it drives.
fn elect_best_method(deltas: &[(u8, u32)]) -> Option<u8> {
    deltas.iter().copied().max_by_key(|(_, delta)| *delta).map(|(method, _)| method)
}

/// Dell SMM fan backend: extends `FanSysfs` by composition (spec §9).
/// `set_pwm`/`get_pwm`/`get_rpm` still go through the sysfs `pwm<N>` /
/// `fan<N>_input` files; only `enable_control`/`disable_control` are
/// routed through the SMM command set.
pub struct FanDell {
    inner: FanSysfs,
    fan_index: u32,
    /// Elected manual-control method (1, 2, or 3), probed once on first
    /// `enable_control` (spec §4.2, §8 scenario 4).
    driver_flag: AtomicU8,
    flag_elected: std::sync::atomic::AtomicBool,
}

impl FanDell {
    pub fn new(inner: FanSysfs, fan_index: u32) -> Self {
        Self {
            inner,
            fan_index,
            driver_flag: AtomicU8::new(smm::DEFAULT_DRIVER_FLAG),
            flag_elected: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Probe which of manual-control methods 1-3 actually moves the fan,
    /// by comparing the PWM delta each produces between min and max
    /// (spec §4.2: "probes which of SMM commands ... actually takes
    /// effect by choosing whichever produces the largest PWM change").
    fn probe_driver_flag(&self) {
        if self.flag_elected.load(Ordering::Acquire) {
            return;
        }

        let mut deltas = Vec::with_capacity(MANUAL_CONTROL_CMDS.len());
        for (method, manual_cmd) in MANUAL_CONTROL_CMDS {
            if smm_call(manual_cmd, self.fan_index & 0xff).is_err() {
                continue;
            }
            let before = fan_rpm_status(self.fan_index).unwrap_or(0);
            let _ = self.inner.set_pwm(255);
            std::thread::sleep(std::time::Duration::from_millis(250));
            let after = fan_rpm_status(self.fan_index).unwrap_or(0);
            deltas.push((method, after.abs_diff(before)));

            let _ = smm_call(auto_cmd_for(method), self.fan_index & 0xff);
        }

        let best = elect_best_method(&deltas);
        let elected = best.unwrap_or(smm::DEFAULT_DRIVER_FLAG);
        if best.is_none() {
            warn!(fan = %self.inner.label(), "SMM manual-control probe inconclusive, defaulting to method 2");
        } else {
            info!(fan = %self.inner.label(), method = elected, "elected Dell SMM manual-control method");
        }
        self.driver_flag.store(elected, Ordering::Release);
        self.flag_elected.store(true, Ordering::Release);
    }

    pub fn elected_driver_flag(&self) -> u8 {
        self.driver_flag.load(Ordering::Acquire)
    }
}

impl Fan for FanDell {
    fn enable_control(&self) -> Result<()> {
        self.probe_driver_flag();
        let method = self.driver_flag.load(Ordering::Acquire);
        smm_call(manual_cmd_for(method), self.fan_index & 0xff).map(|_| ())
    }

    fn disable_control(&self) -> Result<()> {
        let method = self.driver_flag.load(Ordering::Acquire);
        smm_call(auto_cmd_for(method), self.fan_index & 0xff).map(|_| ())
    }

    fn set_pwm(&self, value: u8) -> bool {
        if self.inner.set_pwm(value) {
            return true;
        }
        debug!(fan = %self.inner.label(), "set_pwm failed, attempting recovery");
        crate::device::recover_control(self) && self.inner.set_pwm(value)
    }

    fn get_pwm(&self) -> u8 {
        self.inner.get_pwm()
    }

    fn get_rpm(&self) -> u32 {
        self.inner.get_rpm()
    }

    fn valid(&self) -> bool {
        self.inner.valid()
    }

    fn label(&self) -> &str {
        self.inner.label()
    }

    fn driver_flag(&self) -> Option<u8> {
        if self.flag_elected.load(Ordering::Acquire) {
            Some(self.driver_flag.load(Ordering::Acquire))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elects_method_with_largest_delta() {
        assert_eq!(elect_best_method(&[(1, 200), (2, 1800), (3, 50)]), Some(2));
    }

    #[test]
    fn elects_none_when_no_method_responded() {
        assert_eq!(elect_best_method(&[]), None);
    }

    #[test]
    fn manual_and_auto_cmd_lookup_falls_back_to_method_two() {
        assert_eq!(manual_cmd_for(1), smm::MANUAL_CONTROL_1);
        assert_eq!(manual_cmd_for(99), smm::MANUAL_CONTROL_2);
        assert_eq!(auto_cmd_for(3), smm::AUTO_CONTROL_3);
        assert_eq!(auto_cmd_for(99), smm::AUTO_CONTROL_2);
    }
}
