//! TSC frequency derivation, tick conversion and wall-clock calibration.
//!
//! Every timing conversion downstream of this module depends on the derived
//! TSC frequency being exact, so frequency derivation has no degraded
//! fallback: an unknown CPU model or a missing invariant TSC is a hard error
//! at vCPU construction.

use axerrno::{ax_err, AxResult};

use crate::arch_vcpu::AxArchVCpu;
use crate::cpuid::CpuFeatures;

/// `IA32_PLATFORM_INFO`: maximum non-turbo ratio in bits [15:8].
pub const IA32_PLATFORM_INFO: u32 = 0xce;

/// `IA32_VMX_MISC`: preemption-timer rate in bits [4:0].
pub const IA32_VMX_MISC: u32 = 0x485;

/// Two consecutive TSC brackets within this many ticks of each other are
/// considered interrupt-free.
const CONVERGENCE_TICKS: u64 = 100;

/// A wall-clock instant as (seconds, nanoseconds).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeSpec {
    /// Whole seconds.
    pub secs: u64,
    /// Nanoseconds within the second.
    pub nanos: u64,
}

/// A wall-clock reading paired with the TSC value judged simultaneous with it.
///
/// Transient: computed once per "set wall clock" request and handed to the
/// hypervisor, never retained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WallclockSample {
    /// The sampled wall time.
    pub wall: TimeSpec,
    /// The TSC value at the midpoint of the sampling bracket.
    pub tsc: u64,
}

/// Bus (BCLK) frequency in kHz for a family-6 display model.
///
/// Nehalem/Westmere parts clock the bus at 133.33 MHz; Sandy Bridge and later
/// use 100 MHz. Anything unrecognized is a hard failure: guessing a bus clock
/// would silently corrupt every conversion built on top of it.
fn bus_khz_for_model(display_family: u32, display_model: u32) -> AxResult<u64> {
    if display_family != 0x6 {
        return ax_err!(
            Unsupported,
            format!("no TSC frequency info for family {:#x}", display_family)
        );
    }
    match display_model {
        // Nehalem / Westmere
        0x1a | 0x1e | 0x1f | 0x25 | 0x2c | 0x2e | 0x2f => Ok(133_333),
        // Sandy Bridge and later client/server models
        0x2a | 0x2d | 0x3a | 0x3c | 0x3d | 0x3e | 0x3f | 0x45 | 0x46 | 0x47 | 0x4e | 0x4f
        | 0x55 | 0x56 | 0x5e | 0x8e | 0x9e | 0xa5 | 0xa6 => Ok(100_000),
        _ => ax_err!(
            Unsupported,
            format!("no TSC frequency info for model {:#x}", display_model)
        ),
    }
}

/// Derives the TSC frequency in kHz.
///
/// `tsc_khz = bus_khz * max_non_turbo_ratio`, with the ratio read from
/// `IA32_PLATFORM_INFO[15:8]`. Requires TSC and invariant-TSC support.
pub fn tsc_frequency_khz<A: AxArchVCpu>(arch: &mut A, features: &CpuFeatures) -> AxResult<u64> {
    if !features.tsc || !features.invariant_tsc {
        return ax_err!(Unsupported, "no TSC frequency info: invariant TSC required");
    }
    let bus_khz = bus_khz_for_model(features.display_family, features.display_model)?;
    let ratio = (arch.read_msr(IA32_PLATFORM_INFO)? >> 8) & 0xff;
    if ratio == 0 {
        // A zeroed IA32_PLATFORM_INFO (seen when the MSR is unimplemented
        // under nesting) would make every conversion divide by zero.
        return ax_err!(Unsupported, "no TSC frequency info: non-turbo ratio is 0");
    }
    Ok(bus_khz * ratio)
}

/// Reads the preemption-timer right-shift amount.
///
/// The preemption timer ticks once per `2^shift` TSC ticks.
pub fn preemption_timer_shift<A: AxArchVCpu>(arch: &mut A) -> AxResult<u32> {
    Ok((arch.read_msr(IA32_VMX_MISC)? & 0x1f) as u32)
}

/// Converts TSC ticks to microseconds.
///
/// The multiplication is ordered first to minimize rounding loss; callers
/// rely on `ticks_to_microseconds(tsc_khz * 1000, tsc_khz) == 1_000_000`
/// holding exactly.
pub fn ticks_to_microseconds(ticks: u64, tsc_khz: u64) -> u64 {
    (ticks * 1000) / tsc_khz
}

/// Converts TSC ticks to nanoseconds, multiply-first like
/// [`ticks_to_microseconds`].
pub fn ticks_to_nanoseconds(ticks: u64, tsc_khz: u64) -> u64 {
    (ticks * 1_000_000) / tsc_khz
}

/// Converts remaining preemption-timer ticks to the nanosecond argument of a
/// `yield` run code: how long until this vCPU has something to do.
pub fn yield_nanos_for_timer_ticks(timer_ticks: u64, shift: u32, tsc_khz: u64) -> u64 {
    ticks_to_nanoseconds(timer_ticks << shift, tsc_khz)
}

/// Calibrates the host wall clock against the TSC.
///
/// Brackets a wall-clock read between two TSC reads and retries until two
/// consecutive brackets are within [`CONVERGENCE_TICKS`] of each other,
/// guaranteeing a tight interrupt-free window. The retry count is unbounded:
/// correctness, not latency, is the requirement here.
pub fn calibrate_wallclock<A: AxArchVCpu>(arch: &mut A) -> WallclockSample {
    let mut diff2: Option<u64> = None;
    loop {
        let t1 = arch.read_tsc();
        let wall = arch.read_wallclock();
        let t2 = arch.read_tsc();
        let diff1 = t2 - t1;
        if let Some(diff2) = diff2 {
            if diff1.abs_diff(diff2) <= CONVERGENCE_TICKS {
                trace!("wallclock calibrated: bracket {} ticks", diff1);
                return WallclockSample {
                    wall,
                    tsc: t1 + diff1 / 2,
                };
            }
        }
        diff2 = Some(diff1);
    }
}
