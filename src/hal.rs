use axerrno::{ax_err, AxResult};

use crate::time::TimeSpec;
use crate::vcpu::VCpuId;

/// The interfaces which the underlying host (kernel or hypervisor) must implement.
///
/// These cover the scheduling services the run loop suspends on and the
/// wall-clock hypercall surface consumed after calibration.
pub trait AxVCpuHal {
    /// Puts the calling host thread to sleep for `nanos` nanoseconds.
    ///
    /// Best-effort scheduler sleep; the thread may be woken later than
    /// requested but not earlier.
    fn sleep_nanos(nanos: u64);

    /// Cooperatively yields the calling host thread's scheduling quantum.
    fn yield_now();

    /// Sets the host-visible RTC portion of a vCPU's wall clock.
    fn set_host_wallclock_rtc(vcpu: VCpuId, secs: u64, nanos: u64) -> AxResult;

    /// Sets the TSC value judged simultaneous with the last RTC sample.
    fn set_host_wallclock_tsc(vcpu: VCpuId, tsc: u64) -> AxResult;

    /// Resets a vCPU's host wall-clock state.
    fn reset_host_wallclock(vcpu: VCpuId) -> AxResult;

    /// Returns the current wall-clock sample for a vCPU.
    fn get_host_wallclock(_vcpu: VCpuId) -> AxResult<(TimeSpec, u64)> {
        ax_err!(Unsupported, "get_host_wallclock is not implemented")
    }
}
