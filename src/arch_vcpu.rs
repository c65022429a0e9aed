use axerrno::AxResult;

use crate::cpuid::CpuidResult;
use crate::time::TimeSpec;

/// Architecture-specific virtual CPU trait definition.
///
/// This trait carries every raw hardware primitive the virtualization core
/// consumes: entering the guest, MSR and CPUID access, the time-stamp counter,
/// the host wall clock, and exception injection. The core itself never touches
/// hardware directly, which keeps the policy logic testable against mock
/// implementations.
///
/// # Design Philosophy
///
/// - **Architecture Agnostic**: Common vCPU operations are defined here while
///   allowing architecture-specific implementations
/// - **Lifecycle Management**: Clear separation between creation, binding, and
///   execution phases
/// - **Hardware Abstraction**: Isolates VMCS/VMCB details from the policy
///   engines driving them
pub trait AxArchVCpu: Sized {
    /// Architecture-specific configuration for vCPU creation.
    type CreateConfig;

    /// Creates a new architecture-specific vCPU instance.
    fn new(config: Self::CreateConfig) -> AxResult<Self>;

    /// Binds the vCPU to the current physical CPU for execution.
    ///
    /// The binding is fixed for the lifetime of the vCPU; per-vCPU state in
    /// this crate is only ever touched from the bound host thread.
    fn bind(&mut self) -> AxResult;

    /// Unbinds the vCPU from the current physical CPU.
    fn unbind(&mut self) -> AxResult;

    /// Executes the vCPU until control returns to the host.
    ///
    /// Returns the raw, hypercall-encoded run code: `(argument << 4) | opcode`.
    /// See [`RunExit`](crate::RunExit) for the decoding rules. This call may
    /// block for an arbitrary guest execution interval.
    fn run(&mut self) -> AxResult<u64>;

    /// Reads a model-specific register on the physical CPU.
    fn read_msr(&mut self, msr: u32) -> AxResult<u64>;

    /// Writes a model-specific register on the physical CPU.
    fn write_msr(&mut self, msr: u32, value: u64) -> AxResult;

    /// Executes the CPUID instruction with the given `eax`/`ecx` inputs.
    fn cpuid(&mut self, eax: u32, ecx: u32) -> CpuidResult;

    /// Reads the time-stamp counter.
    fn read_tsc(&mut self) -> u64;

    /// Reads the host wall clock.
    fn read_wallclock(&mut self) -> TimeSpec;

    /// Injects a general-protection fault (`#GP`, vector 13) into the guest.
    ///
    /// Implementations must also suppress retirement of the trapped
    /// instruction so the guest re-observes architectural behavior, i.e. the
    /// instruction pointer is *not* advanced past the faulting instruction.
    fn inject_gp(&mut self) -> AxResult;

    /// Requests that the hardware stop executing this vCPU.
    ///
    /// Called from the run-loop thread only, never from a signal handler; see
    /// [`AxVCpu::request_kill`](crate::AxVCpu::request_kill).
    fn kill(&mut self) -> AxResult;
}
