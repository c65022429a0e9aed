use core::cell::{RefCell, UnsafeCell};
use core::sync::atomic::{AtomicBool, Ordering};

use alloc::vec::Vec;

use axerrno::{ax_err, AxResult};

use crate::arch_vcpu::AxArchVCpu;
use crate::cpuid::{handle_root_cpuid, CpuFeatures, CpuidReply, CpuidResult, GuestCpuidTable};
use crate::exit::RunExit;
use crate::hal::AxVCpuHal;
use crate::msr::{MsrEngine, MsrReply};
use crate::time::{calibrate_wallclock, preemption_timer_shift, tsc_frequency_khz};

/// Identifier of a vCPU within its owning VM.
pub type VCpuId = usize;

/// Interval slept when the run primitive reports a suspended vCPU.
const SUSPEND_QUANTUM_NANOS: u64 = 250_000_000;

/// Construction-time parameters of a vCPU.
#[derive(Debug, Clone, Copy)]
pub struct VCpuConfig {
    /// The id of the vcpu.
    pub id: VCpuId,
    /// The physical CPU this vcpu's host thread is pinned to.
    pub favor_phys_cpu: usize,
    /// Handle of the vCPU faults escalate to, if any.
    ///
    /// A plain non-owning handle into the owning VM's vCPU table; the
    /// relationship is "may escalate a fault to", not ownership.
    pub parent: Option<VCpuId>,
    /// Whether this vCPU backs the privileged (root/dom0) context.
    pub is_root: bool,
}

/// The constant part of `AxVCpu`.
struct AxVCpuInnerConst {
    config: VCpuConfig,
    /// Calibrated TSC frequency in kHz. Populated at construction; an
    /// underivable frequency fails construction instead of degrading.
    tsc_khz: u64,
    /// Preemption-timer right-shift amount: the timer ticks once per
    /// `2^shift` TSC ticks.
    timer_shift: u32,
}

/// The state of a virtual CPU.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VCpuState {
    /// An invalid state, entered after a broken transition or an
    /// unrecognized run code. Terminal.
    Invalid = 0,
    /// The vcpu is created but not yet bound to a physical CPU.
    Created = 1,
    /// The vcpu is bound to a physical CPU and ready to run.
    Ready = 2,
    /// The vcpu is executing guest code (or trap handlers on its behalf).
    Running = 3,
    /// The host thread is sleeping or yielding on the vcpu's behalf.
    Yielding = 4,
    /// The host thread is calibrating the wall clock for the vcpu.
    SyncingClock = 5,
    /// The vcpu halted. Terminal.
    Halted = 6,
    /// The vcpu faulted or violated policy. Terminal.
    Faulted = 7,
}

/// The mutable part of [`AxVCpu`].
pub struct AxVCpuInnerMut {
    /// The state of the vcpu.
    state: VCpuState,
}

/// Why a run loop stopped driving its vCPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStop {
    /// The vCPU halted.
    Halted,
    /// The vCPU faulted.
    Faulted {
        /// Opcode-specific error code from the fault run code.
        code: u64,
        /// The parent context control should be handed back to, if any.
        parent: Option<VCpuId>,
    },
    /// The vCPU was killed through [`AxVCpu::request_kill`].
    Killed,
}

/// A virtual CPU with its hardware-state virtualization engines.
///
/// Composes the MSR policy engine, the CPUID virtualizer and the time-sync
/// state for one vCPU, and drives the architecture-specific run primitive
/// through a strict state machine.
///
/// Note that:
/// - This struct handles internal mutability itself, almost all the methods
///   are `&self`.
/// - This struct is not thread-safe and deliberately not `Sync`: each vCPU is
///   touched only by the single host thread bound to it. The one exception is
///   [`AxVCpu::request_kill`], which is async-signal-safe.
pub struct AxVCpu<A: AxArchVCpu> {
    /// The constant part of the vcpu.
    inner_const: AxVCpuInnerConst,
    /// The mutable part of the vcpu.
    inner_mut: RefCell<AxVCpuInnerMut>,
    /// Set from signal context; polled by the run loop at a safe point.
    killed: AtomicBool,
    /// The MSR policy engine.
    msr: RefCell<MsrEngine>,
    /// The guest-visible CPUID leaf table (unused for the root context).
    cpuid: RefCell<GuestCpuidTable>,
    /// The architecture-specific state of the vcpu.
    ///
    /// `UnsafeCell` is used to allow interior mutability. Note that `RefCell`
    /// or `Mutex` is not suitable here because it's not possible to drop the
    /// guard when launching a vcpu.
    arch_vcpu: UnsafeCell<A>,
}

impl<A: AxArchVCpu> AxVCpu<A> {
    /// Create a new [`AxVCpu`].
    ///
    /// Probes CPU features, derives the TSC frequency and preemption-timer
    /// shift, and builds the MSR policy table and guest CPUID table. Fails if
    /// the frequency cannot be derived: every timing conversion depends on it.
    pub fn new(config: VCpuConfig, arch_config: A::CreateConfig) -> AxResult<Self> {
        let mut arch = A::new(arch_config)?;
        let features = CpuFeatures::probe(&mut arch);
        let tsc_khz = tsc_frequency_khz(&mut arch, &features)?;
        let timer_shift = preemption_timer_shift(&mut arch)?;
        let msr = MsrEngine::new(&mut arch, config.is_root, &features)?;
        let cpuid = GuestCpuidTable::build(&mut arch);
        debug!(
            "vcpu {} created: tsc {} kHz, timer shift {}",
            config.id, tsc_khz, timer_shift
        );
        Ok(Self {
            inner_const: AxVCpuInnerConst {
                config,
                tsc_khz,
                timer_shift,
            },
            inner_mut: RefCell::new(AxVCpuInnerMut {
                state: VCpuState::Created,
            }),
            killed: AtomicBool::new(false),
            msr: RefCell::new(msr),
            cpuid: RefCell::new(cpuid),
            arch_vcpu: UnsafeCell::new(arch),
        })
    }

    /// Get the id of the vcpu.
    pub const fn id(&self) -> VCpuId {
        self.inner_const.config.id
    }

    /// Get the id of the physical CPU this vcpu's host thread is pinned to.
    pub const fn favor_phys_cpu(&self) -> usize {
        self.inner_const.config.favor_phys_cpu
    }

    /// Get the parent vCPU handle, if this vcpu escalates faults.
    pub const fn parent(&self) -> Option<VCpuId> {
        self.inner_const.config.parent
    }

    /// Whether this vcpu backs the privileged (root) context.
    pub const fn is_root(&self) -> bool {
        self.inner_const.config.is_root
    }

    /// Get whether the vcpu is the BSP. We always assume the first vcpu
    /// (vcpu with id #0) is the BSP.
    pub const fn is_bsp(&self) -> bool {
        self.inner_const.config.id == 0
    }

    /// The calibrated TSC frequency in kHz.
    pub const fn tsc_khz(&self) -> u64 {
        self.inner_const.tsc_khz
    }

    /// The preemption-timer right-shift amount.
    pub const fn timer_shift(&self) -> u32 {
        self.inner_const.timer_shift
    }

    /// Get the state of the vcpu.
    pub fn state(&self) -> VCpuState {
        self.inner_mut.borrow().state
    }

    /// Set the state of the vcpu.
    /// # Safety
    /// This method is unsafe because it may break the state transition model.
    /// Use it with caution.
    pub unsafe fn set_state(&self, state: VCpuState) {
        self.inner_mut.borrow_mut().state = state;
    }

    /// Execute a block with the state of the vcpu transitioned from `from` to
    /// `to`. If the current state is not `from`, return an error.
    ///
    /// The state will be set to [`VCpuState::Invalid`] if an error occurs
    /// (including the case that the current state is not `from`).
    ///
    /// The state will be set to `to` if the block is executed successfully.
    pub fn with_state_transition<F, T>(&self, from: VCpuState, to: VCpuState, f: F) -> AxResult<T>
    where
        F: FnOnce() -> AxResult<T>,
    {
        let mut inner_mut = self.inner_mut.borrow_mut();
        if inner_mut.state != from {
            let state = inner_mut.state;
            inner_mut.state = VCpuState::Invalid;
            ax_err!(
                BadState,
                format!("VCpu state is not {:?}, but {:?}", from, state)
            )
        } else {
            drop(inner_mut);
            let result = f();
            self.inner_mut.borrow_mut().state = if result.is_err() {
                VCpuState::Invalid
            } else {
                to
            };
            result
        }
    }

    /// Transition the state of the vcpu. If the current state is not `from`,
    /// return an error.
    pub fn transition_state(&self, from: VCpuState, to: VCpuState) -> AxResult {
        self.with_state_transition(from, to, || Ok(()))
    }

    /// Forces a terminal state, bypassing transition checks. Internal: used
    /// for halt/fault paths that may race with trap-handler verdicts.
    fn force_state(&self, state: VCpuState) {
        self.inner_mut.borrow_mut().state = state;
    }

    /// Get the architecture-specific vcpu.
    #[allow(clippy::mut_from_ref)]
    pub fn get_arch_vcpu(&self) -> &mut A {
        unsafe { &mut *self.arch_vcpu.get() }
    }

    /// Bind the vcpu to the current physical CPU.
    pub fn bind(&self) -> AxResult {
        self.with_state_transition(VCpuState::Created, VCpuState::Ready, || {
            self.get_arch_vcpu().bind()
        })
    }

    /// Unbind the vcpu from the current physical CPU.
    pub fn unbind(&self) -> AxResult {
        self.with_state_transition(VCpuState::Ready, VCpuState::Created, || {
            self.get_arch_vcpu().unbind()
        })
    }

    /// Request that this vCPU be killed.
    ///
    /// Async-signal-safe: only stores an atomic flag. The run-loop thread
    /// polls the flag at the top of each iteration and performs the actual
    /// kill operation itself; a signal handler must never invoke hypercalls
    /// directly.
    pub fn request_kill(&self) {
        self.killed.store(true, Ordering::Release);
    }

    /// Whether a kill has been requested.
    pub fn kill_requested(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    /// Restores isolated/costly MSRs into hardware.
    ///
    /// Must run on every world switch into this vCPU, strictly before any
    /// guest instruction of the next slice executes.
    pub fn world_switch_in(&self) -> AxResult {
        self.msr.borrow().world_switch_in(self.get_arch_vcpu())
    }

    /// Captures costly MSRs from hardware.
    ///
    /// Must run on every VM exit, strictly before the host reads any costly
    /// register's cached value. Returns "not handled" so other exit handlers
    /// still run.
    pub fn world_switch_out(&self) -> AxResult<bool> {
        self.msr.borrow_mut().world_switch_out(self.get_arch_vcpu())
    }

    /// Serves a trapped `rdmsr` against this vCPU's policy table.
    pub fn handle_rdmsr(&self, addr: u32) -> AxResult<MsrReply> {
        let reply = self
            .msr
            .borrow_mut()
            .handle_rdmsr(self.get_arch_vcpu(), addr)?;
        if let MsrReply::Halt(reason) = &reply {
            self.fault_with(reason);
        }
        Ok(reply)
    }

    /// Serves a trapped `wrmsr` against this vCPU's policy table.
    ///
    /// A policy violation halts this vCPU with a diagnostic rather than
    /// silently absorbing the write.
    pub fn handle_wrmsr(&self, addr: u32, value: u64) -> AxResult<MsrReply> {
        let reply = self
            .msr
            .borrow_mut()
            .handle_wrmsr(self.get_arch_vcpu(), addr, value)?;
        if let MsrReply::Halt(reason) = &reply {
            self.fault_with(reason);
        }
        Ok(reply)
    }

    /// Serves a trapped CPUID execution.
    ///
    /// The root context gets the pass-through emulator with the command
    /// channel; guests read from the precomputed leaf table.
    pub fn handle_cpuid(&self, eax: u32, ecx: u32) -> AxResult<CpuidReply> {
        if self.is_root() {
            handle_root_cpuid(self.get_arch_vcpu(), eax, ecx)
        } else {
            Ok(CpuidReply::Value(self.cpuid.borrow().lookup(eax, ecx)))
        }
    }

    /// Applies a "set emulated CPUID" hypercall: capability bits may only be
    /// cleared, never set.
    pub fn set_emulated_cpuid(&self, leaf: u32, subleaf: u32, values: CpuidResult) -> AxResult {
        self.cpuid.borrow_mut().narrow(leaf, subleaf, values)
    }

    /// Returns the cached value of an isolated/costly/emulated MSR, if kept.
    pub fn cached_msr(&self, addr: u32) -> Option<u64> {
        self.msr.borrow().cached(addr)
    }

    fn fault_with(&self, reason: &str) {
        match self.parent() {
            Some(parent) => warn!(
                "vcpu {} halted ({}), escalating to parent vcpu {}",
                self.id(),
                reason,
                parent
            ),
            None => warn!("vcpu {} halted: {}", self.id(), reason),
        }
        self.force_state(VCpuState::Faulted);
    }

    /// Drives this vCPU until a terminal condition.
    ///
    /// Repeatedly invokes the hardware run primitive and dispatches on the
    /// decoded run code. The MSR world-switch protocol brackets every entry
    /// and exit; trap handlers have already run inside the VMM by the time a
    /// run code is observed here.
    pub fn run_loop<H: AxVCpuHal>(&self) -> AxResult<RunStop> {
        self.transition_state(VCpuState::Ready, VCpuState::Running)?;
        loop {
            if self.kill_requested() {
                debug!("vcpu {}: kill requested, stopping", self.id());
                self.get_arch_vcpu().kill()?;
                self.force_state(VCpuState::Halted);
                return Ok(RunStop::Killed);
            }

            let raw = match self
                .world_switch_in()
                .and_then(|_| self.get_arch_vcpu().run())
                .and_then(|raw| self.world_switch_out().map(|_| raw))
            {
                Ok(raw) => raw,
                Err(e) => {
                    error!("vcpu {}: world switch failed: {:?}", self.id(), e);
                    self.force_state(VCpuState::Invalid);
                    return Err(e);
                }
            };

            match RunExit::decode(raw) {
                RunExit::Continue => {}
                RunExit::Yield { nanos } => {
                    self.transition_state(VCpuState::Running, VCpuState::Yielding)?;
                    if nanos > 0 {
                        H::sleep_nanos(nanos);
                    } else {
                        H::yield_now();
                    }
                    self.transition_state(VCpuState::Yielding, VCpuState::Running)?;
                }
                RunExit::SetWallclock => {
                    self.transition_state(VCpuState::Running, VCpuState::SyncingClock)?;
                    if let Err(e) = self.sync_wallclock::<H>() {
                        error!("vcpu {}: wall-clock sync failed: {:?}", self.id(), e);
                        self.force_state(VCpuState::Faulted);
                        return Err(e);
                    }
                    self.transition_state(VCpuState::SyncingClock, VCpuState::Running)?;
                }
                RunExit::Halt => {
                    debug!("vcpu {}: halted", self.id());
                    self.force_state(VCpuState::Halted);
                    return Ok(RunStop::Halted);
                }
                RunExit::Fault { code } => {
                    warn!("vcpu {}: fault {:#x}", self.id(), code);
                    self.force_state(VCpuState::Faulted);
                    return Ok(RunStop::Faulted {
                        code,
                        parent: self.parent(),
                    });
                }
                RunExit::Suspend => H::sleep_nanos(SUSPEND_QUANTUM_NANOS),
                RunExit::Unknown { raw } => {
                    error!("vcpu {}: unknown run code {:#x}", self.id(), raw);
                    self.force_state(VCpuState::Invalid);
                    return ax_err!(
                        BadState,
                        format!("unknown run code {:#x}", raw)
                    );
                }
            }
        }
    }

    fn sync_wallclock<H: AxVCpuHal>(&self) -> AxResult {
        let sample = calibrate_wallclock(self.get_arch_vcpu());
        H::set_host_wallclock_rtc(self.id(), sample.wall.secs, sample.wall.nanos)?;
        H::set_host_wallclock_tsc(self.id(), sample.tsc)
    }
}

/// The vCPUs owned by one virtual machine.
///
/// Replaces a global mutable vCPU registry: any code that must iterate "all
/// vCPUs of this VM" receives this collection explicitly.
pub struct AxVmVCpus<A: AxArchVCpu> {
    vcpus: Vec<AxVCpu<A>>,
}

impl<A: AxArchVCpu> AxVmVCpus<A> {
    /// Create an empty collection.
    pub const fn new() -> Self {
        Self { vcpus: Vec::new() }
    }

    /// Adds a vCPU. Ids must be unique within the VM.
    pub fn push(&mut self, vcpu: AxVCpu<A>) -> AxResult {
        if self.get(vcpu.id()).is_some() {
            return ax_err!(
                AlreadyExists,
                format!("vcpu id {} already registered", vcpu.id())
            );
        }
        self.vcpus.push(vcpu);
        Ok(())
    }

    /// Looks up a vCPU by id.
    pub fn get(&self, id: VCpuId) -> Option<&AxVCpu<A>> {
        self.vcpus.iter().find(|v| v.id() == id)
    }

    /// Iterates over all vCPUs.
    pub fn iter(&self) -> impl Iterator<Item = &AxVCpu<A>> + '_ {
        self.vcpus.iter()
    }

    /// The number of vCPUs in the VM.
    pub fn len(&self) -> usize {
        self.vcpus.len()
    }

    /// Whether the VM has no vCPUs.
    pub fn is_empty(&self) -> bool {
        self.vcpus.is_empty()
    }

    /// Tears down a vCPU.
    ///
    /// Captures costly registers one final time, then resets the host
    /// wall-clock state of every dependent vCPU (those whose parent handle
    /// names the one being destroyed) before the record is dropped.
    pub fn destroy<H: AxVCpuHal>(&mut self, id: VCpuId) -> AxResult {
        let index = match self.vcpus.iter().position(|v| v.id() == id) {
            Some(index) => index,
            None => return ax_err!(NotFound, format!("vcpu id {} not registered", id)),
        };
        let vcpu = self.vcpus.remove(index);
        vcpu.world_switch_out()?;
        for dependent in self.vcpus.iter().filter(|v| v.parent() == Some(id)) {
            H::reset_host_wallclock(dependent.id())?;
        }
        debug!("vcpu {} destroyed", id);
        Ok(())
    }
}

impl<A: AxArchVCpu> Default for AxVmVCpus<A> {
    fn default() -> Self {
        Self::new()
    }
}
