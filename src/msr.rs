//! MSR classification, caching and the world-switch save/restore protocol.
//!
//! Hardware imposes four different virtualization strategies on trapped MSRs:
//!
//! - **Pass-through**: the VMCS saves and restores the register on every
//!   transition; no software involvement.
//! - **Isolated**: no hardware save/restore field exists, so the engine keeps
//!   the last written value in a per-vCPU cache and restores it on every
//!   world switch into the vCPU.
//! - **Costly**: like isolated, but the instruction that modifies the
//!   register (`swapgs` for `IA32_KERNEL_GS_BASE`) does not trap, so the only
//!   correct capture point is every VM exit.
//! - **Emulated**: no real backing register for the guest; reads and writes
//!   operate purely on the cache or synthesize a fault.
//!
//! The classification table is fixed and versioned, built once per vCPU from
//! the probed CPU feature set, and iterated uniformly: there is one generic
//! dispatcher rather than per-address handler functions.

use alloc::collections::BTreeMap;
use alloc::string::String;

use axerrno::AxResult;

use crate::arch_vcpu::AxArchVCpu;
use crate::cpuid::CpuFeatures;
use crate::time::IA32_PLATFORM_INFO;

pub const MSR_SMI_COUNT: u32 = 0x34;
pub const IA32_FEATURE_CONTROL: u32 = 0x3a;
pub const MSR_MISC_FEATURES_ENABLES: u32 = 0x140;
pub const IA32_MISC_ENABLE: u32 = 0x1a0;
pub const MSR_RAPL_POWER_UNIT: u32 = 0x606;
pub const MSR_PPERF: u32 = 0x64e;
pub const IA32_RTIT_CTL: u32 = 0x570;
pub const IA32_RTIT_STATUS: u32 = 0x571;
pub const IA32_RTIT_CR3_MATCH: u32 = 0x572;
pub const IA32_XSS: u32 = 0xda0;
pub const IA32_STAR: u32 = 0xc000_0081;
pub const IA32_LSTAR: u32 = 0xc000_0082;
pub const IA32_CSTAR: u32 = 0xc000_0083;
pub const IA32_FMASK: u32 = 0xc000_0084;
pub const IA32_KERNEL_GS_BASE: u32 = 0xc000_0102;
pub const IA32_TSC_AUX: u32 = 0xc000_0103;

/// `IA32_FEATURE_CONTROL` with only the lock bit set.
const FEATURE_CONTROL_LOCKED: u64 = 1;
/// Guest-visible bits of `IA32_PLATFORM_INFO` (the non-turbo ratio field).
const PLATFORM_INFO_MASK: u64 = 0xff00;
/// Guest-visible bits of `IA32_MISC_ENABLE` (fast strings, enhanced
/// SpeedStep).
const MISC_ENABLE_MASK: u64 = 0x1801;

/// Read behavior of an emulated MSR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmulatedRead {
    /// Always return this value.
    Constant(u64),
    /// Return the hardware value masked to these bits.
    HardwareMasked(u64),
    /// Return the low 32 bits of the cached value.
    Cached32,
    /// Inject `#GP` into the guest without retiring the instruction.
    InjectGp,
}

/// Write behavior of an emulated MSR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmulatedWrite {
    /// Guest writes are unsupported; halt the vCPU with a diagnostic.
    Fault,
    /// Store the low 32 bits of the written value into the cache.
    CacheLow32,
    /// Inject `#GP` into the guest without retiring the instruction.
    InjectGp,
}

/// The virtualization strategy for one MSR address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsrPolicy {
    /// Hardware saves and restores the register automatically.
    PassThrough,
    /// Lazily saved/restored through the cache on every world switch.
    Isolated,
    /// Isolated, and additionally captured from hardware on every VM exit.
    Costly,
    /// No real backing register; behavior is defined by the variants.
    Emulated {
        /// How guest reads are served.
        read: EmulatedRead,
        /// How guest writes are served.
        write: EmulatedWrite,
    },
}

impl MsrPolicy {
    fn needs_restore(&self) -> bool {
        matches!(self, Self::Isolated | Self::Costly)
    }
}

/// The outcome of one trapped MSR access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MsrReply {
    /// Not covered by this engine; let other exit handlers run.
    NotHandled,
    /// A read was served with this value; retire the instruction.
    Read(u64),
    /// A write was absorbed; retire the instruction.
    Written,
    /// `#GP` was injected; do not retire the instruction.
    InjectGp,
    /// Guest policy violation; halt the vCPU with this diagnostic.
    Halt(String),
}

/// Per-vCPU MSR policy engine.
///
/// Owned exclusively by the vCPU object and only ever touched by the host
/// thread bound to it.
pub struct MsrEngine {
    table: BTreeMap<u32, MsrPolicy>,
    cache: BTreeMap<u32, u64>,
}

fn build_table(features: &CpuFeatures) -> BTreeMap<u32, MsrPolicy> {
    use EmulatedRead as R;
    use EmulatedWrite as W;

    let mut table = BTreeMap::new();
    let mut emulate = |addr: u32, read: R, write: W| {
        table.insert(addr, MsrPolicy::Emulated { read, write });
    };

    emulate(MSR_SMI_COUNT, R::Constant(0), W::Fault);
    emulate(IA32_FEATURE_CONTROL, R::Constant(FEATURE_CONTROL_LOCKED), W::Fault);
    emulate(IA32_PLATFORM_INFO, R::HardwareMasked(PLATFORM_INFO_MASK), W::Fault);
    emulate(MSR_MISC_FEATURES_ENABLES, R::InjectGp, W::Fault);
    emulate(IA32_MISC_ENABLE, R::HardwareMasked(MISC_ENABLE_MASK), W::Fault);
    emulate(MSR_RAPL_POWER_UNIT, R::InjectGp, W::Fault);
    emulate(MSR_PPERF, R::Constant(0), W::Fault);
    if features.rdtscp {
        emulate(IA32_TSC_AUX, R::Cached32, W::CacheLow32);
    }
    if features.intel_pt {
        for addr in IA32_RTIT_CTL..=IA32_RTIT_CR3_MATCH {
            emulate(addr, R::InjectGp, W::InjectGp);
        }
    }

    for addr in [IA32_STAR, IA32_LSTAR, IA32_CSTAR, IA32_FMASK] {
        table.insert(addr, MsrPolicy::Isolated);
    }
    if features.xsaves {
        table.insert(IA32_XSS, MsrPolicy::Isolated);
    }
    table.insert(IA32_KERNEL_GS_BASE, MsrPolicy::Costly);

    table
}

impl MsrEngine {
    /// Builds the policy table for the probed feature set and seeds the cache.
    ///
    /// A root (dom0-style privileged) context inherits the current hardware
    /// values for isolated/costly registers so the OS it hosts keeps running
    /// on its own state; guest contexts start from zero.
    pub fn new<A: AxArchVCpu>(
        arch: &mut A,
        is_root: bool,
        features: &CpuFeatures,
    ) -> AxResult<Self> {
        let table = build_table(features);
        let mut cache = BTreeMap::new();
        for (&addr, policy) in &table {
            if policy.needs_restore() {
                let seed = if is_root { arch.read_msr(addr)? } else { 0 };
                cache.insert(addr, seed);
            }
        }
        Ok(Self { table, cache })
    }

    /// Returns the classification for an address, if this engine covers it.
    pub fn policy(&self, addr: u32) -> MsrPolicy {
        self.table.get(&addr).copied().unwrap_or(MsrPolicy::PassThrough)
    }

    /// Returns the cached value for an address, if one is kept.
    pub fn cached(&self, addr: u32) -> Option<u64> {
        self.cache.get(&addr).copied()
    }

    /// Restores every isolated/costly register from the cache into hardware.
    ///
    /// Runs unconditionally on entry into this vCPU's execution context,
    /// before any guest instruction of the next slice can observe the
    /// registers; O(number of cached entries) regardless of guest activity.
    pub fn world_switch_in<A: AxArchVCpu>(&self, arch: &mut A) -> AxResult {
        for (&addr, &value) in &self.cache {
            if self.table[&addr].needs_restore() {
                arch.write_msr(addr, value)?;
            }
        }
        Ok(())
    }

    /// Captures every costly register from hardware into the cache.
    ///
    /// Runs unconditionally on every VM exit: the instruction that modifies
    /// these registers does not trap, so this is the only correct capture
    /// point. Always reports "not handled" so further exit processing runs.
    pub fn world_switch_out<A: AxArchVCpu>(&mut self, arch: &mut A) -> AxResult<bool> {
        for (&addr, policy) in &self.table {
            if matches!(policy, MsrPolicy::Costly) {
                self.cache.insert(addr, arch.read_msr(addr)?);
            }
        }
        Ok(false)
    }

    /// Serves a trapped `rdmsr`.
    ///
    /// Isolated and costly reads are pass-through by construction (the
    /// world-switch protocol keeps hardware current), so only emulated
    /// addresses are handled here.
    pub fn handle_rdmsr<A: AxArchVCpu>(&mut self, arch: &mut A, addr: u32) -> AxResult<MsrReply> {
        let read = match self.policy(addr) {
            MsrPolicy::Emulated { read, .. } => read,
            _ => return Ok(MsrReply::NotHandled),
        };
        Ok(match read {
            EmulatedRead::Constant(value) => MsrReply::Read(value),
            EmulatedRead::HardwareMasked(mask) => MsrReply::Read(arch.read_msr(addr)? & mask),
            EmulatedRead::Cached32 => {
                MsrReply::Read(self.cached(addr).unwrap_or(0) & 0xffff_ffff)
            }
            EmulatedRead::InjectGp => {
                arch.inject_gp()?;
                MsrReply::InjectGp
            }
        })
    }

    /// Serves a trapped `wrmsr`.
    ///
    /// Isolated/costly writes store the value verbatim into the cache, 1:1
    /// with the guest's write. Writes to fixed emulated registers halt the
    /// vCPU: masking incorrect guest behavior would be worse than stopping it.
    pub fn handle_wrmsr<A: AxArchVCpu>(
        &mut self,
        arch: &mut A,
        addr: u32,
        value: u64,
    ) -> AxResult<MsrReply> {
        let write = match self.policy(addr) {
            MsrPolicy::Isolated | MsrPolicy::Costly => {
                self.cache.insert(addr, value);
                return Ok(MsrReply::Written);
            }
            MsrPolicy::Emulated { write, .. } => write,
            MsrPolicy::PassThrough => return Ok(MsrReply::NotHandled),
        };
        Ok(match write {
            EmulatedWrite::CacheLow32 => {
                self.cache.insert(addr, value & 0xffff_ffff);
                MsrReply::Written
            }
            EmulatedWrite::InjectGp => {
                arch.inject_gp()?;
                MsrReply::InjectGp
            }
            EmulatedWrite::Fault => {
                let reason = format!(
                    "unsupported guest write to MSR {:#x} (value {:#x})",
                    addr, value
                );
                warn!("{}", reason);
                MsrReply::Halt(reason)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch_vcpu::AxArchVCpu;
    use crate::test::tests::MockArchVCpu;

    fn engine(is_root: bool) -> (MsrEngine, MockArchVCpu) {
        let mut arch = MockArchVCpu::new(Default::default()).unwrap();
        let features = CpuFeatures::probe(&mut arch);
        let engine = MsrEngine::new(&mut arch, is_root, &features).unwrap();
        (engine, arch)
    }

    #[test]
    fn test_classification_is_unique_and_complete() {
        let (engine, _) = engine(false);
        for addr in [IA32_STAR, IA32_LSTAR, IA32_CSTAR, IA32_FMASK, IA32_XSS] {
            assert_eq!(engine.policy(addr), MsrPolicy::Isolated);
        }
        assert_eq!(engine.policy(IA32_KERNEL_GS_BASE), MsrPolicy::Costly);
        assert!(matches!(
            engine.policy(MSR_SMI_COUNT),
            MsrPolicy::Emulated { .. }
        ));
        // Unlisted addresses stay with hardware.
        assert_eq!(engine.policy(0x10), MsrPolicy::PassThrough);
    }

    #[test]
    fn test_guest_cache_seeds_zero() {
        let (engine, _) = engine(false);
        assert_eq!(engine.cached(IA32_LSTAR), Some(0));
        assert_eq!(engine.cached(IA32_KERNEL_GS_BASE), Some(0));
    }

    #[test]
    fn test_root_cache_seeds_hardware_values() {
        let (engine, mut arch) = engine(true);
        let hw = arch.read_msr(IA32_LSTAR).unwrap();
        assert_ne!(hw, 0);
        assert_eq!(engine.cached(IA32_LSTAR), Some(hw));
    }

    #[test]
    fn test_isolated_write_read_round_trip() {
        let (mut engine, mut arch) = engine(false);
        for (i, addr) in [IA32_STAR, IA32_LSTAR, IA32_CSTAR, IA32_FMASK, IA32_XSS]
            .into_iter()
            .enumerate()
        {
            let value = 0x1111_0000_0000_0000 + i as u64;
            assert_eq!(
                engine.handle_wrmsr(&mut arch, addr, value).unwrap(),
                MsrReply::Written
            );
            // The read path is pass-through; the restore protocol makes the
            // hardware register current before the guest can read it.
            assert_eq!(
                engine.handle_rdmsr(&mut arch, addr).unwrap(),
                MsrReply::NotHandled
            );
            engine.world_switch_in(&mut arch).unwrap();
            assert_eq!(arch.read_msr(addr).unwrap(), value);
        }
    }

    #[test]
    fn test_world_switch_in_restores_all_entries() {
        let (mut engine, mut arch) = engine(false);
        engine.handle_wrmsr(&mut arch, IA32_LSTAR, 0xaaaa).unwrap();
        // Clobber hardware, as another vCPU's slice would.
        arch.write_msr(IA32_LSTAR, 0xdead).unwrap();
        arch.write_msr(IA32_STAR, 0xbeef).unwrap();
        engine.world_switch_in(&mut arch).unwrap();
        assert_eq!(arch.read_msr(IA32_LSTAR).unwrap(), 0xaaaa);
        // Never-written isolated entries restore their seed value.
        assert_eq!(arch.read_msr(IA32_STAR).unwrap(), 0);
    }

    #[test]
    fn test_costly_capture_and_idempotence() {
        let (mut engine, mut arch) = engine(false);
        // swapgs does not trap; model it as a direct hardware change.
        arch.write_msr(IA32_KERNEL_GS_BASE, 0x5151).unwrap();
        assert!(!engine.world_switch_out(&mut arch).unwrap());
        assert_eq!(engine.cached(IA32_KERNEL_GS_BASE), Some(0x5151));
        // A second capture with no hardware change is a no-op.
        assert!(!engine.world_switch_out(&mut arch).unwrap());
        assert_eq!(engine.cached(IA32_KERNEL_GS_BASE), Some(0x5151));
    }

    #[test]
    fn test_emulated_constant_reads() {
        let (mut engine, mut arch) = engine(false);
        assert_eq!(
            engine.handle_rdmsr(&mut arch, MSR_SMI_COUNT).unwrap(),
            MsrReply::Read(0)
        );
        assert_eq!(
            engine.handle_rdmsr(&mut arch, IA32_FEATURE_CONTROL).unwrap(),
            MsrReply::Read(FEATURE_CONTROL_LOCKED)
        );
        assert_eq!(
            engine.handle_rdmsr(&mut arch, MSR_PPERF).unwrap(),
            MsrReply::Read(0)
        );
    }

    #[test]
    fn test_emulated_masked_reads() {
        let (mut engine, mut arch) = engine(false);
        let platform = arch.read_msr(IA32_PLATFORM_INFO).unwrap();
        assert_eq!(
            engine.handle_rdmsr(&mut arch, IA32_PLATFORM_INFO).unwrap(),
            MsrReply::Read(platform & PLATFORM_INFO_MASK)
        );
        let misc = arch.read_msr(IA32_MISC_ENABLE).unwrap();
        assert_eq!(
            engine.handle_rdmsr(&mut arch, IA32_MISC_ENABLE).unwrap(),
            MsrReply::Read(misc & MISC_ENABLE_MASK)
        );
    }

    #[test]
    fn test_emulated_gp_injection() {
        let (mut engine, mut arch) = engine(false);
        for addr in [MSR_MISC_FEATURES_ENABLES, MSR_RAPL_POWER_UNIT, IA32_RTIT_CTL] {
            assert_eq!(
                engine.handle_rdmsr(&mut arch, addr).unwrap(),
                MsrReply::InjectGp
            );
        }
        assert_eq!(
            engine.handle_wrmsr(&mut arch, IA32_RTIT_STATUS, 1).unwrap(),
            MsrReply::InjectGp
        );
        assert_eq!(arch.injected_gp_count(), 4);
    }

    #[test]
    fn test_tsc_aux_caches_low_32_bits() {
        let (mut engine, mut arch) = engine(false);
        assert_eq!(
            engine
                .handle_wrmsr(&mut arch, IA32_TSC_AUX, 0xffff_ffff_0000_0007)
                .unwrap(),
            MsrReply::Written
        );
        assert_eq!(
            engine.handle_rdmsr(&mut arch, IA32_TSC_AUX).unwrap(),
            MsrReply::Read(7)
        );
    }

    #[test]
    fn test_fixed_register_write_halts() {
        let (mut engine, mut arch) = engine(false);
        match engine.handle_wrmsr(&mut arch, MSR_SMI_COUNT, 1).unwrap() {
            MsrReply::Halt(reason) => assert!(reason.contains("0x34")),
            other => panic!("expected Halt, got {:?}", other),
        }
    }

    #[test]
    fn test_feature_gated_entries_absent_without_features() {
        let mut arch = MockArchVCpu::new(Default::default()).unwrap();
        let mut features = CpuFeatures::probe(&mut arch);
        features.rdtscp = false;
        features.xsaves = false;
        features.intel_pt = false;
        let engine = MsrEngine::new(&mut arch, false, &features).unwrap();
        assert_eq!(engine.policy(IA32_TSC_AUX), MsrPolicy::PassThrough);
        assert_eq!(engine.policy(IA32_XSS), MsrPolicy::PassThrough);
        assert_eq!(engine.policy(IA32_RTIT_CTL), MsrPolicy::PassThrough);
    }

    #[test]
    fn test_passthrough_not_handled() {
        let (mut engine, mut arch) = engine(false);
        assert_eq!(
            engine.handle_rdmsr(&mut arch, 0x10).unwrap(),
            MsrReply::NotHandled
        );
        assert_eq!(
            engine.handle_wrmsr(&mut arch, 0x10, 1).unwrap(),
            MsrReply::NotHandled
        );
    }
}
