//! CPUID interception and virtualization.
//!
//! Two execution contexts share this module. The privileged (root) context
//! gets a thin pass-through emulator with an in-band command channel encoded
//! over reserved CPUID leaves. Guest contexts get a precomputed per-vCPU leaf
//! table that can only ever be narrowed after construction.

use alloc::collections::BTreeMap;

use axerrno::{ax_err, AxResult};

use crate::arch_vcpu::AxArchVCpu;

/// The register quadruple produced by one CPUID execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuidResult {
    /// Value of the `eax` register.
    pub eax: u32,
    /// Value of the `ebx` register.
    pub ebx: u32,
    /// Value of the `ecx` register.
    pub ecx: u32,
    /// Value of the `edx` register.
    pub edx: u32,
}

/// Vendor-neutral reserved base for hypervisor-defined leaves.
pub const CPUID_HV_BASE: u32 = 0x4000_0000;

/// Reserved signature leaf carrying the root-context command channel.
pub const CPUID_COMMAND_LEAF: u32 = 0x4000_00f0;

/// Command: promote this context, handing control to the real OS.
pub const CPUID_CMD_STOP: u32 = 0;
/// Command: acknowledge a demote notification.
pub const CPUID_CMD_REPORT_ON: u32 = 1;
/// Command: acknowledge a promote notification.
pub const CPUID_CMD_REPORT_OFF: u32 = 2;

/// Success sentinel returned in `eax` by the command channel. Failures are
/// reported as `AxError` returns, never as a sentinel value.
pub const CPUID_CMD_SUCCESS: u32 = 0;

/// Hypervisor-present bit in `ecx` of the feature leaf (`eax == 1`).
const HYPERVISOR_PRESENT: u32 = 1 << 31;

const FEATURE_LEAF: u32 = 1;

/// The outcome of an intercepted CPUID execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuidReply {
    /// The leaf was served; return these values to the caller.
    Value(CpuidResult),
    /// The caller should promote this context: hand control to the real OS.
    ///
    /// Terminal transition out of emulation for this context.
    Promote,
}

/// Handles a CPUID interception for the privileged (root) execution context.
///
/// Command leaves dispatch on `ecx`; everything else executes the real CPUID
/// instruction, with the hypervisor-present bit forced on in the feature leaf
/// so the host OS can tell it runs virtualized.
pub fn handle_root_cpuid<A: AxArchVCpu>(arch: &mut A, eax: u32, ecx: u32) -> AxResult<CpuidReply> {
    if eax == CPUID_COMMAND_LEAF {
        return match ecx {
            CPUID_CMD_STOP => {
                debug!("cpuid command channel: stop, promoting root context");
                Ok(CpuidReply::Promote)
            }
            CPUID_CMD_REPORT_ON | CPUID_CMD_REPORT_OFF => Ok(CpuidReply::Value(CpuidResult {
                eax: CPUID_CMD_SUCCESS,
                ..CpuidResult::default()
            })),
            cmd => ax_err!(
                InvalidInput,
                format!("cpuid command channel: unknown command {:#x}", cmd)
            ),
        };
    }
    let mut result = arch.cpuid(eax, ecx);
    if eax == FEATURE_LEAF {
        result.ecx |= HYPERVISOR_PRESENT;
    }
    Ok(CpuidReply::Value(result))
}

/// Processor capabilities this core depends on, probed once at vCPU
/// construction.
#[derive(Debug, Clone, Copy)]
pub struct CpuFeatures {
    /// Time-stamp counter (leaf 1, `edx` bit 4).
    pub tsc: bool,
    /// Invariant TSC (leaf 0x8000_0007, `edx` bit 8).
    pub invariant_tsc: bool,
    /// RDTSCP and `IA32_TSC_AUX` (leaf 0x8000_0001, `edx` bit 27).
    pub rdtscp: bool,
    /// XSAVES and `IA32_XSS` (leaf 0xd subleaf 1, `eax` bit 3).
    pub xsaves: bool,
    /// Intel Processor Trace (leaf 7, `ebx` bit 25).
    pub intel_pt: bool,
    /// Display family, with the extended-family adjustment applied.
    pub display_family: u32,
    /// Display model, with the extended-model adjustment applied.
    pub display_model: u32,
}

impl CpuFeatures {
    /// Probes the feature set through the architecture seam.
    pub fn probe<A: AxArchVCpu>(arch: &mut A) -> Self {
        let max_basic = arch.cpuid(0, 0).eax;
        let max_ext = arch.cpuid(0x8000_0000, 0).eax;

        let leaf1 = arch.cpuid(FEATURE_LEAF, 0);
        let tsc = leaf1.edx & (1 << 4) != 0;
        let intel_pt = max_basic >= 7 && arch.cpuid(7, 0).ebx & (1 << 25) != 0;
        let xsaves = max_basic >= 0xd && arch.cpuid(0xd, 1).eax & (1 << 3) != 0;
        let rdtscp = max_ext >= 0x8000_0001 && arch.cpuid(0x8000_0001, 0).edx & (1 << 27) != 0;
        let invariant_tsc =
            max_ext >= 0x8000_0007 && arch.cpuid(0x8000_0007, 0).edx & (1 << 8) != 0;

        let family = (leaf1.eax >> 8) & 0xf;
        let model = (leaf1.eax >> 4) & 0xf;
        let ext_family = (leaf1.eax >> 20) & 0xff;
        let ext_model = (leaf1.eax >> 16) & 0xf;
        let display_family = if family == 0xf { family + ext_family } else { family };
        let display_model = if family == 0x6 || family == 0xf {
            (ext_model << 4) + model
        } else {
            model
        };

        Self {
            tsc,
            invariant_tsc,
            rdtscp,
            xsaves,
            intel_pt,
            display_family,
            display_model,
        }
    }
}

/// Basic leaves permitted to pass through to guests.
const MAX_PASSTHROUGH_BASIC: u32 = 0xd;
/// Extended leaves permitted to pass through to guests.
const MAX_PASSTHROUGH_EXT: u32 = 0x8000_0008;
/// Subleaf enumeration bound for subleaf-indexed basic leaves.
const MAX_SUBLEAVES: u32 = 8;

/// 12-byte hypervisor vendor signature reported in the reserved leaf range.
const HV_SIGNATURE: &[u8; 12] = b"axvcoreaxvc\0";

/// Per-vCPU guest-visible CPUID leaf table.
///
/// Built once at construction as the intersection of hardware-supported leaves
/// and the hypervisor's pass-through allowance, plus the emulated hypervisor
/// signature leaves. Afterwards the table obeys a monotonic narrowing
/// contract: capability bits can be cleared, never set.
pub struct GuestCpuidTable {
    leaves: BTreeMap<(u32, u32), CpuidResult>,
}

fn has_subleaves(leaf: u32) -> bool {
    matches!(leaf, 0x4 | 0x7 | 0xb | 0xd)
}

impl GuestCpuidTable {
    /// Builds the table from the hardware leaf set.
    pub fn build<A: AxArchVCpu>(arch: &mut A) -> Self {
        let mut leaves = BTreeMap::new();

        let max_basic = arch.cpuid(0, 0).eax.min(MAX_PASSTHROUGH_BASIC);
        for leaf in 0..=max_basic {
            let subleaves = if has_subleaves(leaf) { MAX_SUBLEAVES } else { 1 };
            for subleaf in 0..subleaves {
                let mut result = arch.cpuid(leaf, subleaf);
                if leaf == FEATURE_LEAF {
                    result.ecx |= HYPERVISOR_PRESENT;
                }
                leaves.insert((leaf, subleaf), result);
            }
        }

        let max_ext = arch.cpuid(0x8000_0000, 0).eax.min(MAX_PASSTHROUGH_EXT);
        for leaf in 0x8000_0000..=max_ext {
            leaves.insert((leaf, 0), arch.cpuid(leaf, 0));
        }

        let sig = |i: usize| {
            u32::from_le_bytes([
                HV_SIGNATURE[i],
                HV_SIGNATURE[i + 1],
                HV_SIGNATURE[i + 2],
                HV_SIGNATURE[i + 3],
            ])
        };
        leaves.insert(
            (CPUID_HV_BASE, 0),
            CpuidResult {
                eax: CPUID_COMMAND_LEAF,
                ebx: sig(0),
                ecx: sig(4),
                edx: sig(8),
            },
        );

        Self { leaves }
    }

    /// Looks up a leaf; absent leaves read as all-zero, matching hardware
    /// behavior for out-of-range CPUID.
    ///
    /// Hardware ignores `ecx` for leaves that are not subleaf-indexed, so the
    /// subleaf is normalized to 0 for those.
    pub fn lookup(&self, leaf: u32, subleaf: u32) -> CpuidResult {
        let subleaf = if has_subleaves(leaf) { subleaf } else { 0 };
        self.leaves.get(&(leaf, subleaf)).copied().unwrap_or_default()
    }

    /// Applies a "set emulated CPUID" request.
    ///
    /// Writes may only clear capability bits, never set them. The leaf must
    /// already exist; narrowing cannot invent leaves the hardware and policy
    /// did not expose.
    pub fn narrow(&mut self, leaf: u32, subleaf: u32, values: CpuidResult) -> AxResult {
        let current = match self.leaves.get_mut(&(leaf, subleaf)) {
            Some(current) => current,
            None => {
                return ax_err!(
                    NotFound,
                    format!("cpuid narrow: leaf {:#x}.{} not present", leaf, subleaf)
                )
            }
        };
        let widens = (values.eax & !current.eax)
            | (values.ebx & !current.ebx)
            | (values.ecx & !current.ecx)
            | (values.edx & !current.edx);
        if widens != 0 {
            return ax_err!(
                InvalidInput,
                format!(
                    "cpuid narrow: leaf {:#x}.{} would set bits {:#x}",
                    leaf, subleaf, widens
                )
            );
        }
        *current = values;
        Ok(())
    }
}
