//! Run-loop return code encoding.
//!
//! The hardware "run vCPU" primitive reports why control returned to the host
//! through a single hypercall-encoded value: the low nibble selects an opcode
//! and the remaining high bits carry an opcode-specific argument, so
//! `raw = (argument << 4) | opcode`. A distinguished sentinel outside the
//! nibble scheme marks a vCPU waiting on an external resource.

/// Distinguished "suspend" sentinel.
///
/// Not producible by the `(argument << 4) | opcode` scheme with an assigned
/// opcode; it means the vCPU is waiting for an external resource and should be
/// retried after a short interval rather than treated as an error.
pub const RUN_CODE_SUSPEND: u64 = u64::MAX;

const OPCODE_MASK: u64 = 0xf;
const ARG_SHIFT: u32 = 4;

const OP_CONTINUE: u64 = 0;
const OP_YIELD: u64 = 1;
const OP_SET_WALLCLOCK: u64 = 2;
const OP_HLT: u64 = 3;
const OP_FAULT: u64 = 4;

/// The decoded result of one invocation of the hardware run primitive.
///
/// Produced by the hypervisor, consumed once per run-loop iteration, never
/// persisted.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    /// Nothing to do; re-enter the guest immediately.
    Continue,
    /// The guest halted with interrupts enabled and timer ticks remaining;
    /// the host thread should sleep for `nanos` nanoseconds (or yield its
    /// quantum when `nanos == 0`) before re-entering.
    Yield {
        /// Nanoseconds until the vCPU has something to do.
        nanos: u64,
    },
    /// The guest requested host wall-clock synchronization.
    SetWallclock,
    /// The vCPU halted; stop driving its run loop.
    Halt,
    /// The vCPU faulted; terminal for this run loop.
    Fault {
        /// The opcode-specific error code.
        code: u64,
    },
    /// The vCPU is waiting for an external resource; retry after a quantum.
    Suspend,
    /// An unrecognized return code; treated as fatal.
    Unknown {
        /// The raw value as returned by the run primitive.
        raw: u64,
    },
}

impl RunExit {
    /// Decodes a raw run code as returned by [`AxArchVCpu::run`].
    ///
    /// [`AxArchVCpu::run`]: crate::AxArchVCpu::run
    pub fn decode(raw: u64) -> Self {
        if raw == RUN_CODE_SUSPEND {
            return Self::Suspend;
        }
        let arg = raw >> ARG_SHIFT;
        match raw & OPCODE_MASK {
            OP_CONTINUE => Self::Continue,
            OP_YIELD => Self::Yield { nanos: arg },
            OP_SET_WALLCLOCK => Self::SetWallclock,
            OP_HLT => Self::Halt,
            OP_FAULT => Self::Fault { code: arg },
            _ => Self::Unknown { raw },
        }
    }

    /// Encodes this exit back into the raw wire value.
    ///
    /// This is the encoding the VMM side uses to report a fault:
    /// `(error_code << 4) | fault_opcode`.
    pub fn encode(&self) -> u64 {
        match *self {
            Self::Continue => OP_CONTINUE,
            Self::Yield { nanos } => (nanos << ARG_SHIFT) | OP_YIELD,
            Self::SetWallclock => OP_SET_WALLCLOCK,
            Self::Halt => OP_HLT,
            Self::Fault { code } => (code << ARG_SHIFT) | OP_FAULT,
            Self::Suspend => RUN_CODE_SUSPEND,
            Self::Unknown { raw } => raw,
        }
    }

    /// Whether this exit terminates the run loop.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Halt | Self::Fault { .. } | Self::Unknown { .. })
    }
}
