// Copyright 2025 The Axvisor Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! AxVCore - Per-vCPU hardware-state virtualization core.
//!
//! This crate makes a guest's view of model-specific registers (MSRs), CPUID
//! leaves, and TSC/wall-clock time consistent while the real hardware state is
//! shared and only partially virtualizable. It delegates raw hardware access
//! to implementations of the [`AxArchVCpu`] trait and host services (sleeping,
//! wall-clock hypercalls) to implementations of the [`AxVCpuHal`] trait.
//!
//! # Features
//!
//! - Data-driven MSR virtualization: pass-through, isolated (lazy
//!   save/restore), emulated, and costly (captured on every VM exit) policies
//! - CPUID interception with hypervisor-presence reporting, a root-context
//!   command channel, and a monotonically narrowing guest leaf table
//! - TSC frequency derivation, preemption-timer unit conversion, and host
//!   wall-clock calibration against the TSC
//! - A state-machine-driven run loop decoding hypercall-encoded return codes
//!   (continue / yield / halt / fault / set-wallclock / suspend)

#![no_std]

#[macro_use]
extern crate alloc;

#[macro_use]
extern crate log;

// Core modules
mod arch_vcpu; // Architecture-specific vCPU trait definition
mod cpuid; // CPUID interception, feature probing, guest leaf tables
mod exit; // Run-loop return code encoding and decoding
mod hal; // Host service interfaces (sleep, wall-clock hypercalls)
mod msr; // MSR classification, caching and world-switch protocol
mod time; // TSC frequency, tick conversion, wall-clock calibration
mod vcpu; // Main vCPU implementation, state machine and run loop

// Public API exports
pub use arch_vcpu::AxArchVCpu;
pub use cpuid::{
    handle_root_cpuid, CpuFeatures, CpuidReply, CpuidResult, GuestCpuidTable,
    CPUID_CMD_REPORT_OFF, CPUID_CMD_REPORT_ON, CPUID_CMD_STOP, CPUID_CMD_SUCCESS,
    CPUID_COMMAND_LEAF, CPUID_HV_BASE,
};
pub use exit::{RunExit, RUN_CODE_SUSPEND};
pub use hal::AxVCpuHal;
pub use msr::{EmulatedRead, EmulatedWrite, MsrEngine, MsrPolicy, MsrReply};
pub use time::{
    calibrate_wallclock, preemption_timer_shift, ticks_to_microseconds, ticks_to_nanoseconds,
    tsc_frequency_khz, yield_nanos_for_timer_ticks, TimeSpec, WallclockSample,
};
pub use vcpu::{AxVCpu, AxVmVCpus, RunStop, VCpuConfig, VCpuId, VCpuState};
