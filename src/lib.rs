#![doc = r#"
Deterministic, tick-driven simulator of a small multi-core OS kernel.

Synthetic user programs execute against simulated CPUs and I/O devices
while the kernel chooses which process runs on each core under a selectable
scheduling policy. Everything advances in a fixed, reproducible order, one
tick at a time, driven by a host that owns the cadence.

Modules:
- isa: opcode semantics, register file, condition flags, instruction encoding
- cpu: per-tick instruction execution and syscall raising
- device: I/O device state machine and completion interrupts
- process: PCBs, the program catalog, real-time job descriptors
- memory: arena of opaque user buffers behind ALLOC/FREE/SW
- ready: the six policy-specific ready containers
- error: user-facing and internal error kinds
- kernel: the kernel value, tick loop, step actions, scheduler, snapshot

In tests, shared program builders are available under `crate::test_utils`.
"#]

pub mod cpu;
pub mod device;
pub mod error;
pub mod isa;
pub mod kernel;
pub mod memory;
pub mod process;
pub mod ready;

// Re-export the surface most hosts need at the crate root.
pub use cpu::Syscall;
pub use device::{Interrupt, IoRequest};
pub use error::SimError;
pub use isa::{Instruction, Opcode, Reg, Registers};
pub use kernel::{Kernel, Snapshot, StepAction};
pub use process::{Pcb, Pid, State};
pub use ready::{NUM_LEVELS, Strategy};

// Shared test utilities (only compiled for tests)
#[cfg(test)]
pub mod test_utils;
