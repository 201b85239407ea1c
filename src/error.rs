/*!
Error kinds for the simulator.

Two families:
- User-facing failures (`UnknownProgram`, `ZeroPeriod`, `DeviceBusy`) returned
  from the programmatic surface; the host can recover from these.
- `Internal`, raised when a kernel invariant is violated mid-tick (handling a
  nonexistent interrupt, running a nonexistent process, servicing a request
  with no idle device, a bad fetch or register index, a memory fault). These
  abort the tick deterministically; the simulator is deterministic, so
  reproducing one only requires replaying the same workload.
*/

use thiserror::Error;

use crate::process::Pid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SimError {
    /// `spawn`/`dispatch` referenced a program name that was never registered.
    #[error("unknown program `{0}`")]
    UnknownProgram(String),

    /// A real-time job was dispatched with a period of zero ticks.
    #[error("real-time job `{0}` dispatched with zero period")]
    ZeroPeriod(String),

    /// An I/O device was handed a request while still processing another.
    #[error("I/O device {device} asked to handle request from process {pid} while busy")]
    DeviceBusy { device: u8, pid: Pid },

    /// A kernel invariant was violated on the given core.
    #[error("core {core}: {cause}")]
    Internal { core: u8, cause: String },
}

impl SimError {
    /// Shorthand used on the tick path when an invariant breaks.
    pub fn internal(core: u8, cause: impl Into<String>) -> Self {
        SimError::Internal {
            core,
            cause: cause.into(),
        }
    }
}
