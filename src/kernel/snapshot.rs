/*!
Read-only snapshot projection of machine and OS state.

External consumers (a UI layer, the benchmark binary) periodically project
the kernel into plain serializable data. Building a snapshot never mutates
live structures: queue views are copied, and heap pop order is derived from
a clone, so two consecutive snapshots with no tick in between are equal in
every field.
*/

use serde::Serialize;

use crate::cpu::Syscall;
use crate::device::{Interrupt, IoRequest};
use crate::isa::Registers;
use crate::kernel::{Kernel, StepAction};
use crate::process::{Pcb, Pid};
use crate::ready::{NUM_LEVELS, Strategy};

/// One simulated core: availability, registers, and this tick's bookkeeping.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CoreSnapshot {
    pub available: bool,
    pub regs: Registers,
    pub running: Option<Pid>,
    pub step_action: StepAction,
    pub pending_syscall: Syscall,
}

/// One I/O device: `(pid, duration, progress)`, all zero when idle.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DeviceSnapshot {
    pub pid: Pid,
    pub duration: u64,
    pub progress: u64,
}

/// Full machine + OS projection at one tick boundary.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Snapshot {
    pub time: u64,
    pub paused: bool,
    pub strategy: Strategy,
    pub clock_delay_ms: u64,
    pub cores: Vec<CoreSnapshot>,
    pub devices: Vec<DeviceSnapshot>,
    /// Every PCB ever admitted, in PID order (DONE/DEAD included).
    pub processes: Vec<Pcb>,
    pub interrupts: Vec<Interrupt>,
    pub pending_requests: Vec<IoRequest>,
    /// Active ready structure in the order `pop` would drain it.
    pub ready: Vec<Pid>,
    pub reentry: Vec<Pid>,
    /// Per-level ready lists; present only under MLF.
    pub mlf_levels: Option<[Vec<Pid>; NUM_LEVELS]>,
}

impl Kernel {
    /// Project the current state. Pure: does not disturb the simulation.
    pub fn snapshot(&self) -> Snapshot {
        let cores = self
            .cores
            .iter()
            .enumerate()
            .map(|(i, cpu)| CoreSnapshot {
                available: cpu.free(),
                regs: cpu.regstate(),
                running: self.running[i],
                step_action: self.step_actions[i],
                pending_syscall: self.pending_syscalls[i],
            })
            .collect();

        let devices = self
            .devices
            .iter()
            .map(|dev| {
                let (pid, duration, progress) = dev.status();
                DeviceSnapshot {
                    pid,
                    duration,
                    progress,
                }
            })
            .collect();

        Snapshot {
            time: self.time,
            paused: self.paused,
            strategy: self.strategy,
            clock_delay_ms: self.clock_delay_ms,
            cores,
            devices,
            processes: self.procs.values().cloned().collect(),
            interrupts: self.interrupts.iter().copied().collect(),
            pending_requests: self.pending_requests.iter().copied().collect(),
            ready: self.ready.iter_snapshot(),
            reentry: self.reentry.clone(),
            mlf_levels: self.ready.mlf_snapshot(),
        }
    }
}
