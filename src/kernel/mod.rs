/*!
Kernel façade owning the simulated machine and all OS state.

The kernel is a single value the host holds and drives; there are no
globals. One `tick()` call advances the whole machine by one step of
simulated time (see `tick.rs` for the per-tick ordering), and every
mutable structure (process table, ready structure, interrupt queue,
pending I/O requests, reentry list, cores, devices) is owned here and
touched only during a tick or between ticks by the configuration surface.

Configuration operations may rebuild sub-structures:
- `set_scheduling_strategy` tears down the OS and re-inits it, preserving
  the program catalog; all processes are lost.
- `set_num_cores` / `set_num_io_devices` additionally recreate the machine
  with the new counts.

PCBs live in a BTreeMap keyed by PID; every other structure stores PIDs,
never references, so process teardown cannot dangle.
*/

mod snapshot;
mod tick;

#[cfg(test)]
mod tests;

pub use snapshot::{CoreSnapshot, DeviceSnapshot, Snapshot};

use std::collections::{BTreeMap, VecDeque};

use log::debug;
use serde::Serialize;

use crate::cpu::{Cpu, Syscall};
use crate::device::{Interrupt, IoDevice, IoRequest};
use crate::error::SimError;
use crate::isa::{Instruction, Registers};
use crate::memory::MemoryArena;
use crate::process::{Pcb, Pid, ProgramTable, RtJob, State};
use crate::ready::{ReadyQueue, Strategy};

/// Default milliseconds between ticks; the host owns the actual cadence.
const DEFAULT_CLOCK_DELAY_MS: u64 = 500;

/// What a core did (or will do) in the current tick.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepAction {
    #[default]
    Noop,
    HandleInterrupt,
    BeginRun,
    ContinueRun,
    HandleSyscall,
    ServiceRequest,
}

pub struct Kernel {
    // Machine
    pub(crate) cores: Vec<Cpu>,
    pub(crate) devices: Vec<IoDevice>,
    pub(crate) clock_delay_ms: u64,

    // Program catalog and user memory; both survive OS reboots only as
    // documented (programs yes, memory no).
    pub(crate) programs: ProgramTable,
    pub(crate) mem: MemoryArena,

    // OS state
    pub(crate) strategy: Strategy,
    pub(crate) procs: BTreeMap<Pid, Pcb>,
    pub(crate) ready: ReadyQueue,
    pub(crate) interrupts: VecDeque<Interrupt>,
    pub(crate) pending_requests: VecDeque<IoRequest>,
    pub(crate) reentry: Vec<Pid>,
    pub(crate) rt_jobs: Vec<RtJob>,
    pub(crate) running: Vec<Option<Pid>>,
    pub(crate) pending_syscalls: Vec<Syscall>,
    pub(crate) step_actions: Vec<StepAction>,
    pub(crate) time: u64,
    pub(crate) paused: bool,
    next_pid: Pid,
}

impl Kernel {
    pub fn new(num_cores: usize, num_devices: usize, strategy: Strategy) -> Self {
        let mut kernel = Self {
            cores: Vec::new(),
            devices: Vec::new(),
            clock_delay_ms: DEFAULT_CLOCK_DELAY_MS,
            programs: ProgramTable::new(),
            mem: MemoryArena::new(),
            strategy,
            procs: BTreeMap::new(),
            ready: ReadyQueue::new(strategy),
            interrupts: VecDeque::new(),
            pending_requests: VecDeque::new(),
            reentry: Vec::new(),
            rt_jobs: Vec::new(),
            running: Vec::new(),
            pending_syscalls: Vec::new(),
            step_actions: Vec::new(),
            time: 0,
            paused: false,
            next_pid: 0,
        };
        kernel.rebuild_machine(num_cores, num_devices);
        kernel.reboot_os(strategy);
        kernel
    }

    // -----------------------------
    // Program catalog and spawning
    // -----------------------------

    /// Register a program under `name`, overwriting any prior binding. The
    /// catalog copies the instructions; it outlives scheduler changes.
    pub fn load_program(&mut self, name: &str, instructions: &[Instruction]) {
        self.programs.load(name, instructions);
    }

    /// Look up a registered program.
    pub fn program(&self, name: &str) -> Option<&crate::process::Program> {
        self.programs.get(name)
    }

    /// Spawn a process running `name`, with no deadline.
    pub fn spawn(&mut self, name: &str) -> Result<Pid, SimError> {
        self.spawn_inner(name, None)
    }

    /// Spawn a process with absolute deadline `now + deadline_offset`.
    pub fn spawn_with_deadline(
        &mut self,
        name: &str,
        deadline_offset: u64,
    ) -> Result<Pid, SimError> {
        let deadline = self.time + deadline_offset;
        self.spawn_inner(name, Some(deadline))
    }

    /// Register a periodic real-time job. Does not itself spawn; the tick
    /// loop activates the job at every period boundary past `delay`.
    pub fn dispatch(
        &mut self,
        name: &str,
        period: u64,
        deadline_offset: u64,
        delay: u64,
    ) -> Result<(), SimError> {
        if !self.programs.contains(name) {
            return Err(SimError::UnknownProgram(name.to_string()));
        }
        if period == 0 {
            return Err(SimError::ZeroPeriod(name.to_string()));
        }
        self.rt_jobs.push(RtJob {
            program: name.to_string(),
            period,
            deadline_offset,
            delay,
        });
        Ok(())
    }

    pub(crate) fn spawn_inner(&mut self, name: &str, deadline: Option<u64>) -> Result<Pid, SimError> {
        let program = self
            .programs
            .get(name)
            .ok_or_else(|| SimError::UnknownProgram(name.to_string()))?;
        // The terminating EXIT does not count as required processor time.
        let req_processor_time = program.instructions.len().saturating_sub(1) as u64;
        let entry = self
            .programs
            .entry_point(name)
            .ok_or_else(|| SimError::UnknownProgram(name.to_string()))?;

        self.next_pid += 1;
        let pid = self.next_pid;

        let mut regs = Registers::default();
        regs.rip = entry;

        let pcb = Pcb {
            pid,
            name: name.to_string(),
            arrival_time: self.time,
            done_time: None,
            deadline,
            req_processor_time,
            processor_time: 0,
            level: 0,
            processor_time_on_level: 0,
            state: State::Ready,
            regs,
        };
        self.ready.push(&pcb);
        self.procs.insert(pid, pcb);

        debug!("t={}: spawned pid {pid} running `{name}`", self.time);
        Ok(pid)
    }

    // -----------------------------
    // Configuration surface
    // -----------------------------

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn unpause(&mut self) {
        self.paused = false;
    }

    /// Milliseconds the host should sleep between ticks.
    pub fn set_clock_delay(&mut self, millis: u64) {
        self.clock_delay_ms = millis;
    }

    /// Switch scheduling policy. Reboots the OS: every process is lost, the
    /// program catalog survives.
    pub fn set_scheduling_strategy(&mut self, strategy: Strategy) {
        self.reboot_os(strategy);
    }

    /// Resize the machine to `count` cores. Recreates the machine and
    /// reboots the OS.
    pub fn set_num_cores(&mut self, count: usize) {
        let devices = self.devices.len();
        self.rebuild_machine(count, devices);
        self.reboot_os(self.strategy);
    }

    /// Resize the machine to `count` I/O devices. Recreates the machine and
    /// reboots the OS.
    pub fn set_num_io_devices(&mut self, count: usize) {
        let cores = self.cores.len();
        self.rebuild_machine(cores, count);
        self.reboot_os(self.strategy);
    }

    fn rebuild_machine(&mut self, num_cores: usize, num_devices: usize) {
        self.cores = (0..num_cores).map(|i| Cpu::new(i as u8)).collect();
        self.devices = (0..num_devices).map(|i| IoDevice::new(i as u8)).collect();
    }

    /// Tear down and re-init all OS state. PID assignment continues from
    /// where it left off, so PIDs stay unique across reboots.
    fn reboot_os(&mut self, strategy: Strategy) {
        self.strategy = strategy;
        self.procs.clear();
        self.ready = ReadyQueue::new(strategy);
        self.interrupts.clear();
        self.pending_requests.clear();
        self.reentry.clear();
        self.rt_jobs.clear();
        self.running = vec![None; self.cores.len()];
        self.pending_syscalls = vec![Syscall::None; self.cores.len()];
        self.step_actions = vec![StepAction::Noop; self.cores.len()];
        self.time = 0;
        self.paused = false;
        self.mem.reset();
        for cpu in &mut self.cores {
            cpu.zero();
        }
        for dev in &mut self.devices {
            dev.clear();
        }
        debug!("OS rebooted under {strategy}");
    }

    // -----------------------------
    // Scheduler
    // -----------------------------

    /// Pick the next process for `core` under the active policy. Under MLF
    /// this also evicts the process currently on the core, if any (the MLF
    /// preemption path); the evicted process rejoins its own level with its
    /// level time reset.
    pub(crate) fn schedule(&mut self, core: usize) -> Result<Option<Pid>, SimError> {
        let Some(pid) = self.ready.pop() else {
            return Ok(None);
        };

        if matches!(self.strategy, Strategy::Mlf) && !self.cores[core].free() {
            let evicted = self.running[core].take().ok_or_else(|| {
                SimError::internal(core as u8, "busy core with an empty running slot")
            })?;
            let regs = self.cores[core].regstate();
            let Self { procs, ready, .. } = self;
            let pcb = procs.get_mut(&evicted).ok_or_else(|| {
                SimError::internal(core as u8, format!("running pid {evicted} not in process list"))
            })?;
            pcb.state = State::Ready;
            pcb.processor_time_on_level = 0;
            pcb.regs = regs;
            ready.push(pcb);
            self.cores[core].zero();
        }

        Ok(Some(pid))
    }

    // -----------------------------
    // Read-only accessors
    // -----------------------------

    pub fn time(&self) -> u64 {
        self.time
    }

    pub fn paused(&self) -> bool {
        self.paused
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn clock_delay(&self) -> u64 {
        self.clock_delay_ms
    }

    pub fn num_cores(&self) -> usize {
        self.cores.len()
    }

    pub fn num_io_devices(&self) -> usize {
        self.devices.len()
    }

    pub fn process(&self, pid: Pid) -> Option<&Pcb> {
        self.procs.get(&pid)
    }

    /// All PCBs in PID order (terminated ones included, for statistics).
    pub fn processes(&self) -> impl Iterator<Item = &Pcb> {
        self.procs.values()
    }

    /// PID running on `core`, if any.
    pub fn running_on(&self, core: usize) -> Option<Pid> {
        self.running.get(core).copied().flatten()
    }

    /// Number of cores currently executing a process.
    pub fn busy_cores(&self) -> usize {
        self.cores.iter().filter(|c| !c.free()).count()
    }
}
