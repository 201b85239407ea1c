/*!
The per-tick control loop and step-action machine.

Ordering within one tick is fixed and reproducible:
1. The time counter advances.
2. Real-time activations fire, in job-list order.
3. Every CPU ticks (ascending core index), executing one instruction and
   possibly raising a syscall. A core whose syscall is still unhandled does
   not fetch.
4. Every I/O device ticks (ascending device index); completion interrupts
   enqueue in that order.
5. Each core decides a step action and executes it (ascending core index):
   an idle core services a pending request, handles an interrupt, or begins
   a ready process, in that precedence; a busy core handles its syscall,
   preempts under MLF/RT policies, or simply continues.
6. The reentry list drains into the active ready structure in insertion
   order.

A process dispatched onto a core (BEGIN_RUN, or an RT preemption bringing
in a new process) executes its first instruction in the same tick, since
the core's CPU phase has already passed; a process's life from dispatch to
DONE therefore spans exactly its program length in ticks. That first
execution is not charged to `processor_time`; every later tick on the core
is, either by CONTINUE_RUN or by the syscall handler that retires it.

Internal errors abort the tick; they are logged with the offending core and
cause, and the same workload replays to the same error.
*/

use log::{debug, error, trace};

use crate::cpu::Syscall;
use crate::device::{Interrupt, IoRequest};
use crate::error::SimError;
use crate::isa::Reg;
use crate::kernel::{Kernel, StepAction};
use crate::process::{Pid, State};
use crate::ready::{NUM_LEVELS, Strategy};

impl Kernel {
    /// Advance the simulation by one tick. When paused, the call is a no-op
    /// so the host can keep its cadence running.
    pub fn tick(&mut self) -> Result<(), SimError> {
        if self.paused {
            return Ok(());
        }

        self.time += 1;
        self.activate_rt_jobs()?;

        // CPU phase. Cores with an unhandled syscall hold their fetch until
        // the step-action machine services it.
        for core in 0..self.cores.len() {
            if self.pending_syscalls[core] != Syscall::None {
                continue;
            }
            let raised = self.cpu_exec(core)?;
            if raised != Syscall::None {
                self.pending_syscalls[core] = raised;
            }
        }

        // Device phase.
        for dev in &mut self.devices {
            if let Some(interrupt) = dev.tick() {
                self.interrupts.push_back(interrupt);
            }
        }

        // Decision phase.
        for core in 0..self.cores.len() {
            match self.step_core(core) {
                Ok(action) => self.step_actions[core] = action,
                Err(err) => {
                    error!("t={}: aborting tick: {err}", self.time);
                    return Err(err);
                }
            }
        }

        self.drain_reentry();
        Ok(())
    }

    /// Spawn one process for every real-time job whose period boundary is
    /// reached this tick. PIDs reflect job-list order.
    fn activate_rt_jobs(&mut self) -> Result<(), SimError> {
        let now = self.time;
        let due: Vec<(String, u64)> = self
            .rt_jobs
            .iter()
            .filter(|job| job.due(now))
            .map(|job| (job.program.clone(), now + job.deadline_offset))
            .collect();
        for (program, deadline) in due {
            self.spawn_inner(&program, Some(deadline))?;
        }
        Ok(())
    }

    /// Run one core's CPU for one instruction.
    fn cpu_exec(&mut self, core: usize) -> Result<Syscall, SimError> {
        let Self {
            cores,
            programs,
            mem,
            ..
        } = self;
        cores[core].tick(programs, mem)
    }

    // -----------------------------
    // Per-core decision tree
    // -----------------------------

    /// Decide and execute this core's step action for the tick.
    fn step_core(&mut self, core: usize) -> Result<StepAction, SimError> {
        if self.cores[core].free() {
            let action = if !self.pending_requests.is_empty()
                && self.devices.iter().any(|d| !d.busy())
            {
                StepAction::ServiceRequest
            } else if !self.interrupts.is_empty() {
                StepAction::HandleInterrupt
            } else if !self.ready.is_empty() {
                StepAction::BeginRun
            } else {
                StepAction::Noop
            };

            match action {
                StepAction::ServiceRequest => self.service_request(core)?,
                StepAction::HandleInterrupt => self.handle_interrupt(core)?,
                StepAction::BeginRun => self.begin_run(core)?,
                _ => {}
            }
            return Ok(action);
        }

        let pid = self.running[core].ok_or_else(|| {
            SimError::internal(core as u8, "busy core with an empty running slot")
        })?;

        if self.pending_syscalls[core] != Syscall::None {
            self.handle_syscall(core, pid)?;
            return Ok(StepAction::HandleSyscall);
        }

        let (level, deadline, slack) = {
            let pcb = self.procs.get(&pid).ok_or_else(|| {
                SimError::internal(core as u8, format!("running pid {pid} not in process list"))
            })?;
            (pcb.level, pcb.deadline, pcb.slack_key())
        };

        match self.strategy {
            // MLF preemption: only when every core is occupied and a
            // strictly higher-priority level has work.
            Strategy::Mlf
                if self.cores.iter().all(|c| !c.free())
                    && self.ready.has_level_above(level) =>
            {
                self.begin_run(core)?;
                Ok(StepAction::BeginRun)
            }
            Strategy::RtEdf
                if self
                    .ready
                    .peek_deadline()
                    .is_some_and(|head| head < deadline.unwrap_or(u64::MAX)) =>
            {
                self.rt_preempt(core, pid)?;
                Ok(StepAction::ContinueRun)
            }
            // The running process's slack is evaluated after the tick it is
            // about to consume; the queued head's remaining work is fixed.
            Strategy::RtLst
                if self
                    .ready
                    .peek_slack()
                    .is_some_and(|head| head < slack.saturating_add(1)) =>
            {
                self.rt_preempt(core, pid)?;
                Ok(StepAction::ContinueRun)
            }
            _ => {
                self.continue_run(core, pid)?;
                Ok(StepAction::ContinueRun)
            }
        }
    }

    // -----------------------------
    // Step-action execution
    // -----------------------------

    /// Pop the front interrupt and make its process runnable again via the
    /// reentry list.
    fn handle_interrupt(&mut self, core: usize) -> Result<(), SimError> {
        let interrupt = self.interrupts.pop_front().ok_or_else(|| {
            SimError::internal(core as u8, "trying to handle a nonexistent interrupt")
        })?;

        match interrupt {
            Interrupt::IoCompletion { pid } => {
                let pcb = self.procs.get_mut(&pid).ok_or_else(|| {
                    SimError::internal(
                        core as u8,
                        format!("I/O completion for pid {pid} not in process list"),
                    )
                })?;
                pcb.state = State::Ready;
                self.reentry.push(pid);
                trace!("t={}: core {core} handled I/O completion for pid {pid}", self.time);
            }
        }
        Ok(())
    }

    /// Dispatch the scheduler's pick onto this core and execute its first
    /// instruction.
    fn begin_run(&mut self, core: usize) -> Result<(), SimError> {
        let pid = self.schedule(core)?.ok_or_else(|| {
            SimError::internal(core as u8, "attempting to run a nonexistent process")
        })?;

        let regs = {
            let pcb = self.procs.get_mut(&pid).ok_or_else(|| {
                SimError::internal(core as u8, format!("scheduled pid {pid} not in process list"))
            })?;
            pcb.state = State::Processing;
            pcb.regs
        };

        self.running[core] = Some(pid);
        self.cores[core].load(regs);
        trace!("t={}: core {core} begins pid {pid}", self.time);

        let raised = self.cpu_exec(core)?;
        if raised != Syscall::None {
            self.pending_syscalls[core] = raised;
        }
        Ok(())
    }

    /// Charge one tick of processor time; under MLF also age the process on
    /// its level and demote it when the level budget is exhausted.
    fn continue_run(&mut self, core: usize, pid: Pid) -> Result<(), SimError> {
        let regs = self.cores[core].regstate();
        let mlf = matches!(self.strategy, Strategy::Mlf);

        let demoted = {
            let pcb = self.procs.get_mut(&pid).ok_or_else(|| {
                SimError::internal(core as u8, format!("running pid {pid} not in process list"))
            })?;
            pcb.processor_time += 1;
            if mlf {
                pcb.processor_time_on_level += 1;
                // Level budget is 2^(level+1); the bottom level never ages out.
                if pcb.level < NUM_LEVELS - 1 && pcb.processor_time_on_level > (2u64 << pcb.level) {
                    pcb.level += 1;
                    pcb.processor_time_on_level = 0;
                    pcb.state = State::Ready;
                    pcb.regs = regs;
                    true
                } else {
                    false
                }
            } else {
                false
            }
        };

        if demoted {
            debug!("t={}: pid {pid} demoted, vacating core {core}", self.time);
            self.reentry.push(pid);
            self.running[core] = None;
            self.cores[core].zero();
        }
        Ok(())
    }

    /// RT_EDF / RT_LST preemption: put the running process back in the heap
    /// (charging it for the tick it just consumed) and dispatch the more
    /// urgent head in its place.
    fn rt_preempt(&mut self, core: usize, pid: Pid) -> Result<(), SimError> {
        let regs = self.cores[core].regstate();
        {
            let Self { procs, ready, .. } = self;
            let pcb = procs.get_mut(&pid).ok_or_else(|| {
                SimError::internal(core as u8, format!("running pid {pid} not in process list"))
            })?;
            pcb.state = State::Ready;
            pcb.processor_time += 1;
            pcb.regs = regs;
            ready.push(pcb);
        }
        self.running[core] = None;
        self.cores[core].zero();
        debug!("t={}: pid {pid} preempted on core {core}", self.time);

        self.begin_run(core)
    }

    /// Service this core's pending syscall.
    fn handle_syscall(&mut self, core: usize, pid: Pid) -> Result<(), SimError> {
        let syscall = self.pending_syscalls[core];
        match syscall {
            Syscall::Io => self.sys_io(core, pid)?,
            Syscall::Exit => self.sys_exit(core, pid)?,
            Syscall::Alloc => self.sys_alloc(core, pid)?,
            Syscall::Free => self.sys_free(core, pid)?,
            Syscall::None => {
                return Err(SimError::internal(
                    core as u8,
                    "HANDLE_SYSCALL with no pending syscall",
                ));
            }
        }
        self.pending_syscalls[core] = Syscall::None;
        Ok(())
    }

    /// Block the caller on I/O. The request goes straight to an idle device
    /// when the pending queue is empty; otherwise it queues behind the
    /// earlier requests and the queue front gets the device.
    fn sys_io(&mut self, core: usize, pid: Pid) -> Result<(), SimError> {
        let regs = self.cores[core].regstate();
        let duration = regs.get(Reg::Rdi);

        {
            let pcb = self.procs.get_mut(&pid).ok_or_else(|| {
                SimError::internal(core as u8, format!("running pid {pid} not in process list"))
            })?;
            pcb.state = State::Blocked;
            pcb.regs = regs;
            pcb.processor_time += 1;
        }

        let request = IoRequest { pid, duration };
        match self.devices.iter_mut().find(|d| !d.busy()) {
            None => self.pending_requests.push_back(request),
            Some(dev) => {
                if self.pending_requests.is_empty() {
                    dev.handle(request)?;
                } else {
                    self.pending_requests.push_back(request);
                    if let Some(front) = self.pending_requests.pop_front() {
                        dev.handle(front)?;
                    }
                }
            }
        }

        trace!("t={}: pid {pid} blocked on I/O for {duration}", self.time);
        self.running[core] = None;
        self.cores[core].zero();
        Ok(())
    }

    /// Retire the caller: DONE when its deadline was met (or absent), DEAD
    /// otherwise.
    fn sys_exit(&mut self, core: usize, pid: Pid) -> Result<(), SimError> {
        let regs = self.cores[core].regstate();
        let now = self.time;

        let pcb = self.procs.get_mut(&pid).ok_or_else(|| {
            SimError::internal(core as u8, format!("running pid {pid} not in process list"))
        })?;
        pcb.state = match pcb.deadline {
            Some(deadline) if now > deadline => State::Dead,
            _ => State::Done,
        };
        pcb.done_time = Some(now);
        pcb.regs = regs;
        pcb.processor_time += 1;
        debug!("t={now}: pid {pid} exited as {:?}", pcb.state);

        self.running[core] = None;
        self.cores[core].zero();
        Ok(())
    }

    /// Allocate a user buffer: size in RDI, destination register index in
    /// RSI; the handle lands in the target register and RAX echoes the size.
    fn sys_alloc(&mut self, core: usize, pid: Pid) -> Result<(), SimError> {
        let mut regs = self.cores[core].regstate();
        let size = regs.get(Reg::Rdi);
        let target = Reg::from_index(regs.get(Reg::Rsi) as i64).ok_or_else(|| {
            SimError::internal(
                core as u8,
                format!("ALLOC target {} is not a register index", regs.get(Reg::Rsi)),
            )
        })?;

        let addr = self
            .mem
            .alloc(size)
            .map_err(|cause| SimError::internal(core as u8, cause))?;
        regs.set(target, addr);
        regs.set(Reg::Rax, size);
        self.cores[core].load(regs);

        self.charge_tick(core, pid)
    }

    /// Free a user buffer: RDI holds the index of the register holding the
    /// handle; RAX is cleared on success.
    fn sys_free(&mut self, core: usize, pid: Pid) -> Result<(), SimError> {
        let mut regs = self.cores[core].regstate();
        let ptr_reg = Reg::from_index(regs.get(Reg::Rdi) as i64).ok_or_else(|| {
            SimError::internal(
                core as u8,
                format!("FREE operand {} is not a register index", regs.get(Reg::Rdi)),
            )
        })?;

        self.mem
            .free(regs.get(ptr_reg))
            .map_err(|cause| SimError::internal(core as u8, cause))?;
        regs.set(Reg::Rax, 0);
        self.cores[core].load(regs);

        self.charge_tick(core, pid)
    }

    fn charge_tick(&mut self, core: usize, pid: Pid) -> Result<(), SimError> {
        let pcb = self.procs.get_mut(&pid).ok_or_else(|| {
            SimError::internal(core as u8, format!("running pid {pid} not in process list"))
        })?;
        pcb.processor_time += 1;
        Ok(())
    }

    /// Hand the front pending request to the first idle device.
    fn service_request(&mut self, core: usize) -> Result<(), SimError> {
        let Some(dev) = self.devices.iter_mut().find(|d| !d.busy()) else {
            return Err(SimError::internal(
                core as u8,
                "SERVICE_REQUEST with no idle device",
            ));
        };
        let request = self.pending_requests.pop_front().ok_or_else(|| {
            SimError::internal(core as u8, "SERVICE_REQUEST with no pending request")
        })?;
        dev.handle(request)
    }

    /// Insert every process that became READY this tick into the active
    /// ready structure, in the order the transitions happened.
    fn drain_reentry(&mut self) {
        for pid in std::mem::take(&mut self.reentry) {
            let Self { procs, ready, .. } = self;
            match procs.get(&pid) {
                Some(pcb) => ready.push(pcb),
                None => error!("reentering pid {pid} not in process list; dropped"),
            }
        }
    }
}
