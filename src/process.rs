/*!
Process control blocks, the program catalog, and real-time job descriptors.

PCBs live in a stable container keyed by PID (see `kernel`); everything else
in the simulator refers to processes by PID, never by reference, so a PCB
can move between ready structures, cores, and devices without aliasing.

Programs are immutable once registered and survive scheduler reboots. Each
catalog slot owns a copy of its instruction list and is addressed by a
virtual code base:

```text
bits 62..32      bits 31..0
+-------------+--------------+
|  slot + 1   |  instruction |
+-------------+--------------+
```

RIP zero therefore never names an instruction (an idle CPU), and re-loading
a program under the same name replaces the slot in place, keeping the base
stable for PCBs already running it.
*/

use serde::Serialize;

use crate::isa::{Instruction, Registers};

/// Process identifier. Strictly increasing and unique within a run; zero is
/// never assigned (devices use PID 0 to mean idle).
pub type Pid = u32;

const CODE_SHIFT: u32 = 32;
const INDEX_MASK: u64 = (1 << CODE_SHIFT) - 1;

/// Lifecycle states of a process.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum State {
    Ready,
    Processing,
    Blocked,
    /// Exited in time (no deadline, or `doneTime <= deadline`).
    Done,
    /// Exited after its deadline had passed.
    Dead,
}

impl State {
    /// DONE and DEAD processes stay in the process list for statistics but
    /// take no further part in scheduling.
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Done | State::Dead)
    }
}

/// Process control block.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Pcb {
    pub pid: Pid,
    pub name: String,
    /// Tick at which the process was spawned.
    pub arrival_time: u64,
    /// Tick at which the process exited (DONE or DEAD).
    pub done_time: Option<u64>,
    /// Absolute deadline, if the process has one.
    pub deadline: Option<u64>,
    /// Effective instructions in the program (the terminating EXIT does not
    /// count as required processor time).
    pub req_processor_time: u64,
    /// Processor time consumed so far.
    pub processor_time: u64,
    /// MLF priority level, 0 (highest) ..= 5.
    pub level: usize,
    /// Processor time accumulated since the last MLF level change.
    pub processor_time_on_level: u64,
    pub state: State,
    /// Saved register file while not on a core.
    pub regs: Registers,
}

impl Pcb {
    /// Processor time still owed to this process.
    pub fn remaining(&self) -> u64 {
        self.req_processor_time.saturating_sub(self.processor_time)
    }

    /// Slack key for least-slack-time ordering: `deadline - remaining`.
    /// The current time is common to all candidates and cancels out of every
    /// comparison, so it is omitted. No deadline sorts as greatest.
    pub fn slack_key(&self) -> i64 {
        match self.deadline {
            Some(d) => d as i64 - self.remaining() as i64,
            None => i64::MAX,
        }
    }
}

/// An immutable registered program.
#[derive(Clone, Debug)]
pub struct Program {
    pub name: String,
    pub instructions: Vec<Instruction>,
}

/// Catalog of registered programs, keyed by name.
///
/// The catalog owns program storage and assigns each name a stable slot; the
/// slot number forms the high half of every code address for that program.
#[derive(Debug, Default)]
pub struct ProgramTable {
    programs: Vec<Program>,
}

impl ProgramTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `instructions` under `name`, overwriting any prior binding
    /// (the slot, and therefore the code base, is preserved on overwrite).
    pub fn load(&mut self, name: &str, instructions: &[Instruction]) {
        let program = Program {
            name: name.to_string(),
            instructions: instructions.to_vec(),
        };
        match self.programs.iter_mut().find(|p| p.name == name) {
            Some(slot) => *slot = program,
            None => self.programs.push(program),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Program> {
        self.programs.iter().find(|p| p.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Code address of the first instruction of `name`.
    pub fn entry_point(&self, name: &str) -> Option<u64> {
        self.programs
            .iter()
            .position(|p| p.name == name)
            .map(|slot| (slot as u64 + 1) << CODE_SHIFT)
    }

    /// Fetch the instruction at a code address, or `None` if the address
    /// names no loaded instruction.
    pub fn fetch(&self, rip: u64) -> Option<Instruction> {
        let slot = (rip >> CODE_SHIFT).checked_sub(1)? as usize;
        let index = (rip & INDEX_MASK) as usize;
        self.programs.get(slot)?.instructions.get(index).copied()
    }
}

/// A periodic real-time dispatch descriptor. Whenever
/// `now >= delay && (now - delay) % period == 0`, one fresh process is
/// spawned with absolute deadline `now + deadline_offset`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RtJob {
    pub program: String,
    pub period: u64,
    pub deadline_offset: u64,
    pub delay: u64,
}

impl RtJob {
    pub fn due(&self, now: u64) -> bool {
        now >= self.delay && (now - self.delay) % self.period == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::Instruction as I;

    #[test]
    fn catalog_overwrite_keeps_code_base() {
        let mut table = ProgramTable::new();
        table.load("a", &[I::work(), I::exit()]);
        table.load("b", &[I::exit()]);

        let base_a = table.entry_point("a").unwrap();
        table.load("a", &[I::nop(), I::nop(), I::exit()]);
        assert_eq!(table.entry_point("a"), Some(base_a));
        assert_eq!(table.get("a").unwrap().instructions.len(), 3);
        assert_ne!(table.entry_point("b"), Some(base_a));
    }

    #[test]
    fn fetch_walks_instructions() {
        let mut table = ProgramTable::new();
        table.load("p", &[I::work(), I::io(3), I::exit()]);

        let base = table.entry_point("p").unwrap();
        assert_ne!(base, 0);
        assert_eq!(table.fetch(base), Some(I::work()));
        assert_eq!(table.fetch(base + 1), Some(I::io(3)));
        assert_eq!(table.fetch(base + 2), Some(I::exit()));
        assert_eq!(table.fetch(base + 3), None);
        assert_eq!(table.fetch(0), None);
    }

    #[test]
    fn rt_job_period_boundaries() {
        let job = RtJob {
            program: "p".into(),
            period: 5,
            deadline_offset: 3,
            delay: 2,
        };
        assert!(!job.due(0));
        assert!(!job.due(1));
        assert!(job.due(2));
        assert!(!job.due(3));
        assert!(job.due(7));
        assert!(job.due(12));
    }

    #[test]
    fn slack_treats_no_deadline_as_greatest() {
        let mut pcb = Pcb {
            pid: 1,
            name: "p".into(),
            arrival_time: 0,
            done_time: None,
            deadline: Some(10),
            req_processor_time: 6,
            processor_time: 2,
            level: 0,
            processor_time_on_level: 0,
            state: State::Ready,
            regs: Registers::default(),
        };
        assert_eq!(pcb.slack_key(), 6);

        pcb.deadline = None;
        assert_eq!(pcb.slack_key(), i64::MAX);
    }
}
