/*!
Ready structures: one concrete container per scheduling policy.

Exactly one structure is active at a time, selected by the scheduling
strategy. All six share a tiny interface (push / pop / peek / len /
pop-order snapshot) and the kernel dispatches on the enum, never through a
virtual table:

- FIFO / RT_FIFO: insertion-order queue.
- SJF: min-heap on required processor time.
- SRT: min-heap on remaining processor time.
- MLF: six FIFO queues, one per priority level.
- RT_EDF: min-heap on absolute deadline; no deadline sorts as greatest.
- RT_LST: min-heap on slack (`deadline - remaining`); no deadline greatest.

Heap entries snapshot their key at insertion time. That is sound because
the keyed fields only change while a process is running, and a running
process is never simultaneously queued. Ties break on PID, which keeps pop
order fully deterministic (insertion-order tie-breaking is not required).

Snapshots clone the underlying containers, so exporting the pop order never
perturbs the live structure.
*/

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};

use serde::Serialize;

use crate::process::{Pcb, Pid};

/// Number of MLF priority levels.
pub const NUM_LEVELS: usize = 6;

/// Scheduling strategy selector.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Strategy {
    Fifo,
    Sjf,
    Srt,
    Mlf,
    RtFifo,
    RtEdf,
    RtLst,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Strategy::Fifo => "FIFO",
            Strategy::Sjf => "SJF",
            Strategy::Srt => "SRT",
            Strategy::Mlf => "MLF",
            Strategy::RtFifo => "RT_FIFO",
            Strategy::RtEdf => "RT_EDF",
            Strategy::RtLst => "RT_LST",
        };
        f.write_str(name)
    }
}

/// EDF key: absolute deadline, `u64::MAX` when none.
fn edf_key(pcb: &Pcb) -> u64 {
    pcb.deadline.unwrap_or(u64::MAX)
}

/// The active ready structure.
pub enum ReadyQueue {
    Fifo(VecDeque<Pid>),
    Sjf(BinaryHeap<Reverse<(u64, Pid)>>),
    Srt(BinaryHeap<Reverse<(u64, Pid)>>),
    Mlf([VecDeque<Pid>; NUM_LEVELS]),
    Edf(BinaryHeap<Reverse<(u64, Pid)>>),
    Lst(BinaryHeap<Reverse<(i64, Pid)>>),
}

impl ReadyQueue {
    pub fn new(strategy: Strategy) -> Self {
        match strategy {
            Strategy::Fifo | Strategy::RtFifo => ReadyQueue::Fifo(VecDeque::new()),
            Strategy::Sjf => ReadyQueue::Sjf(BinaryHeap::new()),
            Strategy::Srt => ReadyQueue::Srt(BinaryHeap::new()),
            Strategy::Mlf => ReadyQueue::Mlf(std::array::from_fn(|_| VecDeque::new())),
            Strategy::RtEdf => ReadyQueue::Edf(BinaryHeap::new()),
            Strategy::RtLst => ReadyQueue::Lst(BinaryHeap::new()),
        }
    }

    /// Insert a READY process, keyed per policy. MLF inserts at the PCB's
    /// current level.
    pub fn push(&mut self, pcb: &Pcb) {
        match self {
            ReadyQueue::Fifo(q) => q.push_back(pcb.pid),
            ReadyQueue::Sjf(h) => h.push(Reverse((pcb.req_processor_time, pcb.pid))),
            ReadyQueue::Srt(h) => h.push(Reverse((pcb.remaining(), pcb.pid))),
            ReadyQueue::Mlf(levels) => levels[pcb.level].push_back(pcb.pid),
            ReadyQueue::Edf(h) => h.push(Reverse((edf_key(pcb), pcb.pid))),
            ReadyQueue::Lst(h) => h.push(Reverse((pcb.slack_key(), pcb.pid))),
        }
    }

    /// Remove and return the next process under the active policy.
    pub fn pop(&mut self) -> Option<Pid> {
        match self {
            ReadyQueue::Fifo(q) => q.pop_front(),
            ReadyQueue::Sjf(h) | ReadyQueue::Srt(h) | ReadyQueue::Edf(h) => {
                h.pop().map(|Reverse((_, pid))| pid)
            }
            ReadyQueue::Lst(h) => h.pop().map(|Reverse((_, pid))| pid),
            ReadyQueue::Mlf(levels) => levels.iter_mut().find_map(|q| q.pop_front()),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ReadyQueue::Fifo(q) => q.len(),
            ReadyQueue::Sjf(h) | ReadyQueue::Srt(h) | ReadyQueue::Edf(h) => h.len(),
            ReadyQueue::Lst(h) => h.len(),
            ReadyQueue::Mlf(levels) => levels.iter().map(VecDeque::len).sum(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Earliest queued deadline (RT_EDF only).
    pub fn peek_deadline(&self) -> Option<u64> {
        match self {
            ReadyQueue::Edf(h) => h.peek().map(|Reverse((key, _))| *key),
            _ => None,
        }
    }

    /// Smallest queued slack key (RT_LST only).
    pub fn peek_slack(&self) -> Option<i64> {
        match self {
            ReadyQueue::Lst(h) => h.peek().map(|Reverse((key, _))| *key),
            _ => None,
        }
    }

    /// Whether any MLF level above `level` (numerically below) has a
    /// runnable process.
    pub fn has_level_above(&self, level: usize) -> bool {
        match self {
            ReadyQueue::Mlf(levels) => levels[..level.min(NUM_LEVELS)]
                .iter()
                .any(|q| !q.is_empty()),
            _ => false,
        }
    }

    /// PIDs in the order `pop` would yield them, without disturbing the
    /// live structure.
    pub fn iter_snapshot(&self) -> Vec<Pid> {
        match self {
            ReadyQueue::Fifo(q) => q.iter().copied().collect(),
            ReadyQueue::Sjf(h) | ReadyQueue::Srt(h) | ReadyQueue::Edf(h) => drain_clone(h),
            ReadyQueue::Lst(h) => drain_clone(h),
            ReadyQueue::Mlf(levels) => levels.iter().flatten().copied().collect(),
        }
    }

    /// Per-level pop-order view (MLF only).
    pub fn mlf_snapshot(&self) -> Option<[Vec<Pid>; NUM_LEVELS]> {
        match self {
            ReadyQueue::Mlf(levels) => {
                Some(std::array::from_fn(|i| levels[i].iter().copied().collect()))
            }
            _ => None,
        }
    }
}

fn drain_clone<K: Ord + Clone>(heap: &BinaryHeap<Reverse<(K, Pid)>>) -> Vec<Pid> {
    let mut copy = heap.clone();
    let mut out = Vec::with_capacity(copy.len());
    while let Some(Reverse((_, pid))) = copy.pop() {
        out.push(pid);
    }
    out
}
