/*!
Simulated I/O device: a one-request state machine.

A device is `(pid, duration, progress)`, all zero when idle. `handle`
adopts a request and resets progress; each device tick increments progress
and, on the first tick where `progress > duration`, raises an
`IO_COMPLETION` interrupt for the owning process and returns to idle.

Interrupts are a tagged variant rather than a trait hierarchy; only I/O
completion exists today, but the enum leaves the extension point open.
*/

use serde::Serialize;

use crate::error::SimError;
use crate::process::Pid;

/// An I/O request accepted by the kernel. Queued while no device is free.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub struct IoRequest {
    pub pid: Pid,
    pub duration: u64,
}

/// Interrupt record delivered to the kernel's interrupt queue.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Interrupt {
    IoCompletion { pid: Pid },
}

pub struct IoDevice {
    id: u8,
    pid: Pid,
    duration: u64,
    progress: u64,
}

impl IoDevice {
    pub fn new(id: u8) -> Self {
        Self {
            id,
            pid: 0,
            duration: 0,
            progress: 0,
        }
    }

    pub fn busy(&self) -> bool {
        self.pid != 0
    }

    /// `(pid, duration, progress)` for the snapshot projection.
    pub fn status(&self) -> (Pid, u64, u64) {
        (self.pid, self.duration, self.progress)
    }

    /// Adopt a request. Fails if the device is already processing one.
    pub fn handle(&mut self, req: IoRequest) -> Result<(), SimError> {
        if self.busy() {
            return Err(SimError::DeviceBusy {
                device: self.id,
                pid: req.pid,
            });
        }

        self.pid = req.pid;
        self.duration = req.duration;
        self.progress = 0;
        Ok(())
    }

    /// Return to idle.
    pub fn clear(&mut self) {
        self.pid = 0;
        self.duration = 0;
        self.progress = 0;
    }

    /// Advance one tick; yields the completion interrupt when the request
    /// has run its course.
    pub fn tick(&mut self) -> Option<Interrupt> {
        if !self.busy() {
            return None;
        }

        self.progress += 1;
        if self.progress > self.duration {
            let interrupt = Interrupt::IoCompletion { pid: self.pid };
            self.clear();
            return Some(interrupt);
        }
        None
    }
}
