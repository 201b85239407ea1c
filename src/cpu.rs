/*!
Simulated CPU core: one instruction per tick.

Execution model:
- If RIP is zero on entry the core is idle and the tick is a no-op.
- Otherwise the CPU fetches the instruction at RIP, advances RIP by one
  instruction, then executes. Branches are therefore relative to the
  pre-fetch RIP (`RIP - 1 + rel` when taken).
- Syscall-raising opcodes (IO/EXIT/ALLOC/FREE) do not trap into the kernel
  themselves; the CPU reports the raised syscall to its caller and the
  kernel's step-action machine services it. IO additionally latches the
  requested duration into RDI before raising.

The CPU owns nothing but its register file. Code comes from the program
catalog; SW stores go through the user-memory arena. Context switches are a
wholesale `load`/`regstate` of the register file.
*/

use serde::Serialize;

use crate::error::SimError;
use crate::isa::{FLAG_CY, FLAG_ZF, Opcode, Reg, Registers};
use crate::memory::MemoryArena;
use crate::process::ProgramTable;

/// Syscalls a process can raise, plus the none/empty value the kernel keeps
/// per core between raises.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Syscall {
    #[default]
    None,
    Io,
    Exit,
    Alloc,
    Free,
}

pub struct Cpu {
    id: u8,
    regs: Registers,
}

impl Cpu {
    pub fn new(id: u8) -> Self {
        Self {
            id,
            regs: Registers::default(),
        }
    }

    /// A core is free iff no program is loaded (RIP == 0).
    pub fn free(&self) -> bool {
        self.regs.rip == 0
    }

    /// Load a saved register file wholesale (context switch in).
    pub fn load(&mut self, regs: Registers) {
        self.regs = regs;
    }

    /// Copy of the current register file (context switch out).
    pub fn regstate(&self) -> Registers {
        self.regs
    }

    /// Return the core to the idle state.
    pub fn zero(&mut self) {
        self.regs = Registers::default();
    }

    /// Execute one instruction. Returns the syscall raised by it, if any.
    pub fn tick(
        &mut self,
        programs: &ProgramTable,
        mem: &mut MemoryArena,
    ) -> Result<Syscall, SimError> {
        if self.regs.rip == 0 {
            return Ok(Syscall::None);
        }

        let instr = programs.fetch(self.regs.rip).ok_or_else(|| {
            SimError::internal(
                self.id,
                format!("instruction fetch at {:#x} hit no loaded program", self.regs.rip),
            )
        })?;
        self.regs.rip += 1;

        match instr.opcode {
            Opcode::Nop | Opcode::Work => {}
            Opcode::Io => {
                self.regs.set(Reg::Rdi, instr.op1 as u64);
                return Ok(Syscall::Io);
            }
            Opcode::Exit => return Ok(Syscall::Exit),
            Opcode::Alloc => return Ok(Syscall::Alloc),
            Opcode::Free => return Ok(Syscall::Free),
            Opcode::Load => {
                let rd = self.reg_operand(instr.op2)?;
                self.regs.set(rd, instr.op1 as u64);
            }
            Opcode::Move => {
                let rs = self.reg_operand(instr.op1)?;
                let rd = self.reg_operand(instr.op2)?;
                let value = self.regs.get(rs);
                self.regs.set(rd, value);
            }
            Opcode::Sw => {
                let rs = self.reg_operand(instr.op1)?;
                let rd = self.reg_operand(instr.op2)?;
                let data = self.regs.get(rs) as u8;
                let addr = self.regs.get(rd);
                mem.store_byte(addr, data)
                    .map_err(|cause| SimError::internal(self.id, cause))?;
            }
            Opcode::Cmp => {
                let a = self.regs.get(self.reg_operand(instr.op1)?);
                let b = self.regs.get(self.reg_operand(instr.op2)?);
                self.regs.clear_cmp_flags();
                if a == b {
                    self.regs.flags |= FLAG_CY | FLAG_ZF;
                } else if a < b {
                    self.regs.flags |= FLAG_CY;
                }
            }
            Opcode::Jl => self.branch_if(self.regs.carry() && !self.regs.zero(), instr.op1),
            Opcode::Jle => self.branch_if(self.regs.carry(), instr.op1),
            Opcode::Je => self.branch_if(self.regs.zero(), instr.op1),
            Opcode::Jge => self.branch_if(!self.regs.carry(), instr.op1),
            Opcode::Jg => self.branch_if(!self.regs.carry() && !self.regs.zero(), instr.op1),
            Opcode::Inc => {
                let r = self.reg_operand(instr.op1)?;
                let value = self.regs.get(r).wrapping_add(1);
                self.regs.set(r, value);
            }
            Opcode::Add => {
                let rs = self.reg_operand(instr.op1)?;
                let rd = self.reg_operand(instr.op2)?;
                let (sum, overflow) = self.regs.get(rd).overflowing_add(self.regs.get(rs));
                self.regs.clear_cmp_flags();
                if overflow {
                    self.regs.flags |= FLAG_CY;
                    if sum == 0 {
                        self.regs.flags |= FLAG_ZF;
                    }
                }
                self.regs.set(rd, sum);
            }
            Opcode::Sub => {
                let rs = self.reg_operand(instr.op1)?;
                let rd = self.reg_operand(instr.op2)?;
                let a = self.regs.get(rd);
                let b = self.regs.get(rs);
                self.regs.clear_cmp_flags();
                if a >= b {
                    self.regs.flags |= FLAG_CY;
                    if a == b {
                        self.regs.flags |= FLAG_ZF;
                    }
                }
                self.regs.set(rd, a.wrapping_sub(b));
            }
        }

        Ok(Syscall::None)
    }

    /// Taken branches rewind the fetch advance before applying the offset.
    fn branch_if(&mut self, taken: bool, rel: i64) {
        if taken {
            self.regs.rip = (self.regs.rip - 1).wrapping_add_signed(rel);
        }
    }

    fn reg_operand(&self, operand: i64) -> Result<Reg, SimError> {
        Reg::from_index(operand).ok_or_else(|| {
            SimError::internal(self.id, format!("operand {operand} is not a register index"))
        })
    }
}
