/*!
User-memory arena backing the ALLOC/FREE syscalls and the SW instruction.

The simulator models user memory as opaque byte buffers whose addresses
travel through CPU registers. Addresses are handles, not host pointers:

```text
bit 63        bits 62..16        bits 15..0
+---+---------------------------+----------+
| 1 |        slot + 1           |  offset  |
+---+---------------------------+----------+
```

The tag bit keeps data addresses disjoint from code addresses (and from
zero); the slot field selects an arena entry; the low 16 bits are a byte
offset so programs can step a pointer with INC. A buffer may therefore be at
most 64 KiB.

Stores through a handle are only legal while the owning allocation is live;
a store or free against anything else reports a fault, which the kernel
treats as an internal error on the faulting core.
*/

const DATA_TAG: u64 = 1 << 63;
const SLOT_SHIFT: u32 = 16;
const OFFSET_MASK: u64 = (1 << SLOT_SHIFT) - 1;

/// Largest single allocation the handle encoding can address.
pub const MAX_ALLOC: u64 = 1 << SLOT_SHIFT;

/// Arena of user byte buffers. Slots are reused after free; an address is
/// guaranteed nonzero and distinct from every *outstanding* allocation.
#[derive(Debug, Default)]
pub struct MemoryArena {
    slots: Vec<Option<Vec<u8>>>,
    free_slots: Vec<usize>,
}

impl MemoryArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop all allocations (kernel reboot path).
    pub fn reset(&mut self) {
        self.slots.clear();
        self.free_slots.clear();
    }

    /// Number of live allocations.
    pub fn live(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Allocate a buffer of `size` bytes and return its handle address.
    pub fn alloc(&mut self, size: u64) -> Result<u64, String> {
        if size > MAX_ALLOC {
            return Err(format!(
                "allocation of {size} bytes exceeds the {MAX_ALLOC}-byte buffer limit"
            ));
        }

        let buf = vec![0u8; size as usize];
        let slot = match self.free_slots.pop() {
            Some(slot) => {
                self.slots[slot] = Some(buf);
                slot
            }
            None => {
                self.slots.push(Some(buf));
                self.slots.len() - 1
            }
        };

        Ok(DATA_TAG | ((slot as u64 + 1) << SLOT_SHIFT))
    }

    /// Release the allocation behind `addr`. The address must be the base
    /// handle returned by `alloc` (offset zero).
    pub fn free(&mut self, addr: u64) -> Result<(), String> {
        let (slot, offset) = self.decode(addr)?;
        if offset != 0 {
            return Err(format!(
                "free of interior address {addr:#x} (offset {offset})"
            ));
        }

        self.slots[slot] = None;
        self.free_slots.push(slot);
        Ok(())
    }

    /// Store one byte through a handle address.
    pub fn store_byte(&mut self, addr: u64, value: u8) -> Result<(), String> {
        let (slot, offset) = self.decode(addr)?;
        let Some(buf) = self.slots[slot].as_mut() else {
            return Err(format!("use of freed allocation at {addr:#x}"));
        };
        match buf.get_mut(offset as usize) {
            Some(cell) => {
                *cell = value;
                Ok(())
            }
            None => Err(format!(
                "store at {addr:#x} past the end of a {}-byte buffer",
                buf.len()
            )),
        }
    }

    /// Read one byte through a handle address.
    pub fn load_byte(&self, addr: u64) -> Result<u8, String> {
        let (slot, offset) = self.decode(addr)?;
        let Some(buf) = self.slots[slot].as_ref() else {
            return Err(format!("use of freed allocation at {addr:#x}"));
        };
        buf.get(offset as usize)
            .copied()
            .ok_or_else(|| format!("load at {addr:#x} past the end of a {}-byte buffer", buf.len()))
    }

    /// Validate a handle and split it into (live slot, offset).
    fn decode(&self, addr: u64) -> Result<(usize, u64), String> {
        if addr & DATA_TAG == 0 {
            return Err(format!("{addr:#x} is not a user-memory address"));
        }

        let slot_field = (addr & !DATA_TAG) >> SLOT_SHIFT;
        let offset = addr & OFFSET_MASK;
        let slot = match slot_field.checked_sub(1) {
            Some(s) => s as usize,
            None => return Err(format!("{addr:#x} has an empty slot field")),
        };

        match self.slots.get(slot) {
            Some(Some(_)) => Ok((slot, offset)),
            Some(None) => Err(format!("use of freed allocation at {addr:#x}")),
            None => Err(format!("{addr:#x} does not name an allocation")),
        }
    }
}
