pub mod int1ah;
pub mod int20h;
pub mod int21h;

use crate::error::Result;
use crate::memory::MemoryCore;
use crate::registers::CpuRegisters;

/// A software interrupt service, called synchronously from `INT n`.
///
/// The CPU has already pushed FLAGS, CS and IP when `handle` runs, and pops
/// CS and IP again afterwards without restoring FLAGS. Whatever the handler
/// leaves in the registers (Carry especially) is what the caller sees.
pub trait InterruptHandler: Send + std::fmt::Debug {
	fn vector(&self) -> u8;
	fn handle(&mut self, registers: &mut CpuRegisters, memory: &mut MemoryCore) -> Result<()>;
}

/// Packs 0-99 as two BCD digits.
pub(crate) fn to_bcd(value: u8) -> u8 {
	((value / 10) << 4) | (value % 10)
}
