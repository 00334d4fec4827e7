use crate::error::Result;
use crate::interrupts::InterruptHandler;
use crate::memory::MemoryCore;
use crate::registers::CpuRegisters;

// http://stanislavs.org/helppc/int_20.html

pub const INT_20H: u8 = 0x20;

/// Program terminate. This is what the `CD 20` at the start of the PSP
/// reaches when a program far returns to PSP:0000.
#[derive(Debug, Default)]
pub struct Int20h;

impl InterruptHandler for Int20h {
	fn vector(&self) -> u8 {
		INT_20H
	}

	fn handle(&mut self, registers: &mut CpuRegisters, _memory: &mut MemoryCore) -> Result<()> {
		tracing::debug!("program terminated through int 20h");
		// No return code, so the exit code reads as 0.
		registers.set_al(0);
		registers.halt = true;
		Ok(())
	}
}
