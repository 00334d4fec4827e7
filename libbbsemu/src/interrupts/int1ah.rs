use crate::clock::Clock;
use crate::error::{EmuError, Result};
use crate::interrupts::{to_bcd, InterruptHandler};
use crate::memory::MemoryCore;
use crate::registers::{CpuRegisters, Flags};

use std::sync::Arc;

// http://stanislavs.org/helppc/int_1a.html

pub const INT_1AH: u8 = 0x1a;

// 1193182 / 65536: how often the BIOS timer interrupt would have fired.
const BIOS_TICKS_PER_SECOND: f64 = 18.2065;

/// Real-time clock and tick counter services.
#[derive(Debug)]
pub struct Int1Ah {
	clock: Arc<dyn Clock>,
}

impl Int1Ah {
	pub fn new(clock: Arc<dyn Clock>) -> Int1Ah {
		Int1Ah { clock }
	}
}

impl InterruptHandler for Int1Ah {
	fn vector(&self) -> u8 {
		INT_1AH
	}

	fn handle(&mut self, registers: &mut CpuRegisters, _memory: &mut MemoryCore) -> Result<()> {
		let function = registers.ah();
		let now = self.clock.now();
		match function {
			0x00 => {
				// Ticks since midnight in CX:DX. AL is the "midnight passed" flag.
				let seconds = now.time().as_hms_nano();
				let seconds = seconds.0 as f64 * 3600.0 + seconds.1 as f64 * 60.0 + seconds.2 as f64 + seconds.3 as f64 / 1e9;
				let ticks = (seconds * BIOS_TICKS_PER_SECOND) as u32;
				registers.cx = (ticks >> 16) as u16;
				registers.dx = ticks as u16;
				registers.set_al(0);
			}
			0x02 => {
				registers.set_ch(to_bcd(now.hour()));
				registers.set_cl(to_bcd(now.minute()));
				registers.set_dh(to_bcd(now.second()));
				// No daylight saving.
				registers.set_dl(0);
				registers.set_flag(Flags::CARRY, false);
			}
			0x04 => {
				let year = now.year().clamp(0, 9999) as u16;
				registers.set_ch(to_bcd((year / 100) as u8));
				registers.set_cl(to_bcd((year % 100) as u8));
				registers.set_dh(to_bcd(u8::from(now.month())));
				registers.set_dl(to_bcd(now.day()));
				registers.set_flag(Flags::CARRY, false);
			}
			_ => return Err(EmuError::UnsupportedBiosFunction { vector: INT_1AH, function }),
		}
		Ok(())
	}
}
