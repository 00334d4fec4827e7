use crate::clock::Clock;
use crate::error::{EmuError, Result};
use crate::io::IoPortDevice;

use std::ops::RangeInclusive;
use std::sync::Arc;

// https://wiki.osdev.org/Programmable_Interval_Timer

/// The 8253/8254 input clock: a third of the NTSC colour burst frequency.
pub const PIT_FREQUENCY: f64 = 3_579_545.0 / 3.0;

pub const PIT_CHANNEL_0_PORT: u16 = 0x40;
pub const PIT_CONTROL_PORT: u16 = 0x43;
pub const PIT_PORTS: RangeInclusive<u16> = PIT_CHANNEL_0_PORT..=PIT_CONTROL_PORT;

const CHANNEL_COUNT: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
	Latch,
	LowByte,
	HighByte,
	LowThenHigh,
}

impl AccessMode {
	fn from_bits(bits: u8) -> AccessMode {
		match bits & 0b11 {
			0 => AccessMode::Latch,
			1 => AccessMode::LowByte,
			2 => AccessMode::HighByte,
			_ => AccessMode::LowThenHigh,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelConfig {
	pub access_mode: AccessMode,
	/// 0-5. 6 and 7 are folded into 2 and 3 when written.
	pub operating_mode: u8,
	// Which half the next alternating read returns. Only reset by control writes.
	sequence: u32,
	latched: Option<u16>,
}

impl Default for ChannelConfig {
	fn default() -> ChannelConfig {
		// What the BIOS leaves channel 0 as: square wave, low then high byte.
		ChannelConfig { access_mode: AccessMode::LowThenHigh, operating_mode: 3, sequence: 0, latched: None }
	}
}

impl ChannelConfig {
	fn next_byte(&mut self, value: u16) -> u8 {
		let [low, high] = value.to_le_bytes();
		let byte = if self.sequence % 2 == 0 { low } else { high };
		self.sequence = self.sequence.wrapping_add(1);
		byte
	}
}

/// Free running counters derived from the host clock. Nothing counts down in
/// the background; every read works the count out from the current tick.
#[derive(Debug)]
pub struct ProgrammableIntervalTimer {
	clock: Arc<dyn Clock>,
	channels: [ChannelConfig; CHANNEL_COUNT],
}

impl ProgrammableIntervalTimer {
	pub fn new(clock: Arc<dyn Clock>) -> ProgrammableIntervalTimer {
		ProgrammableIntervalTimer { clock, channels: [ChannelConfig::default(); CHANNEL_COUNT] }
	}

	pub fn channel(&self, index: usize) -> Option<&ChannelConfig> {
		self.channels.get(index)
	}

	fn current_count(&self) -> u16 {
		let fraction = self.clock.current_tick().fract();
		(PIT_FREQUENCY * (1.0 - fraction)) as u32 as u16
	}

	fn write_control(&mut self, value: u8) -> Result<()> {
		if value & 1 != 0 {
			return Err(EmuError::InvalidTimerAccess { port: PIT_CONTROL_PORT, reason: "BCD counting is not supported" });
		}
		let channel = (value >> 6) as usize;
		if channel >= CHANNEL_COUNT {
			return Err(EmuError::InvalidTimerAccess { port: PIT_CONTROL_PORT, reason: "read-back command is not supported" });
		}
		let access_mode = AccessMode::from_bits(value >> 4);
		let mut operating_mode = (value >> 1) & 0b111;
		if operating_mode > 5 {
			operating_mode -= 4;
		}
		tracing::trace!(channel, ?access_mode, operating_mode, "pit control write");
		// A latch takes its value on the first read after the command.
		self.channels[channel] = ChannelConfig { access_mode, operating_mode, sequence: 0, latched: None };
		Ok(())
	}

	fn read_channel(&mut self, channel: usize) -> u8 {
		let count = self.current_count();
		let config = &mut self.channels[channel];
		match config.access_mode {
			AccessMode::LowByte => count as u8,
			AccessMode::HighByte => (count >> 8) as u8,
			AccessMode::LowThenHigh => config.next_byte(count),
			AccessMode::Latch => {
				let latched = *config.latched.get_or_insert(count);
				config.next_byte(latched)
			}
		}
	}
}

impl IoPortDevice for ProgrammableIntervalTimer {
	fn read(&mut self, port: u16) -> Result<u8> {
		match port {
			0x40..=0x42 => Ok(self.read_channel((port - PIT_CHANNEL_0_PORT) as usize)),
			_ => Err(EmuError::InvalidTimerAccess { port, reason: "port can't be read" }),
		}
	}

	fn write(&mut self, port: u16, value: u8) -> Result<()> {
		match port {
			PIT_CONTROL_PORT => self.write_control(value),
			_ => Err(EmuError::InvalidTimerAccess { port, reason: "only the control port can be written" }),
		}
	}
}
