pub mod pit;

use crate::error::{EmuError, Result};

use std::ops::RangeInclusive;

/// A device reached through `IN`/`OUT`.
pub trait IoPortDevice: Send + std::fmt::Debug {
	fn read(&mut self, port: u16) -> Result<u8>;
	fn write(&mut self, port: u16, value: u8) -> Result<()>;
}

#[derive(Debug)]
struct MappedDevice {
	ports: RangeInclusive<u16>,
	device: Box<dyn IoPortDevice>,
}

/// Port number to device dispatch. Ports nobody registered are an error,
/// never a silent zero.
#[derive(Debug, Default)]
pub struct IoPortBus {
	devices: Vec<MappedDevice>,
}

impl IoPortBus {
	pub fn new() -> IoPortBus {
		IoPortBus { devices: vec![] }
	}

	/// Maps `device` over a contiguous range of ports that nothing else has.
	pub fn register(&mut self, ports: RangeInclusive<u16>, device: Box<dyn IoPortDevice>) -> Result<()> {
		let overlaps = self.devices.iter()
			.any(|mapped| ports.start() <= mapped.ports.end() && ports.end() >= mapped.ports.start());
		if overlaps {
			return Err(EmuError::PortConflict { start: *ports.start(), end: *ports.end() });
		}
		tracing::debug!(start = *ports.start(), end = *ports.end(), ?device, "mapped port device");
		self.devices.push(MappedDevice { ports, device });
		Ok(())
	}

	fn device_for(&mut self, port: u16) -> Result<&mut Box<dyn IoPortDevice>> {
		self.devices.iter_mut()
			.find(|mapped| mapped.ports.contains(&port))
			.map(|mapped| &mut mapped.device)
			.ok_or(EmuError::UnhandledPort { port })
	}

	pub fn read_byte(&mut self, port: u16) -> Result<u8> {
		let value = self.device_for(port)?.read(port)?;
		tracing::trace!(port, value, "port in");
		Ok(value)
	}

	pub fn write_byte(&mut self, port: u16, value: u8) -> Result<()> {
		tracing::trace!(port, value, "port out");
		self.device_for(port)?.write(port, value)
	}

	/// Word access touches `port` then `port + 1`.
	pub fn read_word(&mut self, port: u16) -> Result<u16> {
		let low = self.read_byte(port)?;
		let high = self.read_byte(port.wrapping_add(1))?;
		Ok(u16::from_le_bytes([low, high]))
	}

	pub fn write_word(&mut self, port: u16, value: u16) -> Result<()> {
		let [low, high] = value.to_le_bytes();
		self.write_byte(port, low)?;
		self.write_byte(port.wrapping_add(1), high)
	}
}
