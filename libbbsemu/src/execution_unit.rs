use crate::cpu::{CpuCore, StepResult, HALT_SENTINEL};
use crate::error::{EmuError, Result};
use crate::far_ptr::FarPtr;
use crate::interrupts::InterruptHandler;
use crate::io::IoPortDevice;
use crate::memory::{MemoryCore, DYNAMIC_SEGMENT_LIMIT, STACK_BASE};
use crate::registers::CpuRegisters;

use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use std::sync::Arc;

/// What a native export hands back to the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnValue {
	/// Registers stay however the handler left them.
	None,
	/// AX.
	Word(u16),
	/// Low word in AX, high word in DX.
	DoubleWord(u32),
}

impl From<u16> for ReturnValue {
	fn from(value: u16) -> ReturnValue {
		ReturnValue::Word(value)
	}
}

impl From<u32> for ReturnValue {
	fn from(value: u32) -> ReturnValue {
		ReturnValue::DoubleWord(value)
	}
}

impl From<FarPtr> for ReturnValue {
	/// DX:AX = segment:offset.
	fn from(value: FarPtr) -> ReturnValue {
		ReturnValue::DoubleWord(value.to_u32())
	}
}

/// A natively implemented stand-in for one of the DLLs the guest imports.
///
/// The guest reaches it with a far call to `segment():ordinal`. Modules are
/// shared between every channel, so anything per-session has to be keyed by
/// the channel they're given.
pub trait ExportedModule: Send + Sync + std::fmt::Debug {
	fn name(&self) -> &str;
	fn segment(&self) -> u16;

	/// Called before every run that doesn't bypass state.
	fn set_state(&self, _channel: u16) -> Result<()> {
		Ok(())
	}

	fn invoke(&self, call: &mut HostCall<'_>, ordinal: u16) -> Result<ReturnValue>;

	/// Called on the primary module after a plain (argument-less) run.
	fn update_session(&self, _channel: u16) -> Result<()> {
		Ok(())
	}
}

/// Exported modules by segment. Built once, then shared read-only.
#[derive(Debug, Default)]
pub struct ModuleTable {
	modules: BTreeMap<u16, Arc<dyn ExportedModule>>,
	primary: Option<u16>,
}

impl ModuleTable {
	pub fn new() -> ModuleTable {
		ModuleTable::default()
	}

	/// The first module registered becomes the primary one.
	pub fn register(&mut self, module: Arc<dyn ExportedModule>) -> Result<()> {
		let segment = module.segment();
		if segment <= DYNAMIC_SEGMENT_LIMIT {
			return Err(EmuError::InvalidSegment { segment, reason: "module segments must be above the dynamic segment range" });
		}
		if segment == HALT_SENTINEL.segment {
			return Err(EmuError::InvalidSegment { segment, reason: "reserved for the halt sentinel" });
		}
		if self.modules.contains_key(&segment) {
			return Err(EmuError::DuplicateModule { segment });
		}
		tracing::debug!(name = module.name(), segment, "registered module");
		self.modules.insert(segment, module);
		self.primary.get_or_insert(segment);
		Ok(())
	}

	pub fn set_primary(&mut self, segment: u16) -> Result<()> {
		if !self.modules.contains_key(&segment) {
			return Err(EmuError::UnknownImportedModule { segment });
		}
		self.primary = Some(segment);
		Ok(())
	}

	pub fn get(&self, segment: u16) -> Option<&Arc<dyn ExportedModule>> {
		self.modules.get(&segment)
	}

	pub fn primary(&self) -> Option<&Arc<dyn ExportedModule>> {
		self.primary.and_then(|segment| self.modules.get(&segment))
	}

	pub fn segments(&self) -> impl Iterator<Item = u16> + '_ {
		self.modules.keys().copied()
	}

	pub fn modules(&self) -> impl Iterator<Item = &Arc<dyn ExportedModule>> {
		self.modules.values()
	}
}

#[derive(Debug, Clone, Copy)]
pub struct ExecuteOptions<'a> {
	pub channel: u16,
	/// Push a far return to the halt sentinel so a RETF ends the run.
	pub simulate_far_call: bool,
	/// Skip the `set_state`/`update_session` module hooks.
	pub bypass_state: bool,
	/// Pushed in order, so the last value ends up on top.
	pub stack_values: &'a [u16],
	pub stack_pointer: u16,
}

impl Default for ExecuteOptions<'_> {
	fn default() -> Self {
		ExecuteOptions { channel: 0, simulate_far_call: true, bypass_state: false, stack_values: &[], stack_pointer: STACK_BASE }
	}
}

/// Context handed to a module while it services a call.
#[derive(Debug)]
pub struct HostCall<'a> {
	unit: &'a mut ExecutionUnit,
	channel: u16,
}

impl<'a> HostCall<'a> {
	pub fn channel(&self) -> u16 {
		self.channel
	}

	pub fn registers(&self) -> &CpuRegisters {
		&self.unit.cpu.registers
	}

	pub fn registers_mut(&mut self) -> &mut CpuRegisters {
		&mut self.unit.cpu.registers
	}

	pub fn memory(&self) -> &MemoryCore {
		&self.unit.memory
	}

	pub fn memory_mut(&mut self) -> &mut MemoryCore {
		&mut self.unit.memory
	}

	/// The `index`th word argument, counting up from just above the far
	/// return address.
	pub fn argument(&self, index: u16) -> Result<u16> {
		let registers = self.registers();
		let offset = registers.sp.wrapping_add(4).wrapping_add(index.wrapping_mul(2));
		self.unit.memory.get_word((registers.ss, offset))
	}

	/// A far pointer argument spanning words `index` (offset) and `index + 1`.
	pub fn argument_ptr(&self, index: u16) -> Result<FarPtr> {
		Ok(FarPtr::new(self.argument(index + 1)?, self.argument(index)?))
	}

	/// Calls back into guest code. The caller's registers are put back
	/// afterwards; pick a `stack_pointer` clear of the caller's stack.
	pub fn execute(&mut self, entry: FarPtr, options: ExecuteOptions<'_>) -> Result<CpuRegisters> {
		self.unit.execute(entry, options)
	}
}

/// One CPU and its memory, bound to the shared module table.
#[derive(Debug)]
pub struct ExecutionUnit {
	cpu: CpuCore,
	memory: MemoryCore,
	modules: Arc<ModuleTable>,
	depth: usize,
}

impl ExecutionUnit {
	pub fn new(memory: MemoryCore, modules: Arc<ModuleTable>) -> ExecutionUnit {
		let mut cpu = CpuCore::new();
		for segment in modules.segments() {
			cpu.add_imported_segment(segment);
		}
		ExecutionUnit { cpu, memory, modules, depth: 0 }
	}

	pub fn with_interrupt(mut self, handler: Box<dyn InterruptHandler>) -> ExecutionUnit {
		self.cpu.register_interrupt(handler);
		self
	}

	pub fn with_port_device(mut self, ports: RangeInclusive<u16>, device: Box<dyn IoPortDevice>) -> Result<ExecutionUnit> {
		self.cpu.register_port_device(ports, device)?;
		Ok(self)
	}

	/// Marks `segment` as an import the image expects, whether or not the
	/// module table can serve it. Calls into it fail if it can't.
	pub fn add_imported_segment(&mut self, segment: u16) {
		self.cpu.add_imported_segment(segment);
	}

	pub fn memory(&self) -> &MemoryCore {
		&self.memory
	}

	pub fn memory_mut(&mut self) -> &mut MemoryCore {
		&mut self.memory
	}

	pub fn registers(&self) -> &CpuRegisters {
		&self.cpu.registers
	}

	pub fn modules(&self) -> &Arc<ModuleTable> {
		&self.modules
	}

	/// Runs guest code at `entry` until it halts and returns the final
	/// registers. Reentrant from inside a module handler.
	pub fn execute(&mut self, entry: FarPtr, options: ExecuteOptions<'_>) -> Result<CpuRegisters> {
		let span = tracing::debug_span!("execute", channel = options.channel, %entry, depth = self.depth);
		let _guard = span.enter();
		let outer = self.cpu.registers;
		self.depth += 1;
		let result = self.run_from(entry, &options);
		self.depth -= 1;
		if self.depth > 0 {
			self.cpu.registers = outer;
		}
		result
	}

	fn run_from(&mut self, entry: FarPtr, options: &ExecuteOptions<'_>) -> Result<CpuRegisters> {
		self.cpu.reset(options.stack_pointer);
		self.cpu.registers.cs = entry.segment;
		self.cpu.registers.ip = entry.offset;
		for value in options.stack_values {
			self.cpu.push(&mut self.memory, *value)?;
		}
		if options.simulate_far_call {
			self.cpu.registers.bp = self.cpu.registers.sp;
			self.cpu.push(&mut self.memory, 0xffff)?;
			self.cpu.push(&mut self.memory, 0xffff)?;
		}
		if !options.bypass_state {
			for module in self.modules.modules() {
				module.set_state(options.channel)?;
			}
		}
		self.run(options.channel)?;
		let registers = self.cpu.registers;
		if !options.bypass_state && options.stack_values.is_empty() {
			if let Some(primary) = self.modules.primary() {
				primary.update_session(options.channel)?;
			}
		}
		Ok(registers)
	}

	/// Runs from an already prepared register file, for loaded programs.
	pub fn start(&mut self, registers: CpuRegisters, channel: u16) -> Result<CpuRegisters> {
		let span = tracing::debug_span!("start", channel, entry = %registers.cs_ip());
		let _guard = span.enter();
		self.cpu.registers = registers;
		self.depth += 1;
		let result = self.run(channel);
		self.depth -= 1;
		result.map(|_| self.cpu.registers)
	}

	fn run(&mut self, channel: u16) -> Result<()> {
		loop {
			match self.cpu.tick(&mut self.memory)? {
				StepResult::Executed => {}
				StepResult::Halted => return Ok(()),
				StepResult::ExternalCall(at) => self.external_call(at, channel)?,
			}
		}
	}

	fn external_call(&mut self, at: FarPtr, channel: u16) -> Result<()> {
		let module = self.modules.get(at.segment).cloned()
			.ok_or(EmuError::UnknownImportedModule { segment: at.segment })?;
		tracing::trace!(module = module.name(), ordinal = at.offset, "host call");
		let value = module.invoke(&mut HostCall { unit: self, channel }, at.offset)?;
		match value {
			ReturnValue::None => {}
			ReturnValue::Word(value) => self.cpu.registers.ax = value,
			ReturnValue::DoubleWord(value) => self.cpu.registers.set_dx_ax(value),
		}
		self.cpu.far_return(&self.memory, 0)
	}
}
