use crate::clock::Clock;
use crate::dos_file_system::DosFileSystem;
use crate::error::{EmuError, Result};
use crate::exe_loader::ExecutableImage;
use crate::execution_unit::{ExecutionUnit, ModuleTable};
use crate::interrupts::int1ah::Int1Ah;
use crate::interrupts::int20h::Int20h;
use crate::interrupts::int21h::{Int21h, PSP_SEGMENT_VARIABLE};
use crate::io::pit::{ProgrammableIntervalTimer, PIT_PORTS};
use crate::memory::{MemoryCore, SegmentKind};
use crate::registers::CpuRegisters;

use std::io::Write;
use std::sync::Arc;

// https://en.wikipedia.org/wiki/Program_Segment_Prefix

const PSP_EXIT_CALL: usize = 0x00;
const PSP_MEMORY_TOP: usize = 0x02;
const PSP_ENVIRONMENT_SEGMENT: usize = 0x2c;
const PSP_COMMAND_TAIL_LENGTH: usize = 0x80;
const PSP_COMMAND_TAIL: usize = 0x81;
// Bytes 0x81-0xff, less the 0x0d terminator.
const MAX_COMMAND_TAIL: usize = 126;
// Segment after the memory allocated to the program.
const MEMORY_TOP_SEGMENT: u16 = 0xa000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExeRuntimeConfig {
	/// Where the program claims to have been loaded from, for the
	/// environment block.
	pub program_path: String,
	pub environment: Vec<(String, String)>,
	pub channel: u16,
}

impl Default for ExeRuntimeConfig {
	fn default() -> ExeRuntimeConfig {
		ExeRuntimeConfig {
			program_path: "C:\\BBSV6\\PROGRAM.EXE".to_string(),
			environment: vec![
				("COMSPEC".to_string(), "C:\\COMMAND.COM".to_string()),
				("PATH".to_string(), "C:\\BBSV6".to_string()),
			],
			channel: 0,
		}
	}
}

/// Runs a standalone DOS executable: places its segments, builds the PSP
/// and environment, then drives the execution unit until it exits.
#[derive(Debug)]
pub struct ExeRuntime {
	config: ExeRuntimeConfig,
	image: ExecutableImage,
	unit: ExecutionUnit,
	initial_registers: Option<CpuRegisters>,
}

impl ExeRuntime {
	pub fn new(config: ExeRuntimeConfig, image: ExecutableImage, unit: ExecutionUnit) -> ExeRuntime {
		ExeRuntime { config, image, unit, initial_registers: None }
	}

	/// The usual DOS machine: INT 20h, INT 21h, INT 1Ah and the timer.
	pub fn with_dos(
		config: ExeRuntimeConfig,
		image: ExecutableImage,
		modules: Arc<ModuleTable>,
		clock: Arc<dyn Clock>,
		file_system: Box<dyn DosFileSystem>,
		console: Box<dyn Write + Send>,
	) -> Result<ExeRuntime> {
		let unit = ExecutionUnit::new(MemoryCore::new(), modules)
			.with_interrupt(Box::new(Int20h))
			.with_interrupt(Box::new(Int21h::new(clock.clone(), file_system, console)))
			.with_interrupt(Box::new(Int1Ah::new(clock.clone())))
			.with_port_device(PIT_PORTS, Box::new(ProgrammableIntervalTimer::new(clock)))?;
		Ok(ExeRuntime::new(config, image, unit))
	}

	pub fn unit(&self) -> &ExecutionUnit {
		&self.unit
	}

	pub fn initial_registers(&self) -> Option<&CpuRegisters> {
		self.initial_registers.as_ref()
	}

	/// Loads the image into fresh memory with `args` as the command tail.
	/// Until a load succeeds there is nothing to `run`.
	pub fn load(&mut self, args: &[String]) -> Result<()> {
		self.initial_registers = None;
		let tail = build_command_tail(args)?;
		let memory = self.unit.memory_mut();
		memory.clear();

		let mut ordinals = Vec::with_capacity(self.image.segments.len());
		for segment in &self.image.segments {
			let ordinal = memory.allocate_segment(segment.kind)?;
			memory.load_segment(ordinal, segment.kind, &segment.data)?;
			ordinals.push(ordinal);
		}
		let ordinal = |index: usize| {
			ordinals.get(index).copied()
				.ok_or_else(|| EmuError::InvalidImage(format!("segment index {} out of range", index)))
		};
		for relocation in &self.image.relocations {
			memory.set_word((ordinal(relocation.segment_index)?, relocation.offset), ordinal(relocation.target_index)?)?;
		}

		let environment = build_environment(&self.config);
		let environment_segment = memory.allocate_segment(SegmentKind::Data)?;
		memory.set_array((environment_segment, 0), &environment)?;

		let psp_segment = memory.allocate_segment(SegmentKind::Data)?;
		// INT 20h
		memory.set_array((psp_segment, PSP_EXIT_CALL as u16), &[0xcd, 0x20])?;
		memory.set_word((psp_segment, PSP_MEMORY_TOP as u16), MEMORY_TOP_SEGMENT)?;
		memory.set_word((psp_segment, PSP_ENVIRONMENT_SEGMENT as u16), environment_segment)?;
		memory.set_byte((psp_segment, PSP_COMMAND_TAIL_LENGTH as u16), tail.len() as u8)?;
		memory.set_array((psp_segment, PSP_COMMAND_TAIL as u16), &tail)?;
		memory.set_byte((psp_segment, (PSP_COMMAND_TAIL + tail.len()) as u16), 0x0d)?;
		let psp_variable = memory.allocate_variable(PSP_SEGMENT_VARIABLE, 2)?;
		memory.set_word(psp_variable, psp_segment)?;

		let mut registers = CpuRegisters::new();
		registers.reset(self.image.stack.offset);
		registers.ss = ordinal(self.image.stack.segment_index)?;
		registers.cs = ordinal(self.image.entry.segment_index)?;
		registers.ip = self.image.entry.offset;
		registers.ds = psp_segment;
		registers.es = psp_segment;
		tracing::debug!(entry = %registers.cs_ip(), stack = %registers.ss_sp(), psp_segment, environment_segment, "loaded executable");
		self.initial_registers = Some(registers);
		Ok(())
	}

	/// Runs the loaded program to completion and returns its exit code (AL).
	pub fn run(&mut self) -> Result<u8> {
		let registers = self.initial_registers.ok_or(EmuError::NotLoaded)?;
		let registers = self.unit.start(registers, self.config.channel)?;
		Ok(registers.al())
	}
}

/// `KEY=VALUE\0` strings, an empty string, a word count of 1 and then the
/// program path.
fn build_environment(config: &ExeRuntimeConfig) -> Vec<u8> {
	let mut block = vec![];
	for (key, value) in &config.environment {
		block.extend(format!("{}={}", key, value).bytes());
		block.push(0);
	}
	if config.environment.is_empty() {
		block.push(0);
	}
	block.push(0);
	block.extend(1u16.to_le_bytes());
	block.extend(config.program_path.bytes());
	block.push(0);
	block
}

fn build_command_tail(args: &[String]) -> Result<Vec<u8>> {
	let mut tail = vec![];
	for arg in args {
		tail.push(b' ');
		tail.extend(arg.bytes());
	}
	if tail.len() > MAX_COMMAND_TAIL {
		return Err(EmuError::CommandLineTooLong(tail.len()));
	}
	Ok(tail)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test] fn test_environment_block() {
		let config = ExeRuntimeConfig {
			program_path: "C:\\A.EXE".to_string(),
			environment: vec![("X".to_string(), "1".to_string())],
			channel: 0,
		};
		assert_eq!(build_environment(&config), b"X=1\0\0\x01\x00C:\\A.EXE\0");
		let empty = ExeRuntimeConfig { environment: vec![], ..config };
		assert_eq!(build_environment(&empty), b"\0\0\x01\x00C:\\A.EXE\0");
	}

	#[test] fn test_command_tail() {
		assert_eq!(build_command_tail(&["/N1".to_string(), "X".to_string()]).unwrap(), b" /N1 X");
		assert_eq!(build_command_tail(&[]).unwrap(), b"");
		assert!(matches!(build_command_tail(&["x".repeat(200)]), Err(EmuError::CommandLineTooLong(201))));
	}

	#[test] fn test_run_before_load() {
		let image = ExecutableImage::from_mz_bytes(&crate::exe_loader::tests::build_mz(&[0xf4], &[], (0, 0), (0, 0x100))).unwrap();
		let unit = ExecutionUnit::new(MemoryCore::new(), Arc::new(ModuleTable::new()));
		let mut runtime = ExeRuntime::new(ExeRuntimeConfig::default(), image, unit);
		assert!(matches!(runtime.run(), Err(EmuError::NotLoaded)));
		runtime.load(&[]).unwrap();
		assert_eq!(runtime.run().unwrap(), 0);
	}

	#[test] fn test_failed_reload_forgets_previous_load() {
		let image = ExecutableImage::from_mz_bytes(&crate::exe_loader::tests::build_mz(&[0xf4], &[], (0, 0), (0, 0x100))).unwrap();
		let unit = ExecutionUnit::new(MemoryCore::new(), Arc::new(ModuleTable::new()));
		let mut runtime = ExeRuntime::new(ExeRuntimeConfig::default(), image, unit);
		runtime.load(&[]).unwrap();
		let code_segment = runtime.initial_registers().unwrap().cs;
		assert!(matches!(runtime.load(&["x".repeat(200)]), Err(EmuError::CommandLineTooLong(201))));
		assert!(runtime.initial_registers().is_none());
		assert!(matches!(runtime.run(), Err(EmuError::NotLoaded)));
		// The rejected command line didn't get as far as touching memory.
		assert!(runtime.unit().memory().has_segment(code_segment));
	}
}
