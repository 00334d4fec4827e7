use crate::clock::Clock;
use crate::dos_error_codes::DosErrorCode;
use crate::dos_file_system::{DosFileAccessMode, DosFileSeekOrigin, DosFileSystem};
use crate::error::{EmuError, Result};
use crate::far_ptr::FarPtr;
use crate::interrupts::InterruptHandler;
use crate::memory::{MemoryCore, SegmentKind, SEGMENT_SIZE};
use crate::registers::{CpuRegisters, Flags};

use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::sync::Arc;

// http://spike.scu.edu.au/~barry/interrupts.html
// http://stanislavs.org/helppc/int_21.html

pub const INT_21H: u8 = 0x21;

/// Name of the variable holding the PSP segment. The loader writes it, AH=62
/// reads it back (and creates it when nothing was loaded).
pub const PSP_SEGMENT_VARIABLE: &str = "INT21H-PSP-SEGMENT";
/// The default 128 byte DTA, allocated on first use.
pub const DTA_VARIABLE: &str = "INT21H-DTA";
/// Far pointer to a DTA the program set with AH=1A.
pub const DTA_POINTER_VARIABLE: &str = "INT21H-DTA-POINTER";
pub const DTA_BYTES: usize = 128;

pub const CURRENT_DIRECTORY: &[u8] = b"BBSV6";
// Drive C.
const DEFAULT_DRIVE: u8 = 2;
const DOS_VERSION: (u8, u8) = (6, 22);

const STDOUT_HANDLE: u16 = 1;
const STDERR_HANDLE: u16 = 2;
const LAST_DEVICE_HANDLE: u16 = 4;

// IOCTL device information words.
const DEVICE_INFO_CONSOLE: u16 = 0x80d3;
const DEVICE_INFO_DRIVE_C_FILE: u16 = 0x0002;

/// DOS services.
pub struct Int21h {
	clock: Arc<dyn Clock>,
	file_system: Box<dyn DosFileSystem>,
	console: Box<dyn Write + Send>,
	// AH=25/35. Nothing dispatches through these, programs only read back
	// what they stored.
	vectors: HashMap<u8, FarPtr>,
}

impl fmt::Debug for Int21h {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Int21h")
			.field("file_system", &self.file_system)
			.field("vectors", &self.vectors)
			.finish_non_exhaustive()
	}
}

fn set_dos_result(registers: &mut CpuRegisters, result: std::result::Result<u16, DosErrorCode>) {
	match result {
		Ok(value) => {
			registers.set_flag(Flags::CARRY, false);
			registers.ax = value;
		}
		Err(error_code) => {
			tracing::debug!(?error_code, "DOS call failed");
			registers.set_flag(Flags::CARRY, true);
			registers.ax = error_code.code();
		}
	}
}

impl Int21h {
	pub fn new(clock: Arc<dyn Clock>, file_system: Box<dyn DosFileSystem>, console: Box<dyn Write + Send>) -> Int21h {
		Int21h { clock, file_system, console, vectors: HashMap::new() }
	}

	// Kept in variables, so clearing memory forgets them.
	fn dta(memory: &mut MemoryCore) -> Result<FarPtr> {
		if let Some(variable) = memory.try_get_variable_pointer(DTA_POINTER_VARIABLE) {
			return memory.get_pointer(variable);
		}
		if let Some(dta) = memory.try_get_variable_pointer(DTA_VARIABLE) {
			return Ok(dta);
		}
		let dta = memory.allocate_variable(DTA_VARIABLE, DTA_BYTES)?;
		tracing::debug!(%dta, "allocated default DTA");
		Ok(dta)
	}

	fn set_dta(memory: &mut MemoryCore, dta: FarPtr) -> Result<()> {
		let variable = match memory.try_get_variable_pointer(DTA_POINTER_VARIABLE) {
			Some(variable) => variable,
			None => memory.allocate_variable(DTA_POINTER_VARIABLE, 4)?,
		};
		memory.set_pointer(variable, dta)
	}

	fn psp_segment(memory: &mut MemoryCore) -> Result<u16> {
		if let Some(variable) = memory.try_get_variable_pointer(PSP_SEGMENT_VARIABLE) {
			return memory.get_word(variable);
		}
		let segment = memory.allocate_segment(SegmentKind::Data)?;
		let variable = memory.allocate_variable(PSP_SEGMENT_VARIABLE, 2)?;
		memory.set_word(variable, segment)?;
		tracing::debug!(segment, "allocated PSP segment");
		Ok(segment)
	}

	fn write_console(&mut self, bytes: &[u8]) -> Result<()> {
		self.console.write_all(bytes)?;
		self.console.flush()?;
		Ok(())
	}

	fn find_file(&mut self, registers: &mut CpuRegisters, memory: &mut MemoryCore, first: bool) -> Result<()> {
		let dta = Int21h::dta(memory)?;
		let mut buffer = memory.get_array(dta, DTA_BYTES)?.to_vec();
		let result = if first {
			let search_spec = memory.get_string(registers.ds_dx())?;
			self.file_system.find_first_file(&mut buffer, registers.cx, &search_spec)
		} else {
			self.file_system.find_next_file(&mut buffer)
		};
		memory.set_array(dta, &buffer)?;
		set_dos_result(registers, result.map(|_| 0));
		Ok(())
	}
}

impl InterruptHandler for Int21h {
	fn vector(&self) -> u8 {
		INT_21H
	}

	fn handle(&mut self, registers: &mut CpuRegisters, memory: &mut MemoryCore) -> Result<()> {
		let function = registers.ah();
		tracing::trace!(function, "int 21h");
		match function {
			0x02 => {
				// Display character in DL.
				let character = registers.dl();
				self.write_console(&[character])?;
				registers.set_al(character);
			}
			0x09 => {
				// Display a $ terminated string at DS:DX.
				let start = registers.ds_dx();
				let rest = memory.get_array(start, SEGMENT_SIZE - start.offset as usize)?;
				let end = rest.iter().position(|b| *b == b'$').unwrap_or(rest.len());
				let text = rest[..end].to_vec();
				self.write_console(&text)?;
				registers.set_al(b'$');
			}
			0x19 => {
				registers.set_al(DEFAULT_DRIVE);
			}
			0x1a => {
				Int21h::set_dta(memory, registers.ds_dx())?;
			}
			0x25 => {
				// Set interrupt vector AL to DS:DX.
				self.vectors.insert(registers.al(), registers.ds_dx());
			}
			0x2a => {
				// Get date.
				let now = self.clock.now();
				registers.cx = now.year().clamp(0, u16::MAX as i32) as u16;
				registers.set_dh(u8::from(now.month()));
				registers.set_dl(now.day());
				registers.set_al(now.weekday().number_days_from_sunday());
			}
			0x2c => {
				// Get time.
				let now = self.clock.now();
				registers.set_ch(now.hour());
				registers.set_cl(now.minute());
				registers.set_dh(now.second());
				registers.set_dl((now.nanosecond() / 10_000_000) as u8);
			}
			0x2f => {
				let dta = Int21h::dta(memory)?;
				registers.es = dta.segment;
				registers.bx = dta.offset;
			}
			0x30 => {
				registers.set_al(DOS_VERSION.0);
				registers.set_ah(DOS_VERSION.1);
				registers.bx = 0;
				registers.cx = 0;
			}
			0x33 => {
				// Ctrl-Break checking is always off, and setting it is ignored.
				registers.set_dl(0);
			}
			0x35 => {
				// Get interrupt vector AL into ES:BX.
				let vector = self.vectors.get(&registers.al()).copied().unwrap_or(FarPtr::NULL);
				registers.es = vector.segment;
				registers.bx = vector.offset;
			}
			0x3c => {
				// CREATE
				let filename = memory.get_string(registers.ds_dx())?;
				let result = self.file_system.create(&filename, registers.cx);
				set_dos_result(registers, result);
			}
			0x3d => {
				// OPEN
				let filename = memory.get_string(registers.ds_dx())?;
				let result = match DosFileAccessMode::from_al(registers.al()) {
					Some(access_mode) => self.file_system.open(&filename, access_mode),
					None => Err(DosErrorCode::InvalidFileAccessMode),
				};
				set_dos_result(registers, result);
			}
			0x3e => {
				// CLOSE
				let handle = registers.bx;
				let result = if handle <= LAST_DEVICE_HANDLE { Ok(()) } else { self.file_system.close(handle) };
				set_dos_result(registers, result.map(|_| 0));
			}
			0x3f => {
				// READ
				let destination = registers.ds_dx();
				let count = registers.cx as usize;
				if destination.offset as usize + count > SEGMENT_SIZE {
					set_dos_result(registers, Err(DosErrorCode::InsufficientMemory));
				} else {
					let mut buffer = vec![0u8; count];
					let result = self.file_system.read(registers.bx, &mut buffer);
					if let Ok(read_count) = result {
						memory.set_array(destination, &buffer[..read_count as usize])?;
					}
					set_dos_result(registers, result);
				}
			}
			0x40 => {
				// WRITE
				let data = memory.get_array(registers.ds_dx(), registers.cx as usize)?.to_vec();
				let result = match registers.bx {
					STDOUT_HANDLE | STDERR_HANDLE => {
						self.write_console(&data)?;
						Ok(data.len() as u16)
					}
					_ => self.file_system.write(registers.bx, &data),
				};
				set_dos_result(registers, result);
			}
			0x42 => {
				// SEEK
				let offset = ((registers.cx as u32) << 16) | registers.dx as u32;
				let result = match DosFileSeekOrigin::from_al(registers.al()) {
					Some(origin) => self.file_system.seek(registers.bx, offset, origin),
					None => Err(DosErrorCode::InvalidFunction),
				};
				match result {
					Ok(position) => {
						registers.set_flag(Flags::CARRY, false);
						registers.set_dx_ax(position);
					}
					Err(error_code) => set_dos_result(registers, Err(error_code)),
				}
			}
			0x44 => {
				// I/O control, only "get device information" is supported.
				if registers.al() != 0x00 {
					return Err(EmuError::UnsupportedDosFunction { function });
				}
				registers.dx = if registers.bx <= LAST_DEVICE_HANDLE { DEVICE_INFO_CONSOLE } else { DEVICE_INFO_DRIVE_C_FILE };
				registers.set_flag(Flags::CARRY, false);
			}
			0x47 => {
				// Get current directory into DS:SI, without the drive or leading slash.
				let mut path = CURRENT_DIRECTORY.to_vec();
				path.push(0);
				memory.set_array((registers.ds, registers.si), &path)?;
				registers.set_flag(Flags::CARRY, false);
			}
			0x4a => {
				// Resize memory block. Every segment is already 64KiB.
				registers.set_flag(Flags::CARRY, false);
			}
			0x4c => {
				tracing::debug!(exit_code = registers.al(), "program terminated");
				registers.halt = true;
			}
			0x4e => {
				self.find_file(registers, memory, true)?;
			}
			0x4f => {
				self.find_file(registers, memory, false)?;
			}
			0x62 => {
				registers.bx = Int21h::psp_segment(memory)?;
			}
			_ => return Err(EmuError::UnsupportedDosFunction { function }),
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::clock::FakeClock;
	use crate::dos_file_system::StandardDosFileSystem;
	use crate::memory::{DYNAMIC_SEGMENT_BASE, VARIABLES_SEGMENT};
	use std::sync::Mutex;
	use time::macros::datetime;

	#[derive(Clone, Default)]
	struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

	impl Write for SharedBuffer {
		fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
			self.0.lock().unwrap().extend_from_slice(buf);
			Ok(buf.len())
		}

		fn flush(&mut self) -> std::io::Result<()> {
			Ok(())
		}
	}

	struct Fixture {
		handler: Int21h,
		memory: MemoryCore,
		console: SharedBuffer,
		_dir: tempfile::TempDir,
	}

	impl Fixture {
		fn new() -> Fixture {
			let dir = tempfile::tempdir().unwrap();
			let clock = Arc::new(FakeClock::new(0.0, datetime!(2024-02-29 23:59:58.25)));
			let console = SharedBuffer::default();
			let file_system = Box::new(StandardDosFileSystem::new(dir.path().to_path_buf()));
			let handler = Int21h::new(clock, file_system, Box::new(console.clone()));
			let mut memory = MemoryCore::new();
			memory.add_segment(0x0100, SegmentKind::Data, &[]).unwrap();
			Fixture { handler, memory, console, _dir: dir }
		}

		fn call(&mut self, registers: &mut CpuRegisters) -> Result<()> {
			self.handler.handle(registers, &mut self.memory)
		}

		fn console_text(&self) -> Vec<u8> {
			self.console.0.lock().unwrap().clone()
		}
	}

	fn with_ah(ah: u8) -> CpuRegisters {
		CpuRegisters { ax: (ah as u16) << 8, ds: 0x0100, ..CpuRegisters::default() }
	}

	#[test] fn test_get_dta_allocates_default() {
		let mut fixture = Fixture::new();
		let mut registers = with_ah(0x2f);
		fixture.call(&mut registers).unwrap();
		assert_eq!(registers.es, VARIABLES_SEGMENT);
		assert_eq!(FarPtr::new(registers.es, registers.bx), fixture.memory.get_variable_pointer(DTA_VARIABLE).unwrap());
		// Asking again doesn't allocate again.
		let mut again = with_ah(0x2f);
		fixture.call(&mut again).unwrap();
		assert_eq!((again.es, again.bx), (registers.es, registers.bx));
	}

	#[test] fn test_set_dta_then_get() {
		let mut fixture = Fixture::new();
		let mut registers = with_ah(0x1a);
		registers.dx = 0x0080;
		fixture.call(&mut registers).unwrap();
		let mut registers = with_ah(0x2f);
		fixture.call(&mut registers).unwrap();
		assert_eq!((registers.es, registers.bx), (0x0100, 0x0080));
		assert_eq!(fixture.memory.try_get_variable_pointer(DTA_VARIABLE), None);
	}

	#[test] fn test_dta_forgotten_when_memory_cleared() {
		let mut fixture = Fixture::new();
		let mut registers = with_ah(0x2f);
		fixture.call(&mut registers).unwrap();
		let first = FarPtr::new(registers.es, registers.bx);

		fixture.memory.clear();
		let buffer = fixture.memory.allocate_variable("MODULE-BUFFER", 64).unwrap();
		assert_eq!(buffer, first);
		let mut registers = with_ah(0x2f);
		fixture.call(&mut registers).unwrap();
		let dta = FarPtr::new(registers.es, registers.bx);
		assert_eq!(dta, buffer.wrapping_add(64));
		assert_eq!(fixture.memory.get_variable_pointer(DTA_VARIABLE).unwrap(), dta);

		let mut registers = with_ah(0x1a);
		registers.dx = 0x0080;
		fixture.call(&mut registers).unwrap();
		fixture.memory.clear();
		let mut registers = with_ah(0x2f);
		fixture.call(&mut registers).unwrap();
		assert_eq!(FarPtr::new(registers.es, registers.bx), fixture.memory.get_variable_pointer(DTA_VARIABLE).unwrap());
	}

	#[test] fn test_get_date_and_time() {
		let mut fixture = Fixture::new();
		let mut registers = with_ah(0x2a);
		fixture.call(&mut registers).unwrap();
		assert_eq!((registers.cx, registers.dh(), registers.dl()), (2024, 2, 29));
		// A Thursday.
		assert_eq!(registers.al(), 4);
		let mut registers = with_ah(0x2c);
		fixture.call(&mut registers).unwrap();
		assert_eq!((registers.ch(), registers.cl(), registers.dh(), registers.dl()), (23, 59, 58, 25));
	}

	#[test] fn test_fixed_answers() {
		let mut fixture = Fixture::new();
		let mut registers = with_ah(0x19);
		fixture.call(&mut registers).unwrap();
		assert_eq!(registers.al(), 2);

		let mut registers = with_ah(0x47);
		registers.si = 0x0200;
		fixture.call(&mut registers).unwrap();
		assert_eq!(fixture.memory.get_string((0x0100, 0x0200)).unwrap(), b"BBSV6");
		assert!(!registers.carry());
	}

	#[test] fn test_psp_is_allocated_once() {
		let mut fixture = Fixture::new();
		let mut registers = with_ah(0x62);
		fixture.call(&mut registers).unwrap();
		let psp = registers.bx;
		assert!(psp >= DYNAMIC_SEGMENT_BASE);
		assert!(fixture.memory.has_segment(psp));
		let mut registers = with_ah(0x62);
		fixture.call(&mut registers).unwrap();
		assert_eq!(registers.bx, psp);
	}

	#[test] fn test_console_output() {
		let mut fixture = Fixture::new();
		fixture.memory.set_array((0x0100, 0x10), b"Hello$ignored").unwrap();
		let mut registers = with_ah(0x09);
		registers.dx = 0x10;
		fixture.call(&mut registers).unwrap();
		let mut registers = with_ah(0x02);
		registers.dx = b'!' as u16;
		fixture.call(&mut registers).unwrap();
		fixture.memory.set_array((0x0100, 0x20), b"\r\n").unwrap();
		let mut registers = with_ah(0x40);
		registers.bx = 1;
		registers.cx = 2;
		registers.dx = 0x20;
		fixture.call(&mut registers).unwrap();
		assert_eq!(registers.ax, 2);
		assert_eq!(fixture.console_text(), b"Hello!\r\n");
	}

	#[test] fn test_file_errors_set_carry() {
		let mut fixture = Fixture::new();
		fixture.memory.set_array((0x0100, 0x10), b"NOPE.DAT\0").unwrap();
		let mut registers = with_ah(0x3d);
		registers.dx = 0x10;
		fixture.call(&mut registers).unwrap();
		assert!(registers.carry());
		assert_eq!(registers.ax, DosErrorCode::FileNotFound.code());
	}

	#[test] fn test_file_round_trip() {
		let mut fixture = Fixture::new();
		fixture.memory.set_array((0x0100, 0x10), b"DATA.BIN\0").unwrap();
		fixture.memory.set_array((0x0100, 0x40), b"abc").unwrap();

		let mut registers = with_ah(0x3c);
		registers.dx = 0x10;
		fixture.call(&mut registers).unwrap();
		assert!(!registers.carry());
		let handle = registers.ax;

		let mut registers = with_ah(0x40);
		registers.bx = handle;
		registers.cx = 3;
		registers.dx = 0x40;
		fixture.call(&mut registers).unwrap();
		assert_eq!(registers.ax, 3);

		let mut registers = with_ah(0x42);
		registers.bx = handle;
		fixture.call(&mut registers).unwrap();
		assert_eq!(registers.dx_ax(), 0);

		let mut registers = with_ah(0x3f);
		registers.bx = handle;
		registers.cx = 8;
		registers.dx = 0x80;
		fixture.call(&mut registers).unwrap();
		assert!(!registers.carry());
		assert_eq!(registers.ax, 3);
		assert_eq!(fixture.memory.get_array((0x0100, 0x80), 3).unwrap(), b"abc");

		let mut registers = with_ah(0x3e);
		registers.bx = handle;
		fixture.call(&mut registers).unwrap();
		assert!(!registers.carry());
	}

	#[test] fn test_seek_with_bad_origin() {
		let mut fixture = Fixture::new();
		let mut registers = with_ah(0x42);
		registers.set_al(7);
		registers.bx = 5;
		fixture.call(&mut registers).unwrap();
		assert!(registers.carry());
		assert_eq!(registers.ax, DosErrorCode::InvalidFunction.code());
	}

	#[test] fn test_terminate_halts() {
		let mut fixture = Fixture::new();
		let mut registers = with_ah(0x4c);
		registers.set_al(3);
		fixture.call(&mut registers).unwrap();
		assert!(registers.halt);
		assert_eq!(registers.al(), 3);
	}

	#[test] fn test_interrupt_vectors_round_trip() {
		let mut fixture = Fixture::new();
		let mut registers = with_ah(0x25);
		registers.set_al(0x1c);
		registers.dx = 0x1234;
		fixture.call(&mut registers).unwrap();
		let mut registers = with_ah(0x35);
		registers.set_al(0x1c);
		fixture.call(&mut registers).unwrap();
		assert_eq!((registers.es, registers.bx), (0x0100, 0x1234));
	}

	#[test] fn test_unsupported_function() {
		let mut fixture = Fixture::new();
		let mut registers = with_ah(0x99);
		assert!(matches!(fixture.call(&mut registers), Err(EmuError::UnsupportedDosFunction { function: 0x99 })));
	}
}
