pub mod alu;
mod operands;
mod string_ops;

use crate::cpu::alu::{ShiftOp, Width};
use crate::cpu::operands::{effective_offset, memory_ptr, operand_width, read_operand, unimplemented, write_operand};
use crate::error::{EmuError, Result};
use crate::far_ptr::FarPtr;
use crate::interrupts::InterruptHandler;
use crate::io::{IoPortBus, IoPortDevice};
use crate::memory::MemoryCore;
use crate::registers::{CpuRegisters, Flags};

use iced_x86::{Instruction, MemorySize, Mnemonic, OpKind, Register};

use std::collections::{HashMap, HashSet};
use std::ops::RangeInclusive;

// https://www.felixcloutier.com/x86/
// http://www.mlsite.net/8086/

/// A far return to this address ends the run. Pushed by callers that want
/// control back once the guest function returns.
pub const HALT_SENTINEL: FarPtr = FarPtr::new(0xffff, 0xffff);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
	Executed,
	Halted,
	/// CS:IP points into an imported module. Nothing was executed; whoever
	/// drives the CPU has to service the call and do the far return.
	ExternalCall(FarPtr),
}

pub fn push(registers: &mut CpuRegisters, memory: &mut MemoryCore, value: u16) -> Result<()> {
	registers.sp = registers.sp.wrapping_sub(2);
	memory.set_word(registers.ss_sp(), value)
}

pub fn pop(registers: &mut CpuRegisters, memory: &MemoryCore) -> Result<u16> {
	let value = memory.get_word(registers.ss_sp())?;
	registers.sp = registers.sp.wrapping_add(2);
	Ok(value)
}

fn condition(registers: &CpuRegisters, mnemonic: Mnemonic) -> Option<bool> {
	let (carry, zero, sign, overflow) = (registers.carry(), registers.zero(), registers.sign(), registers.overflow());
	Some(match mnemonic {
		Mnemonic::Jo => overflow,
		Mnemonic::Jno => !overflow,
		Mnemonic::Jb => carry,
		Mnemonic::Jae => !carry,
		Mnemonic::Je => zero,
		Mnemonic::Jne => !zero,
		Mnemonic::Jbe => carry || zero,
		Mnemonic::Ja => !carry && !zero,
		Mnemonic::Js => sign,
		Mnemonic::Jns => !sign,
		Mnemonic::Jp => registers.parity(),
		Mnemonic::Jnp => !registers.parity(),
		Mnemonic::Jl => sign != overflow,
		Mnemonic::Jge => sign == overflow,
		Mnemonic::Jle => zero || sign != overflow,
		Mnemonic::Jg => !zero && sign == overflow,
		_ => return None,
	})
}

fn shift_op(mnemonic: Mnemonic) -> Option<ShiftOp> {
	Some(match mnemonic {
		Mnemonic::Rol => ShiftOp::Rol,
		Mnemonic::Ror => ShiftOp::Ror,
		Mnemonic::Rcl => ShiftOp::Rcl,
		Mnemonic::Rcr => ShiftOp::Rcr,
		Mnemonic::Shl | Mnemonic::Sal => ShiftOp::Shl,
		Mnemonic::Shr => ShiftOp::Shr,
		Mnemonic::Sar => ShiftOp::Sar,
		_ => return None,
	})
}

fn is_far_indirect(instruction: &Instruction) -> bool {
	instruction.op0_kind() == OpKind::Memory && instruction.memory_size() == MemorySize::SegPtr16
}

/// Real-mode 8086/80186 interpreter. Owns the registers, the interrupt table
/// and the I/O ports; memory is lent to it one tick at a time.
#[derive(Debug, Default)]
pub struct CpuCore {
	pub registers: CpuRegisters,
	interrupts: HashMap<u8, Box<dyn InterruptHandler>>,
	ports: IoPortBus,
	imported_segments: HashSet<u16>,
}

impl CpuCore {
	pub fn new() -> CpuCore {
		CpuCore::default()
	}

	/// Keyed by the handler's own vector. Registering a vector twice replaces
	/// the earlier handler.
	pub fn register_interrupt(&mut self, handler: Box<dyn InterruptHandler>) {
		let vector = handler.vector();
		if self.interrupts.insert(vector, handler).is_some() {
			tracing::warn!(vector, "replaced interrupt handler");
		}
	}

	pub fn register_port_device(&mut self, ports: RangeInclusive<u16>, device: Box<dyn IoPortDevice>) -> Result<()> {
		self.ports.register(ports, device)
	}

	/// Far transfers into `segment` stop the CPU with `StepResult::ExternalCall`.
	pub fn add_imported_segment(&mut self, segment: u16) {
		self.imported_segments.insert(segment);
	}

	pub fn is_imported_segment(&self, segment: u16) -> bool {
		self.imported_segments.contains(&segment)
	}

	pub fn reset(&mut self, stack_pointer: u16) {
		self.registers.reset(stack_pointer);
	}

	pub fn push(&mut self, memory: &mut MemoryCore, value: u16) -> Result<()> {
		push(&mut self.registers, memory, value)
	}

	pub fn pop(&mut self, memory: &MemoryCore) -> Result<u16> {
		pop(&mut self.registers, memory)
	}

	/// RETF, optionally dropping `pop_bytes` of arguments. Returning to
	/// `HALT_SENTINEL` sets Halt.
	pub fn far_return(&mut self, memory: &MemoryCore, pop_bytes: u16) -> Result<()> {
		self.registers.ip = self.pop(memory)?;
		self.registers.cs = self.pop(memory)?;
		self.registers.sp = self.registers.sp.wrapping_add(pop_bytes);
		if self.registers.cs_ip() == HALT_SENTINEL {
			tracing::trace!("returned to halt sentinel");
			self.registers.halt = true;
		}
		Ok(())
	}

	/// Executes the instruction at CS:IP. On error the registers and every
	/// byte of memory the instruction wrote (including writes made by an
	/// interrupt handler it called) are put back the way they were.
	pub fn tick(&mut self, memory: &mut MemoryCore) -> Result<StepResult> {
		if self.registers.halt {
			return Ok(StepResult::Halted);
		}
		let at = self.registers.cs_ip();
		if self.is_imported_segment(at.segment) {
			return Ok(StepResult::ExternalCall(at));
		}
		let instruction = memory.get_instruction(at)?;
		let saved = self.registers;
		self.registers.ip = instruction.next_ip16();
		memory.begin_journal();
		if let Err(err) = self.execute(memory, &instruction) {
			memory.rollback_journal();
			self.registers = saved;
			return Err(err);
		}
		memory.commit_journal();
		Ok(if self.registers.halt { StepResult::Halted } else { StepResult::Executed })
	}

	/// Raises software interrupt `vector`: FLAGS, CS and IP go on the stack,
	/// the handler runs, then IP and CS come back off. The pushed FLAGS are
	/// dropped so the handler's flags reach the caller.
	pub fn interrupt(&mut self, memory: &mut MemoryCore, vector: u8) -> Result<()> {
		if !self.interrupts.contains_key(&vector) {
			return Err(EmuError::UnhandledInterrupt { vector });
		}
		let flags = self.registers.flags_word();
		self.push(memory, flags)?;
		self.push(memory, self.registers.cs)?;
		self.push(memory, self.registers.ip)?;
		if let Some(handler) = self.interrupts.get_mut(&vector) {
			handler.handle(&mut self.registers, memory)?;
		}
		self.registers.ip = self.pop(memory)?;
		self.registers.cs = self.pop(memory)?;
		self.registers.sp = self.registers.sp.wrapping_add(2);
		Ok(())
	}

	fn read(&self, memory: &MemoryCore, instruction: &Instruction, operand: u32) -> Result<u16> {
		read_operand(&self.registers, memory, instruction, operand)
	}

	fn write(&mut self, memory: &mut MemoryCore, instruction: &Instruction, operand: u32, value: u16) -> Result<()> {
		write_operand(&mut self.registers, memory, instruction, operand, value)
	}

	fn accumulator_register(width: Width) -> Register {
		match width {
			Width::Byte => Register::AL,
			Width::Word => Register::AX,
		}
	}

	/// Reads the far pointer a LDS/LES/far indirect operand points at.
	fn read_far_operand(&self, memory: &MemoryCore, instruction: &Instruction) -> Result<FarPtr> {
		let ptr = memory_ptr(&self.registers, instruction)?;
		memory.get_pointer(ptr)
	}

	fn execute(&mut self, memory: &mut MemoryCore, instruction: &Instruction) -> Result<()> {
		let mnemonic = instruction.mnemonic();
		let width = operand_width(instruction, 0);

		if let Some(taken) = condition(&self.registers, mnemonic) {
			if taken {
				self.registers.ip = instruction.near_branch16();
			}
			return Ok(());
		}
		if let Some(op) = shift_op(mnemonic) {
			let value = self.read(memory, instruction, 0)?;
			let count = self.read(memory, instruction, 1)? as u8;
			let result = alu::shift(&mut self.registers.flags, width, op, value, count);
			return self.write(memory, instruction, 0, result);
		}
		if string_ops::is_string_op(mnemonic) {
			return string_ops::execute(&mut self.registers, memory, instruction);
		}

		match mnemonic {
			// Data movement
			Mnemonic::Mov => {
				let value = self.read(memory, instruction, 1)?;
				self.write(memory, instruction, 0, value)?;
			}
			Mnemonic::Xchg => {
				let a = self.read(memory, instruction, 0)?;
				let b = self.read(memory, instruction, 1)?;
				self.write(memory, instruction, 0, b)?;
				self.write(memory, instruction, 1, a)?;
			}
			Mnemonic::Lea => {
				let offset = effective_offset(&self.registers, instruction)?;
				self.write(memory, instruction, 0, offset)?;
			}
			Mnemonic::Lds | Mnemonic::Les => {
				let pointer = self.read_far_operand(memory, instruction)?;
				self.write(memory, instruction, 0, pointer.offset)?;
				if mnemonic == Mnemonic::Lds {
					self.registers.ds = pointer.segment;
				} else {
					self.registers.es = pointer.segment;
				}
			}
			Mnemonic::Movzx | Mnemonic::Movsx => {
				let source_width = operand_width(instruction, 1);
				let value = self.read(memory, instruction, 1)?;
				let value = match (mnemonic, source_width) {
					(Mnemonic::Movsx, Width::Byte) => value as u8 as i8 as i16 as u16,
					(_, Width::Byte) => value & 0xff,
					_ => value,
				};
				self.write(memory, instruction, 0, value)?;
			}
			Mnemonic::Xlatb => {
				let segment = self.registers.read(instruction.memory_segment()).unwrap_or(self.registers.ds);
				let offset = self.registers.bx.wrapping_add(self.registers.al() as u16);
				let value = memory.get_byte((segment, offset))?;
				self.registers.set_al(value);
			}
			Mnemonic::Lahf => {
				self.registers.set_ah(self.registers.flags_word() as u8);
			}
			Mnemonic::Sahf => {
				let low = Flags::CARRY | Flags::PARITY | Flags::AUX_CARRY | Flags::ZERO | Flags::SIGN;
				let new = Flags::from_bits_truncate(self.registers.ah() as u16) & low;
				self.registers.flags = (self.registers.flags - low) | new;
			}
			Mnemonic::Cbw => {
				self.registers.ax = self.registers.al() as i8 as i16 as u16;
			}
			Mnemonic::Cwd => {
				self.registers.dx = if self.registers.ax & 0x8000 != 0 { 0xffff } else { 0 };
			}

			// Stack
			Mnemonic::Push => {
				let value = self.read(memory, instruction, 0)?;
				self.push(memory, value)?;
			}
			Mnemonic::Pop => {
				let value = self.pop(memory)?;
				self.write(memory, instruction, 0, value)?;
			}
			Mnemonic::Pushf => {
				let flags = self.registers.flags_word();
				self.push(memory, flags)?;
			}
			Mnemonic::Popf => {
				let flags = self.pop(memory)?;
				self.registers.set_flags_word(flags);
			}
			Mnemonic::Pusha => {
				let r = self.registers;
				for value in [r.ax, r.cx, r.dx, r.bx, r.sp, r.bp, r.si, r.di] {
					self.push(memory, value)?;
				}
			}
			Mnemonic::Popa => {
				self.registers.di = self.pop(memory)?;
				self.registers.si = self.pop(memory)?;
				self.registers.bp = self.pop(memory)?;
				self.pop(memory)?;
				self.registers.bx = self.pop(memory)?;
				self.registers.dx = self.pop(memory)?;
				self.registers.cx = self.pop(memory)?;
				self.registers.ax = self.pop(memory)?;
			}
			Mnemonic::Enter => {
				let size = instruction.immediate16();
				let level = instruction.immediate8_2nd() % 32;
				self.push(memory, self.registers.bp)?;
				let frame = self.registers.sp;
				if level > 0 {
					for _ in 1..level {
						self.registers.bp = self.registers.bp.wrapping_sub(2);
						let outer = memory.get_word((self.registers.ss, self.registers.bp))?;
						self.push(memory, outer)?;
					}
					self.push(memory, frame)?;
				}
				self.registers.bp = frame;
				self.registers.sp = self.registers.sp.wrapping_sub(size);
			}
			Mnemonic::Leave => {
				self.registers.sp = self.registers.bp;
				self.registers.bp = self.pop(memory)?;
			}

			// Arithmetic
			Mnemonic::Add | Mnemonic::Adc | Mnemonic::Sub | Mnemonic::Sbb | Mnemonic::Cmp => {
				let a = self.read(memory, instruction, 0)?;
				let b = self.read(memory, instruction, 1)?;
				let carry = self.registers.carry();
				let flags = &mut self.registers.flags;
				let result = match mnemonic {
					Mnemonic::Add => alu::add(flags, width, a, b, false),
					Mnemonic::Adc => alu::add(flags, width, a, b, carry),
					Mnemonic::Sbb => alu::sub(flags, width, a, b, carry),
					_ => alu::sub(flags, width, a, b, false),
				};
				if mnemonic != Mnemonic::Cmp {
					self.write(memory, instruction, 0, result)?;
				}
			}
			Mnemonic::Inc | Mnemonic::Dec | Mnemonic::Neg => {
				let value = self.read(memory, instruction, 0)?;
				let flags = &mut self.registers.flags;
				let result = match mnemonic {
					Mnemonic::Inc => alu::inc(flags, width, value),
					Mnemonic::Dec => alu::dec(flags, width, value),
					_ => alu::neg(flags, width, value),
				};
				self.write(memory, instruction, 0, result)?;
			}
			Mnemonic::Mul | Mnemonic::Imul if instruction.op_count() == 1 => {
				self.multiply(memory, instruction, width, mnemonic == Mnemonic::Imul)?;
			}
			Mnemonic::Imul => {
				// imul r16, r/m16[, imm]
				let (a, b) = if instruction.op_count() == 3 {
					(self.read(memory, instruction, 1)?, self.read(memory, instruction, 2)?)
				} else {
					(self.read(memory, instruction, 0)?, self.read(memory, instruction, 1)?)
				};
				let product = a as i16 as i32 * b as i16 as i32;
				let overflow = product != product as i16 as i32;
				self.registers.set_flag(Flags::CARRY, overflow);
				self.registers.set_flag(Flags::OVERFLOW, overflow);
				self.write(memory, instruction, 0, product as u16)?;
			}
			Mnemonic::Div | Mnemonic::Idiv => {
				self.divide(memory, instruction, width, mnemonic == Mnemonic::Idiv)?;
			}

			// Logic
			Mnemonic::And | Mnemonic::Or | Mnemonic::Xor | Mnemonic::Test => {
				let a = self.read(memory, instruction, 0)?;
				let b = self.read(memory, instruction, 1)?;
				let result = match mnemonic {
					Mnemonic::Or => a | b,
					Mnemonic::Xor => a ^ b,
					_ => a & b,
				};
				let result = alu::logic(&mut self.registers.flags, width, result);
				if mnemonic != Mnemonic::Test {
					self.write(memory, instruction, 0, result)?;
				}
			}
			Mnemonic::Not => {
				let value = self.read(memory, instruction, 0)?;
				self.write(memory, instruction, 0, !value)?;
			}

			// Control transfer
			Mnemonic::Jmp => match instruction.op0_kind() {
				OpKind::FarBranch16 => {
					self.registers.cs = instruction.far_branch_selector();
					self.registers.ip = instruction.far_branch16();
				}
				_ if is_far_indirect(instruction) => {
					let target = self.read_far_operand(memory, instruction)?;
					self.registers.cs = target.segment;
					self.registers.ip = target.offset;
				}
				_ => {
					self.registers.ip = self.read(memory, instruction, 0)?;
				}
			},
			Mnemonic::Call => {
				let target = match instruction.op0_kind() {
					OpKind::FarBranch16 => Some(FarPtr::new(instruction.far_branch_selector(), instruction.far_branch16())),
					_ if is_far_indirect(instruction) => Some(self.read_far_operand(memory, instruction)?),
					_ => None,
				};
				match target {
					Some(target) => {
						self.push(memory, self.registers.cs)?;
						self.push(memory, self.registers.ip)?;
						self.registers.cs = target.segment;
						self.registers.ip = target.offset;
					}
					None => {
						let target = self.read(memory, instruction, 0)?;
						self.push(memory, self.registers.ip)?;
						self.registers.ip = target;
					}
				}
			}
			Mnemonic::Ret => {
				self.registers.ip = self.pop(memory)?;
				if instruction.op_count() == 1 {
					self.registers.sp = self.registers.sp.wrapping_add(instruction.immediate16());
				}
			}
			Mnemonic::Retf => {
				let pop_bytes = if instruction.op_count() == 1 { instruction.immediate16() } else { 0 };
				self.far_return(memory, pop_bytes)?;
			}
			Mnemonic::Iret => {
				self.registers.ip = self.pop(memory)?;
				self.registers.cs = self.pop(memory)?;
				let flags = self.pop(memory)?;
				self.registers.set_flags_word(flags);
			}
			Mnemonic::Jcxz => {
				if self.registers.cx == 0 {
					self.registers.ip = instruction.near_branch16();
				}
			}
			Mnemonic::Loop | Mnemonic::Loope | Mnemonic::Loopne => {
				self.registers.cx = self.registers.cx.wrapping_sub(1);
				let taken = self.registers.cx != 0 && match mnemonic {
					Mnemonic::Loope => self.registers.zero(),
					Mnemonic::Loopne => !self.registers.zero(),
					_ => true,
				};
				if taken {
					self.registers.ip = instruction.near_branch16();
				}
			}
			Mnemonic::Int => {
				self.interrupt(memory, instruction.immediate8())?;
			}
			Mnemonic::Int3 => {
				self.interrupt(memory, 3)?;
			}
			Mnemonic::Into => {
				if self.registers.overflow() {
					self.interrupt(memory, 4)?;
				}
			}
			Mnemonic::Hlt => {
				self.registers.halt = true;
			}

			// Flags
			Mnemonic::Clc => self.registers.set_flag(Flags::CARRY, false),
			Mnemonic::Stc => self.registers.set_flag(Flags::CARRY, true),
			Mnemonic::Cmc => self.registers.set_flag(Flags::CARRY, !self.registers.carry()),
			Mnemonic::Cld => self.registers.set_flag(Flags::DIRECTION, false),
			Mnemonic::Std => self.registers.set_flag(Flags::DIRECTION, true),
			Mnemonic::Cli => self.registers.set_flag(Flags::INTERRUPT, false),
			Mnemonic::Sti => self.registers.set_flag(Flags::INTERRUPT, true),

			// Ports
			Mnemonic::In => {
				let port = self.read(memory, instruction, 1)?;
				let value = match width {
					Width::Byte => self.ports.read_byte(port)? as u16,
					Width::Word => self.ports.read_word(port)?,
				};
				self.registers.write(CpuCore::accumulator_register(width), value);
			}
			Mnemonic::Out => {
				let port = self.read(memory, instruction, 0)?;
				let value = self.read(memory, instruction, 1)?;
				match operand_width(instruction, 1) {
					Width::Byte => self.ports.write_byte(port, value as u8)?,
					Width::Word => self.ports.write_word(port, value)?,
				}
			}

			Mnemonic::Nop | Mnemonic::Wait => {}

			_ => return Err(unimplemented(&self.registers, instruction)),
		}
		Ok(())
	}

	fn multiply(&mut self, memory: &mut MemoryCore, instruction: &Instruction, width: Width, signed: bool) -> Result<()> {
		let source = self.read(memory, instruction, 0)?;
		let overflow = match (width, signed) {
			(Width::Byte, false) => {
				let product = self.registers.al() as u16 * (source & 0xff);
				self.registers.ax = product;
				product > 0xff
			}
			(Width::Byte, true) => {
				let product = self.registers.al() as i8 as i16 * source as u8 as i8 as i16;
				self.registers.ax = product as u16;
				product != product as i8 as i16
			}
			(Width::Word, false) => {
				let product = self.registers.ax as u32 * source as u32;
				self.registers.set_dx_ax(product);
				product > 0xffff
			}
			(Width::Word, true) => {
				let product = self.registers.ax as i16 as i32 * source as i16 as i32;
				self.registers.set_dx_ax(product as u32);
				product != product as i16 as i32
			}
		};
		self.registers.set_flag(Flags::CARRY, overflow);
		self.registers.set_flag(Flags::OVERFLOW, overflow);
		Ok(())
	}

	fn divide(&mut self, memory: &mut MemoryCore, instruction: &Instruction, width: Width, signed: bool) -> Result<()> {
		let at = FarPtr::new(self.registers.cs, instruction.ip16());
		let divisor = self.read(memory, instruction, 0)?;
		let divide_error = EmuError::DivideError { at };
		match (width, signed) {
			(Width::Byte, false) => {
				let divisor = divisor & 0xff;
				if divisor == 0 {
					return Err(divide_error);
				}
				let dividend = self.registers.ax;
				let quotient = dividend / divisor;
				if quotient > 0xff {
					return Err(divide_error);
				}
				self.registers.set_al(quotient as u8);
				self.registers.set_ah((dividend % divisor) as u8);
			}
			(Width::Byte, true) => {
				let divisor = divisor as u8 as i8 as i32;
				if divisor == 0 {
					return Err(divide_error);
				}
				let dividend = self.registers.ax as i16 as i32;
				let quotient = dividend / divisor;
				if quotient != quotient as i8 as i32 {
					return Err(divide_error);
				}
				self.registers.set_al(quotient as u8);
				self.registers.set_ah((dividend % divisor) as u8);
			}
			(Width::Word, false) => {
				let divisor = divisor as u32;
				if divisor == 0 {
					return Err(divide_error);
				}
				let dividend = self.registers.dx_ax();
				let quotient = dividend / divisor;
				if quotient > 0xffff {
					return Err(divide_error);
				}
				self.registers.ax = quotient as u16;
				self.registers.dx = (dividend % divisor) as u16;
			}
			(Width::Word, true) => {
				let divisor = divisor as i16 as i64;
				if divisor == 0 {
					return Err(divide_error);
				}
				let dividend = self.registers.dx_ax() as i32 as i64;
				let quotient = dividend / divisor;
				if quotient != quotient as i16 as i64 {
					return Err(divide_error);
				}
				self.registers.ax = quotient as u16;
				self.registers.dx = (dividend % divisor) as u16;
			}
		}
		Ok(())
	}
}
