use crate::cpu::alu::{self, Width};
use crate::cpu::operands::{read_memory, unimplemented, write_memory};
use crate::error::Result;
use crate::far_ptr::FarPtr;
use crate::memory::MemoryCore;
use crate::registers::CpuRegisters;

use iced_x86::{Instruction, Mnemonic};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StringOp {
	Movs,
	Stos,
	Lods,
	Cmps,
	Scas,
}

impl StringOp {
	fn from_mnemonic(mnemonic: Mnemonic) -> Option<(StringOp, Width)> {
		Some(match mnemonic {
			Mnemonic::Movsb => (StringOp::Movs, Width::Byte),
			Mnemonic::Movsw => (StringOp::Movs, Width::Word),
			Mnemonic::Stosb => (StringOp::Stos, Width::Byte),
			Mnemonic::Stosw => (StringOp::Stos, Width::Word),
			Mnemonic::Lodsb => (StringOp::Lods, Width::Byte),
			Mnemonic::Lodsw => (StringOp::Lods, Width::Word),
			Mnemonic::Cmpsb => (StringOp::Cmps, Width::Byte),
			Mnemonic::Cmpsw => (StringOp::Cmps, Width::Word),
			Mnemonic::Scasb => (StringOp::Scas, Width::Byte),
			Mnemonic::Scasw => (StringOp::Scas, Width::Word),
			_ => return None,
		})
	}

	fn compares(self) -> bool {
		matches!(self, StringOp::Cmps | StringOp::Scas)
	}
}

pub(crate) fn is_string_op(mnemonic: Mnemonic) -> bool {
	StringOp::from_mnemonic(mnemonic).is_some()
}

fn accumulator(registers: &CpuRegisters, width: Width) -> u16 {
	match width {
		Width::Byte => registers.al() as u16,
		Width::Word => registers.ax,
	}
}

fn set_accumulator(registers: &mut CpuRegisters, width: Width, value: u16) {
	match width {
		Width::Byte => registers.set_al(value as u8),
		Width::Word => registers.ax = value,
	}
}

/// Runs a string instruction, every repetition of it for REP forms. CX is
/// checked before each iteration, so REP with CX=0 does nothing.
pub(crate) fn execute(registers: &mut CpuRegisters, memory: &mut MemoryCore, instruction: &Instruction) -> Result<()> {
	let (op, width) = StringOp::from_mnemonic(instruction.mnemonic())
		.ok_or_else(|| unimplemented(registers, instruction))?;
	// DS unless overridden. Only meaningful for the forms reading DS:SI.
	let source_segment = registers.read(instruction.memory_segment()).unwrap_or(registers.ds);
	let step = match width {
		Width::Byte => 1u16,
		Width::Word => 2u16,
	};
	let step = if registers.direction() { step.wrapping_neg() } else { step };

	let repeat_while_equal = instruction.has_repe_prefix();
	let repeat_while_not_equal = instruction.has_repne_prefix();
	if !repeat_while_equal && !repeat_while_not_equal {
		return iterate(registers, memory, op, width, source_segment, step);
	}
	while registers.cx != 0 {
		iterate(registers, memory, op, width, source_segment, step)?;
		registers.cx = registers.cx.wrapping_sub(1);
		if op.compares() {
			let equal = registers.zero();
			if (repeat_while_equal && !equal) || (repeat_while_not_equal && equal) {
				break;
			}
		}
	}
	Ok(())
}

fn iterate(registers: &mut CpuRegisters, memory: &mut MemoryCore, op: StringOp, width: Width, source_segment: u16, step: u16) -> Result<()> {
	let source = FarPtr::new(source_segment, registers.si);
	let destination = FarPtr::new(registers.es, registers.di);
	match op {
		StringOp::Movs => {
			let value = read_memory(memory, source, width)?;
			write_memory(memory, destination, width, value)?;
		}
		StringOp::Stos => {
			write_memory(memory, destination, width, accumulator(registers, width))?;
		}
		StringOp::Lods => {
			let value = read_memory(memory, source, width)?;
			set_accumulator(registers, width, value);
		}
		StringOp::Cmps => {
			let a = read_memory(memory, source, width)?;
			let b = read_memory(memory, destination, width)?;
			alu::sub(&mut registers.flags, width, a, b, false);
		}
		StringOp::Scas => {
			let a = accumulator(registers, width);
			let b = read_memory(memory, destination, width)?;
			alu::sub(&mut registers.flags, width, a, b, false);
		}
	}
	if matches!(op, StringOp::Movs | StringOp::Lods | StringOp::Cmps) {
		registers.si = registers.si.wrapping_add(step);
	}
	if !matches!(op, StringOp::Lods) {
		registers.di = registers.di.wrapping_add(step);
	}
	Ok(())
}
