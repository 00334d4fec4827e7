use crate::cpu::alu::Width;
use crate::error::{EmuError, Result};
use crate::far_ptr::FarPtr;
use crate::memory::MemoryCore;
use crate::registers::CpuRegisters;

use iced_x86::{Instruction, OpKind, Register};

pub(crate) fn unimplemented(registers: &CpuRegisters, instruction: &Instruction) -> EmuError {
	EmuError::UnimplementedOpcode {
		at: FarPtr::new(registers.cs, instruction.ip16()),
		mnemonic: format!("{:?}", instruction.mnemonic()),
	}
}

fn register(registers: &CpuRegisters, instruction: &Instruction, reg: Register) -> Result<u16> {
	registers.read(reg).ok_or_else(|| unimplemented(registers, instruction))
}

/// Offset part of a ModRM memory operand. 16-bit address arithmetic wraps.
pub(crate) fn effective_offset(registers: &CpuRegisters, instruction: &Instruction) -> Result<u16> {
	let mut offset = instruction.memory_displacement32() as u16;
	if instruction.memory_base() != Register::None {
		offset = offset.wrapping_add(register(registers, instruction, instruction.memory_base())?);
	}
	if instruction.memory_index() != Register::None {
		offset = offset.wrapping_add(register(registers, instruction, instruction.memory_index())?);
	}
	Ok(offset)
}

pub(crate) fn memory_ptr(registers: &CpuRegisters, instruction: &Instruction) -> Result<FarPtr> {
	let segment = register(registers, instruction, instruction.memory_segment())?;
	Ok(FarPtr::new(segment, effective_offset(registers, instruction)?))
}

pub(crate) fn operand_width(instruction: &Instruction, operand: u32) -> Width {
	match instruction.op_kind(operand) {
		OpKind::Register if instruction.op_register(operand).is_gpr8() => Width::Byte,
		OpKind::Immediate8 | OpKind::Immediate8_2nd => Width::Byte,
		OpKind::Memory | OpKind::MemorySegSI | OpKind::MemorySegDI | OpKind::MemoryESDI
			if instruction.memory_size().size() == 1 => Width::Byte,
		_ => Width::Word,
	}
}

pub(crate) fn read_memory(memory: &MemoryCore, ptr: FarPtr, width: Width) -> Result<u16> {
	match width {
		Width::Byte => Ok(memory.get_byte(ptr)? as u16),
		Width::Word => memory.get_word(ptr),
	}
}

pub(crate) fn write_memory(memory: &mut MemoryCore, ptr: FarPtr, width: Width, value: u16) -> Result<()> {
	match width {
		Width::Byte => memory.set_byte(ptr, value as u8),
		Width::Word => memory.set_word(ptr, value),
	}
}

pub(crate) fn read_operand(registers: &CpuRegisters, memory: &MemoryCore, instruction: &Instruction, operand: u32) -> Result<u16> {
	match instruction.op_kind(operand) {
		OpKind::Register => register(registers, instruction, instruction.op_register(operand)),
		OpKind::Memory => {
			let ptr = memory_ptr(registers, instruction)?;
			read_memory(memory, ptr, operand_width(instruction, operand))
		}
		OpKind::Immediate8 | OpKind::Immediate8_2nd | OpKind::Immediate16 | OpKind::Immediate8to16 => {
			Ok(instruction.immediate(operand) as u16)
		}
		OpKind::NearBranch16 => Ok(instruction.near_branch16()),
		_ => Err(unimplemented(registers, instruction)),
	}
}

pub(crate) fn write_operand(registers: &mut CpuRegisters, memory: &mut MemoryCore, instruction: &Instruction, operand: u32, value: u16) -> Result<()> {
	match instruction.op_kind(operand) {
		OpKind::Register => registers
			.write(instruction.op_register(operand), value)
			.ok_or_else(|| unimplemented(registers, instruction)),
		OpKind::Memory => {
			let ptr = memory_ptr(registers, instruction)?;
			write_memory(memory, ptr, operand_width(instruction, operand), value)
		}
		_ => Err(unimplemented(registers, instruction)),
	}
}
