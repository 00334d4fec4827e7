use crate::far_ptr::FarPtr;
use crate::memory::STACK_SEGMENT;

use bitflags::bitflags;
use iced_x86::Register;

bitflags! {
	/// The 8086 FLAGS word.
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
	pub struct Flags: u16 {
		const CARRY = 0x0001;
		const PARITY = 0x0004;
		const AUX_CARRY = 0x0010;
		const ZERO = 0x0040;
		const SIGN = 0x0080;
		const TRAP = 0x0100;
		const INTERRUPT = 0x0200;
		const DIRECTION = 0x0400;
		const OVERFLOW = 0x0800;
	}
}

// Bit 1 reads back as set on real hardware.
const FLAGS_RESERVED_BIT: u16 = 0x0002;

macro_rules! byte_halves {
	($reg:ident, $low:ident, $high:ident, $set_low:ident, $set_high:ident) => {
		pub fn $low(&self) -> u8 {
			self.$reg as u8
		}

		pub fn $high(&self) -> u8 {
			(self.$reg >> 8) as u8
		}

		pub fn $set_low(&mut self, value: u8) {
			self.$reg = (self.$reg & 0xff00) | value as u16;
		}

		pub fn $set_high(&mut self, value: u8) {
			self.$reg = (self.$reg & 0x00ff) | ((value as u16) << 8);
		}
	};
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuRegisters {
	pub ax: u16,
	pub bx: u16,
	pub cx: u16,
	pub dx: u16,
	pub si: u16,
	pub di: u16,
	pub bp: u16,
	pub sp: u16,
	pub cs: u16,
	pub ds: u16,
	pub es: u16,
	pub ss: u16,
	pub ip: u16,
	pub flags: Flags,
	/// Not part of FLAGS. Stops the tick loop once set.
	pub halt: bool,
}

impl CpuRegisters {
	pub fn new() -> CpuRegisters {
		CpuRegisters::default()
	}

	/// Zeroes everything and points SS:SP at the stack segment.
	pub fn reset(&mut self, stack_pointer: u16) {
		*self = CpuRegisters { ss: STACK_SEGMENT, sp: stack_pointer, ..CpuRegisters::default() };
	}

	byte_halves!(ax, al, ah, set_al, set_ah);
	byte_halves!(bx, bl, bh, set_bl, set_bh);
	byte_halves!(cx, cl, ch, set_cl, set_ch);
	byte_halves!(dx, dl, dh, set_dl, set_dh);

	pub fn flag(&self, flag: Flags) -> bool {
		self.flags.contains(flag)
	}

	pub fn set_flag(&mut self, flag: Flags, value: bool) {
		self.flags.set(flag, value);
	}

	pub fn carry(&self) -> bool {
		self.flag(Flags::CARRY)
	}

	pub fn zero(&self) -> bool {
		self.flag(Flags::ZERO)
	}

	pub fn sign(&self) -> bool {
		self.flag(Flags::SIGN)
	}

	pub fn overflow(&self) -> bool {
		self.flag(Flags::OVERFLOW)
	}

	pub fn parity(&self) -> bool {
		self.flag(Flags::PARITY)
	}

	pub fn direction(&self) -> bool {
		self.flag(Flags::DIRECTION)
	}

	/// FLAGS as pushed by PUSHF/INT.
	pub fn flags_word(&self) -> u16 {
		self.flags.bits() | FLAGS_RESERVED_BIT
	}

	pub fn set_flags_word(&mut self, value: u16) {
		self.flags = Flags::from_bits_truncate(value);
	}

	/// 32-bit results live in DX:AX.
	pub fn dx_ax(&self) -> u32 {
		((self.dx as u32) << 16) | self.ax as u32
	}

	pub fn set_dx_ax(&mut self, value: u32) {
		self.ax = value as u16;
		self.dx = (value >> 16) as u16;
	}

	pub fn cs_ip(&self) -> FarPtr {
		FarPtr::new(self.cs, self.ip)
	}

	pub fn ds_dx(&self) -> FarPtr {
		FarPtr::new(self.ds, self.dx)
	}

	pub fn ss_sp(&self) -> FarPtr {
		FarPtr::new(self.ss, self.sp)
	}

	/// Reads an 8-bit, 16-bit or segment register, zero-extended. `None` for
	/// anything a 16-bit real-mode program can't name.
	pub fn read(&self, reg: Register) -> Option<u16> {
		Some(match reg {
			Register::AL => self.al() as u16,
			Register::AH => self.ah() as u16,
			Register::BL => self.bl() as u16,
			Register::BH => self.bh() as u16,
			Register::CL => self.cl() as u16,
			Register::CH => self.ch() as u16,
			Register::DL => self.dl() as u16,
			Register::DH => self.dh() as u16,
			Register::AX => self.ax,
			Register::BX => self.bx,
			Register::CX => self.cx,
			Register::DX => self.dx,
			Register::SI => self.si,
			Register::DI => self.di,
			Register::BP => self.bp,
			Register::SP => self.sp,
			Register::CS => self.cs,
			Register::DS => self.ds,
			Register::ES => self.es,
			Register::SS => self.ss,
			_ => return None,
		})
	}

	/// Writes the low byte of `value` for 8-bit registers.
	pub fn write(&mut self, reg: Register, value: u16) -> Option<()> {
		match reg {
			Register::AL => self.set_al(value as u8),
			Register::AH => self.set_ah(value as u8),
			Register::BL => self.set_bl(value as u8),
			Register::BH => self.set_bh(value as u8),
			Register::CL => self.set_cl(value as u8),
			Register::CH => self.set_ch(value as u8),
			Register::DL => self.set_dl(value as u8),
			Register::DH => self.set_dh(value as u8),
			Register::AX => self.ax = value,
			Register::BX => self.bx = value,
			Register::CX => self.cx = value,
			Register::DX => self.dx = value,
			Register::SI => self.si = value,
			Register::DI => self.di = value,
			Register::BP => self.bp = value,
			Register::SP => self.sp = value,
			Register::CS => self.cs = value,
			Register::DS => self.ds = value,
			Register::ES => self.es = value,
			Register::SS => self.ss = value,
			_ => return None,
		}
		Some(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test] fn test_byte_halves() {
		let mut registers = CpuRegisters::new();
		registers.ax = 0x1234;
		assert_eq!((registers.ah(), registers.al()), (0x12, 0x34));
		registers.set_ah(0xff);
		registers.set_dl(0x01);
		assert_eq!(registers.ax, 0xff34);
		assert_eq!(registers.dx, 0x0001);
		registers.write(Register::CH, 0xab).unwrap();
		assert_eq!(registers.read(Register::CX), Some(0xab00));
		assert_eq!(registers.read(Register::EAX), None);
	}

	#[test] fn test_reset_keeps_nothing_but_the_stack() {
		let mut registers = CpuRegisters { ax: 1, halt: true, flags: Flags::CARRY, ..CpuRegisters::default() };
		registers.reset(0x1000);
		assert_eq!(registers, CpuRegisters { ss: STACK_SEGMENT, sp: 0x1000, ..CpuRegisters::default() });
	}

	#[test] fn test_flags_word() {
		let mut registers = CpuRegisters::new();
		registers.set_flag(Flags::CARRY, true);
		registers.set_flag(Flags::ZERO, true);
		assert_eq!(registers.flags_word(), 0x0043);
		registers.set_flags_word(0xffff);
		assert!(registers.overflow() && registers.direction() && registers.carry());
		registers.set_dx_ax(0xdead_beef);
		assert_eq!((registers.dx, registers.ax), (0xdead, 0xbeef));
	}
}
