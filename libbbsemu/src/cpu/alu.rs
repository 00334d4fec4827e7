use crate::registers::Flags;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
	Byte,
	Word,
}

impl Width {
	pub fn bits(self) -> u32 {
		match self {
			Width::Byte => 8,
			Width::Word => 16,
		}
	}

	pub fn mask(self) -> u32 {
		match self {
			Width::Byte => 0xff,
			Width::Word => 0xffff,
		}
	}

	pub fn sign_bit(self) -> u32 {
		1 << (self.bits() - 1)
	}

	/// Sign-extends the low `bits()` of `value`.
	pub fn signed(self, value: u16) -> i32 {
		match self {
			Width::Byte => value as u8 as i8 as i32,
			Width::Word => value as i16 as i32,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftOp {
	Rol,
	Ror,
	Rcl,
	Rcr,
	Shl,
	Shr,
	Sar,
}

fn set_szp(flags: &mut Flags, width: Width, result: u32) {
	let result = result & width.mask();
	flags.set(Flags::ZERO, result == 0);
	flags.set(Flags::SIGN, result & width.sign_bit() != 0);
	flags.set(Flags::PARITY, (result as u8).count_ones() % 2 == 0);
}

pub fn add(flags: &mut Flags, width: Width, a: u16, b: u16, carry_in: bool) -> u16 {
	let (a, b) = (a as u32 & width.mask(), b as u32 & width.mask());
	let full = a + b + carry_in as u32;
	let result = full & width.mask();
	flags.set(Flags::CARRY, full > width.mask());
	flags.set(Flags::OVERFLOW, (a ^ result) & (b ^ result) & width.sign_bit() != 0);
	flags.set(Flags::AUX_CARRY, (a ^ b ^ result) & 0x10 != 0);
	set_szp(flags, width, result);
	result as u16
}

/// Also CMP, which just drops the result.
pub fn sub(flags: &mut Flags, width: Width, a: u16, b: u16, borrow_in: bool) -> u16 {
	let (a, b) = (a as u32 & width.mask(), b as u32 & width.mask());
	let result = a.wrapping_sub(b).wrapping_sub(borrow_in as u32) & width.mask();
	flags.set(Flags::CARRY, a < b + borrow_in as u32);
	flags.set(Flags::OVERFLOW, (a ^ b) & (a ^ result) & width.sign_bit() != 0);
	flags.set(Flags::AUX_CARRY, (a ^ b ^ result) & 0x10 != 0);
	set_szp(flags, width, result);
	result as u16
}

/// AND, OR, XOR and TEST: the caller computes, this sets the flags.
pub fn logic(flags: &mut Flags, width: Width, result: u16) -> u16 {
	let result = result as u32 & width.mask();
	flags.remove(Flags::CARRY | Flags::OVERFLOW | Flags::AUX_CARRY);
	set_szp(flags, width, result);
	result as u16
}

/// INC and DEC leave Carry alone.
pub fn inc(flags: &mut Flags, width: Width, value: u16) -> u16 {
	let carry = flags.contains(Flags::CARRY);
	let result = add(flags, width, value, 1, false);
	flags.set(Flags::CARRY, carry);
	result
}

pub fn dec(flags: &mut Flags, width: Width, value: u16) -> u16 {
	let carry = flags.contains(Flags::CARRY);
	let result = sub(flags, width, value, 1, false);
	flags.set(Flags::CARRY, carry);
	result
}

pub fn neg(flags: &mut Flags, width: Width, value: u16) -> u16 {
	let result = sub(flags, width, 0, value, false);
	flags.set(Flags::CARRY, value as u32 & width.mask() != 0);
	result
}

/// Counts are masked to 5 bits like the 80186 onwards. A zero count changes
/// nothing, flags included.
pub fn shift(flags: &mut Flags, width: Width, op: ShiftOp, value: u16, count: u8) -> u16 {
	let count = (count & 0x1f) as u32;
	let bits = width.bits();
	let mask = width.mask();
	let sign = width.sign_bit();
	let value = value as u32 & mask;
	if count == 0 {
		return value as u16;
	}
	let result = match op {
		ShiftOp::Shl => {
			let result = if count >= 32 { 0 } else { (value << count) & mask };
			let carry = count <= bits && (value >> (bits - count)) & 1 != 0;
			flags.set(Flags::CARRY, carry);
			flags.set(Flags::OVERFLOW, (result & sign != 0) != carry);
			set_szp(flags, width, result);
			result
		}
		ShiftOp::Shr => {
			let result = value.checked_shr(count).unwrap_or(0);
			flags.set(Flags::CARRY, count <= bits && (value >> (count - 1)) & 1 != 0);
			flags.set(Flags::OVERFLOW, value & sign != 0);
			set_szp(flags, width, result);
			result
		}
		ShiftOp::Sar => {
			let signed = width.signed(value as u16);
			let shifted = signed >> count.min(bits);
			let result = shifted as u32 & mask;
			flags.set(Flags::CARRY, (signed >> (count - 1).min(bits - 1)) & 1 != 0);
			flags.remove(Flags::OVERFLOW);
			set_szp(flags, width, result);
			result
		}
		ShiftOp::Rol => {
			let rotate = count % bits;
			let result = ((value << rotate) | (value >> ((bits - rotate) % bits))) & mask;
			let carry = result & 1 != 0;
			flags.set(Flags::CARRY, carry);
			flags.set(Flags::OVERFLOW, (result & sign != 0) != carry);
			result
		}
		ShiftOp::Ror => {
			let rotate = count % bits;
			let result = ((value >> rotate) | (value << ((bits - rotate) % bits))) & mask;
			flags.set(Flags::CARRY, result & sign != 0);
			flags.set(Flags::OVERFLOW, ((result ^ (result << 1)) & sign) != 0);
			result
		}
		ShiftOp::Rcl => {
			let mut result = value;
			let mut carry = flags.contains(Flags::CARRY);
			for _ in 0..count % (bits + 1) {
				let out = result & sign != 0;
				result = ((result << 1) | carry as u32) & mask;
				carry = out;
			}
			flags.set(Flags::CARRY, carry);
			flags.set(Flags::OVERFLOW, (result & sign != 0) != carry);
			result
		}
		ShiftOp::Rcr => {
			let mut result = value;
			let mut carry = flags.contains(Flags::CARRY);
			// OF comes from the operand before rotating.
			flags.set(Flags::OVERFLOW, (value & sign != 0) != carry);
			for _ in 0..count % (bits + 1) {
				let out = result & 1 != 0;
				result = (result >> 1) | if carry { sign } else { 0 };
				carry = out;
			}
			flags.set(Flags::CARRY, carry);
			result
		}
	};
	result as u16
}
