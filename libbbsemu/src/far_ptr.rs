use std::fmt;

/// A real-mode style `segment:offset` address.
///
/// Two pointers that happen to reach the same byte through different
/// segment/offset pairs are different values. Comparison is on the raw pair,
/// segment first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct FarPtr {
	pub segment: u16,
	pub offset: u16,
}

impl FarPtr {
	pub const NULL: FarPtr = FarPtr { segment: 0, offset: 0 };

	pub const fn new(segment: u16, offset: u16) -> FarPtr {
		FarPtr { segment, offset }
	}

	/// Segment in the high word, offset in the low word, the way a far pointer
	/// sits in DX:AX.
	pub const fn from_u32(value: u32) -> FarPtr {
		FarPtr { segment: (value >> 16) as u16, offset: value as u16 }
	}

	pub const fn to_u32(self) -> u32 {
		((self.segment as u32) << 16) | self.offset as u32
	}

	/// Offsets wrap inside the segment, they never carry into the next one.
	pub const fn wrapping_add(self, delta: u16) -> FarPtr {
		FarPtr { segment: self.segment, offset: self.offset.wrapping_add(delta) }
	}

	/// Stored in memory as offset then segment, both little-endian.
	pub fn to_le_bytes(self) -> [u8; 4] {
		let offset = self.offset.to_le_bytes();
		let segment = self.segment.to_le_bytes();
		[offset[0], offset[1], segment[0], segment[1]]
	}

	pub fn from_le_bytes(bytes: [u8; 4]) -> FarPtr {
		FarPtr {
			offset: u16::from_le_bytes([bytes[0], bytes[1]]),
			segment: u16::from_le_bytes([bytes[2], bytes[3]]),
		}
	}
}

impl From<(u16, u16)> for FarPtr {
	fn from((segment, offset): (u16, u16)) -> FarPtr {
		FarPtr::new(segment, offset)
	}
}

impl fmt::Display for FarPtr {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{:04X}:{:04X}", self.segment, self.offset)
	}
}
