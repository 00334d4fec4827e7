use crate::error::{EmuError, Result};
use crate::far_ptr::FarPtr;

use iced_x86::{Decoder, DecoderOptions, Instruction};

use std::collections::{BTreeMap, HashMap};

pub const SEGMENT_SIZE: usize = 0x10000;

// The longest legal x86 instruction.
const MAX_INSTRUCTION_BYTES: usize = 15;

pub const STACK_SEGMENT: u16 = 0x0000;
/// Default initial SP for a fresh call.
pub const STACK_BASE: u16 = 0xfffe;
pub const VARIABLES_SEGMENT: u16 = 0x1000;
/// Dynamically allocated segments are handed out from here up to (not
/// including) `DYNAMIC_SEGMENT_LIMIT`. Ordinals above the limit are left for
/// exported modules.
pub const DYNAMIC_SEGMENT_BASE: u16 = 0x2000;
pub const DYNAMIC_SEGMENT_LIMIT: u16 = 0xf000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
	Code,
	Data,
}

#[derive(Debug)]
struct Segment {
	kind: SegmentKind,
	data: Box<[u8]>,
	// Decoded instructions keyed by offset. Pre-filled for code segments,
	// filled lazily for anything else that gets executed.
	instructions: BTreeMap<u16, Instruction>,
}

impl Segment {
	fn new(kind: SegmentKind, contents: &[u8]) -> Segment {
		let mut data = vec![0u8; SEGMENT_SIZE].into_boxed_slice();
		data[..contents.len()].copy_from_slice(contents);
		let instructions = match kind {
			SegmentKind::Code => decode_all(contents),
			SegmentKind::Data => BTreeMap::new(),
		};
		Segment { kind, data, instructions }
	}

	fn invalidate(&mut self, offset: usize, length: usize) {
		if self.instructions.is_empty() || length == 0 {
			return;
		}
		// An instruction starting up to 14 bytes earlier may overlap the write.
		let first = offset.saturating_sub(MAX_INSTRUCTION_BYTES - 1) as u16;
		let last = (offset + length - 1) as u16;
		let stale: Vec<u16> = self.instructions.range(first..=last).map(|(k, _)| *k).collect();
		for key in stale {
			self.instructions.remove(&key);
		}
	}
}

fn decode_all(contents: &[u8]) -> BTreeMap<u16, Instruction> {
	let mut instructions = BTreeMap::new();
	let mut decoder = Decoder::with_ip(16, contents, 0, DecoderOptions::NONE);
	let mut instruction = Instruction::default();
	while decoder.can_decode() {
		decoder.decode_out(&mut instruction);
		// Data mixed into code segments is normal, just skip it.
		if !instruction.is_invalid() {
			instructions.insert(instruction.ip16(), instruction);
		}
	}
	instructions
}

/// All of the emulated address space, organised as 64KiB segments keyed by
/// ordinal rather than as one linear block.
#[derive(Debug)]
pub struct MemoryCore {
	segments: HashMap<u16, Segment>,
	variables: HashMap<String, FarPtr>,
	next_variable_offset: usize,
	// Old contents of every write since `begin_journal`.
	journal: Option<Vec<(FarPtr, Vec<u8>)>>,
}

impl MemoryCore {
	pub fn new() -> MemoryCore {
		let mut memory = MemoryCore {
			segments: HashMap::new(),
			variables: HashMap::new(),
			next_variable_offset: 0,
			journal: None,
		};
		memory.clear();
		memory
	}

	/// Drops every segment and variable. Only the (empty) stack and variable
	/// segments survive.
	pub fn clear(&mut self) {
		self.segments.clear();
		self.variables.clear();
		self.next_variable_offset = 0;
		self.segments.insert(STACK_SEGMENT, Segment::new(SegmentKind::Data, &[]));
		self.segments.insert(VARIABLES_SEGMENT, Segment::new(SegmentKind::Data, &[]));
	}

	/// Creates a segment, replacing whatever was at `ordinal`.
	pub fn add_segment(&mut self, ordinal: u16, kind: SegmentKind, contents: &[u8]) -> Result<()> {
		if contents.len() > SEGMENT_SIZE {
			return Err(EmuError::InvalidSegment { segment: ordinal, reason: "contents larger than 64KiB" });
		}
		self.segments.insert(ordinal, Segment::new(kind, contents));
		Ok(())
	}

	/// Loader-time variant of `add_segment` that refuses to turn an existing
	/// segment into one of a different kind.
	pub fn load_segment(&mut self, ordinal: u16, kind: SegmentKind, contents: &[u8]) -> Result<()> {
		if let Some(existing) = self.segments.get(&ordinal) {
			if existing.kind != kind {
				return Err(EmuError::InvalidSegment { segment: ordinal, reason: "ordinal holds a segment of a different kind" });
			}
		}
		self.add_segment(ordinal, kind, contents)
	}

	/// Hands out the lowest free dynamic ordinal. Ordinals in use are never
	/// returned.
	pub fn allocate_segment(&mut self, kind: SegmentKind) -> Result<u16> {
		let ordinal = (DYNAMIC_SEGMENT_BASE..DYNAMIC_SEGMENT_LIMIT)
			.find(|ordinal| !self.segments.contains_key(ordinal))
			.ok_or(EmuError::SegmentsExhausted)?;
		self.segments.insert(ordinal, Segment::new(kind, &[]));
		Ok(ordinal)
	}

	pub fn has_segment(&self, ordinal: u16) -> bool {
		self.segments.contains_key(&ordinal)
	}

	pub fn segment_kind(&self, ordinal: u16) -> Option<SegmentKind> {
		self.segments.get(&ordinal).map(|segment| segment.kind)
	}

	fn segment(&self, ordinal: u16) -> Result<&Segment> {
		self.segments.get(&ordinal).ok_or(EmuError::SegmentNotFound { segment: ordinal })
	}

	fn segment_mut(&mut self, ordinal: u16) -> Result<&mut Segment> {
		self.segments.get_mut(&ordinal).ok_or(EmuError::SegmentNotFound { segment: ordinal })
	}

	fn check_range(ptr: FarPtr, length: usize) -> Result<std::ops::Range<usize>> {
		let start = ptr.offset as usize;
		if start + length > SEGMENT_SIZE {
			return Err(EmuError::OffsetOutOfRange { segment: ptr.segment, offset: ptr.offset, length });
		}
		Ok(start..start + length)
	}

	pub fn get_array(&self, ptr: impl Into<FarPtr>, length: usize) -> Result<&[u8]> {
		let ptr = ptr.into();
		let segment = self.segment(ptr.segment)?;
		let range = MemoryCore::check_range(ptr, length)?;
		Ok(&segment.data[range])
	}

	pub fn get_byte(&self, ptr: impl Into<FarPtr>) -> Result<u8> {
		Ok(self.get_array(ptr, 1)?[0])
	}

	pub fn get_word(&self, ptr: impl Into<FarPtr>) -> Result<u16> {
		let bytes = self.get_array(ptr, 2)?;
		Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
	}

	pub fn get_dword(&self, ptr: impl Into<FarPtr>) -> Result<u32> {
		let bytes = self.get_array(ptr, 4)?;
		Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
	}

	/// Reads a far pointer stored as offset then segment.
	pub fn get_pointer(&self, ptr: impl Into<FarPtr>) -> Result<FarPtr> {
		let bytes = self.get_array(ptr, 4)?;
		Ok(FarPtr::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
	}

	/// Reads a NUL-terminated string, without the terminator. Stops at the end
	/// of the segment if there's no NUL.
	pub fn get_string(&self, ptr: impl Into<FarPtr>) -> Result<Vec<u8>> {
		let ptr = ptr.into();
		let rest = self.get_array(ptr, SEGMENT_SIZE - ptr.offset as usize)?;
		let end = rest.iter().position(|b| *b == 0).unwrap_or(rest.len());
		Ok(rest[..end].to_vec())
	}

	pub fn set_array(&mut self, ptr: impl Into<FarPtr>, bytes: &[u8]) -> Result<()> {
		let ptr = ptr.into();
		let segment = self.segments.get_mut(&ptr.segment).ok_or(EmuError::SegmentNotFound { segment: ptr.segment })?;
		let range = MemoryCore::check_range(ptr, bytes.len())?;
		if let Some(journal) = self.journal.as_mut() {
			journal.push((ptr, segment.data[range.clone()].to_vec()));
		}
		segment.invalidate(range.start, bytes.len());
		segment.data[range].copy_from_slice(bytes);
		Ok(())
	}

	/// Starts remembering what every write overwrites, until `commit_journal`
	/// or `rollback_journal`.
	pub(crate) fn begin_journal(&mut self) {
		self.journal = Some(vec![]);
	}

	pub(crate) fn commit_journal(&mut self) {
		self.journal = None;
	}

	/// Puts back everything written since `begin_journal`, newest first.
	pub(crate) fn rollback_journal(&mut self) {
		let Some(journal) = self.journal.take() else {
			return;
		};
		for (ptr, old) in journal.into_iter().rev() {
			if let Some(segment) = self.segments.get_mut(&ptr.segment) {
				let start = ptr.offset as usize;
				segment.invalidate(start, old.len());
				segment.data[start..start + old.len()].copy_from_slice(&old);
			}
		}
	}

	pub fn set_byte(&mut self, ptr: impl Into<FarPtr>, value: u8) -> Result<()> {
		self.set_array(ptr, &[value])
	}

	pub fn set_word(&mut self, ptr: impl Into<FarPtr>, value: u16) -> Result<()> {
		self.set_array(ptr, &value.to_le_bytes())
	}

	pub fn set_dword(&mut self, ptr: impl Into<FarPtr>, value: u32) -> Result<()> {
		self.set_array(ptr, &value.to_le_bytes())
	}

	pub fn set_pointer(&mut self, ptr: impl Into<FarPtr>, value: FarPtr) -> Result<()> {
		self.set_array(ptr, &value.to_le_bytes())
	}

	/// The instruction starting at `ptr`, decoding it from the segment bytes if
	/// it wasn't decoded at load time.
	pub fn get_instruction(&mut self, ptr: impl Into<FarPtr>) -> Result<Instruction> {
		let ptr = ptr.into();
		let segment = self.segment_mut(ptr.segment)?;
		if let Some(instruction) = segment.instructions.get(&ptr.offset) {
			return Ok(*instruction);
		}
		let start = ptr.offset as usize;
		let end = (start + MAX_INSTRUCTION_BYTES).min(SEGMENT_SIZE);
		let mut decoder = Decoder::with_ip(16, &segment.data[start..end], start as u64, DecoderOptions::NONE);
		let instruction = decoder.decode();
		if instruction.is_invalid() {
			return Err(EmuError::InvalidInstruction { at: ptr });
		}
		segment.instructions.insert(ptr.offset, instruction);
		Ok(instruction)
	}

	/// Reserves `size` bytes in the variables segment under `name`.
	pub fn allocate_variable(&mut self, name: &str, size: usize) -> Result<FarPtr> {
		if let Some(existing) = self.variables.get(name) {
			tracing::warn!(name, %existing, "variable allocated twice, reusing the existing allocation");
			return Ok(*existing);
		}
		let available = SEGMENT_SIZE - self.next_variable_offset;
		if size > available || available == 0 {
			return Err(EmuError::OutOfMemory { requested: size, available });
		}
		let ptr = FarPtr::new(VARIABLES_SEGMENT, self.next_variable_offset as u16);
		self.next_variable_offset += size;
		self.variables.insert(name.to_string(), ptr);
		tracing::trace!(name, size, %ptr, "allocated variable");
		Ok(ptr)
	}

	pub fn try_get_variable_pointer(&self, name: &str) -> Option<FarPtr> {
		self.variables.get(name).copied()
	}

	pub fn get_variable_pointer(&self, name: &str) -> Result<FarPtr> {
		self.try_get_variable_pointer(name).ok_or_else(|| EmuError::VariableNotFound(name.to_string()))
	}
}

impl Default for MemoryCore {
	fn default() -> MemoryCore {
		MemoryCore::new()
	}
}
