use crate::error::{EmuError, Result};
use crate::memory::{SegmentKind, SEGMENT_SIZE};

use byteorder::{LittleEndian, ReadBytesExt};

use std::collections::BTreeSet;
use std::io::Cursor;

// https://wiki.osdev.org/MZ

const EXE_PARAGRAPH_BYTES: usize = 16;
const EXE_BLOCK_BYTES: usize = 512;
const MZ_SIGNATURE: u16 = 0x5a4d;
// Some linkers wrote the signature backwards.
const ZM_SIGNATURE: u16 = 0x4d5a;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MzHeader {
	pub signature: u16,
	pub last_block_bytes: u16,
	pub file_block_count: u16,
	pub relocation_items: u16,
	pub header_paragraph_count: u16,
	pub minimum_memory_paragraphs: u16,
	pub maximum_memory_paragraphs: u16,
	pub initial_ss: u16,
	pub initial_sp: u16,
	pub checksum: u16,
	pub initial_ip: u16,
	pub initial_cs: u16,
	pub relocation_table: u16,
	pub overlay: u16,
}

impl MzHeader {
	pub const BYTE_SIZE: usize = 28;

	pub fn parse(stream: &mut impl std::io::Read) -> Result<MzHeader> {
		let mut read = |field: &str| {
			stream.read_u16::<LittleEndian>().map_err(|e| EmuError::InvalidImage(format!("failed to read {}: {}", field, e)))
		};
		let header = MzHeader {
			signature: read("signature")?,
			last_block_bytes: read("last_block_bytes")?,
			file_block_count: read("file_block_count")?,
			relocation_items: read("relocation_items")?,
			header_paragraph_count: read("header_paragraph_count")?,
			minimum_memory_paragraphs: read("minimum_memory_paragraphs")?,
			maximum_memory_paragraphs: read("maximum_memory_paragraphs")?,
			initial_ss: read("initial_ss")?,
			initial_sp: read("initial_sp")?,
			checksum: read("checksum")?,
			initial_ip: read("initial_ip")?,
			initial_cs: read("initial_cs")?,
			relocation_table: read("relocation_table")?,
			overlay: read("overlay")?,
		};
		if header.signature != MZ_SIGNATURE && header.signature != ZM_SIGNATURE {
			return Err(EmuError::InvalidImage(format!("bad signature {:#06x}", header.signature)));
		}
		Ok(header)
	}

	pub fn data_start(&self) -> usize {
		self.header_paragraph_count as usize * EXE_PARAGRAPH_BYTES
	}

	pub fn data_end(&self) -> usize {
		let unused_bytes = if self.last_block_bytes > 0 {
			EXE_BLOCK_BYTES - self.last_block_bytes as usize
		} else {
			0
		};
		(self.file_block_count as usize * EXE_BLOCK_BYTES).saturating_sub(unused_bytes)
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSegment {
	pub kind: SegmentKind,
	pub data: Vec<u8>,
}

/// A word to patch with the ordinal `target_index` ends up loaded at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelocationRecord {
	pub segment_index: usize,
	pub offset: u16,
	pub target_index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageAddress {
	pub segment_index: usize,
	pub offset: u16,
}

/// A relocatable program split into segments, not yet placed anywhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutableImage {
	pub segments: Vec<ImageSegment>,
	pub relocations: Vec<RelocationRecord>,
	pub entry: ImageAddress,
	pub stack: ImageAddress,
}

impl ExecutableImage {
	/// Splits an MZ load module into segments.
	///
	/// MZ files have no segment table, so the segments are whatever
	/// paragraphs the program visibly uses: CS, SS, every relocation site's
	/// segment and every paragraph a relocation points at. Each one gets up to
	/// 64KiB of the load module from its base, so neighbouring segments
	/// overlap and a relocation site is patched in every copy that covers it.
	pub fn from_mz_bytes(bytes: &[u8]) -> Result<ExecutableImage> {
		let mut cursor = Cursor::new(bytes);
		let header = MzHeader::parse(&mut cursor)?;
		let data_start = header.data_start();
		let data_end = header.data_end().min(bytes.len());
		if data_start > data_end {
			return Err(EmuError::InvalidImage(format!("header claims {} bytes, load module ends at {}", data_start, data_end)));
		}
		let load_module = &bytes[data_start..data_end];

		cursor.set_position(header.relocation_table as u64);
		let mut sites = Vec::with_capacity(header.relocation_items as usize);
		for _ in 0..header.relocation_items {
			let offset = cursor.read_u16::<LittleEndian>()
				.map_err(|e| EmuError::InvalidImage(format!("truncated relocation table: {}", e)))?;
			let segment = cursor.read_u16::<LittleEndian>()
				.map_err(|e| EmuError::InvalidImage(format!("truncated relocation table: {}", e)))?;
			let linear = segment as usize * EXE_PARAGRAPH_BYTES + offset as usize;
			let target = load_module.get(linear..linear + 2)
				.map(|word| u16::from_le_bytes([word[0], word[1]]))
				.ok_or_else(|| EmuError::InvalidImage(format!("relocation {:04X}:{:04X} is outside the load module", segment, offset)))?;
			sites.push((segment, linear, target));
		}

		let mut bases = BTreeSet::new();
		bases.insert(header.initial_cs);
		bases.insert(header.initial_ss);
		for (segment, _, target) in &sites {
			bases.insert(*segment);
			bases.insert(*target);
		}
		let bases: Vec<u16> = bases.into_iter().collect();
		let index_of = |paragraph: u16| bases.iter().position(|base| *base == paragraph).unwrap_or_default();

		let segments = bases.iter().map(|base| {
			let start = (*base as usize * EXE_PARAGRAPH_BYTES).min(load_module.len());
			let end = (start + SEGMENT_SIZE).min(load_module.len());
			let kind = if *base == header.initial_cs { SegmentKind::Code } else { SegmentKind::Data };
			ImageSegment { kind, data: load_module[start..end].to_vec() }
		}).collect();

		let mut relocations = vec![];
		for (_, linear, target) in &sites {
			for (segment_index, base) in bases.iter().enumerate() {
				let start = *base as usize * EXE_PARAGRAPH_BYTES;
				if *linear >= start && linear + 2 <= start + SEGMENT_SIZE {
					relocations.push(RelocationRecord { segment_index, offset: (linear - start) as u16, target_index: index_of(*target) });
				}
			}
		}
		tracing::debug!(segments = bases.len(), relocations = relocations.len(), "split MZ image");

		Ok(ExecutableImage {
			segments,
			relocations,
			entry: ImageAddress { segment_index: index_of(header.initial_cs), offset: header.initial_ip },
			stack: ImageAddress { segment_index: index_of(header.initial_ss), offset: header.initial_sp },
		})
	}
}

#[cfg(test)]
pub(crate) mod tests {
	use super::*;

	/// Builds a minimal MZ file: a 32 byte header with the relocation table
	/// inside it, then `load_module`.
	pub(crate) fn build_mz(load_module: &[u8], relocations: &[(u16, u16)], cs_ip: (u16, u16), ss_sp: (u16, u16)) -> Vec<u8> {
		let header_paragraphs = 2 + (relocations.len() * 4 + 15) / 16;
		let total = header_paragraphs * 16 + load_module.len();
		let words: [u16; 14] = [
			MZ_SIGNATURE,
			(total % 512) as u16,
			((total + 511) / 512) as u16,
			relocations.len() as u16,
			header_paragraphs as u16,
			0,
			0xffff,
			ss_sp.0,
			ss_sp.1,
			0,
			cs_ip.1,
			cs_ip.0,
			0x1c,
			0,
		];
		let mut bytes: Vec<u8> = words.iter().flat_map(|word| word.to_le_bytes()).collect();
		for (offset, segment) in relocations {
			bytes.extend(offset.to_le_bytes());
			bytes.extend(segment.to_le_bytes());
		}
		bytes.resize(header_paragraphs * 16, 0);
		bytes.extend(load_module);
		bytes
	}

	#[test] fn test_header_sizes() {
		let bytes = build_mz(&[0x90; 600], &[], (0, 0), (0, 0x100));
		let header = MzHeader::parse(&mut Cursor::new(&bytes)).unwrap();
		assert_eq!(header.data_start(), 32);
		assert_eq!(header.data_end(), 632);
	}

	#[test] fn test_bad_signature() {
		let mut bytes = build_mz(&[0xc3], &[], (0, 0), (0, 0));
		bytes[0] = b'X';
		assert!(matches!(ExecutableImage::from_mz_bytes(&bytes), Err(EmuError::InvalidImage(_))));
		assert!(matches!(ExecutableImage::from_mz_bytes(&bytes[..10]), Err(EmuError::InvalidImage(_))));
	}

	#[test] fn test_segments_from_relocations() {
		// Code at paragraph 0 loading DS from a relocated word, data at paragraph 2.
		let mut load_module = vec![0u8; 0x30];
		// mov ax, 0x0002 (relocated)
		load_module[0..3].copy_from_slice(&[0xb8, 0x02, 0x00]);
		load_module[0x20..0x24].copy_from_slice(b"DATA");
		let bytes = build_mz(&load_module, &[(0x0001, 0x0000)], (0x0000, 0x0000), (0x0002, 0x0100));
		let image = ExecutableImage::from_mz_bytes(&bytes).unwrap();

		assert_eq!(image.segments.len(), 2);
		assert_eq!(image.segments[0].kind, SegmentKind::Code);
		assert_eq!(image.segments[0].data.len(), 0x30);
		assert_eq!(image.segments[1].kind, SegmentKind::Data);
		assert_eq!(&image.segments[1].data[..4], b"DATA");
		assert_eq!(image.entry, ImageAddress { segment_index: 0, offset: 0 });
		assert_eq!(image.stack, ImageAddress { segment_index: 1, offset: 0x100 });
		assert_eq!(image.relocations, vec![RelocationRecord { segment_index: 0, offset: 1, target_index: 1 }]);
	}

	#[test] fn test_overlapping_copies_are_all_relocated() {
		let mut load_module = vec![0u8; 0x40];
		// Site at linear 0x24, inside both the paragraph 0 and paragraph 2 copies.
		load_module[0x24..0x26].copy_from_slice(&0x0003u16.to_le_bytes());
		let bytes = build_mz(&load_module, &[(0x0004, 0x0002)], (0x0000, 0x0000), (0x0000, 0x0100));
		let image = ExecutableImage::from_mz_bytes(&bytes).unwrap();
		assert_eq!(image.segments.len(), 3);
		let mut patched: Vec<(usize, u16)> = image.relocations.iter().map(|r| (r.segment_index, r.offset)).collect();
		patched.sort();
		assert_eq!(patched, vec![(0, 0x24), (1, 0x04)]);
		assert!(image.relocations.iter().all(|r| r.target_index == 2));
	}
}
