use crate::far_ptr::FarPtr;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, EmuError>;

/// Everything that can abort an execution unit's tick loop.
///
/// These are emulation gaps or genuine guest faults. Nothing in the crate
/// catches them; they unwind to whoever is pumping the execution unit.
#[derive(Debug, Error)]
pub enum EmuError {
	#[error("segment {segment:#06x} is not mapped")]
	SegmentNotFound { segment: u16 },

	#[error("access of {length} bytes at {segment:04X}:{offset:04X} runs past the end of the segment")]
	OffsetOutOfRange { segment: u16, offset: u16, length: usize },

	#[error("invalid segment {segment:#06x}: {reason}")]
	InvalidSegment { segment: u16, reason: &'static str },

	#[error("out of variable memory: requested {requested} bytes, {available} available")]
	OutOfMemory { requested: usize, available: usize },

	#[error("no free segment ordinals left")]
	SegmentsExhausted,

	#[error("variable {0:?} has not been allocated")]
	VariableNotFound(String),

	#[error("invalid instruction at {at}")]
	InvalidInstruction { at: FarPtr },

	#[error("unimplemented opcode {mnemonic} at {at}")]
	UnimplementedOpcode { at: FarPtr, mnemonic: String },

	#[error("divide error at {at}")]
	DivideError { at: FarPtr },

	#[error("no handler registered for interrupt {vector:#04x}")]
	UnhandledInterrupt { vector: u8 },

	#[error("I/O ports {start:#06x}..={end:#06x} overlap a device that's already mapped")]
	PortConflict { start: u16, end: u16 },

	#[error("no device registered for I/O port {port:#06x}")]
	UnhandledPort { port: u16 },

	#[error("far call into unknown imported module segment {segment:#06x}")]
	UnknownImportedModule { segment: u16 },

	#[error("module segment {segment:#06x} is already registered")]
	DuplicateModule { segment: u16 },

	#[error("unsupported DOS function AH={function:#04x}")]
	UnsupportedDosFunction { function: u8 },

	#[error("unsupported BIOS function INT {vector:#04x} AH={function:#04x}")]
	UnsupportedBiosFunction { vector: u8, function: u8 },

	#[error("invalid timer request on port {port:#04x}: {reason}")]
	InvalidTimerAccess { port: u16, reason: &'static str },

	#[error("invalid executable image: {0}")]
	InvalidImage(String),

	#[error("command line tail is {0} bytes, DOS allows at most 126")]
	CommandLineTooLong(usize),

	#[error("no executable has been loaded")]
	NotLoaded,

	#[error(transparent)]
	Io(#[from] std::io::Error),
}
