// http://stanislavs.org/helppc/dos_error_codes.html

/// Returned to the guest in AX with Carry set. These never become `EmuError`s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DosErrorCode {
	InvalidFunction = 0x01,
	FileNotFound = 0x02,
	PathNotFound = 0x03,
	NoFileHandlesLeft = 0x04,
	AccessDenied = 0x05,
	InvalidFileHandle = 0x06,
	InsufficientMemory = 0x08,
	InvalidFileAccessMode = 0x0c,
	NoMoreFiles = 0x12,
	FileAlreadyExists = 0x50,
}

impl DosErrorCode {
	pub fn code(self) -> u16 {
		self as u8 as u16
	}
}
