use crate::dos_error_codes::DosErrorCode;

use byteorder::{ByteOrder, LittleEndian};

use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

// Handles 0-4 are stdin, stdout, stderr, stdaux and stdprn.
pub const FIRST_FILE_HANDLE: u16 = 5;
// FILES=20 in CONFIG.SYS, less the five standard handles.
const MAX_OPEN_FILES: usize = 15;

// http://stanislavs.org/helppc/int_21-4e.html
pub const FIND_RESULT_ATTRIBUTES: usize = 0x15;
pub const FIND_RESULT_SIZE: usize = 0x1a;
pub const FIND_RESULT_NAME: usize = 0x1e;
// 8.3 name, dot and terminator.
const FIND_RESULT_NAME_BYTES: usize = 13;

/// The guest's view of files, by DOS 8.3 name.
pub trait DosFileSystem: std::fmt::Debug + Send {
	/// Returns a file handle if successful. Error code if not.
	fn create(&mut self, filename: &[u8], attributes: u16) -> Result<u16, DosErrorCode>;
	/// Returns a file handle if successful. Error code if not.
	fn open(&mut self, filename: &[u8], access_mode: DosFileAccessMode) -> Result<u16, DosErrorCode>;
	fn close(&mut self, handle: u16) -> Result<(), DosErrorCode>;
	/// Returns the byte count read.
	fn read(&mut self, handle: u16, destination: &mut [u8]) -> Result<u16, DosErrorCode>;
	/// Returns the byte count written.
	fn write(&mut self, handle: u16, data: &[u8]) -> Result<u16, DosErrorCode>;
	/// Returns the new position relative to the start of the file. `offset` is
	/// signed for `Current` and `End`.
	fn seek(&mut self, handle: u16, offset: u32, origin: DosFileSeekOrigin) -> Result<u32, DosErrorCode>;
	/// Fills a find result (the DTA layout) for the first match.
	fn find_first_file(&mut self, destination: &mut [u8], attributes: u16, search_spec: &[u8]) -> Result<(), DosErrorCode>;
	fn find_next_file(&mut self, destination: &mut [u8]) -> Result<(), DosErrorCode>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DosFileAccessMode {
	ReadOnly,
	WriteOnly,
	ReadWrite,
}

impl DosFileAccessMode {
	/// From the low bits of AL for INT 21h AH=3D.
	pub fn from_al(al: u8) -> Option<DosFileAccessMode> {
		match al & 0b111 {
			0 => Some(DosFileAccessMode::ReadOnly),
			1 => Some(DosFileAccessMode::WriteOnly),
			2 => Some(DosFileAccessMode::ReadWrite),
			_ => None,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DosFileSeekOrigin {
	Start,
	Current,
	End,
}

impl DosFileSeekOrigin {
	pub fn from_al(al: u8) -> Option<DosFileSeekOrigin> {
		match al {
			0 => Some(DosFileSeekOrigin::Start),
			1 => Some(DosFileSeekOrigin::Current),
			2 => Some(DosFileSeekOrigin::End),
			_ => None,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DosFileName {
	title: Vec<u8>,
	ext: Vec<u8>,
}

impl DosFileName {
	fn parse(dos_filename: &[u8]) -> DosFileName {
		// Everything lives in the one directory, so drive and path prefixes go.
		let start = dos_filename.iter().rposition(|c| *c == b'\\' || *c == b':').map_or(0, |pos| pos + 1);
		let (title, ext) = split_filename(&dos_filename[start..]);
		DosFileName { title: title.to_ascii_uppercase(), ext: ext.unwrap_or(&[]).to_ascii_uppercase() }
	}

	fn to_bytes(&self) -> Vec<u8> {
		let mut result = self.title.clone();
		if !self.ext.is_empty() {
			result.push(b'.');
			result.extend(&self.ext);
		}
		result
	}

	/// Long host names get truncated to 8.3, with a `~n` suffix when the short
	/// name is already taken.
	fn from_host_name(filename: &str, collision_index: Option<usize>) -> DosFileName {
		let ascii: Vec<u8> = filename.chars()
			.map(|c| if c.is_ascii() { (c as u8).to_ascii_uppercase() } else { b'_' })
			.collect();
		let (title, ext) = split_filename(&ascii);
		let suffix = collision_index.map(|index| format!("~{}", index).into_bytes()).unwrap_or_default();
		let mut title = title.to_vec();
		title.truncate(8 - suffix.len().min(8));
		title.extend(suffix);
		let mut ext = ext.unwrap_or(&[]).to_vec();
		ext.truncate(3);
		DosFileName { title, ext }
	}
}

fn split_filename(filename: &[u8]) -> (&[u8], Option<&[u8]>) {
	match filename.iter().rposition(|c| *c == b'.') {
		Some(dot_pos) => {
			let ext = &filename[dot_pos + 1..];
			(&filename[..dot_pos], Some(&ext[..ext.len().min(3)]))
		}
		None => (filename, None),
	}
}

// https://ss64.com/nt/syntax-wildcards.html
fn wildcard_matches(text: &[u8], pattern: &[u8]) -> bool {
	match pattern.split_first() {
		None => text.is_empty(),
		Some((b'*', rest)) => (0..=text.len()).any(|skip| wildcard_matches(&text[skip..], rest)),
		Some((b'?', rest)) => match text.split_first() {
			Some((_, text_rest)) => wildcard_matches(text_rest, rest),
			// DOS lets trailing ?s match nothing.
			None => rest.iter().all(|c| *c == b'?' || *c == b'*'),
		},
		Some((c, rest)) => text.first() == Some(c) && wildcard_matches(&text[1..], rest),
	}
}

fn filename_matches_spec(filename: &DosFileName, search_spec: &[u8]) -> bool {
	let spec = DosFileName::parse(search_spec);
	let has_ext = split_filename(search_spec).1.is_some();
	wildcard_matches(&filename.title, &spec.title) && (!has_ext || wildcard_matches(&filename.ext, &spec.ext))
}

/// Two-way mapping between host file names and the 8.3 names handed to the
/// guest, rebuilt from the directory listing whenever it's consulted.
#[derive(Debug)]
struct DirListingCache {
	dir_path: PathBuf,
	host_to_dos: HashMap<String, DosFileName>,
	dos_to_host: HashMap<DosFileName, String>,
}

impl DirListingCache {
	fn new(dir_path: PathBuf) -> DirListingCache {
		let mut cache = DirListingCache { dir_path, host_to_dos: HashMap::new(), dos_to_host: HashMap::new() };
		cache.list_dir();
		cache
	}

	fn dos_name(&mut self, host_name: &str) -> DosFileName {
		if let Some(existing) = self.host_to_dos.get(host_name) {
			return existing.clone();
		}
		let mut dos_name = DosFileName::from_host_name(host_name, None);
		let mut collision_index = 1;
		while self.dos_to_host.contains_key(&dos_name) {
			dos_name = DosFileName::from_host_name(host_name, Some(collision_index));
			collision_index += 1;
		}
		self.dos_to_host.insert(dos_name.clone(), host_name.to_string());
		self.host_to_dos.insert(host_name.to_string(), dos_name.clone());
		dos_name
	}

	fn host_name(&mut self, dos_name: &DosFileName) -> String {
		self.list_dir();
		if let Some(existing) = self.dos_to_host.get(dos_name) {
			return existing.clone();
		}
		let guess = String::from_utf8_lossy(&dos_name.to_bytes()).into_owned();
		tracing::warn!(dos_name = %guess, dir = %self.dir_path.display(), "no matching host file, using the DOS name as is");
		self.dos_to_host.insert(dos_name.clone(), guess.clone());
		self.host_to_dos.insert(guess.clone(), dos_name.clone());
		guess
	}

	fn list_dir(&mut self) -> Vec<DosFileName> {
		let mut names = vec![];
		let Ok(read_dir) = std::fs::read_dir(&self.dir_path) else {
			return names;
		};
		let mut host_names: Vec<String> = read_dir
			.filter_map(|entry| entry.ok())
			.filter(|entry| entry.file_type().map(|kind| kind.is_file()).unwrap_or(false))
			.filter_map(|entry| entry.file_name().into_string().ok())
			.collect();
		// Stable ~n suffixes regardless of the order the host lists things in.
		host_names.sort();
		for host_name in host_names {
			names.push(self.dos_name(&host_name));
		}
		names
	}
}

fn io_error_to_dos_error(err: std::io::Error) -> DosErrorCode {
	match err.kind() {
		std::io::ErrorKind::NotFound => DosErrorCode::FileNotFound,
		std::io::ErrorKind::PermissionDenied => DosErrorCode::AccessDenied,
		std::io::ErrorKind::AlreadyExists => DosErrorCode::FileAlreadyExists,
		_ => {
			tracing::warn!(%err, "unexpected host file error");
			DosErrorCode::AccessDenied
		}
	}
}

/// Maps DOS file operations onto a single host directory.
#[derive(Debug)]
pub struct StandardDosFileSystem {
	root_path: PathBuf,
	file_handles: Vec<Option<File>>,
	dir_listing: DirListingCache,
	search_results: Option<VecDeque<DosFileName>>,
}

impl StandardDosFileSystem {
	pub fn new(root_path: PathBuf) -> StandardDosFileSystem {
		StandardDosFileSystem {
			dir_listing: DirListingCache::new(root_path.clone()),
			root_path,
			file_handles: vec![],
			search_results: None,
		}
	}

	fn add_handle(&mut self, file: File) -> Result<u16, DosErrorCode> {
		let slot = match self.file_handles.iter().position(|slot| slot.is_none()) {
			Some(slot) => slot,
			None if self.file_handles.len() < MAX_OPEN_FILES => {
				self.file_handles.push(None);
				self.file_handles.len() - 1
			}
			None => return Err(DosErrorCode::NoFileHandlesLeft),
		};
		self.file_handles[slot] = Some(file);
		Ok(slot as u16 + FIRST_FILE_HANDLE)
	}

	fn file(&mut self, handle: u16) -> Result<&mut File, DosErrorCode> {
		let slot = handle.checked_sub(FIRST_FILE_HANDLE).ok_or(DosErrorCode::InvalidFileHandle)?;
		match self.file_handles.get_mut(slot as usize) {
			Some(Some(file)) => Ok(file),
			_ => Err(DosErrorCode::InvalidFileHandle),
		}
	}

	fn host_path(&mut self, filename: &[u8]) -> PathBuf {
		let host_name = self.dir_listing.host_name(&DosFileName::parse(filename));
		self.root_path.join(host_name)
	}

	fn fill_find_result(&mut self, destination: &mut [u8], dos_name: &DosFileName) {
		let name = dos_name.to_bytes();
		let host_name = self.dir_listing.host_name(dos_name);
		let size = std::fs::metadata(self.root_path.join(host_name)).map(|meta| meta.len()).unwrap_or(0);
		destination[FIND_RESULT_ATTRIBUTES..FIND_RESULT_NAME + FIND_RESULT_NAME_BYTES].iter_mut().for_each(|b| *b = 0);
		LittleEndian::write_u32(&mut destination[FIND_RESULT_SIZE..FIND_RESULT_SIZE + 4], size.min(u32::MAX as u64) as u32);
		destination[FIND_RESULT_NAME..FIND_RESULT_NAME + name.len()].copy_from_slice(&name);
	}
}

impl DosFileSystem for StandardDosFileSystem {
	fn create(&mut self, filename: &[u8], _attributes: u16) -> Result<u16, DosErrorCode> {
		let path = self.host_path(filename);
		let file = std::fs::OpenOptions::new()
			.read(true)
			.write(true)
			.create(true)
			.truncate(true)
			.open(path)
			.map_err(io_error_to_dos_error)?;
		self.add_handle(file)
	}

	fn open(&mut self, filename: &[u8], access_mode: DosFileAccessMode) -> Result<u16, DosErrorCode> {
		let path = self.host_path(filename);
		let file = std::fs::OpenOptions::new()
			.read(access_mode != DosFileAccessMode::WriteOnly)
			.write(access_mode != DosFileAccessMode::ReadOnly)
			.open(path)
			.map_err(io_error_to_dos_error)?;
		self.add_handle(file)
	}

	fn close(&mut self, handle: u16) -> Result<(), DosErrorCode> {
		self.file(handle)?;
		self.file_handles[(handle - FIRST_FILE_HANDLE) as usize] = None;
		Ok(())
	}

	fn read(&mut self, handle: u16, destination: &mut [u8]) -> Result<u16, DosErrorCode> {
		let file = self.file(handle)?;
		let mut total = 0;
		// Short reads only at end of file, the way DOS reports them.
		while total < destination.len() {
			match file.read(&mut destination[total..]) {
				Ok(0) => break,
				Ok(count) => total += count,
				Err(err) => return Err(io_error_to_dos_error(err)),
			}
		}
		Ok(total as u16)
	}

	fn write(&mut self, handle: u16, data: &[u8]) -> Result<u16, DosErrorCode> {
		let file = self.file(handle)?;
		file.write_all(data).map_err(io_error_to_dos_error)?;
		Ok(data.len() as u16)
	}

	fn seek(&mut self, handle: u16, offset: u32, origin: DosFileSeekOrigin) -> Result<u32, DosErrorCode> {
		let file = self.file(handle)?;
		let seek_from = match origin {
			DosFileSeekOrigin::Start => SeekFrom::Start(offset as u64),
			DosFileSeekOrigin::Current => SeekFrom::Current(offset as i32 as i64),
			DosFileSeekOrigin::End => SeekFrom::End(offset as i32 as i64),
		};
		let position = file.seek(seek_from).map_err(io_error_to_dos_error)?;
		Ok(position as u32)
	}

	fn find_first_file(&mut self, destination: &mut [u8], _attributes: u16, search_spec: &[u8]) -> Result<(), DosErrorCode> {
		let matches = self.dir_listing.list_dir()
			.into_iter()
			.filter(|dos_name| filename_matches_spec(dos_name, search_spec))
			.collect();
		self.search_results = Some(matches);
		self.find_next_file(destination)
	}

	fn find_next_file(&mut self, destination: &mut [u8]) -> Result<(), DosErrorCode> {
		let next = self.search_results.as_mut().and_then(|results| results.pop_front());
		match next {
			Some(dos_name) => {
				tracing::trace!(name = %String::from_utf8_lossy(&dos_name.to_bytes()), "found file");
				self.fill_find_result(destination, &dos_name);
				Ok(())
			}
			None => Err(DosErrorCode::NoMoreFiles),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn dos_name_of(cache: &mut DirListingCache, host_name: &str) -> String {
		String::from_utf8_lossy(&cache.dos_name(host_name).to_bytes()).into_owned()
	}

	#[test] fn test_dir_listing_cache() {
		let dir = tempfile::tempdir().unwrap();
		let mut cache = DirListingCache::new(dir.path().to_path_buf());
		assert_eq!(dos_name_of(&mut cache, "foot.text"), "FOOT.TEX");
		assert_eq!(dos_name_of(&mut cache, "foot.text2"), "FOOT~1.TEX");
		assert_eq!(dos_name_of(&mut cache, "filewithlongname.txt"), "FILEWITH.TXT");
		assert_eq!(dos_name_of(&mut cache, "filewithlongername.txt"), "FILEWI~1.TXT");
		assert_eq!(dos_name_of(&mut cache, "filewithlongerername.txt"), "FILEWI~2.TXT");
		assert_eq!(dos_name_of(&mut cache, "foot.text"), "FOOT.TEX");
	}

	#[test] fn test_wildcards() {
		let name = DosFileName::parse(b"USERS.DAT");
		assert!(filename_matches_spec(&name, b"*.*"));
		assert!(filename_matches_spec(&name, b"*.DAT"));
		assert!(filename_matches_spec(&name, b"US?RS.D?T"));
		assert!(filename_matches_spec(&name, b"USERS???.DAT"));
		assert!(filename_matches_spec(&name, b"users.dat"));
		assert!(!filename_matches_spec(&name, b"*.TXT"));
		assert!(!filename_matches_spec(&name, b"U?.DAT"));
	}

	#[test] fn test_files_resolve_case_insensitively() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::write(dir.path().join("Welcome.Ans"), b"hello").unwrap();
		let mut fs = StandardDosFileSystem::new(dir.path().to_path_buf());
		let handle = fs.open(b"C:\\BBS\\WELCOME.ANS", DosFileAccessMode::ReadOnly).unwrap();
		assert_eq!(handle, FIRST_FILE_HANDLE);
		let mut buffer = [0u8; 16];
		assert_eq!(fs.read(handle, &mut buffer), Ok(5));
		assert_eq!(&buffer[..5], b"hello");
		assert_eq!(fs.seek(handle, (-2i32) as u32, DosFileSeekOrigin::End), Ok(3));
		fs.close(handle).unwrap();
		assert_eq!(fs.close(handle), Err(DosErrorCode::InvalidFileHandle));
		assert_eq!(fs.open(b"MISSING.DAT", DosFileAccessMode::ReadOnly), Err(DosErrorCode::FileNotFound));
	}

	#[test] fn test_create_and_write() {
		let dir = tempfile::tempdir().unwrap();
		let mut fs = StandardDosFileSystem::new(dir.path().to_path_buf());
		let handle = fs.create(b"NODE1.LOG", 0).unwrap();
		assert_eq!(fs.write(handle, b"logged on"), Ok(9));
		fs.close(handle).unwrap();
		assert_eq!(std::fs::read(dir.path().join("NODE1.LOG")).unwrap(), b"logged on");
	}

	#[test] fn test_created_file_reads_back() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::write(dir.path().join("NODE1.LOG"), b"stale contents").unwrap();
		let mut fs = StandardDosFileSystem::new(dir.path().to_path_buf());
		let handle = fs.create(b"NODE1.LOG", 0).unwrap();
		assert_eq!(fs.write(handle, b"abc"), Ok(3));
		assert_eq!(fs.seek(handle, 0, DosFileSeekOrigin::Start), Ok(0));
		let mut buffer = [0u8; 8];
		assert_eq!(fs.read(handle, &mut buffer), Ok(3));
		assert_eq!(&buffer[..3], b"abc");
	}

	#[test] fn test_handles_run_out() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::write(dir.path().join("SHARED.DAT"), b"").unwrap();
		let mut fs = StandardDosFileSystem::new(dir.path().to_path_buf());
		let handles: Vec<u16> = (0..MAX_OPEN_FILES).map(|_| fs.open(b"SHARED.DAT", DosFileAccessMode::ReadOnly).unwrap()).collect();
		assert_eq!(handles.last(), Some(&(FIRST_FILE_HANDLE + MAX_OPEN_FILES as u16 - 1)));
		assert_eq!(fs.open(b"SHARED.DAT", DosFileAccessMode::ReadOnly), Err(DosErrorCode::NoFileHandlesLeft));
		// A closed handle is handed out again.
		fs.close(handles[3]).unwrap();
		assert_eq!(fs.open(b"SHARED.DAT", DosFileAccessMode::ReadOnly), Ok(handles[3]));
	}

	#[test] fn test_find_files() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::write(dir.path().join("a.dat"), b"12345").unwrap();
		std::fs::write(dir.path().join("b.dat"), b"").unwrap();
		std::fs::write(dir.path().join("c.txt"), b"").unwrap();
		let mut fs = StandardDosFileSystem::new(dir.path().to_path_buf());
		let mut dta = [0xffu8; 128];
		fs.find_first_file(&mut dta, 0, b"*.DAT").unwrap();
		assert_eq!(&dta[FIND_RESULT_NAME..FIND_RESULT_NAME + 6], b"A.DAT\0");
		assert_eq!(LittleEndian::read_u32(&dta[FIND_RESULT_SIZE..]), 5);
		fs.find_next_file(&mut dta).unwrap();
		assert_eq!(&dta[FIND_RESULT_NAME..FIND_RESULT_NAME + 6], b"B.DAT\0");
		assert_eq!(fs.find_next_file(&mut dta), Err(DosErrorCode::NoMoreFiles));
	}
}
