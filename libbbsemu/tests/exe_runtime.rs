use libbbsemu::io::pit::PIT_FREQUENCY;
use libbbsemu::{EmuError, ExeRuntime, ExeRuntimeConfig, ExecutableImage, FakeClock, ModuleTable, SegmentKind, StandardDosFileSystem};

use std::io::Write;
use std::sync::{Arc, Mutex};

use time::macros::datetime;

#[derive(Clone, Default)]
struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuffer {
	fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
		self.0.lock().unwrap().extend_from_slice(buf);
		Ok(buf.len())
	}

	fn flush(&mut self) -> std::io::Result<()> {
		Ok(())
	}
}

/// A 32 byte MZ header with the relocation table inside it, then `load_module`.
fn build_mz(load_module: &[u8], relocations: &[(u16, u16)], cs_ip: (u16, u16), ss_sp: (u16, u16)) -> Vec<u8> {
	let header_paragraphs = 2 + (relocations.len() * 4 + 15) / 16;
	let total = header_paragraphs * 16 + load_module.len();
	let words: [u16; 14] = [
		0x5a4d,
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

struct Machine {
	runtime: ExeRuntime,
	console: SharedBuffer,
	_dir: tempfile::TempDir,
}

fn machine(code: &[u8], data: &[(usize, &[u8])]) -> Machine {
	// Code at paragraph 0, data and stack at paragraph 4.
	let mut load_module = code.to_vec();
	load_module.resize(0x80, 0);
	for (offset, bytes) in data {
		load_module[0x40 + offset..0x40 + offset + bytes.len()].copy_from_slice(bytes);
	}
	// The first instruction is always `mov ax, 0x0004`, relocated to the data segment.
	let bytes = build_mz(&load_module, &[(0x0001, 0x0000)], (0x0000, 0x0000), (0x0004, 0x0200));
	let image = ExecutableImage::from_mz_bytes(&bytes).unwrap();

	let dir = tempfile::tempdir().unwrap();
	let console = SharedBuffer::default();
	let runtime = ExeRuntime::with_dos(
		ExeRuntimeConfig::default(),
		image,
		Arc::new(ModuleTable::new()),
		Arc::new(FakeClock::new(10.25, datetime!(2023-07-04 13:45:30))),
		Box::new(StandardDosFileSystem::new(dir.path().to_path_buf())),
		Box::new(console.clone()),
	).unwrap();
	Machine { runtime, console, _dir: dir }
}

const HELLO_PROGRAM: &[u8] = &[
	0xb8, 0x04, 0x00, // mov ax, 0x0004
	0x8e, 0xd8, // mov ds, ax
	0xba, 0x00, 0x00, // mov dx, 0
	0xb4, 0x09, // mov ah, 9
	0xcd, 0x21, // int 21h
	0xb4, 0x40, // mov ah, 0x40
	0xbb, 0x01, 0x00, // mov bx, 1
	0xb9, 0x03, 0x00, // mov cx, 3
	0xba, 0x10, 0x00, // mov dx, 0x10
	0xcd, 0x21, // int 21h
	0xb0, 0x34, // mov al, 0x34
	0xe6, 0x43, // out 0x43, al
	0xe4, 0x40, // in al, 0x40
	0x88, 0xc3, // mov bl, al
	0xe4, 0x40, // in al, 0x40
	0x88, 0xc7, // mov bh, al
	0x89, 0x1e, 0x20, 0x00, // mov [0x20], bx
	0xb4, 0x62, // mov ah, 0x62
	0xcd, 0x21, // int 21h
	0x89, 0x1e, 0x22, 0x00, // mov [0x22], bx
	0xb8, 0x2a, 0x4c, // mov ax, 0x4c2a
	0xcd, 0x21, // int 21h
];

#[test] fn test_hello_program() {
	let mut machine = machine(HELLO_PROGRAM, &[(0x00, b"Hi!$"), (0x10, b"abc")]);
	machine.runtime.load(&["/N1".to_string(), "X".to_string()]).unwrap();
	assert_eq!(machine.runtime.run().unwrap(), 0x2a);
	assert_eq!(machine.console.0.lock().unwrap().as_slice(), b"Hi!abc");

	let initial = *machine.runtime.initial_registers().unwrap();
	let memory = machine.runtime.unit().memory();
	let data_segment = initial.ss;
	assert_ne!(data_segment, initial.cs);
	assert_eq!(memory.segment_kind(initial.cs), Some(SegmentKind::Code));
	assert_eq!(memory.segment_kind(data_segment), Some(SegmentKind::Data));
	assert_eq!(initial.sp, 0x0200);
	assert_eq!(initial.ds, initial.es);
	// Relocated to wherever the data segment landed.
	assert_eq!(memory.get_word((initial.cs, 1)).unwrap(), data_segment);

	let expected_count = (PIT_FREQUENCY * 0.75) as u32 as u16;
	assert_eq!(memory.get_word((data_segment, 0x20)).unwrap(), expected_count);
	// AH=62h hands back the PSP the program started with.
	assert_eq!(memory.get_word((data_segment, 0x22)).unwrap(), initial.ds);
}

#[test] fn test_psp_contents() {
	let mut machine = machine(HELLO_PROGRAM, &[]);
	machine.runtime.load(&["/N1".to_string(), "X".to_string()]).unwrap();
	let psp = machine.runtime.initial_registers().unwrap().ds;
	let memory = machine.runtime.unit().memory();

	assert_eq!(memory.get_array((psp, 0x00), 2).unwrap(), &[0xcd, 0x20]);
	assert_eq!(memory.get_word((psp, 0x02)).unwrap(), 0xa000);
	assert_eq!(memory.get_byte((psp, 0x80)).unwrap(), 6);
	assert_eq!(memory.get_array((psp, 0x81), 7).unwrap(), b" /N1 X\r");

	let environment = memory.get_word((psp, 0x2c)).unwrap();
	assert_eq!(memory.get_string((environment, 0)).unwrap(), b"COMSPEC=C:\\COMMAND.COM");
	assert_eq!(memory.get_string((environment, 23)).unwrap(), b"PATH=C:\\BBSV6");
	// Empty string, then a word count of 1 and the program path.
	assert_eq!(memory.get_array((environment, 37), 3).unwrap(), &[0x00, 0x01, 0x00]);
	assert_eq!(memory.get_string((environment, 40)).unwrap(), b"C:\\BBSV6\\PROGRAM.EXE");
}

#[test] fn test_reload_starts_over() {
	let mut machine = machine(HELLO_PROGRAM, &[(0x00, b"$"), (0x10, b"abc")]);
	machine.runtime.load(&[]).unwrap();
	let first = *machine.runtime.initial_registers().unwrap();
	assert_eq!(machine.runtime.run().unwrap(), 0x2a);
	machine.runtime.load(&[]).unwrap();
	assert_eq!(*machine.runtime.initial_registers().unwrap(), first);
	assert_eq!(machine.runtime.run().unwrap(), 0x2a);
	assert_eq!(machine.console.0.lock().unwrap().as_slice(), b"abcabc");
}

#[test] fn test_unsupported_dos_function_is_fatal() {
	let mut machine = machine(&[
		0xb8, 0x04, 0x00, // mov ax, 0x0004
		0xb4, 0xff, // mov ah, 0xff
		0xcd, 0x21, // int 21h
	], &[]);
	machine.runtime.load(&[]).unwrap();
	assert!(matches!(machine.runtime.run(), Err(EmuError::UnsupportedDosFunction { function: 0xff })));
}

#[test] fn test_bcd_timer_request_is_fatal() {
	let mut machine = machine(&[
		0xb8, 0x04, 0x00, // mov ax, 0x0004
		0xb0, 0x35, // mov al, 0x35
		0xe6, 0x43, // out 0x43, al
	], &[]);
	machine.runtime.load(&[]).unwrap();
	assert!(matches!(machine.runtime.run(), Err(EmuError::InvalidTimerAccess { port: 0x43, .. })));
}

#[test] fn test_program_reads_its_own_arguments() {
	let mut machine = machine(&[
		0xb8, 0x04, 0x00, // mov ax, 0x0004
		0x8e, 0xc0, // mov es, ax
		0x31, 0xc9, // xor cx, cx
		0x8a, 0x0e, 0x80, 0x00, // mov cl, [0x80]
		0xbe, 0x81, 0x00, // mov si, 0x81
		0xbf, 0x00, 0x00, // mov di, 0
		0xfc, // cld
		0xf3, 0xa4, // rep movsb
		0x8e, 0x1e, 0x2c, 0x00, // mov ds, [0x2c]
		0x31, 0xf6, // xor si, si
		0xbf, 0x80, 0x00, // mov di, 0x80
		// Copy environment strings up to the empty one.
		0xac, // lodsb
		0xaa, // stosb
		0x0a, 0x04, // or al, [si]
		0x75, 0xfa, // jnz -6
		0x83, 0xc6, 0x03, // add si, 3
		0xbf, 0x00, 0x01, // mov di, 0x100
		// Then the program path.
		0xac, // lodsb
		0xaa, // stosb
		0x84, 0xc0, // test al, al
		0x75, 0xfa, // jnz -6
		0xb8, 0x00, 0x4c, // mov ax, 0x4c00
		0xcd, 0x21, // int 21h
	], &[]);
	let args = ["/N1", "-Q", "LOGON", "C:\\BBS\\USERS.DAT"].map(String::from);
	machine.runtime.load(&args).unwrap();
	assert_eq!(machine.runtime.run().unwrap(), 0);

	let data_segment = machine.runtime.initial_registers().unwrap().ss;
	let memory = machine.runtime.unit().memory();
	let tail = b" /N1 -Q LOGON C:\\BBS\\USERS.DAT";
	assert_eq!(memory.get_array((data_segment, 0), tail.len()).unwrap(), tail);
	// The carriage return isn't counted in the length byte.
	assert_eq!(memory.get_byte((data_segment, tail.len() as u16)).unwrap(), 0);
	assert_eq!(memory.get_string((data_segment, 0x80)).unwrap(), b"COMSPEC=C:\\COMMAND.COM");
	assert_eq!(memory.get_string((data_segment, 0x80 + 23)).unwrap(), b"PATH=C:\\BBSV6");
	assert_eq!(memory.get_byte((data_segment, 0x80 + 37)).unwrap(), 0);
	assert_eq!(memory.get_string((data_segment, 0x100)).unwrap(), b"C:\\BBSV6\\PROGRAM.EXE");
}

#[test] fn test_far_return_to_psp_exits() {
	let mut machine = machine(&[
		0xb8, 0x04, 0x00, // mov ax, 0x0004
		0x1e, // push ds
		0x31, 0xc0, // xor ax, ax
		0x50, // push ax
		0xcb, // retf
	], &[]);
	machine.runtime.load(&[]).unwrap();
	assert_eq!(machine.runtime.run().unwrap(), 0);
}
