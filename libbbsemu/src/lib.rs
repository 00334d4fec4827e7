pub mod clock;
pub mod cpu;
pub mod dos_error_codes;
pub mod dos_file_system;
pub mod error;
pub mod exe_loader;
pub mod exe_runtime;
pub mod execution_unit;
pub mod far_ptr;
pub mod interrupts;
pub mod io;
pub mod memory;
pub mod registers;

pub use clock::{Clock, FakeClock, SystemClock};
pub use cpu::{CpuCore, StepResult, HALT_SENTINEL};
pub use dos_error_codes::DosErrorCode;
pub use dos_file_system::{DosFileSystem, StandardDosFileSystem};
pub use error::{EmuError, Result};
pub use exe_loader::{ExecutableImage, MzHeader};
pub use exe_runtime::{ExeRuntime, ExeRuntimeConfig};
pub use execution_unit::{ExecuteOptions, ExecutionUnit, ExportedModule, HostCall, ModuleTable, ReturnValue};
pub use far_ptr::FarPtr;
pub use interrupts::int1ah::Int1Ah;
pub use interrupts::int20h::Int20h;
pub use interrupts::int21h::Int21h;
pub use interrupts::InterruptHandler;
pub use io::pit::ProgrammableIntervalTimer;
pub use io::{IoPortBus, IoPortDevice};
pub use memory::{MemoryCore, SegmentKind};
pub use registers::{CpuRegisters, Flags};
