use anyhow::Context;
use clap::Parser;
use libbbsemu::{ExeRuntime, ExeRuntimeConfig, ExecutableImage, ModuleTable, StandardDosFileSystem, SystemClock};
use tracing_subscriber::EnvFilter;

use std::path::PathBuf;
use std::sync::Arc;

/// Runs a 16-bit DOS executable with the emulated DOS services.
#[derive(Debug, Parser)]
#[command(version)]
struct Args {
	/// The MZ executable to run.
	exe: PathBuf,

	/// Directory that stands in for the program's current DOS directory.
	#[arg(long, default_value = ".")]
	root: PathBuf,

	/// Log filter, e.g. `libbbsemu=trace`. Falls back to RUST_LOG.
	#[arg(long)]
	log: Option<String>,

	/// Channel number handed to the execution unit.
	#[arg(long, default_value_t = 0)]
	channel: u16,

	/// Passed to the program as its command tail.
	#[arg(trailing_var_arg = true, allow_hyphen_values = true)]
	program_args: Vec<String>,
}

fn main() -> anyhow::Result<()> {
	let args = Args::parse();

	let filter = match &args.log {
		Some(directives) => EnvFilter::try_new(directives).context("invalid --log filter")?,
		None => EnvFilter::from_default_env(),
	};
	tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_writer(std::io::stderr)
		.init();

	let bytes = std::fs::read(&args.exe).with_context(|| format!("failed to read {}", args.exe.display()))?;
	let image = ExecutableImage::from_mz_bytes(&bytes).with_context(|| format!("failed to parse {}", args.exe.display()))?;

	let program_name = args.exe.file_name()
		.map(|name| name.to_string_lossy().to_uppercase())
		.unwrap_or_else(|| "PROGRAM.EXE".to_string());
	let config = ExeRuntimeConfig {
		program_path: format!("C:\\BBSV6\\{}", program_name),
		channel: args.channel,
		..ExeRuntimeConfig::default()
	};

	let mut runtime = ExeRuntime::with_dos(
		config,
		image,
		Arc::new(ModuleTable::new()),
		Arc::new(SystemClock::new()),
		Box::new(StandardDosFileSystem::new(args.root.clone())),
		Box::new(std::io::stdout()),
	).context("failed to set up the DOS machine")?;
	runtime.load(&args.program_args).context("failed to load the executable")?;
	tracing::info!(exe = %args.exe.display(), root = %args.root.display(), "running");
	let exit_code = runtime.run().context("emulation stopped")?;
	tracing::info!(exit_code, "program exited");
	std::process::exit(exit_code as i32);
}
