//! Headless ARM2 runner.
//!
//! Assembles a source file, loads it into a fresh machine, runs to
//! completion, and maps the outcome onto the process exit code: the low
//! eight bits of the guest's EXIT argument, or a distinct non-zero code
//! per error class.

use std::io::Write as _;
use std::path::PathBuf;
use std::process;

use acorn_arm2::decode;
use arm2_asm::{AsmConfig, assemble_file};
use arm2_vm::{RunEvent, TraceEvent, Tracer, Vm, VmConfig, VmError, load};

/// Exit codes for non-guest outcomes.
mod exit_code {
    pub const USAGE: i32 = 64;
    pub const PARSE: i32 = 65;
    pub const MEMORY_FAULT: i32 = 66;
    pub const UNDEFINED_INSTRUCTION: i32 = 67;
    pub const UNKNOWN_SYSCALL: i32 = 68;
    pub const CYCLE_LIMIT: i32 = 69;
    pub const TIMEOUT: i32 = 70;
    pub const ASSERTION: i32 = 71;
    pub const STRING_TOO_LONG: i32 = 72;
    pub const LOAD: i32 = 73;
}

struct CliArgs {
    source: PathBuf,
    entry: Option<String>,
    cycle_limit: Option<u64>,
    timeout_secs: Option<u64>,
    fs_root: Option<PathBuf>,
    stdin_path: Option<PathBuf>,
    trace: bool,
}

fn usage() -> ! {
    eprintln!(
        "usage: arm2-run [--entry SYMBOL] [--cycle-limit N] [--timeout SECS|0] \
         [--fs-root DIR] [--stdin FILE] [--trace] FILE.s"
    );
    process::exit(exit_code::USAGE);
}

fn parse_args() -> CliArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut cli = CliArgs {
        source: PathBuf::new(),
        entry: None,
        cycle_limit: None,
        timeout_secs: None,
        fs_root: None,
        stdin_path: None,
        trace: false,
    };
    let mut source = None;
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--entry" => {
                i += 1;
                cli.entry = args.get(i).cloned();
            }
            "--cycle-limit" => {
                i += 1;
                cli.cycle_limit = args.get(i).and_then(|s| s.parse().ok());
                if cli.cycle_limit.is_none() {
                    usage();
                }
            }
            "--timeout" => {
                i += 1;
                match args.get(i).and_then(|s| s.parse().ok()) {
                    Some(secs) => cli.timeout_secs = Some(secs),
                    None => usage(),
                }
            }
            "--fs-root" => {
                i += 1;
                cli.fs_root = args.get(i).map(PathBuf::from);
            }
            "--stdin" => {
                i += 1;
                cli.stdin_path = args.get(i).map(PathBuf::from);
            }
            "--trace" => cli.trace = true,
            "--help" | "-h" => usage(),
            other if other.starts_with('-') => {
                eprintln!("unknown option '{other}'");
                usage();
            }
            other => {
                if source.replace(PathBuf::from(other)).is_some() {
                    usage();
                }
            }
        }
        i += 1;
    }
    match source {
        Some(path) => cli.source = path,
        None => usage(),
    }
    cli
}

/// Prints one line per executed instruction to stderr.
struct StderrTrace;

impl Tracer for StderrTrace {
    fn event(&mut self, event: &TraceEvent) {
        if let TraceEvent::Exec { addr, opcode } = event {
            let text = decode(*opcode).map_or_else(
                |_| format!(".word {opcode:#010X}"),
                |instr| instr.disassemble(*addr),
            );
            eprintln!("{addr:08X}  {text}");
        }
    }
}

fn error_exit_code(error: &VmError) -> i32 {
    match error {
        VmError::Cpu(acorn_arm2::CpuFault::Mem(_)) | VmError::Memory(_) => {
            exit_code::MEMORY_FAULT
        }
        VmError::Cpu(acorn_arm2::CpuFault::Undefined { .. }) => {
            exit_code::UNDEFINED_INSTRUCTION
        }
        VmError::UnknownSyscall(_) => exit_code::UNKNOWN_SYSCALL,
        VmError::CycleLimit => exit_code::CYCLE_LIMIT,
        VmError::WallClockTimeout => exit_code::TIMEOUT,
        VmError::AssertionFailed { .. } => exit_code::ASSERTION,
        VmError::StringTooLong { .. } => exit_code::STRING_TOO_LONG,
    }
}

fn main() {
    let cli = parse_args();

    let asm_config = AsmConfig::default();
    let program = match assemble_file(&cli.source, &asm_config) {
        Ok(program) => program,
        Err(error) => {
            eprintln!("{error}");
            process::exit(exit_code::PARSE);
        }
    };
    for warning in &program.warnings {
        eprintln!("{warning}");
    }

    let mut vm_config = VmConfig::default();
    if let Some(limit) = cli.cycle_limit {
        vm_config.cycle_limit = limit;
    }
    if let Some(secs) = cli.timeout_secs {
        vm_config.wall_clock_ms = secs * 1000;
    }
    if let Some(root) = &cli.fs_root {
        vm_config.fs_root.clone_from(root);
    }

    let mut vm = Vm::new(vm_config);
    if cli.trace {
        vm.add_tracer(Box::new(StderrTrace));
    }
    if let Err(error) = load(&mut vm, &program) {
        eprintln!("{error}");
        process::exit(exit_code::LOAD);
    }

    if let Some(entry) = &cli.entry {
        match program.symbols.lookup(entry) {
            Some(symbol) => vm.cpu.regs.set_pc(symbol.value),
            None => {
                eprintln!("entry symbol '{entry}' is not defined");
                process::exit(exit_code::USAGE);
            }
        }
    }

    if let Some(path) = &cli.stdin_path {
        match std::fs::read(path) {
            Ok(bytes) => {
                vm.io.send_stdin(&bytes);
                vm.io.close_stdin();
            }
            Err(error) => {
                eprintln!("cannot read stdin file {}: {error}", path.display());
                process::exit(exit_code::USAGE);
            }
        }
    }

    let code = loop {
        match vm.run() {
            // A stray DEBUG_BREAK in a headless run just keeps going
            Ok(RunEvent::DebugBreak) => {}
            Ok(RunEvent::Paused) => {}
            Ok(RunEvent::Halted(code)) => break i32::from(code),
            Err(error) => {
                eprintln!("{error}");
                break error_exit_code(&error);
            }
        }
    };

    let output = vm.io.drain_stdout();
    let mut stdout = std::io::stdout();
    let _ = stdout.write_all(&output);
    let _ = stdout.flush();
    process::exit(code);
}
