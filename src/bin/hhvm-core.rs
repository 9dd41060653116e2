use anyhow::Context;
use clap::{Parser, Subcommand};
use hhvm_core::compiler::assembler::assemble;
use hhvm_core::core::value::TypedValue;
use hhvm_core::runtime::unit::Func;
use hhvm_core::vm::dispatch::DispatchMode;
use hhvm_core::vm::executor::{ExecutionConfig, execute_file};
use hhvm_core::vm::opcode::disassemble;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "hhvm-core")]
#[command(about = "Run and inspect bytecode assembly units", long_about = None)]
struct Cli {
    /// Log filter (e.g. `debug`, `hhvm_core::vm=trace`); defaults to $RUST_LOG
    #[arg(long, global = true)]
    log: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Assemble and run a unit
    Run {
        #[arg(name = "FILE")]
        file: PathBuf,

        /// JSON execution configuration
        #[arg(long)]
        config: Option<PathBuf>,

        /// Print line coverage to stderr when the request ends
        #[arg(long)]
        coverage: bool,

        /// Maximum execution time (0 = unlimited)
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Print the pseudo-main's return value
        #[arg(long)]
        print_result: bool,

        /// Print the frame chain of an uncaught fault
        #[arg(long)]
        backtrace: bool,
    },
    /// Print the decoded instruction stream of every function
    Disasm {
        #[arg(name = "FILE")]
        file: PathBuf,
    },
}

fn init_tracing(filter: Option<&str>) {
    let filter = match filter {
        Some(f) => EnvFilter::new(f),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log.as_deref());

    match cli.command {
        Command::Run {
            file,
            config,
            coverage,
            timeout_ms,
            print_result,
            backtrace,
        } => {
            let code = run_file(file, config, coverage, timeout_ms, print_result, backtrace)?;
            std::process::exit(code as i32);
        }
        Command::Disasm { file } => disasm_file(file),
    }
}

fn run_file(
    file: PathBuf,
    config_path: Option<PathBuf>,
    coverage: bool,
    timeout_ms: Option<u64>,
    print_result: bool,
    backtrace: bool,
) -> anyhow::Result<i64> {
    let mut config = match config_path {
        Some(path) => ExecutionConfig::from_file(&path).map_err(|e| anyhow::anyhow!("{}", e))?,
        None => ExecutionConfig::default(),
    };
    config.capture_output = false;
    if coverage {
        config.dispatch = DispatchMode::Coverage;
    }
    if let Some(ms) = timeout_ms {
        config.timeout_ms = ms;
    }
    config.backtrace |= backtrace;

    let result = execute_file(&file, config).map_err(|e| anyhow::anyhow!("{}", e))?;
    let mut stdout = std::io::stdout();
    if print_result {
        writeln!(stdout, "{}", describe(&result.value))?;
    }
    stdout.flush()?;

    if let Some(err) = &result.error {
        eprintln!("Fatal error: {}", err);
        for (i, frame) in result.backtrace.iter().enumerate() {
            eprintln!("#{} {}", i, frame);
        }
    }
    if let Some(report) = &result.coverage {
        eprint!("{}", report);
    }
    Ok(result.exit_code)
}

/// `var_dump`-style one-line rendering
fn describe(value: &TypedValue) -> String {
    match value {
        TypedValue::Uninit | TypedValue::Null => "NULL".to_string(),
        TypedValue::Bool(b) => format!("bool({})", b),
        TypedValue::Int(i) => format!("int({})", i),
        TypedValue::Double(_) => {
            format!("float({})", String::from_utf8_lossy(&value.to_string_bytes()))
        }
        TypedValue::StaticString(_) | TypedValue::String(_) => {
            let bytes = value.to_string_bytes();
            format!("string({}) \"{}\"", bytes.len(), String::from_utf8_lossy(&bytes))
        }
        TypedValue::Array(arr) => format!("array({})", arr.len()),
        TypedValue::Object(obj) => format!("object({})#{}", obj.class_name(), obj.id),
        TypedValue::Ref(r) => describe(&r.get()),
        TypedValue::Class(cls) => format!("class({})", cls.name),
    }
}

fn print_func(out: &mut impl Write, func: &Func) -> anyhow::Result<()> {
    let name = if func.is_pseudo_main { "{main}".to_string() } else { func.full_name() };
    let params: Vec<String> = func
        .params
        .iter()
        .map(|p| format!("{}${}", if p.by_ref { "&" } else { "" }, p.name))
        .collect();
    writeln!(out, "{}({}):", name, params.join(", "))?;
    let listing = disassemble(&func.code).map_err(|e| anyhow::anyhow!("{}: {}", name, e))?;
    for (offset, text) in listing {
        writeln!(out, "  {:>5}  {:<4} {}", offset, func.line_for(offset), text)?;
    }
    for eh in &func.eh_table {
        writeln!(out, "  ; eh [{}, {}) {:?}", eh.base, eh.past, eh.kind)?;
    }
    writeln!(out)?;
    Ok(())
}

fn disasm_file(file: PathBuf) -> anyhow::Result<()> {
    let source =
        fs::read_to_string(&file).with_context(|| format!("Failed to read {}", file.display()))?;
    let unit = assemble(&source, &file.display().to_string()).map_err(|e| anyhow::anyhow!("{}", e))?;
    let mut out = std::io::stdout().lock();
    print_func(&mut out, &unit.main)?;
    for func in &unit.funcs {
        print_func(&mut out, func)?;
    }
    for cls in &unit.classes {
        writeln!(out, "; class {}", cls.name)?;
        for method in &cls.methods {
            print_func(&mut out, method)?;
        }
    }
    Ok(())
}
