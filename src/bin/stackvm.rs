// Stack VM CLI - Command Line Interface
// Usage: stackvm FILE [OPTIONS]

use clap::Parser;
use colored::*;
use parking_lot::Mutex;
use serde_json::json;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use stackvm_core::bytecode::CodeUnit;
use stackvm_core::error::Fault;
use stackvm_core::vm::value::visit;
use stackvm_core::vm::{Value, Vm, VmConfig};

/// stackvm - run a code unit on the stack virtual machine
#[derive(Parser)]
#[command(name = "stackvm")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run a JSON code unit on the stack virtual machine", long_about = None)]
struct Cli {
    /// Code unit to run (.json)
    file: PathBuf,

    /// Bind a parameter: NAME=JSON (repeatable)
    #[arg(short = 'a', long = "arg", value_name = "NAME=JSON")]
    args: Vec<String>,

    /// Abort after executing this many instructions
    #[arg(long = "budget")]
    budget: Option<u64>,

    /// Maximum call depth
    #[arg(long = "max-depth")]
    max_depth: Option<usize>,

    /// Debug options: asm, warnings (comma-separated)
    #[arg(short = 'd', long = "debug", value_delimiter = ',')]
    debug: Option<Vec<String>>,

    /// Print the result or fault as JSON
    #[arg(long = "json")]
    json: bool,
}

#[derive(Default, Clone)]
struct DebugFlags {
    asm: bool,
    warnings: bool,
}

impl DebugFlags {
    fn from_options(opts: &Option<Vec<String>>) -> Self {
        let mut flags = Self::default();
        if let Some(opts) = opts {
            for opt in opts {
                match opt.as_str() {
                    "asm" => flags.asm = true,
                    "warnings" => flags.warnings = true,
                    _ => eprintln!("{} Unknown debug option: {}", "!".yellow(), opt),
                }
            }
        }
        flags
    }
}

fn main() {
    let cli = Cli::parse();
    let debug = DebugFlags::from_options(&cli.debug);

    match handle_run(&cli, &debug) {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("{} {}", "error:".red().bold(), e);
            std::process::exit(2);
        }
    }
}

/// Load and run the code unit; `Ok(false)` means the program faulted
fn handle_run(cli: &Cli, debug: &DebugFlags) -> Result<bool, String> {
    let source = fs::read_to_string(&cli.file)
        .map_err(|e| format!("Error reading file '{}': {}", cli.file.display(), e))?;
    let code = CodeUnit::from_json(&source).map_err(|e| e.to_string())?;

    if debug.asm {
        println!("{}", "-- Disassembly --".cyan());
        print!("{}", code.disassemble());
        println!();
    }

    let args = cli
        .args
        .iter()
        .map(String::as_str)
        .map(parse_arg)
        .collect::<Result<Vec<_>, _>>()?;

    let mut config = VmConfig::default();
    if let Some(budget) = cli.budget {
        config = config.with_instruction_budget(budget);
    }
    if let Some(depth) = cli.max_depth {
        config = config.with_max_depth(depth);
    }

    let mut vm = Vm::with_config(config);
    let result = vm.run_code(Arc::new(code), args, None);

    if debug.warnings {
        for diagnostic in vm.diagnostics() {
            eprintln!("{} {}", "warning:".yellow().bold(), diagnostic);
        }
    }

    match result {
        Ok(value) => {
            if cli.json {
                println!("{}", json!({ "value": value_to_json(&value) }));
            } else {
                println!("{}", value.repr());
            }
            Ok(true)
        }
        Err(fault) => {
            report_fault(&fault, cli.json);
            Ok(false)
        }
    }
}

fn report_fault(fault: &Fault, as_json: bool) {
    if as_json {
        println!("{}", json!({ "fault": fault }));
    } else {
        eprint!("{}", fault.format());
    }
}

/// Parse `NAME=JSON` into a named argument
fn parse_arg(arg: &str) -> Result<(Arc<str>, Value), String> {
    let (name, raw) = arg
        .split_once('=')
        .ok_or_else(|| format!("argument '{}' is not of the form NAME=JSON", arg))?;
    let parsed: serde_json::Value = serde_json::from_str(raw)
        .map_err(|e| format!("argument '{}' has invalid JSON: {}", name, e))?;
    Ok((Arc::from(name), json_to_value(&parsed)))
}

fn json_to_value(json: &serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::None,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        serde_json::Value::String(s) => Value::str(s),
        serde_json::Value::Array(items) => Value::list(items.iter().map(json_to_value).collect()),
        serde_json::Value::Object(map) => Value::Dict(Arc::new(Mutex::new(
            map.iter()
                .map(|(k, v)| (Value::str(k), json_to_value(v)))
                .collect(),
        ))),
    }
}

fn value_to_json(value: &Value) -> serde_json::Value {
    match value.container_id() {
        // A container reached again while converting itself is rendered as a marker
        Some(id) => visit(&[id], || container_to_json(value)).unwrap_or_else(|| {
            let marker = if matches!(value, Value::Dict(_)) { "{...}" } else { "[...]" };
            json!(marker)
        }),
        None => container_to_json(value),
    }
}

fn container_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::None => serde_json::Value::Null,
        Value::Bool(b) => json!(b),
        Value::Int(i) => json!(i),
        Value::Float(f) => json!(f),
        Value::Str(s) => json!(&**s),
        Value::Tuple(items) => items.iter().map(value_to_json).collect(),
        Value::List(items) => {
            let items = items.lock().clone();
            items.iter().map(value_to_json).collect()
        }
        Value::Dict(pairs) => {
            let pairs = pairs.lock().clone();
            if pairs.iter().all(|(k, _)| matches!(k, Value::Str(_))) {
                let map = pairs
                    .iter()
                    .map(|(k, v)| (k.to_string(), value_to_json(v)))
                    .collect::<serde_json::Map<_, _>>();
                serde_json::Value::Object(map)
            } else {
                pairs
                    .iter()
                    .map(|(k, v)| json!([value_to_json(k), value_to_json(v)]))
                    .collect()
            }
        }
        other => json!(other.to_string()),
    }
}
