//! loom — run, verify, and test outline programs from the command line.
//!
//! Programs are JSON files (see `loom-core::raw`). Overlay packs are read
//! from `--overlay-dir` as `verbs.<name>.json`; the core pack is mandatory
//! whenever a directory is given.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use loom_core::overlay::{self, ExpandOptions};
use loom_core::policy::CapabilityPolicy;
use loom_core::raw::RawProgram;
use loom_core::receipt::EngineKind;
use loom_core::runner::{Prepared, RunOptions, RunStatus};
use loom_core::value::{Env, Value};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "loom")]
#[command(about = "Dual-engine executor for natural-outline programs")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum EngineArg {
    Interpreter,
    Vm,
}

impl From<EngineArg> for EngineKind {
    fn from(arg: EngineArg) -> Self {
        match arg {
            EngineArg::Interpreter => EngineKind::Interpreter,
            EngineArg::Vm => EngineKind::Vm,
        }
    }
}

#[derive(Debug, Args)]
struct ProgramArgs {
    /// Path to the program JSON file
    program: PathBuf,

    /// Module to run (default: the first module in the program)
    #[arg(long)]
    module: Option<String>,

    /// Input binding, `name=value`; values parse as JSON, else as text
    #[arg(long = "input", value_name = "NAME=VALUE")]
    inputs: Vec<String>,

    /// Directory holding overlay packs; omitting it skips expansion
    #[arg(long)]
    overlay_dir: Option<PathBuf>,

    /// Named overlay pack to load after core (repeatable)
    #[arg(long = "overlay", value_name = "NAME")]
    overlays: Vec<String>,

    /// Fail expansion on any verb without an overlay mapping
    #[arg(long)]
    no_unknown_verbs: bool,

    /// Treat capability shortfalls and policy denials as fatal
    #[arg(long)]
    enforce_capabilities: bool,

    /// Capability policy JSON file
    #[arg(long)]
    policy: Option<PathBuf>,

    /// Root directory for fixture:// URLs
    #[arg(long, default_value = ".")]
    fixture_root: PathBuf,
}

#[derive(Subcommand)]
enum Command {
    /// Run one module and print the outcome
    Run {
        #[command(flatten)]
        program: ProgramArgs,

        /// Engine to run on
        #[arg(long, value_enum, default_value = "interpreter")]
        engine: EngineArg,

        /// Print only the result value
        #[arg(long)]
        result_only: bool,

        /// Include the full receipt in the output
        #[arg(long)]
        receipt: bool,
    },

    /// Run both engines and report receipt parity
    Verify {
        #[command(flatten)]
        program: ProgramArgs,
    },

    /// Execute the modules' embedded tests
    Test {
        #[command(flatten)]
        program: ProgramArgs,

        /// Engine to run on
        #[arg(long, value_enum, default_value = "interpreter")]
        engine: EngineArg,
    },

    /// Print the program after overlay expansion, without running it
    Expand {
        #[command(flatten)]
        program: ProgramArgs,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,loom_core=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            program,
            engine,
            result_only,
            receipt,
        } => run(&program, engine.into(), result_only, receipt),
        Command::Verify { program } => verify(&program),
        Command::Test { program, engine } => test(&program, engine.into()),
        Command::Expand { program } => expand(&program),
    }
}

fn run_options(args: &ProgramArgs) -> Result<RunOptions> {
    let policy = match &args.policy {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading policy file {}", path.display()))?;
            serde_json::from_str::<CapabilityPolicy>(&text)
                .with_context(|| format!("parsing policy file {}", path.display()))?
        }
        None => CapabilityPolicy::default(),
    };
    Ok(RunOptions {
        overlay_dir: args.overlay_dir.clone(),
        overlay_names: args.overlays.clone(),
        no_unknown_verbs: args.no_unknown_verbs,
        enforce_capabilities: args.enforce_capabilities,
        policy,
        granted_capabilities: None,
        fixture_root: args.fixture_root.clone(),
    })
}

fn load(args: &ProgramArgs) -> Result<(Prepared, String)> {
    let text = std::fs::read_to_string(&args.program)
        .with_context(|| format!("reading program {}", args.program.display()))?;
    let prepared = prepare_from(&text, args)?;
    let module = match &args.module {
        Some(name) => name.clone(),
        None => prepared
            .module_names()
            .into_iter()
            .next()
            .context("program has no modules")?,
    };
    for warning in prepared.warnings() {
        tracing::warn!("{}", warning);
    }
    Ok((prepared, module))
}

fn prepare_from(text: &str, args: &ProgramArgs) -> Result<Prepared> {
    let options = run_options(args)?;
    loom_core::runner::prepare_json(text, &options)
        .with_context(|| format!("preparing program {}", args.program.display()))
}

fn parse_inputs(pairs: &[String]) -> Result<Env> {
    let mut env = Env::new();
    for pair in pairs {
        let (name, raw) = pair
            .split_once('=')
            .with_context(|| format!("input '{}' is not NAME=VALUE", pair))?;
        let value = serde_json::from_str::<Value>(raw)
            .unwrap_or_else(|_| Value::Str(raw.to_string()));
        env.insert(name.to_string(), value);
    }
    Ok(env)
}

fn run(args: &ProgramArgs, engine: EngineKind, result_only: bool, receipt: bool) -> Result<()> {
    let (prepared, module) = load(args)?;
    let outcome = prepared.run(&module, parse_inputs(&args.inputs)?, engine);

    if result_only {
        println!("{}", outcome.value);
    } else if receipt {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        for line in &outcome.receipt.logs {
            println!("{}", line);
        }
        match outcome.status {
            RunStatus::Ok => println!("=> {}", outcome.value),
            RunStatus::Error => {}
        }
    }
    if outcome.status == RunStatus::Error {
        bail!(
            "run failed: {}",
            outcome.reason.unwrap_or_else(|| "unknown".to_string())
        );
    }
    Ok(())
}

fn verify(args: &ProgramArgs) -> Result<()> {
    let (prepared, module) = load(args)?;
    let report = prepared.verify(&module, parse_inputs(&args.inputs)?);
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.matches {
        bail!("engine parity broken for '{}'", module);
    }
    Ok(())
}

fn test(args: &ProgramArgs, engine: EngineKind) -> Result<()> {
    let (prepared, _) = load(args)?;
    let modules = match &args.module {
        Some(name) => vec![name.clone()],
        None => prepared.module_names(),
    };

    let mut failed = 0usize;
    let mut total = 0usize;
    for module in &modules {
        for report in prepared.run_tests(module, engine) {
            total += 1;
            if report.passed {
                println!("ok   {} :: {}", report.module, report.name);
            } else {
                failed += 1;
                println!(
                    "FAIL {} :: {} (expected {:?}, got {})",
                    report.module, report.name, report.expected, report.actual
                );
                if let Some(reason) = &report.reason {
                    println!("     {}", reason);
                }
            }
        }
    }
    println!("{} passed, {} failed", total - failed, failed);
    if failed > 0 {
        bail!("{} embedded test(s) failed", failed);
    }
    Ok(())
}

fn expand(args: &ProgramArgs) -> Result<()> {
    let dir = args
        .overlay_dir
        .as_ref()
        .context("expand requires --overlay-dir")?;
    let text = std::fs::read_to_string(&args.program)
        .with_context(|| format!("reading program {}", args.program.display()))?;
    let program = RawProgram::from_json(&text)
        .with_context(|| format!("parsing program {}", args.program.display()))?;

    let options = run_options(args)?;
    let overlays = overlay::load_overlays(dir, &options.overlay_names)?;
    let expand_opts = ExpandOptions {
        no_unknown_verbs: options.no_unknown_verbs,
        enforce_capabilities: options.enforce_capabilities,
        granted_capabilities: options.policy.granted_capabilities(),
    };

    let mut modules = Vec::with_capacity(program.modules.len());
    for module in &program.modules {
        let (expanded, warnings) = overlay::expand_module(module, &overlays, &expand_opts)?;
        for warning in warnings {
            tracing::warn!("{}", warning);
        }
        modules.push(expanded);
    }
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({ "modules": modules }))?
    );
    Ok(())
}
