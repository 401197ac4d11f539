mod telemetry;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;
use tolsim_runner::{
    eligible_resistors, preview_perturbation, run_analysis, CancelFlag, CommandToolchain,
    unrepresentable_resistors, RunCancelled, RunConfig, RunReport, TrialOutcome, CONFIG_TEMPLATE,
    DEFAULT_CONFIG_FILE,
};

#[derive(Parser)]
#[command(
    name = "tolsim",
    version,
    about = "Monte-Carlo tolerance sensitivity analysis for circuit builder sources"
)]
struct Cli {
    /// Raise log verbosity (-v debug, -vv trace). RUST_LOG overrides.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Clone, Default)]
struct AnalysisArgs {
    /// YAML config; defaults to ./tolsim.yaml when present.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    trials: Option<usize>,
    /// Fractional tolerance, e.g. 0.05 for 5%.
    #[arg(long)]
    tolerance: Option<f64>,
    #[arg(long = "drift-limit")]
    drift_limit_db: Option<f64>,
    #[arg(long = "target-gain")]
    target_gain_db: Option<f64>,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long)]
    precision: Option<usize>,
}

#[derive(Args, Debug, Clone, Default)]
struct ToolchainArgs {
    #[arg(long)]
    work_dir: Option<PathBuf>,
    #[arg(long)]
    compiler: Option<String>,
    #[arg(long)]
    entry_source: Option<PathBuf>,
    #[arg(long)]
    artifact: Option<PathBuf>,
    #[arg(long)]
    gain_marker: Option<String>,
    #[arg(long)]
    build_timeout_secs: Option<u64>,
    /// Simulator run timeout.
    #[arg(long)]
    timeout_secs: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Perturb, build, and simulate the description N times and judge drift.
    Run {
        description: PathBuf,
        #[command(flatten)]
        analysis: AnalysisArgs,
        #[command(flatten)]
        toolchain: ToolchainArgs,
        /// Also write the full report as JSON to this path.
        #[arg(long)]
        report: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Show the resolved configuration and the resistors that will be varied.
    Describe {
        description: PathBuf,
        #[command(flatten)]
        analysis: AnalysisArgs,
        #[command(flatten)]
        toolchain: ToolchainArgs,
        #[arg(long)]
        json: bool,
    },
    /// Print one perturbed rendition to stdout without touching the file.
    Perturb {
        description: PathBuf,
        #[command(flatten)]
        analysis: AnalysisArgs,
        #[arg(long)]
        json: bool,
    },
    /// Write a commented config template.
    Init {
        #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
        path: PathBuf,
        #[arg(long)]
        force: bool,
    },
}

struct CommandOutput {
    json: Option<Value>,
    exit_code: i32,
}

impl CommandOutput {
    fn done() -> Self {
        Self {
            json: None,
            exit_code: 0,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init_tracing(cli.log_json, telemetry::level_for_verbosity(cli.verbose));
    let json_mode = command_json_mode(&cli.command);
    match run_command(cli.command) {
        Ok(output) => {
            if let Some(payload) = &output.json {
                emit_json(payload);
            }
            if output.exit_code != 0 {
                std::process::exit(output.exit_code);
            }
            Ok(())
        }
        Err(err) => {
            let cancelled = err.downcast_ref::<RunCancelled>().is_some();
            let code = if cancelled { 130 } else { 1 };
            if json_mode {
                let kind = if cancelled { "cancelled" } else { "command_failed" };
                emit_json(&json_error(kind, format!("{:#}", err)));
                std::process::exit(code);
            }
            if cancelled {
                eprintln!("error: {}", err);
                std::process::exit(code);
            }
            Err(err)
        }
    }
}

fn run_command(command: Commands) -> Result<CommandOutput> {
    match command {
        Commands::Run {
            description,
            analysis,
            toolchain,
            report,
            json,
        } => {
            let config = resolve_config(&analysis, &toolchain)?;
            let cancel = CancelFlag::new();
            install_interrupt_handler(&cancel)?;
            let work_dir = config.toolchain.resolve_work_dir(&description);
            let tc = CommandToolchain::new(&config.toolchain, work_dir, cancel.clone());
            let result = run_analysis(&description, &config, &tc, &cancel)?;
            if let Some(path) = &report {
                tolsim_core::atomic_write_json_pretty(path, &result)
                    .with_context(|| format!("failed to write report {}", path.display()))?;
                tracing::info!(path = %path.display(), "wrote report");
            }
            let exit_code = result.verdict.exit_code();
            if json {
                return Ok(CommandOutput {
                    json: Some(json!({
                        "ok": true,
                        "command": "run",
                        "report": result,
                    })),
                    exit_code,
                });
            }
            print_report(&result);
            Ok(CommandOutput {
                json: None,
                exit_code,
            })
        }
        Commands::Describe {
            description,
            analysis,
            toolchain,
            json,
        } => {
            let config = resolve_config(&analysis, &toolchain)?;
            let resistors = eligible_resistors(&description)?;
            let work_dir = config.toolchain.resolve_work_dir(&description);
            let precision = config.analysis.value_precision;
            let too_small: Vec<&str> = unrepresentable_resistors(&resistors, precision)
                .into_iter()
                .map(|r| r.name.as_str())
                .collect();
            if json {
                return Ok(CommandOutput {
                    json: Some(json!({
                        "ok": true,
                        "command": "describe",
                        "description": description.display().to_string(),
                        "work_dir": work_dir.display().to_string(),
                        "config": config,
                        "resistors": resistors,
                        "below_precision": too_small,
                    })),
                    exit_code: 0,
                });
            }
            let a = &config.analysis;
            let t = &config.toolchain;
            println!("description: {}", description.display());
            println!("trials: {}", a.trials);
            println!("tolerance: {}", a.tolerance);
            println!("drift_limit_db: {}", a.drift_limit_db);
            println!("target_gain_db: {}", a.target_gain_db);
            match a.seed {
                Some(seed) => println!("seed: {}", seed),
                None => println!("seed: random"),
            }
            println!("work_dir: {}", work_dir.display());
            println!(
                "build: {} {} -I. {} -o {}",
                t.compiler,
                t.compiler_flags.join(" "),
                t.entry_source.display(),
                t.artifact.display()
            );
            println!("gain_marker: {}=<float>", t.gain_marker);
            println!(
                "timeouts: build {}s, run {}s",
                t.build_timeout_secs, t.run_timeout_secs
            );
            println!("resistors: {}", resistors.len());
            for r in &resistors {
                println!(
                    "  line {:>4}  {:<16} {} -> {}  {}",
                    r.line, r.name, r.node_a, r.node_b, r.value
                );
            }
            for name in &too_small {
                println!(
                    "warning: {} rounds to zero at {} decimal places (raise --precision)",
                    name, precision
                );
            }
            Ok(CommandOutput::done())
        }
        Commands::Perturb {
            description,
            analysis,
            json,
        } => {
            let config = resolve_config(&analysis, &ToolchainArgs::default())?;
            let preview = preview_perturbation(&description, &config.analysis)?;
            if json {
                return Ok(CommandOutput {
                    json: Some(json!({
                        "ok": true,
                        "command": "perturb",
                        "seed": preview.seed,
                        "tolerance": config.analysis.tolerance,
                        "values": preview.perturbation.values,
                    })),
                    exit_code: 0,
                });
            }
            tracing::info!(
                seed = preview.seed,
                resistors = preview.netlist.resistors().len(),
                "perturbed preview"
            );
            print!("{}", preview.perturbation.text);
            Ok(CommandOutput::done())
        }
        Commands::Init { path, force } => {
            if !force && path.exists() {
                return Err(anyhow!(
                    "config already exists (use --force): {}",
                    path.display()
                ));
            }
            tolsim_core::atomic_write_bytes(&path, CONFIG_TEMPLATE.as_bytes())
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!("wrote: {}", path.display());
            println!("next: tolsim describe <builder.h> --config {}", path.display());
            Ok(CommandOutput::done())
        }
    }
}

fn resolve_config(analysis: &AnalysisArgs, toolchain: &ToolchainArgs) -> Result<RunConfig> {
    let cwd = std::env::current_dir()?;
    let mut config = RunConfig::discover(analysis.config.as_deref(), &cwd)?;
    apply_overrides(&mut config, analysis, toolchain);
    config.validate()?;
    Ok(config)
}

fn apply_overrides(config: &mut RunConfig, analysis: &AnalysisArgs, toolchain: &ToolchainArgs) {
    let a = &mut config.analysis;
    if let Some(v) = analysis.trials {
        a.trials = v;
    }
    if let Some(v) = analysis.tolerance {
        a.tolerance = v;
    }
    if let Some(v) = analysis.drift_limit_db {
        a.drift_limit_db = v;
    }
    if let Some(v) = analysis.target_gain_db {
        a.target_gain_db = v;
    }
    if analysis.seed.is_some() {
        a.seed = analysis.seed;
    }
    if let Some(v) = analysis.precision {
        a.value_precision = v;
    }

    let t = &mut config.toolchain;
    if toolchain.work_dir.is_some() {
        t.work_dir = toolchain.work_dir.clone();
    }
    if let Some(v) = &toolchain.compiler {
        t.compiler = v.clone();
    }
    if let Some(v) = &toolchain.entry_source {
        t.entry_source = v.clone();
    }
    if let Some(v) = &toolchain.artifact {
        t.artifact = v.clone();
    }
    if let Some(v) = &toolchain.gain_marker {
        t.gain_marker = v.clone();
    }
    if let Some(v) = toolchain.build_timeout_secs {
        t.build_timeout_secs = v;
    }
    if let Some(v) = toolchain.timeout_secs {
        t.run_timeout_secs = v;
    }
}

fn install_interrupt_handler(cancel: &CancelFlag) -> Result<()> {
    let flag = cancel.clone();
    ctrlc::set_handler(move || {
        if !flag.is_cancelled() {
            tracing::warn!("interrupt received; stopping after restoring the description");
        }
        flag.cancel();
    })
    .context("failed to install interrupt handler")
}

fn print_report(report: &RunReport) {
    println!("description: {}", report.description.display());
    println!("trials: {}", report.trials_requested);
    println!("tolerance: {:.1}%", report.tolerance * 100.0);
    println!("seed: {}", report.seed);
    println!("resistors: {}", report.resistors);
    for trial in &report.trials {
        match &trial.outcome {
            TrialOutcome::Measured { gain, gain_db } => {
                println!("trial {}: gain {:.3} ({:.3} dB)", trial.index, gain, gain_db)
            }
            TrialOutcome::Failed { kind, message } => println!(
                "trial {}: FAILED {}: {}",
                trial.index,
                kind.as_str(),
                first_line(message)
            ),
        }
    }
    println!(
        "succeeded: {}/{}",
        report.trials_succeeded, report.trials_requested
    );
    match &report.summary {
        Some(s) => {
            println!("min_db: {:.3}", s.min_db);
            println!("max_db: {:.3}", s.max_db);
            println!("drift_db: {:.3}", s.drift_db);
            println!(
                "mean_db: {:.3} (target {:.2}, deviation {:+.3})",
                s.mean_db, s.target_gain_db, s.target_deviation_db
            );
            let relation = if s.drift_db <= s.drift_limit_db {
                "<="
            } else {
                ">"
            };
            println!(
                "verdict: {} (drift {:.3} dB {} limit {:.3} dB)",
                report.verdict.as_str(),
                s.drift_db,
                relation,
                s.drift_limit_db
            );
        }
        None => println!(
            "verdict: {} ({})",
            report.verdict.as_str(),
            report
                .empty_result
                .as_deref()
                .unwrap_or("no successful trials")
        ),
    }
}

fn first_line(message: &str) -> &str {
    message.lines().next().unwrap_or("")
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\"}}}}"
        ),
    }
}

fn json_error(code: &str, message: String) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Describe { json, .. }
        | Commands::Perturb { json, .. } => *json,
        Commands::Init { .. } => false,
    }
}
