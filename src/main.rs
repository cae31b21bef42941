//! Thin CLI layer: parse args, styled output, and call into loomlab-core.
//! Crash-proof: panic caught and reported; all errors return Result.

use clap::builder::PossibleValuesParser;
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use loomlab_core::{
    load_config, load_config_from, DispatcherKind, Experiment, ExperimentConfig, ExperimentReport,
    LagSpec,
};
use std::env;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;
use tracing_subscriber::EnvFilter;

// ---- UI helpers (no-op when stdout isn't a TTY) ----

fn use_color() -> bool {
    std::io::stdout().is_terminal()
        && env::var("NO_COLOR").unwrap_or_default().is_empty()
}

#[derive(Clone, Copy)]
enum Tone {
    Success,
    Error,
    Warning,
    Info,
    Dim,
}

/// Print one line in `tone`; errors and warnings go to stderr.
fn say(tone: Tone, msg: &str) {
    let styled = if !use_color() {
        msg.normal()
    } else {
        match tone {
            Tone::Success => msg.green(),
            Tone::Error => msg.red(),
            Tone::Warning => msg.yellow(),
            Tone::Info => msg.cyan(),
            Tone::Dim => msg.dimmed(),
        }
    };
    match tone {
        Tone::Error | Tone::Warning => eprintln!("{}", styled),
        _ => println!("{}", styled),
    }
}

/// Library events go to stderr so `--json` output on stdout stays parseable.
fn init_logging(quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else {
        EnvFilter::try_from_env("LOOMLAB_LOG").unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .try_init();
}

fn experiment_args(cmd: Command) -> Command {
    cmd.arg(
        Arg::new("tasks")
            .short('n')
            .long("tasks")
            .value_parser(value_parser!(usize))
            .help("Number of tasks in the batch (default: 1000)"),
    )
    .arg(
        Arg::new("workers")
            .short('w')
            .long("workers")
            .value_parser(value_parser!(usize))
            .help("Worker threads for the fixed pool (default: CPU count)"),
    )
    .arg(
        Arg::new("lag-min")
            .long("lag-min")
            .value_parser(value_parser!(u64))
            .help("Minimum lag before and after each task, in ms"),
    )
    .arg(
        Arg::new("lag-max")
            .long("lag-max")
            .value_parser(value_parser!(u64))
            .help("Maximum lag before and after each task, in ms"),
    )
    .arg(
        Arg::new("work")
            .long("work")
            .value_parser(["double", "prime"])
            .help("Computation per task (default: prime)"),
    )
    .arg(
        Arg::new("timeout")
            .long("timeout")
            .value_parser(value_parser!(u64))
            .help("Join timeout in ms; remaining tasks are cancelled when it passes"),
    )
    .arg(
        Arg::new("sampling")
            .long("sampling")
            .value_parser(["enter", "exit"])
            .help("Where the peak is sampled (default: enter)"),
    )
    .arg(
        Arg::new("json")
            .long("json")
            .action(ArgAction::SetTrue)
            .help("Print the report as JSON"),
    )
}

/// File config, then LOOMLAB_* env, then flags from `sub` when given.
fn effective_config(
    config_path: Option<&String>,
    sub: Option<&ArgMatches>,
) -> Result<ExperimentConfig, String> {
    let mut config = match config_path {
        Some(path) => load_config_from(Path::new(path)),
        None => {
            let cwd = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
            load_config(&cwd)
        }
    }
    .map_err(|e| format!("Failed to load config: {}", e))?;
    config.apply_process_env().map_err(|e| e.to_string())?;
    if let Some(sub) = sub {
        apply_flags(&mut config, sub)?;
    }
    config.validate().map_err(|e| e.to_string())?;
    debug!(?config, "effective config");
    Ok(config)
}

fn apply_flags(config: &mut ExperimentConfig, sub: &ArgMatches) -> Result<(), String> {
    if let Some(n) = sub.get_one::<usize>("tasks") {
        config.tasks = *n;
    }
    if let Some(n) = sub.get_one::<usize>("workers") {
        config.workers = *n;
    }
    if let Some(w) = sub.get_one::<String>("work") {
        config.workload = w.parse()?;
    }
    if let Some(ms) = sub.get_one::<u64>("timeout") {
        config.timeout_ms = Some(*ms);
    }
    if let Some(s) = sub.get_one::<String>("sampling") {
        config.sampling = s.parse()?;
    }
    let lag_min = sub.get_one::<u64>("lag-min").copied();
    let lag_max = sub.get_one::<u64>("lag-max").copied();
    if lag_min.is_some() || lag_max.is_some() {
        let current = config.lag.unwrap_or_default();
        let minimum = lag_min.map(Duration::from_millis).unwrap_or(current.minimum());
        let maximum = lag_max
            .map(Duration::from_millis)
            .unwrap_or(current.maximum().max(minimum));
        config.lag = Some(LagSpec::new(minimum, maximum).map_err(|e| e.to_string())?);
    }
    Ok(())
}

fn describe_lag(lag: Option<LagSpec>) -> String {
    match lag {
        None => "no lag".to_string(),
        Some(l) if l.minimum() == l.maximum() => format!("lag {:?}", l.minimum()),
        Some(l) => format!("lag {:?}..{:?}", l.minimum(), l.maximum()),
    }
}

fn print_report(report: &ExperimentReport) {
    say(Tone::Info, &format!(
        "{}: {} tasks, workload {}, {}",
        report.label,
        report.tasks,
        report.workload,
        describe_lag(report.lag)
    ));
    let capacity = report
        .capacity
        .map(|c| format!(" (capacity {})", c))
        .unwrap_or_default();
    println!("  peak        {}{}", report.peak, capacity);
    println!("  elapsed     {:.1} ms", report.elapsed_ms);
    println!("  throughput  {:.0} tasks/s", report.throughput);
    println!(
        "  succeeded {}  failed {}  cancelled {}  pending {}",
        report.succeeded, report.failed, report.cancelled, report.pending
    );
    say(Tone::Dim, &format!("  checksum {}  started {}", report.checksum, report.started_at.format("%H:%M:%S%.3f")));
}

fn print_table(reports: &[ExperimentReport]) {
    println!(
        "{:<16} {:>6} {:>9} {:>12} {:>12} {:>10}",
        "dispatcher", "peak", "capacity", "elapsed ms", "tasks/s", "cancelled"
    );
    for r in reports {
        let capacity = r.capacity.map(|c| c.to_string()).unwrap_or_else(|| "-".to_string());
        println!(
            "{:<16} {:>6} {:>9} {:>12.1} {:>12.0} {:>10}",
            r.label, r.peak, capacity, r.elapsed_ms, r.throughput, r.cancelled
        );
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("Failed to serialize: {}", e))
}

fn cmd_run(config_path: Option<&String>, sub: &ArgMatches) -> Result<(), String> {
    let mut config = effective_config(config_path, Some(sub))?;
    if let Some(d) = sub.get_one::<String>("dispatcher") {
        config.dispatcher = d.parse()?;
    }
    let experiment = Experiment::from_config(&config);
    debug!(dispatcher = %config.dispatcher, tasks = config.tasks, "starting run");
    let report = experiment
        .run_kind(config.dispatcher)
        .map_err(|e| format!("Experiment failed: {}", e))?;

    if sub.get_flag("json") {
        println!("{}", to_json(&report)?);
        return Ok(());
    }
    print_report(&report);
    if report.partial {
        say(Tone::Warning, &format!("Join timed out; {} task(s) never finished.", report.pending));
    } else if report.cancelled > 0 {
        say(Tone::Warning, &format!("Join timed out; {} task(s) cancelled.", report.cancelled));
    } else {
        say(Tone::Success, "Done.");
    }
    Ok(())
}

fn cmd_compare(config_path: Option<&String>, sub: &ArgMatches, quiet: bool) -> Result<(), String> {
    let config = effective_config(config_path, Some(sub))?;
    let experiment = Experiment::from_config(&config);
    let json_out = sub.get_flag("json");
    let baselines = !sub.get_flag("no-baselines");
    let kinds = DispatcherKind::all();

    let runs = kinds.len() as u64 + if baselines { 2 } else { 0 };
    let bar = if json_out || quiet || !std::io::stderr().is_terminal() {
        ProgressBar::hidden()
    } else {
        ProgressBar::new(runs)
    };
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{bar:30.cyan/blue} {pos}/{len} {msg}")
            .map_err(|e| e.to_string())?,
    );
    bar.set_message(format!("{} tasks", config.tasks));
    let reports = experiment
        .compare(&kinds, baselines, |report| {
            bar.set_message(report.label.clone());
            bar.inc(1);
        })
        .map_err(|e| format!("Experiment failed: {}", e));
    bar.finish_and_clear();
    let reports = reports?;

    if json_out {
        println!("{}", to_json(&reports)?);
        return Ok(());
    }
    say(Tone::Info, &format!(
        "{} tasks, workload {}, {}, {} workers",
        config.tasks,
        config.workload,
        describe_lag(config.lag),
        config.workers
    ));
    print_table(&reports);
    if reports.iter().any(|r| r.partial || r.cancelled > 0) {
        say(Tone::Warning, "Some runs hit the join timeout; their numbers are incomplete.");
    }
    Ok(())
}

fn cmd_lag(sub: &ArgMatches) -> Result<(), String> {
    let min = *sub.get_one::<u64>("min").unwrap_or(&0);
    let max = sub.get_one::<u64>("max").copied().unwrap_or(min);
    let samples = *sub.get_one::<usize>("samples").unwrap_or(&1000);
    if samples == 0 {
        return Err("--samples must be at least 1".to_string());
    }
    let spec = LagSpec::from_millis(min, max).map_err(|e| e.to_string())?;

    // Streamed in f64 milliseconds: a Duration sum overflows for huge lags.
    let ms = |d: Duration| d.as_secs_f64() * 1000.0;
    let (lo, hi, total) = (0..samples)
        .map(|_| ms(spec.compute_duration()))
        .fold((f64::INFINITY, 0.0f64, 0.0f64), |(lo, hi, total), d| {
            (lo.min(d), hi.max(d), total + d)
        });
    let mean = total / samples as f64;

    if sub.get_flag("json") {
        let v = serde_json::json!({
            "lag": spec,
            "samples": samples,
            "min_ms": lo,
            "mean_ms": mean,
            "max_ms": hi,
        });
        println!("{}", to_json(&v)?);
        return Ok(());
    }
    say(Tone::Info, &format!("{} samples from {}", samples, describe_lag(Some(spec))));
    println!("  min   {:.3} ms", lo);
    println!("  mean  {:.3} ms", mean);
    println!("  max   {:.3} ms", hi);
    Ok(())
}

fn run() -> Result<(), String> {
    let dispatcher_names: Vec<&'static str> =
        DispatcherKind::all().into_iter().map(|k| k.as_str()).collect();

    let matches = Command::new("loomlab")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Eric Kolotyluk <eric@kolotyluk.net>")
        .about("Throughput experiments: inject lag into tasks and measure peak concurrency")
        .after_help(
            "Examples:\n  loomlab run --tasks 100 --workers 10 --lag-min 5 --lag-max 5\n  loomlab compare --tasks 1000 --lag-min 1 --lag-max 10\n  loomlab lag --min 1 --max 10\n  loomlab config",
        )
        .arg(
            Arg::new("quiet")
                .short('q')
                .long("quiet")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Only log errors; no progress bar"),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .global(true)
                .help("Read settings from this file instead of .loomlabrc"),
        )
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(
            experiment_args(Command::new("run").about("Run one batch on one dispatcher")).arg(
                Arg::new("dispatcher")
                    .short('d')
                    .long("dispatcher")
                    .value_parser(PossibleValuesParser::new(dispatcher_names))
                    .help("Worker facility to run on (default: fixed)"),
            ),
        )
        .subcommand(
            experiment_args(
                Command::new("compare")
                    .about("Run the same batch on every dispatcher and compare"),
            )
            .arg(
                Arg::new("no-baselines")
                    .long("no-baselines")
                    .action(ArgAction::SetTrue)
                    .help("Skip the sequential and parallel-iterator baselines"),
            ),
        )
        .subcommand(
            Command::new("lag")
                .about("Sample lag durations without sleeping")
                .arg(
                    Arg::new("min")
                        .long("min")
                        .value_parser(value_parser!(u64))
                        .help("Minimum lag in ms (default: 0)"),
                )
                .arg(
                    Arg::new("max")
                        .long("max")
                        .value_parser(value_parser!(u64))
                        .help("Maximum lag in ms (default: same as --min)"),
                )
                .arg(
                    Arg::new("samples")
                        .long("samples")
                        .value_parser(value_parser!(usize))
                        .help("How many durations to draw (default: 1000)"),
                )
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Print the summary as JSON"),
                ),
        )
        .subcommand(Command::new("config").about("Print the effective configuration as JSON"))
        .get_matches();

    let quiet = matches.get_flag("quiet");
    init_logging(quiet);
    let config_path = matches.get_one::<String>("config");

    match matches.subcommand() {
        Some(("run", sub)) => cmd_run(config_path, sub),
        Some(("compare", sub)) => cmd_compare(config_path, sub, quiet),
        Some(("lag", sub)) => cmd_lag(sub),
        Some(("config", _)) => {
            let config = effective_config(config_path, None)?;
            println!("{}", to_json(&config)?);
            Ok(())
        }
        _ => Err("Unknown command. Run `loomlab --help`.".to_string()),
    }
}

fn main() {
    if !use_color() {
        colored::control::set_override(false);
    }

    let code = match std::panic::catch_unwind(run) {
        Ok(Ok(())) => 0,
        Ok(Err(e)) => {
            say(Tone::Error, &e);
            1
        }
        Err(_) => {
            say(Tone::Error, "An unexpected error occurred. Please report this issue.");
            1
        }
    };
    std::process::exit(code);
}
