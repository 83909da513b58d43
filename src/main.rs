// PHASECTL v0.3.2 -- WORKLOAD-PHASE-AWARE CPU FREQUENCY CONTROL
// SAMPLES HARDWARE COUNTERS ON ONE CPU, CLASSIFIES THE RUNNING PHASE,
// AND PINS THE CLOCK TO THE CONFIGURED FREQUENCY FOR THAT PHASE.
//
// LIBRARY DOES THE WORK. THIS FILE: ARGUMENTS, LOGGING, SIGNALS, REPORTING.

mod cli;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};

use phasectl::classifier::{ClassifierSlot, HeuristicClassifier};
use phasectl::config::{FreqConfig, DEFAULT_CONFIG_PATH};
use phasectl::controller::{Controller, Settings, DEFAULT_INTERVAL_MS};
use phasectl::perf::PerfCounters;
use phasectl::policy::{Actuator, CpupowerActuator, DryRunActuator, SysfsActuator};
use phasectl::topology::LinuxTopology;
use phasectl::vendor::VendorProfile;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

#[derive(Parser)]
#[command(name = "phasectl")]
#[command(about = "PHASECTL -- WORKLOAD-PHASE-AWARE CPU FREQUENCY CONTROL")]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    run: RunArgs,
}

#[derive(Subcommand)]
enum Command {
    // RUN THE CONTROL LOOP (DEFAULT)
    Run(RunArgs),
    // REPORT WHETHER THIS MACHINE CAN RUN THE CONTROLLER
    Check,
}

#[derive(Clone, Copy, ValueEnum)]
enum ActuatorKind {
    Cpupower,
    Sysfs,
    DryRun,
}

#[derive(Clone, Copy, ValueEnum)]
enum ClassifierKind {
    Heuristic,
    #[value(name = "none")]
    Off,
}

#[derive(Args, Clone)]
struct RunArgs {
    // CPU WHOSE COUNTERS DRIVE THE CLASSIFICATION
    #[arg(short = 'm', long, default_value_t = 0)]
    monitor_cpu: usize,

    // CPU THE CONTROLLER THREAD IS PINNED TO
    #[arg(short = 'c', long, default_value_t = 0)]
    controller_cpu: usize,

    // FREQUENCY THRESHOLD FILE (LOW/MED/HIGH kHz)
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    // SAMPLING INTERVAL IN MILLISECONDS
    #[arg(long, default_value_t = DEFAULT_INTERVAL_MS)]
    interval_ms: u64,

    // FORCE A VENDOR PROFILE (intel, amd, generic) INSTEAD OF /proc/cpuinfo
    #[arg(long)]
    vendor: Option<VendorProfile>,

    // HOW FREQUENCY REQUESTS REACH THE HARDWARE
    #[arg(long, value_enum, default_value_t = ActuatorKind::Cpupower)]
    actuator: ActuatorKind,

    // PHASE CLASSIFIER TO BIND ("none" RUNS MEASUREMENT ONLY)
    #[arg(long, value_enum, default_value_t = ClassifierKind::Heuristic)]
    classifier: ClassifierKind,

    // SKIP THE PRE-AGGREGATED METRIC GROUP, GO STRAIGHT TO RAW EVENTS
    #[arg(long)]
    no_groups: bool,

    // STOP AFTER N CYCLES (0 = RUN UNTIL CTRL+C)
    #[arg(long, default_value_t = 0)]
    cycles: u64,

    // PER-CYCLE FEATURE LOGGING
    #[arg(long)]
    verbose: bool,

    // DUMP FULL EVENT LOG ON EXIT
    #[arg(long)]
    dump_log: bool,
}

fn init_logging(verbose: bool) -> Result<()> {
    let level = if verbose {
        simplelog::LevelFilter::Debug
    } else {
        simplelog::LevelFilter::Info
    };
    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        level,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let args = match cli.command {
        Some(Command::Check) => return cli::check::run_check(),
        Some(Command::Run(args)) => args,
        None => cli.run,
    };

    init_logging(args.verbose)?;

    ctrlc::set_handler(move || {
        SHUTDOWN.store(true, Ordering::Relaxed);
    })
    .context("failed to install signal handler")?;

    let cfg = FreqConfig::load(&args.config);
    let topology = LinuxTopology::discover()?;
    let contexts = topology.contexts();
    let profile = args.vendor.unwrap_or_else(VendorProfile::detect);

    let actuator: Box<dyn Actuator> = match args.actuator {
        ActuatorKind::Cpupower => Box::new(CpupowerActuator::new()),
        ActuatorKind::Sysfs => Box::new(SysfsActuator::new(contexts.clone())),
        ActuatorKind::DryRun => Box::new(DryRunActuator::default()),
    };

    let mut classifier = ClassifierSlot::new();
    if let ClassifierKind::Heuristic = args.classifier {
        classifier.register(Box::new(HeuristicClassifier));
    }

    println!("PHASECTL v0.3.2");
    println!("CPUS:            {} (monitor={}, controller={})",
             contexts.len(), args.monitor_cpu, args.controller_cpu);
    println!("PROFILE:         {}{}", profile.label(),
             if args.vendor.is_some() { " (forced)" } else { "" });
    println!("THRESHOLDS:      low={} med={} high={} kHz",
             cfg.low_freq_khz, cfg.med_freq_khz, cfg.high_freq_khz);
    println!("INTERVAL:        {} ms", args.interval_ms);
    println!("ACTUATOR:        {}", actuator.name());
    println!("CLASSIFIER:      {}", classifier.name());
    if args.cycles > 0 {
        println!("CYCLES:          {}", args.cycles);
    }
    println!();

    let settings = Settings {
        monitor_cpu: args.monitor_cpu,
        controller_cpu: args.controller_cpu,
        interval: Duration::from_millis(args.interval_ms),
        profile,
        try_groups: !args.no_groups,
        max_cycles: args.cycles,
    };

    let mut ctl = Controller::init(&cfg, settings, PerfCounters::new(), topology, actuator, classifier)?;

    println!("PHASECTL IS ACTIVE (CTRL+C TO EXIT)");

    let result = ctl.run(&SHUTDOWN);

    println!("PHASECTL IS SHUTTING DOWN");

    if args.dump_log {
        ctl.log.dump();
    }
    ctl.log.summary();

    let summary = result?;
    println!("  MODE:              {}", summary.mode.label());
    match summary.last_applied_khz {
        Some(khz) => println!("  LAST FREQUENCY:    {} kHz", khz),
        None => println!("  LAST FREQUENCY:    NONE APPLIED"),
    }

    println!("PHASECTL OUT.");
    Ok(())
}
