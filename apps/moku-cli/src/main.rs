use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::info;

use device_registry::{CacheFile, DeviceRecord, DeviceRegistry, RejectReason};
use instrument_codec::emfi_seq::CONTROL_COUNT;
use instrument_codec::{
    decode_status, locate, resolve_with_file, EmfiSeqConfig, EmfiSeqLayer, RegisterWord,
    StatusSnapshot, OUTPUT_WORDS,
};
use moku_session::{ConnectionPolicy, EnvDefaults, MetricsHub, Orchestrator};
use moku_transport::MockMoku;

#[derive(Parser, Debug)]
#[command(
    name = "moku",
    version,
    about = "Moku device orchestrator",
    disable_help_subcommand = true
)]
struct Cli {
    /// Device backend
    #[arg(long, value_enum, default_value_t = Backend::Mock, global = true)]
    backend: Backend,

    /// Device cache file (default: $MOKU_CACHE, then the user cache dir)
    #[arg(long, global = true)]
    cache: Option<PathBuf>,

    /// Print session metrics on exit
    #[arg(long, action = ArgAction::SetTrue, global = true)]
    print_metrics: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Backend {
    /// In-process simulated network with one device
    Mock,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Scan the network and update the device cache
    Discover {
        /// Listen window in milliseconds
        #[arg(long, default_value_t = 2000u64)]
        window_ms: u64,
        /// Drop cached devices that have gone stale
        #[arg(long, action = ArgAction::SetTrue)]
        prune: bool,
    },
    /// List cached devices
    Devices {
        #[arg(long, action = ArgAction::SetTrue)]
        json: bool,
    },
    /// Claim a device, report its identity and release it
    Connect {
        /// Name, serial or address (default: $MOKU_IP)
        target: Option<String>,
        /// Take the device over even if another client holds it
        #[arg(long, action = ArgAction::SetTrue)]
        force: bool,
    },
    /// EMFI-Seq instrument
    Emfi {
        #[command(subcommand)]
        command: EmfiCommand,
    },
}

#[derive(Args, Debug)]
struct ConfigArgs {
    /// YAML configuration file; relative paths are read from $MOKU_DATA_PATH
    #[arg(long)]
    config: Option<PathBuf>,
    /// Per-field override, e.g. --set voltages.state2=-1.25
    #[arg(long = "set", value_name = "FIELD=VALUE")]
    set: Vec<String>,
}

#[derive(Subcommand, Debug)]
enum EmfiCommand {
    /// Resolve a configuration and print the control words without connecting
    Encode {
        #[command(flatten)]
        config: ConfigArgs,
        #[arg(long, action = ArgAction::SetTrue)]
        json: bool,
    },
    /// Resolve a configuration and write it to a device
    Configure {
        target: Option<String>,
        #[command(flatten)]
        config: ConfigArgs,
        #[arg(long, action = ArgAction::SetTrue)]
        force: bool,
    },
    /// Start the sequencer, keeping the rest of the live configuration
    Enable { target: Option<String> },
    /// Stop the sequencer, keeping the rest of the live configuration
    Disable { target: Option<String> },
    /// Read and decode the output registers
    Status {
        target: Option<String>,
        #[arg(long, action = ArgAction::SetTrue)]
        json: bool,
    },
    /// Decode four output words given on the command line (hex with 0x, or decimal)
    DecodeStatus {
        #[arg(num_args = 4, required = true, value_parser = parse_word)]
        words: Vec<u32>,
        #[arg(long, action = ArgAction::SetTrue)]
        json: bool,
    },
}

struct App {
    env: EnvDefaults,
    net: MockMoku,
    orch: Orchestrator<MockMoku>,
}

impl App {
    fn open(cli: &Cli) -> Result<Self> {
        let env = EnvDefaults::from_env()?;
        let cache_path = cli
            .cache
            .clone()
            .or_else(|| env.cache_path.clone())
            .unwrap_or_else(CacheFile::default_path);
        let registry = DeviceRegistry::open(CacheFile::new(cache_path));
        let net = match cli.backend {
            Backend::Mock => MockMoku::demo(),
        };
        let metrics = MetricsHub::new().context("metrics init")?;
        let orch = Orchestrator::new(net.clone(), registry, metrics).with_client("moku-cli");
        Ok(Self { env, net, orch })
    }

    fn target(&self, given: Option<String>) -> Result<String> {
        given
            .or_else(|| self.env.target.clone())
            .ok_or_else(|| anyhow::anyhow!("no target given and MOKU_IP is not set"))
    }

    fn policy(&self, force: bool) -> ConnectionPolicy {
        let policy = self.env.policy.clone();
        if force {
            policy.with_force(true)
        } else {
            policy
        }
    }

    fn resolve_config(&self, args: &ConfigArgs) -> Result<EmfiSeqConfig> {
        let mut overrides = EmfiSeqLayer::default();
        for assignment in &args.set {
            overrides.apply_assignment(assignment)?;
        }
        let path = args
            .config
            .as_ref()
            .map(|p| locate(p, self.env.data_path.as_deref()));
        Ok(resolve_with_file(path.as_deref(), &overrides)?)
    }
}

fn main() -> Result<()> {
    setup_tracing();
    let cli = Cli::parse();
    let app = App::open(&cli)?;

    let outcome = run(&app, cli.command);
    if cli.print_metrics {
        print!("{}", app.orch.metrics().encode_text());
    }
    outcome
}

fn run(app: &App, command: Commands) -> Result<()> {
    match command {
        Commands::Discover { window_ms, prune } => discover(app, window_ms, prune),
        Commands::Devices { json } => devices(app, json),
        Commands::Connect { target, force } => connect(app, target, force),
        Commands::Emfi { command } => match command {
            EmfiCommand::Encode { config, json } => emfi_encode(app, &config, json),
            EmfiCommand::Configure {
                target,
                config,
                force,
            } => emfi_configure(app, target, &config, force),
            EmfiCommand::Enable { target } => emfi_toggle(app, target, true),
            EmfiCommand::Disable { target } => emfi_toggle(app, target, false),
            EmfiCommand::Status { target, json } => emfi_status(app, target, json),
            EmfiCommand::DecodeStatus { words, json } => {
                print_status(&decode_status(&words)?, json)
            }
        },
    }
}

fn setup_tracing() {
    // Best-effort; avoid panics if already set
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn discover(app: &App, window_ms: u64, prune: bool) -> Result<()> {
    let report = app
        .orch
        .discover(&app.net, Duration::from_millis(window_ms))?;
    for rec in &report.found {
        println!("found\t{}", record_line(rec)?);
    }
    for rejected in &report.summary.rejected {
        let why = match &rejected.reason {
            RejectReason::MissingSerial => "no serial".to_string(),
            RejectReason::NameHeld { name, serial } => format!("name {name} held by {serial}"),
        };
        println!("rejected\t{}\t{why}", record_line(&rejected.record)?);
    }
    if let Some(e) = &report.summary.cache_error {
        eprintln!("warning: {e}");
    }
    if prune {
        let removed = app
            .orch
            .with_registry(|r| r.evict_stale(OffsetDateTime::now_utc()))??;
        for rec in &removed {
            println!("evicted\t{}", record_line(rec)?);
        }
    }
    println!(
        "discover: {} found, {} new, {} updated",
        report.found.len(),
        report.summary.inserted,
        report.summary.updated
    );
    Ok(())
}

fn devices(app: &App, json: bool) -> Result<()> {
    let now = OffsetDateTime::now_utc();
    let rows: Vec<(DeviceRecord, bool)> = app.orch.with_registry(|r| {
        let r: &DeviceRegistry = r;
        r.records()
            .map(|rec| (rec.clone(), r.is_stale(rec, now)))
            .collect()
    })?;
    if json {
        let records: Vec<&DeviceRecord> = rows.iter().map(|(rec, _)| rec).collect();
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }
    for (rec, stale) in &rows {
        let flag = if *stale { "stale" } else { "live" };
        println!("{}\t{flag}", record_line(rec)?);
    }
    Ok(())
}

fn record_line(rec: &DeviceRecord) -> Result<String> {
    Ok(format!(
        "{}\t{}\t{}\t{}",
        rec.name.as_deref().unwrap_or("-"),
        if rec.serial.is_empty() { "-" } else { rec.serial.as_str() },
        rec.endpoint(),
        rec.last_seen.format(&Rfc3339)?
    ))
}

fn connect(app: &App, target: Option<String>, force: bool) -> Result<()> {
    let target = app.target(target)?;
    let policy = app.policy(force);
    app.orch.with_session(&target, &policy, |s| -> Result<()> {
        let info = s.info();
        println!(
            "connected\t{}\t{}\t{}\tfirmware={}",
            s.device().endpoint(),
            info.name.as_deref().unwrap_or("-"),
            info.serial,
            info.firmware.as_deref().unwrap_or("unknown")
        );
        println!("session\t{}", s.id());
        Ok(())
    })
}

fn print_words(words: &[RegisterWord], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(words)?);
    } else {
        for word in words {
            println!("{word}");
        }
    }
    Ok(())
}

fn emfi_encode(app: &App, args: &ConfigArgs, json: bool) -> Result<()> {
    let config = app.resolve_config(args)?;
    print_words(&config.encode()?, json)
}

fn emfi_configure(app: &App, target: Option<String>, args: &ConfigArgs, force: bool) -> Result<()> {
    let config = app.resolve_config(args)?;
    let target = app.target(target)?;
    let words = app
        .orch
        .with_session(&target, &app.policy(force), |s| s.configure(&config))?;
    info!(device = %target, n = words.len(), "emfi configured");
    print_words(&words, false)
}

fn emfi_toggle(app: &App, target: Option<String>, enabled: bool) -> Result<()> {
    let target = app.target(target)?;
    let words = app
        .orch
        .with_session(&target, &app.policy(false), |s| -> Result<_> {
            let live = EmfiSeqConfig::from_controls(&s.read_controls(CONTROL_COUNT)?)?;
            Ok(s.configure(&live.with_sequencer_enabled(enabled))?)
        })?;
    println!(
        "sequencer {}",
        if enabled { "enabled" } else { "disabled" }
    );
    print_words(words.get(..1).unwrap_or_default(), false)
}

fn emfi_status(app: &App, target: Option<String>, json: bool) -> Result<()> {
    let target = app.target(target)?;
    let snapshot = app
        .orch
        .with_session(&target, &app.policy(false), |s| -> Result<_> {
            Ok(decode_status(&s.read_outputs(OUTPUT_WORDS as u8)?)?)
        })?;
    print_status(&snapshot, json)
}

fn print_status(snap: &StatusSnapshot, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(snap)?);
        return Ok(());
    }
    println!("state\t{:?}", snap.state);
    println!("dac\t{:.4} V\t(code {})", snap.dac_volts, snap.dac_code);
    let entered: Vec<String> = snap
        .entered
        .iter()
        .enumerate()
        .filter(|(_, hit)| **hit)
        .map(|(i, _)| format!("S{}", i + 1))
        .collect();
    println!("entered\t{}", if entered.is_empty() { "-".to_string() } else { entered.join(",") });
    println!("monitor\t0x{:03X}", snap.monitor_msbs);
    println!("clock\t{}", snap.clock_counter);
    if !snap.reserved.is_clear() {
        let r = &snap.reserved;
        println!(
            "reserved\t0x{:08X} 0x{:08X} 0x{:08X} 0x{:08X}",
            r.output_a, r.output_b, r.output_c, r.output_d
        );
    }
    Ok(())
}

fn parse_word(s: &str) -> Result<u32, String> {
    let t = s.trim();
    let parsed = match t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => t.parse::<u32>(),
    };
    parsed.map_err(|e| format!("invalid register word '{s}': {e}"))
}
