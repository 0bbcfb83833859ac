// src/main.rs
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{error, info, warn};

use dyno_daq::drivers::source::{list_ports, SimulatedOpener};
use dyno_daq::smoothing::{smooth_export, DEFAULT_CUTOFF_HZ};
use dyno_daq::{Channel, DaqConfig, Session, SessionEvent, SessionState};

/// Brake dyno DAQ: serial capture, live averages and CSV export.
#[derive(Parser, Debug)]
#[command(name = "dyno-daq", version, about, long_about = None)]
struct Cli {
    /// JSON config file; command-line flags take precedence
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List serial ports visible to the host
    Ports,
    /// Acquire from a serial port
    Run {
        /// Serial device, e.g. COM4 or /dev/ttyACM0
        #[arg(short, long)]
        port: Option<String>,
        #[arg(short, long)]
        baud: Option<u32>,
        #[command(flatten)]
        capture: CaptureArgs,
    },
    /// Acquire from a synthetic rig
    Simulate {
        #[arg(long, default_value_t = 50.0)]
        rate_hz: f64,
        #[command(flatten)]
        capture: CaptureArgs,
    },
    /// Low-pass an exported CSV into `<name>_filtered.csv`
    Smooth {
        #[arg(value_name = "CSV")]
        path: PathBuf,
        #[arg(long, default_value_t = DEFAULT_CUTOFF_HZ)]
        cutoff_hz: f64,
    },
}

#[derive(Args, Debug)]
struct CaptureArgs {
    /// Export accepted samples into this directory
    #[arg(short, long, value_name = "DIR")]
    export_dir: Option<PathBuf>,
    /// Stop after this many seconds (default: until the link drops)
    #[arg(short, long)]
    duration_secs: Option<u64>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => DaqConfig::load(path)?,
        None => DaqConfig::default(),
    };

    match cli.command {
        Command::Ports => print_ports(),
        Command::Run {
            port,
            baud,
            capture,
        } => {
            let Some(port) = port.or_else(|| config.port.clone()) else {
                bail!("no serial port given; pass --port or set `port` in the config");
            };
            let baud = baud.unwrap_or(config.baud_rate);
            let session = Session::new(config);
            capture_loop(session, &port, baud, &capture)
        }
        Command::Simulate { rate_hz, capture } => {
            let baud = config.baud_rate;
            let session = Session::with_opener(config, Arc::new(SimulatedOpener { rate_hz }));
            capture_loop(session, "SIM", baud, &capture)
        }
        Command::Smooth { path, cutoff_hz } => {
            let out = smooth_export(&path, cutoff_hz)?;
            println!("{}", out.display());
            Ok(())
        }
    }
}

fn print_ports() -> Result<()> {
    let ports = list_ports().context("listing serial ports")?;
    if ports.is_empty() {
        println!("no serial ports found");
    }
    for port in ports {
        println!("{:<20} {}", port.name, port.description);
    }
    Ok(())
}

fn capture_loop(mut session: Session, port: &str, baud: u32, capture: &CaptureArgs) -> Result<()> {
    session
        .start_acquisition(port, baud)
        .with_context(|| format!("opening {port}"))?;
    let export_dir = capture
        .export_dir
        .clone()
        .or_else(|| session.config().export_dir.clone());
    if let Some(dir) = export_dir {
        start_export(&mut session, &dir)?;
    }

    let refresh = session.config().refresh_interval();
    let deadline = capture
        .duration_secs
        .map(|secs| Instant::now() + Duration::from_secs(secs));
    loop {
        thread::sleep(refresh);
        for event in session.poll_events() {
            log_event(&event);
        }
        if session.state() == SessionState::Idle {
            break;
        }
        log_averages(&session);
        if deadline.is_some_and(|d| Instant::now() >= d) {
            if let Some(report) = session.stop_acquisition()? {
                info!("{} rows exported to {}", report.written, report.path.display());
            }
            break;
        }
    }
    for event in session.poll_events() {
        log_event(&event);
    }

    let status = session.status();
    info!(
        "read {} lines: {} accepted, {} malformed, {} not exported",
        status.lines_read, status.samples_accepted, status.malformed_lines, status.export_overflows
    );
    Ok(())
}

fn start_export(session: &mut Session, dir: &Path) -> Result<()> {
    let path = session
        .start_export(dir)
        .with_context(|| format!("starting export in {}", dir.display()))?;
    info!("exporting to {}", path.display());
    Ok(())
}

fn log_event(event: &SessionEvent) {
    match event {
        SessionEvent::ConnectionLost(err) => error!("{err}"),
        SessionEvent::ExportFailed(err) => error!("{err}"),
        SessionEvent::ExportStopped(report) if !report.is_complete() => warn!(
            "export closed with {} rows not flushed ({})",
            report.unflushed,
            report.path.display()
        ),
        other => info!("{other:?}"),
    }
}

fn log_averages(session: &Session) {
    let line = Channel::ALL
        .iter()
        .map(|&ch| {
            let avg = session.current(ch);
            format!("{}={:.2}", ch.label(), avg.mean)
        })
        .collect::<Vec<_>>()
        .join(" ");
    info!("avg[n={}] {line}", session.current(Channel::Rpm).count);
}
