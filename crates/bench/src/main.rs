//! usb-perf
//!
//! Measures the sustained data rate of a single USB endpoint by keeping a
//! queue of asynchronous transfer requests outstanding and resubmitting
//! each one as it completes.

mod config;

use anyhow::{Context, Result};
use clap::Parser;
use common::{format_bytes, format_duration, format_rate_kbps, setup_logging};
use config::{BenchConfig, parse_endpoint};
use std::path::PathBuf;
use streamer::usb::{LibusbTransport, claim_endpoint, find_endpoint, open_device};
use streamer::{Engine, EngineConfig, Report, ReportKind, RunMode, RunSummary, report_channel};
use tokio::signal;
use tracing::{error, info, warn};

/// Reports buffered between the streamer thread and the printer
const REPORT_CHANNEL_CAPACITY: usize = 256;

#[derive(Parser, Debug)]
#[command(name = "usb-perf")]
#[command(
    author,
    version,
    about = "USB endpoint throughput test - stream transfers and measure the data rate"
)]
#[command(long_about = "
Streams bulk, interrupt or isochronous transfers on one endpoint of a USB
device and reports the data rate once per second.

EXAMPLES:
    # Read from endpoint 0x81 for 100 seconds
    usb-perf --device 0x04b4:0x00f1 -e 0x81 -d 100

    # Deeper queue, larger requests, run until Ctrl+C
    usb-perf --device 0x04b4:0x00f1 -e 0x81 -s 32 -q 64

    # Use settings from a configuration file
    usb-perf --config ~/bench.toml

CONFIGURATION:
    Settings are read from the file given with --config, otherwise from
    ~/.config/usb-perf/bench.toml when it exists. Command-line flags
    override file values.
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Save the effective configuration to the default location and exit
    #[arg(long)]
    save_config: bool,

    /// Device under test as VID:PID (e.g. 0x04b4:0x00f1)
    #[arg(long, value_name = "VID:PID")]
    device: Option<String>,

    /// Endpoint address (e.g. 0x81)
    #[arg(short, long, value_name = "ADDR", value_parser = parse_endpoint)]
    endpoint: Option<u8>,

    /// Packets (or bursts) per request
    #[arg(short = 's', long, value_name = "PACKETS")]
    request_size: Option<usize>,

    /// Requests kept in flight
    #[arg(short, long, value_name = "COUNT")]
    queue_depth: Option<usize>,

    /// Test duration in seconds (omit to run until Ctrl+C)
    #[arg(short, long, value_name = "SECS")]
    duration: Option<u64>,

    /// Override the packet size derived from the endpoint descriptor
    #[arg(long, value_name = "BYTES")]
    packet_size: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

impl Args {
    /// Layer command-line flags over file settings
    fn apply(&self, config: &mut BenchConfig) {
        if let Some(device) = &self.device {
            config.device.filter = Some(device.clone());
        }
        if let Some(endpoint) = self.endpoint {
            config.stream.endpoint = Some(endpoint);
        }
        if let Some(request_size) = self.request_size {
            config.stream.request_size = request_size;
        }
        if let Some(queue_depth) = self.queue_depth {
            config.stream.queue_depth = queue_depth;
        }
        if let Some(duration) = self.duration {
            config.stream.duration_secs = Some(duration);
        }
        if let Some(packet_size) = self.packet_size {
            config.stream.packet_size = Some(packet_size);
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = if let Some(ref path) = args.config {
        BenchConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        BenchConfig::load_or_default()
    };
    args.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    if args.save_config {
        let path = BenchConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    setup_logging(&config.logging.level).context("Failed to setup logging")?;

    info!("usb-perf v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", config.logging.level);

    run_benchmark(&config).await
}

/// Open the device, stream until done and print the results
async fn run_benchmark(config: &BenchConfig) -> Result<()> {
    let filter = config.device_filter()?;
    let address = config.endpoint()?;

    let context = rusb::Context::new().context("Failed to initialize libusb")?;
    let mut handle = open_device(&context, &filter)
        .with_context(|| format!("Failed to open device {}", filter))?;
    let endpoint = find_endpoint(&handle, address)?;
    claim_endpoint(&mut handle, &endpoint)
        .with_context(|| format!("Failed to claim interface {}", endpoint.interface))?;

    let packet_size = config.stream.packet_size.unwrap_or(endpoint.packet_size);
    let engine_config = EngineConfig::new(address, endpoint.kind, packet_size)
        .with_request_size(config.stream.request_size)
        .with_queue_depth(config.stream.queue_depth);
    let mode = config.stream.run_mode();

    print_parameters(&engine_config, mode);

    let engine = Engine::new();
    let (tx, rx) = report_channel(REPORT_CHANNEL_CAPACITY);
    let worker = engine
        .spawn(LibusbTransport::new(handle), engine_config, mode, tx)
        .context("Failed to start streaming")?;

    if mode == RunMode::UntilStopped {
        info!("Press Ctrl+C to stop");
    }

    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut stopping = false;

    loop {
        tokio::select! {
            report = rx.recv() => match report {
                Ok(report) => {
                    print_report(&report);
                    if report.kind == ReportKind::Final {
                        break;
                    }
                }
                // Streamer thread exited without a final report
                Err(_) => break,
            },
            result = &mut ctrl_c, if !stopping => {
                stopping = true;
                match result {
                    Ok(()) => info!("Received Ctrl+C, stopping transfers..."),
                    Err(e) => error!("Error waiting for Ctrl+C: {}", e),
                }
                engine.request_stop();
            }
        }
    }

    let summary = tokio::task::spawn_blocking(move || worker.join())
        .await
        .context("Failed to wait for streamer thread")?
        .map_err(|_| anyhow::anyhow!("Streamer thread panicked"))?
        .context("Streaming failed")?;

    print_summary(&summary);
    Ok(())
}

fn print_parameters(config: &EngineConfig, mode: RunMode) {
    println!("Starting test with the following parameters");
    println!("\tEndpoint to test       : {:#04x}", config.endpoint);
    println!("\tEndpoint type          : {}", config.kind);
    println!("\tMaximum packet size    : {}", config.packet_size);
    println!("\tRequest size           : {}", config.request_size);
    println!("\tNumber of requests     : {}", config.queue_depth);
    match mode {
        RunMode::For(duration) => {
            println!("\tTest duration          : {}", format_duration(duration))
        }
        RunMode::UntilStopped => println!("\tTest duration          : until stopped"),
    }
    println!();
}

fn print_report(report: &Report) {
    match report.kind {
        ReportKind::Periodic => {
            println!(
                "Transfer Counts: {} pass {} fail",
                report.success_count, report.failure_count
            );
            println!("Data rate: {:.0} KBps", report.rate_kbps);
            println!();
        }
        // Window reports feed the rate; printing each one floods the terminal
        ReportKind::WindowClosed => {}
        ReportKind::Final => {
            if report.in_flight != 0 {
                warn!("{} requests still in flight at the end of the run", report.in_flight);
            }
        }
    }
}

fn print_summary(summary: &RunSummary) {
    println!("Test summary");
    println!(
        "\tTransfers              : {} pass {} fail",
        summary.success_count, summary.failure_count
    );
    println!(
        "\tData transferred       : {}",
        format_bytes(summary.total_bytes)
    );
    println!(
        "\tElapsed                : {}",
        format_duration(summary.elapsed)
    );
    println!(
        "\tAverage data rate      : {}",
        format_rate_kbps(summary.average_rate_kbps())
    );
}
