mod devices;
mod experiment;
mod shutdown;

use std::path::{Path, PathBuf};

use clap::Parser;
use experiment::MeasurementConfig;
use shutdown::StopSignal;
use tracing::{error, info, Level};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::fmt;

/// Start particulates measurement
#[derive(Parser, Debug)]
#[command(name = "particulates", version)]
struct Args {
    /// Serial port to connect to
    port: String,

    /// Measurement filename in csv format, `{timestamp}` is replaced by the start time
    #[arg(short, long, default_value = "{timestamp}_particulates.csv")]
    filename: String,

    /// Measurement interval in seconds
    #[arg(short, long, default_value_t = 1, value_parser = clap::value_parser!(u64).range(1..))]
    interval: u64,

    /// Print measurements to stdout
    #[arg(short, long)]
    verbose: bool,

    /// Start fan cleaning before measurements
    #[arg(short, long)]
    clean: bool,

    /// Directory for the application log
    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Set up logging; the guard flushes the log file on exit
    let _guard = setup_logging(&args.log_dir, args.verbose);
    info!("Starting application");

    let config = MeasurementConfig {
        port: args.port,
        filename: args.filename,
        interval_s: args.interval,
        verbose: args.verbose,
        clean: args.clean,
        ..MeasurementConfig::default()
    };

    let stop = match StopSignal::install_ctrlc_handler() {
        Ok(stop) => stop,
        Err(e) => {
            error!("Failed to install interrupt handler: {}", e);
            return Err(Box::new(e));
        }
    };

    match experiment::start_measurements(&config, &stop) {
        Ok(summary) => {
            let device = &summary.device;
            info!(
                "Session on SPS30 {} (product type {}, firmware {}.{}, SHDLC {}.{}, auto cleaning every {} s)",
                device.serial_number,
                device.product_type,
                device.version.firmware_major,
                device.version.firmware_minor,
                device.version.shdlc_major,
                device.version.shdlc_minor,
                device.auto_cleaning_interval_s
            );
            info!(
                "Measurement stopped. {} rows saved to: {}",
                summary.rows,
                summary.path.display()
            );
            println!(
                "Measurement stopped. {} rows saved to: {}",
                summary.rows,
                summary.path.display()
            );
        }
        Err(e) => {
            error!("Measurement failed: {}", e);
            eprintln!("Measurement failed: {}", e);
            return Err(Box::new(e));
        }
    }

    info!("Application shutting down");
    Ok(())
}

fn setup_logging(log_dir: &Path, verbose: bool) -> WorkerGuard {
    // Set up file-based logging with daily rotation
    let file_appender = rolling::daily(log_dir, "particulates.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    fmt()
        .with_writer(non_blocking)
        .with_ansi(false) // Disable ANSI colors in log files
        .with_level(true)
        .with_max_level(if verbose { Level::DEBUG } else { Level::INFO })
        .init();

    guard
}
