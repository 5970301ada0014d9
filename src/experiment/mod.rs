pub mod clock;
pub mod data;
pub mod recorder;

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use chrono::NaiveDateTime;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::devices::{
    DeviceStatus, SPS30_PRODUCT_TYPE, ShdlcChannel, ShdlcError, ShdlcPort, Sps30, VersionInfo,
};
use crate::shutdown::StopSignal;
use clock::{Clock, SystemClock};
use data::Measurement;
use recorder::SampleRecorder;

#[derive(Error, Debug)]
pub enum ExperimentError {
    #[error("Device communication failed: {0}")]
    Device(#[from] ShdlcError),

    #[error("Unsupported device: expected product type {expected}, found {found}")]
    UnsupportedDevice { expected: String, found: String },

    #[error("Device reports a fault ({0})")]
    DeviceFault(DeviceStatus),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, ExperimentError>;

pub const TIMESTAMP_PLACEHOLDER: &str = "{timestamp}";

/// Configuration for a measurement session
#[derive(Debug, Clone)]
pub struct MeasurementConfig {
    pub port: String,                  // Serial port the SPS30 is attached to
    pub baud_rate: u32,                // SHDLC link speed, fixed by the sensor
    pub filename: String,              // Log path, `{timestamp}` is substituted
    pub interval_s: u64,               // Seconds between polls
    pub verbose: bool,                 // Print every sample to stdout
    pub clean: bool,                   // Run fan cleaning before the first poll
    pub auto_cleaning_interval_s: u32, // Written to the device at startup
    pub product_type: String,          // Product type the device must report
    pub response_timeout_ms: u64,      // Per-command reply deadline
    pub reset_settle_ms: u64,          // Device is unresponsive right after reset
    pub cleaning_settle_ms: u64,       // Readings are invalid while the fan cleans
}

impl Default for MeasurementConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 115_200,
            filename: format!("{}_particulates.csv", TIMESTAMP_PLACEHOLDER),
            interval_s: 1,
            verbose: false,
            clean: false,
            auto_cleaning_interval_s: 604_800, // one week, the factory default
            product_type: SPS30_PRODUCT_TYPE.to_string(),
            response_timeout_ms: 1000,
            reset_settle_ms: 100,
            cleaning_settle_ms: 5000,
        }
    }
}

impl MeasurementConfig {
    pub fn validate(&self) -> Result<()> {
        if self.interval_s == 0 {
            return Err(ExperimentError::InvalidConfig(
                "interval must be at least one second".into(),
            ));
        }
        if self.filename.trim().is_empty() {
            return Err(ExperimentError::InvalidConfig(
                "filename must not be empty".into(),
            ));
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_s)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn reset_settle(&self) -> Duration {
        Duration::from_millis(self.reset_settle_ms)
    }

    pub fn cleaning_settle(&self) -> Duration {
        Duration::from_millis(self.cleaning_settle_ms)
    }
}

/// What the device told us about itself during startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub product_type: String,
    pub serial_number: String,
    pub version: VersionInfo,
    pub auto_cleaning_interval_s: u32,
}

#[derive(Debug)]
pub struct SessionSummary {
    pub path: PathBuf,
    pub rows: u64,
    pub device: DeviceInfo,
}

/// Substitutes the `{timestamp}` placeholder with the session start time.
pub fn resolve_filename(template: &str, now: NaiveDateTime) -> PathBuf {
    let stamp = now.format("%Y-%m-%d_%H-%M-%S").to_string();
    PathBuf::from(template.replace(TIMESTAMP_PLACEHOLDER, &stamp))
}

/// Brings the sensor from power-on to running measurement.
///
/// Every step is fatal on failure. Measurement is only started once the
/// identity and status checks passed; after that, stopping it is the
/// caller's job.
pub fn initialize_device<P: ShdlcPort, C: Clock>(
    sensor: &mut Sps30<P>,
    config: &MeasurementConfig,
    clock: &mut C,
    stop: &StopSignal,
) -> Result<DeviceInfo> {
    sensor.device_reset()?;
    clock.settle(config.reset_settle());

    let product_type = sensor.read_product_type()?;
    info!("Product type: {}", product_type);
    println!("Product type: {}", product_type);
    if product_type != config.product_type {
        error!(
            "Unsupported device: expected product type {}, found {}",
            config.product_type, product_type
        );
        return Err(ExperimentError::UnsupportedDevice {
            expected: config.product_type.clone(),
            found: product_type,
        });
    }

    let serial_number = sensor.read_serial_number()?;
    info!("Serial number: {}", serial_number);
    println!("Serial number: {}", serial_number);

    let version = sensor.read_version()?;
    info!("Device version: {:?}", version);
    println!(
        "Firmware version: {}.{}",
        version.firmware_major, version.firmware_minor
    );
    println!("Hardware revision: {}", version.hardware_revision);
    println!(
        "SHDLC protocol version: {}.{}",
        version.shdlc_major, version.shdlc_minor
    );

    sensor.write_auto_cleaning_interval(config.auto_cleaning_interval_s)?;
    let auto_cleaning_interval_s = sensor.read_auto_cleaning_interval()?;
    info!("Auto cleaning interval: {} s", auto_cleaning_interval_s);
    println!("Auto cleaning interval: {} seconds", auto_cleaning_interval_s);
    if auto_cleaning_interval_s != config.auto_cleaning_interval_s {
        warn!(
            "Device reports auto cleaning interval {} s, {} s was written",
            auto_cleaning_interval_s, config.auto_cleaning_interval_s
        );
    }

    let status = sensor.read_device_status()?;
    if !status.is_ok() {
        error!("Device status reports a fault: {}", status);
        return Err(ExperimentError::DeviceFault(status));
    }
    info!("Device status OK");

    sensor.start_measurement()?;
    println!("Measurement started");

    if config.clean {
        sensor.start_fan_cleaning()?;
        println!(
            "Fan cleaning started, waiting {} s",
            config.cleaning_settle().as_secs_f32()
        );
        if !clock.pause(config.cleaning_settle(), stop) {
            info!("Interrupted while waiting for fan cleaning");
        }
    }

    Ok(DeviceInfo {
        product_type,
        serial_number,
        version,
        auto_cleaning_interval_s,
    })
}

/// Samples the sensor until the stop signal is raised.
///
/// Returns the number of rows appended. A poll without new data is skipped
/// for that tick; any device error ends the loop and is returned as is.
pub fn poll_measurements<P: ShdlcPort, C: Clock>(
    sensor: &mut Sps30<P>,
    recorder: &mut SampleRecorder,
    clock: &mut C,
    config: &MeasurementConfig,
    stop: &StopSignal,
) -> Result<u64> {
    let interval = config.interval();
    info!(
        "Polling every {} s into {}",
        config.interval_s,
        recorder.path().display()
    );

    while !stop.is_raised() {
        if let Some(values) = sensor.read_measured_value()? {
            let measurement = Measurement::new(clock.now(), values);
            recorder.append(&measurement)?;
            if config.verbose {
                println!("{}", measurement);
            }
        }

        if !clock.pause(interval, stop) {
            break;
        }
    }

    info!("Polling stopped after {} rows", recorder.rows());
    Ok(recorder.rows())
}

// Best effort: the device may be the reason we are failing.
fn stop_after_error<P: ShdlcPort>(sensor: &mut Sps30<P>) {
    if sensor.is_measuring() {
        if let Err(e) = sensor.stop_measurement() {
            warn!("Failed to stop measurement after error: {}", e);
        }
    }
}

/// Initialize, record until stopped, then close the log and stop the sensor.
pub fn run_session<P: ShdlcPort, C: Clock>(
    sensor: &mut Sps30<P>,
    config: &MeasurementConfig,
    clock: &mut C,
    stop: &StopSignal,
) -> Result<SessionSummary> {
    config.validate()?;
    info!("Starting measurement session with configuration: {:?}", config);

    let device = match initialize_device(sensor, config, clock, stop) {
        Ok(device) => device,
        Err(e) => {
            stop_after_error(sensor);
            return Err(e);
        }
    };

    let path = resolve_filename(&config.filename, clock.now());
    let mut recorder = match SampleRecorder::open(&path) {
        Ok(recorder) => recorder,
        Err(e) => {
            stop_after_error(sensor);
            return Err(e);
        }
    };
    println!("Writing measurements to {}", path.display());

    let polled = poll_measurements(sensor, &mut recorder, clock, config, stop);
    let closed = recorder.close();
    let rows = match polled.and_then(|rows| closed.map(|_| rows)) {
        Ok(rows) => rows,
        Err(e) => {
            error!("Measurement session failed: {}", e);
            stop_after_error(sensor);
            return Err(e);
        }
    };

    if let Err(e) = sensor.stop_measurement() {
        if !stop.is_raised() {
            return Err(e.into());
        }
        // An interrupt still ends the session successfully.
        warn!("Failed to stop measurement during shutdown: {}", e);
    }
    info!("Session finished, {} rows written to {}", rows, path.display());
    Ok(SessionSummary { path, rows, device })
}

/// Opens the serial port named in `config` and runs a session on it.
pub fn start_measurements(
    config: &MeasurementConfig,
    stop: &StopSignal,
) -> Result<SessionSummary> {
    config.validate()?;
    let channel = ShdlcChannel::open(&config.port, config.baud_rate, config.response_timeout())?;
    let mut sensor = Sps30::new(channel);
    run_session(&mut sensor, config, &mut SystemClock, stop)
}
