use std::fmt;

use tracing::{debug, info, warn};

use super::shdlc::{Result, ShdlcError, ShdlcPort};

/// Product type string reported by every SPS30.
pub const SPS30_PRODUCT_TYPE: &str = "00080000";

const CMD_START_MEASUREMENT: u8 = 0x00;
const CMD_STOP_MEASUREMENT: u8 = 0x01;
const CMD_READ_MEASURED_VALUE: u8 = 0x03;
const CMD_START_FAN_CLEANING: u8 = 0x56;
const CMD_AUTO_CLEANING_INTERVAL: u8 = 0x80;
const CMD_DEVICE_INFORMATION: u8 = 0xD0;
const CMD_READ_VERSION: u8 = 0xD1;
const CMD_READ_DEVICE_STATUS: u8 = 0xD2;
const CMD_DEVICE_RESET: u8 = 0xD3;

const INFO_PRODUCT_TYPE: u8 = 0x00;
const INFO_SERIAL_NUMBER: u8 = 0x03;

// Subcommand 0x01 plus output format 0x03: big-endian IEEE754 floats.
const START_MEASUREMENT_FLOAT_FORMAT: [u8; 2] = [0x01, 0x03];

const MEASURED_VALUE_LEN: usize = 40;

const STATUS_FAN_SPEED_WARNING: u32 = 1 << 21;
const STATUS_LASER_ERROR: u32 = 1 << 5;
const STATUS_FAN_ERROR: u32 = 1 << 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionInfo {
    pub firmware_major: u8,
    pub firmware_minor: u8,
    pub hardware_revision: u8,
    pub shdlc_major: u8,
    pub shdlc_minor: u8,
}

/// Fault flags from the device status register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceStatus {
    pub fan_speed_warning: bool,
    pub laser_error: bool,
    pub fan_error: bool,
}

impl DeviceStatus {
    pub fn from_register(register: u32) -> Self {
        DeviceStatus {
            fan_speed_warning: register & STATUS_FAN_SPEED_WARNING != 0,
            laser_error: register & STATUS_LASER_ERROR != 0,
            fan_error: register & STATUS_FAN_ERROR != 0,
        }
    }

    pub fn is_ok(&self) -> bool {
        !(self.fan_speed_warning || self.laser_error || self.fan_error)
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "fan speed warning: {}, laser error: {}, fan error: {}",
            self.fan_speed_warning, self.laser_error, self.fan_error
        )
    }
}

/// One set of readings as reported by the sensor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeasuredValues {
    /// PM1.0, PM2.5, PM4.0, PM10 in µg/m³
    pub mass_concentration: [f32; 4],
    /// PM0.5, PM1.0, PM2.5, PM4.0, PM10 in #/cm³
    pub number_concentration: [f32; 5],
    /// µm
    pub typical_particle_size: f32,
}

impl MeasuredValues {
    fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() != MEASURED_VALUE_LEN {
            return Err(ShdlcError::Protocol(format!(
                "measured value reply has {} bytes, expected {}",
                data.len(),
                MEASURED_VALUE_LEN
            )));
        }

        let mut values = [0f32; 10];
        for (value, chunk) in values.iter_mut().zip(data.chunks_exact(4)) {
            *value = f32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }

        Ok(MeasuredValues {
            mass_concentration: [values[0], values[1], values[2], values[3]],
            number_concentration: [values[4], values[5], values[6], values[7], values[8]],
            typical_particle_size: values[9],
        })
    }

    /// All ten values in log column order.
    pub fn fields(&self) -> [f32; 10] {
        let m = self.mass_concentration;
        let n = self.number_concentration;
        [
            m[0],
            m[1],
            m[2],
            m[3],
            n[0],
            n[1],
            n[2],
            n[3],
            n[4],
            self.typical_particle_size,
        ]
    }
}

fn expect_len(command: u8, data: &[u8], len: usize) -> Result<()> {
    if data.len() != len {
        return Err(ShdlcError::Protocol(format!(
            "reply to command {:#04x} has {} bytes, expected {}",
            command,
            data.len(),
            len
        )));
    }
    Ok(())
}

fn decode_string(command: u8, data: &[u8]) -> Result<String> {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    let text = std::str::from_utf8(&data[..end]).map_err(|_| {
        ShdlcError::Protocol(format!(
            "reply to command {:#04x} is not a valid string",
            command
        ))
    })?;
    Ok(text.trim().to_string())
}

/// Command set of the Sensirion SPS30 on top of an SHDLC channel.
pub struct Sps30<P> {
    port: P,
    measuring: bool,
}

impl<P: ShdlcPort> Sps30<P> {
    pub fn new(port: P) -> Self {
        Sps30 {
            port,
            measuring: false,
        }
    }

    pub fn is_measuring(&self) -> bool {
        self.measuring
    }

    /// The device is not responsive for ~100 ms afterwards.
    pub fn device_reset(&mut self) -> Result<()> {
        info!("Resetting SPS30");
        let data = self.port.execute(CMD_DEVICE_RESET, &[])?;
        expect_len(CMD_DEVICE_RESET, &data, 0)?;
        self.measuring = false;
        Ok(())
    }

    pub fn read_product_type(&mut self) -> Result<String> {
        let data = self
            .port
            .execute(CMD_DEVICE_INFORMATION, &[INFO_PRODUCT_TYPE])?;
        decode_string(CMD_DEVICE_INFORMATION, &data)
    }

    pub fn read_serial_number(&mut self) -> Result<String> {
        let data = self
            .port
            .execute(CMD_DEVICE_INFORMATION, &[INFO_SERIAL_NUMBER])?;
        decode_string(CMD_DEVICE_INFORMATION, &data)
    }

    pub fn read_version(&mut self) -> Result<VersionInfo> {
        let data = self.port.execute(CMD_READ_VERSION, &[])?;
        expect_len(CMD_READ_VERSION, &data, 7)?;
        Ok(VersionInfo {
            firmware_major: data[0],
            firmware_minor: data[1],
            hardware_revision: data[3],
            shdlc_major: data[5],
            shdlc_minor: data[6],
        })
    }

    pub fn write_auto_cleaning_interval(&mut self, seconds: u32) -> Result<()> {
        info!("Setting auto cleaning interval to {} s", seconds);
        let mut request = vec![0x00];
        request.extend_from_slice(&seconds.to_be_bytes());
        let data = self.port.execute(CMD_AUTO_CLEANING_INTERVAL, &request)?;
        expect_len(CMD_AUTO_CLEANING_INTERVAL, &data, 0)
    }

    pub fn read_auto_cleaning_interval(&mut self) -> Result<u32> {
        let data = self.port.execute(CMD_AUTO_CLEANING_INTERVAL, &[0x00])?;
        expect_len(CMD_AUTO_CLEANING_INTERVAL, &data, 4)?;
        Ok(u32::from_be_bytes([data[0], data[1], data[2], data[3]]))
    }

    /// Reads the status register without clearing it.
    pub fn read_device_status(&mut self) -> Result<DeviceStatus> {
        let data = self.port.execute(CMD_READ_DEVICE_STATUS, &[0x00])?;
        expect_len(CMD_READ_DEVICE_STATUS, &data, 5)?;
        let register = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        debug!("Device status register: {:#010x}", register);
        Ok(DeviceStatus::from_register(register))
    }

    pub fn start_measurement(&mut self) -> Result<()> {
        if self.measuring {
            warn!("Measurement already running, not sending start again");
            return Ok(());
        }
        info!("Starting measurement");
        let data = self
            .port
            .execute(CMD_START_MEASUREMENT, &START_MEASUREMENT_FLOAT_FORMAT)?;
        expect_len(CMD_START_MEASUREMENT, &data, 0)?;
        self.measuring = true;
        Ok(())
    }

    pub fn stop_measurement(&mut self) -> Result<()> {
        info!("Stopping measurement");
        let data = self.port.execute(CMD_STOP_MEASUREMENT, &[])?;
        expect_len(CMD_STOP_MEASUREMENT, &data, 0)?;
        self.measuring = false;
        Ok(())
    }

    /// Readings are invalid for about 10 s while the fan cleans.
    pub fn start_fan_cleaning(&mut self) -> Result<()> {
        info!("Starting fan cleaning");
        let data = self.port.execute(CMD_START_FAN_CLEANING, &[])?;
        expect_len(CMD_START_FAN_CLEANING, &data, 0)
    }

    /// `None` when the sensor has no new values since the last read.
    pub fn read_measured_value(&mut self) -> Result<Option<MeasuredValues>> {
        let data = self.port.execute(CMD_READ_MEASURED_VALUE, &[])?;
        if data.is_empty() {
            debug!("No new measurement available");
            return Ok(None);
        }
        MeasuredValues::from_bytes(&data).map(Some)
    }
}
