use std::fmt;

use chrono::NaiveDateTime;
use serde::Serialize;

use crate::devices::MeasuredValues;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A reading stamped with the local time it was taken.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    pub timestamp: NaiveDateTime,
    pub values: MeasuredValues,
}

impl Measurement {
    pub fn new(timestamp: NaiveDateTime, values: MeasuredValues) -> Self {
        Measurement { timestamp, values }
    }
}

impl fmt::Display for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = &self.values.mass_concentration;
        let n = &self.values.number_concentration;
        write!(
            f,
            "{} | PM1.0 {:.2} PM2.5 {:.2} PM4.0 {:.2} PM10 {:.2} µg/m³ | \
             PM0.5 {:.2} PM1.0 {:.2} PM2.5 {:.2} PM4.0 {:.2} PM10 {:.2} #/cm³ | size {:.3} µm",
            self.timestamp.format(TIMESTAMP_FORMAT),
            m[0],
            m[1],
            m[2],
            m[3],
            n[0],
            n[1],
            n[2],
            n[3],
            n[4],
            self.values.typical_particle_size
        )
    }
}

/// Column names of the measurement log, in row order.
pub const HEADER: [&str; 11] = [
    "Time",
    "Mass Concentration PM1.0 [µg/m³]",
    "Mass Concentration PM2.5 [µg/m³]",
    "Mass Concentration PM4.0 [µg/m³]",
    "Mass Concentration PM10 [µg/m³]",
    "Number Concentration PM0.5 [#/cm³]",
    "Number Concentration PM1.0 [#/cm³]",
    "Number Concentration PM2.5 [#/cm³]",
    "Number Concentration PM4.0 [#/cm³]",
    "Number Concentration PM10 [#/cm³]",
    "Typical Particle Size [µm]",
];

/// One log row, serialized in `HEADER` order.
#[derive(Debug, Serialize)]
pub struct MeasurementRecord {
    pub time: String,
    pub mass_pm1_0: String,
    pub mass_pm2_5: String,
    pub mass_pm4_0: String,
    pub mass_pm10: String,
    pub number_pm0_5: String,
    pub number_pm1_0: String,
    pub number_pm2_5: String,
    pub number_pm4_0: String,
    pub number_pm10: String,
    pub typical_particle_size: String,
}

fn fixed(value: f32) -> String {
    format!("{:.6}", value)
}

impl From<&Measurement> for MeasurementRecord {
    fn from(measurement: &Measurement) -> Self {
        let f = measurement.values.fields();
        MeasurementRecord {
            time: measurement.timestamp.format(TIMESTAMP_FORMAT).to_string(),
            mass_pm1_0: fixed(f[0]),
            mass_pm2_5: fixed(f[1]),
            mass_pm4_0: fixed(f[2]),
            mass_pm10: fixed(f[3]),
            number_pm0_5: fixed(f[4]),
            number_pm1_0: fixed(f[5]),
            number_pm2_5: fixed(f[6]),
            number_pm4_0: fixed(f[7]),
            number_pm10: fixed(f[8]),
            typical_particle_size: fixed(f[9]),
        }
    }
}
