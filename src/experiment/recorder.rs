use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use csv::{Terminator, Writer, WriterBuilder};
use tracing::{debug, info};

use super::data::{HEADER, Measurement, MeasurementRecord};
use super::Result;

/// Append-only CSV log of measurements.
///
/// The header is written at open only when the file is empty, so repeated
/// runs against the same path keep adding rows under a single header. Every
/// row is flushed and synced before `append` returns.
pub struct SampleRecorder {
    writer: Writer<File>,
    path: PathBuf,
    rows: u64,
}

impl SampleRecorder {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let is_new = file.metadata()?.len() == 0;
        if is_new {
            info!("Creating measurement log {}", path.display());
        } else {
            info!("Appending to existing measurement log {}", path.display());
        }

        // Excel dialect with a semicolon separator.
        let mut writer = WriterBuilder::new()
            .delimiter(b';')
            .terminator(Terminator::CRLF)
            .has_headers(false)
            .from_writer(file);

        if is_new {
            writer.write_record(HEADER)?;
            writer.flush()?;
            writer.get_ref().sync_data()?;
        }

        Ok(SampleRecorder {
            writer,
            path,
            rows: 0,
        })
    }

    pub fn append(&mut self, measurement: &Measurement) -> Result<()> {
        self.writer.serialize(MeasurementRecord::from(measurement))?;
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        self.rows += 1;
        debug!("Appended row {} to {}", self.rows, self.path.display());
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rows appended through this handle.
    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn close(mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        info!(
            "Closed measurement log {} after {} rows",
            self.path.display(),
            self.rows
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::MeasuredValues;
    use chrono::NaiveDate;

    const HEADER_LINE: &str = "Time;Mass Concentration PM1.0 [µg/m³];Mass Concentration PM2.5 [µg/m³];\
Mass Concentration PM4.0 [µg/m³];Mass Concentration PM10 [µg/m³];Number Concentration PM0.5 [#/cm³];\
Number Concentration PM1.0 [#/cm³];Number Concentration PM2.5 [#/cm³];Number Concentration PM4.0 [#/cm³];\
Number Concentration PM10 [#/cm³];Typical Particle Size [µm]";

    fn measurement(second: u32, base: f32) -> Measurement {
        let timestamp = NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(12, 0, second)
            .unwrap();
        Measurement::new(
            timestamp,
            MeasuredValues {
                mass_concentration: [base, base + 0.123_456_7, base * 2.0, base * 3.5],
                number_concentration: [base + 7.0, 9.876_543, 12.5, 0.000_001, 1234.567_9],
                typical_particle_size: 0.611_111,
            },
        )
    }

    #[test]
    fn header_written_once_across_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.csv");

        let mut recorder = SampleRecorder::open(&path).unwrap();
        recorder.append(&measurement(0, 1.0)).unwrap();
        recorder.close().unwrap();

        let mut recorder = SampleRecorder::open(&path).unwrap();
        recorder.append(&measurement(1, 2.0)).unwrap();
        recorder.append(&measurement(2, 3.0)).unwrap();
        assert_eq!(recorder.rows(), 2);
        recorder.close().unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.split_terminator("\r\n").collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], HEADER_LINE);
        assert_eq!(lines.iter().filter(|l| l.starts_with("Time;")).count(), 1);
        assert!(lines[1].starts_with("2024-03-01 12:00:00;1.000000;"));
        assert!(lines[3].starts_with("2024-03-01 12:00:02;3.000000;"));
    }

    #[test]
    fn header_written_at_open_before_any_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fresh.csv");

        SampleRecorder::open(&path).unwrap().close().unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            format!("{}\r\n", HEADER_LINE)
        );

        let mut recorder = SampleRecorder::open(&path).unwrap();
        recorder.append(&measurement(3, 1.0)).unwrap();
        recorder.close().unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.matches("Time;").count(), 1);
        assert_eq!(content.split_terminator("\r\n").count(), 2);
    }

    #[test]
    fn no_header_when_file_already_has_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("existing.csv");
        std::fs::write(&path, "previous;data\r\n").unwrap();

        let mut recorder = SampleRecorder::open(&path).unwrap();
        recorder.append(&measurement(5, 1.0)).unwrap();
        recorder.close().unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("previous;data\r\n2024-03-01 12:00:05;"));
        assert!(!content.contains("Time;"));
    }

    #[test]
    fn creates_missing_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("day").join("log.csv");
        let recorder = SampleRecorder::open(&path).unwrap();
        assert_eq!(recorder.path(), path.as_path());
        recorder.close().unwrap();
        assert!(path.exists());
    }

    #[test]
    fn rows_read_back_within_six_decimals() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roundtrip.csv");
        let samples = [measurement(0, 0.1), measurement(1, 17.333_33), measurement(2, 999.999)];

        let mut recorder = SampleRecorder::open(&path).unwrap();
        for sample in &samples {
            recorder.append(sample).unwrap();
        }
        recorder.close().unwrap();

        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b';')
            .has_headers(true)
            .from_path(&path)
            .unwrap();
        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), samples.len());

        for (row, sample) in rows.iter().zip(&samples) {
            assert_eq!(row.len(), 11);
            assert_eq!(
                &row[0],
                sample.timestamp.format("%Y-%m-%d %H:%M:%S").to_string()
            );
            for (field, expected) in row.iter().skip(1).zip(sample.values.fields()) {
                let decimals = field.split('.').nth(1).unwrap();
                assert_eq!(decimals.len(), 6, "field {} is not fixed at 6 decimals", field);
                let parsed: f64 = field.parse().unwrap();
                assert!(
                    (parsed - expected as f64).abs() <= 1e-6,
                    "{} differs from {}",
                    parsed,
                    expected
                );
            }
        }
    }
}
