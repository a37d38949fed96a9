//! CSV export of the readings table

use std::fs::File;
use std::io;
use std::path::Path;

use tracing::info;

use super::{Reading, ReadingStore};
use crate::error::Result;

/// Column header of exported files
pub const CSV_HEADER: [&str; 5] = ["id", "moisture_percent", "temperature", "humidity", "timestamp"];

/// Timestamp layout in exported files
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Write readings as CSV
///
/// NULL values become empty fields. Whole numbers keep one decimal place
/// (`20.0`), matching files written by the earlier desktop logger.
pub fn write_csv<W: io::Write>(readings: &[Reading], writer: W) -> Result<()> {
    let mut csv = csv::Writer::from_writer(writer);
    csv.write_record(CSV_HEADER)?;

    for reading in readings {
        csv.write_record([
            reading.id.to_string(),
            optional(reading.moisture_percent),
            optional(reading.temperature),
            optional(reading.humidity),
            reading.date_created.format(TIMESTAMP_FORMAT).to_string(),
        ])?;
    }

    csv.flush()?;
    Ok(())
}

/// Export every stored reading to a CSV file
///
/// # Returns
///
/// * `Result<usize>` - Number of rows written
pub async fn export_csv(store: &ReadingStore, path: &Path) -> Result<usize> {
    let readings = store.all().await?;
    let file = File::create(path)?;
    write_csv(&readings, file)?;
    info!("Exported {} readings to {}", readings.len(), path.display());
    Ok(readings.len())
}

fn optional(value: Option<f64>) -> String {
    value.map(|v| format!("{:?}", v)).unwrap_or_default()
}
