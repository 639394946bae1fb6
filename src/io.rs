use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::calibration::{CalibrationPoint, CalibrationSet};
use crate::error::Error;
use crate::pipeline::EstimateRecord;
use crate::Result;

#[derive(Deserialize)]
struct Row {
    predictor: f64,
    response: f64,
    #[serde(default)]
    uncertainty: Option<f64>,
}

/// Read `predictor,response[,uncertainty]` records with a header row
///
/// # Errors
/// Returns an error if a record cannot be parsed or the set is invalid.
pub fn read_calibration<R: std::io::Read>(reader: R) -> Result<CalibrationSet> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let mut points = vec![];
    for result in rdr.deserialize() {
        let record: Row = result?;
        let point = CalibrationPoint::new(record.predictor, record.response);
        points.push(match record.uncertainty {
            Some(sigma) => point.with_uncertainty(sigma),
            None => point,
        });
    }
    if points.is_empty() {
        return Err(Error::InvalidInput("calibration file has no records".into()));
    }
    CalibrationSet::new(points)
}

/// # Errors
/// Returns an error if the file is missing or malformed.
pub fn read_calibration_file(path: &Path) -> Result<CalibrationSet> {
    let file = fs::read(path)?;
    read_calibration(&file[..])
}

/// Write one CSV row per estimate, with a header
///
/// # Errors
/// Returns an error if a record cannot be written.
pub fn write_estimates<W: std::io::Write>(writer: W, records: &[EstimateRecord]) -> Result<()> {
    let mut wtr = csv::Writer::from_writer(writer);
    for record in records {
        wtr.serialize(record)?;
    }
    wtr.flush()?;
    Ok(())
}

/// # Errors
/// Returns an error if the file cannot be created or written.
pub fn write_estimates_file(path: &Path, records: &[EstimateRecord]) -> Result<()> {
    let file = fs::File::create(path)?;
    write_estimates(file, records)
}
