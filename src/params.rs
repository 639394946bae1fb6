//! Flat `name = value ± uncertainty` calibration parameter files.
//!
//! These are exchanged with spreadsheet tools and older scripts, so the reader is lenient: the
//! `±` may arrive mis-encoded (`Â±`, a replacement character) or spelled `+/-` or `+-`, and
//! stray non-numeric characters around the numbers are dropped.

use std::fmt;
use std::fs;
use std::path::Path;

use ndarray::{Array1, Array2};
use tracing::debug;

use crate::error::Error;
use crate::fit::{FittedModel, Quality};
use crate::model::ParametricModel;
use crate::Result;

const SEPARATORS: [&str; 5] = ["Â±", "+/-", "+-", "\u{FFFD}", "±"];

const R_SQUARED: &str = "R2";
const STANDARD_ERROR: &str = "SER";
const RESIDUAL_VARIANCE: &str = "residual_variance";
const DEGREES_OF_FREEDOM: &str = "dof";

#[derive(Clone, Debug, PartialEq)]
pub struct ParameterEntry {
    pub name: String,
    pub value: f64,
    pub uncertainty: Option<f64>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParameterFile {
    entries: Vec<ParameterEntry>,
}

impl ParameterFile {
    pub fn new(entries: Vec<ParameterEntry>) -> Self {
        Self { entries }
    }

    /// # Errors
    /// Returns [`Error::ParameterFile`] naming the first line that cannot be read.
    pub fn parse(text: &str) -> Result<Self> {
        let mut entries = Vec::new();
        for (ii, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            entries.push(parse_line(line).map_err(|detail| Error::ParameterFile {
                line: ii + 1,
                detail,
            })?);
        }
        Ok(Self { entries })
    }

    /// Parse raw bytes, replacing invalid UTF-8 rather than failing on it
    ///
    /// # Errors
    /// As [`Self::parse`].
    pub fn parse_bytes(bytes: &[u8]) -> Result<Self> {
        Self::parse(&String::from_utf8_lossy(bytes))
    }

    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn read(path: &Path) -> Result<Self> {
        let file = Self::parse_bytes(&fs::read(path)?)?;
        debug!(path = %path.display(), entries = file.entries.len(), "read parameter file");
        Ok(file)
    }

    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn write(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_string())?;
        Ok(())
    }

    pub fn entries(&self) -> &[ParameterEntry] {
        &self.entries
    }

    pub fn get(&self, name: &str) -> Option<&ParameterEntry> {
        self.entries.iter().find(|entry| entry.name == name)
    }

    /// Parameters with their standard errors, then the fit quality figures
    pub fn from_fitted(fitted: &FittedModel) -> Self {
        let mut entries = fitted
            .model()
            .parameter_names()
            .into_iter()
            .zip(fitted.parameters())
            .zip(fitted.standard_errors())
            .map(|((name, &value), sigma)| ParameterEntry {
                name,
                value,
                uncertainty: Some(sigma),
            })
            .collect::<Vec<_>>();
        let quality = fitted.quality();
        let bare = |name: &str, value: f64| ParameterEntry {
            name: name.to_owned(),
            value,
            uncertainty: None,
        };
        entries.push(bare(R_SQUARED, quality.r_squared));
        entries.push(bare(STANDARD_ERROR, quality.standard_error));
        entries.push(bare(RESIDUAL_VARIANCE, quality.residual_variance));
        #[allow(clippy::cast_precision_loss)]
        let dof = quality.degrees_of_freedom as f64;
        entries.push(bare(DEGREES_OF_FREEDOM, dof));
        Self { entries }
    }

    /// Rebuild a fitted `model` with a diagonal covariance
    ///
    /// Parameters written without an uncertainty are taken as exact.
    ///
    /// # Errors
    /// Returns an error if a parameter of `model` is missing or the values are not a valid
    /// model.
    pub fn to_fitted(&self, model: ParametricModel) -> Result<FittedModel> {
        let names = model.parameter_names();
        let mut values = Array1::zeros(names.len());
        let mut covariance = Array2::zeros((names.len(), names.len()));
        for (jj, name) in names.iter().enumerate() {
            let entry = self.get(name).ok_or_else(|| {
                Error::InvalidInput(format!("parameter `{name}` of model {model} is missing"))
            })?;
            values[jj] = entry.value;
            covariance[[jj, jj]] = entry.uncertainty.unwrap_or(0.0).powi(2);
        }

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let degrees_of_freedom = self
            .get(DEGREES_OF_FREEDOM)
            .map_or(0, |e| e.value.max(0.0).round() as usize);
        let quality = Quality {
            r_squared: self.get(R_SQUARED).map_or(f64::NAN, |e| e.value),
            standard_error: self.get(STANDARD_ERROR).map_or(f64::NAN, |e| e.value),
            residual_variance: self.get(RESIDUAL_VARIANCE).map_or(f64::NAN, |e| e.value),
            degrees_of_freedom,
        };
        FittedModel::from_parts(model, values, covariance, quality)
    }
}

impl fmt::Display for ParameterFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for entry in &self.entries {
            match entry.uncertainty {
                Some(sigma) => writeln!(
                    f,
                    "{} = {} ± {}",
                    entry.name,
                    scientific(entry.value),
                    scientific(sigma)
                )?,
                None => writeln!(f, "{} = {}", entry.name, scientific(entry.value))?,
            }
        }
        Ok(())
    }
}

/// `{:.6e}` with a signed two-digit exponent, as in `1.234560e+00`
fn scientific(value: f64) -> String {
    if !value.is_finite() {
        return value.to_string();
    }
    let formatted = format!("{value:.6e}");
    match formatted.split_once('e') {
        Some((mantissa, exponent)) => {
            let exponent: i32 = exponent.parse().unwrap_or(0);
            let sign = if exponent < 0 { '-' } else { '+' };
            format!("{mantissa}e{sign}{:02}", exponent.abs())
        }
        None => formatted,
    }
}

fn parse_line(line: &str) -> ::std::result::Result<ParameterEntry, String> {
    let (name, rest) = line
        .split_once('=')
        .ok_or_else(|| format!("expected `name = value`, found `{line}`"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err("missing parameter name".into());
    }

    let separated = SEPARATORS
        .iter()
        .find_map(|separator| rest.split_once(separator));
    let (value, uncertainty) = match separated {
        Some((value, uncertainty)) => (parse_number(value)?, Some(parse_number(uncertainty)?)),
        None => (parse_number(rest)?, None),
    };
    Ok(ParameterEntry {
        name: name.to_owned(),
        value,
        uncertainty,
    })
}

/// Parse a float after dropping every character that cannot be part of one
fn parse_number(text: &str) -> ::std::result::Result<f64, String> {
    let trimmed = text.trim();
    if let Ok(value) = trimmed.parse::<f64>() {
        return Ok(value);
    }
    let cleaned = trimmed
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E' | '+' | '-'))
        .collect::<String>();
    cleaned
        .parse::<f64>()
        .map_err(|_| format!("cannot read a number from `{trimmed}`"))
}
