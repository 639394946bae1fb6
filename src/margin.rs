use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind};
use crate::Result;

/// A measured response and its one-sigma uncertainty
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub value: f64,
    pub uncertainty: f64,
}

impl Measurement {
    /// # Errors
    /// Returns [`Error::InvalidInput`] if either value is non-finite or the uncertainty is
    /// negative.
    pub fn new(value: f64, uncertainty: f64) -> Result<Self> {
        let measurement = Self { value, uncertainty };
        measurement.validate()?;
        Ok(measurement)
    }

    /// A measurement without uncertainty
    pub const fn from_centroid(value: f64) -> Self {
        Self {
            value,
            uncertainty: 0.0,
        }
    }

    pub fn variance(&self) -> f64 {
        self.uncertainty * self.uncertainty
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if !self.value.is_finite() {
            return Err(Error::InvalidInput(format!(
                "measured response {} is not finite",
                self.value
            )));
        }
        if !(self.uncertainty.is_finite() && self.uncertainty >= 0.0) {
            return Err(Error::InvalidInput(format!(
                "measurement uncertainty {} must be finite and non-negative",
                self.uncertainty
            )));
        }
        Ok(())
    }
}

/// A dose inferred from one measurement
///
/// Valid estimates carry a finite value and a finite, non-negative uncertainty. Invalid ones
/// carry `NaN` for both and the kind of failure in `reason`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DoseEstimate {
    value: f64,
    uncertainty: f64,
    valid: bool,
    reason: Option<ErrorKind>,
}

impl DoseEstimate {
    /// A valid estimate, or an invalid one if either number is not finite
    pub fn new(value: f64, uncertainty: f64) -> Self {
        if value.is_finite() && uncertainty.is_finite() && uncertainty >= 0.0 {
            Self {
                value,
                uncertainty,
                valid: true,
                reason: None,
            }
        } else {
            Self::invalid(ErrorKind::InvalidInverseDomain)
        }
    }

    pub const fn invalid(reason: ErrorKind) -> Self {
        Self {
            value: f64::NAN,
            uncertainty: f64::NAN,
            valid: false,
            reason: Some(reason),
        }
    }

    pub const fn value(&self) -> f64 {
        self.value
    }

    pub const fn uncertainty(&self) -> f64 {
        self.uncertainty
    }

    pub const fn is_valid(&self) -> bool {
        self.valid
    }

    pub const fn reason(&self) -> Option<ErrorKind> {
        self.reason
    }

    pub fn variance(&self) -> f64 {
        self.uncertainty * self.uncertainty
    }
}

impl From<&Error> for DoseEstimate {
    fn from(value: &Error) -> Self {
        Self::invalid(value.kind())
    }
}
