use ndarray::Array1;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::Result;

/// One calibration measurement: a known dose and the instrument response it produced
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CalibrationPoint {
    /// The known dose (or pixel value for models fitted in the inverse direction)
    pub predictor: f64,
    pub response: f64,
    /// One standard deviation on `response`, if measured
    #[serde(default)]
    pub response_uncertainty: Option<f64>,
}

impl CalibrationPoint {
    pub const fn new(predictor: f64, response: f64) -> Self {
        Self {
            predictor,
            response,
            response_uncertainty: None,
        }
    }

    pub const fn with_uncertainty(mut self, uncertainty: f64) -> Self {
        self.response_uncertainty = Some(uncertainty);
        self
    }
}

/// An ordered, validated collection of calibration points
///
/// Either every point carries a positive response uncertainty (the fit then runs in
/// absolute-sigma mode) or none does. Order only matters for reproducible seeding.
#[derive(Clone, Debug, PartialEq)]
pub struct CalibrationSet {
    points: Vec<CalibrationPoint>,
}

impl CalibrationSet {
    /// # Errors
    /// Returns [`Error::InvalidInput`] if any value is non-finite, an uncertainty is not
    /// positive, or uncertainties are given for some points but not others.
    pub fn new(points: Vec<CalibrationPoint>) -> Result<Self> {
        for (ii, point) in points.iter().enumerate() {
            if !point.predictor.is_finite() || !point.response.is_finite() {
                return Err(Error::InvalidInput(format!(
                    "calibration point {ii} is not finite: ({}, {})",
                    point.predictor, point.response
                )));
            }
            if let Some(sigma) = point.response_uncertainty {
                if !(sigma.is_finite() && sigma > 0.0) {
                    return Err(Error::InvalidInput(format!(
                        "calibration point {ii} has uncertainty {sigma}, expected a positive value"
                    )));
                }
            }
        }
        let with_uncertainty = points
            .iter()
            .filter(|p| p.response_uncertainty.is_some())
            .count();
        if with_uncertainty != 0 && with_uncertainty != points.len() {
            return Err(Error::InvalidInput(format!(
                "{with_uncertainty} of {} calibration points carry an uncertainty; \
                 either all or none must",
                points.len()
            )));
        }
        Ok(Self { points })
    }

    /// # Errors
    /// As [`Self::new`].
    pub fn from_pairs(pairs: &[(f64, f64)]) -> Result<Self> {
        Self::new(
            pairs
                .iter()
                .map(|&(predictor, response)| CalibrationPoint::new(predictor, response))
                .collect(),
        )
    }

    /// # Errors
    /// Returns an error if the slices differ in length, or as [`Self::new`].
    pub fn from_arrays(predictors: &[f64], responses: &[f64]) -> Result<Self> {
        if predictors.len() != responses.len() {
            return Err(Error::InvalidInput(format!(
                "{} predictors but {} responses",
                predictors.len(),
                responses.len()
            )));
        }
        Self::new(
            predictors
                .iter()
                .zip(responses)
                .map(|(&predictor, &response)| CalibrationPoint::new(predictor, response))
                .collect(),
        )
    }

    /// Evaluate `response` at each predictor
    ///
    /// # Errors
    /// As [`Self::new`].
    pub fn from_fn(
        predictors: impl IntoIterator<Item = f64>,
        response: impl Fn(f64) -> f64,
    ) -> Result<Self> {
        Self::new(
            predictors
                .into_iter()
                .map(|x| CalibrationPoint::new(x, response(x)))
                .collect(),
        )
    }

    /// Attach one uncertainty per point
    ///
    /// # Errors
    /// Returns an error on a length mismatch, or as [`Self::new`].
    pub fn with_uncertainties(self, uncertainties: &[f64]) -> Result<Self> {
        if uncertainties.len() != self.points.len() {
            return Err(Error::InvalidInput(format!(
                "{} uncertainties for {} calibration points",
                uncertainties.len(),
                self.points.len()
            )));
        }
        Self::new(
            self.points
                .into_iter()
                .zip(uncertainties)
                .map(|(point, &sigma)| point.with_uncertainty(sigma))
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> &[CalibrationPoint] {
        &self.points
    }

    pub fn predictors(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.predictor).collect()
    }

    pub fn responses(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.response).collect()
    }

    /// Response standard deviations, if every point has one
    pub fn uncertainties(&self) -> Option<Array1<f64>> {
        self.points
            .iter()
            .map(|p| p.response_uncertainty)
            .collect::<Option<Vec<_>>>()
            .filter(|sigma| !sigma.is_empty())
            .map(Array1::from)
    }

    /// Whether the fit should treat the uncertainties as absolute
    pub fn has_uncertainties(&self) -> bool {
        !self.points.is_empty() && self.points.iter().all(|p| p.response_uncertainty.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::{CalibrationPoint, CalibrationSet};
    use crate::error::ErrorKind;

    #[test]
    fn mixed_uncertainties_are_rejected() {
        let points = vec![
            CalibrationPoint::new(0.0, 1.0).with_uncertainty(0.1),
            CalibrationPoint::new(1.0, 2.0),
        ];
        let err = CalibrationSet::new(points).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn non_finite_points_are_rejected() {
        assert!(CalibrationSet::from_pairs(&[(0.0, f64::NAN)]).is_err());
        assert!(CalibrationSet::from_pairs(&[(f64::INFINITY, 1.0)]).is_err());
        assert!(CalibrationSet::from_arrays(&[0.0, 1.0], &[1.0]).is_err());
    }

    #[test]
    fn non_positive_uncertainties_are_rejected() {
        let set = CalibrationSet::from_pairs(&[(0.0, 1.0), (1.0, 2.0)]).unwrap();
        assert!(set.clone().with_uncertainties(&[0.1, 0.0]).is_err());
        assert!(set.clone().with_uncertainties(&[0.1]).is_err());
        let set = set.with_uncertainties(&[0.1, 0.2]).unwrap();
        assert!(set.has_uncertainties());
        assert_eq!(set.uncertainties().unwrap().to_vec(), vec![0.1, 0.2]);
    }

    #[test]
    fn unweighted_sets_report_no_uncertainties() {
        let set = CalibrationSet::from_pairs(&[(0.0, 1.0), (1.0, 2.0)]).unwrap();
        assert!(!set.has_uncertainties());
        assert!(set.uncertainties().is_none());
        assert_eq!(set.predictors(), vec![0.0, 1.0]);
        assert_eq!(set.responses(), vec![1.0, 2.0]);
    }
}
