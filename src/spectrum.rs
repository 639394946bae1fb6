//! Absorbance spectra and the first stage of the two-stage peak calibration.
//!
//! A [`Spectrum`] is masked to a wavelength [`Window`], fitted with a sum of Lorentzian lines
//! or a single Gaussian, and reduced to a scalar [`Summary`] whose variance comes from the peak
//! covariance. The [`SummaryStatistic::Trapezoid`] statistic skips the fit and integrates the
//! samples directly.

use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::calibration::CalibrationSet;
use crate::error::Error;
use crate::fit::{fit_with, FitOptions, FittedModel};
use crate::math::{extent, trapezoid, trapezoid_weights};
use crate::model::{lorentzian_seed, ParametricModel, Parameters};
use crate::propagate::{numeric_gradient, propagate, Propagated};
use crate::Result;

/// Inclusive wavelength interval
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Window {
    pub min: f64,
    pub max: f64,
}

impl Window {
    /// # Errors
    /// Returns an error unless `min < max` and both are finite.
    pub fn new(min: f64, max: f64) -> Result<Self> {
        if !(min.is_finite() && max.is_finite() && min < max) {
            return Err(Error::InvalidInput(format!(
                "wavelength window [{min}, {max}] is empty or not finite"
            )));
        }
        Ok(Self { min, max })
    }

    pub fn contains(&self, x: f64) -> bool {
        (self.min..=self.max).contains(&x)
    }
}

/// Line shape fitted to each spectrum
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PeakShape {
    #[default]
    Lorentzian,
    /// A single Gaussian line; the peak count is ignored
    Gaussian,
}

impl PeakShape {
    pub const fn model(self, peaks: usize) -> ParametricModel {
        match self {
            Self::Lorentzian => ParametricModel::LorentzianSum { peaks },
            Self::Gaussian => ParametricModel::Gaussian,
        }
    }
}

/// Points used to integrate a fitted Gaussian over a window
const INTEGRATION_SAMPLES: usize = 4001;

/// Thresholds for local-maximum detection
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeakDetection {
    /// Minimum height above the higher of the two surrounding bases
    pub min_prominence: f64,
    /// Minimum separation between retained peaks, in samples
    pub min_distance: usize,
}

impl Default for PeakDetection {
    fn default() -> Self {
        Self {
            min_prominence: 1e-3,
            min_distance: 10,
        }
    }
}

/// Indices of the local maxima of `y`, tallest first
///
/// A maximum is kept when its prominence reaches `min_prominence` and no taller kept maximum
/// lies within `min_distance` samples.
pub fn detect_peaks(y: &[f64], detection: &PeakDetection) -> Vec<usize> {
    let n = y.len();
    if n < 3 {
        return Vec::new();
    }

    let mut candidates = (1..n - 1)
        .filter(|&ii| y[ii] > y[ii - 1] && y[ii] >= y[ii + 1])
        .filter(|&ii| prominence(y, ii) >= detection.min_prominence)
        .collect::<Vec<_>>();
    candidates.sort_by(|&a, &b| y[b].total_cmp(&y[a]));

    let mut kept: Vec<usize> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if kept
            .iter()
            .all(|&other| candidate.abs_diff(other) >= detection.min_distance)
        {
            kept.push(candidate);
        }
    }
    kept
}

/// Height of `y[peak]` above the higher of its left and right bases
///
/// Each base is the lowest sample between the peak and the nearest strictly taller sample on
/// that side, or the end of the data.
fn prominence(y: &[f64], peak: usize) -> f64 {
    let height = y[peak];
    let left = y[..peak]
        .iter()
        .rev()
        .take_while(|&&v| v <= height)
        .fold(height, |acc, &v| acc.min(v));
    let right = y[peak + 1..]
        .iter()
        .take_while(|&&v| v <= height)
        .fold(height, |acc, &v| acc.min(v));
    height - left.max(right)
}

/// A sampled spectrum: response (absorbance or net optical density) against wavelength
#[derive(Clone, Debug, PartialEq)]
pub struct Spectrum {
    wavelength: Array1<f64>,
    response: Array1<f64>,
}

impl Spectrum {
    /// # Errors
    /// Returns [`Error::InvalidInput`] on a length mismatch or non-finite samples.
    pub fn new(wavelength: Vec<f64>, response: Vec<f64>) -> Result<Self> {
        if wavelength.len() != response.len() {
            return Err(Error::InvalidInput(format!(
                "spectrum has {} wavelengths but {} responses",
                wavelength.len(),
                response.len()
            )));
        }
        if !wavelength.iter().chain(&response).all(|v| v.is_finite()) {
            return Err(Error::InvalidInput("spectrum contains non-finite samples".into()));
        }
        Ok(Self {
            wavelength: Array1::from(wavelength),
            response: Array1::from(response),
        })
    }

    pub fn len(&self) -> usize {
        self.wavelength.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wavelength.is_empty()
    }

    pub fn wavelength(&self) -> ArrayView1<f64> {
        self.wavelength.view()
    }

    pub fn response(&self) -> ArrayView1<f64> {
        self.response.view()
    }

    /// The samples whose wavelength lies inside `window`
    ///
    /// # Errors
    /// Returns [`Error::InsufficientData`] if fewer than two samples remain.
    pub fn window(&self, window: &Window) -> Result<Self> {
        let (wavelength, response): (Vec<f64>, Vec<f64>) = self
            .wavelength
            .iter()
            .zip(&self.response)
            .filter(|(x, _)| window.contains(**x))
            .map(|(&x, &y)| (x, y))
            .unzip();
        if wavelength.len() < 2 {
            return Err(Error::InsufficientData {
                points: wavelength.len(),
                parameters: 2,
            });
        }
        Ok(Self {
            wavelength: Array1::from(wavelength),
            response: Array1::from(response),
        })
    }

    /// Trapezoidal area under the response
    pub fn integrate(&self) -> f64 {
        trapezoid(self.wavelength.view(), self.response.view())
    }

    /// Trapezoidal area with the variance of independent response errors of
    /// `response_uncertainty`: `σ²·Σ wᵢ²` over the trapezoid weights
    ///
    /// # Errors
    /// Returns [`Error::InvalidInput`] unless `response_uncertainty` is finite and non-negative.
    pub fn area(&self, response_uncertainty: f64) -> Result<Summary> {
        if !(response_uncertainty.is_finite() && response_uncertainty >= 0.0) {
            return Err(Error::InvalidInput(format!(
                "response uncertainty {response_uncertainty} must be finite and non-negative"
            )));
        }
        let weights = trapezoid_weights(self.wavelength.view());
        Ok(Summary {
            value: self.integrate(),
            variance: response_uncertainty.powi(2) * weights.dot(&weights),
        })
    }

    /// # Errors
    /// As [`CalibrationSet::from_arrays`].
    pub fn to_calibration_set(&self) -> Result<CalibrationSet> {
        CalibrationSet::from_arrays(&self.wavelength.to_vec(), &self.response.to_vec())
    }

    /// Fit `peaks` lines of `shape`
    ///
    /// Lorentzian sums are seeded from the detected maxima, the Gaussian from the tallest sample.
    ///
    /// # Errors
    /// [`Error::InvalidInput`] for a Lorentzian sum without peaks; otherwise any fit error.
    pub fn fit_peaks(
        &self,
        shape: PeakShape,
        peaks: usize,
        detection: &PeakDetection,
        options: &FitOptions,
    ) -> Result<FittedModel> {
        let model = shape.model(peaks);
        model.validate()?;
        let set = self.to_calibration_set()?;
        let seed = match shape {
            PeakShape::Lorentzian => {
                lorentzian_seed(&set.predictors(), &set.responses(), peaks, detection)
            }
            PeakShape::Gaussian => model.initial_guess(&set)?,
        };
        debug!(%model, samples = set.len(), "fitting spectral peaks");
        fit_with(model, &set, seed, None, options)
    }
}

/// Scalar reduction of a spectrum
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SummaryStatistic {
    /// Sum of the Lorentzian intensities, or the Gaussian height
    #[default]
    AmplitudeSum,
    /// Sum of the fitted curve over the spectrum's wavelength samples
    CurveSum,
    /// Integral of the fitted peaks over the spectrum's wavelength extent
    WindowIntegral,
    /// Centre of the tallest fitted line
    PeakCentre,
    /// Trapezoidal area of the raw samples, without a peak fit
    Trapezoid,
}

impl SummaryStatistic {
    /// Whether the statistic is computed from a peak fit
    pub const fn needs_peak_fit(self) -> bool {
        !matches!(self, Self::Trapezoid)
    }
}

/// A summary value with its propagated variance
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub value: f64,
    pub variance: f64,
}

impl Summary {
    pub fn uncertainty(&self) -> f64 {
        self.variance.sqrt()
    }
}

/// Reduce a peak fit of `spectrum` to `statistic`
///
/// # Errors
/// - [`Error::InvalidInput`] if `fitted` is not a peak model, or for
///   [`SummaryStatistic::Trapezoid`], which [`Spectrum::area`] computes without a fit
/// - [`Error::IllConditionedCovariance`] if the peak covariance is not positive-semidefinite
pub fn summarise(
    fitted: &FittedModel,
    spectrum: &Spectrum,
    statistic: SummaryStatistic,
) -> Result<Summary> {
    let model = fitted.model();
    let theta = fitted.parameters();
    let heights = match model.unpack(theta)? {
        Parameters::LorentzianSum(peaks) => peaks
            .iter()
            .map(|p| p.evaluate(p.centre))
            .collect::<Vec<_>>(),
        Parameters::Gaussian { height, .. } => vec![height],
        _ => {
            return Err(Error::InvalidInput(format!(
                "spectral summaries need a peak model, got {model}"
            )))
        }
    };

    // Both peak models lay their parameters out as (size, centre, width) triples
    let (value, gradient) = match statistic {
        SummaryStatistic::AmplitudeSum => {
            let value = theta.iter().step_by(3).sum::<f64>();
            let gradient = (0..theta.len())
                .map(|jj| if jj % 3 == 0 { 1.0 } else { 0.0 })
                .collect::<Array1<f64>>();
            (value, gradient)
        }
        SummaryStatistic::PeakCentre => {
            let tallest = heights
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .map_or(0, |(ii, _)| ii);
            let mut gradient = Array1::<f64>::zeros(theta.len());
            gradient[3 * tallest + 1] = 1.0;
            (theta[3 * tallest + 1], gradient)
        }
        SummaryStatistic::CurveSum => {
            let wavelength = spectrum.wavelength();
            let curve_sum = |theta: ArrayView1<f64>| {
                wavelength
                    .iter()
                    .map(|&x| model.evaluate(x, theta.view()))
                    .sum::<f64>()
            };
            (curve_sum(theta), numeric_gradient(curve_sum, theta))
        }
        SummaryStatistic::WindowIntegral => {
            let (lo, hi) = extent(spectrum.wavelength.iter().copied()).unwrap_or((0.0, 0.0));
            let grid = Array1::linspace(lo, hi, INTEGRATION_SAMPLES);
            let integral = |theta: ArrayView1<f64>| match model.unpack(theta) {
                Ok(Parameters::LorentzianSum(peaks)) => {
                    peaks.iter().map(|p| p.integral(lo, hi)).sum::<f64>()
                }
                Ok(Parameters::Gaussian { .. }) => {
                    let curve = grid.mapv(|x| model.evaluate(x, theta.view()));
                    trapezoid(grid.view(), curve.view())
                }
                _ => f64::NAN,
            };
            (integral(theta), numeric_gradient(integral, theta))
        }
        SummaryStatistic::Trapezoid => {
            return Err(Error::InvalidInput(
                "the trapezoid statistic integrates the raw spectrum, not a peak fit".into(),
            ))
        }
    };

    match propagate(gradient.view(), fitted.covariance(), &[])? {
        Propagated::Variance(variance) => Ok(Summary { value, variance }),
        Propagated::IllConditioned { min_eigenvalue } => Err(Error::IllConditionedCovariance {
            detail: format!("peak covariance has eigenvalue {min_eigenvalue:e}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::{
        detect_peaks, summarise, PeakDetection, PeakShape, Spectrum, SummaryStatistic, Window,
    };
    use crate::error::Error;
    use crate::fit::{FitOptions, FittedModel, Quality};
    use crate::model::{ParametricModel, Peak};

    use ndarray::{arr1, Array2};

    fn two_peaks() -> (Vec<f64>, Vec<f64>) {
        let peaks = [
            Peak {
                intensity: 3.0,
                centre: 630.0,
                width: 12.0,
            },
            Peak {
                intensity: 1.5,
                centre: 655.0,
                width: 8.0,
            },
        ];
        let x = (0..=160).map(|k| 600.0 + 0.5 * f64::from(k)).collect::<Vec<_>>();
        let y = x
            .iter()
            .map(|&x| peaks.iter().map(|p| p.evaluate(x)).sum())
            .collect();
        (x, y)
    }

    #[test]
    fn peaks_are_found_tallest_first() {
        let (x, y) = two_peaks();
        let found = detect_peaks(&y, &PeakDetection::default());
        assert_eq!(found.len(), 2);
        approx::assert_abs_diff_eq!(x[found[0]], 630.0, epsilon = 0.5);
        approx::assert_abs_diff_eq!(x[found[1]], 655.0, epsilon = 0.5);
    }

    #[test]
    fn close_or_shallow_maxima_are_discarded() {
        let y = [0.0, 1.0, 0.0, 0.9, 0.0, 0.0, 0.0, 0.5, 0.4999, 0.5001, 0.0];
        let detection = PeakDetection {
            min_prominence: 1e-2,
            min_distance: 3,
        };
        // 3 is too close to 1; 7 barely rises above its right base
        assert_eq!(detect_peaks(&y, &detection), vec![1, 9]);
    }

    #[test]
    fn windows_are_inclusive() {
        let spectrum = Spectrum::new(vec![1.0, 2.0, 3.0, 4.0], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let masked = spectrum.window(&Window::new(2.0, 3.0).unwrap()).unwrap();
        assert_eq!(masked.wavelength().to_vec(), vec![2.0, 3.0]);
        assert!(spectrum.window(&Window::new(2.5, 2.6).unwrap()).is_err());
        assert!(Window::new(3.0, 1.0).is_err());
    }

    #[test]
    fn malformed_spectra_are_rejected() {
        assert!(Spectrum::new(vec![1.0, 2.0], vec![1.0]).is_err());
        assert!(Spectrum::new(vec![1.0, 2.0], vec![1.0, f64::NAN]).is_err());
    }

    #[test]
    fn integration_uses_the_trapezoid_rule() {
        let spectrum = Spectrum::new(vec![0.0, 1.0, 2.0], vec![0.0, 2.0, 0.0]).unwrap();
        approx::assert_relative_eq!(spectrum.integrate(), 2.0);
    }

    #[test]
    fn peak_fits_recover_the_generating_lines() {
        let (x, y) = two_peaks();
        let spectrum = Spectrum::new(x, y).unwrap();
        let fitted = spectrum
            .fit_peaks(
                PeakShape::Lorentzian,
                2,
                &PeakDetection::default(),
                &FitOptions::default(),
            )
            .unwrap();
        let expected = [3.0, 630.0, 12.0, 1.5, 655.0, 8.0];
        for (found, expected) in fitted.parameters().iter().zip(expected) {
            approx::assert_relative_eq!(*found, expected, max_relative = 1e-6);
        }
    }

    #[test]
    fn lorentzian_fits_need_a_peak() {
        let (x, y) = two_peaks();
        let spectrum = Spectrum::new(x, y).unwrap();
        let err = spectrum
            .fit_peaks(
                PeakShape::Lorentzian,
                0,
                &PeakDetection::default(),
                &FitOptions::default(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    fn gaussian_line(height: f64) -> Spectrum {
        let theta = arr1(&[height, 640.0, 9.0]);
        let x = (0..=160).map(|k| 600.0 + 0.5 * f64::from(k)).collect::<Vec<_>>();
        let y = x
            .iter()
            .map(|&x| ParametricModel::Gaussian.evaluate(x, theta.view()))
            .collect();
        Spectrum::new(x, y).unwrap()
    }

    #[test]
    fn gaussian_fits_recover_the_generating_line() {
        let spectrum = gaussian_line(1.2);
        let fitted = spectrum
            .fit_peaks(
                PeakShape::Gaussian,
                2,
                &PeakDetection::default(),
                &FitOptions::default(),
            )
            .unwrap();
        assert_eq!(fitted.model(), ParametricModel::Gaussian);
        for (found, expected) in fitted.parameters().iter().zip([1.2, 640.0, 9.0]) {
            approx::assert_relative_eq!(*found, expected, max_relative = 1e-6);
        }

        let height = summarise(&fitted, &spectrum, SummaryStatistic::AmplitudeSum).unwrap();
        approx::assert_relative_eq!(height.value, 1.2, max_relative = 1e-6);
        let centre = summarise(&fitted, &spectrum, SummaryStatistic::PeakCentre).unwrap();
        approx::assert_relative_eq!(centre.value, 640.0, max_relative = 1e-9);
        // The whole line, a·c·√(2π), lies inside 600..680
        let area = summarise(&fitted, &spectrum, SummaryStatistic::WindowIntegral).unwrap();
        approx::assert_relative_eq!(
            area.value,
            1.2 * 9.0 * (2.0 * std::f64::consts::PI).sqrt(),
            max_relative = 1e-4
        );
    }

    #[test]
    fn trapezoid_area_variance_follows_the_weights() {
        let spectrum = Spectrum::new(vec![0.0, 1.0, 3.0], vec![1.0, 2.0, 0.0]).unwrap();
        let area = spectrum.area(0.1).unwrap();
        approx::assert_relative_eq!(area.value, 3.5);
        // Weights 0.5, 1.5, 1.0
        approx::assert_relative_eq!(area.variance, 0.01 * 3.5, max_relative = 1e-12);
        assert!(spectrum.area(-0.1).is_err());
        assert_eq!(spectrum.area(0.0).unwrap().variance, 0.0);
    }

    #[test]
    fn peak_centre_follows_the_tallest_line() {
        let model = ParametricModel::LorentzianSum { peaks: 2 };
        let mut covariance = Array2::eye(6) * 1e-4;
        covariance[[4, 4]] = 0.09;
        // The second line is narrower and therefore taller
        let fitted = FittedModel::from_parts(
            model,
            arr1(&[3.0, 630.0, 40.0, 1.5, 655.0, 4.0]),
            covariance,
            Quality::default(),
        )
        .unwrap();
        let (x, y) = two_peaks();
        let spectrum = Spectrum::new(x, y).unwrap();
        let centre = summarise(&fitted, &spectrum, SummaryStatistic::PeakCentre).unwrap();
        approx::assert_relative_eq!(centre.value, 655.0);
        approx::assert_relative_eq!(centre.variance, 0.09, max_relative = 1e-12);
        assert!(summarise(&fitted, &spectrum, SummaryStatistic::Trapezoid).is_err());
    }

    #[test]
    fn amplitude_sum_variance_is_the_sum_of_intensity_covariances() {
        let model = ParametricModel::LorentzianSum { peaks: 2 };
        let mut covariance = Array2::zeros((6, 6));
        covariance[[0, 0]] = 0.04;
        covariance[[3, 3]] = 0.01;
        covariance[[0, 3]] = 0.005;
        covariance[[3, 0]] = 0.005;
        let fitted = FittedModel::from_parts(
            model,
            arr1(&[3.0, 630.0, 12.0, 1.5, 655.0, 8.0]),
            covariance,
            Quality::default(),
        )
        .unwrap();
        let (x, y) = two_peaks();
        let spectrum = Spectrum::new(x, y).unwrap();

        let summary = summarise(&fitted, &spectrum, SummaryStatistic::AmplitudeSum).unwrap();
        approx::assert_relative_eq!(summary.value, 4.5);
        approx::assert_relative_eq!(
            summary.variance,
            0.04 + 0.01 + 2.0 * 0.005,
            max_relative = 1e-12
        );
    }

    #[test]
    fn window_integral_approaches_amplitude_sum_for_wide_windows() {
        let model = ParametricModel::LorentzianSum { peaks: 1 };
        let fitted = FittedModel::from_parts(
            model,
            arr1(&[2.0, 0.0, 1.0]),
            Array2::eye(3) * 1e-4,
            Quality::default(),
        )
        .unwrap();
        let spectrum = Spectrum::new(vec![-1e4, 0.0, 1e4], vec![0.0, 0.0, 0.0]).unwrap();
        let summary = summarise(&fitted, &spectrum, SummaryStatistic::WindowIntegral).unwrap();
        approx::assert_relative_eq!(summary.value, 2.0, max_relative = 1e-4);
        assert!(summary.variance > 0.0);
    }

    #[test]
    fn summaries_need_a_peak_model() {
        let fitted = FittedModel::from_parts(
            ParametricModel::Linear,
            arr1(&[1.0, 0.0]),
            Array2::eye(2),
            Quality::default(),
        )
        .unwrap();
        let spectrum = Spectrum::new(vec![0.0, 1.0], vec![0.0, 1.0]).unwrap();
        assert!(summarise(&fitted, &spectrum, SummaryStatistic::CurveSum).is_err());
    }
}
