//! The closed set of response models used for dosimeter calibration.
//!
//! Every model is a pure function of `(predictor, θ)`. The parameter vector is always a flat
//! `ndarray` of [`ParametricModel::parameter_count`] elements, in the order listed on each
//! variant; [`ParametricModel::unpack`] gives a named view of it.

use std::f64::consts::PI;
use std::fmt;

use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};

use crate::calibration::CalibrationSet;
use crate::error::Error;
use crate::math::{extent, median, polynomial_least_squares};
use crate::spectrum::{detect_peaks, PeakDetection};
use crate::Result;

/// Parameters with magnitude below this are treated as zero when they have to be divided by.
pub const DEGENERACY_EPSILON: f64 = 1e-12;

/// Lorentzian and Gaussian widths are kept at or above this value during fitting.
pub const MIN_WIDTH: f64 = 1e-6;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParametricModel {
    /// `response = m·x + b`, parameters `[m, b]`
    Linear,
    /// `response = a·x² + b·x + c`, parameters `[a, b, c]`
    Quadratic,
    /// `response = a·exp(b·x) + c`, parameters `[a, b, c]`
    Exponential,
    /// `dose = a + b / (pixel - c)`, parameters `[a, b, c]`
    ///
    /// This model is fitted in the inverse-friendly direction: the predictor is the pixel value
    /// and the response is the dose, so "inversion" is plain evaluation.
    PixelLogistic,
    /// `response = Σ (2·Iᵢ/π)·wᵢ / (4·(x − cᵢ)² + wᵢ²)`, parameters `[I₁, c₁, w₁, I₂, …]`
    LorentzianSum { peaks: usize },
    /// `response = a·exp(−(x − b)² / (2c²))`, parameters `[a, b, c]` with `c > 0`
    Gaussian,
    /// `response = a·ln(x + b) + c`, parameters `[a, b, c]`
    Logarithmic,
}

/// Conversion from a Gaussian standard deviation to its full width at half maximum
const FWHM_PER_SIGMA: f64 = 2.354_820_045_030_949;

/// A single Lorentzian line
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Peak {
    /// Integrated intensity
    pub intensity: f64,
    pub centre: f64,
    /// Full width at half maximum
    pub width: f64,
}

impl Peak {
    pub fn evaluate(&self, x: f64) -> f64 {
        let d = x - self.centre;
        2.0 * self.intensity / PI * self.width / 4.0f64.mul_add(d * d, self.width * self.width)
    }

    /// Closed-form integral of the line over `[lo, hi]`
    pub fn integral(&self, lo: f64, hi: f64) -> f64 {
        let antiderivative = |x: f64| (2.0 * (x - self.centre) / self.width).atan();
        self.intensity / PI * (antiderivative(hi) - antiderivative(lo))
    }
}

/// Named view of a parameter vector
#[derive(Clone, Debug, PartialEq)]
pub enum Parameters {
    Linear { slope: f64, intercept: f64 },
    Quadratic { a: f64, b: f64, c: f64 },
    Exponential { amplitude: f64, rate: f64, offset: f64 },
    PixelLogistic { offset: f64, scale: f64, asymptote: f64 },
    LorentzianSum(Vec<Peak>),
    Gaussian { height: f64, centre: f64, width: f64 },
    Logarithmic { scale: f64, shift: f64, offset: f64 },
}

/// Box constraints on the parameter vector
#[derive(Clone, Debug, PartialEq)]
pub struct Bounds {
    pub lower: Array1<f64>,
    pub upper: Array1<f64>,
}

impl Bounds {
    pub fn unbounded(n: usize) -> Self {
        Self {
            lower: Array1::from_elem(n, f64::NEG_INFINITY),
            upper: Array1::from_elem(n, f64::INFINITY),
        }
    }

    /// Clamp `theta` into the box in place
    pub fn project(&self, theta: &mut Array1<f64>) {
        for ((value, &lo), &hi) in theta.iter_mut().zip(&self.lower).zip(&self.upper) {
            *value = value.clamp(lo, hi);
        }
    }

    pub fn contains(&self, theta: ArrayView1<f64>) -> bool {
        theta
            .iter()
            .zip(&self.lower)
            .zip(&self.upper)
            .all(|((value, lo), hi)| lo <= value && value <= hi)
    }
}

/// Partial derivatives of an inverse `x = f⁻¹(y, θ)`
#[derive(Clone, Debug, PartialEq)]
pub struct InverseGradient {
    /// `∂x/∂θ`
    pub parameters: Array1<f64>,
    /// `∂x/∂y`
    pub response: f64,
}

impl fmt::Display for ParametricModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Linear => write!(f, "linear"),
            Self::Quadratic => write!(f, "quadratic"),
            Self::Exponential => write!(f, "exponential"),
            Self::PixelLogistic => write!(f, "pixel_logistic"),
            Self::LorentzianSum { peaks } => write!(f, "lorentzian_sum({peaks})"),
            Self::Gaussian => write!(f, "gaussian"),
            Self::Logarithmic => write!(f, "logarithmic"),
        }
    }
}

impl ParametricModel {
    pub const fn parameter_count(&self) -> usize {
        match self {
            Self::Linear => 2,
            Self::Quadratic
            | Self::Exponential
            | Self::PixelLogistic
            | Self::Gaussian
            | Self::Logarithmic => 3,
            Self::LorentzianSum { peaks } => 3 * *peaks,
        }
    }

    /// # Errors
    /// Returns [`Error::InvalidInput`] for a Lorentzian sum without any peaks.
    pub fn validate(&self) -> Result<()> {
        if let Self::LorentzianSum { peaks: 0 } = self {
            return Err(Error::InvalidInput(
                "a Lorentzian sum needs at least one peak".into(),
            ));
        }
        Ok(())
    }

    /// Names used for the parameters in calibration parameter files
    pub fn parameter_names(&self) -> Vec<String> {
        match self {
            Self::Linear => vec!["m".into(), "b".into()],
            Self::Quadratic
            | Self::Exponential
            | Self::PixelLogistic
            | Self::Gaussian
            | Self::Logarithmic => vec!["a".into(), "b".into(), "c".into()],
            Self::LorentzianSum { peaks } => (1..=*peaks)
                .flat_map(|ii| [format!("I{ii}"), format!("c{ii}"), format!("w{ii}")])
                .collect(),
        }
    }

    /// Whether [`Self::invert`] has a closed form for this model
    pub const fn has_inverse(&self) -> bool {
        !matches!(self, Self::LorentzianSum { .. } | Self::Gaussian)
    }

    /// Named view of `theta`
    ///
    /// # Errors
    /// Returns an error if `theta` does not have [`Self::parameter_count`] elements.
    pub fn unpack(&self, theta: ArrayView1<f64>) -> Result<Parameters> {
        if theta.len() != self.parameter_count() {
            return Err(Error::InvalidInput(format!(
                "model {self} takes {} parameters, got {}",
                self.parameter_count(),
                theta.len()
            )));
        }
        Ok(self.unpack_unchecked(theta))
    }

    fn unpack_unchecked(&self, theta: ArrayView1<f64>) -> Parameters {
        match self {
            Self::Linear => Parameters::Linear {
                slope: theta[0],
                intercept: theta[1],
            },
            Self::Quadratic => Parameters::Quadratic {
                a: theta[0],
                b: theta[1],
                c: theta[2],
            },
            Self::Exponential => Parameters::Exponential {
                amplitude: theta[0],
                rate: theta[1],
                offset: theta[2],
            },
            Self::PixelLogistic => Parameters::PixelLogistic {
                offset: theta[0],
                scale: theta[1],
                asymptote: theta[2],
            },
            Self::LorentzianSum { .. } => Parameters::LorentzianSum(
                theta
                    .exact_chunks(3)
                    .into_iter()
                    .map(|p| Peak {
                        intensity: p[0],
                        centre: p[1],
                        width: p[2],
                    })
                    .collect(),
            ),
            Self::Gaussian => Parameters::Gaussian {
                height: theta[0],
                centre: theta[1],
                width: theta[2],
            },
            Self::Logarithmic => Parameters::Logarithmic {
                scale: theta[0],
                shift: theta[1],
                offset: theta[2],
            },
        }
    }

    /// Forward model `f(x, θ)`
    ///
    /// # Panics
    /// Panics if `theta` is shorter than [`Self::parameter_count`]. Callers validate lengths when
    /// a [`FittedModel`](crate::fit::FittedModel) is built.
    pub fn evaluate(&self, x: f64, theta: ArrayView1<f64>) -> f64 {
        match self {
            Self::Linear => theta[0].mul_add(x, theta[1]),
            Self::Quadratic => theta[0].mul_add(x, theta[1]).mul_add(x, theta[2]),
            Self::Exponential => theta[0].mul_add((theta[1] * x).exp(), theta[2]),
            Self::PixelLogistic => theta[0] + theta[1] / (x - theta[2]),
            Self::LorentzianSum { .. } => theta
                .exact_chunks(3)
                .into_iter()
                .map(|p| {
                    Peak {
                        intensity: p[0],
                        centre: p[1],
                        width: p[2],
                    }
                    .evaluate(x)
                })
                .sum(),
            Self::Gaussian => {
                let d = x - theta[1];
                theta[0] * (-d * d / (2.0 * theta[2] * theta[2])).exp()
            }
            Self::Logarithmic => theta[0].mul_add((x + theta[1]).ln(), theta[2]),
        }
    }

    /// Analytic `∂f/∂θ` at `x`
    ///
    /// # Panics
    /// As [`Self::evaluate`].
    pub fn gradient(&self, x: f64, theta: ArrayView1<f64>) -> Array1<f64> {
        match self {
            Self::Linear => Array1::from(vec![x, 1.0]),
            Self::Quadratic => Array1::from(vec![x * x, x, 1.0]),
            Self::Exponential => {
                let e = (theta[1] * x).exp();
                Array1::from(vec![e, theta[0] * x * e, 1.0])
            }
            Self::PixelLogistic => {
                let inv = 1.0 / (x - theta[2]);
                Array1::from(vec![1.0, inv, theta[1] * inv * inv])
            }
            Self::LorentzianSum { .. } => {
                let mut gradient = Array1::zeros(theta.len());
                for (peak, mut out) in theta
                    .exact_chunks(3)
                    .into_iter()
                    .zip(gradient.exact_chunks_mut(3))
                {
                    let (intensity, centre, width) = (peak[0], peak[1], peak[2]);
                    let d = x - centre;
                    let denominator = 4.0f64.mul_add(d * d, width * width);
                    let k = 2.0 / PI;
                    out[0] = k * width / denominator;
                    out[1] = k * intensity * width * 8.0 * d / (denominator * denominator);
                    out[2] = k * intensity * 4.0f64.mul_add(d * d, -width * width)
                        / (denominator * denominator);
                }
                gradient
            }
            Self::Gaussian => {
                let (height, centre, width) = (theta[0], theta[1], theta[2]);
                let d = x - centre;
                let e = (-d * d / (2.0 * width * width)).exp();
                Array1::from(vec![
                    e,
                    height * e * d / (width * width),
                    height * e * d * d / (width * width * width),
                ])
            }
            Self::Logarithmic => {
                let shifted = x + theta[1];
                Array1::from(vec![shifted.ln(), theta[0] / shifted, 1.0])
            }
        }
    }

    /// Physically meaningful parameter region
    pub fn bounds(&self) -> Bounds {
        let mut bounds = Bounds::unbounded(self.parameter_count());
        if let Self::LorentzianSum { .. } | Self::Gaussian = self {
            for width in bounds.lower.iter_mut().skip(2).step_by(3) {
                *width = MIN_WIDTH;
            }
        }
        bounds
    }

    /// Data-driven starting point for the solver
    ///
    /// - `Linear`, `Quadratic`: exact SVD least squares, so the solver only polishes.
    /// - `Exponential`: the offset is placed 5 % of the response range beyond the data, which
    ///   makes `ln|y − c|` linear in `x`; both the rising (`a > 0`) and falling (`a < 0`)
    ///   branches are tried and the one with the smaller residual wins.
    /// - `PixelLogistic`: `[median(dose), dose range / pixel range, min(pixel) − 1]`, which puts
    ///   the asymptote just below the darkest calibration pixel.
    /// - `LorentzianSum`: detected local maxima first, then evenly spaced filler peaks; widths
    ///   start at a quarter of the window divided by the number of peaks.
    /// - `Gaussian`: the tallest sample gives height and centre; the width comes from the
    ///   spread of the samples above half maximum.
    /// - `Logarithmic`: the shift puts every predictor at or above one, then `a` and `c` come
    ///   from a straight-line fit of `y` against `ln(x + b)`.
    ///
    /// # Errors
    /// Returns an error if the calibration set is empty, the model is malformed or the
    /// least-squares seed fails.
    pub fn initial_guess(&self, set: &CalibrationSet) -> Result<Array1<f64>> {
        self.validate()?;
        let x = set.predictors();
        let y = set.responses();
        if x.is_empty() {
            return Err(Error::InsufficientData {
                points: 0,
                parameters: self.parameter_count(),
            });
        }
        match self {
            Self::Linear => {
                let c = polynomial_least_squares(&x, &y, 1)?;
                Ok(Array1::from(vec![c[1], c[0]]))
            }
            Self::Quadratic => {
                let c = polynomial_least_squares(&x, &y, 2)?;
                Ok(Array1::from(vec![c[2], c[1], c[0]]))
            }
            Self::Exponential => exponential_seed(&x, &y),
            Self::PixelLogistic => {
                let (dose_lo, dose_hi) = extent(y.iter().copied()).unwrap_or((0.0, 0.0));
                let (pixel_lo, pixel_hi) = extent(x.iter().copied()).unwrap_or((0.0, 0.0));
                let pixel_range = pixel_hi - pixel_lo;
                let scale = if pixel_range > 0.0 {
                    (dose_hi - dose_lo) / pixel_range
                } else {
                    1.0
                };
                Ok(Array1::from(vec![median(&y), scale, pixel_lo - 1.0]))
            }
            Self::LorentzianSum { peaks } => Ok(lorentzian_seed(
                &x,
                &y,
                *peaks,
                &PeakDetection::default(),
            )),
            Self::Gaussian => Ok(gaussian_seed(&x, &y)),
            Self::Logarithmic => {
                let (x_lo, _) = extent(x.iter().copied()).unwrap_or((0.0, 0.0));
                let shift = 1.0 - x_lo.min(0.0);
                let logs = x.iter().map(|xi| (xi + shift).ln()).collect::<Vec<_>>();
                let line = polynomial_least_squares(&logs, &y, 1)?;
                Ok(Array1::from(vec![line[1], shift, line[0]]))
            }
        }
    }

    /// Closed-form inverse `x = f⁻¹(y, θ)`
    ///
    /// For [`Self::PixelLogistic`] the model already maps pixel to dose, so this evaluates it,
    /// refusing pixels on the asymptote.
    ///
    /// # Errors
    /// - [`Error::DegenerateModel`] if a parameter that is divided by vanishes
    /// - [`Error::InvalidInverseDomain`] if `y` is outside the invertible range
    /// - [`Error::NoClosedFormInverse`] for the peak models
    pub fn invert(&self, response: f64, theta: ArrayView1<f64>) -> Result<f64> {
        match self.unpack(theta)? {
            Parameters::Linear { slope, intercept } => {
                nonzero("m", slope)?;
                Ok((response - intercept) / slope)
            }
            Parameters::Quadratic { a, b, c } => quadratic_root(response, a, b, c),
            Parameters::Exponential {
                amplitude,
                rate,
                offset,
            } => {
                nonzero("a", amplitude)?;
                let argument = (response - offset) / amplitude;
                if !(argument > 0.0) {
                    return Err(Error::InvalidInverseDomain {
                        response,
                        detail: "(response - c) / a must be positive",
                    });
                }
                nonzero("b", rate)?;
                Ok(argument.ln() / rate)
            }
            Parameters::PixelLogistic {
                offset,
                scale,
                asymptote,
            } => {
                off_asymptote(response, asymptote)?;
                Ok(offset + scale / (response - asymptote))
            }
            Parameters::Logarithmic {
                scale,
                shift,
                offset,
            } => Ok(log_argument(response, scale, offset)? - shift),
            Parameters::LorentzianSum(_) | Parameters::Gaussian { .. } => {
                Err(Error::NoClosedFormInverse {
                    model: self.to_string(),
                })
            }
        }
    }

    /// Analytic partials of [`Self::invert`] with respect to `θ` and the response
    ///
    /// # Errors
    /// As [`Self::invert`]; additionally [`Error::DegenerateModel`] at the vertex of a quadratic.
    pub fn inverse_gradient(
        &self,
        response: f64,
        theta: ArrayView1<f64>,
    ) -> Result<InverseGradient> {
        let x = self.invert(response, theta)?;
        let gradient = match self.unpack_unchecked(theta) {
            Parameters::Linear { slope, intercept } => InverseGradient {
                parameters: Array1::from(vec![
                    -(response - intercept) / (slope * slope),
                    -1.0 / slope,
                ]),
                response: 1.0 / slope,
            },
            Parameters::Quadratic { a, b, .. } => {
                // Implicit differentiation of F = a·x² + b·x + c − y = 0
                let slope = 2.0f64.mul_add(a * x, b);
                nonzero("2ax + b", slope)?;
                InverseGradient {
                    parameters: Array1::from(vec![-x * x / slope, -x / slope, -1.0 / slope]),
                    response: 1.0 / slope,
                }
            }
            Parameters::Exponential {
                amplitude,
                rate,
                offset,
            } => {
                let shifted = response - offset;
                InverseGradient {
                    parameters: Array1::from(vec![
                        -1.0 / (amplitude * rate),
                        -(shifted / amplitude).ln() / (rate * rate),
                        -1.0 / (rate * shifted),
                    ]),
                    response: 1.0 / (rate * shifted),
                }
            }
            Parameters::PixelLogistic {
                scale, asymptote, ..
            } => {
                let inv = 1.0 / (response - asymptote);
                InverseGradient {
                    parameters: Array1::from(vec![1.0, inv, scale * inv * inv]),
                    response: -scale * inv * inv,
                }
            }
            Parameters::Logarithmic { scale, offset, .. } => {
                let e = log_argument(response, scale, offset)?;
                InverseGradient {
                    parameters: Array1::from(vec![
                        -e * (response - offset) / (scale * scale),
                        -1.0,
                        -e / scale,
                    ]),
                    response: e / scale,
                }
            }
            Parameters::LorentzianSum(_) | Parameters::Gaussian { .. } => {
                return Err(Error::NoClosedFormInverse {
                    model: self.to_string(),
                })
            }
        };
        Ok(gradient)
    }
}

fn nonzero(parameter: &'static str, value: f64) -> Result<()> {
    if value.abs() < DEGENERACY_EPSILON {
        return Err(Error::DegenerateModel { parameter, value });
    }
    Ok(())
}

/// `exp((y − c) / a)`, which is `x + b` on the logarithmic curve
fn log_argument(response: f64, scale: f64, offset: f64) -> Result<f64> {
    nonzero("a", scale)?;
    let argument = ((response - offset) / scale).exp();
    if !(argument.is_finite() && argument > 0.0) {
        return Err(Error::InvalidInverseDomain {
            response,
            detail: "exp((response - c) / a) is not a finite positive number",
        });
    }
    Ok(argument)
}

fn off_asymptote(pixel: f64, asymptote: f64) -> Result<()> {
    if (pixel - asymptote).abs() < DEGENERACY_EPSILON {
        return Err(Error::InvalidInverseDomain {
            response: pixel,
            detail: "pixel value lies on the asymptote c",
        });
    }
    Ok(())
}

/// Smallest non-negative root of `a·x² + b·x + c = y`
fn quadratic_root(response: f64, a: f64, b: f64, c: f64) -> Result<f64> {
    let constant = c - response;
    if a.abs() < DEGENERACY_EPSILON {
        nonzero("b", b)?;
        return Ok(-constant / b);
    }
    let discriminant = b.mul_add(b, -4.0 * a * constant);
    if discriminant < 0.0 {
        return Err(Error::InvalidInverseDomain {
            response,
            detail: "quadratic has no real root",
        });
    }
    // Citardauq form avoids cancellation between -b and the root of the discriminant
    let q = -0.5 * b.signum().mul_add(discriminant.sqrt(), b);
    let roots = if q == 0.0 {
        [0.0, 0.0]
    } else {
        [q / a, constant / q]
    };
    roots
        .into_iter()
        .filter(|root| root.is_finite() && *root >= 0.0)
        .min_by(f64::total_cmp)
        .ok_or(Error::InvalidInverseDomain {
            response,
            detail: "quadratic has no non-negative root",
        })
}

fn exponential_seed(x: &[f64], y: &[f64]) -> Result<Array1<f64>> {
    let (lo, hi) = extent(y.iter().copied()).unwrap_or((0.0, 0.0));
    let margin = 0.05 * (hi - lo).max(f64::EPSILON);

    let mut best: Option<(f64, Array1<f64>)> = None;
    for (offset, sign) in [(lo - margin, 1.0), (hi + margin, -1.0)] {
        let log_shifted = y
            .iter()
            .map(|&yi| (sign * (yi - offset)).ln())
            .collect::<Vec<_>>();
        let line = polynomial_least_squares(x, &log_shifted, 1)?;
        let theta = Array1::from(vec![sign * line[0].exp(), line[1], offset]);
        if !theta.iter().all(|v| v.is_finite()) {
            continue;
        }
        let sse: f64 = x
            .iter()
            .zip(y)
            .map(|(&xi, &yi)| {
                (yi - ParametricModel::Exponential.evaluate(xi, theta.view())).powi(2)
            })
            .sum();
        if best.as_ref().map_or(true, |(best_sse, _)| sse < *best_sse) {
            best = Some((sse, theta));
        }
    }

    Ok(best.map_or_else(|| Array1::from(vec![hi - lo, 0.1, lo]), |(_, theta)| theta))
}

/// Height, centre and width of the tallest sample's line
fn gaussian_seed(x: &[f64], y: &[f64]) -> Array1<f64> {
    let (x_lo, x_hi) = extent(x.iter().copied()).unwrap_or((0.0, 1.0));
    let Some((top, &height)) = y.iter().enumerate().max_by(|a, b| a.1.total_cmp(b.1)) else {
        return Array1::from(vec![1.0, 0.5 * (x_lo + x_hi), (x_hi - x_lo) / 4.0]);
    };
    let fwhm = extent(
        x.iter()
            .zip(y)
            .filter(|(_, yi)| **yi >= 0.5 * height)
            .map(|(&xi, _)| xi),
    )
    .map_or(0.0, |(lo, hi)| hi - lo);
    let width = if fwhm > 0.0 {
        fwhm / FWHM_PER_SIGMA
    } else {
        (x_hi - x_lo) / 4.0
    };
    Array1::from(vec![height, x[top], width.max(MIN_WIDTH)])
}

/// Starting parameters for `peaks` Lorentzians over the samples `(x, y)`
pub fn lorentzian_seed(
    x: &[f64],
    y: &[f64],
    peaks: usize,
    detection: &PeakDetection,
) -> Array1<f64> {
    let (x_lo, x_hi) = extent(x.iter().copied()).unwrap_or((0.0, 1.0));
    let (_, y_hi) = extent(y.iter().copied()).unwrap_or((0.0, 1.0));
    let n = peaks.max(1) as f64;
    let width = ((x_hi - x_lo) / (4.0 * n)).max(MIN_WIDTH);
    let height_to_intensity = PI * width / 2.0;

    let mut seeds = detect_peaks(y, detection)
        .into_iter()
        .take(peaks)
        .map(|idx| (x[idx], y[idx] * height_to_intensity))
        .collect::<Vec<_>>();

    let missing = peaks - seeds.len();
    let spacing = (x_hi - x_lo) / (missing as f64 + 1.0);
    for kk in 1..=missing {
        seeds.push((
            (kk as f64).mul_add(spacing, x_lo),
            y_hi / n * height_to_intensity,
        ));
    }
    seeds.sort_by(|a, b| a.0.total_cmp(&b.0));

    seeds
        .into_iter()
        .flat_map(|(centre, intensity)| [intensity, centre, width])
        .collect()
}
