use ndarray::{Array1, Array2, ArrayView1, Axis};
use ndarray_linalg::{Eigh, UPLO};
use ndarray_rand::rand::{Rng, SeedableRng};
use ndarray_rand::rand_distr::StandardNormal;
use ndarray_rand::RandomExt;
use rand_isaac::Isaac64Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Error;
use crate::Result;

/// Step of the central finite-difference derivatives
pub const FINITE_DIFFERENCE_STEP: f64 = 1e-6;

/// Eigenvalues above `-PSD_TOLERANCE · max|λ|` count as zero
pub const PSD_TOLERANCE: f64 = 1e-8;

/// Seed of the Monte-Carlo generator, fixed so repeated estimates agree
const SAMPLING_SEED: u64 = 40;

/// Where the partial derivatives of a function come from
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GradientSource {
    /// Closed-form partials from the model
    #[default]
    Analytic,
    /// Central differences with [`FINITE_DIFFERENCE_STEP`]
    Numeric,
}

/// How the variance of a derived quantity is estimated
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// First-order propagation `∇ᵗ Cov ∇ + Σ (∂f/∂xᵢ)² σᵢ²`
    #[default]
    Linearised,
    /// Draw `n` samples of the inputs and take the sample variance of the outputs
    Sampled(usize),
}

/// An independent scalar input of a propagated function
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ExtraInput {
    pub value: f64,
    pub variance: f64,
    /// `∂f/∂input` at the central value
    pub partial: f64,
}

/// Outcome of linear propagation
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Propagated {
    Variance(f64),
    /// The parameter covariance has a clearly negative eigenvalue
    IllConditioned { min_eigenvalue: f64 },
}

impl Propagated {
    /// The variance, or `NaN` if the covariance was not positive-semidefinite
    pub const fn variance(&self) -> f64 {
        match self {
            Self::Variance(variance) => *variance,
            Self::IllConditioned { .. } => f64::NAN,
        }
    }
}

/// Central finite-difference gradient of `f` at `theta`
pub fn numeric_gradient(
    f: impl Fn(ArrayView1<f64>) -> f64,
    theta: ArrayView1<f64>,
) -> Array1<f64> {
    let mut shifted = theta.to_owned();
    let mut gradient = Array1::zeros(theta.len());
    for jj in 0..theta.len() {
        let centre = theta[jj];
        shifted[jj] = centre + FINITE_DIFFERENCE_STEP;
        let above = f(shifted.view());
        shifted[jj] = centre - FINITE_DIFFERENCE_STEP;
        let below = f(shifted.view());
        shifted[jj] = centre;
        gradient[jj] = (above - below) / (2.0 * FINITE_DIFFERENCE_STEP);
    }
    gradient
}

/// Central finite-difference derivative of a scalar function
pub fn numeric_derivative(f: impl Fn(f64) -> f64, x: f64) -> f64 {
    let step = FINITE_DIFFERENCE_STEP;
    (f(x + step) - f(x - step)) / (2.0 * step)
}

/// Smallest eigenvalue of `covariance` if it is clearly negative
///
/// A covariance with non-finite entries reports `NaN`.
///
/// # Errors
/// Returns an error if the eigenvalue decomposition fails.
pub(crate) fn negative_eigenvalue(covariance: &Array2<f64>) -> Result<Option<f64>> {
    if covariance.is_empty() {
        return Ok(None);
    }
    if !covariance.iter().all(|v| v.is_finite()) {
        return Ok(Some(f64::NAN));
    }
    let (eigenvalues, _) = covariance.eigh(UPLO::Lower)?;
    let largest = eigenvalues.iter().fold(0.0f64, |acc, v| acc.max(v.abs()));
    let smallest = eigenvalues.iter().copied().fold(f64::INFINITY, f64::min);
    Ok((smallest < -PSD_TOLERANCE * largest).then_some(smallest))
}

/// Shapes must agree and every number that enters the propagation must be finite
fn check_inputs(
    vector: ArrayView1<f64>,
    covariance: &Array2<f64>,
    extras: &[ExtraInput],
) -> Result<()> {
    if covariance.dim() != (vector.len(), vector.len()) {
        return Err(Error::InvalidInput(format!(
            "vector of length {} does not match covariance of shape {:?}",
            vector.len(),
            covariance.dim()
        )));
    }
    if !vector.iter().all(|v| v.is_finite()) {
        return Err(Error::InvalidInput(format!(
            "propagated vector must be finite, got {vector}"
        )));
    }
    for extra in extras {
        if !(extra.variance.is_finite() && extra.variance >= 0.0) {
            return Err(Error::InvalidInput(format!(
                "input variance {} must be finite and non-negative",
                extra.variance
            )));
        }
        if !(extra.value.is_finite() && extra.partial.is_finite()) {
            return Err(Error::InvalidInput(format!(
                "input {} with partial {} is not finite",
                extra.value, extra.partial
            )));
        }
    }
    Ok(())
}

/// First-order variance of `f(θ, inputs)`
///
/// Quadratic forms that come out slightly negative through rounding are clamped to zero once
/// the covariance has passed the semidefiniteness check.
///
/// # Errors
/// Returns [`Error::InvalidInput`] if the shapes disagree, the gradient or a partial is not
/// finite, an input variance is negative, or the result overflows. Fails as well if the
/// eigenvalue decomposition does.
pub fn propagate(
    gradient: ArrayView1<f64>,
    covariance: &Array2<f64>,
    extras: &[ExtraInput],
) -> Result<Propagated> {
    check_inputs(gradient, covariance, extras)?;
    if let Some(min_eigenvalue) = negative_eigenvalue(covariance)? {
        warn!(min_eigenvalue, "parameter covariance is not positive-semidefinite");
        return Ok(Propagated::IllConditioned { min_eigenvalue });
    }
    let quadratic = gradient.dot(&covariance.dot(&gradient));
    let independent: f64 = extras.iter().map(|e| e.partial * e.partial * e.variance).sum();
    let variance = if quadratic < 0.0 { 0.0 } else { quadratic } + independent;
    if !variance.is_finite() {
        return Err(Error::InvalidInput(format!(
            "propagated variance is not finite for gradient {gradient}"
        )));
    }
    Ok(Propagated::Variance(variance))
}

/// Sample mean and variance of a Monte-Carlo propagation
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Sampled {
    pub mean: f64,
    pub variance: f64,
    /// Draws for which `f` was not finite and which were left out
    pub rejected: usize,
}

/// Monte-Carlo variance of `f(θ, inputs)`
///
/// Parameters are drawn from `N(θ, Cov)` through the eigen square root of the covariance, the
/// extra inputs from independent normals around their values. Draws where `f` is not finite
/// are skipped.
///
/// # Errors
/// - [`Error::InvalidInput`] on mismatched shapes or non-finite inputs
/// - [`Error::IllConditionedCovariance`] if the covariance is not positive-semidefinite
/// - [`Error::InsufficientData`] if fewer than two draws give a finite value
pub fn sample(
    f: impl Fn(ArrayView1<f64>, &[f64]) -> f64,
    theta: ArrayView1<f64>,
    covariance: &Array2<f64>,
    extras: &[ExtraInput],
    samples: usize,
) -> Result<Sampled> {
    check_inputs(theta, covariance, extras)?;
    if let Some(min_eigenvalue) = negative_eigenvalue(covariance)? {
        return Err(Error::IllConditionedCovariance {
            detail: format!("cannot sample a covariance with eigenvalue {min_eigenvalue:e}"),
        });
    }

    let (eigenvalues, eigenvectors) = covariance.eigh(UPLO::Lower)?;
    let root = &eigenvectors * &eigenvalues.mapv(|v| v.max(0.0).sqrt()).insert_axis(Axis(0));

    let mut rng = Isaac64Rng::seed_from_u64(SAMPLING_SEED);
    let draws = Array2::<f64>::random_using((samples, theta.len()), StandardNormal, &mut rng);
    let parameters = draws.dot(&root.t()) + &theta;

    let mut values = Vec::with_capacity(samples);
    let mut inputs = vec![0.0; extras.len()];
    for row in parameters.rows() {
        for (input, extra) in inputs.iter_mut().zip(extras) {
            let z: f64 = rng.sample(StandardNormal);
            *input = z.mul_add(extra.variance.sqrt(), extra.value);
        }
        let value = f(row, &inputs);
        if value.is_finite() {
            values.push(value);
        }
    }

    let rejected = samples - values.len();
    if rejected > 0 {
        warn!(rejected, samples, "skipped draws with a non-finite result");
    }
    if values.len() < 2 {
        return Err(Error::InsufficientData {
            points: values.len(),
            parameters: 2,
        });
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    Ok(Sampled {
        mean,
        variance,
        rejected,
    })
}
