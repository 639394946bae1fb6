//! Nonlinear least-squares calibration fits.
//!
//! The calibration problem is expressed through argmin's [`Operator`] (weighted residuals) and
//! [`Jacobian`] traits. Two solvers consume it:
//!
//! - an in-crate Levenberg–Marquardt driver with box projection, used by default
//! - argmin's [`GaussNewtonLS`] with a More–Thuente line search
//!
//! Either solver is run once per tier of an escalating iteration schedule. Each tier restarts
//! from the same initial guess; the first tier to converge wins.

use argmin::core::{Executor, Jacobian, Operator, State, TerminationReason};
use argmin::solver::gaussnewton::GaussNewtonLS;
use argmin::solver::linesearch::MoreThuenteLineSearch;
use ndarray::{Array1, Array2, ArrayView1};
use ndarray_linalg::{Inverse, Solve};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::calibration::CalibrationSet;
use crate::error::Error;
use crate::math::symmetrise;
use crate::model::{Bounds, ParametricModel};
use crate::propagate::negative_eigenvalue;
use crate::Result;

const INITIAL_DAMPING: f64 = 1e-3;
const MIN_DAMPING: f64 = 1e-12;
const MAX_DAMPING: f64 = 1e16;
/// Floor for the Marquardt scaling of parameters the data does not constrain
const MIN_DIAGONAL: f64 = 1e-12;

/// Relative asymmetry tolerated in externally supplied covariances
const SYMMETRY_TOLERANCE: f64 = 1e-9;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SolverKind {
    #[default]
    LevenbergMarquardt,
    /// argmin's Gauss–Newton with line search. Bounds are only applied to the final point.
    GaussNewton,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitOptions {
    /// Iteration budget of each successive attempt
    pub schedule: Vec<u64>,
    /// Relative tolerance on the cost reduction and on the step length
    pub tolerance: f64,
    /// Tolerance on the cosine between the residual vector and the Jacobian columns
    pub gradient_tolerance: f64,
    pub solver: SolverKind,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            schedule: vec![20_000, 50_000, 100_000],
            tolerance: f64::EPSILON.sqrt(),
            gradient_tolerance: 1e-10,
            solver: SolverKind::default(),
        }
    }
}

/// Goodness-of-fit figures stored alongside the parameters
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Quality {
    /// `1 − SS_res / SS_tot` on the unweighted residuals, zero when `SS_tot` is zero
    pub r_squared: f64,
    /// `sqrt(SS_res / dof)` on the unweighted residuals
    pub standard_error: f64,
    /// Reduced chi-square: weighted residual sum of squares over the degrees of freedom
    pub residual_variance: f64,
    pub degrees_of_freedom: usize,
}

impl Default for Quality {
    fn default() -> Self {
        Self {
            r_squared: f64::NAN,
            standard_error: f64::NAN,
            residual_variance: f64::NAN,
            degrees_of_freedom: 0,
        }
    }
}

/// The outcome of a successful calibration fit
///
/// Immutable once built: it is only produced by [`fit`], [`fit_with`] or the validating
/// [`FittedModel::from_parts`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FittedModel {
    quality: Quality,
    /// Whether the covariance was computed from absolute response uncertainties
    absolute_sigma: bool,
    iterations: u64,
    model: ParametricModel,
    parameters: Array1<f64>,
    covariance: Array2<f64>,
}

impl FittedModel {
    /// Assemble a model from externally supplied parameters, such as a parameter file
    ///
    /// # Errors
    /// - [`Error::InvalidInput`] if the shapes disagree with `model`, or a parameter is
    ///   non-finite or outside [`ParametricModel::bounds`]
    /// - [`Error::IllConditionedCovariance`] unless the covariance is finite, symmetric and
    ///   positive-semidefinite
    pub fn from_parts(
        model: ParametricModel,
        parameters: Array1<f64>,
        covariance: Array2<f64>,
        quality: Quality,
    ) -> Result<Self> {
        model.validate()?;
        let n = model.parameter_count();
        if parameters.len() != n || covariance.dim() != (n, n) {
            return Err(Error::InvalidInput(format!(
                "model {model} needs {n} parameters and a {n}x{n} covariance, got {} and {:?}",
                parameters.len(),
                covariance.dim()
            )));
        }
        if !parameters.iter().all(|v| v.is_finite()) {
            return Err(Error::InvalidInput(format!(
                "parameters must be finite, got {parameters}"
            )));
        }
        if !model.bounds().contains(parameters.view()) {
            return Err(Error::InvalidInput(format!(
                "parameters {parameters} lie outside the region allowed for model {model}"
            )));
        }
        validate_covariance(&covariance)?;
        Ok(Self {
            quality,
            absolute_sigma: true,
            iterations: 0,
            model,
            parameters,
            covariance,
        })
    }

    pub const fn model(&self) -> ParametricModel {
        self.model
    }

    pub fn parameters(&self) -> ArrayView1<f64> {
        self.parameters.view()
    }

    pub const fn covariance(&self) -> &Array2<f64> {
        &self.covariance
    }

    /// Square roots of the covariance diagonal
    pub fn standard_errors(&self) -> Array1<f64> {
        self.covariance.diag().mapv(f64::sqrt)
    }

    pub const fn quality(&self) -> &Quality {
        &self.quality
    }

    pub const fn residual_variance(&self) -> f64 {
        self.quality.residual_variance
    }

    pub const fn r_squared(&self) -> f64 {
        self.quality.r_squared
    }

    pub const fn absolute_sigma(&self) -> bool {
        self.absolute_sigma
    }

    /// Iterations used by the converged solver tier
    pub const fn iterations(&self) -> u64 {
        self.iterations
    }

    /// Evaluate the fitted curve at `x`
    pub fn evaluate(&self, x: f64) -> f64 {
        self.model.evaluate(x, self.parameters.view())
    }

    /// # Errors
    /// Returns an error if TOML serialisation fails.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string(self)?)
    }

    /// # Errors
    /// Returns an error if `text` is not a valid serialised model.
    pub fn from_toml(text: &str) -> Result<Self> {
        let raw: Self = toml::from_str(text)?;
        let mut model = Self::from_parts(raw.model, raw.parameters, raw.covariance, raw.quality)?;
        model.absolute_sigma = raw.absolute_sigma;
        model.iterations = raw.iterations;
        Ok(model)
    }
}

fn validate_covariance(covariance: &Array2<f64>) -> Result<()> {
    if !covariance.iter().all(|v| v.is_finite()) {
        return Err(Error::IllConditionedCovariance {
            detail: "covariance has non-finite entries".into(),
        });
    }
    if covariance.diag().iter().any(|&v| v < 0.0) {
        return Err(Error::IllConditionedCovariance {
            detail: format!("negative variance on the diagonal: {}", covariance.diag()),
        });
    }
    let scale = covariance.iter().fold(0.0f64, |acc, v| acc.max(v.abs()));
    let asymmetry = (covariance - &covariance.t())
        .iter()
        .fold(0.0f64, |acc, v| acc.max(v.abs()));
    if asymmetry > SYMMETRY_TOLERANCE * scale {
        return Err(Error::IllConditionedCovariance {
            detail: format!("covariance is not symmetric (max asymmetry {asymmetry:e})"),
        });
    }
    if let Some(min_eigenvalue) = negative_eigenvalue(covariance)? {
        return Err(Error::IllConditionedCovariance {
            detail: format!(
                "covariance is not positive-semidefinite (eigenvalue {min_eigenvalue:e})"
            ),
        });
    }
    Ok(())
}

#[cfg(test)]
impl FittedModel {
    /// Skips every check of [`Self::from_parts`], so tests can hand the estimators a
    /// covariance no fit would produce
    pub(crate) fn unchecked(
        model: ParametricModel,
        parameters: Array1<f64>,
        covariance: Array2<f64>,
    ) -> Self {
        Self {
            quality: Quality::default(),
            absolute_sigma: true,
            iterations: 0,
            model,
            parameters,
            covariance,
        }
    }
}

/// Weighted calibration residuals as an argmin problem
///
/// Residuals are `(f(xᵢ, θ) − yᵢ) / σᵢ`, with `σᵢ = 1` when the set has no uncertainties.
#[derive(Clone, Debug)]
pub struct CurveProblem {
    model: ParametricModel,
    predictors: Array1<f64>,
    responses: Array1<f64>,
    weights: Array1<f64>,
}

impl CurveProblem {
    pub fn new(model: ParametricModel, set: &CalibrationSet) -> Self {
        let weights = set
            .uncertainties()
            .map_or_else(|| Array1::ones(set.len()), |sigma| sigma.mapv(f64::recip));
        Self {
            model,
            predictors: Array1::from(set.predictors()),
            responses: Array1::from(set.responses()),
            weights,
        }
    }

    fn predict(&self, theta: ArrayView1<f64>) -> Array1<f64> {
        self.predictors
            .mapv(|x| self.model.evaluate(x, theta.view()))
    }

    /// Weighted residual vector
    pub fn residuals(&self, theta: ArrayView1<f64>) -> Array1<f64> {
        (self.predict(theta) - &self.responses) * &self.weights
    }

    /// Weighted model Jacobian, one row per calibration point
    pub fn weighted_jacobian(&self, theta: ArrayView1<f64>) -> Array2<f64> {
        let mut jacobian = Array2::zeros((self.predictors.len(), theta.len()));
        for ((mut row, &x), &w) in jacobian
            .rows_mut()
            .into_iter()
            .zip(&self.predictors)
            .zip(&self.weights)
        {
            row.assign(&(self.model.gradient(x, theta.view()) * w));
        }
        jacobian
    }

    /// Weighted residual sum of squares
    pub fn cost(&self, theta: ArrayView1<f64>) -> f64 {
        let r = self.residuals(theta);
        r.dot(&r)
    }
}

impl Operator for CurveProblem {
    type Param = Array1<f64>;
    type Output = Array1<f64>;

    fn apply(&self, p: &Self::Param) -> ::std::result::Result<Self::Output, argmin::core::Error> {
        Ok(self.residuals(p.view()))
    }
}

impl Jacobian for CurveProblem {
    type Param = Array1<f64>;
    type Jacobian = Array2<f64>;

    fn jacobian(
        &self,
        p: &Self::Param,
    ) -> ::std::result::Result<Self::Jacobian, argmin::core::Error> {
        Ok(self.weighted_jacobian(p.view()))
    }
}

/// A converged solver run
struct Attempt {
    theta: Array1<f64>,
    iterations: u64,
}

/// Why a solver run stopped without converging
struct Failure {
    iterations: u64,
    diagnostic: String,
}

impl From<argmin::core::Error> for Failure {
    fn from(value: argmin::core::Error) -> Self {
        Self {
            iterations: 0,
            diagnostic: value.to_string(),
        }
    }
}

/// Fit `model` to `set`, seeded by the model's own heuristic
///
/// # Errors
/// - [`Error::InsufficientData`] when there are no degrees of freedom
/// - [`Error::FitDidNotConverge`] when every tier of `options.schedule` fails
/// - [`Error::IllConditionedCovariance`] when `JᵗJ` is singular at the solution
pub fn fit(
    model: ParametricModel,
    set: &CalibrationSet,
    options: &FitOptions,
) -> Result<FittedModel> {
    check_degrees_of_freedom(model, set)?;
    let initial_guess = model.initial_guess(set)?;
    fit_with(model, set, initial_guess, None, options)
}

/// Fit `model` to `set` from an explicit starting point
///
/// `bounds` defaults to [`ParametricModel::bounds`].
///
/// # Errors
/// As [`fit`]; additionally [`Error::InvalidInput`] if the model has no parameters,
/// `initial_guess` has the wrong length or the schedule is empty.
pub fn fit_with(
    model: ParametricModel,
    set: &CalibrationSet,
    initial_guess: Array1<f64>,
    bounds: Option<&Bounds>,
    options: &FitOptions,
) -> Result<FittedModel> {
    let dof = check_degrees_of_freedom(model, set)?;
    if initial_guess.len() != model.parameter_count() {
        return Err(Error::InvalidInput(format!(
            "initial guess has {} elements, model {model} needs {}",
            initial_guess.len(),
            model.parameter_count()
        )));
    }
    if options.schedule.is_empty() {
        return Err(Error::InvalidInput("iteration schedule is empty".into()));
    }

    let default_bounds;
    let bounds = if let Some(bounds) = bounds {
        bounds
    } else {
        default_bounds = model.bounds();
        &default_bounds
    };
    let problem = CurveProblem::new(model, set);

    let mut last_failure = None;
    for (tier, &budget) in options.schedule.iter().enumerate() {
        debug!(%model, tier, budget, "running calibration fit");
        let outcome = match options.solver {
            SolverKind::LevenbergMarquardt => {
                levenberg_marquardt(&problem, bounds, &initial_guess, budget, options)
            }
            SolverKind::GaussNewton => {
                gauss_newton(&problem, bounds, &initial_guess, budget, options)
            }
        };
        match outcome {
            Ok(attempt) => return finish(&problem, set, attempt, dof),
            Err(failure) => {
                warn!(
                    %model,
                    tier,
                    budget,
                    diagnostic = %failure.diagnostic,
                    "calibration fit did not converge, escalating"
                );
                last_failure = Some(failure);
            }
        }
    }

    let failure = last_failure.unwrap_or(Failure {
        iterations: 0,
        diagnostic: "no attempts were made".into(),
    });
    Err(Error::FitDidNotConverge {
        attempts: options.schedule.len(),
        iterations: failure.iterations,
        diagnostic: failure.diagnostic,
    })
}

fn check_degrees_of_freedom(model: ParametricModel, set: &CalibrationSet) -> Result<usize> {
    model.validate()?;
    let parameters = model.parameter_count();
    if set.len() <= parameters {
        return Err(Error::InsufficientData {
            points: set.len(),
            parameters,
        });
    }
    Ok(set.len() - parameters)
}

fn norm(v: &Array1<f64>) -> f64 {
    v.dot(v).sqrt()
}

/// Levenberg–Marquardt with Marquardt diagonal scaling and projection onto `bounds`
///
/// Converges when the step is small relative to the parameters, when both the actual and the
/// predicted relative cost reductions fall below `tolerance`, or when the residual vector is
/// orthogonal to every Jacobian column.
fn levenberg_marquardt(
    problem: &CurveProblem,
    bounds: &Bounds,
    initial_guess: &Array1<f64>,
    max_iters: u64,
    options: &FitOptions,
) -> ::std::result::Result<Attempt, Failure> {
    let tol = options.tolerance;
    let mut theta = initial_guess.clone();
    bounds.project(&mut theta);
    let mut residuals = problem.apply(&theta)?;
    let mut cost = residuals.dot(&residuals);
    if !cost.is_finite() {
        return Err(Failure {
            iterations: 0,
            diagnostic: format!("cost is not finite at the initial guess {theta}"),
        });
    }

    let mut damping = INITIAL_DAMPING;
    for iteration in 1..=max_iters {
        let jacobian = problem.jacobian(&theta)?;
        let normal = jacobian.t().dot(&jacobian);
        let gradient = jacobian.t().dot(&residuals);

        let residual_norm = cost.sqrt();
        let orthogonal = jacobian.columns().into_iter().zip(&gradient).all(|(column, g)| {
            let column_norm = column.dot(&column).sqrt();
            column_norm == 0.0
                || g.abs() <= options.gradient_tolerance * column_norm * residual_norm
        });
        if cost == 0.0 || orthogonal {
            return Ok(Attempt {
                theta,
                iterations: iteration,
            });
        }

        loop {
            let scaling = normal.diag().mapv(|d| d.max(MIN_DIAGONAL));
            let mut damped = normal.clone();
            for (jj, s) in scaling.iter().enumerate() {
                damped[[jj, jj]] += damping * s;
            }

            let step = match damped.solve(&gradient.mapv(|g| -g)) {
                Ok(step) if step.iter().all(|v| v.is_finite()) => step,
                _ => {
                    damping *= 10.0;
                    if damping > MAX_DAMPING {
                        return Err(Failure {
                            iterations: iteration,
                            diagnostic: "damped normal equations are singular".into(),
                        });
                    }
                    continue;
                }
            };

            let mut candidate = &theta + &step;
            bounds.project(&mut candidate);
            let applied = &candidate - &theta;
            let candidate_residuals = problem.apply(&candidate)?;
            let candidate_cost = candidate_residuals.dot(&candidate_residuals);
            let improved = candidate_cost.is_finite() && candidate_cost < cost;

            if norm(&applied) <= tol * (norm(&theta) + tol) {
                if improved {
                    theta = candidate;
                }
                return Ok(Attempt {
                    theta,
                    iterations: iteration,
                });
            }

            if improved {
                let actual = (cost - candidate_cost) / cost;
                let predicted = (applied.dot(&normal.dot(&applied))
                    + 2.0 * damping * applied.dot(&(&scaling * &applied)))
                    / cost;
                theta = candidate;
                residuals = candidate_residuals;
                cost = candidate_cost;
                damping = (damping / 10.0).max(MIN_DAMPING);
                if actual <= tol && predicted <= tol {
                    return Ok(Attempt {
                        theta,
                        iterations: iteration,
                    });
                }
                break;
            }

            damping *= 10.0;
            if damping > MAX_DAMPING {
                return Err(Failure {
                    iterations: iteration,
                    diagnostic: format!(
                        "damping exceeded {MAX_DAMPING:e} without reducing the cost {cost:e}"
                    ),
                });
            }
        }
    }

    Err(Failure {
        iterations: max_iters,
        diagnostic: format!("iteration budget of {max_iters} exhausted with cost {cost:e}"),
    })
}

/// argmin's Gauss–Newton with a More–Thuente line search
fn gauss_newton(
    problem: &CurveProblem,
    bounds: &Bounds,
    initial_guess: &Array1<f64>,
    max_iters: u64,
    options: &FitOptions,
) -> ::std::result::Result<Attempt, Failure> {
    let linesearch = MoreThuenteLineSearch::new().with_bounds(0.0, 1.0)?;
    let solver = GaussNewtonLS::new(linesearch).with_tolerance(options.tolerance)?;

    let res = Executor::new(problem.clone(), solver)
        .configure(|state| state.param(initial_guess.clone()).max_iters(max_iters))
        .run()?;

    let iterations = res.state().get_iter();
    match res.state().get_termination_reason() {
        Some(TerminationReason::SolverConverged | TerminationReason::TargetCostReached) => {}
        Some(TerminationReason::MaxItersReached) => {
            return Err(Failure {
                iterations,
                diagnostic: format!("iteration budget of {max_iters} exhausted"),
            })
        }
        reason => {
            return Err(Failure {
                iterations,
                diagnostic: format!("solver stopped without converging: {reason:?}"),
            })
        }
    }
    let mut state = res.state().clone();
    let Some(mut theta) = state.take_param() else {
        return Err(Failure {
            iterations,
            diagnostic: "solver returned no parameters".into(),
        });
    };
    bounds.project(&mut theta);
    if !problem.cost(theta.view()).is_finite() {
        return Err(Failure {
            iterations,
            diagnostic: format!("cost is not finite at the solution {theta}"),
        });
    }
    Ok(Attempt { theta, iterations })
}

/// Covariance and quality metrics at the converged parameters
fn finish(
    problem: &CurveProblem,
    set: &CalibrationSet,
    attempt: Attempt,
    dof: usize,
) -> Result<FittedModel> {
    let theta = attempt.theta;
    let jacobian = problem.weighted_jacobian(theta.view());
    let normal = jacobian.t().dot(&jacobian);
    let unscaled = normal.inv().map_err(|err| Error::IllConditionedCovariance {
        detail: format!("JᵗJ is singular at the solution: {err}"),
    })?;

    let weighted_residuals = problem.residuals(theta.view());
    let chi_square = weighted_residuals.dot(&weighted_residuals);
    let dof_f = dof as f64;
    let residual_variance = chi_square / dof_f;

    let absolute_sigma = set.has_uncertainties();
    let scale = if absolute_sigma { 1.0 } else { residual_variance };
    let covariance = symmetrise(&(unscaled * scale));
    validate_covariance(&covariance)?;

    let raw_residuals = problem.predict(theta.view()) - &problem.responses;
    let ss_res = raw_residuals.dot(&raw_residuals);
    let mean = problem.responses.mean().unwrap_or(0.0);
    let ss_tot = problem.responses.mapv(|y| (y - mean).powi(2)).sum();
    let r_squared = if ss_tot == 0.0 { 0.0 } else { 1.0 - ss_res / ss_tot };

    let quality = Quality {
        r_squared,
        standard_error: (ss_res / dof_f).sqrt(),
        residual_variance,
        degrees_of_freedom: dof,
    };
    info!(
        model = %problem.model,
        iterations = attempt.iterations,
        r_squared,
        residual_variance,
        "calibration fit converged"
    );

    Ok(FittedModel {
        quality,
        absolute_sigma,
        iterations: attempt.iterations,
        model: problem.model,
        parameters: theta,
        covariance,
    })
}
