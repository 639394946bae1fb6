use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Error;
use crate::fit::FittedModel;
use crate::margin::{DoseEstimate, Measurement};
use crate::model::ParametricModel;
use crate::propagate::{
    numeric_derivative, numeric_gradient, propagate, sample, ExtraInput, GradientSource,
    Propagated, Strategy,
};
use crate::spectrum::Summary;
use crate::Result;

/// Converts measured responses into doses through a fitted calibration
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Inverter {
    pub gradient: GradientSource,
    pub strategy: Strategy,
}

impl Inverter {
    /// Invert `measurement` through `fitted`
    ///
    /// Never fails: domain violations, degenerate parameters and non-finite intermediates give
    /// an invalid [`DoseEstimate`] whose `reason` names the failure.
    pub fn invert(&self, fitted: &FittedModel, measurement: &Measurement) -> DoseEstimate {
        match self.try_invert(fitted, measurement) {
            Ok(estimate) => estimate,
            Err(err) => {
                warn!(
                    model = %fitted.model(),
                    response = measurement.value,
                    error = %err,
                    "dose estimate is invalid"
                );
                DoseEstimate::from(&err)
            }
        }
    }

    /// Second stage of a two-stage calibration: invert a summary statistic whose variance
    /// comes from the first-stage fit
    pub fn invert_summary(&self, fitted: &FittedModel, summary: &Summary) -> DoseEstimate {
        self.invert(
            fitted,
            &Measurement {
                value: summary.value,
                uncertainty: summary.uncertainty(),
            },
        )
    }

    /// # Errors
    /// Returns the error that made the estimate invalid.
    pub fn try_invert(
        &self,
        fitted: &FittedModel,
        measurement: &Measurement,
    ) -> Result<DoseEstimate> {
        measurement.validate()?;
        let model = fitted.model();
        if !model.has_inverse() {
            return Err(Error::NoClosedFormInverse {
                model: model.to_string(),
            });
        }
        let theta = fitted.parameters();
        let response = measurement.value;
        let dose = model.invert(response, theta)?;
        if !dose.is_finite() {
            return Err(Error::InvalidInverseDomain {
                response,
                detail: "the inverse is not finite",
            });
        }

        let variance = match self.strategy {
            Strategy::Linearised => {
                let (parameters, partial) = self.partials(model, response, theta)?;
                let extra = ExtraInput {
                    value: response,
                    variance: measurement.variance(),
                    partial,
                };
                match propagate(parameters.view(), fitted.covariance(), &[extra])? {
                    Propagated::Variance(variance) => variance,
                    Propagated::IllConditioned { min_eigenvalue } => {
                        return Err(Error::IllConditionedCovariance {
                            detail: format!(
                                "calibration covariance has eigenvalue {min_eigenvalue:e}"
                            ),
                        })
                    }
                }
            }
            Strategy::Sampled(samples) => {
                let extra = ExtraInput {
                    value: response,
                    variance: measurement.variance(),
                    partial: 0.0,
                };
                let sampled = sample(
                    |theta, inputs: &[f64]| model.invert(inputs[0], theta).unwrap_or(f64::NAN),
                    theta,
                    fitted.covariance(),
                    &[extra],
                    samples,
                )?;
                sampled.variance
            }
        };

        if !variance.is_finite() {
            return Err(Error::InvalidInverseDomain {
                response,
                detail: "the propagated variance is not finite",
            });
        }
        Ok(DoseEstimate::new(dose, variance.sqrt()))
    }

    /// `∂x/∂θ` and `∂x/∂y` of the inverse at `response`
    fn partials(
        &self,
        model: ParametricModel,
        response: f64,
        theta: ArrayView1<f64>,
    ) -> Result<(Array1<f64>, f64)> {
        let (parameters, partial) = match self.gradient {
            GradientSource::Analytic => {
                let gradient = model.inverse_gradient(response, theta)?;
                (gradient.parameters, gradient.response)
            }
            GradientSource::Numeric => {
                let by_parameters = numeric_gradient(
                    |theta| model.invert(response, theta).unwrap_or(f64::NAN),
                    theta,
                );
                let by_response =
                    numeric_derivative(|y| model.invert(y, theta).unwrap_or(f64::NAN), response);
                (by_parameters, by_response)
            }
        };
        if !(partial.is_finite() && parameters.iter().all(|v| v.is_finite())) {
            return Err(Error::InvalidInverseDomain {
                response,
                detail: "the inverse is not differentiable at this response",
            });
        }
        Ok((parameters, partial))
    }
}

/// [`Inverter::invert`] with analytic partials and linear propagation
pub fn invert(fitted: &FittedModel, measurement: &Measurement) -> DoseEstimate {
    Inverter::default().invert(fitted, measurement)
}

#[cfg(test)]
mod tests {
    use super::{invert, Inverter};
    use crate::error::ErrorKind;
    use crate::fit::{FittedModel, Quality};
    use crate::margin::Measurement;
    use crate::model::ParametricModel;
    use crate::propagate::{GradientSource, Strategy};
    use crate::spectrum::Summary;

    use ndarray::{arr1, arr2, Array2};

    fn linear() -> FittedModel {
        FittedModel::from_parts(
            ParametricModel::Linear,
            arr1(&[2.0, 1.0]),
            arr2(&[[0.01, 0.0], [0.0, 0.02]]),
            Quality::default(),
        )
        .unwrap()
    }

    #[test]
    fn linear_inverse_propagates_parameter_variance() {
        let estimate = invert(&linear(), &Measurement::from_centroid(5.0));
        assert!(estimate.is_valid());
        approx::assert_relative_eq!(estimate.value(), 2.0);
        approx::assert_relative_eq!(estimate.variance(), 0.015, max_relative = 1e-12);
    }

    #[test]
    fn numeric_partials_agree_with_analytic_ones() {
        let inverter = Inverter {
            gradient: GradientSource::Numeric,
            strategy: Strategy::Linearised,
        };
        let measurement = Measurement::new(5.0, 0.2).unwrap();
        let analytic = invert(&linear(), &measurement);
        let numeric = inverter.invert(&linear(), &measurement);
        approx::assert_relative_eq!(numeric.value(), analytic.value());
        approx::assert_relative_eq!(
            numeric.uncertainty(),
            analytic.uncertainty(),
            max_relative = 1e-6
        );
        // The response contributes (1/m)² σ_y² = 0.01
        approx::assert_relative_eq!(analytic.variance(), 0.025, max_relative = 1e-12);
    }

    #[test]
    fn exponential_asymptote_gives_an_invalid_estimate() {
        let fitted = FittedModel::from_parts(
            ParametricModel::Exponential,
            arr1(&[2.0, 0.3, 1.0]),
            Array2::eye(3) * 1e-4,
            Quality::default(),
        )
        .unwrap();
        let estimate = invert(&fitted, &Measurement::from_centroid(1.0));
        assert!(!estimate.is_valid());
        assert!(estimate.value().is_nan());
        assert_eq!(estimate.reason(), Some(ErrorKind::InvalidInverseDomain));
    }

    #[test]
    fn zero_slopes_are_degenerate() {
        let fitted = FittedModel::from_parts(
            ParametricModel::Linear,
            arr1(&[0.0, 1.0]),
            Array2::eye(2),
            Quality::default(),
        )
        .unwrap();
        let estimate = invert(&fitted, &Measurement::from_centroid(2.0));
        assert_eq!(estimate.reason(), Some(ErrorKind::DegenerateModel));
    }

    #[test]
    fn peak_models_cannot_be_inverted_directly() {
        let fitted = FittedModel::from_parts(
            ParametricModel::LorentzianSum { peaks: 1 },
            arr1(&[1.0, 630.0, 10.0]),
            Array2::eye(3),
            Quality::default(),
        )
        .unwrap();
        let estimate = invert(&fitted, &Measurement::from_centroid(0.5));
        assert_eq!(estimate.reason(), Some(ErrorKind::NoClosedFormInverse));
    }

    #[test]
    fn malformed_measurements_are_invalid_input() {
        let estimate = invert(
            &linear(),
            &Measurement {
                value: f64::NAN,
                uncertainty: 0.0,
            },
        );
        assert_eq!(estimate.reason(), Some(ErrorKind::InvalidInput));
    }

    #[test]
    fn summary_variance_feeds_the_second_stage() {
        let summary = Summary {
            value: 5.0,
            variance: 0.04,
        };
        let estimate = Inverter::default().invert_summary(&linear(), &summary);
        // 0.015 from the calibration plus (1/2)² · 0.04
        approx::assert_relative_eq!(estimate.variance(), 0.025, max_relative = 1e-12);
    }

    #[test]
    fn sampling_agrees_with_linear_propagation_for_linear_models() {
        let measurement = Measurement::new(5.0, 0.1).unwrap();
        let inverter = Inverter {
            gradient: GradientSource::Analytic,
            strategy: Strategy::Sampled(20_000),
        };
        let linearised = invert(&linear(), &measurement);
        let sampled = inverter.invert(&linear(), &measurement);
        approx::assert_relative_eq!(sampled.value(), linearised.value());
        approx::assert_relative_eq!(
            sampled.uncertainty(),
            linearised.uncertainty(),
            max_relative = 0.1
        );
    }

    #[test]
    fn indefinite_covariances_give_an_ill_conditioned_estimate() {
        // Eigenvalues 3 and -1: no fit produces this, and from_parts refuses it
        let fitted = FittedModel::unchecked(
            ParametricModel::Linear,
            arr1(&[2.0, 1.0]),
            arr2(&[[1.0, 2.0], [2.0, 1.0]]),
        );
        let measurement = Measurement::new(5.0, 0.1).unwrap();
        for strategy in [Strategy::Linearised, Strategy::Sampled(100)] {
            let inverter = Inverter {
                gradient: GradientSource::Analytic,
                strategy,
            };
            let estimate = inverter.invert(&fitted, &measurement);
            assert!(!estimate.is_valid());
            assert_eq!(estimate.reason(), Some(ErrorKind::IllConditionedCovariance));
        }
    }

    #[test]
    fn logarithmic_calibrations_invert_through_the_exponential() {
        // 0.8·ln(x + 1.5) + 2
        let fitted = FittedModel::from_parts(
            ParametricModel::Logarithmic,
            arr1(&[0.8, 1.5, 2.0]),
            Array2::eye(3) * 1e-6,
            Quality::default(),
        )
        .unwrap();
        let response = 0.8f64.mul_add(5.5f64.ln(), 2.0);
        let estimate = invert(&fitted, &Measurement::new(response, 0.01).unwrap());
        assert!(estimate.is_valid());
        approx::assert_relative_eq!(estimate.value(), 4.0, max_relative = 1e-12);
        // ∂x/∂y = (x + b) / a dominates
        assert!(estimate.uncertainty() > 0.01 * 5.5 / 0.8);
    }
}
