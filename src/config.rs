use std::fs;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::fit::FitOptions;
use crate::invert::Inverter;
use crate::pipeline::SpectralConfig;
use crate::Result;

/// Run configuration, usually read from a `dose.toml`
///
/// ```toml
/// [fit]
/// schedule = [20000, 50000, 100000]
/// solver = "levenberg-marquardt"
///
/// [propagation]
/// gradient = "numeric"
/// strategy = { sampled = 5000 }
///
/// [spectral]
/// window = { min = 605.0, max = 665.0 }
/// peak_shape = "lorentzian"
/// peaks = 2
/// statistic = "curve-sum"
/// response_uncertainty = 0.01
/// response_model = { kind = "quadratic" }
/// doses = [0.0, 0.5, 1.0, 2.0, 4.0]
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub fit: FitOptions,
    pub propagation: Inverter,
    /// Only needed for spectral calibrations
    pub spectral: Option<SpectralConfig>,
}

impl Config {
    /// # Errors
    /// Returns an error if the file cannot be read or is not a valid configuration.
    pub fn from_file(path: &Path) -> Result<Self> {
        fs::read_to_string(path)?.parse()
    }

    /// The spectral section, which spectral runs cannot do without
    ///
    /// # Errors
    /// Returns [`Error::InvalidInput`] if the section is missing.
    pub fn spectral(&self) -> Result<&SpectralConfig> {
        self.spectral
            .as_ref()
            .ok_or_else(|| Error::InvalidInput("configuration has no [spectral] section".into()))
    }

    /// # Errors
    /// Returns an error if serialisation fails.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string(self)?)
    }
}

impl FromStr for Config {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)?;
        if config.fit.schedule.is_empty() {
            return Err(Error::InvalidInput("[fit] schedule must not be empty".into()));
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::Config;
    use crate::fit::{FitOptions, SolverKind};
    use crate::model::ParametricModel;
    use crate::propagate::{GradientSource, Strategy};
    use crate::spectrum::{PeakShape, SummaryStatistic};

    #[test]
    fn empty_files_give_the_defaults() {
        let config: Config = "".parse().unwrap();
        assert_eq!(config.fit, FitOptions::default());
        assert_eq!(config.fit.schedule, vec![20_000, 50_000, 100_000]);
        assert!(config.spectral().is_err());
    }

    #[test]
    fn every_section_is_read() {
        let text = r#"
            [fit]
            schedule = [100, 1000]
            solver = "gauss-newton"

            [propagation]
            gradient = "numeric"
            strategy = { sampled = 500 }

            [spectral]
            window = { min = 605.0, max = 665.0 }
            peaks = 3
            statistic = "window-integral"
            response_model = { kind = "quadratic" }
            doses = [0.0, 1.0, 2.0]
            detection = { min_distance = 4 }
        "#;
        let config: Config = text.parse().unwrap();
        assert_eq!(config.fit.schedule, vec![100, 1000]);
        assert_eq!(config.fit.solver, SolverKind::GaussNewton);
        approx::assert_relative_eq!(config.fit.tolerance, f64::EPSILON.sqrt());
        assert_eq!(config.propagation.gradient, GradientSource::Numeric);
        assert_eq!(config.propagation.strategy, Strategy::Sampled(500));

        let spectral = config.spectral().unwrap();
        approx::assert_relative_eq!(spectral.window.max, 665.0);
        assert_eq!(spectral.peaks, 3);
        assert_eq!(spectral.statistic, SummaryStatistic::WindowIntegral);
        assert_eq!(spectral.response_model, ParametricModel::Quadratic);
        assert_eq!(spectral.detection.min_distance, 4);
        approx::assert_relative_eq!(spectral.detection.min_prominence, 1e-3);
    }

    #[test]
    fn spectral_defaults_and_alternatives() {
        let config: Config = "[spectral]\nwindow = { min = 600.0, max = 680.0 }"
            .parse()
            .unwrap();
        let spectral = config.spectral().unwrap();
        assert_eq!(spectral.peak_shape, PeakShape::Lorentzian);
        assert_eq!(spectral.peaks, 2);
        approx::assert_relative_eq!(spectral.response_uncertainty, 0.01);

        let text = r#"
            [spectral]
            window = { min = 600.0, max = 680.0 }
            peak_shape = "gaussian"
            statistic = "trapezoid"
            response_uncertainty = 0.002
            response_model = { kind = "logarithmic" }
        "#;
        let config: Config = text.parse().unwrap();
        let spectral = config.spectral().unwrap();
        assert_eq!(spectral.peak_shape, PeakShape::Gaussian);
        assert_eq!(spectral.statistic, SummaryStatistic::Trapezoid);
        assert!(!spectral.statistic.needs_peak_fit());
        approx::assert_relative_eq!(spectral.response_uncertainty, 0.002);
        assert_eq!(spectral.response_model, ParametricModel::Logarithmic);
    }

    #[test]
    fn empty_schedules_are_rejected() {
        assert!("[fit]\nschedule = []".parse::<Config>().is_err());
    }

    #[test]
    fn configurations_survive_a_toml_round_trip() {
        let config: Config = "[propagation]\nstrategy = { sampled = 50 }".parse().unwrap();
        let restored: Config = config.to_toml().unwrap().parse().unwrap();
        assert_eq!(restored, config);
    }
}
