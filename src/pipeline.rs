//! Calibration followed by per-sample dose estimation.
//!
//! Every pipeline owns its fitted models and never mutates them, so estimation runs over rayon
//! worker threads with read-only sharing. A failed sample produces an invalid estimate and does
//! not affect its neighbours.

use std::marker::PhantomData;

use ndarray::Array1;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::calibration::{CalibrationPoint, CalibrationSet};
use crate::error::{Error, ErrorKind};
use crate::fit::{fit, fit_with, FitOptions, FittedModel};
use crate::invert::Inverter;
use crate::margin::{DoseEstimate, Measurement};
use crate::model::ParametricModel;
use crate::spectrum::{
    summarise, PeakDetection, PeakShape, Spectrum, Summary, SummaryStatistic, Window,
};
use crate::Result;

/// One output row per estimated sample
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EstimateRecord {
    pub identifier: String,
    /// The raw response or the summary statistic that was inverted
    pub response: f64,
    pub dose: f64,
    pub dose_uncertainty: f64,
    pub valid: bool,
    pub reason: Option<ErrorKind>,
}

impl EstimateRecord {
    pub fn new(identifier: impl Into<String>, response: f64, estimate: &DoseEstimate) -> Self {
        Self {
            identifier: identifier.into(),
            response,
            dose: estimate.value(),
            dose_uncertainty: estimate.uncertainty(),
            valid: estimate.is_valid(),
            reason: estimate.reason(),
        }
    }
}

/// A named measurement awaiting estimation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub identifier: String,
    pub measurement: Measurement,
}

pub enum Set {}
pub enum Unset {}

/// Collects what a [`Pipeline`] needs before fitting; `build` is only available once a
/// calibration set has been supplied.
pub struct PipelineBuilder<N> {
    model: ParametricModel,
    options: FitOptions,
    inverter: Inverter,
    initial_guess: Option<Array1<f64>>,
    points: Vec<CalibrationPoint>,
    phantom_data: PhantomData<N>,
}

impl<N> PipelineBuilder<N> {
    #[must_use]
    pub fn with_options(mut self, options: FitOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub const fn with_inverter(mut self, inverter: Inverter) -> Self {
        self.inverter = inverter;
        self
    }

    /// Replace the model's own seeding heuristic
    #[must_use]
    pub fn with_initial_guess(mut self, initial_guess: Array1<f64>) -> Self {
        self.initial_guess = Some(initial_guess);
        self
    }
}

impl PipelineBuilder<Unset> {
    pub fn new(model: ParametricModel) -> Self {
        Self {
            model,
            options: FitOptions::default(),
            inverter: Inverter::default(),
            initial_guess: None,
            points: Vec::new(),
            phantom_data: PhantomData,
        }
    }

    pub fn with_calibration(self, calibration: &CalibrationSet) -> PipelineBuilder<Set> {
        PipelineBuilder {
            model: self.model,
            options: self.options,
            inverter: self.inverter,
            initial_guess: self.initial_guess,
            points: calibration.points().to_vec(),
            phantom_data: PhantomData,
        }
    }
}

impl PipelineBuilder<Set> {
    /// Fit the calibration
    ///
    /// # Errors
    /// Any fit error, surfaced unchanged.
    pub fn build(self) -> Result<Pipeline> {
        let set = CalibrationSet::new(self.points)?;
        let fitted = match self.initial_guess {
            Some(initial_guess) => fit_with(self.model, &set, initial_guess, None, &self.options),
            None => fit(self.model, &set, &self.options),
        }
        .map_err(|err| {
            error!(model = %self.model, points = set.len(), error = %err, "calibration failed");
            err
        })?;
        Ok(Pipeline {
            fitted,
            inverter: self.inverter,
        })
    }
}

/// A single calibrated model
#[derive(Clone, Debug, PartialEq)]
pub struct Pipeline {
    fitted: FittedModel,
    inverter: Inverter,
}

impl Pipeline {
    /// # Errors
    /// Any fit error, surfaced unchanged.
    pub fn calibrate(
        model: ParametricModel,
        set: &CalibrationSet,
        options: &FitOptions,
    ) -> Result<Self> {
        PipelineBuilder::new(model)
            .with_options(options.clone())
            .with_calibration(set)
            .build()
    }

    /// Wrap a model that was fitted elsewhere, such as one read from a parameter file
    pub const fn from_fitted(fitted: FittedModel, inverter: Inverter) -> Self {
        Self { fitted, inverter }
    }

    pub const fn fitted(&self) -> &FittedModel {
        &self.fitted
    }

    pub fn estimate(&self, measurement: &Measurement) -> DoseEstimate {
        self.inverter.invert(&self.fitted, measurement)
    }

    /// Estimate every sample, in input order
    pub fn estimate_batch(&self, samples: &[Sample]) -> Vec<EstimateRecord> {
        samples
            .par_iter()
            .map(|sample| {
                let estimate = self.estimate(&sample.measurement);
                EstimateRecord::new(
                    sample.identifier.clone(),
                    sample.measurement.value,
                    &estimate,
                )
            })
            .collect()
    }
}

fn default_peaks() -> usize {
    2
}

fn default_response_model() -> ParametricModel {
    ParametricModel::Linear
}

fn default_response_uncertainty() -> f64 {
    0.01
}

/// Settings of the two-stage peak calibration
///
/// The window and the calibration doses have no defaults: the instruments in use differ in
/// both.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpectralConfig {
    pub window: Window,
    #[serde(default)]
    pub peak_shape: PeakShape,
    /// Number of Lorentzian lines; a Gaussian fit always has one
    #[serde(default = "default_peaks")]
    pub peaks: usize,
    #[serde(default)]
    pub statistic: SummaryStatistic,
    /// One-sigma error of each absorbance sample, used by [`SummaryStatistic::Trapezoid`]
    #[serde(default = "default_response_uncertainty")]
    pub response_uncertainty: f64,
    /// Second-stage model from dose to summary statistic
    #[serde(default = "default_response_model")]
    pub response_model: ParametricModel,
    #[serde(default)]
    pub detection: PeakDetection,
    /// Weight the second-stage fit by the summary uncertainties
    #[serde(default)]
    pub weighted: bool,
    /// Doses of the calibration spectra, in the order the spectra are given
    #[serde(default)]
    pub doses: Vec<f64>,
}

impl SpectralConfig {
    pub fn new(window: Window) -> Self {
        Self {
            window,
            peak_shape: PeakShape::default(),
            peaks: default_peaks(),
            statistic: SummaryStatistic::default(),
            response_uncertainty: default_response_uncertainty(),
            response_model: default_response_model(),
            detection: PeakDetection::default(),
            weighted: false,
            doses: Vec::new(),
        }
    }
}

/// Result of estimating one spectrum
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SpectralEstimate {
    /// `None` if the peak fit or its reduction failed
    pub summary: Option<Summary>,
    pub dose: DoseEstimate,
}

/// Two-stage calibration for spectra: peaks per spectrum, then dose against a summary
#[derive(Clone, Debug, PartialEq)]
pub struct SpectralPipeline {
    config: SpectralConfig,
    options: FitOptions,
    inverter: Inverter,
    calibration: Vec<(f64, Summary)>,
    response: FittedModel,
}

impl SpectralPipeline {
    /// Calibrate from spectra measured at `config.doses`
    ///
    /// # Errors
    /// [`Error::InvalidInput`] if the number of spectra and doses differ; otherwise as
    /// [`Self::calibrate_pairs`].
    pub fn calibrate(
        config: SpectralConfig,
        spectra: &[Spectrum],
        options: &FitOptions,
        inverter: Inverter,
    ) -> Result<Self> {
        if config.doses.len() != spectra.len() {
            return Err(Error::InvalidInput(format!(
                "{} calibration spectra but {} doses",
                spectra.len(),
                config.doses.len()
            )));
        }
        let pairs = config
            .doses
            .iter()
            .copied()
            .zip(spectra.iter().cloned())
            .collect::<Vec<_>>();
        Self::calibrate_pairs(config, &pairs, options, inverter)
    }

    /// Calibrate from `(dose, spectrum)` pairs
    ///
    /// # Errors
    /// Any first-stage fit or summary failure aborts the calibration, as does a second-stage
    /// model without a closed-form inverse.
    pub fn calibrate_pairs(
        config: SpectralConfig,
        spectra: &[(f64, Spectrum)],
        options: &FitOptions,
        inverter: Inverter,
    ) -> Result<Self> {
        if !config.response_model.has_inverse() {
            return Err(Error::NoClosedFormInverse {
                model: config.response_model.to_string(),
            });
        }

        let calibration = spectra
            .par_iter()
            .map(|(dose, spectrum)| {
                summarise_spectrum(&config, spectrum, options)
                    .map(|summary| (*dose, summary))
                    .map_err(|err| {
                        error!(
                            dose,
                            error = %err,
                            "calibration spectrum could not be summarised"
                        );
                        err
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        let points = calibration
            .iter()
            .map(|(dose, summary)| {
                let point = CalibrationPoint::new(*dose, summary.value);
                if config.weighted {
                    point.with_uncertainty(summary.uncertainty())
                } else {
                    point
                }
            })
            .collect();
        let set = CalibrationSet::new(points)?;
        let response = fit(config.response_model, &set, options)?;
        info!(
            spectra = spectra.len(),
            statistic = ?config.statistic,
            r_squared = response.r_squared(),
            "spectral calibration complete"
        );

        Ok(Self {
            config,
            options: options.clone(),
            inverter,
            calibration,
            response,
        })
    }

    pub const fn config(&self) -> &SpectralConfig {
        &self.config
    }

    /// Second-stage fit of summary statistic against dose
    pub const fn response_model(&self) -> &FittedModel {
        &self.response
    }

    /// `(dose, summary)` of each calibration spectrum
    pub fn calibration(&self) -> &[(f64, Summary)] {
        &self.calibration
    }

    pub fn estimate(&self, spectrum: &Spectrum) -> SpectralEstimate {
        match summarise_spectrum(&self.config, spectrum, &self.options) {
            Ok(summary) => SpectralEstimate {
                summary: Some(summary),
                dose: self.inverter.invert_summary(&self.response, &summary),
            },
            Err(err) => SpectralEstimate {
                summary: None,
                dose: DoseEstimate::from(&err),
            },
        }
    }

    /// Estimate every spectrum, in input order
    pub fn estimate_batch(&self, spectra: &[(String, Spectrum)]) -> Vec<EstimateRecord> {
        spectra
            .par_iter()
            .map(|(identifier, spectrum)| {
                let estimate = self.estimate(spectrum);
                let response = estimate.summary.map_or(f64::NAN, |s| s.value);
                EstimateRecord::new(identifier.clone(), response, &estimate.dose)
            })
            .collect()
    }
}

fn summarise_spectrum(
    config: &SpectralConfig,
    spectrum: &Spectrum,
    options: &FitOptions,
) -> Result<Summary> {
    let windowed = spectrum.window(&config.window)?;
    if !config.statistic.needs_peak_fit() {
        return windowed.area(config.response_uncertainty);
    }
    let fitted =
        windowed.fit_peaks(config.peak_shape, config.peaks, &config.detection, options)?;
    summarise(&fitted, &windowed, config.statistic)
}

/// Mean pixel value of each colour channel, with its spread
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RgbReading {
    pub red: Measurement,
    pub green: Measurement,
    pub blue: Measurement,
}

impl RgbReading {
    fn channels(&self) -> [Measurement; 3] {
        [self.red, self.green, self.blue]
    }
}

/// Film dosimetry: one [`ParametricModel::PixelLogistic`] calibration per colour channel
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelPipeline {
    red: Pipeline,
    green: Pipeline,
    blue: Pipeline,
}

impl ChannelPipeline {
    /// Fit the three channels in parallel from `(dose, reading)` pairs
    ///
    /// # Errors
    /// Any channel's fit error.
    pub fn calibrate(
        readings: &[(f64, RgbReading)],
        options: &FitOptions,
        inverter: Inverter,
    ) -> Result<Self> {
        let channel = |pick: fn(&RgbReading) -> Measurement| {
            let pairs = readings
                .iter()
                .map(|(dose, reading)| (pick(reading).value, *dose))
                .collect::<Vec<_>>();
            let set = CalibrationSet::from_pairs(&pairs)?;
            Pipeline::calibrate(ParametricModel::PixelLogistic, &set, options)
                .map(|pipeline| Pipeline::from_fitted(pipeline.fitted, inverter))
        };
        let (red, (green, blue)) = rayon::join(
            || channel(|r| r.red),
            || rayon::join(|| channel(|r| r.green), || channel(|r| r.blue)),
        );
        Ok(Self {
            red: red?,
            green: green?,
            blue: blue?,
        })
    }

    pub fn channels(&self) -> [&Pipeline; 3] {
        [&self.red, &self.green, &self.blue]
    }

    /// Mean of the valid channel doses, floored at zero
    ///
    /// The variance is `Σσᵢ² / n²` over the `n` valid channels. With no valid channel the
    /// estimate is invalid, carrying the first channel's reason.
    pub fn estimate(&self, reading: &RgbReading) -> DoseEstimate {
        let estimates = self
            .channels()
            .iter()
            .zip(reading.channels())
            .map(|(pipeline, measurement)| pipeline.estimate(&measurement))
            .collect::<Vec<_>>();
        let valid = estimates.iter().filter(|e| e.is_valid()).collect::<Vec<_>>();
        if valid.is_empty() {
            let reason = estimates
                .iter()
                .find_map(DoseEstimate::reason)
                .unwrap_or(ErrorKind::InvalidInverseDomain);
            return DoseEstimate::invalid(reason);
        }
        let n = valid.len() as f64;
        let mean = valid.iter().map(|e| e.value()).sum::<f64>() / n;
        let variance = valid.iter().map(|e| e.variance()).sum::<f64>() / (n * n);
        DoseEstimate::new(mean.max(0.0), variance.sqrt())
    }

    /// Estimate every reading, in input order; the recorded response is the mean pixel value
    pub fn estimate_batch(&self, readings: &[(String, RgbReading)]) -> Vec<EstimateRecord> {
        readings
            .par_iter()
            .map(|(identifier, reading)| {
                let response = reading.channels().iter().map(|m| m.value).sum::<f64>() / 3.0;
                EstimateRecord::new(identifier.clone(), response, &self.estimate(reading))
            })
            .collect()
    }
}
