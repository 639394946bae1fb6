use ndarray_rand::rand::{Rng, SeedableRng};
use ndarray_rand::rand_distr::{Distribution, Normal};
use rand_isaac::Isaac64Rng;
use serde::Serialize;
use tempdir::TempDir;

use dose_margin::config::Config;
use dose_margin::fit::FittedModel;
use dose_margin::io::{read_calibration_file, write_estimates_file};
use dose_margin::margin::Measurement;
use dose_margin::model::ParametricModel;
use dose_margin::params::ParameterFile;
use dose_margin::pipeline::{Pipeline, Sample, SpectralPipeline};
use dose_margin::spectrum::Spectrum;
use dose_margin::Result;

#[derive(Serialize)]
struct Row {
    predictor: f64,
    response: f64,
    uncertainty: f64,
}

fn write_calibration(dir: &TempDir, name: &str, rows: &[(f64, f64)]) -> std::path::PathBuf {
    let path = dir.path().join(name);
    let mut wtr = csv::Writer::from_path(&path).unwrap();
    wtr.write_record(["predictor", "response"]).unwrap();
    for (predictor, response) in rows {
        wtr.write_record(&[predictor.to_string(), response.to_string()])
            .unwrap();
    }
    wtr.flush().unwrap();
    path
}

#[test]
fn area_calibration_recovers_dose_end_to_end() -> Result<()> {
    let tmp_dir = TempDir::new("area_calibration_recovers_dose_end_to_end").unwrap();
    let path = write_calibration(
        &tmp_dir,
        "calibration.csv",
        &[(0.1, 0.5), (1.0, 4.8), (10.0, 48.2), (20.0, 96.9)],
    );

    let set = read_calibration_file(&path)?;
    let config = Config::default();
    let pipeline = Pipeline::calibrate(ParametricModel::Linear, &set, &config.fit)?;

    let fitted = pipeline.fitted();
    approx::assert_relative_eq!(fitted.parameters()[0], 4.85, max_relative = 5e-3);
    approx::assert_abs_diff_eq!(fitted.parameters()[1], 0.0, epsilon = 0.2);
    assert!(fitted.r_squared() > 0.999);

    let estimate = pipeline.estimate(&Measurement::new(24.25, 0.1)?);
    assert!(estimate.is_valid());
    approx::assert_relative_eq!(estimate.value(), 5.0, max_relative = 1e-2);
    assert!(estimate.uncertainty() > 0.0 && estimate.uncertainty() < 0.5);

    Ok(())
}

#[test]
fn parameter_files_reproduce_central_estimates() -> Result<()> {
    let tmp_dir = TempDir::new("parameter_files_reproduce_central_estimates").unwrap();
    let path = write_calibration(
        &tmp_dir,
        "calibration.csv",
        &[(0.0, 0.02), (0.5, 0.11), (1.0, 0.19), (2.0, 0.41), (4.0, 0.79)],
    );
    let set = read_calibration_file(&path)?;
    let pipeline = Pipeline::calibrate(ParametricModel::Linear, &set, &Config::default().fit)?;

    let parameter_path = tmp_dir.path().join("parameters.txt");
    ParameterFile::from_fitted(pipeline.fitted()).write(&parameter_path)?;
    let restored = ParameterFile::read(&parameter_path)?.to_fitted(ParametricModel::Linear)?;

    for (written, read) in pipeline.fitted().parameters().iter().zip(restored.parameters()) {
        approx::assert_relative_eq!(written, read, max_relative = 1e-6);
    }
    for (written, read) in pipeline
        .fitted()
        .standard_errors()
        .iter()
        .zip(restored.standard_errors().iter())
    {
        approx::assert_relative_eq!(written, read, max_relative = 1e-6);
    }

    let measurement = Measurement::new(0.3, 0.01)?;
    let reloaded = Pipeline::from_fitted(restored, Default::default());
    approx::assert_relative_eq!(
        pipeline.estimate(&measurement).value(),
        reloaded.estimate(&measurement).value(),
        max_relative = 1e-6
    );
    Ok(())
}

#[test]
fn fitted_models_persist_as_toml() -> Result<()> {
    let tmp_dir = TempDir::new("fitted_models_persist_as_toml").unwrap();
    let path = write_calibration(
        &tmp_dir,
        "calibration.csv",
        &[(0.0, 3.0), (1.0, 3.7), (2.0, 4.6), (3.0, 5.9), (4.0, 7.5), (5.0, 9.6)],
    );
    let set = read_calibration_file(&path)?;
    let pipeline = Pipeline::calibrate(ParametricModel::Exponential, &set, &Config::default().fit)?;

    let model_path = tmp_dir.path().join("model.toml");
    std::fs::write(&model_path, pipeline.fitted().to_toml()?)?;
    let restored = FittedModel::from_toml(&std::fs::read_to_string(&model_path)?)?;
    assert_eq!(&restored, pipeline.fitted());
    Ok(())
}

#[test]
fn configured_batches_are_written_in_input_order() -> Result<()> {
    let tmp_dir = TempDir::new("configured_batches_are_written_in_input_order").unwrap();
    let config_path = tmp_dir.path().join("dose.toml");
    std::fs::write(
        &config_path,
        "[fit]\nschedule = [500, 5000]\n\n[propagation]\ngradient = \"numeric\"\n",
    )?;
    let config = Config::from_file(&config_path)?;

    let calibration = write_calibration(
        &tmp_dir,
        "calibration.csv",
        &[(0.0, 0.1), (1.0, 2.1), (2.0, 3.9), (3.0, 6.1), (4.0, 8.0)],
    );
    let set = read_calibration_file(&calibration)?;
    let pipeline = Pipeline::from_fitted(
        Pipeline::calibrate(ParametricModel::Linear, &set, &config.fit)?
            .fitted()
            .clone(),
        config.propagation,
    );

    let samples = [4.0, 1.0, f64::NAN, 7.0]
        .iter()
        .enumerate()
        .map(|(ii, &value)| Sample {
            identifier: format!("sample-{ii}"),
            measurement: Measurement {
                value,
                uncertainty: 0.05,
            },
        })
        .collect::<Vec<_>>();
    let records = pipeline.estimate_batch(&samples);

    let output = tmp_dir.path().join("estimates.csv");
    write_estimates_file(&output, &records)?;
    let text = std::fs::read_to_string(&output)?;
    let lines = text.lines().collect::<Vec<_>>();
    assert_eq!(lines.len(), 5);
    assert!(lines[1].starts_with("sample-0,4.0,"));
    assert!(lines[3].starts_with("sample-2,NaN,NaN,NaN,false,invalid_input"));
    assert!(lines[4].starts_with("sample-3,7.0,"));
    Ok(())
}

#[test]
fn weighted_calibration_covers_true_doses() -> Result<()> {
    let seed = 40;
    let mut rng = Isaac64Rng::seed_from_u64(seed);
    let tmp_dir = TempDir::new("weighted_calibration_covers_true_doses").unwrap();

    // Optical density saturating with dose
    let (a, b, c) = (-0.8, -0.25, 0.9);
    let forward = |dose: f64| a * (b * dose).exp() + c;
    let sigma = 2e-3;
    let noise = Normal::new(0.0, sigma).unwrap();

    let path = tmp_dir.path().join("calibration.csv");
    let mut wtr = csv::Writer::from_path(&path).unwrap();
    for dose in [0.0, 0.5, 1.0, 1.5, 2.0, 3.0, 4.0, 5.0, 6.0, 8.0] {
        wtr.serialize(Row {
            predictor: dose,
            response: forward(dose) + noise.sample(&mut rng),
            uncertainty: sigma,
        })
        .unwrap();
    }
    wtr.flush().unwrap();

    let set = read_calibration_file(&path)?;
    assert!(set.has_uncertainties());
    let pipeline = Pipeline::calibrate(ParametricModel::Exponential, &set, &Config::default().fit)?;
    assert!(pipeline.fitted().absolute_sigma());

    for _ in 0..10 {
        let dose = rng.gen_range(0.5..6.0);
        let measurement = Measurement::new(forward(dose) + noise.sample(&mut rng), sigma)?;
        let estimate = pipeline.estimate(&measurement);
        assert!(estimate.is_valid());
        assert!(
            (estimate.value() - dose).abs() < 5.0 * estimate.uncertainty(),
            "dose {dose} outside {} ± {}",
            estimate.value(),
            estimate.uncertainty()
        );
    }
    Ok(())
}

/// Two Lorentzian bands whose intensity grows linearly with dose
fn band_spectrum(dose: f64) -> Spectrum {
    let intensity = 2.0f64.mul_add(dose, 1.0);
    let band = |x: f64, intensity: f64, centre: f64, width: f64| {
        2.0 * intensity / std::f64::consts::PI * width
            / 4.0f64.mul_add((x - centre).powi(2), width * width)
    };
    let x = (0..=240).map(|k| 560.0 + 0.5 * f64::from(k)).collect::<Vec<_>>();
    let y = x
        .iter()
        .map(|&x| band(x, intensity, 635.0, 14.0) + band(x, 0.4 * intensity, 585.0, 10.0))
        .collect();
    Spectrum::new(x, y).unwrap()
}

#[test]
fn trapezoid_spectra_are_calibrated_from_configuration() -> Result<()> {
    let tmp_dir = TempDir::new("trapezoid_spectra_are_calibrated_from_configuration").unwrap();
    let config_path = tmp_dir.path().join("dose.toml");
    std::fs::write(
        &config_path,
        r#"
[spectral]
window = { min = 565.0, max = 675.0 }
statistic = "trapezoid"
response_uncertainty = 0.002
doses = [0.0, 1.0, 2.0, 4.0]
"#,
    )?;
    let config = Config::from_file(&config_path)?;
    let spectral = config.spectral()?.clone();
    let spectra = spectral.doses.iter().map(|&dose| band_spectrum(dose)).collect::<Vec<_>>();
    let pipeline =
        SpectralPipeline::calibrate(spectral, &spectra, &config.fit, config.propagation)?;

    let samples = [
        ("low".to_string(), band_spectrum(0.5)),
        ("high".to_string(), band_spectrum(3.0)),
    ];
    let records = pipeline.estimate_batch(&samples);
    approx::assert_relative_eq!(records[0].dose, 0.5, max_relative = 1e-8);
    approx::assert_relative_eq!(records[1].dose, 3.0, max_relative = 1e-8);
    assert!(records.iter().all(|r| r.valid && r.dose_uncertainty > 0.0));

    let output = tmp_dir.path().join("estimates.csv");
    write_estimates_file(&output, &records)?;
    let text = std::fs::read_to_string(&output)?;
    let lines = text.lines().collect::<Vec<_>>();
    assert_eq!(lines.len(), 3);
    assert!(lines[1].starts_with("low,"));
    assert!(lines[2].starts_with("high,"));
    Ok(())
}
