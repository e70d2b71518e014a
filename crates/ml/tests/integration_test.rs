//! End-to-end training runs
//!
//! Trains both tasks on generated CSV files and checks determinism,
//! persistence and failure behavior.

use anyhow::Result;
use irrigation_ml::dataset::Dataset;
use irrigation_ml::{
    load_pipeline, ArtifactStore, DatasetError, PipelineConfig, PipelineError, RunState, Sample,
    Task, Trainer, TrainerError, TrainingConfig, ValidationMetrics,
};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const SOILS: [&str; 3] = ["Loamy", "Sandy", "Clayey"];
const CROPS: [&str; 3] = ["Wheat", "Maize", "Paddy"];

/// 100 rows close to {25, 60, 30, Loamy, Wheat} with some structure.
fn write_dataset(dir: &Path) -> Result<PathBuf> {
    let path = dir.join("data_core.csv");
    let mut file = fs::File::create(&path)?;
    writeln!(file, "Temparature,Humidity ,Moisture,Soil Type,Crop Type")?;
    for i in 0..100 {
        let soil = SOILS[i % 3];
        let crop = CROPS[(i / 3) % 3];
        let temperature = 25.0 + (i % 5) as f64;
        let humidity = 60.0 + (i % 7) as f64;
        let moisture = 30.0 + (i % 3) as f64 * 5.0 + (i % 5) as f64;
        writeln!(file, "{temperature},{humidity},{moisture},{soil},{crop}")?;
    }
    file.flush()?;
    Ok(path)
}

fn config(task: Task, data: &Path, output: &Path) -> TrainingConfig {
    let mut config = TrainingConfig::new(task);
    config.data_path = data.to_path_buf();
    config.output_dir = output.to_path_buf();
    config.params.n_estimators = 10;
    config
}

#[test]
fn test_moisture_training_end_to_end() -> Result<()> {
    let dir = TempDir::new()?;
    let data = write_dataset(dir.path())?;
    let output = dir.path().join("models");

    let report = Trainer::new(config(Task::MoistureRegression, &data, &output)).run()?;

    let metadata: serde_json::Value =
        serde_json::from_slice(&fs::read(output.join("plant_model_metadata.json"))?)?;
    assert_eq!(metadata["target"], "Moisture");
    assert_eq!(metadata["model_type"], "RandomForestRegressor");
    let r2 = metadata["validation_metrics"]["r2"]
        .as_f64()
        .expect("r2 should be a number");
    assert!(r2.is_finite() && r2 <= 1.0, "r2 out of range: {}", r2);
    assert_eq!(
        metadata["cross_validation_scores"].as_array().map(Vec::len),
        Some(5)
    );
    assert_eq!(metadata["features"][0], "Temparature");
    assert_eq!(metadata["artifact_hash"], report.artifact.hash.as_str());

    let importances: f64 = report.metadata.feature_importances.values().sum();
    assert!((importances - 1.0).abs() < 1e-9);
    assert_eq!(report.metadata.n_test_samples, 20);
    Ok(())
}

#[test]
fn test_crop_training_writes_predictions() -> Result<()> {
    let dir = TempDir::new()?;
    let data = write_dataset(dir.path())?;
    let output = dir.path().join("models");
    let predictions = dir.path().join("processed/predicted.csv");

    let mut config = config(Task::CropClassification, &data, &output);
    config.predictions_out = Some(predictions.clone());
    let report = Trainer::new(config).run()?;

    assert!(output.join("crop_model.bin").exists());
    assert!(matches!(
        report.metadata.validation_metrics,
        ValidationMetrics::Classification { .. }
    ));
    let class_report = report
        .classification_report
        .expect("classification runs carry a report");
    assert!(class_report.accuracy >= 0.0 && class_report.accuracy <= 1.0);

    let mut reader = csv::Reader::from_path(&predictions)?;
    let headers = reader.headers()?.clone();
    assert_eq!(headers.get(5), Some("Predicted Crop Type"));
    let rows: Vec<csv::StringRecord> = reader.records().collect::<Result<_, _>>()?;
    assert_eq!(rows.len(), 100);
    assert!(rows
        .iter()
        .all(|r| r.get(5).is_some_and(|p| CROPS.contains(&p))));
    Ok(())
}

#[test]
fn test_same_seed_same_predictions() -> Result<()> {
    let dir = TempDir::new()?;
    let data = write_dataset(dir.path())?;
    let dataset = Dataset::load(&data)?;
    let rows = dataset.observations();
    let (train, test) = rows.split_at(80);

    let config = TrainingConfig::new(Task::MoistureRegression);
    let mut params = config.params.clone();
    params.n_estimators = 15;

    let first = PipelineConfig::new(Task::MoistureRegression, params.clone(), rows).fit(train)?;
    let second = PipelineConfig::new(Task::MoistureRegression, params, rows).fit(train)?;

    let a = first.predict_raw(test)?;
    let b = second.predict_raw(test)?;
    for (i, (x, y)) in a.iter().zip(&b).enumerate() {
        assert_eq!(x.to_bits(), y.to_bits(), "Prediction {} should be bit-identical", i);
    }
    Ok(())
}

#[test]
fn test_persist_then_reload_predicts_identically() -> Result<()> {
    let dir = TempDir::new()?;
    let data = write_dataset(dir.path())?;
    let output = dir.path().join("models");

    Trainer::new(config(Task::MoistureRegression, &data, &output)).run()?;
    let store = ArtifactStore::new(&output);
    let first = store.load(Task::MoistureRegression)?;
    let second = load_pipeline(output.join("plant_model.bin"))?;
    assert_eq!(first, second, "Loading twice should give the same pipeline");

    let dataset = Dataset::load(&data)?;
    for observation in dataset.observations().iter().take(10) {
        let sample = Sample::from(observation);
        assert_eq!(
            first.predict_moisture(&sample)?.to_bits(),
            second.predict_moisture(&sample)?.to_bits()
        );
    }

    let unseen = Sample {
        temperature: Some(25.0),
        humidity: Some(60.0),
        soil_type: Some("Peaty".to_string()),
        crop_type: Some("Barley".to_string()),
        ..Default::default()
    };
    assert!(first.predict_moisture(&unseen)?.is_finite());
    Ok(())
}

#[test]
fn test_failed_run_leaves_no_artifact() -> Result<()> {
    let dir = TempDir::new()?;
    let data = dir.path().join("broken.csv");
    fs::write(&data, "Temparature,Humidity,Soil Type,Crop Type\n25,60,Loamy,Wheat\n")?;
    let output = dir.path().join("models");

    let mut trainer = Trainer::new(config(Task::MoistureRegression, &data, &output));
    let err = trainer.run().unwrap_err();

    match err {
        TrainerError::Dataset(DatasetError::MissingColumns(cols)) => {
            assert_eq!(cols, vec!["Moisture".to_string()]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(trainer.state().is_none());
    assert!(!output.join("plant_model.bin").exists());
    assert!(!output.join("plant_model_metadata.json").exists());
    Ok(())
}

#[test]
fn test_run_failing_during_evaluation_leaves_no_artifact() -> Result<()> {
    let dir = TempDir::new()?;
    let data = dir.path().join("tiny.csv");
    fs::write(
        &data,
        "Temparature,Humidity,Moisture,Soil Type,Crop Type\n\
         25,60,30,Loamy,Wheat\n\
         27,62,35,Sandy,Maize\n\
         29,64,40,Loamy,Wheat\n\
         31,66,45,Sandy,Maize\n",
    )?;
    let output = dir.path().join("models");

    // Four rows split and fit, but cannot be cut into five folds.
    let mut trainer = Trainer::new(config(Task::MoistureRegression, &data, &output));
    let err = trainer.run().unwrap_err();

    assert!(
        matches!(err, TrainerError::Training(PipelineError::InsufficientData(_))),
        "unexpected error: {err}"
    );
    assert_eq!(trainer.state(), Some(RunState::Fit));
    assert!(!output.join("plant_model.bin").exists());
    assert!(!output.join("plant_model_metadata.json").exists());
    Ok(())
}

#[test]
fn test_missing_dataset_is_not_found() {
    let dir = TempDir::new().unwrap();
    let config = config(
        Task::CropClassification,
        &dir.path().join("absent.csv"),
        &dir.path().join("models"),
    );
    let err = Trainer::new(config).run().unwrap_err();
    assert!(matches!(err, TrainerError::Dataset(DatasetError::NotFound(_))));
}
