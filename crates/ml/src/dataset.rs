//! CSV dataset loading and validation
//!
//! Reads the plant observation table (`Temparature, Humidity, Moisture,
//! Soil Type, Crop Type`), imputes missing numeric cells with column means
//! and provides the filtering helpers used by the `stats` command.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io::{Read, Write};
use std::path::Path;
use tracing::{debug, warn};

use crate::errors::DatasetError;

/// Columns of the plant observation table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Column {
    Temperature,
    Humidity,
    Moisture,
    SoilType,
    CropType,
}

impl Column {
    pub const ALL: [Column; 5] = [
        Column::Temperature,
        Column::Humidity,
        Column::Moisture,
        Column::SoilType,
        Column::CropType,
    ];

    /// Header name in the source file. `Temparature` is spelled the way the
    /// existing data files spell it.
    pub fn header(self) -> &'static str {
        match self {
            Column::Temperature => "Temparature",
            Column::Humidity => "Humidity",
            Column::Moisture => "Moisture",
            Column::SoilType => "Soil Type",
            Column::CropType => "Crop Type",
        }
    }

    pub fn is_categorical(self) -> bool {
        matches!(self, Column::SoilType | Column::CropType)
    }
}

/// A row as read from disk; any cell may be missing.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawObservation {
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub moisture: Option<f64>,
    pub soil_type: Option<String>,
    pub crop_type: Option<String>,
}

/// A validated observation with every column present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub temperature: f64,
    pub humidity: f64,
    pub moisture: f64,
    pub soil_type: String,
    pub crop_type: String,
}

impl Observation {
    pub fn numeric(&self, column: Column) -> Option<f64> {
        match column {
            Column::Temperature => Some(self.temperature),
            Column::Humidity => Some(self.humidity),
            Column::Moisture => Some(self.moisture),
            Column::SoilType | Column::CropType => None,
        }
    }

    pub fn category(&self, column: Column) -> Option<&str> {
        match column {
            Column::SoilType => Some(&self.soil_type),
            Column::CropType => Some(&self.crop_type),
            _ => None,
        }
    }
}

/// The table exactly as loaded, before validation.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ObservationTable {
    rows: Vec<RawObservation>,
}

impl ObservationTable {
    pub fn new(rows: Vec<RawObservation>) -> Self {
        Self { rows }
    }

    /// Load the table from a CSV file.
    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Self, DatasetError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(DatasetError::NotFound(path.to_path_buf()));
        }

        let file = std::fs::File::open(path)?;
        let table = Self::from_reader(file)?;
        debug!("Read {} rows from {}", table.len(), path.display());
        Ok(table)
    }

    /// Load the table from any CSV source with a header row.
    pub fn from_reader<R: Read>(source: R) -> Result<Self, DatasetError> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(source);

        let headers = reader.headers()?.clone();
        let mut positions = [0usize; 5];
        let mut missing = Vec::new();
        for (slot, column) in positions.iter_mut().zip(Column::ALL) {
            match headers.iter().position(|h| h == column.header()) {
                Some(idx) => *slot = idx,
                None => missing.push(column.header().to_string()),
            }
        }
        if !missing.is_empty() {
            return Err(DatasetError::MissingColumns(missing));
        }

        let [temp_idx, humidity_idx, moisture_idx, soil_idx, crop_idx] = positions;
        let mut rows = Vec::new();

        for (record_idx, record) in reader.records().enumerate() {
            let record = record?;
            // Line numbers are 1-based and the header occupies line 1.
            let line = record_idx + 2;

            rows.push(RawObservation {
                temperature: parse_numeric(record.get(temp_idx), line, Column::Temperature)?,
                humidity: parse_numeric(record.get(humidity_idx), line, Column::Humidity)?,
                moisture: parse_numeric(record.get(moisture_idx), line, Column::Moisture)?,
                soil_type: parse_category(record.get(soil_idx)),
                crop_type: parse_category(record.get(crop_idx)),
            });
        }

        Ok(Self { rows })
    }

    pub fn rows(&self) -> &[RawObservation] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Number of missing numeric cells across the table.
    pub fn missing_numeric_count(&self) -> usize {
        self.rows
            .iter()
            .map(|r| {
                [r.temperature, r.humidity, r.moisture]
                    .iter()
                    .filter(|v| v.is_none())
                    .count()
            })
            .sum()
    }

    /// Validate the table: reject empty input, impute numeric gaps with the
    /// column mean and drop rows without a soil or crop type.
    pub fn validate(&self) -> Result<Dataset, DatasetError> {
        if self.rows.is_empty() {
            return Err(DatasetError::Empty);
        }

        let missing = self.missing_numeric_count();
        let (temperature_fill, humidity_fill, moisture_fill) = if missing > 0 {
            warn!(
                "Missing data detected ({} cells). Filling missing values with column means.",
                missing
            );
            (
                column_mean(self.rows.iter().map(|r| r.temperature), Column::Temperature)?,
                column_mean(self.rows.iter().map(|r| r.humidity), Column::Humidity)?,
                column_mean(self.rows.iter().map(|r| r.moisture), Column::Moisture)?,
            )
        } else {
            (0.0, 0.0, 0.0)
        };

        let mut dropped = 0usize;
        let observations: Vec<Observation> = self
            .rows
            .iter()
            .filter_map(|row| {
                let (Some(soil_type), Some(crop_type)) = (&row.soil_type, &row.crop_type) else {
                    dropped += 1;
                    return None;
                };
                Some(Observation {
                    temperature: row.temperature.unwrap_or(temperature_fill),
                    humidity: row.humidity.unwrap_or(humidity_fill),
                    moisture: row.moisture.unwrap_or(moisture_fill),
                    soil_type: soil_type.clone(),
                    crop_type: crop_type.clone(),
                })
            })
            .collect();

        if dropped > 0 {
            warn!("Dropped {} rows without a soil or crop type", dropped);
        }
        if observations.is_empty() {
            return Err(DatasetError::Empty);
        }

        Ok(Dataset::new(observations))
    }
}

fn parse_numeric(
    cell: Option<&str>,
    line: usize,
    column: Column,
) -> Result<Option<f64>, DatasetError> {
    let Some(cell) = cell.filter(|c| !c.is_empty()) else {
        return Ok(None);
    };
    let invalid = || DatasetError::InvalidValue {
        row: line,
        column: column.header().to_string(),
        value: cell.to_string(),
    };
    let value = cell.parse::<f64>().map_err(|_| invalid())?;
    if value.is_nan() {
        return Ok(None);
    }
    // "inf" parses, but would poison every mean and metric downstream.
    if !value.is_finite() {
        return Err(invalid());
    }
    Ok(Some(value))
}

fn parse_category(cell: Option<&str>) -> Option<String> {
    cell.filter(|c| !c.is_empty()).map(str::to_string)
}

fn column_mean(
    values: impl Iterator<Item = Option<f64>>,
    column: Column,
) -> Result<f64, DatasetError> {
    let (sum, count) = values
        .flatten()
        .fold((0.0f64, 0usize), |(sum, count), v| (sum + v, count + 1));
    if count == 0 {
        return Err(DatasetError::ColumnAllMissing(column.header().to_string()));
    }
    Ok(sum / count as f64)
}

/// Validated observations ready for training.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Dataset {
    observations: Vec<Observation>,
}

impl Dataset {
    pub fn new(observations: Vec<Observation>) -> Self {
        Self { observations }
    }

    /// Load and validate in one step.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, DatasetError> {
        ObservationTable::from_csv(path)?.validate()
    }

    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    /// Rows at the given indices, in index order.
    pub fn select(&self, indices: &[usize]) -> Vec<Observation> {
        indices
            .iter()
            .filter_map(|&i| self.observations.get(i).cloned())
            .collect()
    }

    /// Rows matching every provided filter.
    pub fn filter(&self, crop_type: Option<&str>, soil_type: Option<&str>) -> Dataset {
        let observations = self
            .observations
            .iter()
            .filter(|o| crop_type.map_or(true, |c| o.crop_type == c))
            .filter(|o| soil_type.map_or(true, |s| o.soil_type == s))
            .cloned()
            .collect();
        Dataset::new(observations)
    }

    /// Sorted distinct values of a categorical column.
    pub fn categories(&self, column: Column) -> Vec<String> {
        self.observations
            .iter()
            .filter_map(|o| o.category(column))
            .map(str::to_string)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Average temperature per crop type, ascending by temperature.
    pub fn mean_temperature_by_crop(&self) -> Vec<(String, f64)> {
        let mut sums: BTreeMap<&str, (f64, usize)> = BTreeMap::new();
        for o in &self.observations {
            let entry = sums.entry(o.crop_type.as_str()).or_insert((0.0, 0));
            entry.0 += o.temperature;
            entry.1 += 1;
        }

        let mut means: Vec<(String, f64)> = sums
            .into_iter()
            .map(|(crop, (sum, count))| (crop.to_string(), sum / count as f64))
            .collect();
        means.sort_by(|a, b| a.1.total_cmp(&b.1));
        means
    }

    /// Write the observations plus one extra column of per-row values.
    pub fn write_with_column<W: Write>(
        &self,
        writer: W,
        header: &str,
        values: &[String],
    ) -> Result<(), csv::Error> {
        let mut out = csv::Writer::from_writer(writer);
        let mut headers: Vec<&str> = Column::ALL.iter().map(|c| c.header()).collect();
        headers.push(header);
        out.write_record(&headers)?;

        for (o, extra) in self.observations.iter().zip(values) {
            out.write_record([
                o.temperature.to_string(),
                o.humidity.to_string(),
                o.moisture.to_string(),
                o.soil_type.clone(),
                o.crop_type.clone(),
                extra.clone(),
            ])?;
        }
        out.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_test_csv() -> Result<NamedTempFile> {
        let mut file = NamedTempFile::new()?;
        writeln!(file, "Temparature,Humidity ,Moisture,Soil Type,Crop Type,Nitrogen")?;
        writeln!(file, "26,52,38,Sandy,Maize,37")?;
        writeln!(file, "29,52,45,Loamy,Sugarcane,12")?;
        writeln!(file, "34,65,62,Black,Cotton,7")?;
        file.flush()?;
        Ok(file)
    }

    #[test]
    fn test_load_csv() -> Result<()> {
        let file = create_test_csv()?;
        let table = ObservationTable::from_csv(file.path())?;

        assert_eq!(table.len(), 3);
        assert_eq!(table.rows()[0].temperature, Some(26.0));
        assert_eq!(table.rows()[0].humidity, Some(52.0));
        assert_eq!(table.rows()[2].crop_type.as_deref(), Some("Cotton"));
        Ok(())
    }

    #[test]
    fn test_reload_is_identical() -> Result<()> {
        let file = create_test_csv()?;
        let first = ObservationTable::from_csv(file.path())?;
        let second = ObservationTable::from_csv(file.path())?;
        assert_eq!(first, second);
        Ok(())
    }

    #[test]
    fn test_missing_file() {
        let err = ObservationTable::from_csv("/definitely/not/here.csv").unwrap_err();
        assert!(matches!(err, DatasetError::NotFound(_)));
    }

    #[test]
    fn test_missing_columns_are_listed() {
        let csv = "Temparature,Humidity,Soil Type\n25,60,Loamy\n";
        let err = ObservationTable::from_reader(csv.as_bytes()).unwrap_err();
        match err {
            DatasetError::MissingColumns(cols) => {
                assert_eq!(cols, vec!["Moisture".to_string(), "Crop Type".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_invalid_number_reports_position() {
        let csv = "Temparature,Humidity,Moisture,Soil Type,Crop Type\n25,wet,30,Loamy,Wheat\n";
        let err = ObservationTable::from_reader(csv.as_bytes()).unwrap_err();
        match err {
            DatasetError::InvalidValue { row, column, value } => {
                assert_eq!(row, 2);
                assert_eq!(column, "Humidity");
                assert_eq!(value, "wet");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_infinite_values_are_rejected() {
        for cell in ["inf", "-inf", "infinity"] {
            let csv = format!(
                "Temparature,Humidity,Moisture,Soil Type,Crop Type\n\
                 25,60,30,Loamy,Wheat\n\
                 26,61,{cell},Sandy,Maize\n"
            );
            match ObservationTable::from_reader(csv.as_bytes()) {
                Err(DatasetError::InvalidValue { row, column, value }) => {
                    assert_eq!(row, 3);
                    assert_eq!(column, "Moisture");
                    assert_eq!(value, cell);
                }
                other => panic!("expected InvalidValue for {cell}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_mean_imputation() -> Result<()> {
        let csv = "Temparature,Humidity,Moisture,Soil Type,Crop Type\n\
                   20,50,30,Loamy,Wheat\n\
                   ,70,NaN,Sandy,Maize\n\
                   30,60,40,Clayey,Paddy\n";
        let dataset = ObservationTable::from_reader(csv.as_bytes())?.validate()?;

        assert_eq!(dataset.len(), 3);
        assert_eq!(dataset.observations()[1].temperature, 25.0);
        assert_eq!(dataset.observations()[1].moisture, 35.0);
        Ok(())
    }

    #[test]
    fn test_rows_without_category_are_dropped() -> Result<()> {
        let csv = "Temparature,Humidity,Moisture,Soil Type,Crop Type\n\
                   20,50,30,Loamy,Wheat\n\
                   22,55,31,,Maize\n";
        let dataset = ObservationTable::from_reader(csv.as_bytes())?.validate()?;
        assert_eq!(dataset.len(), 1);
        Ok(())
    }

    #[test]
    fn test_empty_table_is_rejected() {
        let csv = "Temparature,Humidity,Moisture,Soil Type,Crop Type\n";
        let table = ObservationTable::from_reader(csv.as_bytes()).unwrap();
        assert!(matches!(table.validate(), Err(DatasetError::Empty)));
    }

    #[test]
    fn test_filter_and_stats() -> Result<()> {
        let file = create_test_csv()?;
        let dataset = Dataset::load(file.path())?;

        assert_eq!(dataset.filter(Some("Maize"), None).len(), 1);
        assert_eq!(dataset.filter(Some("Maize"), Some("Loamy")).len(), 0);
        assert_eq!(dataset.filter(None, None).len(), 3);
        assert_eq!(
            dataset.categories(Column::SoilType),
            vec!["Black", "Loamy", "Sandy"]
        );

        let means = dataset.mean_temperature_by_crop();
        assert_eq!(means.first().map(|m| m.0.as_str()), Some("Maize"));
        assert_eq!(means.last().map(|m| m.0.as_str()), Some("Cotton"));
        Ok(())
    }
}
