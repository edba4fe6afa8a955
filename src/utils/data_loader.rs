//! Data loading utilities

use crate::error::{ExplainError, Result};
use ndarray::Array2;
use polars::prelude::*;
use std::fs::File;
use std::path::Path;
use tracing::debug;

/// Numeric dataset extracted from a file
#[derive(Debug, Clone)]
pub struct Dataset {
    /// Feature matrix (n_samples, n_features)
    pub data: Array2<f64>,
    /// Column names in matrix order
    pub feature_names: Vec<String>,
}

/// CSV loader producing feature matrices
pub struct DataLoader {
    /// Field separator
    delimiter: u8,
    /// Whether the first row is a header
    has_header: bool,
}

impl Default for DataLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl DataLoader {
    /// Create a new data loader
    pub fn new() -> Self {
        Self {
            delimiter: b',',
            has_header: true,
        }
    }

    /// Set field separator
    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    /// Set whether the first row is a header
    pub fn with_header(mut self, has_header: bool) -> Self {
        self.has_header = has_header;
        self
    }

    /// Load a CSV file
    pub fn load_csv(&self, path: impl AsRef<Path>) -> Result<DataFrame> {
        let file = File::open(path.as_ref())
            .map_err(|e| ExplainError::DataError(format!("{}: {}", path.as_ref().display(), e)))?;

        let parse_opts = CsvParseOptions::default().with_separator(self.delimiter);
        let df = CsvReadOptions::default()
            .with_has_header(self.has_header)
            .with_infer_schema_length(Some(100))
            .with_parse_options(parse_opts)
            .into_reader_with_file_handle(file)
            .finish()?;

        debug!(rows = df.height(), cols = df.width(), "Loaded CSV");
        Ok(df)
    }

    /// Load a CSV file as a numeric matrix, optionally restricted to `columns`
    pub fn load_matrix(&self, path: impl AsRef<Path>, columns: Option<&[String]>) -> Result<Dataset> {
        let df = self.load_csv(path)?;
        let names: Vec<String> = match columns {
            Some(cols) => cols.to_vec(),
            None => df
                .get_column_names()
                .into_iter()
                .map(|s| s.to_string())
                .collect(),
        };
        let data = columns_to_array2(&df, &names)?;
        Ok(Dataset {
            data,
            feature_names: names,
        })
    }
}

/// Extract named columns from a DataFrame into a row-major `Array2<f64>`.
///
/// Nulls are read as `NaN`.
pub fn columns_to_array2(df: &DataFrame, col_names: &[String]) -> Result<Array2<f64>> {
    let n_rows = df.height();
    let col_data: Vec<Vec<f64>> = col_names
        .iter()
        .map(|col_name| {
            let column = df
                .column(col_name)
                .map_err(|_| ExplainError::FeatureNotFound(col_name.clone()))?;
            let values = column
                .cast(&DataType::Float64)?
                .f64()?
                .into_iter()
                .map(|v| v.unwrap_or(f64::NAN))
                .collect();
            Ok(values)
        })
        .collect::<Result<Vec<Vec<f64>>>>()?;

    let col_refs: Vec<&[f64]> = col_data.iter().map(|c| c.as_slice()).collect();
    Ok(Array2::from_shape_fn((n_rows, col_names.len()), |(r, c)| {
        col_refs[c][r]
    }))
}
