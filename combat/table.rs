//! # Tabular Adapter
//!
//! Maps a labeled table onto the numeric fit/transform interface. Columns are
//! addressed by name: one site column, optional discrete and continuous covariate
//! columns, and columns excluded from harmonization altogether. Every other column is
//! a feature.
//!
//! Excluded columns (including the site and covariate columns) are set aside before
//! harmonization and, depending on [`Retain`], put back at their original positions
//! in the output.

use crate::data::CombatInput;
use crate::estimate::CombatError;
use crate::model::{CombatConfig, CombatTransformer, FittedModel, ModelError};
use ndarray::Array2;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

/// A comprehensive error type for all table loading and harmonization failures.
#[derive(Error, Debug)]
pub enum TableError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error(
        "The column '{0}' was not found in the input table. Please check spelling and case."
    )]
    ColumnNotFound(String),
    #[error(
        "The column '{column_name}' could not be converted to the expected type '{expected_type}'. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        expected_type: &'static str,
        found_type: String,
    },
    #[error(
        "Missing or null values were found in the column '{0}'. Harmonization requires complete data."
    )]
    MissingValues(String),
    #[error(
        "The table has no feature columns left once site, covariate and excluded columns are set aside."
    )]
    NoFeatureColumns,
    #[error(
        "The feature columns differ from those seen during fit. Expected [{}], found [{}].",
        .expected.join(", "),
        .found.join(", ")
    )]
    FeatureColumnsMismatch {
        expected: Vec<String>,
        found: Vec<String>,
    },
    #[error(transparent)]
    Combat(#[from] CombatError),
    #[error(transparent)]
    Model(#[from] ModelError),
}

/// Which columns play which role in a table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ColumnRoles {
    pub sites: String,
    #[serde(default)]
    pub discrete_covariates: Vec<String>,
    #[serde(default)]
    pub continuous_covariates: Vec<String>,
    /// Columns left out of harmonization entirely (e.g. sample identifiers).
    #[serde(default)]
    pub excluded_columns: Vec<String>,
}

impl ColumnRoles {
    pub fn new(sites: impl Into<String>) -> Self {
        Self {
            sites: sites.into(),
            ..Self::default()
        }
    }

    /// Every column that is not a feature, in role order.
    pub fn non_feature_columns(&self) -> Vec<&str> {
        std::iter::once(self.sites.as_str())
            .chain(self.discrete_covariates.iter().map(String::as_str))
            .chain(self.continuous_covariates.iter().map(String::as_str))
            .chain(self.excluded_columns.iter().map(String::as_str))
            .collect()
    }
}

/// Which non-feature columns are put back into a transformed table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Retain {
    /// Only harmonized features are returned.
    #[default]
    None,
    /// Every non-feature column is re-inserted.
    All,
    /// The named non-feature columns are re-inserted.
    Only(Vec<String>),
}

impl Retain {
    fn keeps(&self, column: &str) -> bool {
        match self {
            Retain::None => false,
            Retain::All => true,
            Retain::Only(names) => names.iter().any(|n| n == column),
        }
    }
}

/// The persisted form of a fitted harmonizer: the column manifest plus the model.
#[derive(Debug, Serialize, Deserialize)]
struct HarmonizerArtifact {
    feature_columns: Vec<String>,
    roles: ColumnRoles,
    model: FittedModel,
}

/// The numeric pieces of a table, owned so that a [`CombatInput`] can borrow them.
#[derive(Debug)]
struct ExtractedTable {
    feature_columns: Vec<String>,
    features: Array2<f64>,
    sites: Vec<String>,
    discrete: Option<Array2<String>>,
    continuous: Option<Array2<f64>>,
}

impl ExtractedTable {
    fn input(&self) -> CombatInput<'_> {
        let mut input = CombatInput::new(self.features.view(), &self.sites);
        if let Some(discrete) = &self.discrete {
            input = input.with_discrete(discrete.view());
        }
        if let Some(continuous) = &self.continuous {
            input = input.with_continuous(continuous.view());
        }
        input
    }
}

/// ComBat over a polars [`DataFrame`].
#[derive(Debug, Clone)]
pub struct CombatHarmonizer {
    roles: ColumnRoles,
    retain: Retain,
    transformer: CombatTransformer,
    feature_columns: Option<Vec<String>>,
}

impl CombatHarmonizer {
    pub fn new(roles: ColumnRoles) -> Self {
        Self {
            roles,
            retain: Retain::None,
            transformer: CombatTransformer::default(),
            feature_columns: None,
        }
    }

    /// Replaces the fitting configuration. Any existing fit is discarded.
    pub fn with_config(mut self, config: CombatConfig) -> Self {
        self.transformer = CombatTransformer::new(config);
        self.feature_columns = None;
        self
    }

    pub fn with_retain(mut self, retain: Retain) -> Self {
        self.retain = retain;
        self
    }

    pub fn roles(&self) -> &ColumnRoles {
        &self.roles
    }

    pub fn retain(&self) -> &Retain {
        &self.retain
    }

    pub fn is_fitted(&self) -> bool {
        self.transformer.is_fitted()
    }

    pub fn model(&self) -> Option<&FittedModel> {
        self.transformer.model()
    }

    /// Feature column names seen during fit, in table order.
    pub fn feature_columns(&self) -> Option<&[String]> {
        self.feature_columns.as_deref()
    }

    pub fn fit(&mut self, df: &DataFrame) -> Result<(), TableError> {
        self.reset();
        let table = self.extract(df)?;
        self.transformer.fit(&table.input())?;
        self.feature_columns = Some(table.feature_columns);
        Ok(())
    }

    /// Harmonizes the feature columns of `df`. Non-feature columns are re-inserted at
    /// their original positions according to [`Retain`].
    pub fn transform(&self, df: &DataFrame) -> Result<DataFrame, TableError> {
        let expected = self
            .feature_columns
            .as_ref()
            .ok_or(TableError::Combat(CombatError::NotFitted))?;
        let table = self.extract(df)?;
        if &table.feature_columns != expected {
            return Err(TableError::FeatureColumnsMismatch {
                expected: expected.clone(),
                found: table.feature_columns,
            });
        }

        let harmonized = self.transformer.transform(&table.input())?;
        log::info!(
            "Harmonized {} samples across {} feature columns.",
            harmonized.nrows(),
            harmonized.ncols()
        );

        let excluded: HashSet<&str> = self.roles.non_feature_columns().into_iter().collect();
        let mut columns: Vec<Column> = Vec::with_capacity(df.width());
        let mut feature = 0;
        for name in df.get_column_names() {
            let name_str = name.as_str();
            if excluded.contains(name_str) {
                if self.retain.keeps(name_str) {
                    columns.push(df.column(name_str)?.clone());
                }
            } else {
                let values = harmonized.column(feature).to_vec();
                columns.push(Series::new(name.clone(), values).into());
                feature += 1;
            }
        }
        Ok(DataFrame::new(columns)?)
    }

    pub fn fit_transform(&mut self, df: &DataFrame) -> Result<DataFrame, TableError> {
        self.fit(df)?;
        self.transform(df)
    }

    pub fn reset(&mut self) {
        self.transformer.reset();
        self.feature_columns = None;
    }

    /// Saves the column manifest and fitted model as TOML.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), TableError> {
        let (Some(model), Some(feature_columns)) = (self.model(), &self.feature_columns) else {
            return Err(TableError::Combat(CombatError::NotFitted));
        };
        let artifact = HarmonizerArtifact {
            feature_columns: feature_columns.clone(),
            roles: self.roles.clone(),
            model: model.clone(),
        };
        let toml_string = toml::to_string_pretty(&artifact).map_err(ModelError::from)?;
        let mut file = BufWriter::new(File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    /// Loads a harmonizer saved with [`CombatHarmonizer::save`]. The result is fitted
    /// and retains no extra columns until told otherwise.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, TableError> {
        let toml_string = fs::read_to_string(path)?;
        let artifact: HarmonizerArtifact =
            toml::from_str(&toml_string).map_err(ModelError::from)?;
        Ok(Self {
            roles: artifact.roles,
            retain: Retain::None,
            transformer: CombatTransformer::from_model(artifact.model),
            feature_columns: Some(artifact.feature_columns),
        })
    }

    fn extract(&self, df: &DataFrame) -> Result<ExtractedTable, TableError> {
        let present: HashSet<&str> = df.get_column_names().into_iter().map(|c| c.as_str()).collect();
        let non_features = self.roles.non_feature_columns();
        if let Some(missing) = non_features.iter().find(|name| !present.contains(*name)) {
            return Err(TableError::ColumnNotFound(missing.to_string()));
        }

        let excluded: HashSet<&str> = non_features.into_iter().collect();
        let feature_columns: Vec<String> = df
            .get_column_names()
            .into_iter()
            .map(|c| c.as_str())
            .filter(|c| !excluded.contains(c))
            .map(str::to_string)
            .collect();
        if feature_columns.is_empty() {
            return Err(TableError::NoFeatureColumns);
        }

        let n = df.height();
        let features = numeric_block(df, &feature_columns, n)?;
        let sites = extract_labels(df, &self.roles.sites)?;

        let discrete = if self.roles.discrete_covariates.is_empty() {
            None
        } else {
            let columns = self
                .roles
                .discrete_covariates
                .iter()
                .map(|name| extract_labels(df, name))
                .collect::<Result<Vec<_>, _>>()?;
            Some(Array2::from_shape_fn((n, columns.len()), |(i, j)| {
                columns[j][i].clone()
            }))
        };

        let continuous = if self.roles.continuous_covariates.is_empty() {
            None
        } else {
            Some(numeric_block(df, &self.roles.continuous_covariates, n)?)
        };

        Ok(ExtractedTable {
            feature_columns,
            features,
            sites,
            discrete,
            continuous,
        })
    }
}

/// Reads a tab-separated file with a header row.
pub fn load_table(path: impl AsRef<Path>) -> Result<DataFrame, TableError> {
    let path = path.as_ref();
    log::info!("Loading table from '{}'", path.display());
    let file = File::open(path)?;
    let df = CsvReadOptions::default()
        .with_has_header(true)
        .map_parse_options(|options| options.with_separator(b'\t'))
        .into_reader_with_file_handle(file)
        .finish()?;
    log::info!("Loaded {} rows and {} columns.", df.height(), df.width());
    Ok(df)
}

/// Writes `df` as a tab-separated file with a header row.
pub fn write_table(df: &mut DataFrame, path: impl AsRef<Path>) -> Result<(), TableError> {
    let file = File::create(path)?;
    CsvWriter::new(BufWriter::new(file))
        .with_separator(b'\t')
        .finish(df)?;
    Ok(())
}

fn extract_f64_column(df: &DataFrame, name: &str) -> Result<Vec<f64>, TableError> {
    let column = df
        .column(name)
        .map_err(|_| TableError::ColumnNotFound(name.to_string()))?;
    if column.null_count() > 0 {
        return Err(TableError::MissingValues(name.to_string()));
    }
    let wrong_type = || TableError::ColumnWrongType {
        column_name: name.to_string(),
        expected_type: "f64 (numeric)",
        found_type: column.dtype().to_string(),
    };
    let casted = column.cast(&DataType::Float64).map_err(|_| wrong_type())?;
    // A non-strict cast turns unparseable text into nulls.
    if casted.null_count() > 0 {
        return Err(wrong_type());
    }
    let chunked = casted.f64()?.rechunk();
    Ok(chunked.into_no_null_iter().collect())
}

fn numeric_block(df: &DataFrame, names: &[String], n: usize) -> Result<Array2<f64>, TableError> {
    let mut block = Array2::zeros((n, names.len()));
    for (j, name) in names.iter().enumerate() {
        let values = extract_f64_column(df, name)?;
        for (cell, value) in block.column_mut(j).iter_mut().zip(values) {
            *cell = value;
        }
    }
    Ok(block)
}

fn extract_labels(df: &DataFrame, name: &str) -> Result<Vec<String>, TableError> {
    let column = df
        .column(name)
        .map_err(|_| TableError::ColumnNotFound(name.to_string()))?;
    if column.null_count() > 0 {
        return Err(TableError::MissingValues(name.to_string()));
    }
    let labels = column.cast(&DataType::String)?;
    Ok(labels
        .str()?
        .into_no_null_iter()
        .map(str::to_string)
        .collect())
}
