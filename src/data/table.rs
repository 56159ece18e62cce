//! Column-typed observation tables.

use crate::error::{LmmError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// A single cell value: categorical, continuous, or missing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Variable {
    /// Categorical variable with string levels.
    Categorical(String),
    /// Continuous numeric variable.
    Continuous(f64),
    /// Missing value.
    Missing,
}

impl Variable {
    /// Check if this is a missing value.
    pub fn is_missing(&self) -> bool {
        matches!(self, Variable::Missing)
    }

    /// Try to get as categorical string.
    pub fn as_categorical(&self) -> Option<&str> {
        match self {
            Variable::Categorical(s) => Some(s),
            _ => None,
        }
    }

    /// Try to get as continuous f64.
    pub fn as_continuous(&self) -> Option<f64> {
        match self {
            Variable::Continuous(v) => Some(*v),
            _ => None,
        }
    }

    /// Render the value as a group label.
    pub fn label(&self) -> Option<String> {
        match self {
            Variable::Categorical(s) => Some(s.clone()),
            Variable::Continuous(x) => Some(x.to_string()),
            Variable::Missing => None,
        }
    }
}

/// Type hint for columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VariableType {
    Categorical,
    Continuous,
}

/// Observations (rows) by named variables (columns).
#[derive(Debug, Clone, Default)]
pub struct Table {
    column_names: Vec<String>,
    columns: HashMap<String, Vec<Variable>>,
    column_types: HashMap<String, VariableType>,
    n_rows: usize,
}

fn is_missing_token(raw: &str) -> bool {
    raw.is_empty() || raw == "NA" || raw == "na"
}

impl Table {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a table from a TSV file with a header row.
    ///
    /// A column is continuous if every non-missing value parses as a number,
    /// otherwise categorical. Empty cells and `NA` are missing.
    pub fn from_tsv<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .has_headers(true)
            .flexible(true)
            .from_path(path)?;

        let column_names: Vec<String> = reader
            .headers()?
            .iter()
            .map(|s| s.trim().to_string())
            .collect();
        if column_names.is_empty() || column_names.iter().all(|c| c.is_empty()) {
            return Err(LmmError::EmptyData("Table has no columns".to_string()));
        }

        let mut raw_rows: Vec<Vec<String>> = Vec::new();
        for record in reader.records() {
            let record = record?;
            if record.iter().all(|f| f.trim().is_empty()) {
                continue;
            }
            raw_rows.push(record.iter().map(|s| s.trim().to_string()).collect());
        }

        if raw_rows.is_empty() {
            return Err(LmmError::EmptyData("No observations in table".to_string()));
        }

        let mut columns = Vec::with_capacity(column_names.len());
        for col_idx in 0..column_names.len() {
            let raw: Vec<&str> = raw_rows
                .iter()
                .map(|row| row.get(col_idx).map(|s| s.as_str()).unwrap_or(""))
                .collect();
            columns.push(raw);
        }

        let mut table = Table::new();
        for (name, raw) in column_names.iter().zip(columns) {
            table.push_raw_column(name, &raw)?;
        }
        Ok(table)
    }

    fn push_raw_column(&mut self, name: &str, raw: &[&str]) -> Result<()> {
        let all_numeric = raw
            .iter()
            .all(|v| is_missing_token(v) || v.parse::<f64>().is_ok());

        let values: Vec<Variable> = raw
            .iter()
            .map(|v| {
                if is_missing_token(v) {
                    Variable::Missing
                } else if all_numeric {
                    v.parse::<f64>()
                        .map(Variable::Continuous)
                        .unwrap_or(Variable::Missing)
                } else {
                    Variable::Categorical(v.to_string())
                }
            })
            .collect();

        let var_type = if all_numeric {
            VariableType::Continuous
        } else {
            VariableType::Categorical
        };
        self.insert_column(name, values, var_type)
    }

    fn insert_column(
        &mut self,
        name: &str,
        values: Vec<Variable>,
        var_type: VariableType,
    ) -> Result<()> {
        if name.is_empty() {
            return Err(LmmError::InvalidInput("Column name cannot be empty".to_string()));
        }
        if self.has_column(name) {
            return Err(LmmError::InvalidInput(format!("Duplicate column '{}'", name)));
        }
        if !self.column_names.is_empty() && values.len() != self.n_rows {
            return Err(LmmError::DimensionMismatch {
                what: format!("column '{}'", name),
                expected: self.n_rows,
                actual: values.len(),
            });
        }
        self.n_rows = values.len();
        self.column_names.push(name.to_string());
        self.column_types.insert(name.to_string(), var_type);
        self.columns.insert(name.to_string(), values);
        Ok(())
    }

    /// Add a numeric column.
    pub fn with_continuous(mut self, name: &str, values: &[f64]) -> Result<Self> {
        let values = values
            .iter()
            .map(|&v| if v.is_nan() { Variable::Missing } else { Variable::Continuous(v) })
            .collect();
        self.insert_column(name, values, VariableType::Continuous)?;
        Ok(self)
    }

    /// Add a categorical column.
    pub fn with_categorical<S: AsRef<str>>(mut self, name: &str, values: &[S]) -> Result<Self> {
        let values = values
            .iter()
            .map(|v| {
                let v = v.as_ref();
                if is_missing_token(v) {
                    Variable::Missing
                } else {
                    Variable::Categorical(v.to_string())
                }
            })
            .collect();
        self.insert_column(name, values, VariableType::Categorical)?;
        Ok(self)
    }

    /// Treat a column as categorical, e.g. a numeric subject ID.
    pub fn as_categorical(mut self, name: &str) -> Result<Self> {
        let values = self
            .columns
            .get_mut(name)
            .ok_or_else(|| LmmError::MissingColumn(name.to_string()))?;
        for v in values.iter_mut() {
            if let Variable::Continuous(x) = v {
                *v = Variable::Categorical(x.to_string());
            }
        }
        self.column_types.insert(name.to_string(), VariableType::Categorical);
        Ok(self)
    }

    /// Column names in file order.
    pub fn column_names(&self) -> &[String] {
        &self.column_names
    }

    /// Number of observations.
    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    /// Number of columns.
    pub fn n_columns(&self) -> usize {
        self.column_names.len()
    }

    /// Check if a column exists.
    pub fn has_column(&self, column: &str) -> bool {
        self.columns.contains_key(column)
    }

    /// Get all values for a column.
    pub fn column(&self, column: &str) -> Result<&[Variable]> {
        self.columns
            .get(column)
            .map(|v| v.as_slice())
            .ok_or_else(|| LmmError::MissingColumn(column.to_string()))
    }

    /// Get the type of a column.
    pub fn column_type(&self, column: &str) -> Option<VariableType> {
        self.column_types.get(column).copied()
    }

    /// Numeric values of a column; missing or categorical cells are an error.
    pub fn numeric_column(&self, column: &str) -> Result<Vec<f64>> {
        self.column(column)?
            .iter()
            .enumerate()
            .map(|(row, v)| {
                v.as_continuous().ok_or_else(|| {
                    LmmError::InvalidInput(format!(
                        "Column '{}' row {} is not numeric: {:?}",
                        column,
                        row + 1,
                        v
                    ))
                })
            })
            .collect()
    }

    /// Sorted unique levels of a categorical column.
    pub fn levels(&self, column: &str) -> Result<Vec<String>> {
        let mut levels: Vec<String> = self
            .column(column)?
            .iter()
            .filter_map(|v| v.as_categorical().map(String::from))
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        levels.sort();
        Ok(levels)
    }

    /// Keep only the given rows, in the given order.
    pub fn select_rows(&self, rows: &[usize]) -> Result<Self> {
        if let Some(&bad) = rows.iter().find(|&&r| r >= self.n_rows) {
            return Err(LmmError::InvalidInput(format!(
                "Row index {} out of range for {} rows",
                bad, self.n_rows
            )));
        }
        let columns = self
            .columns
            .iter()
            .map(|(name, values)| {
                (name.clone(), rows.iter().map(|&r| values[r].clone()).collect())
            })
            .collect();
        Ok(Self {
            column_names: self.column_names.clone(),
            columns,
            column_types: self.column_types.clone(),
            n_rows: rows.len(),
        })
    }
}
