//! Fixed-effects design matrix construction from a table and formula.

use crate::data::{Formula, Table, Term, Variable, VariableType};
use crate::error::{LmmError, Result};
use nalgebra::DMatrix;
use std::collections::HashMap;

/// A fixed-effects design matrix (X).
#[derive(Debug, Clone)]
pub struct DesignMatrix {
    /// The design matrix (observations × coefficients).
    matrix: DMatrix<f64>,
    /// Names of the coefficients (columns).
    coefficient_names: Vec<String>,
    /// Reference levels for categorical variables.
    reference_levels: HashMap<String, String>,
}

impl DesignMatrix {
    /// Wrap an existing matrix, e.g. one built by hand.
    pub fn from_matrix(matrix: DMatrix<f64>, coefficient_names: Vec<String>) -> Result<Self> {
        if coefficient_names.len() != matrix.ncols() {
            return Err(LmmError::DimensionMismatch {
                what: "coefficient names".to_string(),
                expected: matrix.ncols(),
                actual: coefficient_names.len(),
            });
        }
        Ok(Self {
            matrix,
            coefficient_names,
            reference_levels: HashMap::new(),
        })
    }

    /// Build a design matrix from a table and formula.
    ///
    /// Categorical variables are treatment (dummy) coded against their
    /// alphabetically first level unless a reference is given in `references`.
    pub fn from_formula(table: &Table, formula: &Formula) -> Result<Self> {
        Self::from_formula_with_references(table, formula, &HashMap::new())
    }

    /// Like [`DesignMatrix::from_formula`] with explicit reference levels.
    pub fn from_formula_with_references(
        table: &Table,
        formula: &Formula,
        references: &HashMap<String, String>,
    ) -> Result<Self> {
        let n_rows = table.n_rows();

        for var in formula.variables() {
            if !table.has_column(var) {
                return Err(LmmError::MissingColumn(var.to_string()));
            }
            if let Some(row) = table.column(var)?.iter().position(|v| v.is_missing()) {
                return Err(LmmError::InvalidInput(format!(
                    "Missing value in covariate '{}' at row {}",
                    var,
                    row + 1
                )));
            }
        }

        let mut reference_levels = HashMap::new();
        for var in formula.variables() {
            if table.column_type(var) == Some(VariableType::Categorical) {
                let levels = table.levels(var)?;
                let reference = match references.get(var) {
                    Some(level) if levels.contains(level) => level.clone(),
                    Some(level) => {
                        return Err(LmmError::InvalidInput(format!(
                            "Level '{}' not found for variable '{}'",
                            level, var
                        )))
                    }
                    None => match levels.first() {
                        Some(first) => first.clone(),
                        None => continue,
                    },
                };
                reference_levels.insert(var.to_string(), reference);
            }
        }

        let mut coefficient_names = Vec::new();
        let mut columns: Vec<Vec<f64>> = Vec::new();

        if formula.intercept {
            coefficient_names.push("(Intercept)".to_string());
            columns.push(vec![1.0; n_rows]);
        }

        for term in &formula.terms {
            match term {
                Term::Intercept => {}
                Term::Main(var_name) => {
                    // Without an intercept the first categorical main effect keeps every level.
                    let keep_reference = !formula.intercept
                        && table.column_type(var_name) == Some(VariableType::Categorical)
                        && !coefficient_names.iter().any(|n| !n.contains(':'));
                    for (name, col) in
                        Self::term_columns(table, var_name, &reference_levels, keep_reference)?
                    {
                        coefficient_names.push(name);
                        columns.push(col);
                    }
                }
                Term::Interaction(var1, var2) => {
                    let cols1 = Self::term_columns(table, var1, &reference_levels, false)?;
                    let cols2 = Self::term_columns(table, var2, &reference_levels, false)?;

                    for (name1, col1) in &cols1 {
                        for (name2, col2) in &cols2 {
                            coefficient_names.push(format!("{}:{}", name1, name2));
                            columns.push(col1.iter().zip(col2).map(|(a, b)| a * b).collect());
                        }
                    }
                }
            }
        }

        let matrix = DMatrix::from_fn(n_rows, columns.len(), |i, j| columns[j][i]);

        Ok(Self {
            matrix,
            coefficient_names,
            reference_levels,
        })
    }

    /// Columns for a single variable: one numeric column or dummy columns.
    fn term_columns(
        table: &Table,
        var_name: &str,
        reference_levels: &HashMap<String, String>,
        keep_reference: bool,
    ) -> Result<Vec<(String, Vec<f64>)>> {
        let values = table.column(var_name)?;
        let mut result = Vec::new();

        match table.column_type(var_name) {
            Some(VariableType::Continuous) => {
                let col: Vec<f64> = values
                    .iter()
                    .map(|v| v.as_continuous().unwrap_or(f64::NAN))
                    .collect();
                result.push((var_name.to_string(), col));
            }
            Some(VariableType::Categorical) | None => {
                let ref_level = reference_levels.get(var_name);
                for level in table.levels(var_name)? {
                    if !keep_reference && Some(&level) == ref_level {
                        continue;
                    }
                    let col: Vec<f64> = values
                        .iter()
                        .map(|v| match v {
                            Variable::Categorical(s) if *s == level => 1.0,
                            _ => 0.0,
                        })
                        .collect();
                    result.push((format!("{}{}", var_name, level), col));
                }
            }
        }

        Ok(result)
    }

    /// Get the design matrix.
    pub fn matrix(&self) -> &DMatrix<f64> {
        &self.matrix
    }

    /// Get coefficient names.
    pub fn coefficient_names(&self) -> &[String] {
        &self.coefficient_names
    }

    /// Number of observations (rows).
    pub fn n_rows(&self) -> usize {
        self.matrix.nrows()
    }

    /// Number of coefficients (columns).
    pub fn n_coefficients(&self) -> usize {
        self.matrix.ncols()
    }

    /// Get the reference level for a categorical variable.
    pub fn reference_level(&self, variable: &str) -> Option<&str> {
        self.reference_levels.get(variable).map(|s| s.as_str())
    }

    /// Get the index of a coefficient by name.
    pub fn coefficient_index(&self, name: &str) -> Option<usize> {
        self.coefficient_names.iter().position(|n| n == name)
    }

    /// Check if the matrix has an intercept.
    pub fn has_intercept(&self) -> bool {
        self.coefficient_names.first().map(|s| s.as_str()) == Some("(Intercept)")
    }
}
