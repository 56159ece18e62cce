//! Response, design matrix and grouping assembled from a table and a formula.

use crate::data::{DesignMatrix, Grouping, MixedFormula, Table};
use crate::error::{LmmError, Result};

/// Model inputs for `response ~ fixed + (1 | group)`.
#[derive(Debug, Clone)]
pub struct ModelFrame {
    pub formula: MixedFormula,
    pub response: Vec<f64>,
    pub design: DesignMatrix,
    pub groups: Grouping,
}

impl ModelFrame {
    /// Parse `formula` and pull its columns out of `table`.
    ///
    /// Every referenced column must exist before any of them is converted.
    pub fn from_formula(table: &Table, formula: &str) -> Result<Self> {
        let formula = MixedFormula::parse(formula)?;
        for var in formula.all_variables() {
            if !table.has_column(var) {
                return Err(LmmError::MissingColumn(var.to_string()));
            }
        }

        let response = table.numeric_column(&formula.response)?;
        let design = DesignMatrix::from_formula(table, &formula.fixed)?;
        let groups = Grouping::from_column(table, &formula.grouping)?;

        Ok(Self {
            formula,
            response,
            design,
            groups,
        })
    }

    /// Number of observations.
    pub fn n_obs(&self) -> usize {
        self.response.len()
    }
}
