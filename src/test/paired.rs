//! Paired-difference t-test.
//!
//! With exactly two observations per group, one under each of two conditions,
//! the mean within-group difference estimates the same slope as the
//! random-intercept model and serves as a cross-check.

use crate::data::{Grouping, Table};
use crate::error::{LmmError, Result};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, StudentsT};

/// Result of a paired t-test.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairedResult {
    /// Level subtracted from the comparison level.
    pub reference_level: String,
    /// Level whose observations are the minuends.
    pub comparison_level: String,
    /// Number of pairs (groups).
    pub n_pairs: usize,
    /// Mean of comparison − reference.
    pub mean_difference: f64,
    /// Standard error of the mean difference.
    pub std_error: f64,
    /// t statistic.
    pub statistic: f64,
    /// Degrees of freedom (n_pairs − 1).
    pub df: f64,
    /// P-value (two-sided).
    pub p_value: f64,
    /// 95% confidence interval of the mean difference.
    pub ci_lower: f64,
    pub ci_upper: f64,
}

/// Paired t-test of `y` between the two levels of `condition` within groups.
///
/// The reference level is the lexicographically first of the two.
pub fn test_paired<S: AsRef<str>>(
    y: &[f64],
    condition: &[S],
    groups: &Grouping,
) -> Result<PairedResult> {
    let n = y.len();
    if condition.len() != n || groups.len() != n {
        return Err(LmmError::DimensionMismatch {
            what: "paired test inputs".to_string(),
            expected: n,
            actual: if condition.len() != n {
                condition.len()
            } else {
                groups.len()
            },
        });
    }

    let mut levels: Vec<&str> = condition.iter().map(|c| c.as_ref()).collect();
    levels.sort_unstable();
    levels.dedup();
    if levels.len() != 2 {
        return Err(LmmError::InvalidInput(format!(
            "Paired test needs exactly two condition levels, found {}",
            levels.len()
        )));
    }
    let (reference, comparison) = (levels[0], levels[1]);

    let m = groups.n_groups();
    let mut reference_value: Vec<Option<f64>> = vec![None; m];
    let mut comparison_value: Vec<Option<f64>> = vec![None; m];
    for ((&value, cond), &g) in y.iter().zip(condition).zip(groups.group_indices()) {
        let slot = if cond.as_ref() == reference {
            &mut reference_value[g]
        } else {
            &mut comparison_value[g]
        };
        if slot.replace(value).is_some() {
            return Err(LmmError::InvalidInput(format!(
                "Group '{}' has more than one observation under '{}'",
                groups.group_labels()[g],
                cond.as_ref()
            )));
        }
    }

    let differences = reference_value
        .iter()
        .zip(&comparison_value)
        .enumerate()
        .map(|(g, pair)| match pair {
            (Some(a), Some(b)) => Ok(b - a),
            _ => Err(LmmError::InvalidInput(format!(
                "Group '{}' is not a complete pair",
                groups.group_labels()[g]
            ))),
        })
        .collect::<Result<Vec<f64>>>()?;

    let n_pairs = differences.len();
    if n_pairs < 2 {
        return Err(LmmError::InvalidInput(
            "Paired test needs at least two pairs".to_string(),
        ));
    }

    let mean = differences.iter().sum::<f64>() / n_pairs as f64;
    let var = differences.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / (n_pairs - 1) as f64;
    let std_error = (var / n_pairs as f64).sqrt();
    let df = (n_pairs - 1) as f64;

    let t_dist = StudentsT::new(0.0, 1.0, df)
        .map_err(|e| LmmError::NumericalFailure(format!("Student's t distribution: {}", e)))?;

    let statistic = if std_error > 0.0 {
        mean / std_error
    } else {
        f64::NAN
    };
    let p_value = if statistic.is_nan() {
        f64::NAN
    } else {
        2.0 * (1.0 - t_dist.cdf(statistic.abs()))
    };
    let t_crit = t_dist.inverse_cdf(0.975);

    Ok(PairedResult {
        reference_level: reference.to_string(),
        comparison_level: comparison.to_string(),
        n_pairs,
        mean_difference: mean,
        std_error,
        statistic,
        df,
        p_value,
        ci_lower: mean - t_crit * std_error,
        ci_upper: mean + t_crit * std_error,
    })
}

/// Paired t-test on table columns.
pub fn test_paired_from_table(
    table: &Table,
    response: &str,
    condition: &str,
    group: &str,
) -> Result<PairedResult> {
    let y = table.numeric_column(response)?;
    let labels = table
        .column(condition)?
        .iter()
        .enumerate()
        .map(|(row, v)| {
            v.label().ok_or_else(|| {
                LmmError::InvalidInput(format!(
                    "Missing value in condition '{}' at row {}",
                    condition,
                    row + 1
                ))
            })
        })
        .collect::<Result<Vec<String>>>()?;
    let groups = Grouping::from_column(table, group)?;
    test_paired(&y, &labels, &groups)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f64::consts::PI;

    #[test]
    fn test_paired_toy() {
        let y = [10.0, 25.0, 3.0, 6.0];
        let groups = Grouping::from_labels(&["Ind1", "Ind1", "Ind2", "Ind2"]);
        let result = test_paired(&y, &["0", "1", "0", "1"], &groups).unwrap();

        assert_eq!(result.reference_level, "0");
        assert_eq!(result.n_pairs, 2);
        assert_relative_eq!(result.mean_difference, 9.0, epsilon = 1e-12);
        assert_relative_eq!(result.std_error, 6.0, epsilon = 1e-12);
        assert_relative_eq!(result.statistic, 1.5, epsilon = 1e-12);
        assert_eq!(result.df, 1.0);
        // t with one df is Cauchy
        assert_relative_eq!(result.p_value, 1.0 - 2.0 * 1.5f64.atan() / PI, epsilon = 1e-6);
        assert!(result.ci_lower < 9.0 && result.ci_upper > 9.0);
    }

    #[test]
    fn test_order_within_group_does_not_matter() {
        let y = [25.0, 10.0, 3.0, 6.0];
        let groups = Grouping::from_labels(&["Ind1", "Ind1", "Ind2", "Ind2"]);
        let result = test_paired(&y, &["b", "a", "a", "b"], &groups).unwrap();
        assert_relative_eq!(result.mean_difference, 9.0, epsilon = 1e-12);
    }

    #[test]
    fn test_incomplete_pair() {
        let y = [1.0, 2.0, 3.0, 4.0];
        let groups = Grouping::from_labels(&["a", "a", "b", "b"]);
        assert!(test_paired(&y, &["x", "x", "x", "y"], &groups).is_err());
        assert!(test_paired(&y, &["x", "x", "x", "x"], &groups).is_err());
    }

    #[test]
    fn test_from_table() {
        let table = Table::new()
            .with_continuous("y", &[10.0, 25.0, 3.0, 6.0])
            .unwrap()
            .with_continuous("treat", &[0.0, 1.0, 0.0, 1.0])
            .unwrap()
            .with_categorical("ind", &["Ind1", "Ind1", "Ind2", "Ind2"])
            .unwrap();
        let result = test_paired_from_table(&table, "y", "treat", "ind").unwrap();
        assert_relative_eq!(result.statistic, 1.5, epsilon = 1e-12);
    }
}
