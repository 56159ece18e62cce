//! Grouping factor of the random intercept.
//!
//! A grouping vector G assigns every observation to exactly one of m groups.
//! The incidence matrix K (n × m) has `K[i][j] = 1` iff observation i is in group j.

use crate::data::Table;
use crate::error::{LmmError, Result};
use nalgebra::DMatrix;
use std::collections::HashMap;

/// Membership of each observation in one group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grouping {
    /// Group index for each observation.
    group_indices: Vec<usize>,
    /// Group labels, indexed by group.
    group_labels: Vec<String>,
}

impl Grouping {
    /// Build from labels; groups are numbered in order of first appearance.
    pub fn from_labels<S: AsRef<str>>(labels: &[S]) -> Self {
        let mut group_map: HashMap<String, usize> = HashMap::new();
        let mut group_labels: Vec<String> = Vec::new();
        let mut group_indices = Vec::with_capacity(labels.len());

        for label in labels {
            let label = label.as_ref();
            let idx = match group_map.get(label) {
                Some(&idx) => idx,
                None => {
                    let idx = group_labels.len();
                    group_map.insert(label.to_string(), idx);
                    group_labels.push(label.to_string());
                    idx
                }
            };
            group_indices.push(idx);
        }

        Self {
            group_indices,
            group_labels,
        }
    }

    /// Build from labels with a declared set of levels, like a factor.
    ///
    /// Declared levels without observations are kept as empty groups, which the
    /// estimator rejects.
    pub fn with_levels<S: AsRef<str>, L: AsRef<str>>(labels: &[S], levels: &[L]) -> Result<Self> {
        let group_labels: Vec<String> = levels.iter().map(|l| l.as_ref().to_string()).collect();
        let mut group_map: HashMap<&str, usize> = HashMap::new();
        for (idx, level) in group_labels.iter().enumerate() {
            if group_map.insert(level.as_str(), idx).is_some() {
                return Err(LmmError::InvalidInput(format!(
                    "Duplicate group level '{}'",
                    level
                )));
            }
        }

        let group_indices = labels
            .iter()
            .map(|label| {
                group_map.get(label.as_ref()).copied().ok_or_else(|| {
                    LmmError::InvalidInput(format!(
                        "Group label '{}' is not a declared level",
                        label.as_ref()
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            group_indices,
            group_labels,
        })
    }

    /// Build from zero-based group indices with `n_groups` groups.
    pub fn from_indices(group_indices: Vec<usize>, n_groups: usize) -> Result<Self> {
        if let Some(&bad) = group_indices.iter().find(|&&g| g >= n_groups) {
            return Err(LmmError::InvalidInput(format!(
                "Group index {} out of range for {} groups",
                bad, n_groups
            )));
        }
        Ok(Self {
            group_indices,
            group_labels: (0..n_groups).map(|g| g.to_string()).collect(),
        })
    }

    /// Build from a table column; missing values are not allowed.
    pub fn from_column(table: &Table, column: &str) -> Result<Self> {
        let labels = table
            .column(column)?
            .iter()
            .enumerate()
            .map(|(row, v)| {
                v.label().ok_or_else(|| {
                    LmmError::InvalidInput(format!(
                        "Missing value in grouping variable '{}' at row {}",
                        column,
                        row + 1
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::from_labels(&labels))
    }

    /// Number of observations.
    pub fn len(&self) -> usize {
        self.group_indices.len()
    }

    /// Whether there are no observations.
    pub fn is_empty(&self) -> bool {
        self.group_indices.is_empty()
    }

    /// Number of groups (m), including empty declared groups.
    pub fn n_groups(&self) -> usize {
        self.group_labels.len()
    }

    /// Group index of every observation.
    pub fn group_indices(&self) -> &[usize] {
        &self.group_indices
    }

    /// Group labels.
    pub fn group_labels(&self) -> &[String] {
        &self.group_labels
    }

    /// Number of observations per group.
    pub fn group_sizes(&self) -> Vec<usize> {
        let mut counts = vec![0usize; self.n_groups()];
        for &idx in &self.group_indices {
            counts[idx] += 1;
        }
        counts
    }

    /// Labels of groups that have no observations.
    pub fn empty_groups(&self) -> Vec<&str> {
        self.group_sizes()
            .iter()
            .zip(&self.group_labels)
            .filter(|&(&size, _)| size == 0)
            .map(|(_, label)| label.as_str())
            .collect()
    }

    /// Every group holds exactly one observation.
    pub fn all_singletons(&self) -> bool {
        self.group_sizes().iter().all(|&s| s == 1)
    }

    /// Incidence matrix K (n × m).
    pub fn incidence_matrix(&self) -> DMatrix<f64> {
        let mut k = DMatrix::zeros(self.len(), self.n_groups());
        for (row, &group) in self.group_indices.iter().enumerate() {
            k[(row, group)] = 1.0;
        }
        k
    }

    /// Reorder observations: row `i` of the result is row `order[i]` of `self`.
    pub fn permuted(&self, order: &[usize]) -> Result<Self> {
        if order.len() != self.len() || order.iter().any(|&r| r >= self.len()) {
            return Err(LmmError::InvalidInput(
                "Permutation does not match the number of observations".to_string(),
            ));
        }
        Ok(Self {
            group_indices: order.iter().map(|&r| self.group_indices[r]).collect(),
            group_labels: self.group_labels.clone(),
        })
    }
}
