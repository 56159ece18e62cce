//! Hypothesis tests on fitted mixed models.

pub mod paired;

pub use lrt::{test_random_intercept, LrtResult};
pub use paired::{test_paired, test_paired_from_table, PairedResult};
pub use wald::{test_wald, test_wald_all, WaldResult};
