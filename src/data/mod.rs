//! Data structures: observation tables, formulas, design and grouping matrices.

mod design_matrix;
mod formula;
mod grouping;
mod model_frame;
mod table;

pub use design_matrix::DesignMatrix;
pub use formula::{Formula, MixedFormula, Term};
pub use grouping::Grouping;
pub use model_frame::ModelFrame;
pub use table::{Table, Variable, VariableType};
