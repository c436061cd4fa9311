use crate::errors::Result;
use nalgebra::{DMatrix, DVector};
use nalgebra_sparse::CsrMatrix;
use num_traits::{Float, FromPrimitive};
use std::fmt::Debug;

/// A trait for types that can be used as scalars by the bytecode VM.
/// Must support basic arithmetic, debug printing, and conversion from f64.
pub trait Scalar: Float + FromPrimitive + Debug + 'static {}

impl<T: Float + FromPrimitive + Debug + 'static> Scalar for T {}

/// Model-level residual/Jacobian evaluation.
///
/// `point` holds one row per time step of the evaluation window
/// (`maxlag + maxlead + 1` rows) and one column per model variable.
/// The returned buffers are owned by the implementor and overwritten by the
/// next call; `point` is never modified.
pub trait ModelEvaluation {
    /// Number of residual rows.
    fn equation_count(&self) -> usize;

    fn evaluate_residual(&mut self, point: &DMatrix<f64>) -> Result<&DVector<f64>>;

    /// Residual plus the sparse Jacobian with equations as rows and
    /// (variable, time offset) pairs flattened as columns.
    fn evaluate_residual_and_jacobian(
        &mut self,
        point: &DMatrix<f64>,
    ) -> Result<(&DVector<f64>, &CsrMatrix<f64>)>;
}
