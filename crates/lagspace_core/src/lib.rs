pub mod autodiff;
pub mod equation;
pub mod equation_engine;
pub mod errors;
pub mod evaluation;
pub mod model;
pub mod normalize;
pub mod registry;
#[cfg(test)]
pub(crate) mod test_support;
/// The `lagspace_core` crate turns time-shifted model equations into numeric
/// evaluators for the solvers of dynamic economic models.
///
/// Key components:
/// - **Equation Engine**: parser, bytecode compiler and VM, generic over `Scalar`.
/// - **Normalize**: expands `lag`, `lead`, `diff` and moving-sum operators into plain time offsets.
/// - **Registry**: per-model cache of compiled residual/gradient evaluators.
/// - **Evaluation**: sparse residual/Jacobian evaluation, selective linearization and first-order state-space form.
/// - **Autodiff**: chunked dual numbers for forward-mode gradients.
pub mod traits;

pub use equation::Equation;
pub use errors::{CompileError, EquationError, ModelError, Result, SyntaxError};
pub use evaluation::{FirstOrderData, LinearizedEvaluationData, ModelEvaluationData};
pub use model::{EvaluationOptions, Model, ModelVariable, Parameters, SteadyState, VariableKind};
pub use traits::ModelEvaluation;
