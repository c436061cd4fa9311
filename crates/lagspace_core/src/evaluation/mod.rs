//! Evaluation data built on top of a [`Model`](crate::model::Model).
//!
//! - [`ModelEvaluationData`]: residual and sparse Jacobian over the window
//! - [`LinearizedEvaluationData`]: the same, with selected equations
//!   replaced by their expansion at the steady state
//! - [`FirstOrderData`]: `FWD`/`BCK`/`EX` state-space matrices of a fully
//!   linearized model

pub mod equation_data;
pub mod first_order;
pub mod linearized;
pub mod standard;

pub use equation_data::{EquationData, LinearizedEquation};
pub use first_order::{FirstOrderData, SlotKey, SlotRole, StateSlot};
pub use linearized::LinearizedEvaluationData;
pub use standard::ModelEvaluationData;
