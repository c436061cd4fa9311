//! Selective linearization around the steady state.
//!
//! Flagged equations are replaced by their first-order Taylor expansion at
//! the steady-state window; the rest keep their ordinary evaluation data.
//! The Jacobian pattern and buffers are the ones built by the wrapped
//! [`ModelEvaluationData`].

use crate::equation::Equation;
use crate::errors::{ModelError, Result};
use crate::evaluation::equation_data::{EquationData, LinearizedEquation};
use crate::evaluation::standard::ModelEvaluationData;
use crate::model::Model;
use crate::traits::ModelEvaluation;
use nalgebra::{DMatrix, DVector};
use nalgebra_sparse::CsrMatrix;
use std::ops::Range;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct LinearizedEvaluationData {
    base: ModelEvaluationData,
    linearized: Vec<usize>,
    point: DMatrix<f64>,
}

impl LinearizedEvaluationData {
    /// Linearizes the equations flagged with `@lin`.
    pub fn selective(model: &Model, base: ModelEvaluationData) -> Result<Self> {
        Self::build(model, base, Equation::linearize)
    }

    /// Linearizes every equation.
    pub fn full(model: &Model, base: ModelEvaluationData) -> Result<Self> {
        Self::build(model, base, |_| true)
    }

    fn build(
        model: &Model,
        mut base: ModelEvaluationData,
        select: impl Fn(&Equation) -> bool,
    ) -> Result<Self> {
        check_steady_state(model)?;
        let tolerance = model.options.tolerance;
        let point = model
            .steady_state()
            .window(base.maxlag(), base.maxlead());
        base.check_point(&point)?;

        let mut linearized = Vec::new();
        for row in 0..base.equation_count() {
            if !select(base.equations()[row].as_ref()) {
                continue;
            }
            let (residual, gradient, x) = base.expand(row, &point);
            if residual.is_nan() || residual.abs() > tolerance {
                warn!(
                    equation = base.equations()[row].name(),
                    residual,
                    "non-zero steady-state residual at the linearization point"
                );
            }
            base.set_equation_data(
                row,
                EquationData::Linearized(LinearizedEquation {
                    residual,
                    gradient,
                    point: x,
                }),
            );
            linearized.push(row);
        }

        if linearized.is_empty() {
            warn!("no equations flagged for linearization; linearization has no effect");
        }
        debug!(
            linearized = linearized.len(),
            equations = base.equation_count(),
            "linearized model evaluation data"
        );

        Ok(Self {
            base,
            linearized,
            point,
        })
    }

    pub fn base(&self) -> &ModelEvaluationData {
        &self.base
    }

    /// Rows replaced by their Taylor expansion, ascending.
    pub fn linearized_rows(&self) -> &[usize] {
        &self.linearized
    }

    pub fn is_fully_linear(&self) -> bool {
        self.linearized.len() == self.base.equation_count()
    }

    /// The steady-state window the expansions were taken at.
    pub fn expansion_point(&self) -> &DMatrix<f64> {
        &self.point
    }

    pub fn expansion(&self, row: usize) -> Option<&LinearizedEquation> {
        match self.base.equation_data(row) {
            Some(EquationData::Linearized(lin)) => Some(lin),
            _ => None,
        }
    }

    pub fn evaluate_equation_over_range(
        &mut self,
        index: usize,
        trajectory: &DMatrix<f64>,
        range: Range<usize>,
    ) -> Result<Vec<f64>> {
        self.base
            .evaluate_equation_over_range(index, trajectory, range)
    }
}

impl ModelEvaluation for LinearizedEvaluationData {
    fn equation_count(&self) -> usize {
        self.base.equation_count()
    }

    fn evaluate_residual(&mut self, point: &DMatrix<f64>) -> Result<&DVector<f64>> {
        self.base.evaluate_residual(point)
    }

    fn evaluate_residual_and_jacobian(
        &mut self,
        point: &DMatrix<f64>,
    ) -> Result<(&DVector<f64>, &CsrMatrix<f64>)> {
        self.base.evaluate_residual_and_jacobian(point)
    }
}

fn check_steady_state(model: &Model) -> Result<()> {
    let steady_state = model.steady_state();
    let unsolved: Vec<&str> = model
        .variables()
        .enumerate()
        .filter(|(idx, _)| !steady_state.is_solved(*idx))
        .map(|(_, v)| v.name.as_str())
        .collect();
    if !unsolved.is_empty() {
        return Err(ModelError::Linearization(format!(
            "steady state is not solved for {}",
            unsolved.join(", ")
        )));
    }

    let tolerance = model.options.tolerance;
    for (idx, var) in model.variables().enumerate() {
        let slope = steady_state.slope(idx);
        if slope.abs() > tolerance {
            return Err(ModelError::Linearization(format!(
                "steady state of `{}` has non-zero slope {slope}",
                var.name
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::VariableKind;
    use crate::test_support::count_warnings;

    const TOL: f64 = 1e-12;

    fn model() -> Model {
        let mut model = Model::new();
        model.add_variable("x", VariableKind::Variable).unwrap();
        model.add_variable("y", VariableKind::Variable).unwrap();
        model.add_parameter("rho", 0.5).unwrap();
        model.add_equation("square", "@lin y[t] = x[t]^2").unwrap();
        model.add_equation("ar", "x[t] = rho * x[t-1]").unwrap();
        model.set_steady_state("x", 2.0, 0.0).unwrap();
        model.set_steady_state("y", 4.0, 0.0).unwrap();
        model
    }

    // rows: t-1, t; columns: x, y
    fn point() -> DMatrix<f64> {
        DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 3.0, 5.0])
    }

    #[test]
    fn selective_only_touches_flagged_equations() {
        let model = model();
        let base = ModelEvaluationData::new(&model).unwrap();
        let mut lin = LinearizedEvaluationData::selective(&model, base).unwrap();
        assert_eq!(lin.linearized_rows(), &[0]);
        assert!(!lin.is_fully_linear());
        assert!(lin.expansion(1).is_none());

        let r = lin.evaluate_residual(&point()).unwrap();
        // 0 + (5 - 4) - 4 * (3 - 2)
        assert!((r[0] + 3.0).abs() < TOL);
        assert!((r[1] - 2.5).abs() < TOL);
    }

    #[test]
    fn linearized_gradient_is_frozen() {
        let model = model();
        let base = ModelEvaluationData::new(&model).unwrap();
        let mut lin = LinearizedEvaluationData::selective(&model, base).unwrap();
        let (_, jac) = lin.evaluate_residual_and_jacobian(&point()).unwrap();
        let dense = DMatrix::from(jac);
        // x[t] is column 1, y[t] column 3
        assert_eq!(dense[(0, 1)], -4.0);
        assert_eq!(dense[(0, 3)], 1.0);
    }

    #[test]
    fn linear_equation_matches_ordinary_evaluation() {
        let model = model();
        let mut plain = ModelEvaluationData::new(&model).unwrap();
        let base = ModelEvaluationData::new(&model).unwrap();
        let mut lin = LinearizedEvaluationData::full(&model, base).unwrap();
        assert!(lin.is_fully_linear());

        let at_ss = lin.expansion_point().clone();
        let expected = plain.evaluate_residual(&at_ss).unwrap()[1];
        let cached = lin.expansion(1).unwrap().residual;
        assert!((cached - expected).abs() < TOL);
        assert!((lin.evaluate_residual(&at_ss).unwrap()[1] - expected).abs() < TOL);

        let p = point();
        let expected = plain.evaluate_residual(&p).unwrap()[1];
        assert!((lin.evaluate_residual(&p).unwrap()[1] - expected).abs() < TOL);
    }

    #[test]
    fn pattern_is_shared_with_base() {
        let model = model();
        let mut plain = ModelEvaluationData::new(&model).unwrap();
        let (offsets, indices) = {
            let (_, jac) = plain.evaluate_residual_and_jacobian(&point()).unwrap();
            (jac.row_offsets().to_vec(), jac.col_indices().to_vec())
        };
        let mut lin = LinearizedEvaluationData::full(&model, plain).unwrap();
        let (_, jac) = lin.evaluate_residual_and_jacobian(&point()).unwrap();
        assert_eq!(jac.row_offsets(), offsets.as_slice());
        assert_eq!(jac.col_indices(), indices.as_slice());
    }

    #[test]
    fn unsolved_steady_state_is_rejected() {
        let mut model = Model::new();
        model.add_variable("x", VariableKind::Variable).unwrap();
        model.add_equation("e", "@lin x = 1").unwrap();
        let base = ModelEvaluationData::new(&model).unwrap();
        match LinearizedEvaluationData::selective(&model, base) {
            Err(ModelError::Linearization(message)) => assert!(message.contains("x")),
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("expected a linearization error"),
        }
    }

    #[test]
    fn trending_steady_state_is_rejected() {
        let mut model = model();
        model.set_steady_state("y", 4.0, 0.25).unwrap();
        let base = ModelEvaluationData::new(&model).unwrap();
        assert!(matches!(
            LinearizedEvaluationData::selective(&model, base),
            Err(ModelError::Linearization(_))
        ));
    }

    #[test]
    fn nothing_flagged_is_not_an_error() {
        let mut model = Model::new();
        model.add_variable("x", VariableKind::Variable).unwrap();
        model.add_equation("e", "x = 1").unwrap();
        model.set_steady_state("x", 1.0, 0.0).unwrap();
        let base = ModelEvaluationData::new(&model).unwrap();
        let (lin, warnings) =
            count_warnings(|| LinearizedEvaluationData::selective(&model, base));
        assert!(lin.unwrap().linearized_rows().is_empty());
        assert_eq!(warnings, 1);
    }

    #[test]
    fn off_steady_state_residual_is_reported_once() {
        let model = model();
        // the ar row is 2 - 0.5 * 2 = 1 at the steady state, the square row is 0
        let base = ModelEvaluationData::new(&model).unwrap();
        let (full, warnings) = count_warnings(|| LinearizedEvaluationData::full(&model, base));
        assert!(full.unwrap().is_fully_linear());
        assert_eq!(warnings, 1);

        let base = ModelEvaluationData::new(&model).unwrap();
        let (selective, warnings) =
            count_warnings(|| LinearizedEvaluationData::selective(&model, base));
        assert_eq!(selective.unwrap().linearized_rows(), &[0]);
        assert_eq!(warnings, 0);
    }
}
