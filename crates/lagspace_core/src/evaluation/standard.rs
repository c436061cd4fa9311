//! Model-level residual and sparse Jacobian evaluation.
//!
//! The Jacobian's sparsity pattern is the union of all (equation, variable,
//! offset) references. It is built once in [`ModelEvaluationData::new`];
//! every later evaluation only overwrites values, writing each equation's
//! dense gradient straight into the precomputed nonzero positions of its row.

use crate::equation::Equation;
use crate::errors::{ModelError, Result};
use crate::evaluation::equation_data::EquationData;
use crate::model::{Model, Parameters};
use crate::traits::ModelEvaluation;
use nalgebra::{DMatrix, DVector};
use nalgebra_sparse::CsrMatrix;
use std::ops::Range;
use std::rc::Rc;
use tracing::debug;

/// Write-once topology shared by every clone of the evaluation data.
#[derive(Debug)]
struct Layout {
    equations: Vec<Rc<Equation>>,
    variables: Vec<String>,
    maxlag: usize,
    maxlead: usize,
    /// Per equation: flat point index of each time-series input.
    columns: Vec<Vec<usize>>,
    /// Per equation: position in the Jacobian value array of each input.
    positions: Vec<Vec<usize>>,
}

/// Cloning shares the layout and evaluators; the residual, Jacobian values
/// and scratch buffers are copied, so clones can be evaluated independently.
#[derive(Clone)]
pub struct ModelEvaluationData {
    layout: Rc<Layout>,
    data: Vec<EquationData>,
    parameters: Rc<Parameters>,
    residual: DVector<f64>,
    jacobian: CsrMatrix<f64>,
    inputs: Vec<f64>,
    gradient: Vec<f64>,
}

impl ModelEvaluationData {
    pub fn new(model: &Model) -> Result<Self> {
        let maxlag = model.maxlag();
        let maxlead = model.maxlead();
        let ntimes = maxlag + maxlead + 1;
        let variables: Vec<String> = model.variables().map(|v| v.name.clone()).collect();
        let equations = model.equations().to_vec();

        let mut columns = Vec::with_capacity(equations.len());
        for eqn in &equations {
            let mut cols = Vec::with_capacity(eqn.series_refs().len());
            for (name, offset) in eqn.series_refs() {
                let var = model
                    .variable_index(name)
                    .ok_or_else(|| ModelError::UnknownVariable(name.clone()))?;
                let t = maxlag as i64 + *offset as i64;
                if t < 0 || t >= ntimes as i64 {
                    return Err(ModelError::OutsideWindow {
                        equation: eqn.name().to_string(),
                        variable: name.clone(),
                        offset: *offset,
                        maxlag,
                        maxlead,
                    });
                }
                cols.push(var * ntimes + t as usize);
            }
            columns.push(cols);
        }

        // CSR structure: sorted unique columns per row, plus the position of
        // every input inside the value array.
        let mut row_offsets = Vec::with_capacity(equations.len() + 1);
        let mut col_indices = Vec::new();
        let mut positions = Vec::with_capacity(equations.len());
        row_offsets.push(0);
        for cols in &columns {
            let mut sorted = cols.clone();
            sorted.sort_unstable();
            sorted.dedup();
            let base = col_indices.len();
            positions.push(
                cols.iter()
                    .map(|c| base + sorted.partition_point(|s| s < c))
                    .collect::<Vec<_>>(),
            );
            col_indices.extend(sorted);
            row_offsets.push(col_indices.len());
        }
        let nnz = col_indices.len();
        let jacobian = CsrMatrix::try_from_csr_data(
            equations.len(),
            ntimes * variables.len(),
            row_offsets,
            col_indices,
            vec![0.0; nnz],
        )
        .map_err(|e| ModelError::Pattern(e.to_string()))?;

        let data = equations
            .iter()
            .map(|eqn| EquationData::for_equation(eqn, model))
            .collect();
        let widest = equations
            .iter()
            .map(|e| e.series_refs().len())
            .max()
            .unwrap_or(0);

        debug!(
            equations = equations.len(),
            variables = variables.len(),
            maxlag,
            maxlead,
            nnz,
            "built Jacobian pattern"
        );

        Ok(Self {
            residual: DVector::zeros(equations.len()),
            layout: Rc::new(Layout {
                equations,
                variables,
                maxlag,
                maxlead,
                columns,
                positions,
            }),
            data,
            parameters: Rc::clone(model.parameters()),
            jacobian,
            inputs: Vec::with_capacity(widest),
            gradient: vec![0.0; widest],
        })
    }

    pub fn maxlag(&self) -> usize {
        self.layout.maxlag
    }

    pub fn maxlead(&self) -> usize {
        self.layout.maxlead
    }

    /// Rows of an evaluation point.
    pub fn ntimes(&self) -> usize {
        self.layout.maxlag + self.layout.maxlead + 1
    }

    pub fn variables(&self) -> &[String] {
        &self.layout.variables
    }

    pub fn equations(&self) -> &[Rc<Equation>] {
        &self.layout.equations
    }

    pub fn equation_data(&self, row: usize) -> Option<&EquationData> {
        self.data.get(row)
    }

    pub(crate) fn set_equation_data(&mut self, row: usize, data: EquationData) {
        self.data[row] = data;
    }

    /// Jacobian column of `variable` at time offset `offset`.
    pub fn column_index(&self, variable: usize, offset: i32) -> Option<usize> {
        let t = self.layout.maxlag as i64 + offset as i64;
        if variable >= self.layout.variables.len() || t < 0 || t >= self.ntimes() as i64 {
            return None;
        }
        Some(variable * self.ntimes() + t as usize)
    }

    /// Inverse of [`column_index`](Self::column_index): (variable, offset).
    pub fn column_of(&self, column: usize) -> (usize, i32) {
        let ntimes = self.ntimes();
        let t = (column % ntimes) as i32;
        (column / ntimes, t - self.layout.maxlag as i32)
    }

    /// The time-series inputs of equation `row` taken from `point`.
    pub(crate) fn gather(&self, row: usize, point: &DMatrix<f64>) -> Vec<f64> {
        let flat = point.as_slice();
        self.layout.columns[row].iter().map(|&c| flat[c]).collect()
    }

    pub(crate) fn expand(&mut self, row: usize, point: &DMatrix<f64>) -> (f64, Vec<f64>, Vec<f64>) {
        let x = self.gather(row, point);
        let mut gradient = vec![0.0; x.len()];
        let eqn = Rc::clone(&self.layout.equations[row]);
        let residual =
            self.data[row].residual_and_gradient(&eqn, &self.parameters, &x, &mut gradient);
        (residual, gradient, x)
    }

    pub(crate) fn check_point(&self, point: &DMatrix<f64>) -> Result<()> {
        let expected = (self.ntimes(), self.layout.variables.len());
        if point.shape() != expected {
            return Err(ModelError::DimensionMismatch {
                what: "point",
                expected: format!("{}x{}", expected.0, expected.1),
                got: format!("{}x{}", point.nrows(), point.ncols()),
            });
        }
        Ok(())
    }

    /// Residual of equation `index` at every time step of `range` along
    /// `trajectory` (rows are periods, columns are variables).
    ///
    /// Steps whose lags or leads fall outside the trajectory are NaN.
    pub fn evaluate_equation_over_range(
        &mut self,
        index: usize,
        trajectory: &DMatrix<f64>,
        range: Range<usize>,
    ) -> Result<Vec<f64>> {
        let count = self.layout.equations.len();
        if index >= count {
            return Err(ModelError::UnknownEquation { index, count });
        }
        if trajectory.ncols() != self.layout.variables.len() {
            return Err(ModelError::DimensionMismatch {
                what: "trajectory",
                expected: format!("{} columns", self.layout.variables.len()),
                got: format!("{} columns", trajectory.ncols()),
            });
        }
        let len = trajectory.nrows();
        if range.start > range.end || range.end > len {
            return Err(ModelError::RangeOutOfBounds {
                start: range.start,
                end: range.end,
                len,
            });
        }

        let refs: Vec<(usize, i32)> = self.layout.columns[index]
            .iter()
            .map(|&c| self.column_of(c))
            .collect();
        let eqn = Rc::clone(&self.layout.equations[index]);
        let mut out = Vec::with_capacity(range.len());
        let mut x = vec![0.0; refs.len()];

        for t in range {
            let mut defined = true;
            for (slot, &(var, offset)) in x.iter_mut().zip(&refs) {
                let row = t as i64 + offset as i64;
                if row < 0 || row >= len as i64 {
                    defined = false;
                    break;
                }
                *slot = trajectory[(row as usize, var)];
            }
            out.push(if defined {
                self.data[index].residual(&eqn, &self.parameters, &x)
            } else {
                f64::NAN
            });
        }
        Ok(out)
    }
}

impl ModelEvaluation for ModelEvaluationData {
    fn equation_count(&self) -> usize {
        self.layout.equations.len()
    }

    fn evaluate_residual(&mut self, point: &DMatrix<f64>) -> Result<&DVector<f64>> {
        self.check_point(point)?;
        let flat = point.as_slice();
        for (row, eqn) in self.layout.equations.iter().enumerate() {
            self.inputs.clear();
            self.inputs
                .extend(self.layout.columns[row].iter().map(|&c| flat[c]));
            self.residual[row] = self.data[row].residual(eqn, &self.parameters, &self.inputs);
        }
        Ok(&self.residual)
    }

    fn evaluate_residual_and_jacobian(
        &mut self,
        point: &DMatrix<f64>,
    ) -> Result<(&DVector<f64>, &CsrMatrix<f64>)> {
        self.check_point(point)?;
        let flat = point.as_slice();
        let values = self.jacobian.values_mut();
        for (row, eqn) in self.layout.equations.iter().enumerate() {
            let n = self.layout.columns[row].len();
            self.inputs.clear();
            self.inputs
                .extend(self.layout.columns[row].iter().map(|&c| flat[c]));
            let gradient = &mut self.gradient[..n];
            self.residual[row] =
                self.data[row].residual_and_gradient(eqn, &self.parameters, &self.inputs, gradient);
            for (&pos, &g) in self.layout.positions[row].iter().zip(gradient.iter()) {
                values[pos] = g;
            }
        }
        Ok((&self.residual, &self.jacobian))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::VariableKind;

    fn assert_err_contains<T>(result: Result<T>, needle: &str) {
        let message = match result {
            Err(err) => format!("{err}"),
            Ok(_) => panic!("expected error containing \"{needle}\""),
        };
        assert!(
            message.contains(needle),
            "expected error to contain \"{needle}\", got \"{message}\""
        );
    }

    fn model() -> Model {
        let mut model = Model::new();
        model.add_variable("x", VariableKind::Variable).unwrap();
        model.add_variable("y", VariableKind::Variable).unwrap();
        model.add_parameter("a", 0.5).unwrap();
        model.add_equation("ex", "x[t] = a * x[t-1] + y[t+1]").unwrap();
        model.add_equation("ey", "y[t] = x[t] * x[t]").unwrap();
        model
    }

    #[test]
    fn residual_at_point() {
        let model = model();
        let mut med = ModelEvaluationData::new(&model).unwrap();
        assert_eq!(med.ntimes(), 3);
        // rows: t-1, t, t+1; columns: x, y
        let point = DMatrix::from_row_slice(3, 2, &[1.0, 0.0, 2.0, 3.0, 0.0, 4.0]);
        let r = med.evaluate_residual(&point).unwrap();
        assert!((r[0] - (2.0 - 0.5 * 1.0 - 4.0)).abs() < 1e-12);
        assert!((r[1] - (3.0 - 4.0)).abs() < 1e-12);
    }

    #[test]
    fn jacobian_lands_in_flattened_columns() {
        let model = model();
        let mut med = ModelEvaluationData::new(&model).unwrap();
        let point = DMatrix::from_row_slice(3, 2, &[1.0, 0.0, 2.0, 3.0, 0.0, 4.0]);
        let (_, jac) = med.evaluate_residual_and_jacobian(&point).unwrap();
        assert_eq!(jac.nrows(), 2);
        assert_eq!(jac.ncols(), 6);

        let x = |k| med_col(0, k);
        let y = |k| med_col(1, k);
        let dense = DMatrix::from(jac);
        assert_eq!(dense[(0, x(0))], 1.0);
        assert_eq!(dense[(0, x(-1))], -0.5);
        assert_eq!(dense[(0, y(1))], -1.0);
        assert_eq!(dense[(1, y(0))], 1.0);
        assert_eq!(dense[(1, x(0))], -4.0);
        assert_eq!(jac.nnz(), 5);
    }

    fn med_col(var: usize, offset: i32) -> usize {
        var * 3 + (1 + offset) as usize
    }

    #[test]
    fn pattern_is_stable_across_evaluations() {
        let model = model();
        let mut med = ModelEvaluationData::new(&model).unwrap();
        let p1 = DMatrix::from_element(3, 2, 1.0);
        let p2 = DMatrix::from_fn(3, 2, |i, j| (i * 2 + j) as f64 + 0.5);

        let (offsets1, indices1, values1) = {
            let (_, jac) = med.evaluate_residual_and_jacobian(&p1).unwrap();
            (
                jac.row_offsets().to_vec(),
                jac.col_indices().to_vec(),
                jac.values().to_vec(),
            )
        };
        let (_, jac) = med.evaluate_residual_and_jacobian(&p2).unwrap();
        assert_eq!(jac.row_offsets(), offsets1.as_slice());
        assert_eq!(jac.col_indices(), indices1.as_slice());
        assert_ne!(jac.values(), values1.as_slice());
    }

    #[test]
    fn clones_share_layout_but_not_buffers() {
        let model = model();
        let mut first = ModelEvaluationData::new(&model).unwrap();
        let mut second = first.clone();
        assert!(Rc::ptr_eq(&first.layout, &second.layout));

        let p1 = DMatrix::from_element(3, 2, 1.0);
        let p2 = DMatrix::from_element(3, 2, 2.0);
        let j1 = {
            let (_, jacobian) = first.evaluate_residual_and_jacobian(&p1).unwrap();
            jacobian.values().to_vec()
        };
        let (r2, j2) = second.evaluate_residual_and_jacobian(&p2).unwrap();
        assert!((r2[1] + 2.0).abs() < 1e-12);
        assert_ne!(j1.as_slice(), j2.values());

        // evaluating the clone left the original's buffers alone
        assert!(first.residual[1].abs() < 1e-12);
        assert_eq!(first.jacobian.values(), j1.as_slice());
    }

    #[test]
    fn column_mapping_round_trips() {
        let model = model();
        let med = ModelEvaluationData::new(&model).unwrap();
        let col = med.column_index(1, -1).unwrap();
        assert_eq!(med.column_of(col), (1, -1));
        assert!(med.column_index(0, 2).is_none());
        assert!(med.column_index(2, 0).is_none());
    }

    #[test]
    fn pinned_window_too_small_is_a_construction_error() {
        let mut model = model();
        model.set_window(0, 1);
        assert_err_contains(ModelEvaluationData::new(&model), "outside the window");
    }

    #[test]
    fn rejects_point_with_wrong_shape() {
        let model = model();
        let mut med = ModelEvaluationData::new(&model).unwrap();
        let point = DMatrix::zeros(2, 2);
        assert_err_contains(med.evaluate_residual(&point).map(|_| ()), "point");
    }

    #[test]
    fn parameter_changes_are_picked_up() {
        let model = model();
        let mut med = ModelEvaluationData::new(&model).unwrap();
        let point = DMatrix::from_element(3, 2, 1.0);
        let before = med.evaluate_residual(&point).unwrap()[0];
        model.set_parameter("a", 1.5).unwrap();
        let after = med.evaluate_residual(&point).unwrap()[0];
        assert!((before - after - 1.0).abs() < 1e-12);
    }

    #[test]
    fn range_evaluation_marks_boundaries_undefined() {
        let model = model();
        let mut med = ModelEvaluationData::new(&model).unwrap();
        let trajectory = DMatrix::from_fn(5, 2, |t, v| (t + v) as f64);
        let out = med.evaluate_equation_over_range(0, &trajectory, 0..5).unwrap();
        assert_eq!(out.len(), 5);
        assert!(out[0].is_nan());
        assert!(out[4].is_nan());
        for t in 1..4 {
            let expected = t as f64 - 0.5 * (t - 1) as f64 - (t + 2) as f64;
            assert!((out[t] - expected).abs() < 1e-12);
        }

        let inner = med.evaluate_equation_over_range(1, &trajectory, 0..5).unwrap();
        assert!(inner.iter().all(|v| v.is_finite()));

        assert_err_contains(
            med.evaluate_equation_over_range(0, &trajectory, 2..6),
            "outside the trajectory",
        );
        assert_err_contains(
            med.evaluate_equation_over_range(7, &trajectory, 0..1),
            "equation index",
        );
    }
}
