use crate::equation::Equation;
use crate::model::{Model, Parameters};
use tracing::warn;

/// First-order Taylor expansion of one equation.
///
/// `value(x) = residual + gradient · (x - point)`; the gradient does not
/// depend on `x`.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearizedEquation {
    pub residual: f64,
    pub gradient: Vec<f64>,
    pub point: Vec<f64>,
}

impl LinearizedEquation {
    pub fn value(&self, x: &[f64]) -> f64 {
        self.residual
            + self
                .gradient
                .iter()
                .zip(x.iter().zip(&self.point))
                .map(|(g, (x, p))| g * (x - p))
                .sum::<f64>()
    }
}

/// How one equation is evaluated inside the model-level evaluation data.
///
/// `x` always holds the equation's time-series inputs only; the variants
/// differ in what they add to it and how they produce the gradient.
#[derive(Debug, Clone)]
pub enum EquationData {
    /// No steady-state references: inputs go straight to the evaluator.
    Dynamic,
    /// Steady-state levels appended to the inputs on every call.
    SteadyStateBound {
        values: Vec<f64>,
        inputs: Vec<f64>,
        gradient: Vec<f64>,
    },
    Linearized(LinearizedEquation),
}

impl EquationData {
    /// Chooses `Dynamic` or `SteadyStateBound` for `eqn`.
    ///
    /// Steady-state references are bound to their level. A non-zero slope is
    /// reported and otherwise ignored.
    pub fn for_equation(eqn: &Equation, model: &Model) -> Self {
        if eqn.steady_refs().is_empty() {
            return EquationData::Dynamic;
        }
        let tolerance = model.options.tolerance;
        let steady_state = model.steady_state();
        let values = eqn
            .steady_refs()
            .iter()
            .map(|name| match model.variable_index(name) {
                Some(idx) => {
                    let slope = steady_state.slope(idx);
                    if slope.abs() > tolerance {
                        warn!(
                            equation = eqn.name(),
                            variable = name.as_str(),
                            slope,
                            "steady-state reference has non-zero slope; using the level only"
                        );
                    }
                    steady_state.level(idx)
                }
                None => f64::NAN,
            })
            .collect::<Vec<_>>();
        let n = eqn.series_refs().len() + values.len();
        EquationData::SteadyStateBound {
            values,
            inputs: Vec::with_capacity(n),
            gradient: vec![0.0; n],
        }
    }

    pub fn is_linearized(&self) -> bool {
        matches!(self, EquationData::Linearized(_))
    }

    pub fn residual(&mut self, eqn: &Equation, params: &Parameters, x: &[f64]) -> f64 {
        match self {
            EquationData::Dynamic => {
                eqn.refresh(params);
                eqn.residual(x)
            }
            EquationData::SteadyStateBound { values, inputs, .. } => {
                eqn.refresh(params);
                inputs.clear();
                inputs.extend_from_slice(x);
                inputs.extend_from_slice(values);
                eqn.residual(inputs)
            }
            EquationData::Linearized(lin) => lin.value(x),
        }
    }

    /// Writes the gradient w.r.t. `x` into `gradient[..x.len()]`.
    pub fn residual_and_gradient(
        &mut self,
        eqn: &Equation,
        params: &Parameters,
        x: &[f64],
        gradient: &mut [f64],
    ) -> f64 {
        match self {
            EquationData::Dynamic => {
                eqn.refresh(params);
                eqn.residual_and_gradient(x, gradient)
            }
            EquationData::SteadyStateBound {
                values,
                inputs,
                gradient: full,
            } => {
                eqn.refresh(params);
                inputs.clear();
                inputs.extend_from_slice(x);
                inputs.extend_from_slice(values);
                full.resize(inputs.len(), 0.0);
                let value = eqn.residual_and_gradient(inputs, full);
                gradient[..x.len()].copy_from_slice(&full[..x.len()]);
                value
            }
            EquationData::Linearized(lin) => {
                gradient[..x.len()].copy_from_slice(&lin.gradient);
                lin.value(x)
            }
        }
    }
}
