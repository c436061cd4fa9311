//! Model container: variables, parameters, steady state and equations.

use crate::equation::Equation;
use crate::errors::{ModelError, Result};
use crate::registry::EvaluatorRegistry;
use indexmap::IndexMap;
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VariableKind {
    Variable,
    Exogenous,
    Shock,
}

impl VariableKind {
    /// Exogenous variables and shocks are not part of the state vector.
    pub fn is_exogenous(self) -> bool {
        matches!(self, VariableKind::Exogenous | VariableKind::Shock)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelVariable {
    pub name: String,
    pub kind: VariableKind,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EvaluationOptions {
    /// Threshold for "effectively zero" slopes and residuals.
    pub tolerance: f64,
}

impl Default for EvaluationOptions {
    fn default() -> Self {
        Self { tolerance: 1e-12 }
    }
}

/// Parameter values with a revision counter that moves on every write.
///
/// Shared between the model and its evaluation data; compiled evaluators
/// compare their own stamp against `revision()` to decide whether to copy.
#[derive(Debug, Default)]
pub struct Parameters {
    values: RefCell<IndexMap<String, f64>>,
    revision: Cell<u64>,
}

impl Parameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, name: &str, value: f64) -> Result<()> {
        let mut values = self.values.borrow_mut();
        if values.contains_key(name) {
            return Err(ModelError::Duplicate {
                kind: "parameter",
                name: name.to_string(),
            });
        }
        values.insert(name.to_string(), value);
        self.bump();
        Ok(())
    }

    pub fn set(&self, name: &str, value: f64) -> Result<()> {
        let mut values = self.values.borrow_mut();
        let slot = values
            .get_mut(name)
            .ok_or_else(|| ModelError::UnknownParameter(name.to_string()))?;
        *slot = value;
        self.bump();
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.borrow().get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.borrow().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.values.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn revision(&self) -> u64 {
        self.revision.get()
    }

    fn bump(&self) {
        self.revision.set(self.revision.get() + 1);
    }
}

/// Per-variable steady state: a level, a slope (linear trend) and whether it
/// has been solved.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SteadyState {
    level: Vec<f64>,
    slope: Vec<f64>,
    solved: Vec<bool>,
}

impl SteadyState {
    fn push(&mut self) {
        self.level.push(0.0);
        self.slope.push(0.0);
        self.solved.push(false);
    }

    pub fn level(&self, var: usize) -> f64 {
        self.level.get(var).copied().unwrap_or(f64::NAN)
    }

    pub fn slope(&self, var: usize) -> f64 {
        self.slope.get(var).copied().unwrap_or(0.0)
    }

    pub fn is_solved(&self, var: usize) -> bool {
        self.solved.get(var).copied().unwrap_or(false)
    }

    pub fn all_solved(&self) -> bool {
        self.solved.iter().all(|s| *s)
    }

    /// The steady-state trajectory over a `maxlag + maxlead + 1` window,
    /// with time `0` at row `maxlag`.
    pub fn window(&self, maxlag: usize, maxlead: usize) -> DMatrix<f64> {
        let ntimes = maxlag + maxlead + 1;
        DMatrix::from_fn(ntimes, self.level.len(), |row, var| {
            let t = row as f64 - maxlag as f64;
            self.level[var] + self.slope[var] * t
        })
    }
}

/// The collaborator the evaluation pipeline reads from.
#[derive(Debug, Default)]
pub struct Model {
    variables: IndexMap<String, ModelVariable>,
    parameters: Rc<Parameters>,
    equations: Vec<Rc<Equation>>,
    steady_state: SteadyState,
    registry: EvaluatorRegistry,
    window: Option<(usize, usize)>,
    pub options: EvaluationOptions,
}

impl Model {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_variable(&mut self, name: &str, kind: VariableKind) -> Result<()> {
        if self.variables.contains_key(name) || self.parameters.contains(name) {
            return Err(ModelError::Duplicate {
                kind: "variable",
                name: name.to_string(),
            });
        }
        self.variables.insert(
            name.to_string(),
            ModelVariable {
                name: name.to_string(),
                kind,
            },
        );
        self.steady_state.push();
        Ok(())
    }

    pub fn add_parameter(&mut self, name: &str, value: f64) -> Result<()> {
        if self.variables.contains_key(name) {
            return Err(ModelError::Duplicate {
                kind: "parameter",
                name: name.to_string(),
            });
        }
        self.parameters.insert(name, value)
    }

    /// Parses, normalizes and compiles `text`, then appends it.
    /// A leading `@lin` flags the equation for selective linearization.
    pub fn add_equation(&mut self, name: &str, text: &str) -> Result<()> {
        if self.equations.iter().any(|e| e.name() == name) {
            return Err(ModelError::Duplicate {
                kind: "equation",
                name: name.to_string(),
            });
        }
        let equation = Equation::compile(name, text, self)?;
        debug!(
            equation = name,
            inputs = equation.series_refs().len() + equation.steady_refs().len(),
            evaluators = self.registry.len(),
            "compiled equation"
        );
        self.equations.push(Rc::new(equation));
        Ok(())
    }

    pub fn set_parameter(&self, name: &str, value: f64) -> Result<()> {
        self.parameters.set(name, value)
    }

    pub fn set_steady_state(&mut self, name: &str, level: f64, slope: f64) -> Result<()> {
        let idx = self
            .variable_index(name)
            .ok_or_else(|| ModelError::UnknownVariable(name.to_string()))?;
        self.steady_state.level[idx] = level;
        self.steady_state.slope[idx] = slope;
        self.steady_state.solved[idx] = true;
        Ok(())
    }

    /// Pins the evaluation window instead of deriving it from the equations.
    pub fn set_window(&mut self, maxlag: usize, maxlead: usize) {
        self.window = Some((maxlag, maxlead));
    }

    pub fn maxlag(&self) -> usize {
        match self.window {
            Some((maxlag, _)) => maxlag,
            None => self.equations.iter().map(|e| e.maxlag()).max().unwrap_or(0),
        }
    }

    pub fn maxlead(&self) -> usize {
        match self.window {
            Some((_, maxlead)) => maxlead,
            None => self.equations.iter().map(|e| e.maxlead()).max().unwrap_or(0),
        }
    }

    pub fn variables(&self) -> impl ExactSizeIterator<Item = &ModelVariable> {
        self.variables.values()
    }

    pub fn variable(&self, idx: usize) -> Option<&ModelVariable> {
        self.variables.get_index(idx).map(|(_, v)| v)
    }

    pub fn variable_index(&self, name: &str) -> Option<usize> {
        self.variables.get_index_of(name)
    }

    pub fn equations(&self) -> &[Rc<Equation>] {
        &self.equations
    }

    pub fn parameters(&self) -> &Rc<Parameters> {
        &self.parameters
    }

    pub fn steady_state(&self) -> &SteadyState {
        &self.steady_state
    }

    /// Steady state over this model's evaluation window.
    pub fn steady_state_point(&self) -> DMatrix<f64> {
        self.steady_state.window(self.maxlag(), self.maxlead())
    }

    pub fn registry(&self) -> &EvaluatorRegistry {
        &self.registry
    }
}
