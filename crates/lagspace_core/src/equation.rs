//! A declared model equation and its compiled evaluators.
//!
//! An `Equation` is built once from its text and never changes afterwards;
//! only the parameter values captured by its (possibly shared) compiled
//! evaluator are refreshed between evaluations.
//!
//! # Example
//!
//! ```
//! use lagspace_core::model::{Model, VariableKind};
//!
//! let mut model = Model::new();
//! model.add_variable("y", VariableKind::Variable).unwrap();
//! model.add_parameter("rho", 0.9).unwrap();
//! model.add_equation("ar1", "y[t] = rho * y[t-1]").unwrap();
//!
//! let eq = &model.equations()[0];
//! assert_eq!(eq.maxlag(), 1);
//! assert_eq!(eq.series_refs().len(), 2);
//! ```

use crate::equation_engine::{parse_equation, Expr};
use crate::errors::{CompileError, EquationError, ModelError, Result};
use crate::model::{Model, Parameters};
use crate::normalize::normalize;
use crate::registry::{CompiledFunction, EvaluatorRegistry};
use indexmap::IndexSet;
use std::fmt;
use std::rc::Rc;

pub struct Equation {
    name: String,
    source: String,
    expr: Expr,
    series: IndexSet<(String, i32)>,
    steady: IndexSet<String>,
    params: IndexSet<String>,
    linearize: bool,
    compiled: Rc<CompiledFunction>,
}

impl fmt::Debug for Equation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Equation")
            .field("name", &self.name)
            .field("source", &self.source)
            .field("series", &self.series)
            .field("steady", &self.steady)
            .field("params", &self.params)
            .field("linearize", &self.linearize)
            .finish()
    }
}

impl fmt::Display for Equation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.source)
    }
}

impl Equation {
    /// Parses `text`, expands its time operators and compiles it against the
    /// variables, parameters and evaluator registry of `model`.
    pub fn compile(name: &str, text: &str, model: &Model) -> Result<Self> {
        let wrap = |source: EquationError| ModelError::Equation {
            name: name.to_string(),
            text: text.to_string(),
            source,
        };

        let parsed = parse_equation(text).map_err(|e| wrap(e.into()))?;
        let is_variable = |n: &str| model.variable_index(n).is_some();
        let expr = normalize(&parsed.expr, &is_variable).map_err(|e| wrap(e.into()))?;
        let (series, steady, params) =
            collect_references(&expr, model).map_err(|e| wrap(e.into()))?;

        Self::from_parts(
            name,
            text,
            expr,
            series,
            steady,
            params,
            parsed.linearize,
            model.registry(),
        )
        .map_err(wrap)
    }

    /// Builds an equation from an already normalized expression and its
    /// ordered reference lists.
    #[allow(clippy::too_many_arguments)]
    pub fn from_parts(
        name: &str,
        source: &str,
        expr: Expr,
        series: IndexSet<(String, i32)>,
        steady: IndexSet<String>,
        params: IndexSet<String>,
        linearize: bool,
        registry: &EvaluatorRegistry,
    ) -> std::result::Result<Self, EquationError> {
        let compiled = registry.compile(&expr, &series, &steady, &params)?;
        Ok(Self {
            name: name.to_string(),
            source: source.to_string(),
            expr,
            series,
            steady,
            params,
            linearize,
            compiled,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    /// (variable, offset) pairs in input order.
    pub fn series_refs(&self) -> &IndexSet<(String, i32)> {
        &self.series
    }

    pub fn steady_refs(&self) -> &IndexSet<String> {
        &self.steady
    }

    pub fn param_refs(&self) -> &IndexSet<String> {
        &self.params
    }

    /// Flagged with `@lin`.
    pub fn linearize(&self) -> bool {
        self.linearize
    }

    pub fn compiled(&self) -> &Rc<CompiledFunction> {
        &self.compiled
    }

    pub fn maxlag(&self) -> usize {
        self.series
            .iter()
            .map(|(_, k)| (-i64::from(*k)).max(0) as usize)
            .max()
            .unwrap_or(0)
    }

    pub fn maxlead(&self) -> usize {
        self.series
            .iter()
            .map(|(_, k)| (*k).max(0) as usize)
            .max()
            .unwrap_or(0)
    }

    pub fn refresh(&self, params: &Parameters) {
        self.compiled.residual().refresh(params);
    }

    /// `inputs`: time-series values followed by steady-state values.
    pub fn residual(&self, inputs: &[f64]) -> f64 {
        self.compiled.residual().call(inputs)
    }

    pub fn residual_and_gradient(&self, inputs: &[f64], gradient: &mut [f64]) -> f64 {
        self.compiled.gradient().call(inputs, gradient)
    }
}

type References = (IndexSet<(String, i32)>, IndexSet<String>, IndexSet<String>);

/// Collects references in order of first appearance and checks each one
/// against the model.
fn collect_references(expr: &Expr, model: &Model) -> std::result::Result<References, CompileError> {
    let mut series = IndexSet::new();
    let mut steady = IndexSet::new();
    let mut params = IndexSet::new();
    let mut error = None;

    expr.visit(&mut |node| {
        if error.is_some() {
            return;
        }
        match node {
            Expr::Series(name, k) => {
                if model.variable_index(name).is_none() {
                    error = Some(CompileError::UnknownIdentifier(name.clone()));
                } else {
                    series.insert((name.clone(), *k));
                }
            }
            Expr::SteadyState(name) => {
                if model.variable_index(name).is_none() {
                    error = Some(CompileError::UnknownSteadyState(name.clone()));
                } else {
                    steady.insert(name.clone());
                }
            }
            Expr::Symbol(name) => {
                if model.parameters().contains(name) {
                    params.insert(name.clone());
                } else {
                    error = Some(CompileError::UnknownIdentifier(name.clone()));
                }
            }
            Expr::Indexed(name, _) => {
                error = Some(CompileError::MultipleTimeIndices(name.clone()));
            }
            _ => {}
        }
    });

    match error {
        Some(e) => Err(e),
        None => Ok((series, steady, params)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SyntaxError;
    use crate::model::VariableKind;

    fn model() -> Model {
        let mut model = Model::new();
        model.add_variable("x", VariableKind::Variable).unwrap();
        model.add_variable("y", VariableKind::Variable).unwrap();
        model.add_variable("e", VariableKind::Shock).unwrap();
        model.add_parameter("a", 0.5).unwrap();
        model
    }

    fn equation_error(result: Result<Equation>) -> EquationError {
        match result {
            Err(ModelError::Equation { source, .. }) => source,
            other => panic!("expected an equation error, got {other:?}"),
        }
    }

    #[test]
    fn references_are_ordered_by_first_appearance() {
        let model = model();
        let eq = Equation::compile("e1", "y[t] = a*x[t-1] + @sstate(x) + y[t] + e", &model)
            .expect("should compile");
        let series: Vec<_> = eq.series_refs().iter().cloned().collect();
        assert_eq!(
            series,
            vec![("y".to_string(), 0), ("x".to_string(), -1), ("e".to_string(), 0)]
        );
        assert_eq!(eq.steady_refs().len(), 1);
        assert_eq!(eq.param_refs().len(), 1);
        assert_eq!((eq.maxlag(), eq.maxlead()), (1, 0));
    }

    #[test]
    fn structurally_identical_equations_share_evaluators() {
        let model = model();
        let a = Equation::compile("a", "x[t] = a * y[t-1]", &model).unwrap();
        let b = Equation::compile("b", "x = a * lag(y)", &model).unwrap();
        let c = Equation::compile("c", "y[t] = a * x[t-1]", &model).unwrap();
        assert!(Rc::ptr_eq(a.compiled(), b.compiled()));
        assert!(!Rc::ptr_eq(a.compiled(), c.compiled()));
    }

    #[test]
    fn compile_errors_name_the_offending_symbol() {
        let model = model();
        assert_eq!(
            equation_error(Equation::compile("bad", "x = beta * y", &model)),
            EquationError::Compile(CompileError::UnknownIdentifier("beta".into()))
        );
        assert_eq!(
            equation_error(Equation::compile("bad", "x = z[t-1]", &model)),
            EquationError::Compile(CompileError::UnknownIdentifier("z".into()))
        );
        assert_eq!(
            equation_error(Equation::compile("bad", "x = @sstate(z)", &model)),
            EquationError::Compile(CompileError::UnknownSteadyState("z".into()))
        );
        assert_eq!(
            equation_error(Equation::compile("bad", "x = y[t][t]", &model)),
            EquationError::Syntax(SyntaxError::MultipleTimeIndices("y".into()))
        );
        assert!(matches!(
            equation_error(Equation::compile("bad", "x = y[t*2]", &model)),
            EquationError::Syntax(SyntaxError::UnsupportedTimeIndex(_))
        ));
        assert!(matches!(
            equation_error(Equation::compile("bad", "x = foo(y)", &model)),
            EquationError::Compile(CompileError::UnknownFunction { .. })
        ));
    }

    #[test]
    fn extreme_offsets_are_measured_or_rejected() {
        let model = model();
        let deep = Equation::compile("deep", "x = x[t-2147483647]", &model).unwrap();
        assert_eq!(deep.maxlag(), 2_147_483_647);
        assert_eq!(deep.maxlead(), 0);

        let far = Equation::compile("far", "x = x[t+2147483647]", &model).unwrap();
        assert_eq!((far.maxlag(), far.maxlead()), (0, 2_147_483_647));

        assert_eq!(
            equation_error(Equation::compile("over", "x = lag(x[t-2147483647])", &model)),
            EquationError::Syntax(SyntaxError::OffsetOutOfRange("x".into()))
        );
    }

    #[test]
    fn error_message_carries_equation_name_and_text() {
        let model = model();
        let err = Equation::compile("budget", "x = q", &model).unwrap_err();
        let message = format!("{err}");
        assert!(message.contains("budget"), "{message}");
        assert!(message.contains("x = q"), "{message}");
        assert!(message.contains("`q`"), "{message}");
    }

    #[test]
    fn lin_flag_is_kept() {
        let model = model();
        let eq = Equation::compile("l", "@lin x = exp(y)", &model).unwrap();
        assert!(eq.linearize());
    }
}
