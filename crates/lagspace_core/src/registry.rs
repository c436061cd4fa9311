//! Compiled evaluators and the per-model cache that deduplicates them.
//!
//! An equation compiles to a [`CompiledFunction`]: a residual evaluator
//! (bytecode run on `f64`) and a gradient evaluator (the same bytecode run
//! on chunked dual numbers). Inputs are the equation's time-series
//! references followed by its steady-state references.
//!
//! Structurally identical equations (same normalized expression and same
//! reference lists) share one `CompiledFunction` through the
//! [`EvaluatorRegistry`], so the number of evaluators is bounded by the
//! number of distinct equation shapes rather than the number of equations.

use crate::autodiff::{Dual, CHUNK_SIZE};
use crate::equation_engine::{Bytecode, Compiler, Expr, VM};
use crate::errors::CompileError;
use crate::model::Parameters;
use indexmap::IndexSet;
use std::cell::RefCell;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;
use tracing::debug;

/// Parameter values captured by an evaluator, stamped with the revision of
/// the parameter store they were copied from.
#[derive(Debug, Clone, Default)]
struct ParameterBinding {
    values: Vec<f64>,
    revision: Option<u64>,
}

/// Residual evaluator: ℝⁿ → ℝ.
#[derive(Debug)]
pub struct ResidualFn {
    bytecode: Bytecode,
    n_inputs: usize,
    param_names: Vec<String>,
    binding: RefCell<ParameterBinding>,
    stack: RefCell<Vec<f64>>,
}

impl ResidualFn {
    fn new(bytecode: Bytecode, n_inputs: usize, params: &IndexSet<String>) -> Self {
        let stack = Vec::with_capacity(bytecode.max_stack);
        Self {
            bytecode,
            n_inputs,
            param_names: params.iter().cloned().collect(),
            binding: RefCell::new(ParameterBinding {
                values: vec![f64::NAN; params.len()],
                revision: None,
            }),
            stack: RefCell::new(stack),
        }
    }

    pub fn n_inputs(&self) -> usize {
        self.n_inputs
    }

    pub fn bytecode(&self) -> &Bytecode {
        &self.bytecode
    }

    /// Copies current parameter values if `params` moved on since the last
    /// refresh. Returns whether a copy happened.
    pub fn refresh(&self, params: &Parameters) -> bool {
        let revision = params.revision();
        let mut binding = self.binding.borrow_mut();
        if binding.revision == Some(revision) {
            return false;
        }
        for (slot, name) in binding.values.iter_mut().zip(&self.param_names) {
            *slot = params.get(name).unwrap_or(f64::NAN);
        }
        binding.revision = Some(revision);
        true
    }

    pub fn call(&self, inputs: &[f64]) -> f64 {
        debug_assert_eq!(inputs.len(), self.n_inputs);
        let binding = self.binding.borrow();
        let mut stack = self.stack.borrow_mut();
        VM::execute(&self.bytecode, inputs, &binding.values, &mut stack)
    }
}

#[derive(Debug, Default)]
struct GradientWorkspace {
    inputs: Vec<Dual>,
    params: Vec<Dual>,
    stack: Vec<Dual>,
}

/// Residual plus gradient via forward-mode AD, `CHUNK_SIZE` directions
/// per pass.
#[derive(Debug)]
pub struct GradientFn {
    inner: Rc<ResidualFn>,
    workspace: RefCell<GradientWorkspace>,
}

impl GradientFn {
    fn new(inner: Rc<ResidualFn>) -> Self {
        let workspace = GradientWorkspace {
            inputs: Vec::with_capacity(inner.n_inputs),
            params: Vec::with_capacity(inner.param_names.len()),
            stack: Vec::with_capacity(inner.bytecode.max_stack),
        };
        Self {
            inner,
            workspace: RefCell::new(workspace),
        }
    }

    pub fn residual(&self) -> &Rc<ResidualFn> {
        &self.inner
    }

    /// Writes ∂f/∂inputs into `gradient[..n]` and returns f(inputs).
    pub fn call(&self, inputs: &[f64], gradient: &mut [f64]) -> f64 {
        let n = self.inner.n_inputs;
        debug_assert_eq!(inputs.len(), n);
        debug_assert!(gradient.len() >= n);

        let binding = self.inner.binding.borrow();
        let mut guard = self.workspace.borrow_mut();
        let ws = &mut *guard;

        ws.params.clear();
        ws.params
            .extend(binding.values.iter().map(|&p| Dual::constant(p)));

        let mut value = f64::NAN;
        let passes = n.div_ceil(CHUNK_SIZE).max(1);
        for pass in 0..passes {
            let start = pass * CHUNK_SIZE;
            let end = (start + CHUNK_SIZE).min(n);

            ws.inputs.clear();
            ws.inputs.extend(inputs.iter().enumerate().map(|(i, &x)| {
                let dir = (start..end).contains(&i).then(|| i - start);
                Dual::seeded(x, dir)
            }));

            let out = VM::execute(&self.inner.bytecode, &ws.inputs, &ws.params, &mut ws.stack);
            value = out.val;
            for i in start..end {
                gradient[i] = out.eps[i - start];
            }
        }
        value
    }
}

/// A residual/gradient evaluator pair for one equation shape.
pub struct CompiledFunction {
    fingerprint: String,
    residual: Rc<ResidualFn>,
    gradient: GradientFn,
}

impl CompiledFunction {
    fn new(fingerprint: String, bytecode: Bytecode, n_inputs: usize, params: &IndexSet<String>) -> Self {
        let residual = Rc::new(ResidualFn::new(bytecode, n_inputs, params));
        let gradient = GradientFn::new(Rc::clone(&residual));
        Self {
            fingerprint,
            residual,
            gradient,
        }
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn residual(&self) -> &ResidualFn {
        &self.residual
    }

    pub fn gradient(&self) -> &GradientFn {
        &self.gradient
    }
}

impl fmt::Debug for CompiledFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledFunction")
            .field("fingerprint", &self.fingerprint)
            .field("inputs", &self.residual.n_inputs)
            .finish()
    }
}

/// Canonical serialization of everything that determines an evaluator.
pub fn fingerprint(
    expr: &Expr,
    series: &IndexSet<(String, i32)>,
    steady: &IndexSet<String>,
    params: &IndexSet<String>,
) -> String {
    let series: Vec<String> = series
        .iter()
        .map(|(name, k)| format!("{name}{k:+}"))
        .collect();
    let steady: Vec<&str> = steady.iter().map(String::as_str).collect();
    let params: Vec<&str> = params.iter().map(String::as_str).collect();
    format!(
        "{expr}|{}|{}|{}",
        series.join(","),
        steady.join(","),
        params.join(",")
    )
}

/// Content-addressed cache of compiled evaluators, one per model.
/// Buckets are keyed by hash; hits require an exact fingerprint match.
#[derive(Debug, Default)]
pub struct EvaluatorRegistry {
    table: RefCell<HashMap<u64, Vec<Rc<CompiledFunction>>>>,
}

impl EvaluatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached evaluator for this shape, compiling it on a miss.
    pub fn compile(
        &self,
        expr: &Expr,
        series: &IndexSet<(String, i32)>,
        steady: &IndexSet<String>,
        params: &IndexSet<String>,
    ) -> Result<Rc<CompiledFunction>, CompileError> {
        let fingerprint = fingerprint(expr, series, steady, params);
        let mut hasher = DefaultHasher::new();
        fingerprint.hash(&mut hasher);
        let key = hasher.finish();

        let mut table = self.table.borrow_mut();
        let hit = table
            .get(&key)
            .and_then(|bucket| bucket.iter().find(|c| c.fingerprint == fingerprint));
        if let Some(hit) = hit {
            debug!(fingerprint = %fingerprint, "reusing compiled evaluator");
            return Ok(Rc::clone(hit));
        }

        let bytecode = Compiler::new(series, steady, params).compile(expr)?;
        let compiled = Rc::new(CompiledFunction::new(
            fingerprint,
            bytecode,
            series.len() + steady.len(),
            params,
        ));
        table.entry(key).or_default().push(Rc::clone(&compiled));
        Ok(compiled)
    }

    /// Number of distinct evaluators.
    pub fn len(&self) -> usize {
        self.table.borrow().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
