use anyhow::{bail, Result};
use lagspace_core::traits::ModelEvaluation;
use lagspace_core::{
    FirstOrderData, LinearizedEvaluationData, Model, ModelError, ModelEvaluationData, VariableKind,
};
use nalgebra::DMatrix;
use std::rc::Rc;

/// Small real-business-cycle style model around a zero steady state.
fn rbc() -> Result<Model> {
    let mut model = Model::new();
    model.add_variable("y", VariableKind::Variable)?;
    model.add_variable("k", VariableKind::Variable)?;
    model.add_variable("c", VariableKind::Variable)?;
    model.add_variable("a", VariableKind::Variable)?;
    model.add_variable("eps", VariableKind::Shock)?;
    model.add_parameter("alpha", 0.33)?;
    model.add_parameter("beta", 0.99)?;
    model.add_parameter("delta", 0.025)?;
    model.add_parameter("rho", 0.9)?;

    model.add_equation("output", "@lin y = a + alpha * lag(k)")?;
    model.add_equation("capital", "@lin k = (1 - delta) * lag(k) + delta * (y - c)")?;
    model.add_equation("euler", "@lin c = lead(c) - (1 - beta) * lead(y)")?;
    model.add_equation("tfp", "a = rho * lag(a) + eps")?;
    Ok(model)
}

#[test]
fn different_references_get_distinct_evaluators() -> Result<()> {
    let mut model = rbc()?;
    model.add_variable("z", VariableKind::Variable)?;
    model.add_equation("copy", "z = rho * lag(z) + eps")?;

    let tfp = &model.equations()[3];
    let copy = &model.equations()[4];
    assert!(!Rc::ptr_eq(tfp.compiled(), copy.compiled()));
    assert_eq!((model.maxlag(), model.maxlead()), (1, 1));
    Ok(())
}

#[test]
fn structurally_identical_equations_share_one_evaluator() -> Result<()> {
    let mut model = Model::new();
    model.add_variable("x", VariableKind::Variable)?;
    model.add_parameter("rho", 0.5)?;
    model.add_equation("first", "x[t] = rho * x[t-1]")?;
    model.add_equation("second", "x = rho * lag(x, 1)")?;
    assert!(Rc::ptr_eq(
        model.equations()[0].compiled(),
        model.equations()[1].compiled()
    ));
    assert_eq!(model.registry().len(), 1);
    Ok(())
}

#[test]
fn unknown_identifiers_fail_at_compile_time() -> Result<()> {
    let mut model = rbc()?;
    match model.add_equation("bad", "y = gamma * k") {
        Err(ModelError::Equation { name, text, .. }) => {
            assert_eq!(name, "bad");
            assert_eq!(text, "y = gamma * k");
        }
        Err(other) => bail!("unexpected error: {other}"),
        Ok(()) => bail!("equation with an unknown parameter compiled"),
    }
    Ok(())
}

#[test]
fn residual_and_jacobian_over_the_window() -> Result<()> {
    let model = rbc()?;
    let mut data = ModelEvaluationData::new(&model)?;
    assert_eq!(data.ntimes(), 3);
    assert_eq!(data.equation_count(), 4);

    let point = DMatrix::from_fn(3, 5, |row, var| 0.1 * (row + 1) as f64 + 0.01 * var as f64);
    let (residual, jacobian) = data.evaluate_residual_and_jacobian(&point)?;
    assert_eq!(residual.len(), 4);
    assert_eq!(jacobian.ncols(), 15);

    // output: y[t] - a[t] - alpha * k[t-1]
    let expected = point[(1, 0)] - point[(1, 3)] - 0.33 * point[(0, 1)];
    assert!((residual[0] - expected).abs() < 1e-12);
    Ok(())
}

#[test]
fn range_evaluation_over_a_trajectory() -> Result<()> {
    let model = rbc()?;
    let mut data = ModelEvaluationData::new(&model)?;
    let trajectory = DMatrix::from_fn(6, 5, |t, var| (t * 5 + var) as f64 * 0.1);

    let euler = data.evaluate_equation_over_range(2, &trajectory, 0..6)?;
    assert!(euler[..5].iter().all(|v| v.is_finite()));
    assert!(euler[5].is_nan());

    let tfp = data.evaluate_equation_over_range(3, &trajectory, 0..6)?;
    assert!(tfp[0].is_nan());
    assert!(tfp[1..].iter().all(|v| v.is_finite()));

    assert!(matches!(
        data.evaluate_equation_over_range(3, &trajectory, 4..7),
        Err(ModelError::RangeOutOfBounds { .. })
    ));
    Ok(())
}

#[test]
fn linearize_then_transform_to_first_order() -> Result<()> {
    let mut model = rbc()?;
    for name in ["y", "k", "c", "a", "eps"] {
        model.set_steady_state(name, 0.0, 0.0)?;
    }

    let base = ModelEvaluationData::new(&model)?;
    let selective = LinearizedEvaluationData::selective(&model, base)?;
    assert_eq!(selective.linearized_rows(), &[0, 1, 2]);
    assert!(FirstOrderData::new(&model, selective).is_err());

    let base = ModelEvaluationData::new(&model)?;
    let full = LinearizedEvaluationData::full(&model, base)?;
    let mut fo = FirstOrderData::new(&model, full)?;

    // k and a are lagged, y and c are led, eps is the only exogenous input
    assert_eq!(fo.backward().len(), 2);
    assert_eq!(fo.forward().len(), 2);
    assert_eq!(fo.exogenous().len(), 1);
    assert_eq!(fo.link_count(), 0);
    assert_eq!(fo.fwd().shape(), (4, 4));
    assert_eq!(fo.ex().shape(), (4, 1));
    assert_eq!(fo.ex()[(3, 0)], -1.0);

    let point = DMatrix::zeros(3, 5);
    let residual = fo.evaluate_residual(&point)?;
    assert!(residual.iter().all(|r| r.abs() < 1e-12));
    Ok(())
}
