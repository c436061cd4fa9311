//! First-order state-space form of a fully linearized model.
//!
//! The linear Jacobian is reorganized into
//!
//! ```text
//! FWD · s_t + BCK · s_{t-1} + EX · z_t = 0
//! ```
//!
//! where `s_t` stacks the backward slots (`v_t`, `v_{t-1}`, ...) followed by
//! the forward slots (`v_{t+1}`, `v_{t+2}`, ...), and `z_t` holds the
//! exogenous variables at each offset they are referenced at. Lags and leads
//! deeper than one period become chains of slots tied together by identity
//! rows appended after the model equations.

use crate::errors::{ModelError, Result};
use crate::evaluation::linearized::LinearizedEvaluationData;
use crate::model::Model;
use crate::traits::ModelEvaluation;
use indexmap::IndexMap;
use nalgebra::{DMatrix, DVector};
use nalgebra_sparse::CsrMatrix;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;

/// Slot key: variable name and folded time offset.
pub type SlotKey = (String, i32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SlotRole {
    Backward,
    Forward,
    Exogenous,
}

/// One column of `FWD`/`BCK` (or of `EX` for exogenous slots).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSlot {
    pub variable: String,
    pub offset: i32,
    pub role: SlotRole,
    pub column: usize,
}

/// Where a variable's slots start and how many there are.
#[derive(Debug, Clone, Copy, Default)]
struct SlotRange {
    first: usize,
    count: usize,
}

#[derive(Debug, Default)]
struct Layout {
    backward: IndexMap<SlotKey, usize>,
    forward: IndexMap<SlotKey, usize>,
    exogenous: IndexMap<SlotKey, usize>,
    /// Identity rows as (column in `FWD`, column in `BCK`).
    links: Vec<(usize, usize)>,
}

#[derive(Clone)]
pub struct FirstOrderData {
    data: LinearizedEvaluationData,
    backward: IndexMap<SlotKey, usize>,
    forward: IndexMap<SlotKey, usize>,
    exogenous: IndexMap<SlotKey, usize>,
    links: usize,
    fwd: DMatrix<f64>,
    bck: DMatrix<f64>,
    ex: DMatrix<f64>,
}

impl FirstOrderData {
    /// Builds the state-space matrices from `data`.
    ///
    /// Every equation must be linearized, so `data` has to come from
    /// [`LinearizedEvaluationData::full`]. Data from
    /// [`LinearizedEvaluationData::selective`] with any unflagged equation is
    /// rejected with [`ModelError::Linearization`].
    pub fn new(model: &Model, mut data: LinearizedEvaluationData) -> Result<Self> {
        if !data.is_fully_linear() {
            return Err(ModelError::Linearization(format!(
                "first-order form needs every equation linearized, build it from \
                 LinearizedEvaluationData::full ({} of {} equations are linearized)",
                data.linearized_rows().len(),
                data.equation_count()
            )));
        }

        let layout = classify(model, &data)?;
        let nbck = layout.backward.len();
        let nstate = nbck + layout.forward.len();
        let nex = layout.exogenous.len();
        let neq = data.equation_count();
        if neq + layout.links.len() != nstate {
            return Err(ModelError::DimensionMismatch {
                what: "first-order system",
                expected: format!("{nstate} rows"),
                got: format!("{neq} equations and {} links", layout.links.len()),
            });
        }

        // The gradients are frozen, so any point gives the same Jacobian.
        let point = data.expansion_point().clone();
        let entries: Vec<(usize, usize, f64)> = {
            let (_, jacobian) = data.evaluate_residual_and_jacobian(&point)?;
            jacobian
                .triplet_iter()
                .map(|(row, col, value)| (row, col, *value))
                .collect()
        };

        let mut fwd = DMatrix::zeros(nstate, nstate);
        let mut bck = DMatrix::zeros(nstate, nstate);
        let mut ex = DMatrix::zeros(nstate, nex);
        let base = data.base();
        for (row, col, value) in entries {
            let (var, offset) = base.column_of(col);
            let name = &base.variables()[var];
            let exogenous = model.variable(var).is_some_and(|v| v.kind.is_exogenous());
            if exogenous {
                ex[(row, slot(&layout.exogenous, name, offset)?)] += value;
            } else if offset < 0 {
                bck[(row, slot(&layout.backward, name, offset + 1)?)] += value;
            } else if offset > 0 {
                fwd[(row, slot(&layout.forward, name, offset - 1)?)] += value;
            } else if let Some(&column) = layout.backward.get(&(name.clone(), 0)) {
                fwd[(row, column)] += value;
            } else {
                bck[(row, slot(&layout.forward, name, 0)?)] += value;
            }
        }
        for (i, &(lead, lag)) in layout.links.iter().enumerate() {
            fwd[(neq + i, lead)] = 1.0;
            bck[(neq + i, lag)] = -1.0;
        }

        debug!(
            backward = nbck,
            forward = layout.forward.len(),
            exogenous = nex,
            links = layout.links.len(),
            "assembled first-order system"
        );

        Ok(Self {
            data,
            backward: layout.backward,
            forward: layout.forward,
            exogenous: layout.exogenous,
            links: layout.links.len(),
            fwd,
            bck,
            ex,
        })
    }

    pub fn fwd(&self) -> &DMatrix<f64> {
        &self.fwd
    }

    pub fn bck(&self) -> &DMatrix<f64> {
        &self.bck
    }

    pub fn ex(&self) -> &DMatrix<f64> {
        &self.ex
    }

    /// Backward slot → column of `FWD`/`BCK`, in `[0, nbck)`.
    pub fn backward(&self) -> &IndexMap<SlotKey, usize> {
        &self.backward
    }

    /// Forward slot → column of `FWD`/`BCK`, in `[nbck, nbck + nfwd)`.
    pub fn forward(&self) -> &IndexMap<SlotKey, usize> {
        &self.forward
    }

    /// Exogenous slot → column of `EX`.
    pub fn exogenous(&self) -> &IndexMap<SlotKey, usize> {
        &self.exogenous
    }

    pub fn state_dim(&self) -> usize {
        self.backward.len() + self.forward.len()
    }

    /// Identity rows appended after the model equations.
    pub fn link_count(&self) -> usize {
        self.links
    }

    /// State columns in order, backward slots first.
    pub fn state_slots(&self) -> Vec<StateSlot> {
        let backward = self.backward.iter().map(|(k, &c)| (k, c, SlotRole::Backward));
        let forward = self.forward.iter().map(|(k, &c)| (k, c, SlotRole::Forward));
        backward
            .chain(forward)
            .map(|((variable, offset), column, role)| StateSlot {
                variable: variable.clone(),
                offset: *offset,
                role,
                column,
            })
            .collect()
    }

    pub fn exogenous_slots(&self) -> Vec<StateSlot> {
        self.exogenous
            .iter()
            .map(|((variable, offset), &column)| StateSlot {
                variable: variable.clone(),
                offset: *offset,
                role: SlotRole::Exogenous,
                column,
            })
            .collect()
    }

    pub fn linearized(&self) -> &LinearizedEvaluationData {
        &self.data
    }
}

impl ModelEvaluation for FirstOrderData {
    fn equation_count(&self) -> usize {
        self.data.equation_count()
    }

    fn evaluate_residual(&mut self, point: &DMatrix<f64>) -> Result<&DVector<f64>> {
        self.data.evaluate_residual(point)
    }

    fn evaluate_residual_and_jacobian(
        &mut self,
        point: &DMatrix<f64>,
    ) -> Result<(&DVector<f64>, &CsrMatrix<f64>)> {
        self.data.evaluate_residual_and_jacobian(point)
    }
}

fn slot(map: &IndexMap<SlotKey, usize>, name: &str, offset: i32) -> Result<usize> {
    map.get(&(name.to_string(), offset))
        .copied()
        .ok_or_else(|| ModelError::Linearization(format!("no state slot for `{name}[t{offset:+}]`")))
}

/// Assigns slots to every variable from the offsets it is referenced at and
/// lists the identity rows that chain them.
fn classify(model: &Model, data: &LinearizedEvaluationData) -> Result<Layout> {
    let base = data.base();
    let names = base.variables();
    let mut offsets = vec![BTreeSet::new(); names.len()];
    for eqn in base.equations() {
        for (name, offset) in eqn.series_refs() {
            let var = model
                .variable_index(name)
                .ok_or_else(|| ModelError::UnknownVariable(name.clone()))?;
            offsets[var].insert(*offset);
        }
    }

    let mut layout = Layout::default();
    let mut spans = Vec::with_capacity(names.len());
    for (var, name) in names.iter().enumerate() {
        let refs = &offsets[var];
        if model.variable(var).is_some_and(|v| v.kind.is_exogenous()) {
            for &offset in refs {
                let column = layout.exogenous.len();
                layout.exogenous.insert((name.clone(), offset), column);
            }
            spans.push(None);
            continue;
        }

        let lags = refs.first().map_or(0, |&k| (-i64::from(k)).max(0)) as usize;
        let leads = refs.last().map_or(0, |&k| k.max(0)) as usize;
        let mut backward = SlotRange::default();
        if lags > 0 || leads == 0 {
            backward.first = layout.backward.len();
            backward.count = lags.max(1);
            for j in 0..backward.count {
                let column = layout.backward.len();
                layout.backward.insert((name.clone(), -(j as i32)), column);
            }
        }
        let forward = SlotRange {
            first: layout.forward.len(),
            count: leads,
        };
        for j in 0..leads {
            let column = layout.forward.len();
            layout.forward.insert((name.clone(), j as i32), column);
        }
        spans.push(Some((backward, forward)));
    }

    let nbck = layout.backward.len();
    for column in layout.forward.values_mut() {
        *column += nbck;
    }

    for (backward, forward) in spans.into_iter().flatten() {
        let forward = SlotRange {
            first: forward.first + nbck,
            ..forward
        };
        for j in 1..backward.count {
            layout
                .links
                .push((backward.first + j, backward.first + j - 1));
        }
        for j in 1..forward.count {
            layout.links.push((forward.first + j - 1, forward.first + j));
        }
        if backward.count > 0 && forward.count > 0 {
            layout.links.push((backward.first, forward.first));
        }
    }
    Ok(layout)
}
