//! Projection of embeddings onto an axis pack.
//!
//! `project` is stateless and deterministic: every token is independent,
//! which makes it the unit of parallelism for batch work. Raw projections
//! are affine (`alpha = ((x − mu)ᵀQ) ∘ lambda + beta`); no cosine
//! normalization is applied anywhere, so magnitudes stay meaningful.

use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use crate::capacity::choquet;
use crate::error::CoreError;
use crate::pack::AxisPack;

/// Score bundle for one unit of text (token, span, or frame).
///
/// `alpha` is the raw affine projection, `u` its normalized form, `r` the
/// rectified positive evidence, `U` a weighted magnitude (overall
/// salience), `C` the Choquet utility (spans and frames only), `t` a gate
/// in [0,1] suppressing low-salience units, and `tau` the diffusion scale
/// the vector was computed at (0 = no diffusion).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxialVector {
    pub alpha: Vec<f64>,
    pub u: Vec<f64>,
    pub r: Vec<f64>,
    #[serde(rename = "U")]
    pub salience: f64,
    #[serde(rename = "C")]
    pub utility: Option<f64>,
    #[serde(rename = "t")]
    pub gate: f64,
    pub tau: f64,
}

/// Gate policy for `t`.
///
/// `t = 1` by default; with a salience floor configured,
/// `t = clamp(U / floor, 0, 1)`, so units well below the floor contribute
/// proportionally less to downstream aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct GatePolicy {
    pub salience_floor: Option<f64>,
}

impl GatePolicy {
    fn gate(&self, salience: f64) -> f64 {
        match self.salience_floor {
            Some(floor) if floor > 0.0 => (salience / floor).clamp(0.0, 1.0),
            _ => 1.0,
        }
    }
}

/// Project one embedding onto the pack, producing a token-level vector
/// (`C` unset, `tau = 0`).
///
/// Fails with `DimensionMismatch` when the embedding length differs from
/// the pack's `d`, and with `InvalidEmbedding` on any non-finite
/// component; NaN is never allowed to propagate silently.
pub fn project(
    embedding: &DVector<f64>,
    pack: &AxisPack,
    gate: &GatePolicy,
) -> Result<AxialVector, CoreError> {
    if embedding.len() != pack.d() {
        return Err(CoreError::DimensionMismatch {
            pack_id: pack.id.clone(),
            expected: pack.d(),
            actual: embedding.len(),
        });
    }
    if let Some(index) = embedding.iter().position(|x| !x.is_finite()) {
        return Err(CoreError::InvalidEmbedding { index });
    }

    let centered = match &pack.mu {
        Some(mu) => embedding - mu,
        None => embedding.clone(),
    };

    let k = pack.k();
    let mut alpha = vec![0.0; k];
    for i in 0..k {
        let coord = pack.q.column(i).dot(&centered);
        alpha[i] = coord * pack.lambda[i] + pack.beta[i];
    }
    Ok(axial_from_alpha(alpha, pack, 0.0, false, gate))
}

/// Assemble an [`AxialVector`] from raw per-axis projections.
///
/// `u`, `r`, `U`, and optionally `C` are recomputed here rather than
/// averaged by callers, which is what keeps the capacity-monotonicity
/// invariant intact after span aggregation.
pub fn axial_from_alpha(
    alpha: Vec<f64>,
    pack: &AxisPack,
    tau: f64,
    with_utility: bool,
    gate: &GatePolicy,
) -> AxialVector {
    let u = normalized(&alpha, pack);
    let r: Vec<f64> = u.iter().map(|x| x.max(0.0)).collect();
    finish(alpha, u, r, pack, tau, with_utility, gate)
}

/// Assemble an [`AxialVector`] from already-aggregated `alpha`/`u`/`r`
/// component vectors, recomputing `U` and (optionally) `C`.
pub fn axial_from_parts(
    alpha: Vec<f64>,
    u: Vec<f64>,
    r: Vec<f64>,
    pack: &AxisPack,
    tau: f64,
    with_utility: bool,
    gate: &GatePolicy,
) -> AxialVector {
    let r = r.into_iter().map(|x| x.max(0.0)).collect();
    finish(alpha, u, r, pack, tau, with_utility, gate)
}

fn normalized(alpha: &[f64], pack: &AxisPack) -> Vec<f64> {
    match &pack.scales {
        Some(scales) => alpha.iter().enumerate().map(|(i, a)| a / scales[i]).collect(),
        None => alpha.to_vec(),
    }
}

fn finish(
    alpha: Vec<f64>,
    u: Vec<f64>,
    r: Vec<f64>,
    pack: &AxisPack,
    tau: f64,
    with_utility: bool,
    gate: &GatePolicy,
) -> AxialVector {
    let mut weighted_sq = 0.0;
    for (i, a) in alpha.iter().enumerate() {
        weighted_sq += pack.weights[i] * a * a;
    }
    let salience = weighted_sq.max(0.0).sqrt();
    let utility = with_utility.then(|| choquet(&r, pack.capacity.as_ref(), &pack.weights));
    let t = gate.gate(salience);
    AxialVector {
        alpha,
        u,
        r,
        salience,
        utility,
        gate: t,
        tau,
    }
}
