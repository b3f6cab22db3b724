//! Span aggregation, skip relations, and multi-scale diffusion.
//!
//! Three layers of structure over the token sequence:
//!
//! - **Contiguous spans**: every window `[i, j)` up to a configured
//!   maximum length.
//! - **Skip relations**: non-adjacent token pairs separated by up to
//!   `max_skip` positions, weighted by inverse distance. These model
//!   long-range dependency (a subject and a verb separated by a clause)
//!   and define both the skip graph over tokens and the skip-group
//!   contributions to span aggregates.
//! - **Multi-scale diffusion**: span scores blended with neighboring span
//!   scores at each requested scale `tau`, and token embeddings smoothed
//!   with the spectral heat kernel `exp(−tau·L)` of the skip-graph
//!   Laplacian. Both are evaluated over an explicit, finite tau list
//!   (never an open-ended fixed point), so latency stays bounded.
//!
//! Aggregated `U` and `C` are always recomputed from the combined
//! `alpha`/`r` vectors rather than averaged, preserving the capacity
//! monotonicity invariant.

use nalgebra::{DMatrix, DVector, SymmetricEigen};
use serde::{Deserialize, Serialize};

use crate::capacity::choquet;
use crate::error::CoreError;
use crate::pack::AxisPack;
use crate::projection::{axial_from_parts, AxialVector, GatePolicy};

/// Mixing constant for the span-level neighbor blend.
pub const DEFAULT_MIX: f64 = 0.25;

/// How token (and skip-group) component vectors combine into a span vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CombinePolicy {
    /// Elementwise mean over the span's tokens.
    #[default]
    Mean,
    /// Elementwise maximum over the span's tokens.
    Max,
    /// Weighted sum over tokens (weight 1) and skip-group midpoints
    /// (weight decaying as 1/gap), normalized by total weight.
    Weighted,
}

/// Parameters for span generation and diffusion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffusionParams {
    pub max_span_len: usize,
    pub max_skip: usize,
    /// Requested diffusion scales. `0.0` reproduces the raw aggregate.
    pub taus: Vec<f64>,
    /// Neighbor-blend mixing constant; `mix · tau` must stay below 1.
    pub mix: f64,
    pub combine: CombinePolicy,
}

impl Default for DiffusionParams {
    fn default() -> Self {
        Self {
            max_span_len: 5,
            max_skip: 2,
            taus: vec![0.0],
            mix: DEFAULT_MIX,
            combine: CombinePolicy::Mean,
        }
    }
}

impl DiffusionParams {
    /// Reject non-finite, negative, or blend-destabilizing scales.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.max_span_len == 0 {
            return Err(CoreError::configuration("max_span_len must be positive"));
        }
        for tau in &self.taus {
            if !tau.is_finite() || *tau < 0.0 {
                return Err(CoreError::configuration(format!(
                    "diffusion scale must be finite and non-negative, got {tau}"
                )));
            }
            if self.mix * tau >= 1.0 {
                return Err(CoreError::configuration(format!(
                    "diffusion scale {tau} with mix {} leaves a non-positive \
                     self weight",
                    self.mix
                )));
            }
        }
        Ok(())
    }
}

/// A non-contiguous token pair with its decayed weight.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SkipPair {
    pub i: usize,
    pub j: usize,
    pub weight: f64,
}

/// Enumerate contiguous spans `[i, j)` with `1 <= j−i <= max_span_len`.
pub fn enumerate_spans(n_tokens: usize, max_span_len: usize) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    for i in 0..n_tokens {
        for j in (i + 1)..=(n_tokens.min(i + max_span_len)) {
            spans.push((i, j));
        }
    }
    spans
}

/// All pairs `(i, j)` with `1 <= j−i <= max_skip`, weighted `1/(j−i)`.
pub fn skip_pairs(n_tokens: usize, max_skip: usize) -> Vec<SkipPair> {
    let mut pairs = Vec::new();
    for i in 0..n_tokens {
        for j in (i + 1)..n_tokens.min(i + 1 + max_skip) {
            pairs.push(SkipPair {
                i,
                j,
                weight: 1.0 / (j - i) as f64,
            });
        }
    }
    pairs
}

/// Skip pairs restricted to a span `[start, end)`.
pub fn span_skip_pairs(start: usize, end: usize, max_skip: usize) -> Vec<SkipPair> {
    if end <= start {
        return Vec::new();
    }
    skip_pairs(end - start, max_skip)
        .into_iter()
        .map(|p| SkipPair {
            i: start + p.i,
            j: start + p.j,
            weight: p.weight,
        })
        .collect()
}

/// Symmetric skip-graph adjacency with inverse-distance weights.
pub fn skip_adjacency(n_tokens: usize, max_skip: usize) -> DMatrix<f64> {
    let mut w = DMatrix::zeros(n_tokens, n_tokens);
    for pair in skip_pairs(n_tokens, max_skip) {
        w[(pair.i, pair.j)] = pair.weight;
        w[(pair.j, pair.i)] = pair.weight;
    }
    w
}

/// Combinatorial Laplacian `L = D − W`, numerically symmetrized.
pub fn laplacian(w: &DMatrix<f64>) -> DMatrix<f64> {
    let n = w.nrows();
    let mut l = -w.clone();
    for i in 0..n {
        let degree: f64 = w.row(i).iter().sum();
        l[(i, i)] += degree;
    }
    // Guard against asymmetric rounding.
    let lt = l.transpose();
    (l + lt) * 0.5
}

/// Smooth token signals with the spectral heat kernel `exp(−tau·L)`.
///
/// `x` is (n, m): one row per token. Returns one smoothed matrix per
/// requested tau; `tau = 0` is the identity. The eigendecomposition is
/// computed once and reused across scales.
pub fn heat_kernel_smooth(
    l: &DMatrix<f64>,
    x: &DMatrix<f64>,
    taus: &[f64],
) -> Result<Vec<DMatrix<f64>>, CoreError> {
    if l.nrows() != l.ncols() {
        return Err(CoreError::configuration("laplacian must be square"));
    }
    if l.nrows() != x.nrows() {
        return Err(CoreError::configuration(format!(
            "laplacian is over {} tokens but signals have {} rows",
            l.nrows(),
            x.nrows()
        )));
    }
    let eigen = SymmetricEigen::new(l.clone());
    let coeffs = eigen.eigenvectors.transpose() * x;
    let mut out = Vec::with_capacity(taus.len());
    for tau in taus {
        let mut damped = coeffs.clone();
        for (row, lambda) in eigen.eigenvalues.iter().enumerate() {
            let g = (-tau * lambda).exp();
            for col in 0..damped.ncols() {
                damped[(row, col)] *= g;
            }
        }
        out.push(&eigen.eigenvectors * damped);
    }
    Ok(out)
}

/// Aggregate token vectors over `[start, end)` into one span vector.
///
/// `alpha`, `u`, `r` combine under the policy; `U` and `C` are recomputed
/// from the combined vectors. With [`CombinePolicy::Weighted`], skip-group
/// midpoints join the tokens with inverse-distance weights.
pub fn aggregate_span(
    token_vectors: &[AxialVector],
    start: usize,
    end: usize,
    max_skip: usize,
    pack: &AxisPack,
    combine: CombinePolicy,
    gate: &GatePolicy,
) -> AxialVector {
    let k = pack.k();
    debug_assert!(start < end && end <= token_vectors.len());
    let tokens = &token_vectors[start..end];

    let (alpha, u, r) = match combine {
        CombinePolicy::Mean => combine_mean(tokens, k),
        CombinePolicy::Max => combine_max(tokens, k),
        CombinePolicy::Weighted => combine_weighted(token_vectors, start, end, max_skip, k),
    };
    axial_from_parts(alpha, u, r, pack, 0.0, true, gate)
}

fn combine_mean(tokens: &[AxialVector], k: usize) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    let mut alpha = vec![0.0; k];
    let mut u = vec![0.0; k];
    let mut r = vec![0.0; k];
    for tok in tokens {
        for i in 0..k {
            alpha[i] += tok.alpha[i];
            u[i] += tok.u[i];
            r[i] += tok.r[i];
        }
    }
    let n = tokens.len() as f64;
    for i in 0..k {
        alpha[i] /= n;
        u[i] /= n;
        r[i] /= n;
    }
    (alpha, u, r)
}

fn combine_max(tokens: &[AxialVector], k: usize) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    let mut alpha = vec![f64::NEG_INFINITY; k];
    let mut u = vec![f64::NEG_INFINITY; k];
    let mut r = vec![0.0f64; k];
    for tok in tokens {
        for i in 0..k {
            alpha[i] = alpha[i].max(tok.alpha[i]);
            u[i] = u[i].max(tok.u[i]);
            r[i] = r[i].max(tok.r[i]);
        }
    }
    (alpha, u, r)
}

fn combine_weighted(
    token_vectors: &[AxialVector],
    start: usize,
    end: usize,
    max_skip: usize,
    k: usize,
) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    let mut alpha = vec![0.0; k];
    let mut u = vec![0.0; k];
    let mut r = vec![0.0; k];
    let mut total = 0.0;

    for tok in &token_vectors[start..end] {
        for i in 0..k {
            alpha[i] += tok.alpha[i];
            u[i] += tok.u[i];
            r[i] += tok.r[i];
        }
        total += 1.0;
    }
    for pair in span_skip_pairs(start, end, max_skip) {
        let a = &token_vectors[pair.i];
        let b = &token_vectors[pair.j];
        for i in 0..k {
            alpha[i] += pair.weight * 0.5 * (a.alpha[i] + b.alpha[i]);
            u[i] += pair.weight * 0.5 * (a.u[i] + b.u[i]);
            r[i] += pair.weight * 0.5 * (a.r[i] + b.r[i]);
        }
        total += pair.weight;
    }
    if total > 0.0 {
        for i in 0..k {
            alpha[i] /= total;
            u[i] /= total;
            r[i] /= total;
        }
    }
    (alpha, u, r)
}

/// Span coherence: the inverse-distance-weighted mean Choquet utility of
/// the span's skip-pair midpoint embeddings. Spans too short for any pair
/// score 0.0.
pub fn span_skip_coherence(
    embeddings: &[DVector<f64>],
    pack: &AxisPack,
    start: usize,
    end: usize,
    max_skip: usize,
) -> Result<f64, CoreError> {
    let pairs = span_skip_pairs(start, end, max_skip);
    if pairs.is_empty() {
        return Ok(0.0);
    }
    let gate = GatePolicy::default();
    let mut total = 0.0;
    let mut weight_sum = 0.0;
    for pair in pairs {
        let midpoint = (&embeddings[pair.i] + &embeddings[pair.j]) * 0.5;
        let v = crate::projection::project(&midpoint, pack, &gate)?;
        let utility = choquet(&v.r, pack.capacity.as_ref(), &pack.weights);
        total += pair.weight * utility;
        weight_sum += pair.weight;
    }
    Ok(total / weight_sum)
}

/// Diffuse span vectors across the requested scales.
///
/// Scale `tau_m` blends each span's raw (`tau = 0`) vector with the
/// previous scale's neighbor vectors:
/// `v(s, tau_m) = (1 − mix·tau_m)·v(s, 0) + tau_m · Σ_nb v(nb, tau_{m−1})`,
/// where the neighbors of `[i, j)` are the same-length spans `[i−1, j−1)`
/// and `[i+1, j+1)`; out-of-range neighbors contribute zero. The first
/// requested scale blends against the raw vectors themselves. Returns one
/// vector list per requested tau, in order.
pub fn diffuse_spans(
    base: &[AxialVector],
    spans: &[(usize, usize)],
    n_tokens: usize,
    params: &DiffusionParams,
    pack: &AxisPack,
    gate: &GatePolicy,
) -> Result<Vec<Vec<AxialVector>>, CoreError> {
    params.validate()?;
    debug_assert_eq!(base.len(), spans.len());
    let k = pack.k();

    // (start, end) -> index, for the shift-neighbor lookup.
    let index_of = |start: isize, end: isize| -> Option<usize> {
        if start < 0 || end as usize > n_tokens {
            return None;
        }
        spans
            .iter()
            .position(|(s, e)| *s == start as usize && *e == end as usize)
    };
    let neighbors: Vec<Vec<usize>> = spans
        .iter()
        .map(|(s, e)| {
            let mut nb = Vec::with_capacity(2);
            if let Some(idx) = index_of(*s as isize - 1, *e as isize - 1) {
                nb.push(idx);
            }
            if let Some(idx) = index_of(*s as isize + 1, *e as isize + 1) {
                nb.push(idx);
            }
            nb
        })
        .collect();

    let mut levels: Vec<Vec<AxialVector>> = Vec::with_capacity(params.taus.len());
    for (m, tau) in params.taus.iter().enumerate() {
        let previous: &[AxialVector] = if m == 0 { base } else { &levels[m - 1] };
        let mut level = Vec::with_capacity(base.len());
        for (idx, raw) in base.iter().enumerate() {
            let self_weight = 1.0 - params.mix * tau;
            let mut alpha: Vec<f64> = raw.alpha.iter().map(|a| self_weight * a).collect();
            let mut u: Vec<f64> = raw.u.iter().map(|x| self_weight * x).collect();
            let mut r: Vec<f64> = raw.r.iter().map(|x| self_weight * x).collect();
            for &nb in &neighbors[idx] {
                let prev = &previous[nb];
                for i in 0..k {
                    alpha[i] += tau * prev.alpha[i];
                    u[i] += tau * prev.u[i];
                    r[i] += tau * prev.r[i];
                }
            }
            level.push(axial_from_parts(alpha, u, r, pack, *tau, true, gate));
        }
        levels.push(level);
    }
    Ok(levels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pack::{AxisPole, PackMetadata};
    use chrono::{TimeZone, Utc};

    fn pack() -> AxisPack {
        let q = DMatrix::from_columns(&[
            DVector::from_vec(vec![1.0, 0.0, 0.0]),
            DVector::from_vec(vec![0.0, 1.0, 0.0]),
        ]);
        AxisPack {
            id: "diff-test".into(),
            names: vec!["a".into(), "b".into()],
            q,
            lambda: DVector::from_element(2, 1.0),
            beta: DVector::from_element(2, 0.0),
            weights: DVector::from_element(2, 0.5),
            mu: None,
            scales: None,
            orientation: vec![AxisPole::Positive; 2],
            thresholds: vec![0.0, 0.0],
            capacity: None,
            metadata: PackMetadata::new(
                Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap(),
                "diffmean",
            ),
        }
    }

    fn token_vectors(pack: &AxisPack, embeddings: &[DVector<f64>]) -> Vec<AxialVector> {
        embeddings
            .iter()
            .map(|x| crate::projection::project(x, pack, &GatePolicy::default()).unwrap())
            .collect()
    }

    #[test]
    fn span_enumeration_respects_max_len() {
        let spans = enumerate_spans(4, 2);
        assert_eq!(spans.len(), 7); // 4 singletons + 3 bigrams
        assert!(spans.contains(&(2, 4)));
        assert!(!spans.contains(&(0, 3)));
        assert!(enumerate_spans(0, 3).is_empty());
    }

    #[test]
    fn skip_weights_decay_with_distance() {
        let pairs = skip_pairs(5, 3);
        let near = pairs.iter().find(|p| p.i == 0 && p.j == 1).unwrap();
        let far = pairs.iter().find(|p| p.i == 0 && p.j == 3).unwrap();
        assert!((near.weight - 1.0).abs() < 1e-12);
        assert!((far.weight - 1.0 / 3.0).abs() < 1e-12);
        assert!(pairs.iter().all(|p| p.j - p.i <= 3));
    }

    #[test]
    fn laplacian_rows_sum_to_zero() {
        let w = skip_adjacency(6, 2);
        let l = laplacian(&w);
        for i in 0..6 {
            let sum: f64 = l.row(i).iter().sum();
            assert!(sum.abs() < 1e-12);
        }
        assert_eq!(l, l.transpose());
    }

    #[test]
    fn heat_kernel_at_zero_is_identity() {
        let w = skip_adjacency(5, 2);
        let l = laplacian(&w);
        let x = DMatrix::from_fn(5, 3, |r, c| (r * 3 + c) as f64);
        let out = heat_kernel_smooth(&l, &x, &[0.0]).unwrap();
        for (a, b) in out[0].iter().zip(x.iter()) {
            assert!((a - b).abs() < 1e-9);
        }
    }

    #[test]
    fn heat_kernel_contracts_toward_consensus() {
        let w = skip_adjacency(6, 2);
        let l = laplacian(&w);
        let x = DMatrix::from_fn(6, 1, |r, _| if r % 2 == 0 { 1.0 } else { -1.0 });
        let out = heat_kernel_smooth(&l, &x, &[0.5]).unwrap();
        let spread_before: f64 = x.iter().map(|v| v * v).sum();
        let spread_after: f64 = out[0].iter().map(|v| v * v).sum();
        assert!(spread_after < spread_before);
    }

    #[test]
    fn mean_aggregation_recomputes_salience() {
        let p = pack();
        let embeddings = vec![
            DVector::from_vec(vec![1.0, 0.0, 0.0]),
            DVector::from_vec(vec![0.0, 1.0, 0.0]),
        ];
        let toks = token_vectors(&p, &embeddings);
        let span = aggregate_span(&toks, 0, 2, 2, &p, CombinePolicy::Mean, &GatePolicy::default());
        assert!((span.alpha[0] - 0.5).abs() < 1e-12);
        assert!((span.alpha[1] - 0.5).abs() < 1e-12);
        // U from aggregated alpha, not the mean of token saliences.
        let expected = (0.5f64 * 0.25 + 0.5 * 0.25).sqrt();
        assert!((span.salience - expected).abs() < 1e-12);
        assert!(span.utility.is_some());
    }

    #[test]
    fn max_aggregation_dominates_mean() {
        let p = pack();
        let embeddings = vec![
            DVector::from_vec(vec![1.0, 0.0, 0.0]),
            DVector::from_vec(vec![0.2, 0.0, 0.0]),
        ];
        let toks = token_vectors(&p, &embeddings);
        let mean = aggregate_span(&toks, 0, 2, 2, &p, CombinePolicy::Mean, &GatePolicy::default());
        let max = aggregate_span(&toks, 0, 2, 2, &p, CombinePolicy::Max, &GatePolicy::default());
        assert!(max.alpha[0] > mean.alpha[0]);
        assert!((max.alpha[0] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn weighted_aggregation_includes_skip_groups() {
        let p = pack();
        let embeddings = vec![
            DVector::from_vec(vec![1.0, 0.0, 0.0]),
            DVector::from_vec(vec![0.0, 0.0, 0.0]),
            DVector::from_vec(vec![1.0, 0.0, 0.0]),
        ];
        let toks = token_vectors(&p, &embeddings);
        let weighted = aggregate_span(
            &toks,
            0,
            3,
            2,
            &p,
            CombinePolicy::Weighted,
            &GatePolicy::default(),
        );
        assert!(weighted.alpha[0].is_finite());
        assert!(weighted.r.iter().all(|x| *x >= 0.0));
    }

    #[test]
    fn skip_coherence_zero_for_singletons() {
        let p = pack();
        let embeddings = vec![DVector::from_vec(vec![1.0, 0.0, 0.0])];
        let c = span_skip_coherence(&embeddings, &p, 0, 1, 2).unwrap();
        assert_eq!(c, 0.0);
    }

    #[test]
    fn diffusion_at_zero_reproduces_raw_aggregate() {
        let p = pack();
        let embeddings: Vec<DVector<f64>> = (0..6)
            .map(|i| DVector::from_vec(vec![(i as f64 * 0.37).sin(), (i as f64 * 0.61).cos(), 0.1]))
            .collect();
        let toks = token_vectors(&p, &embeddings);
        let spans = enumerate_spans(6, 3);
        let base: Vec<AxialVector> = spans
            .iter()
            .map(|(s, e)| {
                aggregate_span(&toks, *s, *e, 2, &p, CombinePolicy::Mean, &GatePolicy::default())
            })
            .collect();
        let params = DiffusionParams {
            taus: vec![0.0, 0.3],
            ..Default::default()
        };
        let levels = diffuse_spans(&base, &spans, 6, &params, &p, &GatePolicy::default()).unwrap();
        assert_eq!(levels.len(), 2);
        for (raw, diffused) in base.iter().zip(levels[0].iter()) {
            assert_eq!(raw.alpha, diffused.alpha);
            assert_eq!(raw.salience, diffused.salience);
        }
        for v in &levels[1] {
            assert_eq!(v.tau, 0.3);
            assert!(v.r.iter().all(|x| *x >= 0.0));
            assert!(v.alpha.iter().all(|x| x.is_finite()));
        }
    }

    #[test]
    fn boundary_spans_have_fewer_neighbors_without_error() {
        let p = pack();
        let embeddings: Vec<DVector<f64>> = (0..3)
            .map(|i| DVector::from_vec(vec![i as f64, 1.0, 0.0]))
            .collect();
        let toks = token_vectors(&p, &embeddings);
        let spans = enumerate_spans(3, 2);
        let base: Vec<AxialVector> = spans
            .iter()
            .map(|(s, e)| {
                aggregate_span(&toks, *s, *e, 2, &p, CombinePolicy::Mean, &GatePolicy::default())
            })
            .collect();
        let params = DiffusionParams {
            taus: vec![0.4],
            ..Default::default()
        };
        let levels = diffuse_spans(&base, &spans, 3, &params, &p, &GatePolicy::default()).unwrap();
        assert_eq!(levels[0].len(), spans.len());
    }

    #[test]
    fn destabilizing_tau_is_rejected() {
        let params = DiffusionParams {
            taus: vec![5.0],
            mix: 0.25,
            ..Default::default()
        };
        assert!(params.validate().is_err());

        let negative = DiffusionParams {
            taus: vec![-0.1],
            ..Default::default()
        };
        assert!(negative.validate().is_err());
    }
}
