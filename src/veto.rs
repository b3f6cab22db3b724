//! Threshold comparison, minimal violating spans, and decision proofs.
//!
//! Every generated span (contiguous windows and skip-derived pairs) is
//! compared against the pack's calibrated thresholds. Violations on any
//! axis are sufficient to refuse (logical OR across spans and axes); the
//! proof reports one minimal violating span per axis, found by greedy
//! shrink from the largest violating window, so overlapping supersets do
//! not drown the report.
//!
//! Scoring errors are never folded into an "allow": a non-finite score
//! aborts the evaluation with `InvalidScore`.

use serde::{Deserialize, Serialize};

use crate::diffusion::{span_skip_pairs, CombinePolicy};
use crate::error::CoreError;
use crate::pack::{AxisPack, AxisPole};
use crate::projection::{axial_from_parts, AxialVector, GatePolicy};

/// Final decision of an evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Allow,
    Refuse,
}

/// One minimal violating span reported in a proof.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViolationSpan {
    pub start: usize,
    pub end: usize,
    pub axis: String,
    pub score: f64,
    pub threshold: f64,
}

/// Structured, reproducible explanation of an allow/refuse decision.
///
/// Created fresh per evaluation and never mutated; reconstructible from
/// the pack and the evaluated spans alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionProof {
    pub pack_id: String,
    pub spans: Vec<ViolationSpan>,
    /// Always "OR": one qualifying violation refuses.
    pub aggregation: String,
    pub action: Action,
    pub rationale: String,
}

/// What a span's scores are compared against.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VetoPolicy {
    /// Per-axis pole-rectified evidence against the pack's per-axis
    /// thresholds.
    #[default]
    AxisEvidence,
    /// The Choquet utility `C` against one global threshold.
    Utility { threshold: f64 },
}

/// Per-axis veto evidence: the rectified projection toward each axis's
/// veto pole.
pub fn veto_evidence(vector: &AxialVector, pack: &AxisPack) -> Vec<f64> {
    pack.orientation
        .iter()
        .enumerate()
        .map(|(i, pole)| match pole {
            AxisPole::Positive => vector.u[i].max(0.0),
            AxisPole::Negative => (-vector.u[i]).max(0.0),
        })
        .collect()
}

/// Span veto evaluator.
///
/// Holds the aggregation context needed to re-score sub-spans during the
/// minimal-span shrink.
#[derive(Debug, Clone)]
pub struct VetoEvaluator<'p> {
    pack: &'p AxisPack,
    policy: VetoPolicy,
    combine: CombinePolicy,
    max_skip: usize,
    gate: GatePolicy,
}

#[derive(Debug, Clone)]
struct Candidate {
    start: usize,
    end: usize,
    tokens: usize,
    axis: usize,
    score: f64,
}

impl<'p> VetoEvaluator<'p> {
    pub fn new(
        pack: &'p AxisPack,
        policy: VetoPolicy,
        combine: CombinePolicy,
        max_skip: usize,
        gate: GatePolicy,
    ) -> Self {
        Self {
            pack,
            policy,
            combine,
            max_skip,
            gate,
        }
    }

    /// Evaluate contiguous spans (with their precomputed vectors) plus the
    /// skip-derived pairs, and assemble the decision proof.
    pub fn evaluate(
        &self,
        token_vectors: &[AxialVector],
        spans: &[(usize, usize)],
        span_vectors: &[AxialVector],
    ) -> Result<DecisionProof, CoreError> {
        debug_assert_eq!(spans.len(), span_vectors.len());
        if token_vectors.is_empty() {
            return Ok(self.proof(Vec::new()));
        }

        let mut candidates: Vec<Candidate> = Vec::new();

        for ((start, end), vector) in spans.iter().zip(span_vectors) {
            for violation in self.violations(vector)? {
                candidates.push(Candidate {
                    start: *start,
                    end: *end,
                    tokens: end - start,
                    axis: violation.0,
                    score: violation.1,
                });
            }
        }

        // Skip-derived pairs: two tokens bridging a gap. Gap-1 pairs are
        // already present as contiguous bigrams.
        for pair in span_skip_pairs(0, token_vectors.len(), self.max_skip) {
            if pair.j - pair.i < 2 {
                continue;
            }
            let vector = self.pair_vector(token_vectors, pair.i, pair.j);
            for violation in self.violations(&vector)? {
                candidates.push(Candidate {
                    start: pair.i,
                    end: pair.j + 1,
                    tokens: 2,
                    axis: violation.0,
                    score: violation.1,
                });
            }
        }

        if candidates.is_empty() {
            return Ok(self.proof(Vec::new()));
        }

        // One minimal span per axis: shrink the largest contiguous
        // violation, then keep the candidate with the fewest tokens.
        let mut reported: Vec<ViolationSpan> = Vec::new();
        for axis in 0..self.pack.k() {
            let mut per_axis: Vec<Candidate> = candidates
                .iter()
                .filter(|c| c.axis == axis)
                .cloned()
                .collect();
            if per_axis.is_empty() {
                continue;
            }
            // Shrink only genuine windows; pairs are already minimal.
            for candidate in &mut per_axis {
                if candidate.tokens == candidate.end - candidate.start {
                    *candidate = self.shrink(token_vectors, candidate.clone())?;
                }
            }
            per_axis.sort_by(|a, b| {
                a.tokens
                    .cmp(&b.tokens)
                    .then_with(|| a.start.cmp(&b.start))
                    .then_with(|| (a.end - a.start).cmp(&(b.end - b.start)))
            });
            let best = &per_axis[0];
            reported.push(ViolationSpan {
                start: best.start,
                end: best.end,
                axis: self.pack.names[axis].clone(),
                score: best.score,
                threshold: self.threshold_for(axis),
            });
        }
        reported.sort_by(|a, b| a.start.cmp(&b.start).then_with(|| a.axis.cmp(&b.axis)));

        Ok(self.proof(reported))
    }

    /// Violated axes for one span vector as `(axis index, score)`.
    fn violations(&self, vector: &AxialVector) -> Result<Vec<(usize, f64)>, CoreError> {
        match self.policy {
            VetoPolicy::AxisEvidence => {
                let evidence = veto_evidence(vector, self.pack);
                let mut out = Vec::new();
                for (axis, score) in evidence.into_iter().enumerate() {
                    // max() would swallow a NaN projection, so check `u` too.
                    if !score.is_finite() || !vector.u[axis].is_finite() {
                        return Err(CoreError::InvalidScore {
                            axis: self.pack.names[axis].clone(),
                        });
                    }
                    if score > self.pack.thresholds[axis] {
                        out.push((axis, score));
                    }
                }
                Ok(out)
            }
            VetoPolicy::Utility { threshold } => {
                let utility = vector.utility.unwrap_or_else(|| {
                    crate::capacity::choquet(
                        &vector.r,
                        self.pack.capacity.as_ref(),
                        &self.pack.weights,
                    )
                });
                if !utility.is_finite() {
                    return Err(CoreError::InvalidScore {
                        axis: "(choquet)".to_string(),
                    });
                }
                if utility > threshold {
                    // Attribute the violation to the strongest-evidence axis.
                    let evidence = veto_evidence(vector, self.pack);
                    let axis = evidence
                        .iter()
                        .enumerate()
                        .max_by(|a, b| a.1.total_cmp(b.1))
                        .map(|(i, _)| i)
                        .unwrap_or(0);
                    Ok(vec![(axis, utility)])
                } else {
                    Ok(Vec::new())
                }
            }
        }
    }

    fn threshold_for(&self, axis: usize) -> f64 {
        match self.policy {
            VetoPolicy::AxisEvidence => self.pack.thresholds[axis],
            VetoPolicy::Utility { threshold } => threshold,
        }
    }

    /// Greedy shrink: drop boundary tokens while the axis violation holds.
    fn shrink(
        &self,
        token_vectors: &[AxialVector],
        seed: Candidate,
    ) -> Result<Candidate, CoreError> {
        let mut current = seed;
        loop {
            if current.end - current.start <= 1 {
                return Ok(current);
            }
            let mut shrunk = None;
            for (start, end) in [
                (current.start + 1, current.end),
                (current.start, current.end - 1),
            ] {
                if let Some(score) = self.axis_score(token_vectors, start, end, current.axis)? {
                    shrunk = Some(Candidate {
                        start,
                        end,
                        tokens: end - start,
                        axis: current.axis,
                        score,
                    });
                    break;
                }
            }
            match shrunk {
                Some(next) => current = next,
                None => return Ok(current),
            }
        }
    }

    /// Score of `[start, end)` on one axis if it still violates.
    fn axis_score(
        &self,
        token_vectors: &[AxialVector],
        start: usize,
        end: usize,
        axis: usize,
    ) -> Result<Option<f64>, CoreError> {
        let vector = crate::diffusion::aggregate_span(
            token_vectors,
            start,
            end,
            self.max_skip,
            self.pack,
            self.combine,
            &self.gate,
        );
        let hits = self.violations(&vector)?;
        Ok(hits
            .into_iter()
            .find(|(a, _)| *a == axis)
            .map(|(_, score)| score))
    }

    /// Midpoint vector of a skip pair, with `U`/`C` recomputed.
    fn pair_vector(&self, token_vectors: &[AxialVector], i: usize, j: usize) -> AxialVector {
        let k = self.pack.k();
        let a = &token_vectors[i];
        let b = &token_vectors[j];
        let alpha: Vec<f64> = (0..k).map(|c| 0.5 * (a.alpha[c] + b.alpha[c])).collect();
        let u: Vec<f64> = (0..k).map(|c| 0.5 * (a.u[c] + b.u[c])).collect();
        let r: Vec<f64> = (0..k).map(|c| 0.5 * (a.r[c] + b.r[c])).collect();
        axial_from_parts(alpha, u, r, self.pack, 0.0, true, &self.gate)
    }

    fn proof(&self, spans: Vec<ViolationSpan>) -> DecisionProof {
        let action = if spans.is_empty() {
            Action::Allow
        } else {
            Action::Refuse
        };
        let rationale = match action {
            Action::Allow => "no span exceeded any axis threshold".to_string(),
            Action::Refuse => {
                let strongest = spans
                    .iter()
                    .max_by(|a, b| {
                        let ra = ratio(a.score, a.threshold);
                        let rb = ratio(b.score, b.threshold);
                        ra.total_cmp(&rb)
                    })
                    .expect("refuse implies at least one violation");
                format!(
                    "axis '{}': span [{}, {}) scores {:.3} against threshold {:.3} \
                     (ratio {:.2})",
                    strongest.axis,
                    strongest.start,
                    strongest.end,
                    strongest.score,
                    strongest.threshold,
                    ratio(strongest.score, strongest.threshold),
                )
            }
        };
        DecisionProof {
            pack_id: self.pack.id.clone(),
            spans,
            aggregation: "OR".to_string(),
            action,
            rationale,
        }
    }
}

fn ratio(score: f64, threshold: f64) -> f64 {
    if threshold.abs() < f64::EPSILON {
        score / f64::EPSILON
    } else {
        score / threshold.abs()
    }
}
