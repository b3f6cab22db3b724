//! Predicate-argument frames over token spans.
//!
//! Frames are detected from the axis scores alone: predicates are local
//! maxima of token salience, and left/right role spans expand outward
//! while salience stays above a band fraction of the predicate's. No
//! keyword triggers, no parser dependency: detection is deterministic
//! given the token vectors.
//!
//! Role-level vectors are retained as `role_coords` for downstream
//! explainability, and [`FrameRecord`] is the persistence shape consumed
//! by the external frame store.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::pack::AxisPack;
use crate::projection::{axial_from_parts, AxialVector, GatePolicy};

/// Role name for the span left of the predicate.
pub const ROLE_LEFT: &str = "arg_left";
/// Role name for the span right of the predicate.
pub const ROLE_RIGHT: &str = "arg_right";

/// Frame detection parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FrameParams {
    /// Minimum token salience for a predicate peak.
    pub salience_floor: f64,
    /// Role tokens must keep salience above this fraction of the
    /// predicate's salience.
    pub arg_band: f64,
    /// Maximum role span length on each side.
    pub max_role_len: usize,
}

impl Default for FrameParams {
    fn default() -> Self {
        Self {
            salience_floor: 0.0,
            arg_band: 0.5,
            max_role_len: 3,
        }
    }
}

/// A predicate span with zero or more named role spans and their vectors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub id: String,
    pub predicate: (usize, usize),
    pub roles: BTreeMap<String, (usize, usize)>,
    /// Frame-level vector aggregating predicate and role tokens.
    pub vector: AxialVector,
    /// Per-role vectors, kept for explainability.
    pub role_coords: BTreeMap<String, AxialVector>,
}

/// Persistence record for the external frame store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameRecord {
    pub doc_id: String,
    pub pack_id: String,
    pub frame_id: String,
    /// Frame-level axis coordinates (`alpha`), length k.
    pub coords: Vec<f64>,
    pub role_coords: BTreeMap<String, Vec<f64>>,
    pub metadata: BTreeMap<String, String>,
}

impl Frame {
    /// Produce the store-contract record for this frame.
    pub fn record(&self, doc_id: &str, pack: &AxisPack) -> FrameRecord {
        FrameRecord {
            doc_id: doc_id.to_string(),
            pack_id: pack.id.clone(),
            frame_id: self.id.clone(),
            coords: self.vector.alpha.clone(),
            role_coords: self
                .role_coords
                .iter()
                .map(|(role, v)| (role.clone(), v.alpha.clone()))
                .collect(),
            metadata: BTreeMap::new(),
        }
    }
}

/// Indices of local salience maxima (plateau edges count as peaks).
fn salience_peaks(saliences: &[f64]) -> Vec<usize> {
    let n = saliences.len();
    let mut peaks = Vec::new();
    for i in 0..n {
        let left = if i > 0 { saliences[i - 1] } else { f64::NEG_INFINITY };
        let right = if i + 1 < n {
            saliences[i + 1]
        } else {
            f64::NEG_INFINITY
        };
        if saliences[i] >= left && saliences[i] >= right {
            peaks.push(i);
        }
    }
    peaks
}

/// Expand a role span around `center` while salience stays above `floor`.
fn expand_role(saliences: &[f64], center: usize, max_len: usize, floor: f64) -> (usize, usize) {
    let n = saliences.len();
    let mut start = center;
    let mut end = center + 1;
    while start > 0 && (center - (start - 1)) < max_len && saliences[start - 1] >= floor {
        start -= 1;
    }
    while end < n && (end - 1 - center) < max_len && saliences[end] >= floor {
        end += 1;
    }
    (start, end)
}

fn combine_indexed(
    token_vectors: &[AxialVector],
    indices: &[usize],
    k: usize,
) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    let mut alpha = vec![0.0; k];
    let mut u = vec![0.0; k];
    let mut r = vec![0.0; k];
    for &idx in indices {
        let tok = &token_vectors[idx];
        for i in 0..k {
            alpha[i] += tok.alpha[i];
            u[i] += tok.u[i];
            r[i] += tok.r[i];
        }
    }
    let n = indices.len().max(1) as f64;
    for i in 0..k {
        alpha[i] /= n;
        u[i] /= n;
        r[i] /= n;
    }
    (alpha, u, r)
}

fn aggregate_indices(
    token_vectors: &[AxialVector],
    indices: &[usize],
    pack: &AxisPack,
    gate: &GatePolicy,
) -> AxialVector {
    let (alpha, u, r) = combine_indexed(token_vectors, indices, pack.k());
    axial_from_parts(alpha, u, r, pack, 0.0, true, gate)
}

/// Detect frames around salience peaks.
///
/// The predicate is the single-token span at each qualifying peak; roles
/// expand left and right where salience stays within the band. Empty
/// input produces no frames.
pub fn build_frames(
    token_vectors: &[AxialVector],
    pack: &AxisPack,
    params: &FrameParams,
    gate: &GatePolicy,
) -> Vec<Frame> {
    let n = token_vectors.len();
    if n == 0 {
        return Vec::new();
    }
    let saliences: Vec<f64> = token_vectors.iter().map(|v| v.salience).collect();

    let mut frames = Vec::new();
    for peak in salience_peaks(&saliences) {
        let pred_salience = saliences[peak];
        if pred_salience < params.salience_floor {
            continue;
        }
        let band_floor = params.arg_band * pred_salience;

        let mut roles = BTreeMap::new();
        if peak > 0 {
            let span = expand_role(&saliences, peak - 1, params.max_role_len, band_floor);
            if span.1 > span.0 {
                roles.insert(ROLE_LEFT.to_string(), span);
            }
        }
        if peak + 1 < n {
            let span = expand_role(&saliences, peak + 1, params.max_role_len, band_floor);
            if span.1 > span.0 {
                roles.insert(ROLE_RIGHT.to_string(), span);
            }
        }

        let mut indices: Vec<usize> = vec![peak];
        for (start, end) in roles.values() {
            indices.extend(*start..*end);
        }
        indices.sort_unstable();
        indices.dedup();

        let vector = aggregate_indices(token_vectors, &indices, pack, gate);
        let role_coords = roles
            .iter()
            .map(|(role, (start, end))| {
                let idxs: Vec<usize> = (*start..*end).collect();
                (
                    role.clone(),
                    aggregate_indices(token_vectors, &idxs, pack, gate),
                )
            })
            .collect();

        frames.push(Frame {
            id: format!("f{peak}"),
            predicate: (peak, peak + 1),
            roles,
            vector,
            role_coords,
        });
    }
    frames
}
