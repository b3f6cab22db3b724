//! Choquet capacity and the discrete Choquet integral.
//!
//! A capacity is a monotone set function over subsets of the k axes with
//! `capacity(∅) = 0` and `capacity(full) = 1`. Subsets are represented as
//! bitmasks (k ≤ 64). The JSON wire format uses comma-joined sorted axis
//! indices as keys ("0,2,3"), matching the axis-pack artifact.
//!
//! The integral generalizes a weighted sum: with an additive capacity it
//! reduces to `Σ weights_i · r_i` exactly, and a super-additive capacity
//! lets two mildly-scoring axes jointly exceed the sum of their parts.

use std::collections::BTreeMap;

use nalgebra::DVector;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::CoreError;

/// Exhaustively verify monotonicity up to this many axes; sample beyond.
const EXHAUSTIVE_CHECK_MAX_AXES: usize = 12;

/// Number of sampled subset pairs when the lattice is too large to sweep.
const MONOTONICITY_SAMPLES: usize = 4_096;

/// Seed for the monotonicity sampler; fixed so pack loading is deterministic.
const MONOTONICITY_SEED: u64 = 0x0a5e_5eed;

/// Tolerance for boundary and monotonicity comparisons.
const CAPACITY_TOL: f64 = 1e-9;

/// Monotone set function over axis subsets, keyed by bitmask.
///
/// Missing subsets default to 0.0, as in sparse capacity specifications;
/// validation treats those defaults as real values, so a sparse capacity
/// must still be monotone under them.
#[derive(Debug, Clone, PartialEq)]
pub struct Capacity {
    k: usize,
    values: BTreeMap<u64, f64>,
}

impl Capacity {
    /// Build a capacity from `(subset indices, value)` pairs.
    pub fn from_subsets<I>(k: usize, subsets: I) -> Result<Self, CoreError>
    where
        I: IntoIterator<Item = (Vec<usize>, f64)>,
    {
        if k == 0 || k > 64 {
            return Err(CoreError::configuration(format!(
                "capacity axis count must be in 1..=64, got {k}"
            )));
        }
        let mut values = BTreeMap::new();
        for (subset, value) in subsets {
            let mut mask = 0u64;
            for idx in subset {
                if idx >= k {
                    return Err(CoreError::configuration(format!(
                        "capacity subset references axis {idx} but k={k}"
                    )));
                }
                mask |= 1 << idx;
            }
            if !value.is_finite() {
                return Err(CoreError::configuration(format!(
                    "capacity value for mask {mask:#b} is not finite"
                )));
            }
            values.insert(mask, value);
        }
        Ok(Self { k, values })
    }

    /// Parse the JSON map form with comma-joined index keys.
    pub fn from_json_map(k: usize, map: &BTreeMap<String, f64>) -> Result<Self, CoreError> {
        let mut subsets = Vec::with_capacity(map.len());
        for (key, value) in map {
            if key.trim().is_empty() {
                continue;
            }
            let indices = key
                .split(',')
                .map(|s| s.trim().parse::<usize>())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|_| {
                    CoreError::configuration(format!("bad capacity subset key: {key:?}"))
                })?;
            subsets.push((indices, *value));
        }
        Self::from_subsets(k, subsets)
    }

    /// Serialize to the JSON map form with comma-joined index keys.
    pub fn to_json_map(&self) -> BTreeMap<String, f64> {
        let mut out = BTreeMap::new();
        for (mask, value) in &self.values {
            let key = (0..self.k)
                .filter(|i| mask & (1 << i) != 0)
                .map(|i| i.to_string())
                .collect::<Vec<_>>()
                .join(",");
            out.insert(key, *value);
        }
        out
    }

    pub fn k(&self) -> usize {
        self.k
    }

    fn full_mask(&self) -> u64 {
        if self.k == 64 {
            u64::MAX
        } else {
            (1u64 << self.k) - 1
        }
    }

    /// Capacity value of a subset; unspecified subsets are 0.0.
    pub fn value(&self, mask: u64) -> f64 {
        if mask == 0 {
            return 0.0;
        }
        self.values.get(&mask).copied().unwrap_or(0.0)
    }

    /// Validate boundary conditions and monotonicity.
    ///
    /// Small lattices are swept exhaustively; larger ones are probed with a
    /// fixed-seed sampler so that rejection is deterministic per capacity.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.value(0).abs() > CAPACITY_TOL {
            return Err(CoreError::configuration(
                "capacity of the empty set must be 0",
            ));
        }
        let full = self.full_mask();
        if (self.value(full) - 1.0).abs() > CAPACITY_TOL {
            return Err(CoreError::configuration(
                "capacity of the full axis set must be 1",
            ));
        }

        if self.k <= EXHAUSTIVE_CHECK_MAX_AXES {
            for mask in 0..=full {
                let base = self.value(mask);
                for i in 0..self.k {
                    let bit = 1u64 << i;
                    if mask & bit != 0 {
                        continue;
                    }
                    let grown = self.value(mask | bit);
                    if grown + CAPACITY_TOL < base {
                        return Err(CoreError::configuration(format!(
                            "capacity is not monotone: adding axis {i} to mask {mask:#b} \
                             drops {base} -> {grown}"
                        )));
                    }
                }
            }
        } else {
            let mut rng = StdRng::seed_from_u64(MONOTONICITY_SEED);
            for _ in 0..MONOTONICITY_SAMPLES {
                let sub: u64 = rng.gen::<u64>() & full;
                let sup = sub | (rng.gen::<u64>() & full);
                if self.value(sup) + CAPACITY_TOL < self.value(sub) {
                    return Err(CoreError::configuration(format!(
                        "capacity is not monotone: {sub:#b} ⊆ {sup:#b} but value decreases"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Discrete Choquet integral of rectified scores `r` under `capacity`.
///
/// With no capacity this is the plain weighted sum `Σ weights_i · r_i`.
/// Otherwise, axes are ranked by descending score and marginal differences
/// are weighted by the capacity of the cumulative top set:
/// `C = Σ_i (r_(i) − r_(i+1)) · capacity({axes ranked ≤ i})`, `r_(k+1) = 0`.
/// Ties contribute zero marginal difference, so tied axes may be ranked in
/// any order without changing the result.
pub fn choquet(r: &[f64], capacity: Option<&Capacity>, weights: &DVector<f64>) -> f64 {
    let k = r.len();
    if k == 0 {
        return 0.0;
    }
    let cap = match capacity {
        Some(c) => c,
        None => {
            let mut total = 0.0;
            for (i, ri) in r.iter().enumerate() {
                total += weights[i] * ri;
            }
            return total;
        }
    };

    let mut order: Vec<usize> = (0..k).collect();
    order.sort_by(|a, b| r[*b].total_cmp(&r[*a]).then_with(|| a.cmp(b)));

    let mut total = 0.0;
    let mut mask = 0u64;
    for (rank, &axis) in order.iter().enumerate() {
        mask |= 1 << axis;
        let current = r[axis];
        let next = if rank + 1 < k { r[order[rank + 1]] } else { 0.0 };
        total += (current - next) * cap.value(mask);
    }
    total
}
