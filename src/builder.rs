//! Axis pack construction from seed phrases.
//!
//! Per axis, a raw direction is derived from positive/negative seed
//! embeddings by one of three interchangeable methods (diffmean, cca,
//! lda), a tagged-variant strategy; each is a pure function
//! `(positives, negatives) -> direction`. The stacked directions are then
//! orthonormalized column by column with modified Gram-Schmidt, preserving
//! axis order. Nearly collinear seed directions survive orthogonalization
//! with a vanishing residual; that is reported as a low-rank warning, not
//! an error.
//!
//! Building is a pure function of its inputs plus the encoder, so a
//! deterministic encoder yields reproducible packs.

use chrono::Utc;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::capacity::Capacity;
use crate::encoder::Encoder;
use crate::error::CoreError;
use crate::pack::{AxisPack, AxisPole, PackMetadata};

/// Relative residual norm below which an axis is reported as low-rank.
const LOW_RANK_RATIO: f64 = 1e-6;

/// Absolute residual norm below which orthogonalization degenerates.
const DEGENERATE_NORM: f64 = 1e-12;

/// Diagonal shrinkage added to the within-class scatter for `lda`.
const LDA_SHRINKAGE: f64 = 1e-5;

/// Ridge term for the `cca` normal equations.
const CCA_RIDGE: f64 = 1e-6;

/// Seed specification for one axis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AxisSeed {
    pub name: String,
    pub positives: Vec<String>,
    pub negatives: Vec<String>,
    /// Which pole carries veto evidence for this axis.
    #[serde(default)]
    pub pole: AxisPole,
}

/// Direction-derivation strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DirectionMethod {
    /// Mean of positive embeddings minus mean of negative embeddings.
    #[default]
    DiffMean,
    /// Ridge-regularized correlation direction against the ±1 label signal.
    Cca,
    /// Linear discriminant direction separating the two classes.
    Lda,
}

impl DirectionMethod {
    pub fn name(&self) -> &'static str {
        match self {
            Self::DiffMean => "diffmean",
            Self::Cca => "cca",
            Self::Lda => "lda",
        }
    }
}

/// Overrides and options for a build.
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    pub method: DirectionMethod,
    /// Orthonormalize stacked directions (default). Disabling requires the
    /// raw directions to already be orthonormal or validation fails.
    pub skip_orthogonalize: bool,
    /// Store the mean of all seed embeddings as the pack's centering `mu`.
    pub center: bool,
    pub lambda: Option<Vec<f64>>,
    pub beta: Option<Vec<f64>>,
    pub weights: Option<Vec<f64>>,
    pub thresholds: Option<Vec<f64>>,
    pub capacity: Option<Capacity>,
    /// Supplied pack id; derived from timestamp + fingerprint when absent.
    pub id: Option<String>,
}

/// Build an [`AxisPack`] from seed phrases.
pub fn build_axis_pack(
    encoder: &dyn Encoder,
    seeds: &[AxisSeed],
    options: &BuildOptions,
) -> Result<AxisPack, CoreError> {
    if seeds.is_empty() {
        return Err(CoreError::configuration("no axes provided"));
    }
    for seed in seeds {
        if seed.positives.is_empty() || seed.negatives.is_empty() {
            return Err(CoreError::configuration(format!(
                "axis '{}' must have both positive and negative seed phrases",
                seed.name
            )));
        }
    }

    let d = encoder.dim();
    let k = seeds.len();
    if k > d {
        return Err(CoreError::OverCompleteAxes { axes: k, dim: d });
    }

    // One batched encoder call for all seed phrases.
    let mut texts = Vec::new();
    for seed in seeds {
        texts.extend(seed.positives.iter().cloned());
        texts.extend(seed.negatives.iter().cloned());
    }
    let embeddings = encoder.encode(&texts)?;
    if embeddings.len() != texts.len() {
        return Err(CoreError::Encoder {
            message: format!(
                "encoder returned {} vectors for {} texts",
                embeddings.len(),
                texts.len()
            ),
        });
    }
    for v in &embeddings {
        if v.len() != d {
            return Err(CoreError::Encoder {
                message: format!(
                    "encoder advertised dimension {d} but produced a vector of length {}",
                    v.len()
                ),
            });
        }
    }

    let mut cursor = 0usize;
    let mut directions = Vec::with_capacity(k);
    for seed in seeds {
        let pos = &embeddings[cursor..cursor + seed.positives.len()];
        cursor += seed.positives.len();
        let neg = &embeddings[cursor..cursor + seed.negatives.len()];
        cursor += seed.negatives.len();
        let dir = derive_direction(options.method, pos, neg)?;
        if dir.iter().all(|x| x.abs() < DEGENERATE_NORM) {
            return Err(CoreError::configuration(format!(
                "axis '{}' produced a zero direction: positive and negative \
                 seeds are indistinguishable to the encoder",
                seed.name
            )));
        }
        directions.push(dir);
    }

    let mu = options.center.then(|| {
        let mut mean = DVector::zeros(d);
        for v in &embeddings {
            mean += v;
        }
        mean / embeddings.len() as f64
    });

    let names: Vec<String> = seeds.iter().map(|s| s.name.clone()).collect();
    let q = if options.skip_orthogonalize {
        let cols: Vec<DVector<f64>> = directions
            .iter()
            .map(|v| {
                let n = v.norm();
                if n > 0.0 {
                    v / n
                } else {
                    v.clone()
                }
            })
            .collect();
        DMatrix::from_columns(&cols)
    } else {
        gram_schmidt(&directions, &names)?
    };

    let resolve = |override_: &Option<Vec<f64>>,
                   label: &str,
                   default: f64|
     -> Result<DVector<f64>, CoreError> {
        match override_ {
            Some(values) => {
                if values.len() != k {
                    return Err(CoreError::configuration(format!(
                        "{label} override must have length {k}, got {}",
                        values.len()
                    )));
                }
                Ok(DVector::from_vec(values.clone()))
            }
            None => Ok(DVector::from_element(k, default)),
        }
    };

    let lambda = resolve(&options.lambda, "lambda", 1.0)?;
    let beta = resolve(&options.beta, "beta", 0.0)?;
    let weights = resolve(&options.weights, "weights", 1.0 / k as f64)?;
    let thresholds = match &options.thresholds {
        Some(values) if values.len() == k => values.clone(),
        Some(values) => {
            return Err(CoreError::configuration(format!(
                "thresholds override must have length {k}, got {}",
                values.len()
            )))
        }
        None => vec![0.0; k],
    };

    let created_at = Utc::now();
    let mut pack = AxisPack {
        id: String::new(),
        names,
        q,
        lambda,
        beta,
        weights,
        mu,
        scales: None,
        orientation: seeds.iter().map(|s| s.pole).collect(),
        thresholds,
        capacity: options.capacity.clone(),
        metadata: PackMetadata::new(created_at, options.method.name()),
    };
    pack.id = match &options.id {
        Some(id) => id.clone(),
        None => AxisPack::derive_id(created_at, &pack.fingerprint()),
    };
    pack.validate()?;
    Ok(pack)
}

/// Append new axes to an existing pack, producing a new pack.
///
/// The existing columns are kept verbatim; new directions are
/// orthogonalized against them. The encoder must match the pack's
/// dimension or the append fails with `DimensionMismatch`.
pub fn append_axes(
    pack: &AxisPack,
    encoder: &dyn Encoder,
    seeds: &[AxisSeed],
    options: &BuildOptions,
) -> Result<AxisPack, CoreError> {
    if encoder.dim() != pack.d() {
        return Err(CoreError::DimensionMismatch {
            pack_id: pack.id.clone(),
            expected: pack.d(),
            actual: encoder.dim(),
        });
    }
    let appended = build_axis_pack(encoder, seeds, options)?;
    let total = pack.k() + appended.k();
    if total > pack.d() {
        return Err(CoreError::OverCompleteAxes {
            axes: total,
            dim: pack.d(),
        });
    }

    let mut directions: Vec<DVector<f64>> = (0..pack.k())
        .map(|c| pack.q.column(c).into_owned())
        .collect();
    directions.extend((0..appended.k()).map(|c| appended.q.column(c).into_owned()));
    let mut names = pack.names.clone();
    names.extend(appended.names.iter().cloned());
    let q = gram_schmidt(&directions, &names)?;

    let concat = |a: &DVector<f64>, b: &DVector<f64>| {
        DVector::from_iterator(total, a.iter().chain(b.iter()).copied())
    };

    let created_at = Utc::now();
    let mut out = AxisPack {
        id: String::new(),
        names,
        q,
        lambda: concat(&pack.lambda, &appended.lambda),
        beta: concat(&pack.beta, &appended.beta),
        // Weight mass rebalances uniformly across the grown axis set.
        weights: DVector::from_element(total, 1.0 / total as f64),
        mu: pack.mu.clone(),
        scales: None,
        orientation: pack
            .orientation
            .iter()
            .chain(appended.orientation.iter())
            .copied()
            .collect(),
        thresholds: pack
            .thresholds
            .iter()
            .chain(appended.thresholds.iter())
            .copied()
            .collect(),
        capacity: None,
        metadata: PackMetadata::new(created_at, pack.metadata.build_method.clone()),
    };
    out.id = AxisPack::derive_id(created_at, &out.fingerprint());
    out.validate()?;
    Ok(out)
}

/// Derive a raw direction from positive/negative seed embeddings.
fn derive_direction(
    method: DirectionMethod,
    pos: &[DVector<f64>],
    neg: &[DVector<f64>],
) -> Result<DVector<f64>, CoreError> {
    match method {
        DirectionMethod::DiffMean => Ok(mean(pos) - mean(neg)),
        DirectionMethod::Lda => lda_direction(pos, neg),
        DirectionMethod::Cca => cca_direction(pos, neg),
    }
}

fn mean(vectors: &[DVector<f64>]) -> DVector<f64> {
    let d = vectors[0].len();
    let mut out = DVector::zeros(d);
    for v in vectors {
        out += v;
    }
    out / vectors.len() as f64
}

fn scatter(vectors: &[DVector<f64>], center: &DVector<f64>) -> DMatrix<f64> {
    let d = center.len();
    let mut s = DMatrix::zeros(d, d);
    for v in vectors {
        let delta = v - center;
        s += &delta * delta.transpose();
    }
    if vectors.len() > 1 {
        s /= (vectors.len() - 1) as f64;
    }
    s
}

/// Linear discriminant direction: solve `Sw w = mu_pos − mu_neg` with
/// diagonal shrinkage for stability, then normalize.
fn lda_direction(
    pos: &[DVector<f64>],
    neg: &[DVector<f64>],
) -> Result<DVector<f64>, CoreError> {
    let mu_pos = mean(pos);
    let mu_neg = mean(neg);
    let mut sw = scatter(pos, &mu_pos) + scatter(neg, &mu_neg);
    let d = sw.nrows();
    for i in 0..d {
        sw[(i, i)] += LDA_SHRINKAGE;
    }
    let rhs = mu_pos - mu_neg;
    solve_spd(sw, rhs, "lda within-class scatter")
}

/// Correlation direction against the ±1 label signal:
/// `w = (XᵀX + εI)⁻¹ Xᵀ y` over mean-centered seed embeddings.
fn cca_direction(
    pos: &[DVector<f64>],
    neg: &[DVector<f64>],
) -> Result<DVector<f64>, CoreError> {
    let d = pos[0].len();
    let n = pos.len() + neg.len();
    let mut grand = DVector::zeros(d);
    for v in pos.iter().chain(neg.iter()) {
        grand += v;
    }
    grand /= n as f64;

    let mut xtx = DMatrix::zeros(d, d);
    let mut xty = DVector::zeros(d);
    for (v, label) in pos
        .iter()
        .map(|v| (v, 1.0))
        .chain(neg.iter().map(|v| (v, -1.0)))
    {
        let centered = v - &grand;
        xtx += &centered * centered.transpose();
        xty += centered * label;
    }
    for i in 0..d {
        xtx[(i, i)] += CCA_RIDGE;
    }
    solve_spd(xtx, xty, "cca normal equations")
}

/// Solve a symmetric positive-definite system, Cholesky first with an LU
/// fallback, and return the normalized solution.
fn solve_spd(
    matrix: DMatrix<f64>,
    rhs: DVector<f64>,
    label: &str,
) -> Result<DVector<f64>, CoreError> {
    let solved = matrix
        .clone()
        .cholesky()
        .map(|chol| chol.solve(&rhs))
        .or_else(|| matrix.lu().solve(&rhs))
        .ok_or_else(|| CoreError::configuration(format!("singular system in {label}")))?;
    let norm = solved.norm();
    if norm < DEGENERATE_NORM {
        return Err(CoreError::configuration(format!(
            "degenerate direction from {label}"
        )));
    }
    Ok(solved / norm)
}

/// Modified Gram-Schmidt over stacked directions, preserving order.
///
/// Each column subtracts its projection onto all previously processed
/// columns and is re-normalized. A residual below [`LOW_RANK_RATIO`] of
/// the original norm logs a low-rank warning; an exactly vanishing
/// residual (duplicate direction) is a configuration error.
fn gram_schmidt(directions: &[DVector<f64>], names: &[String]) -> Result<DMatrix<f64>, CoreError> {
    let mut columns: Vec<DVector<f64>> = Vec::with_capacity(directions.len());
    for (idx, dir) in directions.iter().enumerate() {
        let original_norm = dir.norm();
        let mut v = dir.clone();
        for q in &columns {
            let coeff = q.dot(&v);
            v -= q * coeff;
        }
        let norm = v.norm();
        if norm < DEGENERATE_NORM {
            return Err(CoreError::configuration(format!(
                "axis '{}' is collinear with earlier axes and vanishes under \
                 orthogonalization",
                names[idx]
            )));
        }
        if original_norm > 0.0 && norm / original_norm < LOW_RANK_RATIO {
            warn!(
                axis = names[idx].as_str(),
                residual_ratio = norm / original_norm,
                "axis direction nearly collinear with earlier axes; \
                 orthogonalized residual is close to rank-deficient"
            );
        }
        columns.push(v / norm);
    }
    Ok(DMatrix::from_columns(&columns))
}
