//! The axis pack: an immutable bundle of orthonormal axis directions,
//! per-axis calibration, aggregation weights, and veto thresholds.
//!
//! A pack is created once by the builder and never mutated; recalibration
//! and rebuilds produce new pack values with new ids. The fingerprint is a
//! stable blake3 hash over the numeric arrays `(Q, names, lambda, beta,
//! weights)` and is used for cache invalidation and artifact integrity.
//!
//! On disk a pack is two files: `<id>.arrays.json` holding the numeric
//! arrays and `<id>.meta.json` holding names, thresholds, capacity, and
//! provenance. serde_json prints f64 with shortest-roundtrip precision, so
//! a save/load round trip reproduces the arrays bit for bit.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::capacity::Capacity;
use crate::error::CoreError;

/// Orthonormality tolerance for `QᵀQ ≈ I`.
pub const ORTHONORMALITY_TOL: f64 = 1e-6;

/// Artifact schema version written to the metadata sidecar.
pub const SCHEMA_VERSION: &str = "axis-pack/1";

/// Which pole of an axis counts as veto evidence.
///
/// An axis seeded with benevolent positives vetoes text aligned with its
/// negative pole; an axis seeded with the concern itself vetoes on the
/// positive pole (the default).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AxisPole {
    #[default]
    Positive,
    Negative,
}

/// Free-form provenance carried by a pack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackMetadata {
    pub schema_version: String,
    pub created_at: DateTime<Utc>,
    /// Direction-derivation method used by the builder ("diffmean", ...).
    pub build_method: String,
    #[serde(default)]
    pub notes: BTreeMap<String, String>,
}

impl PackMetadata {
    pub fn new(created_at: DateTime<Utc>, build_method: impl Into<String>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            created_at,
            build_method: build_method.into(),
            notes: BTreeMap::new(),
        }
    }
}

/// Immutable bundle of axis directions and calibration.
#[derive(Debug, Clone, PartialEq)]
pub struct AxisPack {
    pub id: String,
    /// Ordered axis names, unique, length k.
    pub names: Vec<String>,
    /// Projection matrix, shape (d, k); columns are orthonormal.
    pub q: DMatrix<f64>,
    /// Per-axis scale applied to raw projections.
    pub lambda: DVector<f64>,
    /// Per-axis bias added to scaled projections.
    pub beta: DVector<f64>,
    /// Linear aggregation weights; the fallback when no capacity is set.
    pub weights: DVector<f64>,
    /// Optional centering vector subtracted before projection.
    pub mu: Option<DVector<f64>>,
    /// Optional per-axis normalization scale for `u`; set by calibration.
    pub scales: Option<DVector<f64>>,
    /// Per-axis veto pole.
    pub orientation: Vec<AxisPole>,
    /// Per-axis veto thresholds from calibration.
    pub thresholds: Vec<f64>,
    /// Optional Choquet capacity; absent means additive aggregation.
    pub capacity: Option<Capacity>,
    pub metadata: PackMetadata,
}

impl AxisPack {
    /// Number of axes.
    pub fn k(&self) -> usize {
        self.names.len()
    }

    /// Embedding dimension.
    pub fn d(&self) -> usize {
        self.q.nrows()
    }

    /// Look up an axis index by name.
    pub fn axis_index(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    /// Validate shapes, finiteness, uniqueness, orthonormality, and the
    /// capacity (when present).
    pub fn validate(&self) -> Result<(), CoreError> {
        let k = self.k();
        let d = self.d();
        if k == 0 {
            return Err(CoreError::configuration("pack has no axes"));
        }
        if k > d {
            return Err(CoreError::OverCompleteAxes { axes: k, dim: d });
        }
        if self.q.ncols() != k {
            return Err(CoreError::configuration(format!(
                "Q has {} columns but pack names {} axes",
                self.q.ncols(),
                k
            )));
        }
        {
            let mut seen = std::collections::HashSet::new();
            for name in &self.names {
                if !seen.insert(name.as_str()) {
                    return Err(CoreError::configuration(format!(
                        "duplicate axis name: {name}"
                    )));
                }
            }
        }
        for (label, v) in [
            ("lambda", &self.lambda),
            ("beta", &self.beta),
            ("weights", &self.weights),
        ] {
            if v.len() != k {
                return Err(CoreError::configuration(format!(
                    "{label} must have length {k}, got {}",
                    v.len()
                )));
            }
            if v.iter().any(|x| !x.is_finite()) {
                return Err(CoreError::configuration(format!(
                    "{label} contains a non-finite value"
                )));
            }
        }
        if let Some(mu) = &self.mu {
            if mu.len() != d {
                return Err(CoreError::configuration(format!(
                    "mu must have length {d}, got {}",
                    mu.len()
                )));
            }
            if mu.iter().any(|x| !x.is_finite()) {
                return Err(CoreError::configuration("mu contains a non-finite value"));
            }
        }
        if let Some(scales) = &self.scales {
            if scales.len() != k {
                return Err(CoreError::configuration(format!(
                    "scales must have length {k}, got {}",
                    scales.len()
                )));
            }
            if scales.iter().any(|x| !x.is_finite() || *x <= 0.0) {
                return Err(CoreError::configuration(
                    "scales must be finite and positive",
                ));
            }
        }
        if self.orientation.len() != k {
            return Err(CoreError::configuration(format!(
                "orientation must have length {k}, got {}",
                self.orientation.len()
            )));
        }
        if self.thresholds.len() != k {
            return Err(CoreError::configuration(format!(
                "thresholds must have length {k}, got {}",
                self.thresholds.len()
            )));
        }
        if self.thresholds.iter().any(|x| !x.is_finite()) {
            return Err(CoreError::configuration(
                "thresholds contain a non-finite value",
            ));
        }
        if self.q.iter().any(|x| !x.is_finite()) {
            return Err(CoreError::configuration("Q contains a non-finite value"));
        }

        let qtq = self.q.transpose() * &self.q;
        let mut max_err: f64 = 0.0;
        for i in 0..k {
            for j in 0..k {
                let expected = if i == j { 1.0 } else { 0.0 };
                max_err = max_err.max((qtq[(i, j)] - expected).abs());
            }
        }
        if max_err > ORTHONORMALITY_TOL {
            return Err(CoreError::configuration(format!(
                "Q columns not orthonormal: max |QᵀQ − I| = {max_err:.3e}"
            )));
        }

        if let Some(capacity) = &self.capacity {
            if capacity.k() != k {
                return Err(CoreError::configuration(format!(
                    "capacity is over {} axes but pack has {k}",
                    capacity.k()
                )));
            }
            capacity.validate()?;
        }
        Ok(())
    }

    /// Stable fingerprint over `(Q, names, lambda, beta, weights)`.
    ///
    /// Arrays are hashed as little-endian f64 bytes in column-major order,
    /// fields separated by NUL delimiters so boundaries cannot alias.
    pub fn fingerprint(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        for value in self.q.iter() {
            hasher.update(&value.to_le_bytes());
        }
        hasher.update(&[0]);
        for name in &self.names {
            hasher.update(name.as_bytes());
            hasher.update(&[0]);
        }
        for v in [&self.lambda, &self.beta, &self.weights] {
            for value in v.iter() {
                hasher.update(&value.to_le_bytes());
            }
            hasher.update(&[0]);
        }
        hasher.finalize().to_hex().to_string()
    }

    /// Derive a pack id from a creation timestamp and the fingerprint.
    pub fn derive_id(created_at: DateTime<Utc>, fingerprint: &str) -> String {
        let prefix = &fingerprint[..12.min(fingerprint.len())];
        format!("{}-{}", created_at.format("%Y%m%dT%H%M%SZ"), prefix)
    }

    /// Derive a new pack with calibrated thresholds (and optionally `u`
    /// scales). The source pack is untouched; the derived pack gets the
    /// supplied id, or `<id>-cal` when none is given.
    pub fn with_calibration(
        &self,
        thresholds: Vec<f64>,
        scales: Option<Vec<f64>>,
        id: Option<String>,
    ) -> Result<AxisPack, CoreError> {
        let mut pack = self.clone();
        pack.id = id.unwrap_or_else(|| format!("{}-cal", self.id));
        pack.thresholds = thresholds;
        pack.scales = scales.map(DVector::from_vec);
        pack.validate()?;
        Ok(pack)
    }

    fn arrays_path(dir: &Path, id: &str) -> PathBuf {
        dir.join(format!("{id}.arrays.json"))
    }

    fn meta_path(dir: &Path, id: &str) -> PathBuf {
        dir.join(format!("{id}.meta.json"))
    }

    /// Write the arrays bundle and metadata sidecar into `dir`.
    pub fn save(&self, dir: &Path) -> Result<(), CoreError> {
        self.validate()?;
        fs::create_dir_all(dir)?;

        let arrays = ArraysFile {
            q: (0..self.k())
                .map(|c| self.q.column(c).iter().copied().collect())
                .collect(),
            lambda: self.lambda.iter().copied().collect(),
            beta: self.beta.iter().copied().collect(),
            weights: self.weights.iter().copied().collect(),
            mu: self.mu.as_ref().map(|m| m.iter().copied().collect()),
        };
        let meta = MetaFile {
            id: self.id.clone(),
            schema_version: self.metadata.schema_version.clone(),
            names: self.names.clone(),
            dim: self.d(),
            thresholds: self.thresholds.clone(),
            scales: self.scales.as_ref().map(|s| s.iter().copied().collect()),
            orientation: self.orientation.clone(),
            capacity: self.capacity.as_ref().map(|c| c.to_json_map()),
            fingerprint: self.fingerprint(),
            created_at: self.metadata.created_at,
            build_method: self.metadata.build_method.clone(),
            notes: self.metadata.notes.clone(),
        };

        fs::write(
            Self::arrays_path(dir, &self.id),
            serde_json::to_string_pretty(&arrays)?,
        )?;
        fs::write(
            Self::meta_path(dir, &self.id),
            serde_json::to_string_pretty(&meta)?,
        )?;
        Ok(())
    }

    /// Load a pack by id from `dir`, validating shapes, orthonormality,
    /// capacity, and the recorded fingerprint.
    pub fn load(dir: &Path, id: &str) -> Result<AxisPack, CoreError> {
        let arrays_path = Self::arrays_path(dir, id);
        let meta_path = Self::meta_path(dir, id);
        if !arrays_path.exists() || !meta_path.exists() {
            return Err(CoreError::PackNotFound {
                pack_id: id.to_string(),
            });
        }
        let arrays: ArraysFile = serde_json::from_str(&fs::read_to_string(arrays_path)?)?;
        let meta: MetaFile = serde_json::from_str(&fs::read_to_string(meta_path)?)?;

        let k = meta.names.len();
        if arrays.q.len() != k {
            return Err(CoreError::configuration(format!(
                "arrays bundle has {} axis columns but meta names {k} axes",
                arrays.q.len()
            )));
        }
        let d = meta.dim;
        if arrays.q.iter().any(|col| col.len() != d) {
            return Err(CoreError::configuration(
                "axis columns disagree with the recorded dimension",
            ));
        }
        let mut q = DMatrix::zeros(d, k);
        for (c, col) in arrays.q.iter().enumerate() {
            for (r, value) in col.iter().enumerate() {
                q[(r, c)] = *value;
            }
        }

        let capacity = match &meta.capacity {
            Some(map) => Some(Capacity::from_json_map(k, map)?),
            None => None,
        };
        let mut metadata = PackMetadata::new(meta.created_at, meta.build_method);
        metadata.schema_version = meta.schema_version.clone();
        metadata.notes = meta.notes;
        if metadata.schema_version != SCHEMA_VERSION {
            return Err(CoreError::configuration(format!(
                "unsupported schema version: {}",
                metadata.schema_version
            )));
        }

        let pack = AxisPack {
            id: meta.id,
            names: meta.names,
            q,
            lambda: DVector::from_vec(arrays.lambda),
            beta: DVector::from_vec(arrays.beta),
            weights: DVector::from_vec(arrays.weights),
            mu: arrays.mu.map(DVector::from_vec),
            scales: meta.scales.map(DVector::from_vec),
            orientation: meta.orientation,
            thresholds: meta.thresholds,
            capacity,
            metadata,
        };
        pack.validate()?;
        let fingerprint = pack.fingerprint();
        if fingerprint != meta.fingerprint {
            return Err(CoreError::configuration(format!(
                "fingerprint mismatch for pack {}: arrays hash {} but meta records {}",
                pack.id, fingerprint, meta.fingerprint
            )));
        }
        Ok(pack)
    }
}

/// Numeric arrays bundle (`<id>.arrays.json`). Axis directions are stored
/// one column per axis.
#[derive(Debug, Serialize, Deserialize)]
struct ArraysFile {
    q: Vec<Vec<f64>>,
    lambda: Vec<f64>,
    beta: Vec<f64>,
    weights: Vec<f64>,
    #[serde(default)]
    mu: Option<Vec<f64>>,
}

/// Metadata sidecar (`<id>.meta.json`).
#[derive(Debug, Serialize, Deserialize)]
struct MetaFile {
    id: String,
    schema_version: String,
    names: Vec<String>,
    dim: usize,
    thresholds: Vec<f64>,
    #[serde(default)]
    scales: Option<Vec<f64>>,
    orientation: Vec<AxisPole>,
    #[serde(default)]
    capacity: Option<BTreeMap<String, f64>>,
    fingerprint: String,
    created_at: DateTime<Utc>,
    build_method: String,
    #[serde(default)]
    notes: BTreeMap<String, String>,
}
