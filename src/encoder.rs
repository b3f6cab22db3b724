//! Encoder contract and a deterministic fallback implementation.
//!
//! The encoder is an external collaborator: a pure function from text to a
//! fixed-length dense vector. The core only depends on this trait; the
//! embedding dimension is discovered once via [`Encoder::dim`] and cached
//! by callers. Encoding is the only suspension point in the pipeline, so
//! implementations receive whole batches.

use nalgebra::DVector;
use rand::distributions::Distribution;
use rand::rngs::StdRng;
use rand::SeedableRng;
use statrs::distribution::Normal;

use crate::error::CoreError;

/// Maps text strings to fixed-length dense vectors.
///
/// Implementations must be deterministic for a fixed model version.
pub trait Encoder: Send + Sync {
    /// Embedding dimension produced by this encoder.
    fn dim(&self) -> usize;

    /// Encode a batch of texts into vectors of length [`Encoder::dim`].
    fn encode(&self, texts: &[String]) -> Result<Vec<DVector<f64>>, CoreError>;
}

/// Deterministic, dependency-free encoder for CI, demos, and calibration
/// dry runs.
///
/// Each token maps to a unit vector drawn from a standard normal seeded by
/// the blake3 hash of the token; multi-token texts mean-pool their token
/// vectors without re-normalizing, so magnitude carries pooled salience.
#[derive(Debug, Clone)]
pub struct HashEncoder {
    dim: usize,
}

impl HashEncoder {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }

    fn token_vector(&self, token: &str) -> DVector<f64> {
        let digest = blake3::hash(token.as_bytes());
        let mut seed_bytes = [0u8; 8];
        seed_bytes.copy_from_slice(&digest.as_bytes()[..8]);
        let mut rng = StdRng::seed_from_u64(u64::from_le_bytes(seed_bytes));
        let normal = Normal::new(0.0, 1.0).expect("standard normal parameters");
        let mut v = DVector::from_fn(self.dim, |_, _| normal.sample(&mut rng));
        let norm = v.norm();
        if norm > 0.0 {
            v /= norm;
        }
        v
    }
}

impl Encoder for HashEncoder {
    fn dim(&self) -> usize {
        self.dim
    }

    fn encode(&self, texts: &[String]) -> Result<Vec<DVector<f64>>, CoreError> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            let tokens: Vec<&str> = text.split_whitespace().collect();
            if tokens.is_empty() {
                out.push(DVector::zeros(self.dim));
                continue;
            }
            let mut pooled = DVector::zeros(self.dim);
            for tok in &tokens {
                pooled += self.token_vector(tok);
            }
            pooled /= tokens.len() as f64;
            out.push(pooled);
        }
        Ok(out)
    }
}
