//! End-to-end evaluation pipeline.
//!
//! text → tokenize → encode (one batched call, the only external step) →
//! token projection → span aggregation (+ skip coherence and multi-scale
//! diffusion) → frames → veto → report.
//!
//! Everything after encoding is a pure function of `(embeddings, pack)`:
//! no shared mutable state, no I/O, no internal locking. Batch callers may
//! parallelize at token or span granularity; the pipeline itself stays
//! single-threaded and deterministic.

use std::sync::Arc;

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::diffusion::{
    aggregate_span, diffuse_spans, enumerate_spans, heat_kernel_smooth, laplacian,
    skip_adjacency, span_skip_coherence, DiffusionParams,
};
use crate::encoder::Encoder;
use crate::error::CoreError;
use crate::frames::{build_frames, Frame, FrameParams, FrameRecord};
use crate::pack::AxisPack;
use crate::projection::{project, AxialVector, GatePolicy};
use crate::registry::AxisRegistry;
use crate::tokenize::{tokenize, Token};
use crate::veto::{DecisionProof, VetoEvaluator, VetoPolicy};

/// Pipeline configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineParams {
    pub diffusion: DiffusionParams,
    pub frames: FrameParams,
    pub gate: GatePolicy,
    pub policy: VetoPolicy,
    /// Optional heat-kernel scale applied to token embeddings before
    /// projection, smoothing signals over the skip graph.
    pub token_smoothing: Option<f64>,
}

/// One contiguous span with its raw (`tau = 0`) vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanOutput {
    pub start: usize,
    pub end: usize,
    pub vectors: AxialVector,
    /// Weighted mean utility of the span's skip-pair midpoints.
    pub skip_coherence: f64,
}

/// Span vectors recomputed at one diffusion scale, aligned with the span
/// list order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffusedLevel {
    pub tau: f64,
    pub vectors: Vec<AxialVector>,
}

/// Full evaluation output for one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub pack_id: String,
    pub tokens: Vec<Token>,
    pub token_vectors: Vec<AxialVector>,
    pub spans: Vec<SpanOutput>,
    pub diffused: Vec<DiffusedLevel>,
    pub frames: Vec<Frame>,
    pub frame_records: Vec<FrameRecord>,
    pub proof: DecisionProof,
    pub tau_used: Vec<f64>,
}

/// Synchronous evaluation pipeline bound to an encoder and a registry.
pub struct ResonancePipeline<E: Encoder> {
    encoder: E,
    registry: Arc<AxisRegistry>,
    params: PipelineParams,
}

impl<E: Encoder> ResonancePipeline<E> {
    pub fn new(encoder: E, registry: Arc<AxisRegistry>, params: PipelineParams) -> Self {
        Self {
            encoder,
            registry,
            params,
        }
    }

    pub fn params(&self) -> &PipelineParams {
        &self.params
    }

    /// Evaluate against the registry's active pack.
    ///
    /// Fails with `NoActivePack` when nothing has been activated;
    /// evaluation without axes is meaningless and is never defaulted to
    /// "allow".
    pub fn evaluate(&self, doc_id: &str, text: &str) -> Result<EvaluationReport, CoreError> {
        let pack = self.registry.active().ok_or(CoreError::NoActivePack)?;
        self.evaluate_with_pack(&pack, doc_id, text)
    }

    /// Evaluate against an explicit pack.
    pub fn evaluate_with_pack(
        &self,
        pack: &AxisPack,
        doc_id: &str,
        text: &str,
    ) -> Result<EvaluationReport, CoreError> {
        self.params.diffusion.validate()?;
        let tokens = tokenize(text);
        if tokens.is_empty() {
            // Vacuous allow: empty token/span/frame lists, no error.
            let evaluator = self.evaluator(pack);
            let proof = evaluator.evaluate(&[], &[], &[])?;
            return Ok(EvaluationReport {
                pack_id: pack.id.clone(),
                tokens,
                token_vectors: Vec::new(),
                spans: Vec::new(),
                diffused: Vec::new(),
                frames: Vec::new(),
                frame_records: Vec::new(),
                proof,
                tau_used: self.params.diffusion.taus.clone(),
            });
        }

        if self.encoder.dim() != pack.d() {
            return Err(CoreError::DimensionMismatch {
                pack_id: pack.id.clone(),
                expected: pack.d(),
                actual: self.encoder.dim(),
            });
        }

        let texts: Vec<String> = tokens.iter().map(|t| t.text.clone()).collect();
        let mut embeddings = self.encoder.encode(&texts)?;
        if embeddings.len() != tokens.len() {
            return Err(CoreError::Encoder {
                message: format!(
                    "encoder returned {} vectors for {} tokens",
                    embeddings.len(),
                    tokens.len()
                ),
            });
        }

        if let Some(tau) = self.params.token_smoothing {
            embeddings = self.smooth_tokens(&embeddings, tau)?;
        }

        let gate = &self.params.gate;
        let token_vectors: Vec<AxialVector> = embeddings
            .iter()
            .map(|x| project(x, pack, gate))
            .collect::<Result<_, _>>()?;

        let n = tokens.len();
        let diffusion = &self.params.diffusion;
        let span_list = enumerate_spans(n, diffusion.max_span_len);
        let mut spans = Vec::with_capacity(span_list.len());
        let mut base_vectors = Vec::with_capacity(span_list.len());
        for (start, end) in &span_list {
            let vector = aggregate_span(
                &token_vectors,
                *start,
                *end,
                diffusion.max_skip,
                pack,
                diffusion.combine,
                gate,
            );
            let coherence =
                span_skip_coherence(&embeddings, pack, *start, *end, diffusion.max_skip)?;
            base_vectors.push(vector.clone());
            spans.push(SpanOutput {
                start: *start,
                end: *end,
                vectors: vector,
                skip_coherence: coherence,
            });
        }

        let diffused = diffuse_spans(&base_vectors, &span_list, n, diffusion, pack, gate)?
            .into_iter()
            .zip(&diffusion.taus)
            .map(|(vectors, tau)| DiffusedLevel { tau: *tau, vectors })
            .collect();

        let frames = build_frames(&token_vectors, pack, &self.params.frames, gate);
        let frame_records: Vec<FrameRecord> =
            frames.iter().map(|f| f.record(doc_id, pack)).collect();

        let evaluator = self.evaluator(pack);
        let proof = evaluator.evaluate(&token_vectors, &span_list, &base_vectors)?;
        debug!(
            doc_id,
            pack_id = pack.id.as_str(),
            tokens = n,
            spans = span_list.len(),
            frames = frames.len(),
            action = ?proof.action,
            "evaluated document"
        );

        Ok(EvaluationReport {
            pack_id: pack.id.clone(),
            tokens,
            token_vectors,
            spans,
            diffused,
            frames,
            frame_records,
            proof,
            tau_used: diffusion.taus.clone(),
        })
    }

    fn evaluator<'p>(&self, pack: &'p AxisPack) -> VetoEvaluator<'p> {
        VetoEvaluator::new(
            pack,
            self.params.policy,
            self.params.diffusion.combine,
            self.params.diffusion.max_skip,
            self.params.gate,
        )
    }

    fn smooth_tokens(
        &self,
        embeddings: &[DVector<f64>],
        tau: f64,
    ) -> Result<Vec<DVector<f64>>, CoreError> {
        let n = embeddings.len();
        let d = self.encoder.dim();
        let mut x = DMatrix::zeros(n, d);
        for (row, v) in embeddings.iter().enumerate() {
            for (col, value) in v.iter().enumerate() {
                x[(row, col)] = *value;
            }
        }
        let w = skip_adjacency(n, self.params.diffusion.max_skip);
        let l = laplacian(&w);
        let smoothed = heat_kernel_smooth(&l, &x, &[tau])?.remove(0);
        Ok((0..n)
            .map(|row| DVector::from_iterator(d, smoothed.row(row).iter().copied()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{build_axis_pack, AxisSeed, BuildOptions};
    use crate::encoder::HashEncoder;
    use crate::pack::AxisPole;
    use crate::veto::Action;

    fn registry_with_pack(dim: usize) -> Arc<AxisRegistry> {
        let encoder = HashEncoder::new(dim);
        let seeds = vec![AxisSeed {
            name: "benevolence".into(),
            positives: vec!["help".into(), "support".into()],
            negatives: vec!["harm".into(), "attack".into()],
            pole: AxisPole::Negative,
        }];
        let options = BuildOptions {
            id: Some("pipeline-pack".into()),
            thresholds: Some(vec![0.5]),
            ..Default::default()
        };
        let pack = build_axis_pack(&encoder, &seeds, &options).unwrap();
        let registry = Arc::new(AxisRegistry::new(dim));
        registry.insert(pack).unwrap();
        registry.activate("pipeline-pack").unwrap();
        registry
    }

    #[test]
    fn no_active_pack_is_an_error() {
        let registry = Arc::new(AxisRegistry::new(32));
        let pipeline = ResonancePipeline::new(
            HashEncoder::new(32),
            registry,
            PipelineParams::default(),
        );
        let err = pipeline.evaluate("doc", "anything").unwrap_err();
        assert_eq!(err.code(), "no_active_pack");
    }

    #[test]
    fn empty_text_is_a_vacuous_allow() {
        let registry = registry_with_pack(64);
        let pipeline = ResonancePipeline::new(
            HashEncoder::new(64),
            registry,
            PipelineParams::default(),
        );
        let report = pipeline.evaluate("doc", "   ").unwrap();
        assert!(report.tokens.is_empty());
        assert!(report.spans.is_empty());
        assert!(report.frames.is_empty());
        assert_eq!(report.proof.action, Action::Allow);
    }

    #[test]
    fn mismatched_encoder_dimension_fails_without_partial_result() {
        let registry = registry_with_pack(64);
        let pipeline = ResonancePipeline::new(
            HashEncoder::new(32),
            registry,
            PipelineParams::default(),
        );
        let err = pipeline.evaluate("doc", "some text").unwrap_err();
        match err {
            CoreError::DimensionMismatch {
                expected, actual, ..
            } => {
                assert_eq!(expected, 64);
                assert_eq!(actual, 32);
            }
            other => panic!("expected DimensionMismatch, got {other}"),
        }
    }

    #[test]
    fn report_shapes_are_consistent() {
        let registry = registry_with_pack(64);
        let params = PipelineParams {
            diffusion: DiffusionParams {
                taus: vec![0.0, 0.3],
                ..Default::default()
            },
            ..Default::default()
        };
        let pipeline = ResonancePipeline::new(HashEncoder::new(64), registry, params);
        let report = pipeline.evaluate("doc-1", "I will help you today").unwrap();

        assert_eq!(report.tokens.len(), 5);
        assert_eq!(report.token_vectors.len(), 5);
        assert!(!report.spans.is_empty());
        assert_eq!(report.diffused.len(), 2);
        assert_eq!(report.diffused[0].tau, 0.0);
        for level in &report.diffused {
            assert_eq!(level.vectors.len(), report.spans.len());
        }
        for (span, diffused) in report.spans.iter().zip(&report.diffused[0].vectors) {
            assert_eq!(&span.vectors.alpha, &diffused.alpha);
        }
        assert_eq!(report.tau_used, vec![0.0, 0.3]);
        for record in &report.frame_records {
            assert_eq!(record.doc_id, "doc-1");
            assert_eq!(record.pack_id, "pipeline-pack");
        }
    }

    #[test]
    fn token_smoothing_changes_vectors_but_not_shapes() {
        let registry = registry_with_pack(64);
        let params = PipelineParams {
            token_smoothing: Some(0.4),
            ..Default::default()
        };
        let smoothed = ResonancePipeline::new(HashEncoder::new(64), registry.clone(), params)
            .evaluate("doc", "one two three four")
            .unwrap();
        let raw = ResonancePipeline::new(
            HashEncoder::new(64),
            registry,
            PipelineParams::default(),
        )
        .evaluate("doc", "one two three four")
        .unwrap();

        assert_eq!(smoothed.token_vectors.len(), raw.token_vectors.len());
        assert_ne!(smoothed.token_vectors[0].alpha, raw.token_vectors[0].alpha);
    }
}
