#![forbid(unsafe_code)]

//! # resonance-gate
//!
//! Scores free text against named semantic axes (directions in an
//! embedding space) and produces an auditable allow/refuse decision.
//!
//! The flow: seed phrases build an orthonormal [`pack::AxisPack`];
//! embeddings project onto it as multi-component [`projection::AxialVector`]s;
//! token scores aggregate into span and frame scores through sliding
//! windows, skip relations, and multi-scale diffusion; per-axis scores
//! combine into one utility via a capacity-weighted Choquet integral; and
//! the veto evaluator compares spans against calibrated thresholds,
//! reporting minimal violating spans in a reproducible
//! [`veto::DecisionProof`].
//!
//! No cosine similarity anywhere: projections are affine and magnitudes
//! stay meaningful end to end.

pub mod builder;
pub mod calibrate;
pub mod capacity;
pub mod diffusion;
pub mod encoder;
pub mod error;
pub mod frames;
pub mod pack;
pub mod pipeline;
pub mod projection;
pub mod registry;
pub mod tokenize;
pub mod veto;

pub use builder::{append_axes, build_axis_pack, AxisSeed, BuildOptions, DirectionMethod};
pub use calibrate::{calibrate, CalibrationOptions, CalibrationOutcome, LabeledExample};
pub use capacity::{choquet, Capacity};
pub use encoder::{Encoder, HashEncoder};
pub use error::CoreError;
pub use pack::{AxisPack, AxisPole, PackMetadata};
pub use pipeline::{EvaluationReport, PipelineParams, ResonancePipeline};
pub use projection::{project, AxialVector, GatePolicy};
pub use registry::AxisRegistry;
pub use veto::{Action, DecisionProof, VetoEvaluator, VetoPolicy};
