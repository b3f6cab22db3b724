//! Cross-module properties: concurrency safety, default-capacity
//! equivalence, and determinism of the full pipeline.

mod common;

use std::sync::Arc;
use std::thread;

use common::{scenario_pack, LexiconEncoder, DIM};
use resonance_gate::pipeline::{PipelineParams, ResonancePipeline};
use resonance_gate::registry::AxisRegistry;

#[test]
fn default_capacity_utility_equals_weighted_sum() {
    let registry = Arc::new(AxisRegistry::new(DIM));
    registry.insert(scenario_pack()).unwrap();
    let pack = registry.activate("scenario-pack").unwrap();

    let pipeline = ResonancePipeline::new(
        LexiconEncoder,
        registry,
        PipelineParams::default(),
    );
    let report = pipeline
        .evaluate("doc", "they harm and deceive people constantly")
        .unwrap();

    // No explicit capacity: every span's C must equal Σ weights_i · r_i.
    assert!(pack.capacity.is_none());
    for span in &report.spans {
        let c = span.vectors.utility.expect("spans carry C");
        let weighted: f64 = span
            .vectors
            .r
            .iter()
            .enumerate()
            .map(|(i, r)| pack.weights[i] * r)
            .sum();
        assert!((c - weighted).abs() < 1e-12);
    }
}

#[test]
fn projection_parallelizes_without_locks() {
    let pack = Arc::new(scenario_pack());
    let texts = ["harm", "help", "truth", "deceive", "neutral", "words"];

    let handles: Vec<_> = texts
        .iter()
        .map(|word| {
            let pack = Arc::clone(&pack);
            let word = word.to_string();
            thread::spawn(move || {
                use resonance_gate::encoder::Encoder;
                use resonance_gate::projection::{project, GatePolicy};
                let embeddings = LexiconEncoder.encode(&[word]).unwrap();
                project(&embeddings[0], &pack, &GatePolicy::default()).unwrap()
            })
        })
        .collect();

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.join().unwrap());
    }
    assert_eq!(results.len(), texts.len());
    for v in &results {
        assert!(v.alpha.iter().all(|x| x.is_finite()));
        assert!(v.r.iter().all(|x| *x >= 0.0));
    }
}

#[test]
fn readers_see_old_or_new_pack_never_a_mix() {
    let registry = Arc::new(AxisRegistry::new(DIM));
    registry.insert(scenario_pack()).unwrap();
    let mut second = scenario_pack();
    second.id = "scenario-pack-2".into();
    registry.insert(second).unwrap();
    registry.activate("scenario-pack").unwrap();

    let reader_registry = Arc::clone(&registry);
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let registry = Arc::clone(&reader_registry);
            thread::spawn(move || {
                for _ in 0..500 {
                    let pack = registry.active().expect("always an active pack");
                    // A torn swap would break the pack's own invariants.
                    assert!(pack.id == "scenario-pack" || pack.id == "scenario-pack-2");
                    assert_eq!(pack.names.len(), pack.k());
                    assert_eq!(pack.thresholds.len(), pack.k());
                }
            })
        })
        .collect();

    let writer = {
        let registry = Arc::clone(&registry);
        thread::spawn(move || {
            for i in 0..200 {
                let id = if i % 2 == 0 {
                    "scenario-pack-2"
                } else {
                    "scenario-pack"
                };
                registry.activate(id).unwrap();
            }
        })
    };

    for reader in readers {
        reader.join().unwrap();
    }
    writer.join().unwrap();
}

#[test]
fn full_report_serializes_to_json() {
    let registry = Arc::new(AxisRegistry::new(DIM));
    registry.insert(scenario_pack()).unwrap();
    registry.activate("scenario-pack").unwrap();
    let pipeline = ResonancePipeline::new(
        LexiconEncoder,
        registry,
        PipelineParams::default(),
    );
    let report = pipeline.evaluate("doc", "I will harm you").unwrap();

    let json = serde_json::to_string(&report).unwrap();
    // Documented wire names for the axial components.
    assert!(json.contains("\"U\""));
    assert!(json.contains("\"alpha\""));
    assert!(json.contains("\"aggregation\":\"OR\""));
    assert!(json.contains("\"action\":\"refuse\""));

    let proof_json = serde_json::to_string(&report.proof).unwrap();
    let back: resonance_gate::veto::DecisionProof =
        serde_json::from_str(&proof_json).unwrap();
    assert_eq!(back, report.proof);
}
