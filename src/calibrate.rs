//! Offline threshold calibration from labeled examples.
//!
//! Consumes batches of `(text, label)` examples per axis, scores each text
//! at the whole-phrase level, and sweeps the observed scores for the
//! best-F1 threshold whose false-positive rate stays within the budget.
//! Rank-sum AUROC and sweep AUPRC are reported per axis for the audit
//! trail. This is a batch step over pre-labeled data; thresholds are
//! never adjusted online.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::encoder::Encoder;
use crate::error::CoreError;
use crate::pack::AxisPack;
use crate::projection::{project, GatePolicy};
use crate::veto::veto_evidence;

/// One labeled calibration example. Labels above 0.5 count as violations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabeledExample {
    pub text: String,
    pub label: f64,
}

/// Calibration options.
#[derive(Debug, Clone, Copy)]
pub struct CalibrationOptions {
    /// Maximum tolerated false-positive rate when selecting thresholds.
    pub fpr_max: f64,
    /// Also derive per-axis `u` scales from the mean positive evidence.
    pub set_scales: bool,
}

impl Default for CalibrationOptions {
    fn default() -> Self {
        Self {
            fpr_max: 0.05,
            set_scales: false,
        }
    }
}

/// Per-axis calibration result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AxisCalibration {
    pub threshold: f64,
    pub auroc: f64,
    pub auprc: f64,
    pub positives: usize,
    pub negatives: usize,
}

/// Full calibration outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationOutcome {
    /// New per-axis thresholds; axes without data keep their old values.
    pub thresholds: Vec<f64>,
    /// Per-axis `u` scales when requested.
    pub scales: Option<Vec<f64>>,
    pub fpr_max: f64,
    pub per_axis: BTreeMap<String, AxisCalibration>,
}

/// Calibrate thresholds for `pack` from per-axis labeled datasets.
///
/// The returned outcome feeds [`AxisPack::with_calibration`]; the source
/// pack is untouched.
pub fn calibrate(
    encoder: &dyn Encoder,
    pack: &AxisPack,
    datasets: &BTreeMap<String, Vec<LabeledExample>>,
    options: &CalibrationOptions,
) -> Result<CalibrationOutcome, CoreError> {
    if !(0.0..=1.0).contains(&options.fpr_max) {
        return Err(CoreError::configuration(format!(
            "fpr_max must be in [0, 1], got {}",
            options.fpr_max
        )));
    }
    for axis in datasets.keys() {
        if pack.axis_index(axis).is_none() {
            return Err(CoreError::configuration(format!(
                "calibration dataset references unknown axis '{axis}'"
            )));
        }
    }

    let mut thresholds: Vec<f64> = pack.thresholds.clone();
    let mut scales = vec![1.0; pack.k()];
    let mut per_axis = BTreeMap::new();
    let gate = GatePolicy::default();

    for (axis_name, examples) in datasets {
        let axis = pack
            .axis_index(axis_name)
            .expect("validated above");
        if examples.is_empty() {
            continue;
        }

        // One batched encoder call per axis dataset.
        let texts: Vec<String> = examples.iter().map(|e| e.text.clone()).collect();
        let embeddings = encoder.encode(&texts)?;
        let mut points: Vec<(f64, bool)> = Vec::with_capacity(examples.len());
        for (embedding, example) in embeddings.iter().zip(examples) {
            let vector = project(embedding, pack, &gate)?;
            let evidence = veto_evidence(&vector, pack)[axis];
            if !evidence.is_finite() {
                return Err(CoreError::InvalidScore {
                    axis: axis_name.clone(),
                });
            }
            points.push((evidence, example.label > 0.5));
        }

        let threshold = pick_threshold(&points, options.fpr_max);
        let (auroc, auprc) = ranking_metrics(&points);
        let positives = points.iter().filter(|(_, l)| *l).count();
        let negatives = points.len() - positives;

        if let Some(t) = threshold {
            thresholds[axis] = t;
        }
        if options.set_scales && positives > 0 {
            let mean_positive: f64 = points
                .iter()
                .filter(|(_, l)| *l)
                .map(|(s, _)| s)
                .sum::<f64>()
                / positives as f64;
            if mean_positive > 0.0 {
                scales[axis] = mean_positive;
            }
        }

        debug!(
            axis = axis_name.as_str(),
            threshold = thresholds[axis],
            auroc,
            auprc,
            positives,
            negatives,
            "calibrated axis"
        );
        per_axis.insert(
            axis_name.clone(),
            AxisCalibration {
                threshold: thresholds[axis],
                auroc,
                auprc,
                positives,
                negatives,
            },
        );
    }

    Ok(CalibrationOutcome {
        thresholds,
        scales: options.set_scales.then_some(scales),
        fpr_max: options.fpr_max,
        per_axis,
    })
}

/// Sweep observed scores for the best F1 threshold within the FPR budget.
///
/// Candidates are the observed scores themselves; the sweep runs in
/// ascending order and keeps the lowest threshold among F1 ties. Returns
/// `None` when no candidate satisfies the budget.
fn pick_threshold(points: &[(f64, bool)], fpr_max: f64) -> Option<f64> {
    let mut candidates: Vec<f64> = points.iter().map(|(s, _)| *s).collect();
    candidates.sort_by(f64::total_cmp);
    candidates.dedup();

    let mut best: Option<(f64, f64)> = None; // (f1, threshold)
    for tau in candidates {
        let mut tp = 0usize;
        let mut fp = 0usize;
        let mut fnn = 0usize;
        let mut tn = 0usize;
        for (score, label) in points {
            match (*score > tau, label) {
                (true, true) => tp += 1,
                (true, false) => fp += 1,
                (false, true) => fnn += 1,
                (false, false) => tn += 1,
            }
        }
        let fpr = fp as f64 / (fp + tn).max(1) as f64;
        if fpr > fpr_max {
            continue;
        }
        let precision = tp as f64 / (tp + fp).max(1) as f64;
        let recall = tp as f64 / (tp + fnn).max(1) as f64;
        let f1 = 2.0 * precision * recall / (precision + recall).max(1e-12);
        if best.map_or(true, |(bf, _)| f1 > bf) {
            best = Some((f1, tau));
        }
    }
    best.map(|(_, tau)| tau)
}

/// Rank-sum AUROC and sweep AUPRC over `(score, label)` points.
fn ranking_metrics(points: &[(f64, bool)]) -> (f64, f64) {
    if points.is_empty() {
        return (0.0, 0.0);
    }
    let mut sorted: Vec<&(f64, bool)> = points.iter().collect();
    sorted.sort_by(|a, b| a.0.total_cmp(&b.0));
    let positives = sorted.iter().filter(|(_, l)| *l).count();
    let negatives = sorted.len() - positives;
    if positives == 0 || negatives == 0 {
        return (1.0, 1.0);
    }

    let mut rank_sum = 0.0;
    for (rank, (_, label)) in sorted.iter().enumerate() {
        if *label {
            rank_sum += (rank + 1) as f64;
        }
    }
    let p = positives as f64;
    let n = negatives as f64;
    let auroc = (rank_sum - p * (p + 1.0) / 2.0) / (p * n);

    let mut auprc = 0.0;
    let mut tp = 0usize;
    let mut fp = 0usize;
    let mut last_recall = 0.0;
    for (_, label) in sorted.iter().rev() {
        if *label {
            tp += 1;
        } else {
            fp += 1;
        }
        let precision = tp as f64 / (tp + fp).max(1) as f64;
        let recall = tp as f64 / p;
        auprc += precision * (recall - last_recall).max(0.0);
        last_recall = recall;
    }
    (auroc, auprc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{build_axis_pack, AxisSeed, BuildOptions};
    use crate::encoder::HashEncoder;
    use crate::pack::AxisPole;

    fn pack_and_encoder() -> (AxisPack, HashEncoder) {
        let encoder = HashEncoder::new(64);
        let seeds = vec![AxisSeed {
            name: "aggression".into(),
            positives: vec!["attack".into(), "destroy".into()],
            negatives: vec!["calm".into(), "peace".into()],
            pole: AxisPole::Positive,
        }];
        let pack = build_axis_pack(&encoder, &seeds, &BuildOptions::default()).unwrap();
        (pack, encoder)
    }

    fn dataset() -> Vec<LabeledExample> {
        vec![
            LabeledExample {
                text: "attack".into(),
                label: 1.0,
            },
            LabeledExample {
                text: "destroy".into(),
                label: 1.0,
            },
            LabeledExample {
                text: "calm".into(),
                label: 0.0,
            },
            LabeledExample {
                text: "peace".into(),
                label: 0.0,
            },
        ]
    }

    #[test]
    fn calibration_separates_seed_classes() {
        let (pack, encoder) = pack_and_encoder();
        let mut datasets = BTreeMap::new();
        datasets.insert("aggression".to_string(), dataset());
        let outcome = calibrate(
            &encoder,
            &pack,
            &datasets,
            &CalibrationOptions::default(),
        )
        .unwrap();

        let report = &outcome.per_axis["aggression"];
        // Seed texts are perfectly separable along their own axis.
        assert!((report.auroc - 1.0).abs() < 1e-9);
        assert_eq!(report.positives, 2);
        assert_eq!(report.negatives, 2);

        // The calibrated pack vetoes the violating class and not the clean one.
        let calibrated = pack
            .with_calibration(outcome.thresholds.clone(), None, None)
            .unwrap();
        let hot = encoder.encode(&["attack".to_string()]).unwrap();
        let cold = encoder.encode(&["peace".to_string()]).unwrap();
        let gate = GatePolicy::default();
        let hot_evidence =
            veto_evidence(&project(&hot[0], &calibrated, &gate).unwrap(), &calibrated)[0];
        let cold_evidence =
            veto_evidence(&project(&cold[0], &calibrated, &gate).unwrap(), &calibrated)[0];
        assert!(hot_evidence > calibrated.thresholds[0]);
        assert!(cold_evidence <= calibrated.thresholds[0]);
    }

    #[test]
    fn unknown_axis_in_dataset_is_rejected() {
        let (pack, encoder) = pack_and_encoder();
        let mut datasets = BTreeMap::new();
        datasets.insert("no-such-axis".to_string(), dataset());
        let err = calibrate(
            &encoder,
            &pack,
            &datasets,
            &CalibrationOptions::default(),
        )
        .unwrap_err();
        assert_eq!(err.code(), "configuration_error");
    }

    #[test]
    fn fpr_budget_is_respected_on_training_points() {
        let (pack, encoder) = pack_and_encoder();
        let mut datasets = BTreeMap::new();
        datasets.insert("aggression".to_string(), dataset());
        let outcome = calibrate(
            &encoder,
            &pack,
            &datasets,
            &CalibrationOptions {
                fpr_max: 0.0,
                set_scales: false,
            },
        )
        .unwrap();

        // Re-score the training points: with fpr_max = 0 no negative may
        // exceed the chosen threshold.
        let tau = outcome.thresholds[0];
        let texts: Vec<String> = dataset().iter().map(|e| e.text.clone()).collect();
        let embeddings = encoder.encode(&texts).unwrap();
        let gate = GatePolicy::default();
        for (embedding, example) in embeddings.iter().zip(dataset()) {
            let evidence = veto_evidence(&project(embedding, &pack, &gate).unwrap(), &pack)[0];
            if example.label < 0.5 {
                assert!(evidence <= tau);
            }
        }
    }

    #[test]
    fn scales_derive_from_positive_evidence() {
        let (pack, encoder) = pack_and_encoder();
        let mut datasets = BTreeMap::new();
        datasets.insert("aggression".to_string(), dataset());
        let outcome = calibrate(
            &encoder,
            &pack,
            &datasets,
            &CalibrationOptions {
                fpr_max: 0.05,
                set_scales: true,
            },
        )
        .unwrap();
        let scales = outcome.scales.unwrap();
        assert_eq!(scales.len(), 1);
        assert!(scales[0] > 0.0);
    }

    #[test]
    fn ranking_metrics_on_perfect_separation() {
        let points = vec![(0.9, true), (0.8, true), (0.1, false), (0.2, false)];
        let (auroc, auprc) = ranking_metrics(&points);
        assert!((auroc - 1.0).abs() < 1e-12);
        assert!((auprc - 1.0).abs() < 1e-12);
    }
}
