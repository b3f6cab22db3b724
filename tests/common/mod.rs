//! Shared fixtures: a hand-built lexicon encoder with exact, orthogonal
//! word vectors so scenario outcomes are analytic rather than statistical.

use nalgebra::DVector;

use resonance_gate::builder::{build_axis_pack, AxisSeed, BuildOptions};
use resonance_gate::encoder::Encoder;
use resonance_gate::error::CoreError;
use resonance_gate::pack::{AxisPack, AxisPole};

/// Embedding dimension of the fixture lexicon.
pub const DIM: usize = 6;

/// Deterministic word-table encoder.
///
/// Benevolence vocabulary lives in dims 0/2, candor vocabulary in dims
/// 1/3; every other word gets a small constant component on dim 5, which
/// is orthogonal to both axis directions.
pub struct LexiconEncoder;

impl LexiconEncoder {
    fn word_vector(word: &str) -> DVector<f64> {
        let coords: [f64; DIM] = match word {
            "help" => [1.0, 0.0, 0.0, 0.0, 0.0, 0.0],
            "support" => [0.9, 0.0, 0.1, 0.0, 0.0, 0.0],
            "harm" => [-1.0, 0.0, 0.0, 0.0, 0.0, 0.0],
            "attack" => [-0.9, 0.0, -0.1, 0.0, 0.0, 0.0],
            "truth" => [0.0, 1.0, 0.0, 0.0, 0.0, 0.0],
            "honesty" => [0.0, 0.9, 0.0, 0.1, 0.0, 0.0],
            "deceive" => [0.0, -1.0, 0.0, 0.0, 0.0, 0.0],
            "mislead" => [0.0, -0.9, 0.0, -0.1, 0.0, 0.0],
            _ => [0.0, 0.0, 0.0, 0.0, 0.0, 0.05],
        };
        DVector::from_row_slice(&coords)
    }
}

impl Encoder for LexiconEncoder {
    fn dim(&self) -> usize {
        DIM
    }

    fn encode(&self, texts: &[String]) -> Result<Vec<DVector<f64>>, CoreError> {
        Ok(texts
            .iter()
            .map(|text| {
                let words: Vec<&str> = text.split_whitespace().collect();
                if words.is_empty() {
                    return DVector::zeros(DIM);
                }
                let mut pooled = DVector::zeros(DIM);
                for word in &words {
                    pooled += Self::word_vector(word);
                }
                pooled / words.len() as f64
            })
            .collect())
    }
}

/// Benevolence/candor seeds matching the fixture lexicon. Both axes carry
/// veto evidence on their negative pole.
pub fn scenario_seeds() -> Vec<AxisSeed> {
    vec![
        AxisSeed {
            name: "benevolence".into(),
            positives: vec!["help".into(), "support".into()],
            negatives: vec!["harm".into(), "attack".into()],
            pole: AxisPole::Negative,
        },
        AxisSeed {
            name: "candor".into(),
            positives: vec!["truth".into(), "honesty".into()],
            negatives: vec!["deceive".into(), "mislead".into()],
            pole: AxisPole::Negative,
        },
    ]
}

/// The 2-axis scenario pack with veto thresholds at 0.5.
pub fn scenario_pack() -> AxisPack {
    let options = BuildOptions {
        id: Some("scenario-pack".into()),
        thresholds: Some(vec![0.5, 0.5]),
        ..Default::default()
    };
    build_axis_pack(&LexiconEncoder, &scenario_seeds(), &options).expect("fixture pack builds")
}
