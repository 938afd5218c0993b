use anyhow::Result;
use rand::{rngs::SmallRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::{f64::consts::PI, io::Write};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct GenerateSettings {
    pub num_examples: usize,
    pub num_features: usize,
    pub logistic: bool,
    pub noise: f64,
}

impl Default for GenerateSettings {
    fn default() -> Self {
        Self {
            num_examples: 1000,
            num_features: 10,
            logistic: false,
            noise: 0.1,
        }
    }
}

/// What the generator drew: the weights the data was made from.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct GroundTruth {
    pub weights: Vec<f64>,
    pub bias: f64,
}

fn sample_normal(rng: &mut SmallRng) -> f64 {
    let u1: f64 = rng.gen::<f64>().max(f64::MIN_POSITIVE);
    let u2 = rng.gen::<f64>();
    (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
}

/// Writes a reproducible data set in the text format: features `f0..fN` in
/// namespace `x`, labels from a random linear model plus Gaussian noise
/// (signs of it, for logistic data).
pub fn generate<W: Write>(
    settings: &GenerateSettings,
    seed: &str,
    out: &mut W,
) -> Result<GroundTruth> {
    let mut rng = SmallRng::from_seed(ol_utils::u8s_from_str(seed));
    let truth = GroundTruth {
        weights: (0..settings.num_features)
            .map(|_| rng.gen_range(-1.0..1.0))
            .collect(),
        bias: rng.gen_range(-0.5..0.5),
    };

    for _ in 0..settings.num_examples {
        let x: Vec<f64> = (0..settings.num_features)
            .map(|_| rng.gen_range(-1.0..1.0))
            .collect();
        let score = truth.bias
            + truth.weights.iter().zip(x.iter()).map(|(w, x)| w * x).sum::<f64>()
            + settings.noise * sample_normal(&mut rng);
        if settings.logistic {
            write!(out, "{} |x", if score > 0.0 { 1 } else { -1 })?;
        } else {
            write!(out, "{:.6} |x", score)?;
        }
        for (i, v) in x.iter().enumerate() {
            write!(out, " f{}:{:.6}", i, v)?;
        }
        writeln!(out)?;
    }
    Ok(truth)
}
