use serde::{Deserialize, Serialize};
use tracing::warn;

/// Range predictions are clamped to. Squared loss widens it as labels are
/// observed; logistic loss keeps a fixed margin range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LabelBounds {
    pub min_label: f32,
    pub max_label: f32,
    pub adaptive: bool,
}

impl LabelBounds {
    pub fn set_minmax(&mut self, label: f32) {
        if !self.adaptive {
            return;
        }
        if label < self.min_label {
            self.min_label = label;
        }
        if label > self.max_label {
            self.max_label = label;
        }
    }

    /// Clamps a raw prediction into range. NaN becomes 0.
    pub fn finalize_prediction(&self, raw: f32) -> f32 {
        if raw.is_nan() {
            warn!("NAN prediction, forcing 0");
            return 0.0;
        }
        raw.clamp(self.min_label, self.max_label)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LossKind {
    Squared,
    Logistic,
}

impl LossKind {
    pub fn build(self) -> Box<dyn Loss> {
        match self {
            LossKind::Squared => Box::new(SquaredLoss),
            LossKind::Logistic => Box::new(LogisticLoss),
        }
    }

    pub fn label_bounds(self) -> LabelBounds {
        match self {
            LossKind::Squared => LabelBounds {
                min_label: 0.0,
                max_label: 0.0,
                adaptive: true,
            },
            LossKind::Logistic => LabelBounds {
                min_label: -50.0,
                max_label: 50.0,
                adaptive: false,
            },
        }
    }
}

pub trait Loss: Send + Sync {
    fn name(&self) -> &'static str;
    fn get_loss(&self, bounds: &LabelBounds, prediction: f32, label: f32) -> f32;
    /// Closed-form importance-aware update for a step of size `update_scale`.
    fn get_update(&self, prediction: f32, label: f32, update_scale: f32, pred_per_update: f32)
        -> f32;
    fn first_derivative(&self, bounds: &LabelBounds, prediction: f32, label: f32) -> f32;
    fn second_derivative(&self, bounds: &LabelBounds, prediction: f32, label: f32) -> f32;
}

pub struct SquaredLoss;

impl Loss for SquaredLoss {
    fn name(&self) -> &'static str {
        "squared"
    }

    fn get_loss(&self, bounds: &LabelBounds, prediction: f32, label: f32) -> f32 {
        let (lo, hi) = (bounds.min_label, bounds.max_label);
        if prediction <= hi && prediction >= lo {
            (prediction - label) * (prediction - label)
        } else if prediction < lo {
            if label == lo {
                0.0
            } else {
                (label - lo) * (label - lo) + 2.0 * (label - lo) * (lo - prediction)
            }
        } else if label == hi {
            0.0
        } else {
            (hi - label) * (hi - label) + 2.0 * (hi - label) * (prediction - hi)
        }
    }

    fn get_update(
        &self,
        prediction: f32,
        label: f32,
        update_scale: f32,
        pred_per_update: f32,
    ) -> f32 {
        if update_scale * pred_per_update < 1e-6 {
            return 2.0 * (label - prediction) * update_scale;
        }
        (label - prediction) * (1.0 - (-2.0 * update_scale * pred_per_update).exp())
            / pred_per_update
    }

    fn first_derivative(&self, bounds: &LabelBounds, prediction: f32, label: f32) -> f32 {
        let p = prediction.clamp(bounds.min_label, bounds.max_label);
        2.0 * (p - label)
    }

    fn second_derivative(&self, bounds: &LabelBounds, prediction: f32, _label: f32) -> f32 {
        if prediction <= bounds.max_label && prediction >= bounds.min_label {
            2.0
        } else {
            0.0
        }
    }
}

/// Logistic loss on labels in {-1, +1}.
pub struct LogisticLoss;

/// Approximates `W(exp(x)) - x` for the Lambert W function.
fn wexpmx(x: f32) -> f32 {
    let x = x as f64;
    let w = if x >= 1.0 {
        0.86 * x + 0.01
    } else {
        (0.8 * x - 0.65).exp()
    };
    let r = if x >= 1.0 {
        x - w.ln() - w
    } else {
        0.2 * x + 0.65 - w
    };
    let t = 1.0 + w;
    let u = 2.0 * t * (t + 2.0 * r / 3.0);
    (w * (1.0 + r / t * (u - r) / (u - 2.0 * r)) - x) as f32
}

impl Loss for LogisticLoss {
    fn name(&self) -> &'static str {
        "logistic"
    }

    fn get_loss(&self, _bounds: &LabelBounds, prediction: f32, label: f32) -> f32 {
        (1.0 + (-label * prediction).exp()).ln()
    }

    fn get_update(
        &self,
        prediction: f32,
        label: f32,
        update_scale: f32,
        pred_per_update: f32,
    ) -> f32 {
        let d = (label * prediction).exp();
        if update_scale * pred_per_update < 1e-6 {
            return label * update_scale / (1.0 + d);
        }
        let x = update_scale * pred_per_update + label * prediction + d;
        let w = wexpmx(x);
        -(label * w + prediction) / pred_per_update
    }

    fn first_derivative(&self, _bounds: &LabelBounds, prediction: f32, label: f32) -> f32 {
        -label / (1.0 + (label * prediction).exp())
    }

    fn second_derivative(&self, _bounds: &LabelBounds, prediction: f32, label: f32) -> f32 {
        let p = 1.0 / (1.0 + (label * prediction).exp());
        p * (1.0 - p)
    }
}
