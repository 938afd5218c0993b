use crate::{
    example::Example,
    loss::{LabelBounds, Loss},
    weights::{Cell, WeightStore},
};

/// Multiplier mixing the first index of a quadratic pair.
pub const QUADRATIC_CONSTANT: u64 = 27942141;

/// Cell index of the pairwise feature `(a, b)`.
#[inline]
pub fn quadratic_index(a: u64, b: u64, mask: u64) -> u64 {
    QUADRATIC_CONSTANT.wrapping_mul(a).wrapping_add(b) & mask
}

/// Walks the linear and pairwise features of examples against a weight table.
#[derive(Debug, Clone)]
pub struct FeatureEvaluator {
    mask: u64,
    interactions: Vec<(u8, u8)>,
}

impl FeatureEvaluator {
    pub fn new(mask: u64, interactions: Vec<(u8, u8)>) -> Self {
        Self { mask, interactions }
    }

    pub fn for_store(store: &WeightStore, interactions: Vec<(u8, u8)>) -> Self {
        Self::new(store.mask(), interactions)
    }

    pub fn interactions(&self) -> &[(u8, u8)] {
        &self.interactions
    }

    /// Calls `f(slot, value)` for every linear and quadratic feature.
    pub fn foreach_feature<F>(&self, ex: &Example, mut f: F)
    where
        F: FnMut(usize, f32),
    {
        for ns in ex.namespaces.iter() {
            for feat in ns.features.iter() {
                f((feat.index & self.mask) as usize, feat.value);
            }
        }
        for &(a, b) in self.interactions.iter() {
            let (Some(first), Some(second)) = (ex.namespace(a), ex.namespace(b)) else {
                continue;
            };
            for f1 in first.features.iter() {
                let halfhash = QUADRATIC_CONSTANT.wrapping_mul(f1.index);
                for f2 in second.features.iter() {
                    let slot = (halfhash.wrapping_add(f2.index) & self.mask) as usize;
                    f(slot, f1.value * f2.value);
                }
            }
        }
    }

    /// Raw `initial + <x, weight>`.
    pub fn inline_predict(&self, cells: &[Cell], ex: &Example) -> f32 {
        let mut p = ex.initial;
        self.foreach_feature(ex, |slot, x| p += cells[slot].weight * x);
        p
    }

    pub fn predict(&self, cells: &[Cell], ex: &Example, bounds: &LabelBounds) -> f32 {
        bounds.finalize_prediction(self.inline_predict(cells, ex))
    }

    /// Predicts, then adds `loss'(prediction) * importance * x` into `grad`.
    /// Returns the clamped prediction. Test examples only predict.
    pub fn predict_and_gradient(
        &self,
        cells: &mut [Cell],
        ex: &Example,
        loss: &dyn Loss,
        bounds: &mut LabelBounds,
    ) -> f32 {
        let prediction = self.predict(cells, ex, bounds);
        let Some(label) = ex.label else {
            return prediction;
        };
        bounds.set_minmax(label);
        let loss_grad = loss.first_derivative(bounds, prediction, label) * ex.weight;
        self.foreach_feature(ex, |slot, x| cells[slot].grad += loss_grad * x);
        prediction
    }

    /// Adds `loss''(prediction) * importance * x^2` into `cond`.
    pub fn update_preconditioner(
        &self,
        cells: &mut [Cell],
        ex: &Example,
        loss: &dyn Loss,
        bounds: &LabelBounds,
    ) {
        let Some(label) = ex.label else {
            return;
        };
        let curvature = loss.second_derivative(bounds, ex.final_prediction, label) * ex.weight;
        self.foreach_feature(ex, |slot, x| cells[slot].cond += curvature * x * x);
    }

    /// `<x, dir>`: how fast this example's prediction moves along the
    /// search direction.
    pub fn dot_with_direction(&self, cells: &[Cell], ex: &Example) -> f32 {
        let mut d = 0.0;
        self.foreach_feature(ex, |slot, x| d += cells[slot].dir * x);
        d
    }
}
