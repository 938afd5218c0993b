use crate::{
    config::TrainerConfig,
    error::TrainError,
    evaluator::FeatureEvaluator,
    example::Example,
    loss::{LabelBounds, LossKind},
    weights::WeightStore,
};
use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Serializable predictor: everything needed to score new examples.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Model {
    pub num_bits: u32,
    pub loss_function: LossKind,
    pub quadratic: Vec<String>,
    pub bounds: LabelBounds,
    /// Non-zero weights as `(cell, weight)`, in cell order.
    pub weights: Vec<(u64, f32)>,
}

impl Model {
    pub fn capture(store: &WeightStore, config: &TrainerConfig, bounds: &LabelBounds) -> Self {
        let weights = store
            .cells()
            .iter()
            .enumerate()
            .filter(|(_, c)| c.weight != 0.0)
            .map(|(i, c)| (i as u64, c.weight))
            .collect();
        Self {
            num_bits: store.num_bits(),
            loss_function: config.loss_function,
            quadratic: config.quadratic.clone(),
            bounds: *bounds,
            weights,
        }
    }

    /// Rebuilds a weight table holding only the saved weights.
    pub fn restore(&self) -> Result<WeightStore, TrainError> {
        if self.num_bits == 0 || self.num_bits > 32 {
            return Err(TrainError::Config(format!(
                "model num_bits must be within 1..=32 (got {})",
                self.num_bits
            )));
        }
        let mut store = WeightStore::new(self.num_bits)?;
        for &(index, weight) in self.weights.iter() {
            store.cell_mut(index).weight = weight;
        }
        Ok(store)
    }

    pub fn interactions(&self) -> Result<Vec<(u8, u8)>, TrainError> {
        TrainerConfig {
            quadratic: self.quadratic.clone(),
            ..Default::default()
        }
        .interactions()
    }
}

/// Receives predictor snapshots during and after training.
pub trait Checkpoint {
    /// `pass` is set for per-pass checkpoints and `None` for the final one.
    fn save_predictor(&mut self, model: &Model, pass: Option<usize>) -> Result<()>;
}

/// Discards every snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCheckpoint;

impl Checkpoint for NoCheckpoint {
    fn save_predictor(&mut self, _model: &Model, _pass: Option<usize>) -> Result<()> {
        Ok(())
    }
}

/// Scores examples with a saved model.
#[derive(Debug, Clone)]
pub struct Predictor {
    store: WeightStore,
    evaluator: FeatureEvaluator,
    bounds: LabelBounds,
}

impl Predictor {
    pub fn from_model(model: &Model) -> Result<Self, TrainError> {
        let store = model.restore()?;
        let evaluator = FeatureEvaluator::for_store(&store, model.interactions()?);
        Ok(Self {
            store,
            evaluator,
            bounds: model.bounds,
        })
    }

    pub fn predict(&self, ex: &Example) -> f32 {
        self.evaluator.predict(self.store.cells(), ex, &self.bounds)
    }
}
