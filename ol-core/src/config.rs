use crate::{error::TrainError, loss::LossKind};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ClusterConfig {
    pub rank: usize,
    pub nodes: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct TrainerConfig {
    /// L-BFGS history length. 0 selects conjugate gradient.
    pub history: usize,
    pub num_bits: u32,
    pub l2_lambda: f32,
    pub rel_threshold: f64,
    pub hessian_on: bool,
    pub first_curvature_pass: bool,
    pub numpasses: usize,
    pub loss_function: LossKind,
    pub quadratic: Vec<String>,
    pub wolfe1_bound: f64,
    pub max_curvature_violations: usize,
    pub regularizer_input: Option<PathBuf>,
    pub regularizer_output: Option<PathBuf>,
    pub save_per_pass: bool,
    pub quiet: bool,
    pub cluster: Option<ClusterConfig>,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            history: 15,
            num_bits: 18,
            l2_lambda: 0.0,
            rel_threshold: 0.001,
            hessian_on: false,
            first_curvature_pass: true,
            numpasses: 10,
            loss_function: LossKind::Squared,
            quadratic: Vec::new(),
            wolfe1_bound: 0.01,
            max_curvature_violations: 3,
            regularizer_input: None,
            regularizer_output: None,
            save_per_pass: false,
            quiet: false,
            cluster: None,
        }
    }
}

impl TrainerConfig {
    pub fn validate(&self) -> Result<(), TrainError> {
        if self.numpasses < 2 {
            return Err(TrainError::Config(format!(
                "you must make at least 2 passes to use BFGS (numpasses = {})",
                self.numpasses
            )));
        }
        if self.num_bits == 0 || self.num_bits > 32 {
            return Err(TrainError::Config(format!(
                "num_bits must be within 1..=32 (got {})",
                self.num_bits
            )));
        }
        if !(self.l2_lambda >= 0.0) {
            return Err(TrainError::Config(format!(
                "l2_lambda must be non-negative (got {})",
                self.l2_lambda
            )));
        }
        self.interactions()?;
        if let Some(cluster) = &self.cluster {
            if cluster.rank >= cluster.nodes.len() {
                return Err(TrainError::Config(format!(
                    "cluster rank {} is outside the node list of length {}",
                    cluster.rank,
                    cluster.nodes.len()
                )));
            }
        }
        Ok(())
    }

    /// Passes over the data a source must supply. Writing regularizers
    /// takes one more pass after the last step.
    pub fn passes_needed(&self) -> usize {
        self.numpasses + usize::from(self.regularizer_output.is_some())
    }

    /// Conjugate gradient always needs the curvature pass.
    pub fn curvature_pass_enabled(&self) -> bool {
        self.hessian_on || self.history == 0
    }

    /// Parses the `quadratic` entries into namespace id pairs.
    pub fn interactions(&self) -> Result<Vec<(u8, u8)>, TrainError> {
        self.quadratic
            .iter()
            .map(|pair| match pair.as_bytes() {
                [a, b] => Ok((*a, *b)),
                _ => Err(TrainError::Config(format!(
                    "quadratic pair '{}' must name exactly two namespaces",
                    pair
                ))),
            })
            .collect()
    }
}
