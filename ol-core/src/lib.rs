pub mod allreduce;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod evaluator;
pub mod example;
pub mod line_search;
pub mod loss;
pub mod memory;
pub mod model;
pub mod regularizer;
pub mod solver;
pub mod source;
pub mod trainer;
pub mod weights;

pub use allreduce::{AllReduce, Solo, TreeAllReduce};
pub use config::{ClusterConfig, TrainerConfig};
pub use error::{CurvatureError, TrainError};
pub use example::{Example, Feature, Namespace};
pub use model::{Checkpoint, Model, NoCheckpoint, Predictor};
pub use source::{ChannelSource, ExampleSource, Fetch, ReplaySource};
pub use trainer::{Phase, TrainSummary, Trainer};
pub use weights::{Cell, Field, WeightStore};
