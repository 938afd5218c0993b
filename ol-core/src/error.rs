use thiserror::Error;

/// Printed alongside every curvature event.
pub const CURVATURE_HINT: &str = "To increase curvature you can increase regularization or rescale features. \
It is also possible that you have reached numerical accuracy and further decrease in the objective cannot be reliably detected.";

/// Zero or negative curvature. Returned by the line search and the L-BFGS
/// update; the trainer decides how to recover.
#[derive(Error, Debug, Clone, Copy, PartialEq)]
pub enum CurvatureError {
    #[error("zero or negative curvature in history pair (y.s = {y_s}, y.Hy = {y_hy})")]
    History { y_s: f64, y_hy: f64 },

    #[error("line search found no cross point in [0, {step}] (candidate step {candidate})")]
    LineSearch { step: f64, candidate: f64 },
}

#[derive(Error, Debug)]
pub enum TrainError {
    #[error("curvature is 0 along a direction with derivative {derivative}, something is wrong. {}", CURVATURE_HINT)]
    DegenerateCurvature { derivative: f64 },

    #[error("failed to allocate {what} for 2^{num_bits} weights: try decreasing num_bits")]
    Allocation { what: &'static str, num_bits: u32 },

    #[error("invalid configuration: {0}")]
    Config(String),
}
