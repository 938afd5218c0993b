use crate::{error::CurvatureError, solver::GradientDots};

/// Result of an accepted line-search evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WolfeStep {
    /// Cross point of the secant model, within `[0, step]`.
    pub new_step: f64,
    pub wolfe1: f64,
    pub wolfe2: f64,
}

/// Sufficient-decrease and curvature ratios of the last step:
/// `wolfe1 = (loss - prev_loss) / (step * g0_d)`, `wolfe2 = g1_d / g0_d`.
pub fn wolfe_ratios(loss: f64, prev_loss: f64, step: f64, dots: &GradientDots) -> (f64, f64) {
    let wolfe1 = (loss - prev_loss) / (step * dots.g0_d);
    let wolfe2 = dots.g1_d / dots.g0_d;
    (wolfe1, wolfe2)
}

/// Fits the loss along the last step and returns where its slope crosses
/// zero. Pure: weights are not touched.
pub fn wolfe_eval(
    loss: f64,
    prev_loss: f64,
    step: f64,
    dots: &GradientDots,
) -> Result<WolfeStep, CurvatureError> {
    let (wolfe1, wolfe2) = wolfe_ratios(loss, prev_loss, step, dots);
    let denom = dots.g0_d - dots.g1_d;
    let reject = |candidate| CurvatureError::LineSearch { step, candidate };
    if step == 0.0 || denom == 0.0 {
        return Err(reject(f64::NAN));
    }
    let new_step = (loss - prev_loss - dots.g1_d * step) / denom;
    if new_step.is_nan() || new_step < 0.0 || new_step > step {
        return Err(reject(new_step));
    }
    Ok(WolfeStep {
        new_step,
        wolfe1,
        wolfe2,
    })
}
