use crate::{
    allreduce::{AllReduce, Solo},
    config::TrainerConfig,
    diagnostics::{Diagnostics, PassLine},
    error::{CurvatureError, TrainError, CURVATURE_HINT},
    evaluator::FeatureEvaluator,
    example::Example,
    line_search::{wolfe_eval, wolfe_ratios},
    loss::{LabelBounds, Loss},
    model::{Checkpoint, Model, NoCheckpoint},
    regularizer::Regularizers,
    solver::QuasiNewton,
    source::{ExampleSource, Fetch},
    weights::{Field, WeightStore},
};
use anyhow::Result;
use std::thread;
use tracing::{debug, info, warn};

/// What the next (or current) pass over the data computes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// First pass: gradient plus the diagonal preconditioner.
    ReadingPass0,
    GradientPass,
    /// Second derivative along the current direction.
    CurvaturePass,
    /// Transient, while a finished gradient pass is judged.
    LineSearchEvaluation,
    /// One extra pass after the last step that re-measures the diagonal
    /// curvature at the final weights for the regularizer output.
    PreconditionerPass,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PassStatus {
    Continue,
    Converged,
    Curvature,
}

#[derive(Debug, Clone)]
pub struct TrainSummary {
    /// Passes processed.
    pub passes: usize,
    /// Average loss at the last accepted point.
    pub average_loss: f64,
    pub curvature_violations: usize,
    /// Stopped before `numpasses`.
    pub stopped_early: bool,
    pub model: Model,
}

/// Batch L-BFGS / conjugate gradient trainer driven one example at a time.
/// Each pass over the data ends with a call to `end_pass`, which performs
/// the optimizer step for that pass.
pub struct Trainer {
    config: TrainerConfig,
    store: WeightStore,
    solver: QuasiNewton,
    evaluator: FeatureEvaluator,
    loss: Box<dyn Loss>,
    bounds: LabelBounds,
    regularizers: Option<Regularizers>,
    reducer: Box<dyn AllReduce>,
    checkpoint: Box<dyn Checkpoint>,
    diagnostics: Diagnostics,
    pending_line: Option<PassLine>,

    phase: Phase,
    current_pass: usize,
    final_pass: usize,
    example_number: usize,
    predictions: Vec<f32>,

    loss_sum: f64,
    previous_loss_sum: f64,
    importance_weight_sum: f64,
    curvature: f64,
    step_size: f64,
    curvature_violations: usize,
    preconditioner_measured: bool,
}

impl Trainer {
    pub fn new(config: TrainerConfig) -> Result<Self> {
        config.validate()?;
        let store = WeightStore::new(config.num_bits)?;
        let solver = QuasiNewton::new(config.history, config.num_bits)?;
        let evaluator = FeatureEvaluator::for_store(&store, config.interactions()?);
        let regularizers = match &config.regularizer_input {
            Some(path) => Some(Regularizers::load(path, config.num_bits)?),
            None => None,
        };

        if config.curvature_pass_enabled() {
            info!("enabling BFGS based optimization with curvature calculation");
        } else {
            info!("enabling BFGS based optimization **without** curvature calculation");
        }
        if config.history == 0 {
            info!("m = 0: using conjugate gradient");
        } else {
            info!("m = {}", config.history);
        }
        debug!(
            "allocated {} weight cells and {} history floats per cell",
            store.len(),
            solver.history().mem_stride()
        );

        Ok(Self {
            loss: config.loss_function.build(),
            bounds: config.loss_function.label_bounds(),
            diagnostics: Diagnostics::new(config.quiet),
            final_pass: config.numpasses,
            store,
            solver,
            evaluator,
            regularizers,
            reducer: Box::new(Solo),
            checkpoint: Box::new(NoCheckpoint),
            pending_line: None,
            phase: Phase::ReadingPass0,
            current_pass: 0,
            example_number: 0,
            predictions: Vec::new(),
            loss_sum: 0.0,
            previous_loss_sum: 0.0,
            importance_weight_sum: 0.0,
            curvature: 0.0,
            step_size: 0.0,
            curvature_violations: 0,
            preconditioner_measured: false,
            config,
        })
    }

    pub fn with_checkpoint(mut self, checkpoint: Box<dyn Checkpoint>) -> Self {
        self.checkpoint = checkpoint;
        self
    }

    pub fn with_reducer(mut self, reducer: Box<dyn AllReduce>) -> Self {
        self.reducer = reducer;
        self
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub fn store(&self) -> &WeightStore {
        &self.store
    }

    pub fn solver(&self) -> &QuasiNewton {
        &self.solver
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn current_pass(&self) -> usize {
        self.current_pass
    }

    pub fn final_pass(&self) -> usize {
        self.final_pass
    }

    pub fn step_size(&self) -> f64 {
        self.step_size
    }

    pub fn curvature_violations(&self) -> usize {
        self.curvature_violations
    }

    pub fn bounds(&self) -> &LabelBounds {
        &self.bounds
    }

    pub fn model(&self) -> Model {
        Model::capture(&self.store, &self.config, &self.bounds)
    }

    /// Feeds one example of the current pass. Sets its prediction and loss.
    pub fn learn(&mut self, ex: &mut Example) {
        if self.phase == Phase::Done {
            return;
        }
        let cells = self.store.cells_mut();
        let loss = self.loss.as_ref();
        let Some(label) = ex.label else {
            ex.final_prediction = self.evaluator.predict(cells, ex, &self.bounds);
            return;
        };
        if self.phase == Phase::ReadingPass0 {
            self.importance_weight_sum += ex.weight as f64;
        }

        match self.phase {
            Phase::ReadingPass0 | Phase::GradientPass => {
                let p = self
                    .evaluator
                    .predict_and_gradient(cells, ex, loss, &mut self.bounds);
                ex.final_prediction = p;
                ex.loss = loss.get_loss(&self.bounds, p, label) * ex.weight;
                self.loss_sum += ex.loss as f64;
                self.predictions.push(p);
            }
            Phase::CurvaturePass => {
                let d_dot_x = self.evaluator.dot_with_direction(cells, ex);
                // Same traversal order as the gradient pass that filled this.
                debug_assert!(
                    self.example_number < self.predictions.len(),
                    "curvature pass saw more examples than the gradient pass before it"
                );
                let p = self
                    .predictions
                    .get(self.example_number)
                    .copied()
                    .unwrap_or(0.0);
                ex.final_prediction = p;
                ex.loss = loss.get_loss(&self.bounds, p, label) * ex.weight;
                let sd = loss.second_derivative(&self.bounds, p, label);
                self.curvature += (d_dot_x * d_dot_x * sd * ex.weight) as f64;
            }
            Phase::PreconditionerPass => {
                let p = self.evaluator.predict(cells, ex, &self.bounds);
                ex.final_prediction = p;
                ex.loss = loss.get_loss(&self.bounds, p, label) * ex.weight;
            }
            Phase::LineSearchEvaluation | Phase::Done => {}
        }

        if matches!(self.phase, Phase::ReadingPass0 | Phase::PreconditionerPass) {
            self.evaluator
                .update_preconditioner(cells, ex, loss, &self.bounds);
        }
        self.example_number += 1;
    }

    /// Drains `source`, calling `end_pass` whenever the pass number of the
    /// incoming examples moves on.
    pub fn run(&mut self, source: &mut dyn ExampleSource) -> Result<TrainSummary> {
        self.diagnostics.header();
        while self.phase != Phase::Done {
            match source.get_example() {
                Fetch::Ready(mut ex) => {
                    while ex.pass > self.current_pass && self.phase != Phase::Done {
                        self.end_pass()?;
                    }
                    if ex.pass == self.current_pass {
                        self.learn(&mut ex);
                    }
                    source.finish_example(ex);
                }
                Fetch::Pending => thread::yield_now(),
                Fetch::Exhausted => {
                    if self.current_pass != 0 {
                        self.end_pass()?;
                    }
                    break;
                }
            }
        }
        self.finish()
    }

    /// Closes the current pass and takes the optimizer step it calls for.
    pub fn end_pass(&mut self) -> Result<()> {
        if self.phase == Phase::PreconditionerPass {
            return self.preconditioner_pass_end();
        }
        if self.current_pass >= self.final_pass {
            self.current_pass += 1;
            return Ok(());
        }
        let status = self.process_pass()?;
        if status != PassStatus::Continue && self.final_pass > self.current_pass {
            self.final_pass = self.current_pass;
        } else if self.final_pass == self.current_pass {
            info!("Maximum number of passes reached");
        }
        if self.final_pass == self.current_pass {
            if self.config.regularizer_output.is_some() {
                self.store.zero_preconditioner();
                self.predictions.clear();
                self.phase = Phase::PreconditionerPass;
            } else {
                self.phase = Phase::Done;
            }
        }
        Ok(())
    }

    fn preconditioner_pass_end(&mut self) -> Result<()> {
        self.reducer
            .accumulate(&mut self.store, Field::Preconditioner)?;
        let seen = self
            .reducer
            .accumulate_scalar(self.example_number as f64)?;
        self.preconditioner_measured = seen > 0.0;
        debug!("preconditioner pass over {} examples", seen);
        self.example_number = 0;
        self.current_pass += 1;
        self.phase = Phase::Done;
        Ok(())
    }

    /// Writes the final predictor (and regularizers, if asked to).
    pub fn finish(&mut self) -> Result<TrainSummary> {
        self.phase = Phase::Done;
        if let Some(path) = &self.config.regularizer_output {
            if self.preconditioner_measured {
                let regs = Regularizers::from_preconditioner(
                    &self.store,
                    self.config.l2_lambda,
                    self.regularizers.as_ref(),
                )?;
                regs.save(path)?;
                info!("wrote regularizers to {}", path.display());
            } else {
                warn!(
                    "no data for the preconditioner pass, not writing regularizers to {}",
                    path.display()
                );
            }
        }
        let model = self.model();
        self.checkpoint.save_predictor(&model, None)?;
        Ok(TrainSummary {
            passes: self.current_pass,
            average_loss: self.previous_loss_sum / self.importance_weight_sum,
            curvature_violations: self.curvature_violations,
            stopped_early: self.final_pass < self.config.numpasses,
            model,
        })
    }

    fn process_pass(&mut self) -> Result<PassStatus> {
        let mut line = self
            .pending_line
            .take()
            .unwrap_or_else(|| PassLine::new(self.current_pass + 1));

        let status = match self.phase {
            Phase::ReadingPass0 => self.first_pass_end(&mut line)?,
            Phase::GradientPass => self.gradient_pass_end(&mut line)?,
            Phase::CurvaturePass => self.curvature_pass_end(&mut line)?,
            Phase::LineSearchEvaluation | Phase::PreconditionerPass | Phase::Done => {
                PassStatus::Continue
            }
        };

        if self.phase == Phase::CurvaturePass {
            self.pending_line = Some(line);
        } else {
            self.diagnostics.emit(&line);
        }
        self.example_number = 0;
        self.current_pass += 1;
        Ok(status)
    }

    fn first_pass_end(&mut self, line: &mut PassLine) -> Result<PassStatus> {
        self.reducer
            .accumulate(&mut self.store, Field::Preconditioner)?;
        self.importance_weight_sum = self
            .reducer
            .accumulate_scalar(self.importance_weight_sum)?;
        self.store
            .finalize_preconditioner(self.config.l2_lambda, self.regularizers.as_ref());

        self.loss_sum = self.reducer.accumulate_scalar(self.loss_sum)?;
        self.reducer.accumulate(&mut self.store, Field::Gradient)?;
        self.loss_sum += self
            .store
            .add_regularization(self.config.l2_lambda, self.regularizers.as_ref());

        let iw = self.importance_weight_sum;
        line.avg_loss = Some(self.loss_sum / iw);
        self.previous_loss_sum = self.loss_sum;
        self.loss_sum = 0.0;
        self.curvature = 0.0;

        let start = self.solver.iter_start(&mut self.store);
        line.der_mag = Some(start.g1_g1 / (iw * iw));
        line.dm_cond = Some(start.g1_hg1 / (iw * iw));

        if self.config.first_curvature_pass {
            self.phase = Phase::CurvaturePass;
        } else {
            self.step_size = 0.5;
            line.dir_mag = Some(self.store.direction_magnitude());
            line.step = Some(self.step_size);
            self.predictions.clear();
            self.update_weight(self.step_size)?;
            self.phase = Phase::GradientPass;
        }
        Ok(PassStatus::Continue)
    }

    fn gradient_pass_end(&mut self, line: &mut PassLine) -> Result<PassStatus> {
        self.phase = Phase::LineSearchEvaluation;
        self.loss_sum = self.reducer.accumulate_scalar(self.loss_sum)?;
        self.reducer.accumulate(&mut self.store, Field::Gradient)?;
        self.loss_sum += self
            .store
            .add_regularization(self.config.l2_lambda, self.regularizers.as_ref());

        let iw = self.importance_weight_sum;
        let dots = self.solver.gradient_dots(&self.store);
        let (wolfe1, wolfe2) =
            wolfe_ratios(self.loss_sum, self.previous_loss_sum, self.step_size, &dots);
        line.avg_loss = Some(self.loss_sum / iw);
        line.der_mag = Some(dots.g1_g1 / (iw * iw));
        line.dm_cond = Some(dots.g1_hg1 / (iw * iw));
        line.wolfe1 = Some(wolfe1);
        line.wolfe2 = Some(wolfe2);

        if wolfe1.is_nan() {
            info!("Derivative 0 detected");
            self.step_size = 0.0;
            self.phase = Phase::GradientPass;
            return Ok(PassStatus::Converged);
        }

        let evaluation = wolfe_eval(self.loss_sum, self.previous_loss_sum, self.step_size, &dots);
        if evaluation.is_err()
            || self.loss_sum > self.previous_loss_sum
            || wolfe1 < self.config.wolfe1_bound
        {
            return self.backstep(evaluation.map(|w| w.new_step), line);
        }

        let mut status = PassStatus::Continue;
        let rel_decrease = (self.previous_loss_sum - self.loss_sum) / self.previous_loss_sum;
        if !rel_decrease.is_nan() && rel_decrease.abs() < self.config.rel_threshold {
            info!(
                "Termination condition reached in pass {}: decrease in loss less than {:.3}%",
                self.current_pass + 1,
                self.config.rel_threshold * 100.0
            );
            status = PassStatus::Converged;
        }
        self.previous_loss_sum = self.loss_sum;
        self.loss_sum = 0.0;
        self.curvature = 0.0;
        self.step_size = 1.0;

        match self.solver.iter_middle(&mut self.store) {
            Ok(report) => line.mix = report.beta.map(f64::from),
            Err(e) => {
                warn!("In iter_middle: {}. {}", e, CURVATURE_HINT);
                self.step_size = 0.0;
                line.step = Some(self.step_size);
                self.predictions.clear();
                self.phase = Phase::GradientPass;
                return Ok(PassStatus::Curvature);
            }
        }

        if self.config.curvature_pass_enabled() {
            self.phase = Phase::CurvaturePass;
        } else {
            line.dir_mag = Some(self.store.direction_magnitude());
            line.step = Some(self.step_size);
            self.predictions.clear();
            self.update_weight(self.step_size)?;
            self.phase = Phase::GradientPass;
        }
        Ok(status)
    }

    /// Undoes part of the last step. The weights move by the difference
    /// between the corrected step and the one taken.
    fn backstep(
        &mut self,
        evaluation: Result<f64, CurvatureError>,
        line: &mut PassLine,
    ) -> Result<PassStatus> {
        let mut status = PassStatus::Continue;
        let new_step = match evaluation {
            Ok(new_step) => new_step,
            Err(e) => {
                self.curvature_violations += 1;
                warn!("{}. {}", e, CURVATURE_HINT);
                if self.curvature_violations >= self.config.max_curvature_violations {
                    warn!(
                        "{} curvature violations, returning to the last accepted point",
                        self.curvature_violations
                    );
                    status = PassStatus::Curvature;
                    0.0
                } else {
                    0.5 * self.step_size
                }
            }
        };

        line.revise = Some(if self.step_size == 0.0 {
            0.0
        } else {
            new_step / self.step_size
        });
        line.step = Some(new_step);
        self.predictions.clear();
        self.update_weight(new_step - self.step_size)?;
        self.step_size = new_step;
        self.store.zero_derivative();
        self.loss_sum = 0.0;
        self.phase = Phase::GradientPass;
        Ok(status)
    }

    fn curvature_pass_end(&mut self, line: &mut PassLine) -> Result<PassStatus> {
        self.curvature = self.reducer.accumulate_scalar(self.curvature)?;
        self.curvature += self.store.regularizer_direction_magnitude(
            self.config.l2_lambda as f64,
            self.regularizers.as_ref(),
        );
        let dd = self.solver.derivative_in_direction(&self.store);
        if self.curvature == 0.0 && dd != 0.0 {
            return Err(TrainError::DegenerateCurvature { derivative: dd }.into());
        }

        let status = if dd == 0.0 {
            info!("Derivative 0 detected");
            self.step_size = 0.0;
            PassStatus::Converged
        } else {
            self.step_size = -dd / self.curvature;
            PassStatus::Continue
        };
        line.curvature = Some(self.curvature);
        line.dir_mag = Some(self.store.direction_magnitude());
        line.step = Some(self.step_size);

        self.predictions.clear();
        self.update_weight(self.step_size)?;
        self.phase = Phase::GradientPass;
        Ok(status)
    }

    fn update_weight(&mut self, step_size: f64) -> Result<()> {
        self.store.update_weight(step_size as f32);
        if self.config.save_per_pass {
            let model = self.model();
            self.checkpoint
                .save_predictor(&model, Some(self.current_pass))?;
        }
        Ok(())
    }
}
