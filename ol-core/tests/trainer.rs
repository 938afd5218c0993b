use approx::assert_abs_diff_eq;
use ol_core::{
    allreduce::{children_of, parent_of},
    evaluator::FeatureEvaluator,
    loss::LossKind,
    regularizer::Regularizers,
    Checkpoint, Example, ExampleSource, Fetch, Model, Phase, ReplaySource, TrainError,
    TrainerConfig, Trainer, TreeAllReduce,
};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use std::{
    cell::RefCell,
    net::TcpListener,
    rc::Rc,
    thread,
};

const W1: f32 = 2.0;
const W2: f32 = -3.0;
const BIAS: f32 = 0.5;

fn linear_data(n: usize, seed: u64) -> Vec<Example> {
    let mut rng = SmallRng::seed_from_u64(seed);
    (0..n)
        .map(|_| {
            let x1: f32 = rng.gen_range(-1.0..1.0);
            let x2: f32 = rng.gen_range(-1.0..1.0);
            let mut ex = Example::new(Some(W1 * x1 + W2 * x2 + BIAS));
            ex.push_feature(b'a', 1, x1);
            ex.push_feature(b'a', 2, x2);
            ex.add_constant();
            ex
        })
        .collect()
}

fn config(history: usize) -> TrainerConfig {
    TrainerConfig {
        history,
        num_bits: 10,
        numpasses: 30,
        quiet: true,
        ..Default::default()
    }
}

fn weight_of(model: &Model, index: u64) -> f32 {
    let mask = (1u64 << model.num_bits) - 1;
    model
        .weights
        .iter()
        .find(|(i, _)| *i == index & mask)
        .map(|(_, w)| *w)
        .unwrap_or(0.0)
}

fn assert_recovers_weights(model: &Model, tolerance: f32) {
    assert_abs_diff_eq!(weight_of(model, 1), W1, epsilon = tolerance);
    assert_abs_diff_eq!(weight_of(model, 2), W2, epsilon = tolerance);
    assert_abs_diff_eq!(
        weight_of(model, ol_core::example::CONSTANT),
        BIAS,
        epsilon = tolerance
    );
}

fn logistic_data(n: usize, seed: u64) -> Vec<Example> {
    let mut rng = SmallRng::seed_from_u64(seed);
    (0..n)
        .map(|_| {
            let x: f32 = rng.gen_range(-1.0..1.0);
            let mut ex = Example::new(Some(if x > 0.1 { 1.0 } else { -1.0 }));
            ex.push_feature(b'a', 4, x);
            ex.add_constant();
            ex
        })
        .collect()
}

fn train(config: TrainerConfig, data: Vec<Example>) -> (Trainer, ol_core::TrainSummary) {
    let passes = config.passes_needed();
    let mut trainer = Trainer::new(config).unwrap();
    let mut source = ReplaySource::new(data, passes);
    let summary = trainer.run(&mut source).unwrap();
    (trainer, summary)
}

#[test]
fn test_lbfgs_fits_linear_data() {
    let (trainer, summary) = train(config(5), linear_data(200, 7));
    assert_eq!(trainer.phase(), Phase::Done);
    assert!(summary.average_loss < 1e-3, "loss {}", summary.average_loss);
    assert_recovers_weights(&summary.model, 0.05);
}

#[test]
fn test_lbfgs_with_curvature_pass_fits_linear_data() {
    let mut cfg = config(5);
    cfg.hessian_on = true;
    let (_, summary) = train(cfg, linear_data(200, 11));
    assert!(summary.average_loss < 1e-3, "loss {}", summary.average_loss);
    assert_recovers_weights(&summary.model, 0.05);
}

#[test]
fn test_conjugate_gradient_reduces_loss() {
    let data = linear_data(200, 3);
    let initial: f64 = data
        .iter()
        .map(|ex| {
            let l = ex.label.unwrap() as f64;
            l * l
        })
        .sum::<f64>()
        / data.len() as f64;
    let (trainer, summary) = train(config(0), data);
    assert!(trainer.config().curvature_pass_enabled());
    assert!(summary.average_loss < initial * 0.01, "loss {}", summary.average_loss);
}

#[test]
fn test_training_is_deterministic() {
    let (a, _) = train(config(4), linear_data(150, 5));
    let (b, _) = train(config(4), linear_data(150, 5));
    assert_eq!(a.store().cells(), b.store().cells());
    assert_eq!(a.current_pass(), b.current_pass());
}

#[test]
fn test_zero_loss_converges_early() {
    let data: Vec<Example> = (0..10)
        .map(|i| {
            let mut ex = Example::new(Some(0.0));
            ex.push_feature(b'a', i, 1.0);
            ex
        })
        .collect();
    let (trainer, summary) = train(config(3), data);
    assert!(summary.stopped_early);
    assert_eq!(summary.passes, 2);
    assert_eq!(trainer.final_pass(), 2);
    assert_eq!(trainer.step_size(), 0.0);
    assert!(trainer.store().cells().iter().all(|c| c.weight == 0.0));
}

#[test]
fn test_logistic_separates_classes() {
    let data = logistic_data(300, 21);
    let mut cfg = config(5);
    cfg.loss_function = LossKind::Logistic;
    cfg.l2_lambda = 0.1;
    let (_, summary) = train(cfg, data.clone());
    let predictor = ol_core::Predictor::from_model(&summary.model).unwrap();
    let correct = data
        .iter()
        .filter(|ex| predictor.predict(ex).signum() == ex.label.unwrap())
        .count();
    assert!(correct as f64 / data.len() as f64 > 0.9, "{} correct", correct);
}

#[test]
fn test_test_examples_are_not_learned() {
    let mut trainer = Trainer::new(config(3)).unwrap();
    let mut ex = linear_data(1, 1).remove(0);
    ex.label = None;
    trainer.learn(&mut ex);
    assert!(trainer.store().cells().iter().all(|c| c.grad == 0.0 && c.cond == 0.0));
    assert_eq!(ex.final_prediction, 0.0);
}

#[test]
fn test_invalid_config_is_rejected() {
    let mut cfg = config(3);
    cfg.numpasses = 1;
    let err = Trainer::new(cfg).err().unwrap();
    assert!(matches!(
        err.downcast_ref::<TrainError>(),
        Some(TrainError::Config(_))
    ));
}

struct Recorder(Rc<RefCell<Vec<Option<usize>>>>);

impl Checkpoint for Recorder {
    fn save_predictor(&mut self, _model: &Model, pass: Option<usize>) -> anyhow::Result<()> {
        self.0.borrow_mut().push(pass);
        Ok(())
    }
}

#[test]
fn test_checkpoints() {
    let saved = Rc::new(RefCell::new(Vec::new()));
    let mut cfg = config(3);
    cfg.numpasses = 6;
    cfg.save_per_pass = true;
    let mut trainer = Trainer::new(cfg)
        .unwrap()
        .with_checkpoint(Box::new(Recorder(saved.clone())));
    let mut source = ReplaySource::new(linear_data(50, 2), 6);
    trainer.run(&mut source).unwrap();

    let saved = saved.borrow();
    assert_eq!(saved.last(), Some(&None));
    let per_pass: Vec<usize> = saved.iter().filter_map(|p| *p).collect();
    assert!(!per_pass.is_empty());
    assert!(per_pass.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn test_regularizer_output_round_trip() {
    let path = std::env::temp_dir().join(format!("ol-core-regs-{}.json", std::process::id()));
    let mut cfg = config(3);
    cfg.numpasses = 4;
    cfg.l2_lambda = 0.5;
    cfg.regularizer_output = Some(path.clone());
    let (trainer, _) = train(cfg.clone(), linear_data(50, 9));

    let regs = Regularizers::load(&path, cfg.num_bits).unwrap();
    assert!(regs.strength[1] > 0.5);
    assert_eq!(regs.strength[5], 0.5);
    assert_eq!(regs.prior[1], trainer.store().cells()[1].weight);

    // Anchored on the first run, a second run starts with those regularizers.
    let mut anchored = config(3);
    anchored.numpasses = 4;
    anchored.regularizer_input = Some(path.clone());
    let (_, summary) = train(anchored, linear_data(50, 9));
    assert!(summary.average_loss.is_finite());
    std::fs::remove_file(&path).unwrap();
}

#[test]
fn test_distributed_matches_single_worker() {
    let data = linear_data(120, 13);
    let (single, _) = train(config(4), data.clone());

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    assert_eq!(children_of(0, 2), vec![1]);
    assert_eq!(parent_of(1), Some(0));
    let halves: Vec<Vec<Example>> = data.chunks(60).map(|c| c.to_vec()).collect();
    let mut listener = Some(listener);
    let handles: Vec<_> = halves
        .into_iter()
        .enumerate()
        .map(|(rank, half)| {
            let listener = if rank == 0 { listener.take() } else { None };
            let parent = if rank == 0 { None } else { Some(addr) };
            thread::spawn(move || {
                let node = TreeAllReduce::join(rank, 2, listener, parent).unwrap();
                let cfg = config(4);
                let passes = cfg.passes_needed();
                let mut trainer = Trainer::new(cfg).unwrap().with_reducer(Box::new(node));
                let summary = trainer.run(&mut ReplaySource::new(half, passes)).unwrap();
                summary.model
            })
        })
        .collect();
    let models: Vec<Model> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(models[0].weights, models[1].weights);
    for index in [1, 2, ol_core::example::CONSTANT] {
        assert_abs_diff_eq!(
            weight_of(&models[0], index),
            weight_of(&single.model(), index),
            epsilon = 0.02
        );
    }
}

#[test]
fn test_regularizer_output_measures_curvature_at_final_weights() {
    let path = std::env::temp_dir().join(format!("ol-core-regs-final-{}.json", std::process::id()));
    let data = logistic_data(200, 31);
    let mut cfg = config(5);
    cfg.loss_function = LossKind::Logistic;
    cfg.l2_lambda = 0.01;
    cfg.regularizer_output = Some(path.clone());
    let (trainer, summary) = train(cfg.clone(), data.clone());
    assert_eq!(summary.passes, trainer.final_pass() + 1);

    let regs = Regularizers::load(&path, cfg.num_bits).unwrap();
    std::fs::remove_file(&path).unwrap();
    let loss = LossKind::Logistic.build();
    let evaluator = FeatureEvaluator::for_store(trainer.store(), Vec::new());
    let mut at_final = cfg.l2_lambda as f64;
    let mut at_zero = cfg.l2_lambda as f64;
    for ex in data.iter() {
        let label = ex.label.unwrap();
        let x = ex.namespace(b'a').unwrap().features[0].value as f64;
        let p = evaluator.predict(trainer.store().cells(), ex, trainer.bounds());
        at_final += loss.second_derivative(trainer.bounds(), p, label) as f64 * x * x;
        at_zero += loss.second_derivative(trainer.bounds(), 0.0, label) as f64 * x * x;
    }
    assert_abs_diff_eq!(regs.strength[4] as f64, at_final, epsilon = 1e-3 * at_final);
    assert!((regs.strength[4] as f64) < 0.9 * at_zero);
    assert_eq!(regs.prior[4], weight_of(&summary.model, 4));
}

#[test]
fn test_regularizer_output_needs_extra_pass() {
    let path = std::env::temp_dir().join(format!("ol-core-regs-short-{}.json", std::process::id()));
    let mut cfg = config(3);
    cfg.numpasses = 4;
    cfg.l2_lambda = 0.5;
    cfg.regularizer_output = Some(path.clone());
    assert_eq!(cfg.passes_needed(), 5);
    let mut trainer = Trainer::new(cfg).unwrap();
    let summary = trainer
        .run(&mut ReplaySource::new(linear_data(50, 9), 4))
        .unwrap();
    assert_eq!(trainer.phase(), Phase::Done);
    assert!(summary.average_loss.is_finite());
    assert!(!path.exists());
}

/// Serves a fixed list of examples for every pass, so labels and features
/// can change from one pass to the next.
struct ScriptedSource {
    passes: Vec<Vec<Example>>,
    pass: usize,
    next: usize,
}

impl ScriptedSource {
    fn new(passes: Vec<Vec<Example>>) -> Self {
        Self {
            passes,
            pass: 0,
            next: 0,
        }
    }
}

impl ExampleSource for ScriptedSource {
    fn get_example(&mut self) -> Fetch {
        while self.pass < self.passes.len() && self.next == self.passes[self.pass].len() {
            self.pass += 1;
            self.next = 0;
        }
        let Some(examples) = self.passes.get(self.pass) else {
            return Fetch::Exhausted;
        };
        let mut ex = examples[self.next].clone();
        ex.pass = self.pass;
        self.next += 1;
        Fetch::Ready(ex)
    }
}

fn single(index: u64, value: f32, label: f32) -> Example {
    let mut ex = Example::new(Some(label));
    ex.push_feature(b'a', index, value);
    ex
}

/// L-BFGS without curvature passes: pass 0 ends with a fixed step of 0.5.
fn scripted_config() -> TrainerConfig {
    TrainerConfig {
        history: 3,
        num_bits: 4,
        numpasses: 5,
        first_curvature_pass: false,
        quiet: true,
        ..Default::default()
    }
}

// Pass 0 on `single(1, 1.0, 1.0)` leaves grad -2, cond 1/2, dir 1 and w = 0.5.
fn after_first_pass(config: TrainerConfig) -> Trainer {
    let mut trainer = Trainer::new(config).unwrap();
    trainer.learn(&mut single(1, 1.0, 1.0));
    trainer.end_pass().unwrap();
    assert_eq!(trainer.phase(), Phase::GradientPass);
    assert_eq!(trainer.step_size(), 0.5);
    assert_eq!(trainer.store().cells()[1].weight, 0.5);
    trainer
}

#[test]
fn test_rejected_line_search_halves_step() {
    let mut trainer = after_first_pass(scripted_config());
    // Loss 0.5625, grad -3: the secant cross point lies at 1.0625, past the step.
    trainer.learn(&mut single(1, 2.0, 1.75));
    trainer.end_pass().unwrap();

    assert_eq!(trainer.curvature_violations(), 1);
    assert_eq!(trainer.step_size(), 0.25);
    assert_abs_diff_eq!(trainer.store().cells()[1].weight, 0.25, epsilon = 1e-6);
    assert!(trainer.store().cells().iter().all(|c| c.grad == 0.0));
    assert_eq!(trainer.phase(), Phase::GradientPass);
    assert_eq!(trainer.final_pass(), 5);
}

#[test]
fn test_loss_increase_steps_back() {
    let mut trainer = after_first_pass(scripted_config());
    // Loss 2.25 > 1 with grad 6: the cross point 0.21875 is inside the step.
    trainer.learn(&mut single(1, 2.0, -0.5));
    trainer.end_pass().unwrap();

    assert_eq!(trainer.curvature_violations(), 0);
    assert_abs_diff_eq!(trainer.step_size(), 0.21875, epsilon = 1e-9);
    assert_abs_diff_eq!(trainer.store().cells()[1].weight, 0.21875, epsilon = 1e-6);
    assert_eq!(trainer.phase(), Phase::GradientPass);
    assert_eq!(trainer.final_pass(), 5);
}

#[test]
fn test_violation_limit_returns_to_last_accepted_point() {
    let mut cfg = scripted_config();
    cfg.max_curvature_violations = 1;
    let mut trainer = Trainer::new(cfg).unwrap();
    let pass1 = single(1, 2.0, 1.75);
    let mut source = ScriptedSource::new(vec![
        vec![single(1, 1.0, 1.0)],
        vec![pass1.clone()],
        vec![pass1],
    ]);
    let summary = trainer.run(&mut source).unwrap();

    assert_eq!(summary.curvature_violations, 1);
    assert!(summary.stopped_early);
    assert_eq!(summary.passes, 2);
    assert_eq!(trainer.phase(), Phase::Done);
    assert_eq!(trainer.step_size(), 0.0);
    assert_eq!(trainer.store().cells()[1].weight, 0.0);
    assert!(summary.model.weights.is_empty());
    assert_abs_diff_eq!(summary.average_loss, 1.0, epsilon = 1e-9);
}

#[test]
fn test_history_violation_keeps_accepted_weights() {
    let mut trainer = Trainer::new(scripted_config()).unwrap();
    // The featureless example only adds loss 1 to pass 0, so pass 1 is
    // accepted even though its gradient is steeper: y.s = -1 * 0.5.
    let pass1 = single(1, 2.0, 1.75);
    let mut source = ScriptedSource::new(vec![
        vec![single(1, 1.0, 1.0), Example::new(Some(-1.0))],
        vec![pass1.clone()],
        vec![pass1],
    ]);
    let summary = trainer.run(&mut source).unwrap();

    assert!(summary.stopped_early);
    assert_eq!(summary.passes, 2);
    assert_eq!(summary.curvature_violations, 0);
    assert_eq!(trainer.step_size(), 0.0);
    assert_eq!(trainer.store().cells()[1].weight, 0.5);
    assert_eq!(weight_of(&summary.model, 1), 0.5);
}

#[test]
fn test_zero_curvature_with_slope_is_fatal() {
    let mut cfg = scripted_config();
    cfg.hessian_on = true;
    cfg.first_curvature_pass = true;
    let mut trainer = Trainer::new(cfg).unwrap();
    // The curvature pass only touches cell 2, where the direction is 0.
    let mut source = ScriptedSource::new(vec![
        vec![single(1, 1.0, 1.0)],
        vec![single(2, 1.0, 1.0)],
    ]);
    let err = trainer.run(&mut source).err().unwrap();
    match err.downcast_ref::<TrainError>() {
        Some(TrainError::DegenerateCurvature { derivative }) => {
            assert_abs_diff_eq!(*derivative, -2.0, epsilon = 1e-9)
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[cfg(debug_assertions)]
#[test]
#[should_panic(expected = "curvature pass saw more examples")]
fn test_curvature_pass_must_follow_gradient_order() {
    let mut cfg = scripted_config();
    cfg.hessian_on = true;
    cfg.first_curvature_pass = true;
    let mut trainer = Trainer::new(cfg).unwrap();
    trainer.learn(&mut single(1, 1.0, 1.0));
    trainer.end_pass().unwrap();
    assert_eq!(trainer.phase(), Phase::CurvaturePass);
    trainer.learn(&mut single(1, 1.0, 1.0));
    trainer.learn(&mut single(1, 1.0, 1.0));
}
