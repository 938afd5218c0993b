use approx::assert_relative_eq;
use ol_core::{solver::QuasiNewton, CurvatureError, Field, WeightStore};

#[test]
fn test_iter_start_and_first_middle() {
    // Four cells, one active feature.
    let mut store = WeightStore::new(2).unwrap();
    let mut solver = QuasiNewton::new(1, 2).unwrap();
    store.cells_mut()[1].grad = 1.0;
    store.cells_mut()[1].cond = 1.0;

    solver.iter_start(&mut store);
    assert_eq!(store.field_values(Field::Direction), vec![0.0, -1.0, 0.0, 0.0]);
    assert_eq!(store.field_values(Field::Gradient), vec![0.0; 4]);
    assert_eq!(solver.history().head_grad()[1], 1.0);
    assert_eq!(solver.history().lastj(), 0);
    assert_eq!(solver.history().origin(), 0);

    // Step of 0.1 along dir, then the new gradient.
    store.update_weight(0.1);
    assert_relative_eq!(store.cells()[1].weight, -0.1);
    store.cells_mut()[1].grad = 0.5;

    solver.iter_middle(&mut store).unwrap();
    let c = store.cells()[1];
    assert!(c.dir.is_finite());
    assert!(c.dir < 0.0);
    assert_relative_eq!(c.dir, -0.1, epsilon = 1e-6);
    assert_eq!(c.grad, 0.0);
    assert_relative_eq!(c.weight, -0.1);
    // The head now holds the new point.
    assert_eq!(solver.history().head_grad()[1], 0.5);
    assert_relative_eq!(solver.history().head().pos[1], -0.1);
}

#[test]
fn test_iter_start_reports_gradient_magnitudes() {
    let mut store = WeightStore::new(2).unwrap();
    let mut solver = QuasiNewton::new(3, 2).unwrap();
    for (i, c) in store.cells_mut().iter_mut().enumerate() {
        c.grad = i as f32;
        c.cond = 0.5;
    }
    let report = solver.iter_start(&mut store);
    assert_relative_eq!(report.g1_g1, 0.0 + 1.0 + 4.0 + 9.0);
    assert_relative_eq!(report.g1_hg1, 0.5 * 14.0);
    // <g, dir> = -sum(cond * g^2)
    assert_relative_eq!(solver.derivative_in_direction(&store), -7.0);
}

#[test]
fn test_conjugate_gradient_beta_is_clamped() {
    let mut store = WeightStore::new(2).unwrap();
    let mut solver = QuasiNewton::new(0, 2).unwrap();
    assert!(solver.is_conjugate_gradient());
    assert_eq!(solver.history().mem_stride(), 1);
    store.cells_mut()[0].grad = 1.0;
    store.cells_mut()[0].cond = 1.0;
    solver.iter_start(&mut store);

    // g_Hy = 0.5 * (0.5 - 1) < 0
    store.cells_mut()[0].grad = 0.5;
    let report = solver.iter_middle(&mut store).unwrap();
    assert_eq!(report.beta, Some(0.0));
    assert_eq!(store.cells()[0].dir, -0.5);
    assert_eq!(solver.history().head_grad()[0], 0.5);
}

#[test]
fn test_conjugate_gradient_nan_beta_is_clamped() {
    let mut store = WeightStore::new(2).unwrap();
    let mut solver = QuasiNewton::new(0, 2).unwrap();
    solver.iter_start(&mut store);
    // Both gradients zero: beta = 0 / 0.
    let report = solver.iter_middle(&mut store).unwrap();
    assert_eq!(report.beta, Some(0.0));
    assert!(store.cells().iter().all(|c| c.dir == 0.0));
}

#[test]
fn test_conjugate_gradient_mixes_previous_direction() {
    let mut store = WeightStore::new(2).unwrap();
    let mut solver = QuasiNewton::new(0, 2).unwrap();
    store.cells_mut()[0].grad = 1.0;
    store.cells_mut()[0].cond = 1.0;
    solver.iter_start(&mut store);

    store.cells_mut()[0].grad = 2.0;
    let report = solver.iter_middle(&mut store).unwrap();
    // g_Hy = 2 * 1 * 1, g_Hg = 1
    assert_eq!(report.beta, Some(2.0));
    assert_eq!(store.cells()[0].dir, 2.0 * -1.0 - 2.0);
}

#[test]
fn test_curvature_guard_leaves_weights() {
    let mut store = WeightStore::new(2).unwrap();
    let mut solver = QuasiNewton::new(3, 2).unwrap();
    store.cells_mut()[0].grad = 1.0;
    store.cells_mut()[0].cond = 1.0;
    solver.iter_start(&mut store);

    store.cells_mut()[0].weight = 0.1;
    store.cells_mut()[0].grad = 0.5;
    let weights = store.field_values(Field::Weight);
    let result = solver.iter_middle(&mut store);
    match result {
        Err(CurvatureError::History { y_s, .. }) => assert!(y_s <= 0.0),
        other => panic!("expected a curvature violation, got {:?}", other),
    }
    assert_eq!(store.field_values(Field::Weight), weights);
    assert_eq!(solver.history().lastj(), 0);
}

#[test]
fn test_history_never_exceeds_capacity() {
    let m = 2;
    let mut store = WeightStore::new(2).unwrap();
    let mut solver = QuasiNewton::new(m, 2).unwrap();
    store.cells_mut()[0].grad = 1.0;
    store.cells_mut()[0].cond = 1.0;
    solver.iter_start(&mut store);

    for k in 1..=10 {
        // y = s = 1 every iteration.
        let c = &mut store.cells_mut()[0];
        c.weight = k as f32;
        c.grad = 1.0 + k as f32;
        solver.iter_middle(&mut store).unwrap();
        assert!(solver.history().lastj() <= m - 1);
        assert_eq!(solver.history().slots_in_use(), m);
        assert!(store.cells()[0].dir.is_finite());
    }
    assert_eq!(solver.history().lastj(), m - 1);
    let newest_first: Vec<usize> = solver.history().newest_first().collect();
    let oldest_first: Vec<usize> = solver.history().oldest_first().collect();
    assert_eq!(newest_first, vec![0, 1]);
    assert_eq!(oldest_first, vec![1, 0]);
}

#[test]
fn test_two_loop_without_history_matches_start() {
    let mut store = WeightStore::new(3).unwrap();
    for (i, c) in store.cells_mut().iter_mut().enumerate() {
        c.grad = i as f32 - 3.5;
        c.cond = 1.0 / (1.0 + i as f32);
    }
    let mut started = store.clone();
    let mut solver = QuasiNewton::new(4, 3).unwrap();
    solver.two_loop(&mut store, 0, 1.0);

    let mut other = QuasiNewton::new(4, 3).unwrap();
    other.iter_start(&mut started);
    assert_eq!(
        store.field_values(Field::Direction),
        started.field_values(Field::Direction)
    );
    for c in store.cells() {
        assert_eq!(c.dir, -c.cond * c.grad);
    }
}

#[test]
fn test_gradient_dots() {
    let mut store = WeightStore::new(2).unwrap();
    let mut solver = QuasiNewton::new(1, 2).unwrap();
    store.cells_mut()[0].grad = 2.0;
    store.cells_mut()[0].cond = 0.5;
    solver.iter_start(&mut store);
    store.cells_mut()[0].grad = -1.0;

    let dots = solver.gradient_dots(&store);
    assert_relative_eq!(dots.g0_d, 2.0 * -1.0);
    assert_relative_eq!(dots.g1_d, -1.0 * -1.0);
    assert_relative_eq!(dots.g1_hg1, 0.5);
    assert_relative_eq!(dots.g1_g1, 1.0);
}
