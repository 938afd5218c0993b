use crate::{
    error::{CurvatureError, TrainError},
    memory::History,
    weights::{Cell, WeightStore},
};

/// Gradient magnitudes at the first point, for the diagnostic table.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StartReport {
    pub g1_hg1: f64,
    pub g1_g1: f64,
}

/// Outcome of an accepted direction update.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MiddleReport {
    /// Conjugate gradient mixing coefficient. `None` under L-BFGS.
    pub beta: Option<f32>,
}

/// Dot products of the saved and current gradients against the direction.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GradientDots {
    /// `<g_prev, dir>`
    pub g0_d: f64,
    /// `<g_curr, dir>`
    pub g1_d: f64,
    /// `<g_curr, H g_curr>` with the diagonal preconditioner as `H`.
    pub g1_hg1: f64,
    pub g1_g1: f64,
}

/// Computes search directions from the gradients accumulated in the weight
/// store: L-BFGS with `m` pairs of history, or preconditioned conjugate
/// gradient when `m == 0`.
#[derive(Debug, Clone)]
pub struct QuasiNewton {
    history: History,
}

impl QuasiNewton {
    pub fn new(m: usize, num_bits: u32) -> Result<Self, TrainError> {
        Ok(Self {
            history: History::new(m, num_bits)?,
        })
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn is_conjugate_gradient(&self) -> bool {
        self.history.is_conjugate_gradient()
    }

    /// Saves the first gradient (and position) and points `dir` down the
    /// preconditioned gradient.
    pub fn iter_start(&mut self, store: &mut WeightStore) -> StartReport {
        let h = &mut self.history;
        h.reset();
        let keep_pos = !h.is_conjugate_gradient();
        let head = h.head_mut();
        let mut report = StartReport::default();
        for (i, c) in store.cells_mut().iter_mut().enumerate() {
            if keep_pos {
                head.pos[i] = c.weight;
            }
            head.grad[i] = c.grad;
            report.g1_hg1 += c.grad as f64 * c.grad as f64 * c.cond as f64;
            report.g1_g1 += c.grad as f64 * c.grad as f64;
            c.dir = -c.cond * c.grad;
            c.grad = 0.0;
        }
        report
    }

    /// Folds the gradient of the new point into the history and computes the
    /// next direction. A curvature violation leaves the weights untouched.
    pub fn iter_middle(&mut self, store: &mut WeightStore) -> Result<MiddleReport, CurvatureError> {
        if self.history.is_conjugate_gradient() {
            return Ok(self.conjugate_gradient(store.cells_mut()));
        }
        self.lbfgs(store.cells_mut())?;
        Ok(MiddleReport { beta: None })
    }

    fn conjugate_gradient(&mut self, cells: &mut [Cell]) -> MiddleReport {
        let head = &mut self.history.head_mut().grad;
        let mut g_hy = 0.0;
        let mut g_hg = 0.0;
        for (c, g0) in cells.iter().zip(head.iter()) {
            let y = (c.grad - g0) as f64;
            g_hy += c.grad as f64 * c.cond as f64 * y;
            g_hg += *g0 as f64 * c.cond as f64 * *g0 as f64;
        }
        let mut beta = (g_hy / g_hg) as f32;
        if !beta.is_finite() || beta < 0.0 {
            beta = 0.0;
        }
        for (c, g0) in cells.iter_mut().zip(head.iter_mut()) {
            *g0 = c.grad;
            c.dir *= beta;
            c.dir -= c.cond * c.grad;
            c.grad = 0.0;
        }
        MiddleReport { beta: Some(beta) }
    }

    fn lbfgs(&mut self, cells: &mut [Cell]) -> Result<(), CurvatureError> {
        let mut y_s = 0.0;
        let mut y_hy = 0.0;
        let mut s_q = 0.0;
        {
            let head = self.history.head_mut();
            for ((c, g0), x0) in cells
                .iter_mut()
                .zip(head.grad.iter_mut())
                .zip(head.pos.iter_mut())
            {
                let y = c.grad - *g0;
                let s = c.weight - *x0;
                *g0 = y;
                *x0 = s;
                c.dir = c.grad;
                y_s += y as f64 * s as f64;
                y_hy += y as f64 * y as f64 * c.cond as f64;
                s_q += s as f64 * c.grad as f64;
            }
        }

        // NaN sums fail the guard too.
        if !(y_s > 0.0) || !(y_hy > 0.0) {
            return Err(CurvatureError::History { y_s, y_hy });
        }

        let h = &mut self.history;
        h.rho[0] = 1.0 / y_s;
        let gamma = (y_s / y_hy) as f32;
        let pairs = h.lastj() + 1;
        Self::recurse(h, cells, pairs, s_q, gamma);

        h.advance();
        let head = h.head_mut();
        for ((c, g0), x0) in cells
            .iter_mut()
            .zip(head.grad.iter_mut())
            .zip(head.pos.iter_mut())
        {
            *g0 = c.grad;
            *x0 = c.weight;
            c.grad = 0.0;
        }
        Ok(())
    }

    /// Runs the two-loop recursion over the `pairs` newest history entries,
    /// seeding `dir` with the current gradient. With no pairs this is
    /// `dir = -gamma * cond * grad`, the same direction `iter_start` picks
    /// for `gamma = 1`.
    pub fn two_loop(&mut self, store: &mut WeightStore, pairs: usize, gamma: f32) {
        let pairs = pairs.min(self.history.capacity());
        let cells = store.cells_mut();
        let mut s_q = 0.0;
        if pairs > 0 {
            let s0 = self.history.s(0);
            for (c, s) in cells.iter_mut().zip(s0) {
                c.dir = c.grad;
                s_q += *s as f64 * c.grad as f64;
            }
        } else {
            cells.iter_mut().for_each(|c| c.dir = c.grad);
        }
        Self::recurse(&mut self.history, cells, pairs, s_q, gamma);
    }

    /// Expects `dir` to hold the gradient and `s_q = <s_0, dir>`.
    fn recurse(h: &mut History, cells: &mut [Cell], pairs: usize, mut s_q: f64, gamma: f32) {
        if pairs == 0 {
            for c in cells.iter_mut() {
                c.dir = -(gamma * c.cond * c.dir);
            }
            return;
        }
        let last = pairs - 1;

        for j in 0..last {
            h.alpha[j] = h.rho[j] * s_q;
            let a = h.alpha[j] as f32;
            s_q = 0.0;
            for ((c, y), s) in cells.iter_mut().zip(h.y(j)).zip(h.s(j + 1)) {
                c.dir -= a * y;
                s_q += *s as f64 * c.dir as f64;
            }
        }

        h.alpha[last] = h.rho[last] * s_q;
        let a = h.alpha[last] as f32;
        let mut y_r = 0.0;
        for (c, y) in cells.iter_mut().zip(h.y(last)) {
            c.dir -= a * y;
            c.dir *= gamma * c.cond;
            y_r += *y as f64 * c.dir as f64;
        }

        for j in (1..=last).rev() {
            let coef = (h.alpha[j] - h.rho[j] * y_r) as f32;
            y_r = 0.0;
            for ((c, s), y) in cells.iter_mut().zip(h.s(j)).zip(h.y(j - 1)) {
                c.dir += coef * s;
                y_r += *y as f64 * c.dir as f64;
            }
        }

        let coef = (h.alpha[0] - h.rho[0] * y_r) as f32;
        for (c, s) in cells.iter_mut().zip(h.s(0)) {
            c.dir = -c.dir - coef * s;
        }
    }

    /// `<g_saved, dir>`: slope of the objective along `dir` at the last
    /// accepted point.
    pub fn derivative_in_direction(&self, store: &WeightStore) -> f64 {
        store
            .cells()
            .iter()
            .zip(self.history.head_grad())
            .map(|(c, g)| *g as f64 * c.dir as f64)
            .sum()
    }

    pub fn gradient_dots(&self, store: &WeightStore) -> GradientDots {
        let mut dots = GradientDots::default();
        for (c, g0) in store.cells().iter().zip(self.history.head_grad()) {
            dots.g0_d += *g0 as f64 * c.dir as f64;
            dots.g1_d += c.grad as f64 * c.dir as f64;
            dots.g1_hg1 += c.grad as f64 * c.grad as f64 * c.cond as f64;
            dots.g1_g1 += c.grad as f64 * c.grad as f64;
        }
        dots
    }
}
