use crate::{error::TrainError, regularizer::Regularizers};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Number of logical fields per weight cell.
pub const STRIDE: usize = 4;

/// One hashed feature's state. Field order matches `Field` offsets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[repr(C)]
pub struct Cell {
    /// Current position.
    pub weight: f32,
    /// Gradient accumulated over the current pass.
    pub grad: f32,
    /// Search direction.
    pub dir: f32,
    /// Diagonal preconditioner: raw curvature while pass 0 runs, its
    /// regularized inverse afterwards.
    pub cond: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Weight = 0,
    Gradient = 1,
    Direction = 2,
    Preconditioner = 3,
}

impl Field {
    pub fn offset(self) -> usize {
        self as usize
    }

    pub fn get(self, cell: &Cell) -> f32 {
        match self {
            Field::Weight => cell.weight,
            Field::Gradient => cell.grad,
            Field::Direction => cell.dir,
            Field::Preconditioner => cell.cond,
        }
    }

    pub fn get_mut(self, cell: &mut Cell) -> &mut f32 {
        match self {
            Field::Weight => &mut cell.weight,
            Field::Gradient => &mut cell.grad,
            Field::Direction => &mut cell.dir,
            Field::Preconditioner => &mut cell.cond,
        }
    }
}

/// `2^num_bits` cells addressed by masked feature hash.
#[derive(Debug, Clone)]
pub struct WeightStore {
    num_bits: u32,
    mask: u64,
    cells: Vec<Cell>,
}

impl WeightStore {
    pub fn new(num_bits: u32) -> Result<Self, TrainError> {
        let len = 1usize << num_bits;
        let mut cells = Vec::new();
        cells
            .try_reserve_exact(len)
            .map_err(|_| TrainError::Allocation {
                what: "weights",
                num_bits,
            })?;
        cells.resize(len, Cell::default());
        Ok(Self {
            num_bits,
            mask: (len as u64) - 1,
            cells,
        })
    }

    pub fn num_bits(&self) -> u32 {
        self.num_bits
    }

    pub fn mask(&self) -> u64 {
        self.mask
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Cell position of a hashed feature index.
    #[inline]
    pub fn slot(&self, index: u64) -> usize {
        (index & self.mask) as usize
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    pub fn cells_mut(&mut self) -> &mut [Cell] {
        &mut self.cells
    }

    pub fn cell(&self, index: u64) -> &Cell {
        &self.cells[self.slot(index)]
    }

    pub fn cell_mut(&mut self, index: u64) -> &mut Cell {
        let slot = self.slot(index);
        &mut self.cells[slot]
    }

    pub fn field_values(&self, field: Field) -> Vec<f32> {
        self.cells.iter().map(|c| field.get(c)).collect()
    }

    pub fn set_field_values(&mut self, field: Field, values: &[f32]) {
        debug_assert_eq!(values.len(), self.cells.len());
        self.cells
            .par_iter_mut()
            .zip(values.par_iter())
            .for_each(|(c, v)| *field.get_mut(c) = *v);
    }

    pub fn zero_field(&mut self, field: Field) {
        self.cells
            .par_iter_mut()
            .for_each(|c| *field.get_mut(c) = 0.0);
    }

    pub fn zero_derivative(&mut self) {
        self.zero_field(Field::Gradient);
    }

    pub fn zero_preconditioner(&mut self) {
        self.zero_field(Field::Preconditioner);
    }

    /// Clears everything the optimizer derives, leaving weights alone.
    pub fn zero_state(&mut self) {
        self.cells.par_iter_mut().for_each(|c| {
            c.grad = 0.0;
            c.dir = 0.0;
            c.cond = 0.0;
        });
    }

    pub fn direction_magnitude(&self) -> f64 {
        self.cells
            .iter()
            .map(|c| c.dir as f64 * c.dir as f64)
            .sum()
    }

    /// `sum(reg_i * dir_i^2)`, where `reg_i` is the per-feature strength when
    /// regularizers are loaded and `lambda` otherwise.
    pub fn regularizer_direction_magnitude(
        &self,
        lambda: f64,
        regularizers: Option<&Regularizers>,
    ) -> f64 {
        match regularizers {
            None => self
                .cells
                .iter()
                .map(|c| lambda * c.dir as f64 * c.dir as f64)
                .sum(),
            Some(regs) => self
                .cells
                .iter()
                .zip(regs.strength.iter())
                .map(|(c, s)| *s as f64 * c.dir as f64 * c.dir as f64)
                .sum(),
        }
    }

    /// Adds the regularizer to the accumulated curvature and inverts it.
    /// Coordinates with non-positive curvature get no preconditioning.
    pub fn finalize_preconditioner(&mut self, lambda: f32, regularizers: Option<&Regularizers>) {
        let invert = |c: &mut Cell, reg: f32| {
            c.cond += reg;
            c.cond = if c.cond > 0.0 { 1.0 / c.cond } else { 0.0 };
        };
        match regularizers {
            None => self.cells.par_iter_mut().for_each(|c| invert(c, lambda)),
            Some(regs) => self
                .cells
                .par_iter_mut()
                .zip(regs.strength.par_iter())
                .for_each(|(c, s)| invert(c, *s)),
        }
    }

    /// Adds the L2 gradient into `grad` and returns the regularization loss.
    /// With per-feature regularizers the penalty pulls towards the prior.
    pub fn add_regularization(&mut self, lambda: f32, regularizers: Option<&Regularizers>) -> f64 {
        let mut loss = 0.0;
        match regularizers {
            None => {
                if lambda == 0.0 {
                    return 0.0;
                }
                for c in self.cells.iter_mut() {
                    c.grad += lambda * c.weight;
                    loss += 0.5 * lambda as f64 * c.weight as f64 * c.weight as f64;
                }
            }
            Some(regs) => {
                for ((c, s), p) in self
                    .cells
                    .iter_mut()
                    .zip(regs.strength.iter())
                    .zip(regs.prior.iter())
                {
                    let delta = c.weight - p;
                    c.grad += s * delta;
                    loss += 0.5 * *s as f64 * delta as f64 * delta as f64;
                }
            }
        }
        loss
    }

    /// `weight += step * dir` for every cell.
    pub fn update_weight(&mut self, step_size: f32) {
        self.cells
            .par_iter_mut()
            .for_each(|c| c.weight += step_size * c.dir);
    }
}
