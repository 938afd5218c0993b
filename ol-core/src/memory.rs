use crate::error::TrainError;

/// One ring entry. At the head it holds the gradient and position of the
/// last accepted point; once a step has been taken from there, the same
/// buffers are overwritten in place with the pair `y = Δgrad` (in `grad`)
/// and `s = Δposition` (in `pos`).
#[derive(Debug, Clone, Default)]
pub struct Slot {
    pub grad: Vec<f32>,
    pub pos: Vec<f32>,
}

/// Bounded ring of L-BFGS `(y, s)` pairs. Pair `j = 0` is the newest and sits
/// at the head; `j = lastj` is the oldest still in use.
#[derive(Debug, Clone)]
pub struct History {
    m: usize,
    slots: Vec<Slot>,
    origin: usize,
    lastj: usize,
    pub(crate) rho: Vec<f64>,
    pub(crate) alpha: Vec<f64>,
}

fn alloc_zeroed(len: usize, num_bits: u32) -> Result<Vec<f32>, TrainError> {
    let mut v = Vec::new();
    v.try_reserve_exact(len)
        .map_err(|_| TrainError::Allocation {
            what: "history memory",
            num_bits,
        })?;
    v.resize(len, 0.0);
    Ok(v)
}

impl History {
    /// `m == 0` keeps only the previous gradient, which is all conjugate
    /// gradient needs.
    pub fn new(m: usize, num_bits: u32) -> Result<Self, TrainError> {
        let n = 1usize << num_bits;
        let slots = if m == 0 {
            vec![Slot {
                grad: alloc_zeroed(n, num_bits)?,
                pos: Vec::new(),
            }]
        } else {
            (0..m)
                .map(|_| {
                    Ok(Slot {
                        grad: alloc_zeroed(n, num_bits)?,
                        pos: alloc_zeroed(n, num_bits)?,
                    })
                })
                .collect::<Result<Vec<_>, TrainError>>()?
        };
        Ok(Self {
            m,
            slots,
            origin: 0,
            lastj: 0,
            rho: vec![0.0; m],
            alpha: vec![0.0; m],
        })
    }

    pub fn capacity(&self) -> usize {
        self.m
    }

    pub fn is_conjugate_gradient(&self) -> bool {
        self.m == 0
    }

    /// Floats stored per feature.
    pub fn mem_stride(&self) -> usize {
        if self.m == 0 {
            1
        } else {
            2 * self.m
        }
    }

    pub fn lastj(&self) -> usize {
        self.lastj
    }

    pub fn origin(&self) -> usize {
        self.origin
    }

    pub fn slots_in_use(&self) -> usize {
        self.slots.len()
    }

    pub fn reset(&mut self) {
        self.origin = 0;
        self.lastj = 0;
    }

    pub fn head(&self) -> &Slot {
        &self.slots[self.origin]
    }

    pub fn head_mut(&mut self) -> &mut Slot {
        &mut self.slots[self.origin]
    }

    /// Gradient saved at the last accepted point.
    pub fn head_grad(&self) -> &[f32] {
        &self.slots[self.origin].grad
    }

    #[inline]
    fn slot_of(&self, j: usize) -> usize {
        (self.origin + j) % self.m
    }

    pub fn y(&self, j: usize) -> &[f32] {
        &self.slots[self.slot_of(j)].grad
    }

    pub fn s(&self, j: usize) -> &[f32] {
        &self.slots[self.slot_of(j)].pos
    }

    pub fn rho(&self, j: usize) -> f64 {
        self.rho[j]
    }

    pub fn newest_first(&self) -> impl DoubleEndedIterator<Item = usize> {
        0..=self.lastj
    }

    pub fn oldest_first(&self) -> impl Iterator<Item = usize> {
        self.newest_first().rev()
    }

    /// Makes room for the next point: one more pair is kept (up to `m`),
    /// the head moves back one slot, and `rho` shifts with it.
    pub fn advance(&mut self) {
        if self.m == 0 {
            return;
        }
        self.lastj = (self.lastj + 1).min(self.m - 1);
        self.origin = (self.origin + self.m - 1) % self.m;
        for j in (1..=self.lastj).rev() {
            self.rho[j] = self.rho[j - 1];
        }
    }
}
