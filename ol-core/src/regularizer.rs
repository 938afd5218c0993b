use crate::{error::TrainError, weights::WeightStore};
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Per-feature L2 penalty `0.5 * strength[i] * (w_i - prior[i])^2`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Regularizers {
    pub num_bits: u32,
    pub strength: Vec<f32>,
    pub prior: Vec<f32>,
}

fn alloc_zeroed(len: usize, num_bits: u32) -> Result<Vec<f32>, TrainError> {
    let mut v = Vec::new();
    v.try_reserve_exact(len)
        .map_err(|_| TrainError::Allocation {
            what: "regularizers array",
            num_bits,
        })?;
    v.resize(len, 0.0);
    Ok(v)
}

impl Regularizers {
    pub fn zeros(num_bits: u32) -> Result<Self, TrainError> {
        let len = 1usize << num_bits;
        Ok(Self {
            num_bits,
            strength: alloc_zeroed(len, num_bits)?,
            prior: alloc_zeroed(len, num_bits)?,
        })
    }

    /// Turns the raw diagonal curvature measured at the current weights into
    /// a regularizer centred on them, so a later run can be anchored here.
    /// `strength = cond + lambda`, or `cond` on top of the loaded strength.
    pub fn from_preconditioner(
        store: &WeightStore,
        lambda: f32,
        existing: Option<&Regularizers>,
    ) -> Result<Self, TrainError> {
        let mut regs = match existing {
            Some(r) => r.clone(),
            None => {
                let mut r = Self::zeros(store.num_bits())?;
                r.strength.iter_mut().for_each(|s| *s = lambda);
                r
            }
        };
        for (i, c) in store.cells().iter().enumerate() {
            regs.strength[i] += c.cond;
            regs.prior[i] = c.weight;
        }
        Ok(regs)
    }

    pub fn load(path: &Path, num_bits: u32) -> Result<Self> {
        let regs: Regularizers = ol_utils::read_obj(path)?;
        let len = 1usize << num_bits;
        if regs.num_bits != num_bits || regs.strength.len() != len || regs.prior.len() != len {
            return Err(anyhow!(
                "Regularizer file '{}' was written for num_bits = {}, expected {}",
                path.display(),
                regs.num_bits,
                num_bits
            ));
        }
        Ok(regs)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        ol_utils::write_obj(path, self, true)
    }
}
