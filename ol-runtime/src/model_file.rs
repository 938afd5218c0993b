use anyhow::Result;
use ol_core::{Checkpoint, Model};
use std::path::{Path, PathBuf};
use tracing::info;

/// Writes predictors to `path`, per-pass checkpoints to `path.<pass>`.
#[derive(Debug, Clone)]
pub struct ModelFile {
    path: PathBuf,
    compress: bool,
}

impl ModelFile {
    pub fn new(path: PathBuf, compress: bool) -> Self {
        Self { path, compress }
    }

    pub fn path_for(&self, pass: Option<usize>) -> PathBuf {
        match pass {
            Some(pass) => PathBuf::from(format!("{}.{}", self.path.display(), pass)),
            None => self.path.clone(),
        }
    }
}

impl Checkpoint for ModelFile {
    fn save_predictor(&mut self, model: &Model, pass: Option<usize>) -> Result<()> {
        let path = self.path_for(pass);
        ol_utils::write_obj(&path, model, self.compress)?;
        info!(
            "saved model with {} non-zero weights to {}",
            model.weights.len(),
            path.display()
        );
        Ok(())
    }
}

pub fn load_model(path: &Path) -> Result<Model> {
    ol_utils::read_obj(path)
}
