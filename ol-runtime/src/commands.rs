use crate::{
    generate::{generate, GenerateSettings, GroundTruth},
    model_file::{load_model, ModelFile},
    parser::parse_reader,
    producer::{spawn_producer, CHANNEL_CAPACITY},
};
use anyhow::{anyhow, Result};
use ol_core::{Predictor, TrainSummary, Trainer, TrainerConfig, TreeAllReduce};
use std::{
    fs::File,
    io::{self, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};
use tracing::{info, Level};

pub fn init_logging(level: Level) {
    // A second init (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

#[derive(Debug, Clone, Default)]
pub struct TrainOptions {
    pub output: Option<PathBuf>,
    pub predictions: Option<PathBuf>,
    pub compress: bool,
    pub no_bias: bool,
}

pub fn train(config: TrainerConfig, data: &Path, options: &TrainOptions) -> Result<TrainSummary> {
    let passes = config.passes_needed();
    let mut trainer = Trainer::new(config.clone())?;
    if let Some(cluster) = &config.cluster {
        trainer = trainer.with_reducer(Box::new(TreeAllReduce::connect(cluster)?));
    }
    if let Some(path) = &options.output {
        trainer = trainer.with_checkpoint(Box::new(ModelFile::new(path.clone(), options.compress)));
    }

    let (mut source, producer) =
        spawn_producer(data.to_path_buf(), passes, !options.no_bias, CHANNEL_CAPACITY);
    let summary = trainer.run(&mut source)?;
    drop(source);
    let stats = producer
        .join()
        .map_err(|_| anyhow!("Example producer panicked"))??;
    info!(
        "trained on {} examples ({} skipped) for {} passes, average loss {:.6}",
        stats.examples, stats.skipped, summary.passes, summary.average_loss
    );

    if let Some(path) = &options.predictions {
        let predictor = Predictor::from_model(&summary.model)?;
        let mut out = BufWriter::new(File::create(path)?);
        write_predictions(&predictor, data, !options.no_bias, &mut out)?;
    }
    Ok(summary)
}

/// One line per example: the prediction, then the tag if there is one.
pub fn write_predictions<W: Write>(
    predictor: &Predictor,
    data: &Path,
    add_constant: bool,
    out: &mut W,
) -> Result<usize> {
    let file =
        File::open(data).map_err(|e| anyhow!("Failed to open '{}': {}", data.display(), e))?;
    let mut written = 0;
    let mut result = Ok(());
    parse_reader(BufReader::new(file), add_constant, |ex| {
        let p = predictor.predict(&ex);
        result = match &ex.tag {
            Some(tag) => writeln!(out, "{} {}", p, tag),
            None => writeln!(out, "{}", p),
        };
        written += 1;
        result.is_ok()
    })?;
    result?;
    out.flush()?;
    Ok(written)
}

pub fn predict(model: &Path, data: &Path, predictions: Option<&Path>) -> Result<usize> {
    let model = load_model(model)?;
    let predictor = Predictor::from_model(&model)?;
    match predictions {
        Some(path) => {
            let mut out = BufWriter::new(File::create(path)?);
            write_predictions(&predictor, data, true, &mut out)
        }
        None => write_predictions(&predictor, data, true, &mut io::stdout().lock()),
    }
}

pub fn generate_data(
    settings: &GenerateSettings,
    seed: &str,
    output: Option<&Path>,
) -> Result<GroundTruth> {
    match output {
        Some(path) => {
            let mut out = BufWriter::new(File::create(path)?);
            let truth = generate(settings, seed, &mut out)?;
            out.flush()?;
            Ok(truth)
        }
        None => generate(settings, seed, &mut io::stdout().lock()),
    }
}
