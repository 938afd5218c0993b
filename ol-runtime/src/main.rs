use anyhow::{anyhow, Result};
use clap::{arg, ArgAction, ArgMatches, Command};
use ol_core::TrainerConfig;
use ol_runtime::{generate::GenerateSettings, init_logging, TrainOptions};
use std::path::PathBuf;
use tracing::Level;

fn log_arg() -> clap::Arg {
    arg!(--log [LEVEL] "Log level")
        .default_value("info")
        .value_parser(["error", "warn", "info", "debug", "trace"])
}

fn cli() -> Command {
    Command::new("ol-runtime")
        .about("Trains and applies L-BFGS linear models")
        .arg_required_else_help(true)
        .subcommand(
            Command::new("train")
                .about("Trains a model over several passes of a data file")
                .arg(
                    arg!(<SETTINGS> "Settings json string or path to json file")
                        .value_parser(clap::value_parser!(String)),
                )
                .arg(
                    arg!(<DATA> "Path to a data file in text format")
                        .value_parser(clap::value_parser!(PathBuf)),
                )
                .arg(
                    arg!(--output [MODEL_FILE] "If set, the final model is saved to this file path (default json)")
                        .value_parser(clap::value_parser!(PathBuf)),
                )
                .arg(
                    arg!(--predictions [PREDICTIONS_FILE] "If set, predictions of the final model on DATA are written here")
                        .value_parser(clap::value_parser!(PathBuf)),
                )
                .arg(
                    arg!(--compress [COMPRESS] "If output file is set, the model will be compressed as zlib")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    arg!(--no_bias [NO_BIAS] "Do not add the constant feature")
                        .action(ArgAction::SetTrue),
                )
                .arg(log_arg()),
        )
        .subcommand(
            Command::new("predict")
                .about("Scores a data file with a saved model")
                .arg(
                    arg!(<MODEL> "Path to a model file")
                        .value_parser(clap::value_parser!(PathBuf)),
                )
                .arg(
                    arg!(<DATA> "Path to a data file in text format")
                        .value_parser(clap::value_parser!(PathBuf)),
                )
                .arg(
                    arg!(--predictions [PREDICTIONS_FILE] "Where to write predictions (default stdout)")
                        .value_parser(clap::value_parser!(PathBuf)),
                )
                .arg(log_arg()),
        )
        .subcommand(
            Command::new("generate")
                .about("Generates a synthetic data set")
                .arg(
                    arg!(<NUM_EXAMPLES> "Number of examples")
                        .value_parser(clap::value_parser!(usize)),
                )
                .arg(
                    arg!(<SEED> "A string used in seed generation")
                        .value_parser(clap::value_parser!(String)),
                )
                .arg(
                    arg!(--output [OUTPUT_FILE] "Where to write the data (default stdout)")
                        .value_parser(clap::value_parser!(PathBuf)),
                )
                .arg(
                    arg!(--num_features [NUM_FEATURES] "Features per example")
                        .default_value("10")
                        .value_parser(clap::value_parser!(usize)),
                )
                .arg(
                    arg!(--noise [NOISE] "Standard deviation of the label noise")
                        .default_value("0.1")
                        .value_parser(clap::value_parser!(f64)),
                )
                .arg(
                    arg!(--logistic [LOGISTIC] "Generate +1/-1 labels")
                        .action(ArgAction::SetTrue),
                ),
        )
}

fn log_level(sub_m: &ArgMatches) -> Result<Level> {
    sub_m
        .get_one::<String>("log")
        .unwrap()
        .parse::<Level>()
        .map_err(|e| anyhow!("Invalid log level: {}", e))
}

fn main() {
    let matches = cli().get_matches();

    if let Err(e) = match matches.subcommand() {
        Some(("train", sub_m)) => train(
            sub_m.get_one::<String>("SETTINGS").unwrap().clone(),
            sub_m.get_one::<PathBuf>("DATA").unwrap().clone(),
            TrainOptions {
                output: sub_m.get_one::<PathBuf>("output").cloned(),
                predictions: sub_m.get_one::<PathBuf>("predictions").cloned(),
                compress: *sub_m.get_one::<bool>("compress").unwrap(),
                no_bias: *sub_m.get_one::<bool>("no_bias").unwrap(),
            },
            log_level(sub_m),
        ),
        Some(("predict", sub_m)) => predict(
            sub_m.get_one::<PathBuf>("MODEL").unwrap().clone(),
            sub_m.get_one::<PathBuf>("DATA").unwrap().clone(),
            sub_m.get_one::<PathBuf>("predictions").cloned(),
            log_level(sub_m),
        ),
        Some(("generate", sub_m)) => generate(
            GenerateSettings {
                num_examples: *sub_m.get_one::<usize>("NUM_EXAMPLES").unwrap(),
                num_features: *sub_m.get_one::<usize>("num_features").unwrap(),
                noise: *sub_m.get_one::<f64>("noise").unwrap(),
                logistic: *sub_m.get_one::<bool>("logistic").unwrap(),
            },
            sub_m.get_one::<String>("SEED").unwrap().clone(),
            sub_m.get_one::<PathBuf>("output").cloned(),
        ),
        _ => Err(anyhow!("Invalid subcommand")),
    } {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn train(
    settings: String,
    data: PathBuf,
    options: TrainOptions,
    level: Result<Level>,
) -> Result<()> {
    let config: TrainerConfig = ol_utils::load_json_or_path(&settings)?;
    init_logging(if config.quiet { Level::WARN } else { level? });
    ol_runtime::train(config, &data, &options)?;
    Ok(())
}

fn predict(
    model: PathBuf,
    data: PathBuf,
    predictions: Option<PathBuf>,
    level: Result<Level>,
) -> Result<()> {
    init_logging(level?);
    let count = ol_runtime::predict(&model, &data, predictions.as_deref())?;
    tracing::info!("wrote {} predictions", count);
    Ok(())
}

fn generate(settings: GenerateSettings, seed: String, output: Option<PathBuf>) -> Result<()> {
    let truth = ol_runtime::generate_data(&settings, &seed, output.as_deref())?;
    eprintln!("{}", ol_utils::jsonify(&truth)?);
    Ok(())
}
