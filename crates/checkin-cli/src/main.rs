use anyhow::{Context, Result};
use checkin_core::checkpoint::Checkpoint;
use checkin_core::{CheckinPipeline, Config, DistanceMetric, NoFacePolicy};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "checkin", about = "Contactless check-in face recognition CLI")]
struct Cli {
    /// Root for dataset, models and artifacts (overrides CHECKIN_DATA_DIR)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Directory holding det_10g.onnx, w600k_r50.onnx and yolov8n.onnx
    #[arg(long, global = true)]
    model_dir: Option<PathBuf>,

    /// Image decode workers
    #[arg(long, global = true)]
    workers: Option<usize>,

    /// Verification metric: euclidean or cosine
    #[arg(long, global = true)]
    metric: Option<DistanceMetric>,

    /// Verification distance threshold
    #[arg(long, global = true)]
    threshold: Option<f32>,

    /// What to report when no face is found: fail or unknown
    #[arg(long, global = true)]
    no_face: Option<NoFacePolicy>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train the classifier head on the dataset directory
    Train {
        #[arg(long)]
        epochs: Option<usize>,
        #[arg(long)]
        lr: Option<f32>,
        #[arg(long)]
        momentum: Option<f32>,
        /// Start from the saved classifier instead of fresh weights
        #[arg(long = "continue")]
        continue_training: bool,
        /// Stop after this many epochs without loss improvement
        #[arg(long)]
        patience: Option<usize>,
    },
    /// Identify the person in a cropped image
    Identify { image: PathBuf },
    /// Detect people in a photo and identify each of them
    Detect { photo: PathBuf },
    /// Decide whether two images show the same person
    Verify { a: PathBuf, b: PathBuf },
    /// Compare an image with an enrolled person's reference photo
    VerifyPerson { image: PathBuf, person: String },
    /// Compare every dataset image with its identity's reference photo
    VerifyDataset,
    /// Add a photo to a person's dataset folder
    Enroll { image: PathBuf, person: String },
    /// List the people the saved classifier knows
    Labels,
}

fn print<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn config(cli: &Cli) -> Result<Config> {
    let mut config = Config::load().context("loading configuration")?;
    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }
    if let Some(dir) = &cli.model_dir {
        config.model_dir = Some(dir.clone());
    }
    if let Some(workers) = cli.workers {
        config.workers = workers;
    }
    if let Some(metric) = cli.metric {
        config.distance_metric = metric;
    }
    if let Some(threshold) = cli.threshold {
        config.verify_threshold = threshold;
    }
    if let Some(policy) = cli.no_face {
        config.no_face_policy = policy;
    }
    config.validate()?;
    tracing::debug!(data_dir = %config.data_dir.display(), "configuration resolved");
    Ok(config)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = config(&cli)?;
    let open = |config: Config| -> Result<CheckinPipeline> {
        CheckinPipeline::from_config(config).context("loading models")
    };

    match cli.command {
        Commands::Train {
            epochs,
            lr,
            momentum,
            continue_training,
            patience,
        } => {
            let mut config = config;
            if patience.is_some() {
                config.training.early_stop_patience = patience;
            }
            let mut overrides = HashMap::new();
            if let Some(v) = epochs {
                overrides.insert("NUM_EPOCHS".to_string(), v.to_string());
            }
            if let Some(v) = lr {
                overrides.insert("LEARNING_RATE".to_string(), v.to_string());
            }
            if let Some(v) = momentum {
                overrides.insert("MOMENTUM".to_string(), v.to_string());
            }

            let mut pipeline = open(config)?;
            let report = pipeline.train_from_dataset(&overrides, continue_training)?;
            if let Some(features) = pipeline.features() {
                for skipped in &features.skipped {
                    eprintln!("skipped {}: {}", skipped.path.display(), skipped.reason);
                }
            }
            print(&report)?;
            eprintln!("checkpoint: {}", pipeline.config().classifier_path().display());
        }
        Commands::Identify { image } => print(&open(config)?.identify(&image)?)?,
        Commands::Detect { photo } => print(&open(config)?.process_photo(&photo)?)?,
        Commands::Verify { a, b } => print(&open(config)?.verify(&a, &b)?)?,
        Commands::VerifyPerson { image, person } => {
            print(&open(config)?.verify_person(&image, &person)?)?
        }
        Commands::VerifyDataset => {
            let mut pipeline = open(config)?;
            let summary = pipeline.verify_dataset()?;
            let log = pipeline.save_verification_log()?;
            print(&summary)?;
            eprintln!("verification log: {}", log.display());
        }
        Commands::Enroll { image, person } => {
            let saved = open(config)?.enroll_file(&image, &person)?;
            println!("{}", saved.display());
        }
        Commands::Labels => {
            // Reads the checkpoint only; no models are loaded.
            let ckpt = Checkpoint::load(&config.classifier_path())?;
            print(&ckpt.labels)?;
        }
    }

    Ok(())
}
