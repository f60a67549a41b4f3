use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use log::info;
use ndarray::Array2;
use serde::Deserialize;

use finetune::loss::Loss;
use finetune::{
    make_weighted_loss, AssemblyConfig, BuiltinBackbone, ClassWeights, CompiledModel, ModelAssembler,
    ModelManager,
};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON file overriding the assembly policy (head shape, unfreeze count, compile spec)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Download and verify the pretrained backbone weights
    Fetch {
        /// Force a fresh download of the weights
        #[arg(short, long)]
        fresh: bool,
    },
    /// Assemble a fresh model on the pretrained backbone and save it
    Build {
        #[arg(long, value_enum, default_value_t = Variant::Frozen)]
        variant: Variant,
        #[arg(short, long)]
        out: PathBuf,
    },
    /// Reload a checkpoint, unfreeze its last layers, and save it again
    Finetune {
        #[arg(long)]
        checkpoint: PathBuf,
        #[arg(short, long)]
        out: PathBuf,
    },
    /// Print the layer table of a checkpoint
    Summary {
        #[arg(long)]
        checkpoint: PathBuf,
    },
    /// Compute per-sample weighted loss for a JSON batch {"y_true": [[..]], "y_pred": [[..]]}
    Loss {
        /// Class weights; defaults to the reference imbalance weights
        #[arg(long, value_delimiter = ',')]
        weights: Option<Vec<f32>>,
        #[arg(long)]
        batch: PathBuf,
    },
    /// Derive balanced class weights from per-class sample counts
    ClassWeights {
        #[arg(long, value_delimiter = ',', required = true)]
        counts: Vec<usize>,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Variant {
    /// Backbone frozen, head trainable
    Frozen,
    /// Every layer trainable
    Unfrozen,
}

#[derive(Deserialize)]
struct Batch {
    y_true: Vec<Vec<f32>>,
    y_pred: Vec<Vec<f32>>,
}

fn to_matrix(rows: Vec<Vec<f32>>, what: &str) -> Result<Array2<f32>> {
    let n = rows.len();
    let c = rows.first().map_or(0, Vec::len);
    if rows.iter().any(|r| r.len() != c) {
        bail!("{} rows must all have {} columns", what, c);
    }
    Array2::from_shape_vec((n, c), rows.into_iter().flatten().collect())
        .with_context(|| format!("building {} matrix", what))
}

fn load_config(path: Option<&Path>) -> Result<AssemblyConfig> {
    match path {
        Some(path) => AssemblyConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display())),
        None => Ok(AssemblyConfig::default()),
    }
}

fn report(model: &CompiledModel) {
    let (trainable, frozen) = model.parameter_counts();
    info!(
        "{} layers ({} trainable), {} trainable / {} frozen params",
        model.layers().len(),
        model.trainable_layer_count(),
        trainable,
        frozen
    );
}

async fn fetch(fresh: bool) -> Result<()> {
    let manager = ModelManager::new_default()?;
    let backbone = BuiltinBackbone::Xception.get_backbone_info()?;

    if fresh {
        info!("Fresh download requested - removing any existing weights...");
        manager.remove_download(&backbone.name)?;
    }
    manager.ensure_backbone_downloaded(&backbone).await?;
    println!("Backbone ready at {}", manager.get_model_path(&backbone.name).display());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    let start_time = Instant::now();

    let config = load_config(args.config.as_deref())?;
    let assembler = ModelAssembler::new().with_config(config)?;

    match args.command {
        Command::Fetch { fresh } => fetch(fresh).await?,
        Command::Build { variant, out } => {
            let manager = ModelManager::new_default()?;
            let model = match variant {
                Variant::Frozen => assembler.build_fresh_pretrained(&manager).await?,
                Variant::Unfrozen => assembler.build_fresh_unfrozen(&manager).await?,
            };
            report(&model);
            model.save(&out)?;
            println!("Saved {:?} model to {}", variant, out.display());
        }
        Command::Finetune { checkpoint, out } => {
            let model = assembler.build_from_checkpoint(&checkpoint)?;
            report(&model);
            model.save(&out)?;
            println!("Saved fine-tuning model to {}", out.display());
        }
        Command::Summary { checkpoint } => {
            let model = finetune::classifier::checkpoint::load(&checkpoint, &Default::default())?;
            println!("{}", model.summary());
        }
        Command::Loss { weights, batch } => {
            let weights = weights.unwrap_or_else(|| ClassWeights::reference().into());
            let loss = make_weighted_loss(weights)?;
            let text = std::fs::read_to_string(&batch)
                .with_context(|| format!("reading batch {}", batch.display()))?;
            let parsed: Batch = serde_json::from_str(&text).context("parsing batch JSON")?;
            let y_true = to_matrix(parsed.y_true, "y_true")?;
            let y_pred = to_matrix(parsed.y_pred, "y_pred")?;

            let values = loss.compute(y_true.view(), y_pred.view())?;
            for (i, value) in values.iter().enumerate() {
                println!("sample {}: {:.6}", i, value);
            }
            println!("mean: {:.6}", values.mean().unwrap_or(0.0));
        }
        Command::ClassWeights { counts } => {
            let weights = ClassWeights::balanced(&counts)?;
            let rendered: Vec<String> = weights.as_slice().iter().map(|w| format!("{:.4}", w)).collect();
            println!("{}", rendered.join(","));
        }
    }

    info!("Done in {:.2?}", start_time.elapsed());
    Ok(())
}
