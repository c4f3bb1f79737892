//! Train a [`LinearRanker`] on a pair corpus.
//!
//! ```text
//! train_pairs --corpus train.csv --validation-corpus val.csv --items ./raw --config run.json
//! ```
//!
//! Without `--items`, item tensors are generated deterministically from their names, which is
//! enough to exercise the whole pipeline end to end.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use aquila::data::{ItemLoader, PairIndex, QueuePipeline, RawItemLoader, SyntheticItemLoader};
use aquila::logging::init_tracing;
use aquila::optim::RmsProp;
use aquila::{Trainer, TrainingConfig};
use aquila_demos::LinearRanker;
use clap::Parser;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "train_pairs", about = "Multi-replica pairwise ranking training")]
struct Args {
    /// Training pair corpus (`a,b,<G counts a>,<G counts b>` per line).
    #[arg(long)]
    corpus: PathBuf,

    /// Validation pair corpus.
    #[arg(long)]
    validation_corpus: Option<PathBuf>,

    /// Directory of raw little-endian f32 item files. Synthetic items when absent.
    #[arg(long)]
    items: Option<PathBuf>,

    /// JSON training configuration; omitted fields take their defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    train_dir: Option<PathBuf>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    replicas: Option<usize>,

    #[arg(long)]
    epochs: Option<usize>,

    #[arg(long)]
    groups: Option<usize>,

    /// Stop after this many steps regardless of the epoch settings.
    #[arg(long)]
    max_steps: Option<u64>,

    #[arg(long)]
    seed: Option<u64>,

    /// Write the effective configuration here before training.
    #[arg(long)]
    dump_config: Option<PathBuf>,
}

impl Args {
    fn training_config(&self) -> Result<TrainingConfig> {
        let mut config = match &self.config {
            Some(path) => TrainingConfig::from_json_file(path)?,
            None => TrainingConfig::default(),
        };
        if let Some(dir) = &self.train_dir {
            config.train_dir = dir.clone();
        }
        if let Some(b) = self.batch_size {
            config.batch_size = b;
        }
        if let Some(r) = self.replicas {
            config.replica_count = r;
        }
        if let Some(e) = self.epochs {
            config.epoch_count = e;
        }
        if let Some(g) = self.groups {
            config.num_groups = g;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        config.validate()?;
        Ok(config)
    }
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let config = args.training_config()?;
    if let Some(path) = &args.dump_config {
        config.to_json_file(path)?;
    }

    let train_index = Arc::new(
        PairIndex::from_path(&args.corpus, config.num_groups)
            .with_context(|| format!("loading corpus {}", args.corpus.display()))?,
    );
    info!(
        items = train_index.len(),
        pairs = train_index.pair_count(),
        groups = train_index.groups(),
        "training corpus loaded"
    );

    let loader: Arc<dyn ItemLoader> = match &args.items {
        Some(root) => Arc::new(RawItemLoader::new(root, config.item_shape)),
        None => Arc::new(SyntheticItemLoader::new(config.item_shape)),
    };

    let examples_per_epoch = config.examples_per_epoch.unwrap_or(train_index.len());
    let train = QueuePipeline::new(
        "train",
        config.pipeline_config(config.epoch_count, examples_per_epoch),
        train_index,
        Arc::clone(&loader),
    )?;

    let max_steps = args.max_steps.unwrap_or(config.max_steps(examples_per_epoch));
    if max_steps == 0 {
        bail!(
            "{examples_per_epoch} examples x {} epochs is less than one step of {} examples",
            config.epoch_count,
            config.global_batch_size()
        );
    }

    let validation = match &args.validation_corpus {
        Some(path) => {
            let index = Arc::new(
                PairIndex::from_path(path, config.num_groups)
                    .with_context(|| format!("loading validation corpus {}", path.display()))?,
            );
            // Enough validation batches for every pass the run will make.
            let passes = max_steps / config.validate_every + 1;
            let needed = passes as usize * config.global_batch_size();
            let epochs = needed.div_ceil(index.len().max(1));
            let pipeline_config = config.pipeline_config(epochs, index.len());
            Some(QueuePipeline::new("validation", pipeline_config, index, loader)?)
        }
        None => None,
    };

    let model = LinearRanker::new(config.num_groups, config.item_shape[2]);
    let optimizer = RmsProp::new(config.rmsprop_decay, config.momentum, config.epsilon);
    let mut trainer =
        Trainer::new(config, model, optimizer, train, validation)?.with_max_steps(max_steps);

    let summary = trainer.run()?;
    info!(
        steps = summary.steps_run,
        reason = ?summary.stop_reason,
        loss = summary.snapshot.smoothed_loss,
        accuracy = summary.snapshot.smoothed_accuracy,
        validation = ?summary.snapshot.validation_accuracy,
        "done"
    );
    for path in &summary.checkpoints {
        println!("{}", path.display());
    }
    Ok(())
}
