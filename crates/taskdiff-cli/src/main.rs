//! taskdiff CLI - apply a scaled task vector to a model checkpoint.

use std::io::IsTerminal;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use taskdiff_core::Device;
use taskdiff_merge::{
    run_apply_diff, ApplyObserver, ApplyReport, DiffBuilder, DiffConfig, TracingObserver,
};

#[derive(Parser)]
#[command(name = "taskdiff")]
#[command(author, version, about = "Task-vector arithmetic for LLM checkpoints", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add alpha * (source - base) to target and save the result
    Apply {
        /// Path to run configuration file (YAML)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Fine-tuned model (HuggingFace ID or local path)
        #[arg(short, long)]
        source: Option<String>,

        /// Base model the source was fine-tuned from
        #[arg(short, long)]
        base: Option<String>,

        /// Model receiving the task vector
        #[arg(short, long)]
        target: Option<String>,

        /// Output directory
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Task vector scale factor (default 1.0)
        #[arg(short, long, allow_negative_numbers = true)]
        alpha: Option<f64>,

        /// Compute device: cpu, cuda[:N], mps, metal[:N]
        #[arg(short, long)]
        device: Option<Device>,

        /// HuggingFace token (falls back to HF_TOKEN)
        #[arg(long)]
        hf_token: Option<String>,

        /// Maximum size of one output safetensors file, in bytes
        #[arg(long)]
        max_shard_size: Option<u64>,

        /// Skip copying tokenizer files from the source model
        #[arg(long)]
        no_tokenizer: bool,
    },
}

fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Apply {
            config,
            source,
            base,
            target,
            output,
            alpha,
            device,
            hf_token,
            max_shard_size,
            no_tokenizer,
        } => {
            let mut builder = match config {
                Some(path) => {
                    tracing::info!("Loading configuration from {:?}", path);
                    DiffBuilder::from_config(DiffConfig::from_yaml_file(&path)?)
                }
                None => DiffBuilder::new(),
            };

            if let Some(source) = source {
                builder = builder.source(source);
            }
            if let Some(base) = base {
                builder = builder.base(base);
            }
            if let Some(target) = target {
                builder = builder.target(target);
            }
            if let Some(output) = output {
                builder = builder.output(output);
            }
            if let Some(alpha) = alpha {
                builder = builder.alpha(alpha);
            }
            if let Some(device) = device {
                builder = builder.device(device);
            }
            if let Some(token) = hf_token {
                builder = builder.hf_token(token);
            }
            if let Some(bytes) = max_shard_size {
                builder = builder.max_shard_size(bytes);
            }
            if no_tokenizer {
                builder = builder.copy_tokenizer(false);
            }

            run_apply(&builder.build()?)
        }
    }
}

/// Run a task-vector application with a progress bar.
fn run_apply(config: &DiffConfig) -> anyhow::Result<()> {
    println!("========================================");
    println!("  taskdiff: target += alpha * (source - base)");
    println!("========================================");
    println!("Source:   {}", config.source);
    println!("Base:     {}", config.base);
    println!("Target:   {}", config.target);
    println!("Alpha:    {}", config.alpha);
    println!("Device:   {}", config.device);
    println!("Output:   {}", config.output_path.display());
    println!("========================================\n");

    // Log lines instead of a bar when stderr is redirected
    let report = if std::io::stderr().is_terminal() {
        run_apply_diff(config, &mut ProgressObserver::new()?)?
    } else {
        run_apply_diff(config, &mut TracingObserver::default())?
    };

    print_summary(&report);
    Ok(())
}

fn print_summary(report: &ApplyReport) {
    println!("\n========================================");
    println!("  Task Vector Applied");
    println!("========================================");
    println!("Tensors:    {}", report.tensors_applied);
    println!("Files:      {}", report.weight_files.len());
    println!(
        "Tokenizer:  {}",
        if report.tokenizer_copied() {
            "copied"
        } else {
            "not copied"
        }
    );
    println!("Output:     {}", report.output_path.display());
    println!("========================================");
}

/// Renders apply progress as a terminal progress bar.
struct ProgressObserver {
    bar: ProgressBar,
}

impl ProgressObserver {
    fn new() -> anyhow::Result<Self> {
        let bar = ProgressBar::hidden();
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")?
                .progress_chars("#>-"),
        );
        Ok(Self { bar })
    }
}

impl ApplyObserver for ProgressObserver {
    fn on_start(&mut self, total: usize) {
        self.bar.set_length(total as u64);
        self.bar.set_draw_target(ProgressDrawTarget::stderr());
    }

    fn on_tensor(&mut self, name: &str) {
        self.bar.set_message(name.to_string());
        self.bar.inc(1);
    }

    fn on_finish(&mut self) {
        self.bar.finish_with_message("done");
    }
}
