//! Haagenti Importance-Matrix Tool
//!
//! Merges importance matrices from independent calibration runs and reports
//! layer importance scores. Collection itself runs inside a model runtime
//! that drives [`haagenti_imatrix::run_session`]; its settings (output
//! projection, checkpoint frequencies, chunking, perplexity) come from the
//! `--config` file and have no effect here.
//!
//! ## Usage
//!
//! ```bash
//! # Merge two runs into one matrix
//! haagenti-imatrix --in-file a.dat --in-file b.dat -o merged.dat
//!
//! # Print LIM scores of a saved matrix
//! haagenti-imatrix --in-file merged.dat --lim
//!
//! # Settings from a JSON file, CLI flags take precedence
//! haagenti-imatrix --config imatrix.json --in-file a.dat
//! ```

use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use haagenti_imatrix::{Collector, ImatrixConfig};

#[derive(Parser, Debug)]
#[command(name = "haagenti-imatrix")]
#[command(author = "Daemoniorum LLC")]
#[command(version)]
#[command(about = "Merge saved importance matrices and report layer importance", long_about = None)]
struct Args {
    /// Output file
    #[arg(short, long)]
    output: Option<String>,

    /// Saved matrix to merge (repeatable)
    #[arg(long = "in-file")]
    in_files: Vec<String>,

    /// 0 = quiet, 1 = report saves
    #[arg(long)]
    verbosity: Option<u32>,

    /// Report layer importance scores
    #[arg(long)]
    lim: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    /// Settings from `--config` (or defaults) with CLI flags applied on top.
    fn into_config(self) -> haagenti_imatrix::Result<ImatrixConfig> {
        let mut config = match &self.config {
            Some(path) => ImatrixConfig::from_file(path)?,
            None => ImatrixConfig::default(),
        };

        if let Some(output) = self.output {
            config.out_file = output;
        }
        config.in_files.extend(self.in_files);
        if let Some(v) = self.verbosity {
            config.verbosity = v;
        }
        config.compute_lim |= self.lim;

        config.validate()?;
        Ok(config)
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    let config = args.into_config()?;
    if config.in_files.is_empty() {
        return Err("no input files given (use --in-file)".into());
    }

    let compute_lim = config.compute_lim;
    let collector = Collector::new(config);
    collector.load_inputs()?;

    let summary = collector.save(None)?;
    info!(
        "saved {} of {} entries to '{}'",
        summary.stored,
        summary.total,
        summary.path.display()
    );

    if compute_lim {
        print!("{}", collector.lim_report());
    }

    Ok(())
}
