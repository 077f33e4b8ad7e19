//! Collection configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::{ImatrixError, Result};

/// File written when no output path is configured.
pub const DEFAULT_OUT_FILE: &str = "imatrix.dat";

/// Importance-matrix collection configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImatrixConfig {
    /// Output path for snapshots and the final save
    #[serde(default = "default_out_file")]
    pub out_file: String,

    /// Previously saved matrices merged before collection starts
    #[serde(default)]
    pub in_files: Vec<String>,

    /// Calibration text file name, recorded in the saved trailer
    #[serde(default)]
    pub prompt_file: String,

    /// Also collect the output projection
    #[serde(default)]
    pub process_output: bool,

    /// Name of the output projection tensor
    #[serde(default = "default_output_tensor_name")]
    pub output_tensor_name: String,

    /// 0 = quiet, 1 = report saves, 2+ = trace every collected node
    #[serde(default = "default_verbosity")]
    pub verbosity: u32,

    /// Snapshot to `out_file` every this many calls
    #[serde(default = "default_out_freq")]
    pub out_freq: u32,

    /// Numbered checkpoint every this many calls (0 disables)
    #[serde(default)]
    pub save_freq: u32,

    /// Leading chunks skipped before collection
    #[serde(default)]
    pub skip_chunks: usize,

    /// Upper bound on processed chunks (all when unset)
    #[serde(default)]
    pub n_chunks: Option<usize>,

    /// Tokens per evaluated chunk; must match the runtime context
    #[serde(default = "default_n_ctx")]
    pub n_ctx: usize,

    /// Tokens per batch handed to the decoder (clamped to `n_ctx`)
    #[serde(default = "default_n_batch")]
    pub n_batch: usize,

    /// Evaluate perplexity while collecting
    #[serde(default = "default_compute_ppl")]
    pub compute_ppl: bool,

    /// Report layer importance scores after collection
    #[serde(default)]
    pub compute_lim: bool,

    /// Smallest row count a dense multiply needs to be collected
    #[serde(default = "default_min_batch_rows")]
    pub min_batch_rows: usize,

    /// Threads scanning logits (hardware concurrency when unset)
    #[serde(default)]
    pub threads: Option<usize>,
}

impl Default for ImatrixConfig {
    fn default() -> Self {
        Self {
            out_file: default_out_file(),
            in_files: Vec::new(),
            prompt_file: String::new(),
            process_output: false,
            output_tensor_name: default_output_tensor_name(),
            verbosity: default_verbosity(),
            out_freq: default_out_freq(),
            save_freq: 0,
            skip_chunks: 0,
            n_chunks: None,
            n_ctx: default_n_ctx(),
            n_batch: default_n_batch(),
            compute_ppl: default_compute_ppl(),
            compute_lim: false,
            min_batch_rows: default_min_batch_rows(),
            threads: None,
        }
    }
}

impl ImatrixConfig {
    /// Load from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&content)
    }

    /// Parse from a JSON string.
    pub fn from_json(content: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(content).map_err(|e| ImatrixError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the collector cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.out_freq == 0 {
            return Err(ImatrixError::Config("out_freq must be positive".into()));
        }
        if self.n_ctx == 0 {
            return Err(ImatrixError::Config("n_ctx must be positive".into()));
        }
        if self.n_batch == 0 {
            return Err(ImatrixError::Config("n_batch must be positive".into()));
        }
        if self.threads == Some(0) {
            return Err(ImatrixError::Config("threads must be positive".into()));
        }
        Ok(())
    }

    /// Batch size actually used: `n_batch` clamped to `n_ctx`.
    pub fn effective_batch(&self) -> usize {
        self.n_batch.min(self.n_ctx).max(1)
    }

    /// Save path: `out_file`, suffixed with `.at_<ncall>` for numbered checkpoints.
    pub fn output_path(&self, ncall: Option<u32>) -> PathBuf {
        let base = if self.out_file.is_empty() {
            DEFAULT_OUT_FILE
        } else {
            self.out_file.as_str()
        };
        match ncall {
            Some(n) if n > 0 => PathBuf::from(format!("{}.at_{}", base, n)),
            _ => PathBuf::from(base),
        }
    }
}

fn default_out_file() -> String {
    DEFAULT_OUT_FILE.to_string()
}

fn default_output_tensor_name() -> String {
    "output.weight".to_string()
}

fn default_verbosity() -> u32 {
    1
}

fn default_out_freq() -> u32 {
    10
}

fn default_n_ctx() -> usize {
    512
}

fn default_n_batch() -> usize {
    512
}

fn default_compute_ppl() -> bool {
    true
}

fn default_min_batch_rows() -> usize {
    16
}
