//! Parallel perplexity evaluation over per-position logits
//!
//! Positions of a chunk are handed out by a single locked counter to a fixed
//! set of scoped worker threads plus the calling thread. Each thread keeps
//! local NLL sums and its history writes, and folds them into the shared
//! accumulator exactly once, when the counter runs past the last position.

use std::sync::{Mutex, PoisonError};

use crate::run::Token;
use crate::{ImatrixError, Result};

/// Log-softmax of the target token at one position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LogSoftmax {
    /// `ln p(token)`
    pub log_softmax: f64,
    /// Raw logit of the token
    pub logit: f32,
    /// Softmax probability of the token
    pub prob: f32,
}

/// Numerically stable log-softmax of `logits[token]`.
pub fn log_softmax(logits: &[f32], token: Token) -> Result<LogSoftmax> {
    let token = token as usize;
    if token >= logits.len() {
        return Err(ImatrixError::InvalidInput(format!(
            "token {} outside vocabulary of {}",
            token,
            logits.len()
        )));
    }
    Ok(score(logits, token))
}

fn score(logits: &[f32], token: usize) -> LogSoftmax {
    let max_logit = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let sum_exp: f64 = logits.iter().map(|&l| ((l - max_logit) as f64).exp()).sum();
    let shifted = (logits[token] - max_logit) as f64;
    LogSoftmax {
        log_softmax: shifted - sum_exp.ln(),
        logit: logits[token],
        prob: (shifted.exp() / sum_exp) as f32,
    }
}

/// Perplexity with its uncertainty.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PerplexityEstimate {
    /// `exp(mean NLL)`
    pub ppl: f64,
    /// Bessel-corrected standard deviation of per-position NLL
    pub nll_std: Option<f64>,
    /// `nll_std * ppl`
    pub uncertainty: Option<f64>,
}

/// Running sums of negative log-likelihood.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NllAccumulator {
    pub nll: f64,
    pub nll2: f64,
    pub count: usize,
}

impl NllAccumulator {
    /// Create an empty accumulator
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one position's NLL.
    pub fn push(&mut self, nll: f64) {
        self.nll += nll;
        self.nll2 += nll * nll;
        self.count += 1;
    }

    /// Fold another accumulator into this one.
    pub fn merge(&mut self, other: &NllAccumulator) {
        self.nll += other.nll;
        self.nll2 += other.nll2;
        self.count += other.count;
    }

    /// Perplexity so far, `None` before the first position.
    pub fn ppl(&self) -> Option<f64> {
        (self.count > 0).then(|| (self.nll / self.count as f64).exp())
    }

    /// Final estimate.
    ///
    /// The uncertainty needs at least two positions and a non-negative
    /// corrected variance.
    pub fn estimate(&self) -> Option<PerplexityEstimate> {
        if self.count == 0 {
            return None;
        }
        let n = self.count as f64;
        let mean = self.nll / n;
        let ppl = mean.exp();

        let nll_std = if self.count > 1 {
            let var = (self.nll2 / n - mean * mean) * n / (n - 1.0);
            (var >= 0.0).then(|| var.sqrt())
        } else {
            None
        };

        Some(PerplexityEstimate {
            ppl,
            nll_std,
            uncertainty: nll_std.map(|s| s * ppl),
        })
    }
}

/// Output of one position: index, logit, probability.
type HistoryItem = (usize, f32, f32);

struct ScanState<'a> {
    next: usize,
    totals: &'a mut NllAccumulator,
    logit_history: &'a mut [f32],
    prob_history: &'a mut [f32],
}

/// Counter-claim pool scoring positions of a logits block.
#[derive(Debug, Clone)]
pub struct LogitScanner {
    n_workers: usize,
}

impl LogitScanner {
    /// Pool using `threads` threads in total, hardware concurrency when `None`.
    pub fn new(threads: Option<usize>) -> Self {
        let threads = threads.unwrap_or_else(num_threads).max(1);
        Self {
            n_workers: threads - 1,
        }
    }

    /// Spawned threads besides the caller.
    pub fn n_workers(&self) -> usize {
        self.n_workers
    }

    /// Score `tokens.len() - 1` positions.
    ///
    /// Position `i` reads `logits[i * n_vocab..(i + 1) * n_vocab]` and targets
    /// `tokens[i + 1]`; its logit and probability land at index `i` of the
    /// history slices. Sums are added to `totals`.
    pub fn scan(
        &self,
        n_vocab: usize,
        logits: &[f32],
        tokens: &[Token],
        totals: &mut NllAccumulator,
        logit_history: &mut [f32],
        prob_history: &mut [f32],
    ) -> Result<()> {
        let n_positions = tokens.len().saturating_sub(1);
        if n_positions == 0 {
            return Ok(());
        }
        if n_vocab == 0 || logits.len() < n_positions * n_vocab {
            return Err(ImatrixError::InvalidInput(format!(
                "{} logits for {} positions of {} entries",
                logits.len(),
                n_positions,
                n_vocab
            )));
        }
        if logit_history.len() < n_positions || prob_history.len() < n_positions {
            return Err(ImatrixError::InvalidInput(format!(
                "history shorter than {} positions",
                n_positions
            )));
        }
        if let Some(&bad) = tokens[1..].iter().find(|&&t| t as usize >= n_vocab) {
            return Err(ImatrixError::InvalidInput(format!(
                "token {} outside vocabulary of {}",
                bad, n_vocab
            )));
        }

        let state = Mutex::new(ScanState {
            next: 0,
            totals,
            logit_history,
            prob_history,
        });

        let work = || {
            let mut local = NllAccumulator::new();
            let mut history: Vec<HistoryItem> = Vec::new();
            loop {
                let i = {
                    let mut guard = state.lock().unwrap_or_else(PoisonError::into_inner);
                    let i = guard.next;
                    guard.next += 1;
                    if i >= n_positions {
                        guard.totals.merge(&local);
                        for &(j, logit, prob) in &history {
                            guard.logit_history[j] = logit;
                            guard.prob_history[j] = prob;
                        }
                        break;
                    }
                    i
                };

                let row = &logits[i * n_vocab..(i + 1) * n_vocab];
                let result = score(row, tokens[i + 1] as usize);
                local.push(-result.log_softmax);
                history.push((i, result.logit, result.prob));
            }
        };

        std::thread::scope(|s| {
            for _ in 0..self.n_workers {
                s.spawn(work);
            }
            work();
        });
        Ok(())
    }
}

impl Default for LogitScanner {
    fn default() -> Self {
        Self::new(None)
    }
}

fn num_threads() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(4)
}
