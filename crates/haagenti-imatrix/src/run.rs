//! Calibration driver
//!
//! Feeds tokenized calibration text through an external model runtime in
//! fixed-size chunks. The runtime invokes the graph callback (and thereby
//! the [`Collector`]) while decoding; the driver only sequences chunks and
//! batches and optionally scores the produced logits.

use std::time::Instant;

use tracing::{info, warn};

use crate::format::{LoadSummary, SaveSummary};
use crate::lim::LimReport;
use crate::perplexity::{LogitScanner, NllAccumulator, PerplexityEstimate};
use crate::{Collector, ImatrixConfig, ImatrixError, Result};

/// Token id.
pub type Token = u32;

/// Model runtime the driver decodes through.
///
/// Implementations route graph evaluation through
/// [`Collector::eval_callback`] so statistics are gathered during `decode`.
pub trait ModelRuntime {
    /// Tokenize `text`, adding special tokens when `add_special` is set.
    fn tokenize(&mut self, text: &str, add_special: bool) -> Result<Vec<Token>>;

    /// Context length the runtime was created with.
    fn n_ctx(&self) -> usize;

    /// Context length the model was trained with.
    fn n_ctx_train(&self) -> usize;

    /// Vocabulary size.
    fn n_vocab(&self) -> usize;

    /// Whether sequences start with BOS.
    fn add_bos(&self) -> bool;

    /// Whether sequences end with EOS.
    fn add_eos(&self) -> bool;

    /// BOS token id.
    fn bos_token(&self) -> Token;

    /// Forget all cached context before an independent chunk.
    fn clear_cache(&mut self);

    /// Decode `tokens` starting at position `start_pos`.
    fn decode(&mut self, tokens: &[Token], start_pos: usize) -> Result<()>;

    /// Logits of the last decoded batch, `n_vocab` per token.
    fn logits(&self) -> &[f32];
}

/// Outcome of a calibration run.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    /// Chunks decoded
    pub n_chunks: usize,
    /// Tokens after skipping leading chunks
    pub n_tokens: usize,
    /// Running perplexity after each chunk
    pub chunk_ppl: Vec<f64>,
    /// Final estimate (perplexity enabled only)
    pub perplexity: Option<PerplexityEstimate>,
    /// Logit of each evaluated next token, by token position
    pub logit_history: Vec<f32>,
    /// Probability of each evaluated next token, by token position
    pub prob_history: Vec<f32>,
}

/// Chunked decode over calibration text.
#[derive(Debug)]
pub struct CalibrationRun<'a> {
    config: &'a ImatrixConfig,
    scanner: LogitScanner,
}

impl<'a> CalibrationRun<'a> {
    /// Create a driver
    pub fn new(config: &'a ImatrixConfig) -> Self {
        Self {
            config,
            scanner: LogitScanner::new(config.threads),
        }
    }

    /// Decode `text` chunk by chunk through `runtime`.
    pub fn run<R: ModelRuntime>(&self, runtime: &mut R, text: &str) -> Result<RunSummary> {
        if runtime.add_eos() {
            return Err(ImatrixError::InvalidInput(
                "models that append EOS are not supported".into(),
            ));
        }
        let add_bos = runtime.add_bos();
        let n_ctx = self.config.n_ctx;
        if n_ctx == 0 {
            return Err(ImatrixError::Config("n_ctx must be positive".into()));
        }
        if runtime.n_ctx() != n_ctx {
            return Err(ImatrixError::Config(format!(
                "configured n_ctx {} does not match the runtime context of {} tokens",
                n_ctx,
                runtime.n_ctx()
            )));
        }
        let n_vocab = runtime.n_vocab();
        if n_vocab == 0 {
            return Err(ImatrixError::InvalidInput(
                "runtime reports an empty vocabulary".into(),
            ));
        }
        if n_ctx > runtime.n_ctx_train() {
            warn!(
                "model was trained on only {} context tokens ({} specified)",
                runtime.n_ctx_train(),
                n_ctx
            );
        }

        info!("tokenizing the input ..");
        let started = Instant::now();
        let mut tokens = runtime.tokenize(text, true)?;
        info!(
            "tokenization took {:.3} ms",
            started.elapsed().as_secs_f64() * 1e3
        );

        let skip = self.config.skip_chunks;
        if skip > 0 {
            if (skip + 2) * n_ctx >= tokens.len() {
                return Err(ImatrixError::InsufficientTokens(format!(
                    "there will be not enough tokens left after removing {} chunks",
                    skip
                )));
            }
            info!("removing initial {} chunks ({} tokens)", skip, skip * n_ctx);
            tokens.drain(..skip * n_ctx);
        }

        if tokens.len() < 2 * n_ctx {
            return Err(ImatrixError::InsufficientTokens(format!(
                "you need at least {} tokens for a context of {} tokens, the data tokenizes to only {}",
                2 * n_ctx,
                n_ctx,
                tokens.len()
            )));
        }

        let compute_ppl = self.config.compute_ppl;
        let mut summary = RunSummary {
            n_tokens: tokens.len(),
            ..Default::default()
        };
        if compute_ppl {
            summary.logit_history = vec![0.0; tokens.len()];
            summary.prob_history = vec![0.0; tokens.len()];
        }

        let n_chunk_max = tokens.len() / n_ctx;
        let n_chunk = self
            .config
            .n_chunks
            .map_or(n_chunk_max, |n| n.min(n_chunk_max));
        let n_batch = self.config.effective_batch();
        let num_batches = (n_ctx + n_batch - 1) / n_batch;

        info!(
            "computing over {} chunks with batch_size {}",
            n_chunk, n_batch
        );

        let mut totals = NllAccumulator::new();
        let mut chunk_logits: Vec<f32> = Vec::new();
        if compute_ppl {
            chunk_logits.reserve(n_ctx * n_vocab);
        }

        for i in 0..n_chunk {
            let start = i * n_ctx;
            let end = start + n_ctx;
            let chunk_started = Instant::now();

            runtime.clear_cache();
            chunk_logits.clear();

            for j in 0..num_batches {
                let batch_start = start + j * n_batch;
                let batch_size = n_batch.min(end - batch_start);

                let original = tokens[batch_start];
                if add_bos && j == 0 {
                    tokens[batch_start] = runtime.bos_token();
                }
                let decoded =
                    runtime.decode(&tokens[batch_start..batch_start + batch_size], j * n_batch);
                tokens[batch_start] = original;
                decoded?;

                if compute_ppl {
                    let logits = runtime
                        .logits()
                        .get(..batch_size * n_vocab)
                        .ok_or_else(|| {
                            ImatrixError::Decode(format!(
                                "runtime returned fewer than {} logits",
                                batch_size * n_vocab
                            ))
                        })?;
                    chunk_logits.extend_from_slice(logits);
                }
            }

            if i == 0 {
                log_eta(chunk_started.elapsed().as_secs_f64(), n_chunk);
            }

            if compute_ppl {
                let first = n_ctx / 2;
                self.scanner.scan(
                    n_vocab,
                    &chunk_logits[first * n_vocab..],
                    &tokens[start + first..end],
                    &mut totals,
                    &mut summary.logit_history[start + first..end],
                    &mut summary.prob_history[start + first..end],
                )?;
                if let Some(ppl) = totals.ppl() {
                    info!("[{}]{:.4}", i + 1, ppl);
                    summary.chunk_ppl.push(ppl);
                }
            }
            summary.n_chunks += 1;
        }

        if compute_ppl {
            summary.perplexity = totals.estimate();
            match summary.perplexity {
                Some(PerplexityEstimate {
                    ppl,
                    uncertainty: Some(u),
                    ..
                }) => info!("Final estimate: PPL = {:.4} +/- {:.5}", ppl, u),
                Some(PerplexityEstimate { ppl, .. }) => {
                    warn!("Final estimate: PPL = {:.4}, no usable standard deviation of log(prob)", ppl)
                }
                None => {}
            }
        }

        Ok(summary)
    }
}

fn log_eta(seconds_per_pass: f64, n_chunk: usize) {
    let mut total_seconds = (seconds_per_pass * n_chunk as f64) as u64;
    let hours = total_seconds / 3600;
    total_seconds %= 3600;
    if hours > 0 {
        info!(
            "{:.2} seconds per pass - ETA {} hours {:.2} minutes",
            seconds_per_pass,
            hours,
            total_seconds as f64 / 60.0
        );
    } else {
        info!(
            "{:.2} seconds per pass - ETA {:.2} minutes",
            seconds_per_pass,
            total_seconds as f64 / 60.0
        );
    }
}

/// Everything a collection session produced.
#[derive(Debug)]
pub struct SessionSummary {
    /// Input files merged before the run
    pub loaded: Vec<LoadSummary>,
    /// Calibration run outcome
    pub run: RunSummary,
    /// Final save
    pub saved: SaveSummary,
    /// Layer importance scores, when enabled
    pub lim: Option<LimReport>,
}

/// Full collection session: merge inputs, calibrate, save, analyze.
pub fn run_session<R: ModelRuntime>(
    collector: &Collector,
    runtime: &mut R,
    text: &str,
) -> Result<SessionSummary> {
    let config = collector.config();

    let loaded = collector.load_inputs()?;
    if config.in_files.len() > 1 {
        info!(
            "saving combined imatrix to '{}'",
            collector.output_path().display()
        );
        collector.save(None)?;
    }

    let run = CalibrationRun::new(config).run(runtime, text)?;
    let saved = collector.save(None)?;

    let lim = if config.compute_lim {
        let report = collector.lim_report();
        info!("\n{}", report);
        Some(report)
    } else {
        None
    };

    Ok(SessionSummary {
        loaded,
        run,
        saved,
        lim,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Runtime with a fixed vocabulary of 4 whose logits never change.
    struct Scripted {
        n_ctx: usize,
        corpus: Vec<Token>,
        add_bos: bool,
        add_eos: bool,
        decoded: Vec<(Vec<Token>, usize)>,
        clears: usize,
        logits: Vec<f32>,
    }

    impl Scripted {
        fn new(n_ctx: usize, corpus_len: usize) -> Self {
            Self {
                n_ctx,
                corpus: (0..corpus_len as Token).map(|t| t % 4).collect(),
                add_bos: false,
                add_eos: false,
                decoded: Vec::new(),
                clears: 0,
                logits: Vec::new(),
            }
        }
    }

    impl ModelRuntime for Scripted {
        fn tokenize(&mut self, _text: &str, _add_special: bool) -> Result<Vec<Token>> {
            Ok(self.corpus.clone())
        }
        fn n_ctx(&self) -> usize {
            self.n_ctx
        }
        fn n_ctx_train(&self) -> usize {
            self.n_ctx
        }
        fn n_vocab(&self) -> usize {
            4
        }
        fn add_bos(&self) -> bool {
            self.add_bos
        }
        fn add_eos(&self) -> bool {
            self.add_eos
        }
        fn bos_token(&self) -> Token {
            99
        }
        fn clear_cache(&mut self) {
            self.clears += 1;
        }
        fn decode(&mut self, tokens: &[Token], start_pos: usize) -> Result<()> {
            self.decoded.push((tokens.to_vec(), start_pos));
            self.logits = [2.0, 1.0, 0.1, -1.0]
                .iter()
                .copied()
                .cycle()
                .take(tokens.len() * 4)
                .collect();
            Ok(())
        }
        fn logits(&self) -> &[f32] {
            &self.logits
        }
    }

    fn config(n_ctx: usize, n_batch: usize) -> ImatrixConfig {
        ImatrixConfig {
            n_ctx,
            n_batch,
            threads: Some(2),
            verbosity: 0,
            ..Default::default()
        }
    }

    #[test]
    fn test_chunks_and_batches() {
        let config = config(8, 3);
        let mut runtime = Scripted::new(8, 20);
        runtime.add_bos = true;

        let summary = CalibrationRun::new(&config).run(&mut runtime, "text").unwrap();
        assert_eq!(summary.n_chunks, 2);
        assert_eq!(runtime.clears, 2);
        // ceil(8 / 3) batches per chunk
        assert_eq!(runtime.decoded.len(), 6);
        assert_eq!(runtime.decoded[0], (vec![99, 1, 2], 0));
        assert_eq!(runtime.decoded[1], (vec![3, 0, 1], 3));
        assert_eq!(runtime.decoded[2], (vec![2, 3], 6));
        // BOS substituted only on the first batch of each chunk
        assert_eq!(runtime.decoded[3], (vec![99, 1, 2], 0));
        assert_eq!(runtime.decoded[4].0[0], 3);
    }

    #[test]
    fn test_perplexity_over_second_half() {
        let config = config(8, 512);
        let mut runtime = Scripted::new(8, 16);
        let summary = CalibrationRun::new(&config).run(&mut runtime, "text").unwrap();

        // positions 4..7 of each chunk target tokens 1, 2, 3
        let per_chunk = 1.449313 + 2.349313 + 3.449313;
        let ppl = (2.0f64 * per_chunk / 6.0).exp();
        let est = summary.perplexity.unwrap();
        assert!((est.ppl - ppl).abs() < 1e-4);
        assert!(est.uncertainty.is_some());
        assert_eq!(summary.chunk_ppl.len(), 2);
        assert!((summary.chunk_ppl[0] - ppl).abs() < 1e-4);

        assert_eq!(summary.logit_history.len(), 16);
        assert_eq!(&summary.logit_history[4..8], &[1.0, 0.1, -1.0, 0.0]);
        assert_eq!(summary.logit_history[0], 0.0);
    }

    #[test]
    fn test_no_ppl_keeps_histories_empty() {
        let config = ImatrixConfig {
            compute_ppl: false,
            ..config(4, 512)
        };
        let mut runtime = Scripted::new(4, 9);
        let summary = CalibrationRun::new(&config).run(&mut runtime, "text").unwrap();
        assert_eq!(summary.n_chunks, 2);
        assert!(summary.perplexity.is_none());
        assert!(summary.logit_history.is_empty());
    }

    #[test]
    fn test_chunk_limit_and_skip() {
        let config = ImatrixConfig {
            skip_chunks: 1,
            n_chunks: Some(2),
            compute_ppl: false,
            ..config(4, 512)
        };
        let mut runtime = Scripted::new(4, 24);
        let summary = CalibrationRun::new(&config).run(&mut runtime, "text").unwrap();
        assert_eq!(summary.n_tokens, 20);
        assert_eq!(summary.n_chunks, 2);
    }

    #[test]
    fn test_insufficient_tokens() {
        let mut runtime = Scripted::new(8, 15);
        let err = CalibrationRun::new(&config(8, 512))
            .run(&mut runtime, "text")
            .unwrap_err();
        assert!(matches!(err, ImatrixError::InsufficientTokens(_)));

        // (skip + 2) * n_ctx must stay below the token count
        let skipping = ImatrixConfig {
            skip_chunks: 1,
            ..config(8, 512)
        };
        let mut runtime = Scripted::new(8, 24);
        let err = CalibrationRun::new(&skipping)
            .run(&mut runtime, "text")
            .unwrap_err();
        assert!(matches!(err, ImatrixError::InsufficientTokens(_)));
        assert!(runtime.decoded.is_empty());
    }

    #[test]
    fn test_rejects_eos_models() {
        let mut runtime = Scripted::new(4, 16);
        runtime.add_eos = true;
        assert!(CalibrationRun::new(&config(4, 512))
            .run(&mut runtime, "text")
            .is_err());
    }

    #[test]
    fn test_rejects_context_mismatch() {
        let mut runtime = Scripted::new(8, 32);
        let err = CalibrationRun::new(&config(16, 4))
            .run(&mut runtime, "text")
            .unwrap_err();
        assert!(matches!(err, ImatrixError::Config(_)));
        assert!(runtime.decoded.is_empty());
    }
}
