//! Activation statistics collection from graph callbacks

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, error, info, warn};

use crate::format::{self, LoadSummary, SaveSummary, Trailer};
use crate::lim::{self, LimReport};
use crate::name::canonical_name;
use crate::stats::CellFault;
use crate::tensor::{ElementType, GraphNode, OpKind, TensorView};
use crate::{ImatrixConfig, ImatrixError, Result, StatsStore};

/// Answer to the interest query for a graph node.
#[derive(Debug)]
pub enum Interest {
    /// Not collected; the runtime will not offer the data
    Skip,
    /// Collected; the admission unlocks [`Collector::collect`] for this node
    Consume(Admission),
}

impl Interest {
    /// Whether the node was accepted.
    pub fn is_consume(&self) -> bool {
        matches!(self, Interest::Consume(_))
    }
}

/// Proof that a node passed [`Collector::ask`].
#[derive(Debug)]
pub struct Admission(());

/// State guarded by the collector lock.
#[derive(Debug, Default)]
struct CollectorState {
    store: StatsStore,
    /// High-water mark of per-record call counts
    last_call: u32,
    /// Host copy of off-host activations
    src_scratch: Vec<u8>,
    /// Host copy of selected expert ids
    ids_scratch: Vec<u8>,
}

/// Importance-matrix collector.
///
/// The runtime offers every graph node through [`Collector::ask`] and hands
/// accepted nodes with their data to [`Collector::collect`]. All updates,
/// including host staging and checkpoint saves, run under one lock.
#[derive(Debug)]
pub struct Collector {
    config: ImatrixConfig,
    state: Mutex<CollectorState>,
}

impl Collector {
    /// Create a collector
    pub fn new(config: ImatrixConfig) -> Self {
        Self {
            config,
            state: Mutex::new(CollectorState::default()),
        }
    }

    /// Configuration in use.
    pub fn config(&self) -> &ImatrixConfig {
        &self.config
    }

    /// Decide from metadata alone whether `node` is collected.
    ///
    /// Routed multiplies are always taken. Dense multiplies need at least
    /// `min_batch_rows` rows of `f32` input and a per-block weight name (or
    /// the output projection when enabled).
    pub fn ask(&self, node: &GraphNode<'_>) -> Interest {
        match node.op {
            OpKind::MulMatId => Interest::Consume(Admission(())),
            OpKind::MulMat => {
                let input = &node.input;
                if input.ne[1] < self.config.min_batch_rows || input.dtype != ElementType::F32 {
                    return Interest::Skip;
                }
                let name = canonical_name(node.weights.name);
                let wanted = name.starts_with("blk.")
                    || (self.config.process_output && name == self.config.output_tensor_name);
                if wanted {
                    Interest::Consume(Admission(()))
                } else {
                    Interest::Skip
                }
            }
            OpKind::Other => Interest::Skip,
        }
    }

    /// Fold the data of an accepted node into the statistics.
    ///
    /// Errors for which [`ImatrixError::is_fatal`] holds mean the run can no
    /// longer be trusted.
    pub fn collect(&self, _admission: Admission, node: &GraphNode<'_>) -> Result<()> {
        let mut guard = self.lock();
        let CollectorState {
            store,
            last_call,
            src_scratch,
            ids_scratch,
        } = &mut *guard;

        let name = canonical_name(node.weights.name);
        if node.input.dtype != ElementType::F32 {
            return Err(ImatrixError::malformed(name, "activations are not f32"));
        }
        let data = stage(&node.input, src_scratch)?;

        let ncall = match node.op {
            OpKind::MulMatId => {
                let ids = node
                    .ids
                    .as_ref()
                    .ok_or_else(|| ImatrixError::malformed(name, "routed multiply without ids"))?;
                let ids_data = stage(ids, ids_scratch)?;
                self.collect_routed(store, name, node, data, ids, ids_data, *last_call)?
            }
            _ => self.collect_dense(store, name, node, data, *last_call)?,
        };

        if ncall > *last_call {
            *last_call = ncall;
            self.checkpoint(store, ncall);
        }
        Ok(())
    }

    /// Runtime-facing callback: `ask` selects the phase.
    ///
    /// Fatal collection errors are logged and terminate the process.
    pub fn eval_callback(&self, node: &GraphNode<'_>, ask: bool) -> bool {
        let admission = match self.ask(node) {
            Interest::Skip => return false,
            Interest::Consume(admission) => admission,
        };
        if ask {
            return true;
        }

        match self.collect(admission, node) {
            Ok(()) => true,
            Err(e) if e.is_fatal() => {
                error!("{}", e);
                std::process::exit(1);
            }
            Err(e) => {
                warn!("collection failed: {}", e);
                true
            }
        }
    }

    fn collect_dense(
        &self,
        store: &mut StatsStore,
        name: &str,
        node: &GraphNode<'_>,
        data: &[u8],
        last_call: u32,
    ) -> Result<u32> {
        let input = &node.input;
        let n_features = input.ne[0];
        let stats = store.observe(name, n_features, 1)?;
        stats.ncall += 1;
        let ncall = stats.ncall;

        if self.config.verbosity > 1 {
            debug!(
                "collect[{}]: {:>32}, {}, {:5} x {:5}, {:?}",
                last_call,
                name,
                node.op.name(),
                n_features,
                input.ne[1],
                input.dtype
            );
        }

        let mut view = stats
            .expert_view(n_features)
            .ok_or_else(|| ImatrixError::malformed(name, "zero-width activations"))?;
        for i2 in 0..input.ne[2] {
            for i1 in 0..input.ne[1] {
                let row = read_row(data, input, input.offset([0, i1, i2, 0]), name)?;
                view.accumulate(0, row).map_err(|f| cell_fault(name, f, 1))?;
            }
        }
        Ok(ncall)
    }

    #[allow(clippy::too_many_arguments)]
    fn collect_routed(
        &self,
        store: &mut StatsStore,
        name: &str,
        node: &GraphNode<'_>,
        data: &[u8],
        ids: &TensorView<'_>,
        ids_data: &[u8],
        last_call: u32,
    ) -> Result<u32> {
        // ids   -> [n_expert_used, n_tokens]
        // input -> [features, n_expert_used or 1, n_tokens]
        let input = &node.input;
        let n_as = node.weights.ne[2];
        let n_ids = ids.ne[0];
        let n_features = input.ne[0];

        if ids.ne[1] != input.ne[2] {
            return Err(ImatrixError::malformed(
                name,
                format!("{} id rows for {} tokens", ids.ne[1], input.ne[2]),
            ));
        }
        if input.ne[1] == 0 {
            return Err(ImatrixError::malformed(name, "empty expert dimension"));
        }

        let stats = store.observe(name, n_features, n_as)?;
        stats.ncall += 1;
        let ncall = stats.ncall;

        if self.config.verbosity > 1 {
            debug!(
                "collect[{}]: {:>32}, {}, {:5} x {:5}, {:?}",
                last_call,
                name,
                node.op.name(),
                n_features,
                input.ne[2],
                input.dtype
            );
        }

        let mut view = stats
            .expert_view(n_features)
            .ok_or_else(|| ImatrixError::malformed(name, "zero-width activations"))?;

        for expert in 0..n_as {
            for slot in 0..n_ids {
                for token in 0..ids.ne[1] {
                    let selected = read_id(ids_data, ids.offset([slot, token, 0, 0]), name)?;
                    if selected < 0 || selected as usize >= n_as {
                        return Err(ImatrixError::ExpertOutOfRange {
                            name: name.to_string(),
                            id: selected as i64,
                            n_as,
                        });
                    }
                    if selected as usize != expert {
                        continue;
                    }

                    let offset = input.offset([0, slot % input.ne[1], token, 0]);
                    let row = read_row(data, input, offset, name)?;
                    view.accumulate(expert, row)
                        .map_err(|f| cell_fault(name, f, n_as))?;
                }
            }
        }
        Ok(ncall)
    }

    /// Snapshot and numbered checkpoint policy, run under the lock.
    fn checkpoint(&self, store: &StatsStore, last_call: u32) {
        if last_call % self.config.out_freq.max(1) == 0 {
            self.save_locked(store, last_call, None);
        }
        if self.config.save_freq > 0 && last_call % self.config.save_freq == 0 {
            self.save_locked(store, last_call, Some(last_call));
        }
    }

    fn save_locked(&self, store: &StatsStore, last_call: u32, ncall: Option<u32>) {
        let path = self.config.output_path(ncall);
        if let Err(e) = self.write(store, last_call, &path) {
            error!("failed to save {}: {}", path.display(), e);
        }
    }

    fn write(&self, store: &StatsStore, last_call: u32, path: &Path) -> Result<SaveSummary> {
        let trailer = Trailer {
            last_call,
            prompt_name: self.config.prompt_file.clone(),
        };
        let summary = format::save(store, path, &trailer)?;
        if self.config.verbosity > 0 {
            info!(
                "stored collected data after {} chunks in {}",
                last_call,
                path.display()
            );
        }
        Ok(summary)
    }

    /// Save to the configured path, or a numbered checkpoint for `Some(ncall)`.
    pub fn save(&self, ncall: Option<u32>) -> Result<SaveSummary> {
        let guard = self.lock();
        let path = self.config.output_path(ncall);
        self.write(&guard.store, guard.last_call, &path)
    }

    /// Save to an explicit path.
    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<SaveSummary> {
        let guard = self.lock();
        self.write(&guard.store, guard.last_call, path.as_ref())
    }

    /// Merge a saved matrix into the statistics.
    ///
    /// On failure the statistics are left as they were before the call.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<LoadSummary> {
        let mut guard = self.lock();
        format::load_into(&mut guard.store, path)
    }

    /// Merge every configured input file in order.
    pub fn load_inputs(&self) -> Result<Vec<LoadSummary>> {
        self.config
            .in_files
            .iter()
            .map(|file| {
                info!("loading imatrix from '{}'", file);
                self.load(file)
            })
            .collect()
    }

    /// Layer importance scores over the current statistics.
    pub fn lim_report(&self) -> LimReport {
        lim::analyze(&self.lock().store)
    }

    /// Highest call count seen so far.
    pub fn last_call(&self) -> u32 {
        self.lock().last_call
    }

    /// Run `f` with synchronized read access to the statistics.
    pub fn with_store<T>(&self, f: impl FnOnce(&StatsStore) -> T) -> T {
        f(&self.lock().store)
    }

    /// Default output path.
    pub fn output_path(&self) -> PathBuf {
        self.config.output_path(None)
    }

    fn lock(&self) -> MutexGuard<'_, CollectorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Host-resident bytes of `view`, copying through `scratch` when needed.
fn stage<'a>(view: &'a TensorView<'_>, scratch: &'a mut Vec<u8>) -> Result<&'a [u8]> {
    if let Some(bytes) = view.buffer.as_host() {
        return Ok(bytes);
    }
    scratch.clear();
    scratch.resize(view.n_bytes(), 0);
    view.buffer.copy_to_host(scratch)?;
    Ok(scratch.as_slice())
}

fn read_row<'a>(
    data: &'a [u8],
    input: &TensorView<'_>,
    offset: usize,
    name: &str,
) -> Result<impl Iterator<Item = f32> + 'a> {
    let len = input.ne[0] * 4;
    let bytes = data.get(offset..offset + len).ok_or_else(|| {
        ImatrixError::malformed(name, format!("row at byte {} past end of buffer", offset))
    })?;
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]])))
}

fn read_id(data: &[u8], offset: usize, name: &str) -> Result<i32> {
    let bytes = data.get(offset..offset + 4).ok_or_else(|| {
        ImatrixError::malformed(name, format!("id at byte {} past end of buffer", offset))
    })?;
    Ok(i32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn cell_fault(name: &str, fault: CellFault, n_as: usize) -> ImatrixError {
    match fault {
        CellFault::OutOfRange { expert } => ImatrixError::ExpertOutOfRange {
            name: name.to_string(),
            id: expert as i64,
            n_as,
        },
        CellFault::NonFinite { value, .. } => ImatrixError::NonFinite {
            name: name.to_string(),
            value,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{f32_bytes, i32_bytes, TensorBuffer};

    fn quiet() -> ImatrixConfig {
        ImatrixConfig {
            verbosity: 0,
            out_freq: 1_000,
            ..Default::default()
        }
    }

    fn collect_into(collector: &Collector, node: &GraphNode<'_>) -> Result<()> {
        match collector.ask(node) {
            Interest::Consume(admission) => collector.collect(admission, node),
            Interest::Skip => panic!("node was not accepted"),
        }
    }

    #[test]
    fn test_ask_dense_filters() {
        let collector = Collector::new(quiet());
        let w: Vec<u8> = Vec::new();
        let x = f32_bytes(&[0.0; 4 * 16]);

        let weights = TensorView::contiguous("CUDA0#blk.0.attn_q.weight#0", ElementType::F16, [4, 4, 1, 1], &w);
        let input = TensorView::contiguous("x", ElementType::F32, [4, 16, 1, 1], &x);
        assert!(collector.ask(&GraphNode::mul_mat(weights, input)).is_consume());

        // too few rows
        let small = TensorView::contiguous("x", ElementType::F32, [4, 15, 1, 1], &x);
        assert!(!collector.ask(&GraphNode::mul_mat(weights, small)).is_consume());

        // wrong input type
        let half = TensorView::contiguous("x", ElementType::F16, [4, 16, 1, 1], &x);
        assert!(!collector.ask(&GraphNode::mul_mat(weights, half)).is_consume());

        // not a per-block weight
        let out = TensorView::contiguous("output.weight", ElementType::F16, [4, 4, 1, 1], &w);
        assert!(!collector.ask(&GraphNode::mul_mat(out, input)).is_consume());

        let mut node = GraphNode::mul_mat(weights, input);
        node.op = OpKind::Other;
        assert!(!collector.ask(&node).is_consume());
    }

    #[test]
    fn test_ask_output_toggle() {
        let collector = Collector::new(ImatrixConfig {
            process_output: true,
            ..quiet()
        });
        let w: Vec<u8> = Vec::new();
        let x = f32_bytes(&[0.0; 4 * 16]);
        let out = TensorView::contiguous("output.weight", ElementType::F16, [4, 4, 1, 1], &w);
        let input = TensorView::contiguous("x", ElementType::F32, [4, 16, 1, 1], &x);
        assert!(collector.ask(&GraphNode::mul_mat(out, input)).is_consume());
    }

    #[test]
    fn test_ask_routed_always() {
        let collector = Collector::new(quiet());
        let w: Vec<u8> = Vec::new();
        let x = f32_bytes(&[0.0; 4]);
        let ids = i32_bytes(&[0]);
        let weights = TensorView::contiguous("anything", ElementType::Quantized, [4, 4, 2, 1], &w);
        let input = TensorView::contiguous("x", ElementType::F16, [4, 1, 1, 1], &x);
        let ids = TensorView::contiguous("ids", ElementType::I32, [1, 1, 1, 1], &ids);
        assert!(collector.ask(&GraphNode::mul_mat_id(weights, input, ids)).is_consume());
    }

    #[test]
    fn test_dense_accumulation() {
        let collector = Collector::new(quiet());
        let w: Vec<u8> = Vec::new();
        let rows: Vec<f32> = (0..16).flat_map(|r| [r as f32, 1.0, -2.0]).collect();
        let x = f32_bytes(&rows);
        let weights = TensorView::contiguous("blk.0.ffn_up.weight", ElementType::F16, [3, 8, 1, 1], &w);
        let input = TensorView::contiguous("x", ElementType::F32, [3, 16, 1, 1], &x);
        let node = GraphNode::mul_mat(weights, input);

        collect_into(&collector, &node).unwrap();
        collect_into(&collector, &node).unwrap();

        collector.with_store(|store| {
            let stats = store.get("blk.0.ffn_up.weight").unwrap();
            let sum_sq: f32 = (0..16).map(|r| (r * r) as f32).sum();
            assert_eq!(stats.ncall(), 2);
            assert_eq!(stats.counts(), &[32, 32, 32]);
            assert_eq!(stats.values(), &[2.0 * sum_sq, 32.0, 128.0]);
            assert_eq!(stats.activations(), &[15.0, 1.0, -2.0]);
        });
        assert_eq!(collector.last_call(), 2);
    }

    #[test]
    fn test_dense_feature_mismatch_is_fatal() {
        let collector = Collector::new(quiet());
        let w: Vec<u8> = Vec::new();
        let x = f32_bytes(&[1.0; 8 * 16]);
        let weights = TensorView::contiguous("blk.0.ffn_up.weight", ElementType::F16, [4, 4, 1, 1], &w);

        let wide = TensorView::contiguous("x", ElementType::F32, [4, 16, 1, 1], &x);
        collect_into(&collector, &GraphNode::mul_mat(weights, wide)).unwrap();

        let narrow = TensorView::contiguous("x", ElementType::F32, [8, 16, 1, 1], &x);
        let err = collect_into(&collector, &GraphNode::mul_mat(weights, narrow)).unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(err, ImatrixError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_non_finite_is_fatal() {
        let collector = Collector::new(quiet());
        let w: Vec<u8> = Vec::new();
        let mut rows = vec![1.0f32; 2 * 16];
        rows[5] = f32::NAN;
        let x = f32_bytes(&rows);
        let weights = TensorView::contiguous("blk.2.attn_v.weight", ElementType::F16, [2, 2, 1, 1], &w);
        let input = TensorView::contiguous("x", ElementType::F32, [2, 16, 1, 1], &x);

        let err = collect_into(&collector, &GraphNode::mul_mat(weights, input)).unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(err, ImatrixError::NonFinite { .. }));
    }

    /// Routed node: 3 experts, 2 features, top-2 of 2 tokens, ids rows padded.
    #[test]
    fn test_routed_accumulation_with_strided_ids() {
        let collector = Collector::new(quiet());
        let w: Vec<u8> = Vec::new();
        // input [2 features, 2 slots, 2 tokens]
        let x = f32_bytes(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);
        // ids [2 slots, 2 tokens], row stride 16 bytes: token0 -> {2, 0}, token1 -> {2, 1}
        let ids = i32_bytes(&[2, 0, -9, -9, 2, 1, -9, -9]);

        let weights = TensorView::contiguous("blk.0.ffn_up_exps.weight", ElementType::F16, [2, 4, 3, 1], &w);
        let input = TensorView::contiguous("x", ElementType::F32, [2, 2, 2, 1], &x);
        let ids = TensorView::strided("ids", ElementType::I32, [2, 2, 1, 1], [4, 16, 32, 32], &ids);

        collect_into(&collector, &GraphNode::mul_mat_id(weights, input, ids)).unwrap();

        collector.with_store(|store| {
            let stats = store.get("blk.0.ffn_up_exps.weight").unwrap();
            assert_eq!(stats.n_as(), 3);
            assert_eq!(stats.ncall(), 1);
            // expert 0 <- token0 slot1 [3, 4]
            // expert 1 <- token1 slot1 [7, 8]
            // expert 2 <- token0 slot0 [1, 2] and token1 slot0 [5, 6]
            assert_eq!(stats.counts(), &[1, 1, 1, 1, 2, 2]);
            assert_eq!(stats.values(), &[9.0, 16.0, 49.0, 64.0, 26.0, 40.0]);
            assert_eq!(stats.activations(), &[3.0, 4.0, 7.0, 8.0, 5.0, 6.0]);
        });
    }

    #[test]
    fn test_routed_expert_out_of_range_is_fatal() {
        let collector = Collector::new(quiet());
        let w: Vec<u8> = Vec::new();
        let x = f32_bytes(&[1.0, 2.0]);
        let ids = i32_bytes(&[4]);
        let weights = TensorView::contiguous("blk.0.ffn_up_exps.weight", ElementType::F16, [2, 4, 4, 1], &w);
        let input = TensorView::contiguous("x", ElementType::F32, [2, 1, 1, 1], &x);
        let ids = TensorView::contiguous("ids", ElementType::I32, [1, 1, 1, 1], &ids);

        let err = collect_into(&collector, &GraphNode::mul_mat_id(weights, input, ids)).unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(err, ImatrixError::ExpertOutOfRange { id: 4, n_as: 4, .. }));
    }

    #[test]
    fn test_expert_count_mismatch_only_warns() {
        // A changed expert count with the same cell count continues,
        // a changed cell count aborts.
        let collector = Collector::new(quiet());
        let w: Vec<u8> = Vec::new();
        let x = f32_bytes(&[1.0; 4]);
        let ids = i32_bytes(&[0]);
        let input4 = TensorView::contiguous("x", ElementType::F32, [4, 1, 1, 1], &x);
        let input2 = TensorView::contiguous("x", ElementType::F32, [2, 1, 1, 1], &x);
        let ids = TensorView::contiguous("ids", ElementType::I32, [1, 1, 1, 1], &ids);

        let two = TensorView::contiguous("blk.0.ffn_gate_exps.weight", ElementType::F16, [4, 4, 2, 1], &w);
        let four = TensorView::contiguous("blk.0.ffn_gate_exps.weight", ElementType::F16, [2, 4, 4, 1], &w);

        collect_into(&collector, &GraphNode::mul_mat_id(two, input4, ids)).unwrap();
        collect_into(&collector, &GraphNode::mul_mat_id(four, input2, ids)).unwrap();

        collector.with_store(|store| {
            let stats = store.get("blk.0.ffn_gate_exps.weight").unwrap();
            assert_eq!(stats.n_as(), 2);
            assert_eq!(stats.ncall(), 2);
            assert_eq!(stats.counts(), &[2, 2, 1, 1, 0, 0, 0, 0]);
        });

        let three = TensorView::contiguous("blk.0.ffn_gate_exps.weight", ElementType::F16, [4, 4, 3, 1], &w);
        let err = collect_into(&collector, &GraphNode::mul_mat_id(three, input4, ids)).unwrap_err();
        assert!(matches!(err, ImatrixError::ShapeMismatch { .. }));
    }

    struct OffHost(Vec<u8>);

    impl TensorBuffer for OffHost {
        fn as_host(&self) -> Option<&[u8]> {
            None
        }

        fn copy_to_host(&self, dst: &mut [u8]) -> Result<()> {
            self.0.copy_to_host(dst)
        }
    }

    #[test]
    fn test_off_host_input_is_staged() {
        let collector = Collector::new(quiet());
        let w: Vec<u8> = Vec::new();
        let x = OffHost(f32_bytes(&[2.0; 2 * 16]));
        let weights = TensorView::contiguous("blk.1.attn_k.weight", ElementType::F16, [2, 2, 1, 1], &w);
        let input = TensorView::contiguous("x", ElementType::F32, [2, 16, 1, 1], &x);

        collect_into(&collector, &GraphNode::mul_mat(weights, input)).unwrap();
        collector.with_store(|store| {
            assert_eq!(store.get("blk.1.attn_k.weight").unwrap().values(), &[64.0, 64.0]);
        });
    }

    #[test]
    fn test_eval_callback_phases() {
        let collector = Collector::new(quiet());
        let w: Vec<u8> = Vec::new();
        let x = f32_bytes(&[1.0; 2 * 16]);
        let weights = TensorView::contiguous("blk.0.attn_k.weight", ElementType::F16, [2, 2, 1, 1], &w);
        let input = TensorView::contiguous("x", ElementType::F32, [2, 16, 1, 1], &x);
        let node = GraphNode::mul_mat(weights, input);

        assert!(collector.eval_callback(&node, true));
        assert!(collector.with_store(|s| s.is_empty()));
        assert!(collector.eval_callback(&node, false));
        assert_eq!(collector.with_store(|s| s.len()), 1);
    }
}
