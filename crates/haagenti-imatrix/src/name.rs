//! Tensor name handling

/// Strip device and iteration decoration from a tensor name.
///
/// Schedulers split one logical weight across devices as
/// `CUDA0#blk.0.attn_k.weight#0`; all of them share `blk.0.attn_k.weight`.
pub fn canonical_name(raw: &str) -> &str {
    match raw.split_once('#') {
        Some((_, rest)) => match rest.split_once('#') {
            Some((name, _)) => name,
            None => rest,
        },
        None => raw,
    }
}

/// Layer index and tensor type parsed from a per-block weight name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerName {
    /// Block index, e.g. `17` in `blk.17.ffn_gate.weight`
    pub layer: u32,
    /// Tensor type, e.g. `ffn_gate` in `blk.17.ffn_gate.weight`
    pub tensor_type: String,
}

impl LayerName {
    /// Parse `<prefix>.<layer>.<type>.<suffix>`.
    ///
    /// The type is everything between the layer field and the last `.`,
    /// so `blk.3.attn.q.weight` has type `attn.q`.
    pub fn parse(name: &str) -> Option<Self> {
        let (_, rest) = name.split_once('.')?;
        let (layer, rest) = rest.split_once('.')?;
        let layer = layer.parse().ok()?;
        let (tensor_type, _) = rest.rsplit_once('.')?;
        if tensor_type.is_empty() {
            return None;
        }

        Some(Self {
            layer,
            tensor_type: tensor_type.to_string(),
        })
    }
}
