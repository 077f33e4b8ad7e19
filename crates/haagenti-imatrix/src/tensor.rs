//! Graph-node view handed over by the tensor runtime
//!
//! The runtime evaluates a compute graph and offers every node to the
//! collector twice: first as metadata only ([`crate::Collector::ask`]),
//! then, if accepted, together with its operand buffers. Operand data may
//! live off-host, in which case it is only reachable through
//! [`TensorBuffer::copy_to_host`].

use crate::Result;

/// Operation performed by a graph node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    /// Dense matrix multiply: `weights x input`
    MulMat,
    /// Indirect (expert-routed) matrix multiply
    MulMatId,
    /// Anything else
    Other,
}

impl OpKind {
    /// Short op name used in trace output.
    pub fn name(&self) -> &'static str {
        match self {
            OpKind::MulMat => "MUL_MAT",
            OpKind::MulMatId => "MUL_MAT_ID",
            OpKind::Other => "OTHER",
        }
    }
}

/// Element type of an operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    F32,
    F16,
    I32,
    /// Block-quantized or otherwise unsupported
    Quantized,
}

impl ElementType {
    /// Size of one element in bytes (0 for block formats).
    pub fn size(&self) -> usize {
        match self {
            ElementType::F32 | ElementType::I32 => 4,
            ElementType::F16 => 2,
            ElementType::Quantized => 0,
        }
    }
}

/// Backing storage of an operand.
pub trait TensorBuffer: Send + Sync {
    /// Host-resident bytes starting at the tensor origin, if directly addressable.
    fn as_host(&self) -> Option<&[u8]>;

    /// Copy the first `dst.len()` bytes of the tensor into `dst`.
    fn copy_to_host(&self, dst: &mut [u8]) -> Result<()>;
}

impl TensorBuffer for Vec<u8> {
    fn as_host(&self) -> Option<&[u8]> {
        Some(self.as_slice())
    }

    fn copy_to_host(&self, dst: &mut [u8]) -> Result<()> {
        copy_prefix(self, dst)
    }
}

fn copy_prefix(src: &[u8], dst: &mut [u8]) -> Result<()> {
    let src = src.get(..dst.len()).ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("buffer holds {} bytes, {} requested", src.len(), dst.len()),
        )
    })?;
    dst.copy_from_slice(src);
    Ok(())
}

/// One operand of a graph node: shape, byte strides and storage.
///
/// `ne` and `nb` follow the usual innermost-first convention: `ne[0]` is the
/// row length, `nb[i]` the byte distance between consecutive indices of
/// dimension `i`.
#[derive(Clone, Copy)]
pub struct TensorView<'a> {
    /// Raw (possibly device-decorated) tensor name
    pub name: &'a str,
    /// Element type
    pub dtype: ElementType,
    /// Extent per dimension
    pub ne: [usize; 4],
    /// Byte stride per dimension
    pub nb: [usize; 4],
    /// Backing storage
    pub buffer: &'a dyn TensorBuffer,
}

impl<'a> TensorView<'a> {
    /// View over contiguous storage.
    pub fn contiguous(
        name: &'a str,
        dtype: ElementType,
        ne: [usize; 4],
        buffer: &'a dyn TensorBuffer,
    ) -> Self {
        let mut nb = [0; 4];
        nb[0] = dtype.size();
        for i in 1..4 {
            nb[i] = nb[i - 1] * ne[i - 1];
        }
        Self {
            name,
            dtype,
            ne,
            nb,
            buffer,
        }
    }

    /// View with explicit strides (non-contiguous layouts).
    pub fn strided(
        name: &'a str,
        dtype: ElementType,
        ne: [usize; 4],
        nb: [usize; 4],
        buffer: &'a dyn TensorBuffer,
    ) -> Self {
        Self {
            name,
            dtype,
            ne,
            nb,
            buffer,
        }
    }

    /// Number of elements.
    pub fn n_elements(&self) -> usize {
        self.ne.iter().product()
    }

    /// Bytes spanned from the origin to the end of the last element.
    pub fn n_bytes(&self) -> usize {
        if self.ne.iter().any(|&n| n == 0) {
            return 0;
        }
        let last: usize = self
            .ne
            .iter()
            .zip(self.nb.iter())
            .map(|(&n, &stride)| (n - 1) * stride)
            .sum();
        last + self.dtype.size()
    }

    /// Byte offset of element `(i0, i1, i2, i3)`.
    pub fn offset(&self, idx: [usize; 4]) -> usize {
        idx.iter().zip(self.nb.iter()).map(|(&i, &s)| i * s).sum()
    }
}

impl std::fmt::Debug for TensorView<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TensorView")
            .field("name", &self.name)
            .field("dtype", &self.dtype)
            .field("ne", &self.ne)
            .field("nb", &self.nb)
            .finish()
    }
}

/// A graph node offered to the collector.
#[derive(Debug, Clone, Copy)]
pub struct GraphNode<'a> {
    /// Operation
    pub op: OpKind,
    /// First operand: the weight matrix (`ne[2]` = expert count when routed)
    pub weights: TensorView<'a>,
    /// Second operand: activations `[features, rows, tokens]`
    pub input: TensorView<'a>,
    /// Selected expert ids `[top_k, tokens]`, routed multiplies only
    pub ids: Option<TensorView<'a>>,
}

impl<'a> GraphNode<'a> {
    /// Dense matrix multiply node.
    pub fn mul_mat(weights: TensorView<'a>, input: TensorView<'a>) -> Self {
        Self {
            op: OpKind::MulMat,
            weights,
            input,
            ids: None,
        }
    }

    /// Expert-routed matrix multiply node.
    pub fn mul_mat_id(weights: TensorView<'a>, input: TensorView<'a>, ids: TensorView<'a>) -> Self {
        Self {
            op: OpKind::MulMatId,
            weights,
            input,
            ids: Some(ids),
        }
    }
}

/// Pack `f32` values into native-endian bytes.
pub fn f32_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_ne_bytes()).collect()
}

/// Pack `i32` values into native-endian bytes.
pub fn i32_bytes(values: &[i32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_ne_bytes()).collect()
}
