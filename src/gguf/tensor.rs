//! Tensor directory entries and typed views over the tensor data region.

use crate::error::EngineError;
use crate::quant;

/// Supported tensor element types. The weight formats are F32, F16 and
/// Q4_0; everything else in the GGML type space is rejected at load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dtype {
    F32,
    F16,
    Q4_0,
}

impl Dtype {
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Dtype::F32),
            1 => Some(Dtype::F16),
            2 => Some(Dtype::Q4_0),
            _ => None,
        }
    }

    /// Bytes occupied by `count` elements of one row. For Q4_0 the count
    /// must be a whole number of 32-value blocks.
    pub fn row_bytes(self, count: usize) -> usize {
        match self {
            Dtype::F32 => count * 4,
            Dtype::F16 => count * 2,
            Dtype::Q4_0 => count / quant::QK4_0 * quant::Q4_0_BLOCK_BYTES,
        }
    }
}

/// One entry of the tensor directory. Dimension sizes are kept in file
/// order: `dims[0]` is the fastest-moving (column) dimension.
#[derive(Debug, Clone)]
pub struct TensorInfo {
    pub name: String,
    pub dims: Vec<usize>,
    pub dtype: Dtype,
    /// Byte offset relative to the tensor data base.
    pub offset: usize,
}

impl TensorInfo {
    pub fn elem_count(&self) -> usize {
        self.dims.iter().product()
    }

    /// Column count (fastest dimension).
    pub fn cols(&self) -> usize {
        self.dims.first().copied().unwrap_or(1)
    }

    /// Row count (all remaining dimensions collapsed).
    pub fn rows(&self) -> usize {
        self.dims.iter().skip(1).product()
    }

    pub fn byte_size(&self) -> Result<usize, EngineError> {
        if self.dtype == Dtype::Q4_0 && self.cols() % quant::QK4_0 != 0 {
            return Err(EngineError::InvalidTensor {
                name: self.name.clone(),
                reason: format!("row length {} is not a multiple of 32", self.cols()),
            });
        }
        Ok(self.dtype.row_bytes(self.cols()) * self.rows())
    }
}

/// Borrowed view of one tensor: dtype, logical [rows, cols] shape and the
/// raw bytes backing it.
#[derive(Debug, Clone, Copy)]
pub struct TensorView<'a> {
    pub dtype: Dtype,
    pub rows: usize,
    pub cols: usize,
    pub data: &'a [u8],
}

impl<'a> TensorView<'a> {
    /// out[r] = sum_c w[r, c] * x[c], dequantization fused per block.
    pub fn matvec(&self, out: &mut [f32], x: &[f32]) {
        debug_assert_eq!(x.len(), self.cols);
        debug_assert_eq!(out.len(), self.rows);
        match self.dtype {
            Dtype::F32 => quant::matvec_f32(out, self.data, x),
            Dtype::F16 => quant::matvec_f16(out, self.data, x),
            Dtype::Q4_0 => quant::matvec_q4_0(out, self.data, x),
        }
    }

    /// Dequantize row `r` into `out` (used for embedding lookups).
    pub fn dequant_row(&self, r: usize, out: &mut [f32]) {
        debug_assert!(r < self.rows);
        debug_assert_eq!(out.len(), self.cols);
        match self.dtype {
            Dtype::F32 => quant::dequant_row_f32(self.data, self.cols, r, out),
            Dtype::F16 => quant::dequant_row_f16(self.data, self.cols, r, out),
            Dtype::Q4_0 => quant::dequant_row_q4_0(self.data, self.cols, r, out),
        }
    }

    /// Read the whole tensor as f32 (norm weights, bias vectors).
    pub fn to_f32_vec(&self) -> Vec<f32> {
        let mut out = vec![0.0f32; self.rows * self.cols];
        for r in 0..self.rows {
            self.dequant_row(r, &mut out[r * self.cols..(r + 1) * self.cols]);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dtype_codes() {
        assert_eq!(Dtype::from_code(0), Some(Dtype::F32));
        assert_eq!(Dtype::from_code(1), Some(Dtype::F16));
        assert_eq!(Dtype::from_code(2), Some(Dtype::Q4_0));
        assert_eq!(Dtype::from_code(8), None);
    }

    #[test]
    fn shape_collapse() {
        let info = TensorInfo {
            name: "t".into(),
            dims: vec![64, 5, 2],
            dtype: Dtype::Q4_0,
            offset: 0,
        };
        assert_eq!(info.cols(), 64);
        assert_eq!(info.rows(), 10);
        assert_eq!(info.byte_size().unwrap(), 10 * 2 * 18);
    }

    #[test]
    fn ragged_q4_0_rows_rejected() {
        let info = TensorInfo {
            name: "t".into(),
            dims: vec![40, 2],
            dtype: Dtype::Q4_0,
            offset: 0,
        };
        assert!(matches!(
            info.byte_size(),
            Err(EngineError::InvalidTensor { .. })
        ));
    }
}
