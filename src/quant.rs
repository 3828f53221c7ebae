//! Quantized tensor kernels.
//!
//! The only quantized weight format is Q4_0: blocks of 32 values packed as
//! one f16 scale followed by 16 bytes of 4-bit nibbles. Matrix-vector
//! products fuse dequantization with the inner product so the full f32
//! matrix is never materialized. All accumulation is f32.

/// Values per Q4_0 block.
pub const QK4_0: usize = 32;

/// Bytes per Q4_0 block: f16 scale (2) + 16 packed nibble bytes.
pub const Q4_0_BLOCK_BYTES: usize = 18;

/// Decode an IEEE-754 binary16 value, including denormals, infinities and
/// NaN payload passthrough.
pub fn f16_to_f32(bits: u16) -> f32 {
    let sign = (bits as u32 >> 15) << 31;
    let exp = (bits >> 10) & 0x1f;
    let frac = (bits & 0x3ff) as u32;

    let word = match (exp, frac) {
        (0, 0) => sign,
        (0, _) => {
            // Denormal: renormalize into the f32 exponent range.
            let shift = frac.leading_zeros() - 21;
            let frac = (frac << shift) & 0x3ff;
            let exp = 127 - 14 - shift;
            sign | (exp << 23) | (frac << 13)
        }
        (0x1f, 0) => sign | 0x7f80_0000,
        (0x1f, _) => sign | 0x7f80_0000 | (frac << 13),
        _ => sign | ((exp as u32 + 127 - 15) << 23) | (frac << 13),
    };
    f32::from_bits(word)
}

/// Read the f16 scale at the head of a Q4_0 block.
#[inline]
fn block_scale(block: &[u8]) -> f32 {
    f16_to_f32(u16::from_le_bytes([block[0], block[1]]))
}

/// Dequantize one Q4_0 block into 32 f32 values.
///
/// Low nibble of packed byte `i` is block index `i`, high nibble is block
/// index `i + 16`; value = scale * (nibble - 8).
pub fn dequant_block_q4_0(block: &[u8], out: &mut [f32]) {
    debug_assert_eq!(block.len(), Q4_0_BLOCK_BYTES);
    debug_assert_eq!(out.len(), QK4_0);
    let scale = block_scale(block);
    for i in 0..16 {
        let byte = block[2 + i];
        out[i] = scale * ((byte & 0x0f) as f32 - 8.0);
        out[i + 16] = scale * ((byte >> 4) as f32 - 8.0);
    }
}

/// Dot product, f32 accumulation.
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    let mut sum = 0.0f32;
    for (&ai, &bi) in a.iter().zip(b.iter()) {
        sum += ai * bi;
    }
    sum
}

/// out[r] = sum_c w[r, c] * x[c] for a row-major f32 matrix stored as
/// little-endian bytes.
pub fn matvec_f32(out: &mut [f32], w: &[u8], x: &[f32]) {
    let cols = x.len();
    debug_assert_eq!(w.len(), out.len() * cols * 4);
    for (r, o) in out.iter_mut().enumerate() {
        let row = &w[r * cols * 4..(r + 1) * cols * 4];
        let mut sum = 0.0f32;
        for (chunk, &xc) in row.chunks_exact(4).zip(x.iter()) {
            sum += f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) * xc;
        }
        *o = sum;
    }
}

/// out[r] = sum_c w[r, c] * x[c] for a row-major f16 matrix.
pub fn matvec_f16(out: &mut [f32], w: &[u8], x: &[f32]) {
    let cols = x.len();
    debug_assert_eq!(w.len(), out.len() * cols * 2);
    for (r, o) in out.iter_mut().enumerate() {
        let row = &w[r * cols * 2..(r + 1) * cols * 2];
        let mut sum = 0.0f32;
        for (chunk, &xc) in row.chunks_exact(2).zip(x.iter()) {
            sum += f16_to_f32(u16::from_le_bytes([chunk[0], chunk[1]])) * xc;
        }
        *o = sum;
    }
}

/// Fused Q4_0 matrix-vector product: dequantize one block at a time while
/// accumulating the inner product. `x.len()` must be a multiple of 32
/// (validated at load time).
pub fn matvec_q4_0(out: &mut [f32], w: &[u8], x: &[f32]) {
    let cols = x.len();
    debug_assert_eq!(cols % QK4_0, 0);
    let row_blocks = cols / QK4_0;
    debug_assert_eq!(w.len(), out.len() * row_blocks * Q4_0_BLOCK_BYTES);

    for (r, o) in out.iter_mut().enumerate() {
        let row = &w[r * row_blocks * Q4_0_BLOCK_BYTES..];
        let mut sum = 0.0f32;
        for b in 0..row_blocks {
            let block = &row[b * Q4_0_BLOCK_BYTES..(b + 1) * Q4_0_BLOCK_BYTES];
            let scale = block_scale(block);
            let xb = &x[b * QK4_0..(b + 1) * QK4_0];
            let mut acc = 0.0f32;
            for i in 0..16 {
                let byte = block[2 + i];
                acc += ((byte & 0x0f) as f32 - 8.0) * xb[i];
                acc += ((byte >> 4) as f32 - 8.0) * xb[i + 16];
            }
            sum += scale * acc;
        }
        *o = sum;
    }
}

/// Dequantize row `r` of a row-major f32 matrix into `out`.
pub fn dequant_row_f32(w: &[u8], cols: usize, r: usize, out: &mut [f32]) {
    let row = &w[r * cols * 4..(r + 1) * cols * 4];
    for (chunk, o) in row.chunks_exact(4).zip(out.iter_mut()) {
        *o = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
}

/// Dequantize row `r` of a row-major f16 matrix into `out`.
pub fn dequant_row_f16(w: &[u8], cols: usize, r: usize, out: &mut [f32]) {
    let row = &w[r * cols * 2..(r + 1) * cols * 2];
    for (chunk, o) in row.chunks_exact(2).zip(out.iter_mut()) {
        *o = f16_to_f32(u16::from_le_bytes([chunk[0], chunk[1]]));
    }
}

/// Dequantize row `r` of a Q4_0 matrix into `out`.
pub fn dequant_row_q4_0(w: &[u8], cols: usize, r: usize, out: &mut [f32]) {
    debug_assert_eq!(cols % QK4_0, 0);
    let row_blocks = cols / QK4_0;
    let row = &w[r * row_blocks * Q4_0_BLOCK_BYTES..];
    for b in 0..row_blocks {
        dequant_block_q4_0(
            &row[b * Q4_0_BLOCK_BYTES..(b + 1) * Q4_0_BLOCK_BYTES],
            &mut out[b * QK4_0..(b + 1) * QK4_0],
        );
    }
}
