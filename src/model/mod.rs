//! Decoder-only transformer forward path.
//!
//! One [`Model::forward`] call advances the sequence by a single token:
//! embedding lookup, N decoder blocks (RMSNorm, grouped-query attention
//! with rotary embeddings, RMSNorm, SwiGLU), final norm and the output
//! projection into the logits buffer. Keys and values are appended to the
//! persistent cache as a side effect.
//!
//! Weight matrices stay in their container encoding (F32, F16 or Q4_0)
//! and are consumed through the fused matvec kernels; activation buffers
//! are allocated once and reused for every token.

mod config;
mod kv_cache;

pub use config::HyperParams;
pub use kv_cache::KvCache;

use tracing::debug;

use crate::error::EngineError;
use crate::gguf::{Dtype, Gguf, TensorInfo};

#[derive(Debug)]
struct LayerWeights {
    attn_norm: Vec<f32>,
    wq: TensorInfo,
    wk: TensorInfo,
    wv: TensorInfo,
    wo: TensorInfo,
    bq: Option<Vec<f32>>,
    bk: Option<Vec<f32>>,
    ffn_norm: Vec<f32>,
    w_gate: TensorInfo,
    w_up: TensorInfo,
    w_down: TensorInfo,
}

/// Per-token scratch space, provisioned once at load.
#[derive(Debug)]
struct ActState {
    /// Residual stream [D].
    x: Vec<f32>,
    /// Normed input / attention head outputs [D].
    xb: Vec<f32>,
    /// Projection results folded back into the residual [D].
    xb2: Vec<f32>,
    /// MLP gate activations [M].
    hb: Vec<f32>,
    /// MLP up-projection [M].
    hb2: Vec<f32>,
    /// Query [D], key/value rows [Hk*Dh].
    q: Vec<f32>,
    k: Vec<f32>,
    v: Vec<f32>,
    /// Attention scores [H * Smax].
    attn: Vec<f32>,
    /// Output logits [V].
    logits: Vec<f32>,
}

impl ActState {
    fn new(p: &HyperParams) -> Result<Self, EngineError> {
        let alloc = |len: usize| -> Result<Vec<f32>, EngineError> {
            let mut v = Vec::new();
            v.try_reserve_exact(len)
                .map_err(|_| EngineError::Allocation(format!("activation buffer of {len} floats")))?;
            v.resize(len, 0.0);
            Ok(v)
        };
        Ok(Self {
            x: alloc(p.dim)?,
            xb: alloc(p.dim)?,
            xb2: alloc(p.dim)?,
            hb: alloc(p.hidden_dim)?,
            hb2: alloc(p.hidden_dim)?,
            q: alloc(p.dim)?,
            k: alloc(p.kv_dim())?,
            v: alloc(p.kv_dim())?,
            attn: alloc(p.n_heads * p.seq_len)?,
            logits: alloc(p.vocab_size)?,
        })
    }
}

#[derive(Debug)]
pub struct Model {
    gguf: Gguf,
    params: HyperParams,
    token_embd: TensorInfo,
    layers: Vec<LayerWeights>,
    final_norm: Vec<f32>,
    /// Absent when the output projection is tied to the embedding.
    output: Option<TensorInfo>,
    cache: KvCache,
    state: ActState,
}

impl Model {
    pub fn new(gguf: Gguf, context_cap: usize) -> Result<Self, EngineError> {
        let params = HyperParams::from_gguf(&gguf, context_cap)?;
        let kv_dim = params.kv_dim();

        let token_embd = matrix(&gguf, "token_embd.weight", params.vocab_size, params.dim)?;

        let mut layers = Vec::with_capacity(params.n_layers);
        for l in 0..params.n_layers {
            layers.push(LayerWeights {
                attn_norm: vector(&gguf, &format!("blk.{l}.attn_norm.weight"), params.dim)?,
                wq: matrix(&gguf, &format!("blk.{l}.attn_q.weight"), params.dim, params.dim)?,
                wk: matrix(&gguf, &format!("blk.{l}.attn_k.weight"), kv_dim, params.dim)?,
                wv: matrix(&gguf, &format!("blk.{l}.attn_v.weight"), kv_dim, params.dim)?,
                wo: matrix(
                    &gguf,
                    &format!("blk.{l}.attn_output.weight"),
                    params.dim,
                    params.dim,
                )?,
                bq: optional_vector(&gguf, &format!("blk.{l}.attn_q.bias"), params.dim)?,
                bk: optional_vector(&gguf, &format!("blk.{l}.attn_k.bias"), kv_dim)?,
                ffn_norm: vector(&gguf, &format!("blk.{l}.ffn_norm.weight"), params.dim)?,
                w_gate: matrix(
                    &gguf,
                    &format!("blk.{l}.ffn_gate.weight"),
                    params.hidden_dim,
                    params.dim,
                )?,
                w_up: matrix(
                    &gguf,
                    &format!("blk.{l}.ffn_up.weight"),
                    params.hidden_dim,
                    params.dim,
                )?,
                w_down: matrix(
                    &gguf,
                    &format!("blk.{l}.ffn_down.weight"),
                    params.dim,
                    params.hidden_dim,
                )?,
            });
        }

        let final_norm = vector(&gguf, "output_norm.weight", params.dim)?;
        let output = match gguf.tensor("output.weight") {
            Some(_) => Some(matrix(&gguf, "output.weight", params.vocab_size, params.dim)?),
            None => {
                debug!("output projection tied to token embedding");
                None
            }
        };

        let cache = KvCache::new(params.n_layers, params.seq_len, kv_dim)?;
        let state = ActState::new(&params)?;

        Ok(Self {
            gguf,
            params,
            token_embd,
            layers,
            final_norm,
            output,
            cache,
            state,
        })
    }

    pub fn params(&self) -> &HyperParams {
        &self.params
    }

    pub fn gguf(&self) -> &Gguf {
        &self.gguf
    }

    /// Logits written by the most recent forward call.
    pub fn logits(&self) -> &[f32] {
        &self.state.logits
    }

    pub fn logits_mut(&mut self) -> &mut [f32] {
        &mut self.state.logits
    }

    /// Positions currently held in the KV cache.
    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }

    /// Drop all cached positions; the next forward starts a new sequence.
    pub fn reset(&mut self) {
        self.cache.reset();
    }

    /// Advance by one token at position `pos`, overwriting the logits
    /// buffer. Out-of-range ids fall back to the embedding for id 0; the
    /// caller is responsible for keeping `pos` below the sequence limit.
    pub fn forward(&mut self, token: u32, pos: usize) {
        let Model {
            gguf,
            params: p,
            token_embd,
            layers,
            final_norm,
            output,
            cache,
            state: s,
        } = self;

        let token = if (token as usize) < p.vocab_size {
            token as usize
        } else {
            0
        };
        gguf.view(token_embd).dequant_row(token, &mut s.x);

        let head_dim = p.head_dim;
        let scale = 1.0 / (head_dim as f32).sqrt();
        let groups = p.gqa_groups();

        for (l, layer) in layers.iter().enumerate() {
            rmsnorm(&mut s.xb, &s.x, &layer.attn_norm, p.norm_eps);

            gguf.view(&layer.wq).matvec(&mut s.q, &s.xb);
            gguf.view(&layer.wk).matvec(&mut s.k, &s.xb);
            gguf.view(&layer.wv).matvec(&mut s.v, &s.xb);
            if let Some(bq) = &layer.bq {
                add_assign(&mut s.q, bq);
            }
            if let Some(bk) = &layer.bk {
                add_assign(&mut s.k, bk);
            }

            rope(&mut s.q, head_dim, pos, p.rope_theta);
            rope(&mut s.k, head_dim, pos, p.rope_theta);

            cache.store(l, pos, &s.k, &s.v);

            // One query head at a time; kv head h / (H / Hk).
            for h in 0..p.n_heads {
                let q_h = &s.q[h * head_dim..(h + 1) * head_dim];
                let kv_off = (h / groups) * head_dim;
                let att = &mut s.attn[h * p.seq_len..h * p.seq_len + pos + 1];
                for (i, a) in att.iter_mut().enumerate() {
                    let k_i = &cache.key(l, i)[kv_off..kv_off + head_dim];
                    *a = crate::quant::dot(q_h, k_i) * scale;
                }
                softmax(att);
                let out = &mut s.xb[h * head_dim..(h + 1) * head_dim];
                out.fill(0.0);
                for (i, &w) in att.iter().enumerate() {
                    let v_i = &cache.value(l, i)[kv_off..kv_off + head_dim];
                    for (o, &vv) in out.iter_mut().zip(v_i.iter()) {
                        *o += w * vv;
                    }
                }
            }

            gguf.view(&layer.wo).matvec(&mut s.xb2, &s.xb);
            add_assign(&mut s.x, &s.xb2);

            rmsnorm(&mut s.xb, &s.x, &layer.ffn_norm, p.norm_eps);
            gguf.view(&layer.w_gate).matvec(&mut s.hb, &s.xb);
            gguf.view(&layer.w_up).matvec(&mut s.hb2, &s.xb);
            for (g, &u) in s.hb.iter_mut().zip(s.hb2.iter()) {
                *g = silu(*g) * u;
            }
            gguf.view(&layer.w_down).matvec(&mut s.xb2, &s.hb);
            add_assign(&mut s.x, &s.xb2);
        }

        rmsnorm(&mut s.xb, &s.x, final_norm, p.norm_eps);
        let out_w = output.as_ref().unwrap_or(token_embd);
        gguf.view(out_w).matvec(&mut s.logits, &s.xb);
    }
}

/// Fetch a required matrix tensor and validate its logical shape.
fn matrix(
    gguf: &Gguf,
    name: &str,
    rows: usize,
    cols: usize,
) -> Result<TensorInfo, EngineError> {
    let info = gguf
        .tensor(name)
        .ok_or_else(|| EngineError::MissingTensor(name.to_string()))?;
    if info.rows() != rows || info.cols() != cols {
        return Err(EngineError::ShapeMismatch {
            name: name.to_string(),
            expected: vec![rows, cols],
            got: vec![info.rows(), info.cols()],
        });
    }
    Ok(info.clone())
}

/// Fetch a required 1-D f32/f16 tensor as owned f32 values.
fn vector(gguf: &Gguf, name: &str, len: usize) -> Result<Vec<f32>, EngineError> {
    let info = gguf
        .tensor(name)
        .ok_or_else(|| EngineError::MissingTensor(name.to_string()))?;
    if info.elem_count() != len {
        return Err(EngineError::ShapeMismatch {
            name: name.to_string(),
            expected: vec![len],
            got: info.dims.clone(),
        });
    }
    if info.dtype == Dtype::Q4_0 {
        return Err(EngineError::InvalidTensor {
            name: name.to_string(),
            reason: "quantized norm or bias vector".into(),
        });
    }
    Ok(gguf.view(info).to_f32_vec())
}

fn optional_vector(
    gguf: &Gguf,
    name: &str,
    len: usize,
) -> Result<Option<Vec<f32>>, EngineError> {
    if gguf.tensor(name).is_none() {
        return Ok(None);
    }
    vector(gguf, name, len).map(Some)
}

/// y = x * rsqrt(mean(x^2) + eps) * gain
pub(crate) fn rmsnorm(out: &mut [f32], x: &[f32], gain: &[f32], eps: f32) {
    let mean_sq = x.iter().map(|v| v * v).sum::<f32>() / x.len() as f32;
    let inv = 1.0 / (mean_sq + eps).sqrt();
    for ((o, &xi), &g) in out.iter_mut().zip(x.iter()).zip(gain.iter()) {
        *o = xi * inv * g;
    }
}

/// In-place softmax with max subtraction.
pub(crate) fn softmax(x: &mut [f32]) {
    let max = x.iter().fold(f32::NEG_INFINITY, |m, &v| m.max(v));
    let mut sum = 0.0f32;
    for v in x.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    if sum > 0.0 {
        for v in x.iter_mut() {
            *v /= sum;
        }
    }
}

#[inline]
pub(crate) fn silu(z: f32) -> f32 {
    z / (1.0 + (-z).exp())
}

fn add_assign(x: &mut [f32], y: &[f32]) {
    for (a, &b) in x.iter_mut().zip(y.iter()) {
        *a += b;
    }
}

/// Rotate adjacent (even, odd) pairs of every head by pos * theta^(-2j/Dh).
fn rope(vec: &mut [f32], head_dim: usize, pos: usize, theta: f32) {
    let half = head_dim / 2;
    for head in vec.chunks_exact_mut(head_dim) {
        for j in 0..half {
            let freq = theta.powf(-2.0 * j as f32 / head_dim as f32);
            let (sin, cos) = (pos as f32 * freq).sin_cos();
            let a = head[2 * j];
            let b = head[2 * j + 1];
            head[2 * j] = a * cos - b * sin;
            head[2 * j + 1] = a * sin + b * cos;
        }
    }
}
