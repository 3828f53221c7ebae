//! Model hyperparameters read from GGUF metadata.

use tracing::debug;

use crate::error::EngineError;
use crate::gguf::Gguf;

/// Architectures whose block layout matches the decoder implemented here.
const SUPPORTED_ARCHS: &[&str] = &["llama"];

/// Immutable model dimensions, fixed at load time.
#[derive(Debug, Clone)]
pub struct HyperParams {
    pub vocab_size: usize,
    /// Embedding width D.
    pub dim: usize,
    pub n_layers: usize,
    /// Query heads H.
    pub n_heads: usize,
    /// Key/value heads Hk (grouped-query attention when Hk < H).
    pub n_kv_heads: usize,
    /// Per-head width D / H.
    pub head_dim: usize,
    /// MLP intermediate width M.
    pub hidden_dim: usize,
    /// Maximum sequence length Smax.
    pub seq_len: usize,
    pub rope_theta: f32,
    pub norm_eps: f32,
}

impl HyperParams {
    /// Read hyperparameters from the `{arch}.` metadata namespace.
    /// `context_cap` bounds the KV-cache length; 0 means use the file's
    /// declared context length.
    pub fn from_gguf(gguf: &Gguf, context_cap: usize) -> Result<Self, EngineError> {
        let arch = gguf
            .meta_str("general.architecture")
            .ok_or_else(|| {
                EngineError::InvalidContainer("missing general.architecture".into())
            })?
            .to_string();
        if !SUPPORTED_ARCHS.contains(&arch.as_str()) {
            return Err(EngineError::UnsupportedArchitecture(arch));
        }

        let req = |key: &str| -> Result<usize, EngineError> {
            gguf.meta_u64(&format!("{arch}.{key}"))
                .map(|v| v as usize)
                .ok_or_else(|| EngineError::InvalidContainer(format!("missing {arch}.{key}")))
        };

        let dim = req("embedding_length")?;
        let n_layers = req("block_count")?;
        let n_heads = req("attention.head_count")?;
        let n_kv_heads = gguf
            .meta_u64(&format!("{arch}.attention.head_count_kv"))
            .map(|v| v as usize)
            .unwrap_or(n_heads);
        let hidden_dim = req("feed_forward_length")?;
        let mut seq_len = req("context_length")?;
        if context_cap > 0 {
            seq_len = seq_len.min(context_cap);
        }

        if n_heads == 0 || dim % n_heads != 0 {
            return Err(EngineError::InvalidContainer(format!(
                "embedding length {dim} not divisible by head count {n_heads}"
            )));
        }
        if n_kv_heads == 0 || n_kv_heads > n_heads || n_heads % n_kv_heads != 0 {
            return Err(EngineError::InvalidContainer(format!(
                "head count {n_heads} not divisible by kv head count {n_kv_heads}"
            )));
        }
        if n_layers == 0 || seq_len == 0 {
            return Err(EngineError::InvalidContainer(
                "zero layer count or context length".into(),
            ));
        }

        let rope_theta = gguf
            .meta_f32(&format!("{arch}.rope.freq_base"))
            .unwrap_or(10_000.0);
        let norm_eps = gguf
            .meta_f32(&format!("{arch}.attention.layer_norm_rms_epsilon"))
            .unwrap_or(1e-5);

        // Vocabulary size comes from the token list itself.
        let vocab_size = gguf
            .meta_str_array("tokenizer.ggml.tokens")
            .map(|t| t.len())
            .ok_or_else(|| {
                EngineError::InvalidVocabulary("missing tokenizer.ggml.tokens".into())
            })?;

        let params = Self {
            vocab_size,
            dim,
            n_layers,
            n_heads,
            n_kv_heads,
            head_dim: dim / n_heads,
            hidden_dim,
            seq_len,
            rope_theta,
            norm_eps,
        };
        debug!(?params, "model hyperparameters");
        Ok(params)
    }

    /// Width of the per-position key/value rows: Hk * Dh.
    pub fn kv_dim(&self) -> usize {
        self.n_kv_heads * self.head_dim
    }

    /// Query heads sharing one kv head: H / Hk.
    pub fn gqa_groups(&self) -> usize {
        self.n_heads / self.n_kv_heads
    }
}
