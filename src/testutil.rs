#![cfg(test)]

//! Shared test fixtures: an in-memory GGUF container writer and a tiny
//! llama-family model used across loader, model and generation tests.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const ALIGNMENT: usize = 32;

// Metadata value type tags (mirrors the parser).
const T_U32: u32 = 4;
const T_I32: u32 = 5;
const T_F32: u32 = 6;
const T_BOOL: u32 = 7;
const T_STRING: u32 = 8;
const T_ARRAY: u32 = 9;

/// Builds a syntactically valid GGUF byte buffer.
pub struct GgufBuilder {
    version: u32,
    meta: Vec<(String, Vec<u8>)>,
    tensors: Vec<(String, Vec<usize>, u32, Vec<u8>)>,
}

fn put_string(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u64).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

impl GgufBuilder {
    pub fn new() -> Self {
        Self {
            version: 3,
            meta: Vec::new(),
            tensors: Vec::new(),
        }
    }

    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    fn push_meta(&mut self, key: &str, value: Vec<u8>) {
        self.meta.push((key.to_string(), value));
    }

    pub fn u32(mut self, key: &str, v: u32) -> Self {
        let mut enc = T_U32.to_le_bytes().to_vec();
        enc.extend_from_slice(&v.to_le_bytes());
        self.push_meta(key, enc);
        self
    }

    pub fn f32(mut self, key: &str, v: f32) -> Self {
        let mut enc = T_F32.to_le_bytes().to_vec();
        enc.extend_from_slice(&v.to_le_bytes());
        self.push_meta(key, enc);
        self
    }

    pub fn bool_(mut self, key: &str, v: bool) -> Self {
        let mut enc = T_BOOL.to_le_bytes().to_vec();
        enc.push(v as u8);
        self.push_meta(key, enc);
        self
    }

    pub fn string(mut self, key: &str, v: &str) -> Self {
        let mut enc = T_STRING.to_le_bytes().to_vec();
        put_string(&mut enc, v);
        self.push_meta(key, enc);
        self
    }

    pub fn str_array(mut self, key: &str, items: &[&str]) -> Self {
        let mut enc = T_ARRAY.to_le_bytes().to_vec();
        enc.extend_from_slice(&T_STRING.to_le_bytes());
        enc.extend_from_slice(&(items.len() as u64).to_le_bytes());
        for item in items {
            put_string(&mut enc, item);
        }
        self.push_meta(key, enc);
        self
    }

    pub fn f32_array(mut self, key: &str, items: &[f32]) -> Self {
        let mut enc = T_ARRAY.to_le_bytes().to_vec();
        enc.extend_from_slice(&T_F32.to_le_bytes());
        enc.extend_from_slice(&(items.len() as u64).to_le_bytes());
        for v in items {
            enc.extend_from_slice(&v.to_le_bytes());
        }
        self.push_meta(key, enc);
        self
    }

    pub fn i32_array(mut self, key: &str, items: &[i32]) -> Self {
        let mut enc = T_ARRAY.to_le_bytes().to_vec();
        enc.extend_from_slice(&T_I32.to_le_bytes());
        enc.extend_from_slice(&(items.len() as u64).to_le_bytes());
        for v in items {
            enc.extend_from_slice(&v.to_le_bytes());
        }
        self.push_meta(key, enc);
        self
    }

    /// Add an f32 tensor. `dims` are in file order (fastest dimension
    /// first), so a logical [rows, cols] matrix is `&[cols, rows]`.
    pub fn tensor_f32(mut self, name: &str, dims: &[usize], data: &[f32]) -> Self {
        assert_eq!(dims.iter().product::<usize>(), data.len());
        let bytes: Vec<u8> = data.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.tensors.push((name.to_string(), dims.to_vec(), 0, bytes));
        self
    }

    pub fn tensor_raw(mut self, name: &str, dims: &[usize], code: u32, bytes: Vec<u8>) -> Self {
        self.tensors.push((name.to_string(), dims.to_vec(), code, bytes));
        self
    }

    pub fn build(self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"GGUF");
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&(self.tensors.len() as u64).to_le_bytes());
        out.extend_from_slice(&(self.meta.len() as u64).to_le_bytes());

        for (key, enc) in &self.meta {
            put_string(&mut out, key);
            out.extend_from_slice(enc);
        }

        // Directory entries with per-tensor 32-byte aligned offsets.
        let mut offset = 0usize;
        for (name, dims, code, bytes) in &self.tensors {
            offset = (offset + ALIGNMENT - 1) & !(ALIGNMENT - 1);
            put_string(&mut out, name);
            out.extend_from_slice(&(dims.len() as u32).to_le_bytes());
            for d in dims {
                out.extend_from_slice(&(*d as u64).to_le_bytes());
            }
            out.extend_from_slice(&code.to_le_bytes());
            out.extend_from_slice(&(offset as u64).to_le_bytes());
            offset += bytes.len();
        }

        while out.len() % ALIGNMENT != 0 {
            out.push(0);
        }
        for (_, _, _, bytes) in &self.tensors {
            while out.len() % ALIGNMENT != 0 {
                out.push(0);
            }
            out.extend_from_slice(bytes);
        }
        out
    }
}

/// Hyperparameters of the tiny test model.
pub const TINY_VOCAB: usize = 16;
pub const TINY_DIM: usize = 8;
pub const TINY_LAYERS: usize = 2;
pub const TINY_HEADS: usize = 2;
pub const TINY_KV_HEADS: usize = 1;
pub const TINY_HIDDEN: usize = 16;
pub const TINY_CTX: usize = 32;

pub const TINY_TOKENS: [&str; TINY_VOCAB] = [
    "<unk>", "<s>", "</s>", "\u{2581}", "a", "b", "c", "d", "ab", "\u{2581}a", ".", "<0x41>",
    "<0x42>", "e", "f", "!",
];

fn rand_vec(rng: &mut StdRng, len: usize, scale: f32) -> Vec<f32> {
    (0..len).map(|_| rng.gen_range(-scale..scale)).collect()
}

/// A complete, loadable SentencePiece llama model with random weights.
/// With `tied` the `output.weight` tensor is omitted so logits reuse the
/// embedding.
pub fn tiny_model_gguf(tied: bool) -> Vec<u8> {
    let kv_dim = TINY_KV_HEADS * (TINY_DIM / TINY_HEADS);
    let scores: Vec<f32> = vec![
        0.0, 0.0, 0.0, -1.0, -2.0, -2.0, -2.5, -2.5, -1.5, -1.2, -3.0, 0.0, 0.0, -2.0, -2.0, -3.0,
    ];
    // 2 = unknown, 3 = control, 1 = normal, 6 = byte
    let types: Vec<i32> = vec![2, 3, 3, 1, 1, 1, 1, 1, 1, 1, 1, 6, 6, 1, 1, 1];

    let mut b = GgufBuilder::new()
        .string("general.architecture", "llama")
        .u32("llama.block_count", TINY_LAYERS as u32)
        .u32("llama.embedding_length", TINY_DIM as u32)
        .u32("llama.attention.head_count", TINY_HEADS as u32)
        .u32("llama.attention.head_count_kv", TINY_KV_HEADS as u32)
        .u32("llama.feed_forward_length", TINY_HIDDEN as u32)
        .u32("llama.context_length", TINY_CTX as u32)
        .f32("llama.rope.freq_base", 10000.0)
        .f32("llama.attention.layer_norm_rms_epsilon", 1e-5)
        .string("tokenizer.ggml.model", "llama")
        .str_array("tokenizer.ggml.tokens", &TINY_TOKENS)
        .f32_array("tokenizer.ggml.scores", &scores)
        .i32_array("tokenizer.ggml.token_type", &types)
        .u32("tokenizer.ggml.bos_token_id", 1)
        .u32("tokenizer.ggml.eos_token_id", 2)
        .bool_("tokenizer.ggml.add_bos_token", true);

    let mut rng = StdRng::seed_from_u64(42);
    b = b.tensor_f32(
        "token_embd.weight",
        &[TINY_DIM, TINY_VOCAB],
        &rand_vec(&mut rng, TINY_VOCAB * TINY_DIM, 0.5),
    );
    for layer in 0..TINY_LAYERS {
        let ones: Vec<f32> = (0..TINY_DIM).map(|_| 1.0 + rng.gen_range(-0.05..0.05)).collect();
        b = b
            .tensor_f32(&format!("blk.{layer}.attn_norm.weight"), &[TINY_DIM], &ones)
            .tensor_f32(
                &format!("blk.{layer}.attn_q.weight"),
                &[TINY_DIM, TINY_DIM],
                &rand_vec(&mut rng, TINY_DIM * TINY_DIM, 0.3),
            )
            .tensor_f32(
                &format!("blk.{layer}.attn_k.weight"),
                &[TINY_DIM, kv_dim],
                &rand_vec(&mut rng, kv_dim * TINY_DIM, 0.3),
            )
            .tensor_f32(
                &format!("blk.{layer}.attn_v.weight"),
                &[TINY_DIM, kv_dim],
                &rand_vec(&mut rng, kv_dim * TINY_DIM, 0.3),
            )
            .tensor_f32(
                &format!("blk.{layer}.attn_output.weight"),
                &[TINY_DIM, TINY_DIM],
                &rand_vec(&mut rng, TINY_DIM * TINY_DIM, 0.3),
            );
        let ffn_ones: Vec<f32> = (0..TINY_DIM).map(|_| 1.0 + rng.gen_range(-0.05..0.05)).collect();
        b = b
            .tensor_f32(&format!("blk.{layer}.ffn_norm.weight"), &[TINY_DIM], &ffn_ones)
            .tensor_f32(
                &format!("blk.{layer}.ffn_gate.weight"),
                &[TINY_DIM, TINY_HIDDEN],
                &rand_vec(&mut rng, TINY_HIDDEN * TINY_DIM, 0.3),
            )
            .tensor_f32(
                &format!("blk.{layer}.ffn_up.weight"),
                &[TINY_DIM, TINY_HIDDEN],
                &rand_vec(&mut rng, TINY_HIDDEN * TINY_DIM, 0.3),
            )
            .tensor_f32(
                &format!("blk.{layer}.ffn_down.weight"),
                &[TINY_HIDDEN, TINY_DIM],
                &rand_vec(&mut rng, TINY_DIM * TINY_HIDDEN, 0.3),
            );
    }
    let final_ones: Vec<f32> = (0..TINY_DIM).map(|_| 1.0 + rng.gen_range(-0.05..0.05)).collect();
    b = b.tensor_f32("output_norm.weight", &[TINY_DIM], &final_ones);
    if !tied {
        b = b.tensor_f32(
            "output.weight",
            &[TINY_DIM, TINY_VOCAB],
            &rand_vec(&mut rng, TINY_VOCAB * TINY_DIM, 0.5),
        );
    }
    b.build()
}
