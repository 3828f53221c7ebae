//! Engine facade: one loaded model with its tokenizer, sampler state and
//! settings. The value is owned by the caller; [`crate::api`] wraps a
//! single process-wide instance behind a mutex for callers that want the
//! flat operation surface.

use std::path::Path;

use tracing::info;

use crate::error::EngineError;
use crate::gguf::Gguf;
use crate::model::Model;
use crate::sampler::Sampler;
use crate::settings::Settings;
use crate::tokenizer::Tokenizer;

pub struct Engine {
    pub(crate) model: Model,
    pub(crate) tokenizer: Tokenizer,
    pub(crate) sampler: Sampler,
    pub(crate) settings: Settings,
}

impl Engine {
    /// Load a GGUF model with default settings.
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        Self::load_with(path, Settings::default())
    }

    pub fn load_with(path: &Path, settings: Settings) -> Result<Self, EngineError> {
        Self::from_gguf(Gguf::open(path)?, settings)
    }

    /// Build an engine from an already-parsed container.
    pub fn from_gguf(gguf: Gguf, settings: Settings) -> Result<Self, EngineError> {
        let tokenizer = Tokenizer::from_gguf(&gguf)?;
        let model = Model::new(gguf, settings.model.context_cap)?;
        let sampler = Sampler::new(model.params().vocab_size, &settings.sampler)?;
        let engine = Self {
            model,
            tokenizer,
            sampler,
            settings,
        };
        info!(summary = %engine.config_summary(), "model loaded");
        Ok(engine)
    }

    /// Clear the KV cache and the sampler's recent-id window.
    pub fn reset(&mut self) {
        self.model.reset();
        self.sampler.reset();
    }

    pub fn set_temperature_floor(&mut self, floor: f32) {
        self.settings.sampler.temperature_floor = floor.max(0.0);
        self.sampler.set_temperature_floor(floor);
    }

    pub fn set_repetition_penalty(&mut self, penalty: f32, window: usize) {
        if penalty > 0.0 {
            self.settings.sampler.repetition_penalty = penalty;
        }
        if window > 0 {
            self.settings.sampler.repetition_window = window;
        }
        self.sampler.set_repetition_penalty(penalty, window);
    }

    pub fn set_frequency_penalty(&mut self, penalty: f32) {
        self.settings.sampler.frequency_penalty = penalty.max(0.0);
        self.sampler.set_frequency_penalty(penalty);
    }

    /// Encode text without a BOS prefix (generation adds its own).
    pub fn encode(&self, text: &str) -> Vec<u32> {
        self.tokenizer.encode(text, false)
    }

    /// Append the bytes of one decoded token to `out`.
    pub fn decode_token(&self, id: u32, out: &mut Vec<u8>) {
        self.tokenizer.decode_token(id, out);
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    pub fn vocab_size(&self) -> usize {
        self.model.params().vocab_size
    }

    pub fn dim(&self) -> usize {
        self.model.params().dim
    }

    pub fn seq_len(&self) -> usize {
        self.model.params().seq_len
    }

    /// One-line model description for logs and tooling.
    pub fn config_summary(&self) -> String {
        let p = self.model.params();
        format!(
            "llama: {}L/{}H({}kv)/{}E, ffn={}, vocab={}, ctx={}",
            p.n_layers, p.n_heads, p.n_kv_heads, p.dim, p.hidden_dim, p.vocab_size, p.seq_len,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{tiny_model_gguf, TINY_CTX, TINY_DIM, TINY_VOCAB};

    fn tiny_engine() -> Engine {
        Engine::from_gguf(
            Gguf::from_bytes(tiny_model_gguf(false)).unwrap(),
            Settings::default(),
        )
        .unwrap()
    }

    #[test]
    fn exposes_model_stats() {
        let engine = tiny_engine();
        assert_eq!(engine.vocab_size(), TINY_VOCAB);
        assert_eq!(engine.dim(), TINY_DIM);
        assert_eq!(engine.seq_len(), TINY_CTX);
        assert!(engine.config_summary().contains("vocab=16"));
    }

    #[test]
    fn encode_and_decode_roundtrip() {
        let engine = tiny_engine();
        let ids = engine.encode("a");
        assert!(!ids.is_empty());
        let mut out = Vec::new();
        for id in ids {
            engine.decode_token(id, &mut out);
        }
        assert_eq!(out, b" a");
    }

    #[test]
    fn setters_update_sampler_settings() {
        let mut engine = tiny_engine();
        engine.set_temperature_floor(0.3);
        engine.set_repetition_penalty(1.5, 32);
        engine.set_frequency_penalty(0.7);
        assert!((engine.settings.sampler.temperature_floor - 0.3).abs() < f32::EPSILON);
        assert!((engine.settings.sampler.repetition_penalty - 1.5).abs() < f32::EPSILON);
        assert_eq!(engine.settings.sampler.repetition_window, 32);
        assert!((engine.settings.sampler.frequency_penalty - 0.7).abs() < f32::EPSILON);
    }
}
