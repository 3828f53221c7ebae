//! Process-wide operation surface.
//!
//! A single engine instance lives behind a mutex so concurrent callers
//! serialize: the activation buffers, KV cache and sampler scratch are
//! shared singletons. Load-time failures surface from [`init`]; every
//! other operation is non-throwing and returns empty results while no
//! engine is loaded.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::engine::Engine;
use crate::error::EngineError;
use crate::generate::GenerateRequest;
use crate::settings::Settings;

static ENGINE: Mutex<Option<Engine>> = Mutex::new(None);

fn engine() -> MutexGuard<'static, Option<Engine>> {
    // A poisoned lock only means another caller panicked mid-operation;
    // the engine state itself is still structurally sound.
    ENGINE.lock().unwrap_or_else(|e| e.into_inner())
}

/// Load a model with default settings, replacing any current engine.
pub fn init(path: &str) -> Result<(), EngineError> {
    init_with(path, Settings::default())
}

pub fn init_with(path: &str, settings: Settings) -> Result<(), EngineError> {
    // A failed load leaves the surface uninitialized, even if an earlier
    // model was resident.
    match Engine::load_with(Path::new(path), settings) {
        Ok(loaded) => {
            *engine() = Some(loaded);
            Ok(())
        }
        Err(err) => {
            *engine() = None;
            Err(err)
        }
    }
}

/// Release the engine and everything it owns.
pub fn free() {
    *engine() = None;
}

pub fn is_initialized() -> bool {
    engine().is_some()
}

/// Clear the KV cache and the sampler window.
pub fn reset() {
    if let Some(e) = engine().as_mut() {
        e.reset();
    }
}

pub fn set_temp_floor(floor: f32) {
    if let Some(e) = engine().as_mut() {
        e.set_temperature_floor(floor);
    }
}

pub fn set_rep_penalty(penalty: f32, window: usize) {
    if let Some(e) = engine().as_mut() {
        e.set_repetition_penalty(penalty, window);
    }
}

pub fn set_freq_penalty(penalty: f32) {
    if let Some(e) = engine().as_mut() {
        e.set_frequency_penalty(penalty);
    }
}

/// Run a generation. Returns the generated token count and the output
/// bytes, truncated to `max_output_bytes`. Without a loaded engine the
/// result is empty.
pub fn generate(
    prompt: &str,
    anchor: Option<&str>,
    max_tokens: usize,
    temperature: f32,
    top_p: f32,
    max_output_bytes: usize,
    seed: Option<u64>,
) -> (usize, Vec<u8>) {
    let mut guard = engine();
    let Some(e) = guard.as_mut() else {
        return (0, Vec::new());
    };
    let req = GenerateRequest {
        prompt,
        anchor,
        max_tokens,
        temperature,
        top_p,
        max_output_bytes,
        seed,
    };
    let mut outcome = e.generate(&req);
    outcome.text.truncate(max_output_bytes);
    (outcome.tokens, outcome.text)
}

/// Encode text to ids; empty without a loaded engine.
pub fn encode(text: &str) -> Vec<u32> {
    match engine().as_ref() {
        Some(e) => e.encode(text),
        None => Vec::new(),
    }
}

/// Decode one token id to bytes; empty without a loaded engine.
pub fn decode_token(id: u32) -> Vec<u8> {
    let mut out = Vec::new();
    if let Some(e) = engine().as_ref() {
        e.decode_token(id, &mut out);
    }
    out
}

pub fn get_vocab_size() -> usize {
    engine().as_ref().map_or(0, Engine::vocab_size)
}

pub fn get_dim() -> usize {
    engine().as_ref().map_or(0, Engine::dim)
}

pub fn get_seq_len() -> usize {
    engine().as_ref().map_or(0, Engine::seq_len)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::testutil::tiny_model_gguf;

    // The surface shares one global engine, so everything runs in a
    // single test to avoid cross-test interference.
    #[test]
    fn surface_lifecycle() {
        free();

        // Uninitialized: non-throwing, empty results.
        assert!(!is_initialized());
        assert_eq!(get_vocab_size(), 0);
        assert_eq!(get_dim(), 0);
        assert_eq!(get_seq_len(), 0);
        assert!(encode("hello").is_empty());
        assert!(decode_token(4).is_empty());
        let (count, text) = generate("hi", None, 8, 0.8, 1.0, 256, Some(1));
        assert_eq!(count, 0);
        assert!(text.is_empty());
        reset();
        set_temp_floor(0.1);
        set_rep_penalty(1.2, 32);
        set_freq_penalty(0.1);

        // Bad path fails and leaves the engine uninitialized.
        assert!(init("/nonexistent/model.gguf").is_err());
        assert!(!is_initialized());

        // Working model.
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&tiny_model_gguf(false)).unwrap();
        file.flush().unwrap();
        init(file.path().to_str().unwrap()).unwrap();
        assert!(is_initialized());
        assert_eq!(get_vocab_size(), 16);
        assert_eq!(get_dim(), 8);
        assert_eq!(get_seq_len(), 32);

        let ids = encode("a");
        assert!(!ids.is_empty());
        assert_eq!(decode_token(4), b"a");

        let (count_a, text_a) = generate("a", None, 6, 0.9, 1.0, 128, Some(42));
        let (count_b, text_b) = generate("a", None, 6, 0.9, 1.0, 128, Some(42));
        assert_eq!(count_a, count_b);
        assert_eq!(text_a, text_b);

        // Output cap truncates the returned bytes.
        let (_, capped) = generate("a", None, 6, 0.9, 1.0, 2, Some(42));
        assert!(capped.len() <= 2);

        free();
        assert!(!is_initialized());
        assert_eq!(get_vocab_size(), 0);
    }
}
