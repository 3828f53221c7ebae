//! Autoregressive generation: prompt prefill and the decode loop.
//!
//! Each decode step applies the repetition and frequency penalties to the
//! fresh logits, samples an id, runs the stop checks (EOS, cycle, wide-
//! rune drift, context exhaustion) and only then emits the token and
//! advances the model. After `max_tokens` a grace window keeps decoding
//! until a sentence-final byte lands, bounded by the configured limit.

use tracing::debug;

use crate::engine::Engine;

/// Parameters of one generation call.
#[derive(Debug, Clone)]
pub struct GenerateRequest<'a> {
    pub prompt: &'a str,
    /// Optional system/anchor text encoded ahead of the prompt.
    pub anchor: Option<&'a str>,
    pub max_tokens: usize,
    pub temperature: f32,
    /// Nucleus cutoff; >= 1.0 switches to top-k sampling.
    pub top_p: f32,
    /// Output byte budget for this call.
    pub max_output_bytes: usize,
    /// Fixed RNG seed for reproducible output.
    pub seed: Option<u64>,
}

impl Default for GenerateRequest<'_> {
    fn default() -> Self {
        Self {
            prompt: "",
            anchor: None,
            max_tokens: 128,
            temperature: 0.8,
            top_p: 0.95,
            max_output_bytes: 8 * 1024,
            seed: None,
        }
    }
}

/// Why the decode loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Eos,
    /// The last `cycle_len` ids exactly repeated the preceding ones.
    Cycle,
    /// A generated token started a codepoint three or more bytes wide.
    Drift,
    /// The KV cache reached the model's sequence limit.
    ContextFull,
    MaxTokens,
    OutputBudget,
}

pub struct GenerateOutcome {
    /// Generated (emitted) token count; prompt tokens are not included.
    pub tokens: usize,
    pub text: Vec<u8>,
    pub stop: StopReason,
}

impl Engine {
    /// Run a full generation, collecting the emitted bytes.
    pub fn generate(&mut self, req: &GenerateRequest) -> GenerateOutcome {
        let mut text = Vec::new();
        let (tokens, stop) = self.generate_with(req, |_, piece| text.extend_from_slice(piece));
        GenerateOutcome { tokens, text, stop }
    }

    /// Run a generation, handing every emitted token to `on_token`. This
    /// is the streaming seam: the callback observes (id, bytes) pairs in
    /// order.
    pub fn generate_with(
        &mut self,
        req: &GenerateRequest,
        mut on_token: impl FnMut(u32, &[u8]),
    ) -> (usize, StopReason) {
        let seq_len = self.model.params().seq_len;
        let bos = self.tokenizer.bos_id();
        let eos = self.tokenizer.eos_id();

        let mut ids: Vec<u32> = Vec::new();
        if self.tokenizer.wants_bos() && bos != eos {
            ids.push(bos as u32);
        }
        if let Some(anchor) = req.anchor {
            ids.extend(self.tokenizer.encode(anchor, false));
        }
        ids.extend(self.tokenizer.encode(req.prompt, false));
        ids.truncate(seq_len.saturating_sub(1));
        if ids.is_empty() {
            // Something must seed the logits before the first sample.
            ids.push(if bos >= 0 { bos as u32 } else { 0 });
        }

        self.model.reset();
        self.sampler.reset();
        self.sampler.reseed(req.seed);
        for (i, &id) in ids.iter().enumerate() {
            self.model.forward(id, i);
        }
        let mut pos = ids.len();
        debug!(prompt_tokens = pos, "prefill complete");

        let grace_limit = self.settings.guards.grace_limit;
        let cycle_len = self.settings.guards.cycle_len;
        let drift_guard = self.settings.guards.drift_guard;
        let drift_min = self.settings.guards.drift_min_tokens;

        let mut recent: Vec<u32> = Vec::with_capacity(2 * cycle_len);
        let mut piece: Vec<u8> = Vec::with_capacity(32);
        let mut generated = 0usize;
        let mut emitted_bytes = 0usize;
        let mut last_byte: Option<u8> = None;
        let mut stop = StopReason::MaxTokens;

        for _ in 0..req.max_tokens + grace_limit {
            if emitted_bytes >= req.max_output_bytes {
                stop = StopReason::OutputBudget;
                break;
            }
            if generated >= req.max_tokens && last_byte.is_some_and(is_sentence_end) {
                stop = StopReason::MaxTokens;
                break;
            }

            self.sampler
                .apply_penalties(self.model.logits_mut());
            let id = self
                .sampler
                .sample(self.model.logits(), req.temperature, req.top_p);
            self.sampler.record(id);

            if eos >= 0 && id == eos as u32 {
                stop = StopReason::Eos;
                break;
            }
            push_recent(&mut recent, 2 * cycle_len, id);
            if repeats_cycle(&recent, cycle_len) {
                stop = StopReason::Cycle;
                break;
            }
            piece.clear();
            self.tokenizer.decode_token(id, &mut piece);
            if drift_guard && generated > drift_min && has_wide_rune(&piece) {
                stop = StopReason::Drift;
                break;
            }
            if pos >= seq_len {
                stop = StopReason::ContextFull;
                break;
            }

            emitted_bytes += piece.len();
            if let Some(&b) = piece.last() {
                last_byte = Some(b);
            }
            on_token(id, &piece);
            self.model.forward(id, pos);
            pos += 1;
            generated += 1;
        }

        debug!(generated, ?stop, "generation finished");
        (generated, stop)
    }
}

fn is_sentence_end(b: u8) -> bool {
    matches!(b, b'.' | b'!' | b'?' | b'\n')
}

/// First byte >= 0xE0 starts a codepoint of three or more UTF-8 bytes;
/// continuation and two-byte lead bytes all sit below it.
fn has_wide_rune(piece: &[u8]) -> bool {
    piece.iter().any(|&b| b >= 0xE0)
}

fn push_recent(recent: &mut Vec<u32>, cap: usize, id: u32) {
    if recent.len() == cap {
        recent.remove(0);
    }
    recent.push(id);
}

fn repeats_cycle(recent: &[u32], cycle_len: usize) -> bool {
    recent.len() == 2 * cycle_len && recent[..cycle_len] == recent[cycle_len..]
}
