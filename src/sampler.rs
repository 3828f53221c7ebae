//! Token sampling: repetition/frequency penalties over a sliding window,
//! top-k and nucleus kernels, seeded RNG.
//!
//! Scratch buffers are sized to the vocabulary at construction; the
//! sampling kernels themselves never allocate. NaN logits are treated as
//! negative infinity and can never be selected.

use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::EngineError;
use crate::settings::SamplerSettings;

pub struct Sampler {
    rng: StdRng,
    temperature_floor: f32,
    top_k: usize,
    repetition_penalty: f32,
    frequency_penalty: f32,
    window_cap: usize,
    /// Recent ids, oldest first.
    window: VecDeque<u32>,
    /// Occurrence counts for the ids currently in the window.
    counts: HashMap<u32, u32>,
    /// Vocab-sized probability scratch.
    probs: Vec<f32>,
    /// Vocab-sized index permutation scratch.
    indices: Vec<u32>,
}

impl Sampler {
    pub fn new(vocab_size: usize, settings: &SamplerSettings) -> Result<Self, EngineError> {
        let mut probs = Vec::new();
        probs
            .try_reserve_exact(vocab_size)
            .map_err(|_| EngineError::Allocation(format!("sampler scratch of {vocab_size}")))?;
        probs.resize(vocab_size, 0.0);
        let mut indices = Vec::new();
        indices
            .try_reserve_exact(vocab_size)
            .map_err(|_| EngineError::Allocation(format!("sampler scratch of {vocab_size}")))?;
        indices.resize(vocab_size, 0);

        Ok(Self {
            rng: StdRng::from_entropy(),
            temperature_floor: settings.temperature_floor,
            top_k: settings.top_k.max(1),
            repetition_penalty: settings.repetition_penalty,
            frequency_penalty: settings.frequency_penalty,
            window_cap: settings.repetition_window,
            window: VecDeque::with_capacity(settings.repetition_window + 1),
            counts: HashMap::with_capacity(settings.repetition_window),
            probs,
            indices,
        })
    }

    /// Fix the RNG for reproducible generations, or return to OS entropy.
    pub fn reseed(&mut self, seed: Option<u64>) {
        self.rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
    }

    /// Forget the recent-id window.
    pub fn reset(&mut self) {
        self.window.clear();
        self.counts.clear();
    }

    pub fn set_temperature_floor(&mut self, floor: f32) {
        self.temperature_floor = floor.max(0.0);
    }

    pub fn set_repetition_penalty(&mut self, penalty: f32, window: usize) {
        if penalty > 0.0 {
            self.repetition_penalty = penalty;
        }
        if window > 0 {
            self.window_cap = window;
            while self.window.len() > self.window_cap {
                let old = self.window.pop_front().expect("window not empty");
                self.forget(old);
            }
        }
    }

    pub fn set_frequency_penalty(&mut self, penalty: f32) {
        self.frequency_penalty = penalty.max(0.0);
    }

    /// Push toward zero every logit whose id sits in the window, then
    /// subtract the per-occurrence frequency penalty.
    pub fn apply_penalties(&mut self, logits: &mut [f32]) {
        for (&id, &count) in &self.counts {
            let Some(logit) = logits.get_mut(id as usize) else {
                continue;
            };
            if self.repetition_penalty != 1.0 {
                *logit = if *logit > 0.0 {
                    *logit / self.repetition_penalty
                } else {
                    *logit * self.repetition_penalty
                };
            }
            *logit -= self.frequency_penalty * count as f32;
        }
    }

    /// Append a chosen id to the window, evicting the oldest entry once
    /// the window is full.
    pub fn record(&mut self, id: u32) {
        self.window.push_back(id);
        *self.counts.entry(id).or_insert(0) += 1;
        if self.window.len() > self.window_cap {
            let old = self.window.pop_front().expect("window not empty");
            self.forget(old);
        }
    }

    fn forget(&mut self, id: u32) {
        if let Some(count) = self.counts.get_mut(&id) {
            *count -= 1;
            if *count == 0 {
                self.counts.remove(&id);
            }
        }
    }

    /// Draw the next id. Nucleus sampling when `top_p` < 1, otherwise
    /// top-k, both at the floor-clamped temperature.
    pub fn sample(&mut self, logits: &[f32], temperature: f32, top_p: f32) -> u32 {
        let t = temperature.max(self.temperature_floor);
        if t <= 0.0 {
            return argmax(logits);
        }
        if top_p < 1.0 {
            self.sample_top_p(logits, t, top_p)
        } else {
            self.sample_top_k(logits, t)
        }
    }

    /// Partial selection of the k highest logits (stable on ties by
    /// index), softmax over them, categorical draw.
    fn sample_top_k(&mut self, logits: &[f32], t: f32) -> u32 {
        let k = self.top_k.min(logits.len());
        let vals = &mut self.probs;
        let idxs = &mut self.indices;

        let mut filled = 0usize;
        for (id, &v) in logits.iter().enumerate() {
            if v.is_nan() {
                continue;
            }
            if filled == k && v <= vals[k - 1] {
                continue;
            }
            // Insert after any equal value so earlier indices stay first.
            let mut at = filled.min(k - 1);
            while at > 0 && vals[at - 1] < v {
                at -= 1;
            }
            let end = filled.min(k - 1);
            vals.copy_within(at..end, at + 1);
            idxs.copy_within(at..end, at + 1);
            vals[at] = v;
            idxs[at] = id as u32;
            filled = (filled + 1).min(k);
        }
        if filled == 0 {
            return 0;
        }

        let max = vals[0];
        let mut sum = 0.0f32;
        for v in vals[..filled].iter_mut() {
            *v = ((*v - max) / t).exp();
            sum += *v;
        }
        let mut u = self.rng.gen::<f32>() * sum;
        for i in 0..filled {
            u -= vals[i];
            if u <= 0.0 {
                return idxs[i];
            }
        }
        idxs[filled - 1]
    }

    /// Full softmax, sort by probability, sample from the smallest prefix
    /// whose cumulative mass reaches `top_p`.
    fn sample_top_p(&mut self, logits: &[f32], t: f32, top_p: f32) -> u32 {
        let n = logits.len();
        let Self {
            rng,
            probs,
            indices,
            ..
        } = self;

        let max = logits
            .iter()
            .copied()
            .filter(|v| !v.is_nan())
            .fold(f32::NEG_INFINITY, f32::max);
        if max == f32::NEG_INFINITY {
            return 0;
        }
        let mut sum = 0.0f32;
        for (p, &v) in probs.iter_mut().zip(logits.iter()) {
            *p = if v.is_nan() { 0.0 } else { ((v - max) / t).exp() };
            sum += *p;
        }
        if sum <= 0.0 {
            return 0;
        }
        for p in probs.iter_mut() {
            *p /= sum;
        }

        for (i, slot) in indices.iter_mut().enumerate() {
            *slot = i as u32;
        }
        indices[..n].sort_unstable_by(|&a, &b| {
            probs[b as usize]
                .partial_cmp(&probs[a as usize])
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.cmp(&b))
        });

        let mut cum = 0.0f32;
        let mut cutoff = n;
        for (i, &id) in indices[..n].iter().enumerate() {
            cum += probs[id as usize];
            if cum >= top_p {
                cutoff = i + 1;
                break;
            }
        }

        let mut u = rng.gen::<f32>() * cum;
        for &id in &indices[..cutoff] {
            u -= probs[id as usize];
            if u <= 0.0 {
                return id;
            }
        }
        indices[cutoff - 1]
    }
}

fn argmax(logits: &[f32]) -> u32 {
    let mut best = 0usize;
    let mut best_val = f32::NEG_INFINITY;
    for (i, &v) in logits.iter().enumerate() {
        if !v.is_nan() && v > best_val {
            best = i;
            best_val = v;
        }
    }
    best as u32
}
