//! Persistent key/value cache for incremental decoding.

use crate::error::EngineError;

/// Two flat f32 arrays of logical shape [layers, seq_len, kv_dim]. The
/// slot for position `p` in a layer is written exactly once, before any
/// attention read at a position >= p.
#[derive(Debug)]
pub struct KvCache {
    k: Vec<f32>,
    v: Vec<f32>,
    seq_len: usize,
    kv_dim: usize,
    cur_pos: usize,
}

impl KvCache {
    pub fn new(layers: usize, seq_len: usize, kv_dim: usize) -> Result<Self, EngineError> {
        let total = layers * seq_len * kv_dim;
        let mut k = Vec::new();
        let mut v = Vec::new();
        k.try_reserve_exact(total).map_err(|_| alloc_err(total))?;
        v.try_reserve_exact(total).map_err(|_| alloc_err(total))?;
        k.resize(total, 0.0);
        v.resize(total, 0.0);
        Ok(Self {
            k,
            v,
            seq_len,
            kv_dim,
            cur_pos: 0,
        })
    }

    /// Number of positions filled so far.
    pub fn len(&self) -> usize {
        self.cur_pos
    }

    pub fn is_empty(&self) -> bool {
        self.cur_pos == 0
    }

    pub fn capacity(&self) -> usize {
        self.seq_len
    }

    /// Forget all cached positions without releasing memory.
    pub fn reset(&mut self) {
        self.cur_pos = 0;
    }

    #[inline]
    fn slot(&self, layer: usize, pos: usize) -> usize {
        (layer * self.seq_len + pos) * self.kv_dim
    }

    /// Write the key/value rows for one position of one layer.
    pub fn store(&mut self, layer: usize, pos: usize, k: &[f32], v: &[f32]) {
        debug_assert!(pos < self.seq_len);
        debug_assert_eq!(k.len(), self.kv_dim);
        let at = self.slot(layer, pos);
        self.k[at..at + self.kv_dim].copy_from_slice(k);
        self.v[at..at + self.kv_dim].copy_from_slice(v);
        if pos >= self.cur_pos {
            self.cur_pos = pos + 1;
        }
    }

    #[inline]
    pub fn key(&self, layer: usize, pos: usize) -> &[f32] {
        let at = self.slot(layer, pos);
        &self.k[at..at + self.kv_dim]
    }

    #[inline]
    pub fn value(&self, layer: usize, pos: usize) -> &[f32] {
        let at = self.slot(layer, pos);
        &self.v[at..at + self.kv_dim]
    }
}

fn alloc_err(total: usize) -> EngineError {
    EngineError::Allocation(format!("kv cache of {total} floats"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_and_read_back() {
        let mut cache = KvCache::new(2, 4, 3).unwrap();
        cache.store(0, 0, &[1.0, 2.0, 3.0], &[4.0, 5.0, 6.0]);
        cache.store(1, 0, &[7.0, 8.0, 9.0], &[0.5, 0.5, 0.5]);
        assert_eq!(cache.key(0, 0), &[1.0, 2.0, 3.0]);
        assert_eq!(cache.value(1, 0), &[0.5, 0.5, 0.5]);
        assert_eq!(cache.len(), 1);

        cache.store(0, 1, &[0.0; 3], &[0.0; 3]);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn reset_keeps_capacity() {
        let mut cache = KvCache::new(1, 8, 2).unwrap();
        cache.store(0, 0, &[1.0, 1.0], &[1.0, 1.0]);
        cache.reset();
        assert!(cache.is_empty());
        assert_eq!(cache.capacity(), 8);
    }
}
