use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// An explicit random-number stream.
///
/// Every component that consumes randomness takes one of these by `&mut`
/// rather than touching a global or thread-local source. `fork` derives an
/// independent child stream, which is what lets concurrent tasks draw random
/// numbers without sharing mutable state while keeping the overall search
/// reproducible for a fixed seed.
#[derive(Debug, Clone)]
pub struct RandState(StdRng);

impl RandState {
    pub fn new(seed: u64) -> Self {
        RandState(StdRng::seed_from_u64(seed))
    }

    /// Splits off an independent child stream, advancing this one.
    pub fn fork(&mut self) -> RandState {
        RandState(StdRng::seed_from_u64(self.0.gen()))
    }

    /// Samples uniformly from `lo..hi`.
    pub fn sample_int(&mut self, lo: usize, hi: usize) -> usize {
        debug_assert!(lo < hi);
        self.0.gen_range(lo..hi)
    }

    pub fn sample_f64(&mut self) -> f64 {
        self.0.gen_range(0.0..1.0)
    }

    /// Picks an index with probability proportional to its weight.
    pub fn sample_weighted(&mut self, weights: &[f64]) -> usize {
        debug_assert!(!weights.is_empty());
        let total: f64 = weights.iter().sum();
        let mut point = self.sample_f64() * total;
        for (i, w) in weights.iter().enumerate() {
            point -= w;
            if point <= 0.0 {
                return i;
            }
        }
        weights.len() - 1
    }

    pub fn choose<'a, T>(&mut self, items: &'a [T]) -> Option<&'a T> {
        if items.is_empty() {
            return None;
        }
        let idx = self.sample_int(0, items.len());
        Some(&items[idx])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_seed_same_stream() {
        let mut a = RandState::new(7);
        let mut b = RandState::new(7);
        for _ in 0..32 {
            assert_eq!(a.sample_int(0, 1000), b.sample_int(0, 1000));
        }
    }

    #[test]
    fn test_fork_is_deterministic_and_independent() {
        let mut a = RandState::new(7);
        let mut b = RandState::new(7);
        let mut fa = a.fork();
        let mut fb = b.fork();
        for _ in 0..8 {
            assert_eq!(fa.sample_int(0, 1000), fb.sample_int(0, 1000));
        }
        // The parent streams advanced identically too.
        assert_eq!(a.sample_int(0, 1000), b.sample_int(0, 1000));
    }

    #[test]
    fn test_sample_weighted_respects_zero_weight() {
        let mut r = RandState::new(3);
        for _ in 0..64 {
            assert_eq!(r.sample_weighted(&[0.0, 1.0]), 1);
        }
    }
}
