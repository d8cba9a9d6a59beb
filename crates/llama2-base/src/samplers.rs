//! Token selection from logits.
//!
//! Sampling state is per-session so that a fixed seed reproduces the same
//! stream regardless of what other sessions are doing. The generator is the
//! classic 64-bit xorshift; it plugs into `rand`'s [RngCore] so it composes
//! with the wider ecosystem, but the f32 draw used for selection is fixed to
//! the 24-bit mantissa construction the checkpoint ecosystem standardized on.

use std::cmp::Ordering;

use rand::RngCore;

use crate::tokenizer::TokenId;

/// 64-bit xorshift generator.
#[derive(Debug, Clone)]
pub struct XorShiftRng {
    state: u64,
}

impl XorShiftRng {
    /// Create a generator from a nonzero seed.
    pub fn new(seed: u64) -> Self {
        debug_assert_ne!(seed, 0, "xorshift state must be nonzero");
        Self { state: seed }
    }

    /// Uniform f32 in [0, 1) with 24 bits of precision.
    pub fn next_f32(&mut self) -> f32 {
        (self.next_u32() >> 8) as f32 / 16777216.0
    }
}

impl RngCore for XorShiftRng {
    fn next_u32(&mut self) -> u32 {
        self.state ^= self.state >> 12;
        self.state ^= self.state << 25;
        self.state ^= self.state >> 27;
        (self.state.wrapping_mul(0x2545_f491_4f6c_dd1d) >> 32) as u32
    }

    fn next_u64(&mut self) -> u64 {
        (self.next_u32() as u64) << 32 | self.next_u32() as u64
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        for chunk in dest.chunks_mut(4) {
            let word = self.next_u32().to_le_bytes();
            chunk.copy_from_slice(&word[..chunk.len()]);
        }
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

/// Sampling parameters of one query. Zero values select the defaults
/// (temperature 1.0, top-p 0.9, wall-clock seed).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct InferenceParameters {
    /// Temperature applied to the logits; 0.0 selects the default of 1.0.
    pub temperature: f32,
    /// Nucleus cutoff; 0.0 selects the default of 0.9.
    pub top_p: f32,
    /// PRNG seed; 0 derives a seed from the wall clock at query time.
    pub rng_seed: u64,
}

impl InferenceParameters {
    pub(crate) const DEFAULT_TEMPERATURE: f32 = 1.0;
    pub(crate) const DEFAULT_TOP_P: f32 = 0.9;
}

/// Temperature + nucleus sampler with its generator state.
pub struct Sampler {
    temperature: f32,
    top_p: f32,
    rng: XorShiftRng,
}

impl Sampler {
    /// Create a sampler from literal parameters (no zero-means-default
    /// translation; that happens at the query surface). A temperature of
    /// exactly zero selects greedy argmax decoding.
    pub fn new(temperature: f32, top_p: f32, seed: u64) -> Self {
        Self {
            temperature,
            top_p,
            rng: XorShiftRng::new(if seed == 0 { 0x2545_f491 } else { seed }),
        }
    }

    /// Select the next token from `logits`, which are consumed in place
    /// (scaled and normalized).
    pub fn sample(&mut self, logits: &mut [f32]) -> TokenId {
        if self.temperature == 0.0 {
            return crate::ops::argmax(logits) as TokenId;
        }

        for v in logits.iter_mut() {
            *v /= self.temperature;
        }
        crate::ops::softmax(logits);

        let coin = self.rng.next_f32();
        if self.top_p > 0.0 && self.top_p < 1.0 {
            self.sample_topp(logits, coin)
        } else {
            sample_mult(logits, coin)
        }
    }

    /// Nucleus sampling: consider only the smallest set of tokens whose
    /// cumulative probability exceeds `top_p`, then draw from it.
    fn sample_topp(&self, probs: &[f32], coin: f32) -> TokenId {
        // Values below this cannot be part of the nucleus; filtering first
        // keeps the sort small.
        let cutoff = (1.0 - self.top_p) / (probs.len() - 1) as f32;
        let mut candidates: Vec<(usize, f32)> = probs
            .iter()
            .enumerate()
            .filter(|(_, &p)| p >= cutoff)
            .map(|(i, &p)| (i, p))
            .collect();
        candidates.sort_unstable_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });

        let mut cumulative = 0.0;
        let mut last = candidates.len() - 1;
        for (i, &(_, p)) in candidates.iter().enumerate() {
            cumulative += p;
            if cumulative > self.top_p {
                last = i;
                break;
            }
        }

        let r = coin * cumulative;
        let mut cdf = 0.0;
        for &(index, p) in &candidates[..=last] {
            cdf += p;
            if r < cdf {
                return index as TokenId;
            }
        }
        candidates[last].0 as TokenId
    }
}

/// Draw from a full probability distribution by CDF walk.
fn sample_mult(probs: &[f32], coin: f32) -> TokenId {
    let mut cdf = 0.0;
    for (i, &p) in probs.iter().enumerate() {
        cdf += p;
        if coin < cdf {
            return i as TokenId;
        }
    }
    (probs.len() - 1) as TokenId
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn xorshift_is_deterministic() {
        let mut a = XorShiftRng::new(0x1234);
        let mut b = XorShiftRng::new(0x1234);
        for _ in 0..64 {
            assert_eq!(a.next_u32(), b.next_u32());
        }
        let mut c = XorShiftRng::new(0x1235);
        assert_ne!(XorShiftRng::new(0x1234).next_u64(), c.next_u64());
    }

    #[test]
    fn f32_draws_stay_in_unit_interval() {
        let mut rng = XorShiftRng::new(42);
        for _ in 0..1000 {
            let v = rng.next_f32();
            assert!((0.0..1.0).contains(&v));
        }
    }

    #[test]
    fn works_as_an_ecosystem_rng() {
        let mut rng = XorShiftRng::new(7);
        for _ in 0..100 {
            let v: u8 = rng.gen_range(0..10);
            assert!(v < 10);
        }
    }

    #[test]
    fn zero_temperature_is_greedy() {
        let mut sampler = Sampler::new(0.0, 0.9, 1);
        let mut logits = vec![0.1, 2.0, -1.0, 1.9];
        assert_eq!(sampler.sample(&mut logits), 1);
    }

    #[test]
    fn nucleus_excludes_the_tail() {
        // One dominant token: any coin must select it.
        for seed in 1..32u64 {
            let mut sampler = Sampler::new(1.0, 0.5, seed);
            let mut logits = vec![0.0; 16];
            logits[5] = 12.0;
            assert_eq!(sampler.sample(&mut logits), 5);
        }
    }

    #[test]
    fn full_distribution_sampling_respects_cdf() {
        // With top_p = 1.0 the CDF walk runs over everything; an extreme
        // distribution still pins the draw.
        for seed in 1..32u64 {
            let mut sampler = Sampler::new(1.0, 0.0, seed);
            let mut logits = vec![-30.0; 8];
            logits[3] = 30.0;
            assert_eq!(sampler.sample(&mut logits), 3);
        }
    }

    #[test]
    fn equal_seeds_reproduce_equal_streams() {
        let mut a = Sampler::new(0.8, 0.9, 0x1234);
        let mut b = Sampler::new(0.8, 0.9, 0x1234);
        let logits = |i: usize| -> Vec<f32> {
            (0..32).map(|j| ((i * 31 + j * 7) % 13) as f32 / 3.0).collect()
        };
        for i in 0..16 {
            assert_eq!(a.sample(&mut logits(i)), b.sample(&mut logits(i)));
        }
    }
}
