//! CPU sampling over backend logits: temperature, top-k, top-p (nucleus).

use rand::Rng;
use serde::Deserialize;

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct SamplingParams {
    pub temperature: f32,
    pub top_k: i32,
    pub top_p: f32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            top_k: -1,
            top_p: 1.0,
        }
    }
}

impl SamplingParams {
    pub fn is_greedy(&self) -> bool {
        (self.temperature <= 0.0 || self.top_k == 1) && self.top_p >= 1.0
    }
}

fn argmax(logits: &[f32]) -> u32 {
    logits
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, _)| i as u32)
        .unwrap()
}

/// Sample a token id from a logits row.
///
/// Pipeline: temperature scale, top-k truncate, softmax, top-p truncate,
/// multinomial draw. Non-positive temperature short-circuits to argmax.
pub fn sample(logits: &[f32], params: &SamplingParams, rng: &mut impl Rng) -> u32 {
    assert!(!logits.is_empty(), "sample() called with empty logits");

    if params.temperature <= 0.0 {
        return argmax(logits);
    }

    let mut candidates: Vec<(u32, f32)> = logits
        .iter()
        .enumerate()
        .map(|(i, &l)| (i as u32, l / params.temperature))
        .collect();
    candidates.sort_unstable_by(|a, b| b.1.total_cmp(&a.1));

    if params.top_k > 0 && (params.top_k as usize) < candidates.len() {
        candidates.truncate(params.top_k as usize);
    }

    let max_logit = candidates[0].1;
    let mut probs: Vec<f32> = candidates
        .iter()
        .map(|(_, l)| (l - max_logit).exp())
        .collect();
    let sum: f32 = probs.iter().sum();
    for p in &mut probs {
        *p /= sum;
    }

    if params.top_p < 1.0 {
        let mut cumsum = 0.0f32;
        let mut cutoff = probs.len();
        for (i, &p) in probs.iter().enumerate() {
            cumsum += p;
            if cumsum > params.top_p {
                cutoff = i + 1;
                break;
            }
        }
        candidates.truncate(cutoff);
        probs.truncate(cutoff);

        let sum: f32 = probs.iter().sum();
        for p in &mut probs {
            *p /= sum;
        }
    }

    let r: f32 = rng.random();
    let mut cumsum = 0.0f32;
    for (i, &p) in probs.iter().enumerate() {
        cumsum += p;
        if r < cumsum {
            return candidates[i].0;
        }
    }

    // numerical edge case: cumsum fell short of 1.0
    candidates.last().unwrap().0
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_greedy_defaults() {
        assert!(SamplingParams::default().is_greedy());
    }

    #[test]
    fn test_greedy_top_k_1() {
        let params = SamplingParams {
            temperature: 0.7,
            top_k: 1,
            top_p: 1.0,
        };
        assert!(params.is_greedy());
    }

    #[test]
    fn test_temperature_zero_returns_argmax() {
        let logits = vec![1.0, 5.0, 3.0, 2.0];
        let mut rng = StdRng::seed_from_u64(0);
        assert_eq!(sample(&logits, &SamplingParams::default(), &mut rng), 1);
    }

    #[test]
    fn test_negative_logits_argmax() {
        let logits = vec![-10.0, -5.0, -20.0, -1.0];
        let mut rng = StdRng::seed_from_u64(0);
        assert_eq!(sample(&logits, &SamplingParams::default(), &mut rng), 3);
    }

    #[test]
    fn test_deterministic_with_seed() {
        let logits = vec![1.0, 2.0, 3.0, 0.5];
        let params = SamplingParams {
            temperature: 1.0,
            top_k: -1,
            top_p: 1.0,
        };
        let mut rng1 = StdRng::seed_from_u64(42);
        let mut rng2 = StdRng::seed_from_u64(42);
        assert_eq!(
            sample(&logits, &params, &mut rng1),
            sample(&logits, &params, &mut rng2)
        );
    }

    #[test]
    fn test_top_k_restricts_candidates() {
        let mut logits = vec![-100.0; 20];
        logits[0] = 5.0;
        logits[1] = 4.0;
        logits[2] = 3.0;
        let params = SamplingParams {
            temperature: 1.0,
            top_k: 3,
            top_p: 1.0,
        };
        let mut rng = StdRng::seed_from_u64(0);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..200 {
            seen.insert(sample(&logits, &params, &mut rng));
        }
        assert!(seen.is_subset(&[0u32, 1, 2].iter().copied().collect()));
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn test_top_p_small_picks_top_only() {
        let logits = vec![3.0, 1.0, 2.0, 1.0];
        let params = SamplingParams {
            temperature: 1.0,
            top_k: -1,
            top_p: 0.01,
        };
        let mut rng = StdRng::seed_from_u64(0);
        for _ in 0..50 {
            assert_eq!(sample(&logits, &params, &mut rng), 0);
        }
    }

    #[test]
    fn test_high_temperature_spreads() {
        let logits = vec![1.0, 2.0, 3.0, 4.0];
        let params = SamplingParams {
            temperature: 100.0,
            top_k: -1,
            top_p: 1.0,
        };
        let mut rng = StdRng::seed_from_u64(0);
        let mut counts = [0u32; 4];
        let n = 2000;
        for _ in 0..n {
            counts[sample(&logits, &params, &mut rng) as usize] += 1;
        }
        for (i, &c) in counts.iter().enumerate() {
            assert!(
                c > (n as u32) * 15 / 100,
                "token {} appeared only {}/{} times, expected ~25%",
                i,
                c,
                n
            );
        }
    }

    #[test]
    #[should_panic(expected = "empty logits")]
    fn test_empty_logits_panics() {
        let logits: Vec<f32> = vec![];
        let params = SamplingParams {
            temperature: 1.0,
            top_k: -1,
            top_p: 1.0,
        };
        let mut rng = StdRng::seed_from_u64(0);
        sample(&logits, &params, &mut rng);
    }
}
