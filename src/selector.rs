//! Weighted random selection on a 0–100 percentage scale.

use rand::Rng;
use rand_distr::{Distribution, Normal};

/// Pick one candidate, or nobody. Each weight is the candidate's selection
/// chance in percent; whatever the weights leave of 100 is the chance that
/// nobody is picked. One independent trial per call. Weights must not sum
/// above 100; that is a caller bug, not handled here.
pub fn pick_weighted<K: Clone>(candidates: &[K], weights: &[f64]) -> Option<K> {
    debug_assert_eq!(candidates.len(), weights.len());
    if candidates.is_empty() {
        return None;
    }
    let roll: f64 = rand::thread_rng().gen_range(0.0..100.0);
    let mut cumulative = 0.0;
    for (candidate, weight) in candidates.iter().zip(weights) {
        cumulative += weight;
        if roll < cumulative {
            return Some(candidate.clone());
        }
    }
    None
}

/// Daily appetite: normally distributed around 50 pellets, the mean scaled
/// up 1.75x per starvation phase. Clamped to at least 1 pellet so the
/// fullness ratio can never divide by zero.
pub fn sample_appetite(starved_loops: u32) -> u32 {
    let mean = 50.0 * 1.75f64.powi(starved_loops as i32);
    let sampled = match Normal::new(mean, 6.0) {
        Ok(dist) => dist.sample(&mut rand::thread_rng()),
        Err(_) => mean,
    };
    sampled.round().max(1.0) as u32
}

/// `uniform(1, uniform(1, max))`, rounded, a heavily bottom-weighted haul.
pub fn nested_uniform(max: f64) -> i64 {
    let mut rng = rand::thread_rng();
    let ceiling = rng.gen_range(1.0..=max);
    rng.gen_range(1.0..=ceiling).round() as i64
}

/// One percent roll: true with probability `percent`/100.
pub fn percent_roll(percent: f64) -> bool {
    percent > 0.0 && rand::thread_rng().gen_range(0.0..100.0) < percent
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_population_yields_none() {
        let picked: Option<String> = pick_weighted(&[], &[]);
        assert!(picked.is_none());
    }

    #[test]
    fn test_full_weights_split_evenly() {
        let population = ["A", "B"];
        let weights = [50.0, 50.0];
        let trials = 10_000;
        let mut counts = [0u32, 0u32];
        let mut none_count = 0u32;
        for _ in 0..trials {
            match pick_weighted(&population, &weights) {
                Some("A") => counts[0] += 1,
                Some("B") => counts[1] += 1,
                Some(_) => unreachable!(),
                None => none_count += 1,
            }
        }
        // weights sum to exactly 100: nobody is never picked
        assert_eq!(none_count, 0);
        // each side converges on 50% (generous tolerance for 10k trials)
        for count in counts {
            let share = count as f64 / trials as f64;
            assert!((share - 0.5).abs() < 0.05, "share was {}", share);
        }
    }

    #[test]
    fn test_residual_goes_to_none() {
        let population = ["A"];
        let weights = [25.0];
        let trials = 10_000;
        let mut picked = 0u32;
        for _ in 0..trials {
            if pick_weighted(&population, &weights).is_some() {
                picked += 1;
            }
        }
        let share = picked as f64 / trials as f64;
        assert!((share - 0.25).abs() < 0.05, "share was {}", share);
    }

    #[test]
    fn test_appetite_is_positive_and_scales() {
        for _ in 0..1000 {
            assert!(sample_appetite(0) >= 1);
        }
        // phase 2 mean is 50 * 1.75^2 ≈ 153; six sigma below is still > 100
        for _ in 0..100 {
            assert!(sample_appetite(2) > 100);
        }
    }

    #[test]
    fn test_nested_uniform_bounds() {
        for _ in 0..1000 {
            let haul = nested_uniform(1000.0);
            assert!((1..=1000).contains(&haul));
        }
    }

    #[test]
    fn test_percent_roll_extremes() {
        for _ in 0..100 {
            assert!(!percent_roll(0.0));
            assert!(percent_roll(100.0));
        }
    }
}
