// sampler.rs — Seeded decision generator
//
// Owns the per-schedule random state. Draws categorical choices and perfect
// tilings of a loop extent; every draw is returned to the caller, who records
// it in the trace so replay never needs the generator.
//
// Preconditions: probabilities are non-negative and index-aligned with the
//                candidates.
// Postconditions: a returned tiling multiplies back to the extent and its
//                 innermost factor respects the cap.
// Failure modes: malformed distributions and impossible tilings return
//                `ScheduleError` (S01xx).
// Side effects: advances the generator.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::diag::{codes, ScheduleError, ScheduleResult};

#[derive(Debug, Clone)]
pub struct Sampler {
    rng: StdRng,
}

impl Sampler {
    /// Seeded generator; `None` seeds from the operating system.
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Self { rng }
    }

    pub fn reseed(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    /// A new seed derived from (and advancing) the current state.
    pub fn fork_seed(&mut self) -> u64 {
        self.rng.gen()
    }

    /// Index of a candidate drawn with weights `probs`.
    pub fn categorical(&mut self, probs: &[f64]) -> ScheduleResult<usize> {
        if probs.is_empty() {
            return Err(ScheduleError::new(
                codes::S0101,
                "sample_categorical",
                "no candidates to sample from",
            ));
        }
        if probs.iter().any(|p| !p.is_finite() || *p < 0.0) {
            return Err(ScheduleError::new(
                codes::S0101,
                "sample_categorical",
                "probabilities must be finite and non-negative",
            ));
        }
        let total: f64 = probs.iter().sum();
        if total <= 0.0 {
            return Err(ScheduleError::new(
                codes::S0101,
                "sample_categorical",
                "probabilities sum to zero",
            ));
        }
        let mut x = self.rng.gen::<f64>() * total;
        for (i, p) in probs.iter().enumerate() {
            if x < *p {
                return Ok(i);
            }
            x -= p;
        }
        // Rounding can leave `x` just past the last bucket.
        Ok(probs.iter().rposition(|p| *p > 0.0).unwrap_or(probs.len() - 1))
    }

    /// A tiling of `extent` into `n` factors chosen uniformly among all valid
    /// tilings.
    pub fn perfect_tile(
        &mut self,
        extent: i64,
        n: usize,
        max_innermost_factor: i64,
    ) -> ScheduleResult<Vec<i64>> {
        let all = perfect_tilings(extent, n, max_innermost_factor);
        if all.is_empty() {
            return Err(ScheduleError::new(
                codes::S0103,
                "sample_perfect_tile",
                format!(
                    "no tiling of {} into {} factors with innermost factor <= {}",
                    extent, n, max_innermost_factor
                ),
            ));
        }
        let pick = self.rng.gen_range(0..all.len());
        Ok(all[pick].clone())
    }
}

/// Every ordered factorization of `extent` into `n` positive factors whose
/// innermost factor is at most `max_innermost_factor`, in lexicographic
/// order.
pub fn perfect_tilings(extent: i64, n: usize, max_innermost_factor: i64) -> Vec<Vec<i64>> {
    let mut out = Vec::new();
    if n == 0 || extent <= 0 {
        return out;
    }
    let mut prefix = Vec::with_capacity(n);
    enumerate(extent, n, max_innermost_factor, &mut prefix, &mut out);
    out
}

fn enumerate(rest: i64, n: usize, cap: i64, prefix: &mut Vec<i64>, out: &mut Vec<Vec<i64>>) {
    if n == 1 {
        if rest <= cap {
            let mut t = prefix.clone();
            t.push(rest);
            out.push(t);
        }
        return;
    }
    for f in 1..=rest {
        if rest % f == 0 {
            prefix.push(f);
            enumerate(rest / f, n - 1, cap, prefix, out);
            prefix.pop();
        }
    }
}

/// Validate a caller-supplied tiling decision.
pub fn check_tile_decision(
    extent: Option<i64>,
    n: usize,
    max_innermost_factor: i64,
    decision: &[i64],
) -> ScheduleResult<()> {
    let err = |msg: String| Err(ScheduleError::new(codes::S0104, "sample_perfect_tile", msg));
    if decision.len() != n {
        return err(format!("decision has {} factors, expected {}", decision.len(), n));
    }
    if decision.iter().any(|f| *f <= 0) {
        return err("decision factors must be positive".to_string());
    }
    if let Some(last) = decision.last() {
        if *last > max_innermost_factor {
            return err(format!(
                "innermost factor {} exceeds {}",
                last, max_innermost_factor
            ));
        }
    }
    if let Some(extent) = extent {
        let product: i64 = decision.iter().product();
        if product != extent {
            return err(format!("decision multiplies to {}, not {}", product, extent));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tilings_of_twelve() {
        let all = perfect_tilings(12, 2, 64);
        assert_eq!(
            all,
            vec![vec![1, 12], vec![2, 6], vec![3, 4], vec![4, 3], vec![6, 2], vec![12, 1]]
        );
        let capped = perfect_tilings(12, 2, 3);
        assert_eq!(capped, vec![vec![4, 3], vec![6, 2], vec![12, 1]]);
    }

    #[test]
    fn same_seed_same_draws() {
        let mut a = Sampler::new(Some(7));
        let mut b = Sampler::new(Some(7));
        for _ in 0..16 {
            assert_eq!(a.perfect_tile(64, 3, 16).unwrap(), b.perfect_tile(64, 3, 16).unwrap());
            assert_eq!(a.categorical(&[0.2, 0.3, 0.5]).unwrap(), b.categorical(&[0.2, 0.3, 0.5]).unwrap());
        }
    }

    #[test]
    fn zero_weight_is_never_drawn() {
        let mut s = Sampler::new(Some(1));
        for _ in 0..200 {
            assert_ne!(s.categorical(&[0.5, 0.0, 0.5]).unwrap(), 1);
        }
    }

    #[test]
    fn bad_distributions_rejected() {
        let mut s = Sampler::new(Some(1));
        assert_eq!(s.categorical(&[]).unwrap_err().code, codes::S0101);
        assert_eq!(s.categorical(&[-1.0, 2.0]).unwrap_err().code, codes::S0101);
        assert_eq!(s.categorical(&[0.0, 0.0]).unwrap_err().code, codes::S0101);
    }

    #[test]
    fn tile_decision_checks() {
        assert!(check_tile_decision(Some(128), 2, 64, &[2, 64]).is_ok());
        assert!(check_tile_decision(Some(128), 2, 32, &[2, 64]).is_err());
        assert!(check_tile_decision(Some(128), 3, 64, &[2, 64]).is_err());
        assert!(check_tile_decision(None, 2, 64, &[5, 7]).is_ok());
    }
}
