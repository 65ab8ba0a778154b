//! Memoization of two-coordinate displaced energies.
//!
//! Several stencils displace exactly two coordinates: the off-diagonal
//! second-derivative terms, their mirrored partners from the transposed
//! entry, and the two-step terms of the fourth-order stencils. These all
//! collapse onto `2M` distinct signed displacements, so the energies are
//! shared through a dense `2M x 2M` table instead of resubmitting.

use serde::{Deserialize, Serialize};

/// Cache of second-pair energies keyed by the sign-folded displacement pair.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct E2Cache {
    /// Number of coordinates `M`; folded indices live in `[0, 2M)`.
    m: usize,
    vals: Vec<f64>,
}

impl E2Cache {
    /// Creates an empty cache for `m` coordinates.
    #[must_use]
    pub fn new(m: usize) -> Self {
        Self {
            m,
            vals: vec![0.0; 4 * m * m],
        }
    }

    /// Coordinate count this cache was allocated for.
    #[must_use]
    pub const fn coords(&self) -> usize {
        self.m
    }

    /// Folds a signed coordinate index onto `[0, 2M)`: positive
    /// displacements map to `s - 1`, negative ones to `|s| + M - 1`.
    #[must_use]
    pub fn fold(&self, step: i32) -> usize {
        let abs = step.unsigned_abs() as usize;
        if step > 0 { abs - 1 } else { abs + self.m - 1 }
    }

    /// Canonical key of a two-step displacement: the folded pair, sorted.
    fn key(&self, steps: &[i32]) -> (usize, usize) {
        let (a, b) = (self.fold(steps[0]), self.fold(steps[1]));
        if a <= b { (a, b) } else { (b, a) }
    }

    /// Looks up the energy for a two-step displacement. Zero entries mean
    /// "not yet computed".
    #[must_use]
    pub fn get(&self, steps: &[i32]) -> Option<f64> {
        let (a, b) = self.key(steps);
        let val = self.vals[a * 2 * self.m + b];
        (val != 0.0).then_some(val)
    }

    /// Stores the energy for a two-step displacement under the canonical
    /// key.
    pub fn put(&mut self, steps: &[i32], energy: f64) {
        let (a, b) = self.key(steps);
        self.vals[a * 2 * self.m + b] = energy;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fold_covers_both_signs() {
        let cache = E2Cache::new(9);
        assert_eq!(cache.fold(1), 0);
        assert_eq!(cache.fold(9), 8);
        assert_eq!(cache.fold(-1), 9);
        assert_eq!(cache.fold(-9), 17);
    }

    #[test]
    fn unordered_pairs_share_one_slot() {
        let mut cache = E2Cache::new(9);
        assert_eq!(cache.get(&[3, -7]), None);
        cache.put(&[3, -7], -76.24);
        assert_eq!(cache.get(&[3, -7]), Some(-76.24));
        assert_eq!(cache.get(&[-7, 3]), Some(-76.24));
        assert_eq!(cache.get(&[-3, 7]), None);
    }

    #[test]
    fn mirrored_second_derivative_terms_collide() {
        // the (i, j) and (j, i) stencils request the same displaced energy
        let mut cache = E2Cache::new(9);
        cache.put(&[2, 5], 1.25);
        assert_eq!(cache.get(&[5, 2]), Some(1.25));
    }
}
