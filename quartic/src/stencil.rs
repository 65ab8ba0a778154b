//! Central-difference stencils for second, third, and fourth derivatives.
//!
//! Every stencil uses displacements of a single step size, so the unscaled
//! derivative is `sum(coeff * energy)` with a denominator of `(2 * delta)^n`
//! applied at emission time. Tuples are dispatched on their multiset
//! signature (all equal, pair + single, and so on); within each signature the
//! coefficient pattern follows the binomial expansion of the central
//! difference operator along each repeated axis.

use super::error::{Error, Result};
use itertools::Itertools;

/// Reserved name of the undisplaced reference evaluation.
pub const REFERENCE: &str = "E0";

/// A single displaced-energy evaluation feeding one derivative entry.
#[derive(Clone, Debug, PartialEq)]
pub struct Eval {
    /// Finite-difference weight of this energy.
    pub coeff: i32,
    /// Unique identifier used to derive file names, or [`REFERENCE`].
    pub name: String,
    /// Signed coordinate indices to displace; empty means the reference.
    pub steps: Vec<i32>,
    /// The derivative entry this evaluation contributes to, as handed to
    /// [`stencil`]. Kept unsorted so callers can route contributions even
    /// when `steps` differs from the target.
    pub target: Vec<i32>,
    /// Real-time signal number assigned at dispatch.
    pub sig: i32,
    /// Energy in hartree, filled on completion.
    pub result: f64,
}

impl Eval {
    fn new(coeff: i32, steps: Vec<i32>, target: &[i32]) -> Self {
        Self {
            coeff,
            name: fresh_name(),
            steps,
            target: target.to_vec(),
            sig: 0,
            result: f64::NAN,
        }
    }

    fn reference(coeff: i32, target: &[i32]) -> Self {
        Self {
            coeff,
            name: REFERENCE.to_owned(),
            steps: Vec::new(),
            target: target.to_vec(),
            sig: 0,
            result: f64::NAN,
        }
    }
}

/// Returns a fresh, filesystem-safe evaluation name with 64 bits of entropy.
/// Never returns [`REFERENCE`].
#[must_use]
pub fn fresh_name() -> String {
    format!("job{:016x}", rand::random::<u64>())
}

/// Produces the central-difference stencil for a derivative index tuple of
/// order two, three, or four.
///
/// # Errors
///
/// [`Error::Stencil`] if the tuple length or its equality pattern is not
/// covered; this indicates a bug in the caller, never bad user input.
pub fn stencil(target: &[i32]) -> Result<Vec<Eval>> {
    match *target {
        [i, j] => Ok(second(i, j)),
        [i, j, k] => third(i, j, k),
        [i, j, k, l] => fourth(i, j, k, l),
        _ => Err(Error::Stencil(target.to_vec())),
    }
}

fn second(i: i32, j: i32) -> Vec<Eval> {
    let target = [i, j];
    if i == j {
        // E(+i+i) - 2 E0 + E(-i-i)
        vec![
            Eval::new(1, vec![i, i], &target),
            Eval::reference(-2, &target),
            Eval::new(1, vec![-i, -i], &target),
        ]
    } else {
        sign_product(&[i, j], &target)
    }
}

fn third(i: i32, j: i32, k: i32) -> Result<Vec<Eval>> {
    let target = [i, j, k];
    match (i == j, i == k, j == k) {
        // E(+i+i+i) - 3 E(+i) + 3 E(-i) - E(-i-i-i)
        (true, true, true) => Ok(vec![
            Eval::new(1, vec![i, i, i], &target),
            Eval::new(-3, vec![i], &target),
            Eval::new(3, vec![-i], &target),
            Eval::new(-1, vec![-i, -i, -i], &target),
        ]),
        (true, false, false) => Ok(pair_single(i, k, &target)),
        (false, true, false) => Ok(pair_single(i, j, &target)),
        (false, false, true) => Ok(pair_single(j, i, &target)),
        (false, false, false) => Ok(sign_product(&[i, j, k], &target)),
        _ => Err(Error::Stencil(target.to_vec())),
    }
}

fn fourth(i: i32, j: i32, k: i32, l: i32) -> Result<Vec<Eval>> {
    let target = [i, j, k, l];
    let evals = match (i == j, i == k, i == l, j == k, j == l, k == l) {
        // E(+4i) - 4 E(+2i) + 6 E0 - 4 E(-2i) + E(-4i)
        (true, true, true, ..) => vec![
            Eval::new(1, vec![i, i, i, i], &target),
            Eval::new(-4, vec![i, i], &target),
            Eval::reference(6, &target),
            Eval::new(-4, vec![-i, -i], &target),
            Eval::new(1, vec![-i, -i, -i, -i], &target),
        ],
        // triple + single
        (true, true, false, ..) => triple_single(i, l, &target),
        (true, false, true, ..) => triple_single(i, k, &target),
        (false, true, true, ..) => triple_single(i, j, &target),
        (false, false, false, true, true, true) => triple_single(j, i, &target),
        // double pair
        (true, false, false, false, false, true) => pair_pair(i, k, &target),
        (false, true, false, false, true, false) => pair_pair(i, j, &target),
        (false, false, true, true, false, false) => pair_pair(i, j, &target),
        // pair + two singles
        (true, false, false, false, false, false) => pair_singles(i, k, l, &target),
        (false, true, false, false, false, false) => pair_singles(i, j, l, &target),
        (false, false, true, false, false, false) => pair_singles(i, k, j, &target),
        (false, false, false, true, false, false) => pair_singles(j, i, l, &target),
        (false, false, false, false, true, false) => pair_singles(j, i, k, &target),
        (false, false, false, false, false, true) => pair_singles(k, i, j, &target),
        // all distinct
        (false, false, false, false, false, false) => sign_product(&[i, j, k, l], &target),
        _ => return Err(Error::Stencil(target.to_vec())),
    };
    Ok(evals)
}

/// The "2+1" stencil: repeated axis `r`, singleton `s`.
fn pair_single(r: i32, s: i32, target: &[i32]) -> Vec<Eval> {
    vec![
        Eval::new(1, vec![r, r, s], target),
        Eval::new(-2, vec![s], target),
        Eval::new(1, vec![-r, -r, s], target),
        Eval::new(-1, vec![r, r, -s], target),
        Eval::new(2, vec![-s], target),
        Eval::new(-1, vec![-r, -r, -s], target),
    ]
}

/// The "3+1" stencil: tripled axis `r`, singleton `s`.
fn triple_single(r: i32, s: i32, target: &[i32]) -> Vec<Eval> {
    vec![
        Eval::new(1, vec![r, r, r, s], target),
        Eval::new(-3, vec![r, s], target),
        Eval::new(3, vec![-r, s], target),
        Eval::new(-1, vec![-r, -r, -r, s], target),
        Eval::new(-1, vec![r, r, r, -s], target),
        Eval::new(3, vec![r, -s], target),
        Eval::new(-3, vec![-r, -s], target),
        Eval::new(1, vec![-r, -r, -r, -s], target),
    ]
}

/// The "2+2" stencil: two doubled axes `r` and `s`.
fn pair_pair(r: i32, s: i32, target: &[i32]) -> Vec<Eval> {
    vec![
        Eval::new(1, vec![r, r, s, s], target),
        Eval::new(1, vec![-r, -r, -s, -s], target),
        Eval::new(1, vec![-r, -r, s, s], target),
        Eval::new(1, vec![r, r, -s, -s], target),
        Eval::new(-2, vec![r, r], target),
        Eval::new(-2, vec![s, s], target),
        Eval::new(-2, vec![-r, -r], target),
        Eval::new(-2, vec![-s, -s], target),
        Eval::reference(4, target),
    ]
}

/// The "2+1+1" stencil: doubled axis `r`, singletons `s` and `t`.
fn pair_singles(r: i32, s: i32, t: i32, target: &[i32]) -> Vec<Eval> {
    vec![
        Eval::new(1, vec![r, r, s, t], target),
        Eval::new(-2, vec![s, t], target),
        Eval::new(1, vec![-r, -r, s, t], target),
        Eval::new(-1, vec![r, r, -s, t], target),
        Eval::new(2, vec![-s, t], target),
        Eval::new(-1, vec![-r, -r, -s, t], target),
        Eval::new(-1, vec![r, r, s, -t], target),
        Eval::new(2, vec![s, -t], target),
        Eval::new(-1, vec![-r, -r, s, -t], target),
        Eval::new(1, vec![r, r, -s, -t], target),
        Eval::new(-2, vec![-s, -t], target),
        Eval::new(1, vec![-r, -r, -s, -t], target),
    ]
}

/// The distinct-axes stencil: every choice of signs over `axes`, weighted by
/// the parity of the minus count.
fn sign_product(axes: &[i32], target: &[i32]) -> Vec<Eval> {
    axes.iter()
        .map(|_| [1, -1])
        .multi_cartesian_product()
        .map(|signs| {
            let minuses = signs.iter().filter(|&&sign| sign < 0).count();
            let coeff = if minuses % 2 == 0 { 1 } else { -1 };
            let steps = axes
                .iter()
                .zip(&signs)
                .map(|(axis, sign)| axis * sign)
                .collect();
            Eval::new(coeff, steps, target)
        })
        .collect()
}
