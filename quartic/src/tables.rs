//! Packed derivative tables and their output format.
//!
//! FC2 is a dense `M x M` matrix. FC3 and FC4 store only the independent
//! entries of the symmetric tensors, addressed by the canonical triangular
//! index of the sorted 1-based tuple.

use super::error::Result;
use super::geom::ANGBOHR;
use itertools::Itertools;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Number of independent third-derivative entries for `m` coordinates.
#[must_use]
pub const fn len3(m: usize) -> usize {
    m * (m + 1) * (m + 2) / 6
}

/// Number of independent fourth-derivative entries for `m` coordinates.
#[must_use]
pub const fn len4(m: usize) -> usize {
    m * (m + 1) * (m + 2) * (m + 3) / 24
}

/// Packed index of the sorted 1-based triple `i <= j <= k`.
#[must_use]
pub const fn idx3(i: usize, j: usize, k: usize) -> usize {
    i + j * (j - 1) / 2 + k * (k - 1) * (k + 1) / 6 - 1
}

/// Packed index of the sorted 1-based quadruple `i <= j <= k <= l`.
#[must_use]
pub const fn idx4(i: usize, j: usize, k: usize, l: usize) -> usize {
    idx3(i, j, k) + l * (l - 1) * (l + 1) * (l + 2) / 24
}

/// Finite-difference denominator and unit conversion for order `n`: the
/// accumulated sums are divided by `(2 delta)^n` and converted from hartree
/// per Angstrom^n to hartree per bohr^n.
#[must_use]
pub fn scale(order: i32, delta: f64) -> f64 {
    (ANGBOHR / (2.0 * delta)).powi(order)
}

/// Writes one derivative table in the fixed ASCII layout read by the
/// downstream vibrational analysis: a `%5d%5d` header followed by every
/// value as `%20.10f`, three per line.
pub fn write_table(path: &Path, natoms: usize, cols: usize, vals: &[f64], scale: f64) -> Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    writeln!(out, "{natoms:5}{cols:5}")?;
    for chunk in &vals.iter().chunks(3) {
        let line: String = chunk.map(|val| format!("{:20.10}", val * scale)).collect();
        writeln!(out, "{line}")?;
    }
    Ok(())
}

/// Emits `fort.15` with all `m * m` second-derivative entries, row major.
pub fn write_fc2(dir: &Path, natoms: usize, vals: &[f64], delta: f64) -> Result<()> {
    write_table(
        &dir.join("fort.15"),
        natoms,
        6 * natoms,
        vals,
        scale(2, delta),
    )
}

/// Emits `fort.30` with the packed third-derivative entries.
pub fn write_fc3(dir: &Path, natoms: usize, vals: &[f64], delta: f64) -> Result<()> {
    write_table(&dir.join("fort.30"), natoms, vals.len(), vals, scale(3, delta))
}

/// Emits `fort.40` with the packed fourth-derivative entries.
pub fn write_fc4(dir: &Path, natoms: usize, vals: &[f64], delta: f64) -> Result<()> {
    write_table(&dir.join("fort.40"), natoms, vals.len(), vals, scale(4, delta))
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::assert_approx_eq;
    use std::fs;

    #[test]
    fn packed_lengths() {
        assert_eq!(len3(9), 165);
        assert_eq!(len4(9), 495);
    }

    #[test]
    fn corner_indices() {
        assert_eq!(idx3(9, 9, 9), 164);
        assert_eq!(idx4(9, 9, 9, 9), 494);
    }

    #[test]
    fn idx3_is_a_bijection() {
        let m = 9;
        let mut next = 0;
        for k in 1..=m {
            for j in 1..=k {
                for i in 1..=j {
                    assert_eq!(idx3(i, j, k), next);
                    next += 1;
                }
            }
        }
        assert_eq!(next, len3(m));
    }

    #[test]
    fn idx4_is_a_bijection() {
        let m = 9;
        let mut next = 0;
        for l in 1..=m {
            for k in 1..=l {
                for j in 1..=k {
                    for i in 1..=j {
                        assert_eq!(idx4(i, j, k, l), next);
                        next += 1;
                    }
                }
            }
        }
        assert_eq!(next, len4(m));
    }

    #[test]
    fn scales() {
        let delta = 0.005;
        assert_approx_eq!(
            f64,
            scale(2, delta),
            ANGBOHR * ANGBOHR / (4.0 * delta * delta),
            ulps = 8
        );
        assert_approx_eq!(
            f64,
            scale(3, delta),
            ANGBOHR.powi(3) / (8.0 * delta.powi(3)),
            ulps = 8
        );
        assert_approx_eq!(
            f64,
            scale(4, delta),
            ANGBOHR.powi(4) / (16.0 * delta.powi(4)),
            ulps = 8
        );
    }

    #[test]
    fn table_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fort.15");
        let vals = [1.0, 2.0, 3.0, 4.0];
        write_table(&path, 3, 18, &vals, 0.5).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("    3   18"));
        assert_eq!(
            lines.next(),
            Some("        0.5000000000        1.0000000000        1.5000000000")
        );
        assert_eq!(lines.next(), Some("        2.0000000000"));
        assert_eq!(lines.next(), None);
    }
}
