//! Reference geometry and Cartesian displacements.

use super::error::{Error, Result};

/// Bohr radius in Angstrom, used to convert derivatives to atomic units at
/// emission time.
pub const ANGBOHR: f64 = 0.529177249;

/// An ordered list of atoms with their Cartesian coordinates in Angstrom.
///
/// Immutable after load; displaced copies are produced by [`Geometry::step`].
#[derive(Clone, Debug, PartialEq)]
pub struct Geometry {
    /// Atomic symbols, one per atom.
    pub names: Vec<String>,
    /// Flat coordinate vector of length `3 * names.len()`.
    pub coords: Vec<f64>,
}

impl Geometry {
    /// Parses an XYZ-style block: atom count, comment line, then one
    /// `symbol x y z` line per atom.
    pub fn from_block(block: &str) -> Result<Self> {
        let mut lines = block.lines();
        let count: usize = lines
            .next()
            .ok_or_else(|| Error::Geometry("empty geometry block".into()))?
            .trim()
            .parse()
            .map_err(|_| Error::Geometry("first line is not an atom count".into()))?;
        // comment line
        lines.next();

        let mut names = Vec::new();
        let mut coords = Vec::new();
        for line in lines.filter(|line| !line.trim().is_empty()) {
            let mut fields = line.split_whitespace();
            let name = fields
                .next()
                .ok_or_else(|| Error::Geometry(format!("bad atom line: {line:?}")))?;
            names.push(name.to_owned());
            for _ in 0..3 {
                let field = fields
                    .next()
                    .ok_or_else(|| Error::Geometry(format!("bad atom line: {line:?}")))?;
                coords.push(
                    field
                        .parse()
                        .map_err(|_| Error::Geometry(format!("bad coordinate: {field:?}")))?,
                );
            }
        }

        if names.len() != count {
            return Err(Error::Geometry(format!(
                "geometry block announces {count} atoms but lists {}",
                names.len()
            )));
        }

        Ok(Self { names, coords })
    }

    /// Number of atoms.
    #[must_use]
    pub fn natoms(&self) -> usize {
        self.names.len()
    }

    /// Number of Cartesian coordinates, `3N`.
    #[must_use]
    pub fn ncoords(&self) -> usize {
        self.coords.len()
    }

    /// Returns a fresh coordinate vector displaced by `delta` along each of
    /// `steps`. A positive index `s` increments coordinate `s - 1`, a
    /// negative one decrements coordinate `|s| - 1`. The reference itself is
    /// left untouched.
    #[must_use]
    pub fn step(&self, delta: f64, steps: &[i32]) -> Vec<f64> {
        let mut coords = self.coords.clone();
        for &step in steps {
            let coord = step.unsigned_abs() as usize - 1;
            if step < 0 {
                coords[coord] -= delta;
            } else {
                coords[coord] += delta;
            }
        }
        coords
    }
}
