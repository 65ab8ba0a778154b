//! Run configuration parsed from a `key=value` input file.

use super::error::{Error, Result};
use super::geom::Geometry;
use std::fs;
use std::path::Path;
use tracing::warn;

/// Batch system used to run the displaced-geometry jobs.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum QueueKind {
    /// PBS-style queue driven by `qsub`.
    Pbs,
    /// SLURM-style queue driven by `sbatch`.
    Slurm,
}

/// Electronic-structure program variant.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgramKind {
    /// Semi-empirical baseline.
    Mopac,
    /// Single-method coupled-cluster baseline.
    Molpro,
    /// Composite multi-basis extrapolation.
    CcCr,
}

/// Everything configurable about a run. Written once during load, read-only
/// afterwards.
#[derive(Clone, Debug)]
pub struct Config {
    /// Maximum number of concurrently outstanding evaluations.
    pub concurrency: usize,
    /// Highest derivative order to compute, 2 to 4.
    pub derivative: usize,
    /// Queue adapter selector.
    pub queue: QueueKind,
    /// Checkpoint every this many completed evaluations.
    pub chk_interval: usize,
    /// Program adapter selector.
    pub program: ProgramKind,
    /// Finite-difference step in Angstrom.
    pub delta: f64,
    /// Method string passed through to the program adapter.
    pub method: String,
    /// Basis set passed through to the program adapter.
    pub basis: String,
    /// Molecular charge passed through to the program adapter.
    pub charge: String,
    /// Spin multiplicity passed through to the program adapter.
    pub spin: String,
    /// Host the submission scripts signal on completion.
    pub host: String,
    /// Reference geometry.
    pub geometry: Geometry,
}

impl Config {
    /// Reads and parses the configuration file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|err| Error::Config(format!("{}: {err}", path.display())))?;
        Self::parse(&text)
    }

    /// Parses configuration text. Keys are case-insensitive, lines whose
    /// first non-blank character is `#` are comments, and the geometry is
    /// given as a multi-line `geometry={ ... }` block.
    pub fn parse(text: &str) -> Result<Self> {
        let mut concurrency = 5;
        let mut derivative = 4;
        let mut queue = QueueKind::Pbs;
        let mut chk_interval = 100;
        let mut program = ProgramKind::Molpro;
        let mut delta = 0.005;
        let mut method = "PM6".to_owned();
        let mut basis = "cc-pVTZ-F12".to_owned();
        let mut charge = "0".to_owned();
        let mut spin = "0".to_owned();
        let mut host = "master".to_owned();
        let mut geometry = None;

        let mut lines = text.lines();
        while let Some(line) = lines.next() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                warn!(line, "ignoring malformed directive");
                continue;
            };
            let key = key.trim().to_lowercase();
            let value = value.trim();

            if key == "geometry" {
                let mut block = Vec::new();
                for body in lines.by_ref() {
                    if body.contains('}') {
                        break;
                    }
                    block.push(body);
                }
                geometry = Some(Geometry::from_block(&block.join("\n"))?);
                continue;
            }

            match key.as_str() {
                "concjobs" => concurrency = parse_num(&key, value)?,
                "derivative" => derivative = parse_num(&key, value)?,
                "chkinterval" => chk_interval = parse_num(&key, value)?,
                "delta" => {
                    delta = value
                        .parse()
                        .map_err(|_| Error::Config(format!("bad delta: {value:?}")))?;
                }
                "queuetype" => {
                    queue = match value.to_uppercase().as_str() {
                        "PBS" => QueueKind::Pbs,
                        "SLURM" => QueueKind::Slurm,
                        _ => return Err(Error::Config(format!("unknown queuetype: {value:?}"))),
                    };
                }
                "program" => {
                    program = match value.to_uppercase().as_str() {
                        "MOPAC" => ProgramKind::Mopac,
                        "MOLPRO" => ProgramKind::Molpro,
                        "CCCR" => ProgramKind::CcCr,
                        _ => return Err(Error::Config(format!("unknown program: {value:?}"))),
                    };
                }
                "method" => method = value.to_owned(),
                "basis" => basis = value.to_owned(),
                "charge" => charge = value.to_owned(),
                "spin" => spin = value.to_owned(),
                "host" => host = value.to_owned(),
                _ => warn!(%key, "ignoring unrecognized key"),
            }
        }

        let config = Self {
            concurrency,
            derivative,
            queue,
            chk_interval,
            program,
            delta,
            method,
            basis,
            charge,
            spin,
            host,
            geometry: geometry
                .ok_or_else(|| Error::Config("missing geometry block".into()))?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(Error::Config("concjobs must be at least 1".into()));
        }
        if !(2..=4).contains(&self.derivative) {
            return Err(Error::Config(format!(
                "derivative must be 2, 3, or 4, not {}",
                self.derivative
            )));
        }
        if self.chk_interval == 0 {
            return Err(Error::Config("chkinterval must be at least 1".into()));
        }
        if self.delta <= 0.0 {
            return Err(Error::Config(format!(
                "delta must be positive, not {}",
                self.delta
            )));
        }
        Ok(())
    }
}

fn parse_num(key: &str, value: &str) -> Result<usize> {
    value
        .parse()
        .map_err(|_| Error::Config(format!("bad {key}: {value:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# test input for the driver
concjobs=9
DERIVATIVE=2
queuetype=slurm
chkinterval=120
program=mopac
delta=0.010
host=cluster-head
geometry={
3
Comment
H          0.0000000000        0.7574590974        0.5217905143
O          0.0000000000        0.0000000000       -0.0657441568
H          0.0000000000       -0.7574590974        0.5217905143
}
";

    #[test]
    fn parse_sample() {
        let config = Config::parse(SAMPLE).unwrap();
        assert_eq!(config.concurrency, 9);
        assert_eq!(config.derivative, 2);
        assert_eq!(config.queue, QueueKind::Slurm);
        assert_eq!(config.chk_interval, 120);
        assert_eq!(config.program, ProgramKind::Mopac);
        assert_eq!(config.delta, 0.010);
        assert_eq!(config.host, "cluster-head");
        assert_eq!(config.geometry.natoms(), 3);
        assert_eq!(config.geometry.names, ["H", "O", "H"]);
    }

    #[test]
    fn defaults() {
        let config = Config::parse("geometry={\n1\nx\nHe 0 0 0\n}\n").unwrap();
        assert_eq!(config.concurrency, 5);
        assert_eq!(config.derivative, 4);
        assert_eq!(config.queue, QueueKind::Pbs);
        assert_eq!(config.chk_interval, 100);
        assert_eq!(config.program, ProgramKind::Molpro);
        assert_eq!(config.delta, 0.005);
        assert_eq!(config.charge, "0");
        assert_eq!(config.spin, "0");
    }

    #[test]
    fn zero_concurrency_refused() {
        let text = "concjobs=0\ngeometry={\n1\nx\nHe 0 0 0\n}\n";
        assert!(matches!(Config::parse(text), Err(Error::Config(_))));
    }

    #[test]
    fn missing_geometry_refused() {
        assert!(matches!(Config::parse("concjobs=2\n"), Err(Error::Config(_))));
    }

    #[test]
    fn bad_derivative_refused() {
        let text = "derivative=5\ngeometry={\n1\nx\nHe 0 0 0\n}\n";
        assert!(matches!(Config::parse(text), Err(Error::Config(_))));
    }
}
