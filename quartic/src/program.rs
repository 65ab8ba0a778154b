//! Adapters for the external electronic-structure programs.
//!
//! Each adapter writes a program-native input file for a displaced geometry
//! and extracts the scalar energy from the program's output file. Output
//! parsing runs entirely on the worker thread that owns the evaluation, so a
//! slow read never migrates into the dispatch path.

use super::config::{Config, ProgramKind};
use super::error::Result;
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Everything that can go wrong while looking for an energy in an output
/// file. All variants except [`OutputError::Panicked`] are recoverable by
/// the scheduler.
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub enum OutputError {
    /// The output file does not exist yet.
    #[error("output file does not exist")]
    FileNotFound,
    /// The file exists but holds no useful content.
    #[error("output file is blank")]
    BlankOutput,
    /// Some line contains the substring `ERROR`, case-insensitively.
    #[error("output file contains an error message")]
    FileContainsError,
    /// No line contains the energy marker.
    #[error("energy marker not found")]
    EnergyNotFound,
    /// The terminal banner is present but the energy marker never appeared.
    #[error("program finished without printing an energy")]
    FinishedButNoEnergy,
    /// The energy field is present but is not a valid real number.
    #[error("energy field did not parse as a number")]
    EnergyNotParsed,
    /// The output contains the `PANIC` sentinel; fatal by design.
    #[error("output file contains the panic sentinel")]
    Panicked,
}

/// A program adapter: input writer, output parser, and the command line the
/// submission script runs.
pub trait Program: Send + Sync {
    /// Builds the input file contents for one geometry.
    fn make_in(&self, names: &[String], coords: &[f64]) -> Vec<String>;

    /// Writes the input file for one geometry.
    fn write_in(&self, path: &Path, names: &[String], coords: &[f64]) -> Result<()> {
        Ok(fs::write(path, self.make_in(names, coords).join("\n"))?)
    }

    /// Extracts the energy from the output file at `path`.
    fn read_out(&self, path: &Path) -> std::result::Result<f64, OutputError>;

    /// The command the submission script uses to run this program.
    fn command(&self, input: &Path) -> String;
}

/// Instantiates the adapter selected by the configuration.
#[must_use]
pub fn make_program(config: &Config) -> Box<dyn Program> {
    match config.program {
        ProgramKind::Mopac => Box::new(Mopac {
            charge: config.charge.clone(),
            method: config.method.clone(),
        }),
        ProgramKind::Molpro => Box::new(Molpro {
            basis: config.basis.clone(),
            charge: config.charge.clone(),
            spin: config.spin.clone(),
        }),
        ProgramKind::CcCr => Box::new(CcCr {
            charge: config.charge.clone(),
            spin: config.spin.clone(),
        }),
    }
}

fn geometry_lines(names: &[String], coords: &[f64]) -> Vec<String> {
    names
        .iter()
        .zip(coords.chunks_exact(3))
        .map(|(name, xyz)| format!("{name} {:.10} {:.10} {:.10}", xyz[0], xyz[1], xyz[2]))
        .collect()
}

fn make_input(head: Vec<String>, body: Vec<String>, foot: Vec<String>) -> Vec<String> {
    let mut lines = head;
    lines.extend(body);
    lines.extend(foot);
    lines
}

fn read_lines(path: &Path) -> std::result::Result<Vec<String>, OutputError> {
    if !path.exists() {
        return Err(OutputError::FileNotFound);
    }
    // a read error right after the existence check is treated like a file
    // that has not landed yet, so the scheduler keeps waiting
    let text = fs::read_to_string(path).map_err(|_| OutputError::FileNotFound)?;
    Ok(text.lines().map(str::to_owned).collect())
}

/// Scans for the fatal and error sentinels and the blank-file case shared by
/// every adapter.
fn scan_lines(lines: &[String]) -> std::result::Result<(), OutputError> {
    for line in lines {
        let upper = line.to_uppercase();
        if upper.contains("PANIC") {
            return Err(OutputError::Panicked);
        }
        if upper.contains("ERROR") {
            return Err(OutputError::FileContainsError);
        }
    }
    if lines.len() <= 1 {
        return Err(OutputError::BlankOutput);
    }
    Ok(())
}

/// Finds the token `offset` fields past the one containing `marker` and
/// parses it as the energy. `banner` is the program's terminal-completion
/// line, used to tell "still running" from "finished without an energy".
fn find_energy(
    lines: &[String],
    marker: &str,
    offset: usize,
    banner: Option<&str>,
) -> std::result::Result<f64, OutputError> {
    scan_lines(lines)?;

    let mut result = Err(OutputError::EnergyNotFound);
    let mut finished = false;
    for line in lines {
        if line.contains(marker) {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if let Some(pos) = fields.iter().position(|field| field.contains(marker)) {
                result = match fields.get(pos + offset) {
                    Some(field) => field.parse().map_err(|_| OutputError::EnergyNotParsed),
                    None => Err(OutputError::EnergyNotFound),
                };
            }
        }
        if banner.is_some_and(|banner| line.contains(banner)) {
            finished = true;
        }
    }

    if finished && result == Err(OutputError::EnergyNotFound) {
        return Err(OutputError::FinishedButNoEnergy);
    }
    result
}

const MOLPRO_TERMINATED: &str = "Molpro calculation terminated";

/// Single-method coupled-cluster baseline.
pub struct Molpro {
    basis: String,
    charge: String,
    spin: String,
}

impl Molpro {
    fn head() -> Vec<String> {
        ["memory,1125,m", "nocompress", "geomtyp=xyz", "angstrom", "geometry={"]
            .map(str::to_owned)
            .to_vec()
    }

    fn foot(&self) -> Vec<String> {
        vec![
            "}".to_owned(),
            format!("basis={}", self.basis),
            format!("set,charge={}", self.charge),
            format!("set,spin={}", self.spin),
            "hf".to_owned(),
            "{CCSD(T)-F12}".to_owned(),
        ]
    }
}

impl Program for Molpro {
    fn make_in(&self, names: &[String], coords: &[f64]) -> Vec<String> {
        make_input(Self::head(), geometry_lines(names, coords), self.foot())
    }

    fn read_out(&self, path: &Path) -> std::result::Result<f64, OutputError> {
        find_energy(&read_lines(path)?, "energy=", 1, Some(MOLPRO_TERMINATED))
    }

    fn command(&self, input: &Path) -> String {
        format!("molpro -t 1 {}", input.display())
    }
}

/// Semi-empirical baseline. The energy is taken from the aux file's
/// `TOTAL_ENERGY:EV=` assignment, which glues the value to the marker and
/// uses Fortran `D` exponents.
pub struct Mopac {
    charge: String,
    method: String,
}

const MOPAC_MARKER: &str = "TOTAL_ENERGY:EV=";

impl Program for Mopac {
    fn make_in(&self, names: &[String], coords: &[f64]) -> Vec<String> {
        let head = vec![
            format!(
                "threads=1 XYZ ANGSTROMS scfcrt=1.D-21 aux(precision=9) \
                 external=params.dat 1SCF charge={} {}",
                self.charge, self.method
            ),
            "MOLECULE # 1".to_owned(),
            String::new(),
        ];
        make_input(head, geometry_lines(names, coords), Vec::new())
    }

    fn read_out(&self, path: &Path) -> std::result::Result<f64, OutputError> {
        let lines = read_lines(path)?;
        scan_lines(&lines)?;
        for line in &lines {
            if let Some(value) = line.split(MOPAC_MARKER).nth(1) {
                return value
                    .trim()
                    .replace('D', "E")
                    .parse()
                    .map_err(|_| OutputError::EnergyNotParsed);
            }
        }
        Err(OutputError::EnergyNotFound)
    }

    fn command(&self, input: &Path) -> String {
        format!("mopac {}", input.display())
    }
}

/// Composite extrapolation: CCSD(T) complete-basis extrapolation with
/// relativistic and core-correlation corrections, assembled by the program
/// into the `cccre` variable.
pub struct CcCr {
    charge: String,
    spin: String,
}

const MTC_BASIS: &str = "default=aug-cc-pvtz
s,C,8236.0,1235.0,280.8, 79.27,25.59, 8.997,3.319
s,C,0.9059,0.3643,0.1285000
p,C,56.0,18.71,4.133,0.2827,0.3827,0.1209
d,C,30.0,10.0,3.3,1.097,0.318
f,C,7.0,2.3,0.7610
s,N,11420.0,1712.0,389.3,110.0,35.57,12.54,4.644
s,N,1.293,0.5118,0.1787
p,N,79.89,26.63,5.948,1.742,0.555,0.1725
d,N,45.0,15.0,5.0,1.654,0.469
f,N,9.9,3.3,1.093
s,O,15330.0,2299.0,522.4,147.3,47.55,16.76,6.207
s,O,1.752,0.6882,0.2384
p,O,103.5,34.46,7.749,2.28,0.7156,0.214
d,O,63.0,21.0,7.0,2.314,0.645
f,O,12.9,4.3,1.428
s,Mg,164900.0,24710.0,5628.0,1596.0,521.0;
s,Mg,188.0,73.01,29.90,12.54,4.306,1.826;
s,Mg,0.7417,0.0761,0.145,0.033,0.0129;
p,Mg,950.70,316.90,74.86,23.72,8.669,3.363;
p,Mg,1.310,0.4911,0.2364,0.08733,0.03237,0.00745;
d,Mg,1.601,0.686,0.126,0.294,0.0468;
f,Mg,1.372,0.588,0.094,0.252;";

const CCCR_FORMULA: &str = "cccre=etz-((eqz-etz)/(4.5^(-4)-3.5^(-4)))*3.5^(-4)\
+((e5z-etz+((eqz-etz)/(4.5^(-4)-3.5^(-4)))*(3.5^(-4)-5.5^(-4)))\
/(0.7477488413*((3.5^(-4)-5.5^(-4)))-3.5^(-6)+5.5^(-6)))\
*((0.7477488413*(3.5^(-4)))-3.5^(-6))\
+emtc-emt+edkr-edk";

impl CcCr {
    fn head() -> Vec<String> {
        [
            "memory,1125,m",
            "gthresh,energy=1.d-10,zero=1.d-16,oneint=1.d-16,twoint=1.d-16;",
            "gthresh,optgrad=1.d-8,optstep=1.d-8;",
            "nocompress",
            "geomtyp=xyz",
            "angstrom",
            "geometry={",
        ]
        .map(str::to_owned)
        .to_vec()
    }

    fn foot(&self) -> Vec<String> {
        let mut lines = vec![
            "}".to_owned(),
            format!("set,charge={}", self.charge),
            format!("set,spin={}", self.spin),
        ];
        let cc_step = |lines: &mut Vec<String>, tag: &str, core: bool| {
            lines.push("{hf,maxit=500;accu,20;}".to_owned());
            if core {
                lines.push("{ccsd(t),nocheck,maxit=250;orbital,IGNORE_ERROR;core}".to_owned());
            } else {
                lines.push("{ccsd(t),nocheck,maxit=250;orbital,IGNORE_ERROR;}".to_owned());
            }
            lines.push(format!("{tag}=energy"));
        };

        for (basis, tag) in [("avtz", "etz"), ("avqz", "eqz"), ("av5z", "e5z")] {
            lines.push(format!("basis={basis}"));
            cc_step(&mut lines, tag, false);
        }

        lines.push("basis=vtz-dk".to_owned());
        lines.push("dkroll=0".to_owned());
        cc_step(&mut lines, "edk", false);
        lines.push("basis=vtz-dk".to_owned());
        lines.push("dkroll=1".to_owned());
        cc_step(&mut lines, "edkr", false);
        lines.push("dkroll=0".to_owned());

        for core in [false, true] {
            lines.push("basis={".to_owned());
            lines.extend(MTC_BASIS.lines().map(str::to_owned));
            lines.push("}".to_owned());
            cc_step(&mut lines, if core { "emtc" } else { "emt" }, core);
        }

        lines.push(CCCR_FORMULA.to_owned());
        lines.push("show[1,f20.12],cccre".to_owned());
        lines
    }
}

impl Program for CcCr {
    fn make_in(&self, names: &[String], coords: &[f64]) -> Vec<String> {
        make_input(Self::head(), geometry_lines(names, coords), self.foot())
    }

    fn read_out(&self, path: &Path) -> std::result::Result<f64, OutputError> {
        // the composite energy is assigned to a variable, so the value sits
        // two fields past the marker, skipping the equals sign
        find_energy(&read_lines(path)?, "CCCRE", 2, Some(MOLPRO_TERMINATED))
    }

    fn command(&self, input: &Path) -> String {
        format!("molpro -t 1 {}", input.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::assert_approx_eq;
    use std::io::Write as _;

    fn write_out(dir: &tempfile::TempDir, content: &str) -> std::path::PathBuf {
        let path = dir.path().join("job.out");
        let mut file = fs::File::create(&path).unwrap();
        write!(file, "{content}").unwrap();
        path
    }

    fn molpro() -> Molpro {
        Molpro {
            basis: "cc-pVTZ-F12".to_owned(),
            charge: "0".to_owned(),
            spin: "0".to_owned(),
        }
    }

    fn water_names() -> Vec<String> {
        vec!["H".to_owned(), "O".to_owned(), "H".to_owned()]
    }

    const WATER_COORDS: [f64; 9] = [
        0.0000000000,
        0.7574590974,
        0.5217905143,
        0.0000000000,
        0.0000000000,
        -0.0657441568,
        0.0000000000,
        -0.7574590974,
        0.5217905143,
    ];

    #[test]
    fn molpro_input() {
        let want = [
            "memory,1125,m",
            "nocompress",
            "geomtyp=xyz",
            "angstrom",
            "geometry={",
            "H 0.0000000000 0.7574590974 0.5217905143",
            "O 0.0000000000 0.0000000000 -0.0657441568",
            "H 0.0000000000 -0.7574590974 0.5217905143",
            "}",
            "basis=cc-pVTZ-F12",
            "set,charge=0",
            "set,spin=0",
            "hf",
            "{CCSD(T)-F12}",
        ];
        assert_eq!(molpro().make_in(&water_names(), &WATER_COORDS), want);
    }

    #[test]
    fn molpro_input_round_trips() {
        let lines = molpro().make_in(&water_names(), &WATER_COORDS);
        let body = &lines[5..8];
        for (line, (name, xyz)) in body
            .iter()
            .zip(water_names().iter().zip(WATER_COORDS.chunks_exact(3)))
        {
            let mut fields = line.split_whitespace();
            assert_eq!(fields.next(), Some(name.as_str()));
            for coord in xyz {
                let parsed: f64 = fields.next().unwrap().parse().unwrap();
                assert_approx_eq!(f64, parsed, *coord, epsilon = 1e-10);
            }
        }
    }

    #[test]
    fn mopac_input_head() {
        let mopac = Mopac {
            charge: "0".to_owned(),
            method: "PM6".to_owned(),
        };
        let lines = mopac.make_in(&water_names(), &WATER_COORDS);
        assert_eq!(
            lines[0],
            "threads=1 XYZ ANGSTROMS scfcrt=1.D-21 aux(precision=9) \
             external=params.dat 1SCF charge=0 PM6"
        );
        assert_eq!(lines[1], "MOLECULE # 1");
        assert_eq!(lines[2], "");
        assert_eq!(lines.len(), 6);
    }

    #[test]
    fn molpro_energy_found() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_out(&dir, "starting\n energy= -76.369839607972\n done\n");
        assert_eq!(molpro().read_out(&path), Ok(-76.369839607972));
    }

    #[test]
    fn missing_output() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            molpro().read_out(&dir.path().join("nope.out")),
            Err(OutputError::FileNotFound)
        );
    }

    #[test]
    fn blank_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_out(&dir, "\n");
        assert_eq!(molpro().read_out(&path), Err(OutputError::BlankOutput));
    }

    #[test]
    fn error_in_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_out(&dir, "fine so far\nglobal Error: disk quota\n");
        assert_eq!(
            molpro().read_out(&path),
            Err(OutputError::FileContainsError)
        );
    }

    #[test]
    fn finished_but_no_energy() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_out(&dir, "warming up\n Molpro calculation terminated\n");
        assert_eq!(
            molpro().read_out(&path),
            Err(OutputError::FinishedButNoEnergy)
        );
    }

    #[test]
    fn unparseable_energy() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_out(&dir, "first\n energy= twelve\n");
        assert_eq!(molpro().read_out(&path), Err(OutputError::EnergyNotParsed));
    }

    #[test]
    fn panic_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_out(&dir, "something\nPANIC: deliberate kill\n");
        assert_eq!(molpro().read_out(&path), Err(OutputError::Panicked));
    }

    #[test]
    fn cccr_setting_line() {
        let cccr = CcCr {
            charge: "0".to_owned(),
            spin: "0".to_owned(),
        };
        let dir = tempfile::tempdir().unwrap();
        let path = write_out(
            &dir,
            "preamble\n SETTING CCCRE = -93.471416880846\n tail\n",
        );
        assert_eq!(cccr.read_out(&path), Ok(-93.471416880846));
    }

    #[test]
    fn cccr_deck_shape() {
        let cccr = CcCr {
            charge: "0".to_owned(),
            spin: "1".to_owned(),
        };
        let lines = cccr.make_in(&water_names(), &WATER_COORDS);
        assert_eq!(lines[0], "memory,1125,m");
        assert!(lines.contains(&"set,spin=1".to_owned()));
        assert!(lines.contains(&"etz=energy".to_owned()));
        assert!(lines.contains(&"eqz=energy".to_owned()));
        assert!(lines.contains(&"e5z=energy".to_owned()));
        assert!(lines.contains(&"edkr=energy".to_owned()));
        assert!(lines.contains(&"emtc=energy".to_owned()));
        assert_eq!(lines.last().unwrap(), "show[1,f20.12],cccre");
        assert!(lines.iter().any(|line| line.starts_with("cccre=etz")));
    }

    #[test]
    fn mopac_aux_energy() {
        let mopac = Mopac {
            charge: "0".to_owned(),
            method: "PM6".to_owned(),
        };
        let dir = tempfile::tempdir().unwrap();
        let path = write_out(&dir, "START\nTOTAL_ENERGY:EV=-0.32112316D+03\nEND\n");
        assert_eq!(mopac.read_out(&path), Ok(-0.32112316e3));
    }
}
