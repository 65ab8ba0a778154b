//! Adapters for the batch queueing systems.
//!
//! A submission script runs the external program, then signals the driver
//! process by name over ssh so the waiting evaluation wakes up, and finally
//! removes the files of earlier evaluations that have been fully consumed.

use super::config::{Config, QueueKind};
use super::error::Result;
use std::fs;
use std::path::Path;
use std::process::Command;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// Process name the submission scripts signal with `pkill`.
pub const PROG_NAME: &str = "quartic";

/// Filename prefixes whose files are deleted by the next submitted script.
///
/// Cleanup is delegated to the compute nodes so the driver never blocks on
/// filesystem traffic for finished evaluations.
#[derive(Debug, Default)]
pub struct GarbageHeap {
    heap: Vec<String>,
}

impl GarbageHeap {
    /// Queues every file starting with `prefix` for deletion.
    pub fn push(&mut self, prefix: &str) {
        self.heap.push(prefix.to_owned());
    }

    /// Number of queued prefixes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Returns `true` if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Drains the heap into `rm` commands for a submission script.
    pub fn dump(&mut self) -> Vec<String> {
        self.heap.drain(..).map(|p| format!("rm {p}*")).collect()
    }
}

/// A queue adapter: script writer and submitter.
pub trait Queue: Send + Sync {
    /// Builds the submission script around the program command line.
    fn make(&self, cmd: &str, sig: i32, dump: &mut GarbageHeap) -> Vec<String>;

    /// Writes the submission script to `path`.
    fn write(&self, path: &Path, cmd: &str, sig: i32, dump: &mut GarbageHeap) -> Result<()> {
        Ok(fs::write(path, self.make(cmd, sig, dump).join("\n"))?)
    }

    /// Submits the script, retrying every second until the submitter
    /// accepts it, and returns the parsed job number.
    fn submit(&self, path: &Path) -> u32;
}

/// Instantiates the adapter selected by the configuration.
#[must_use]
pub fn make_queue(config: &Config) -> Box<dyn Queue> {
    match config.queue {
        QueueKind::Pbs => Box::new(Pbs {
            host: config.host.clone(),
        }),
        QueueKind::Slurm => Box::new(Slurm {
            host: config.host.clone(),
        }),
    }
}

/// Runs the submitter until it succeeds and hands back its stdout.
fn submit_with_retry(program: &str, args: &[&str], script: &Path) -> String {
    loop {
        let output = Command::new(program).args(args).arg(script).output();
        match output {
            Ok(output) if output.status.success() => {
                return String::from_utf8_lossy(&output.stdout).into_owned();
            }
            Ok(output) => {
                warn!(
                    script = %script.display(),
                    status = %output.status,
                    "submitter rejected the script; retrying"
                );
            }
            Err(err) => {
                warn!(script = %script.display(), %err, "submitter unavailable; retrying");
            }
        }
        thread::sleep(Duration::from_secs(1));
    }
}

/// Pulls the numeric job identifier out of submitter stdout. Handles both
/// `775241.maple` and `Submitted batch job 775241`.
fn job_number(stdout: &str) -> u32 {
    stdout
        .split_whitespace()
        .flat_map(|field| field.split('.'))
        .find_map(|field| field.parse().ok())
        .unwrap_or_default()
}

/// PBS-style queue driven by `qsub`.
pub struct Pbs {
    host: String,
}

impl Pbs {
    fn head() -> Vec<String> {
        [
            "#!/bin/sh",
            "#PBS -N quartic",
            "#PBS -S /bin/bash",
            "#PBS -j oe",
            "#PBS -o /dev/null",
            "#PBS -W umask=022",
            "#PBS -l walltime=00:30:00",
            "#PBS -l ncpus=1",
            "#PBS -l mem=9gb",
            "module load intel",
            "module load mvapich2",
            "module load pbspro",
            "export PATH=/usr/local/apps/molpro/2015.1.35/bin:$PATH",
            "export WORKDIR=$PBS_O_WORKDIR",
            "export TMPDIR=/tmp/$USER/$PBS_JOBID",
            "cd $WORKDIR",
            "mkdir -p $TMPDIR",
            "date",
        ]
        .map(str::to_owned)
        .to_vec()
    }

    fn foot(&self, sig: i32, dump: &mut GarbageHeap) -> Vec<String> {
        let mut lines = vec![format!("ssh -t {} pkill -{sig} {PROG_NAME}", self.host)];
        lines.extend(dump.dump());
        lines.push("rm -rf $TMPDIR".to_owned());
        lines
    }
}

impl Queue for Pbs {
    fn make(&self, cmd: &str, sig: i32, dump: &mut GarbageHeap) -> Vec<String> {
        let mut lines = Self::head();
        lines.push(cmd.to_owned());
        lines.extend(self.foot(sig, dump));
        lines
    }

    fn submit(&self, path: &Path) -> u32 {
        // -f runs qsub in the foreground so stdout carries the job id
        let stdout = submit_with_retry("qsub", &["-f"], path);
        let number = job_number(&stdout);
        debug!(script = %path.display(), number, "submitted");
        number
    }
}

/// SLURM-style queue driven by `sbatch`.
pub struct Slurm {
    host: String,
}

impl Slurm {
    fn head() -> Vec<String> {
        [
            "#!/bin/bash",
            "#SBATCH --job-name=quartic",
            "#SBATCH --ntasks=4",
            "#SBATCH --cpus-per-task=1",
            "#SBATCH -o /dev/null",
            "#SBATCH --mem=1gb",
        ]
        .map(str::to_owned)
        .to_vec()
    }

    fn foot(&self, sig: i32, dump: &mut GarbageHeap) -> Vec<String> {
        let mut lines = vec![format!("ssh -t {} pkill -{sig} {PROG_NAME}", self.host)];
        lines.extend(dump.dump());
        lines
    }
}

impl Queue for Slurm {
    fn make(&self, cmd: &str, sig: i32, dump: &mut GarbageHeap) -> Vec<String> {
        let mut lines = Self::head();
        lines.push(cmd.to_owned());
        lines.extend(self.foot(sig, dump));
        lines
    }

    fn submit(&self, path: &Path) -> u32 {
        let stdout = submit_with_retry("sbatch", &[], path);
        let number = job_number(&stdout);
        debug!(script = %path.display(), number, "submitted");
        number
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap() -> GarbageHeap {
        let mut dump = GarbageHeap::default();
        dump.push("test1");
        dump.push("test2");
        dump.push("test3");
        dump
    }

    #[test]
    fn pbs_script() {
        let pbs = Pbs {
            host: "maple".to_owned(),
        };
        let mut dump = heap();
        let got = pbs.make("molpro -t 1 molpro.in", 35, &mut dump);
        let want = [
            "#!/bin/sh",
            "#PBS -N quartic",
            "#PBS -S /bin/bash",
            "#PBS -j oe",
            "#PBS -o /dev/null",
            "#PBS -W umask=022",
            "#PBS -l walltime=00:30:00",
            "#PBS -l ncpus=1",
            "#PBS -l mem=9gb",
            "module load intel",
            "module load mvapich2",
            "module load pbspro",
            "export PATH=/usr/local/apps/molpro/2015.1.35/bin:$PATH",
            "export WORKDIR=$PBS_O_WORKDIR",
            "export TMPDIR=/tmp/$USER/$PBS_JOBID",
            "cd $WORKDIR",
            "mkdir -p $TMPDIR",
            "date",
            "molpro -t 1 molpro.in",
            "ssh -t maple pkill -35 quartic",
            "rm test1*",
            "rm test2*",
            "rm test3*",
            "rm -rf $TMPDIR",
        ];
        assert_eq!(got, want);
        assert!(dump.is_empty());
    }

    #[test]
    fn slurm_script() {
        let slurm = Slurm {
            host: "master".to_owned(),
        };
        let mut dump = GarbageHeap::default();
        let got = slurm.make("molpro -t 1 inp/job.in", 64, &mut dump);
        assert_eq!(got[0], "#!/bin/bash");
        assert_eq!(got[6], "molpro -t 1 inp/job.in");
        assert_eq!(got[7], "ssh -t master pkill -64 quartic");
        assert_eq!(got.len(), 8);
    }

    #[test]
    fn job_numbers() {
        assert_eq!(job_number("775241.maple\n"), 775241);
        assert_eq!(job_number("Submitted batch job 18530\n"), 18530);
        assert_eq!(job_number("no digits here"), 0);
    }

    #[test]
    fn dump_consumes_the_heap() {
        let mut dump = heap();
        assert_eq!(dump.len(), 3);
        assert_eq!(dump.dump(), ["rm test1*", "rm test2*", "rm test3*"]);
        assert!(dump.is_empty());
    }
}
