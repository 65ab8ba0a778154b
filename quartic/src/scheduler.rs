//! Throttled dispatch of evaluations and aggregation of their energies.
//!
//! A fixed pool of worker threads consumes evaluations from a bounded
//! channel, so at most `concurrency` external jobs are outstanding at once.
//! Each worker walks one evaluation through its life cycle: satisfied by the
//! reference energy, satisfied by the pair cache, or written, submitted, and
//! awaited through the signal hub until its output parses. Completed
//! contributions land in the shared tables under per-table writer locks.

use super::cache::E2Cache;
use super::checkpoint;
use super::config::Config;
use super::error::{Error, Result};
use super::program::{OutputError, Program, make_program};
use super::queue::{GarbageHeap, Queue, make_queue};
use super::signals::Hub;
use super::stencil::{Eval, REFERENCE, fresh_name};
use super::tables::{idx3, idx4, len3, len4};
use crossbeam_channel::Receiver;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

/// How long a waiter sleeps before probing its output file even without a
/// completion signal.
const RETRY: Duration = Duration::from_secs(15);

/// Tables, counters, and caches shared between the workers, the driver, and
/// the checkpointer. Each table has its own writer lock; the counters are
/// locked separately from the values they count.
pub struct Shared {
    /// Number of Cartesian coordinates, `3N`.
    pub m: usize,
    /// Total number of evaluations in this run, for progress reporting.
    pub total: usize,
    /// Dense `m x m` second-derivative sums.
    pub fc2: RwLock<Vec<f64>>,
    /// Packed third-derivative sums.
    pub fc3: RwLock<Vec<f64>>,
    /// Packed fourth-derivative sums.
    pub fc4: RwLock<Vec<f64>>,
    /// Outstanding contributions per second-derivative entry.
    pub cnt2: RwLock<Vec<u32>>,
    /// Outstanding contributions per third-derivative entry.
    pub cnt3: RwLock<Vec<u32>>,
    /// Outstanding contributions per fourth-derivative entry.
    pub cnt4: RwLock<Vec<u32>>,
    /// Committed second-derivative entries, written once when the counter
    /// reaches zero.
    pub done2: RwLock<Vec<f64>>,
    /// Committed third-derivative entries.
    pub done3: RwLock<Vec<f64>>,
    /// Committed fourth-derivative entries.
    pub done4: RwLock<Vec<f64>>,
    /// Two-step displaced energies keyed by the folded pair.
    pub e2: RwLock<E2Cache>,
    /// Completed evaluations so far.
    pub progress: AtomicUsize,
    /// Evaluations currently in the submitted state.
    pub active: AtomicUsize,
}

impl Shared {
    /// Allocates every table for `m` coordinates.
    #[must_use]
    pub fn new(m: usize, total: usize) -> Self {
        Self {
            m,
            total,
            fc2: RwLock::new(vec![0.0; m * m]),
            fc3: RwLock::new(vec![0.0; len3(m)]),
            fc4: RwLock::new(vec![0.0; len4(m)]),
            cnt2: RwLock::new(vec![0; m * m]),
            cnt3: RwLock::new(vec![0; len3(m)]),
            cnt4: RwLock::new(vec![0; len4(m)]),
            done2: RwLock::new(vec![0.0; m * m]),
            done3: RwLock::new(vec![0.0; len3(m)]),
            done4: RwLock::new(vec![0.0; len4(m)]),
            e2: RwLock::new(E2Cache::new(m)),
            progress: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
        }
    }
}

/// The evaluation scheduler.
pub struct Scheduler<'run> {
    config: &'run Config,
    program: Box<dyn Program>,
    queue: Box<dyn Queue>,
    hub: Arc<Hub>,
    workdir: PathBuf,
    out_dir: PathBuf,
    shared: Shared,
    heap: Mutex<GarbageHeap>,
    fatal: Mutex<Option<Error>>,
    aborted: AtomicBool,
    e0: f64,
}

impl<'run> Scheduler<'run> {
    /// Builds a scheduler over `workdir` (generated files) and `out_dir`
    /// (checkpoints), sized for `total` evaluations.
    #[must_use]
    pub fn new(
        config: &'run Config,
        hub: Arc<Hub>,
        workdir: PathBuf,
        out_dir: PathBuf,
        total: usize,
    ) -> Self {
        Self {
            config,
            program: make_program(config),
            queue: make_queue(config),
            hub,
            workdir,
            out_dir,
            shared: Shared::new(config.geometry.ncoords(), total),
            heap: Mutex::new(GarbageHeap::default()),
            fatal: Mutex::new(None),
            aborted: AtomicBool::new(false),
            e0: f64::NAN,
        }
    }

    /// The shared tables.
    #[must_use]
    pub const fn shared(&self) -> &Shared {
        &self.shared
    }

    /// Records the reference energy used to satisfy `E0` evaluations.
    pub fn set_reference(&mut self, e0: f64) {
        self.e0 = e0;
    }

    /// Computes the energy of the undisplaced geometry through the same
    /// submit-and-wait machinery as any other evaluation.
    pub fn reference_energy(&self, sig: i32) -> Result<f64> {
        info!("computing the reference energy");
        let energy = self.compute(&fresh_name(), &[], sig, false)?;
        info!(energy, "reference energy ready");
        Ok(energy)
    }

    /// Consumes evaluations until the channel closes. Fatal errors park the
    /// pool: the first one is kept, the rest of the queue is drained
    /// unprocessed so the driver can join.
    pub fn worker(&self, rx: &Receiver<Eval>) {
        for mut ev in rx.iter() {
            if self.aborted.load(Ordering::SeqCst) {
                continue;
            }
            if let Err(err) = self.process(&mut ev) {
                self.fail(err);
            }
        }
    }

    /// True once a worker has hit a fatal error.
    pub fn aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Takes the first fatal error, if any.
    pub fn take_fatal(&self) -> Option<Error> {
        self.fatal.lock().unwrap().take()
    }

    fn fail(&self, err: Error) {
        warn!(%err, "fatal; draining the remaining queue");
        self.fatal.lock().unwrap().get_or_insert(err);
        self.aborted.store(true, Ordering::SeqCst);
    }

    fn process(&self, ev: &mut Eval) -> Result<()> {
        if ev.name == REFERENCE {
            ev.result = self.e0;
            return self.aggregate(ev);
        }
        if ev.steps.len() == 2 {
            let cached = self.shared.e2.read().unwrap().get(&ev.steps);
            if let Some(energy) = cached {
                debug!(name = %ev.name, "satisfied from the pair cache");
                ev.result = energy;
                return self.aggregate(ev);
            }
        }

        ev.result = self.compute(&ev.name, &ev.steps, ev.sig, true)?;
        // this evaluation's files are dead weight now; the next submission
        // deletes them from the compute node
        let prefix = self.workdir.join(&ev.name);
        self.heap.lock().unwrap().push(&prefix.display().to_string());
        self.aggregate(ev)
    }

    /// Writes the input and submission script for one displaced geometry,
    /// submits it, and waits for a parseable energy.
    fn compute(&self, name: &str, steps: &[i32], sig: i32, pooled: bool) -> Result<f64> {
        let input = self.workdir.join(format!("{name}.in"));
        let script = self.workdir.join(format!("{name}.pbs"));
        let output = self.workdir.join(format!("{name}.out"));

        let coords = self.config.geometry.step(self.config.delta, steps);
        self.program
            .write_in(&input, &self.config.geometry.names, &coords)?;
        let cmd = self.program.command(&input);
        self.queue
            .write(&script, &cmd, sig, &mut self.heap.lock().unwrap())?;

        self.shared.active.fetch_add(1, Ordering::SeqCst);
        let result = self.await_energy(&script, &output, sig, pooled);
        self.shared.active.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn await_energy(&self, script: &Path, output: &Path, sig: i32, pooled: bool) -> Result<f64> {
        self.queue.submit(script);
        loop {
            let ticket = self.hub.subscribe(sig);
            let woke = ticket.wait(RETRY);
            drop(ticket);

            let live = self.shared.active.load(Ordering::SeqCst);
            match self.program.read_out(output) {
                Ok(energy) => return Ok(energy),
                Err(OutputError::Panicked) => {
                    return Err(Error::ProgramPanic {
                        path: output.to_path_buf(),
                    });
                }
                Err(
                    err @ (OutputError::BlankOutput
                    | OutputError::FileContainsError
                    | OutputError::EnergyNotParsed
                    | OutputError::FinishedButNoEnergy),
                ) => {
                    warn!(output = %output.display(), %err, live, "resubmitting");
                    self.queue.submit(script);
                }
                Err(OutputError::FileNotFound) => {
                    // a missing file while most workers idle means the queue
                    // lost the job rather than still running it
                    if pooled && live < self.config.concurrency / 2 {
                        warn!(
                            output = %output.display(),
                            live,
                            "output missing with idle capacity; resubmitting"
                        );
                        self.queue.submit(script);
                    } else {
                        debug!(output = %output.display(), live, woke, "still waiting");
                    }
                }
                Err(err) => {
                    debug!(output = %output.display(), %err, live, woke, "still waiting");
                }
            }
        }
    }

    /// Folds a completed evaluation into its derivative entry, commits the
    /// entry once its last contribution lands, and triggers a checkpoint at
    /// the configured interval.
    fn aggregate(&self, ev: &Eval) -> Result<()> {
        if ev.steps.len() == 2 {
            self.shared.e2.write().unwrap().put(&ev.steps, ev.result);
        }

        let contribution = f64::from(ev.coeff) * ev.result;
        match *ev.target {
            [i, j] => {
                let idx = self.index2(i, j);
                self.commit(&self.shared.fc2, &self.shared.cnt2, &self.shared.done2, idx, contribution);
            }
            [i, j, k] => {
                let mut t = [coord(i), coord(j), coord(k)];
                t.sort_unstable();
                let idx = idx3(t[0], t[1], t[2]);
                self.commit(&self.shared.fc3, &self.shared.cnt3, &self.shared.done3, idx, contribution);
            }
            [i, j, k, l] => {
                let mut t = [coord(i), coord(j), coord(k), coord(l)];
                t.sort_unstable();
                let idx = idx4(t[0], t[1], t[2], t[3]);
                self.commit(&self.shared.fc4, &self.shared.cnt4, &self.shared.done4, idx, contribution);
            }
            _ => return Err(Error::Stencil(ev.target.clone())),
        }

        let done = self.shared.progress.fetch_add(1, Ordering::SeqCst) + 1;
        let total = self.shared.total;
        info!(
            "{done}/{total} ({:.1}%)",
            100.0 * done as f64 / total as f64
        );
        if done % self.config.chk_interval == 0 {
            checkpoint::save(&self.shared, &self.out_dir)?;
        }
        Ok(())
    }

    fn commit(
        &self,
        table: &RwLock<Vec<f64>>,
        counters: &RwLock<Vec<u32>>,
        done: &RwLock<Vec<f64>>,
        idx: usize,
        contribution: f64,
    ) {
        {
            table.write().unwrap()[idx] += contribution;
        }
        let committed = {
            let mut cnt = counters.write().unwrap();
            cnt[idx] -= 1;
            cnt[idx] == 0
        };
        if committed {
            // the counter only reaches zero after every contribution has
            // been added, so this read sees the final value
            let value = table.read().unwrap()[idx];
            done.write().unwrap()[idx] = value;
        }
    }

    fn index2(&self, i: i32, j: i32) -> usize {
        (coord(i) - 1) * self.shared.m + coord(j) - 1
    }

    /// True if this derivative entry was restored from a checkpoint.
    #[must_use]
    pub fn entry_done(&self, target: &[i32]) -> bool {
        match *target {
            [i, j] => self.shared.done2.read().unwrap()[self.index2(i, j)] != 0.0,
            [i, j, k] => {
                let mut t = [coord(i), coord(j), coord(k)];
                t.sort_unstable();
                self.shared.done3.read().unwrap()[idx3(t[0], t[1], t[2])] != 0.0
            }
            [i, j, k, l] => {
                let mut t = [coord(i), coord(j), coord(k), coord(l)];
                t.sort_unstable();
                self.shared.done4.read().unwrap()[idx4(t[0], t[1], t[2], t[3])] != 0.0
            }
            _ => false,
        }
    }

    /// Arms the completion counter of a derivative entry with its stencil
    /// length.
    pub fn set_counter(&self, target: &[i32], stencil_len: usize) {
        let stencil_len = u32::try_from(stencil_len).unwrap_or(u32::MAX);
        match *target {
            [i, j] => {
                self.shared.cnt2.write().unwrap()[self.index2(i, j)] = stencil_len;
            }
            [i, j, k] => {
                let mut t = [coord(i), coord(j), coord(k)];
                t.sort_unstable();
                self.shared.cnt3.write().unwrap()[idx3(t[0], t[1], t[2])] = stencil_len;
            }
            [i, j, k, l] => {
                let mut t = [coord(i), coord(j), coord(k), coord(l)];
                t.sort_unstable();
                self.shared.cnt4.write().unwrap()[idx4(t[0], t[1], t[2], t[3])] = stencil_len;
            }
            _ => {}
        }
    }

    /// Advances progress past an entry that needs no work this run.
    pub fn skip_progress(&self, evals: usize) {
        self.shared.progress.fetch_add(evals, Ordering::SeqCst);
    }
}

const fn coord(index: i32) -> usize {
    index.unsigned_abs() as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stencil::stencil;
    use float_cmp::assert_approx_eq;

    const WATER: &str = "concjobs=2
geometry={
3
water
H          0.0000000000        0.7574590974        0.5217905143
O          0.0000000000        0.0000000000       -0.0657441568
H          0.0000000000       -0.7574590974        0.5217905143
}
";

    fn scheduler<'a>(config: &'a Config, dir: &Path) -> Scheduler<'a> {
        let mut sched = Scheduler::new(
            config,
            Hub::dummy(),
            dir.join("inp"),
            dir.to_path_buf(),
            315,
        );
        sched.set_reference(-76.0);
        sched
    }

    #[test]
    fn diagonal_entry_commits() {
        let config = Config::parse(WATER).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let sched = scheduler(&config, dir.path());

        let mut evals = stencil(&[1, 1]).unwrap();
        sched.set_counter(&[1, 1], evals.len());
        let energies = [-76.1, f64::NAN, -76.3];
        for (ev, energy) in evals.iter_mut().zip(energies) {
            if ev.name == REFERENCE {
                ev.result = sched.e0;
            } else {
                ev.result = energy;
            }
            sched.aggregate(ev).unwrap();
        }

        let expected = -76.1 - 2.0 * -76.0 + -76.3;
        assert_approx_eq!(f64, sched.shared.fc2.read().unwrap()[0], expected);
        assert_eq!(sched.shared.cnt2.read().unwrap()[0], 0);
        assert_approx_eq!(f64, sched.shared.done2.read().unwrap()[0], expected);
        assert_eq!(sched.shared.progress.load(Ordering::SeqCst), 3);
        assert!(sched.entry_done(&[1, 1]));
    }

    #[test]
    fn pair_cache_satisfies_mirrored_entries() {
        let config = Config::parse(WATER).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let sched = scheduler(&config, dir.path());

        // completing (1,2) populates the cache for every sign pair
        sched.set_counter(&[1, 2], 4);
        for mut ev in stencil(&[1, 2]).unwrap() {
            ev.result = -76.2;
            sched.aggregate(&ev).unwrap();
        }

        // the transposed entry is then satisfied without a submission
        let mut evals = stencil(&[2, 1]).unwrap();
        sched.set_counter(&[2, 1], evals.len());
        for ev in &mut evals {
            sched.process(ev).unwrap();
            assert_approx_eq!(f64, ev.result, -76.2);
        }
        assert!(sched.entry_done(&[2, 1]));
    }

    #[test]
    fn third_order_targets_are_canonicalized() {
        let config = Config::parse(WATER).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let sched = scheduler(&config, dir.path());

        sched.set_counter(&[2, 5, 2], 1);
        let mut ev = stencil(&[2, 5, 2]).unwrap().swap_remove(0);
        ev.result = 1.0;
        sched.aggregate(&ev).unwrap();
        // same packed slot as the sorted tuple
        assert!(sched.entry_done(&[2, 2, 5]));
    }

    #[test]
    fn reference_evaluations_use_the_stored_energy() {
        let config = Config::parse(WATER).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let sched = scheduler(&config, dir.path());

        sched.set_counter(&[3, 3], 3);
        let mut ev = stencil(&[3, 3]).unwrap().swap_remove(1);
        assert_eq!(ev.name, REFERENCE);
        sched.process(&mut ev).unwrap();
        assert_approx_eq!(f64, ev.result, -76.0);
    }

    #[test]
    fn fatal_errors_park_the_pool() {
        let config = Config::parse(WATER).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let sched = scheduler(&config, dir.path());

        assert!(!sched.aborted());
        sched.fail(Error::ProgramPanic {
            path: dir.path().join("x.out"),
        });
        sched.fail(Error::Config("second".into()));
        assert!(sched.aborted());
        assert!(matches!(
            sched.take_fatal(),
            Some(Error::ProgramPanic { .. })
        ));
        assert!(sched.take_fatal().is_none());
    }
}
