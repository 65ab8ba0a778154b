//! Enumeration of derivative entries and the top-level run loop.
//!
//! The driver walks every unique index tuple up to the requested order,
//! asks the stencil generator for the evaluations, and streams them to the
//! worker pool. Second derivatives cover the full square so FC2 comes out
//! dense; third and fourth derivatives only visit sorted tuples, matching
//! the packed tables.

use super::checkpoint;
use super::config::Config;
use super::error::Result;
use super::scheduler::Scheduler;
use super::signals::{Hub, SIGMIN, window};
use super::stencil::{Eval, stencil};
use super::tables::{write_fc2, write_fc3, write_fc4};
use crossbeam_channel::{Sender, bounded};
use std::path::Path;
use std::thread;
use tracing::info;

/// Number of evaluations a run of derivative order `order` dispatches for
/// `m` coordinates, counting every order from two up.
#[must_use]
pub fn total_jobs(order: usize, m: usize) -> usize {
    let pairs = m * (m - 1) / 2;
    let triples = m * (m - 1) * (m - 2) / 6;
    let quads = m * (m - 1) * (m - 2) * (m - 3) / 24;

    // order 2: m diagonal stencils of 3, the rest of the square at 4
    let mut total = 3 * m + 4 * m * (m - 1);
    if order >= 3 {
        // all equal, pair + single (two sorted shapes), all distinct
        total += 4 * m + 6 * m * (m - 1) + 8 * triples;
    }
    if order >= 4 {
        total += 5 * m
            + 8 * m * (m - 1)
            + 9 * pairs
            + 12 * m * (m - 1) * (m - 2) / 2
            + 16 * quads;
    }
    total
}

/// Runs a full computation: reference energy, every stencil up to the
/// configured order, drain, and emission of the scaled tables.
pub fn run(config: &Config, resume: bool, workdir: &Path, out_dir: &Path) -> Result<()> {
    let m = config.geometry.ncoords();
    let total = total_jobs(config.derivative, m);
    info!(
        atoms = config.geometry.natoms(),
        coords = m,
        order = config.derivative,
        total,
        "starting"
    );

    let hub = Hub::install()?;
    let mut sched = Scheduler::new(
        config,
        hub,
        workdir.to_path_buf(),
        out_dir.to_path_buf(),
        total,
    );
    if resume {
        checkpoint::restore(sched.shared(), out_dir)?;
    }

    let e0 = sched.reference_energy(SIGMIN)?;
    sched.set_reference(e0);

    let sched = &sched;
    thread::scope(|scope| {
        let (tx, rx) = bounded::<Eval>(config.concurrency);
        for _ in 0..config.concurrency {
            let rx = rx.clone();
            scope.spawn(move || sched.worker(&rx));
        }
        drop(rx);
        dispatch(config, sched, &tx)
    })?;

    if let Some(err) = sched.take_fatal() {
        return Err(err);
    }

    checkpoint::save(sched.shared(), out_dir)?;
    emit(config, sched, out_dir)
}

/// Streams every stencil to the pool, rotating through the signal window.
fn dispatch(config: &Config, sched: &Scheduler<'_>, tx: &Sender<Eval>) -> Result<()> {
    let m = i32::try_from(config.geometry.ncoords()).unwrap_or(i32::MAX);
    let mut sig = 0;

    for i in 1..=m {
        for j in 1..=m {
            feed(sched, tx, &[i, j], &mut sig)?;
        }
    }
    if config.derivative >= 3 {
        for i in 1..=m {
            for j in i..=m {
                for k in j..=m {
                    feed(sched, tx, &[i, j, k], &mut sig)?;
                }
            }
        }
    }
    if config.derivative >= 4 {
        for i in 1..=m {
            for j in i..=m {
                for k in j..=m {
                    for l in k..=m {
                        feed(sched, tx, &[i, j, k, l], &mut sig)?;
                    }
                }
            }
        }
    }
    Ok(())
}

fn feed(sched: &Scheduler<'_>, tx: &Sender<Eval>, target: &[i32], sig: &mut usize) -> Result<()> {
    let evals = stencil(target)?;
    if sched.entry_done(target) {
        sched.skip_progress(evals.len());
        return Ok(());
    }
    sched.set_counter(target, evals.len());
    for mut ev in evals {
        ev.sig = next_sig(sig);
        tx.send(ev).expect("worker pool closed early");
    }
    Ok(())
}

/// Hands out completion signals round-robin over `[SIGMIN, SIGMAX]`.
fn next_sig(counter: &mut usize) -> i32 {
    let sig = SIGMIN + i32::try_from(*counter % window()).unwrap_or_default();
    *counter += 1;
    sig
}

/// Scales and writes the derivative tables for the configured order.
fn emit(config: &Config, sched: &Scheduler<'_>, out_dir: &Path) -> Result<()> {
    let natoms = config.geometry.natoms();
    let shared = sched.shared();
    write_fc2(out_dir, natoms, &shared.fc2.read().unwrap(), config.delta)?;
    if config.derivative >= 3 {
        write_fc3(out_dir, natoms, &shared.fc3.read().unwrap(), config.delta)?;
    }
    if config.derivative >= 4 {
        write_fc4(out_dir, natoms, &shared.fc4.read().unwrap(), config.delta)?;
    }
    info!("derivative tables written");
    Ok(())
}
