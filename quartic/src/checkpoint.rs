//! Crash-safe snapshots of committed derivative entries.
//!
//! Four JSON files hold the committed ("done") views of FC2, FC3, and FC4
//! plus the pair cache. Each file is written to a temporary name and renamed
//! into place, so a crash mid-write leaves the previous snapshot intact.

use super::cache::E2Cache;
use super::error::{Error, Result};
use super::scheduler::Shared;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::sync::RwLock;
use tracing::info;

const FC2_FILE: &str = "fc2.json";
const FC3_FILE: &str = "fc3.json";
const FC4_FILE: &str = "fc4.json";
const E2_FILE: &str = "e2d.json";

#[derive(Deserialize, Serialize)]
struct Snapshot {
    m: usize,
    vals: Vec<f64>,
}

/// Snapshots the committed tables and the pair cache into `dir`.
pub fn save(shared: &Shared, dir: &Path) -> Result<()> {
    write_table(&dir.join(FC2_FILE), shared.m, &shared.done2)?;
    write_table(&dir.join(FC3_FILE), shared.m, &shared.done3)?;
    write_table(&dir.join(FC4_FILE), shared.m, &shared.done4)?;
    write_json(&dir.join(E2_FILE), &*shared.e2.read().unwrap())?;
    info!(
        progress = shared.progress.load(std::sync::atomic::Ordering::SeqCst),
        "checkpoint written"
    );
    Ok(())
}

/// Restores a run from the snapshots in `dir`, populating both the live
/// tables and the done mirrors. All four files must be present.
pub fn restore(shared: &Shared, dir: &Path) -> Result<()> {
    read_table(&dir.join(FC2_FILE), shared.m, &shared.fc2, &shared.done2)?;
    read_table(&dir.join(FC3_FILE), shared.m, &shared.fc3, &shared.done3)?;
    read_table(&dir.join(FC4_FILE), shared.m, &shared.fc4, &shared.done4)?;

    let path = dir.join(E2_FILE);
    let cache: E2Cache = read_json(&path)?;
    if cache.coords() != shared.m {
        return Err(Error::Checkpoint(format!(
            "{}: cache was written for {} coordinates, this run has {}",
            path.display(),
            cache.coords(),
            shared.m
        )));
    }
    *shared.e2.write().unwrap() = cache;
    info!("restored checkpoint");
    Ok(())
}

fn write_table(path: &Path, m: usize, done: &RwLock<Vec<f64>>) -> Result<()> {
    let vals = done.read().unwrap().clone();
    write_json(path, &Snapshot { m, vals })
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let tmp = path.with_extension("tmp");
    serde_json::to_writer(BufWriter::new(File::create(&tmp)?), value)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn read_table(
    path: &Path,
    m: usize,
    live: &RwLock<Vec<f64>>,
    done: &RwLock<Vec<f64>>,
) -> Result<()> {
    let snapshot: Snapshot = read_json(path)?;
    if snapshot.m != m {
        return Err(Error::Checkpoint(format!(
            "{}: table was written for {} coordinates, this run has {m}",
            path.display(),
            snapshot.m
        )));
    }
    let expected = done.read().unwrap().len();
    if snapshot.vals.len() != expected {
        return Err(Error::Checkpoint(format!(
            "{}: expected {expected} entries, found {}",
            path.display(),
            snapshot.vals.len()
        )));
    }
    live.write().unwrap().copy_from_slice(&snapshot.vals);
    done.write().unwrap().copy_from_slice(&snapshot.vals);
    Ok(())
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let file = File::open(path)
        .map_err(|err| Error::Checkpoint(format!("{}: {err}", path.display())))?;
    Ok(serde_json::from_reader(BufReader::new(file))?)
}
