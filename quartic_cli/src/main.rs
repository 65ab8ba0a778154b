#![allow(missing_docs)]

use anyhow::{Context, Result, bail};
use clap::Parser;
use git_version::git_version;
use quartic::config::Config;
use quartic::driver;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::error;
use tracing_subscriber::EnvFilter;

/// Directory that holds every generated input, script, and output file.
const WORKDIR: &str = "inp";

#[derive(Parser)]
#[command(
    about,
    author,
    name = "quartic",
    version = git_version!(
        args = ["--always", "--dirty", "--long", "--tags"],
        cargo_prefix = "",
        fallback = "unknown"
    )
)]
struct Opts {
    /// Path to the configuration file.
    infile: PathBuf,
    /// Resume from the checkpoint files in the current directory.
    #[arg(long, short = 'c')]
    checkpoint: bool,
    /// Overwrite an existing workspace directory.
    #[arg(long, short = 'o')]
    overwrite: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let opts = Opts::parse();
    match run(&opts) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(opts: &Opts) -> Result<()> {
    let config = Config::load(&opts.infile)?;
    let workdir = Path::new(WORKDIR);
    prepare_workdir(workdir, opts)?;
    driver::run(&config, opts.checkpoint, workdir, Path::new("."))?;
    Ok(())
}

/// Creates the workspace directory, wiping a stale one only when asked.
fn prepare_workdir(workdir: &Path, opts: &Opts) -> Result<()> {
    if workdir.exists() {
        if opts.checkpoint {
            // a resumed run keeps its files
            return Ok(());
        }
        if !opts.overwrite {
            bail!(
                "workspace directory {} already exists; pass -o to overwrite it",
                workdir.display()
            );
        }
        fs::remove_dir_all(workdir)
            .with_context(|| format!("could not clear {}", workdir.display()))?;
    }
    fs::create_dir_all(workdir)
        .with_context(|| format!("could not create {}", workdir.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_command() {
        use clap::CommandFactory;
        Opts::command().debug_assert();
    }
}
