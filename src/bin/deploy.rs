//! Component H entry point: run one single-update deploy cycle, per
//! `examples/original_source/data/deploy.py::main`. Stops short of the
//! git-based publish step (spec.md's §1 Non-goal); this binary leaves the
//! updated on-disk state for a separate publish step to pick up.

use std::path::PathBuf;

use anyhow::Result;
use argh::FromArgs;

use winbindex_rs::fetch::build_client;
use winbindex_rs::{deploy, Config};

#[derive(FromArgs, Debug)]
/// Ingest the single oldest not-yet-known Windows update and fold it into
/// the grouped index.
struct Args {
    /// output directory (defaults to `out`)
    #[argh(option, short = 'o', default = "PathBuf::from(\"out\")")]
    out_path: PathBuf,
}

fn main() -> Result<()> {
    env_logger::init();

    let args: Args = argh::from_env();
    let client = build_client()?;

    let mut config = Config::default();
    config.out_path = args.out_path.to_string_lossy().to_string();

    match deploy::run_deploy_cycle(&client, &config, &args.out_path)? {
        Some(summary) => log::info!("{summary}"),
        None => log::info!("no new updates, nothing to deploy"),
    }

    Ok(())
}
