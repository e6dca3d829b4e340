//! Component B entry point: download and unpack manifests for every update
//! listed in `updates.json`.

use std::path::PathBuf;

use anyhow::Result;
use argh::FromArgs;

use winbindex_rs::fetch::build_client;
use winbindex_rs::{driver, Config};

#[derive(FromArgs, Debug)]
/// Download and extract update packages into per-update manifest trees.
struct Args {
    /// output directory (defaults to `out`)
    #[argh(option, short = 'o', default = "PathBuf::from(\"out\")")]
    out_path: PathBuf,

    /// keep processing remaining updates after one fails
    #[argh(switch)]
    keep_going: bool,
}

fn main() -> Result<()> {
    env_logger::init();

    let args: Args = argh::from_env();
    let client = build_client()?;

    let mut config = Config::default();
    config.out_path = args.out_path.to_string_lossy().to_string();
    config.exit_on_first_error = !args.keep_going;

    driver::run_fetch_manifests_stage(&client, &config, &args.out_path)
}
