//! Component G/H entry point: fold updates, VirusTotal responses, and ISO
//! scans into the by-filename grouped index and rebuild `filenames.json`.

use std::path::PathBuf;

use anyhow::Result;
use argh::FromArgs;

use winbindex_rs::{driver, progress, Config};

#[derive(FromArgs, Debug)]
/// Merge update/VirusTotal/ISO records into the grouped per-filename index.
struct Args {
    /// output directory (defaults to `out`)
    #[argh(option, short = 'o', default = "PathBuf::from(\"out\")")]
    out_path: PathBuf,

    /// keep processing remaining files after one fails
    #[argh(switch)]
    keep_going: bool,

    /// stop after this many seconds and save progress for next time
    #[argh(option)]
    time_budget_secs: Option<u64>,
}

fn main() -> Result<()> {
    env_logger::init();

    let args: Args = argh::from_env();

    let mut config = Config::default();
    config.out_path = args.out_path.to_string_lossy().to_string();
    config.exit_on_first_error = !args.keep_going;

    let deadline = match args.time_budget_secs {
        Some(secs) => progress::Deadline::after(std::time::Duration::from_secs(secs)),
        None => progress::Deadline::none(),
    };

    driver::run_group_by_filename_stage(&args.out_path, &config, deadline)
}
