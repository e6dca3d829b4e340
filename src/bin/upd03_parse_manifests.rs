//! Component C entry point: parse every downloaded `.manifest` file into
//! JSON under `<out_path>/parsed/`.

use std::path::PathBuf;

use anyhow::Result;
use argh::FromArgs;

use winbindex_rs::{driver, Config};

#[derive(FromArgs, Debug)]
/// Parse extracted .manifest files into per-update assembly JSON.
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

    let mut config = Config::default();
    config.out_path = args.out_path.to_string_lossy().to_string();
    config.exit_on_first_error = !args.keep_going;

    driver::run_parse_manifests_stage(&config, &args.out_path)
}
