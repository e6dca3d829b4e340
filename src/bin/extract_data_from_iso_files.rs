//! Component D-adjacent entry point: scan an already-extracted Windows
//! installation image folder and write `from_iso/<version>.json`, per
//! `examples/original_source/data/extract_data_from_iso_files.py::main`.
//! The actual ISO/WIM extraction (7-Zip) is a manual prerequisite step, as
//! in the original.

use std::path::PathBuf;

use anyhow::{Context, Result};
use argh::FromArgs;

use winbindex_rs::iso;

#[derive(FromArgs, Debug)]
/// Scan an extracted Windows installation image folder for file metadata.
struct Args {
    /// folder the installation image's numbered WIM indices were extracted into
    #[argh(positional)]
    folder: PathBuf,

    /// windows version tag (e.g. "23H2")
    #[argh(positional)]
    windows_version: String,

    /// SHA-256 of the source ISO
    #[argh(positional)]
    windows_iso_sha256: String,

    /// release date, YYYY-MM-DD
    #[argh(positional)]
    release_date: String,

    /// output directory (defaults to `out`)
    #[argh(option, short = 'o', default = "PathBuf::from(\"out\")")]
    out_path: PathBuf,
}

fn main() -> Result<()> {
    env_logger::init();

    let args: Args = argh::from_env();

    log::info!("scanning {:?}", args.folder);
    let result = iso::scan_folder(&args.folder, &args.windows_version, &args.windows_iso_sha256, &args.release_date)?;

    let from_iso_dir = args.out_path.join("from_iso");
    std::fs::create_dir_all(&from_iso_dir).with_context(|| format!("failed to create {from_iso_dir:?}"))?;

    let output_path = from_iso_dir.join(format!("{}.json", args.windows_version));
    let file = std::fs::File::create(&output_path).with_context(|| format!("failed to create {output_path:?}"))?;
    serde_json::to_writer_pretty(file, &result)?;

    log::info!("wrote {output_path:?} ({} files)", result.files.len());
    Ok(())
}
