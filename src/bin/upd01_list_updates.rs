//! Component A entry point: resolve the update catalog and write
//! `updates.json`.

use std::fs::File;
use std::path::PathBuf;

use anyhow::{Context, Result};
use argh::FromArgs;

use winbindex_rs::catalog;
use winbindex_rs::fetch::build_client;

#[derive(FromArgs, Debug)]
/// Scrape Microsoft's update-history and release-health pages and write the
/// consolidated update catalog.
struct Args {
    /// output directory (defaults to `out`)
    #[argh(option, short = 'o', default = "PathBuf::from(\"out\")")]
    out_path: PathBuf,
}

fn main() -> Result<()> {
    env_logger::init();

    let args: Args = argh::from_env();
    std::fs::create_dir_all(&args.out_path)?;

    let client = build_client()?;

    let mut per_version = std::collections::BTreeMap::new();
    for (windows_version, page_id) in catalog::windows_versions() {
        log::info!("resolving updates for Windows {windows_version}");
        match catalog::resolve_version(&client, windows_version, page_id) {
            Ok(updates) => {
                per_version.insert(windows_version.to_string(), updates);
            }
            Err(err) => log::error!("failed to resolve {windows_version}: {err}"),
        }
    }

    let consolidated = catalog::consolidate(per_version)?;

    let output_path = args.out_path.join("updates.json");
    let file = File::create(&output_path).with_context(|| format!("failed to create {output_path:?}"))?;
    serde_json::to_writer_pretty(file, &consolidated)?;

    log::info!("wrote {output_path:?}");
    Ok(())
}
