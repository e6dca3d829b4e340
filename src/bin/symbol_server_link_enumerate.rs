//! Component E entry point: resolve `virtualSize` for every `delta`-tier
//! file by probing the Microsoft symbol server, promoting matches to
//! `delta+`.

use std::path::PathBuf;

use anyhow::Result;
use argh::FromArgs;
use reqwest::blocking::Client;

use winbindex_rs::model::FileInfo;
use winbindex_rs::{grouped, progress, symbol_server};

#[derive(FromArgs, Debug)]
/// Probe the Microsoft symbol server to fill in virtualSize for delta-tier
/// files.
struct Args {
    /// output directory (defaults to `out`)
    #[argh(option, short = 'o', default = "PathBuf::from(\"out\")")]
    out_path: PathBuf,

    /// stop after this many seconds and save progress for next time
    #[argh(option)]
    time_budget_secs: Option<u64>,
}

fn promote_to_delta_plus(info: FileInfo, virtual_size: u64) -> FileInfo {
    match info {
        FileInfo::Delta {
            size,
            hash,
            machine_type,
            timestamp,
            last_section_virtual_address,
            last_section_pointer_to_raw_data,
        } => FileInfo::DeltaPlus {
            size,
            hash,
            machine_type,
            timestamp,
            last_section_virtual_address,
            last_section_pointer_to_raw_data,
            virtual_size,
        },
        other => other,
    }
}

fn process_one_file(client: &Client, filename: &str, doc_path: &std::path::Path, info_sources: &mut progress::InfoSources) -> Result<usize> {
    let mut doc = grouped::read_grouped_doc(doc_path)?;
    let mut promoted = 0;

    let delta_hashes: Vec<String> = doc
        .iter()
        .filter(|(_, entry)| matches!(entry.file_info, Some(FileInfo::Delta { .. })))
        .map(|(hash, _)| hash.clone())
        .collect();

    for hash in delta_hashes {
        let entry = doc.get(&hash).unwrap();
        let Some(FileInfo::Delta {
            size,
            timestamp,
            last_section_virtual_address,
            last_section_pointer_to_raw_data,
            ..
        }) = entry.file_info
        else {
            continue;
        };

        match symbol_server::resolve_virtual_size(client, filename, timestamp, size, last_section_virtual_address, last_section_pointer_to_raw_data) {
            Ok(Some(virtual_size)) => {
                let info = doc.get_mut(&hash).unwrap().file_info.take().unwrap();
                doc.get_mut(&hash).unwrap().file_info = Some(promote_to_delta_plus(info, virtual_size));
                if let Some(tier) = info_sources.entry(filename.to_string()).or_default().get_mut(&hash) {
                    *tier = "delta+".to_string();
                }
                promoted += 1;
            }
            Ok(None) => {}
            Err(err) => log::error!("[{filename}:{hash}] symbol server probe failed: {err}"),
        }
    }

    if promoted > 0 {
        grouped::write_grouped_doc(doc_path, &doc, 6)?;
    }

    Ok(promoted)
}

fn main() -> Result<()> {
    env_logger::init();

    let args: Args = argh::from_env();
    let client = Client::new();

    let deadline = match args.time_budget_secs {
        Some(secs) => progress::Deadline::after(std::time::Duration::from_secs(secs)),
        None => progress::Deadline::none(),
    };

    let filenames_path = args.out_path.join("filenames.json");
    let filenames: Vec<String> = if filenames_path.exists() {
        serde_json::from_reader(std::fs::File::open(&filenames_path)?)?
    } else {
        Vec::new()
    };

    let mut info_sources = progress::load_info_sources(&args.out_path)?;

    let mut total_promoted = 0;
    for filename in &filenames {
        if deadline.has_passed() {
            log::info!("time budget reached, stopping before {filename}");
            break;
        }

        let doc_path = grouped::by_filename_path(&args.out_path, filename);
        total_promoted += process_one_file(&client, filename, &doc_path, &mut info_sources)?;
    }

    progress::save_info_sources(&args.out_path, &info_sources)?;
    log::info!("promoted {total_promoted} files to delta+");
    Ok(())
}
