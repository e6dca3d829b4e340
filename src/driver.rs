//! Component H (part 2): stage orchestration.
//!
//! Walks `<out_path>/updates.json` in order, running the archive unpack →
//! manifest parse → grouped-index merge pipeline (components B, C, G) for
//! each `(windowsVersion, updateKb)` pair that hasn't been processed yet,
//! stopping cooperatively at the supplied deadline. Grounded on
//! `upd05_group_by_filename.py::process_updates`/`group_update_by_filename`.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use log::{error, info};
use reqwest::blocking::Client;

use crate::config::Config;
use crate::model::{GroupedFilenameDoc, Update};
use crate::progress::Deadline;
use crate::{archive, grouped, iso, manifest, progress, virustotal};

/// Reads `<out_path>/updates.json`, the catalog's consolidated output.
pub fn load_updates(out_path: &Path) -> Result<BTreeMap<String, BTreeMap<String, Update>>> {
    let path = out_path.join("updates.json");
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let file = File::open(&path).with_context(|| format!("failed to open {path:?}"))?;
    serde_json::from_reader(file).with_context(|| format!("failed to parse {path:?}"))
}

/// Downloads and extracts manifests for every update not yet present on
/// disk under `<out_path>/manifests/<version>/<kb>/`.
pub fn run_fetch_manifests_stage(client: &Client, config: &Config, out_path: &Path) -> Result<()> {
    let updates = load_updates(out_path)?;

    for (windows_version, kbs) in &updates {
        if config.updates_unsupported.contains(windows_version) {
            continue;
        }
        info!("processing Windows version {windows_version}");

        for update_kb in kbs.keys() {
            let manifests_dir = out_path.join("manifests").join(windows_version).join(update_kb);
            if manifests_dir.exists() {
                continue;
            }

            match archive::get_manifests_from_update(client, windows_version, update_kb, out_path) {
                Ok(()) => info!("[{update_kb}] done"),
                Err(err) => {
                    error!("[{update_kb}] failed to process update: {err:#}");
                    if config.exit_on_first_error {
                        return Err(err);
                    }
                }
            }
        }
    }

    Ok(())
}

/// Parses every update's manifests into `<out_path>/parsed/<version>/<kb>/`.
pub fn run_parse_manifests_stage(config: &Config, out_path: &Path) -> Result<()> {
    let updates = load_updates(out_path)?;

    for (windows_version, kbs) in &updates {
        info!("processing Windows version {windows_version}");

        for update_kb in kbs.keys() {
            let manifests_dir = out_path.join("manifests").join(windows_version).join(update_kb);
            if !manifests_dir.is_dir() {
                continue;
            }

            let output_dir = out_path.join("parsed").join(windows_version).join(update_kb);
            match manifest::parse_manifests(&manifests_dir, &output_dir) {
                Ok(()) => info!("  {update_kb}"),
                Err(err) => {
                    error!("failed to process {manifests_dir:?}: {err}");
                    if config.exit_on_first_error {
                        return Err(err.into());
                    }
                }
            }
        }
    }

    Ok(())
}

/// Reads a cached VirusTotal file-report JSON for `file_hash`, if one has
/// been fetched, and extracts its `FileInfo` per `get_virustotal_info`.
/// `out_path/virustotal/<sha256>.json` and `out_path/virustotal_sha1/<sha1>.json`
/// are the two cache directories the external fetcher populates.
pub fn lookup_virustotal_info(out_path: &Path, config: &Config, file_hash: &str) -> Result<Option<crate::model::FileInfo>> {
    let source_dir = match file_hash.len() {
        64 => "virustotal",
        40 => "virustotal_sha1",
        _ => return Ok(None),
    };

    let path = out_path.join(source_dir).join(format!("{file_hash}.json"));
    if !path.exists() {
        return Ok(None);
    }

    let file = File::open(&path).with_context(|| format!("failed to open {path:?}"))?;
    let response: serde_json::Value = serde_json::from_reader(file).with_context(|| format!("failed to parse {path:?}"))?;

    let info = virustotal::file_info_from_response(config, file_hash, &response).with_context(|| format!("failed to extract VirusTotal info for {file_hash}"))?;
    Ok(Some(info))
}

/// One `<file>` entry extracted from a parsed assembly JSON, the unit
/// `group_update_by_filename` feeds to the grouped-index merge.
struct ParsedFileEntry {
    filename: String,
    file_hash: String,
    digest_algorithm: crate::model::DigestAlgorithm,
    manifest_name: String,
    assembly_identity: serde_json::Map<String, serde_json::Value>,
    attributes: serde_json::Map<String, serde_json::Value>,
    delta_or_pe_file_info: Option<crate::model::FileInfo>,
}

fn extract_parsed_entries(assembly_path: &Path) -> Result<Vec<ParsedFileEntry>> {
    let file = File::open(assembly_path).with_context(|| format!("failed to open {assembly_path:?}"))?;
    let record: crate::model::AssemblyRecord = serde_json::from_reader(file).with_context(|| format!("failed to parse {assembly_path:?}"))?;

    let manifest_name = assembly_path.file_stem().map(|s| s.to_string_lossy().to_string()).unwrap_or_default();

    let mut out = Vec::new();
    for file_record in record.files {
        let name = file_record.attributes.get("name").and_then(|v| v.as_str()).unwrap_or_default();
        let filename = name.rsplit('\\').next().unwrap_or(name).to_lowercase();

        out.push(ParsedFileEntry {
            filename,
            file_hash: file_record.digest.clone(),
            digest_algorithm: file_record.digest_algorithm,
            manifest_name: manifest_name.clone(),
            assembly_identity: record.assembly_identity.clone(),
            attributes: file_record.attributes,
            delta_or_pe_file_info: file_record.info,
        });
    }

    Ok(out)
}

/// Groups one update's parsed assemblies into the by-filename grouped
/// index, merging into any existing `<filename>.json.gz` on disk.
pub fn group_update_by_filename(out_path: &Path, windows_version: &str, update_kb: &str, update: &Update, parsed_dir: &Path, config: &Config, deadline: Deadline) -> Result<()> {
    let output_dir = out_path.join("by_filename_compressed");
    std::fs::create_dir_all(&output_dir)?;

    let mut by_filename: BTreeMap<String, Vec<ParsedFileEntry>> = BTreeMap::new();
    for entry in std::fs::read_dir(parsed_dir).with_context(|| format!("failed to read {parsed_dir:?}"))? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        for parsed in extract_parsed_entries(&path)? {
            by_filename.entry(parsed.filename.clone()).or_default().push(parsed);
        }
    }

    let update_info = serde_json::to_value(update)?;

    for (filename, entries) in by_filename {
        if deadline.has_passed() {
            info!("deadline reached, stopping before {filename}");
            break;
        }

        let doc_path = grouped::by_filename_path(out_path, &filename);
        let mut doc: GroupedFilenameDoc = grouped::read_grouped_doc(&doc_path)?;

        for entry in entries {
            if config.file_hashes_non_pe.contains(&entry.file_hash) {
                continue;
            }

            let mut file_hash = entry.file_hash.clone();
            let mut hash_is_sha256 = entry.digest_algorithm == crate::model::DigestAlgorithm::Sha256;

            let virustotal_file_info = lookup_virustotal_info(out_path, config, &file_hash)?;
            if let Some(crate::model::FileInfo::VtOrFile { sha256, .. }) = &virustotal_file_info {
                let vt_sha256 = sha256.to_string();
                if vt_sha256 != file_hash {
                    file_hash = vt_sha256;
                    hash_is_sha256 = true;
                }
            }

            if !hash_is_sha256 {
                if config.allow_missing_sha256_hash {
                    log::warn!("no SHA-256 hash for {filename} ({file_hash}) in {}", entry.manifest_name);
                    continue;
                }
                anyhow::bail!("no SHA-256 hash for {filename} ({file_hash}) in {}", entry.manifest_name);
            }

            grouped::add_file_info_from_update(
                &mut doc,
                grouped::UpdateContribution {
                    file_hash: &file_hash,
                    filename: &filename,
                    virustotal_file_info,
                    windows_version,
                    update_kb,
                    update_info: update_info.clone(),
                    manifest_name: &entry.manifest_name,
                    assembly_identity: entry.assembly_identity,
                    attributes: entry.attributes,
                    delta_or_pe_file_info: entry.delta_or_pe_file_info,
                },
                config,
            )?;
        }

        grouped::write_grouped_doc(&doc_path, &doc, config.compression_level)?;
    }

    Ok(())
}

/// Top-level driver for component G: walks every update with a `parsed/`
/// directory present, grouping it into the by-filename index, persisting
/// `progress.json` as it goes and stopping at `deadline`.
pub fn process_updates(out_path: &Path, config: &Config, deadline: Deadline) -> Result<()> {
    let updates = load_updates(out_path)?;
    let mut state = progress::load(out_path)?;

    'outer: for (windows_version, kbs) in &updates {
        info!("processing Windows version {windows_version}:");

        for (update_kb, update) in kbs {
            let parsed_dir = out_path.join("parsed").join(windows_version).join(update_kb);
            if !parsed_dir.is_dir() {
                continue;
            }

            if deadline.has_passed() {
                break 'outer;
            }

            group_update_by_filename(out_path, windows_version, update_kb, update, &parsed_dir, config, deadline)?;
            state.files_processed.push(update_kb.clone());
            info!("  {update_kb}");
        }
    }

    progress::save(out_path, &state)?;
    Ok(())
}

/// `info_progress_virustotal.json`'s `pending` map: filename → sha256 set,
/// the files queued for a VirusTotal re-merge once their fetch completes.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
struct VirusTotalProgress {
    #[serde(default)]
    pending: BTreeMap<String, Vec<String>>,
}

/// Re-merges any VirusTotal responses fetched since the last run into their
/// already-grouped documents, per `process_virustotal_data`.
pub fn process_virustotal_data(out_path: &Path, config: &Config) -> Result<()> {
    let pending: VirusTotalProgress = progress::load_named(out_path, "virustotal")?;

    for (filename, hashes) in &pending.pending {
        let doc_path = grouped::by_filename_path(out_path, filename);
        let mut doc = grouped::read_grouped_doc(&doc_path)?;
        let mut touched = false;

        for file_hash in hashes {
            let Some(info) = lookup_virustotal_info(out_path, config, file_hash)? else {
                anyhow::bail!("no VirusTotal response cached for {file_hash} despite being marked pending");
            };
            grouped::add_file_info_from_virustotal(&mut doc, file_hash, info, filename)?;
            touched = true;
        }

        if touched {
            grouped::write_grouped_doc(&doc_path, &doc, config.compression_level)?;
        }
    }

    progress::save_named(out_path, "virustotal", &VirusTotalProgress::default())?;
    Ok(())
}

/// Folds every `<out_path>/from_iso/<version>.json` scan result into the
/// grouped index and tags its PE files `'file'` in `info_sources.json`, per
/// `process_iso_files`/`group_iso_data_by_filename`.
pub fn process_iso_files(out_path: &Path, config: &Config) -> Result<()> {
    let from_iso_dir = out_path.join("from_iso");
    if !from_iso_dir.is_dir() {
        return Ok(());
    }

    let mut info_sources = progress::load_info_sources(out_path)?;

    for entry in std::fs::read_dir(&from_iso_dir).with_context(|| format!("failed to read {from_iso_dir:?}"))? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }

        info!("  {}", path.file_stem().map(|s| s.to_string_lossy().to_string()).unwrap_or_default());

        let file = File::open(&path).with_context(|| format!("failed to open {path:?}"))?;
        let scan: iso::IsoScanResult = serde_json::from_reader(file).with_context(|| format!("failed to parse {path:?}"))?;

        let windows_version_info = serde_json::json!({
            "releaseDate": scan.windows_release_date,
            "isoSha256": scan.windows_iso_sha256,
        });

        for file_entry in &scan.files {
            let filename = file_entry.path.rsplit(['\\', '/']).next().unwrap_or(&file_entry.path).to_lowercase();
            let file_hash = file_entry.sha256.to_string();

            let doc_path = grouped::by_filename_path(out_path, &filename);
            let mut doc = grouped::read_grouped_doc(&doc_path)?;
            grouped::add_file_info_from_iso(&mut doc, &file_hash, file_entry.to_file_info(), &file_entry.path, &scan.windows_version, windows_version_info.clone())?;
            grouped::write_grouped_doc(&doc_path, &doc, config.compression_level)?;
        }

        for (name, sha256) in iso::pe_file_hashes(&scan) {
            info_sources.entry(name).or_default().insert(sha256.to_string(), "file".to_string());
        }
    }

    progress::save_info_sources(out_path, &info_sources)?;
    Ok(())
}

/// Top-level `upd05` entry point: updates → VirusTotal → ISO, then rebuilds
/// `filenames.json`, per `upd05_group_by_filename.py::main`.
pub fn run_group_by_filename_stage(out_path: &Path, config: &Config, deadline: Deadline) -> Result<()> {
    info!("Processing data from updates");
    process_updates(out_path, config, deadline)?;

    info!("Processing data from VirusTotal");
    process_virustotal_data(out_path, config)?;

    info!("Processing data from ISO files");
    process_iso_files(out_path, config)?;

    grouped::rebuild_filenames_index(out_path)?;
    Ok(())
}
