//! Component G: grouped-index writer.
//!
//! Owns the on-disk `by_filename_compressed/<filename>.json.gz` documents
//! and the top-level `filenames.json` index. Grounded on
//! `upd05_group_by_filename.py`'s `write_to_gzip_file` /
//! `add_file_info_from_update` / `add_file_info_from_iso_data` /
//! `write_all_file_info`.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use flate2::read::GzDecoder;
use flate2::{Compression, GzBuilder};
use serde_json::{Map, Value};

use crate::config::Config;
use crate::merge::{merge_file_info, InfoSource};
use crate::model::{FileInfo, GroupedFilenameDoc};

pub fn by_filename_path(out_path: &Path, filename: &str) -> PathBuf {
    out_path.join("by_filename_compressed").join(format!("{filename}.json.gz"))
}

/// Reads a `<filename>.json.gz` document, returning an empty one if it
/// does not exist yet — the write-once/append-only contract means a
/// missing document is a legitimate "nothing observed yet" state, not an
/// error.
pub fn read_grouped_doc(path: &Path) -> Result<GroupedFilenameDoc> {
    if !path.exists() {
        return Ok(GroupedFilenameDoc::new());
    }

    let file = File::open(path).with_context(|| format!("failed to open {path:?}"))?;
    let mut decoder = GzDecoder::new(file);
    let mut buf = Vec::new();
    decoder.read_to_end(&mut buf).with_context(|| format!("failed to decompress {path:?}"))?;
    serde_json::from_slice(&buf).with_context(|| format!("failed to parse {path:?}"))
}

/// Writes `doc` as a deterministic gzip stream: fixed compression level,
/// zeroed mtime, no embedded filename — two runs over identical input
/// produce byte-identical output, per §4.G.
pub fn write_grouped_doc(path: &Path, doc: &GroupedFilenameDoc, compression_level: u32) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("failed to create {parent:?}"))?;
    }

    let body = serde_json::to_vec(doc).context("failed to serialize grouped document")?;

    let file = File::create(path).with_context(|| format!("failed to create {path:?}"))?;
    let mut encoder = GzBuilder::new().mtime(0).write(file, Compression::new(compression_level));
    encoder.write_all(&body).with_context(|| format!("failed to write {path:?}"))?;
    encoder.finish().with_context(|| format!("failed to finalize {path:?}"))?;

    Ok(())
}

/// One manifest `<file>` entry's contribution to the grouped document,
/// matching the positional arguments `add_file_info_from_update` takes.
pub struct UpdateContribution<'a> {
    pub file_hash: &'a str,
    pub filename: &'a str,
    pub virustotal_file_info: Option<crate::model::FileInfo>,
    pub windows_version: &'a str,
    pub update_kb: &'a str,
    pub update_info: Value,
    pub manifest_name: &'a str,
    pub assembly_identity: Map<String, Value>,
    pub attributes: Map<String, Value>,
    pub delta_or_pe_file_info: Option<crate::model::FileInfo>,
}

/// The md5 a `FileInfo` carries, for allowlist lookups — `Delta`/`DeltaPlus`
/// only have one if their descriptor hash happened to be md5-keyed.
fn file_info_md5_hex(info: &FileInfo) -> Option<String> {
    match info {
        FileInfo::Raw {
            md5, ..
        } => md5.as_ref().map(|m| m.to_string()),
        FileInfo::RawFile {
            md5, ..
        }
        | FileInfo::Pe {
            md5, ..
        }
        | FileInfo::VtOrFile {
            md5, ..
        } => Some(md5.to_string()),
        FileInfo::Delta {
            hash, ..
        }
        | FileInfo::DeltaPlus {
            hash, ..
        } => match hash {
            crate::model::DeltaHash::Md5(m) => Some(m.to_string()),
            crate::model::DeltaHash::Sha256(_) => None,
        },
    }
}

/// Adds one update-sourced observation of a file to `doc`, merging its
/// `fileInfo` and appending its assembly/attribute provenance. Re-adding
/// the same `(windowsVersion, updateKb, manifestName)` triple with
/// identical `updateInfo`/`assemblyIdentity` is a no-op; disagreement on
/// either is a hard error (append-only invariant) unless `(sha256, md5)`
/// is allow-listed for this Windows version (§4.F.2/§7), in which case the
/// conflicting observation is dropped with a warning instead.
pub fn add_file_info_from_update(doc: &mut GroupedFilenameDoc, contribution: UpdateContribution<'_>, config: &Config) -> Result<()> {
    let entry = doc.entry(contribution.file_hash.to_string()).or_default();

    let existing = entry.file_info.clone();
    let merged = match merge_file_info(entry.file_info.take(), contribution.delta_or_pe_file_info.clone(), InfoSource::Update, contribution.filename) {
        Ok(merged) => merged,
        Err(err) => {
            let allowed = contribution
                .delta_or_pe_file_info
                .as_ref()
                .and_then(file_info_md5_hex)
                .map(|md5| config.is_hash_mismatch_allowed(contribution.file_hash, &md5, contribution.windows_version))
                .unwrap_or(false);

            if !allowed {
                return Err(err);
            }
            log::warn!("skipping mismatched fileInfo for {} in {} {}: {err:#}", contribution.file_hash, contribution.windows_version, contribution.update_kb);
            existing
        }
    };
    let merged = merge_file_info(merged, contribution.virustotal_file_info, InfoSource::VirusTotal, contribution.filename)?;
    entry.file_info = merged;

    let version_map = entry.windows_versions.entry(contribution.windows_version.to_string()).or_default();
    let version_entry = version_map.entry(contribution.update_kb.to_string()).or_default();

    match &version_entry.update_info {
        None => version_entry.update_info = Some(contribution.update_info),
        Some(existing) if *existing == contribution.update_info => {}
        Some(_) => bail!("updateInfo for {} {} {} disagrees with a previously recorded value", contribution.windows_version, contribution.update_kb, contribution.manifest_name),
    }

    let assembly_entry = version_entry.assemblies.entry(contribution.manifest_name.to_string()).or_insert_with(|| Value::Object(Map::new()));
    let assembly_obj = assembly_entry.as_object_mut().expect("assembly entry is always an object");

    let identity_value = Value::Object(contribution.assembly_identity);
    match assembly_obj.get("assemblyIdentity") {
        None => {
            assembly_obj.insert("assemblyIdentity".to_string(), identity_value);
        }
        Some(existing) if *existing == identity_value => {}
        Some(_) => bail!("assemblyIdentity for {} disagrees with a previously recorded value", contribution.manifest_name),
    }

    let attributes_list = assembly_obj.entry("attributes").or_insert_with(|| Value::Array(Vec::new())).as_array_mut().expect("attributes entry is always an array");

    let attributes_value = Value::Object(contribution.attributes);
    if !attributes_list.contains(&attributes_value) {
        attributes_list.push(attributes_value);
    }

    Ok(())
}

/// Adds an ISO-sourced observation, per `add_file_info_from_iso_data`: ISO
/// data attaches under the synthetic `"BASE"` pseudo-update rather than a
/// real KB.
pub fn add_file_info_from_iso(
    doc: &mut GroupedFilenameDoc,
    file_hash: &str,
    file_info: crate::model::FileInfo,
    source_path: &str,
    windows_version: &str,
    windows_version_info: Value,
) -> Result<()> {
    let entry = doc.entry(file_hash.to_string()).or_default();
    entry.file_info = merge_file_info(entry.file_info.take(), Some(file_info), InfoSource::Iso, source_path)?;

    let version_map = entry.windows_versions.entry(windows_version.to_string()).or_default();
    let version_entry = version_map.entry("BASE".to_string()).or_default();

    match &version_entry.windows_version_info {
        None => version_entry.windows_version_info = Some(windows_version_info),
        Some(existing) if *existing == windows_version_info => {}
        Some(_) => bail!("windowsVersionInfo for {windows_version} disagrees with a previously recorded value"),
    }

    let path = source_path.to_string();
    if let Err(pos) = version_entry.source_paths.binary_search(&path) {
        version_entry.source_paths.insert(pos, path);
    }

    Ok(())
}

/// Merges a later VirusTotal-sourced `fileInfo` into an already-present
/// record, per `add_file_info_from_virustotal_data`. The hash must already
/// be present — VirusTotal enrichment never originates a new record.
pub fn add_file_info_from_virustotal(doc: &mut GroupedFilenameDoc, file_hash: &str, file_info: crate::model::FileInfo, filename: &str) -> Result<()> {
    let entry = doc.get_mut(file_hash).with_context(|| format!("no existing record for hash {file_hash} to enrich with VirusTotal data"))?;
    entry.file_info = merge_file_info(entry.file_info.take(), Some(file_info), InfoSource::VirusTotal, filename)?;
    Ok(())
}

/// Rebuilds the top-level `filenames.json` index from whatever
/// `.json.gz` files actually exist on disk, without requiring every
/// grouped document to be held in memory at once — the incremental,
/// write-as-you-go counterpart to [`write_all`], per `write_all_file_info`.
pub fn rebuild_filenames_index(out_path: &Path) -> Result<()> {
    let output_dir = out_path.join("by_filename_compressed");
    std::fs::create_dir_all(&output_dir)?;

    let mut all_filenames: Vec<String> = std::fs::read_dir(&output_dir)?
        .filter_map(|e| e.ok())
        .filter_map(|e| e.path().file_name().map(|n| n.to_string_lossy().to_string()))
        .filter_map(|n| n.strip_suffix(".json.gz").map(str::to_string))
        .collect();
    all_filenames.sort();

    let index_path = out_path.join("filenames.json");
    let file = File::create(&index_path).with_context(|| format!("failed to create {index_path:?}"))?;
    serde_json::to_writer(file, &all_filenames)?;

    Ok(())
}

/// Writes every grouped document under `out_path/by_filename_compressed/`
/// and rebuilds the top-level `filenames.json` index from whatever `.json.gz`
/// files actually exist on disk, per `write_all_file_info`.
pub fn write_all(out_path: &Path, docs: &BTreeMap<String, GroupedFilenameDoc>, compression_level: u32) -> Result<()> {
    let output_dir = out_path.join("by_filename_compressed");
    std::fs::create_dir_all(&output_dir)?;

    for (filename, doc) in docs {
        write_grouped_doc(&by_filename_path(out_path, filename), doc, compression_level)?;
    }

    let mut all_filenames: Vec<String> = std::fs::read_dir(&output_dir)?
        .filter_map(|e| e.ok())
        .filter_map(|e| e.path().file_name().map(|n| n.to_string_lossy().to_string()))
        .filter_map(|n| n.strip_suffix(".json.gz").map(str::to_string))
        .collect();
    all_filenames.sort();

    let index_path = out_path.join("filenames.json");
    let file = File::create(&index_path).with_context(|| format!("failed to create {index_path:?}"))?;
    serde_json::to_writer(file, &all_filenames)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use winbindex_hash::{Md5Digest, Sha1Digest, Sha256Digest};

    fn sample_file_info() -> crate::model::FileInfo {
        crate::model::FileInfo::VtOrFile {
            size: 100,
            md5: Md5Digest::of(b"a"),
            sha1: Sha1Digest::of(b"a"),
            sha256: Sha256Digest::of(b"a"),
            machine_type: 34404,
            timestamp: 1,
            virtual_size: 0x1000,
            signing_status: crate::model::SigningStatus::Signed,
            signature_type: None,
            signing_date: None,
            version: None,
            description: None,
        }
    }

    #[test]
    fn add_from_update_then_roundtrip_gzip() {
        let dir = tempfile::tempdir().unwrap();
        let mut doc = GroupedFilenameDoc::new();

        add_file_info_from_update(
            &mut doc,
            UpdateContribution {
                file_hash: "aa",
                filename: "foo.dll",
                virustotal_file_info: None,
                windows_version: "22H2",
                update_kb: "KB5000001",
                update_info: Value::String("info".to_string()),
                manifest_name: "m1",
                assembly_identity: Map::new(),
                attributes: Map::new(),
                delta_or_pe_file_info: Some(sample_file_info()),
            },
            &crate::config::Config::default(),
        )
        .unwrap();

        let path = dir.path().join("foo.dll.json.gz");
        write_grouped_doc(&path, &doc, 6).unwrap();

        let read_back = read_grouped_doc(&path).unwrap();
        assert_eq!(read_back.len(), 1);
        assert!(read_back.contains_key("aa"));
    }

    #[test]
    fn reading_missing_doc_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let doc = read_grouped_doc(&dir.path().join("missing.json.gz")).unwrap();
        assert!(doc.is_empty());
    }
}
