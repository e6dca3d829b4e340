//! Component D-adjacent: walks an already-extracted Windows installation
//! image folder and computes the per-file hash/PE metadata Winbindex
//! attaches to a "BASE" install. Grounded on
//! `examples/original_source/data/extract_data_from_iso_files.py` and
//! `extract_data_from_pe_files.py`, with the actual image extraction (7-Zip
//! on the WIM) and signature *checking* (`sigcheck.exe`) left external per
//! spec.md's Non-goals — the PE/signature metadata itself is computed
//! in-process with `winbindex_deltafmt::PeExtractor`, the same extractor
//! component C's manifest parser uses.

use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use winbindex_deltafmt::pe::PeExtractor;
use winbindex_hash::{Md5Digest, Sha1Digest, Sha256Digest};

use crate::model::{FileInfo, SigningStatus};

const EXCLUDED_PATH_PREFIXES: &[&str] = &[r"windows\winsxs\", r"windows\system32\catroot\", r"windows\syswow64\catroot\", r"windows\servicing\packages\"];

const PE_EXTENSIONS: &[&str] = &["exe", "dll", "sys", "winmd", "cpl", "ax", "node", "ocx", "efi", "acm", "scr", "tsp", "drv"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsoFileEntry {
    pub path: String,
    pub size: u64,
    pub md5: Md5Digest,
    pub sha1: Sha1Digest,
    pub sha256: Sha256Digest,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub machine_type: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub virtual_size: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Every signing time `PeExtractor` could recover, in the order found;
    /// `to_file_info` reports the first one, per §4.D.2.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub signing_times: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsoScanResult {
    pub windows_version: String,
    pub windows_iso_sha256: String,
    pub windows_release_date: String,
    pub files: Vec<IsoFileEntry>,
}

impl IsoFileEntry {
    pub fn to_file_info(&self) -> FileInfo {
        match (self.machine_type, self.timestamp, self.virtual_size) {
            (Some(machine_type), Some(timestamp), Some(virtual_size)) => FileInfo::VtOrFile {
                size: self.size,
                md5: self.md5.clone(),
                sha1: self.sha1.clone(),
                sha256: self.sha256.clone(),
                machine_type,
                timestamp,
                virtual_size: virtual_size as u64,
                signing_status: SigningStatus::Unknown,
                signature_type: None,
                signing_date: self.signing_times.first().cloned(),
                version: self.version.clone(),
                description: self.description.clone(),
            },
            _ => FileInfo::RawFile {
                size: self.size,
                md5: self.md5.clone(),
                sha1: self.sha1.clone(),
                sha256: self.sha256.clone(),
            },
        }
    }
}

/// Drops the leading numbered-WIM-index directory component (`extract_data_from_iso_files.py`'s
/// `path_filter_callback`) and excludes WinSxS/CatRoot/servicing paths. `None`
/// means "skip this file".
fn filter_relative_path(relative: &Path) -> Option<PathBuf> {
    let mut components = relative.components();
    let first = components.next()?;
    if !matches!(first, Component::Normal(name) if name.to_string_lossy().chars().all(|c| c.is_ascii_digit())) {
        return None;
    }

    let rest: PathBuf = components.collect();
    if rest.as_os_str().is_empty() {
        return None;
    }

    let rest_lower = rest.to_string_lossy().to_lowercase().replace('/', "\\");
    if EXCLUDED_PATH_PREFIXES.iter().any(|prefix| rest_lower.starts_with(prefix)) {
        return None;
    }

    Some(rest)
}

fn is_pe_candidate(filename: &str) -> bool {
    Path::new(filename).extension().and_then(|ext| ext.to_str()).map(|ext| PE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str())).unwrap_or(false)
}

fn scan_one_file(root: &Path, absolute: &Path, relative: &Path) -> Result<IsoFileEntry> {
    let data = std::fs::read(absolute).with_context(|| format!("failed to read {absolute:?}"))?;

    let md5 = Md5Digest::of(&data);
    let sha1 = Sha1Digest::of(&data);
    let sha256 = Sha256Digest::of(&data);

    let filename = relative.file_name().map(|n| n.to_string_lossy().to_lowercase()).unwrap_or_default();

    let (machine_type, timestamp, virtual_size, version, description, signing_times) = if is_pe_candidate(&filename) {
        match PeExtractor::parse_bytes(&data) {
            Ok(meta) => {
                let signing_times = meta.signing_times.into_iter().map(|s| s.signing_date).collect();
                (Some(meta.header.machine_type as u32), Some(meta.header.timestamp), Some(meta.header.virtual_size), meta.file_version, meta.file_description, signing_times)
            }
            Err(_) => (None, None, None, None, None, Vec::new()),
        }
    } else {
        (None, None, None, None, None, Vec::new())
    };

    let path_with_index = absolute.strip_prefix(root).unwrap_or(relative).to_string_lossy().replace('/', "\\");

    Ok(IsoFileEntry {
        path: path_with_index,
        size: data.len() as u64,
        md5,
        sha1,
        sha256,
        machine_type,
        timestamp,
        virtual_size,
        version,
        description,
        signing_times,
    })
}

/// Walks `root` (the folder an install image's numbered-index
/// subdirectories were extracted into) and builds the per-file result list,
/// plus the `(filename, sha256)` pairs worth tagging `'file'` in
/// `info_sources.json`.
pub fn scan_folder(root: &Path, windows_version: &str, windows_iso_sha256: &str, windows_release_date: &str) -> Result<IsoScanResult> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir).with_context(|| format!("failed to read directory {dir:?}"))? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
                continue;
            }

            let relative = path.strip_prefix(root).unwrap_or(&path);
            let Some(filtered) = filter_relative_path(relative) else {
                continue;
            };

            files.push(scan_one_file(root, &path, &filtered)?);
        }
    }

    files.sort_by(|a, b| a.path.cmp(&b.path));

    Ok(IsoScanResult {
        windows_version: windows_version.to_string(),
        windows_iso_sha256: windows_iso_sha256.to_lowercase(),
        windows_release_date: windows_release_date.to_string(),
        files,
    })
}

/// The `(filename, sha256)` pairs of every successfully PE-parsed file in
/// `result`, for tagging `info_sources.json` entries as `'file'`.
pub fn pe_file_hashes(result: &IsoScanResult) -> Vec<(String, Sha256Digest)> {
    result
        .files
        .iter()
        .filter(|f| f.machine_type.is_some())
        .filter_map(|f| {
            let name = f.path.rsplit(['\\', '/']).next()?.to_lowercase();
            Some((name, f.sha256.clone()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters_out_winsxs_and_catroot() {
        assert!(filter_relative_path(Path::new("1/Windows/WinSxS/foo.dll")).is_none());
        assert!(filter_relative_path(Path::new("1/Windows/System32/CatRoot/bar.cat")).is_none());
        assert_eq!(filter_relative_path(Path::new("1/Windows/System32/kernel32.dll")), Some(PathBuf::from("Windows/System32/kernel32.dll")));
    }

    #[test]
    fn rejects_path_without_numbered_prefix() {
        assert!(filter_relative_path(Path::new("Windows/System32/kernel32.dll")).is_none());
    }

    #[test]
    fn recognizes_pe_extensions_case_insensitively() {
        assert!(is_pe_candidate("Foo.DLL"));
        assert!(is_pe_candidate("bar.sys"));
        assert!(!is_pe_candidate("readme.txt"));
    }
}
