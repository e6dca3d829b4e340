//! Component B: archive unpacker.
//!
//! Resolves a `(windowsVersion, kb)` pair to its Microsoft Update Catalog
//! entry, downloads the cumulative-update package, and extracts its nested
//! CAB tree down to the bare `.manifest` files, grounded on
//! `upd02_get_manifests_from_updates.py`.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context, Result};
use log::info;
use regex::Regex;
use reqwest::blocking::Client;

use crate::fetch::fetch_text;
use crate::retry_loop;

#[derive(Debug)]
pub enum Error {
    UnexpectedResultCount(usize),
    UpdateNotFound(String),
    OnclickUrlMismatchesDownloadButtons,
    NoDownloadUrl,
    CabextractFailed(String, std::process::ExitStatus),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::UnexpectedResultCount(n) => write!(f, "expected exactly one matching catalog entry, found {n}"),
            Error::UpdateNotFound(kb) => write!(f, "update {kb} not found in catalog"),
            Error::OnclickUrlMismatchesDownloadButtons => write!(f, "catalog search page's row count disagrees with its download-button count"),
            Error::NoDownloadUrl => write!(f, "catalog reported zero download URLs for this update"),
            Error::CabextractFailed(file, status) => write!(f, "cabextract of {file} exited with {status}"),
        }
    }
}

impl std::error::Error for Error {}

const CATALOG_SEARCH_URL: &str = "https://www.catalog.update.microsoft.com/Search.aspx";
const CATALOG_DOWNLOAD_DIALOG_URL: &str = "https://www.catalog.update.microsoft.com/DownloadDialog.aspx";

static ONCLICK_RE: &str = r#"<a [^>]*?onclick='goToDetails\("([a-f0-9\-]+)"\);'>\s*(.*?)\s*</a>"#;
static DOWNLOAD_BUTTON_RE: &str = r#"<input id="([a-f0-9\-]+)" class="flatBlueButtonDownload""#;
static DOWNLOAD_INFO_URL_RE: &str = r"downloadInformation\[\d+\]\.files\[\d+\]\.url = '([^']+)';";
static FILTER_OUT_RE: &str = r"(?i)\bserver\b|\bDynamic Cumulative Update\b";

/// One row of the catalog search results: an opaque update UID and its
/// display title.
#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub uid: String,
    pub title: String,
}

/// Searches the Update Catalog for `search_terms`, returning every matching
/// row. The catalog page embeds the UID twice (once in the row's onclick
/// handler, once on its Download button) — both counts must agree.
pub fn search_for_updates(client: &Client, search_terms: &str) -> Result<Vec<CatalogEntry>> {
    let html = retry_loop(
        || -> Result<String> {
            let resp = client.get(CATALOG_SEARCH_URL).query(&[("q", search_terms)]).send().context("catalog search request failed")?;
            let text = resp.text().context("failed to read catalog search body")?;
            if text.contains("The website has encountered a problem") {
                bail!("catalog search hit a transient server error page");
            }
            Ok(text)
        },
        20,
    )?;

    if !html.contains("(page 1 of 1)") {
        bail!("catalog search returned more than one page of results");
    }

    let onclick_re = Regex::new(ONCLICK_RE).unwrap();
    let button_re = Regex::new(DOWNLOAD_BUTTON_RE).unwrap();

    let entries: Vec<CatalogEntry> = onclick_re
        .captures_iter(&html)
        .map(|c| CatalogEntry {
            uid: c[1].to_string(),
            title: c[2].to_string(),
        })
        .collect();

    let button_uids: Vec<String> = button_re.captures_iter(&html).map(|c| c[1].to_string()).collect();

    if entries.iter().map(|e| &e.uid).ne(button_uids.iter()) {
        return Err(Error::OnclickUrlMismatchesDownloadButtons.into());
    }

    Ok(entries)
}

/// Resolves an update UID to its single direct download URL.
pub fn get_update_download_url(client: &Client, update_uid: &str) -> Result<String> {
    let payload = serde_json::json!([{ "uidInfo": update_uid, "updateID": update_uid }]);
    let body = serde_json::to_string(&payload)?;

    let html = client
        .post(CATALOG_DOWNLOAD_DIALOG_URL)
        .form(&[("updateIDs", body)])
        .send()
        .context("DownloadDialog.aspx request failed")?
        .text()
        .context("failed to read DownloadDialog.aspx body")?;

    let url_re = Regex::new(DOWNLOAD_INFO_URL_RE).unwrap();
    let matches: Vec<&str> = url_re.captures_iter(&html).map(|c| c.get(1).unwrap().as_str()).collect();

    match matches.len() {
        1 => Ok(matches[0].to_string()),
        n => Err(Error::UnexpectedResultCount(n).into()),
    }
}

/// Finds the single cumulative-update package for `(windows_version,
/// update_kb)` among the catalog's x64 search results, filtering out
/// server editions and preview/dynamic variants.
pub fn resolve_download_url(client: &Client, windows_version: &str, update_kb: &str) -> Result<String> {
    let search_terms = format!("{update_kb} {windows_version} x64");
    let mut entries = search_for_updates(client, &search_terms)?;

    let filter_re = Regex::new(FILTER_OUT_RE).unwrap();
    entries.retain(|e| !filter_re.is_match(&e.title));

    let entry = match entries.len() {
        1 => entries.into_iter().next().unwrap(),
        _ => return Err(Error::UpdateNotFound(update_kb.to_string()).into()),
    };

    let url = get_update_download_url(client, &entry.uid)?;
    if url.is_empty() {
        return Err(Error::NoDownloadUrl.into());
    }
    Ok(url)
}

/// Downloads the update package into `local_dir`, returning its path.
pub fn download_update(client: &Client, windows_version: &str, update_kb: &str, local_dir: &Path) -> Result<(String, PathBuf)> {
    std::fs::create_dir_all(local_dir).with_context(|| format!("failed to create {local_dir:?}"))?;

    let download_url = resolve_download_url(client, windows_version, update_kb)?;
    let filename = download_url.rsplit('/').next().unwrap_or("update.cab");
    let local_path = local_dir.join(filename);

    let result = crate::fetch::download_and_hash(client, &download_url.parse()?, &local_path, None)?;
    info!("[{update_kb}] downloaded {} bytes from {download_url}", std::fs::metadata(&result.path)?.len());

    Ok((download_url, local_path))
}

fn cab_extract(pattern: &str, from_file: &Path, to_dir: &Path) -> Result<()> {
    let status = Command::new("cabextract")
        .args(["-F", pattern, "-d"])
        .arg(to_dir)
        .arg(from_file)
        .status()
        .context("failed to spawn cabextract")?;

    if !status.success() {
        return Err(Error::CabextractFailed(from_file.display().to_string(), status).into());
    }
    Ok(())
}

fn glob_names(dir: &Path, suffix: &str) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("failed to read {dir:?}"))? {
        let path = entry?.path();
        if path.extension().map(|e| e.to_string_lossy().to_lowercase()) == Some(suffix.trim_start_matches('.').to_string()) {
            out.push(path);
        }
    }
    Ok(out)
}

/// Walks the nested CAB tree (update package → inner cabs → manifests),
/// up to 4 levels deep, per `extract_manifest_files`. `WSUSSCAN.cab` is an
/// index file, not a payload, and is skipped at every level.
pub fn extract_manifest_files(local_dir: &Path, local_path: &Path) -> Result<()> {
    let extract_dirs: Vec<PathBuf> = (1..=4).map(|i| local_dir.join(format!("extract{i}"))).collect();
    for dir in &extract_dirs {
        std::fs::create_dir_all(dir)?;
    }

    cab_extract("*.cab", local_path, &extract_dirs[0])?;

    let is_wsusscan = |p: &Path| p.file_name().map(|n| n.to_string_lossy().eq_ignore_ascii_case("WSUSSCAN.cab")).unwrap_or(false);

    for cab in glob_names(&extract_dirs[0], "cab")? {
        if is_wsusscan(&cab) {
            continue;
        }
        cab_extract("*.cab", &cab, &extract_dirs[1])?;
    }

    if glob_names(&extract_dirs[1], "cab")?.is_empty() {
        for cab in glob_names(&extract_dirs[0], "cab")? {
            if is_wsusscan(&cab) {
                continue;
            }
            cab_extract("*.manifest", &cab, local_dir)?;
        }
    } else {
        for cab in glob_names(&extract_dirs[1], "cab")? {
            cab_extract("*.manifest", &cab, local_dir)?;
            cab_extract("*.cab", &cab, &extract_dirs[2])?;
        }

        for cab in glob_names(&extract_dirs[2], "cab")? {
            cab_extract("*.manifest", &cab, local_dir)?;
            cab_extract("*.cab", &cab, &extract_dirs[3])?;
        }

        if !glob_names(&extract_dirs[3], "cab")?.is_empty() {
            bail!("CAB nesting exceeded the expected 4 levels under {local_dir:?}");
        }
    }

    for dir in &extract_dirs {
        std::fs::remove_dir_all(dir).with_context(|| format!("failed to remove {dir:?}"))?;
    }
    std::fs::remove_file(local_path).with_context(|| format!("failed to remove {local_path:?}"))?;

    Ok(())
}

/// Downloads and fully extracts one update's manifest files.
pub fn get_manifests_from_update(client: &Client, windows_version: &str, update_kb: &str, out_path: &Path) -> Result<()> {
    info!("[{update_kb}] downloading update");
    let local_dir = out_path.join("manifests").join(windows_version).join(update_kb);

    let (_download_url, local_path) = download_update(client, windows_version, update_kb, &local_dir)?;

    info!("[{update_kb}] extracting manifest files");
    extract_manifest_files(&local_dir, &local_path)?;
    info!("[{update_kb}] extracted manifest files");

    Ok(())
}

/// Retrieves a page body through the shared retrying fetcher, used by
/// callers that need to probe catalog-adjacent pages directly.
pub fn fetch_catalog_page(client: &Client, url: &str) -> Result<String> {
    fetch_text(client, url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_regex_excludes_server_and_dynamic_titles() {
        let re = Regex::new(FILTER_OUT_RE).unwrap();
        assert!(re.is_match("Cumulative Update for Windows Server 2022"));
        assert!(re.is_match("2024-01 Dynamic Cumulative Update for Windows 10"));
        assert!(!re.is_match("2024-01 Cumulative Update for Windows 10 Version 22H2 for x64-based Systems (KB5034123)"));
    }
}
