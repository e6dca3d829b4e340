//! Component H's single-update deploy cycle. Grounded on
//! `examples/original_source/data/deploy.py`'s `prepare_updates`/`run_deploy`.
//! The git commit/push/pull-request plumbing in the original is the
//! "git-based publish step" spec.md's §1 Non-goals name explicitly and is
//! not reimplemented here; this module stops at producing the updated
//! on-disk state a publish step would commit.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use log::info;
use reqwest::blocking::Client;

use crate::config::Config;
use crate::model::Update;
use crate::progress::Deadline;
use crate::{catalog, driver};

fn read_updates_json(path: &Path) -> Result<BTreeMap<String, BTreeMap<String, Update>>> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let file = File::open(path).with_context(|| format!("failed to open {path:?}"))?;
    serde_json::from_reader(file).with_context(|| format!("failed to parse {path:?}"))
}

fn write_updates_json(path: &Path, updates: &BTreeMap<String, BTreeMap<String, Update>>) -> Result<()> {
    let file = File::create(path).with_context(|| format!("failed to create {path:?}"))?;
    serde_json::to_writer_pretty(file, updates).with_context(|| format!("failed to write {path:?}"))
}

fn all_kbs(updates: &BTreeMap<String, BTreeMap<String, Update>>) -> std::collections::BTreeSet<String> {
    updates.values().flat_map(|kbs| kbs.keys().cloned()).collect()
}

fn filter_updates(updates: &BTreeMap<String, BTreeMap<String, Update>>, kbs: &std::collections::BTreeSet<String>) -> BTreeMap<String, BTreeMap<String, Update>> {
    let mut filtered = BTreeMap::new();
    for (windows_version, version_updates) in updates {
        let kept: BTreeMap<String, Update> = version_updates.iter().filter(|(kb, _)| kbs.contains(*kb)).map(|(kb, update)| (kb.clone(), update.clone())).collect();
        if !kept.is_empty() {
            filtered.insert(windows_version.clone(), kept);
        }
    }
    filtered
}

/// The result of [`prepare_updates`]: the single new update to ingest this
/// cycle, plus the full set of updates `updates.json` should hold once it's
/// done (the previously-known ones plus this one).
pub struct PreparedUpdate {
    pub single_update: BTreeMap<String, BTreeMap<String, Update>>,
    pub final_updates: BTreeMap<String, BTreeMap<String, Update>>,
}

/// Re-resolves the catalog and picks the lexically-first KB not already
/// present in the stored `updates.json`, per `prepare_updates`. Returns
/// `None` if the catalog has no new updates since last time.
pub fn prepare_updates(client: &Client, out_path: &Path) -> Result<Option<PreparedUpdate>> {
    let updates_path = out_path.join("updates.json");
    let last_time_updates = read_updates_json(&updates_path)?;
    let last_time_kbs = all_kbs(&last_time_updates);

    let mut per_version = BTreeMap::new();
    for (windows_version, page_id) in catalog::windows_versions() {
        let resolved = catalog::resolve_version(client, windows_version, page_id)?;
        per_version.insert(windows_version.to_string(), resolved);
    }
    let up_to_date_updates = catalog::consolidate(per_version)?;
    let up_to_date_kbs = all_kbs(&up_to_date_updates);

    if last_time_kbs == up_to_date_kbs {
        info!("no new updates");
        return Ok(None);
    }

    let removed: Vec<_> = last_time_kbs.difference(&up_to_date_kbs).collect();
    anyhow::ensure!(removed.is_empty(), "catalog lost previously-known updates: {removed:?}");

    let new_kbs: Vec<String> = up_to_date_kbs.difference(&last_time_kbs).cloned().collect();
    anyhow::ensure!(!new_kbs.is_empty(), "catalog comparison found no new KBs despite differing");

    let update_kb = new_kbs.into_iter().min().expect("non-empty checked above");
    info!("updating {update_kb}");

    let single_update = filter_updates(&up_to_date_updates, &[update_kb.clone()].into_iter().collect());

    let mut final_kbs = last_time_kbs;
    final_kbs.insert(update_kb);
    let final_updates = filter_updates(&up_to_date_updates, &final_kbs);

    write_updates_json(&updates_path, &single_update)?;

    Ok(Some(PreparedUpdate {
        single_update,
        final_updates,
    }))
}

/// Runs one ingest cycle for the prepared single update: fetch, parse,
/// group-by-filename, then restores `updates.json` to the full set and
/// cleans up the per-cycle scratch directories, per `run_deploy`.
pub fn run_deploy_cycle(client: &Client, config: &Config, out_path: &Path) -> Result<Option<String>> {
    let Some(prepared) = prepare_updates(client, out_path)? else {
        return Ok(None);
    };

    info!("running upd02_get_manifests_from_updates");
    driver::run_fetch_manifests_stage(client, config, out_path)?;

    info!("running upd03_parse_manifests");
    driver::run_parse_manifests_stage(config, out_path)?;

    info!("running upd05_group_by_filename");
    driver::run_group_by_filename_stage(out_path, config, Deadline::none())?;

    let updates_path = out_path.join("updates.json");
    write_updates_json(&updates_path, &prepared.final_updates)?;

    for dir in ["manifests", "parsed"] {
        let path = out_path.join(dir);
        if path.exists() {
            std::fs::remove_dir_all(&path).with_context(|| format!("failed to remove {path:?}"))?;
        }
    }

    let summary = serde_json::to_string(&prepared.single_update)?;
    Ok(Some(format!("Updated with files from {summary}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_update(kb: &str) -> Update {
        Update {
            windows_version: "22H2".to_string(),
            kb: kb.to_string(),
            release_date: "2024-01-01".to_string(),
            release_version: "19045.1".to_string(),
            update_url: format!("https://example.com/{kb}"),
            other_windows_versions: Vec::new(),
        }
    }

    #[test]
    fn filter_updates_drops_empty_version_groups() {
        let mut updates = BTreeMap::new();
        let mut kbs = BTreeMap::new();
        kbs.insert("KB1".to_string(), sample_update("KB1"));
        kbs.insert("KB2".to_string(), sample_update("KB2"));
        updates.insert("22H2".to_string(), kbs);

        let kept: std::collections::BTreeSet<String> = ["KB1".to_string()].into_iter().collect();
        let filtered = filter_updates(&updates, &kept);

        assert_eq!(filtered["22H2"].len(), 1);
        assert!(filtered["22H2"].contains_key("KB1"));
    }
}
