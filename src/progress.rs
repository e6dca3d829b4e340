//! Component H (part 1): progress-state persistence and the cooperative
//! deadline check. Grounded on `upd05_group_by_filename.py`'s
//! `progress_state`/`time_to_stop` plumbing, threaded through every
//! long-running stage.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};

use crate::model::ProgressState;

/// `info_sources.json`'s shape: filename → sha256 → tier tag (`'delta'`,
/// `'delta+'`, `'file'`, ...), a resumable-stage marker per spec.md §6.
pub type InfoSources = BTreeMap<String, BTreeMap<String, String>>;

/// Loads `<out_path>/info_sources.json`, or an empty map if it doesn't
/// exist yet.
pub fn load_info_sources(out_path: &Path) -> Result<InfoSources> {
    let path = out_path.join("info_sources.json");
    if !path.exists() {
        return Ok(InfoSources::new());
    }
    let file = File::open(&path).with_context(|| format!("failed to open {path:?}"))?;
    serde_json::from_reader(file).with_context(|| format!("failed to parse {path:?}"))
}

/// Writes `info_sources` back to `<out_path>/info_sources.json`, sorted by
/// key for deterministic output.
pub fn save_info_sources(out_path: &Path, info_sources: &InfoSources) -> Result<()> {
    let path = out_path.join("info_sources.json");
    let file = File::create(&path).with_context(|| format!("failed to create {path:?}"))?;
    serde_json::to_writer_pretty(file, info_sources).with_context(|| format!("failed to write {path:?}"))
}

/// A deadline a long-running stage checks cooperatively between units of
/// work (one file, one update) rather than preempting mid-unit. `None`
/// means "run to completion".
#[derive(Debug, Clone, Copy)]
pub struct Deadline(Option<SystemTime>);

impl Deadline {
    pub fn none() -> Self {
        Deadline(None)
    }

    pub fn after(duration: Duration) -> Self {
        Deadline(Some(SystemTime::now() + duration))
    }

    pub fn has_passed(&self) -> bool {
        match self.0 {
            Some(when) => SystemTime::now() >= when,
            None => false,
        }
    }
}

/// Loads `<out_path>/progress.json`, or a fresh default if it doesn't
/// exist yet.
pub fn load(out_path: &Path) -> Result<ProgressState> {
    let path = out_path.join("progress.json");
    if !path.exists() {
        return Ok(ProgressState::default());
    }
    let file = File::open(&path).with_context(|| format!("failed to open {path:?}"))?;
    serde_json::from_reader(file).with_context(|| format!("failed to parse {path:?}"))
}

/// Writes `state` back to `<out_path>/progress.json`.
pub fn save(out_path: &Path, state: &ProgressState) -> Result<()> {
    let path = out_path.join("progress.json");
    let file = File::create(&path).with_context(|| format!("failed to create {path:?}"))?;
    serde_json::to_writer_pretty(file, state).with_context(|| format!("failed to write {path:?}"))
}

/// Loads a named `info_progress_<stage>.json` side-file (symbol server,
/// VirusTotal), used by stages whose progress shape doesn't match the
/// generic `ProgressState`.
pub fn load_named<T: serde::de::DeserializeOwned + Default>(out_path: &Path, stage: &str) -> Result<T> {
    let path = out_path.join(format!("info_progress_{stage}.json"));
    if !path.exists() {
        return Ok(T::default());
    }
    let file = File::open(&path).with_context(|| format!("failed to open {path:?}"))?;
    serde_json::from_reader(file).with_context(|| format!("failed to parse {path:?}"))
}

pub fn save_named<T: serde::Serialize>(out_path: &Path, stage: &str, state: &T) -> Result<()> {
    let path = out_path.join(format!("info_progress_{stage}.json"));
    let file = File::create(&path).with_context(|| format!("failed to create {path:?}"))?;
    serde_json::to_writer_pretty(file, state).with_context(|| format!("failed to write {path:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_none_never_passes() {
        assert!(!Deadline::none().has_passed());
    }

    #[test]
    fn deadline_in_the_past_has_passed() {
        let deadline = Deadline::after(Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        assert!(deadline.has_passed());
    }

    #[test]
    fn load_missing_progress_file_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let state = load(dir.path()).unwrap();
        assert!(state.current_update_kb.is_none());
    }
}
