//! Single immutable configuration record threaded through every stage entry
//! point, replacing the module-level knobs the original keeps in a
//! `config` module (allowlists for known-bad Microsoft manifest entries,
//! architecture filters, compression level, and so on).

use std::collections::{HashMap, HashSet};

/// `(sha256, md5)` pair of a file whose cross-source metadata is known to
/// disagree because of a documented Microsoft manifest bug. §4.F/§7 allow
/// skipping the merge (with a warning) instead of failing hard when a
/// mismatch matches one of these pairs.
pub type HashMismatchKey = (String, String);

#[derive(Debug, Clone)]
pub struct Config {
    /// Windows versions this pipeline run should ignore entirely.
    pub updates_unsupported: HashSet<String>,
    /// CPU architectures this pipeline run should keep; others are
    /// filtered out of the catalog's per-version update lists.
    pub updates_architecture: HashSet<String>,
    /// If true, a file with no SHA-256 digest (from either the manifest or
    /// VirusTotal) is skipped with a warning instead of failing §7
    /// "Missing info".
    pub allow_missing_sha256_hash: bool,
    /// Files that are legitimately non-PE but still carry a recognized
    /// hash (catalogs, text descriptors, etc.) — skip the "file_unknown"
    /// classification warning for these.
    pub file_hashes_non_pe: HashSet<String>,
    /// `(sha256, md5)` pairs allow-listed against the §4.F.2/§7 merge
    /// invariant checks.
    pub file_hashes_mismatch: HashMap<HashMismatchKey, HashSet<String>>,
    /// Files whose first section's virtual address/alignment look
    /// unusual but are known-good (VirusTotal section-alignment
    /// heuristic exceptions).
    pub file_hashes_unusual_section_alignment: HashMap<String, (u64, u64)>,
    /// Files with a legitimately zero PE timestamp.
    pub file_hashes_zero_timestamp: HashSet<String>,
    /// Files with a small trailing overlay that is not itself a
    /// signature, so its presence shouldn't demote `signingStatus`.
    pub file_hashes_small_non_signature_overlay: HashSet<String>,
    /// Files whose overlay legitimately carries no signature despite the
    /// main image being signed.
    pub file_hashes_unsigned_with_overlay: HashSet<String>,
    /// `(windowsVersion, path-suffix)` pairs recognized as TCB launchers,
    /// which may legitimately have an oversized first section.
    pub tcb_launcher_descriptions: HashSet<String>,
    pub tcb_launcher_large_first_section_virtual_addresses: HashSet<String>,
    /// Reverse-differential machine-type codes this run accepts; others
    /// are a fatal structural error per §7.
    pub delta_machine_type_values_supported: HashSet<u32>,
    /// Fixed gzip compression level (§4.G determinism requirement).
    pub compression_level: u32,
    /// Worker-pool size for component G's partition-by-filename mode.
    pub group_by_filename_processes: usize,
    /// If false (the default), a fatal error in one file aborts the whole
    /// update; if true, the driver logs and continues to the next file.
    pub exit_on_first_error: bool,
    /// Output directory root.
    pub out_path: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            updates_unsupported: HashSet::new(),
            updates_architecture: ["amd64", "x86", "arm64"].into_iter().map(String::from).collect(),
            allow_missing_sha256_hash: false,
            file_hashes_non_pe: HashSet::new(),
            file_hashes_mismatch: HashMap::new(),
            file_hashes_unusual_section_alignment: HashMap::new(),
            file_hashes_zero_timestamp: HashSet::new(),
            file_hashes_small_non_signature_overlay: HashSet::new(),
            file_hashes_unsigned_with_overlay: HashSet::new(),
            tcb_launcher_descriptions: HashSet::new(),
            tcb_launcher_large_first_section_virtual_addresses: HashSet::new(),
            delta_machine_type_values_supported: [332u32, 34404, 452, 43620].into_iter().collect(),
            compression_level: 6,
            group_by_filename_processes: 1,
            exit_on_first_error: true,
            out_path: "out".to_string(),
        }
    }
}

impl Config {
    /// True when `(sha256, md5)` is allow-listed against `windows_version`,
    /// per §4.F.2/§7.
    pub fn is_hash_mismatch_allowed(&self, sha256: &str, md5: &str, windows_version: &str) -> bool {
        self.file_hashes_mismatch
            .get(&(sha256.to_string(), md5.to_string()))
            .map(|versions| versions.contains(windows_version))
            .unwrap_or(false)
    }
}
