//! Explicit tagged types for the dynamic maps/records §3 of the spec
//! describes informally, per the "dynamic maps as records" design note:
//! `Update`, `AssemblyRecord`, `FileRecord`, `FileInfo` and
//! `GroupedFilenameDoc`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use winbindex_hash::{Md5Digest, Sha1Digest, Sha256Digest};

/// One cumulative update, as resolved by the catalog (component A).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Update {
    pub windows_version: String,
    pub kb: String,
    pub release_date: String,
    pub release_version: String,
    pub update_url: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub other_windows_versions: Vec<String>,
}

/// Completeness tiers from §3, ascending. `file_unknown_sig` sits between
/// `pe` and `vt_or_file`: a full PE scan whose signing status could not be
/// determined, per the merge special rule in §4.F.5. `file` outranks
/// `vt_or_file`: it is not a distinct `FileInfo` shape but the rank an ISO
/// scan's observation always takes regardless of its fields, per §4.F.4's
/// "iso > vt" source precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Raw,
    RawFile,
    Delta,
    DeltaPlus,
    Pe,
    FileUnknownSig,
    VtOrFile,
    File,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SigningStatus {
    Signed,
    Unsigned,
    Unknown,
}

/// The six-tier `FileInfo` variant from §3. Each variant carries exactly
/// the fields its tier promises; merge (component F) is the only place
/// that is allowed to move a record from one variant to a higher one.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FileInfo {
    Raw {
        size: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        md5: Option<Md5Digest>,
        #[serde(skip_serializing_if = "Option::is_none")]
        sha256: Option<Sha256Digest>,
    },
    RawFile {
        size: u64,
        md5: Md5Digest,
        sha1: Sha1Digest,
        sha256: Sha256Digest,
    },
    Delta {
        size: u64,
        hash: DeltaHash,
        machine_type: u32,
        timestamp: u32,
        last_section_virtual_address: u64,
        last_section_pointer_to_raw_data: u64,
    },
    DeltaPlus {
        size: u64,
        hash: DeltaHash,
        machine_type: u32,
        timestamp: u32,
        last_section_virtual_address: u64,
        last_section_pointer_to_raw_data: u64,
        virtual_size: u64,
    },
    Pe {
        size: u64,
        md5: Md5Digest,
        machine_type: u32,
        timestamp: u32,
        virtual_size: u64,
    },
    VtOrFile {
        size: u64,
        md5: Md5Digest,
        sha1: Sha1Digest,
        sha256: Sha256Digest,
        machine_type: u32,
        timestamp: u32,
        virtual_size: u64,
        signing_status: SigningStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        signature_type: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        signing_date: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        version: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DeltaHash {
    Md5(Md5Digest),
    Sha256(Sha256Digest),
}

impl FileInfo {
    pub fn tier(&self) -> Tier {
        match self {
            FileInfo::Raw {
                ..
            } => Tier::Raw,
            FileInfo::RawFile {
                ..
            } => Tier::RawFile,
            FileInfo::Delta {
                ..
            } => Tier::Delta,
            FileInfo::DeltaPlus {
                ..
            } => Tier::DeltaPlus,
            FileInfo::Pe {
                ..
            } => Tier::Pe,
            FileInfo::VtOrFile {
                signing_status: SigningStatus::Unknown,
                ..
            } => Tier::FileUnknownSig,
            FileInfo::VtOrFile {
                ..
            } => Tier::VtOrFile,
        }
    }

    pub fn size(&self) -> u64 {
        match self {
            FileInfo::Raw {
                size, ..
            }
            | FileInfo::RawFile {
                size, ..
            }
            | FileInfo::Delta {
                size, ..
            }
            | FileInfo::DeltaPlus {
                size, ..
            }
            | FileInfo::Pe {
                size, ..
            }
            | FileInfo::VtOrFile {
                size, ..
            } => *size,
        }
    }
}

/// §3 `AssemblyRecord`: identity is an ordered map (insertion order
/// preserved by `serde_json`'s `preserve_order` feature), files in
/// manifest-file order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssemblyRecord {
    pub assembly_identity: Map<String, Value>,
    pub files: Vec<FileRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    Sha1,
    Sha256,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub attributes: Map<String, Value>,
    pub digest_algorithm: DigestAlgorithm,
    /// Hex, lower-case, per §4.C.
    pub digest: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<FileInfo>,
}

/// §3 `ProgressState`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgressState {
    pub current_update_kb: Option<String>,
    pub files_processed: Vec<String>,
    pub files_total: Option<usize>,
}

/// One `{kb|"BASE": {...}}` entry in the grouped document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VersionEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_info: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub windows_version_info: Option<Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub assemblies: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub source_paths: Vec<String>,
}

/// One sha256 entry of the per-filename grouped document, §4.G.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroupedFileEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_info: Option<FileInfo>,
    #[serde(default)]
    pub windows_versions: BTreeMap<String, BTreeMap<String, VersionEntry>>,
}

/// `{sha256: GroupedFileEntry}`, the decoded body of one
/// `by_filename_compressed/<filename>.json.gz`.
pub type GroupedFilenameDoc = BTreeMap<String, GroupedFileEntry>;
