//! Component F: source merger.
//!
//! Combines `FileInfo` values observed from different sources (a manifest's
//! embedded delta/PE data, a VirusTotal report, an ISO scan) for the same
//! file hash into one record, enforcing that the sources agree wherever
//! they overlap before picking the higher-completeness one. Grounded on
//! `upd05_group_by_filename.py`'s `get_file_info_type` / `update_file_info`
//! / `assert_file_info_close_enough`.

use std::fmt;

use anyhow::{bail, Result};
use chrono::NaiveDateTime;

use crate::model::{FileInfo, SigningStatus, Tier};

#[derive(Debug)]
pub enum Error {
    SizeMismatch(u64, u64),
    MachineTypeMismatch(u32, u32),
    TimestampMismatch(u32, u32),
    SigningStatusMismatch(SigningStatus, SigningStatus),
    SigningDateTooFarApart(f64),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::SizeMismatch(a, b) => write!(f, "size mismatch between sources: {a} vs {b}"),
            Error::MachineTypeMismatch(a, b) => write!(f, "machineType mismatch between sources: {a} vs {b}"),
            Error::TimestampMismatch(a, b) => write!(f, "timestamp mismatch between sources: {a} vs {b}"),
            Error::SigningStatusMismatch(a, b) => write!(f, "signingStatus mismatch between sources: {a:?} vs {b:?}"),
            Error::SigningDateTooFarApart(hours) => write!(f, "signingDate sources disagree by {hours:.1} hours, more than the 32h VirusTotal timezone tolerance"),
        }
    }
}

impl std::error::Error for Error {}

/// The source a `FileInfo` update came from, which decides how its tier is
/// read (an ISO/VirusTotal-sourced record is always treated as that
/// source's tier regardless of the fields it happens to carry).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoSource {
    Update,
    VirusTotal,
    Iso,
}

fn size_of(info: &FileInfo) -> u64 {
    info.size()
}

fn machine_type_of(info: &FileInfo) -> Option<u32> {
    match info {
        FileInfo::Delta {
            machine_type, ..
        }
        | FileInfo::DeltaPlus {
            machine_type, ..
        }
        | FileInfo::Pe {
            machine_type, ..
        }
        | FileInfo::VtOrFile {
            machine_type, ..
        } => Some(*machine_type),
        _ => None,
    }
}

fn timestamp_of(info: &FileInfo) -> Option<u32> {
    match info {
        FileInfo::Delta {
            timestamp, ..
        }
        | FileInfo::DeltaPlus {
            timestamp, ..
        }
        | FileInfo::Pe {
            timestamp, ..
        }
        | FileInfo::VtOrFile {
            timestamp, ..
        } => Some(*timestamp),
        _ => None,
    }
}

/// Paths known to legitimately carry more than one Authenticode signing
/// time on the same binary — Edge re-signs components of
/// `msedge.exe` at different times, so two disagreeing signing times there
/// are expected rather than a sign of a bad merge (spec.md §8 S6).
fn is_known_multi_signed_path(path: &str) -> bool {
    path.to_ascii_lowercase().replace('/', "\\").contains(r"microsoft\edge\application\")
}

/// Checks that two `FileInfo` observations of the same hash do not
/// contradict each other on any field they both carry. Delta/PE-level
/// fields must always match exactly; signing metadata is allowed the
/// documented VirusTotal slop. `path` is whatever path/filename the
/// observation was recorded under, used only to recognize the known
/// multiple-signing-times exception above.
pub fn assert_close_enough(a: &FileInfo, b: &FileInfo, path: &str) -> Result<()> {
    if size_of(a) != size_of(b) {
        bail!(Error::SizeMismatch(size_of(a), size_of(b)));
    }

    let (mt_a, mt_b) = (machine_type_of(a), machine_type_of(b));
    if let (Some(mt_a), Some(mt_b)) = (mt_a, mt_b) {
        if mt_a != mt_b {
            bail!(Error::MachineTypeMismatch(mt_a, mt_b));
        }
    }

    let (ts_a, ts_b) = (timestamp_of(a), timestamp_of(b));
    if let (Some(ts_a), Some(ts_b)) = (ts_a, ts_b) {
        if ts_a != ts_b {
            bail!(Error::TimestampMismatch(ts_a, ts_b));
        }
    }

    // Only VtOrFile-tier records (possibly promoted from FileUnknownSig)
    // carry signing metadata; anything below that tier has nothing further
    // to cross-check.
    let (FileInfo::VtOrFile {
        signing_status: ss_a,
        signing_date: sd_a,
        signature_type: st_a,
        ..
    }, FileInfo::VtOrFile {
        signing_status: ss_b,
        signing_date: sd_b,
        signature_type: st_b,
        ..
    }) = (a, b)
    else {
        return Ok(());
    };

    // Catalog-file signatures depend on the machine the scan ran on, so
    // they're normalized to Unsigned before comparison.
    let ss_a = if st_a.as_deref() == Some("Catalog file") { SigningStatus::Unsigned } else { ss_a.clone() };
    let ss_b = if st_b.as_deref() == Some("Catalog file") { SigningStatus::Unsigned } else { ss_b.clone() };

    match (&ss_a, &ss_b) {
        (SigningStatus::Unknown, other) | (other, SigningStatus::Unknown) => {
            if *other == SigningStatus::Unsigned {
                bail!(Error::SigningStatusMismatch(ss_a.clone(), ss_b.clone()));
            }
        }
        (x, y) if x != y => bail!(Error::SigningStatusMismatch(x.clone(), y.clone())),
        _ => {}
    }

    if let (Some(date_a), Some(date_b)) = (sd_a, sd_b) {
        let parsed_a = NaiveDateTime::parse_from_str(date_a, "%Y-%m-%dT%H:%M:%S").ok();
        let parsed_b = NaiveDateTime::parse_from_str(date_b, "%Y-%m-%dT%H:%M:%S").ok();
        if let (Some(parsed_a), Some(parsed_b)) = (parsed_a, parsed_b) {
            let hours = (parsed_a - parsed_b).num_seconds().unsigned_abs() as f64 / 3600.0;
            // Everywhere else two signing times on the same file are the
            // same signature read twice and must agree exactly; a known
            // multiply-signed path gets the same slop VirusTotal's own
            // timezone handling already needs.
            let tolerance = if is_known_multi_signed_path(path) { 32.0 } else { 0.0 };
            if hours > tolerance {
                bail!(Error::SigningDateTooFarApart(hours));
            }
        }
    }

    Ok(())
}

fn effective_tier(info: &FileInfo, source: InfoSource) -> Tier {
    match source {
        InfoSource::Iso => Tier::File,
        InfoSource::VirusTotal => Tier::VtOrFile,
        InfoSource::Update => info.tier(),
    }
}

/// Merges `new_info` (observed via `new_source`) into `existing`, per
/// `update_file_info`. `file_unknown_sig` is a special case: it only ever
/// contributes or borrows `signingStatus`, never anything else, since a
/// full binary scan with unresolved signing status is otherwise strictly
/// more trustworthy than any other source for every other field.
pub fn merge_file_info(existing: Option<FileInfo>, new_info: Option<FileInfo>, new_source: InfoSource, path: &str) -> Result<Option<FileInfo>> {
    let (existing, new_info) = match (existing, new_info) {
        (None, new_info) => return Ok(new_info),
        (existing, None) => return Ok(existing),
        (Some(existing), Some(new_info)) => (existing, new_info),
    };

    assert_close_enough(&existing, &new_info, path)?;

    let existing_tier = existing.tier();
    let new_tier = effective_tier(&new_info, new_source);

    if existing_tier == Tier::FileUnknownSig {
        if let FileInfo::VtOrFile {
            signing_status, ..
        } = &new_info
        {
            if *signing_status == SigningStatus::Unsigned {
                bail!(Error::SigningStatusMismatch(SigningStatus::Unknown, signing_status.clone()));
            }
            return Ok(Some(borrow_signing_status(existing, signing_status.clone())));
        }
        return Ok(Some(existing));
    }

    if new_tier == Tier::FileUnknownSig {
        if let FileInfo::VtOrFile {
            signing_status, ..
        } = &existing
        {
            if *signing_status == SigningStatus::Unsigned {
                bail!(Error::SigningStatusMismatch(signing_status.clone(), SigningStatus::Unknown));
            }
            return Ok(Some(borrow_signing_status(new_info, signing_status.clone())));
        }
        return Ok(Some(new_info));
    }

    if new_tier > existing_tier {
        Ok(Some(new_info))
    } else {
        Ok(Some(existing))
    }
}

fn borrow_signing_status(mut info: FileInfo, status: SigningStatus) -> FileInfo {
    if let FileInfo::VtOrFile {
        signing_status, ..
    } = &mut info
    {
        *signing_status = status;
    }
    info
}

#[cfg(test)]
mod tests {
    use super::*;
    use winbindex_hash::{Md5Digest, Sha1Digest, Sha256Digest};

    fn vt_or_file(signing_status: SigningStatus) -> FileInfo {
        FileInfo::VtOrFile {
            size: 100,
            md5: Md5Digest::of(b"x"),
            sha1: Sha1Digest::of(b"x"),
            sha256: Sha256Digest::of(b"x"),
            machine_type: 34404,
            timestamp: 1,
            virtual_size: 0x1000,
            signing_status,
            signature_type: None,
            signing_date: None,
            version: None,
            description: None,
        }
    }

    #[test]
    fn pe_beats_delta() {
        let delta = FileInfo::Delta {
            size: 100,
            hash: crate::model::DeltaHash::Md5(Md5Digest::of(b"x")),
            machine_type: 34404,
            timestamp: 1,
            last_section_virtual_address: 0,
            last_section_pointer_to_raw_data: 0,
        };
        let pe = FileInfo::Pe {
            size: 100,
            md5: Md5Digest::of(b"x"),
            machine_type: 34404,
            timestamp: 1,
            virtual_size: 0x1000,
        };
        let merged = merge_file_info(Some(delta), Some(pe.clone()), InfoSource::Update, "foo.dll").unwrap().unwrap();
        assert_eq!(merged.tier(), Tier::Pe);
    }

    #[test]
    fn file_unknown_sig_only_borrows_signing_status() {
        let unknown = vt_or_file(SigningStatus::Unknown);
        let signed = vt_or_file(SigningStatus::Signed);
        let merged = merge_file_info(Some(unknown), Some(signed), InfoSource::VirusTotal, "foo.dll").unwrap().unwrap();
        match merged {
            FileInfo::VtOrFile {
                signing_status, ..
            } => assert_eq!(signing_status, SigningStatus::Signed),
            _ => panic!("expected VtOrFile"),
        }
    }

    #[test]
    fn size_mismatch_is_rejected() {
        let a = FileInfo::Raw {
            size: 1,
            md5: None,
            sha256: None,
        };
        let b = FileInfo::Raw {
            size: 2,
            md5: None,
            sha256: None,
        };
        assert!(merge_file_info(Some(a), Some(b), InfoSource::Update, "foo.dll").is_err());
    }

    // S6 from spec.md §8.
    #[test]
    fn edge_path_tolerates_disagreeing_signing_times() {
        let mut a = vt_or_file(SigningStatus::Signed);
        let mut b = vt_or_file(SigningStatus::Signed);
        if let (FileInfo::VtOrFile {
            signing_date: sd_a, ..
        }, FileInfo::VtOrFile {
            signing_date: sd_b, ..
        }) = (&mut a, &mut b)
        {
            *sd_a = Some("2024-01-01T00:00:00".to_string());
            *sd_b = Some("2024-01-01T04:00:00".to_string());
        }

        let edge_path = r"Program Files (x86)\Microsoft\Edge\Application\msedge.exe";
        assert!(merge_file_info(Some(a.clone()), Some(b.clone()), InfoSource::Iso, edge_path).is_ok());
        assert!(merge_file_info(Some(a), Some(b), InfoSource::Iso, "msedge.exe").is_err());
    }
}
