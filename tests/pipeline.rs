//! End-to-end scenarios from spec.md §8.

use std::fs;
use std::path::Path;

use winbindex_hash::{Md5Digest, Sha1Digest, Sha256Digest};
use winbindex_rs::config::{Config, HashMismatchKey};
use winbindex_rs::driver;
use winbindex_rs::grouped::{self, UpdateContribution};
use winbindex_rs::iso::{IsoFileEntry, IsoScanResult};
use winbindex_rs::manifest;
use winbindex_rs::merge::{merge_file_info, InfoSource};
use winbindex_rs::model::{AssemblyRecord, DigestAlgorithm, FileInfo, FileRecord, GroupedFilenameDoc, Tier, Update};
use winbindex_rs::progress::Deadline;

const SHA256_AA_BB: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaabb";

fn write_manifest(dir: &Path, body: &str) -> std::path::PathBuf {
    let path = dir.join("update.manifest");
    fs::write(&path, body).unwrap();
    path
}

fn digest_value_base64_sha256_aa_bb() -> &'static str {
    // base64 of the 32 raw bytes 0xaa*31, 0xbb.
    "qqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqrs="
}

fn manifest_xml(digest_algorithm_uri: &str, digest_value_b64: &str) -> String {
    format!(
        r#"<assembly manifestVersion="1.0">
  <assemblyIdentity name="Microsoft-Windows-Test" version="10.0.19041.1" processorArchitecture="amd64" language="neutral" publicKeyToken="0000000000000000"/>
  <file name="Foo\bar.dll">
    <hash>
      <DigestMethod Algorithm="{digest_algorithm_uri}"/>
      <DigestValue>{digest_value_b64}</DigestValue>
    </hash>
  </file>
</assembly>"#
    )
}

/// S1: manifest with one file, no payload/delta sidecar on disk → the file
/// record carries no `fileInfo` and the grouped document holds only its
/// assembly/attribute provenance.
#[test]
fn s1_manifest_without_sidecar_has_no_file_info() {
    let dir = tempfile::tempdir().unwrap();
    let manifest_path = write_manifest(&dir, &manifest_xml("http://www.w3.org/2000/09/xmldsig#sha256", digest_value_base64_sha256_aa_bb()));

    let record = manifest::parse_manifest(&manifest_path).unwrap();
    assert_eq!(record.files.len(), 1);
    let file = &record.files[0];
    assert_eq!(file.digest, SHA256_AA_BB);
    assert_eq!(file.digest_algorithm, DigestAlgorithm::Sha256);
    assert!(file.info.is_none());

    let mut doc = GroupedFilenameDoc::new();
    grouped::add_file_info_from_update(
        &mut doc,
        UpdateContribution {
            file_hash: &file.digest,
            filename: "bar.dll",
            virustotal_file_info: None,
            windows_version: "22H2",
            update_kb: "KB5000001",
            update_info: serde_json::json!({"kb": "KB5000001"}),
            manifest_name: "update",
            assembly_identity: record.assembly_identity.clone(),
            attributes: file.attributes.clone(),
            delta_or_pe_file_info: file.info.clone(),
        },
        &Config::default(),
    )
    .unwrap();

    let entry = doc.get(SHA256_AA_BB).expect("entry for the sha256 digest");
    assert!(entry.file_info.is_none());
    let version_entry = &entry.windows_versions["22H2"]["KB5000001"];
    let assembly = version_entry.assemblies.get("update").unwrap();
    assert!(assembly.get("attributes").unwrap().as_array().unwrap().len() == 1);
}

fn build_minimal_pe(size: usize, machine_type: u16, timestamp: u32, virtual_size: u32) -> Vec<u8> {
    const PE_OFF: usize = 0x40;
    let mut data = vec![0u8; size];
    data[0..2].copy_from_slice(b"MZ");
    data[0x3c..0x40].copy_from_slice(&(PE_OFF as u32).to_le_bytes());
    data[PE_OFF..PE_OFF + 4].copy_from_slice(b"PE\0\0");
    data[PE_OFF + 4..PE_OFF + 6].copy_from_slice(&machine_type.to_le_bytes());
    data[PE_OFF + 8..PE_OFF + 12].copy_from_slice(&timestamp.to_le_bytes());
    data[PE_OFF + 0x50..PE_OFF + 0x54].copy_from_slice(&virtual_size.to_le_bytes());
    data
}

/// S2: same manifest, but a decoded PE payload sits at `<stem>/n/<name>` →
/// the file's `fileInfo` is promoted to the `pe` tier with the header
/// fields read back out of it.
#[test]
fn s2_manifest_with_pe_payload_reaches_pe_tier() {
    let dir = tempfile::tempdir().unwrap();
    let manifest_path = write_manifest(&dir, &manifest_xml("http://www.w3.org/2000/09/xmldsig#sha256", digest_value_base64_sha256_aa_bb()));

    let payload_dir = manifest_path.with_extension("").join("n");
    fs::create_dir_all(&payload_dir).unwrap();
    let pe_bytes = build_minimal_pe(200_000, 34404, 0x6000_0000, 0x4_0000);
    fs::write(payload_dir.join("Foo\\bar.dll"), &pe_bytes).unwrap();

    let record = manifest::parse_manifest(&manifest_path).unwrap();
    let file = &record.files[0];

    match file.info.as_ref().expect("pe-tier fileInfo") {
        FileInfo::Pe {
            size,
            machine_type,
            timestamp,
            virtual_size,
            ..
        } => {
            assert_eq!(*size, 200_000);
            assert_eq!(*machine_type, 34404);
            assert_eq!(*timestamp, 0x6000_0000);
            assert_eq!(*virtual_size, 0x4_0000);
        }
        other => panic!("expected Pe tier, got {other:?}"),
    }
    assert_eq!(file.info.as_ref().unwrap().tier(), Tier::Pe);
}

/// S4: the manifest carries a sha1-only digest, but a cached VirusTotal
/// response for that sha1 reports a different sha256 → the grouped record
/// is filed under the sha256, not the sha1.
#[test]
fn s4_sha1_only_digest_is_refiled_under_virustotal_sha256() {
    let dir = tempfile::tempdir().unwrap();
    let out_path = dir.path();

    let sha1_hex = "1".repeat(40);
    let sha256_hex = "c".repeat(63) + "d";

    let parsed_dir = out_path.join("parsed").join("22H2").join("KB5000001");
    fs::create_dir_all(&parsed_dir).unwrap();

    let record = AssemblyRecord {
        assembly_identity: serde_json::Map::new(),
        files: vec![FileRecord {
            attributes: serde_json::json!({"name": "Foo\\bar.dll"}).as_object().unwrap().clone(),
            digest_algorithm: DigestAlgorithm::Sha1,
            digest: sha1_hex.clone(),
            info: None,
        }],
    };
    fs::write(parsed_dir.join("m1.json"), serde_json::to_vec(&record).unwrap()).unwrap();

    let vt_dir = out_path.join("virustotal_sha1");
    fs::create_dir_all(&vt_dir).unwrap();
    let vt_response = serde_json::json!({
        "data": {
            "attributes": {
                "size": 4096,
                "md5": "0".repeat(32),
                "sha1": sha1_hex,
                "sha256": sha256_hex,
                "pe_info": {
                    "machine_type": 34404,
                    "timestamp": 0x6000_0000u32,
                    "sections": [{"virtual_address": 0x1000, "virtual_size": 0x1000}],
                },
            }
        }
    });
    fs::write(vt_dir.join(format!("{sha1_hex}.json")), serde_json::to_vec(&vt_response).unwrap()).unwrap();

    let update = Update {
        windows_version: "22H2".to_string(),
        kb: "KB5000001".to_string(),
        release_date: "2024-01-01".to_string(),
        release_version: "19045.1".to_string(),
        update_url: "https://example/KB5000001".to_string(),
        other_windows_versions: Vec::new(),
    };

    driver::group_update_by_filename(out_path, "22H2", "KB5000001", &update, &parsed_dir, &Config::default(), Deadline::none()).unwrap();

    let doc_path = grouped::by_filename_path(out_path, "bar.dll");
    let doc = grouped::read_grouped_doc(&doc_path).unwrap();

    assert!(doc.contains_key(&sha256_hex), "expected the record filed under the VirusTotal sha256");
    assert!(!doc.contains_key(&sha1_hex), "the sha1 should not appear as a grouped-doc key");
}

fn pe_info(size: u64, machine_type: u32, timestamp: u32) -> FileInfo {
    FileInfo::Pe {
        size,
        md5: Md5Digest::of(b"s5-fixture"),
        machine_type,
        timestamp,
        virtual_size: 0x1000,
    }
}

/// S5: two updates list the same `(filename, sha256)` with equal size but
/// different timestamp. Without an allowlist entry, the merge fails
/// fatally; with one, the conflicting observation is dropped.
#[test]
fn s5_timestamp_mismatch_is_fatal_unless_allowlisted() {
    let sha256 = "d".repeat(64);
    let md5 = Md5Digest::of(b"s5-fixture").to_string();

    let mut doc = GroupedFilenameDoc::new();
    grouped::add_file_info_from_update(
        &mut doc,
        UpdateContribution {
            file_hash: &sha256,
            filename: "bar.dll",
            virustotal_file_info: None,
            windows_version: "22H2",
            update_kb: "KB1",
            update_info: serde_json::json!({"kb": "KB1"}),
            manifest_name: "m1",
            assembly_identity: serde_json::Map::new(),
            attributes: serde_json::Map::new(),
            delta_or_pe_file_info: Some(pe_info(100, 34404, 1)),
        },
        &Config::default(),
    )
    .unwrap();

    let conflicting = UpdateContribution {
        file_hash: &sha256,
        filename: "bar.dll",
        virustotal_file_info: None,
        windows_version: "22H2",
        update_kb: "KB2",
        update_info: serde_json::json!({"kb": "KB2"}),
        manifest_name: "m2",
        assembly_identity: serde_json::Map::new(),
        attributes: serde_json::Map::new(),
        delta_or_pe_file_info: Some(pe_info(100, 34404, 2)),
    };

    let mut rejecting_doc = doc.clone();
    let err = grouped::add_file_info_from_update(&mut rejecting_doc, conflicting_copy(&sha256, "KB2", "m2"), &Config::default());
    assert!(err.is_err());

    let mut config = Config::default();
    let mut versions = std::collections::HashSet::new();
    versions.insert("22H2".to_string());
    config.file_hashes_mismatch.insert(HashMismatchKey::from((sha256.clone(), md5)), versions);

    grouped::add_file_info_from_update(&mut doc, conflicting, &config).unwrap();
    match doc.get(&sha256).unwrap().file_info.as_ref().unwrap() {
        FileInfo::Pe {
            timestamp, ..
        } => assert_eq!(*timestamp, 1, "the conflicting observation should have been dropped, not merged"),
        other => panic!("expected Pe tier, got {other:?}"),
    }
}

fn conflicting_copy<'a>(sha256: &'a str, update_kb: &'a str, manifest_name: &'a str) -> UpdateContribution<'a> {
    UpdateContribution {
        file_hash: sha256,
        filename: "bar.dll",
        virustotal_file_info: None,
        windows_version: "22H2",
        update_kb,
        update_info: serde_json::json!({"kb": update_kb}),
        manifest_name,
        assembly_identity: serde_json::Map::new(),
        attributes: serde_json::Map::new(),
        delta_or_pe_file_info: Some(pe_info(100, 34404, 2)),
    }
}

/// Property 3: merge monotonicity. Applying the same set of `FileInfo`
/// observations in any order yields the maximum input tier, and no field
/// that more than one input carries disagrees.
#[test]
fn merge_monotonicity_is_order_independent() {
    let delta = FileInfo::Delta {
        size: 100,
        hash: winbindex_rs::model::DeltaHash::Md5(Md5Digest::of(b"x")),
        machine_type: 34404,
        timestamp: 1,
        last_section_virtual_address: 0,
        last_section_pointer_to_raw_data: 0,
    };
    let pe = pe_info(100, 34404, 1);
    let vt = FileInfo::VtOrFile {
        size: 100,
        md5: Md5Digest::of(b"s5-fixture"),
        sha1: winbindex_hash::Sha1Digest::of(b"x"),
        sha256: Sha256Digest::of(b"x"),
        machine_type: 34404,
        timestamp: 1,
        virtual_size: 0x1000,
        signing_status: winbindex_rs::model::SigningStatus::Signed,
        signature_type: None,
        signing_date: None,
        version: None,
        description: None,
    };

    let forward = merge_file_info(merge_file_info(None, Some(delta.clone()), InfoSource::Update, "bar.dll").unwrap(), Some(pe.clone()), InfoSource::Update, "bar.dll").unwrap();
    let forward = merge_file_info(forward, Some(vt.clone()), InfoSource::VirusTotal, "bar.dll").unwrap().unwrap();

    let backward = merge_file_info(merge_file_info(None, Some(vt), InfoSource::VirusTotal, "bar.dll").unwrap(), Some(pe), InfoSource::Update, "bar.dll").unwrap();
    let backward = merge_file_info(backward, Some(delta), InfoSource::Update, "bar.dll").unwrap().unwrap();

    assert_eq!(forward.tier(), Tier::VtOrFile);
    assert_eq!(backward.tier(), Tier::VtOrFile);
    assert_eq!(forward.size(), backward.size());
}

fn iso_entry_with_signing_time(path: &str, signing_date: &str) -> IsoFileEntry {
    IsoFileEntry {
        path: path.to_string(),
        size: 100,
        md5: Md5Digest::of(b"s6-fixture"),
        sha1: Sha1Digest::of(b"s6-fixture"),
        sha256: Sha256Digest::of(b"s6-fixture"),
        machine_type: Some(34404),
        timestamp: Some(1),
        virtual_size: Some(0x1000),
        version: None,
        description: None,
        signing_times: vec![signing_date.to_string()],
    }
}

fn write_iso_scan(dir: &Path, name: &str, windows_version: &str, entry: IsoFileEntry) {
    let scan = IsoScanResult {
        windows_version: windows_version.to_string(),
        windows_iso_sha256: "e".repeat(64),
        windows_release_date: "2024-01-01".to_string(),
        files: vec![entry],
    };
    fs::create_dir_all(dir.join("from_iso")).unwrap();
    fs::write(dir.join("from_iso").join(format!("{name}.json")), serde_json::to_vec(&scan).unwrap()).unwrap();
}

/// S6: two ISO scans report the same binary with embedded signing times 4
/// hours apart. On a known multiply-signed Edge path that is tolerated; the
/// identical gap on any other path is fatal.
#[test]
fn s6_multiple_signing_times_only_tolerated_on_known_edge_paths() {
    let edge_dir = tempfile::tempdir().unwrap();
    write_iso_scan(edge_dir.path(), "21h2", "21H2", iso_entry_with_signing_time(r"1\Program Files (x86)\Microsoft\Edge\Application\msedge.exe", "2024-01-01T00:00:00"));
    write_iso_scan(edge_dir.path(), "22h2", "22H2", iso_entry_with_signing_time(r"1\Program Files (x86)\Microsoft\Edge\Application\msedge.exe", "2024-01-01T04:00:00"));
    driver::process_iso_files(edge_dir.path(), &Config::default()).expect("edge path tolerates a 4h signing-time gap");

    let non_edge_dir = tempfile::tempdir().unwrap();
    write_iso_scan(non_edge_dir.path(), "21h2", "21H2", iso_entry_with_signing_time(r"1\Windows\System32\notepad.exe", "2024-01-01T00:00:00"));
    write_iso_scan(non_edge_dir.path(), "22h2", "22H2", iso_entry_with_signing_time(r"1\Windows\System32\notepad.exe", "2024-01-01T04:00:00"));
    let err = driver::process_iso_files(non_edge_dir.path(), &Config::default());
    assert!(err.is_err(), "a non-Edge path should not tolerate the same 4h signing-time gap");
}
