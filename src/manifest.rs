//! Component C: manifest parser.
//!
//! Turns one namespaced `.manifest` XML file into an `AssemblyRecord`, with
//! each `<file>` entry enriched by whichever on-disk sidecar is present —
//! the unpacked payload itself (`n/<name>` or bare `<name>`, PE-parsed) or
//! its `*.dd.txt` reverse-delta descriptor — per
//! `upd03_parse_manifests.py::parse_manifest`/`parse_manifest_file`.

use std::fmt;
use std::fs;
use std::io::Read as _;
use std::path::Path;

use quick_xml::events::Event;
use quick_xml::reader::Reader;
use serde_json::{Map, Value};

use winbindex_deltafmt::{DeltaDescriptor, DeltaDescriptorInfo, PeExtractor};
use winbindex_hash::{Md5Digest, Sha256Digest};

use crate::model::{AssemblyRecord, DigestAlgorithm, FileInfo, FileRecord};

#[derive(Debug)]
pub enum Error {
    Xml(quick_xml::Error),
    MissingAssemblyIdentity(usize),
    MissingFileHash(String),
    MissingDigestMethod(String),
    UnknownDigestAlgorithm(String),
    DuplicateAttribute(String),
    MissingFileName,
    ReadFile(std::io::Error),
    DeltaFormat(winbindex_deltafmt::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Xml(err) => write!(f, "XML parse error: {err}"),
            Error::MissingAssemblyIdentity(n) => write!(f, "expected exactly one assemblyIdentity tag, found {n}"),
            Error::MissingFileHash(name) => write!(f, "file {name} has no single hash tag"),
            Error::MissingDigestMethod(name) => write!(f, "file {name}'s hash has no single DigestMethod tag"),
            Error::UnknownDigestAlgorithm(alg) => write!(f, "unexpected DigestMethod algorithm {alg}"),
            Error::DuplicateAttribute(name) => write!(f, "attribute {name} present under two namespaces"),
            Error::MissingFileName => write!(f, "file element has no name attribute"),
            Error::ReadFile(err) => write!(f, "failed to read manifest file: {err}"),
            Error::DeltaFormat(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<quick_xml::Error> for Error {
    fn from(err: quick_xml::Error) -> Self {
        Error::Xml(err)
    }
}

impl From<winbindex_deltafmt::Error> for Error {
    fn from(err: winbindex_deltafmt::Error) -> Self {
        Error::DeltaFormat(err)
    }
}

fn strip_ns(name: &[u8]) -> &[u8] {
    match name.iter().rposition(|&b| b == b'}') {
        Some(idx) => &name[idx + 1..],
        None => name,
    }
}

fn attr_local_name<'a>(key: &'a [u8]) -> &'a [u8] {
    strip_ns(key)
}

#[derive(Debug, Default, Clone)]
struct RawElement {
    attrs: Map<String, Value>,
    children: Vec<(String, RawElement)>,
    text: String,
}

/// Parses the bare XML tree into nested `RawElement`s, stripping every
/// namespace prefix from tag and attribute names as it goes (mirrors the
/// original's `ET.iterparse` post-processing pass, done inline instead of
/// as a second tree walk).
fn parse_tree(xml: &str) -> Result<RawElement, Error> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<(String, RawElement)> = vec![("".to_string(), RawElement::default())];
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => {
                let tag = String::from_utf8_lossy(strip_ns(e.name().as_ref())).to_string();
                let mut el = RawElement::default();
                collect_attrs(&e, &mut el)?;
                stack.push((tag, el));
            }
            Event::Empty(e) => {
                let tag = String::from_utf8_lossy(strip_ns(e.name().as_ref())).to_string();
                let mut el = RawElement::default();
                collect_attrs(&e, &mut el)?;
                let (_, parent) = stack.last_mut().unwrap();
                parent.children.push((tag, el));
            }
            Event::End(_) => {
                if stack.len() > 1 {
                    let (tag, el) = stack.pop().unwrap();
                    let (_, parent) = stack.last_mut().unwrap();
                    parent.children.push((tag, el));
                }
            }
            Event::Text(t) => {
                let text = t.unescape()?.to_string();
                let (_, current) = stack.last_mut().unwrap();
                current.text.push_str(&text);
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(stack.pop().unwrap().1)
}

fn collect_attrs(e: &quick_xml::events::BytesStart, el: &mut RawElement) -> Result<(), Error> {
    for attr in e.attributes() {
        let attr = attr.map_err(quick_xml::Error::from)?;
        let name = String::from_utf8_lossy(attr_local_name(attr.key.as_ref())).to_string();
        let value = attr.unescape_value()?.to_string();
        if el.attrs.insert(name.clone(), Value::String(value)).is_some() {
            return Err(Error::DuplicateAttribute(name));
        }
    }
    Ok(())
}

fn find_text(el: &RawElement, tag: &str) -> Option<String> {
    el.children.iter().find(|(t, _)| t == tag).map(|(_, child)| child.text.clone())
}

/// Looks up the on-disk extracted payload for `name` (tried as `n/<name>`
/// then bare `<name>`), parses its PE header if it has one, and reports an
/// `md5`/`size` pair regardless.
fn file_data_from_payload(manifest_path: &Path, name: &str) -> Result<Option<FileInfo>, Error> {
    let stem_dir = manifest_path.with_extension("");
    let candidates = [stem_dir.join("n").join(name), stem_dir.join(name)];

    let file_path = match candidates.iter().find(|p| p.exists()) {
        Some(p) => p,
        None => return Ok(None),
    };

    let mut data = Vec::new();
    fs::File::open(file_path).and_then(|mut f| f.read_to_end(&mut data)).map_err(Error::ReadFile)?;

    let size = data.len() as u64;
    let md5 = Md5Digest::of(&data);

    if size < 0x40 {
        return Ok(Some(FileInfo::Raw {
            size,
            md5: Some(md5),
            sha256: None,
        }));
    }

    match PeExtractor::parse_header(&data) {
        Ok(header) => Ok(Some(FileInfo::Pe {
            size,
            md5,
            machine_type: header.machine_type as u32,
            timestamp: header.timestamp,
            virtual_size: header.virtual_size as u64,
        })),
        Err(_) => Ok(Some(FileInfo::Raw {
            size,
            md5: Some(md5),
            sha256: None,
        })),
    }
}

/// Looks up `<manifest stem>/f/<name>.dd.txt` and decodes it into the
/// `delta` tier, per §4.D.
fn delta_data_for_manifest_file(manifest_path: &Path, name: &str) -> Result<Option<FileInfo>, Error> {
    let delta_path = manifest_path.with_extension("").join("f").join(format!("{name}.dd.txt"));
    if !delta_path.exists() {
        return Ok(None);
    }

    let descriptor = match DeltaDescriptor::parse_file(&delta_path)? {
        Some(descriptor) => descriptor,
        None => return Ok(None),
    };

    Ok(Some(match descriptor {
        DeltaDescriptorInfo::Raw {
            size,
            hash,
        } => {
            let (md5, sha256) = match hash {
                winbindex_deltafmt::delta_descriptor::DescriptorHash::Md5(h) => (Some(h), None),
                winbindex_deltafmt::delta_descriptor::DescriptorHash::Sha256(h) => (None, Some(h)),
            };
            FileInfo::Raw {
                size,
                md5,
                sha256,
            }
        }
        DeltaDescriptorInfo::Delta {
            size,
            hash,
            machine_type,
            timestamp,
            last_section_virtual_address,
            last_section_pointer_to_raw_data,
        } => FileInfo::Delta {
            size,
            hash: match hash {
                winbindex_deltafmt::delta_descriptor::DescriptorHash::Md5(h) => crate::model::DeltaHash::Md5(h),
                winbindex_deltafmt::delta_descriptor::DescriptorHash::Sha256(h) => crate::model::DeltaHash::Sha256(h),
            },
            machine_type,
            timestamp,
            last_section_virtual_address,
            last_section_pointer_to_raw_data,
        },
    }))
}

fn parse_file_element(manifest_path: &Path, name: &str, el: &RawElement) -> Result<FileRecord, Error> {
    let hashes: Vec<&RawElement> = el.children.iter().filter(|(t, _)| t == "hash").map(|(_, c)| c).collect();
    if hashes.len() != 1 {
        return Err(Error::MissingFileHash(name.to_string()));
    }
    let hash_el = hashes[0];

    let digest_methods: Vec<&RawElement> = hash_el.children.iter().filter(|(t, _)| t == "DigestMethod").map(|(_, c)| c).collect();
    if digest_methods.len() != 1 {
        return Err(Error::MissingDigestMethod(name.to_string()));
    }
    let algorithm_uri = digest_methods[0].attrs.get("Algorithm").and_then(|v| v.as_str()).unwrap_or_default();

    let digest_algorithm = match algorithm_uri {
        "http://www.w3.org/2000/09/xmldsig#sha1" => DigestAlgorithm::Sha1,
        "http://www.w3.org/2000/09/xmldsig#sha256" => DigestAlgorithm::Sha256,
        other => return Err(Error::UnknownDigestAlgorithm(other.to_string())),
    };

    let digest_value_b64 = find_text(hash_el, "DigestValue").unwrap_or_default();
    let digest_bytes = base64_decode(&digest_value_b64);
    let digest = hex::encode(digest_bytes);

    let info = match file_data_from_payload(manifest_path, name)? {
        Some(info) => Some(info),
        None => delta_data_for_manifest_file(manifest_path, name)?,
    };

    Ok(FileRecord {
        attributes: el.attrs.clone(),
        digest_algorithm,
        digest,
        info,
    })
}

fn base64_decode(s: &str) -> Vec<u8> {
    let s = s.trim().as_bytes();
    let mut out = Vec::with_capacity(s.len() / 4 * 3);
    let mut buf = [0u8; 4];
    let mut buf_len = 0;

    for &b in s {
        let v = match b {
            b'A'..=b'Z' => b - b'A',
            b'a'..=b'z' => b - b'a' + 26,
            b'0'..=b'9' => b - b'0' + 52,
            b'+' => 62,
            b'/' => 63,
            b'=' => break,
            _ => continue,
        };
        buf[buf_len] = v;
        buf_len += 1;
        if buf_len == 4 {
            out.push((buf[0] << 2) | (buf[1] >> 4));
            out.push((buf[1] << 4) | (buf[2] >> 2));
            out.push((buf[2] << 6) | buf[3]);
            buf_len = 0;
        }
    }

    if buf_len >= 2 {
        out.push((buf[0] << 2) | (buf[1] >> 4));
    }
    if buf_len >= 3 {
        out.push((buf[1] << 4) | (buf[2] >> 2));
    }

    out
}

/// Parses a complete `.manifest` file into its single `AssemblyRecord`.
pub fn parse_manifest(manifest_path: &Path) -> Result<AssemblyRecord, Error> {
    let xml = fs::read_to_string(manifest_path).map_err(Error::ReadFile)?;
    let root = parse_tree(&xml)?;

    let assembly_identities: Vec<&RawElement> = root.children.iter().filter(|(t, _)| t == "assembly").flat_map(|(_, c)| c.children.iter()).filter(|(t, _)| t == "assemblyIdentity").map(|(_, c)| c).collect();

    let assembly_identity = match assembly_identities.len() {
        1 => assembly_identities[0].attrs.clone(),
        n => return Err(Error::MissingAssemblyIdentity(n)),
    };

    let mut files = Vec::new();
    for (tag, assembly) in root.children.iter().filter(|(t, _)| t == "assembly") {
        let _ = tag;
        for (ftag, file_el) in assembly.children.iter().filter(|(t, _)| t == "file") {
            let _ = ftag;
            let name = file_el.attrs.get("name").and_then(|v| v.as_str()).ok_or(Error::MissingFileName)?.to_string();
            files.push(parse_file_element(manifest_path, &name, file_el)?);
        }
    }

    Ok(AssemblyRecord {
        assembly_identity,
        files,
    })
}

/// Parses every `*.manifest` file directly under `manifests_dir`, skipping
/// (rather than failing the whole batch on) files with zero parsed
/// entries, and writes one `<stem>.json` per manifest under `output_dir`.
pub fn parse_manifests(manifests_dir: &Path, output_dir: &Path) -> Result<(), Error> {
    fs::create_dir_all(output_dir).map_err(Error::ReadFile)?;

    for entry in fs::read_dir(manifests_dir).map_err(Error::ReadFile)? {
        let path = entry.map_err(Error::ReadFile)?.path();
        if path.extension().map(|e| e.to_string_lossy().to_string()) != Some("manifest".to_string()) {
            continue;
        }

        let parsed = match parse_manifest(&path) {
            Ok(p) => p,
            Err(err) => {
                log::error!("failed to process {path:?}: {err}");
                return Err(err);
            }
        };

        if parsed.files.is_empty() {
            continue;
        }

        let output_path = output_dir.join(path.file_stem().unwrap()).with_extension("json");
        let file = fs::File::create(&output_path).map_err(Error::ReadFile)?;
        serde_json::to_writer_pretty(file, &parsed).map_err(|err| Error::ReadFile(std::io::Error::new(std::io::ErrorKind::Other, err)))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_namespace_prefixes() {
        assert_eq!(strip_ns(b"{urn:foo}assembly"), b"assembly");
        assert_eq!(strip_ns(b"assembly"), b"assembly");
    }

    #[test]
    fn base64_decodes_known_vector() {
        assert_eq!(base64_decode("aGVsbG8="), b"hello".to_vec());
    }
}
