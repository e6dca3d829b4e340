//! Component G's VirusTotal field-extraction rules (§4.F/§4.G). The
//! *fetching* of VirusTotal data is an external collaborator; turning an
//! already-fetched response into a `FileInfo` is core merge logic.
//! Grounded on `upd05_group_by_filename.py::get_virustotal_info`.

use std::fmt;

use chrono::NaiveDateTime;
use serde_json::Value;

use winbindex_hash::{Md5Digest, Sha1Digest, Sha256Digest};

use crate::config::Config;
use crate::model::{FileInfo, SigningStatus};

#[derive(Debug)]
pub enum Error {
    MissingField(&'static str),
    UnexpectedSectionAlignment { expected: u64, actual: u64 },
    SectionVirtualAddressMismatch,
    MissingTimestamp,
    UnexpectedSigningDateFormat(String),
    SignedWithoutSignatureInfo,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::MissingField(name) => write!(f, "VirusTotal response missing field {name}"),
            Error::UnexpectedSectionAlignment { expected, actual } => write!(f, "unexpected first-section alignment: expected {expected:#x}, got {actual:#x}"),
            Error::SectionVirtualAddressMismatch => write!(f, "PE sections are not laid out contiguously"),
            Error::MissingTimestamp => write!(f, "PE info has no timestamp and the file is not allow-listed for a zero timestamp"),
            Error::UnexpectedSigningDateFormat(s) => write!(f, "unrecognized signing date format: {s}"),
            Error::SignedWithoutSignatureInfo => write!(f, "file has a signature overlay but was not reported as signed"),
        }
    }
}

impl std::error::Error for Error {}

fn is_power_of_two(n: u64) -> bool {
    n != 0 && (n & (n - 1)) == 0
}

fn align_by(n: u64, alignment: u64) -> u64 {
    (n + alignment - 1) / alignment * alignment
}

fn get<'a>(value: &'a Value, field: &'static str) -> Result<&'a Value, Error> {
    value.get(field).ok_or(Error::MissingField(field))
}

fn as_u64(value: &Value, field: &'static str) -> Result<u64, Error> {
    get(value, field)?.as_u64().ok_or(Error::MissingField(field))
}

fn as_str<'a>(value: &'a Value, field: &'static str) -> Result<&'a str, Error> {
    get(value, field)?.as_str().ok_or(Error::MissingField(field))
}

/// Parses a signing-date string in one of the two formats the original
/// handles, returning a timezone-less ISO-8601 string matching §4.D.2's
/// "isoformat without timezone suffix".
fn parse_signing_date(raw: &str) -> Result<String, Error> {
    let spaces = raw.matches(' ').count();
    let format = if spaces == 1 {
        "%H:%M %d/%m/%Y"
    } else if spaces == 2 {
        "%I:%M %p %m/%d/%Y"
    } else {
        return Err(Error::UnexpectedSigningDateFormat(raw.to_string()));
    };

    NaiveDateTime::parse_from_str(raw, format).map(|dt| dt.format("%Y-%m-%dT%H:%M:%S").to_string()).map_err(|_| Error::UnexpectedSigningDateFormat(raw.to_string()))
}

/// Extracts a `FileInfo::VtOrFile` from one VirusTotal file-report JSON
/// document (the full `{"data": {"attributes": {...}}}` envelope), per
/// `get_virustotal_info`.
pub fn file_info_from_response(config: &Config, file_hash: &str, response: &Value) -> Result<FileInfo, Error> {
    let attr = get(get(response, "data")?, "attributes")?;
    let pe_info = get(attr, "pe_info")?;
    let sections = get(pe_info, "sections")?.as_array().ok_or(Error::MissingField("sections"))?;
    let first_section = sections.first().ok_or(Error::MissingField("sections[0]"))?;
    let first_section_virtual_address = as_u64(first_section, "virtual_address")?;

    let signature_description = attr.get("signature_info").and_then(|s| s.get("description")).and_then(Value::as_str);

    let section_alignment = if signature_description.map(|d| config.tcb_launcher_descriptions.contains(d)).unwrap_or(false) {
        if !config.tcb_launcher_large_first_section_virtual_addresses.contains(&first_section_virtual_address.to_string()) {
            return Err(Error::UnexpectedSectionAlignment { expected: first_section_virtual_address, actual: first_section_virtual_address });
        }
        0x1000
    } else if let Some(&(expected_address, alignment)) = config.file_hashes_unusual_section_alignment.get(file_hash) {
        if first_section_virtual_address != expected_address {
            return Err(Error::UnexpectedSectionAlignment { expected: expected_address, actual: first_section_virtual_address });
        }
        alignment
    } else {
        if !is_power_of_two(first_section_virtual_address) {
            return Err(Error::UnexpectedSectionAlignment { expected: first_section_virtual_address.next_power_of_two(), actual: first_section_virtual_address });
        }
        first_section_virtual_address
    };

    let mut virtual_size = first_section_virtual_address;
    for section in sections {
        let section_address = as_u64(section, "virtual_address")?;
        if section_address != virtual_size {
            return Err(Error::SectionVirtualAddressMismatch);
        }
        virtual_size += align_by(as_u64(section, "virtual_size")?, section_alignment);
    }

    let timestamp = match pe_info.get("timestamp").and_then(Value::as_u64) {
        Some(ts) => ts as u32,
        None if config.file_hashes_zero_timestamp.contains(file_hash) => 0,
        None => return Err(Error::MissingTimestamp),
    };

    let size = as_u64(attr, "size")?;
    let md5 = Md5Digest::from_hex(as_str(attr, "md5")?).map_err(|_| Error::MissingField("md5"))?;
    let sha1 = Sha1Digest::from_hex(as_str(attr, "sha1")?).map_err(|_| Error::MissingField("sha1"))?;
    let sha256 = Sha256Digest::from_hex(as_str(attr, "sha256")?).map_err(|_| Error::MissingField("sha256"))?;
    let machine_type = as_u64(pe_info, "machine_type")? as u32;

    let has_signature_overlay = match pe_info.get("overlay").and_then(|o| o.get("size")).and_then(Value::as_u64) {
        None => false,
        Some(overlay_size) if overlay_size < 0x20 => false,
        Some(_) if config.file_hashes_unsigned_with_overlay.contains(file_hash) => false,
        Some(_) => true,
    };

    let mut signing_status = SigningStatus::Unsigned;
    let mut signature_type = None;
    let mut signing_date = None;
    let mut version = None;
    let mut description = None;
    let mut file_signed = false;

    if let Some(signature_info) = attr.get("signature_info") {
        version = signature_info.get("file version").and_then(Value::as_str).map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
        description = signature_info.get("description").and_then(Value::as_str).map(|s| s.trim().to_string()).filter(|s| !s.is_empty());

        let mut signing_date_reliable = false;
        if let Some(verified) = signature_info.get("verified").and_then(Value::as_str) {
            signing_status = match verified {
                "Signed" => {
                    signing_date_reliable = true;
                    SigningStatus::Signed
                }
                "Unsigned" => SigningStatus::Unsigned,
                _ => SigningStatus::Unknown,
            };
            signature_type = Some(if has_signature_overlay { "Overlay".to_string() } else { "Catalog file".to_string() });
            file_signed = true;
        }

        if has_signature_overlay && signing_date_reliable {
            if let Some(raw_date) = signature_info.get("signing date").and_then(Value::as_str) {
                signing_date = Some(parse_signing_date(raw_date)?);
            }
        }
    }

    if has_signature_overlay && !file_signed {
        return Err(Error::SignedWithoutSignatureInfo);
    }

    Ok(FileInfo::VtOrFile {
        size,
        md5,
        sha1,
        sha256,
        machine_type,
        timestamp,
        virtual_size,
        signing_status,
        signature_type,
        signing_date: signing_date.map(|d| vec![d]).filter(|v: &Vec<String>| !v.is_empty()).map(|v| v.join(",")),
        version,
        description,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_response() -> Value {
        serde_json::json!({
            "data": {
                "attributes": {
                    "size": 4096,
                    "md5": "d41d8cd98f00b204e9800998ecf8427e",
                    "sha1": "da39a3ee5e6b4b0d3255bfef95601890afd80709",
                    "sha256": "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b85",
                    "pe_info": {
                        "machine_type": 34404,
                        "timestamp": 0x60000000,
                        "sections": [
                            {"virtual_address": 0x1000, "virtual_size": 0x2000},
                            {"virtual_address": 0x3000, "virtual_size": 0x1000}
                        ]
                    }
                }
            }
        })
    }

    #[test]
    fn extracts_unsigned_file_info_from_minimal_response() {
        let config = Config::default();
        let response = sample_response();
        let info = file_info_from_response(&config, "e3b0c4", &response).unwrap();
        match info {
            FileInfo::VtOrFile { virtual_size, signing_status, .. } => {
                assert_eq!(virtual_size, 0x4000);
                assert_eq!(signing_status, SigningStatus::Unsigned);
            }
            _ => panic!("expected VtOrFile"),
        }
    }
}
