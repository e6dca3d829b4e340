use std::collections::HashMap;
use std::fs;
use std::path::Path;

use winbindex_hash::{Md5Digest, Sha256Digest};

use crate::Error;

/// The digest carried by a `*.dd.txt` descriptor, tagged by the algorithm
/// `HashAlgorithm` named.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DescriptorHash {
    Md5(Md5Digest),
    Sha256(Sha256Digest),
}

/// Everything `DeltaDescriptor::parse` was able to recover from a
/// `<manifest stem>/f/<name>.dd.txt` sidecar file.
#[derive(Debug, Clone)]
pub enum DeltaDescriptorInfo {
    /// `Code: Raw` — the payload is a full copy, not an actual reverse
    /// delta, so none of the PE-shape fields below apply.
    Raw {
        size: u64,
        hash: DescriptorHash,
    },
    /// A real reverse-differential, decoded into the `delta` completeness
    /// tier fields from §3.
    Delta {
        size: u64,
        hash: DescriptorHash,
        machine_type: u32,
        timestamp: u32,
        last_section_virtual_address: u64,
        last_section_pointer_to_raw_data: u64,
    },
}

pub struct DeltaDescriptor;

impl DeltaDescriptor {
    pub fn parse_file(path: &Path) -> Result<Option<DeltaDescriptorInfo>, Error> {
        let text = fs::read_to_string(path).map_err(Error::ReadFile)?;
        Self::parse_str(&text)
    }

    pub fn parse_str(text: &str) -> Result<Option<DeltaDescriptorInfo>, Error> {
        let mut fields: HashMap<&str, &str> = HashMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some((key, value)) = line.split_once(':') {
                fields.insert(key.trim(), value.trim());
            }
        }

        let code = *fields.get("Code").ok_or(Error::MissingKey("Code"))?;
        let hash_algorithm = *fields.get("HashAlgorithm").ok_or(Error::MissingKey("HashAlgorithm"))?;
        let hash_value = *fields.get("Hash").ok_or(Error::MissingKey("Hash"))?;
        let target_size = *fields.get("TargetSize").ok_or(Error::MissingKey("TargetSize"))?;

        let size = parse_int(target_size).ok_or_else(|| Error::MalformedInt("TargetSize", target_size.to_string()))?;

        let hash = match hash_algorithm {
            "CALG_MD5" => DescriptorHash::Md5(Md5Digest::from_hex(hash_value).map_err(|_| Error::MalformedInt("Hash", hash_value.to_string()))?),
            "CALG_SHA_256" => DescriptorHash::Sha256(Sha256Digest::from_hex(hash_value).map_err(|_| Error::MalformedInt("Hash", hash_value.to_string()))?),
            other => return Err(Error::UnknownHashAlgorithm(other.to_string())),
        };

        if code == "Raw" {
            return Ok(Some(DeltaDescriptorInfo::Raw {
                size,
                hash,
            }));
        }

        let machine_type = machine_type_for_code(code).ok_or_else(|| Error::UnknownCode(code.to_string()))?;

        let timestamp_str = *fields.get("TimeStamp").ok_or(Error::MissingKey("TimeStamp"))?;
        let timestamp = parse_int(timestamp_str).ok_or_else(|| Error::MalformedInt("TimeStamp", timestamp_str.to_string()))? as u32;

        let rift_table = *fields.get("RiftTable").ok_or(Error::MissingKey("RiftTable"))?;
        if rift_table == "(none)" {
            // A real delta with no recorded section geometry carries no
            // usable shape information at all; skip it rather than fake a
            // Raw record out of its size/hash.
            return Ok(None);
        }

        let last_tuple = rift_table.rsplit(';').next().ok_or_else(|| Error::MalformedRiftTable(rift_table.to_string()))?;
        let (va_str, ptr_str) = last_tuple.split_once(',').ok_or_else(|| Error::MalformedRiftTable(rift_table.to_string()))?;
        let last_section_virtual_address = parse_int(va_str.trim()).ok_or_else(|| Error::MalformedRiftTable(rift_table.to_string()))?;
        let last_section_pointer_to_raw_data = parse_int(ptr_str.trim()).ok_or_else(|| Error::MalformedRiftTable(rift_table.to_string()))?;

        Ok(Some(DeltaDescriptorInfo::Delta {
            size,
            hash,
            machine_type,
            timestamp,
            last_section_virtual_address,
            last_section_pointer_to_raw_data,
        }))
    }
}

fn machine_type_for_code(code: &str) -> Option<u32> {
    Some(match code {
        "CLI4_I386" => 332,
        "CLI4_AMD64" => 34404,
        "CLI4_ARM" => 452,
        "CLI4_ARM64" => 43620,
        _ => return None,
    })
}

fn parse_int(s: &str) -> Option<u64> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_raw_descriptor() {
        let text = "Code: Raw\nHashAlgorithm: CALG_SHA_256\nHash: ".to_string() + &"aa".repeat(32) + "\nTargetSize: 100000\nTimeStamp: 0x0\nRiftTable: (none)\n";
        let info = DeltaDescriptor::parse_str(&text).unwrap();
        match info {
            Some(DeltaDescriptorInfo::Raw {
                size,
                ..
            }) => assert_eq!(size, 100000),
            _ => panic!("expected Raw"),
        }
    }

    // S3 from spec.md §8.
    #[test]
    fn parses_delta_descriptor() {
        let hash = "bb".repeat(16);
        let text = format!("Code: CLI4_AMD64\nHashAlgorithm: CALG_MD5\nHash: {hash}\nTargetSize: 100000\nTimeStamp: 0x60000000\nRiftTable: 0,0;0x30000,0x20000\n");
        let info = DeltaDescriptor::parse_str(&text).unwrap();
        match info {
            Some(DeltaDescriptorInfo::Delta {
                size,
                machine_type,
                timestamp,
                last_section_virtual_address,
                last_section_pointer_to_raw_data,
                ..
            }) => {
                assert_eq!(size, 100000);
                assert_eq!(machine_type, 34404);
                assert_eq!(timestamp, 0x60000000);
                assert_eq!(last_section_virtual_address, 0x30000);
                assert_eq!(last_section_pointer_to_raw_data, 0x20000);
            }
            _ => panic!("expected Delta"),
        }
    }

    // A "(none)" RiftTable means the descriptor carries no usable shape
    // information at all, per spec.md §4.D — it must not be reported as a
    // data-carrying Raw record.
    #[test]
    fn rift_table_none_is_skipped() {
        let hash = "cc".repeat(32);
        let text = format!("Code: CLI4_I386\nHashAlgorithm: CALG_SHA_256\nHash: {hash}\nTargetSize: 42\nTimeStamp: 0x1\nRiftTable: (none)\n");
        let info = DeltaDescriptor::parse_str(&text).unwrap();
        assert!(info.is_none());
    }

    #[test]
    fn unknown_code_is_rejected() {
        let hash = "dd".repeat(32);
        let text = format!("Code: CLI4_MIPS\nHashAlgorithm: CALG_SHA_256\nHash: {hash}\nTargetSize: 1\nTimeStamp: 0x1\nRiftTable: 0,0\n");
        assert!(matches!(DeltaDescriptor::parse_str(&text), Err(Error::UnknownCode(_))));
    }
}
