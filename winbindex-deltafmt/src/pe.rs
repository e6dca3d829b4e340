use std::fs;
use std::path::Path;

use chrono::NaiveDateTime;
use const_oid::ObjectIdentifier;
use der::{Decode, SliceReader};

use crate::Error;

const MZ_MAGIC: &[u8; 2] = b"MZ";
const PE_SIGNATURE: &[u8; 4] = b"PE\0\0";
const E_LFANEW_OFFSET: usize = 0x3c;
const MACHINE_OFFSET: usize = 4;
const TIMESTAMP_OFFSET: usize = 8;
const SIZE_OF_IMAGE_OFFSET: usize = 0x50;

/// The raw COFF/optional-header fields §4.D.2 names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeHeader {
    pub machine_type: u16,
    pub timestamp: u32,
    pub virtual_size: u32,
}

/// Result of the full D.2 operation: the header fields, plus whatever
/// version-resource strings and embedded-signature signing times could be
/// recovered.
#[derive(Debug, Clone)]
pub struct PeMetadata {
    pub header: PeHeader,
    pub file_version: Option<String>,
    pub file_description: Option<String>,
    pub signing_times: Vec<SigningInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigningTimeSource {
    /// The primary SignerInfo's `signingTime` authenticated attribute.
    Embedded,
    /// A nested countersignature over the primary signature.
    Countersignature,
    /// An RFC 3161 timestamp token carried as an unsigned attribute.
    Rfc3161Timestamp,
}

#[derive(Debug, Clone)]
pub struct SigningInfo {
    pub source: SigningTimeSource,
    /// isoformat, without a timezone suffix, per §4.D.2.
    pub signing_date: String,
}

const OID_SIGNING_TIME: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.5");
const OID_COUNTER_SIGNATURE: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.6");
const OID_RFC3161_TIMESTAMP_TOKEN: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.16.2.14");

/// Reads PE header fields, the version resource, and embedded Authenticode
/// signing times from a file on disk.
pub struct PeExtractor;

impl PeExtractor {
    pub fn parse_file(path: &Path) -> Result<PeMetadata, Error> {
        let data = fs::read(path).map_err(Error::ReadFile)?;
        Self::parse_bytes(&data)
    }

    pub fn parse_bytes(data: &[u8]) -> Result<PeMetadata, Error> {
        let header = Self::parse_header(data)?;

        let (file_version, file_description) = Self::parse_version_resource(data);
        let signing_times = Self::parse_signing_times(data).unwrap_or_default();

        Ok(PeMetadata {
            header,
            file_version,
            file_description,
            signing_times,
        })
    }

    /// Parses just the MZ/PE/COFF fields named in §4.D.2, without touching
    /// resources or certificates.
    pub fn parse_header(data: &[u8]) -> Result<PeHeader, Error> {
        if data.len() < 0x40 {
            return Err(Error::TooShortForMz(data.len()));
        }
        if &data[0..2] != MZ_MAGIC {
            return Err(Error::NotMz);
        }

        let e_lfanew = u32::from_le_bytes(data[E_LFANEW_OFFSET..E_LFANEW_OFFSET + 4].try_into().unwrap());
        let pe_off = e_lfanew as usize;

        if pe_off + SIZE_OF_IMAGE_OFFSET + 4 > data.len() {
            return Err(Error::LfanewOutOfBounds(e_lfanew));
        }
        if &data[pe_off..pe_off + 4] != PE_SIGNATURE {
            return Err(Error::BadPeSignature);
        }

        let machine_type = u16::from_le_bytes(data[pe_off + MACHINE_OFFSET..pe_off + MACHINE_OFFSET + 2].try_into().unwrap());
        let timestamp = u32::from_le_bytes(data[pe_off + TIMESTAMP_OFFSET..pe_off + TIMESTAMP_OFFSET + 4].try_into().unwrap());
        let virtual_size = u32::from_le_bytes(data[pe_off + SIZE_OF_IMAGE_OFFSET..pe_off + SIZE_OF_IMAGE_OFFSET + 4].try_into().unwrap());

        Ok(PeHeader {
            machine_type,
            timestamp,
            virtual_size,
        })
    }

    /// Picks a translation with the fallback order from §4.D.2 (first
    /// language / (first, 1252) / (1033, 1252) / (1033, first codepage))
    /// and returns `(FileVersion, FileDescription)`.
    fn parse_version_resource(data: &[u8]) -> (Option<String>, Option<String>) {
        let file = match pelite::PeFile::from_bytes(data) {
            Ok(file) => file,
            Err(_) => return (None, None),
        };
        let resources = match file.resources() {
            Ok(r) => r,
            Err(_) => return (None, None),
        };
        let version_info = match resources.version_info() {
            Ok(vi) => vi,
            Err(_) => return (None, None),
        };

        let translations = version_info.translation();
        let chosen = translations
            .first()
            .copied()
            .or(Some(pelite::resources::version_info::Language {
                lang_id: 1033,
                charset_id: 1252,
            }))
            .map(|first| {
                [
                    first,
                    pelite::resources::version_info::Language {
                        lang_id: first.lang_id,
                        charset_id: 1252,
                    },
                    pelite::resources::version_info::Language {
                        lang_id: 1033,
                        charset_id: 1252,
                    },
                    pelite::resources::version_info::Language {
                        lang_id: 1033,
                        charset_id: first.charset_id,
                    },
                ]
            });

        let Some(candidates) = chosen else {
            return (None, None);
        };

        for lang in candidates {
            let strings = version_info.strings(lang);
            if strings.is_empty() {
                continue;
            }
            let file_version = strings.get("FileVersion").map(|s| s.to_string());
            let file_description = strings.get("FileDescription").map(|s| s.to_string());
            if file_version.is_some() || file_description.is_some() {
                return (file_version, file_description);
            }
        }

        (None, None)
    }

    /// Walks IMAGE_DIRECTORY_ENTRY_SECURITY and attempts to recover a
    /// signing time from every embedded WIN_CERTIFICATE blob: the primary
    /// signer's own `signingTime`, any nested countersignature, and any
    /// RFC 3161 timestamp token.
    fn parse_signing_times(data: &[u8]) -> Option<Vec<SigningInfo>> {
        let file = pelite::PeFile::from_bytes(data).ok()?;
        let security_dir = file.data_directory(pelite::image::IMAGE_DIRECTORY_ENTRY_SECURITY)?;
        if security_dir.VirtualAddress == 0 || security_dir.Size == 0 {
            return Some(Vec::new());
        }

        let mut offset = security_dir.VirtualAddress as usize;
        let end = offset + security_dir.Size as usize;
        let mut out = Vec::new();

        while offset + 8 <= end && offset + 8 <= data.len() {
            let entry_len = u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap()) as usize;
            let cert_type = u16::from_le_bytes(data[offset + 6..offset + 8].try_into().unwrap());

            if entry_len < 8 || offset + entry_len > data.len() {
                break;
            }

            // WIN_CERT_TYPE_PKCS_SIGNED_DATA
            if cert_type == 0x0002 {
                let cert_bytes = &data[offset + 8..offset + entry_len];
                if let Ok(mut signed) = extract_signing_times(cert_bytes) {
                    out.append(&mut signed);
                }
            }

            // Entries are 8-byte aligned.
            offset += (entry_len + 7) & !7;
        }

        Some(out)
    }
}

fn extract_signing_times(cert_der: &[u8]) -> Result<Vec<SigningInfo>, Error> {
    use cms::content_info::ContentInfo;
    use cms::signed_data::SignedData;

    let mut reader = SliceReader::new(cert_der)?;
    let content_info = ContentInfo::decode(&mut reader)?;
    let signed_data = content_info.content.decode_as::<SignedData>()?;

    let mut out = Vec::new();

    for signer_info in signed_data.signer_infos.0.iter() {
        if let Some(signed_attrs) = &signer_info.signed_attrs {
            if let Some(time) = find_time_attribute(signed_attrs.iter(), OID_SIGNING_TIME) {
                out.push(SigningInfo {
                    source: SigningTimeSource::Embedded,
                    signing_date: time,
                });
            }
        }

        if let Some(unsigned_attrs) = &signer_info.unsigned_attrs {
            for attr in unsigned_attrs.iter() {
                if attr.oid == OID_COUNTER_SIGNATURE {
                    for value in attr.values.iter() {
                        if let Ok(countersigner) = value.decode_as::<cms::signed_data::SignerInfo>() {
                            if let Some(csigned) = &countersigner.signed_attrs {
                                if let Some(time) = find_time_attribute(csigned.iter(), OID_SIGNING_TIME) {
                                    out.push(SigningInfo {
                                        source: SigningTimeSource::Countersignature,
                                        signing_date: time,
                                    });
                                }
                            }
                        }
                    }
                } else if attr.oid == OID_RFC3161_TIMESTAMP_TOKEN {
                    for value in attr.values.iter() {
                        if let Ok(bytes) = value.value() {
                            if let Some(time) = parse_timestamp_token(bytes.as_bytes().unwrap_or_default()) {
                                out.push(SigningInfo {
                                    source: SigningTimeSource::Rfc3161Timestamp,
                                    signing_date: time,
                                });
                            }
                        }
                    }
                }
            }
        }
    }

    Ok(out)
}

fn find_time_attribute<'a, I>(attrs: I, oid: ObjectIdentifier) -> Option<String>
where
    I: Iterator<Item = &'a cms::attr::Attribute>,
{
    for attr in attrs {
        if attr.oid != oid {
            continue;
        }
        for value in attr.values.iter() {
            if let Some(t) = decode_time_value(value) {
                return Some(t);
            }
        }
    }
    None
}

fn decode_time_value(value: &der::Any) -> Option<String> {
    if let Ok(utc) = value.decode_as::<der::asn1::UtcTime>() {
        return Some(format_naive(utc.to_date_time().unix_duration().as_secs() as i64));
    }
    if let Ok(gt) = value.decode_as::<der::asn1::GeneralizedTime>() {
        return Some(format_naive(gt.to_date_time().unix_duration().as_secs() as i64));
    }
    None
}

fn format_naive(unix_secs: i64) -> String {
    NaiveDateTime::from_timestamp_opt(unix_secs, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%S").to_string())
        .unwrap_or_default()
}

fn parse_timestamp_token(der_bytes: &[u8]) -> Option<String> {
    use cms::content_info::ContentInfo;
    use cms::signed_data::SignedData;

    let mut reader = SliceReader::new(der_bytes).ok()?;
    let content_info = ContentInfo::decode(&mut reader).ok()?;
    let signed_data = content_info.content.decode_as::<SignedData>().ok()?;

    // TSTInfo is carried as the encapsulated content; genTime is the 5th
    // field (after version, policy, messageImprint, serialNumber). Rather
    // than hand-roll its ASN.1 grammar we look for a GeneralizedTime
    // anywhere in the encapsulated content, which is all this field is.
    let content = signed_data.encap_content_info.econtent?;
    let content_bytes = content.value();
    find_generalized_time(content_bytes)
}

fn find_generalized_time(bytes: &[u8]) -> Option<String> {
    // GeneralizedTime values are tagged 0x18 and YYYYMMDDHHMMSSZ-shaped;
    // scan for the tag and attempt a direct decode at each candidate.
    for idx in 0..bytes.len() {
        if bytes[idx] == 0x18 {
            if let Ok(mut reader) = SliceReader::new(&bytes[idx..]) {
                if let Ok(gt) = der::asn1::GeneralizedTime::decode(&mut reader) {
                    return Some(format_naive(gt.to_date_time().unix_duration().as_secs() as i64));
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_pe(machine: u16, timestamp: u32, size_of_image: u32) -> Vec<u8> {
        let mut buf = vec![0u8; 0x200];
        buf[0..2].copy_from_slice(MZ_MAGIC);
        let pe_off: usize = 0x80;
        buf[E_LFANEW_OFFSET..E_LFANEW_OFFSET + 4].copy_from_slice(&(pe_off as u32).to_le_bytes());
        buf[pe_off..pe_off + 4].copy_from_slice(PE_SIGNATURE);
        buf[pe_off + MACHINE_OFFSET..pe_off + MACHINE_OFFSET + 2].copy_from_slice(&machine.to_le_bytes());
        buf[pe_off + TIMESTAMP_OFFSET..pe_off + TIMESTAMP_OFFSET + 4].copy_from_slice(&timestamp.to_le_bytes());
        buf[pe_off + SIZE_OF_IMAGE_OFFSET..pe_off + SIZE_OF_IMAGE_OFFSET + 4].copy_from_slice(&size_of_image.to_le_bytes());
        buf
    }

    // S2 from spec.md §8.
    #[test]
    fn parses_header_fields() {
        let buf = minimal_pe(34404, 0x60000000, 0x40000);
        let header = PeExtractor::parse_header(&buf).unwrap();
        assert_eq!(header.machine_type, 34404);
        assert_eq!(header.timestamp, 0x60000000);
        assert_eq!(header.virtual_size, 0x40000);
    }

    #[test]
    fn rejects_non_mz() {
        let buf = vec![0u8; 0x100];
        assert!(matches!(PeExtractor::parse_header(&buf), Err(Error::NotMz)));
    }

    #[test]
    fn rejects_too_short() {
        assert!(matches!(PeExtractor::parse_header(&[0u8; 4]), Err(Error::TooShortForMz(4))));
    }
}
