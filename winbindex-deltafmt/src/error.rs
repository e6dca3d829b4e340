use std::fmt;
use std::io;

#[derive(Debug)]
pub enum Error {
    OpenFile(io::Error),
    ReadFile(io::Error),
    MissingKey(&'static str),
    MalformedInt(&'static str, String),
    UnknownHashAlgorithm(String),
    UnknownCode(String),
    MalformedRiftTable(String),
    TooShortForMz(usize),
    NotMz,
    LfanewOutOfBounds(u32),
    BadPeSignature,
    SecurityDirectoryOutOfBounds,
    Der(der::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::OpenFile(err) => write!(f, "failed to open file: {err}"),
            Error::ReadFile(err) => write!(f, "failed to read file: {err}"),
            Error::MissingKey(key) => write!(f, "delta descriptor missing required key {key:?}"),
            Error::MalformedInt(key, val) => write!(f, "delta descriptor key {key:?} has malformed value {val:?}"),
            Error::UnknownHashAlgorithm(algo) => write!(f, "unknown delta descriptor hash algorithm {algo:?}"),
            Error::UnknownCode(code) => write!(f, "unknown delta descriptor code {code:?}"),
            Error::MalformedRiftTable(table) => write!(f, "malformed RiftTable {table:?}"),
            Error::TooShortForMz(len) => write!(f, "file is only {len} bytes, too short for an MZ header"),
            Error::NotMz => write!(f, "file does not start with the MZ magic"),
            Error::LfanewOutOfBounds(off) => write!(f, "e_lfanew {off:#x} is out of bounds"),
            Error::BadPeSignature => write!(f, "missing PE\\0\\0 signature at e_lfanew"),
            Error::SecurityDirectoryOutOfBounds => write!(f, "IMAGE_DIRECTORY_ENTRY_SECURITY points outside the file"),
            Error::Der(err) => write!(f, "failed to parse embedded signed data: {err}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<der::Error> for Error {
    fn from(err: der::Error) -> Self {
        Error::Der(err)
    }
}
