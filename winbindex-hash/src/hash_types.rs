use std::fmt;
use std::str;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

#[derive(PartialEq, Eq, Clone, Copy)]
pub struct Md5;

#[derive(PartialEq, Eq, Clone, Copy)]
pub struct Sha1;

#[derive(PartialEq, Eq, Clone, Copy)]
pub struct Sha256;

pub trait HashAlgo {
    const HASH_NAME: &'static str;

    type Output: AsRef<[u8]> + AsMut<[u8]> + Default + Sized + Eq + Clone;

    fn digest(data: &[u8]) -> Self::Output;
}

impl HashAlgo for Md5 {
    const HASH_NAME: &'static str = "Md5";
    type Output = [u8; 16];

    fn digest(data: &[u8]) -> Self::Output {
        use md5::{Digest, Md5 as Md5Hasher};
        Md5Hasher::digest(data).into()
    }
}

impl HashAlgo for Sha1 {
    const HASH_NAME: &'static str = "Sha1";
    type Output = [u8; 20];

    fn digest(data: &[u8]) -> Self::Output {
        use sha1::{Digest, Sha1 as Sha1Hasher};
        Sha1Hasher::digest(data).into()
    }
}

impl HashAlgo for Sha256 {
    const HASH_NAME: &'static str = "Sha256";
    type Output = [u8; 32];

    fn digest(data: &[u8]) -> Self::Output {
        use sha2::{Digest, Sha256 as Sha256Hasher};
        Sha256Hasher::digest(data).into()
    }
}

/// A digest of a known algorithm, printed and parsed as lower-case hex, the
/// form every hash field in the grouped-index JSON document uses.
#[derive(PartialEq, Eq, Clone)]
pub struct Hash<T: HashAlgo>(T::Output);

pub type Md5Digest = Hash<Md5>;
pub type Sha1Digest = Hash<Sha1>;
pub type Sha256Digest = Hash<Sha256>;

impl<T: HashAlgo> Hash<T> {
    pub fn from_bytes(digest: T::Output) -> Self {
        Self(digest)
    }

    pub fn of(data: &[u8]) -> Self {
        Self(T::digest(data))
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_ref()
    }
}

impl<T: HashAlgo> fmt::Debug for Hash<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash<{}>({})", T::HASH_NAME, hex::encode(self.0.as_ref()))
    }
}

impl<T: HashAlgo> fmt::Display for Hash<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0.as_ref()))
    }
}

impl<T: HashAlgo> str::FromStr for Hash<T> {
    type Err = hex::FromHexError;

    fn from_str(hash_hex: &str) -> Result<Self, Self::Err> {
        Self::from_hex(hash_hex)
    }
}

impl<T: HashAlgo> Hash<T> {
    pub fn from_hex(hash_hex: &str) -> Result<Self, hex::FromHexError> {
        let mut digest = T::Output::default();
        hex::decode_to_slice(hash_hex, digest.as_mut())?;
        Ok(Self(digest))
    }
}

impl<T: HashAlgo> Serialize for Hash<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de, T: HashAlgo> Deserialize<'de> for Hash<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}
