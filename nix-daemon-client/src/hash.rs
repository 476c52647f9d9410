//! Named digests: a hash value tagged with its algorithm.
//!
//! The daemon never computes hashes for us and we never compute them for it;
//! both sides just ship digests around as text. A digest travels either as
//! `algo:digits` (content addresses, derivation outputs) or as bare digits
//! with the algorithm implied by context (the NAR hash in a path-info
//! reply). The digit string may be base-16 or the nix base-32 alphabet; the
//! length tells them apart.

use std::fmt;

use crate::base32::{self, Base32DecodeError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HashAlgo {
    Md5,
    Sha1,
    Sha256,
    Sha512,
}

impl HashAlgo {
    pub fn name(&self) -> &'static str {
        match self {
            HashAlgo::Md5 => "md5",
            HashAlgo::Sha1 => "sha1",
            HashAlgo::Sha256 => "sha256",
            HashAlgo::Sha512 => "sha512",
        }
    }

    pub fn parse(name: &str) -> Result<Self, ParseHashError> {
        match name {
            "md5" => Ok(HashAlgo::Md5),
            "sha1" => Ok(HashAlgo::Sha1),
            "sha256" => Ok(HashAlgo::Sha256),
            "sha512" => Ok(HashAlgo::Sha512),
            _ => Err(ParseHashError::UnknownAlgorithm(name.to_owned())),
        }
    }

    pub fn digest_size(&self) -> usize {
        match self {
            HashAlgo::Md5 => 16,
            HashAlgo::Sha1 => 20,
            HashAlgo::Sha256 => 32,
            HashAlgo::Sha512 => 64,
        }
    }

    pub fn base16_len(&self) -> usize {
        self.digest_size() * 2
    }

    pub fn base32_len(&self) -> usize {
        base32::encoded_len(self.digest_size())
    }
}

impl fmt::Display for HashAlgo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A digest together with the algorithm that produced it.
#[derive(Clone, PartialEq, Eq)]
pub struct Hash {
    algo: HashAlgo,
    digest: Vec<u8>,
}

impl Hash {
    pub fn new(algo: HashAlgo, digest: Vec<u8>) -> Result<Self, ParseHashError> {
        if digest.len() != algo.digest_size() {
            return Err(ParseHashError::WrongDigestLength {
                algo: algo.name(),
                len: digest.len(),
            });
        }
        Ok(Hash { algo, digest })
    }

    /// Parses `algo:digits` with the digit encoding decided by length.
    pub fn parse(s: &str) -> Result<Self, ParseHashError> {
        let (name, digits) = s
            .split_once(':')
            .ok_or_else(|| ParseHashError::MissingAlgorithm(s.to_owned()))?;
        let algo = HashAlgo::parse(name)?;
        if digits.len() == algo.base16_len() {
            Self::from_base16(algo, digits)
        } else {
            Self::from_base32(algo, digits.as_bytes())
        }
    }

    pub fn from_base16(algo: HashAlgo, digits: &str) -> Result<Self, ParseHashError> {
        Self::new(algo, hex::decode(digits)?)
    }

    pub fn from_base32(algo: HashAlgo, digits: &[u8]) -> Result<Self, ParseHashError> {
        if digits.len() != algo.base32_len() {
            return Err(ParseHashError::WrongDigestLength {
                algo: algo.name(),
                len: digits.len(),
            });
        }
        Self::new(algo, base32::decode(digits)?)
    }

    pub fn algo(&self) -> HashAlgo {
        self.algo
    }

    pub fn digest(&self) -> &[u8] {
        &self.digest
    }

    pub fn to_base32(&self) -> String {
        base32::encode(&self.digest)
    }

    pub fn to_base16(&self) -> String {
        hex::encode(&self.digest)
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algo, self.to_base32())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ParseHashError {
    #[error("unknown hash algorithm {0:?}")]
    UnknownAlgorithm(String),
    #[error("hash {0:?} has no algorithm prefix")]
    MissingAlgorithm(String),
    #[error("wrong digest length {len} for {algo}")]
    WrongDigestLength { algo: &'static str, len: usize },
    #[error(transparent)]
    Base32(#[from] Base32DecodeError),
    #[error(transparent)]
    Base16(#[from] hex::FromHexError),
}
