//! Store paths and the store directory they are printed under.
//!
//! A store path is a pair of a 20-byte hash and a name; it only becomes a
//! filesystem path relative to some store directory:
//!
//! ```text
//! /nix/store/g1w7hy3qg1w7hy3qg1w7hy3qg1w7hy3q-foo-1.2
//! └────┬────┘ └──────────────┬──────────────┘ └──┬──┘
//!   StoreDir        base-32 hash part           name
//! ```
//!
//! The wire always carries the printed form, so the store directory
//! negotiated at connection time is needed to make sense of every path in
//! every message.

use std::fmt;

use crate::base32::{self, Base32DecodeError};

/// Size of a store-path hash part, in bytes. Printed as 32 base-32 digits.
pub const STORE_PATH_HASH_SIZE: usize = 20;

const NAME_MAX_LEN: usize = 211;

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum StorePathError {
    #[error("store directory {0:?} is not an absolute path")]
    BadStoreDir(String),
    #[error("path {0:?} does not live in this store")]
    NotInStore(String),
    #[error("malformed hash part: {0}")]
    BadHashPart(#[from] Base32DecodeError),
    #[error("hash part has length {0}, expected 32 digits")]
    BadHashLength(usize),
    #[error("invalid store path name {0:?}")]
    BadName(String),
}

/// The fixed-size hash part of a store path.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StorePathHash([u8; STORE_PATH_HASH_SIZE]);

impl StorePathHash {
    pub fn new(bytes: [u8; STORE_PATH_HASH_SIZE]) -> Self {
        StorePathHash(bytes)
    }

    pub fn from_base32(digits: &[u8]) -> Result<Self, StorePathError> {
        if digits.len() != base32::encoded_len(STORE_PATH_HASH_SIZE) {
            return Err(StorePathError::BadHashLength(digits.len()));
        }
        let bytes = base32::decode(digits)?;
        let mut out = [0; STORE_PATH_HASH_SIZE];
        out.copy_from_slice(&bytes);
        Ok(StorePathHash(out))
    }

    pub fn as_bytes(&self) -> &[u8; STORE_PATH_HASH_SIZE] {
        &self.0
    }

    pub fn to_base32(&self) -> String {
        base32::encode(&self.0)
    }
}

impl fmt::Debug for StorePathHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base32())
    }
}

/// The name part of a store path: what comes after the dash.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StorePathName(String);

impl StorePathName {
    pub fn new(name: &str) -> Result<Self, StorePathError> {
        let ok = !name.is_empty()
            && name.len() <= NAME_MAX_LEN
            && !name.starts_with('.')
            && name.bytes().all(|b| {
                b.is_ascii_alphanumeric() || matches!(b, b'+' | b'-' | b'.' | b'_' | b'?' | b'=')
            });
        if !ok {
            return Err(StorePathError::BadName(name.to_owned()));
        }
        Ok(StorePathName(name.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for StorePathName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for StorePathName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A store path, independent of any store directory.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StorePath {
    hash: StorePathHash,
    name: StorePathName,
}

impl StorePath {
    pub fn new(hash: StorePathHash, name: StorePathName) -> Self {
        StorePath { hash, name }
    }

    pub fn hash(&self) -> &StorePathHash {
        &self.hash
    }

    pub fn name(&self) -> &StorePathName {
        &self.name
    }
}

impl fmt::Debug for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.hash.to_base32(), self.name)
    }
}

/// The absolute directory every store path of a connection is rooted at.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreDir(String);

impl StoreDir {
    pub fn new(dir: &str) -> Result<Self, StorePathError> {
        if !dir.starts_with('/') || dir.len() > 1 && dir.ends_with('/') {
            return Err(StorePathError::BadStoreDir(dir.to_owned()));
        }
        Ok(StoreDir(dir.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Prints a store path in its absolute, on-the-wire form.
    pub fn display_path(&self, path: &StorePath) -> String {
        format!("{}/{}-{}", self.0, path.hash.to_base32(), path.name)
    }

    /// Parses the absolute form back into a [`StorePath`].
    pub fn parse_path(&self, path: &[u8]) -> Result<StorePath, StorePathError> {
        let lossy = || String::from_utf8_lossy(path).into_owned();

        let rest = path
            .strip_prefix(self.0.as_bytes())
            .and_then(|p| p.strip_prefix(b"/"))
            .ok_or_else(|| StorePathError::NotInStore(lossy()))?;

        let digits = base32::encoded_len(STORE_PATH_HASH_SIZE);
        if rest.len() < digits + 1 || rest[digits] != b'-' {
            return Err(StorePathError::NotInStore(lossy()));
        }
        let hash = StorePathHash::from_base32(&rest[..digits])?;
        let name = std::str::from_utf8(&rest[digits + 1..])
            .map_err(|_| StorePathError::BadName(lossy()))
            .and_then(StorePathName::new)?;
        Ok(StorePath::new(hash, name))
    }
}

impl Default for StoreDir {
    fn default() -> Self {
        StoreDir("/nix/store".to_owned())
    }
}

impl fmt::Display for StoreDir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_dir() -> StoreDir {
        StoreDir::default()
    }

    #[test]
    fn print_parse_round_trip() {
        let dir = store_dir();
        let path = StorePath::new(
            StorePathHash::from_base32(b"g1w7hy3qg1w7hy3qg1w7hy3qg1w7hy3q").unwrap(),
            StorePathName::new("foo-1.2").unwrap(),
        );
        let printed = dir.display_path(&path);
        assert_eq!(printed, "/nix/store/g1w7hy3qg1w7hy3qg1w7hy3qg1w7hy3q-foo-1.2");
        assert_eq!(dir.parse_path(printed.as_bytes()).unwrap(), path);
    }

    #[test]
    fn parse_rejects_foreign_dir() {
        let err = store_dir()
            .parse_path(b"/gnu/store/g1w7hy3qg1w7hy3qg1w7hy3qg1w7hy3q-foo")
            .unwrap_err();
        assert!(matches!(err, StorePathError::NotInStore(_)));
    }

    #[test]
    fn parse_rejects_short_leaf() {
        let err = store_dir().parse_path(b"/nix/store/abc-foo").unwrap_err();
        assert!(matches!(err, StorePathError::NotInStore(_)));
    }

    #[test]
    fn parse_rejects_bad_hash_digits() {
        // 'e' is not in the alphabet.
        let err = store_dir()
            .parse_path(b"/nix/store/e1w7hy3qg1w7hy3qg1w7hy3qg1w7hy3q-foo")
            .unwrap_err();
        assert!(matches!(err, StorePathError::BadHashPart(_)));
    }

    #[test]
    fn name_rules() {
        assert!(StorePathName::new("foo-1.2_b+c?d=e").is_ok());
        assert!(StorePathName::new("").is_err());
        assert!(StorePathName::new(".hidden").is_err());
        assert!(StorePathName::new("with space").is_err());
        assert!(StorePathName::new("tabs\there").is_err());
        assert!(StorePathName::new(&"x".repeat(212)).is_err());
        assert!(StorePathName::new(&"x".repeat(211)).is_ok());
    }

    #[test]
    fn store_dir_rules() {
        assert!(StoreDir::new("/nix/store").is_ok());
        assert!(StoreDir::new("relative/store").is_err());
        assert!(StoreDir::new("/nix/store/").is_err());
    }
}
