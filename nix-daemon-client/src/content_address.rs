//! The textual descriptor of how a path's contents are fingerprinted.
//!
//! Grammar, as the daemon prints it:
//!
//! ```text
//! text:sha256:<digits>
//! fixed:sha256:<digits>
//! fixed:r:sha256:<digits>
//! ipfs:sha256:<digits>
//! ```
//!
//! The `r:` marker on a fixed output means the hash is over the NAR dump of
//! the path rather than its flat contents.

use std::fmt;

use crate::hash::{Hash, ParseHashError};

/// How a fixed-output hash was taken over the filesystem object.
///
/// Doubles as the `recursive` argument of `AddToStore`, where it crosses the
/// wire as a bool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(test, derive(arbitrary::Arbitrary))]
pub enum FileIngestionMethod {
    Flat,
    Recursive,
}

impl FileIngestionMethod {
    pub fn recursive(self) -> bool {
        matches!(self, FileIngestionMethod::Recursive)
    }
}

impl serde::Serialize for FileIngestionMethod {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bool(self.recursive())
    }
}

impl<'de> serde::Deserialize<'de> for FileIngestionMethod {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match bool::deserialize(deserializer)? {
            true => FileIngestionMethod::Recursive,
            false => FileIngestionMethod::Flat,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ContentAddress {
    /// A text file addressed by the hash of its contents.
    Text { hash: Hash },
    /// A fixed-output path.
    Fixed {
        method: FileIngestionMethod,
        hash: Hash,
    },
    /// An object pinned in IPFS.
    Ipfs { hash: Hash },
}

impl ContentAddress {
    pub fn hash(&self) -> &Hash {
        match self {
            ContentAddress::Text { hash }
            | ContentAddress::Fixed { hash, .. }
            | ContentAddress::Ipfs { hash } => hash,
        }
    }

    pub fn parse(s: &[u8]) -> Result<Self, ContentAddressError> {
        let s = std::str::from_utf8(s)
            .map_err(|_| ContentAddressError::Malformed(String::from_utf8_lossy(s).into_owned()))?;
        let (prefix, rest) = s
            .split_once(':')
            .ok_or_else(|| ContentAddressError::Malformed(s.to_owned()))?;
        match prefix {
            "text" => Ok(ContentAddress::Text {
                hash: Hash::parse(rest)?,
            }),
            "ipfs" => Ok(ContentAddress::Ipfs {
                hash: Hash::parse(rest)?,
            }),
            "fixed" => match rest.strip_prefix("r:") {
                Some(rest) => Ok(ContentAddress::Fixed {
                    method: FileIngestionMethod::Recursive,
                    hash: Hash::parse(rest)?,
                }),
                None => Ok(ContentAddress::Fixed {
                    method: FileIngestionMethod::Flat,
                    hash: Hash::parse(rest)?,
                }),
            },
            _ => Err(ContentAddressError::UnknownKind(prefix.to_owned())),
        }
    }
}

impl fmt::Display for ContentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContentAddress::Text { hash } => write!(f, "text:{hash}"),
            ContentAddress::Fixed { method, hash } => match method {
                FileIngestionMethod::Flat => write!(f, "fixed:{hash}"),
                FileIngestionMethod::Recursive => write!(f, "fixed:r:{hash}"),
            },
            ContentAddress::Ipfs { hash } => write!(f, "ipfs:{hash}"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ContentAddressError {
    #[error("malformed content address {0:?}")]
    Malformed(String),
    #[error("unknown content address kind {0:?}")]
    UnknownKind(String),
    #[error(transparent)]
    Hash(#[from] ParseHashError),
}
