//! Store-path metadata, from wire bytes to a checked record.
//!
//! `QueryPathInfo` replies arrive as [`ValidPathInfo`], all strings; the
//! connection runs them through [`PathInfo::assemble`] to get typed hashes,
//! references and content addresses, or a decode error that poisons the
//! connection.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::content_address::ContentAddress;
use crate::hash::{Hash, HashAlgo};
use crate::store_path::{StoreDir, StorePath};
use crate::{Error, NixString, Path, PathSet};

/// The raw `QueryPathInfo` reply body, in wire order.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(test, derive(arbitrary::Arbitrary))]
pub struct ValidPathInfo {
    /// Empty if the deriver is unknown.
    pub deriver: Path,
    /// NAR hash digits in base-32.
    pub nar_hash: NixString,
    pub references: PathSet,
    pub registration_time: u64,
    pub nar_bytes: u64,
    pub ultimate: bool,
    pub sigs: Vec<NixString>,
    /// Empty if the path is input-addressed.
    pub content_address: NixString,
}

/// Who we have to thank for a path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Trust {
    BuiltLocally,
    BuiltElsewhere,
}

/// Metadata of one valid store path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathInfo {
    pub deriver: Option<StorePath>,
    /// SHA-256 over the path's NAR serialization.
    pub nar_hash: Hash,
    pub references: BTreeSet<StorePath>,
    /// Seconds since the epoch.
    pub registration_time: u64,
    /// Size of the NAR serialization. The daemon reports 0 when it does not
    /// know; that zero is preserved as-is.
    pub nar_bytes: u64,
    pub trust: Trust,
    /// Raw signature strings; checking them against trusted keys is the
    /// caller's business.
    pub signatures: Vec<NixString>,
    pub content_address: Option<ContentAddress>,
}

impl PathInfo {
    /// Checks and types a raw reply. All paths must live under `store_dir`
    /// and the NAR hash must be base-32 sha256 digits.
    pub fn assemble(store_dir: &StoreDir, wire: ValidPathInfo) -> Result<PathInfo, Error> {
        let deriver = if wire.deriver.is_empty() {
            None
        } else {
            Some(
                store_dir
                    .parse_path(wire.deriver.as_bytes())
                    .map_err(|e| Error::decode("path info deriver", e))?,
            )
        };

        let nar_hash = Hash::from_base32(HashAlgo::Sha256, wire.nar_hash.as_bytes())
            .map_err(|e| Error::decode("path info nar hash", e))?;

        let references = wire
            .references
            .iter()
            .map(|p| store_dir.parse_path(p.as_bytes()))
            .collect::<Result<BTreeSet<_>, _>>()
            .map_err(|e| Error::decode("path info references", e))?;

        let content_address = if wire.content_address.is_empty() {
            None
        } else {
            Some(
                ContentAddress::parse(wire.content_address.as_bytes())
                    .map_err(|e| Error::decode("path info content address", e))?,
            )
        };

        Ok(PathInfo {
            deriver,
            nar_hash,
            references,
            registration_time: wire.registration_time,
            nar_bytes: wire.nar_bytes,
            trust: if wire.ultimate {
                Trust::BuiltLocally
            } else {
                Trust::BuiltElsewhere
            },
            signatures: wire.sigs,
            content_address,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire_info() -> ValidPathInfo {
        ValidPathInfo {
            deriver: Path::from("/nix/store/g1w7hy3qg1w7hy3qg1w7hy3qg1w7hy3q-foo.drv"),
            nar_hash: NixString::from("1".repeat(52)),
            references: PathSet::from([
                Path::from("/nix/store/g1w7hy3qg1w7hy3qg1w7hy3qg1w7hy3q-foo"),
                Path::from("/nix/store/n5wkd9frr45pa74if5gpz9j7mifg27fh-bar"),
            ]),
            registration_time: 23423,
            nar_bytes: 34878,
            ultimate: true,
            sigs: vec![NixString::from("cache.example.org-1:sig")],
            content_address: NixString::from(""),
        }
    }

    #[test]
    fn assembles_full_record() {
        let info = PathInfo::assemble(&StoreDir::default(), wire_info()).unwrap();
        assert_eq!(info.deriver.as_ref().unwrap().name().as_str(), "foo.drv");
        assert_eq!(info.nar_hash.algo(), HashAlgo::Sha256);
        assert_eq!(info.references.len(), 2);
        assert_eq!(info.trust, Trust::BuiltLocally);
        assert_eq!(info.signatures.len(), 1);
        assert_eq!(info.content_address, None);
        assert_eq!(info.nar_bytes, 34878);
    }

    #[test]
    fn empty_deriver_is_absent() {
        let mut wire = wire_info();
        wire.deriver = Path::from("");
        wire.ultimate = false;
        let info = PathInfo::assemble(&StoreDir::default(), wire).unwrap();
        assert_eq!(info.deriver, None);
        assert_eq!(info.trust, Trust::BuiltElsewhere);
    }

    #[test]
    fn parses_content_address() {
        let mut wire = wire_info();
        wire.content_address =
            NixString::from(format!("fixed:r:sha256:{}", "1".repeat(52)));
        let info = PathInfo::assemble(&StoreDir::default(), wire).unwrap();
        assert!(matches!(
            info.content_address,
            Some(ContentAddress::Fixed { .. })
        ));
    }

    #[test]
    fn rejects_bad_nar_hash() {
        let mut wire = wire_info();
        // Hex digits are not accepted here, only base-32.
        wire.nar_hash = NixString::from("ab".repeat(32));
        let err = PathInfo::assemble(&StoreDir::default(), wire).unwrap_err();
        assert!(matches!(err, Error::Decode { location, .. } if location.contains("nar hash")));
    }

    #[test]
    fn rejects_foreign_references() {
        let mut wire = wire_info();
        wire.references
            .insert(Path::from("/gnu/store/g1w7hy3qg1w7hy3qg1w7hy3qg1w7hy3q-baz"));
        let err = PathInfo::assemble(&StoreDir::default(), wire).unwrap_err();
        assert!(matches!(err, Error::Decode { .. }));
    }
}
