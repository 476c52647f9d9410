//! The worker ops of the remote store protocol.
//!
//! On the wire an operation is its opcode followed by the encoded arguments,
//! so [`WorkerOp`] is one more integer-tagged enum. The second field of each
//! variant is a zero-sized [`Resp`] marker recording the reply type the
//! daemon will send after its log frames; the connection reads it with the
//! type the marker names.

use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};

use serde::{Deserialize, Serialize};
use tagged_serde::TaggedSerde;

use crate::content_address::FileIngestionMethod;
use crate::path_info::ValidPathInfo;
use crate::{NixString, Path, PathSet, StringSet};

/// A zero-sized marker type. Its job is to mark the expected response
/// type for each worker op.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(test, derive(arbitrary::Arbitrary))]
pub struct Resp<T> {
    #[serde(skip)]
    marker: std::marker::PhantomData<T>,
}

impl<T> Resp<T> {
    pub fn new() -> Resp<T> {
        Resp {
            marker: std::marker::PhantomData,
        }
    }
}

impl<T> Default for Resp<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Arguments that are fully described by their encoding.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[cfg_attr(test, derive(arbitrary::Arbitrary))]
pub struct Plain<T>(pub T);

impl<T> Deref for Plain<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T> DerefMut for Plain<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// Arguments that are followed by a raw NAR dump on the wire. The archive
/// bytes come from the caller's producer and are not part of this value.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[cfg_attr(test, derive(arbitrary::Arbitrary))]
pub struct WithNarStream<T>(pub T);

impl<T> Deref for WithNarStream<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T> DerefMut for WithNarStream<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// The ops this client can issue, tagged with their stable opcodes.
///
/// The opcode space has gaps for operations that are obsolete or
/// daemon-internal (`HasSubstitutes` 3, `ExportPath` 16, `SetOptions` 19,
/// `CollectGarbage` 20, `NarFromPath` 41, `AddToStoreNar` 42, ...); this
/// client has no use for them.
#[cfg_attr(test, derive(arbitrary::Arbitrary))]
#[derive(Debug, TaggedSerde, PartialEq, Eq)]
pub enum WorkerOp {
    #[tagged_serde = 1]
    IsValidPath(Plain<Path>, Resp<bool>),
    #[tagged_serde = 6]
    QueryReferrers(Plain<Path>, Resp<PathSet>),
    #[tagged_serde = 7]
    AddToStore(WithNarStream<AddToStore>, Resp<Path>),
    #[tagged_serde = 8]
    AddTextToStore(Plain<AddTextToStore>, Resp<Path>),
    #[tagged_serde = 9]
    BuildPaths(Plain<BuildPaths>, Resp<u64>),
    #[tagged_serde = 10]
    EnsurePath(Plain<Path>, Resp<u64>),
    #[tagged_serde = 11]
    AddTempRoot(Plain<Path>, Resp<u64>),
    #[tagged_serde = 12]
    AddIndirectRoot(Plain<Path>, Resp<u64>),
    #[tagged_serde = 13]
    SyncWithGC(Plain<()>, Resp<u64>),
    #[tagged_serde = 14]
    FindRoots(Plain<()>, Resp<FindRootsResponse>),
    #[tagged_serde = 22]
    QueryDerivationOutputs(Plain<Path>, Resp<PathSet>),
    #[tagged_serde = 23]
    QueryAllValidPaths(Plain<()>, Resp<PathSet>),
    #[tagged_serde = 26]
    QueryPathInfo(Plain<Path>, Resp<QueryPathInfoResponse>),
    #[tagged_serde = 31]
    QueryDerivationOutputNames(Plain<Path>, Resp<StringSet>),
    #[tagged_serde = 32]
    QueryPathFromHashPart(Plain<NixString>, Resp<Path>),
    #[tagged_serde = 34]
    QuerySubstitutablePaths(Plain<PathSet>, Resp<PathSet>),
    #[tagged_serde = 35]
    QueryValidPaths(Plain<QueryValidPaths>, Resp<PathSet>),
    #[tagged_serde = 36]
    QueryValidDerivers(Plain<Path>, Resp<PathSet>),
    #[tagged_serde = 37]
    OptimiseStore(Plain<()>, Resp<u64>),
    #[tagged_serde = 38]
    VerifyStore(Plain<VerifyStore>, Resp<bool>),
    #[tagged_serde = 39]
    BuildDerivation(Plain<BuildDerivation>, Resp<BuildResult>),
    #[tagged_serde = 40]
    AddSignatures(Plain<AddSignatures>, Resp<u64>),
    #[tagged_serde = 43]
    QueryMissing(Plain<PathSet>, Resp<QueryMissingResponse>),
}

macro_rules! bool_flag {
    ($(#[$meta:meta])* $name:ident { $no:ident, $yes:ident }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[cfg_attr(test, derive(arbitrary::Arbitrary))]
        pub enum $name {
            $no,
            $yes,
        }

        impl $name {
            pub fn enabled(self) -> bool {
                matches!(self, $name::$yes)
            }
        }

        impl Serialize for $name {
            fn serialize<S: serde::Serializer>(
                &self,
                serializer: S,
            ) -> Result<S::Ok, S::Error> {
                serializer.serialize_bool(self.enabled())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(
                deserializer: D,
            ) -> Result<Self, D::Error> {
                Ok(match bool::deserialize(deserializer)? {
                    true => $name::$yes,
                    false => $name::$no,
                })
            }
        }
    };
}

bool_flag!(
    /// Whether an add operation may repair an existing path. A remote store
    /// cannot; the connection refuses these before anything is sent.
    RepairFlag { NoRepair, Repair }
);

bool_flag!(
    /// Whether a query may trigger substitution.
    SubstituteFlag { NoSubstitute, Substitute }
);

bool_flag!(
    /// Whether verification should check store contents.
    CheckFlag { NoCheck, Check }
);

#[cfg_attr(test, derive(arbitrary::Arbitrary))]
#[derive(Debug, Clone, Copy, TaggedSerde, PartialEq, Eq)]
pub enum BuildMode {
    #[tagged_serde = 0]
    Normal,
    #[tagged_serde = 1]
    Repair,
    #[tagged_serde = 2]
    Check,
}

#[cfg_attr(test, derive(arbitrary::Arbitrary))]
#[derive(Debug, Clone, Copy, TaggedSerde, PartialEq, Eq)]
pub enum BuildStatus {
    #[tagged_serde = 0]
    Built,
    #[tagged_serde = 1]
    Substituted,
    #[tagged_serde = 2]
    AlreadyValid,
    #[tagged_serde = 3]
    PermanentFailure,
    #[tagged_serde = 4]
    InputRejected,
    #[tagged_serde = 5]
    OutputRejected,
    #[tagged_serde = 6]
    TransientFailure,
    #[tagged_serde = 7]
    CachedFailure,
    #[tagged_serde = 8]
    TimedOut,
    #[tagged_serde = 9]
    MiscFailure,
    #[tagged_serde = 10]
    DependencyFailed,
    #[tagged_serde = 11]
    LogLimitExceeded,
    #[tagged_serde = 12]
    NotDeterministic,
    #[tagged_serde = 13]
    ResolvesToAlreadyValid,
    #[tagged_serde = 14]
    NoSubstituters,
}

impl BuildStatus {
    pub fn success(self) -> bool {
        matches!(
            self,
            BuildStatus::Built
                | BuildStatus::Substituted
                | BuildStatus::AlreadyValid
                | BuildStatus::ResolvesToAlreadyValid
        )
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[cfg_attr(test, derive(arbitrary::Arbitrary))]
pub struct BuildResult {
    pub status: BuildStatus,
    pub error_msg: NixString,
    pub times_built: u64,
    pub is_non_deterministic: bool,
    pub start_time: u64,
    pub stop_time: u64,
}

#[cfg_attr(test, derive(arbitrary::Arbitrary))]
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct AddToStore {
    pub name: NixString,
    /// Set unless this is the one case the store can address itself:
    /// a recursive sha256 ingest.
    pub fixed: bool,
    pub method: FileIngestionMethod,
    pub algo: NixString,
}

#[cfg_attr(test, derive(arbitrary::Arbitrary))]
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct AddTextToStore {
    pub name: NixString,
    pub text: NixString,
    pub refs: PathSet,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[cfg_attr(test, derive(arbitrary::Arbitrary))]
pub struct BuildPaths {
    pub paths: PathSet,
    pub mode: BuildMode,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[cfg_attr(test, derive(arbitrary::Arbitrary))]
pub struct QueryValidPaths {
    pub paths: PathSet,
    pub substitute: SubstituteFlag,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(test, derive(arbitrary::Arbitrary))]
pub struct VerifyStore {
    pub check_contents: CheckFlag,
    pub repair: RepairFlag,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(test, derive(arbitrary::Arbitrary))]
pub struct AddSignatures {
    pub path: Path,
    pub signatures: Vec<NixString>,
}

/// The `BuildDerivation` argument block.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(test, derive(arbitrary::Arbitrary))]
pub struct BuildDerivation {
    pub drv_path: Path,
    pub derivation: Derivation,
    pub mode: BuildMode,
    // The daemon reads one more integer here and blocks without it.
    _reserved: u64,
}

impl BuildDerivation {
    pub fn new(drv_path: Path, derivation: Derivation, mode: BuildMode) -> Self {
        BuildDerivation {
            drv_path,
            derivation,
            mode,
            _reserved: 0,
        }
    }
}

/// A build recipe in the canonical encoding the daemon consumes.
///
/// Field order is the encoding order and must not change. Maps and sets are
/// ordered collections, so the same derivation always encodes to the same
/// bytes.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(test, derive(arbitrary::Arbitrary))]
pub struct Derivation {
    pub outputs: BTreeMap<NixString, DerivationOutput>,
    /// Input derivation path → names of the outputs used.
    pub input_derivations: BTreeMap<Path, StringSet>,
    pub input_sources: PathSet,
    pub platform: NixString,
    pub builder: Path,
    pub args: Vec<NixString>,
    pub env: BTreeMap<NixString, NixString>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(test, derive(arbitrary::Arbitrary))]
pub struct DerivationOutput {
    pub path: Path,
    /// Hash algorithm name, empty unless the output is fixed.
    pub hash_algo: NixString,
    /// Expected hash in base-16, empty unless the output is fixed.
    pub hash: NixString,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[cfg_attr(test, derive(arbitrary::Arbitrary))]
pub struct FindRootsResponse {
    /// GC root link → the store path it protects.
    pub roots: Vec<(NixString, Path)>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[cfg_attr(test, derive(arbitrary::Arbitrary))]
pub struct QueryPathInfoResponse {
    /// `None` is the daemon saying "not a valid path".
    pub info: Option<ValidPathInfo>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[cfg_attr(test, derive(arbitrary::Arbitrary))]
pub struct QueryMissingResponse {
    pub will_build: PathSet,
    pub will_substitute: PathSet,
    pub unknown: PathSet,
    pub download_size: u64,
    pub nar_size: u64,
}

#[cfg(test)]
mod tests {
    use arbtest::arbtest;

    use super::*;

    #[test]
    fn opcode_on_the_wire() {
        let op = WorkerOp::IsValidPath(Plain(Path::from("/nix/store/x")), Resp::new());
        let bytes = crate::to_vec(&op).unwrap();
        assert_eq!(&bytes[0..8], &1u64.to_le_bytes());

        let op = WorkerOp::QueryMissing(Plain(PathSet::new()), Resp::new());
        let bytes = crate::to_vec(&op).unwrap();
        assert_eq!(&bytes[0..8], &43u64.to_le_bytes());
        // An empty path set is a single zero count.
        assert_eq!(&bytes[8..16], &0u64.to_le_bytes());
    }

    #[test]
    fn ops_round_trip() {
        arbtest(|u| {
            let op: WorkerOp = u.arbitrary()?;
            let bytes = crate::to_vec(&op).unwrap();
            let new_op: WorkerOp = crate::from_bytes(&bytes).unwrap();

            assert_eq!(op, new_op);

            Ok(())
        });
    }

    fn example_derivation() -> Derivation {
        let out = DerivationOutput {
            path: Path::from("/nix/store/g1w7hy3qg1w7hy3qg1w7hy3qg1w7hy3q-out"),
            hash_algo: NixString::from("sha256"),
            hash: NixString::from("ab".repeat(32)),
        };
        Derivation {
            outputs: BTreeMap::from([(NixString::from("out"), out)]),
            input_derivations: BTreeMap::from([(
                Path::from("/nix/store/g1w7hy3qg1w7hy3qg1w7hy3qg1w7hy3q-dep.drv"),
                StringSet::from([NixString::from("out"), NixString::from("dev")]),
            )]),
            input_sources: PathSet::from([Path::from(
                "/nix/store/g1w7hy3qg1w7hy3qg1w7hy3qg1w7hy3q-builder.sh",
            )]),
            platform: NixString::from("x86_64-linux"),
            builder: Path::from("/bin/sh"),
            args: vec![NixString::from("-e"), NixString::from("builder.sh")],
            env: BTreeMap::from([
                (NixString::from("PATH"), NixString::from("/no-path")),
                (NixString::from("out"), NixString::from("/nix/store/...")),
            ]),
        }
    }

    #[test]
    fn derivation_encoding_is_deterministic() {
        let drv = example_derivation();
        assert_eq!(crate::to_vec(&drv).unwrap(), crate::to_vec(&drv).unwrap());
    }

    #[test]
    fn derivation_encodes_outputs_first() {
        let drv = example_derivation();
        let bytes = crate::to_vec(&drv).unwrap();
        // outputs count, then the first output name.
        assert_eq!(&bytes[0..8], &1u64.to_le_bytes());
        assert_eq!(&bytes[8..16], &3u64.to_le_bytes());
        assert_eq!(&bytes[16..19], b"out");
    }

    #[test]
    fn derivation_round_trips() {
        let drv = example_derivation();
        let bytes = crate::to_vec(&drv).unwrap();
        assert_eq!(crate::from_bytes::<Derivation>(&bytes).unwrap(), drv);
    }

    #[test]
    fn build_result_round_trips() {
        let result = BuildResult {
            status: BuildStatus::NotDeterministic,
            error_msg: NixString::from("no idea why"),
            times_built: 3,
            is_non_deterministic: true,
            start_time: 30,
            stop_time: 50,
        };
        let bytes = crate::to_vec(&result).unwrap();
        assert_eq!(&bytes[0..8], &12u64.to_le_bytes());
        assert_eq!(crate::from_bytes::<BuildResult>(&bytes).unwrap(), result);
    }

    #[test]
    fn flags_encode_as_integers() {
        assert_eq!(
            crate::to_vec(&RepairFlag::Repair).unwrap(),
            1u64.to_le_bytes()
        );
        assert_eq!(
            crate::to_vec(&SubstituteFlag::NoSubstitute).unwrap(),
            0u64.to_le_bytes()
        );
        assert_eq!(crate::to_vec(&CheckFlag::Check).unwrap(), 1u64.to_le_bytes());
        assert_eq!(crate::to_vec(&BuildMode::Check).unwrap(), 2u64.to_le_bytes());
    }
}
