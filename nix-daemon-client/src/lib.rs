//! A client for the nix daemon's remote store protocol.
//!
//! The daemon listens on a local stream socket and speaks a binary protocol:
//! after a magic/version handshake, the client sends an opcode and its
//! arguments, the daemon interleaves zero or more stderr/log frames, and a
//! terminal frame is followed by the operation's reply. [`DaemonStore`]
//! owns one such connection and exposes the operations as typed methods.
//!
//! What this crate deliberately leaves to its callers: producing NAR bytes
//! (see [`nar`]), computing hashes, verifying signatures, and connecting the
//! socket itself — any `Read + Write` pair will do.

use std::collections::BTreeSet;
use std::fmt;
use std::io::{Read, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

pub mod base32;
pub mod client;
pub mod content_address;
pub mod hash;
pub mod nar;
pub mod path_info;
pub mod serialize;
pub mod stderr;
pub mod store_path;
pub mod worker_op;

pub use client::{DaemonStore, Missing};
pub use content_address::{ContentAddress, FileIngestionMethod};
pub use hash::{Hash, HashAlgo};
pub use path_info::{PathInfo, Trust};
pub use serialize::{NixReadExt, NixWriteExt};
pub use stderr::{LogEvent, LogSink};
pub use store_path::{StoreDir, StorePath, StorePathHash, StorePathName};
pub use worker_op::{
    BuildMode, BuildResult, BuildStatus, CheckFlag, Derivation, DerivationOutput, RepairFlag,
    SubstituteFlag,
};

pub const WORKER_MAGIC_1: u64 = 0x6e697863;
pub const WORKER_MAGIC_2: u64 = 0x6478696f;

/// The newest protocol version this client speaks (`0x115`).
pub const PROTOCOL_VERSION: DaemonVersion = DaemonVersion {
    major: 1,
    minor: 21,
};

/// Daemons older than this are refused during the handshake.
pub const MINIMUM_PROTOCOL_VERSION: DaemonVersion = DaemonVersion {
    major: 1,
    minor: 10,
};

/// The errors an operation can surface.
///
/// [`Error::Daemon`] and [`Error::PathNotValid`] leave the connection usable;
/// everything else kills it. The client never retries on its own.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(String),
    #[error("daemon error: {message}")]
    Daemon { message: NixString, status: u64 },
    #[error("malformed reply in {location}: {detail}")]
    Decode {
        location: &'static str,
        detail: String,
    },
    #[error("path {0:?} is not valid")]
    PathNotValid(StorePath),
    #[error("repair is not supported against a remote store")]
    RepairUnsupported,
    #[error("daemon connection closed")]
    Disconnected,
    #[error("connection poisoned by an earlier protocol failure")]
    Poisoned,
}

impl Error {
    pub(crate) fn decode(location: &'static str, detail: impl fmt::Display) -> Error {
        Error::Decode {
            location,
            detail: detail.to_string(),
        }
    }

    /// Classifies a codec failure: I/O trouble means the connection is gone,
    /// anything else is a malformed reply.
    pub(crate) fn wire(location: &'static str, err: serialize::Error) -> Error {
        match err {
            serialize::Error::Io(_) => Error::Disconnected,
            other => Error::decode(location, other),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Protocol versions, packed on the wire as `major << 8 | minor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct DaemonVersion {
    pub major: u8,
    pub minor: u8,
}

impl From<u64> for DaemonVersion {
    fn from(x: u64) -> Self {
        let major = ((x >> 8) & 0xff) as u8;
        let minor = (x & 0xff) as u8;
        Self { major, minor }
    }
}

impl From<DaemonVersion> for u64 {
    fn from(DaemonVersion { major, minor }: DaemonVersion) -> Self {
        ((major as u64) << 8) | minor as u64
    }
}

impl fmt::Display for DaemonVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// An uninterpreted protocol string. The wire makes no utf-8 promises, so
/// this wraps raw bytes; `Display` and `Debug` render lossily.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NixString(pub ByteBuf);

impl NixString {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for NixString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Display for NixString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl From<&str> for NixString {
    fn from(s: &str) -> Self {
        NixString(ByteBuf::from(s.as_bytes().to_vec()))
    }
}

impl From<String> for NixString {
    fn from(s: String) -> Self {
        NixString(ByteBuf::from(s.into_bytes()))
    }
}

impl From<Vec<u8>> for NixString {
    fn from(bytes: Vec<u8>) -> Self {
        NixString(ByteBuf::from(bytes))
    }
}

/// An absolute filesystem path as protocol text. Store paths travel in this
/// printed form too; [`StoreDir`] turns them back into [`StorePath`]s.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Path(pub ByteBuf);

impl Path {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl From<&str> for Path {
    fn from(s: &str) -> Self {
        Path(ByteBuf::from(s.as_bytes().to_vec()))
    }
}

impl From<String> for Path {
    fn from(s: String) -> Self {
        Path(ByteBuf::from(s.into_bytes()))
    }
}

impl From<Vec<u8>> for Path {
    fn from(bytes: Vec<u8>) -> Self {
        Path(ByteBuf::from(bytes))
    }
}

/// Sets encode sorted, so identical sets produce identical bytes.
pub type PathSet = BTreeSet<Path>;
pub type StringSet = BTreeSet<NixString>;

pub struct NixRead<R> {
    pub inner: R,
}

impl<R: Read> NixRead<R> {
    pub fn read_u64(&mut self) -> std::io::Result<u64> {
        let mut buf = [0u8; 8];
        self.inner.read_exact(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }
}

pub struct NixWrite<W> {
    pub inner: W,
}

impl<W: Write> NixWrite<W> {
    pub fn write_u64(&mut self, n: u64) -> std::io::Result<()> {
        self.inner.write_all(&n.to_le_bytes())
    }

    pub fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Encodes a value into a fresh buffer.
pub fn to_vec<T: Serialize + ?Sized>(value: &T) -> serialize::Result<Vec<u8>> {
    let mut out = Vec::new();
    out.write_nix(value)?;
    Ok(out)
}

/// Decodes a value from an in-memory buffer.
pub fn from_bytes<T: DeserializeOwned>(mut bytes: &[u8]) -> serialize::Result<T> {
    bytes.read_nix()
}

#[cfg(test)]
impl<'a> arbitrary::Arbitrary<'a> for NixString {
    fn arbitrary(u: &mut arbitrary::Unstructured<'a>) -> arbitrary::Result<Self> {
        Ok(NixString(ByteBuf::from(Vec::<u8>::arbitrary(u)?)))
    }
}

#[cfg(test)]
impl<'a> arbitrary::Arbitrary<'a> for Path {
    fn arbitrary(u: &mut arbitrary::Unstructured<'a>) -> arbitrary::Result<Self> {
        Ok(Path(ByteBuf::from(Vec::<u8>::arbitrary(u)?)))
    }
}
