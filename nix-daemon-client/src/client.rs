//! The daemon connection and the typed operations on it.
//!
//! [`DaemonStore`] wraps one byte stream to the daemon. Connecting runs the
//! magic/version handshake; afterwards every method is one worker op:
//! opcode and arguments out, stderr frames in until `Last` or `Error`, then
//! the reply. Methods take `&mut self`, so a second operation cannot start
//! until the previous reply has been fully consumed.
//!
//! Errors split into two classes. A daemon-reported failure or an invalid
//! path leaves the framing intact and the connection usable. Anything that
//! leaves the stream position in doubt — I/O failure, a malformed frame, an
//! unparseable reply — poisons the connection and every later call fails
//! with [`Error::Poisoned`].

use std::collections::{BTreeMap, BTreeSet};
use std::io::{Read, Write};

use serde::de::DeserializeOwned;

use crate::content_address::FileIngestionMethod;
use crate::hash::HashAlgo;
use crate::nar::{NarSink, NarSource};
use crate::path_info::PathInfo;
use crate::serialize::{self, NixReadExt, NixWriteExt};
use crate::stderr::{Discard, LogEvent, LogSink, Msg};
use crate::store_path::{StoreDir, StorePath, StorePathHash, StorePathName};
use crate::worker_op::{
    AddSignatures, AddTextToStore, AddToStore, BuildDerivation, BuildMode, BuildPaths,
    BuildResult, CheckFlag, Derivation, FindRootsResponse, Plain, QueryMissingResponse,
    QueryPathInfoResponse, QueryValidPaths, RepairFlag, Resp, SubstituteFlag, VerifyStore,
    WithNarStream, WorkerOp,
};
use crate::{
    DaemonVersion, Error, NixRead, NixString, NixWrite, Path, PathSet, Result, StringSet,
    MINIMUM_PROTOCOL_VERSION, PROTOCOL_VERSION, WORKER_MAGIC_1, WORKER_MAGIC_2,
};

/// Ceiling on a single `Read`-frame response, whatever the daemon asks for.
const MAX_READ_CHUNK: usize = 64 * 1024;

/// What `QueryMissing` reported about a set of paths.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Missing {
    pub will_build: BTreeSet<StorePath>,
    pub will_substitute: BTreeSet<StorePath>,
    pub unknown: BTreeSet<StorePath>,
    pub download_size: u64,
    pub nar_size: u64,
}

/// One connection to the daemon.
pub struct DaemonStore<R, W> {
    read: NixRead<R>,
    write: NixWrite<W>,
    store_dir: StoreDir,
    version: DaemonVersion,
    daemon_nix_version: Option<NixString>,
    log_sink: Box<dyn LogSink>,
    poisoned: bool,
}

impl<R, W> std::fmt::Debug for DaemonStore<R, W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonStore")
            .field("store_dir", &self.store_dir)
            .field("version", &self.version)
            .field("daemon_nix_version", &self.daemon_nix_version)
            .field("poisoned", &self.poisoned)
            .finish_non_exhaustive()
    }
}

impl<R: Read, W: Write> DaemonStore<R, W> {
    /// Takes ownership of a freshly connected stream and performs the
    /// handshake on it. `store_dir` is the directory the daemon's paths are
    /// rooted at; it cannot change for the lifetime of the connection.
    pub fn connect(store_dir: StoreDir, read: R, write: W) -> Result<Self> {
        let mut store = DaemonStore {
            read: NixRead { inner: read },
            write: NixWrite { inner: write },
            store_dir,
            version: PROTOCOL_VERSION,
            daemon_nix_version: None,
            log_sink: Box::new(Discard),
            poisoned: false,
        };
        store.handshake()?;
        Ok(store)
    }

    #[tracing::instrument(skip_all)]
    fn handshake(&mut self) -> Result<()> {
        io(self.write.write_u64(WORKER_MAGIC_1))?;
        io(self.write.flush())?;

        let magic = io(self.read.read_u64())?;
        if magic != WORKER_MAGIC_2 {
            return Err(Error::ProtocolMismatch(format!(
                "unexpected magic {magic:#x}"
            )));
        }

        let server = DaemonVersion::from(io(self.read.read_u64())?);
        io(self.write.write_u64(PROTOCOL_VERSION.into()))?;

        let version = std::cmp::min(server, PROTOCOL_VERSION);
        if version < MINIMUM_PROTOCOL_VERSION {
            return Err(Error::ProtocolMismatch(format!(
                "daemon speaks {server}, need at least {MINIMUM_PROTOCOL_VERSION}"
            )));
        }
        if version.minor >= 14 {
            io(self.write.write_u64(0))?; // no cpu affinity
        }
        if version.minor >= 11 {
            io(self.write.write_u64(0))?; // reserve-space, obsolete
        }
        io(self.write.flush())?;

        if version.minor >= 33 {
            let daemon_nix_version: NixString = self
                .read
                .inner
                .read_nix()
                .map_err(|e| Error::wire("handshake", e))?;
            tracing::debug!(daemon = %daemon_nix_version, "daemon identified itself");
            self.daemon_nix_version = Some(daemon_nix_version);
        }

        self.version = version;
        tracing::debug!(%version, "handshake complete");
        Ok(())
    }

    /// The protocol version negotiated with the daemon.
    pub fn version(&self) -> DaemonVersion {
        self.version
    }

    pub fn store_dir(&self) -> &StoreDir {
        &self.store_dir
    }

    /// The daemon's self-reported version string, on protocols new enough
    /// to send one.
    pub fn daemon_nix_version(&self) -> Option<&NixString> {
        self.daemon_nix_version.as_ref()
    }

    /// Registers a receiver for the log frames of subsequent operations.
    pub fn set_log_sink(&mut self, sink: impl LogSink + 'static) {
        self.log_sink = Box::new(sink);
    }

    pub fn reader(&mut self) -> &mut R {
        &mut self.read.inner
    }

    pub fn writer(&mut self) -> &mut W {
        &mut self.write.inner
    }

    // Operations, in opcode order.

    #[tracing::instrument(skip(self))]
    pub fn is_valid_path(&mut self, path: &StorePath) -> Result<bool> {
        let op = WorkerOp::IsValidPath(Plain(self.printed(path)), Resp::new());
        self.run_op(&op)?;
        self.reply("IsValidPath reply")
    }

    #[tracing::instrument(skip(self))]
    pub fn query_referrers(&mut self, path: &StorePath) -> Result<BTreeSet<StorePath>> {
        let op = WorkerOp::QueryReferrers(Plain(self.printed(path)), Resp::new());
        self.run_op(&op)?;
        self.reply_path_set("QueryReferrers reply")
    }

    /// Ingests a NAR under the given name. The archive bytes come from
    /// `source`, chunk by chunk, after the argument block.
    #[tracing::instrument(skip(self, source))]
    pub fn add_to_store(
        &mut self,
        name: &StorePathName,
        algo: HashAlgo,
        method: FileIngestionMethod,
        repair: RepairFlag,
        source: &mut dyn NarSource,
    ) -> Result<StorePath> {
        if repair.enabled() {
            return Err(Error::RepairUnsupported);
        }
        let fixed = !(algo == HashAlgo::Sha256 && method.recursive());
        let op = WorkerOp::AddToStore(
            WithNarStream(AddToStore {
                name: NixString::from(name.as_str()),
                fixed,
                method,
                algo: NixString::from(algo.name()),
            }),
            Resp::new(),
        );
        self.send_op(&op)?;

        let dumped = {
            let mut sink = WireSink {
                write: &mut self.write.inner,
            };
            source.dump(&mut sink)
        };
        if let Err(e) = dumped {
            tracing::debug!(error = %e, "nar upload failed");
            return self.fail(Error::Disconnected);
        }
        io(self.write.flush()).or_else(|e| self.fail(e))?;

        self.process_stderr(None, None)?;
        self.reply_path("AddToStore reply")
    }

    /// Stores a small text blob with known references.
    #[tracing::instrument(skip(self, text))]
    pub fn add_text_to_store(
        &mut self,
        name: &StorePathName,
        text: NixString,
        refs: &BTreeSet<StorePath>,
        repair: RepairFlag,
    ) -> Result<StorePath> {
        if repair.enabled() {
            return Err(Error::RepairUnsupported);
        }
        let op = WorkerOp::AddTextToStore(
            Plain(AddTextToStore {
                name: NixString::from(name.as_str()),
                text,
                refs: self.printed_set(refs),
            }),
            Resp::new(),
        );
        self.run_op(&op)?;
        self.reply_path("AddTextToStore reply")
    }

    #[tracing::instrument(skip(self))]
    pub fn build_paths(&mut self, paths: &BTreeSet<StorePath>, mode: BuildMode) -> Result<()> {
        let op = WorkerOp::BuildPaths(
            Plain(BuildPaths {
                paths: self.printed_set(paths),
                mode,
            }),
            Resp::new(),
        );
        self.run_op(&op)?;
        self.status_reply("BuildPaths reply")
    }

    #[tracing::instrument(skip(self))]
    pub fn ensure_path(&mut self, path: &StorePath) -> Result<()> {
        let op = WorkerOp::EnsurePath(Plain(self.printed(path)), Resp::new());
        self.run_op(&op)?;
        self.status_reply("EnsurePath reply")
    }

    /// Roots `path` for the lifetime of this connection.
    #[tracing::instrument(skip(self))]
    pub fn add_temp_root(&mut self, path: &StorePath) -> Result<()> {
        let op = WorkerOp::AddTempRoot(Plain(self.printed(path)), Resp::new());
        self.run_op(&op)?;
        self.status_reply("AddTempRoot reply")
    }

    /// Registers an indirect GC root: `link` is a symlink somewhere on the
    /// filesystem pointing into the store.
    #[tracing::instrument(skip(self))]
    pub fn add_indirect_root(&mut self, link: &Path) -> Result<()> {
        let op = WorkerOp::AddIndirectRoot(Plain(link.clone()), Resp::new());
        self.run_op(&op)?;
        self.status_reply("AddIndirectRoot reply")
    }

    #[tracing::instrument(skip(self))]
    pub fn sync_with_gc(&mut self) -> Result<()> {
        let op = WorkerOp::SyncWithGC(Plain(()), Resp::new());
        self.run_op(&op)?;
        self.status_reply("SyncWithGC reply")
    }

    /// All GC roots the daemon knows, keyed by the link that holds them.
    #[tracing::instrument(skip(self))]
    pub fn find_roots(&mut self) -> Result<BTreeMap<NixString, StorePath>> {
        let op = WorkerOp::FindRoots(Plain(()), Resp::new());
        self.run_op(&op)?;
        let resp: FindRootsResponse = self.reply("FindRoots reply")?;
        let mut roots = BTreeMap::new();
        for (link, path) in resp.roots {
            let path = self.parse_path("FindRoots reply", &path)?;
            roots.insert(link, path);
        }
        Ok(roots)
    }

    #[tracing::instrument(skip(self))]
    pub fn query_derivation_outputs(&mut self, path: &StorePath) -> Result<BTreeSet<StorePath>> {
        let op = WorkerOp::QueryDerivationOutputs(Plain(self.printed(path)), Resp::new());
        self.run_op(&op)?;
        self.reply_path_set("QueryDerivationOutputs reply")
    }

    #[tracing::instrument(skip(self))]
    pub fn query_all_valid_paths(&mut self) -> Result<BTreeSet<StorePath>> {
        let op = WorkerOp::QueryAllValidPaths(Plain(()), Resp::new());
        self.run_op(&op)?;
        self.reply_path_set("QueryAllValidPaths reply")
    }

    /// Fetches and checks the metadata of one path. An invalid path is the
    /// recoverable [`Error::PathNotValid`].
    #[tracing::instrument(skip(self))]
    pub fn query_path_info(&mut self, path: &StorePath) -> Result<PathInfo> {
        let op = WorkerOp::QueryPathInfo(Plain(self.printed(path)), Resp::new());
        self.run_op(&op)?;
        let resp: QueryPathInfoResponse = self.reply("QueryPathInfo reply")?;
        match resp.info {
            None => Err(Error::PathNotValid(path.clone())),
            Some(wire) => match PathInfo::assemble(&self.store_dir, wire) {
                Ok(info) => Ok(info),
                Err(e) => self.fail(e),
            },
        }
    }

    #[tracing::instrument(skip(self))]
    pub fn query_derivation_output_names(&mut self, path: &StorePath) -> Result<StringSet> {
        let op = WorkerOp::QueryDerivationOutputNames(Plain(self.printed(path)), Resp::new());
        self.run_op(&op)?;
        self.reply("QueryDerivationOutputNames reply")
    }

    /// Looks a path up by its hash part alone. `None` if the daemon knows
    /// no such path.
    #[tracing::instrument(skip(self))]
    pub fn query_path_from_hash_part(
        &mut self,
        hash: &StorePathHash,
    ) -> Result<Option<StorePath>> {
        let op = WorkerOp::QueryPathFromHashPart(
            Plain(NixString::from(hash.to_base32())),
            Resp::new(),
        );
        self.run_op(&op)?;
        let path: Path = self.reply("QueryPathFromHashPart reply")?;
        if path.is_empty() {
            return Ok(None);
        }
        Ok(Some(self.parse_path("QueryPathFromHashPart reply", &path)?))
    }

    #[tracing::instrument(skip(self))]
    pub fn query_substitutable_paths(
        &mut self,
        paths: &BTreeSet<StorePath>,
    ) -> Result<BTreeSet<StorePath>> {
        let op = WorkerOp::QuerySubstitutablePaths(Plain(self.printed_set(paths)), Resp::new());
        self.run_op(&op)?;
        self.reply_path_set("QuerySubstitutablePaths reply")
    }

    #[tracing::instrument(skip(self))]
    pub fn query_valid_paths(
        &mut self,
        paths: &BTreeSet<StorePath>,
        substitute: SubstituteFlag,
    ) -> Result<BTreeSet<StorePath>> {
        let op = WorkerOp::QueryValidPaths(
            Plain(QueryValidPaths {
                paths: self.printed_set(paths),
                substitute,
            }),
            Resp::new(),
        );
        self.run_op(&op)?;
        self.reply_path_set("QueryValidPaths reply")
    }

    #[tracing::instrument(skip(self))]
    pub fn query_valid_derivers(&mut self, path: &StorePath) -> Result<BTreeSet<StorePath>> {
        let op = WorkerOp::QueryValidDerivers(Plain(self.printed(path)), Resp::new());
        self.run_op(&op)?;
        self.reply_path_set("QueryValidDerivers reply")
    }

    #[tracing::instrument(skip(self))]
    pub fn optimise_store(&mut self) -> Result<()> {
        let op = WorkerOp::OptimiseStore(Plain(()), Resp::new());
        self.run_op(&op)?;
        self.status_reply("OptimiseStore reply")
    }

    /// Returns whether the daemon found errors.
    #[tracing::instrument(skip(self))]
    pub fn verify_store(&mut self, check_contents: CheckFlag, repair: RepairFlag) -> Result<bool> {
        let op = WorkerOp::VerifyStore(
            Plain(VerifyStore {
                check_contents,
                repair,
            }),
            Resp::new(),
        );
        self.run_op(&op)?;
        self.reply("VerifyStore reply")
    }

    #[tracing::instrument(skip(self, derivation))]
    pub fn build_derivation(
        &mut self,
        drv_path: &StorePath,
        derivation: Derivation,
        mode: BuildMode,
    ) -> Result<BuildResult> {
        let op = WorkerOp::BuildDerivation(
            Plain(BuildDerivation::new(self.printed(drv_path), derivation, mode)),
            Resp::new(),
        );
        self.run_op(&op)?;
        self.reply("BuildDerivation reply")
    }

    #[tracing::instrument(skip(self, signatures))]
    pub fn add_signatures(
        &mut self,
        path: &StorePath,
        signatures: Vec<NixString>,
    ) -> Result<()> {
        let op = WorkerOp::AddSignatures(
            Plain(AddSignatures {
                path: self.printed(path),
                signatures,
            }),
            Resp::new(),
        );
        self.run_op(&op)?;
        self.status_reply("AddSignatures reply")
    }

    #[tracing::instrument(skip(self))]
    pub fn query_missing(&mut self, paths: &BTreeSet<StorePath>) -> Result<Missing> {
        let op = WorkerOp::QueryMissing(Plain(self.printed_set(paths)), Resp::new());
        self.run_op(&op)?;
        let resp: QueryMissingResponse = self.reply("QueryMissing reply")?;
        Ok(Missing {
            will_build: self.parse_path_set("QueryMissing reply", &resp.will_build)?,
            will_substitute: self.parse_path_set("QueryMissing reply", &resp.will_substitute)?,
            unknown: self.parse_path_set("QueryMissing reply", &resp.unknown)?,
            download_size: resp.download_size,
            nar_size: resp.nar_size,
        })
    }

    // Plumbing.

    fn ready(&self) -> Result<()> {
        if self.poisoned {
            return Err(Error::Poisoned);
        }
        Ok(())
    }

    /// Records that the stream position can no longer be trusted, except for
    /// the error classes the protocol lets us recover from.
    fn fail<T>(&mut self, err: Error) -> Result<T> {
        match err {
            Error::Daemon { .. } | Error::PathNotValid(_) | Error::RepairUnsupported => {}
            _ => self.poisoned = true,
        }
        Err(err)
    }

    fn send_op(&mut self, op: &WorkerOp) -> Result<()> {
        self.ready()?;
        if let Err(e) = self.write.inner.write_nix(op) {
            return self.fail(Error::wire("request", e));
        }
        io(self.write.flush()).or_else(|e| self.fail(e))
    }

    fn run_op(&mut self, op: &WorkerOp) -> Result<()> {
        self.send_op(op)?;
        self.process_stderr(None, None)
    }

    /// Drains log frames until the operation settles. `source` answers the
    /// daemon's `Read` requests, `sink` accepts its `Write` pushes; neither
    /// is registered for the operations this client currently issues, but
    /// the frames are part of the protocol and are always consumed.
    fn process_stderr(
        &mut self,
        mut source: Option<&mut dyn Read>,
        mut sink: Option<&mut dyn Write>,
    ) -> Result<()> {
        loop {
            let msg: Msg = match self.read.inner.read_nix() {
                Ok(msg) => msg,
                Err(e) => return self.fail(Error::wire("stderr frame", e)),
            };
            match msg {
                Msg::Last(()) => return Ok(()),
                Msg::Error(e) => {
                    tracing::debug!(message = %e.message, status = e.status, "daemon reported an error");
                    return Err(Error::Daemon {
                        message: e.message,
                        status: e.status,
                    });
                }
                Msg::Next(line) => self.log_sink.event(LogEvent::Line(line)),
                Msg::StartActivity(act) => self.log_sink.event(LogEvent::Start(act)),
                Msg::StopActivity(act) => self.log_sink.event(LogEvent::Stop(act)),
                Msg::Result(res) => self.log_sink.event(LogEvent::Result(res)),
                Msg::Read(len) => {
                    tracing::trace!(len, "daemon requested bytes");
                    let Some(src) = source.as_deref_mut() else {
                        return self.fail(Error::decode("stderr frame", "unexpected read request"));
                    };
                    let mut buf = vec![0; (len as usize).min(MAX_READ_CHUNK)];
                    let n = match src.read(&mut buf) {
                        Ok(n) => n,
                        Err(_) => return self.fail(Error::Disconnected),
                    };
                    let mut ser = serialize::NixSerializer {
                        write: &mut self.write.inner,
                    };
                    if let Err(e) = ser.write_byte_buf(&buf[..n]) {
                        return self.fail(Error::wire("read response", e));
                    }
                    io(self.write.flush()).or_else(|e| self.fail(e))?;
                }
                Msg::Write(data) => {
                    tracing::trace!(len = data.as_bytes().len(), "daemon pushed bytes");
                    if let Some(out) = sink.as_deref_mut() {
                        if out.write_all(data.as_bytes()).is_err() {
                            return self.fail(Error::Disconnected);
                        }
                    }
                }
            }
        }
    }

    fn reply<T: DeserializeOwned>(&mut self, location: &'static str) -> Result<T> {
        match self.read.inner.read_nix() {
            Ok(value) => Ok(value),
            Err(e) => self.fail(Error::wire(location, e)),
        }
    }

    /// "No reply beyond status" operations still get a dummy integer after
    /// the final frame; it has to be drained to keep the stream aligned.
    fn status_reply(&mut self, location: &'static str) -> Result<()> {
        let _: u64 = self.reply(location)?;
        Ok(())
    }

    fn reply_path(&mut self, location: &'static str) -> Result<StorePath> {
        let path: Path = self.reply(location)?;
        self.parse_path(location, &path)
    }

    fn reply_path_set(&mut self, location: &'static str) -> Result<BTreeSet<StorePath>> {
        let paths: PathSet = self.reply(location)?;
        self.parse_path_set(location, &paths)
    }

    fn parse_path(&mut self, location: &'static str, path: &Path) -> Result<StorePath> {
        match self.store_dir.parse_path(path.as_bytes()) {
            Ok(parsed) => Ok(parsed),
            Err(e) => self.fail(Error::decode(location, e)),
        }
    }

    fn parse_path_set(
        &mut self,
        location: &'static str,
        paths: &PathSet,
    ) -> Result<BTreeSet<StorePath>> {
        let mut out = BTreeSet::new();
        for path in paths {
            out.insert(self.parse_path(location, path)?);
        }
        Ok(out)
    }

    fn printed(&self, path: &StorePath) -> Path {
        Path::from(self.store_dir.display_path(path))
    }

    fn printed_set<'a>(&self, paths: impl IntoIterator<Item = &'a StorePath>) -> PathSet {
        paths.into_iter().map(|p| self.printed(p)).collect()
    }
}

/// Lowers an I/O failure to the connection-is-gone error.
fn io<T>(res: std::io::Result<T>) -> Result<T> {
    res.map_err(|e| {
        tracing::debug!(error = %e, "connection i/o failed");
        Error::Disconnected
    })
}

struct WireSink<'a, W> {
    write: &'a mut W,
}

impl<W: Write> NarSink for WireSink<'_, W> {
    fn emit(&mut self, chunk: &[u8]) -> std::io::Result<()> {
        self.write.write_all(chunk)
    }
}
