//! The seam for NAR payloads.
//!
//! This crate does not pack filesystem trees into the Nix archive format;
//! the caller brings a producer and the connection gives it a sink to yield
//! chunks into. Returning from [`NarSource::dump`] ends the payload — which
//! is also how a caller cancels an upload early (the daemon will then reject
//! the truncated archive on its side).

use std::io;

/// Where NAR chunks go: the connection, or a buffer in tests.
pub trait NarSink {
    fn emit(&mut self, chunk: &[u8]) -> io::Result<()>;
}

impl NarSink for Vec<u8> {
    fn emit(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.extend_from_slice(chunk);
        Ok(())
    }
}

/// A caller-supplied producer of NAR bytes.
pub trait NarSource {
    fn dump(&mut self, sink: &mut dyn NarSink) -> io::Result<()>;
}

/// A NAR already sitting in memory.
pub struct NarBytes<'a>(pub &'a [u8]);

impl NarSource for NarBytes<'_> {
    fn dump(&mut self, sink: &mut dyn NarSink) -> io::Result<()> {
        sink.emit(self.0)
    }
}

/// Adapts a closure into a producer.
pub struct NarFn<F>(pub F);

impl<F> NarSource for NarFn<F>
where
    F: FnMut(&mut dyn NarSink) -> io::Result<()>,
{
    fn dump(&mut self, sink: &mut dyn NarSink) -> io::Result<()> {
        (self.0)(sink)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunked_dump() {
        let mut source = NarFn(|sink: &mut dyn NarSink| {
            sink.emit(b"nix-archive-1")?;
            sink.emit(b"(")?;
            sink.emit(b")")
        });
        let mut out = Vec::new();
        source.dump(&mut out).unwrap();
        assert_eq!(out, b"nix-archive-1()");
    }
}
