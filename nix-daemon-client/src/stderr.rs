//! Log frames from the daemon.
//!
//! After the client sends an operation, the daemon answers with zero or more
//! stderr frames before the actual reply. Each frame is a 64-bit tag
//! followed by the frame body; the phase ends with `Last` (the reply bytes
//! follow) or `Error` (the operation failed, no reply follows). `Read` and
//! `Write` frames let the daemon pull bytes from or push bytes to the client
//! in the middle of an operation.

use serde::{Deserialize, Serialize};
use tagged_serde::TaggedSerde;

use crate::NixString;

/// A single frame of the stderr sub-protocol.
#[derive(Debug, TaggedSerde, PartialEq, Clone, Eq)]
pub enum Msg {
    #[tagged_serde = 0x64617416]
    Write(NixString),
    #[tagged_serde = 0x64617461]
    Read(u64),
    #[tagged_serde = 0x63787470]
    Error(StderrError),
    #[tagged_serde = 0x6f6c6d67]
    Next(NixString),
    #[tagged_serde = 0x53545254]
    StartActivity(StderrStartActivity),
    #[tagged_serde = 0x53544f50]
    StopActivity(u64),
    #[tagged_serde = 0x52534c54]
    Result(StderrResult),
    #[tagged_serde = 0x616c7473]
    Last(()),
}

/// The error frame of the protocol band we speak: a message and the would-be
/// exit status.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct StderrError {
    pub message: NixString,
    pub status: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct StderrStartActivity {
    pub act: u64,
    pub level: u64,
    pub typ: u64,
    pub text: NixString,
    pub fields: LoggerFields,
    pub parent: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct StderrResult {
    pub act: u64,
    pub typ: u64,
    pub fields: LoggerFields,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct LoggerFields {
    pub fields: Vec<LoggerField>,
}

#[derive(Debug, TaggedSerde, Clone, PartialEq, Eq)]
pub enum LoggerField {
    #[tagged_serde = 0]
    Int(u64),
    #[tagged_serde = 1]
    String(NixString),
}

/// What the frame loop hands to a registered log sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEvent {
    /// A plain log line.
    Line(NixString),
    Start(StderrStartActivity),
    Stop(u64),
    Result(StderrResult),
}

/// Receiver for the log events of an operation. Registered on the
/// connection; the default swallows everything.
pub trait LogSink {
    fn event(&mut self, event: LogEvent);
}

/// The default sink.
pub struct Discard;

impl LogSink for Discard {
    fn event(&mut self, _event: LogEvent) {}
}

impl LogSink for Vec<LogEvent> {
    fn event(&mut self, event: LogEvent) {
        self.push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_tags() {
        // The tag constants, as they appear in the daemon sources.
        assert_eq!(crate::to_vec(&Msg::Last(())).unwrap(), 0x616c7473u64.to_le_bytes());

        let next = Msg::Next(NixString::from("building"));
        let bytes = crate::to_vec(&next).unwrap();
        assert_eq!(&bytes[0..8], &0x6f6c6d67u64.to_le_bytes());
        assert_eq!(crate::from_bytes::<Msg>(&bytes).unwrap(), next);
    }

    #[test]
    fn error_frame_round_trip() {
        let msg = Msg::Error(StderrError {
            message: NixString::from("no such path"),
            status: 1,
        });
        let bytes = crate::to_vec(&msg).unwrap();
        assert_eq!(crate::from_bytes::<Msg>(&bytes).unwrap(), msg);
    }

    #[test]
    fn activity_frames_round_trip() {
        let start = Msg::StartActivity(StderrStartActivity {
            act: 7,
            level: 3,
            typ: 101,
            text: NixString::from("copying path"),
            fields: LoggerFields {
                fields: vec![
                    LoggerField::Int(42),
                    LoggerField::String(NixString::from("x")),
                ],
            },
            parent: 0,
        });
        let bytes = crate::to_vec(&start).unwrap();
        assert_eq!(crate::from_bytes::<Msg>(&bytes).unwrap(), start);

        let result = Msg::Result(StderrResult {
            act: 7,
            typ: 105,
            fields: LoggerFields { fields: vec![] },
        });
        let bytes = crate::to_vec(&result).unwrap();
        assert_eq!(crate::from_bytes::<Msg>(&bytes).unwrap(), result);
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let err = crate::from_bytes::<Msg>(&0xdeadbeefu64.to_le_bytes()).unwrap_err();
        assert!(err.to_string().contains("unknown tag"));
    }
}
