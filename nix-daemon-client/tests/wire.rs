//! Golden decodings: byte streams assembled integer-by-integer, decoded
//! through the serde codec, pretty-printed, and re-encoded byte-for-byte.

use std::collections::BTreeSet;

use expect_test::{expect, Expect};
use nix_daemon_client::path_info::ValidPathInfo;
use nix_daemon_client::worker_op::{BuildMode, BuildResult};
use nix_daemon_client::{NixString, Path};
use serde::{de::DeserializeOwned, Serialize};

/// Hand-assembled wire bytes.
#[derive(Default)]
struct Raw(Vec<u8>);

impl Raw {
    fn int(mut self, n: u64) -> Raw {
        self.0.extend(n.to_le_bytes());
        self
    }

    fn string(mut self, s: &[u8]) -> Raw {
        self = self.int(s.len() as u64);
        self.0.extend_from_slice(s);
        self.0.extend(std::iter::repeat(0u8).take((8 - s.len() % 8) % 8));
        self
    }
}

fn check<T: DeserializeOwned + Serialize + std::fmt::Debug>(data: &[u8], expect: Expect) {
    let actual: T = nix_daemon_client::from_bytes(data).unwrap();

    // Re-serialize to check that the layout round-trips.
    let out = nix_daemon_client::to_vec(&actual).unwrap();

    expect.assert_debug_eq(&actual);

    assert_eq!(out, data);
}

#[test]
fn strings() {
    let data = Raw::default()
        .string(b"")
        .string(b"hi")
        .string(b"white rabbit")
        .string("大白兔".as_bytes())
        .0;
    check::<(NixString, NixString, NixString, NixString)>(
        &data,
        expect![[r#"
            (
                ,
                hi,
                white rabbit,
                大白兔,
            )
        "#]],
    );
}

#[test]
fn path_set() {
    let data = Raw::default()
        .int(2)
        .string(b"/nix/store/g1w7hy3qg1w7hy3qg1w7hy3qg1w7hy3q-bar")
        .string(b"/nix/store/g1w7hy3qg1w7hy3qg1w7hy3qg1w7hy3q-foo")
        .0;
    check::<BTreeSet<Path>>(
        &data,
        expect![[r#"
            {
                /nix/store/g1w7hy3qg1w7hy3qg1w7hy3qg1w7hy3q-bar,
                /nix/store/g1w7hy3qg1w7hy3qg1w7hy3qg1w7hy3q-foo,
            }
        "#]],
    );
}

#[test]
fn build_mode() {
    let data = Raw::default().int(0).int(1).int(2).0;
    check::<(BuildMode, BuildMode, BuildMode)>(
        &data,
        expect![[r#"
            (
                Normal,
                Repair,
                Check,
            )
        "#]],
    );
}

#[test]
fn build_result() {
    let data = Raw::default()
        .int(5)
        .string(b"no idea why")
        .int(0)
        .int(0)
        .int(0)
        .int(0)
        .0;
    check::<BuildResult>(
        &data,
        expect![[r#"
            BuildResult {
                status: OutputRejected,
                error_msg: no idea why,
                times_built: 0,
                is_non_deterministic: false,
                start_time: 0,
                stop_time: 0,
            }
        "#]],
    );
}

#[test]
fn valid_path_info() {
    let nar_hash = "1".repeat(52);
    let data = Raw::default()
        .string(b"")
        .string(nar_hash.as_bytes())
        .int(1)
        .string(b"/nix/store/g1w7hy3qg1w7hy3qg1w7hy3qg1w7hy3q-bar")
        .int(23423)
        .int(34878)
        .int(1)
        .int(2)
        .string(b"fake-sig-1")
        .string(b"fake-sig-2")
        .string(b"")
        .0;
    check::<ValidPathInfo>(
        &data,
        expect![[r#"
            ValidPathInfo {
                deriver: ,
                nar_hash: 1111111111111111111111111111111111111111111111111111,
                references: {
                    /nix/store/g1w7hy3qg1w7hy3qg1w7hy3qg1w7hy3q-bar,
                },
                registration_time: 23423,
                nar_bytes: 34878,
                ultimate: true,
                sigs: [
                    fake-sig-1,
                    fake-sig-2,
                ],
                content_address: ,
            }
        "#]],
    );
}
