//! Exercises the `TaggedSerde` derive from outside the macro crate, against
//! a serializer with a human-readable output (`serde_json`) so the generated
//! tuple shape is easy to eyeball.

use tagged_serde::TaggedSerde;

#[derive(TaggedSerde, PartialEq, Debug)]
enum Frame {
    #[tagged_serde = 0x6f6c6d67]
    Next(String),
    #[tagged_serde = 7]
    Pair(u64, bool),
    #[tagged_serde = 0x616c7473]
    Last,
}

fn main() {
    let frame = Frame::Pair(12, true);
    let json = serde_json::to_string(&frame).unwrap();
    assert_eq!(json, "[7,12,true]");
    let back: Frame = serde_json::from_str(&json).unwrap();
    assert_eq!(back, frame);

    let last = Frame::Last;
    assert_eq!(serde_json::to_string(&last).unwrap(), "1634497651");

    let next = Frame::Next("building /nix/store/...".to_owned());
    let json = serde_json::to_string(&next).unwrap();
    let back: Frame = serde_json::from_str(&json).unwrap();
    assert_eq!(back, next);

    println!("ok");
}
