//! Column vectors and encoded fragments.
//!
//! A [`Column`] is what a data endpoint hands the encoder: a single typed
//! vector. An encoding pipeline turns it into zero or more [`Fragment`]s,
//! which are the literal elements the client decoder re-reads (raw bytes,
//! or a still-typed array the generic codec serializes directly).

use serde::{Serialize, Serializer};
use serde::ser::SerializeSeq;

/// One untyped input column, as a data endpoint produces it.
#[derive(Debug, Clone, PartialEq)]
pub enum Column {
    Numbers(Vec<i64>),
    Strings(Vec<String>),
    Booleans(Vec<bool>),
}

/// One piece of an encoded [`TaggedExpression`].
#[derive(Debug, Clone, PartialEq)]
pub enum Fragment {
    /// Raw bytes (lesqlite2 runs, NUL-joined strings, packed booleans, a
    /// single UTF-8 string). Encodes as a CBOR byte string.
    Bytes(Vec<u8>),
    /// An "A" (append-raw) numeric passthrough, used by `accept: "dump"`.
    Numbers(Vec<i64>),
    Strings(Vec<String>),
    Booleans(Vec<bool>),
}

impl Serialize for Fragment {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Fragment::Bytes(b) => serializer.serialize_bytes(b),
            Fragment::Numbers(v) => v.serialize(serializer),
            Fragment::Strings(v) => v.serialize(serializer),
            Fragment::Booleans(v) => v.serialize(serializer),
        }
    }
}

/// The wire shape `[tag, ...fragments]` (spec.md §4.2).
#[derive(Debug, Clone, PartialEq)]
pub struct TaggedExpression {
    pub tag: String,
    pub fragments: Vec<Fragment>,
}

impl Serialize for TaggedExpression {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(1 + self.fragments.len()))?;
        seq.serialize_element(&self.tag)?;
        for fragment in &self.fragments {
            seq.serialize_element(fragment)?;
        }
        seq.end()
    }
}
