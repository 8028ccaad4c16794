//! Key/value metadata carried by handshakes and data frames.
//!
//! Metadata travels as opaque bytes inside frames; this module gives those
//! bytes a typed shape. The encoding is a CBOR map of strings, and the empty
//! map is encoded as zero bytes so frames without metadata stay small.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::errors::{ProtocolError, Result};

/// Reserved key naming the wanted target of a data frame.
pub const TARGET_KEY: &str = "zipline-target";

/// Ordered string map attached to connections and data frames.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(BTreeMap<String, String>);

impl Metadata {
    /// Empty metadata.
    pub fn new() -> Self {
        Self::default()
    }

    /// Value stored under `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Insert or replace `key`.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Remove `key`, returning its previous value.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    /// Copy every entry of `other` into `self`, overwriting on conflict.
    pub fn merge(&mut self, other: &Self) {
        for (k, v) in &other.0 {
            self.0.insert(k.clone(), v.clone());
        }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no entries.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Wanted target, if one is set and non-empty.
    pub fn target(&self) -> Option<&str> {
        self.get(TARGET_KEY).filter(|t| !t.is_empty())
    }

    /// Set the wanted target.
    pub fn set_target(&mut self, target: impl Into<String>) {
        self.set(TARGET_KEY, target);
    }

    /// Encode to bytes. Empty metadata encodes to empty bytes.
    pub fn encode(&self) -> Result<Bytes> {
        if self.0.is_empty() {
            return Ok(Bytes::new());
        }
        let mut buf = Vec::new();
        ciborium::into_writer(&self.0, &mut buf)
            .map_err(|e| ProtocolError::InvalidMetadata(e.to_string()))?;
        Ok(Bytes::from(buf))
    }

    /// Decode from bytes. Empty bytes decode to empty metadata.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Ok(Self::default());
        }
        let map: BTreeMap<String, String> = ciborium::from_reader(bytes)
            .map_err(|e| ProtocolError::InvalidMetadata(e.to_string()))?;
        Ok(Self(map))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_metadata_is_zero_bytes() {
        assert!(Metadata::new().encode().unwrap().is_empty());
        assert_eq!(Metadata::decode(&[]).unwrap(), Metadata::new());
    }

    #[test]
    fn encode_decode_preserves_entries() {
        let meta: Metadata = [("region", "eu"), (TARGET_KEY, "user-7")].into_iter().collect();
        let bytes = meta.encode().unwrap();
        let decoded = Metadata::decode(&bytes).unwrap();
        assert_eq!(decoded, meta);
        assert_eq!(decoded.target(), Some("user-7"));
    }

    #[test]
    fn merge_overwrites_on_conflict() {
        let mut base: Metadata = [("a", "1"), ("b", "2")].into_iter().collect();
        let extra: Metadata = [("b", "3"), ("c", "4")].into_iter().collect();
        base.merge(&extra);
        assert_eq!(base.iter().collect::<Vec<_>>(), vec![("a", "1"), ("b", "3"), ("c", "4")]);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(Metadata::decode(&[0xFF, 0x00]), Err(ProtocolError::InvalidMetadata(_))));
    }

    #[test]
    fn empty_target_counts_as_unset() {
        let mut meta = Metadata::new();
        meta.set_target("");
        assert_eq!(meta.target(), None);
    }
}
