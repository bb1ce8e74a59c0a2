use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::Error;

/// Record identity: `at://<authority>/<collection>/<rkey>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AtUri {
    authority: String,
    collection: String,
    rkey: String,
}

impl AtUri {
    #[must_use]
    pub fn new(authority: &str, collection: &str, rkey: &str) -> Self {
        Self {
            authority: authority.to_string(),
            collection: collection.to_string(),
            rkey: rkey.to_string(),
        }
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn rkey(&self) -> &str {
        &self.rkey
    }
}

impl fmt::Display for AtUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "at://{}/{}/{}", self.authority, self.collection, self.rkey)
    }
}

impl FromStr for AtUri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix("at://")
            .ok_or_else(|| Error::BadRequest(format!("invalid at-uri: {s}")))?;

        let mut parts = rest.splitn(3, '/');
        let authority = parts.next().unwrap_or_default();
        let collection = parts.next().unwrap_or_default();
        let rkey = parts.next().unwrap_or_default();

        if authority.is_empty() || collection.is_empty() || rkey.is_empty() || rkey.contains('/') {
            return Err(Error::BadRequest(format!("invalid at-uri: {s}")));
        }

        Ok(Self::new(authority, collection, rkey))
    }
}

impl Serialize for AtUri {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for AtUri {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

const TID_ALPHABET: &[u8; 32] = b"234567abcdefghijklmnopqrstuvwxyz";

static LAST_TID_MICROS: AtomicU64 = AtomicU64::new(0);

/// Generates a timestamp identifier usable as a record key.
///
/// TIDs sort lexicographically by creation time and never repeat within a process.
#[must_use]
pub fn tid() -> String {
    let now = Utc::now().timestamp_micros().max(0) as u64;
    let mut prev = LAST_TID_MICROS.load(Ordering::Relaxed);
    let micros = loop {
        let next = now.max(prev + 1);
        match LAST_TID_MICROS.compare_exchange_weak(prev, next, Ordering::Relaxed, Ordering::Relaxed)
        {
            Ok(_) => break next,
            Err(actual) => prev = actual,
        }
    };

    let clock_id: u64 = rand::thread_rng().gen_range(0..1024);
    let value = ((micros & ((1 << 53) - 1)) << 10) | clock_id;

    (0..13)
        .rev()
        .map(|i| TID_ALPHABET[((value >> (i * 5)) & 0x1f) as usize] as char)
        .collect()
}

/// Returns true if `s` looks like a DID (`did:<method>:<id>`).
#[must_use]
pub fn is_did(s: &str) -> bool {
    let mut parts = s.splitn(3, ':');
    matches!(
        (parts.next(), parts.next(), parts.next()),
        (Some("did"), Some(method), Some(id)) if !method.is_empty() && !id.is_empty()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_aturi() {
        let uri: AtUri = "at://did:plc:alice/sh.tangled.repo/3kabc".parse().unwrap();
        assert_eq!(uri.authority(), "did:plc:alice");
        assert_eq!(uri.collection(), "sh.tangled.repo");
        assert_eq!(uri.rkey(), "3kabc");
        assert_eq!(uri.to_string(), "at://did:plc:alice/sh.tangled.repo/3kabc");
    }

    #[test]
    fn test_parse_aturi_rejects_garbage() {
        assert!("https://example.com".parse::<AtUri>().is_err());
        assert!("at://did:plc:alice".parse::<AtUri>().is_err());
        assert!("at://did:plc:alice/col/a/b".parse::<AtUri>().is_err());
    }

    #[test]
    fn test_tid_is_sortable_and_unique() {
        let a = tid();
        let b = tid();
        assert_eq!(a.len(), 13);
        assert!(a < b);
    }

    #[test]
    fn test_is_did() {
        assert!(is_did("did:plc:abc"));
        assert!(is_did("did:web:knot.example.com"));
        assert!(!is_did("alice.bsky.social"));
        assert!(!is_did("did:plc:"));
    }
}
