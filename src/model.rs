//! Core data types shared across the gateway, local store and listener.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A row in the backing table: the authoritative value for a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Opaque key bytes.
    pub key: Vec<u8>,
    /// Opaque value bytes, or `None` for a tombstone-in-transit.
    pub value: Option<Vec<u8>>,
    /// Monotonically increasing version assigned by the backend.
    pub version: i64,
    /// When the row was created.
    pub created_at: DateTime<Utc>,
    /// When the row expires, or `None` for no TTL.
    pub expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    /// Whether this entry has expired as of `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(t) if t <= now)
    }
}

/// The mutation kind carried by a notification event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventOp {
    /// A row was inserted or updated.
    Upsert,
    /// A row was deleted.
    Delete,
}

/// The notification payload broadcast by the row-level trigger.
///
/// Carries no value bytes: consumers re-read from the database if they need
/// the new value, keeping notifications small and avoiding ordering hazards
/// with large payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// The mutation kind.
    pub op: EventOp,
    /// The affected key, base64-encoded on the wire.
    #[serde(with = "key_as_base64")]
    pub key: Vec<u8>,
    /// The version assigned to this mutation.
    pub version: i64,
    /// The row's expiry as of this mutation (upsert only; `None` for delete).
    pub expires_at: Option<DateTime<Utc>>,
}

mod key_as_base64 {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(key: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        base64::engine::general_purpose::STANDARD
            .encode(key)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// A value held in the local tier, annotated with the metadata needed to
/// enforce monotonic versions, TTL and LRU eviction.
#[derive(Debug, Clone)]
pub struct LocalEntry {
    /// The decoded value's byte payload, as installed from a gateway read.
    pub value: Vec<u8>,
    /// The version this local copy was installed at.
    pub version: i64,
    /// When this local copy expires, or `None` for no TTL.
    pub expires_at: Option<DateTime<Utc>>,
    /// When this local copy was installed.
    pub inserted_at: DateTime<Utc>,
}

impl LocalEntry {
    /// Whether this local copy has expired as of `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(t) if t <= now)
    }
}
