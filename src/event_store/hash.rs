//! Event hash chain
//!
//! Every event carries `sha3_512(previous_hash || payload)`. The first event
//! of a stream chains from the all-zero hash, so tampering with any stored
//! payload breaks every later link.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha3::{Digest, Sha3_512};
use std::fmt;
use uuid::Uuid;

use super::RecordedEvent;

pub const HASH_LEN: usize = 64;

/// SHA3-512 digest of an event
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventHash([u8; HASH_LEN]);

impl EventHash {
    /// Previous hash of sequence 1
    pub const GENESIS: EventHash = EventHash([0u8; HASH_LEN]);

    /// Chain `payload` onto `previous`
    pub fn compute(previous: &EventHash, payload: &[u8]) -> Self {
        let mut hasher = Sha3_512::new();
        hasher.update(previous.0);
        hasher.update(payload);
        let mut out = [0u8; HASH_LEN];
        out.copy_from_slice(&hasher.finalize());
        Self(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let array: [u8; HASH_LEN] = bytes.try_into().ok()?;
        Some(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        Self::from_bytes(&bytes)
    }
}

impl fmt::Debug for EventHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form keeps log lines readable
        write!(f, "EventHash({}..)", &self.to_hex()[..16])
    }
}

impl fmt::Display for EventHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for EventHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for EventHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        EventHash::from_hex(&s)
            .ok_or_else(|| serde::de::Error::custom("expected 128 hex characters"))
    }
}

/// Chain verification failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainError {
    #[error("Sequence gap in {aggregate_id}: expected {expected}, found {found}")]
    SequenceGap {
        aggregate_id: Uuid,
        expected: u64,
        found: u64,
    },

    #[error("Hash mismatch in {aggregate_id} at sequence {sequence}")]
    HashMismatch {
        aggregate_id: Uuid,
        sequence: u64,
        expected: EventHash,
        actual: EventHash,
    },
}

impl ChainError {
    /// Sequence of the first broken link
    pub fn sequence(&self) -> u64 {
        match self {
            ChainError::SequenceGap { found, .. } => *found,
            ChainError::HashMismatch { sequence, .. } => *sequence,
        }
    }
}

/// Result of verifying one stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainVerification {
    pub aggregate_id: Uuid,
    pub is_valid: bool,
    pub events_checked: u64,
    pub first_invalid_sequence: Option<u64>,
    pub expected_hash: Option<EventHash>,
    pub actual_hash: Option<EventHash>,
}

impl ChainVerification {
    fn valid(aggregate_id: Uuid, events_checked: u64) -> Self {
        Self {
            aggregate_id,
            is_valid: true,
            events_checked,
            first_invalid_sequence: None,
            expected_hash: None,
            actual_hash: None,
        }
    }
}

/// Recompute the chain over a full stream, starting from sequence 1.
pub fn verify_chain(events: &[RecordedEvent]) -> Result<u64, ChainError> {
    let mut previous = EventHash::GENESIS;
    let mut expected_sequence = 1u64;

    for event in events {
        if event.sequence != expected_sequence {
            return Err(ChainError::SequenceGap {
                aggregate_id: event.aggregate_id,
                expected: expected_sequence,
                found: event.sequence,
            });
        }

        let expected = EventHash::compute(&previous, &event.payload);
        if expected != event.hash {
            return Err(ChainError::HashMismatch {
                aggregate_id: event.aggregate_id,
                sequence: event.sequence,
                expected,
                actual: event.hash,
            });
        }

        previous = event.hash;
        expected_sequence += 1;
    }

    Ok(expected_sequence - 1)
}

/// Verify a stream and summarise the outcome for reporting
pub fn verification_report(aggregate_id: Uuid, events: &[RecordedEvent]) -> ChainVerification {
    match verify_chain(events) {
        Ok(checked) => ChainVerification::valid(aggregate_id, checked),
        Err(err) => {
            let (expected_hash, actual_hash) = match &err {
                ChainError::HashMismatch {
                    expected, actual, ..
                } => (Some(*expected), Some(*actual)),
                ChainError::SequenceGap { .. } => (None, None),
            };
            // Only the links before the broken one held
            let verified = match &err {
                ChainError::SequenceGap { expected, .. } => expected.saturating_sub(1),
                ChainError::HashMismatch { sequence, .. } => sequence.saturating_sub(1),
            };
            ChainVerification {
                aggregate_id,
                is_valid: false,
                events_checked: verified,
                first_invalid_sequence: Some(err.sequence()),
                expected_hash,
                actual_hash,
            }
        }
    }
}
