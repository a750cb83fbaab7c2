//! Opaque 12-byte identifiers for tasks, workers and queued update envelopes.
//!
//! Modeled on the classic MongoDB ObjectId layout (4-byte unix timestamp +
//! 5 random bytes + 3-byte counter) since the upstream coordinator and the
//! Manager's local cache both speak this shape of id; see
//! `examples/original_source/flamenco/workers.go` (`bson.ObjectId`).

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::{bail, Error};
use serde::{Deserialize, Serialize};

static COUNTER: AtomicU32 = AtomicU32::new(0);

fn fresh_bytes() -> [u8; 12] {
    let mut bytes = [0u8; 12];

    let secs = proxmox_time::epoch_i64().max(0) as u32;
    bytes[0..4].copy_from_slice(&secs.to_be_bytes());

    let mut random = [0u8; 5];
    if proxmox_sys::linux::fill_with_random_data(&mut random).is_err() {
        // Extremely unlikely; fall back to the counter alone rather than fail id
        // generation outright.
        random = [0u8; 5];
    }
    bytes[4..9].copy_from_slice(&random);

    let count = COUNTER.fetch_add(1, Ordering::Relaxed) & 0x00ff_ffff;
    bytes[9..12].copy_from_slice(&count.to_be_bytes()[1..4]);

    bytes
}

macro_rules! opaque_id {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name([u8; 12]);

        impl $name {
            /// The sentinel id used for synthetic updates whose job is unknown
            /// (base spec §4.5, §4.2 step 6): all-zero bytes, which is never
            /// handed out by [`Self::new`].
            pub const UNKNOWN: $name = $name([0u8; 12]);

            pub fn new() -> Self {
                Self(fresh_bytes())
            }

            pub fn is_unknown(&self) -> bool {
                *self == Self::UNKNOWN
            }

            pub fn as_bytes(&self) -> &[u8; 12] {
                &self.0
            }

            /// First 4 hex characters, used to shard the on-disk log directory
            /// layout (base spec §4.2 step 6 / §6).
            pub fn hex_prefix4(&self) -> String {
                hex::encode(&self.0[0..2])
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let decoded = hex::decode(s)?;
                if decoded.len() != 12 {
                    bail!(
                        "invalid {}: expected 24 hex characters, got {}",
                        stringify!($name),
                        s.len()
                    );
                }
                let mut bytes = [0u8; 12];
                bytes.copy_from_slice(&decoded);
                Ok(Self(bytes))
            }
        }

        impl Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

opaque_id!(TaskId, "Identifies a task, unique within the Manager's cache.");
opaque_id!(JobId, "Identifies a job (a collection of dependent tasks).");
opaque_id!(WorkerId, "Identifies a worker machine.");
opaque_id!(EnvelopeId, "Identifies one entry in the task-update queue.");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_through_string() {
        let id = TaskId::new();
        let s = id.to_string();
        assert_eq!(s.len(), 24);
        assert_eq!(s.parse::<TaskId>().unwrap(), id);
    }

    #[test]
    fn unknown_job_is_distinct_from_fresh_ids() {
        assert!(JobId::UNKNOWN.is_unknown());
        assert!(!JobId::new().is_unknown());
    }

    #[test]
    fn rejects_malformed_hex() {
        assert!("not-hex".parse::<TaskId>().is_err());
        assert!("abcd".parse::<TaskId>().is_err());
    }

    #[test]
    fn hex_prefix4_is_first_two_bytes() {
        let id = TaskId::new();
        assert_eq!(id.hex_prefix4(), id.to_string()[0..4]);
    }
}
