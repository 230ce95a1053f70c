//! Unique identifiers for sluice entities.
//!
//! All IDs are UUIDs. Display forms carry a short kind prefix, except
//! commit IDs which render as bare 32-character hex.

use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// Namespace for name-based job identities
const JOB_NAMESPACE: Uuid = Uuid::from_bytes([
    0x5e, 0x1c, 0x0b, 0x7a, 0x3d, 0x44, 0x4f, 0x0e, 0x9a, 0x51, 0x2c, 0x6e, 0x11, 0x8f, 0xd2, 0x07,
]);

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            /// Create a new random identifier
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Create from UUID bytes
            #[must_use]
            pub const fn from_bytes(bytes: [u8; 16]) -> Self {
                Self(Uuid::from_bytes(bytes))
            }

            /// Get as UUID
            #[must_use]
            pub const fn as_uuid(&self) -> Uuid {
                self.0
            }

            /// Get as bytes
            #[must_use]
            pub const fn as_bytes(&self) -> &[u8; 16] {
                self.0.as_bytes()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}{}", $prefix, self.0.simple())
            }
        }

        impl FromStr for $name {
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let raw = s.strip_prefix($prefix).unwrap_or(s);
                Uuid::parse_str(raw)
                    .map(Self)
                    .map_err(|e| CoreError::validation(stringify!($name), e.to_string()))
            }
        }
    };
}

uuid_id!(
    /// Commit identifier - unique across all repositories
    CommitId,
    ""
);

uuid_id!(
    /// Job identifier - one execution of a pipeline
    JobId,
    "job_"
);

uuid_id!(
    /// Worker identifier - one datum-executing worker
    WorkerId,
    "worker_"
);

uuid_id!(
    /// Replica identifier - one controller process competing for leadership
    ReplicaId,
    "replica_"
);

impl JobId {
    /// Derive the job identity for a pipeline and a canonical input key.
    ///
    /// Two triggers for the same input commit set produce the same ID, so
    /// job creation reduces to a unique-key insert.
    #[must_use]
    pub fn for_inputs(pipeline: &str, input_key: &str) -> Self {
        let name = format!("{}\u{0}{}", pipeline, input_key);
        Self(Uuid::new_v5(&JOB_NAMESPACE, name.as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_creation() {
        assert_ne!(CommitId::new(), CommitId::new());
        assert_ne!(JobId::new(), JobId::new());
        assert_ne!(WorkerId::new(), WorkerId::new());
    }

    #[test]
    fn test_id_from_bytes() {
        let bytes = [1u8; 16];
        let id = CommitId::from_bytes(bytes);
        assert_eq!(id.as_bytes(), &bytes);
    }

    #[test]
    fn test_commit_id_display_is_hex() {
        let id = CommitId::new();
        let s = id.to_string();
        assert_eq!(s.len(), 32);
        assert!(s.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_id_parse_roundtrip() {
        let job = JobId::new();
        let parsed: JobId = job.to_string().parse().unwrap();
        assert_eq!(job, parsed);

        let commit = CommitId::new();
        let parsed: CommitId = commit.to_string().parse().unwrap();
        assert_eq!(commit, parsed);
    }

    #[test]
    fn test_id_parse_invalid() {
        assert!("job_not-a-uuid".parse::<JobId>().is_err());
    }

    #[test]
    fn test_job_id_for_inputs() {
        let a = JobId::for_inputs("edges", "images@abc");
        let b = JobId::for_inputs("edges", "images@abc");
        assert_eq!(a, b);

        assert_ne!(a, JobId::for_inputs("edges", "images@def"));
        assert_ne!(a, JobId::for_inputs("montage", "images@abc"));
    }
}
