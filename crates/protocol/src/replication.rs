//! Replication update acknowledgements

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Mint a cluster-unique replication name for one write attempt
///
/// The issuing node's address prefixes a time-ordered unique id, so names
/// sort roughly by issue time and collisions across replicas are impossible.
pub fn new_replication_name(host_and_port: &str) -> String {
    format!("{}:{}", host_and_port, Uuid::now_v7())
}

/// Kind of conflict a replicated write ran into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ReplicationConflictType {
    /// No conflict
    None = 0,
    /// A peer replica holds the row lock
    RowLock = 1,
    /// A peer replica holds the catalog object lock
    DbObjectLock = 2,
    /// Append-without-key contention
    Append = 3,
}

impl ReplicationConflictType {
    /// Wire discriminant
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Parse the wire discriminant
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ReplicationConflictType::None),
            1 => Some(ReplicationConflictType::RowLock),
            2 => Some(ReplicationConflictType::DbObjectLock),
            3 => Some(ReplicationConflictType::Append),
            _ => None,
        }
    }
}

impl Default for ReplicationConflictType {
    fn default() -> Self {
        ReplicationConflictType::None
    }
}

/// Payload of a replication update acknowledgement
///
/// For `Append` conflicts `first` carries the start key and `update_count`
/// the append count; otherwise `first` is -1. `ack_version` increments per
/// ack emitted for the same statement so replicas can deduplicate retry
/// notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationUpdateAck {
    pub update_count: i32,
    pub first: i64,
    pub uncommitted_replication_name: Option<String>,
    pub conflict_type: ReplicationConflictType,
    pub ack_version: i32,
    pub is_if_ddl: bool,
    pub is_final_result: bool,
}

/// The four contexts a replicated update is acknowledged in
///
/// The distributed-transaction variants are used iff the emitting session is
/// not the root and not auto-committing; the prepared variants add the
/// two-phase-replication phase bit. All carry the same payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicationAck {
    Update(ReplicationUpdateAck),
    DTransactionUpdate(ReplicationUpdateAck),
    PreparedUpdate {
        ack: ReplicationUpdateAck,
        phase: u8,
    },
    DTransactionPreparedUpdate {
        ack: ReplicationUpdateAck,
        phase: u8,
    },
}

impl ReplicationAck {
    /// The shared payload
    pub fn payload(&self) -> &ReplicationUpdateAck {
        match self {
            ReplicationAck::Update(ack) | ReplicationAck::DTransactionUpdate(ack) => ack,
            ReplicationAck::PreparedUpdate { ack, .. }
            | ReplicationAck::DTransactionPreparedUpdate { ack, .. } => ack,
        }
    }

    /// Whether this is a distributed-transaction variant
    pub fn is_distributed(&self) -> bool {
        matches!(
            self,
            ReplicationAck::DTransactionUpdate(_)
                | ReplicationAck::DTransactionPreparedUpdate { .. }
        )
    }
}
