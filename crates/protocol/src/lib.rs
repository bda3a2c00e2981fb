//! Logical packet types for replication conflict negotiation
//!
//! Wire framing is out of scope; these are the serde-serializable payloads
//! the session core produces and consumes. The ack variants mirror the four
//! contexts a replicated update completes in: plain or two-phase, inside or
//! outside a distributed transaction.

mod replication;
mod retry;

pub use replication::{
    new_replication_name, ReplicationAck, ReplicationConflictType, ReplicationUpdateAck,
};
pub use retry::AppendRetryName;
