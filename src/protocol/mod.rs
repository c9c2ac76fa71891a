//! The TRaft protocol data model: leader ids, tail bitmaps, log records,
//! replica statuses, cluster configuration, and wire message types.

use std::fmt;

use crate::utils::TraftError;

mod cluster;
mod leaderid;
mod messages;
mod record;
mod status;
mod tailbitmap;

pub use cluster::{ClusterConfig, ReplicaInfo};
pub use leaderid::LeaderId;
pub use messages::{
    LogForwardReply, LogForwardReq, ReplicateReply, ReplicateReq, VoteReply,
    VoteReq,
};
pub use record::{records_short_str, Cmd, Record};
pub use status::{cmp_log_status, LeaderStatus, LogStat, LogStatus, ReplicaStatus};
pub use tailbitmap::TailBitmap;

pub(crate) use messages::{PeerReply, PeerRequest};

/// Protocol-level outcomes that abort a vote or replication round. Distinct
/// from `TraftError`: these are decisions, not infrastructure failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtoError {
    /// The local log is strictly behind at least one voter; this replica
    /// cannot lead until it catches up.
    StaleLog,

    /// The candidate's `(term, id)` is not the highest seen; retry with a
    /// higher term.
    StaleTermId,

    /// A deadline elapsed before quorum.
    Timeout,

    /// Leader state changed under a post-quorum commit; the forward attempt
    /// is abandoned.
    LeaderLost,
}

impl fmt::Display for ProtoError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProtoError::StaleLog => write!(f, "local log is stale"),
            ProtoError::StaleTermId => write!(f, "local term is stale"),
            ProtoError::Timeout => write!(f, "timeout"),
            ProtoError::LeaderLost => write!(f, "leader lost"),
        }
    }
}

impl From<ProtoError> for TraftError {
    fn from(e: ProtoError) -> Self {
        TraftError(e.to_string())
    }
}
