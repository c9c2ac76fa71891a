//! Per-replica protocol state and the freshness orders over it.

use std::cmp::Ordering;

use crate::protocol::{LeaderId, TailBitmap};

use serde::{Deserialize, Serialize};

/// The durable-ish state a replica keeps for itself and its view of every
/// other member.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaStatus {
    /// Highest candidate this replica has granted its vote to.
    pub voted_for: LeaderId,

    /// When the current leader lease expires, in monotonic microseconds.
    pub vote_expire_at: i64,

    /// The leader id under which logs were last accepted.
    pub committer: LeaderId,

    /// Leader id whose logs populate `accepted`; election bookkeeping.
    pub accepted_from: Option<LeaderId>,

    /// Seqs this replica holds durably enough to count toward quorum.
    pub accepted: TailBitmap,

    /// Seqs known to be committed on a quorum.
    pub committed: TailBitmap,
}

impl ReplicaStatus {
    /// Fresh status for member `id`: self-directed vote at term 0,
    /// everything else zero.
    pub fn new(id: i64) -> Self {
        ReplicaStatus {
            voted_for: LeaderId::new(0, id),
            vote_expire_at: 0,
            committer: LeaderId::default(),
            accepted_from: None,
            accepted: TailBitmap::new(0),
            committed: TailBitmap::new(0),
        }
    }

    /// Snapshot of the log-freshness fields.
    pub fn log_status(&self) -> LogStatus {
        LogStatus {
            committer: self.committer.clone(),
            accepted: self.accepted.clone(),
        }
    }

    /// Snapshot of the leadership fields.
    pub fn leader_status(&self) -> LeaderStatus {
        LeaderStatus {
            voted_for: self.voted_for.clone(),
            vote_expire_at: self.vote_expire_at,
        }
    }

    /// Compares the acceptance bookkeeping with another status:
    /// `accepted_from` first, then how far `accepted` reaches.
    pub fn cmp_accepted(&self, other: &ReplicaStatus) -> Ordering {
        self.accepted_from
            .cmp(&other.accepted_from)
            .then_with(|| self.accepted.len().cmp(&other.accepted.len()))
    }

    /// Creates a status with only the acceptance fields inited: accepted
    /// everything up to and including `lsn`, from leader `(aterm, aid)`.
    #[cfg(test)]
    pub(crate) fn new_status_acc(aterm: i64, aid: i64, lsn: i64) -> Self {
        let mut accepted = TailBitmap::new((lsn + 1) & !63);
        accepted.set(lsn);
        ReplicaStatus {
            accepted_from: Some(LeaderId::new(aterm, aid)),
            accepted,
            ..Default::default()
        }
    }
}

/// Log-freshness view: who last replicated here and what is accepted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogStatus {
    pub committer: LeaderId,
    pub accepted: TailBitmap,
}

/// Leadership view: who holds my vote and until when.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderStatus {
    pub voted_for: LeaderId,
    pub vote_expire_at: i64,
}

/// Anything that exposes a committer and an accepted set, so that requests,
/// replies and statuses can be compared for log freshness uniformly.
pub trait LogStat {
    fn committer(&self) -> &LeaderId;
    fn accepted(&self) -> &TailBitmap;
}

impl LogStat for LogStatus {
    fn committer(&self) -> &LeaderId {
        &self.committer
    }
    fn accepted(&self) -> &TailBitmap {
        &self.accepted
    }
}

impl LogStat for ReplicaStatus {
    fn committer(&self) -> &LeaderId {
        &self.committer
    }
    fn accepted(&self) -> &TailBitmap {
        &self.accepted
    }
}

/// Log-freshness total order: committer first, then accepted reach.
pub fn cmp_log_status(a: &impl LogStat, b: &impl LogStat) -> Ordering {
    a.committer()
        .cmp(b.committer())
        .then_with(|| a.accepted().len().cmp(&b.accepted().len()))
}
