//! Peer-peer RPC message types and the wire envelopes around them.

use crate::protocol::{LeaderId, LogStat, Record, TailBitmap};

use serde::{Deserialize, Serialize};

/// Vote request from candidate to voter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteReq {
    pub candidate: LeaderId,
    pub committer: LeaderId,
    pub accepted: TailBitmap,
}

/// Vote reply: a snapshot of the voter's status. It is the candidate's
/// responsibility to check whether the voter granted it; `logs` ships the
/// records the voter has but the candidate does not.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteReply {
    pub voted_for: LeaderId,
    pub committer: LeaderId,
    pub accepted: TailBitmap,
    pub committed: TailBitmap,
    pub logs: Vec<Record>,
}

/// Log replication request from leader to follower.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogForwardReq {
    pub committer: LeaderId,
    pub logs: Vec<Record>,
}

/// Log replication reply. `ok = false` means the follower rejected the
/// committer or its lease on it expired; `voted_for` then tells the leader
/// who outranked it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogForwardReply {
    pub ok: bool,
    pub voted_for: LeaderId,
    pub accepted: TailBitmap,
    pub committed: TailBitmap,
}

/// Legacy/bootstrap replication request; a subset of `LogForward` without
/// lease enforcement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicateReq {
    pub committer: LeaderId,
    pub logs: Vec<Record>,
}

/// Legacy/bootstrap replication reply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicateReply {
    pub voted_for: LeaderId,
    pub accepted: TailBitmap,
    pub committed: TailBitmap,
}

impl LogStat for VoteReq {
    fn committer(&self) -> &LeaderId {
        &self.committer
    }
    fn accepted(&self) -> &TailBitmap {
        &self.accepted
    }
}

impl LogStat for VoteReply {
    fn committer(&self) -> &LeaderId {
        &self.committer
    }
    fn accepted(&self) -> &TailBitmap {
        &self.accepted
    }
}

/// Request envelope carried on a peer RPC connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum PeerRequest {
    Vote(VoteReq),
    LogForward(LogForwardReq),
    Replicate(ReplicateReq),
}

/// Reply envelope carried on a peer RPC connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum PeerReply {
    Vote(VoteReply),
    LogForward(LogForwardReply),
    Replicate(ReplicateReply),
}

#[cfg(test)]
mod messages_tests {
    use super::*;
    use crate::protocol::{cmp_log_status, Cmd};
    use crate::utils::TraftError;
    use std::cmp::Ordering;

    #[test]
    fn freshness_across_shapes() {
        let req = VoteReq {
            candidate: LeaderId::new(2, 2),
            committer: LeaderId::new(1, 1),
            accepted: TailBitmap::from(0, vec![5]),
        };
        let reply = VoteReply {
            voted_for: LeaderId::new(0, 1),
            committer: LeaderId::new(1, 1),
            accepted: TailBitmap::from(0, vec![5, 6]),
            ..Default::default()
        };
        // same committer, reply has seen one more seq
        assert_eq!(cmp_log_status(&req, &reply), Ordering::Less);
    }

    #[test]
    fn envelope_round_trip() -> Result<(), TraftError> {
        let mut rec =
            Record::new(LeaderId::new(1, 1), 5, Cmd::new_i64("set", "x", 5));
        rec.overrides = TailBitmap::from(0, vec![5]);
        rec.depends = TailBitmap::new(0);

        let req = PeerRequest::LogForward(LogForwardReq {
            committer: LeaderId::new(1, 1),
            logs: vec![rec, Record::default()],
        });
        let bytes = rmp_serde::encode::to_vec(&req)?;
        let back: PeerRequest = rmp_serde::decode::from_slice(&bytes)?;
        assert_eq!(back, req);

        let reply = PeerReply::Vote(VoteReply {
            voted_for: LeaderId::new(2, 2),
            committer: LeaderId::new(1, 1),
            accepted: TailBitmap::from(0, vec![5, 6]),
            committed: TailBitmap::new(0),
            logs: vec![],
        });
        let bytes = rmp_serde::encode::to_vec(&reply)?;
        let back: PeerReply = rmp_serde::decode::from_slice(&bytes)?;
        assert_eq!(back, reply);
        Ok(())
    }
}
