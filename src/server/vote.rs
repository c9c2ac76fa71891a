//! The vote protocol: follower-side handler, candidate-side election round,
//! and the election-time log reconciliation that makes a winner safe to
//! lead.

use std::cmp::Ordering;

use crate::protocol::{
    cmp_log_status, ClusterConfig, LeaderId, LogStatus, ProtoError, Record,
    ReplicaStatus, VoteReply, VoteReq,
};
use crate::server::replica::TRaftCore;
use crate::server::transport;
use crate::utils::{Deadline, TraftError};

use tokio::sync::mpsc;
use tokio::time::Duration;

impl TRaftCore {
    /// Handles a `Vote` request. A vote reply just sends back the voter's
    /// status; it is the candidate's responsibility to check whether the
    /// voter granted it.
    pub(crate) fn hdl_vote_req(&mut self, req: &VoteReq) -> VoteReply {
        let me = &self.status[&self.id];

        let mut reply = VoteReply {
            voted_for: me.voted_for.clone(),
            committer: me.committer.clone(),
            accepted: me.accepted.clone(),
            committed: me.committed.clone(),
            logs: vec![],
        };

        if cmp_log_status(req, me) == Ordering::Less {
            // I have more logs than the candidate; it cannot lead
            return reply;
        }

        if req.candidate < me.voted_for {
            // already voted for a leader with higher privilege; just send
            // back essential info to notify the candidate
            return reply;
        }

        // grant vote; send back the logs I have but the candidate does not
        let start = me.accepted.offset();
        let end = me.accepted.len();
        let mut logs = vec![];
        for i in start..end {
            if me.accepted.get(i) && !req.accepted.get(i) {
                logs.push(self.logs[(i - self.log_offset) as usize].clone());
            }
        }

        reply.logs = logs;
        reply.voted_for = req.candidate.clone();
        self.status.get_mut(&self.id).unwrap().voted_for =
            req.candidate.clone();

        reply
    }

    /// Absorbs the granting voters' knowledge after winning an election:
    /// their shipped records, their accepted/committed sets, and refreshed
    /// views of each voter. Records not in the merged accepted set are
    /// discarded. Must run before the new leader takes any proposal.
    pub(crate) fn establish_leadership(
        &mut self,
        candidate: &LeaderId,
        replies: &[(i64, VoteReply)],
    ) -> Result<(), TraftError> {
        // apply in ascending committer order so that on a conflicting slot
        // the record replicated by the higher committer wins
        let mut ordered: Vec<&(i64, VoteReply)> = replies.iter().collect();
        ordered.sort_by(|a, b| a.1.committer.cmp(&b.1.committer));

        for (voter, reply) in ordered {
            for record in &reply.logs {
                if record.is_empty() {
                    continue;
                }
                if record.seq < self.log_offset {
                    continue; // already forgotten locally
                }
                let idx = (record.seq - self.log_offset) as usize;
                while self.logs.len() <= idx {
                    self.logs.push(Record::default());
                }
                self.logs[idx] = record.clone();
            }

            let me = self.status.get_mut(&self.id).unwrap();
            me.accepted.union(&reply.accepted);
            me.committed.union(&reply.committed);

            // my view of this voter: once the new committer reaches it, it
            // will discard everything it has not committed
            let view = self
                .status
                .entry(*voter)
                .or_insert_with(|| ReplicaStatus::new(*voter));
            view.voted_for = reply.voted_for.clone();
            view.committer = reply.committer.clone();
            view.accepted = reply.committed.clone();
            view.committed = reply.committed.clone();
        }

        // discard any record whose seq did not make it into the merged
        // accepted set, then trim trailing holes
        let accepted = self.status[&self.id].accepted.clone();
        for i in (0..self.logs.len()).rev() {
            if self.logs[i].is_empty() {
                continue;
            }
            if !accepted.get(self.logs[i].seq) {
                self.logs[i] = Record::default();
            }
        }
        while let Some(last) = self.logs.last() {
            if last.is_empty() {
                self.logs.pop();
            } else {
                break;
            }
        }

        let me = self.status.get_mut(&self.id).unwrap();
        me.committer = candidate.clone();
        me.accepted_from = Some(candidate.clone());

        pf_info!(
            "vote won, leader {} accepted {}",
            candidate.short_str(),
            me.accepted.short_str()
        );
        Ok(())
    }
}

/// Outcome of one election round.
#[derive(Debug)]
pub(crate) enum VoteRound {
    /// Quorum granted; carries `(voter id, reply)` of every granting voter,
    /// including the logs they shipped.
    Won(Vec<(i64, VoteReply)>),

    /// No quorum. `higher_term` is the highest reply term strictly above
    /// the candidate's, or -1 if none was seen.
    Lost {
        fault: ProtoError,
        higher_term: i64,
    },
}

/// Runs one election round: fans a `VoteReq` out to every other member and
/// collects replies against a deadline. The self-vote is implied.
pub(crate) async fn vote_once(
    candidate: LeaderId,
    log_status: LogStatus,
    config: ClusterConfig,
    timeout: Duration,
) -> VoteRound {
    let id = candidate.id;
    let req = VoteReq {
        candidate: candidate.clone(),
        committer: log_status.committer.clone(),
        accepted: log_status.accepted.clone(),
    };

    let (tx_reply, mut rx_reply) = mpsc::unbounded_channel();

    for rinfo in config.members.values() {
        if rinfo.id == id {
            continue;
        }

        let rinfo = rinfo.clone();
        let req = req.clone();
        let tx_reply = tx_reply.clone();
        tokio::spawn(async move {
            pf_debug!("sending vote request -> {} '{}'", rinfo.id, rinfo.addr);
            let mut stream = match transport::peer_connect(&rinfo.addr).await {
                Ok(stream) => stream,
                Err(e) => {
                    // an unreachable peer is a non-reply, not a fault
                    pf_warn!("vote connect -> {} failed: {}", rinfo.id, e);
                    return;
                }
            };
            match transport::call_vote(&mut stream, &req).await {
                Ok(reply) => {
                    pf_debug!("got vote reply <- {}", rinfo.id);
                    let _ = tx_reply.send((rinfo, reply));
                }
                Err(e) => {
                    // a broken exchange on an established connection
                    // indicates a protocol bug, not a dead peer
                    pf_error!("vote rpc <- {} failed: {}", rinfo.id, e);
                    panic!("wtf");
                }
            }
        });
    }
    drop(tx_reply);

    // I vote for myself
    let mut received = config.position_bit(id);
    let mut granted = vec![];
    let mut higher_term = -1i64;
    let mut log_stale = false;
    let mut waiting_for = config.members.len() - 1;

    let deadline = Deadline::after(timeout);

    while waiting_for > 0 {
        tokio::select! {
            () = deadline.expired() => {
                pf_info!(
                    "vote round timeout, candidate {}",
                    candidate.short_str()
                );
                return VoteRound::Lost {
                    fault: ProtoError::Timeout,
                    higher_term,
                };
            }

            res = rx_reply.recv() => {
                let (rinfo, reply) = match res {
                    Some(res) => res,
                    None => {
                        // every reachable peer has replied; the rest will
                        // never answer, so wait out the deadline
                        deadline.expired().await;
                        return VoteRound::Lost {
                            fault: ProtoError::Timeout,
                            higher_term,
                        };
                    }
                };
                waiting_for -= 1;

                if reply.voted_for == candidate {
                    // vote granted
                    received |= 1u64 << rinfo.position;
                    granted.push((rinfo.id, reply));
                    if config.is_quorum(received) {
                        return VoteRound::Won(granted);
                    }
                } else {
                    if reply.voted_for.term > candidate.term {
                        higher_term = higher_term.max(reply.voted_for.term);
                    }
                    if cmp_log_status(&reply, &log_status) == Ordering::Greater {
                        pf_info!(
                            "vote rejected by {}: local committer {} max-lsn {}, \
                             remote committer {} max-lsn {}",
                            rinfo.id,
                            log_status.committer.short_str(),
                            log_status.accepted.len(),
                            reply.committer.short_str(),
                            reply.accepted.len()
                        );
                        log_stale = true;
                    }
                }
            }
        }
    }

    if log_stale {
        return VoteRound::Lost {
            fault: ProtoError::StaleLog,
            higher_term,
        };
    }
    VoteRound::Lost {
        fault: ProtoError::StaleTermId,
        higher_term,
    }
}

#[cfg(test)]
mod vote_tests {
    use super::*;
    use crate::protocol::{records_short_str, TailBitmap};
    use crate::server::testutil::{core_with_status, serve_cluster};

    // candidate side of a posed vote exchange
    struct CandStat {
        candidate: LeaderId,
        committer: LeaderId,
        logs: Vec<i64>,
    }

    // voter replica state to pose before the exchange
    struct VoterStat {
        voted_for: LeaderId,
        committer: LeaderId,
        author: LeaderId,
        logs: Vec<i64>,
        nil_logs: Vec<i64>,
    }

    fn test_vote(cand: CandStat, voter: VoterStat) -> VoteReply {
        let mut core = core_with_status(
            1,
            &[1, 2, 3],
            voter.committer,
            voter.author,
            &voter.logs,
            &voter.nil_logs,
            &[],
            voter.voted_for,
            0,
        );
        core.hdl_vote_req(&VoteReq {
            candidate: cand.candidate,
            committer: cand.committer,
            accepted: TailBitmap::from(0, cand.logs),
        })
    }

    fn lid(term: i64, id: i64) -> LeaderId {
        LeaderId::new(term, id)
    }

    #[test]
    fn vote_granted_ships_logs() {
        let reply = test_vote(
            CandStat {
                candidate: lid(2, 2),
                committer: lid(1, 1),
                logs: vec![5],
            },
            VoterStat {
                voted_for: lid(0, 1),
                committer: lid(0, 1),
                author: lid(1, 1),
                logs: vec![5, 6],
                nil_logs: vec![],
            },
        );
        assert_eq!(reply.voted_for, lid(2, 2));
        assert_eq!(reply.committer, lid(0, 1));
        assert_eq!(reply.accepted, TailBitmap::from(0, vec![5, 6]));
        assert_eq!(
            records_short_str(&reply.logs),
            "[<001#001:006{set(x, 6)}-0→0>]"
        );
    }

    #[test]
    fn vote_granted_ships_nil_log() {
        let reply = test_vote(
            CandStat {
                candidate: lid(2, 2),
                committer: lid(1, 1),
                logs: vec![5],
            },
            VoterStat {
                voted_for: lid(0, 1),
                committer: lid(0, 1),
                author: lid(1, 1),
                logs: vec![5, 6, 7],
                nil_logs: vec![6],
            },
        );
        assert_eq!(reply.voted_for, lid(2, 2));
        assert_eq!(reply.accepted, TailBitmap::from(0, vec![5, 6, 7]));
        assert_eq!(
            records_short_str(&reply.logs),
            "[<>, <001#001:007{set(x, 7)}-0→0>]"
        );
    }

    #[test]
    fn vote_rejected_stale_committer() {
        let reply = test_vote(
            CandStat {
                candidate: lid(2, 2),
                committer: lid(0, 1),
                logs: vec![5, 6],
            },
            VoterStat {
                voted_for: lid(0, 1),
                committer: lid(1, 1),
                author: lid(1, 1),
                logs: vec![5, 6],
                nil_logs: vec![],
            },
        );
        assert_eq!(reply.voted_for, lid(0, 1));
        assert_eq!(reply.committer, lid(1, 1));
        assert_eq!(reply.accepted, TailBitmap::from(0, vec![5, 6]));
        assert_eq!(records_short_str(&reply.logs), "[]");
    }

    #[test]
    fn vote_rejected_short_log() {
        // same committer but fewer accepted seqs: no vote, no log shipping
        let reply = test_vote(
            CandStat {
                candidate: lid(2, 2),
                committer: lid(1, 1),
                logs: vec![5],
            },
            VoterStat {
                voted_for: lid(0, 1),
                committer: lid(1, 1),
                author: lid(1, 1),
                logs: vec![5, 6],
                nil_logs: vec![],
            },
        );
        assert_eq!(reply.voted_for, lid(0, 1));
        assert_eq!(records_short_str(&reply.logs), "[]");
    }

    #[test]
    fn vote_rejected_lower_term() {
        let reply = test_vote(
            CandStat {
                candidate: lid(2, 2),
                committer: lid(1, 1),
                logs: vec![5, 6],
            },
            VoterStat {
                voted_for: lid(3, 1),
                committer: lid(1, 1),
                author: lid(1, 1),
                logs: vec![5, 6],
                nil_logs: vec![],
            },
        );
        assert_eq!(reply.voted_for, lid(3, 1));
        assert_eq!(records_short_str(&reply.logs), "[]");
    }

    #[test]
    fn vote_rejected_lower_id() {
        let reply = test_vote(
            CandStat {
                candidate: lid(3, 0),
                committer: lid(1, 1),
                logs: vec![5, 6],
            },
            VoterStat {
                voted_for: lid(3, 1),
                committer: lid(1, 1),
                author: lid(1, 1),
                logs: vec![5, 6],
                nil_logs: vec![],
            },
        );
        assert_eq!(reply.voted_for, lid(3, 1));
        assert_eq!(records_short_str(&reply.logs), "[]");
    }

    #[test]
    fn vote_regrant_idempotent() {
        // re-voting for the current voted_for grants again, ships nothing new
        let mut core = core_with_status(
            1,
            &[1, 2, 3],
            lid(1, 1),
            lid(1, 1),
            &[5],
            &[],
            &[],
            lid(2, 2),
            0,
        );
        let req = VoteReq {
            candidate: lid(2, 2),
            committer: lid(1, 1),
            accepted: TailBitmap::from(0, vec![5]),
        };
        let reply = core.hdl_vote_req(&req);
        assert_eq!(reply.voted_for, lid(2, 2));
        assert_eq!(records_short_str(&reply.logs), "[]");
        let reply = core.hdl_vote_req(&req);
        assert_eq!(reply.voted_for, lid(2, 2));
    }

    async fn pose(
        node: &crate::server::TRaft,
        committer: LeaderId,
        logs: Vec<i64>,
        voted_for: LeaderId,
    ) -> Result<(), TraftError> {
        node.init_status(
            committer,
            lid(0, 0),
            logs,
            vec![],
            vec![],
            voted_for,
            0,
        )
        .await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn vote_once_outcomes() -> Result<(), TraftError> {
        let nodes = serve_cluster(&[1, 2, 3], 31900).await?;
        let t1 = &nodes[0];

        // all empty, term 0 candidate: both voters hold self-votes with
        // higher ids, and no strictly-higher term exists
        pose(&nodes[1], lid(0, 0), vec![], lid(0, 2)).await?;
        pose(&nodes[2], lid(0, 0), vec![], lid(0, 3)).await?;
        let round = vote_once(
            lid(0, 1),
            t1.log_status().await?,
            t1.cluster_config().await?,
            Duration::from_secs(1),
        )
        .await;
        match round {
            VoteRound::Lost { fault, higher_term } => {
                assert_eq!(fault, ProtoError::StaleTermId);
                assert_eq!(higher_term, -1);
            }
            VoteRound::Won(_) => panic!("term-0 candidate must lose"),
        }

        // term 1 candidate wins over the same voters
        pose(&nodes[1], lid(0, 0), vec![], lid(0, 2)).await?;
        pose(&nodes[2], lid(0, 0), vec![], lid(0, 3)).await?;
        let round = vote_once(
            lid(1, 1),
            t1.log_status().await?,
            t1.cluster_config().await?,
            Duration::from_secs(1),
        )
        .await;
        assert!(matches!(round, VoteRound::Won(_)));

        // one voter with a higher committer rejects, the other grants:
        // quorum of self + 1 still wins
        pose(&nodes[1], lid(2, 0), vec![], lid(0, 2)).await?;
        pose(&nodes[2], lid(0, 0), vec![], lid(0, 3)).await?;
        let round = vote_once(
            lid(1, 1),
            t1.log_status().await?,
            t1.cluster_config().await?,
            Duration::from_secs(1),
        )
        .await;
        assert!(matches!(round, VoteRound::Won(_)));

        // both voters reject: one by committer, one by a longer log
        pose(&nodes[1], lid(2, 0), vec![], lid(0, 2)).await?;
        pose(&nodes[2], lid(0, 0), vec![0], lid(0, 3)).await?;
        let round = vote_once(
            lid(1, 1),
            t1.log_status().await?,
            t1.cluster_config().await?,
            Duration::from_secs(1),
        )
        .await;
        match round {
            VoteRound::Lost { fault, higher_term } => {
                assert_eq!(fault, ProtoError::StaleLog);
                assert_eq!(higher_term, -1);
            }
            VoteRound::Won(_) => panic!("stale-log candidate must lose"),
        }

        // stale log and a higher term seen together: stale log prevails,
        // the higher term is still reported
        pose(&nodes[1], lid(2, 0), vec![], lid(0, 2)).await?;
        pose(&nodes[2], lid(0, 0), vec![0], lid(5, 3)).await?;
        let round = vote_once(
            lid(1, 1),
            t1.log_status().await?,
            t1.cluster_config().await?,
            Duration::from_secs(1),
        )
        .await;
        match round {
            VoteRound::Lost { fault, higher_term } => {
                assert_eq!(fault, ProtoError::StaleLog);
                assert_eq!(higher_term, 5);
            }
            VoteRound::Won(_) => panic!("stale-log candidate must lose"),
        }

        // both reject by term rank only
        pose(&nodes[1], lid(0, 0), vec![], lid(3, 2)).await?;
        pose(&nodes[2], lid(0, 0), vec![], lid(5, 3)).await?;
        let round = vote_once(
            lid(1, 1),
            t1.log_status().await?,
            t1.cluster_config().await?,
            Duration::from_secs(1),
        )
        .await;
        match round {
            VoteRound::Lost { fault, higher_term } => {
                assert_eq!(fault, ProtoError::StaleTermId);
                assert_eq!(higher_term, 5);
            }
            VoteRound::Won(_) => panic!("low-term candidate must lose"),
        }

        for node in nodes {
            node.stop().await?;
        }
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn vote_once_peers_down() -> Result<(), TraftError> {
        // only this node is up; both peers are unreachable
        let nodes = serve_cluster(&[1], 31920).await?;
        let t1 = &nodes[0];

        // peer addresses deliberately point at unbound ports
        let mut addrs = std::collections::HashMap::new();
        addrs.insert(1, "127.0.0.1:31921".to_string());
        addrs.insert(2, "127.0.0.1:31925".to_string());
        addrs.insert(3, "127.0.0.1:31926".to_string());
        let config = ClusterConfig::from_addrs(addrs);

        let round = vote_once(
            lid(1, 1),
            t1.log_status().await?,
            config,
            Duration::from_millis(200),
        )
        .await;
        match round {
            VoteRound::Lost { fault, .. } => {
                assert_eq!(fault, ProtoError::Timeout)
            }
            VoteRound::Won(_) => panic!("cannot win without a quorum"),
        }

        for node in nodes {
            node.stop().await?;
        }
        Ok(())
    }

    #[test]
    fn leadership_merge_discards_unaccepted() {
        // candidate holds an unaccepted tail record; after the merge it
        // must be zeroed and trimmed away
        let mut core = core_with_status(
            1,
            &[1, 2, 3],
            lid(1, 1),
            lid(1, 1),
            &[0],
            &[],
            &[],
            lid(1, 1),
            0,
        );
        // a dangling record beyond the accepted set
        core.logs.push(Record::new(
            lid(1, 1),
            1,
            crate::protocol::Cmd::new_i64("set", "x", 1),
        ));

        let reply = VoteReply {
            voted_for: lid(2, 1),
            committer: lid(1, 2),
            accepted: TailBitmap::from(0, vec![0]),
            committed: TailBitmap::from(0, vec![0]),
            logs: vec![],
        };
        core.establish_leadership(&lid(2, 1), &[(2, reply)]).unwrap();

        assert_eq!(core.logs.len(), 1);
        assert_eq!(core.status[&1].committer, lid(2, 1));
        assert_eq!(core.status[&1].committed, TailBitmap::from(0, vec![0]));
        assert_eq!(core.status[&2].committer, lid(1, 2));
        assert_eq!(core.status[&2].accepted, TailBitmap::from(0, vec![0]));
    }
}
