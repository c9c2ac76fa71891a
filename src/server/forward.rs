//! The log-forward protocol: leader-side `add_log` and quorum replication
//! fan-out, follower-side acceptance, and the legacy `Replicate` path.

use std::cmp::Ordering;

use crate::protocol::{
    ClusterConfig, Cmd, LeaderId, LogForwardReply, LogForwardReq, ProtoError,
    Record, ReplicateReply, ReplicateReq, TailBitmap,
};
use crate::server::replica::{submit_func, Action, TRaftCore};
use crate::server::transport;
use crate::utils::{usec, Deadline, TraftError};

use tokio::sync::mpsc;
use tokio::time::Duration;

impl TRaftCore {
    /// Appends a new record carrying `cmd` to the log and returns it. Only
    /// an established leader may call this; violation is a programming
    /// error and fatal.
    pub(crate) fn add_log(&mut self, cmd: Cmd) -> Record {
        let me = &self.status[&self.id];
        if me.voted_for.id != self.id {
            panic!("wtf");
        }

        let lsn = self.log_offset + self.logs.len() as i64;
        let mut record = Record::new(me.voted_for.clone(), lsn, cmd);

        // find the first interfering record, newest first; the new record
        // subsumes everything that one subsumed, plus itself
        let mut found = false;
        for prev in self.logs.iter().rev() {
            if record.interferes(prev) {
                record.overrides = prev.overrides.clone();
                record.overrides.set(lsn);
                found = true;
                break;
            }
        }
        if !found {
            // no interfering record
            record.overrides = TailBitmap::new(0);
        }

        // all logs below the local window must be executed in order, since
        // their interfering relations are unknown here
        record.depends = TailBitmap::new(self.log_offset);

        // reduce bitmap size by folding bits below the local window into
        // the dense prefix
        record.overrides.union(&TailBitmap::new(self.log_offset & !63));

        self.logs.push(record.clone());
        record
    }

    /// Post-quorum commit step, run as a `Func` action: marks the forwarded
    /// seq range `[lsns.0, lsns.1)` accepted and committed, provided this
    /// replica still leads under `committer`.
    pub(crate) fn leader_update_committed(
        &mut self,
        committer: &LeaderId,
        lsns: (i64, i64),
    ) -> Result<(), TraftError> {
        let me = self.status.get_mut(&self.id).unwrap();
        if me.voted_for != *committer {
            return logged_err!(
                "leader changed under commit: voted_for {} committer {}",
                me.voted_for.short_str(),
                committer.short_str()
            );
        }

        for lsn in lsns.0..lsns.1 {
            me.accepted.set(lsn);
            me.committed.set(lsn);
        }
        Ok(())
    }

    /// Handles a `LogForward` request from a leader.
    pub(crate) fn hdl_log_forward(
        &mut self,
        req: &LogForwardReq,
    ) -> LogForwardReply {
        let now = usec();
        {
            let me = &self.status[&self.id];
            if req.committer != me.voted_for || now > me.vote_expire_at {
                pf_info!(
                    "reject log-forward: committer {} voted_for {} \
                     lease remaining {}us",
                    req.committer.short_str(),
                    me.voted_for.short_str(),
                    me.vote_expire_at - now
                );
                return LogForwardReply {
                    ok: false,
                    voted_for: me.voted_for.clone(),
                    accepted: TailBitmap::default(),
                    committed: TailBitmap::default(),
                };
            }
        }

        if req.committer > self.status[&self.id].committer {
            pf_info!(
                "newer committer {}, discarding non-committed logs",
                req.committer.short_str()
            );

            // records a prior committer never got committed are stale now
            let me = self.status.get_mut(&self.id).unwrap();
            me.accepted = me.committed.clone();
            let accepted = me.accepted.clone();

            for i in (0..self.logs.len()).rev() {
                if self.logs[i].is_empty() {
                    continue;
                }
                if !accepted.get(self.logs[i].seq) {
                    self.logs[i] = Record::default();
                }
            }
        }

        // add new logs
        for record in &req.logs {
            let lsn = record.seq;
            if lsn < self.log_offset {
                panic!("wtf");
            }
            let idx = (lsn - self.log_offset) as usize;

            // fill in the gap
            while idx >= self.logs.len() {
                self.logs.push(Record::default());
            }

            if !self.logs[idx].is_empty() && self.logs[idx] != *record {
                panic!("wtf");
            }
            self.logs[idx] = record.clone();

            // an overriding record stands in for its overridden
            // predecessors, as if those were already accepted
            self.status
                .get_mut(&self.id)
                .unwrap()
                .accepted
                .union(&record.overrides);
        }

        // remove empty logs at the top
        while let Some(last) = self.logs.last() {
            if last.is_empty() {
                self.logs.pop();
            } else {
                break;
            }
        }

        let me = self.status.get_mut(&self.id).unwrap();
        me.committer = req.committer.clone();

        LogForwardReply {
            ok: true,
            voted_for: me.voted_for.clone(),
            accepted: me.accepted.clone(),
            committed: me.committed.clone(),
        }
    }

    /// Handles a legacy `Replicate` request: the `LogForward` subset
    /// without lease enforcement, and following a strictly greater
    /// committer by advancing `voted_for`.
    pub(crate) fn hdl_replicate(&mut self, req: &ReplicateReq) -> ReplicateReply {
        {
            let me = &self.status[&self.id];
            if me.voted_for < me.committer {
                panic!("wtf");
            }
        }

        let mut reply = ReplicateReply {
            voted_for: self.status[&self.id].voted_for.clone(),
            accepted: TailBitmap::default(),
            committed: TailBitmap::default(),
        };

        // check leadership
        match req.committer.cmp(&self.status[&self.id].voted_for) {
            Ordering::Less => return reply,
            Ordering::Greater => {
                // a legal leader with higher rank; follow it
                self.status.get_mut(&self.id).unwrap().voted_for =
                    req.committer.clone();
            }
            Ordering::Equal => {}
        }

        if req.committer > self.status[&self.id].committer {
            self.status.get_mut(&self.id).unwrap().committer =
                req.committer.clone();
        }

        for record in &req.logs {
            let lsn = record.seq;
            if lsn < self.log_offset {
                panic!("wtf");
            }
            let idx = (lsn - self.log_offset) as usize;

            // fill in the gap
            while idx >= self.logs.len() {
                self.logs.push(Record::default());
            }
            self.logs[idx] = record.clone();

            self.status
                .get_mut(&self.id)
                .unwrap()
                .accepted
                .union(&record.overrides);
        }

        let me = &self.status[&self.id];
        reply.accepted = me.accepted.clone();
        reply.committed = me.committed.clone();
        reply
    }
}

/// Outcome of one replication round.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ForwardRound {
    /// A quorum acknowledged and the leader advanced its committed set.
    Committed,

    /// The round failed with the given protocol fault.
    Failed(ProtoError),
}

/// Forwards a batch of records to all followers and, upon quorum
/// acknowledgement, advances the leader's committed set through the action
/// loop. `logs` must be non-empty and contiguous in seq.
pub(crate) async fn forward_log(
    my_id: i64,
    tx_action: &mpsc::UnboundedSender<Action>,
    committer: LeaderId,
    config: ClusterConfig,
    logs: Vec<Record>,
    timeout: Duration,
) -> Result<ForwardRound, TraftError> {
    if logs.is_empty() {
        return logged_err!("empty batch of logs to forward");
    }
    let lsns = (logs[0].seq, logs[logs.len() - 1].seq + 1);
    pf_info!(
        "forward lsns [{}, {}) committer {}",
        lsns.0,
        lsns.1,
        committer.short_str()
    );

    let req = LogForwardReq {
        committer: committer.clone(),
        logs,
    };

    let (tx_reply, mut rx_reply) = mpsc::unbounded_channel();
    for rinfo in config.members.values() {
        if rinfo.id == my_id {
            continue;
        }

        let rinfo = rinfo.clone();
        let req = req.clone();
        let tx_reply = tx_reply.clone();
        tokio::spawn(async move {
            let res = transport::rpc_log_forward(&rinfo.addr, req).await;
            let _ = tx_reply.send((rinfo, res));
        });
    }
    drop(tx_reply);

    // my own ack
    let mut received = config.position_bit(my_id);
    let mut waiting = config.members.len() - 1;

    let deadline = Deadline::after(timeout);

    while waiting > 0 {
        tokio::select! {
            () = deadline.expired() => {
                pf_info!("forward timeout, committer {}", committer.short_str());
                return Ok(ForwardRound::Failed(ProtoError::Timeout));
            }

            res = rx_reply.recv() => {
                let (rinfo, res) = match res {
                    Some(res) => res,
                    None => break,
                };
                waiting -= 1;

                let reply = match res {
                    Ok(reply) => reply,
                    Err(e) => {
                        // an unreachable or failing peer is a non-ack
                        pf_warn!("forward rpc -> {} failed: {}", rinfo.id, e);
                        continue;
                    }
                };

                if reply.ok {
                    received |= 1u64 << rinfo.position;
                    if config.is_quorum(received) {
                        let cmtr = committer.clone();
                        let commit = submit_func(
                            tx_action,
                            Box::new(move |core| {
                                core.leader_update_committed(&cmtr, lsns)
                            }),
                        )
                        .await;

                        return Ok(match commit {
                            Ok(()) => {
                                pf_info!("forward reached quorum");
                                ForwardRound::Committed
                            }
                            Err(_) => {
                                ForwardRound::Failed(ProtoError::LeaderLost)
                            }
                        });
                    }
                }
            }
        }
    }

    // every reply came back without reaching quorum
    Ok(ForwardRound::Failed(ProtoError::Timeout))
}
