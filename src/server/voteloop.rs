//! The per-replica election driver: watches the leader lease, elects itself
//! when the lease runs out, and backs off according to why a round failed.

use crate::protocol::{LeaderId, ProtoError};
use crate::server::replica::{
    query_config, query_leader_stat, query_log_stat, submit_func,
    update_leader_stat, Action, ReplicaConfigTRaft,
};
use crate::server::vote::{vote_once, VoteRound};
use crate::utils::usec;

use rand::Rng;

use tokio::sync::{mpsc, watch};
use tokio::time::{self, Duration};

/// The election driver task, one per replica.
pub(crate) struct VoteLoopTask {
    /// My replica ID.
    me: i64,

    /// Configuration parameters struct.
    config: ReplicaConfigTRaft,

    /// Sender side of the action channel.
    tx_action: mpsc::UnboundedSender<Action>,

    /// Termination signal watcher.
    rx_term: watch::Receiver<bool>,
}

impl VoteLoopTask {
    /// Creates the election driver task.
    pub(crate) fn new(
        me: i64,
        config: ReplicaConfigTRaft,
        tx_action: mpsc::UnboundedSender<Action>,
        rx_term: watch::Receiver<bool>,
    ) -> Self {
        VoteLoopTask {
            me,
            config,
            tx_action,
            rx_term,
        }
    }

    /// Sleeps for `dur`, or returns true immediately if termination is
    /// signalled first.
    async fn pause(&mut self, dur: Duration) -> bool {
        tokio::select! {
            _ = time::sleep(dur) => false,
            _ = self.rx_term.changed() => true,
        }
    }

    /// Starts the election driver loop.
    pub(crate) async fn run(&mut self) {
        pf_debug!("({}) vote loop task spawned", self.me);

        let leader_lease = (self.config.leader_lease_ms * 1000) as i64;
        let heartbeat = Duration::from_millis(self.config.heartbeat_interval_ms);
        let follower_sleep = Duration::from_millis(self.config.follower_sleep_ms);
        let vote_timeout = Duration::from_millis(self.config.vote_timeout_ms);

        let mut leadst = match query_leader_stat(&self.tx_action).await {
            Ok(leadst) => leadst,
            Err(_) => return, // replica already torn down
        };

        loop {
            if *self.rx_term.borrow() {
                break;
            }
            let now = usec();

            if now < leadst.vote_expire_at {
                let dur = if leadst.voted_for.id == self.me {
                    // I am the leader
                    // future: send heartbeats to keep leadership
                    heartbeat
                } else {
                    follower_sleep
                };
                if self.pause(dur).await {
                    break;
                }
                leadst = match query_leader_stat(&self.tx_action).await {
                    Ok(leadst) => leadst,
                    Err(_) => break,
                };
                continue;
            }

            // the lease ran out: call for a new leader, one term up
            let logst = match query_log_stat(&self.tx_action).await {
                Ok(logst) => logst,
                Err(_) => break,
            };
            let cluster = match query_config(&self.tx_action).await {
                Ok(cluster) => cluster,
                Err(_) => break,
            };
            let candidate =
                LeaderId::new(leadst.voted_for.term + 1, self.me);
            pf_info!("({}) election round as {}", self.me, candidate.short_str());

            match vote_once(candidate.clone(), logst, cluster, vote_timeout)
                .await
            {
                VoteRound::Won(replies) => {
                    // reconcile the voters' logs before taking proposals,
                    // then record the lease
                    let cand = candidate.clone();
                    if let Err(e) = submit_func(
                        &self.tx_action,
                        Box::new(move |core| {
                            core.establish_leadership(&cand, &replies)
                        }),
                    )
                    .await
                    {
                        pf_error!(
                            "({}) error establishing leadership: {}",
                            self.me,
                            e
                        );
                        continue;
                    }

                    leadst.voted_for = candidate;
                    leadst.vote_expire_at = usec() + leader_lease;
                    if update_leader_stat(&self.tx_action, leadst.clone())
                        .await
                        .is_err()
                    {
                        break;
                    }

                    if self.pause(heartbeat).await {
                        break;
                    }
                }

                VoteRound::Lost { fault, higher_term } => {
                    pf_info!(
                        "({}) vote failed as {}: {}",
                        self.me,
                        candidate.short_str(),
                        fault
                    );
                    match fault {
                        ProtoError::StaleTermId => {
                            // randomized backoff so colliding candidates
                            // separate, then catch up to the seen term
                            let jitter = rand::thread_rng().gen_range(
                                0..self.config.max_stale_term_sleep_ms.max(1),
                            );
                            if self
                                .pause(Duration::from_millis(5 + jitter))
                                .await
                            {
                                break;
                            }
                            if higher_term > leadst.voted_for.term {
                                leadst.voted_for.term = higher_term;
                            }
                        }

                        ProtoError::StaleLog => {
                            // cannot lead until my log catches up; park and
                            // wait for someone else to get elected
                            if self.pause(Duration::from_secs(86400)).await {
                                break;
                            }
                        }

                        ProtoError::Timeout | ProtoError::LeaderLost => {
                            if self.pause(Duration::from_millis(10)).await {
                                break;
                            }
                        }
                    }
                }
            }
        }

        pf_debug!("({}) vote loop task exited", self.me);
    }
}

#[cfg(test)]
mod voteloop_tests {
    use super::*;
    use crate::protocol::{records_short_str, TailBitmap};
    use crate::server::testutil::{serve_cluster, snapshot};
    use crate::utils::TraftError;

    fn lid(term: i64, id: i64) -> LeaderId {
        LeaderId::new(term, id)
    }

    /// Polls until `cond` holds on node's leader status, or panics after
    /// ~3 s.
    async fn wait_for_leader(
        node: &crate::server::TRaft,
        want: &LeaderId,
    ) -> Result<(), TraftError> {
        for _ in 0..300 {
            let leadst = node.leader_status().await?;
            if leadst.voted_for == *want && leadst.vote_expire_at > usec() {
                return Ok(());
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no leader {} observed in time", want.short_str());
    }

    /// Spawns the vote loop of `node` manually (all test clusters are
    /// created with the automatic one disabled). A long lease keeps the
    /// winner from re-electing under the assertions below.
    fn start_vote_loop(node: &crate::server::TRaft) {
        let config = ReplicaConfigTRaft {
            leader_lease_ms: 60_000,
            ..Default::default()
        };
        let mut task = VoteLoopTask::new(
            node.id(),
            config,
            node.tx_action.clone(),
            node.tx_term.subscribe(),
        );
        tokio::spawn(async move { task.run().await });
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn empty_voters_elect_one() -> Result<(), TraftError> {
        let nodes = serve_cluster(&[1, 2, 3], 32000).await?;

        // fresh replicas all hold self-votes at term 0; candidate 1 must
        // come out leader at term 1
        start_vote_loop(&nodes[0]);
        wait_for_leader(&nodes[0], &lid(1, 1)).await?;

        // the voters granted and recorded it; quorum needs only one of
        // them, so poll for the slower grant
        for voter in &nodes[1..] {
            let mut granted = false;
            for _ in 0..300 {
                if voter.leader_status().await?.voted_for == lid(1, 1) {
                    granted = true;
                    break;
                }
                time::sleep(Duration::from_millis(10)).await;
            }
            assert!(granted, "voter {} never granted", voter.id());
        }

        // the winner raised its own committer
        let (_, _, status) = snapshot(&nodes[0]).await?;
        assert_eq!(status[&1].committer, lid(1, 1));

        for node in nodes {
            node.stop().await?;
        }
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn election_merges_heterogeneous_logs() -> Result<(), TraftError> {
        // five members, two of them down; the three live replicas hold
        // different accepted sets and committers
        let ids = [0, 1, 2, 3, 4];
        let nodes = serve_cluster_partial(&ids, &[0, 1, 2], 32010).await?;

        nodes[0]
            .init_status(
                lid(2, 0),
                lid(1, 1),
                vec![0, 2],
                vec![],
                vec![],
                lid(0, 0),
                0,
            )
            .await?;
        nodes[1]
            .init_status(
                lid(3, 1),
                lid(1, 1),
                vec![0, 4],
                vec![],
                vec![],
                lid(3, 1),
                0,
            )
            .await?;
        nodes[2]
            .init_status(
                lid(1, 2),
                lid(2, 1),
                vec![0, 3],
                vec![],
                vec![0],
                lid(0, 2),
                0,
            )
            .await?;

        start_vote_loop(&nodes[1]);
        wait_for_leader(&nodes[1], &lid(4, 1)).await?;

        let (_, logs, status) = snapshot(&nodes[1]).await?;
        assert_eq!(
            records_short_str(&logs),
            "[<001#001:000{set(x, 0)}-0→0>, \
             <>, \
             <001#001:002{set(x, 2)}-0→0>, \
             <002#001:003{set(x, 3)}-0→0>, \
             <001#001:004{set(x, 4)}-0→0>]"
        );

        assert_eq!(status[&1].committer, lid(4, 1));
        assert_eq!(
            status[&1].accepted,
            TailBitmap::from(0, vec![0, 2, 3, 4])
        );
        assert_eq!(status[&1].committed, TailBitmap::from(0, vec![0]));

        // the leader's view of voter 0: accepted reduced to its (empty)
        // committed set
        assert_eq!(status[&0].committer, lid(2, 0));
        assert_eq!(status[&0].accepted, TailBitmap::new(0));
        assert_eq!(status[&0].committed, TailBitmap::new(0));

        // and of voter 2: reduced to {0}
        assert_eq!(status[&2].committer, lid(1, 2));
        assert_eq!(status[&2].accepted, TailBitmap::from(0, vec![0]));
        assert_eq!(status[&2].committed, TailBitmap::from(0, vec![0]));

        for node in nodes {
            node.stop().await?;
        }
        Ok(())
    }

    /// Like `serve_cluster` but only starts the listed members; the rest
    /// stay down (their addresses refuse connections).
    async fn serve_cluster_partial(
        ids: &[i64],
        up: &[i64],
        base_port: u16,
    ) -> Result<Vec<crate::server::TRaft>, TraftError> {
        use std::collections::HashMap;
        let addrs: HashMap<i64, String> = ids
            .iter()
            .map(|&id| (id, format!("127.0.0.1:{}", base_port + id as u16)))
            .collect();
        let mut nodes = vec![];
        for &id in up {
            nodes.push(
                crate::server::TRaft::new_and_setup(
                    id,
                    addrs.clone(),
                    Some("disable_vote_loop = true"),
                )
                .await?,
            );
        }
        Ok(nodes)
    }
}
