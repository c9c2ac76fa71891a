//! Shared helpers for posing replicas in arbitrary protocol states during
//! tests. All generated logs are `set x=lsn`.

use std::collections::HashMap;

use crate::protocol::{
    ClusterConfig, Cmd, LeaderId, Record, ReplicaStatus, TailBitmap,
};
use crate::server::replica::{submit_func, TRaft, TRaftCore};
use crate::utils::TraftError;

use tokio::sync::oneshot;

/// Builds a log window covering `lsns`, with holes everywhere else and at
/// the listed nil lsns. Returns `(log_offset, logs)`.
pub(crate) fn build_pseudo_logs(
    author: &LeaderId,
    lsns: &[i64],
    nil_lsns: &[i64],
) -> (i64, Vec<Record>) {
    if lsns.is_empty() {
        return (0, vec![]);
    }

    let start = lsns[0];
    let last = lsns[lsns.len() - 1];
    let mut logs = vec![Record::default(); (last - start + 1) as usize];

    for &lsn in lsns {
        if nil_lsns.contains(&lsn) {
            continue;
        }
        logs[(lsn - start) as usize] = Record::new(
            author.clone(),
            lsn,
            Cmd::new_i64("set", "x", lsn),
        );
    }
    (start, logs)
}

/// A fresh core for member `id` of a localhost cluster over `ids`.
pub(crate) fn fresh_core(id: i64, ids: &[i64]) -> TRaftCore {
    let addrs: HashMap<i64, String> = ids
        .iter()
        .map(|&m| (m, format!("127.0.0.1:{}", 30000 + m)))
        .collect();
    TRaftCore::new(id, ClusterConfig::from_addrs(addrs))
}

/// A core posed in the given state, mirroring what `init_status` does to a
/// running replica.
#[allow(clippy::too_many_arguments)]
pub(crate) fn core_with_status(
    id: i64,
    ids: &[i64],
    committer: LeaderId,
    author: LeaderId,
    lsns: &[i64],
    nil_lsns: &[i64],
    committed: &[i64],
    voted_for: LeaderId,
    vote_expire_at: i64,
) -> TRaftCore {
    let mut core = fresh_core(id, ids);
    let (log_offset, logs) = build_pseudo_logs(&author, lsns, nil_lsns);
    core.log_offset = log_offset;
    core.logs = logs;

    let me = core.status.get_mut(&id).unwrap();
    me.committer = committer;
    me.accepted = TailBitmap::from(0, lsns.to_vec());
    me.committed = TailBitmap::from(0, committed.to_vec());
    me.voted_for = voted_for;
    me.vote_expire_at = vote_expire_at;

    core
}

impl TRaft {
    /// Poses this replica in an arbitrary state through its action loop.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn init_status(
        &self,
        committer: LeaderId,
        author: LeaderId,
        lsns: Vec<i64>,
        nil_lsns: Vec<i64>,
        committed: Vec<i64>,
        voted_for: LeaderId,
        vote_expire_at: i64,
    ) -> Result<(), TraftError> {
        submit_func(
            &self.tx_action,
            Box::new(move |core| {
                let (log_offset, logs) =
                    build_pseudo_logs(&author, &lsns, &nil_lsns);
                core.log_offset = log_offset;
                core.logs = logs;

                let me = core.status.get_mut(&core.id).unwrap();
                me.committer = committer;
                me.accepted = TailBitmap::from(0, lsns.clone());
                me.committed = TailBitmap::from(0, committed.clone());
                me.voted_for = voted_for;
                me.vote_expire_at = vote_expire_at;
                Ok(())
            }),
        )
        .await
    }
}

/// Reads a consistent snapshot of a replica's log window and status map.
pub(crate) async fn snapshot(
    node: &TRaft,
) -> Result<(i64, Vec<Record>, HashMap<i64, ReplicaStatus>), TraftError> {
    let (tx, rx) = oneshot::channel();
    submit_func(
        &node.tx_action,
        Box::new(move |core| {
            let _ = tx.send((
                core.log_offset,
                core.logs.clone(),
                core.status.clone(),
            ));
            Ok(())
        }),
    )
    .await?;
    Ok(rx.await?)
}

/// Brings up a localhost cluster over `ids` with the automatic vote loops
/// disabled, so that tests drive elections explicitly.
pub(crate) async fn serve_cluster(
    ids: &[i64],
    base_port: u16,
) -> Result<Vec<TRaft>, TraftError> {
    let addrs: HashMap<i64, String> = ids
        .iter()
        .map(|&id| (id, format!("127.0.0.1:{}", base_port + id as u16)))
        .collect();

    let mut nodes = vec![];
    for &id in ids {
        nodes.push(
            TRaft::new_and_setup(
                id,
                addrs.clone(),
                Some("disable_vote_loop = true"),
            )
            .await?,
        );
    }
    Ok(nodes)
}
