//! TRaft per-replica core state, the serialized action loop that owns it,
//! and the public replica handle.
//!
//! Only the action loop task touches core state. Every other component,
//! including RPC handler tasks and the vote loop, submits an `Action` and
//! waits for the result on a oneshot channel. This is the sole concurrency
//! discipline for in-process state; no locks are involved.

use std::collections::HashMap;

use crate::protocol::{
    ClusterConfig, Cmd, LeaderStatus, LogForwardReply, LogForwardReq,
    LogStatus, Record, ReplicaStatus, ReplicateReply, ReplicateReq, VoteReply,
    VoteReq,
};
use crate::server::forward::{forward_log, ForwardRound};
use crate::server::transport::PeerRpcServerTask;
use crate::server::voteloop::VoteLoopTask;
use crate::utils::{tcp_bind_with_retry, TraftError};

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Duration;

/// Configuration parameters struct.
#[derive(Debug, Clone)]
pub struct ReplicaConfigTRaft {
    /// Leader lease duration in millisecs.
    pub leader_lease_ms: u64,

    /// Established leader's sleep quantum between loop rounds in millisecs.
    pub heartbeat_interval_ms: u64,

    /// Follower's sleep quantum between lease checks in millisecs.
    pub follower_sleep_ms: u64,

    /// Max randomized extra backoff after a stale-term election round.
    pub max_stale_term_sleep_ms: u64,

    /// Election round deadline in millisecs.
    pub vote_timeout_ms: u64,

    /// Log replication round deadline in millisecs.
    pub forward_timeout_ms: u64,

    /// Disable the vote loop (to pose replicas manually during tests).
    pub disable_vote_loop: bool,
}

impl Default for ReplicaConfigTRaft {
    fn default() -> Self {
        ReplicaConfigTRaft {
            leader_lease_ms: 1000,
            heartbeat_interval_ms: 10,
            follower_sleep_ms: 10,
            max_stale_term_sleep_ms: 10,
            vote_timeout_ms: 1000,
            forward_timeout_ms: 1000,
            disable_vote_loop: false,
        }
    }
}

impl ReplicaConfigTRaft {
    /// Builds a config from the defaults, overlaid with the fields present
    /// in the given TOML string, then validated as a whole.
    pub fn from_str(config_str: Option<&str>) -> Result<Self, TraftError> {
        let mut config = ReplicaConfigTRaft::default();

        if let Some(config_str) = config_str {
            let table = config_str.parse::<toml::Table>()?;
            for (key, value) in table {
                config.set_field(&key, value)?;
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Overwrites one field from a parsed TOML value.
    fn set_field(
        &mut self,
        key: &str,
        value: toml::Value,
    ) -> Result<(), TraftError> {
        match key {
            "leader_lease_ms" => self.leader_lease_ms = value.try_into()?,
            "heartbeat_interval_ms" => {
                self.heartbeat_interval_ms = value.try_into()?
            }
            "follower_sleep_ms" => self.follower_sleep_ms = value.try_into()?,
            "max_stale_term_sleep_ms" => {
                self.max_stale_term_sleep_ms = value.try_into()?
            }
            "vote_timeout_ms" => self.vote_timeout_ms = value.try_into()?,
            "forward_timeout_ms" => {
                self.forward_timeout_ms = value.try_into()?
            }
            "disable_vote_loop" => self.disable_vote_loop = value.try_into()?,
            _ => return logged_err!("unrecognized config field '{}'", key),
        }
        Ok(())
    }

    /// Checks the timing fields against each other. A leader must be able
    /// to wake up well inside its own lease.
    fn validate(&self) -> Result<(), TraftError> {
        if self.leader_lease_ms == 0 {
            return logged_err!(
                "invalid config.leader_lease_ms '{}'",
                self.leader_lease_ms
            );
        }
        if self.heartbeat_interval_ms == 0
            || self.heartbeat_interval_ms > self.leader_lease_ms
        {
            return logged_err!(
                "invalid config.heartbeat_interval_ms '{}' for lease '{}'",
                self.heartbeat_interval_ms,
                self.leader_lease_ms
            );
        }
        if self.follower_sleep_ms == 0 {
            return logged_err!(
                "invalid config.follower_sleep_ms '{}'",
                self.follower_sleep_ms
            );
        }
        if self.vote_timeout_ms == 0 {
            return logged_err!(
                "invalid config.vote_timeout_ms '{}'",
                self.vote_timeout_ms
            );
        }
        if self.forward_timeout_ms == 0 {
            return logged_err!(
                "invalid config.forward_timeout_ms '{}'",
                self.forward_timeout_ms
            );
        }
        Ok(())
    }
}

/// A closure executed by the action loop against the core state; used for
/// multi-field transitions such as post-quorum commit and election merge.
pub(crate) type StateFunc =
    Box<dyn FnOnce(&mut TRaftCore) -> Result<(), TraftError> + Send + 'static>;

/// One serialized operation against the replica core.
pub(crate) enum Action {
    /// Read the log-freshness snapshot of self.
    LogStat { tx: oneshot::Sender<LogStatus> },

    /// Read the leadership snapshot of self.
    LeaderStat { tx: oneshot::Sender<LeaderStatus> },

    /// Clone the cluster configuration.
    Config { tx: oneshot::Sender<ClusterConfig> },

    /// Write self's `voted_for` and `vote_expire_at`.
    UpdateLeaderStat {
        stat: LeaderStatus,
        tx: oneshot::Sender<()>,
    },

    /// Execute an arbitrary closure against the state.
    Func {
        func: StateFunc,
        tx: oneshot::Sender<Result<(), TraftError>>,
    },

    /// Leader-only: append a new record to the log.
    AddLog {
        cmd: Cmd,
        tx: oneshot::Sender<Record>,
    },

    /// Handle a `Vote` RPC.
    Vote {
        req: VoteReq,
        tx: oneshot::Sender<VoteReply>,
    },

    /// Handle a `LogForward` RPC.
    LogForward {
        req: LogForwardReq,
        tx: oneshot::Sender<LogForwardReply>,
    },

    /// Handle a `Replicate` RPC (legacy path).
    Replicate {
        req: ReplicateReq,
        tx: oneshot::Sender<ReplicateReply>,
    },
}

/// The replica core state. Owned exclusively by the action loop task.
pub(crate) struct TRaftCore {
    /// My replica ID.
    pub(crate) id: i64,

    /// Cluster configuration, immutable after startup.
    pub(crate) config: ClusterConfig,

    /// Absolute seq of `logs[0]`; everything below has been forgotten.
    pub(crate) log_offset: i64,

    /// In-memory log window; empty records mark holes.
    pub(crate) logs: Vec<Record>,

    /// My own status plus my view of every other member's status.
    pub(crate) status: HashMap<i64, ReplicaStatus>,
}

impl TRaftCore {
    /// Creates a fresh core; every member starts with a self-directed vote
    /// at term 0.
    pub(crate) fn new(id: i64, config: ClusterConfig) -> Self {
        let status = config
            .members
            .keys()
            .map(|&m| (m, ReplicaStatus::new(m)))
            .collect();
        TRaftCore {
            id,
            config,
            log_offset: 0,
            logs: vec![],
            status,
        }
    }

    /// Applies one action and replies on its oneshot. A dropped receiver
    /// only means the caller gave up waiting.
    fn handle_action(&mut self, action: Action) {
        match action {
            Action::LogStat { tx } => {
                let _ = tx.send(self.status[&self.id].log_status());
            }
            Action::LeaderStat { tx } => {
                let _ = tx.send(self.status[&self.id].leader_status());
            }
            Action::Config { tx } => {
                let _ = tx.send(self.config.clone());
            }
            Action::UpdateLeaderStat { stat, tx } => {
                let me = self.status.get_mut(&self.id).unwrap();
                me.voted_for = stat.voted_for;
                me.vote_expire_at = stat.vote_expire_at;
                let _ = tx.send(());
            }
            Action::Func { func, tx } => {
                let _ = tx.send(func(self));
            }
            Action::AddLog { cmd, tx } => {
                let _ = tx.send(self.add_log(cmd));
            }
            Action::Vote { req, tx } => {
                let _ = tx.send(self.hdl_vote_req(&req));
            }
            Action::LogForward { req, tx } => {
                let _ = tx.send(self.hdl_log_forward(&req));
            }
            Action::Replicate { req, tx } => {
                let _ = tx.send(self.hdl_replicate(&req));
            }
        }
    }
}

/// The action loop task: sole mutator of the replica core.
pub(crate) struct ActionLoopTask {
    core: TRaftCore,
    rx_action: mpsc::UnboundedReceiver<Action>,
    rx_term: watch::Receiver<bool>,
}

impl ActionLoopTask {
    fn new(
        core: TRaftCore,
        rx_action: mpsc::UnboundedReceiver<Action>,
        rx_term: watch::Receiver<bool>,
    ) -> Self {
        ActionLoopTask {
            core,
            rx_action,
            rx_term,
        }
    }

    /// Starts the action loop.
    async fn run(&mut self) {
        pf_debug!("({}) action loop task spawned", self.core.id);

        loop {
            tokio::select! {
                action = self.rx_action.recv() => {
                    match action {
                        Some(action) => self.core.handle_action(action),
                        None => break, // all senders dropped
                    }
                },

                _ = self.rx_term.changed() => break,
            }
        }

        pf_debug!("({}) action loop task exited", self.core.id);
    }
}

/// Submits a `LogStat` query to an action channel.
pub(crate) async fn query_log_stat(
    tx_action: &mpsc::UnboundedSender<Action>,
) -> Result<LogStatus, TraftError> {
    let (tx, rx) = oneshot::channel();
    tx_action
        .send(Action::LogStat { tx })
        .map_err(TraftError::msg)?;
    Ok(rx.await?)
}

/// Submits a `LeaderStat` query to an action channel.
pub(crate) async fn query_leader_stat(
    tx_action: &mpsc::UnboundedSender<Action>,
) -> Result<LeaderStatus, TraftError> {
    let (tx, rx) = oneshot::channel();
    tx_action
        .send(Action::LeaderStat { tx })
        .map_err(TraftError::msg)?;
    Ok(rx.await?)
}

/// Submits a `Config` query to an action channel.
pub(crate) async fn query_config(
    tx_action: &mpsc::UnboundedSender<Action>,
) -> Result<ClusterConfig, TraftError> {
    let (tx, rx) = oneshot::channel();
    tx_action
        .send(Action::Config { tx })
        .map_err(TraftError::msg)?;
    Ok(rx.await?)
}

/// Submits an `UpdateLeaderStat` write to an action channel.
pub(crate) async fn update_leader_stat(
    tx_action: &mpsc::UnboundedSender<Action>,
    stat: LeaderStatus,
) -> Result<(), TraftError> {
    let (tx, rx) = oneshot::channel();
    tx_action
        .send(Action::UpdateLeaderStat { stat, tx })
        .map_err(TraftError::msg)?;
    Ok(rx.await?)
}

/// Submits a `Func` closure to an action channel and waits for its result.
pub(crate) async fn submit_func(
    tx_action: &mpsc::UnboundedSender<Action>,
    func: StateFunc,
) -> Result<(), TraftError> {
    let (tx, rx) = oneshot::channel();
    tx_action
        .send(Action::Func { func, tx })
        .map_err(TraftError::msg)?;
    rx.await?
}

/// TRaft replica handle: spawns the action loop, the peer RPC acceptor,
/// and (unless disabled) the vote loop.
pub struct TRaft {
    /// My replica ID.
    id: i64,

    /// Configuration parameters struct.
    config: ReplicaConfigTRaft,

    /// Sender side of the action channel.
    pub(crate) tx_action: mpsc::UnboundedSender<Action>,

    /// Termination signal; all tasks observe it within one sleep quantum.
    pub(crate) tx_term: watch::Sender<bool>,

    /// Join handles of the spawned tasks.
    handles: Vec<JoinHandle<()>>,
}

impl TRaft {
    /// Creates a new replica for member `id` of the cluster described by
    /// the id -> address table, and spawns its tasks. `config_str` may
    /// override `ReplicaConfigTRaft` fields in TOML.
    pub async fn new_and_setup(
        id: i64,
        addrs: HashMap<i64, String>,
        config_str: Option<&str>,
    ) -> Result<Self, TraftError> {
        if !addrs.contains_key(&id) {
            return logged_err!("member {} not in cluster address table", id);
        }

        let config = ReplicaConfigTRaft::from_str(config_str)?;

        let cluster = ClusterConfig::from_addrs(addrs);
        let core = TRaftCore::new(id, cluster.clone());

        let (tx_action, rx_action) = mpsc::unbounded_channel();
        let (tx_term, rx_term) = watch::channel(false);

        let mut handles = vec![];

        let mut action_loop =
            ActionLoopTask::new(core, rx_action, rx_term.clone());
        handles.push(tokio::spawn(async move { action_loop.run().await }));

        let p2p_addr = cluster.members[&id].addr.parse()?;
        let listener = tcp_bind_with_retry(p2p_addr, 10).await?;
        let mut rpc_server = PeerRpcServerTask::new(
            id,
            listener,
            tx_action.clone(),
            rx_term.clone(),
        );
        handles.push(tokio::spawn(async move { rpc_server.run().await }));

        if !config.disable_vote_loop {
            let mut vote_loop = VoteLoopTask::new(
                id,
                config.clone(),
                tx_action.clone(),
                rx_term.clone(),
            );
            handles.push(tokio::spawn(async move { vote_loop.run().await }));
        }

        Ok(TRaft {
            id,
            config,
            tx_action,
            tx_term,
            handles,
        })
    }

    /// My replica ID.
    pub fn id(&self) -> i64 {
        self.id
    }

    /// Reads self's log-freshness snapshot.
    pub async fn log_status(&self) -> Result<LogStatus, TraftError> {
        query_log_stat(&self.tx_action).await
    }

    /// Reads self's leadership snapshot.
    pub async fn leader_status(&self) -> Result<LeaderStatus, TraftError> {
        query_leader_stat(&self.tx_action).await
    }

    /// Clones the cluster configuration.
    pub async fn cluster_config(&self) -> Result<ClusterConfig, TraftError> {
        query_config(&self.tx_action).await
    }

    /// Writes self's `voted_for` and `vote_expire_at`.
    pub async fn update_leader_status(
        &self,
        stat: LeaderStatus,
    ) -> Result<(), TraftError> {
        update_leader_stat(&self.tx_action, stat).await
    }

    /// Leader-only: appends a record to the log without replicating it.
    pub async fn add_log(&self, cmd: Cmd) -> Result<Record, TraftError> {
        let (tx, rx) = oneshot::channel();
        self.tx_action
            .send(Action::AddLog { cmd, tx })
            .map_err(TraftError::msg)?;
        Ok(rx.await?)
    }

    /// Leader-only: appends a record, forwards it to all followers, and
    /// returns it once a quorum has acknowledged. Fails with the wrapped
    /// `ProtoError` kind on timeout or leadership loss.
    pub async fn propose(&self, cmd: Cmd) -> Result<Record, TraftError> {
        let record = self.add_log(cmd).await?;
        let leadst = self.leader_status().await?;
        let cluster = self.cluster_config().await?;

        let round = forward_log(
            self.id,
            &self.tx_action,
            leadst.voted_for,
            cluster,
            vec![record.clone()],
            Duration::from_millis(self.config.forward_timeout_ms),
        )
        .await?;

        match round {
            ForwardRound::Committed => Ok(record),
            ForwardRound::Failed(fault) => Err(fault.into()),
        }
    }

    /// Signals termination and joins all spawned tasks.
    pub async fn stop(mut self) -> Result<(), TraftError> {
        self.tx_term.send(true)?;
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
        Ok(())
    }
}
