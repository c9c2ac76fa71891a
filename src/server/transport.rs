//! Peer-peer RPC plumbing: an acceptor task serving `Vote` / `LogForward` /
//! `Replicate` requests by routing them through the action loop, and
//! client-side call helpers that dial a fresh connection per RPC.

use std::net::SocketAddr;

use crate::protocol::{
    LogForwardReply, LogForwardReq, PeerReply, PeerRequest, ReplicateReply,
    ReplicateReq, VoteReply, VoteReq,
};
use crate::server::replica::Action;
use crate::utils::{
    safe_tcp_read, safe_tcp_write, tcp_connect_with_retry, TraftError,
};

use bytes::BytesMut;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};

/// Acceptor task for peer RPC connections.
pub(crate) struct PeerRpcServerTask {
    /// My replica ID.
    me: i64,

    listener: TcpListener,

    /// Sender side of the action channel; all state access goes through it.
    tx_action: mpsc::UnboundedSender<Action>,

    /// Termination signal watcher.
    rx_term: watch::Receiver<bool>,
}

impl PeerRpcServerTask {
    /// Creates the acceptor task around a bound listener.
    pub(crate) fn new(
        me: i64,
        listener: TcpListener,
        tx_action: mpsc::UnboundedSender<Action>,
        rx_term: watch::Receiver<bool>,
    ) -> Self {
        PeerRpcServerTask {
            me,
            listener,
            tx_action,
            rx_term,
        }
    }

    /// Starts the acceptor task loop.
    pub(crate) async fn run(&mut self) {
        let local_addr = self.listener.local_addr().unwrap();
        pf_info!("({}) accepting peer RPCs on '{}'", self.me, local_addr);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            let tx_action = self.tx_action.clone();
                            let rx_term = self.rx_term.clone();
                            tokio::spawn(async move {
                                Self::serve_conn(stream, addr, tx_action, rx_term).await;
                            });
                        }
                        Err(e) => {
                            pf_warn!("error accepting peer connection: {}", e);
                        }
                    }
                },

                _ = self.rx_term.changed() => break,
            }
        }

        pf_debug!("({}) peer RPC acceptor task exited", self.me);
    }

    /// Serves one peer connection: a sequence of request/reply exchanges
    /// until the peer hangs up or the replica terminates.
    async fn serve_conn(
        mut stream: TcpStream,
        addr: SocketAddr,
        tx_action: mpsc::UnboundedSender<Action>,
        mut rx_term: watch::Receiver<bool>,
    ) {
        pf_debug!("peer connection accepted from '{}'", addr);
        let mut read_buf = BytesMut::with_capacity(8 + 1024);

        loop {
            tokio::select! {
                req = safe_tcp_read::<PeerRequest, _>(&mut read_buf, &mut stream) => {
                    let req = match req {
                        Ok(req) => req,
                        Err(_) => break, // peer hung up
                    };
                    let reply = match Self::dispatch(&tx_action, req).await {
                        Ok(reply) => reply,
                        Err(e) => {
                            pf_error!("error dispatching peer request: {}", e);
                            break;
                        }
                    };
                    if let Err(e) = safe_tcp_write(&mut stream, &reply).await {
                        pf_warn!("error replying to '{}': {}", addr, e);
                        break;
                    }
                },

                _ = rx_term.changed() => break,
            }
        }

        pf_debug!("peer connection from '{}' closed", addr);
    }

    /// Routes one request through the action loop and waits for the result.
    async fn dispatch(
        tx_action: &mpsc::UnboundedSender<Action>,
        req: PeerRequest,
    ) -> Result<PeerReply, TraftError> {
        match req {
            PeerRequest::Vote(req) => {
                let (tx, rx) = oneshot::channel();
                tx_action
                    .send(Action::Vote { req, tx })
                    .map_err(TraftError::msg)?;
                Ok(PeerReply::Vote(rx.await?))
            }
            PeerRequest::LogForward(req) => {
                let (tx, rx) = oneshot::channel();
                tx_action
                    .send(Action::LogForward { req, tx })
                    .map_err(TraftError::msg)?;
                Ok(PeerReply::LogForward(rx.await?))
            }
            PeerRequest::Replicate(req) => {
                let (tx, rx) = oneshot::channel();
                tx_action
                    .send(Action::Replicate { req, tx })
                    .map_err(TraftError::msg)?;
                Ok(PeerReply::Replicate(rx.await?))
            }
        }
    }
}

/// Dials a peer for a round of RPC exchanges. A single attempt: a dead
/// peer shows up as a prompt connect error.
pub(crate) async fn peer_connect(addr: &str) -> Result<TcpStream, TraftError> {
    let sock_addr: SocketAddr = addr.parse()?;
    tcp_connect_with_retry(sock_addr, 0).await
}

/// One request/reply exchange on an established peer connection.
pub(crate) async fn peer_call(
    stream: &mut TcpStream,
    req: &PeerRequest,
) -> Result<PeerReply, TraftError> {
    safe_tcp_write(stream, req).await?;
    let mut read_buf = BytesMut::with_capacity(8 + 1024);
    safe_tcp_read(&mut read_buf, stream).await
}

/// Dials `addr` and performs a single request/reply exchange.
pub(crate) async fn rpc_to(
    addr: &str,
    req: &PeerRequest,
) -> Result<PeerReply, TraftError> {
    let mut stream = peer_connect(addr).await?;
    peer_call(&mut stream, req).await
}

/// Dials `addr` for one `LogForward` exchange.
pub(crate) async fn rpc_log_forward(
    addr: &str,
    req: LogForwardReq,
) -> Result<LogForwardReply, TraftError> {
    match rpc_to(addr, &PeerRequest::LogForward(req)).await? {
        PeerReply::LogForward(reply) => Ok(reply),
        _ => logged_err!("unexpected peer reply type to LogForward"),
    }
}

/// Dials `addr` for one `Replicate` exchange.
pub(crate) async fn rpc_replicate(
    addr: &str,
    req: ReplicateReq,
) -> Result<ReplicateReply, TraftError> {
    match rpc_to(addr, &PeerRequest::Replicate(req)).await? {
        PeerReply::Replicate(reply) => Ok(reply),
        _ => logged_err!("unexpected peer reply type to Replicate"),
    }
}

/// Issues one `Vote` exchange on an established connection.
pub(crate) async fn call_vote(
    stream: &mut TcpStream,
    req: &VoteReq,
) -> Result<VoteReply, TraftError> {
    match peer_call(stream, &PeerRequest::Vote(req.clone())).await? {
        PeerReply::Vote(reply) => Ok(reply),
        _ => logged_err!("unexpected peer reply type to Vote"),
    }
}
