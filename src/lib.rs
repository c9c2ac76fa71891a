//! Public interface to the TRaft core library: a replicated log protocol
//! whose records carry explicit override/dependency bitmaps, so concurrent
//! non-conflicting commands may be accepted out of order while a
//! serializable commit order is preserved.

#[macro_use]
mod utils;

mod protocol;
mod server;

pub use protocol::{
    cmp_log_status, records_short_str, ClusterConfig, Cmd, LeaderId,
    LeaderStatus, LogForwardReply, LogForwardReq, LogStat, LogStatus,
    ProtoError, Record, ReplicaInfo, ReplicaStatus, ReplicateReply,
    ReplicateReq, TailBitmap, VoteReply, VoteReq,
};
pub use server::{ReplicaConfigTRaft, TRaft};
pub use utils::{usec, TraftError};
