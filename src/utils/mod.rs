//! Helper utilities, functions, and macros.

#[macro_use]
mod print;

mod error;
mod safetcp;
mod timer;

pub use error::TraftError;
pub use timer::usec;

pub(crate) use safetcp::{
    safe_tcp_read, safe_tcp_write, tcp_bind_with_retry, tcp_connect_with_retry,
};
pub(crate) use timer::Deadline;
