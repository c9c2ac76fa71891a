//! Safe TCP bind/connect/read/write helper functions.
//!
//! Peer RPCs in TRaft are strict request/reply exchanges on short-lived
//! connections, so framing here is plain `write_all`/`read_buf` with an
//! 8-byte big-endian length prefix followed by the MessagePack bytes of
//! the object.

use std::marker::Unpin;
use std::net::SocketAddr;

use crate::utils::TraftError;

use bytes::BytesMut;

use serde::de::DeserializeOwned;
use serde::Serialize;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::time::{self, Duration};

/// Receives an object of type `T` from TCP readable connection `conn_read`,
/// using `read_buf` as buffer storage. Returns `Ok(obj)` if successful; upon
/// returning, the read buffer is cleared.
pub(crate) async fn safe_tcp_read<T, Conn>(
    read_buf: &mut BytesMut,
    conn_read: &mut Conn,
) -> Result<T, TraftError>
where
    T: DeserializeOwned,
    Conn: AsyncReadExt + Unpin,
{
    // read length of obj first
    if read_buf.capacity() < 8 {
        read_buf.reserve(8 - read_buf.capacity());
    }
    while read_buf.len() < 8 {
        let n = conn_read.read_buf(read_buf).await?;
        if n == 0 {
            return Err(TraftError::msg("connection closed by peer"));
        }
    }
    let obj_len = u64::from_be_bytes(read_buf[..8].try_into().unwrap());

    // then read the obj itself
    let obj_end = 8 + obj_len as usize;
    if read_buf.capacity() < obj_end {
        // capacity not big enough, reserve more space
        read_buf.reserve(obj_end - read_buf.capacity());
    }
    while read_buf.len() < obj_end {
        let n = conn_read.read_buf(read_buf).await?;
        if n == 0 {
            return Err(TraftError::msg("connection closed by peer"));
        }
    }
    let obj = rmp_serde::decode::from_slice(&read_buf[8..obj_end])?;

    read_buf.clear();
    Ok(obj)
}

/// Sends an object of type `T` to TCP writable connection `conn_write` as
/// one length-prefixed frame.
pub(crate) async fn safe_tcp_write<T, Conn>(
    conn_write: &mut Conn,
    obj: &T,
) -> Result<(), TraftError>
where
    T: Serialize,
    Conn: AsyncWriteExt + Unpin,
{
    let obj_bytes = rmp_serde::encode::to_vec(obj)?;
    let obj_len = obj_bytes.len() as u64;

    conn_write.write_all(&obj_len.to_be_bytes()).await?;
    conn_write.write_all(obj_bytes.as_slice()).await?;
    conn_write.flush().await?;

    Ok(())
}

/// Wrapper over tokio `TcpListener::bind()` that provides a retrying logic.
pub(crate) async fn tcp_bind_with_retry(
    bind_addr: SocketAddr,
    mut retries: u8,
) -> Result<TcpListener, TraftError> {
    loop {
        let socket = TcpSocket::new_v4()?;
        socket.set_reuseaddr(true)?;
        socket.set_nodelay(true)?;
        socket.bind(bind_addr)?;

        match socket.listen(1024) {
            Ok(listener) => return Ok(listener),
            Err(err) => {
                if retries == 0 {
                    return Err(err.into());
                }
                retries -= 1;
                time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Wrapper over tokio `TcpStream::connect()` that provides a retrying logic.
pub(crate) async fn tcp_connect_with_retry(
    conn_addr: SocketAddr,
    mut retries: u8,
) -> Result<TcpStream, TraftError> {
    loop {
        let socket = TcpSocket::new_v4()?;
        socket.set_reuseaddr(true)?;
        socket.set_nodelay(true)?;

        match socket.connect(conn_addr).await {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                if retries == 0 {
                    return Err(err.into());
                }
                retries -= 1;
                time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

#[cfg(test)]
mod safetcp_tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    struct TestMsg(String, u64);

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn frame_round_trip() -> Result<(), TraftError> {
        let listener =
            tcp_bind_with_retry("127.0.0.1:31700".parse()?, 3).await?;
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = BytesMut::with_capacity(8 + 1024);
            let msg: TestMsg =
                safe_tcp_read(&mut buf, &mut stream).await.unwrap();
            assert_eq!(msg, TestMsg("ping".into(), 7));
            safe_tcp_write(&mut stream, &TestMsg("pong".into(), 8))
                .await
                .unwrap();
        });

        let mut stream =
            tcp_connect_with_retry("127.0.0.1:31700".parse()?, 3).await?;
        safe_tcp_write(&mut stream, &TestMsg("ping".into(), 7)).await?;
        let mut buf = BytesMut::with_capacity(8 + 1024);
        let msg: TestMsg = safe_tcp_read(&mut buf, &mut stream).await?;
        assert_eq!(msg, TestMsg("pong".into(), 8));
        Ok(())
    }
}
