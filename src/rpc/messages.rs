//! RPC message types and length-prefixed MessagePack framing.

use crate::paxos::{Ballot, Instance, NodeId, PrepareReply};
use crate::server::{ClientId, LockId, LockStatus, SeqNum};
use crate::utils::PaxlockError;

use bytes::{BufMut, Bytes, BytesMut};

use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on the payload size of one frame.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Request to a paxlock node: Paxos acceptor calls, lock service calls, or
/// lock cache callbacks.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum RpcRequest {
    Prepare {
        src: NodeId,
        instance: Instance,
        ballot: Ballot,
    },

    Accept {
        src: NodeId,
        instance: Instance,
        ballot: Ballot,
        value: String,
    },

    Decide {
        src: NodeId,
        instance: Instance,
        value: String,
    },

    LockAcquire {
        client: ClientId,
        seq: SeqNum,
        lid: LockId,
    },

    LockRelease {
        client: ClientId,
        seq: SeqNum,
        lid: LockId,
    },

    LockStat { client: ClientId, lid: LockId },

    /// Server -> client: give the lock back.
    Revoke { client: ClientId, lid: LockId },

    /// Server -> client: the lock may be free now.
    Retry { client: ClientId, lid: LockId },
}

/// Reply to an `RpcRequest`.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum RpcReply {
    Prepare(PrepareReply),
    Accept(bool),
    Decide,
    Lock(LockStatus),
    Stat(u64),
    Ack,

    /// The callee failed to serve the request.
    Error(String),
}

impl RpcReply {
    /// Error for a reply of the wrong kind.
    pub(crate) fn into_error(self) -> PaxlockError {
        match self {
            RpcReply::Error(msg) => PaxlockError(msg),
            reply => PaxlockError(format!("unexpected reply {:?}", reply)),
        }
    }
}

/// Writes `obj` as one frame: big-endian `u64` payload length, then the
/// MessagePack payload.
pub(crate) async fn write_frame<T, Conn>(
    conn: &mut Conn,
    obj: &T,
) -> Result<(), PaxlockError>
where
    T: Serialize,
    Conn: AsyncWrite + Unpin,
{
    let payload = encode_to_vec(obj)?;
    let mut write_buf = BytesMut::with_capacity(8 + payload.len());
    write_buf.put_u64(payload.len() as u64);
    write_buf.extend_from_slice(&payload);
    conn.write_all(&write_buf).await?;
    conn.flush().await?;
    Ok(())
}

/// Reads one frame from `conn`, using `read_buf` as storage for partial
/// reads. Bytes past the end of the frame stay in `read_buf` for the next
/// call.
pub(crate) async fn read_frame<T, Conn>(
    conn: &mut Conn,
    read_buf: &mut BytesMut,
) -> Result<T, PaxlockError>
where
    T: DeserializeOwned,
    Conn: AsyncRead + Unpin,
{
    while read_buf.len() < 8 {
        if conn.read_buf(read_buf).await? == 0 {
            return Err(PaxlockError::msg("connection closed"));
        }
    }
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&read_buf[..8]);
    let obj_len = u64::from_be_bytes(len_bytes) as usize;
    if obj_len > MAX_FRAME_LEN {
        return logged_err!("frame length {} exceeds limit", obj_len);
    }

    let obj_end = 8 + obj_len;
    if read_buf.capacity() < obj_end {
        read_buf.reserve(obj_end - read_buf.len());
    }
    while read_buf.len() < obj_end {
        if conn.read_buf(read_buf).await? == 0 {
            return Err(PaxlockError::msg("connection closed mid-frame"));
        }
    }
    let obj = decode_from_slice(&read_buf[8..obj_end])?;

    if read_buf.len() > obj_end {
        let buf_tail = Bytes::copy_from_slice(&read_buf[obj_end..]);
        read_buf.clear();
        read_buf.extend_from_slice(&buf_tail);
    } else {
        read_buf.clear();
    }
    Ok(obj)
}
