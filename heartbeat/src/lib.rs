//! Liveness channel between each worker and the authority: a long-lived TCP
//! connection carrying `0x1A`-delimited JSON frames. The worker pushes its
//! node record on an interval; the authority echoes a liveness token on
//! every receive. Either side closing or going silent past the timeout
//! tears the channel down: the worker then cancels every active watch
//! stream, and the authority marks the node not ready.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};

use cube_types::Uid;

mod client;
mod server;

pub use client::{HeartbeatClient, HeartbeatHandle};
pub use server::HeartbeatServer;

/// Frame terminator (ASCII SUB).
pub const FRAME_DELIM: u8 = 0x1A;

#[derive(Clone, Debug)]
pub struct HeartbeatConfig {
    /// How often the worker pushes its node record.
    pub interval: Duration,
    /// Read deadline on both sides; silence past this closes the channel.
    pub timeout: Duration,
    /// Cap on the worker's reconnect backoff.
    pub reconnect_cap: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(15),
            reconnect_cap: Duration::from_secs(10),
        }
    }
}

/// Echoed by the authority on every received frame. Carrying the node UID
/// here is how a freshly registered worker learns its identity.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LivenessToken {
    pub node_uid: Uid,
}

pub fn encode_frame<T: Serialize>(msg: &T) -> Result<Vec<u8>, serde_json::Error> {
    let mut bytes = serde_json::to_vec(msg)?;
    bytes.push(FRAME_DELIM);
    Ok(bytes)
}

pub async fn write_frame<T: Serialize, W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    msg: &T,
) -> anyhow::Result<()> {
    let bytes = encode_frame(msg)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one delimited frame, returning the payload without its terminator.
/// `None` means the peer closed the connection. `buf` carries partial reads
/// across cancelled attempts, so callers must reuse the same buffer.
pub async fn read_frame<R: AsyncBufReadExt + Unpin>(
    reader: &mut R,
    buf: &mut Vec<u8>,
) -> std::io::Result<Option<Vec<u8>>> {
    let n = reader.read_until(FRAME_DELIM, buf).await?;
    if n == 0 && buf.is_empty() {
        return Ok(None);
    }
    if buf.last() != Some(&FRAME_DELIM) {
        // EOF mid-frame.
        return Ok(None);
    }
    buf.pop();
    Ok(Some(std::mem::take(buf)))
}
