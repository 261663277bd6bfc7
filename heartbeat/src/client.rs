use chrono::Utc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use cube_common::wait::backoff_full_jitter;
use cube_store::WatchRegistry;
use cube_types::{Node, Uid};

use crate::{HeartbeatConfig, LivenessToken, read_frame, write_frame};

/// Worker-side view of the liveness channel. `connected` is the only gate
/// a worker consults before attempting status writes.
#[derive(Clone)]
pub struct HeartbeatHandle {
    pub connected: watch::Receiver<bool>,
    pub node_uid: watch::Receiver<Option<Uid>>,
}

impl HeartbeatHandle {
    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Block until the authority has assigned (or confirmed) this worker's
    /// node UID.
    pub async fn wait_for_uid(&self) -> Option<Uid> {
        let mut rx = self.node_uid.clone();
        loop {
            if let Some(uid) = rx.borrow().clone() {
                return Some(uid);
            }
            if rx.changed().await.is_err() {
                return None;
            }
        }
    }
}

pub struct HeartbeatClient;

impl HeartbeatClient {
    /// Dial `addr` and keep the channel alive until `cancel` fires,
    /// reconnecting with capped full-jitter backoff. On every channel loss
    /// the registry's watches are cancelled before reconnecting.
    pub fn spawn(
        addr: String,
        node: Node,
        config: HeartbeatConfig,
        registry: WatchRegistry,
        cancel: CancellationToken,
    ) -> HeartbeatHandle {
        let (connected_tx, connected_rx) = watch::channel(false);
        let (uid_tx, uid_rx) = watch::channel(None);

        tokio::spawn(async move {
            let base = Duration::from_millis(250);
            let mut attempt = 0usize;
            loop {
                if cancel.is_cancelled() {
                    return;
                }
                let stream = tokio::select! {
                    _ = cancel.cancelled() => return,
                    res = TcpStream::connect(&addr) => res,
                };
                match stream {
                    Ok(stream) => {
                        attempt = 0;
                        tracing::info!(%addr, node = %node.meta.name, "heartbeat channel up");
                        let _ = connected_tx.send(true);
                        run_channel(stream, &node, &config, &uid_tx, &cancel).await;
                        let _ = connected_tx.send(false);
                        tracing::warn!(%addr, "heartbeat channel lost, cancelling watches");
                        registry.cancel_all();
                    }
                    Err(err) => {
                        tracing::warn!(%addr, %err, "heartbeat dial failed");
                    }
                }
                let delay = backoff_full_jitter(base, config.reconnect_cap, attempt);
                attempt += 1;
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        });

        HeartbeatHandle {
            connected: connected_rx,
            node_uid: uid_rx,
        }
    }
}

/// Drive one established connection until it dies or `cancel` fires.
async fn run_channel(
    stream: TcpStream,
    node: &Node,
    config: &HeartbeatConfig,
    uid_tx: &watch::Sender<Option<Uid>>,
    cancel: &CancellationToken,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut buf = Vec::new();

    let mut push = tokio::time::interval(config.interval);
    let deadline = tokio::time::sleep(config.timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            () = &mut deadline => {
                tracing::warn!("no liveness token within {:?}", config.timeout);
                return;
            }
            _ = push.tick() => {
                let mut report = node.clone();
                report.status.ready = true;
                report.status.last_heartbeat = Utc::now();
                if let Err(err) = write_frame(&mut write_half, &report).await {
                    tracing::warn!(%err, "heartbeat push failed");
                    return;
                }
            }
            res = read_frame(&mut reader, &mut buf) => {
                match res {
                    Ok(Some(payload)) => {
                        deadline.as_mut().reset(Instant::now() + config.timeout);
                        match serde_json::from_slice::<LivenessToken>(&payload) {
                            Ok(token) => {
                                uid_tx.send_if_modified(|cur| {
                                    if cur.as_deref() == Some(token.node_uid.as_str()) {
                                        false
                                    } else {
                                        *cur = Some(token.node_uid.clone());
                                        true
                                    }
                                });
                            }
                            Err(err) => {
                                tracing::warn!(%err, "undecodable liveness token");
                            }
                        }
                    }
                    Ok(None) => return,
                    Err(err) => {
                        tracing::warn!(%err, "heartbeat read failed");
                        return;
                    }
                }
            }
        }
    }
}
