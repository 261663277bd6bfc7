use chrono::Utc;
use std::net::SocketAddr;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use cube_store::{Gateway, node_by_name};
use cube_types::{ApiObject, Node, Uid};

use crate::{HeartbeatConfig, LivenessToken, read_frame, write_frame};

/// Authority side of the liveness channel. A node object springs into
/// existence the first time its worker dials in; it goes not-ready when the
/// worker falls silent past the timeout.
pub struct HeartbeatServer {
    nodes: Gateway<Node>,
    config: HeartbeatConfig,
}

impl HeartbeatServer {
    pub fn new(nodes: Gateway<Node>, config: HeartbeatConfig) -> Self {
        Self { nodes, config }
    }

    pub async fn run(self, listener: TcpListener, cancel: CancellationToken) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        tracing::info!(%addr, "heartbeat endpoint listening");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let nodes = self.nodes.clone();
                            let config = self.config.clone();
                            let cancel = cancel.clone();
                            tokio::spawn(async move {
                                handle_worker(nodes, config, stream, peer, cancel).await;
                            });
                        }
                        Err(err) => {
                            tracing::warn!(%err, "heartbeat accept failed");
                        }
                    }
                }
            }
        }
    }
}

async fn handle_worker(
    nodes: Gateway<Node>,
    config: HeartbeatConfig,
    stream: TcpStream,
    peer: SocketAddr,
    cancel: CancellationToken,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut buf = Vec::new();
    let mut node_uid: Option<Uid> = None;

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            res = tokio::time::timeout(config.timeout, read_frame(&mut reader, &mut buf)) => res,
        };
        let payload = match frame {
            Ok(Ok(Some(payload))) => payload,
            Ok(Ok(None)) => break,
            Ok(Err(err)) => {
                tracing::warn!(%peer, %err, "heartbeat read failed");
                break;
            }
            Err(_elapsed) => {
                tracing::warn!(%peer, "worker silent for {:?}", config.timeout);
                break;
            }
        };

        let reported = match serde_json::from_slice::<Node>(&payload) {
            Ok(node) => node,
            Err(err) => {
                tracing::warn!(%peer, %err, "undecodable heartbeat frame");
                continue;
            }
        };

        let uid = match refresh_node(&nodes, &mut node_uid, reported).await {
            Ok(uid) => uid,
            Err(err) => {
                tracing::warn!(%peer, %err, "node refresh failed");
                break;
            }
        };

        let token = LivenessToken { node_uid: uid };
        if let Err(err) = write_frame(&mut write_half, &token).await {
            tracing::warn!(%peer, %err, "token echo failed");
            break;
        }
    }

    if let Some(uid) = node_uid {
        mark_not_ready(&nodes, &uid).await;
    }
    tracing::info!(%peer, "heartbeat channel closed");
}

/// Register the node on its first frame (adopting an existing record with
/// the same name if one survives a worker restart), then refresh liveness.
async fn refresh_node(
    nodes: &Gateway<Node>,
    node_uid: &mut Option<Uid>,
    reported: Node,
) -> Result<Uid, cube_store::Error> {
    if let Some(uid) = node_uid.as_ref() {
        let mut node = nodes.get(uid).await?;
        node.status.ready = true;
        node.status.last_heartbeat = Utc::now();
        nodes.update(node).await?;
        return Ok(uid.clone());
    }

    let uid = match node_by_name(nodes, reported.name()).await? {
        Some(mut existing) => {
            existing.status.ready = true;
            existing.status.last_heartbeat = Utc::now();
            nodes.update(existing).await?.meta.uid
        }
        None => {
            let mut fresh = reported;
            fresh.meta.uid = String::new();
            fresh.status.ready = true;
            fresh.status.last_heartbeat = Utc::now();
            let created = nodes.create(fresh).await?;
            tracing::info!(node = %created.meta.name, uid = %created.meta.uid, "registered node");
            created.meta.uid
        }
    };
    *node_uid = Some(uid.clone());
    Ok(uid)
}

async fn mark_not_ready(nodes: &Gateway<Node>, uid: &str) {
    match nodes.get(uid).await {
        Ok(mut node) => {
            node.status.ready = false;
            if let Err(err) = nodes.update(node).await {
                tracing::warn!(%uid, %err, "failed to mark node not ready");
            }
        }
        Err(err) if err.is_not_found() => {}
        Err(err) => {
            tracing::warn!(%uid, %err, "failed to load node for not-ready mark");
        }
    }
}
