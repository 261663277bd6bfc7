//! Single-process development daemon: the in-memory authority, the heartbeat
//! channel over loopback TCP, the ReplicaSet controller, one worker agent on
//! the in-process engine, and the service programmer on the in-process
//! packet filter. Useful for watching the control loops converge without a
//! cluster.

use anyhow::{Context, Result};
use clap::Parser;
use owo_colors::OwoColorize;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use cube_agent::{AgentConfig, RuntimeMediator, fake::FakeRuntime};
use cube_controllers::{Informer, pod_spec_event_diff, replicaset};
use cube_heartbeat::{HeartbeatClient, HeartbeatConfig, HeartbeatServer};
use cube_store::{Client, Kv, MemoryKv, WatchRegistry};
use cube_types::{ApiObject, Node, ObjectMeta, PodStatus, Uid};

mod args;

use args::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    cube_common::init();

    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    cube_common::metrics::maybe_spawn_metrics_server();

    run(cli).await
}

async fn run(cli: Cli) -> Result<()> {
    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            cube_common::shutdown::shutdown_signal().await;
            cancel.cancel();
        }
    });

    let kv: Arc<dyn Kv> = Arc::new(MemoryKv::new());
    let client = Client::new(kv, cli.kv.timeout());
    tracing::info!(
        kv_endpoint = %cli.kv.kv_endpoint,
        "authority state lives in the in-process store; no external kv is dialed"
    );

    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    // Authority side of the liveness channel. Failing to bind is the one
    // unrecoverable configuration error here.
    let heartbeat_addr = cli.authority.heartbeat_addr();
    let listener = TcpListener::bind(&heartbeat_addr)
        .await
        .with_context(|| format!("fatal: cannot bind heartbeat endpoint {heartbeat_addr}"))?;
    let server = HeartbeatServer::new(client.nodes.clone(), HeartbeatConfig::default());
    tasks.push(tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if let Err(err) = server.run(listener, cancel).await {
                tracing::error!(%err, "heartbeat server failed");
            }
        }
    }));

    // Worker side: dial, register, learn our node identity.
    let registry = WatchRegistry::new();
    let node = Node {
        meta: ObjectMeta {
            name: cli.node_name.clone(),
            ..Default::default()
        },
        ..Default::default()
    };
    let heartbeat = HeartbeatClient::spawn(
        heartbeat_addr,
        node,
        HeartbeatConfig::default(),
        registry.clone(),
        cancel.clone(),
    );
    let node_uid = heartbeat
        .wait_for_uid()
        .await
        .context("heartbeat channel never came up")?;
    println!(
        "{} {}",
        "node registered •".green(),
        node_uid.green().dimmed()
    );

    // Shared pod informer feeding the controller manager.
    let mut pod_informer = Informer::new(client.pods.clone(), pod_spec_event_diff);
    let pod_cache = pod_informer.cache();
    let pod_events = pod_informer.subscribe();
    tasks.push(tokio::spawn(pod_informer.run(cancel.clone())));

    tasks.extend(replicaset::spawn(
        client.clone(),
        pod_cache,
        pod_events,
        replicaset::ReplicaSetConfig::default(),
        cancel.clone(),
    ));

    // Worker agent on the in-process engine.
    let runtime = FakeRuntime::new();
    let mediator = Arc::new(RuntimeMediator::new(runtime.engine(), runtime.network()));
    tasks.extend(cube_agent::spawn(
        node_uid.clone(),
        client.clone(),
        mediator,
        heartbeat.connected.clone(),
        registry,
        AgentConfig::default(),
        cancel.clone(),
    ));

    // Service programmer on the in-process packet filter.
    let filter: Arc<dyn cube_proxy::PacketFilter> = Arc::new(cube_proxy::MemoryFilter::new());
    let proxy_config = cube_proxy::ProxyConfig {
        service_cidr: cli.proxy.service_cidr.clone(),
        ..Default::default()
    };
    tasks.extend(cube_proxy::spawn(
        client.clone(),
        filter,
        proxy_config,
        cancel.clone(),
    )?);

    // Dev stand-in for the scheduler: bind every unbound pod to our node.
    tasks.push(tokio::spawn(binder(
        client.clone(),
        node_uid,
        cancel.clone(),
    )));

    println!("{}", "control plane up".green());
    cancel.cancelled().await;
    for task in tasks {
        let _ = task.await;
    }
    println!("{}", "control plane stopped".red());
    Ok(())
}

/// Assign unbound pods to the single registered node every couple of
/// seconds. Placement policy belongs to a real scheduler; this keeps the
/// dev loop closed.
async fn binder(client: Client, node_uid: Uid, cancel: CancellationToken) {
    let mut tick = tokio::time::interval(Duration::from_secs(2));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tick.tick() => {}
        }
        let pods = match client.pods.list().await {
            Ok(pods) => pods,
            Err(err) => {
                tracing::warn!(%err, "binder list failed");
                continue;
            }
        };
        for mut pod in pods {
            if pod.status.is_some() {
                continue;
            }
            pod.status = Some(PodStatus {
                node_uid: Some(node_uid.clone()),
                ..Default::default()
            });
            let name = pod.name().to_string();
            match client.pods.update(pod).await {
                Ok(_) => tracing::info!(pod = %name, "bound pod"),
                Err(err) => tracing::warn!(pod = %name, %err, "bind failed"),
            }
        }
    }
}
