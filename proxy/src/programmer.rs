//! Service data-plane programmer: maps each service (cluster IP + ports +
//! selector) onto NAT chains implementing weighted DNAT across its Running
//! endpoints, and keeps the layout consistent as endpoints churn.

use metrics::counter;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use cube_controllers::{
    Event, Harness, Informer, Store, pod_network_event_diff, service_event_diff,
};
use cube_store::Client;
use cube_types::{
    ApiObject, Pod, PodPhase, Service, ServiceStatus, Uid, match_label_selector,
};

use crate::chains::{
    self, allocate_cluster_ip, balance_rule, dnat_rule, fresh_endpoint_chain_id,
    fresh_service_chain_id, service_jump_rule,
};
use crate::filter::{
    FilterError, NAT_TABLE, OUTPUT_CHAIN, PREROUTING_CHAIN, PacketFilter, SERVICE_CHAIN,
};

#[derive(Debug, thiserror::Error)]
pub enum ProgramError {
    #[error("malformed service: {0}")]
    Malformed(String),

    #[error("target port name {0} resolves to different ports across endpoints")]
    PortNameAmbiguous(String),

    #[error("bad service cidr: {0}")]
    BadCidr(String),

    #[error("service cidr exhausted")]
    CidrExhausted,

    #[error(transparent)]
    Filter(#[from] FilterError),

    #[error(transparent)]
    Store(#[from] cube_store::Error),
}

#[derive(Clone, Debug)]
pub struct ProxyConfig {
    pub service_cidr: String,
    pub resync: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            service_cidr: "172.16.0.0/16".into(),
            resync: Duration::from_secs(15),
        }
    }
}

/// Bookkeeping for one programmed service: every chain and jump rule that
/// must come back out, plus the endpoint set the chains were built from.
struct ServiceChainEntry {
    service_chains: Vec<String>,
    jump_rules: Vec<Vec<String>>,
    endpoint_chains: Vec<Vec<String>>,
    endpoints: Vec<IpAddr>,
    pod_count: usize,
}

pub struct ServiceProgrammer {
    client: Client,
    filter: Arc<dyn PacketFilter>,
    /// Critical section around the shared host table.
    table_lock: Mutex<()>,
    entries: HashMap<Uid, ServiceChainEntry>,
    svc_cache: Store<Service>,
    config: ProxyConfig,
}

impl ServiceProgrammer {
    pub fn new(
        client: Client,
        filter: Arc<dyn PacketFilter>,
        svc_cache: Store<Service>,
        config: ProxyConfig,
    ) -> Self {
        Self {
            client,
            filter,
            table_lock: Mutex::new(()),
            entries: HashMap::new(),
            svc_cache,
            config,
        }
    }

    /// Host bootstrap: stand the top-level `SERVICE` chain up and hook it
    /// into `PREROUTING` and `OUTPUT`, deduplicating leftover jumps first.
    pub fn bootstrap(&self) -> Result<(), ProgramError> {
        let _guard = self.table_lock.lock();
        let jump: Vec<String> = vec!["-j".into(), SERVICE_CHAIN.into()];
        if !self.filter.chain_exists(NAT_TABLE, SERVICE_CHAIN)? {
            self.filter.new_chain(NAT_TABLE, SERVICE_CHAIN)?;
        }
        for top in [PREROUTING_CHAIN, OUTPUT_CHAIN] {
            while self.filter.exists(NAT_TABLE, top, &jump)? {
                self.filter.delete_if_exists(NAT_TABLE, top, &jump)?;
            }
            self.filter.insert(NAT_TABLE, top, 1, &jump)?;
        }
        tracing::info!("packet filter bootstrapped");
        Ok(())
    }

    pub async fn handle_service_event(&mut self, event: Event<Service>) {
        let outcome = match event {
            Event::Create(svc) | Event::Update(svc) => self.add_service(&svc).await,
            Event::Remove(svc) => self.delete_service(svc.uid()),
        };
        if let Err(err) = outcome {
            // Left for the next re-sync pass.
            tracing::warn!(%err, "service programming failed");
        }
    }

    /// A pod crossing the Running boundary, changing IP, or changing labels
    /// reshuffles every service selecting it. The full rebuild trades a
    /// brief affinity reset for a correct 1/N distribution.
    pub async fn handle_pod_event(&mut self, event: Event<Pod>) {
        let pod = event.object().clone();
        for service in self.svc_cache.list() {
            if !match_label_selector(&service.spec.selector, &pod.meta.labels) {
                continue;
            }
            tracing::info!(service = %service.name(), pod = %pod.name(), "endpoint churn, reshuffling");
            if let Err(err) = self.delete_service(service.uid()) {
                tracing::warn!(service = %service.name(), %err, "reshuffle delete failed");
                continue;
            }
            if let Err(err) = self.add_service(&service).await {
                tracing::warn!(service = %service.name(), %err, "reshuffle add failed");
            }
        }
    }

    /// Periodic sweep: reprogram only the services whose resolved endpoint
    /// set drifted from their bookkeeping entry, and drop entries whose
    /// service vanished while the informer was dark.
    pub async fn resync(&mut self) {
        let cached: HashSet<Uid> = self
            .svc_cache
            .list()
            .iter()
            .map(|s| s.uid().to_string())
            .collect();
        let stale: Vec<Uid> = self
            .entries
            .keys()
            .filter(|uid| !cached.contains(*uid))
            .cloned()
            .collect();
        for uid in stale {
            if let Err(err) = self.delete_service(&uid) {
                tracing::warn!(%uid, %err, "stale entry teardown failed");
            }
        }

        for service in self.svc_cache.list() {
            let resolved = match self.resolve_endpoints(&service).await {
                Ok(resolved) => resolved,
                Err(err) => {
                    tracing::warn!(service = %service.name(), %err, "endpoint resolve failed");
                    continue;
                }
            };
            let current = self.entries.get(service.uid()).map(|e| {
                let mut ips = e.endpoints.clone();
                ips.sort();
                ips
            });
            let mut desired: Vec<IpAddr> = resolved.iter().filter_map(Pod::ip).collect();
            desired.sort();
            let drifted = match current {
                Some(current) => current != desired,
                None => !desired.is_empty(),
            };
            if !drifted {
                continue;
            }
            tracing::info!(service = %service.name(), "endpoint drift detected on re-sync");
            if let Err(err) = self.delete_service(service.uid()) {
                tracing::warn!(service = %service.name(), %err, "re-sync delete failed");
                continue;
            }
            if let Err(err) = self.add_service(&service).await {
                tracing::warn!(service = %service.name(), %err, "re-sync add failed");
            }
        }
    }

    async fn resolve_endpoints(&self, service: &Service) -> Result<Vec<Pod>, ProgramError> {
        let mut pods = self.client.pods.select(&service.spec.selector).await?;
        pods.retain(|p| p.phase() == PodPhase::Running && p.ip().is_some());
        pods.sort_by(|a, b| a.meta.uid.cmp(&b.meta.uid));
        Ok(pods)
    }

    pub async fn add_service(&mut self, service: &Service) -> Result<(), ProgramError> {
        let mut service = service.clone();
        if self.entries.contains_key(service.uid()) {
            self.delete_service(service.uid())?;
        }

        let cluster_ip = match service.spec.cluster_ip {
            Some(ip) => ip,
            None => {
                let ip = allocate_cluster_ip(&self.config.service_cidr, &self.used_cluster_ips())?;
                tracing::info!(service = %service.name(), %ip, "assigned cluster ip");
                service.spec.cluster_ip = Some(ip);
                ip
            }
        };

        let pods = self.resolve_endpoints(&service).await?;
        if pods.is_empty() {
            tracing::info!(service = %service.name(), "no live endpoints, nothing to program");
            return Ok(());
        }
        let resolved = chains::resolve_ports(&service, &pods)?;
        let endpoints: Vec<IpAddr> = pods.iter().filter_map(Pod::ip).collect();

        let mut entry = ServiceChainEntry {
            service_chains: Vec::with_capacity(resolved.len()),
            jump_rules: Vec::with_capacity(resolved.len()),
            endpoint_chains: Vec::with_capacity(resolved.len()),
            endpoints: endpoints.clone(),
            pod_count: pods.len(),
        };

        {
            let _guard = self.table_lock.lock();
            for port in &resolved {
                let service_chain = fresh_service_chain_id();
                self.filter.new_chain(NAT_TABLE, &service_chain)?;
                let jump = service_jump_rule(cluster_ip, &port.port, &service_chain);
                self.filter.append(NAT_TABLE, SERVICE_CHAIN, &jump)?;

                let mut per_endpoint = Vec::with_capacity(port.endpoints.len());
                for (k, endpoint) in port.endpoints.iter().enumerate() {
                    let endpoint_chain = fresh_endpoint_chain_id();
                    self.filter.new_chain(NAT_TABLE, &endpoint_chain)?;
                    self.filter.append(
                        NAT_TABLE,
                        &service_chain,
                        &balance_rule(&endpoint_chain, k, port.endpoints.len()),
                    )?;
                    self.filter.insert(
                        NAT_TABLE,
                        &endpoint_chain,
                        1,
                        &dnat_rule(&port.port, *endpoint, port.target_port),
                    )?;
                    per_endpoint.push(endpoint_chain);
                }
                entry.service_chains.push(service_chain);
                entry.jump_rules.push(jump);
                entry.endpoint_chains.push(per_endpoint);
            }
        }

        self.entries.insert(service.uid().to_string(), entry);

        service.status = Some(ServiceStatus { endpoints });
        self.client.services.update(service).await?;
        counter!("service_programs_total").increment(1);
        Ok(())
    }

    /// Remove every chain the bookkeeping entry names. A service that was
    /// never programmed (or already deleted) is a no-op.
    pub fn delete_service(&mut self, uid: &str) -> Result<(), ProgramError> {
        let Some(entry) = self.entries.remove(uid) else {
            return Ok(());
        };
        let _guard = self.table_lock.lock();
        for (idx, service_chain) in entry.service_chains.iter().enumerate() {
            self.filter
                .delete_if_exists(NAT_TABLE, SERVICE_CHAIN, &entry.jump_rules[idx])?;
            self.filter.clear_and_delete_chain(NAT_TABLE, service_chain)?;
        }
        for per_port in &entry.endpoint_chains {
            for endpoint_chain in per_port {
                self.filter
                    .clear_and_delete_chain(NAT_TABLE, endpoint_chain)?;
            }
        }
        counter!("service_teardowns_total").increment(1);
        Ok(())
    }

    fn used_cluster_ips(&self) -> HashSet<Ipv4Addr> {
        self.svc_cache
            .list()
            .iter()
            .filter_map(|s| s.spec.cluster_ip)
            .collect()
    }

    pub fn programmed_count(&self) -> usize {
        self.entries.len()
    }
}

/// Wire the programmer onto its service and pod informers and harness.
pub fn spawn(
    client: Client,
    filter: Arc<dyn PacketFilter>,
    config: ProxyConfig,
    cancel: CancellationToken,
) -> Result<Vec<JoinHandle<()>>, ProgramError> {
    let mut svc_informer = Informer::new(client.services.clone(), service_event_diff);
    let svc_cache = svc_informer.cache();
    let svc_events = svc_informer.subscribe();

    let mut pod_informer = Informer::new(client.pods.clone(), pod_network_event_diff);
    let pod_events = pod_informer.subscribe();

    let programmer = ServiceProgrammer::new(client, filter, svc_cache, config.clone());
    programmer.bootstrap()?;
    let harness = Harness::new("proxy", programmer);

    Ok(vec![
        tokio::spawn(svc_informer.run(cancel.clone())),
        tokio::spawn(pod_informer.run(cancel.clone())),
        harness.spawn_pump(svc_events, cancel.clone(), |p, event| async move {
            p.lock().await.handle_service_event(event).await;
        }),
        harness.spawn_pump(pod_events, cancel.clone(), |p, event| async move {
            p.lock().await.handle_pod_event(event).await;
        }),
        harness.spawn_resync(config.resync, cancel, |p| async move {
            p.lock().await.resync().await;
        }),
    ])
}
