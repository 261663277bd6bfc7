//! Pure planning for the NAT chain layout: chain-name generation, the
//! weighted-DNAT probability ladder, service defaulting, and target-port
//! resolution. Nothing here touches the packet filter.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use uuid::Uuid;

use cube_types::{ApiObject, Pod, Service, ServicePort};

use crate::programmer::ProgramError;

/// The platform rejects chain names longer than this.
pub const CHAIN_NAME_LIMIT: usize = 29;

const SERVICE_PREFIX: &str = "CUBE-SVC-";
const ENDPOINT_PREFIX: &str = "CUBE-SVC-POD-";

pub fn fresh_service_chain_id() -> String {
    let id = format!("{SERVICE_PREFIX}{}", &Uuid::new_v4().to_string()[..15]);
    debug_assert!(id.len() <= CHAIN_NAME_LIMIT);
    id
}

pub fn fresh_endpoint_chain_id() -> String {
    let id = format!("{ENDPOINT_PREFIX}{}", &Uuid::new_v4().to_string()[..15]);
    debug_assert!(id.len() <= CHAIN_NAME_LIMIT);
    id
}

/// `SERVICE` entry rule steering cluster-IP traffic into a per-port chain.
pub fn service_jump_rule(cluster_ip: Ipv4Addr, port: &ServicePort, chain: &str) -> Vec<String> {
    vec![
        "-d".into(),
        cluster_ip.to_string(),
        "-p".into(),
        port.protocol.to_string(),
        "--dport".into(),
        port.port.to_string(),
        "-j".into(),
        chain.into(),
    ]
}

/// Rule `index` of `total` in a per-port chain. Earlier endpoints match with
/// probability `1/(N-k)`, the last one unconditionally, which yields a
/// uniform 1/N split overall.
pub fn balance_rule(endpoint_chain: &str, index: usize, total: usize) -> Vec<String> {
    if index + 1 < total {
        let probability = 1.0 / (total - index) as f64;
        vec![
            "-m".into(),
            "statistic".into(),
            "--mode".into(),
            "random".into(),
            "--probability".into(),
            format!("{probability:.2}"),
            "-j".into(),
            endpoint_chain.into(),
        ]
    } else {
        vec!["-j".into(), endpoint_chain.into()]
    }
}

pub fn dnat_rule(port: &ServicePort, endpoint: IpAddr, target_port: u16) -> Vec<String> {
    vec![
        "-p".into(),
        port.protocol.to_string(),
        "-j".into(),
        "DNAT".into(),
        "--to-destination".into(),
        format!("{endpoint}:{target_port}"),
    ]
}

pub fn parse_cidr(cidr: &str) -> Result<(Ipv4Addr, u8), ProgramError> {
    let (addr, bits) = cidr
        .split_once('/')
        .ok_or_else(|| ProgramError::BadCidr(cidr.into()))?;
    let addr: Ipv4Addr = addr
        .parse()
        .map_err(|_| ProgramError::BadCidr(cidr.into()))?;
    let bits: u8 = bits
        .parse()
        .map_err(|_| ProgramError::BadCidr(cidr.into()))?;
    if bits == 0 || bits > 30 {
        return Err(ProgramError::BadCidr(cidr.into()));
    }
    Ok((addr, bits))
}

/// First free host address in the service range, skipping network and
/// broadcast addresses.
pub fn allocate_cluster_ip(
    cidr: &str,
    used: &HashSet<Ipv4Addr>,
) -> Result<Ipv4Addr, ProgramError> {
    let (addr, bits) = parse_cidr(cidr)?;
    let mask = u32::MAX << (32 - bits);
    let network = u32::from(addr) & mask;
    let broadcast = network | !mask;
    for candidate in (network + 1)..broadcast {
        let ip = Ipv4Addr::from(candidate);
        if !used.contains(&ip) {
            return Ok(ip);
        }
    }
    Err(ProgramError::CidrExhausted)
}

/// One service port with its target resolved and the endpoints it maps to.
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedPort {
    pub port: ServicePort,
    pub target_port: u16,
    pub endpoints: Vec<IpAddr>,
}

/// Default and resolve every port of a service against its endpoint pods.
/// Named target ports are looked up in the pods' container ports; the
/// numeric result must agree across the endpoint set.
pub fn resolve_ports(service: &Service, pods: &[Pod]) -> Result<Vec<ResolvedPort>, ProgramError> {
    let all_ips: Vec<IpAddr> = pods.iter().filter_map(Pod::ip).collect();
    let mut resolved = Vec::with_capacity(service.spec.ports.len());
    for spec_port in &service.spec.ports {
        let mut port = spec_port.clone();
        let (target, endpoints) = if port.target_port_name.is_empty() {
            (port.target_port, all_ips.clone())
        } else {
            resolve_named_target(&port, pods)?
        };
        port.target_port = target;
        if port.port == 0 {
            port.port = target;
        }
        if port.port == 0 || target == 0 {
            return Err(ProgramError::Malformed(format!(
                "service {} port with neither port nor target",
                service.name()
            )));
        }
        resolved.push(ResolvedPort {
            port,
            target_port: target,
            endpoints,
        });
    }
    Ok(resolved)
}

fn resolve_named_target(
    port: &ServicePort,
    pods: &[Pod],
) -> Result<(u16, Vec<IpAddr>), ProgramError> {
    let mut target = port.target_port;
    let mut endpoints = Vec::new();
    for pod in pods {
        let Some(ip) = pod.ip() else { continue };
        for container in &pod.spec.containers {
            for container_port in &container.ports {
                if container_port.name != port.target_port_name {
                    continue;
                }
                if target == 0 {
                    target = container_port.container_port;
                } else if target != container_port.container_port {
                    return Err(ProgramError::PortNameAmbiguous(
                        port.target_port_name.clone(),
                    ));
                }
                endpoints.push(ip);
            }
        }
    }
    Ok((target, endpoints))
}
