//! Structural diffs the informers use to decide whether a `Put` is a real
//! update for a given subscriber. Each function compares two observations of
//! the SAME object; calling one with mismatched UIDs is a contract bug.

use crate::{ObjectMeta, Pod, PodPhase, PodSpec, ReplicaSetSpec, Service};

fn assert_same_object(new: &ObjectMeta, old: &ObjectMeta) {
    assert_eq!(
        new.uid, old.uid,
        "diffing two objects with different uids"
    );
}

/// Name or label change on the same object.
pub fn object_meta_changed(new: &ObjectMeta, old: &ObjectMeta) -> bool {
    assert_same_object(new, old);
    new.name != old.name || new.labels != old.labels
}

/// Container specs (name, image, command, args, resources, ports, mounts)
/// or the volume list changed.
pub fn pod_spec_changed(new: &PodSpec, old: &PodSpec) -> bool {
    new.containers != old.containers || new.volumes != old.volumes
}

pub fn replica_set_spec_changed(new: &ReplicaSetSpec, old: &ReplicaSetSpec) -> bool {
    new.replicas != old.replicas
        || new.selector != old.selector
        || new.template.meta.name != old.template.meta.name
        || new.template.meta.labels != old.template.meta.labels
        || pod_spec_changed(&new.template.spec, &old.template.spec)
}

/// True when the packet-filter chains for this service must be rebuilt:
/// selector, port list, or cluster IP changed.
pub fn service_critical_changed(new: &Service, old: &Service) -> bool {
    assert_same_object(&new.meta, &old.meta);
    new.spec.selector != old.spec.selector
        || new.spec.ports != old.spec.ports
        || new.spec.cluster_ip != old.spec.cluster_ip
}

/// True when the pod's participation in service load balancing may have
/// changed: label set, IP, or crossing the Running boundary in either
/// direction.
pub fn pod_network_changed(new: &Pod, old: &Pod) -> bool {
    assert_same_object(&new.meta, &old.meta);
    if new.meta.labels != old.meta.labels {
        return true;
    }
    match (&old.status, &new.status) {
        (None, None) => false,
        (None, Some(_)) | (Some(_), None) => true,
        (Some(o), Some(n)) => {
            o.ip != n.ip
                || (o.phase == PodPhase::Running) != (n.phase == PodPhase::Running)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ContainerSpec, Labels, ObjectMeta, PodStatus, PodTemplate, ServicePort};

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn meta(name: &str, lbls: &[(&str, &str)]) -> ObjectMeta {
        ObjectMeta {
            name: name.into(),
            uid: "u-1".into(),
            labels: labels(lbls),
            ..Default::default()
        }
    }

    fn pod(lbls: &[(&str, &str)], status: Option<PodStatus>) -> Pod {
        Pod {
            meta: meta("p", lbls),
            status,
            ..Default::default()
        }
    }

    #[test]
    fn meta_diff_sees_name_and_labels_only() {
        let old = meta("a", &[("app", "x")]);
        let mut new = old.clone();
        assert!(!object_meta_changed(&new, &old));

        new.name = "b".into();
        assert!(object_meta_changed(&new, &old));

        new = old.clone();
        new.labels.insert("extra".into(), "1".into());
        assert!(object_meta_changed(&new, &old));

        new = old.clone();
        new.annotations.insert("note".into(), "ignored".into());
        assert!(!object_meta_changed(&new, &old));
    }

    #[test]
    #[should_panic]
    fn meta_diff_panics_on_uid_mismatch() {
        let old = meta("a", &[]);
        let mut new = old.clone();
        new.uid = "other".into();
        object_meta_changed(&new, &old);
    }

    #[test]
    fn pod_spec_diff_sees_container_changes() {
        let old = PodSpec {
            containers: vec![ContainerSpec {
                name: "c".into(),
                image: "img:1".into(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let mut new = old.clone();
        assert!(!pod_spec_changed(&new, &old));

        new.containers[0].image = "img:2".into();
        assert!(pod_spec_changed(&new, &old));
    }

    #[test]
    fn replica_set_diff_covers_replicas_selector_and_template() {
        let old = ReplicaSetSpec {
            replicas: 2,
            selector: labels(&[("app", "x")]),
            template: PodTemplate {
                meta: ObjectMeta {
                    name: "tmpl".into(),
                    labels: labels(&[("app", "x")]),
                    ..Default::default()
                },
                spec: PodSpec::default(),
            },
        };
        let mut new = old.clone();
        assert!(!replica_set_spec_changed(&new, &old));

        new.replicas = 3;
        assert!(replica_set_spec_changed(&new, &old));

        new = old.clone();
        new.template.spec.containers.push(ContainerSpec::default());
        assert!(replica_set_spec_changed(&new, &old));
    }

    #[test]
    fn service_diff_ignores_status() {
        let old = Service {
            meta: meta("svc", &[]),
            spec: crate::ServiceSpec {
                selector: labels(&[("app", "x")]),
                ports: vec![ServicePort {
                    port: 80,
                    target_port: 8080,
                    ..Default::default()
                }],
                cluster_ip: Some("10.0.0.5".parse().unwrap()),
            },
            status: None,
        };
        let mut new = old.clone();
        new.status = Some(crate::ServiceStatus {
            endpoints: vec!["10.44.0.2".parse().unwrap()],
        });
        assert!(!service_critical_changed(&new, &old));

        new.spec.ports[0].target_port = 9090;
        assert!(service_critical_changed(&new, &old));
    }

    #[test]
    fn network_diff_fires_on_running_boundary() {
        let running = PodStatus {
            phase: PodPhase::Running,
            ip: Some("10.44.0.2".parse().unwrap()),
            ..Default::default()
        };
        let failed = PodStatus {
            phase: PodPhase::Failed,
            ip: Some("10.44.0.2".parse().unwrap()),
            ..Default::default()
        };
        let old = pod(&[("app", "x")], Some(running.clone()));
        let new = pod(&[("app", "x")], Some(failed));
        assert!(pod_network_changed(&new, &old));

        // Pending -> Pending is not a boundary crossing.
        let pending = PodStatus::default();
        let old = pod(&[], Some(pending.clone()));
        let new = pod(&[], Some(pending));
        assert!(!pod_network_changed(&new, &old));
    }

    #[test]
    fn network_diff_fires_on_ip_change_and_status_appearance() {
        let old = pod(&[], None);
        let new = pod(&[], Some(PodStatus::default()));
        assert!(pod_network_changed(&new, &old));

        let with_ip = |ip: &str| {
            pod(
                &[],
                Some(PodStatus {
                    ip: Some(ip.parse().unwrap()),
                    ..Default::default()
                }),
            )
        };
        assert!(pod_network_changed(&with_ip("10.44.0.3"), &with_ip("10.44.0.2")));
        assert!(!pod_network_changed(&with_ip("10.44.0.2"), &with_ip("10.44.0.2")));
    }
}
