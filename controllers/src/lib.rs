mod harness;
mod informer;
mod queue;
pub mod replicaset;

pub use harness::Harness;
pub use informer::{
    Event, Informer, Store, pod_network_event_diff, pod_spec_event_diff, pod_status_event_diff,
    replica_set_event_diff, service_event_diff,
};
pub use queue::EventQueue;
