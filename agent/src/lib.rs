mod agent;
pub mod fake;
mod mediator;
mod runtime;

pub use agent::{Agent, AgentConfig, StatusBatch, compute_phase, spawn};
pub use mediator::{PodActions, RuntimeMediator, compute_pod_actions};
pub use runtime::{
    ContainerEngine, ContainerStatus, OverlayNetwork, PodRuntimeStatus, RuntimeError,
    SandboxState, SandboxStatus,
};
