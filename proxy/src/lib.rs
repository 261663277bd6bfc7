pub mod chains;
mod filter;
mod programmer;

pub use filter::{
    FilterError, MemoryFilter, NAT_TABLE, OUTPUT_CHAIN, PREROUTING_CHAIN, PacketFilter,
    SERVICE_CHAIN,
};
pub use programmer::{ProgramError, ProxyConfig, ServiceProgrammer, spawn};
