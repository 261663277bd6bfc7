//! Contract for the host packet-filter library, shaped after the subset of
//! the iptables surface the programmer needs, plus an in-process table for
//! tests and the dev daemon.

use parking_lot::Mutex;
use std::collections::HashMap;

pub const NAT_TABLE: &str = "nat";
pub const SERVICE_CHAIN: &str = "SERVICE";
pub const PREROUTING_CHAIN: &str = "PREROUTING";
pub const OUTPUT_CHAIN: &str = "OUTPUT";

#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error("no chain {1} in table {0}")]
    NoChain(String, String),

    #[error("chain {1} already exists in table {0}")]
    ChainExists(String, String),

    #[error("packet filter: {0}")]
    Other(String),
}

/// The shared host packet-filter table. Implementations are process-external
/// state; the programmer keeps a critical section around every mutation
/// sequence.
pub trait PacketFilter: Send + Sync + 'static {
    fn chain_exists(&self, table: &str, chain: &str) -> Result<bool, FilterError>;

    fn new_chain(&self, table: &str, chain: &str) -> Result<(), FilterError>;

    /// Flush a chain's rules and remove it.
    fn clear_and_delete_chain(&self, table: &str, chain: &str) -> Result<(), FilterError>;

    fn append(&self, table: &str, chain: &str, rule: &[String]) -> Result<(), FilterError>;

    /// 1-based position, as the platform counts rules.
    fn insert(&self, table: &str, chain: &str, pos: usize, rule: &[String])
    -> Result<(), FilterError>;

    fn delete_if_exists(&self, table: &str, chain: &str, rule: &[String])
    -> Result<(), FilterError>;

    fn exists(&self, table: &str, chain: &str, rule: &[String]) -> Result<bool, FilterError>;
}

type Chains = HashMap<String, Vec<Vec<String>>>;

/// In-process `PacketFilter` with built-in top-level chains, used by the
/// test suites and the dev daemon.
#[derive(Default)]
pub struct MemoryFilter {
    tables: Mutex<HashMap<String, Chains>>,
}

impl MemoryFilter {
    pub fn new() -> Self {
        let filter = Self::default();
        {
            let mut tables = filter.tables.lock();
            let nat = tables.entry(NAT_TABLE.to_string()).or_default();
            nat.insert(PREROUTING_CHAIN.to_string(), Vec::new());
            nat.insert(OUTPUT_CHAIN.to_string(), Vec::new());
        }
        filter
    }

    pub fn chains(&self, table: &str) -> Vec<String> {
        let tables = self.tables.lock();
        let mut names: Vec<String> = tables
            .get(table)
            .map(|chains| chains.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    pub fn rules(&self, table: &str, chain: &str) -> Vec<Vec<String>> {
        let tables = self.tables.lock();
        tables
            .get(table)
            .and_then(|chains| chains.get(chain))
            .cloned()
            .unwrap_or_default()
    }
}

impl PacketFilter for MemoryFilter {
    fn chain_exists(&self, table: &str, chain: &str) -> Result<bool, FilterError> {
        let tables = self.tables.lock();
        Ok(tables
            .get(table)
            .is_some_and(|chains| chains.contains_key(chain)))
    }

    fn new_chain(&self, table: &str, chain: &str) -> Result<(), FilterError> {
        let mut tables = self.tables.lock();
        let chains = tables.entry(table.to_string()).or_default();
        if chains.contains_key(chain) {
            return Err(FilterError::ChainExists(table.into(), chain.into()));
        }
        chains.insert(chain.to_string(), Vec::new());
        Ok(())
    }

    fn clear_and_delete_chain(&self, table: &str, chain: &str) -> Result<(), FilterError> {
        let mut tables = self.tables.lock();
        let chains = tables
            .get_mut(table)
            .ok_or_else(|| FilterError::NoChain(table.into(), chain.into()))?;
        chains
            .remove(chain)
            .ok_or_else(|| FilterError::NoChain(table.into(), chain.into()))?;
        Ok(())
    }

    fn append(&self, table: &str, chain: &str, rule: &[String]) -> Result<(), FilterError> {
        let mut tables = self.tables.lock();
        let rules = tables
            .get_mut(table)
            .and_then(|chains| chains.get_mut(chain))
            .ok_or_else(|| FilterError::NoChain(table.into(), chain.into()))?;
        rules.push(rule.to_vec());
        Ok(())
    }

    fn insert(
        &self,
        table: &str,
        chain: &str,
        pos: usize,
        rule: &[String],
    ) -> Result<(), FilterError> {
        let mut tables = self.tables.lock();
        let rules = tables
            .get_mut(table)
            .and_then(|chains| chains.get_mut(chain))
            .ok_or_else(|| FilterError::NoChain(table.into(), chain.into()))?;
        let idx = pos.saturating_sub(1).min(rules.len());
        rules.insert(idx, rule.to_vec());
        Ok(())
    }

    fn delete_if_exists(
        &self,
        table: &str,
        chain: &str,
        rule: &[String],
    ) -> Result<(), FilterError> {
        let mut tables = self.tables.lock();
        if let Some(rules) = tables.get_mut(table).and_then(|chains| chains.get_mut(chain))
            && let Some(idx) = rules.iter().position(|r| r == rule)
        {
            rules.remove(idx);
        }
        Ok(())
    }

    fn exists(&self, table: &str, chain: &str, rule: &[String]) -> Result<bool, FilterError> {
        let tables = self.tables.lock();
        Ok(tables
            .get(table)
            .and_then(|chains| chains.get(chain))
            .is_some_and(|rules| rules.iter().any(|r| r == rule)))
    }
}
